use magnetite_config::MagnetiteConfig;
use magnetite_engine::MagnetiteEngine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::info;
use tracing_subscriber::EnvFilter;

static STOP_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_signal(_signal: libc::c_int) {
    if let Some(flag) = STOP_FLAG.get() {
        flag.store(false, Ordering::SeqCst);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => MagnetiteConfig::load(path)?,
        None => MagnetiteConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let mut engine = MagnetiteEngine::bind(&config)?;

    let _ = STOP_FLAG.set(engine.stop_handle());
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }

    engine.run();

    info!(
        messages_sent = engine.messages_sent(),
        bytes_sent = engine.bytes_sent(),
        "shutdown complete"
    );
    Ok(())
}
