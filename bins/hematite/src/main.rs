use ferrite_cache::MarketState;
use hematite_config::HematiteConfig;
use hematite_engine::HematiteEngine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

static STOP_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_signal(_signal: libc::c_int) {
    if let Some(flag) = STOP_FLAG.get() {
        flag.store(false, Ordering::SeqCst);
    }
}

/// Periodic feed summary: the concurrent cache/histogram reader the data
/// plane is built for.
fn spawn_reporter(
    cache: Arc<ferrite_cache::SymbolCache>,
    latency: Arc<ferrite_latency::LatencyHistogram>,
    running: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut ids = [0u16; 5];
        let mut states = [MarketState::default(); 5];
        while running.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_secs(1));

            cache.top_by_activity(&mut ids, &mut states);
            for (id, state) in ids.iter().zip(states.iter()) {
                if state.update_count == 0 {
                    continue;
                }
                info!(
                    symbol = *id,
                    bid = state.best_bid,
                    ask = state.best_ask,
                    last = state.last_px,
                    updates = state.update_count,
                    change_pct = %format!("{:+.2}", state.change_pct()),
                    "top symbol"
                );
            }

            let stats = latency.stats();
            if stats.sample_count > 0 {
                info!(
                    samples = stats.sample_count,
                    min_ns = stats.min,
                    p50_ns = stats.p50,
                    p99_ns = stats.p99,
                    max_ns = stats.max,
                    "latency"
                );
            }
        }
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => HematiteConfig::load(path)?,
        None => HematiteConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(host = %config.host, port = config.port, "hematite starting");

    let latency_csv = config.latency_csv.clone();
    let mut engine = HematiteEngine::connect(config)?;

    let _ = STOP_FLAG.set(engine.stop_handle());
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }

    let reporter = spawn_reporter(engine.cache(), engine.latency(), engine.stop_handle());
    let outcome = engine.run();

    engine.stop_handle().store(false, Ordering::SeqCst);
    let _ = reporter.join();

    let stats = engine.stats();
    let latency = engine.latency().stats();
    info!(
        frames = stats.frames,
        trades = stats.trades,
        quotes = stats.quotes,
        gaps = stats.gaps,
        checksum_errors = stats.checksum_errors,
        bytes = engine.bytes_received(),
        "final statistics"
    );
    info!(
        min_ns = latency.min,
        p50_ns = latency.p50,
        p99_ns = latency.p99,
        max_ns = latency.max,
        "final latency"
    );

    if let Some(path) = latency_csv {
        engine.latency().export_csv(&path)?;
        info!(path = %path, "latency histogram exported");
    }

    outcome?;
    Ok(())
}
