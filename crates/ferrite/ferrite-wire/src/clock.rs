/// Wall-clock nanoseconds since the Unix epoch.
///
/// Frames carry wall-clock timestamps so the consumer can compute
/// cross-process latency without a shared monotonic base.
#[inline(always)]
pub fn wall_clock_ns() -> u64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(t) => t.as_nanos() as u64,
        Err(_) => 0,
    }
}
