//! Drift-compensated sleeping for the run's replay loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Longest uninterrupted sleep; bounds how late a stop request is noticed.
const SLICE: Duration = Duration::from_millis(50);

/// Time left until the next multiple of `interval` counted from an epoch
/// `elapsed` ago.
///
/// Sleeping this long instead of a flat `interval` absorbs the time spent
/// doing work between sleeps, so error does not accumulate across steps.
pub fn until_next_tick(interval: Duration, elapsed: Duration) -> Duration {
    let interval_ns = interval.as_nanos();
    if interval_ns == 0 {
        return Duration::ZERO;
    }
    let phase = elapsed.as_nanos() % interval_ns;
    interval - Duration::from_nanos(phase as u64)
}

/// Sleep for `duration`, waking early if `stop` is raised.
///
/// Returns `false` when the sleep was cut short by `stop`.
pub fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(SLICE));
    }
}
