/// Grace-window gating.
///
/// After a preemption signal is caught, the job keeps running until the
/// configured delay has elapsed, measured from the *original* delivery
/// instant. Polling frequency never moves the window.
use std::time::Duration;

/// Whether enough time has passed since the preemption instant to proceed
/// with checkpoint handling.
///
/// `None` means no signal has been delivered and the answer is always false.
/// Otherwise true exactly when `now_ms >= preempted_at_ms + delay`.
pub fn eligible(preempted_at_ms: Option<u64>, delay: Duration, now_ms: u64) -> bool {
    match preempted_at_ms {
        None => false,
        Some(at) => {
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            now_ms >= at.saturating_add(delay_ms)
        }
    }
}
