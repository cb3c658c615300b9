/// Preemption signal interception.
///
/// The OS handler does the absolute minimum: record the wall-clock instant
/// of the first delivery into a single atomic. Grace gating, notification,
/// and the checkpoint handler all run later on the caller's polling thread,
/// never in signal context.
use signal_hook::SigId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as millis since the Unix epoch.
///
/// Returns at least 1 — `PreemptState` reserves 0 for "not preempted",
/// and a clock reading before the epoch clamps rather than aliasing it.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_millis() as u64).max(1))
        .unwrap_or(1)
}

/// State shared between the OS signal handler and the coordinator.
///
/// A single atomic holds both the preemption flag and its timestamp:
/// 0 means no signal has been delivered, any other value is the millis
/// timestamp of the first delivery. One word means the handler cannot
/// expose a half-written flag/timestamp pair to the polling thread.
#[derive(Debug, Default)]
pub struct PreemptState {
    preempted_at_ms: AtomicU64,
}

impl PreemptState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the preemption handler for `signal`.
    ///
    /// Returns the shared state and the hook id; the hook stays installed
    /// until [`signal_hook::low_level::unregister`] is called with the id
    /// (the coordinator does this on drop, so coordinators in tests do not
    /// leak handlers into each other).
    pub fn install(signal: i32) -> Result<(Arc<Self>, SigId), SignalError> {
        let state = Self::new();
        let hook = Arc::clone(&state);
        // Safety: the handler performs one atomic compare-exchange and one
        // clock read, both async-signal-safe. No allocation, no locks,
        // no I/O, no logging.
        let id = unsafe {
            signal_hook::low_level::register(signal, move || hook.mark_preempted(now_ms()))
        }
        .map_err(|source| SignalError::Register { signal, source })?;
        Ok((state, id))
    }

    /// Record a preemption at `at_ms`. The first delivery wins; re-delivery
    /// while already preempted leaves the original timestamp untouched.
    pub(crate) fn mark_preempted(&self, at_ms: u64) {
        let _ = self.preempted_at_ms.compare_exchange(
            0,
            at_ms.max(1),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// The instant of the first signal delivery, if one has occurred.
    pub fn preempted_at_ms(&self) -> Option<u64> {
        match self.preempted_at_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub fn is_preempted(&self) -> bool {
        self.preempted_at_ms().is_some()
    }

    /// Clear the preemption event so a later delivery is recorded afresh.
    pub(crate) fn clear(&self) {
        self.preempted_at_ms.store(0, Ordering::SeqCst);
    }
}

/// Errors from installing the signal hook.
#[derive(Debug)]
pub enum SignalError {
    /// The OS rejected the handler registration (bad or reserved signal).
    Register { signal: i32, source: std::io::Error },
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalError::Register { signal, source } => {
                write!(f, "failed to register handler for signal {}: {}", signal, source)
            }
        }
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignalError::Register { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use signal_hook::consts::SIGUSR1;

    #[test]
    fn test_initial_state_not_preempted() {
        let state = PreemptState::new();
        assert!(!state.is_preempted());
        assert_eq!(state.preempted_at_ms(), None);
    }

    #[test]
    fn test_first_delivery_wins_timestamp() {
        let state = PreemptState::new();
        state.mark_preempted(1_000);
        state.mark_preempted(9_000);
        assert_eq!(state.preempted_at_ms(), Some(1_000));
    }

    #[test]
    fn test_clear_rearms_timestamp() {
        let state = PreemptState::new();
        state.mark_preempted(1_000);
        state.clear();
        assert!(!state.is_preempted());
        state.mark_preempted(2_000);
        assert_eq!(state.preempted_at_ms(), Some(2_000));
    }

    #[test]
    fn test_zero_timestamp_never_aliases_unpreempted() {
        let state = PreemptState::new();
        // A (hypothetical) epoch-instant delivery must still register.
        state.mark_preempted(0);
        assert!(state.is_preempted());
    }

    #[test]
    fn test_now_ms_is_nonzero() {
        assert!(now_ms() > 0);
    }

    #[test]
    #[serial]
    fn test_install_records_real_signal() {
        let (state, id) = PreemptState::install(SIGUSR1).unwrap();
        assert!(!state.is_preempted());

        signal_hook::low_level::raise(SIGUSR1).unwrap();
        assert!(state.is_preempted());
        let first = state.preempted_at_ms().unwrap();

        // Re-delivery keeps the original timestamp.
        signal_hook::low_level::raise(SIGUSR1).unwrap();
        assert_eq!(state.preempted_at_ms(), Some(first));

        signal_hook::low_level::unregister(id);
    }

    #[test]
    #[serial]
    fn test_unregistered_hook_ignores_signal() {
        let (state, id) = PreemptState::install(SIGUSR1).unwrap();
        signal_hook::low_level::unregister(id);
        signal_hook::low_level::raise(SIGUSR1).unwrap();
        assert!(!state.is_preempted());
    }
}
