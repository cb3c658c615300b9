/// The polled preemption-handling pipeline.
///
/// A job constructs one [`Coordinator`] at startup and polls
/// [`Coordinator::check`] inside its own work loop. The coordinator never
/// runs a loop of its own except in the terminal [`OnHandled::AwaitKill`]
/// state.
use crate::config::Config;
use crate::grace;
use crate::notify::{self, Dispatcher, Mailer, NotifyError};
use crate::signals::{now_ms, PreemptState, SignalError};
use signal_hook::SigId;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// What `check` should do after the checkpoint handler has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnHandled {
    /// Return `true` so the caller breaks its own loop and exits.
    ReturnToCaller,
    /// Block forever so the scheduler's hard kill terminates (and, per
    /// scheduler policy, requeues) the process. `check` never returns.
    AwaitKill,
}

/// Error type for the caller-supplied checkpoint handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Coordinates one process's response to one preemption signal.
pub struct Coordinator {
    state: Arc<PreemptState>,
    config: Config,
    dispatcher: Dispatcher,
    sig_id: Option<SigId>,
    handler_ran: bool,
}

impl Coordinator {
    /// Load configuration from `config_path` (missing file means defaults)
    /// and install interception for the configured signal.
    pub fn new(config_path: impl AsRef<Path>) -> Result<Self, SignalError> {
        Self::from_config(Config::load(config_path.as_ref()))
    }

    /// As [`Coordinator::new`], but intercept `signal` regardless of what
    /// the config file says.
    pub fn with_signal(signal: i32, config_path: impl AsRef<Path>) -> Result<Self, SignalError> {
        let mut config = Config::load(config_path.as_ref());
        config.signal = signal;
        Self::from_config(config)
    }

    /// Install interception for `config.signal` with the production SMTP
    /// dispatcher.
    pub fn from_config(config: Config) -> Result<Self, SignalError> {
        let dispatcher = Dispatcher::from_config(&config);
        Self::build(config, dispatcher, true)
    }

    /// Install interception with a caller-supplied mail transport.
    pub fn with_mailer(config: Config, mailer: Box<dyn Mailer>) -> Result<Self, SignalError> {
        Self::build(config, Dispatcher::with_mailer(mailer), true)
    }

    /// A coordinator with no OS signal hook; preemption is simulated by
    /// writing the shared state directly. Unit-test seam.
    #[cfg(test)]
    pub(crate) fn detached(config: Config, mailer: Box<dyn Mailer>) -> Self {
        Self::build(config, Dispatcher::with_mailer(mailer), false)
            .expect("detached coordinator installs no hook")
    }

    fn build(config: Config, dispatcher: Dispatcher, hook: bool) -> Result<Self, SignalError> {
        let (state, sig_id) = if hook {
            let (state, id) = PreemptState::install(config.signal)?;
            (state, Some(id))
        } else {
            (PreemptState::new(), None)
        };
        Ok(Self {
            state,
            config,
            dispatcher,
            sig_id,
            handler_ran: false,
        })
    }

    /// Poll for preemption and, once the grace window has elapsed, run the
    /// checkpoint pipeline.
    ///
    /// Returns `Ok(false)` while no signal has arrived or while the grace
    /// window is still open (the "caught" notification is dispatched on the
    /// first such poll). Once eligible: notifications fire (each at most
    /// once per event), `handler` runs exactly once per event, and the call
    /// either returns `Ok(true)` or, in [`OnHandled::AwaitKill`] mode,
    /// never returns.
    ///
    /// Handler and notification-transport failures propagate unrecovered;
    /// checkpoint correctness is the caller's responsibility, and a lost
    /// operator notification must not be silent.
    pub fn check<F>(&mut self, handler: F, mode: OnHandled) -> Result<bool, CheckError>
    where
        F: FnOnce() -> Result<(), HandlerError>,
    {
        let preempted_at = self.state.preempted_at_ms();
        if preempted_at.is_none() {
            return Ok(false);
        }

        self.dispatcher
            .notify_caught(&self.config)
            .map_err(|source| CheckError::Notify { source })?;

        if !grace::eligible(preempted_at, self.config.grace_delay(), now_ms()) {
            return Ok(false);
        }

        if !self.handler_ran {
            let job = notify::job_id();
            info!(
                signal = self.config.signal,
                job_id = job.as_deref(),
                "grace window elapsed, invoking checkpoint handler"
            );
            handler().map_err(|source| CheckError::Handler { source })?;
            self.handler_ran = true;
            info!(job_id = job.as_deref(), "checkpoint handler finished");

            self.dispatcher
                .notify_handler_done(&self.config)
                .map_err(|source| CheckError::Notify { source })?;
        }

        match mode {
            OnHandled::ReturnToCaller => Ok(true),
            OnHandled::AwaitKill => {
                // Terminal state: occupy the process until the scheduler's
                // hard kill arrives. Nothing ever unparks this thread, and a
                // spurious wakeup just parks again.
                info!("checkpoint complete, holding process for external kill");
                loop {
                    std::thread::park();
                }
            }
        }
    }

    /// Clear the preemption event: flag, timestamp, and all per-event
    /// notification and handler guards, together. For callers that intend
    /// to keep running after a false-positive signal.
    pub fn reset(&mut self) {
        self.state.clear();
        self.dispatcher.reset();
        self.handler_ran = false;
    }

    /// The configured (or default) checkpoint artifact filename, for the
    /// caller's handler to write to.
    pub fn checkpoint_fn(&self) -> &Path {
        &self.config.checkpoint_fn
    }

    /// Whether the intercepted signal has been delivered.
    pub fn is_preempted(&self) -> bool {
        self.state.is_preempted()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &Arc<PreemptState> {
        &self.state
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(id) = self.sig_id.take() {
            signal_hook::low_level::unregister(id);
        }
    }
}

/// Errors surfaced by [`Coordinator::check`]. Both are fatal to the caller.
#[derive(Debug)]
pub enum CheckError {
    /// A configured notification could not be sent.
    Notify { source: NotifyError },
    /// The caller-supplied checkpoint handler failed.
    Handler { source: HandlerError },
}

impl std::fmt::Display for CheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckError::Notify { source } => {
                write!(f, "preemption notification failed: {}", source)
            }
            CheckError::Handler { source } => {
                write!(f, "checkpoint handler failed: {}", source)
            }
        }
    }
}

impl std::error::Error for CheckError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CheckError::Notify { source } => Some(source),
            CheckError::Handler { source } => Some(source.as_ref()),
        }
    }
}
