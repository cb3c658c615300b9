/// Operator notification over SMTP.
///
/// Two lifecycle points can trigger an email: the instant a preemption
/// signal is first noticed by a poll ("caught"), and the completion of the
/// checkpoint handler ("handler done"). Both are optional, and both fire at
/// most once per preemption event. Transport failures are fatal to the
/// caller: silently losing the operator's only warning about an imminent
/// kill is worse than crashing loudly.
use crate::config::Config;
use chrono::Local;
use lettre::{Message, SmtpTransport, Transport};
use tracing::info;

/// Environment variable carrying the scheduler-assigned job id.
pub const JOB_ID_ENV: &str = "SLURM_JOB_ID";

/// The scheduler job id, when running under a scheduler. Absence is normal.
pub(crate) fn job_id() -> Option<String> {
    std::env::var(JOB_ID_ENV).ok()
}

/// A rendered notification, ready for a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub body: String,
}

/// Message transport seam. Production uses [`SmtpMailer`]; tests record.
pub trait Mailer: Send {
    fn send(&self, mail: &Outgoing) -> Result<(), NotifyError>;
}

/// Plain SMTP against the configured relay.
///
/// Cluster-internal relays are typically unauthenticated, so this uses the
/// dangerous (no-TLS) builder the way the scheduler environment expects.
pub struct SmtpMailer {
    server: String,
}

impl SmtpMailer {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
        }
    }
}

impl Mailer for SmtpMailer {
    fn send(&self, mail: &Outgoing) -> Result<(), NotifyError> {
        let from = mail.from.parse().map_err(|source| NotifyError::Address {
            address: mail.from.clone(),
            source,
        })?;
        let to = mail.to.parse().map_err(|source| NotifyError::Address {
            address: mail.to.clone(),
            source,
        })?;
        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(mail.subject.as_str())
            .body(mail.body.clone())
            .map_err(|source| NotifyError::Build { source })?;

        let transport = SmtpTransport::builder_dangerous(&self.server).build();
        transport
            .send(&message)
            .map_err(|source| NotifyError::Transport {
                source: Box::new(source),
            })?;
        Ok(())
    }
}

/// Applies the config gates and per-event idempotency guards around a
/// [`Mailer`].
pub struct Dispatcher {
    mailer: Option<Box<dyn Mailer>>,
    caught_sent: bool,
    done_sent: bool,
}

impl Dispatcher {
    /// Build the production dispatcher: SMTP when both `email_server` and
    /// `email_address` are configured, otherwise a permanent no-op.
    pub fn from_config(config: &Config) -> Self {
        let mailer = if config.email_configured() {
            config
                .email_server
                .as_deref()
                .map(|server| Box::new(SmtpMailer::new(server)) as Box<dyn Mailer>)
        } else {
            None
        };
        Self::new(mailer)
    }

    pub fn with_mailer(mailer: Box<dyn Mailer>) -> Self {
        Self::new(Some(mailer))
    }

    fn new(mailer: Option<Box<dyn Mailer>>) -> Self {
        Self {
            mailer,
            caught_sent: false,
            done_sent: false,
        }
    }

    /// Send the "signal caught" notification, at most once per preemption
    /// event. No-op when unconfigured, gated off, or already sent.
    pub fn notify_caught(&mut self, config: &Config) -> Result<(), NotifyError> {
        if self.caught_sent || !config.email_types.signal_caught {
            return Ok(());
        }
        let (Some(mailer), Some(_)) = (&self.mailer, &config.email_address) else {
            return Ok(());
        };

        let mail = build_caught(config, job_id().as_deref());
        mailer.send(&mail)?;
        self.caught_sent = true;
        info!(to = %mail.to, signal = config.signal, "sent preemption-caught notification");
        Ok(())
    }

    /// Send the "handler done" notification, at most once per preemption
    /// event, symmetrical with [`Dispatcher::notify_caught`].
    pub fn notify_handler_done(&mut self, config: &Config) -> Result<(), NotifyError> {
        if self.done_sent || !config.email_types.checkpoint_handler_done {
            return Ok(());
        }
        let (Some(mailer), Some(_)) = (&self.mailer, &config.email_address) else {
            return Ok(());
        };

        let mail = build_handler_done(config, job_id().as_deref());
        mailer.send(&mail)?;
        self.done_sent = true;
        info!(to = %mail.to, "sent handler-done notification");
        Ok(())
    }

    /// Re-arm both idempotency guards for a fresh preemption event.
    pub fn reset(&mut self) {
        self.caught_sent = false;
        self.done_sent = false;
    }
}

fn job_suffix(job_id: Option<&str>) -> String {
    job_id.map(|id| format!(" (job {id})")).unwrap_or_default()
}

fn job_line(job_id: Option<&str>) -> String {
    job_id
        .map(|id| format!("Scheduler job id: {id}.\n"))
        .unwrap_or_default()
}

pub(crate) fn build_caught(config: &Config, job_id: Option<&str>) -> Outgoing {
    let address = config.email_address.clone().unwrap_or_default();
    Outgoing {
        to: address.clone(),
        from: address,
        subject: format!(
            "[reprieve] preemption signal {} caught{}",
            config.signal,
            job_suffix(job_id)
        ),
        body: format!(
            "Preemption signal {} was caught at {}.\n{}The checkpoint handler will run once \
             the grace window of {} minute(s) has elapsed.\n",
            config.signal,
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            job_line(job_id),
            config.delay_minutes,
        ),
    }
}

pub(crate) fn build_handler_done(config: &Config, job_id: Option<&str>) -> Outgoing {
    let address = config.email_address.clone().unwrap_or_default();
    Outgoing {
        to: address.clone(),
        from: address,
        subject: format!(
            "[reprieve] checkpoint handler finished{}",
            job_suffix(job_id)
        ),
        body: format!(
            "The checkpoint handler for preemption signal {} completed at {}.\n{}",
            config.signal,
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            job_line(job_id),
        ),
    }
}

/// Errors raised while building or sending a notification.
#[derive(Debug)]
pub enum NotifyError {
    /// Recipient or sender address failed to parse.
    Address {
        address: String,
        source: lettre::address::AddressError,
    },
    /// The message could not be assembled.
    Build { source: lettre::error::Error },
    /// Mail server unreachable or rejected the message.
    Transport {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Address { address, source } => {
                write!(f, "invalid notification address {}: {}", address, source)
            }
            NotifyError::Build { source } => {
                write!(f, "failed to build notification message: {}", source)
            }
            NotifyError::Transport { source } => {
                write!(f, "notification transport failed: {}", source)
            }
        }
    }
}

impl std::error::Error for NotifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NotifyError::Address { source, .. } => Some(source),
            NotifyError::Build { source } => Some(source),
            NotifyError::Transport { source } => Some(source.as_ref()),
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every message instead of sending it.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingMailer {
        pub sent: Arc<Mutex<Vec<Outgoing>>>,
    }

    impl RecordingMailer {
        pub fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl Mailer for RecordingMailer {
        fn send(&self, mail: &Outgoing) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(mail.clone());
            Ok(())
        }
    }

    /// Fails every send, simulating an unreachable relay.
    pub(crate) struct FailingMailer;

    impl Mailer for FailingMailer {
        fn send(&self, _mail: &Outgoing) -> Result<(), NotifyError> {
            Err(NotifyError::Transport {
                source: "connection refused".into(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{FailingMailer, RecordingMailer};
    use super::*;

    fn email_config() -> Config {
        let mut config = Config::default();
        config.email_server = Some("smtp.example.edu".into());
        config.email_address = Some("ops@example.edu".into());
        config.email_types.signal_caught = true;
        config.email_types.checkpoint_handler_done = true;
        config
    }

    #[test]
    fn test_caught_message_names_signal_and_job() {
        let mail = build_caught(&email_config(), Some("123456"));
        assert_eq!(mail.to, "ops@example.edu");
        assert_eq!(mail.from, "ops@example.edu");
        assert!(mail.subject.contains("signal 15"));
        assert!(mail.subject.contains("job 123456"));
        assert!(mail.body.contains("Scheduler job id: 123456"));
    }

    #[test]
    fn test_caught_message_omits_absent_job_id() {
        let mail = build_caught(&email_config(), None);
        assert!(!mail.subject.contains("job"));
        assert!(!mail.body.contains("job id"));
    }

    #[test]
    fn test_handler_done_message_names_signal() {
        let mail = build_handler_done(&email_config(), None);
        assert!(mail.subject.contains("checkpoint handler finished"));
        assert!(mail.body.contains("signal 15"));
    }

    #[test]
    fn test_caught_sends_once_per_event() {
        let recorder = RecordingMailer::default();
        let mut dispatcher = Dispatcher::with_mailer(Box::new(recorder.clone()));
        let config = email_config();

        for _ in 0..5 {
            dispatcher.notify_caught(&config).unwrap();
        }
        assert_eq!(recorder.count(), 1);
    }

    #[test]
    fn test_handler_done_sends_once_per_event() {
        let recorder = RecordingMailer::default();
        let mut dispatcher = Dispatcher::with_mailer(Box::new(recorder.clone()));
        let config = email_config();

        dispatcher.notify_handler_done(&config).unwrap();
        dispatcher.notify_handler_done(&config).unwrap();
        assert_eq!(recorder.count(), 1);
    }

    #[test]
    fn test_reset_rearms_both_guards() {
        let recorder = RecordingMailer::default();
        let mut dispatcher = Dispatcher::with_mailer(Box::new(recorder.clone()));
        let config = email_config();

        dispatcher.notify_caught(&config).unwrap();
        dispatcher.notify_handler_done(&config).unwrap();
        dispatcher.reset();
        dispatcher.notify_caught(&config).unwrap();
        dispatcher.notify_handler_done(&config).unwrap();
        assert_eq!(recorder.count(), 4);
    }

    #[test]
    fn test_disabled_flag_suppresses_send() {
        let recorder = RecordingMailer::default();
        let mut dispatcher = Dispatcher::with_mailer(Box::new(recorder.clone()));
        let mut config = email_config();
        config.email_types.signal_caught = false;

        dispatcher.notify_caught(&config).unwrap();
        assert_eq!(recorder.count(), 0);
    }

    #[test]
    fn test_missing_address_suppresses_send() {
        let recorder = RecordingMailer::default();
        let mut dispatcher = Dispatcher::with_mailer(Box::new(recorder.clone()));
        let mut config = email_config();
        config.email_address = None;

        dispatcher.notify_caught(&config).unwrap();
        assert_eq!(recorder.count(), 0);
    }

    #[test]
    fn test_unconfigured_dispatcher_is_permanent_noop() {
        let mut dispatcher = Dispatcher::from_config(&Config::default());
        dispatcher.notify_caught(&Config::default()).unwrap();
        dispatcher
            .notify_handler_done(&Config::default())
            .unwrap();
    }

    #[test]
    fn test_transport_failure_propagates() {
        let mut dispatcher = Dispatcher::with_mailer(Box::new(FailingMailer));
        let config = email_config();

        let err = dispatcher.notify_caught(&config).unwrap_err();
        assert!(matches!(err, NotifyError::Transport { .. }));
        // The guard is not set on failure; a retry poll would attempt again.
        let err = dispatcher.notify_caught(&config).unwrap_err();
        assert!(matches!(err, NotifyError::Transport { .. }));
    }
}
