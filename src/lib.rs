//! Coordinate a long-running job's graceful response to scheduler
//! preemption.
//!
//! Preemptible cluster jobs (e.g. Slurm partitions with `--requeue`) get a
//! termination signal some time before the scheduler's hard kill. This
//! crate intercepts that signal, grants the job a configured grace window,
//! runs a caller-supplied checkpoint handler exactly once per preemption
//! event, optionally emails an operator at two lifecycle points, and then
//! either hands control back to the caller or holds the process alive until
//! the kill arrives.
//!
//! The caller polls from inside its own work loop:
//!
//! ```no_run
//! use reprieve::{Coordinator, OnHandled};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut coordinator = Coordinator::new("reprieve.toml")?;
//! let checkpoint = coordinator.checkpoint_fn().to_path_buf();
//!
//! loop {
//!     // ... one unit of work (a batch, an epoch) ...
//!
//!     let preempted = coordinator.check(
//!         || {
//!             std::fs::write(&checkpoint, "resumable state")?;
//!             Ok(())
//!         },
//!         OnHandled::ReturnToCaller,
//!     )?;
//!     if preempted {
//!         break; // checkpoint written, exit cleanly
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The signal handler itself only records an atomic flag and timestamp;
//! every richer step (grace gating, notification, the handler) runs on the
//! polling thread.

pub mod config;
pub mod coordinator;
pub mod grace;
pub mod logging;
pub mod notify;
pub mod signals;

pub use config::{Config, EmailTypes, LogLevel};
pub use coordinator::{CheckError, Coordinator, HandlerError, OnHandled};
pub use notify::{Mailer, NotifyError, Outgoing, SmtpMailer, JOB_ID_ENV};
pub use signals::{PreemptState, SignalError};
