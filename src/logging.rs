/// Optional logfile sink, configured from [`Config`].
///
/// No `logfile` key means logging stays disabled, per the config contract;
/// callers that want console output install their own subscriber instead.
use crate::config::Config;
use std::fs::OpenOptions;
use std::sync::Arc;

/// Initialize a global tracing subscriber appending to the configured
/// logfile. Returns `Ok(false)` (and installs nothing) when no logfile is
/// configured.
pub fn init(config: &Config) -> std::io::Result<bool> {
    let Some(path) = &config.logfile else {
        return Ok(false);
    };

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    // try_init: if the caller already installed a subscriber, theirs wins.
    let _ = tracing_subscriber::fmt()
        .with_max_level(config.loglevel.as_tracing())
        .with_ansi(false)
        .with_target(false)
        .with_writer(Arc::new(file))
        .try_init();
    Ok(true)
}
