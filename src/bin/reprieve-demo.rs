use clap::Parser;
use reprieve::{Config, Coordinator, OnHandled};
use std::path::PathBuf;
use std::time::Duration;

/// Synthetic training loop demonstrating preemption handling: resumes a
/// step counter from the checkpoint file, does fake work, and checkpoints
/// when the scheduler preempts the job.
#[derive(Parser, Debug)]
#[command(name = "reprieve-demo", version, about)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "reprieve.toml")]
    config: PathBuf,

    /// Signal number to intercept (overrides the config file)
    #[arg(short, long)]
    signal: Option<i32>,

    /// Milliseconds of fake work per step
    #[arg(long, default_value_t = 500)]
    step_ms: u64,

    /// Stop after this many steps even without preemption
    #[arg(long)]
    max_steps: Option<u64>,

    /// Block for the scheduler's kill instead of exiting after the
    /// checkpoint (for requeue-on-kill scheduler policies)
    #[arg(long)]
    stay: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config);
    if let Some(signal) = cli.signal {
        config.signal = signal;
    }
    if !reprieve::logging::init(&config)? {
        tracing_subscriber::fmt().with_target(false).init();
    }

    tracing::info!(
        signal = config.signal,
        delay_minutes = config.delay_minutes,
        "reprieve-demo starting"
    );

    let mut coordinator = Coordinator::from_config(config)?;
    let checkpoint = coordinator.checkpoint_fn().to_path_buf();

    // Resume the step counter if a previous run checkpointed.
    let mut step: u64 = std::fs::read_to_string(&checkpoint)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);
    if step > 0 {
        tracing::info!(step, checkpoint = %checkpoint.display(), "resumed from checkpoint");
    }

    let mode = if cli.stay {
        OnHandled::AwaitKill
    } else {
        OnHandled::ReturnToCaller
    };

    loop {
        // One unit of fake work.
        std::thread::sleep(Duration::from_millis(cli.step_ms));
        step += 1;
        if step % 10 == 0 {
            tracing::info!(step, "training");
        }

        let preempted = coordinator.check(
            || {
                std::fs::write(&checkpoint, step.to_string())?;
                Ok(())
            },
            mode,
        )?;
        if preempted {
            tracing::info!(step, "preemption handled, exiting");
            break;
        }

        if cli.max_steps.is_some_and(|max| step >= max) {
            tracing::info!(step, "reached max steps");
            break;
        }
    }

    Ok(())
}
