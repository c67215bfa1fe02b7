//! fast-reboot / warm-reboot / fastfast-boot entry point.
//!
//! The mode defaults from the name the binary is invoked as, so the same
//! executable is installed under all three command names.

use anyhow::Context;
use clap::Parser;
use futures::stream::{self, Stream, StreamExt};
use sonic_fast_reboot::system::{
    FastRebootDumper, Kexec, LinuxHost, SonicInstallerImages, SwssOrchAgent,
    SyncdShutdownRequester, SystemdRuntime,
};
use sonic_fast_reboot::{
    Collaborators, DEFAULT_CONFIG_PATH, RebootController, RebootExitCode, RebootMode,
    RebootOptions, RedisStateStore, load_config,
};
use std::path::PathBuf;
use std::pin::pin;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Reboot the control plane while preserving forwarding state
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Reboot mode (cold, fast, warm, fastfast); defaults from the command name
    #[arg(short = 't', long = "type")]
    mode: Option<RebootMode>,

    /// Verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Continue past non-critical failures
    #[arg(short = 'f', long)]
    force: bool,

    /// Reboot with a full power cycle instead of kexec
    #[arg(short = 'r', long)]
    power_cycle: bool,

    /// External notification target to disable during the reboot (repeatable)
    #[arg(short = 'n', long = "notify")]
    notification_targets: Vec<String>,

    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Check preconditions and print the plan without rebooting
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let mode = args.mode.unwrap_or_else(|| {
        let program = std::env::args().next().unwrap_or_default();
        RebootMode::from_program_name(&program)
    });

    match run(mode, args).await {
        Ok(code) => code.into(),
        Err(e) => {
            error!(error = %format!("{:#}", e), "{} failed to start", mode);
            RebootExitCode::Failure.into()
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();
}

async fn run(mode: RebootMode, args: Args) -> anyhow::Result<RebootExitCode> {
    let config = load_config(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let state_db = RedisStateStore::state_db(&config.database);
    state_db.connect().await.context("connecting to STATE_DB")?;
    let asic_db = RedisStateStore::asic_db(&config.database, config.snapshot.dump_path.clone());
    asic_db.connect().await.context("connecting to ASIC_DB")?;

    let collaborators = Collaborators {
        runtime: Arc::new(SystemdRuntime),
        orchagent: Arc::new(SwssOrchAgent::default()),
        syncd: Arc::new(SyncdShutdownRequester),
        kernel: Arc::new(Kexec),
        images: Arc::new(SonicInstallerImages::new(config.paths.image_volume.clone())),
        dumper: Arc::new(FastRebootDumper),
        host: Arc::new(LinuxHost::default()),
        state_db: Arc::new(state_db),
        asic_db: Arc::new(asic_db),
    };

    let options = RebootOptions {
        force: args.force,
        power_cycle: args.power_cycle,
        dry_run: args.dry_run,
        notification_targets: (!args.notification_targets.is_empty())
            .then_some(args.notification_targets),
    };

    let cancel = CancellationToken::new();
    spawn_signal_watcher(cancel.clone())?;

    info!(mode = %mode, force = options.force, dry_run = options.dry_run, "Starting {}", mode);
    let controller = RebootController::new(collaborators, config, cancel);
    let code = controller.execute(mode, &options).await;
    info!(exit_code = code.code(), "{}", code.description());
    Ok(code)
}

/// Cancels the attempt on SIGTERM or SIGINT; recovery runs before exit.
/// A second signal exits at once without waiting for recovery.
fn spawn_signal_watcher(cancel: CancellationToken) -> anyhow::Result<()> {
    let sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let sigterm = stream::unfold(sigterm, |mut s| async move { s.recv().await.map(|()| ("SIGTERM", s)) });
    let sigint = stream::unfold(sigint, |mut s| async move { s.recv().await.map(|()| ("SIGINT", s)) });
    tokio::spawn(async move {
        if watch_signals(stream::select(sigterm, sigint), cancel).await {
            std::process::exit(i32::from(RebootExitCode::Failure.code()));
        }
    });
    Ok(())
}

/// Cancels `cancel` on the first signal. Returns true once a second one
/// arrives, false if the stream ends first.
async fn watch_signals<S>(signals: S, cancel: CancellationToken) -> bool
where
    S: Stream<Item = &'static str>,
{
    let mut signals = pin!(signals);
    let Some(name) = signals.next().await else {
        return false;
    };
    warn!(signal = name, "Received {}, aborting reboot", name);
    cancel.cancel();

    match signals.next().await {
        Some(name) => {
            error!(signal = name, "Received {} again, exiting without recovery", name);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_signal_cancels() {
        let cancel = CancellationToken::new();
        let force_exit = watch_signals(stream::iter(["SIGTERM"]), cancel.clone()).await;
        assert!(cancel.is_cancelled());
        assert!(!force_exit);
    }

    #[tokio::test]
    async fn test_second_signal_forces_exit() {
        let cancel = CancellationToken::new();
        let force_exit = watch_signals(stream::iter(["SIGINT", "SIGTERM"]), cancel.clone()).await;
        assert!(cancel.is_cancelled());
        assert!(force_exit);
    }

    #[tokio::test]
    async fn test_no_signal_leaves_attempt_running() {
        let cancel = CancellationToken::new();
        assert!(!watch_signals(stream::empty(), cancel.clone()).await);
        assert!(!cancel.is_cancelled());
    }
}
