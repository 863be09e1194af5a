//! sshtun orchestrator binary.
//!
//! Loads the tunnel configuration, wires SIGINT/SIGTERM into a
//! cancellation token and runs every enabled tunnel under the
//! supervisor. Installed setuid root, it drops to the calling user at
//! startup; the engine re-escalates around device configuration only.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use nix::unistd::{geteuid, getuid, seteuid};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sshtun_core::constants::DEFAULT_CONFIG_FILE;
use sshtun_core::{init_logging, LogFormat, Tunnels};

#[derive(Parser)]
#[command(name = "sshtun", version, about = "Point-to-point layer-3 VPN tunnels over SSH")]
struct Cli {
    /// Configuration file as JSON.
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    /// Increase verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormatArg::Text)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Open all enabled tunnels and keep them up until interrupted.
    Run,
    /// Write an example configuration (keeping an existing one intact).
    Init,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> LogFormat {
        match value {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(
        2 + cli.verbose,
        cli.log_file.as_deref(),
        cli.log_format.into(),
    ) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    // A setuid-root install starts with euid 0: run as the calling user
    // and let the privilege gate escalate per critical section.
    let (uid, euid) = (getuid().as_raw(), geteuid().as_raw());
    if uid != euid {
        if let Err(e) = seteuid(nix::unistd::Uid::from_raw(uid)) {
            error!(error = %e, uid, euid, "Unable to set effective user ID to calling user");
            return ExitCode::FAILURE;
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "sshtun starting");

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "Failed to create tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(&cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "sshtun failed");
            eprintln!("sshtun: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> sshtun_core::Result<()> {
    match cli.command {
        Some(Command::Init) => {
            let config = Tunnels::load_and_save(&cli.config)?;
            info!(
                file = %cli.config,
                tunnels = config.total(),
                "Configuration written"
            );
            Ok(())
        }
        Some(Command::Run) | None => {
            let config = Tunnels::load(&cli.config)?;
            info!(
                file = %cli.config,
                total = config.total(),
                enabled = config.enabled(),
                "Configuration loaded"
            );

            let cancel = CancellationToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut sigint =
                        signal(SignalKind::interrupt()).expect("SIGINT handler installation");
                    let mut sigterm =
                        signal(SignalKind::terminate()).expect("SIGTERM handler installation");
                    tokio::select! {
                        _ = sigint.recv() => info!("Caught SIGINT, closing tunnels"),
                        _ = sigterm.recv() => info!("Caught SIGTERM, closing tunnels"),
                    }
                    cancel.cancel();
                });
            }

            config.open_all(cancel).await
        }
    }
}
