//! connbroker - front-facing TCP connection broker that hands off accepted
//! sockets to a sibling receiver process via SCM_RIGHTS.

use anyhow::Result;
use clap::Parser;
use connbroker::{broker, config::Config};
use mimalloc::MiMalloc;

/// Global allocator: better multi-threaded performance than the system
/// allocator under the connection churn this broker is built for.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// A front-facing TCP connection broker that hands accepted sockets off to
/// a sibling receiver process.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Explicit config file path, overriding the platform config directory.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// TCP port to listen on, overriding config/default.
    #[arg(long)]
    listen_port: Option<u16>,

    /// Path to the receiver executable (direct spawn mode).
    #[arg(long)]
    receiver_path: Option<std::path::PathBuf>,

    /// systemd unit template name (service-manager spawn mode).
    #[arg(long)]
    receiver_unit: Option<String>,

    /// Force service-manager spawn mode on.
    #[arg(long, conflicts_with = "no_systemd")]
    systemd: bool,

    /// Force service-manager spawn mode off (use direct fork/exec).
    #[arg(long)]
    no_systemd: bool,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.listen_port {
        config.listen_port = port;
    }
    if let Some(path) = cli.receiver_path {
        config.receiver_path = Some(path);
    }
    if let Some(unit) = cli.receiver_unit {
        config.receiver_unit = unit;
    }
    if cli.systemd {
        config.systemd_enabled = true;
    }
    if cli.no_systemd {
        config.systemd_enabled = false;
    }
    config.validate()?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        if let Err(e) = broker::run(config).await {
            log::error!("broker exited: {e}");
            std::process::exit(1);
        }
    });

    Ok(())
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}
