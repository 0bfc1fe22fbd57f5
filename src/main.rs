// warren: container runtime daemon

mod cgroup;
mod container;
mod error;
mod launcher;
mod network;
mod runtime;
mod utils;
mod volume;

use clap::{Parser, Subcommand};
use error::RuntimeResult;
use runtime::{Runtime, RuntimeConfig};
use utils::console::ConsoleLogger;
use utils::constants::{DAEMON_OOM_SCORE_ADJ, PIDFILE_PATH, WARREN_BASE_DIR};
use utils::process::{set_oom_score_adj, Pidfile};

/// warren - container runtime daemon
#[derive(Parser, Debug)]
#[clap(author, version, about = "Container runtime daemon with cgroup, netlink and volume management")]
#[clap(propagate_version = true)]
struct WarrenCli {
    #[clap(subcommand)]
    command: Commands,

    /// Suppress non-error output
    #[clap(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the warren daemon
    Daemon {
        /// State directory (database, volumes, logs)
        #[clap(long, default_value = WARREN_BASE_DIR)]
        data_dir: String,

        /// Bridge for container veth pairs
        #[clap(long)]
        bridge: Option<String>,

        /// Pidfile path
        #[clap(long, default_value = PIDFILE_PATH)]
        pidfile: String,
    },
}

fn main() {
    let cli = WarrenCli::parse();
    ConsoleLogger::set_quiet(cli.quiet);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let result = match cli.command {
        Commands::Daemon {
            data_dir,
            bridge,
            pidfile,
        } => run_daemon(data_dir, bridge, pidfile),
    };

    if let Err(e) = result {
        ConsoleLogger::error(&format!("warren: {}", e));
        std::process::exit(1);
    }
}

fn run_daemon(data_dir: String, bridge: Option<String>, pidfile: String) -> RuntimeResult<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(error::RuntimeError::from)?;
    runtime.block_on(daemon_main(data_dir, bridge, pidfile))
}

async fn daemon_main(
    data_dir: String,
    bridge: Option<String>,
    pidfile_path: String,
) -> RuntimeResult<()> {
    // Children of dead fork stages must reparent to us, not to init, so
    // waitpid keeps working on container tasks.
    unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1) };

    if let Err(e) = set_oom_score_adj(DAEMON_OOM_SCORE_ADJ) {
        ConsoleLogger::warning(&format!("Failed to lower daemon OOM score: {}", e));
    }

    let pidfile = Pidfile::new(pidfile_path);
    pidfile.write()?;

    let mut config = RuntimeConfig::at(&data_dir);
    if let Some(bridge) = bridge {
        config.bridge = bridge;
    }
    ConsoleLogger::progress(&format!("Starting warren daemon in {}", data_dir));

    let runtime = Runtime::new(config).await?;
    runtime.restore().await?;
    ConsoleLogger::success("warren daemon is up");

    // The RPC surface plugs in here; until a request arrives the daemon
    // only has to keep its observers alive and wait for shutdown.
    match tokio::signal::ctrl_c().await {
        Ok(()) => ConsoleLogger::info("Shutting down on interrupt"),
        Err(e) => ConsoleLogger::warning(&format!("Signal wait failed: {}", e)),
    }

    pidfile.remove();
    Ok(())
}
