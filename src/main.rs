//! Orca CLI - schedules shell-based integration tests onto microVM workers.
//!
//! This is the binary entry point. See the `orca` library for the
//! controller, agent, and client implementations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use orca::client::commands as client_commands;
use orca::client::{self, RunOptions};
use orca::discover::SkipMode;
use orca::Config;

#[derive(Parser)]
#[command(name = "orca")]
#[command(version)]
#[command(about = "Test orchestrator: schedules shell tests onto microVM workers")]
struct Cli {
    /// Raise logging to trace level.
    #[arg(long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller (worker pool, scheduler, control socket)
    Server {
        /// Detach-friendly mode: log to a file instead of stderr
        #[arg(long)]
        daemon: bool,
        /// Pool sizing: warm[:max]
        #[arg(short = 'j', value_name = "WARM[:MAX]")]
        workers: Option<String>,
        /// Boot guests with normally-skipped tests enabled
        #[arg(long)]
        run_skipped: bool,
    },
    /// Discover and run tests
    Test {
        /// Pool sizing for an auto-started controller: warm[:max]
        #[arg(short = 'j', value_name = "WARM[:MAX]")]
        workers: Option<String>,
        /// Only run tests whose name matches this regex
        #[arg(long, value_name = "RE")]
        filter: Option<String>,
        /// Exclude tests with a pass streak above N
        #[arg(long, value_name = "N")]
        streak_max: Option<u32>,
        /// Include tests marked SKIP
        #[arg(long, conflicts_with = "only_skipped")]
        run_skipped: bool,
        /// Run only tests marked SKIP
        #[arg(long)]
        only_skipped: bool,
        /// Run tests one at a time
        #[arg(long)]
        strict_isolation: bool,
        /// Keep discovery order instead of shuffling
        #[arg(long)]
        no_shuffle: bool,
        /// Pin every test to one worker
        #[arg(long, value_name = "NAME")]
        target: Option<String>,
        /// Test files or directories (default: configured test dir)
        paths: Vec<PathBuf>,
    },
    /// Show pool status of the running controller
    Status,
    /// Open an interactive shell inside a worker
    Shell {
        /// Worker to attach to
        #[arg(long, value_name = "ID")]
        vmid: Option<String>,
    },
    /// Run a one-off command inside a worker
    Exec {
        /// Worker to run on
        #[arg(long, value_name = "ID")]
        vmid: Option<String>,
        /// Command and arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Stop the running controller
    Stop,
    /// Show execution history ("history [N]" or "history detail <i>")
    History {
        /// Either a count, or "detail" followed by an index
        args: Vec<String>,
    },
    /// In-guest agent (started by the guest boot process)
    #[command(hide = true)]
    Agent {
        /// Control port: socket or character device path
        #[arg(long)]
        port: Option<PathBuf>,
    },
}

/// Configure logging before anything else runs.
///
/// The daemonized server logs to `<build>/orca-server.log` so client
/// terminals stay clean; everything else logs to stderr. `--trace` wins
/// over the defaults, `RUST_LOG` wins over everything.
fn init_logging(config: &Config, daemon_log: bool, trace: bool, default_level: &str) {
    let level = if trace { "trace" } else { default_level };
    let env = env_logger::Env::default().default_filter_or(level);
    let mut builder = env_logger::Builder::from_env(env);
    builder.format_timestamp_millis();
    if daemon_log {
        let path = config.server_log_path();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match std::fs::File::create(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Warning: cannot open {}: {e}", path.display()),
        }
    }
    builder.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load()?;

    let exit_code = match cli.command {
        Commands::Server {
            daemon,
            workers,
            run_skipped,
        } => {
            init_logging(&config, daemon, cli.trace, "info");
            if let Some(spec) = workers {
                config.apply_pool_sizes(&spec)?;
            }
            config.run_skipped = run_skipped;
            orca::server::run(config, Arc::new(orca::vm::qemu::QemuHypervisor)).await?;
            0
        }
        Commands::Test {
            workers,
            filter,
            streak_max,
            run_skipped,
            only_skipped,
            strict_isolation,
            no_shuffle,
            target,
            paths,
        } => {
            init_logging(&config, false, cli.trace, "warn");
            if let Some(spec) = workers {
                config.apply_pool_sizes(&spec)?;
            }
            let skip_mode = if only_skipped {
                SkipMode::Only
            } else if run_skipped {
                SkipMode::Include
            } else {
                SkipMode::Exclude
            };
            let opts = RunOptions {
                paths,
                filter,
                streak_max,
                skip_mode,
                no_shuffle,
                target,
                strict_isolation,
            };
            client::run_tests(&config, opts).await?
        }
        Commands::Status => {
            init_logging(&config, false, cli.trace, "warn");
            client_commands::show_status(&config).await?
        }
        Commands::Shell { vmid } => {
            init_logging(&config, false, cli.trace, "warn");
            client_commands::run_attached(&config, Vec::new(), true, vmid).await?
        }
        Commands::Exec { vmid, command } => {
            init_logging(&config, false, cli.trace, "warn");
            client_commands::run_attached(&config, command, false, vmid).await?
        }
        Commands::Stop => {
            init_logging(&config, false, cli.trace, "warn");
            client_commands::stop_server(&config).await?
        }
        Commands::History { args } => {
            init_logging(&config, false, cli.trace, "warn");
            match args.first().map(String::as_str) {
                Some("detail") => {
                    let index: usize = args
                        .get(1)
                        .ok_or_else(|| anyhow::anyhow!("usage: orca history detail <i>"))?
                        .parse()?;
                    client_commands::show_history_detail(&config, index)?
                }
                Some(n) => {
                    let limit: usize = n.parse().map_err(|_| {
                        anyhow::anyhow!("usage: orca history [N | detail <i>]")
                    })?;
                    client_commands::show_history(&config, limit)?
                }
                None => client_commands::show_history(&config, 20)?,
            }
        }
        Commands::Agent { port } => {
            init_logging(&config, false, cli.trace, "info");
            orca::agent::run(port).await?;
            0
        }
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
