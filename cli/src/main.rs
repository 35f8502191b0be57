//! fleetsched: the command-line entry point for the fleet scheduler.
//!
//! # Usage
//!
//! ```text
//! fleetsched --config /etc/fleetsched.yaml init-db
//! fleetsched --config /etc/fleetsched.yaml run --recover-hosts
//! fleetsched probe /srv/results/42-alice/group0
//! ```

use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fleetsched_core::config::SchedulerConfig;
use fleetsched_core::daemon::{Daemon, DaemonHandle};
use fleetsched_core::lock::acquire_lock;
use fleetsched_core::monitor::pidfile;
use fleetsched_core::runtime::Runtime;
use fleetsched_core::store::Store;
use fleetsched_core::{Result, SchedulerError};

const CONFIG_ENV: &str = "FLEETSCHED_CONFIG";


#[derive(Debug, Parser)]
#[command(name = "fleetsched", version, about = "Schedules test jobs onto a fleet of machines")]
struct Cli {
    /// YAML config file. Falls back to $FLEETSCHED_CONFIG, then defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Recover state and run the scheduler loop until signalled.
    Run {
        /// Re-verify hosts left in Repair Failed.
        #[arg(long)]
        recover_hosts: bool,
        /// Run a single tick after recovery and exit.
        #[arg(long)]
        once: bool,
    },
    /// Create the scheduler tables in the configured database.
    InitDb,
    /// Print a results directory's pidfile reading as JSON.
    Probe {
        results_dir: PathBuf,
    },
}


fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = dispatch(cli) {
        error!(error = %e, "fleetsched failed");
        eprintln!("fleetsched: {}", e);
        process::exit(1);
    }
}


fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Probe { results_dir } => probe(&results_dir),
        Commands::InitDb => {
            let config = load_config(cli.config)?;
            let mut store = Store::open(&config.database, config.store_retry.clone())?;
            store.initialize_schema()?;
            info!(database = %config.database.display(), "schema initialized");
            Ok(())
        }
        Commands::Run { recover_hosts, once } => {
            let mut config = load_config(cli.config)?;
            config.recover_hosts |= recover_hosts;
            run(config, once)
        }
    }
}


fn resolve_config_path(flag: Option<PathBuf>) -> Option<PathBuf> {
    flag.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
}

fn load_config(flag: Option<PathBuf>) -> Result<SchedulerConfig> {
    match resolve_config_path(flag) {
        Some(path) => SchedulerConfig::load(&path),
        None => Ok(SchedulerConfig::default()),
    }
}


fn probe(results_dir: &Path) -> Result<()> {
    let state = pidfile::read(results_dir)
        .map_err(|e| SchedulerError::Invariant(format!("{}: {}", results_dir.display(), e)))?;
    let json = serde_json::to_string_pretty(&state)
        .map_err(|e| SchedulerError::Invariant(e.to_string()))?;
    println!("{}", json);
    Ok(())
}


fn run(config: SchedulerConfig, once: bool) -> Result<()> {
    let _lock = acquire_lock(&config.lock_path())?;
    let rt = Runtime::from_config(config)?;
    let mut daemon = Daemon::new(rt);
    daemon.initialize()?;

    if once {
        daemon.run_once()?;
        daemon.runtime_mut().mail.flush();
        return Ok(());
    }

    install_signal_handlers();
    spawn_signal_watcher(daemon.handle());
    daemon.run()
}


// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_stop_signal(_signum: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler = on_stop_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

/// The handler only flips a flag; this thread turns it into a shutdown
/// event so the loop finishes its current tick first.
fn spawn_signal_watcher(handle: DaemonHandle) {
    std::thread::spawn(move || loop {
        if STOP_REQUESTED.load(Ordering::SeqCst) {
            info!("stop signal received, finishing current tick");
            let _ = handle.shutdown();
            return;
        }
        std::thread::sleep(Duration::from_millis(200));
    });
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from(["fleetsched", "--config", "/etc/f.yaml", "run", "--recover-hosts", "--once"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/f.yaml")));
        match cli.command {
            Commands::Run { recover_hosts, once } => {
                assert!(recover_hosts);
                assert!(once);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn config_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["fleetsched", "init-db", "--config", "x.yaml"]).unwrap();
        assert!(matches!(cli.command, Commands::InitDb));
        assert_eq!(cli.config, Some(PathBuf::from("x.yaml")));
    }

    #[test]
    fn probe_requires_directory() {
        assert!(Cli::try_parse_from(["fleetsched", "probe"]).is_err());
    }

    #[test]
    fn explicit_config_wins_over_env() {
        let path = resolve_config_path(Some(PathBuf::from("/a.yaml")));
        assert_eq!(path, Some(PathBuf::from("/a.yaml")));
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = load_config(Some(PathBuf::from("/nonexistent/fleetsched.yaml"))).unwrap_err();
        assert!(matches!(err, SchedulerError::Config(_)));
    }
}
