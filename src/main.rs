mod configs;
mod process;
mod report;
mod signals;
mod supervisor;

use crate::configs::TumblerConfig;
use crate::process::control::{OsProcessControl, ProcessControl};
use crate::report::{Reporter, StatusLog};
use crate::supervisor::{Exit, StopOrder, Supervisor};
use clap::Parser;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Configuration file (.xml, .yml or .yaml)
    #[arg(
        short,
        long,
        env = "TUMBLER_CONFIG",
        value_name = "FILE",
        conflicts_with = "processes"
    )]
    config: Option<PathBuf>,

    /// Append-only status log
    #[arg(long, env = "TUMBLER_LOG_FILE", value_name = "FILE", default_value = "upper.log")]
    log_file: PathBuf,

    /// Log filter, overridden by TUMBLER_LOG
    #[arg(long, default_value = "info")]
    log: String,

    /// Order in which the group is stopped
    #[arg(long, value_enum, default_value_t = StopOrder::Reverse)]
    stop_order: StopOrder,

    /// How long a process may take to exit before it is killed
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    close_timeout: Duration,

    /// <watch interval> (<command> <start delay> <stop delay>)..., or a config file
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "ARGS")]
    processes: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let filter = EnvFilter::try_from_env("TUMBLER_LOG").unwrap_or_else(|_| EnvFilter::new(&args.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &args.config {
        Some(path) => TumblerConfig::from_file(path),
        None => TumblerConfig::from_args(&args.processes),
    }
    .wrap_err("Failed to read process list")?;
    debug!(?config, "Configuration loaded");

    let reporter: Reporter = Arc::new(StatusLog::open(&args.log_file)?);
    let control: Arc<dyn ProcessControl> = Arc::new(OsProcessControl::new(args.close_timeout));
    let processes: Vec<_> = config
        .processes
        .iter()
        .map(|spec| spec.build(control.clone(), reporter.clone()))
        .collect();
    for process in &processes {
        let restarts: Vec<_> = process.restart_times().collect();
        debug!(
            name = process.display_name(),
            priority = %process.priority(),
            watched = process.is_watched(),
            ?restarts,
            "Process configured"
        );
    }
    let supervisor = Supervisor::new(processes, config.watch_interval, args.stop_order, reporter);

    let (control_sender, control_receiver) = mpsc::unbounded_channel();
    signals::listen(control_sender)?;

    match supervisor.run(control_receiver).await? {
        Exit::Stopped => info!("All processes stopped"),
        Exit::Detached => info!("Detached, processes keep running"),
    }
    Ok(())
}
