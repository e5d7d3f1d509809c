// ant binary entry point
// Moves files whose names match a pattern from FROM directories to TO directories on a schedule.

use anyhow::{anyhow, Context};
use clap::Parser;
use common::config::Settings;
use common::schedule::{parse_interval, RunMode};
use common::scheduler::{Scheduler, SchedulerEngine};
use common::{telemetry, EngineOptions, MoveJob, RoutingTable};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const AFTER_HELP: &str = r#"FROM:
    Directory to watch. Every regular file below it whose name matches
    PATTERN is written to TO and then removed from FROM.
    '$' repeats the previous FROM.

PATTERN:
    Regular expression tested against the file name, e.g. "t[0-9]+.txt".
    '$' repeats the previous PATTERN.

TO:
    Target directory, created when missing. Existing files are overwritten.
    '$' repeats the previous TO.

Keywords replaced in FROM, PATTERN and TO on every run:
    {date}      20060102        {time}      150405
    {year}      2006            {month}     01
    {day}       02              {hour}      15
    {minute}    04              {second}    05
    {yesterday} {day-1} {day-2} relative days

Priority: --cron > --time > --loop > single run.

Examples:
    ant --loop 10 /data/from 't[0-9]+.txt' /data/to
    ant --time 5s /from1 't[0-9]+.txt' /to1 /from2 't[a-z]+.txt' /to2
    ant --cron '*/5 * * * * ?' /from 't[0-9]+.txt' /to1 '$' 't[a-z]+.txt' /to2
    ant '/from/{date}' 't[0-9]+.txt' '/to/{date}'
    ant /from 't[0-9]+.txt' /to1 '$' '$' /to2"#;

#[derive(Debug, Parser)]
#[command(name = "ant", version, about = "ant is a file move tool", after_help = AFTER_HELP)]
struct Cli {
    /// Run n times, pausing between runs
    #[arg(long = "loop", value_name = "N", default_value_t = 0)]
    loop_count: u32,

    /// Run every duration, like '5s' or '1h'
    #[arg(long, value_name = "DURATION", value_parser = parse_time_arg)]
    time: Option<Duration>,

    /// Run on a cron schedule with a seconds field, like '*/5 * * * * ?'
    #[arg(long, value_name = "EXPR")]
    cron: Option<String>,

    /// Directory holding default.toml / local.toml
    #[arg(long, value_name = "DIR", default_value = "config", env = "ANT_CONFIG_DIR")]
    config: PathBuf,

    /// FROM PATTERN TO triples
    #[arg(value_name = "FROM PATTERN TO", allow_hyphen_values = true)]
    routes: Vec<String>,
}

fn parse_time_arg(value: &str) -> Result<Duration, String> {
    parse_interval(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from_path(&cli.config).context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow!(e))
        .context("Invalid configuration")?;
    telemetry::init_logging(&settings.observability)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting ant");

    let table = RoutingTable::from_args(&cli.routes).map_err(|e| {
        error!(error = %e, "Invalid FROM PATTERN TO arguments");
        e
    })?;

    let mode = RunMode::select(
        cli.loop_count,
        settings.scheduler.loop_pause(),
        cli.time,
        cli.cron.as_deref(),
    )
    .map_err(|e| {
        error!(error = %e, "Invalid schedule");
        e
    })?;

    let job = MoveJob::new(table, EngineOptions::from(&settings.engine));
    let scheduler = Arc::new(SchedulerEngine::new(job, mode));
    info!(mode = ?scheduler.mode(), "Run mode selected");

    let scheduler_for_shutdown = Arc::clone(&scheduler);
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(signal) => info!(signal, "Got signal, stopping after the current run"),
            Err(e) => {
                error!(error = %e, "Failed to listen for shutdown signals");
                return;
            }
        }
        scheduler_for_shutdown.stop().await;
    });

    let runs = scheduler.start().await.context("Scheduler error")?;
    info!(runs, "ant stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "CTRL-C")
}
