// Scheduler engine implementation
// Invokes the run engine once, a fixed number of times, on an interval or on a cron schedule.

use crate::errors::ScheduleError;
use crate::mover::{MoveJob, RunReport};
use crate::schedule::{delay_until_next_fire, RunMode};
use async_trait::async_trait;
use chrono::Local;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument};

/// Scheduler trait for run triggering
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run according to the mode until it finishes or `stop` is called
    ///
    /// Returns the number of completed runs.
    async fn start(&self) -> Result<u64, ScheduleError>;

    /// Stop scheduling further runs; an in-flight run is allowed to finish
    async fn stop(&self);

    /// Execute a single run right now
    async fn trigger(&self) -> RunReport;
}

/// Main scheduler engine implementation
pub struct SchedulerEngine {
    job: MoveJob,
    mode: RunMode,
    shutdown_tx: watch::Sender<bool>,
}

impl SchedulerEngine {
    /// Create a new scheduler engine
    pub fn new(job: MoveJob, mode: RunMode) -> Self {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        Self {
            job,
            mode,
            shutdown_tx,
        }
    }

    pub fn mode(&self) -> &RunMode {
        &self.mode
    }

    /// Get a shutdown signal receiver
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn is_stopped(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    async fn run_loop(
        &self,
        count: u32,
        pause: std::time::Duration,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> u64 {
        let mut runs = 0;
        for iteration in 1..=count {
            if self.is_stopped() {
                break;
            }
            debug!(iteration, count, "Loop iteration");
            self.trigger().await;
            runs += 1;

            if iteration == count {
                break;
            }
            tokio::select! {
                _ = sleep(pause) => {}
                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping loop");
                    break;
                }
            }
        }
        runs
    }

    async fn run_interval(
        &self,
        period: std::time::Duration,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> u64 {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut runs = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.trigger().await;
                    runs += 1;
                }
                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping interval schedule");
                    break;
                }
            }
        }
        runs
    }

    async fn run_cron(
        &self,
        schedule: &cron::Schedule,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<u64, ScheduleError> {
        let mut runs = 0;
        loop {
            let delay = delay_until_next_fire(schedule, Local::now())?;
            debug!(delay_ms = delay.as_millis() as u64, "Waiting for next cron fire");

            tokio::select! {
                _ = sleep(delay) => {
                    self.trigger().await;
                    runs += 1;
                }
                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping cron schedule");
                    break;
                }
            }
        }
        Ok(runs)
    }
}

#[async_trait]
impl Scheduler for SchedulerEngine {
    #[instrument(skip(self), fields(mode = ?self.mode))]
    async fn start(&self) -> Result<u64, ScheduleError> {
        info!("Starting scheduler engine");
        let mut shutdown_rx = self.shutdown_receiver();
        if self.is_stopped() {
            info!("Scheduler engine already stopped");
            return Ok(0);
        }

        let runs = match &self.mode {
            RunMode::Once => {
                self.trigger().await;
                1
            }
            RunMode::Loop { count, pause } => self.run_loop(*count, *pause, &mut shutdown_rx).await,
            RunMode::Interval(period) => self.run_interval(*period, &mut shutdown_rx).await,
            RunMode::Cron(schedule) => self.run_cron(schedule, &mut shutdown_rx).await?,
        };

        info!(runs, "Scheduler engine stopped");
        Ok(runs)
    }

    #[instrument(skip(self))]
    async fn stop(&self) {
        info!("Stopping scheduler engine");
        self.shutdown_tx.send_replace(true);
    }

    async fn trigger(&self) -> RunReport {
        self.job.run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mover::EngineOptions;
    use crate::routing::RoutingTable;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn job_for(root: &TempDir) -> MoveJob {
        let src = root.path().join("src").display().to_string();
        let dst = root.path().join("dst").display().to_string();
        let table = RoutingTable::from_args(&[src, "t".to_string(), dst]).unwrap();
        MoveJob::new(table, EngineOptions::default())
    }

    #[tokio::test]
    async fn test_once_runs_a_single_time() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("src")).unwrap();
        std::fs::write(root.path().join("src").join("t1"), "A").unwrap();

        let engine = SchedulerEngine::new(job_for(&root), RunMode::Once);
        assert!(matches!(engine.mode(), RunMode::Once));
        assert_eq!(engine.start().await.unwrap(), 1);
        assert!(root.path().join("dst").join("t1").exists());
    }

    #[tokio::test]
    async fn test_loop_runs_count_times() {
        let root = TempDir::new().unwrap();
        let mode = RunMode::Loop {
            count: 3,
            pause: Duration::from_millis(1),
        };
        let engine = SchedulerEngine::new(job_for(&root), mode);
        assert_eq!(engine.start().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stop_before_start_schedules_nothing() {
        let root = TempDir::new().unwrap();
        let engine = SchedulerEngine::new(job_for(&root), RunMode::Once);
        engine.stop().await;
        assert_eq!(engine.start().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stop_ends_interval_schedule() {
        let root = TempDir::new().unwrap();
        let mode = RunMode::Interval(Duration::from_millis(20));
        let engine = Arc::new(SchedulerEngine::new(job_for(&root), mode));

        let running = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.start().await })
        };
        sleep(Duration::from_millis(120)).await;
        engine.stop().await;

        let runs = running.await.unwrap().unwrap();
        assert!(runs >= 1);
    }

    #[tokio::test]
    async fn test_stop_ends_cron_schedule() {
        let root = TempDir::new().unwrap();
        let schedule = crate::schedule::parse_cron_expression("* * * * * ?").unwrap();
        let engine = Arc::new(SchedulerEngine::new(job_for(&root), RunMode::Cron(schedule)));

        let running = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.start().await })
        };
        sleep(Duration::from_millis(50)).await;
        engine.stop().await;

        assert!(running.await.unwrap().is_ok());
    }
}
