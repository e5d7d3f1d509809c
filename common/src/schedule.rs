// Run mode selection and next fire time calculation
//
// Modes, by priority: cron > fixed interval > fixed-count loop > single run.

use crate::errors::ScheduleError;
use chrono::{DateTime, Local};
use cron::Schedule as CronSchedule;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// How often the run engine is triggered
///
/// Built once at startup and handed to the scheduler runner; nothing in the
/// core reads the run mode from process state.
#[derive(Debug, Clone)]
pub enum RunMode {
    /// Run once and exit
    Once,
    /// Run `count` times, pausing `pause` between runs
    Loop { count: u32, pause: Duration },
    /// Run every `period`, first run after one period
    Interval(Duration),
    /// Run on every fire time of a cron expression
    Cron(CronSchedule),
}

impl RunMode {
    /// Pick the mode from the raw flag values
    ///
    /// A `loop_count` of 0, an `interval` of zero and a missing cron expression
    /// all mean "not set".
    pub fn select(
        loop_count: u32,
        loop_pause: Duration,
        interval: Option<Duration>,
        cron_expression: Option<&str>,
    ) -> Result<Self, ScheduleError> {
        if let Some(expression) = cron_expression {
            return Ok(RunMode::Cron(parse_cron_expression(expression)?));
        }
        if let Some(period) = interval.filter(|p| !p.is_zero()) {
            return Ok(RunMode::Interval(period));
        }
        if loop_count > 0 {
            return Ok(RunMode::Loop {
                count: loop_count,
                pause: loop_pause,
            });
        }

        info!("No loop, interval or cron set; running once");
        Ok(RunMode::Once)
    }

    /// Whether the mode ends on its own without a shutdown signal
    pub fn is_finite(&self) -> bool {
        matches!(self, RunMode::Once | RunMode::Loop { .. })
    }
}

/// Parse and validate a cron expression
///
/// Expressions carry a leading seconds field, e.g. `*/5 * * * * ?`.
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::from_str(expression).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a human duration such as `5s`, `1h` or `1h 30m`
pub fn parse_interval(value: &str) -> Result<Duration, ScheduleError> {
    humantime::parse_duration(value).map_err(|e| ScheduleError::InvalidInterval {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Next fire time of `schedule` strictly after `reference`, in local time
pub fn next_cron_fire(
    schedule: &CronSchedule,
    reference: DateTime<Local>,
) -> Result<DateTime<Local>, ScheduleError> {
    schedule
        .after(&reference)
        .next()
        .ok_or(ScheduleError::NoNextExecution)
}

/// Time left until the next cron fire, zero if it is already due
pub fn delay_until_next_fire(
    schedule: &CronSchedule,
    now: DateTime<Local>,
) -> Result<Duration, ScheduleError> {
    let next = next_cron_fire(schedule, now)?;
    Ok((next - now).to_std().unwrap_or(Duration::ZERO))
}
