// Token substitution engine
// Resolves {date}-style placeholders in path and pattern templates against one run timestamp.

use chrono::{Duration, Local, NaiveDateTime};
use tracing::instrument;

const FORMAT_DATE: &str = "%Y%m%d";
const FORMAT_TIME: &str = "%H%M%S";
const FORMAT_YEAR: &str = "%Y";
const FORMAT_MONTH: &str = "%m";
const FORMAT_DAY: &str = "%d";
const FORMAT_HOUR: &str = "%H";
const FORMAT_MINUTE: &str = "%M";
const FORMAT_SECOND: &str = "%S";

/// Point in time captured once at the start of a run
///
/// Every template resolved during the same run sees the same "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RunTimestamp(NaiveDateTime);

impl RunTimestamp {
    /// Capture the current local wall-clock time
    pub fn now() -> Self {
        Self(Local::now().naive_local())
    }

    pub fn at(value: NaiveDateTime) -> Self {
        Self(value)
    }

    fn format(&self, fmt: &str) -> String {
        self.0.format(fmt).to_string()
    }

    fn days_before(&self, days: i64) -> Self {
        Self(self.0 - Duration::hours(24 * days))
    }
}

/// Replace every recognized token in `template`
///
/// Tokens and their values:
/// - `{date}` `20060102`, `{time}` `150405`
/// - `{year}`, `{month}`, `{day}`, `{hour}`, `{minute}`, `{second}`
/// - `{yesterday}`, `{day-1}`: one day earlier, `{day-2}`: two days earlier
///
/// The three relative-day tokens render only the seconds field of the shifted
/// timestamp. Unknown `{...}` tokens are left as they are.
#[instrument(level = "trace", skip(ts))]
pub fn replace_tokens(template: &str, ts: RunTimestamp) -> String {
    if !template.contains('{') {
        return template.to_string();
    }

    let yesterday = ts.days_before(1);
    let before_yesterday = ts.days_before(2);

    let replacements = [
        ("{date}", ts.format(FORMAT_DATE)),
        ("{time}", ts.format(FORMAT_TIME)),
        ("{year}", ts.format(FORMAT_YEAR)),
        ("{month}", ts.format(FORMAT_MONTH)),
        ("{day}", ts.format(FORMAT_DAY)),
        ("{hour}", ts.format(FORMAT_HOUR)),
        ("{minute}", ts.format(FORMAT_MINUTE)),
        ("{second}", ts.format(FORMAT_SECOND)),
        // Relative days render the seconds field only
        ("{yesterday}", yesterday.format(FORMAT_SECOND)),
        ("{day-1}", yesterday.format(FORMAT_SECOND)),
        ("{day-2}", before_yesterday.format(FORMAT_SECOND)),
    ];

    let mut result = template.to_string();
    for (token, value) in replacements.iter() {
        if result.contains(token) {
            result = result.replace(token, value);
        }
    }

    tracing::trace!(template, result = %result, "Tokens replaced");
    result
}
