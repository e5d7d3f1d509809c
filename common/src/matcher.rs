// Match evaluator
// Tests a candidate's base name against a destination's patterns and writes the content on the first hit.

use crate::errors::MoveError;
use regex::Regex;
use std::path::Path;
use tracing::{debug, instrument};

/// Result of evaluating one candidate file against one destination
#[derive(Debug)]
pub enum MatchOutcome {
    /// A pattern matched and the content was written
    Written { pattern: String },
    /// No pattern matched; nothing was written
    NoMatch,
    /// A pattern matched but the destination write failed
    WriteFailed { pattern: String, error: MoveError },
    /// A pattern failed to compile; evaluation stopped for this destination
    InvalidPattern { error: MoveError },
}

impl MatchOutcome {
    /// Whether some pattern matched the file name, regardless of the write
    pub fn matched(&self) -> bool {
        matches!(
            self,
            MatchOutcome::Written { .. } | MatchOutcome::WriteFailed { .. }
        )
    }

    /// Whether the destination now holds the file; only this allows deleting the source
    pub fn accepted(&self) -> bool {
        matches!(self, MatchOutcome::Written { .. })
    }

    pub fn error(&self) -> Option<&MoveError> {
        match self {
            MatchOutcome::WriteFailed { error, .. } | MatchOutcome::InvalidPattern { error } => {
                Some(error)
            }
            MatchOutcome::Written { .. } | MatchOutcome::NoMatch => None,
        }
    }
}

/// Write `content` to `dest_file` if any of `patterns` matches `file_name`
///
/// Patterns are compiled in order on every call and tested against the base
/// name only. The first match wins and the remaining patterns are not tried.
/// An existing file at `dest_file` is overwritten.
#[instrument(skip(content, patterns), fields(dest = %dest_file.display(), size = content.len()))]
pub async fn write_if_match(
    dest_file: &Path,
    file_name: &str,
    content: &[u8],
    patterns: &[String],
) -> MatchOutcome {
    let pattern = match first_matching(file_name, patterns) {
        Ok(Some(pattern)) => pattern,
        Ok(None) => return MatchOutcome::NoMatch,
        Err(error) => return MatchOutcome::InvalidPattern { error },
    };

    debug!(pattern = %pattern, "Pattern matched");
    match tokio::fs::write(dest_file, content).await {
        Ok(()) => MatchOutcome::Written {
            pattern: pattern.to_string(),
        },
        Err(source) => MatchOutcome::WriteFailed {
            pattern: pattern.to_string(),
            error: MoveError::WriteFailed {
                path: dest_file.to_path_buf(),
                source,
            },
        },
    }
}

fn first_matching<'a>(file_name: &str, patterns: &'a [String]) -> Result<Option<&'a str>, MoveError> {
    for pattern in patterns {
        let regex = Regex::new(pattern).map_err(|e| MoveError::InvalidPattern {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;
        if regex.is_match(file_name) {
            return Ok(Some(pattern.as_str()));
        }
    }
    Ok(None)
}
