// Routing table builder
// Turns flat FROM PATTERN TO argument triples into source -> destination -> patterns.

use crate::errors::{RoutingError, Slot};
use crate::substitution::{replace_tokens, RunTimestamp};
use regex::Regex;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

/// Argument meaning "repeat the previous value of this slot"
pub const REPEAT_TOKEN: &str = "$";

/// Patterns bound to one destination template, in insertion order
pub type PatternList = Vec<String>;

/// Source template -> destination template -> pattern templates
///
/// Built once from the argument list and never mutated afterwards, so a run can
/// share it across all of its tasks behind an `Arc` without locking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    routes: BTreeMap<String, BTreeMap<String, PatternList>>,
}

impl RoutingTable {
    /// Build the table, validating every pattern against the current time
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self, RoutingError> {
        Self::from_args_at(args, RunTimestamp::now())
    }

    /// Build the table, validating every pattern against `ts`
    ///
    /// `args` is read as consecutive (FROM, PATTERN, TO) triples. A slot equal to
    /// `$` takes the nearest preceding non-`$` value of the same slot. Within one
    /// (FROM, TO) pair a pattern string is only stored once; duplicates are
    /// detected on the raw template, before token substitution.
    #[instrument(skip(args), fields(arg_count = args.len()))]
    pub fn from_args_at<S: AsRef<str>>(args: &[S], ts: RunTimestamp) -> Result<Self, RoutingError> {
        if args.len() < 3 {
            return Err(RoutingError::TooFewArguments(args.len()));
        }
        if args.len() % 3 != 0 {
            return Err(RoutingError::IncompleteTriple(args.len()));
        }

        let first = [
            (Slot::From, args[0].as_ref()),
            (Slot::Pattern, args[1].as_ref()),
            (Slot::To, args[2].as_ref()),
        ];
        for (slot, value) in first {
            if value == REPEAT_TOKEN {
                return Err(RoutingError::RepeatInFirstTriple { slot });
            }
            if value.is_empty() {
                return Err(RoutingError::EmptyFirstSlot { slot });
            }
        }

        let mut last_from = args[0].as_ref();
        let mut last_pattern = args[1].as_ref();
        let mut last_to = args[2].as_ref();

        let mut table = Self::default();
        for triple in args.chunks_exact(3) {
            let from = resolve_slot(triple[0].as_ref(), &mut last_from);
            let pattern = resolve_slot(triple[1].as_ref(), &mut last_pattern);
            let to = resolve_slot(triple[2].as_ref(), &mut last_to);

            table.insert(from, pattern, to, ts)?;
        }

        if table.is_empty() {
            return Err(RoutingError::EmptyTable);
        }

        debug!(sources = table.len(), "Routing table built");
        Ok(table)
    }

    fn insert(
        &mut self,
        from: &str,
        pattern: &str,
        to: &str,
        ts: RunTimestamp,
    ) -> Result<(), RoutingError> {
        let patterns = self
            .routes
            .entry(from.to_string())
            .or_default()
            .entry(to.to_string())
            .or_default();

        if patterns.iter().any(|existing| existing == pattern) {
            debug!(from, to, pattern, "Duplicate pattern skipped");
            return Ok(());
        }

        validate_pattern(pattern, ts)?;
        patterns.push(pattern.to_string());
        Ok(())
    }

    /// Number of distinct source templates
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn destinations(&self, source: &str) -> Option<&BTreeMap<String, PatternList>> {
        self.routes.get(source)
    }

    pub fn patterns(&self, source: &str, destination: &str) -> Option<&[String]> {
        self.routes
            .get(source)
            .and_then(|destinations| destinations.get(destination))
            .map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, PatternList>)> {
        self.routes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Log every route; called at the start of each run
    pub fn log_summary(&self) {
        let route_count: usize = self.routes.values().map(BTreeMap::len).sum();
        info!(sources = self.len(), routes = route_count, "Routing table");
        for (from, destinations) in &self.routes {
            for (to, patterns) in destinations {
                debug!(from = %from, to = %to, patterns = ?patterns, "Route");
            }
        }
    }
}

fn resolve_slot<'a>(value: &'a str, last: &mut &'a str) -> &'a str {
    if value == REPEAT_TOKEN {
        return *last;
    }
    *last = value;
    value
}

/// Check that `pattern` compiles once its tokens are replaced
fn validate_pattern(pattern: &str, ts: RunTimestamp) -> Result<(), RoutingError> {
    let resolved = replace_tokens(pattern, ts);
    Regex::new(&resolved)
        .map(|_| ())
        .map_err(|e| RoutingError::InvalidPattern {
            template: pattern.to_string(),
            resolved,
            reason: e.to_string(),
        })
}
