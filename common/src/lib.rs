// Common library for the ant file mover: routing, matching, the run engine and its scheduler

pub mod config;
pub mod errors;
pub mod matcher;
pub mod mover;
pub mod routing;
pub mod schedule;
pub mod scheduler;
pub mod substitution;
pub mod telemetry;

pub use mover::{EngineOptions, MoveJob, RunReport};
pub use routing::RoutingTable;
pub use substitution::{replace_tokens, RunTimestamp};
