// Scheduler module driving the run engine on a trigger

pub mod engine;

pub use engine::{Scheduler, SchedulerEngine};
