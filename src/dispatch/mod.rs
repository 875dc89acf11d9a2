//! Command dispatch pipeline
//!
//! A durable job queue feeds worker tasks that resolve targets and
//! deliver commands through the connection registry, plus a scheduled
//! lane that re-activates commands at their due time.

pub mod queue;
pub mod scheduler;
pub mod worker;

pub use queue::{DispatchQueue, Job, Lane};
pub use scheduler::Scheduler;
pub use worker::{BroadcastOutcome, Dispatcher};
