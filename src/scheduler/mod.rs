//! Wake Scheduler (§4.5): per-project state machine deciding when a project
//! leaves `sleeping` and hands a ready milestone to the Iteration Engine.

mod wake;

pub use wake::{SchedulerSignal, WakeScheduler};
