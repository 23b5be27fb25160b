//! Supervisor (§4, bullet 8): the single process-wide singleton that owns
//! the set of registered projects, spawns one Wake Scheduler per project,
//! and fans events out to subscribers.

mod registry;
mod supervisor;

pub use registry::{ProjectHandle, ProjectSnapshot};
pub use supervisor::{ControlError, Supervisor};
