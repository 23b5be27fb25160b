//! Event bus (§4.9): every observable state change is broadcast as an
//! `AnimaEvent` for the control API's SSE subscribers.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::{AnimaEvent, EventKind};
