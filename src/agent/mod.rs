//! Agent Process Host (§4.3) and Agent Stream Parser (§4.4): the two
//! pieces that let the Iteration Engine talk to an interactive AI agent
//! CLI and understand what it says.

pub mod events;
pub mod host;
pub mod parser;

pub use events::{QuotaStatus, StreamEvent, Verdict};
pub use host::{AgentProcessHost, Health};
pub use parser::AgentStreamParser;
