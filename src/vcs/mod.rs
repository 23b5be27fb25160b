//! Version-Control Driver (§4.2): a thin command-level wrapper around the
//! system `git` binary. All policy (when to merge, when to tag, when to
//! reset) lives in `anima::iteration`; this module only runs commands.

pub mod driver;
pub mod types;

pub use driver::GitDriver;
pub use types::{CommandOutput, MergeStrategy, WorkingTreeStatus};
