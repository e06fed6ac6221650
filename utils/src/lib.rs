//! Small helpers shared by the workspace crates: external command
//! execution and tracing setup.  Keep this crate limited to the standard
//! library plus "core" dependencies.

mod command;
mod tracing_util;
pub use command::*;
pub use tracing_util::*;
