//! CLI module
//!
//! Argument definitions for the `mcp-hub` binary. The command runners live
//! in [`crate::handlers`].

pub mod args;

pub use args::{Cli, Commands, SourceArg};
