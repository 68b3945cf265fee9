//! Command line interface module
//!
//! Argument parsing for the `list`, `copy`, `pull` and `push` commands and
//! the runner that wires them to the engines.

pub mod args;
pub mod runner;

pub use args::Args;
pub use runner::Runner;
