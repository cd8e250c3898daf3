//! Command-line interface for relayq.
//!
//! Provides a worker command that runs configured queues and admin
//! commands for inspecting and repairing a single queue.

mod commands;

pub use commands::{builtin_handlers, parse_cli, run, run_with_cli, Cli};
