//! CLI module for the reconciler.
//!
//! This module provides the command-line interface for planning, applying
//! and inspecting stacks.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
