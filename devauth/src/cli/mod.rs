//! CLI module for devauth.

pub mod args;
pub mod commands;

pub use args::{Cli, Commands};
