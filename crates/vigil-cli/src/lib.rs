//! # vigil-cli
//!
//! Command-line interface for the Vigil agent runtime.
//!
//! ## Commands
//!
//! - `vigil start`: Run the daemon (`--interactive` attaches a console)
//! - `vigil status`: Show the last status snapshot
//! - `vigil doctor`: Check configuration, identity, and providers
//! - `vigil config` / `vigil set`: Show or edit `vigil.toml`
//! - `vigil jobs`: List, add, or remove scheduled jobs
//! - `vigil sessions`: Inspect conversation transcripts
//! - `vigil audit`: Show recent audit log events
//! - `vigil imprint`: Record the operator identity

pub mod commands;

pub use commands::Cli;
