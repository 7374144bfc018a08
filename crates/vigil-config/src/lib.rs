//! # vigil-config
//!
//! Configuration system for the Vigil runtime. Reads from `vigil.toml`, environment
//! variables, and CLI overrides, in that precedence order.
//!
//! Supports hot-reload via filesystem watcher.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::VigilConfig;
pub use schema::{
    AffectBaseline, ConfigWarning, LifeStage, ProviderConfig, ProviderKind, TransportKind,
    WarningSeverity,
};
