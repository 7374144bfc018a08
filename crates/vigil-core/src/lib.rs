//! # vigil-core
//!
//! Core types and primitives for the Vigil agent runtime: the error taxonomy,
//! the in-process event bus with its audit log, conversation messages, and the
//! JSONL persistence helpers every other crate writes state through.

pub mod error;
pub mod event;
pub mod jsonl;
pub mod message;
pub mod paths;
pub mod types;

pub use error::{Result, VigilError};
pub use event::{AuditLog, Event, EventBus, EventKind, Severity, SubscriptionId};
pub use message::{Message, Role};
pub use paths::StatePaths;
pub use types::*;
