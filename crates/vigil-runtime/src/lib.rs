//! # vigil-runtime
//!
//! The always-on core: it decides how much thinking each signal deserves,
//! remembers conversations within bounds, fires scheduled work, and keeps
//! all of it running as one daemon per state directory.
//!
//! ## Architecture
//!
//! ```text
//!        operator messages        timers            sensors
//!               │                   │                  │
//!               ▼                   ▼                  ▼
//!        ┌──────────────────────── EventBus ─────────────────────┐
//!        └───────────────────────────┬───────────────────────────┘
//!                                    ▼
//!                          ┌──────────────────┐
//!                          │    Cognition     │
//!                          │  1. Command?     │
//!                          │  2. Triage       │  ← AffectState
//!                          │  3. Fast | Deep  │  ← ProviderChain
//!                          │  4. Remember     │  → SessionStore
//!                          │  5. Reply        │  → ReplySink
//!                          └──────────────────┘
//! ```

pub mod affect;
pub mod cognition;
pub mod commands;
pub mod context;
pub mod daemon;
pub mod identity;
pub mod lock;
pub mod scheduler;
pub mod session;

pub use affect::{AffectChannel, AffectSnapshot, AffectState};
pub use cognition::{CognitionPath, CognitionScheduler, CognitionSettings, Outcome, ReplySink, chain_from_config, retry_policy};
pub use commands::Command;
pub use context::RuntimeContext;
pub use daemon::{Daemon, DaemonStatus, LocalInput, read_status, transport_from_config};
pub use lock::StateLock;
pub use scheduler::{ParsedSchedule, Recurrence, ScheduleParseError, ScheduledJob, Scheduler};
pub use session::SessionStore;
