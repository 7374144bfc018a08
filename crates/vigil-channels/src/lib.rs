//! # vigil-channels
//!
//! The operator's messaging channel. A [`Transport`] is the raw capability
//! (stream, send, poll history, typing); [`ResilientTransport`] supervises
//! one and keeps inbound delivery going when the live stream breaks, by
//! falling back to history polling until the stream proves healthy again.
//!
//! ```text
//! Disconnected ──connect──▶ Streaming ──3 stream errors──▶ Degraded(0)
//!                              ▲                            │      ▲
//!                              └──2 good polls + reconnect──┘      │
//!                                          poll failure ▼          │
//!                                                  Reconnecting ───┘ backoff
//! ```

pub mod adapter;
pub mod mock;
pub mod relay;
pub mod resilient;
pub mod state;

pub use adapter::{DeliveryReceipt, InboundMessage, StreamEvent, Transport, TransportError};
pub use mock::ScriptedTransport;
pub use relay::RelayTransport;
pub use resilient::{ResilientTransport, TransportSettings};
pub use state::{ConnectionMachine, ConnectionState, TransportSignal};
