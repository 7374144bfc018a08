use serde::{Deserialize, Serialize};

/// Stream errors in a row before inbound delivery falls back to polling.
pub const STREAM_FAILURE_THRESHOLD: u32 = 3;
/// Successful polls in a row before the stream is retried.
pub const POLL_RECOVERY_THRESHOLD: u32 = 2;

/// Connection health of the operator transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Streaming,
    /// Polling history; `consecutive_failures` counts failed polls.
    Degraded { consecutive_failures: u32 },
    /// Waiting out a backoff after a failed poll.
    Reconnecting { consecutive_failures: u32 },
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Degraded { .. } => "degraded",
            ConnectionState::Reconnecting { .. } => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Degraded { consecutive_failures } | ConnectionState::Reconnecting { consecutive_failures }
                if *consecutive_failures > 0 =>
            {
                write!(f, "{} ({} failed polls)", self.label(), consecutive_failures)
            }
            _ => f.write_str(self.label()),
        }
    }
}

/// Inputs the supervisor feeds the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSignal {
    Connected,
    ConnectFailed,
    StreamError,
    MessageReceived,
    PollSucceeded,
    PollFailed,
    BackoffElapsed,
    AuthFailed,
}

/// A state change produced by [`ConnectionMachine::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Pure transition logic; no I/O, no clocks.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    stream_errors: u32,
    good_polls: u32,
    halted: bool,
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            stream_errors: 0,
            good_polls: 0,
            halted: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Set after an auth failure; only a restart clears it.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn stream_errors(&self) -> u32 {
        self.stream_errors
    }

    /// Degraded and the poll side has proven healthy long enough to retry the stream.
    pub fn wants_stream_attempt(&self) -> bool {
        matches!(self.state, ConnectionState::Degraded { .. }) && self.good_polls >= POLL_RECOVERY_THRESHOLD
    }

    /// Feed one signal. Returns the transition if the state changed.
    pub fn apply(&mut self, signal: TransportSignal) -> Option<Transition> {
        if self.halted {
            return None;
        }
        let from = self.state;

        use ConnectionState::*;
        use TransportSignal::*;
        let next = match (from, signal) {
            (_, AuthFailed) => {
                self.halted = true;
                Disconnected
            }

            (Disconnected, Connected) => {
                self.stream_errors = 0;
                Streaming
            }
            (Disconnected | Streaming, ConnectFailed | StreamError) => {
                self.stream_errors += 1;
                if self.stream_errors >= STREAM_FAILURE_THRESHOLD {
                    self.good_polls = 0;
                    Degraded { consecutive_failures: 0 }
                } else {
                    from
                }
            }
            (Streaming, MessageReceived) => {
                self.stream_errors = 0;
                Streaming
            }

            (Degraded { .. }, PollSucceeded) => {
                self.good_polls += 1;
                Degraded { consecutive_failures: 0 }
            }
            (Degraded { consecutive_failures }, PollFailed) => {
                self.good_polls = 0;
                Reconnecting { consecutive_failures }
            }
            (Degraded { .. }, Connected) => {
                self.stream_errors = 0;
                self.good_polls = 0;
                Streaming
            }
            // A failed reconnect stays degraded and must earn another retry.
            (Degraded { .. }, ConnectFailed | StreamError) => {
                self.good_polls = 0;
                from
            }
            (Reconnecting { consecutive_failures }, BackoffElapsed) => Degraded {
                consecutive_failures: consecutive_failures + 1,
            },

            _ => from,
        };

        self.state = next;
        (next != from).then_some(Transition { from, to: next })
    }
}
