//! Connection lifecycle: outbound queueing and liveness probing.
//!
//! The transport adapter owns the socket; the room keeps a [`Connection`]
//! handle per attached peer and pushes frames into its bounded queue. A
//! queue that is full or whose consumer is gone means the peer cannot
//! keep up or already left, and either way the room closes it — frames
//! are never buffered without bound.
//!
//! Liveness runs beside the socket in the adapter's per-connection loop:
//!
//! ```text
//! every ping_interval tick
//!        │
//!        ▼
//! Heartbeat::tick() ──► Probe::Ping   send ping, await pong
//!        │
//!        └────────────► Probe::Evict  previous ping unanswered
//! ```

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default interval between liveness probes.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Default capacity of a connection's outbound frame queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Why a frame could not be queued to a connection.
///
/// Both variants are terminal for the connection: the room treats them
/// like a liveness failure and closes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The transport side dropped its receiver.
    Closed,
    /// The bounded queue is full; the peer is not draining fast enough.
    Backpressure,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Connection closed"),
            Self::Backpressure => write!(f, "Connection backpressure limit exceeded"),
        }
    }
}

impl std::error::Error for SendError {}

/// Room-side handle to one attached connection's outbound queue.
pub struct Connection {
    outbound: mpsc::Sender<Vec<u8>>,
}

impl Connection {
    /// Create the handle plus the receiver the transport adapter drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (outbound, rx) = mpsc::channel(capacity);
        (Self { outbound }, rx)
    }

    /// Queue a frame without waiting.
    pub fn try_send(&self, frame: Vec<u8>) -> Result<(), SendError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Backpressure,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }
}

/// Decision for one liveness tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Send a ping and wait for its acknowledgment.
    Ping,
    /// The previous ping went unanswered; the connection is dead.
    Evict,
}

/// Ping/pong liveness state machine for one connection.
///
/// One instance lives in each transport task. A tick with the previous
/// probe still outstanding evicts; any pong clears the outstanding
/// probe.
#[derive(Debug, Default)]
pub struct Heartbeat {
    awaiting_pong: bool,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self { awaiting_pong: false }
    }

    /// Advance one probe interval.
    pub fn tick(&mut self) -> Probe {
        if self.awaiting_pong {
            Probe::Evict
        } else {
            self.awaiting_pong = true;
            Probe::Ping
        }
    }

    /// The peer acknowledged the outstanding probe.
    pub fn record_pong(&mut self) {
        self.awaiting_pong = false;
    }
}
