pub mod link;
pub mod registry;
pub mod sim;

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use stservo_proto::registers::request;
use stservo_proto::{CodecError, Packet, Register, ServoFault};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

pub use link::{Connector, FnConnector, SerialConnector};
pub use registry::{BusRegistry, RegistryError};

pub const DEFAULT_BAUDRATE: u32 = 1_000_000;

/// Retry and timeout policy shared by every bus.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Deadline for one write/reply exchange.
    pub transaction_timeout_ms: u64,
    /// Total exchanges tried before a transaction is reported as failed.
    pub attempts: u32,
    /// First backoff between attempts; doubles after each failure.
    pub retry_backoff_ms: u64,
    /// Requests that may wait for the bus before callers are held back.
    pub queue_depth: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            transaction_timeout_ms: 100,
            attempts: 3,
            retry_backoff_ms: 10,
            queue_depth: 64,
        }
    }
}

impl BusSettings {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    /// Delay after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(8);
        Duration::from_millis(self.retry_backoff_ms << shift)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("serial I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("reply from servo {got} while addressing servo {expected}")]
    WrongId { expected: u8, got: u8 },

    #[error("{port}: gave up after {attempts} attempts: {cause}")]
    Communication {
        port: String,
        attempts: u32,
        #[source]
        cause: Box<BusError>,
    },

    #[error("{0}: bus task has stopped")]
    Closed(String),
}

impl BusError {
    /// True when retries were exhausted only because nothing answered.
    pub fn is_silence(&self) -> bool {
        match self {
            BusError::Timeout(_) => true,
            BusError::Communication { cause, .. } => cause.is_silence(),
            _ => false,
        }
    }
}

/// A decoded reply: error-status bits plus any returned register data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub fault: ServoFault,
    pub data: Vec<u8>,
}

impl From<Packet> for Reply {
    fn from(p: Packet) -> Self {
        Self { fault: ServoFault(p.code), data: p.params }
    }
}

pub(crate) struct Request {
    pub(crate) frame: Vec<u8>,
    pub(crate) attempts: u32,
    pub(crate) reply: oneshot::Sender<Result<Packet, BusError>>,
}

/// Cloneable, non-owning handle to one serial bus.
///
/// Every clone feeds the same FIFO queue; the task behind it performs one
/// exchange at a time in arrival order.
#[derive(Debug, Clone)]
pub struct BusHandle {
    port: Arc<str>,
    baud: u32,
    attempts: u32,
    tx: mpsc::Sender<Request>,
}

impl BusHandle {
    /// Starts the bus task on the current tokio runtime.
    pub fn spawn<C: Connector>(port: &str, baud: u32, connector: C, settings: BusSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_depth.max(1));
        let attempts = settings.attempts.max(1);
        let task = link::BusTask::new(port.to_string(), connector, settings, rx);
        tokio::spawn(task.run());
        debug!("bus {}: task started @ {} baud", port, baud);
        Self { port: Arc::from(port), baud, attempts, tx }
    }

    /// Opens a serial port lazily on first use.
    pub fn open_serial(port: &str, baud: u32, settings: BusSettings) -> Self {
        Self::spawn(port, baud, SerialConnector::new(port, baud), settings)
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Queues one frame and waits for the matching reply, with retries.
    pub async fn transact(&self, frame: Vec<u8>) -> Result<Packet, BusError> {
        self.submit(frame, self.attempts).await
    }

    async fn submit(&self, frame: Vec<u8>, attempts: u32) -> Result<Packet, BusError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request { frame, attempts, reply })
            .await
            .map_err(|_| BusError::Closed(self.port.to_string()))?;
        rx.await.map_err(|_| BusError::Closed(self.port.to_string()))?
    }

    /// Single-attempt presence check; silence means absent.
    pub async fn ping(&self, id: u8) -> Result<bool, BusError> {
        match self.submit(request::ping(id)?, 1).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_silence() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn read(&self, id: u8, register: Register, len: u8) -> Result<Reply, BusError> {
        let reply = Reply::from(self.transact(request::read(id, register, len)?).await?);
        if reply.data.len() < len as usize {
            return Err(CodecError::Framing("read reply shorter than requested").into());
        }
        Ok(reply)
    }

    pub async fn write(
        &self,
        id: u8,
        register: Register,
        data: &[u8],
    ) -> Result<ServoFault, BusError> {
        let reply = Reply::from(self.transact(request::write(id, register, data)?).await?);
        Ok(reply.fault)
    }

    /// Sends a prebuilt request frame and returns the reply status bits.
    pub async fn command(&self, frame: Vec<u8>) -> Result<ServoFault, BusError> {
        Ok(Reply::from(self.transact(frame).await?).fault)
    }

    /// Pings every id in the range and returns the ones that answered.
    pub async fn scan_ids(&self, ids: RangeInclusive<u8>) -> Result<Vec<u8>, BusError> {
        let mut found = Vec::new();
        for id in ids {
            if self.ping(id).await? {
                found.push(id);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let s = BusSettings { retry_backoff_ms: 10, ..Default::default() };
        assert_eq!(s.backoff(1), Duration::from_millis(10));
        assert_eq!(s.backoff(2), Duration::from_millis(20));
        assert_eq!(s.backoff(3), Duration::from_millis(40));
    }

    #[test]
    fn silence_looks_through_communication_errors() {
        let e = BusError::Communication {
            port: "/dev/null".into(),
            attempts: 3,
            cause: Box::new(BusError::Timeout(Duration::from_millis(100))),
        };
        assert!(e.is_silence());
        assert!(!BusError::Codec(CodecError::Framing("x")).is_silence());
    }
}
