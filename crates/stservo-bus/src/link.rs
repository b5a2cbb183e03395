use std::io;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use stservo_proto::frame::{self, Scan};
use stservo_proto::Packet;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, error, info, trace, warn};

use crate::{BusError, BusSettings, Request};

/// Opens (and re-opens after an I/O error) the byte stream behind a bus.
pub trait Connector: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&mut self) -> io::Result<Self::Stream>;
}

#[derive(Debug, Clone)]
pub struct SerialConnector {
    port: String,
    baud: u32,
}

impl SerialConnector {
    pub fn new(port: &str, baud: u32) -> Self {
        Self { port: port.to_string(), baud }
    }
}

impl Connector for SerialConnector {
    type Stream = tokio_serial::SerialStream;

    fn connect(&mut self) -> io::Result<Self::Stream> {
        let stream = tokio_serial::new(&self.port, self.baud)
            .open_native_async()
            .map_err(io::Error::from)?;
        info!("bus {}: opened @ {} baud", self.port, self.baud);
        Ok(stream)
    }
}

/// Adapts a closure into a [`Connector`].
pub struct FnConnector<F>(pub F);

impl<F, S> Connector for FnConnector<F>
where
    F: FnMut() -> io::Result<S> + Send + 'static,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    fn connect(&mut self) -> io::Result<S> {
        (self.0)()
    }
}

pub(crate) struct BusTask<C: Connector> {
    port: String,
    connector: C,
    stream: Option<C::Stream>,
    settings: BusSettings,
    rx: mpsc::Receiver<Request>,
    buf: BytesMut,
    reconnected: bool,
    opened_once: bool,
}

impl<C: Connector> BusTask<C> {
    pub(crate) fn new(
        port: String,
        connector: C,
        settings: BusSettings,
        rx: mpsc::Receiver<Request>,
    ) -> Self {
        Self {
            port,
            connector,
            stream: None,
            settings,
            rx,
            buf: BytesMut::with_capacity(256),
            reconnected: false,
            opened_once: false,
        }
    }

    /// Serves queued requests one at a time until every handle is dropped.
    pub(crate) async fn run(mut self) {
        while let Some(req) = self.rx.recv().await {
            let result = self.transact(&req.frame, req.attempts).await;
            if req.reply.send(result).is_err() {
                debug!("bus {}: caller went away before the reply", self.port);
            }
        }
        debug!("bus {}: all handles dropped, closing", self.port);
    }

    async fn transact(&mut self, frame: &[u8], attempts: u32) -> Result<Packet, BusError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match self.exchange(frame).await {
                Ok(packet) => {
                    if self.reconnected {
                        info!("bus {}: exchange succeeded after reconnect", self.port);
                        self.reconnected = false;
                    }
                    return Ok(packet);
                }
                Err(e) => e,
            };

            if let BusError::Io(_) = err {
                self.stream = None;
            }

            if attempt >= attempts {
                if attempts > 1 {
                    error!("bus {}: giving up after {} attempts: {}", self.port, attempts, err);
                }
                return Err(BusError::Communication {
                    port: self.port.clone(),
                    attempts,
                    cause: Box::new(err),
                });
            }

            let delay = self.settings.backoff(attempt);
            warn!(
                "bus {}: attempt {}/{} failed: {} (retrying in {:?})",
                self.port, attempt, attempts, err, delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn exchange(&mut self, frame: &[u8]) -> Result<Packet, BusError> {
        let expected = *frame
            .get(2)
            .ok_or(BusError::Codec(stservo_proto::CodecError::Framing("request without id")))?;

        if self.stream.is_none() {
            let stream = self.connector.connect()?;
            self.reconnected = self.opened_once;
            self.opened_once = true;
            self.stream = Some(stream);
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| BusError::Closed(self.port.clone()))?;

        self.buf.clear();
        drain_input(stream, &mut self.buf).await?;
        if !self.buf.is_empty() {
            debug!("bus {}: dropped {} stale bytes", self.port, self.buf.len());
            self.buf.clear();
        }

        trace!("bus {}: tx {}", self.port, hex::encode(frame));
        stream.write_all(frame).await?;
        stream.flush().await?;

        let timeout = self.settings.transaction_timeout();
        let raw = tokio::time::timeout(timeout, read_frame(stream, &mut self.buf))
            .await
            .map_err(|_| BusError::Timeout(timeout))??;
        trace!("bus {}: rx {}", self.port, hex::encode(&raw));

        let packet = frame::decode(&raw)?;
        if packet.id != expected {
            return Err(BusError::WrongId { expected, got: packet.id });
        }
        Ok(packet)
    }
}

/// Reads whatever is already buffered by the port without waiting.
async fn drain_input<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut BytesMut) -> io::Result<()> {
    loop {
        match tokio::time::timeout(Duration::ZERO, stream.read_buf(buf)).await {
            Ok(Ok(0)) => {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "serial stream closed"))
            }
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(()),
        }
    }
}

async fn read_frame<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<Vec<u8>, BusError> {
    loop {
        match frame::scan(buf) {
            Scan::Frame(n) => return Ok(buf.split_to(n).to_vec()),
            Scan::Garbage(n) => {
                buf.advance(n);
                continue;
            }
            Scan::Incomplete => {}
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "serial stream closed").into());
        }
    }
}
