//! Byte transports to instruments.
//!
//! Instruments are reached over a local serial port or a serial-over-TCP
//! tunnel. Both are plain async byte streams, so a single
//! [`StreamTransport`] implements the [`Transport`] contract on top of any
//! `AsyncRead + AsyncWrite` stream and adds deadline-driven reads.
//!
//! Links drop: tunnels time out and USB adapters re-enumerate.
//! [`ReconnectingTransport`] wraps a [`Connector`] and reopens the link on
//! first use after an I/O failure, so a lost instrument comes back on a
//! later attempt without restarting the node.

use crate::config::ConnectionSettings;
use crate::error::{AppResult, DaqError};
use crate::error_recovery::Recoverable;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{info, trace, warn};

/// Largest response accepted before a terminator is seen.
pub const DEFAULT_MAX_RESPONSE_LEN: usize = 4096;

/// Limit for establishing a TCP tunnel connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Object-safe stream bound used for serial and TCP connections.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased instrument stream.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Byte-level link to one instrument.
#[async_trait]
pub trait Transport: Send {
    /// Write all of `bytes`.
    async fn write(&mut self, bytes: &[u8]) -> AppResult<()>;

    /// Flush buffered output to the device.
    async fn flush(&mut self) -> AppResult<()>;

    /// Discard input up to and including `pattern`.
    async fn skip_until(&mut self, pattern: &[u8], timeout: Duration) -> AppResult<()>;

    /// Append input to `buf` up to and including `terminator`.
    ///
    /// Returns the number of bytes appended.
    async fn read_until(
        &mut self,
        buf: &mut Vec<u8>,
        terminator: &[u8],
        timeout: Duration,
    ) -> AppResult<usize>;

    /// Drop any input that has already arrived.
    async fn clear_input(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// [`Transport`] over any async byte stream.
pub struct StreamTransport<S> {
    stream: S,
    pending: BytesMut,
    max_response_len: usize,
    label: String,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap `stream`; `label` identifies the link in logs.
    pub fn new(stream: S, label: impl Into<String>) -> Self {
        Self {
            stream,
            pending: BytesMut::with_capacity(256),
            max_response_len: DEFAULT_MAX_RESPONSE_LEN,
            label: label.into(),
        }
    }

    /// Override the maximum accepted response length.
    pub fn with_max_response_len(mut self, max: usize) -> Self {
        self.max_response_len = max.max(1);
        self
    }

    /// Link label used in logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Consume the transport and return the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Read into `pending` until it contains `pattern`; returns the index
    /// one past the end of the match.
    async fn fill_until(
        &mut self,
        pattern: &[u8],
        timeout: Duration,
        operation: &'static str,
    ) -> AppResult<usize> {
        let deadline = Instant::now() + timeout;
        let mut scanned = 0;
        let mut chunk = [0u8; 256];
        loop {
            if let Some(pos) = find(&self.pending[scanned..], pattern) {
                return Ok(scanned + pos + pattern.len());
            }
            // Keep a pattern-length tail so a match split across reads is found.
            scanned = self.pending.len().saturating_sub(pattern.len().saturating_sub(1));

            if self.pending.len() > self.max_response_len {
                let len = self.pending.len();
                self.pending.clear();
                return Err(DaqError::Protocol(format!(
                    "{}: no terminator within {len} bytes",
                    self.label
                )));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DaqError::timeout(operation, timeout));
            }
            match tokio::time::timeout(remaining, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    return Err(DaqError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("{} closed", self.label),
                    )))
                }
                Ok(Ok(n)) => {
                    trace!(link = %self.label, bytes = n, "read");
                    self.pending.extend_from_slice(&chunk[..n]);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(DaqError::timeout(operation, timeout)),
            }
        }
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        trace!(link = %self.label, data = %String::from_utf8_lossy(bytes).escape_default(), "write");
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    async fn flush(&mut self) -> AppResult<()> {
        self.stream.flush().await?;
        Ok(())
    }

    async fn skip_until(&mut self, pattern: &[u8], timeout: Duration) -> AppResult<()> {
        if pattern.is_empty() {
            return Ok(());
        }
        let end = self.fill_until(pattern, timeout, "skip_until").await?;
        self.pending.advance(end);
        Ok(())
    }

    async fn read_until(
        &mut self,
        buf: &mut Vec<u8>,
        terminator: &[u8],
        timeout: Duration,
    ) -> AppResult<usize> {
        if terminator.is_empty() {
            return Err(DaqError::Protocol("empty terminator".into()));
        }
        let end = self.fill_until(terminator, timeout, "read_until").await?;
        let line = self.pending.split_to(end);
        buf.extend_from_slice(&line);
        Ok(line.len())
    }

    async fn clear_input(&mut self) -> AppResult<()> {
        self.pending.clear();
        let mut chunk = [0u8; 256];
        // A zero timeout still polls the read once, so only ready bytes are taken.
        while let Ok(Ok(n)) = tokio::time::timeout(Duration::ZERO, self.stream.read(&mut chunk)).await {
            if n == 0 {
                break;
            }
        }
        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Open a local serial port.
#[cfg(feature = "instrument_serial")]
pub fn open_serial(port: &str, baud: u32) -> AppResult<StreamTransport<DynSerial>> {
    use tokio_serial::SerialPortBuilderExt;

    let stream = tokio_serial::new(port, baud)
        .open_native_async()
        .map_err(|e| DaqError::Io(std::io::Error::other(format!("{port}: {e}"))))?;
    Ok(StreamTransport::new(Box::new(stream) as DynSerial, port))
}

/// Open a local serial port.
#[cfg(not(feature = "instrument_serial"))]
pub fn open_serial(_port: &str, _baud: u32) -> AppResult<StreamTransport<DynSerial>> {
    Err(DaqError::SerialFeatureDisabled)
}

/// Connect to a serial-over-TCP tunnel.
pub async fn connect_tcp(address: &str, timeout: Duration) -> AppResult<StreamTransport<DynSerial>> {
    let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(address))
        .await
        .map_err(|_| DaqError::timeout("connect", timeout))??;
    stream.set_nodelay(true)?;
    Ok(StreamTransport::new(Box::new(stream) as DynSerial, address))
}

/// Opens a fresh link to one instrument.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open the link.
    async fn connect(&self) -> AppResult<Box<dyn Transport>>;

    /// Human-readable link address.
    fn label(&self) -> String;
}

#[async_trait]
impl Connector for ConnectionSettings {
    async fn connect(&self) -> AppResult<Box<dyn Transport>> {
        match self {
            ConnectionSettings::Serial { port, baud } => Ok(Box::new(open_serial(port, *baud)?)),
            ConnectionSettings::Tcp { address } => {
                Ok(Box::new(connect_tcp(address, CONNECT_TIMEOUT).await?))
            }
        }
    }

    fn label(&self) -> String {
        match self {
            ConnectionSettings::Serial { port, .. } => port.clone(),
            ConnectionSettings::Tcp { address } => address.clone(),
        }
    }
}

/// [`Transport`] that opens its link lazily and reopens it after I/O errors.
///
/// Timeouts and protocol errors leave the link in place; only
/// [`DaqError::Io`] (refused connection, closed tunnel, vanished device)
/// drops it. The next call then reconnects once; if that fails the error is
/// returned and the following call tries again.
pub struct ReconnectingTransport {
    connector: Box<dyn Connector>,
    link: Option<Box<dyn Transport>>,
    label: String,
    connects: u64,
}

impl ReconnectingTransport {
    /// Wrap `connector`; nothing is opened until the first call.
    pub fn new(connector: impl Connector + 'static) -> Self {
        let label = connector.label();
        Self {
            connector: Box::new(connector),
            link: None,
            label,
            connects: 0,
        }
    }

    /// Whether a link is currently open.
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Number of successful opens so far.
    pub fn connects(&self) -> u64 {
        self.connects
    }

    async fn link(&mut self) -> AppResult<&mut (dyn Transport + 'static)> {
        if self.link.is_none() {
            self.recover().await?;
        }
        self.link
            .as_deref_mut()
            .ok_or_else(|| DaqError::Io(std::io::ErrorKind::NotConnected.into()))
    }

    fn observe<T>(&mut self, result: AppResult<T>) -> AppResult<T> {
        if let Err(DaqError::Io(e)) = &result {
            if self.link.take().is_some() {
                warn!(link = %self.label, error = %e, "instrument link lost; reconnecting on next use");
            }
        }
        result
    }
}

#[async_trait]
impl Recoverable<DaqError> for ReconnectingTransport {
    async fn recover(&mut self) -> Result<(), DaqError> {
        self.link = None;
        let link = self.connector.connect().await?;
        self.connects += 1;
        if self.connects > 1 {
            info!(link = %self.label, connects = self.connects, "instrument link reopened");
        }
        self.link = Some(link);
        Ok(())
    }
}

#[async_trait]
impl Transport for ReconnectingTransport {
    async fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        let result = self.link().await?.write(bytes).await;
        self.observe(result)
    }

    async fn flush(&mut self) -> AppResult<()> {
        let result = self.link().await?.flush().await;
        self.observe(result)
    }

    async fn skip_until(&mut self, pattern: &[u8], timeout: Duration) -> AppResult<()> {
        let result = self.link().await?.skip_until(pattern, timeout).await;
        self.observe(result)
    }

    async fn read_until(
        &mut self,
        buf: &mut Vec<u8>,
        terminator: &[u8],
        timeout: Duration,
    ) -> AppResult<usize> {
        let result = self.link().await?.read_until(buf, terminator, timeout).await;
        self.observe(result)
    }

    async fn clear_input(&mut self) -> AppResult<()> {
        let result = self.link().await?.clear_input().await;
        self.observe(result)
    }
}
