//! Instrument capability interface.
//!
//! The sampling cycle is generic over [`InstrumentDriver`]: a small set of
//! hooks that each instrument implements. Most moored instruments speak a
//! line-oriented ASCII dialect, which [`AsciiDriver`] covers from
//! configuration alone.

use crate::config::ProtocolSettings;
use crate::error::{AppResult, DaqError};
use crate::transport::Transport;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Per-instrument hooks driven by the sampling cycle.
#[async_trait]
pub trait InstrumentDriver: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Bytes that end one sample record.
    fn terminator(&self) -> &[u8];

    /// One-time setup after the instrument is first powered.
    async fn initialize_instrument(
        &self,
        _transport: &mut dyn Transport,
        _timeout: Duration,
    ) -> AppResult<()> {
        Ok(())
    }

    /// One attention probe: succeed once the instrument shows it is listening.
    async fn attention(&self, _transport: &mut dyn Transport, _timeout: Duration) -> AppResult<()> {
        Ok(())
    }

    /// Called once per cycle after attention, before the first request.
    async fn prepare_to_sample(&self, _transport: &mut dyn Transport) -> AppResult<()> {
        Ok(())
    }

    /// Send the sample request.
    async fn request_sample(&self, transport: &mut dyn Transport) -> AppResult<()>;

    /// Read one raw sample record.
    async fn read_sample(
        &self,
        transport: &mut dyn Transport,
        timeout: Duration,
    ) -> AppResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(128);
        transport.read_until(&mut buf, self.terminator(), timeout).await?;
        Ok(buf)
    }

    /// Reject malformed records before they are parsed.
    fn validate_sample(&self, _raw: &[u8]) -> AppResult<()> {
        Ok(())
    }

    /// Called after every cycle, successful or not.
    async fn post_sample(&self, _transport: &mut dyn Transport) -> AppResult<()> {
        Ok(())
    }
}

/// Configuration-driven driver for line-oriented ASCII instruments.
#[derive(Debug, Clone)]
pub struct AsciiDriver {
    name: String,
    probe: Vec<u8>,
    prompt: Vec<u8>,
    request: Vec<u8>,
    terminator: Vec<u8>,
    init_commands: Vec<Vec<u8>>,
}

impl AsciiDriver {
    /// Build a driver from protocol settings, decoding escape sequences.
    pub fn from_settings(name: impl Into<String>, settings: &ProtocolSettings) -> AppResult<Self> {
        let terminator = decode_escapes(&settings.terminator)?;
        if terminator.is_empty() {
            return Err(DaqError::Configuration("sample terminator is empty".into()));
        }
        Ok(Self {
            name: name.into(),
            probe: decode_escapes(&settings.probe)?,
            prompt: decode_escapes(&settings.prompt)?,
            request: decode_escapes(&settings.request)?,
            terminator,
            init_commands: settings
                .init_commands
                .iter()
                .map(|c| decode_escapes(c.as_str()))
                .collect::<AppResult<_>>()?,
        })
    }

    /// Prompt the instrument prints when it is listening.
    pub fn prompt(&self) -> &[u8] {
        &self.prompt
    }
}

#[async_trait]
impl InstrumentDriver for AsciiDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn terminator(&self) -> &[u8] {
        &self.terminator
    }

    async fn initialize_instrument(
        &self,
        transport: &mut dyn Transport,
        timeout: Duration,
    ) -> AppResult<()> {
        for command in &self.init_commands {
            debug!(instrument = %self.name, command = %String::from_utf8_lossy(command).escape_default(), "init command");
            transport.write(command).await?;
            transport.flush().await?;
            if !self.prompt.is_empty() {
                transport.skip_until(&self.prompt, timeout).await?;
            }
        }
        Ok(())
    }

    async fn attention(&self, transport: &mut dyn Transport, timeout: Duration) -> AppResult<()> {
        if self.probe.is_empty() {
            return Ok(());
        }
        transport.clear_input().await?;
        transport.write(&self.probe).await?;
        transport.flush().await?;
        if self.prompt.is_empty() {
            return Ok(());
        }
        transport.skip_until(&self.prompt, timeout).await
    }

    async fn request_sample(&self, transport: &mut dyn Transport) -> AppResult<()> {
        transport.write(&self.request).await?;
        transport.flush().await
    }

    fn validate_sample(&self, raw: &[u8]) -> AppResult<()> {
        let body = raw.strip_suffix(self.terminator.as_slice()).unwrap_or(raw);
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(DaqError::Protocol(format!("{}: empty sample record", self.name)));
        }
        if !self.prompt.is_empty() && body == self.prompt.as_slice() {
            return Err(DaqError::Protocol(format!(
                "{}: prompt received instead of sample",
                self.name
            )));
        }
        Ok(())
    }
}

/// Decode `\r`, `\n`, `\t`, `\0`, `\\` and `\xNN` escapes.
pub fn decode_escapes(input: &str) -> AppResult<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.bytes();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'r') => out.push(b'\r'),
            Some(b'n') => out.push(b'\n'),
            Some(b't') => out.push(b'\t'),
            Some(b'0') => out.push(0),
            Some(b'\\') => out.push(b'\\'),
            Some(b'x') => {
                let hi = bytes.next();
                let lo = bytes.next();
                let hex = match (hi, lo) {
                    (Some(h), Some(l)) => [h, l],
                    _ => {
                        return Err(DaqError::Configuration(format!(
                            "truncated \\x escape in {input:?}"
                        )))
                    }
                };
                let text = std::str::from_utf8(&hex)
                    .map_err(|_| DaqError::Configuration(format!("bad \\x escape in {input:?}")))?;
                let value = u8::from_str_radix(text, 16)
                    .map_err(|_| DaqError::Configuration(format!("bad \\x escape in {input:?}")))?;
                out.push(value);
            }
            Some(other) => {
                return Err(DaqError::Configuration(format!(
                    "unknown escape \\{} in {input:?}",
                    other as char
                )))
            }
            None => {
                return Err(DaqError::Configuration(format!(
                    "dangling backslash in {input:?}"
                )))
            }
        }
    }
    Ok(out)
}
