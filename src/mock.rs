//! Mock Implementations
//!
//! Simulated instrument links and relay nodes for testing without hardware
//! or a network. All mocks use async-safe waits (`tokio::time::sleep`), so
//! tests can run them under a paused clock.
//!
//! # Available Mocks
//!
//! - `MockTransport` - Scripted instrument link with a call log
//! - `MockRelayNode` - Relay node whose steps can be made to fail or hang
//! - `MemoryAlertSink` - Collects alerts instead of sending them

use crate::dispatch::{Admission, AlertMessage, AlertSink, RelayNode, RelayService};
use crate::error::{AppResult, DaqError};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

// =============================================================================
// MockTransport - Scripted Instrument Link
// =============================================================================

/// What the mock instrument does on the next read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Deliver these bytes.
    Data(Vec<u8>),
    /// Stay silent until the read deadline passes.
    Silent,
}

/// Scripted [`Transport`].
///
/// Each `read_until` or `skip_until` consumes one [`MockReply`]; once the
/// script is exhausted every read times out. Every call is recorded.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    call_log: Arc<Mutex<Vec<String>>>,
}

impl MockTransport {
    /// Transport that never answers.
    pub fn silent() -> Self {
        Self::default()
    }

    /// Transport answering with `replies` in order.
    pub fn scripted(replies: impl IntoIterator<Item = MockReply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into_iter().collect())),
            call_log: Arc::default(),
        }
    }

    /// Queue another reply.
    pub fn push_reply(&self, reply: MockReply) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
    }

    /// Calls made so far, e.g. `write:TS\r` or `read_until`.
    pub fn get_call_log(&self) -> Vec<String> {
        self.call_log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Number of calls whose log entry starts with `prefix`.
    pub fn count_calls(&self, prefix: &str) -> usize {
        self.get_call_log()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn log_call(&self, call: String) {
        if let Ok(mut log) = self.call_log.lock() {
            log.push(call);
        }
    }

    fn next_reply(&self) -> MockReply {
        self.replies
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front())
            .unwrap_or(MockReply::Silent)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        self.log_call(format!("write:{}", String::from_utf8_lossy(bytes)));
        Ok(())
    }

    async fn flush(&mut self) -> AppResult<()> {
        self.log_call("flush".into());
        Ok(())
    }

    async fn skip_until(&mut self, _pattern: &[u8], timeout: Duration) -> AppResult<()> {
        self.log_call("skip_until".into());
        match self.next_reply() {
            MockReply::Data(_) => Ok(()),
            MockReply::Silent => {
                sleep(timeout).await;
                Err(DaqError::timeout("skip_until", timeout))
            }
        }
    }

    async fn read_until(
        &mut self,
        buf: &mut Vec<u8>,
        _terminator: &[u8],
        timeout: Duration,
    ) -> AppResult<usize> {
        self.log_call("read_until".into());
        match self.next_reply() {
            MockReply::Data(data) => {
                buf.extend_from_slice(&data);
                Ok(data.len())
            }
            MockReply::Silent => {
                sleep(timeout).await;
                Err(DaqError::timeout("read_until", timeout))
            }
        }
    }

    async fn clear_input(&mut self) -> AppResult<()> {
        self.log_call("clear_input".into());
        Ok(())
    }
}

// =============================================================================
// MockRelayNode - Simulated Relay
// =============================================================================

/// How a mock relay step behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockStep {
    /// Succeed immediately.
    #[default]
    Ok,
    /// Fail immediately.
    Fail,
    /// Never complete.
    Hang,
}

impl MockStep {
    async fn run(self, what: &str) -> AppResult<()> {
        match self {
            MockStep::Ok => Ok(()),
            MockStep::Fail => Err(DaqError::DispatchUnavailable(format!("{what} refused"))),
            MockStep::Hang => std::future::pending().await,
        }
    }
}

/// Relay node with configurable per-step behaviour and a record of
/// delivered payloads.
#[derive(Debug, Clone, Default)]
pub struct MockRelayNode {
    /// Behaviour of `wake`.
    pub wake: MockStep,
    /// Behaviour of `resolve`.
    pub resolve: MockStep,
    /// Behaviour of the resolved service's `enqueue`.
    pub enqueue: MockStep,
    pub(crate) delivered: Arc<Mutex<Vec<Bytes>>>,
    pub(crate) call_log: Arc<Mutex<Vec<String>>>,
}

impl MockRelayNode {
    /// Relay where every step succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Relay that never answers a wake request.
    pub fn unresponsive() -> Self {
        Self {
            wake: MockStep::Hang,
            ..Self::default()
        }
    }

    /// Payloads accepted so far, headers included.
    pub fn delivered(&self) -> Vec<Bytes> {
        self.delivered.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Calls made so far, e.g. `wake:shore` or `resolve:shore`.
    pub fn get_call_log(&self) -> Vec<String> {
        self.call_log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    fn log_call(&self, call: String) {
        if let Ok(mut log) = self.call_log.lock() {
            log.push(call);
        }
    }
}

#[async_trait]
impl RelayNode for MockRelayNode {
    async fn wake(&self, host: &str) -> AppResult<()> {
        self.log_call(format!("wake:{host}"));
        self.wake.run("wake").await
    }

    async fn keep_awake(&self, host: &str, duration: Duration) -> AppResult<()> {
        self.log_call(format!("keep_awake:{host}:{}", duration.as_millis()));
        Ok(())
    }

    async fn resolve(&self, host: &str) -> AppResult<Box<dyn RelayService>> {
        self.log_call(format!("resolve:{host}"));
        self.resolve.run("resolve").await?;
        Ok(Box::new(MockRelayService {
            step: self.enqueue,
            delivered: Arc::clone(&self.delivered),
        }))
    }
}

struct MockRelayService {
    step: MockStep,
    delivered: Arc<Mutex<Vec<Bytes>>>,
}

#[async_trait]
impl RelayService for MockRelayService {
    async fn enqueue(&self, message: Bytes) -> AppResult<()> {
        self.step.run("enqueue").await?;
        self.delivered
            .lock()
            .map_err(|_| DaqError::DispatchUnavailable("delivery log poisoned".into()))?
            .push(message);
        Ok(())
    }
}

// =============================================================================
// MemoryAlertSink - Collected Alerts
// =============================================================================

/// [`AlertSink`] that keeps every alert in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryAlertSink {
    alerts: Arc<Mutex<Vec<AlertMessage>>>,
}

impl MemoryAlertSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Alerts submitted so far.
    pub fn alerts(&self) -> Vec<AlertMessage> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    /// Payloads parsed as JSON.
    pub fn payloads(&self) -> Vec<serde_json::Value> {
        self.alerts()
            .iter()
            .filter_map(|a| serde_json::from_slice(&a.payload).ok())
            .collect()
    }
}

impl AlertSink for MemoryAlertSink {
    fn submit(&self, alert: AlertMessage) -> Admission {
        match self.alerts.lock() {
            Ok(mut alerts) => {
                alerts.push(alert);
                Admission::Accepted
            }
            Err(_) => Admission::Rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn scripted_transport_replays_then_times_out() {
        let mut transport = MockTransport::scripted([MockReply::Data(b"1.0\r\n".to_vec())]);
        let handle = transport.clone();
        let mut buf = Vec::new();
        transport
            .read_until(&mut buf, b"\r\n", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(buf, b"1.0\r\n");
        assert!(transport
            .read_until(&mut buf, b"\r\n", Duration::from_millis(100))
            .await
            .is_err());
        assert_eq!(handle.count_calls("read_until"), 2);
    }

    #[tokio::test]
    async fn relay_records_deliveries() {
        let relay = MockRelayNode::new();
        relay.wake("shore").await.unwrap();
        let service = relay.resolve("shore").await.unwrap();
        service.enqueue(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(relay.delivered(), vec![Bytes::from_static(b"hi")]);
        assert_eq!(relay.get_call_log(), vec!["wake:shore", "resolve:shore"]);
    }
}
