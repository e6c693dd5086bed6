//! Best-effort alert relay to the shore node.
//!
//! [`Dispatcher::enqueue`] is synchronous and never waits: an alert is either
//! admitted to the worker pool or dropped on the spot. The pool is a
//! semaphore with `pool_size` permits; each admitted alert runs on its own
//! task holding one permit for the whole delivery:
//!
//! 1. wake the relay host,
//! 2. ask it to stay awake for `keep_awake`,
//! 3. resolve a fresh handle to the relay service,
//! 4. prepend the header and hand the message over.
//!
//! Every step is bounded by `delivery_timeout`. A failure at any step is
//! logged and the alert is dropped; nothing is reported back to the caller.

use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

/// Length of the `origin_id | timestamp_ms` header.
pub const HEADER_LEN: usize = 16;

/// One alert bound for a relay host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertMessage {
    /// Id of the originating instrument.
    pub origin_id: i64,
    /// Creation time, epoch milliseconds.
    pub timestamp_ms: i64,
    /// Message body.
    pub payload: Bytes,
    /// Relay host name or address.
    pub destination: String,
}

impl AlertMessage {
    /// Build an alert.
    pub fn new(
        origin_id: i64,
        timestamp_ms: i64,
        payload: impl Into<Bytes>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            origin_id,
            timestamp_ms,
            payload: payload.into(),
            destination: destination.into(),
        }
    }

    /// Header followed by payload, as handed to the relay service.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_i64(self.origin_id);
        buf.put_i64(self.timestamp_ms);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Split an encoded message into `(origin_id, timestamp_ms, payload)`.
    pub fn decode(mut message: Bytes) -> Option<(i64, i64, Bytes)> {
        if message.len() < HEADER_LEN {
            return None;
        }
        let origin_id = message.get_i64();
        let timestamp_ms = message.get_i64();
        Some((origin_id, timestamp_ms, message))
    }
}

/// Handle to the store-and-forward service on a relay host.
#[async_trait]
pub trait RelayService: Send + Sync {
    /// Queue an encoded message for downlink.
    async fn enqueue(&self, message: Bytes) -> AppResult<()>;
}

/// Network operations against a relay host.
#[async_trait]
pub trait RelayNode: Send + Sync {
    /// Wake the host from low-power sleep.
    async fn wake(&self, host: &str) -> AppResult<()>;

    /// Ask the host to stay awake for `duration`.
    async fn keep_awake(&self, host: &str, duration: Duration) -> AppResult<()>;

    /// Obtain a fresh handle to the relay service on `host`.
    async fn resolve(&self, host: &str) -> AppResult<Box<dyn RelayService>>;
}

/// Relay reached with UDP wake datagrams and a length-prefixed TCP stream.
#[derive(Debug, Clone)]
pub struct TcpRelayNode {
    wake_port: u16,
    relay_port: u16,
    connect_timeout: Duration,
}

impl TcpRelayNode {
    /// Relay node using the given ports.
    pub fn new(wake_port: u16, relay_port: u16, connect_timeout: Duration) -> Self {
        Self {
            wake_port,
            relay_port,
            connect_timeout,
        }
    }

    async fn send_datagram(&self, host: &str, datagram: &[u8]) -> AppResult<()> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.send_to(datagram, (host, self.wake_port)).await?;
        Ok(())
    }
}

#[async_trait]
impl RelayNode for TcpRelayNode {
    async fn wake(&self, host: &str) -> AppResult<()> {
        debug!(host, port = self.wake_port, "sending wake datagram");
        self.send_datagram(host, b"WAKE").await
    }

    async fn keep_awake(&self, host: &str, duration: Duration) -> AppResult<()> {
        let datagram = format!("AWAKE {}", duration.as_millis());
        self.send_datagram(host, datagram.as_bytes()).await
    }

    async fn resolve(&self, host: &str) -> AppResult<Box<dyn RelayService>> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((host, self.relay_port)),
        )
        .await
        .map_err(|_| DaqError::DispatchUnavailable(format!("connect to {host} timed out")))?
        .map_err(|e| DaqError::DispatchUnavailable(format!("connect to {host}: {e}")))?;
        Ok(Box::new(TcpRelayService {
            stream: Mutex::new(stream),
        }))
    }
}

struct TcpRelayService {
    stream: Mutex<TcpStream>,
}

#[async_trait]
impl RelayService for TcpRelayService {
    async fn enqueue(&self, message: Bytes) -> AppResult<()> {
        let len = u32::try_from(message.len())
            .map_err(|_| DaqError::DispatchUnavailable("message too large".into()))?;
        let mut stream = self.stream.lock().await;
        stream.write_u32(len).await?;
        stream.write_all(&message).await?;
        stream.flush().await?;
        Ok(())
    }
}

/// Anything that accepts alerts without blocking.
pub trait AlertSink: Send + Sync {
    /// Submit `alert`; must return immediately.
    fn submit(&self, alert: AlertMessage) -> Admission;
}

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// When false, alerts are logged and never sent.
    pub enabled: bool,
    /// Concurrent deliveries; further alerts are rejected.
    pub pool_size: usize,
    /// How long the relay host is asked to stay awake.
    pub keep_awake: Duration,
    /// Bound on each delivery step.
    pub delivery_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pool_size: 10,
            keep_awake: Duration::from_secs(300),
            delivery_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of [`Dispatcher::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A worker took the alert.
    Accepted,
    /// Every worker was busy; the alert was dropped.
    Rejected,
    /// Shore messaging is off; the alert was only logged.
    Disabled,
}

/// Snapshot of dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Alerts admitted to the pool.
    pub accepted: u64,
    /// Alerts dropped at admission.
    pub rejected: u64,
    /// Alerts handed to a relay service.
    pub delivered: u64,
    /// Admitted alerts that failed at some step.
    pub failed: u64,
    /// Deliveries currently running.
    pub in_flight: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU64,
}

struct Inner {
    relay: Arc<dyn RelayNode>,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
    counters: Counters,
    handle: Handle,
}

/// Bounded, non-blocking alert relay. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher on the current tokio runtime.
    pub fn new(relay: Arc<dyn RelayNode>, config: DispatcherConfig) -> AppResult<Self> {
        let handle = Handle::try_current().map_err(|_| {
            DaqError::Configuration("dispatcher must be created inside a tokio runtime".into())
        })?;
        if config.pool_size == 0 {
            return Err(DaqError::Configuration(
                "dispatcher pool size must be at least 1".into(),
            ));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                relay,
                permits: Arc::new(Semaphore::new(config.pool_size)),
                config,
                counters: Counters::default(),
                handle,
            }),
        })
    }

    /// Whether alerts are sent at all.
    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    /// Hand `alert` to a free worker, or drop it.
    pub fn enqueue(&self, alert: AlertMessage) -> Admission {
        if !self.inner.config.enabled {
            info!(
                origin = alert.origin_id,
                payload = %String::from_utf8_lossy(&alert.payload),
                "shore messaging disabled; alert not sent"
            );
            return Admission::Disabled;
        }

        let permit = match Arc::clone(&self.inner.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    origin = alert.origin_id,
                    destination = %alert.destination,
                    pool_size = self.inner.config.pool_size,
                    "dispatcher pool exhausted; alert rejected"
                );
                return Admission::Rejected;
            }
        };

        self.inner.counters.accepted.fetch_add(1, Ordering::Relaxed);
        self.inner.counters.in_flight.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        self.inner.handle.spawn(async move {
            let _permit = permit;
            match inner.deliver(&alert).await {
                Ok(()) => {
                    inner.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(origin = alert.origin_id, destination = %alert.destination, "alert delivered");
                }
                Err(e) => {
                    inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        origin = alert.origin_id,
                        destination = %alert.destination,
                        error = %e,
                        "alert dropped"
                    );
                }
            }
            inner.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
        });
        Admission::Accepted
    }

    /// Current counters.
    pub fn stats(&self) -> DispatchStats {
        let c = &self.inner.counters;
        DispatchStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            in_flight: c.in_flight.load(Ordering::Relaxed),
        }
    }

    /// Wait up to `timeout` for in-flight deliveries to finish.
    ///
    /// Returns `true` if the pool drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let all = u32::try_from(self.inner.config.pool_size).unwrap_or(u32::MAX);
        match tokio::time::timeout(timeout, self.inner.permits.acquire_many(all)).await {
            Ok(Ok(_permits)) => true,
            Ok(Err(_)) | Err(_) => false,
        }
    }
}

impl AlertSink for Dispatcher {
    fn submit(&self, alert: AlertMessage) -> Admission {
        self.enqueue(alert)
    }
}

impl Inner {
    async fn deliver(&self, alert: &AlertMessage) -> AppResult<()> {
        let host = alert.destination.as_str();
        let limit = self.config.delivery_timeout;

        bounded("wake", limit, self.relay.wake(host)).await?;
        bounded(
            "keep_awake",
            limit,
            self.relay.keep_awake(host, self.config.keep_awake),
        )
        .await?;
        let service = bounded("resolve", limit, self.relay.resolve(host)).await?;
        bounded("enqueue", limit, service.enqueue(alert.encode())).await
    }
}

async fn bounded<T>(
    step: &'static str,
    limit: Duration,
    fut: impl Future<Output = AppResult<T>>,
) -> AppResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(DaqError::DispatchUnavailable(msg))) => Err(DaqError::DispatchUnavailable(msg)),
        Ok(Err(e)) => Err(DaqError::DispatchUnavailable(format!("{step}: {e}"))),
        Err(_) => Err(DaqError::DispatchUnavailable(format!(
            "{step} timed out after {} ms",
            limit.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockRelayNode, MockStep};
    use tracing_test::traced_test;

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            enabled: true,
            pool_size: 2,
            keep_awake: Duration::from_secs(60),
            delivery_timeout: Duration::from_secs(5),
        }
    }

    fn alert(n: i64) -> AlertMessage {
        AlertMessage::new(n, 1_700_000_000_000, Bytes::from_static(b"triggered"), "shore")
    }

    #[test]
    fn header_is_big_endian_ids() {
        let encoded = alert(1001).encode();
        assert_eq!(encoded.len(), HEADER_LEN + 9);
        assert_eq!(&encoded[..8], &1001i64.to_be_bytes());
        let (origin, ts, payload) = AlertMessage::decode(encoded).unwrap();
        assert_eq!(origin, 1001);
        assert_eq!(ts, 1_700_000_000_000);
        assert_eq!(payload, Bytes::from_static(b"triggered"));
        assert!(AlertMessage::decode(Bytes::from_static(b"short")).is_none());
    }

    #[tokio::test]
    async fn delivers_through_all_steps() {
        let relay = MockRelayNode::new();
        let dispatcher = Dispatcher::new(Arc::new(relay.clone()), config()).unwrap();
        assert_eq!(dispatcher.enqueue(alert(7)), Admission::Accepted);
        assert!(dispatcher.drain(Duration::from_secs(5)).await);

        assert_eq!(relay.delivered(), vec![alert(7).encode()]);
        assert_eq!(
            relay.get_call_log(),
            vec!["wake:shore", "keep_awake:shore:60000", "resolve:shore"]
        );
        let stats = dispatcher.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn resolves_fresh_service_per_delivery() {
        let relay = MockRelayNode::new();
        let dispatcher = Dispatcher::new(Arc::new(relay.clone()), config()).unwrap();
        dispatcher.enqueue(alert(1));
        assert!(dispatcher.drain(Duration::from_secs(5)).await);
        dispatcher.enqueue(alert(2));
        assert!(dispatcher.drain(Duration::from_secs(5)).await);
        let resolves = relay
            .get_call_log()
            .iter()
            .filter(|c| c.starts_with("resolve"))
            .count();
        assert_eq!(resolves, 2);
    }

    #[traced_test]
    #[tokio::test]
    async fn wake_failure_drops_alert() {
        let relay = MockRelayNode {
            wake: MockStep::Fail,
            ..MockRelayNode::new()
        };
        let dispatcher = Dispatcher::new(Arc::new(relay.clone()), config()).unwrap();
        assert_eq!(dispatcher.enqueue(alert(3)), Admission::Accepted);
        assert!(dispatcher.drain(Duration::from_secs(5)).await);
        assert!(relay.delivered().is_empty());
        assert_eq!(dispatcher.stats().failed, 1);
        assert!(logs_contain("alert dropped"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_step_is_bounded_by_delivery_timeout() {
        let relay = MockRelayNode {
            enqueue: MockStep::Hang,
            ..MockRelayNode::new()
        };
        let dispatcher = Dispatcher::new(Arc::new(relay), config()).unwrap();
        dispatcher.enqueue(alert(4));
        assert!(dispatcher.drain(Duration::from_secs(60)).await);
        let stats = dispatcher.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[traced_test]
    #[tokio::test]
    async fn disabled_dispatcher_only_logs() {
        let relay = MockRelayNode::new();
        let dispatcher = Dispatcher::new(
            Arc::new(relay.clone()),
            DispatcherConfig {
                enabled: false,
                ..config()
            },
        )
        .unwrap();
        assert_eq!(dispatcher.enqueue(alert(5)), Admission::Disabled);
        assert!(relay.get_call_log().is_empty());
        assert!(logs_contain("shore messaging disabled"));
    }

    #[test]
    fn requires_runtime_and_workers() {
        let relay: Arc<dyn RelayNode> = Arc::new(MockRelayNode::new());
        assert!(Dispatcher::new(Arc::clone(&relay), config()).is_err());

        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let _guard = rt.enter();
        assert!(Dispatcher::new(
            relay,
            DispatcherConfig {
                pool_size: 0,
                ..config()
            }
        )
        .is_err());
    }
}
