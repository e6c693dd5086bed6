//! End-to-end tests: a fake instrument on TCP, sampled by a node session.

use mooring_daq::config::Settings;
use mooring_daq::mock::MemoryAlertSink;
use mooring_daq::node::{InstrumentSession, Node, NodeContext};
use mooring_daq::parser::read_values;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Answers every `TS\r` request with the next value of `values`, then `V=1`.
///
/// The first `hangups` connections are closed as soon as a request arrives.
fn serve(listener: TcpListener, values: Vec<f64>, hangups: usize) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut values = values.into_iter();
        let mut hangups = hangups;
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            while stream.read_exact(&mut byte).await.is_ok() {
                request.push(byte[0]);
                if !request.ends_with(b"TS\r") {
                    continue;
                }
                request.clear();
                if hangups > 0 {
                    hangups -= 1;
                    break;
                }
                let value = values.next().unwrap_or(1.0);
                let reply = format!("V={value}\r\n");
                if stream.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    })
}

async fn fake_instrument(values: Vec<f64>) -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("addr").to_string();
    (address, serve(listener, values, 0))
}

fn context(sink: &MemoryAlertSink) -> NodeContext {
    NodeContext {
        node_id: 12,
        relay_host: "shore".into(),
        alerts: Arc::new(sink.clone()),
    }
}

fn settings(address: &str, log: &Path, schedule: &str, detector: bool) -> Settings {
    let detector = if detector {
        "detector = { sta_width_sec = 30, lta_width_sec = 50, trigger_ratio = 1.5, \
         detrigger_ratio = 1.05, max_trigger_sec = 1000, status_interval_sec = 0 }"
    } else {
        ""
    };
    let toml = format!(
        r#"
        [application]
        name = "node test"

        [node]
        id = 12

        [dispatcher]
        enabled = false

        [[instruments]]
        id = 3
        name = "fluorometer"
        schedule = "{schedule}"
        sample_timeout_ms = 2000
        connection = {{ type = "tcp", address = "{address}" }}
        protocol = {{ request = "TS\\r" }}
        parser = {{ pattern = 'V=(\S+)', parameter = "chlorophyll", units = "ug/l" }}
        log = {{ path = "{log}" }}
        {detector}
        "#,
        log = log.display(),
    );
    let settings = Settings::from_toml_str(&toml).expect("settings");
    settings.validate().expect("valid settings");
    settings
}

#[tokio::test]
async fn test_session_samples_logs_and_alerts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("fluorometer.csv");
    let values = vec![1.0, 1.0, 1.0, 1.0, 1.0, 10.0, 10.0];
    let (address, _instrument) = fake_instrument(values.clone()).await;
    let settings = settings(&address, &log, "10000", true);

    let sink = MemoryAlertSink::new();
    let mut session = InstrumentSession::from_settings(&settings.instruments[0], &context(&sink))
        .await
        .expect("session");
    session.start().await.expect("start");

    let mut transitions = 0;
    for _ in 0..values.len() {
        let tick = session.run_once().await;
        assert!(tick.cycle.is_success());
        transitions += usize::from(tick.event.is_some());
    }
    session.shutdown().await.expect("shutdown");

    let logged: Vec<f64> = read_values(&log).expect("log").into_iter().map(|(_, v)| v).collect();
    assert_eq!(logged, values);
    assert_eq!(transitions, 1);
    let payloads = sink.payloads();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0]["kind"], "triggered");
    assert_eq!(payloads[0]["parameter"], "chlorophyll");
    assert_eq!(sink.alerts()[0].origin_id, 3);
}

#[tokio::test]
async fn test_node_runs_until_shutdown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("fluorometer.csv");
    let (address, _instrument) = fake_instrument(Vec::new()).await;
    let settings = settings(&address, &log, "200", false);

    let node = Node::from_settings(&settings).await.expect("node");
    assert_eq!(node.session_count(), 1);
    let stop = node.shutdown_handle();
    let running = tokio::spawn(node.run());

    tokio::time::sleep(Duration::from_millis(900)).await;
    stop.send_replace(true);
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("node stopped in time")
        .expect("node task")
        .expect("clean shutdown");

    let logged = read_values(&log).expect("log");
    assert!(logged.len() >= 2, "only {} samples logged", logged.len());
}

#[tokio::test]
async fn test_unreachable_instrument_is_kept_and_retried() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("fluorometer.csv");
    // Reserve a port, then close it so the first connection is refused.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("addr").to_string();
    drop(listener);
    let settings = settings(&address, &log, "1000", false);

    let node = Node::from_settings(&settings).await.expect("node");
    assert_eq!(node.session_count(), 1);

    let sink = MemoryAlertSink::new();
    let mut session = InstrumentSession::from_settings(&settings.instruments[0], &context(&sink))
        .await
        .expect("session");
    let tick = session.run_once().await;
    assert!(!tick.cycle.is_success());

    let listener = TcpListener::bind(&address).await.expect("rebind");
    let _instrument = serve(listener, vec![2.5], 0);
    let tick = session.run_once().await;
    assert!(tick.cycle.is_success());
    assert_eq!(tick.sample.expect("sample").value, 2.5);
}

#[tokio::test]
async fn test_session_reconnects_after_link_drop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("fluorometer.csv");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("addr").to_string();
    let _instrument = serve(listener, vec![4.0, 5.0], 1);
    let settings = settings(&address, &log, "1000", false);

    let sink = MemoryAlertSink::new();
    let mut session = InstrumentSession::from_settings(&settings.instruments[0], &context(&sink))
        .await
        .expect("session");

    let tick = session.run_once().await;
    assert!(tick.cycle.is_success());
    assert_eq!(tick.cycle.attempts, 2);
    assert_eq!(tick.sample.expect("sample").value, 4.0);

    let tick = session.run_once().await;
    assert_eq!(tick.sample.expect("sample").value, 5.0);
    assert_eq!(session.cycle().stats().retries, 1);
}
