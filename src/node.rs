//! Node runtime: one sampling session per instrument.
//!
//! A [`Node`] owns the alert dispatcher and an [`InstrumentSession`] for
//! every enabled instrument. Each session runs on its own task and performs
//! one tick at a time (cycle, parse, log, detect), so cycles of the same
//! instrument never overlap. Shutdown is signalled through a `watch`
//! channel; sessions finish their current tick, release power and exit.

use crate::config::{InstrumentSettings, PowerSwitchSettings, Settings};
use crate::cycle::{CycleReport, SamplingCycle};
use crate::detector::DetectorEvent;
use crate::dispatch::{AlertSink, DispatchStats, Dispatcher, TcpRelayNode};
use crate::error::{AppResult, DaqError};
use crate::error_recovery::Recoverable;
use crate::instrument::AsciiDriver;
use crate::monitor::{AlertRoute, EventMonitor};
use crate::parser::{RegexSampleParser, SampleLog, SampleParser, ScalarSample};
use crate::power::{NoPowerSwitch, PowerController, PowerSwitch, SysfsPowerSwitch};
use crate::schedule::{SampleSchedule, ScheduleClock};
use crate::transport::{ReconnectingTransport, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Shared, explicit node state handed to each session.
#[derive(Clone)]
pub struct NodeContext {
    /// Node id, for logs.
    pub node_id: i64,
    /// Relay host that receives alerts.
    pub relay_host: String,
    /// Alert consumer, normally the [`Dispatcher`].
    pub alerts: Arc<dyn AlertSink>,
}

/// What one tick produced.
#[derive(Debug, Clone)]
pub struct TickReport {
    /// Sampling cycle result.
    pub cycle: CycleReport,
    /// Parsed sample, if the cycle succeeded and the record parsed.
    pub sample: Option<ScalarSample>,
    /// Detector transition caused by the sample.
    pub event: Option<DetectorEvent>,
}

/// Sampling, logging and detection for one instrument.
pub struct InstrumentSession {
    id: i64,
    name: String,
    clock: ScheduleClock,
    cycle: SamplingCycle,
    parser: Box<dyn SampleParser>,
    log: Option<Box<dyn SampleLog>>,
    monitor: Option<EventMonitor>,
}

impl InstrumentSession {
    /// Assemble a session from parts.
    pub fn new(
        id: i64,
        clock: ScheduleClock,
        cycle: SamplingCycle,
        parser: Box<dyn SampleParser>,
        log: Option<Box<dyn SampleLog>>,
        monitor: Option<EventMonitor>,
    ) -> Self {
        Self {
            id,
            name: cycle.name().to_string(),
            clock,
            cycle,
            parser,
            log,
            monitor,
        }
    }

    /// Build a session from settings over an already opened link.
    pub fn build(
        settings: &InstrumentSettings,
        ctx: &NodeContext,
        transport: Box<dyn Transport>,
        switch: Arc<dyn PowerSwitch>,
    ) -> AppResult<Self> {
        let schedule = settings.sample_schedule()?;
        let driver = Arc::new(AsciiDriver::from_settings(&settings.name, &settings.protocol)?);
        let parser = RegexSampleParser::new(
            &settings.parser.pattern,
            &settings.parser.parameter,
            &settings.parser.units,
        )?;
        let power = PowerController::new(settings.power_policy, switch, settings.start_delay());
        let cycle = SamplingCycle::new(driver, transport, power, settings.cycle_config());

        let monitor = settings.detector.as_ref().map(|detector| {
            EventMonitor::new(
                parser.parameter().to_string(),
                detector.clone(),
                schedule.nominal_period_secs(),
                AlertRoute {
                    origin_id: settings.id,
                    destination: ctx.relay_host.clone(),
                    sink: Arc::clone(&ctx.alerts),
                },
            )
        });

        info!(
            node = ctx.node_id,
            instrument = %settings.name,
            schedule = %schedule,
            power = ?settings.power_policy,
            detection = monitor.as_ref().is_some_and(EventMonitor::enabled),
            "instrument session ready"
        );
        Ok(Self::new(
            settings.id,
            ScheduleClock::new(schedule),
            cycle,
            Box::new(parser),
            open_log(settings)?,
            monitor,
        ))
    }

    /// Open the instrument link and power switch, then build the session.
    ///
    /// A link that cannot be opened yet is retried by later cycles; only
    /// errors that retrying cannot fix are returned.
    pub async fn from_settings(settings: &InstrumentSettings, ctx: &NodeContext) -> AppResult<Self> {
        let mut transport = ReconnectingTransport::new(settings.connection.clone());
        match transport.recover().await {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                warn!(instrument = %settings.name, error = %e, "instrument link unavailable; retrying on each cycle");
            }
            Err(e) => return Err(e),
        }
        let switch: Arc<dyn PowerSwitch> = match &settings.power_switch {
            PowerSwitchSettings::None => Arc::new(NoPowerSwitch),
            PowerSwitchSettings::Sysfs { path, active_low } => {
                Arc::new(SysfsPowerSwitch::new(path).active_low(*active_low))
            }
        };
        Self::build(settings, ctx, Box::new(transport), switch)
    }

    /// Instrument id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Instrument name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Event monitor, if detection is configured.
    pub fn monitor(&self) -> Option<&EventMonitor> {
        self.monitor.as_ref()
    }

    /// Sampling cycle.
    pub fn cycle(&self) -> &SamplingCycle {
        &self.cycle
    }

    /// Active sampling schedule.
    pub fn schedule(&self) -> &SampleSchedule {
        self.clock.schedule()
    }

    /// Replace the sampling schedule.
    ///
    /// If the nominal interval changes, the event detector is reset on the
    /// next sample.
    pub fn set_schedule(&mut self, schedule: SampleSchedule) {
        info!(instrument = %self.name, old = %self.clock.schedule(), new = %schedule, "sampling schedule changed");
        self.clock.set_schedule(schedule);
    }

    /// Put power into its resting state for the session.
    pub async fn start(&mut self) -> AppResult<()> {
        self.cycle.power_mut().start_session().await
    }

    /// One tick: sample, parse, log and feed the detector.
    pub async fn run_once(&mut self) -> TickReport {
        let cycle = self.cycle.run_cycle().await;
        let mut tick = TickReport {
            sample: None,
            event: None,
            cycle,
        };
        let Some(raw) = tick.cycle.raw() else {
            return tick;
        };

        let sample = match self.parser.parse(raw, tick.cycle.finished_ms) {
            Ok(sample) => sample,
            Err(e) => {
                warn!(instrument = %self.name, error = %e, "failed to parse sample");
                return tick;
            }
        };

        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.append(&sample) {
                error!(instrument = %self.name, error = %e, "failed to log sample");
            }
        }

        if let Some(monitor) = self.monitor.as_mut() {
            let interval = self.clock.schedule().nominal_period_secs();
            tick.event = monitor.process_sample(&sample, interval);
        }
        tick.sample = Some(sample);
        tick
    }

    /// Tick on schedule until `shutdown` becomes `true`, then tear down.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        if let Err(e) = self.start().await {
            error!(instrument = %self.name, error = %e, "failed to set initial power state");
        }
        info!(instrument = %self.name, schedule = %self.clock.schedule(), "sampling started");

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.clock.wait_next() => {
                    self.run_once().await;
                }
            }
        }
        self.shutdown().await
    }

    /// Flush the log and release power.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        info!(instrument = %self.name, stats = ?self.cycle.stats(), "sampling stopped");
        let mut errors = Vec::new();
        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.flush() {
                errors.push(e);
            }
        }
        if let Err(e) = self.cycle.power_mut().end_session().await {
            errors.push(e);
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(DaqError::ShutdownFailed(errors)),
        }
    }
}

#[cfg(feature = "storage_csv")]
fn open_log(settings: &InstrumentSettings) -> AppResult<Option<Box<dyn SampleLog>>> {
    use crate::parser::CsvSampleLog;

    match &settings.log {
        Some(log) => Ok(Some(Box::new(CsvSampleLog::open(&log.path)?))),
        None => Ok(None),
    }
}

#[cfg(not(feature = "storage_csv"))]
fn open_log(settings: &InstrumentSettings) -> AppResult<Option<Box<dyn SampleLog>>> {
    if settings.log.is_some() {
        warn!(instrument = %settings.name, "sample log configured but storage_csv is disabled");
    }
    Ok(None)
}

/// All sessions of this node plus the alert dispatcher.
pub struct Node {
    node_id: i64,
    dispatcher: Dispatcher,
    sessions: Vec<InstrumentSession>,
    shutdown_tx: watch::Sender<bool>,
    drain_timeout: Duration,
}

impl Node {
    /// Build the dispatcher and a session for every enabled instrument.
    ///
    /// Instruments whose settings cannot be turned into a session are logged
    /// and skipped. Unreachable links are not fatal; they are retried.
    pub async fn from_settings(settings: &Settings) -> AppResult<Self> {
        let d = &settings.dispatcher;
        let relay = TcpRelayNode::new(d.wake_port, d.relay_port, d.delivery_timeout);
        let dispatcher = Dispatcher::new(Arc::new(relay), d.dispatcher_config())?;
        let ctx = NodeContext {
            node_id: settings.node.id,
            relay_host: d.relay_host.clone(),
            alerts: Arc::new(dispatcher.clone()),
        };

        let mut sessions = Vec::new();
        for instrument in settings.enabled_instruments() {
            match InstrumentSession::from_settings(instrument, &ctx).await {
                Ok(session) => sessions.push(session),
                Err(e) => error!(instrument = %instrument.name, error = %e, "instrument not started"),
            }
        }
        if sessions.is_empty() {
            warn!(node = settings.node.id, "no instruments started");
        }
        Ok(Self::new(settings.node.id, dispatcher, sessions, d.delivery_timeout))
    }

    /// Node from prebuilt parts.
    pub fn new(
        node_id: i64,
        dispatcher: Dispatcher,
        sessions: Vec<InstrumentSession>,
        drain_timeout: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            node_id,
            dispatcher,
            sessions,
            shutdown_tx,
            drain_timeout,
        }
    }

    /// Sender that stops the node when set to `true`.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Number of running sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Dispatcher counters.
    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// Run until Ctrl-C or the shutdown handle fires.
    pub async fn run(self) -> AppResult<()> {
        let Node {
            node_id,
            dispatcher,
            sessions,
            shutdown_tx,
            drain_timeout,
        } = self;

        info!(node = node_id, instruments = sessions.len(), "node running");
        let mut tasks = JoinSet::new();
        for session in sessions {
            tasks.spawn(session.run(shutdown_tx.subscribe()));
        }

        let mut stop = shutdown_tx.subscribe();
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "failed to listen for Ctrl-C");
                }
                info!(node = node_id, "interrupt received");
            }
            _ = stop.wait_for(|stopped| *stopped) => {}
        }
        shutdown_tx.send_replace(true);

        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(DaqError::Io(std::io::Error::other(e))),
            }
        }

        if !dispatcher.drain(drain_timeout).await {
            warn!(stats = ?dispatcher.stats(), "alerts still in flight at shutdown");
        }
        info!(node = node_id, stats = ?dispatcher.stats(), "node stopped");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MemoryAlertSink, MockReply, MockTransport};
    use crate::parser::MemorySampleLog;
    use crate::power::RecordingPowerSwitch;

    const INSTRUMENT: &str = r#"
        [application]
        name = "session test"

        [[instruments]]
        id = 7
        name = "transmissometer"
        schedule = "10000"
        connection = { type = "tcp", address = "127.0.0.1:1" }
        protocol = { request = "S\\r" }
        parser = { pattern = 'V=(\S+)', parameter = "voltage", units = "V" }
        detector = { sta_width_sec = 30, lta_width_sec = 50, trigger_ratio = 1.5, detrigger_ratio = 1.05, max_trigger_sec = 1000, status_interval_sec = 0 }
    "#;

    fn session(replies: Vec<MockReply>) -> (InstrumentSession, MemoryAlertSink) {
        let settings = Settings::from_toml_str(INSTRUMENT).unwrap();
        let sink = MemoryAlertSink::new();
        let ctx = NodeContext {
            node_id: 1,
            relay_host: "shore".into(),
            alerts: Arc::new(sink.clone()),
        };
        let session = InstrumentSession::build(
            &settings.instruments[0],
            &ctx,
            Box::new(MockTransport::scripted(replies)),
            Arc::new(RecordingPowerSwitch::new()),
        )
        .unwrap();
        (session, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn tick_parses_logs_and_detects() {
        let replies = [1.0, 1.0, 1.0, 1.0, 1.0, 10.0, 10.0]
            .iter()
            .map(|v| MockReply::Data(format!("V={v}\r\n").into_bytes()))
            .collect();
        let (mut session, sink) = session(replies);
        let log = MemorySampleLog::new();
        session.log = Some(Box::new(log.clone()));

        let mut events = Vec::new();
        for _ in 0..7 {
            let tick = session.run_once().await;
            assert!(tick.sample.is_some());
            events.extend(tick.event);
        }
        assert_eq!(log.samples().len(), 7);
        assert_eq!(log.samples()[5].value, 10.0);
        assert_eq!(events.len(), 1);
        assert_eq!(sink.payloads()[0]["kind"], "triggered");
        assert_eq!(sink.alerts()[0].origin_id, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn unparsable_record_yields_no_sample() {
        let (mut session, sink) = session(vec![MockReply::Data(b"garbage\r\n".to_vec())]);
        let tick = session.run_once().await;
        assert!(tick.cycle.is_success());
        assert!(tick.sample.is_none());
        assert!(sink.alerts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_change_resets_detector() {
        let replies = (0..4).map(|_| MockReply::Data(b"V=1.0\r\n".to_vec())).collect();
        let (mut session, sink) = session(replies);
        for _ in 0..3 {
            assert!(session.run_once().await.sample.is_some());
        }
        let detector = session.monitor().unwrap().detector().unwrap();
        assert_eq!(detector.state().sample_count, 3);

        session.set_schedule(SampleSchedule::every(Duration::from_secs(5)).unwrap());
        assert_eq!(session.schedule().nominal_period_secs(), 5);
        assert!(session.run_once().await.sample.is_some());

        let monitor = session.monitor().unwrap();
        assert_eq!(monitor.sample_interval_sec(), 5);
        assert_eq!(monitor.detector().unwrap().state().sample_count, 1);
        assert_eq!(monitor.detector().unwrap().params().sta_width, 6);
        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["kind"], "reset");
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let (session, _) = session(Vec::new());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(session.run(rx));
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send_replace(true);
        handle.await.unwrap().unwrap();
    }
}
