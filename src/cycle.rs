//! One polling attempt against one instrument.
//!
//! ```text
//! IDLE → POWERING_UP → SYNCHRONIZING → REQUESTING → READING
//!      → {SUCCESS | FAILED} → POWERING_DOWN → IDLE
//! ```
//!
//! A failed attempt powers the instrument down and starts over from power-up,
//! up to `max_sample_tries` attempts. [`SamplingCycle::run_cycle`] never
//! returns an error: the outcome is reported in a [`CycleReport`] and the
//! scheduler always proceeds to its next tick.

use crate::error::{AppResult, DaqError};
use crate::error_recovery::{handle_recoverable_error, Recoverable, RetryPolicy};
use crate::instrument::InstrumentDriver;
use crate::power::PowerController;
use crate::schedule::now_ms;
use crate::transport::Transport;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    /// Between cycles.
    Idle,
    /// Asserting power and waiting for the instrument to settle.
    PoweringUp,
    /// Attention handshake.
    Synchronizing,
    /// Writing the sample request.
    Requesting,
    /// Waiting for the sample record.
    Reading,
    /// A record was read and validated.
    Success,
    /// The attempt failed.
    Failed,
    /// Returning power to its resting state.
    PoweringDown,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CyclePhase::Idle => "IDLE",
            CyclePhase::PoweringUp => "POWERING_UP",
            CyclePhase::Synchronizing => "SYNCHRONIZING",
            CyclePhase::Requesting => "REQUESTING",
            CyclePhase::Reading => "READING",
            CyclePhase::Success => "SUCCESS",
            CyclePhase::Failed => "FAILED",
            CyclePhase::PoweringDown => "POWERING_DOWN",
        };
        f.write_str(name)
    }
}

/// Timing and retry limits for a cycle.
#[derive(Debug, Clone)]
pub struct CycleConfig {
    /// Full attempts per cycle, each including a power cycle.
    pub max_sample_tries: u32,
    /// Deadline for reading one sample record.
    pub sample_timeout: Duration,
    /// Per-probe deadline of the attention handshake.
    pub attention_timeout: Duration,
    /// Probe count and backoff of the attention handshake.
    pub attention: RetryPolicy,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            max_sample_tries: 3,
            sample_timeout: Duration::from_secs(5),
            attention_timeout: Duration::from_secs(1),
            attention: RetryPolicy::default(),
        }
    }
}

/// State of the attempt in progress.
#[derive(Debug, Clone)]
pub struct CycleAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    /// When the attempt started.
    pub started: Instant,
    /// Deadline of the sample read, once requested.
    pub read_deadline: Option<Instant>,
    /// Bytes read for this attempt.
    pub raw: Vec<u8>,
}

impl CycleAttempt {
    fn new(attempt: u32) -> Self {
        Self {
            attempt,
            started: Instant::now(),
            read_deadline: None,
            raw: Vec::new(),
        }
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A validated raw record.
    Success {
        /// The record, terminator included.
        raw: Vec<u8>,
    },
    /// Every attempt failed.
    Failed {
        /// One message per failed attempt.
        errors: Vec<String>,
    },
}

/// Result of one [`SamplingCycle::run_cycle`].
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// How the cycle ended.
    pub outcome: CycleOutcome,
    /// Attempts made.
    pub attempts: u32,
    /// Wall-clock start, epoch milliseconds.
    pub started_ms: i64,
    /// Wall-clock end, epoch milliseconds.
    pub finished_ms: i64,
    /// Monotonic start.
    pub started_at: Instant,
    /// Monotonic end, after power-down.
    pub finished_at: Instant,
}

impl CycleReport {
    /// Whether a sample was acquired.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Success { .. })
    }

    /// The raw record, on success.
    pub fn raw(&self) -> Option<&[u8]> {
        match &self.outcome {
            CycleOutcome::Success { raw } => Some(raw),
            CycleOutcome::Failed { .. } => None,
        }
    }
}

/// Cumulative counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Cycles run.
    pub cycles: u64,
    /// Cycles that produced a sample.
    pub successes: u64,
    /// Cycles that exhausted their attempts.
    pub failures: u64,
    /// Attempts beyond the first.
    pub retries: u64,
}

struct Handshake<'a> {
    driver: &'a dyn InstrumentDriver,
    transport: &'a mut dyn Transport,
    timeout: Duration,
}

#[async_trait]
impl<'a> Recoverable<DaqError> for Handshake<'a> {
    async fn recover(&mut self) -> Result<(), DaqError> {
        self.driver.attention(&mut *self.transport, self.timeout).await
    }
}

/// Runs sampling cycles for one instrument.
pub struct SamplingCycle {
    driver: Arc<dyn InstrumentDriver>,
    transport: Box<dyn Transport>,
    power: PowerController,
    config: CycleConfig,
    phase: CyclePhase,
    initialized: bool,
    stats: CycleStats,
}

impl SamplingCycle {
    /// Assemble a cycle from its collaborators.
    pub fn new(
        driver: Arc<dyn InstrumentDriver>,
        transport: Box<dyn Transport>,
        power: PowerController,
        config: CycleConfig,
    ) -> Self {
        Self {
            driver,
            transport,
            power,
            config,
            phase: CyclePhase::Idle,
            initialized: false,
            stats: CycleStats::default(),
        }
    }

    /// Current state.
    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// Counters since construction.
    pub fn stats(&self) -> CycleStats {
        self.stats
    }

    /// Instrument name.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// Power controller, for session start and teardown.
    pub fn power_mut(&mut self) -> &mut PowerController {
        &mut self.power
    }

    /// Run one cycle to completion.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let name = self.driver.name().to_string();
        let max_tries = self.config.max_sample_tries.max(1);
        let started_ms = now_ms();
        let started_at = Instant::now();
        let mut errors = Vec::new();
        let mut outcome = None;
        let mut attempts = 0;

        self.stats.cycles += 1;
        for attempt in 1..=max_tries {
            attempts = attempt;
            if attempt > 1 {
                self.stats.retries += 1;
            }
            let mut state = CycleAttempt::new(attempt);
            let result = self.attempt(&mut state).await;
            self.finish_attempt().await;

            match result {
                Ok(()) => {
                    outcome = Some(CycleOutcome::Success { raw: state.raw });
                    break;
                }
                Err(e) => {
                    warn!(instrument = %name, attempt, max_tries, error = %e, "sampling attempt failed");
                    let retryable = e.is_retryable();
                    errors.push(e.to_string());
                    if !retryable {
                        break;
                    }
                }
            }
        }

        let outcome = match outcome {
            Some(outcome) => {
                self.stats.successes += 1;
                debug!(instrument = %name, attempts, "sample acquired");
                outcome
            }
            None => {
                self.stats.failures += 1;
                error!(instrument = %name, attempts, errors = ?errors, "sampling cycle failed: retry limit exceeded");
                CycleOutcome::Failed { errors }
            }
        };
        self.phase = CyclePhase::Idle;

        CycleReport {
            outcome,
            attempts,
            started_ms,
            finished_ms: now_ms(),
            started_at,
            finished_at: Instant::now(),
        }
    }

    async fn attempt(&mut self, state: &mut CycleAttempt) -> AppResult<()> {
        let driver = Arc::clone(&self.driver);

        self.phase = CyclePhase::PoweringUp;
        self.power.power_up().await?;
        // Every attempt starts from an empty input buffer.
        self.transport.clear_input().await?;

        self.phase = CyclePhase::Synchronizing;
        self.get_attention(driver.as_ref()).await?;
        if !self.initialized {
            info!(instrument = driver.name(), "initializing instrument");
            driver
                .initialize_instrument(self.transport.as_mut(), self.config.attention_timeout)
                .await?;
            self.initialized = true;
        }
        driver.prepare_to_sample(self.transport.as_mut()).await?;

        self.phase = CyclePhase::Requesting;
        driver.request_sample(self.transport.as_mut()).await?;

        self.phase = CyclePhase::Reading;
        state.read_deadline = Some(Instant::now() + self.config.sample_timeout);
        state.raw = driver
            .read_sample(self.transport.as_mut(), self.config.sample_timeout)
            .await?;
        if state.raw.is_empty() {
            return Err(DaqError::Protocol("read returned 0 bytes".into()));
        }
        driver.validate_sample(&state.raw)?;
        debug!(
            instrument = driver.name(),
            attempt = state.attempt,
            bytes = state.raw.len(),
            elapsed_ms = state.started.elapsed().as_millis() as u64,
            "sample read"
        );

        self.phase = CyclePhase::Success;
        Ok(())
    }

    /// Probe until the instrument answers or the handshake policy is spent.
    async fn get_attention(&mut self, driver: &dyn InstrumentDriver) -> AppResult<()> {
        let policy = self.config.attention.clone();
        let mut handshake = Handshake {
            driver,
            transport: self.transport.as_mut(),
            timeout: self.config.attention_timeout,
        };
        match handle_recoverable_error(&mut handshake, &policy).await {
            Ok(tries) => {
                debug!(instrument = driver.name(), tries, "instrument is listening");
                Ok(())
            }
            Err(e) => {
                debug!(instrument = driver.name(), error = %e, "attention handshake exhausted");
                Err(DaqError::AttentionFailed {
                    tries: policy.max_attempts.max(1),
                })
            }
        }
    }

    /// Post-sample hook and power-down; runs after every attempt.
    async fn finish_attempt(&mut self) {
        if self.phase != CyclePhase::Success {
            self.phase = CyclePhase::Failed;
        }
        if let Err(e) = self.driver.post_sample(self.transport.as_mut()).await {
            debug!(instrument = self.driver.name(), error = %e, "post-sample hook failed");
        }
        self.phase = CyclePhase::PoweringDown;
        if let Err(e) = self.power.power_down().await {
            error!(instrument = self.driver.name(), error = %e, "power-down failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolSettings;
    use crate::instrument::AsciiDriver;
    use crate::mock::{MockReply, MockTransport};
    use crate::power::{PowerPolicy, RecordingPowerSwitch};
    use tracing_test::traced_test;

    fn driver(probe: &str) -> Arc<dyn InstrumentDriver> {
        let settings = ProtocolSettings {
            probe: probe.into(),
            prompt: "S>".into(),
            request: "TS\\r".into(),
            terminator: "\\r\\n".into(),
            init_commands: Vec::new(),
        };
        Arc::new(AsciiDriver::from_settings("ctd", &settings).unwrap())
    }

    fn cycle(
        probe: &str,
        transport: MockTransport,
        policy: PowerPolicy,
    ) -> (SamplingCycle, RecordingPowerSwitch) {
        let switch = RecordingPowerSwitch::new();
        let power = PowerController::new(policy, Arc::new(switch.clone()), Duration::from_millis(100));
        let cycle = SamplingCycle::new(
            driver(probe),
            Box::new(transport),
            power,
            CycleConfig {
                max_sample_tries: 3,
                sample_timeout: Duration::from_secs(2),
                attention_timeout: Duration::from_millis(500),
                attention: RetryPolicy::with_attempts(3),
            },
        );
        (cycle, switch)
    }

    #[tokio::test(start_paused = true)]
    async fn successful_cycle_returns_record() {
        let transport = MockTransport::scripted([
            MockReply::Data(b"S>".to_vec()),
            MockReply::Data(b"3.9\r\n".to_vec()),
        ]);
        let log = transport.clone();
        let (mut cycle, _) = cycle("\\r", transport, PowerPolicy::WhenSampling);

        let report = cycle.run_cycle().await;
        assert!(report.is_success());
        assert_eq!(report.raw(), Some(&b"3.9\r\n"[..]));
        assert_eq!(report.attempts, 1);
        assert_eq!(cycle.phase(), CyclePhase::Idle);
        assert_eq!(log.count_calls("write:TS"), 1);
        assert_eq!(
            cycle.stats(),
            CycleStats {
                cycles: 1,
                successes: 1,
                failures: 0,
                retries: 0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_after_timeout_with_power_cycle() {
        let transport = MockTransport::scripted([
            MockReply::Silent,
            MockReply::Data(b"4.2\r\n".to_vec()),
        ]);
        let (mut cycle, switch) = cycle("", transport, PowerPolicy::WhenSampling);

        let report = cycle.run_cycle().await;
        assert!(report.is_success());
        assert_eq!(report.attempts, 2);
        assert_eq!(cycle.stats().retries, 1);

        let ons: Vec<bool> = switch.transitions().iter().map(|t| t.on).collect();
        assert_eq!(ons, vec![true, false, true, false]);
    }

    #[traced_test]
    #[tokio::test(start_paused = true)]
    async fn attention_failure_is_bounded() {
        let transport = MockTransport::silent();
        let log = transport.clone();
        let (mut cycle, _) = cycle("\\r", transport, PowerPolicy::Never);

        let report = cycle.run_cycle().await;
        assert!(!report.is_success());
        assert_eq!(report.attempts, 3);
        // 3 probes per handshake, 3 handshakes.
        assert_eq!(log.count_calls("write:\r"), 9);
        assert_eq!(log.count_calls("write:TS"), 0);
        assert!(logs_contain("retry limit exceeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_record_counts_as_failure() {
        let transport = MockTransport::scripted([
            MockReply::Data(b"S>\r\n".to_vec()),
            MockReply::Data(b"\r\n".to_vec()),
            MockReply::Data(b"5.0\r\n".to_vec()),
        ]);
        let (mut cycle, _) = cycle("", transport, PowerPolicy::Never);
        let report = cycle.run_cycle().await;
        assert_eq!(report.attempts, 3);
        assert_eq!(report.raw(), Some(&b"5.0\r\n"[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn each_attempt_clears_input_first() {
        let transport = MockTransport::silent();
        let log = transport.clone();
        let (mut cycle, _) = cycle("", transport, PowerPolicy::Never);
        assert!(!cycle.run_cycle().await.is_success());
        assert_eq!(log.count_calls("clear_input"), 3);

        log.push_reply(MockReply::Data(b"6.1\r\n".to_vec()));
        let report = cycle.run_cycle().await;
        assert_eq!(report.raw(), Some(&b"6.1\r\n"[..]));
        let calls = log.get_call_log();
        let last = calls.iter().rposition(|c| c == "clear_input").unwrap();
        assert_eq!(calls[last + 1], "write:TS\r");
    }

    #[test]
    fn phase_names() {
        assert_eq!(CyclePhase::PoweringDown.to_string(), "POWERING_DOWN");
        assert_eq!(CyclePhase::Synchronizing.to_string(), "SYNCHRONIZING");
    }
}
