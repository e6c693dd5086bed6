//! Streaming STA/LTA event detector.
//!
//! Each sample is pushed into a short-term and a long-term window. The ratio
//! of their averages arms the detector when it reaches `trigger_ratio` and
//! disarms it when it falls to `detrigger_ratio`. A detector that stays
//! triggered for more than `max_triggered_samples` is force-reset so an
//! alarm can never latch indefinitely.
//!
//! Windows that have not filled yet average over the samples they hold, so
//! the ratio is defined from the first sample on.
//!
//! Listeners run synchronously inside [`StaLtaDetector::add_sample`] and see
//! the post-transition [`DetectorState`].

use crate::error::{AppResult, DaqError};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info};

/// Fixed-capacity FIFO of samples with a running sum.
#[derive(Debug, Clone)]
pub struct RunningWindow {
    values: VecDeque<f64>,
    capacity: usize,
    sum: f64,
}

impl RunningWindow {
    /// Empty window holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
        }
    }

    /// Add a sample, evicting the oldest one when full.
    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            if let Some(oldest) = self.values.pop_front() {
                self.sum -= oldest;
            }
        }
        self.values.push_back(value);
        self.sum += value;
    }

    /// Average of the buffered samples; 0 when empty.
    pub fn average(&self) -> f64 {
        if self.values.is_empty() {
            0.0
        } else {
            self.sum / self.values.len() as f64
        }
    }

    /// Number of buffered samples.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no samples are buffered.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether the window holds `capacity` samples.
    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    /// Nominal width.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop all samples.
    pub fn clear(&mut self) {
        self.values.clear();
        self.sum = 0.0;
    }
}

/// Detector parameters in sample counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorParams {
    /// Short-term window width.
    pub sta_width: usize,
    /// Long-term window width.
    pub lta_width: usize,
    /// Ratio at or above which the detector triggers.
    pub trigger_ratio: f64,
    /// Ratio at or below which a triggered detector detriggers.
    pub detrigger_ratio: f64,
    /// Triggered samples tolerated before a forced reset.
    pub max_triggered_samples: u64,
}

impl DetectorParams {
    /// Derive sample-count parameters from widths in seconds.
    ///
    /// Fails when the sample interval is zero or is not strictly shorter
    /// than both windows.
    pub fn from_seconds(
        sta_width_sec: u64,
        lta_width_sec: u64,
        trigger_ratio: f64,
        detrigger_ratio: f64,
        max_trigger_sec: u64,
        sample_interval_sec: u64,
    ) -> AppResult<Self> {
        if sample_interval_sec == 0 {
            return Err(DaqError::Configuration(
                "sample interval must be at least one second".into(),
            ));
        }
        if sample_interval_sec >= sta_width_sec || sample_interval_sec >= lta_width_sec {
            return Err(DaqError::Configuration(format!(
                "sample interval ({sample_interval_sec} s) must be shorter than STA width \
                 ({sta_width_sec} s) and LTA width ({lta_width_sec} s)"
            )));
        }
        let params = Self {
            sta_width: usize::try_from(sta_width_sec / sample_interval_sec).unwrap_or(usize::MAX),
            lta_width: usize::try_from(lta_width_sec / sample_interval_sec).unwrap_or(usize::MAX),
            trigger_ratio,
            detrigger_ratio,
            max_triggered_samples: max_trigger_sec / sample_interval_sec,
        };
        params.validate()?;
        Ok(params)
    }

    /// Check widths and ratios.
    pub fn validate(&self) -> AppResult<()> {
        if self.sta_width == 0 || self.lta_width == 0 {
            return Err(DaqError::Configuration(
                "STA and LTA widths must be at least one sample".into(),
            ));
        }
        if self.sta_width >= self.lta_width {
            return Err(DaqError::Configuration(format!(
                "STA width ({}) must be less than LTA width ({})",
                self.sta_width, self.lta_width
            )));
        }
        if !(self.detrigger_ratio > 0.0) {
            return Err(DaqError::Configuration(format!(
                "detrigger ratio ({}) must be positive",
                self.detrigger_ratio
            )));
        }
        if !(self.trigger_ratio > self.detrigger_ratio) {
            return Err(DaqError::Configuration(format!(
                "trigger ratio ({}) must exceed detrigger ratio ({})",
                self.trigger_ratio, self.detrigger_ratio
            )));
        }
        if self.max_triggered_samples == 0 {
            return Err(DaqError::Configuration(
                "max triggered duration must cover at least one sample".into(),
            ));
        }
        Ok(())
    }
}

/// Detector phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Waiting for the ratio to reach the trigger threshold.
    Detriggered,
    /// An event is in progress.
    Triggered,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Detriggered => write!(f, "DETRIGGERED"),
            Phase::Triggered => write!(f, "TRIGGERED"),
        }
    }
}

/// Snapshot of detector state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DetectorState {
    /// Current phase.
    pub phase: Phase,
    /// Short-term average.
    pub sta: f64,
    /// Long-term average.
    pub lta: f64,
    /// Samples added since the last reset.
    pub sample_count: u64,
    /// Samples seen while triggered.
    pub triggered_sample_count: u64,
    /// Timestamp of the last transition, 0 if none.
    pub transition_time_ms: i64,
}

impl DetectorState {
    /// `sta / lta`, or `None` while the long-term average is zero.
    pub fn ratio(&self) -> Option<f64> {
        (self.lta != 0.0).then(|| self.sta / self.lta)
    }
}

impl fmt::Display for DetectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} sta={:.4} lta={:.4} ratio=",
            self.phase, self.sta, self.lta
        )?;
        match self.ratio() {
            Some(r) => write!(f, "{r:.4}")?,
            None => write!(f, "n/a")?,
        }
        write!(
            f,
            " samples={} triggered_samples={}",
            self.sample_count, self.triggered_sample_count
        )
    }
}

/// Kind of transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TransitionKind {
    /// The ratio reached the trigger threshold.
    Triggered,
    /// The event ended; `forced` when the triggered limit was exceeded.
    Detriggered {
        /// Whether the runaway-alarm guard ended the event.
        forced: bool,
    },
}

/// One phase transition, with the values that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DetectorEvent {
    /// What happened.
    #[serde(flatten)]
    pub kind: TransitionKind,
    /// Zero-based index of the sample since the last reset.
    pub sample_index: u64,
    /// Timestamp of the sample.
    pub timestamp_ms: i64,
    /// Short-term average at the transition.
    pub sta: f64,
    /// Long-term average at the transition.
    pub lta: f64,
    /// Ratio at the transition.
    pub ratio: f64,
}

/// Receives detector transitions synchronously.
pub trait DetectorListener: Send {
    /// Called after the detector has moved to its new state.
    fn on_transition(&mut self, event: &DetectorEvent, state: &DetectorState);
}

impl<F> DetectorListener for F
where
    F: FnMut(&DetectorEvent, &DetectorState) + Send,
{
    fn on_transition(&mut self, event: &DetectorEvent, state: &DetectorState) {
        self(event, state)
    }
}

/// Short-term/long-term average ratio detector with hysteresis.
pub struct StaLtaDetector {
    params: DetectorParams,
    sta: RunningWindow,
    lta: RunningWindow,
    phase: Phase,
    sample_count: u64,
    triggered_sample_count: u64,
    transition_time_ms: i64,
    listeners: Vec<Box<dyn DetectorListener>>,
}

impl fmt::Debug for StaLtaDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaLtaDetector")
            .field("params", &self.params)
            .field("state", &self.state())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl StaLtaDetector {
    /// Build a detector after validating `params`.
    pub fn new(params: DetectorParams) -> AppResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            sta: RunningWindow::new(params.sta_width),
            lta: RunningWindow::new(params.lta_width),
            phase: Phase::Detriggered,
            sample_count: 0,
            triggered_sample_count: 0,
            transition_time_ms: 0,
            listeners: Vec::new(),
        })
    }

    /// Register a transition listener.
    pub fn add_listener(&mut self, listener: impl DetectorListener + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Parameters in use.
    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> DetectorState {
        DetectorState {
            phase: self.phase,
            sta: self.sta.average(),
            lta: self.lta.average(),
            sample_count: self.sample_count,
            triggered_sample_count: self.triggered_sample_count,
            transition_time_ms: self.transition_time_ms,
        }
    }

    /// Feed one sample; returns the transition it caused, if any.
    pub fn add_sample(&mut self, value: f64, timestamp_ms: i64) -> Option<DetectorEvent> {
        let index = self.sample_count;
        self.sample_count += 1;
        self.sta.push(value);
        self.lta.push(value);

        let sta = self.sta.average();
        let lta = self.lta.average();
        if lta == 0.0 {
            return None;
        }
        let ratio = sta / lta;

        let kind = match self.phase {
            Phase::Detriggered if ratio >= self.params.trigger_ratio => {
                self.phase = Phase::Triggered;
                self.transition_time_ms = timestamp_ms;
                self.triggered_sample_count = 0;
                info!(sample = index, ratio, "detector triggered");
                TransitionKind::Triggered
            }
            Phase::Detriggered => return None,
            Phase::Triggered => {
                self.triggered_sample_count += 1;
                if ratio <= self.params.detrigger_ratio {
                    self.phase = Phase::Detriggered;
                    self.transition_time_ms = timestamp_ms;
                    info!(sample = index, ratio, "detector detriggered");
                    TransitionKind::Detriggered { forced: false }
                } else if self.triggered_sample_count > self.params.max_triggered_samples {
                    info!(
                        sample = index,
                        ratio,
                        triggered_samples = self.triggered_sample_count,
                        "detector exceeded max triggered samples; forcing reset"
                    );
                    self.reset();
                    self.transition_time_ms = timestamp_ms;
                    TransitionKind::Detriggered { forced: true }
                } else {
                    return None;
                }
            }
        };

        let event = DetectorEvent {
            kind,
            sample_index: index,
            timestamp_ms,
            sta,
            lta,
            ratio,
        };
        let state = self.state();
        for listener in &mut self.listeners {
            listener.on_transition(&event, &state);
        }
        Some(event)
    }

    /// Clear both windows and return to `Detriggered`.
    pub fn reset(&mut self) {
        debug!("resetting STA/LTA detector");
        self.sta.clear();
        self.lta.clear();
        self.phase = Phase::Detriggered;
        self.sample_count = 0;
        self.triggered_sample_count = 0;
    }
}

impl fmt::Display for StaLtaDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "STA/LTA(sta_width={}, lta_width={}, trigger={}, detrigger={}): {}",
            self.params.sta_width,
            self.params.lta_width,
            self.params.trigger_ratio,
            self.params.detrigger_ratio,
            self.state()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn params(max_triggered_samples: u64) -> DetectorParams {
        DetectorParams {
            sta_width: 3,
            lta_width: 5,
            trigger_ratio: 1.5,
            detrigger_ratio: 1.05,
            max_triggered_samples,
        }
    }

    fn feed(detector: &mut StaLtaDetector, values: &[f64]) -> Vec<DetectorEvent> {
        values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| detector.add_sample(*v, i as i64 * 1000))
            .collect()
    }

    #[test]
    fn window_averages_partial_then_full() {
        let mut w = RunningWindow::new(3);
        assert_eq!(w.average(), 0.0);
        w.push(3.0);
        assert_eq!(w.average(), 3.0);
        w.push(6.0);
        assert_eq!(w.average(), 4.5);
        w.push(9.0);
        w.push(12.0);
        assert!(w.is_full());
        assert_eq!(w.average(), 9.0);
        w.clear();
        assert!(w.is_empty());
    }

    #[test]
    fn triggers_once_at_first_crossing() {
        let mut detector = StaLtaDetector::new(params(100)).unwrap();
        let events = feed(
            &mut detector,
            &[1.0, 1.0, 1.0, 1.0, 1.0, 10.0, 10.0, 10.0, 10.0, 10.0],
        );
        let triggers: Vec<_> = events
            .iter()
            .filter(|e| e.kind == TransitionKind::Triggered)
            .collect();
        assert_eq!(triggers.len(), 1);
        // Index 5 has ratio 4/2.8 < 1.5; index 6 has 7/4.6 >= 1.5.
        assert_eq!(triggers[0].sample_index, 6);
        assert_eq!(triggers[0].timestamp_ms, 6000);
        assert!((triggers[0].ratio - 7.0 / 4.6).abs() < 1e-12);
    }

    #[test]
    fn stays_triggered_above_detrigger_ratio() {
        let mut detector = StaLtaDetector::new(params(100)).unwrap();
        for (i, v) in [1.0, 1.0, 1.0, 1.0, 1.0, 10.0, 10.0, 10.0, 10.0]
            .into_iter()
            .enumerate()
        {
            detector.add_sample(v, i as i64);
        }
        // Ratio at index 8 is 10/8.2, still above 1.05.
        assert_eq!(detector.phase(), Phase::Triggered);
        assert_eq!(detector.state().triggered_sample_count, 2);

        // Index 9: the LTA catches up, ratio 1.0.
        let event = detector.add_sample(10.0, 9).unwrap();
        assert_eq!(event.kind, TransitionKind::Detriggered { forced: false });
        assert_eq!(detector.phase(), Phase::Detriggered);
        assert_eq!(detector.state().transition_time_ms, 9);
    }

    #[test]
    fn runaway_alarm_is_force_reset() {
        let mut detector = StaLtaDetector::new(params(3)).unwrap();
        let events = feed(
            &mut detector,
            &[1.0, 1.0, 1.0, 1.0, 1.0, 10.0, 100.0, 1e3, 1e4, 1e5, 1e6],
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, TransitionKind::Triggered);
        assert_eq!(events[0].sample_index, 6);
        assert_eq!(events[1].kind, TransitionKind::Detriggered { forced: true });
        assert_eq!(events[1].sample_index, 10);
        // The ratio alone would have kept the detector triggered.
        assert!(events[1].ratio > 1.05);

        let state = detector.state();
        assert_eq!(state.phase, Phase::Detriggered);
        assert_eq!(state.sample_count, 0);
        assert_eq!(state.sta, 0.0);
        assert_eq!(state.lta, 0.0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut detector = StaLtaDetector::new(params(100)).unwrap();
        feed(&mut detector, &[1.0, 1.0, 1.0, 1.0, 1.0, 10.0, 10.0]);
        assert_eq!(detector.phase(), Phase::Triggered);
        detector.reset();
        let state = detector.state();
        assert_eq!(state.phase, Phase::Detriggered);
        assert_eq!(state.sta, 0.0);
        assert_eq!(state.lta, 0.0);
        assert_eq!(state.sample_count, 0);
        assert_eq!(state.triggered_sample_count, 0);
    }

    #[test]
    fn zero_lta_skips_transitions() {
        let mut detector = StaLtaDetector::new(params(100)).unwrap();
        for i in 0..5 {
            assert!(detector.add_sample(0.0, i).is_none());
        }
        assert_eq!(detector.state().ratio(), None);
        assert_eq!(detector.state().sample_count, 5);
    }

    #[test]
    fn listeners_see_new_state() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut detector = StaLtaDetector::new(params(100)).unwrap();
        detector.add_listener(move |event: &DetectorEvent, state: &DetectorState| {
            sink.lock().unwrap().push((event.kind, state.phase));
        });
        feed(
            &mut detector,
            &[1.0, 1.0, 1.0, 1.0, 1.0, 10.0, 10.0, 10.0, 10.0, 10.0],
        );
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (TransitionKind::Triggered, Phase::Triggered),
                (
                    TransitionKind::Detriggered { forced: false },
                    Phase::Detriggered
                ),
            ]
        );
    }

    #[test]
    fn invalid_params_rejected() {
        let mut p = params(3);
        p.sta_width = 0;
        assert!(StaLtaDetector::new(p).is_err());

        let mut p = params(3);
        p.sta_width = 5;
        assert!(StaLtaDetector::new(p).is_err());

        let mut p = params(3);
        p.trigger_ratio = 1.0;
        assert!(StaLtaDetector::new(p).is_err());

        let mut p = params(3);
        p.detrigger_ratio = 0.0;
        p.trigger_ratio = 2.0;
        assert!(StaLtaDetector::new(p).is_err());

        assert!(StaLtaDetector::new(params(0)).is_err());
    }

    #[test]
    fn from_seconds_derives_sample_counts() {
        let p = DetectorParams::from_seconds(300, 3600, 2.0, 1.2, 1800, 60).unwrap();
        assert_eq!(p.sta_width, 5);
        assert_eq!(p.lta_width, 60);
        assert_eq!(p.max_triggered_samples, 30);
    }

    #[test]
    fn from_seconds_rejects_interval_not_shorter_than_windows() {
        assert!(DetectorParams::from_seconds(60, 3600, 2.0, 1.2, 1800, 60).is_err());
        assert!(DetectorParams::from_seconds(300, 120, 2.0, 1.2, 1800, 200).is_err());
        assert!(DetectorParams::from_seconds(300, 3600, 2.0, 1.2, 1800, 0).is_err());
    }

    #[test]
    fn display_includes_phase_and_ratio() {
        let mut detector = StaLtaDetector::new(params(100)).unwrap();
        detector.add_sample(2.0, 0);
        let text = detector.to_string();
        assert!(text.contains("DETRIGGERED"));
        assert!(text.contains("ratio=1.0000"));
    }
}
