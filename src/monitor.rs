//! Per-parameter event monitoring.
//!
//! An [`EventMonitor`] owns the STA/LTA detector for one parameter of one
//! instrument and turns its transitions into alerts. It also:
//!
//! - rebuilds the detector when the sample interval changes,
//! - emits a status alert every `status_interval_sec` of sample time,
//! - runs disabled when the detector parameters are invalid for the current
//!   interval, without affecting sampling.

use crate::config::DetectorSettings;
use crate::detector::{
    DetectorEvent, DetectorListener, DetectorParams, DetectorState, Phase, StaLtaDetector,
    TransitionKind,
};
use crate::dispatch::{AlertMessage, AlertSink};
use crate::error::AppResult;
use crate::parser::ScalarSample;
use crate::schedule::now_ms;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Kind of alert payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Detector triggered.
    Triggered,
    /// Detector detriggered.
    Detriggered,
    /// Periodic summary.
    Status,
    /// Detector reset after a sample interval change.
    Reset,
    /// Detection switched off for this parameter.
    Disabled,
}

/// JSON body of every monitor alert.
#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload {
    /// Alert kind.
    pub kind: AlertKind,
    /// Monitored parameter.
    pub parameter: String,
    /// Detector phase after the event, if a detector is running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    /// Short-term average.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sta: Option<f64>,
    /// Long-term average.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lta: Option<f64>,
    /// STA/LTA ratio.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f64>,
    /// Samples since the last reset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_count: Option<u64>,
    /// Whether a detrigger was forced by the triggered limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forced: Option<bool>,
    /// Free-text detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AlertPayload {
    fn note(kind: AlertKind, parameter: &str, message: String) -> Self {
        Self {
            kind,
            parameter: parameter.to_string(),
            phase: None,
            sta: None,
            lta: None,
            ratio: None,
            sample_count: None,
            forced: None,
            message: Some(message),
        }
    }

    fn from_state(kind: AlertKind, parameter: &str, state: &DetectorState) -> Self {
        Self {
            kind,
            parameter: parameter.to_string(),
            phase: Some(state.phase),
            sta: Some(state.sta),
            lta: Some(state.lta),
            ratio: state.ratio(),
            sample_count: Some(state.sample_count),
            forced: None,
            message: None,
        }
    }
}

/// Where a monitor's alerts go.
#[derive(Clone)]
pub struct AlertRoute {
    /// Origin id stamped into the alert header.
    pub origin_id: i64,
    /// Relay host.
    pub destination: String,
    /// Alert consumer.
    pub sink: Arc<dyn AlertSink>,
}

impl AlertRoute {
    fn send(&self, payload: &AlertPayload) {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to encode alert payload");
                return;
            }
        };
        let admission = self.sink.submit(AlertMessage::new(
            self.origin_id,
            now_ms(),
            body,
            self.destination.clone(),
        ));
        debug!(kind = ?payload.kind, ?admission, "alert submitted");
    }
}

struct TransitionForwarder {
    parameter: String,
    route: AlertRoute,
}

impl DetectorListener for TransitionForwarder {
    fn on_transition(&mut self, event: &DetectorEvent, state: &DetectorState) {
        let (kind, forced) = match event.kind {
            TransitionKind::Triggered => (AlertKind::Triggered, None),
            TransitionKind::Detriggered { forced } => (AlertKind::Detriggered, Some(forced)),
        };
        let mut payload = AlertPayload::from_state(kind, &self.parameter, state);
        // Report the values that caused the transition, not the reset state.
        payload.sta = Some(event.sta);
        payload.lta = Some(event.lta);
        payload.ratio = Some(event.ratio);
        payload.forced = forced;
        self.route.send(&payload);
    }
}

/// Detector plus alerting for one parameter.
pub struct EventMonitor {
    parameter: String,
    settings: DetectorSettings,
    route: AlertRoute,
    sample_interval_sec: u64,
    detector: Option<StaLtaDetector>,
    sec_since_status: u64,
}

impl EventMonitor {
    /// Build a monitor for samples arriving every `sample_interval_sec`.
    ///
    /// Invalid detector parameters leave the monitor disabled and send a
    /// `disabled` alert.
    pub fn new(
        parameter: impl Into<String>,
        settings: DetectorSettings,
        sample_interval_sec: u64,
        route: AlertRoute,
    ) -> Self {
        let mut monitor = Self {
            parameter: parameter.into(),
            settings,
            route,
            sample_interval_sec,
            detector: None,
            sec_since_status: 0,
        };
        monitor.rebuild();
        monitor
    }

    /// Whether a detector is running.
    pub fn enabled(&self) -> bool {
        self.detector.is_some()
    }

    /// The running detector.
    pub fn detector(&self) -> Option<&StaLtaDetector> {
        self.detector.as_ref()
    }

    /// Sample interval the detector is sized for.
    pub fn sample_interval_sec(&self) -> u64 {
        self.sample_interval_sec
    }

    /// Change the status period and restart its countdown.
    pub fn set_status_interval(&mut self, status_interval_sec: u64) {
        self.settings.status_interval_sec = status_interval_sec;
        self.sec_since_status = 0;
    }

    /// Feed one sample taken at `sample_interval_sec` spacing.
    pub fn process_sample(
        &mut self,
        sample: &ScalarSample,
        sample_interval_sec: u64,
    ) -> Option<DetectorEvent> {
        if sample_interval_sec != self.sample_interval_sec {
            let message = format!(
                "sample interval changed from {} s to {} s; resetting event detector",
                self.sample_interval_sec, sample_interval_sec
            );
            info!(parameter = %self.parameter, "{message}");
            self.route
                .send(&AlertPayload::note(AlertKind::Reset, &self.parameter, message));
            self.sample_interval_sec = sample_interval_sec;
            self.rebuild();
        }

        let detector = self.detector.as_mut()?;
        let event = detector.add_sample(sample.value, sample.timestamp_ms);

        self.sec_since_status += self.sample_interval_sec;
        if self.settings.status_interval_sec > 0
            && self.sec_since_status >= self.settings.status_interval_sec
        {
            let state = detector.state();
            info!(parameter = %self.parameter, %state, "event detector status");
            self.route.send(&AlertPayload::from_state(
                AlertKind::Status,
                &self.parameter,
                &state,
            ));
            self.sec_since_status = 0;
        }
        event
    }

    fn rebuild(&mut self) {
        let s = &self.settings;
        let params = DetectorParams::from_seconds(
            s.sta_width_sec,
            s.lta_width_sec,
            s.trigger_ratio,
            s.detrigger_ratio,
            s.max_trigger_sec,
            self.sample_interval_sec,
        );
        self.sec_since_status = 0;
        self.detector = match params.and_then(StaLtaDetector::new) {
            Ok(mut detector) => {
                detector.add_listener(TransitionForwarder {
                    parameter: self.parameter.clone(),
                    route: self.route.clone(),
                });
                info!(parameter = %self.parameter, detector = %detector, "event detection enabled");
                Some(detector)
            }
            Err(e) => {
                warn!(parameter = %self.parameter, error = %e, "event detection disabled");
                self.route.send(&AlertPayload::note(
                    AlertKind::Disabled,
                    &self.parameter,
                    e.to_string(),
                ));
                None
            }
        };
    }
}

/// Run `values` through a fresh detector built from `settings`.
///
/// Returns every transition, in order. Used to tune detector settings
/// against logged data.
pub fn replay_values(
    settings: &DetectorSettings,
    sample_interval_sec: u64,
    values: impl IntoIterator<Item = (i64, f64)>,
) -> AppResult<Vec<DetectorEvent>> {
    let params = DetectorParams::from_seconds(
        settings.sta_width_sec,
        settings.lta_width_sec,
        settings.trigger_ratio,
        settings.detrigger_ratio,
        settings.max_trigger_sec,
        sample_interval_sec,
    )?;
    let mut detector = StaLtaDetector::new(params)?;
    Ok(values
        .into_iter()
        .filter_map(|(timestamp_ms, value)| detector.add_sample(value, timestamp_ms))
        .collect())
}
