//! Instrument power management.
//!
//! A [`PowerController`] applies the instrument's [`PowerPolicy`] around each
//! sampling attempt:
//!
//! | policy          | session start | before a cycle      | after a cycle |
//! |-----------------|---------------|---------------------|---------------|
//! | `Never`         | released      | released            | released      |
//! | `WhenSampling`  | released      | asserted + settle   | released      |
//! | `Always`        | asserted      | asserted (no-op)    | asserted      |
//!
//! The physical switch is abstracted behind [`PowerSwitch`] so that nodes can
//! drive a GPIO line, a relay board, or nothing at all for self-powered
//! instruments.

use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// When this subsystem may assert instrument power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PowerPolicy {
    /// Self-powered instrument; power is never asserted.
    Never,
    /// Power is asserted only while a sampling cycle runs.
    #[default]
    WhenSampling,
    /// Power stays asserted for the whole session.
    Always,
}

/// Capability: switch instrument power.
#[async_trait]
pub trait PowerSwitch: Send + Sync {
    /// Connect power to the instrument.
    async fn assert_power(&self) -> AppResult<()>;

    /// Disconnect power from the instrument.
    async fn release_power(&self) -> AppResult<()>;
}

/// Switch for instruments whose power is not controlled by the node.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPowerSwitch;

#[async_trait]
impl PowerSwitch for NoPowerSwitch {
    async fn assert_power(&self) -> AppResult<()> {
        Ok(())
    }

    async fn release_power(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Drives a GPIO line through its sysfs `value` file (`1` = on, `0` = off).
#[derive(Debug, Clone)]
pub struct SysfsPowerSwitch {
    path: PathBuf,
    active_low: bool,
}

impl SysfsPowerSwitch {
    /// Switch writing to `path`, e.g. `/sys/class/gpio/gpio17/value`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            active_low: false,
        }
    }

    /// Invert the written level for active-low relay boards.
    pub fn active_low(mut self, active_low: bool) -> Self {
        self.active_low = active_low;
        self
    }

    async fn write_level(&self, on: bool) -> AppResult<()> {
        let level = if on != self.active_low { "1" } else { "0" };
        tokio::fs::write(&self.path, level).await.map_err(|e| {
            DaqError::Power(format!("failed to write {}: {e}", self.path.display()))
        })
    }
}

#[async_trait]
impl PowerSwitch for SysfsPowerSwitch {
    async fn assert_power(&self) -> AppResult<()> {
        self.write_level(true).await
    }

    async fn release_power(&self) -> AppResult<()> {
        self.write_level(false).await
    }
}

/// One recorded power transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerTransition {
    /// `true` when power was asserted.
    pub on: bool,
    /// When the switch was driven.
    pub at: Instant,
}

/// In-memory switch that records every transition, for tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct RecordingPowerSwitch {
    transitions: Arc<Mutex<Vec<PowerTransition>>>,
}

impl RecordingPowerSwitch {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All transitions so far, oldest first.
    pub fn transitions(&self) -> Vec<PowerTransition> {
        self.transitions
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    /// Whether power was ever asserted.
    pub fn ever_asserted(&self) -> bool {
        self.transitions().iter().any(|t| t.on)
    }

    fn record(&self, on: bool) -> AppResult<()> {
        self.transitions
            .lock()
            .map_err(|_| DaqError::Power("transition log poisoned".into()))?
            .push(PowerTransition {
                on,
                at: Instant::now(),
            });
        Ok(())
    }
}

#[async_trait]
impl PowerSwitch for RecordingPowerSwitch {
    async fn assert_power(&self) -> AppResult<()> {
        self.record(true)
    }

    async fn release_power(&self) -> AppResult<()> {
        self.record(false)
    }
}

/// Applies a [`PowerPolicy`] to a [`PowerSwitch`].
pub struct PowerController {
    policy: PowerPolicy,
    switch: Arc<dyn PowerSwitch>,
    start_delay: Duration,
    asserted: bool,
    power_requests: u64,
}

impl PowerController {
    /// Controller with the given policy, switch and settle time.
    pub fn new(policy: PowerPolicy, switch: Arc<dyn PowerSwitch>, start_delay: Duration) -> Self {
        Self {
            policy,
            switch,
            start_delay,
            asserted: false,
            power_requests: 0,
        }
    }

    /// Configured policy.
    pub fn policy(&self) -> PowerPolicy {
        self.policy
    }

    /// Whether this controller currently holds power asserted.
    pub fn is_asserted(&self) -> bool {
        self.asserted
    }

    /// Number of times power has been asserted.
    pub fn power_requests(&self) -> u64 {
        self.power_requests
    }

    /// Establish the resting power state for a new instrument session.
    pub async fn start_session(&mut self) -> AppResult<()> {
        match self.policy {
            PowerPolicy::Always => self.assert().await,
            PowerPolicy::Never | PowerPolicy::WhenSampling => self.release().await,
        }
    }

    /// Power the instrument for a sampling attempt.
    pub async fn power_up(&mut self) -> AppResult<()> {
        match self.policy {
            PowerPolicy::Never => Ok(()),
            PowerPolicy::WhenSampling => self.assert().await,
            PowerPolicy::Always if self.asserted => Ok(()),
            PowerPolicy::Always => self.assert().await,
        }
    }

    /// Return the instrument to its resting power state after an attempt.
    pub async fn power_down(&mut self) -> AppResult<()> {
        match self.policy {
            PowerPolicy::Never | PowerPolicy::WhenSampling => self.release().await,
            PowerPolicy::Always => Ok(()),
        }
    }

    /// Release power regardless of policy at process teardown.
    pub async fn end_session(&mut self) -> AppResult<()> {
        if self.policy == PowerPolicy::Never {
            return Ok(());
        }
        info!(policy = ?self.policy, "releasing instrument power at shutdown");
        self.release().await
    }

    async fn assert(&mut self) -> AppResult<()> {
        debug!("asserting instrument power");
        self.switch.assert_power().await?;
        self.asserted = true;
        self.power_requests += 1;
        if !self.start_delay.is_zero() {
            debug!(delay_ms = self.start_delay.as_millis() as u64, "waiting for instrument to settle");
            sleep(self.start_delay).await;
        }
        Ok(())
    }

    async fn release(&mut self) -> AppResult<()> {
        if let Err(e) = self.switch.release_power().await {
            warn!(error = %e, "failed to release instrument power");
            return Err(e);
        }
        self.asserted = false;
        Ok(())
    }
}
