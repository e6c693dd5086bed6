//! Node configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/mooring.toml` by default)
//! 2. Environment variables prefixed with `MOORING_DAQ_`, nested keys
//!    separated by `__` (e.g. `MOORING_DAQ_APPLICATION__LOG_LEVEL=debug`)
//!
//! # Example
//! ```no_run
//! use mooring_daq::config::Settings;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load_from("config/mooring.toml")?;
//! settings.validate()?;
//! println!("Node {}: {} instruments", settings.node.id, settings.instruments.len());
//! # Ok(())
//! # }
//! ```

use crate::cycle::CycleConfig;
use crate::dispatch::DispatcherConfig;
use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use crate::instrument::AsciiDriver;
use crate::logging::OutputFormat;
use crate::parser::RegexSampleParser;
use crate::power::PowerPolicy;
use crate::schedule::SampleSchedule;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/mooring.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "MOORING_DAQ_";

/// Top-level node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationSettings,
    /// Node identity
    #[serde(default)]
    pub node: NodeSettings,
    /// Alert relay settings
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentSettings>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

/// Node identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Numeric node id
    #[serde(default)]
    pub id: i64,
}

/// Shore-messaging relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSettings {
    /// Whether alerts are sent to the relay at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Relay host name or address
    #[serde(default = "default_relay_host")]
    pub relay_host: String,
    /// UDP port for wake datagrams
    #[serde(default = "default_wake_port")]
    pub wake_port: u16,
    /// TCP port of the relay service
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,
    /// Concurrent deliveries
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// How long the relay host is kept awake per alert
    #[serde(default = "default_keep_awake", with = "humantime_serde")]
    pub keep_awake: Duration,
    /// Bound on each delivery step
    #[serde(default = "default_delivery_timeout", with = "humantime_serde")]
    pub delivery_timeout: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            relay_host: default_relay_host(),
            wake_port: default_wake_port(),
            relay_port: default_relay_port(),
            pool_size: default_pool_size(),
            keep_awake: default_keep_awake(),
            delivery_timeout: default_delivery_timeout(),
        }
    }
}

impl DispatcherSettings {
    /// Runtime dispatcher configuration.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            enabled: self.enabled,
            pool_size: self.pool_size,
            keep_awake: self.keep_awake,
            delivery_timeout: self.delivery_timeout,
        }
    }
}

/// Physical power switch for an instrument
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PowerSwitchSettings {
    /// Power is not switched by the node
    #[default]
    None,
    /// GPIO line exposed through sysfs
    Sysfs {
        /// Path of the GPIO `value` file
        path: PathBuf,
        /// Whether the relay is active-low
        #[serde(default)]
        active_low: bool,
    },
}

/// Attention handshake configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionSettings {
    /// Probes per handshake
    #[serde(default = "default_tries")]
    pub max_tries: u32,
    /// Per-probe deadline in milliseconds
    #[serde(default = "default_attention_timeout")]
    pub timeout_ms: u64,
    /// Pause between probes in milliseconds
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,
}

impl Default for AttentionSettings {
    fn default() -> Self {
        Self {
            max_tries: default_tries(),
            timeout_ms: default_attention_timeout(),
            backoff_ms: default_backoff(),
        }
    }
}

/// How the instrument is reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionSettings {
    /// Local serial port
    Serial {
        /// Device path, e.g. /dev/ttyS1
        port: String,
        /// Baud rate
        #[serde(default = "default_baud")]
        baud: u32,
    },
    /// Serial-over-TCP tunnel
    Tcp {
        /// host:port
        address: String,
    },
}

/// ASCII protocol strings; backslash escapes are decoded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSettings {
    /// Attention probe; empty disables the handshake
    #[serde(default)]
    pub probe: String,
    /// Prompt that answers the probe
    #[serde(default)]
    pub prompt: String,
    /// Sample request
    #[serde(default)]
    pub request: String,
    /// End of a sample record
    #[serde(default = "default_terminator")]
    pub terminator: String,
    /// Commands sent once after the first successful handshake
    #[serde(default)]
    pub init_commands: Vec<String>,
}

/// Sample value extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserSettings {
    /// Regex with a `value` group or a first capture group
    pub pattern: String,
    /// Parameter name
    pub parameter: String,
    /// Engineering units
    #[serde(default)]
    pub units: String,
}

/// STA/LTA detector parameters in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorSettings {
    /// Short-term window
    pub sta_width_sec: u64,
    /// Long-term window
    pub lta_width_sec: u64,
    /// Ratio that triggers
    pub trigger_ratio: f64,
    /// Ratio that detriggers
    pub detrigger_ratio: f64,
    /// Longest tolerated event before a forced reset
    pub max_trigger_sec: u64,
    /// Status alert period (0 = never)
    #[serde(default = "default_status_interval")]
    pub status_interval_sec: u64,
}

/// Sample log file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// CSV file path
    pub path: PathBuf,
}

/// Instrument definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSettings {
    /// Unique numeric id, used as the alert origin
    pub id: i64,
    /// Name used in logs
    pub name: String,
    /// Whether this instrument is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sampling schedule (ms interval, `R s m h` or `A s m h`)
    pub schedule: String,
    /// Power policy
    #[serde(default)]
    pub power_policy: PowerPolicy,
    /// Power switch
    #[serde(default)]
    pub power_switch: PowerSwitchSettings,
    /// Full attempts per cycle
    #[serde(default = "default_tries")]
    pub max_sample_tries: u32,
    /// Settle time after power-up in milliseconds
    #[serde(default)]
    pub start_delay_ms: u64,
    /// Sample read deadline in milliseconds
    #[serde(default = "default_sample_timeout")]
    pub sample_timeout_ms: u64,
    /// Attention handshake
    #[serde(default)]
    pub attention: AttentionSettings,
    /// Link to the instrument
    pub connection: ConnectionSettings,
    /// Protocol strings
    pub protocol: ProtocolSettings,
    /// Value extraction
    pub parser: ParserSettings,
    /// Event detection; absent disables it
    #[serde(default)]
    pub detector: Option<DetectorSettings>,
    /// Sample log; absent disables it
    #[serde(default)]
    pub log: Option<LogSettings>,
}

impl InstrumentSettings {
    /// Parsed sampling schedule.
    pub fn sample_schedule(&self) -> AppResult<SampleSchedule> {
        self.schedule.parse()
    }

    /// Retry and timing limits for the sampling cycle.
    pub fn cycle_config(&self) -> CycleConfig {
        CycleConfig {
            max_sample_tries: self.max_sample_tries,
            sample_timeout: Duration::from_millis(self.sample_timeout_ms),
            attention_timeout: Duration::from_millis(self.attention.timeout_ms),
            attention: RetryPolicy {
                max_attempts: self.attention.max_tries,
                backoff_delay: Duration::from_millis(self.attention.backoff_ms),
            },
        }
    }

    /// Settle time after power-up.
    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    /// Check the settings that would prevent sampling.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| DaqError::Configuration(format!("instrument '{}': {msg}", self.name));
        if self.max_sample_tries == 0 {
            return Err(invalid("max_sample_tries must be at least 1".into()));
        }
        if self.attention.max_tries == 0 {
            return Err(invalid("attention.max_tries must be at least 1".into()));
        }
        if self.sample_timeout_ms == 0 {
            return Err(invalid("sample_timeout_ms must be positive".into()));
        }
        self.sample_schedule().map_err(|e| invalid(e.to_string()))?;
        AsciiDriver::from_settings(&self.name, &self.protocol).map_err(|e| invalid(e.to_string()))?;
        RegexSampleParser::new(&self.parser.pattern, &self.parser.parameter, &self.parser.units)
            .map_err(|e| invalid(e.to_string()))?;
        Ok(())
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_relay_host() -> String {
    "localhost".to_string()
}

fn default_wake_port() -> u16 {
    9
}

fn default_relay_port() -> u16 {
    7070
}

fn default_pool_size() -> usize {
    10
}

fn default_keep_awake() -> Duration {
    Duration::from_secs(300)
}

fn default_delivery_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_tries() -> u32 {
    3
}

fn default_attention_timeout() -> u64 {
    1000
}

fn default_backoff() -> u64 {
    100
}

fn default_baud() -> u32 {
    9600
}

fn default_terminator() -> String {
    "\\r\\n".to_string()
}

fn default_sample_timeout() -> u64 {
    5000
}

fn default_status_interval() -> u64 {
    3600
}

impl Settings {
    /// Load configuration from the default file and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(Toml::file(path.as_ref())).extract()?)
    }

    /// Load configuration from TOML text plus environment variables
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Ok(Self::figment(Toml::string(toml)).extract()?)
    }

    fn figment(base: impl figment::Provider) -> Figment {
        Figment::new()
            .merge(base)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.dispatcher.pool_size == 0 {
            return Err(DaqError::Configuration(
                "dispatcher.pool_size must be at least 1".into(),
            ));
        }

        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            if !ids.insert(instrument.id) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate instrument ID: {}",
                    instrument.id
                )));
            }
            instrument.validate()?;
        }

        Ok(())
    }

    /// Get all enabled instruments
    pub fn enabled_instruments(&self) -> Vec<&InstrumentSettings> {
        self.instruments.iter().filter(|i| i.enabled).collect()
    }

    /// Look up an instrument by id or name
    pub fn instrument(&self, key: &str) -> Option<&InstrumentSettings> {
        self.instruments
            .iter()
            .find(|i| i.name == key || i.id.to_string() == key)
    }
}
