//! # Mooring DAQ Core Library
//!
//! Data acquisition for an unattended ocean mooring node: scheduled sampling
//! of serial instruments with power control, streaming STA/LTA event
//! detection on the sampled values, and bounded delivery of event alerts to
//! a shore relay.
//!
//! ## Crate Structure
//!
//! - **`config`**: Layered node configuration (TOML file + environment).
//! - **`schedule`**: Relative and calendar sample schedules.
//! - **`power`**: Power policies and instrument power switches.
//! - **`transport`**: Byte-stream links to instruments (serial, TCP).
//! - **`instrument`**: The `InstrumentDriver` hooks and a configurable ASCII driver.
//! - **`cycle`**: The sampling state machine (power, attention, request, read, retry).
//! - **`parser`**: Raw record parsing and sample logs.
//! - **`detector`**: The STA/LTA event detector.
//! - **`monitor`**: Per-parameter detection plus alert generation.
//! - **`dispatch`**: Bounded, non-blocking alert delivery to the relay.
//! - **`node`**: Sessions, scheduling loop and shutdown.
//! - **`error`** / **`error_recovery`**: `DaqError` and retry policies.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`mock`**: Mock links and relays for tests and development.

pub mod config;
pub mod cycle;
pub mod detector;
pub mod dispatch;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod logging;
pub mod mock;
pub mod monitor;
pub mod node;
pub mod parser;
pub mod power;
pub mod schedule;
pub mod transport;
