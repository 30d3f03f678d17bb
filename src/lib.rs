//! Bedside Flux - Streaming biometrics engine for in-bed sensing pads
//!
//! Bedside Flux turns the raw waveforms of a two-sided sensing pad into vitals
//! and sleep sessions through a deterministic pipeline: signal conditioning →
//! peak detection → multi-channel fusion → adaptive validation → persistence.
//!
//! ## Modules
//!
//! - **Vitals**: heart rate, HRV and breathing rate from piezo waveforms
//!   ([`conditioner`], [`peaks`], [`breathing`], [`tracker`])
//! - **Presence**: bed occupancy from piezo activity and capacitance against a
//!   calibrated baseline ([`presence`], [`baseline`])
//! - **Sleep**: occupancy series segmented into sleep sessions ([`sleep`])
//! - **Drivers**: live streaming, range replay and batch analysis
//!   ([`pipeline`], [`replay`])

pub mod baseline;
pub mod breathing;
pub mod buffer;
pub mod conditioner;
pub mod config;
pub mod context;
pub mod dsp;
pub mod error;
pub mod peaks;
pub mod pipeline;
pub mod presence;
pub mod replay;
pub mod sinks;
pub mod sleep;
pub mod source;
pub mod tracker;
pub mod types;

pub use config::EngineConfig;
pub use context::EngineContext;
pub use error::{EngineError, SignalError, SignalResult};
pub use pipeline::{analyze_sleep, calibrate, LivePipeline, LiveSummary};
pub use replay::{replay_vitals, ReplayProcessor};
pub use tracker::VitalsTracker;

// Record exports
pub use types::{CapBaseline, SensorFrame, Side, SleepRecord, VitalsRecord};

/// Engine version reported by the CLI
pub const FLUX_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name reported by the CLI
pub const PRODUCER_NAME: &str = "bedside-flux";
