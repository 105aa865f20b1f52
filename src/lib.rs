//! Force plate jump analysis.
//!
//! Raw load-cell voltage chunks go through [`StreamProcessor`], which buffers
//! them, calibrates body weight, detects takeoff/landing and computes jump
//! metrics, emitting an ordered stream of [`ProcessorEvent`]s.

pub mod analyzer;
pub mod buffer;
pub mod calibration;
pub mod config;
pub mod detector;
pub mod error;
pub mod filters;
pub mod live_status;
pub mod processor;
pub mod simulator;
pub mod types;

pub use analyzer::{JumpAnalysis, JumpAnalyzer};
pub use buffer::BufferManager;
pub use calibration::{CalibrationManager, CalibrationSnapshot};
pub use config::{AcquisitionConfig, AnalysisConfig, CalibrationConfig, DetectionConfig, PlateConfig};
pub use detector::JumpDetector;
pub use error::{PlateError, PlateResult};
pub use live_status::SessionStatus;
pub use processor::{BrakingTask, ProcessorStats, StreamProcessor};
pub use types::{CalibrationPhase, EventMarkers, FlightEvent, JumpResult, ProcessorEvent, SessionData};
