//! # Telemetry Module
//!
//! Records decoded device telemetry to JSONL files with rotation.
//!
//! This module handles:
//! - Converting decoded packets into serializable records
//! - Formatting as JSONL (JSON Lines)
//! - Rotating files every N records and keeping only the last M files
//! - Sampling (record every Nth packet) to keep high-rate loops cheap

pub mod logger;
pub mod types;

pub use logger::TelemetryLogger;
pub use types::TelemetryRecord;
