//! Telemetry record written once per sampled packet

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::packet::protocol::{TelemetryPacket, NUM_AXES};

/// One JSONL line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    /// RFC 3339 UTC timestamp with millisecond precision
    pub timestamp: String,
    pub loop_count: u64,
    pub encoders: [i16; NUM_AXES],
    pub position: [f64; NUM_AXES],
    pub grip_bits: u8,
    pub homing_status: u8,
    pub homed: bool,
}

impl TelemetryRecord {
    /// Build a record stamped with the current time
    pub fn new(loop_count: u64, packet: &TelemetryPacket, position: [f64; NUM_AXES]) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            loop_count,
            encoders: packet.encoders,
            position,
            grip_bits: packet.grip_bits(),
            homing_status: packet.homing_status(),
            homed: packet.is_homed(),
        }
    }
}
