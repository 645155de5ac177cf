//! # Steady-State Packet Module
//!
//! Framing for the 16-byte command/telemetry exchange used once the Novint
//! firmware is running.
//!
//! This module handles:
//! - Command packet encoding (three force values, LED and homing flags)
//! - Telemetry packet decoding (three encoder values, buttons, homing status)
//! - Reassembly of packets from arbitrarily chunked reads

pub mod protocol;
pub mod encoder;
pub mod decoder;
pub mod reassembly;
