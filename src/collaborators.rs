//! # Kinematics and Grip Interfaces
//!
//! The device orchestrator converts between raw device units and the
//! caller's world through two pluggable collaborators:
//!
//! - [`Kinematics`]: encoder counts → end-effector position, and desired
//!   force at a position → raw motor values
//! - [`Grip`]: raw grip bytes → button and analog state
//!
//! Only the grip shipped with every Falcon is implemented here
//! ([`FourButtonGrip`]); kinematics models are supplied by the caller.

use crate::error::{FalconError, Result};
use crate::packet::protocol::NUM_AXES;

/// Position/force model of the parallel mechanism
#[cfg_attr(test, mockall::automock)]
pub trait Kinematics: Send {
    /// End-effector position for a set of encoder readings
    fn position_from_encoders(&mut self, encoders: [i16; NUM_AXES]) -> Result<[f64; NUM_AXES]>;

    /// Raw motor values producing `force` at `position`
    fn forces_to_raw(
        &mut self,
        position: [f64; NUM_AXES],
        force: [f64; NUM_AXES],
    ) -> Result<[i16; NUM_AXES]>;
}

/// Decoded grip input
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GripState {
    /// One bit per digital input
    pub digital_bits: u32,

    /// Analog inputs, grip-specific order and scale
    pub analog: Vec<f64>,
}

impl GripState {
    /// Whether digital input `index` is pressed
    pub fn is_pressed(&self, index: u32) -> bool {
        index < u32::BITS && self.digital_bits & (1 << index) != 0
    }
}

/// Decoder for the raw grip bytes of one grip model
#[cfg_attr(test, mockall::automock)]
pub trait Grip: Send {
    fn decode(&mut self, raw: &[u8]) -> Result<GripState>;
}

/// Stock four-button grip
///
/// The low nibble of the telemetry info byte carries one bit per button.
#[derive(Debug, Clone, Copy, Default)]
pub struct FourButtonGrip;

impl FourButtonGrip {
    pub const BUTTON_CENTER: u32 = 0;
    pub const BUTTON_PLUS: u32 = 1;
    pub const BUTTON_FORWARD: u32 = 2;
    pub const BUTTON_MINUS: u32 = 3;

    const BUTTON_MASK: u8 = 0x0F;
}

impl Grip for FourButtonGrip {
    fn decode(&mut self, raw: &[u8]) -> Result<GripState> {
        let byte = raw
            .first()
            .ok_or_else(|| FalconError::Grip("empty grip data".into()))?;
        Ok(GripState {
            digital_bits: (byte & Self::BUTTON_MASK) as u32,
            analog: Vec::new(),
        })
    }
}
