//! # Steady-State Packet Constants and Types
//!
//! Wire definitions for the 16-byte command/telemetry exchange spoken by the
//! Novint SDK firmware once it is running on the device.
//!
//! ```text
//! offset:  0    1..=4   5..=8   9..=12   13     14        15
//!          '<'  axis 0  axis 1  axis 2   info   reserved  '>'
//! ```
//!
//! Each axis is a signed 16-bit value split into four nibbles, least
//! significant nibble first. Every byte between the markers carries a +0x41
//! bias on the wire, so an idle packet reads `<AAAAAAAAAAAAAA>`.

/// Packet length on the wire
pub const PACKET_LEN: usize = 16;

/// Frame start marker (offset 0, never biased)
pub const PACKET_START: u8 = b'<';

/// Frame end marker (offset 15, never biased)
pub const PACKET_END: u8 = b'>';

/// Bias added to every byte at offsets 1..=14
pub const WIRE_BIAS: u8 = 0x41;

/// Number of motor/encoder axes
pub const NUM_AXES: usize = 3;

/// Nibbles used to carry one 16-bit axis value
pub const NIBBLES_PER_AXIS: usize = 4;

/// Offset of the first axis nibble
pub const AXIS_OFFSET: usize = 1;

/// Offset of the info byte (LEDs/homing out, buttons/homing status in)
pub const INFO_OFFSET: usize = 13;

/// Offset of the reserved byte
pub const RESERVED_OFFSET: usize = 14;

/// Green LED command flag
pub const LED_GREEN: u8 = 0x02;

/// Blue LED command flag
pub const LED_BLUE: u8 = 0x04;

/// Red LED command flag
pub const LED_RED: u8 = 0x08;

/// Mask of all LED flags
pub const LED_MASK: u8 = LED_GREEN | LED_BLUE | LED_RED;

/// Homing-mode request flag in the command info byte
pub const HOMING_MODE_FLAG: u8 = 0x01;

/// Grip button bits live in the low nibble of the telemetry info byte
pub const GRIP_MASK: u8 = 0x0F;

/// Per-encoder homing status bits start at bit 4 of the telemetry info byte
pub const HOMING_STATUS_SHIFT: u8 = 4;

/// Encoder 1 homed
pub const ENCODER_1_HOMED: u8 = 0x1;

/// Encoder 2 homed
pub const ENCODER_2_HOMED: u8 = 0x2;

/// Encoder 3 homed
pub const ENCODER_3_HOMED: u8 = 0x4;

/// All encoders homed
pub const ALL_ENCODERS_HOMED: u8 = ENCODER_1_HOMED | ENCODER_2_HOMED | ENCODER_3_HOMED;

/// Raw 16-byte packet as seen on the wire
pub type RawPacket = [u8; PACKET_LEN];

/// Host → device command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandPacket {
    /// Instantaneous motor torque per axis
    pub forces: [i16; NUM_AXES],

    /// LED and homing-mode flags
    pub info: u8,

    /// Unused by the Novint firmware, sent as zero
    pub reserved: u8,
}

impl CommandPacket {
    /// Build a command from forces, an LED bitfield and the homing-mode switch
    ///
    /// Bits outside [`LED_MASK`] are dropped from `leds`.
    pub fn new(forces: [i16; NUM_AXES], leds: u8, homing_mode: bool) -> Self {
        let mut info = leds & LED_MASK;
        if homing_mode {
            info |= HOMING_MODE_FLAG;
        }
        Self {
            forces,
            info,
            reserved: 0,
        }
    }

    /// LED flags carried by this command
    pub fn leds(&self) -> u8 {
        self.info & LED_MASK
    }

    /// Whether this command asks the device to stay in homing mode
    pub fn homing_mode(&self) -> bool {
        self.info & HOMING_MODE_FLAG != 0
    }
}

/// Device → host telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TelemetryPacket {
    /// Raw encoder readings per axis
    pub encoders: [i16; NUM_AXES],

    /// Grip buttons (low nibble) and homing status (bits 4-6)
    pub info: u8,

    /// Unused by the Novint firmware
    pub reserved: u8,
}

impl TelemetryPacket {
    /// Raw grip bits (one bit per button)
    pub fn grip_bits(&self) -> u8 {
        self.info & GRIP_MASK
    }

    /// Per-encoder homing bitfield (`ENCODER_n_HOMED`)
    pub fn homing_status(&self) -> u8 {
        (self.info >> HOMING_STATUS_SHIFT) & ALL_ENCODERS_HOMED
    }

    /// True when all three encoders report homed
    pub fn is_homed(&self) -> bool {
        self.homing_status() == ALL_ENCODERS_HOMED
    }
}
