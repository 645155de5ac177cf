//! # Telemetry Packet Decoder
//!
//! Decodes 16-byte wire packets into encoder readings and the info byte.

use super::protocol::*;
use crate::error::{FalconError, Result};

/// Decode a complete wire packet
///
/// # Arguments
///
/// * `packet` - 16 bytes including both frame markers
///
/// # Returns
///
/// * `Result<TelemetryPacket>` - Decoded packet, or error if the markers are wrong
///
/// # Errors
///
/// Returns error if offset 0 is not `<` or offset 15 is not `>`
pub fn decode_telemetry(packet: &RawPacket) -> Result<TelemetryPacket> {
    if packet[0] != PACKET_START {
        return Err(FalconError::Protocol(format!(
            "Invalid start marker: 0x{:02X}",
            packet[0]
        )));
    }

    if packet[PACKET_LEN - 1] != PACKET_END {
        return Err(FalconError::Protocol(format!(
            "Invalid end marker: 0x{:02X}",
            packet[PACKET_LEN - 1]
        )));
    }

    let mut encoders = [0i16; NUM_AXES];
    for (axis, encoder) in encoders.iter_mut().enumerate() {
        let idx = AXIS_OFFSET + axis * NIBBLES_PER_AXIS;
        let mut nibbles = [0u8; NIBBLES_PER_AXIS];
        for (n, &byte) in nibbles.iter_mut().zip(&packet[idx..idx + NIBBLES_PER_AXIS]) {
            *n = unbias(byte);
        }
        *encoder = join_nibbles(nibbles);
    }

    Ok(TelemetryPacket {
        encoders,
        info: unbias(packet[INFO_OFFSET]),
        reserved: unbias(packet[RESERVED_OFFSET]),
    })
}

/// Rebuild a signed value from four nibbles, least significant first
pub fn join_nibbles(nibbles: [u8; NIBBLES_PER_AXIS]) -> i16 {
    let bits = (nibbles[0] as u16 & 0xF)
        | ((nibbles[1] as u16 & 0xF) << 4)
        | ((nibbles[2] as u16 & 0xF) << 8)
        | ((nibbles[3] as u16 & 0xF) << 12);
    bits as i16
}

fn unbias(byte: u8) -> u8 {
    byte.wrapping_sub(WIRE_BIAS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::encoder::encode_command;
    use proptest::prelude::*;

    #[test]
    fn test_decode_idle_packet() {
        let decoded = decode_telemetry(b"<AAAAAAAAAAAAAA>").unwrap();
        assert_eq!(decoded, TelemetryPacket::default());
    }

    #[test]
    fn test_decode_known_encoder_value() {
        // Documented capture: "JFKP" on axis 0 is 0xFA59
        let decoded = decode_telemetry(b"<JFKPAAAAAAAAAA>").unwrap();
        assert_eq!(decoded.encoders, [-1447, 0, 0]);
    }

    #[test]
    fn test_decode_info_byte() {
        let mut raw = *b"<AAAAAAAAAAAAAA>";
        raw[INFO_OFFSET] = 0x75 + WIRE_BIAS;
        let decoded = decode_telemetry(&raw).unwrap();
        assert_eq!(decoded.info, 0x75);
        assert_eq!(decoded.grip_bits(), 0x5);
        assert!(decoded.is_homed());
    }

    #[test]
    fn test_decode_invalid_start() {
        let result = decode_telemetry(b"AAAAAAAAAAAAAAA>");
        assert!(matches!(result, Err(FalconError::Protocol(_))));
    }

    #[test]
    fn test_decode_invalid_end() {
        let result = decode_telemetry(b"<AAAAAAAAAAAAAAA");
        assert!(matches!(result, Err(FalconError::Protocol(_))));
    }

    #[test]
    fn test_join_nibbles() {
        assert_eq!(join_nibbles([0x4, 0x3, 0x2, 0x1]), 0x1234);
        assert_eq!(join_nibbles([0xF, 0xF, 0xF, 0xF]), -1);
        assert_eq!(join_nibbles([0, 0, 0, 0x8]), i16::MIN);
    }

    proptest! {
        #[test]
        fn prop_encode_decode_preserves_axes(
            x in any::<i16>(),
            y in any::<i16>(),
            z in any::<i16>(),
            leds in 0u8..=LED_MASK,
            homing in any::<bool>(),
        ) {
            let command = CommandPacket::new([x, y, z], leds, homing);
            let decoded = decode_telemetry(&encode_command(&command)).unwrap();
            prop_assert_eq!(decoded.encoders, [x, y, z]);
            prop_assert_eq!(decoded.info, command.info);
        }
    }
}
