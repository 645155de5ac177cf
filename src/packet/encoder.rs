//! # Command Packet Encoder
//!
//! Encodes motor forces and LED/homing flags into 16-byte wire packets.

use super::protocol::*;

/// Encode a command into a complete wire packet
///
/// # Arguments
///
/// * `command` - Forces, info flags and reserved byte to send
///
/// # Returns
///
/// * `RawPacket` - 16 bytes: `<`, 12 force nibbles, info, reserved, `>`
///
/// # Examples
///
/// ```
/// use falcon_driver::packet::encoder::encode_command;
/// use falcon_driver::packet::protocol::CommandPacket;
///
/// let packet = encode_command(&CommandPacket::default());
/// assert_eq!(&packet, b"<AAAAAAAAAAAAAA>");
/// ```
pub fn encode_command(command: &CommandPacket) -> RawPacket {
    let mut packet = [0u8; PACKET_LEN];
    packet[0] = PACKET_START;
    packet[PACKET_LEN - 1] = PACKET_END;

    for (axis, &force) in command.forces.iter().enumerate() {
        let idx = AXIS_OFFSET + axis * NIBBLES_PER_AXIS;
        packet[idx..idx + NIBBLES_PER_AXIS].copy_from_slice(&split_nibbles(force));
    }

    packet[INFO_OFFSET] = command.info;
    packet[RESERVED_OFFSET] = command.reserved;

    apply_bias(&mut packet);
    packet
}

/// Split a signed value into four nibbles, least significant first
///
/// # Algorithm
///
/// ```text
/// 0xFA59 -> [0x9, 0x5, 0xA, 0xF]
/// ```
pub fn split_nibbles(value: i16) -> [u8; NIBBLES_PER_AXIS] {
    let bits = value as u16;
    [
        (bits & 0x000F) as u8,
        ((bits & 0x00F0) >> 4) as u8,
        ((bits & 0x0F00) >> 8) as u8,
        ((bits & 0xF000) >> 12) as u8,
    ]
}

/// Add the wire bias to every byte between the markers
fn apply_bias(packet: &mut RawPacket) {
    for byte in &mut packet[1..PACKET_LEN - 1] {
        *byte = byte.wrapping_add(WIRE_BIAS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_idle_packet() {
        let packet = encode_command(&CommandPacket::default());
        assert_eq!(&packet, b"<AAAAAAAAAAAAAA>");
    }

    #[test]
    fn test_encode_markers_unbiased() {
        let packet = encode_command(&CommandPacket::new([-1, 1, i16::MIN], LED_RED, true));
        assert_eq!(packet[0], PACKET_START);
        assert_eq!(packet[15], PACKET_END);
        assert_eq!(packet.len(), PACKET_LEN);
    }

    #[test]
    fn test_encode_nibble_order() {
        // 1447 = 0x05A7, two's complement of -1447 is 0xFA59
        let packet = encode_command(&CommandPacket::new([-1447, 0, 0], 0, false));
        assert_eq!(&packet[1..5], &[0x4A, 0x46, 0x4B, 0x50]);
        assert_eq!(&packet[1..5], b"JFKP");
    }

    #[test]
    fn test_encode_info_and_reserved() {
        let mut command = CommandPacket::new([0; 3], LED_GREEN | LED_BLUE, true);
        command.reserved = 2;
        let packet = encode_command(&command);
        assert_eq!(packet[INFO_OFFSET], 0x07 + WIRE_BIAS);
        assert_eq!(packet[RESERVED_OFFSET], 0x02 + WIRE_BIAS);
    }

    #[test]
    fn test_encode_stays_in_printable_range() {
        let packet = encode_command(&CommandPacket::new([i16::MAX, i16::MIN, -1], LED_MASK, true));
        for &byte in &packet[1..15] {
            assert!((0x41..=0x50).contains(&byte), "byte 0x{byte:02X} out of range");
        }
    }

    #[test]
    fn test_split_nibbles() {
        assert_eq!(split_nibbles(0), [0, 0, 0, 0]);
        assert_eq!(split_nibbles(-1), [0xF, 0xF, 0xF, 0xF]);
        assert_eq!(split_nibbles(0x1234), [0x4, 0x3, 0x2, 0x1]);
        assert_eq!(split_nibbles(i16::MIN), [0, 0, 0, 0x8]);
    }
}
