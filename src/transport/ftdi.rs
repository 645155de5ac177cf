//! # FTDI Vendor Requests
//!
//! The handful of FT232 vendor control requests needed to drive the Falcon's
//! USB-serial bridge directly over USB.

use super::{FlowControl, LineConfig, Parity, StopBits};
use super::{BOOTLOADER_BAUD, FIRMWARE_BAUD, NORMAL_BAUD};

/// Reset / purge request
pub const SIO_RESET: u8 = 0x00;

/// Modem control (DTR/RTS) request
pub const SIO_MODEM_CTRL: u8 = 0x01;

/// Flow control request
pub const SIO_SET_FLOW_CTRL: u8 = 0x02;

/// Baud divisor request
pub const SIO_SET_BAUD_RATE: u8 = 0x03;

/// Data characteristics request
pub const SIO_SET_DATA: u8 = 0x04;

/// Latency timer request
pub const SIO_SET_LATENCY_TIMER: u8 = 0x09;

/// `SIO_RESET` values
pub const SIO_RESET_SIO: u16 = 0;
pub const SIO_RESET_PURGE_RX: u16 = 1;
pub const SIO_RESET_PURGE_TX: u16 = 2;

/// `SIO_MODEM_CTRL` values (mask in the high byte, level in the low byte)
pub const SIO_SET_DTR_HIGH: u16 = 0x0101;
pub const SIO_SET_DTR_LOW: u16 = 0x0100;
pub const SIO_SET_RTS_HIGH: u16 = 0x0202;
pub const SIO_SET_RTS_LOW: u16 = 0x0200;

/// `SIO_SET_FLOW_CTRL` index bits
pub const SIO_DISABLE_FLOW_CTRL: u16 = 0x0000;
pub const SIO_RTS_CTS_HS: u16 = 0x0100;

/// Bulk OUT endpoint
pub const ENDPOINT_OUT: u8 = 0x02;

/// Bulk IN endpoint
pub const ENDPOINT_IN: u8 = 0x81;

/// Size of one bulk IN transfer
pub const IN_PACKET_LEN: usize = 64;

/// Modem status bytes prefixed to every bulk IN transfer
pub const MODEM_STATUS_LEN: usize = 2;

/// Divisor value for one of the Falcon's three baud rates
///
/// These are the values the device is known to accept; they are not all what
/// a generic FT232 divisor calculation would produce.
pub fn baud_divisor(baud: u32) -> Option<u16> {
    match baud {
        FIRMWARE_BAUD => Some(0x4138),
        BOOTLOADER_BAUD => Some(0x0015),
        NORMAL_BAUD => Some(0x0002),
        _ => None,
    }
}

/// `SIO_SET_DATA` value for a line configuration
pub fn data_value(config: &LineConfig) -> u16 {
    let parity: u16 = match config.parity {
        Parity::None => 0,
        Parity::Odd => 1,
        Parity::Even => 2,
    };
    let stop: u16 = match config.stop_bits {
        StopBits::One => 0,
        StopBits::Two => 2,
    };
    config.data_bits as u16 | (parity << 8) | (stop << 11)
}

/// `SIO_SET_FLOW_CTRL` index bits for a line configuration
pub fn flow_index(config: &LineConfig) -> u16 {
    match config.flow_control {
        FlowControl::None => SIO_DISABLE_FLOW_CTRL,
        FlowControl::RtsCts => SIO_RTS_CTS_HS,
    }
}

/// `SIO_MODEM_CTRL` value for DTR
pub fn dtr_value(high: bool) -> u16 {
    if high {
        SIO_SET_DTR_HIGH
    } else {
        SIO_SET_DTR_LOW
    }
}

/// `SIO_MODEM_CTRL` value for RTS
pub fn rts_value(high: bool) -> u16 {
    if high {
        SIO_SET_RTS_HIGH
    } else {
        SIO_SET_RTS_LOW
    }
}

/// Payload of a bulk IN transfer with the modem status bytes removed
pub fn strip_modem_status(transfer: &[u8]) -> &[u8] {
    transfer.get(MODEM_STATUS_LEN..).unwrap_or(&[])
}
