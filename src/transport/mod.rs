//! # Transport Module
//!
//! Byte-stream access to the Falcon's FTDI USB-serial bridge.
//!
//! This module handles:
//! - Device discovery by VID/PID or by USB description string
//! - Line configuration (baud, 8-N-1, flow control, DTR/RTS, latency timer)
//! - Blocking reads/writes (serial port backend)
//! - Non-blocking reads/writes serviced by cooperative polling (raw USB backend)
//! - The fixed firmware-mode and normal-mode line setups

use std::time::Duration;

use crate::error::Result;

pub mod ftdi;
pub mod serial;
pub mod transfer;
pub mod usb;

#[cfg(test)]
pub mod mock;

pub use serial::BlockingSerialBackend;
pub use usb::AsyncUsbBackend;

/// FTDI vendor id
pub const FALCON_VENDOR_ID: u16 = 0x0403;

/// Novint Falcon product id
pub const FALCON_PRODUCT_ID: u16 = 0xCB48;

/// USB product description reported by the Falcon
pub const FALCON_DESCRIPTION: &str = "FALCON HAPTIC";

/// Baud rate used for the first bootloader handshake
pub const FIRMWARE_BAUD: u32 = 9_600;

/// Baud rate used for the second handshake and the firmware upload
pub const BOOTLOADER_BAUD: u32 = 140_000;

/// Baud rate of the running firmware
pub const NORMAL_BAUD: u32 = 1_456_312;

/// FTDI latency timer while talking to the bootloader
pub const FIRMWARE_LATENCY_MS: u8 = 16;

/// FTDI latency timer for the steady-state loop
pub const NORMAL_LATENCY_MS: u8 = 1;

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Serial stop bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

/// Serial flow control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    RtsCts,
}

/// Character framing and flow control for the serial link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineConfig {
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl LineConfig {
    /// 8 data bits, no parity, 1 stop bit, no flow control
    pub const EIGHT_N_ONE: LineConfig = LineConfig {
        data_bits: 8,
        parity: Parity::None,
        stop_bits: StopBits::One,
        flow_control: FlowControl::None,
    };
}

impl Default for LineConfig {
    fn default() -> Self {
        Self::EIGHT_N_ONE
    }
}

/// How attached devices are recognized as Falcons
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMatcher {
    /// Match on USB vendor and product id
    VidPid { vid: u16, pid: u16 },

    /// Match on the USB product description string
    Description(String),
}

impl Default for DeviceMatcher {
    fn default() -> Self {
        DeviceMatcher::VidPid {
            vid: FALCON_VENDOR_ID,
            pid: FALCON_PRODUCT_ID,
        }
    }
}

impl DeviceMatcher {
    /// Match on the Falcon's description string instead of its ids
    pub fn falcon_description() -> Self {
        DeviceMatcher::Description(FALCON_DESCRIPTION.to_string())
    }

    /// Check one enumerated device against this matcher
    pub fn matches(&self, vid: u16, pid: u16, description: Option<&str>) -> bool {
        match self {
            DeviceMatcher::VidPid { vid: v, pid: p } => vid == *v && pid == *p,
            DeviceMatcher::Description(expected) => {
                description.is_some_and(|d| d.trim() == expected.as_str())
            }
        }
    }
}

/// Byte-stream access to one Falcon
///
/// Implementations are either blocking (reads wait for data up to a timeout)
/// or polling (reads drain a buffer filled by [`TransportBackend::poll`]).
/// Polling backends report `requires_poll() == true` and must be polled by
/// the owning thread at least once per control-loop tick.
#[cfg_attr(test, mockall::automock)]
pub trait TransportBackend: Send {
    /// Short backend name used in logs and device errors
    fn name(&self) -> &'static str;

    /// Number of attached devices matching this backend's matcher
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` if the bus or port list can't be enumerated
    fn device_count(&mut self) -> Result<usize>;

    /// Open the `index`th matching device and apply default line settings
    ///
    /// An already open device is closed first.
    fn open(&mut self, index: usize) -> Result<()>;

    /// Close the device, cancelling any outstanding transfers
    ///
    /// # Errors
    ///
    /// Returns `NotValid` if the device is not open
    fn close(&mut self) -> Result<()>;

    /// Whether a device is currently open
    fn is_open(&self) -> bool;

    /// Read whatever the steady-state loop has available
    ///
    /// Blocking backends return the first bytes to arrive, waiting at most
    /// their configured read timeout; polling backends return immediately,
    /// possibly with 0 bytes.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Submit bytes for the steady-state loop
    ///
    /// Polling backends reject a write while the previous one is still in
    /// flight with `TransferPending`.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Read until `buf` is full or `timeout` elapses, returning the bytes read
    fn read_blocking(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Write all of `data`, waiting up to `timeout` for it to leave the host
    fn write_blocking(&mut self, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Flush the RX and TX buffers, dropping any transfer still in flight
    fn purge(&mut self) -> Result<()>;

    /// Reset the USB-serial bridge
    fn reset_device(&mut self) -> Result<()>;

    /// Set the FTDI latency timer in milliseconds
    fn set_latency_timer(&mut self, ms: u8) -> Result<()>;

    fn set_baud_rate(&mut self, baud: u32) -> Result<()>;

    fn set_line_config(&mut self, config: LineConfig) -> Result<()>;

    fn set_dtr(&mut self, high: bool) -> Result<()>;

    fn set_rts(&mut self, high: bool) -> Result<()>;

    /// Firmware upload chunk size for this backend
    fn upload_chunk_size(&self) -> usize;

    /// Bytes to request for the first bootloader handshake reply
    fn handshake_reply_len(&self) -> usize {
        5
    }

    /// Whether [`TransportBackend::poll`] must be called to make progress
    fn requires_poll(&self) -> bool {
        false
    }

    /// Whether received bytes are waiting to be read
    fn has_bytes_available(&self) -> bool;

    /// Service completed transfers on the calling thread
    fn poll(&mut self) -> Result<()> {
        Ok(())
    }

    /// Configure the line for talking to the bootloader
    ///
    /// 16 ms latency, 9600 baud, 8-N-1, no flow control, RTS low, then DTR
    /// pulsed low and left high.
    fn set_firmware_mode(&mut self) -> Result<()> {
        self.set_latency_timer(FIRMWARE_LATENCY_MS)?;
        self.set_baud_rate(FIRMWARE_BAUD)?;
        self.set_line_config(LineConfig::EIGHT_N_ONE)?;
        self.set_rts(false)?;
        self.set_dtr(false)?;
        self.set_dtr(true)
    }

    /// Configure the line for the running firmware
    ///
    /// Purges stale bytes, then 1 ms latency at 1456312 baud, 8-N-1.
    fn set_normal_mode(&mut self) -> Result<()> {
        self.purge()?;
        self.set_latency_timer(NORMAL_LATENCY_MS)?;
        self.set_baud_rate(NORMAL_BAUD)?;
        self.set_line_config(LineConfig::EIGHT_N_ONE)
    }
}
