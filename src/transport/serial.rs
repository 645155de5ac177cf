//! # Blocking Serial Backend
//!
//! Drives the Falcon through the operating system's FTDI serial driver
//! (`/dev/ttyUSB*`, `COM*`). Steady-state reads block the calling thread
//! until the first bytes arrive or the read timeout fires.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use tokio_serial::{ClearBuffer, SerialPort, SerialPortType};
use tracing::{debug, info, trace, warn};

use super::{DeviceMatcher, FlowControl, LineConfig, Parity, StopBits, TransportBackend, FIRMWARE_BAUD};
use crate::error::{FalconError, Result};

const BACKEND: &str = "serial";

/// Upload chunk size for serial-style backends
pub const SERIAL_CHUNK_SIZE: usize = 128;

/// Default steady-state read timeout
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Blocking backend over a serial port
pub struct BlockingSerialBackend {
    matcher: DeviceMatcher,
    read_timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
    port_name: Option<String>,
}

impl std::fmt::Debug for BlockingSerialBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingSerialBackend")
            .field("matcher", &self.matcher)
            .field("port_name", &self.port_name)
            .finish_non_exhaustive()
    }
}

impl BlockingSerialBackend {
    /// Create a closed backend
    ///
    /// # Arguments
    ///
    /// * `matcher` - How Falcon ports are recognized among the system's ports
    /// * `read_timeout` - How long a steady-state read waits for data
    pub fn new(matcher: DeviceMatcher, read_timeout: Duration) -> Self {
        Self {
            matcher,
            read_timeout,
            port: None,
            port_name: None,
        }
    }

    /// Name of the open port, if any
    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    fn matching_ports(&self) -> Result<Vec<String>> {
        let ports = tokio_serial::available_ports()
            .map_err(|e| FalconError::NotInitialized(format!("serial port enumeration: {e}")))?;

        Ok(ports
            .into_iter()
            .filter(|p| match &p.port_type {
                SerialPortType::UsbPort(usb) => {
                    self.matcher.matches(usb.vid, usb.pid, usb.product.as_deref())
                }
                _ => false,
            })
            .map(|p| p.port_name)
            .collect())
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(FalconError::NotValid)
    }
}

fn device_error(e: tokio_serial::Error) -> FalconError {
    FalconError::device(BACKEND, None, e.to_string())
}

/// Single read against the port's steady timeout
///
/// Returns as soon as any bytes arrive; a timeout yields `Ok(0)`.
fn read_available<R: Read + ?Sized>(port: &mut R, buf: &mut [u8]) -> Result<usize> {
    loop {
        match port.read(buf) {
            Ok(n) => {
                trace!("Read {} bytes", n);
                return Ok(n);
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => return Ok(0),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(FalconError::ReadError(e.to_string())),
        }
    }
}

impl TransportBackend for BlockingSerialBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn device_count(&mut self) -> Result<usize> {
        Ok(self.matching_ports()?.len())
    }

    fn open(&mut self, index: usize) -> Result<()> {
        if self.port.is_some() {
            self.close()?;
        }

        let ports = self.matching_ports()?;
        if ports.is_empty() {
            return Err(FalconError::NotFound);
        }
        let name = ports.get(index).ok_or(FalconError::IndexOutOfRange {
            index,
            count: ports.len(),
        })?;

        let port = tokio_serial::new(name.as_str(), FIRMWARE_BAUD)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(self.read_timeout)
            .open()
            .map_err(device_error)?;

        info!("Opened serial port {}", name);
        self.port = Some(port);
        self.port_name = Some(name.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let port = self.port.take().ok_or(FalconError::NotValid)?;
        drop(port);
        if let Some(name) = self.port_name.take() {
            info!("Closed serial port {}", name);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        read_available(self.port()?, buf)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let port = self.port()?;
        port.write_all(data)
            .and_then(|_| port.flush())
            .map_err(|e| FalconError::WriteError(e.to_string()))?;
        trace!("Wrote {} bytes", data.len());
        Ok(data.len())
    }

    fn read_blocking(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let steady_timeout = self.read_timeout;
        let port = self.port()?;
        let deadline = Instant::now() + timeout;
        let mut total = 0;

        while total < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            port.set_timeout(remaining).map_err(device_error)?;

            match port.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(FalconError::ReadError(e.to_string())),
            }
        }

        port.set_timeout(steady_timeout).map_err(device_error)?;
        trace!("Read {} of {} bytes", total, buf.len());
        Ok(total)
    }

    fn write_blocking(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        let steady_timeout = self.read_timeout;
        let port = self.port()?;
        port.set_timeout(timeout).map_err(device_error)?;
        let result = port
            .write_all(data)
            .and_then(|_| port.flush())
            .map_err(|e| FalconError::WriteError(e.to_string()));
        port.set_timeout(steady_timeout).map_err(device_error)?;
        result.map(|_| data.len())
    }

    fn purge(&mut self) -> Result<()> {
        self.port()?.clear(ClearBuffer::All).map_err(device_error)?;
        debug!("Purged RX/TX buffers");
        Ok(())
    }

    fn reset_device(&mut self) -> Result<()> {
        // The OS driver owns the bridge; a purge is the closest equivalent
        self.purge()
    }

    fn set_latency_timer(&mut self, ms: u8) -> Result<()> {
        self.port()?;
        trace!("Latency timer {} ms left to the OS driver", ms);
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        self.port()?.set_baud_rate(baud).map_err(device_error)?;
        debug!("Baud rate set to {}", baud);
        Ok(())
    }

    fn set_line_config(&mut self, config: LineConfig) -> Result<()> {
        let data_bits = match config.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            8 => tokio_serial::DataBits::Eight,
            other => {
                warn!("Unsupported data bits {}", other);
                return Err(FalconError::device(
                    BACKEND,
                    None,
                    format!("unsupported data bits: {other}"),
                ));
            }
        };
        let parity = match config.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };
        let stop_bits = match config.stop_bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        };
        let flow_control = match config.flow_control {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::RtsCts => tokio_serial::FlowControl::Hardware,
        };

        let port = self.port()?;
        port.set_data_bits(data_bits).map_err(device_error)?;
        port.set_parity(parity).map_err(device_error)?;
        port.set_stop_bits(stop_bits).map_err(device_error)?;
        port.set_flow_control(flow_control).map_err(device_error)?;
        Ok(())
    }

    fn set_dtr(&mut self, high: bool) -> Result<()> {
        self.port()?
            .write_data_terminal_ready(high)
            .map_err(device_error)
    }

    fn set_rts(&mut self, high: bool) -> Result<()> {
        self.port()?.write_request_to_send(high).map_err(device_error)
    }

    fn upload_chunk_size(&self) -> usize {
        SERIAL_CHUNK_SIZE
    }

    fn has_bytes_available(&self) -> bool {
        self.port
            .as_ref()
            .and_then(|p| p.bytes_to_read().ok())
            .is_some_and(|n| n > 0)
    }
}

impl Drop for BlockingSerialBackend {
    fn drop(&mut self) {
        if self.port.is_some() {
            if let Err(e) = self.close() {
                warn!("Failed to close serial port on drop: {}", e);
            }
        }
    }
}
