//! # Async USB Backend
//!
//! Talks to the Falcon's FTDI bridge directly over USB using `nusb` bulk
//! transfer queues and FTDI vendor control requests.
//!
//! Nothing here runs on a background thread. Transfers are submitted by
//! [`AsyncUsbBackend::write`] and by the backend itself (one bulk IN transfer
//! is kept armed while the device is open); their completions are handled
//! only inside [`TransportBackend::poll`], on the caller's thread.
//!
//! ```text
//! write() ──submit──► OUT queue ──complete──► poll() clears write pending
//! poll()  ◄─complete── IN queue  ◄──resubmit── poll() strips 2 status bytes
//!    │
//!    └──► rx buffer ──► read()
//! ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use futures_lite::future::{block_on, poll_once};
use nusb::transfer::{
    Completion, Control, ControlType, Queue, Recipient, RequestBuffer, ResponseBuffer, TransferError,
};
use tracing::{debug, info, trace, warn};

use super::ftdi;
use super::transfer::{Direction, TransferTracker};
use super::{DeviceMatcher, LineConfig, TransportBackend};
use crate::error::{FalconError, Result};

const BACKEND: &str = "usb";

/// Upload chunk size for USB-bulk backends
pub const USB_CHUNK_SIZE: usize = 58;

/// Timeout for FTDI vendor control requests
const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Sleep between polls while waiting in the blocking helpers
const POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Open device state: claimed interface plus one queue per endpoint
struct UsbLink {
    interface: nusb::Interface,
    out_queue: Queue<Vec<u8>>,
    in_queue: Queue<RequestBuffer>,
    write: TransferTracker,
    read: TransferTracker,
    spare_out: Option<Vec<u8>>,
}

impl UsbLink {
    fn control(&self, request: u8, value: u16, index: u16) -> Result<()> {
        let control = Control {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request,
            value,
            index,
        };
        self.interface
            .control_out_blocking(control, &[], CONTROL_TIMEOUT)
            .map_err(|e| {
                FalconError::device(
                    BACKEND,
                    None,
                    format!("control request 0x{request:02X} (value 0x{value:04X}): {e}"),
                )
            })?;
        Ok(())
    }

    /// Keep one IN transfer armed
    fn arm_read(&mut self, buffer: Option<Vec<u8>>) -> Result<()> {
        if self.read.is_pending() {
            return Ok(());
        }
        self.read.begin(ftdi::IN_PACKET_LEN)?;
        let request = match buffer {
            Some(buf) => RequestBuffer::reuse(buf, ftdi::IN_PACKET_LEN),
            None => RequestBuffer::new(ftdi::IN_PACKET_LEN),
        };
        self.in_queue.submit(request);
        Ok(())
    }

    /// Cancel everything in flight and wait for the cancellations to land
    fn cancel_all(&mut self) {
        self.out_queue.cancel_all();
        self.in_queue.cancel_all();
        while self.out_queue.pending() > 0 {
            let _ = block_on(self.out_queue.next_complete());
        }
        while self.in_queue.pending() > 0 {
            let _ = block_on(self.in_queue.next_complete());
        }
        self.write.cancel();
        self.read.cancel();
    }
}

/// Polling backend over raw USB bulk transfers
pub struct AsyncUsbBackend {
    matcher: DeviceMatcher,
    link: Option<UsbLink>,
    rx: VecDeque<u8>,
}

impl std::fmt::Debug for AsyncUsbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncUsbBackend")
            .field("matcher", &self.matcher)
            .field("open", &self.link.is_some())
            .field("rx_len", &self.rx.len())
            .finish()
    }
}

impl AsyncUsbBackend {
    /// Create a closed backend
    pub fn new(matcher: DeviceMatcher) -> Self {
        Self {
            matcher,
            link: None,
            rx: VecDeque::with_capacity(ftdi::IN_PACKET_LEN * 4),
        }
    }

    fn matching_devices(&self) -> Result<Vec<nusb::DeviceInfo>> {
        let devices = nusb::list_devices()
            .map_err(|e| FalconError::NotInitialized(format!("USB enumeration: {e}")))?;
        Ok(devices
            .filter(|d| self.matcher.matches(d.vendor_id(), d.product_id(), d.product_string()))
            .collect())
    }

    fn link(&mut self) -> Result<&mut UsbLink> {
        self.link.as_mut().ok_or(FalconError::NotValid)
    }

    /// Whether a write is still in flight
    pub fn write_pending(&self) -> bool {
        self.link.as_ref().is_some_and(|l| l.write.is_pending())
    }

    fn drain_rx(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.rx.len());
        for (dst, src) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *dst = src;
        }
        n
    }

    fn on_write_complete(link: &mut UsbLink, completion: Completion<ResponseBuffer>) -> Result<()> {
        link.write.complete();
        let result = completion.status;
        link.spare_out = Some(completion.data.reuse());
        result.map_err(|e| FalconError::WriteError(format!("bulk OUT failed: {e}")))
    }

    fn on_read_complete(
        link: &mut UsbLink,
        rx: &mut VecDeque<u8>,
        completion: Completion<Vec<u8>>,
    ) -> Result<()> {
        link.read.complete();
        match completion.status {
            Ok(()) => {
                let payload = ftdi::strip_modem_status(&completion.data);
                if !payload.is_empty() {
                    trace!("Received {} bytes", payload.len());
                }
                rx.extend(payload);
                link.arm_read(Some(completion.data))
            }
            Err(TransferError::Cancelled) => Ok(()),
            Err(e) => {
                // Re-arm so the next poll can recover from a transient fault
                link.arm_read(Some(completion.data))?;
                Err(FalconError::ReadError(format!("bulk IN failed: {e}")))
            }
        }
    }
}

impl TransportBackend for AsyncUsbBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn device_count(&mut self) -> Result<usize> {
        Ok(self.matching_devices()?.len())
    }

    fn open(&mut self, index: usize) -> Result<()> {
        if self.link.is_some() {
            self.close()?;
        }

        let devices = self.matching_devices()?;
        if devices.is_empty() {
            return Err(FalconError::NotFound);
        }
        let count = devices.len();
        let info = devices
            .into_iter()
            .nth(index)
            .ok_or(FalconError::IndexOutOfRange { index, count })?;

        let device = info.open().map_err(|e| {
            FalconError::device(BACKEND, e.raw_os_error(), format!("open failed: {e}"))
        })?;
        let interface = device.claim_interface(0).map_err(|e| {
            FalconError::device(BACKEND, e.raw_os_error(), format!("claim interface 0: {e}"))
        })?;

        let mut link = UsbLink {
            out_queue: interface.bulk_out_queue(ftdi::ENDPOINT_OUT),
            in_queue: interface.bulk_in_queue(ftdi::ENDPOINT_IN),
            interface,
            write: TransferTracker::new(Direction::Write),
            read: TransferTracker::new(Direction::Read),
            spare_out: None,
        };

        let defaults = LineConfig::default();
        link.control(ftdi::SIO_SET_DATA, ftdi::data_value(&defaults), 0)?;
        link.control(ftdi::SIO_SET_FLOW_CTRL, 0, ftdi::flow_index(&defaults))?;
        link.arm_read(None)?;

        info!(
            "Opened USB device {:04X}:{:04X} (bus {}, address {})",
            info.vendor_id(),
            info.product_id(),
            info.bus_number(),
            info.device_address()
        );
        self.rx.clear();
        self.link = Some(link);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut link = self.link.take().ok_or(FalconError::NotValid)?;
        link.cancel_all();
        drop(link);
        self.rx.clear();
        info!("Closed USB device");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.link()?.arm_read(None)?;
        Ok(self.drain_rx(buf))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let link = self.link()?;
        link.write.begin(data.len())?;

        let mut buf = link.spare_out.take().unwrap_or_default();
        buf.clear();
        buf.extend_from_slice(data);
        link.out_queue.submit(buf);
        trace!("Submitted {} byte write", data.len());
        Ok(data.len())
    }

    fn read_blocking(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut total = 0;
        loop {
            self.poll()?;
            total += self.drain_rx(&mut buf[total..]);
            if total == buf.len() || Instant::now() >= deadline {
                return Ok(total);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn write_blocking(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let n = self.write(data)?;
        while self.write_pending() {
            if Instant::now() >= deadline {
                return Err(FalconError::WriteError(format!(
                    "{} byte write timed out after {:?}",
                    data.len(),
                    timeout
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
            self.poll()?;
        }
        Ok(n)
    }

    fn purge(&mut self) -> Result<()> {
        let link = self.link()?;
        // In-flight transfers would otherwise block the next write
        link.cancel_all();
        link.control(ftdi::SIO_RESET, ftdi::SIO_RESET_PURGE_RX, 0)?;
        link.control(ftdi::SIO_RESET, ftdi::SIO_RESET_PURGE_TX, 0)?;
        link.arm_read(None)?;
        self.rx.clear();
        debug!("Purged RX/TX buffers");
        Ok(())
    }

    fn reset_device(&mut self) -> Result<()> {
        self.link()?.control(ftdi::SIO_RESET, ftdi::SIO_RESET_SIO, 0)?;
        debug!("Reset FTDI bridge");
        Ok(())
    }

    fn set_latency_timer(&mut self, ms: u8) -> Result<()> {
        self.link()?
            .control(ftdi::SIO_SET_LATENCY_TIMER, ms as u16, 0)?;
        debug!("Latency timer set to {} ms", ms);
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        let divisor = ftdi::baud_divisor(baud).ok_or_else(|| {
            FalconError::device(BACKEND, None, format!("unsupported baud rate {baud}"))
        })?;
        self.link()?.control(ftdi::SIO_SET_BAUD_RATE, divisor, 0)?;
        debug!("Baud rate set to {} (divisor 0x{:04X})", baud, divisor);
        Ok(())
    }

    fn set_line_config(&mut self, config: LineConfig) -> Result<()> {
        let link = self.link()?;
        link.control(ftdi::SIO_SET_DATA, ftdi::data_value(&config), 0)?;
        link.control(ftdi::SIO_SET_FLOW_CTRL, 0, ftdi::flow_index(&config))
    }

    fn set_dtr(&mut self, high: bool) -> Result<()> {
        self.link()?
            .control(ftdi::SIO_MODEM_CTRL, ftdi::dtr_value(high), 0)
    }

    fn set_rts(&mut self, high: bool) -> Result<()> {
        self.link()?
            .control(ftdi::SIO_MODEM_CTRL, ftdi::rts_value(high), 0)
    }

    fn upload_chunk_size(&self) -> usize {
        USB_CHUNK_SIZE
    }

    fn requires_poll(&self) -> bool {
        true
    }

    fn has_bytes_available(&self) -> bool {
        !self.rx.is_empty()
    }

    fn poll(&mut self) -> Result<()> {
        let link = self.link.as_mut().ok_or(FalconError::NotValid)?;
        let mut first_error = None;

        while link.out_queue.pending() > 0 {
            let Some(completion) = block_on(poll_once(link.out_queue.next_complete())) else {
                break;
            };
            if let Err(e) = Self::on_write_complete(link, completion) {
                warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }

        while link.in_queue.pending() > 0 {
            let Some(completion) = block_on(poll_once(link.in_queue.next_complete())) else {
                break;
            };
            if let Err(e) = Self::on_read_complete(link, &mut self.rx, completion) {
                warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }

        link.arm_read(None)?;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for AsyncUsbBackend {
    fn drop(&mut self) {
        if self.link.is_some() {
            if let Err(e) = self.close() {
                warn!("Failed to close USB device on drop: {}", e);
            }
        }
    }
}
