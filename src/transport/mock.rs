//! Scripted in-memory transport for protocol tests
//!
//! `MockTransport` is a cloneable handle: tests keep one clone to script
//! replies and inspect the call log while the code under test owns another.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::transfer::{Direction, TransferTracker};
use super::{LineConfig, TransportBackend};
use crate::error::{FalconError, Result};
use crate::packet::protocol::{RawPacket, PACKET_LEN};

/// One recorded backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open(usize),
    Close,
    Purge,
    Reset,
    Latency(u8),
    Baud(u32),
    Line(LineConfig),
    Dtr(bool),
    Rts(bool),
    Write(Vec<u8>),
}

/// How writes that have no scripted reply are answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoMode {
    Off,
    Exact,
    /// Echo, but flip the byte at this offset of the overall echo stream
    Corrupt { at: usize },
}

struct MockState {
    open: bool,
    device_count: usize,
    calls: Vec<Call>,
    rx: VecDeque<u8>,
    staged: VecDeque<u8>,
    staged_at: Option<Instant>,
    response_delay: Duration,
    scripted: VecDeque<Vec<u8>>,
    echo: EchoMode,
    echoed: usize,
    telemetry: Option<RawPacket>,
    read_chunk: Option<usize>,
    chunk_size: usize,
    polling: bool,
    write_transfer: TransferTracker,
    fail_writes: bool,
    fail_reads: bool,
    baud: u32,
    dtr: bool,
    rts: bool,
}

/// Shared-state mock backend
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Blocking-style mock with one attached device and 128-byte chunks
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                open: false,
                device_count: 1,
                calls: Vec::new(),
                rx: VecDeque::new(),
                staged: VecDeque::new(),
                staged_at: None,
                response_delay: Duration::ZERO,
                scripted: VecDeque::new(),
                echo: EchoMode::Off,
                echoed: 0,
                telemetry: None,
                read_chunk: None,
                chunk_size: 128,
                polling: false,
                write_transfer: TransferTracker::new(Direction::Write),
                fail_writes: false,
                fail_reads: false,
                baud: 0,
                dtr: false,
                rts: false,
            })),
        }
    }

    /// Polling-style mock: writes stay pending and replies stay staged
    /// until the next `poll()`
    pub fn polling() -> Self {
        let mock = Self::new();
        mock.lock().polling = true;
        mock
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_device_count(&self, count: usize) {
        self.lock().device_count = count;
    }

    /// Queue a reply delivered after the next write
    pub fn script_reply(&self, reply: &[u8]) {
        self.lock().scripted.push_back(reply.to_vec());
    }

    pub fn set_echo(&self, mode: EchoMode) {
        self.lock().echo = mode;
    }

    /// Answer every 16-byte write with this packet
    pub fn set_telemetry(&self, packet: Option<RawPacket>) {
        self.lock().telemetry = packet;
    }

    /// Push bytes straight into the receive buffer
    pub fn inject_rx(&self, bytes: &[u8]) {
        self.lock().rx.extend(bytes);
    }

    /// Limit how many bytes a single read returns
    pub fn set_read_chunk(&self, chunk: Option<usize>) {
        self.lock().read_chunk = chunk;
    }

    /// Hold polled replies back until this long after their write
    pub fn set_response_delay(&self, delay: Duration) {
        self.lock().response_delay = delay;
    }

    pub fn set_chunk_size(&self, size: usize) {
        self.lock().chunk_size = size;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Every payload written, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Write(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn baud(&self) -> u32 {
        self.lock().baud
    }

    pub fn dtr(&self) -> bool {
        self.lock().dtr
    }

    pub fn rts(&self) -> bool {
        self.lock().rts
    }

    pub fn write_pending(&self) -> bool {
        self.lock().write_transfer.is_pending()
    }

    fn open_state(&self) -> Result<MutexGuard<'_, MockState>> {
        let state = self.lock();
        if !state.open {
            return Err(FalconError::NotValid);
        }
        Ok(state)
    }
}

impl MockState {
    fn reply_for(&mut self, data: &[u8]) -> Vec<u8> {
        if let Some(reply) = self.scripted.pop_front() {
            return reply;
        }
        match self.echo {
            EchoMode::Exact => {
                self.echoed += data.len();
                return data.to_vec();
            }
            EchoMode::Corrupt { at } => {
                let mut echo = data.to_vec();
                if (self.echoed..self.echoed + data.len()).contains(&at) {
                    echo[at - self.echoed] ^= 0xFF;
                }
                self.echoed += data.len();
                return echo;
            }
            EchoMode::Off => {}
        }
        match self.telemetry {
            Some(packet) if data.len() == PACKET_LEN => packet.to_vec(),
            _ => Vec::new(),
        }
    }

    fn take_rx(&mut self, buf: &mut [u8]) -> usize {
        let limit = self.read_chunk.unwrap_or(usize::MAX);
        let n = buf.len().min(self.rx.len()).min(limit);
        for (dst, src) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *dst = src;
        }
        n
    }

    fn service(&mut self) {
        self.write_transfer.complete();
        if self
            .staged_at
            .is_some_and(|at| at.elapsed() < self.response_delay)
        {
            return;
        }
        self.staged_at = None;
        let staged: Vec<u8> = self.staged.drain(..).collect();
        self.rx.extend(staged);
    }

    fn drop_in_flight(&mut self) {
        self.write_transfer.cancel();
        self.staged.clear();
        self.staged_at = None;
    }
}

impl TransportBackend for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn device_count(&mut self) -> Result<usize> {
        Ok(self.lock().device_count)
    }

    fn open(&mut self, index: usize) -> Result<()> {
        let mut state = self.lock();
        if state.device_count == 0 {
            return Err(FalconError::NotFound);
        }
        if index >= state.device_count {
            return Err(FalconError::IndexOutOfRange {
                index,
                count: state.device_count,
            });
        }
        state.open = true;
        state.calls.push(Call::Open(index));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.open_state()?;
        state.open = false;
        state.drop_in_flight();
        state.rx.clear();
        state.calls.push(Call::Close);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.open_state()?;
        if state.fail_reads {
            return Err(FalconError::ReadError("mock read failure".into()));
        }
        Ok(state.take_rx(buf))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut state = self.open_state()?;
        if state.fail_writes {
            return Err(FalconError::WriteError("mock write failure".into()));
        }
        if state.polling {
            state.write_transfer.begin(data.len())?;
        }
        state.calls.push(Call::Write(data.to_vec()));

        let reply = state.reply_for(data);
        if state.polling {
            if state.staged.is_empty() && !reply.is_empty() {
                state.staged_at = Some(Instant::now());
            }
            state.staged.extend(reply);
        } else {
            state.rx.extend(reply);
        }
        Ok(data.len())
    }

    fn read_blocking(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        let mut state = self.open_state()?;
        if state.fail_reads {
            return Err(FalconError::ReadError("mock read failure".into()));
        }
        if state.polling {
            state.service();
        }
        let mut total = 0;
        loop {
            let n = state.take_rx(&mut buf[total..]);
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
    }

    fn write_blocking(&mut self, data: &[u8], _timeout: Duration) -> Result<usize> {
        let n = self.write(data)?;
        let mut state = self.lock();
        if state.polling {
            state.service();
        }
        Ok(n)
    }

    fn purge(&mut self) -> Result<()> {
        let mut state = self.open_state()?;
        state.rx.clear();
        state.drop_in_flight();
        state.calls.push(Call::Purge);
        Ok(())
    }

    fn reset_device(&mut self) -> Result<()> {
        self.open_state()?.calls.push(Call::Reset);
        Ok(())
    }

    fn set_latency_timer(&mut self, ms: u8) -> Result<()> {
        self.open_state()?.calls.push(Call::Latency(ms));
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        let mut state = self.open_state()?;
        state.baud = baud;
        state.calls.push(Call::Baud(baud));
        Ok(())
    }

    fn set_line_config(&mut self, config: LineConfig) -> Result<()> {
        self.open_state()?.calls.push(Call::Line(config));
        Ok(())
    }

    fn set_dtr(&mut self, high: bool) -> Result<()> {
        let mut state = self.open_state()?;
        state.dtr = high;
        state.calls.push(Call::Dtr(high));
        Ok(())
    }

    fn set_rts(&mut self, high: bool) -> Result<()> {
        let mut state = self.open_state()?;
        state.rts = high;
        state.calls.push(Call::Rts(high));
        Ok(())
    }

    fn upload_chunk_size(&self) -> usize {
        self.lock().chunk_size
    }

    fn requires_poll(&self) -> bool {
        self.lock().polling
    }

    fn has_bytes_available(&self) -> bool {
        !self.lock().rx.is_empty()
    }

    fn poll(&mut self) -> Result<()> {
        self.open_state()?.service();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_replies_then_echo() {
        let mut mock = MockTransport::new();
        mock.open(0).unwrap();
        mock.script_reply(&[1, 2, 3]);
        mock.set_echo(EchoMode::Exact);

        mock.write(&[9]).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(mock.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);

        mock.write(&[7, 8]).unwrap();
        assert_eq!(mock.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[7, 8]);
    }

    #[test]
    fn test_corrupt_echo_offset_spans_writes() {
        let mut mock = MockTransport::new();
        mock.open(0).unwrap();
        mock.set_echo(EchoMode::Corrupt { at: 5 });

        let mut buf = [0u8; 4];
        mock.write(&[0, 0, 0, 0]).unwrap();
        mock.read(&mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 0]);

        mock.write(&[0, 0, 0, 0]).unwrap();
        mock.read(&mut buf).unwrap();
        assert_eq!(buf, [0, 0xFF, 0, 0]);
    }

    #[test]
    fn test_polling_mode_holds_write_until_poll() {
        let mut mock = MockTransport::polling();
        mock.open(0).unwrap();
        mock.set_echo(EchoMode::Exact);

        mock.write(&[1]).unwrap();
        assert!(mock.write_pending());
        assert!(matches!(
            mock.write(&[2]),
            Err(FalconError::TransferPending("write"))
        ));

        let mut buf = [0u8; 4];
        assert_eq!(mock.read(&mut buf).unwrap(), 0);

        mock.poll().unwrap();
        assert!(!mock.write_pending());
        assert_eq!(mock.read(&mut buf).unwrap(), 1);
        assert_eq!(mock.writes(), vec![vec![1]]);
    }

    #[test]
    fn test_purge_cancels_pending_write() {
        let mut mock = MockTransport::polling();
        mock.open(0).unwrap();
        mock.set_echo(EchoMode::Exact);

        mock.write(&[1]).unwrap();
        assert!(mock.write_pending());

        mock.purge().unwrap();
        assert!(!mock.write_pending());
        mock.write(&[2]).unwrap();
        mock.poll().unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(mock.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 2);
    }

    #[test]
    fn test_response_delay_holds_reply() {
        let mut mock = MockTransport::polling();
        mock.open(0).unwrap();
        mock.set_echo(EchoMode::Exact);
        mock.set_response_delay(Duration::from_millis(20));

        mock.write(&[1]).unwrap();
        mock.poll().unwrap();
        assert!(!mock.write_pending());

        let mut buf = [0u8; 4];
        assert_eq!(mock.read(&mut buf).unwrap(), 0);

        std::thread::sleep(Duration::from_millis(25));
        mock.poll().unwrap();
        assert_eq!(mock.read(&mut buf).unwrap(), 1);
    }

    #[test]
    fn test_read_chunk_limit() {
        let mut mock = MockTransport::new();
        mock.open(0).unwrap();
        mock.inject_rx(&[1, 2, 3, 4, 5]);
        mock.set_read_chunk(Some(2));

        let mut buf = [0u8; 8];
        assert_eq!(mock.read(&mut buf).unwrap(), 2);
        assert_eq!(mock.read_blocking(&mut buf, Duration::ZERO).unwrap(), 3);
    }

    #[test]
    fn test_open_errors() {
        let mut mock = MockTransport::new();
        mock.set_device_count(0);
        assert!(matches!(mock.open(0), Err(FalconError::NotFound)));

        mock.set_device_count(2);
        assert!(matches!(
            mock.open(2),
            Err(FalconError::IndexOutOfRange { index: 2, count: 2 })
        ));
        mock.open(1).unwrap();
        assert!(mock.is_open());
    }
}
