//! # Firmware Session
//!
//! Steady-state half-duplex exchange with the running Novint firmware: one
//! command packet out, one telemetry packet back, never two commands in
//! flight.

use tracing::{debug, trace, warn};

use crate::error::{FalconError, Result};
use crate::packet::decoder::decode_telemetry;
use crate::packet::encoder::encode_command;
use crate::packet::protocol::*;
use crate::packet::reassembly::ReassemblyBuffer;
use crate::transport::TransportBackend;

/// Receive scratch size (one full USB IN payload)
const RX_SCRATCH_LEN: usize = 64;

/// Ticks a polling backend may wait for a response before the command is
/// considered lost and re-sent
pub const MAX_AWAIT_TICKS: u32 = 100;

/// Half-duplex turn state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// Free to send the next command
    #[default]
    Idle,

    /// A command is out and its response has not arrived yet
    AwaitingResponse { ticks: u32 },
}

/// Command and telemetry state kept for the device's lifetime
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FirmwareLoopState {
    pub forces: [i16; NUM_AXES],
    pub leds: u8,
    pub homing_mode: bool,
    pub encoders: [i16; NUM_AXES],
    pub homing_status: u8,
    pub grip_info: u8,
    pub link: LinkState,
    pub last_packet: Option<TelemetryPacket>,
}

/// Outcome of one loop tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A complete telemetry packet was received and decoded
    Packet(TelemetryPacket),

    /// Nothing complete yet; try again next tick
    NoData,
}

/// Steady-state session over any transport
#[derive(Debug)]
pub struct FirmwareSession {
    state: FirmwareLoopState,
    reassembly: ReassemblyBuffer,
    rx: [u8; RX_SCRATCH_LEN],
    loop_count: u64,
}

impl Default for FirmwareSession {
    fn default() -> Self {
        Self::new()
    }
}

impl FirmwareSession {
    pub fn new() -> Self {
        Self {
            state: FirmwareLoopState::default(),
            reassembly: ReassemblyBuffer::new(),
            rx: [0u8; RX_SCRATCH_LEN],
            loop_count: 0,
        }
    }

    /// Run one tick of the exchange
    ///
    /// Polls polling backends, sends the current command if no command is
    /// outstanding, then reads once and feeds every byte to the reassembler.
    ///
    /// # Returns
    ///
    /// * `Ok(StepOutcome::Packet)` - A response arrived and was decoded
    /// * `Ok(StepOutcome::NoData)` - No complete response yet
    ///
    /// # Errors
    ///
    /// Transport errors are returned unchanged. A short write is `WriteError`.
    pub fn step(&mut self, transport: &mut dyn TransportBackend) -> Result<StepOutcome> {
        self.loop_count += 1;
        let polling = transport.requires_poll();

        if polling {
            transport.poll()?;
        }

        if self.state.link == LinkState::Idle {
            let packet = encode_command(&self.command());
            let written = transport.write(&packet)?;
            if written != PACKET_LEN {
                return Err(FalconError::WriteError(format!(
                    "short command write: {written} of {PACKET_LEN} bytes"
                )));
            }
            self.state.link = LinkState::AwaitingResponse { ticks: 0 };
        }

        let n = transport.read(&mut self.rx)?;
        let completed = self.reassembly.feed_slice(&self.rx[..n]);

        let Some(raw) = completed else {
            self.note_no_response(polling);
            return Ok(StepOutcome::NoData);
        };
        self.reassembly.clear_ready();

        let telemetry = decode_telemetry(&raw)?;
        self.apply(&telemetry);
        self.state.link = LinkState::Idle;
        trace!("Telemetry: encoders {:?}, info 0x{:02X}", telemetry.encoders, telemetry.info);

        Ok(StepOutcome::Packet(telemetry))
    }

    fn note_no_response(&mut self, polling: bool) {
        let LinkState::AwaitingResponse { ticks } = self.state.link else {
            return;
        };

        // A blocking read already waited out its timeout
        if !polling {
            self.state.link = LinkState::Idle;
            return;
        }

        let ticks = ticks + 1;
        if ticks >= MAX_AWAIT_TICKS {
            warn!("No response after {} ticks, re-sending command", ticks);
            self.state.link = LinkState::Idle;
        } else {
            self.state.link = LinkState::AwaitingResponse { ticks };
        }
    }

    fn apply(&mut self, telemetry: &TelemetryPacket) {
        self.state.encoders = telemetry.encoders;
        self.state.homing_status = telemetry.homing_status();
        self.state.grip_info = telemetry.grip_bits();
        self.state.last_packet = Some(*telemetry);
    }

    /// Command that the next write will carry
    pub fn command(&self) -> CommandPacket {
        CommandPacket::new(self.state.forces, self.state.leds, self.state.homing_mode)
    }

    /// Drop the outstanding-command flag and any partial packet
    pub fn reset_state(&mut self) {
        debug!("Resetting firmware session state");
        self.state.link = LinkState::Idle;
        self.reassembly.reset();
    }

    pub fn set_forces(&mut self, forces: [i16; NUM_AXES]) {
        self.state.forces = forces;
    }

    /// Set the LED bitfield (`LED_RED | LED_GREEN | LED_BLUE`)
    pub fn set_leds(&mut self, leds: u8) {
        self.state.leds = leds & LED_MASK;
    }

    /// Ask the device to stay in homing mode
    pub fn set_homing_mode(&mut self, enabled: bool) {
        self.state.homing_mode = enabled;
    }

    pub fn state(&self) -> &FirmwareLoopState {
        &self.state
    }

    pub fn encoders(&self) -> [i16; NUM_AXES] {
        self.state.encoders
    }

    /// Per-encoder homing bits from the last telemetry
    pub fn homing_status(&self) -> u8 {
        self.state.homing_status
    }

    /// True when all three encoders reported homed in the last telemetry
    pub fn is_homed(&self) -> bool {
        self.state.homing_status == ALL_ENCODERS_HOMED
    }

    /// Raw grip bits from the last telemetry
    pub fn grip_info(&self) -> u8 {
        self.state.grip_info
    }

    /// Ticks run since creation
    pub fn loop_count(&self) -> u64 {
        self.loop_count
    }

    pub fn reassembly(&self) -> &ReassemblyBuffer {
        &self.reassembly
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn telemetry(encoders: [i16; 3], info: u8) -> RawPacket {
        // Telemetry uses the same wire layout as commands
        let mut cmd = CommandPacket::new(encoders, 0, false);
        cmd.info = info;
        encode_command(&cmd)
    }

    fn open_mock() -> MockTransport {
        let mut mock = MockTransport::new();
        mock.open(0).unwrap();
        mock
    }

    #[test]
    fn test_step_round_trip() {
        let mut mock = open_mock();
        mock.set_telemetry(Some(telemetry([10, -20, 30], 0x73)));

        let mut session = FirmwareSession::new();
        session.set_forces([100, 200, -300]);
        session.set_leds(LED_RED);
        session.set_homing_mode(true);

        let outcome = session.step(&mut mock).unwrap();
        let StepOutcome::Packet(packet) = outcome else {
            panic!("expected a packet, got {outcome:?}");
        };
        assert_eq!(packet.encoders, [10, -20, 30]);
        assert_eq!(session.encoders(), [10, -20, 30]);
        assert_eq!(session.grip_info(), 0x3);
        assert!(session.is_homed());
        assert_eq!(session.state().link, LinkState::Idle);

        let writes = mock.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(
            writes[0],
            encode_command(&CommandPacket::new([100, 200, -300], LED_RED, true))
        );
    }

    #[test]
    fn test_step_no_data_is_not_an_error() {
        let mut mock = open_mock();
        let mut session = FirmwareSession::new();

        assert_eq!(session.step(&mut mock).unwrap(), StepOutcome::NoData);
        assert_eq!(session.loop_count(), 1);
    }

    #[test]
    fn test_blocking_backend_resends_after_empty_read() {
        let mut mock = open_mock();
        let mut session = FirmwareSession::new();

        session.step(&mut mock).unwrap();
        session.step(&mut mock).unwrap();
        assert_eq!(mock.writes().len(), 2);
    }

    #[test]
    fn test_partial_packet_across_steps() {
        let mut mock = open_mock();
        mock.set_read_chunk(Some(10));
        mock.set_telemetry(Some(telemetry([1, 2, 3], 0)));

        let mut session = FirmwareSession::new();
        assert_eq!(session.step(&mut mock).unwrap(), StepOutcome::NoData);
        // Blocking backend re-sends; the rest of the first reply completes
        let outcome = session.step(&mut mock).unwrap();
        assert!(matches!(outcome, StepOutcome::Packet(p) if p.encoders == [1, 2, 3]));
    }

    #[test]
    fn test_polling_backend_waits_for_response() {
        let mut mock = MockTransport::polling();
        mock.open(0).unwrap();
        mock.set_telemetry(Some(telemetry([7, 8, 9], 0)));

        let mut session = FirmwareSession::new();

        // Tick 1: write submitted, nothing received yet
        assert_eq!(session.step(&mut mock).unwrap(), StepOutcome::NoData);
        assert!(mock.write_pending());
        assert!(matches!(session.state().link, LinkState::AwaitingResponse { .. }));

        // Tick 2: poll completes the write and delivers the response
        let outcome = session.step(&mut mock).unwrap();
        assert!(matches!(outcome, StepOutcome::Packet(p) if p.encoders == [7, 8, 9]));
        assert_eq!(mock.writes().len(), 1);
    }

    #[test]
    fn test_polling_backend_resends_after_lost_response() {
        let mut mock = MockTransport::polling();
        mock.open(0).unwrap();

        let mut session = FirmwareSession::new();
        for _ in 0..MAX_AWAIT_TICKS {
            assert_eq!(session.step(&mut mock).unwrap(), StepOutcome::NoData);
        }
        assert_eq!(mock.writes().len(), 1);

        session.step(&mut mock).unwrap();
        assert_eq!(mock.writes().len(), 2);
    }

    #[test]
    fn test_transport_errors_propagate() {
        let mut mock = open_mock();
        mock.set_fail_writes(true);
        let mut session = FirmwareSession::new();
        assert!(matches!(session.step(&mut mock), Err(FalconError::WriteError(_))));

        mock.set_fail_writes(false);
        mock.set_fail_reads(true);
        assert!(matches!(session.step(&mut mock), Err(FalconError::ReadError(_))));
    }

    #[test]
    fn test_reset_state() {
        let mut mock = MockTransport::polling();
        mock.open(0).unwrap();

        let mut session = FirmwareSession::new();
        session.step(&mut mock).unwrap();
        assert_ne!(session.state().link, LinkState::Idle);

        session.reset_state();
        assert_eq!(session.state().link, LinkState::Idle);
        assert_eq!(session.reassembly().cursor(), 0);
    }

    #[test]
    fn test_set_leds_masks_unknown_bits() {
        let mut session = FirmwareSession::new();
        session.set_leds(0xFF);
        assert_eq!(session.command().leds(), LED_MASK);
        assert!(!session.command().homing_mode());
    }
}
