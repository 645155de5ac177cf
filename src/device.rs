//! # Falcon Device
//!
//! Public entry point tying one transport, one firmware session and the
//! optional kinematics/grip collaborators together.
//!
//! Typical lifecycle:
//!
//! ```text
//! open(index) ─► [set_firmware_file + load_firmware] ─► run_io_loop() ... ─► close()
//! ```

use std::ops::BitOr;
use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bootloader::{self, BootReport, FirmwareImage};
use crate::collaborators::{Grip, GripState, Kinematics};
use crate::error::{ErrorCode, FalconError, Result};
use crate::packet::protocol::{TelemetryPacket, NUM_AXES};
use crate::session::{FirmwareSession, StepOutcome};
use crate::transport::TransportBackend;

/// Detection attempts for blocking backends
pub const DETECT_ITERATIONS_BLOCKING: usize = 10;

/// Detection attempts for polling backends
pub const DETECT_ITERATIONS_POLLING: usize = 250;

/// Polling detection resets the session this often
const DETECT_RESET_INTERVAL: usize = 100;

/// Pause between polling detection attempts
///
/// Gives the device 250 ms to answer overall; polled USB transfers
/// otherwise finish all attempts within microseconds.
const DETECT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Which stages of [`FalconDevice::run_io_loop`] participate in a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopFlags(u8);

impl LoopFlags {
    pub const NONE: LoopFlags = LoopFlags(0);

    /// Firmware exchange failures are counted and returned
    pub const FIRMWARE: LoopFlags = LoopFlags(0x1);

    /// Decode grip input from each new packet
    pub const GRIP: LoopFlags = LoopFlags(0x2);

    /// Convert force to motor values before, and encoders to position after
    pub const KINEMATIC: LoopFlags = LoopFlags(0x4);

    pub const ALL: LoopFlags = LoopFlags(0x7);

    pub fn contains(&self, other: LoopFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for LoopFlags {
    type Output = LoopFlags;

    fn bitor(self, rhs: LoopFlags) -> LoopFlags {
        LoopFlags(self.0 | rhs.0)
    }
}

/// Outcome of one [`FalconDevice::run_io_loop`] tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// New telemetry arrived and every enabled stage ran
    Packet(TelemetryPacket),

    /// No complete response yet
    NoData,
}

/// One Novint Falcon
pub struct FalconDevice {
    transport: Box<dyn TransportBackend>,
    session: FirmwareSession,
    kinematics: Option<Box<dyn Kinematics>>,
    grip: Option<Box<dyn Grip>>,
    firmware: Option<FirmwareImage>,
    position: [f64; NUM_AXES],
    force: [f64; NUM_AXES],
    grip_state: GripState,
    error_count: u64,
    last_error: Option<ErrorCode>,
}

impl std::fmt::Debug for FalconDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FalconDevice")
            .field("transport", &self.transport.name())
            .field("open", &self.transport.is_open())
            .field("position", &self.position)
            .field("error_count", &self.error_count)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl FalconDevice {
    /// Create a device over a closed transport
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use falcon_driver::device::{FalconDevice, LoopFlags};
    /// use falcon_driver::transport::{BlockingSerialBackend, DeviceMatcher};
    /// use std::time::Duration;
    ///
    /// fn main() -> anyhow::Result<()> {
    ///     let backend = BlockingSerialBackend::new(DeviceMatcher::default(), Duration::from_millis(10));
    ///     let mut falcon = FalconDevice::new(Box::new(backend));
    ///     falcon.open(0)?;
    ///     falcon.run_io_loop(LoopFlags::FIRMWARE)?;
    ///     Ok(())
    /// }
    /// ```
    pub fn new(transport: Box<dyn TransportBackend>) -> Self {
        Self {
            transport,
            session: FirmwareSession::new(),
            kinematics: None,
            grip: None,
            firmware: None,
            position: [0.0; NUM_AXES],
            force: [0.0; NUM_AXES],
            grip_state: GripState::default(),
            error_count: 0,
            last_error: None,
        }
    }

    pub fn set_kinematics(&mut self, kinematics: Box<dyn Kinematics>) {
        self.kinematics = Some(kinematics);
    }

    pub fn set_grip(&mut self, grip: Box<dyn Grip>) {
        self.grip = Some(grip);
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.last_error = Some(e.code());
        }
        result
    }

    fn fail<T>(&mut self, error: FalconError) -> Result<T> {
        self.error_count += 1;
        self.last_error = Some(error.code());
        Err(error)
    }

    /// Number of attached Falcons visible to this device's backend
    pub fn device_count(&mut self) -> Result<usize> {
        let result = self.transport.device_count();
        self.track(result)
    }

    /// Open the `index`th Falcon and switch the line to normal mode
    ///
    /// # Errors
    ///
    /// `NotFound`, `IndexOutOfRange`, or a backend `Device` error
    pub fn open(&mut self, index: usize) -> Result<()> {
        let result = self
            .transport
            .open(index)
            .and_then(|_| self.transport.set_normal_mode());
        self.track(result)?;

        self.session.reset_state();
        info!("Opened Falcon {} on {} backend", index, self.transport.name());
        Ok(())
    }

    /// Close the device
    ///
    /// # Errors
    ///
    /// Returns `NotValid` if the device is not open
    pub fn close(&mut self) -> Result<()> {
        let result = self.transport.close();
        self.track(result)?;
        info!("Closed Falcon");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Read and keep the firmware image to upload
    ///
    /// # Errors
    ///
    /// Returns `FirmwareFileNotValid` if the file is missing, unreadable or empty
    pub fn set_firmware_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let result = FirmwareImage::from_file(path);
        self.firmware = Some(self.track(result)?);
        Ok(())
    }

    /// Keep an in-memory firmware image to upload
    pub fn set_firmware_image(&mut self, bytes: Vec<u8>) -> Result<()> {
        let result = FirmwareImage::from_bytes(bytes);
        self.firmware = Some(self.track(result)?);
        Ok(())
    }

    /// Upload the configured firmware, retrying from scratch on failure
    ///
    /// # Arguments
    ///
    /// * `retries` - Attempts before giving up (at least one is made)
    /// * `skip_checksum` - Accept upload echoes that differ from what was sent
    ///
    /// # Errors
    ///
    /// * `NotValid` - Device not open
    /// * `FirmwareFileNotValid` - No image was set
    /// * The last attempt's error otherwise
    pub fn load_firmware(&mut self, retries: u32, skip_checksum: bool) -> Result<BootReport> {
        if !self.transport.is_open() {
            return self.track(Err(FalconError::NotValid));
        }
        let Some(image) = self.firmware.as_ref() else {
            return self.track(Err(FalconError::FirmwareFileNotValid(
                "no firmware image set".into(),
            )));
        };

        let result =
            bootloader::load_with_retries(self.transport.as_mut(), image, retries, skip_checksum);
        let report = self.track(result)?;

        self.session.reset_state();
        Ok(report)
    }

    /// Check for running firmware by attempting live exchanges
    ///
    /// The device has no other way to report it. Blocking backends get 10
    /// tries, polling backends 250 paced 1 ms apart (with a session reset
    /// every 100).
    pub fn is_firmware_loaded(&mut self) -> bool {
        if !self.transport.is_open() {
            self.last_error = Some(ErrorCode::NotValid);
            return false;
        }

        let polling = self.transport.requires_poll();
        let iterations = if polling {
            DETECT_ITERATIONS_POLLING
        } else {
            DETECT_ITERATIONS_BLOCKING
        };

        for i in 0..iterations {
            if polling && i > 0 {
                thread::sleep(DETECT_POLL_INTERVAL);
                if i % DETECT_RESET_INTERVAL == 0 {
                    self.session.reset_state();
                }
            }
            match self.session.step(self.transport.as_mut()) {
                Ok(StepOutcome::Packet(_)) => {
                    debug!("Firmware answered after {} attempts", i + 1);
                    return true;
                }
                Ok(StepOutcome::NoData) => {}
                Err(e) => debug!("Firmware detection attempt {} failed: {}", i, e),
            }
        }

        self.session.reset_state();
        self.last_error = Some(ErrorCode::FirmwareNotLoaded);
        false
    }

    /// Run one control-loop tick
    ///
    /// With `KINEMATIC`, the pending force is converted to motor values
    /// before the exchange and new encoder values to a position after it.
    /// With `GRIP`, grip input is then decoded from each new packet, so a
    /// grip failure still leaves the position current.
    ///
    /// # Returns
    ///
    /// * `Ok(LoopOutcome::Packet)` - New telemetry, every enabled stage ran
    /// * `Ok(LoopOutcome::NoData)` - No response yet (not an error)
    ///
    /// # Errors
    ///
    /// Firmware errors (only with `FIRMWARE`) and kinematics errors increment
    /// [`FalconDevice::error_count`]. Grip errors are returned without
    /// counting.
    pub fn run_io_loop(&mut self, flags: LoopFlags) -> Result<LoopOutcome> {
        if !self.transport.is_open() {
            return self.track(Err(FalconError::NotValid));
        }

        if flags.contains(LoopFlags::KINEMATIC) {
            if let Some(kinematics) = self.kinematics.as_mut() {
                match kinematics.forces_to_raw(self.position, self.force) {
                    Ok(raw) => self.session.set_forces(raw),
                    Err(e) => return self.fail(e),
                }
            }
        }

        let packet = match self.session.step(self.transport.as_mut()) {
            Ok(StepOutcome::Packet(packet)) => packet,
            Ok(StepOutcome::NoData) => return Ok(LoopOutcome::NoData),
            Err(e) if flags.contains(LoopFlags::FIRMWARE) => return self.fail(e),
            Err(e) => {
                debug!("Ignoring firmware error outside FIRMWARE loop: {}", e);
                return Ok(LoopOutcome::NoData);
            }
        };

        if flags.contains(LoopFlags::KINEMATIC) {
            if let Some(kinematics) = self.kinematics.as_mut() {
                match kinematics.position_from_encoders(packet.encoders) {
                    Ok(position) => self.position = position,
                    Err(e) => return self.fail(e),
                }
            }
        }

        if flags.contains(LoopFlags::GRIP) {
            if let Some(grip) = self.grip.as_mut() {
                match grip.decode(&[self.session.grip_info()]) {
                    Ok(state) => self.grip_state = state,
                    Err(e) => {
                        warn!("Grip decode failed: {}", e);
                        return self.track(Err(e));
                    }
                }
            }
        }

        Ok(LoopOutcome::Packet(packet))
    }

    /// Set the force applied through kinematics on the next `KINEMATIC` tick
    pub fn set_force(&mut self, force: [f64; NUM_AXES]) {
        self.force = force;
    }

    /// Set raw motor values directly (overwritten by `KINEMATIC` ticks)
    pub fn set_raw_forces(&mut self, forces: [i16; NUM_AXES]) {
        self.session.set_forces(forces);
    }

    pub fn set_leds(&mut self, leds: u8) {
        self.session.set_leds(leds);
    }

    pub fn set_homing_mode(&mut self, enabled: bool) {
        self.session.set_homing_mode(enabled);
    }

    pub fn is_homed(&self) -> bool {
        self.session.is_homed()
    }

    /// Last position computed by the kinematics collaborator
    pub fn position(&self) -> [f64; NUM_AXES] {
        self.position
    }

    pub fn force(&self) -> [f64; NUM_AXES] {
        self.force
    }

    pub fn encoders(&self) -> [i16; NUM_AXES] {
        self.session.encoders()
    }

    pub fn grip_state(&self) -> &GripState {
        &self.grip_state
    }

    pub fn session(&self) -> &FirmwareSession {
        &self.session
    }

    /// Firmware and kinematics failures since creation
    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    /// Code of the most recent error
    pub fn last_error(&self) -> Option<ErrorCode> {
        self.last_error
    }

    /// Whether the transport needs [`FalconDevice::poll`] between ticks
    pub fn requires_poll(&self) -> bool {
        self.transport.requires_poll()
    }

    /// Service the transport outside of a loop tick
    pub fn poll(&mut self) -> Result<()> {
        let result = self.transport.poll();
        self.track(result)
    }
}

impl Drop for FalconDevice {
    fn drop(&mut self) {
        if self.transport.is_open() {
            if let Err(e) = self.transport.close() {
                warn!("Failed to close Falcon on drop: {}", e);
            }
        }
    }
}
