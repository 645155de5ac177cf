//! # Bootloader Protocol
//!
//! One-shot upload of a firmware image into the Falcon's bootloader.
//!
//! ```text
//! Purge ─► InitialConfig ─► FirstHandshake ─► SpeedUp ─► SecondHandshake
//!   ─► StreamUpload ─► FinalSpeed ─► Loaded
//! ```
//!
//! Stages only move forward. A failure anywhere aborts the attempt; retrying
//! means building a fresh [`BootloaderSession`] and starting from `Purge`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{FalconError, Result};
use crate::transport::{TransportBackend, BOOTLOADER_BAUD, FIRMWARE_BAUD, NORMAL_BAUD};

/// First handshake request
pub const HANDSHAKE_1: [u8; 3] = [0x0A, 0x43, 0x0D];

/// Tail of the first handshake reply (some backends prefix a 0x00)
pub const HANDSHAKE_1_REPLY: [u8; 4] = [0x0A, 0x44, 0x2C, 0x0D];

/// Second handshake request
pub const HANDSHAKE_2: [u8; 1] = [0x41];

/// Second handshake acknowledgement
pub const HANDSHAKE_2_REPLY: [u8; 2] = [0x13, 0x41];

/// Timeout for every handshake and echo exchange
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Bootloader stages, in the only order they may be entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootStage {
    Purge,
    InitialConfig,
    FirstHandshake,
    SpeedUp,
    SecondHandshake,
    StreamUpload,
    FinalSpeed,
    Loaded,
}

impl BootStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootStage::Purge => "purge",
            BootStage::InitialConfig => "initial config",
            BootStage::FirstHandshake => "first handshake",
            BootStage::SpeedUp => "speed up",
            BootStage::SecondHandshake => "second handshake",
            BootStage::StreamUpload => "stream upload",
            BootStage::FinalSpeed => "final speed",
            BootStage::Loaded => "loaded",
        }
    }
}

/// A firmware image ready for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    bytes: Vec<u8>,
    source: Option<PathBuf>,
}

impl FirmwareImage {
    /// Load an image from disk
    ///
    /// # Errors
    ///
    /// Returns `FirmwareFileNotValid` if the file can't be read or is empty
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| FalconError::FirmwareFileNotValid(format!("{}: {}", path.display(), e)))?;
        if bytes.is_empty() {
            return Err(FalconError::FirmwareFileNotValid(format!(
                "{}: file is empty",
                path.display()
            )));
        }
        info!("Loaded firmware image {} ({} bytes)", path.display(), bytes.len());
        Ok(Self {
            bytes,
            source: Some(path.to_path_buf()),
        })
    }

    /// Wrap an in-memory image
    ///
    /// # Errors
    ///
    /// Returns `FirmwareFileNotValid` if `bytes` is empty
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(FalconError::FirmwareFileNotValid("image is empty".into()));
        }
        Ok(Self {
            bytes,
            source: None,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// File the image was read from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

/// Result of a successful upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootReport {
    pub final_baud: u32,
    pub bytes_uploaded: usize,
    pub chunks: usize,
}

/// Single-use upload attempt
#[derive(Debug)]
pub struct BootloaderSession {
    stage: Option<BootStage>,
    baud: u32,
    remaining: usize,
    skip_checksum: bool,
}

impl BootloaderSession {
    /// Fresh session that has not entered any stage yet
    ///
    /// # Arguments
    ///
    /// * `skip_checksum` - Accept upload echoes that differ from what was sent.
    ///   Only meant for hosts whose USB stack is known to garble echoes.
    pub fn new(skip_checksum: bool) -> Self {
        Self {
            stage: None,
            baud: 0,
            remaining: 0,
            skip_checksum,
        }
    }

    /// Last stage entered
    pub fn stage(&self) -> Option<BootStage> {
        self.stage
    }

    /// Baud rate the session last configured
    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Image bytes not yet uploaded
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    fn enter(&mut self, next: BootStage) -> Result<()> {
        if self.stage.is_some_and(|current| next <= current) {
            return Err(FalconError::Protocol(format!(
                "illegal bootloader transition {:?} -> {:?}",
                self.stage, next
            )));
        }
        debug!("Bootloader stage: {}", next.as_str());
        self.stage = Some(next);
        Ok(())
    }

    /// Run the whole upload
    ///
    /// # Arguments
    ///
    /// * `transport` - Open transport, driven directly (no packet framing)
    /// * `image` - Firmware to upload
    ///
    /// # Returns
    ///
    /// * `Result<BootReport>` - Upload summary, or the error that aborted it
    ///
    /// # Errors
    ///
    /// * `Handshake` - Missing or wrong handshake reply
    /// * `ReadError` - Upload echo shorter than the chunk sent
    /// * `ChecksumMismatch` - Echo differs from the chunk sent (unless skipped)
    /// * Any transport error
    pub fn run(
        mut self,
        transport: &mut dyn TransportBackend,
        image: &FirmwareImage,
    ) -> Result<BootReport> {
        self.enter(BootStage::Purge)?;
        transport.purge()?;
        transport.reset_device()?;

        self.enter(BootStage::InitialConfig)?;
        transport.set_firmware_mode()?;
        self.baud = FIRMWARE_BAUD;

        self.enter(BootStage::FirstHandshake)?;
        self.first_handshake(transport)?;

        self.enter(BootStage::SpeedUp)?;
        transport.set_dtr(false)?;
        transport.set_baud_rate(BOOTLOADER_BAUD)?;
        self.baud = BOOTLOADER_BAUD;

        self.enter(BootStage::SecondHandshake)?;
        self.second_handshake(transport)?;

        self.enter(BootStage::StreamUpload)?;
        let chunks = self.stream_upload(transport, image)?;

        self.enter(BootStage::FinalSpeed)?;
        transport.set_normal_mode()?;
        self.baud = NORMAL_BAUD;

        self.enter(BootStage::Loaded)?;
        info!("Firmware uploaded: {} bytes in {} chunks", image.len(), chunks);

        Ok(BootReport {
            final_baud: self.baud,
            bytes_uploaded: image.len(),
            chunks,
        })
    }

    fn first_handshake(&mut self, transport: &mut dyn TransportBackend) -> Result<()> {
        write_exact(transport, &HANDSHAKE_1, "first handshake")?;

        let mut reply = [0u8; 8];
        let want = transport.handshake_reply_len().clamp(HANDSHAKE_1_REPLY.len(), reply.len());
        let n = transport.read_blocking(&mut reply[..want], EXCHANGE_TIMEOUT)?;
        let reply = &reply[..n];

        if n < HANDSHAKE_1_REPLY.len() || !reply.ends_with(&HANDSHAKE_1_REPLY) {
            return Err(FalconError::Handshake {
                stage: "first handshake",
                reason: format!("unexpected reply {:02X?}", reply),
            });
        }
        Ok(())
    }

    fn second_handshake(&mut self, transport: &mut dyn TransportBackend) -> Result<()> {
        write_exact(transport, &HANDSHAKE_2, "second handshake")?;

        let mut reply = [0u8; HANDSHAKE_2_REPLY.len()];
        let n = transport.read_blocking(&mut reply, EXCHANGE_TIMEOUT)?;
        let reply = &reply[..n];

        // One-byte replies carry either half of the acknowledgement
        if n == 0 || !(HANDSHAKE_2_REPLY.starts_with(reply) || HANDSHAKE_2_REPLY.ends_with(reply)) {
            return Err(FalconError::Handshake {
                stage: "second handshake",
                reason: format!("unexpected reply {:02X?}", reply),
            });
        }
        Ok(())
    }

    fn stream_upload(
        &mut self,
        transport: &mut dyn TransportBackend,
        image: &FirmwareImage,
    ) -> Result<usize> {
        let chunk_size = transport.upload_chunk_size();
        let mut echo = vec![0u8; chunk_size];
        let mut offset = 0;
        let mut chunks = 0;
        self.remaining = image.len();

        for chunk in image.as_bytes().chunks(chunk_size) {
            write_exact(transport, chunk, "firmware upload")?;

            let echo = &mut echo[..chunk.len()];
            let n = transport.read_blocking(echo, EXCHANGE_TIMEOUT)?;
            if n < chunk.len() {
                return Err(FalconError::ReadError(format!(
                    "firmware echo at byte {offset}: expected {} bytes, got {n}",
                    chunk.len()
                )));
            }

            if let Some(i) = chunk.iter().zip(echo.iter()).position(|(a, b)| a != b) {
                if self.skip_checksum {
                    warn!("Ignoring firmware echo mismatch at byte {}", offset + i);
                } else {
                    return Err(FalconError::ChecksumMismatch {
                        offset: offset + i,
                        expected: chunk[i],
                        actual: echo[i],
                    });
                }
            }

            offset += chunk.len();
            self.remaining -= chunk.len();
            chunks += 1;
            if chunk.len() < chunk_size {
                debug!("Short chunk of {} bytes ends the image", chunk.len());
            }
        }

        Ok(chunks)
    }
}

fn write_exact(transport: &mut dyn TransportBackend, data: &[u8], what: &str) -> Result<()> {
    let n = transport.write_blocking(data, EXCHANGE_TIMEOUT)?;
    if n != data.len() {
        return Err(FalconError::WriteError(format!(
            "{what}: wrote {n} of {} bytes",
            data.len()
        )));
    }
    Ok(())
}

/// Upload `image`, retrying from scratch up to `retries` times
///
/// # Returns
///
/// * `Result<BootReport>` - First successful attempt, or the last attempt's error
pub fn load_with_retries(
    transport: &mut dyn TransportBackend,
    image: &FirmwareImage,
    retries: u32,
    skip_checksum: bool,
) -> Result<BootReport> {
    let attempts = retries.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match BootloaderSession::new(skip_checksum).run(transport, image) {
            Ok(report) => return Ok(report),
            Err(e) => {
                warn!("Firmware load attempt {}/{} failed: {}", attempt, attempts, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or(FalconError::FirmwareNotLoaded))
}
