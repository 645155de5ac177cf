//! # Error Types
//!
//! Custom error types for the Falcon driver using `thiserror`.

use thiserror::Error;

/// Main error type for the Falcon driver
#[derive(Debug, Error)]
pub enum FalconError {
    /// Backend library could not be initialized (USB context, port enumeration)
    #[error("Transport not initialized: {0}")]
    NotInitialized(String),

    /// No matching device is attached
    #[error("No Falcon device found")]
    NotFound,

    /// Device used before open or after close
    #[error("Device not open")]
    NotValid,

    /// Requested device index exceeds the number of attached devices
    #[error("Device index {index} out of range ({count} devices found)")]
    IndexOutOfRange { index: usize, count: usize },

    /// Firmware file missing, unreadable or empty
    #[error("Firmware file not valid: {0}")]
    FirmwareFileNotValid(String),

    /// Firmware detection never got a clean exchange back from the device
    #[error("No firmware loaded on device")]
    FirmwareNotLoaded,

    /// Upload echo differs from the bytes that were sent
    #[error("Firmware checksum mismatch at byte {offset}: sent 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { offset: usize, expected: u8, actual: u8 },

    /// Bootloader handshake reply was missing or wrong
    #[error("Bootloader handshake failed during {stage}: {reason}")]
    Handshake { stage: &'static str, reason: String },

    /// Read failed or timed out
    #[error("Read error: {0}")]
    ReadError(String),

    /// Write failed, was short, or timed out
    #[error("Write error: {0}")]
    WriteError(String),

    /// A same-direction transfer is still in flight
    #[error("{0} transfer already pending")]
    TransferPending(&'static str),

    /// Backend-native failure, with the native code when one exists
    #[error("{backend} device error{}: {message}", .code.map(|c| format!(" ({c})")).unwrap_or_default())]
    Device {
        backend: &'static str,
        code: Option<i32>,
        message: String,
    },

    /// Steady-state packet framing errors
    #[error("Packet protocol error: {0}")]
    Protocol(String),

    /// Kinematics collaborator failure
    #[error("Kinematics error: {0}")]
    Kinematics(String),

    /// Grip collaborator failure
    #[error("Grip error: {0}")]
    Grip(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Copyable error code kept as the "last error" of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotInitialized,
    NotFound,
    NotValid,
    IndexOutOfRange,
    FirmwareFileNotValid,
    FirmwareNotLoaded,
    ChecksumMismatch,
    Handshake,
    ReadError,
    WriteError,
    TransferPending,
    DeviceError,
    Protocol,
    Kinematics,
    Grip,
    Config,
    Io,
}

impl FalconError {
    /// Classify this error into its taxonomy code
    pub fn code(&self) -> ErrorCode {
        match self {
            FalconError::NotInitialized(_) => ErrorCode::NotInitialized,
            FalconError::NotFound => ErrorCode::NotFound,
            FalconError::NotValid => ErrorCode::NotValid,
            FalconError::IndexOutOfRange { .. } => ErrorCode::IndexOutOfRange,
            FalconError::FirmwareFileNotValid(_) => ErrorCode::FirmwareFileNotValid,
            FalconError::FirmwareNotLoaded => ErrorCode::FirmwareNotLoaded,
            FalconError::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            FalconError::Handshake { .. } => ErrorCode::Handshake,
            FalconError::ReadError(_) => ErrorCode::ReadError,
            FalconError::WriteError(_) => ErrorCode::WriteError,
            FalconError::TransferPending(_) => ErrorCode::TransferPending,
            FalconError::Device { .. } => ErrorCode::DeviceError,
            FalconError::Protocol(_) => ErrorCode::Protocol,
            FalconError::Kinematics(_) => ErrorCode::Kinematics,
            FalconError::Grip(_) => ErrorCode::Grip,
            FalconError::Config(_) => ErrorCode::Config,
            FalconError::Io(_) => ErrorCode::Io,
        }
    }

    /// Build a backend-native device error
    pub fn device(backend: &'static str, code: Option<i32>, message: impl Into<String>) -> Self {
        FalconError::Device {
            backend,
            code,
            message: message.into(),
        }
    }
}

/// Result type alias for the Falcon driver
pub type Result<T> = std::result::Result<T, FalconError>;
