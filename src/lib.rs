//! # Falcon Driver Library
//!
//! User-space driver for the Novint Falcon haptic controller.
//!
//! This library discovers the Falcon behind its FTDI USB-serial bridge, uploads
//! the firmware through the bootloader handshake, and runs the steady-state
//! command/telemetry exchange that drives the three motors and reads the
//! encoders and grip buttons.

pub mod bootloader;
pub mod collaborators;
pub mod config;
pub mod device;
pub mod device_thread;
pub mod error;
pub mod packet;
pub mod session;
pub mod telemetry;
pub mod transport;
