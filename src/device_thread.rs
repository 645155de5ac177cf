//! # Device Thread
//!
//! Runs [`FalconDevice::run_io_loop`] on a dedicated OS thread for blocking
//! backends, where every read waits out its timeout and would otherwise
//! stall the caller.
//!
//! This module handles:
//! - Fixed-period loop ticks on a worker thread
//! - A mutex-protected [`DeviceSnapshot`] refreshed after every tick
//! - Force/LED updates and arbitrary device access from other threads
//! - Clean shutdown that hands the device back to the caller

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::device::{FalconDevice, LoopFlags, LoopOutcome};
use crate::error::{FalconError, Result};
use crate::packet::protocol::NUM_AXES;

/// State published by the worker after each tick
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DeviceSnapshot {
    pub position: [f64; NUM_AXES],
    pub encoders: [i16; NUM_AXES],
    pub grip_bits: u32,
    pub homed: bool,

    /// Ticks run by the worker
    pub loops: u64,

    /// Ticks that produced a telemetry packet
    pub packets: u64,

    /// Device error counter at the time of the snapshot
    pub errors: u64,
}

/// Worker thread owning a [`FalconDevice`]
pub struct DeviceThread {
    device: Arc<Mutex<FalconDevice>>,
    snapshot: Arc<Mutex<DeviceSnapshot>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeviceThread {
    /// Start ticking `device` every `period`
    ///
    /// `observer` is called with the device still locked after every tick
    /// that succeeded, which is where telemetry recording hooks in.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the OS refuses to spawn the thread.
    pub fn spawn<F>(
        device: FalconDevice,
        flags: LoopFlags,
        period: Duration,
        mut observer: F,
    ) -> Result<Self>
    where
        F: FnMut(&FalconDevice, &LoopOutcome) + Send + 'static,
    {
        let device = Arc::new(Mutex::new(device));
        let snapshot = Arc::new(Mutex::new(DeviceSnapshot::default()));
        let running = Arc::new(AtomicBool::new(true));

        let worker_device = Arc::clone(&device);
        let worker_snapshot = Arc::clone(&snapshot);
        let worker_running = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("falcon-io".into())
            .spawn(move || {
                info!("IO thread started (period: {:?})", period);
                let mut loops = 0u64;
                let mut packets = 0u64;

                while worker_running.load(Ordering::Acquire) {
                    let started = Instant::now();
                    {
                        let mut device = lock(&worker_device);
                        loops += 1;
                        match device.run_io_loop(flags) {
                            Ok(outcome) => {
                                if matches!(outcome, LoopOutcome::Packet(_)) {
                                    packets += 1;
                                }
                                observer(&device, &outcome);
                            }
                            Err(e) => debug!("IO loop error: {}", e),
                        }

                        *lock(&worker_snapshot) = DeviceSnapshot {
                            position: device.position(),
                            encoders: device.encoders(),
                            grip_bits: device.grip_state().digital_bits,
                            homed: device.is_homed(),
                            loops,
                            packets,
                            errors: device.error_count(),
                        };
                    }

                    if let Some(rest) = period.checked_sub(started.elapsed()) {
                        thread::sleep(rest);
                    }
                }

                info!("IO thread stopped after {} loops ({} packets)", loops, packets);
            })?;

        Ok(Self {
            device,
            snapshot,
            running,
            handle: Some(handle),
        })
    }

    /// Copy of the state published after the last tick
    pub fn snapshot(&self) -> DeviceSnapshot {
        *lock(&self.snapshot)
    }

    pub fn set_force(&self, force: [f64; NUM_AXES]) {
        lock(&self.device).set_force(force);
    }

    pub fn set_leds(&self, leds: u8) {
        lock(&self.device).set_leds(leds);
    }

    /// Run `f` with exclusive access to the device between ticks
    pub fn with_device<R>(&self, f: impl FnOnce(&mut FalconDevice) -> R) -> R {
        f(&mut lock(&self.device))
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("IO thread panicked");
            }
        }
    }

    /// Stop the worker and take the device back
    ///
    /// # Errors
    ///
    /// Returns `NotValid` if the device is still shared, which only happens
    /// when the worker could not be joined.
    pub fn stop(mut self) -> Result<FalconDevice> {
        self.shutdown();
        let device = Arc::clone(&self.device);
        drop(self);

        Arc::try_unwrap(device)
            .map_err(|_| FalconError::NotValid)
            .map(|mutex| mutex.into_inner().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Drop for DeviceThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
