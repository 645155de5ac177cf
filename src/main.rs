//! # Falcon Driver
//!
//! Brings up a Novint Falcon and keeps its control loop running.
//!
//! The binary loads the configuration, opens the configured backend, uploads
//! firmware when the device is not already running it, waits for homing and
//! then exchanges command/telemetry packets until Ctrl+C.

use std::future::Future;

use anyhow::{bail, Context, Result};
use tokio::time::{interval, Duration, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use falcon_driver::collaborators::FourButtonGrip;
use falcon_driver::config::{Backend, Config, LoggingConfig, TelemetryConfig};
use falcon_driver::device::{FalconDevice, LoopFlags, LoopOutcome};
use falcon_driver::device_thread::DeviceThread;
use falcon_driver::packet::protocol::{LED_GREEN, LED_RED};
use falcon_driver::telemetry::{TelemetryLogger, TelemetryRecord};
use falcon_driver::transport::{AsyncUsbBackend, BlockingSerialBackend, TransportBackend};

/// Environment variable naming the configuration file
const CONFIG_ENV_VAR: &str = "FALCON_CONFIG";

/// Configuration file used when the environment variable is unset
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// File name prefix for daily-rotated diagnostic logs
const LOG_FILE_NAME: &str = "falcon-driver.log";

/// How often the serial runner reports its snapshot
const STATUS_INTERVAL_MS: u64 = 1000;

/// Main entry point for the Falcon driver
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration (`$FALCON_CONFIG` or `config/default.toml`)
///    - Set up logging with tracing subscriber
///    - Open the configured backend and switch it to normal mode
///    - Upload firmware if the device does not answer detection
///
/// 2. **Main Loop**
///    - Serial backend: ticks on a dedicated thread, status every second
///    - USB backend: ticks from a tokio interval with cooperative polling
///    - LEDs show red until all three encoders are homed, then the configured colours
///
/// 3. **Graceful Shutdown**
///    - Ctrl+C stops the loop, flushes telemetry and closes the device
///
/// # Errors
///
/// Returns error if:
/// - Configuration cannot be loaded or is invalid
/// - No Falcon is attached or it cannot be opened
/// - Firmware is needed but not configured or fails to load
#[tokio::main]
async fn main() -> Result<()> {
    let config_path =
        std::env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let _log_guard = init_logging(&config.logging);

    info!("Falcon Driver v{} starting...", env!("CARGO_PKG_VERSION"));
    debug!("Configuration: {:?}", config);

    let mut device = build_device(&config);
    let count = device.device_count()?;
    info!("Found {} Falcon(s) on {:?} backend", count, config.device.backend);
    if count == 0 {
        bail!("No Falcon devices found");
    }

    device
        .open(config.device.index)
        .with_context(|| format!("Failed to open Falcon {}", config.device.index))?;

    ensure_firmware(&mut device, &config)?;

    device.set_homing_mode(config.io_loop.homing);
    device.set_leds(status_leds(false, config.io_loop.led_bits()));

    let telemetry = open_telemetry(&config.telemetry);

    match config.device.backend {
        Backend::Serial => run_threaded(device, &config, telemetry).await?,
        Backend::Usb => run_polled(device, &config, telemetry).await?,
    }

    info!("Falcon Driver stopped");
    Ok(())
}

/// Install the tracing subscriber, adding a daily file writer when configured
///
/// The returned guard must stay alive for buffered file output to be flushed.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    guard
}

fn build_device(config: &Config) -> FalconDevice {
    let matcher = config.device.matcher();
    let transport: Box<dyn TransportBackend> = match config.device.backend {
        Backend::Serial => Box::new(BlockingSerialBackend::new(
            matcher,
            config.device.read_timeout(),
        )),
        Backend::Usb => Box::new(AsyncUsbBackend::new(matcher)),
    };

    let mut device = FalconDevice::new(transport);
    device.set_grip(Box::new(FourButtonGrip));
    device
}

fn ensure_firmware(device: &mut FalconDevice, config: &Config) -> Result<()> {
    if device.is_firmware_loaded() {
        info!("Firmware already running");
        return Ok(());
    }

    let Some(path) = config.firmware.path.as_deref() else {
        bail!("Firmware is not loaded and no [firmware] path is configured");
    };

    device
        .set_firmware_file(path)
        .with_context(|| format!("Invalid firmware file {}", path))?;
    let report = device
        .load_firmware(config.firmware.retries, config.firmware.skip_checksum)
        .context("Firmware upload failed")?;
    info!(
        "Uploaded {} bytes of firmware in {} chunks",
        report.bytes_uploaded, report.chunks
    );

    if !device.is_firmware_loaded() {
        bail!("Firmware uploaded but the device does not answer");
    }
    Ok(())
}

fn open_telemetry(config: &TelemetryConfig) -> Option<TelemetryLogger> {
    if !config.enabled {
        return None;
    }
    match TelemetryLogger::new(config) {
        Ok(logger) => Some(logger),
        Err(e) => {
            warn!("Telemetry disabled: {}", e);
            None
        }
    }
}

/// LED bits for the current homing state
fn status_leds(homed: bool, configured: u8) -> u8 {
    match (homed, configured) {
        (false, _) => LED_RED,
        (true, 0) => LED_GREEN,
        (true, bits) => bits,
    }
}

fn record_packet(logger: &mut Option<TelemetryLogger>, device: &FalconDevice, outcome: &LoopOutcome) {
    let (Some(logger), LoopOutcome::Packet(packet)) = (logger.as_mut(), outcome) else {
        return;
    };
    let record = TelemetryRecord::new(device.session().loop_count(), packet, device.position());
    if let Err(e) = logger.offer(&record) {
        warn!("Failed to write telemetry: {}", e);
    }
}

/// Resolves on Ctrl+C
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down..."),
        Err(e) => warn!("Ctrl+C listener failed, shutting down: {}", e),
    }
}

/// Call `tick` on every interval tick until `shutdown` resolves
///
/// `shutdown` is pinned once for the whole loop and checked first, so a
/// signal raised during a tick stops the loop before the next one.
async fn run_until<F>(mut ticker: Interval, shutdown: impl Future<Output = ()>, mut tick: F)
where
    F: FnMut(),
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = ticker.tick() => tick(),
        }
    }
}

/// Drive a blocking backend from a worker thread
async fn run_threaded(
    device: FalconDevice,
    config: &Config,
    mut telemetry: Option<TelemetryLogger>,
) -> Result<()> {
    let configured_leds = config.io_loop.led_bits();
    let thread = DeviceThread::spawn(
        device,
        LoopFlags::ALL,
        config.io_loop.period(),
        move |device, outcome| record_packet(&mut telemetry, device, outcome),
    )?;

    info!("Starting IO loop at {}Hz on worker thread", config.io_loop.rate_hz);
    info!("Press Ctrl+C to exit");

    let status_interval = interval(Duration::from_millis(STATUS_INTERVAL_MS));
    let mut homed = false;

    run_until(status_interval, shutdown_signal(), || {
        let snapshot = thread.snapshot();
        if snapshot.homed != homed {
            homed = snapshot.homed;
            info!("Homing {}", if homed { "complete" } else { "lost" });
            thread.set_leds(status_leds(homed, configured_leds));
        }
        info!(
            "Loops: {}, packets: {}, errors: {}, encoders: {:?}, buttons: 0x{:X}",
            snapshot.loops, snapshot.packets, snapshot.errors,
            snapshot.encoders, snapshot.grip_bits
        );
    })
    .await;

    let mut device = thread.stop()?;
    device.close()?;
    Ok(())
}

/// Drive a polling backend cooperatively from the async runtime
async fn run_polled(
    mut device: FalconDevice,
    config: &Config,
    mut telemetry: Option<TelemetryLogger>,
) -> Result<()> {
    let configured_leds = config.io_loop.led_bits();
    let mut loop_interval = interval(config.io_loop.period());
    loop_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("Starting IO loop at {}Hz", config.io_loop.rate_hz);
    info!("Press Ctrl+C to exit");

    let mut loops: u64 = 0;
    let mut packets: u64 = 0;
    let mut last_log_count: u64 = 0;
    let mut homed = false;

    run_until(loop_interval, shutdown_signal(), || {
        loops += 1;
        match device.run_io_loop(LoopFlags::ALL) {
            Ok(outcome) => {
                if matches!(outcome, LoopOutcome::Packet(_)) {
                    packets += 1;
                }
                record_packet(&mut telemetry, &device, &outcome);
            }
            Err(e) => debug!("IO loop error: {}", e),
        }

        if device.is_homed() != homed {
            homed = device.is_homed();
            info!("Homing {}", if homed { "complete" } else { "lost" });
            device.set_leds(status_leds(homed, configured_leds));
        }

        if loops - last_log_count >= config.io_loop.log_interval_loops {
            info!(
                "Loops: {}, packets: {}, errors: {}, encoders: {:?}, buttons: 0x{:X}",
                loops, packets, device.error_count(),
                device.encoders(), device.grip_state().digital_bits
            );
            last_log_count = loops;
        }
    })
    .await;
    info!("Total loops: {}, packets: {}", loops, packets);

    if let Some(logger) = telemetry.as_mut() {
        logger.flush()?;
    }
    device.close()?;
    Ok(())
}
