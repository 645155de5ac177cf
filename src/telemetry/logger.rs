//! JSONL telemetry writer with record-count rotation and file retention

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{debug, info, warn};

use crate::config::TelemetryConfig;
use crate::error::Result;
use crate::telemetry::types::TelemetryRecord;

const FILE_PREFIX: &str = "telemetry_";
const FILE_EXTENSION: &str = "jsonl";

/// Rotating JSONL writer
#[derive(Debug)]
pub struct TelemetryLogger {
    dir: PathBuf,
    max_records_per_file: u64,
    max_files_to_keep: usize,
    sample_every: u64,
    offered: u64,
    records_in_file: u64,
    files_opened: u64,
    writer: Option<BufWriter<File>>,
    current_path: Option<PathBuf>,
}

impl TelemetryLogger {
    /// Create a logger writing into `config.log_dir`
    ///
    /// The directory is created if missing. No file is opened until the
    /// first record is written.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the directory cannot be created.
    pub fn new(config: &TelemetryConfig) -> Result<Self> {
        let dir = PathBuf::from(&config.log_dir);
        fs::create_dir_all(&dir)?;
        info!("Telemetry logging to {}", dir.display());

        Ok(Self {
            dir,
            max_records_per_file: config.max_records_per_file as u64,
            max_files_to_keep: config.max_files_to_keep,
            sample_every: config.sample_every.max(1) as u64,
            offered: 0,
            records_in_file: 0,
            files_opened: 0,
            writer: None,
            current_path: None,
        })
    }

    /// Offer a record, writing only every `sample_every`th one
    ///
    /// # Returns
    ///
    /// `true` if the record was written.
    pub fn offer(&mut self, record: &TelemetryRecord) -> Result<bool> {
        self.offered += 1;
        if (self.offered - 1) % self.sample_every != 0 {
            return Ok(false);
        }
        self.write(record)?;
        Ok(true)
    }

    /// Append one record, rotating first if the current file is full
    pub fn write(&mut self, record: &TelemetryRecord) -> Result<()> {
        if self.writer.is_none() || self.records_in_file >= self.max_records_per_file {
            self.rotate()?;
        }

        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        serde_json::to_writer(&mut *writer, record).map_err(io::Error::from)?;
        writer.write_all(b"\n")?;
        self.records_in_file += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// File currently being written, if any
    pub fn current_path(&self) -> Option<&Path> {
        self.current_path.as_deref()
    }

    fn rotate(&mut self) -> Result<()> {
        self.flush()?;

        let name = format!(
            "{}{}_{:04}.{}",
            FILE_PREFIX,
            Local::now().format("%Y%m%d_%H%M%S"),
            self.files_opened,
            FILE_EXTENSION
        );
        let path = self.dir.join(name);
        debug!("Opening telemetry file {}", path.display());

        self.writer = Some(BufWriter::new(File::create(&path)?));
        self.current_path = Some(path);
        self.records_in_file = 0;
        self.files_opened += 1;

        self.prune()
    }

    /// Delete the oldest telemetry files beyond `max_files_to_keep`
    fn prune(&self) -> Result<()> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_telemetry_file(path))
            .collect();

        if files.len() <= self.max_files_to_keep {
            return Ok(());
        }

        // Names start with a sortable timestamp
        files.sort();
        let excess = files.len() - self.max_files_to_keep;
        for path in files.into_iter().take(excess) {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove old telemetry file {}: {}", path.display(), e);
            }
        }
        Ok(())
    }
}

fn is_telemetry_file(path: &Path) -> bool {
    let named = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(FILE_PREFIX));
    named && path.extension().is_some_and(|ext| ext == FILE_EXTENSION)
}

impl Drop for TelemetryLogger {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Failed to flush telemetry on drop: {}", e);
        }
    }
}
