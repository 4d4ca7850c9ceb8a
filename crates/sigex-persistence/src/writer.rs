//! JSON Lines file writer for audit records.
//!
//! One JSON object per line, appended, flushed and synced to the device per
//! record, so a crash or power loss loses at most the line being written. Files rotate
//! daily: `{base_dir}/{prefix}_{YYYY-MM-DD}.jsonl`.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::PersistenceResult;

/// Active writer state for the current day's file.
struct ActiveWriter {
    writer: BufWriter<File>,
    date: String,
    records_written: usize,
}

/// Append-only JSON Lines writer for records of type `T`.
pub struct JsonLinesWriter<T> {
    base_dir: PathBuf,
    prefix: String,
    active_writer: Option<ActiveWriter>,
    _record: PhantomData<fn(&T)>,
}

impl<T: Serialize> JsonLinesWriter<T> {
    /// Create a writer; the directory is created if missing.
    pub fn new(base_dir: impl AsRef<Path>, prefix: &str) -> Self {
        let base_dir = base_dir.as_ref().to_path_buf();
        if let Err(e) = std::fs::create_dir_all(&base_dir) {
            warn!(?e, dir = %base_dir.display(), "Failed to create directory");
        }

        Self {
            base_dir,
            prefix: prefix.to_string(),
            active_writer: None,
            _record: PhantomData,
        }
    }

    /// Append one record and sync it to disk.
    pub fn append(&mut self, record: &T) -> PersistenceResult<()> {
        let today = Utc::now().format("%Y-%m-%d").to_string();

        let needs_rotation = self
            .active_writer
            .as_ref()
            .map(|w| w.date != today)
            .unwrap_or(false);
        if needs_rotation {
            self.close_active_writer();
        }

        let json = serde_json::to_string(record)?;
        if self.active_writer.is_none() {
            self.active_writer = Some(self.open(&today)?);
        }

        if let Some(active) = self.active_writer.as_mut() {
            writeln!(active.writer, "{json}")?;
            active.writer.flush()?;
            active.writer.get_ref().sync_data()?;
            active.records_written += 1;
        }

        debug!(prefix = %self.prefix, date = %today, "Appended JSON line");
        Ok(())
    }

    fn open(&self, date: &str) -> PersistenceResult<ActiveWriter> {
        let path = self.base_dir.join(format!("{}_{}.jsonl", self.prefix, date));
        info!(path = %path.display(), "Opening JSON Lines writer (append mode)");

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(ActiveWriter {
            writer: BufWriter::new(file),
            date: date.to_string(),
            records_written: 0,
        })
    }

    fn close_active_writer(&mut self) {
        if let Some(mut active) = self.active_writer.take() {
            if let Err(e) = active.writer.flush() {
                warn!(?e, "Failed to flush writer on close");
            }
            info!(
                date = %active.date,
                records = active.records_written,
                "Closed JSON Lines writer"
            );
        }
    }
}

impl<T> Drop for JsonLinesWriter<T> {
    fn drop(&mut self) {
        if let Some(active) = self.active_writer.as_mut() {
            if let Err(e) = active.writer.flush() {
                warn!(?e, "Failed to flush writer on drop");
            }
        }
    }
}

/// Read every record written under `prefix` in `base_dir`, oldest file first.
///
/// Lines that fail to parse are skipped with a warning.
pub fn read_records<T: DeserializeOwned>(
    base_dir: impl AsRef<Path>,
    prefix: &str,
) -> PersistenceResult<Vec<T>> {
    let base_dir = base_dir.as_ref();
    if !base_dir.exists() {
        return Ok(Vec::new());
    }

    let file_prefix = format!("{prefix}_");
    let mut files: Vec<PathBuf> = std::fs::read_dir(base_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&file_prefix) && n.ends_with(".jsonl"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();

    let mut records = Vec::new();
    for path in files {
        let reader = BufReader::new(File::open(&path)?);
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(?e, path = %path.display(), line_no, "Skipping corrupt JSON line"),
            }
        }
    }
    Ok(records)
}
