//! Append-only live log file with size-limited rotation
//!
//! When a record would push the file past its limit, the current file is
//! renamed to `<stem>__<opened>__<now>.dlt` next to it and a fresh file is
//! opened at the configured path. No record is split or dropped.

use crate::types::Result;
use chrono::{DateTime, Local};
use log::{info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const ROTATE_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

pub struct LogWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    /// Bytes in the current file
    size: u64,
    /// 0 disables rotation
    max_size: u64,
    opened_at: DateTime<Local>,
    rotated: Vec<PathBuf>,
}

impl LogWriter {
    /// Open (or create) the log file for appending
    pub fn open(path: impl Into<PathBuf>, max_file_size_mb: u64) -> Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        let size = file.metadata()?.len();
        info!("Writing live traffic to {} ({} bytes present)", path.display(), size);
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            size,
            max_size: max_file_size_mb.saturating_mul(1024 * 1024),
            opened_at: Local::now(),
            rotated: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Files produced by rotation, oldest first
    pub fn rotated_files(&self) -> &[PathBuf] {
        &self.rotated
    }

    /// Append one complete record (storage header included)
    pub fn write_record(&mut self, record: &[u8]) -> Result<()> {
        if self.max_size > 0 && self.size > 0 && self.size + record.len() as u64 > self.max_size {
            self.rotate()?;
        }
        self.writer.write_all(record)?;
        self.size += record.len() as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        self.writer.flush()?;
        let now = Local::now();
        let stem = self.path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let mut target = self.path.with_file_name(format!(
            "{}__{}__{}.dlt",
            stem,
            self.opened_at.format(ROTATE_TIME_FORMAT),
            now.format(ROTATE_TIME_FORMAT)
        ));
        // two rotations within the same second
        let mut suffix = 1;
        while target.exists() {
            target = self.path.with_file_name(format!(
                "{}__{}__{}_{}.dlt",
                stem,
                self.opened_at.format(ROTATE_TIME_FORMAT),
                now.format(ROTATE_TIME_FORMAT),
                suffix
            ));
            suffix += 1;
        }

        fs::rename(&self.path, &target)?;
        warn!("Log file limit reached, rotated {} to {}", self.path.display(), target.display());

        self.writer = BufWriter::new(open_append(&self.path)?);
        self.size = 0;
        self.opened_at = now;
        self.rotated.push(target);
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!("Failed to flush {}: {}", self.path.display(), e);
        }
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("live.dlt");
        {
            let mut writer = LogWriter::open(&path, 0).unwrap();
            writer.write_record(b"abc").unwrap();
        }
        let mut writer = LogWriter::open(&path, 0).unwrap();
        assert_eq!(writer.size(), 3);
        writer.write_record(b"de").unwrap();
        writer.flush().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"abcde");
    }

    #[test]
    fn test_rotation_keeps_every_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("live.dlt");
        let mut writer = LogWriter::open(&path, 1).unwrap();

        let record = vec![7u8; 400 * 1024];
        for _ in 0..5 {
            writer.write_record(&record).unwrap();
        }
        writer.flush().unwrap();

        let rotated = writer.rotated_files().to_vec();
        assert_eq!(rotated.len(), 2);
        let mut total = fs::metadata(&path).unwrap().len();
        for file in &rotated {
            let name = file.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with("live__"));
            assert!(name.ends_with(".dlt"));
            total += fs::metadata(file).unwrap().len();
        }
        assert_eq!(total, 5 * 400 * 1024);
    }
}
