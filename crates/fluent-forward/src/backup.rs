// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! On-disk persistence of buffer contents that could not be delivered.
//!
//! Each saved payload is one file named `<format>#<param>#...#<unix millis>.buf`. Files are
//! written under a temporary name and renamed into place, so a listing never observes a
//! partially written backup.

use regex::Regex;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, warn};

const PARAM_SEPARATOR: char = '#';
const EXTENSION: &str = "buf";

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("backup I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid backup file pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("backup parameter '{0}' may only contain word characters, '.' or '-'")]
    InvalidParam(String),
    #[error("failed to replay backup: {0}")]
    Replay(String),
}

#[derive(Debug)]
pub struct FileBackup {
    dir: PathBuf,
    format_type: String,
    pattern: Regex,
    last_timestamp: AtomicU64,
}

impl FileBackup {
    pub fn new(dir: impl Into<PathBuf>, format_type: &str) -> Result<Self, BackupError> {
        let pattern = Regex::new(&format!(
            r"^{}#([\w#.\-]+)\.{EXTENSION}$",
            regex::escape(format_type)
        ))?;
        Ok(FileBackup {
            dir: dir.into(),
            format_type: format_type.to_string(),
            pattern,
            last_timestamp: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Unix millis, strictly greater than any value handed out before by this store.
    fn next_timestamp(&self) -> u64 {
        #[allow(clippy::cast_possible_truncation)]
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let mut previous = self.last_timestamp.load(Ordering::Relaxed);
        loop {
            let next = now.max(previous + 1);
            match self.last_timestamp.compare_exchange_weak(
                previous,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => previous = actual,
            }
        }
    }

    /// Writes `data` to a new backup file and returns its path.
    pub fn save(&self, mut params: Vec<String>, data: &[u8]) -> Result<PathBuf, BackupError> {
        if let Some(param) = params.iter().find(|p| !is_valid_param(p)) {
            return Err(BackupError::InvalidParam(param.clone()));
        }
        fs::create_dir_all(&self.dir)?;

        params.push(self.next_timestamp().to_string());
        let mut name = self.format_type.clone();
        for param in &params {
            name.push(PARAM_SEPARATOR);
            name.push_str(param);
        }
        let path = self.dir.join(format!("{name}.{EXTENSION}"));
        let tmp = self.dir.join(format!("{name}.{EXTENSION}.tmp"));

        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        debug!("Saved {} bytes to backup {}", data.len(), path.display());
        Ok(path)
    }

    /// Backups of this store's format, oldest first.
    pub fn saved_buffers(&self) -> Result<Vec<SavedBuffer>, BackupError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut saved = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(captured) = self.pattern.captures(name).and_then(|c| c.get(1)) else {
                continue;
            };
            let mut params: Vec<String> = captured
                .as_str()
                .split(PARAM_SEPARATOR)
                .map(str::to_string)
                .collect();
            match params.pop().map(|ts| ts.parse::<u64>()) {
                Some(Ok(timestamp)) => saved.push(SavedBuffer {
                    path: entry.path(),
                    params,
                    timestamp,
                }),
                _ => warn!("Ignoring backup file without timestamp: {}", name),
            }
        }
        saved.sort_by_key(|s| s.timestamp);
        Ok(saved)
    }
}

fn is_valid_param(param: &str) -> bool {
    !param.is_empty()
        && param
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '-')
}

/// A backup file found on disk, not yet replayed.
#[derive(Debug)]
pub struct SavedBuffer {
    path: PathBuf,
    params: Vec<String>,
    timestamp: u64,
}

impl SavedBuffer {
    /// Parameters the payload was saved with, without the trailing timestamp.
    #[must_use]
    pub fn params(&self) -> &[String] {
        &self.params
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hands the payload to `replay` and deletes the file if it succeeds.
    ///
    /// Failures are logged and the file is kept for manual inspection. Returns whether the
    /// replay succeeded.
    pub fn open<F, E>(self, replay: F) -> bool
    where
        F: FnOnce(&[String], &[u8]) -> Result<(), E>,
        E: std::fmt::Display,
    {
        if let Err(e) = self.replay(replay) {
            error!("Failed to replay backup {}: {}", self.path.display(), e);
            return false;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(
                "Replayed backup {} but failed to delete it: {}",
                self.path.display(),
                e
            );
        }
        true
    }

    fn replay<F, E>(&self, replay: F) -> Result<(), BackupError>
    where
        F: FnOnce(&[String], &[u8]) -> Result<(), E>,
        E: std::fmt::Display,
    {
        let file = File::open(&self.path)?;
        // mapping an empty file fails on some platforms
        if file.metadata()?.len() == 0 {
            return replay(&self.params, &[]).map_err(|e| BackupError::Replay(e.to_string()));
        }
        // SAFETY: backup files are only written through a rename, never modified in place.
        let map = unsafe { memmap2::Mmap::map(&file)? };
        replay(&self.params, &map).map_err(|e| BackupError::Replay(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tracing_test::traced_test;

    fn params(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_save_names_file_after_format_and_params() {
        let dir = tempdir().unwrap();
        let backup = FileBackup::new(dir.path(), "packed_forward").unwrap();

        let path = backup.save(params(&["0", "app.web"]), b"payload").unwrap();
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("packed_forward#0#app.web#"));
        assert!(name.ends_with(".buf"));
        assert_eq!(fs::read(&path).unwrap(), b"payload");
    }

    #[test]
    fn test_round_trip_deletes_file() {
        let dir = tempdir().unwrap();
        let backup = FileBackup::new(dir.path().join("nested"), "packed_forward").unwrap();
        let path = backup.save(params(&["1", "app.db"]), b"\x92\x01\x80").unwrap();

        let saved = backup.saved_buffers().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].params(), &params(&["1", "app.db"])[..]);

        let mut replayed = Vec::new();
        let ok = saved.into_iter().next().unwrap().open(|p, data| {
            assert_eq!(p, &params(&["1", "app.db"])[..]);
            replayed.extend_from_slice(data);
            Ok::<(), BackupError>(())
        });
        assert!(ok);
        assert_eq!(replayed, b"\x92\x01\x80");
        assert!(!path.exists());
    }

    #[test]
    #[traced_test]
    fn test_failed_replay_keeps_file() {
        let dir = tempdir().unwrap();
        let backup = FileBackup::new(dir.path(), "message").unwrap();
        let path = backup.save(Vec::new(), b"corrupt").unwrap();

        let saved = backup.saved_buffers().unwrap().into_iter().next().unwrap();
        let ok = saved.open(|_, _| Err("cannot decode"));
        assert!(!ok);
        assert!(path.exists());
        assert!(logs_contain("cannot decode"));
    }

    #[test]
    fn test_listing_ignores_other_formats_and_sorts_by_time() {
        let dir = tempdir().unwrap();
        let packed = FileBackup::new(dir.path(), "packed_forward").unwrap();
        let message = FileBackup::new(dir.path(), "message").unwrap();

        packed.save(params(&["0", "first"]), b"1").unwrap();
        message.save(Vec::new(), b"m").unwrap();
        packed.save(params(&["0", "second"]), b"2").unwrap();
        fs::write(dir.path().join("packed_forward#junk.buf"), b"x").unwrap();
        fs::write(dir.path().join("unrelated.txt"), b"x").unwrap();

        let tags: Vec<String> = packed
            .saved_buffers()
            .unwrap()
            .iter()
            .map(|s| s.params()[1].clone())
            .collect();
        assert_eq!(tags, vec!["first".to_string(), "second".to_string()]);
        assert_eq!(message.saved_buffers().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let dir = tempdir().unwrap();
        let backup = FileBackup::new(dir.path(), "message").unwrap();
        backup.save(Vec::new(), b"").unwrap();

        let saved = backup.saved_buffers().unwrap().into_iter().next().unwrap();
        assert!(saved.params().is_empty());
        assert!(saved.open(|_, data| {
            assert!(data.is_empty());
            Ok::<(), BackupError>(())
        }));
    }

    #[test]
    fn test_rejects_params_that_cannot_be_listed() {
        let dir = tempdir().unwrap();
        let backup = FileBackup::new(dir.path(), "packed_forward").unwrap();
        let err = backup.save(params(&["0", "a#b"]), b"x").unwrap_err();
        assert!(matches!(err, BackupError::InvalidParam(_)));
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let backup = FileBackup::new("/nonexistent", "message").unwrap();
        let first = backup.next_timestamp();
        let second = backup.next_timestamp();
        assert!(second > first);
    }

    #[test]
    fn test_missing_directory_lists_nothing() {
        let dir = tempdir().unwrap();
        let backup = FileBackup::new(dir.path().join("absent"), "message").unwrap();
        assert!(backup.saved_buffers().unwrap().is_empty());
    }
}
