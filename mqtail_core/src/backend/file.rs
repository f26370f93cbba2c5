//! Flat-file backend
//!
//! The simplest messaging implementation: every record becomes one line
//! in an append-mode output file. Useful for testing the pipeline and
//! for sites that post-process records offline. Each worker holds its
//! own file handle; `reconnect` reopens the file, which also covers log
//! rotation.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{MqtailError, MqtailResult};

use super::{partition_for_key, MqBackend, MqWorker, SendError};

/// Writes one line per record to a shared append-mode file.
pub struct FileBackend {
    path: PathBuf,
    partitions: u32,
}

impl FileBackend {
    /// `partitions` of 0 disables the partition column; otherwise each
    /// keyed record line is prefixed with its computed partition.
    pub fn new(path: &Path, partitions: u32) -> FileBackend {
        FileBackend {
            path: path.to_path_buf(),
            partitions,
        }
    }

    fn open(&self) -> std::io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
    }
}

impl MqBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn global_init(&self, nworkers: usize) -> MqtailResult<()> {
        log::info!(
            "file backend: output {} for {} workers",
            self.path.display(),
            nworkers
        );
        Ok(())
    }

    fn init_connections(&self) -> MqtailResult<()> {
        // confirm the output is writable before any worker starts
        self.open().map_err(|e| {
            MqtailError::backend(
                "file",
                format!("cannot open {}: {}", self.path.display(), e),
            )
        })?;
        Ok(())
    }

    fn worker_init(&self, worker_id: usize) -> MqtailResult<Box<dyn MqWorker>> {
        let file = self.open().map_err(|e| {
            MqtailError::backend(
                "file",
                format!("cannot open {}: {}", self.path.display(), e),
            )
        })?;
        Ok(Box::new(FileWorker {
            file,
            path: self.path.clone(),
            partitions: self.partitions,
            worker_id,
        }))
    }

    fn global_shutdown(&self) -> MqtailResult<()> {
        Ok(())
    }
}

struct FileWorker {
    file: File,
    path: PathBuf,
    partitions: u32,
    worker_id: usize,
}

impl FileWorker {
    fn write_record(&mut self, data: &[u8], key: &[u8]) -> std::io::Result<()> {
        let mut line = Vec::with_capacity(data.len() + key.len() + 16);
        if self.partitions > 0 && !key.is_empty() {
            let partition = partition_for_key(key, self.partitions);
            line.extend_from_slice(partition.to_string().as_bytes());
            line.push(b'\t');
        }
        if !key.is_empty() {
            line.extend_from_slice(key);
            line.push(b'\t');
        }
        line.extend_from_slice(data);
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()
    }
}

impl MqWorker for FileWorker {
    fn send(&mut self, data: &[u8], key: &[u8]) -> Result<(), SendError> {
        // a failed write leaves the handle suspect: force a reopen
        self.write_record(data, key)
            .map_err(|e| SendError::Fatal(format!("write to {} failed: {}", self.path.display(), e)))
    }

    fn version(&self) -> MqtailResult<String> {
        Ok(format!("file/{}", env!("CARGO_PKG_VERSION")))
    }

    fn client_id(&self) -> MqtailResult<String> {
        Ok(format!("{}#{}", self.path.display(), self.worker_id))
    }

    fn reconnect(&mut self) -> MqtailResult<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                MqtailError::backend(
                    "file",
                    format!("cannot reopen {}: {}", self.path.display(), e),
                )
            })?;
        self.file = file;
        Ok(())
    }

    fn shutdown(&mut self) -> MqtailResult<()> {
        self.file
            .flush()
            .map_err(|e| MqtailError::backend("file", format!("flush failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let backend = FileBackend::new(&path, 0);
        backend.global_init(2).unwrap();
        backend.init_connections().unwrap();

        let mut w1 = backend.worker_init(1).unwrap();
        let mut w2 = backend.worker_init(2).unwrap();
        w1.send(b"alpha", b"").unwrap();
        w2.send(b"beta", b"0badcafe").unwrap();
        w1.shutdown().unwrap();
        w2.shutdown().unwrap();

        let out = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines, vec!["alpha", "0badcafe\tbeta"]);
    }

    #[test]
    fn test_partition_column_for_keyed_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let backend = FileBackend::new(&path, 8);

        let mut w = backend.worker_init(1).unwrap();
        w.send(b"payload", b"0badcafe").unwrap();

        let out = std::fs::read_to_string(&path).unwrap();
        let expected = format!("{}\t0badcafe\tpayload\n", 0x0badcafe_u32 & 7);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_reconnect_reopens_after_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let backend = FileBackend::new(&path, 0);

        let mut w = backend.worker_init(1).unwrap();
        w.send(b"before", b"").unwrap();

        // simulate rotation: move the file away, reconnect, send again
        let rotated = dir.path().join("out.1");
        std::fs::rename(&path, &rotated).unwrap();
        w.reconnect().unwrap();
        w.send(b"after", b"").unwrap();

        assert_eq!(std::fs::read_to_string(&rotated).unwrap(), "before\n");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "after\n");
    }

    #[test]
    fn test_connect_identity_strings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let backend = FileBackend::new(&path, 0);
        let w = backend.worker_init(3).unwrap();
        assert!(w.version().unwrap().starts_with("file/"));
        assert!(w.client_id().unwrap().ends_with("#3"));
    }
}
