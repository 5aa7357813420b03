//! Per-run log file.
//!
//! The only on-disk artifact the oracle produces. The tracing fmt layer
//! tees into this file through the `MakeWriter` impl, and the `/logs`
//! endpoint serves its tail when the operator has opted in.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing_subscriber::fmt::MakeWriter;

/// Handle to the current run's log file.
#[derive(Clone)]
pub struct RunLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl RunLog {
    /// Create `swap-oracle-<utc timestamp>.log` under `dir`.
    pub fn create(dir: &Path) -> eyre::Result<Self> {
        create_dir_all(dir)?;
        let name = format!(
            "swap-oracle-{}.log",
            chrono::Utc::now().format("%Y%m%d-%H%M%S")
        );
        let path = dir.join(name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct RunLogWriter {
    file: Arc<Mutex<File>>,
}

impl io::Write for RunLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

impl<'a> MakeWriter<'a> for RunLog {
    type Writer = RunLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RunLogWriter {
            file: Arc::clone(&self.file),
        }
    }
}

/// Last `limit` lines of the log file.
pub fn tail(path: &Path, limit: usize) -> io::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(limit);
    Ok(lines[start..].iter().map(|s| s.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_tails() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::create(dir.path()).unwrap();

        {
            let mut writer = log.make_writer();
            for i in 0..10 {
                writeln!(writer, "line {i}").unwrap();
            }
            writer.flush().unwrap();
        }

        let lines = tail(log.path(), 3).unwrap();
        assert_eq!(lines, vec!["line 7", "line 8", "line 9"]);

        let all = tail(log.path(), 100).unwrap();
        assert_eq!(all.len(), 10);
    }

    #[test]
    fn file_name_carries_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::create(dir.path()).unwrap();
        let name = log.path().file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("swap-oracle-"));
        assert!(name.ends_with(".log"));
    }
}
