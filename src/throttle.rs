use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use log::debug;
use crate::error::Result;

/// Truncate step for large files during rate-limited removal.
const TRUNCATE_STEP: u64 = 64 * 1024 * 1024;

/// Byte budget per one-second window. A limit of 0 disables throttling.
#[derive(Debug)]
pub struct Throttle {
    limit: u64,
    window_start: Instant,
    used: u64,
}

impl Throttle {
    pub fn new(bytes_per_sec: u64) -> Throttle {
        Throttle {
            limit: bytes_per_sec,
            window_start: Instant::now(),
            used: 0,
        }
    }

    /// Account for `bytes` and sleep if the current window is over budget.
    pub fn consume(&mut self, bytes: u64) {
        if self.limit == 0 {
            return;
        }
        self.used += bytes;
        while self.used >= self.limit {
            let elapsed = self.window_start.elapsed();
            if elapsed < Duration::from_secs(1) {
                thread::sleep(Duration::from_secs(1) - elapsed);
            }
            self.used -= self.limit;
            self.window_start = Instant::now();
        }
    }
}

/// A writer that counts bytes and honors an I/O limit.
pub struct ThrottledWriter<W: Write> {
    inner: W,
    throttle: Throttle,
    written: u64,
}

impl<W: Write> ThrottledWriter<W> {
    pub fn new(inner: W, bytes_per_sec: u64) -> Self {
        ThrottledWriter {
            inner,
            throttle: Throttle::new(bytes_per_sec),
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ThrottledWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        self.throttle.consume(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Remove a file, shrinking it step by step so the unlink does not burst disk I/O.
pub fn remove_file_limited(path: &Path, throttle: &mut Throttle) -> Result<()> {
    let size = fs::symlink_metadata(path)?.len();
    if size > TRUNCATE_STEP && throttle.limit > 0 {
        let file = OpenOptions::new().write(true).open(path)?;
        let mut len = size;
        while len > TRUNCATE_STEP {
            len -= TRUNCATE_STEP;
            file.set_len(len)?;
            throttle.consume(TRUNCATE_STEP);
        }
    } else {
        throttle.consume(size);
    }
    fs::remove_file(path)?;
    Ok(())
}

/// Remove a directory tree at no more than `bytes_per_sec`.
pub fn remove_dir_limited(path: &Path, bytes_per_sec: u64) -> Result<()> {
    let mut throttle = Throttle::new(bytes_per_sec);
    remove_tree(path, &mut throttle)?;
    debug!("removed {}", path.display());
    Ok(())
}

fn remove_tree(path: &Path, throttle: &mut Throttle) -> Result<()> {
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let child = entry.path();
        if entry.file_type()?.is_dir() {
            remove_tree(&child, throttle)?;
        } else {
            remove_file_limited(&child, throttle)?;
        }
    }
    fs::remove_dir(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_unlimited_writer_counts() {
        let mut writer = ThrottledWriter::new(Vec::new(), 0);
        writer.write_all(b"hello world").unwrap();
        assert_eq!(writer.written(), 11);
        assert_eq!(writer.into_inner(), b"hello world");
    }

    #[test]
    fn test_throttle_sleeps_when_over_budget() {
        let mut throttle = Throttle::new(1000);
        let start = Instant::now();
        throttle.consume(1500);
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[test]
    fn test_remove_dir_limited() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("target");
        fs::create_dir_all(root.join("db1")).unwrap();
        fs::write(root.join("db1/t1.sql"), b"insert").unwrap();
        fs::write(root.join("metadata"), b"x").unwrap();
        remove_dir_limited(&root, 0).unwrap();
        assert!(!root.exists());
    }
}
