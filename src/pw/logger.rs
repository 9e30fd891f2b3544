use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Critical,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Critical => "CRIT",
            LogLevel::Error => "ERRO",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBG",
            LogLevel::Trace => "TRAC",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(LogLevel::Critical),
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level {other:?}")),
        }
    }
}

/// A size-rotated file sink with numbered backups.
///
/// Rotation renames `name` -> `name.1` -> ... -> `name.N` and reopens a
/// fresh `name`; with `backups == 0` the chain grows without bound. The
/// file is created lazily on first write, so configured-but-silent
/// programs leave nothing on disk.
#[derive(Debug)]
pub struct RotatingFile {
    path: PathBuf,
    maxbytes: u64,
    backups: u32,
    file: Option<File>,
    offset: u64,
}

impl RotatingFile {
    pub fn new(path: PathBuf, maxbytes: u64, backups: u32) -> Self {
        Self {
            path,
            maxbytes,
            backups,
            file: None,
            offset: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&mut self) -> io::Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.offset = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    /// Append, rotating whenever the current file fills. A single chunk may
    /// span a rotation: the current file is topped up to the threshold,
    /// rotated, and the remainder continues in the fresh file.
    pub fn write(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            self.ensure_open()?;
            if self.maxbytes > 0 && self.offset >= self.maxbytes {
                self.rotate()?;
                continue;
            }
            let room = if self.maxbytes > 0 {
                (self.maxbytes - self.offset).min(buf.len() as u64) as usize
            } else {
                buf.len()
            };
            let file = self.file.as_mut().expect("sink open");
            file.write_all(&buf[..room])?;
            self.offset += room as u64;
            buf = &buf[room..];
        }
        Ok(())
    }

    /// Rename the backup chain and reopen a fresh file, regardless of the
    /// current size.
    pub fn rotate(&mut self) -> io::Result<()> {
        self.file = None;
        if self.path.exists() {
            let last = if self.backups > 0 {
                let oldest = numbered(&self.path, self.backups);
                if oldest.exists() {
                    std::fs::remove_file(&oldest)?;
                }
                self.backups
            } else {
                // Unbounded chain: shift every backup that exists.
                let mut n = 1;
                while numbered(&self.path, n).exists() {
                    n += 1;
                }
                n
            };
            for i in (1..last).rev() {
                let from = numbered(&self.path, i);
                if from.exists() {
                    std::fs::rename(&from, numbered(&self.path, i + 1))?;
                }
            }
            std::fs::rename(&self.path, numbered(&self.path, 1))?;
        }
        self.offset = 0;
        Ok(())
    }

    /// Remove the file and its entire backup chain.
    pub fn clear(&mut self) -> io::Result<()> {
        self.file = None;
        self.offset = 0;
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        let mut n = 1;
        loop {
            let p = numbered(&self.path, n);
            if !p.exists() {
                break;
            }
            std::fs::remove_file(&p)?;
            n += 1;
        }
        Ok(())
    }

    pub fn size(&self) -> u64 {
        match std::fs::metadata(&self.path) {
            Ok(m) => m.len(),
            Err(_) => 0,
        }
    }

    /// Bytes in `[offset, offset+length)` of the current file. A negative
    /// offset counts back from the end; `length == 0` reads to EOF.
    pub fn read_range(&self, offset: i64, length: i64) -> io::Result<Vec<u8>> {
        let size = self.size() as i64;
        let start = if offset < 0 {
            (size + offset).max(0)
        } else {
            offset.min(size)
        };
        let end = if length <= 0 {
            size
        } else {
            (start + length).min(size)
        };
        if end <= start || size == 0 {
            return Ok(Vec::new());
        }
        let mut f = File::open(&self.path)?;
        f.seek(SeekFrom::Start(start as u64))?;
        let mut out = vec![0u8; (end - start) as usize];
        f.read_exact(&mut out)?;
        Ok(out)
    }

    /// Endpoint-relative tail read. The requested offset is clamped into
    /// `[max(0, size-length), size]`; any clamp reports `overflow = true`
    /// (the reader fell behind rotation/truncation or more than `length`
    /// bytes are pending). Returns `(bytes, new_offset, overflow)`.
    pub fn tail(&self, offset: i64, length: i64) -> io::Result<(Vec<u8>, i64, bool)> {
        let size = self.size() as i64;
        let length = length.max(0);
        let floor = (size - length).max(0);
        let mut overflow = false;
        let mut start = offset;
        if start > size || start < floor {
            start = floor;
            overflow = overflow || offset != start;
        }
        let bytes = self.read_range(start, size - start)?;
        Ok((bytes, size, overflow))
    }
}

fn numbered(base: &Path, n: u32) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(format!(".{n}"));
    PathBuf::from(s)
}

/// The daemon's leveled activity log. Messages below the configured level
/// are dropped; everything else is timestamped and appended to the
/// rotating sink (and echoed to stderr in foreground mode).
#[derive(Debug)]
pub struct Logger {
    level: LogLevel,
    sink: RotatingFile,
    echo: bool,
    io_errors: u32,
}

// After this many consecutive sink failures, stop complaining on stderr.
const IO_ERROR_REPORT_LIMIT: u32 = 5;

impl Logger {
    pub fn new(path: PathBuf, maxbytes: u64, backups: u32, level: LogLevel, echo: bool) -> Self {
        Self {
            level,
            sink: RotatingFile::new(path, maxbytes, backups),
            echo,
            io_errors: 0,
        }
    }

    pub fn log(&mut self, level: LogLevel, msg: impl AsRef<str>) {
        if level > self.level {
            return;
        }
        let line = format!(
            "{} {} {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level.as_str(),
            msg.as_ref()
        );
        match self.sink.write(line.as_bytes()) {
            Ok(()) => self.io_errors = 0,
            Err(e) => {
                self.io_errors = self.io_errors.saturating_add(1);
                if self.io_errors <= IO_ERROR_REPORT_LIMIT {
                    eprintln!("procwarden: activity log write failed: {e}");
                }
            }
        }
        if self.echo {
            eprint!("{line}");
        }
    }

    pub fn critical(&mut self, msg: impl AsRef<str>) {
        self.log(LogLevel::Critical, msg);
    }

    pub fn error(&mut self, msg: impl AsRef<str>) {
        self.log(LogLevel::Error, msg);
    }

    pub fn warn(&mut self, msg: impl AsRef<str>) {
        self.log(LogLevel::Warn, msg);
    }

    pub fn info(&mut self, msg: impl AsRef<str>) {
        self.log(LogLevel::Info, msg);
    }

    pub fn debug(&mut self, msg: impl AsRef<str>) {
        self.log(LogLevel::Debug, msg);
    }

    pub fn trace(&mut self, msg: impl AsRef<str>) {
        self.log(LogLevel::Trace, msg);
    }

    pub fn sink(&self) -> &RotatingFile {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut RotatingFile {
        &mut self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(dir: &Path, maxbytes: u64, backups: u32) -> RotatingFile {
        RotatingFile::new(dir.join("app.log"), maxbytes, backups)
    }

    #[test]
    fn created_lazily_on_first_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = sink(dir.path(), 0, 0);
        assert!(!f.path().exists());
        f.write(b"hello").unwrap();
        assert_eq!(std::fs::read(f.path()).unwrap(), b"hello");
    }

    #[test]
    fn one_oversized_write_rotates_midway() {
        // Writing M+1 bytes into a fresh log leaves `app.log` with 1 byte
        // and `app.log.1` with M bytes.
        let dir = tempfile::tempdir().unwrap();
        let m = 16u64;
        let mut f = sink(dir.path(), m, 2);
        f.write(&vec![b'x'; m as usize + 1]).unwrap();
        assert_eq!(std::fs::read(dir.path().join("app.log")).unwrap().len(), 1);
        assert_eq!(std::fs::read(dir.path().join("app.log.1")).unwrap().len(), 16);
    }

    #[test]
    fn backup_chain_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = sink(dir.path(), 4, 2);
        for chunk in [b"aaaa", b"bbbb", b"cccc", b"dddd"] {
            f.write(chunk).unwrap();
        }
        // The fourth chunk forces the third rotation: "aaaa" fell off.
        f.write(b"e").unwrap();
        assert_eq!(std::fs::read(dir.path().join("app.log")).unwrap(), b"e");
        assert_eq!(std::fs::read(dir.path().join("app.log.1")).unwrap(), b"dddd");
        assert_eq!(std::fs::read(dir.path().join("app.log.2")).unwrap(), b"cccc");
        assert!(!dir.path().join("app.log.3").exists());
    }

    #[test]
    fn zero_backups_keeps_unbounded_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = sink(dir.path(), 2, 0);
        f.write(b"aabbcc").unwrap();
        f.write(b"d").unwrap();
        assert!(dir.path().join("app.log.1").exists());
        assert!(dir.path().join("app.log.2").exists());
        assert!(dir.path().join("app.log.3").exists());
    }

    #[test]
    fn forced_rotate_ignores_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = sink(dir.path(), 1024, 3);
        f.write(b"small").unwrap();
        f.rotate().unwrap();
        assert_eq!(std::fs::read(dir.path().join("app.log.1")).unwrap(), b"small");
        f.write(b"next").unwrap();
        assert_eq!(std::fs::read(dir.path().join("app.log")).unwrap(), b"next");
    }

    #[test]
    fn clear_removes_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = sink(dir.path(), 2, 2);
        f.write(b"aabbcc").unwrap();
        f.clear().unwrap();
        assert!(!dir.path().join("app.log").exists());
        assert!(!dir.path().join("app.log.1").exists());
        f.write(b"x").unwrap();
        assert_eq!(std::fs::read(dir.path().join("app.log")).unwrap(), b"x");
    }

    #[test]
    fn read_range_and_negative_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = sink(dir.path(), 0, 0);
        f.write(b"0123456789").unwrap();
        assert_eq!(f.read_range(2, 3).unwrap(), b"234");
        assert_eq!(f.read_range(-4, 0).unwrap(), b"6789");
        assert_eq!(f.read_range(8, 100).unwrap(), b"89");
        assert!(f.read_range(100, 5).unwrap().is_empty());
    }

    #[test]
    fn tail_clamps_and_flags_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = sink(dir.path(), 0, 0);
        f.write(b"0123456789").unwrap();

        // Reader keeping up: no overflow.
        let (bytes, next, overflow) = f.tail(6, 8).unwrap();
        assert_eq!(bytes, b"6789");
        assert_eq!(next, 10);
        assert!(!overflow);

        // Reader far behind: clamped to the last `length` bytes.
        let (bytes, next, overflow) = f.tail(0, 4).unwrap();
        assert_eq!(bytes, b"6789");
        assert_eq!(next, 10);
        assert!(overflow);

        // Offset beyond EOF (file was rotated under the reader).
        let (bytes, next, overflow) = f.tail(50, 4).unwrap();
        assert_eq!(bytes, b"6789");
        assert_eq!(next, 10);
        assert!(overflow);
    }

    #[test]
    fn logger_drops_messages_below_level() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Logger::new(dir.path().join("activity.log"), 0, 0, LogLevel::Warn, false);
        log.info("invisible");
        log.error("visible");
        let text = std::fs::read_to_string(dir.path().join("activity.log")).unwrap();
        assert!(!text.contains("invisible"));
        assert!(text.contains("visible"));
        assert!(text.contains("ERRO"));
    }
}
