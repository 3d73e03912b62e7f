//! Per-job encode log with a runaway ceiling.

use crate::job::JobId;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Entry written when the ceiling trips.
pub const RUNAWAY_LOG_ENTRY: &str =
    "ERROR: encode log exceeded its size ceiling; the engine appears stuck in an error loop and was stopped automatically";

/// Longest line kept whole. Longer runs without a newline are cut here, so
/// an engine that never writes a newline is still counted against the ceiling.
pub const MAX_LOG_LINE: usize = 8 * 1024;

/// Result of appending one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAppend {
    Accepted,
    /// This append pushed the log past the ceiling. Reported once.
    CeilingExceeded,
    /// The ceiling already tripped; the line was dropped.
    Dropped,
}

/// Engine log for one encode operation.
///
/// Bytes are counted whether or not a file is attached, so the ceiling also
/// guards encodes that run with logging disabled.
pub struct EncodeLog {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    bytes: u64,
    ceiling: u64,
    tripped: bool,
}

impl EncodeLog {
    /// Open `<log_dir>/<job_id>_<destination file name>.log`.
    ///
    /// Falls back to a count-only log if the file cannot be created.
    pub fn open(log_dir: &Path, job_id: JobId, destination: &Path, ceiling: u64) -> Self {
        let name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "encode".to_string());
        let path = log_dir.join(format!("{}_{}.log", job_id, name));

        let file = fs::create_dir_all(log_dir).and_then(|_| File::create(&path));
        match file {
            Ok(file) => Self {
                writer: Some(BufWriter::new(file)),
                path: Some(path),
                bytes: 0,
                ceiling,
                tripped: false,
            },
            Err(e) => {
                warn!(job_id, path = %path.display(), error = %e, "Could not create encode log");
                Self::detached(ceiling)
            }
        }
    }

    /// A log that only counts bytes.
    pub fn detached(ceiling: u64) -> Self {
        Self {
            writer: None,
            path: None,
            bytes: 0,
            ceiling,
            tripped: false,
        }
    }

    pub fn append(&mut self, line: &str) -> LogAppend {
        if self.tripped {
            return LogAppend::Dropped;
        }
        self.bytes = self.bytes.saturating_add(line.len() as u64 + 1);
        self.write_line(line);
        if self.bytes > self.ceiling {
            self.tripped = true;
            self.write_line(RUNAWAY_LOG_ENTRY);
            return LogAppend::CeilingExceeded;
        }
        LogAppend::Accepted
    }

    /// Write a line the supervisor generated itself. Not counted against the ceiling.
    pub fn note(&mut self, line: &str) {
        self.write_line(line);
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Flush and close. Returns the file path, if any.
    pub fn close(&mut self) -> Option<PathBuf> {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!(error = %e, "Failed to flush encode log");
            }
        }
        self.path.clone()
    }

    fn write_line(&mut self, line: &str) {
        let failed = match self.writer.as_mut() {
            Some(writer) => writeln!(writer, "{}", line).is_err(),
            None => false,
        };
        if failed {
            warn!(path = ?self.path, "Encode log write failed; continuing without file");
            self.writer = None;
        }
    }
}

/// Splits raw engine output into log lines, holding at most
/// [`MAX_LOG_LINE`] bytes of an unterminated line between chunks.
#[derive(Debug, Default)]
pub struct LogLines {
    pending: Vec<u8>,
}

impl LogLines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&raw));
        }
        while self.pending.len() >= MAX_LOG_LINE {
            let raw: Vec<u8> = self.pending.drain(..MAX_LOG_LINE).collect();
            lines.push(decode_line(&raw));
        }
        lines
    }

    /// The unterminated tail, once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(decode_line(&raw))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_written_to_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut log = EncodeLog::open(temp_dir.path(), 3, Path::new("/out/movie.mkv"), 1024);
        assert_eq!(log.append("hb_init: starting"), LogAppend::Accepted);
        log.note("supervisor: engine exited");
        let path = log.close().expect("file log should have a path");

        assert_eq!(path, temp_dir.path().join("3_movie.mkv.log"));
        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("hb_init: starting"));
        assert!(content.contains("supervisor: engine exited"));
    }

    #[test]
    fn test_ceiling_trips_once_and_writes_marker() {
        let temp_dir = TempDir::new().unwrap();
        let mut log = EncodeLog::open(temp_dir.path(), 1, Path::new("/out/a.mp4"), 20);

        assert_eq!(log.append("0123456789"), LogAppend::Accepted);
        assert_eq!(log.append("0123456789"), LogAppend::CeilingExceeded);
        assert!(log.is_tripped());
        assert_eq!(log.append("more"), LogAppend::Dropped);

        let content = fs::read_to_string(log.close().unwrap()).unwrap();
        assert!(content.contains(RUNAWAY_LOG_ENTRY));
        assert!(!content.contains("more"));
    }

    #[test]
    fn test_detached_log_still_enforces_ceiling() {
        let mut log = EncodeLog::detached(5);
        assert_eq!(log.append("abcdefgh"), LogAppend::CeilingExceeded);
        assert!(log.close().is_none());
        assert_eq!(log.bytes(), 9);
    }

    #[test]
    fn test_unwritable_dir_falls_back_to_detached() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();

        let mut log = EncodeLog::open(&blocker, 1, Path::new("/out/a.mp4"), 100);
        assert!(log.path().is_none());
        assert_eq!(log.append("line"), LogAppend::Accepted);
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let mut lines = LogLines::new();
        assert!(lines.push(b"hb_init: sta").is_empty());
        assert_eq!(lines.push(b"rting\r\nscan: done\npart"), vec!["hb_init: starting", "scan: done"]);
        assert_eq!(lines.finish(), Some("part".to_string()));
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn test_newline_free_output_is_cut_and_bounded() {
        let mut lines = LogLines::new();
        let chunk = vec![b'x'; 4096];
        let mut emitted = 0;
        for _ in 0..50 {
            for line in lines.push(&chunk) {
                assert_eq!(line.len(), MAX_LOG_LINE);
                emitted += line.len();
            }
            assert!(lines.pending_len() < MAX_LOG_LINE);
        }
        assert_eq!(emitted + lines.pending_len(), 50 * 4096);
    }

    #[test]
    fn test_newline_free_flood_trips_ceiling() {
        let mut log = EncodeLog::detached(4096);
        let mut lines = LogLines::new();
        let chunk = vec![b'x'; 4096];
        let mut verdicts = Vec::new();
        for _ in 0..4 {
            for line in lines.push(&chunk) {
                verdicts.push(log.append(&line));
            }
        }
        assert_eq!(verdicts.first(), Some(&LogAppend::CeilingExceeded));
        assert!(log.is_tripped());
    }
}
