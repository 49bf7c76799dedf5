//! Metadata feed tailing
//!
//! The metadata decoder appends lines to a file for as long
//! as it runs. The file is truncated whenever the process
//! chain is restarted. [`FeedTail`] follows it like `tail -F`:
//! it returns complete lines as they are appended, holds back
//! a trailing partial line, and rewinds when the file shrinks.
//! Like `tail`, it can start from the last few lines instead of
//! the beginning.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(not(test))]
use log::{debug, info};

#[cfg(test)]
use std::println as debug;
#[cfg(test)]
use std::println as info;

use crate::error::{MonitorError, Result};
use crate::metadata::{MetadataRecord, MetadataState};

/// Pause between polls when the feed has nothing new
pub const FEED_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lines of history replayed when joining a feed already in progress
pub const FEED_BACKLOG_LINES: usize = 10;

// longest stretch searched backwards for the backlog
const BACKLOG_SEARCH_BYTES: u64 = 64 * 1024;

/// Follows an append-only, line-delimited file
#[derive(Debug)]
pub struct FeedTail {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    pos: u64,
    pending: Vec<u8>,
    backlog: Option<usize>,
}

impl FeedTail {
    /// Follow the file at `path`
    ///
    /// The file need not exist yet. It is opened on the first
    /// read which finds it.
    pub fn new<P>(path: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            path: path.into(),
            reader: None,
            pos: 0,
            pending: Vec::new(),
            backlog: None,
        }
    }

    /// Start from the last `lines` lines
    ///
    /// Applies to the first open only. Anything older in the
    /// file is skipped.
    pub fn with_backlog(mut self, lines: usize) -> Self {
        self.backlog = Some(lines);
        self
    }

    /// Read the file again from its beginning
    ///
    /// Call when the writer has started over, even if the file
    /// has already grown past the current position.
    pub fn rewind(&mut self) {
        debug!("feed: rewinding {}", self.path.display());
        self.reader = None;
        self.pos = 0;
        self.pending.clear();
        self.backlog = None;
    }

    /// Path being followed
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if the file has been opened
    pub fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    /// Next complete line, if one is available now
    ///
    /// Returns `Ok(None)` if the file does not exist yet or has
    /// no complete line past the current position. The line
    /// terminator is removed. Invalid UTF-8 is replaced.
    pub fn next_line(&mut self) -> io::Result<Option<String>> {
        if self.reader.is_none() {
            match File::open(&self.path) {
                Ok(mut file) => {
                    let start = match self.backlog.take() {
                        Some(lines) => recent_lines_start(&mut file, lines)?,
                        None => 0,
                    };
                    file.seek(SeekFrom::Start(start))?;
                    debug!("feed: opened {} at {}", self.path.display(), start);
                    self.reader = Some(BufReader::new(file));
                    self.pos = start;
                    self.pending.clear();
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e),
            }
        }

        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Ok(None),
        };

        let n = reader.read_until(b'\n', &mut self.pending)?;
        if n == 0 {
            self.check_truncated()?;
            return Ok(None);
        }
        self.pos += n as u64;

        if self.pending.last() != Some(&b'\n') {
            // partial line; wait for the rest
            return Ok(None);
        }

        let line = String::from_utf8_lossy(&self.pending)
            .trim_end_matches(&['\r', '\n'][..])
            .to_owned();
        self.pending.clear();
        Ok(Some(line))
    }

    // Rewind if the file shrank under us
    fn check_truncated(&mut self) -> io::Result<()> {
        let len = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // removed; reopen once it comes back
                self.reader = None;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if len < self.pos {
            info!("feed: {} truncated; rewinding", self.path.display());
            if let Some(reader) = self.reader.as_mut() {
                reader.seek(SeekFrom::Start(0))?;
            }
            self.pos = 0;
            self.pending.clear();
        }
        Ok(())
    }
}

// Offset of the start of the last `lines` lines
//
// A trailing partial line counts as one. If the search window
// does not reach back far enough, starts at the first line
// boundary inside it.
fn recent_lines_start(file: &mut File, lines: usize) -> io::Result<u64> {
    let len = file.metadata()?.len();
    let window = len.min(BACKLOG_SEARCH_BYTES);
    let base = len - window;

    let mut buf = Vec::with_capacity(window as usize);
    file.seek(SeekFrom::Start(base))?;
    file.by_ref().take(window).read_to_end(&mut buf)?;

    // the newline which ends the file does not begin a line
    let body = match buf.last() {
        Some(b'\n') => &buf[..buf.len() - 1],
        _ => &buf[..],
    };

    if lines == 0 {
        return Ok(match buf.iter().rposition(|&b| b == b'\n') {
            Some(i) => base + i as u64 + 1,
            None => base,
        });
    }

    let mut seen = 0;
    for (i, &b) in body.iter().enumerate().rev() {
        if b == b'\n' {
            seen += 1;
            if seen == lines {
                return Ok(base + i as u64 + 1);
            }
        }
    }

    if base == 0 {
        Ok(0)
    } else {
        let first = buf.iter().position(|&b| b == b'\n').map_or(window, |i| i as u64 + 1);
        Ok(base + first)
    }
}

/// Result of a one-shot metadata read
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataReading {
    /// Station name, if one was seen
    pub station_name: Option<String>,

    /// Radiotext, if any was seen
    pub rolling_text: Option<String>,
}

impl MetadataReading {
    /// True once both fields have been observed
    pub fn is_complete(&self) -> bool {
        self.station_name.is_some() && self.rolling_text.is_some()
    }
}

/// Read the feed for at most `duration`
///
/// Follows the feed at `path` starting from its last
/// [`FEED_BACKLOG_LINES`] lines, so that only recent metadata
/// is reported. Records are merged as the background reader
/// would merge them. Returns as soon as
/// both a station name and a radiotext have been observed, or
/// when `duration` expires. The feed is closed on return.
/// Malformed lines are skipped.
///
/// Fails with [`MonitorError::FeedUnavailable`] if the feed
/// does not exist.
pub fn read_once(path: &Path, duration: Duration) -> Result<MetadataReading> {
    if !path.exists() {
        return Err(MonitorError::FeedUnavailable);
    }

    info!("reading metadata for up to {} s", duration.as_secs_f32());
    let deadline = Instant::now() + duration;
    let mut tail = FeedTail::new(path).with_backlog(FEED_BACKLOG_LINES);
    let mut state = MetadataState::new();
    let mut out = MetadataReading::default();

    while Instant::now() < deadline {
        let line = match tail.next_line()? {
            Some(line) => line,
            None => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                thread::sleep(FEED_POLL_INTERVAL.min(remaining));
                continue;
            }
        };

        let record = match MetadataRecord::parse(&line) {
            Ok(record) => record,
            Err(e) => {
                debug!("feed: skipping line: {}", e);
                continue;
            }
        };

        let update = state.apply(&record);
        if update.station_name && out.station_name.is_none() {
            info!("station name found: {}", state.station_name());
            out.station_name = Some(state.station_name().to_owned());
        }
        if update.rolling_text && !state.rolling_text().is_empty() {
            out.rolling_text = Some(state.rolling_text().to_owned());
        }

        if out.is_complete() {
            info!("station name and radiotext found; stopping early");
            break;
        }
    }

    info!(
        "metadata read finished - station name: {}, radiotext: {}",
        out.station_name.is_some(),
        out.rolling_text.is_some()
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::OpenOptions;
    use std::io::Write;

    fn append(path: &Path, text: &str) {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open");
        f.write_all(text.as_bytes()).expect("write");
    }

    #[test]
    fn test_tail_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rds.jsonl");
        let mut tail = FeedTail::new(&path);

        // not there yet
        assert_eq!(tail.next_line().expect("read"), None);
        assert!(!tail.is_open());

        append(&path, "one\ntwo\nthr");
        assert_eq!(tail.next_line().expect("read").as_deref(), Some("one"));
        assert_eq!(tail.next_line().expect("read").as_deref(), Some("two"));
        assert_eq!(tail.next_line().expect("read"), None);

        // partial line completes
        append(&path, "ee\r\n");
        assert_eq!(tail.next_line().expect("read").as_deref(), Some("three"));
        assert_eq!(tail.next_line().expect("read"), None);
    }

    #[test]
    fn test_tail_truncation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rds.jsonl");
        append(&path, "first generation line\n");

        let mut tail = FeedTail::new(&path);
        assert!(tail.next_line().expect("read").is_some());
        assert_eq!(tail.next_line().expect("read"), None);

        // restart truncates the file
        File::create(&path).expect("truncate");
        assert_eq!(tail.next_line().expect("read"), None);
        append(&path, "new\n");
        assert_eq!(tail.next_line().expect("read").as_deref(), Some("new"));
    }

    #[test]
    fn test_tail_backlog() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rds.jsonl");
        append(&path, "one\ntwo\nthree\nfour\n");

        let mut tail = FeedTail::new(&path).with_backlog(2);
        assert_eq!(tail.next_line().expect("read").as_deref(), Some("three"));
        assert_eq!(tail.next_line().expect("read").as_deref(), Some("four"));
        assert_eq!(tail.next_line().expect("read"), None);

        // more lines than the file has
        let mut tail = FeedTail::new(&path).with_backlog(10);
        assert_eq!(tail.next_line().expect("read").as_deref(), Some("one"));

        // nothing old, only what comes next
        let mut tail = FeedTail::new(&path).with_backlog(0);
        assert_eq!(tail.next_line().expect("read"), None);
        append(&path, "five\n");
        assert_eq!(tail.next_line().expect("read").as_deref(), Some("five"));
    }

    #[test]
    fn test_tail_rewind_after_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rds.jsonl");
        append(&path, "{\"ps\":\"GEN1\"}\n");

        let mut tail = FeedTail::new(&path);
        assert_eq!(
            tail.next_line().expect("read").as_deref(),
            Some("{\"ps\":\"GEN1\"}")
        );

        // the new run outgrows the old offset before we look
        File::create(&path).expect("truncate");
        append(&path, "{\"ps\":\"GEN2-STATION\"}\n{\"ps\":\"GEN2-B\"}\n");

        tail.rewind();
        assert_eq!(
            tail.next_line().expect("read").as_deref(),
            Some("{\"ps\":\"GEN2-STATION\"}")
        );
        assert_eq!(
            tail.next_line().expect("read").as_deref(),
            Some("{\"ps\":\"GEN2-B\"}")
        );
        assert_eq!(tail.next_line().expect("read"), None);
    }

    #[test]
    fn test_read_once_skips_stale_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rds.jsonl");

        let mut text = String::new();
        text.push_str("{\"ps\":\"OLD\"}\n");
        text.push_str("{\"radiotext\":\"Stale song from this morning\"}\n");
        for _ in 0..1000 {
            text.push_str("{\"pi\":\"0xF201\"}\n");
        }
        text.push_str("{\"ps\":\"NEW\"}\n");
        text.push_str("{\"radiotext\":\"Live now\"}\n");
        append(&path, &text);

        let got = read_once(&path, Duration::from_secs(5)).expect("read");
        assert_eq!(got.station_name.as_deref(), Some("NEW"));
        assert_eq!(got.rolling_text.as_deref(), Some("Live now"));
    }

    #[test]
    fn test_read_once_early_exit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rds.jsonl");
        append(
            &path,
            concat!(
                "{\"pi\":\"0xF201\"}\n",
                "garbage line\n",
                "{\"ps\":\"FIP     \"}\n",
                "{\"partial_radiotext\":\"Now\",\"rt_ab\":\"A\"}\n",
                "{\"partial_radiotext\":\"Now playing\",\"rt_ab\":\"A\"}\n",
            ),
        );

        let start = Instant::now();
        let got = read_once(&path, Duration::from_secs(10)).expect("read");
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(got.station_name.as_deref(), Some("FIP"));
        assert_eq!(got.rolling_text.as_deref(), Some("Now"));
        assert!(got.is_complete());
    }

    #[test]
    fn test_read_once_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rds.jsonl");
        append(&path, "{\"ps\":\"RADIO\"}\n");

        let start = Instant::now();
        let got = read_once(&path, Duration::from_millis(300)).expect("read");
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert_eq!(got.station_name.as_deref(), Some("RADIO"));
        assert_eq!(got.rolling_text, None);
    }

    #[test]
    fn test_read_once_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let res = read_once(&dir.path().join("nope"), Duration::from_millis(10));
        assert!(matches!(res, Err(MonitorError::FeedUnavailable)));
    }
}
