//! Tunnel log filtering
//!
//! The tunnel binary appends one line per event. Only TCP activity is of
//! interest; a handful of chatty line classes are dropped and the rest is
//! reduced to five fields: date, time and the last three tokens.

use crate::error::Result;
use regex::Regex;
use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

lazy_static::lazy_static! {
    static ref TCP_MARKER: Regex = Regex::new(r"(?i)\btcp\b").expect("valid tcp pattern");
    static ref NOISE: Vec<Regex> = [
        r"(?i)socks5 client udp construct",
        r"(?i)socks5 client res\.rep 5",
        r"(?i)socks5 session handshake",
        r"(?i)io timeout",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid noise pattern"))
    .collect();
}

/// Five fields projected from a retained log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub date: String,
    pub time: String,
    pub fields: [String; 3],
}

impl fmt::Display for StatusRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.date, self.time, self.fields[0], self.fields[1], self.fields[2]
        )
    }
}

/// Whether a line belongs in the status stream
pub fn is_relevant(line: &str) -> bool {
    TCP_MARKER.is_match(line) && !NOISE.iter().any(|re| re.is_match(line))
}

/// Project a line to a record; `None` for lines that are filtered out or
/// too short to carry five fields.
pub fn project(line: &str) -> Option<StatusRecord> {
    if !is_relevant(line) {
        return None;
    }

    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 5 {
        return None;
    }

    let n = tokens.len();
    Some(StatusRecord {
        date: tokens[0].to_string(),
        time: tokens[1].to_string(),
        fields: [
            tokens[n - 3].to_string(),
            tokens[n - 2].to_string(),
            tokens[n - 1].to_string(),
        ],
    })
}

/// Follows a growing log file from its end.
///
/// The file may not exist yet when following starts. A file that shrinks
/// is treated as truncated and read again from the start.
pub struct LogFollower {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    position: u64,
    pending: String,
    ready: std::collections::VecDeque<StatusRecord>,
    poll_interval: Duration,
    pace: Duration,
    from_start: bool,
}

impl LogFollower {
    pub fn new(path: &Path, poll_interval: Duration, pace: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            file: None,
            position: 0,
            pending: String::new(),
            ready: Default::default(),
            poll_interval,
            pace,
            from_start: false,
        }
    }

    /// Read from the first byte of the file instead of its end at open time
    pub fn from_start(mut self) -> Self {
        self.from_start = true;
        self
    }

    /// Next record, waiting for the log to grow as long as needed.
    ///
    /// Cancel-safe: dropping the future never loses a record.
    pub async fn next_record(&mut self) -> Result<StatusRecord> {
        loop {
            if !self.ready.is_empty() {
                if !self.pace.is_zero() {
                    tokio::time::sleep(self.pace).await;
                }
                if let Some(record) = self.ready.pop_front() {
                    return Ok(record);
                }
            }

            if !self.read_available().await? {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    /// Pull whatever has been appended; `false` when nothing was new
    async fn read_available(&mut self) -> Result<bool> {
        if self.file.is_none() {
            match tokio::fs::File::open(&self.path).await {
                Ok(mut file) => {
                    self.position = if self.from_start {
                        0
                    } else {
                        file.seek(SeekFrom::End(0)).await?
                    };
                    file.seek(SeekFrom::Start(self.position)).await?;
                    self.file = Some(file);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }

        let Some(file) = self.file.as_mut() else {
            return Ok(false);
        };

        let len = file.metadata().await?.len();
        if len < self.position {
            log::debug!("{} was truncated, reading from the start", self.path.display());
            self.position = 0;
            self.pending.clear();
            file.seek(SeekFrom::Start(0)).await?;
        }
        if len == self.position {
            return Ok(false);
        }

        let mut chunk = Vec::new();
        file.seek(SeekFrom::Start(self.position)).await?;
        let read = file.read_to_end(&mut chunk).await?;
        self.position += read as u64;
        self.pending.push_str(&String::from_utf8_lossy(&chunk));

        // Keep an unterminated tail for the next read
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            if let Some(record) = project(line.trim_end()) {
                self.ready.push_back(record);
            }
        }

        Ok(read > 0)
    }
}
