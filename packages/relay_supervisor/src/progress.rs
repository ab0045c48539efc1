//! Health inference from the encoder's diagnostic stream.
//!
//! The encoder's stderr is free-form text. Everything that depends on its
//! exact format lives behind [`ProgressParser`], so the supervisor only ever
//! sees a [`HealthUpdate`] per line.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Longest partial line kept while waiting for a terminator.
const MAX_PENDING_LINE: usize = 64 * 1024;

/// Markers printed once the output side of the encoder is open.
const ESTABLISHED_MARKERS: &[&str] = &["Output #0", "Stream mapping:", "Press [q] to stop"];

/// Substrings (lowercase) of common network / upstream failures.
const FAILURE_PATTERNS: &[&str] = &[
    "connection refused",
    "network is unreachable",
    "i/o error",
    "input/output error",
    "server returned 4",
    "connection reset by peer",
    "broken pipe",
    "connection timed out",
    "end of file",
];

static FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"frame=\s*(\d+)").expect("frame pattern is valid"));

static BITRATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"bitrate=\s*(\d+(?:\.\d+)?)(?:\s*kbits/s)?").expect("bitrate pattern is valid")
});

/// What a single diagnostic line says about the stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthUpdate {
    /// The line shows the stream is established (marker or live progress)
    pub established: bool,
    /// Parsed `frame=<int>` value
    pub frames: Option<u64>,
    /// Parsed `bitrate=<float>` value, with or without the `kbits/s` unit
    pub bitrate: Option<f64>,
    /// The line reports a network or upstream failure
    pub failure: bool,
}

impl HealthUpdate {
    pub fn is_empty(&self) -> bool {
        !self.established && self.frames.is_none() && self.bitrate.is_none() && !self.failure
    }
}

/// Turns one line of diagnostic output into a partial health update.
pub trait ProgressParser: Send + Sync {
    fn parse_line(&self, line: &str) -> HealthUpdate;
}

/// Parser for ffmpeg's stderr (`-stats` progress lines and error messages).
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegProgressParser;

impl ProgressParser for FfmpegProgressParser {
    fn parse_line(&self, line: &str) -> HealthUpdate {
        let mut update = HealthUpdate::default();

        let lower = line.to_ascii_lowercase();
        if FAILURE_PATTERNS.iter().any(|p| lower.contains(p)) {
            update.failure = true;
            return update;
        }

        if ESTABLISHED_MARKERS.iter().any(|m| line.contains(m)) {
            update.established = true;
        }

        if let Some(frames) = FRAME_RE
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
        {
            update.frames = Some(frames);
            // Progress only flows once the output is open.
            update.established = true;
        }

        if let Some(bitrate) = BITRATE_RE
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
        {
            update.bitrate = Some(bitrate);
            update.established = true;
        }

        update
    }
}

/// Health snapshot of the current encoder run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamHealth {
    pub is_connected: bool,
    pub last_connection_time: Option<DateTime<Utc>>,
    pub total_frames_sent: u64,
    pub current_bitrate: f64,
    pub connection_errors: u64,
    pub last_health_check: DateTime<Utc>,
}

/// Edge transitions produced by [`StreamHealth::apply`], for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthTransition {
    pub connected: bool,
    pub disconnected: bool,
}

impl StreamHealth {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            is_connected: false,
            last_connection_time: None,
            total_frames_sent: 0,
            current_bitrate: 0.0,
            connection_errors: 0,
            last_health_check: now,
        }
    }

    /// Fold a parsed line into the snapshot.
    ///
    /// `total_frames_sent` only moves forward: duplicate or out-of-order
    /// progress lines are ignored.
    pub fn apply(&mut self, update: &HealthUpdate, now: DateTime<Utc>) -> HealthTransition {
        let mut transition = HealthTransition::default();
        self.last_health_check = now;

        if update.failure {
            self.connection_errors += 1;
            if self.is_connected {
                transition.disconnected = true;
            }
            self.is_connected = false;
            return transition;
        }

        if update.established && !self.is_connected {
            self.is_connected = true;
            self.last_connection_time = Some(now);
            transition.connected = true;
        }

        if let Some(frames) = update.frames {
            if frames > self.total_frames_sent {
                self.total_frames_sent = frames;
            }
        }

        if let Some(bitrate) = update.bitrate {
            self.current_bitrate = bitrate;
        }

        transition
    }
}

/// Splits raw output chunks into lines.
///
/// ffmpeg rewrites its progress line with `\r`, so both `\r` and `\n` end a
/// line. Empty lines are skipped.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                self.take_line(&mut lines);
            } else {
                self.pending.push(byte);
                if self.pending.len() >= MAX_PENDING_LINE {
                    self.take_line(&mut lines);
                }
            }
        }
        lines
    }

    /// Return whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let mut lines = Vec::new();
        self.take_line(&mut lines);
        lines.pop()
    }

    fn take_line(&mut self, lines: &mut Vec<String>) {
        if self.pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        if !line.is_empty() {
            lines.push(line);
        }
    }
}
