//! Structured event extraction from a RocksDB `LOG` file.
//!
//! Two kinds of lines are recognized: `EVENT_LOG_v1` lines carrying a JSON
//! payload, and `[WARN]` lines announcing a write stall with the throttle rate.

use chrono::NaiveDateTime;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::LazyLock;

const EVENT_LOG_MARKER: &str = "EVENT_LOG_v1";
const LOG_TIMESTAMP_FORMAT: &str = "%Y/%m/%d-%H:%M:%S%.6f";

/// An event extracted from the database log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    CompactionFinished {
        time_micros: i64,
        compaction_time_micros: i64,
        total_output_size: u64,
    },
    FlushStarted {
        time_micros: i64,
        total_data_size: u64,
    },
    StallStarted {
        time_micros: i64,
        rate: u64,
    },
}

impl LogEvent {
    /// Tag used as the first CSV column.
    pub fn tag(&self) -> &'static str {
        match self {
            LogEvent::CompactionFinished { .. } => "compaction_finished",
            LogEvent::FlushStarted { .. } => "flush_started",
            LogEvent::StallStarted { .. } => "stall_started",
        }
    }

    /// Render as one events-CSV row (without trailing newline).
    pub fn to_csv_row(&self) -> String {
        match self {
            LogEvent::CompactionFinished {
                time_micros,
                compaction_time_micros,
                total_output_size,
            } => format!(
                "{},{time_micros},{compaction_time_micros},{total_output_size}",
                self.tag()
            ),
            // Size precedes time for flushes.
            LogEvent::FlushStarted {
                time_micros,
                total_data_size,
            } => format!("{},{total_data_size},{time_micros}", self.tag()),
            LogEvent::StallStarted { time_micros, rate } => {
                format!("{},{time_micros},{rate}", self.tag())
            }
        }
    }
}

#[derive(Deserialize)]
struct CompactionFinishedPayload {
    time_micros: i64,
    compaction_time_micros: i64,
    total_output_size: u64,
}

#[derive(Deserialize)]
struct FlushStartedPayload {
    time_micros: i64,
    total_data_size: u64,
}

/// One way of recognizing a stall line.
pub struct StallMatcher {
    pub name: &'static str,
    pattern: Regex,
}

/// Stall matchers in precedence order: the first one that matches a line
/// produces its event and the rest are not consulted.
static STALL_MATCHERS: LazyLock<Vec<StallMatcher>> = LazyLock::new(|| {
    vec![
        StallMatcher {
            name: "strict",
            pattern: Regex::new(
                r"(\d{4}/\d{2}/\d{2}-\d{2}:\d{2}:\d{2}\.\d{6}) [0-9a-fA-F]+ \[WARN\] \[/column_family\.cc:\d+\] \[[^\]]*\] Stalling writes because we have \d+ level-0 files rate (\d+)",
            )
            .unwrap(),
        },
        StallMatcher {
            name: "fallback",
            pattern: Regex::new(r"(\d{4}/\d{2}/\d{2}-\d{2}:\d{2}:\d{2}\.\d{6}).*rate (\d+)").unwrap(),
        },
    ]
});

/// Convert a log timestamp (`YYYY/MM/DD-HH:MM:SS.ffffff`, UTC-naive) to
/// microseconds since the Unix epoch.
pub fn timestamp_to_micros(timestamp: &str) -> Result<i64, chrono::ParseError> {
    let dt = NaiveDateTime::parse_from_str(timestamp, LOG_TIMESTAMP_FORMAT)?;
    Ok(dt.and_utc().timestamp_micros())
}

/// Parse the JSON payload of an `EVENT_LOG_v1` line.
///
/// Returns `Ok(None)` for lines without the marker and for event kinds we
/// don't track; `Err` for malformed payloads.
fn parse_json_event(line: &str) -> Result<Option<LogEvent>, String> {
    let Some(idx) = line.find(EVENT_LOG_MARKER) else {
        return Ok(None);
    };
    let payload = line[idx + EVENT_LOG_MARKER.len()..].trim();
    let v: Value = serde_json::from_str(payload).map_err(|e| e.to_string())?;

    match v.get("event").and_then(|e| e.as_str()) {
        Some("compaction_finished") => {
            let p: CompactionFinishedPayload =
                serde_json::from_value(v).map_err(|e| e.to_string())?;
            Ok(Some(LogEvent::CompactionFinished {
                time_micros: p.time_micros,
                compaction_time_micros: p.compaction_time_micros,
                total_output_size: p.total_output_size,
            }))
        }
        Some("flush_started") => {
            let p: FlushStartedPayload = serde_json::from_value(v).map_err(|e| e.to_string())?;
            Ok(Some(LogEvent::FlushStarted {
                time_micros: p.time_micros,
                total_data_size: p.total_data_size,
            }))
        }
        _ => Ok(None),
    }
}

/// Test a line against the stall matchers, first match wins.
fn parse_stall(line: &str) -> Option<LogEvent> {
    for matcher in STALL_MATCHERS.iter() {
        let Some(caps) = matcher.pattern.captures(line) else {
            continue;
        };
        let time_micros = match timestamp_to_micros(&caps[1]) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(matcher = matcher.name, error = %e, "bad stall timestamp, skipping line");
                return None;
            }
        };
        let rate = match caps[2].parse::<u64>() {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(matcher = matcher.name, error = %e, "bad stall rate, skipping line");
                return None;
            }
        };
        tracing::trace!(matcher = matcher.name, time_micros, rate, "stall line matched");
        return Some(LogEvent::StallStarted { time_micros, rate });
    }
    None
}

/// Extract every event a single line carries, in emission order.
pub fn events_in_line(line: &str) -> Vec<LogEvent> {
    let mut out = Vec::new();
    match parse_json_event(line) {
        Ok(Some(event)) => out.push(event),
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, line, "failed to parse event log payload"),
    }
    if let Some(stall) = parse_stall(line) {
        out.push(stall);
    }
    out
}

/// Lines of a reader with invalid UTF-8 replaced instead of rejected.
///
/// A line with bad bytes is logged and yielded lossily; only a real I/O
/// error is returned as `Err`.
pub struct LossyLines<R> {
    reader: R,
    buf: Vec<u8>,
    line_no: u64,
}

impl<R: BufRead> LossyLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            line_no: 0,
        }
    }
}

impl<R: BufRead> Iterator for LossyLines<R> {
    type Item = std::io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => None,
            Ok(_) => {
                self.line_no += 1;
                if self.buf.last() == Some(&b'\n') {
                    self.buf.pop();
                    if self.buf.last() == Some(&b'\r') {
                        self.buf.pop();
                    }
                }
                let line = match String::from_utf8_lossy(&self.buf) {
                    std::borrow::Cow::Borrowed(s) => s.to_string(),
                    std::borrow::Cow::Owned(s) => {
                        tracing::warn!(line = self.line_no, "invalid UTF-8 replaced");
                        s
                    }
                };
                Some(Ok(line))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// Lazy iterator over the events of a log, in file order.
///
/// Reading stops at end of input or at the first I/O error (which is logged).
pub struct LogEvents<R> {
    lines: LossyLines<R>,
    pending: VecDeque<LogEvent>,
    line_no: u64,
    failed: bool,
}

impl<R: BufRead> LogEvents<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: LossyLines::new(reader),
            pending: VecDeque::new(),
            line_no: 0,
            failed: false,
        }
    }
}

impl LogEvents<std::io::BufReader<std::fs::File>> {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(Self::new(std::io::BufReader::new(file)))
    }
}

impl<R: BufRead> Iterator for LogEvents<R> {
    type Item = LogEvent;

    fn next(&mut self) -> Option<LogEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.failed {
                return None;
            }
            let line = match self.lines.next()? {
                Ok(l) => l,
                Err(e) => {
                    tracing::error!(error = %e, line = self.line_no + 1, "failed to read log line");
                    self.failed = true;
                    return None;
                }
            };
            self.line_no += 1;
            self.pending.extend(events_in_line(&line));
        }
    }
}

/// Counts reported after an extraction.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub compactions: usize,
    pub flushes: usize,
    pub stalls: usize,
    pub clients: usize,
}

/// Write all events of `log_path` to `out`, then append one `client<N>` row
/// per row of `client_progress` (if given and present).
pub fn extract_to_csv(
    log_path: &Path,
    client_progress: Option<&Path>,
    out: &mut impl Write,
) -> std::io::Result<ExtractSummary> {
    let mut summary = ExtractSummary::default();
    for event in LogEvents::open(log_path)? {
        match event {
            LogEvent::CompactionFinished { .. } => summary.compactions += 1,
            LogEvent::FlushStarted { .. } => summary.flushes += 1,
            LogEvent::StallStarted { .. } => summary.stalls += 1,
        }
        writeln!(out, "{}", event.to_csv_row())?;
    }

    if let Some(progress) = client_progress {
        summary.clients = append_client_rows(progress, out)?;
    }
    Ok(summary)
}

/// Prefix each row of the client-progress CSV with `client<N>`, N from 1.
/// A missing progress file is a warning and contributes no rows.
pub fn append_client_rows(progress: &Path, out: &mut impl Write) -> std::io::Result<usize> {
    let file = match std::fs::File::open(progress) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %progress.display(), "client progress file not found, skipping client rows");
            return Ok(0);
        }
        Err(e) => return Err(e),
    };

    let mut count = 0;
    for line in LossyLines::new(std::io::BufReader::new(file)) {
        let line = line?;
        let row = line.trim();
        if row.is_empty() {
            continue;
        }
        count += 1;
        writeln!(out, "client{count},{row}")?;
    }
    Ok(count)
}
