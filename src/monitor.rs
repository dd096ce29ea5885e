//! `iostat`/`mpstat` sampling: spawn the tools during a run and turn their
//! captured text output into CSV afterwards.

use crate::config::MonitorConfig;
use crate::log_events::LossyLines;
use std::io::{BufRead, Write};
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};

const TIMESTAMP_MARKER: &str = "Time:";

/// A system-monitoring tool whose periodic output we capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorKind {
    /// Extended per-device disk statistics for one device.
    Iostat { device: String },
    /// Per-core CPU utilization.
    Mpstat,
}

/// One data row of tool output, tagged with the last timestamp marker seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSample {
    pub timestamp: String,
    pub fields: Vec<String>,
}

impl MonitorKind {
    pub fn name(&self) -> &'static str {
        match self {
            MonitorKind::Iostat { .. } => "iostat",
            MonitorKind::Mpstat => "mpstat",
        }
    }

    pub fn csv_header(&self) -> &'static str {
        match self {
            MonitorKind::Iostat { .. } => {
                "Timestamp,r/s,rMB/s,r_await,rareq-sz,w/s,wMB/s,w_await,wareq-sz"
            }
            MonitorKind::Mpstat => "Timestamp,core,usr,sys,iowait,soft,idle",
        }
    }

    /// Token indices copied into each row.
    fn columns(&self) -> &'static [usize] {
        match self {
            MonitorKind::Iostat { .. } => &[1, 2, 5, 6, 7, 8, 11, 12],
            MonitorKind::Mpstat => &[1, 2, 4, 5, 7, 11],
        }
    }

    /// Leading selected columns that are labels rather than numbers.
    fn label_columns(&self) -> usize {
        match self {
            MonitorKind::Iostat { .. } => 0,
            MonitorKind::Mpstat => 1,
        }
    }

    fn min_tokens(&self) -> usize {
        match self {
            MonitorKind::Iostat { .. } => 13,
            MonitorKind::Mpstat => 12,
        }
    }

    /// Shell command that announces a timestamp and then samples every `interval_secs`.
    pub fn shell_command(&self, interval_secs: u64) -> String {
        let tool = match self {
            MonitorKind::Iostat { device } => format!("iostat -xdm /dev/{device} {interval_secs}"),
            MonitorKind::Mpstat => format!("mpstat -P ALL {interval_secs}"),
        };
        format!("echo \"{TIMESTAMP_MARKER} $(date +'%Y-%m-%d %H:%M:%S.%3N')\"; {tool}")
    }

    /// Extract a row from a data line, or `None` if the line doesn't fit the format.
    fn parse_data_line(&self, tokens: &[&str]) -> Option<Vec<String>> {
        if let MonitorKind::Iostat { device } = self {
            if !tokens.iter().any(|t| t.contains(device.as_str())) {
                return None;
            }
        }
        if tokens.first() == Some(&"Average:") {
            return None;
        }
        if tokens.len() < self.min_tokens() {
            return None;
        }
        let fields: Vec<String> = self.columns().iter().map(|&i| tokens[i].to_string()).collect();
        // Repeated column-header lines carry names where numbers belong.
        if fields[self.label_columns()..]
            .iter()
            .any(|f| f.parse::<f64>().is_err())
        {
            return None;
        }
        Some(fields)
    }

    /// Parse a capture into samples.
    ///
    /// Lines before the first timestamp marker, short lines and header lines
    /// are dropped without error.
    pub fn parse_capture(&self, reader: impl BufRead) -> std::io::Result<Vec<MonitorSample>> {
        let mut current: Option<String> = None;
        let mut samples = Vec::new();
        for line in LossyLines::new(reader) {
            let line = line?;
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if line.contains(TIMESTAMP_MARKER) {
                if tokens.len() >= 3 {
                    current = Some(format!("{} {}", tokens[1], tokens[2]));
                }
                continue;
            }
            let Some(timestamp) = &current else {
                continue;
            };
            if let Some(fields) = self.parse_data_line(&tokens) {
                samples.push(MonitorSample {
                    timestamp: timestamp.clone(),
                    fields,
                });
            }
        }
        Ok(samples)
    }

    /// Convert a raw capture file into CSV. A missing capture produces a
    /// header-only CSV and a warning. Returns the number of rows written.
    pub fn capture_to_csv(&self, raw: &Path, csv: &Path) -> std::io::Result<usize> {
        let samples = match std::fs::File::open(raw) {
            Ok(f) => self.parse_capture(std::io::BufReader::new(f))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(tool = self.name(), path = %raw.display(), "monitor capture not found");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let mut out = std::io::BufWriter::new(std::fs::File::create(csv)?);
        writeln!(out, "{}", self.csv_header())?;
        for sample in &samples {
            writeln!(out, "{},{}", sample.timestamp, sample.fields.join(","))?;
        }
        out.flush()?;
        tracing::info!(tool = self.name(), rows = samples.len(), csv = %csv.display(), "monitor output converted");
        Ok(samples.len())
    }
}

/// Monitors enabled by config, in spawn order.
pub fn enabled_monitors(config: &MonitorConfig) -> Vec<MonitorKind> {
    let mut kinds = Vec::new();
    if config.iostat {
        kinds.push(MonitorKind::Iostat {
            device: config.device.clone(),
        });
    }
    if config.mpstat {
        kinds.push(MonitorKind::Mpstat);
    }
    kinds
}

/// Monitors run under the C locale so sysstat prints 24-hour times and
/// dot decimals, which keeps the column layout the parsers expect.
fn monitor_command(kind: &MonitorKind, interval_secs: u64) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(kind.shell_command(interval_secs))
        .env("LC_ALL", "C")
        .env("S_TIME_FORMAT", "ISO");
    cmd
}

/// Spawn a monitor in its own process group, writing stdout and stderr to `raw`.
pub fn spawn_monitor(kind: &MonitorKind, interval_secs: u64, raw: &Path) -> std::io::Result<Child> {
    let out = std::fs::File::create(raw)?;
    let err = out.try_clone()?;
    let child = monitor_command(kind, interval_secs)
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .process_group(0)
        .kill_on_drop(true)
        .spawn()?;
    tracing::info!(tool = kind.name(), pid = child.id().unwrap_or(0), "monitor started");
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;

    const IOSTAT_CAPTURE: &str = "\
Time: 2024-03-01 12:00:00.123
Linux 6.1.0 (host) \t03/01/2024 \t_x86_64_\t(32 CPU)

Device            r/s     rMB/s   rrqm/s  %rrqm r_await rareq-sz     w/s     wMB/s   wrqm/s  %wrqm w_await wareq-sz     d/s     dMB/s   drqm/s  %drqm d_await dareq-sz  aqu-sz  %util
nvme0n1        120.00      7.50     0.00   0.00    0.12    64.00  300.00     18.75     0.00   0.00    0.40    64.00    0.00      0.00     0.00   0.00    0.00     0.00    0.13  12.00
nvme1n1          1.00      0.01     0.00   0.00    0.10     4.00    0.00      0.00     0.00   0.00    0.00     0.00    0.00      0.00     0.00   0.00    0.00     0.00    0.00   0.10

nvme0n1        130.00      8.00     0.00   0.00    0.11    64.00  310.00     19.00     0.00   0.00    0.41    64.00    0.00      0.00     0.00   0.00    0.00     0.00    0.14  12.50
nvme0n1        1.0 2.0
";

    const MPSTAT_CAPTURE: &str = "\
Linux 6.1.0 (host) \t03/01/2024 \t_x86_64_\t(2 CPU)
12:00:00     all    1.00    0.00    2.00    3.00    0.00    0.50    0.00    0.00    0.00   93.50
Time: 2024-03-01 12:00:00.456

12:00:01     CPU    %usr   %nice    %sys %iowait    %irq   %soft  %steal  %guest  %gnice   %idle
12:00:01     all    1.00    0.00    2.00    3.00    0.00    0.50    0.00    0.00    0.00   93.50
12:00:01       0    2.00    0.00    4.00    6.00    0.00    1.00    0.00    0.00    0.00   87.00
12:00:02       1    0.00    0.00
Average:     all    1.00    0.00    2.00    3.00    0.00    0.50    0.00    0.00    0.00   93.50
";

    fn iostat() -> MonitorKind {
        MonitorKind::Iostat {
            device: "nvme0n1".to_string(),
        }
    }

    #[test]
    fn test_parse_iostat_capture() {
        let samples = iostat().parse_capture(IOSTAT_CAPTURE.as_bytes()).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].timestamp, "2024-03-01 12:00:00.123");
        assert_eq!(
            samples[0].fields,
            vec!["120.00", "7.50", "0.12", "64.00", "300.00", "18.75", "0.40", "64.00"]
        );
        // Samples after the first report share the one marker timestamp.
        assert_eq!(samples[1].timestamp, "2024-03-01 12:00:00.123");
        assert_eq!(samples[1].fields[0], "130.00");
    }

    #[test]
    fn test_parse_mpstat_capture() {
        let samples = MonitorKind::Mpstat
            .parse_capture(MPSTAT_CAPTURE.as_bytes())
            .unwrap();
        // Pre-marker row, header, short row and Average are dropped.
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].timestamp, "2024-03-01 12:00:00.456");
        assert_eq!(
            samples[0].fields,
            vec!["all", "1.00", "2.00", "3.00", "0.50", "93.50"]
        );
        assert_eq!(samples[1].fields[0], "0");
    }

    #[test]
    fn test_short_line_after_marker_emits_nothing() {
        let capture = "Time: 2024-03-01 12:00:00.000\nnvme0n1 1.0 2.0 3.0\n";
        assert!(iostat().parse_capture(capture.as_bytes()).unwrap().is_empty());
        assert!(MonitorKind::Mpstat
            .parse_capture(capture.as_bytes())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_marker_with_too_few_tokens_is_ignored() {
        let capture = "Time:\n12:00:01 all 1 0 2 3 0 0.5 0 0 0 93.5\n";
        assert!(MonitorKind::Mpstat
            .parse_capture(capture.as_bytes())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_capture_to_csv() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("iostat_output.txt");
        let csv = dir.path().join("iostat_results.csv");
        std::fs::write(&raw, IOSTAT_CAPTURE).unwrap();
        let rows = iostat().capture_to_csv(&raw, &csv).unwrap();
        assert_eq!(rows, 2);
        let text = std::fs::read_to_string(&csv).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "Timestamp,r/s,rMB/s,r_await,rareq-sz,w/s,wMB/s,w_await,wareq-sz");
        assert_eq!(
            lines[1],
            "2024-03-01 12:00:00.123,120.00,7.50,0.12,64.00,300.00,18.75,0.40,64.00"
        );
        assert_eq!(lines[0].split(',').count(), 9);
    }

    #[test]
    fn test_missing_capture_writes_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("mpstat_results.csv");
        let rows = MonitorKind::Mpstat
            .capture_to_csv(&dir.path().join("missing.txt"), &csv)
            .unwrap();
        assert_eq!(rows, 0);
        assert_eq!(
            std::fs::read_to_string(&csv).unwrap(),
            "Timestamp,core,usr,sys,iowait,soft,idle\n"
        );
    }

    #[test]
    fn test_shell_command() {
        assert_eq!(
            iostat().shell_command(1),
            "echo \"Time: $(date +'%Y-%m-%d %H:%M:%S.%3N')\"; iostat -xdm /dev/nvme0n1 1"
        );
        assert!(MonitorKind::Mpstat.shell_command(2).ends_with("mpstat -P ALL 2"));
    }

    #[test]
    fn test_enabled_monitors() {
        let mut config = MonitorConfig::default();
        assert_eq!(enabled_monitors(&config).len(), 2);
        config.iostat = false;
        assert_eq!(enabled_monitors(&config), vec![MonitorKind::Mpstat]);
    }

    #[test]
    fn test_monitor_command_uses_c_locale() {
        let cmd = monitor_command(&MonitorKind::Mpstat, 1);
        let envs: Vec<_> = cmd.as_std().get_envs().collect();
        assert!(envs.contains(&(std::ffi::OsStr::new("LC_ALL"), Some(std::ffi::OsStr::new("C")))));
        assert!(envs.contains(&(
            std::ffi::OsStr::new("S_TIME_FORMAT"),
            Some(std::ffi::OsStr::new("ISO"))
        )));
    }

    #[test]
    fn test_invalid_utf8_in_capture_is_skipped() {
        let mut capture = b"Time: 2024-03-01 12:00:00.123\n\xff\xfe garbage\n".to_vec();
        capture.extend_from_slice(b"nvme0n1 1.00 2.00 0.10 0.20 0.00 0.00 0.00 0.00 0.50 0.60 0.01 102.40 102.40 0.30 3.00\n");
        let samples = iostat().parse_capture(capture.as_slice()).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].timestamp, "2024-03-01 12:00:00.123");
    }

    #[tokio::test]
    async fn test_spawn_monitor_captures_marker() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("mpstat_output.txt");
        // Interval 0 is rejected by mpstat or mpstat is absent; either way the marker is written.
        let mut child = spawn_monitor(&MonitorKind::Mpstat, 0, &raw).unwrap();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait()).await;
        let _ = child.kill().await;
        let text = std::fs::read_to_string(&raw).unwrap();
        assert!(text.starts_with("Time: "));
    }
}
