//! Flush-queue snapshots: which flush reasons are waiting, and how many
//! column families each one covers, over time.

use crate::chart::{Chart, Layer, XAxis};
use crate::log_events::LossyLines;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;
use std::sync::LazyLock;

const SNAPSHOT_TAG: &str = "flush_queue";
const EMPTY_REASON: &str = "Empty";

static REQUEST_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{Reason:\s*([^,]+),\s*CFDs:\s*\[([^\]]*)\]\}").unwrap());

/// Pending CFD count per flush reason at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushQueueSnapshot {
    pub timestamp_ms: i64,
    pub reasons: BTreeMap<String, usize>,
}

/// Parse one `flush_queue,<..>,<timestamp_ms>,<..>,[{Reason: X, CFDs:[..]}, ..]` line.
///
/// Returns `None` for anything that is not a snapshot data line, including
/// header lines whose timestamp column is not an integer.
pub fn parse_flush_queue_line(line: &str) -> Option<FlushQueueSnapshot> {
    let parts: Vec<&str> = line.trim().splitn(5, ',').collect();
    if parts.len() < 5 || parts[0] != SNAPSHOT_TAG {
        return None;
    }
    let timestamp_ms = parts[2].trim().parse::<i64>().ok()?;

    let details = parts[4];
    let requests = details.strip_prefix('[').unwrap_or(details);
    let requests = requests.strip_suffix(']').unwrap_or(requests);

    let mut reasons = BTreeMap::new();
    for caps in REQUEST_PATTERN.captures_iter(requests) {
        let reason = caps[1].trim().to_string();
        let count = caps[2].trim().split('|').filter(|pair| !pair.is_empty()).count();
        *reasons.entry(reason).or_insert(0) += count;
    }
    Some(FlushQueueSnapshot {
        timestamp_ms,
        reasons,
    })
}

/// Read every snapshot line of a flush-queue log, skipping other lines.
pub fn load_snapshots(path: &Path) -> std::io::Result<Vec<FlushQueueSnapshot>> {
    let file = std::fs::File::open(path)?;
    let mut out = Vec::new();
    for line in LossyLines::new(std::io::BufReader::new(file)) {
        if let Some(snapshot) = parse_flush_queue_line(&line?) {
            out.push(snapshot);
        }
    }
    Ok(out)
}

/// Snapshots pivoted into a time-sorted table, one column per reason.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushQueueTable {
    /// Seconds relative to the start time.
    pub times: Vec<f64>,
    pub reasons: Vec<String>,
    /// `columns[r][t]` is the count for `reasons[r]` at `times[t]`.
    pub columns: Vec<Vec<f64>>,
    pub totals: Vec<f64>,
}

impl FlushQueueTable {
    /// Pivot snapshots. Repeated (time, reason) cells are averaged, missing
    /// cells are 0, and an all-zero `Empty` column is dropped after totals
    /// are computed. `start_time_s` defaults to the earliest snapshot.
    pub fn build(snapshots: &[FlushQueueSnapshot], start_time_s: Option<f64>) -> Self {
        let start = start_time_s.unwrap_or_else(|| {
            snapshots
                .iter()
                .map(|s| s.timestamp_ms)
                .min()
                .map(|ms| ms as f64 / 1000.0)
                .unwrap_or(0.0)
        });

        // timestamp -> reason -> (sum, samples)
        let mut cells: BTreeMap<i64, BTreeMap<String, (f64, u32)>> = BTreeMap::new();
        let mut all_reasons = BTreeSet::new();
        for snapshot in snapshots {
            let row = cells.entry(snapshot.timestamp_ms).or_default();
            if snapshot.reasons.is_empty() {
                let cell = row.entry(EMPTY_REASON.to_string()).or_insert((0.0, 0));
                cell.1 += 1;
                all_reasons.insert(EMPTY_REASON.to_string());
                continue;
            }
            for (reason, count) in &snapshot.reasons {
                let cell = row.entry(reason.clone()).or_insert((0.0, 0));
                cell.0 += *count as f64;
                cell.1 += 1;
                all_reasons.insert(reason.clone());
            }
        }

        let times: Vec<f64> = cells.keys().map(|ms| *ms as f64 / 1000.0 - start).collect();
        let mut reasons: Vec<String> = all_reasons.into_iter().collect();
        let mut columns: Vec<Vec<f64>> = reasons
            .iter()
            .map(|reason| {
                cells
                    .values()
                    .map(|row| match row.get(reason) {
                        Some((sum, n)) => sum / *n as f64,
                        None => 0.0,
                    })
                    .collect()
            })
            .collect();
        let totals = (0..times.len())
            .map(|t| columns.iter().map(|c| c[t]).sum())
            .collect();

        if let Some(idx) = reasons.iter().position(|r| r == EMPTY_REASON) {
            if columns[idx].iter().sum::<f64>() == 0.0 {
                reasons.remove(idx);
                columns.remove(idx);
            }
        }

        Self {
            times,
            reasons,
            columns,
            totals,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Append the total and per-reason series as metric blocks.
    pub fn write_metrics(&self, out: &mut impl Write) -> std::io::Result<()> {
        writeln!(out, "metric-flush_queue_total")?;
        writeln!(out, "time_points:{}", format_list(&self.times))?;
        writeln!(out, "data_points:{}", format_list(&self.totals))?;
        for (reason, column) in self.reasons.iter().zip(&self.columns) {
            writeln!(out, "metric-flush_queue_reason-{reason}")?;
            writeln!(out, "time_points:{}", format_list(&self.times))?;
            writeln!(out, "data_points:{}", format_list(column))?;
        }
        Ok(())
    }
}

fn format_list(values: &[f64]) -> String {
    let items: Vec<String> = values.iter().map(|v| format!("{v:?}")).collect();
    format!("[{}]", items.join(", "))
}

/// Stacked per-reason areas with a dashed total line.
pub fn flush_queue_chart(table: &FlushQueueTable, xlim: Option<(f64, f64)>) -> Chart {
    if table.is_empty() {
        return Chart::placeholder("Flush Queue State (No Data)", "No flush_queue data found");
    }
    let mut chart = Chart::new("Flush Queue State Over Time", XAxis::Seconds);
    chart.x_label = "Time (s)".to_string();
    chart.y_label = "Number of CFDs".to_string();
    chart.x_range = xlim;
    chart.y_min = Some(0.0);
    chart.layers.push(Layer::StackedArea {
        x: table.times.clone(),
        series: table
            .reasons
            .iter()
            .cloned()
            .zip(table.columns.iter().cloned())
            .collect(),
    });
    chart.layers.push(Layer::Line {
        label: "Total CFDs in Queue".to_string(),
        points: table
            .times
            .iter()
            .copied()
            .zip(table.totals.iter().copied())
            .collect(),
        dashed: true,
    });
    chart
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(ts: i64, reasons: &[(&str, usize)]) -> FlushQueueSnapshot {
        FlushQueueSnapshot {
            timestamp_ms: ts,
            reasons: reasons.iter().map(|(r, c)| (r.to_string(), *c)).collect(),
        }
    }

    #[test]
    fn test_parse_snapshot_line() {
        let line = "flush_queue,x,1700000000000,y,[{Reason: kWriteBufferFull, CFDs:[1:0|2:0]},{Reason: kManualFlush, CFDs:[]}]";
        let parsed = parse_flush_queue_line(line).unwrap();
        assert_eq!(
            parsed,
            snapshot(1_700_000_000_000, &[("kWriteBufferFull", 2), ("kManualFlush", 0)])
        );
    }

    #[test]
    fn test_parse_empty_queue() {
        let parsed = parse_flush_queue_line("flush_queue,a,1000,b,[]\n").unwrap();
        assert_eq!(parsed.timestamp_ms, 1000);
        assert!(parsed.reasons.is_empty());
    }

    #[test]
    fn test_parse_rejects_header_and_other_tags() {
        assert!(parse_flush_queue_line("type,cf,timestamp_ms,size,details").is_none());
        assert!(parse_flush_queue_line("flush_queue,a,notanumber,b,[]").is_none());
        assert!(parse_flush_queue_line("wal_write,a,1000,b,[]").is_none());
        assert!(parse_flush_queue_line("flush_queue,a,1000").is_none());
        assert!(parse_flush_queue_line("").is_none());
    }

    #[test]
    fn test_parse_accumulates_repeated_reason_and_ignores_empty_entries() {
        let line = "flush_queue,a,5,b,[{Reason:kFlush,CFDs:[1:0|]},{Reason: kFlush , CFDs: [3:1|4:2|5:0]}]";
        let parsed = parse_flush_queue_line(line).unwrap();
        assert_eq!(parsed.reasons.get("kFlush"), Some(&4));
    }

    #[test]
    fn test_table_pivot_and_totals() {
        let snapshots = vec![
            snapshot(2000, &[("kManualFlush", 1)]),
            snapshot(1000, &[("kWriteBufferFull", 2), ("kManualFlush", 0)]),
            snapshot(2000, &[("kManualFlush", 3)]),
            snapshot(3000, &[]),
        ];
        let table = FlushQueueTable::build(&snapshots, None);
        assert_eq!(table.times, vec![0.0, 1.0, 2.0]);
        // All-zero "Empty" column is dropped.
        assert_eq!(table.reasons, vec!["kManualFlush", "kWriteBufferFull"]);
        assert_eq!(table.columns[0], vec![0.0, 2.0, 0.0]);
        assert_eq!(table.columns[1], vec![2.0, 0.0, 0.0]);
        assert_eq!(table.totals, vec![2.0, 2.0, 0.0]);
    }

    #[test]
    fn test_table_explicit_start_time() {
        let snapshots = vec![snapshot(10_500, &[("kFlush", 1)])];
        let table = FlushQueueTable::build(&snapshots, Some(10.0));
        assert_eq!(table.times, vec![0.5]);
    }

    #[test]
    fn test_write_metrics() {
        let snapshots = vec![snapshot(0, &[("kFlush", 1)]), snapshot(1500, &[("kFlush", 2)])];
        let table = FlushQueueTable::build(&snapshots, None);
        let mut out = Vec::new();
        table.write_metrics(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "metric-flush_queue_total\n\
             time_points:[0.0, 1.5]\n\
             data_points:[1.0, 2.0]\n\
             metric-flush_queue_reason-kFlush\n\
             time_points:[0.0, 1.5]\n\
             data_points:[1.0, 2.0]\n"
        );
    }

    #[test]
    fn test_load_snapshots_skips_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("WAL_logs.csv");
        std::fs::write(
            &path,
            "type,a,timestamp,b,details\nflush_queue,a,1000,b,[{Reason: kFlush, CFDs:[1:1]}]\nwal,a,1,b,c\n",
        )
        .unwrap();
        let snapshots = load_snapshots(&path).unwrap();
        assert_eq!(snapshots, vec![snapshot(1000, &[("kFlush", 1)])]);
    }

    #[test]
    fn test_load_snapshots_survives_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("WAL_logs.csv");
        let mut bytes = b"wal,a,1,b,\xff\xfe\n".to_vec();
        bytes.extend_from_slice(b"flush_queue,a,2000,b,[{Reason: kFlush, CFDs:[1:1|2:2]}]\n");
        std::fs::write(&path, bytes).unwrap();
        let snapshots = load_snapshots(&path).unwrap();
        assert_eq!(snapshots, vec![snapshot(2000, &[("kFlush", 2)])]);
    }

    #[test]
    fn test_chart_placeholder_for_empty_table() {
        let table = FlushQueueTable::build(&[], None);
        let chart = flush_queue_chart(&table, None);
        assert!(!chart.has_data());
        assert_eq!(chart.placeholder.as_deref(), Some("No flush_queue data found"));
    }

    #[test]
    fn test_chart_layers() {
        let table = FlushQueueTable::build(&[snapshot(0, &[("kFlush", 2)])], None);
        let chart = flush_queue_chart(&table, Some((0.0, 30.0)));
        assert_eq!(chart.layers.len(), 2);
        assert_eq!(chart.x_range, Some((0.0, 30.0)));
        assert!(matches!(chart.layers[1], Layer::Line { dashed: true, .. }));
    }
}
