//! Read the events CSV back, derive throughput series and build the events chart.

use crate::chart::{Chart, Layer, Segment, XAxis};
use crate::config::AnalysisConfig;
use crate::log_events::LossyLines;
use std::io::BufRead;
use std::path::Path;

const MIB: f64 = 1024.0 * 1024.0;

fn differences_fit(counts: &[i64]) -> bool {
    counts.windows(2).all(|w| w[1].checked_sub(w[0]).is_some())
}

/// First-difference cumulative counts in place.
///
/// Walks from the last index down to 1 so every element subtracts its
/// original predecessor. Index 0 keeps the raw cumulative count. Returns
/// false and leaves `counts` untouched if a difference overflows.
pub fn first_difference(counts: &mut [i64]) -> bool {
    if !differences_fit(counts) {
        return false;
    }
    for i in (1..counts.len()).rev() {
        counts[i] -= counts[i - 1];
    }
    true
}

/// Convert cumulative operation counts into MB/s.
///
/// Each differenced value is scaled by `record_size_kib / 1024 / interval_secs`.
/// Counts whose differences overflow produce an empty series.
pub fn rate_series(counts: &[i64], interval_secs: f64, record_size_kib: f64) -> Vec<f64> {
    let mut deltas = counts.to_vec();
    if !first_difference(&mut deltas) {
        return Vec::new();
    }
    let factor = record_size_kib / 1024.0 / interval_secs;
    deltas.into_iter().map(|d| d as f64 * factor).collect()
}

/// A compaction interval with its observed output throughput.
#[derive(Debug, Clone, PartialEq)]
pub struct Compaction {
    pub start_micros: i64,
    pub end_micros: i64,
    pub total_output_size: u64,
}

impl Compaction {
    pub fn duration_secs(&self) -> f64 {
        self.end_micros.saturating_sub(self.start_micros) as f64 / 1e6
    }

    /// Output MB/s over the compaction; `None` for a zero-length interval.
    pub fn throughput_mb_s(&self) -> Option<f64> {
        let secs = self.duration_secs();
        if secs <= 0.0 {
            return None;
        }
        Some(self.total_output_size as f64 / (MIB * secs))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stall {
    pub time_micros: i64,
    pub rate: u64,
}

impl Stall {
    pub fn rate_mb_s(&self) -> f64 {
        self.rate as f64 / MIB
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Flush {
    pub time_micros: i64,
    pub total_data_size: u64,
}

/// Cumulative operation counts of one client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSample {
    pub client: String,
    pub start_micros: i64,
    pub counts: Vec<i64>,
}

impl ClientSample {
    /// `(epoch seconds, MB/s)` points, one per sample interval.
    pub fn throughput_points(&self, interval_secs: f64, record_size_kib: f64) -> Vec<(f64, f64)> {
        let start = self.start_micros as f64 / 1e6;
        rate_series(&self.counts, interval_secs, record_size_kib)
            .into_iter()
            .enumerate()
            .map(|(i, rate)| (start + i as f64 * interval_secs, rate))
            .collect()
    }
}

/// Everything read back from an events CSV, grouped by kind.
#[derive(Debug, Default, PartialEq)]
pub struct EventTable {
    pub clients: Vec<ClientSample>,
    pub compactions: Vec<Compaction>,
    pub stalls: Vec<Stall>,
    pub flushes: Vec<Flush>,
}

fn parse_fields<T: std::str::FromStr>(fields: &[&str]) -> Option<Vec<T>> {
    fields.iter().map(|f| f.trim().parse().ok()).collect()
}

impl EventTable {
    /// Add one CSV row. Returns false if the row was not understood.
    fn push_row(&mut self, line: &str) -> bool {
        let fields: Vec<&str> = line.split(',').collect();
        match fields[0] {
            "compaction_finished" if fields.len() >= 4 => {
                let (Some(ints), Ok(size)) = (
                    parse_fields::<i64>(&fields[1..3]),
                    fields[3].trim().parse::<u64>(),
                ) else {
                    return false;
                };
                let Some(start_micros) = ints[0].checked_sub(ints[1]) else {
                    return false;
                };
                self.compactions.push(Compaction {
                    start_micros,
                    end_micros: ints[0],
                    total_output_size: size,
                });
                true
            }
            "stall_started" if fields.len() >= 3 => {
                let (Ok(time_micros), Ok(rate)) = (
                    fields[1].trim().parse::<i64>(),
                    fields[2].trim().parse::<u64>(),
                )
                else {
                    return false;
                };
                self.stalls.push(Stall { time_micros, rate });
                true
            }
            "flush_started" if fields.len() >= 3 => {
                let (Ok(total_data_size), Ok(time_micros)) = (
                    fields[1].trim().parse::<u64>(),
                    fields[2].trim().parse::<i64>(),
                )
                else {
                    return false;
                };
                self.flushes.push(Flush {
                    time_micros,
                    total_data_size,
                });
                true
            }
            tag if tag.starts_with("client") && fields.len() >= 2 => {
                let (Ok(start_micros), Some(counts)) = (
                    fields[1].trim().parse::<i64>(),
                    parse_fields::<i64>(&fields[2..]),
                )
                else {
                    return false;
                };
                if !differences_fit(&counts) {
                    return false;
                }
                self.clients.push(ClientSample {
                    client: tag.to_string(),
                    start_micros,
                    counts,
                });
                true
            }
            _ => false,
        }
    }

    pub fn from_reader(reader: impl BufRead) -> std::io::Result<Self> {
        let mut table = EventTable::default();
        for (i, line) in LossyLines::new(reader).enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if !table.push_row(&line) {
                tracing::warn!(line = i + 1, row = %line, "skipping unrecognized events row");
            }
        }
        Ok(table)
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }
}

/// Per-client throughput lines, compaction segments and stall markers.
pub fn events_chart(table: &EventTable, config: &AnalysisConfig) -> Chart {
    let mut chart = Chart::new(config.title.clone(), XAxis::WallClock);
    chart.x_label = "Time (H:M:S)".to_string();
    chart.y_label = "MB/s".to_string();

    for client in &table.clients {
        chart.layers.push(Layer::Line {
            label: client.client.clone(),
            points: client.throughput_points(config.sample_interval_secs, config.record_size_kib),
            dashed: false,
        });
    }

    let segments = table
        .compactions
        .iter()
        .filter_map(|c| {
            c.throughput_mb_s().map(|y| Segment {
                x_start: c.start_micros as f64 / 1e6,
                x_end: c.end_micros as f64 / 1e6,
                y,
            })
        })
        .collect();
    chart.layers.push(Layer::Segments {
        label: "Compaction".to_string(),
        segments,
    });

    chart.layers.push(Layer::Points {
        label: "Stall Started".to_string(),
        points: table
            .stalls
            .iter()
            .map(|s| (s.time_micros as f64 / 1e6, s.rate_mb_s()))
            .collect(),
    });
    chart
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_difference_keeps_first_element() {
        let mut counts = vec![0, 100, 250, 250];
        assert!(first_difference(&mut counts));
        assert_eq!(counts, vec![0, 100, 150, 0]);

        let mut counts = vec![40, 100];
        assert!(first_difference(&mut counts));
        assert_eq!(counts, vec![40, 60]);
    }

    #[test]
    fn test_first_difference_short_inputs() {
        let mut empty: Vec<i64> = vec![];
        first_difference(&mut empty);
        assert!(empty.is_empty());
        let mut one = vec![7];
        first_difference(&mut one);
        assert_eq!(one, vec![7]);
    }

    #[test]
    fn test_first_difference_overflow_leaves_counts() {
        let mut counts = vec![i64::MIN, i64::MAX];
        assert!(!first_difference(&mut counts));
        assert_eq!(counts, vec![i64::MIN, i64::MAX]);
        assert!(rate_series(&counts, 2.0, 16.0).is_empty());
    }

    #[test]
    fn test_overflowing_rows_are_skipped() {
        let csv = format!(
            "compaction_finished,{},1,5\n\
             client1,0,{},{}\n\
             compaction_finished,1000000,500000,1048576\n",
            i64::MIN,
            i64::MIN,
            i64::MAX
        );
        let table = EventTable::from_reader(csv.as_bytes()).unwrap();
        assert_eq!(table.compactions.len(), 1);
        assert_eq!(table.compactions[0].start_micros, 500_000);
        assert!(table.clients.is_empty());
    }

    #[test]
    fn test_rate_series_mb_per_second() {
        // delta / 2 * 16 / 1024
        let rates = rate_series(&[0, 100, 250, 250], 2.0, 16.0);
        assert_eq!(rates, vec![0.0, 0.78125, 1.171875, 0.0]);
    }

    #[test]
    fn test_rate_series_first_sample_is_raw_count() {
        let rates = rate_series(&[128, 256], 2.0, 16.0);
        assert_eq!(rates[0], 128.0 / 2.0 * 16.0 / 1024.0);
        assert_eq!(rates[1], 128.0 / 2.0 * 16.0 / 1024.0);
    }

    #[test]
    fn test_compaction_throughput() {
        let c = Compaction {
            start_micros: 500_000,
            end_micros: 1_000_000,
            total_output_size: 1_048_576,
        };
        assert_eq!(c.throughput_mb_s(), Some(2.0));
        let instant = Compaction {
            start_micros: 5,
            end_micros: 5,
            total_output_size: 10,
        };
        assert_eq!(instant.throughput_mb_s(), None);
    }

    #[test]
    fn test_load_events_table() {
        let csv = "compaction_finished,1000000,500000,1048576\n\
                   flush_started,4096,900000\n\
                   stall_started,1200000,2097152\n\
                   bogus,1,2\n\
                   stall_started,notanumber,1\n\
                   client1,1000000,0,100,250,250\n";
        let table = EventTable::from_reader(csv.as_bytes()).unwrap();
        assert_eq!(
            table.compactions,
            vec![Compaction {
                start_micros: 500_000,
                end_micros: 1_000_000,
                total_output_size: 1_048_576
            }]
        );
        assert_eq!(
            table.flushes,
            vec![Flush {
                time_micros: 900_000,
                total_data_size: 4096
            }]
        );
        assert_eq!(table.stalls.len(), 1);
        assert_eq!(table.stalls[0].rate_mb_s(), 2.0);
        assert_eq!(table.clients[0].client, "client1");
        assert_eq!(table.clients[0].counts, vec![0, 100, 250, 250]);
    }

    #[test]
    fn test_client_throughput_points_spaced_by_interval() {
        let client = ClientSample {
            client: "client1".to_string(),
            start_micros: 10_000_000,
            counts: vec![0, 100, 250],
        };
        let points = client.throughput_points(2.0, 16.0);
        assert_eq!(points, vec![(10.0, 0.0), (12.0, 0.78125), (14.0, 1.171875)]);
    }

    #[test]
    fn test_events_chart_layers() {
        let csv = "compaction_finished,1000000,500000,1048576\n\
                   compaction_finished,2000000,0,1048576\n\
                   stall_started,1200000,1048576\n\
                   client1,1000000,0,100\n\
                   client2,1000000,5\n";
        let table = EventTable::from_reader(csv.as_bytes()).unwrap();
        let chart = events_chart(&table, &AnalysisConfig::default());
        assert_eq!(chart.x_axis, XAxis::WallClock);
        assert_eq!(chart.layers.len(), 4);
        match &chart.layers[2] {
            Layer::Segments { segments, .. } => {
                // The zero-duration compaction has no throughput and is not drawn.
                assert_eq!(
                    segments,
                    &vec![Segment {
                        x_start: 0.5,
                        x_end: 1.0,
                        y: 2.0
                    }]
                );
            }
            other => panic!("expected segments, got {other:?}"),
        }
        match &chart.layers[3] {
            Layer::Points { points, .. } => assert_eq!(points, &vec![(1.2, 1.0)]),
            other => panic!("expected points, got {other:?}"),
        }
    }
}
