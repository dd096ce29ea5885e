//! Per-client latency/throughput samples from the benchmark's status output.
//!
//! The status thread prints, every interval, a `client<N> stats:` line
//! followed by a line with that client's operation counters.

use crate::log_events::LossyLines;
use regex::Regex;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::LazyLock;

static CLIENT_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^client(\d+) stats:").unwrap());

static DATA_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\d+) operations; \[(READ|UPDATE): Count=(\d+) Max=\d+\.\d+ Min=\d+\.\d+ Avg=(\d+\.\d+) 90=\d+\.\d+ 99=(\d+\.\d+) 99\.9=\d+\.\d+ 99\.99=\d+\.\d+\]",
    )
    .unwrap()
});

/// One status sample: operation count, mean and p99 latency, kept as printed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatSample {
    pub count: String,
    pub avg: String,
    pub p99: String,
}

/// Samples per client, in the order clients first appeared.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ClientStats {
    clients: Vec<(String, Vec<StatSample>)>,
}

impl ClientStats {
    pub fn parse(reader: impl BufRead) -> std::io::Result<Self> {
        let lines: Vec<String> = LossyLines::new(reader).collect::<Result<_, _>>()?;
        let mut stats = ClientStats::default();
        let mut index: HashMap<String, usize> = HashMap::new();

        for (i, line) in lines.iter().enumerate() {
            let Some(client) = CLIENT_LINE.captures(line) else {
                continue;
            };
            let Some(data) = lines.get(i + 1).and_then(|next| DATA_LINE.captures(next)) else {
                continue;
            };
            let id = client[1].to_string();
            let slot = *index.entry(id.clone()).or_insert_with(|| {
                stats.clients.push((id, Vec::new()));
                stats.clients.len() - 1
            });
            stats.clients[slot].1.push(StatSample {
                count: data[3].to_string(),
                avg: data[4].to_string(),
                p99: data[5].to_string(),
            });
        }
        Ok(stats)
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn samples(&self, client: &str) -> Option<&[StatSample]> {
        self.clients
            .iter()
            .find(|(id, _)| id == client)
            .map(|(_, s)| s.as_slice())
    }

    /// Write `ClientID,TimeIndex,Count,Avg,99` rows. Every client gets as many
    /// rows as the longest one; missing samples are blank cells.
    pub fn write_csv(&self, out: &mut impl Write) -> std::io::Result<()> {
        writeln!(out, "ClientID,TimeIndex,Count,Avg,99")?;
        let max_len = self.clients.iter().map(|(_, s)| s.len()).max().unwrap_or(0);
        for (id, samples) in &self.clients {
            for i in 0..max_len {
                match samples.get(i) {
                    Some(s) => writeln!(out, "client{id},{},{},{},{}", i + 1, s.count, s.avg, s.p99)?,
                    None => writeln!(out, "client{id},{},,,", i + 1)?,
                }
            }
        }
        Ok(())
    }
}
