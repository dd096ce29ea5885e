/// Benchmark invocation: turn the experiment config into the program, arguments
/// and environment the benchmark is started with.
///
/// Values are forwarded verbatim; the benchmark is responsible for validating them.
use crate::config::{HarnessConfig, LaunchMode};

/// Program, arguments and extra environment for one benchmark run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchmarkInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl BenchmarkInvocation {
    /// Build the invocation for the configured launch mode.
    pub fn from_config(config: &HarnessConfig) -> Self {
        match config.benchmark.mode {
            LaunchMode::Flags => Self {
                program: config.benchmark.program.clone(),
                args: flag_args(config),
                env: Vec::new(),
            },
            LaunchMode::Env => Self {
                program: config.benchmark.shell.clone(),
                args: vec![config.benchmark.script.display().to_string()],
                env: env_vars(config),
            },
        }
    }

    /// Shell-like rendering for logs and `--dry-run`.
    pub fn command_line(&self) -> String {
        let mut parts: Vec<String> = self.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Repeat one per-column-family value `num_cfs` times, comma-joined.
pub fn per_cf(value: impl ToString, num_cfs: u32) -> String {
    let value = value.to_string();
    vec![value; num_cfs as usize].join(",")
}

/// `floor(log2(size / (record_size * records_per_shard)))`, 0 for an empty
/// cache or a cache smaller than one shard.
pub fn cache_shard_bits(size: u64, record_size: u64, records_per_shard: u64) -> u32 {
    let shard_bytes = record_size.saturating_mul(records_per_shard);
    if size == 0 || shard_bytes == 0 {
        return 0;
    }
    match size / shard_bytes {
        0 => 0,
        shards => shards.ilog2(),
    }
}

/// Shard bits for the configured cache: pooled caches span every column family.
pub fn configured_shard_bits(config: &HarnessConfig) -> u32 {
    let cache = &config.cache;
    let size = if cache.use_pooled {
        cache.size.saturating_mul(config.dataset.num_cfs as u64)
    } else {
        cache.size
    };
    cache_shard_bits(size, config.dataset.record_size, cache.records_per_shard)
}

/// The `-p key=value` properties, in the order the benchmark documents them.
pub fn properties(config: &HarnessConfig) -> Vec<(String, String)> {
    let b = &config.benchmark;
    let d = &config.dataset;
    let r = &config.rocksdb;
    let c = &config.cache;
    let w = &config.write_buffer;
    let rl = &config.rate_limiter;
    let s = &config.scheduler;
    let n = d.num_cfs;

    let props: Vec<(&str, String)> = vec![
        ("rocksdb.dbname", b.dbname.clone()),
        ("workload", b.workload.clone()),
        ("config", b.client_config.clone()),
        ("readallfields", "true".to_string()),
        ("fieldcount", d.fieldcount.to_string()),
        ("fieldlength", d.record_size.to_string()),
        ("tpool_threads", r.tpool_threads.to_string()),
        ("fairdb_use_pooled", c.use_pooled.to_string()),
        ("rocksdb.num_cfs", n.to_string()),
        ("rocksdb.cache_size", per_cf(c.size, n)),
        ("rocksdb.write_buffer_size", per_cf(r.write_buffer_size, n)),
        ("rocksdb.max_write_buffer_number", per_cf(r.max_write_buffer_number, n)),
        ("rocksdb.max_background_jobs", r.max_background_jobs.to_string()),
        ("rocksdb.max_background_flushes", r.max_background_flushes.to_string()),
        ("rocksdb.max_subcompactions", r.max_subcompactions.to_string()),
        ("cache_num_shard_bits", configured_shard_bits(config).to_string()),
        ("fairdb_cache_rad", c.rad_micros.to_string()),
        ("wbm_size", w.wbm_size.to_string()),
        ("wbm_steady_res_size", w.steady_res_size.to_string()),
        ("wbm_limits", per_cf(w.limit, n)),
        ("status.interval_ms", b.status_interval_ms.to_string()),
        ("enable_rate_limiter", rl.enabled.to_string()),
        ("write_rate_limits", per_cf(rl.write_mbps, n)),
        ("read_rate_limits", per_cf(rl.read_mbps, n)),
        ("refill_period_ms", rl.refill_period_ms.to_string()),
        ("rsched", s.enabled.to_string()),
        ("rsched_interval_ms", s.interval_ms.to_string()),
        ("lookback_intervals", s.lookback_intervals.to_string()),
        ("rsched_rampup_multiplier", s.rampup_multiplier.to_string()),
        ("io_read_capacity_kbps", s.io_read_capacity_kbps.to_string()),
        ("io_write_capacity_kbps", s.io_write_capacity_kbps.to_string()),
        ("memtable_capacity_kb", s.memtable_capacity_kb.to_string()),
        ("min_memtable_count", s.min_memtable_count.to_string()),
        ("max_memtable_size_kb", s.max_memtable_size_kb.to_string()),
        ("min_memtable_size_kb", s.min_memtable_size_kb.to_string()),
    ];
    let mut out: Vec<(String, String)> = props
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    out.extend(b.extra_props.iter().map(|(k, v)| (k.clone(), v.clone())));
    out
}

fn flag_args(config: &HarnessConfig) -> Vec<String> {
    let mut args = vec![
        "-run".to_string(),
        "-db".to_string(),
        "rocksdb".to_string(),
        "-P".to_string(),
        config.benchmark.properties.display().to_string(),
        "-s".to_string(),
    ];
    for (key, value) in properties(config) {
        args.push("-p".to_string());
        args.push(format!("{key}={value}"));
    }
    args
}

fn env_vars(config: &HarnessConfig) -> Vec<(String, String)> {
    let d = &config.dataset;
    let c = &config.cache;
    let w = &config.write_buffer;
    let n = d.num_cfs;
    [
        ("CONFIG", config.benchmark.client_config.clone()),
        ("FIELDCOUNT", d.fieldcount.to_string()),
        ("FIELDLENGTH", d.record_size.to_string()),
        ("TPOOL_THREADS", config.rocksdb.tpool_threads.to_string()),
        ("ROCKSDB_NUM_CFS", n.to_string()),
        ("FAIRDB_USE_POOLED", c.use_pooled.to_string()),
        ("ROCKSDB_CACHE_SIZE", per_cf(c.size, n)),
        ("CACHE_NUM_SHARD_BITS", configured_shard_bits(config).to_string()),
        ("CACHE_RAD_MICROSECONDS", c.rad_micros.to_string()),
        ("WBM_SIZE", w.wbm_size.to_string()),
        ("WBM_STEADY_RES_SIZE", w.steady_res_size.to_string()),
        ("WBM_LIMITS", per_cf(w.limit, n)),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_per_cf() {
        assert_eq!(per_cf(750, 3), "750,750,750");
        assert_eq!(per_cf("x", 1), "x");
        assert_eq!(per_cf(1, 0), "");
    }

    #[test]
    fn test_cache_shard_bits() {
        // 64 KiB records, 256 per shard = 16 MiB shards
        let shard = 64 * 1024 * 256;
        assert_eq!(cache_shard_bits(0, 64 * 1024, 256), 0);
        assert_eq!(cache_shard_bits(shard, 64 * 1024, 256), 0);
        assert_eq!(cache_shard_bits(shard * 8, 64 * 1024, 256), 3);
        assert_eq!(cache_shard_bits(shard * 8 + shard / 2, 64 * 1024, 256), 3);
        assert_eq!(cache_shard_bits(shard / 2, 64 * 1024, 256), 0);
    }

    #[test]
    fn test_configured_shard_bits_pooled_vs_isolated() {
        let mut config = HarnessConfig::default();
        // 4000 MiB * 16 CFs / 16 MiB shards = 4000 shards -> 11 bits
        assert_eq!(configured_shard_bits(&config), 11);
        config.cache.use_pooled = false;
        // 4000 MiB / 16 MiB = 250 shards -> 7 bits
        assert_eq!(configured_shard_bits(&config), 7);
        config.cache.size = 0;
        assert_eq!(configured_shard_bits(&config), 0);
    }

    #[test]
    fn test_flags_invocation() {
        let mut config = HarnessConfig::default();
        config.dataset.num_cfs = 2;
        config
            .benchmark
            .extra_props
            .insert("operationcount".to_string(), "500".to_string());
        let inv = BenchmarkInvocation::from_config(&config);
        assert_eq!(inv.program, "./ycsb");
        assert!(inv.env.is_empty());
        assert_eq!(
            &inv.args[..6],
            &["-run", "-db", "rocksdb", "-P", "rocksdb/rocksdb.properties", "-s"]
        );
        assert!(inv.args.contains(&"rocksdb.dbname=/mnt/rocksdb/ycsb-rocksdb-data".to_string()));
        assert!(inv.args.contains(&"wbm_limits=750,750".to_string()));
        assert!(inv.args.contains(&"rocksdb.write_buffer_size=67108864,67108864".to_string()));
        assert!(inv.args.contains(&"rsched_rampup_multiplier=1.2".to_string()));
        assert_eq!(inv.args.last().unwrap(), "operationcount=500");
        // Every property is preceded by -p.
        let props = properties(&config);
        assert_eq!(inv.args.len(), 6 + 2 * props.len());
        assert!(inv.args[6..].chunks(2).all(|pair| pair[0] == "-p"));
    }

    #[test]
    fn test_env_invocation() {
        let mut config = HarnessConfig::default();
        config.benchmark.mode = LaunchMode::Env;
        config.benchmark.script = PathBuf::from("exp_runner.sh");
        config.dataset.num_cfs = 3;
        config.dataset.record_size = 4096;
        config.cache.size = 0;
        let inv = BenchmarkInvocation::from_config(&config);
        assert_eq!(inv.program, "/bin/bash");
        assert_eq!(inv.args, vec!["exp_runner.sh"]);
        let env: std::collections::HashMap<_, _> = inv.env.iter().cloned().collect();
        assert_eq!(env["FIELDLENGTH"], "4096");
        assert_eq!(env["ROCKSDB_CACHE_SIZE"], "0,0,0");
        assert_eq!(env["CACHE_NUM_SHARD_BITS"], "0");
        assert_eq!(env["WBM_LIMITS"], "750,750,750");
        assert_eq!(env.len(), 12);
    }

    #[test]
    fn test_command_line() {
        let inv = BenchmarkInvocation {
            program: "/bin/bash".to_string(),
            args: vec!["run.sh".to_string()],
            env: vec![("A".to_string(), "1".to_string())],
        };
        assert_eq!(inv.command_line(), "A=1 /bin/bash run.sh");
    }
}
