use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from experiment.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct HarnessConfig {
    pub benchmark: BenchmarkConfig,
    pub dataset: DatasetConfig,
    pub rocksdb: RocksDbConfig,
    pub cache: CacheConfig,
    pub write_buffer: WriteBufferConfig,
    pub rate_limiter: RateLimiterConfig,
    pub scheduler: SchedulerConfig,
    pub monitor: MonitorConfig,
    pub watch: WatchConfig,
    pub analysis: AnalysisConfig,
    pub checkpoint: CheckpointConfig,
}

/// How tuning parameters reach the benchmark process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    /// Run the benchmark binary directly with `-p key=value` flags.
    Flags,
    /// Run a wrapper script with the parameters exported as environment variables.
    Env,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub mode: LaunchMode,
    pub program: String,
    pub shell: String,
    pub script: PathBuf,
    pub properties: PathBuf,
    pub dbname: String,
    pub workload: String,
    pub client_config: String,
    pub status_interval_ms: u64,
    /// Extra `-p key=value` properties appended verbatim in flags mode.
    pub extra_props: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub fieldcount: u32,
    pub record_size: u64,
    pub num_cfs: u32,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RocksDbConfig {
    pub tpool_threads: u32,
    pub max_background_jobs: u32,
    pub max_background_flushes: u32,
    pub max_subcompactions: u32,
    pub write_buffer_size: u64,
    pub max_write_buffer_number: u32,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Per-column-family block cache size in bytes; 0 disables the cache.
    pub size: u64,
    pub records_per_shard: u64,
    pub use_pooled: bool,
    pub rad_micros: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WriteBufferConfig {
    /// Write buffer manager size; 0 disables it.
    pub wbm_size: u64,
    pub steady_res_size: u64,
    pub limit: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub enabled: bool,
    pub write_mbps: u64,
    pub read_mbps: u64,
    pub refill_period_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub lookback_intervals: u32,
    pub rampup_multiplier: f64,
    pub io_read_capacity_kbps: u64,
    pub io_write_capacity_kbps: u64,
    pub memtable_capacity_kb: u64,
    pub min_memtable_count: u32,
    pub max_memtable_size_kb: u64,
    pub min_memtable_size_kb: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub iostat: bool,
    pub mpstat: bool,
    pub device: String,
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Directory to poll during a run; no watcher when unset.
    pub dir: Option<PathBuf>,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub sample_interval_secs: f64,
    pub record_size_kib: f64,
    pub title: String,
    /// Reference time for the flush-queue chart x axis; earliest sample when unset.
    pub start_time_s: Option<f64>,
    pub xlim: Option<(f64, f64)>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub results_dir: PathBuf,
    /// Files (or glob patterns) copied into the checkpoint, relative to the experiment dir.
    pub files: Vec<String>,
    /// Database LOG location; `{user}` is replaced with `$USER`.
    pub log_file: String,
    pub compress_log: bool,
}

/// Errors that can occur while loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl HarnessConfig {
    /// Load the config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

// --- Default implementations ---

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            mode: LaunchMode::Flags,
            program: "./ycsb".to_string(),
            shell: "/bin/bash".to_string(),
            script: PathBuf::from("exp_runner.sh"),
            properties: PathBuf::from("rocksdb/rocksdb.properties"),
            dbname: "/mnt/rocksdb/ycsb-rocksdb-data".to_string(),
            workload: "com.yahoo.ycsb.workloads.CoreWorkload".to_string(),
            client_config: "examples/tg_cache.yaml".to_string(),
            status_interval_ms: 100,
            extra_props: BTreeMap::new(),
        }
    }
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            fieldcount: 1,
            record_size: 64 * 1024,
            num_cfs: 16,
        }
    }
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            tpool_threads: 8,
            max_background_jobs: 4,
            max_background_flushes: 3,
            max_subcompactions: 1,
            write_buffer_size: 64 * 1024 * 1024,
            max_write_buffer_number: 2,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: 8 * 500 * 1024 * 1024,
            records_per_shard: 256,
            use_pooled: true,
            rad_micros: 0,
        }
    }
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        Self {
            wbm_size: 0,
            steady_res_size: 650,
            limit: 750,
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            write_mbps: 10000,
            read_mbps: 10000,
            refill_period_ms: 50,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 10,
            lookback_intervals: 30,
            rampup_multiplier: 1.2,
            io_read_capacity_kbps: 9000 * 1024,
            io_write_capacity_kbps: 4500 * 1024,
            memtable_capacity_kb: 512 * 1024,
            min_memtable_count: 16,
            max_memtable_size_kb: 64 * 1024,
            min_memtable_size_kb: 64 * 1024,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            iostat: true,
            mpstat: true,
            device: "nvme0n1".to_string(),
            interval_secs: 1,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            dir: None,
            poll_interval_secs: 5,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 2.0,
            record_size_kib: 16.0,
            title: "YCSB client throughput".to_string(),
            start_time_s: None,
            xlim: None,
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
            files: vec![
                "iostat_results.csv".to_string(),
                "mpstat_results.csv".to_string(),
                "logs/client_stats.log".to_string(),
            ],
            log_file: "/home/{user}/ycsb-rocksdb-data/LOG".to_string(),
            compress_log: false,
        }
    }
}
