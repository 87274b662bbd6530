use std::sync::OnceLock;

use serde::Deserialize;

fn default_threads() -> usize {
    match std::thread::available_parallelism() {
        Ok(n) => usize::from(n).min(4),
        Err(_) => 2,
    }
}

fn default_min_xfer_size() -> usize {
    4096
}

fn default_max_req_size() -> usize {
    4 << 20
}

fn default_seq_cache_flush() -> usize {
    2 << 20
}

fn default_max_assembly_size() -> usize {
    4096
}

fn default_work_slice_us() -> u64 {
    200
}

fn default_deadlock_timeout() -> f64 {
    600.0
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// Number of background worker threads driving the channels, default: min(cores, 4)
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Smallest chunk a transfer descriptor will move when more data is still
    /// expected, default: 4096 bytes
    #[serde(default = "default_min_xfer_size")]
    pub min_xfer_size: usize,

    /// Upper bound on the size of a single channel request, default: 4 MiB
    #[serde(default = "default_max_req_size")]
    pub max_req_size: usize,

    /// Accumulated span size at which the read/write sequence caches flush
    /// updates to peers, default: 2 MiB
    #[serde(default = "default_seq_cache_flush")]
    pub seq_cache_flush: usize,

    /// Maximum payload assembled in-line for gather-style remote writes,
    /// default: 4096 bytes
    #[serde(default = "default_max_assembly_size")]
    pub max_assembly_size: usize,

    /// Time budget handed to a channel per worker slice, in microseconds,
    /// default: 200
    #[serde(default = "default_work_slice_us")]
    pub work_slice_us: u64,

    /// A general timeout in seconds for operations which may indicate a
    /// deadlock, default: 600.0 seconds
    #[serde(default = "default_deadlock_timeout")]
    pub deadlock_timeout: f64,
}

/// Get the current environment variable configuration
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match envy::prefixed("FERRY_").from_env::<Config>() {
        Ok(config) => config,
        Err(error) => panic!("{}", error),
    })
}
