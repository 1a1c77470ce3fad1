//! Runtime configuration.
//!
//! Values come from an optional TOML file layered under `MX_SERVE_*`
//! environment variables (environment wins). Scalar knobs fall back to
//! defaults on missing or unparsable values; out-of-range values are
//! clamped. Only a structurally broken config file is fatal.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `MX_SERVE_MAX_BUFFER_SIZE` | 1048576 | Max RPC line buffer (bytes) |
//! | `MX_SERVE_STREAM_QUEUE_SIZE` | 256 | Per-stream event queue depth |
//! | `MX_SERVE_QUEUE_PUT_MAX_RETRIES` | 10 | Backpressure retry budget |
//! | `MX_SERVE_QUEUE_PUT_BACKOFF_MS` | 50 | Backpressure backoff per retry |
//! | `MX_SERVE_DEFAULT_CONTEXT_LENGTH` | 4096 | Context length fallback |
//! | `MX_SERVE_DEFAULT_MAX_TOKENS` | 512 | max_tokens fallback |
//! | `MX_SERVE_MAX_GENERATION_TOKENS` | 4096 | Hard max_tokens ceiling |
//! | `MX_SERVE_MAX_TEMPERATURE` | 2.0 | Hard temperature ceiling |
//! | `MX_SERVE_TRUSTED_MODEL_DIRS` | (unset) | Colon-separated trusted roots |
//! | `MX_SERVE_GPU_SCHEDULER` | on | GPU scheduler on/off |
//! | `MX_SERVE_SCHEDULER_BATCH_SIZE` | 4 | Jobs per commit batch (1-16) |
//! | `MX_SERVE_SCHEDULER_WINDOW_MS` | 1.0 | Batch window (0.75-5.0 ms) |
//! | `MX_SERVE_P99_THRESHOLD_MS` | 100.0 | Degradation threshold (50-500) |
//! | `MX_SERVE_FAST_PATH` | on | Lone-job fast path |
//! | `MX_SERVE_ADAPTIVE_WINDOW` | off | Queue-depth window sizing |
//! | `MX_SERVE_AUTO_TUNE` | off | EMA batch-size auto-tuning |
//! | `MX_SERVE_METRICS_EXPORT` | off | Prometheus text endpoint |
//! | `MX_SERVE_BATCH_MAX_REQUESTS` | 8 | Continuous batch size |
//! | `MX_SERVE_BATCH_WINDOW_MS` | 10.0 | Continuous fill window |
//! | `MX_SERVE_SHUTDOWN_TIMEOUT` | 5 | Per-component drain (secs) |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::memory::{KvCachePoolConfig, MemoryControllerConfig, PromptCacheConfig};
use crate::scheduler::{BatcherConfig, ControllerConfig, GpuSchedulerConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },

    #[error("invalid config file {path}: {source}")]
    Parse { path: String, source: toml::de::Error },
}

/// Line-framing and stream backpressure settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub max_buffer_size: usize,
    pub stream_queue_size: usize,
    pub queue_put_max_retries: u32,
    pub queue_put_backoff_ms: u64,
}

impl BridgeConfig {
    /// Total per-event wait budget before a stream fails as too slow.
    pub fn send_budget(&self) -> Duration {
        Duration::from_millis(self.queue_put_backoff_ms * u64::from(self.queue_put_max_retries))
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 1024 * 1024,
            stream_queue_size: 256,
            queue_put_max_retries: 10,
            queue_put_backoff_ms: 50,
        }
    }
}

/// Caller-facing generation limits.
#[derive(Debug, Clone)]
pub struct ModelLimitsConfig {
    pub default_context_length: usize,
    pub default_max_tokens: usize,
    pub max_generation_tokens: usize,
    pub max_temperature: f32,
    pub trusted_model_directories: Vec<PathBuf>,
}

impl Default for ModelLimitsConfig {
    fn default() -> Self {
        Self {
            default_context_length: 4096,
            default_max_tokens: 512,
            max_generation_tokens: 4096,
            max_temperature: 2.0,
            trusted_model_directories: Vec::new(),
        }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub bridge: BridgeConfig,
    pub limits: ModelLimitsConfig,
    pub scheduler: GpuSchedulerConfig,
    pub batcher: BatcherConfig,
    pub kv_pool: KvCachePoolConfig,
    pub shutdown_timeout: Duration,
    pub metrics_export: bool,
    pub metrics_port: u16,
    pub telemetry_sampling_rate: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeConfig::default(),
            limits: ModelLimitsConfig::default(),
            scheduler: GpuSchedulerConfig::default(),
            batcher: BatcherConfig::default(),
            kv_pool: KvCachePoolConfig::default(),
            shutdown_timeout: Duration::from_secs(5),
            metrics_export: false,
            metrics_port: 9090,
            telemetry_sampling_rate: 1.0,
        }
    }
}

/// Optional TOML file layer. Every field is optional; present values
/// replace defaults before the environment is applied.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    max_buffer_size: Option<usize>,
    stream_queue_size: Option<usize>,
    queue_put_max_retries: Option<u32>,
    queue_put_backoff_ms: Option<u64>,
    default_context_length: Option<usize>,
    default_max_tokens: Option<usize>,
    max_generation_tokens: Option<usize>,
    max_temperature: Option<f32>,
    trusted_model_directories: Option<Vec<PathBuf>>,
    gpu_scheduler: Option<bool>,
    scheduler_batch_size: Option<usize>,
    scheduler_window_ms: Option<f64>,
    p99_threshold_ms: Option<f64>,
    batch_max_requests: Option<usize>,
    batch_window_ms: Option<f64>,
    kv_pool_max_size: Option<usize>,
    kv_pool_ttl_secs: Option<u64>,
    kv_pool_max_memory_mb: Option<usize>,
    shutdown_timeout_secs: Option<u64>,
    telemetry_sampling_rate: Option<f64>,
}

fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_f64(key: &str, default: f64) -> f64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<f64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_f32(key: &str, default: f32) -> f32 {
    match std::env::var(key) {
        Ok(val) => val.parse::<f32>().unwrap_or(default),
        Err(_) => default,
    }
}

/// "on"/"off" style switch, tolerant of 1/0/true/false.
fn parse_switch(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_ascii_lowercase().as_str(), "on" | "true" | "1"),
        Err(_) => default,
    }
}

fn load_bridge_config(file: &FileConfig) -> BridgeConfig {
    let defaults = BridgeConfig::default();
    let max_buffer_size = parse_usize(
        "MX_SERVE_MAX_BUFFER_SIZE",
        file.max_buffer_size.unwrap_or(defaults.max_buffer_size),
    )
    .max(4096);
    let stream_queue_size = parse_usize(
        "MX_SERVE_STREAM_QUEUE_SIZE",
        file.stream_queue_size.unwrap_or(defaults.stream_queue_size),
    )
    .max(1);
    let queue_put_max_retries = parse_u32(
        "MX_SERVE_QUEUE_PUT_MAX_RETRIES",
        file.queue_put_max_retries.unwrap_or(defaults.queue_put_max_retries),
    )
    .max(1);
    let queue_put_backoff_ms = parse_u64(
        "MX_SERVE_QUEUE_PUT_BACKOFF_MS",
        file.queue_put_backoff_ms.unwrap_or(defaults.queue_put_backoff_ms),
    )
    .max(1);
    BridgeConfig {
        max_buffer_size,
        stream_queue_size,
        queue_put_max_retries,
        queue_put_backoff_ms,
    }
}

fn load_limits_config(file: &FileConfig) -> ModelLimitsConfig {
    let defaults = ModelLimitsConfig::default();
    let default_context_length = parse_usize(
        "MX_SERVE_DEFAULT_CONTEXT_LENGTH",
        file.default_context_length.unwrap_or(defaults.default_context_length),
    )
    .clamp(128, 1_000_000);
    let default_max_tokens = parse_usize(
        "MX_SERVE_DEFAULT_MAX_TOKENS",
        file.default_max_tokens.unwrap_or(defaults.default_max_tokens),
    )
    .max(1);
    let max_generation_tokens = parse_usize(
        "MX_SERVE_MAX_GENERATION_TOKENS",
        file.max_generation_tokens.unwrap_or(defaults.max_generation_tokens),
    )
    .max(1);
    let max_temperature = parse_f32(
        "MX_SERVE_MAX_TEMPERATURE",
        file.max_temperature.unwrap_or(defaults.max_temperature),
    )
    .clamp(0.1, 100.0);

    let trusted_model_directories = match std::env::var("MX_SERVE_TRUSTED_MODEL_DIRS") {
        Ok(dirs) => dirs.split(':').filter(|s| !s.is_empty()).map(PathBuf::from).collect(),
        Err(_) => file.trusted_model_directories.clone().unwrap_or_default(),
    };

    ModelLimitsConfig {
        default_context_length,
        default_max_tokens,
        max_generation_tokens: max_generation_tokens.max(default_max_tokens),
        max_temperature,
        trusted_model_directories,
    }
}

fn load_controller_config() -> ControllerConfig {
    let defaults = ControllerConfig::default();
    let min_batch_size =
        parse_usize("MX_SERVE_AUTO_TUNE_MIN_BATCH", defaults.min_batch_size).clamp(1, 8);
    let max_batch_size =
        parse_usize("MX_SERVE_AUTO_TUNE_MAX_BATCH", defaults.max_batch_size).clamp(1, 16);
    let ema_alpha =
        parse_f64("MX_SERVE_AUTO_TUNE_EMA_ALPHA", defaults.ema_alpha).clamp(0.1, 0.9);
    let adjustment_interval =
        parse_u64("MX_SERVE_AUTO_TUNE_INTERVAL", defaults.adjustment_interval).clamp(5, 20);
    let p99_target_ms =
        parse_f64("MX_SERVE_P99_THRESHOLD_MS", defaults.p99_target_ms).clamp(50.0, 500.0);
    ControllerConfig {
        min_batch_size,
        max_batch_size: max_batch_size.max(min_batch_size),
        ema_alpha,
        adjustment_interval,
        p99_target_ms,
        ..defaults
    }
}

fn load_scheduler_config(file: &FileConfig, shutdown_timeout: Duration) -> GpuSchedulerConfig {
    let defaults = GpuSchedulerConfig::default();
    let enabled = parse_switch("MX_SERVE_GPU_SCHEDULER", file.gpu_scheduler.unwrap_or(true));
    let max_batch_size = parse_usize(
        "MX_SERVE_SCHEDULER_BATCH_SIZE",
        file.scheduler_batch_size.unwrap_or(defaults.max_batch_size),
    )
    .clamp(1, 16);
    let batch_window_ms = parse_f64(
        "MX_SERVE_SCHEDULER_WINDOW_MS",
        file.scheduler_window_ms.unwrap_or(defaults.batch_window_ms),
    )
    .clamp(0.75, 5.0);
    let p99_threshold_ms = parse_f64(
        "MX_SERVE_P99_THRESHOLD_MS",
        file.p99_threshold_ms.unwrap_or(defaults.p99_threshold_ms),
    )
    .clamp(50.0, 500.0);

    GpuSchedulerConfig {
        enabled,
        batch_window_ms,
        max_batch_size,
        p99_threshold_ms,
        fast_path: parse_switch("MX_SERVE_FAST_PATH", true),
        adaptive_window: parse_switch("MX_SERVE_ADAPTIVE_WINDOW", false),
        adaptive_window_low_ms: parse_f64("MX_SERVE_ADAPTIVE_WINDOW_LOW_MS", 0.75).clamp(0.5, 1.5),
        adaptive_window_medium_ms: parse_f64("MX_SERVE_ADAPTIVE_WINDOW_MEDIUM_MS", 1.0)
            .clamp(0.75, 2.0),
        adaptive_window_high_ms: parse_f64("MX_SERVE_ADAPTIVE_WINDOW_HIGH_MS", 2.0).clamp(1.5, 5.0),
        auto_tune: parse_switch("MX_SERVE_AUTO_TUNE", false),
        controller: load_controller_config(),
        shutdown_timeout,
    }
}

fn load_batcher_config(file: &FileConfig, shutdown_timeout: Duration) -> BatcherConfig {
    let defaults = BatcherConfig::default();
    let max_batch_size = parse_usize(
        "MX_SERVE_BATCH_MAX_REQUESTS",
        file.batch_max_requests.unwrap_or(defaults.max_batch_size),
    )
    .clamp(1, 64);
    let batch_window_ms = parse_f64(
        "MX_SERVE_BATCH_WINDOW_MS",
        file.batch_window_ms.unwrap_or(defaults.batch_window_ms),
    )
    .clamp(0.0, 1000.0);

    BatcherConfig {
        max_batch_size,
        batch_window_ms,
        shutdown_timeout,
        memory: MemoryControllerConfig {
            max_batch_size,
            ..MemoryControllerConfig::default()
        },
        prompt_cache: PromptCacheConfig {
            max_size: parse_usize("MX_SERVE_PROMPT_CACHE_MAX_SIZE", 100).max(1),
            max_memory_bytes: parse_usize("MX_SERVE_PROMPT_CACHE_MAX_MEMORY_MB", 1024).max(1)
                * 1024
                * 1024,
        },
    }
}

fn load_kv_pool_config(file: &FileConfig) -> KvCachePoolConfig {
    let defaults = KvCachePoolConfig::default();
    let max_size = parse_usize(
        "MX_SERVE_KV_POOL_MAX_SIZE",
        file.kv_pool_max_size.unwrap_or(defaults.max_size),
    )
    .max(1);
    let ttl_secs = parse_u64(
        "MX_SERVE_KV_POOL_TTL_SECS",
        file.kv_pool_ttl_secs.unwrap_or(defaults.ttl.as_secs()),
    )
    .max(1);
    let max_memory_mb = parse_usize(
        "MX_SERVE_KV_POOL_MAX_MEMORY_MB",
        file.kv_pool_max_memory_mb
            .unwrap_or(defaults.max_memory_bytes / (1024 * 1024)),
    )
    .max(1);

    KvCachePoolConfig {
        max_size,
        ttl: Duration::from_secs(ttl_secs),
        enable_prefix_sharing: parse_switch("MX_SERVE_KV_POOL_PREFIX_SHARING", true),
        prefix_length_ratio: parse_f64("MX_SERVE_KV_POOL_PREFIX_RATIO", 0.6).clamp(0.1, 1.0),
        max_memory_bytes: max_memory_mb * 1024 * 1024,
    }
}

fn read_file_config(path: Option<&Path>) -> Result<FileConfig, ConfigError> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Load the full configuration: file layer (when given) under the
/// environment layer.
pub fn load(config_path: Option<&Path>) -> Result<RuntimeConfig, ConfigError> {
    let file = read_file_config(config_path)?;

    let shutdown_secs = parse_u64(
        "MX_SERVE_SHUTDOWN_TIMEOUT",
        file.shutdown_timeout_secs.unwrap_or(5),
    )
    .max(1);
    let shutdown_timeout = Duration::from_secs(shutdown_secs);

    Ok(RuntimeConfig {
        bridge: load_bridge_config(&file),
        limits: load_limits_config(&file),
        scheduler: load_scheduler_config(&file, shutdown_timeout),
        batcher: load_batcher_config(&file, shutdown_timeout),
        kv_pool: load_kv_pool_config(&file),
        shutdown_timeout,
        metrics_export: parse_switch("MX_SERVE_METRICS_EXPORT", false),
        metrics_port: parse_u32("MX_SERVE_METRICS_PORT", 9090).clamp(1024, 65535) as u16,
        telemetry_sampling_rate: parse_f64(
            "MX_SERVE_TELEMETRY_SAMPLING",
            file.telemetry_sampling_rate.unwrap_or(1.0),
        )
        .clamp(0.0, 1.0),
    })
}

/// Load from environment only.
pub fn load_from_env() -> RuntimeConfig {
    load(None).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "MX_SERVE_MAX_BUFFER_SIZE",
        "MX_SERVE_STREAM_QUEUE_SIZE",
        "MX_SERVE_QUEUE_PUT_MAX_RETRIES",
        "MX_SERVE_QUEUE_PUT_BACKOFF_MS",
        "MX_SERVE_DEFAULT_CONTEXT_LENGTH",
        "MX_SERVE_DEFAULT_MAX_TOKENS",
        "MX_SERVE_MAX_GENERATION_TOKENS",
        "MX_SERVE_MAX_TEMPERATURE",
        "MX_SERVE_TRUSTED_MODEL_DIRS",
        "MX_SERVE_GPU_SCHEDULER",
        "MX_SERVE_SCHEDULER_BATCH_SIZE",
        "MX_SERVE_SCHEDULER_WINDOW_MS",
        "MX_SERVE_P99_THRESHOLD_MS",
        "MX_SERVE_FAST_PATH",
        "MX_SERVE_ADAPTIVE_WINDOW",
        "MX_SERVE_AUTO_TUNE",
        "MX_SERVE_AUTO_TUNE_MIN_BATCH",
        "MX_SERVE_AUTO_TUNE_MAX_BATCH",
        "MX_SERVE_AUTO_TUNE_EMA_ALPHA",
        "MX_SERVE_AUTO_TUNE_INTERVAL",
        "MX_SERVE_METRICS_EXPORT",
        "MX_SERVE_METRICS_PORT",
        "MX_SERVE_BATCH_MAX_REQUESTS",
        "MX_SERVE_BATCH_WINDOW_MS",
        "MX_SERVE_KV_POOL_MAX_SIZE",
        "MX_SERVE_KV_POOL_TTL_SECS",
        "MX_SERVE_KV_POOL_MAX_MEMORY_MB",
        "MX_SERVE_SHUTDOWN_TIMEOUT",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();
        let config = load_from_env();
        assert_eq!(config.bridge.max_buffer_size, 1024 * 1024);
        assert_eq!(config.bridge.stream_queue_size, 256);
        assert_eq!(config.bridge.send_budget(), Duration::from_millis(500));
        assert_eq!(config.limits.max_generation_tokens, 4096);
        assert!(config.scheduler.enabled);
        assert_eq!(config.scheduler.max_batch_size, 4);
        assert!((config.scheduler.batch_window_ms - 1.0).abs() < 1e-9);
        assert!(!config.scheduler.auto_tune);
        assert!(config.scheduler.fast_path);
        assert_eq!(config.batcher.max_batch_size, 8);
        assert_eq!(config.kv_pool.max_size, 50);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_env_overrides_and_clamps() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("MX_SERVE_SCHEDULER_BATCH_SIZE", "64");
        std::env::set_var("MX_SERVE_SCHEDULER_WINDOW_MS", "0.1");
        std::env::set_var("MX_SERVE_P99_THRESHOLD_MS", "10000");
        std::env::set_var("MX_SERVE_GPU_SCHEDULER", "off");
        std::env::set_var("MX_SERVE_AUTO_TUNE", "on");

        let config = load_from_env();
        assert_eq!(config.scheduler.max_batch_size, 16);
        assert!((config.scheduler.batch_window_ms - 0.75).abs() < 1e-9);
        assert!((config.scheduler.p99_threshold_ms - 500.0).abs() < 1e-9);
        assert!(!config.scheduler.enabled);
        assert!(config.scheduler.auto_tune);
        clear_env();
    }

    #[test]
    fn test_invalid_env_falls_back() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("MX_SERVE_MAX_BUFFER_SIZE", "not_a_number");
        std::env::set_var("MX_SERVE_BATCH_MAX_REQUESTS", "banana");
        let config = load_from_env();
        assert_eq!(config.bridge.max_buffer_size, 1024 * 1024);
        assert_eq!(config.batcher.max_batch_size, 8);
        clear_env();
    }

    #[test]
    fn test_trusted_dirs_parsed_from_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("MX_SERVE_TRUSTED_MODEL_DIRS", "/models:/opt/weights");
        let config = load_from_env();
        assert_eq!(
            config.limits.trusted_model_directories,
            vec![PathBuf::from("/models"), PathBuf::from("/opt/weights")]
        );
        clear_env();
    }

    #[test]
    fn test_file_layer_under_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.toml");
        std::fs::write(
            &path,
            "scheduler_batch_size = 8\nbatch_max_requests = 16\nmax_buffer_size = 2097152\n",
        )
        .unwrap();

        // File value used when env is silent; env wins otherwise.
        std::env::set_var("MX_SERVE_BATCH_MAX_REQUESTS", "4");
        let config = load(Some(&path)).unwrap();
        assert_eq!(config.scheduler.max_batch_size, 8);
        assert_eq!(config.batcher.max_batch_size, 4);
        assert_eq!(config.bridge.max_buffer_size, 2 * 1024 * 1024);
        clear_env();
    }

    #[test]
    fn test_broken_file_fails_fast() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.toml");
        std::fs::write(&path, "scheduler_batch_size = [this is not toml").unwrap();
        assert!(matches!(load(Some(&path)), Err(ConfigError::Parse { .. })));

        std::fs::write(&path, "unknown_knob = 3\n").unwrap();
        assert!(matches!(load(Some(&path)), Err(ConfigError::Parse { .. })));
    }
}
