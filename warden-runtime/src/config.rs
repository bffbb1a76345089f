//! Runtime Configuration
//!
//! Every policy constant the runtime uses (allocation limit, stress
//! thresholds, rest duration, cache geometry, health thresholds) lives in
//! one of the sections of [`RuntimeConfig`]. Configuration can be set
//! programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `WARDEN_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `WARDEN_MAX_ALLOCATION` | Largest single allocation in bytes | 1073741824 (1GiB) |
//! | `WARDEN_NUM_WORKERS` | Number of worker threads | CPU count |
//! | `WARDEN_STRESS_THRESHOLD` | Pool-wide stress threshold | 0.6 |
//! | `WARDEN_MAX_CONSECUTIVE_TASKS` | Tasks before a mandatory break | 50 |
//! | `WARDEN_MAX_WORK_SECS` | Continuous work before a mandatory break | 7200 |
//! | `WARDEN_REST_MS` | Length of a wellness break | 900000 (15min) |
//! | `WARDEN_RECLAIMER` | Run the background reclaimer ("true"/"false") | true |
//! | `WARDEN_RECLAIM_INTERVAL_MS` | Reclaimer tick interval | 100 |
//! | `WARDEN_GRACE_PERIOD_SECS` | Idle time before a block may be reclaimed | 300 |
//! | `WARDEN_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! A variable that is set but unparsable or out of range is logged as a
//! [`ConfigError::EnvParse`] warning and the default is kept.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use warden_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::builder()
//!     .num_workers(4)
//!     .rest_duration(Duration::from_millis(50))
//!     .build()
//!     .unwrap();
//! assert_eq!(config.pool.num_workers, 4);
//! ```

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to the directive string understood by `EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Guarded allocator configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Largest single allocation in bytes (default 1GiB).
    pub max_allocation: usize,
    /// Alignment when the caller does not ask for more (default 16).
    pub default_alignment: usize,
    /// Alignment for cache/SIMD allocations (default 64).
    pub cache_alignment: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_allocation: 1024 * 1024 * 1024, // 1 GiB
            default_alignment: 16,
            cache_alignment: 64,
        }
    }
}

/// Worker pool and wellness policy configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads (default: available CPUs).
    pub num_workers: usize,
    /// Dispatcher prefers workers strictly below this stress (default 0.6).
    pub stress_threshold: f32,
    /// Stress at or above which a worker must rest (default 0.8).
    pub break_stress: f32,
    /// Consecutive completed tasks that force a rest (default 50).
    pub max_consecutive_tasks: u32,
    /// Uninterrupted working time that forces a rest (default 2h).
    pub max_work_duration: Duration,
    /// How long a worker rests (default 15min).
    pub rest_duration: Duration,
    /// Completions this soon after a rest raise stress; later ones relieve
    /// it (default 1min).
    pub rapid_window: Duration,
    /// Stress added per task completed inside `rapid_window` (default 0.1).
    pub stress_increment: f32,
    /// Stress removed per task completed outside `rapid_window` (default 0.05).
    pub stress_relief: f32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            stress_threshold: 0.6,
            break_stress: 0.8,
            max_consecutive_tasks: 50,
            max_work_duration: Duration::from_secs(2 * 60 * 60),
            rest_duration: Duration::from_secs(15 * 60),
            rapid_window: Duration::from_secs(60),
            stress_increment: 0.1,
            stress_relief: 0.05,
        }
    }
}

/// Background reclaimer configuration.
#[derive(Debug, Clone)]
pub struct ReclaimerConfig {
    /// Start the reclaimer thread with the runtime (default true).
    pub enabled: bool,
    /// Tick interval (default 100ms).
    pub interval: Duration,
    /// Reclamation only runs while system load is below this (default 0.7).
    pub load_threshold: f32,
    /// Blocks reclaimed per cycle (default 10).
    pub budget_per_cycle: usize,
    /// Live bytes above which the per-cycle budget doubles (default 100MiB).
    pub aggressive_threshold: usize,
    /// Idle time since last access before a block is eligible (default 5min).
    pub grace_period: Duration,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_millis(100),
            load_threshold: 0.7,
            budget_per_cycle: 10,
            aggressive_threshold: 100 * 1024 * 1024, // 100 MiB
            grace_period: Duration::from_secs(5 * 60),
        }
    }
}

/// Cache geometry used by the numeric kernels.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache line size in bytes; alignment of runtime-built
    /// [`AlignedVec`](crate::cache::AlignedVec)s (default 64).
    pub line_size: usize,
    /// Tile edge for blocked matrix multiply, in elements (default 64).
    pub block_size: usize,
    /// Chunk length for blocked reductions, in elements (default 1024).
    pub reduce_chunk: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            line_size: 64,
            block_size: 64,
            reduce_chunk: 1024,
        }
    }
}

/// Thresholds for performance suggestions and health recommendations.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Live bytes above which memory usage is flagged (default 500MiB).
    pub memory_warning_bytes: usize,
    /// Mean pool stress above which the pool is flagged (default 0.7).
    pub stress_warning: f32,
    /// Cache misses above which data layout is flagged (default 1000).
    pub cache_miss_warning: u64,
    /// Branch mispredictions above which branching is flagged (default 500).
    pub branch_miss_warning: u64,
    /// SIMD utilization below which vectorization is suggested (default 0.3).
    pub simd_utilization_floor: f64,
    /// Minimum vector op count before utilization is judged (default 100).
    pub simd_min_ops: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            memory_warning_bytes: 500 * 1024 * 1024, // 500 MiB
            stress_warning: 0.7,
            cache_miss_warning: 1000,
            branch_miss_warning: 500,
            simd_utilization_floor: 0.3,
            simd_min_ops: 100,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level used when `RUST_LOG` is not set (default Info).
    pub level: LogLevel,
    /// Include the emitting thread's name (default true).
    pub thread_names: bool,
    /// Include source location (default: debug builds only).
    pub source_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            thread_names: true,
            source_location: cfg!(debug_assertions),
        }
    }
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for the stock policy, or
/// `RuntimeConfig::from_env()` to load overrides from environment variables.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Allocator configuration.
    pub memory: MemoryConfig,
    /// Worker pool configuration.
    pub pool: PoolConfig,
    /// Reclaimer configuration.
    pub reclaimer: ReclaimerConfig,
    /// Cache geometry.
    pub cache: CacheConfig,
    /// Report and health thresholds.
    pub health: HealthConfig,
    /// Logging configuration.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults, as do values that fail to parse
    /// or fall outside their valid range (those are logged).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        let positive = |s: &str| number::<usize>(s).filter(|&n| n > 0);
        let fraction = |s: &str| number::<f32>(s).filter(|v| (0.0..=1.0).contains(v));

        if let Some(bytes) = env_override("WARDEN_MAX_ALLOCATION", positive) {
            config.memory.max_allocation = bytes;
        }

        let pool = &mut config.pool;
        if let Some(n) = env_override("WARDEN_NUM_WORKERS", positive) {
            pool.num_workers = n;
        }
        if let Some(threshold) = env_override("WARDEN_STRESS_THRESHOLD", fraction) {
            pool.stress_threshold = threshold;
        }
        if let Some(n) = env_override("WARDEN_MAX_CONSECUTIVE_TASKS", |s| {
            number::<u32>(s).filter(|&n| n > 0)
        }) {
            pool.max_consecutive_tasks = n;
        }
        if let Some(secs) = env_override("WARDEN_MAX_WORK_SECS", positive) {
            pool.max_work_duration = Duration::from_secs(secs as u64);
        }
        if let Some(ms) = env_override("WARDEN_REST_MS", number::<u64>) {
            pool.rest_duration = Duration::from_millis(ms);
        }

        let reclaimer = &mut config.reclaimer;
        if let Some(enabled) = env_override("WARDEN_RECLAIMER", flag) {
            reclaimer.enabled = enabled;
        }
        if let Some(ms) = env_override("WARDEN_RECLAIM_INTERVAL_MS", positive) {
            reclaimer.interval = Duration::from_millis(ms as u64);
        }
        if let Some(secs) = env_override("WARDEN_GRACE_PERIOD_SECS", number::<u64>) {
            reclaimer.grace_period = Duration::from_secs(secs);
        }

        if let Some(level) = env_override("WARDEN_LOG_LEVEL", LogLevel::parse) {
            config.log.level = level;
        }

        config
    }

    /// Validate the configuration and return the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fraction = |v: f32| (0.0..=1.0).contains(&v);

        // Memory
        if self.memory.max_allocation == 0 {
            return Err(invalid("memory.max_allocation", "must be at least 1 byte"));
        }
        if !self.memory.default_alignment.is_power_of_two() {
            return Err(invalid("memory.default_alignment", "must be a power of two"));
        }
        if !self.memory.cache_alignment.is_power_of_two() || self.memory.cache_alignment < 64 {
            return Err(invalid(
                "memory.cache_alignment",
                "must be a power of two of at least 64 bytes",
            ));
        }

        // Pool
        if self.pool.num_workers == 0 {
            return Err(invalid("pool.num_workers", "must be at least 1"));
        }
        if !fraction(self.pool.stress_threshold) {
            return Err(invalid("pool.stress_threshold", "must be within [0, 1]"));
        }
        if !fraction(self.pool.break_stress) {
            return Err(invalid("pool.break_stress", "must be within [0, 1]"));
        }
        if self.pool.max_consecutive_tasks == 0 {
            return Err(invalid("pool.max_consecutive_tasks", "must be at least 1"));
        }
        if !fraction(self.pool.stress_increment) || !fraction(self.pool.stress_relief) {
            return Err(invalid(
                "pool.stress_increment",
                "stress adjustments must be within [0, 1]",
            ));
        }

        // Reclaimer
        if self.reclaimer.interval.is_zero() {
            return Err(invalid("reclaimer.interval", "must be non-zero"));
        }
        if self.reclaimer.budget_per_cycle == 0 {
            return Err(invalid("reclaimer.budget_per_cycle", "must be at least 1"));
        }

        // Cache
        if !self.cache.line_size.is_power_of_two() {
            return Err(invalid("cache.line_size", "must be a power of two"));
        }
        if self.cache.block_size == 0 {
            return Err(invalid("cache.block_size", "must be at least 1"));
        }
        if self.cache.reduce_chunk == 0 {
            return Err(invalid("cache.reduce_chunk", "must be at least 1"));
        }

        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        message: message.into(),
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParse {
        /// Variable name.
        var: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the largest single allocation in bytes.
    pub fn max_allocation(mut self, bytes: usize) -> Self {
        self.config.memory.max_allocation = bytes;
        self
    }

    /// Set the number of worker threads.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.pool.num_workers = n;
        self
    }

    /// Set the pool-wide stress threshold.
    pub fn stress_threshold(mut self, threshold: f32) -> Self {
        self.config.pool.stress_threshold = threshold;
        self
    }

    /// Set how many consecutive tasks force a break.
    pub fn max_consecutive_tasks(mut self, n: u32) -> Self {
        self.config.pool.max_consecutive_tasks = n;
        self
    }

    /// Set the uninterrupted working time that forces a break.
    pub fn max_work_duration(mut self, duration: Duration) -> Self {
        self.config.pool.max_work_duration = duration;
        self
    }

    /// Set the length of a wellness break.
    pub fn rest_duration(mut self, duration: Duration) -> Self {
        self.config.pool.rest_duration = duration;
        self
    }

    /// Set the per-task stress increment and relief.
    pub fn stress_steps(mut self, increment: f32, relief: f32) -> Self {
        self.config.pool.stress_increment = increment;
        self.config.pool.stress_relief = relief;
        self
    }

    /// Enable or disable the background reclaimer.
    pub fn reclaimer(mut self, enabled: bool) -> Self {
        self.config.reclaimer.enabled = enabled;
        self
    }

    /// Set the reclaimer tick interval.
    pub fn reclaim_interval(mut self, interval: Duration) -> Self {
        self.config.reclaimer.interval = interval;
        self
    }

    /// Set the idle time before a block may be reclaimed.
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.config.reclaimer.grace_period = grace;
        self
    }

    /// Set the cache line size used for runtime-built aligned vectors.
    pub fn cache_line_size(mut self, bytes: usize) -> Self {
        self.config.cache.line_size = bytes;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Read `var` through `parse`. Unset is `Ok(None)`; set but rejected by
/// `parse` is [`ConfigError::EnvParse`].
fn parse_env<T>(
    var: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Result<Option<T>, ConfigError> {
    let Ok(raw) = env::var(var) else {
        return Ok(None);
    };
    match parse(raw.trim()) {
        Some(value) => Ok(Some(value)),
        None => Err(ConfigError::EnvParse {
            var: var.to_string(),
            message: format!("unparsable or out of range value {raw:?}"),
        }),
    }
}

/// [`parse_env`], logging and dropping a bad value so the default stands.
fn env_override<T>(var: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    parse_env(var, parse).unwrap_or_else(|err| {
        warn!(%err, "ignoring environment override");
        None
    })
}

fn number<T: FromStr>(s: &str) -> Option<T> {
    s.parse().ok()
}

fn flag(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Get the number of available CPUs.
pub(crate) fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.memory.max_allocation, 1 << 30);
        assert!(config.pool.num_workers >= 1);
        assert_eq!(config.pool.stress_threshold, 0.6);
        assert_eq!(config.pool.max_consecutive_tasks, 50);
        assert_eq!(config.pool.max_work_duration, Duration::from_secs(7200));
        assert_eq!(config.pool.rest_duration, Duration::from_secs(900));
        assert_eq!(config.reclaimer.interval, Duration::from_millis(100));
        assert_eq!(config.cache.line_size, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .num_workers(4)
            .rest_duration(Duration::from_millis(5))
            .max_consecutive_tasks(3)
            .cache_line_size(128)
            .log_level(LogLevel::Debug)
            .build()
            .unwrap();

        assert_eq!(config.pool.num_workers, 4);
        assert_eq!(config.pool.rest_duration, Duration::from_millis(5));
        assert_eq!(config.pool.max_consecutive_tasks, 3);
        assert_eq!(config.cache.line_size, 128);
        assert_eq!(config.log.level, LogLevel::Debug);
    }

    #[test]
    fn test_builder_validation() {
        assert!(RuntimeConfig::builder().num_workers(0).build().is_err());
        assert!(RuntimeConfig::builder().stress_threshold(1.5).build().is_err());
        assert!(RuntimeConfig::builder().max_allocation(0).build().is_err());
        assert!(RuntimeConfig::builder().cache_line_size(96).build().is_err());

        let mut config = RuntimeConfig::default();
        config.cache.block_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_build_unchecked_skips_validation() {
        let config = RuntimeConfig::builder().num_workers(0).build_unchecked();
        assert_eq!(config.pool.num_workers, 0);
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("off"), Some(LogLevel::Off));
        assert_eq!(LogLevel::parse("ERROR"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("INFO"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("TRACE"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("invalid"), None);
    }

    #[test]
    fn test_config_error_display() {
        let err = invalid("pool.num_workers", "must be positive");
        assert!(err.to_string().contains("pool.num_workers"));
        assert!(err.to_string().contains("must be positive"));
    }

    #[test]
    fn test_env_parse_errors() {
        // Variable names private to this test keep it independent of others.
        assert_eq!(parse_env("WARDEN_TEST_UNSET_KNOB", number::<usize>), Ok(None));

        env::set_var("WARDEN_TEST_GOOD_KNOB", " 12 ");
        assert_eq!(parse_env("WARDEN_TEST_GOOD_KNOB", number::<usize>), Ok(Some(12)));

        env::set_var("WARDEN_TEST_BAD_KNOB", "twelve");
        let err = parse_env("WARDEN_TEST_BAD_KNOB", number::<usize>).unwrap_err();
        assert!(
            matches!(err, ConfigError::EnvParse { ref var, .. } if var == "WARDEN_TEST_BAD_KNOB")
        );
        assert!(err.to_string().contains("twelve"));
        assert_eq!(env_override("WARDEN_TEST_BAD_KNOB", number::<usize>), None);

        env::set_var("WARDEN_TEST_FLAG_KNOB", "maybe");
        assert!(parse_env("WARDEN_TEST_FLAG_KNOB", flag).is_err());
    }

    #[test]
    fn test_from_env_without_overrides_is_valid() {
        let config = RuntimeConfig::from_env();
        assert!(config.pool.num_workers >= 1);
        assert!(config.validate().is_ok());
    }
}
