//! Purpose: Server configuration with documented defaults and validation.
//! Exports: `ServerConfig`, `CacheConfig`, `TuningConfig`, `OverflowSettings` re-export.
//! Role: Built once by the CLI, then shared read-only by every component.
//! Invariants: `validate` runs before the server starts; invalid values are `ErrorKind::Usage`.
use std::time::Duration;

use crate::core::error::{Error, ErrorKind};
pub use crate::overflow::OverflowSettings;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Default per-call timeout when the call does not pass `timeoutMs`.
    pub tool_timeout: Duration,
    /// Upper bound for any `timeoutMs` override.
    pub max_tool_timeout: Duration,
    pub max_in_flight: usize,
    pub max_frame_bytes: usize,
    pub cache: CacheConfig,
    pub tuning: TuningConfig,
    pub overflow: OverflowSettings,
    pub rg_binary: String,
    pub sg_binary: String,
    pub shell_binary: String,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub capacity: usize,
    pub initial_ttl: Duration,
    pub min_ttl: Duration,
    pub max_ttl: Duration,
}

#[derive(Clone, Debug)]
pub struct TuningConfig {
    /// Retune after this many observed requests.
    pub interval: u64,
    pub high_latency: Duration,
    pub low_latency: Duration,
    pub low_hit_rate: f64,
    pub high_hit_rate: f64,
    pub grow_factor: f64,
    pub shrink_factor: f64,
    /// Number of recent latencies the rolling average covers.
    pub window: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tool_timeout: Duration::from_secs(30),
            max_tool_timeout: Duration::from_secs(300),
            max_in_flight: 8,
            max_frame_bytes: crate::mcp::framer::DEFAULT_MAX_FRAME_BYTES,
            cache: CacheConfig::default(),
            tuning: TuningConfig::default(),
            overflow: OverflowSettings::default(),
            rg_binary: "rg".to_string(),
            sg_binary: "ast-grep".to_string(),
            shell_binary: "sh".to_string(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            initial_ttl: Duration::from_secs(30),
            min_ttl: Duration::from_secs(5),
            max_ttl: Duration::from_secs(300),
        }
    }
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            interval: 50,
            high_latency: Duration::from_millis(500),
            low_latency: Duration::from_millis(50),
            low_hit_rate: 0.3,
            high_hit_rate: 0.7,
            grow_factor: 1.5,
            shrink_factor: 0.75,
            window: 100,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.tool_timeout.is_zero() {
            return Err(usage(
                "--tool-timeout-ms must be greater than zero",
                "Use a positive value like 30000.",
            ));
        }
        if self.max_tool_timeout < self.tool_timeout {
            return Err(usage(
                "--max-tool-timeout-ms must be at least --tool-timeout-ms",
                "Raise --max-tool-timeout-ms or lower --tool-timeout-ms.",
            ));
        }
        if self.max_in_flight == 0 {
            return Err(usage(
                "--max-in-flight must be greater than zero",
                "Use a positive value like 8.",
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(usage(
                "--max-frame-bytes must be greater than zero",
                "Use a positive value like 8388608.",
            ));
        }
        if self.cache.capacity == 0 {
            return Err(usage(
                "--cache-capacity must be greater than zero",
                "Use a positive value like 256.",
            ));
        }
        if self.cache.min_ttl.is_zero() || self.cache.min_ttl > self.cache.max_ttl {
            return Err(usage(
                "cache TTL bounds are inconsistent",
                "Keep 0 < --cache-min-ttl-secs <= --cache-max-ttl-secs.",
            ));
        }
        if self.cache.initial_ttl < self.cache.min_ttl || self.cache.initial_ttl > self.cache.max_ttl
        {
            return Err(usage(
                "--cache-ttl-secs must lie between the min and max TTL",
                "Pick an initial TTL inside [--cache-min-ttl-secs, --cache-max-ttl-secs].",
            ));
        }
        if self.tuning.interval == 0 || self.tuning.window == 0 {
            return Err(usage(
                "--tune-interval must be greater than zero",
                "Use a positive value like 50.",
            ));
        }
        if self.tuning.low_latency >= self.tuning.high_latency {
            return Err(usage(
                "latency thresholds are inconsistent",
                "Keep --tune-low-latency-ms below --tune-high-latency-ms.",
            ));
        }
        if self.overflow.chunk_bytes == 0 {
            return Err(usage(
                "--overflow-chunk-bytes must be greater than zero",
                "Use a positive value like 50000.",
            ));
        }
        if self.overflow.chunk_bytes > self.overflow.threshold_bytes {
            return Err(usage(
                "--overflow-chunk-bytes must not exceed --overflow-threshold-bytes",
                "Lower the chunk size or raise the threshold.",
            ));
        }
        if self.overflow.dir_name.is_empty()
            || self.overflow.dir_name.contains(['/', '\\'])
            || self.overflow.dir_name == ".."
            || self.overflow.dir_name == "."
        {
            return Err(usage(
                "--overflow-dir must be a single directory name",
                "Use a plain name like .sgmcp-overflow.",
            ));
        }
        for (flag, value) in [
            ("--rg-binary", &self.rg_binary),
            ("--sg-binary", &self.sg_binary),
            ("--shell", &self.shell_binary),
        ] {
            if value.trim().is_empty() {
                return Err(usage(
                    &format!("{flag} must not be empty"),
                    "Pass a program name on PATH or an absolute path.",
                ));
            }
        }
        Ok(())
    }

    /// Resolve a per-call timeout override, clamped to the configured maximum.
    pub fn effective_timeout(&self, requested_ms: Option<u64>) -> Duration {
        match requested_ms {
            Some(0) | None => self.tool_timeout,
            Some(ms) => Duration::from_millis(ms).min(self.max_tool_timeout),
        }
    }
}

fn usage(message: &str, hint: &str) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message(message)
        .with_hint(hint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tool_timeout, Duration::from_secs(30));
        assert_eq!(config.cache.capacity, 256);
        assert_eq!(config.overflow.threshold_bytes, 100_000);
        assert_eq!(config.overflow.chunk_bytes, 50_000);
        assert_eq!(config.sg_binary, "ast-grep");
    }

    #[test]
    fn inverted_ttl_bounds_are_rejected() {
        let mut config = ServerConfig::default();
        config.cache.min_ttl = Duration::from_secs(600);
        let err = config.validate().expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(err.hint().is_some());
    }

    #[test]
    fn chunk_larger_than_threshold_is_rejected() {
        let mut config = ServerConfig::default();
        config.overflow.chunk_bytes = config.overflow.threshold_bytes + 1;
        assert!(config.validate().is_err());
        config.overflow.chunk_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn overflow_dir_must_be_one_component() {
        let mut config = ServerConfig::default();
        config.overflow.dir_name = "../escape".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn timeout_override_is_capped() {
        let config = ServerConfig::default();
        assert_eq!(config.effective_timeout(None), Duration::from_secs(30));
        assert_eq!(config.effective_timeout(Some(0)), Duration::from_secs(30));
        assert_eq!(config.effective_timeout(Some(250)), Duration::from_millis(250));
        assert_eq!(
            config.effective_timeout(Some(3_600_000)),
            Duration::from_secs(300)
        );
    }
}
