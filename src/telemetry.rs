//! Purpose: Process-wide request metrics and the count-driven cache TTL self-tuner.
//! Exports: `PerformanceMetrics`, `MetricsSnapshot`, `SelfTuner`, `TuneDecision`.
//! Role: Mutated only by the dispatcher; consulted every `interval` requests to retune the cache.
//! Invariants: Each observed request is recorded exactly once.
//! Invariants: Tuning is triggered by request count, never by wall-clock time.
//! Notes: Metrics live in memory only and reset with the process.
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::info;

use crate::cache::ResponseCache;
use crate::config::TuningConfig;

#[derive(Debug)]
pub struct PerformanceMetrics {
    request_count: u64,
    total_latency: Duration,
    peak_latency: Duration,
    cache_hits: u64,
    cache_lookups: u64,
    fallback_count: u64,
    error_count: u64,
    tool_usage: BTreeMap<String, u64>,
    last_tune: Option<SystemTime>,
    // Rolling window consulted by the tuner; cleared after each tune.
    window: VecDeque<Duration>,
    window_capacity: usize,
    window_hits: u64,
    window_lookups: u64,
    since_tune: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub request_count: u64,
    pub average_latency_ms: f64,
    pub peak_latency_ms: f64,
    pub cache_hits: u64,
    pub cache_lookups: u64,
    pub hit_rate: f64,
    pub fallback_count: u64,
    pub error_count: u64,
    pub tool_usage: BTreeMap<String, u64>,
    pub last_tune: Option<String>,
}

/// One observed request, as reported by the dispatcher.
#[derive(Clone, Debug, Default)]
pub struct Observation<'a> {
    pub latency: Duration,
    /// `Some(hit)` when the request consulted the cache.
    pub cache_lookup: Option<bool>,
    pub tool: Option<&'a str>,
    pub is_error: bool,
    pub used_fallback: bool,
}

impl PerformanceMetrics {
    pub fn new(window_capacity: usize) -> Self {
        Self {
            request_count: 0,
            total_latency: Duration::ZERO,
            peak_latency: Duration::ZERO,
            cache_hits: 0,
            cache_lookups: 0,
            fallback_count: 0,
            error_count: 0,
            tool_usage: BTreeMap::new(),
            last_tune: None,
            window: VecDeque::with_capacity(window_capacity.max(1)),
            window_capacity: window_capacity.max(1),
            window_hits: 0,
            window_lookups: 0,
            since_tune: 0,
        }
    }

    pub fn record(&mut self, observation: Observation<'_>) {
        self.request_count += 1;
        self.since_tune += 1;
        self.total_latency += observation.latency;
        self.peak_latency = self.peak_latency.max(observation.latency);
        if self.window.len() == self.window_capacity {
            self.window.pop_front();
        }
        self.window.push_back(observation.latency);

        if let Some(hit) = observation.cache_lookup {
            self.cache_lookups += 1;
            self.window_lookups += 1;
            if hit {
                self.cache_hits += 1;
                self.window_hits += 1;
            }
        }
        if let Some(tool) = observation.tool {
            *self.tool_usage.entry(tool.to_string()).or_insert(0) += 1;
        }
        if observation.is_error {
            self.error_count += 1;
        }
        if observation.used_fallback {
            self.fallback_count += 1;
        }
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits
    }

    pub fn requests_since_tune(&self) -> u64 {
        self.since_tune
    }

    pub fn tool_usage(&self, tool: &str) -> u64 {
        self.tool_usage.get(tool).copied().unwrap_or(0)
    }

    pub fn average_latency(&self) -> Duration {
        average(self.total_latency, self.request_count)
    }

    pub fn window_average_latency(&self) -> Duration {
        let total: Duration = self.window.iter().sum();
        average(total, self.window.len() as u64)
    }

    /// Hit rate over the current tuning window, or `None` if nothing consulted the cache.
    pub fn window_hit_rate(&self) -> Option<f64> {
        (self.window_lookups > 0).then(|| self.window_hits as f64 / self.window_lookups as f64)
    }

    fn mark_tuned(&mut self) {
        self.last_tune = Some(SystemTime::now());
        self.since_tune = 0;
        self.window_hits = 0;
        self.window_lookups = 0;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            request_count: self.request_count,
            average_latency_ms: millis(self.average_latency()),
            peak_latency_ms: millis(self.peak_latency),
            cache_hits: self.cache_hits,
            cache_lookups: self.cache_lookups,
            hit_rate: if self.cache_lookups == 0 {
                0.0
            } else {
                self.cache_hits as f64 / self.cache_lookups as f64
            },
            fallback_count: self.fallback_count,
            error_count: self.error_count,
            tool_usage: self.tool_usage.clone(),
            last_tune: self.last_tune.and_then(format_system_time),
        }
    }
}

fn average(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / u128::from(count);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn format_system_time(at: SystemTime) -> Option<String> {
    use time::format_description::well_known::Rfc3339;
    time::OffsetDateTime::from(at).format(&Rfc3339).ok()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TuneDecision {
    Grow,
    Shrink,
    Hold,
}

#[derive(Clone, Debug)]
pub struct SelfTuner {
    config: TuningConfig,
}

impl SelfTuner {
    pub fn new(config: TuningConfig) -> Self {
        Self { config }
    }

    pub fn window(&self) -> usize {
        self.config.window
    }

    pub fn is_due(&self, metrics: &PerformanceMetrics) -> bool {
        metrics.requests_since_tune() >= self.config.interval
    }

    pub fn evaluate(&self, average_latency: Duration, hit_rate: Option<f64>) -> TuneDecision {
        let Some(hit_rate) = hit_rate else {
            return TuneDecision::Hold;
        };
        if average_latency > self.config.high_latency && hit_rate < self.config.low_hit_rate {
            TuneDecision::Grow
        } else if average_latency < self.config.low_latency && hit_rate > self.config.high_hit_rate
        {
            TuneDecision::Shrink
        } else {
            TuneDecision::Hold
        }
    }

    /// Apply one tuning step if due; returns the decision taken.
    pub fn maybe_tune(
        &self,
        metrics: &mut PerformanceMetrics,
        cache: &mut ResponseCache,
    ) -> Option<TuneDecision> {
        if !self.is_due(metrics) {
            return None;
        }
        let latency = metrics.window_average_latency();
        let hit_rate = metrics.window_hit_rate();
        let decision = self.evaluate(latency, hit_rate);
        let previous = cache.ttl();
        let ttl = match decision {
            TuneDecision::Grow => cache.set_ttl(previous.mul_f64(self.config.grow_factor)),
            TuneDecision::Shrink => cache.set_ttl(previous.mul_f64(self.config.shrink_factor)),
            TuneDecision::Hold => previous,
        };
        let pruned = cache.prune_expired();
        metrics.mark_tuned();

        let snapshot = metrics.snapshot();
        info!(
            decision = ?decision,
            window_latency_ms = millis(latency),
            window_hit_rate = hit_rate.unwrap_or(0.0),
            previous_ttl_secs = previous.as_secs_f64(),
            ttl_secs = ttl.as_secs_f64(),
            pruned,
            requests = snapshot.request_count,
            average_latency_ms = snapshot.average_latency_ms,
            peak_latency_ms = snapshot.peak_latency_ms,
            hit_rate = snapshot.hit_rate,
            tool_usage = ?snapshot.tool_usage,
            "cache self-tune"
        );
        Some(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn observe(metrics: &mut PerformanceMetrics, ms: u64, hit: Option<bool>) {
        metrics.record(Observation {
            latency: Duration::from_millis(ms),
            cache_lookup: hit,
            tool: Some("search_text"),
            ..Observation::default()
        });
    }

    #[test]
    fn records_counts_latency_and_usage() {
        let mut metrics = PerformanceMetrics::new(10);
        observe(&mut metrics, 10, Some(false));
        observe(&mut metrics, 30, Some(true));
        metrics.record(Observation {
            latency: Duration::from_millis(5),
            ..Observation::default()
        });
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.request_count, 3);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_lookups, 2);
        assert!((snapshot.hit_rate - 0.5).abs() < f64::EPSILON);
        assert!((snapshot.peak_latency_ms - 30.0).abs() < 1e-9);
        assert_eq!(metrics.average_latency(), Duration::from_millis(15));
        assert_eq!(metrics.tool_usage("search_text"), 2);
    }

    #[test]
    fn window_is_bounded() {
        let mut metrics = PerformanceMetrics::new(2);
        observe(&mut metrics, 1000, None);
        observe(&mut metrics, 10, None);
        observe(&mut metrics, 30, None);
        assert_eq!(metrics.window_average_latency(), Duration::from_millis(20));
    }

    #[test]
    fn decisions_follow_thresholds() {
        let tuner = SelfTuner::new(TuningConfig::default());
        assert_eq!(
            tuner.evaluate(Duration::from_millis(900), Some(0.1)),
            TuneDecision::Grow
        );
        assert_eq!(
            tuner.evaluate(Duration::from_millis(5), Some(0.9)),
            TuneDecision::Shrink
        );
        assert_eq!(
            tuner.evaluate(Duration::from_millis(200), Some(0.5)),
            TuneDecision::Hold
        );
        assert_eq!(tuner.evaluate(Duration::from_millis(900), None), TuneDecision::Hold);
    }

    #[test]
    fn tunes_only_every_interval_and_clamps() {
        let config = TuningConfig {
            interval: 3,
            ..TuningConfig::default()
        };
        let tuner = SelfTuner::new(config);
        let mut metrics = PerformanceMetrics::new(tuner.window());
        let mut cache = ResponseCache::new(&CacheConfig::default());

        observe(&mut metrics, 1, Some(true));
        observe(&mut metrics, 1, Some(true));
        assert_eq!(tuner.maybe_tune(&mut metrics, &mut cache), None);
        observe(&mut metrics, 1, Some(true));
        assert_eq!(
            tuner.maybe_tune(&mut metrics, &mut cache),
            Some(TuneDecision::Shrink)
        );
        assert_eq!(cache.ttl(), Duration::from_millis(22_500));
        assert_eq!(metrics.requests_since_tune(), 0);
        assert!(metrics.snapshot().last_tune.is_some());

        for _ in 0..20 {
            for _ in 0..3 {
                observe(&mut metrics, 1, Some(true));
            }
            tuner.maybe_tune(&mut metrics, &mut cache);
        }
        assert_eq!(cache.ttl(), Duration::from_secs(5));
    }
}
