//! Purpose: Route decoded JSON-RPC messages to the handshake, the cache, or the tool pipeline.
//! Exports: `McpDispatcher`, `DispatchOutcome`, `PendingCall`.
//! Role: Owns the handshake, response cache, and metrics; the stdio loop only moves bytes.
//! Invariants: `dispatch` runs on the reader in arrival order; only tool execution is deferred.
//! Invariants: Every request with an id yields exactly one response; notifications yield none.
//! Invariants: The handshake gate runs before method or tool-name validation.
//! Invariants: Metrics are recorded here and only here, once per request.
//! Notes: Lock order is metrics, then cache. Poisoned locks are recovered, never propagated.
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::codec::{JsonRpcError, JsonRpcId, JsonRpcRequest, JsonRpcResponse};
use super::handshake::{Handshake, HandshakeState, ServerMetadata};
use crate::cache::{ResponseCache, cache_key};
use crate::config::ServerConfig;
use crate::pipeline::classify::annotate;
use crate::pipeline::{InvocationPipeline, PreparedCall};
use crate::telemetry::{MetricsSnapshot, Observation, PerformanceMetrics, SelfTuner};
use crate::tools::ToolRegistry;

#[derive(Debug)]
pub enum DispatchOutcome {
    Response(JsonRpcResponse),
    NoResponse,
    /// A tool call that must run off the reader; finish it with `McpDispatcher::execute`.
    Deferred(PendingCall),
}

pub struct PendingCall {
    id: JsonRpcId,
    call: PreparedCall,
    cache_key: Option<String>,
    started: Instant,
}

impl PendingCall {
    pub fn id(&self) -> &JsonRpcId {
        &self.id
    }

    pub fn tool(&self) -> &str {
        self.call.tool()
    }

    pub fn started(&self) -> Instant {
        self.started
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("tool", &self.call.tool())
            .field("cached", &self.cache_key.is_some())
            .finish()
    }
}

pub struct McpDispatcher {
    metadata: ServerMetadata,
    handshake: Mutex<Handshake>,
    cache: Mutex<ResponseCache>,
    metrics: Mutex<PerformanceMetrics>,
    tuner: SelfTuner,
    registry: Arc<ToolRegistry>,
    pipeline: InvocationPipeline,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
    pub cache_ttl_secs: f64,
    pub cache_entries: usize,
    pub cache_evictions: u64,
}

impl McpDispatcher {
    pub fn new(config: Arc<ServerConfig>, registry: Arc<ToolRegistry>) -> Self {
        Self::with_metadata(config, registry, ServerMetadata::default())
    }

    pub fn with_metadata(
        config: Arc<ServerConfig>,
        registry: Arc<ToolRegistry>,
        metadata: ServerMetadata,
    ) -> Self {
        let tuner = SelfTuner::new(config.tuning.clone());
        Self {
            metadata,
            handshake: Mutex::new(Handshake::new()),
            cache: Mutex::new(ResponseCache::new(&config.cache)),
            metrics: Mutex::new(PerformanceMetrics::new(tuner.window())),
            tuner,
            pipeline: InvocationPipeline::new(Arc::clone(&registry), Arc::clone(&config)),
            registry,
        }
    }

    pub fn metadata(&self) -> &ServerMetadata {
        &self.metadata
    }

    pub fn handshake_state(&self) -> HandshakeState {
        lock(&self.handshake).state()
    }

    pub fn stats(&self) -> ServerStats {
        let metrics = lock(&self.metrics).snapshot();
        let cache = lock(&self.cache);
        ServerStats {
            metrics,
            cache_ttl_secs: cache.ttl().as_secs_f64(),
            cache_entries: cache.len(),
            cache_evictions: cache.evictions(),
        }
    }

    pub fn dispatch(&self, request: JsonRpcRequest) -> DispatchOutcome {
        let started = Instant::now();
        let Some(id) = request.id.clone() else {
            self.notify(&request);
            return DispatchOutcome::NoResponse;
        };
        debug!(id = %id, method = %request.method, "request");

        if let Err(error) = lock(&self.handshake).check(&request.method) {
            return self.reply(id, Err(error), started);
        }

        match request.method.as_str() {
            "initialize" => {
                if let Err(error) = ensure_object_or_absent(request.params.as_ref()) {
                    return self.reply(id, Err(error), started);
                }
                let mut handshake = lock(&self.handshake);
                handshake.begin(request.params.as_ref());
                let client = handshake.client().map(|c| format!("{} {}", c.name, c.version));
                drop(handshake);
                info!(client = client.as_deref().unwrap_or("unknown"), "initialize");
                let result = serde_json::to_value(self.metadata.initialize_result())
                    .map_err(|err| JsonRpcError::internal_error(err.to_string()));
                self.reply(id, result, started)
            }
            "ping" => self.reply(id, Ok(json!({})), started),
            "tools/list" => self.list_tools(id, request.params.as_ref(), started),
            "tools/call" => self.route_call(id, request.params.as_ref(), started),
            other => {
                let error = JsonRpcError::method_not_found(format!("method not found: {other}"));
                self.reply(id, Err(error), started)
            }
        }
    }

    /// Malformed frames that still carry an id are answered and counted like any request.
    pub fn reject(&self, id: JsonRpcId, error: JsonRpcError) -> JsonRpcResponse {
        self.respond(id, Err(error), Instant::now(), Observation::default())
    }

    /// Run a deferred tool call to completion and build its reply.
    pub async fn execute(&self, pending: PendingCall) -> JsonRpcResponse {
        let PendingCall {
            id,
            call,
            cache_key,
            started,
        } = pending;
        let tool = call.tool().to_string();
        let outcome = self.pipeline.invoke(call).await;

        if outcome.cacheable {
            if let (Some(key), Ok(result)) = (cache_key.as_ref(), outcome.result.as_ref()) {
                lock(&self.cache).insert(key.clone(), result.clone());
            }
        }
        let observation = Observation {
            tool: Some(&tool),
            cache_lookup: cache_key.as_ref().map(|_| false),
            used_fallback: outcome.used_fallback,
            ..Observation::default()
        };
        self.respond(id, outcome.result, started, observation)
    }

    /// Reply for a deferred call whose task died before producing one.
    pub fn abandoned(&self, id: JsonRpcId, tool: &str, started: Instant) -> JsonRpcResponse {
        warn!(id = %id, tool, "tool task panicked");
        let error = JsonRpcError::internal_error(format!("tool `{tool}` crashed while running"));
        let observation = Observation {
            tool: Some(tool),
            ..Observation::default()
        };
        self.respond(id, Err(error), started, observation)
    }

    pub fn log_summary(&self, reason: &str) {
        let stats = self.stats();
        info!(
            reason,
            requests = stats.metrics.request_count,
            average_latency_ms = stats.metrics.average_latency_ms,
            peak_latency_ms = stats.metrics.peak_latency_ms,
            hit_rate = stats.metrics.hit_rate,
            fallbacks = stats.metrics.fallback_count,
            errors = stats.metrics.error_count,
            tool_usage = ?stats.metrics.tool_usage,
            ttl_secs = stats.cache_ttl_secs,
            cache_entries = stats.cache_entries,
            "server metrics"
        );
    }

    fn notify(&self, request: &JsonRpcRequest) {
        match request.method.as_str() {
            "notifications/initialized" | "initialized" => {
                if lock(&self.handshake).complete() {
                    info!("client initialized");
                } else {
                    debug!("ignoring initialized notification outside the handshake");
                }
            }
            "notifications/cancelled" => {
                debug!(params = ?request.params, "cancellation is not supported; ignoring");
            }
            other => debug!(method = other, "ignoring notification"),
        }
    }

    fn list_tools(&self, id: JsonRpcId, params: Option<&Value>, started: Instant) -> DispatchOutcome {
        if let Err(error) = ensure_object_or_absent(params) {
            return self.reply(id, Err(error), started);
        }
        let key = cache_key("tools/list", params);
        let cached = lock(&self.cache).get(&key);
        let hit = cached.is_some();
        let result = match cached {
            Some(result) => result,
            None => {
                let result = self.registry.list_result();
                lock(&self.cache).insert(key, result.clone());
                result
            }
        };
        let observation = Observation {
            cache_lookup: Some(hit),
            ..Observation::default()
        };
        DispatchOutcome::Response(self.respond(id, Ok(result), started, observation))
    }

    fn route_call(&self, id: JsonRpcId, params: Option<&Value>, started: Instant) -> DispatchOutcome {
        let call = match self.pipeline.prepare(params) {
            Ok(call) => call,
            Err(error) => return self.reply(id, Err(error), started),
        };
        if !call.is_pure() {
            return DispatchOutcome::Deferred(PendingCall {
                id,
                call,
                cache_key: None,
                started,
            });
        }

        let key = cache_key("tools/call", Some(&call.cache_params()));
        let cached = lock(&self.cache).get(&key);
        if let Some(result) = cached {
            debug!(tool = call.tool(), "cache hit");
            let tool = call.tool().to_string();
            let observation = Observation {
                tool: Some(&tool),
                cache_lookup: Some(true),
                ..Observation::default()
            };
            return DispatchOutcome::Response(self.respond(id, Ok(result), started, observation));
        }
        DispatchOutcome::Deferred(PendingCall {
            id,
            call,
            cache_key: Some(key),
            started,
        })
    }

    fn reply(
        &self,
        id: JsonRpcId,
        result: Result<Value, JsonRpcError>,
        started: Instant,
    ) -> DispatchOutcome {
        DispatchOutcome::Response(self.respond(id, result, started, Observation::default()))
    }

    fn respond(
        &self,
        id: JsonRpcId,
        result: Result<Value, JsonRpcError>,
        started: Instant,
        observation: Observation<'_>,
    ) -> JsonRpcResponse {
        let tool = observation.tool;
        let is_error = result.is_err()
            || result
                .as_ref()
                .is_ok_and(|value| value.get("isError") == Some(&Value::Bool(true)));
        self.observe(Observation {
            latency: started.elapsed(),
            is_error,
            ..observation
        });
        match result {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => {
                debug!(id = %id, code = error.code, message = %error.message, "error reply");
                JsonRpcResponse::error(id, annotate(error, tool))
            }
        }
    }

    fn observe(&self, observation: Observation<'_>) {
        let mut metrics = lock(&self.metrics);
        metrics.record(observation);
        if self.tuner.is_due(&metrics) {
            let mut cache = lock(&self.cache);
            self.tuner.maybe_tune(&mut metrics, &mut cache);
        }
    }
}

fn ensure_object_or_absent(params: Option<&Value>) -> Result<(), JsonRpcError> {
    match params {
        None | Some(Value::Object(_)) | Some(Value::Null) => Ok(()),
        Some(_) => Err(JsonRpcError::invalid_params("params must be an object")),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
