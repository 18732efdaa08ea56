//! Purpose: Run one `tools/call` end to end: timeout, classification, fallback, overflow.
//! Exports: `InvocationPipeline`, `PreparedCall`, `CallOutcome`, plus `classify` and `fallback`.
//! Role: Slow path behind the dispatcher; runs inside a spawned task per call.
//! Invariants: Handler failures always become classified error replies; they never escape.
//! Invariants: Fallbacks run only for fallback-eligible classes and at most once per call.
//! Invariants: At most `max_in_flight` handlers execute at once; extra calls wait for a permit.
//! Invariants: Only successful, non-fallback, non-overflowed results of pure tools are cacheable.
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::core::error::{Error, ErrorKind};
use crate::mcp::codec::JsonRpcError;
use crate::overflow::OverflowStore;
use crate::tools::{FallbackNote, ToolContext, ToolHandler, ToolOutput, ToolRegistry};

pub mod classify;
pub mod fallback;

use classify::{ErrorClass, FallbackAttempt, classify, tool_error};
use fallback::FallbackStrategy;

pub struct PreparedCall {
    tool: String,
    handler: Arc<dyn ToolHandler>,
    arguments: Map<String, Value>,
}

impl PreparedCall {
    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn is_pure(&self) -> bool {
        self.handler.is_pure()
    }

    /// Parameters as they participate in the cache key.
    pub fn cache_params(&self) -> Value {
        json!({ "name": self.tool, "arguments": self.arguments })
    }
}

#[derive(Debug)]
pub struct CallOutcome {
    pub result: Result<Value, JsonRpcError>,
    pub cacheable: bool,
    pub used_fallback: bool,
}

impl CallOutcome {
    fn failed(error: JsonRpcError) -> Self {
        Self {
            result: Err(error),
            cacheable: false,
            used_fallback: false,
        }
    }
}

pub struct InvocationPipeline {
    registry: Arc<ToolRegistry>,
    config: Arc<ServerConfig>,
    permits: Arc<Semaphore>,
}

impl InvocationPipeline {
    pub fn new(registry: Arc<ToolRegistry>, config: Arc<ServerConfig>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            registry,
            config,
            permits,
        }
    }

    /// Validate `tools/call` params and resolve the handler. Cheap; runs on the reader.
    pub fn prepare(&self, params: Option<&Value>) -> Result<PreparedCall, JsonRpcError> {
        let Some(Value::Object(params)) = params else {
            return Err(JsonRpcError::invalid_params(
                "tools/call params must be an object with `name` and `arguments`",
            ));
        };
        let name = match params.get("name") {
            Some(Value::String(name)) => name,
            _ => return Err(JsonRpcError::invalid_params("missing tool `name`")),
        };
        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(arguments)) => arguments.clone(),
            Some(_) => return Err(JsonRpcError::invalid_params("`arguments` must be an object")),
        };
        let handler = self.registry.get(name).ok_or_else(|| {
            JsonRpcError::invalid_params(format!(
                "unknown tool `{name}`; available: {}",
                self.registry.names().join(", ")
            ))
        })?;
        Ok(PreparedCall {
            tool: name.clone(),
            handler,
            arguments,
        })
    }

    pub async fn invoke(&self, call: PreparedCall) -> CallOutcome {
        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return CallOutcome::failed(JsonRpcError::internal_error(
                    "tool execution is shutting down",
                ));
            }
        };

        let ctx = match ToolContext::from_arguments(&call.tool, &call.arguments, &self.config) {
            Ok(ctx) => ctx,
            Err(err) => {
                return CallOutcome::failed(tool_error(
                    &err,
                    ErrorClass::InvalidParams,
                    &call.tool,
                    None,
                ));
            }
        };

        let primary = with_timeout(
            &call.tool,
            ctx.timeout,
            call.handler.invoke(&ctx, &call.arguments),
        )
        .await;
        let err = match primary {
            Ok(output) => return self.finish(&call, &ctx, output, false).await,
            Err(err) => err,
        };

        let class = classify(&err);
        debug!(tool = %call.tool, class = class.label(), error = %err.detail(), "tool failed");
        let strategy = class
            .is_fallback_eligible()
            .then(|| FallbackStrategy::for_tool(&call.tool))
            .flatten();
        let Some(strategy) = strategy else {
            return CallOutcome::failed(tool_error(&err, class, &call.tool, None));
        };

        warn!(
            tool = %call.tool,
            class = class.label(),
            strategy = strategy.name(),
            "primary tool path failed; running fallback"
        );
        let fallback_result = with_timeout(
            &call.tool,
            ctx.timeout,
            strategy.run(&ctx, &call.arguments),
        )
        .await;
        match fallback_result {
            Ok(mut output) => {
                output.fallback = Some(FallbackNote {
                    strategy: strategy.name(),
                    original_error: err.detail(),
                });
                self.finish(&call, &ctx, output, true).await
            }
            Err(fallback_err) => {
                warn!(
                    tool = %call.tool,
                    strategy = strategy.name(),
                    error = %fallback_err.detail(),
                    "fallback failed"
                );
                let attempt = FallbackAttempt {
                    strategy: strategy.name(),
                    error: fallback_err.detail(),
                };
                CallOutcome::failed(tool_error(&err, class, &call.tool, Some(&attempt)))
            }
        }
    }

    async fn finish(
        &self,
        call: &PreparedCall,
        ctx: &ToolContext,
        output: ToolOutput,
        used_fallback: bool,
    ) -> CallOutcome {
        let output = if call.handler.allows_overflow() {
            self.spill_if_oversized(&call.tool, ctx, output).await
        } else {
            output
        };
        let cacheable = call.handler.is_pure()
            && !output.is_error
            && !used_fallback
            && !output.is_overflowed();
        CallOutcome {
            result: Ok(output.into_result()),
            cacheable,
            used_fallback,
        }
    }

    async fn spill_if_oversized(
        &self,
        tool: &str,
        ctx: &ToolContext,
        mut output: ToolOutput,
    ) -> ToolOutput {
        let store = OverflowStore::new(&ctx.working_dir, self.config.overflow.clone());
        if !store.exceeds_threshold(&output.text) {
            return output;
        }
        let total_bytes = output.text.len();
        let text = std::mem::take(&mut output.text);
        let owner = tool.to_string();
        let written = tokio::task::spawn_blocking(move || {
            let result = store.write(&text, Some(owner.as_str()));
            (result, text)
        })
        .await;

        match written {
            Ok((Ok(first), _)) => {
                let next = first.next_cursor();
                output.metadata.insert("overflow".to_string(), json!(true));
                output
                    .metadata
                    .insert("fileId".to_string(), json!(first.file_id));
                output
                    .metadata
                    .insert("totalChunks".to_string(), json!(first.total_chunks));
                output
                    .metadata
                    .insert("totalBytes".to_string(), json!(first.total_bytes));
                output.metadata.insert("chunkIndex".to_string(), json!(0));
                output
                    .metadata
                    .insert("hasMoreChunks".to_string(), json!(first.has_more()));
                if let Some(next) = &next {
                    output
                        .metadata
                        .insert("nextChunkIndex".to_string(), json!(next.chunk_index));
                }
                output.text = first.content;
                output.next_chunk = next;
                output
            }
            Ok((Err(err), text)) => {
                warn!(tool, error = %err.detail(), "overflow store unavailable; truncating output");
                truncate_inline(
                    output,
                    text,
                    self.config.overflow.threshold_bytes,
                    total_bytes,
                    err.detail(),
                )
            }
            Err(join_err) => {
                warn!(tool, error = %join_err, "overflow task failed");
                let mut output = output;
                output.text = format!("[output of {total_bytes} bytes was lost]");
                output
                    .metadata
                    .insert("truncated".to_string(), json!(true));
                output
                    .metadata
                    .insert("overflowError".to_string(), json!(join_err.to_string()));
                output
            }
        }
    }
}

fn truncate_inline(
    mut output: ToolOutput,
    mut text: String,
    limit: usize,
    total_bytes: usize,
    reason: String,
) -> ToolOutput {
    let mut end = limit.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    output.text = text;
    output.metadata.insert("truncated".to_string(), json!(true));
    output
        .metadata
        .insert("totalBytes".to_string(), json!(total_bytes));
    output
        .metadata
        .insert("overflowError".to_string(), json!(reason));
    output
}

async fn with_timeout<F>(tool: &str, limit: Duration, future: F) -> Result<ToolOutput, Error>
where
    F: std::future::Future<Output = Result<ToolOutput, Error>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::new(ErrorKind::Timeout)
            .with_message(format!(
                "tool `{tool}` timed out after {} ms",
                limit.as_millis()
            ))
            .with_hint("Pass a larger `timeoutMs` or narrow the request.")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::codec::{
        INVALID_PARAMS_CODE, RESOURCE_NOT_FOUND_CODE, TIMEOUT_CODE, TOOL_FAILURE_CODE,
    };
    use crate::overflow::OverflowSettings;
    use crate::tools::HandlerFuture;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted handler standing in for a real tool.
    struct Scripted {
        name: &'static str,
        pure: bool,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    #[derive(Clone, Copy)]
    enum Behavior {
        Echo(usize),
        Fail(ErrorKind, &'static str),
        Sleep(u64),
    }

    impl Scripted {
        fn new(name: &'static str, pure: bool, behavior: Behavior) -> Self {
            Self {
                name,
                pure,
                behavior,
                calls: AtomicUsize::new(0),
            }
        }

        async fn run(&self) -> Result<ToolOutput, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Echo(len) => Ok(ToolOutput::text("x".repeat(len))),
                Behavior::Fail(kind, message) => Err(Error::new(kind).with_message(message)),
                Behavior::Sleep(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(ToolOutput::text("late"))
                }
            }
        }
    }

    impl ToolHandler for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        fn description(&self) -> &'static str {
            "scripted"
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }

        fn is_pure(&self) -> bool {
            self.pure
        }

        fn invoke<'a>(
            &'a self,
            _ctx: &'a ToolContext,
            _args: &'a Map<String, Value>,
        ) -> HandlerFuture<'a> {
            Box::pin(self.run())
        }
    }

    fn pipeline(handler: Scripted, config: ServerConfig) -> InvocationPipeline {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(handler)).expect("register");
        InvocationPipeline::new(Arc::new(registry), Arc::new(config))
    }

    fn params(name: &str, dir: &Path, extra: Value) -> Value {
        let mut arguments = Map::new();
        arguments.insert("workingDirectory".to_string(), json!(dir.to_str().expect("utf8")));
        if let Value::Object(extra) = extra {
            arguments.extend(extra);
        }
        json!({"name": name, "arguments": arguments})
    }

    #[test]
    fn prepare_rejects_unknown_tools_and_bad_shapes() {
        let pipeline = pipeline(
            Scripted::new("echo", true, Behavior::Echo(1)),
            ServerConfig::default(),
        );
        let err = pipeline
            .prepare(Some(&json!({"name": "nope"})))
            .err()
            .expect("unknown");
        assert_eq!(err.code, INVALID_PARAMS_CODE);
        assert!(err.message.contains("echo"));
        assert!(pipeline.prepare(None).is_err());
        assert!(
            pipeline
                .prepare(Some(&json!({"name": "echo", "arguments": [1]})))
                .is_err()
        );
        let call = pipeline.prepare(Some(&json!({"name": "echo"}))).expect("ok");
        assert!(call.is_pure());
        assert_eq!(
            call.cache_params(),
            json!({"name": "echo", "arguments": {}})
        );
    }

    #[tokio::test]
    async fn success_is_cacheable_for_pure_tools() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = pipeline(
            Scripted::new("echo", true, Behavior::Echo(3)),
            ServerConfig::default(),
        );
        let call = pipeline
            .prepare(Some(&params("echo", dir.path(), json!({}))))
            .expect("prepare");
        let outcome = pipeline.invoke(call).await;
        assert!(outcome.cacheable);
        assert!(!outcome.used_fallback);
        let result = outcome.result.expect("result");
        assert_eq!(result["content"][0]["text"], json!("xxx"));
    }

    #[tokio::test]
    async fn missing_working_directory_is_invalid_params() {
        let pipeline = pipeline(
            Scripted::new("echo", true, Behavior::Echo(3)),
            ServerConfig::default(),
        );
        let call = pipeline
            .prepare(Some(&json!({"name": "echo", "arguments": {}})))
            .expect("prepare");
        let error = pipeline.invoke(call).await.result.expect_err("error");
        assert_eq!(error.code, INVALID_PARAMS_CODE);
        assert!(error.message.contains("workingDirectory"));
    }

    #[tokio::test]
    async fn timeout_is_classified_and_has_no_fallback_for_unknown_tools() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = pipeline(
            Scripted::new("slow", false, Behavior::Sleep(5_000)),
            ServerConfig::default(),
        );
        let call = pipeline
            .prepare(Some(&params("slow", dir.path(), json!({"timeoutMs": 50}))))
            .expect("prepare");
        let started = std::time::Instant::now();
        let error = pipeline.invoke(call).await.result.expect_err("timeout");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(error.code, TIMEOUT_CODE);
        let data = error.data.expect("data");
        assert_eq!(data["errorClass"], json!("timeout"));
        assert_eq!(data["fallback"]["attempted"], json!(false));
    }

    #[tokio::test]
    async fn ineligible_failures_never_fall_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = pipeline(
            Scripted::new(
                "search_text",
                true,
                Behavior::Fail(ErrorKind::Permission, "permission denied"),
            ),
            ServerConfig::default(),
        );
        let call = pipeline
            .prepare(Some(&params("search_text", dir.path(), json!({"pattern": "x"}))))
            .expect("prepare");
        let outcome = pipeline.invoke(call).await;
        assert!(!outcome.used_fallback);
        let error = outcome.result.expect_err("error");
        assert_eq!(error.code, ErrorClass::PermissionDenied.code());
        assert!(error.data.expect("data").get("fallback").is_none());
    }

    #[tokio::test]
    async fn eligible_failure_uses_fallback_and_marks_result() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("notes.txt"), "alpha\nbeta\n").expect("write");
        let pipeline = pipeline(
            Scripted::new(
                "search_text",
                true,
                Behavior::Fail(ErrorKind::NotFound, "`rg` executable not found"),
            ),
            ServerConfig::default(),
        );
        let call = pipeline
            .prepare(Some(&params("search_text", dir.path(), json!({"pattern": "beta"}))))
            .expect("prepare");
        let outcome = pipeline.invoke(call).await;
        assert!(outcome.used_fallback);
        assert!(!outcome.cacheable);
        let result = outcome.result.expect("result");
        assert_eq!(result["content"][0]["text"], json!("notes.txt:2:beta"));
        assert_eq!(result["fallback"]["strategy"], json!("plain_text_scan"));
        assert_eq!(
            result["fallback"]["originalError"],
            json!("`rg` executable not found")
        );
    }

    #[tokio::test]
    async fn failed_fallback_is_folded_into_original_error() {
        let pipeline = pipeline(
            Scripted::new(
                "search_text",
                true,
                Behavior::Fail(ErrorKind::NotFound, "working directory does not exist"),
            ),
            ServerConfig::default(),
        );
        let missing = Path::new("/nonexistent/sgmcp-pipeline");
        let call = pipeline
            .prepare(Some(&params("search_text", missing, json!({"pattern": "x"}))))
            .expect("prepare");
        let error = pipeline.invoke(call).await.result.expect_err("error");
        assert_eq!(error.code, RESOURCE_NOT_FOUND_CODE);
        assert_eq!(error.message, "working directory does not exist");
        let data = error.data.expect("data");
        assert_eq!(data["fallback"]["attempted"], json!(true));
        assert_eq!(data["fallback"]["strategy"], json!("plain_text_scan"));
        assert!(
            data["fallback"]["error"]
                .as_str()
                .unwrap_or_default()
                .contains("does not exist")
        );
        assert!(
            data["suggestions"]
                .as_array()
                .expect("suggestions")
                .iter()
                .any(|s| s.as_str().unwrap_or_default().contains("Verify the path exists"))
        );
    }

    #[tokio::test]
    async fn unknown_failures_use_generic_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = pipeline(
            Scripted::new("echo", false, Behavior::Fail(ErrorKind::Io, "regex parse error")),
            ServerConfig::default(),
        );
        let call = pipeline
            .prepare(Some(&params("echo", dir.path(), json!({}))))
            .expect("prepare");
        let error = pipeline.invoke(call).await.result.expect_err("error");
        assert_eq!(error.code, TOOL_FAILURE_CODE);
    }

    #[tokio::test]
    async fn oversized_output_spills_to_overflow_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ServerConfig {
            overflow: OverflowSettings {
                threshold_bytes: 10,
                chunk_bytes: 8,
                ..OverflowSettings::default()
            },
            ..ServerConfig::default()
        };
        let pipeline = pipeline(Scripted::new("echo", true, Behavior::Echo(20)), config.clone());
        let call = pipeline
            .prepare(Some(&params("echo", dir.path(), json!({}))))
            .expect("prepare");
        let outcome = pipeline.invoke(call).await;
        assert!(!outcome.cacheable, "overflowed results are not cached");
        let result = outcome.result.expect("result");
        assert_eq!(result["content"][0]["text"], json!("xxxxxxxx"));
        assert_eq!(result["metadata"]["totalChunks"], json!(3));
        assert_eq!(result["metadata"]["hasMoreChunks"], json!(true));
        assert_eq!(result["metadata"]["nextChunkIndex"], json!(1));
        assert_eq!(result["nextChunk"]["chunkIndex"], json!(1));

        let file_id = result["metadata"]["fileId"].as_str().expect("file id");
        let store = OverflowStore::new(dir.path(), config.overflow.clone());
        let last = store.read_chunk(file_id, 2).expect("last");
        assert_eq!(last.content, "xxxx");
        assert!(!last.has_more());
    }

    #[test]
    fn inline_truncation_respects_char_boundaries() {
        let output = truncate_inline(
            ToolOutput::default(),
            "ééé".to_string(),
            3,
            6,
            "disk full".to_string(),
        );
        assert_eq!(output.text, "é");
        assert_eq!(output.metadata["overflowError"], json!("disk full"));
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_permits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ServerConfig {
            max_in_flight: 1,
            ..ServerConfig::default()
        };
        let pipeline = Arc::new(pipeline(
            Scripted::new("slow", false, Behavior::Sleep(150)),
            config,
        ));
        let started = std::time::Instant::now();
        let mut handles = Vec::new();
        for _ in 0..2 {
            let pipeline = Arc::clone(&pipeline);
            let call = pipeline
                .prepare(Some(&params("slow", dir.path(), json!({}))))
                .expect("prepare");
            handles.push(tokio::spawn(async move { pipeline.invoke(call).await }));
        }
        for handle in handles {
            assert!(handle.await.expect("join").result.is_ok());
        }
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
