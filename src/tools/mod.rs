//! Purpose: Tool handler trait, per-call context, output model, and the ordered registry.
//! Exports: `ToolHandler`, `HandlerFuture`, `ToolContext`, `ToolOutput`, `FallbackNote`,
//!          `ToolDescriptor`, `ToolRegistry`, argument helpers.
//! Role: Seam between the invocation pipeline and concrete tools (search, exec, overflow).
//! Invariants: Tool names are unique; registry order is registration order and never changes.
//! Invariants: Every call carries a `workingDirectory` argument.
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::config::ServerConfig;
use crate::core::error::{Error, ErrorKind};
use crate::overflow::ChunkCursor;

pub mod exec;
pub mod overflow_tool;
pub mod process;
pub mod scan;
pub mod search;
pub mod structural;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + 'a>>;

pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON Schema for `arguments`, as advertised by `tools/list`.
    fn input_schema(&self) -> Value;

    /// Pure tools have no side effects, so identical calls may be served from cache.
    fn is_pure(&self) -> bool {
        false
    }

    /// Whether oversized output may be moved to the overflow store.
    fn allows_overflow(&self) -> bool {
        true
    }

    fn invoke<'a>(&'a self, ctx: &'a ToolContext, args: &'a Map<String, Value>)
    -> HandlerFuture<'a>;
}

#[derive(Clone, Debug)]
pub struct ToolContext {
    pub tool: String,
    pub working_dir: PathBuf,
    pub timeout: Duration,
}

impl ToolContext {
    pub fn from_arguments(
        tool: &str,
        args: &Map<String, Value>,
        config: &ServerConfig,
    ) -> Result<Self, Error> {
        let working_dir = match args.get("workingDirectory") {
            Some(Value::String(dir)) if !dir.trim().is_empty() => PathBuf::from(dir),
            Some(_) => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("`workingDirectory` must be a non-empty string"));
            }
            None => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("missing required argument `workingDirectory`")
                    .with_hint("Pass the absolute path of the project to operate on."));
            }
        };
        let timeout = config.effective_timeout(optional_u64(args, "timeoutMs")?);
        Ok(Self {
            tool: tool.to_string(),
            working_dir,
            timeout,
        })
    }

    /// The working directory, or a missing-resource error if it is not a directory.
    pub fn existing_working_dir(&self) -> Result<&Path, Error> {
        if self.working_dir.is_dir() {
            return Ok(&self.working_dir);
        }
        Err(Error::new(ErrorKind::NotFound)
            .with_message(format!(
                "working directory `{}` does not exist",
                self.working_dir.display()
            ))
            .with_path(&self.working_dir)
            .with_hint("Verify the path exists and is spelled correctly."))
    }

    /// Resolve an optional user path against the working directory.
    pub fn resolve(&self, path: Option<&str>) -> PathBuf {
        match path {
            Some(path) if !path.is_empty() => self.working_dir.join(path),
            _ => self.working_dir.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackNote {
    pub strategy: &'static str,
    pub original_error: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
    pub metadata: Map<String, Value>,
    pub next_chunk: Option<ChunkCursor>,
    pub fallback: Option<FallbackNote>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_error_flag(mut self, is_error: bool) -> Self {
        self.is_error = is_error;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn is_overflowed(&self) -> bool {
        self.metadata.get("overflow") == Some(&Value::Bool(true))
            || self.metadata.contains_key("overflowError")
    }

    /// MCP `tools/call` result body.
    pub fn into_result(self) -> Value {
        let mut result = Map::new();
        result.insert(
            "content".to_string(),
            json!([{ "type": "text", "text": self.text }]),
        );
        result.insert("isError".to_string(), json!(self.is_error));
        if !self.metadata.is_empty() {
            result.insert("metadata".to_string(), Value::Object(self.metadata));
        }
        if let Some(cursor) = self.next_chunk {
            result.insert("nextChunk".to_string(), json!(cursor));
        }
        if let Some(note) = self.fallback {
            result.insert("fallback".to_string(), json!(note));
        }
        Value::Object(result)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn ToolHandler>>,
    index: HashMap<&'static str, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in tool set, in advertised order.
    pub fn standard(config: &ServerConfig) -> Result<Self, Error> {
        let mut registry = Self::new();
        registry.register(Arc::new(search::SearchTextTool::new(&config.rg_binary)))?;
        registry.register(Arc::new(structural::StructuralSearchTool::new(
            &config.sg_binary,
        )))?;
        registry.register(Arc::new(exec::RunCommandTool::new(&config.shell_binary)))?;
        registry.register(Arc::new(overflow_tool::RetrieveOverflowTool::new(
            config.overflow.clone(),
        )))?;
        Ok(registry)
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) -> Result<(), Error> {
        let name = handler.name();
        if self.index.contains_key(name) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("tool `{name}` is registered twice")));
        }
        self.index.insert(name, self.tools.len());
        self.tools.push(handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.index.get(name).map(|idx| Arc::clone(&self.tools[*idx]))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|tool| tool.name()).collect()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .map(|tool| ToolDescriptor {
                name: tool.name(),
                description: tool.description(),
                input_schema: tool.input_schema(),
            })
            .collect()
    }

    /// `tools/list` result body.
    pub fn list_result(&self) -> Value {
        json!({ "tools": self.descriptors() })
    }
}

/// Schema fragment shared by every tool.
pub(crate) fn base_properties() -> Map<String, Value> {
    let mut props = Map::new();
    props.insert(
        "workingDirectory".to_string(),
        json!({
            "type": "string",
            "description": "Absolute path of the directory the tool operates in."
        }),
    );
    props.insert(
        "timeoutMs".to_string(),
        json!({
            "type": "integer",
            "minimum": 1,
            "description": "Per-call timeout override in milliseconds (capped by the server)."
        }),
    );
    props
}

pub(crate) fn object_schema(mut props: Map<String, Value>, extra: Value, required: &[&str]) -> Value {
    if let Value::Object(extra) = extra {
        props.extend(extra);
    }
    let mut required_fields = vec![json!("workingDirectory")];
    required_fields.extend(required.iter().map(|name| json!(name)));
    json!({
        "type": "object",
        "properties": props,
        "required": required_fields,
    })
}

pub(crate) fn required_str<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, Error> {
    match args.get(key) {
        Some(Value::String(value)) if !value.is_empty() => Ok(value),
        Some(Value::String(_)) => Err(Error::new(ErrorKind::Usage)
            .with_message(format!("argument `{key}` must not be empty"))),
        Some(_) => Err(Error::new(ErrorKind::Usage)
            .with_message(format!("argument `{key}` must be a string"))),
        None => Err(Error::new(ErrorKind::Usage)
            .with_message(format!("missing required argument `{key}`"))),
    }
}

pub(crate) fn optional_str<'a>(
    args: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a str>, Error> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(_) => Err(Error::new(ErrorKind::Usage)
            .with_message(format!("argument `{key}` must be a string"))),
    }
}

pub(crate) fn optional_bool(args: &Map<String, Value>, key: &str) -> Result<Option<bool>, Error> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(value)) => Ok(Some(*value)),
        Some(_) => Err(Error::new(ErrorKind::Usage)
            .with_message(format!("argument `{key}` must be a boolean"))),
    }
}

pub(crate) fn optional_u64(args: &Map<String, Value>, key: &str) -> Result<Option<u64>, Error> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("argument `{key}` must be a non-negative integer"))
        }),
    }
}

pub(crate) fn optional_f64(args: &Map<String, Value>, key: &str) -> Result<Option<f64>, Error> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(Some)
            .ok_or_else(|| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("argument `{key}` must be a non-negative number"))
            }),
    }
}

/// Keep at most `max` lines; reports whether anything was dropped.
pub(crate) fn cap_lines(lines: Vec<String>, max: usize) -> (Vec<String>, bool) {
    if lines.len() <= max {
        return (lines, false);
    }
    let mut lines = lines;
    lines.truncate(max);
    (lines, true)
}

pub(crate) const DEFAULT_MAX_RESULTS: u64 = 2_000;

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl ToolHandler for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn description(&self) -> &'static str {
            "Echo the message argument."
        }

        fn input_schema(&self) -> Value {
            object_schema(base_properties(), json!({"message": {"type": "string"}}), &["message"])
        }

        fn invoke<'a>(
            &'a self,
            _ctx: &'a ToolContext,
            args: &'a Map<String, Value>,
        ) -> HandlerFuture<'a> {
            Box::pin(async move { required_str(args, "message").map(ToolOutput::text) })
        }
    }

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("object expected"),
        }
    }

    #[test]
    fn registry_rejects_duplicates_and_keeps_order() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo)).expect("first");
        let err = registry.register(Arc::new(Echo)).expect_err("dup");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(registry.len(), 1);

        let standard = ToolRegistry::standard(&ServerConfig::default()).expect("standard");
        assert_eq!(
            standard.names(),
            vec![
                "search_text",
                "structural_search",
                "run_command",
                "retrieve_overflow"
            ]
        );
        let listed = standard.list_result();
        for tool in listed["tools"].as_array().expect("tools") {
            let required = tool["inputSchema"]["required"].as_array().expect("required");
            assert!(required.contains(&json!("workingDirectory")));
        }
    }

    #[test]
    fn context_requires_working_directory() {
        let config = ServerConfig::default();
        let err = ToolContext::from_arguments("echo", &args(json!({"message": "hi"})), &config)
            .expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::Usage);

        let ctx = ToolContext::from_arguments(
            "echo",
            &args(json!({"workingDirectory": "/nonexistent/sgmcp", "timeoutMs": 1500})),
            &config,
        )
        .expect("ctx");
        assert_eq!(ctx.timeout, Duration::from_millis(1500));
        let err = ctx.existing_working_dir().expect_err("missing dir");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.hint().unwrap_or_default().contains("Verify the path exists"));
    }

    #[tokio::test]
    async fn handler_invocation_and_result_shape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let arguments = args(json!({
            "workingDirectory": dir.path().to_str().expect("utf8"),
            "message": "hello"
        }));
        let ctx = ToolContext::from_arguments("echo", &arguments, &ServerConfig::default())
            .expect("ctx");
        let output = Echo.invoke(&ctx, &arguments).await.expect("invoke");
        let result = output.with_metadata("n", json!(1)).into_result();
        assert_eq!(result["content"][0]["text"], json!("hello"));
        assert_eq!(result["isError"], json!(false));
        assert_eq!(result["metadata"]["n"], json!(1));
        assert!(result.get("nextChunk").is_none());
    }

    #[test]
    fn cap_lines_reports_truncation() {
        let lines: Vec<String> = (0..5).map(|i| i.to_string()).collect();
        let (kept, truncated) = cap_lines(lines.clone(), 3);
        assert_eq!(kept.len(), 3);
        assert!(truncated);
        let (kept, truncated) = cap_lines(lines, 10);
        assert_eq!(kept.len(), 5);
        assert!(!truncated);
    }
}
