//! Purpose: `search_text` tool backed by ripgrep.
//! Exports: `SearchTextTool`, `SearchArgs`.
//! Role: Pure, cacheable text search; degraded by the plain-text-scan fallback.
//! Invariants: rg exit code 1 means "no matches" and is a successful empty result.
use serde_json::{Map, Value, json};

use super::process::run_process;
use super::{
    DEFAULT_MAX_RESULTS, HandlerFuture, ToolContext, ToolHandler, ToolOutput, base_properties,
    cap_lines, object_schema, optional_bool, optional_str, optional_u64, required_str,
};
use crate::core::error::{Error, ErrorKind};

pub const NO_MATCHES: &str = "No matches found.";

pub struct SearchTextTool {
    binary: String,
}

/// Arguments shared by the tool and its fallback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchArgs {
    pub pattern: String,
    pub path: Option<String>,
    pub case_sensitive: bool,
    pub fixed_strings: bool,
    pub max_results: usize,
}

impl SearchArgs {
    pub fn parse(args: &Map<String, Value>) -> Result<Self, Error> {
        Ok(Self {
            pattern: required_str(args, "pattern")?.to_string(),
            path: optional_str(args, "path")?.map(ToString::to_string),
            case_sensitive: optional_bool(args, "caseSensitive")?.unwrap_or(true),
            fixed_strings: optional_bool(args, "fixedStrings")?.unwrap_or(false),
            max_results: max_results(args)?,
        })
    }
}

pub(crate) fn max_results(args: &Map<String, Value>) -> Result<usize, Error> {
    let value = optional_u64(args, "maxResults")?.unwrap_or(DEFAULT_MAX_RESULTS);
    if value == 0 {
        return Err(Error::new(ErrorKind::Usage).with_message("`maxResults` must be at least 1"));
    }
    Ok(usize::try_from(value).unwrap_or(usize::MAX))
}

impl SearchTextTool {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    async fn run(&self, ctx: &ToolContext, args: &Map<String, Value>) -> Result<ToolOutput, Error> {
        let search = SearchArgs::parse(args)?;
        let cwd = ctx.existing_working_dir()?;

        let mut argv: Vec<String> = vec![
            "--line-number".into(),
            "--no-heading".into(),
            "--with-filename".into(),
            "--color".into(),
            "never".into(),
            "--sort".into(),
            "path".into(),
        ];
        if !search.case_sensitive {
            argv.push("--ignore-case".into());
        }
        if search.fixed_strings {
            argv.push("--fixed-strings".into());
        }
        argv.push("-e".into());
        argv.push(search.pattern.clone());
        argv.push("--".into());
        argv.push(search.path.clone().unwrap_or_else(|| ".".to_string()));

        let output = run_process(&self.binary, &argv, cwd).await?;
        match output.code {
            Some(0) => {}
            Some(1) if output.stderr.trim().is_empty() => {
                return Ok(ToolOutput::text(NO_MATCHES).with_metadata("matches", json!(0)));
            }
            code => {
                return Err(Error::new(ErrorKind::Io).with_message(format!(
                    "rg exited with {}: {}",
                    code.map_or_else(|| "a signal".to_string(), |c| format!("status {c}")),
                    output.stderr.trim()
                )));
            }
        }

        let lines: Vec<String> = output
            .stdout
            .lines()
            .map(|line| line.strip_prefix("./").unwrap_or(line).to_string())
            .collect();
        let (lines, truncated) = cap_lines(lines, search.max_results);
        Ok(ToolOutput::text(lines.join("\n"))
            .with_metadata("matches", json!(lines.len()))
            .with_metadata("truncated", json!(truncated)))
    }
}

impl ToolHandler for SearchTextTool {
    fn name(&self) -> &'static str {
        "search_text"
    }

    fn description(&self) -> &'static str {
        "Search file contents with ripgrep. Returns `path:line:text` lines."
    }

    fn input_schema(&self) -> Value {
        object_schema(
            base_properties(),
            json!({
                "pattern": {"type": "string", "description": "Regular expression (or literal with fixedStrings)."},
                "path": {"type": "string", "description": "File or directory relative to workingDirectory."},
                "caseSensitive": {"type": "boolean", "default": true},
                "fixedStrings": {"type": "boolean", "default": false},
                "maxResults": {"type": "integer", "minimum": 1, "default": DEFAULT_MAX_RESULTS}
            }),
            &["pattern"],
        )
    }

    fn is_pure(&self) -> bool {
        true
    }

    fn invoke<'a>(
        &'a self,
        ctx: &'a ToolContext,
        args: &'a Map<String, Value>,
    ) -> HandlerFuture<'a> {
        Box::pin(self.run(ctx, args))
    }
}
