//! Purpose: `structural_search` tool backed by ast-grep (`ast-grep run --json=compact`).
//! Exports: `StructuralSearchTool`, `StructuralArgs`, `parse_matches`, `literal_fragment`.
//! Role: Pure, cacheable syntax-aware search; degraded by the literal-pattern-scan fallback.
//! Invariants: Results are `path:line:text` with 1-based lines, sorted by path then line.
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::process::run_process;
use super::search::max_results;
use super::{
    DEFAULT_MAX_RESULTS, HandlerFuture, ToolContext, ToolHandler, ToolOutput, base_properties,
    cap_lines, object_schema, optional_str, required_str,
};
use crate::core::error::{Error, ErrorKind};
use crate::tools::search::NO_MATCHES;

pub struct StructuralSearchTool {
    binary: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StructuralArgs {
    pub pattern: String,
    pub language: Option<String>,
    pub path: Option<String>,
    pub max_results: usize,
}

impl StructuralArgs {
    pub fn parse(args: &Map<String, Value>) -> Result<Self, Error> {
        Ok(Self {
            pattern: required_str(args, "pattern")?.to_string(),
            language: optional_str(args, "language")?.map(ToString::to_string),
            path: optional_str(args, "path")?.map(ToString::to_string),
            max_results: max_results(args)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SgMatch {
    file: String,
    range: SgRange,
    #[serde(default)]
    lines: Option<String>,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct SgRange {
    start: SgPosition,
}

#[derive(Debug, Deserialize)]
struct SgPosition {
    line: u64,
}

/// Turn ast-grep's JSON array into sorted `path:line:text` lines.
pub fn parse_matches(stdout: &str) -> Result<Vec<String>, Error> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let matches: Vec<SgMatch> = serde_json::from_str(trimmed).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("unexpected output from sg")
            .with_source(err)
    })?;
    let mut rows: Vec<(String, u64, String)> = matches
        .into_iter()
        .map(|m| {
            let source = m.lines.unwrap_or(m.text);
            let first = source.lines().next().unwrap_or_default().to_string();
            let file = m.file.strip_prefix("./").unwrap_or(&m.file).to_string();
            (file, m.range.start.line + 1, first)
        })
        .collect();
    rows.sort();
    Ok(rows
        .into_iter()
        .map(|(file, line, text)| format!("{file}:{line}:{text}"))
        .collect())
}

/// Longest literal run of a pattern once `$VAR` / `$$$VARS` metavariables are removed.
pub fn literal_fragment(pattern: &str) -> Option<String> {
    let mut fragments = Vec::new();
    let mut current = String::new();
    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '$' {
            while chars.peek() == Some(&'$') {
                chars.next();
            }
            while chars
                .peek()
                .is_some_and(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '_')
            {
                chars.next();
            }
            fragments.push(std::mem::take(&mut current));
            continue;
        }
        current.push(ch);
    }
    fragments.push(current);
    fragments
        .into_iter()
        .map(|fragment| fragment.trim().to_string())
        .filter(|fragment| !fragment.is_empty())
        .max_by_key(|fragment| fragment.len())
}

impl StructuralSearchTool {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    async fn run(&self, ctx: &ToolContext, args: &Map<String, Value>) -> Result<ToolOutput, Error> {
        let search = StructuralArgs::parse(args)?;
        let cwd = ctx.existing_working_dir()?;

        let mut argv: Vec<String> = vec![
            "run".into(),
            "--pattern".into(),
            search.pattern.clone(),
            "--json=compact".into(),
        ];
        if let Some(language) = &search.language {
            argv.push("--lang".into());
            argv.push(language.clone());
        }
        argv.push(search.path.clone().unwrap_or_else(|| ".".to_string()));

        let output = run_process(&self.binary, &argv, cwd).await?;
        let lines = match parse_matches(&output.stdout) {
            Ok(lines) if output.success() || output.stderr.trim().is_empty() => lines,
            _ => {
                return Err(Error::new(ErrorKind::Io).with_message(format!(
                    "sg exited with {}: {}",
                    output
                        .code
                        .map_or_else(|| "a signal".to_string(), |c| format!("status {c}")),
                    output.stderr.trim()
                )));
            }
        };
        if lines.is_empty() {
            return Ok(ToolOutput::text(NO_MATCHES).with_metadata("matches", json!(0)));
        }
        let (lines, truncated) = cap_lines(lines, search.max_results);
        Ok(ToolOutput::text(lines.join("\n"))
            .with_metadata("matches", json!(lines.len()))
            .with_metadata("truncated", json!(truncated)))
    }
}

impl ToolHandler for StructuralSearchTool {
    fn name(&self) -> &'static str {
        "structural_search"
    }

    fn description(&self) -> &'static str {
        "Syntax-aware code search with ast-grep patterns such as `fn $NAME($$$ARGS)`."
    }

    fn input_schema(&self) -> Value {
        object_schema(
            base_properties(),
            json!({
                "pattern": {"type": "string", "description": "ast-grep pattern; `$X` matches one node, `$$$X` many."},
                "language": {"type": "string", "description": "Language name passed to `sg --lang`."},
                "path": {"type": "string", "description": "File or directory relative to workingDirectory."},
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sg_json() {
        let stdout = r#"[
            {"text":"fn b() {}","range":{"byteOffset":{"start":0,"end":9},"start":{"line":4,"column":0},"end":{"line":4,"column":9}},"file":"./src/z.rs","lines":"fn b() {}","language":"Rust"},
            {"text":"fn a(x: u8) {\n}","range":{"start":{"line":0,"column":0},"end":{"line":1,"column":1}},"file":"src/a.rs","lines":"fn a(x: u8) {\n}","language":"Rust"}
        ]"#;
        assert_eq!(
            parse_matches(stdout).expect("parse"),
            vec!["src/a.rs:1:fn a(x: u8) {".to_string(), "src/z.rs:5:fn b() {}".to_string()]
        );
        assert!(parse_matches("[]").expect("empty").is_empty());
        assert!(parse_matches("").expect("blank").is_empty());
        assert!(parse_matches("not json").is_err());
    }

    #[test]
    fn literal_fragment_strips_metavariables() {
        assert_eq!(
            literal_fragment("console.log($$$ARGS)").as_deref(),
            Some("console.log(")
        );
        assert_eq!(
            literal_fragment("fn $NAME($$$A) -> Result<$T, Error>").as_deref(),
            Some(") -> Result<")
        );
        assert_eq!(literal_fragment("unsafe { $BODY }").as_deref(), Some("unsafe {"));
        assert_eq!(literal_fragment("$A"), None);
    }
}
