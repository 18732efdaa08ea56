//! Purpose: Degraded-but-functional alternatives for tools whose primary path failed.
//! Exports: `FallbackStrategy`.
//! Role: Consulted by the pipeline for fallback-eligible failures only.
//! Invariants: One variant per tool that has a fallback; the rest have none.
//! Invariants: A fallback never spawns external binaries.
use serde_json::{Map, Value, json};

use crate::core::error::{Error, ErrorKind};
use crate::tools::scan::{ScanOptions, literal_scan};
use crate::tools::search::{NO_MATCHES, SearchArgs};
use crate::tools::structural::{StructuralArgs, literal_fragment};
use crate::tools::{ToolContext, ToolOutput};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallbackStrategy {
    /// `search_text` without ripgrep: literal, line-oriented scan.
    PlainTextScan,
    /// `structural_search` without ast-grep: scan for the longest literal piece of the pattern.
    LiteralPatternScan,
}

impl FallbackStrategy {
    pub fn for_tool(tool: &str) -> Option<Self> {
        match tool {
            "search_text" => Some(FallbackStrategy::PlainTextScan),
            "structural_search" => Some(FallbackStrategy::LiteralPatternScan),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FallbackStrategy::PlainTextScan => "plain_text_scan",
            FallbackStrategy::LiteralPatternScan => "literal_pattern_scan",
        }
    }

    pub async fn run(
        self,
        ctx: &ToolContext,
        args: &Map<String, Value>,
    ) -> Result<ToolOutput, Error> {
        let (needle, case_insensitive, path, max_results) = match self {
            FallbackStrategy::PlainTextScan => {
                let search = SearchArgs::parse(args)?;
                (
                    search.pattern,
                    !search.case_sensitive,
                    search.path,
                    search.max_results,
                )
            }
            FallbackStrategy::LiteralPatternScan => {
                let search = StructuralArgs::parse(args)?;
                let needle = literal_fragment(&search.pattern).ok_or_else(|| {
                    Error::new(ErrorKind::Usage).with_message(
                        "pattern has no literal text to scan for once metavariables are removed",
                    )
                })?;
                (needle, false, search.path, search.max_results)
            }
        };

        let root = ctx.resolve(path.as_deref());
        let outcome = literal_scan(
            root,
            ctx.working_dir.clone(),
            ScanOptions {
                needle: needle.clone(),
                case_insensitive,
                max_results,
            },
        )
        .await?;

        let text = if outcome.lines.is_empty() {
            NO_MATCHES.to_string()
        } else {
            outcome.lines.join("\n")
        };
        Ok(ToolOutput::text(text)
            .with_metadata("matches", json!(outcome.lines.len()))
            .with_metadata("truncated", json!(outcome.truncated))
            .with_metadata("scannedLiteral", json!(needle)))
    }
}
