//! Purpose: `retrieve_overflow` tool: page through, list, or clean up overflowed results.
//! Exports: `RetrieveOverflowTool`.
//! Role: Client-facing half of the overflow pagination protocol.
//! Invariants: Output from this tool is never itself moved to the overflow store.
//! Invariants: `hasMoreChunks` is true on every chunk except the last.
use std::time::Duration;

use serde_json::{Map, Value, json};

use super::{
    HandlerFuture, ToolContext, ToolHandler, ToolOutput, base_properties, object_schema,
    optional_bool, optional_f64, optional_str, optional_u64,
};
use crate::core::error::{Error, ErrorKind};
use crate::overflow::{OverflowSettings, OverflowStore};

pub struct RetrieveOverflowTool {
    settings: OverflowSettings,
}

enum Mode {
    List,
    Cleanup(Duration),
    Chunk { file_id: String, chunk_index: usize },
}

impl RetrieveOverflowTool {
    pub fn new(settings: OverflowSettings) -> Self {
        Self { settings }
    }

    fn mode(&self, args: &Map<String, Value>) -> Result<Mode, Error> {
        if optional_bool(args, "listFiles")?.unwrap_or(false) {
            return Ok(Mode::List);
        }
        if optional_bool(args, "cleanup")?.unwrap_or(false) {
            let older_than = match optional_f64(args, "olderThanHours")? {
                Some(hours) => Duration::try_from_secs_f64(hours * 3600.0).map_err(|_| {
                    Error::new(ErrorKind::Usage)
                        .with_message(format!("`olderThanHours` value {hours} is out of range"))
                        .with_hint("Use a number of hours like 24.")
                })?,
                None => self.settings.retention,
            };
            return Ok(Mode::Cleanup(older_than));
        }
        match optional_str(args, "fileId")? {
            Some(file_id) => {
                let chunk_index = optional_u64(args, "chunkIndex")?.unwrap_or(0);
                Ok(Mode::Chunk {
                    file_id: file_id.to_string(),
                    chunk_index: usize::try_from(chunk_index).unwrap_or(usize::MAX),
                })
            }
            None => Err(Error::new(ErrorKind::Usage)
                .with_message("pass `fileId`, `listFiles: true`, or `cleanup: true`")
                .with_hint("Use the fileId from an overflowed result's metadata.")),
        }
    }

    async fn run(&self, ctx: &ToolContext, args: &Map<String, Value>) -> Result<ToolOutput, Error> {
        let mode = self.mode(args)?;
        let working_dir = ctx.existing_working_dir()?;
        let store = OverflowStore::new(working_dir, self.settings.clone());
        tokio::task::spawn_blocking(move || run_mode(&store, mode))
            .await
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("overflow task failed")
                    .with_source(err)
            })?
    }
}

fn run_mode(store: &OverflowStore, mode: Mode) -> Result<ToolOutput, Error> {
    match mode {
        Mode::List => {
            let records = store.list()?;
            let files: Vec<Value> = records
                .iter()
                .map(|record| {
                    json!({
                        "fileId": record.file_id,
                        "totalChunks": record.total_chunks,
                        "totalBytes": record.total_bytes,
                        "createdAt": record.created_at,
                        "tool": record.tool,
                    })
                })
                .collect();
            let text = serde_json::to_string_pretty(&json!({ "files": files })).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode overflow listing")
                    .with_source(err)
            })?;
            Ok(ToolOutput::text(text).with_metadata("fileCount", json!(records.len())))
        }
        Mode::Cleanup(older_than) => {
            let report = store.cleanup(older_than)?;
            Ok(ToolOutput::text(format!(
                "Removed {} overflow file(s); {} kept.",
                report.removed.len(),
                report.kept
            ))
            .with_metadata("removed", json!(report.removed))
            .with_metadata("kept", json!(report.kept)))
        }
        Mode::Chunk {
            file_id,
            chunk_index,
        } => {
            let chunk = store.read_chunk(&file_id, chunk_index)?;
            let has_more = chunk.has_more();
            let next = chunk.next_cursor();
            let mut output = ToolOutput::text(chunk.content)
                .with_metadata("fileId", json!(chunk.file_id))
                .with_metadata("chunkIndex", json!(chunk.chunk_index))
                .with_metadata("totalChunks", json!(chunk.total_chunks))
                .with_metadata("hasMoreChunks", json!(has_more));
            output.next_chunk = next;
            Ok(output)
        }
    }
}

impl ToolHandler for RetrieveOverflowTool {
    fn name(&self) -> &'static str {
        "retrieve_overflow"
    }

    fn description(&self) -> &'static str {
        "Fetch a chunk of an oversized result by fileId and chunkIndex, list stored results, or clean up old ones."
    }

    fn input_schema(&self) -> Value {
        object_schema(
            base_properties(),
            json!({
                "fileId": {"type": "string"},
                "chunkIndex": {"type": "integer", "minimum": 0, "default": 0},
                "listFiles": {"type": "boolean"},
                "cleanup": {"type": "boolean"},
                "olderThanHours": {"type": "number", "minimum": 0}
            }),
            &[],
        )
    }

    fn allows_overflow(&self) -> bool {
        false
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
    use crate::config::ServerConfig;

    fn settings() -> OverflowSettings {
        OverflowSettings {
            threshold_bytes: 8,
            chunk_bytes: 4,
            ..OverflowSettings::default()
        }
    }

    async fn call(dir: &std::path::Path, extra: Value) -> Result<ToolOutput, Error> {
        let mut arguments = Map::new();
        arguments.insert(
            "workingDirectory".to_string(),
            json!(dir.to_str().expect("utf8")),
        );
        if let Value::Object(extra) = extra {
            arguments.extend(extra);
        }
        let ctx =
            ToolContext::from_arguments("retrieve_overflow", &arguments, &ServerConfig::default())?;
        RetrieveOverflowTool::new(settings())
            .invoke(&ctx, &arguments)
            .await
    }

    #[tokio::test]
    async fn pages_through_chunks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = OverflowStore::new(dir.path(), settings());
        let first = store.write("abcdefghij", Some("run_command")).expect("write");

        let mut collected = String::new();
        let mut cursor = Some((first.file_id.clone(), 0usize));
        let mut pages = 0;
        while let Some((file_id, index)) = cursor {
            let output = call(dir.path(), json!({"fileId": file_id, "chunkIndex": index}))
                .await
                .expect("chunk");
            collected.push_str(&output.text);
            let has_more = output.metadata["hasMoreChunks"].as_bool().expect("flag");
            assert_eq!(has_more, output.next_chunk.is_some());
            cursor = output.next_chunk.map(|next| (next.file_id, next.chunk_index));
            pages += 1;
        }
        assert_eq!(collected, "abcdefghij");
        assert_eq!(pages, 3);
    }

    #[tokio::test]
    async fn list_cleanup_and_bad_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = OverflowStore::new(dir.path(), settings());
        store.write("0123456789", None).expect("write");

        let listed = call(dir.path(), json!({"listFiles": true})).await.expect("list");
        assert_eq!(listed.metadata["fileCount"], json!(1));

        let kept = call(dir.path(), json!({"cleanup": true})).await.expect("cleanup");
        assert_eq!(kept.metadata["kept"], json!(1));
        let purged = call(dir.path(), json!({"cleanup": true, "olderThanHours": 0}))
            .await
            .expect("cleanup");
        assert_eq!(purged.metadata["removed"].as_array().map(Vec::len), Some(1));

        let err = call(dir.path(), json!({"cleanup": true, "olderThanHours": 1e20}))
            .await
            .expect_err("huge age");
        assert_eq!(err.kind(), ErrorKind::Usage);

        let err = call(dir.path(), json!({})).await.expect_err("no mode");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = call(dir.path(), json!({"fileId": "../x"})).await.expect_err("bad id");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
