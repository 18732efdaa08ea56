//! Purpose: Run the MCP server over a newline-delimited stdio transport.
//! Exports: `serve`, `READ_CHUNK_BYTES`.
//! Role: Own the reader loop and the single writer; hand tool calls to spawned tasks.
//! Invariants: The output stream only carries JSON-RPC messages, one per line.
//! Invariants: The reader never waits on an in-flight tool call.
//! Invariants: Input EOF drains in-flight calls and flushes their replies before returning.
//! Invariants: A write failure is fatal and surfaces as an `Io` error.
//! Notes: Replies are written in completion order; clients match them by id.

use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::codec::{Frame, JsonRpcResponse, decode_frame, decode_invalid_utf8, encode_line};
use super::dispatcher::{DispatchOutcome, McpDispatcher};
use super::framer::{FrameError, LineFramer};
use crate::core::error::{Error, ErrorKind};

pub const READ_CHUNK_BYTES: usize = 64 * 1024;

const REPLY_QUEUE: usize = 256;

/// Serve until `reader` reaches EOF or `shutdown` resolves.
pub async fn serve<R, W, S>(
    mut reader: R,
    writer: W,
    dispatcher: Arc<McpDispatcher>,
    max_frame_bytes: usize,
    shutdown: S,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    S: Future<Output = ()>,
{
    let (tx, rx) = mpsc::channel::<JsonRpcResponse>(REPLY_QUEUE);
    let writer_task = tokio::spawn(write_loop(writer, rx));
    let mut framer = LineFramer::new(max_frame_bytes);
    let mut tasks = JoinSet::new();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    tokio::pin!(shutdown);

    let reason = loop {
        let read = tokio::select! {
            _ = &mut shutdown => break "signal",
            read = reader.read(&mut buf) => read,
        };
        let read = match read {
            Ok(read) => read,
            Err(err) => {
                tasks.shutdown().await;
                drop(tx);
                let _ = writer_task.await;
                return Err(Error::new(ErrorKind::Io)
                    .with_message("failed to read MCP input")
                    .with_source(err));
            }
        };
        if read == 0 {
            if let Some(frame) = framer.finish() {
                handle_frame(frame, &dispatcher, &tx, &mut tasks).await;
            }
            break "eof";
        }

        framer.push(&buf[..read]);
        let mut writer_alive = true;
        while let Some(frame) = framer.next_frame() {
            if !handle_frame(frame, &dispatcher, &tx, &mut tasks).await {
                writer_alive = false;
                break;
            }
        }
        if !writer_alive {
            break "write failure";
        }
        while tasks.try_join_next().is_some() {}
    };

    if reason == "signal" {
        info!(in_flight = tasks.len(), "shutdown requested; abandoning in-flight calls");
        tasks.shutdown().await;
    } else {
        debug!(in_flight = tasks.len(), reason, "input closed; draining in-flight calls");
        while tasks.join_next().await.is_some() {}
    }
    drop(tx);

    let written = writer_task.await.map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("MCP writer task failed")
            .with_source(err)
    })?;
    if let Err(err) = &written {
        error!(error = %err.detail(), "MCP output failed");
    }
    dispatcher.log_summary(reason);
    written
}

/// Returns false once the writer has gone away.
async fn handle_frame(
    frame: Result<String, FrameError>,
    dispatcher: &Arc<McpDispatcher>,
    tx: &mpsc::Sender<JsonRpcResponse>,
    tasks: &mut JoinSet<()>,
) -> bool {
    let decoded = match frame {
        Ok(line) => {
            debug!(bytes = line.len(), "frame");
            decode_frame(&line)
        }
        Err(FrameError::InvalidUtf8 { lossy }) => decode_invalid_utf8(&lossy),
        Err(err) => {
            warn!(error = %err, "dropping unreadable frame");
            return true;
        }
    };

    let request = match decoded {
        Frame::Request(request) | Frame::Notification(request) => request,
        Frame::Malformed(malformed) => {
            let Some(id) = malformed.id else {
                warn!(error = %malformed.error.message, "dropping malformed frame without id");
                return true;
            };
            let response = dispatcher.reject(id, malformed.error);
            return tx.send(response).await.is_ok();
        }
    };

    match dispatcher.dispatch(request) {
        DispatchOutcome::NoResponse => true,
        DispatchOutcome::Response(response) => tx.send(response).await.is_ok(),
        DispatchOutcome::Deferred(pending) => {
            let dispatcher = Arc::clone(dispatcher);
            let tx = tx.clone();
            tasks.spawn(async move {
                let id = pending.id().clone();
                let tool = pending.tool().to_string();
                let started = pending.started();
                let worker = Arc::clone(&dispatcher);
                let response = match tokio::spawn(async move { worker.execute(pending).await }).await
                {
                    Ok(response) => response,
                    Err(_) => dispatcher.abandoned(id, &tool, started),
                };
                if tx.send(response).await.is_err() {
                    debug!(tool = %tool, "writer closed before reply could be sent");
                }
            });
            true
        }
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<JsonRpcResponse>) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let line = encode_line(&response)?;
        writer.write_all(&line).await.map_err(write_error)?;
        writer.flush().await.map_err(write_error)?;
    }
    writer.flush().await.map_err(write_error)?;
    writer.shutdown().await.map_err(write_error)
}

fn write_error(err: std::io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("failed to write MCP message")
        .with_source(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::mcp::codec::{NOT_INITIALIZED_CODE, PARSE_ERROR_CODE};
    use crate::tools::ToolRegistry;
    use serde_json::{Value, json};
    use std::pin::Pin;
    use std::task::{Context, Poll};

    fn dispatcher() -> Arc<McpDispatcher> {
        let config = Arc::new(ServerConfig::default());
        let registry = Arc::new(ToolRegistry::standard(&config).expect("standard"));
        Arc::new(McpDispatcher::new(config, registry))
    }

    async fn run(input: String, max_frame_bytes: usize) -> Vec<Value> {
        let (writer, mut client) = tokio::io::duplex(1 << 20);
        let collect = tokio::spawn(async move {
            let mut out = String::new();
            client.read_to_string(&mut out).await.expect("read output");
            out
        });
        serve(
            input.as_bytes(),
            writer,
            dispatcher(),
            max_frame_bytes,
            std::future::pending(),
        )
        .await
        .expect("serve");
        let out = collect.await.expect("collector");
        out.lines()
            .map(|line| serde_json::from_str(line).expect("reply is JSON"))
            .collect()
    }

    fn by_id(replies: &[Value], id: Value) -> &Value {
        replies
            .iter()
            .find(|reply| reply["id"] == id)
            .unwrap_or_else(|| panic!("no reply for {id}"))
    }

    #[tokio::test]
    async fn full_session_over_one_stream() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cwd = json!(dir.path().to_str().expect("utf8"));
        let input = [
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#.to_string(),
            r#"{"jsonrpc":"2.0","id":2,"method":"initialize","params":{"protocolVersion":"2025-11-25"}}"#.to_string(),
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#.to_string(),
            format!(
                r#"{{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{{"name":"run_command","arguments":{{"workingDirectory":{cwd},"command":"echo hi"}}}}}}"#
            ),
            r#"{"jsonrpc":"2.0","id":4,"method":"tools/list"}"#.to_string(),
            r#"{"jsonrpc":"2.0","id":5,"method":"ping""#.to_string(),
            "not json at all".to_string(),
        ]
        .join("\n");

        let replies = run(input, 1024 * 1024).await;
        assert_eq!(replies.len(), 5);
        assert_eq!(
            by_id(&replies, json!(1))["error"]["code"],
            json!(NOT_INITIALIZED_CODE)
        );
        assert!(by_id(&replies, json!(2))["result"]["serverInfo"].is_object());
        let text = by_id(&replies, json!(3))["result"]["content"][0]["text"]
            .as_str()
            .expect("text")
            .to_string();
        assert!(text.contains("hi"), "{text}");
        assert_eq!(
            by_id(&replies, json!(4))["result"]["tools"]
                .as_array()
                .map(Vec::len),
            Some(4)
        );
        assert_eq!(by_id(&replies, json!(5))["error"]["code"], json!(PARSE_ERROR_CODE));
    }

    #[tokio::test]
    async fn oversized_frame_is_dropped_and_stream_recovers() {
        let input = format!(
            "{}\n{}\n",
            "x".repeat(4096),
            r#"{"jsonrpc":"2.0","id":"p","method":"ping"}"#
        );
        let replies = run(input, 256).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["id"], json!("p"));
        assert_eq!(replies[0]["result"], json!({}));
    }

    #[tokio::test]
    async fn non_utf8_frame_with_id_gets_parse_error() {
        let (writer, mut client) = tokio::io::duplex(1 << 16);
        let mut input = br#"{"jsonrpc":"2.0","id":7,"method":"ping","params":{"x":""#.to_vec();
        input.push(0xff);
        input.extend_from_slice(b"\"}}\n");
        input.extend_from_slice(b"\xfe\xfe no id here\n");
        serve(
            input.as_slice(),
            writer,
            dispatcher(),
            1024,
            std::future::pending(),
        )
        .await
        .expect("serve");
        let mut out = String::new();
        client.read_to_string(&mut out).await.expect("read output");
        let replies: Vec<Value> = out
            .lines()
            .map(|line| serde_json::from_str(line).expect("reply is JSON"))
            .collect();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["id"], json!(7));
        assert_eq!(replies[0]["error"]["code"], json!(PARSE_ERROR_CODE));
    }

    #[tokio::test]
    async fn final_frame_without_newline_is_served() {
        let replies = run(r#"{"jsonrpc":"2.0","id":9,"method":"ping"}"#.to_string(), 1024).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["id"], json!(9));
    }

    #[tokio::test]
    async fn shutdown_future_stops_an_open_stream() {
        let (_input_keepalive, reader) = tokio::io::duplex(64);
        let (writer, _output) = tokio::io::duplex(1024);
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            serve(reader, writer, dispatcher(), 1024, async {}),
        )
        .await
        .expect("serve returned");
        assert!(result.is_ok());
    }

    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe)))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn write_failure_is_fatal() {
        let input = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}
{"jsonrpc":"2.0","id":2,"method":"ping"}
"#;
        let err = serve(
            input.as_bytes(),
            BrokenPipe,
            dispatcher(),
            1024,
            std::future::pending(),
        )
        .await
        .expect_err("write failure");
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
