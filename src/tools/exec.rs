//! Purpose: `run_command` tool: run a shell command line in the working directory.
//! Exports: `RunCommandTool`.
//! Role: Side-effecting tool; never cached and has no fallback.
//! Invariants: A non-zero exit is a result with `isError: true`, not a protocol error.
use serde_json::{Map, Value, json};

use super::process::run_process;
use super::{
    HandlerFuture, ToolContext, ToolHandler, ToolOutput, base_properties, object_schema,
    required_str,
};
use crate::core::error::Error;

pub struct RunCommandTool {
    shell: String,
}

impl RunCommandTool {
    pub fn new(shell: &str) -> Self {
        Self {
            shell: shell.to_string(),
        }
    }

    async fn run(&self, ctx: &ToolContext, args: &Map<String, Value>) -> Result<ToolOutput, Error> {
        let command = required_str(args, "command")?;
        let cwd = ctx.existing_working_dir()?;
        let output = run_process(&self.shell, ["-c", command], cwd).await?;

        let status = match output.code {
            Some(code) => format!("exit code: {code}"),
            None => "terminated by signal".to_string(),
        };
        let mut text = status;
        if !output.stdout.is_empty() {
            text.push_str("\n--- stdout ---\n");
            text.push_str(&output.stdout);
        }
        if !output.stderr.is_empty() {
            text.push_str("\n--- stderr ---\n");
            text.push_str(&output.stderr);
        }
        Ok(ToolOutput::text(text)
            .with_error_flag(!output.success())
            .with_metadata("exitCode", json!(output.code)))
    }
}

impl ToolHandler for RunCommandTool {
    fn name(&self) -> &'static str {
        "run_command"
    }

    fn description(&self) -> &'static str {
        "Run a shell command in workingDirectory and report exit code, stdout, and stderr."
    }

    fn input_schema(&self) -> Value {
        object_schema(
            base_properties(),
            json!({
                "command": {"type": "string", "description": "Command line passed to `sh -c`."}
            }),
            &["command"],
        )
    }

    fn invoke<'a>(
        &'a self,
        ctx: &'a ToolContext,
        args: &'a Map<String, Value>,
    ) -> HandlerFuture<'a> {
        Box::pin(self.run(ctx, args))
    }
}
