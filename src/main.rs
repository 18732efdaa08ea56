//! Purpose: `sgmcp` CLI entry point.
//! Role: Binary crate root; parses args, starts the stdio server or runs a helper command.
//! Invariants: In `serve` mode stdout carries only JSON-RPC frames; everything else is stderr.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `to_exit_code`.
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::path::Path;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};

use sgmcp::config::ServerConfig;
use sgmcp::mcp::handshake::ServerMetadata;
use sgmcp::server::{init_tracing, run_stdio};
use sgmcp::tools::ToolRegistry;
use sgmcp::{Error, ErrorKind, to_exit_code};

#[derive(Parser)]
#[command(
    name = "sgmcp",
    version,
    about = "MCP tool server for text, structural, and shell search over stdio",
    long_about = r#"Serve code-search tools to an MCP client over stdin/stdout.

With no subcommand, `sgmcp` runs `serve`: it reads newline-delimited JSON-RPC
from stdin and writes replies to stdout. Diagnostics go to stderr."#,
    after_help = r#"EXAMPLES
  $ sgmcp
  $ sgmcp serve --tool-timeout-ms 10000 --max-in-flight 4
  $ sgmcp tools
  $ RUST_LOG=debug sgmcp serve"#
)]
struct Cli {
    #[arg(
        long = "log-level",
        global = true,
        value_name = "FILTER",
        help = "Log filter for stderr diagnostics (RUST_LOG takes precedence)"
    )]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Serve MCP over stdio (default)",
        long_about = r#"Serve MCP over stdin/stdout until stdin closes or a termination signal arrives.

In-flight tool calls are drained on EOF; the process exits 0 once every reply is written."#
    )]
    Serve(ServeArgs),
    #[command(about = "Print the tool catalog as JSON")]
    Tools,
    #[command(about = "Print version info as JSON")]
    Version,
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ sgmcp completion bash > ~/.local/share/bash-completion/completions/sgmcp
  $ sgmcp completion zsh > ~/.zfunc/_sgmcp"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

#[derive(Args, Default)]
struct ServeArgs {
    #[arg(long, value_name = "MS", help = "Default per-call timeout", help_heading = "Limits")]
    tool_timeout_ms: Option<u64>,
    #[arg(long, value_name = "MS", help = "Upper bound for a call's timeoutMs", help_heading = "Limits")]
    max_tool_timeout_ms: Option<u64>,
    #[arg(long, value_name = "N", help = "Maximum concurrently running tool calls", help_heading = "Limits")]
    max_in_flight: Option<usize>,
    #[arg(long, value_name = "BYTES", help = "Maximum size of one input line", help_heading = "Limits")]
    max_frame_bytes: Option<usize>,
    #[arg(long, value_name = "N", help = "Maximum cached responses", help_heading = "Cache")]
    cache_capacity: Option<usize>,
    #[arg(long, value_name = "SECS", help = "Initial cache TTL", help_heading = "Cache")]
    cache_ttl_secs: Option<u64>,
    #[arg(long, value_name = "SECS", help = "Lower bound for the self-tuned TTL", help_heading = "Cache")]
    cache_min_ttl_secs: Option<u64>,
    #[arg(long, value_name = "SECS", help = "Upper bound for the self-tuned TTL", help_heading = "Cache")]
    cache_max_ttl_secs: Option<u64>,
    #[arg(long, value_name = "N", help = "Requests between self-tune checks", help_heading = "Cache")]
    tune_interval: Option<u64>,
    #[arg(long, value_name = "MS", help = "Latency above which the TTL grows", help_heading = "Cache")]
    tune_high_latency_ms: Option<u64>,
    #[arg(long, value_name = "MS", help = "Latency below which the TTL may shrink", help_heading = "Cache")]
    tune_low_latency_ms: Option<u64>,
    #[arg(long, value_name = "BYTES", help = "Results larger than this are paged", help_heading = "Overflow")]
    overflow_threshold_bytes: Option<usize>,
    #[arg(long, value_name = "BYTES", help = "Size of one overflow chunk", help_heading = "Overflow")]
    overflow_chunk_bytes: Option<usize>,
    #[arg(long, value_name = "HOURS", help = "Default cleanup age for overflow files", help_heading = "Overflow")]
    overflow_retention_hours: Option<u64>,
    #[arg(long, value_name = "NAME", help = "Overflow directory name inside the working directory", help_heading = "Overflow")]
    overflow_dir: Option<String>,
    #[arg(long, value_name = "PATH", help = "ripgrep executable", help_heading = "Executables")]
    rg_binary: Option<String>,
    #[arg(long, value_name = "PATH", help = "ast-grep executable", help_heading = "Executables")]
    sg_binary: Option<String>,
    #[arg(long = "shell", value_name = "PATH", help = "Shell used by run_command", help_heading = "Executables")]
    shell_binary: Option<String>,
}

impl ServeArgs {
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig::default();
        if let Some(ms) = self.tool_timeout_ms {
            config.tool_timeout = Duration::from_millis(ms);
            config.max_tool_timeout = config.max_tool_timeout.max(config.tool_timeout);
        }
        if let Some(ms) = self.max_tool_timeout_ms {
            config.max_tool_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = self.max_in_flight {
            config.max_in_flight = n;
        }
        if let Some(bytes) = self.max_frame_bytes {
            config.max_frame_bytes = bytes;
        }
        if let Some(n) = self.cache_capacity {
            config.cache.capacity = n;
        }
        if let Some(secs) = self.cache_ttl_secs {
            config.cache.initial_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = self.cache_min_ttl_secs {
            config.cache.min_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = self.cache_max_ttl_secs {
            config.cache.max_ttl = Duration::from_secs(secs);
        }
        if let Some(n) = self.tune_interval {
            config.tuning.interval = n;
        }
        if let Some(ms) = self.tune_high_latency_ms {
            config.tuning.high_latency = Duration::from_millis(ms);
        }
        if let Some(ms) = self.tune_low_latency_ms {
            config.tuning.low_latency = Duration::from_millis(ms);
        }
        if let Some(bytes) = self.overflow_threshold_bytes {
            config.overflow.threshold_bytes = bytes;
        }
        if let Some(bytes) = self.overflow_chunk_bytes {
            config.overflow.chunk_bytes = bytes;
        }
        if let Some(hours) = self.overflow_retention_hours {
            config.overflow.retention = Duration::from_secs(hours.saturating_mul(3600));
        }
        if let Some(name) = self.overflow_dir {
            config.overflow.dir_name = name;
        }
        if let Some(path) = self.rg_binary {
            config.rg_binary = path;
        }
        if let Some(path) = self.sg_binary {
            config.sg_binary = path;
        }
        if let Some(path) = self.shell_binary {
            config.shell_binary = path;
        }
        config
    }
}

fn main() {
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<i32, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(code);
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Run `sgmcp --help` for usage."));
            }
        },
    };

    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => {
            init_tracing(cli.log_level.as_deref());
            let config = args.into_config();
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(run_stdio(config))?;
            Ok(0)
        }
        Command::Tools => {
            let registry = ToolRegistry::standard(&ServerConfig::default())?;
            emit_json(&registry.list_result())?;
            Ok(0)
        }
        Command::Version => {
            let metadata = ServerMetadata::default();
            emit_json(&json!({
                "name": metadata.name,
                "version": metadata.version,
                "protocolVersion": metadata.protocol_version,
            }))?;
            Ok(0)
        }
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "sgmcp", &mut io::stdout());
            Ok(0)
        }
    }
}

fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    rendered
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.trim_start_matches("error: ").to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

fn emit_json(value: &Value) -> Result<(), Error> {
    let json = serde_json::to_string_pretty(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode output")
            .with_source(err)
    })?;
    println!("{json}");
    Ok(())
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("error: {}", error_message(err));
        if let Some(hint) = err.hint() {
            eprintln!("hint: {hint}");
        }
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Timeout => "timed out".to_string(),
        ErrorKind::Exhausted => "resource exhausted".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(display_path(path)));
    }
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }
    json!({ "error": Value::Object(inner) })
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}
