//! Purpose: Classify failures into the fixed error taxonomy and build reply payloads.
//! Exports: `ErrorClass`, `classify`, `error_payload`, `FallbackAttempt`.
//! Role: Single place that decides codes, suggestions, and fallback eligibility.
//! Invariants: Only `NotFound` and `Timeout` are fallback-eligible.
//! Invariants: Unsafe classes (permission, exhaustion) are matched before recoverable ones.
//! Invariants: Every payload carries at least one class-specific suggestion.

use std::io;

use serde_json::{Map, Value, json};

use crate::core::error::{Error, ErrorKind};
use crate::mcp::codec::{
    INTERNAL_ERROR_CODE, INVALID_PARAMS_CODE, INVALID_REQUEST_CODE, JsonRpcError,
    METHOD_NOT_FOUND_CODE, NOT_INITIALIZED_CODE, PARSE_ERROR_CODE, PERMISSION_DENIED_CODE,
    RESOURCE_EXHAUSTED_CODE, RESOURCE_NOT_FOUND_CODE, TIMEOUT_CODE, TOOL_FAILURE_CODE,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Parse,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    NotInitialized,
    NotFound,
    PermissionDenied,
    Timeout,
    ResourceExhausted,
    Internal,
    Unknown,
}

impl ErrorClass {
    pub fn code(self) -> i32 {
        match self {
            ErrorClass::Parse => PARSE_ERROR_CODE,
            ErrorClass::InvalidRequest => INVALID_REQUEST_CODE,
            ErrorClass::MethodNotFound => METHOD_NOT_FOUND_CODE,
            ErrorClass::InvalidParams => INVALID_PARAMS_CODE,
            ErrorClass::NotInitialized => NOT_INITIALIZED_CODE,
            ErrorClass::NotFound => RESOURCE_NOT_FOUND_CODE,
            ErrorClass::PermissionDenied => PERMISSION_DENIED_CODE,
            ErrorClass::Timeout => TIMEOUT_CODE,
            ErrorClass::ResourceExhausted => RESOURCE_EXHAUSTED_CODE,
            ErrorClass::Internal => INTERNAL_ERROR_CODE,
            ErrorClass::Unknown => TOOL_FAILURE_CODE,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            PARSE_ERROR_CODE => ErrorClass::Parse,
            INVALID_REQUEST_CODE => ErrorClass::InvalidRequest,
            METHOD_NOT_FOUND_CODE => ErrorClass::MethodNotFound,
            INVALID_PARAMS_CODE => ErrorClass::InvalidParams,
            NOT_INITIALIZED_CODE => ErrorClass::NotInitialized,
            RESOURCE_NOT_FOUND_CODE => ErrorClass::NotFound,
            PERMISSION_DENIED_CODE => ErrorClass::PermissionDenied,
            TIMEOUT_CODE => ErrorClass::Timeout,
            RESOURCE_EXHAUSTED_CODE => ErrorClass::ResourceExhausted,
            INTERNAL_ERROR_CODE => ErrorClass::Internal,
            _ => ErrorClass::Unknown,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ErrorClass::Parse => "parse_error",
            ErrorClass::InvalidRequest => "invalid_request",
            ErrorClass::MethodNotFound => "method_not_found",
            ErrorClass::InvalidParams => "invalid_params",
            ErrorClass::NotInitialized => "not_initialized",
            ErrorClass::NotFound => "not_found",
            ErrorClass::PermissionDenied => "permission_denied",
            ErrorClass::Timeout => "timeout",
            ErrorClass::ResourceExhausted => "resource_exhausted",
            ErrorClass::Internal => "internal",
            ErrorClass::Unknown => "unknown",
        }
    }

    pub fn is_fallback_eligible(self) -> bool {
        matches!(self, ErrorClass::NotFound | ErrorClass::Timeout)
    }

    pub fn suggestions(self) -> &'static [&'static str] {
        match self {
            ErrorClass::Parse => &[
                "Send exactly one JSON document per line, terminated by a newline.",
                "Check the frame for unbalanced braces or unescaped quotes.",
            ],
            ErrorClass::InvalidRequest => &[
                "Include \"jsonrpc\": \"2.0\" and a string \"method\" in every frame.",
                "Use a string or number for \"id\".",
            ],
            ErrorClass::MethodNotFound => &[
                "Supported methods: initialize, notifications/initialized, ping, tools/list, tools/call.",
            ],
            ErrorClass::InvalidParams => &[
                "Call tools/list to see each tool's input schema.",
                "Every tools/call needs a `workingDirectory` argument.",
            ],
            ErrorClass::NotInitialized => &[
                "Send `initialize`, then the `notifications/initialized` notification, then retry.",
            ],
            ErrorClass::NotFound => &[
                "Verify the path exists and is spelled correctly.",
                "Check that `workingDirectory` points at an existing directory.",
                "Make sure required external tools (rg, sg) are installed and on PATH.",
            ],
            ErrorClass::PermissionDenied => &[
                "Check file and directory permissions for the server process.",
                "Choose a working directory the server is allowed to read and write.",
            ],
            ErrorClass::Timeout => &[
                "Narrow the search path or pattern to reduce the amount of work.",
                "Pass a larger `timeoutMs` if the operation legitimately needs more time.",
            ],
            ErrorClass::ResourceExhausted => &[
                "Reduce the scope of the request; the system is out of memory or file handles.",
                "Retry once fewer tool calls are running.",
            ],
            ErrorClass::Internal => &["Retry the request; if it keeps failing, report it with the server log."],
            ErrorClass::Unknown => &[
                "Inspect the error message for details from the underlying tool.",
                "Retry with simpler arguments to isolate the failure.",
            ],
        }
    }
}

pub fn classify(err: &Error) -> ErrorClass {
    match err.kind() {
        ErrorKind::NotFound => return ErrorClass::NotFound,
        ErrorKind::Permission => return ErrorClass::PermissionDenied,
        ErrorKind::Timeout => return ErrorClass::Timeout,
        ErrorKind::Exhausted => return ErrorClass::ResourceExhausted,
        ErrorKind::Usage => return ErrorClass::InvalidParams,
        ErrorKind::Internal | ErrorKind::Io | ErrorKind::Corrupt => {}
    }

    let mut source = std::error::Error::source(err);
    while let Some(current) = source {
        if let Some(io_err) = current.downcast_ref::<io::Error>() {
            if let Some(class) = classify_io(io_err) {
                return class;
            }
        }
        source = current.source();
    }

    classify_message(&err.detail())
}

fn classify_io(err: &io::Error) -> Option<ErrorClass> {
    match err.kind() {
        io::ErrorKind::OutOfMemory => return Some(ErrorClass::ResourceExhausted),
        io::ErrorKind::PermissionDenied => return Some(ErrorClass::PermissionDenied),
        io::ErrorKind::TimedOut => return Some(ErrorClass::Timeout),
        io::ErrorKind::NotFound => return Some(ErrorClass::NotFound),
        _ => {}
    }
    match err.raw_os_error() {
        Some(libc::ENOMEM) | Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOSPC) => {
            Some(ErrorClass::ResourceExhausted)
        }
        Some(libc::EACCES) | Some(libc::EPERM) => Some(ErrorClass::PermissionDenied),
        Some(libc::ETIMEDOUT) => Some(ErrorClass::Timeout),
        Some(libc::ENOENT) | Some(libc::ENOTDIR) => Some(ErrorClass::NotFound),
        _ => None,
    }
}

/// Substring heuristics for errors that only surface as text (e.g. subprocess stderr).
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));

    if has(&[
        "out of memory",
        "enomem",
        "cannot allocate",
        "memory allocation failed",
        "too many open files",
        "emfile",
        "no space left",
    ]) {
        ErrorClass::ResourceExhausted
    } else if has(&["permission denied", "eacces", "eperm", "operation not permitted"]) {
        ErrorClass::PermissionDenied
    } else if has(&["timed out", "timeout", "etimedout", "deadline exceeded"]) {
        ErrorClass::Timeout
    } else if has(&[
        "no such file",
        "not found",
        "enoent",
        "does not exist",
        "cannot find",
        "not a directory",
    ]) {
        ErrorClass::NotFound
    } else {
        ErrorClass::Unknown
    }
}

/// Record of a fallback that ran and failed, folded into the original error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FallbackAttempt {
    pub strategy: &'static str,
    pub error: String,
}

/// Build the `data` object attached to every error reply.
pub fn error_payload(
    class: ErrorClass,
    tool: Option<&str>,
    hint: Option<&str>,
    fallback: Option<&FallbackAttempt>,
) -> Value {
    let mut suggestions: Vec<Value> = Vec::new();
    if let Some(hint) = hint {
        suggestions.push(json!(hint));
    }
    suggestions.extend(
        class
            .suggestions()
            .iter()
            .filter(|s| Some(**s) != hint)
            .map(|s| json!(s)),
    );

    let mut data = Map::new();
    if let Some(tool) = tool {
        data.insert("tool".to_string(), json!(tool));
    }
    data.insert("timestamp".to_string(), json!(timestamp_now()));
    data.insert("errorClass".to_string(), json!(class.label()));
    data.insert("suggestions".to_string(), Value::Array(suggestions));
    if class.is_fallback_eligible() || fallback.is_some() {
        let fallback_value = match fallback {
            Some(attempt) => json!({
                "attempted": true,
                "strategy": attempt.strategy,
                "error": attempt.error,
            }),
            None => json!({ "attempted": false }),
        };
        data.insert("fallback".to_string(), fallback_value);
    }
    Value::Object(data)
}

/// Attach a class-appropriate payload to a protocol-level error that has none yet.
pub fn annotate(error: JsonRpcError, tool: Option<&str>) -> JsonRpcError {
    if error.data.is_some() {
        return error;
    }
    let class = ErrorClass::from_code(error.code);
    error.with_data(error_payload(class, tool, None, None))
}

/// Reply for a classified tool failure.
pub fn tool_error(
    err: &Error,
    class: ErrorClass,
    tool: &str,
    fallback: Option<&FallbackAttempt>,
) -> JsonRpcError {
    JsonRpcError::new(class.code(), err.detail())
        .with_data(error_payload(class, Some(tool), err.hint(), fallback))
}

pub(crate) fn timestamp_now() -> String {
    use time::format_description::well_known::Rfc3339;
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
