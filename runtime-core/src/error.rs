//! Error types for session-manager-core

use thiserror::Error;

/// Result type alias for session-manager-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for session-manager-core.
///
/// Every variant maps to exactly one stable error code in the tool-surface
/// envelope (see [`Error::code`]); this enum is the single source of truth
/// for that mapping so the two can never drift apart.
#[derive(Debug, Error)]
pub enum Error {
    /// A guest-relative path failed policy validation (empty, escapes the
    /// sandbox root, or otherwise malformed).
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Submitted code was empty or not a string.
    #[error("invalid code: {0}")]
    InvalidCode(String),

    /// Execution limits payload was malformed or out of range.
    #[error("invalid limits: {0}")]
    InvalidLimits(String),

    /// Package install source was not a recognized value.
    #[error("invalid source: {0}")]
    InvalidSource(String),

    /// File content failed validation (e.g. not valid UTF-8 where required).
    #[error("invalid content: {0}")]
    InvalidContent(String),

    /// Submitted code exceeded the configured character limit.
    #[error("code too large: {len} chars (max {max})")]
    CodeTooLarge {
        /// Length of the rejected code, in characters.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A file read or write exceeded the configured byte limit.
    #[error("file too large: {len} bytes (max {max})")]
    FileTooLarge {
        /// Length of the rejected file, in bytes.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The session table is already at `max_sessions` capacity.
    #[error("maximum number of sessions reached ({0})")]
    MaxSessionsReached(usize),

    /// No session exists with the given id.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Container/session creation failed on the runtime side.
    #[error("failed to create session: {0}")]
    SessionCreateFailed(String),

    /// Container/session teardown failed on the runtime side.
    #[error("failed to close session: {0}")]
    SessionCloseFailed(String),

    /// The guest reported a runtime error evaluating user code.
    #[error("execution error: {0}")]
    ExecutionError(String),

    /// Execution was aborted because it exceeded its wall-clock budget.
    #[error("execution timed out after {0:.1}s")]
    ExecutionTimeout(f64),

    /// The exec/RPC transport itself failed (connection reset, daemon
    /// unreachable, malformed wire response) as opposed to the guest code
    /// failing.
    #[error("transport error: {0}")]
    ExecutionTransport(String),

    /// Listing a guest directory failed.
    #[error("failed to list files: {0}")]
    ListFilesFailed(String),

    /// Reading a guest file failed.
    #[error("failed to read file: {0}")]
    ReadFileFailed(String),

    /// Writing a guest file failed.
    #[error("failed to write file: {0}")]
    WriteFileFailed(String),

    /// Installing a package into a session failed.
    #[error("failed to install package: {0}")]
    InstallPackageFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Docker API error.
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

impl Error {
    /// The stable error code surfaced to callers in the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidPath(_) => "invalid_path",
            Error::InvalidCode(_) => "invalid_code",
            Error::InvalidLimits(_) => "invalid_limits",
            Error::InvalidSource(_) => "invalid_source",
            Error::InvalidContent(_) => "invalid_content",
            Error::CodeTooLarge { .. } => "code_too_large",
            Error::FileTooLarge { .. } => "file_too_large",
            Error::MaxSessionsReached(_) => "max_sessions_reached",
            Error::SessionNotFound(_) => "session_not_found",
            Error::SessionCreateFailed(_) => "session_create_failed",
            Error::SessionCloseFailed(_) => "session_close_failed",
            Error::ExecutionError(_) => "execution_error",
            Error::ExecutionTimeout(_) => "execution_timeout",
            Error::ExecutionTransport(_) => "execution_transport_error",
            Error::ListFilesFailed(_) => "list_files_failed",
            Error::ReadFileFailed(_) => "read_file_failed",
            Error::WriteFileFailed(_) => "write_file_failed",
            Error::InstallPackageFailed(_) => "install_package_failed",
            Error::Io(_) => "execution_transport_error",
            Error::Json(_) => "invalid_content",
            Error::Docker(_) => "execution_transport_error",
        }
    }

    /// Whether a caller may reasonably retry the operation unchanged.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Error::SessionCreateFailed(_)
                | Error::SessionCloseFailed(_)
                | Error::ExecutionTransport(_)
                | Error::Io(_)
                | Error::Docker(_)
        )
    }
}
