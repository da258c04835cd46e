//! Process configuration, loaded once from the environment at startup.
//!
//! Mirrors the sandbox servers' `get_config()` pattern: every knob has a
//! sane default, parsing happens eagerly, and a malformed value is a
//! startup error rather than something that surfaces mid-request.

use crate::{Error, Result};

/// Which guest transport backend new sessions use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// One-shot `exec` per call; no state survives between calls.
    Stateless,
    /// Long-lived in-guest evaluator reachable over a binary RPC port.
    Persistent,
}

/// Top-level process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Seconds of inactivity after which an idle session is reaped.
    pub sandbox_timeout_secs: u64,
    /// Hard cap on concurrently live sessions.
    pub max_sandboxes: usize,
    /// Guest image tag to run.
    pub docker_image: String,
    /// Docker daemon endpoint; `None` means the local default socket.
    pub docker_host: Option<String>,
    /// `tracing_subscriber::EnvFilter` directive.
    pub log_level: String,
    /// Host directory under which per-session workspaces are bind-mounted.
    /// When unset, sessions get an in-memory tmpfs sandbox root instead.
    pub workspace_root: Option<String>,
    /// Database connection parameters forwarded into guest environments.
    pub db: DbConfig,
    /// Maximum submitted-code length, in characters.
    pub max_code_chars: usize,
    /// Default cap on captured output, in bytes.
    pub max_output_bytes: usize,
    /// Cap on a single file read, in bytes.
    pub max_file_read_bytes: usize,
    /// Cap on a single file write, in bytes.
    pub max_file_write_bytes: usize,
    /// Default per-call wall-clock budget, in seconds.
    pub default_exec_timeout_secs: f64,
    /// Guest transport backend for sessions created by this process.
    pub backend: Backend,
    /// Guest-side port the persistent evaluator listens on.
    pub evaluator_guest_port: u16,
}

/// Database connection parameters forwarded into session containers.
#[derive(Debug, Clone, Default)]
pub struct DbConfig {
    /// Database host as configured (pre loopback-rewrite).
    pub host: String,
    /// Database port.
    pub port: u16,
    /// Database user.
    pub user: String,
    /// Database password.
    pub password: String,
    /// Database name.
    pub name: String,
}

impl Config {
    /// Load configuration from the process environment, applying defaults
    /// for anything unset.
    pub fn from_env() -> Result<Self> {
        let sandbox_timeout_secs = parse_env_or("SANDBOX_TIMEOUT", 300)?;
        let max_sandboxes = parse_env_or("MAX_SANDBOXES", 10)?;
        let docker_host = std::env::var("DOCKER_HOST").ok();
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string());
        let workspace_root = std::env::var("WORKSPACE_ROOT").ok();

        let db = DbConfig {
            host: std::env::var("DB_HOST").unwrap_or_default(),
            port: parse_env_or("DB_PORT", 5432)?,
            user: std::env::var("DB_USER").unwrap_or_default(),
            password: std::env::var("DB_PASSWORD").unwrap_or_default(),
            name: std::env::var("DB_NAME").unwrap_or_default(),
        };

        let max_code_chars = parse_env_or("MAX_CODE_CHARS", 100_000)?;
        let max_output_bytes = parse_env_or("MAX_OUTPUT_BYTES", 65_536)?;
        let max_file_read_bytes = parse_env_or("MAX_FILE_READ_BYTES", 10_485_760)?;
        let max_file_write_bytes = parse_env_or("MAX_FILE_WRITE_BYTES", 10_485_760)?;
        let default_exec_timeout_secs = parse_env_or("DEFAULT_EXEC_TIMEOUT_SECS", 30.0)?;

        let backend = match std::env::var("BACKEND").ok().as_deref() {
            None | Some("stateless") => Backend::Stateless,
            Some("persistent") => Backend::Persistent,
            Some(other) => {
                return Err(Error::InvalidLimits(format!(
                    "unknown BACKEND '{other}', expected 'stateless' or 'persistent'"
                )))
            }
        };
        // Default image tag is backend-specific (Python for the stateless
        // exec backend, R for the persistent-evaluator backend) unless the
        // caller pins one explicitly.
        let docker_image = std::env::var("DOCKER_IMAGE").unwrap_or_else(|_| {
            match backend {
                Backend::Stateless => "python:3.11-slim".to_string(),
                Backend::Persistent => "r-base:4.3.2".to_string(),
            }
        });
        let evaluator_guest_port = parse_env_or("EVALUATOR_GUEST_PORT", 6311)?;

        let config = Self {
            sandbox_timeout_secs,
            max_sandboxes,
            docker_image,
            docker_host,
            log_level,
            workspace_root,
            db,
            max_code_chars,
            max_output_bytes,
            max_file_read_bytes,
            max_file_write_bytes,
            default_exec_timeout_secs,
            backend,
            evaluator_guest_port,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration invariants that can't be expressed in the
    /// types above (all caps must be positive).
    pub fn validate(&self) -> Result<()> {
        if self.max_sandboxes == 0 {
            return Err(Error::InvalidLimits(
                "MAX_SANDBOXES must be at least 1".to_string(),
            ));
        }
        if self.max_code_chars == 0 {
            return Err(Error::InvalidLimits(
                "MAX_CODE_CHARS must be at least 1".to_string(),
            ));
        }
        if self.default_exec_timeout_secs <= 0.0 {
            return Err(Error::InvalidLimits(
                "DEFAULT_EXEC_TIMEOUT_SECS must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the configured database host is a loopback literal that
    /// needs rewriting to the container runtime's host-gateway alias.
    pub fn db_host_is_loopback(&self) -> bool {
        matches!(self.db.host.as_str(), "localhost" | "127.0.0.1")
    }
}

fn parse_env_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::InvalidLimits(format!("{key}='{raw}' is invalid: {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        // from_env reads real process env, which is shared across tests;
        // validate() alone exercises the invariants deterministically.
        let cfg = Config {
            sandbox_timeout_secs: 300,
            max_sandboxes: 10,
            docker_image: "python:3.11-slim".to_string(),
            docker_host: None,
            log_level: "INFO".to_string(),
            workspace_root: None,
            db: DbConfig::default(),
            max_code_chars: 100_000,
            max_output_bytes: 65_536,
            max_file_read_bytes: 10_485_760,
            max_file_write_bytes: 10_485_760,
            default_exec_timeout_secs: 30.0,
            backend: Backend::Stateless,
            evaluator_guest_port: 6311,
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_max_sandboxes() {
        let mut cfg_ok = Config {
            sandbox_timeout_secs: 300,
            max_sandboxes: 0,
            docker_image: "python:3.11-slim".to_string(),
            docker_host: None,
            log_level: "INFO".to_string(),
            workspace_root: None,
            db: DbConfig::default(),
            max_code_chars: 100_000,
            max_output_bytes: 65_536,
            max_file_read_bytes: 10_485_760,
            max_file_write_bytes: 10_485_760,
            default_exec_timeout_secs: 30.0,
            backend: Backend::Stateless,
            evaluator_guest_port: 6311,
        };
        assert!(cfg_ok.validate().is_err());
        cfg_ok.max_sandboxes = 1;
        assert!(cfg_ok.validate().is_ok());
    }

    #[test]
    fn loopback_detection() {
        let mut cfg = DbConfig::default();
        cfg.host = "localhost".to_string();
        let config = Config {
            sandbox_timeout_secs: 300,
            max_sandboxes: 10,
            docker_image: "x".to_string(),
            docker_host: None,
            log_level: "INFO".to_string(),
            workspace_root: None,
            db: cfg,
            max_code_chars: 1,
            max_output_bytes: 1,
            max_file_read_bytes: 1,
            max_file_write_bytes: 1,
            default_exec_timeout_secs: 1.0,
            backend: Backend::Stateless,
            evaluator_guest_port: 6311,
        };
        assert!(config.db_host_is_loopback());
    }
}
