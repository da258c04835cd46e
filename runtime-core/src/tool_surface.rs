//! Thin shim mapping the external tool operations onto [`SessionManager`]
//! and wrapping every outcome in the uniform success/error envelope.
//!
//! The protocol front-end that frames these calls over stdio (or any other
//! transport) is out of scope here; this module is the contract it talks
//! to.

use crate::config::Backend;
use crate::session_manager::{ExecuteReport, SessionManager};
use crate::Error;
use serde_json::{json, Value};

/// Build the `{success: false, error: {...}}` envelope for a given error.
pub fn error_envelope(err: &Error) -> Value {
    json!({
        "success": false,
        "error": {
            "code": err.code(),
            "message": err.to_string(),
            "retryable": err.retryable(),
        }
    })
}

/// `create_session` tool operation.
pub async fn create_session(manager: &SessionManager) -> Value {
    match manager.create_session().await {
        Ok(summary) => json!({
            "success": true,
            "session_id": summary.session_id,
            "created_at": summary.created_at,
            "last_used": summary.last_used,
            "host_port": summary.host_port,
        }),
        Err(e) => error_envelope(&e),
    }
}

/// `list_sessions` tool operation.
pub async fn list_sessions(manager: &SessionManager, include_inactive: bool) -> Value {
    let sessions = manager.list_sessions(include_inactive).await;
    json!({
        "success": true,
        "sessions": sessions,
        "count": sessions.len(),
    })
}

/// `close_session` tool operation.
pub async fn close_session(manager: &SessionManager, session_id: &str) -> Value {
    match manager.close_session(session_id).await {
        Ok(()) => json!({
            "success": true,
            "message": format!("Closed session {session_id}"),
        }),
        Err(e) => error_envelope(&e),
    }
}

/// `execute_in_session` tool operation.
pub async fn execute_in_session(
    manager: &SessionManager,
    session_id: &str,
    code: &str,
    limits: Option<&Value>,
) -> Value {
    match manager.execute_in_session(session_id, code, limits).await {
        Ok(ExecuteReport::Success(outcome)) => json!({
            "success": true,
            "result": outcome.result,
            "output": outcome.output,
            "exit_code": outcome.exit_code,
            "meta": {
                "elapsed_secs": outcome.elapsed_secs,
                "output_truncated": outcome.output_truncated,
            }
        }),
        Ok(ExecuteReport::Failure {
            error,
            output,
            output_truncated,
            elapsed_secs,
        }) => {
            let mut envelope = error_envelope(&error);
            envelope["output"] = json!(output);
            envelope["meta"] = json!({
                "elapsed_secs": elapsed_secs,
                "output_truncated": output_truncated,
            });
            envelope
        }
        Err(e) => error_envelope(&e),
    }
}

/// `list_session_files` tool operation.
pub async fn list_session_files(manager: &SessionManager, session_id: &str, path: &str) -> Value {
    match manager.list_session_files(session_id, path).await {
        Ok(files) => json!({ "success": true, "files": files }),
        Err(e) => error_envelope(&e),
    }
}

/// `read_session_file` tool operation.
pub async fn read_session_file(manager: &SessionManager, session_id: &str, path: &str) -> Value {
    match manager.read_session_file(session_id, path).await {
        Ok(content) => json!({ "success": true, "content": content }),
        Err(e) => error_envelope(&e),
    }
}

/// `write_session_file` tool operation.
pub async fn write_session_file(
    manager: &SessionManager,
    session_id: &str,
    path: &str,
    content: &str,
) -> Value {
    match manager.write_session_file(session_id, path, content).await {
        Ok(()) => json!({
            "success": true,
            "message": format!("Successfully wrote to {path}"),
        }),
        Err(e) => error_envelope(&e),
    }
}

/// `install_package` tool operation. Templates the install command for the
/// session's guest backend and runs it as an ordinary `execute_in_session`
/// call; no dedicated guest-side code path is needed.
///
/// The stateless (Python) backend installs via `pip`, ignoring `source`
/// (there is no CRAN/GitHub distinction for a Python package); the
/// persistent (R) backend honors `source` as `CRAN` or `GitHub`, matching
/// the two originals this tool is grounded on.
pub async fn install_package(
    manager: &SessionManager,
    session_id: &str,
    package_name: &str,
    source: &str,
) -> Value {
    if package_name.trim().is_empty() {
        return error_envelope(&Error::InvalidContent(
            "package name must be a non-empty string".to_string(),
        ));
    }

    let install_cmd = match manager.backend() {
        Backend::Stateless => {
            let quoted_package = serde_json::to_string(package_name)
                .unwrap_or_else(|_| format!("{package_name:?}"));
            format!(
                "import subprocess, sys\n\
                 subprocess.check_call([sys.executable, '-m', 'pip', 'install', {quoted_package}])\n\
                 print('Package installed successfully')"
            )
        }
        Backend::Persistent => match source.to_uppercase().as_str() {
            "CRAN" => format!(
                r#"install.packages("{package_name}", repos="https://cloud.r-project.org")"#
            ),
            "GITHUB" => format!(
                r#"remotes::install_github("{package_name}", auth_token=Sys.getenv("GITHUB_PAT"))"#
            ),
            _ => {
                return error_envelope(&Error::InvalidSource(format!(
                    "unknown install source '{source}', expected CRAN or GitHub"
                )))
            }
        },
    };

    match manager.execute_in_session(session_id, &install_cmd, None).await {
        Ok(ExecuteReport::Success(outcome)) => json!({
            "success": true,
            "message": format!("Installed {package_name}"),
            "output": outcome.output,
            "meta": {
                "elapsed_secs": outcome.elapsed_secs,
                "output_truncated": outcome.output_truncated,
            }
        }),
        Ok(ExecuteReport::Failure {
            error,
            output,
            output_truncated,
            elapsed_secs,
        }) => {
            let mut envelope = error_envelope(&error);
            envelope["output"] = json!(output);
            envelope["meta"] = json!({
                "elapsed_secs": elapsed_secs,
                "output_truncated": output_truncated,
            });
            envelope
        }
        Err(e) => error_envelope(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_carries_code_and_retryability() {
        let envelope = error_envelope(&Error::SessionNotFound("abc".to_string()));
        assert_eq!(envelope["success"], false);
        assert_eq!(envelope["error"]["code"], "session_not_found");
        assert_eq!(envelope["error"]["retryable"], false);
    }

    #[test]
    fn transport_errors_are_retryable_in_the_envelope() {
        let envelope = error_envelope(&Error::ExecutionTransport("reset".to_string()));
        assert_eq!(envelope["error"]["retryable"], true);
    }

    #[test]
    fn unknown_install_source_is_rejected() {
        let envelope = error_envelope(&Error::InvalidSource("bogus".to_string()));
        assert_eq!(envelope["error"]["code"], "invalid_source");
    }
}
