//! Process entry point: load configuration, connect to the container
//! runtime, and serve the tool surface over stdio as newline-delimited
//! JSON requests/responses.
//!
//! Framing is intentionally minimal — one JSON object per line in, one
//! JSON object per line out — since the richer protocol dispatch in front
//! of this process is out of scope here.

use serde_json::Value;
use session_manager_core::config::Config;
use session_manager_core::container_runtime::ContainerRuntime;
use session_manager_core::session_manager::SessionManager;
use session_manager_core::tool_surface;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    info!("starting session manager");

    let runtime = ContainerRuntime::connect(&config).await?;
    let sandbox_timeout = Duration::from_secs(config.sandbox_timeout_secs);
    let manager = Arc::new(SessionManager::new(config, runtime));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let reaper = manager.clone().spawn_reaper(sandbox_timeout, shutdown_rx);

    serve_stdio(manager.clone()).await;

    let _ = shutdown_tx.send(true);
    let _ = reaper.await;
    Ok(())
}

async fn serve_stdio(manager: Arc<SessionManager>) {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "failed to read stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = handle_request(&manager, &line).await;
        if let Err(e) = writeln!(stdout, "{response}") {
            error!(error = %e, "failed to write response");
            break;
        }
        let _ = stdout.flush();
    }
}

async fn handle_request(manager: &SessionManager, line: &str) -> String {
    let request: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            return serde_json::json!({
                "success": false,
                "error": {
                    "code": "invalid_content",
                    "message": format!("malformed request: {e}"),
                    "retryable": false,
                }
            })
            .to_string()
        }
    };

    let op = request["op"].as_str().unwrap_or_default();
    let result = match op {
        "create_session" => tool_surface::create_session(manager).await,
        "list_sessions" => {
            let include_inactive = request["include_inactive"].as_bool().unwrap_or(false);
            tool_surface::list_sessions(manager, include_inactive).await
        }
        "close_session" => {
            let session_id = request["session_id"].as_str().unwrap_or_default();
            tool_surface::close_session(manager, session_id).await
        }
        "execute_in_session" => {
            let session_id = request["session_id"].as_str().unwrap_or_default();
            let code = request["code"].as_str().unwrap_or_default();
            let limits = request.get("limits");
            tool_surface::execute_in_session(manager, session_id, code, limits).await
        }
        "list_session_files" => {
            let session_id = request["session_id"].as_str().unwrap_or_default();
            let path = request["path"].as_str().unwrap_or(".");
            tool_surface::list_session_files(manager, session_id, path).await
        }
        "read_session_file" => {
            let session_id = request["session_id"].as_str().unwrap_or_default();
            let path = request["path"].as_str().unwrap_or_default();
            tool_surface::read_session_file(manager, session_id, path).await
        }
        "write_session_file" => {
            let session_id = request["session_id"].as_str().unwrap_or_default();
            let path = request["path"].as_str().unwrap_or_default();
            let content = request["content"].as_str().unwrap_or_default();
            tool_surface::write_session_file(manager, session_id, path, content).await
        }
        "install_package" => {
            let session_id = request["session_id"].as_str().unwrap_or_default();
            let package_name = request["package_name"].as_str().unwrap_or_default();
            let source = request["source"].as_str().unwrap_or("CRAN");
            tool_surface::install_package(manager, session_id, package_name, source).await
        }
        other => serde_json::json!({
            "success": false,
            "error": {
                "code": "invalid_content",
                "message": format!("unknown operation '{other}'"),
                "retryable": false,
            }
        }),
    };

    result.to_string()
}
