//! Owns the session table, the container lifecycle, and the reaper.

use crate::config::{Backend, Config, DbConfig};
use crate::container_runtime::{ContainerRuntime, ContainerSpec};
use crate::limits::ExecutionLimits;
use crate::path_policy::{normalize_session_path, SANDBOX_ROOT};
use crate::session::{GuestBackend, Session, SessionState};
use crate::transport::files::{self, FileEntry};
use crate::transport::persistent::{classify_guest_error, PersistentTransport};
use crate::transport::stateless::StatelessTransport;
use crate::transport::GuestTransport;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Default memory cap for a session container, in MiB.
const DEFAULT_MEMORY_MB: u64 = 512;
/// Default CPU period, matching the originals' `cpu_period=100000`.
const DEFAULT_CPU_PERIOD: i64 = 100_000;
/// Default CPU quota: half a core, matching the originals' `cpu_quota=50000`.
const DEFAULT_CPU_QUOTA: i64 = 50_000;
/// Grace period given to a container on `stop`, matching the originals'
/// `container.stop(timeout=1)`.
const STOP_GRACE: Duration = Duration::from_secs(1);
/// tmpfs size for `/tmp` inside every session container.
const TMP_TMPFS_OPTS: &str = "rw,noexec,nosuid,size=100M";
/// tmpfs size for `/sandbox` when no persistent workspace is configured.
const SANDBOX_TMPFS_OPTS: &str = "rw,noexec,nosuid,size=500M";

/// A live session plus the transport it was built with and the capacity
/// permit it holds. The permit is acquired before the (slow) container
/// create and released automatically when the entry is dropped, which is
/// what makes the `max_sandboxes` cap atomic across concurrent
/// `create_session` calls (see [`SessionManager::capacity`]).
struct SessionEntry {
    session: Session,
    transport: Arc<dyn GuestTransport>,
    _capacity_permit: OwnedSemaphorePermit,
}

/// Orchestrates session creation, execution, file I/O, and reaping.
///
/// The table is a single coarse `RwLock` around the `HashMap` (lookups are
/// cheap relative to guest round-trips); each session's own `Mutex` is held
/// for the duration of any guest-touching call, which is how `Busy` state
/// and per-session serialization are enforced (see the concurrency model).
pub struct SessionManager {
    config: Config,
    runtime: ContainerRuntime,
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionEntry>>>>,
    /// `max_sandboxes` permits, one per live session. Acquired with
    /// `try_acquire_owned` *before* the container-create await in
    /// `create_session`, so the cap check and the reservation happen as one
    /// atomic step instead of being split across a read-lock check and a
    /// later write-lock insert (which a second concurrent caller could slip
    /// between).
    capacity: Arc<Semaphore>,
}

impl SessionManager {
    /// Construct a manager bound to an already-connected container
    /// runtime. Callers typically build this once in `main` and share it
    /// via `Arc`.
    pub fn new(config: Config, runtime: ContainerRuntime) -> Self {
        let capacity = Arc::new(Semaphore::new(config.max_sandboxes));
        Self {
            config,
            runtime,
            sessions: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Guest transport backend this manager creates new sessions with.
    pub fn backend(&self) -> Backend {
        self.config.backend
    }

    /// Provision a new hardened session and insert it into the table.
    #[instrument(skip(self))]
    pub async fn create_session(&self) -> Result<SessionSummary> {
        let capacity_permit = self
            .capacity
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::MaxSessionsReached(self.config.max_sandboxes))?;

        let id = Uuid::new_v4().to_string();
        let container_name = format!("session-manager-{id}");

        let (env, extra_hosts) = db_env_and_host_aliases(&self.config.db);
        let (binds, tmpfs) = prepare_sandbox_mounts(self.config.workspace_root.as_deref(), &id).await?;

        // Stateless backends get no networking at all; persistent backends
        // need the default bridge (plus the host-gateway alias above) to
        // reach a DB on the host.
        let (command, publish_guest_port, network_mode) = match self.config.backend {
            Backend::Stateless => (
                Some(vec!["sleep".to_string(), "infinity".to_string()]),
                None,
                "none".to_string(),
            ),
            Backend::Persistent => (
                None,
                Some(self.config.evaluator_guest_port),
                "bridge".to_string(),
            ),
        };

        let spec = ContainerSpec {
            name: container_name,
            image: self.config.docker_image.clone(),
            env,
            binds,
            tmpfs,
            extra_hosts,
            publish_guest_port,
            command,
            network_mode,
        };

        let create_result = self
            .runtime
            .run(spec, DEFAULT_MEMORY_MB, DEFAULT_CPU_PERIOD, DEFAULT_CPU_QUOTA)
            .await;

        let (container_id, host_port) = match create_result {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "session creation failed");
                return Err(Error::SessionCreateFailed(e.to_string()));
            }
        };

        let (backend, transport): (GuestBackend, Arc<dyn GuestTransport>) = match self.config.backend
        {
            Backend::Stateless => (
                GuestBackend::Stateless,
                Arc::new(StatelessTransport::python3(self.runtime.clone())),
            ),
            Backend::Persistent => {
                let host_port = host_port.ok_or_else(|| {
                    Error::SessionCreateFailed(
                        "persistent backend did not yield a host port".to_string(),
                    )
                })?;
                (
                    GuestBackend::Persistent { host_port },
                    Arc::new(PersistentTransport::new(host_port)),
                )
            }
        };

        let session = Session::new(id.clone(), container_id, backend);
        let summary = SessionSummary::from_session(&session);

        let entry = Arc::new(Mutex::new(SessionEntry {
            session,
            transport,
            _capacity_permit: capacity_permit,
        }));
        self.sessions.write().await.insert(id.clone(), entry);

        info!(session_id = %id, "session created");
        Ok(summary)
    }

    /// Tear down a session's container and remove it from the table.
    /// Idempotent: a second close on an already-closed id returns
    /// `session_not_found`.
    #[instrument(skip(self))]
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        let entry = {
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(session_id)
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?
        };

        let mut guard = entry.lock().await;
        guard.session.state = SessionState::Closing;
        let container_id = guard.session.container_id.clone();

        let stop_result = self.runtime.stop(&container_id, STOP_GRACE).await;
        if let Err(e) = stop_result {
            warn!(session_id = %session_id, error = %e, "failed to stop container during close");
        }
        self.runtime.remove(&container_id).await?;

        guard.session.state = SessionState::Closed;
        info!(session_id = %session_id, "session closed");
        Ok(())
    }

    /// List sessions. When `include_inactive` is `false`, only sessions
    /// whose idle time is still under `sandbox_timeout` are returned; this
    /// is an independent snapshot filter from the reaper's own sweep
    /// cadence (see the design notes on this Open Question).
    pub async fn list_sessions(&self, include_inactive: bool) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut out = Vec::new();
        for entry in sessions.values() {
            let guard = entry.lock().await;
            if !include_inactive && guard.session.idle_secs() >= self.config.sandbox_timeout_secs as i64
            {
                continue;
            }
            out.push(SessionSummary::from_session(&guard.session));
        }
        out
    }

    /// Run `code` inside a session, enforcing `limits` (falling back to
    /// configured defaults).
    #[instrument(skip(self, code))]
    pub async fn execute_in_session(
        &self,
        session_id: &str,
        code: &str,
        limits_payload: Option<&serde_json::Value>,
    ) -> Result<ExecuteReport> {
        if code.is_empty() {
            return Err(Error::InvalidCode("code must be a non-empty string".to_string()));
        }
        if code.chars().count() > self.config.max_code_chars {
            return Err(Error::CodeTooLarge {
                len: code.chars().count(),
                max: self.config.max_code_chars,
            });
        }

        let limits = ExecutionLimits::from_payload(
            limits_payload,
            self.config.default_exec_timeout_secs,
            self.config.max_output_bytes,
        )?;

        let entry = self.lookup(session_id).await?;
        let mut guard = entry.lock().await;
        guard.session.state = SessionState::Busy;
        let container_id = guard.session.container_id.clone();
        let transport = guard.transport.clone();

        let started = Instant::now();
        let outcome = transport.execute(&container_id, code, limits).await;
        let elapsed_secs = started.elapsed().as_secs_f64();

        let result = match outcome {
            Ok(exec_outcome) => {
                let (output, output_truncated) =
                    truncate_utf8(&exec_outcome.output, limits.max_output_bytes);
                if let Some(guest_error) = exec_outcome.guest_error {
                    guard.session.record(false, elapsed_secs, code.chars().count());
                    Ok(ExecuteReport::Failure {
                        error: classify_guest_error(&guest_error, elapsed_secs),
                        output,
                        output_truncated,
                        elapsed_secs,
                    })
                } else {
                    guard.session.record(true, elapsed_secs, code.chars().count());
                    Ok(ExecuteReport::Success(ExecuteOutcome {
                        result: exec_outcome.result,
                        output,
                        elapsed_secs,
                        output_truncated,
                        exit_code: exec_outcome.exit_code,
                    }))
                }
            }
            Err(e) => {
                guard.session.record(false, elapsed_secs, code.chars().count());
                Err(e)
            }
        };

        guard.session.state = SessionState::Ready;
        result
    }

    /// List the contents of a guest-relative directory.
    pub async fn list_session_files(&self, session_id: &str, path: &str) -> Result<Vec<FileEntry>> {
        let absolute = normalize_session_path(path)?;
        let entry = self.lookup(session_id).await?;
        let mut guard = entry.lock().await;
        guard.session.state = SessionState::Busy;
        let container_id = guard.session.container_id.clone();
        let result = files::list_files(&self.runtime, &container_id, &absolute).await;
        guard.session.state = SessionState::Ready;
        if result.is_ok() {
            guard.session.record(result.is_ok(), 0.0, 0);
        }
        result
    }

    /// Read a guest-relative file's contents.
    pub async fn read_session_file(&self, session_id: &str, path: &str) -> Result<String> {
        let absolute = normalize_session_path(path)?;
        let entry = self.lookup(session_id).await?;
        let mut guard = entry.lock().await;
        guard.session.state = SessionState::Busy;
        let container_id = guard.session.container_id.clone();
        let result = files::read_file(
            &self.runtime,
            &container_id,
            &absolute,
            self.config.max_file_read_bytes,
        )
        .await;
        guard.session.state = SessionState::Ready;
        if result.is_ok() {
            guard.session.record(true, 0.0, 0);
        }
        result
    }

    /// Write `content` to a guest-relative path, creating parent
    /// directories as needed.
    pub async fn write_session_file(&self, session_id: &str, path: &str, content: &str) -> Result<()> {
        let absolute = normalize_session_path(path)?;
        let entry = self.lookup(session_id).await?;
        let mut guard = entry.lock().await;
        guard.session.state = SessionState::Busy;
        let container_id = guard.session.container_id.clone();
        let result = files::write_file(
            &self.runtime,
            &container_id,
            &absolute,
            content,
            self.config.max_file_write_bytes,
        )
        .await;
        guard.session.state = SessionState::Ready;
        if result.is_ok() {
            guard.session.record(true, 0.0, content.chars().count());
        }
        result
    }

    /// Close every session whose idle time exceeds `sandbox_timeout_secs`,
    /// skipping (and deferring) any session currently `Busy`.
    #[instrument(skip(self))]
    pub async fn reap_idle_sessions(&self) -> usize {
        let candidates: Vec<String> = {
            let sessions = self.sessions.read().await;
            let mut ids = Vec::new();
            for (id, entry) in sessions.iter() {
                let guard = entry.lock().await;
                if guard.session.state == SessionState::Busy {
                    continue;
                }
                if guard.session.idle_secs() >= self.config.sandbox_timeout_secs as i64 {
                    ids.push(id.clone());
                }
            }
            ids
        };

        let mut reaped = 0;
        for id in candidates {
            match self.close_session(&id).await {
                Ok(()) => {
                    reaped += 1;
                    info!(session_id = %id, "reaped idle session");
                }
                Err(Error::SessionNotFound(_)) => {
                    // Raced with a concurrent close or an earlier sweep; fine.
                }
                Err(e) => warn!(session_id = %id, error = %e, "failed to reap idle session"),
            }
        }
        reaped
    }

    /// Spawn a background task that calls [`reap_idle_sessions`] on every
    /// tick of `interval`, until `shutdown` is signaled true.
    pub fn spawn_reaper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(?interval, "starting session reaper");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = self.reap_idle_sessions().await;
                        if reaped > 0 {
                            info!(reaped, "session reaper swept idle sessions");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("shutting down session reaper");
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn lookup(&self, session_id: &str) -> Result<Arc<Mutex<SessionEntry>>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }
}

/// Build the guest environment variables and `extra_hosts` entries for a
/// session's database connection, rewriting a loopback `DB_HOST` to the
/// runtime's host-gateway alias so the guest can dial the host's database.
/// Pure and Docker-free so it can be unit tested directly.
fn db_env_and_host_aliases(db: &DbConfig) -> (Vec<String>, Vec<String>) {
    let mut env = Vec::new();
    let mut extra_hosts = Vec::new();
    if db.host.is_empty() {
        return (env, extra_hosts);
    }

    let db_host = if matches!(db.host.as_str(), "localhost" | "127.0.0.1") {
        extra_hosts.push("host.docker.internal:host-gateway".to_string());
        "host.docker.internal".to_string()
    } else {
        db.host.clone()
    };

    env.push(format!("DB_HOST={db_host}"));
    env.push(format!("DB_PORT={}", db.port));
    env.push(format!("DB_USER={}", db.user));
    env.push(format!("DB_PASSWORD={}", db.password));
    env.push(format!("DB_NAME={}", db.name));
    (env, extra_hosts)
}

/// Prepare the sandbox root mount for a new session: a read-write bind
/// mount into `<workspace_root>/<id>` on the host (created if missing) when
/// workspace persistence is configured, otherwise a size-capped tmpfs.
/// `/tmp` always gets its own tmpfs regardless.
async fn prepare_sandbox_mounts(
    workspace_root: Option<&str>,
    session_id: &str,
) -> Result<(Vec<String>, HashMap<String, String>)> {
    let mut binds = Vec::new();
    let mut tmpfs = HashMap::new();
    tmpfs.insert("/tmp".to_string(), TMP_TMPFS_OPTS.to_string());
    match workspace_root {
        Some(workspace_root) => {
            let session_dir = format!("{workspace_root}/{session_id}");
            tokio::fs::create_dir_all(&session_dir).await?;
            binds.push(format!("{session_dir}:{SANDBOX_ROOT}"));
        }
        None => {
            tmpfs.insert(SANDBOX_ROOT.to_string(), SANDBOX_TMPFS_OPTS.to_string());
        }
    }
    Ok((binds, tmpfs))
}

/// Truncate `s` to at most `max_bytes` UTF-8 bytes without splitting a code
/// point, returning the (possibly truncated) string and whether truncation
/// occurred.
fn truncate_utf8(s: &str, max_bytes: usize) -> (String, bool) {
    if s.len() <= max_bytes {
        return (s.to_string(), false);
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    (s[..end].to_string(), true)
}

/// Outcome of an `execute_in_session` call whose guest round-trip
/// completed (as opposed to a validation or transport error, which is
/// returned as `Err` by the caller). Distinguishes a clean success from a
/// guest-reported failure, the latter still carrying whatever output was
/// captured before the failure.
#[derive(Debug, Clone)]
pub enum ExecuteReport {
    /// The guest evaluated the code without error.
    Success(ExecuteOutcome),
    /// The guest reported an error (a caught exception, or its own elapsed
    /// time limit firing); `output` is the output captured up to that
    /// point.
    Failure {
        /// Classified as `execution_timeout` or `execution_error`.
        error: Error,
        /// Output captured before the guest reported failure.
        output: String,
        /// Whether `output` was truncated to the output limit.
        output_truncated: bool,
        /// Wall-clock time the call took, in seconds, before the guest
        /// reported failure (e.g. how long it ran before its own
        /// elapsed-time limit fired).
        elapsed_secs: f64,
    },
}

/// Result of a successful `execute_in_session` call.
#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    /// Guest-reported result value, if any.
    pub result: Option<String>,
    /// Captured output, truncated to the effective output limit.
    pub output: String,
    /// Wall-clock time the call took, in seconds.
    pub elapsed_secs: f64,
    /// Whether `output` was truncated from its original length.
    pub output_truncated: bool,
    /// Process exit status, for backends that exec a process per call;
    /// `None` for the persistent backend.
    pub exit_code: Option<i64>,
}

/// Caller-facing view of a [`Session`], independent of its internal
/// representation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSummary {
    /// Session id.
    pub session_id: String,
    /// Creation timestamp, RFC 3339.
    pub created_at: String,
    /// Last-used timestamp, RFC 3339.
    pub last_used: String,
    /// Host port for the persistent evaluator, if this is a persistent
    /// session.
    pub host_port: Option<u16>,
}

impl SessionSummary {
    fn from_session(session: &Session) -> Self {
        let host_port = match session.backend {
            GuestBackend::Persistent { host_port } => Some(host_port),
            GuestBackend::Stateless => None,
        };
        Self {
            session_id: session.id.clone(),
            created_at: session.created_at.to_rfc3339(),
            last_used: session.last_used.to_rfc3339(),
            host_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_utf8_respects_char_boundaries() {
        let s = "héllo"; // 'é' is 2 bytes
        let (truncated, was_truncated) = truncate_utf8(s, 2);
        assert!(was_truncated);
        assert!(truncated.is_char_boundary(truncated.len()));
    }

    #[test]
    fn truncate_utf8_leaves_short_strings_alone() {
        let (out, truncated) = truncate_utf8("hi", 100);
        assert_eq!(out, "hi");
        assert!(!truncated);
    }

    #[test]
    fn empty_db_host_yields_no_env_or_aliases() {
        let (env, extra_hosts) = db_env_and_host_aliases(&DbConfig::default());
        assert!(env.is_empty());
        assert!(extra_hosts.is_empty());
    }

    #[test]
    fn loopback_db_host_is_rewritten_to_host_gateway() {
        let db = DbConfig {
            host: "127.0.0.1".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "hunter2".to_string(),
            name: "app".to_string(),
        };
        let (env, extra_hosts) = db_env_and_host_aliases(&db);
        assert!(env.contains(&"DB_HOST=host.docker.internal".to_string()));
        assert_eq!(extra_hosts, vec!["host.docker.internal:host-gateway".to_string()]);
    }

    #[test]
    fn non_loopback_db_host_passes_through_unchanged() {
        let db = DbConfig {
            host: "db.internal.example".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "hunter2".to_string(),
            name: "app".to_string(),
        };
        let (env, extra_hosts) = db_env_and_host_aliases(&db);
        assert!(env.contains(&"DB_HOST=db.internal.example".to_string()));
        assert!(extra_hosts.is_empty());
    }

    #[tokio::test]
    async fn no_workspace_root_mounts_sandbox_as_tmpfs() {
        let (binds, tmpfs) = prepare_sandbox_mounts(None, "session-1").await.unwrap();
        assert!(binds.is_empty());
        assert!(tmpfs.contains_key(SANDBOX_ROOT));
        assert!(tmpfs.contains_key("/tmp"));
    }

    #[tokio::test]
    async fn workspace_root_creates_session_dir_and_binds_it() {
        let workspace = tempfile::tempdir().unwrap();
        let workspace_root = workspace.path().to_str().unwrap();

        let (binds, tmpfs) = prepare_sandbox_mounts(Some(workspace_root), "session-2")
            .await
            .unwrap();

        let expected_dir = workspace.path().join("session-2");
        assert!(expected_dir.is_dir());
        assert_eq!(binds, vec![format!("{}:{SANDBOX_ROOT}", expected_dir.display())]);
        assert!(!tmpfs.contains_key(SANDBOX_ROOT));
        assert!(tmpfs.contains_key("/tmp"));
    }
}
