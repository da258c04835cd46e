//! Thin wrapper around the Docker-API-compatible container runtime.
//!
//! This is the only module that talks to `bollard` directly. Everything
//! above it (the session manager, the guest transports) goes through the
//! narrow surface defined here: run a hardened container, exec an argv
//! list in it, get/put a file archive, stop and remove it.

use crate::config::Config;
use crate::{Error, Result};
use bollard::container::{Config as ContainerConfig, CreateContainerOptions, LogsOptions};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{HostConfig, PortBinding};
use bollard::query_parameters::{
    DownloadFromContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Grace period given to a container `stop()` issued as cleanup after a
/// partial `run()` failure (the container started but a later setup step
/// failed). Matches the session manager's own close-time grace.
const CLEANUP_STOP_GRACE: Duration = Duration::from_secs(1);

/// Whether a bollard error is the daemon reporting "no such container" —
/// the expected shape of a race against Docker's own `auto_remove`, not a
/// real failure.
fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == 404
    )
}

/// Hardening and identity parameters for a single container, derived from
/// [`Config`] plus the per-session pieces (container name, env, mounts)
/// that the session manager fills in.
pub struct ContainerSpec {
    /// Unique container name.
    pub name: String,
    /// Image tag to run.
    pub image: String,
    /// Environment variables passed to the guest.
    pub env: Vec<String>,
    /// Bind mounts, each already formatted as `host:container[:ro]`.
    pub binds: Vec<String>,
    /// tmpfs mounts, each `container_path -> mount options string`.
    pub tmpfs: HashMap<String, String>,
    /// Host alias entries (`hostname:ip`), used for the DB loopback rewrite.
    pub extra_hosts: Vec<String>,
    /// Guest port to publish to an ephemeral host port, if any (persistent
    /// backend only).
    pub publish_guest_port: Option<u16>,
    /// Foreground command to run instead of the image's default entrypoint
    /// (stateless backend keeps the container alive without its own
    /// server loop).
    pub command: Option<Vec<String>>,
    /// Docker network mode, e.g. `"none"` (stateless backend: no
    /// networking at all) or `"bridge"` (persistent backend: default
    /// bridge, needed to reach the host DB over the host-gateway alias).
    pub network_mode: String,
}

/// Thin, cloneable handle to the container runtime.
#[derive(Clone)]
pub struct ContainerRuntime {
    docker: Arc<Docker>,
}

impl ContainerRuntime {
    /// Connect to the configured Docker daemon.
    #[instrument(skip_all)]
    pub async fn connect(config: &Config) -> Result<Self> {
        let docker = match &config.docker_host {
            Some(host) => Docker::connect_with_socket_defaults().map_err(|_| {
                Error::SessionCreateFailed(format!("could not connect to DOCKER_HOST '{host}'"))
            })?,
            None => Docker::connect_with_local_defaults().map_err(|e| {
                Error::SessionCreateFailed(format!("failed to connect to docker daemon: {e}"))
            })?,
        };

        match docker.version().await {
            Ok(version) => info!(
                version = ?version.version,
                api_version = ?version.api_version,
                "connected to docker daemon"
            ),
            Err(e) => warn!(error = %e, "connected but could not fetch docker version"),
        }

        Ok(Self {
            docker: Arc::new(docker),
        })
    }

    /// Create and start a hardened container from `spec`. Returns the
    /// container id and, when a guest port was requested to be published,
    /// the host port it was mapped to.
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn run(
        &self,
        spec: ContainerSpec,
        memory_mb: u64,
        cpu_period: i64,
        cpu_quota: i64,
    ) -> Result<(String, Option<u16>)> {
        let mut host_config = HostConfig {
            memory: Some((memory_mb * 1_048_576) as i64),
            cpu_period: Some(cpu_period),
            cpu_quota: Some(cpu_quota),
            binds: Some(spec.binds),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            readonly_rootfs: Some(true),
            auto_remove: Some(true),
            network_mode: Some(spec.network_mode.clone()),
            ..Default::default()
        };

        if !spec.tmpfs.is_empty() {
            host_config.tmpfs = Some(spec.tmpfs);
        }
        if !spec.extra_hosts.is_empty() {
            host_config.extra_hosts = Some(spec.extra_hosts);
        }

        let mut exposed_ports = None;
        if let Some(guest_port) = spec.publish_guest_port {
            let key = format!("{guest_port}/tcp");
            host_config.port_bindings = Some(HashMap::from([(
                key.clone(),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: None,
                }]),
            )]));
            host_config.publish_all_ports = Some(false);
            let mut ports = HashMap::new();
            ports.insert(key, HashMap::new());
            exposed_ports = Some(ports);
        }

        let container_config = ContainerConfig {
            image: Some(spec.image.clone()),
            env: Some(spec.env),
            cmd: spec.command,
            user: Some("1000".to_string()),
            host_config: Some(host_config),
            exposed_ports,
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to create container");
                Error::SessionCreateFailed(format!("failed to create container: {e}"))
            })?;
        let container_id = response.id;

        if let Err(e) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions>)
            .await
        {
            error!(error = %e, container_id = %container_id, "failed to start container");
            // The container exists but never ran; best-effort remove it
            // before surfacing the error rather than leaking it (see
            // "Any failure after step 5 must stop and remove the
            // container before surfacing the error").
            self.best_effort_remove(&container_id).await;
            return Err(Error::SessionCreateFailed(format!(
                "failed to start container: {e}"
            )));
        }

        let host_port = if let Some(guest_port) = spec.publish_guest_port {
            match self.discover_host_port(&container_id, guest_port).await {
                Ok(port) => Some(port),
                Err(e) => {
                    warn!(
                        error = %e,
                        container_id = %container_id,
                        "host port discovery failed; tearing down container"
                    );
                    // The container is running at this point; stop it
                    // before removing so the same cleanup contract holds
                    // as for any other post-creation failure.
                    if let Err(stop_err) = self.stop(&container_id, CLEANUP_STOP_GRACE).await {
                        warn!(error = %stop_err, container_id = %container_id, "failed to stop container during create-failure cleanup");
                    }
                    self.best_effort_remove(&container_id).await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        info!(container_id = %container_id, host_port = ?host_port, "container started");
        Ok((container_id, host_port))
    }

    /// Remove a container, logging (but not propagating) any failure.
    /// Used to clean up after a partial `run()` failure, where the caller
    /// is already about to return the original error.
    async fn best_effort_remove(&self, container_id: &str) {
        if let Err(e) = self.remove(container_id).await {
            warn!(error = %e, container_id = %container_id, "failed to remove container during create-failure cleanup");
        }
    }

    /// Re-inspect a just-started container to discover the ephemeral host
    /// port bound to `guest_port`.
    async fn discover_host_port(&self, container_id: &str, guest_port: u16) -> Result<u16> {
        let info = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Error::SessionCreateFailed(format!("failed to inspect container: {e}")))?;

        let key = format!("{guest_port}/tcp");
        let port_str = info
            .network_settings
            .and_then(|ns| ns.ports)
            .and_then(|ports| ports.get(&key).cloned().flatten())
            .and_then(|bindings| bindings.into_iter().next())
            .and_then(|binding| binding.host_port)
            .ok_or_else(|| {
                Error::SessionCreateFailed(format!(
                    "container did not publish a host port for {key}"
                ))
            })?;

        port_str
            .parse()
            .map_err(|_| Error::SessionCreateFailed(format!("malformed host port '{port_str}'")))
    }

    /// Run an argv command inside a container and return its combined
    /// output and exit code. Never touches a shell; `argv[0]` is exec'd
    /// directly.
    #[instrument(skip(self, argv))]
    pub async fn exec(&self, container_id: &str, argv: &[String]) -> Result<(String, i64)> {
        let exec_config = CreateExecOptions {
            cmd: Some(argv.iter().map(|s| s.as_str()).collect()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(container_id, exec_config)
            .await
            .map_err(|e| Error::ExecutionTransport(format!("failed to create exec: {e}")))?;

        let start_results = self
            .docker
            .start_exec(&exec.id, Some(StartExecOptions::default()))
            .await
            .map_err(|e| Error::ExecutionTransport(format!("failed to start exec: {e}")))?;

        let mut output = String::new();
        if let StartExecResults::Attached { mut output: stream, .. } = start_results {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(log) => output.push_str(&log.to_string()),
                    Err(e) => {
                        return Err(Error::ExecutionTransport(format!(
                            "exec output stream error: {e}"
                        )))
                    }
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| Error::ExecutionTransport(format!("failed to inspect exec: {e}")))?;
        let exit_code = inspect.exit_code.unwrap_or(-1);

        Ok((output, exit_code))
    }

    /// Fetch a single file out of the container as a tar stream and return
    /// the raw archive bytes.
    #[instrument(skip(self))]
    pub async fn download_archive(&self, container_id: &str, path: &str) -> Result<Vec<u8>> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = self.docker.download_from_container(container_id, Some(options));
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                Error::ReadFileFailed(format!("failed to download archive from {path}: {e}"))
            })?;
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }

    /// Upload a tar archive into the container at `dest_dir`.
    #[instrument(skip(self, tar_bytes))]
    pub async fn upload_archive(
        &self,
        container_id: &str,
        dest_dir: &str,
        tar_bytes: Vec<u8>,
    ) -> Result<()> {
        let options = UploadToContainerOptions {
            path: dest_dir.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(container_id, Some(options), tar_bytes.into())
            .await
            .map_err(|e| Error::WriteFileFailed(format!("failed to upload archive to {dest_dir}: {e}")))
    }

    /// Stop a container with a short grace period.
    #[instrument(skip(self))]
    pub async fn stop(&self, container_id: &str, grace: std::time::Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: Some(grace.as_secs() as i32),
            signal: None,
        };
        self.docker
            .stop_container(container_id, Some(options))
            .await
            .map_err(|e| Error::SessionCloseFailed(format!("failed to stop container: {e}")))
    }

    /// Remove a (stopped) container and its volumes.
    ///
    /// With `auto_remove: true` set at creation, Docker may already have
    /// removed the container by the time this runs (e.g. after `stop()`
    /// races the daemon's own cleanup); a 404 from the daemon is treated
    /// as success rather than an error.
    #[instrument(skip(self))]
    pub async fn remove(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            link: false,
        };
        match self.docker.remove_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::SessionCloseFailed(format!("failed to remove container: {e}"))),
        }
    }

    /// Fetch the tail of a container's combined stdout/stderr log, mostly
    /// useful for diagnosing a session-creation failure after the fact.
    #[instrument(skip(self))]
    pub async fn tail_logs(&self, container_id: &str, tail_lines: usize) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail_lines.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(container_id, Some(options));
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => out.push_str(&log.to_string()),
                Err(e) => {
                    debug!(error = %e, "error reading container logs");
                    break;
                }
            }
        }
        Ok(out)
    }
}
