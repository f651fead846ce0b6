//! Container provisioning and teardown via the Docker API

use crate::error::{GateError, Result};
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long to wait after starting a container for the in-container service
/// to begin listening. Connecting earlier can get the relay reset.
const STARTUP_GRACE: Duration = Duration::from_millis(200);

/// Seconds the engine waits for a container to stop before killing it
const STOP_TIMEOUT_SECS: i64 = 5;

/// Process-count cap applied when the caller does not set one. Untrusted
/// sessions never run uncapped; a fork bomb stops here.
const DEFAULT_PIDS_LIMIT: i64 = 20;

/// What to provision: an image plus an optional loopback port binding.
///
/// The gatekeeper always binds `container_port` to an allocated host port;
/// the control-plane API may spawn unbound containers.
#[derive(Debug, Clone)]
pub struct ProvisionSpec {
    pub image: String,
    pub container_port: Option<u16>,
    pub host_port: Option<u16>,
    pub pids_limit: Option<i64>,
    pub name: Option<String>,
    pub cmd: Option<Vec<String>>,
}

impl ProvisionSpec {
    /// Spec for a gatekeeper session container with a loopback port binding
    pub fn bound(image: &str, container_port: u16, host_port: u16, pids_limit: Option<i64>) -> Self {
        Self {
            image: image.to_string(),
            container_port: Some(container_port),
            host_port: Some(host_port),
            pids_limit,
            name: None,
            cmd: None,
        }
    }

    /// The cap actually passed to the engine: the caller's, or
    /// [`DEFAULT_PIDS_LIMIT`] when unset
    pub fn effective_pids_limit(&self) -> i64 {
        self.pids_limit.unwrap_or(DEFAULT_PIDS_LIMIT)
    }
}

/// A provisioned, started container
#[derive(Debug, Clone)]
pub struct Provisioned {
    /// Opaque identifier from the container engine
    pub container_id: String,
    /// Display-only prefix of the container id
    pub short_id: String,
    /// Host port the container's service port is bound to, if any
    pub host_port: Option<u16>,
}

/// Client for the local container engine
pub struct Engine {
    client: Docker,
}

/// Wrapper to share the engine across tasks
pub type SharedEngine = Arc<Engine>;

impl Engine {
    /// Connect to the Docker daemon and verify it responds.
    ///
    /// Connection priority:
    /// 1. Explicit `docker_host` from configuration
    /// 2. DOCKER_HOST environment variable
    /// 3. Platform socket defaults
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!("Failed to connect via DOCKER_HOST='{}': {}", host, e)
            })?
        } else {
            Docker::connect_with_socket_defaults()
                .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e))?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    /// Build a client without verifying the daemon responds.
    ///
    /// Useful where the first real call is allowed to fail, such as
    /// best-effort teardown of an identifier that may already be gone.
    pub fn lazy(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = match docker_host {
            Some(host) => Self::connect_to_host(host)?,
            None => Docker::connect_with_socket_defaults()
                .map_err(|e| anyhow::anyhow!("Cannot build Docker client: {}", e))?,
        };
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    /// Create and start a container, then wait a short grace period for the
    /// in-container service to come up.
    ///
    /// Port bindings are always on 127.0.0.1, never on all interfaces, so
    /// only the local relay can reach the container.
    pub async fn provision(&self, spec: &ProvisionSpec) -> Result<Provisioned> {
        let mut host_config = HostConfig {
            pids_limit: Some(spec.effective_pids_limit()),
            ..Default::default()
        };

        let mut exposed_ports: Option<HashMap<String, HashMap<(), ()>>> = None;
        if let Some(container_port) = spec.container_port {
            let port_key = format!("{}/tcp", container_port);

            let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
            port_bindings.insert(
                port_key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: spec.host_port.map(|p| p.to_string()),
                }]),
            );
            host_config.port_bindings = Some(port_bindings);

            let mut exposed = HashMap::new();
            exposed.insert(port_key, HashMap::new());
            exposed_ports = Some(exposed);
        }

        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: spec.cmd.clone(),
            exposed_ports,
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| format!("cellgate-{}", &Uuid::new_v4().simple().to_string()[..12]));
        let create_options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await?;
        let container_id = response.id;
        let short_id = short_id(&container_id);

        debug!(container_id = %short_id, name, image = %spec.image, "Created container");

        if let Err(e) = self
            .client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            // don't leave a created-but-unstartable container behind
            self.teardown(&container_id).await;
            return Err(GateError::Engine(e));
        }

        info!(
            container_id = %short_id,
            image = %spec.image,
            host_port = spec.host_port,
            "Started container"
        );

        // wait slightly for the service inside, otherwise the first
        // connection may get reset
        tokio::time::sleep(STARTUP_GRACE).await;

        Ok(Provisioned {
            container_id,
            short_id,
            host_port: spec.host_port,
        })
    }

    /// Stop and remove a container, best effort.
    ///
    /// Failures in either step are logged and swallowed so cleanup can never
    /// wedge a connection handler; a stop failure does not skip the remove.
    pub async fn teardown(&self, container_id: &str) {
        let sid = short_id(container_id);

        let stop_options = StopContainerOptions { t: STOP_TIMEOUT_SECS };
        match self.client.stop_container(container_id, Some(stop_options)).await {
            Ok(_) => debug!(container_id = %sid, "Stopped container"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id = %sid, "Container was already stopped");
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id = %sid, "Container not found");
            }
            Err(e) => warn!(container_id = %sid, error = %e, "Failed to stop container"),
        }

        let remove_options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self
            .client
            .remove_container(container_id, Some(remove_options))
            .await
        {
            Ok(_) => debug!(container_id = %sid, "Removed container"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id = %sid, "Container not found");
            }
            Err(e) => warn!(container_id = %sid, error = %e, "Failed to remove container"),
        }
    }
}

#[cfg(test)]
impl Engine {
    /// Client that points at an unreachable endpoint without pinging it, for
    /// tests that only exercise best-effort teardown paths.
    pub(crate) fn disconnected() -> SharedEngine {
        Arc::new(Self::lazy(Some("tcp://127.0.0.1:1")).expect("unreachable docker client"))
    }
}

/// Display-only prefix of a container id, as shown by `docker ps`
pub fn short_id(container_id: &str) -> String {
    container_id.chars().take(12).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_truncates() {
        let id = "0123456789abcdef0123456789abcdef";
        assert_eq!(short_id(id), "0123456789ab");
    }

    #[test]
    fn test_short_id_of_short_input() {
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_bound_spec() {
        let spec = ProvisionSpec::bound("echo-server", 80, 49152, Some(20));
        assert_eq!(spec.image, "echo-server");
        assert_eq!(spec.container_port, Some(80));
        assert_eq!(spec.host_port, Some(49152));
        assert_eq!(spec.pids_limit, Some(20));
        assert!(spec.name.is_none());
        assert!(spec.cmd.is_none());
    }

    #[test]
    fn test_connect_to_host_rejects_bad_scheme() {
        assert!(Engine::connect_to_host("ftp://nope").is_err());
    }

    #[test]
    fn test_pids_limit_defaults_when_unset() {
        let spec = ProvisionSpec::bound("echo-server", 80, 49152, None);
        assert_eq!(spec.effective_pids_limit(), 20);

        let spec = ProvisionSpec::bound("echo-server", 80, 49152, Some(64));
        assert_eq!(spec.effective_pids_limit(), 64);
    }
}
