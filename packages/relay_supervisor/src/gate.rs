use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Answers whether the upstream relay endpoint can accept a stream.
///
/// Every failure mode of the check maps to `false`; the supervisor treats
/// "not ready" as a reason to wait, never as an error.
#[async_trait]
pub trait DependencyGate: Send + Sync {
    async fn is_upstream_ready(&self) -> bool;
}

/// Gate for deployments without a local relay dependency.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReady;

#[async_trait]
impl DependencyGate for AlwaysReady {
    async fn is_upstream_ready(&self) -> bool {
        true
    }
}

/// Checks that a relay container is running via `docker inspect`.
#[derive(Debug, Clone)]
pub struct ContainerGate {
    container: String,
    docker_path: String,
    timeout: Duration,
}

impl ContainerGate {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            docker_path: "docker".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_docker_path(mut self, path: impl Into<String>) -> Self {
        self.docker_path = path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl DependencyGate for ContainerGate {
    async fn is_upstream_ready(&self) -> bool {
        let mut cmd = Command::new(&self.docker_path);
        cmd.args(["inspect", "-f", "{{.State.Running}}", &self.container])
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(container = %self.container, "Container check failed to run: {}", e);
                return false;
            }
            Err(_) => {
                warn!(
                    container = %self.container,
                    "Container check timed out after {:?}", self.timeout
                );
                return false;
            }
        };

        if !output.status.success() {
            debug!(
                container = %self.container,
                "Container check exited with {:?}",
                output.status.code()
            );
            return false;
        }

        String::from_utf8_lossy(&output.stdout).trim() == "true"
    }
}
