//! Container runtime adapter
//!
//! Shells out to a podman-compatible CLI. Any binary that accepts the same
//! `ps`/`run`/`start`/`stop`/`rm` arguments (e.g. `docker`) works.

use crate::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use tokio::process::Command;
use tracing::debug;

/// Observed state of a named container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    /// No container with this name exists
    Absent,
    /// Container exists but is not running
    Stopped,
    /// Container is running
    Running,
}

/// Parameters for creating a detached container
#[derive(Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Environment variables
    pub env: Vec<(String, String)>,
    /// Published host port
    pub host_port: u16,
    /// Port inside the container
    pub container_port: u16,
}

impl fmt::Debug for ContainerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // env carries credentials
        let keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("ContainerSpec")
            .field("name", &self.name)
            .field("image", &self.image)
            .field("env", &keys)
            .field("host_port", &self.host_port)
            .field("container_port", &self.container_port)
            .finish()
    }
}

impl ContainerSpec {
    /// Arguments for `<runtime> run`
    #[must_use]
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--name".to_string(), self.name.clone()];
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push("-p".to_string());
        args.push(format!("{}:{}", self.host_port, self.container_port));
        args.push("-d".to_string());
        args.push(self.image.clone());
        args
    }
}

/// Lifecycle operations on named containers
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Look up a container by exact name
    async fn status(&self, name: &str) -> Result<ContainerStatus>;

    /// Create and start a detached container
    async fn run(&self, spec: &ContainerSpec) -> Result<()>;

    /// Start an existing, stopped container
    async fn start(&self, name: &str) -> Result<()>;

    /// Stop a running container
    async fn stop(&self, name: &str) -> Result<()>;

    /// Remove a stopped container
    async fn remove(&self, name: &str) -> Result<()>;
}

/// `podman` (or compatible) CLI runtime
#[derive(Debug, Clone)]
pub struct PodmanRuntime {
    binary: String,
}

impl Default for PodmanRuntime {
    fn default() -> Self {
        Self::new("podman")
    }
}

impl PodmanRuntime {
    /// Use the given runtime binary
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Runtime binary name
    #[must_use]
    pub fn binary(&self) -> &str {
        &self.binary
    }

    async fn invoke(&self, args: &[String]) -> Result<String> {
        debug!(binary = %self.binary, command = ?args.first(), "invoking container runtime");
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Runtime(format!("failed to spawn {}: {e}", self.binary)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(Error::Runtime(format!(
                "{} {} exited with {}: {}",
                self.binary,
                args.first().map_or("", String::as_str),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    async fn status(&self, name: &str) -> Result<ContainerStatus> {
        let args = [
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            format!("name=^{name}$"),
            "--format".to_string(),
            "{{.State}}".to_string(),
        ];
        let stdout = self.invoke(&args).await?;
        Ok(parse_status(&stdout))
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<()> {
        self.invoke(&spec.run_args()).await.map(drop)
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.invoke(&["start".to_string(), name.to_string()])
            .await
            .map(drop)
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.invoke(&["stop".to_string(), name.to_string()])
            .await
            .map(drop)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.invoke(&["rm".to_string(), name.to_string()])
            .await
            .map(drop)
    }
}

/// Interpret `ps --format {{.State}}` output
fn parse_status(stdout: &str) -> ContainerStatus {
    match stdout.lines().map(str::trim).find(|line| !line.is_empty()) {
        None => ContainerStatus::Absent,
        Some(state) if state.eq_ignore_ascii_case("running") || state.starts_with("Up") => {
            ContainerStatus::Running
        }
        Some(_) => ContainerStatus::Stopped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status(""), ContainerStatus::Absent);
        assert_eq!(parse_status("\n"), ContainerStatus::Absent);
        assert_eq!(parse_status("running\n"), ContainerStatus::Running);
        assert_eq!(parse_status("Up 3 minutes"), ContainerStatus::Running);
        assert_eq!(parse_status("exited\n"), ContainerStatus::Stopped);
        assert_eq!(parse_status("created"), ContainerStatus::Stopped);
    }

    #[test]
    fn test_run_args() {
        let spec = ContainerSpec {
            name: "postgres-test".to_string(),
            image: "postgres:latest".to_string(),
            env: vec![("POSTGRES_PASSWORD".to_string(), "postgres".to_string())],
            host_port: 5432,
            container_port: 5432,
        };

        assert_eq!(
            spec.run_args(),
            vec![
                "run",
                "--name",
                "postgres-test",
                "-e",
                "POSTGRES_PASSWORD=postgres",
                "-p",
                "5432:5432",
                "-d",
                "postgres:latest"
            ]
        );
    }

    #[test]
    fn test_spec_debug_hides_values() {
        let spec = ContainerSpec {
            name: "m".to_string(),
            image: "mariadb".to_string(),
            env: vec![("MYSQL_ROOT_PASSWORD".to_string(), "hunter2".to_string())],
            host_port: 3306,
            container_port: 3306,
        };
        let rendered = format!("{spec:?}");
        assert!(rendered.contains("MYSQL_ROOT_PASSWORD"));
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_runtime_error() {
        let runtime = PodmanRuntime::new("definitely-not-a-container-runtime");
        let err = runtime.status("x").await.unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
    }
}
