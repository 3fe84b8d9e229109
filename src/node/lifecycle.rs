//! Process-lifecycle collaborator for managed endpoints.
//!
//! Managed endpoints run as local containers (typically an anvil fork).
//! The endpoint only needs four questions answered; `DockerCli` answers
//! them by shelling out to the docker CLI.

use crate::config::PortMapping;
use async_trait::async_trait;
use std::collections::BTreeSet;
use tokio::process::Command;
use tracing::debug;

#[async_trait]
pub trait ProcessManager: Send + Sync {
    async fn start(
        &self,
        name: &str,
        image: &str,
        ports: &[PortMapping],
        args: &[String],
    ) -> anyhow::Result<()>;

    async fn stop(&self, name: &str) -> anyhow::Result<()>;

    async fn exists(&self, name: &str) -> anyhow::Result<bool>;

    async fn port_bindings_match(&self, name: &str, ports: &[PortMapping]) -> anyhow::Result<bool>;
}

/// Docker CLI backed process manager.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[String]) -> anyhow::Result<String> {
        debug!(binary = %self.binary, args = ?args, "docker");
        let output = Command::new(&self.binary).args(args).output().await?;
        if !output.status.success() {
            anyhow::bail!(
                "{} {} failed: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ProcessManager for DockerCli {
    async fn start(
        &self,
        name: &str,
        image: &str,
        ports: &[PortMapping],
        args: &[String],
    ) -> anyhow::Result<()> {
        let mut cmd = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];
        for p in ports {
            cmd.push("-p".to_string());
            cmd.push(format!("{}:{}", p.host, p.container));
        }
        cmd.push(image.to_string());
        cmd.extend(args.iter().cloned());
        self.run(&cmd).await.map(|_| ())
    }

    async fn stop(&self, name: &str) -> anyhow::Result<()> {
        self.run(&["rm".to_string(), "-f".to_string(), name.to_string()])
            .await
            .map(|_| ())
    }

    async fn exists(&self, name: &str) -> anyhow::Result<bool> {
        let out = self
            .run(&[
                "ps".to_string(),
                "-a".to_string(),
                "--filter".to_string(),
                format!("name=^/{name}$"),
                "--format".to_string(),
                "{{.Names}}".to_string(),
            ])
            .await?;
        Ok(out.lines().any(|l| l.trim() == name))
    }

    async fn port_bindings_match(&self, name: &str, ports: &[PortMapping]) -> anyhow::Result<bool> {
        let out = self.run(&["port".to_string(), name.to_string()]).await?;
        let wanted: BTreeSet<PortMapping> = ports.iter().copied().collect();
        Ok(parse_port_bindings(&out) == wanted)
    }
}

/// Parse `docker port` output ("8545/tcp -> 0.0.0.0:8545"). IPv4 and IPv6
/// lines for the same binding collapse into one entry.
pub fn parse_port_bindings(output: &str) -> BTreeSet<PortMapping> {
    output
        .lines()
        .filter_map(|line| {
            let (container, host) = line.split_once("->")?;
            let container: u16 = container.trim().split('/').next()?.parse().ok()?;
            let host: u16 = host.trim().rsplit(':').next()?.parse().ok()?;
            Some(PortMapping { host, container })
        })
        .collect()
}
