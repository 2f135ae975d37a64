use async_trait::async_trait;
use std::process::Stdio;
use stratus_core::{Result, StratusError};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::backend::{ContainerBackend, ContainerSpec, ImageBuild};

/// Drives the local docker daemon through the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    /// Any docker-compatible CLI, e.g. `podman`.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn exec(&self, args: &[String]) -> Result<String> {
        debug!("{} {}", self.binary, args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(StratusError::Container(format!(
                "`{} {}` failed: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

/// Arguments shared by `docker run` and `docker run -d`, up to and including the image.
pub(crate) fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = Vec::new();

    if !spec.name.is_empty() {
        args.push("--name".to_string());
        args.push(spec.name.clone());
    }
    for mount in &spec.mounts {
        let mut volume = format!("{}:{}", mount.source, mount.target);
        if mount.read_only {
            volume.push_str(":ro");
        }
        args.push("-v".to_string());
        args.push(volume);
    }

    let mut env: Vec<_> = spec.env.iter().collect();
    env.sort();
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    if let Some(dir) = &spec.working_dir {
        args.push("-w".to_string());
        args.push(dir.clone());
    }
    if spec.cpu > 0.0 {
        args.push("--cpus".to_string());
        args.push(spec.cpu.to_string());
    }
    if spec.memory > 0 {
        args.push("--memory".to_string());
        args.push(format!("{}m", spec.memory));
    }
    if let Some(platform) = &spec.platform {
        args.push("--platform".to_string());
        args.push(platform.clone());
    }
    if let Some(owner) = &spec.network_of {
        args.push("--network".to_string());
        args.push(format!("container:{}", owner));
    }
    for port in &spec.ports {
        args.push("-p".to_string());
        args.push(format!("{}:{}", port.host_port, port.container_port));
    }

    args.push(spec.image.clone());
    args
}

#[async_trait]
impl ContainerBackend for DockerCli {
    async fn volume_create(&self, name: &str) -> Result<()> {
        self.exec(&["volume".into(), "create".into(), name.into()])
            .await
            .map(|_| ())
    }

    async fn volume_delete(&self, name: &str) -> Result<()> {
        self.exec(&["volume".into(), "rm".into(), "-f".into(), name.into()])
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn image_pull(&self, image: &str) -> Result<()> {
        let inspect = self
            .exec(&["image".into(), "inspect".into(), image.into()])
            .await;
        if inspect.is_ok() {
            return Ok(());
        }

        info!("Pulling {}", image);
        self.exec(&["pull".into(), image.into()]).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn image_build(&self, build: &ImageBuild) -> Result<()> {
        let mut args = vec!["build".to_string(), "-t".to_string(), build.tag.clone()];
        if let Some(dockerfile) = &build.dockerfile {
            args.push("-f".to_string());
            args.push(build.context_dir.join(dockerfile).to_string_lossy().to_string());
        }

        let mut arguments: Vec<_> = build.arguments.iter().collect();
        arguments.sort();
        for (key, value) in arguments {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(build.context_dir.to_string_lossy().to_string());

        info!("Building {}", build.tag);
        self.exec(&args).await.map(|_| ())
    }

    #[instrument(skip(self, spec, cancel), fields(image = %spec.image))]
    async fn container_run(&self, spec: &ContainerSpec, cancel: &CancellationToken) -> Result<i32> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        args.extend(run_args(spec));
        args.extend(spec.command.iter().cloned());

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                Ok(status.code().unwrap_or(-1))
            }
            _ = cancel.cancelled() => {
                warn!("Cancelled, killing container {}", spec.name);
                if !spec.name.is_empty() {
                    if let Err(e) = self.exec(&["kill".into(), spec.name.clone()]).await {
                        warn!("Failed to kill container {}: {}", spec.name, e);
                    }
                }
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill `{} run` for {}: {}", self.binary, spec.name, e);
                }
                Err(StratusError::Cancelled)
            }
        }
    }

    async fn container_start(&self, spec: &ContainerSpec) -> Result<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];
        args.extend(run_args(spec));
        args.extend(spec.command.iter().cloned());

        self.exec(&args).await
    }

    async fn container_delete(&self, id: &str) -> Result<()> {
        self.exec(&["rm".into(), "-f".into(), id.into()])
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::backend::Mount;
    use stratus_core::PortMapping;

    #[test]
    fn test_run_args_cover_limits_mounts_and_network() {
        let spec = ContainerSpec {
            name: "main".to_string(),
            image: "golang:latest".to_string(),
            mounts: vec![Mount {
                source: "stratus-volume".to_string(),
                target: "/tmp/stratus".to_string(),
                read_only: false,
            }],
            env: [("B".to_string(), "2".to_string()), ("A".to_string(), "1".to_string())]
                .into_iter()
                .collect(),
            working_dir: Some("/tmp/stratus/working-dir".to_string()),
            cpu: 2.0,
            memory: 4096,
            platform: Some("linux/arm64".to_string()),
            network_of: Some("sidecar".to_string()),
            ports: vec![PortMapping {
                host_port: 5432,
                container_port: 5432,
            }],
            ..Default::default()
        };

        let args = run_args(&spec).join(" ");
        assert_eq!(
            args,
            "--name main -v stratus-volume:/tmp/stratus -e A=1 -e B=2 \
             -w /tmp/stratus/working-dir --cpus 2 --memory 4096m --platform linux/arm64 \
             --network container:sidecar -p 5432:5432 golang:latest"
        );
    }

    #[test]
    fn test_read_only_mount_and_no_limits() {
        let spec = ContainerSpec {
            image: "alpine".to_string(),
            mounts: vec![Mount {
                source: "/home/ci/project".to_string(),
                target: "/project-host".to_string(),
                read_only: true,
            }],
            ..Default::default()
        };

        assert_eq!(
            run_args(&spec),
            vec!["-v", "/home/ci/project:/project-host:ro", "alpine"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelled_run_survives_failed_kill() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().unwrap();
        let binary = temp.path().join("docker");
        std::fs::write(
            &binary,
            "#!/bin/sh\n[ \"$1\" = kill ] && { echo 'no such container' >&2; exit 1; }\nsleep 30\n",
        )
        .unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        let docker = DockerCli::with_binary(binary.to_string_lossy());

        let spec = ContainerSpec {
            name: "main".to_string(),
            image: "debian".to_string(),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = docker.container_run(&spec, &cancel).await.unwrap_err();
        assert!(matches!(err, StratusError::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
