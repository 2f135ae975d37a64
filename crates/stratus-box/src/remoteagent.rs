//! Getting the agent running inside a freshly booted guest.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;
use stratus_core::config::{StratusConfig, DEFAULT_AGENT_DOWNLOAD_BASE};
use stratus_core::{Result, StratusError};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::retry::{poll_until, PollError};
use crate::runconfig::RunConfig;

/// Everything the handshake needs to know about the guest.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeRequest<'a> {
    pub address: IpAddr,
    pub user: &'a str,
    pub password: &'a str,
    /// GOOS-style, e.g. `darwin`.
    pub os: &'a str,
    /// GOARCH-style, e.g. `arm64`.
    pub arch: &'a str,
    pub working_dir: &'a str,
    pub config: &'a RunConfig,
    /// The guest resumed from a suspended snapshot, so its clock is stale.
    pub cloned_from_suspended: bool,
    pub extra_env: Option<&'a HashMap<String, String>>,
}

#[async_trait]
pub trait AgentHandshake: Send + Sync {
    /// Returns once the agent has finished the task, or fails if the guest
    /// never became reachable.
    async fn wait_for_agent(&self, cancel: &CancellationToken, request: HandshakeRequest<'_>) -> Result<()>;
}

/// Starts the agent over SSH using the system `ssh` client and `sshpass`.
#[derive(Debug, Clone)]
pub struct SshHandshake {
    port: u16,
    connect_timeout: Duration,
    poll_interval: Duration,
    download_base: String,
}

impl SshHandshake {
    pub fn new() -> Self {
        Self {
            port: 22,
            connect_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            download_base: DEFAULT_AGENT_DOWNLOAD_BASE.to_string(),
        }
    }

    pub fn from_config(config: &StratusConfig) -> Self {
        Self {
            port: config.ssh.port,
            connect_timeout: Duration::from_secs(config.ssh.connect_timeout_secs),
            poll_interval: Duration::from_millis(config.vm.ip_poll_interval_ms),
            download_base: config.agent.download_base.clone(),
        }
    }

    async fn wait_for_port(&self, cancel: &CancellationToken, address: IpAddr) -> Result<()> {
        let target = SocketAddr::new(address, self.port);

        let attempt = poll_until(
            cancel,
            self.poll_interval,
            || TcpStream::connect(target),
            |e: &std::io::Error| {
                !matches!(
                    e.kind(),
                    std::io::ErrorKind::PermissionDenied
                        | std::io::ErrorKind::InvalidInput
                        | std::io::ErrorKind::Unsupported
                )
            },
        );

        match tokio::time::timeout(self.connect_timeout, attempt).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(PollError::Cancelled { .. })) => Err(StratusError::Cancelled),
            Ok(Err(PollError::Fatal(e))) => Err(StratusError::Agent(format!(
                "failed to connect to {}: {}",
                target, e
            ))),
            Err(_) => Err(StratusError::Agent(format!(
                "timed out after {:?} waiting for SSH on {}",
                self.connect_timeout, target
            ))),
        }
    }

    fn ssh_command(&self, request: &HandshakeRequest<'_>, remote: &str) -> Command {
        let mut command = Command::new("sshpass");
        command
            .arg("-e")
            .arg("ssh")
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "LogLevel=ERROR"])
            .arg("-p")
            .arg(self.port.to_string())
            .arg(format!("{}@{}", request.user, request.address))
            .arg(remote)
            .env("SSHPASS", request.password)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    async fn run_remote(
        &self,
        cancel: &CancellationToken,
        request: &HandshakeRequest<'_>,
        remote: &str,
    ) -> Result<()> {
        let mut child = self.ssh_command(request, remote).spawn()?;

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    Ok(())
                } else {
                    Err(StratusError::Agent(format!(
                        "remote command on {} exited with {}",
                        request.address, status
                    )))
                }
            }
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill remote command on {}: {}", request.address, e);
                }
                Err(StratusError::Cancelled)
            }
        }
    }

    pub(crate) fn agent_url(&self, request: &HandshakeRequest<'_>) -> String {
        let suffix = if request.os == "windows" { ".exe" } else { "" };
        format!(
            "{}/v{}/agent-{}-{}{}",
            self.download_base.trim_end_matches('/'),
            request.config.agent_version(),
            request.os,
            request.arch,
            suffix
        )
    }

    pub(crate) fn agent_script(&self, request: &HandshakeRequest<'_>) -> String {
        let mut env: Vec<(&String, &String)> = request.config.environment.iter().collect();
        if let Some(extra) = request.extra_env {
            env.extend(extra.iter());
        }
        env.sort();

        let args = request.config.agent_args("", "");
        let url = self.agent_url(request);

        if request.os == "windows" {
            let mut script = format!(
                "$ErrorActionPreference = 'Stop'; \
                 New-Item -ItemType Directory -Force -Path '{wd}' | Out-Null; \
                 Set-Location '{wd}'; \
                 Invoke-WebRequest -Uri '{url}' -OutFile $env:TEMP\\stratus-agent.exe; ",
                wd = request.working_dir,
                url = url
            );
            for (key, value) in env {
                script.push_str(&format!("$env:{} = '{}'; ", key, value.replace('\'', "''")));
            }
            script.push_str("& $env:TEMP\\stratus-agent.exe");
            for arg in args {
                script.push_str(&format!(" '{}'", arg.replace('\'', "''")));
            }
            return format!("powershell -NoProfile -Command \"{}\"", script);
        }

        let mut script = format!(
            "set -e; mkdir -p {wd}; cd {wd}; \
             curl -sSfL -o /tmp/stratus-agent {url}; chmod +x /tmp/stratus-agent; exec env",
            wd = shell_quote(request.working_dir),
            url = shell_quote(&url)
        );
        for (key, value) in env {
            script.push(' ');
            script.push_str(&shell_quote(&format!("{}={}", key, value)));
        }
        script.push_str(" /tmp/stratus-agent");
        for arg in args {
            script.push(' ');
            script.push_str(&shell_quote(&arg));
        }
        script
    }
}

impl Default for SshHandshake {
    fn default() -> Self {
        Self::new()
    }
}

fn clock_sync_command(os: &str) -> &'static str {
    match os {
        "darwin" => "sudo sntp -sS time.apple.com",
        "windows" => "w32tm /resync /force",
        _ => "sudo hwclock --hctosys",
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[async_trait]
impl AgentHandshake for SshHandshake {
    #[instrument(skip(self, cancel, request), fields(address = %request.address, os = request.os))]
    async fn wait_for_agent(&self, cancel: &CancellationToken, request: HandshakeRequest<'_>) -> Result<()> {
        self.wait_for_port(cancel, request.address).await?;
        info!("SSH is up on {}", request.address);

        if request.cloned_from_suspended {
            let sync = clock_sync_command(request.os);
            if let Err(e) = self.run_remote(cancel, &request, sync).await {
                if matches!(e, StratusError::Cancelled) {
                    return Err(e);
                }
                warn!("Failed to resync the guest clock: {}", e);
            }
        }

        let script = self.agent_script(&request);
        info!("Starting agent {} on {}", request.config.agent_version(), request.address);
        self.run_remote(cancel, &request, &script).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(config: &'a RunConfig, os: &'a str) -> HandshakeRequest<'a> {
        HandshakeRequest {
            address: "192.168.64.5".parse().unwrap(),
            user: "admin",
            password: "admin",
            os,
            arch: "arm64",
            working_dir: "/tmp/stratus/working-dir",
            config,
            cloned_from_suspended: false,
            extra_env: None,
        }
    }

    #[test]
    fn test_agent_url_uses_version_override() {
        let mut config = RunConfig::new(1, "e");
        config.agent_version = Some("1.2.3".to_string());
        let handshake = SshHandshake::new();

        assert_eq!(
            handshake.agent_url(&request(&config, "darwin")),
            "https://github.com/cirruslabs/cirrus-ci-agent/releases/download/v1.2.3/agent-darwin-arm64"
        );
        assert!(handshake.agent_url(&request(&config, "windows")).ends_with("agent-windows-arm64.exe"));
    }

    #[test]
    fn test_unix_script_quotes_env_and_args() {
        let mut config = RunConfig::new(9, "https://grpc.example.com");
        config
            .environment
            .insert("GREETING".to_string(), "it's fine".to_string());

        let script = SshHandshake::new().agent_script(&request(&config, "darwin"));

        assert!(script.starts_with("set -e; mkdir -p '/tmp/stratus/working-dir'"));
        assert!(script.contains(r"'GREETING=it'\''s fine'"));
        assert!(script.contains("'-task-id' '9'"));
    }

    #[test]
    fn test_extra_env_is_merged() {
        let config = RunConfig::new(9, "e");
        let extra: HashMap<String, String> = [("CI_NODE".to_string(), "vm".to_string())].into();
        let mut req = request(&config, "linux");
        req.extra_env = Some(&extra);

        assert!(SshHandshake::new().agent_script(&req).contains("'CI_NODE=vm'"));
    }

    #[test]
    fn test_windows_script_uses_powershell() {
        let config = RunConfig::new(9, "e");
        let script = SshHandshake::new().agent_script(&request(&config, "windows"));
        assert!(script.starts_with("powershell"));
        assert!(script.contains("Invoke-WebRequest"));
    }

    #[test]
    fn test_clock_sync_per_os() {
        assert!(clock_sync_command("darwin").contains("sntp"));
        assert!(clock_sync_command("windows").contains("w32tm"));
        assert!(clock_sync_command("linux").contains("hwclock"));
    }

    #[tokio::test]
    async fn test_cancelled_before_port_is_up() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let config = RunConfig::new(1, "e");

        let err = SshHandshake::new()
            .wait_for_agent(&cancel, request(&config, "darwin"))
            .await
            .unwrap_err();
        assert!(matches!(err, StratusError::Cancelled));
    }
}
