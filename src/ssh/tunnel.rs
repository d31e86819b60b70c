//! SSH tunnel implementation using the system ssh binary.
//!
//! Shelling out to `ssh` rather than linking an SSH library means the user's
//! `~/.ssh/config`, ssh-agent and ProxyJump settings apply unchanged.

use super::types::{SshAuthMethod, SshTunnelConfig};
use anyhow::{Context, Result};
use async_lock::Mutex;
use futures::StreamExt;
use smol::io::{AsyncBufReadExt, BufReader};
use smol::net::TcpListener;
use smol::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(unix)]
use super::askpass::AskpassProxy;

/// Interval between checks while waiting for the forward to come up
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// stderr lines kept for error reports
const STDERR_TAIL: usize = 20;

/// An active SSH tunnel: a `ssh -N -L` child process.
pub struct SshTunnel {
    config: SshTunnelConfig,
    local_port: u16,
    process: Mutex<Child>,
    /// Proxy and the task serving it; dropped with the tunnel
    #[cfg(unix)]
    _askpass: Option<(Arc<AskpassProxy>, smol::Task<()>)>,
}

impl SshTunnel {
    /// Start a new SSH tunnel.
    ///
    /// Resolves once the local end of the forward accepts TCP connections, or
    /// fails if ssh exits first or the optional `startup_timeout` elapses.
    pub async fn start(config: SshTunnelConfig) -> Result<Self> {
        let local_port = if config.local_bind_port == 0 {
            Self::find_available_port(&config.local_bind_host).await?
        } else {
            config.local_bind_port
        };

        let forward_spec = config.forward_spec(local_port);

        let mut cmd = Command::new(&config.program);

        // Kill the ssh process when this handle is dropped
        cmd.kill_on_drop(true);

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        cmd.arg("-L").arg(&forward_spec);

        // No remote command, forwarding only
        cmd.arg("-N");

        // Exit immediately if we can't set up the port forwarding
        cmd.args(["-o", "ExitOnForwardFailure=yes"]);

        for option in config.host_key_policy.ssh_options() {
            cmd.arg("-o").arg(option);
        }

        if let Some(timeout) = config.connect_timeout {
            cmd.arg("-o")
                .arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)));
        }

        cmd.arg("-o")
            .arg(format!("ServerAliveInterval={}", config.server_alive_interval));
        cmd.arg("-o")
            .arg(format!("ServerAliveCountMax={}", config.server_alive_count_max));

        if config.ssh_port != 22 {
            cmd.arg("-p").arg(config.ssh_port.to_string());
        }

        #[cfg(unix)]
        let mut askpass = None;

        match &config.auth_method {
            SshAuthMethod::Agent => {
                // ssh falls back to agent / configured identities
            }
            SshAuthMethod::PublicKey {
                private_key_path,
                passphrase,
            } => {
                cmd.arg("-i").arg(private_key_path);

                if let Some(passphrase) = passphrase {
                    #[cfg(unix)]
                    {
                        askpass = Some(
                            Self::setup_askpass(&mut cmd, passphrase, config.startup_timeout)
                                .await?,
                        );
                    }

                    #[cfg(not(unix))]
                    {
                        tracing::warn!(
                            "Passphrase delivery via askpass not supported on this platform, \
                            relying on ssh-agent"
                        );
                        let _ = passphrase;
                    }
                }
            }
        }

        for arg in &config.extra_args {
            cmd.arg(arg);
        }

        cmd.arg(config.ssh_url());

        tracing::info!(
            "Starting SSH tunnel: ssh -L {} -N {} (port {})",
            forward_spec,
            config.ssh_url(),
            config.ssh_port
        );

        let mut process = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", config.program))?;

        let stderr_tail = Arc::new(Mutex::new(Vec::new()));
        if let Some(stderr) = process.stderr.take() {
            Self::watch_stderr(stderr, config.ssh_url(), Arc::clone(&stderr_tail));
        }

        if let Err(e) = Self::wait_until_listening(&config, local_port, &mut process).await {
            let _ = process.kill();
            // Give the stderr reader a moment to collect the last lines
            smol::Timer::after(Duration::from_millis(50)).await;
            let tail = stderr_tail.lock().await;
            if tail.is_empty() {
                return Err(e);
            }
            return Err(e.context(tail.join("\n")));
        }

        tracing::info!(
            "SSH tunnel established: {}:{} -> {}:{}",
            config.local_bind_host,
            local_port,
            config.remote_host,
            config.remote_port
        );

        Ok(Self {
            config,
            local_port,
            process: Mutex::new(process),
            #[cfg(unix)]
            _askpass: askpass,
        })
    }

    /// Poll until the forwarded port accepts connections.
    async fn wait_until_listening(
        config: &SshTunnelConfig,
        local_port: u16,
        process: &mut Child,
    ) -> Result<()> {
        // Unbounded unless startup_timeout is set
        let verify_addr = format!("{}:{}", config.local_bind_host, local_port);
        let started = Instant::now();

        loop {
            if let Some(status) = process.try_status()? {
                anyhow::bail!(
                    "SSH process exited with status: {}. \
                    Check SSH credentials and connectivity to {}:{}",
                    status,
                    config.ssh_host,
                    config.ssh_port
                );
            }

            match smol::net::TcpStream::connect(&verify_addr).await {
                Ok(_) => return Ok(()),
                Err(e) => match config.startup_timeout {
                    Some(timeout) if started.elapsed() >= timeout => {
                        anyhow::bail!(
                            "SSH tunnel failed to establish - local port {} not listening after {:?}: {}",
                            local_port,
                            timeout,
                            e
                        );
                    }
                    _ => smol::Timer::after(STARTUP_POLL_INTERVAL).await,
                },
            };
        }
    }

    /// Log ssh's stderr and keep its last lines for error reports.
    fn watch_stderr(
        stderr: smol::process::ChildStderr,
        ssh_url: String,
        tail: Arc<Mutex<Vec<String>>>,
    ) {
        smol::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Some(result) = lines.next().await {
                match result {
                    Ok(line) => {
                        if line.contains("Permission denied")
                            || line.contains("Authentication failed")
                            || line.contains("Host key verification failed")
                        {
                            tracing::error!("SSH authentication failed for {}: {}", ssh_url, line);
                        } else if line.contains("Connection refused")
                            || line.contains("Connection timed out")
                            || line.contains("Could not resolve hostname")
                        {
                            tracing::error!("SSH connection error: {}", line);
                        } else {
                            tracing::debug!("SSH stderr: {}", line);
                        }

                        let mut tail = tail.lock().await;
                        if tail.len() == STDERR_TAIL {
                            tail.remove(0);
                        }
                        tail.push(line);
                    }
                    Err(e) => {
                        tracing::debug!("SSH stderr read error: {}", e);
                        break;
                    }
                }
            }
        })
        .detach();
    }

    /// Point `SSH_ASKPASS` at a proxy serving the key passphrase.
    #[cfg(unix)]
    async fn setup_askpass(
        cmd: &mut Command,
        passphrase: &str,
        timeout: Option<Duration>,
    ) -> Result<(Arc<AskpassProxy>, smol::Task<()>)> {
        let proxy = Arc::new(AskpassProxy::new().await?);
        let server = proxy.spawn_server(passphrase.to_string(), 3, timeout);

        cmd.env("SSH_ASKPASS", proxy.script_path());
        cmd.env("SSH_ASKPASS_REQUIRE", "force");
        // Older ssh versions only consult askpass with a display set
        cmd.env("DISPLAY", ":0");

        Ok((proxy, server))
    }

    /// Ask the OS for a free port by binding port 0 and releasing it.
    ///
    /// Another process may grab the port before ssh binds it; ssh then exits
    /// because of `ExitOnForwardFailure` and establishment fails.
    pub async fn find_available_port(bind_host: &str) -> Result<u16> {
        let listener = TcpListener::bind(format!("{}:0", bind_host))
            .await
            .context("Failed to find available port")?;
        let port = listener.local_addr()?.port();
        drop(listener);
        Ok(port)
    }

    pub fn config(&self) -> &SshTunnelConfig {
        &self.config
    }

    /// Get the local port the tunnel is listening on.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Get the local address to connect to (e.g., "127.0.0.1:12345").
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.config.local_bind_host, self.local_port)
    }

    /// Check if the tunnel process is still running.
    pub async fn is_alive(&self) -> bool {
        matches!(self.process.lock().await.try_status(), Ok(None))
    }

    /// Terminate ssh: SIGTERM first, then kill.
    pub async fn shutdown(&self) {
        tracing::debug!("Shutting down SSH tunnel to {}", self.config.ssh_url());
        let mut process = self.process.lock().await;

        #[cfg(unix)]
        {
            if matches!(process.try_status(), Ok(None)) {
                // SAFETY: plain kill(2) on our own child's pid
                unsafe {
                    libc::kill(process.id() as i32, libc::SIGTERM);
                }
                smol::Timer::after(Duration::from_millis(100)).await;
            }
        }

        if matches!(process.try_status(), Ok(None)) {
            let _ = process.kill();
        }

        let _ = process.status().await;

        tracing::info!("SSH tunnel {} shutdown complete", self.local_addr());
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        let _ = self.process.get_mut().kill();
    }
}
