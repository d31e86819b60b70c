//! Key passphrase delivery for ssh via Unix socket.
//!
//! ssh reads key passphrases from `SSH_ASKPASS` when it has no terminal. Rather
//! than writing a script that echoes the secret, we:
//!
//! 1. Create a Unix socket with restrictive permissions (0600)
//! 2. Write a minimal script that connects to the socket using our own binary
//! 3. Serve the passphrase over the socket when ssh invokes askpass
//!
//! The passphrase never touches the filesystem; the script only names the socket.
//!
//! # Usage in binaries
//!
//! Call `handle_askpass_mode()` at the very start of `main()`:
//!
//! ```ignore
//! fn main() {
//!     ssh_db_tunnel::handle_askpass_mode();
//!     // Rest of your program...
//! }
//! ```

#[cfg(unix)]
pub use self::proxy::AskpassProxy;

/// Check for `--askpass <socket_path>` and, if present, print the passphrase
/// served on that socket and exit the process.
///
/// Returns normally when the flag is absent.
pub fn handle_askpass_mode() {
    let args: Vec<String> = std::env::args().collect();

    if let Some(pos) = args.iter().position(|a| a == "--askpass") {
        if let Some(socket_path) = args.get(pos + 1) {
            match handle_askpass(socket_path) {
                Ok(()) => std::process::exit(0),
                Err(e) => {
                    eprintln!("askpass error: {}", e);
                    std::process::exit(1);
                }
            }
        } else {
            eprintln!("--askpass requires a socket path argument");
            std::process::exit(1);
        }
    }
}

#[cfg(unix)]
fn handle_askpass(socket_path: &str) -> std::io::Result<()> {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    let mut stream = UnixStream::connect(socket_path)?;
    let mut secret = String::new();
    stream.read_to_string(&mut secret)?;

    // ssh reads askpass stdout
    print!("{}", secret);
    std::io::stdout().flush()?;

    Ok(())
}

#[cfg(not(unix))]
fn handle_askpass(_socket_path: &str) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "askpass mode is only supported on Unix systems",
    ))
}

/// Quote a string for a POSIX shell script.
fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(unix)]
mod proxy {
    use super::shell_escape;
    use anyhow::{Context, Result};
    use futures::FutureExt;
    use smol::io::AsyncWriteExt;
    use smol::net::unix::UnixListener;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Serves a secret over a Unix socket for `SSH_ASKPASS`.
    pub struct AskpassProxy {
        listener: UnixListener,
        script_path: PathBuf,
        socket_path: PathBuf,
        _temp_dir: TempDir,
    }

    impl AskpassProxy {
        /// Create the 0700 temp dir, the 0600 socket and the askpass script.
        pub async fn new() -> Result<Self> {
            let temp_dir = TempDir::with_prefix("ssh-db-tunnel-")?;
            let socket_path = temp_dir.path().join("askpass.sock");
            let script_path = temp_dir.path().join("askpass.sh");

            set_mode(temp_dir.path(), 0o700)?;

            let listener =
                UnixListener::bind(&socket_path).context("Failed to create askpass socket")?;
            set_mode(&socket_path, 0o600)?;

            let current_exe =
                std::env::current_exe().context("Failed to get current executable path")?;
            let escaped_exe = shell_escape(&current_exe.to_string_lossy());
            let escaped_socket = shell_escape(&socket_path.to_string_lossy());

            // Prefer our own binary in --askpass mode, fall back to nc
            let script = format!(
                r#"#!/bin/sh
if {exe} --askpass {socket} 2>/dev/null; then
    exit 0
elif command -v nc >/dev/null 2>&1; then
    nc -U {socket}
else
    echo "Error: neither --askpass mode nor nc available" >&2
    exit 1
fi
"#,
                exe = escaped_exe,
                socket = escaped_socket
            );
            std::fs::write(&script_path, &script)?;
            set_mode(&script_path, 0o700)?;

            tracing::debug!(
                "Created askpass proxy: socket={}, script={}",
                socket_path.display(),
                script_path.display()
            );

            Ok(Self {
                listener,
                script_path,
                socket_path,
                _temp_dir: temp_dir,
            })
        }

        /// Path to the askpass script (set as SSH_ASKPASS)
        pub fn script_path(&self) -> &Path {
            &self.script_path
        }

        pub fn socket_path(&self) -> &Path {
            &self.socket_path
        }

        /// Wait for one askpass connection and send the secret.
        pub async fn serve_secret(&self, secret: &str) -> Result<()> {
            let (mut stream, _addr) = self
                .listener
                .accept()
                .await
                .context("Failed to accept askpass connection")?;

            stream
                .write_all(secret.as_bytes())
                .await
                .context("Failed to write secret to socket")?;
            stream
                .write_all(b"\n")
                .await
                .context("Failed to write newline to socket")?;
            stream
                .flush()
                .await
                .context("Failed to flush secret to socket")?;

            // EOF tells the reader we are done
            drop(stream);

            tracing::debug!("Served secret via askpass proxy");
            Ok(())
        }

        /// Returns Ok(true) if the secret was served, Ok(false) on timeout.
        pub async fn serve_secret_with_timeout(
            &self,
            secret: &str,
            timeout: Duration,
        ) -> Result<bool> {
            let serve = self.serve_secret(secret);
            let timer = smol::Timer::after(timeout);

            futures::select! {
                result = Box::pin(serve).fuse() => {
                    result?;
                    Ok(true)
                }
                _ = Box::pin(timer).fuse() => {
                    tracing::debug!("Askpass timeout - ssh may not have needed the secret");
                    Ok(false)
                }
            }
        }

        /// Serve the secret in the background for up to `max_prompts` prompts.
        ///
        /// With a `timeout`, stops at the first prompt that does not arrive in
        /// time; without one, waits for each prompt indefinitely. Dropping the
        /// returned task stops the server.
        pub fn spawn_server(
            self: &Arc<Self>,
            secret: String,
            max_prompts: usize,
            timeout: Option<Duration>,
        ) -> smol::Task<()> {
            let proxy = Arc::clone(self);
            smol::spawn(async move {
                for prompt in 0..max_prompts {
                    let served = match timeout {
                        Some(timeout) => proxy.serve_secret_with_timeout(&secret, timeout).await,
                        None => proxy.serve_secret(&secret).await.map(|()| true),
                    };
                    match served {
                        Ok(true) => tracing::debug!("Askpass prompt {} answered", prompt + 1),
                        Ok(false) => break,
                        Err(e) => {
                            tracing::warn!("Askpass proxy failed: {:#}", e);
                            break;
                        }
                    }
                }
            })
        }
    }

    fn set_mode(path: &Path, mode: u32) -> Result<()> {
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(mode);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("Failed to set permissions on {}", path.display()))
    }

    impl Drop for AskpassProxy {
        fn drop(&mut self) {
            tracing::debug!("Cleaning up askpass proxy");
        }
    }

}
