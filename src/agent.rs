//! Host side of SSH agent forwarding.
//!
//! A per-session UNIX listener accepts connections from the in-guest proxy
//! socket and relays each one into an `auth-agent@openssh.com` channel back
//! to the client.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use russh::server::Handle;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct AgentForwarder {
    dir: PathBuf,
    socket_path: PathBuf,
    task: tokio::task::JoinHandle<()>,
}

impl AgentForwarder {
    /// Bind an ephemeral agent socket and start accepting connections.
    pub async fn bind(handle: Handle, cancel: CancellationToken) -> Result<Self> {
        let dir = std::env::temp_dir().join(format!("incusgate-{}", Uuid::new_v4().simple()));
        tokio::fs::create_dir(&dir)
            .await
            .with_context(|| format!("creating agent directory {}", dir.display()))?;
        tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
            .await
            .with_context(|| format!("restricting agent directory {}", dir.display()))?;

        let socket_path = dir.join("agent.sock");
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("binding agent socket {}", socket_path.display()))?;
        debug!(socket = %socket_path.display(), "agent listener ready");

        let task = tokio::spawn(async move {
            loop {
                let mut stream = tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(err) => {
                            warn!("agent accept error: {err}");
                            return;
                        }
                    },
                };

                let channel = match handle.channel_open_agent().await {
                    Ok(channel) => channel,
                    Err(err) => {
                        warn!("failed to open agent channel: {err}");
                        continue;
                    }
                };

                tokio::spawn(async move {
                    let mut channel_stream = channel.into_stream();
                    if let Err(err) =
                        tokio::io::copy_bidirectional(&mut stream, &mut channel_stream).await
                    {
                        debug!("agent relay ended: {err}");
                    }
                });
            }
        });

        Ok(Self {
            dir,
            socket_path,
            task,
        })
    }

    /// Host-side socket path, used as the proxy device source.
    pub fn source(&self) -> &Path {
        &self.socket_path
    }

    /// Stop accepting and remove the socket from disk.
    pub async fn close(self) {
        self.task.abort();
        if let Err(err) = tokio::fs::remove_dir_all(&self.dir).await {
            debug!("removing agent directory {}: {err}", self.dir.display());
        }
    }
}
