//! SSH server implementation using russh.
//!
//! Handles:
//! - Public key authentication against the gateway's authorized_keys file
//! - Session channels (PTY, shell, exec, env, window-change, signals)
//! - Agent-forwarding requests
//!
//! Everything beyond channel bookkeeping is handed to the session
//! dispatcher; authentication never looks at the login name, which is only
//! parsed once a channel asks for a shell or an exec.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use russh::keys::{PublicKey, PublicKeyBase64};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Pty, Sig};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::incus::Window;
use crate::session::{self, PtyParams, SessionIo, SessionParams};

/// Shared state for the SSH server.
pub struct ServerState {
    pub config: Arc<GatewayConfig>,
    /// Normalised "type base64" entries from the authorized_keys file.
    authorized_keys: Vec<String>,
}

/// Per-connection handler state.
pub struct ConnectionHandler {
    server: Arc<ServerState>,
    peer_addr: SocketAddr,

    /// The SSH login name, captured at auth time and parsed at dispatch.
    login_name: Option<String>,

    /// Session channels that have opened but not yet dispatched, plus the
    /// producer ends feeding dispatched sessions.
    channels: HashMap<ChannelId, ChannelState>,

    /// Cancels every task serving this connection.
    cancel: CancellationToken,
}

#[derive(Default)]
struct ChannelState {
    channel: Option<Channel<Msg>>,
    pty: Option<PtyParams>,
    env: Vec<(String, String)>,
    agent_requested: bool,
    winch_tx: Option<mpsc::Sender<Window>>,
    signal_tx: Option<mpsc::Sender<i32>>,
}

impl ConnectionHandler {
    fn new(server: Arc<ServerState>, peer_addr: SocketAddr) -> Self {
        Self {
            server,
            peer_addr,
            login_name: None,
            channels: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn check_key(&mut self, user: &str, public_key: &PublicKey) -> Auth {
        let offered = key_to_openssh(public_key);
        let fingerprint = key_fingerprint(public_key);

        if self.server.authorized_keys.contains(&offered) {
            debug!("accepted key {fingerprint} for '{user}' from {}", self.peer_addr);
            self.login_name = Some(user.to_string());
            Auth::Accept
        } else {
            debug!(
                "key {fingerprint} for '{user}' from {} is not authorized",
                self.peer_addr
            );
            let methods = MethodSet::from(&[MethodKind::PublicKey][..]);
            Auth::Reject {
                proceed_with_methods: Some(methods),
                partial_success: false,
            }
        }
    }

    /// Start a session task for a shell or exec request.
    fn dispatch(
        &mut self,
        channel_id: ChannelId,
        raw_command: Option<String>,
        session: &mut Session,
    ) -> Result<()> {
        let login_name = self
            .login_name
            .clone()
            .ok_or_else(|| anyhow!("not authenticated"))?;
        let state = self
            .channels
            .get_mut(&channel_id)
            .ok_or_else(|| anyhow!("unknown channel {channel_id:?}"))?;
        let channel = state
            .channel
            .take()
            .ok_or_else(|| anyhow!("channel {channel_id:?} already dispatched"))?;

        let (winch_tx, win_ch) = mpsc::channel(8);
        let (signal_tx, signals) = mpsc::channel(4);
        state.winch_tx = Some(winch_tx);
        state.signal_tx = Some(signal_tx);

        let params = SessionParams {
            login_name,
            peer: self.peer_addr,
            raw_command,
            pty: state.pty.clone(),
            env: state.env.clone(),
            agent_requested: state.agent_requested,
        };
        let io = SessionIo {
            handle: session.handle(),
            channel,
            channel_id,
            win_ch,
            signals,
            cancel: self.cancel.child_token(),
        };

        let config = self.server.config.clone();
        tokio::spawn(session::run(config, params, io));
        Ok(())
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        // Unblocks every session task still serving this connection.
        self.cancel.cancel();
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("session channel opened: {:?}", channel.id());
        self.channels.insert(
            channel.id(),
            ChannelState {
                channel: Some(channel),
                ..Default::default()
            },
        );
        Ok(true)
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!("public key offered by '{user}' from {}", self.peer_addr);
        Ok(self.check_key(user, public_key))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!("public key auth (with signature) for '{user}'");
        Ok(self.check_key(user, public_key))
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("PTY request: term={term}, cols={col_width}, rows={row_height}");
        if let Some(state) = self.channels.get_mut(&channel_id) {
            state.pty = Some(PtyParams {
                term: term.to_string(),
                window: Window {
                    width: col_width,
                    height: row_height,
                },
            });
        }
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel_id: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel_id) {
            state
                .env
                .push((variable_name.to_string(), variable_value.to_string()));
        }
        Ok(())
    }

    async fn agent_request(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("agent forwarding requested on {channel_id:?}");
        if let Some(state) = self.channels.get_mut(&channel_id) {
            state.agent_requested = true;
        }
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!("shell request on channel {channel_id:?}");
        self.dispatch(channel_id, None, session)
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        info!("exec request on channel {channel_id:?}: {command}");
        self.dispatch(channel_id, Some(command), session)
    }

    async fn window_change_request(
        &mut self,
        channel_id: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("window change: channel={channel_id:?}, cols={col_width}, rows={row_height}");
        if let Some(tx) = self
            .channels
            .get(&channel_id)
            .and_then(|state| state.winch_tx.as_ref())
        {
            let _ = tx
                .send(Window {
                    width: col_width,
                    height: row_height,
                })
                .await;
        }
        Ok(())
    }

    async fn signal(
        &mut self,
        channel_id: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = self
            .channels
            .get(&channel_id)
            .and_then(|state| state.signal_tx.as_ref())
        {
            if let Some(number) = sig_number(&signal) {
                let _ = tx.send(number).await;
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("channel EOF: {channel_id:?}");
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("channel closed: {channel_id:?}");
        // Dropping the senders closes the resize and signal streams.
        self.channels.remove(&channel_id);
        Ok(())
    }
}

/// Map an SSH signal name to the numeric signal the container API expects.
fn sig_number(signal: &Sig) -> Option<i32> {
    Some(match signal {
        Sig::HUP => 1,
        Sig::INT => 2,
        Sig::QUIT => 3,
        Sig::ILL => 4,
        Sig::ABRT => 6,
        Sig::FPE => 8,
        Sig::KILL => 9,
        Sig::SEGV => 11,
        Sig::PIPE => 13,
        Sig::ALRM => 14,
        Sig::TERM => 15,
        Sig::USR1 => 10,
        _ => return None,
    })
}

/// OpenSSH "type base64" form of a public key, without comment.
fn key_to_openssh(key: &PublicKey) -> String {
    format!("{} {}", key.algorithm(), key.public_key_base64())
}

/// SHA256 fingerprint in the "SHA256:..." format used by `ssh-keygen -l`.
fn key_fingerprint(key: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    let hash = hasher.finalize();
    let b64 = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{b64}")
}

/// Read the authorized_keys file into normalised "type base64" entries.
fn load_authorized_keys(config: &GatewayConfig) -> Vec<String> {
    let path = &config.authorized_keys_path;
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            warn!(
                "no authorized keys loaded from {} ({err}); all logins will be rejected",
                path.display()
            );
            return Vec::new();
        }
    };

    let mut keys = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(key_type), Some(key_data)) = (fields.next(), fields.next()) else {
            continue;
        };
        if base64::engine::general_purpose::STANDARD
            .decode(key_data)
            .is_err()
        {
            warn!("skipping malformed key in {}", path.display());
            continue;
        }
        keys.push(format!("{key_type} {key_data}"));
    }

    info!("loaded {} authorized key(s) from {}", keys.len(), path.display());
    keys
}

/// Run the SSH server.
pub async fn run_server(config: Arc<GatewayConfig>) -> Result<()> {
    let key = load_or_generate_host_key(&config.host_key_path).await?;

    let russh_config = Arc::new(russh::server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![key],
        ..Default::default()
    });

    let server_state = Arc::new(ServerState {
        authorized_keys: load_authorized_keys(&config),
        config: config.clone(),
    });

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.listen_addr))?;

    let listener = TcpListener::bind(addr).await?;
    info!("SSH server listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let server_state = server_state.clone();
        let russh_config = russh_config.clone();

        tokio::spawn(async move {
            let handler = ConnectionHandler::new(server_state, peer_addr);
            match russh::server::run_stream(russh_config, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        warn!("SSH session error: {e}");
                    }
                }
                Err(e) => {
                    warn!("SSH connection error: {e}");
                }
            }
        });
    }
}

/// Load host key from file or generate a new one.
async fn load_or_generate_host_key(path: &std::path::Path) -> Result<russh::keys::PrivateKey> {
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, LineEnding};

    if path.exists() {
        info!("Loading host key from {}", path.display());
        let key = russh::keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {}", path.display()))?;
        Ok(key)
    } else {
        info!("Generating new Ed25519 host key");
        let key = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .context("Failed to generate host key")?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let key_bytes = key
            .to_openssh(LineEnding::LF)
            .context("Failed to encode host key")?;
        tokio::fs::write(path, key_bytes.as_bytes()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        info!("Saved host key to {}", path.display());
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sig_number_mapping() {
        assert_eq!(sig_number(&Sig::HUP), Some(1));
        assert_eq!(sig_number(&Sig::INT), Some(2));
        assert_eq!(sig_number(&Sig::KILL), Some(9));
        assert_eq!(sig_number(&Sig::TERM), Some(15));
        assert_eq!(sig_number(&Sig::Custom("WINCH".to_string())), None);
    }
}
