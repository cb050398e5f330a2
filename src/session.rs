//! Per-channel session dispatch.
//!
//! One SSH channel maps to one session: parse the login name, connect to the
//! daemon, resolve the in-instance account, wire the exec engine to the
//! channel's byte streams and report the exit code back to the client. The
//! dispatcher is the only place that writes user-visible error messages.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::server::{Handle, Msg};
use russh::{Channel, ChannelId};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::agent::AgentForwarder;
use crate::banner;
use crate::config::{GatewayConfig, ShellMode};
use crate::error::{exit, GatewayError};
use crate::incus::{
    IncusClient, InstanceExec, InstanceUser, ProxyDevice, ProxyDeviceHandle, Window,
};
use crate::login::LoginDescriptor;
use crate::subshell;

/// PTY request captured from the SSH layer.
#[derive(Debug, Clone)]
pub struct PtyParams {
    pub term: String,
    pub window: Window,
}

/// Inputs gathered by the SSH handler before dispatch.
pub struct SessionParams {
    pub login_name: String,
    pub peer: SocketAddr,
    /// Raw exec command; `None` for shell requests.
    pub raw_command: Option<String>,
    pub pty: Option<PtyParams>,
    pub env: Vec<(String, String)>,
    pub agent_requested: bool,
}

/// The channel plumbing a session runs over.
pub struct SessionIo {
    pub handle: Handle,
    pub channel: Channel<Msg>,
    pub channel_id: ChannelId,
    pub win_ch: mpsc::Receiver<Window>,
    pub signals: mpsc::Receiver<i32>,
    pub cancel: CancellationToken,
}

/// Serve one session to completion and report its exit status.
pub async fn run(config: Arc<GatewayConfig>, params: SessionParams, io: SessionIo) {
    let handle = io.handle.clone();
    let channel_id = io.channel_id;

    let code = dispatch(&config, params, io).await;

    let status = u32::try_from(code).unwrap_or(exit::CONNECTION_ERROR as u32);
    let _ = handle.exit_status_request(channel_id, status).await;
    let _ = handle.eof(channel_id).await;
    let _ = handle.close(channel_id).await;
}

async fn dispatch(config: &GatewayConfig, params: SessionParams, io: SessionIo) -> i32 {
    let SessionIo {
        handle,
        channel,
        channel_id: _,
        win_ch,
        signals,
        cancel,
    } = io;

    let (mut read_half, write_half) = channel.split();
    let mut stdout = write_half.make_writer();
    let mut stderr = write_half.make_writer_ext(Some(1));
    let stdin = read_half.make_reader();

    let lu = match LoginDescriptor::parse(&params.login_name, &config.default_instance_user) {
        Ok(lu) => lu,
        Err(err) => {
            warn!("rejecting session: {err}");
            let _ = stdout.write_all(b"invalid connection data\n").await;
            return exit::INVALID_LOGIN;
        }
    };
    debug!(login = %lu, peer = %params.peer, "dispatching session");

    if lu.command && lu.instance_user == "root" {
        return subshell::run(
            &config.incus_socket,
            params.pty.as_ref(),
            stdin,
            stdout,
            stderr,
            win_ch,
            &cancel,
        )
        .await;
    }
    // A `%shell` instance for any other user falls through to the normal
    // lookup below, which cannot succeed.

    let Some(socket) = config.socket_for_remote(lu.remote.as_deref()) else {
        error!(remote = ?lu.remote, "login names an unknown remote");
        return exit::CONNECTION_ERROR;
    };

    let mut client = IncusClient::new(
        socket.to_path_buf(),
        Duration::from_secs(config.connect_timeout_secs),
    );
    if let Err(err) = client.connect().await {
        error!("failed to connect to incus: {err}");
        return exit::CONNECTION_ERROR;
    }

    let result = proxy_session(
        config, &params, &lu, &mut client, stdin, &mut stdout, &mut stderr, win_ch, signals,
        &handle, &cancel,
    )
    .await;
    client.disconnect();

    match result {
        Ok(code) => code,
        Err(GatewayError::Cancelled) => {
            debug!("session cancelled by client disconnect");
            exit::CONNECTION_ERROR
        }
        Err(err) => {
            error!(login = %lu, "session failed: {err}");
            if let Some(message) = err.user_message() {
                let _ = stdout.write_all(message.as_bytes()).await;
            }
            err.exit_code()
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn proxy_session<R, W, E>(
    config: &GatewayConfig,
    params: &SessionParams,
    lu: &LoginDescriptor,
    client: &mut IncusClient,
    stdin: R,
    stdout: &mut W,
    stderr: &mut E,
    win_ch: mpsc::Receiver<Window>,
    signals: mpsc::Receiver<i32>,
    handle: &Handle,
    cancel: &CancellationToken,
) -> Result<i32, GatewayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    if !lu.is_default_project() {
        client.use_project(&lu.project).await?;
    }

    let iu = client
        .instance_user(&lu.project, &lu.instance, &lu.instance_user)
        .await?
        .ok_or_else(|| GatewayError::NoSuchUser(lu.instance_user.clone()))?;

    let term = params
        .pty
        .as_ref()
        .map(|p| p.term.as_str())
        .filter(|t| !t.is_empty());
    let mut env = session_env(&params.env, term, &iu);

    // Agent forwarding is best effort: a failed setup downgrades the
    // session instead of ending it.
    let mut device: Option<ProxyDeviceHandle> = None;
    let mut forwarder: Option<AgentForwarder> = None;
    if params.agent_requested {
        match AgentForwarder::bind(handle.clone(), cancel.child_token()).await {
            Ok(fwd) => {
                let mut proxy = ProxyDeviceHandle::new(ProxyDevice {
                    project: lu.project.clone(),
                    instance: lu.instance.clone(),
                    source: fwd.source().display().to_string(),
                    uid: iu.uid,
                    gid: iu.gid,
                    mode: "0660".to_string(),
                });
                match proxy.add_socket(client).await {
                    Ok(path) => {
                        env.insert("SSH_AUTH_SOCK".to_string(), path);
                        device = Some(proxy);
                        forwarder = Some(fwd);
                    }
                    Err(err) => {
                        error!("failed to add agent socket: {err}");
                        fwd.close().await;
                    }
                }
            }
            Err(err) => error!("failed to create agent listener: {err}"),
        }
    }

    let (cmd, run_as_user) =
        build_command(params.raw_command.as_deref(), config.shell, &iu, &params.peer);
    debug!(%cmd, run_as_user, is_pty = params.pty.is_some(), "starting exec");

    if config.banner && params.pty.is_some() && params.raw_command.is_none() {
        let hostname = hostname().await;
        let _ = stdout
            .write_all(banner::render(lu, hostname.as_deref()).as_bytes())
            .await;
    }

    let (user, group) = if run_as_user { (iu.uid, iu.gid) } else { (0, 0) };
    let exec = InstanceExec {
        instance: lu.instance.clone(),
        cmd,
        env,
        is_pty: params.pty.is_some(),
        window: params.pty.as_ref().map(|p| p.window).unwrap_or_default(),
        win_ch,
        signals,
        stdin,
        stdout,
        stderr,
        user,
        group,
        cwd: iu.dir.clone(),
    };
    let result = client.instance_exec(exec).exec(cancel).await;

    // Cleanup runs on every path out of the exec, success or not.
    if let Some(mut device) = device {
        if let Err(err) = device.remove_socket(client).await {
            warn!("failed to remove agent socket: {err}");
        }
    }
    if let Some(forwarder) = forwarder {
        forwarder.close().await;
    }

    // A 404 on the exec itself means the instance disappeared between the
    // user lookup and the exec.
    result.map_err(|err| match err {
        GatewayError::NotFound => GatewayError::NoSuchInstance(lu.instance.clone()),
        err => err,
    })
}

/// Environment handed to the in-instance process: the client's requests plus
/// the identity of the resolved account.
fn session_env(
    requested: &[(String, String)],
    term: Option<&str>,
    iu: &InstanceUser,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = requested.iter().cloned().collect();
    env.insert(
        "TERM".to_string(),
        term.unwrap_or("xterm-256color").to_string(),
    );
    env.insert("USER".to_string(), iu.user.clone());
    env.insert("HOME".to_string(), iu.dir.clone());
    env.insert("SHELL".to_string(), iu.shell.clone());
    env
}

/// Build the in-instance command string. The second value is true when the
/// exec must run directly as the resolved account rather than delegating to
/// the instance's login machinery.
fn build_command(
    raw: Option<&str>,
    mode: ShellMode,
    iu: &InstanceUser,
    peer: &SocketAddr,
) -> (String, bool) {
    match raw.filter(|r| !r.is_empty()) {
        None => match mode {
            ShellMode::Su => (format!(r#"su - "{}""#, iu.user), false),
            ShellMode::Login => (
                format!(r#"login -h "{}" -f "{}""#, peer.ip(), iu.user),
                false,
            ),
            ShellMode::Shell => (format!("{} -l", iu.shell), true),
        },
        // A raw command always runs as the target user, whatever the shell
        // mode. `$` means the client expects shell interpretation.
        Some(raw) => {
            let cmd = if raw.contains('$') {
                format!(r#"{} -c "{}""#, iu.shell, raw)
            } else {
                raw.to_string()
            };
            (cmd, true)
        }
    }
}

async fn hostname() -> Option<String> {
    tokio::fs::read_to_string("/etc/hostname")
        .await
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> InstanceUser {
        InstanceUser {
            user: "alice".to_string(),
            uid: 1000,
            gid: 1000,
            dir: "/home/alice".to_string(),
            shell: "/bin/bash".to_string(),
        }
    }

    fn peer() -> SocketAddr {
        "192.0.2.10:50022".parse().unwrap()
    }

    #[test]
    fn test_build_command_shell_mode() {
        let (cmd, as_user) = build_command(None, ShellMode::Shell, &alice(), &peer());
        assert_eq!(cmd, "/bin/bash -l");
        assert!(as_user);
    }

    #[test]
    fn test_build_command_su_mode() {
        let (cmd, as_user) = build_command(None, ShellMode::Su, &alice(), &peer());
        assert_eq!(cmd, r#"su - "alice""#);
        assert!(!as_user);
    }

    #[test]
    fn test_build_command_login_mode() {
        let (cmd, as_user) = build_command(None, ShellMode::Login, &alice(), &peer());
        assert_eq!(cmd, r#"login -h "192.0.2.10" -f "alice""#);
        assert!(!as_user);
    }

    #[test]
    fn test_build_command_empty_raw_selects_shell_path() {
        let (cmd, _) = build_command(Some(""), ShellMode::Shell, &alice(), &peer());
        assert_eq!(cmd, "/bin/bash -l");
    }

    #[test]
    fn test_build_command_raw_with_variable_is_wrapped() {
        let (cmd, as_user) = build_command(Some("echo $USER"), ShellMode::Shell, &alice(), &peer());
        assert_eq!(cmd, r#"/bin/bash -c "echo $USER""#);
        assert!(as_user);
    }

    #[test]
    fn test_build_command_plain_raw_runs_as_given() {
        let (cmd, as_user) = build_command(Some("ls -la /tmp"), ShellMode::Shell, &alice(), &peer());
        assert_eq!(cmd, "ls -la /tmp");
        assert!(as_user);
    }

    #[test]
    fn test_built_commands_tokenise_for_exec() {
        let (cmd, _) = build_command(None, ShellMode::Su, &alice(), &peer());
        assert_eq!(shlex::split(&cmd).unwrap(), ["su", "-", "alice"]);

        let (cmd, _) = build_command(None, ShellMode::Login, &alice(), &peer());
        assert_eq!(
            shlex::split(&cmd).unwrap(),
            ["login", "-h", "192.0.2.10", "-f", "alice"]
        );

        let (cmd, _) = build_command(Some("echo $USER"), ShellMode::Shell, &alice(), &peer());
        assert_eq!(
            shlex::split(&cmd).unwrap(),
            ["/bin/bash", "-c", "echo $USER"]
        );
    }

    #[test]
    fn test_build_command_raw_always_runs_as_user() {
        // Shell mode only affects the no-command path.
        for mode in [ShellMode::Su, ShellMode::Login, ShellMode::Shell] {
            let (_, as_user) = build_command(Some("uptime"), mode, &alice(), &peer());
            assert!(as_user);
        }
    }

    #[test]
    fn test_session_env_superset() {
        let requested = vec![
            ("LANG".to_string(), "C.UTF-8".to_string()),
            ("TERM".to_string(), "dumb".to_string()),
        ];
        let env = session_env(&requested, Some("xterm-256color"), &alice());

        assert_eq!(env["LANG"], "C.UTF-8");
        // The PTY term wins over a TERM sent as an env request.
        assert_eq!(env["TERM"], "xterm-256color");
        assert_eq!(env["USER"], "alice");
        assert_eq!(env["HOME"], "/home/alice");
        assert_eq!(env["SHELL"], "/bin/bash");
    }

    #[test]
    fn test_session_env_term_default() {
        let env = session_env(&[], None, &alice());
        assert_eq!(env["TERM"], "xterm-256color");
    }
}
