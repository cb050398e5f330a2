//! Exec engine: bridges an SSH session's byte streams onto an Incus exec
//! operation.
//!
//! An exec runs through these phases: the operation is created and its
//! websockets attached (starting), the copiers stream bytes (running), the
//! stdout/stderr drains observe EOF after the remote exits (draining), and
//! only then is the exit code collected from the operation (done). stdin may
//! be abandoned once the remote has closed its input. Cancelling the session
//! token tears the websockets down and unblocks every copier.

use std::collections::HashMap;
use std::path::Path;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use hyper::Method;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::IncusClient;
use crate::error::GatewayError;

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Window {
    pub width: u32,
    pub height: u32,
}

/// Everything the exec engine consumes for one in-instance command.
///
/// The engine owns the resize and signal streams for the duration of the
/// exec; the producer side must close them on every exit path.
pub struct InstanceExec<R, W, E> {
    pub instance: String,
    /// Single shell-style command string; tokenised before dispatch.
    pub cmd: String,
    pub env: HashMap<String, String>,
    pub is_pty: bool,
    pub window: Window,
    pub win_ch: mpsc::Receiver<Window>,
    pub signals: mpsc::Receiver<i32>,
    pub stdin: R,
    pub stdout: W,
    pub stderr: E,
    /// Target uid; zero delegates to the instance's own login mechanism.
    pub user: u32,
    pub group: u32,
    pub cwd: String,
}

impl IncusClient {
    pub fn instance_exec<R, W, E>(&mut self, exec: InstanceExec<R, W, E>) -> InstanceExecHandle<'_, R, W, E> {
        InstanceExecHandle { client: self, exec }
    }
}

pub struct InstanceExecHandle<'c, R, W, E> {
    client: &'c mut IncusClient,
    exec: InstanceExec<R, W, E>,
}

impl<R, W, E> InstanceExecHandle<'_, R, W, E>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    /// Run the command and return its exit code.
    pub async fn exec(self, cancel: &CancellationToken) -> Result<i32, GatewayError> {
        let Self { client, exec } = self;
        let InstanceExec {
            instance,
            cmd,
            env,
            is_pty,
            window,
            mut win_ch,
            mut signals,
            mut stdin,
            mut stdout,
            mut stderr,
            user,
            group,
            cwd,
        } = exec;

        let command = shlex::split(&cmd)
            .filter(|words| !words.is_empty())
            .ok_or_else(|| GatewayError::Internal(format!("unparseable command: {cmd}")))?;

        let payload = exec_payload(command, &env, is_pty, window, user, group, &cwd);
        let path = client.query_path(&format!("/1.0/instances/{instance}/exec"), &[]);
        let resp = client.api(Method::POST, path, Some(payload)).await?;
        if resp.operation.is_empty() {
            return Err(GatewayError::Backend(
                "exec returned no operation".to_string(),
            ));
        }
        let operation = resp.operation;
        let fds = resp.metadata["metadata"]["fds"].clone();

        let stream_secret = |name: &str| -> Result<String, GatewayError> {
            fds[name].as_str().map(str::to_string).ok_or_else(|| {
                GatewayError::Backend(format!("exec operation exposes no '{name}' stream"))
            })
        };
        let ws_path = |secret: String| {
            client.query_path(&format!("{operation}/websocket"), &[("secret", &secret)])
        };

        let control_path = ws_path(stream_secret("control")?);
        let stdin_path = ws_path(stream_secret("0")?);
        let output_paths = if is_pty {
            None
        } else {
            Some((ws_path(stream_secret("1")?), ws_path(stream_secret("2")?)))
        };

        let socket = client.socket().to_path_buf();
        let mut control = ws_connect(&socket, &control_path).await?;
        let data_ws = ws_connect(&socket, &stdin_path).await?;
        let (mut stdin_sink, data_stream) = data_ws.split();

        let (mut out_stream, mut err_stream) = match &output_paths {
            None => (data_stream, None),
            Some((out_path, err_path)) => {
                let out_ws = ws_connect(&socket, out_path).await?;
                let err_ws = ws_connect(&socket, err_path).await?;
                let (_, out_stream) = out_ws.split();
                let (_, err_stream) = err_ws.split();
                (out_stream, Some(err_stream))
            }
        };

        if is_pty {
            let _ = control
                .send(Message::Text(resize_command(window).into()))
                .await;
        }

        // Feeds never resolve the select below; they only run alongside the
        // drains until the remote output has been fully observed.
        let feeds = async {
            let stdin_copy = copy_stdin(&mut stdin, &mut stdin_sink, !is_pty);
            let control_loop = drive_control(&mut control, &mut win_ch, &mut signals, is_pty);
            tokio::join!(stdin_copy, control_loop);
            std::future::pending::<()>().await
        };
        tokio::pin!(feeds);

        let drains = async {
            let out = drain_output(&mut out_stream, &mut stdout);
            let err = async {
                if let Some(stream) = err_stream.as_mut() {
                    drain_output(stream, &mut stderr).await;
                }
            };
            tokio::join!(out, err);
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%instance, "exec cancelled");
                return Err(GatewayError::Cancelled);
            }
            _ = drains => {}
            _ = &mut feeds => {}
        }

        let state = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            state = client.wait_operation(&operation) => state?,
        };
        let code = state["metadata"]["return"].as_i64().unwrap_or(-1);
        debug!(%instance, code, "exec finished");
        Ok(code as i32)
    }
}

fn exec_payload(
    command: Vec<String>,
    env: &HashMap<String, String>,
    is_pty: bool,
    window: Window,
    user: u32,
    group: u32,
    cwd: &str,
) -> Value {
    let mut payload = json!({
        "command": command,
        "environment": env,
        "interactive": is_pty,
        "wait-for-websocket": true,
        "width": window.width,
        "height": window.height,
        "record-output": false,
    });
    // Zero means "let the instance's login machinery pick the identity".
    if user != 0 {
        payload["user"] = json!(user);
    }
    if group != 0 {
        payload["group"] = json!(group);
    }
    if !cwd.is_empty() {
        payload["cwd"] = json!(cwd);
    }
    payload
}

async fn ws_connect(
    socket: &Path,
    path: &str,
) -> Result<WebSocketStream<UnixStream>, GatewayError> {
    let stream = UnixStream::connect(socket).await.map_err(|err| {
        GatewayError::BackendUnavailable(format!("connecting to {}: {err}", socket.display()))
    })?;
    let request = format!("ws://incus{path}")
        .into_client_request()
        .map_err(|err| GatewayError::Internal(format!("websocket request: {err}")))?;
    let (ws, _response) = client_async(request, stream)
        .await
        .map_err(|err| GatewayError::Backend(format!("websocket attach: {err}")))?;
    Ok(ws)
}

/// Copy SSH stdin into the remote stdin websocket. On EOF the remote input
/// is half-closed unless the stream doubles as the PTY output channel.
async fn copy_stdin<R: AsyncRead + Unpin>(
    stdin: &mut R,
    sink: &mut SplitSink<WebSocketStream<UnixStream>, Message>,
    half_close_on_eof: bool,
) {
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if sink.send(Message::Binary(buf[..n].to_vec().into())).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                debug!("stdin copy error: {err}");
                return;
            }
        }
    }
    if half_close_on_eof {
        let _ = sink.send(Message::Close(None)).await;
    }
}

async fn drain_output<W: AsyncWrite + Unpin>(
    stream: &mut SplitStream<WebSocketStream<UnixStream>>,
    out: &mut W,
) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                if out.write_all(&data).await.is_err() {
                    break;
                }
            }
            Ok(Message::Text(text)) => {
                if out.write_all(text.as_bytes()).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!("output stream error: {err}");
                break;
            }
        }
    }
    let _ = out.flush().await;
}

/// Forward resize events and signals over the control websocket until both
/// producer streams have closed.
async fn drive_control(
    control: &mut WebSocketStream<UnixStream>,
    win_ch: &mut mpsc::Receiver<Window>,
    signals: &mut mpsc::Receiver<i32>,
    is_pty: bool,
) {
    let mut win_open = true;
    let mut sig_open = true;
    while win_open || sig_open {
        tokio::select! {
            win = win_ch.recv(), if win_open => match win {
                Some(win) => {
                    if is_pty
                        && control
                            .send(Message::Text(resize_command(win).into()))
                            .await
                            .is_err()
                    {
                        return;
                    }
                }
                None => win_open = false,
            },
            sig = signals.recv(), if sig_open => match sig {
                Some(sig) => {
                    if control
                        .send(Message::Text(signal_command(sig).into()))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                None => sig_open = false,
            },
        }
    }
}

fn resize_command(window: Window) -> String {
    json!({
        "command": "window-resize",
        "args": {
            "width": window.width.to_string(),
            "height": window.height.to_string(),
        }
    })
    .to_string()
}

fn signal_command(signal: i32) -> String {
    json!({ "command": "signal", "signal": signal }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_command_encoding() {
        let parsed: Value = serde_json::from_str(&resize_command(Window {
            width: 120,
            height: 40,
        }))
        .unwrap();
        assert_eq!(parsed["command"], "window-resize");
        // Incus expects string-typed dimensions in the args map.
        assert_eq!(parsed["args"]["width"], "120");
        assert_eq!(parsed["args"]["height"], "40");
    }

    #[test]
    fn test_signal_command_encoding() {
        let parsed: Value = serde_json::from_str(&signal_command(15)).unwrap();
        assert_eq!(parsed["command"], "signal");
        assert_eq!(parsed["signal"], 15);
    }

    #[test]
    fn test_exec_payload_delegates_identity_when_zero() {
        let env = HashMap::new();
        let payload = exec_payload(
            vec!["su".into(), "-".into(), "alice".into()],
            &env,
            true,
            Window { width: 80, height: 24 },
            0,
            0,
            "",
        );
        assert!(payload.get("user").is_none());
        assert!(payload.get("group").is_none());
        assert!(payload.get("cwd").is_none());
        assert_eq!(payload["interactive"], true);
        assert_eq!(payload["wait-for-websocket"], true);
    }

    #[test]
    fn test_exec_payload_sets_target_identity() {
        let mut env = HashMap::new();
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        let payload = exec_payload(
            vec!["/bin/bash".into(), "-l".into()],
            &env,
            true,
            Window { width: 80, height: 24 },
            1000,
            1000,
            "/home/alice",
        );
        assert_eq!(payload["user"], 1000);
        assert_eq!(payload["group"], 1000);
        assert_eq!(payload["cwd"], "/home/alice");
        assert_eq!(payload["environment"]["TERM"], "xterm-256color");
        assert_eq!(payload["command"][0], "/bin/bash");
    }
}
