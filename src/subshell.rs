//! Self-service subshell: a bounded interactive loop that runs the `incus`
//! CLI on the host under a local PTY. Reachable only as `root` + `%shell`.

use std::path::Path;

use pty_process::Size;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::exit;
use crate::incus::Window;
use crate::session::PtyParams;

const WELCOME: &str = "\nincus shell emulator. Use Ctrl+c to exit\n\nHit Enter or type 'help' for help\n";

/// Fixed read-execute loop handed to bash; every input line becomes an
/// `incus` invocation.
const COMMAND_LOOP: &str =
    "while true; do read -r -p \"\nType incus command:\n> incus \" a; incus $a; done";

const SUBSHELL_PATH: &str = "/bin:/usr/bin:/snap/bin:/usr/local/bin";

/// Run the subshell over the session's byte streams; returns the exit code
/// to report to the SSH client.
pub async fn run<R, W, E>(
    incus_socket: &Path,
    pty: Option<&PtyParams>,
    mut stdin: R,
    mut stdout: W,
    mut stderr: E,
    mut win_ch: mpsc::Receiver<Window>,
    cancel: &CancellationToken,
) -> i32
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let Some(pty_req) = pty else {
        let _ = stderr.write_all(b"No PTY requested.\n").await;
        return exit::CONNECTION_ERROR;
    };

    let (pty, pts) = match pty_process::open() {
        Ok(pair) => pair,
        Err(err) => {
            error!("pty allocation failed: {err}");
            let _ = stdout.write_all(b"Couldn't allocate PTY\n").await;
            return exit::CONNECTION_ERROR;
        }
    };

    let mut child = match pty_process::Command::new("bash")
        .arg("-c")
        .arg(COMMAND_LOOP)
        .env("TERM", &pty_req.term)
        .env("PATH", SUBSHELL_PATH)
        .env("INCUS_SOCKET", incus_socket)
        .spawn(pts)
    {
        Ok(child) => child,
        Err(err) => {
            error!("subshell spawn failed: {err}");
            let _ = stdout.write_all(b"Couldn't allocate PTY\n").await;
            return exit::CONNECTION_ERROR;
        }
    };

    let _ = stdout.write_all(WELCOME.as_bytes()).await;

    let (mut pty_reader, mut pty_writer) = pty.into_split();
    if let Err(err) = pty_writer.resize(Size::new(
        pty_req.window.height as u16,
        pty_req.window.width as u16,
    )) {
        debug!("initial pty resize failed: {err}");
    }

    // Client input and resize events flow towards the PTY until the session
    // ends; completion of this block never ends the subshell by itself.
    let feeds = async {
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            tokio::select! {
                read = stdin.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if pty_writer.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                },
                win = win_ch.recv() => match win {
                    Some(win) => {
                        if let Err(err) =
                            pty_writer.resize(Size::new(win.height as u16, win.width as u16))
                        {
                            debug!("pty resize failed: {err}");
                        }
                    }
                    None => break,
                },
            }
        }
        std::future::pending::<()>().await
    };
    tokio::pin!(feeds);

    let output = async {
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            match pty_reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdout.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = stdout.flush().await;
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return exit::CONNECTION_ERROR;
        }
        _ = output => {}
        _ = &mut feeds => {}
    }

    match child.wait().await {
        Ok(status) => status.code().unwrap_or(exit::CONNECTION_ERROR),
        Err(err) => {
            error!("subshell wait failed: {err}");
            exit::CONNECTION_ERROR
        }
    }
}
