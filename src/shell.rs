//! Interactive shell sessions, bridged to a pair of message channels.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::*;
use behaviour::CliBehaviour;
use channel::ChanPurpose;
use client::{ChanEvent, Session};
use config::ConnectParams;
use event::{ControlMessage, ShellEvent, ShellInput};
use packets::PubKey;

/// Reports handshake progress to the caller as `info` messages
struct ShellBehaviour<'a> {
    events: &'a mpsc::Sender<ShellEvent>,
}

impl ShellBehaviour<'_> {
    fn info(&self, message: String) {
        // only informational, dropped if the caller is behind
        if self.events.try_send(ShellEvent::Control(ControlMessage::info(message))).is_err() {
            debug!("Dropped info message");
        }
    }
}

impl CliBehaviour for ShellBehaviour<'_> {
    fn valid_hostkey(&mut self, key: &PubKey, fingerprint: &str) -> bool {
        let desc = match key.algorithm_name() {
            Ok(name) => format!("{name} {fingerprint}"),
            Err(unk) => format!("{unk} {fingerprint}"),
        };
        warn!("Host key {desc} is not verified");
        self.info(format!("Server host key {desc} (not verified)"));
        true
    }

    fn show_banner(&mut self, banner: &str) {
        self.info(banner.to_string())
    }
}

/// Sends an event, returning `false` if the caller has gone away
async fn emit(events: &mpsc::Sender<ShellEvent>, ev: ShellEvent) -> bool {
    events.send(ev).await.is_ok()
}

async fn finish(events: &mpsc::Sender<ShellEvent>, r: &Result<()>) {
    if let Err(e) = r {
        info!("Shell session ended: {e}");
        emit(events, ShellEvent::Control(ControlMessage::error(e.to_string()))).await;
    }
    emit(events, ShellEvent::Control(ControlMessage::Disconnected)).await;
}

/// Connects over TCP and runs an interactive shell, see [`run_shell()`].
pub async fn connect_shell(
    params: &ConnectParams,
    input: mpsc::Receiver<ShellInput>,
    events: mpsc::Sender<ShellEvent>,
) -> Result<()> {
    match client::connect_tcp(params).await {
        Ok(stream) => run_shell(stream, params, input, events).await,
        Err(e) => {
            let r = Err(e);
            finish(&events, &r).await;
            r
        }
    }
}

/// Runs an interactive shell over `stream`.
///
/// A pty is requested with `params.pty`. Input from `input` is sent as
/// terminal keystrokes, output is sent to `events` as
/// [`ShellEvent::Output`]. A `connected` control message is sent once
/// the shell has started, and `disconnected` when the session ends,
/// preceded by `error` on failure.
///
/// Closing `input` closes the session.
pub async fn run_shell<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    params: &ConnectParams,
    mut input: mpsc::Receiver<ShellInput>,
    events: mpsc::Sender<ShellEvent>,
) -> Result<()> {
    let r = shell_session(stream, params, &mut input, &events).await;
    finish(&events, &r).await;
    r
}

async fn shell_session<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    params: &ConnectParams,
    input: &mut mpsc::Receiver<ShellInput>,
    events: &mpsc::Sender<ShellEvent>,
) -> Result<()> {
    let mut b = ShellBehaviour { events };
    let purpose = ChanPurpose::Shell(params.pty.clone());
    let mut sess = Session::establish(stream, params, &purpose, &mut b).await?;
    info!("Shell started on {}", params.target());
    if !emit(events, ShellEvent::Control(ControlMessage::Connected)).await {
        return sess.close().await;
    }

    // keystrokes not yet sent, waiting for window
    let mut pending = Vec::new();
    loop {
        if !pending.is_empty() {
            let n = sess.queue_data(&pending)?;
            pending.drain(..n);
            sess.flush().await?;
        }

        tokio::select! {
            // input isn't read while earlier input is waiting for window
            msg = input.recv(), if pending.is_empty() => {
                match msg {
                    Some(m) => {
                        if let Some(bytes) = m.terminal_bytes() {
                            pending.extend_from_slice(bytes);
                        }
                    }
                    None => {
                        debug!("Input closed");
                        break;
                    }
                }
            }
            ev = sess.step(None) => {
                match ev? {
                    Some(ChanEvent::Data(data)) | Some(ChanEvent::ExtData { data, .. }) => {
                        if !emit(events, ShellEvent::Output(data)).await {
                            debug!("Event receiver closed");
                            break;
                        }
                    }
                    Some(ChanEvent::Eof) => debug!("Shell sent EOF"),
                    Some(ChanEvent::ExitStatus(status)) => {
                        let m = ControlMessage::info(format!("Shell exited with status {status}"));
                        emit(events, ShellEvent::Control(m)).await;
                    }
                    Some(ChanEvent::Closed) => {
                        debug!("Shell closed by server");
                        break;
                    }
                    // window adjust or similar
                    None => (),
                }
            }
        }
    }
    sess.close().await
}
