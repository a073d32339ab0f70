//! A channel running a subsystem or command, driven by the caller.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::*;
use behaviour::{CliBehaviour, DefaultBehaviour};
use channel::ChanPurpose;
use client::{ChanEvent, Session};
use config::ConnectParams;
use conn::ConnState;

/// A subsystem (such as `sftp`) or exec channel.
///
/// Data is pulled with [`read_channel_data()`](Self::read_channel_data)
/// and pushed with [`send_channel_data()`](Self::send_channel_data).
pub struct SubsystemClient<S> {
    sess: Session<S>,
    /// Set once the server has sent EOF or closed
    eof: bool,
}

/// Connects over TCP and starts a subsystem, or a command if `is_exec` is set.
pub async fn connect_subsystem(
    params: &ConnectParams,
    name: &str,
    is_exec: bool,
) -> Result<SubsystemClient<TcpStream>> {
    let stream = client::connect_tcp(params).await?;
    SubsystemClient::start(stream, params, name, is_exec, &mut DefaultBehaviour).await
}

impl<S: AsyncRead + AsyncWrite + Unpin> SubsystemClient<S> {
    /// Runs the session setup over `stream`. Returns once the
    /// server has accepted the subsystem or exec request.
    pub async fn start(
        stream: S,
        params: &ConnectParams,
        name: &str,
        is_exec: bool,
        b: &mut impl CliBehaviour,
    ) -> Result<Self> {
        let purpose = if is_exec {
            ChanPurpose::Exec(name.into())
        } else {
            ChanPurpose::Subsystem(name.into())
        };
        let sess = Session::establish(stream, params, &purpose, b).await?;
        debug!("Started {purpose:?} on {}", params.target());
        Ok(Self { sess, eof: false })
    }

    /// Sends all of `data`, waiting for the server's window when needed.
    pub async fn send_channel_data(&mut self, data: &[u8]) -> Result<()> {
        self.sess.send_data(data).await
    }

    /// Returns the next data from the server, or `None` at the end of the channel.
    ///
    /// Stderr data is returned the same as stdout.
    /// Fails with [`Error::Timeout`] if nothing arrives within the timeout.
    pub async fn read_channel_data(&mut self) -> Result<Option<Vec<u8>>> {
        if self.eof {
            return Ok(None);
        }
        loop {
            match self.sess.next_event(Some("read")).await? {
                ChanEvent::Data(d) => return Ok(Some(d)),
                ChanEvent::ExtData { code, data } => {
                    trace!("Extended data code {code}");
                    return Ok(Some(data));
                }
                ChanEvent::Eof | ChanEvent::Closed => {
                    self.eof = true;
                    return Ok(None);
                }
                ChanEvent::ExitStatus(_) => (),
            }
        }
    }

    /// Closes the channel and the connection.
    pub async fn close(mut self) -> Result<()> {
        self.sess.close().await
    }

    /// The remote command's exit status, once sent by the server.
    pub fn exit_status(&self) -> Option<u32> {
        self.sess.exit_status()
    }

    pub fn state(&self) -> ConnState {
        self.sess.state()
    }
}
