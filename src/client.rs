//! An authenticated session with its one channel.
//!
//! Both the interactive shell and the subsystem client are built on [`Session`],
//! differing only in the [`ChanPurpose`] and how data reaches the caller.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::*;
use behaviour::CliBehaviour;
use channel::{ChanPurpose, Channel, LOCAL_CHAN};
use config::ConnectParams;
use conn::{Conn, ConnState};
use packets::{ChannelReqType, GlobalRequest, Packet};
use sshwire::BinString;
use traffic::InPayload;

/// Something that happened on the channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChanEvent {
    Data(Vec<u8>),
    /// Extended data, `code` 1 is stderr
    ExtData { code: u32, data: Vec<u8> },
    /// The server won't send more data
    Eof,
    ExitStatus(u32),
    /// The server closed the channel
    Closed,
}

/// Opens a TCP connection to the target in `params`, bounded by its timeout.
pub(crate) async fn connect_tcp(params: &ConnectParams) -> Result<TcpStream> {
    debug!("Connecting to {}", params.target());
    let stream = conn::timed(
        params.timeout,
        "connect",
        TcpStream::connect((params.host.as_str(), params.port)),
    )
    .await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Result of handling one received packet
enum Dispatched {
    Event(ChanEvent),
    /// CHANNEL_SUCCESS or CHANNEL_FAILURE
    Reply(bool),
    None,
}

pub(crate) struct Session<S> {
    conn: Conn<S>,
    chan: Channel,
    /// Events that arrived while waiting for something else
    inbox: VecDeque<ChanEvent>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    /// Runs the handshake, authenticates, opens a channel and makes the
    /// requests for `purpose`. Returns once the data phase is reached.
    pub async fn establish(
        stream: S,
        params: &ConnectParams,
        purpose: &ChanPurpose,
        b: &mut impl CliBehaviour,
    ) -> Result<Self> {
        let mut conn = Conn::new(stream, params.timeout);
        conn.handshake(params.verify_hostkey_signature, b).await?;
        cliauth::authenticate(&mut conn, &params.username, &params.auth, b).await?;

        let mut sess = Session { conn, chan: Channel::new(LOCAL_CHAN), inbox: VecDeque::new() };
        sess.open().await?;

        for (req, err) in purpose.requests() {
            if !sess.request(req).await? {
                debug!("Request failed: {err}");
                return Err(err);
            }
        }
        sess.conn.set_state(ConnState::DataPhase);
        Ok(sess)
    }

    async fn open(&mut self) -> Result<()> {
        self.conn.set_state(ConnState::ChannelOpen);
        self.conn.send(self.chan.open_packet()).await?;

        loop {
            let p = self.conn.recv("channel open").await?;
            match p.packet()? {
                Packet::ChannelOpenConfirmation(c) => {
                    return self.chan.open_confirmed(&c);
                }
                Packet::ChannelOpenFailure(f) => {
                    self.chan.check_num(f.num)?;
                    let desc = f.desc.to_lossy();
                    debug!("Channel open failed, reason {}: {desc}", f.reason);
                    self.conn.set_state(ConnState::Closed);
                    return Err(Error::ChannelOpenFailed { reason: f.reason, desc });
                }
                Packet::GlobalRequest(g) => self.global_request(&g)?,
                other => debug!("Ignoring {:?} while opening channel", other.message_num()),
            }
            self.conn.flush().await?;
        }
    }

    /// Sends a channel request wanting a reply. Returns whether it succeeded.
    async fn request(&mut self, req: ChannelReqType<'_>) -> Result<bool> {
        self.conn.set_state(ConnState::ChannelRequest);
        let name = req.name().trap()?;
        debug!("Requesting {name}");
        let num = self.chan.send_num()?;
        self.conn.send(packets::ChannelRequest { num, want_reply: true, req }).await?;

        loop {
            let p = self.conn.recv("channel request").await?;
            let reply = match self.dispatch(&p)? {
                Dispatched::Reply(ok) => Some(ok),
                Dispatched::Event(ChanEvent::Closed) => {
                    debug!("Channel closed during {name} request");
                    Some(false)
                }
                Dispatched::Event(e) => {
                    self.inbox.push_back(e);
                    None
                }
                Dispatched::None => None,
            };
            self.conn.flush().await?;
            if let Some(ok) = reply {
                debug!("{name} request {}", if ok { "succeeded" } else { "failed" });
                return Ok(ok);
            }
        }
    }

    fn global_request(&mut self, g: &GlobalRequest) -> Result<()> {
        warn!("Ignoring global request {:?}", g.req);
        if g.want_reply {
            self.conn.queue(packets::RequestFailure {})?;
        }
        Ok(())
    }

    /// Handles a connection layer packet. Replies are queued, not flushed.
    fn dispatch(&mut self, p: &InPayload) -> Result<Dispatched> {
        let d = match p.packet()? {
            Packet::ChannelData(d) => {
                self.chan.check_num(d.num)?;
                self.received(d.data.0.len())?;
                Dispatched::Event(ChanEvent::Data(d.data.0.to_vec()))
            }
            Packet::ChannelDataExt(d) => {
                self.chan.check_num(d.num)?;
                self.received(d.data.0.len())?;
                Dispatched::Event(ChanEvent::ExtData { code: d.code, data: d.data.0.to_vec() })
            }
            Packet::ChannelWindowAdjust(a) => {
                self.chan.check_num(a.num)?;
                self.chan.window_adjust(a.adjust)?;
                Dispatched::None
            }
            Packet::ChannelEof(e) => {
                self.chan.check_num(e.num)?;
                self.chan.handle_eof();
                Dispatched::Event(ChanEvent::Eof)
            }
            Packet::ChannelClose(c) => {
                self.chan.check_num(c.num)?;
                if let Some(p) = self.chan.handle_close()? {
                    self.conn.queue(p)?;
                }
                Dispatched::Event(ChanEvent::Closed)
            }
            Packet::ChannelRequest(r) => {
                self.chan.check_num(r.num)?;
                self.channel_request(&r)?
            }
            Packet::ChannelSuccess(s) => {
                self.chan.check_num(s.num)?;
                Dispatched::Reply(true)
            }
            Packet::ChannelFailure(f) => {
                self.chan.check_num(f.num)?;
                Dispatched::Reply(false)
            }
            Packet::GlobalRequest(g) => {
                self.global_request(&g)?;
                Dispatched::None
            }
            Packet::KexInit(_) => {
                warn!("Server started a rekey, not supported");
                return Err(Error::PacketWrong);
            }
            other => {
                debug!("Ignoring unexpected {:?}", other.message_num());
                Dispatched::None
            }
        };
        Ok(d)
    }

    fn channel_request(&mut self, r: &packets::ChannelRequest) -> Result<Dispatched> {
        match &r.req {
            ChannelReqType::ExitStatus(s) => {
                debug!("Exit status {}", s.status);
                self.chan.set_exit_status(s.status);
                Ok(Dispatched::Event(ChanEvent::ExitStatus(s.status)))
            }
            ChannelReqType::ExitSignal(s) => {
                info!("Remote exited with signal {} {}", s.signal, s.error.to_lossy());
                Ok(Dispatched::None)
            }
            other => {
                match other.name() {
                    Ok(n) => warn!("Unexpected channel request {n}"),
                    Err(u) => warn!("Unknown channel request {u}"),
                }
                if r.want_reply {
                    self.conn.queue(packets::ChannelFailure { num: self.chan.send_num()? })?;
                }
                Ok(Dispatched::None)
            }
        }
    }

    fn received(&mut self, len: usize) -> Result<()> {
        if let Some(adjust) = self.chan.received_data(len)? {
            self.conn.queue(adjust)?;
        }
        Ok(())
    }

    /// Receives and handles one packet, adding its event to the inbox.
    ///
    /// `timed` gives the phase name when the wait is bounded by the timeout.
    /// Cancel safe. The event is stored before any reply is flushed, so a
    /// cancelled flush leaves it in the inbox and the reply still queued.
    async fn pump(&mut self, timed: Option<&'static str>) -> Result<()> {
        let p = match timed {
            Some(phase) => self.conn.recv(phase).await?,
            None => self.conn.recv_untimed().await?,
        };
        match self.dispatch(&p)? {
            Dispatched::Event(e) => self.inbox.push_back(e),
            Dispatched::Reply(ok) => debug!("Unexpected channel reply {ok}"),
            Dispatched::None => (),
        }
        self.conn.flush().await
    }

    /// Returns a pending event or handles one packet, giving `None` when
    /// the packet wasn't a channel event (such as a window adjustment).
    ///
    /// `timed` is as for [`pump()`](Self::pump). Cancel safe, so may be
    /// used in a `select!`.
    pub async fn step(&mut self, timed: Option<&'static str>) -> Result<Option<ChanEvent>> {
        // replies left queued by a cancelled step
        self.conn.flush().await?;
        if let Some(e) = self.inbox.pop_front() {
            return Ok(Some(e));
        }
        if self.chan.is_closed() {
            return Err(Error::ChannelClosed);
        }
        self.pump(timed).await?;
        Ok(self.inbox.pop_front())
    }

    /// Returns the next channel event.
    pub async fn next_event(&mut self, timed: Option<&'static str>) -> Result<ChanEvent> {
        loop {
            if let Some(e) = self.step(timed).await? {
                return Ok(e);
            }
        }
    }

    /// Queues as much of `data` as the remote window allows,
    /// returning the length queued. Call [`flush()`](Self::flush) to send it.
    pub fn queue_data(&mut self, data: &[u8]) -> Result<usize> {
        if !self.chan.can_send() {
            return Err(Error::ChannelClosed);
        }
        let mut sent = 0;
        while sent < data.len() {
            let n = self.chan.send_chunk(data.len() - sent);
            if n == 0 {
                break;
            }
            let num = self.chan.send_num()?;
            self.conn.queue(packets::ChannelData {
                num,
                data: BinString(&data[sent..sent + n]),
            })?;
            self.chan.sent_data(n)?;
            trace!("Queued {n} bytes, remote window now {}", self.chan.send_window());
            sent += n;
        }
        Ok(sent)
    }

    /// Sends all of `data`, waiting for window adjustments as required.
    pub async fn send_data(&mut self, mut data: &[u8]) -> Result<()> {
        loop {
            let n = self.queue_data(data)?;
            data = &data[n..];
            self.conn.flush().await?;
            if data.is_empty() {
                return Ok(());
            }
            trace!("Waiting for window, {} bytes left", data.len());
            self.pump(Some("window")).await?;
        }
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.conn.flush().await
    }

    /// Sends EOF and close, waits for the server's close, and shuts down the stream.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(p) = self.chan.eof_packet()? {
            self.conn.queue(p)?;
        }
        if let Some(p) = self.chan.close_packet()? {
            self.conn.queue(p)?;
        }
        self.conn.flush().await?;

        let dur = self.conn.timeout();
        conn::timed(dur, "close", async {
            while !self.chan.is_closed() {
                self.pump(None).await?;
            }
            Ok::<_, Error>(())
        })
        .await?;
        for e in self.inbox.drain(..) {
            trace!("Discarding {e:?} while closing");
        }
        debug!("Channel closed");
        self.conn.shutdown().await
    }

    pub fn exit_status(&self) -> Option<u32> {
        self.chan.exit_status()
    }

    pub fn state(&self) -> ConnState {
        self.conn.state()
    }
}
