//! A single `"session"` channel, RFC4254 section 5.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;

use crate::*;
use packets::{ChannelOpenConfirmation, ChannelReqType, Packet, PtyReq};
use sshnames::*;
use sshwire::BinString;

/// Local channel number. Only one channel is opened per session.
pub(crate) const LOCAL_CHAN: u32 = 0;

/// What a channel is opened for
#[derive(Debug, Clone)]
pub enum ChanPurpose {
    /// A pty then a shell
    Shell(Pty),
    /// A named subsystem such as `"sftp"`
    Subsystem(String),
    /// A command
    Exec(String),
}

impl ChanPurpose {
    /// The requests to send after the channel is open, in order,
    /// paired with the error to return if the server fails them.
    pub(crate) fn requests(&self) -> Vec<(ChannelReqType<'_>, Error)> {
        match self {
            ChanPurpose::Shell(pty) => vec![
                (
                    ChannelReqType::Pty(pty.packet()),
                    Error::ChannelRequestFailed { req: "pty-req" },
                ),
                (ChannelReqType::Shell, Error::ChannelRequestFailed { req: "shell" }),
            ],
            ChanPurpose::Subsystem(name) => vec![(
                ChannelReqType::Subsystem(packets::Subsystem { subsystem: name.as_str().into() }),
                Error::SubsystemUnavailable { name: name.clone() },
            )],
            ChanPurpose::Exec(cmd) => vec![(
                ChannelReqType::Exec(packets::Exec { command: cmd.as_str().into() }),
                Error::ChannelRequestFailed { req: "exec" },
            )],
        }
    }
}

/// Terminal parameters for a `"pty-req"`
#[derive(Debug, Clone, PartialEq)]
pub struct Pty {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for Pty {
    fn default() -> Self {
        Pty {
            term: config::DEFAULT_TERM.into(),
            cols: config::DEFAULT_COLS,
            rows: config::DEFAULT_ROWS,
            width: 0,
            height: 0,
        }
    }
}

impl Pty {
    fn packet(&self) -> PtyReq<'_> {
        PtyReq {
            term: self.term.as_str().into(),
            cols: self.cols,
            rows: self.rows,
            width: self.width,
            height: self.height,
            // no terminal modes are set
            modes: BinString(&[]),
        }
    }
}

/// Per-direction channel variables
#[derive(Debug)]
struct ChanDir {
    /// `u32` rather than a local number because it can also be used
    /// for the sender-side number
    num: u32,
    max_packet: usize,
    window: usize,
}

pub(crate) struct Channel {
    recv: ChanDir,
    /// populated once the open is confirmed
    send: Option<ChanDir>,

    sent_eof: bool,
    sent_close: bool,
    recv_eof: bool,
    recv_close: bool,

    exit_status: Option<u32>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("recv", &self.recv)
            .field("send", &self.send)
            .field("recv_eof", &self.recv_eof)
            .field("recv_close", &self.recv_close)
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub fn new(num: u32) -> Self {
        Channel {
            recv: ChanDir {
                num,
                max_packet: config::DEFAULT_MAX_PACKET,
                window: config::DEFAULT_WINDOW,
            },
            send: None,
            sent_eof: false,
            sent_close: false,
            recv_eof: false,
            recv_close: false,
            exit_status: None,
        }
    }

    pub fn open_packet(&self) -> Packet<'static> {
        packets::ChannelOpen {
            ty: SSH_CHANNEL_SESSION,
            num: self.recv.num,
            initial_window: self.recv.window as u32,
            max_packet: self.recv.max_packet as u32,
        }
        .into()
    }

    pub fn open_confirmed(&mut self, p: &ChannelOpenConfirmation) -> Result<()> {
        self.check_num(p.num)?;
        if self.send.is_some() {
            return Err(Error::SSHProtoError);
        }
        debug!("Channel open, remote {} window {} max packet {}",
            p.sender_num, p.initial_window, p.max_packet);
        self.send = Some(ChanDir {
            num: p.sender_num,
            max_packet: p.max_packet as usize,
            window: p.initial_window as usize,
        });
        Ok(())
    }

    /// Local channel number
    pub fn num(&self) -> u32 {
        self.recv.num
    }

    /// Checks that a received packet is addressed to this channel
    pub fn check_num(&self, num: u32) -> Result<()> {
        if num == self.recv.num {
            Ok(())
        } else {
            debug!("Packet for unknown channel {num}");
            Err(Error::SSHProtoError)
        }
    }

    /// Remote channel number, fails if channel is in progress opening
    pub fn send_num(&self) -> Result<u32> {
        Ok(self.send.as_ref().trap()?.num)
    }

    /// The remote window
    pub fn send_window(&self) -> usize {
        self.send.as_ref().map_or(0, |s| s.window)
    }

    /// The local window
    pub fn recv_window(&self) -> usize {
        self.recv.window
    }

    /// Returns how many of `len` bytes may be sent as the next data packet
    pub fn send_chunk(&self, len: usize) -> usize {
        match &self.send {
            Some(s) if self.can_send() => len.min(s.window).min(s.max_packet),
            _ => 0,
        }
    }

    /// Debits the remote window for data sent
    pub fn sent_data(&mut self, len: usize) -> Result<()> {
        let send = self.send.as_mut().trap()?;
        send.window = send.window.checked_sub(len).trap()?;
        Ok(())
    }

    pub fn window_adjust(&mut self, adjust: u32) -> Result<()> {
        let send = self.send.as_mut().ok_or(Error::SSHProtoError)?;
        let w = send.window + adjust as usize;
        // RFC4254 5.2, the window may not exceed 2^32 - 1
        if w > u32::MAX as usize {
            debug!("Window adjust overflow");
            return Err(Error::SSHProtoError);
        }
        send.window = w;
        trace!("Window adjust {adjust}, now {w}");
        Ok(())
    }

    /// Debits the local window for data received, returns
    /// a window adjustment packet if it has run low.
    pub fn received_data(&mut self, len: usize) -> Result<Option<Packet<'static>>> {
        if len > self.recv.window {
            debug!("Peer sent {len} exceeding window {}", self.recv.window);
            return Err(Error::SSHProtoError);
        }
        if len > self.recv.max_packet {
            debug!("Peer sent {len} exceeding max packet");
            return Err(Error::SSHProtoError);
        }
        self.recv.window -= len;

        if self.recv.window < config::WINDOW_REFILL_THRESHOLD {
            let adjust = config::WINDOW_INCREMENT;
            self.recv.window += adjust;
            let num = self.send_num()?;
            Ok(Some(packets::ChannelWindowAdjust { num, adjust: adjust as u32 }.into()))
        } else {
            Ok(None)
        }
    }

    pub fn can_send(&self) -> bool {
        self.send.is_some() && !self.sent_eof && !self.sent_close && !self.recv_close
    }

    pub fn handle_eof(&mut self) {
        self.recv_eof = true;
    }

    /// Returns a close packet to send if we haven't already
    pub fn handle_close(&mut self) -> Result<Option<Packet<'static>>> {
        self.recv_close = true;
        self.close_packet()
    }

    pub fn eof_packet(&mut self) -> Result<Option<Packet<'static>>> {
        if self.sent_eof || self.sent_close || self.recv_close {
            return Ok(None);
        }
        self.sent_eof = true;
        Ok(Some(packets::ChannelEof { num: self.send_num()? }.into()))
    }

    pub fn close_packet(&mut self) -> Result<Option<Packet<'static>>> {
        if self.sent_close {
            return Ok(None);
        }
        self.sent_close = true;
        Ok(Some(packets::ChannelClose { num: self.send_num()? }.into()))
    }

    pub fn is_closed(&self) -> bool {
        self.recv_close
    }

    pub fn set_exit_status(&mut self, status: u32) {
        self.exit_status = Some(status)
    }

    pub fn exit_status(&self) -> Option<u32> {
        self.exit_status
    }
}

#[cfg(test)]
mod tests {
    use crate::*;
    use channel::*;
    use packets::ChannelOpenConfirmation;
    use probelog::init_test_log;
    use sshwire::write_ssh_vec;

    fn opened(window: u32, max_packet: u32) -> Channel {
        let mut c = Channel::new(LOCAL_CHAN);
        c.open_confirmed(&ChannelOpenConfirmation {
            num: LOCAL_CHAN,
            sender_num: 7,
            initial_window: window,
            max_packet,
        })
        .unwrap();
        c
    }

    #[test]
    fn send_window_accounting() {
        init_test_log();
        let mut c = opened(10, 32768);
        assert_eq!(c.send_chunk(25), 10);
        c.sent_data(10).unwrap();
        assert_eq!(c.send_window(), 0);
        assert_eq!(c.send_chunk(15), 0);
        c.window_adjust(1000).unwrap();
        assert_eq!(c.send_window(), 1000);
        c.sent_data(300).unwrap();
        assert_eq!(c.send_window(), 700);
    }

    #[test]
    fn chunk_limited_by_max_packet() {
        let c = opened(100_000, 4096);
        assert_eq!(c.send_chunk(10_000), 4096);
        assert_eq!(c.send_chunk(100), 100);
    }

    #[test]
    fn adjust_overflow() {
        let mut c = opened(u32::MAX - 5, 32768);
        assert!(c.window_adjust(5).is_ok());
        assert!(c.window_adjust(1).is_err());
    }

    #[test]
    fn local_window_refill() {
        let mut c = opened(0, 32768);
        let start = c.recv_window();
        let mut total = 0;
        // drain until an adjust is due
        let adjust = loop {
            let n = config::DEFAULT_MAX_PACKET;
            total += n;
            if let Some(p) = c.received_data(n).unwrap() {
                break p;
            }
            assert_eq!(c.recv_window(), start - total);
        };
        let b = write_ssh_vec(&adjust).unwrap();
        let Packet::ChannelWindowAdjust(a) = sshwire::packet_from_bytes(&b).unwrap() else {
            panic!()
        };
        assert_eq!(a.num, 7);
        assert_eq!(a.adjust as usize, config::WINDOW_INCREMENT);
        assert!(start - total < config::WINDOW_REFILL_THRESHOLD);
        assert_eq!(c.recv_window(), start - total + config::WINDOW_INCREMENT);
    }

    #[test]
    fn peer_exceeds_limits() {
        let mut c = opened(0, 32768);
        assert!(c.received_data(config::DEFAULT_MAX_PACKET + 1).is_err());
        c.recv.window = 100;
        assert!(c.received_data(101).is_err());
        assert!(c.received_data(100).unwrap().is_some());
    }

    #[test]
    fn close_sequence() {
        let mut c = opened(100, 100);
        assert!(c.eof_packet().unwrap().is_some());
        assert!(c.eof_packet().unwrap().is_none());
        assert!(!c.can_send());
        assert!(c.handle_close().unwrap().is_some());
        assert!(c.close_packet().unwrap().is_none());
        assert!(c.is_closed());
    }

    #[test]
    fn purpose_requests() {
        let p = ChanPurpose::Shell(Pty::default());
        let r = p.requests();
        assert_eq!(r.len(), 2);
        assert_eq!(r[0].0.name().unwrap(), "pty-req");
        assert_eq!(r[1].0.name().unwrap(), "shell");

        let p = ChanPurpose::Subsystem("sftp".into());
        let r = p.requests();
        assert!(matches!(&r[0].1, Error::SubsystemUnavailable { name } if name == "sftp"));

        let p = ChanPurpose::Exec("uname -a".into());
        assert!(matches!(p.requests()[0].1, Error::ChannelRequestFailed { req: "exec" }));
    }
}
