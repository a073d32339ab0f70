//! The transport engine for a single connection.
//!
//! Handles the version exchange, key exchange and service request,
//! then sends and receives packets for the layers above.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::future::Future;
use core::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::*;
use behaviour::CliBehaviour;
use encrypt::KeyState;
use ident::RemoteVersion;
use kex::{AlgoConfig, ClientKex, SessId};
use packets::Packet;
use sshnames::*;
use traffic::{InPayload, TrafIn, TrafOut};

const READ_SIZE: usize = 8192;

/// Where a session is in its lifetime. Only moves forwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnState {
    VersionExchange,
    KexInit,
    KeyExchange,
    /// Encryption activates
    NewKeys,
    ServiceRequest,
    UserAuth,
    ChannelOpen,
    ChannelRequest,
    DataPhase,
    Closed,
}

/// Runs `f`, failing with [`Error::Timeout`] if it takes longer than `dur`.
pub(crate) async fn timed<T, E, F>(dur: Duration, phase: &'static str, f: F) -> Result<T>
where
    F: Future<Output = core::result::Result<T, E>>,
    Error: From<E>,
{
    match tokio::time::timeout(dur, f).await {
        Ok(r) => Ok(r?),
        Err(_) => {
            debug!("Timed out during {phase}");
            Err(Error::Timeout { phase })
        }
    }
}

/// The core state of a SSH connection.
pub(crate) struct Conn<S> {
    stream: S,
    state: ConnState,

    keys: KeyState,
    traf_in: TrafIn,
    traf_out: TrafOut,

    timeout: Duration,

    remote_version: RemoteVersion,
    /// `H` from the first key exchange, set once
    sess_id: Option<SessId>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Conn<S> {
    pub fn new(stream: S, timeout: Duration) -> Self {
        Conn {
            stream,
            state: ConnState::VersionExchange,
            keys: KeyState::new_cleartext(),
            traf_in: TrafIn::new(),
            traf_out: TrafOut::new(),
            timeout,
            remote_version: RemoteVersion::new(),
            sess_id: None,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnState) {
        if state != self.state {
            debug!("State {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn sess_id(&self) -> Result<&SessId> {
        self.sess_id.as_ref().trap()
    }

    /// Runs the transport handshake up to an accepted `ssh-userauth` service.
    pub async fn handshake(
        &mut self,
        verify_hostkey_signature: bool,
        b: &mut impl CliBehaviour,
    ) -> Result<()> {
        self.exchange_versions().await?;
        self.first_kex(verify_hostkey_signature, b).await?;
        self.request_service(SSH_SERVICE_USERAUTH).await
    }

    async fn exchange_versions(&mut self) -> Result<()> {
        self.set_state(ConnState::VersionExchange);
        self.traf_out.send_version();
        self.flush().await?;

        let dur = self.timeout;
        timed(dur, "version", async {
            while !self.traf_in.version(&mut self.remote_version)? {
                self.read_more().await?;
            }
            Ok::<_, Error>(())
        })
        .await?;

        let v = self.remote_version.version().trap()?;
        debug!("Server version {}", String::from_utf8_lossy(v));
        Ok(())
    }

    async fn first_kex(
        &mut self,
        verify_hostkey_signature: bool,
        b: &mut impl CliBehaviour,
    ) -> Result<()> {
        self.set_state(ConnState::KexInit);
        let conf = AlgoConfig::new()?;
        // I_C is needed for the exchange hash
        let i_c = sshwire::write_ssh_vec(&kex::make_kexinit(kex::new_cookie()?, &conf))?;
        self.traf_out.send_payload(&mut self.keys, &i_c)?;
        self.flush().await?;

        let p = self.recv("kex").await?;
        let Packet::KexInit(remote) = p.packet()? else {
            debug!("Expected KEXINIT");
            return Err(Error::PacketWrong);
        };
        let v_s = self.remote_version.version().trap()?;
        let ck = ClientKex::new(&conf, &remote, ident::OUR_VERSION, v_s, &i_c, p.raw())?;

        self.set_state(ConnState::KeyExchange);
        if ck.algos.discard_next {
            let d = self.recv("kex").await?;
            debug!("Discarding wrongly guessed kex packet, seq {}", d.seq);
        }
        self.send(ck.make_kexdhinit()).await?;

        let p = self.recv("kex").await?;
        let Packet::KexDHReply(reply) = p.packet()? else {
            debug!("Expected KEXDH_REPLY");
            return Err(Error::PacketWrong);
        };
        let out = ck.handle_kexdhreply(&reply, verify_hostkey_signature, b)?;

        // The first KEX's H becomes the persistent sess_id
        let sess_id = self.sess_id.get_or_insert_with(|| out.h.clone());
        let keys = out.keys(sess_id, true)?;

        self.set_state(ConnState::NewKeys);
        self.send(packets::NewKeys {}).await?;
        self.keys.rekey_enc(keys.enc);

        let p = self.recv("newkeys").await?;
        if !matches!(p.packet()?, Packet::NewKeys(_)) {
            debug!("Expected NEWKEYS");
            return Err(Error::PacketWrong);
        }
        self.keys.rekey_dec(keys.dec);
        debug!("Encryption active");
        Ok(())
    }

    async fn request_service(&mut self, name: &'static str) -> Result<()> {
        self.set_state(ConnState::ServiceRequest);
        self.send(packets::ServiceRequest { name }).await?;
        let p = self.recv("service").await?;
        match p.packet()? {
            Packet::ServiceAccept(a) if a.name == name => Ok(()),
            other => {
                debug!("Service request got {:?}", other.message_num());
                Err(Error::ServiceRejected { service: name })
            }
        }
    }

    /// Encrypts a packet for sending, it is written by the next
    /// [`flush()`](Self::flush) or [`send()`](Self::send).
    pub fn queue<'p>(&mut self, p: impl Into<Packet<'p>>) -> Result<()> {
        self.traf_out.send(&mut self.keys, &p.into())
    }

    pub async fn send<'p>(&mut self, p: impl Into<Packet<'p>>) -> Result<()> {
        self.queue(p)?;
        self.flush().await
    }

    /// Writes all queued packets
    pub async fn flush(&mut self) -> Result<()> {
        if self.traf_out.is_empty() {
            return Ok(());
        }
        let dur = self.timeout;
        while !self.traf_out.is_empty() {
            let n = timed(dur, "write", self.stream.write(self.traf_out.pending())).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.traf_out.consume(n);
        }
        timed(dur, "write", self.stream.flush()).await
    }

    /// Receives the next packet for the layers above, failing
    /// after the connection timeout.
    pub async fn recv(&mut self, phase: &'static str) -> Result<InPayload> {
        let dur = self.timeout;
        timed(dur, phase, self.recv_untimed()).await
    }

    /// Like [`recv()`](Self::recv) but waits indefinitely.
    ///
    /// Cancel safe, a packet is never partially consumed.
    pub async fn recv_untimed(&mut self) -> Result<InPayload> {
        loop {
            while let Some(p) = self.traf_in.payload(&mut self.keys)? {
                if let Some(p) = self.transport_packet(p)? {
                    return Ok(p);
                }
            }
            self.read_more().await?;
        }
    }

    /// Handles transport layer messages, returning others.
    fn transport_packet(&mut self, p: InPayload) -> Result<Option<InPayload>> {
        let keep = match p.packet() {
            Ok(Packet::Ignore(_)) => {
                trace!("Ignoring SSH_MSG_IGNORE");
                false
            }
            Ok(Packet::DebugPacket(d)) => {
                if d.always_display {
                    info!("Server debug: {}", d.message.to_lossy());
                } else {
                    debug!("Server debug: {}", d.message.to_lossy());
                }
                false
            }
            Ok(Packet::Unimplemented(u)) => {
                debug!("Server reports our packet seq {} unimplemented", u.seq);
                false
            }
            Ok(Packet::Disconnect(d)) => {
                let desc = d.desc.to_lossy();
                info!("Server disconnected: {desc}");
                return Err(Error::Disconnected { reason: d.reason, desc });
            }
            Err(Error::UnknownPacket { number }) => {
                debug!("Unknown packet type {number}, replying unimplemented");
                self.queue(packets::Unimplemented { seq: p.seq })?;
                false
            }
            Err(e) => return Err(e),
            Ok(_) => true,
        };
        Ok(keep.then_some(p))
    }

    async fn read_more(&mut self) -> Result<()> {
        let mut buf = [0u8; READ_SIZE];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            debug!("Connection closed by peer");
            return Err(Error::ConnectionClosed);
        }
        trace!("Read {n} bytes");
        self.traf_in.input(&buf[..n]);
        Ok(())
    }

    /// Writes anything queued and shuts down the stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.set_state(ConnState::Closed);
        self.flush().await?;
        let dur = self.timeout;
        timed(dur, "close", self.stream.shutdown()).await
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::*;
    use conn::*;
    use encrypt::KeyState;
    use packets::Packet;
    use probelog::init_test_log;
    use sshnames::*;
    use traffic::TrafOut;

    const T: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn version_after_banner() {
        init_test_log();
        let (c, mut s) = tokio::io::duplex(4096);
        let mut conn = Conn::new(c, T);
        s.write_all(b"Please be nice\r\nSSH-2.0-OpenSSH_9.9\r\n").await.unwrap();
        conn.exchange_versions().await.unwrap();
        assert_eq!(conn.remote_version.version().unwrap(), b"SSH-2.0-OpenSSH_9.9");

        let mut ours = vec![0u8; ident::our_version_line().len()];
        s.read_exact(&mut ours).await.unwrap();
        assert_eq!(ours, ident::our_version_line());
    }

    #[tokio::test]
    async fn version_timeout() {
        init_test_log();
        let (c, _s) = tokio::io::duplex(4096);
        let mut conn = Conn::new(c, Duration::from_millis(50));
        let e = conn.exchange_versions().await.unwrap_err();
        assert!(matches!(e, Error::Timeout { phase: "version" }));
        assert_eq!(e.kind(), error::ErrorKind::Connection);
    }

    #[tokio::test]
    async fn not_ssh() {
        let (c, mut s) = tokio::io::duplex(4096);
        let mut conn = Conn::new(c, T);
        s.write_all(b"SSH-2.0-x\n").await.unwrap();
        assert!(matches!(conn.exchange_versions().await, Err(Error::NotSSH)));
    }

    #[tokio::test]
    async fn closed_before_version() {
        let (c, s) = tokio::io::duplex(4096);
        drop(s);
        let mut conn = Conn::new(c, T);
        assert!(conn.exchange_versions().await.is_err());
    }

    #[tokio::test]
    async fn transport_messages() {
        init_test_log();
        let (c, mut s) = tokio::io::duplex(1 << 16);
        let mut conn = Conn::new(c, T);

        let mut sk = KeyState::new_cleartext();
        let mut out = TrafOut::new();
        out.send(&mut sk, &packets::Ignore { data: sshwire::BinString(b"xx") }.into()).unwrap();
        out.send(&mut sk, &packets::DebugPacket {
            always_display: true,
            message: "hello".into(),
            lang: "",
        }.into()).unwrap();
        // unknown message number 200, seq 2
        out.send_payload(&mut sk, &[200, 1, 2, 3]).unwrap();
        out.send(&mut sk, &packets::ServiceAccept { name: SSH_SERVICE_USERAUTH }.into()).unwrap();
        out.send(&mut sk, &packets::Disconnect {
            reason: 11,
            desc: "bye now".into(),
            lang: "",
        }.into()).unwrap();
        s.write_all(out.pending()).await.unwrap();

        let p = conn.recv("test").await.unwrap();
        assert!(matches!(p.packet().unwrap(), Packet::ServiceAccept(_)));
        assert_eq!(p.seq, 3);

        match conn.recv("test").await {
            Err(Error::Disconnected { reason: 11, desc }) => assert_eq!(desc, "bye now"),
            r => panic!("{:?}", r.map(|p| p.seq)),
        }

        // the unimplemented reply is queued until a flush
        conn.flush().await.unwrap();
        let mut b = vec![0u8; 16];
        s.read_exact(&mut b).await.unwrap();
        // len 12, pad 6, type 3, seq 2
        assert_eq!(&b[..10], &[0, 0, 0, 12, 6, 3, 0, 0, 0, 2]);
    }
}
