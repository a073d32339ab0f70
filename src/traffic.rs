//! Packet reassembly from the stream, and framing of outgoing packets.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use pretty_hex::PrettyHex;
use zeroize::Zeroizing;

use crate::*;
use encrypt::{KeyState, SSH_PAYLOAD_START};
use ident::RemoteVersion;
use packets::Packet;

/// A decrypted incoming payload
pub(crate) struct InPayload {
    /// Sequence number of the packet
    pub seq: u32,
    buf: Vec<u8>,
}

impl InPayload {
    pub fn packet(&self) -> Result<Packet<'_>> {
        sshwire::packet_from_bytes(&self.buf)
    }

    /// The payload bytes, starting with the message number
    pub fn raw(&self) -> &[u8] {
        &self.buf
    }
}

/// Accumulates bytes read from the stream until a whole packet is present.
///
/// Holds ciphertext, a packet is decrypted as it is removed.
pub(crate) struct TrafIn {
    buf: Vec<u8>,
    state: RxState,
}

#[derive(Debug)]
enum RxState {
    /// Waiting for the first block, to learn the packet length
    Idle,
    /// First block has been decrypted, reading remainder of packet
    Read { expect: usize },
}

impl TrafIn {
    pub fn new() -> Self {
        Self { buf: Vec::new(), state: RxState::Idle }
    }

    pub fn input(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    /// Feeds buffered bytes to the version parser, leaving any
    /// following packet data. Returns `true` once the version is complete.
    pub fn version(&mut self, rv: &mut RemoteVersion) -> Result<bool> {
        let taken = rv.consume(&self.buf)?;
        self.buf.drain(..taken);
        Ok(rv.is_done())
    }

    /// Returns the next payload if a whole packet has arrived.
    pub fn payload(&mut self, keys: &mut KeyState) -> Result<Option<InPayload>> {
        if let RxState::Idle = self.state {
            let first = keys.first_read_len();
            if self.buf.len() < first {
                return Ok(None);
            }
            let expect = keys.decrypt_first_block(&mut self.buf)?;
            if expect < first {
                debug!("Packet length {expect} too short");
                return Err(Error::SSHProtoError);
            }
            self.state = RxState::Read { expect };
        }

        let RxState::Read { expect } = self.state else {
            return Err(Error::bug());
        };
        if self.buf.len() < expect {
            return Ok(None);
        }

        let mut pkt = Zeroizing::new(self.buf.drain(..expect).collect::<Vec<u8>>());
        self.state = RxState::Idle;
        let seq = keys.recv_seq();
        let len = keys.decrypt(&mut pkt)?;
        let buf = pkt.get(SSH_PAYLOAD_START..SSH_PAYLOAD_START + len).trap()?.to_vec();
        trace!("Received payload seq {seq} len {len} {:?}", buf.hex_dump());
        Ok(Some(InPayload { seq, buf }))
    }
}

/// Outgoing bytes not yet written to the stream
pub(crate) struct TrafOut {
    buf: Vec<u8>,
}

impl TrafOut {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Sends a version line, before any packets
    pub fn send_version(&mut self) {
        self.buf.extend_from_slice(&ident::our_version_line());
    }

    pub fn send(&mut self, keys: &mut KeyState, p: &Packet) -> Result<()> {
        trace!("Sending {:?}", p.message_num());
        let payload = Zeroizing::new(sshwire::write_ssh_vec(p)?);
        self.send_payload(keys, &payload)
    }

    /// Sends an already encoded payload
    pub fn send_payload(&mut self, keys: &mut KeyState, payload: &[u8]) -> Result<()> {
        trace!("Send payload seq {} len {}", keys.send_seq(), payload.len());
        keys.encrypt(payload, &mut self.buf)
    }

    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Marks `n` bytes as written
    pub fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::*;
    use encrypt::KeyState;
    use ident::RemoteVersion;
    use packets::Packet;
    use probelog::init_test_log;
    use traffic::*;

    fn ignore(n: usize) -> Packet<'static> {
        let d: &'static [u8] = vec![0x55; n].leak();
        packets::Ignore { data: sshwire::BinString(d) }.into()
    }

    #[test]
    fn reassemble_split_reads() {
        init_test_log();
        let mut ko = KeyState::new_cleartext();
        let mut ki = KeyState::new_cleartext();
        let mut out = TrafOut::new();
        out.send_version();
        for n in [0, 10, 300] {
            out.send(&mut ko, &ignore(n)).unwrap();
        }
        let wire = out.pending().to_vec();
        out.consume(wire.len());
        assert!(out.is_empty());

        // feed a byte at a time
        let mut tin = TrafIn::new();
        let mut rv = RemoteVersion::new();
        let mut got = vec![];
        for b in wire.iter() {
            tin.input(&[*b]);
            if !rv.is_done() {
                tin.version(&mut rv).unwrap();
                continue;
            }
            while let Some(p) = tin.payload(&mut ki).unwrap() {
                let Packet::Ignore(i) = p.packet().unwrap() else { panic!() };
                got.push((p.seq, i.data.0.len()));
            }
        }
        assert_eq!(rv.version().unwrap(), ident::OUR_VERSION);
        assert_eq!(got, [(0, 0), (1, 10), (2, 300)]);
    }

    #[test]
    fn short_length_rejected() {
        let mut ki = KeyState::new_cleartext();
        let mut tin = TrafIn::new();
        // length 0 can't hold the padding length byte
        tin.input(&[0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(tin.payload(&mut ki).is_err());
    }

    #[test]
    fn oversize_length() {
        let mut ki = KeyState::new_cleartext();
        let mut tin = TrafIn::new();
        tin.input(&[0, 0x10, 0, 0, 4]);
        assert!(matches!(tin.payload(&mut ki), Err(Error::BigPacket { .. })));
    }
}
