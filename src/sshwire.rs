//! SSH wire format reading/writing.
//!
//! Used in conjunction with the [`packet`](crate::packets) format
//! definitions. Integers are big endian, strings are `u32` length prefixed,
//! `mpint` is described in [RFC4251](https://tools.ietf.org/html/rfc4251) section 5.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt::{self, Debug};
use pretty_hex::PrettyHex;

use ascii::{AsAsciiStr, AsciiChar, AsciiStr};

use crate::*;
use packets::Packet;

/// A generic destination for serializing, used similarly to `serde::Serializer`
pub trait SSHSink {
    fn push(&mut self, v: &[u8]) -> WireResult<()>;
}

/// A generic source for a packet, used similarly to `serde::Deserializer`
pub trait SSHSource<'de> {
    fn take(&mut self, len: usize) -> WireResult<&'de [u8]>;
    fn pos(&self) -> usize;
    /// Number of bytes left in the input
    fn remaining(&self) -> usize;
}

/// Encodes the type in SSH wire format
pub trait SSHEncode {
    fn enc<S>(&self, s: &mut S) -> WireResult<()> where S: SSHSink;
}

/// Decodes `struct` and `enum`s
pub trait SSHDecode<'de>: Sized {
    fn dec<S>(s: &mut S) -> WireResult<Self> where S: SSHSource<'de>;
}

/// A subset of [`Error`] for `SSHEncode` and `SSHDecode`.
#[derive(Debug)]
pub enum WireError {
    NoRoom,

    RanOut,

    BadString,

    BadName,

    UnknownVariant,

    PacketWrong,

    SSHProtoError,

    UnknownPacket { number: u8 },
}

impl From<WireError> for Error {
    fn from(w: WireError) -> Self {
        match w {
            WireError::NoRoom => Error::NoRoom,
            WireError::RanOut => Error::RanOut,
            WireError::BadString => Error::BadString,
            WireError::BadName => Error::BadName,
            WireError::SSHProtoError => Error::SSHProtoError,
            WireError::PacketWrong => Error::PacketWrong,
            WireError::UnknownVariant => Error::bug_fmt(format_args!("Can't encode Unknown")),
            WireError::UnknownPacket { number } => Error::UnknownPacket { number },
        }
    }
}

pub type WireResult<T> = core::result::Result<T, WireError>;

///////////////////////////////////////////////

/// Parses a [`Packet`] from a borrowed `&[u8]` byte buffer.
///
/// The whole buffer must be consumed.
pub fn packet_from_bytes(b: &[u8]) -> Result<Packet<'_>> {
    let mut s = DecodeBytes::new(b);
    let p = Packet::dec(&mut s)?;

    if s.remaining() != 0 {
        trace!("{} trailing bytes in packet {:?}", s.remaining(), p.message_num());
        Err(Error::WrongPacketLength)
    } else {
        Ok(p)
    }
}

/// Decodes a `T` from the start of `b`. Trailing input is allowed.
pub fn read_ssh<'a, T: SSHDecode<'a>>(b: &'a [u8]) -> Result<T> {
    let mut s = DecodeBytes::new(b);
    Ok(T::dec(&mut s)?)
}

/// Returns the SSH wire format representation of `value`
pub fn write_ssh_vec<T>(value: &T) -> Result<Vec<u8>>
where
    T: SSHEncode,
{
    let mut v = Vec::new();
    value.enc(&mut v)?;
    Ok(v)
}

/// Returns `WireError::NoRoom` if larger than `u32`
fn length_enc<T>(value: &T) -> WireResult<u32>
where
    T: SSHEncode,
{
    let mut s = EncodeLen { pos: 0 };
    value.enc(&mut s)?;
    s.pos.try_into().map_err(|_| WireError::NoRoom)
}

impl SSHSink for Vec<u8> {
    fn push(&mut self, v: &[u8]) -> WireResult<()> {
        self.extend_from_slice(v);
        Ok(())
    }
}

struct EncodeLen {
    pos: usize,
}

impl SSHSink for EncodeLen {
    fn push(&mut self, v: &[u8]) -> WireResult<()> {
        self.pos += v.len();
        Ok(())
    }
}

/// A [`SSHSource`] over a borrowed buffer.
pub(crate) struct DecodeBytes<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> DecodeBytes<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }
}

impl<'de> SSHSource<'de> for DecodeBytes<'de> {
    fn take(&mut self, len: usize) -> WireResult<&'de [u8]> {
        if len > self.input.len() {
            return Err(WireError::RanOut);
        }
        let t;
        (t, self.input) = self.input.split_at(len);
        self.pos += len;
        Ok(t)
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.input.len()
    }
}

/// Strips leading zero bytes, returning the magnitude and whether
/// a `0x00` sign byte is required.
fn mpint_parts(m: &[u8]) -> (&[u8], bool) {
    let first = m.iter().position(|&b| b != 0).unwrap_or(m.len());
    let m = &m[first..];
    let pad = m.first().is_some_and(|b| b & 0x80 != 0);
    (m, pad)
}

/// Hashes a slice to be treated as a mpint. Has u32 length prefix,
/// leading zeros are stripped and an extra 0x00 byte added if the MSB is set.
pub fn hash_mpint(hash_ctx: &mut dyn digest::DynDigest, m: &[u8]) {
    let (m, pad) = mpint_parts(m);
    let l = m.len() as u32 + pad as u32;
    hash_ctx.update(&l.to_be_bytes());
    if pad {
        hash_ctx.update(&[0x00]);
    }
    hash_ctx.update(m);
}

///////////////////////////////////////////////

/// A SSH style binary string. Serialized as `u32` length followed by the bytes
/// of the slice.
#[derive(Clone, PartialEq)]
pub struct BinString<'a>(pub &'a [u8]);

impl<'a> AsRef<[u8]> for BinString<'a> {
    fn as_ref(&self) -> &'a [u8] {
        self.0
    }
}

impl Debug for BinString<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BinString(len={})", self.0.len())
    }
}

impl SSHEncode for BinString<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        (self.0.len() as u32).enc(s)?;
        self.0.enc(s)
    }
}

impl<'de> SSHDecode<'de> for BinString<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let len = u32::dec(s)? as usize;
        Ok(BinString(s.take(len)?))
    }
}

/// A text string that may be presented to a user or used
/// for things such as a password, username, exec command, banner etc.
///
/// The SSH protocol defines it to be UTF-8, the library treats it as an opaque `&[u8]`.
///
/// Note that SSH protocol identifiers in `Packet` etc
/// are `&str` rather than `TextString`, and always defined as ASCII.
#[derive(Clone, PartialEq, Copy)]
pub struct TextString<'a>(pub &'a [u8]);

impl<'a> TextString<'a> {
    /// Returns the UTF-8 decoded string, using [`core::str::from_utf8`]
    pub fn as_str(&self) -> Result<&'a str> {
        core::str::from_utf8(self.0).map_err(|_| Error::BadString)
    }

    /// Returns a lossy UTF-8 rendering, for strings shown to a user
    pub fn to_lossy(&self) -> String {
        String::from_utf8_lossy(self.0).into_owned()
    }
}

impl<'a> AsRef<[u8]> for TextString<'a> {
    fn as_ref(&self) -> &'a [u8] {
        self.0
    }
}

impl<'a> From<&'a str> for TextString<'a> {
    fn from(s: &'a str) -> Self {
        TextString(s.as_bytes())
    }
}

impl Debug for TextString<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = core::str::from_utf8(self.0);
        if let Ok(s) = s {
            write!(f, "TextString(\"{}\")", s.escape_default())
        } else {
            write!(f, "TextString(not utf8!, {:#?})", self.0.hex_dump())
        }
    }
}

impl SSHEncode for TextString<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        (self.0.len() as u32).enc(s)?;
        self.0.enc(s)
    }
}

impl<'de> SSHDecode<'de> for TextString<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let len = u32::dec(s)? as usize;
        Ok(TextString(s.take(len)?))
    }
}

/// A big endian multiple precision integer.
///
/// Encoding strips leading zero bytes and prepends a single `0x00`
/// when the high bit is set, so the value stays non-negative.
/// Decoding returns the magnitude without that sign byte.
#[derive(Clone, PartialEq)]
pub struct Mpint<'a>(pub &'a [u8]);

impl Debug for Mpint<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mpint(len={})", self.0.len())
    }
}

impl SSHEncode for Mpint<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        let (m, pad) = mpint_parts(self.0);
        (m.len() as u32 + pad as u32).enc(s)?;
        if pad {
            0u8.enc(s)?;
        }
        m.enc(s)
    }
}

impl<'de> SSHDecode<'de> for Mpint<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let b = BinString::dec(s)?.0;
        match b {
            // negative numbers aren't used by SSH
            [first, ..] if first & 0x80 != 0 => Err(WireError::SSHProtoError),
            [0, second, ..] if second & 0x80 != 0 => Ok(Mpint(&b[1..])),
            // non-minimal encoding
            [0, ..] => Err(WireError::SSHProtoError),
            _ => Ok(Mpint(b)),
        }
    }
}

/// A wrapper for a `u32` length prefixed data structure `B`, such as a public key blob
pub struct Blob<B>(pub B);

impl<B> AsRef<B> for Blob<B> {
    fn as_ref(&self) -> &B {
        &self.0
    }
}

impl<B: Clone> Clone for Blob<B> {
    fn clone(&self) -> Self {
        Blob(self.0.clone())
    }
}

impl<B: SSHEncode + Debug> Debug for Blob<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(len) = length_enc(&self.0) {
            write!(f, "Blob(len={len}, {:?})", self.0)
        } else {
            write!(f, "Blob(len>u32, {:?})", self.0)
        }
    }
}

impl<B: SSHEncode> SSHEncode for Blob<B> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        let len: u32 = length_enc(&self.0)?;
        len.enc(s)?;
        self.0.enc(s)
    }
}

impl<'de, B: SSHDecode<'de>> SSHDecode<'de> for Blob<B> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let len = u32::dec(s)? as usize;
        let pos1 = s.pos();
        let inner = SSHDecode::dec(s)?;
        let pos2 = s.pos();

        // Sanity check the length matched
        let used_len = pos2 - pos1;
        if used_len == len {
            Ok(Blob(inner))
        } else {
            let extra = len.checked_sub(used_len).ok_or_else(|| {
                trace!("inner consumed past length of SSH Blob. \
                    Expected {} bytes, got {} bytes {}..{}",
                    len, pos2-pos1, pos1, pos2);
                WireError::SSHProtoError
            })?;
            // Skip over unconsumed bytes in the blob.
            // This can occur with Unknown variants
            s.take(extra)?;
            Ok(Blob(inner))
        }
    }
}

///////////////////////////////////////////////

impl SSHEncode for u8 {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        s.push(&[*self])
    }
}

impl SSHEncode for bool {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        (*self as u8).enc(s)
    }
}

impl SSHEncode for u32 {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        s.push(&self.to_be_bytes())
    }
}

// no length prefix
impl SSHEncode for &[u8] {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        s.push(self)
    }
}

// no length prefix
impl<const N: usize> SSHEncode for [u8; N] {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        s.push(self)
    }
}

impl SSHEncode for &str {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        let v = self.as_bytes();
        // length prefix
        (v.len() as u32).enc(s)?;
        s.push(v)
    }
}

impl<T: SSHEncode> SSHEncode for Option<T> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        if let Some(t) = self.as_ref() {
            t.enc(s)?;
        }
        Ok(())
    }
}

impl<T: SSHEncode> SSHEncode for &T {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        (*self).enc(s)
    }
}

impl SSHEncode for &AsciiStr {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        let v = self.as_bytes();
        BinString(v).enc(s)
    }
}

impl<'de> SSHDecode<'de> for bool {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        Ok(u8::dec(s)? != 0)
    }
}

impl<'de> SSHDecode<'de> for u8 {
    #[inline]
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let t = s.take(1)?;
        Ok(t[0])
    }
}

impl<'de> SSHDecode<'de> for u32 {
    #[inline]
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let t = s.take(core::mem::size_of::<u32>())?;
        let t: [u8; 4] = t.try_into().map_err(|_| WireError::RanOut)?;
        Ok(u32::from_be_bytes(t))
    }
}

/// Decodes a SSH name string. Must be ASCII
/// without control characters. RFC4251 section 6.
pub fn try_as_ascii(t: &[u8]) -> WireResult<&AsciiStr> {
    let n = t.as_ascii_str().map_err(|_| WireError::BadName)?;
    if n.chars().any(|ch| ch.is_ascii_control() || ch == AsciiChar::DEL) {
        return Err(WireError::BadName);
    }
    Ok(n)
}

pub fn try_as_ascii_str(t: &[u8]) -> WireResult<&str> {
    try_as_ascii(t).map(AsciiStr::as_str)
}

impl<'de: 'a, 'a> SSHDecode<'de> for &'a str {
    #[inline]
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let len = u32::dec(s)?;
        let t = s.take(len as usize)?;
        try_as_ascii_str(t)
    }
}

impl<'de: 'a, 'a> SSHDecode<'de> for &'a AsciiStr {
    fn dec<S>(s: &mut S) -> WireResult<&'a AsciiStr>
    where
        S: SSHSource<'de>, {
        let b: BinString = SSHDecode::dec(s)?;
        try_as_ascii(b.0)
    }
}

impl<'de, const N: usize> SSHDecode<'de> for [u8; N] {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let mut l = [0u8; N];
        l.copy_from_slice(s.take(N)?);
        Ok(l)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::*;
    use probelog::init_test_log;
    use sshwire::*;

    #[test]
    fn primitives() {
        init_test_log();
        assert_eq!(write_ssh_vec(&0x01020304u32).unwrap(), [1, 2, 3, 4]);
        assert_eq!(write_ssh_vec(&"ssh").unwrap(), b"\0\0\0\x03ssh");
        assert_eq!(write_ssh_vec(&BinString(&[9, 8])).unwrap(), [0, 0, 0, 2, 9, 8]);
        assert_eq!(write_ssh_vec(&true).unwrap(), [1]);

        let b = b"\0\0\0\x05hello\0\0\0\x2a";
        let mut s = DecodeBytes::new(b);
        let t: &str = SSHDecode::dec(&mut s).unwrap();
        assert_eq!(t, "hello");
        assert_eq!(u32::dec(&mut s).unwrap(), 42);
        assert_eq!(s.remaining(), 0);
        assert!(matches!(u8::dec(&mut s), Err(WireError::RanOut)));
    }

    #[test]
    fn name_rejects_control() {
        let b = b"\0\0\0\x03a\x01b";
        assert!(read_ssh::<&str>(b).is_err());
    }

    #[test]
    fn mpint_high_bit() {
        // high bit set gets exactly one zero prepended
        let e = write_ssh_vec(&Mpint(&[0x80, 0x01])).unwrap();
        assert_eq!(e, [0, 0, 0, 3, 0x00, 0x80, 0x01]);
        let d: Mpint = read_ssh(&e).unwrap();
        assert_eq!(d.0, [0x80, 0x01]);

        // no high bit, no prefix
        let e = write_ssh_vec(&Mpint(&[0x7f, 0xff])).unwrap();
        assert_eq!(e, [0, 0, 0, 2, 0x7f, 0xff]);
        let d: Mpint = read_ssh(&e).unwrap();
        assert_eq!(d.0, [0x7f, 0xff]);
    }

    #[test]
    fn mpint_strips_zeros() {
        let e = write_ssh_vec(&Mpint(&[0, 0, 0x12])).unwrap();
        assert_eq!(e, [0, 0, 0, 1, 0x12]);
        let e = write_ssh_vec(&Mpint(&[0, 0, 0x92])).unwrap();
        assert_eq!(e, [0, 0, 0, 2, 0x00, 0x92]);
        // zero is the empty string
        let e = write_ssh_vec(&Mpint(&[0, 0])).unwrap();
        assert_eq!(e, [0, 0, 0, 0]);
        let d: Mpint = read_ssh(&e).unwrap();
        assert!(d.0.is_empty());
    }

    #[test]
    fn mpint_rejects_negative() {
        assert!(read_ssh::<Mpint>(&[0, 0, 0, 1, 0x80]).is_err());
        assert!(read_ssh::<Mpint>(&[0, 0, 0, 2, 0x00, 0x10]).is_err());
    }

    #[test]
    /// hash_mpint() matches hashing the encoded form
    fn hash_mpint_matches() {
        use digest::Digest;
        use sha2::Sha256;
        for m in [&[0x80u8, 1, 2][..], &[0, 0x7f], &[0, 0, 0xff, 3], &[]] {
            let mut h1 = Sha256::new();
            hash_mpint(&mut h1, m);
            let h2 = Sha256::digest(write_ssh_vec(&Mpint(m)).unwrap());
            assert_eq!(h1.finalize(), h2);
        }
    }

    #[test]
    fn blob_length() {
        let e = write_ssh_vec(&Blob(BinString(b"abc"))).unwrap();
        assert_eq!(e, b"\0\0\0\x07\0\0\0\x03abc");
        let d: Blob<BinString> = read_ssh(&e).unwrap();
        assert_eq!(d.0 .0, b"abc");
        // inner length overruns the blob
        let bad = b"\0\0\0\x02\0\0\0\x03abc";
        assert!(read_ssh::<Blob<BinString>>(bad).is_err());
    }
}
