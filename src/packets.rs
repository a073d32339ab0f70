//! SSH protocol packets.
//!
//! A [`Packet`] can be encoded/decoded to the
//! SSH Binary Packet Protocol using [`sshwire`].
//! SSH packet format is described in [RFC4253](https://tools.ietf.org/html/rfc4253) SSH Transport

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;

use pretty_hex::PrettyHex;

use crate::*;
use namelist::NameList;
use sshnames::*;
use sshwire::{BinString, Blob, TextString};
use sshwire::{SSHDecode, SSHEncode, SSHSink, SSHSource, WireError, WireResult};

/// Defines a struct with fields encoded in declaration order.
macro_rules! wire_struct {
    (
        $(#[$meta:meta])*
        pub struct $name:ident $(<$lt:lifetime>)? {
            $( $(#[$fmeta:meta])* pub $field:ident : $ty:ty, )*
        }
    ) => {
        $(#[$meta])*
        pub struct $name $(<$lt>)? {
            $( $(#[$fmeta])* pub $field: $ty, )*
        }

        impl $(<$lt>)? SSHEncode for $name $(<$lt>)? {
            #[allow(unused_variables)]
            fn enc<S>(&self, s: &mut S) -> WireResult<()>
            where S: SSHSink {
                $( self.$field.enc(s)?; )*
                Ok(())
            }
        }

        impl<'de $(: $lt, $lt)?> SSHDecode<'de> for $name $(<$lt>)? {
            #[allow(unused_variables)]
            fn dec<S>(s: &mut S) -> WireResult<Self>
            where S: SSHSource<'de> {
                Ok(Self { $( $field: SSHDecode::dec(s)?, )* })
            }
        }
    };
}

wire_struct! {
#[derive(Debug)]
pub struct KexInit<'a> {
    pub cookie: [u8; 16],
    pub kex: NameList<'a>,
    /// Host key signature algorithms
    pub hostsig: NameList<'a>,
    pub cipher_c2s: NameList<'a>,
    pub cipher_s2c: NameList<'a>,
    pub mac_c2s: NameList<'a>,
    pub mac_s2c: NameList<'a>,
    pub comp_c2s: NameList<'a>,
    pub comp_s2c: NameList<'a>,
    pub lang_c2s: NameList<'a>,
    pub lang_s2c: NameList<'a>,
    pub first_follows: bool,
    pub reserved: u32,
}
}

wire_struct! {
#[derive(Debug)]
pub struct NewKeys {}
}

wire_struct! {
#[derive(Debug)]
pub struct Ignore<'a> {
    pub data: BinString<'a>,
}
}

wire_struct! {
/// Named to avoid clashing with [`fmt::Debug`]
#[derive(Debug)]
pub struct DebugPacket<'a> {
    pub always_display: bool,
    pub message: TextString<'a>,
    pub lang: &'a str,
}
}

wire_struct! {
#[derive(Debug)]
pub struct Disconnect<'a> {
    pub reason: u32,
    pub desc: TextString<'a>,
    pub lang: &'a str,
}
}

wire_struct! {
#[derive(Debug)]
pub struct Unimplemented {
    pub seq: u32,
}
}

wire_struct! {
#[derive(Debug)]
pub struct KexDHInit<'a> {
    pub q_c: BinString<'a>,
}
}

wire_struct! {
/// `k_s` is kept as raw bytes since it is hashed verbatim.
#[derive(Debug)]
pub struct KexDHReply<'a> {
    pub k_s: BinString<'a>,
    pub q_s: BinString<'a>,
    pub sig: BinString<'a>,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ServiceRequest<'a> {
    pub name: &'a str,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ServiceAccept<'a> {
    pub name: &'a str,
}
}

wire_struct! {
#[derive(Debug)]
pub struct UserauthRequest<'a> {
    pub username: TextString<'a>,
    pub service: &'a str,
    pub method: AuthMethod<'a>,
}
}

/// The method-specific part of a [`UserauthRequest`].
#[derive(Debug)]
pub enum AuthMethod<'a> {
    Password(MethodPassword<'a>),
    PubKey(MethodPubKey<'a>),
    None,
    Unknown(Unknown<'a>),
}

impl SSHEncode for AuthMethod<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        match self {
            AuthMethod::Password(m) => {
                SSH_AUTHMETHOD_PASSWORD.enc(s)?;
                m.enc(s)
            }
            AuthMethod::PubKey(m) => {
                SSH_AUTHMETHOD_PUBLICKEY.enc(s)?;
                m.enc(s)
            }
            AuthMethod::None => SSH_NAME_NONE.enc(s),
            AuthMethod::Unknown(_) => Err(WireError::UnknownVariant),
        }
    }
}

impl<'de: 'a, 'a> SSHDecode<'de> for AuthMethod<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let method = BinString::dec(s)?.0;
        let m = match method {
            b"password" => AuthMethod::Password(SSHDecode::dec(s)?),
            b"publickey" => AuthMethod::PubKey(SSHDecode::dec(s)?),
            b"none" => AuthMethod::None,
            _ => {
                s.take(s.remaining())?;
                AuthMethod::Unknown(Unknown(method))
            }
        };
        Ok(m)
    }
}

wire_struct! {
pub struct MethodPassword<'a> {
    pub change: bool,
    pub password: TextString<'a>,
}
}

// Don't print password
impl fmt::Debug for MethodPassword<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodPassword")
            .field("change", &self.change)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct MethodPubKey<'a> {
    /// A signature algorithm name (not key algorithm name).
    pub sig_algo: &'a str,
    pub pubkey: Blob<PubKey<'a>>,
    pub sig: Option<Blob<Signature<'a>>>,
    /// Set when encoding the message to be signed, which has the
    /// "has signature" flag set but no signature. Not on the wire.
    pub force_sig: bool,
}

impl SSHEncode for MethodPubKey<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        // boolean   has signature
        // string    public key algorithm name
        // string    public key blob
        // string    signature
        (self.sig.is_some() || self.force_sig).enc(s)?;
        self.sig_algo.enc(s)?;
        self.pubkey.enc(s)?;
        self.sig.enc(s)
    }
}

impl<'de: 'a, 'a> SSHDecode<'de> for MethodPubKey<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let sig = bool::dec(s)?;
        let sig_algo = SSHDecode::dec(s)?;
        let pubkey = SSHDecode::dec(s)?;
        let sig = if sig { Some(SSHDecode::dec(s)?) } else { None };
        Ok(Self { sig_algo, pubkey, sig, force_sig: false })
    }
}

wire_struct! {
#[derive(Debug)]
pub struct UserauthFailure<'a> {
    pub methods: NameList<'a>,
    pub partial: bool,
}
}

wire_struct! {
#[derive(Debug)]
pub struct UserauthSuccess {}
}

wire_struct! {
#[derive(Debug)]
pub struct UserauthBanner<'a> {
    pub message: TextString<'a>,
    pub lang: &'a str,
}
}

/// A public key blob. Only ed25519 is understood, anything else
/// (such as a server's RSA host key) is kept as `Unknown`.
#[derive(Debug, Clone, PartialEq)]
pub enum PubKey<'a> {
    Ed25519(Ed25519PubKey<'a>),
    Unknown(Unknown<'a>),
}

impl PubKey<'_> {
    /// The algorithm name presented
    pub fn algorithm_name(&self) -> Result<&str, &Unknown<'_>> {
        match self {
            PubKey::Ed25519(_) => Ok(SSH_NAME_ED25519),
            PubKey::Unknown(u) => Err(u),
        }
    }
}

impl SSHEncode for PubKey<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        match self {
            PubKey::Ed25519(k) => {
                SSH_NAME_ED25519.enc(s)?;
                k.enc(s)
            }
            PubKey::Unknown(_) => Err(WireError::UnknownVariant),
        }
    }
}

impl<'de: 'a, 'a> SSHDecode<'de> for PubKey<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let name = BinString::dec(s)?.0;
        if name == SSH_NAME_ED25519.as_bytes() {
            Ok(PubKey::Ed25519(SSHDecode::dec(s)?))
        } else {
            // remaining fields are skipped by the enclosing Blob
            Ok(PubKey::Unknown(Unknown(name)))
        }
    }
}

wire_struct! {
#[derive(Debug, Clone, PartialEq)]
pub struct Ed25519PubKey<'a> {
    pub key: BinString<'a>,
}
}

#[derive(Debug)]
pub enum Signature<'a> {
    Ed25519(Ed25519Sig<'a>),
    Unknown(Unknown<'a>),
}

impl<'a> Signature<'a> {
    /// The algorithm name presented
    pub fn algorithm_name(&self) -> Result<&'a str, &Unknown<'a>> {
        match self {
            Signature::Ed25519(_) => Ok(SSH_NAME_ED25519),
            Signature::Unknown(u) => Err(u),
        }
    }
}

impl SSHEncode for Signature<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        match self {
            Signature::Ed25519(k) => {
                SSH_NAME_ED25519.enc(s)?;
                k.enc(s)
            }
            Signature::Unknown(_) => Err(WireError::UnknownVariant),
        }
    }
}

impl<'de: 'a, 'a> SSHDecode<'de> for Signature<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let name = BinString::dec(s)?.0;
        if name == SSH_NAME_ED25519.as_bytes() {
            Ok(Signature::Ed25519(SSHDecode::dec(s)?))
        } else {
            Ok(Signature::Unknown(Unknown(name)))
        }
    }
}

wire_struct! {
#[derive(Debug)]
pub struct Ed25519Sig<'a> {
    pub sig: BinString<'a>,
}
}

wire_struct! {
/// Request specific data is kept opaque, none are implemented.
#[derive(Debug)]
pub struct GlobalRequest<'a> {
    pub req: &'a str,
    pub want_reply: bool,
    pub data: Rest<'a>,
}
}

wire_struct! {
/// May carry request specific data, which is ignored.
#[derive(Debug)]
pub struct RequestSuccess<'a> {
    pub data: Rest<'a>,
}
}

wire_struct! {
#[derive(Debug)]
pub struct RequestFailure {}
}

wire_struct! {
/// Only `"session"` channels are opened, which carry no extra data.
#[derive(Debug)]
pub struct ChannelOpen<'a> {
    pub ty: &'a str,
    pub num: u32,
    pub initial_window: u32,
    pub max_packet: u32,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ChannelOpenConfirmation {
    pub num: u32,
    pub sender_num: u32,
    pub initial_window: u32,
    pub max_packet: u32,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ChannelOpenFailure<'a> {
    pub num: u32,
    pub reason: u32,
    pub desc: TextString<'a>,
    pub lang: &'a str,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ChannelWindowAdjust {
    pub num: u32,
    pub adjust: u32,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ChannelData<'a> {
    pub num: u32,
    pub data: BinString<'a>,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ChannelDataExt<'a> {
    pub num: u32,
    pub code: u32,
    pub data: BinString<'a>,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ChannelEof {
    pub num: u32,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ChannelClose {
    pub num: u32,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ChannelSuccess {
    pub num: u32,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ChannelFailure {
    pub num: u32,
}
}

#[derive(Debug)]
pub struct ChannelRequest<'a> {
    pub num: u32,
    pub want_reply: bool,
    pub req: ChannelReqType<'a>,
}

#[derive(Debug)]
pub enum ChannelReqType<'a> {
    Shell,
    Exec(Exec<'a>),
    Pty(PtyReq<'a>),
    Subsystem(Subsystem<'a>),
    WinChange(WinChange),
    ExitStatus(ExitStatus),
    ExitSignal(ExitSignal<'a>),
    Unknown(Unknown<'a>),
}

impl ChannelReqType<'_> {
    pub fn name(&self) -> Result<&'static str, &Unknown<'_>> {
        Ok(match self {
            ChannelReqType::Shell => "shell",
            ChannelReqType::Exec(_) => "exec",
            ChannelReqType::Pty(_) => "pty-req",
            ChannelReqType::Subsystem(_) => "subsystem",
            ChannelReqType::WinChange(_) => "window-change",
            ChannelReqType::ExitStatus(_) => "exit-status",
            ChannelReqType::ExitSignal(_) => "exit-signal",
            ChannelReqType::Unknown(u) => return Err(u),
        })
    }
}

impl SSHEncode for ChannelRequest<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        self.num.enc(s)?;
        let name = self.req.name().map_err(|_| WireError::UnknownVariant)?;
        name.enc(s)?;
        self.want_reply.enc(s)?;
        match &self.req {
            ChannelReqType::Shell => Ok(()),
            ChannelReqType::Exec(r) => r.enc(s),
            ChannelReqType::Pty(r) => r.enc(s),
            ChannelReqType::Subsystem(r) => r.enc(s),
            ChannelReqType::WinChange(r) => r.enc(s),
            ChannelReqType::ExitStatus(r) => r.enc(s),
            ChannelReqType::ExitSignal(r) => r.enc(s),
            ChannelReqType::Unknown(_) => Err(WireError::UnknownVariant),
        }
    }
}

impl<'de: 'a, 'a> SSHDecode<'de> for ChannelRequest<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let num = u32::dec(s)?;
        let name = BinString::dec(s)?.0;
        let want_reply = bool::dec(s)?;
        let req = match name {
            b"shell" => ChannelReqType::Shell,
            b"exec" => ChannelReqType::Exec(SSHDecode::dec(s)?),
            b"pty-req" => ChannelReqType::Pty(SSHDecode::dec(s)?),
            b"subsystem" => ChannelReqType::Subsystem(SSHDecode::dec(s)?),
            b"window-change" => ChannelReqType::WinChange(SSHDecode::dec(s)?),
            b"exit-status" => ChannelReqType::ExitStatus(SSHDecode::dec(s)?),
            b"exit-signal" => ChannelReqType::ExitSignal(SSHDecode::dec(s)?),
            _ => {
                s.take(s.remaining())?;
                ChannelReqType::Unknown(Unknown(name))
            }
        };
        Ok(Self { num, want_reply, req })
    }
}

wire_struct! {
#[derive(Debug)]
pub struct Exec<'a> {
    pub command: TextString<'a>,
}
}

wire_struct! {
#[derive(Debug)]
pub struct Subsystem<'a> {
    pub subsystem: TextString<'a>,
}
}

wire_struct! {
/// The contents of a `"pty-req"` request.
#[derive(Debug)]
pub struct PtyReq<'a> {
    pub term: TextString<'a>,
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
    pub modes: BinString<'a>,
}
}

wire_struct! {
#[derive(Debug, Clone)]
pub struct WinChange {
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ExitStatus {
    pub status: u32,
}
}

wire_struct! {
#[derive(Debug)]
pub struct ExitSignal<'a> {
    pub signal: &'a str,
    pub core: bool,
    pub error: TextString<'a>,
    pub lang: &'a str,
}
}

/// All remaining bytes of a packet, uninterpreted.
#[derive(Clone, PartialEq)]
pub struct Rest<'a>(pub &'a [u8]);

impl fmt::Debug for Rest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rest(len={})", self.0.len())
    }
}

impl SSHEncode for Rest<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        self.0.enc(s)
    }
}

impl<'de: 'a, 'a> SSHDecode<'de> for Rest<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        Ok(Rest(s.take(s.remaining())?))
    }
}

// Placeholder for unknown method names. These are sometimes non-fatal and
// need to be handled by the relevant code, for example a server's RSA host key.
// This is deliberately not Serializable, we only receive it.
#[derive(Clone, PartialEq)]
pub struct Unknown<'a>(pub &'a [u8]);

impl fmt::Display for Unknown<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(s) = sshwire::try_as_ascii_str(self.0) {
            f.write_str(s)
        } else {
            write!(f, "non-ascii {:?}", self.0.hex_dump())
        }
    }
}

impl fmt::Debug for Unknown<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// We have repeated `match` statements for the various packet types, use a macro
macro_rules! messagetypes {
    (
        $( ( $message_num:literal,
            $SpecificPacketVariant:ident,
            $SpecificPacketType:ty,
            $SSH_MESSAGE_NAME:ident
            ),
             )*
    ) => {

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum MessageNumber {
    // variants are eg
    // SSH_MSG_KEXINIT = 20,
    $(
    $SSH_MESSAGE_NAME = $message_num,
    )*
}

impl TryFrom<u8> for MessageNumber {
    type Error = Error;
    fn try_from(v: u8) -> Result<Self> {
        match v {
            $(
            $message_num => Ok(MessageNumber::$SSH_MESSAGE_NAME),
            )*
            _ => {
                Err(Error::UnknownPacket { number: v })
            }
        }
    }
}

impl SSHEncode for Packet<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        let t = self.message_num() as u8;
        t.enc(s)?;
        match self {
            $(
            Packet::$SpecificPacketVariant(p) => {
                p.enc(s)?
            }
            )*
        };
        Ok(())
    }
}

impl<'de: 'a, 'a> SSHDecode<'de> for Packet<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let msg_num = u8::dec(s)?;
        let ty = MessageNumber::try_from(msg_num)
            .map_err(|_| WireError::UnknownPacket { number: msg_num })?;

        // Decode based on the message number
        let p = match ty {
            $(
            MessageNumber::$SSH_MESSAGE_NAME => Packet::$SpecificPacketVariant(SSHDecode::dec(s)?),
            )*
        };
        Ok(p)
    }
}

/// Top level SSH packet enum
#[derive(Debug)]
pub enum Packet<'a> {
    // eg KexInit(KexInit<'a>),
    $(
    $SpecificPacketVariant($SpecificPacketType),
    )*
}

impl<'a> Packet<'a> {
    pub fn message_num(&self) -> MessageNumber {
        match self {
            $(
            Packet::$SpecificPacketVariant(_) => {
                MessageNumber::$SSH_MESSAGE_NAME
            }
            )*
        }
    }
}

$(
impl<'a> From<$SpecificPacketType> for Packet<'a> {
    fn from(s: $SpecificPacketType) -> Packet<'a> {
        Packet::$SpecificPacketVariant(s)
    }
}
)*

} } // macro

messagetypes![
(1, Disconnect, Disconnect<'a>, SSH_MSG_DISCONNECT),
(2, Ignore, Ignore<'a>, SSH_MSG_IGNORE),
(3, Unimplemented, Unimplemented, SSH_MSG_UNIMPLEMENTED),
(4, DebugPacket, DebugPacket<'a>, SSH_MSG_DEBUG),
(5, ServiceRequest, ServiceRequest<'a>, SSH_MSG_SERVICE_REQUEST),
(6, ServiceAccept, ServiceAccept<'a>, SSH_MSG_SERVICE_ACCEPT),
(20, KexInit, KexInit<'a>, SSH_MSG_KEXINIT),
(21, NewKeys, NewKeys, SSH_MSG_NEWKEYS),
(30, KexDHInit, KexDHInit<'a>, SSH_MSG_KEXDH_INIT),
(31, KexDHReply, KexDHReply<'a>, SSH_MSG_KEXDH_REPLY),

(50, UserauthRequest, UserauthRequest<'a>, SSH_MSG_USERAUTH_REQUEST),
(51, UserauthFailure, UserauthFailure<'a>, SSH_MSG_USERAUTH_FAILURE),
(52, UserauthSuccess, UserauthSuccess, SSH_MSG_USERAUTH_SUCCESS),
(53, UserauthBanner, UserauthBanner<'a>, SSH_MSG_USERAUTH_BANNER),

(80, GlobalRequest, GlobalRequest<'a>, SSH_MSG_GLOBAL_REQUEST),
(81, RequestSuccess, RequestSuccess<'a>, SSH_MSG_REQUEST_SUCCESS),
(82, RequestFailure, RequestFailure, SSH_MSG_REQUEST_FAILURE),

(90, ChannelOpen, ChannelOpen<'a>, SSH_MSG_CHANNEL_OPEN),
(91, ChannelOpenConfirmation, ChannelOpenConfirmation, SSH_MSG_CHANNEL_OPEN_CONFIRMATION),
(92, ChannelOpenFailure, ChannelOpenFailure<'a>, SSH_MSG_CHANNEL_OPEN_FAILURE),
(93, ChannelWindowAdjust, ChannelWindowAdjust, SSH_MSG_CHANNEL_WINDOW_ADJUST),
(94, ChannelData, ChannelData<'a>, SSH_MSG_CHANNEL_DATA),
(95, ChannelDataExt, ChannelDataExt<'a>, SSH_MSG_CHANNEL_EXTENDED_DATA),
(96, ChannelEof, ChannelEof, SSH_MSG_CHANNEL_EOF),
(97, ChannelClose, ChannelClose, SSH_MSG_CHANNEL_CLOSE),
(98, ChannelRequest, ChannelRequest<'a>, SSH_MSG_CHANNEL_REQUEST),
(99, ChannelSuccess, ChannelSuccess, SSH_MSG_CHANNEL_SUCCESS),
(100, ChannelFailure, ChannelFailure, SSH_MSG_CHANNEL_FAILURE),
];
