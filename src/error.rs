#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use core::fmt::Arguments;
use core::str::Utf8Error;

use snafu::prelude::*;

/// The crate error type.
///
/// Every variant belongs to one [`ErrorKind`], see [`Error::kind()`].
#[non_exhaustive]
#[derive(Snafu, Debug)]
#[snafu(context(suffix(false)))]
#[snafu(visibility(pub))]
pub enum Error {
    // Connection errors
    /// IO Error
    #[snafu(display("IO error: {source}"))]
    IoError { source: std::io::Error },

    #[snafu(display("Timed out during {phase}"))]
    Timeout { phase: &'static str },

    /// Connection closed by peer
    ConnectionClosed,

    #[snafu(display("Disconnected by server: {desc}"))]
    Disconnected { reason: u32, desc: String },

    // Protocol errors
    /// Output buffer ran out of room
    NoRoom,

    /// Input buffer ran out
    RanOut,

    /// Not a UTF-8 string
    BadString,

    /// Not a valid SSH ASCII string
    BadName,

    /// Key exchange incorrect
    BadKex,

    /// Error in received SSH protocol. Will disconnect.
    SSHProtoError,

    /// Remote peer isn't SSH
    NotSSH,

    /// SSH packet contents doesn't match length
    WrongPacketLength,

    #[snafu(display("Unknown packet type {number}"))]
    UnknownPacket { number: u8 },

    /// Received packet at a disallowed time.
    PacketWrong,

    #[snafu(display("No matching {algo} algorithm"))]
    AlgoNoMatch { algo: &'static str },

    #[snafu(display("Packet size {size} too large (or bad decrypt)"))]
    BigPacket { size: usize },

    #[snafu(display("Bad private key format: {msg}"))]
    BadKeyFormat { msg: &'static str },

    #[snafu(display("Server rejected service {service}"))]
    ServiceRejected { service: &'static str },

    // Crypto errors
    /// Packet integrity failed
    BadDecrypt,

    /// Signature is incorrect
    BadSig,

    // Auth errors
    #[snafu(display("Authentication rejected by server (allowed methods: {methods})"))]
    AuthRejected { methods: String },

    /// Private key is passphrase protected, a passphrase is required
    KeyEncrypted,

    /// Incorrect passphrase or corrupt private key
    BadPassphrase,

    #[snafu(display("Unsupported key type {kind}"))]
    UnsupportedKeyType { kind: String },

    #[snafu(display("Unsupported private key KDF {kdf}"))]
    UnsupportedKdf { kdf: String },

    #[snafu(display("Unsupported private key cipher {cipher}"))]
    UnsupportedCipher { cipher: String },

    /// Key files with multiple keys are not supported
    MultipleKeys,

    #[snafu(display("Missing {what} for authentication"))]
    MissingCredential { what: &'static str },

    // Channel errors
    #[snafu(display("Channel open failed: {desc}"))]
    ChannelOpenFailed { reason: u32, desc: String },

    #[snafu(display("Channel {req} request failed"))]
    ChannelRequestFailed { req: &'static str },

    #[snafu(display("subsystem not available: {name}"))]
    SubsystemUnavailable { name: String },

    /// Channel has been closed
    ChannelClosed,

    #[snafu(display("JSON error: {source}"))]
    Json { source: serde_json::Error },

    #[snafu(display("{msg}"))]
    Custom { msg: &'static str },

    // This state should not be reached, previous logic should have prevented it.
    // Create this using [`Error::bug()`] or [`.trap()`](TrapBug::trap).
    /// Program bug
    Bug,
}

/// Broad classes of [`Error`], so a caller can tell a network problem
/// from a credentials problem from a server-capability problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Stream closed or unreachable, timeout, server disconnect
    Connection,
    /// Malformed or unexpected data from the peer
    Protocol,
    /// MAC or signature failure
    Crypto,
    /// Credentials rejected or unusable
    Auth,
    /// Channel open or channel request failure
    Channel,
}

impl Error {
    pub fn msg(m: &'static str) -> Error {
        Error::Custom { msg: m }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            | Error::IoError { .. }
            | Error::Timeout { .. }
            | Error::ConnectionClosed
            | Error::Disconnected { .. }
            => ErrorKind::Connection,

            | Error::BadDecrypt
            | Error::BadSig
            => ErrorKind::Crypto,

            | Error::AuthRejected { .. }
            | Error::KeyEncrypted
            | Error::BadPassphrase
            | Error::UnsupportedKeyType { .. }
            | Error::UnsupportedKdf { .. }
            | Error::UnsupportedCipher { .. }
            | Error::MultipleKeys
            | Error::MissingCredential { .. }
            => ErrorKind::Auth,

            | Error::ChannelOpenFailed { .. }
            | Error::ChannelRequestFailed { .. }
            | Error::SubsystemUnavailable { .. }
            | Error::ChannelClosed
            => ErrorKind::Channel,

            _ => ErrorKind::Protocol,
        }
    }

    #[cold]
    #[track_caller]
    /// Panics in debug builds, returns [`Error::Bug`] in release.
    pub fn bug() -> Error {
        // Easier to track the source of errors in development,
        // but release builds shouldn't panic.
        if cfg!(debug_assertions) {
            panic!("Hit a bug");
        } else {
            Error::Bug
        }
    }

    /// Like [`bug()`](Error::bug) but with a message
    ///
    /// The message can be used instead of a code comment, is logged at `trace` level.
    #[cold]
    pub fn bug_fmt(args: Arguments) -> Error {
        if cfg!(debug_assertions) {
            panic!("Hit a bug: {args}");
        } else {
            trace!("Hit a bug: {args}");
            Error::Bug
        }
    }

    #[cold]
    pub fn bug_msg<T>(msg: &str) -> Result<T, Error> {
        Err(Self::bug_fmt(format_args!("{}", msg)))
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

pub trait TrapBug<T> {
    /// `.trap()` should be used like `.unwrap()`, in situations
    /// never expected to fail. Instead it calls [`Error::bug()`].
    /// (or debug builds may panic)
    fn trap(self) -> Result<T, Error>;

    /// Like `trap()` but with a message, calls [`Error::bug_msg()`]
    /// The message can be used instead of a comment.
    fn trap_msg(self, args: Arguments) -> Result<T, Error>;
}

impl<T, E> TrapBug<T> for Result<T, E> {
    #[track_caller]
    fn trap(self) -> Result<T, Error> {
        if let Ok(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }
    fn trap_msg(self, args: Arguments) -> Result<T, Error> {
        if let Ok(i) = self {
            Ok(i)
        } else {
            Err(Error::bug_fmt(args))
        }
    }
}

impl<T> TrapBug<T> for Option<T> {
    #[track_caller]
    fn trap(self) -> Result<T, Error> {
        if let Some(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }
    fn trap_msg(self, args: Arguments) -> Result<T, Error> {
        if let Some(i) = self {
            Ok(i)
        } else {
            Err(Error::bug_fmt(args))
        }
    }
}

impl From<Utf8Error> for Error {
    fn from(_e: Utf8Error) -> Error {
        Error::BadString
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::IoError { source: value }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::*;

    #[test]
    fn kinds() {
        assert_eq!(Error::ConnectionClosed.kind(), ErrorKind::Connection);
        assert_eq!(Error::Timeout { phase: "kex" }.kind(), ErrorKind::Connection);
        assert_eq!(Error::BigPacket { size: 70000 }.kind(), ErrorKind::Protocol);
        assert_eq!(Error::BadDecrypt.kind(), ErrorKind::Crypto);
        assert_eq!(Error::BadPassphrase.kind(), ErrorKind::Auth);
        assert_eq!(Error::KeyEncrypted.kind(), ErrorKind::Auth);
        let e = Error::SubsystemUnavailable { name: "sftp".into() };
        assert_eq!(e.kind(), ErrorKind::Channel);
        assert_eq!(e.to_string(), "subsystem not available: sftp");
    }

    #[test]
    fn open_failure_reason_verbatim() {
        let e = Error::ChannelOpenFailed {
            reason: 1,
            desc: "administratively prohibited".into(),
        };
        assert!(e.to_string().ends_with("administratively prohibited"));
    }
}
