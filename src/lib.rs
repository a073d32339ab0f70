//! A small SSH2 client engine.
//!
//! Connects with curve25519 key exchange and `aes256-ctr`/`hmac-sha2-256`,
//! authenticates with a password or an ed25519 key (OpenSSH private key format),
//! then runs either an interactive shell ([`run_shell()`]) or a subsystem or
//! command ([`SubsystemClient`]).

#![forbid(unsafe_code)]

// avoids headscratching
#![deny(unused_must_use)]

pub mod sshwire;
pub mod packets;
pub mod sshnames;
pub mod config;
pub mod error;
pub mod random;
pub mod event;

mod conn;
mod encrypt;
mod ident;
mod kex;
mod namelist;
mod openssh;
mod sign;

mod auth;
mod behaviour;
mod channel;
mod cliauth;
mod client;
mod shell;
mod subsystem;
mod traffic;

mod probelog;

// Application API
pub use sshwire::TextString;

pub use error::{Error, ErrorKind, Result};
pub use sign::{OwnedSig, SignKey};
pub use packets::{PubKey, Signature};
pub use openssh::parse_openssh;

pub use behaviour::{CliBehaviour, DefaultBehaviour};
pub use channel::{ChanPurpose, Pty};
pub use config::{AuthCredential, ConnectParams, ConnectRequest};
pub use conn::ConnState;
pub use event::{ControlMessage, ShellEvent, ShellInput};
pub use client::ChanEvent;

pub use shell::{connect_shell, run_shell};
pub use subsystem::{connect_subsystem, SubsystemClient};
