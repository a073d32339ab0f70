//! Protocol constants and connection parameters.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;
use core::time::Duration;

use serde::Deserialize;
use zeroize::Zeroizing;

use crate::*;
use channel::Pty;
use sign::SignKey;

/// Initial local channel window
pub const DEFAULT_WINDOW: usize = 1024 * 1024;
/// A window adjustment is sent once the local window falls below this
pub const WINDOW_REFILL_THRESHOLD: usize = 256 * 1024;
pub const WINDOW_INCREMENT: usize = 1024 * 1024;

/// Local max packet, for channel data
pub const DEFAULT_MAX_PACKET: usize = 32 * 1024;

/// Largest packet accepted from the peer, excluding the length field.
/// Anything larger is treated as a bad decrypt.
pub const MAX_PACKET_LEN: usize = 64 * 1024;

pub const DEFAULT_TERM: &str = "xterm";
pub const DEFAULT_COLS: u32 = 80;
pub const DEFAULT_ROWS: u32 = 24;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Credentials for user authentication
pub enum AuthCredential {
    Password(Zeroizing<String>),
    /// An already decrypted key
    PublicKey(SignKey),
}

// Don't print passwords
impl fmt::Debug for AuthCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthCredential::Password(_) => f.write_str("Password"),
            AuthCredential::PublicKey(k) => write!(f, "PublicKey({k:?})"),
        }
    }
}

/// Everything needed to establish a session
#[derive(Debug)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthCredential,
    /// Bounds every handshake step and write
    pub timeout: Duration,
    /// Used by the interactive shell
    pub pty: Pty,
    /// Check the server's host key signature over the exchange hash.
    ///
    /// The host key itself is never checked against a trust store,
    /// see [`CliBehaviour::valid_hostkey`](crate::CliBehaviour::valid_hostkey).
    pub verify_hostkey_signature: bool,
}

impl ConnectParams {
    pub fn new(host: &str, username: &str, auth: AuthCredential) -> Self {
        ConnectParams {
            host: host.into(),
            port: sshnames::SSH_PORT,
            username: username.into(),
            auth,
            timeout: DEFAULT_TIMEOUT,
            pty: Pty::default(),
            verify_hostkey_signature: false,
        }
    }

    /// `host:port` for display
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthMethodName {
    Password,
    PrivateKey,
}

fn default_port() -> u16 {
    sshnames::SSH_PORT
}

/// A connection request as received from a caller, usually as JSON:
///
/// ```json
/// {"host": "example.com", "port": 22, "username": "probe",
///  "authMethod": "privateKey", "privateKey": "-----BEGIN OPENSSH...", "passphrase": "pw"}
/// ```
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth_method: AuthMethodName,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth_method", &self.auth_method)
            .finish_non_exhaustive()
    }
}

impl ConnectRequest {
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|source| Error::Json { source })
    }

    /// Converts to [`ConnectParams`], parsing and decrypting a private key.
    ///
    /// This happens before any network traffic so that key problems
    /// are reported without connecting.
    pub fn into_params(self) -> Result<ConnectParams> {
        let auth = match self.auth_method {
            AuthMethodName::Password => {
                let pw = self.password.ok_or(Error::MissingCredential { what: "password" })?;
                AuthCredential::Password(Zeroizing::new(pw))
            }
            AuthMethodName::PrivateKey => {
                let k = self.private_key.ok_or(Error::MissingCredential { what: "private key" })?;
                let k = Zeroizing::new(k);
                let passphrase = self.passphrase.map(Zeroizing::new);
                let key = openssh::parse_openssh(&k, passphrase.as_ref().map(|p| p.as_str()))?;
                AuthCredential::PublicKey(key)
            }
        };

        let mut p = ConnectParams::new(&self.host, &self.username, auth);
        p.port = self.port;
        Ok(p)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::*;
    use crate::error::ErrorKind;

    #[test]
    fn password_request() {
        let r = ConnectRequest::from_json(
            r#"{"host":"h.example","username":"u","authMethod":"password","password":"pw"}"#,
        )
        .unwrap();
        let p = r.into_params().unwrap();
        assert_eq!(p.port, 22);
        assert_eq!(p.target(), "h.example:22");
        assert!(matches!(p.auth, AuthCredential::Password(ref pw) if pw.as_str() == "pw"));
        assert!(!p.verify_hostkey_signature);
        assert_eq!(p.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn missing_credential() {
        let r = ConnectRequest::from_json(
            r#"{"host":"h","port":2222,"username":"u","authMethod":"privateKey","password":"pw"}"#,
        )
        .unwrap();
        let e = r.into_params().unwrap_err();
        assert!(matches!(e, Error::MissingCredential { what: "private key" }));
        assert_eq!(e.kind(), ErrorKind::Auth);
    }

    #[test]
    fn key_request_parsed_early() {
        let key = include_str!("../testdata/id_ed25519_aes256ctr");
        let req = serde_json::json!({
            "host": "h", "username": "u", "authMethod": "privateKey",
            "privateKey": key,
        });
        let r = ConnectRequest::from_json(&req.to_string()).unwrap();
        assert!(matches!(r.into_params(), Err(Error::KeyEncrypted)));

        let req = serde_json::json!({
            "host": "h", "username": "u", "authMethod": "privateKey",
            "privateKey": key, "passphrase": "correct horse",
        });
        let r = ConnectRequest::from_json(&req.to_string()).unwrap();
        assert!(matches!(r.into_params().unwrap().auth, AuthCredential::PublicKey(_)));
    }

    #[test]
    fn unsupported_key_before_connect() {
        let req = serde_json::json!({
            "host": "h", "username": "u", "authMethod": "privateKey",
            "privateKey": include_str!("../testdata/id_ecdsa"),
        });
        let r = ConnectRequest::from_json(&req.to_string()).unwrap();
        match r.into_params() {
            Err(Error::UnsupportedKeyType { kind }) => assert_eq!(kind, "ecdsa-sha2-nistp256"),
            e => panic!("{e:?}"),
        }
    }

    #[test]
    fn bad_json() {
        assert!(matches!(ConnectRequest::from_json("{"), Err(Error::Json { .. })));
        let e = ConnectRequest::from_json(r#"{"host":"h","username":"u","authMethod":"kerberos"}"#);
        assert!(e.is_err());
    }
}
