//! Client user authentication, RFC4252.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::*;
use auth::{req_packet_pubkey, AuthSigMsg};
use behaviour::CliBehaviour;
use config::AuthCredential;
use conn::{Conn, ConnState};
use packets::{AuthMethod, MethodPassword, Packet, UserauthRequest};
use sign::SignKey;
use sshnames::*;

/// Sends a single authentication request with `cred` and waits for the result.
///
/// No other methods are attempted, a failure response is final.
pub(crate) async fn authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut Conn<S>,
    username: &str,
    cred: &AuthCredential,
    b: &mut impl CliBehaviour,
) -> Result<()> {
    conn.set_state(ConnState::UserAuth);

    match cred {
        AuthCredential::Password(pw) => {
            debug!("Trying password auth for {username}");
            conn.send(UserauthRequest {
                username: username.into(),
                service: SSH_SERVICE_CONNECTION,
                method: AuthMethod::Password(MethodPassword {
                    change: false,
                    password: pw.as_str().into(),
                }),
            })
            .await?;
        }
        AuthCredential::PublicKey(key) => {
            debug!("Trying pubkey auth for {username}");
            let pk = key.pubkey_bytes();
            let sess_id = conn.sess_id()?.clone();
            let sig = sign_request(key, username, &pk, &sess_id)?;
            conn.send(req_packet_pubkey(username, &pk, Some(&sig), false)).await?;
        }
    }

    loop {
        let p = conn.recv("auth").await?;
        match p.packet()? {
            Packet::UserauthSuccess(_) => {
                info!("Authentication succeeded");
                return Ok(());
            }
            Packet::UserauthFailure(f) => {
                let methods = f.methods.as_str();
                debug!("Authentication failed, partial {}, can continue {methods}", f.partial);
                return Err(Error::AuthRejected { methods });
            }
            Packet::UserauthBanner(banner) => b.show_banner(&banner.message.to_lossy()),
            other => debug!("Ignoring {:?} during auth", other.message_num()),
        }
    }
}

fn sign_request(
    key: &SignKey,
    username: &str,
    pk: &[u8; 32],
    sess_id: &kex::SessId,
) -> Result<sign::OwnedSig> {
    let req = req_packet_pubkey(username, pk, None, true);
    key.sign(&AuthSigMsg::new(&req, sess_id))
}
