#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use crate::*;
use kex::SessId;
use packets::{AuthMethod, Ed25519PubKey, MethodPubKey, PubKey, UserauthRequest};
use sign::OwnedSig;
use sshnames::*;
use sshwire::{BinString, Blob, SSHEncode, SSHSink, WireResult};

/// The message to be signed in a pubkey authentication message,
/// RFC4252 Section 7.
///
/// The UserauthRequest's signature field is None, with `force_sig` set.
#[derive(Debug)]
pub struct AuthSigMsg<'a> {
    pub(crate) sess_id: BinString<'a>,
    pub(crate) u: &'a UserauthRequest<'a>,
}

impl SSHEncode for AuthSigMsg<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        self.sess_id.enc(s)?;

        let m = packets::MessageNumber::SSH_MSG_USERAUTH_REQUEST as u8;
        m.enc(s)?;

        self.u.enc(s)
    }
}

impl<'a> AuthSigMsg<'a> {
    pub fn new(u: &'a UserauthRequest<'a>, sess_id: &'a SessId) -> Self {
        AuthSigMsg { sess_id: BinString(sess_id.as_ref()), u }
    }
}

/// A `"publickey"` request for an ed25519 key.
///
/// Without a signature and with `force_sig` it is the form that gets signed.
pub(crate) fn req_packet_pubkey<'b>(
    username: &'b str,
    pubkey: &'b [u8; 32],
    sig: Option<&'b OwnedSig>,
    force_sig: bool,
) -> UserauthRequest<'b> {
    UserauthRequest {
        username: username.into(),
        service: SSH_SERVICE_CONNECTION,
        method: AuthMethod::PubKey(MethodPubKey {
            sig_algo: SSH_NAME_ED25519,
            pubkey: Blob(PubKey::Ed25519(Ed25519PubKey { key: BinString(pubkey) })),
            sig: sig.map(|s| Blob(s.into())),
            force_sig,
        }),
    }
}

#[cfg(test)]
mod tests {
    use crate::*;
    use auth::*;
    use kex::SessId;
    use sign::SignKey;

    #[test]
    fn sig_msg_layout() {
        probelog::init_test_log();
        let sess_id = SessId::from_slice(&[0xaa; 32]).unwrap();
        let pk = [3u8; 32];
        let req = req_packet_pubkey("probe", &pk, None, true);
        let b = sshwire::write_ssh_vec(&AuthSigMsg::new(&req, &sess_id)).unwrap();

        let mut expect = vec![0, 0, 0, 32];
        expect.extend_from_slice(&[0xaa; 32]);
        expect.push(50);
        expect.extend_from_slice(b"\0\0\0\x05probe");
        expect.extend_from_slice(b"\0\0\0\x0essh-connection");
        expect.extend_from_slice(b"\0\0\0\x09publickey");
        // has signature
        expect.push(1);
        expect.extend_from_slice(b"\0\0\0\x0bssh-ed25519");
        // blob of string "ssh-ed25519", string key
        expect.extend_from_slice(&[0, 0, 0, 51]);
        expect.extend_from_slice(b"\0\0\0\x0bssh-ed25519");
        expect.extend_from_slice(&[0, 0, 0, 32]);
        expect.extend_from_slice(&pk);
        assert_eq!(b, expect);
    }

    #[test]
    fn signed_request_verifies() {
        let key = SignKey::from_seed(&[5; 32]);
        let pk = key.pubkey_bytes();
        let sess_id = SessId::from_slice(&[1; 32]).unwrap();
        let req = req_packet_pubkey("u", &pk, None, true);
        let msg = AuthSigMsg::new(&req, &sess_id);
        let sig = key.sign(&msg).unwrap();

        let full = req_packet_pubkey("u", &pk, Some(&sig), false);
        let b = sshwire::write_ssh_vec(&full).unwrap();
        let signed = sshwire::write_ssh_vec(&msg).unwrap();
        // the sent request differs from the signed one only by the trailing signature
        // (signed has sess_id and message number first)
        assert!(b.starts_with(&signed[37..]));
        assert!(b.len() > signed.len() - 37 + 64);

        let mut buf = [0u8; 32];
        sign::verify(&key.pubkey(&mut buf), &signed, &(&sig).into()).unwrap();
    }
}
