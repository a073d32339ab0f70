//! Ed25519 signing and verification.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use digest::Digest;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::*;
use packets::{Ed25519PubKey, Ed25519Sig, PubKey, Signature};
use sshwire::{BinString, SSHEncode};

/// A signature created locally
pub struct OwnedSig(pub [u8; 64]);

impl<'a> From<&'a OwnedSig> for Signature<'a> {
    fn from(s: &'a OwnedSig) -> Self {
        Signature::Ed25519(Ed25519Sig { sig: BinString(&s.0) })
    }
}

/// A SSH signing key, the private part is held locally.
///
/// Zeroized on drop.
pub enum SignKey {
    Ed25519(SigningKey),
}

impl SignKey {
    /// From the 32 byte private seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        SignKey::Ed25519(SigningKey::from_bytes(seed))
    }

    pub fn generate() -> Result<Self> {
        let mut seed = Zeroizing::new([0u8; 32]);
        random::fill_random(seed.as_mut_slice())?;
        Ok(Self::from_seed(&seed))
    }

    pub fn pubkey_bytes(&self) -> [u8; 32] {
        match self {
            SignKey::Ed25519(k) => k.verifying_key().to_bytes(),
        }
    }

    /// The public key, borrowing `buf` for storage
    pub fn pubkey<'a>(&self, buf: &'a mut [u8; 32]) -> PubKey<'a> {
        *buf = self.pubkey_bytes();
        PubKey::Ed25519(Ed25519PubKey { key: BinString(buf.as_slice()) })
    }

    /// The public key in SSH wire format
    pub fn pubkey_blob(&self) -> Result<Vec<u8>> {
        let mut buf = [0u8; 32];
        sshwire::write_ssh_vec(&self.pubkey(&mut buf))
    }

    /// Signs the SSH encoding of `msg`.
    pub fn sign(&self, msg: &impl SSHEncode) -> Result<OwnedSig> {
        let m = Zeroizing::new(sshwire::write_ssh_vec(msg)?);
        let sig = match self {
            SignKey::Ed25519(k) => OwnedSig(k.sign(&m).to_bytes()),
        };

        // Faults in signing can expose the private key. We verify the signature
        // just created to avoid this problem.
        let mut buf = [0u8; 32];
        verify(&self.pubkey(&mut buf), &m, &(&sig).into())?;

        Ok(sig)
    }
}

impl core::fmt::Debug for SignKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SignKey").field("Ed25519", &"...").finish()
    }
}

/// Verifies `sig` over raw message bytes. Returns `Ok(())` on success
pub fn verify(pubkey: &PubKey, msg: &[u8], sig: &Signature) -> Result<()> {
    match (pubkey, sig) {
        (PubKey::Ed25519(k), Signature::Ed25519(s)) => {
            let k: &[u8; 32] = k.key.0.try_into().map_err(|_| Error::BadSig)?;
            let k = VerifyingKey::from_bytes(k).map_err(|_| Error::BadSig)?;
            let s: &[u8; 64] = s.sig.0.try_into().map_err(|_| Error::BadSig)?;
            let s = ed25519_dalek::Signature::from_bytes(s);
            k.verify_strict(msg, &s).map_err(|_| Error::BadSig)
        }
        _ => {
            warn!(
                "Signature \"{:?}\" doesn't match key type \"{:?}\"",
                sig.algorithm_name(),
                pubkey.algorithm_name(),
            );
            Err(Error::BadSig)
        }
    }
}

/// OpenSSH style `SHA256:...` fingerprint of a public key blob
pub fn fingerprint(blob: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(blob)))
}
