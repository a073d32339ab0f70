#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use crate::*;
use packets::PubKey;

/// Defines application behaviour as a client
///
/// The trait methods are called during the handshake. All have
/// defaults, so an empty `impl` accepts any host key and logs banners.
pub trait CliBehaviour {
    /// Check that a server's hostkey is valid.
    ///
    /// `fingerprint` is the `SHA256:` form of the key blob as the server sent it,
    /// so is given for key types that can't be decoded too.
    /// The default accepts any key, logging a warning with its fingerprint.
    /// No known-hosts store is consulted.
    fn valid_hostkey(&mut self, key: &PubKey, fingerprint: &str) -> bool {
        match key.algorithm_name() {
            Ok(name) => warn!("Host key {name} {fingerprint} is not verified"),
            Err(unk) => warn!("Host key {unk} {fingerprint} is not verified"),
        }
        true
    }

    /// Show a banner sent from a server. Arguments are provided
    /// by the (untrusted) server.
    fn show_banner(&mut self, banner: &str) {
        info!("Got banner:\n{:?}", banner.escape_default());
    }
}

/// Accepts any host key, logs banners
#[derive(Debug, Default)]
pub struct DefaultBehaviour;

impl CliBehaviour for DefaultBehaviour {}

#[cfg(test)]
mod tests {
    use crate::*;
    use behaviour::*;
    use sign::SignKey;

    #[test]
    fn default_accepts() {
        probelog::init_test_log();
        let k = SignKey::from_seed(&[2; 32]);
        let fp = sign::fingerprint(&k.pubkey_blob().unwrap());
        let mut buf = [0u8; 32];
        assert!(DefaultBehaviour.valid_hostkey(&k.pubkey(&mut buf), &fp));

        let rsa = PubKey::Unknown(packets::Unknown(b"ssh-rsa"));
        assert!(DefaultBehaviour.valid_hostkey(&rsa, "SHA256:x"));
    }
}
