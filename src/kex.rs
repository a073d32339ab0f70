//! Key exchange, RFC4253 sections 7 and 8 with Curve25519 from RFC8731.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;

use digest::Digest;
use pretty_hex::PrettyHex;
use rand_core::OsRng;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::*;
use behaviour::CliBehaviour;
use encrypt::{KeyMaterial, Keys};
use namelist::LocalNames;
use packets::{KexDHReply, KexInit, Packet, PubKey, Signature};
use sshnames::*;
use sshwire::{hash_mpint, BinString};

// at present we only have curve25519 with sha256
const MAX_SESSID: usize = 32;
pub type SessId = heapless::Vec<u8, MAX_SESSID>;

pub(crate) type KexCookie = [u8; 16];

const OPTIONS_KEX: &[&str] = &[SSH_NAME_CURVE25519, SSH_NAME_CURVE25519_LIBSSH];
// RSA host keys are offered so that RSA-only servers still negotiate,
// the host key is not authenticated unless requested.
const OPTIONS_HOSTSIG: &[&str] = &[SSH_NAME_ED25519, SSH_NAME_RSA_SHA256];
const OPTIONS_CIPHER: &[&str] = &[SSH_NAME_AES256_CTR];
const OPTIONS_MAC: &[&str] = &[SSH_NAME_HMAC_SHA256];
const OPTIONS_COMP: &[&str] = &[SSH_NAME_NONE];
static EMPTY_NAMES: LocalNames = LocalNames::new();

/// Our algorithm lists in preference order
#[derive(Debug)]
pub(crate) struct AlgoConfig {
    pub kexs: LocalNames,
    pub hostsig: LocalNames,
    pub ciphers: LocalNames,
    pub macs: LocalNames,
    pub comps: LocalNames,
}

impl AlgoConfig {
    pub fn new() -> Result<Self> {
        Ok(AlgoConfig {
            kexs: OPTIONS_KEX.try_into()?,
            hostsig: OPTIONS_HOSTSIG.try_into()?,
            ciphers: OPTIONS_CIPHER.try_into()?,
            macs: OPTIONS_MAC.try_into()?,
            comps: OPTIONS_COMP.try_into()?,
        })
    }
}

/// Returns a new random cookie for a `KexInit`
pub(crate) fn new_cookie() -> Result<KexCookie> {
    let mut cookie = [0u8; 16];
    random::fill_random(cookie.as_mut_slice())?;
    Ok(cookie)
}

pub(crate) fn make_kexinit(cookie: KexCookie, conf: &AlgoConfig) -> Packet<'_> {
    KexInit {
        cookie,
        kex: (&conf.kexs).into(),
        hostsig: (&conf.hostsig).into(),
        cipher_c2s: (&conf.ciphers).into(),
        cipher_s2c: (&conf.ciphers).into(),
        mac_c2s: (&conf.macs).into(),
        mac_s2c: (&conf.macs).into(),
        comp_c2s: (&conf.comps).into(),
        comp_s2c: (&conf.comps).into(),
        lang_c2s: (&EMPTY_NAMES).into(),
        lang_s2c: (&EMPTY_NAMES).into(),
        first_follows: false,
        reserved: 0,
    }
    .into()
}

/// The negotiated algorithms
#[derive(Debug)]
pub(crate) struct Algos {
    pub kex: &'static str,
    pub hostsig: &'static str,
    pub cipher_enc: &'static str,
    pub cipher_dec: &'static str,
    pub integ_enc: &'static str,
    pub integ_dec: &'static str,

    // If first_kex_packet_follows was set in SSH_MSG_KEXINIT but the
    // guessed algorithms don't match, we discard the next message (RFC4253 Sec 7).
    pub discard_next: bool,
}

impl fmt::Display for Algos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Negotiated algorithms {{ kex {}, hostkey {}, cipher {}/{}, mac {}/{} }}",
            self.kex, self.hostsig, self.cipher_enc, self.cipher_dec,
            self.integ_enc, self.integ_dec)
    }
}

/// Perform SSH algorithm negotiation against the peer's `KexInit`
pub(crate) fn algo_negotiation(is_client: bool, p: &KexInit, conf: &AlgoConfig) -> Result<Algos> {
    // For each algorithm we select the first name in the client's
    // list that is also present in the server's list.
    let kex_list = p.kex.remote()?;
    let kex = kex_list
        .first_match(is_client, &conf.kexs)
        .ok_or(Error::AlgoNoMatch { algo: "kex" })?;
    let goodguess_kex = kex_list.first() == conf.kexs.first();

    let hostsig_list = p.hostsig.remote()?;
    let hostsig = hostsig_list
        .first_match(is_client, &conf.hostsig)
        .ok_or(Error::AlgoNoMatch { algo: "hostkey" })?;
    let goodguess_hostkey = hostsig_list.first() == conf.hostsig.first();

    // Switch between client/server tx/rx
    let c2s = (&p.cipher_c2s, &p.mac_c2s, &p.comp_c2s);
    let s2c = (&p.cipher_s2c, &p.mac_s2c, &p.comp_s2c);
    let ((cipher_tx, mac_tx, comp_tx), (cipher_rx, mac_rx, comp_rx)) =
        if is_client { (c2s, s2c) } else { (s2c, c2s) };

    let cipher_enc = cipher_tx.remote()?
        .first_match(is_client, &conf.ciphers)
        .ok_or(Error::AlgoNoMatch { algo: "encryption" })?;
    let cipher_dec = cipher_rx.remote()?
        .first_match(is_client, &conf.ciphers)
        .ok_or(Error::AlgoNoMatch { algo: "encryption" })?;
    let integ_enc = mac_tx.remote()?
        .first_match(is_client, &conf.macs)
        .ok_or(Error::AlgoNoMatch { algo: "mac" })?;
    let integ_dec = mac_rx.remote()?
        .first_match(is_client, &conf.macs)
        .ok_or(Error::AlgoNoMatch { algo: "mac" })?;

    // Compression only matches "none"
    comp_tx.remote()?
        .first_match(is_client, &conf.comps)
        .ok_or(Error::AlgoNoMatch { algo: "compression" })?;
    comp_rx.remote()?
        .first_match(is_client, &conf.comps)
        .ok_or(Error::AlgoNoMatch { algo: "compression" })?;

    let discard_next = p.first_follows && !(goodguess_kex && goodguess_hostkey);

    Ok(Algos { kex, hostsig, cipher_enc, cipher_dec, integ_enc, integ_dec, discard_next })
}

/// The exchange hash `H`, RFC4253 section 8.
///
/// Inputs are hashed in wire order, so this is the same for either role.
pub(crate) struct KexHash {
    hash_ctx: Sha256,
}

impl KexHash {
    /// `v_c` and `v_s` are version lines without CR LF,
    /// `i_c` and `i_s` the full KEXINIT payloads.
    pub fn new(v_c: &[u8], v_s: &[u8], i_c: &[u8], i_s: &[u8]) -> Self {
        let mut kh = KexHash { hash_ctx: Sha256::new() };
        kh.hash_slice(v_c);
        kh.hash_slice(v_s);
        kh.hash_slice(i_c);
        kh.hash_slice(i_s);
        kh
    }

    /// Fill everything except K.
    pub fn prefinish(&mut self, host_key: &[u8], q_c: &[u8], q_s: &[u8]) {
        self.hash_slice(host_key);
        self.hash_slice(q_c);
        self.hash_slice(q_s);
    }

    /// Compute the remainder of the hash, consuming KexHash
    pub fn finish(mut self, k: &[u8]) -> Result<SessId> {
        hash_mpint(&mut self.hash_ctx, k);
        SessId::from_slice(&self.hash_ctx.finalize()).trap()
    }

    // Hashes a slice, with a prepended u32 length
    fn hash_slice(&mut self, v: &[u8]) {
        self.hash_ctx.update((v.len() as u32).to_be_bytes());
        self.hash_ctx.update(v);
    }
}

/// The result of one key exchange
pub(crate) struct KexOutput {
    /// `H` for this exchange, conn takes the first as sess_id
    pub h: SessId,
    k: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for KexOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KexOutput").finish_non_exhaustive()
    }
}

impl KexOutput {
    pub fn new(k: &[u8], kex_hash: KexHash) -> Result<Self> {
        let h = kex_hash.finish(k)?;
        Ok(KexOutput { h, k: Zeroizing::new(k.to_vec()) })
    }

    /// Derives session keys, `sess_id` is the `H` of the first exchange.
    pub fn keys(&self, sess_id: &SessId, is_client: bool) -> Result<Keys> {
        let mat = KeyMaterial::derive(&self.k, &self.h, sess_id);
        Keys::from_material(&mat, is_client)
    }
}

pub(crate) struct KexCurve25519 {
    // Initialised in `new()`, cleared after deriving the secret
    ours: Option<x25519_dalek::EphemeralSecret>,
    // pubkey is relatively expensive to compute from the secret key
    pubkey: [u8; 32],
}

impl fmt::Debug for KexCurve25519 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KexCurve25519")
            .field("ours", &if self.ours.is_some() { "Some" } else { "None" })
            .field("pubkey", &self.pubkey)
            .finish()
    }
}

impl KexCurve25519 {
    pub fn new() -> Self {
        let ours = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
        let pubkey = x25519_dalek::PublicKey::from(&ours).to_bytes();
        KexCurve25519 { ours: Some(ours), pubkey }
    }

    pub fn pubkey(&self) -> &[u8] {
        &self.pubkey
    }

    /// Computes the shared secret `K`. May only be called once.
    pub fn secret(&mut self, theirs: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
        let theirs: [u8; 32] = theirs.try_into().map_err(|_| Error::BadKex)?;
        let theirs = x25519_dalek::PublicKey::from(theirs);
        let shsec = self.ours.take().trap()?.diffie_hellman(&theirs);
        // RFC8731 rejects an all-zero result from a low order point
        if !shsec.was_contributory() {
            debug!("Non-contributory curve25519 point");
            return Err(Error::BadKex);
        }
        Ok(Zeroizing::new(shsec.to_bytes()))
    }
}

/// Client side of one curve25519 exchange, from after both
/// KEXINITs until the KEXDH_REPLY has been checked.
pub(crate) struct ClientKex {
    pub algos: Algos,
    kex: KexCurve25519,
    kex_hash: KexHash,
}

impl ClientKex {
    /// Negotiates against the server's `KexInit`. `i_c` and `i_s` are
    /// the raw KEXINIT payloads.
    pub fn new(
        conf: &AlgoConfig,
        server_kexinit: &KexInit,
        v_c: &[u8], v_s: &[u8],
        i_c: &[u8], i_s: &[u8],
    ) -> Result<Self> {
        let algos = algo_negotiation(true, server_kexinit, conf)?;
        debug!("{algos}");
        Ok(ClientKex {
            algos,
            kex: KexCurve25519::new(),
            kex_hash: KexHash::new(v_c, v_s, i_c, i_s),
        })
    }

    pub fn make_kexdhinit(&self) -> Packet<'_> {
        packets::KexDHInit { q_c: BinString(self.kex.pubkey()) }.into()
    }

    /// Completes the exchange with the server's reply.
    ///
    /// The host key and the fingerprint of its blob are passed to `b`,
    /// and its signature over `H` is only checked when `verify_sig` is set.
    pub fn handle_kexdhreply(
        mut self,
        p: &KexDHReply,
        verify_sig: bool,
        b: &mut impl CliBehaviour,
    ) -> Result<KexOutput> {
        let hostkey: PubKey = sshwire::read_ssh(p.k_s.0)?;

        self.kex_hash.prefinish(p.k_s.0, self.kex.pubkey(), p.q_s.0);
        let k = self.kex.secret(p.q_s.0)?;
        let out = KexOutput::new(k.as_slice(), self.kex_hash)?;

        if verify_sig {
            let sig: Signature = sshwire::read_ssh(p.sig.0)?;
            trace!("verify h {:?}", out.h.hex_dump());
            sign::verify(&hostkey, &out.h, &sig)?;
            debug!("Hostkey signature is valid");
        }

        let fingerprint = sign::fingerprint(p.k_s.0);
        if b.valid_hostkey(&hostkey, &fingerprint) {
            Ok(out)
        } else {
            Err(Error::msg("Host key rejected"))
        }
    }
}
