//! Cryptographic building blocks shared by the handshake, the record
//! transport and the end-to-end tunnel.
//!
//! Everything here is a thin, typed wrapper over HMAC-SHA256,
//! ChaCha20 and XChaCha20-Poly1305; no protocol logic lives in this module.

use core::fmt::{Debug, Formatter};

use chacha20poly1305::{aead::KeyInit, XChaCha20Poly1305};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, TryRngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::Error;

pub(crate) type HmacSha256 = Hmac<Sha256>;

/// The all-zero nonce used when a key is never reused for a second message.
pub(crate) const ZERO_NONCE: [u8; 24] = [0u8; 24];

/// Keyed hash used throughout the protocol.
///
/// Argument order follows the deployed fleet: the *second* argument is the
/// HMAC key and the first is the message. Getting this backwards produces a
/// peer that can talk only to itself.
pub(crate) fn hm(msg: &[u8], key: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// XChaCha20-Poly1305 instance for the given 256-bit key.
pub(crate) fn aead(key: &[u8; 32]) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new(key.into())
}

/// A 256-bit pre-shared authenticator between a bridge and its users.
///
/// The cookie is distributed out-of-band (through the directory) and is never
/// transmitted on the wire in the clear; both the handshake and the directory
/// registry are keyed by it.
///
/// Cookies should always come from a secure entropy source such as
/// [`Cookie::from_entropy`]. Low-entropy values are open to offline
/// dictionary attacks by anyone who records a handshake.
#[derive(Clone, Eq, PartialEq, Hash, Zeroize, ZeroizeOnDrop)]
pub struct Cookie([u8; 32]);

impl Cookie {
    /// Generates a new `Cookie` from system entropy.
    pub fn from_entropy() -> Self {
        let mut cookie = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut cookie)
            .expect("system random source failure");
        Self(cookie)
    }

    /// Parses a cookie from its 64-character hex form, as used by the
    /// directory's add endpoint.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let bytes = hex::decode(s).map_err(|_| Error::CodecMalformed)?;
        let cookie: [u8; 32] = bytes.try_into().map_err(|_| Error::CodecMalformed)?;
        Ok(Self(cookie))
    }

    /// Returns the hex form of this cookie.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Gets a reference to the cookie's bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Extracts the cookie's bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Derives the nowcookie for a 30-second time bucket.
    ///
    /// The bucket is `floor(unix_time / 30)` plus the receiver's sweep
    /// offset; the bucket number is hashed in its decimal string form for
    /// compatibility with the deployed fleet.
    pub(crate) fn now_cookie(&self, bucket: i64) -> [u8; 32] {
        hm(&self.0, bucket.to_string().as_bytes())
    }
}

impl From<[u8; 32]> for Cookie {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl Debug for Cookie {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Cookie").field(&"*****").finish()
    }
}

/// A 256-bit shared secret agreed through the cookie handshake.
///
/// Feeds the record transport's per-direction key schedule and the tunnel's
/// up/dn AEAD keys.
#[derive(Clone, Eq, PartialEq, Zeroize, ZeroizeOnDrop)]
pub(crate) struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for SharedSecret {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl Debug for SharedSecret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SharedSecret").field(&"*****").finish()
    }
}

/// Process-wide secret behind the server's deterministic handshake keygen.
///
/// Re-randomised at every start; write-once and read lock-free afterwards
/// (see the `MASTER_SECRET` singleton in the crate root). Because the
/// server's X25519 secret is a pure function of the client's public key and
/// this value, the server holds no per-connection state before a valid hello
/// arrives.
pub(crate) struct MasterSecret([u8; 32]);

impl MasterSecret {
    pub(crate) fn from_entropy() -> Self {
        let mut secret = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut secret)
            .expect("system random source failure");
        Self(secret)
    }

    /// Derives the server-side X25519 secret for a given client public key.
    pub(crate) fn derive_static_secret(&self, their_pk: &[u8; 32]) -> StaticSecret {
        let mut hasher = Sha256::new();
        hasher.update(their_pk);
        hasher.update(self.0);
        StaticSecret::from(<[u8; 32]>::from(hasher.finalize()))
    }
}

impl Debug for MasterSecret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MasterSecret").field(&"*****").finish()
    }
}

#[cfg(test)]
mod test {
    use chacha20poly1305::aead::Aead;

    use super::*;

    #[test]
    fn test_hm_rfc4231_vector() {
        // RFC 4231 test case 2: key "Jefe", data "what do ya want for nothing?".
        let digest = hm(b"what do ya want for nothing?", b"Jefe");
        assert_eq!(
            hex::encode(digest),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_cookie_hex_roundtrip() {
        let cookie = Cookie::from_entropy();
        let parsed = Cookie::from_hex(&cookie.to_hex()).unwrap();
        assert_eq!(cookie, parsed);

        assert!(Cookie::from_hex("abcd").is_err());
        assert!(Cookie::from_hex("not hex at all").is_err());
    }

    #[test]
    fn test_now_cookie_changes_per_bucket() {
        let cookie = Cookie::from([7u8; 32]);
        assert_eq!(cookie.now_cookie(1000), cookie.now_cookie(1000));
        assert_ne!(cookie.now_cookie(1000), cookie.now_cookie(1001));
    }

    #[test]
    fn test_aead_seal_open() {
        let key = [3u8; 32];
        let sealed = aead(&key)
            .encrypt(&ZERO_NONCE.into(), b"Hello, world!".as_ref())
            .unwrap();
        let opened = aead(&key).decrypt(&ZERO_NONCE.into(), sealed.as_ref()).unwrap();
        assert_eq!(opened, b"Hello, world!");

        let mut tampered = sealed;
        tampered[0] = tampered[0].wrapping_add(1);
        assert!(aead(&key)
            .decrypt(&ZERO_NONCE.into(), tampered.as_ref())
            .is_err());
    }

    #[test]
    fn test_deterministic_keygen_is_stable() {
        let master = MasterSecret::from_entropy();
        let their_pk = [9u8; 32];
        let a = master.derive_static_secret(&their_pk);
        let b = master.derive_static_secret(&their_pk);
        assert_eq!(a.to_bytes(), b.to_bytes());

        let c = master.derive_static_secret(&[10u8; 32]);
        assert_ne!(a.to_bytes(), c.to_bytes());
    }
}
