//! End-to-end encrypted datagram overlay between a client and an exit.
//!
//! Tunnel packets ride as opaque frames through a bridge's relay session;
//! the bridge mediates the cookie bootstrap but never holds the tunnel
//! keys. Each packet is `Nonce(24B) ‖ AEAD(key, Nonce, plaintext)` under
//! XChaCha20-Poly1305 with a random per-packet nonce, and the plaintext
//! carries a 64-bit sequence number checked against a sliding replay
//! window when replay protection is enabled.

use chacha20poly1305::{aead::Aead, XChaCha20Poly1305, XNonce};
use rand::{rngs::OsRng, TryRngCore};

use crate::{
    crypto::{aead, hm, SharedSecret},
    error::Error,
    replay::ReplayWindow,
    rlp,
};

const NONCE_LEN: usize = 24;

/// One directional pair of tunnel AEAD states plus the replay window.
///
/// Derived from the handshake's shared secret: the server encrypts with the
/// "dn" key and decrypts with "up", the client mirrored. Packets that fail
/// to decrypt, fail to parse, or replay a sequence number are reported as
/// errors and otherwise ignored; nothing is ever sent in response.
pub struct Tunnel {
    enc: XChaCha20Poly1305,
    dec: XChaCha20Poly1305,
    replay: Option<ReplayWindow>,
    next_sn: u64,
}

impl Tunnel {
    pub(crate) fn new(ss: &SharedSecret, is_server: bool, replay_protection: bool) -> Self {
        let up = hm(ss.as_bytes(), b"up");
        let dn = hm(ss.as_bytes(), b"dn");
        let (enc_key, dec_key) = if is_server { (dn, up) } else { (up, dn) };
        Self {
            enc: aead(&enc_key),
            dec: aead(&dec_key),
            replay: replay_protection.then(ReplayWindow::new),
            next_sn: 0,
        }
    }

    /// Seals an already-framed plaintext into a wire packet.
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce)
            .expect("system random source failure");
        let ciphertext = self
            .enc
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .expect("sealing cannot fail");
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Frames `body` with the next sequence number and seals it.
    pub fn seal_frame(&mut self, body: &[u8]) -> Vec<u8> {
        self.next_sn += 1;
        let frame = TunnelFrame {
            sn: self.next_sn,
            body: body.to_vec(),
        };
        self.seal(&frame.encode())
    }

    /// Opens a wire packet, enforcing the replay window when enabled.
    ///
    /// Returns the decrypted plaintext. With replay protection on, the
    /// plaintext must parse as a [`TunnelFrame`] so the sequence number can
    /// be checked.
    pub fn open(&mut self, packet: &[u8]) -> Result<Vec<u8>, Error> {
        if packet.len() < NONCE_LEN {
            return Err(Error::PacketTooShort { len: packet.len() });
        }
        let plaintext = self
            .dec
            .decrypt(XNonce::from_slice(&packet[..NONCE_LEN]), &packet[NONCE_LEN..])
            .map_err(|_| Error::AeadFailed)?;
        if let Some(window) = &mut self.replay {
            let frame = TunnelFrame::decode(&plaintext)?;
            if !window.check(frame.sn) {
                return Err(Error::Replay { sn: frame.sn });
            }
        }
        Ok(plaintext)
    }

    /// Opens a wire packet and parses the framed payload.
    pub fn open_frame(&mut self, packet: &[u8]) -> Result<TunnelFrame, Error> {
        let plaintext = self.open(packet)?;
        TunnelFrame::decode(&plaintext)
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("replay_protection", &self.replay.is_some())
            .finish_non_exhaustive()
    }
}

/// A sequence-numbered tunnel payload, encoded as the two-item list
/// `[sn, body]`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TunnelFrame {
    /// Monotonically increasing per-sender sequence number.
    pub sn: u64,
    /// Opaque payload.
    pub body: Vec<u8>,
}

impl TunnelFrame {
    /// Encodes the frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut items = Vec::with_capacity(self.body.len() + 16);
        rlp::encode_uint(&mut items, self.sn);
        rlp::encode_bytes(&mut items, &self.body);
        let mut out = Vec::with_capacity(items.len() + 9);
        rlp::encode_list(&mut out, &items);
        out
    }

    /// Decodes a frame, requiring the canonical two-item list form.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut decoder = rlp::Decoder::new(buf);
        let mut items = decoder.list()?;
        let sn = items.uint()?;
        let body = items.bytes()?.to_vec();
        if !items.is_empty() || !decoder.is_empty() {
            return Err(Error::CodecMalformed);
        }
        Ok(Self { sn, body })
    }
}
