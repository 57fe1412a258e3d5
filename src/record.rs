//! Sans-I/O engine for the obfuscated record transport.
//!
//! A record on the wire is `MAC(16B) ‖ E(length: 2B) ‖ E(body)` where the
//! body is `realLen(2B) ‖ payload ‖ padding`. The length and body are
//! encrypted in sequence from one per-direction ChaCha20 keystream, the MAC
//! is computed over the ciphertext (encrypt-then-MAC), and the MAC key
//! ratchets forward after every record in each direction independently.
//!
//! [`RecordEngine`] is a deterministic state machine with no network I/O of
//! its own; it reads and writes through caller-supplied [`Read`]/[`Write`]
//! implementations so it can be driven from both blocking and asynchronous
//! code. The asynchronous wrapper lives in [`crate::stream`].

use std::io::{self, ErrorKind, Read, Write};

use chacha20::{
    cipher::{KeyIvInit, StreamCipher},
    ChaCha20,
};
use hmac::Mac;
use rand::{rngs::{OsRng, StdRng}, Rng, SeedableRng, TryRngCore};
use subtle::ConstantTimeEq;

use crate::{
    crypto::{hm, HmacSha256, SharedSecret},
    error::Error,
};

pub(crate) const TAG_LEN: usize = 16;
pub(crate) const LEN_LEN: usize = 2;
pub(crate) const HDR_LEN: usize = TAG_LEN + LEN_LEN;
pub(crate) const BODY_MAX_LEN: usize = 65535;
/// Two body bytes carry the real length, so one record holds at most this
/// much payload. Longer writes are split by the stream wrapper.
pub(crate) const PAYLOAD_MAX_LEN: usize = BODY_MAX_LEN - LEN_LEN;
/// Payloads above this size are sent without padding.
const PAD_PAYLOAD_CUTOFF: usize = 3000;
/// Padding length is drawn uniformly from `[0, PAD_MAX_LEN)`.
const PAD_MAX_LEN: usize = 512;

/// Per-direction cipher state: a ratcheting MAC key and an infinite
/// ChaCha20 keystream (zero nonce, position advancing with every byte).
struct DirectionCrypto {
    mac_key: [u8; 32],
    cipher: ChaCha20,
}

impl DirectionCrypto {
    fn new(direction_key: &[u8; 32]) -> Self {
        let crypt_key = hm(direction_key, b"crypt");
        Self {
            mac_key: hm(direction_key, b"mac"),
            cipher: ChaCha20::new(&crypt_key.into(), &[0u8; 12].into()),
        }
    }

    fn ratchet(&mut self) {
        self.mac_key = hm(&self.mac_key, b"");
    }
}

impl std::fmt::Debug for DirectionCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionCrypto").finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct RecordEncoder {
    crypto: DirectionCrypto,
    rng: StdRng,
}

impl RecordEncoder {
    fn new(direction_key: &[u8; 32]) -> Self {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .expect("system random source failure");
        Self {
            crypto: DirectionCrypto::new(direction_key),
            rng: StdRng::from_seed(seed),
        }
    }

    /// Seals `payload` into a complete wire record appended to `out`.
    fn seal(&mut self, payload: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
        if payload.len() > PAYLOAD_MAX_LEN {
            return Err(Error::OversizedPayload { len: payload.len() });
        }
        let pad_len = if payload.len() > PAD_PAYLOAD_CUTOFF {
            0
        } else {
            self.rng.random_range(0..PAD_MAX_LEN)
        };
        let body_len = LEN_LEN + payload.len() + pad_len;

        let start = out.len();
        out.reserve(TAG_LEN + LEN_LEN + body_len);
        out.extend_from_slice(&[0u8; TAG_LEN]);
        out.extend_from_slice(&(body_len as u16).to_be_bytes());
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        let pad_start = out.len();
        out.resize(pad_start + pad_len, 0);
        self.rng.fill(&mut out[pad_start..]);

        self.crypto.cipher.apply_keystream(&mut out[start + TAG_LEN..]);
        let tag = hm(&out[start + TAG_LEN..], &self.crypto.mac_key);
        self.crypto.ratchet();
        out[start..start + TAG_LEN].copy_from_slice(&tag[..TAG_LEN]);
        Ok(())
    }
}

#[derive(Debug)]
struct RecordDecoder {
    crypto: DirectionCrypto,
    pending_enc_len: [u8; LEN_LEN],
}

impl RecordDecoder {
    fn new(direction_key: &[u8; 32]) -> Self {
        Self {
            crypto: DirectionCrypto::new(direction_key),
            pending_enc_len: [0u8; LEN_LEN],
        }
    }

    /// Decrypts the length field, keeping the ciphertext for the MAC check.
    fn decrypt_len(&mut self, enc_len: [u8; LEN_LEN]) -> usize {
        self.pending_enc_len = enc_len;
        let mut plain = enc_len;
        self.crypto.cipher.apply_keystream(&mut plain);
        u16::from_be_bytes(plain) as usize
    }

    /// Verifies the MAC over the still-encrypted record, ratchets, decrypts
    /// the body in place and returns the payload range inside it.
    fn open_body(
        &mut self,
        mac: &[u8; TAG_LEN],
        body: &mut [u8],
    ) -> Result<std::ops::Range<usize>, Error> {
        let mut digest = HmacSha256::new_from_slice(&self.crypto.mac_key)
            .expect("HMAC accepts any key length");
        digest.update(&self.pending_enc_len);
        digest.update(body);
        let expected = digest.finalize().into_bytes();
        if !bool::from(expected[..TAG_LEN].ct_eq(mac)) {
            return Err(Error::MacMismatch);
        }
        self.crypto.ratchet();

        self.crypto.cipher.apply_keystream(body);
        if body.len() < LEN_LEN {
            return Err(Error::TruncatedBody { len: body.len() });
        }
        let real_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        if LEN_LEN + real_len > body.len() {
            return Err(Error::TruncatedBody { len: real_len });
        }
        Ok(LEN_LEN..LEN_LEN + real_len)
    }
}

#[derive(Debug, Eq, PartialEq)]
enum ReadState {
    ReadHeader {
        n: usize,
    },
    ReadBody {
        n: usize,
        total: usize,
    },
    PayloadReady {
        end: usize,
        off: usize,
    },
    Eof,
}

#[derive(Debug, Eq, PartialEq)]
enum WriteState {
    Wait,
    Write { n: usize, total: usize },
}

/// Decompose `io::Result<usize>`, keeping a positive byte count and
/// returning errors to the caller. `Ok(0)` means the underlying stream hit
/// EOF; mid-record that is a truncation, which the states handle themselves.
macro_rules! handle_io_result {
    ($io_result:expr, $on_eof:expr) => {
        match $io_result {
            Ok(n) if n > 0 => n,
            Ok(_) => return $on_eof,
            Err(e) => return Err(e),
        }
    };
}

/// Sans-I/O state machine for one obfuscated record session.
///
/// Created from the handshake's shared secret. The read half consumes wire
/// bytes through [`read_wire`] and exposes the current record's payload via
/// [`payload`]/[`consume`]; the write half seals one record at a time with
/// [`start_record`] and drains it with [`write_wire`].
///
/// All failures of the read half (MAC mismatch, truncated body, truncated
/// wire) are fatal: the engine stops and the connection should be dropped
/// without telling the peer why.
///
/// [`read_wire`]: RecordEngine::read_wire
/// [`payload`]: RecordEngine::payload
/// [`consume`]: RecordEngine::consume
/// [`start_record`]: RecordEngine::start_record
/// [`write_wire`]: RecordEngine::write_wire
#[derive(Debug)]
pub(crate) struct RecordEngine {
    read_state: ReadState,
    write_state: WriteState,
    decoder: RecordDecoder,
    encoder: RecordEncoder,
    header: [u8; HDR_LEN],
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

impl RecordEngine {
    /// Creates an engine from the handshake's shared secret.
    ///
    /// The server reads with the client-to-server direction key and writes
    /// with the other; the client is mirrored.
    pub(crate) fn new(ss: &SharedSecret, is_server: bool) -> Self {
        let c2s = hm(ss.as_bytes(), b"c2s");
        let c2c = hm(ss.as_bytes(), b"c2c");
        let (read_key, write_key) = if is_server { (c2s, c2c) } else { (c2c, c2s) };
        Self {
            read_state: ReadState::ReadHeader { n: 0 },
            write_state: WriteState::Wait,
            decoder: RecordDecoder::new(&read_key),
            encoder: RecordEncoder::new(&write_key),
            header: [0u8; HDR_LEN],
            read_buf: vec![0u8; BODY_MAX_LEN],
            write_buf: Vec::new(),
        }
    }

    /// Reads wire bytes until one full record has been verified and
    /// decrypted, returning how many bytes the record occupied.
    ///
    /// `Ok(0)` reports a clean EOF at a record boundary. EOF inside a record
    /// is a truncation and fails with `ErrorKind::UnexpectedEof`. Protocol
    /// failures come back as [`Error`] wrapped in an [`io::Error`]; after
    /// one, the engine only ever reports EOF.
    pub(crate) fn read_wire(&mut self, wire: &mut dyn Read) -> io::Result<usize> {
        loop {
            match self.read_state {
                ReadState::ReadHeader { n } if n < HDR_LEN => {
                    let read_n = match wire.read(&mut self.header[n..HDR_LEN]) {
                        Ok(read_n) if read_n > 0 => read_n,
                        Ok(_) if n == 0 => {
                            self.read_state = ReadState::Eof;
                            return Ok(0);
                        }
                        Ok(_) => {
                            self.read_state = ReadState::Eof;
                            return Err(ErrorKind::UnexpectedEof.into());
                        }
                        Err(e) => return Err(e),
                    };
                    self.read_state = ReadState::ReadHeader { n: n + read_n };
                }
                ReadState::ReadHeader { .. } => {
                    let enc_len = [self.header[TAG_LEN], self.header[TAG_LEN + 1]];
                    let total = self.decoder.decrypt_len(enc_len);
                    self.read_state = ReadState::ReadBody { n: 0, total };
                }
                ReadState::ReadBody { n, total } if n < total => {
                    let read_n = handle_io_result!(wire.read(&mut self.read_buf[n..total]), {
                        self.read_state = ReadState::Eof;
                        Err(ErrorKind::UnexpectedEof.into())
                    });
                    self.read_state = ReadState::ReadBody { n: n + read_n, total };
                }
                ReadState::ReadBody { total, .. } => {
                    let mac: [u8; TAG_LEN] = self.header[..TAG_LEN].try_into().unwrap();
                    match self.decoder.open_body(&mac, &mut self.read_buf[..total]) {
                        Ok(range) => {
                            self.read_state = ReadState::PayloadReady {
                                end: range.end,
                                off: range.start,
                            };
                            return Ok(HDR_LEN + total);
                        }
                        Err(e) => {
                            self.read_state = ReadState::Eof;
                            return Err(e.into());
                        }
                    }
                }
                ReadState::PayloadReady { .. } => {
                    self.read_state = ReadState::ReadHeader { n: 0 };
                }
                ReadState::Eof => return Ok(0),
            }
        }
    }

    /// Unconsumed payload of the current record.
    pub(crate) fn payload(&self) -> &[u8] {
        match self.read_state {
            ReadState::PayloadReady { end, off } => &self.read_buf[off..end],
            _ => &[],
        }
    }

    /// Consumes `amt` bytes of the current record's payload.
    pub(crate) fn consume(&mut self, amt: usize) {
        if let ReadState::PayloadReady { end, ref mut off } = self.read_state {
            *off = (*off + amt).min(end);
        }
    }

    /// True while the engine has committed to a record length and is
    /// waiting for body bytes. This is the window the stream wrapper guards
    /// with a short deadline.
    pub(crate) fn reading_body(&self) -> bool {
        matches!(self.read_state, ReadState::ReadBody { .. })
    }

    /// True when no sealed record is waiting to be drained.
    pub(crate) fn is_write_idle(&self) -> bool {
        self.write_state == WriteState::Wait
    }

    /// Seals `payload` into the outgoing buffer as one record.
    ///
    /// The previous record must have been fully drained with
    /// [`write_wire`](RecordEngine::write_wire) first.
    pub(crate) fn start_record(&mut self, payload: &[u8]) -> Result<(), Error> {
        debug_assert!(self.is_write_idle(), "previous record not yet drained");
        self.write_buf.clear();
        self.encoder.seal(payload, &mut self.write_buf)?;
        self.write_state = WriteState::Write {
            n: 0,
            total: self.write_buf.len(),
        };
        Ok(())
    }

    /// Writes the sealed record to the wire, returning its full length once
    /// everything has been written. `Ok(0)` reports EOF on the wire.
    pub(crate) fn write_wire(&mut self, wire: &mut dyn Write) -> io::Result<usize> {
        loop {
            match self.write_state {
                WriteState::Wait => return Ok(0),
                WriteState::Write { n, total } if n < total => {
                    let write_n =
                        handle_io_result!(wire.write(&self.write_buf[n..total]), Ok(0));
                    self.write_state = WriteState::Write { n: n + write_n, total };
                }
                WriteState::Write { total, .. } => {
                    self.write_state = WriteState::Wait;
                    return Ok(total);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::MockStream;

    fn engine_pair() -> (RecordEngine, RecordEngine) {
        let ss = SharedSecret::from([0u8; 32]);
        (RecordEngine::new(&ss, false), RecordEngine::new(&ss, true))
    }

    fn send(engine: &mut RecordEngine, stream: &mut MockStream, payload: &[u8]) {
        engine.start_record(payload).unwrap();
        engine.write_wire(stream).unwrap();
    }

    fn recv(engine: &mut RecordEngine, stream: &mut MockStream) -> io::Result<Vec<u8>> {
        engine.read_wire(stream)?;
        let payload = engine.payload().to_vec();
        engine.consume(payload.len());
        Ok(payload)
    }

    #[test]
    fn test_echo_roundtrip() {
        let mut stream = MockStream::default();
        let (mut client, mut server) = engine_pair();

        for len in [0usize, 1, 5, 100, 3000, 3001, 40000, PAYLOAD_MAX_LEN] {
            let payload = vec![0xabu8; len];
            send(&mut client, &mut stream, &payload);
            assert_eq!(recv(&mut server, &mut stream).unwrap(), payload);

            send(&mut server, &mut stream, &payload);
            assert_eq!(recv(&mut client, &mut stream).unwrap(), payload);
        }
    }

    #[test]
    fn test_wire_overhead_has_padding_headroom() {
        let mut stream = MockStream::default();
        let (mut client, _server) = engine_pair();

        send(&mut client, &mut stream, b"hello");
        let wire_len = stream.buf.len();
        // MAC + length + realLen + payload, plus up to 511 bytes of padding.
        assert!(wire_len >= TAG_LEN + LEN_LEN + LEN_LEN + 5);
        assert!(wire_len < TAG_LEN + LEN_LEN + LEN_LEN + 5 + PAD_MAX_LEN);

        // Large payloads go out unpadded.
        let mut stream = MockStream::default();
        let (mut client, _server) = engine_pair();
        send(&mut client, &mut stream, &vec![0u8; 4000]);
        assert_eq!(stream.buf.len(), TAG_LEN + LEN_LEN + LEN_LEN + 4000);
    }

    #[test]
    fn test_tampering_is_fatal_everywhere() {
        // Flip one byte in the MAC, the encrypted length and the body of the
        // second record; the receiver must reject it (a corrupted length may
        // surface as a truncation instead of a MAC failure) and deliver
        // nothing afterwards.
        let mut probe = MockStream::default();
        let (mut sender, _) = engine_pair();
        send(&mut sender, &mut probe, b"first");
        let first_len = probe.buf.len();
        send(&mut sender, &mut probe, b"second");
        let second_len = probe.buf.len() - first_len;

        for pos in [0, TAG_LEN, TAG_LEN + 1, HDR_LEN, second_len - 1] {
            let mut stream = MockStream::default();
            let (mut client, mut server) = engine_pair();
            send(&mut client, &mut stream, b"first");
            let first_len = stream.buf.len();
            send(&mut client, &mut stream, b"second");
            stream.buf[first_len + pos] ^= 0x01;
            stream.eof_after_buf = true;

            assert_eq!(recv(&mut server, &mut stream).unwrap(), b"first");
            assert!(recv(&mut server, &mut stream).is_err(), "position {}", pos);

            // The engine stays dead afterwards.
            assert_eq!(server.read_wire(&mut stream).unwrap(), 0);
        }
    }

    #[test]
    fn test_dropped_record_desyncs_ratchet() {
        let mut stream = MockStream::default();
        let (mut client, mut server) = engine_pair();

        send(&mut client, &mut stream, b"first");
        let first_len = stream.buf.len();
        send(&mut client, &mut stream, b"second");

        // Drop the first record entirely. The second is read against the
        // wrong keystream position and ratchet state; depending on what the
        // garbled length decodes to this surfaces as a MAC failure or a
        // truncation, but never as data.
        stream.buf.drain(..first_len);
        stream.eof_after_buf = true;
        assert!(recv(&mut server, &mut stream).is_err());
        assert_eq!(server.read_wire(&mut stream).unwrap(), 0);
    }

    #[test]
    fn test_directions_are_independent() {
        let mut c2s = MockStream::default();
        let mut s2c = MockStream::default();
        let (mut client, mut server) = engine_pair();

        // Interleave writes in both directions; each direction ratchets on
        // its own.
        for i in 0..10u8 {
            send(&mut client, &mut c2s, &[i; 10]);
            send(&mut server, &mut s2c, &[i; 20]);
        }
        for i in 0..10u8 {
            assert_eq!(recv(&mut server, &mut c2s).unwrap(), vec![i; 10]);
            assert_eq!(recv(&mut client, &mut s2c).unwrap(), vec![i; 20]);
        }
    }

    #[test]
    fn test_oversized_payload_refused() {
        let (mut client, _server) = engine_pair();
        assert_eq!(
            client.start_record(&vec![0u8; PAYLOAD_MAX_LEN + 1]),
            Err(Error::OversizedPayload {
                len: PAYLOAD_MAX_LEN + 1
            })
        );
    }

    #[test]
    fn test_truncated_wire_is_unexpected_eof() {
        let mut stream = MockStream::default();
        let (mut client, mut server) = engine_pair();
        send(&mut client, &mut stream, b"hello");
        stream.buf.truncate(stream.buf.len() - 3);
        stream.eof_after_buf = true;

        let err = recv(&mut server, &mut stream).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_clean_eof_at_record_boundary() {
        let mut stream = MockStream::default();
        let (mut client, mut server) = engine_pair();
        send(&mut client, &mut stream, b"hello");
        stream.eof_after_buf = true;

        assert_eq!(recv(&mut server, &mut stream).unwrap(), b"hello");
        assert_eq!(server.read_wire(&mut stream).unwrap(), 0);
    }
}
