//! Cookie handshake bootstrapping both the record transport and the
//! end-to-end tunnel.
//!
//! Each party proves knowledge of the shared 32-byte cookie by sealing its
//! X25519 public key under a *nowcookie*, an HMAC of the cookie keyed by the
//! current 30-second time bucket. The receiver sweeps a window of bucket
//! offsets, so clocks may disagree by up to ±15 minutes. The envelope is:
//!
//! ```text
//! Hello = Nonce(32B) ‖ EncPK(48B) ‖ Padding(0..999B)
//! EncPK = XChaCha20-Poly1305(key = HMAC(nowcookie, Nonce), nonce = 0, pk)
//! ```
//!
//! Padding randomises the on-wire hello length. Its length is derived from
//! the nowcookie and nonce, so a receiver that opened `EncPK` knows exactly
//! how many trailing bytes to drain from a stream; to an observer without
//! the cookie the length is uniform.
//!
//! The server never generates per-connection state before a valid hello:
//! its secret key is derived deterministically from the client's public key
//! and a process-wide master secret.

use chacha20poly1305::aead::Aead;
use rand::{rngs::OsRng, TryRngCore};
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{
    crypto::{aead, hm, Cookie, SharedSecret, ZERO_NONCE},
    error::Error,
    stream::RelayStream,
    tunnel::Tunnel,
    MASTER_SECRET,
};

pub(crate) const HELLO_NONCE_LEN: usize = 32;
pub(crate) const HELLO_ENC_PK_LEN: usize = 48;
/// Fixed-size part of a hello; padding follows.
pub(crate) const HELLO_LEN: usize = HELLO_NONCE_LEN + HELLO_ENC_PK_LEN;
/// Padding length is uniform in `[0, HELLO_PAD_BOUND)`.
const HELLO_PAD_BOUND: usize = 1000;
/// Nowcookie buckets are this many seconds wide.
const BUCKET_SECS: i64 = 30;
/// Bucket offsets swept by the receiver: `[-SWEEP, SWEEP)`.
const SWEEP: i64 = 30;

fn bucket_now() -> i64 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("SystemTime before UNIX EPOCH")
        .as_secs() as i64;
    unix / BUCKET_SECS
}

/// Padding length for a hello sealed under `nowcookie` with `nonce`.
fn derive_pad_len(nowcookie: &[u8; 32], nonce: &[u8; HELLO_NONCE_LEN]) -> usize {
    let mut key = [0u8; HELLO_NONCE_LEN + 3];
    key[..HELLO_NONCE_LEN].copy_from_slice(nonce);
    key[HELLO_NONCE_LEN..].copy_from_slice(b"pad");
    let digest = hm(nowcookie, &key);
    u16::from_be_bytes([digest[0], digest[1]]) as usize % HELLO_PAD_BOUND
}

fn seal_hello_at(cookie: &Cookie, pk: &[u8; 32], bucket: i64) -> Vec<u8> {
    let mut nonce = [0u8; HELLO_NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce)
        .expect("system random source failure");
    let nowcookie = cookie.now_cookie(bucket);
    let key = hm(&nowcookie, &nonce);
    let sealed = aead(&key)
        .encrypt(&ZERO_NONCE.into(), pk.as_ref())
        .expect("sealing a 32-byte key cannot fail");
    debug_assert_eq!(sealed.len(), HELLO_ENC_PK_LEN);

    let pad_len = derive_pad_len(&nowcookie, &nonce);
    let mut out = Vec::with_capacity(HELLO_LEN + pad_len);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    let pad_start = out.len();
    out.resize(pad_start + pad_len, 0);
    OsRng
        .try_fill_bytes(&mut out[pad_start..])
        .expect("system random source failure");
    out
}

fn seal_hello(cookie: &Cookie, pk: &[u8; 32]) -> Vec<u8> {
    seal_hello_at(cookie, pk, bucket_now())
}

/// Tries every nowcookie in the sweep window against the hello's sealed
/// public key. Returns the peer's key and the padding length to drain.
fn open_hello(
    cookie: &Cookie,
    hello: &[u8; HELLO_LEN],
) -> Result<([u8; 32], usize), Error> {
    let nonce: [u8; HELLO_NONCE_LEN] = hello[..HELLO_NONCE_LEN].try_into().unwrap();
    let enc_pk = &hello[HELLO_NONCE_LEN..];
    let now = bucket_now();
    for i in -SWEEP..SWEEP {
        let nowcookie = cookie.now_cookie(now + i);
        let key = hm(&nowcookie, &nonce);
        if let Ok(pk) = aead(&key).decrypt(&ZERO_NONCE.into(), enc_pk) {
            let pk: [u8; 32] = pk.try_into().expect("sealed key is always 32 bytes");
            return Ok((pk, derive_pad_len(&nowcookie, &nonce)));
        }
    }
    Err(Error::NoValidCookie)
}

async fn read_hello<IO>(cookie: &Cookie, io: &mut IO) -> io::Result<[u8; 32]>
where
    IO: AsyncRead + Unpin,
{
    let mut hello = [0u8; HELLO_LEN];
    io.read_exact(&mut hello).await?;
    let (their_pk, pad_len) = open_hello(cookie, &hello)?;
    let mut pad = [0u8; HELLO_PAD_BOUND];
    io.read_exact(&mut pad[..pad_len]).await?;
    Ok(their_pk)
}

/// Performs the client side of the handshake over `io` and wraps the
/// connection into a [`RelayStream`].
///
/// The caller is responsible for an overall deadline; a stalled peer will
/// otherwise hold the future open indefinitely.
pub async fn client<IO>(cookie: &Cookie, mut io: IO) -> io::Result<RelayStream<IO>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let sk = StaticSecret::random();
    let pk = PublicKey::from(&sk);
    io.write_all(&seal_hello(cookie, pk.as_bytes())).await?;

    let their_pk = read_hello(cookie, &mut io).await?;
    let shared = sk.diffie_hellman(&PublicKey::from(their_pk));
    Ok(RelayStream::new(
        io,
        SharedSecret::from(shared.to_bytes()),
        false,
    ))
}

/// Performs the server side of the handshake over `io` and wraps the
/// connection into a [`RelayStream`].
///
/// The server's key pair is a deterministic function of the client's public
/// key and the process master secret, so nothing is allocated for a
/// connection that never presents a valid hello.
pub async fn server<IO>(cookie: &Cookie, mut io: IO) -> io::Result<RelayStream<IO>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let their_pk = read_hello(cookie, &mut io).await?;

    let sk = MASTER_SECRET.derive_static_secret(&their_pk);
    let pk = PublicKey::from(&sk);
    io.write_all(&seal_hello(cookie, pk.as_bytes())).await?;

    let shared = sk.diffie_hellman(&PublicKey::from(their_pk));
    Ok(RelayStream::new(
        io,
        SharedSecret::from(shared.to_bytes()),
        true,
    ))
}

/// Datagram-mode handshake used to bootstrap an end-to-end [`Tunnel`].
///
/// Hellos travel as opaque packets through whatever carries them (typically
/// relay sessions through a bridge); padding is framed by the packet
/// boundary, so trailing bytes are ignored rather than drained.
pub struct TunnelHandshake {
    cookie: Cookie,
    sk: StaticSecret,
}

impl TunnelHandshake {
    /// Creates a handshake for one tunnel attempt.
    pub fn new(cookie: Cookie) -> Self {
        Self {
            cookie,
            sk: StaticSecret::random(),
        }
    }

    /// The hello packet announcing this endpoint's sealed public key.
    ///
    /// The responder calls this only after [`realize`](Self::realize), at
    /// which point the key pair has been re-derived deterministically.
    pub fn hello(&self) -> Vec<u8> {
        seal_hello(&self.cookie, PublicKey::from(&self.sk).as_bytes())
    }

    /// Opens the peer's hello and derives the tunnel state.
    ///
    /// On the responder (`is_server`) the local secret key is replaced by
    /// the deterministic one derived from the peer's public key before the
    /// shared secret is computed.
    pub fn realize(
        &mut self,
        response: &[u8],
        is_server: bool,
        replay_protection: bool,
    ) -> Result<Tunnel, Error> {
        if response.len() < HELLO_LEN {
            return Err(Error::HelloTooShort {
                len: response.len(),
            });
        }
        let hello: &[u8; HELLO_LEN] = response[..HELLO_LEN].try_into().unwrap();
        let (their_pk, _pad_len) = open_hello(&self.cookie, hello)?;

        if is_server {
            self.sk = MASTER_SECRET.derive_static_secret(&their_pk);
        }
        let shared = self.sk.diffie_hellman(&PublicKey::from(their_pk));
        Ok(Tunnel::new(
            &SharedSecret::from(shared.to_bytes()),
            is_server,
            replay_protection,
        ))
    }
}

impl std::fmt::Debug for TunnelHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandshake").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hello_roundtrip() {
        let cookie = Cookie::from([1u8; 32]);
        let pk = [42u8; 32];
        let hello = seal_hello(&cookie, &pk);
        assert!(hello.len() >= HELLO_LEN);
        assert!(hello.len() < HELLO_LEN + 1000);

        let fixed: &[u8; HELLO_LEN] = hello[..HELLO_LEN].try_into().unwrap();
        let (opened, pad_len) = open_hello(&cookie, fixed).unwrap();
        assert_eq!(opened, pk);
        assert_eq!(pad_len, hello.len() - HELLO_LEN);
    }

    #[test]
    fn test_wrong_cookie_rejected() {
        let hello = seal_hello(&Cookie::from([1u8; 32]), &[42u8; 32]);
        let fixed: &[u8; HELLO_LEN] = hello[..HELLO_LEN].try_into().unwrap();
        assert_eq!(
            open_hello(&Cookie::from([2u8; 32]), fixed),
            Err(Error::NoValidCookie)
        );
    }

    #[test]
    fn test_skew_window_boundaries() {
        let cookie = Cookie::from([3u8; 32]);
        let pk = [9u8; 32];
        let now = bucket_now();

        for (offset, accepted) in [(-30, true), (-31, false), (29, true), (30, false)] {
            let hello = seal_hello_at(&cookie, &pk, now + offset);
            let fixed: &[u8; HELLO_LEN] = hello[..HELLO_LEN].try_into().unwrap();
            assert_eq!(
                open_hello(&cookie, fixed).is_ok(),
                accepted,
                "bucket offset {}",
                offset
            );
        }
    }

    #[test]
    fn test_tunnel_handshake_agrees() {
        let cookie = Cookie::from([7u8; 32]);
        let mut client = TunnelHandshake::new(cookie.clone());
        let mut server = TunnelHandshake::new(cookie);

        let client_hello = client.hello();
        let mut server_tun = server.realize(&client_hello, true, true).unwrap();
        let server_hello = server.hello();
        let mut client_tun = client.realize(&server_hello, false, true).unwrap();

        let up = client_tun.seal_frame(b"up the tunnel");
        let frame = server_tun.open_frame(&up).unwrap();
        assert_eq!(frame.body, b"up the tunnel");

        let dn = server_tun.seal_frame(b"and back down");
        let frame = client_tun.open_frame(&dn).unwrap();
        assert_eq!(frame.body, b"and back down");
    }

    #[test]
    fn test_tunnel_handshake_rejects_short_hello() {
        let mut hs = TunnelHandshake::new(Cookie::from([7u8; 32]));
        assert!(matches!(
            hs.realize(&[0u8; 40], false, false),
            Err(Error::HelloTooShort { len: 40 })
        ));
    }

    #[tokio::test]
    async fn test_stream_handshake_over_duplex() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let cookie = Cookie::from([5u8; 32]);
        let (a, b) = tokio::io::duplex(65536);

        let server_cookie = cookie.clone();
        let server_task = tokio::spawn(async move {
            let mut stream = server(&server_cookie, b).await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            stream.write_all(b"world").await.unwrap();
            stream.flush().await.unwrap();
        });

        let mut stream = client(&cookie, a).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_handshake_wrong_cookie_fails() {
        let (a, b) = tokio::io::duplex(65536);

        let server_task =
            tokio::spawn(async move { server(&Cookie::from([1u8; 32]), b).await.map(|_| ()) });

        // The server fails to open the hello and drops the connection; the
        // client then sees either the cookie error (if it raced to a hello
        // of its own) or EOF.
        let client_res = client(&Cookie::from([2u8; 32]), a).await.map(|_| ());
        assert!(client_res.is_err());
        assert!(server_task.await.unwrap().is_err());
    }
}
