//! Veilwire is the obfuscated transport core of a censorship-circumvention
//! relay network: a cookie-authenticated wire protocol that lets clients
//! reach bridge relays unobserved, plus the bridge- and directory-side
//! machinery that keeps the fleet alive.
//!
//! ## Components
//!
//! * **Record transport**: [`RelayStream`] frames a reliable byte stream
//!   into MAC-chained, length-encrypted, padded records. To a passive
//!   observer the stream is indistinguishable from random bytes, and an
//!   active probe dies on its first MAC check. The protocol logic is a
//!   sans-I/O state machine driven by a thin tokio wrapper.
//!
//! * **Cookie handshake**: the [`handshake`] module bootstraps a session
//!   from a 32-byte out-of-band cookie: each side seals its X25519 public
//!   key under a time-bucketed HMAC of the cookie, tolerating ±15 minutes
//!   of clock skew. Servers derive their key pair deterministically from
//!   the client's, so an unauthenticated connection costs them no state.
//!
//! * **End-to-end tunnel**: [`Tunnel`] layers AEAD datagrams with replay
//!   protection between a client and an exit; bridges forward the packets
//!   without ever holding the inner keys.
//!
//! * **Bridge directory**: [`directory::BridgeDirectory`] is an in-memory
//!   TTL registry with authenticated adds, liveness probing and randomized
//!   diversity-aware sampling, fronted by the binder daemon's HTTP surface.
//!
//! * **Ephemeral mapping**: [`ephemeral::EphemeralCache`] translates
//!   long-lived bridges into short-lived per-exit endpoints by asking the
//!   bridge to bind a fresh relay listener.
//!
//! ## Quick start
//!
//! A client reaches a bridge it knows a cookie for:
//!
//! ```no_run
//! use veilwire::{handshake, Cookie};
//! use tokio::io::AsyncWriteExt;
//! use tokio::net::TcpStream;
//!
//! # async fn run() -> std::io::Result<()> {
//! let cookie = Cookie::from([0u8; 32]); // from the directory, really
//! let conn = TcpStream::connect("203.0.113.7:2086").await?;
//! let mut session = handshake::client(&cookie, conn).await?;
//! session.write_all(b"...").await?;
//! # Ok(())
//! # }
//! ```
//!
//! The two daemons (`veilwire-bridge`, `veilwire-binder`) wire these
//! pieces together; see their `--help` output.
#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![forbid(unsafe_code)]

pub mod binder;
pub mod bridge;
pub mod directory;
pub mod ephemeral;
pub mod error;
pub mod handshake;
pub mod pool;
pub mod relay;
pub mod rlp;
pub mod tunnel;

mod crypto;
mod record;
mod replay;
mod stream;

pub use crypto::Cookie;
pub use error::Error;
pub use handshake::TunnelHandshake;
pub use stream::RelayStream;
pub use tunnel::{Tunnel, TunnelFrame};

use std::sync::LazyLock;

use crypto::MasterSecret;
use pool::BufferPool;

/// Process-wide secret for the server-side deterministic handshake keygen.
///
/// Initialised from system entropy at first use and never rotated within a
/// process; reads are lock-free after initialisation.
static MASTER_SECRET: LazyLock<MasterSecret> = LazyLock::new(MasterSecret::from_entropy);

/// Slab pool shared by all packet-forwarding tasks.
static BUFFER_POOL: LazyLock<BufferPool> = LazyLock::new(BufferPool::new);

#[cfg(test)]
mod test {
    use std::io::{self, ErrorKind, Read, Write};

    /// In-memory stream for driving the sans-I/O engine in tests.
    ///
    /// Reads drain the buffer; an empty buffer reports `WouldBlock`, or EOF
    /// once `eof_after_buf` is set.
    #[derive(Debug, Default)]
    pub(crate) struct MockStream {
        pub(crate) buf: Vec<u8>,
        pub(crate) eof_after_buf: bool,
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.buf.is_empty() {
                if self.eof_after_buf {
                    return Ok(0);
                }
                return Err(io::Error::new(ErrorKind::WouldBlock, "empty buffer"));
            }
            let n = core::cmp::min(buf.len(), self.buf.len());
            buf[..n].copy_from_slice(&self.buf[..n]);
            self.buf.drain(..n);
            Ok(n)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buf.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
