//! On-demand translation of persistent bridges into per-exit ephemeral
//! endpoints.
//!
//! A translation opens a control session to the bridge, asks it to bind a
//! fresh listener relaying to the given exit, and caches the resulting
//! `(host:port, cookie)` binding. Failures are cached too, with a short
//! TTL, so an unreachable bridge is not probed once per client request.

use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use crate::{crypto::Cookie, handshake, rlp};

/// How long a successful mapping stays served from cache.
const MAPPING_TTL: Duration = Duration::from_secs(30 * 60);
/// How long a failed lookup suppresses further probes of the same triple.
const NEGATIVE_TTL: Duration = Duration::from_secs(60);
/// Connect and overall deadlines for one translation round-trip.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// An ephemeral endpoint: the bridge host rebound to a fresh port, plus the
/// cookie the listener expects.
///
/// Unlike a persistent directory record this carries no registration
/// metadata; it is only valid for the exit it was requested for.
#[derive(Clone, Debug)]
pub struct EphemeralBridge {
    /// `ip:port` of the freshly bound listener.
    pub host: String,
    /// Cookie accepted by the listener.
    pub cookie: Cookie,
}

#[derive(Debug)]
struct Entry {
    mapping: Option<EphemeralBridge>,
    expires_at: Instant,
}

/// Cache of `(bridge host, cookie, exit) → EphemeralBridge` bindings.
///
/// One mutex guards the whole cache *including* the network round-trip on a
/// miss: concurrent requests for the same unreachable bridge collapse into
/// a single probe instead of a storm. Contention is negligible because
/// every miss costs a round-trip anyway.
#[derive(Debug, Default)]
pub struct EphemeralCache {
    inner: Mutex<HashMap<String, Entry>>,
}

impl EphemeralCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Translates a persistent bridge into an ephemeral per-exit endpoint,
    /// consulting the cache first.
    pub async fn translate(
        &self,
        bridge_host: &str,
        cookie: &Cookie,
        exit: &str,
    ) -> io::Result<EphemeralBridge> {
        let key = format!(
            "{}:{}:{}",
            bridge_host,
            cookie.to_hex(),
            exit
        );
        let mut cache = self.inner.lock().await;
        if let Some(entry) = cache.get(&key) {
            if entry.expires_at > Instant::now() {
                return entry
                    .mapping
                    .clone()
                    .ok_or_else(|| io::Error::other("mapping previously failed"));
            }
            cache.remove(&key);
        }

        // The listener is keyed by a requested cookie. The deployed fleet
        // sends a copy of the bridge's persistent cookie here, and exits may
        // validate against it, so this must stay in lockstep with them.
        let requested = cookie.clone();
        match request_mapping(bridge_host, cookie, exit, &requested).await {
            Ok(port) => {
                let host_only = bridge_host.split(':').next().unwrap_or(bridge_host);
                let mapping = EphemeralBridge {
                    host: format!("{}:{}", host_only, port),
                    cookie: requested,
                };
                cache.insert(
                    key,
                    Entry {
                        mapping: Some(mapping.clone()),
                        expires_at: Instant::now() + MAPPING_TTL,
                    },
                );
                Ok(mapping)
            }
            Err(e) => {
                debug!(bridge = bridge_host, exit, error = %e, "ephemeral mapping failed");
                cache.insert(
                    key,
                    Entry {
                        mapping: None,
                        expires_at: Instant::now() + NEGATIVE_TTL,
                    },
                );
                Err(e)
            }
        }
    }

    /// Evicts expired entries, both positive and negative.
    pub async fn sweep(&self) {
        let now = Instant::now();
        self.inner
            .lock()
            .await
            .retain(|_, entry| entry.expires_at > now);
    }
}

/// One control round-trip: handshake, `conn/e2e` request, port reply.
async fn request_mapping(
    bridge_host: &str,
    cookie: &Cookie,
    exit: &str,
    requested: &Cookie,
) -> io::Result<u16> {
    let conn = timeout(CONNECT_TIMEOUT, TcpStream::connect(bridge_host))
        .await
        .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;

    timeout(REQUEST_TIMEOUT, async {
        let mut session = handshake::client(cookie, conn).await?;
        let mut request = Vec::with_capacity(64);
        rlp::encode_bytes(&mut request, b"conn/e2e");
        rlp::encode_bytes(&mut request, exit.as_bytes());
        rlp::encode_bytes(&mut request, requested.as_bytes());
        tokio::io::AsyncWriteExt::write_all(&mut session, &request).await?;
        tokio::io::AsyncWriteExt::flush(&mut session).await?;

        let port = rlp::read_uint(&mut session).await?;
        u16::try_from(port).map_err(|_| io::Error::other("port out of range"))
    })
    .await
    .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))?
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::net::TcpListener;

    use super::*;
    use crate::handshake;

    /// Minimal bridge stand-in: accepts sessions, reads the three request
    /// values and replies with a fixed port.
    async fn spawn_fake_bridge(cookie: Cookie, port_reply: u64) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let conns = Arc::new(AtomicUsize::new(0));
        let conns_inner = conns.clone();
        tokio::spawn(async move {
            loop {
                let (conn, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                };
                conns_inner.fetch_add(1, Ordering::SeqCst);
                let cookie = cookie.clone();
                tokio::spawn(async move {
                    let mut session = handshake::server(&cookie, conn).await.unwrap();
                    let verb = rlp::read_bytes(&mut session).await.unwrap();
                    assert_eq!(verb, b"conn/e2e");
                    let _exit = rlp::read_bytes(&mut session).await.unwrap();
                    let requested = rlp::read_bytes(&mut session).await.unwrap();
                    assert_eq!(requested.len(), 32);
                    rlp::write_uint(&mut session, port_reply).await.unwrap();
                    tokio::io::AsyncWriteExt::flush(&mut session).await.unwrap();
                });
            }
        });
        (addr, conns)
    }

    #[tokio::test]
    async fn test_translate_and_cache_hit() {
        let cookie = Cookie::from([8u8; 32]);
        let (addr, conns) = spawn_fake_bridge(cookie.clone(), 4242).await;

        let cache = EphemeralCache::new();
        let first = cache
            .translate(&addr, &cookie, "exit-1.example.org")
            .await
            .unwrap();
        let host_only = addr.split(':').next().unwrap();
        assert_eq!(first.host, format!("{}:4242", host_only));
        assert_eq!(first.cookie, cookie);

        // Second lookup is served from cache without touching the network.
        let second = cache
            .translate(&addr, &cookie, "exit-1.example.org")
            .await
            .unwrap();
        assert_eq!(second.host, first.host);
        assert_eq!(conns.load(Ordering::SeqCst), 1);

        // A different exit is a different cache key.
        cache
            .translate(&addr, &cookie, "exit-2.example.org")
            .await
            .unwrap();
        assert_eq!(conns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_negative_cache_suppresses_probes() {
        let cookie = Cookie::from([9u8; 32]);
        // A listener that is immediately dropped: connections are refused.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let cache = EphemeralCache::new();
        assert!(cache.translate(&addr, &cookie, "exit").await.is_err());

        // The failure is cached; this fails fast without a fresh dial.
        let started = Instant::now();
        assert!(cache.translate(&addr, &cookie, "exit").await.is_err());
        assert!(started.elapsed() < CONNECT_TIMEOUT);
    }
}
