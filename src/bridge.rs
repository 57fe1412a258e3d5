//! Bridge daemon session plane.
//!
//! Every accepted connection gets its own task: a random 5–15 second
//! deadline covers the handshake (connections that never authenticate are
//! shed quickly and at an unpredictable moment), then the session serves
//! control verbs for up to 24 hours:
//!
//! * `"ping"`: liveness echo for the directory's probe;
//! * `"conn" ‖ exit`: bidirectional relay to the exit's TCP relay port,
//!   subject to the speed limiter;
//! * `"conn/e2e" ‖ exit ‖ cookie`: bind an ephemeral tunnel listener for
//!   the exit and reply with its port.
//!
//! Unknown verbs, invalid exits and refused features all end the session
//! without an answer.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    crypto::Cookie,
    error::Error,
    handshake,
    relay::{self, WorkerPool},
    rlp,
    stream::RelayStream,
};

/// Data sessions are cut after this horizon regardless of activity.
const KEEPALIVE_HORIZON: Duration = Duration::from_secs(24 * 60 * 60);
/// Connect budget when dialing an exit.
const EXIT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
/// Token-bucket burst, in bytes.
const SPEED_BURST: f64 = 1_000_000.0;

/// Runtime settings for the session plane.
#[derive(Debug)]
pub struct BridgeConfig {
    /// The bridge's announce cookie.
    pub cookie: Cookie,
    /// Exits must match this to be dialed.
    pub exit_regex: Regex,
    /// Refuse `"conn/e2e"` listener requests.
    pub no_legacy_udp: bool,
    /// Port exits accept plain relays on.
    pub exit_relay_port: u16,
    /// Port exits accept tunnel datagrams on.
    pub exit_e2e_port: u16,
}

/// Byte-rate token bucket shared by every relayed session.
#[derive(Debug)]
pub struct SpeedLimiter {
    bucket: Option<tokio::sync::Mutex<BucketState>>,
    rate: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: tokio::time::Instant,
}

impl SpeedLimiter {
    /// Creates a limiter for `kb_per_sec` kilobytes per second; zero or
    /// negative disables limiting (the CLI's `-1`).
    pub fn new(kb_per_sec: i64) -> Self {
        if kb_per_sec <= 0 {
            return Self {
                bucket: None,
                rate: 0.0,
            };
        }
        Self {
            bucket: Some(tokio::sync::Mutex::new(BucketState {
                tokens: SPEED_BURST,
                last: tokio::time::Instant::now(),
            })),
            rate: (kb_per_sec * 1024) as f64,
        }
    }

    /// Waits until `n` bytes fit under the configured rate.
    pub async fn throttle(&self, n: usize) {
        let Some(bucket) = &self.bucket else { return };
        loop {
            let wait = {
                let mut state = bucket.lock().await;
                let now = tokio::time::Instant::now();
                let elapsed = (now - state.last).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(SPEED_BURST);
                state.last = now;
                if state.tokens >= n as f64 {
                    state.tokens -= n as f64;
                    return;
                }
                Duration::from_secs_f64((n as f64 - state.tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Accept loop of the bridge daemon. Never returns in steady state.
pub async fn run(
    listener: TcpListener,
    cfg: Arc<BridgeConfig>,
    pool: Arc<WorkerPool>,
    limiter: Arc<SpeedLimiter>,
) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "relay listener up");
    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "cannot accept");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let cfg = cfg.clone();
        let pool = pool.clone();
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let delay = rand::rng().random_range(5..15);
            let session = match timeout(
                Duration::from_secs(delay),
                handshake::server(&cfg.cookie, conn),
            )
            .await
            {
                Ok(Ok(session)) => session,
                Ok(Err(e)) => {
                    debug!(%peer, error = %e, "handshake failed");
                    return;
                }
                Err(_) => {
                    debug!(%peer, "handshake timed out");
                    return;
                }
            };
            let _ = timeout(KEEPALIVE_HORIZON, handle_session(session, &cfg, pool, limiter))
                .await;
        });
    }
}

/// Serves control verbs on an authenticated session until it ends.
pub async fn handle_session<IO>(
    mut session: RelayStream<IO>,
    cfg: &BridgeConfig,
    pool: Arc<WorkerPool>,
    limiter: Arc<SpeedLimiter>,
) -> io::Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let verb = match rlp::read_bytes(&mut session).await {
            Ok(verb) => verb,
            Err(_) => return Ok(()),
        };
        match verb.as_slice() {
            b"ping" => {
                rlp::write_bytes(&mut session, b"ping").await?;
                session.flush().await?;
            }
            b"conn" => {
                let exit = read_exit(&mut session, cfg).await?;
                let Some(exit) = exit else { return Ok(()) };
                let exit_conn = match timeout(
                    EXIT_CONNECT_TIMEOUT,
                    TcpStream::connect((exit.as_str(), cfg.exit_relay_port)),
                )
                .await
                {
                    Ok(Ok(conn)) => conn,
                    Ok(Err(e)) => {
                        debug!(%exit, error = %e, "exit dial failed");
                        return Ok(());
                    }
                    Err(_) => {
                        debug!(%exit, "exit dial timed out");
                        return Ok(());
                    }
                };
                return pump_with_limit(session, exit_conn, limiter).await;
            }
            b"conn/e2e" => {
                let exit = read_exit(&mut session, cfg).await?;
                let requested = rlp::read_bytes(&mut session).await?;
                let Some(exit) = exit else { return Ok(()) };
                if cfg.no_legacy_udp {
                    debug!(%exit, "refusing e2e listener request");
                    return Ok(());
                }
                let requested: [u8; 32] = requested
                    .try_into()
                    .map_err(|_| io::Error::from(Error::CodecMalformed))?;
                let exit_addr = format!("{}:{}", exit, cfg.exit_e2e_port);
                let port = relay::spawn_ephemeral_listener(
                    exit_addr,
                    Cookie::from(requested),
                    pool.clone(),
                )
                .await?;
                rlp::write_uint(&mut session, u64::from(port)).await?;
                session.flush().await?;
            }
            _ => return Ok(()),
        }
    }
}

/// Reads and validates an exit name; `None` means the session should end.
async fn read_exit<IO>(
    session: &mut RelayStream<IO>,
    cfg: &BridgeConfig,
) -> io::Result<Option<String>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let raw = rlp::read_bytes(session).await?;
    let Ok(exit) = String::from_utf8(raw) else {
        return Ok(None);
    };
    if !cfg.exit_regex.is_match(&exit) {
        warn!(%exit, "exit rejected by regex");
        return Ok(None);
    }
    Ok(Some(exit))
}

/// Bidirectional copy between a session and an exit connection, charging
/// every chunk against the speed limiter.
async fn pump_with_limit<A, B>(a: A, b: B, limiter: Arc<SpeedLimiter>) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (a_rx, a_tx) = tokio::io::split(a);
    let (b_rx, b_tx) = tokio::io::split(b);
    let mut up = tokio::spawn(copy_limited(a_rx, b_tx, limiter.clone()));
    let mut down = tokio::spawn(copy_limited(b_rx, a_tx, limiter));
    tokio::select! {
        _ = &mut up => down.abort(),
        _ = &mut down => up.abort(),
    }
    Ok(())
}

async fn copy_limited<R, W>(mut reader: R, mut writer: W, limiter: Arc<SpeedLimiter>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16384];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        limiter.throttle(n).await;
        if writer.write_all(&buf[..n]).await.is_err() || writer.flush().await.is_err() {
            return;
        }
    }
}
