//! Bridge-side forwarding plane for end-to-end tunnels.
//!
//! A bridge asked for an ephemeral endpoint binds a fresh listener that
//! accepts obfuscated sessions under the requested cookie and shuttles
//! opaque tunnel frames to the exit's e2e port over UDP. Per-packet work
//! runs on a fixed worker pool behind a bounded queue; when the queue is
//! full the packet is dropped, trading burst loss for bounded memory
//! (tunnel traffic tolerates loss by design).

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    crypto::Cookie,
    handshake,
    pool::SLAB_SIZE,
    rlp,
    stream::RelayStream,
    BUFFER_POOL,
};

/// Queue capacity in front of the worker pool.
const WORKER_QUEUE_CAP: usize = 1000;
/// An ephemeral listener lives as long as the directory caches its mapping.
const LISTENER_LIFETIME: Duration = Duration::from_secs(30 * 60);

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Fixed pool of forwarding workers behind a bounded queue.
///
/// Sized to the machine's parallelism by the daemon. Submission never
/// blocks: a full queue drops the job and bumps a counter.
#[derive(Debug)]
pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    dropped: AtomicU64,
}

impl WorkerPool {
    /// Spawns `workers` tasks consuming the shared queue.
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(WORKER_QUEUE_CAP);
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => job.await,
                        None => break,
                    }
                }
            });
        }
        Self {
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueues per-packet work, dropping it if the queue is full.
    pub fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tx.try_send(Box::pin(job)).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 1000 == 1 {
                warn!(dropped, "forwarding queue full, dropping packets");
            }
        }
    }

    /// Number of jobs dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Binds a fresh TCP listener that relays tunnel frames between sessions
/// keyed by `cookie` and `exit_addr`, returning the bound port.
///
/// The listener shuts itself down after [`LISTENER_LIFETIME`], matching the
/// directory's mapping TTL.
pub async fn spawn_ephemeral_listener(
    exit_addr: String,
    cookie: Cookie,
    pool: Arc<WorkerPool>,
) -> io::Result<u16> {
    let listener = TcpListener::bind("0.0.0.0:0").await?;
    let port = listener.local_addr()?.port();
    info!(port, exit = %exit_addr, "ephemeral listener up");

    tokio::spawn(async move {
        let lifetime = tokio::time::sleep(LISTENER_LIFETIME);
        tokio::pin!(lifetime);
        loop {
            tokio::select! {
                _ = &mut lifetime => {
                    debug!(port, "ephemeral listener expired");
                    break;
                }
                accepted = listener.accept() => {
                    let Ok((conn, peer)) = accepted else { break };
                    let cookie = cookie.clone();
                    let exit_addr = exit_addr.clone();
                    let pool = pool.clone();
                    tokio::spawn(async move {
                        let delay = rand::rng().random_range(5..15);
                        let session = match timeout(
                            Duration::from_secs(delay),
                            handshake::server(&cookie, conn),
                        )
                        .await
                        {
                            Ok(Ok(session)) => session,
                            Ok(Err(e)) => {
                                debug!(%peer, error = %e, "ephemeral handshake failed");
                                return;
                            }
                            Err(_) => {
                                debug!(%peer, "ephemeral handshake timed out");
                                return;
                            }
                        };
                        if let Err(e) = forward_session(session, &exit_addr, pool).await {
                            debug!(%peer, error = %e, "ephemeral session ended");
                        }
                    });
                }
            }
        }
    });
    Ok(port)
}

/// Shuttles frames between one client session and the exit over UDP.
///
/// Client-to-exit datagrams go through the worker pool; exit-to-client
/// datagrams are read into pooled buffers and written back as frames.
async fn forward_session(
    session: RelayStream<TcpStream>,
    exit_addr: &str,
    pool: Arc<WorkerPool>,
) -> io::Result<()> {
    let udp = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
    udp.connect(exit_addr).await?;
    let (mut session_rx, mut session_tx) = tokio::io::split(session);

    let udp_rx = udp.clone();
    let downstream = tokio::spawn(async move {
        loop {
            let mut buf = BUFFER_POOL.alloc(SLAB_SIZE);
            let n = match udp_rx.recv(&mut buf).await {
                Ok(n) => n,
                Err(_) => {
                    BUFFER_POOL.free(buf);
                    break;
                }
            };
            let written = rlp::write_bytes(&mut session_tx, &buf[..n]).await;
            BUFFER_POOL.free(buf);
            if written.is_err() || session_tx.flush().await.is_err() {
                break;
            }
        }
    });

    loop {
        let frame = match rlp::read_bytes(&mut session_rx).await {
            Ok(frame) => frame,
            Err(_) => break,
        };
        let udp_tx = udp.clone();
        pool.submit(async move {
            let _ = udp_tx.send(&frame).await;
        });
    }
    downstream.abort();
    Ok(())
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use tokio::io::AsyncWriteExt;
    use tokio::sync::Notify;

    use super::*;

    #[tokio::test]
    async fn test_worker_pool_runs_jobs() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(Notify::new());

        for _ in 0..100 {
            let counter = counter.clone();
            let done = done.clone();
            pool.submit(async move {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 == 100 {
                    done.notify_one();
                }
            });
        }
        done.notified().await;
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(pool.dropped(), 0);
    }

    #[tokio::test]
    async fn test_worker_pool_drops_on_overflow() {
        let pool = WorkerPool::new(1);
        let gate = Arc::new(Notify::new());
        let blocked = Arc::new(Notify::new());

        // Park the only worker.
        {
            let gate = gate.clone();
            let blocked = blocked.clone();
            pool.submit(async move {
                blocked.notify_one();
                gate.notified().await;
            });
        }
        blocked.notified().await;

        // Fill the queue past its capacity; the tail must be dropped, not
        // queued or blocked on.
        for _ in 0..WORKER_QUEUE_CAP + 10 {
            pool.submit(async {});
        }
        assert!(pool.dropped() >= 10);
        gate.notify_one();
    }

    #[tokio::test]
    async fn test_ephemeral_listener_forwards_frames() {
        let exit = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let exit_addr = exit.local_addr().unwrap().to_string();

        let cookie = Cookie::from([11u8; 32]);
        let pool = Arc::new(WorkerPool::new(2));
        let port = spawn_ephemeral_listener(exit_addr, cookie.clone(), pool)
            .await
            .unwrap();

        let conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut session = handshake::client(&cookie, conn).await.unwrap();

        // Client to exit.
        rlp::write_bytes(&mut session, b"opaque tunnel frame").await.unwrap();
        session.flush().await.unwrap();
        let mut buf = [0u8; 2048];
        let (n, from) = exit.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"opaque tunnel frame");

        // Exit back to client.
        exit.send_to(b"return datagram", from).await.unwrap();
        let frame = rlp::read_bytes(&mut session).await.unwrap();
        assert_eq!(frame, b"return datagram");
    }
}
