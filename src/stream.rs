//! Asynchronous obfuscated stream based on the `tokio` runtime.

use core::{
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
};
use std::io::{self, ErrorKind, Read, Write};

use pin_project_lite::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{sleep, Duration, Sleep},
};

use crate::{
    crypto::SharedSecret,
    record::{RecordEngine, PAYLOAD_MAX_LEN},
};

/// Once a record's length is committed, the rest of its body must arrive
/// within this window. Holding the length open indefinitely would let a
/// probing peer pin a reader task with one byte.
const BODY_READ_TIMEOUT: Duration = Duration::from_secs(2);

pin_project! {
    /// An obfuscated record session over any `AsyncRead + AsyncWrite`
    /// transport, created by the [`handshake`](crate::handshake) functions.
    ///
    /// `RelayStream` implements [`AsyncRead`] and [`AsyncWrite`], so it can
    /// be used like a [`TcpStream`]. Writes are framed into records holding
    /// at most 65533 payload bytes; larger writes are split and reads
    /// reassemble transparently.
    ///
    /// Any protocol failure on the read side (MAC mismatch, truncated
    /// record) is fatal: the error is returned once and the stream then
    /// reports EOF. Nothing is sent to the peer in reaction.
    ///
    /// [`TcpStream`]: tokio::net::TcpStream
    #[derive(Debug)]
    pub struct RelayStream<IO> {
        stream: IO,
        engine: RecordEngine,
        write_state: WriteState,
        body_deadline: Option<Pin<Box<Sleep>>>,
    }
}

#[derive(Copy, Clone, Debug)]
enum WriteState {
    Ready,
    Flushing { accepted: usize },
}

impl<IO> RelayStream<IO> {
    /// Wraps `stream` with a freshly keyed record session.
    pub(crate) fn new(stream: IO, ss: SharedSecret, is_server: bool) -> Self {
        Self {
            stream,
            engine: RecordEngine::new(&ss, is_server),
            write_state: WriteState::Ready,
            body_deadline: None,
        }
    }

    /// Returns a reference to the underlying transport.
    pub fn inner_stream(&self) -> &IO {
        &self.stream
    }

    /// Returns a mutable reference to the underlying transport.
    pub fn inner_stream_mut(&mut self) -> &mut IO {
        &mut self.stream
    }
}

impl<IO> AsyncRead for RelayStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.project();
        loop {
            let payload = me.engine.payload();
            if !payload.is_empty() {
                let k = std::cmp::min(buf.remaining(), payload.len());
                buf.put_slice(&payload[..k]);
                me.engine.consume(k);
                return Poll::Ready(Ok(()));
            }

            let mut reader = SyncReadAdapter {
                io: &mut *me.stream,
                cx: &mut *cx,
            };
            match me.engine.read_wire(&mut reader) {
                // A record arrived; deliver its payload (an all-padding
                // record loops for the next one).
                Ok(n) if n > 0 => *me.body_deadline = None,

                // Clean EOF.
                Ok(_) => return Poll::Ready(Ok(())),

                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if me.engine.reading_body() {
                        // The length is committed; bound the wait for the
                        // remaining body bytes.
                        let deadline = me
                            .body_deadline
                            .get_or_insert_with(|| Box::pin(sleep(BODY_READ_TIMEOUT)));
                        if deadline.as_mut().poll(cx).is_ready() {
                            return Poll::Ready(Err(ErrorKind::TimedOut.into()));
                        }
                    } else {
                        *me.body_deadline = None;
                    }
                    return Poll::Pending;
                }

                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }
}

impl<IO> AsyncWrite for RelayStream<IO>
where
    IO: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let me = self.project();
        loop {
            match *me.write_state {
                WriteState::Ready => {
                    if buf.is_empty() {
                        return Poll::Ready(Ok(0));
                    }
                    let take = std::cmp::min(buf.len(), PAYLOAD_MAX_LEN);
                    match me.engine.start_record(&buf[..take]) {
                        Ok(()) => *me.write_state = WriteState::Flushing { accepted: take },
                        Err(e) => return Poll::Ready(Err(e.into())),
                    }
                }
                WriteState::Flushing { accepted } => {
                    let mut writer = SyncWriteAdapter {
                        io: &mut *me.stream,
                        cx: &mut *cx,
                    };
                    return match me.engine.write_wire(&mut writer) {
                        Ok(n) if n > 0 => {
                            *me.write_state = WriteState::Ready;
                            Poll::Ready(Ok(accepted))
                        }
                        Ok(_) => Poll::Ready(Err(ErrorKind::WriteZero.into())),
                        Err(e) if e.kind() == ErrorKind::WouldBlock => Poll::Pending,
                        Err(e) => Poll::Ready(Err(e)),
                    };
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let me = self.project();
        if !me.engine.is_write_idle() {
            let mut writer = SyncWriteAdapter {
                io: &mut *me.stream,
                cx: &mut *cx,
            };
            match me.engine.write_wire(&mut writer) {
                Ok(n) if n > 0 => *me.write_state = WriteState::Ready,
                Ok(_) => return Poll::Ready(Err(ErrorKind::WriteZero.into())),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Poll::Pending,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
        Pin::new(&mut *me.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.project().stream).poll_shutdown(cx)
    }
}

/// [`Read`] over an [`AsyncRead`] plus its [`Context`], turning
/// `Poll::Pending` into `WouldBlock`. The shape follows the adapter used by
/// the futures-rustls project.
struct SyncReadAdapter<'a, 'b, T> {
    io: &'a mut T,
    cx: &'a mut Context<'b>,
}

impl<T: AsyncRead + Unpin> Read for SyncReadAdapter<'_, '_, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut buf = ReadBuf::new(buf);
        match Pin::new(&mut self.io).poll_read(self.cx, &mut buf) {
            Poll::Ready(Ok(())) => Ok(buf.filled().len()),
            Poll::Ready(Err(err)) => Err(err),
            Poll::Pending => Err(ErrorKind::WouldBlock.into()),
        }
    }
}

/// [`Write`] over an [`AsyncWrite`] plus its [`Context`]; see
/// [`SyncReadAdapter`].
struct SyncWriteAdapter<'a, 'b, T> {
    io: &'a mut T,
    cx: &'a mut Context<'b>,
}

impl<T: AsyncWrite + Unpin> Write for SyncWriteAdapter<'_, '_, T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match Pin::new(&mut self.io).poll_write(self.cx, buf) {
            Poll::Ready(result) => result,
            Poll::Pending => Err(ErrorKind::WouldBlock.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match Pin::new(&mut self.io).poll_flush(self.cx) {
            Poll::Ready(result) => result,
            Poll::Pending => Err(ErrorKind::WouldBlock.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::{crypto::Cookie, handshake};

    #[tokio::test]
    async fn test_tcp_echo_through_handshake() {
        const DATA_LEN: usize = 65536 * 4;
        let cookie = Cookie::from([0u8; 32]);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_cookie = cookie.clone();
        let server_task = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let mut stream = handshake::server(&server_cookie, conn).await.unwrap();
            let mut buf = vec![0u8; DATA_LEN];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.flush().await.unwrap();
        });

        let conn = TcpStream::connect(addr).await.unwrap();
        let mut stream = handshake::client(&cookie, conn).await.unwrap();
        let data: Vec<u8> = (0..DATA_LEN).map(|i| i as u8).collect();
        stream.write_all(&data).await.unwrap();
        stream.flush().await.unwrap();

        let mut echoed = vec![0u8; DATA_LEN];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, data);

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_larger_than_one_record() {
        let ss = SharedSecret::from([1u8; 32]);
        let (a, b) = tokio::io::duplex(1 << 20);
        let mut client = RelayStream::new(a, ss.clone(), false);
        let mut server = RelayStream::new(b, ss, true);

        let data = vec![0x5au8; PAYLOAD_MAX_LEN + 4000];
        let write_task = tokio::spawn(async move {
            client.write_all(&data).await.unwrap();
            client.flush().await.unwrap();
            data
        });

        let mut buf = vec![0u8; PAYLOAD_MAX_LEN + 4000];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, write_task.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_body_read_deadline_fires() {
        let ss = SharedSecret::from([2u8; 32]);

        // Seal a record out-of-band and feed the receiver only a prefix
        // that commits the length but withholds the body.
        let mut sender = RecordEngine::new(&ss, false);
        sender.start_record(b"held hostage").unwrap();
        let mut wire = Vec::new();
        sender.write_wire(&mut wire).unwrap();

        let (mut raw, b) = tokio::io::duplex(65536);
        let mut server = RelayStream::new(b, ss, true);
        raw.write_all(&wire[..20]).await.unwrap();

        let mut buf = [0u8; 16];
        let err = server.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_deadline_before_length_commits() {
        let ss = SharedSecret::from([3u8; 32]);
        let (mut raw, b) = tokio::io::duplex(65536);
        let mut server = RelayStream::new(b, ss, true);

        // An incomplete header arms nothing; the read just waits.
        raw.write_all(&[0u8; 10]).await.unwrap();
        let mut buf = [0u8; 16];
        let waited =
            tokio::time::timeout(Duration::from_secs(30), server.read(&mut buf)).await;
        assert!(waited.is_err());
    }
}
