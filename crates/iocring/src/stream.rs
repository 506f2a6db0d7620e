//! # ByteStream
//!
//! Stream façade over a connected TCP socket. Every call takes an operation
//! from the pool, wraps the outcome in a [`PendingResult`], and issues the
//! operation. Two ways to consume the outcome:
//!
//! - begin/end: `begin_read` returns the result at once; `end_read` blocks
//!   until it completes. An optional callback runs on completion.
//! - futures: `read_async` / `write_async` resolve when the call completes.
//!   Any executor works; `futures::executor::block_on` is enough.
//!
//! Calls do not lock the stream. Overlapping reads (or writes) interleave
//! in the kernel; ordering them is up to the caller.
//!
//! The socket is shared with in-flight operations, so dropping the stream
//! never closes the fd under the kernel.

use crate::operation::{CompletionOperation, UserState};
use crate::pending::{PendingResult, UserCallback};
use crate::pool::OperationPool;
use crate::port::PortHandle;
use crate::socket;

use iocring_core::cancel::CancellationToken;
use iocring_core::entry::OpKind;
use iocring_core::error::{Error, Result, SocketError};

use futures::channel::oneshot;
use std::future::Future;
use std::io;
use std::mem;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Anything built on one socket.
pub trait SocketBased {
    /// The underlying socket.
    fn socket(&self) -> BorrowedFd<'_>;

    fn peer_addr(&self) -> Result<SocketAddr> {
        socket::peer_addr(self.socket().as_raw_fd())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        socket::local_addr(self.socket().as_raw_fd())
    }
}

struct StreamShared {
    id: u64,
    socket: Arc<OwnedFd>,
    port: PortHandle,
    pool: OperationPool,
}

/// What a stream operation carries into its completion.
struct StreamCall {
    result: PendingResult,
    stream: Arc<StreamShared>,
}

pub struct ByteStream {
    shared: Arc<StreamShared>,
}

impl ByteStream {
    fn from_socket(socket: Arc<OwnedFd>, port: PortHandle, pool: OperationPool) -> Self {
        Self {
            shared: Arc::new(StreamShared {
                id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
                socket,
                port,
                pool,
            }),
        }
    }

    /// Wrap an already-connected socket. It is kept in blocking mode.
    pub fn from_tcp(stream: TcpStream, port: PortHandle, pool: OperationPool) -> Self {
        Self::from_socket(Arc::new(OwnedFd::from(stream)), port, pool)
    }

    /// Connect to `addr`. Resolves to `Error::Cancelled` without doing
    /// anything if `token` is already cancelled.
    pub fn connect(
        port: &PortHandle,
        pool: &OperationPool,
        addr: SocketAddr,
        token: &CancellationToken,
    ) -> ConnectFuture {
        if let Err(e) = token.check() {
            return ConnectFuture::failed(e);
        }
        let fd = match socket::new_stream_socket(&addr) {
            Ok(fd) => Arc::new(fd),
            Err(e) => return ConnectFuture::failed(e),
        };

        let (tx, rx) = oneshot::channel();
        let mut op = pool.acquire();
        op.set_user_state(Arc::new(ConnectCall {
            tx: Mutex::new(Some(tx)),
            pool: pool.clone(),
        }));
        match op.connect_async(port, &fd, addr, after_connect) {
            Ok(()) => ConnectFuture {
                state: ConnectState::Waiting {
                    rx,
                    socket: fd,
                    port: port.clone(),
                    pool: pool.clone(),
                },
            },
            Err(rejected) => {
                let (op, error) = rejected.into_parts();
                pool.release(op);
                ConnectFuture::failed(error)
            }
        }
    }

    /// `connect`, blocking the calling thread.
    pub fn connect_blocking(
        port: &PortHandle,
        pool: &OperationPool,
        addr: SocketAddr,
    ) -> Result<Self> {
        futures::executor::block_on(Self::connect(port, pool, addr, &CancellationToken::never()))
    }

    /// Unique id; results remember which stream issued them.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn port(&self) -> &PortHandle {
        &self.shared.port
    }

    pub fn pool(&self) -> &OperationPool {
        &self.shared.pool
    }

    /// Start reading up to `size` bytes into `buf[offset..offset + size]`.
    ///
    /// If the OS refuses the read outright the returned result is already
    /// completed and failed; the callback is not run in that case. Errors
    /// that are not socket errors (bad region, closed port) are returned
    /// directly.
    pub fn begin_read(
        &self,
        buf: Vec<u8>,
        offset: usize,
        size: usize,
        callback: Option<UserCallback>,
        state: Option<UserState>,
    ) -> Result<PendingResult> {
        self.begin(OpKind::Read, buf, offset, size, callback, state)
    }

    /// Start writing all of `buf[offset..offset + size]`. The result only
    /// completes once every byte has been sent or the send failed.
    pub fn begin_write(
        &self,
        buf: Vec<u8>,
        offset: usize,
        size: usize,
        callback: Option<UserCallback>,
        state: Option<UserState>,
    ) -> Result<PendingResult> {
        self.begin(OpKind::Write, buf, offset, size, callback, state)
    }

    /// Wait for a read started on this stream. Returns the byte count; zero
    /// means the peer closed its side.
    pub fn end_read(&self, result: &PendingResult) -> Result<usize> {
        result.end(self.shared.id, OpKind::Read)
    }

    pub fn end_write(&self, result: &PendingResult) -> Result<()> {
        result.end(self.shared.id, OpKind::Write).map(|_| ())
    }

    /// Read as a future, resolving to the byte count and the buffer.
    ///
    /// `token` is checked once, before anything is issued. A read already
    /// handed to the kernel cannot be cancelled through it.
    pub fn read_async(
        &self,
        buf: Vec<u8>,
        offset: usize,
        size: usize,
        token: &CancellationToken,
    ) -> ReadFuture {
        ReadFuture {
            call: self.start_call(OpKind::Read, buf, offset, size, token),
        }
    }

    /// Write as a future, resolving to the buffer once fully sent.
    pub fn write_async(
        &self,
        buf: Vec<u8>,
        offset: usize,
        size: usize,
        token: &CancellationToken,
    ) -> WriteFuture {
        WriteFuture {
            call: self.start_call(OpKind::Write, buf, offset, size, token),
        }
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        socket::shutdown(self.shared.socket.as_raw_fd(), how)
    }

    fn begin(
        &self,
        kind: OpKind,
        buf: Vec<u8>,
        offset: usize,
        size: usize,
        callback: Option<UserCallback>,
        state: Option<UserState>,
    ) -> Result<PendingResult> {
        let shared = &self.shared;
        let result = PendingResult::new(callback, state, shared.id, kind, offset, size);

        let mut op = shared.pool.acquire();
        op.set_user_state(Arc::new(StreamCall {
            result: result.clone(),
            stream: Arc::clone(shared),
        }));

        let issued = match kind {
            OpKind::Write => op.write_async(&shared.port, &shared.socket, buf, offset, size, after_write),
            _ => op.read_async(&shared.port, &shared.socket, buf, offset, size, after_read),
        };

        match issued {
            Ok(()) => Ok(result),
            Err(rejected) => {
                let (mut op, error) = rejected.into_parts();
                let buf = op.take_buffer();
                shared.pool.release(op);
                if error.socket_error().is_some() {
                    tracing::debug!(stream = shared.id, op = kind.as_str(), %error, "issue refused");
                    if let Some(buf) = buf {
                        result.set_buffer(buf);
                    }
                    result.set_failed(error);
                    Ok(result)
                } else {
                    result.dispose();
                    Err(error)
                }
            }
        }
    }

    fn start_call(
        &self,
        kind: OpKind,
        buf: Vec<u8>,
        offset: usize,
        size: usize,
        token: &CancellationToken,
    ) -> Call {
        if let Err(e) = token.check() {
            return Call::Failed(e);
        }
        let (tx, rx) = oneshot::channel::<()>();
        let notify: UserCallback = Box::new(move |_: &PendingResult| {
            let _ = tx.send(());
        });
        match self.begin(kind, buf, offset, size, Some(notify), None) {
            Ok(result) => Call::Issued {
                result,
                rx,
                owner: self.shared.id,
                kind,
            },
            Err(e) => Call::Failed(e),
        }
    }
}

impl SocketBased for ByteStream {
    fn socket(&self) -> BorrowedFd<'_> {
        self.shared.socket.as_fd()
    }
}

impl AsRawFd for ByteStream {
    fn as_raw_fd(&self) -> RawFd {
        self.shared.socket.as_raw_fd()
    }
}

impl AsFd for ByteStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.shared.socket.as_fd()
    }
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("id", &self.shared.id)
            .field("fd", &self.shared.socket.as_raw_fd())
            .finish()
    }
}

// Blocking adapters: one begin + end per call through a scratch buffer.
// Do not use them from a completion callback; they park the thread.

impl io::Read for &ByteStream {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        let result = self.begin_read(vec![0; dst.len()], 0, dst.len(), None, None)?;
        let n = self.end_read(&result)?;
        if let Some(buf) = result.take_buffer() {
            dst[..n].copy_from_slice(&buf[..n]);
        }
        Ok(n)
    }
}

impl io::Read for ByteStream {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        (&*self).read(dst)
    }
}

impl io::Write for &ByteStream {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        let result = self.begin_write(src.to_vec(), 0, src.len(), None, None)?;
        self.end_write(&result)?;
        Ok(src.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Write for ByteStream {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        (&*self).write(src)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn take_call(op: &mut CompletionOperation) -> Option<Arc<StreamCall>> {
    let call = op.take_user_state()?.downcast::<StreamCall>().ok();
    if call.is_none() {
        tracing::warn!(?op, "stream completion without stream state");
    }
    call
}

/// Record the outcome, run the user callback, then give the operation back.
fn finish(call: Arc<StreamCall>, mut op: CompletionOperation, outcome: Result<usize>) {
    if let Some(buf) = op.take_buffer() {
        call.result.set_buffer(buf);
    }
    match outcome {
        Ok(n) => call.result.set_transferred(n),
        Err(e) => call.result.set_failed(e),
    }
    call.result.call_user_callback();
    call.stream.pool.release(op);
}

fn after_read(mut op: CompletionOperation, res: std::result::Result<usize, SocketError>) {
    let Some(call) = take_call(&mut op) else {
        return;
    };
    finish(call, op, res.map_err(Error::from));
}

fn after_write(mut op: CompletionOperation, res: std::result::Result<usize, SocketError>) {
    let Some(call) = take_call(&mut op) else {
        return;
    };
    let sent = match res {
        Ok(n) => n,
        Err(e) => return finish(call, op, Err(e.into())),
    };

    let remaining = op.size().saturating_sub(sent);
    if remaining == 0 {
        let total = call.result.size();
        return finish(call, op, Ok(total));
    }
    if sent == 0 {
        let err = io::Error::new(io::ErrorKind::WriteZero, "socket accepted no bytes");
        return finish(call, op, Err(err.into()));
    }

    // Partial send: same operation, rest of the region.
    let offset = op.offset() + sent;
    let stream = Arc::clone(&call.stream);
    let buf = op.take_buffer().unwrap_or_default();
    op.set_user_state(call);
    if let Err(rejected) = op.write_async(&stream.port, &stream.socket, buf, offset, remaining, after_write) {
        let (mut op, error) = rejected.into_parts();
        if let Some(call) = take_call(&mut op) {
            finish(call, op, Err(error));
        }
    }
}

// ── Futures ──

enum Call {
    Failed(Error),
    Issued {
        result: PendingResult,
        rx: oneshot::Receiver<()>,
        owner: u64,
        kind: OpKind,
    },
    Done,
}

impl Call {
    fn poll_call(&mut self, cx: &mut Context<'_>) -> Poll<Result<(usize, Vec<u8>)>> {
        match mem::replace(self, Call::Done) {
            Call::Failed(e) => Poll::Ready(Err(e)),
            Call::Done => Poll::Ready(Err(Error::Misuse("future polled after completion"))),
            Call::Issued { result, mut rx, owner, kind } => {
                // Completed without a callback (refused at issue) never
                // signals the channel, so check the flag first.
                if !result.is_completed() && Pin::new(&mut rx).poll(cx).is_pending() {
                    *self = Call::Issued { result, rx, owner, kind };
                    return Poll::Pending;
                }
                let outcome = result.end(owner, kind);
                let buf = result.take_buffer().unwrap_or_default();
                Poll::Ready(outcome.map(|n| (n, buf)))
            }
        }
    }
}

/// Resolves to `(bytes_read, buffer)`.
pub struct ReadFuture {
    call: Call,
}

impl Future for ReadFuture {
    type Output = Result<(usize, Vec<u8>)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().call.poll_call(cx)
    }
}

/// Resolves to the buffer once the whole region is sent.
pub struct WriteFuture {
    call: Call,
}

impl Future for WriteFuture {
    type Output = Result<Vec<u8>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().call.poll_call(cx).map(|r| r.map(|(_, buf)| buf))
    }
}

struct ConnectCall {
    tx: Mutex<Option<oneshot::Sender<std::result::Result<(), SocketError>>>>,
    pool: OperationPool,
}

fn after_connect(mut op: CompletionOperation, res: std::result::Result<(), SocketError>) {
    let Some(call) = op
        .take_user_state()
        .and_then(|s| s.downcast::<ConnectCall>().ok())
    else {
        tracing::warn!(?op, "connect completion without connect state");
        return;
    };
    let tx = call.tx.lock().ok().and_then(|mut slot| slot.take());
    call.pool.release(op);
    if let Some(tx) = tx {
        let _ = tx.send(res);
    }
}

enum ConnectState {
    Failed(Error),
    Waiting {
        rx: oneshot::Receiver<std::result::Result<(), SocketError>>,
        socket: Arc<OwnedFd>,
        port: PortHandle,
        pool: OperationPool,
    },
    Done,
}

/// Resolves to a connected [`ByteStream`].
pub struct ConnectFuture {
    state: ConnectState,
}

impl ConnectFuture {
    fn failed(e: Error) -> Self {
        Self { state: ConnectState::Failed(e) }
    }
}

impl Future for ConnectFuture {
    type Output = Result<ByteStream>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match mem::replace(&mut this.state, ConnectState::Done) {
            ConnectState::Failed(e) => Poll::Ready(Err(e)),
            ConnectState::Done => Poll::Ready(Err(Error::Misuse("future polled after completion"))),
            ConnectState::Waiting { mut rx, socket, port, pool } => match Pin::new(&mut rx).poll(cx) {
                Poll::Pending => {
                    this.state = ConnectState::Waiting { rx, socket, port, pool };
                    Poll::Pending
                }
                Poll::Ready(Ok(Ok(()))) => Poll::Ready(Ok(ByteStream::from_socket(socket, port, pool))),
                Poll::Ready(Ok(Err(e))) => Poll::Ready(Err(e.into())),
                Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Error::Cancelled)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, PortConfig};
    use crate::port::CompletionPort;
    use futures::executor::block_on;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    struct Fixture {
        _port: CompletionPort,
        handle: PortHandle,
        pool: OperationPool,
    }

    fn fixture() -> Fixture {
        let port = CompletionPort::start(PortConfig::new().workers(2)).unwrap();
        Fixture {
            handle: port.handle(),
            _port: port,
            pool: OperationPool::new(PoolConfig::new()),
        }
    }

    /// A ByteStream and the std socket on the other end.
    fn pair(fx: &Fixture) -> (ByteStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (ByteStream::from_tcp(client, fx.handle.clone(), fx.pool.clone()), server)
    }

    #[test]
    fn read_then_eof() {
        let fx = fixture();
        let (stream, mut peer) = pair(&fx);
        let never = CancellationToken::never();

        peer.write_all(&[1, 2, 3, 4, 5]).unwrap();
        let (n, buf) = block_on(stream.read_async(vec![0; 10], 0, 10, &never)).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], &[1, 2, 3, 4, 5]);

        peer.shutdown(Shutdown::Write).unwrap();
        let (n, _) = block_on(stream.read_async(buf, 0, 10, &never)).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn large_write_completes_in_full() {
        let fx = fixture();
        let (stream, mut peer) = pair(&fx);
        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let reader = thread::spawn(move || {
            let mut got = vec![0u8; 64 * 1024];
            peer.read_exact(&mut got).unwrap();
            got
        });

        let len = payload.len();
        let back = block_on(stream.write_async(payload, 0, len, &CancellationToken::never())).unwrap();
        assert_eq!(back.len(), len);
        assert_eq!(reader.join().unwrap(), expected);
    }

    #[test]
    fn write_and_read_in_flight_together() {
        let fx = fixture();
        let (stream, mut peer) = pair(&fx);
        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 13) as u8).collect();
        let len = payload.len();

        let echo = thread::spawn(move || {
            let mut got = vec![0u8; 64 * 1024];
            peer.read_exact(&mut got).unwrap();
            peer.write_all(b"ok").unwrap();
            got
        });

        // The read sits with the kernel while the write drains.
        let read = stream.begin_read(vec![0; 16], 0, 16, None, None).unwrap();
        let write = stream.begin_write(payload.clone(), 0, len, None, None).unwrap();

        stream.end_write(&write).unwrap();
        assert_eq!(stream.end_read(&read).unwrap(), 2);
        assert_eq!(&read.take_buffer().unwrap()[..2], b"ok");
        assert_eq!(echo.join().unwrap(), payload);
    }

    #[test]
    fn begin_end_with_callback_and_state() {
        let fx = fixture();
        let (stream, mut peer) = pair(&fx);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let cb: UserCallback = Box::new(move |r: &PendingResult| {
            assert_eq!(r.state().and_then(|s| s.downcast_ref::<&str>()).copied(), Some("tag"));
            h.fetch_add(1, Ordering::SeqCst);
        });

        let result = stream
            .begin_read(vec![0; 8], 2, 4, Some(cb), Some(Arc::new("tag")))
            .unwrap();
        peer.write_all(b"abcd").unwrap();

        assert_eq!(stream.end_read(&result).unwrap(), 4);
        assert_eq!(&result.take_buffer().unwrap()[2..6], b"abcd");
        // The callback may still be finishing on the worker.
        for _ in 0..100 {
            if hits.load(Ordering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn operations_return_to_pool() {
        let fx = fixture();
        let (stream, mut peer) = pair(&fx);
        for _ in 0..3 {
            let w = stream.begin_write(b"ping".to_vec(), 0, 4, None, None).unwrap();
            stream.end_write(&w).unwrap();
            let mut got = [0u8; 4];
            peer.read_exact(&mut got).unwrap();
        }
        // Released after the result is final; give the worker a moment.
        for _ in 0..100 {
            if fx.pool.idle() == fx.pool.created() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(fx.pool.idle(), fx.pool.created());
        assert!(fx.pool.created() <= 3);
    }

    #[test]
    fn misuse_is_detected() {
        let fx = fixture();
        let (a, _pa) = pair(&fx);
        let (b, _pb) = pair(&fx);

        let w = a.begin_write(vec![7; 3], 0, 3, None, None).unwrap();
        assert!(matches!(b.end_write(&w), Err(Error::Misuse(_))));
        assert!(matches!(a.end_read(&w), Err(Error::Misuse(_))));
        a.end_write(&w).unwrap();
        assert!(matches!(a.end_write(&w), Err(Error::Misuse(_))));
    }

    #[test]
    fn refused_read_completes_synchronously() {
        let fx = fixture();
        let fd = socket::new_stream_socket(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let stream = ByteStream::from_tcp(TcpStream::from(fd), fx.handle.clone(), fx.pool.clone());

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let cb: UserCallback = Box::new(move |_: &PendingResult| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let result = stream.begin_read(vec![0; 4], 0, 4, Some(cb), None).unwrap();
        assert!(result.is_completed());
        assert!(result.is_failed());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(result.take_buffer().map(|b| b.len()), Some(4));

        let err = stream.end_read(&result).unwrap_err();
        assert_eq!(err.socket_error().map(|e| e.code()), Some(libc::ENOTCONN));
        assert_eq!(fx.pool.idle(), 1);
    }

    #[test]
    fn bad_region_is_an_error_not_a_result() {
        let fx = fixture();
        let (stream, _peer) = pair(&fx);
        let err = stream.begin_read(vec![0; 4], 2, 8, None, None).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn cancelled_token_touches_nothing() {
        let fx = fixture();
        let (stream, _peer) = pair(&fx);
        let token = CancellationToken::new();
        token.cancel();

        let err = block_on(stream.read_async(vec![0; 4], 0, 4, &token)).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        let err = block_on(stream.write_async(vec![0; 4], 0, 4, &token)).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(fx.pool.created(), 0);
    }

    #[test]
    fn connect_and_talk() {
        let fx = fixture();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = ByteStream::connect_blocking(&fx.handle, &fx.pool, addr).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);

        (&stream).write_all(b"over").unwrap();
        let mut got = [0u8; 4];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"over");

        peer.write_all(b"back").unwrap();
        let mut got = [0u8; 4];
        (&stream).read_exact(&mut got).unwrap();
        assert_eq!(&got, b"back");
    }

    #[test]
    fn connect_refused() {
        let fx = fixture();
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let err = ByteStream::connect_blocking(&fx.handle, &fx.pool, addr).unwrap_err();
        assert_eq!(err.socket_error().map(|e| e.code()), Some(libc::ECONNREFUSED));
    }

    #[test]
    fn cancelled_connect_issues_nothing() {
        let fx = fixture();
        let token = CancellationToken::new();
        token.cancel();
        let addr = "127.0.0.1:9".parse().unwrap();
        let err = block_on(ByteStream::connect(&fx.handle, &fx.pool, addr, &token)).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(fx.pool.created(), 0);
    }
}
