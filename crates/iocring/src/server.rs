//! # AcceptServer
//!
//! Owns a listening socket and keeps exactly one accept in flight on a
//! dedicated operation. When an accept completes, the next one is issued
//! first and only then is the new connection handed to the handler, so a
//! slow handler never leaves the listener idle.
//!
//! ```text
//!   Stopped ──start()──► Started ──stop()──► Stopped
//!                          │  ▲
//!                 complete │  │ re-issue accept
//!                          ▼  │
//!                      dispatch(client) ──► worker pool ──► new_client()
//! ```

use crate::config::ServerConfig;
use crate::operation::CompletionOperation;
use crate::port::PortHandle;
use crate::socket;

use iocring_core::entry::Token;
use iocring_core::error::{Error, Result, SocketError};

use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Callbacks for an [`AcceptServer`]. Only `new_client` is required.
pub trait ServerHandler: Send + Sync + 'static {
    /// A client connected. Runs on a worker thread; may block.
    fn new_client(&self, socket: TcpStream);

    /// The server is listening on `local`.
    fn started(&self, _local: SocketAddr) {}

    /// `stop` was called. Runs on every call, started or not.
    fn stopped(&self) {}

    /// An accept failed while the server was running. The cycle goes on
    /// unless the next accept could not even be issued.
    fn error(&self, _err: &SocketError) {}

    /// Hand an accepted socket off the accepting path. The default queues
    /// `new_client` on the port's worker pool.
    fn dispatch(handler: &Arc<Self>, port: &PortHandle, socket: TcpStream)
    where
        Self: Sized,
    {
        let handler = Arc::clone(handler);
        if let Err(e) = port.execute(move || handler.new_client(socket)) {
            tracing::warn!(error = %e, "client dropped, worker pool unavailable");
        }
    }
}

/// One run of the accept cycle, from `start` to `stop`.
struct AcceptCycle<H> {
    handler: Arc<H>,
    port: PortHandle,
    listener: Arc<OwnedFd>,
    stopped: AtomicBool,
    /// Token of the accept the kernel currently holds. Cleared by the
    /// completion before the operation can be re-issued or freed, so a
    /// cancel sent under this lock never reaches a recycled token.
    in_flight: Mutex<Option<Token>>,
}

impl<H> AcceptCycle<H> {
    fn in_flight(&self) -> MutexGuard<'_, Option<Token>> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }
}

struct Running<H> {
    cycle: Arc<AcceptCycle<H>>,
    local: SocketAddr,
}

pub struct AcceptServer<H: ServerHandler> {
    handler: Arc<H>,
    port: PortHandle,
    config: ServerConfig,
    running: Mutex<Option<Running<H>>>,
}

impl<H: ServerHandler> AcceptServer<H> {
    pub fn new(handler: H, port: PortHandle) -> Self {
        Self::with_config(handler, port, ServerConfig::default())
    }

    pub fn with_config(handler: H, port: PortHandle, config: ServerConfig) -> Self {
        Self {
            handler: Arc::new(handler),
            port,
            config,
            running: Mutex::new(None),
        }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// The realized listening address while started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().as_ref().map(|r| r.local)
    }

    pub fn is_started(&self) -> bool {
        self.lock().is_some()
    }

    /// Start on the first address `endpoint` resolves to.
    pub fn start<A: ToSocketAddrs>(&self, endpoint: A) -> Result<SocketAddr> {
        let addr = endpoint
            .to_socket_addrs()?
            .next()
            .ok_or(Error::Misuse("local endpoint is required"))?;
        self.start_addr(addr)
    }

    /// Start on `ip:port`; port 0 lets the OS choose.
    pub fn start_ip(&self, ip: IpAddr, port: u16) -> Result<SocketAddr> {
        self.start_addr(SocketAddr::new(ip, port))
    }

    pub fn start_addr(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.config.validate().map_err(Error::InvalidArgument)?;

        let mut running = self.lock();
        if running.is_some() {
            return Err(Error::Misuse("server already started"));
        }

        let listener = Arc::new(socket::bind_listener(&addr, self.config.backlog)?);
        let local = socket::local_addr(listener.as_raw_fd())?;

        let cycle = Arc::new(AcceptCycle {
            handler: Arc::clone(&self.handler),
            port: self.port.clone(),
            listener,
            stopped: AtomicBool::new(false),
            in_flight: Mutex::new(None),
        });

        let mut op = CompletionOperation::new();
        let token = op.token();
        op.set_user_state(cycle.clone());
        {
            let mut in_flight = cycle.in_flight();
            op.accept_async(&self.port, &cycle.listener, accept_completed::<H>)
                .map_err(|rejected| rejected.error)?;
            *in_flight = Some(token);
        }

        *running = Some(Running { cycle, local });
        drop(running);

        tracing::info!(%local, backlog = self.config.backlog, "accept server started");
        self.handler.started(local);
        Ok(local)
    }

    /// Stop listening. Safe to call any number of times; `stopped` runs
    /// every time. Connections already handed out are not touched.
    pub fn stop(&self) {
        let running = self.lock().take();
        if let Some(r) = running {
            r.cycle.stopped.store(true, Ordering::SeqCst);
            // Wakes a pending accept; it then sees `stopped` and ends.
            let _ = socket::shutdown(r.cycle.listener.as_raw_fd(), Shutdown::Both);
            let in_flight = r.cycle.in_flight();
            if let Some(token) = *in_flight {
                let _ = self.port.cancel(token);
            }
            drop(in_flight);
            tracing::info!(local = %r.local, "accept server stopped");
            // The listener closes once the accept operation lets go of it.
        }
        self.handler.stopped();
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running<H>>> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl<H: ServerHandler> Drop for AcceptServer<H> {
    fn drop(&mut self) {
        if self.is_started() {
            self.stop();
        }
    }
}

fn accept_completed<H: ServerHandler>(
    op: CompletionOperation,
    res: std::result::Result<TcpStream, SocketError>,
) {
    let Some(cycle) = op
        .user_state()
        .cloned()
        .and_then(|s| s.downcast::<AcceptCycle<H>>().ok())
    else {
        tracing::warn!(?op, "accept completion without server state");
        return;
    };

    let mut in_flight = cycle.in_flight();
    *in_flight = None;

    if cycle.stopped.load(Ordering::SeqCst) {
        tracing::debug!("accept cycle ended by stop");
        return;
    }
    if let Err(e) = &res {
        if e.is_cancelled() {
            tracing::debug!("accept cancelled, cycle ended");
            return;
        }
    }

    // Keep the listener busy before handling this one.
    let token = op.token();
    let reissued = op.accept_async(&cycle.port, &cycle.listener, accept_completed::<H>);
    if reissued.is_ok() {
        *in_flight = Some(token);
    }
    drop(in_flight);

    if let Err(rejected) = reissued {
        match rejected.error.socket_error() {
            Some(se) => {
                tracing::error!(error = %se, "cannot re-issue accept, cycle ended");
                cycle.handler.error(&se);
            }
            None => tracing::debug!(error = %rejected.error, "accept not re-issued, cycle ended"),
        }
    }

    match res {
        Ok(client) => {
            if let Err(e) = client.set_nodelay(true) {
                tracing::debug!(error = %e, "TCP_NODELAY failed");
            }
            H::dispatch(&cycle.handler, &cycle.port, client);
        }
        Err(e) => {
            tracing::warn!(error = %e, "accept failed");
            cycle.handler.error(&e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, PortConfig};
    use crate::pool::OperationPool;
    use crate::port::CompletionPort;
    use crate::stream::ByteStream;
    use iocring_core::cancel::CancellationToken;
    use futures::executor::block_on;
    use std::io::{Read, Write};
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        clients: AtomicUsize,
        started: AtomicUsize,
        stopped: AtomicUsize,
        errors: AtomicUsize,
        nodelay: AtomicUsize,
    }

    impl ServerHandler for Recorder {
        fn new_client(&self, socket: TcpStream) {
            if socket.nodelay().unwrap_or(false) {
                self.nodelay.fetch_add(1, Ordering::SeqCst);
            }
            self.clients.fetch_add(1, Ordering::SeqCst);
        }

        fn started(&self, _local: SocketAddr) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn stopped(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }

        fn error(&self, _err: &SocketError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn port(workers: usize) -> CompletionPort {
        CompletionPort::start(PortConfig::new().workers(workers)).unwrap()
    }

    #[test]
    fn accepts_and_dispatches_with_nodelay() {
        let port = port(2);
        let server = AcceptServer::with_config(Recorder::default(), port.handle(), ServerConfig::new());
        let local = server.start_ip(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
        assert_ne!(local.port(), 0);
        assert_eq!(server.local_addr(), Some(local));

        let _a = TcpStream::connect(local).unwrap();
        let _b = TcpStream::connect(local).unwrap();
        let h = Arc::clone(server.handler());
        assert!(wait_for(|| h.clients.load(Ordering::SeqCst) == 2));
        assert_eq!(h.nodelay.load(Ordering::SeqCst), 2);
        assert_eq!(h.started.load(Ordering::SeqCst), 1);
        assert_eq!(h.errors.load(Ordering::SeqCst), 0);
        server.stop();
    }

    #[test]
    fn start_requires_endpoint_and_stopped_state() {
        let port = port(1);
        let server = AcceptServer::new(Recorder::default(), port.handle());
        let none: &[SocketAddr] = &[];
        assert!(matches!(server.start(none), Err(Error::Misuse(_))));

        server.start("127.0.0.1:0").unwrap();
        assert!(matches!(server.start("127.0.0.1:0"), Err(Error::Misuse(_))));
        server.stop();
    }

    #[test]
    fn stop_is_idempotent_and_always_notifies() {
        let port = port(1);
        let server = AcceptServer::new(Recorder::default(), port.handle());
        let local = server.start("127.0.0.1:0").unwrap();
        server.stop();
        server.stop();
        assert!(!server.is_started());
        assert_eq!(server.handler().stopped.load(Ordering::SeqCst), 2);
        assert_eq!(server.handler().errors.load(Ordering::SeqCst), 0);

        // The listener is gone once the cancelled accept has unwound.
        assert!(wait_for(|| TcpStream::connect(local).is_err()));
    }

    #[test]
    fn restart_after_stop() {
        let port = port(2);
        let server = AcceptServer::new(Recorder::default(), port.handle());
        server.start("127.0.0.1:0").unwrap();
        server.stop();
        let local = server.start("127.0.0.1:0").unwrap();
        let _c = TcpStream::connect(local).unwrap();
        let h = Arc::clone(server.handler());
        assert!(wait_for(|| h.clients.load(Ordering::SeqCst) == 1));
        assert_eq!(h.started.load(Ordering::SeqCst), 2);
    }

    /// First client blocks its worker until released; the second must
    /// still be accepted and served.
    struct Blocking {
        gate: Mutex<Option<mpsc::Receiver<()>>>,
        served: AtomicUsize,
    }

    impl ServerHandler for Blocking {
        fn new_client(&self, _socket: TcpStream) {
            let first = self.gate.lock().unwrap().take();
            if let Some(rx) = first {
                let _ = rx.recv_timeout(Duration::from_secs(10));
            }
            self.served.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn slow_client_does_not_block_accepts() {
        let port = port(4);
        let (release, gate) = mpsc::channel();
        let server = AcceptServer::new(
            Blocking { gate: Mutex::new(Some(gate)), served: AtomicUsize::new(0) },
            port.handle(),
        );
        let local = server.start("127.0.0.1:0").unwrap();

        let _first = TcpStream::connect(local).unwrap();
        let _second = TcpStream::connect(local).unwrap();
        let h = Arc::clone(server.handler());
        assert!(wait_for(|| h.served.load(Ordering::SeqCst) == 1));

        release.send(()).unwrap();
        assert!(wait_for(|| h.served.load(Ordering::SeqCst) == 2));
        server.stop();
    }

    /// Echoes one message back through a ByteStream.
    struct Echo {
        port: PortHandle,
        pool: OperationPool,
    }

    impl ServerHandler for Echo {
        fn new_client(&self, socket: TcpStream) {
            let stream = ByteStream::from_tcp(socket, self.port.clone(), self.pool.clone());
            let never = CancellationToken::never();
            let Ok((n, buf)) = block_on(stream.read_async(vec![0; 64], 0, 64, &never)) else {
                return;
            };
            let _ = block_on(stream.write_async(buf, 0, n, &never));
        }
    }

    #[test]
    fn echo_end_to_end() {
        let port = port(2);
        let pool = OperationPool::new(PoolConfig::new());
        let server = AcceptServer::new(Echo { port: port.handle(), pool: pool.clone() }, port.handle());
        let local = server.start("127.0.0.1:0").unwrap();

        let mut client = TcpStream::connect(local).unwrap();
        client.write_all(&[1, 2, 3, 4, 5]).unwrap();
        let mut got = [0u8; 5];
        client.read_exact(&mut got).unwrap();
        assert_eq!(got, [1, 2, 3, 4, 5]);

        server.stop();
    }

    /// Writes `[1, 2, 3, 4, 5]` and hangs up.
    struct FiveAndClose;

    impl ServerHandler for FiveAndClose {
        fn new_client(&self, mut socket: TcpStream) {
            let _ = socket.write_all(&[1, 2, 3, 4, 5]);
        }
    }

    #[test]
    fn client_reads_five_bytes_then_eof() {
        let port = port(2);
        let pool = OperationPool::new(PoolConfig::new());
        let server = AcceptServer::new(FiveAndClose, port.handle());
        let local = server.start_ip(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();

        let client = ByteStream::connect_blocking(&port.handle(), &pool, local).unwrap();
        let first = client.begin_read(vec![0; 10], 0, 10, None, None).unwrap();
        assert_eq!(client.end_read(&first).unwrap(), 5);
        assert_eq!(&first.take_buffer().unwrap()[..5], &[1, 2, 3, 4, 5]);

        let second = client.begin_read(vec![0; 10], 0, 10, None, None).unwrap();
        assert_eq!(client.end_read(&second).unwrap(), 0);
        server.stop();
    }

    #[test]
    fn stop_leaves_other_operations_alone() {
        let port = port(2);
        // No idle reuse, so every read allocates fresh operation state.
        let pool = OperationPool::new(PoolConfig::new().max_idle(0));
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        let stream = ByteStream::from_tcp(client, port.handle(), pool);

        let done = Arc::new(AtomicBool::new(false));
        let d = Arc::clone(&done);
        let reader = thread::spawn(move || {
            let mut reads = 0usize;
            loop {
                let r = stream.begin_read(vec![0; 1], 0, 1, None, None).unwrap();
                peer.write_all(&[7]).unwrap();
                assert_eq!(stream.end_read(&r).unwrap(), 1);
                reads += 1;
                if d.load(Ordering::SeqCst) {
                    return reads;
                }
            }
        });

        let server = AcceptServer::new(Recorder::default(), port.handle());
        for _ in 0..50 {
            server.start("127.0.0.1:0").unwrap();
            server.stop();
        }
        done.store(true, Ordering::SeqCst);
        assert!(reader.join().unwrap() > 0);
        assert_eq!(server.handler().errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn port_shutdown_ends_cycle_quietly() {
        let mut port = port(1);
        let server = AcceptServer::new(Recorder::default(), port.handle());
        server.start("127.0.0.1:0").unwrap();
        port.shutdown();
        assert_eq!(server.handler().errors.load(Ordering::SeqCst), 0);
        server.stop();
    }
}
