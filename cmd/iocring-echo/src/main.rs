//! iocring Echo Server
//!
//! Accepts on an `AcceptServer` and echoes every connection with a chain
//! of `begin_read` / `begin_write` callbacks. No thread is parked per
//! connection; the worker pool only runs completions.
//!
//! Usage:
//!     cargo build --release -p iocring-echo
//!     RUST_LOG=info ./target/release/iocring-echo [port] [workers]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999
//!
//! Tuning comes from the environment as well (`IOCRING_SQ_ENTRIES`,
//! `IOCRING_POOL_MAX_IDLE`, `IOCRING_BACKLOG`, ...).

use iocring::config::{PoolConfig, PortConfig, ServerConfig};
use iocring::{
    AcceptServer, ByteStream, CompletionPort, OperationPool, PendingResult, PortHandle,
    ServerHandler, SocketError, UserCallback,
};

use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const BUF_SIZE: usize = 4096;

#[derive(Default)]
struct Stats {
    accepts: AtomicU64,
    closes: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
}

impl Stats {
    fn log(&self, elapsed: Duration) {
        let accepts = self.accepts.load(Ordering::Relaxed);
        let closes = self.closes.load(Ordering::Relaxed);
        tracing::info!(
            elapsed_s = elapsed.as_secs(),
            conns = accepts.saturating_sub(closes),
            accepts,
            closes,
            bytes = self.bytes.load(Ordering::Relaxed),
            errors = self.errors.load(Ordering::Relaxed),
            "stats"
        );
    }
}

struct Echo {
    port: PortHandle,
    pool: OperationPool,
    stats: Arc<Stats>,
}

impl ServerHandler for Echo {
    fn new_client(&self, socket: TcpStream) {
        self.stats.accepts.fetch_add(1, Ordering::Relaxed);
        let peer = socket.peer_addr().ok();
        tracing::debug!(?peer, "client connected");
        let stream = Arc::new(ByteStream::from_tcp(socket, self.port.clone(), self.pool.clone()));
        read_next(stream, vec![0; BUF_SIZE], Arc::clone(&self.stats));
    }

    fn started(&self, local: std::net::SocketAddr) {
        tracing::info!(%local, "listening");
    }

    fn stopped(&self) {
        tracing::info!("listener closed");
    }

    fn error(&self, err: &SocketError) {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(error = %err, "accept error");
    }
}

fn read_next(stream: Arc<ByteStream>, buf: Vec<u8>, stats: Arc<Stats>) {
    let s = Arc::clone(&stream);
    let st = Arc::clone(&stats);
    let cb: UserCallback = Box::new(move |r: &PendingResult| on_read(s, r, st));
    match stream.begin_read(buf, 0, BUF_SIZE, Some(cb), None) {
        // Refused at issue: completed without running the callback.
        Ok(r) if r.is_failed() => close(&stream, &stats, stream.end_read(&r).err()),
        Ok(_) => {}
        Err(e) => close(&stream, &stats, Some(e)),
    }
}

fn on_read(stream: Arc<ByteStream>, r: &PendingResult, stats: Arc<Stats>) {
    let n = match stream.end_read(r) {
        Ok(0) => return close(&stream, &stats, None),
        Ok(n) => n,
        Err(e) => return close(&stream, &stats, Some(e)),
    };
    stats.bytes.fetch_add(n as u64, Ordering::Relaxed);
    let buf = r.take_buffer().unwrap_or_default();

    let s = Arc::clone(&stream);
    let st = Arc::clone(&stats);
    let cb: UserCallback = Box::new(move |w: &PendingResult| on_write(s, w, st));
    match stream.begin_write(buf, 0, n, Some(cb), None) {
        Ok(w) if w.is_failed() => close(&stream, &stats, stream.end_write(&w).err()),
        Ok(_) => {}
        Err(e) => close(&stream, &stats, Some(e)),
    }
}

fn on_write(stream: Arc<ByteStream>, w: &PendingResult, stats: Arc<Stats>) {
    if let Err(e) = stream.end_write(w) {
        return close(&stream, &stats, Some(e));
    }
    let buf = w.take_buffer().unwrap_or_else(|| vec![0; BUF_SIZE]);
    // Bounce through the pool so back-to-back immediate completions don't
    // keep growing this stack.
    let port = stream.port().clone();
    if let Err(e) = port.execute(move || read_next(stream, buf, stats)) {
        tracing::debug!(error = %e, "port closed, dropping connection");
    }
}

fn close(stream: &ByteStream, stats: &Stats, err: Option<iocring::Error>) {
    stats.closes.fetch_add(1, Ordering::Relaxed);
    match err {
        Some(e) => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(stream = stream.id(), error = %e, "connection failed");
        }
        None => tracing::debug!(stream = stream.id(), "connection closed"),
    }
}

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let listen_port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);
    let mut port_config = PortConfig::from_env();
    if let Some(w) = args.get(2).and_then(|s| s.parse().ok()) {
        port_config = port_config.workers(w);
    }

    let handler = handle_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }

    let mut port = match CompletionPort::start(port_config) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "cannot start completion port");
            std::process::exit(1);
        }
    };
    let pool = OperationPool::new(PoolConfig::from_env());
    pool.prewarm(64);
    let stats = Arc::new(Stats::default());

    let server = AcceptServer::with_config(
        Echo {
            port: port.handle(),
            pool: pool.clone(),
            stats: Arc::clone(&stats),
        },
        port.handle(),
        ServerConfig::from_env(),
    );
    if let Err(e) = server.start_ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED), listen_port) {
        tracing::error!(error = %e, port = listen_port, "cannot listen");
        std::process::exit(1);
    }

    let start = Instant::now();
    let mut last = start;
    while RUNNING.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
        if last.elapsed() >= Duration::from_secs(5) {
            stats.log(start.elapsed());
            last = Instant::now();
        }
    }

    tracing::info!("shutting down");
    server.stop();
    port.shutdown();
    stats.log(start.elapsed());
    tracing::info!(pool_created = pool.created(), pool_idle = pool.idle(), "done");
}
