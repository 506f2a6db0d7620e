//! # iocring: completion-based TCP I/O on io_uring
//!
//! One `io_uring` reactor and a small worker pool serve any number of
//! concurrent socket reads, writes, connects and accepts. Operations are
//! pooled objects, so the steady state allocates no per-call I/O state
//! beyond the caller-visible result.
//!
//! ## Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ AcceptServer          ByteStream (begin/end, futures)    │
//! ├──────────────────────────────────────────────────────────┤
//! │ PendingResult         OperationPool                      │
//! ├──────────────────────────────────────────────────────────┤
//! │ CompletionOperation   connect / read / write / accept    │
//! ├──────────────────────────────────────────────────────────┤
//! │ CompletionPort        reactor · eventfd · FixedPool      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use iocring::{AcceptServer, ByteStream, CompletionPort, OperationPool, ServerHandler};
//! use iocring::config::{PoolConfig, PortConfig};
//!
//! let port = CompletionPort::start(PortConfig::from_env())?;
//! let pool = OperationPool::new(PoolConfig::from_env());
//!
//! struct Hello;
//! impl ServerHandler for Hello {
//!     fn new_client(&self, socket: std::net::TcpStream) { /* ... */ }
//! }
//!
//! let server = AcceptServer::new(Hello, port.handle());
//! server.start("0.0.0.0:8080")?;
//! ```
//!
//! Completion callbacks run on the port's workers. Anything that blocks
//! (the `end_*` calls, `block_on`, the `Read`/`Write` adapters) parks the
//! worker it runs on, so size the pool for it.

pub mod config;
pub mod eventfd;
pub mod fixed_pool;
pub mod operation;
pub mod pending;
pub mod pool;
pub mod port;
pub mod server;
pub mod stream;

mod socket;
mod uring;

pub use operation::{CompletionOperation, Rejected, UserState};
pub use pending::{PendingResult, UserCallback};
pub use pool::OperationPool;
pub use port::{CompletionPort, PortHandle};
pub use server::{AcceptServer, ServerHandler};
pub use stream::{ByteStream, ConnectFuture, ReadFuture, SocketBased, WriteFuture};

pub use iocring_core::{CancellationToken, Error, OpKind, Result, SocketError, Token};
