//! # CompletionOperation
//!
//! A reusable completion-event object. It binds a buffer region or a peer
//! address plus a one-shot callback, asks the OS for the operation, and
//! hands itself back to the callback when the outcome is known.
//!
//! ## Issuance
//!
//! Each `*_async` method first tries the syscall without blocking:
//!
//! | Operation | Immediate attempt                     | Deferred SQE             |
//! |-----------|---------------------------------------|--------------------------|
//! | read      | `recv(MSG_DONTWAIT)`                  | `Recv`                   |
//! | write     | `send(MSG_DONTWAIT \| MSG_NOSIGNAL)`   | `Send`                   |
//! | connect   | `connect()` on a briefly non-blocking fd | `PollAdd(POLLOUT)` + `SO_ERROR` |
//! | accept    | none                                  | `Accept`                 |
//!
//! If the attempt finishes, the callback runs right away on the calling
//! thread through the same `complete` path a deferred completion takes.
//! If it would block, the SQE goes to the port and the callback later runs
//! on a worker thread. If the OS refuses the request outright, the call
//! returns [`Rejected`]: the callback is disarmed and never runs, and the
//! operation (buffer still bound) comes back to the caller.
//!
//! ## Ownership
//!
//! The state lives in a `Box` whose address is the `io_uring` token. While
//! the kernel holds the operation the `Box` is leaked into the port; the
//! reactor rebuilds it from the token and passes it, by value, to the
//! callback. There is no way to reach an operation that is in flight.

use crate::port::PortHandle;
use crate::socket;

use iocring_core::entry::{OpKind, Token};
use iocring_core::error::{Error, SocketError};

use io_uring::{opcode, squeue, types};
use std::any::Any;
use std::fmt;
use std::mem;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// Opaque per-call state carried by an operation into its callback.
pub type UserState = Arc<dyn Any + Send + Sync>;

pub type ConnectCallback = fn(CompletionOperation, Result<(), SocketError>);
pub type ReadCallback = fn(CompletionOperation, Result<usize, SocketError>);
pub type WriteCallback = fn(CompletionOperation, Result<usize, SocketError>);
pub type AcceptCallback = fn(CompletionOperation, Result<TcpStream, SocketError>);

#[derive(Clone, Copy)]
enum Armed {
    Connect(ConnectCallback),
    Read(ReadCallback),
    Write(WriteCallback),
    Accept(AcceptCallback),
}

struct OpState {
    last_op: Option<OpKind>,
    armed: Option<Armed>,
    buffer: Option<Vec<u8>>,
    offset: usize,
    size: usize,
    socket: Option<Arc<OwnedFd>>,
    addr: libc::sockaddr_storage,
    addr_len: libc::socklen_t,
    user_state: Option<UserState>,
}

impl OpState {
    fn new() -> Self {
        Self {
            last_op: None,
            armed: None,
            buffer: None,
            offset: 0,
            size: 0,
            socket: None,
            addr: unsafe { mem::zeroed() },
            addr_len: 0,
            user_state: None,
        }
    }
}

/// An issue failed before anything reached the kernel.
pub struct Rejected {
    pub op: CompletionOperation,
    pub error: Error,
}

impl Rejected {
    pub fn into_parts(self) -> (CompletionOperation, Error) {
        (self.op, self.error)
    }
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("op", &self.op.last_op())
            .field("error", &self.error)
            .finish()
    }
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation rejected: {}", self.error)
    }
}

impl std::error::Error for Rejected {}

/// Outcome of the immediate syscall attempt.
enum Attempt {
    /// Finished; run the callback now with this kernel-style result.
    Done(i32),
    /// Would block; hand this entry to the port.
    Defer(squeue::Entry),
    /// Refused up front.
    Refused(SocketError),
}

pub struct CompletionOperation {
    state: Box<OpState>,
}

impl CompletionOperation {
    /// A fresh, idle operation. Normally obtained from an `OperationPool`.
    pub fn new() -> Self {
        Self { state: Box::new(OpState::new()) }
    }

    /// The token this operation is known by while in flight.
    pub fn token(&self) -> Token {
        Token(&*self.state as *const OpState as u64)
    }

    /// Kind of the most recent issue.
    pub fn last_op(&self) -> Option<OpKind> {
        self.state.last_op
    }

    /// A callback is set. Only true between issue and completion, which
    /// outside this module means "never"; the pool uses it as a sanity check.
    pub fn is_armed(&self) -> bool {
        self.state.armed.is_some()
    }

    pub fn offset(&self) -> usize {
        self.state.offset
    }

    pub fn size(&self) -> usize {
        self.state.size
    }

    pub fn buffer(&self) -> Option<&[u8]> {
        self.state.buffer.as_deref()
    }

    pub fn take_buffer(&mut self) -> Option<Vec<u8>> {
        self.state.buffer.take()
    }

    pub fn socket(&self) -> Option<&Arc<OwnedFd>> {
        self.state.socket.as_ref()
    }

    /// Peer address of the last connect or accept.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        socket::from_sockaddr(&self.state.addr, self.state.addr_len)
    }

    pub fn set_user_state(&mut self, state: UserState) {
        self.state.user_state = Some(state);
    }

    pub fn user_state(&self) -> Option<&UserState> {
        self.state.user_state.as_ref()
    }

    pub fn take_user_state(&mut self) -> Option<UserState> {
        self.state.user_state.take()
    }

    /// Clear everything bound to this operation.
    pub(crate) fn reset(&mut self) {
        let s = &mut *self.state;
        s.last_op = None;
        s.armed = None;
        s.buffer = None;
        s.offset = 0;
        s.size = 0;
        s.socket = None;
        s.addr_len = 0;
        s.user_state = None;
    }

    /// Read up to `size` bytes into `buf[offset..offset + size]`.
    pub fn read_async(
        mut self,
        port: &PortHandle,
        socket: &Arc<OwnedFd>,
        buf: Vec<u8>,
        offset: usize,
        size: usize,
        callback: ReadCallback,
    ) -> Result<(), Rejected> {
        self.bind_region(OpKind::Read, socket, buf, offset, size);
        self.state.armed = Some(Armed::Read(callback));
        if let Err(e) = check_region(self.state.buffer.as_deref(), offset, size) {
            return Err(self.reject(e));
        }

        let fd = socket.as_raw_fd();
        let ptr = self.region_ptr();
        let attempt = loop {
            let n = unsafe {
                libc::recv(fd, ptr as *mut libc::c_void, size, libc::MSG_DONTWAIT)
            };
            if n >= 0 {
                break Attempt::Done(n as i32);
            }
            let err = SocketError::last_os_error();
            if err.code() == libc::EINTR {
                continue;
            }
            break classify(err, || {
                opcode::Recv::new(types::Fd(fd), ptr, size as u32).build()
            });
        };
        self.issue(port, attempt)
    }

    /// Send `buf[offset..offset + size]`. The callback gets the number of
    /// bytes the kernel took, which may be less than `size`.
    pub fn write_async(
        mut self,
        port: &PortHandle,
        socket: &Arc<OwnedFd>,
        buf: Vec<u8>,
        offset: usize,
        size: usize,
        callback: WriteCallback,
    ) -> Result<(), Rejected> {
        self.bind_region(OpKind::Write, socket, buf, offset, size);
        self.state.armed = Some(Armed::Write(callback));
        if let Err(e) = check_region(self.state.buffer.as_deref(), offset, size) {
            return Err(self.reject(e));
        }

        let fd = socket.as_raw_fd();
        let ptr = self.region_ptr() as *const u8;
        let attempt = loop {
            let n = unsafe {
                libc::send(
                    fd,
                    ptr as *const libc::c_void,
                    size,
                    libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
                )
            };
            if n >= 0 {
                break Attempt::Done(n as i32);
            }
            let err = SocketError::last_os_error();
            if err.code() == libc::EINTR {
                continue;
            }
            break classify(err, || {
                opcode::Send::new(types::Fd(fd), ptr, size as u32)
                    .flags(libc::MSG_NOSIGNAL)
                    .build()
            });
        };
        self.issue(port, attempt)
    }

    /// Connect `socket` to `addr`.
    ///
    /// Every immediate failure (refused, unreachable, bad socket) is a
    /// rejection; only failures discovered after `EINPROGRESS` reach the
    /// callback.
    pub fn connect_async(
        mut self,
        port: &PortHandle,
        socket: &Arc<OwnedFd>,
        addr: SocketAddr,
        callback: ConnectCallback,
    ) -> Result<(), Rejected> {
        self.state.last_op = Some(OpKind::Connect);
        self.state.socket = Some(Arc::clone(socket));
        self.state.addr_len = socket::to_sockaddr(&addr, &mut self.state.addr);
        self.state.armed = Some(Armed::Connect(callback));

        let fd = socket.as_raw_fd();
        // Non-blocking only for the connect call itself; io_uring and the
        // blocking end calls expect a blocking fd.
        let flags = match socket::set_nonblocking(fd, true) {
            Ok(flags) => flags,
            Err(e) => return Err(self.reject(e.into())),
        };
        let rc = unsafe {
            libc::connect(
                fd,
                &self.state.addr as *const _ as *const libc::sockaddr,
                self.state.addr_len,
            )
        };
        let err = (rc < 0).then(SocketError::last_os_error);
        socket::restore_flags(fd, flags);

        let attempt = match err {
            None => Attempt::Done(0),
            Some(e) if e.code() == libc::EINPROGRESS || e.code() == libc::EINTR => Attempt::Defer(
                opcode::PollAdd::new(types::Fd(fd), libc::POLLOUT as u32).build(),
            ),
            Some(e) => Attempt::Refused(e),
        };
        self.issue(port, attempt)
    }

    /// Accept one connection on `listener`. Always deferred to the port.
    pub fn accept_async(
        mut self,
        port: &PortHandle,
        listener: &Arc<OwnedFd>,
        callback: AcceptCallback,
    ) -> Result<(), Rejected> {
        self.state.last_op = Some(OpKind::Accept);
        self.state.socket = Some(Arc::clone(listener));
        self.state.addr_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        self.state.armed = Some(Armed::Accept(callback));

        let entry = opcode::Accept::new(
            types::Fd(listener.as_raw_fd()),
            &mut self.state.addr as *mut _ as *mut libc::sockaddr,
            &mut self.state.addr_len,
        )
        .flags(libc::SOCK_CLOEXEC)
        .build();
        self.issue(port, Attempt::Defer(entry))
    }

    fn bind_region(
        &mut self,
        kind: OpKind,
        socket: &Arc<OwnedFd>,
        buf: Vec<u8>,
        offset: usize,
        size: usize,
    ) {
        let s = &mut *self.state;
        s.last_op = Some(kind);
        s.socket = Some(Arc::clone(socket));
        s.buffer = Some(buf);
        s.offset = offset;
        s.size = size;
    }

    /// Start of the bound region. Stable while the buffer stays bound: the
    /// `Vec` may move with the state but its heap block does not.
    fn region_ptr(&mut self) -> *mut u8 {
        match self.state.buffer.as_mut() {
            Some(buf) => unsafe { buf.as_mut_ptr().add(self.state.offset) },
            None => std::ptr::null_mut(),
        }
    }

    fn reject(mut self, error: Error) -> Rejected {
        self.state.armed = None;
        Rejected { op: self, error }
    }

    fn issue(self, port: &PortHandle, attempt: Attempt) -> Result<(), Rejected> {
        match attempt {
            Attempt::Done(result) => {
                self.complete(result);
                Ok(())
            }
            Attempt::Refused(err) => Err(self.reject(err.into())),
            Attempt::Defer(entry) => {
                let token = self.token();
                let entry = entry.user_data(token.0);
                let raw = self.into_token();
                // Safety: `raw` was produced from this operation just above.
                match unsafe { port.submit(raw, entry) } {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        // Safety: the port refused the entry, so nothing
                        // else holds the token.
                        let op = unsafe { Self::from_token(raw) };
                        Err(op.reject(e))
                    }
                }
            }
        }
    }

    /// Leak the state; its address becomes the in-flight token.
    fn into_token(self) -> Token {
        Token(Box::into_raw(self.state) as u64)
    }

    /// Rebuild an operation from an in-flight token.
    ///
    /// # Safety
    ///
    /// `token` must come from `into_token` and must not be used again.
    pub(crate) unsafe fn from_token(token: Token) -> Self {
        Self { state: Box::from_raw(token.0 as *mut OpState) }
    }

    /// Deliver a kernel-style result (`>= 0` value, `< 0` errno) to the armed
    /// callback. Runs at most once per issue: the callback is taken out of
    /// its slot first.
    pub(crate) fn complete(mut self, result: i32) {
        let Some(armed) = self.state.armed.take() else {
            tracing::warn!(token = self.token().0, "completion for an unarmed operation");
            return;
        };
        match (self.state.last_op, armed) {
            (Some(OpKind::Read), Armed::Read(cb)) => cb(self, to_count(result)),
            (Some(OpKind::Write), Armed::Write(cb)) => cb(self, to_count(result)),
            (Some(OpKind::Connect), Armed::Connect(cb)) => {
                let outcome = match SocketError::from_result(result) {
                    Some(e) => Err(e),
                    None => self.connected_fd().map_or(Ok(()), socket::take_socket_error),
                };
                cb(self, outcome)
            }
            (Some(OpKind::Accept), Armed::Accept(cb)) => {
                let outcome = match SocketError::from_result(result) {
                    Some(e) => Err(e),
                    None => Ok(unsafe { TcpStream::from_raw_fd(result) }),
                };
                cb(self, outcome)
            }
            (kind, _) => {
                tracing::warn!(
                    last_op = kind.map(|k| k.as_str()),
                    "completion does not match the armed callback, dropped"
                );
            }
        }
    }

    fn connected_fd(&self) -> Option<RawFd> {
        self.state.socket.as_ref().map(|s| s.as_raw_fd())
    }
}

impl Default for CompletionOperation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompletionOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionOperation")
            .field("token", &self.token())
            .field("last_op", &self.state.last_op)
            .field("armed", &self.is_armed())
            .field("offset", &self.state.offset)
            .field("size", &self.state.size)
            .finish()
    }
}

fn check_region(buf: Option<&[u8]>, offset: usize, size: usize) -> Result<(), Error> {
    let len = buf.map_or(0, <[u8]>::len);
    if offset > len || size > len - offset {
        return Err(Error::InvalidArgument("buffer region out of range"));
    }
    if size > u32::MAX as usize {
        return Err(Error::InvalidArgument("region larger than u32::MAX"));
    }
    Ok(())
}

/// Sort an immediate read/write failure into defer, refuse or complete.
fn classify(err: SocketError, deferred: impl FnOnce() -> squeue::Entry) -> Attempt {
    if err.would_block() {
        Attempt::Defer(deferred())
    } else if err.is_bad_socket_state() {
        Attempt::Refused(err)
    } else {
        Attempt::Done(-err.code())
    }
}

fn to_count(result: i32) -> Result<usize, SocketError> {
    match SocketError::from_result(result) {
        Some(e) => Err(e),
        None => Ok(result as usize),
    }
}
