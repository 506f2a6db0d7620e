//! Operation kinds, correlation tokens and completion entries.
//!
//! These are the *lingua franca* between the reactor, the operation pool and
//! the stream/server façades.

/// Which kind of socket operation an operation object last issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Connect,
    Read,
    Write,
    Accept,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Connect => "connect",
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::Accept => "accept",
        }
    }
}

/// Correlation token stored in io_uring's `user_data`.
///
/// For socket operations this is the address of the operation's pinned
/// state block, so a completion routes back to its operation without a
/// lookup. The top of the range is reserved for reactor-internal entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Token(pub u64);

impl Token {
    /// The reactor's own eventfd poll.
    pub const WAKE: Self = Self(u64::MAX);
    /// Completions of `AsyncCancel` requests.
    pub const CANCEL: Self = Self(u64::MAX - 1);

    /// True for tokens that belong to an operation rather than the reactor.
    #[inline]
    pub fn is_operation(self) -> bool {
        self.0 != 0 && self.0 < Self::CANCEL.0
    }
}

/// A completed operation as reaped from the completion queue.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub token: Token,
    /// Result (bytes, fd, poll mask) or negative errno.
    pub result: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_tokens_are_not_operations() {
        assert!(!Token::WAKE.is_operation());
        assert!(!Token::CANCEL.is_operation());
        assert!(!Token(0).is_operation());
        assert!(Token(0x7f00_dead_b000).is_operation());
    }
}
