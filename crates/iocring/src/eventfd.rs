//! `EventFdNotifier`, the default `Notifier` implementation.
//!
//! Submitters write to an eventfd; the reactor keeps a one-shot `PollAdd`
//! armed on it, so a write turns into a CQE that pops the reactor out of
//! `io_uring_enter`. Multiple `notify()` calls before the reactor drains the
//! counter collapse into a single wakeup.

use iocring_core::error::{Error, Result};
use iocring_core::notifier::Notifier;

use std::os::unix::io::{AsRawFd, RawFd};

pub struct EventFdNotifier {
    fd: RawFd,
}

impl EventFdNotifier {
    /// Create a new non-blocking eventfd. Closed on drop.
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Setup(nix::errno::Errno::last() as i32));
        }
        Ok(Self { fd })
    }
}

impl AsRawFd for EventFdNotifier {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Notifier for EventFdNotifier {
    fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = nix::errno::Errno::last() as i32;
            // EAGAIN: counter saturated, a wakeup is already pending.
            if errno == libc::EAGAIN {
                return Ok(());
            }
            return Err(Error::Setup(errno));
        }
        Ok(())
    }

    fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl Drop for EventFdNotifier {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd); }
            self.fd = -1;
        }
    }
}
