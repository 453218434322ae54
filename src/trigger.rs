//! Interruptible-wait primitive backing session shutdown.
//!
//! A [`ShutdownTrigger`] is a process-local, one-shot signal built on a
//! self-pipe. Every blocking wait the session core performs polls the pipe's
//! read end alongside the real descriptor; [`ShutdownTrigger::trigger`]
//! closes the write end, so the read end reports hangup to every poller,
//! present and future, and the wait fails promptly with
//! [`Error::Shutdown`].

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{last_errno, Error, Result};

pub struct ShutdownTrigger {
    read_fd: OwnedFd,
    /// Write end of the self-pipe. Dropped on trigger.
    write_fd: Mutex<Option<OwnedFd>>,
    triggered: AtomicBool,
}

impl ShutdownTrigger {
    /// Create a trigger, or `None` if the pipe could not be created.
    pub fn make() -> Option<Arc<ShutdownTrigger>> {
        let mut fds = [0i32; 2];

        #[cfg(any(target_os = "linux", target_os = "android"))]
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };

        if ret < 0 {
            tracing::error!(
                error = %io::Error::last_os_error(),
                "could not create shutdown pipe"
            );
            return None;
        }

        let read_fd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write_fd = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        for fd in [&read_fd, &write_fd] {
            if set_cloexec_nonblocking(fd.as_raw_fd()).is_err() {
                tracing::error!(
                    error = %io::Error::last_os_error(),
                    "could not configure shutdown pipe"
                );
                return None;
            }
        }

        Some(Arc::new(ShutdownTrigger {
            read_fd,
            write_fd: Mutex::new(Some(write_fd)),
            triggered: AtomicBool::new(false),
        }))
    }

    /// Fire the trigger. Idempotent; after this returns, every current and
    /// future interruptible wait on this trigger fails with
    /// [`Error::Shutdown`].
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::Release);
        // Closing the write end hangs up the read end for every poller.
        drop(self.write_fd.lock().take());
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Wait for `events` on `fd` or for the trigger to fire, whichever comes
    /// first. The trigger wins ties.
    pub fn triggerable_poll(&self, fd: BorrowedFd<'_>, events: i16) -> Result<()> {
        if self.is_triggered() {
            return Err(Error::Shutdown);
        }

        let mut pfds = [
            libc::pollfd {
                fd: fd.as_raw_fd(),
                events,
                revents: 0,
            },
            // POLLHUP is delivered regardless of requested events.
            libc::pollfd {
                fd: self.read_fd.as_raw_fd(),
                events: 0,
                revents: 0,
            },
        ];

        loop {
            let ret = unsafe { libc::poll(pfds.as_mut_ptr(), 2, -1) };
            if ret < 0 {
                if last_errno() == libc::EINTR {
                    continue;
                }
                return Err(Error::from_errno());
            }

            if self.is_triggered()
                || pfds[1].revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0
            {
                return Err(Error::Shutdown);
            }
            if pfds[0].revents != 0 {
                return Ok(());
            }
        }
    }

    /// Write the whole buffer to the nonblocking `fd`, waiting via
    /// [`Self::triggerable_poll`] whenever the kernel buffer is full.
    pub fn interruptable_write_fully(&self, fd: BorrowedFd<'_>, buf: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < buf.len() {
            if self.is_triggered() {
                return Err(Error::Shutdown);
            }

            let n = send_some(fd.as_raw_fd(), &buf[offset..]);
            if n > 0 {
                offset += n as usize;
                continue;
            }
            if n == 0 {
                // A zero-length transfer on a stream makes no progress.
                return Err(Error::Unknown);
            }

            match last_errno() {
                libc::EINTR => continue,
                errno if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK => {
                    self.triggerable_poll(fd, libc::POLLOUT)?
                }
                _ => return Err(Error::from_errno()),
            }
        }
        Ok(())
    }

    /// Fill the whole buffer from the nonblocking `fd`. End-of-stream maps to
    /// [`Error::DeadObject`].
    pub fn interruptable_read_fully(&self, fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<()> {
        let mut offset = 0;
        while offset < buf.len() {
            if self.is_triggered() {
                return Err(Error::Shutdown);
            }

            let n = recv_some(fd.as_raw_fd(), &mut buf[offset..]);
            if n > 0 {
                offset += n as usize;
                continue;
            }
            if n == 0 {
                return Err(Error::DeadObject);
            }

            match last_errno() {
                libc::EINTR => continue,
                errno if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK => {
                    self.triggerable_poll(fd, libc::POLLIN)?
                }
                _ => return Err(Error::from_errno()),
            }
        }
        Ok(())
    }
}

/// `send(2)` with `MSG_NOSIGNAL`, falling back to `write(2)` for descriptors
/// that are not sockets (the null-debugging client writes to `/dev/null`).
fn send_some(fd: RawFd, buf: &[u8]) -> isize {
    let n = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if n < 0 && last_errno() == libc::ENOTSOCK {
        return unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    }
    n
}

fn recv_some(fd: RawFd, buf: &mut [u8]) -> isize {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n < 0 && last_errno() == libc::ENOTSOCK {
        return unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    }
    n
}

/// Set both `FD_CLOEXEC` and `O_NONBLOCK` on a descriptor.
pub(crate) fn set_cloexec_nonblocking(fd: RawFd) -> Result<()> {
    let fd_flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if fd_flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) } < 0 {
        return Err(Error::from_errno());
    }
    set_nonblocking(fd)
}

/// Set `O_NONBLOCK` on a descriptor.
pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::from_errno());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::from_errno());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;
    use std::thread;
    use std::time::Duration;

    fn socketpair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(ret, 0, "socketpair should succeed");
        let a = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let b = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        set_cloexec_nonblocking(a.as_raw_fd()).expect("nonblocking");
        set_cloexec_nonblocking(b.as_raw_fd()).expect("nonblocking");
        (a, b)
    }

    #[test]
    fn poll_sees_readable_data() {
        let trigger = ShutdownTrigger::make().expect("trigger");
        let (a, b) = socketpair();
        let n = unsafe { libc::send(b.as_raw_fd(), b"x".as_ptr() as *const _, 1, 0) };
        assert_eq!(n, 1);
        trigger
            .triggerable_poll(a.as_fd(), libc::POLLIN)
            .expect("data is ready");
    }

    #[test]
    fn trigger_is_idempotent_and_sticky() {
        let trigger = ShutdownTrigger::make().expect("trigger");
        assert!(!trigger.is_triggered());
        trigger.trigger();
        trigger.trigger();
        assert!(trigger.is_triggered());

        let (a, _b) = socketpair();
        assert_eq!(
            trigger.interruptable_write_fully(a.as_fd(), b"payload"),
            Err(Error::Shutdown)
        );
    }

    #[test]
    fn trigger_unblocks_pending_read() {
        let trigger = ShutdownTrigger::make().expect("trigger");
        let (a, _b) = socketpair();

        let worker = {
            let trigger = Arc::clone(&trigger);
            thread::spawn(move || {
                let mut buf = [0u8; 8];
                trigger.interruptable_read_fully(a.as_fd(), &mut buf)
            })
        };

        thread::sleep(Duration::from_millis(50));
        trigger.trigger();
        assert_eq!(worker.join().expect("reader exits"), Err(Error::Shutdown));
    }

    #[test]
    fn read_of_closed_peer_is_dead_object() {
        let trigger = ShutdownTrigger::make().expect("trigger");
        let (a, b) = socketpair();
        drop(b);
        let mut buf = [0u8; 4];
        assert_eq!(
            trigger.interruptable_read_fully(a.as_fd(), &mut buf),
            Err(Error::DeadObject)
        );
    }

    #[test]
    fn write_fully_round_trips_across_backpressure() {
        let trigger = ShutdownTrigger::make().expect("trigger");
        let (a, b) = socketpair();

        // Large enough to overflow the kernel socket buffer and exercise the
        // EAGAIN + poll path on both sides.
        let payload: Vec<u8> = (0..1_000_000u32).map(|i| i as u8).collect();

        let writer = {
            let trigger = Arc::clone(&trigger);
            let payload = payload.clone();
            thread::spawn(move || trigger.interruptable_write_fully(a.as_fd(), &payload))
        };

        let mut received = vec![0u8; payload.len()];
        trigger
            .interruptable_read_fully(b.as_fd(), &mut received)
            .expect("read side");
        writer.join().expect("writer exits").expect("write side");
        assert_eq!(received, payload);
    }
}
