use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::atomic::{AtomicBool, Ordering},
};

/// Self-pipe used to wake a reactor thread from another thread.
///
/// The read end is non-blocking and meant to be registered for `Read`
/// interest in a `Looper`; the write end is a thread-safe "ring the
/// doorbell" handle. Wakeups are coalesced: `notify` only writes a byte when
/// `empty` transitions from `true` to `false`, so a burst of `notify` calls
/// while the reactor hasn't drained yet costs a single byte, matching the
/// eventfd-style wake coalescing spec.md §4.3 calls for.
pub struct Pipe {
    read_fd: OwnedFd,
    write_fd: OwnedFd,
    /// `true` means the reactor's inbox is believed empty and the next
    /// `notify` must write a wakeup byte; flipped back to `true` only once
    /// the consumer has observed an empty queue (see `WorkThread`).
    empty: AtomicBool,
}

impl Pipe {
    pub fn new() -> io::Result<Self> {
        let (read_fd, write_fd) = new_nonblocking_pair()?;
        Ok(Pipe { read_fd, write_fd, empty: AtomicBool::new(true) })
    }

    pub fn read_port(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }

    pub fn write_port(&self) -> RawFd {
        self.write_fd.as_raw_fd()
    }

    /// Write a single wakeup byte iff the pipe was previously believed
    /// drained. Call this immediately after publishing work the reactor
    /// thread should pick up.
    pub fn notify(&self) {
        if self.empty.compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
            let byte = [0u8];
            unsafe {
                libc::write(self.write_fd.as_raw_fd(), byte.as_ptr().cast(), 1);
            }
        }
    }

    /// Mark the pipe as drained again. Called by the consumer after it has
    /// observed its inbox empty; spec.md §4.6 requires a re-check afterward
    /// in case a producer's `notify` raced the observation.
    pub fn mark_drained(&self) {
        self.empty.store(true, Ordering::Release);
    }

    /// Write `bytes` to the write end. Used by `Packet::build_from_pipe`
    /// test fixtures and by anything that treats the pipe as a plain byte
    /// stream rather than a pure wakeup signal.
    pub fn write(&self, bytes: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.write_fd.as_raw_fd(), bytes.as_ptr().cast(), bytes.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Read up to `buf.len()` bytes from the read end.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.read_fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(n as usize)
    }

    /// Drain every byte currently sitting in the read end. Must be called
    /// from the reactor thread on read-readiness before consuming the
    /// wakeup; otherwise a coalesced byte is left for the next `read`.
    pub fn drain(&self) -> io::Result<usize> {
        let mut total = 0usize;
        let mut scratch = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(self.read_fd.as_raw_fd(), scratch.as_mut_ptr().cast(), scratch.len())
            };
            if n > 0 {
                total += n as usize;
                if (n as usize) < scratch.len() {
                    return Ok(total);
                }
            } else if n == 0 {
                return Ok(total);
            } else {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Ok(total);
                }
                return Err(err);
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn new_nonblocking_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// Platforms without `pipe2` (e.g. macOS): fall back to `pipe` plus explicit
/// `O_NONBLOCK`/`FD_CLOEXEC` flag juggling, matching the C++ source's
/// fallback path.
#[cfg(all(unix, not(target_os = "linux")))]
fn new_nonblocking_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    for &fd in &fds {
        set_nonblocking_cloexec(fd)?;
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Windows has no `pipe(2)`; synthesise the same non-blocking duplex
/// primitive from a loopback TCP socketpair, exactly as spec.md §4.3
/// prescribes: bind ephemeral, listen, connect, accept, drop the listener.
#[cfg(windows)]
fn new_nonblocking_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    use std::net::{TcpListener, TcpStream};
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let write_side = TcpStream::connect(addr)?;
    let (read_side, _) = listener.accept()?;
    drop(listener);
    read_side.set_nonblocking(true)?;
    write_side.set_nonblocking(true)?;
    use std::os::windows::io::{AsRawSocket, FromRawSocket};
    unsafe {
        let read_fd = OwnedFd::from_raw_fd(read_side.as_raw_socket() as RawFd);
        std::mem::forget(read_side);
        let write_fd = OwnedFd::from_raw_fd(write_side.as_raw_socket() as RawFd);
        std::mem::forget(write_side);
        Ok((read_fd, write_fd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_then_drain_coalesces_bursts() {
        let pipe = Pipe::new().unwrap();
        pipe.notify();
        pipe.notify();
        pipe.notify();
        let n = pipe.drain().unwrap();
        assert_eq!(n, 1, "a burst of notifies before any drain should coalesce to one byte");
    }

    #[test]
    fn mark_drained_allows_next_notify_to_write() {
        let pipe = Pipe::new().unwrap();
        pipe.notify();
        assert_eq!(pipe.drain().unwrap(), 1);
        pipe.mark_drained();
        pipe.notify();
        assert_eq!(pipe.drain().unwrap(), 1);
    }

    #[test]
    fn drain_on_empty_pipe_returns_zero() {
        let pipe = Pipe::new().unwrap();
        assert_eq!(pipe.drain().unwrap(), 0);
    }
}
