//! File-descriptor helpers.
//!
//! Transient errors are handled here so callers never see EINTR: plain reads
//! and writes retry, and the deadline variants fold readiness waits into a
//! [`Deadline`] so a stalled peer surfaces as ETIMEDOUT instead of a hang.

use std::os::unix::io::{BorrowedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{self, FcntlArg, FdFlag, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd;

use crate::utility::time::Deadline;

fn borrow(fd: RawFd) -> BorrowedFd<'static> {
    // The callers in this module use the fd strictly for the duration of one
    // syscall; the 'static lifetime never escapes.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

pub fn set_cloexec(fd: RawFd, enabled: bool) -> nix::Result<()> {
    let mut flags = FdFlag::from_bits_retain(fcntl::fcntl(fd, FcntlArg::F_GETFD)?);
    flags.set(FdFlag::FD_CLOEXEC, enabled);
    fcntl::fcntl(fd, FcntlArg::F_SETFD(flags))?;
    Ok(())
}

pub fn set_nonblocking(fd: RawFd, enabled: bool) -> nix::Result<()> {
    let mut flags = OFlag::from_bits_retain(fcntl::fcntl(fd, FcntlArg::F_GETFL)?);
    flags.set(OFlag::O_NONBLOCK, enabled);
    fcntl::fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

pub fn is_nonblocking(fd: RawFd) -> nix::Result<bool> {
    let flags = OFlag::from_bits_retain(fcntl::fcntl(fd, FcntlArg::F_GETFL)?);
    Ok(flags.contains(OFlag::O_NONBLOCK))
}

/// Whether the descriptor refers to an open file.
pub fn is_valid(fd: RawFd) -> bool {
    fcntl::fcntl(fd, FcntlArg::F_GETFL).is_ok()
}

/// Read, retrying on EINTR. Returns 0 at end of file.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
    loop {
        match unistd::read(fd, buf) {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// Write, retrying on EINTR.
pub fn write_fd(fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
    loop {
        match unistd::write(borrow(fd), buf) {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// Write the whole buffer, retrying on EINTR and short writes.
pub fn write_all_fd(fd: RawFd, buf: &[u8]) -> nix::Result<()> {
    let mut offset = 0;
    while offset < buf.len() {
        offset += write_fd(fd, &buf[offset..])?;
    }
    Ok(())
}

fn poll_timeout(duration: Option<Duration>) -> PollTimeout {
    match duration {
        None => PollTimeout::NONE,
        Some(duration) => {
            let millis = duration.as_millis().min(i32::MAX as u128) as i32;
            PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
        }
    }
}

fn wait_ready(fd: RawFd, flags: PollFlags, timeout: Option<Duration>) -> nix::Result<bool> {
    loop {
        let borrowed = borrow(fd);
        let mut fds = [PollFd::new(borrowed, flags)];
        match poll(&mut fds, poll_timeout(timeout)) {
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err),
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
        }
    }
}

/// Wait for the descriptor to become readable; `None` blocks indefinitely and
/// a zero duration probes without blocking.
pub fn wait_read_ready(fd: RawFd, timeout: Option<Duration>) -> nix::Result<bool> {
    wait_ready(fd, PollFlags::POLLIN | PollFlags::POLLPRI, timeout)
}

/// Wait for the descriptor to become writable.
pub fn wait_write_ready(fd: RawFd, timeout: Option<Duration>) -> nix::Result<bool> {
    wait_ready(fd, PollFlags::POLLOUT, timeout)
}

/// Fill the buffer, bounding the overall transfer with a deadline. Returns
/// the number of bytes read, which falls short only at end of file.
pub fn read_fd_deadline(fd: RawFd, buf: &mut [u8], deadline: &mut Deadline) -> nix::Result<usize> {
    let mut offset = 0;
    while offset < buf.len() {
        let ready = deadline.check(
            || wait_read_ready(fd, Some(Duration::ZERO)),
            |remaining| wait_read_ready(fd, remaining),
        )?;
        if !ready {
            continue;
        }
        match unistd::read(fd, &mut buf[offset..]) {
            Ok(0) => break,
            Ok(count) => offset += count,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(offset)
}

/// Drain the buffer into the descriptor, bounding the overall transfer with a
/// deadline.
pub fn write_fd_deadline(fd: RawFd, buf: &[u8], deadline: &mut Deadline) -> nix::Result<usize> {
    let mut offset = 0;
    while offset < buf.len() {
        let ready = deadline.check(
            || wait_write_ready(fd, Some(Duration::ZERO)),
            |remaining| wait_write_ready(fd, remaining),
        )?;
        if !ready {
            continue;
        }
        match unistd::write(borrow(fd), &buf[offset..]) {
            Ok(count) => offset += count,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(offset)
}

/// Bytes immediately available for reading.
pub fn available_bytes(fd: RawFd) -> nix::Result<usize> {
    let mut available: libc::c_int = 0;
    Errno::result(unsafe { libc::ioctl(fd, libc::FIONREAD, &mut available) })?;
    Ok(available as usize)
}

/// Move up to `len` bytes from `from` to `to` without copying through
/// userspace.
pub fn splice_fd(from: RawFd, to: RawFd, len: usize) -> nix::Result<usize> {
    fcntl::splice(
        borrow(from),
        None,
        borrow(to),
        None,
        len,
        fcntl::SpliceFFlags::SPLICE_F_MOVE,
    )
}

/// Replace the descriptor with an open file on `/dev/null`.
pub fn nullify_fd(fd: RawFd) -> nix::Result<()> {
    let null = fcntl::open(
        "/dev/null",
        OFlag::O_RDWR | OFlag::O_CLOEXEC,
        nix::sys::stat::Mode::empty(),
    )?;
    let result = unistd::dup2(null, fd);
    let _ = unistd::close(null);
    result.map(drop)
}
