//! Pipes, the event self-pipe, and standard-descriptor occupation.

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd;

use crate::utility::fd;

/// A unidirectional pipe with independently closable ends.
#[derive(Debug)]
pub struct Pipe {
    reader: Option<OwnedFd>,
    writer: Option<OwnedFd>,
}

impl Pipe {
    pub fn new(flags: OFlag) -> nix::Result<Self> {
        let (reader, writer) = unistd::pipe2(flags)?;
        Ok(Self {
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    pub fn reader_fd(&self) -> RawFd {
        self.reader.as_ref().expect("pipe reader closed").as_raw_fd()
    }

    pub fn writer_fd(&self) -> RawFd {
        self.writer.as_ref().expect("pipe writer closed").as_raw_fd()
    }

    pub fn close_reader(&mut self) {
        self.reader = None;
    }

    pub fn close_writer(&mut self) {
        self.writer = None;
    }

    pub fn take_reader(&mut self) -> Option<OwnedFd> {
        self.reader.take()
    }
}

/// A self-pipe used to wake a poll loop. Raising writes one byte; draining
/// consumes everything pending.
#[derive(Debug)]
pub struct EventPipe {
    pipe: Pipe,
}

impl EventPipe {
    pub fn new() -> nix::Result<Self> {
        Ok(Self {
            pipe: Pipe::new(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?,
        })
    }

    pub fn reader_fd(&self) -> RawFd {
        self.pipe.reader_fd()
    }

    /// Wake the poller. A full pipe already carries a pending wakeup, so
    /// EAGAIN is success.
    pub fn raise(&self) -> nix::Result<()> {
        match fd::write_fd(self.pipe.writer_fd(), &[0u8]) {
            Ok(_) | Err(Errno::EAGAIN) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Consume pending wakeups, reporting whether there were any.
    pub fn drain(&self) -> nix::Result<bool> {
        let mut buf = [0u8; 64];
        let mut drained = false;
        loop {
            match fd::read_fd(self.pipe.reader_fd(), &mut buf) {
                Ok(0) => break,
                Ok(_) => drained = true,
                Err(Errno::EAGAIN) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(drained)
    }
}

/// Occupies the lowest descriptors with `/dev/null` so that stdin, stdout and
/// stderr cannot be claimed by unrelated opens.
#[derive(Debug)]
pub struct StdFdFiller {
    fillers: Vec<OwnedFd>,
}

impl StdFdFiller {
    pub fn new() -> nix::Result<Self> {
        let mut fillers = Vec::new();
        loop {
            let fd = nix::fcntl::open("/dev/null", OFlag::O_RDWR, Mode::empty())?;
            if fd > 2 {
                // All of fds 0..=2 are now occupied; this extra one is not
                // needed.
                let _ = unistd::close(fd);
                break;
            }
            fillers.push(unsafe { OwnedFd::from_raw_fd(fd) });
        }
        Ok(Self { fillers })
    }

    /// The descriptors held by the filler.
    pub fn fds(&self) -> Vec<RawFd> {
        self.fillers.iter().map(|fd| fd.as_raw_fd()).collect()
    }
}
