//! Socket pairs, the fork rendezvous bell, and abstract-namespace sockets.

use std::os::unix::io::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{
    accept4, bind, connect, getsockname, getsockopt, listen, socket, socketpair, sockopt,
    AddressFamily, Backlog, SockFlag, SockType, UnixAddr, UnixCredentials,
};

use crate::utility::fd;

/// A connected pair of unix stream sockets, one end for each side of a fork.
#[derive(Debug)]
pub struct SocketPair {
    parent: Option<OwnedFd>,
    child: Option<OwnedFd>,
}

impl SocketPair {
    pub fn new(flags: SockFlag) -> nix::Result<Self> {
        let (parent, child) = socketpair(AddressFamily::Unix, SockType::Stream, None, flags)?;
        Ok(Self {
            parent: Some(parent),
            child: Some(child),
        })
    }

    pub fn parent_fd(&self) -> RawFd {
        self.parent.as_ref().expect("parent end closed").as_raw_fd()
    }

    pub fn child_fd(&self) -> RawFd {
        self.child.as_ref().expect("child end closed").as_raw_fd()
    }

    pub fn close_parent(&mut self) {
        self.parent = None;
    }

    pub fn close_child(&mut self) {
        self.child = None;
    }
}

/// The rendezvous used to sequence a fork: each side can ring its end and
/// wait for the other side's ring. EOF during a wait reports EPIPE so the
/// caller can tell a dead peer from a rung bell.
#[derive(Debug)]
pub struct BellSocketPair {
    pair: SocketPair,
}

impl BellSocketPair {
    pub fn new() -> nix::Result<Self> {
        Ok(Self {
            pair: SocketPair::new(SockFlag::SOCK_CLOEXEC)?,
        })
    }

    pub fn parent_fd(&self) -> RawFd {
        self.pair.parent_fd()
    }

    pub fn child_fd(&self) -> RawFd {
        self.pair.child_fd()
    }

    pub fn close_parent(&mut self) {
        self.pair.close_parent();
    }

    pub fn close_child(&mut self) {
        self.pair.close_child();
    }

    pub fn ring_parent(&self) -> nix::Result<()> {
        ring(self.pair.parent_fd())
    }

    pub fn wait_parent(&self) -> nix::Result<()> {
        wait(self.pair.parent_fd())
    }

    pub fn ring_child(&self) -> nix::Result<()> {
        ring(self.pair.child_fd())
    }

    pub fn wait_child(&self) -> nix::Result<()> {
        wait(self.pair.child_fd())
    }
}

fn ring(fd: RawFd) -> nix::Result<()> {
    fd::write_all_fd(fd, &[0u8])
}

fn wait(fd: RawFd) -> nix::Result<()> {
    let mut buf = [0u8; 1];
    match fd::read_fd(fd, &mut buf)? {
        0 => Err(Errno::EPIPE),
        _ => Ok(()),
    }
}

/// A unix-domain stream socket in the abstract namespace.
#[derive(Debug)]
pub struct UnixSocket {
    fd: OwnedFd,
}

impl UnixSocket {
    /// Bind a listener with a kernel-assigned abstract name.
    pub fn listen_abstract() -> nix::Result<Self> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        // Binding an unnamed address triggers Linux autobind, which chooses a
        // unique abstract-namespace name.
        bind(fd.as_raw_fd(), &UnixAddr::new_unnamed())?;
        listen(&fd, Backlog::new(16)?)?;
        Ok(Self { fd })
    }

    /// The autobound abstract name, without the leading NUL byte.
    pub fn abstract_name(&self) -> nix::Result<Vec<u8>> {
        let addr: UnixAddr = getsockname(self.fd.as_raw_fd())?;
        addr.as_abstract().map(<[u8]>::to_vec).ok_or(Errno::EINVAL)
    }

    /// Accept one pending connection.
    pub fn accept(&self) -> nix::Result<UnixSocket> {
        let fd = accept4(
            self.fd.as_raw_fd(),
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )?;
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Connect to an abstract name. The socket is non-blocking, so the
    /// connection may still be in progress on return; wait for writability
    /// before using it.
    pub fn connect_abstract(name: &[u8]) -> nix::Result<Self> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        let addr = UnixAddr::new_abstract(name)?;
        match connect(fd.as_raw_fd(), &addr) {
            Ok(()) | Err(Errno::EINPROGRESS) => Ok(Self { fd }),
            Err(err) => Err(err),
        }
    }

    pub fn peer_credentials(&self) -> nix::Result<UnixCredentials> {
        getsockopt(&self.fd, sockopt::PeerCredentials)
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn wait_write_ready(&self, timeout: Option<Duration>) -> nix::Result<bool> {
        fd::wait_write_ready(self.fd(), timeout)
    }

    pub fn wait_read_ready(&self, timeout: Option<Duration>) -> nix::Result<bool> {
        fd::wait_read_ready(self.fd(), timeout)
    }
}

impl AsFd for UnixSocket {
    fn as_fd(&self) -> std::os::unix::io::BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bell_rings_in_both_directions() {
        let bell = BellSocketPair::new().unwrap();
        bell.ring_parent().unwrap();
        bell.wait_child().unwrap();
        bell.ring_child().unwrap();
        bell.wait_parent().unwrap();
    }

    #[test]
    fn bell_wait_reports_peer_loss() {
        let mut bell = BellSocketPair::new().unwrap();
        bell.close_parent();
        assert_eq!(bell.wait_child(), Err(Errno::EPIPE));
    }

    #[test]
    fn abstract_listener_round_trip() {
        let server = UnixSocket::listen_abstract().unwrap();
        let name = server.abstract_name().unwrap();
        assert!(!name.is_empty());

        let client = UnixSocket::connect_abstract(&name).unwrap();
        assert!(client.wait_write_ready(Some(Duration::from_secs(5))).unwrap());

        assert!(server.wait_read_ready(Some(Duration::from_secs(5))).unwrap());
        let accepted = server.accept().unwrap();

        let cred = accepted.peer_credentials().unwrap();
        assert_eq!(cred.pid(), nix::unistd::getpid().as_raw());
        assert_eq!(cred.uid(), nix::unistd::geteuid().as_raw());
    }

    #[test]
    fn connect_to_stale_name_fails() {
        let name = {
            let server = UnixSocket::listen_abstract().unwrap();
            server.abstract_name().unwrap()
        };
        // The listener is gone; the kernel refuses the connection.
        match UnixSocket::connect_abstract(&name) {
            Err(Errno::ECONNREFUSED) => {}
            Ok(client) => {
                // A non-blocking connect may surface the refusal later.
                client
                    .wait_write_ready(Some(Duration::from_secs(5)))
                    .unwrap();
                let mut buf = [0u8; 1];
                assert!(fd::read_fd(client.fd(), &mut buf).is_err());
            }
            Err(err) => panic!("unexpected error {err}"),
        }
    }
}
