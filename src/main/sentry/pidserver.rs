//! The keeper: a unix-socket server whose connections are live references to
//! the child's process group.
//!
//! The pidfile advertises the server's abstract address. A client that wants
//! the child's process group to stay reserved connects, authenticates itself
//! with the signature of the child it expects, and simply keeps the
//! connection open. The server runs in the umbilical process, so references
//! outlive the watchdog.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use anyhow::Context;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::unistd::Pid;

use crate::sentry::signature::PidSignature;
use crate::utility::socket::UnixSocket;
use crate::utility::time::Deadline;

/// How long a connecting client gets to present its signature.
const CLIENT_SIGNATURE_TIMEOUT: Duration = Duration::from_secs(30);

struct Client {
    socket: UnixSocket,
    uid: libc::uid_t,
    pid: libc::pid_t,
}

pub struct PidServer {
    socket: UnixSocket,
    name: Vec<u8>,
    expected: PidSignature,
    epoll: Epoll,
    clients: HashMap<u64, Client>,
    next_slot: u64,
}

impl PidServer {
    /// Bind an autonamed abstract socket serving references to `child_pid`'s
    /// process group.
    pub fn new(child_pid: Pid) -> anyhow::Result<Self> {
        let expected = PidSignature::new(child_pid, None)
            .context("Cannot construct signature for child process")?;
        log::debug!("create pid server for {expected}");

        let socket = UnixSocket::listen_abstract().context("Cannot bind keeper socket")?;
        let name = socket
            .abstract_name()
            .context("Cannot fetch keeper socket name")?;

        let epoll =
            Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).context("Cannot create event queue")?;

        Ok(Self {
            socket,
            name,
            expected,
            epoll,
            clients: HashMap::new(),
            next_slot: 1,
        })
    }

    /// The abstract-namespace name, without the leading NUL.
    pub fn abstract_name(&self) -> &[u8] {
        &self.name
    }

    /// The listener descriptor, for inclusion in the owner's poll set.
    pub fn listener_fd(&self) -> RawFd {
        self.socket.fd()
    }

    /// The event-queue descriptor; readable when a client needs attention.
    pub fn queue_fd(&self) -> RawFd {
        self.epoll.0.as_raw_fd()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Accept and authenticate one pending connection. A client that fails
    /// authentication is logged and dropped; only resource-level failures
    /// surface as errors.
    pub fn accept(&mut self) -> anyhow::Result<()> {
        let client = match self.socket.accept() {
            Ok(socket) => socket,
            Err(nix::errno::Errno::EAGAIN) => return Ok(()),
            Err(errno) => return Err(errno).context("Unable to accept connection"),
        };

        let cred = client
            .peer_credentials()
            .context("Cannot fetch peer credentials")?;

        // Only the supervising user, or root, may take a reference.
        if cred.uid() != nix::unistd::geteuid().as_raw() && cred.uid() != 0 {
            log::warn!(
                "Discarding connection from uid {} pid {}",
                cred.uid(),
                cred.pid()
            );
            return Ok(());
        }

        let mut deadline = Deadline::new(Some(CLIENT_SIGNATURE_TIMEOUT));
        let signature = match PidSignature::recv(client.fd(), &mut deadline) {
            Ok(signature) => signature,
            Err(err) => {
                log::warn!("Discarding connection from pid {}: {}", cred.pid(), err);
                return Ok(());
            }
        };

        // A stale client read an address from a pidfile that no longer
        // matches this child; the signature exposes it.
        if self.expected.rank(&signature) != std::cmp::Ordering::Equal {
            log::warn!("Discarding connection for {signature}");
            return Ok(());
        }

        let mut deadline = Deadline::new(Some(CLIENT_SIGNATURE_TIMEOUT));
        if let Err(err) = crate::utility::fd::write_fd_deadline(client.fd(), &[0u8], &mut deadline)
        {
            log::warn!("Discarding unacknowledgeable connection: {err}");
            return Ok(());
        }

        let slot = self.next_slot;
        self.next_slot += 1;

        // Watch for the connection to close; any readiness on an
        // authenticated connection is treated as a disconnect.
        self.epoll
            .add(
                &client,
                EpollEvent::new(
                    EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP,
                    slot,
                ),
            )
            .context("Cannot watch keeper connection")?;

        log::debug!("add reference from uid {} pid {}", cred.uid(), cred.pid());
        self.clients.insert(
            slot,
            Client {
                socket: client,
                uid: cred.uid(),
                pid: cred.pid(),
            },
        );
        Ok(())
    }

    /// Discard connections whose peers have gone away. Non-blocking and
    /// idempotent; returns true when no references remain.
    pub fn clean(&mut self) -> anyhow::Result<bool> {
        let mut events = [EpollEvent::empty(); 16];
        loop {
            let count = match self.epoll.wait(&mut events, EpollTimeout::ZERO) {
                Ok(count) => count,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(errno) => return Err(errno).context("Cannot poll keeper connections"),
            };
            if count == 0 {
                break;
            }
            for event in &events[..count] {
                let slot = event.data();
                if let Some(client) = self.clients.remove(&slot) {
                    log::debug!("drop reference from uid {} pid {}", client.uid, client.pid);
                    let _ = self.epoll.delete(&client.socket);
                }
            }
        }
        Ok(self.clients.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;
    use std::os::unix::io::AsRawFd;

    fn connect_and_authenticate(server: &PidServer, signature: &PidSignature) -> UnixSocket {
        let client = UnixSocket::connect_abstract(server.abstract_name()).unwrap();
        assert!(client
            .wait_write_ready(Some(Duration::from_secs(5)))
            .unwrap());
        let mut deadline = Deadline::new(Some(Duration::from_secs(5)));
        signature.send(client.fd(), &mut deadline).unwrap();
        client
    }

    fn read_ack(client: &UnixSocket) -> Option<u8> {
        assert!(client.wait_read_ready(Some(Duration::from_secs(5))).unwrap());
        let mut buf = [0u8; 1];
        match crate::utility::fd::read_fd(client.fd(), &mut buf) {
            Ok(1) => Some(buf[0]),
            _ => None,
        }
    }

    #[test]
    fn authenticated_client_is_acknowledged_and_tracked() {
        let mut server = PidServer::new(getpid()).unwrap();
        let signature = PidSignature::new(getpid(), None).unwrap();

        let client = connect_and_authenticate(&server, &signature);
        assert!(server
            .socket
            .wait_read_ready(Some(Duration::from_secs(5)))
            .unwrap());
        server.accept().unwrap();
        assert_eq!(server.client_count(), 1);

        assert_eq!(read_ack(&client), Some(0));

        // Still connected; nothing to clean.
        assert!(!server.clean().unwrap());
        assert_eq!(server.client_count(), 1);

        // Dropping the client releases the reference.
        drop(client);
        assert!(crate::utility::fd::wait_read_ready(
            server.queue_fd(),
            Some(Duration::from_secs(5))
        )
        .unwrap());
        assert!(server.clean().unwrap());
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn mismatched_signature_is_dropped() {
        let mut server = PidServer::new(getpid()).unwrap();
        let wrong = PidSignature::new(getpid(), Some("someone:else")).unwrap();

        let client = connect_and_authenticate(&server, &wrong);
        assert!(server
            .socket
            .wait_read_ready(Some(Duration::from_secs(5)))
            .unwrap());
        server.accept().unwrap();
        assert_eq!(server.client_count(), 0);

        // The server closed the connection without an acknowledgement.
        assert_eq!(read_ack(&client), None);
    }

    #[test]
    fn clean_with_no_clients_reports_empty() {
        let mut server = PidServer::new(getpid()).unwrap();
        assert!(server.clean().unwrap());
        assert!(server.clean().unwrap());
    }
}
