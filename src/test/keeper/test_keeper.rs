//! Checks of the keeper handshake between independent processes.

use std::time::Duration;

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult};

use pidsentry::sentry::pidserver::PidServer;
use pidsentry::sentry::signature::PidSignature;
use pidsentry::utility::fd;
use pidsentry::utility::socket::UnixSocket;
use pidsentry::utility::time::Deadline;
use test_utils::{check, named_tests, run_tests, TestFn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Service the server until the expected number of clients is registered.
fn serve_until(server: &mut PidServer, clients: usize) -> Result<(), String> {
    let deadline = std::time::Instant::now() + HANDSHAKE_TIMEOUT;
    while server.client_count() < clients {
        if std::time::Instant::now() > deadline {
            return Err("timed out waiting for keeper clients".to_string());
        }
        if check(fd::wait_read_ready(
            server.listener_fd(),
            Some(Duration::from_millis(50)),
        ))? {
            check(server.accept().map_err(|err| format!("{err:#}")))?;
        }
    }
    Ok(())
}

/// A client from a different process authenticates, holds its reference, and
/// the reference is released when the client exits.
fn test_cross_process_reference() -> Result<(), String> {
    let mut server = check(PidServer::new(getpid()))?;
    let name = server.abstract_name().to_vec();
    let expected = check(PidSignature::new(getpid(), None))?;

    let client = match check(unsafe { fork() })? {
        ForkResult::Child => {
            let result = (|| -> Result<(), String> {
                let client = check(UnixSocket::connect_abstract(&name))?;
                check(client.wait_write_ready(Some(HANDSHAKE_TIMEOUT)))?;

                let mut deadline = Deadline::new(Some(HANDSHAKE_TIMEOUT));
                check(expected.send(client.fd(), &mut deadline))?;

                check(client.wait_read_ready(Some(HANDSHAKE_TIMEOUT)))?;
                let mut ack = [1u8; 1];
                if check(fd::read_fd(client.fd(), &mut ack))? != 1 || ack[0] != 0 {
                    return Err("missing acknowledgement".to_string());
                }

                // Hold the reference briefly, then exit to release it.
                std::thread::sleep(Duration::from_millis(100));
                Ok(())
            })();
            let code = match result {
                Ok(()) => 0,
                Err(msg) => {
                    eprintln!("client failed: {msg}");
                    1
                }
            };
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => child,
    };

    serve_until(&mut server, 1)?;

    // The reference drops when the client process exits.
    match check(waitpid(client, None))? {
        WaitStatus::Exited(_, 0) => {}
        status => return Err(format!("client reported {status:?}")),
    }

    test_utils::wait_until(HANDSHAKE_TIMEOUT, || {
        matches!(server.clean(), Ok(true))
    })?;
    if server.client_count() != 0 {
        return Err("reference not released".to_string());
    }
    Ok(())
}

/// A client expecting a different child is rejected without an ack.
fn test_stale_client_is_rejected() -> Result<(), String> {
    let mut server = check(PidServer::new(getpid()))?;
    let name = server.abstract_name().to_vec();
    let stale = check(PidSignature::new(getpid(), Some("recycled-boot:777")))?;

    let client = check(UnixSocket::connect_abstract(&name))?;
    check(client.wait_write_ready(Some(HANDSHAKE_TIMEOUT)))?;
    let mut deadline = Deadline::new(Some(HANDSHAKE_TIMEOUT));
    check(stale.send(client.fd(), &mut deadline))?;

    check(fd::wait_read_ready(
        server.listener_fd(),
        Some(HANDSHAKE_TIMEOUT),
    ))?;
    check(server.accept().map_err(|err| format!("{err:#}")))?;

    if server.client_count() != 0 {
        return Err("stale client was registered".to_string());
    }

    // The server hangs up instead of acknowledging.
    check(client.wait_read_ready(Some(HANDSHAKE_TIMEOUT)))?;
    let mut ack = [0u8; 1];
    match check(fd::read_fd(client.fd(), &mut ack))? {
        0 => Ok(()),
        _ => Err("stale client was acknowledged".to_string()),
    }
}

fn main() {
    let tests: Vec<(&str, TestFn)> = vec![
        (
            "cross_process_reference",
            Box::new(test_cross_process_reference),
        ),
        (
            "stale_client_is_rejected",
            Box::new(test_stale_client_is_rejected),
        ),
    ];

    let tests = named_tests(tests);
    if run_tests(tests.iter().map(|(n, t)| (n, t)), true).is_err() {
        std::process::exit(1);
    }
}
