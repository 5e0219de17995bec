//! Pid signatures: binding a pid to the incarnation of the process it names.
//!
//! A pid alone is meaningless across reboots and pid reuse. The signature
//! pairs the per-boot identifier with the process start time, so two
//! signatures compare equal only when the pid denotes the same incarnation of
//! the same process.

use std::cmp::Ordering;
use std::io;
use std::os::unix::io::RawFd;

use nix::unistd::Pid;
use once_cell::sync::Lazy;

use crate::utility::fd;
use crate::utility::time::Deadline;

/// Upper bound on a marshalled signature string, including its terminator.
const SIGNATURE_WIRE_MAX: usize = 1024 + 1;

static BOOT_INCARNATION: Lazy<io::Result<String>> = Lazy::new(|| {
    let raw = std::fs::read_to_string("/proc/sys/kernel/random/boot_id")?;
    Ok(raw.trim().to_string())
});

/// The cached per-boot identifier.
pub fn boot_incarnation() -> io::Result<&'static str> {
    match &*BOOT_INCARNATION {
        Ok(incarnation) => Ok(incarnation),
        Err(err) => Err(io::Error::new(err.kind(), "cannot read boot incarnation")),
    }
}

/// A pid qualified by its boot incarnation and start time.
///
/// Sentinel pids survive parsing rather than construction: pid 0 stands for
/// "no such live process" and pid -1 for "malformed"; both carry an empty
/// signature string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidSignature {
    pub pid: Pid,
    pub signature: String,
}

impl PidSignature {
    /// Build a signature for `pid`, reading the process start time unless a
    /// precomputed signature string is supplied. Fails with NotFound when the
    /// process does not exist.
    pub fn new(pid: Pid, signature: Option<&str>) -> io::Result<Self> {
        let signature = match signature {
            Some(signature) => signature.to_string(),
            None if pid.as_raw() > 0 => fetch_signature(pid)?,
            None => String::new(),
        };
        Ok(Self { pid, signature })
    }

    /// Order by pid, then by signature bytes. Equality means the same
    /// incarnation of the same process.
    pub fn rank(&self, other: &PidSignature) -> Ordering {
        self.pid
            .as_raw()
            .cmp(&other.pid.as_raw())
            .then_with(|| self.signature.as_bytes().cmp(other.signature.as_bytes()))
    }

    /// Marshal onto a connection: `i32` pid, `usize` length, then the
    /// signature bytes, all little-endian, bounded by the deadline.
    pub fn send(&self, fd: RawFd, deadline: &mut Deadline) -> io::Result<()> {
        let bytes = self.signature.as_bytes();
        if bytes.len() >= SIGNATURE_WIRE_MAX {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "signature too long",
            ));
        }

        write_exact(fd, &self.pid.as_raw().to_le_bytes(), deadline)?;
        write_exact(fd, &bytes.len().to_le_bytes(), deadline)?;
        write_exact(fd, bytes, deadline)?;
        Ok(())
    }

    /// Unmarshal from a connection, enforcing the length bound and rejecting
    /// embedded NUL bytes.
    pub fn recv(fd: RawFd, deadline: &mut Deadline) -> io::Result<Self> {
        let mut pid_bytes = [0u8; 4];
        read_exact(fd, &mut pid_bytes, deadline)?;
        let pid = Pid::from_raw(i32::from_le_bytes(pid_bytes));

        let mut len_bytes = [0u8; std::mem::size_of::<usize>()];
        read_exact(fd, &mut len_bytes, deadline)?;
        let len = usize::from_le_bytes(len_bytes);
        if len >= SIGNATURE_WIRE_MAX {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "signature length out of range",
            ));
        }

        let mut bytes = vec![0u8; len];
        read_exact(fd, &mut bytes, deadline)?;
        if bytes.contains(&0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "signature contains embedded NUL",
            ));
        }

        let signature = String::from_utf8(bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "signature is not UTF-8"))?;

        Ok(Self { pid, signature })
    }
}

impl std::fmt::Display for PidSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{} {}>", self.pid, self.signature)
    }
}

fn write_exact(fd: RawFd, bytes: &[u8], deadline: &mut Deadline) -> io::Result<()> {
    let written = fd::write_fd_deadline(fd, bytes, deadline)?;
    if written != bytes.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "connection closed while sending signature",
        ));
    }
    Ok(())
}

fn read_exact(fd: RawFd, bytes: &mut [u8], deadline: &mut Deadline) -> io::Result<()> {
    let read = fd::read_fd_deadline(fd, bytes, deadline)?;
    if read != bytes.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed while receiving signature",
        ));
    }
    Ok(())
}

/// Read field 22 (starttime) of `/proc/<pid>/stat` and combine it with the
/// boot incarnation.
fn fetch_signature(pid: Pid) -> io::Result<String> {
    let incarnation = boot_incarnation()?;

    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid.as_raw()))?;

    // The comm field may contain spaces and parentheses, so scan for the
    // rightmost ')' and count fields from there.
    let close = stat
        .rfind(')')
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed process stat"))?;
    let start_time = stat[close + 1..]
        .split_ascii_whitespace()
        .nth(19)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed process stat"))?;

    Ok(format!("{incarnation}:{start_time}"))
}
