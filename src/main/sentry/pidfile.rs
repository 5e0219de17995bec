//! The on-disk pidfile: atomic creation, advisory locking, validation and
//! teardown.
//!
//! The pidfile's inode is its identity. A descriptor whose path no longer
//! resolves to the same inode is a "zombie": some competing process removed
//! and possibly replaced the file, and the holder must reopen from scratch.
//! Content is only ever written under the exclusive lock to a newly created
//! empty file, and the file is emptied before it is unlinked, so a racing
//! reader sees either complete content or an invalid file, never a torn
//! record.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::Pid;

use crate::sentry::signature::PidSignature;
use crate::utility::fd;

/// Maximum pid file size.
///
/// Bound the size of the pid file so that IO requirements can be kept
/// reasonable. This provides a way to avoid having large files cause the
/// watchdog to fail.
const PIDFILE_SIZE: usize = 1024;

/// The longest keeper name that still fits a `sockaddr_un` with its leading
/// NUL and trailing terminator restored.
const KEEPER_NAME_MAX: usize = 106;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockKind {
    Read,
    Write,
}

/// Why creating a pidfile did not yield a fresh file.
#[derive(Debug, PartialEq, Eq)]
pub enum PidfileOpenError {
    /// A live process already holds this pidfile.
    Exists(Pid),
    Io(Errno),
}

impl std::error::Error for PidfileOpenError {}

impl std::fmt::Display for PidfileOpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exists(pid) => write!(f, "Pidfile already names active pid {pid}"),
            Self::Io(errno) => write!(f, "{}", errno.desc()),
        }
    }
}

impl From<Errno> for PidfileOpenError {
    fn from(errno: Errno) -> Self {
        Self::Io(errno)
    }
}

/// The validated content of a pidfile.
///
/// `signature.pid` is positive only when the named process is alive and its
/// signature matches; 0 marks a dead or mismatched process and -1 malformed
/// content.
#[derive(Debug)]
pub struct PidfileRecord {
    pub signature: PidSignature,
    pub keeper_name: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct Pidfile {
    path: PathBuf,
    file: Option<OwnedFd>,
    lock: Option<LockKind>,
}

impl Pidfile {
    /// Anchor the pidfile to its directory. The directory must exist; the
    /// file need not.
    pub fn init(path: &Path) -> io::Result<Self> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.canonicalize()?,
            _ => Path::new(".").canonicalize()?,
        };
        let name = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing file name"))?;
        Ok(Self {
            path: dir.join(name),
            file: None,
            lock: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fd(&self) -> RawFd {
        self.file.as_ref().expect("pidfile not open").as_raw_fd()
    }

    fn guard_closed(&self) -> Result<(), Errno> {
        if self.file.is_some() || self.lock.is_some() {
            return Err(Errno::EALREADY);
        }
        Ok(())
    }

    /// Open an existing pidfile for reading.
    pub fn open_readonly(&mut self) -> Result<(), Errno> {
        self.guard_closed()?;
        let fd = nix::fcntl::open(
            &self.path,
            OFlag::O_RDONLY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        self.file = Some(unsafe { OwnedFd::from_raw_fd(fd) });
        Ok(())
    }

    /// Create a fresh, empty pidfile, removing any stale predecessor.
    ///
    /// A pre-existing file that names a live process fails with
    /// [`PidfileOpenError::Exists`]. Otherwise the stale file is unlinked
    /// under the exclusive lock and creation is retried; `O_EXCL` arbitrates
    /// between racing creators. On success the file is open, empty and
    /// unlocked, so it can still turn into a zombie at any time.
    pub fn open_create(&mut self) -> Result<(), PidfileOpenError> {
        self.guard_closed()?;

        loop {
            match nix::fcntl::open(
                &self.path,
                OFlag::O_RDONLY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
                Mode::empty(),
            ) {
                Err(Errno::ENOENT) => {}
                Err(errno) => return Err(errno.into()),
                Ok(fd) => {
                    self.file = Some(unsafe { OwnedFd::from_raw_fd(fd) });
                    if let Err(errno) = self.prune_stale() {
                        self.file = None;
                        self.lock = None;
                        return Err(errno);
                    }
                }
            }

            // Another process can race to create the pidfile in this window;
            // O_EXCL lets only one of them win. The file is created readonly
            // because writers rely on the lock, not on permissions.
            match nix::fcntl::open(
                &self.path,
                OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_NOFOLLOW
                    | OFlag::O_CLOEXEC,
                Mode::from_bits_truncate(0o444),
            ) {
                Ok(fd) => {
                    self.file = Some(unsafe { OwnedFd::from_raw_fd(fd) });
                    return Ok(());
                }
                Err(Errno::EEXIST) => continue,
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    /// With an existing file open, decide whether it blocks creation, and
    /// remove it if not. Leaves the file closed.
    fn prune_stale(&mut self) -> Result<(), PidfileOpenError> {
        self.lock_file(LockKind::Write)?;

        let record = self.read().map_err(io_to_errno)?;
        let pid = record.signature.pid;
        if pid.as_raw() > 0 {
            let _ = self.release_lock();
            self.file = None;
            return Err(PidfileOpenError::Exists(pid));
        }

        if self.unlink_locked()? {
            log::debug!("removed stale pidfile '{}'", self.path.display());
        }

        self.release_lock()?;
        self.file = None;
        Ok(())
    }

    /// Create the pidfile and leave it write-locked and empty, retrying while
    /// competing processes turn the freshly created file into a zombie.
    pub fn create_locked(&mut self) -> Result<(), PidfileOpenError> {
        loop {
            self.open_create()?;

            // The flock can only be taken after the file exists, and the new
            // file is empty and unlocked until then, so it may already have
            // been replaced. Check after locking.
            self.acquire_write_lock()?;

            if !self.detect_zombie()? {
                return Ok(());
            }

            log::debug!("disregarding zombie pidfile '{}'", self.path.display());
            self.release_lock()?;
            self.file = None;
        }
    }

    fn lock_file(&mut self, kind: LockKind) -> Result<(), Errno> {
        assert!(self.lock.is_none());
        let op = match kind {
            LockKind::Read => libc::LOCK_SH,
            LockKind::Write => libc::LOCK_EX,
        };
        loop {
            match Errno::result(unsafe { libc::flock(self.fd(), op) }) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno),
            }
        }
        self.lock = Some(kind);
        Ok(())
    }

    pub fn acquire_read_lock(&mut self) -> Result<(), Errno> {
        self.lock_file(LockKind::Read)
    }

    pub fn acquire_write_lock(&mut self) -> Result<(), Errno> {
        // Refuse to write-lock a descriptor that cannot write; content and
        // unlink operations require the write lock as their license.
        let flags = OFlag::from_bits_retain(nix::fcntl::fcntl(
            self.fd(),
            nix::fcntl::FcntlArg::F_GETFL,
        )?);
        if flags & OFlag::O_ACCMODE == OFlag::O_RDONLY {
            return Err(Errno::EBADF);
        }
        self.lock_file(LockKind::Write)
    }

    pub fn release_lock(&mut self) -> Result<(), Errno> {
        assert!(self.lock.is_some());
        Errno::result(unsafe { libc::flock(self.fd(), libc::LOCK_UN) })?;
        self.lock = None;
        Ok(())
    }

    /// Read and validate the pidfile content. Requires a lock.
    pub fn read(&mut self) -> io::Result<PidfileRecord> {
        assert!(self.lock.is_some());

        // Read one byte beyond the cap so an oversized file is detected
        // rather than silently truncated.
        let mut buf = vec![0u8; PIDFILE_SIZE + 1];
        let len = pread_full(self.fd(), &mut buf)?;

        if len > PIDFILE_SIZE {
            return Ok(malformed());
        }
        buf.truncate(len);

        Ok(parse_record(&buf)?)
    }

    /// Write the four-field record. Requires the write lock and a freshly
    /// created empty file.
    pub fn write(&mut self, pid: Pid, keeper_name: &[u8]) -> io::Result<()> {
        assert_eq!(self.lock, Some(LockKind::Write));
        assert!(pid.as_raw() > 0);

        if keeper_name.is_empty() || keeper_name.len() > KEEPER_NAME_MAX {
            return Err(io::Error::from_raw_os_error(libc::EADDRNOTAVAIL));
        }

        let signature = PidSignature::new(pid, None)?;

        // The leading blank line keeps LSB-style readers happy: they read
        // only the first nonblank line and find the pid.
        let mut content = format!("{}\n\n{}\n", pid.as_raw(), signature.signature).into_bytes();
        content.extend_from_slice(keeper_name);
        content.push(b'\n');

        if content.len() >= PIDFILE_SIZE {
            return Err(io::Error::from_raw_os_error(libc::ERANGE));
        }

        fd::write_all_fd(self.fd(), &content)?;
        Ok(())
    }

    /// Whether the open descriptor still matches the file at the path. Any
    /// mismatch, including a missing file, makes the pidfile a zombie.
    pub fn detect_zombie(&self) -> Result<bool, Errno> {
        let file_stat = nix::sys::stat::fstat(self.fd())?;
        match nix::sys::stat::lstat(&self.path) {
            Err(Errno::ENOENT) => Ok(true),
            Err(errno) => Err(errno),
            Ok(path_stat) => {
                Ok(path_stat.st_dev != file_stat.st_dev || path_stat.st_ino != file_stat.st_ino)
            }
        }
    }

    /// Unlink the pidfile from its directory. Requires the write lock; a
    /// zombie no longer occupies the directory and is left alone. Reports
    /// whether an unlink happened.
    fn unlink_locked(&mut self) -> Result<bool, Errno> {
        assert_eq!(self.lock, Some(LockKind::Write));

        if self.detect_zombie()? {
            return Ok(false);
        }
        match nix::unistd::unlink(&self.path) {
            Ok(()) | Err(Errno::ENOENT) => Ok(true),
            Err(errno) => Err(errno),
        }
    }

    /// Close the pidfile. A write-locked holder owns the file's lifecycle:
    /// the content is emptied first so a racing reader sees an invalid file,
    /// then the file is unlinked.
    pub fn close(&mut self) {
        if self.file.is_none() {
            self.lock = None;
            return;
        }

        if self.lock == Some(LockKind::Write) {
            if let Err(err) = nix::unistd::ftruncate(self.file.as_ref().unwrap(), 0) {
                log::warn!(
                    "Cannot truncate pidfile '{}' - errno {}",
                    self.path.display(),
                    err as i32
                );
            }
            if let Err(err) = self.unlink_locked() {
                log::warn!(
                    "Cannot unlink pidfile '{}' - errno {}",
                    self.path.display(),
                    err as i32
                );
            }
        }

        self.file = None;
        self.lock = None;
    }
}

impl Drop for Pidfile {
    fn drop(&mut self) {
        self.close();
    }
}

fn io_to_errno(err: io::Error) -> PidfileOpenError {
    PidfileOpenError::Io(
        err.raw_os_error()
            .map(Errno::from_raw)
            .unwrap_or(Errno::EIO),
    )
}

fn malformed() -> PidfileRecord {
    PidfileRecord {
        signature: PidSignature {
            pid: Pid::from_raw(-1),
            signature: String::new(),
        },
        keeper_name: None,
    }
}

fn dead(keeper_name: Vec<u8>) -> PidfileRecord {
    PidfileRecord {
        signature: PidSignature {
            pid: Pid::from_raw(0),
            signature: String::new(),
        },
        keeper_name: Some(keeper_name),
    }
}

fn pread_full(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let mut offset = 0;
    while offset < buf.len() {
        match nix::sys::uio::pread(
            unsafe { std::os::unix::io::BorrowedFd::borrow_raw(fd) },
            &mut buf[offset..],
            offset as libc::off_t,
        ) {
            Ok(0) => break,
            Ok(count) => offset += count,
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        }
    }
    Ok(offset)
}

/// Parse the four-field record and validate the named pid against the live
/// process table.
fn parse_record(content: &[u8]) -> io::Result<PidfileRecord> {
    let Some(content) = content.strip_suffix(b"\n") else {
        return Ok(malformed());
    };

    let lines: Vec<&[u8]> = content.split(|&b| b == b'\n').collect();
    if lines.len() != 4 || lines[3].is_empty() {
        return Ok(malformed());
    }

    let Some(pid) = parse_pid(lines[0]) else {
        return Ok(malformed());
    };
    let Ok(recorded) = std::str::from_utf8(lines[2]) else {
        return Ok(malformed());
    };
    let keeper_name = lines[3].to_vec();
    if keeper_name.len() > KEEPER_NAME_MAX {
        return Ok(malformed());
    }

    // The record is well formed; decide whether the named process is still
    // the process that wrote it.
    match PidSignature::new(pid, None) {
        Ok(live) if live.signature == recorded => Ok(PidfileRecord {
            signature: live,
            keeper_name: Some(keeper_name),
        }),
        Ok(live) => {
            log::debug!("pidfile signature {} vs {}", recorded, live.signature);
            Ok(dead(keeper_name))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(dead(keeper_name)),
        Err(err) => Err(err),
    }
}

fn parse_pid(bytes: &[u8]) -> Option<Pid> {
    if bytes.is_empty() || !bytes.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let parsed: i32 = std::str::from_utf8(bytes).ok()?.parse().ok()?;
    (parsed > 0).then(|| Pid::from_raw(parsed))
}
