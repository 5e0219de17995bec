//! Command mode: run a side command while holding a live reference to a
//! previously registered child.
//!
//! The pidfile is only trusted long enough to reach the keeper: once the
//! keeper has acknowledged the connection, the connection itself is the
//! reference, and the pidfile lock is released before the side command runs.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use nix::errno::Errno;
use nix::unistd::Pid;

use crate::sentry::pidfile::Pidfile;
use crate::sentry::ExitCode;
use crate::utility::fd;
use crate::utility::socket::UnixSocket;
use crate::utility::time::Deadline;

/// Environment variable naming the supervised child in the side command.
pub const PIDSENTRY_PID_ENV: &str = "PIDSENTRY_PID";

/// Why the pidfile could not produce a live child reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// The pidfile's directory cannot be reached.
    Unreachable,
    /// No pidfile exists at the path.
    Nonexistent,
    /// The pidfile exists but cannot be opened.
    Inaccessible,
    /// The pidfile names a process that is no longer alive.
    Zombie,
    /// The pidfile content cannot be interpreted.
    Malformed,
}

impl std::error::Error for CommandStatus {}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable => write!(f, "Pidfile directory is unreachable"),
            Self::Nonexistent => write!(f, "Pidfile does not exist"),
            Self::Inaccessible => write!(f, "Pidfile is inaccessible"),
            Self::Zombie => write!(f, "Pidfile no longer names a live process"),
            Self::Malformed => write!(f, "Pidfile content is malformed"),
        }
    }
}

impl CommandStatus {
    /// Whether `--relaxed` permits running the command anyway, without a
    /// child reference. A zombie pidfile and a missing one are deliberately
    /// indistinguishable here.
    fn relaxable(self) -> bool {
        matches!(self, Self::Nonexistent | Self::Zombie)
    }
}

#[derive(Debug)]
pub struct Command {
    child_pid: Option<Pid>,
    keeper: Option<UnixSocket>,
}

impl Command {
    /// Resolve the pidfile into a held reference on the child's process
    /// group. With `relaxed`, a missing or dead pidfile degrades to "no
    /// child" instead of failing.
    pub fn create(pidfile_path: &Path, relaxed: bool) -> anyhow::Result<Self> {
        match Self::acquire(pidfile_path) {
            Ok(command) => Ok(command),
            Err(err) => match err.downcast_ref::<CommandStatus>() {
                Some(status) if relaxed && status.relaxable() => Ok(Self {
                    child_pid: None,
                    keeper: None,
                }),
                _ => Err(err),
            },
        }
    }

    fn acquire(pidfile_path: &Path) -> anyhow::Result<Self> {
        let mut pidfile = match Pidfile::init(pidfile_path) {
            Ok(pidfile) => pidfile,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(err).context(CommandStatus::Unreachable)
            }
            Err(err) => return Err(err).context("Cannot initialise pidfile"),
        };

        match pidfile.open_readonly() {
            Ok(()) => {}
            Err(Errno::ENOENT) => anyhow::bail!(CommandStatus::Nonexistent),
            Err(Errno::EACCES) => anyhow::bail!(CommandStatus::Inaccessible),
            Err(errno) => return Err(errno).context("Cannot open pidfile"),
        }

        pidfile
            .acquire_read_lock()
            .context("Cannot lock pidfile")?;
        let record = pidfile.read().context("Cannot read pidfile")?;

        match record.signature.pid.as_raw() {
            0 => anyhow::bail!(CommandStatus::Zombie),
            -1 => anyhow::bail!(CommandStatus::Malformed),
            _ => {}
        }
        let keeper_name = record
            .keeper_name
            .as_deref()
            .ok_or(CommandStatus::Malformed)?;

        // A recycled address could be serving some other program by now;
        // sending the expected signature lets the keeper reject us, and the
        // acknowledgement proves the reference is held.
        let keeper = UnixSocket::connect_abstract(keeper_name)
            .context("Cannot connect to pid keeper")?;
        keeper
            .wait_write_ready(None)
            .context("Cannot reach pid keeper")?;

        let mut deadline = Deadline::new(None);
        record
            .signature
            .send(keeper.fd(), &mut deadline)
            .context("Cannot authenticate to pid keeper")?;

        keeper
            .wait_read_ready(None)
            .context("Lost connection to pid keeper")?;
        let mut ack = [0u8; 1];
        let count = fd::read_fd(keeper.fd(), &mut ack).context("Lost connection to pid keeper")?;
        anyhow::ensure!(count == 1, "Pid keeper refused the connection");

        // The keeper connection is now the live reference; the pidfile lock
        // has no further part to play.
        drop(pidfile);

        Ok(Self {
            child_pid: Some(record.signature.pid),
            keeper: Some(keeper),
        })
    }

    pub fn child_pid(&self) -> Option<Pid> {
        self.child_pid
    }

    /// Run the side command to completion. The supervised child's pid is
    /// advertised in the environment; a lost keeper reference downgrades a
    /// successful exit to 255 so the caller knows the child went away
    /// mid-run.
    pub fn run(&mut self, cmd: &[String]) -> anyhow::Result<ExitCode> {
        anyhow::ensure!(!cmd.is_empty(), "Missing command for execution");

        let mut command = std::process::Command::new(&cmd[0]);
        command.args(&cmd[1..]);
        match self.child_pid {
            Some(pid) => {
                command.env(PIDSENTRY_PID_ENV, pid.to_string());
            }
            None => {
                command.env_remove(PIDSENTRY_PID_ENV);
            }
        }

        // The keeper socket is close-on-exec, so the side command cannot
        // scribble into the reference.
        let mut child = command
            .spawn()
            .with_context(|| format!("Unable to execute '{}'", cmd[0]))?;
        log::debug!("running command pid {}", child.id());

        let status = child.wait().context("Unable to reap command")?;

        let mut exit_code = match (status.code(), status.signal()) {
            (Some(code), _) => ExitCode(code.min(128)),
            (None, Some(signal)) => ExitCode((128 + signal).min(255)),
            (None, None) => ExitCode::FAILURE,
        };

        if exit_code == ExitCode(0) {
            // Do not let a positive result mask the loss of the reference.
            if let Some(keeper) = &self.keeper {
                if keeper.wait_read_ready(Some(Duration::ZERO))? {
                    log::warn!("Lost reference to child process group");
                    exit_code = ExitCode::FAILURE;
                }
            }
        }

        Ok(exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_pidfile_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.pid");

        let err = Command::create(&path, false).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CommandStatus>(),
            Some(&CommandStatus::Nonexistent)
        );
    }

    #[test]
    fn missing_pidfile_is_tolerated_when_relaxed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.pid");

        let command = Command::create(&path, true).unwrap();
        assert_eq!(command.child_pid(), None);
    }

    #[test]
    fn unreachable_directory_is_not_relaxable() {
        let err =
            Command::create(Path::new("/nonexistent-dir-for-test/x.pid"), true).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CommandStatus>(),
            Some(&CommandStatus::Unreachable)
        );
    }

    #[test]
    fn dead_pidfile_is_a_zombie() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.pid");
        std::fs::write(&path, "2147483000\n\nnot-a-real-boot:1\nkeeper\n").unwrap();

        let err = Command::create(&path, false).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CommandStatus>(),
            Some(&CommandStatus::Zombie)
        );

        let relaxed = Command::create(&path, true).unwrap();
        assert_eq!(relaxed.child_pid(), None);
    }

    #[test]
    fn malformed_pidfile_is_never_relaxed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.pid");
        std::fs::write(&path, "not a pidfile at all").unwrap();

        let err = Command::create(&path, true).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CommandStatus>(),
            Some(&CommandStatus::Malformed)
        );
    }

    #[test]
    fn side_command_runs_without_a_child_when_relaxed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.pid");

        let mut command = Command::create(&path, true).unwrap();
        let code = command
            .run(&["sh".to_string(), "-c".to_string(), "exit 3".to_string()])
            .unwrap();
        assert_eq!(code, ExitCode(3));
    }
}
