//! Command-line parsing and validation.
//!
//! [`CliOptions`] is the raw clap surface; [`Options`] is the validated form
//! handed to the rest of the program. Nothing here is global: the options are
//! constructed once and passed explicitly.

use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// The default tether inactivity timeout, in seconds.
const DEFAULT_TIMEOUT_SECS: u32 = 30;

const AFTER_HELP: &str = "\
    The child process is run with a tether: a pipe whose write end the child \
    inherits and whose read end is copied to stdout of the watchdog. With a \
    pidfile, other processes can acquire a stable reference to the child's \
    process group via 'pidsentry --pidfile FILE --command -- cmd ...'.";

/// Monitor a child process and maintain a pidfile for it.
#[derive(Debug, Clone, Parser)]
#[command(name = "pidsentry", version, after_help = AFTER_HELP)]
pub struct CliOptions {
    /// Write the pid of the child to the specified file, and remove the
    /// file when the child terminates
    #[arg(short = 'p', long = "pidfile", value_name = "PATH")]
    pidfile: Option<PathBuf>,

    /// Run a command against the pidfile of a running sentry instead of
    /// supervising a child
    #[arg(long = "command", requires = "pidfile")]
    command: bool,

    /// In command mode, tolerate a missing or dead pidfile and run the
    /// command without a supervised child
    #[arg(long = "relaxed", requires = "command")]
    relaxed: bool,

    /// Name the fd of the tether. If NAME matches [A-Z][A-Z0-9_]*, an
    /// environment variable of that name carries the fd; otherwise the first
    /// matching command line argument has NAME replaced with the fd
    #[arg(short = 'n', long = "name", value_name = "NAME")]
    name: Option<String>,

    /// Tether the child using file descriptor N in the child process;
    /// specify '-' to allocate a new file descriptor
    #[arg(short = 'f', long = "fd", value_name = "N")]
    fd: Option<String>,

    /// Timeout in seconds for activity on the tether; use 0 to impose no
    /// timeout at all
    #[arg(short = 't', long = "timeout", value_name = "SECONDS")]
    timeout: Option<u32>,

    /// Run the child without a tether and only watch for termination
    #[arg(short = 'u', long = "untethered")]
    untethered: bool,

    /// Do not copy data received from the tether to stdout
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Terminate if this process is ever adopted by init(8)
    #[arg(short = 'o', long = "orphaned")]
    orphaned: bool,

    /// Print the watchdog and umbilical pids, then the child pid, on stdout
    /// before the child program starts
    #[arg(short = 'i', long = "identify")]
    identify: bool,

    /// Print debug information; the working directory is left unchanged
    #[arg(
        short = 'd',
        long = "debug",
        value_name = "LEVEL",
        num_args = 0..=1,
        default_missing_value = "1"
    )]
    debug: Option<u32>,

    /// Command to execute
    #[arg(last = true, required = true, value_name = "CMD")]
    cmd: Vec<String>,
}

/// Where the tether's write end lands in the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TetherTarget {
    /// Duplicate onto this descriptor.
    Fd(RawFd),
    /// Leave it wherever a free descriptor was found.
    Allocate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Supervise,
    Command { relaxed: bool },
}

/// Validated program options.
#[derive(Debug, Clone)]
pub struct Options {
    pub mode: Mode,
    pub pidfile: Option<PathBuf>,
    pub name: Option<String>,
    /// `None` runs the child untethered.
    pub tether: Option<TetherTarget>,
    /// `None` disables the tether inactivity timeout.
    pub tether_timeout: Option<Duration>,
    pub umbilical_timeout: Duration,
    pub signal_period: Duration,
    /// `None` leaves the post-mortem drain unbounded.
    pub drain_timeout: Option<Duration>,
    pub quiet: bool,
    pub orphaned: bool,
    pub identify: bool,
    pub debug: u32,
}

/// Check the parsed options and split out the command words.
pub fn validate(cli: CliOptions) -> anyhow::Result<(Options, Vec<String>)> {
    if let Some(name) = &cli.name {
        anyhow::ensure!(!name.is_empty(), "Empty environment or argument name");
    }

    let tether_target = match cli.fd.as_deref() {
        None => TetherTarget::Fd(libc::STDOUT_FILENO),
        Some("-") => TetherTarget::Allocate,
        Some(arg) => {
            let fd: RawFd = arg
                .parse()
                .ok()
                .filter(|fd| *fd >= 0)
                .ok_or_else(|| anyhow::anyhow!("Badly formed fd - '{arg}'"))?;
            TetherTarget::Fd(fd)
        }
    };

    let timeout_secs = cli.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
    let tether_timeout = match timeout_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs.into())),
    };

    let mode = if cli.command {
        Mode::Command {
            relaxed: cli.relaxed,
        }
    } else {
        Mode::Supervise
    };

    let options = Options {
        mode,
        pidfile: cli.pidfile,
        name: cli.name,
        tether: (!cli.untethered).then_some(tether_target),
        tether_timeout,
        umbilical_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS.into()),
        signal_period: Duration::from_secs(DEFAULT_TIMEOUT_SECS.into()),
        drain_timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS.into())),
        quiet: cli.quiet,
        orphaned: cli.orphaned,
        identify: cli.identify,
        debug: cli.debug.unwrap_or(0),
    };

    Ok((options, cli.cmd))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<(Options, Vec<String>)> {
        let cli = CliOptions::try_parse_from(args)?;
        validate(cli)
    }

    #[test]
    fn plain_supervision() {
        let (options, cmd) = parse(&["pidsentry", "--", "/bin/true"]).unwrap();
        assert_eq!(options.mode, Mode::Supervise);
        assert_eq!(options.tether, Some(TetherTarget::Fd(1)));
        assert_eq!(options.tether_timeout, Some(Duration::from_secs(30)));
        assert_eq!(cmd, vec!["/bin/true"]);
    }

    #[test]
    fn command_requires_pidfile() {
        assert!(parse(&["pidsentry", "--command", "--", "true"]).is_err());

        let (options, _) = parse(&[
            "pidsentry", "-p", "/run/x.pid", "--command", "--", "printenv",
        ])
        .unwrap();
        assert_eq!(options.mode, Mode::Command { relaxed: false });
        assert_eq!(options.pidfile.as_deref(), Some(std::path::Path::new("/run/x.pid")));
    }

    #[test]
    fn relaxed_requires_command() {
        assert!(parse(&["pidsentry", "-p", "/run/x.pid", "--relaxed", "--", "true"]).is_err());

        let (options, _) = parse(&[
            "pidsentry", "-p", "/run/x.pid", "--command", "--relaxed", "--", "true",
        ])
        .unwrap();
        assert_eq!(options.mode, Mode::Command { relaxed: true });
    }

    #[test]
    fn fd_dash_allocates() {
        let (options, _) = parse(&["pidsentry", "-f", "-", "--", "true"]).unwrap();
        assert_eq!(options.tether, Some(TetherTarget::Allocate));

        let (options, _) = parse(&["pidsentry", "-f", "7", "--", "true"]).unwrap();
        assert_eq!(options.tether, Some(TetherTarget::Fd(7)));
    }

    #[test]
    fn malformed_fd_is_rejected() {
        assert!(parse(&["pidsentry", "-f", "x", "--", "true"]).is_err());
        assert!(parse(&["pidsentry", "-f", "-2", "--", "true"]).is_err());
    }

    #[test]
    fn zero_timeout_disables() {
        let (options, _) = parse(&["pidsentry", "-t", "0", "--", "true"]).unwrap();
        assert_eq!(options.tether_timeout, None);
    }

    #[test]
    fn untethered_overrides_fd() {
        let (options, _) = parse(&["pidsentry", "-u", "-f", "7", "--", "true"]).unwrap();
        assert_eq!(options.tether, None);
    }

    #[test]
    fn debug_level_defaults_when_bare() {
        let (options, _) = parse(&["pidsentry", "--debug", "--", "true"]).unwrap();
        assert_eq!(options.debug, 1);

        let (options, _) = parse(&["pidsentry", "--debug", "2", "--", "true"]).unwrap();
        assert_eq!(options.debug, 2);

        let (options, _) = parse(&["pidsentry", "--", "true"]).unwrap();
        assert_eq!(options.debug, 0);
    }

    #[test]
    fn empty_name_is_rejected() {
        assert!(parse(&["pidsentry", "-n", "", "--", "true"]).is_err());
    }

    #[test]
    fn missing_command_is_rejected() {
        assert!(parse(&["pidsentry"]).is_err());
    }
}
