//! A set of file descriptors stored as disjoint inclusive ranges.
//!
//! The supervisor tracks whole swaths of descriptors (everything open, the
//! whitelist to survive an exec) and a flat bitmap would be both large and
//! slow to invert. Ranges keep the common operations proportional to the
//! number of contiguous runs instead of the number of descriptors.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;

use nix::sys::resource::{getrlimit, Resource};
use nix::unistd;

/// An inclusive range of file descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdRange {
    pub lhs: RawFd,
    pub rhs: RawFd,
}

impl FdRange {
    pub fn new(lhs: RawFd, rhs: RawFd) -> Self {
        assert!(0 <= lhs && lhs <= rhs);
        Self { lhs, rhs }
    }

    pub fn point(fd: RawFd) -> Self {
        Self::new(fd, fd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdSetError {
    /// The inserted range intersects a member range.
    Overlap,
}

impl std::error::Error for FdSetError {}

impl std::fmt::Display for FdSetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Overlap => write!(f, "Range overlaps an existing member"),
        }
    }
}

/// Disjoint inclusive fd ranges, iterated in ascending order. Ranges are kept
/// exactly as inserted; adjacent ranges are not merged.
#[derive(Debug, Default)]
pub struct FdSet {
    // Keyed by the left edge; the invariant is that ranges never intersect.
    ranges: BTreeMap<RawFd, RawFd>,
}

impl FdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.ranges
            .range(..=fd)
            .next_back()
            .is_some_and(|(_, &rhs)| fd <= rhs)
    }

    /// Insert a range, rejecting any intersection with a member range.
    pub fn insert_range(&mut self, range: FdRange) -> Result<(), FdSetError> {
        if let Some((_, &rhs)) = self.ranges.range(..=range.rhs).next_back() {
            if rhs >= range.lhs {
                return Err(FdSetError::Overlap);
            }
        }
        self.ranges.insert(range.lhs, range.rhs);
        Ok(())
    }

    /// Remove the descriptors of `range` from the set, splitting member
    /// ranges as required. Descriptors not present are ignored.
    pub fn remove_range(&mut self, range: FdRange) {
        let overlapping: Vec<(RawFd, RawFd)> = self
            .ranges
            .range(..=range.rhs)
            .rev()
            .take_while(|(_, &rhs)| rhs >= range.lhs)
            .map(|(&lhs, &rhs)| (lhs, rhs))
            .collect();

        for (lhs, rhs) in overlapping {
            self.ranges.remove(&lhs);
            if lhs < range.lhs {
                self.ranges.insert(lhs, range.lhs - 1);
            }
            if rhs > range.rhs {
                self.ranges.insert(range.rhs + 1, rhs);
            }
        }
    }

    /// Replace the set with its complement within `0..=RawFd::MAX`.
    pub fn invert(&mut self) {
        let mut inverted = BTreeMap::new();
        let mut next = 0;

        for (&lhs, &rhs) in &self.ranges {
            if lhs > next {
                inverted.insert(next, lhs - 1);
            }
            next = match rhs.checked_add(1) {
                Some(next) => next,
                None => {
                    self.ranges = inverted;
                    return;
                }
            };
        }

        inverted.insert(next, RawFd::MAX);
        self.ranges = inverted;
    }

    /// Visit member ranges in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = FdRange> + '_ {
        self.ranges
            .iter()
            .map(|(&lhs, &rhs)| FdRange { lhs, rhs })
    }

    /// Insert every descriptor currently open in this process, coalesced into
    /// runs.
    pub fn fill_from_proc(&mut self) -> std::io::Result<()> {
        let mut fds = Vec::new();
        // Collect eagerly so the directory descriptor backing the iteration
        // is closed before the caller starts closing fds.
        for entry in std::fs::read_dir("/proc/self/fd")? {
            let entry = entry?;
            if let Ok(fd) = entry.file_name().to_string_lossy().parse::<RawFd>() {
                fds.push(fd);
            }
        }
        fds.sort_unstable();

        let mut run: Option<FdRange> = None;
        for fd in fds {
            // The directory fd from read_dir is closed by now.
            if !is_open(fd) {
                continue;
            }
            run = match run {
                Some(range) if range.rhs + 1 == fd => Some(FdRange::new(range.lhs, fd)),
                Some(range) => {
                    self.insert_range(range).map_err(overlap_to_io)?;
                    Some(FdRange::point(fd))
                }
                None => Some(FdRange::point(fd)),
            };
        }
        if let Some(range) = run {
            self.insert_range(range).map_err(overlap_to_io)?;
        }
        Ok(())
    }
}

fn overlap_to_io(err: FdSetError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::AlreadyExists, err)
}

fn is_open(fd: RawFd) -> bool {
    nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD).is_ok()
}

/// Close every open descriptor outside the whitelist, bounded by the current
/// RLIMIT_NOFILE soft limit.
pub fn close_fds_except(whitelist: &[RawFd]) -> std::io::Result<()> {
    let mut set = FdSet::new();
    set.fill_from_proc()?;

    for &fd in whitelist {
        set.remove_range(FdRange::point(fd));
    }

    let (soft_limit, _) = getrlimit(Resource::RLIMIT_NOFILE)?;
    let limit = RawFd::try_from(soft_limit).unwrap_or(RawFd::MAX);

    for range in set.iter().collect::<Vec<_>>() {
        if range.lhs >= limit {
            break;
        }
        for fd in range.lhs..=range.rhs.min(limit - 1) {
            // EBADF just means the fd was already closed behind our back.
            let _ = unistd::close(fd);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, pipe, ForkResult};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn disjoint_ranges_visit_in_order() {
        let mut set = FdSet::new();
        set.insert_range(FdRange::new(10, 12)).unwrap();
        set.insert_range(FdRange::new(3, 5)).unwrap();
        let ranges: Vec<FdRange> = set.iter().collect();
        assert_eq!(ranges, vec![FdRange::new(3, 5), FdRange::new(10, 12)]);
    }

    #[test]
    fn overlapping_insert_is_rejected() {
        let mut set = FdSet::new();
        set.insert_range(FdRange::new(3, 7)).unwrap();
        assert_eq!(
            set.insert_range(FdRange::new(7, 9)),
            Err(FdSetError::Overlap)
        );
        assert_eq!(
            set.insert_range(FdRange::new(0, 3)),
            Err(FdSetError::Overlap)
        );
        // Adjacent but disjoint is fine.
        set.insert_range(FdRange::new(8, 9)).unwrap();
    }

    #[test]
    fn remove_splits_ranges() {
        let mut set = FdSet::new();
        set.insert_range(FdRange::new(0, 9)).unwrap();
        set.remove_range(FdRange::new(4, 6));
        let ranges: Vec<FdRange> = set.iter().collect();
        assert_eq!(ranges, vec![FdRange::new(0, 3), FdRange::new(7, 9)]);
        assert!(!set.contains(5));
        assert!(set.contains(3));
    }

    #[test]
    fn remove_absent_is_a_noop() {
        let mut set = FdSet::new();
        set.insert_range(FdRange::new(0, 2)).unwrap();
        set.remove_range(FdRange::new(5, 9));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![FdRange::new(0, 2)]);
    }

    #[test]
    fn invert_produces_the_gaps() {
        let mut set = FdSet::new();
        set.insert_range(FdRange::new(3, 5)).unwrap();
        set.insert_range(FdRange::new(10, 12)).unwrap();
        set.invert();
        let ranges: Vec<FdRange> = set.iter().collect();
        assert_eq!(
            ranges,
            vec![
                FdRange::new(0, 2),
                FdRange::new(6, 9),
                FdRange::new(13, RawFd::MAX),
            ]
        );
    }

    #[test]
    fn invert_empty_is_everything() {
        let mut set = FdSet::new();
        set.invert();
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![FdRange::new(0, RawFd::MAX)]
        );
    }

    #[test]
    fn fill_from_proc_includes_open_pipe() {
        let (rd, wr) = pipe().unwrap();
        let mut set = FdSet::new();
        set.fill_from_proc().unwrap();
        assert!(set.contains(rd.as_raw_fd()));
        assert!(set.contains(wr.as_raw_fd()));
        assert!(set.contains(0));
    }

    #[test]
    fn close_fds_except_spares_the_whitelist() {
        // Run in a child so the closes cannot disturb the test harness.
        let (rd, wr) = pipe().unwrap();
        let (probe_rd, probe_wr) = pipe().unwrap();

        match unsafe { fork() }.unwrap() {
            ForkResult::Parent { child } => {
                drop(probe_wr);
                drop(wr);
                let status = waitpid(child, None).unwrap();
                assert_eq!(status, WaitStatus::Exited(child, 0));
                // The whitelisted probe stayed open in the child until exit.
                let mut buf = [0u8; 2];
                assert_eq!(
                    crate::utility::fd::read_fd(probe_rd.as_raw_fd(), &mut buf).unwrap(),
                    2
                );
                assert_eq!(&buf, b"ok");
            }
            ForkResult::Child => {
                let keep = [0, 1, 2, probe_wr.as_raw_fd()];
                let code = match close_fds_except(&keep) {
                    Ok(()) => {
                        let closed = !is_open(rd.as_raw_fd()) && !is_open(wr.as_raw_fd());
                        let kept = is_open(probe_wr.as_raw_fd());
                        if closed && kept {
                            let _ = crate::utility::fd::write_all_fd(probe_wr.as_raw_fd(), b"ok");
                            0
                        } else {
                            1
                        }
                    }
                    Err(_) => 2,
                };
                unsafe { libc::_exit(code) }
            }
        }
    }
}
