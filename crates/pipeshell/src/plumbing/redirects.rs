//! The full stream table of one stage

use std::collections::BTreeMap;
use std::fmt;
use std::os::fd::RawFd;

use super::redirect::PipeHandle;
use super::redirect::Redirect;
use super::redirect::Source;
use super::redirect::Stream;
use crate::error::ShellError;

/// Ordered mapping from stream index to `Redirect`.
///
/// Ownership of resolved descriptors follows the `borrowed` flag of each
/// source: after `make_pipes` the set owns the fresh source ends and
/// `close_source_fds` must run once the stage has taken them over (the
/// child has forked, or the function stage has duplicated them).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectSet {
    redirects: BTreeMap<RawFd, Redirect>,
}

impl Default for RedirectSet {
    fn default() -> Self {
        Self::new()
    }
}

impl RedirectSet {
    /// Identity mapping of stdin, stdout and stderr onto the caller's own,
    /// borrowed descriptors.
    pub fn new() -> Self {
        let mut set = Self::empty();
        for fd in 0..=2 {
            set.register(Redirect::fd(fd, fd));
        }
        set
    }

    /// Set without any mapping.
    pub fn empty() -> Self {
        Self {
            redirects: BTreeMap::new(),
        }
    }

    /// Add or replace the mapping for the redirect's target.
    /// An `Unmapped` source removes it.
    pub fn register(&mut self, redirect: Redirect) -> &mut Self {
        if *redirect.source() == Source::Unmapped {
            self.redirects.remove(&redirect.target());
        } else {
            self.redirects.insert(redirect.target(), redirect);
        }
        self
    }

    /// Builder form of `register`.
    pub fn with(mut self, redirect: Redirect) -> Self {
        self.register(redirect);
        self
    }

    /// New set with every mapping of `other` registered over this one.
    pub fn merge(&self, other: &RedirectSet) -> RedirectSet {
        let mut merged = self.clone();
        for redirect in other.redirects.values() {
            merged.register(redirect.clone());
        }
        merged
    }

    pub fn get(&self, stream: impl Into<Stream>) -> Option<&Redirect> {
        self.redirects.get(&stream.into().fd())
    }

    pub fn get_mut(&mut self, stream: impl Into<Stream>) -> Option<&mut Redirect> {
        self.redirects.get_mut(&stream.into().fd())
    }

    pub fn stdin(&self) -> Option<&Redirect> {
        self.get(Stream::STDIN)
    }

    pub fn stdout(&self) -> Option<&Redirect> {
        self.get(Stream::STDOUT)
    }

    pub fn stderr(&self) -> Option<&Redirect> {
        self.get(Stream::STDERR)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Redirect> {
        self.redirects.values()
    }

    pub fn len(&self) -> usize {
        self.redirects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.redirects.is_empty()
    }

    /// Lowest index above every target and every descriptor source.
    pub fn find_free_fd(&self) -> RawFd {
        self.redirects
            .values()
            .flat_map(|r| std::iter::once(r.target()).chain(r.source_fd()))
            .chain(std::iter::once(2))
            .max()
            .unwrap_or(2)
            + 1
    }

    /// Resolve every pending pipe, temp file and capture.
    ///
    /// On failure, the descriptors created so far are closed again.
    pub fn make_pipes(&self) -> Result<RedirectSet, ShellError> {
        self.make_pipes_matching(|_| true)
    }

    /// Resolve only the pending sources accepted by `filter`; the others
    /// stay pending.
    pub fn make_pipes_matching(
        &self,
        filter: impl Fn(&Source) -> bool,
    ) -> Result<RedirectSet, ShellError> {
        let mut resolved = RedirectSet::empty();
        let mut created = Vec::new();
        for redirect in self.redirects.values() {
            if !redirect.source().is_pending() || !filter(redirect.source()) {
                resolved.register(redirect.clone());
                continue;
            }
            match redirect.make_pipe() {
                Ok(r) => {
                    created.push(r.target());
                    resolved.register(r);
                }
                Err(e) => {
                    resolved.release(&created);
                    return Err(e);
                }
            }
        }
        Ok(resolved)
    }

    fn release(&mut self, targets: &[RawFd]) {
        for target in targets {
            let Some(redirect) = self.redirects.get_mut(target) else {
                continue;
            };
            match redirect.take_pipe() {
                Some(PipeHandle::Fd(fd)) => {
                    let _ = super::fd::close_fd(fd);
                }
                Some(PipeHandle::TempFile(path)) | Some(PipeHandle::Capture(path)) => {
                    let _ = std::fs::remove_file(path);
                }
                None => {}
            }
            redirect.close_source_fd();
        }
    }

    /// Copy of the set in which no source descriptor is owned.
    pub fn borrowed(&self) -> RedirectSet {
        RedirectSet {
            redirects: self
                .redirects
                .iter()
                .map(|(fd, r)| (*fd, r.borrowed()))
                .collect(),
        }
    }

    /// Close every owned source descriptor. Safe to call more than once.
    pub fn close_source_fds(&mut self) {
        for redirect in self.redirects.values_mut() {
            redirect.close_source_fd();
        }
    }

    /// Parent-side handles of all resolved pending sources, by stream.
    pub fn pipe_handles(&self) -> impl Iterator<Item = (RawFd, &PipeHandle)> {
        self.redirects
            .values()
            .filter_map(|r| r.pipe_handle().map(|p| (r.target(), p)))
    }
}

impl fmt::Display for RedirectSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.redirects.values().map(|r| r.to_string()).collect();
        write!(f, "{}", parts.join(", "))
    }
}

impl From<Redirect> for RedirectSet {
    fn from(redirect: Redirect) -> Self {
        RedirectSet::empty().with(redirect)
    }
}

impl FromIterator<Redirect> for RedirectSet {
    fn from_iter<I: IntoIterator<Item = Redirect>>(iter: I) -> Self {
        let mut set = RedirectSet::empty();
        for redirect in iter {
            set.register(redirect);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::super::fd;
    use super::*;

    #[test]
    fn test_identity_defaults() {
        let set = RedirectSet::new();
        assert_eq!(set.len(), 3);
        assert_eq!(set.to_string(), "0 <- 0, 1 -> 1, 2 -> 2");
        assert!(RedirectSet::empty().is_empty());
    }

    #[test]
    fn test_register_replaces_and_removes() {
        let mut set = RedirectSet::new();
        set.register(Redirect::null(1));
        assert_eq!(set.stdout().unwrap().to_string(), "1 -> /dev/null");
        set.register(Redirect::unmapped(2));
        assert!(set.stderr().is_none());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_merge_does_not_touch_operands() {
        let base = RedirectSet::new();
        let over = RedirectSet::from(Redirect::null(1));
        let merged = base.merge(&over);
        assert_eq!(merged.stdout().unwrap().to_string(), "1 -> /dev/null");
        assert_eq!(base.stdout().unwrap().to_string(), "1 -> 1");
    }

    #[test]
    fn test_find_free_fd() {
        assert_eq!(RedirectSet::empty().find_free_fd(), 3);
        let set = RedirectSet::new().with(Redirect::fd(1, 9)).with(Redirect::null(5));
        assert_eq!(set.find_free_fd(), 10);
    }

    #[test]
    fn test_make_pipes_then_close_leaves_only_parent_handles() {
        let set = RedirectSet::new().with(Redirect::pipe(0)).with(Redirect::pipe(1));
        let mut resolved = set.make_pipes().unwrap();

        let sources: Vec<RawFd> = [0, 1]
            .iter()
            .map(|s| resolved.get(*s).unwrap().source_fd().unwrap())
            .collect();
        let handles: Vec<RawFd> = resolved
            .pipe_handles()
            .map(|(_, h)| match h {
                PipeHandle::Fd(fd) => *fd,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(handles.len(), 2);

        resolved.close_source_fds();
        resolved.close_source_fds();
        for fd in &handles {
            assert!(fd::is_open(*fd));
        }
        // stderr stayed borrowed and open
        assert!(fd::is_open(2));

        // stdout's pipe has no writer left: its read handle sees EOF.
        let stdout_handle = match resolved.stdout().unwrap().pipe_handle() {
            Some(PipeHandle::Fd(fd)) => *fd,
            other => panic!("unexpected {other:?}"),
        };
        let mut buf = [0u8; 4];
        assert_eq!(fd::read_fd(stdout_handle, &mut buf).unwrap(), 0);

        for fd in handles {
            fd::close_fd(fd).unwrap();
        }
        assert_eq!(sources.len(), 2);
    }

    #[test]
    fn test_borrowed_copy_is_not_closed() {
        let (r, w) = fd::pipe_cloexec().unwrap();
        let owned = RedirectSet::empty().with(Redirect::owned_fd(1, w));
        let mut copy = owned.borrowed();
        copy.close_source_fds();
        assert!(fd::is_open(w));

        let mut owned = owned;
        owned.close_source_fds();
        fd::close_fd(r).unwrap();
    }

    #[test]
    fn test_make_pipes_matching_leaves_others_pending() {
        let set = RedirectSet::new()
            .with(Redirect::pipe(1))
            .with(Redirect::capture(2));
        let mut resolved = set
            .make_pipes_matching(|s| *s == Source::Pipe)
            .unwrap();
        assert_eq!(resolved.stderr().unwrap().source(), &Source::Capture);
        let handle = match resolved.stdout().unwrap().pipe_handle() {
            Some(PipeHandle::Fd(fd)) => *fd,
            other => panic!("unexpected {other:?}"),
        };
        resolved.close_source_fds();
        fd::close_fd(handle).unwrap();
    }

    #[test]
    fn test_make_pipes_failure_releases_created() {
        let set = RedirectSet::empty()
            .with(Redirect::pipe(1))
            .with(Redirect::capture(0));
        assert!(set.make_pipes().is_err());
    }
}
