use std::os::fd::RawFd;

use crate::host::descriptor::File;

/// A `Key` helps us find an epoll entry given the fd and `File` object available at the time that a
/// syscall is made. Epoll uses `Key`s to be able to add the same `File` multiple times under
/// different fds, and add the same fd multiple times as long as the `File` is different.
///
/// Descriptors with no simulated `File` are keyed by their OS fd alone.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub(super) enum Key {
    File {
        fd: i32,
        // the file's canonical handle; the key must not keep the file alive
        file: usize,
    },
    Os {
        fd: RawFd,
    },
}

impl Key {
    pub(super) fn new(fd: i32, file: &File) -> Self {
        Self::File {
            fd,
            file: file.canonical_handle(),
        }
    }

    pub(super) fn new_os(fd: RawFd) -> Self {
        Self::Os { fd }
    }

    pub(super) fn fd(&self) -> i32 {
        match self {
            Self::File { fd, .. } => *fd,
            Self::Os { fd } => *fd,
        }
    }
}
