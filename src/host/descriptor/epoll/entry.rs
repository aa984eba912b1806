use std::os::fd::RawFd;

use crate::host::descriptor::epoll::os::OsEpoll;
use crate::host::descriptor::listener::StateListenHandle;
use crate::host::descriptor::{File, FileState, WeakFile};
use crate::linux_api::epoll::EpollEvents;

/// Used to track the status of a file we are monitoring for events. Any complicated logic for
/// deciding when a file has events that epoll should report should be specified in this object's
/// implementation.
pub(super) struct Entry {
    // Position among the other entries; entries report in increasing order.
    seq: u64,
    // The events of interest registered by the managed process.
    interest: EpollEvents,
    // The data registered by the managed process, to be returned upon event notification.
    data: u64,
    source: Source,
}

enum Source {
    File {
        file: WeakFile,
        // we only store this so that the listener is removed when the entry is dropped
        _listener_handle: StateListenHandle,
    },
    Os {
        fd: RawFd,
    },
}

impl Entry {
    pub(super) fn new_file(
        seq: u64,
        interest: EpollEvents,
        data: u64,
        file: WeakFile,
        listener_handle: StateListenHandle,
    ) -> Self {
        Self {
            seq,
            interest,
            data,
            source: Source::File {
                file,
                _listener_handle: listener_handle,
            },
        }
    }

    pub(super) fn new_os(seq: u64, interest: EpollEvents, data: u64, fd: RawFd) -> Self {
        Self {
            seq,
            interest,
            data,
            source: Source::Os { fd },
        }
    }

    pub(super) fn seq(&self) -> u64 {
        self.seq
    }

    /// The simulated file this entry monitors, if it's still alive.
    pub(super) fn file(&self) -> Option<File> {
        match &self.source {
            Source::File { file, .. } => file.upgrade(),
            Source::Os { .. } => None,
        }
    }

    pub(super) fn set_interested_events(&mut self, interest: EpollEvents, data: u64) {
        self.interest = interest;
        self.data = data;
    }

    /// The events that are ready right now and that the managed process is interested in.
    pub(super) fn ready_events(&self) -> EpollEvents {
        let events = match &self.source {
            Source::File { file, .. } => match file.upgrade() {
                Some(file) => state_to_events(file.borrow().state()),
                // the file is gone, so it can't have events
                None => EpollEvents::empty(),
            },
            Source::Os { fd } => OsEpoll::poll(*fd, self.interest),
        };

        events & self.interest
    }

    /// The events to report along with the data the managed process registered, or `None` if the
    /// entry isn't ready.
    pub(super) fn collect_ready_events(&self) -> Option<(EpollEvents, u64)> {
        let events = self.ready_events();
        (!events.is_empty()).then_some((events, self.data))
    }
}

/// The epoll events that a file in `state` would report.
pub(super) fn state_to_events(state: FileState) -> EpollEvents {
    let mut events = EpollEvents::empty();

    if state.contains(FileState::READABLE) {
        events.insert(EpollEvents::EPOLLIN | EpollEvents::EPOLLRDNORM);
    }
    if state.contains(FileState::WRITABLE) {
        events.insert(EpollEvents::EPOLLOUT | EpollEvents::EPOLLWRNORM);
    }
    if state.contains(FileState::ERROR) {
        events.insert(EpollEvents::EPOLLERR);
    }
    if state.contains(FileState::HUP) {
        events.insert(EpollEvents::EPOLLHUP);
    }

    events
}
