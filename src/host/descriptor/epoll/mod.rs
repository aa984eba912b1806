use std::collections::{BTreeMap, HashSet};
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

use atomic_refcell::AtomicRefCell;
use nix::errno::Errno;

use crate::host::descriptor::listener::{StateEventSource, StateListenHandle, StateListenerFilter};
use crate::host::descriptor::{File, FileMode, FileState, FileStatus};
use crate::host::syscall::types::SyscallError;
use crate::linux_api::epoll::{EpollCtlOp, EpollEvents};
use crate::utility::callback_queue::CallbackQueue;

use self::entry::Entry;
use self::key::Key;
use self::os::OsEpoll;

// Private submodules to help us track the status of items we are monitoring.
mod entry;
mod key;
mod os;

pub struct Epoll {
    event_source: StateEventSource,
    status: FileStatus,
    state: FileState,
    // Assigned to new entries, so that events are always reported in the order that entries were
    // added. This keeps the order deterministic.
    next_seq: u64,
    // Stores entries for all descriptors we are currently monitoring for events.
    monitoring: BTreeMap<Key, Entry>,
    // The keys of `monitoring`, ordered by each entry's sequence number.
    order: BTreeMap<u64, Key>,
    // Watches the descriptors that don't have a simulated file. Created on first use.
    os_epoll: Option<OsEpoll>,
}

impl Epoll {
    pub fn new() -> Arc<AtomicRefCell<Self>> {
        let mut epoll = Self {
            event_source: StateEventSource::new(),
            status: FileStatus::empty(),
            state: FileState::ACTIVE,
            next_seq: 0,
            monitoring: BTreeMap::new(),
            order: BTreeMap::new(),
            os_epoll: None,
        };

        CallbackQueue::queue_and_run(|cb_queue| epoll.refresh_readable(cb_queue));

        Arc::new(AtomicRefCell::new(epoll))
    }

    pub fn status(&self) -> FileStatus {
        self.status
    }

    pub fn set_status(&mut self, status: FileStatus) {
        self.status = status;
    }

    pub fn mode(&self) -> FileMode {
        FileMode::READ | FileMode::WRITE
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError> {
        // Dropping the entries stops listening to the files they monitor.
        self.monitoring.clear();
        self.order.clear();
        self.os_epoll = None;

        self.copy_state(
            /* mask= */ FileState::all(),
            FileState::CLOSED,
            cb_queue,
        );
        Ok(())
    }

    pub fn read(
        &mut self,
        _bytes: &mut [u8],
        _cb_queue: &mut CallbackQueue,
    ) -> Result<usize, SyscallError> {
        // EpollFDs don't support reading.
        Err(Errno::EINVAL.into())
    }

    pub fn write(
        &mut self,
        _bytes: &[u8],
        _cb_queue: &mut CallbackQueue,
    ) -> Result<usize, SyscallError> {
        // EpollFDs don't support writing.
        Err(Errno::EINVAL.into())
    }

    /// The number of entries being monitored.
    pub fn len(&self) -> usize {
        self.monitoring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitoring.is_empty()
    }

    /// Add, modify, or delete the entry for the simulated file `target_file` at `target_fd`.
    ///
    /// The target file must not be borrowed, and must not be this epoll.
    #[allow(clippy::too_many_arguments)]
    pub fn ctl(
        &mut self,
        op: EpollCtlOp,
        target_fd: i32,
        target_file: File,
        events: EpollEvents,
        data: u64,
        weak_self: Weak<AtomicRefCell<Epoll>>,
        cb_queue: &mut CallbackQueue,
    ) -> Result<(), SyscallError> {
        let key = Key::new(target_fd, &target_file);

        let result = match op {
            EpollCtlOp::EPOLL_CTL_ADD => self.ctl_add(key, target_file, events, data, weak_self),
            EpollCtlOp::EPOLL_CTL_MOD => self.ctl_mod(key, events, data),
            EpollCtlOp::EPOLL_CTL_DEL => self.ctl_del(key),
        };

        self.refresh_readable(cb_queue);

        result
    }

    /// Add, modify, or delete the entry for the OS descriptor `fd`, which has no simulated file.
    /// The kernel is updated first, so that a kernel error leaves the entries unchanged.
    pub fn ctl_os(
        &mut self,
        op: EpollCtlOp,
        fd: RawFd,
        events: EpollEvents,
        data: u64,
        cb_queue: &mut CallbackQueue,
    ) -> Result<(), SyscallError> {
        let key = Key::new_os(fd);

        let result = match op {
            EpollCtlOp::EPOLL_CTL_ADD => self.ctl_os_add(key, events, data),
            EpollCtlOp::EPOLL_CTL_MOD => self.ctl_os_mod(key, events, data),
            EpollCtlOp::EPOLL_CTL_DEL => self.ctl_os_del(key),
        };

        self.refresh_readable(cb_queue);

        result
    }

    fn ctl_add(
        &mut self,
        key: Key,
        target_file: File,
        events: EpollEvents,
        data: u64,
        weak_self: Weak<AtomicRefCell<Epoll>>,
    ) -> Result<(), SyscallError> {
        // A file that is referenced in the descriptor table should never be a closed file, but
        // check anyway since we'd never be told that it closed.
        if target_file.borrow().state().contains(FileState::CLOSED) {
            log::warn!("Attempted to add a closed file {} to epoll", key.fd());
            return Err(Errno::EBADF.into());
        }

        // From epoll_ctl(2): "op was EPOLL_CTL_ADD, and the supplied file descriptor fd is already
        // registered with this epoll instance."
        if self.monitoring.contains_key(&key) {
            return Err(Errno::EEXIST.into());
        }

        // Set up a listener to notify us when the file status changes.
        let handle = Self::add_entry_listener(weak_self, key, &target_file);

        let seq = self.next_seq();
        let entry = Entry::new_file(seq, events, data, target_file.downgrade(), handle);
        self.insert_entry(key, entry);

        Ok(())
    }

    fn ctl_mod(&mut self, key: Key, events: EpollEvents, data: u64) -> Result<(), SyscallError> {
        // Change the settings for this entry. It keeps its place in the reporting order, and its
        // listener is already watching every state change.
        let entry = self.monitoring.get_mut(&key).ok_or(Errno::ENOENT)?;
        entry.set_interested_events(events, data);

        Ok(())
    }

    fn ctl_del(&mut self, key: Key) -> Result<(), SyscallError> {
        // Stop monitoring this entry. Dropping the entry will cause it to stop listening for
        // status changes on its inner `File` event source object.
        self.remove_entry(&key).ok_or(Errno::ENOENT)?;

        Ok(())
    }

    fn ctl_os_add(&mut self, key: Key, events: EpollEvents, data: u64) -> Result<(), SyscallError> {
        if self.monitoring.contains_key(&key) {
            return Err(Errno::EEXIST.into());
        }

        let os_epoll = match &mut self.os_epoll {
            Some(x) => x,
            x @ None => x.insert(OsEpoll::new()?),
        };
        os_epoll.ctl(EpollCtlOp::EPOLL_CTL_ADD, key.fd(), events, data)?;

        let seq = self.next_seq();
        self.insert_entry(key, Entry::new_os(seq, events, data, key.fd()));

        Ok(())
    }

    fn ctl_os_mod(&mut self, key: Key, events: EpollEvents, data: u64) -> Result<(), SyscallError> {
        let entry = self.monitoring.get_mut(&key).ok_or(Errno::ENOENT)?;

        // an OS entry can only exist if the OS epoll was created
        let os_epoll = self.os_epoll.as_ref().unwrap();
        os_epoll.ctl(EpollCtlOp::EPOLL_CTL_MOD, key.fd(), events, data)?;

        entry.set_interested_events(events, data);

        Ok(())
    }

    fn ctl_os_del(&mut self, key: Key) -> Result<(), SyscallError> {
        if !self.monitoring.contains_key(&key) {
            return Err(Errno::ENOENT.into());
        }

        // an OS entry can only exist if the OS epoll was created
        let os_epoll = self.os_epoll.as_ref().unwrap();
        os_epoll.ctl(EpollCtlOp::EPOLL_CTL_DEL, key.fd(), EpollEvents::empty(), 0)?;

        self.remove_entry(&key);

        Ok(())
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn insert_entry(&mut self, key: Key, entry: Entry) {
        self.order.insert(entry.seq(), key);
        let prev = self.monitoring.insert(key, entry);
        debug_assert!(prev.is_none());
    }

    fn remove_entry(&mut self, key: &Key) -> Option<Entry> {
        let entry = self.monitoring.remove(key)?;
        let removed = self.order.remove(&entry.seq());
        debug_assert_eq!(removed.as_ref(), Some(key));
        Some(entry)
    }

    pub fn add_listener(
        &mut self,
        monitoring: FileState,
        filter: StateListenerFilter,
        notify_fn: impl Fn(FileState, FileState, &mut CallbackQueue) + Send + Sync + 'static,
    ) -> StateListenHandle {
        self.event_source.add_listener(monitoring, filter, notify_fn)
    }

    fn add_entry_listener(
        weak_self: Weak<AtomicRefCell<Epoll>>,
        key: Key,
        file: &File,
    ) -> StateListenHandle {
        // Readiness is recomputed when events are collected, so we only need to hear about state
        // changes to keep our own readability up to date, and to learn when the file closes.
        file.borrow_mut().add_listener(
            FileState::all(),
            StateListenerFilter::Always,
            move |state, _changed, cb_queue| {
                if let Some(epoll) = weak_self.upgrade() {
                    epoll.borrow_mut().refresh_entry(&key, state, cb_queue);
                }
            },
        )
    }

    /// The file listener callback for when a monitored entry file status changes.
    fn refresh_entry(&mut self, key: &Key, state: FileState, cb_queue: &mut CallbackQueue) {
        if !self.monitoring.contains_key(key) {
            // We stopped monitoring and can ignore the state change.
            return;
        }

        if state.contains(FileState::CLOSED) {
            log::trace!("Monitored file {} was closed; removing it from epoll", key.fd());
            self.remove_entry(key);
        }

        // The entry update may change the epoll readability.
        self.refresh_readable(cb_queue);
    }

    /// Re-check the readiness of OS-backed entries, here and in any nested epolls. Kernel
    /// descriptors don't notify us when they become ready, so anything waiting on this epoll must
    /// call this to notice them.
    ///
    /// The nested epolls must not be borrowed.
    pub fn poll_os_entries(&mut self, cb_queue: &mut CallbackQueue) {
        for entry in self.monitoring.values() {
            if let Some(File::Epoll(child)) = entry.file() {
                // nesting can't loop, so the child is never `self`
                child.borrow_mut().poll_os_entries(cb_queue);
            }
        }

        if self.os_epoll.is_some() {
            self.refresh_readable(cb_queue);
        }
    }

    fn refresh_readable(&mut self, cb_queue: &mut CallbackQueue) {
        if self.state.contains(FileState::CLOSED) {
            return;
        }

        let readable = self
            .has_ready_events()
            .then_some(FileState::READABLE)
            .unwrap_or_default();
        self.copy_state(/* mask= */ FileState::READABLE, readable, cb_queue);
    }

    fn copy_state(&mut self, mask: FileState, state: FileState, cb_queue: &mut CallbackQueue) {
        let old_state = self.state;

        // Remove the masked flags, then copy the masked flags.
        self.state.remove(mask);
        self.state.insert(state & mask);

        let states_changed = self.state ^ old_state;

        // If something changed, notify our listeners.
        if !states_changed.is_empty() {
            self.event_source
                .notify_listeners(self.state, states_changed, cb_queue);
        }
    }

    /// Iterate the entries in the order they were added.
    fn ordered_entries(&self) -> impl Iterator<Item = &Entry> {
        self.order.values().map(|key| {
            // `order` and `monitoring` always hold the same keys
            self.monitoring.get(key).unwrap()
        })
    }

    /// The number of entries with events that are ready to be reported. This is computed from the
    /// current state of every monitored file.
    pub fn num_ready(&self) -> usize {
        self.ordered_entries()
            .filter(|entry| !entry.ready_events().is_empty())
            .count()
    }

    pub fn has_ready_events(&self) -> bool {
        self.ordered_entries()
            .any(|entry| !entry.ready_events().is_empty())
    }

    /// Collect up to `max_events` ready events in the order the entries were added, along with
    /// the data registered for each. Nothing is consumed; entries that remain ready will be
    /// reported again by the next call.
    pub fn collect_ready_events(&self, max_events: u32) -> Vec<(EpollEvents, u64)> {
        self.ordered_entries()
            .filter_map(Entry::collect_ready_events)
            .take(max_events as usize)
            .collect()
    }

    /// Would adding `target` to the epoll `this` create a cycle of epolls watching each other?
    /// Only epolls that are not currently borrowed may be passed in.
    pub fn would_loop(this: &Arc<AtomicRefCell<Epoll>>, target: &File) -> bool {
        let this_handle = File::Epoll(Arc::clone(this)).canonical_handle();

        let mut visited = HashSet::new();
        let mut stack = vec![target.clone()];

        while let Some(file) = stack.pop() {
            if file.canonical_handle() == this_handle {
                return true;
            }

            let File::Epoll(epoll) = &file else {
                continue;
            };

            if !visited.insert(file.canonical_handle()) {
                continue;
            }

            let epoll = epoll.borrow();
            for entry in epoll.monitoring.values() {
                if let Some(child) = entry.file() {
                    stack.push(child);
                }
            }
        }

        false
    }
}
