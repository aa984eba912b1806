use nix::errno::Errno;

use crate::host::descriptor::listener::{StateEventSource, StateListenHandle, StateListenerFilter};
use crate::host::descriptor::{FileMode, FileState, FileStatus};
use crate::host::syscall::types::SyscallError;
use crate::utility::callback_queue::CallbackQueue;

// eventfd(2): "Each successful read(2) returns an 8-byte integer"
const NUM_BYTES: usize = 8;

/// The largest value the counter may hold.
const MAX_ALLOWED: u64 = u64::MAX - 1;

pub struct EventFd {
    counter: u64,
    is_semaphore_mode: bool,
    event_source: StateEventSource,
    state: FileState,
    status: FileStatus,
}

impl EventFd {
    pub fn new(init_value: u64, is_semaphore_mode: bool, status: FileStatus) -> Self {
        let mut rv = Self {
            counter: init_value,
            is_semaphore_mode,
            event_source: StateEventSource::new(),
            state: FileState::ACTIVE,
            status,
        };

        // no listeners yet, so nobody will be notified of the initial state
        CallbackQueue::queue_and_run(|cb_queue| rv.refresh_state(cb_queue));

        rv
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
        // set the closed flag and remove the active, readable, and writable flags
        self.update_state(
            FileState::CLOSED | FileState::ACTIVE | FileState::READABLE | FileState::WRITABLE,
            FileState::CLOSED,
            cb_queue,
        );

        Ok(())
    }

    pub fn read(
        &mut self,
        bytes: &mut [u8],
        cb_queue: &mut CallbackQueue,
    ) -> Result<usize, SyscallError> {
        if bytes.len() < NUM_BYTES {
            log::trace!(
                "Reading from eventfd requires a buffer of at least {} bytes",
                NUM_BYTES
            );
            return Err(Errno::EINVAL.into());
        }

        if self.counter == 0 {
            log::trace!("Eventfd counter is 0 and cannot be read right now");
            return Err(Errno::EWOULDBLOCK.into());
        }

        // behavior defined in `man 2 eventfd`
        let value = if self.is_semaphore_mode {
            self.counter -= 1;
            1
        } else {
            std::mem::take(&mut self.counter)
        };

        bytes[..NUM_BYTES].copy_from_slice(&value.to_ne_bytes());

        self.refresh_state(cb_queue);

        Ok(NUM_BYTES)
    }

    pub fn write(
        &mut self,
        bytes: &[u8],
        cb_queue: &mut CallbackQueue,
    ) -> Result<usize, SyscallError> {
        let Some(value) = bytes.get(..NUM_BYTES) else {
            log::trace!(
                "Writing to eventfd requires a buffer with at least {} bytes",
                NUM_BYTES
            );
            return Err(Errno::EINVAL.into());
        };

        // the slice is exactly NUM_BYTES long
        let value = u64::from_ne_bytes(value.try_into().unwrap());

        if value == u64::MAX {
            log::trace!("We do not allow writing the max counter value");
            return Err(Errno::EINVAL.into());
        }

        if value > MAX_ALLOWED - self.counter {
            log::trace!("The write value does not currently fit into the counter");
            return Err(Errno::EWOULDBLOCK.into());
        }

        self.counter += value;
        self.refresh_state(cb_queue);

        Ok(NUM_BYTES)
    }

    pub fn add_listener(
        &mut self,
        monitoring: FileState,
        filter: StateListenerFilter,
        notify_fn: impl Fn(FileState, FileState, &mut CallbackQueue) + Send + Sync + 'static,
    ) -> StateListenHandle {
        self.event_source.add_listener(monitoring, filter, notify_fn)
    }

    fn refresh_state(&mut self, cb_queue: &mut CallbackQueue) {
        if self.state.contains(FileState::CLOSED) {
            return;
        }

        let mut readable_writable = FileState::empty();

        // set the descriptor as readable if we have a non-zero counter
        readable_writable.set(FileState::READABLE, self.counter > 0);
        // set the descriptor as writable if we can write a value of at least 1
        readable_writable.set(FileState::WRITABLE, self.counter < MAX_ALLOWED);

        self.update_state(
            FileState::READABLE | FileState::WRITABLE,
            readable_writable,
            cb_queue,
        );
    }

    fn update_state(&mut self, mask: FileState, state: FileState, cb_queue: &mut CallbackQueue) {
        let old_state = self.state;

        // remove the masked flags, then copy the masked flags
        self.state.remove(mask);
        self.state.insert(state & mask);

        let states_changed = self.state ^ old_state;

        // if nothing changed
        if states_changed.is_empty() {
            return;
        }

        self.event_source
            .notify_listeners(self.state, states_changed, cb_queue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_val(efd: &mut EventFd, val: u64) -> Result<usize, SyscallError> {
        CallbackQueue::queue_and_run(|q| efd.write(&val.to_ne_bytes(), q))
    }

    fn read_val(efd: &mut EventFd) -> Result<u64, SyscallError> {
        let mut buf = [0u8; 8];
        CallbackQueue::queue_and_run(|q| efd.read(&mut buf, q))?;
        Ok(u64::from_ne_bytes(buf))
    }

    #[test]
    fn test_counter() {
        let mut efd = EventFd::new(0, false, FileStatus::NONBLOCK);
        assert_eq!(efd.state(), FileState::ACTIVE | FileState::WRITABLE);
        assert_eq!(read_val(&mut efd), Err(Errno::EAGAIN.into()));

        write_val(&mut efd, 3).unwrap();
        write_val(&mut efd, 4).unwrap();
        assert!(efd.state().contains(FileState::READABLE));

        assert_eq!(read_val(&mut efd), Ok(7));
        assert!(!efd.state().contains(FileState::READABLE));
    }

    #[test]
    fn test_semaphore() {
        let mut efd = EventFd::new(2, true, FileStatus::empty());
        assert!(efd.state().contains(FileState::READABLE));

        assert_eq!(read_val(&mut efd), Ok(1));
        assert_eq!(read_val(&mut efd), Ok(1));
        assert_eq!(read_val(&mut efd), Err(Errno::EAGAIN.into()));
    }

    #[test]
    fn test_invalid() {
        let mut efd = EventFd::new(0, false, FileStatus::empty());

        let mut small = [0u8; 4];
        let rv = CallbackQueue::queue_and_run(|q| efd.read(&mut small, q));
        assert_eq!(rv, Err(Errno::EINVAL.into()));

        let rv = CallbackQueue::queue_and_run(|q| efd.write(&small, q));
        assert_eq!(rv, Err(Errno::EINVAL.into()));

        assert_eq!(write_val(&mut efd, u64::MAX), Err(Errno::EINVAL.into()));

        write_val(&mut efd, MAX_ALLOWED).unwrap();
        assert!(!efd.state().contains(FileState::WRITABLE));
        assert_eq!(write_val(&mut efd, 1), Err(Errno::EAGAIN.into()));
    }
}
