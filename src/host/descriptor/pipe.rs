use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use nix::errno::Errno;

use crate::host::descriptor::listener::{StateEventSource, StateListenHandle, StateListenerFilter};
use crate::host::descriptor::shared_buf::{
    BufferHandle, BufferState, ReaderHandle, SharedBuf, WriterHandle,
};
use crate::host::descriptor::{FileMode, FileState, FileStatus};
use crate::host::syscall::types::SyscallError;
use crate::utility::callback_queue::CallbackQueue;

/// The default pipe capacity on Linux. See pipe(7).
pub const PIPE_BUF_SIZE: usize = 65536;

/// One end of a pipe. Which end is decided by the [mode](FileMode) it was created with.
pub struct Pipe {
    buffer: Option<Arc<AtomicRefCell<SharedBuf>>>,
    event_source: StateEventSource,
    state: FileState,
    mode: FileMode,
    status: FileStatus,
    reader_handle: Option<ReaderHandle>,
    writer_handle: Option<WriterHandle>,
    // we only store this so that the handle is dropped when we are
    buffer_event_handle: Option<BufferHandle>,
}

impl Pipe {
    /// Create a new [`Pipe`]. The new pipe must be initialized using
    /// [`Pipe::connect_to_buffer`] before any of its methods are called.
    pub fn new(mode: FileMode, status: FileStatus) -> Self {
        Self {
            buffer: None,
            event_source: StateEventSource::new(),
            state: FileState::ACTIVE,
            mode,
            status,
            reader_handle: None,
            writer_handle: None,
            buffer_event_handle: None,
        }
    }

    /// Create a connected read end and write end.
    pub fn new_pair(
        status: FileStatus,
        cb_queue: &mut CallbackQueue,
    ) -> (Arc<AtomicRefCell<Self>>, Arc<AtomicRefCell<Self>>) {
        let buffer = Arc::new(AtomicRefCell::new(SharedBuf::new(PIPE_BUF_SIZE)));

        let reader = Arc::new(AtomicRefCell::new(Self::new(FileMode::READ, status)));
        let writer = Arc::new(AtomicRefCell::new(Self::new(FileMode::WRITE, status)));

        Self::connect_to_buffer(&reader, Arc::clone(&buffer), cb_queue);
        Self::connect_to_buffer(&writer, buffer, cb_queue);

        (reader, writer)
    }

    pub fn connect_to_buffer(
        arc: &Arc<AtomicRefCell<Self>>,
        buffer: Arc<AtomicRefCell<SharedBuf>>,
        cb_queue: &mut CallbackQueue,
    ) {
        let weak = Arc::downgrade(arc);
        let pipe = &mut *arc.borrow_mut();

        {
            let mut buffer = buffer.borrow_mut();

            if pipe.mode.contains(FileMode::READ) {
                pipe.reader_handle = Some(buffer.add_reader(cb_queue));
            }

            if pipe.mode.contains(FileMode::WRITE) {
                pipe.writer_handle = Some(buffer.add_writer(cb_queue));
            }

            let handle = buffer.add_listener(BufferState::all(), move |state, cb_queue| {
                // if the file hasn't been dropped
                if let Some(pipe) = weak.upgrade() {
                    pipe.borrow_mut().refresh_state(state, cb_queue);
                }
            });
            pipe.buffer_event_handle = Some(handle);
        }

        let buffer_state = buffer.borrow().state();
        pipe.buffer = Some(buffer);
        pipe.refresh_state(buffer_state, cb_queue);
    }

    pub fn status(&self) -> FileStatus {
        self.status
    }

    pub fn set_status(&mut self, status: FileStatus) {
        self.status = status;
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError> {
        // stop listening before we leave the buffer, so we aren't told about our own departure
        self.buffer_event_handle = None;

        if let Some(buffer) = self.buffer.take() {
            let mut buffer = buffer.borrow_mut();

            if let Some(handle) = self.reader_handle.take() {
                buffer.remove_reader(handle, cb_queue);
            }

            if let Some(handle) = self.writer_handle.take() {
                buffer.remove_writer(handle, cb_queue);
            }
        }

        // set the closed flag and remove all other flags
        self.copy_state(FileState::all(), FileState::CLOSED, cb_queue);

        Ok(())
    }

    pub fn read(
        &mut self,
        bytes: &mut [u8],
        cb_queue: &mut CallbackQueue,
    ) -> Result<usize, SyscallError> {
        // if the file is not open for reading, return EBADF
        if !self.mode.contains(FileMode::READ) {
            return Err(Errno::EBADF.into());
        }

        let Some(buffer) = &self.buffer else {
            return Err(Errno::EBADF.into());
        };

        if bytes.is_empty() {
            return Ok(0);
        }

        let mut buffer = buffer.borrow_mut();
        let num_read = buffer.read(bytes, cb_queue);

        // the read would block if there's no data but a writer could still send some
        if num_read == 0 && buffer.num_writers() > 0 {
            return Err(Errno::EWOULDBLOCK.into());
        }

        Ok(num_read)
    }

    pub fn write(&mut self, bytes: &[u8], cb_queue: &mut CallbackQueue) -> Result<usize, SyscallError> {
        // if the file is not open for writing, return EBADF
        if !self.mode.contains(FileMode::WRITE) {
            return Err(Errno::EBADF.into());
        }

        let Some(buffer) = &self.buffer else {
            return Err(Errno::EBADF.into());
        };

        let mut buffer = buffer.borrow_mut();

        // pipe(7): "If all file descriptors referring to the read end of a pipe have been closed,
        // then a write(2) will cause a SIGPIPE signal to be generated"; we don't deliver signals,
        // so only the EPIPE is reported
        if buffer.num_readers() == 0 {
            return Err(Errno::EPIPE.into());
        }

        Ok(buffer.write(bytes, cb_queue)?)
    }

    pub fn add_listener(
        &mut self,
        monitoring: FileState,
        filter: StateListenerFilter,
        notify_fn: impl Fn(FileState, FileState, &mut CallbackQueue) + Send + Sync + 'static,
    ) -> StateListenHandle {
        self.event_source.add_listener(monitoring, filter, notify_fn)
    }

    /// Translate the shared buffer's state into this end's state.
    fn refresh_state(&mut self, buffer_state: BufferState, cb_queue: &mut CallbackQueue) {
        if self.state.contains(FileState::CLOSED) {
            return;
        }

        let mut state = FileState::empty();

        if self.mode.contains(FileMode::READ) {
            state.set(
                FileState::READABLE,
                buffer_state.contains(BufferState::READABLE),
            );
            state.set(
                FileState::HUP,
                buffer_state.contains(BufferState::NO_WRITERS),
            );
        }

        if self.mode.contains(FileMode::WRITE) {
            state.set(
                FileState::WRITABLE,
                buffer_state.contains(BufferState::WRITABLE),
            );
            state.set(
                FileState::ERROR,
                buffer_state.contains(BufferState::NO_READERS),
            );
        }

        self.copy_state(
            FileState::READABLE | FileState::WRITABLE | FileState::ERROR | FileState::HUP,
            state,
            cb_queue,
        );
    }

    fn copy_state(&mut self, mask: FileState, state: FileState, cb_queue: &mut CallbackQueue) {
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
