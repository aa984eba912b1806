//! A buffer for files that need to share a buffer with other files, such as the two ends of a
//! pipe. This buffer supports notifying files when readers or writers are added or removed.

use std::collections::VecDeque;

use nix::errno::Errno;

use crate::utility::callback_queue::{CallbackQueue, EventSource, Handle};

pub struct SharedBuf {
    queue: VecDeque<u8>,
    max_len: usize,
    state: BufferState,
    num_readers: u16,
    num_writers: u16,
    event_source: EventSource<(BufferState, BufferState)>,
}

impl SharedBuf {
    pub fn new(max_len: usize) -> Self {
        assert_ne!(max_len, 0);
        Self {
            queue: VecDeque::new(),
            max_len,
            state: BufferState::WRITABLE | BufferState::NO_READERS | BufferState::NO_WRITERS,
            num_readers: 0,
            num_writers: 0,
            event_source: EventSource::new(),
        }
    }

    pub fn has_data(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn space_available(&self) -> usize {
        self.max_len - self.queue.len()
    }

    /// Register as a reader. The [`ReaderHandle`] must be returned to the buffer later with
    /// [`remove_reader()`](Self::remove_reader).
    pub fn add_reader(&mut self, cb_queue: &mut CallbackQueue) -> ReaderHandle {
        self.num_readers += 1;
        self.refresh_state(cb_queue);
        ReaderHandle {}
    }

    pub fn remove_reader(&mut self, handle: ReaderHandle, cb_queue: &mut CallbackQueue) {
        self.num_readers -= 1;
        // don't run the handle's drop impl
        std::mem::forget(handle);
        self.refresh_state(cb_queue);
    }

    pub fn num_readers(&self) -> u16 {
        self.num_readers
    }

    /// Register as a writer. The [`WriterHandle`] must be returned to the buffer later with
    /// [`remove_writer()`](Self::remove_writer).
    pub fn add_writer(&mut self, cb_queue: &mut CallbackQueue) -> WriterHandle {
        self.num_writers += 1;
        self.refresh_state(cb_queue);
        WriterHandle {}
    }

    pub fn remove_writer(&mut self, handle: WriterHandle, cb_queue: &mut CallbackQueue) {
        self.num_writers -= 1;
        // don't run the handle's drop impl
        std::mem::forget(handle);
        self.refresh_state(cb_queue);
    }

    pub fn num_writers(&self) -> u16 {
        self.num_writers
    }

    /// Move up to `bytes.len()` bytes out of the buffer. Returns the number of bytes copied.
    pub fn read(&mut self, bytes: &mut [u8], cb_queue: &mut CallbackQueue) -> usize {
        let num = std::cmp::min(bytes.len(), self.queue.len());

        for (dst, src) in bytes.iter_mut().zip(self.queue.drain(..num)) {
            *dst = src;
        }

        self.refresh_state(cb_queue);
        num
    }

    /// Copy as many bytes as there is space for into the buffer. Returns the number of bytes
    /// copied, or `EAGAIN` if the buffer is full.
    pub fn write(&mut self, bytes: &[u8], cb_queue: &mut CallbackQueue) -> Result<usize, Errno> {
        if bytes.is_empty() {
            return Ok(0);
        }

        if self.space_available() == 0 {
            return Err(Errno::EAGAIN);
        }

        let num = std::cmp::min(bytes.len(), self.space_available());
        self.queue.extend(&bytes[..num]);

        self.refresh_state(cb_queue);
        Ok(num)
    }

    pub fn add_listener(
        &mut self,
        monitoring: BufferState,
        notify_fn: impl Fn(BufferState, &mut CallbackQueue) + Send + Sync + 'static,
    ) -> BufferHandle {
        self.event_source
            .add_listener(move |(state, changed), cb_queue| {
                // true if any of the bits we're monitoring have changed
                if !monitoring.intersects(changed) {
                    return;
                }

                (notify_fn)(state, cb_queue)
            })
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    fn refresh_state(&mut self, cb_queue: &mut CallbackQueue) {
        let old_state = self.state;

        self.state.set(BufferState::READABLE, self.has_data());
        self.state
            .set(BufferState::WRITABLE, self.space_available() > 0);
        self.state
            .set(BufferState::NO_READERS, self.num_readers() == 0);
        self.state
            .set(BufferState::NO_WRITERS, self.num_writers() == 0);

        let states_changed = self.state ^ old_state;

        // if nothing changed
        if states_changed.is_empty() {
            return;
        }

        self.event_source
            .notify_listeners((self.state, states_changed), cb_queue);
    }
}

impl Drop for SharedBuf {
    fn drop(&mut self) {
        // don't show the following warning message if panicking
        if std::thread::panicking() {
            return;
        }

        // listeners waiting for `NO_READERS` or `NO_WRITERS` status changes will never be notified
        if self.num_readers != 0 || self.num_writers != 0 {
            // panic in debug builds since the backtrace will be helpful for debugging
            debug_panic!(
                "Dropping SharedBuf while it still has {} readers and {} writers.",
                self.num_readers,
                self.num_writers,
            );
        }
    }
}

bitflags::bitflags! {
    #[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
    pub struct BufferState: u8 {
        /// There is data waiting in the buffer.
        const READABLE = 0b00000001;
        /// There is available buffer space.
        const WRITABLE = 0b00000010;
        /// The buffer has no readers.
        const NO_READERS = 0b00000100;
        /// The buffer has no writers.
        const NO_WRITERS = 0b00001000;
    }
}

pub type BufferHandle = Handle<(BufferState, BufferState)>;

/// A handle that signifies that the owner is acting as a reader for the buffer. The handle must be
/// returned to the buffer later with [`SharedBuf::remove_reader()`].
///
/// Handles aren't linked to specific buffers, so make sure to only return the handle to the same
/// buffer which you acquired the handle from.
// do not implement copy or clone
pub struct ReaderHandle;

/// See [`ReaderHandle`].
// do not implement copy or clone
pub struct WriterHandle;

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        // don't show the following warning message if panicking
        if std::thread::panicking() {
            return;
        }

        debug_panic!("Dropping ReaderHandle without returning it to SharedBuf.");
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        // don't show the following warning message if panicking
        if std::thread::panicking() {
            return;
        }

        debug_panic!("Dropping WriterHandle without returning it to SharedBuf.");
    }
}
