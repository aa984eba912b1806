//! Deferred delivery of events from event sources to their listeners.
//!
//! A file that changes state (for example an eventfd whose counter became non-zero) notifies its
//! listeners, and a listener (for example an epoll watching that eventfd) may change its own state
//! in response and notify its own listeners. If listeners ran immediately, the epoll could try to
//! borrow the eventfd while the eventfd is still mutably borrowed by the syscall that wrote to it.
//! Instead, notifications are pushed onto a [`CallbackQueue`] and run once the caller has
//! released its borrows.

use std::collections::VecDeque;
use std::num::Wrapping;
use std::sync::{Arc, Weak};

use atomic_refcell::AtomicRefCell;

/// Pending listener calls. A call may push more calls, which run in the same [`run`](Self::run).
#[allow(clippy::type_complexity)]
pub struct CallbackQueue(VecDeque<Box<dyn FnOnce(&mut Self)>>);

impl CallbackQueue {
    pub fn new() -> Self {
        Self(VecDeque::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn add(&mut self, f: impl FnOnce(&mut Self) + 'static) {
        self.0.push_back(Box::new(f));
    }

    /// Run callbacks in FIFO order until the queue is empty.
    pub fn run(&mut self) {
        let mut ran: u64 = 0;
        while let Some(f) = self.0.pop_front() {
            f(self);
            ran += 1;

            // a listener that keeps re-notifying never drains the queue
            match ran {
                10_000 => log::trace!("Ran {ran} callbacks without draining the queue"),
                10_000_000 => log::warn!("Ran {ran} callbacks; listeners are likely looping"),
                _ => {}
            }
        }
    }

    /// Runs `f` with a fresh queue, then drains whatever `f` queued.
    ///
    /// ```
    /// # use shadow_epoll::utility::callback_queue::CallbackQueue;
    /// let rv = CallbackQueue::queue_and_run(|q| {
    ///     q.add(|_| {});
    ///     5
    /// });
    /// assert_eq!(rv, 5);
    /// ```
    pub fn queue_and_run<F, U>(f: F) -> U
    where
        F: FnOnce(&mut Self) -> U,
    {
        let mut cb_queue = Self::new();
        let rv = f(&mut cb_queue);
        cb_queue.run();
        rv
    }
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CallbackQueue {
    fn drop(&mut self) {
        if !self.is_empty() && !std::thread::panicking() {
            // the listeners never saw these state changes
            debug_panic!(
                "Dropped a CallbackQueue with {} callbacks that never ran",
                self.len()
            );
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct ListenerId(u32);

/// Keeps a listener registered with its [`EventSource`]. Dropping it unregisters the listener.
#[must_use = "the listener is removed when the handle is dropped"]
pub struct Handle<T> {
    id: ListenerId,
    source: Weak<AtomicRefCell<Listeners<T>>>,
}

impl<T> Handle<T> {
    /// Same as dropping the handle.
    pub fn stop_listening(self) {}
}

impl<T> Drop for Handle<T> {
    fn drop(&mut self) {
        // the source may already be gone
        if let Some(source) = self.source.upgrade() {
            source.borrow_mut().remove(self.id);
        }
    }
}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").field("id", &self.id).finish()
    }
}

/// The listener list of a file's state changes. Notifying only queues the listener calls.
pub struct EventSource<T> {
    inner: Arc<AtomicRefCell<Listeners<T>>>,
}

impl<T: Clone + Copy + 'static> EventSource<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AtomicRefCell::new(Listeners::new())),
        }
    }

    pub fn add_listener(
        &mut self,
        notify_fn: impl Fn(T, &mut CallbackQueue) + Send + Sync + 'static,
    ) -> Handle<T> {
        let id = self.inner.borrow_mut().add(Arc::new(notify_fn));
        Handle {
            id,
            source: Arc::downgrade(&self.inner),
        }
    }

    pub fn notify_listeners(&mut self, message: T, cb_queue: &mut CallbackQueue) {
        for (_, listener) in &self.inner.borrow().list {
            let listener = Arc::clone(listener);
            cb_queue.add(move |cb_queue| listener(message, cb_queue));
        }
    }

    pub fn num_listeners(&self) -> usize {
        self.inner.borrow().list.len()
    }
}

impl<T: Clone + Copy + 'static> Default for EventSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

type Listener<T> = Arc<dyn Fn(T, &mut CallbackQueue) + Send + Sync>;

struct Listeners<T> {
    list: Vec<(ListenerId, Listener<T>)>,
    next_id: Wrapping<u32>,
}

impl<T> Listeners<T> {
    fn new() -> Self {
        Self {
            list: Vec::new(),
            next_id: Wrapping(0),
        }
    }

    fn add(&mut self, listener: Listener<T>) -> ListenerId {
        // ids wrap, so skip any still held by a live handle
        let id = loop {
            let id = ListenerId(self.next_id.0);
            self.next_id += Wrapping(1);
            if self.list.iter().all(|(x, _)| *x != id) {
                break id;
            }
        };
        self.list.push((id, listener));
        id
    }

    fn remove(&mut self, id: ListenerId) {
        match self.list.iter().position(|(x, _)| *x == id) {
            Some(pos) => {
                self.list.remove(pos);
            }
            None => {
                debug_panic!("Listener {id:?} isn't registered");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eventqueue() {
        let counter = Arc::new(AtomicRefCell::new(0u32));
        let counter_clone = Arc::clone(&counter);

        let mut source = EventSource::new();

        let handle = source.add_listener(move |inc, _| {
            *counter_clone.borrow_mut() += inc;
        });

        CallbackQueue::queue_and_run(|queue| source.notify_listeners(1, queue));
        CallbackQueue::queue_and_run(|queue| source.notify_listeners(3, queue));

        handle.stop_listening();

        CallbackQueue::queue_and_run(|queue| source.notify_listeners(5, queue));
        CallbackQueue::queue_and_run(|queue| source.notify_listeners(7, queue));

        assert_eq!(*counter.borrow(), 4);
        assert_eq!(source.num_listeners(), 0);
    }

    #[test]
    fn test_deferred_until_run() {
        let counter = Arc::new(AtomicRefCell::new(0u32));
        let counter_clone = Arc::clone(&counter);

        let mut source = EventSource::new();
        let _handle = source.add_listener(move |inc, _| {
            *counter_clone.borrow_mut() += inc;
        });

        let mut queue = CallbackQueue::new();
        source.notify_listeners(2, &mut queue);

        // nothing has run yet
        assert_eq!(*counter.borrow(), 0);
        assert_eq!(queue.len(), 1);

        queue.run();
        assert_eq!(*counter.borrow(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_nested_events() {
        let order = Arc::new(AtomicRefCell::new(Vec::new()));

        let order_clone = Arc::clone(&order);
        CallbackQueue::queue_and_run(move |queue| {
            let inner_order = Arc::clone(&order_clone);
            queue.add(move |queue| {
                inner_order.borrow_mut().push(1);
                let nested_order = Arc::clone(&inner_order);
                queue.add(move |_| nested_order.borrow_mut().push(3));
            });
            let inner_order = Arc::clone(&order_clone);
            queue.add(move |_| inner_order.borrow_mut().push(2));
        });

        assert_eq!(*order.borrow(), [1, 2, 3]);
    }

    #[test]
    fn test_handle_outlives_source() {
        let mut source = EventSource::<u32>::new();
        let first = source.add_listener(|_, _| {});
        let second = source.add_listener(|_, _| {});
        assert_eq!(source.num_listeners(), 2);

        drop(first);
        assert_eq!(source.num_listeners(), 1);

        drop(source);
        // unregistering from a dropped source is a no-op
        second.stop_listening();
    }
}
