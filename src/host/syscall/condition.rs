//! The conditions that a blocked syscall waits on before the thread is resumed.
//!
//! A handler that can't complete returns [`SyscallError::Blocked`] with a [`SyscallCondition`].
//! The thread stores the condition and [arms](SyscallCondition::arm) it; the scheduler then polls
//! [`SyscallCondition::wakeup_reason`] and, once it returns a reason, re-runs the same syscall
//! handler from the top.
//!
//! [`SyscallError::Blocked`]: crate::host::syscall::types::SyscallError::Blocked

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::support::emulated_time::EmulatedTime;
use crate::host::descriptor::listener::{StateListenHandle, StateListenerFilter};
use crate::host::descriptor::{File, FileState};
use crate::utility::callback_queue::CallbackQueue;

/// A file and the state bits that will wake a blocked syscall.
#[derive(Clone, Debug)]
pub struct Trigger {
    file: File,
    state: FileState,
}

impl Trigger {
    pub fn from_file(file: File, state: FileState) -> Self {
        Self { file, state }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn state(&self) -> FileState {
        self.state
    }
}

/// Why a blocked syscall should be re-run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WakeupReason {
    /// The trigger's file reached the requested state.
    Trigger,
    /// The timeout was reached.
    Timeout,
}

pub struct SyscallCondition {
    trigger: Option<Trigger>,
    timeout: Option<EmulatedTime>,
    // set by the file listener, which may outlive a borrow of this condition
    triggered: Arc<AtomicBool>,
    listener: Option<StateListenHandle>,
}

impl SyscallCondition {
    /// Wake up when the trigger fires.
    pub fn new(trigger: Trigger) -> Self {
        Self {
            trigger: Some(trigger),
            timeout: None,
            triggered: Arc::new(AtomicBool::new(false)),
            listener: None,
        }
    }

    /// Create a new syscall condition that triggers a wakeup on the calling thread only after the
    /// `abs_wakeup_time` has been reached.
    pub fn new_from_wakeup_time(abs_wakeup_time: EmulatedTime) -> Self {
        Self {
            trigger: None,
            timeout: Some(abs_wakeup_time),
            triggered: Arc::new(AtomicBool::new(false)),
            listener: None,
        }
    }

    pub fn trigger(&self) -> Option<&Trigger> {
        self.trigger.as_ref()
    }

    pub fn timeout(&self) -> Option<EmulatedTime> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Option<EmulatedTime>) {
        self.timeout = timeout;
    }

    pub fn is_armed(&self) -> bool {
        self.listener.is_some()
    }

    /// Start listening for the trigger. If the file is already in the requested state, the
    /// condition is satisfied immediately.
    ///
    /// The trigger's file must not be borrowed.
    pub fn arm(&mut self) {
        let Some(trigger) = &self.trigger else {
            return;
        };

        if self.listener.is_some() {
            return;
        }

        let triggered = Arc::clone(&self.triggered);
        let handle = trigger.file.borrow_mut().add_listener(
            trigger.state,
            StateListenerFilter::OffToOn,
            move |_state, _changed, _cb_queue| {
                triggered.store(true, Ordering::Relaxed);
            },
        );
        self.listener = Some(handle);

        if trigger.file.borrow().state().intersects(trigger.state) {
            self.triggered.store(true, Ordering::Relaxed);
        }
    }

    /// Returns the reason the syscall should be re-run at time `now`, or `None` if it should stay
    /// blocked. A fired trigger takes precedence over a timeout.
    ///
    /// An epoll trigger is re-polled first, since its OS-backed entries can become ready without
    /// any notification. The trigger's file must not be borrowed.
    pub fn wakeup_reason(&self, now: EmulatedTime) -> Option<WakeupReason> {
        if let Some(Trigger {
            file: File::Epoll(epoll),
            ..
        }) = &self.trigger
        {
            if self.is_armed() && !self.triggered.load(Ordering::Relaxed) {
                CallbackQueue::queue_and_run(|cb_queue| {
                    epoll.borrow_mut().poll_os_entries(cb_queue)
                });
            }
        }

        if self.triggered.load(Ordering::Relaxed) {
            return Some(WakeupReason::Trigger);
        }

        match self.timeout {
            Some(timeout) if now >= timeout => Some(WakeupReason::Timeout),
            _ => None,
        }
    }
}

impl PartialEq for SyscallCondition {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.triggered, &other.triggered)
    }
}

impl Eq for SyscallCondition {}

impl std::fmt::Debug for SyscallCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallCondition")
            .field("trigger", &self.trigger)
            .field("timeout", &self.timeout)
            .field("triggered", &self.triggered.load(Ordering::Relaxed))
            .field("armed", &self.is_armed())
            .finish()
    }
}
