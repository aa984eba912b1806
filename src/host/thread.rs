use std::cell::{Ref, RefCell};

use crate::core::support::emulated_time::EmulatedTime;
use crate::host::context::ThreadContext;
use crate::host::process::{Process, ProcessId};
use crate::host::syscall::condition::{SyscallCondition, WakeupReason};
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::{SyscallArgs, SyscallError, SyscallReturn};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u32);

impl From<u32> for ThreadId {
    fn from(val: u32) -> Self {
        ThreadId(val)
    }
}

impl From<ThreadId> for u32 {
    fn from(val: ThreadId) -> Self {
        val.0
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A thread of a simulated process.
///
/// The scheduler hands each syscall of the thread to [`Thread::handle_syscall`]. If the syscall
/// blocks, the thread keeps the condition it's waiting on, and the scheduler polls
/// [`Thread::wakeup_reason`] to learn when to issue the same syscall again.
pub struct Thread {
    id: ThreadId,
    process_id: ProcessId,
    syscall_handler: RefCell<SyscallHandler>,
    // The condition that the last syscall blocked on, if it blocked.
    syscall_condition: RefCell<Option<SyscallCondition>>,
}

impl Thread {
    pub fn new(process: &Process, id: ThreadId) -> Self {
        Self {
            id,
            process_id: process.id(),
            syscall_handler: RefCell::new(SyscallHandler::new(
                process.id(),
                id,
                process.options().use_syscall_counters,
            )),
            syscall_condition: RefCell::new(None),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    /// The condition that the current syscall is blocked on, if any. While a blocked syscall is
    /// being re-run, this is the condition from the previous attempt.
    pub fn syscall_condition(&self) -> Option<Ref<SyscallCondition>> {
        Ref::filter_map(self.syscall_condition.borrow(), Option::as_ref).ok()
    }

    /// Run the syscall handler for `args` at simulated time `now`.
    pub fn handle_syscall(
        &self,
        now: EmulatedTime,
        process: &Process,
        args: &SyscallArgs,
    ) -> SyscallReturn {
        debug_assert_eq!(process.id(), self.process_id);

        let ctx = ThreadContext::new(now, process, self);
        let rv = self.syscall_handler.borrow_mut().syscall(&ctx, args);
        let syscall_return = SyscallReturn::from(&rv);

        // the previous condition (if any) was only needed while re-running the syscall
        let condition = match rv {
            Err(SyscallError::Blocked(blocked)) => {
                let mut condition = blocked.condition;
                condition.arm();
                Some(condition)
            }
            _ => None,
        };

        *self.syscall_condition.borrow_mut() = condition;

        syscall_return
    }

    /// Why the blocked syscall should be run again, or `None` if it should stay blocked or if no
    /// syscall is blocked.
    pub fn wakeup_reason(&self, now: EmulatedTime) -> Option<WakeupReason> {
        self.syscall_condition()?.wakeup_reason(now)
    }

    /// Abandon the blocked syscall, if any. Nothing else holds a reference to the condition, so
    /// dropping it is all the cleanup there is.
    pub fn cancel_syscall(&self) {
        if self.syscall_condition.borrow_mut().take().is_some() {
            log::trace!("Cancelled the blocked syscall of thread {}", self.id);
        }
        self.syscall_handler.borrow_mut().clear_blocked();
    }

    pub fn is_blocked(&self) -> bool {
        self.syscall_condition.borrow().is_some()
    }
}
