use crate::core::support::emulated_time::EmulatedTime;
use crate::host::process::Process;
use crate::host::thread::Thread;

/// Represent the "current" time, `Process`, and `Thread`.
pub struct ThreadContext<'a> {
    pub now: EmulatedTime,
    pub process: &'a Process,
    pub thread: &'a Thread,
}

impl<'a> ThreadContext<'a> {
    pub fn new(now: EmulatedTime, process: &'a Process, thread: &'a Thread) -> Self {
        Self {
            now,
            process,
            thread,
        }
    }
}
