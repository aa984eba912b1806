//! Emulation of the Linux epoll family of syscalls for simulated hosts.
//!
//! Managed processes see real epoll semantics: watch tables keyed by descriptor, level-triggered
//! readiness, and blocking waits that are resolved in simulated time. Blocking never blocks a real
//! thread. A syscall that cannot complete returns control to the scheduler with a
//! [`SyscallCondition`](host::syscall::condition::SyscallCondition), and the scheduler re-issues
//! the same syscall once the condition is satisfied.

// https://github.com/rust-lang/rfcs/blob/master/text/2585-unsafe-block-in-unsafe-fn.md
#![deny(unsafe_op_in_unsafe_fn)]

// modules with macros must be included before other modules
#[macro_use]
pub mod utility;

pub mod core;
pub mod host;
pub mod linux_api;
