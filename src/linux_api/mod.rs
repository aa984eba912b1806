//! Linux ABI types and constants that managed processes pass to us in syscall arguments.
//!
//! Layouts follow the x86-64 kernel ABI.

pub mod epoll;
pub mod syscall;
pub mod time;
