pub mod context;
pub mod descriptor;
pub mod memory_manager;
pub mod process;
pub mod syscall;
pub mod thread;
