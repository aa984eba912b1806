use std::cell::{Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::os::fd::RawFd;

use crate::host::descriptor::descriptor_table::DescriptorTable;
use crate::host::memory_manager::MemoryManager;
use crate::utility::callback_queue::CallbackQueue;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u32);

impl From<u32> for ProcessId {
    fn from(val: u32) -> Self {
        ProcessId(val)
    }
}

impl From<ProcessId> for u32 {
    fn from(val: ProcessId) -> Self {
        val.0
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-process settings, derived from the simulation's configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Count the syscalls made by each thread.
    pub use_syscall_counters: bool,
    /// Allow epolls to watch descriptors that have no simulated file.
    pub use_os_epoll_fallback: bool,
    /// The size limit of the descriptor table.
    pub max_descriptors: u32,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            use_syscall_counters: true,
            use_os_epoll_fallback: true,
            max_descriptors: 1024,
        }
    }
}

/// A simulated process: its descriptors, its memory, and the OS descriptors it was started with.
pub struct Process {
    id: ProcessId,
    name: String,
    options: ProcessOptions,
    desc_table: RefCell<DescriptorTable>,
    memory: RefCell<MemoryManager>,
    // Descriptors that the process sees but that have no simulated file. Maps the descriptor
    // number used by the process to the real OS descriptor.
    os_handles: RefCell<BTreeMap<i32, RawFd>>,
}

impl Process {
    pub fn new(id: ProcessId, name: impl Into<String>, options: ProcessOptions) -> Self {
        let name = name.into();
        log::debug!("Creating process {name} ({id}) with options {options:?}");

        Self {
            id,
            name,
            options,
            desc_table: RefCell::new(DescriptorTable::new(options.max_descriptors)),
            memory: RefCell::new(MemoryManager::new()),
            os_handles: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ProcessOptions {
        &self.options
    }

    pub fn descriptor_table_borrow(&self) -> Ref<DescriptorTable> {
        self.desc_table.borrow()
    }

    pub fn descriptor_table_borrow_mut(&self) -> RefMut<DescriptorTable> {
        self.desc_table.borrow_mut()
    }

    pub fn memory_borrow(&self) -> Ref<MemoryManager> {
        self.memory.borrow()
    }

    pub fn memory_borrow_mut(&self) -> RefMut<MemoryManager> {
        self.memory.borrow_mut()
    }

    /// Make the real descriptor `os_fd` visible to the process as `fd`. Returns the previous
    /// mapping for `fd`, if any.
    pub fn register_os_handle(&self, fd: i32, os_fd: RawFd) -> Option<RawFd> {
        log::trace!("Process {} maps fd {fd} to OS fd {os_fd}", self.id);
        self.os_handles.borrow_mut().insert(fd, os_fd)
    }

    pub fn deregister_os_handle(&self, fd: i32) -> Option<RawFd> {
        self.os_handles.borrow_mut().remove(&fd)
    }

    /// The real descriptor behind `fd`, if it was registered.
    pub fn os_handle(&self, fd: i32) -> Option<RawFd> {
        self.os_handles.borrow().get(&fd).copied()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        // close every descriptor so that files are closed and their listeners notified
        let descriptors: Vec<_> = self.desc_table.get_mut().remove_all().collect();

        CallbackQueue::queue_and_run(|cb_queue| {
            for desc in descriptors {
                if let Some(Err(e)) = desc.close(cb_queue) {
                    log::debug!("Failed to close a descriptor of process {}: {e:?}", self.id);
                }
            }
        });
    }
}
