use std::sync::{Arc, Weak};

use atomic_refcell::{AtomicRef, AtomicRefCell, AtomicRefMut};

use crate::host::descriptor::epoll::Epoll;
use crate::host::descriptor::eventfd::EventFd;
use crate::host::descriptor::listener::{StateListenHandle, StateListenerFilter};
use crate::host::descriptor::pipe::Pipe;
use crate::host::syscall::types::SyscallError;
use crate::utility::callback_queue::CallbackQueue;
use crate::utility::{IsSend, IsSync};

pub mod descriptor_table;
pub mod epoll;
pub mod eventfd;
pub mod listener;
pub mod pipe;
pub mod shared_buf;

bitflags::bitflags! {
    /// These are flags that can potentially be changed from the plugin (analagous to the Linux
    /// `filp->f_flags` status flags). Many of these can be represented in different ways, for
    /// example: `O_NONBLOCK`, `EFD_NONBLOCK`, etc, and not all have the same value.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct FileStatus: libc::c_int {
        const NONBLOCK = libc::O_NONBLOCK;
    }
}

bitflags::bitflags! {
    /// These are flags that should generally not change (analagous to the Linux `filp->f_mode`).
    /// Since the plugin will never see these values and they're not exposed by the kernel, we
    /// don't match the kernel `FMODE_` values here.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct FileMode: u32 {
        const READ = 0b00000001;
        const WRITE = 0b00000010;
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct FileState: u16 {
        /// Has been initialized and it is now OK to unblock any plugin waiting
        /// on a particular state.
        const ACTIVE = 1 << 0;
        /// Can be read, i.e. there is data waiting for user.
        const READABLE = 1 << 1;
        /// Can be written, i.e. there is available buffer space.
        const WRITABLE = 1 << 2;
        /// An error condition is pending (for example a pipe with no readers).
        const ERROR = 1 << 3;
        /// The peer hung up (for example a pipe with no writers).
        const HUP = 1 << 4;
        /// User already called close.
        const CLOSED = 1 << 5;
    }
}

/// The type tag of a [`File`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileKind {
    Epoll,
    EventFd,
    Pipe,
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Epoll => "epoll",
            Self::EventFd => "eventfd",
            Self::Pipe => "pipe",
        };
        f.write_str(name)
    }
}

/// Represents a POSIX file description, or a Linux `struct file`.
#[derive(Clone)]
pub enum File {
    Epoll(Arc<AtomicRefCell<Epoll>>),
    EventFd(Arc<AtomicRefCell<EventFd>>),
    Pipe(Arc<AtomicRefCell<Pipe>>),
}

// will not compile if `File` is not Send + Sync
impl IsSend for File {}
impl IsSync for File {}

impl File {
    pub fn kind(&self) -> FileKind {
        match self {
            Self::Epoll(_) => FileKind::Epoll,
            Self::EventFd(_) => FileKind::EventFd,
            Self::Pipe(_) => FileKind::Pipe,
        }
    }

    pub fn borrow(&self) -> FileRef {
        match self {
            Self::Epoll(ref f) => FileRef::Epoll(f.borrow()),
            Self::EventFd(ref f) => FileRef::EventFd(f.borrow()),
            Self::Pipe(ref f) => FileRef::Pipe(f.borrow()),
        }
    }

    pub fn try_borrow(&self) -> Result<FileRef, atomic_refcell::BorrowError> {
        Ok(match self {
            Self::Epoll(ref f) => FileRef::Epoll(f.try_borrow()?),
            Self::EventFd(ref f) => FileRef::EventFd(f.try_borrow()?),
            Self::Pipe(ref f) => FileRef::Pipe(f.try_borrow()?),
        })
    }

    pub fn borrow_mut(&self) -> FileRefMut {
        match self {
            Self::Epoll(ref f) => FileRefMut::Epoll(f.borrow_mut()),
            Self::EventFd(ref f) => FileRefMut::EventFd(f.borrow_mut()),
            Self::Pipe(ref f) => FileRefMut::Pipe(f.borrow_mut()),
        }
    }

    /// An identity for the underlying object that stays the same for as long as the object is
    /// alive, and is shared by all clones and weak references of this `File`.
    pub fn canonical_handle(&self) -> usize {
        match self {
            Self::Epoll(f) => Arc::as_ptr(f) as *const () as usize,
            Self::EventFd(f) => Arc::as_ptr(f) as *const () as usize,
            Self::Pipe(f) => Arc::as_ptr(f) as *const () as usize,
        }
    }

    pub fn downgrade(&self) -> WeakFile {
        match self {
            Self::Epoll(f) => WeakFile::Epoll(Arc::downgrade(f)),
            Self::EventFd(f) => WeakFile::EventFd(Arc::downgrade(f)),
            Self::Pipe(f) => WeakFile::Pipe(Arc::downgrade(f)),
        }
    }
}

impl PartialEq for File {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_handle() == other.canonical_handle()
    }
}

impl Eq for File {}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind())?;

        if let Ok(file) = self.try_borrow() {
            write!(
                f,
                "(state: {:?}, status: {:?})",
                file.state(),
                file.status()
            )
        } else {
            write!(f, "(already borrowed)")
        }
    }
}

/// A non-owning reference to a [`File`].
#[derive(Clone)]
pub enum WeakFile {
    Epoll(Weak<AtomicRefCell<Epoll>>),
    EventFd(Weak<AtomicRefCell<EventFd>>),
    Pipe(Weak<AtomicRefCell<Pipe>>),
}

impl WeakFile {
    pub fn upgrade(&self) -> Option<File> {
        Some(match self {
            Self::Epoll(f) => File::Epoll(f.upgrade()?),
            Self::EventFd(f) => File::EventFd(f.upgrade()?),
            Self::Pipe(f) => File::Pipe(f.upgrade()?),
        })
    }
}

impl std::fmt::Debug for WeakFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.upgrade() {
            Some(file) => write!(f, "Weak({file:?})"),
            None => write!(f, "Weak(dropped)"),
        }
    }
}

/// A [`File`] variant that can be looked up with a checked type. See
/// [`DescriptorTable::lookup`](descriptor_table::DescriptorTable::lookup).
pub trait FileVariant: Sized {
    const KIND: FileKind;

    fn from_file(file: &File) -> Option<&Arc<AtomicRefCell<Self>>>;
}

impl FileVariant for Epoll {
    const KIND: FileKind = FileKind::Epoll;

    fn from_file(file: &File) -> Option<&Arc<AtomicRefCell<Self>>> {
        match file {
            File::Epoll(f) => Some(f),
            _ => None,
        }
    }
}

impl FileVariant for EventFd {
    const KIND: FileKind = FileKind::EventFd;

    fn from_file(file: &File) -> Option<&Arc<AtomicRefCell<Self>>> {
        match file {
            File::EventFd(f) => Some(f),
            _ => None,
        }
    }
}

impl FileVariant for Pipe {
    const KIND: FileKind = FileKind::Pipe;

    fn from_file(file: &File) -> Option<&Arc<AtomicRefCell<Self>>> {
        match file {
            File::Pipe(f) => Some(f),
            _ => None,
        }
    }
}

pub enum FileRef<'a> {
    Epoll(AtomicRef<'a, Epoll>),
    EventFd(AtomicRef<'a, EventFd>),
    Pipe(AtomicRef<'a, Pipe>),
}

pub enum FileRefMut<'a> {
    Epoll(AtomicRefMut<'a, Epoll>),
    EventFd(AtomicRefMut<'a, EventFd>),
    Pipe(AtomicRefMut<'a, Pipe>),
}

impl FileRef<'_> {
    enum_passthrough!(self, (), Epoll, EventFd, Pipe;
        pub fn state(&self) -> FileState
    );
    enum_passthrough!(self, (), Epoll, EventFd, Pipe;
        pub fn mode(&self) -> FileMode
    );
    enum_passthrough!(self, (), Epoll, EventFd, Pipe;
        pub fn status(&self) -> FileStatus
    );
}

impl FileRefMut<'_> {
    enum_passthrough!(self, (), Epoll, EventFd, Pipe;
        pub fn state(&self) -> FileState
    );
    enum_passthrough!(self, (), Epoll, EventFd, Pipe;
        pub fn mode(&self) -> FileMode
    );
    enum_passthrough!(self, (), Epoll, EventFd, Pipe;
        pub fn status(&self) -> FileStatus
    );
    enum_passthrough!(self, (status), Epoll, EventFd, Pipe;
        pub fn set_status(&mut self, status: FileStatus)
    );
    enum_passthrough!(self, (cb_queue), Epoll, EventFd, Pipe;
        pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError>
    );
    enum_passthrough!(self, (bytes, cb_queue), Epoll, EventFd, Pipe;
        pub fn read(&mut self, bytes: &mut [u8], cb_queue: &mut CallbackQueue) -> Result<usize, SyscallError>
    );
    enum_passthrough!(self, (bytes, cb_queue), Epoll, EventFd, Pipe;
        pub fn write(&mut self, bytes: &[u8], cb_queue: &mut CallbackQueue) -> Result<usize, SyscallError>
    );
    enum_passthrough!(self, (monitoring, filter, notify_fn), Epoll, EventFd, Pipe;
        pub fn add_listener(
            &mut self,
            monitoring: FileState,
            filter: StateListenerFilter,
            notify_fn: impl Fn(FileState, FileState, &mut CallbackQueue) + Send + Sync + 'static,
        ) -> StateListenHandle
    );
}

bitflags::bitflags! {
    // Linux only supports a single descriptor flag:
    // https://www.gnu.org/software/libc/manual/html_node/Descriptor-Flags.html
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct DescriptorFlags: libc::c_int {
        const CLOEXEC = libc::FD_CLOEXEC;
    }
}

/// A file descriptor that points to a file.
#[derive(Clone, Debug)]
pub struct Descriptor {
    /// The file that this descriptor points to.
    file: File,
    /// Descriptor flags.
    flags: DescriptorFlags,
    /// A count of how many open descriptors there are with reference to this file. Since a
    /// reference to the file can be held by other objects like a pending syscall condition, it
    /// should be true that `Arc::strong_count(&self.open_count)` <= `Arc::strong_count(&file)`.
    open_count: Arc<()>,
}

impl Descriptor {
    pub fn new(file: File) -> Self {
        Self {
            file,
            flags: DescriptorFlags::empty(),
            open_count: Arc::new(()),
        }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn flags(&self) -> DescriptorFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: DescriptorFlags) {
        self.flags = flags;
    }

    /// Close the descriptor, and if this is the last descriptor pointing to its file, close
    /// the file as well.
    pub fn close(self, cb_queue: &mut CallbackQueue) -> Option<Result<(), SyscallError>> {
        // this isn't subject to race conditions since we should never access descriptors
        // from multiple threads at the same time
        if Arc::<()>::strong_count(&self.open_count) == 1 {
            Some(self.file.borrow_mut().close(cb_queue))
        } else {
            None
        }
    }

    /// Duplicate the descriptor, with both descriptors pointing to the same `File`. In
    /// Linux, the descriptor flags aren't typically copied to the new descriptor, so we
    /// explicitly require a flags value to avoid confusion.
    pub fn dup(&self, flags: DescriptorFlags) -> Self {
        let mut new_desc = self.clone();
        new_desc.set_flags(flags);
        new_desc
    }
}
