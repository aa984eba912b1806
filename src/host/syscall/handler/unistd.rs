use log::*;
use nix::errno::Errno;
use nix::fcntl::OFlag;

use crate::host::descriptor::descriptor_table::DescriptorHandle;
use crate::host::descriptor::pipe::Pipe;
use crate::host::descriptor::{Descriptor, DescriptorFlags, File, FileState, FileStatus};
use crate::host::syscall::handler::{SyscallContext, SyscallHandler};
use crate::host::syscall::types::{ForeignArrayPtr, ForeignPtr, SyscallError};
use crate::utility::callback_queue::CallbackQueue;

impl SyscallHandler {
    pub fn close(ctx: &mut SyscallContext, fd: libc::c_int) -> Result<libc::c_int, SyscallError> {
        trace!("Trying to close fd {fd}");

        let fd = DescriptorHandle::try_from(fd).or(Err(Errno::EBADF))?;

        // according to "man 2 close", in Linux any errors that may occur will happen after the fd is
        // released, so we should always deregister the descriptor even if there's an error while
        // closing
        let desc = ctx
            .objs
            .process
            .descriptor_table_borrow_mut()
            .deregister_descriptor(fd)
            .ok_or(Errno::EBADF)?;

        // if there are still valid descriptors to the open file, close() will do nothing
        // and return None
        CallbackQueue::queue_and_run(|cb_queue| desc.close(cb_queue))
            .unwrap_or(Ok(()))
            .map(|()| 0)
    }

    pub fn dup(ctx: &mut SyscallContext, fd: libc::c_int) -> Result<libc::c_int, SyscallError> {
        // get the descriptor, or return early if it doesn't exist
        let new_desc = {
            let desc_table = ctx.objs.process.descriptor_table_borrow();
            let desc = Self::get_descriptor(&desc_table, fd)?;

            // duplicate the descriptor
            desc.dup(DescriptorFlags::empty())
        };

        // the new descriptor shares its file with `fd`, so closing it on failure is harmless
        Self::register_or_close(ctx, new_desc)
    }

    pub fn read(
        ctx: &mut SyscallContext,
        fd: libc::c_int,
        buf_ptr: ForeignPtr<u8>,
        buf_size: libc::size_t,
    ) -> Result<libc::size_t, SyscallError> {
        let file = Self::get_file(ctx, fd)?;

        let mut mem = ctx.objs.process.memory_borrow_mut();
        let mut buf = mem.memory_ref_mut(ForeignArrayPtr::new(buf_ptr, buf_size))?;

        let rv = CallbackQueue::queue_and_run(|cb_queue| file.borrow_mut().read(&mut buf, cb_queue));

        match rv {
            Ok(num_read) => {
                buf.flush()?;
                Ok(num_read)
            }
            Err(e) => {
                buf.noflush();
                Err(Self::block_if_would_block(e, file, FileState::READABLE))
            }
        }
    }

    pub fn write(
        ctx: &mut SyscallContext,
        fd: libc::c_int,
        buf_ptr: ForeignPtr<u8>,
        buf_size: libc::size_t,
    ) -> Result<libc::size_t, SyscallError> {
        let file = Self::get_file(ctx, fd)?;

        let buf = ctx
            .objs
            .process
            .memory_borrow()
            .read_vals(ForeignArrayPtr::new(buf_ptr, buf_size))?;

        CallbackQueue::queue_and_run(|cb_queue| file.borrow_mut().write(&buf, cb_queue))
            .map_err(|e| Self::block_if_would_block(e, file, FileState::WRITABLE))
    }

    pub fn pipe2(
        ctx: &mut SyscallContext,
        fd_ptr: ForeignPtr<[libc::c_int; 2]>,
        flags: libc::c_int,
    ) -> Result<libc::c_int, SyscallError> {
        // make sure they didn't pass a NULL pointer
        if fd_ptr.is_null() {
            return Err(Errno::EFAULT.into());
        }

        let Some(flags) = OFlag::from_bits(flags) else {
            debug!("Invalid pipe2 flags: {flags}");
            return Err(Errno::EINVAL.into());
        };

        let mut file_flags = FileStatus::empty();
        let mut descriptor_flags = DescriptorFlags::empty();

        if flags.contains(OFlag::O_NONBLOCK) {
            file_flags.insert(FileStatus::NONBLOCK);
        }

        if flags.contains(OFlag::O_CLOEXEC) {
            descriptor_flags.insert(DescriptorFlags::CLOEXEC);
        }

        // the user requested flags that we don't support
        let unsupported = flags - (OFlag::O_NONBLOCK | OFlag::O_CLOEXEC);
        if !unsupported.is_empty() {
            debug!("Unsupported pipe2 flags: {unsupported:?}");
            return Err(Errno::EINVAL.into());
        }

        let (reader, writer) =
            CallbackQueue::queue_and_run(|cb_queue| Pipe::new_pair(file_flags, cb_queue));

        // file descriptors for the read and write file objects
        let mut reader_desc = Descriptor::new(File::Pipe(reader));
        let mut writer_desc = Descriptor::new(File::Pipe(writer));

        // set the file descriptor flags
        reader_desc.set_flags(descriptor_flags);
        writer_desc.set_flags(descriptor_flags);

        // register the file descriptors
        let read_fd = match Self::register_or_close(ctx, reader_desc) {
            Ok(fd) => fd,
            Err(e) => {
                // ignore any errors when closing
                CallbackQueue::queue_and_run(|cb_queue| writer_desc.close(cb_queue));
                return Err(e);
            }
        };

        let write_fd = match Self::register_or_close(ctx, writer_desc) {
            Ok(fd) => fd,
            Err(e) => {
                Self::deregister_and_close(ctx, &[read_fd]);
                return Err(e);
            }
        };

        // try to write them to the caller
        let write_res = ctx
            .objs
            .process
            .memory_borrow_mut()
            .write(fd_ptr, &[read_fd, write_fd]);

        // clean up in case of error
        if let Err(e) = write_res {
            Self::deregister_and_close(ctx, &[read_fd, write_fd]);
            return Err(e.into());
        }

        trace!("Created pipe with read fd {read_fd} and write fd {write_fd}");

        Ok(0)
    }

    /// Internal helper that removes the descriptors from the table and closes them, ignoring
    /// errors.
    fn deregister_and_close(ctx: &SyscallContext, fds: &[libc::c_int]) {
        let descs: Vec<_> = {
            let mut desc_table = ctx.objs.process.descriptor_table_borrow_mut();
            fds.iter()
                .filter_map(|fd| DescriptorHandle::try_from(*fd).ok())
                .filter_map(|fd| desc_table.deregister_descriptor(fd))
                .collect()
        };

        CallbackQueue::queue_and_run(|cb_queue| {
            for desc in descs {
                let _ = desc.close(cb_queue);
            }
        });
    }

    /// Internal helper that returns a reference to the file at `fd`.
    fn get_file(ctx: &SyscallContext, fd: libc::c_int) -> Result<File, Errno> {
        let desc_table = ctx.objs.process.descriptor_table_borrow();
        Ok(Self::get_descriptor(&desc_table, fd)?.file().clone())
    }

    /// Turn an `EWOULDBLOCK` error from a blocking file into a request to block until `file`
    /// reaches `state`. Other errors are returned unchanged.
    fn block_if_would_block(e: SyscallError, file: File, state: FileState) -> SyscallError {
        let is_nonblocking = file.borrow().status().contains(FileStatus::NONBLOCK);

        match e {
            SyscallError::Failed(failed) if failed.errno == Errno::EWOULDBLOCK && !is_nonblocking => {
                trace!("File {file:?} would block; waiting for {state:?}");
                SyscallError::new_blocked_on_file(file, state)
            }
            e => e,
        }
    }
}
