use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use nix::errno::Errno;
use nix::sys::eventfd::EfdFlags;

use crate::host::descriptor::eventfd::EventFd;
use crate::host::descriptor::{Descriptor, DescriptorFlags, File, FileStatus};
use crate::host::syscall::handler::{SyscallContext, SyscallHandler};
use crate::host::syscall::types::SyscallError;

impl SyscallHandler {
    pub fn eventfd(
        ctx: &mut SyscallContext,
        init_val: libc::c_uint,
    ) -> Result<libc::c_int, SyscallError> {
        Self::eventfd_helper(ctx, init_val, 0)
    }

    pub fn eventfd2(
        ctx: &mut SyscallContext,
        init_val: libc::c_uint,
        flags: libc::c_int,
    ) -> Result<libc::c_int, SyscallError> {
        Self::eventfd_helper(ctx, init_val, flags)
    }

    fn eventfd_helper(
        ctx: &mut SyscallContext,
        init_val: libc::c_uint,
        flags: libc::c_int,
    ) -> Result<libc::c_int, SyscallError> {
        log::trace!("eventfd() called with initval {init_val} and flags {flags}");

        // get the flags
        let Some(flags) = EfdFlags::from_bits(flags) else {
            log::debug!("Invalid eventfd flags: {flags}");
            return Err(Errno::EINVAL.into());
        };

        let mut file_flags = FileStatus::empty();
        let mut descriptor_flags = DescriptorFlags::empty();

        if flags.contains(EfdFlags::EFD_NONBLOCK) {
            file_flags.insert(FileStatus::NONBLOCK);
        }

        if flags.contains(EfdFlags::EFD_CLOEXEC) {
            descriptor_flags.insert(DescriptorFlags::CLOEXEC);
        }

        let semaphore_mode = flags.contains(EfdFlags::EFD_SEMAPHORE);

        let file = EventFd::new(init_val.into(), semaphore_mode, file_flags);
        let file = Arc::new(AtomicRefCell::new(file));

        let mut desc = Descriptor::new(File::EventFd(file));
        desc.set_flags(descriptor_flags);

        let fd = Self::register_or_close(ctx, desc)?;

        log::trace!("eventfd() returning fd {fd}");

        Ok(fd)
    }
}
