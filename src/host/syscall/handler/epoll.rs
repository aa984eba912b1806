use std::sync::Arc;

use nix::errno::Errno;

use crate::core::support::simulation_time::SimulationTime;
use crate::host::descriptor::epoll::Epoll;
use crate::host::descriptor::{Descriptor, DescriptorFlags, File, FileState};
use crate::host::syscall::handler::{SyscallContext, SyscallHandler};
use crate::host::syscall::types::{ForeignArrayPtr, ForeignPtr, SyscallError};
use crate::linux_api::epoll::{epoll_event, EpollCreateFlags, EpollCtlOp, EpollEvents};
use crate::linux_api::time::timespec;
use crate::utility::callback_queue::CallbackQueue;

impl SyscallHandler {
    pub fn epoll_create(
        ctx: &mut SyscallContext,
        size: std::ffi::c_int,
    ) -> Result<std::ffi::c_int, SyscallError> {
        // epoll_create(2): "Since Linux 2.6.8, the size argument is ignored, but must be greater
        // than zero"
        if size <= 0 {
            return Err(Errno::EINVAL.into());
        }

        Self::epoll_create_helper(ctx, 0)
    }

    pub fn epoll_create1(
        ctx: &mut SyscallContext,
        flags: std::ffi::c_int,
    ) -> Result<std::ffi::c_int, SyscallError> {
        Self::epoll_create_helper(ctx, flags)
    }

    fn epoll_create_helper(
        ctx: &mut SyscallContext,
        flags: std::ffi::c_int,
    ) -> Result<std::ffi::c_int, SyscallError> {
        let Some(flags) = EpollCreateFlags::from_bits(flags) else {
            log::debug!("Invalid epoll_create flags: {flags}");
            return Err(Errno::EINVAL.into());
        };

        let mut desc_flags = DescriptorFlags::empty();

        if flags.contains(EpollCreateFlags::EPOLL_CLOEXEC) {
            desc_flags.insert(DescriptorFlags::CLOEXEC);
        }

        let mut desc = Descriptor::new(File::Epoll(Epoll::new()));
        desc.set_flags(desc_flags);

        let fd = Self::register_or_close(ctx, desc)?;

        log::trace!("Created epoll fd {fd}");

        Ok(fd)
    }

    pub fn epoll_ctl(
        ctx: &mut SyscallContext,
        epfd: std::ffi::c_int,
        op: std::ffi::c_int,
        fd: std::ffi::c_int,
        event_ptr: ForeignPtr<epoll_event>,
    ) -> Result<std::ffi::c_int, SyscallError> {
        // Make sure they didn't pass a NULL pointer, even for EPOLL_CTL_DEL.
        if event_ptr.is_null() {
            log::debug!("NULL event pointer passed for epoll {epfd}");
            return Err(Errno::EFAULT.into());
        }

        // The event is ignored for EPOLL_CTL_DEL, so there's no need to read it.
        let has_event = op != i32::from(EpollCtlOp::EPOLL_CTL_DEL);

        // Extract the events and data before looking at anything else.
        let (events, data) = if has_event {
            let ev = ctx.objs.process.memory_borrow().read(event_ptr)?;

            // fields of a packed struct must be copied out before use
            let (ev_events, ev_data) = (ev.events, ev.data);

            let Some(mut events) = EpollEvents::from_bits(ev_events) else {
                log::debug!("Invalid epoll_ctl events: {ev_events:#x}");
                return Err(Errno::EINVAL.into());
            };

            // epoll_ctl(2): epoll always reports for EPOLLERR and EPOLLHUP
            events.insert(EpollEvents::EPOLLERR | EpollEvents::EPOLLHUP);

            (events, ev_data)
        } else {
            (EpollEvents::empty(), 0)
        };

        // An epoll instance is not allowed to monitor itself.
        if epfd == fd {
            return Err(Errno::EINVAL.into());
        }

        // We'll need to look up descriptors.
        let desc_table = ctx.objs.process.descriptor_table_borrow();

        // Get the epoll descriptor, or return early if it doesn't exist or isn't an epoll.
        let epoll = Arc::clone(desc_table.lookup::<Epoll>(epfd)?);

        // Extract the operation.
        let Ok(op) = EpollCtlOp::try_from(op) else {
            log::debug!("Invalid epoll op: {op}");
            return Err(Errno::EINVAL.into());
        };

        let target = match Self::get_descriptor(&desc_table, fd) {
            Ok(desc) => Some(desc.file().clone()),
            Err(_) if fd < 0 => return Err(Errno::EBADF.into()),
            Err(_) => None,
        };

        drop(desc_table);

        let Some(target) = target else {
            return Self::epoll_ctl_os(ctx, &epoll, epfd, op, fd, events, data);
        };

        // The same epoll may be reachable from another descriptor.
        if target == File::Epoll(Arc::clone(&epoll)) {
            return Err(Errno::EINVAL.into());
        }

        // epoll_ctl(2): "ELOOP: fd refers to an epoll instance and this EPOLL_CTL_ADD operation
        // would result in a circular loop of epoll instances monitoring one another"
        if op == EpollCtlOp::EPOLL_CTL_ADD && Epoll::would_loop(&epoll, &target) {
            return Err(Errno::ELOOP.into());
        }

        log::trace!("Calling epoll_ctl on epoll {epfd} with child {fd}");

        CallbackQueue::queue_and_run(|cb_queue| {
            let weak_epoll = Arc::downgrade(&epoll);
            epoll
                .borrow_mut()
                .ctl(op, fd, target, events, data, weak_epoll, cb_queue)
        })?;

        Ok(0)
    }

    /// `epoll_ctl` for a descriptor that has no simulated file.
    fn epoll_ctl_os(
        ctx: &mut SyscallContext,
        epoll: &Arc<atomic_refcell::AtomicRefCell<Epoll>>,
        epfd: std::ffi::c_int,
        op: EpollCtlOp,
        fd: std::ffi::c_int,
        events: EpollEvents,
        data: u64,
    ) -> Result<std::ffi::c_int, SyscallError> {
        if !ctx.objs.process.options().use_os_epoll_fallback {
            return Err(Errno::EBADF.into());
        }

        let os_fd = ctx.objs.process.os_handle(fd).unwrap_or(fd);

        log::trace!("Calling epoll_ctl on epoll {epfd} with OS fd {os_fd} (fd {fd})");

        CallbackQueue::queue_and_run(|cb_queue| {
            epoll
                .borrow_mut()
                .ctl_os(op, os_fd, events, data, cb_queue)
        })?;

        Ok(0)
    }

    pub fn epoll_wait(
        ctx: &mut SyscallContext,
        epfd: std::ffi::c_int,
        events_ptr: ForeignPtr<epoll_event>,
        max_events: std::ffi::c_int,
        timeout: std::ffi::c_int,
    ) -> Result<std::ffi::c_int, SyscallError> {
        let timeout = timeout_arg_to_maybe_simtime(timeout)?;
        Self::epoll_wait_helper(ctx, epfd, events_ptr, max_events, timeout, ForeignPtr::null())
    }

    pub fn epoll_pwait(
        ctx: &mut SyscallContext,
        epfd: std::ffi::c_int,
        events_ptr: ForeignPtr<epoll_event>,
        max_events: std::ffi::c_int,
        timeout: std::ffi::c_int,
        sigmask_ptr: ForeignPtr<libc::sigset_t>,
    ) -> Result<std::ffi::c_int, SyscallError> {
        let timeout = timeout_arg_to_maybe_simtime(timeout)?;
        Self::epoll_wait_helper(ctx, epfd, events_ptr, max_events, timeout, sigmask_ptr)
    }

    pub fn epoll_pwait2(
        ctx: &mut SyscallContext,
        epfd: std::ffi::c_int,
        events_ptr: ForeignPtr<epoll_event>,
        max_events: std::ffi::c_int,
        timeout_ptr: ForeignPtr<timespec>,
        sigmask_ptr: ForeignPtr<libc::sigset_t>,
    ) -> Result<std::ffi::c_int, SyscallError> {
        // epoll_wait(2): "If timeout is NULL, then epoll_pwait2() can block indefinitely"
        let timeout = if timeout_ptr.is_null() {
            None
        } else {
            let tspec = ctx.objs.process.memory_borrow().read(timeout_ptr)?;
            let sim_time = SimulationTime::try_from(tspec).map_err(|_| Errno::EINVAL)?;
            Some(sim_time)
        };

        Self::epoll_wait_helper(ctx, epfd, events_ptr, max_events, timeout, sigmask_ptr)
    }

    fn epoll_wait_helper(
        ctx: &mut SyscallContext,
        epfd: std::ffi::c_int,
        events_ptr: ForeignPtr<epoll_event>,
        max_events: std::ffi::c_int,
        timeout: Option<SimulationTime>,
        sigmask_ptr: ForeignPtr<libc::sigset_t>,
    ) -> Result<std::ffi::c_int, SyscallError> {
        // Linux enforces a range for max_events.
        let max_events = {
            let upper_bound = epoll_max_events_upper_bound();

            if max_events <= 0 || max_events > upper_bound {
                log::trace!(
                    "Epoll maxevents {max_events} is not greater than 0 \
                            and less than {upper_bound}"
                );
                return Err(Errno::EINVAL.into());
            }

            // positive, so it fits
            u32::try_from(max_events).unwrap()
        };

        // We must have a valid location to return the events before we look at the epoll.
        if events_ptr.is_null() {
            return Err(Errno::EFAULT.into());
        }

        // epoll_wait(2): "The sigmask argument may be specified as NULL, in which case
        // epoll_pwait() is equivalent to epoll_wait()"
        if !sigmask_ptr.is_null() {
            warn_once_then_trace!(
                "(LOG_ONCE) Epoll pwait called with non-null sigmask, \
                which is not supported; returning EINVAL"
            );
            return Err(Errno::EINVAL.into());
        }

        // Get the epoll, or return early if it doesn't exist or isn't an epoll.
        let epoll = Arc::clone(
            ctx.objs
                .process
                .descriptor_table_borrow()
                .lookup::<Epoll>(epfd)?,
        );

        let num_ready = epoll.borrow().num_ready();

        if num_ready > 0 {
            log::trace!("Epoll {epfd} has {num_ready} ready events");

            let ready = epoll.borrow().collect_ready_events(max_events);
            debug_assert!(ready.len() <= max_events as usize);

            let events: Vec<epoll_event> = ready
                .into_iter()
                .map(|(events, data)| epoll_event::new(events, data))
                .collect();

            // Write the events out to the managed process memory.
            let events_ptr = ForeignArrayPtr::new(events_ptr, events.len());
            ctx.objs
                .process
                .memory_borrow_mut()
                .write_vals(events_ptr, &events)?;

            // Return the number of events we are reporting; at most `max_events`, so it fits.
            return Ok(events.len().try_into().unwrap());
        }

        // Our behavior depends on the value of timeout.
        // Return immediately if timeout is 0.
        if timeout.is_some_and(|x| x.is_zero()) {
            log::trace!("No events are ready on epoll {epfd} and the timeout is 0");
            return Ok(0);
        }

        // We were already blocked and woke up, either because the timeout expired or because the
        // epoll was readable for a moment. Either way there are no events to report.
        if ctx.handler.is_blocked() {
            if timeout_expired(ctx) {
                log::trace!("No events are ready on epoll {epfd} and the timeout expired");
            } else {
                log::trace!("No events are ready on epoll {epfd} after waking up");
            }
            return Ok(0);
        }

        // Convert timeout to an EmulatedTime.
        let Ok(timeout) = timeout
            .map(|x| ctx.objs.now.checked_add(x).ok_or(()))
            .transpose()
        else {
            log::trace!("Epoll wait with invalid timeout {timeout:?} (too large)");
            return Err(Errno::EINVAL.into());
        };

        log::trace!("No events are ready on epoll {epfd} and we need to block");

        // Block on epoll status; an epoll descriptor is readable when it has events.
        let mut rv = SyscallError::new_blocked_on_file(File::Epoll(epoll), FileState::READABLE);

        // Set timeout, if provided.
        // `new_blocked_on_file` always returns a blocked error
        rv.blocked_condition().unwrap().set_timeout(timeout);

        Err(rv)
    }
}

fn timeout_expired(ctx: &SyscallContext) -> bool {
    let Some(cond) = ctx.objs.thread.syscall_condition() else {
        return false;
    };

    let Some(timeout) = cond.timeout() else {
        // there is no timeout
        return false;
    };

    ctx.objs.now >= timeout
}

fn timeout_arg_to_maybe_simtime(
    timeout: std::ffi::c_int,
) -> Result<Option<SimulationTime>, SyscallError> {
    // epoll_wait(2): "Specifying a timeout of -1 causes epoll_wait() to block indefinitely"
    let timeout = (timeout >= 0).then_some(timeout);

    if let Some(timeout) = timeout {
        // a non-negative c_int should always convert to a u64
        let timeout = timeout.try_into().unwrap();
        let timeout = SimulationTime::try_from_millis(timeout).ok_or(Errno::EINVAL)?;
        Ok(Some(timeout))
    } else {
        Ok(None)
    }
}

fn epoll_max_events_upper_bound() -> i32 {
    let ep_max_events = i32::MAX;
    let ep_ev_size: i32 = std::mem::size_of::<epoll_event>()
        .try_into()
        .unwrap_or(i32::MAX);
    ep_max_events.saturating_div(ep_ev_size)
}
