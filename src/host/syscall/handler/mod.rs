use crate::host::context::ThreadContext;
use crate::host::descriptor::descriptor_table::{DescriptorHandle, DescriptorTable};
use crate::host::descriptor::Descriptor;
use crate::host::process::ProcessId;
use crate::host::syscall::types::{SyscallArgs, SyscallError, SyscallReg, SyscallResult};
use crate::host::thread::ThreadId;
use crate::linux_api::syscall::SyscallNum;
use crate::utility::callback_queue::CallbackQueue;
use crate::utility::counter::Counter;
use nix::errno::Errno;

mod epoll;
mod eventfd;
mod unistd;

pub struct SyscallHandler {
    /// The process that this `SyscallHandler` belongs to. Intended to be used for logging.
    process_id: ProcessId,
    /// The thread that this `SyscallHandler` belongs to. Intended to be used for logging.
    thread_id: ThreadId,
    /// The total number of syscalls that we have handled.
    num_syscalls: u64,
    /// A counter for individual syscalls.
    syscall_counter: Option<Counter>,
    /// If we are currently blocking a specific syscall, i.e., waiting for a file to be
    /// readable/writable or waiting for a timeout, the syscall number of that function is stored
    /// here. Will be `None` if a syscall is not currently blocked.
    blocked_syscall: Option<SyscallNum>,
}

impl SyscallHandler {
    pub fn new(process_id: ProcessId, thread_id: ThreadId, count_syscalls: bool) -> SyscallHandler {
        SyscallHandler {
            process_id,
            thread_id,
            num_syscalls: 0,
            syscall_counter: count_syscalls.then(Counter::new),
            blocked_syscall: None,
        }
    }

    pub fn syscall(&mut self, ctx: &ThreadContext, args: &SyscallArgs) -> SyscallResult {
        // it wouldn't make sense if we were given a different process and thread
        debug_assert_eq!(ctx.process.id(), self.process_id);
        debug_assert_eq!(ctx.thread.id(), self.thread_id);

        // syscall numbers that don't fit in a u32 aren't valid on any architecture
        let syscall = u32::try_from(args.number)
            .map(SyscallNum::new)
            .unwrap_or(SyscallNum::new(u32::MAX));
        let syscall_name = syscall.to_str().unwrap_or("unknown-syscall");

        // make sure that we either don't have a blocked syscall, or if we blocked a syscall, then
        // that same syscall should be executed again when it becomes unblocked
        if let Some(blocked_syscall) = self.blocked_syscall {
            if blocked_syscall != syscall {
                debug_panic!(
                    "We blocked syscall {blocked_syscall} but syscall {syscall} is unexpectedly being invoked"
                );
                // handle it as a new syscall
                self.blocked_syscall = None;
            }
        }

        // were we previously blocked on this same syscall?
        let was_blocked = self.blocked_syscall.is_some();

        log::trace!(
            "SYSCALL_HANDLER_PRE: {} ({}){} — ({}, tid={})",
            syscall_name,
            args.number,
            if was_blocked {
                " (previously BLOCKed)"
            } else {
                ""
            },
            ctx.process.name(),
            ctx.thread.id(),
        );

        // Count the frequency of each syscall, but only on the initial call. This avoids double
        // counting in the case where the initial call blocked at first, but then later became
        // unblocked and is now being handled again here.
        if let Some(syscall_counter) = self.syscall_counter.as_mut() {
            if !was_blocked {
                syscall_counter.add_one(syscall_name);
            }
        }

        let rv = self.run_handler(ctx, args, syscall);

        if !matches!(rv, Err(SyscallError::Blocked(_))) {
            // the syscall completed, count it
            self.num_syscalls += 1;
        }

        if log::log_enabled!(log::Level::Trace) {
            let rv_formatted = match &rv {
                Ok(reg) => format!("{}", i64::from(*reg)),
                Err(SyscallError::Failed(failed)) => {
                    let errno = failed.errno;
                    format!("{} ({errno})", -(errno as i64))
                }
                Err(SyscallError::Blocked(_)) => "<blocked>".to_string(),
            };

            log::trace!(
                "SYSCALL_HANDLER_POST: {} ({}) result {}{} — ({}, tid={})",
                syscall_name,
                args.number,
                if was_blocked { "BLOCK -> " } else { "" },
                rv_formatted,
                ctx.process.name(),
                ctx.thread.id(),
            );
        }

        if matches!(rv, Err(SyscallError::Blocked(_))) {
            // we are blocking: store the syscall number so we know to expect the same syscall again
            // when it unblocks
            self.blocked_syscall = Some(syscall);
        } else {
            self.blocked_syscall = None;
        }

        rv
    }

    fn run_handler(
        &mut self,
        ctx: &ThreadContext,
        args: &SyscallArgs,
        syscall: SyscallNum,
    ) -> SyscallResult {
        let mut ctx = SyscallContext {
            objs: ctx,
            args,
            handler: self,
        };

        macro_rules! handle {
            ($f:ident) => {{
                SyscallHandlerFn::call(Self::$f, &mut ctx)
            }};
        }

        match syscall {
            SyscallNum::NR_close => handle!(close),
            SyscallNum::NR_dup => handle!(dup),
            SyscallNum::NR_epoll_create => handle!(epoll_create),
            SyscallNum::NR_epoll_create1 => handle!(epoll_create1),
            SyscallNum::NR_epoll_ctl => handle!(epoll_ctl),
            SyscallNum::NR_epoll_pwait => handle!(epoll_pwait),
            SyscallNum::NR_epoll_pwait2 => handle!(epoll_pwait2),
            SyscallNum::NR_epoll_wait => handle!(epoll_wait),
            SyscallNum::NR_eventfd => handle!(eventfd),
            SyscallNum::NR_eventfd2 => handle!(eventfd2),
            SyscallNum::NR_pipe2 => handle!(pipe2),
            SyscallNum::NR_read => handle!(read),
            SyscallNum::NR_write => handle!(write),
            //
            // UNSUPPORTED SYSCALL
            //
            _ => {
                warn_once_then_trace!(
                    "(LOG_ONCE) Detected unsupported syscall {} called from thread {} in process {}",
                    ctx.args.number,
                    ctx.objs.thread.id(),
                    ctx.objs.process.name(),
                );
                Err(Errno::ENOSYS.into())
            }
        }
    }

    /// Did the last syscall result in `SyscallError::Blocked`? If called from a syscall handler and
    /// `is_blocked()` returns `true`, then the current syscall is the same syscall that previously
    /// blocked. For example, if currently running the `epoll_wait` syscall handler and
    /// `is_blocked()` is `true`, then the previous syscall handler that ran was also `epoll_wait`
    /// and it returned `SyscallError::Blocked`.
    pub fn is_blocked(&self) -> bool {
        self.blocked_syscall.is_some()
    }

    /// Forget the blocked syscall, so that the thread can make a different syscall next.
    pub fn clear_blocked(&mut self) {
        self.blocked_syscall = None;
    }

    pub fn num_syscalls(&self) -> u64 {
        self.num_syscalls
    }

    pub fn syscall_counter(&self) -> Option<&Counter> {
        self.syscall_counter.as_ref()
    }

    /// Internal helper that adds a new descriptor to the process's table and returns its fd. If
    /// the table is full, the descriptor is closed and EMFILE is returned.
    fn register_or_close(
        ctx: &SyscallContext,
        desc: Descriptor,
    ) -> Result<std::ffi::c_int, SyscallError> {
        let rv = ctx
            .objs
            .process
            .descriptor_table_borrow_mut()
            .register_descriptor(desc);

        match rv {
            Ok(fd) => Ok(fd.into()),
            Err(desc) => {
                CallbackQueue::queue_and_run(|cb_queue| desc.close(cb_queue));
                Err(Errno::EMFILE.into())
            }
        }
    }

    /// Internal helper that returns the `Descriptor` for the fd if it exists, otherwise returns
    /// EBADF.
    fn get_descriptor(
        descriptor_table: &DescriptorTable,
        fd: impl TryInto<DescriptorHandle>,
    ) -> Result<&Descriptor, Errno> {
        // check that fd is within bounds
        let fd = fd.try_into().or(Err(Errno::EBADF))?;

        match descriptor_table.get(fd) {
            Some(desc) => Ok(desc),
            None => Err(Errno::EBADF),
        }
    }
}

impl std::ops::Drop for SyscallHandler {
    fn drop(&mut self) {
        log::debug!("Handled {} syscalls", self.num_syscalls);

        if let Some(syscall_counter) = self.syscall_counter.as_ref() {
            // log the plugin thread specific counts
            log::debug!(
                "Thread {} syscall counts: {}",
                self.thread_id,
                syscall_counter,
            );
        }
    }
}

pub struct SyscallContext<'a, 'b> {
    pub objs: &'a ThreadContext<'b>,
    pub args: &'a SyscallArgs,
    pub handler: &'a mut SyscallHandler,
}

pub trait SyscallHandlerFn<T> {
    fn call(self, ctx: &mut SyscallContext) -> SyscallResult;
}

/// Implements [`SyscallHandlerFn`] for handlers that take the listed register arguments. Each
/// register is converted with `From<SyscallReg>`, and the result with `Into<SyscallReg>`.
macro_rules! impl_handler_fn {
    ($($arg:ident: $idx:literal),+) => {
        impl<F, R, $($arg),+> SyscallHandlerFn<($($arg,)+)> for F
        where
            F: Fn(&mut SyscallContext, $($arg),+) -> Result<R, SyscallError>,
            R: Into<SyscallReg>,
            $($arg: From<SyscallReg>,)+
        {
            fn call(self, ctx: &mut SyscallContext) -> SyscallResult {
                let args = ctx.args;
                self(ctx, $(args.get($idx).into()),+).map(Into::into)
            }
        }
    };
}

impl_handler_fn!(A0: 0);
impl_handler_fn!(A0: 0, A1: 1);
impl_handler_fn!(A0: 0, A1: 1, A2: 2);
impl_handler_fn!(A0: 0, A1: 1, A2: 2, A3: 3);
impl_handler_fn!(A0: 0, A1: 1, A2: 2, A3: 3, A4: 4);
