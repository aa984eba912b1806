//! Drives the emulated epoll syscalls the way a managed thread would: arguments go in registers,
//! structs go through the process's memory, and blocked syscalls are re-run after wakeup.

use std::os::fd::AsRawFd;

use shadow_epoll::core::support::emulated_time::EmulatedTime;
use shadow_epoll::core::support::simulation_time::SimulationTime;
use shadow_epoll::host::process::{Process, ProcessOptions};
use shadow_epoll::host::syscall::condition::WakeupReason;
use shadow_epoll::host::syscall::types::{
    ForeignArrayPtr, ForeignPtr, SyscallArgs, SyscallReg, SyscallReturn,
};
use shadow_epoll::host::thread::Thread;
use shadow_epoll::linux_api::epoll::{epoll_event, EpollCtlOp, EpollEvents};
use shadow_epoll::linux_api::syscall::SyscallNum;
use shadow_epoll::linux_api::time::timespec;

use nix::errno::Errno;

const HEAP_START: usize = 0x10000;
const HEAP_LEN: usize = 0x10000;

const ADD: i32 = EpollCtlOp::EPOLL_CTL_ADD as i32;
const MOD: i32 = EpollCtlOp::EPOLL_CTL_MOD as i32;
const DEL: i32 = EpollCtlOp::EPOLL_CTL_DEL as i32;

/// A process with one mapped heap region and a simulated clock.
struct Sim {
    process: Process,
    now: EmulatedTime,
    next_addr: usize,
}

impl Sim {
    fn new() -> Self {
        Self::with_options(ProcessOptions::default())
    }

    fn with_options(options: ProcessOptions) -> Self {
        let process = Process::new(1.into(), "test-process", options);
        process
            .memory_borrow_mut()
            .map(HEAP_START, HEAP_LEN)
            .unwrap();

        Self {
            process,
            now: EmulatedTime::SIMULATION_START,
            next_addr: HEAP_START,
        }
    }

    fn thread(&self, id: u32) -> Thread {
        Thread::new(&self.process, id.into())
    }

    /// Reserve `count` values of `T` in the heap.
    fn alloc<T>(&mut self, count: usize) -> ForeignPtr<T> {
        let addr = self.next_addr;
        self.next_addr += count * std::mem::size_of::<T>();
        assert!(self.next_addr <= HEAP_START + HEAP_LEN);
        ForeignPtr::new(addr)
    }

    fn advance(&mut self, by: SimulationTime) {
        self.now = self.now.checked_add(by).unwrap();
    }

    fn syscall(&self, thread: &Thread, nr: SyscallNum, args: &[SyscallReg]) -> SyscallReturn {
        let mut regs = [SyscallReg::default(); 6];
        regs[..args.len()].copy_from_slice(args);
        let args = SyscallArgs::new(nr.val().into(), regs);
        thread.handle_syscall(self.now, &self.process, &args)
    }

    /// Run a syscall that must complete, and return its result register.
    fn done(&self, thread: &Thread, nr: SyscallNum, args: &[SyscallReg]) -> i64 {
        match self.syscall(thread, nr, args) {
            SyscallReturn::Done(rv) => rv,
            SyscallReturn::Block => panic!("syscall {nr} unexpectedly blocked"),
        }
    }

    fn fd(&self, thread: &Thread, nr: SyscallNum, args: &[SyscallReg]) -> i32 {
        let rv = self.done(thread, nr, args);
        assert!(rv >= 0, "syscall {nr} failed with {rv}");
        rv.try_into().unwrap()
    }

    fn ctl(
        &mut self,
        thread: &Thread,
        epfd: i32,
        op: i32,
        fd: i32,
        events: EpollEvents,
        data: u64,
    ) -> i64 {
        let ev_ptr = self.alloc::<epoll_event>(1);
        self.process
            .memory_borrow_mut()
            .write(ev_ptr, &epoll_event::new(events, data))
            .unwrap();
        self.done(
            thread,
            SyscallNum::NR_epoll_ctl,
            &[epfd.into(), op.into(), fd.into(), ev_ptr.into()],
        )
    }

    fn wait(
        &self,
        thread: &Thread,
        epfd: i32,
        events_ptr: ForeignPtr<epoll_event>,
        max_events: i32,
        timeout: i32,
    ) -> SyscallReturn {
        self.syscall(
            thread,
            SyscallNum::NR_epoll_wait,
            &[epfd.into(), events_ptr.into(), max_events.into(), timeout.into()],
        )
    }

    fn read_events(&self, ptr: ForeignPtr<epoll_event>, count: i64) -> Vec<(EpollEvents, u64)> {
        let count = usize::try_from(count).unwrap();
        self.process
            .memory_borrow()
            .read_vals(ForeignArrayPtr::new(ptr, count))
            .unwrap()
            .into_iter()
            .map(|ev| (EpollEvents::from_bits_retain(ev.events), ev.data))
            .collect()
    }

    fn write_u64(&mut self, thread: &Thread, fd: i32, val: u64) -> i64 {
        let ptr = self.alloc::<u64>(1);
        self.process.memory_borrow_mut().write(ptr, &val).unwrap();
        self.done(thread, SyscallNum::NR_write, &[fd.into(), ptr.into(), 8usize.into()])
    }

    fn read_u64(&mut self, thread: &Thread, fd: i32) -> i64 {
        let ptr = self.alloc::<u64>(1);
        self.done(thread, SyscallNum::NR_read, &[fd.into(), ptr.into(), 8usize.into()])
    }
}

fn errno(e: Errno) -> i64 {
    -(e as i64)
}

fn nonblocking_eventfd(sim: &Sim, thread: &Thread) -> i32 {
    sim.fd(
        thread,
        SyscallNum::NR_eventfd2,
        &[0u32.into(), libc::EFD_NONBLOCK.into()],
    )
}

#[test_log::test]
fn test_create() {
    let sim = Sim::new();
    let t = sim.thread(1);

    let epfd = sim.fd(&t, SyscallNum::NR_epoll_create, &[1.into()]);
    let epfd1 = sim.fd(&t, SyscallNum::NR_epoll_create1, &[libc::EPOLL_CLOEXEC.into()]);
    assert_ne!(epfd, epfd1);

    assert_eq!(
        sim.done(&t, SyscallNum::NR_epoll_create, &[0.into()]),
        errno(Errno::EINVAL)
    );
    assert_eq!(
        sim.done(&t, SyscallNum::NR_epoll_create, &[(-5).into()]),
        errno(Errno::EINVAL)
    );
    assert_eq!(
        sim.done(&t, SyscallNum::NR_epoll_create1, &[0x4.into()]),
        errno(Errno::EINVAL)
    );

    assert_eq!(sim.done(&t, SyscallNum::NR_close, &[epfd.into()]), 0);
    assert_eq!(
        sim.done(&t, SyscallNum::NR_close, &[epfd.into()]),
        errno(Errno::EBADF)
    );
}

#[test_log::test]
fn test_ctl_errors() {
    let mut sim = Sim::new();
    let t = sim.thread(1);

    let epfd = sim.fd(&t, SyscallNum::NR_epoll_create1, &[0.into()]);
    let efd = nonblocking_eventfd(&sim, &t);
    const IN: EpollEvents = EpollEvents::EPOLLIN;

    // not open
    assert_eq!(sim.ctl(&t, 100, ADD, efd, IN, 0), errno(Errno::EBADF));
    assert_eq!(sim.ctl(&t, epfd, ADD, -1, IN, 0), errno(Errno::EBADF));
    // not an epoll
    assert_eq!(sim.ctl(&t, efd, ADD, epfd, IN, 0), errno(Errno::EINVAL));
    // watching itself
    assert_eq!(sim.ctl(&t, epfd, ADD, epfd, IN, 0), errno(Errno::EINVAL));
    // bad op
    assert_eq!(sim.ctl(&t, epfd, 7, efd, IN, 0), errno(Errno::EINVAL));
    // bad event bits
    assert_eq!(
        sim.ctl(&t, epfd, ADD, efd, EpollEvents::from_bits_retain(1 << 20), 0),
        errno(Errno::EINVAL)
    );

    // not yet added
    assert_eq!(sim.ctl(&t, epfd, MOD, efd, IN, 0), errno(Errno::ENOENT));
    assert_eq!(sim.ctl(&t, epfd, DEL, efd, IN, 0), errno(Errno::ENOENT));

    assert_eq!(sim.ctl(&t, epfd, ADD, efd, IN, 0), 0);
    assert_eq!(sim.ctl(&t, epfd, ADD, efd, IN, 0), errno(Errno::EEXIST));
    assert_eq!(sim.ctl(&t, epfd, MOD, efd, EpollEvents::EPOLLOUT, 1), 0);

    // a null event is rejected for every op
    assert_eq!(
        sim.done(
            &t,
            SyscallNum::NR_epoll_ctl,
            &[epfd.into(), MOD.into(), efd.into(), ForeignPtr::<epoll_event>::null().into()],
        ),
        errno(Errno::EFAULT)
    );
    assert_eq!(
        sim.done(
            &t,
            SyscallNum::NR_epoll_ctl,
            &[epfd.into(), DEL.into(), efd.into(), ForeignPtr::<epoll_event>::null().into()],
        ),
        errno(Errno::EFAULT)
    );

    // the rejected DEL left the entry in place
    assert_eq!(sim.ctl(&t, epfd, DEL, efd, IN, 0), 0);
    assert_eq!(sim.ctl(&t, epfd, DEL, efd, IN, 0), errno(Errno::ENOENT));
}

#[test_log::test]
fn test_ctl_self_and_loops() {
    let mut sim = Sim::new();
    let t = sim.thread(1);
    const IN: EpollEvents = EpollEvents::EPOLLIN;

    let ep1 = sim.fd(&t, SyscallNum::NR_epoll_create1, &[0.into()]);
    let ep2 = sim.fd(&t, SyscallNum::NR_epoll_create1, &[0.into()]);
    let ep1_dup = sim.fd(&t, SyscallNum::NR_dup, &[ep1.into()]);

    // the same epoll through another descriptor
    assert_eq!(sim.ctl(&t, ep1, ADD, ep1_dup, IN, 0), errno(Errno::EINVAL));

    assert_eq!(sim.ctl(&t, ep1, ADD, ep2, IN, 0), 0);
    assert_eq!(sim.ctl(&t, ep2, ADD, ep1, IN, 0), errno(Errno::ELOOP));
}

#[test_log::test]
fn test_wait_errors() {
    let mut sim = Sim::new();
    let t = sim.thread(1);

    let epfd = sim.fd(&t, SyscallNum::NR_epoll_create1, &[0.into()]);
    let efd = nonblocking_eventfd(&sim, &t);
    let events = sim.alloc::<epoll_event>(4);

    use SyscallReturn::Done;
    assert_eq!(sim.wait(&t, epfd, events, 0, 0), Done(errno(Errno::EINVAL)));
    assert_eq!(sim.wait(&t, epfd, events, -1, 0), Done(errno(Errno::EINVAL)));
    assert_eq!(
        sim.wait(&t, epfd, events, i32::MAX, 0),
        Done(errno(Errno::EINVAL))
    );
    assert_eq!(
        sim.wait(&t, epfd, ForeignPtr::null(), 4, 0),
        Done(errno(Errno::EFAULT))
    );
    assert_eq!(sim.wait(&t, 100, events, 4, 0), Done(errno(Errno::EBADF)));
    assert_eq!(sim.wait(&t, efd, events, 4, 0), Done(errno(Errno::EINVAL)));

    // signal masks aren't supported
    let sigmask = sim.alloc::<libc::sigset_t>(1);
    assert_eq!(
        sim.syscall(
            &t,
            SyscallNum::NR_epoll_pwait,
            &[epfd.into(), events.into(), 4.into(), 0.into(), sigmask.into()],
        ),
        Done(errno(Errno::EINVAL))
    );

    // nothing ready
    assert_eq!(sim.wait(&t, epfd, events, 4, 0), Done(0));
}

/// An eventfd becomes readable and is reported with the caller's token until it's drained.
#[test_log::test]
fn test_level_triggered_eventfd() {
    let mut sim = Sim::new();
    let t = sim.thread(1);

    let epfd = sim.fd(&t, SyscallNum::NR_epoll_create1, &[0.into()]);
    let efd = nonblocking_eventfd(&sim, &t);
    let events = sim.alloc::<epoll_event>(10);

    assert_eq!(sim.ctl(&t, epfd, ADD, efd, EpollEvents::EPOLLIN, 42), 0);
    assert_eq!(sim.wait(&t, epfd, events, 10, 0), SyscallReturn::Done(0));

    assert_eq!(sim.write_u64(&t, efd, 1), 8);

    for _ in 0..2 {
        assert_eq!(sim.wait(&t, epfd, events, 10, -1), SyscallReturn::Done(1));
        assert_eq!(sim.read_events(events, 1), [(EpollEvents::EPOLLIN, 42)]);
    }

    assert_eq!(sim.read_u64(&t, efd), 8);
    assert_eq!(sim.wait(&t, epfd, events, 10, 0), SyscallReturn::Done(0));
}

#[test_log::test]
fn test_token_round_trip() {
    let mut sim = Sim::new();
    let t = sim.thread(1);

    let epfd = sim.fd(&t, SyscallNum::NR_epoll_create1, &[0.into()]);
    let efd = nonblocking_eventfd(&sim, &t);
    let events = sim.alloc::<epoll_event>(1);

    assert_eq!(sim.ctl(&t, epfd, ADD, efd, EpollEvents::EPOLLOUT, 0xDEADBEEF), 0);
    assert_eq!(sim.wait(&t, epfd, events, 1, 0), SyscallReturn::Done(1));
    assert_eq!(
        sim.read_events(events, 1),
        [(EpollEvents::EPOLLOUT, 0xDEADBEEF)]
    );

    // MOD replaces the token
    assert_eq!(sim.ctl(&t, epfd, MOD, efd, EpollEvents::EPOLLOUT, u64::MAX), 0);
    assert_eq!(sim.wait(&t, epfd, events, 1, 0), SyscallReturn::Done(1));
    assert_eq!(sim.read_events(events, 1), [(EpollEvents::EPOLLOUT, u64::MAX)]);
}

#[test_log::test]
fn test_max_events_and_order() {
    let mut sim = Sim::new();
    let t = sim.thread(1);

    let epfd = sim.fd(&t, SyscallNum::NR_epoll_create1, &[0.into()]);
    let events = sim.alloc::<epoll_event>(3);

    for token in 0..3 {
        let efd = nonblocking_eventfd(&sim, &t);
        assert_eq!(sim.ctl(&t, epfd, ADD, efd, EpollEvents::EPOLLOUT, token), 0);
    }

    assert_eq!(sim.wait(&t, epfd, events, 2, 0), SyscallReturn::Done(2));
    assert_eq!(
        sim.read_events(events, 2),
        [(EpollEvents::EPOLLOUT, 0), (EpollEvents::EPOLLOUT, 1)]
    );

    assert_eq!(sim.wait(&t, epfd, events, 3, 0), SyscallReturn::Done(3));
    let tokens: Vec<u64> = sim.read_events(events, 3).iter().map(|x| x.1).collect();
    assert_eq!(tokens, [0, 1, 2]);
}

#[test_log::test]
fn test_closed_child_is_removed() {
    let mut sim = Sim::new();
    let t = sim.thread(1);

    let epfd = sim.fd(&t, SyscallNum::NR_epoll_create1, &[0.into()]);
    let efd = nonblocking_eventfd(&sim, &t);
    let events = sim.alloc::<epoll_event>(1);

    assert_eq!(sim.ctl(&t, epfd, ADD, efd, EpollEvents::EPOLLOUT, 5), 0);
    assert_eq!(sim.wait(&t, epfd, events, 1, 0), SyscallReturn::Done(1));

    assert_eq!(sim.done(&t, SyscallNum::NR_close, &[efd.into()]), 0);
    assert_eq!(sim.wait(&t, epfd, events, 1, 0), SyscallReturn::Done(0));
}

/// A blocked wait is woken by a write from another thread and reports the event when re-run.
#[test_log::test]
fn test_block_until_ready() {
    let mut sim = Sim::new();
    let waiter = sim.thread(1);
    let writer = sim.thread(2);

    let epfd = sim.fd(&waiter, SyscallNum::NR_epoll_create1, &[0.into()]);
    let efd = nonblocking_eventfd(&sim, &waiter);
    let events = sim.alloc::<epoll_event>(10);

    assert_eq!(sim.ctl(&waiter, epfd, ADD, efd, EpollEvents::EPOLLIN, 42), 0);

    assert_eq!(sim.wait(&waiter, epfd, events, 10, -1), SyscallReturn::Block);
    assert!(waiter.is_blocked());
    assert_eq!(waiter.wakeup_reason(sim.now), None);

    // an infinite timeout never expires
    sim.advance(SimulationTime::from_millis(1_000_000));
    assert_eq!(waiter.wakeup_reason(sim.now), None);

    assert_eq!(sim.write_u64(&writer, efd, 1), 8);
    assert_eq!(waiter.wakeup_reason(sim.now), Some(WakeupReason::Trigger));

    assert_eq!(sim.wait(&waiter, epfd, events, 10, -1), SyscallReturn::Done(1));
    assert_eq!(sim.read_events(events, 1), [(EpollEvents::EPOLLIN, 42)]);
    assert!(!waiter.is_blocked());
}

#[test_log::test]
fn test_block_until_timeout() {
    let mut sim = Sim::new();
    let t = sim.thread(1);

    let epfd = sim.fd(&t, SyscallNum::NR_epoll_create1, &[0.into()]);
    let efd = nonblocking_eventfd(&sim, &t);
    let events = sim.alloc::<epoll_event>(1);

    assert_eq!(sim.ctl(&t, epfd, ADD, efd, EpollEvents::EPOLLIN, 1), 0);

    assert_eq!(sim.wait(&t, epfd, events, 1, 100), SyscallReturn::Block);
    assert_eq!(
        t.syscall_condition().and_then(|c| c.timeout()),
        sim.now.checked_add(SimulationTime::from_millis(100))
    );

    sim.advance(SimulationTime::from_millis(99));
    assert_eq!(t.wakeup_reason(sim.now), None);

    sim.advance(SimulationTime::from_millis(1));
    assert_eq!(t.wakeup_reason(sim.now), Some(WakeupReason::Timeout));

    assert_eq!(sim.wait(&t, epfd, events, 1, 100), SyscallReturn::Done(0));
    assert!(!t.is_blocked());
}

#[test_log::test]
fn test_pwait2_timeout() {
    let mut sim = Sim::new();
    let t = sim.thread(1);

    let epfd = sim.fd(&t, SyscallNum::NR_epoll_create1, &[0.into()]);
    let events = sim.alloc::<epoll_event>(1);
    let ts = sim.alloc::<timespec>(1);

    let pwait2 = |sim: &Sim, ts: ForeignPtr<timespec>| {
        sim.syscall(
            &t,
            SyscallNum::NR_epoll_pwait2,
            &[epfd.into(), events.into(), 1.into(), ts.into(), 0usize.into()],
        )
    };

    sim.process
        .memory_borrow_mut()
        .write(ts, &timespec { tv_sec: 0, tv_nsec: 0 })
        .unwrap();
    assert_eq!(pwait2(&sim, ts), SyscallReturn::Done(0));

    sim.process
        .memory_borrow_mut()
        .write(ts, &timespec { tv_sec: 0, tv_nsec: -1 })
        .unwrap();
    assert_eq!(pwait2(&sim, ts), SyscallReturn::Done(errno(Errno::EINVAL)));

    sim.process
        .memory_borrow_mut()
        .write(ts, &timespec { tv_sec: 2, tv_nsec: 0 })
        .unwrap();
    assert_eq!(pwait2(&sim, ts), SyscallReturn::Block);
    assert_eq!(
        t.syscall_condition().and_then(|c| c.timeout()),
        sim.now.checked_add(SimulationTime::SECOND * 2)
    );
    t.cancel_syscall();
    assert!(!t.is_blocked());

    // null means wait forever
    assert_eq!(pwait2(&sim, ForeignPtr::null()), SyscallReturn::Block);
    assert_eq!(t.syscall_condition().and_then(|c| c.timeout()), None);
    t.cancel_syscall();
}

#[test_log::test]
fn test_pipe_hangup() {
    let mut sim = Sim::new();
    let t = sim.thread(1);

    let fds = sim.alloc::<[libc::c_int; 2]>(1);
    assert_eq!(
        sim.done(&t, SyscallNum::NR_pipe2, &[fds.into(), libc::O_NONBLOCK.into()]),
        0
    );
    let [reader, writer] = sim.process.memory_borrow().read(fds).unwrap();

    let epfd = sim.fd(&t, SyscallNum::NR_epoll_create1, &[0.into()]);
    let events = sim.alloc::<epoll_event>(1);
    assert_eq!(sim.ctl(&t, epfd, ADD, reader, EpollEvents::EPOLLIN, 9), 0);
    assert_eq!(sim.wait(&t, epfd, events, 1, 0), SyscallReturn::Done(0));

    assert_eq!(sim.write_u64(&t, writer, 3), 8);
    assert_eq!(sim.wait(&t, epfd, events, 1, 0), SyscallReturn::Done(1));
    assert_eq!(sim.read_events(events, 1), [(EpollEvents::EPOLLIN, 9)]);

    // HUP is reported even though it wasn't requested
    assert_eq!(sim.done(&t, SyscallNum::NR_close, &[writer.into()]), 0);
    assert_eq!(sim.wait(&t, epfd, events, 1, 0), SyscallReturn::Done(1));
    assert_eq!(
        sim.read_events(events, 1),
        [(EpollEvents::EPOLLIN | EpollEvents::EPOLLHUP, 9)]
    );

    assert_eq!(sim.read_u64(&t, reader), 8);
    assert_eq!(sim.wait(&t, epfd, events, 1, 0), SyscallReturn::Done(1));
    assert_eq!(sim.read_events(events, 1), [(EpollEvents::EPOLLHUP, 9)]);
}

#[test_log::test]
fn test_blocking_pipe_read() {
    let mut sim = Sim::new();
    let reader_thread = sim.thread(1);
    let writer_thread = sim.thread(2);

    let fds = sim.alloc::<[libc::c_int; 2]>(1);
    assert_eq!(
        sim.done(&reader_thread, SyscallNum::NR_pipe2, &[fds.into(), 0.into()]),
        0
    );
    let [reader, writer] = sim.process.memory_borrow().read(fds).unwrap();

    let buf = sim.alloc::<u64>(1);
    let read = |sim: &Sim| {
        sim.syscall(
            &reader_thread,
            SyscallNum::NR_read,
            &[reader.into(), buf.into(), 8usize.into()],
        )
    };

    assert_eq!(read(&sim), SyscallReturn::Block);
    assert_eq!(reader_thread.wakeup_reason(sim.now), None);

    assert_eq!(sim.write_u64(&writer_thread, writer, 77), 8);
    assert_eq!(
        reader_thread.wakeup_reason(sim.now),
        Some(WakeupReason::Trigger)
    );

    assert_eq!(read(&sim), SyscallReturn::Done(8));
    assert_eq!(sim.process.memory_borrow().read(buf).unwrap(), 77);
}

#[test_log::test]
fn test_os_fallback() {
    let mut sim = Sim::new();
    let t = sim.thread(1);

    let (os_reader, os_writer) = rustix::pipe::pipe().unwrap();

    // an fd the simulator doesn't manage, backed by a real descriptor
    const UNMANAGED_FD: i32 = 500;
    sim.process
        .register_os_handle(UNMANAGED_FD, os_reader.as_raw_fd());

    let epfd = sim.fd(&t, SyscallNum::NR_epoll_create1, &[0.into()]);
    let events = sim.alloc::<epoll_event>(2);

    assert_eq!(sim.ctl(&t, epfd, ADD, UNMANAGED_FD, EpollEvents::EPOLLIN, 3), 0);
    assert_eq!(
        sim.ctl(&t, epfd, ADD, UNMANAGED_FD, EpollEvents::EPOLLIN, 3),
        errno(Errno::EEXIST)
    );
    assert_eq!(sim.wait(&t, epfd, events, 2, 0), SyscallReturn::Done(0));

    rustix::io::write(&os_writer, b"x").unwrap();
    assert_eq!(sim.wait(&t, epfd, events, 2, 0), SyscallReturn::Done(1));
    assert_eq!(sim.read_events(events, 1), [(EpollEvents::EPOLLIN, 3)]);

    assert_eq!(sim.ctl(&t, epfd, DEL, UNMANAGED_FD, EpollEvents::empty(), 0), 0);
    assert_eq!(sim.wait(&t, epfd, events, 2, 0), SyscallReturn::Done(0));
}

#[test_log::test]
fn test_os_fallback_disabled() {
    let mut sim = Sim::with_options(ProcessOptions {
        use_os_epoll_fallback: false,
        ..ProcessOptions::default()
    });
    let t = sim.thread(1);

    let epfd = sim.fd(&t, SyscallNum::NR_epoll_create1, &[0.into()]);
    assert_eq!(
        sim.ctl(&t, epfd, ADD, 500, EpollEvents::EPOLLIN, 0),
        errno(Errno::EBADF)
    );
}

#[test_log::test]
fn test_descriptor_limit() {
    let sim = Sim::with_options(ProcessOptions {
        max_descriptors: 2,
        ..ProcessOptions::default()
    });
    let t = sim.thread(1);

    sim.fd(&t, SyscallNum::NR_epoll_create1, &[0.into()]);
    sim.fd(&t, SyscallNum::NR_epoll_create1, &[0.into()]);
    assert_eq!(
        sim.done(&t, SyscallNum::NR_epoll_create1, &[0.into()]),
        errno(Errno::EMFILE)
    );
}

#[test_log::test]
fn test_unsupported_syscall() {
    let sim = Sim::new();
    let t = sim.thread(1);

    assert_eq!(
        sim.done(&t, SyscallNum::new(libc::SYS_getpid as u32), &[]),
        errno(Errno::ENOSYS)
    );
}

/// A wait blocked on a kernel descriptor wakes once the descriptor is ready, even though nothing in
/// the simulation notifies the epoll.
#[test_log::test]
fn test_block_on_os_fd() {
    let mut sim = Sim::new();
    let t = sim.thread(1);

    let (os_reader, os_writer) = rustix::pipe::pipe().unwrap();
    const UNMANAGED_FD: i32 = 500;
    sim.process
        .register_os_handle(UNMANAGED_FD, os_reader.as_raw_fd());

    let epfd = sim.fd(&t, SyscallNum::NR_epoll_create1, &[0.into()]);
    let events = sim.alloc::<epoll_event>(4);
    assert_eq!(sim.ctl(&t, epfd, ADD, UNMANAGED_FD, EpollEvents::EPOLLIN, 8), 0);

    assert_eq!(sim.wait(&t, epfd, events, 4, -1), SyscallReturn::Block);
    assert_eq!(t.wakeup_reason(sim.now), None);

    rustix::io::write(&os_writer, b"x").unwrap();
    assert_eq!(t.wakeup_reason(sim.now), Some(WakeupReason::Trigger));

    assert_eq!(sim.wait(&t, epfd, events, 4, -1), SyscallReturn::Done(1));
    assert_eq!(sim.read_events(events, 1), [(EpollEvents::EPOLLIN, 8)]);
}

/// If the events that woke a wait are gone by the time it's re-run, it returns 0 instead of
/// blocking again.
#[test_log::test]
fn test_spurious_wakeup() {
    let mut sim = Sim::new();
    let waiter = sim.thread(1);
    let other = sim.thread(2);

    let epfd = sim.fd(&waiter, SyscallNum::NR_epoll_create1, &[0.into()]);
    let efd = nonblocking_eventfd(&sim, &waiter);
    let events = sim.alloc::<epoll_event>(4);
    assert_eq!(sim.ctl(&waiter, epfd, ADD, efd, EpollEvents::EPOLLIN, 1), 0);

    assert_eq!(sim.wait(&waiter, epfd, events, 4, -1), SyscallReturn::Block);

    assert_eq!(sim.write_u64(&other, efd, 1), 8);
    assert_eq!(waiter.wakeup_reason(sim.now), Some(WakeupReason::Trigger));

    // drained before the waiter runs again
    assert_eq!(sim.read_u64(&other, efd), 8);

    assert_eq!(sim.wait(&waiter, epfd, events, 4, -1), SyscallReturn::Done(0));
    assert!(!waiter.is_blocked());
}

fn block_then_create(sim: &Sim, t: &Thread) -> i64 {
    let epfd = sim.fd(t, SyscallNum::NR_epoll_create1, &[0.into()]);
    let events_ptr = ForeignPtr::new(HEAP_START);
    assert_eq!(sim.wait(t, epfd, events_ptr, 1, -1), SyscallReturn::Block);

    // a different syscall while epoll_wait is still blocked
    sim.done(t, SyscallNum::NR_epoll_create1, &[0.into()])
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "unexpectedly being invoked")]
fn test_mismatched_resume_panics() {
    let sim = Sim::new();
    let t = sim.thread(1);
    block_then_create(&sim, &t);
}

#[test_log::test]
#[cfg(not(debug_assertions))]
fn test_mismatched_resume_runs_fresh() {
    let sim = Sim::new();
    let t = sim.thread(1);
    assert!(block_then_create(&sim, &t) >= 0);
    assert!(!t.is_blocked());
}
