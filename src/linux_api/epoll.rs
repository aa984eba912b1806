use num_enum::{IntoPrimitive, TryFromPrimitive};

bitflags::bitflags! {
    /// Epoll create flags, as used with `epoll_create1`.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct EpollCreateFlags: i32 {
        const EPOLL_CLOEXEC = libc::EPOLL_CLOEXEC;
    }
}

/// Epoll control operation, as used with `epoll_ctl`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
#[allow(non_camel_case_types)]
pub enum EpollCtlOp {
    EPOLL_CTL_ADD = 1,
    EPOLL_CTL_DEL = 2,
    EPOLL_CTL_MOD = 3,
}

bitflags::bitflags! {
    /// Epoll event types and input flags, which are ORed together in the `events` member of
    /// `struct epoll_event`. As explained in `epoll_ctl(2)`, some flags represent event
    /// types and other flags specify various input wakeup options.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct EpollEvents: u32 {
        const EPOLLIN = 0x001;
        const EPOLLPRI = 0x002;
        const EPOLLOUT = 0x004;
        const EPOLLERR = 0x008;
        const EPOLLHUP = 0x010;
        const EPOLLNVAL = 0x020;
        const EPOLLRDNORM = 0x040;
        const EPOLLRDBAND = 0x080;
        const EPOLLWRNORM = 0x100;
        const EPOLLWRBAND = 0x200;
        const EPOLLMSG = 0x400;
        const EPOLLRDHUP = 0x2000;
        /// A wakeup option.
        const EPOLLEXCLUSIVE = 1 << 28;
        /// A wakeup option.
        const EPOLLWAKEUP = 1 << 29;
        /// A wakeup option.
        const EPOLLONESHOT = 1 << 30;
        /// A wakeup option.
        const EPOLLET = 1 << 31;
    }
}

/// The `epoll_event` struct passed to `epoll_ctl` and filled in by `epoll_wait`. On x86-64 the
/// kernel declares it packed, so it's 12 bytes with no padding.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C, packed)]
#[allow(non_camel_case_types)]
pub struct epoll_event {
    pub events: u32,
    pub data: u64,
}

static_assertions::assert_eq_size!(epoll_event, [u8; 12]);

impl epoll_event {
    pub fn new(events: EpollEvents, data: u64) -> Self {
        Self {
            events: events.bits(),
            data,
        }
    }
}
