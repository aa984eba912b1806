/// A syscall number. Constants are the x86-64 numbers.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct SyscallNum(u32);

#[allow(non_upper_case_globals)]
impl SyscallNum {
    pub const NR_read: Self = Self(0);
    pub const NR_write: Self = Self(1);
    pub const NR_close: Self = Self(3);
    pub const NR_dup: Self = Self(32);
    pub const NR_epoll_create: Self = Self(213);
    pub const NR_epoll_wait: Self = Self(232);
    pub const NR_epoll_ctl: Self = Self(233);
    pub const NR_epoll_pwait: Self = Self(281);
    pub const NR_eventfd: Self = Self(284);
    pub const NR_eventfd2: Self = Self(290);
    pub const NR_epoll_create1: Self = Self(291);
    pub const NR_pipe2: Self = Self(293);
    pub const NR_epoll_pwait2: Self = Self(441);
    // NOTE: add new entries to `to_str` below

    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    pub const fn val(&self) -> u32 {
        self.0
    }

    pub const fn to_str(&self) -> Option<&'static str> {
        match *self {
            Self::NR_read => Some("read"),
            Self::NR_write => Some("write"),
            Self::NR_close => Some("close"),
            Self::NR_dup => Some("dup"),
            Self::NR_epoll_create => Some("epoll_create"),
            Self::NR_epoll_wait => Some("epoll_wait"),
            Self::NR_epoll_ctl => Some("epoll_ctl"),
            Self::NR_epoll_pwait => Some("epoll_pwait"),
            Self::NR_eventfd => Some("eventfd"),
            Self::NR_eventfd2 => Some("eventfd2"),
            Self::NR_epoll_create1 => Some("epoll_create1"),
            Self::NR_pipe2 => Some("pipe2"),
            Self::NR_epoll_pwait2 => Some("epoll_pwait2"),
            _ => None,
        }
    }
}

impl core::fmt::Display for SyscallNum {
    fn fmt(&self, formatter: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.to_str() {
            Some(s) => formatter.write_str(s),
            None => write!(formatter, "(unknown syscall {})", self.0),
        }
    }
}

impl core::fmt::Debug for SyscallNum {
    fn fmt(&self, formatter: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.to_str() {
            Some(s) => write!(formatter, "SyscallNum::NR_{s}"),
            None => write!(formatter, "SyscallNum::<{}>", self.0),
        }
    }
}

impl From<SyscallNum> for u32 {
    #[inline]
    fn from(val: SyscallNum) -> Self {
        val.0
    }
}

impl From<u32> for SyscallNum {
    #[inline]
    fn from(val: u32) -> Self {
        Self::new(val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_match_libc() {
        assert_eq!(i64::from(SyscallNum::NR_epoll_create.val()), libc::SYS_epoll_create);
        assert_eq!(i64::from(SyscallNum::NR_epoll_create1.val()), libc::SYS_epoll_create1);
        assert_eq!(i64::from(SyscallNum::NR_epoll_ctl.val()), libc::SYS_epoll_ctl);
        assert_eq!(i64::from(SyscallNum::NR_epoll_wait.val()), libc::SYS_epoll_wait);
        assert_eq!(i64::from(SyscallNum::NR_epoll_pwait.val()), libc::SYS_epoll_pwait);
        assert_eq!(i64::from(SyscallNum::NR_pipe2.val()), libc::SYS_pipe2);
        assert_eq!(i64::from(SyscallNum::NR_eventfd2.val()), libc::SYS_eventfd2);
    }

    #[test]
    fn display() {
        assert_eq!(SyscallNum::NR_epoll_wait.to_string(), "epoll_wait");
        assert_eq!(SyscallNum::new(9999).to_string(), "(unknown syscall 9999)");
        assert_eq!(format!("{:?}", SyscallNum::NR_close), "SyscallNum::NR_close");
    }
}
