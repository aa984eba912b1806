/// The kernel's `struct timespec` (64-bit fields on x86-64).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
#[allow(non_camel_case_types)]
pub struct timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

static_assertions::assert_eq_size!(timespec, libc::timespec);
