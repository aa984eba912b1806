//! Types used in emulating syscalls.

use std::marker::PhantomData;
use std::mem::size_of;

use log::Level::Debug;
use log::*;
use nix::errno::Errno;

use crate::core::support::emulated_time::EmulatedTime;
use crate::host::descriptor::{File, FileState};
use crate::host::syscall::condition::{SyscallCondition, Trigger};

/// A register used for input/output in a syscall.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct SyscallReg(u64);

impl std::fmt::Debug for SyscallReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallReg")
            .field("as_i64", &(self.0 as i64))
            .field("as_u64", &self.0)
            .finish()
    }
}

impl From<u64> for SyscallReg {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl From<SyscallReg> for u64 {
    fn from(v: SyscallReg) -> u64 {
        v.0
    }
}

impl From<i64> for SyscallReg {
    fn from(v: i64) -> Self {
        Self(v as u64)
    }
}

impl From<SyscallReg> for i64 {
    fn from(v: SyscallReg) -> i64 {
        v.0 as i64
    }
}

impl From<usize> for SyscallReg {
    fn from(v: usize) -> Self {
        Self(v as u64)
    }
}

impl From<SyscallReg> for usize {
    fn from(v: SyscallReg) -> usize {
        v.0 as usize
    }
}

impl From<i32> for SyscallReg {
    fn from(v: i32) -> Self {
        Self(i64::from(v) as u64)
    }
}

impl From<SyscallReg> for i32 {
    fn from(v: SyscallReg) -> i32 {
        // registers holding an `int` argument only carry meaning in the lower 32 bits
        v.0 as i32
    }
}

impl From<u32> for SyscallReg {
    fn from(v: u32) -> Self {
        Self(u64::from(v))
    }
}

impl From<SyscallReg> for u32 {
    fn from(v: SyscallReg) -> u32 {
        v.0 as u32
    }
}

impl<T> From<ForeignPtr<T>> for SyscallReg {
    fn from(v: ForeignPtr<T>) -> Self {
        Self(v.val as u64)
    }
}

impl<T> From<SyscallReg> for ForeignPtr<T> {
    fn from(v: SyscallReg) -> ForeignPtr<T> {
        ForeignPtr::new(v.0 as usize)
    }
}

// Useful for syscalls whose strongly-typed wrappers return some Result<(), ErrType>
impl From<()> for SyscallReg {
    fn from(_: ()) -> SyscallReg {
        SyscallReg(0)
    }
}

/// The syscall number and arguments, as found in the registers of the managed thread.
#[derive(Copy, Clone, Debug)]
pub struct SyscallArgs {
    // SYS_* from sys/syscall.h.
    pub number: i64,
    pub args: [SyscallReg; 6],
}

impl SyscallArgs {
    pub fn new(number: i64, args: [SyscallReg; 6]) -> Self {
        Self { number, args }
    }

    pub fn get(&self, i: usize) -> SyscallReg {
        self.args[i]
    }

    pub fn number(&self) -> i64 {
        self.number
    }
}

/// A typed pointer into the managed process's address space. It must never be dereferenced
/// directly; go through the [`MemoryManager`](crate::host::memory_manager::MemoryManager).
pub struct ForeignPtr<T> {
    val: usize,
    _phantom: PhantomData<T>,
}

impl<T> ForeignPtr<T> {
    pub fn new(val: usize) -> Self {
        Self {
            val,
            _phantom: PhantomData,
        }
    }

    pub fn null() -> Self {
        Self::new(0)
    }

    pub fn is_null(&self) -> bool {
        self.val == 0
    }

    pub fn cast<U>(&self) -> ForeignPtr<U> {
        ForeignPtr::new(self.val)
    }

    /// Pointer `count` items of `T` past this one.
    pub fn add(&self, count: usize) -> Self {
        Self::new(self.val + count * size_of::<T>())
    }
}

// manual impls to avoid the `T: Copy` bounds that derive would add
impl<T> Copy for ForeignPtr<T> {}

impl<T> Clone for ForeignPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for ForeignPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.val == other.val
    }
}

impl<T> Eq for ForeignPtr<T> {}

impl<T> std::fmt::Debug for ForeignPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ForeignPtr<{}>({:#x})", std::any::type_name::<T>(), self.val)
    }
}

impl<T> From<ForeignPtr<T>> for usize {
    fn from(v: ForeignPtr<T>) -> usize {
        v.val
    }
}

/// Wrapper around a [`ForeignPtr`] that encapsulates its size and current position.
pub struct ForeignArrayPtr<T> {
    base: ForeignPtr<T>,
    count: usize,
}

impl<T> Copy for ForeignArrayPtr<T> {}

impl<T> Clone for ForeignArrayPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> std::fmt::Debug for ForeignArrayPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignArrayPtr")
            .field("base", &self.base)
            .field("count", &self.count)
            .field("size_of::<T>", &size_of::<T>())
            .finish()
    }
}

impl<T> ForeignArrayPtr<T> {
    /// Creates a typed pointer. Note though that the pointer *isn't* guaranteed
    /// to be aligned for `T`.
    pub fn new(ptr: ForeignPtr<T>, count: usize) -> Self {
        if log_enabled!(Debug) && usize::from(ptr) % std::mem::align_of::<T>() != 0 {
            // Linux allows unaligned pointers from user-space. We never dereference guest
            // pointers directly, but leave a sign-post in case of latent bugs.
            debug!(
                "Creating unaligned pointer {ptr:?}. This is legal, but could trigger latent bugs."
            );
        }
        ForeignArrayPtr { base: ptr, count }
    }

    /// Raw foreign pointer.
    pub fn ptr(&self) -> ForeignPtr<T> {
        self.base
    }

    /// Number of items pointed to.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_null(&self) -> bool {
        self.base.is_null()
    }

    /// Size of the pointed-to region in bytes.
    pub fn size_bytes(&self) -> usize {
        self.count * size_of::<T>()
    }

    /// Cast to type `U`. Fails if the total size isn't a multiple of `sizeof<U>`.
    pub fn cast<U>(&self) -> Option<ForeignArrayPtr<U>> {
        let count_bytes = self.size_bytes();
        if count_bytes % size_of::<U>() != 0 {
            return None;
        }
        Some(ForeignArrayPtr::new(
            self.base.cast::<U>(),
            count_bytes / size_of::<U>(),
        ))
    }

    /// Cast to u8. Infallible since `size_of<u8>` is 1.
    pub fn cast_u8(&self) -> ForeignArrayPtr<u8> {
        self.cast::<u8>().unwrap()
    }
}

// Calling all of these errors is stretching the semantics of 'error' a bit,
// but it makes for fluent programming in syscall handlers using the `?` operator.
#[derive(Debug, PartialEq, Eq)]
pub enum SyscallError {
    Failed(Failed),
    Blocked(Blocked),
}

#[derive(Debug, PartialEq, Eq)]
pub struct Blocked {
    pub condition: SyscallCondition,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Failed {
    pub errno: Errno,
}

pub type SyscallResult = Result<SyscallReg, SyscallError>;

impl From<Errno> for SyscallError {
    fn from(e: Errno) -> Self {
        SyscallError::Failed(Failed { errno: e })
    }
}

impl From<std::io::Error> for SyscallError {
    fn from(e: std::io::Error) -> Self {
        match std::io::Error::raw_os_error(&e) {
            Some(e) => SyscallError::Failed(Failed {
                errno: Errno::from_i32(e),
            }),
            None => {
                let default = Errno::ENOTSUP;
                warn!("Mapping error {} to {}", e, default);
                SyscallError::from(default)
            }
        }
    }
}

impl SyscallError {
    /// Block until `state` is set on `file`.
    pub fn new_blocked_on_file(file: File, state: FileState) -> Self {
        Self::Blocked(Blocked {
            condition: SyscallCondition::new(Trigger::from_file(file, state)),
        })
    }

    /// Block until the simulation reaches `unblock_time`.
    pub fn new_blocked_until(unblock_time: EmulatedTime) -> Self {
        Self::Blocked(Blocked {
            condition: SyscallCondition::new_from_wakeup_time(unblock_time),
        })
    }

    /// Returns the [condition](SyscallCondition) that the syscall is blocked on.
    pub fn blocked_condition(&mut self) -> Option<&mut SyscallCondition> {
        if let Self::Blocked(Blocked { condition }) = self {
            Some(condition)
        } else {
            None
        }
    }
}

/// What the managed thread should do after a syscall was handled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyscallReturn {
    /// Done executing the syscall; ready to let the managed thread resume. Holds the raw return
    /// register value, which is `-errno` on failure.
    Done(i64),
    /// We don't have the result yet.
    Block,
}

impl From<&SyscallResult> for SyscallReturn {
    fn from(rv: &SyscallResult) -> Self {
        match rv {
            Ok(r) => SyscallReturn::Done(i64::from(*r)),
            Err(SyscallError::Failed(failed)) => SyscallReturn::Done(-(failed.errno as i64)),
            Err(SyscallError::Blocked(_)) => SyscallReturn::Block,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reg_conversions() {
        let reg = SyscallReg::from(-1i32);
        assert_eq!(i64::from(reg), -1);
        assert_eq!(i32::from(reg), -1);

        let ptr = ForeignPtr::<u64>::new(0x1000);
        let reg = SyscallReg::from(ptr);
        assert_eq!(ForeignPtr::<u64>::from(reg), ptr);
        assert_eq!(usize::from(ptr.add(2)), 0x1010);
    }

    #[test]
    fn test_array_cast() {
        let ptr = ForeignArrayPtr::new(ForeignPtr::<u32>::new(0x1000), 3);
        assert_eq!(ptr.size_bytes(), 12);
        assert_eq!(ptr.cast_u8().len(), 12);
        assert!(ptr.cast::<u64>().is_none());
        assert_eq!(ptr.cast::<[u8; 6]>().unwrap().len(), 2);
    }

    #[test]
    fn test_return_encoding() {
        let rv: SyscallResult = Err(Errno::EBADF.into());
        assert_eq!(SyscallReturn::from(&rv), SyscallReturn::Done(-libc::EBADF as i64));

        let rv: SyscallResult = Ok(5i32.into());
        assert_eq!(SyscallReturn::from(&rv), SyscallReturn::Done(5));
    }
}
