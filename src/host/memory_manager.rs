//! Access to the memory of a managed process.
//!
//! The managed process's address space is modelled as a set of mapped regions. Syscall handlers
//! only ever see it through [`ForeignPtr`]s, and copy values in and out with the methods here.
//! Any access that touches a null or unmapped address fails with `EFAULT`, as the kernel's
//! `copy_from_user`/`copy_to_user` would.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::{Deref, DerefMut};

use bytemuck::Pod;
use log::*;
use nix::errno::Errno;

use crate::host::syscall::types::{ForeignArrayPtr, ForeignPtr};

/// The memory of a single managed process.
#[derive(Debug, Default)]
pub struct MemoryManager {
    // region start address -> contents
    regions: BTreeMap<usize, Vec<u8>>,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `len` zeroed bytes at `addr`. The region must not be null, empty, or overlap an
    /// existing region.
    pub fn map(&mut self, addr: usize, len: usize) -> Result<ForeignArrayPtr<u8>, Errno> {
        if addr == 0 || len == 0 {
            return Err(Errno::EINVAL);
        }

        let end = addr.checked_add(len).ok_or(Errno::EINVAL)?;

        // the closest region starting before the end of the new one is the only one that could
        // overlap it
        if let Some((start, region)) = self.regions.range(..end).next_back() {
            if start + region.len() > addr {
                debug!("Region {addr:#x}..{end:#x} overlaps an existing region at {start:#x}");
                return Err(Errno::EINVAL);
            }
        }

        trace!("Mapping {len} bytes at {addr:#x}");
        self.regions.insert(addr, vec![0; len]);

        Ok(ForeignArrayPtr::new(ForeignPtr::new(addr), len))
    }

    fn bytes(&self, ptr: ForeignArrayPtr<u8>) -> Result<&[u8], Errno> {
        if ptr.is_empty() {
            return Ok(&[]);
        }

        let (offset, region) = self.find_region(ptr)?;
        Ok(&self.regions[&region][offset..][..ptr.len()])
    }

    fn bytes_mut(&mut self, ptr: ForeignArrayPtr<u8>) -> Result<&mut [u8], Errno> {
        if ptr.is_empty() {
            return Ok(&mut []);
        }

        let (offset, region) = self.find_region(ptr)?;
        // `find_region` only returns the key of an existing region
        let region = self.regions.get_mut(&region).unwrap();
        Ok(&mut region[offset..][..ptr.len()])
    }

    /// Returns the offset of `ptr` into its region, and the region's start address.
    fn find_region(&self, ptr: ForeignArrayPtr<u8>) -> Result<(usize, usize), Errno> {
        let addr = usize::from(ptr.ptr());
        if addr == 0 {
            return Err(Errno::EFAULT);
        }

        let end = addr.checked_add(ptr.len()).ok_or(Errno::EFAULT)?;

        let Some((&start, region)) = self.regions.range(..=addr).next_back() else {
            return Err(Errno::EFAULT);
        };

        if end > start + region.len() {
            return Err(Errno::EFAULT);
        }

        Ok((addr - start, start))
    }

    /// Read a single value.
    pub fn read<T: Pod + Debug>(&self, ptr: ForeignPtr<T>) -> Result<T, Errno> {
        let ptr = ForeignArrayPtr::new(ptr, 1);
        let bytes = self.bytes(ptr.cast_u8())?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Read all of the values that `ptr` points to.
    pub fn read_vals<T: Pod + Debug>(&self, ptr: ForeignArrayPtr<T>) -> Result<Vec<T>, Errno> {
        let bytes = self.bytes(ptr.cast_u8())?;
        Ok(bytemuck::pod_collect_to_vec(bytes))
    }

    /// Write a single value.
    pub fn write<T: Pod + Debug>(&mut self, ptr: ForeignPtr<T>, val: &T) -> Result<(), Errno> {
        self.write_vals(ForeignArrayPtr::new(ptr, 1), std::slice::from_ref(val))
    }

    /// Write `src` to the memory that `dst` points to. The lengths must match.
    pub fn write_vals<T: Pod + Debug>(
        &mut self,
        dst: ForeignArrayPtr<T>,
        src: &[T],
    ) -> Result<(), Errno> {
        assert_eq!(dst.len(), src.len());

        let bytes = self.bytes_mut(dst.cast_u8())?;
        bytes.copy_from_slice(bytemuck::cast_slice(src));
        Ok(())
    }

    /// A mutable copy of the memory that `ptr` points to. Changes are written back by
    /// [`MemoryRefMut::flush`].
    pub fn memory_ref_mut<T: Pod + Debug>(
        &mut self,
        ptr: ForeignArrayPtr<T>,
    ) -> Result<MemoryRefMut<'_, T>, Errno> {
        let vals = self.read_vals(ptr)?;
        Ok(MemoryRefMut {
            mem: self,
            ptr,
            vals,
            dirty: true,
        })
    }
}

/// A mutable reference to managed-process memory.
///
/// The object must be disposed of by calling `flush` or `noflush`.
#[derive(Debug)]
pub struct MemoryRefMut<'a, T: Pod + Debug> {
    mem: &'a mut MemoryManager,
    ptr: ForeignArrayPtr<T>,
    vals: Vec<T>,
    dirty: bool,
}

impl<T: Pod + Debug> MemoryRefMut<'_, T> {
    /// Write the contents back to process memory.
    pub fn flush(mut self) -> Result<(), Errno> {
        self.dirty = false;

        trace!(
            "Flushing {} bytes to {:#x}",
            self.ptr.size_bytes(),
            usize::from(self.ptr.ptr())
        );
        self.mem.write_vals(self.ptr, &self.vals)
    }

    /// Dispose of the reference without writing back the contents.
    pub fn noflush(mut self) {
        self.dirty = false;
    }
}

impl<T: Pod + Debug> Drop for MemoryRefMut<'_, T> {
    fn drop(&mut self) {
        if self.dirty && !std::thread::panicking() {
            debug_panic!("Dropped a memory reference without flushing");
        }
    }
}

impl<T: Pod + Debug> Deref for MemoryRefMut<'_, T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.vals
    }
}

impl<T: Pod + Debug> DerefMut for MemoryRefMut<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.vals
    }
}
