use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use log::*;
use nix::errno::Errno;

use crate::host::descriptor::{Descriptor, FileKind, FileVariant};
use crate::host::syscall::types::SyscallError;

/// Table of (file) descriptors. Typically owned by a Process.
pub struct DescriptorTable {
    descriptors: BTreeMap<DescriptorHandle, Descriptor>,

    // Indices less than `next_index` known to be available.
    available_indices: BTreeSet<u32>,

    // Lowest index not in `available_indices` that *might* be available. We still need to verify
    // availability in `descriptors`, though.
    next_index: u32,

    // No descriptor is ever registered at an index at or above this limit.
    max_descriptors: u32,
}

impl DescriptorTable {
    pub fn new(max_descriptors: u32) -> Self {
        DescriptorTable {
            descriptors: BTreeMap::new(),
            available_indices: BTreeSet::new(),
            next_index: 0,
            max_descriptors: std::cmp::min(max_descriptors, i32::MAX as u32),
        }
    }

    /// Add the descriptor at the lowest unused index, and return the index. If the table is full,
    /// the descriptor is returned back to the caller.
    pub fn register_descriptor(
        &mut self,
        descriptor: Descriptor,
    ) -> Result<DescriptorHandle, Descriptor> {
        let idx = if let Some(idx) = self.available_indices.pop_first() {
            trace!("Reusing available index {}", idx);
            idx
        } else {
            if self.next_index >= self.max_descriptors {
                debug!(
                    "Descriptor table is full with {} descriptors",
                    self.descriptors.len()
                );
                return Err(descriptor);
            }

            // Take the next index.
            let idx = self.next_index;
            trace!("Using index {}", idx);
            self.next_index += 1;
            idx
        };

        // `idx` is less than `max_descriptors`, which is at most `i32::MAX`
        let handle = DescriptorHandle::new(idx).unwrap();

        let prev = self.descriptors.insert(handle, descriptor);
        debug_assert!(prev.is_none(), "Already a descriptor at {}", idx);

        Ok(handle)
    }

    // Call after inserting to `available_indices`, to free any that are contiguous
    // with `next_index`.
    fn trim_tail(&mut self) {
        while let Some(&last_in_available) = self.available_indices.last() {
            if (last_in_available + 1) == self.next_index {
                // Last entry in available_indices is adjacent to next_index.
                // We can merge them, freeing an entry in `available_indices`.
                self.next_index -= 1;
                self.available_indices.remove(&last_in_available);
            } else {
                break;
            }
        }
    }

    /// Remove the descriptor at the given index and return it.
    pub fn deregister_descriptor(&mut self, idx: DescriptorHandle) -> Option<Descriptor> {
        let maybe_descriptor = self.descriptors.remove(&idx);
        if maybe_descriptor.is_some() {
            self.available_indices.insert(idx.val());
            self.trim_tail();
        }
        maybe_descriptor
    }

    /// Remove all descriptors, in order of their handles.
    pub fn remove_all(&mut self) -> impl Iterator<Item = Descriptor> {
        let descriptors = std::mem::take(&mut self.descriptors);
        self.available_indices.clear();
        self.next_index = 0;

        descriptors.into_values()
    }

    /// Get the descriptor at `idx`, if any.
    pub fn get(&self, idx: DescriptorHandle) -> Option<&Descriptor> {
        self.descriptors.get(&idx)
    }

    /// Get the descriptor at `idx`, if any.
    pub fn get_mut(&mut self, idx: DescriptorHandle) -> Option<&mut Descriptor> {
        self.descriptors.get_mut(&idx)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Get the file of type `T` at `fd`. Distinguishes between a missing descriptor and a
    /// descriptor of the wrong type so that callers can report the right error.
    pub fn lookup<T: FileVariant>(
        &self,
        fd: impl TryInto<DescriptorHandle>,
    ) -> Result<&Arc<AtomicRefCell<T>>, LookupError> {
        let fd = fd.try_into().map_err(|_| LookupError::NotFound)?;
        let file = self.get(fd).ok_or(LookupError::NotFound)?.file();

        match T::from_file(file) {
            Some(inner) => {
                debug_assert_eq!(file.kind(), T::KIND);
                Ok(inner)
            }
            None => Err(LookupError::WrongType {
                expected: T::KIND,
                found: file.kind(),
            }),
        }
    }
}

/// Why a typed descriptor lookup failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LookupError {
    /// There is no descriptor at the requested handle.
    NotFound,
    /// The descriptor exists but refers to a different kind of file.
    WrongType { expected: FileKind, found: FileKind },
}

impl std::fmt::Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "descriptor not found"),
            Self::WrongType { expected, found } => {
                write!(f, "expected a descriptor of type {expected}, found {found}")
            }
        }
    }
}

impl std::error::Error for LookupError {}

impl From<LookupError> for Errno {
    fn from(e: LookupError) -> Self {
        match e {
            LookupError::NotFound => Errno::EBADF,
            LookupError::WrongType { .. } => Errno::EINVAL,
        }
    }
}

impl From<LookupError> for SyscallError {
    fn from(e: LookupError) -> Self {
        Errno::from(e).into()
    }
}

/// A handle for a file descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DescriptorHandle(u32);

impl DescriptorHandle {
    /// Returns `Some` if `fd` is less than [`i32::MAX`].
    pub fn new(fd: u32) -> Option<Self> {
        if fd < i32::MAX as u32 {
            Some(Self(fd))
        } else {
            None
        }
    }

    pub fn val(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for DescriptorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<DescriptorHandle> for u32 {
    fn from(x: DescriptorHandle) -> u32 {
        x.0
    }
}

impl From<DescriptorHandle> for i32 {
    fn from(x: DescriptorHandle) -> i32 {
        // guaranteed to be less than i32::MAX by `DescriptorHandle::new`
        x.0.try_into().unwrap()
    }
}

impl TryFrom<u32> for DescriptorHandle {
    type Error = ();
    fn try_from(x: u32) -> Result<Self, Self::Error> {
        DescriptorHandle::new(x).ok_or(())
    }
}

impl TryFrom<i32> for DescriptorHandle {
    type Error = ();
    fn try_from(x: i32) -> Result<Self, Self::Error> {
        x.try_into().ok().and_then(DescriptorHandle::new).ok_or(())
    }
}
