use crate::remote_ptr::{RemotePtr, Void};
use std::{
    fmt::{Debug, Display, Formatter, Result},
    ops::{Add, Sub},
};

/// An instruction pointer in a tracee's address space, kept distinct from
/// data pointers so code addresses don't silently mix with data addresses.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RemoteCodePtr {
    ptr: usize,
}

impl RemoteCodePtr {
    pub fn null() -> RemoteCodePtr {
        RemoteCodePtr { ptr: 0 }
    }

    pub fn new(val: usize) -> RemoteCodePtr {
        RemoteCodePtr { ptr: val }
    }

    pub fn as_usize(self) -> usize {
        self.ptr
    }

    pub fn is_null(self) -> bool {
        self.ptr == 0
    }

    pub fn to_data_ptr<T>(self) -> RemotePtr<T> {
        RemotePtr::<T>::new(self.ptr)
    }

    pub fn from_data_ptr(p: RemotePtr<Void>) -> RemoteCodePtr {
        RemoteCodePtr::new(p.as_usize())
    }

    /// Ignoring any breakpoints at this location, the address of the
    /// instruction `bytes` further along.
    pub fn increment_by_bytes(self, bytes: usize) -> RemoteCodePtr {
        RemoteCodePtr::new(self.ptr + bytes)
    }

    pub fn decrement_by_bytes(self, bytes: usize) -> RemoteCodePtr {
        RemoteCodePtr::new(self.ptr - bytes)
    }
}

impl Add<usize> for RemoteCodePtr {
    type Output = Self;

    fn add(self, delta: usize) -> Self::Output {
        self.increment_by_bytes(delta)
    }
}

impl Sub<usize> for RemoteCodePtr {
    type Output = Self;

    fn sub(self, delta: usize) -> Self::Output {
        self.decrement_by_bytes(delta)
    }
}

impl Sub<RemoteCodePtr> for RemoteCodePtr {
    type Output = isize;

    fn sub(self, rhs: RemoteCodePtr) -> Self::Output {
        self.ptr as isize - rhs.ptr as isize
    }
}

impl From<usize> for RemoteCodePtr {
    fn from(val: usize) -> Self {
        RemoteCodePtr::new(val)
    }
}

impl Display for RemoteCodePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl Debug for RemoteCodePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.ptr)
    }
}
