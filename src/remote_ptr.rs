use std::{
    cmp::Ordering,
    fmt::{Debug, Display, Formatter, Result},
    hash::{Hash, Hasher},
    marker::PhantomData,
    mem::size_of,
    ops::{Add, Sub},
};

/// The referent of an untyped tracee pointer.
pub type Void = u8;

/// A pointer into a tracee's address space. It cannot be dereferenced from
/// the supervisor; all access goes through task memory helpers. Arithmetic
/// steps by `size_of::<T>()`.
pub struct RemotePtr<T> {
    ptr: usize,
    phantom: PhantomData<T>,
}

impl<T> RemotePtr<T> {
    pub fn null() -> RemotePtr<T> {
        RemotePtr {
            ptr: 0,
            phantom: PhantomData,
        }
    }

    pub fn new(val: usize) -> RemotePtr<T> {
        RemotePtr {
            ptr: val,
            phantom: PhantomData,
        }
    }

    pub fn as_usize(&self) -> usize {
        self.ptr
    }

    pub fn is_null(&self) -> bool {
        self.ptr == 0
    }

    pub fn referent_size(&self) -> usize {
        size_of::<T>()
    }

    pub fn cast<U>(r: RemotePtr<U>) -> RemotePtr<T> {
        RemotePtr::<T>::new(r.ptr)
    }

    pub fn to_data_ptr(self) -> RemotePtr<Void> {
        RemotePtr::<Void>::new(self.ptr)
    }
}

impl<T> Default for RemotePtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

// Manual impls so that RemotePtr<T> is Copy/Clone even when T is not.
impl<T> Clone for RemotePtr<T> {
    fn clone(&self) -> Self {
        RemotePtr::new(self.ptr)
    }
}

impl<T> Copy for RemotePtr<T> {}

impl<T> Display for RemotePtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl<T> Debug for RemotePtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl<T> Add<usize> for RemotePtr<T> {
    type Output = Self;

    fn add(self, delta: usize) -> Self::Output {
        Self::new(self.ptr + delta * size_of::<T>())
    }
}

impl<T> Sub<usize> for RemotePtr<T> {
    type Output = Self;

    fn sub(self, delta: usize) -> Self::Output {
        Self::new(self.ptr - delta * size_of::<T>())
    }
}

/// Pointer difference in units of `size_of::<T>()`.
impl<T> Sub<RemotePtr<T>> for RemotePtr<T> {
    type Output = usize;

    fn sub(self, rhs: RemotePtr<T>) -> Self::Output {
        (self.ptr - rhs.ptr) / size_of::<T>()
    }
}

impl<T> From<usize> for RemotePtr<T> {
    fn from(val: usize) -> Self {
        RemotePtr::new(val)
    }
}

impl<T> PartialOrd for RemotePtr<T> {
    fn partial_cmp(&self, other: &RemotePtr<T>) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for RemotePtr<T> {
    fn cmp(&self, other: &RemotePtr<T>) -> Ordering {
        self.ptr.cmp(&other.ptr)
    }
}

impl<T> PartialEq for RemotePtr<T> {
    fn eq(&self, other: &RemotePtr<T>) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for RemotePtr<T> {}

impl<T> Hash for RemotePtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr.hash(state);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn null_is_zero() {
        let a = RemotePtr::<u64>::null();
        assert_eq!(0, a.as_usize());
        assert!(a.is_null());
    }

    #[test]
    fn add_steps_by_referent_size() {
        let a = RemotePtr::<u64>::null();
        assert_eq!(8, (a + 1).as_usize());

        struct S(u64, u64);
        let b = RemotePtr::<S>::null();
        assert_eq!(16, (b + 1).as_usize());
    }

    #[test]
    fn add_sub_round_trips() {
        let a = RemotePtr::<u64>::new(64);
        assert_eq!(a, a + 2 - 2);
    }

    #[test]
    fn difference_in_referent_units() {
        let a = RemotePtr::<u64>::new(8);
        let b = RemotePtr::<u64>::new(96);
        assert_eq!(11, b - a);
    }

    #[test]
    fn cast_changes_referent_size() {
        struct S(u64, u64);
        let a = RemotePtr::<u64>::new(8);
        let b = RemotePtr::<S>::cast(a);
        assert_eq!(8, b.as_usize());
        assert_eq!(16, b.referent_size());
    }

    #[test]
    fn ordering() {
        let c = RemotePtr::<u64>::new(0);
        let d = RemotePtr::<u64>::new(16);
        assert!(c < d);
        assert!(c != d);
        assert_eq!(c, c);
    }
}
