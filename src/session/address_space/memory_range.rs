use crate::remote_ptr::{RemotePtr, Void};
use std::{
    cmp::{max, min, Ordering},
    fmt::{Display, Formatter, Result},
    ops::{Deref, DerefMut},
};

/// A half-open range of tracee addresses. The end point is NOT included.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct MemoryRange {
    pub(super) start_: RemotePtr<Void>,
    pub(super) end_: RemotePtr<Void>,
}

impl Default for MemoryRange {
    fn default() -> Self {
        MemoryRange {
            start_: RemotePtr::null(),
            end_: RemotePtr::null(),
        }
    }
}

impl MemoryRange {
    pub fn new_range(addr: RemotePtr<Void>, num_bytes: usize) -> MemoryRange {
        // An overflow in the addition will panic in debug builds.
        MemoryRange {
            start_: addr,
            end_: addr + num_bytes,
        }
    }

    pub fn from_range(addr: RemotePtr<Void>, end: RemotePtr<Void>) -> MemoryRange {
        let result = MemoryRange {
            start_: addr,
            end_: end,
        };
        debug_assert!(result.start_ <= result.end_);
        result
    }

    /// Return true iff `other` is an address range fully contained by self.
    pub fn contains(&self, other: &Self) -> bool {
        self.start_ <= other.start_ && other.end_ <= self.end_
    }

    /// Note that we have p < self.end_ and not p <= self.end_ here.
    pub fn contains_ptr(&self, p: RemotePtr<Void>) -> bool {
        self.start_ <= p && p < self.end_
    }

    pub fn intersect(&self, other: MemoryRange) -> MemoryRange {
        let s = max(self.start_, other.start_);
        let e = min(self.end_, other.end_);
        MemoryRange {
            start_: s,
            end_: max(s, e),
        }
    }

    pub fn intersects(&self, other: &MemoryRange) -> bool {
        let s = max(self.start_, other.start_);
        let e = min(self.end_, other.end_);
        s < e
    }

    pub fn start(&self) -> RemotePtr<Void> {
        self.start_
    }

    pub fn end(&self) -> RemotePtr<Void> {
        self.end_
    }

    pub fn size(&self) -> usize {
        self.end_ - self.start_
    }
}

impl Display for MemoryRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}-{}", self.start_, self.end_)
    }
}

/// The key type for the mapping map: ranges that intersect compare Equal, so
/// a lookup with a point range `[p, p+1)` finds the unique mapping containing
/// `p`, and a lookup with a larger range finds *some* overlapping mapping.
/// Traits PartialOrd, Ord, PartialEq, Eq are manually derived (see below).
#[derive(Copy, Clone, Debug)]
pub struct MemoryRangeKey(pub MemoryRange);

impl PartialOrd for MemoryRangeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemoryRangeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        if !self.0.intersects(&other.0) {
            self.0.start_.cmp(&other.0.start_)
        } else {
            Ordering::Equal
        }
    }
}

impl PartialEq for MemoryRangeKey {
    fn eq(&self, other: &Self) -> bool {
        if !self.0.intersects(&other.0) {
            self.0.start_ == other.0.start_
        } else {
            true
        }
    }
}

impl Eq for MemoryRangeKey {}

impl Deref for MemoryRangeKey {
    type Target = MemoryRange;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for MemoryRangeKey {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<MemoryRange> for MemoryRangeKey {
    fn from(r: MemoryRange) -> Self {
        MemoryRangeKey(r)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{
        collections::{BTreeMap, BTreeSet},
        ops::Bound::{Included, Unbounded},
    };

    #[test]
    fn containment() {
        let r = MemoryRange::from_range(0x1000usize.into(), 0x2000usize.into());
        assert!(r.contains_ptr(0x1000usize.into()));
        assert!(r.contains_ptr(0x1fffusize.into()));
        assert!(!r.contains_ptr(0x2000usize.into()));
        assert!(r.contains(&MemoryRange::from_range(0x1800usize.into(), 0x2000usize.into())));
    }

    #[test]
    fn point_lookup_finds_containing_range() {
        let mut m: BTreeMap<MemoryRangeKey, u32> = BTreeMap::new();
        m.insert(MemoryRange::from_range(0usize.into(), 10usize.into()).into(), 1);
        m.insert(MemoryRange::from_range(10usize.into(), 15usize.into()).into(), 2);
        m.insert(MemoryRange::from_range(15usize.into(), 20usize.into()).into(), 3);

        let point = |p: usize| MemoryRangeKey(MemoryRange::new_range(p.into(), 1));
        assert_eq!(Some(&1), m.get(&point(9)));
        assert_eq!(Some(&2), m.get(&point(10)));
        assert_eq!(Some(&3), m.get(&point(19)));
        assert_eq!(None, m.get(&point(20)));
    }

    #[test]
    fn overlapping_insert_replaces() {
        let mut m: BTreeMap<MemoryRangeKey, u32> = BTreeMap::new();
        let k1 = MemoryRangeKey(MemoryRange::from_range(0usize.into(), 10usize.into()));
        let k4 = MemoryRangeKey(MemoryRange::from_range(1usize.into(), 10usize.into()));

        let k2 = MemoryRangeKey(MemoryRange::from_range(10usize.into(), 15usize.into()));
        let k5 = MemoryRangeKey(MemoryRange::from_range(15usize.into(), 20usize.into()));
        m.insert(k2, 0);
        m.insert(k1, 1);
        m.insert(k5, 5);
        // k4 intersects k1, so this replaces k1's value.
        let replaced = m.insert(k4, 4);
        assert_eq!(3, m.len());
        assert!(replaced.is_some());
        assert_eq!(Some(&4), m.get(&k4));
    }

    #[test]
    fn range_iteration_bounds() {
        let mut m: BTreeMap<MemoryRangeKey, u32> = BTreeMap::new();
        m.insert(MemoryRange::from_range(0usize.into(), 10usize.into()).into(), 1);
        m.insert(MemoryRange::from_range(10usize.into(), 15usize.into()).into(), 2);
        m.insert(MemoryRange::from_range(15usize.into(), 20usize.into()).into(), 3);

        // Keys <= [9, 11): only [0, 10) compares Less against later keys.
        let mrk_9to11 = MemoryRangeKey(MemoryRange::from_range(9usize.into(), 11usize.into()));
        let found: Vec<u32> = m
            .range((Unbounded, Included(mrk_9to11)))
            .map(|(_, &v)| v)
            .collect();
        assert_eq!(vec![1], found);

        // Keys >= [9, 11): everything, because [0, 10) compares Equal to the
        // probe.
        let found: Vec<u32> = m
            .range((Included(mrk_9to11), Unbounded))
            .map(|(_, &v)| v)
            .collect();
        assert_eq!(vec![1, 2, 3], found);
    }

    #[test]
    fn remove_by_overlap() {
        let mut m: BTreeSet<MemoryRangeKey> = BTreeSet::new();
        let k1 = MemoryRangeKey(MemoryRange::from_range(0usize.into(), 10usize.into()));
        let k2 = MemoryRangeKey(MemoryRange::from_range(10usize.into(), 15usize.into()));
        m.insert(k1);
        m.insert(k2);

        // [3, 11) overlaps both; `get` returns one of them at a time.
        let k3 = MemoryRangeKey(MemoryRange::from_range(3usize.into(), 11usize.into()));
        let first = *m.get(&k3).unwrap();
        assert_eq!(k1.start(), first.start());
        m.remove(&k3);

        let second = *m.get(&k3).unwrap();
        assert_eq!(k2.start(), second.start());
        m.remove(&k3);
        assert!(m.get(&k3).is_none());
    }
}
