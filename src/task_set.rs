use libc::pid_t;
use std::collections::BTreeSet;

/// The set of tasks (by rec_tid) sharing an address space or a thread
/// group. Tasks hold strong references to those objects; the objects hold
/// only these ids back, and tasks unregister themselves on destruction.
#[derive(Default, Clone)]
pub struct TaskSet {
    tids: BTreeSet<pid_t>,
}

impl TaskSet {
    pub fn new() -> TaskSet {
        TaskSet {
            tids: BTreeSet::new(),
        }
    }

    pub fn insert_task(&mut self, rec_tid: pid_t) -> bool {
        self.tids.insert(rec_tid)
    }

    pub fn erase_task(&mut self, rec_tid: pid_t) -> bool {
        self.tids.remove(&rec_tid)
    }

    pub fn has_task(&self, rec_tid: pid_t) -> bool {
        self.tids.contains(&rec_tid)
    }

    pub fn is_empty(&self) -> bool {
        self.tids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tids.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &pid_t> {
        self.tids.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_erase() {
        let mut ts = TaskSet::new();
        assert!(ts.insert_task(10));
        assert!(!ts.insert_task(10));
        assert!(ts.has_task(10));
        assert_eq!(1, ts.len());
        assert!(ts.erase_task(10));
        assert!(ts.is_empty());
    }
}
