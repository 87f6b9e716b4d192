use crate::{task_set::TaskSet, taskish_uid::ThreadGroupUid, wait_status::WaitStatus};
use libc::pid_t;
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

pub type ThreadGroupSharedPtr = Rc<RefCell<ThreadGroup>>;
pub type ThreadGroupSharedWeakPtr = Weak<RefCell<ThreadGroup>>;

/// Tracks a group of tasks with an associated ID, set of tasks, and a
/// child/parent relationship with other thread groups. This is the
/// equivalent of a process.
pub struct ThreadGroup {
    task_set: TaskSet,
    pub tgid: pid_t,
    pub real_tgid: pid_t,
    serial: u32,
    /// The exit status recorded when the last task exited.
    pub exit_status: WaitStatus,
    /// Whether this group has received a group-fatal signal or called
    /// exit_group; its remaining tasks are doomed.
    pub received_sigframe: bool,
    parent_: Option<ThreadGroupSharedWeakPtr>,
    children_: Vec<ThreadGroupSharedWeakPtr>,
}

impl ThreadGroup {
    pub fn new(
        parent: Option<ThreadGroupSharedPtr>,
        tgid: pid_t,
        real_tgid: pid_t,
        serial: u32,
    ) -> ThreadGroupSharedPtr {
        let tg = Rc::new(RefCell::new(ThreadGroup {
            task_set: TaskSet::new(),
            tgid,
            real_tgid,
            serial,
            exit_status: WaitStatus::default(),
            received_sigframe: false,
            parent_: parent.as_ref().map(Rc::downgrade),
            children_: Vec::new(),
        }));
        if let Some(p) = parent {
            p.borrow_mut().children_.push(Rc::downgrade(&tg));
        }
        tg
    }

    pub fn tguid(&self) -> ThreadGroupUid {
        ThreadGroupUid::new_with(self.tgid, self.serial)
    }

    pub fn task_set(&self) -> &TaskSet {
        &self.task_set
    }

    pub fn task_set_mut(&mut self) -> &mut TaskSet {
        &mut self.task_set
    }

    pub fn parent(&self) -> Option<ThreadGroupSharedPtr> {
        self.parent_.as_ref().and_then(|w| w.upgrade())
    }

    pub fn children(&self) -> Vec<ThreadGroupSharedPtr> {
        self.children_.iter().filter_map(|w| w.upgrade()).collect()
    }
}
