//! Sessions track the global state of a set of tracees corresponding
//! to a recorder or replayer. During recording, the tracked tracees all
//! write to the same TraceWriter; during replay, the tracees are all
//! created from the same TraceReader.
//!
//! Multiple sessions can coexist in the same process. This is required when
//! using replay checkpoints.

pub mod address_space;
pub mod record_session;
pub mod replay_session;
pub mod session_inner;
pub mod task;

use crate::{
    kernel_abi::SupportedArch,
    session::{
        record_session::RecordSession,
        replay_session::ReplaySession,
        session_inner::SessionInner,
        task::{Task, TaskSharedPtr},
    },
};
use libc::pid_t;
use std::rc::{Rc, Weak};

pub type SessionSharedPtr = Rc<Box<dyn Session>>;
pub type SessionSharedWeakPtr = Weak<Box<dyn Session>>;

pub trait Session {
    fn as_session_inner(&self) -> &SessionInner;

    fn as_record(&self) -> Option<&RecordSession> {
        None
    }

    fn as_replay(&self) -> Option<&ReplaySession> {
        None
    }

    fn is_recording(&self) -> bool {
        self.as_record().is_some()
    }

    fn is_replaying(&self) -> bool {
        self.as_replay().is_some()
    }

    /// Construct a session-appropriate task object.
    fn new_task(
        &self,
        tid: pid_t,
        rec_tid: pid_t,
        serial: u32,
        arch: SupportedArch,
    ) -> Box<dyn Task>;

    /// Register a freshly created task.
    fn on_create_task(&self, t: TaskSharedPtr) {
        let rec_tid = t.borrow().rec_tid();
        self.as_session_inner()
            .task_map
            .borrow_mut()
            .insert(rec_tid, t);
    }

    /// Notify that a task is dying; drops it from the task map.
    fn on_destroy_task(&self, rec_tid: pid_t) {
        self.as_session_inner().task_map.borrow_mut().remove(&rec_tid);
    }

    /// Return the task created with `rec_tid`, or None if no such task
    /// exists.
    fn find_task_from_rec_tid(&self, rec_tid: pid_t) -> Option<TaskSharedPtr> {
        self.as_session_inner()
            .task_map
            .borrow()
            .get(&rec_tid)
            .cloned()
    }

    fn task_count(&self) -> usize {
        self.as_session_inner().task_map.borrow().len()
    }

    /// All tasks, in tid order.
    fn task_list(&self) -> Vec<TaskSharedPtr> {
        self.as_session_inner()
            .task_map
            .borrow()
            .values()
            .cloned()
            .collect()
    }
}

/// Keep the weak self pointer fresh when constructing a shared session.
pub fn make_shared_session(session: Box<dyn Session>) -> SessionSharedPtr {
    let rc: SessionSharedPtr = Rc::new(session);
    let weak = Rc::downgrade(&rc);
    *rc.as_session_inner().weak_self.borrow_mut() = weak;
    rc
}
