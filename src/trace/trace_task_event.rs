use crate::trace::trace_frame::FrameTime;
use libc::pid_t;
use std::ffi::OsString;

/// Task lifecycle records in the `tasks` substream: clone/fork/exec/exit.
/// Replay uses these to reconstruct the task tree.
#[derive(Clone, Debug)]
pub enum TraceTaskEventVariant {
    Clone(CloneVariant),
    Fork(ForkVariant),
    Exec(ExecVariant),
    Exit(ExitVariant),
}

#[derive(Clone, Debug)]
pub struct CloneVariant {
    /// The tid of the task that called clone.
    pub parent_tid: pid_t,
    /// The flags passed to clone.
    pub clone_flags: u64,
}

#[derive(Clone, Debug)]
pub struct ForkVariant {
    pub parent_tid: pid_t,
}

#[derive(Clone, Debug)]
pub struct ExecVariant {
    pub file_name: OsString,
    pub cmd_line: Vec<OsString>,
}

#[derive(Clone, Debug)]
pub struct ExitVariant {
    pub exit_status: i32,
}

#[derive(Clone, Debug)]
pub struct TraceTaskEvent {
    pub(super) time_: FrameTime,
    pub(super) tid_: pid_t,
    pub(super) variant_: TraceTaskEventVariant,
}

impl TraceTaskEvent {
    pub fn for_clone(tid: pid_t, parent_tid: pid_t, clone_flags: u64) -> TraceTaskEvent {
        TraceTaskEvent {
            time_: 0,
            tid_: tid,
            variant_: TraceTaskEventVariant::Clone(CloneVariant {
                parent_tid,
                clone_flags,
            }),
        }
    }

    pub fn for_fork(tid: pid_t, parent_tid: pid_t) -> TraceTaskEvent {
        TraceTaskEvent {
            time_: 0,
            tid_: tid,
            variant_: TraceTaskEventVariant::Fork(ForkVariant { parent_tid }),
        }
    }

    pub fn for_exec(tid: pid_t, file_name: OsString, cmd_line: Vec<OsString>) -> TraceTaskEvent {
        TraceTaskEvent {
            time_: 0,
            tid_: tid,
            variant_: TraceTaskEventVariant::Exec(ExecVariant {
                file_name,
                cmd_line,
            }),
        }
    }

    pub fn for_exit(tid: pid_t, exit_status: i32) -> TraceTaskEvent {
        TraceTaskEvent {
            time_: 0,
            tid_: tid,
            variant_: TraceTaskEventVariant::Exit(ExitVariant { exit_status }),
        }
    }

    pub fn time(&self) -> FrameTime {
        self.time_
    }

    pub fn tid(&self) -> pid_t {
        self.tid_
    }

    pub fn variant(&self) -> &TraceTaskEventVariant {
        &self.variant_
    }

    pub fn is_exec(&self) -> bool {
        matches!(self.variant_, TraceTaskEventVariant::Exec(_))
    }

    pub fn is_exit(&self) -> bool {
        matches!(self.variant_, TraceTaskEventVariant::Exit(_))
    }
}
