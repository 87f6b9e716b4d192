use crate::{
    log::LogLevel::LogDebug,
    perf_counters,
    perf_counters::{PerfCounters, TicksSemantics},
    session::{
        address_space::{
            AddressSpace, AddressSpaceSharedPtr, AddressSpaceSharedWeakPtr, BreakpointType,
            WatchConfig, WatchType,
        },
        task::{Task, TaskSharedPtr},
        SessionSharedWeakPtr,
    },
    sig::Sig,
    taskish_uid::{AddressSpaceUid, ThreadGroupUid},
    thread_group::{ThreadGroup, ThreadGroupSharedPtr, ThreadGroupSharedWeakPtr},
    ticks::Ticks,
};
use libc::{pid_t, siginfo_t};
use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashMap},
    ffi::OsStr,
    rc::Rc,
    sync::atomic::{AtomicUsize, Ordering},
};

static NONCE: AtomicUsize = AtomicUsize::new(1);

/// The result of one stop during record or replay: which task stopped and
/// every reason that applies. Multiple break reasons can apply
/// simultaneously.
#[derive(Clone, Default)]
pub struct BreakStatus {
    /// The triggering task's rec_tid, or None when no task is associated
    /// (e.g. the session ran dry).
    pub tid: Option<pid_t>,
    /// List of watchpoints hit; any watchpoint hit causes a stop after the
    /// instruction that triggered the watchpoint has completed.
    pub watchpoints_hit: Vec<WatchConfig>,
    /// When non-None, we stopped because a signal was delivered to the task.
    pub signal: Option<Box<siginfo_t>>,
    /// True when we stopped because we hit a software breakpoint at the
    /// task's current ip().
    pub breakpoint_hit: bool,
    /// True when we stopped because a singlestep completed in the task.
    pub singlestep_complete: bool,
    /// True when we stopped because we got too close to the specified ticks
    /// target.
    pub approaching_ticks_target: bool,
    /// True when we stopped because the task is about to exit.
    pub task_exit: bool,
}

impl BreakStatus {
    pub fn new() -> BreakStatus {
        Default::default()
    }

    /// True when we stopped because we hit a software or hardware breakpoint
    /// at the task's current ip().
    pub fn hardware_or_software_breakpoint_hit(&self) -> bool {
        // Hardware execution watchpoints behave like breakpoints: the CPU
        // stops before the instruction is executed.
        self.breakpoint_hit
            || self
                .watchpoints_hit
                .iter()
                .any(|w| w.type_ == WatchType::Exec)
    }

    /// Just the data watchpoints hit.
    pub fn data_watchpoints_hit(&self) -> Vec<WatchConfig> {
        self.watchpoints_hit
            .iter()
            .filter(|w| w.type_ != WatchType::Exec)
            .copied()
            .collect()
    }

    pub fn any_break(&self) -> bool {
        !self.watchpoints_hit.is_empty()
            || self.signal.is_some()
            || self.breakpoint_hit
            || self.singlestep_complete
            || self.approaching_ticks_target
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RunCommand {
    /// Continue until we hit a breakpoint or a new replay event.
    Continue,
    /// Execute a single instruction (unless at a breakpoint or a replay
    /// event).
    Singlestep,
    /// Like Singlestep, but a single-instruction loop is allowed (but not
    /// required) to execute multiple times if we don't reach a different
    /// instruction. Usable with ReplaySession::replay_step only.
    SinglestepFastForward,
}

impl Default for RunCommand {
    fn default() -> Self {
        Self::Continue
    }
}

#[inline]
pub fn is_singlestep(command: RunCommand) -> bool {
    command == RunCommand::Singlestep || command == RunCommand::SinglestepFastForward
}

/// AddressSpaces and ThreadGroups are indexed by their first task's uid
/// (effectively), so that if the first task dies and its tid is recycled,
/// we don't get confused. TaskMap is indexed by tid since there can never be
/// two Tasks with the same tid at the same time.
pub type AddressSpaceMap = BTreeMap<AddressSpaceUid, AddressSpaceSharedWeakPtr>;
pub type TaskMap = BTreeMap<pid_t, TaskSharedPtr>;
pub type ThreadGroupMap = HashMap<ThreadGroupUid, ThreadGroupSharedWeakPtr>;

#[derive(Copy, Clone, Default)]
pub struct Statistics {
    pub bytes_written: u64,
    pub ticks_processed: Ticks,
    pub syscalls_performed: u32,
}

/// State shared by all session kinds. This struct does NOT implement the
/// Session trait.
pub struct SessionInner {
    pub(super) unique_id: usize,
    /// Weak pointer to the owning dyn Session.
    pub weak_self: RefCell<SessionSharedWeakPtr>,
    pub task_map: RefCell<TaskMap>,
    pub(super) vm_map: RefCell<AddressSpaceMap>,
    pub(super) thread_group_map: RefCell<ThreadGroupMap>,

    pub(super) statistics_: RefCell<Statistics>,
    pub(super) next_task_serial_: Cell<u32>,
    pub(super) ticks_semantics_: TicksSemantics,

    /// True once an exec has been observed, so tracee state is consistent
    /// across record and replay.
    pub(super) done_initial_exec_: Cell<bool>,
    /// True while the execution of this session is visible to users.
    pub(super) visible_execution_: Cell<bool>,
}

impl SessionInner {
    pub fn new() -> SessionInner {
        let s = SessionInner {
            unique_id: NONCE.fetch_add(1, Ordering::SeqCst),
            weak_self: Default::default(),
            task_map: Default::default(),
            vm_map: Default::default(),
            thread_group_map: Default::default(),
            statistics_: Default::default(),
            next_task_serial_: Cell::new(1),
            ticks_semantics_: PerfCounters::default_ticks_semantics(),
            done_initial_exec_: Cell::new(false),
            visible_execution_: Cell::new(true),
        };
        log!(LogDebug, "Session {} created", s.unique_id);
        s
    }

    pub fn unique_id(&self) -> usize {
        self.unique_id
    }

    pub fn next_task_serial(&self) -> u32 {
        let val = self.next_task_serial_.get();
        self.next_task_serial_.set(val + 1);
        val
    }

    /// Returns true after the tracee has done the initial exec in spawn.
    /// Before then, tracee state can be inconsistent; from the exec
    /// exit-event onwards, the tracee state must be consistent.
    pub fn done_initial_exec(&self) -> bool {
        self.done_initial_exec_.get()
    }

    pub fn set_done_initial_exec(&self) {
        self.done_initial_exec_.set(true);
    }

    pub fn visible_execution(&self) -> bool {
        self.visible_execution_.get()
    }

    pub fn set_visible_execution(&self, visible: bool) {
        self.visible_execution_.set(visible)
    }

    pub fn ticks_semantics(&self) -> TicksSemantics {
        self.ticks_semantics_
    }

    /// Create and return a new address space that's constructed
    /// from `t`'s actual OS address space. When spawning, `exe` is the empty
    /// string; it will be replaced during the first execve(), when we first
    /// start running real tracee code.
    pub fn create_vm(&self, t: &dyn Task, maybe_exe: Option<&OsStr>) -> AddressSpaceSharedPtr {
        let exe = maybe_exe.unwrap_or_else(|| OsStr::new(""));
        let as_ = AddressSpace::new_after_execve(t, exe, 0);
        let as_uid = as_.uid();
        let shr_ptr = Rc::new(as_);
        self.vm_map
            .borrow_mut()
            .insert(as_uid, Rc::downgrade(&shr_ptr));
        shr_ptr
    }

    /// Return a copy of `clone_from_vm` with the same mappings. If any
    /// mapping is changed, only the cloned copy is updated, not its origin;
    /// these are the copy-on-write semantics behind checkpoints.
    pub fn clone_vm(
        &self,
        leader_tid: pid_t,
        leader_serial: u32,
        exec_count: u32,
        clone_from_vm: &AddressSpace,
    ) -> AddressSpaceSharedPtr {
        let addr_space = AddressSpace::new_after_fork_or_session_clone(
            clone_from_vm,
            leader_tid,
            leader_serial,
            exec_count,
        );
        let as_uid = addr_space.uid();
        let shr_ptr = Rc::new(addr_space);
        self.vm_map
            .borrow_mut()
            .insert(as_uid, Rc::downgrade(&shr_ptr));
        shr_ptr
    }

    /// Create the initial thread group for `t`.
    pub fn create_initial_tg(&self, rec_tid: pid_t, tid: pid_t, serial: u32) -> ThreadGroupSharedPtr {
        let tg = ThreadGroup::new(None, rec_tid, tid, serial);
        tg.borrow_mut().task_set_mut().insert_task(rec_tid);
        self.on_create_tg(&tg);
        tg
    }

    pub fn on_create_tg(&self, tg: &ThreadGroupSharedPtr) {
        self.thread_group_map
            .borrow_mut()
            .insert(tg.borrow().tguid(), Rc::downgrade(tg));
    }

    pub fn on_destroy_tg(&self, tguid: ThreadGroupUid) {
        self.thread_group_map.borrow_mut().remove(&tguid);
    }

    pub fn on_destroy_vm(&self, vm_uid: AddressSpaceUid) {
        self.vm_map.borrow_mut().remove(&vm_uid);
    }

    pub fn find_thread_group(&self, tguid: &ThreadGroupUid) -> Option<ThreadGroupSharedPtr> {
        self.thread_group_map
            .borrow()
            .get(tguid)
            .and_then(|w| w.upgrade())
    }

    /// The set of AddressSpaces being tracked in this session.
    pub fn vms(&self) -> Vec<AddressSpaceSharedPtr> {
        self.vm_map
            .borrow()
            .values()
            .filter_map(|weak| weak.upgrade())
            .collect()
    }

    pub fn accumulate_bytes_written(&self, bytes_written: u64) {
        self.statistics_.borrow_mut().bytes_written += bytes_written
    }

    pub fn accumulate_syscall_performed(&self) {
        self.statistics_.borrow_mut().syscalls_performed += 1
    }

    pub fn accumulate_ticks_processed(&self, ticks: Ticks) {
        self.statistics_.borrow_mut().ticks_processed += ticks;
    }

    pub fn statistics(&self) -> Statistics {
        *self.statistics_.borrow()
    }

    /// Classify the SIGTRAP (or other signal) the task stopped with into
    /// debugger-visible break reasons.
    pub fn diagnose_debugger_trap(&self, t: &mut dyn Task, run_command: RunCommand) -> BreakStatus {
        let mut break_status = BreakStatus::new();
        break_status.tid = Some(t.rec_tid());

        let maybe_stop_sig: Option<Sig> = t.maybe_stop_sig();
        let stop_sig = match maybe_stop_sig {
            // This can happen if we were Incomplete because we're close to
            // the ticks_target.
            None => return break_status,
            Some(s) => s,
        };

        if stop_sig != crate::sig::SIGTRAP {
            let pending_bp: BreakpointType = t.vm().get_breakpoint_type_at_addr(t.ip());
            if BreakpointType::BkptUser == pending_bp {
                // A signal was raised /just/ before a trap
                // instruction for a SW breakpoint. This is
                // observed when debuggers write trap
                // instructions into no-exec memory, for
                // example the stack.
                //
                // We report the breakpoint before any signal
                // that might have been raised in order to let
                // the debugger do something at the breakpoint
                // insn; possibly clearing the breakpoint and
                // changing the $ip. Otherwise, we expect the
                // debugger to clear the breakpoint and resume
                // execution, which should raise the original
                // signal again.
                log!(LogDebug, "hit debugger breakpoint BEFORE ip {}", t.ip());
                break_status.breakpoint_hit = true;
            } else if stop_sig != perf_counters::TIME_SLICE_SIGNAL {
                let mut si = t.get_siginfo();
                si.si_signo = stop_sig.as_raw();
                break_status.signal = Some(Box::new(si));
                log!(LogDebug, "got signal {}", stop_sig);
            }
        } else {
            let trap_reasons = t.compute_trap_reasons();

            // Conceal any internal singlestepping from the debugger.
            if trap_reasons.singlestep && is_singlestep(run_command) {
                log!(LogDebug, "  finished debugger stepi");
                break_status.singlestep_complete = true;
            }

            if trap_reasons.watchpoint {
                let status = t.as_task_inner().last_debug_status();
                t.vm().notify_watchpoint_fired(&*t, status);
                self.check_for_watchpoint_changes(&*t, &mut break_status);
            }

            if trap_reasons.breakpoint {
                let retired_bp: BreakpointType =
                    t.vm().get_breakpoint_type_for_retired_insn(t.ip());
                if BreakpointType::BkptUser == retired_bp {
                    // SW breakpoint: $ip is just past the breakpoint
                    // instruction. Move $ip back right before it.
                    t.move_ip_before_breakpoint();
                    break_status.breakpoint_hit = true;
                    log!(LogDebug, "hit debugger breakpoint at ip {}", t.ip());
                }
            }
        }

        break_status
    }

    pub fn check_for_watchpoint_changes(&self, t: &dyn Task, break_status: &mut BreakStatus) {
        break_status.watchpoints_hit = t.vm().consume_watchpoint_changes();
    }
}

impl Default for SessionInner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        log!(LogDebug, "Session {} destroyed", self.unique_id);
    }
}
