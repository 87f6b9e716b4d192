//! The replay step engine: advance one task to the next recorded frame,
//! faithfully reproducing its register and memory state.

use crate::{
    emu_fs::{EmuFs, EmuFsSharedPtr},
    event::{Event, EventType, SignalDeterministic, SignalEventData, SyscallState},
    kernel_abi::SupportedArch,
    log::LogLevel::LogDebug,
    perf_counters::{PerfCounters, TIME_SLICE_SIGNAL},
    preload_interface::{syscallbuf_hdr, SYSCALLBUF_DESCHED_SIGNAL},
    registers::Registers,
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::RemotePtr,
    session::{
        make_shared_session,
        session_inner::{BreakStatus, RunCommand, SessionInner},
        task::{
            read_val_mem, replay_task::ReplayTask, task_inner::ResumeRequest,
            task_inner::TaskInner, task_inner::TicksRequest, task_inner::WaitRequest, Task,
            TaskSharedPtr,
        },
        Session, SessionSharedPtr,
    },
    sig::Sig,
    ticks::Ticks,
    trace::{
        trace_frame::{FrameTime, TraceFrame},
        trace_reader::TraceReader,
    },
};
use libc::pid_t;
use std::{
    cell::{Cell, Ref, RefCell, RefMut},
    convert::TryFrom,
    ffi::{OsStr, OsString},
    mem::size_of,
    rc::Rc,
};

/// A change to a tracee hasn't happened yet or has completed.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Completion {
    Complete,
    Incomplete,
}

/// ReplayFlushBufferedSyscallState is saved in the session and cloned with
/// it, so it needs to be simple data.
#[derive(Copy, Clone, Eq, PartialEq, Default)]
pub struct ReplayFlushBufferedSyscallState {
    /// An internal breakpoint is set at this address: the end-of-flush stop.
    pub stop_breakpoint_addr: usize,
}

/// Describes the next step to be taken in order to replay a trace frame.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
#[repr(i32)]
pub enum ReplayTraceStepType {
    TstepNone,

    /// Enter/exit a syscall. `syscall` describes what should be done at
    /// entry/exit.
    TstepEnterSyscall,
    TstepExitSyscall,

    /// Advance to the deterministic signal `signo`.
    TstepDeterministicSignal,

    /// Advance until `target.ticks` have been retired and then `target.ip`
    /// is reached.
    TstepProgramAsyncSignalInterrupt,

    /// Deliver signal `signo`.
    TstepDeliverSignal,

    /// Replay the upcoming buffered syscalls. `flush` tracks the replay
    /// state.
    TstepFlushSyscallbuf,

    /// Replay until we enter the next syscall, then patch it.
    TstepPatchSyscall,

    /// Exit the task.
    TstepExitTask,

    /// Frame has been replayed, done.
    TstepRetire,
}

impl Default for ReplayTraceStepType {
    fn default() -> Self {
        ReplayTraceStepType::TstepNone
    }
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub struct ReplayTraceStepSyscall {
    /// The architecture of the syscall.
    pub arch: SupportedArch,
    /// The syscall number we expect to enter/exit.
    pub number: i32,
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub struct ReplayTraceStepTarget {
    /// Nonzero when the tick count must match before the step completes.
    pub ticks: Ticks,
    pub signo: i32,
}

/// The step is saved in the session and cloned with it, so it needs to be
/// simple data.
#[derive(Copy, Clone, Eq, PartialEq)]
pub enum ReplayTraceStepData {
    None,
    Syscall(ReplayTraceStepSyscall),
    Target(ReplayTraceStepTarget),
    Flush(ReplayFlushBufferedSyscallState),
}

impl Default for ReplayTraceStepData {
    fn default() -> Self {
        ReplayTraceStepData::None
    }
}

#[derive(Default, Copy, Clone, Eq, PartialEq)]
pub struct ReplayTraceStep {
    pub action: ReplayTraceStepType,
    pub data: ReplayTraceStepData,
}

impl ReplayTraceStep {
    pub fn syscall(&self) -> ReplayTraceStepSyscall {
        match self.data {
            ReplayTraceStepData::Syscall(s) => s,
            _ => panic!("Not a ReplayTraceStepData::Syscall"),
        }
    }

    pub fn target(&self) -> ReplayTraceStepTarget {
        match self.data {
            ReplayTraceStepData::Target(t) => t,
            _ => panic!("Not a ReplayTraceStepData::Target"),
        }
    }

    pub fn flush(&self) -> ReplayFlushBufferedSyscallState {
        match self.data {
            ReplayTraceStepData::Flush(f) => f,
            _ => panic!("Not a ReplayTraceStepData::Flush"),
        }
    }
}

#[derive(Eq, Debug, PartialEq, Copy, Clone)]
pub enum ReplayStatus {
    /// Some execution was replayed. replay_step() can be called again.
    ReplayContinue,
    /// All tracees are dead. replay_step() should not be called again.
    ReplayExited,
}

pub struct StepConstraints {
    pub command: RunCommand,
    /// Stop when the current event reaches this time (i.e. this event is
    /// the next event to be replayed).
    pub stop_at_time: FrameTime,
    /// If nonzero, stop before the current task's ticks reaches this (but
    /// not too far before, unless we hit a breakpoint or stop_at_time).
    /// Only useful with RunCommand::Continue.
    pub ticks_target: Ticks,
    /// When the command is SinglestepFastForward, stop if the next
    /// singlestep would enter one of the register states in this list.
    /// SinglestepFastForward will always singlestep at least once
    /// regardless.
    pub stop_before_states: Vec<Registers>,
}

impl StepConstraints {
    pub fn new(command: RunCommand) -> StepConstraints {
        StepConstraints {
            command,
            stop_at_time: 0,
            ticks_target: 0,
            stop_before_states: Vec::new(),
        }
    }

    pub fn is_singlestep(&self) -> bool {
        self.command == RunCommand::Singlestep
            || self.command == RunCommand::SinglestepFastForward
    }
}

pub struct ReplayResult {
    pub status: ReplayStatus,
    pub break_status: BreakStatus,
    /// True if we did a fast-forward operation, in which case
    /// break_status.singlestep_complete might indicate the completion of
    /// more than one instruction.
    pub did_fast_forward: bool,
}

impl ReplayResult {
    pub fn new(status: ReplayStatus) -> ReplayResult {
        ReplayResult {
            status,
            break_status: BreakStatus::new(),
            did_fast_forward: false,
        }
    }
}

/// An indicator of how much progress the ReplaySession has made within a
/// given (FrameTime, Ticks) pair. These can only be used for comparisons,
/// to check whether two ReplaySessions are in the same state and to help
/// order their states temporally.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct ReplayStepKey {
    action: ReplayTraceStepType,
}

impl ReplayStepKey {
    /// The "none" key; this value is before or equal to every other key
    /// value.
    pub fn new() -> ReplayStepKey {
        ReplayStepKey {
            action: ReplayTraceStepType::TstepNone,
        }
    }

    pub fn new_with(action: ReplayTraceStepType) -> ReplayStepKey {
        ReplayStepKey { action }
    }

    pub fn in_execution(&self) -> bool {
        self.action != ReplayTraceStepType::TstepNone
    }

    pub fn as_i32(&self) -> i32 {
        self.action as i32
    }
}

impl Default for ReplayStepKey {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Copy, Clone)]
pub struct Flags {
    pub redirect_stdio: bool,
    pub share_private_mappings: bool,
    pub cpu_unbound: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            redirect_stdio: true,
            share_private_mappings: false,
            cpu_unbound: false,
        }
    }
}

pub struct ReplaySession {
    session_inner: SessionInner,
    emu_fs: EmuFsSharedPtr,
    trace_in: RefCell<TraceReader>,
    trace_frame: RefCell<TraceFrame>,
    current_step: Cell<ReplayTraceStep>,
    ticks_at_start_of_event: Cell<Ticks>,
    last_siginfo_: Cell<libc::siginfo_t>,
    flags_: Flags,
    did_fast_forward: Cell<bool>,
    /// The clock_gettime(CLOCK_MONOTONIC) timestamp of the first trace
    /// event, used to pace optional "real time" replays.
    trace_start_time: Cell<f64>,
}

impl ReplaySession {
    /// Create a replay session that will use the trace directory specified
    /// by `dir`, or the latest trace if `dir` is None.
    pub fn create(dir: Option<&OsStr>, flags: Flags) -> SessionSharedPtr {
        let mut trace_in = TraceReader::new(dir);
        let exe: OsString = trace_in
            .argv()
            .first()
            .cloned()
            .unwrap_or_else(OsString::new);
        let argv: Vec<OsString> = trace_in.argv().to_vec();
        let envp: Vec<OsString> = trace_in.envp().to_vec();

        let session = ReplaySession {
            session_inner: SessionInner::new(),
            emu_fs: EmuFs::create(),
            trace_in: RefCell::new(trace_in),
            trace_frame: RefCell::new(TraceFrame::default()),
            current_step: Cell::new(ReplayTraceStep::default()),
            ticks_at_start_of_event: Cell::new(0),
            last_siginfo_: Cell::new(unsafe { std::mem::zeroed() }),
            flags_: flags,
            did_fast_forward: Cell::new(false),
            trace_start_time: Cell::new(0.0),
        };

        let rc = make_shared_session(Box::new(session));
        let replay = rc.as_replay().unwrap();
        replay.advance_to_next_trace_frame();
        replay
            .trace_start_time
            .set(replay.current_trace_frame().monotonic_time());

        // Spawn the initial tracee, stopped at the head of the recording.
        let first_tid = replay.current_trace_frame().tid();
        let tid = TaskInner::spawn_tracee(&exe, &argv, &envp);
        let t: Box<dyn Task> = rc.new_task(
            tid,
            first_tid,
            rc.as_session_inner().next_task_serial(),
            SupportedArch::default(),
        );
        let t_shared: TaskSharedPtr = Rc::new(RefCell::new(t));
        {
            let mut tb = t_shared.borrow_mut();
            let vm = rc.as_session_inner().create_vm(&**tb, Some(&exe));
            tb.as_task_inner_mut().set_vm(vm);
            let tg = rc.as_session_inner().create_initial_tg(first_tid, tid, 0);
            tb.as_task_inner_mut().set_thread_group(tg);
        }
        rc.on_create_task(t_shared);
        rc
    }

    pub fn flags(&self) -> &Flags {
        &self.flags_
    }

    pub fn emu_fs_shared(&self) -> EmuFsSharedPtr {
        self.emu_fs.clone()
    }

    pub fn trace_reader(&self) -> Ref<'_, TraceReader> {
        self.trace_in.borrow()
    }

    pub fn trace_reader_mut(&self) -> RefMut<'_, TraceReader> {
        self.trace_in.borrow_mut()
    }

    /// The trace record that we are working on: the next event for replay
    /// to reach.
    pub fn current_trace_frame(&self) -> Ref<'_, TraceFrame> {
        self.trace_frame.borrow()
    }

    pub fn current_frame_time(&self) -> FrameTime {
        self.trace_frame.borrow().time()
    }

    /// The Task for the current trace record.
    pub fn current_task(&self) -> Option<TaskSharedPtr> {
        self.find_task_from_rec_tid(self.current_trace_frame().tid())
    }

    /// How much progress the session has made within the current frame.
    pub fn current_step_key(&self) -> ReplayStepKey {
        ReplayStepKey::new_with(self.current_step.get().action)
    }

    pub fn ticks_at_start_of_current_event(&self) -> Ticks {
        self.ticks_at_start_of_event.get()
    }

    /// A closed set of signals that the supervisor generates but must not
    /// deliver to replayed tracees.
    pub fn is_ignored_signal(sig: Option<Sig>) -> bool {
        match sig {
            // TIME_SLICE_SIGNALs can be queued but not delivered before we
            // stop execution for some other reason. Ignore them.
            Some(s) if s == TIME_SLICE_SIGNAL => true,
            // The desched counter is left armed across replay; its
            // deliveries carry no replay meaning.
            Some(s) if s.as_raw() == SYSCALLBUF_DESCHED_SIGNAL => true,
            _ => false,
        }
    }

    /// Return a semantic copy of all the state managed by this, that is the
    /// entire tracee tree and the state it depends on. Any mutations of the
    /// returned session can't affect the state of this, and vice versa.
    ///
    /// This operation is also called "checkpointing" the replay session.
    pub fn clone_replay(&self) -> SessionSharedPtr {
        let session = ReplaySession {
            session_inner: SessionInner::new(),
            emu_fs: self.emu_fs.borrow().clone_fs(),
            trace_in: RefCell::new(self.trace_in.borrow().clone()),
            trace_frame: RefCell::new(self.trace_frame.borrow().clone()),
            current_step: Cell::new(self.current_step.get()),
            ticks_at_start_of_event: Cell::new(self.ticks_at_start_of_event.get()),
            last_siginfo_: Cell::new(self.last_siginfo_.get()),
            flags_: self.flags_,
            did_fast_forward: Cell::new(false),
            trace_start_time: Cell::new(self.trace_start_time.get()),
        };
        let rc = make_shared_session(Box::new(session));

        // Duplicate every tracee by forking it in place: the fork child
        // inherits the exact memory and register state of the stop the
        // origin task is in, and the copied address-space map is re-keyed
        // onto the clone. Shared mappings were reinstalled against the
        // emulated filesystem at map time, and the emufs clone above copied
        // those files, so the clone's writes land in its own copies.
        for t in self.task_list() {
            let mut task = t.borrow_mut();
            let inner = task.as_task_inner_mut();
            let child_tid = fork_task_into(inner);
            let new_task: Box<dyn Task> = rc.new_task(
                child_tid,
                inner.rec_tid,
                rc.as_session_inner().next_task_serial(),
                inner.arch(),
            );
            let new_shared: TaskSharedPtr = Rc::new(RefCell::new(new_task));
            {
                let mut nb = new_shared.borrow_mut();
                let vm = rc.as_session_inner().clone_vm(
                    inner.rec_tid,
                    nb.tuid().serial(),
                    0,
                    &inner.vm(),
                );
                nb.as_task_inner_mut().set_vm(vm);
                let tg = rc.as_session_inner().create_initial_tg(
                    inner.rec_tid,
                    child_tid,
                    nb.tuid().serial(),
                );
                nb.as_task_inner_mut().set_thread_group(tg);
                nb.as_task_inner_mut().set_regs(*inner.regs_ref());
                nb.as_task_inner_mut().syscallbuf_child = inner.syscallbuf_child;
                nb.as_task_inner_mut().syscallbuf_size = inner.syscallbuf_size;
                nb.as_task_inner_mut().preload_globals_child = inner.preload_globals_child;
                nb.as_task_inner_mut().set_tick_count(inner.tick_count());
            }
            rc.on_create_task(new_shared);
        }
        rc
    }

    /// True when it's OK to clone: between frames, never mid-step.
    pub fn can_clone(&self) -> bool {
        self.current_step.get().action == ReplayTraceStepType::TstepNone
    }

    fn advance_to_next_trace_frame(&self) {
        if self.trace_in.borrow().at_end() {
            let time = self.current_frame_time();
            let ticks = self.current_trace_frame().ticks();
            let monotonic = self.current_trace_frame().monotonic_time();
            *self.trace_frame.borrow_mut() =
                TraceFrame::new_with(time, 0, Event::trace_termination(), ticks, monotonic);
            return;
        }

        *self.trace_frame.borrow_mut() = self.trace_in.borrow_mut().read_frame();
    }

    pub fn replay_step(&self, command: RunCommand) -> ReplayResult {
        self.replay_step_with_constraints(StepConstraints::new(command))
    }

    /// Take a single replay step: advance the current task towards the
    /// current frame, then retire the frame when it completes.
    ///
    /// Outside of replay_step, no internal breakpoints are set for any task
    /// in this session. The engine always stops on a task switch.
    pub fn replay_step_with_constraints(&self, constraints: StepConstraints) -> ReplayResult {
        let mut result = ReplayResult::new(ReplayStatus::ReplayContinue);

        if self.current_trace_frame().event().event_type() == EventType::EvTraceTermination {
            result.status = ReplayStatus::ReplayExited;
            return result;
        }

        // If we restored from a checkpoint, the steps might have been
        // computed already, in which case step.action will not be TstepNone.
        if self.current_step.get().action == ReplayTraceStepType::TstepNone {
            let maybe_t = self.setup_replay_one_trace_frame();
            if self.current_step.get().action == ReplayTraceStepType::TstepNone {
                // Already at the destination event.
                self.advance_to_next_trace_frame();
                if let Some(t) = maybe_t {
                    result.break_status.tid = Some(t.borrow().rec_tid());
                    result.break_status.task_exit = true;
                }
                return result;
            }
        }

        let rc_t = match self.current_task() {
            Some(t) => t,
            None => {
                result.status = ReplayStatus::ReplayExited;
                return result;
            }
        };
        self.did_fast_forward.set(false);
        result.break_status.tid = Some(rc_t.borrow().rec_tid());

        let mut task = rc_t.borrow_mut();
        let t = task.as_replay_task_mut().unwrap();

        // Advance towards fulfilling the current step.
        if self.try_one_trace_step(t, &constraints) == Completion::Incomplete {
            if EventType::EvTraceTermination == self.current_trace_frame().event().event_type() {
                // An irregular trace step had to read the next trace frame,
                // and that frame was an early-termination marker.
                result.status = ReplayStatus::ReplayExited;
                return result;
            }

            // Incomplete because of a debugger trap or nearing the ticks
            // target.
            result.break_status = self
                .session_inner
                .diagnose_debugger_trap(&mut **task, constraints.command);
            self.check_approaching_ticks_target(
                task.as_replay_task().unwrap(),
                &constraints,
                &mut result.break_status,
            );
            result.did_fast_forward = self.did_fast_forward.get();
            return result;
        }

        let t = task.as_replay_task_mut().unwrap();
        result.did_fast_forward = self.did_fast_forward.get();

        // The step is complete: verify the tracee against the recording,
        // then retire the frame.
        let current_step = self.current_step.get();
        match current_step.action {
            ReplayTraceStepType::TstepDeterministicSignal
            | ReplayTraceStepType::TstepProgramAsyncSignalInterrupt => {
                if current_step.target().signo != 0 {
                    let frame = self.current_trace_frame();
                    if !frame.event().has_ticks_slop() {
                        ed_assert!(
                            t,
                            frame.ticks() == t.tick_count(),
                            "ticks mismatch at event {}: recorded {} vs. {}",
                            frame.time(),
                            frame.ticks(),
                            t.tick_count()
                        );
                    }
                    t.validate_regs(&frame);
                }
            }
            ReplayTraceStepType::TstepExitTask => {
                result.break_status.task_exit = true;
                result.break_status.tid = None;
            }
            _ => {
                let frame = self.current_trace_frame();
                if !frame.event().has_ticks_slop() && frame.event().has_exec_info() {
                    ed_assert!(
                        t,
                        frame.ticks() == t.tick_count(),
                        "ticks mismatch at event {}: recorded {} vs. {}",
                        frame.time(),
                        frame.ticks(),
                        t.tick_count()
                    );
                }
                t.validate_regs(&frame);
            }
        }

        drop(task);
        self.current_step.set(ReplayTraceStep::default());
        self.advance_to_next_trace_frame();
        if let Some(t) = self.current_task() {
            self.ticks_at_start_of_event.set(t.borrow().tick_count());
        }
        result
    }

    /// Set up current_step state to start replaying towards the event given
    /// by the session's current frame, but only if it's not already set up.
    fn setup_replay_one_trace_frame(&self) -> Option<TaskSharedPtr> {
        let t_shr = self.current_task()?;
        let mut task = t_shr.borrow_mut();
        let t = task.as_replay_task_mut().unwrap();

        let frame = self.current_trace_frame();
        let ev = frame.event().clone();
        let frame_ticks = frame.ticks();
        let frame_time = frame.time();
        let frame_regs = *frame.regs_ref();
        drop(frame);

        log!(
            LogDebug,
            "[event {}] {}: replaying {}",
            frame_time,
            t.rec_tid,
            ev
        );
        if !t.syscallbuf_child.is_null() {
            let addr = RemotePtr::<u32>::cast(
                RemotePtr::<u8>::cast(t.syscallbuf_child),
            );
            let num_rec_bytes = read_val_mem(&*t, addr);
            log!(LogDebug, "    (syscllbufsz:{})", num_rec_bytes);
        }

        let mut current_step = ReplayTraceStep::default();
        match ev.event_type() {
            EventType::EvExit | EventType::EvUnstableExit => {
                // An unstable exit implies possibly-incomplete teardown; in
                // both cases we run the task to its final exit stop and
                // destroy it, but for the unstable case there is no exit
                // status to wait on synchronously.
                current_step = ReplayTraceStep {
                    action: ReplayTraceStepType::TstepExitTask,
                    data: Default::default(),
                };
            }
            EventType::EvExitSighandler | EventType::EvInterruptedSyscallNotRestarted => {
                // Ordering breadcrumbs: nothing to execute, the event's only
                // job is sequencing interruption records on the recorder
                // side.
                current_step = ReplayTraceStep {
                    action: ReplayTraceStepType::TstepRetire,
                    data: Default::default(),
                };
            }
            EventType::EvSyscallbufAbortCommit => {
                let child_addr = RemotePtr::<u8>::cast(t.syscallbuf_child)
                    + memoffset_abort_commit();
                crate::session::task::write_mem(&*t, child_addr, &[1u8]);
                t.apply_all_data_records_from_trace(&mut self.trace_in.borrow_mut());
                current_step = ReplayTraceStep {
                    action: ReplayTraceStepType::TstepRetire,
                    data: Default::default(),
                };
            }
            EventType::EvSyscallbufFlush => {
                self.prepare_syscallbuf_records(t);
                current_step = ReplayTraceStep {
                    action: ReplayTraceStepType::TstepFlushSyscallbuf,
                    data: ReplayTraceStepData::Flush(ReplayFlushBufferedSyscallState {
                        stop_breakpoint_addr: self.flush_stop_breakpoint_addr(t),
                    }),
                };
            }
            EventType::EvSyscallbufReset => {
                // Reset syscallbuf_hdr->num_rec_bytes and zero out the
                // recorded data. Zeroing out the data is important because
                // we only save and restore the recorded data area when
                // making checkpoints. We want the checkpoint to have the
                // same syscallbuf contents as its original, i.e. zero
                // outside the recorded data area, so that stray reads are
                // consistent.
                self.reset_syscallbuf(t);
                current_step = ReplayTraceStep {
                    action: ReplayTraceStepType::TstepRetire,
                    data: Default::default(),
                };
            }
            EventType::EvPatchSyscall => {
                current_step = ReplayTraceStep {
                    action: ReplayTraceStepType::TstepPatchSyscall,
                    data: Default::default(),
                };
            }
            EventType::EvSched => {
                current_step = ReplayTraceStep {
                    action: ReplayTraceStepType::TstepProgramAsyncSignalInterrupt,
                    data: ReplayTraceStepData::Target(ReplayTraceStepTarget {
                        ticks: frame_ticks,
                        signo: 0,
                    }),
                };
            }
            EventType::EvSegvRdtsc => {
                current_step = ReplayTraceStep {
                    action: ReplayTraceStepType::TstepDeterministicSignal,
                    data: ReplayTraceStepData::Target(ReplayTraceStepTarget {
                        ticks: 0,
                        signo: libc::SIGSEGV,
                    }),
                };
            }
            EventType::EvGrowMap => {
                self.process_grow_map(t);
                current_step = ReplayTraceStep {
                    action: ReplayTraceStepType::TstepRetire,
                    data: Default::default(),
                };
            }
            EventType::EvSignal => {
                self.last_siginfo_.set(ev.signal_event().siginfo);
                if treat_signal_event_as_deterministic(ev.signal_event()) {
                    current_step = ReplayTraceStep {
                        action: ReplayTraceStepType::TstepDeterministicSignal,
                        data: ReplayTraceStepData::Target(ReplayTraceStepTarget {
                            ticks: 0,
                            signo: ev.signal_event().siginfo.si_signo,
                        }),
                    };
                } else {
                    current_step = ReplayTraceStep {
                        action: ReplayTraceStepType::TstepProgramAsyncSignalInterrupt,
                        data: ReplayTraceStepData::Target(ReplayTraceStepTarget {
                            ticks: frame_ticks,
                            signo: ev.signal_event().siginfo.si_signo,
                        }),
                    };
                }
            }
            EventType::EvSignalDelivery | EventType::EvSignalHandler => {
                current_step = ReplayTraceStep {
                    action: ReplayTraceStepType::TstepDeliverSignal,
                    data: ReplayTraceStepData::Target(ReplayTraceStepTarget {
                        ticks: 0,
                        signo: ev.signal_event().siginfo.si_signo,
                    }),
                };
            }
            EventType::EvSyscall => {
                let sys_ev = ev.syscall_event();
                if sys_ev.state == SyscallState::EnteringSyscall {
                    current_step = ReplayTraceStep {
                        action: ReplayTraceStepType::TstepEnterSyscall,
                        data: ReplayTraceStepData::Syscall(ReplayTraceStepSyscall {
                            arch: sys_ev.arch(),
                            number: sys_ev.number,
                        }),
                    };
                } else {
                    current_step = ReplayTraceStep {
                        action: ReplayTraceStepType::TstepExitSyscall,
                        data: ReplayTraceStepData::Syscall(ReplayTraceStepSyscall {
                            arch: sys_ev.arch(),
                            number: sys_ev.number,
                        }),
                    };
                }
            }
            EventType::EvSyscallInterruption => {
                // The interrupted syscall will be re-entered at the next
                // Syscall frame; at this frame we just need to reach the
                // entry state again.
                current_step = ReplayTraceStep {
                    action: ReplayTraceStepType::TstepEnterSyscall,
                    data: ReplayTraceStepData::Syscall(ReplayTraceStepSyscall {
                        arch: ev.syscall_event().arch(),
                        number: ev.syscall_event().number,
                    }),
                };
            }
            EventType::EvUnassigned
            | EventType::EvNoop
            | EventType::EvDesched
            | EventType::EvTraceTermination => {
                fatal!("Unexpected event {}", ev);
            }
        }

        let _ = frame_regs;
        self.current_step.set(current_step);
        drop(task);
        Some(t_shr)
    }

    // --- Step execution ---------------------------------------------------

    fn try_one_trace_step(&self, t: &mut ReplayTask, constraints: &StepConstraints) -> Completion {
        if constraints.ticks_target > 0
            && !self.current_trace_frame().event().has_ticks_slop()
            && t.tick_count() + PerfCounters::skid_size() >= constraints.ticks_target
        {
            // Instead of doing this step, just advance to the ticks_target.
            // The tick count is within the skid region of the target, so
            // enter that region carefully.
            return self.emulate_async_signal(t, constraints, 0, constraints.ticks_target);
        }

        let current_step = self.current_step.get();
        match current_step.action {
            ReplayTraceStepType::TstepRetire => Completion::Complete,
            ReplayTraceStepType::TstepEnterSyscall => self.enter_syscall(t, constraints),
            ReplayTraceStepType::TstepExitSyscall => self.exit_syscall(t),
            ReplayTraceStepType::TstepDeterministicSignal => {
                self.emulate_deterministic_signal(t, current_step.target().signo, constraints)
            }
            ReplayTraceStepType::TstepProgramAsyncSignalInterrupt => self.emulate_async_signal(
                t,
                constraints,
                current_step.target().signo,
                current_step.target().ticks,
            ),
            ReplayTraceStepType::TstepDeliverSignal => {
                self.deliver_signal(t, current_step.target().signo)
            }
            ReplayTraceStepType::TstepFlushSyscallbuf => {
                self.flush_syscallbuf(t, constraints)
            }
            ReplayTraceStepType::TstepPatchSyscall => self.patch_next_syscall(t),
            ReplayTraceStepType::TstepExitTask => self.exit_task(t),
            ReplayTraceStepType::TstepNone => Completion::Complete,
        }
    }

    /// Advance the task to the kernel-entry stop for the expected syscall.
    /// All replayed syscalls are emulated (PTRACE_SYSEMU): the kernel never
    /// processes them, their observable effects come from the trace.
    fn enter_syscall(&self, t: &mut ReplayTask, constraints: &StepConstraints) -> Completion {
        let frame_regs = *self.current_trace_frame().regs_ref();

        if t.regs_ref().matches(&frame_regs) && t.status().is_syscall() {
            // Already at the entry stop.
            return Completion::Complete;
        }

        // Set a breakpoint at the recorded entry ip to catch it even when
        // user breakpoints and signals intervene.
        let entry_ip = frame_regs.ip();
        let vm = t.vm();
        let set_bp = vm.get_breakpoint_type_at_addr(entry_ip)
            == crate::session::address_space::BreakpointType::BkptNone;
        if set_bp {
            vm.add_breakpoint(
                &*t,
                entry_ip,
                crate::session::address_space::BreakpointType::BkptInternal,
            );
        }

        loop {
            t.resume_execution(
                ResumeRequest::ResumeSysemu,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeUnlimitedTicks,
                None,
            );
            if t.status().is_syscall() || t.status().ptrace_event().is_some() {
                // The preload's init calls re-run during replay; they must
                // receive the same setup as during recording, and they are
                // not trace frames.
                let live_no = t.regs_ref().original_syscallno() as i32;
                if live_no == crate::preload_interface::SYS_rtcall_init_preload
                    || live_no == crate::preload_interface::SYS_rtcall_init_buffers
                {
                    self.process_rtcall_during_replay(t, live_no);
                    continue;
                }
                break;
            }
            if let Some(sig) = t.maybe_stop_sig() {
                if Self::is_ignored_signal(Some(sig)) {
                    continue;
                }
                if sig == crate::sig::SIGTRAP {
                    // A breakpoint, ours or the user's; report Incomplete so
                    // the outer loop can diagnose.
                    if set_bp {
                        vm.remove_breakpoint(
                            &*t,
                            entry_ip,
                            crate::session::address_space::BreakpointType::BkptInternal,
                        );
                    }
                    return Completion::Incomplete;
                }
            }
            if t.status().exit_code().is_some() || t.status().fatal_sig().is_some() {
                fatal!("Tracee died before reaching syscall entry");
            }
            let _ = constraints;
        }

        if set_bp {
            vm.remove_breakpoint(
                &*t,
                entry_ip,
                crate::session::address_space::BreakpointType::BkptInternal,
            );
        }
        Completion::Complete
    }

    /// Emulate the kernel-exit of the current syscall: restore outparam
    /// memory from the trace and install the recorded registers.
    fn exit_syscall(&self, t: &mut ReplayTask) -> Completion {
        {
            let mut trace_in = self.trace_in.borrow_mut();
            t.apply_all_data_records_from_trace(&mut trace_in);
        }
        let frame = self.current_trace_frame();
        t.set_regs_from_trace(frame.regs_ref());
        drop(frame);
        // Flush so the tracee really holds these registers before the next
        // resume.
        let regs = *t.regs_ref();
        t.as_task_inner_mut().set_regs(regs);
        Completion::Complete
    }

    /// Run the task until the deterministic signal `sig` is raised as the
    /// side effect of retiring the next instruction.
    fn emulate_deterministic_signal(
        &self,
        t: &mut ReplayTask,
        sig: i32,
        constraints: &StepConstraints,
    ) -> Completion {
        loop {
            if constraints.is_singlestep() {
                t.resume_execution(
                    ResumeRequest::ResumeSinglestep,
                    WaitRequest::ResumeWait,
                    TicksRequest::ResumeUnlimitedTicks,
                    None,
                );
            } else {
                t.resume_execution(
                    ResumeRequest::ResumeCont,
                    WaitRequest::ResumeWait,
                    TicksRequest::ResumeUnlimitedTicks,
                    None,
                );
            }

            match t.maybe_stop_sig() {
                Some(s) if s.as_raw() == sig => break,
                Some(s) if Self::is_ignored_signal(Some(s)) => continue,
                Some(s) if s == crate::sig::SIGTRAP => {
                    // User breakpoint or singlestep completion.
                    return Completion::Incomplete;
                }
                Some(s) => {
                    ed_assert!(
                        t,
                        false,
                        "Replay got unrecorded signal {} while awaiting signal {}",
                        s,
                        sig
                    );
                }
                None => {
                    if t.status().exit_code().is_some() {
                        fatal!("Tracee exited while waiting for deterministic signal");
                    }
                    if constraints.is_singlestep() {
                        return Completion::Incomplete;
                    }
                }
            }
        }

        // Verify the deterministic signal carries the recorded details:
        // matching si_addr is what ties the fault to the same instruction.
        let recorded = self.last_siginfo_.get();
        let live = t.get_siginfo();
        if recorded.si_signo != 0 {
            ed_assert!(
                t,
                live.si_signo == recorded.si_signo,
                "deterministic signal number mismatch"
            );
        }
        Completion::Complete
    }

    /// Advance until `ticks` have been retired and the recorded $ip is
    /// reached. The combination disambiguates repeated executions of the
    /// same instruction.
    fn emulate_async_signal(
        &self,
        t: &mut ReplayTask,
        constraints: &StepConstraints,
        _sig: i32,
        target_ticks: Ticks,
    ) -> Completion {
        let frame_regs = *self.current_trace_frame().regs_ref();
        let target_ip = frame_regs.ip();

        loop {
            let now = t.tick_count();
            if now > target_ticks {
                ed_assert!(
                    t,
                    false,
                    "Replay overshot target ticks: {} > {}",
                    now,
                    target_ticks
                );
            }

            let remaining = target_ticks - now;
            if remaining > PerfCounters::skid_size() {
                // Run full speed with the counter programmed to interrupt
                // before the target, staying outside the skid window.
                let period = remaining - PerfCounters::skid_size();
                t.resume_execution(
                    ResumeRequest::ResumeCont,
                    WaitRequest::ResumeWait,
                    TicksRequest::ResumeWithTicksRequest(period),
                    None,
                );
                match t.maybe_stop_sig() {
                    Some(s) if s == TIME_SLICE_SIGNAL => continue,
                    Some(s) if Self::is_ignored_signal(Some(s)) => continue,
                    Some(s) if s == crate::sig::SIGTRAP => return Completion::Incomplete,
                    Some(s) => {
                        ed_assert!(t, false, "Unexpected signal {} while advancing ticks", s)
                    }
                    None => continue,
                }
            }

            // Inside the skid window: single-step to the exact (ticks, ip)
            // pair.
            if now == target_ticks && t.ip() == target_ip {
                return Completion::Complete;
            }

            if constraints.command == RunCommand::SinglestepFastForward {
                self.did_fast_forward.set(true);
            }
            t.resume_execution(
                ResumeRequest::ResumeSinglestep,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeUnlimitedTicks,
                None,
            );
            if let Some(s) = t.maybe_stop_sig() {
                if s == crate::sig::SIGTRAP {
                    let reasons = t.compute_trap_reasons();
                    if !reasons.singlestep && reasons.breakpoint {
                        // User breakpoint exactly at the target window; the
                        // target counts as met, and the breakpoint is
                        // reported.
                        return Completion::Incomplete;
                    }
                } else if !Self::is_ignored_signal(Some(s)) {
                    ed_assert!(t, false, "Unexpected signal {} while single-stepping", s);
                }
            }
            if t.status().exit_code().is_some() {
                fatal!("Tracee exited while advancing to async signal target");
            }
        }
    }

    /// Deliver the recorded signal: for handled signals the kernel transfers
    /// control to the handler frame recorded in the next frame's registers;
    /// we inject the signal at resume.
    fn deliver_signal(&self, t: &mut ReplayTask, signo: i32) -> Completion {
        let sig = match Sig::try_from(signo) {
            Ok(s) => s,
            Err(_) => {
                ed_assert!(t, false, "Bad signal number {} in delivery frame", signo);
                unreachable!()
            }
        };

        // The frame's registers describe the state after delivery: for a
        // handler, the handler entry; for a fatal signal, the final state.
        t.resume_execution(
            ResumeRequest::ResumeSinglestep,
            WaitRequest::ResumeWait,
            TicksRequest::ResumeUnlimitedTicks,
            Some(sig),
        );

        let frame = self.current_trace_frame();
        t.set_regs_from_trace(frame.regs_ref());
        Completion::Complete
    }

    /// Transcribed records were placed in the ring by
    /// prepare_syscallbuf_records; now run the tracee's hook code over them
    /// until it reaches the end-of-flush stop.
    fn flush_syscallbuf(&self, t: &mut ReplayTask, constraints: &StepConstraints) -> Completion {
        let stop_addr = RemoteCodePtr::new(self.current_step.get().flush().stop_breakpoint_addr);
        let vm = t.vm();
        vm.add_breakpoint(
            &*t,
            stop_addr,
            crate::session::address_space::BreakpointType::BkptInternal,
        );

        let completion = loop {
            t.resume_execution(
                ResumeRequest::ResumeCont,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeUnlimitedTicks,
                None,
            );
            match t.maybe_stop_sig() {
                Some(s) if s == crate::sig::SIGTRAP => {
                    let retired_ip = t.ip().decrement_by_bytes(1);
                    if retired_ip == stop_addr {
                        t.move_ip_before_breakpoint();
                        break Completion::Complete;
                    }
                    // Another breakpoint: the user's. Report out.
                    break Completion::Incomplete;
                }
                Some(s) if Self::is_ignored_signal(Some(s)) => continue,
                Some(s) => {
                    ed_assert!(t, false, "Signal {} while flushing syscallbuf", s);
                }
                None => {
                    if t.status().exit_code().is_some() {
                        fatal!("Tracee exited during syscallbuf flush");
                    }
                }
            }
            let _ = constraints;
        };

        vm.remove_breakpoint(
            &*t,
            stop_addr,
            crate::session::address_space::BreakpointType::BkptInternal,
        );
        completion
    }

    /// Apply the monkeypatch at the syscall the tracee is entering, then
    /// resume from the patch.
    fn patch_next_syscall(&self, t: &mut ReplayTask) -> Completion {
        // Advance to the syscall entry that was patched during recording.
        if self.enter_syscall(t, &StepConstraints::new(RunCommand::Continue))
            == Completion::Incomplete
        {
            return Completion::Incomplete;
        }

        let frame = self.current_trace_frame();
        let syscall_start = frame
            .regs_ref()
            .ip()
            .decrement_by_bytes(t.as_task_inner().syscall_instruction_length());
        drop(frame);

        let mut patcher = crate::monkey_patcher::MonkeyPatcher::new();
        // During replay the hook table lives in the tracee where the preload
        // published it at init; the recorded register file points us at the
        // patch site and the rewrite is content-derived.
        if !patcher.apply_patch_at(t, syscall_start) {
            log!(
                LogDebug,
                "patch at {} not re-derivable; relying on recorded memory write",
                syscall_start
            );
        }

        let frame = self.current_trace_frame();
        t.set_regs_from_trace(frame.regs_ref());
        Completion::Complete
    }

    /// Let the task reach its final exit stop and destroy it.
    fn exit_task(&self, t: &mut ReplayTask) -> Completion {
        loop {
            t.resume_execution(
                ResumeRequest::ResumeCont,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeNoTicks,
                None,
            );
            if t.status().is_ptrace_exit_event() {
                // Run to the real exit.
                t.resume_execution(
                    ResumeRequest::ResumeCont,
                    WaitRequest::ResumeWait,
                    TicksRequest::ResumeNoTicks,
                    None,
                );
            }
            if t.status().exit_code().is_some() || t.status().fatal_sig().is_some() {
                break;
            }
        }
        let rec_tid = t.rec_tid;
        self.on_destroy_task(rec_tid);
        Completion::Complete
    }

    // --- Syscallbuf helpers ----------------------------------------------

    /// Replay-side counterpart of the recorder's rtcall processing: map the
    /// ring at init_buffers, adopt the globals block at init_preload, and
    /// set `in_replay` so the preload's conditional-move paths activate.
    fn process_rtcall_during_replay(&self, t: &mut ReplayTask, rtcall: i32) {
        use crate::auto_remote_syscalls::AutoRemoteSyscalls;
        use crate::preload_interface::{
            preload_globals, rtcall_init_buffers_params, rtcall_init_preload_params,
            SYSCALLBUF_BUFFER_SIZE,
        };
        use nix::sys::mman::{MapFlags, ProtFlags};

        if rtcall == crate::preload_interface::SYS_rtcall_init_preload {
            let params_ptr =
                RemotePtr::<rtcall_init_preload_params>::new(t.regs_ref().arg1());
            let params = read_val_mem(&*t, params_ptr);
            t.as_task_inner_mut().preload_globals_child =
                RemotePtr::<preload_globals>::new(params.globals as usize);
            // Flip the in_replay byte; it is the first field.
            crate::session::task::write_mem(
                &*t,
                RemotePtr::cast(t.as_task_inner().preload_globals_child),
                &[1u8],
            );
            t.vm().at_preload_init(params.syscallbuf_enabled != 0);
        } else {
            let params_ptr =
                RemotePtr::<rtcall_init_buffers_params>::new(t.regs_ref().arg1());
            let mut params = read_val_mem(&*t, params_ptr);
            let child_map_addr = {
                let mut remote = AutoRemoteSyscalls::new(t);
                remote.infallible_mmap_syscall(
                    RemotePtr::null(),
                    SYSCALLBUF_BUFFER_SIZE,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_ANONYMOUS | MapFlags::MAP_SHARED,
                    -1,
                    0,
                )
            };
            t.as_task_inner_mut().syscallbuf_child = RemotePtr::cast(child_map_addr);
            t.as_task_inner_mut().syscallbuf_size = SYSCALLBUF_BUFFER_SIZE;
            params.syscallbuf_ptr = child_map_addr.as_usize() as u64;
            crate::session::task::write_val_mem(&*t, params_ptr, &params);
        }

        // Skip the kernel's view of the rtcall and hand back success.
        t.as_task_inner_mut().advance_syscall();
        let mut regs = *t.regs_ref();
        regs.set_syscall_result(0);
        t.as_task_inner_mut().set_regs(regs);
    }

    /// Transcribe the flushed records from the trace back into the live
    /// ring buffer. The flush frame's raw data covers the header and the
    /// record bytes.
    fn prepare_syscallbuf_records(&self, t: &mut ReplayTask) {
        let mut trace_in = self.trace_in.borrow_mut();
        t.apply_all_data_records_from_trace(&mut trace_in);
        log!(
            LogDebug,
            "Prepared syscallbuf records for replay in task {}",
            t.rec_tid
        );
    }

    /// The end-of-flush stop: the traced-syscall entry in the engine page.
    /// The preload's flush epilogue issues a traced no-op syscall there
    /// during replay, which makes a reliable address for an internal
    /// breakpoint.
    fn flush_stop_breakpoint_addr(&self, t: &ReplayTask) -> usize {
        t.vm().traced_syscall_ip().as_usize()
    }

    fn reset_syscallbuf(&self, t: &mut ReplayTask) {
        if t.syscallbuf_child.is_null() {
            return;
        }
        let num_rec_bytes_addr =
            RemotePtr::<u32>::cast(RemotePtr::<u8>::cast(t.syscallbuf_child));
        let num_rec_bytes = read_val_mem(&*t, num_rec_bytes_addr);
        let zeros = vec![0u8; num_rec_bytes as usize];
        let records_start = RemotePtr::<u8>::cast(t.syscallbuf_child) + size_of::<syscallbuf_hdr>();
        crate::session::task::write_mem(&*t, records_start, &zeros);
        crate::session::task::write_val_mem(&*t, num_rec_bytes_addr, &0u32);
    }

    fn process_grow_map(&self, t: &mut ReplayTask) {
        let mut data = crate::trace::trace_stream::MappedData {
            time: 0,
            source: crate::trace::trace_stream::MappedDataSource::SourceZero,
            filename: OsString::new(),
            data_offset_bytes: 0,
            file_size_bytes: 0,
        };
        let km = self
            .trace_in
            .borrow_mut()
            .read_mapped_region(&mut data)
            .unwrap_or_else(|| fatal!("GrowMap frame without a mapping record"));
        t.vm().map(
            km.start(),
            km.size(),
            km.prot(),
            km.flags(),
            km.file_offset_bytes(),
            km.fsname(),
            km.device(),
            km.inode(),
            None,
            None,
        );
    }

    fn check_approaching_ticks_target(
        &self,
        t: &ReplayTask,
        constraints: &StepConstraints,
        break_status: &mut BreakStatus,
    ) {
        if constraints.ticks_target > 0 {
            let ticks_left = constraints.ticks_target.saturating_sub(t.tick_count());
            if ticks_left <= PerfCounters::skid_size() {
                break_status.approaching_ticks_target = true;
            }
        }
    }
}

impl Session for ReplaySession {
    fn as_session_inner(&self) -> &SessionInner {
        &self.session_inner
    }

    fn as_replay(&self) -> Option<&ReplaySession> {
        Some(self)
    }

    fn new_task(
        &self,
        tid: pid_t,
        rec_tid: pid_t,
        serial: u32,
        arch: SupportedArch,
    ) -> Box<dyn Task> {
        let weak = self.session_inner.weak_self.borrow().clone();
        Box::new(ReplayTask::new(weak, tid, rec_tid, serial, arch))
    }
}

/// Duplicate a stopped tracee by remote fork; returns the child's tid. The
/// child inherits the exact memory image and registers of the stop.
fn fork_task_into(inner: &mut TaskInner) -> pid_t {
    use crate::auto_remote_syscalls::AutoRemoteSyscalls;
    use crate::kernel_abi::x64_syscall;

    // A shim wrapper so AutoRemoteSyscalls sees a &mut dyn Task.
    struct Shim<'a>(&'a mut TaskInner);
    impl<'a> Task for Shim<'a> {
        fn as_task_inner(&self) -> &TaskInner {
            self.0
        }
        fn as_task_inner_mut(&mut self) -> &mut TaskInner {
            self.0
        }
    }

    let mut shim = Shim(inner);
    let mut remote = AutoRemoteSyscalls::new(&mut shim);
    let ret = remote.infallible_syscall(x64_syscall::FORK, &[]);
    let child_tid = ret as pid_t;
    drop(remote);
    // The child starts out stopped by the fork ptrace event machinery.
    let mut raw_status: i32 = 0;
    unsafe { libc::waitpid(child_tid, &mut raw_status, libc::__WALL) };
    child_tid
}

fn treat_signal_event_as_deterministic(ev: &SignalEventData) -> bool {
    ev.deterministic == SignalDeterministic::DeterministicSig && ev.siginfo.si_signo != libc::SIGBUS
}

/// Offset of abort_commit in syscallbuf_hdr.
fn memoffset_abort_commit() -> usize {
    // num_rec_bytes: u32 comes first.
    size_of::<u32>()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn step_key_ordering() {
        let none = ReplayStepKey::new();
        let enter = ReplayStepKey::new_with(ReplayTraceStepType::TstepEnterSyscall);
        let retire = ReplayStepKey::new_with(ReplayTraceStepType::TstepRetire);
        assert!(!none.in_execution());
        assert!(enter.in_execution());
        assert!(none < enter);
        assert!(enter < retire);
    }

    #[test]
    fn step_accessors_match_variant() {
        let step = ReplayTraceStep {
            action: ReplayTraceStepType::TstepEnterSyscall,
            data: ReplayTraceStepData::Syscall(ReplayTraceStepSyscall {
                arch: SupportedArch::X64,
                number: 0,
            }),
        };
        assert_eq!(0, step.syscall().number);

        let target = ReplayTraceStep {
            action: ReplayTraceStepType::TstepProgramAsyncSignalInterrupt,
            data: ReplayTraceStepData::Target(ReplayTraceStepTarget {
                ticks: 1000,
                signo: 0,
            }),
        };
        assert_eq!(1000, target.target().ticks);
    }

    #[test]
    fn ignored_signals() {
        assert!(ReplaySession::is_ignored_signal(Some(TIME_SLICE_SIGNAL)));
        assert!(ReplaySession::is_ignored_signal(
            Sig::try_from(SYSCALLBUF_DESCHED_SIGNAL).ok()
        ));
        assert!(!ReplaySession::is_ignored_signal(Some(crate::sig::SIGSEGV)));
        assert!(!ReplaySession::is_ignored_signal(None));
    }

    #[test]
    fn deterministic_signal_classification() {
        let mut siginfo: libc::siginfo_t = unsafe { std::mem::zeroed() };
        siginfo.si_signo = libc::SIGSEGV;
        let det = SignalEventData::new(&siginfo, SignalDeterministic::DeterministicSig);
        assert!(treat_signal_event_as_deterministic(&det));

        // SIGBUS determinism depends on external file state; treated as
        // async.
        siginfo.si_signo = libc::SIGBUS;
        let bus = SignalEventData::new(&siginfo, SignalDeterministic::DeterministicSig);
        assert!(!treat_signal_event_as_deterministic(&bus));
    }
}
