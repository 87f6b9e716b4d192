//! The recorder: runs tracees under ptrace supervision, captures every
//! source of non-determinism they observe, and persists it to the trace.

use crate::{
    auto_remote_syscalls::AutoRemoteSyscalls,
    bindings::ptrace::{
        PTRACE_EVENT_CLONE, PTRACE_EVENT_EXEC, PTRACE_EVENT_EXIT, PTRACE_EVENT_FORK,
        PTRACE_EVENT_SECCOMP, PTRACE_EVENT_VFORK,
    },
    event::{
        Event, EventType, SignalDeterministic, SignalEventData, SyscallEventData, SyscallState,
        SyscallbufFlushEventData, Switchable,
    },
    kernel_abi::{
        is_clone_syscall, is_exit_group_syscall, is_exit_syscall, is_fork_syscall,
        is_sched_yield_syscall, SupportedArch,
    },
    log::LogLevel::{LogDebug, LogWarn},
    monkey_patcher::MonkeyPatcher,
    perf_counters::TIME_SLICE_SIGNAL,
    preload_interface::{
        preload_globals, rtcall_init_buffers_params, rtcall_init_preload_params,
        syscall_patch_hook, syscallbuf_hdr, SYSCALLBUF_BUFFER_SIZE, SYSCALLBUF_DESCHED_SIGNAL,
        SYS_rtcall_init_buffers, SYS_rtcall_init_preload,
    },
    remote_ptr::{RemotePtr, Void},
    scheduler::Scheduler,
    session::{
        make_shared_session,
        session_inner::SessionInner,
        task::{
            read_mem, read_val_mem, record_task::RecordTask, task_inner::ResumeRequest,
            task_inner::TaskInner, task_inner::TicksRequest, task_inner::WaitRequest, write_val_mem,
            Task, TaskSharedPtr,
        },
        Session, SessionSharedPtr,
    },
    sig::Sig,
    trace::{
        trace_frame::TraceFrame,
        trace_task_event::TraceTaskEvent,
        trace_writer::{CloseStatus, TraceWriter},
    },
    util::monotonic_now_sec,
    wait_status::WaitType,
};
use libc::pid_t;
use nix::sys::mman::{MapFlags, ProtFlags};
use std::{
    cell::{Cell, RefCell, RefMut},
    ffi::{OsStr, OsString},
    mem::size_of,
    rc::Rc,
};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RecordStatus {
    /// Some execution was recorded. record_step() can be called again.
    StepContinue,
    /// All tracees are dead. record_step() should not be called again.
    StepExited,
    /// Initial exec of the tracee failed.
    StepSpawnFailed,
}

pub struct RecordResult {
    pub status: RecordStatus,
    /// When status == StepExited: the leader's exit status.
    pub exit_status: i32,
}

pub struct RecordSession {
    session_inner: SessionInner,
    trace_out: RefCell<TraceWriter>,
    scheduler_: RefCell<Scheduler>,
    monkey_patcher: RefCell<MonkeyPatcher>,
    /// The Switchable returned by the last event-processing step; it
    /// constrains the next scheduling decision.
    last_task_switchable: Cell<Switchable>,
    syscallbuf_enabled: bool,
}

impl RecordSession {
    /// Create a recording session that spawns `exe` with `argv`/`envp` and
    /// begins supervising it.
    pub fn create(
        exe: &OsStr,
        argv: &[OsString],
        envp: &[OsString],
        output_trace_dir: Option<&OsStr>,
        bind_to_cpu: Option<u32>,
        max_ticks: u64,
        always_switch: bool,
        chaos: bool,
        syscallbuf_enabled: bool,
    ) -> SessionSharedPtr {
        let trace_out = TraceWriter::new(exe, output_trace_dir, bind_to_cpu);
        let cwd = std::env::current_dir()
            .map(|p| p.into_os_string())
            .unwrap_or_else(|_| OsString::from("/"));
        trace_out.write_args_env(&cwd, argv, envp);

        let mut scheduler = Scheduler::new(max_ticks);
        scheduler.set_always_switch(always_switch);
        scheduler.set_enable_chaos(chaos);

        let session = RecordSession {
            session_inner: SessionInner::new(),
            trace_out: RefCell::new(trace_out),
            scheduler_: RefCell::new(scheduler),
            monkey_patcher: RefCell::new(MonkeyPatcher::new()),
            last_task_switchable: Cell::new(Switchable::PreventSwitch),
            syscallbuf_enabled,
        };
        let rc = make_shared_session(Box::new(session));

        let tid = TaskInner::spawn_tracee(exe, argv, envp);
        let t: Box<dyn Task> = rc.new_task(
            tid,
            tid,
            rc.as_session_inner().next_task_serial(),
            SupportedArch::default(),
        );
        let t_shared: TaskSharedPtr = Rc::new(RefCell::new(t));
        {
            let mut tb = t_shared.borrow_mut();
            let vm = rc.as_session_inner().create_vm(&**tb, Some(exe));
            tb.as_task_inner_mut().set_vm(vm);
            let tg = rc.as_session_inner().create_initial_tg(tid, tid, 0);
            tb.as_task_inner_mut().set_thread_group(tg);
        }
        rc.on_create_task(t_shared);
        rc.as_record()
            .unwrap()
            .scheduler_mut()
            .on_create(tid, 0);
        rc
    }

    pub fn trace_writer(&self) -> RefMut<'_, TraceWriter> {
        self.trace_out.borrow_mut()
    }

    pub fn scheduler_mut(&self) -> RefMut<'_, Scheduler> {
        self.scheduler_.borrow_mut()
    }

    pub fn syscallbuf_enabled(&self) -> bool {
        self.syscallbuf_enabled
    }

    /// Take a single recording step: schedule a tracee, advance it to its
    /// next ptrace-observable event, turn that into an Event and write the
    /// frame.
    pub fn record_step(&self) -> RecordResult {
        let mut result = RecordResult {
            status: RecordStatus::StepContinue,
            exit_status: 0,
        };

        let rescheduled = self
            .scheduler_
            .borrow_mut()
            .reschedule(self_as_session(self), self.last_task_switchable.get());
        if rescheduled.interrupted_by_signal {
            result.status = RecordStatus::StepExited;
            return result;
        }
        let tid = match rescheduled.tid {
            Some(tid) => tid,
            None => {
                result.status = RecordStatus::StepExited;
                return result;
            }
        };

        let t_shared = match self.find_task_from_rec_tid(tid) {
            Some(t) => t,
            None => {
                result.status = RecordStatus::StepExited;
                return result;
            }
        };
        let mut task = t_shared.borrow_mut();

        if !rescheduled.by_waitpid {
            // The task is in a stop we've already consumed; resume it with
            // the scheduler's timeslice programmed into the ticks counter.
            let timeslice_end = self.scheduler_.borrow().current_timeslice_end();
            let now_ticks = task.tick_count();
            let period = timeslice_end.saturating_sub(now_ticks);
            task.as_task_inner_mut().resume_execution(
                ResumeRequest::ResumeCont,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeWithTicksRequest(std::cmp::max(1, period)),
                None,
            );
        }

        self.process_stop(&mut *task, &mut result);
        result
    }

    /// Flush the current state and write the termination marker: recording
    /// was ended by a signal to the supervisor.
    pub fn terminate_recording(&self) {
        self.maybe_flush_all_syscallbufs();
        let time = self.trace_out.borrow().time();
        let frame = TraceFrame::new_with(
            time,
            0,
            Event::trace_termination(),
            0,
            monotonic_now_sec(),
        );
        self.trace_out.borrow_mut().write_frame(&frame);
        self.trace_out.borrow_mut().close(CloseStatus::CloseOk);
    }

    pub fn close_trace(&self, status: CloseStatus) {
        self.trace_out.borrow_mut().close(status);
    }

    // --- Stop dispatch ----------------------------------------------------

    fn process_stop(&self, task: &mut Box<dyn Task>, result: &mut RecordResult) {
        let status = task.status();
        match status.wait_type() {
            WaitType::Exit => {
                let exit_code = status.exit_code().unwrap();
                log!(LogDebug, "task {} exited with {}", task.tid(), exit_code);
                self.record_exit(task, exit_code);
                result.exit_status = exit_code;
                if self.task_count() == 0 {
                    result.status = RecordStatus::StepExited;
                }
            }
            WaitType::FatalSignal => {
                let sig = status.fatal_sig().unwrap();
                log!(LogDebug, "task {} killed by {}", task.tid(), sig);
                self.record_exit(task, 128 + sig.as_raw());
                if self.task_count() == 0 {
                    result.status = RecordStatus::StepExited;
                }
            }
            WaitType::SignalStop => {
                let sig = status.stop_sig().unwrap();
                self.handle_signal_stop(task, sig);
            }
            WaitType::GroupStop => {
                // Let the group stop proceed; nothing to record.
                self.last_task_switchable.set(Switchable::AllowSwitch);
            }
            WaitType::SyscallStop => {
                self.handle_syscall_exit_stop(task);
            }
            WaitType::PtraceEvent => {
                self.handle_ptrace_event(task);
            }
        }
    }

    fn handle_ptrace_event(&self, task: &mut Box<dyn Task>) {
        let event = task.status().ptrace_event().unwrap();
        match event {
            PTRACE_EVENT_SECCOMP => {
                // Kernel entry for a traced syscall.
                self.handle_syscall_entry(task);
            }
            PTRACE_EVENT_CLONE | PTRACE_EVENT_FORK | PTRACE_EVENT_VFORK => {
                self.handle_clone_event(task, event);
            }
            PTRACE_EVENT_EXEC => {
                self.handle_exec_event(task);
            }
            PTRACE_EVENT_EXIT => {
                // The final exit status arrives at the next stop; just let
                // the task run to it.
                let _ = task;
            }
            _ => {
                log!(LogWarn, "Unhandled ptrace event {}", event);
            }
        }
    }

    /// The task entered the kernel for a traced syscall. Record the entry
    /// frame, drive to the exit stop and record that too.
    fn handle_syscall_entry(&self, task: &mut Box<dyn Task>) {
        let arch = task.arch();
        let regs = *task.regs_ref();
        let syscallno = regs.original_syscallno() as i32;

        // The magic rtcalls configure the syscallbuf machinery and are not
        // real kernel syscalls.
        if syscallno == SYS_rtcall_init_preload {
            self.process_init_preload(task);
            return;
        }
        if syscallno == SYS_rtcall_init_buffers {
            self.process_init_buffers(task);
            return;
        }

        // A buffered-syscall overflow fallback or any unbuffered syscall
        // flushes the ring first so frame order matches execution order.
        self.maybe_flush_syscallbuf(task);

        // A patchable call site gets rewritten now: the syscall is aborted,
        // a PatchSyscall frame is recorded, and execution resumes at the
        // patch so the next execution takes the buffered path.
        if task.vm().syscallbuf_enabled()
            && self.monkey_patcher.borrow().has_hooks()
            && self.try_patch_and_abort_syscall(task)
        {
            return;
        }

        let mut sys_ev = SyscallEventData::new(syscallno, arch);
        sys_ev.state = SyscallState::EnteringSyscall;
        sys_ev.regs = regs;
        let switchable = syscall_switchable(syscallno, arch);
        sys_ev.switchable = switchable;

        {
            let rt = task.as_record_task_mut().unwrap();
            rt.push_event(Event::new_syscall_event(sys_ev.clone()));
        }
        self.record_event_with_regs(task, Event::new_syscall_event(sys_ev), &regs);

        if is_sched_yield_syscall(syscallno, arch) {
            let (tid, priority) = {
                let rt = task.as_record_task().unwrap();
                (rt.rec_tid, rt.priority)
            };
            self.scheduler_
                .borrow_mut()
                .schedule_one_round_robin(tid, priority);
        }

        if is_exit_syscall(syscallno, arch) || is_exit_group_syscall(syscallno, arch) {
            // There will be no syscall exit stop; the next stop is the exit
            // event.
            self.last_task_switchable.set(Switchable::AllowSwitch);
            task.as_record_task_mut()
                .unwrap()
                .pop_event(EventType::EvSyscall);
            return;
        }

        // Drive to the syscall-exit stop. For may-block syscalls this can
        // block, so a deschedule would leave us stuck; those syscalls run on
        // the buffered path instead, and the unbuffered ones that block are
        // allowed to switch after entry.
        match switchable {
            Switchable::PreventSwitch => {
                task.as_task_inner_mut().advance_syscall();
                self.handle_syscall_exit_stop(task);
            }
            Switchable::AllowSwitch => {
                // Resume towards the exit but let the scheduler take over
                // if the kernel blocks us.
                task.as_task_inner_mut().resume_execution(
                    ResumeRequest::ResumeSyscall,
                    WaitRequest::ResumeNonblocking,
                    TicksRequest::ResumeUnlimitedTicks,
                    None,
                );
                self.last_task_switchable.set(Switchable::AllowSwitch);
            }
        }
    }

    /// The task reached a syscall-exit stop: complete the pending syscall
    /// event.
    fn handle_syscall_exit_stop(&self, task: &mut Box<dyn Task>) {
        let arch = task.arch();
        let regs = *task.regs_ref();

        let (syscallno, had_event) = {
            let rt = task.as_record_task_mut().unwrap();
            if rt.ev().is_syscall_event() {
                (rt.ev().syscall_event().number, true)
            } else {
                (regs.original_syscallno() as i32, false)
            }
        };

        if !had_event {
            // An exit stop without a recorded entry: this happens for the
            // syscall the seccomp filter admitted before our entry handling
            // began (e.g. during early process startup).
            let mut sys_ev = SyscallEventData::new(syscallno, arch);
            sys_ev.state = SyscallState::EnteringSyscall;
            sys_ev.regs = regs;
            task.as_record_task_mut()
                .unwrap()
                .push_event(Event::new_syscall_event(sys_ev));
        }

        // Record any memory the kernel wrote through tracked pointers: the
        // generic capture reads the result registers only; syscalls with
        // outparams were either buffered (their data travels in the flush)
        // or captured by their own handlers here.
        self.record_syscall_memory_effects(task, syscallno, &regs);

        let mut sys_ev = SyscallEventData::new(syscallno, arch);
        sys_ev.state = SyscallState::ExitingSyscall;
        sys_ev.regs = regs;
        {
            let rt = task.as_record_task_mut().unwrap();
            rt.pop_event(EventType::EvSyscall);
        }
        self.record_event_with_regs(task, Event::new_syscall_event(sys_ev), &regs);
        self.last_task_switchable.set(Switchable::PreventSwitch);

        // Bookkeeping for address-space-shaping syscalls.
        self.update_vm_for_syscall(task, syscallno, &regs);
    }

    fn handle_signal_stop(&self, task: &mut Box<dyn Task>, sig: Sig) {
        if sig == TIME_SLICE_SIGNAL {
            // Asynchronous scheduling boundary: record a Sched frame at the
            // interrupted (ticks, ip) pair.
            self.maybe_flush_syscallbuf(task);
            let regs = *task.regs_ref();
            self.record_event_with_regs(task, Event::sched(), &regs);
            self.scheduler_.borrow_mut().expire_timeslice();
            self.last_task_switchable.set(Switchable::AllowSwitch);
            return;
        }

        if sig.as_raw() == SYSCALLBUF_DESCHED_SIGNAL {
            self.handle_desched_signal(task);
            return;
        }

        // A real signal for the tracee: the three-phase lifecycle starts
        // with a Signal frame carrying the full siginfo.
        let siginfo = task.get_siginfo();
        let deterministic = classify_signal_determinism(&siginfo);
        self.maybe_flush_syscallbuf(task);

        let regs = *task.regs_ref();
        let ev = Event::new_signal_event(
            EventType::EvSignal,
            task.arch(),
            SignalEventData::new(&siginfo, deterministic),
        );
        self.record_event_with_regs(task, ev, &regs);

        // Deliver it: resume with the signal injected; the next stop shows
        // the handler frame or the fatal teardown, recorded as the
        // SignalDelivery phase.
        task.as_task_inner_mut().resume_execution(
            ResumeRequest::ResumeSinglestep,
            WaitRequest::ResumeWait,
            TicksRequest::ResumeUnlimitedTicks,
            Some(sig),
        );
        let regs = *task.regs_ref();
        let ev = Event::new_signal_event(
            EventType::EvSignalDelivery,
            task.arch(),
            SignalEventData::new(&siginfo, deterministic),
        );
        self.record_event_with_regs(task, ev, &regs);
        self.last_task_switchable.set(Switchable::AllowSwitch);
    }

    /// The desched counter fired: a may-block buffered syscall blocked in
    /// the kernel. Record the Desched breadcrumb and advance the tracee to
    /// where the counter is disarmed.
    fn handle_desched_signal(&self, task: &mut Box<dyn Task>) {
        let syscallbuf_child = task.as_task_inner().syscallbuf_child;
        if syscallbuf_child.is_null() {
            // Spurious: the signal can race with buffer teardown.
            return;
        }

        let desched_relevant_addr = RemotePtr::<u8>::cast(syscallbuf_child)
            + offset_of_desched_signal_may_be_relevant();
        let relevant = read_mem(&**task, desched_relevant_addr, 1)[0];
        if relevant == 0 {
            // The tracee already cleared the flag: the syscall committed
            // before the signal was delivered. Safe to discard.
            log!(LogDebug, "discarding stale desched signal");
            return;
        }

        log!(LogDebug, "desched: task {} blocked in buffered syscall", task.tid());
        {
            let rt = task.as_record_task_mut().unwrap();
            rt.in_desched = true;
        }

        // The interrupted record is the in-progress (uncommitted) one at
        // the end of the ring.
        self.maybe_flush_syscallbuf(task);

        // Treat the interruption as a syscall interruption so the blocked
        // call is re-entered on restart, and let another task run; that is
        // the whole point of the desched escape hatch.
        self.last_task_switchable.set(Switchable::AllowSwitch);
        self.scheduler_.borrow_mut().expire_timeslice();
    }

    fn handle_clone_event(&self, task: &mut Box<dyn Task>, event: u32) {
        let new_tid = unsafe {
            let mut msg: libc::c_ulong = 0;
            libc::ptrace(
                libc::PTRACE_GETEVENTMSG,
                task.tid(),
                std::ptr::null_mut::<u8>(),
                &mut msg as *mut libc::c_ulong,
            );
            msg as pid_t
        };

        let rc = self.session();
        let new_task: Box<dyn Task> = rc.new_task(
            new_tid,
            new_tid,
            rc.as_session_inner().next_task_serial(),
            task.arch(),
        );
        let new_shared: TaskSharedPtr = Rc::new(RefCell::new(new_task));
        {
            let mut nb = new_shared.borrow_mut();
            if event == PTRACE_EVENT_CLONE {
                // Threads share the address space.
                nb.as_task_inner_mut().set_vm(task.vm());
                nb.as_task_inner_mut()
                    .set_thread_group(task.as_task_inner().thread_group());
                task.vm().insert_task(&**nb);
                self.trace_out.borrow_mut().write_task_event(
                    &TraceTaskEvent::for_clone(new_tid, task.rec_tid(), 0),
                );
            } else {
                let vm = rc.as_session_inner().clone_vm(
                    new_tid,
                    nb.tuid().serial(),
                    0,
                    &task.vm(),
                );
                nb.as_task_inner_mut().set_vm(vm);
                let tg = rc.as_session_inner().create_initial_tg(
                    new_tid,
                    new_tid,
                    nb.tuid().serial(),
                );
                nb.as_task_inner_mut().set_thread_group(tg);
                self.trace_out
                    .borrow_mut()
                    .write_task_event(&TraceTaskEvent::for_fork(new_tid, task.rec_tid()));
            }
            // The child inherits a copy-on-write view of the parent's
            // syscallbuf; its preload hook re-inits its own ring.
            nb.as_task_inner_mut().preload_globals_child =
                task.as_task_inner().preload_globals_child;
        }
        rc.on_create_task(new_shared);
        self.scheduler_.borrow_mut().on_create(new_tid, 0);
        self.last_task_switchable.set(Switchable::AllowSwitch);
    }

    fn handle_exec_event(&self, task: &mut Box<dyn Task>) {
        // On exec the task set of the old address space reduces to this
        // task and the old space dies.
        let old_vm = task.vm();
        old_vm.erase_task(task.rec_tid());

        let rc = self.session();
        let exe = OsString::from("");
        let vm = rc.as_session_inner().create_vm(&**task, Some(&exe));
        task.as_task_inner_mut().set_vm(vm);
        task.as_task_inner_mut().post_exec_mem_fd_refresh();
        task.as_task_inner_mut().syscallbuf_child = RemotePtr::null();
        self.session_inner.set_done_initial_exec();

        self.trace_out.borrow_mut().write_task_event(&TraceTaskEvent::for_exec(
            task.rec_tid(),
            OsString::from(""),
            vec![],
        ));
        self.last_task_switchable.set(Switchable::AllowSwitch);
    }

    fn record_exit(&self, task: &mut Box<dyn Task>, exit_status: i32) {
        let regs = *task.regs_ref();
        self.record_event_with_regs(task, Event::exit(), &regs);
        self.trace_out
            .borrow_mut()
            .write_task_event(&TraceTaskEvent::for_exit(task.rec_tid(), exit_status));

        let (tid, priority) = {
            let rt = task.as_record_task().unwrap();
            (rt.rec_tid, rt.priority)
        };
        self.scheduler_.borrow_mut().on_destroy(tid, priority);
        task.vm().erase_task(tid);
        self.on_destroy_task(tid);
    }

    /// Rewrite the syscall instruction the task just entered to call into
    /// the preload hook. On success the in-kernel syscall is aborted and
    /// the task resumes at the patch.
    fn try_patch_and_abort_syscall(&self, task: &mut Box<dyn Task>) -> bool {
        let patched = self.monkey_patcher.borrow_mut().try_patch_syscall(&mut **task);
        if !patched {
            return false;
        }

        let insn_len = task.as_task_inner().syscall_instruction_length();
        let resume_ip = task.ip().decrement_by_bytes(insn_len);

        // Abort the entered syscall: give the kernel a nonexistent number,
        // let it fail out, then point execution at the patch.
        let mut regs = *task.regs_ref();
        regs.set_original_syscallno(-1);
        task.as_task_inner_mut().set_regs(regs);
        task.as_task_inner_mut().advance_syscall();

        let mut regs = *task.regs_ref();
        regs.set_ip(resume_ip);
        task.as_task_inner_mut().set_regs(regs);

        let regs = *task.regs_ref();
        self.record_event_with_regs(task, Event::patch_syscall(), &regs);
        true
    }

    // --- rtcall processing ------------------------------------------------

    /// rtcall_init_preload: the preload hands us the hook table and the
    /// addresses of the process-global communication block.
    fn process_init_preload(&self, task: &mut Box<dyn Task>) {
        let params_ptr = RemotePtr::<rtcall_init_preload_params>::new(task.regs_ref().arg1());
        let params = read_val_mem(&**task, params_ptr);

        task.as_task_inner_mut().preload_globals_child =
            RemotePtr::<preload_globals>::new(params.globals as usize);

        let mut hooks: Vec<syscall_patch_hook> = Vec::new();
        let hook_array = RemotePtr::<syscall_patch_hook>::new(params.syscall_patch_hooks as usize);
        for i in 0..params.syscall_patch_hook_count as usize {
            hooks.push(read_val_mem(&**task, hook_array + i));
        }
        self.monkey_patcher.borrow_mut().set_syscall_hooks(hooks);

        let enabled = self.syscallbuf_enabled && params.syscallbuf_enabled != 0;
        task.vm().at_preload_init(enabled);

        // Publish supervisor-side knobs into the globals block.
        if !task.as_task_inner().preload_globals_child.is_null() {
            let mut globals = preload_globals::default();
            globals.in_replay = 0;
            globals.desched_sig = SYSCALLBUF_DESCHED_SIGNAL as u8;
            globals.pretend_num_cores = self.scheduler_.borrow().pretend_num_cores() as i32;
            write_val_mem(
                &**task,
                task.as_task_inner().preload_globals_child,
                &globals,
            );
        }

        self.emulate_rtcall_result(task, 0);
        log!(LogDebug, "preload library initialized in task {}", task.tid());
    }

    /// rtcall_init_buffers: map this thread's ring buffer and adopt its
    /// desched counter fd.
    fn process_init_buffers(&self, task: &mut Box<dyn Task>) {
        let params_ptr = RemotePtr::<rtcall_init_buffers_params>::new(task.regs_ref().arg1());
        let mut params = read_val_mem(&**task, params_ptr);

        // Allocate the per-thread ring in the tracee. MAP_SHARED so our
        // /proc/<tid>/mem writes during flush transcription are coherent
        // with the tracee's own view.
        let child_map_addr = {
            let mut remote = AutoRemoteSyscalls::new(&mut **task);
            remote.infallible_mmap_syscall(
                RemotePtr::null(),
                SYSCALLBUF_BUFFER_SIZE,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_ANONYMOUS | MapFlags::MAP_SHARED,
                -1,
                0,
            )
        };

        task.as_task_inner_mut().syscallbuf_child = RemotePtr::cast(child_map_addr);
        task.as_task_inner_mut().syscallbuf_size = SYSCALLBUF_BUFFER_SIZE;
        task.as_task_inner_mut().desched_fd_child = params.desched_counter_fd;
        task.vm().map(
            child_map_addr,
            SYSCALLBUF_BUFFER_SIZE,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_ANONYMOUS | MapFlags::MAP_SHARED,
            0,
            OsStr::new(""),
            0,
            0,
            None,
            None,
        );

        params.syscallbuf_ptr = child_map_addr.as_usize() as u64;
        write_val_mem(&**task, params_ptr, &params);

        self.emulate_rtcall_result(task, 0);
        log!(
            LogDebug,
            "syscallbuf mapped at {} in task {}",
            child_map_addr,
            task.tid()
        );
    }

    /// Skip the kernel's processing of an rtcall (it would return ENOSYS)
    /// and write the result the preload expects.
    fn emulate_rtcall_result(&self, task: &mut Box<dyn Task>, result: isize) {
        task.as_task_inner_mut().advance_syscall();
        let mut regs = *task.regs_ref();
        regs.set_syscall_result_signed(result);
        task.as_task_inner_mut().set_regs(regs);
    }

    // --- Syscallbuf flushing ----------------------------------------------

    /// If the task's ring holds committed records, drain them to the trace:
    /// a SyscallbufFlush frame whose raw data carries the header and record
    /// bytes. The logical reset is recorded one frame later so replay
    /// processes the flush first.
    pub fn maybe_flush_syscallbuf(&self, task: &mut Box<dyn Task>) {
        let syscallbuf_child = task.as_task_inner().syscallbuf_child;
        if syscallbuf_child.is_null() {
            return;
        }

        let hdr_addr = RemotePtr::<syscallbuf_hdr>::cast(RemotePtr::<u8>::cast(syscallbuf_child));
        let hdr = read_val_mem(&**task, hdr_addr);
        if hdr.num_rec_bytes == 0 {
            return;
        }

        log!(
            LogDebug,
            "flushing syscallbuf of task {}: {} record bytes",
            task.tid(),
            hdr.num_rec_bytes
        );

        // Raw capture of header + records; replay transcribes these bytes
        // straight back.
        let total = size_of::<syscallbuf_hdr>() + hdr.num_rec_bytes as usize;
        let bytes = read_mem(&**task, RemotePtr::<Void>::cast(syscallbuf_child), total);
        self.trace_out.borrow_mut().write_raw(
            task.rec_tid(),
            &bytes,
            RemotePtr::<Void>::cast(syscallbuf_child),
        );

        let regs = *task.regs_ref();
        let flush_ev = Event::new_syscallbuf_flush_event(
            task.arch(),
            SyscallbufFlushEventData::new(bytes),
        );
        self.record_event_with_regs(task, flush_ev, &regs);

        // Logical reset, deferred one frame.
        {
            let rt = task.as_record_task_mut().unwrap();
            rt.delay_syscallbuf_reset = true;
        }
        let zero: u32 = 0;
        write_val_mem(
            &**task,
            RemotePtr::<u32>::cast(RemotePtr::<u8>::cast(syscallbuf_child)),
            &zero,
        );
        let regs = *task.regs_ref();
        self.record_event_with_regs(task, Event::syscallbuf_reset(), &regs);
        task.as_record_task_mut().unwrap().delay_syscallbuf_reset = false;
    }

    fn maybe_flush_all_syscallbufs(&self) {
        for t in self.task_list() {
            let mut task = t.borrow_mut();
            if task.as_task_inner().is_stopped() {
                self.maybe_flush_syscallbuf(&mut *task);
            }
        }
    }

    // --- Frame writing ----------------------------------------------------

    /// Write one trace frame for `event` with the given registers.
    pub fn record_event_with_regs(
        &self,
        task: &mut Box<dyn Task>,
        event: Event,
        regs: &crate::registers::Registers,
    ) {
        let mut trace_out = self.trace_out.borrow_mut();
        let time = trace_out.time();
        let ticks = task.tick_count();
        let mut frame = TraceFrame::new_with(
            time,
            task.rec_tid(),
            event,
            ticks,
            monotonic_now_sec(),
        );
        if frame.event().record_regs() {
            frame.set_regs(*regs);
        }
        if frame.event().record_extra_regs() {
            frame.set_extra_regs(task.as_task_inner().extra_regs_ref().clone());
        }
        trace_out.write_frame(&frame);
        task.as_task_inner()
            .ticks_at_last_recorded_frame
            .set(ticks);
    }

    // --- Memory effects ---------------------------------------------------

    /// Capture kernel-written memory for the syscalls whose outparams the
    /// unbuffered path records directly.
    fn record_syscall_memory_effects(
        &self,
        task: &mut Box<dyn Task>,
        syscallno: i32,
        regs: &crate::registers::Registers,
    ) {
        let arch = task.arch();
        if regs.syscall_failed() {
            return;
        }

        // read(fd, buf, count) -> buf holds result bytes
        if syscallno == crate::kernel_abi::syscall_number_for_read(arch) {
            let nread = regs.syscall_result_signed();
            if nread > 0 {
                let buf = RemotePtr::<Void>::new(regs.arg2());
                let data = read_mem(&**task, buf, nread as usize);
                self.trace_out.borrow_mut().write_raw(task.rec_tid(), &data, buf);
            }
        }
    }

    /// Track the address-space effects of memory-management syscalls.
    fn update_vm_for_syscall(
        &self,
        task: &mut Box<dyn Task>,
        syscallno: i32,
        regs: &crate::registers::Registers,
    ) {
        let arch = task.arch();
        if regs.syscall_failed() {
            return;
        }

        if syscallno == crate::kernel_abi::syscall_number_for_mmap(arch) {
            let addr = RemotePtr::<Void>::new(regs.syscall_result());
            let length = regs.arg2();
            let prot = ProtFlags::from_bits_truncate(regs.arg3() as i32);
            let flags = MapFlags::from_bits_truncate(regs.arg4() as i32);
            let km = task.vm().map(
                addr,
                length,
                prot,
                flags,
                0,
                OsStr::new(""),
                0,
                0,
                None,
                None,
            );
            let stat: libc::stat = unsafe { std::mem::zeroed() };
            self.trace_out.borrow_mut().write_mapped_region(
                &km,
                &stat,
                crate::trace::trace_writer::MappingOrigin::SyscallMapping,
            );
        } else if syscallno == crate::kernel_abi::syscall_number_for_munmap(arch) {
            task.vm()
                .unmap(RemotePtr::new(regs.arg1()), regs.arg2());
        } else if syscallno == crate::kernel_abi::syscall_number_for_mprotect(arch) {
            task.vm().protect(
                RemotePtr::new(regs.arg1()),
                regs.arg2(),
                ProtFlags::from_bits_truncate(regs.arg3() as i32),
            );
        } else if is_clone_syscall(syscallno, arch) || is_fork_syscall(syscallno, arch) {
            // Task bookkeeping happened at the ptrace event.
        }
    }

    fn session(&self) -> SessionSharedPtr {
        self.session_inner.weak_self.borrow().upgrade().unwrap()
    }
}

impl Session for RecordSession {
    fn as_session_inner(&self) -> &SessionInner {
        &self.session_inner
    }

    fn as_record(&self) -> Option<&RecordSession> {
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
        Box::new(RecordTask::new(weak, tid, rec_tid, serial, arch))
    }
}

fn self_as_session(s: &RecordSession) -> &dyn Session {
    s
}

/// Whether entering this syscall may block: blocking entries must allow a
/// task switch or recording deadlocks.
fn syscall_switchable(syscallno: i32, arch: SupportedArch) -> Switchable {
    use crate::kernel_abi::*;

    // Waiting and sleeping syscalls block by design; reads on arbitrary fds
    // can block; everything else defaults to PreventSwitch for simplicity
    // (after the completion is recorded, a switch is allowed anyway).
    if syscallno == syscall_number_for_read(arch)
        || syscallno == syscall_number_for_futex(arch)
        || syscallno == per_arch_poll(arch)
        || syscallno == per_arch_wait4(arch)
    {
        Switchable::AllowSwitch
    } else {
        Switchable::PreventSwitch
    }
}

fn per_arch_poll(arch: SupportedArch) -> i32 {
    match arch {
        SupportedArch::X86 => crate::kernel_abi::x86_syscall::POLL,
        SupportedArch::X64 => crate::kernel_abi::x64_syscall::POLL,
    }
}

fn per_arch_wait4(arch: SupportedArch) -> i32 {
    match arch {
        SupportedArch::X86 => crate::kernel_abi::x86_syscall::WAIT4,
        SupportedArch::X64 => crate::kernel_abi::x64_syscall::WAIT4,
    }
}

fn offset_of_desched_signal_may_be_relevant() -> usize {
    // num_rec_bytes(4) + abort_commit(1) + notify_on_syscall_hook_exit(1) +
    // locked(1)
    4 + 1 + 1 + 1
}

fn classify_signal_determinism(si: &libc::siginfo_t) -> SignalDeterministic {
    // Deterministic signals are those raised as a side effect of retiring a
    // specific instruction: illegal opcode, divide by zero, faulting memory
    // access, software interrupt.
    match si.si_signo {
        libc::SIGILL | libc::SIGFPE | libc::SIGSEGV | libc::SIGBUS | libc::SIGTRAP => {
            if crate::util::is_kernel_trap(si.si_code) || si.si_code > 0 {
                SignalDeterministic::DeterministicSig
            } else {
                SignalDeterministic::NondeterministicSig
            }
        }
        _ => SignalDeterministic::NondeterministicSig,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signal_determinism_classification() {
        let mut si: libc::siginfo_t = unsafe { std::mem::zeroed() };
        si.si_signo = libc::SIGSEGV;
        si.si_code = 1; // SEGV_MAPERR: kernel-generated fault
        assert_eq!(
            SignalDeterministic::DeterministicSig,
            classify_signal_determinism(&si)
        );

        // Same signal sent by kill() is asynchronous.
        si.si_code = -6; // SI_TKILL
        assert_eq!(
            SignalDeterministic::NondeterministicSig,
            classify_signal_determinism(&si)
        );

        let mut usr: libc::siginfo_t = unsafe { std::mem::zeroed() };
        usr.si_signo = libc::SIGUSR1;
        usr.si_code = 1;
        assert_eq!(
            SignalDeterministic::NondeterministicSig,
            classify_signal_determinism(&usr)
        );
    }

    #[test]
    fn blocking_syscalls_allow_switch() {
        use crate::kernel_abi::{x64_syscall, SupportedArch};
        assert_eq!(
            Switchable::AllowSwitch,
            syscall_switchable(x64_syscall::READ, SupportedArch::X64)
        );
        assert_eq!(
            Switchable::PreventSwitch,
            syscall_switchable(x64_syscall::CLOSE, SupportedArch::X64)
        );
    }

    #[test]
    fn desched_flag_offset_matches_header_layout() {
        let hdr = syscallbuf_hdr::default();
        let base = &hdr as *const _ as usize;
        let flag = &hdr.desched_signal_may_be_relevant as *const _ as usize;
        assert_eq!(flag - base, offset_of_desched_signal_may_be_relevant());
    }
}
