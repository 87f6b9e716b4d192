use crate::{
    extra_registers::Format,
    kernel_abi::SupportedArch,
    registers::{compare_register_files, MismatchBehavior, Registers},
    session::{
        task::{task_inner::TaskInner, write_mem, Task},
        SessionSharedWeakPtr,
    },
    trace::{trace_frame::TraceFrame, trace_reader::TraceReader},
};
use libc::pid_t;

/// A tracee thread during replay.
pub struct ReplayTask {
    task_inner: TaskInner,
}

impl ReplayTask {
    pub fn new(
        session: SessionSharedWeakPtr,
        tid: pid_t,
        rec_tid: pid_t,
        serial: u32,
        arch: SupportedArch,
    ) -> ReplayTask {
        ReplayTask {
            task_inner: TaskInner::new(session, tid, rec_tid, serial, arch),
        }
    }

    /// Restore the recorded register file for the current frame, except ip
    /// and sp which callers manage around syscall emulation.
    pub fn set_regs_from_trace(&mut self, recorded: &Registers) {
        self.task_inner.set_regs(*recorded);
    }

    /// Compare the live registers against the recording. A mismatch at a
    /// frame with execution info is a fatal divergence: the mismatched
    /// registers are logged and replay aborts.
    pub fn validate_regs(&self, frame: &TraceFrame) {
        if !frame.event().has_exec_info() {
            return;
        }

        let recorded = frame.regs_ref();
        let live = self.task_inner.regs_ref();
        if !compare_register_files(
            "replaying",
            live,
            "recorded",
            recorded,
            MismatchBehavior::BailOnMismatch,
        ) {
            fatal!(
                "[event {}] fatal register mismatch (ticks {})",
                frame.time(),
                self.task_inner.tick_count()
            );
        }
    }

    /// Verify the recorded extra registers too, where the frame carries
    /// them.
    pub fn validate_extra_regs(&self, frame: &TraceFrame) {
        let recorded = frame.extra_regs_ref();
        if recorded.format() == Format::None {
            return;
        }
        if !recorded.matches(self.task_inner.extra_regs_ref()) {
            fatal!(
                "[event {}] fatal extra-register mismatch",
                frame.time()
            );
        }
    }

    /// Restore all raw memory captures recorded for the current frame.
    /// Raw records are address-space keyed, so records tagged with a
    /// sibling task's tid are still written through this task.
    pub fn apply_all_data_records_from_trace(&self, trace_reader: &mut TraceReader) {
        while let Some(raw) = trace_reader.read_raw_data_for_frame() {
            write_mem(self, raw.addr, &raw.data);
        }
    }

    /// Set the result register to the recorded value after an emulated
    /// syscall exit.
    pub fn emulate_syscall_exit(&mut self, recorded: &Registers) {
        let mut regs = *self.task_inner.regs_ref();
        regs.set_syscall_result(recorded.syscall_result());
        regs.set_flags(recorded.flags());
        self.task_inner.set_regs(regs);
    }
}

impl Task for ReplayTask {
    fn as_task_inner(&self) -> &TaskInner {
        &self.task_inner
    }

    fn as_task_inner_mut(&mut self) -> &mut TaskInner {
        &mut self.task_inner
    }

    fn as_replay_task(&self) -> Option<&ReplayTask> {
        Some(self)
    }

    fn as_replay_task_mut(&mut self) -> Option<&mut ReplayTask> {
        Some(self)
    }
}

impl std::ops::Deref for ReplayTask {
    type Target = TaskInner;

    fn deref(&self) -> &Self::Target {
        &self.task_inner
    }
}

impl std::ops::DerefMut for ReplayTask {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.task_inner
    }
}
