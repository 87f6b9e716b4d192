use crate::{
    event::{Event, EventType, Switchable},
    kernel_abi::SupportedArch,
    session::{
        task::{task_inner::TaskInner, Task},
        SessionSharedWeakPtr,
    },
    sig::Sig,
    ticks::Ticks,
};
use libc::pid_t;
use std::collections::VecDeque;

/// A tracee thread during recording. Owns the recorder-side event stack:
/// the top of the stack is the event the task is currently in the middle
/// of.
pub struct RecordTask {
    task_inner: TaskInner,

    /// Priority as reported by setpriority(); lower value is higher
    /// priority.
    pub priority: i32,
    /// True when the task sits in the scheduler's round-robin queue rather
    /// than the priority set.
    pub in_round_robin_queue: bool,

    /// The stack of events being processed. The bottom of the stack is a
    /// sentinel; syscall interruptions stay pushed while the interrupted
    /// call is pending.
    pending_events: VecDeque<Event>,
    /// Signals queued for delivery to this task.
    pub stashed_signals: Vec<libc::siginfo_t>,
    /// True when the next traced syscall needs to re-enter a syscall that a
    /// signal interrupted.
    pub syscall_restarted: bool,
    /// Ticks value at the start of the current timeslice.
    pub timeslice_start_ticks: Ticks,
    /// True once the syscallbuf contents have been flushed to the trace and
    /// the buffer awaits its deferred reset. The reset is recorded one frame
    /// after it happens so replay processes the flush first.
    pub delay_syscallbuf_reset: bool,
    /// True when the desched signal fired for the syscall currently being
    /// buffered.
    pub in_desched: bool,
}

impl RecordTask {
    pub fn new(
        session: SessionSharedWeakPtr,
        tid: pid_t,
        rec_tid: pid_t,
        serial: u32,
        arch: SupportedArch,
    ) -> RecordTask {
        let mut pending_events = VecDeque::new();
        pending_events.push_back(Event::default());
        RecordTask {
            task_inner: TaskInner::new(session, tid, rec_tid, serial, arch),
            priority: 0,
            in_round_robin_queue: false,
            pending_events,
            stashed_signals: Vec::new(),
            syscall_restarted: false,
            timeslice_start_ticks: 0,
            delay_syscallbuf_reset: false,
            in_desched: false,
        }
    }

    /// The event the task is currently processing.
    pub fn ev(&self) -> &Event {
        self.pending_events.back().unwrap()
    }

    pub fn ev_mut(&mut self) -> &mut Event {
        self.pending_events.back_mut().unwrap()
    }

    pub fn push_event(&mut self, event: Event) {
        self.pending_events.push_back(event);
    }

    pub fn pop_event(&mut self, expected: EventType) -> Event {
        let ev = self.pending_events.pop_back().unwrap();
        debug_assert_eq!(expected, ev.event_type());
        debug_assert!(!self.pending_events.is_empty());
        ev
    }

    pub fn event_stack_depth(&self) -> usize {
        self.pending_events.len()
    }

    /// Whether the task is currently inside a syscall event that allowed a
    /// switch, i.e. may be blocked in the kernel.
    pub fn maybe_in_blocking_syscall(&self) -> bool {
        let ev = self.ev();
        ev.is_syscall_event() && ev.syscall_event().switchable == Switchable::AllowSwitch
    }

    pub fn stash_signal(&mut self, si: libc::siginfo_t) {
        self.stashed_signals.push(si);
    }

    pub fn pop_stashed_signal(&mut self) -> Option<libc::siginfo_t> {
        if self.stashed_signals.is_empty() {
            None
        } else {
            Some(self.stashed_signals.remove(0))
        }
    }

    pub fn has_stashed_signals(&self) -> bool {
        !self.stashed_signals.is_empty()
    }

    /// The signal this task stopped with, if it is in a signal stop.
    pub fn stop_sig(&self) -> Option<Sig> {
        self.task_inner.status().stop_sig()
    }
}

impl Task for RecordTask {
    fn as_task_inner(&self) -> &TaskInner {
        &self.task_inner
    }

    fn as_task_inner_mut(&mut self) -> &mut TaskInner {
        &mut self.task_inner
    }

    fn as_record_task(&self) -> Option<&RecordTask> {
        Some(self)
    }

    fn as_record_task_mut(&mut self) -> Option<&mut RecordTask> {
        Some(self)
    }
}

impl std::ops::Deref for RecordTask {
    type Target = TaskInner;

    fn deref(&self) -> &Self::Target {
        &self.task_inner
    }
}

impl std::ops::DerefMut for RecordTask {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.task_inner
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::{SyscallEventData, SyscallState};
    use std::rc::Weak;

    fn make_task() -> RecordTask {
        RecordTask::new(Weak::new(), 100, 100, 1, SupportedArch::X64)
    }

    #[test]
    fn event_stack_push_pop() {
        let mut t = make_task();
        assert_eq!(1, t.event_stack_depth());

        let mut data = SyscallEventData::new(0, SupportedArch::X64);
        data.state = SyscallState::EnteringSyscall;
        t.push_event(Event::new_syscall_event(data));
        assert!(t.ev().is_syscall_event());

        t.pop_event(EventType::EvSyscall);
        assert_eq!(1, t.event_stack_depth());
    }

    #[test]
    fn blocking_syscall_detection() {
        let mut t = make_task();
        assert!(!t.maybe_in_blocking_syscall());

        let mut data = SyscallEventData::new(0, SupportedArch::X64);
        data.state = SyscallState::ProcessingSyscall;
        data.switchable = Switchable::AllowSwitch;
        t.push_event(Event::new_syscall_event(data));
        assert!(t.maybe_in_blocking_syscall());
    }

    #[test]
    fn stashed_signals_fifo() {
        let mut t = make_task();
        let mut a: libc::siginfo_t = unsafe { std::mem::zeroed() };
        a.si_signo = libc::SIGUSR1;
        let mut b: libc::siginfo_t = unsafe { std::mem::zeroed() };
        b.si_signo = libc::SIGUSR2;
        t.stash_signal(a);
        t.stash_signal(b);
        assert_eq!(libc::SIGUSR1, t.pop_stashed_signal().unwrap().si_signo);
        assert_eq!(libc::SIGUSR2, t.pop_stashed_signal().unwrap().si_signo);
        assert!(t.pop_stashed_signal().is_none());
    }
}
