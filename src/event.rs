//! Events serve two purposes: tracking task state during recording, and
//! being stored in traces to guide replay. Some events are only used during
//! recording and are never actually stored in traces (and are thus
//! irrelevant to replay).

use crate::{
    event::EventType::*,
    kernel_abi::SupportedArch,
    kernel_metadata::{signal_name, syscall_name},
    preload_interface::syscallbuf_record,
    registers::Registers,
    remote_ptr::RemotePtr,
    sig::Sig,
};
use libc::siginfo_t;
use std::{
    convert::TryFrom,
    fmt::{Display, Formatter, Result, Write},
};

/// During recording, sometimes we need to ensure that an iteration of
/// RecordSession::record_step schedules the same task as in the previous
/// iteration. The PreventSwitch value indicates that this is required.
/// For example, the futex operation FUTEX_WAKE_OP modifies userspace
/// memory; those changes are only recorded after the system call completes;
/// and they must be replayed before we allow a context switch to a woken-up
/// task (because the kernel guarantees those effects are seen by woken-up
/// tasks).
/// Entering a potentially blocking system call must use AllowSwitch, or
/// we risk deadlock. Most non-blocking system calls could use PreventSwitch
/// or AllowSwitch; for simplicity we use AllowSwitch to indicate a call could
/// block and PreventSwitch otherwise.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Switchable {
    PreventSwitch,
    AllowSwitch,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u32)]
pub enum EventType {
    EvUnassigned,
    /// Recorder-internal: marks a scheduling decision boundary that produced
    /// no observable occurrence. Never stored in traces; `EncodedEvent`
    /// refuses it.
    EvNoop,
    /// Recorder-only; marks that a may-block buffered syscall was
    /// descheduled. Not stored in traces.
    EvDesched,

    // Events present in traces:
    /// Task ended; no associated data.
    EvExit,
    /// Like EvExit, but recorded when the task was last seen in a
    /// possibly-racy state in which we're not sure we can synchronously wait
    /// for it to really finish.
    EvUnstableExit,
    /// Tracee exited its sighandler. We leave this breadcrumb so that the
    /// popping of not-restarted syscall interruptions and sigreturns is
    /// replayed in the same order.
    EvExitSighandler,
    /// Recording detected that an interrupted syscall wasn't restarted, so
    /// the interruption record can be popped off the tracee's event stack.
    EvInterruptedSyscallNotRestarted,
    /// Scheduling signal interrupted the trace at a specific tick count and
    /// program counter.
    EvSched,
    /// A disabled timestamp-read instruction was emulated.
    EvSegvRdtsc,
    /// Recorded syscallbuf data for one or more buffered syscalls.
    EvSyscallbufFlush,
    EvSyscallbufAbortCommit,
    /// The syscallbuf was reset to the empty state. We record this event
    /// later than it really happens, because during replay we must proceed to
    /// the event *after* a syscallbuf flush and then reset the syscallbuf,
    /// to ensure we don't reset it while preload code is still using the data.
    EvSyscallbufReset,
    /// Syscall was entered, the syscall instruction was patched, and the
    /// syscall was aborted. Resume execution at the patch.
    EvPatchSyscall,
    /// Map memory pages due to a (future) memory access. This is associated
    /// with an mmap entry for the new pages.
    EvGrowMap,
    /// The trace was terminated before all tasks exited, most likely because
    /// the recorder was sent a terminating signal. There are no more trace
    /// frames coming.
    EvTraceTermination,
    /// Use .signal_event().
    EvSignal,
    EvSignalDelivery,
    EvSignalHandler,
    /// Use .syscall_event().
    EvSyscall,
    EvSyscallInterruption,
}

impl Default for EventType {
    fn default() -> Self {
        EvUnassigned
    }
}

/// Desched events track the fact that a tracee's desched-event
/// notification fired during a may-block buffered syscall, which the
/// recorder interprets as the syscall actually blocking (for a potentially
/// unbounded amount of time). After the syscall exits, the recorder advances
/// the tracee to where the desched is "disarmed" by the tracee.
#[derive(Clone)]
pub struct DeschedEventData {
    /// Record of the syscall that was interrupted by a desched
    /// notification. It's legal to reference this memory /while
    /// the desched is being processed only/, because the task is in the
    /// middle of a desched, which means it's successfully
    /// allocated (but not yet committed) this syscall record.
    pub rec: RemotePtr<syscallbuf_record>,
}

#[derive(Clone, Default)]
pub struct SyscallbufFlushEventData {
    /// The bytes of every record drained from the ring, copied out before
    /// the buffer is logically emptied. Replay transcribes these back.
    pub flushed_bytes: Vec<u8>,
}

impl SyscallbufFlushEventData {
    pub fn new(flushed_bytes: Vec<u8>) -> SyscallbufFlushEventData {
        SyscallbufFlushEventData { flushed_bytes }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SignalDeterministic {
    NondeterministicSig = 0,
    DeterministicSig = 1,
}

#[derive(Clone)]
pub struct SignalEventData {
    /// Signal info as delivered by the kernel.
    pub siginfo: siginfo_t,
    /// True if this signal will be deterministically raised as the
    /// side effect of retiring an instruction during replay, for
    /// example `mov dword ptr [0], 0` deterministically raises SIGSEGV.
    pub deterministic: SignalDeterministic,
}

impl SignalEventData {
    pub fn new(siginfo: &siginfo_t, deterministic: SignalDeterministic) -> SignalEventData {
        SignalEventData {
            siginfo: *siginfo,
            deterministic,
        }
    }

    pub fn maybe_sig(&self) -> Option<Sig> {
        Sig::try_from(self.siginfo.si_signo).ok()
    }

    /// For SIGILL, SIGFPE, SIGSEGV, SIGBUS and SIGTRAP this is si_addr.
    /// For other signals this is zero.
    pub fn signal_data(&self) -> u64 {
        match self.siginfo.si_signo {
            libc::SIGILL | libc::SIGFPE | libc::SIGSEGV | libc::SIGBUS | libc::SIGTRAP => unsafe {
                self.siginfo.si_addr() as u64
            },
            _ => 0,
        }
    }

    pub fn set_signal_data(&mut self, data: u64) {
        match self.siginfo.si_signo {
            libc::SIGILL | libc::SIGFPE | libc::SIGSEGV | libc::SIGBUS | libc::SIGTRAP => {
                // The libc siginfo_t exposes si_addr only through an
                // accessor; poke the sifields union directly.
                unsafe {
                    let p = (&mut self.siginfo as *mut siginfo_t as *mut u8)
                        .add(2 * std::mem::size_of::<i32>() + std::mem::size_of::<i32>());
                    // sifields starts after si_signo, si_errno, si_code and
                    // alignment padding on 64-bit.
                    let p = align_up(p as usize, std::mem::size_of::<usize>()) as *mut u64;
                    *p = data;
                }
            }
            _ => (),
        }
    }
}

fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

/// Syscall events track syscalls through entry into the kernel,
/// processing in the kernel, and exit from the kernel.
///
/// This also models interrupted syscalls. During recording, only
/// descheduled buffered syscalls /push/ syscall interruptions; all
/// others are detected at exit time and transformed into syscall
/// interruptions from the original, normal syscalls.
///
/// During replay, we push interruptions to know when we need
/// to emulate syscall entry, since the kernel won't have set
/// things up for the tracee to restart on its own.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SyscallState {
    /// Not present in trace. Just a dummy value.
    NoSyscall,
    /// Run to the given register state and enter the kernel.
    EnteringSyscall,
    /// Not present in trace.
    ProcessingSyscall,
    /// Already in the kernel. Perform the final part of the system call and
    /// exit with the recorded system call result.
    ExitingSyscall,
}

impl Display for SyscallState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let disp = match self {
            SyscallState::NoSyscall => "NO_SYSCALL",
            SyscallState::EnteringSyscall => "ENTERING_SYSCALL",
            SyscallState::ProcessingSyscall => "PROCESSING_SYSCALL",
            SyscallState::ExitingSyscall => "EXITING_SYSCALL",
        };

        write!(f, "{}", disp)
    }
}

#[derive(Clone)]
pub struct SyscallEventData {
    arch_: SupportedArch,
    /// The original (before scratch is set up) arguments to the
    /// syscall passed by the tracee. These are used to detect
    /// restarted syscalls.
    pub regs: Registers,
    /// If this is a descheduled buffered syscall, points at the
    /// record for that syscall. RemotePtr::null() if there isn't any.
    pub desched_rec: RemotePtr<syscallbuf_record>,

    pub state: SyscallState,
    /// Syscall number.
    pub number: i32,
    /// Records the switchable state when this syscall was prepared.
    pub switchable: Switchable,
    /// True when this syscall was restarted after a signal interruption.
    pub is_restart: bool,
}

impl SyscallEventData {
    pub fn new(syscallno: i32, arch: SupportedArch) -> SyscallEventData {
        SyscallEventData {
            arch_: arch,
            regs: Registers::new(arch),
            desched_rec: Default::default(),
            state: SyscallState::NoSyscall,
            number: syscallno,
            switchable: Switchable::PreventSwitch,
            is_restart: false,
        }
    }

    pub fn syscall_name(&self) -> String {
        syscall_name(self.number, self.arch())
    }

    pub fn arch(&self) -> SupportedArch {
        self.arch_
    }

    pub fn set_arch(&mut self, a: SupportedArch) {
        self.arch_ = a;
    }

    pub fn is_desched(&self) -> bool {
        !self.desched_rec.is_null()
    }
}

#[derive(Clone)]
pub enum EventExtraData {
    NoExtraData,
    DeschedEvent(DeschedEventData),
    SignalEvent(SignalEventData),
    SyscallEvent(SyscallEventData),
    SyscallbufFlushEvent(SyscallbufFlushEventData),
}

impl Default for EventExtraData {
    fn default() -> Self {
        EventExtraData::NoExtraData
    }
}

#[derive(Clone, Default)]
pub struct Event {
    event_type: EventType,
    arch_: SupportedArch,
    event_extra_data: EventExtraData,
}

/// An encoding of the relevant bits of an Event that can be
/// cheaply and easily serialized. One 32-bit word: a 5-bit type, a 1-bit
/// "is-syscall-entry" hint, a 1-bit "has-execution-info" flag, a 1-bit
/// architecture tag, and 24 bits of payload (signal number plus a
/// determinism bit, or syscall number).
#[derive(Copy, Clone, Eq, PartialEq, Default, Debug)]
#[repr(transparent)]
pub struct EncodedEvent {
    pub encoded: u32,
}

const EVENT_TYPE_BITS: u32 = 5;
const EVENT_DATA_BITS: u32 = 24;

/// Deterministic signals are encoded as (signum | DET_SIGNAL_BIT).
pub const DET_SIGNAL_BIT: u32 = 0x80;

const_assert!((EvSyscallInterruption as u32) < (1 << EVENT_TYPE_BITS));

impl EncodedEvent {
    pub fn new(
        event_type: EventType,
        is_syscall_entry: bool,
        has_exec_info: bool,
        arch: SupportedArch,
        data: u32,
    ) -> EncodedEvent {
        debug_assert!(data < (1 << EVENT_DATA_BITS));
        let mut encoded = event_type as u32;
        encoded |= (is_syscall_entry as u32) << EVENT_TYPE_BITS;
        encoded |= (has_exec_info as u32) << (EVENT_TYPE_BITS + 1);
        encoded |= match arch {
            SupportedArch::X86 => 0,
            SupportedArch::X64 => 1,
        } << (EVENT_TYPE_BITS + 2);
        encoded |= data << (32 - EVENT_DATA_BITS);
        EncodedEvent { encoded }
    }

    pub fn event_type(&self) -> EventType {
        event_type_from_bits(self.encoded & ((1 << EVENT_TYPE_BITS) - 1))
    }

    pub fn is_syscall_entry(&self) -> bool {
        self.encoded & (1 << EVENT_TYPE_BITS) != 0
    }

    pub fn has_exec_info(&self) -> bool {
        self.encoded & (1 << (EVENT_TYPE_BITS + 1)) != 0
    }

    pub fn arch(&self) -> SupportedArch {
        if self.encoded & (1 << (EVENT_TYPE_BITS + 2)) != 0 {
            SupportedArch::X64
        } else {
            SupportedArch::X86
        }
    }

    pub fn data(&self) -> u32 {
        self.encoded >> (32 - EVENT_DATA_BITS)
    }
}

fn event_type_from_bits(bits: u32) -> EventType {
    const TYPES: &[EventType] = &[
        EvUnassigned,
        EvNoop,
        EvDesched,
        EvExit,
        EvUnstableExit,
        EvExitSighandler,
        EvInterruptedSyscallNotRestarted,
        EvSched,
        EvSegvRdtsc,
        EvSyscallbufFlush,
        EvSyscallbufAbortCommit,
        EvSyscallbufReset,
        EvPatchSyscall,
        EvGrowMap,
        EvTraceTermination,
        EvSignal,
        EvSignalDelivery,
        EvSignalHandler,
        EvSyscall,
        EvSyscallInterruption,
    ];
    for &t in TYPES {
        if t as u32 == bits {
            return t;
        }
    }
    fatal!("Invalid event type bits {:#x}", bits);
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let disp = match self {
            EvUnassigned => "UNASSIGNED",
            EvNoop => "NOOP",
            EvDesched => "DESCHED",
            EvExit => "EXIT",
            EvUnstableExit => "UNSTABLE_EXIT",
            EvExitSighandler => "EXIT_SIGHANDLER",
            EvInterruptedSyscallNotRestarted => "INTERRUPTED_SYSCALL_NOT_RESTARTED",
            EvSched => "SCHED",
            EvSegvRdtsc => "SEGV_RDTSC",
            EvSyscallbufFlush => "SYSCALLBUF_FLUSH",
            EvSyscallbufAbortCommit => "SYSCALLBUF_ABORT_COMMIT",
            EvSyscallbufReset => "SYSCALLBUF_RESET",
            EvPatchSyscall => "PATCH_SYSCALL",
            EvGrowMap => "GROW_MAP",
            EvTraceTermination => "TRACE_TERMINATION",
            EvSignal => "SIGNAL",
            EvSignalDelivery => "SIGNAL_DELIVERY",
            EvSignalHandler => "SIGNAL_HANDLER",
            EvSyscall => "SYSCALL",
            EvSyscallInterruption => "SYSCALL_INTERRUPTION",
        };

        write!(f, "{}", disp)
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.str())
    }
}

impl Event {
    pub fn new_desched_event(arch: SupportedArch, ev: DeschedEventData) -> Event {
        Event {
            event_type: EvDesched,
            arch_: arch,
            event_extra_data: EventExtraData::DeschedEvent(ev),
        }
    }

    pub fn new_signal_event(type_: EventType, arch: SupportedArch, ev: SignalEventData) -> Event {
        debug_assert!(matches!(
            type_,
            EvSignal | EvSignalDelivery | EvSignalHandler
        ));
        Event {
            event_type: type_,
            arch_: arch,
            event_extra_data: EventExtraData::SignalEvent(ev),
        }
    }

    pub fn new_syscallbuf_flush_event(arch: SupportedArch, ev: SyscallbufFlushEventData) -> Event {
        Event {
            event_type: EvSyscallbufFlush,
            arch_: arch,
            event_extra_data: EventExtraData::SyscallbufFlushEvent(ev),
        }
    }

    pub fn new_syscall_event(ev: SyscallEventData) -> Event {
        Event {
            event_type: EvSyscall,
            arch_: ev.arch(),
            event_extra_data: EventExtraData::SyscallEvent(ev),
        }
    }

    pub fn new_syscall_interruption_event(ev: SyscallEventData) -> Event {
        Event {
            event_type: EvSyscallInterruption,
            arch_: ev.arch(),
            event_extra_data: EventExtraData::SyscallEvent(ev),
        }
    }

    fn new_event(event_type: EventType) -> Event {
        Event {
            event_type,
            arch_: SupportedArch::default(),
            event_extra_data: EventExtraData::NoExtraData,
        }
    }

    pub fn noop() -> Event {
        Event::new_event(EvNoop)
    }

    pub fn exit() -> Event {
        Event::new_event(EvExit)
    }

    pub fn unstable_exit() -> Event {
        Event::new_event(EvUnstableExit)
    }

    pub fn exit_sighandler() -> Event {
        Event::new_event(EvExitSighandler)
    }

    pub fn interrupted_syscall_not_restarted() -> Event {
        Event::new_event(EvInterruptedSyscallNotRestarted)
    }

    pub fn sched() -> Event {
        Event::new_event(EvSched)
    }

    pub fn segv_rdtsc() -> Event {
        Event::new_event(EvSegvRdtsc)
    }

    pub fn syscallbuf_abort_commit() -> Event {
        Event::new_event(EvSyscallbufAbortCommit)
    }

    pub fn syscallbuf_reset() -> Event {
        Event::new_event(EvSyscallbufReset)
    }

    pub fn patch_syscall() -> Event {
        Event::new_event(EvPatchSyscall)
    }

    pub fn grow_map() -> Event {
        Event::new_event(EvGrowMap)
    }

    pub fn trace_termination() -> Event {
        Event::new_event(EvTraceTermination)
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn arch(&self) -> SupportedArch {
        match &self.event_extra_data {
            EventExtraData::SyscallEvent(ev) => ev.arch(),
            _ => self.arch_,
        }
    }

    pub fn set_arch(&mut self, arch: SupportedArch) {
        self.arch_ = arch;
        if let EventExtraData::SyscallEvent(ev) = &mut self.event_extra_data {
            ev.set_arch(arch);
        }
    }

    pub fn is_syscall_event(&self) -> bool {
        matches!(self.event_type, EvSyscall | EvSyscallInterruption)
    }

    pub fn is_signal_event(&self) -> bool {
        matches!(self.event_type, EvSignal | EvSignalDelivery | EvSignalHandler)
    }

    /// True when this event can appear in a trace at all.
    pub fn is_trace_event(&self) -> bool {
        !matches!(self.event_type, EvUnassigned | EvNoop | EvDesched)
    }

    /// True when a tracee at this event has meaningful execution info
    /// (registers, ticks) that should be recorded: the same state will be
    /// seen when reaching this event during replay, so the recorded values
    /// are comparable.
    pub fn has_exec_info(&self) -> bool {
        match self.event_type {
            EvExit
            | EvUnstableExit
            | EvExitSighandler
            | EvInterruptedSyscallNotRestarted
            | EvSched
            | EvSegvRdtsc
            | EvPatchSyscall
            | EvSignal
            | EvSignalDelivery
            | EvSignalHandler
            | EvSyscall
            | EvSyscallInterruption => true,
            _ => false,
        }
    }

    /// True for events whose registers are worth writing to the trace.
    pub fn record_regs(&self) -> bool {
        self.has_exec_info()
    }

    /// True for events that must also record the FP/vector save area:
    /// sigreturn and execve restore register state, and entering a signal
    /// handler clears FP/SSE regs.
    pub fn record_extra_regs(&self) -> bool {
        match self.event_type {
            EvSyscall => {
                let sys_ev = self.syscall_event();
                sys_ev.state == SyscallState::ExitingSyscall
                    && (crate::kernel_abi::is_sigreturn_syscall(sys_ev.number, sys_ev.arch())
                        || crate::kernel_abi::is_execve_syscall(sys_ev.number, sys_ev.arch()))
            }
            EvSignalHandler => true,
            _ => false,
        }
    }

    /// True for events that can complete at a tick count slightly different
    /// from the recorded one (synthetic events not tied to an instruction
    /// boundary).
    pub fn has_ticks_slop(&self) -> bool {
        matches!(
            self.event_type,
            EvSyscallbufAbortCommit | EvSyscallbufFlush | EvSyscallbufReset | EvDesched | EvGrowMap
        )
    }

    /// Encode this event into the 32-bit trace representation. The encoding
    /// is lossy: registers and signal info travel beside it in the frame.
    pub fn encode(&self) -> EncodedEvent {
        if !self.is_trace_event() {
            fatal!("Event {} cannot be encoded into a trace", self);
        }

        let mut is_syscall_entry = false;
        let data: u32 = match &self.event_extra_data {
            EventExtraData::SignalEvent(ev) => {
                let mut d = ev.siginfo.si_signo as u32;
                if ev.deterministic == SignalDeterministic::DeterministicSig {
                    d |= DET_SIGNAL_BIT;
                }
                d
            }
            EventExtraData::SyscallEvent(ev) => {
                is_syscall_entry = ev.state == SyscallState::EnteringSyscall;
                ev.number as u32
            }
            _ => 0,
        };

        EncodedEvent::new(
            self.event_type,
            is_syscall_entry,
            self.has_exec_info(),
            self.arch(),
            data,
        )
    }

    /// Reconstruct an event from its encoding. Payload fields not stored in
    /// the encoding (full siginfo, entry registers) come back zeroed; the
    /// trace frame supplies them separately where they were recorded.
    pub fn decode(e: EncodedEvent) -> Event {
        let event_type = e.event_type();
        match event_type {
            EvSignal | EvSignalDelivery | EvSignalHandler => {
                let mut siginfo: siginfo_t = unsafe { std::mem::zeroed() };
                siginfo.si_signo = (e.data() & !DET_SIGNAL_BIT) as i32;
                let deterministic = if e.data() & DET_SIGNAL_BIT != 0 {
                    SignalDeterministic::DeterministicSig
                } else {
                    SignalDeterministic::NondeterministicSig
                };
                Event::new_signal_event(
                    event_type,
                    e.arch(),
                    SignalEventData::new(&siginfo, deterministic),
                )
            }
            EvSyscall | EvSyscallInterruption => {
                let mut ev = SyscallEventData::new(e.data() as i32, e.arch());
                ev.state = if e.is_syscall_entry() {
                    SyscallState::EnteringSyscall
                } else {
                    SyscallState::ExitingSyscall
                };
                if event_type == EvSyscall {
                    Event::new_syscall_event(ev)
                } else {
                    Event::new_syscall_interruption_event(ev)
                }
            }
            EvSyscallbufFlush => {
                Event::new_syscallbuf_flush_event(e.arch(), SyscallbufFlushEventData::default())
            }
            _ => {
                let mut ev = Event::new_event(event_type);
                ev.arch_ = e.arch();
                ev
            }
        }
    }

    pub fn str(&self) -> String {
        let mut ss = format!("{}", self.event_type);
        match self.event_type {
            EvSignal | EvSignalDelivery | EvSignalHandler => {
                let deterministic =
                    if self.signal_event().deterministic == SignalDeterministic::DeterministicSig {
                        "det"
                    } else {
                        "async"
                    };

                write!(
                    ss,
                    ": {}({})",
                    signal_name(self.signal_event().siginfo.si_signo),
                    deterministic
                )
                .unwrap_or(());
            }
            EvSyscall | EvSyscallInterruption => {
                write!(
                    ss,
                    ": {}",
                    syscall_name(self.syscall_event().number, self.syscall_event().arch())
                )
                .unwrap_or(());
            }
            _ => {
                // No auxiliary information.
            }
        }
        ss
    }

    /// Dynamically change the type of this. Only a small number
    /// of type changes are allowed.
    pub fn transform(&mut self, new_type: EventType) {
        match self.event_type {
            EvSignal => {
                debug_assert_eq!(EvSignalDelivery, new_type);
            }
            EvSignalDelivery => {
                debug_assert_eq!(EvSignalHandler, new_type);
            }
            EvSyscall => {
                debug_assert_eq!(EvSyscallInterruption, new_type);
            }
            EvSyscallInterruption => {
                debug_assert_eq!(EvSyscall, new_type);
            }
            _ => fatal!("Can't transform immutable {} into {:?}", self, new_type),
        }

        self.event_type = new_type;
    }

    pub fn desched_event(&self) -> &DeschedEventData {
        match &self.event_extra_data {
            EventExtraData::DeschedEvent(ev) => ev,
            _ => panic!("Not a desched event"),
        }
    }

    pub fn desched_event_mut(&mut self) -> &mut DeschedEventData {
        match &mut self.event_extra_data {
            EventExtraData::DeschedEvent(ev) => ev,
            _ => panic!("Not a desched event"),
        }
    }

    pub fn syscallbuf_flush_event(&self) -> &SyscallbufFlushEventData {
        match &self.event_extra_data {
            EventExtraData::SyscallbufFlushEvent(ev) => ev,
            _ => panic!("Not a syscallbuf flush event"),
        }
    }

    pub fn syscallbuf_flush_event_mut(&mut self) -> &mut SyscallbufFlushEventData {
        match &mut self.event_extra_data {
            EventExtraData::SyscallbufFlushEvent(ev) => ev,
            _ => panic!("Not a syscallbuf flush event"),
        }
    }

    pub fn signal_event(&self) -> &SignalEventData {
        match &self.event_extra_data {
            EventExtraData::SignalEvent(ev) => ev,
            _ => panic!("Not a signal event"),
        }
    }

    pub fn signal_event_mut(&mut self) -> &mut SignalEventData {
        match &mut self.event_extra_data {
            EventExtraData::SignalEvent(ev) => ev,
            _ => panic!("Not a signal event"),
        }
    }

    pub fn syscall_event(&self) -> &SyscallEventData {
        match &self.event_extra_data {
            EventExtraData::SyscallEvent(ev) => ev,
            _ => panic!("Not a syscall event"),
        }
    }

    pub fn syscall_event_mut(&mut self) -> &mut SyscallEventData {
        match &mut self.event_extra_data {
            EventExtraData::SyscallEvent(ev) => ev,
            _ => panic!("Not a syscall event"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kernel_abi::{x64_syscall, SupportedArch};

    fn encode_decode(ev: &Event) -> Event {
        let enc = ev.encode();
        let dec = Event::decode(enc);
        assert_eq!(enc, dec.encode());
        dec
    }

    #[test]
    fn plain_events_round_trip() {
        for ev in &[
            Event::exit(),
            Event::unstable_exit(),
            Event::exit_sighandler(),
            Event::interrupted_syscall_not_restarted(),
            Event::sched(),
            Event::segv_rdtsc(),
            Event::syscallbuf_abort_commit(),
            Event::syscallbuf_reset(),
            Event::patch_syscall(),
            Event::grow_map(),
            Event::trace_termination(),
        ] {
            let dec = encode_decode(ev);
            assert_eq!(ev.event_type(), dec.event_type());
            assert_eq!(ev.has_exec_info(), dec.encode().has_exec_info());
        }
    }

    #[test]
    fn signal_events_round_trip() {
        let mut siginfo: libc::siginfo_t = unsafe { std::mem::zeroed() };
        siginfo.si_signo = libc::SIGSEGV;
        for &det in &[
            SignalDeterministic::DeterministicSig,
            SignalDeterministic::NondeterministicSig,
        ] {
            for &t in &[EvSignal, EvSignalDelivery, EvSignalHandler] {
                let ev = Event::new_signal_event(
                    t,
                    SupportedArch::X64,
                    SignalEventData::new(&siginfo, det),
                );
                let dec = encode_decode(&ev);
                assert_eq!(t, dec.event_type());
                assert_eq!(libc::SIGSEGV, dec.signal_event().siginfo.si_signo);
                assert_eq!(det, dec.signal_event().deterministic);
            }
        }
    }

    #[test]
    fn syscall_events_round_trip() {
        for &state in &[SyscallState::EnteringSyscall, SyscallState::ExitingSyscall] {
            let mut data = SyscallEventData::new(x64_syscall::READ, SupportedArch::X64);
            data.state = state;
            let ev = Event::new_syscall_event(data);
            let enc = ev.encode();
            assert_eq!(state == SyscallState::EnteringSyscall, enc.is_syscall_entry());
            let dec = Event::decode(enc);
            assert_eq!(EvSyscall, dec.event_type());
            assert_eq!(x64_syscall::READ, dec.syscall_event().number);
            assert_eq!(state, dec.syscall_event().state);
            assert_eq!(SupportedArch::X64, dec.syscall_event().arch());
        }
    }

    #[test]
    fn syscall_interruption_round_trip() {
        let mut data = SyscallEventData::new(x64_syscall::POLL, SupportedArch::X64);
        data.state = SyscallState::EnteringSyscall;
        data.is_restart = true;
        let ev = Event::new_syscall_interruption_event(data);
        let dec = encode_decode(&ev);
        assert_eq!(EvSyscallInterruption, dec.event_type());
        assert_eq!(x64_syscall::POLL, dec.syscall_event().number);
    }

    #[test]
    fn arch_tag_preserved() {
        let mut data = SyscallEventData::new(3, SupportedArch::X86);
        data.state = SyscallState::ExitingSyscall;
        let ev = Event::new_syscall_event(data);
        let dec = encode_decode(&ev);
        assert_eq!(SupportedArch::X86, dec.syscall_event().arch());
    }

    #[test]
    fn noop_and_desched_never_encode() {
        assert!(!Event::noop().is_trace_event());
        let desched = Event::new_desched_event(
            SupportedArch::X64,
            DeschedEventData {
                rec: RemotePtr::null(),
            },
        );
        assert!(!desched.is_trace_event());
    }

    #[test]
    fn transforms() {
        let mut siginfo: libc::siginfo_t = unsafe { std::mem::zeroed() };
        siginfo.si_signo = libc::SIGUSR1;
        let mut ev = Event::new_signal_event(
            EvSignal,
            SupportedArch::X64,
            SignalEventData::new(&siginfo, SignalDeterministic::NondeterministicSig),
        );
        ev.transform(EvSignalDelivery);
        ev.transform(EvSignalHandler);
        assert_eq!(EvSignalHandler, ev.event_type());

        let mut data = SyscallEventData::new(0, SupportedArch::X64);
        data.state = SyscallState::EnteringSyscall;
        let mut sys = Event::new_syscall_event(data);
        sys.transform(EvSyscallInterruption);
        sys.transform(EvSyscall);
        assert_eq!(EvSyscall, sys.event_type());
    }

    #[test]
    fn ticks_slop_set() {
        assert!(Event::syscallbuf_reset().has_ticks_slop());
        assert!(Event::grow_map().has_ticks_slop());
        assert!(!Event::sched().has_ticks_slop());
    }
}
