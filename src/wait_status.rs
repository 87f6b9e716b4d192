use crate::{
    bindings::ptrace::{PTRACE_EVENT_EXIT, PTRACE_EVENT_STOP},
    kernel_metadata::ptrace_event_name,
    sig::Sig,
};
use libc::{SIGSTOP, SIGTRAP, WEXITSTATUS, WIFEXITED, WIFSIGNALED, WIFSTOPPED, WSTOPSIG, WTERMSIG};
use std::{
    convert::TryFrom,
    fmt::{Display, Formatter, Result},
};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WaitType {
    /// Task exited normally.
    Exit,
    /// Task exited due to fatal signal.
    FatalSignal,
    /// Task is in a signal-delivery-stop.
    SignalStop,
    /// Task is in a group-stop. (See ptrace man page.)
    /// You must use PTRACE_SEIZE to generate PTRACE_EVENT_STOPs, or these
    /// will be treated as SignalStop.
    GroupStop,
    /// Task is in a syscall-stop triggered by PTRACE_SYSCALL
    /// and PTRACE_O_TRACESYSGOOD.
    SyscallStop,
    /// Task is in a PTRACE_EVENT stop, except for PTRACE_EVENT_STOP
    /// which is treated as GroupStop.
    PtraceEvent,
}

/// A `waitpid` status word, decoded on demand.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct WaitStatus {
    status: i32,
}

impl Default for WaitStatus {
    fn default() -> Self {
        Self::new(0)
    }
}

impl WaitStatus {
    pub fn new(status: i32) -> WaitStatus {
        WaitStatus { status }
    }

    pub fn get(&self) -> i32 {
        self.status
    }

    pub fn wait_type(&self) -> WaitType {
        if self.exit_code().is_some() {
            return WaitType::Exit;
        }

        if self.fatal_sig().is_some() {
            return WaitType::FatalSignal;
        }

        if self.stop_sig().is_some() {
            return WaitType::SignalStop;
        }

        if self.group_stop_sig().is_some() {
            return WaitType::GroupStop;
        }

        if self.is_syscall() {
            return WaitType::SyscallStop;
        }

        if self.ptrace_event().is_some() {
            return WaitType::PtraceEvent;
        }

        fatal!("Status {:#x} not understood", self.status);
    }

    /// Exit code if wait_type() == Exit, otherwise None.
    pub fn exit_code(&self) -> Option<i32> {
        if unsafe { WIFEXITED(self.status) } {
            Some(unsafe { WEXITSTATUS(self.status) })
        } else {
            None
        }
    }

    /// Fatal signal if wait_type() == FatalSignal, otherwise None.
    pub fn fatal_sig(&self) -> Option<Sig> {
        if unsafe { WIFSIGNALED(self.status) } {
            Sig::try_from(unsafe { WTERMSIG(self.status) }).ok()
        } else {
            None
        }
    }

    /// Stop signal if wait_type() == SignalStop, otherwise None. A zero
    /// signal (rare but observed via PTRACE_INTERRUPT) is converted to
    /// SIGSTOP.
    pub fn stop_sig(&self) -> Option<Sig> {
        // (status >> 16) & 0xff nonzero means a ptrace event or group stop.
        if !unsafe { WIFSTOPPED(self.status) } || (self.status >> 16) & 0xff != 0 {
            return None;
        }

        let mut sig: i32 = unsafe { WSTOPSIG(self.status) };
        if sig == (SIGTRAP | 0x80) {
            return None;
        }

        sig &= !0x80;
        Some(if sig == 0 {
            unsafe { Sig::from_raw_unchecked(SIGSTOP) }
        } else {
            unsafe { Sig::from_raw_unchecked(sig) }
        })
    }

    pub fn group_stop_sig(&self) -> Option<Sig> {
        if !unsafe { WIFSTOPPED(self.status) }
            || (self.status >> 16) & 0xff != PTRACE_EVENT_STOP as i32
        {
            return None;
        }

        let mut sig: i32 = unsafe { WSTOPSIG(self.status) };
        sig &= !0x80;
        Some(if sig == 0 {
            unsafe { Sig::from_raw_unchecked(SIGSTOP) }
        } else {
            unsafe { Sig::from_raw_unchecked(sig) }
        })
    }

    pub fn is_syscall(&self) -> bool {
        if self.ptrace_event().is_some() || !unsafe { WIFSTOPPED(self.status) } {
            return false;
        }

        (unsafe { WSTOPSIG(self.status) }) == (SIGTRAP | 0x80)
    }

    pub fn ptrace_event(&self) -> Option<u32> {
        let event: u32 = ((self.status >> 16) & 0xff) as u32;
        if event == 0 || event == PTRACE_EVENT_STOP {
            None
        } else {
            Some(event)
        }
    }

    pub fn ptrace_signal(&self) -> Option<Sig> {
        if unsafe { WIFSTOPPED(self.status) } {
            Sig::try_from(unsafe { WSTOPSIG(self.status) } & 0x7f).ok()
        } else {
            None
        }
    }

    /// Return a WaitStatus for a process exit with the given code.
    pub fn for_exit_code(code: i32) -> WaitStatus {
        debug_assert!(0 <= code && code < 0x100);
        WaitStatus { status: code << 8 }
    }

    /// Return a WaitStatus for a fatal-signal death.
    pub fn for_fatal_sig(sig: Sig) -> WaitStatus {
        WaitStatus {
            status: sig.as_raw(),
        }
    }

    /// Return a WaitStatus for a stop with the given signal.
    pub fn for_stop_sig(sig: Sig) -> WaitStatus {
        WaitStatus {
            status: (sig.as_raw() << 8) | 0x7f,
        }
    }

    pub fn for_group_stop_sig(sig: Sig) -> WaitStatus {
        WaitStatus {
            status: ((PTRACE_EVENT_STOP as i32) << 16) | (sig.as_raw() << 8) | 0x7f,
        }
    }

    pub fn for_syscall_stop() -> WaitStatus {
        WaitStatus {
            status: ((SIGTRAP | 0x80) << 8) | 0x7f,
        }
    }

    pub fn for_ptrace_event(event: u32) -> WaitStatus {
        WaitStatus {
            status: ((event as i32) << 16) | (SIGTRAP << 8) | 0x7f,
        }
    }

    pub fn is_ptrace_exit_event(&self) -> bool {
        self.ptrace_event() == Some(PTRACE_EVENT_EXIT)
    }
}

impl Display for WaitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.status)?;
        match self.wait_type() {
            WaitType::Exit => write!(f, " (EXIT-{})", self.exit_code().unwrap()),
            WaitType::FatalSignal => write!(f, " (FATAL-{})", self.fatal_sig().unwrap()),
            WaitType::SignalStop => write!(f, " (STOP-{})", self.stop_sig().unwrap()),
            WaitType::GroupStop => write!(f, " (GROUP-STOP-{})", self.group_stop_sig().unwrap()),
            WaitType::SyscallStop => write!(f, " (SYSCALL)"),
            WaitType::PtraceEvent => {
                write!(f, " ({})", ptrace_event_name(self.ptrace_event().unwrap()))
            }
        }
    }
}

impl std::fmt::Debug for WaitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sig;

    #[test]
    fn exit_round_trip() {
        let ws = WaitStatus::for_exit_code(42);
        assert_eq!(WaitType::Exit, ws.wait_type());
        assert_eq!(Some(42), ws.exit_code());
    }

    #[test]
    fn stop_sig_round_trip() {
        let ws = WaitStatus::for_stop_sig(sig::SIGUSR1);
        assert_eq!(WaitType::SignalStop, ws.wait_type());
        assert_eq!(Some(sig::SIGUSR1), ws.stop_sig());
    }

    #[test]
    fn syscall_stop_round_trip() {
        let ws = WaitStatus::for_syscall_stop();
        assert_eq!(WaitType::SyscallStop, ws.wait_type());
        assert!(ws.is_syscall());
    }

    #[test]
    fn ptrace_event_round_trip() {
        let ws = WaitStatus::for_ptrace_event(PTRACE_EVENT_EXIT);
        assert_eq!(WaitType::PtraceEvent, ws.wait_type());
        assert!(ws.is_ptrace_exit_event());
    }

    #[test]
    fn group_stop_round_trip() {
        let ws = WaitStatus::for_group_stop_sig(sig::SIGSTOP);
        assert_eq!(WaitType::GroupStop, ws.wait_type());
        assert_eq!(Some(sig::SIGSTOP), ws.group_stop_sig());
    }
}
