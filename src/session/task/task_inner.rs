use crate::{
    bindings::kernel::debugreg_user_offset,
    extra_registers::ExtraRegisters,
    kernel_abi::{syscall_instruction_length, SupportedArch},
    log::LogLevel::{LogDebug, LogWarn},
    perf_counters::PerfCounters,
    preload_interface::{
        preload_globals, syscallbuf_hdr, RETRACE_PAGE_SYSCALL_INSTRUCTION_END,
        RETRACE_PAGE_SYSCALL_UNTRACED,
    },
    registers::Registers,
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::{RemotePtr, Void},
    scoped_fd::ScopedFd,
    session::{
        address_space::{AddressSpaceSharedPtr, DebugStatus},
        SessionSharedPtr, SessionSharedWeakPtr,
    },
    sig::Sig,
    taskish_uid::TaskUid,
    thread_group::ThreadGroupSharedPtr,
    ticks::Ticks,
    util::{pread_all_fallible, pwrite_all_fallible},
    wait_status::WaitStatus,
};
use libc::{
    pid_t, PR_SET_NO_NEW_PRIVS, PTRACE_CONT, PTRACE_GETREGS, PTRACE_GETSIGINFO, PTRACE_PEEKUSER,
    PTRACE_POKEUSER, PTRACE_SETOPTIONS, PTRACE_SETREGS, PTRACE_SINGLESTEP, PTRACE_SYSCALL,
    PTRACE_TRACEME, SECCOMP_MODE_FILTER, __WALL, WNOHANG,
};
use nix::{
    errno::errno,
    fcntl::OFlag,
    unistd::{execve, fork, ForkResult, Pid},
};
use std::{
    cell::{Cell, RefCell},
    ffi::{CStr, CString, OsStr, OsString},
    os::unix::ffi::{OsStrExt, OsStringExt},
    ptr,
};

const PTRACE_SYSEMU: libc::c_uint = 31;
const PTRACE_SYSEMU_SINGLESTEP: libc::c_uint = 32;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ResumeRequest {
    ResumeCont,
    ResumeSinglestep,
    ResumeSyscall,
    ResumeSysemu,
    ResumeSysemuSinglestep,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WaitRequest {
    /// After resuming, blocking-waitpid() until the tracee stops again.
    ResumeWait,
    /// Don't wait. Begin waiting later via a non-blocking poll.
    ResumeNonblocking,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TicksRequest {
    /// We don't expect to see any ticks (though we seem to on the odd buggy
    /// system...). Using this is a small performance optimization because we
    /// don't have to reset the performance counters.
    ResumeNoTicks,
    ResumeUnlimitedTicks,
    /// Deliver the timeslice signal after this many ticks.
    ResumeWithTicksRequest(Ticks),
}

/// Why a SIGTRAP stop happened, as far as the hardware can tell us.
#[derive(Copy, Clone, Default, Debug)]
pub struct TrapReasons {
    pub singlestep: bool,
    pub watchpoint: bool,
    pub breakpoint: bool,
}

/// The ptrace plumbing shared by record and replay tasks.
pub struct TaskInner {
    /// The task's real tid.
    pub tid: pid_t,
    /// The thread id at record time. During recording this equals `tid`.
    pub rec_tid: pid_t,
    serial: u32,
    arch_: SupportedArch,

    registers: Registers,
    registers_dirty: bool,
    extra_registers: ExtraRegisters,
    ticks: Ticks,
    pub hpc: PerfCounters,

    wait_status: WaitStatus,
    is_stopped: bool,
    seen_ptrace_exit_event: bool,

    vm_: Option<AddressSpaceSharedPtr>,
    tg_: Option<ThreadGroupSharedPtr>,
    session_: SessionSharedWeakPtr,

    /// /proc/<tid>/mem, opened lazily.
    mem_fd: RefCell<ScopedFd>,

    /// Tracee address of the thread's syscallbuf header, null until
    /// rtcall_init_buffers.
    pub syscallbuf_child: RemotePtr<syscallbuf_hdr>,
    pub syscallbuf_size: usize,
    /// The desched counter fd in the tracee.
    pub desched_fd_child: i32,
    /// Tracee address of the process-global preload_globals object.
    pub preload_globals_child: RemotePtr<preload_globals>,
    /// Count of all ticks seen during this task's lifetime at the last
    /// trace-frame record.
    pub ticks_at_last_recorded_frame: Cell<Ticks>,
    /// Hardware debug status captured by the last compute_trap_reasons.
    last_debug_status: Cell<DebugStatus>,
}

impl TaskInner {
    pub fn new(
        session: SessionSharedWeakPtr,
        tid: pid_t,
        rec_tid: pid_t,
        serial: u32,
        arch: SupportedArch,
    ) -> TaskInner {
        TaskInner {
            tid,
            rec_tid: if rec_tid > 0 { rec_tid } else { tid },
            serial,
            arch_: arch,
            registers: Registers::new(arch),
            registers_dirty: false,
            extra_registers: ExtraRegisters::new(arch),
            ticks: 0,
            hpc: PerfCounters::new(tid),
            wait_status: WaitStatus::default(),
            is_stopped: false,
            seen_ptrace_exit_event: false,
            vm_: None,
            tg_: None,
            session_: session,
            mem_fd: RefCell::new(ScopedFd::new()),
            syscallbuf_child: RemotePtr::null(),
            syscallbuf_size: 0,
            desched_fd_child: -1,
            preload_globals_child: RemotePtr::null(),
            ticks_at_last_recorded_frame: Cell::new(0),
            last_debug_status: Cell::new(DebugStatus::empty()),
        }
    }

    pub fn tuid(&self) -> TaskUid {
        TaskUid::new_with(self.rec_tid, self.serial)
    }

    pub fn arch(&self) -> SupportedArch {
        self.arch_
    }

    pub fn session(&self) -> SessionSharedPtr {
        self.session_.upgrade().unwrap()
    }

    pub fn session_weak(&self) -> &SessionSharedWeakPtr {
        &self.session_
    }

    pub fn vm(&self) -> AddressSpaceSharedPtr {
        self.vm_.as_ref().unwrap().clone()
    }

    pub fn has_vm(&self) -> bool {
        self.vm_.is_some()
    }

    pub fn set_vm(&mut self, vm: AddressSpaceSharedPtr) {
        self.vm_ = Some(vm);
    }

    pub fn thread_group(&self) -> ThreadGroupSharedPtr {
        self.tg_.as_ref().unwrap().clone()
    }

    pub fn set_thread_group(&mut self, tg: ThreadGroupSharedPtr) {
        self.tg_ = Some(tg);
    }

    // --- Registers --------------------------------------------------------

    pub fn regs_ref(&self) -> &Registers {
        debug_assert!(self.is_stopped || self.registers_dirty);
        &self.registers
    }

    pub fn regs_mut(&mut self) -> &mut Registers {
        self.registers_dirty = true;
        &mut self.registers
    }

    pub fn set_regs(&mut self, regs: Registers) {
        self.registers = regs;
        self.registers_dirty = true;
    }

    pub fn extra_regs_ref(&self) -> &ExtraRegisters {
        &self.extra_registers
    }

    pub fn set_extra_regs(&mut self, extra: ExtraRegisters) {
        self.extra_registers = extra;
    }

    pub fn ip(&self) -> RemoteCodePtr {
        self.registers.ip()
    }

    pub fn set_ip(&mut self, ip: RemoteCodePtr) {
        self.regs_mut().set_ip(ip);
    }

    fn flush_regs(&mut self) {
        if self.registers_dirty {
            let native = self.registers.get_ptrace();
            let ret = unsafe {
                libc::ptrace(
                    PTRACE_SETREGS,
                    self.tid,
                    ptr::null_mut::<u8>(),
                    &native as *const _,
                )
            };
            if ret < 0 {
                fatal!("Can't set registers of task {}", self.tid);
            }
            self.registers_dirty = false;
        }
    }

    fn refresh_regs(&mut self) {
        let mut native = crate::kernel_abi::x64::user_regs_struct::default();
        let ret = unsafe {
            libc::ptrace(
                PTRACE_GETREGS,
                self.tid,
                ptr::null_mut::<u8>(),
                &mut native as *mut _,
            )
        };
        if ret < 0 {
            // The task may have been SIGKILLed out from under us.
            log!(LogWarn, "Can't read registers of task {}", self.tid);
            return;
        }
        self.registers.set_from_ptrace(&native);
        self.registers_dirty = false;
    }

    // --- Ticks ------------------------------------------------------------

    pub fn tick_count(&self) -> Ticks {
        self.ticks
    }

    pub fn set_tick_count(&mut self, count: Ticks) {
        self.ticks = count;
    }

    // --- Execution control ------------------------------------------------

    /// Resume the tracee. The tracee must currently be in a ptrace stop.
    pub fn resume_execution(
        &mut self,
        how: ResumeRequest,
        wait_how: WaitRequest,
        tick_period: TicksRequest,
        maybe_sig: Option<Sig>,
    ) {
        debug_assert!(self.is_stopped);
        self.flush_regs();

        match tick_period {
            TicksRequest::ResumeNoTicks => (),
            TicksRequest::ResumeUnlimitedTicks => self.hpc.reset(0),
            TicksRequest::ResumeWithTicksRequest(period) => {
                // A zero period would fire instantly and a tiny one fires
                // inside the skid window; clamp up.
                self.hpc.reset(std::cmp::max(1, period))
            }
        }

        let request: libc::c_uint = match how {
            ResumeRequest::ResumeCont => PTRACE_CONT,
            ResumeRequest::ResumeSinglestep => PTRACE_SINGLESTEP,
            ResumeRequest::ResumeSyscall => PTRACE_SYSCALL,
            ResumeRequest::ResumeSysemu => PTRACE_SYSEMU,
            ResumeRequest::ResumeSysemuSinglestep => PTRACE_SYSEMU_SINGLESTEP,
        };
        let sig: usize = maybe_sig.map(|s| s.as_raw() as usize).unwrap_or(0);

        log!(
            LogDebug,
            "resuming task {} with {:?} (sig {})",
            self.tid,
            how,
            sig
        );
        let ret = unsafe {
            libc::ptrace(request, self.tid, ptr::null_mut::<u8>(), sig as *mut libc::c_void)
        };
        if ret < 0 {
            fatal!("Can't resume task {}: errno {}", self.tid, errno());
        }
        self.is_stopped = false;

        if wait_how == WaitRequest::ResumeWait {
            self.wait();
        }
    }

    /// Block until the tracee's next ptrace stop and record its status.
    pub fn wait(&mut self) {
        debug_assert!(!self.is_stopped);
        let mut raw_status: i32 = 0;
        let ret = unsafe { libc::waitpid(self.tid, &mut raw_status, __WALL) };
        if ret != self.tid {
            fatal!("waitpid({}) failed: errno {}", self.tid, errno());
        }
        self.did_waitpid(WaitStatus::new(raw_status));
    }

    /// Non-blocking poll for a state change. Returns true (and consumes the
    /// status) when one was observed.
    pub fn try_wait(&mut self) -> bool {
        if self.is_stopped {
            return true;
        }
        let mut raw_status: i32 = 0;
        let ret = unsafe { libc::waitpid(self.tid, &mut raw_status, __WALL | WNOHANG) };
        if ret == self.tid {
            self.did_waitpid(WaitStatus::new(raw_status));
            return true;
        }
        false
    }

    pub fn did_waitpid(&mut self, status: WaitStatus) {
        log!(LogDebug, "task {} stopped with {}", self.tid, status);
        self.wait_status = status;
        self.is_stopped = true;

        if status.is_ptrace_exit_event() {
            self.seen_ptrace_exit_event = true;
        }
        if status.exit_code().is_some() || status.fatal_sig().is_some() {
            // The task is gone; the register cache holds its last state.
            return;
        }

        self.ticks += self.hpc.read_ticks();
        self.hpc.stop_counting();
        self.refresh_regs();
    }

    pub fn is_stopped(&self) -> bool {
        self.is_stopped
    }

    pub fn status(&self) -> WaitStatus {
        self.wait_status
    }

    pub fn ptrace_event(&self) -> Option<u32> {
        self.wait_status.ptrace_event()
    }

    pub fn seen_ptrace_exit_event(&self) -> bool {
        self.seen_ptrace_exit_event
    }

    /// Resume until the kernel-entry or kernel-exit syscall stop.
    pub fn advance_syscall(&mut self) {
        loop {
            self.resume_execution(
                ResumeRequest::ResumeSyscall,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeNoTicks,
                None,
            );
            if self.status().is_syscall() {
                return;
            }
            if self.status().exit_code().is_some() || self.status().fatal_sig().is_some() {
                fatal!("Task {} died while advancing to a syscall stop", self.tid);
            }
            // Stray signal; swallow it and keep going.
            log!(
                LogDebug,
                "task {} got {} while advancing to syscall",
                self.tid,
                self.status()
            );
        }
    }

    pub fn get_siginfo(&self) -> libc::siginfo_t {
        let mut si: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let ret = unsafe {
            libc::ptrace(
                PTRACE_GETSIGINFO,
                self.tid,
                ptr::null_mut::<u8>(),
                &mut si as *mut _,
            )
        };
        if ret < 0 {
            log!(LogWarn, "Can't read siginfo of task {}", self.tid);
        }
        si
    }

    /// Determine why the task stopped with SIGTRAP, consuming the hardware
    /// debug status. When the watchpoint bit is set, the caller follows up
    /// with `vm().notify_watchpoint_fired(t, t.last_debug_status())` to
    /// attribute the hit.
    pub fn compute_trap_reasons(&mut self) -> TrapReasons {
        let status = DebugStatus::from_bits_truncate(self.consume_debug_status());
        self.last_debug_status.set(status);
        let mut reasons = TrapReasons {
            singlestep: status.contains(DebugStatus::DS_SINGLESTEP),
            watchpoint: status.intersects(DebugStatus::DS_WATCHPOINT_ANY),
            breakpoint: false,
        };

        let ip = self.ip();
        if ip.as_usize() >= 1 {
            reasons.breakpoint = self
                .vm()
                .get_breakpoint_type_for_retired_insn(ip)
                != crate::session::address_space::BreakpointType::BkptNone;
        }
        reasons
    }

    pub fn last_debug_status(&self) -> DebugStatus {
        self.last_debug_status.get()
    }

    fn consume_debug_status(&self) -> usize {
        let offset = crate::bindings::kernel::DEBUG_STATUS_USER_OFFSET;
        let status = unsafe {
            libc::ptrace(
                PTRACE_PEEKUSER,
                self.tid,
                offset as *mut libc::c_void,
                ptr::null_mut::<u8>(),
            )
        };
        unsafe {
            libc::ptrace(
                PTRACE_POKEUSER,
                self.tid,
                offset as *mut libc::c_void,
                ptr::null_mut::<u8>(),
            )
        };
        if status < 0 {
            0
        } else {
            status as usize
        }
    }

    /// Program the four hardware watch slots.
    pub fn set_debug_regs(&self, assignments: &[crate::session::address_space::DebugRegAssignment]) -> bool {
        // DR7 layout: local-enable bits at 2*i, type/len fields at
        // 16 + 4*i.
        let mut dr7: usize = 0;
        for (i, a) in assignments.iter().enumerate().take(4) {
            let type_bits: usize = match a.type_ {
                crate::session::address_space::WatchType::Exec => 0b00,
                crate::session::address_space::WatchType::Write => 0b01,
                crate::session::address_space::WatchType::ReadWrite => 0b11,
            };
            let len_bits: usize = match a.num_bytes {
                1 => 0b00,
                2 => 0b01,
                8 => 0b10,
                4 => 0b11,
                _ => return false,
            };
            let ret = unsafe {
                libc::ptrace(
                    PTRACE_POKEUSER,
                    self.tid,
                    debugreg_user_offset(i) as *mut libc::c_void,
                    a.addr.as_usize() as *mut libc::c_void,
                )
            };
            if ret < 0 {
                return false;
            }
            dr7 |= 1 << (2 * i);
            dr7 |= (type_bits | (len_bits << 2)) << (16 + 4 * i);
        }

        let ret = unsafe {
            libc::ptrace(
                PTRACE_POKEUSER,
                self.tid,
                crate::bindings::kernel::DEBUG_CONTROL_USER_OFFSET as *mut libc::c_void,
                dr7 as *mut libc::c_void,
            )
        };
        ret >= 0
    }

    pub fn move_ip_before_breakpoint(&mut self) {
        let ip = self.ip().decrement_by_bytes(1);
        self.regs_mut().set_ip(ip);
        self.flush_regs();
    }

    /// Number of bytes to step $ip back to re-execute a syscall
    /// instruction.
    pub fn syscall_instruction_length(&self) -> usize {
        syscall_instruction_length(self.arch())
    }

    // --- Tracee memory ----------------------------------------------------

    fn open_mem_fd_if_needed(&self) {
        if self.mem_fd.borrow().is_open() {
            return;
        }
        let path = OsString::from(format!("/proc/{}/mem", self.tid));
        let fd = ScopedFd::open_path(&path, OFlag::O_RDWR | OFlag::O_CLOEXEC);
        if !fd.is_open() {
            fatal!("Can't open {:?}", path);
        }
        *self.mem_fd.borrow_mut() = fd;
    }

    /// Drop the cached mem fd; required after exec.
    pub fn post_exec_mem_fd_refresh(&self) {
        self.mem_fd.borrow_mut().close();
    }

    pub fn read_bytes_fallible(&self, addr: RemotePtr<Void>, buf: &mut [u8]) -> bool {
        if buf.is_empty() {
            return true;
        }
        self.open_mem_fd_if_needed();
        match pread_all_fallible(self.mem_fd.borrow().as_raw(), buf, addr.as_usize() as isize) {
            Ok(n) if n == buf.len() => {
                // Breakpoint bytes we planted must never leak to readers.
                if let Some(vm) = self.vm_.as_ref() {
                    vm.replace_breakpoints_with_original_values(buf, addr);
                }
                true
            }
            _ => false,
        }
    }

    pub fn read_bytes_helper(&self, addr: RemotePtr<Void>, buf: &mut [u8]) {
        if !self.read_bytes_fallible(addr, buf) {
            fatal!(
                "Can't read {} bytes at {} from task {}",
                buf.len(),
                addr,
                self.tid
            );
        }
    }

    pub fn write_bytes_careful(&self, addr: RemotePtr<Void>, buf: &[u8]) -> bool {
        if buf.is_empty() {
            return true;
        }
        self.open_mem_fd_if_needed();
        matches!(
            pwrite_all_fallible(self.mem_fd.borrow().as_raw(), buf, addr.as_usize() as isize),
            Ok(n) if n == buf.len()
        )
    }

    pub fn write_bytes_helper(&self, addr: RemotePtr<Void>, buf: &[u8]) {
        if !self.write_bytes_careful(addr, buf) {
            fatal!(
                "Can't write {} bytes at {} to task {}",
                buf.len(),
                addr,
                self.tid
            );
        }
    }

    /// Read a NUL-terminated string out of the tracee.
    pub fn read_c_str(&self, addr: RemotePtr<u8>) -> OsString {
        let mut result: Vec<u8> = Vec::new();
        let mut p = addr.to_data_ptr();
        loop {
            let mut chunk = [0u8; 256];
            // Don't cross a page boundary in one read; the next page may be
            // unmapped.
            let bytes_to_page_end = crate::util::page_size() - (p.as_usize() % crate::util::page_size());
            let len = std::cmp::min(chunk.len(), bytes_to_page_end);
            if !self.read_bytes_fallible(p, &mut chunk[..len]) {
                fatal!("Can't read c string at {} in task {}", addr, self.tid);
            }
            if let Some(nul) = chunk[..len].iter().position(|&b| b == 0) {
                result.extend_from_slice(&chunk[..nul]);
                return OsString::from_vec(result);
            }
            result.extend_from_slice(&chunk[..len]);
            p = p + len;
        }
    }

    // --- Spawn ------------------------------------------------------------

    /// Fork-and-exec a tracee that stops at its execve, traced by us.
    /// The child installs the instruction-pointer seccomp filter before
    /// exec, so buffered syscalls issued from the untraced entry point never
    /// trap to us.
    pub fn spawn_tracee(exe: &OsStr, argv: &[OsString], envp: &[OsString]) -> pid_t {
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                unsafe {
                    libc::ptrace(PTRACE_TRACEME, 0, ptr::null_mut::<u8>(), ptr::null_mut::<u8>());
                    // Make the supervisor's death take the tracee with it.
                    libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
                    libc::raise(libc::SIGSTOP);
                }
                install_ip_seccomp_filter();

                let c_exe = CString::new(exe.as_bytes()).unwrap();
                let c_argv: Vec<CString> = argv
                    .iter()
                    .map(|a| CString::new(a.as_bytes()).unwrap())
                    .collect();
                let c_envp: Vec<CString> = envp
                    .iter()
                    .map(|e| CString::new(e.as_bytes()).unwrap())
                    .collect();
                let c_argv_refs: Vec<&CStr> = c_argv.iter().map(|a| a.as_c_str()).collect();
                let c_envp_refs: Vec<&CStr> = c_envp.iter().map(|e| e.as_c_str()).collect();
                let _ = execve(&c_exe, &c_argv_refs, &c_envp_refs);
                // Only reached on exec failure.
                unsafe { libc::_exit(127) };
            }
            Ok(ForkResult::Parent { child }) => {
                let pid = child.as_raw();
                wait_for_initial_stop(child);
                set_ptrace_options(pid);
                pid
            }
            Err(e) => fatal!("fork failed: {}", e),
        }
    }
}

/// The untraced syscall instruction end address: the seccomp filter admits
/// kernel entries whose ip matches this and traps everything else to us.
fn untraced_syscall_end_ip() -> u64 {
    (RETRACE_PAGE_SYSCALL_UNTRACED + RETRACE_PAGE_SYSCALL_INSTRUCTION_END) as u64
}

#[repr(C)]
struct sock_filter {
    code: u16,
    jt: u8,
    jf: u8,
    k: u32,
}

#[repr(C)]
struct sock_fprog {
    len: u16,
    filter: *const sock_filter,
}

const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_TRACE: u32 = 0x7ff0_0000;

/// offsetof(struct seccomp_data, instruction_pointer)
const SECCOMP_DATA_IP_OFFSET: u32 = 8;

fn install_ip_seccomp_filter() {
    let ip = untraced_syscall_end_ip();
    let ip_low = ip as u32;
    let ip_high = (ip >> 32) as u32;

    let filter = [
        // A = instruction_pointer (low word)
        sock_filter { code: BPF_LD | BPF_W | BPF_ABS, jt: 0, jf: 0, k: SECCOMP_DATA_IP_OFFSET },
        sock_filter { code: BPF_JMP | BPF_JEQ | BPF_K, jt: 0, jf: 3, k: ip_low },
        // A = instruction_pointer (high word)
        sock_filter { code: BPF_LD | BPF_W | BPF_ABS, jt: 0, jf: 0, k: SECCOMP_DATA_IP_OFFSET + 4 },
        sock_filter { code: BPF_JMP | BPF_JEQ | BPF_K, jt: 0, jf: 1, k: ip_high },
        sock_filter { code: BPF_RET | BPF_K, jt: 0, jf: 0, k: SECCOMP_RET_ALLOW },
        sock_filter { code: BPF_RET | BPF_K, jt: 0, jf: 0, k: SECCOMP_RET_TRACE },
    ];
    let prog = sock_fprog {
        len: filter.len() as u16,
        filter: filter.as_ptr(),
    };

    unsafe {
        if libc::prctl(PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
            libc::_exit(126);
        }
        if libc::prctl(libc::PR_SET_SECCOMP, SECCOMP_MODE_FILTER, &prog as *const sock_fprog) != 0
        {
            libc::_exit(126);
        }
    }
}

fn wait_for_initial_stop(child: Pid) {
    let mut raw_status: i32 = 0;
    let ret = unsafe { libc::waitpid(child.as_raw(), &mut raw_status, __WALL) };
    if ret != child.as_raw() {
        fatal!("waitpid on spawned tracee failed");
    }
    let status = WaitStatus::new(raw_status);
    if status.stop_sig() != Some(crate::sig::SIGSTOP) {
        fatal!("Spawned tracee stopped with unexpected status {}", status);
    }
}

fn set_ptrace_options(pid: pid_t) {
    let options: usize = (libc::PTRACE_O_TRACESYSGOOD
        | libc::PTRACE_O_TRACEEXEC
        | libc::PTRACE_O_TRACECLONE
        | libc::PTRACE_O_TRACEFORK
        | libc::PTRACE_O_TRACEVFORK
        | libc::PTRACE_O_TRACEEXIT
        | libc::PTRACE_O_TRACESECCOMP
        | libc::PTRACE_O_EXITKILL) as usize;
    let ret = unsafe {
        libc::ptrace(
            PTRACE_SETOPTIONS,
            pid,
            ptr::null_mut::<u8>(),
            options as *mut libc::c_void,
        )
    };
    if ret < 0 {
        fatal!("Can't set ptrace options on tracee {}", pid);
    }
}

