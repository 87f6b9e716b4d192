//! The architecture-tagged register file.
//!
//! A `Registers` value carries the tracee's general-purpose registers plus
//! the architecture tag needed to interpret them. Comparisons between a
//! recorded and a live register file go through `compare_register_files`,
//! which masks the bits that legitimately differ between record and replay.

use crate::{
    kernel_abi::{x64, x86, SupportedArch},
    kernel_metadata::syscall_name,
    log::LogLevel::LogError,
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::{RemotePtr, Void},
};
use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    io,
    io::Write,
};

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum MismatchBehavior {
    ExpectMismatches,
    LogMismatches,
    BailOnMismatch,
}

/// x86 condition flag bits that are allowed to differ between record and
/// replay. RF is set by the CPU after a debug exception; IF reflects
/// interrupt delivery the tracee can't observe; ID is toggled freely by
/// CPUID-feature probes; bit 1 is reserved-always-one on some steppings.
const X86_RESERVED_FLAG: u64 = 1 << 1;
const X86_IF_FLAG: u64 = 1 << 9;
const X86_RF_FLAG: u64 = 1 << 16;
const X86_ID_FLAG: u64 = 1 << 21;

const FLAGS_COMPARE_MASK: u64 = !(X86_RESERVED_FLAG | X86_IF_FLAG | X86_RF_FLAG | X86_ID_FLAG);

#[repr(C)]
#[derive(Copy, Clone)]
pub union RegistersUnion {
    x86: x86::user_regs_struct,
    x64: x64::user_regs_struct,
}

impl Default for RegistersUnion {
    fn default() -> Self {
        RegistersUnion {
            x64: x64::user_regs_struct::default(),
        }
    }
}

macro_rules! retrace_get_reg {
    ($slf:expr, $x86case:ident, $x64case:ident) => {
        unsafe {
            match $slf.arch_ {
                crate::kernel_abi::SupportedArch::X86 => $slf.u.x86.$x86case as u32 as usize,
                crate::kernel_abi::SupportedArch::X64 => $slf.u.x64.$x64case as usize,
            }
        }
    };
}

macro_rules! retrace_set_reg {
    ($slf:expr, $x86case:ident, $x64case:ident, $val:expr) => {
        match $slf.arch_ {
            crate::kernel_abi::SupportedArch::X86 => {
                $slf.u.x86.$x86case = $val as i32;
            }
            crate::kernel_abi::SupportedArch::X64 => {
                $slf.u.x64.$x64case = $val as u64;
            }
        }
    };
}

macro_rules! retrace_get_reg_signed {
    ($slf:expr, $x86case:ident, $x64case:ident) => {
        rd_sign_extend!($slf, retrace_get_reg!($slf, $x86case, $x64case))
    };
}

macro_rules! rd_sign_extend {
    ($slf:expr, $val:expr) => {
        match $slf.arch_ {
            crate::kernel_abi::SupportedArch::X86 => $val as u32 as i32 as isize,
            crate::kernel_abi::SupportedArch::X64 => $val as isize,
        }
    };
}

#[derive(Copy, Clone)]
pub struct Registers {
    arch_: SupportedArch,
    u: RegistersUnion,
}

impl Registers {
    pub fn new(arch: SupportedArch) -> Registers {
        Registers {
            arch_: arch,
            u: RegistersUnion::default(),
        }
    }

    pub fn arch(&self) -> SupportedArch {
        self.arch_
    }

    pub fn set_arch(&mut self, arch: SupportedArch) {
        self.arch_ = arch;
    }

    pub fn ip(&self) -> RemoteCodePtr {
        RemoteCodePtr::new(retrace_get_reg!(self, eip, rip))
    }

    pub fn set_ip(&mut self, addr: RemoteCodePtr) {
        retrace_set_reg!(self, eip, rip, addr.as_usize());
    }

    pub fn sp(&self) -> RemotePtr<Void> {
        RemotePtr::new(retrace_get_reg!(self, esp, rsp))
    }

    pub fn set_sp(&mut self, addr: RemotePtr<Void>) {
        retrace_set_reg!(self, esp, rsp, addr.as_usize());
    }

    /// The syscall number in the current syscall-entry register.
    pub fn syscallno(&self) -> isize {
        retrace_get_reg_signed!(self, eax, rax)
    }

    pub fn set_syscallno(&mut self, syscallno: isize) {
        retrace_set_reg!(self, eax, rax, syscallno);
    }

    /// The syscall number as it was on entry to the kernel, preserved by
    /// ptrace even after the result register is overwritten.
    pub fn original_syscallno(&self) -> isize {
        retrace_get_reg_signed!(self, orig_eax, orig_rax)
    }

    pub fn set_original_syscallno(&mut self, syscallno: isize) {
        retrace_set_reg!(self, orig_eax, orig_rax, syscallno);
    }

    pub fn syscall_result(&self) -> usize {
        retrace_get_reg!(self, eax, rax)
    }

    pub fn syscall_result_signed(&self) -> isize {
        retrace_get_reg_signed!(self, eax, rax)
    }

    pub fn set_syscall_result(&mut self, result: usize) {
        retrace_set_reg!(self, eax, rax, result);
    }

    pub fn set_syscall_result_signed(&mut self, result: isize) {
        retrace_set_reg!(self, eax, rax, result);
    }

    /// Whether the syscall result register holds a kernel error return.
    pub fn syscall_failed(&self) -> bool {
        let result = self.syscall_result_signed();
        -4096 < result && result < 0
    }

    /// Whether the result register holds a syscall-restart error.
    pub fn syscall_may_restart(&self) -> bool {
        matches!(
            -self.syscall_result_signed() as i32,
            ERESTART_RESTARTBLOCK | ERESTARTNOHAND | ERESTARTNOINTR | ERESTARTSYS
        )
    }

    pub fn arg1(&self) -> usize {
        retrace_get_reg!(self, ebx, rdi)
    }
    pub fn arg2(&self) -> usize {
        retrace_get_reg!(self, ecx, rsi)
    }
    pub fn arg3(&self) -> usize {
        retrace_get_reg!(self, edx, rdx)
    }
    pub fn arg4(&self) -> usize {
        retrace_get_reg!(self, esi, r10)
    }
    pub fn arg5(&self) -> usize {
        retrace_get_reg!(self, edi, r8)
    }
    pub fn arg6(&self) -> usize {
        retrace_get_reg!(self, ebp, r9)
    }

    pub fn arg1_signed(&self) -> isize {
        retrace_get_reg_signed!(self, ebx, rdi)
    }
    pub fn arg3_signed(&self) -> isize {
        retrace_get_reg_signed!(self, edx, rdx)
    }

    pub fn set_arg1(&mut self, value: usize) {
        retrace_set_reg!(self, ebx, rdi, value);
    }
    pub fn set_arg2(&mut self, value: usize) {
        retrace_set_reg!(self, ecx, rsi, value);
    }
    pub fn set_arg3(&mut self, value: usize) {
        retrace_set_reg!(self, edx, rdx, value);
    }
    pub fn set_arg4(&mut self, value: usize) {
        retrace_set_reg!(self, esi, r10, value);
    }
    pub fn set_arg5(&mut self, value: usize) {
        retrace_set_reg!(self, edi, r8, value);
    }
    pub fn set_arg6(&mut self, value: usize) {
        retrace_set_reg!(self, ebp, r9, value);
    }

    pub fn arg(&self, index: usize) -> usize {
        match index {
            1 => self.arg1(),
            2 => self.arg2(),
            3 => self.arg3(),
            4 => self.arg4(),
            5 => self.arg5(),
            6 => self.arg6(),
            _ => fatal!("Argument index {} out of range", index),
        }
    }

    pub fn set_arg(&mut self, index: usize, value: usize) {
        match index {
            1 => self.set_arg1(value),
            2 => self.set_arg2(value),
            3 => self.set_arg3(value),
            4 => self.set_arg4(value),
            5 => self.set_arg5(value),
            6 => self.set_arg6(value),
            _ => fatal!("Argument index {} out of range", index),
        }
    }

    pub fn flags(&self) -> usize {
        retrace_get_reg!(self, eflags, eflags)
    }

    pub fn set_flags(&mut self, value: usize) {
        retrace_set_reg!(self, eflags, eflags, value);
    }

    /// Whether the trap flag (single-step) is set.
    pub fn singlestep_flag(&self) -> bool {
        self.flags() & (1 << 8) != 0
    }

    /// Execution state as the ptrace layout for the native architecture.
    pub fn get_ptrace(&self) -> x64::user_regs_struct {
        match self.arch_ {
            SupportedArch::X64 => unsafe { self.u.x64 },
            SupportedArch::X86 => widen_x86(unsafe { &self.u.x86 }),
        }
    }

    pub fn get_ptrace_for_self_arch(&self) -> &[u8] {
        match self.arch_ {
            SupportedArch::X86 => unsafe {
                std::slice::from_raw_parts(
                    &self.u.x86 as *const x86::user_regs_struct as *const u8,
                    std::mem::size_of::<x86::user_regs_struct>(),
                )
            },
            SupportedArch::X64 => unsafe {
                std::slice::from_raw_parts(
                    &self.u.x64 as *const x64::user_regs_struct as *const u8,
                    std::mem::size_of::<x64::user_regs_struct>(),
                )
            },
        }
    }

    pub fn set_from_ptrace(&mut self, native: &x64::user_regs_struct) {
        match self.arch_ {
            SupportedArch::X64 => self.u.x64 = *native,
            SupportedArch::X86 => self.u.x86 = narrow_x64(native),
        }
    }

    /// Restore from the raw byte image written to a trace frame.
    pub fn set_from_trace_raw(&mut self, arch: SupportedArch, data: &[u8]) {
        self.arch_ = arch;
        match arch {
            SupportedArch::X86 => {
                debug_assert_eq!(data.len(), std::mem::size_of::<x86::user_regs_struct>());
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        &mut self.u.x86 as *mut x86::user_regs_struct as *mut u8,
                        data.len(),
                    );
                }
            }
            SupportedArch::X64 => {
                debug_assert_eq!(data.len(), std::mem::size_of::<x64::user_regs_struct>());
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        &mut self.u.x64 as *mut x64::user_regs_struct as *mut u8,
                        data.len(),
                    );
                }
            }
        }
    }

    /// Bitwise equality under the per-register comparison masks.
    pub fn matches(&self, other: &Registers) -> bool {
        compare_register_files("", self, "", other, MismatchBehavior::ExpectMismatches)
    }

    pub fn write_register_file_compact(&self, out: &mut dyn Write) -> io::Result<()> {
        match self.arch_ {
            SupportedArch::X86 => {
                let r = unsafe { &self.u.x86 };
                write!(
                    out,
                    "eax:{:#x} ebx:{:#x} ecx:{:#x} edx:{:#x} esi:{:#x} edi:{:#x} ebp:{:#x} \
                     esp:{:#x} eip:{:#x} eflags:{:#x}",
                    r.eax, r.ebx, r.ecx, r.edx, r.esi, r.edi, r.ebp, r.esp, r.eip, r.eflags
                )
            }
            SupportedArch::X64 => {
                let r = unsafe { &self.u.x64 };
                write!(
                    out,
                    "rax:{:#x} rbx:{:#x} rcx:{:#x} rdx:{:#x} rsi:{:#x} rdi:{:#x} rbp:{:#x} \
                     rsp:{:#x} rip:{:#x} r8:{:#x} r9:{:#x} r10:{:#x} r11:{:#x} r12:{:#x} \
                     r13:{:#x} r14:{:#x} r15:{:#x} eflags:{:#x}",
                    r.rax,
                    r.rbx,
                    r.rcx,
                    r.rdx,
                    r.rsi,
                    r.rdi,
                    r.rbp,
                    r.rsp,
                    r.rip,
                    r.r8,
                    r.r9,
                    r.r10,
                    r.r11,
                    r.r12,
                    r.r13,
                    r.r14,
                    r.r15,
                    r.eflags
                )
            }
        }
    }
}

impl Default for Registers {
    fn default() -> Self {
        Registers::new(SupportedArch::default())
    }
}

impl Debug for Registers {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let mut buf: Vec<u8> = Vec::new();
        self.write_register_file_compact(&mut buf).unwrap();
        write!(
            f,
            "Registers<{}> {{ {} }}",
            self.arch_,
            String::from_utf8_lossy(&buf)
        )
    }
}

// Syscall-restart errnos, not exported by libc.
pub const ERESTARTSYS: i32 = 512;
pub const ERESTARTNOINTR: i32 = 513;
pub const ERESTARTNOHAND: i32 = 514;
pub const ERESTART_RESTARTBLOCK: i32 = 516;

fn widen_x86(r: &x86::user_regs_struct) -> x64::user_regs_struct {
    let mut out = x64::user_regs_struct::default();
    out.rbx = r.ebx as u32 as u64;
    out.rcx = r.ecx as u32 as u64;
    out.rdx = r.edx as u32 as u64;
    out.rsi = r.esi as u32 as u64;
    out.rdi = r.edi as u32 as u64;
    out.rbp = r.ebp as u32 as u64;
    out.rax = r.eax as u32 as u64;
    out.orig_rax = r.orig_eax as i64 as u64;
    out.rip = r.eip as u32 as u64;
    out.eflags = r.eflags as u32 as u64;
    out.rsp = r.esp as u32 as u64;
    out.cs = r.xcs as u32 as u64;
    out.ss = r.xss as u32 as u64;
    out.ds = r.xds as u32 as u64;
    out.es = r.xes as u32 as u64;
    out.fs = r.xfs as u32 as u64;
    out.gs = r.xgs as u32 as u64;
    out
}

fn narrow_x64(r: &x64::user_regs_struct) -> x86::user_regs_struct {
    let mut out = x86::user_regs_struct::default();
    out.ebx = r.rbx as i32;
    out.ecx = r.rcx as i32;
    out.edx = r.rdx as i32;
    out.esi = r.rsi as i32;
    out.edi = r.rdi as i32;
    out.ebp = r.rbp as i32;
    out.eax = r.rax as i32;
    out.orig_eax = r.orig_rax as i32;
    out.eip = r.rip as i32;
    out.eflags = r.eflags as i32;
    out.esp = r.rsp as i32;
    out.xcs = r.cs as i32;
    out.xss = r.ss as i32;
    out.xds = r.ds as i32;
    out.xes = r.es as i32;
    out.xfs = r.fs as i32;
    out.xgs = r.gs as i32;
    out
}

struct RegCompare {
    name: &'static str,
    val1: u64,
    val2: u64,
    mask: u64,
}

fn collect_regs(r: &Registers) -> Vec<RegCompare> {
    // Segment registers are omitted: they are architecturally constant for
    // the lifetime of a recorded process and ptrace reports stale values for
    // them on some kernels.
    let x = r.get_ptrace();
    vec![
        RegCompare { name: "rax", val1: x.rax, val2: 0, mask: !0 },
        RegCompare { name: "rbx", val1: x.rbx, val2: 0, mask: !0 },
        RegCompare { name: "rcx", val1: x.rcx, val2: 0, mask: !0 },
        RegCompare { name: "rdx", val1: x.rdx, val2: 0, mask: !0 },
        RegCompare { name: "rsi", val1: x.rsi, val2: 0, mask: !0 },
        RegCompare { name: "rdi", val1: x.rdi, val2: 0, mask: !0 },
        RegCompare { name: "rbp", val1: x.rbp, val2: 0, mask: !0 },
        RegCompare { name: "rsp", val1: x.rsp, val2: 0, mask: !0 },
        RegCompare { name: "r8", val1: x.r8, val2: 0, mask: !0 },
        RegCompare { name: "r9", val1: x.r9, val2: 0, mask: !0 },
        RegCompare { name: "r10", val1: x.r10, val2: 0, mask: !0 },
        RegCompare { name: "r11", val1: x.r11, val2: 0, mask: !0 },
        RegCompare { name: "r12", val1: x.r12, val2: 0, mask: !0 },
        RegCompare { name: "r13", val1: x.r13, val2: 0, mask: !0 },
        RegCompare { name: "r14", val1: x.r14, val2: 0, mask: !0 },
        RegCompare { name: "r15", val1: x.r15, val2: 0, mask: !0 },
        RegCompare { name: "rip", val1: x.rip, val2: 0, mask: !0 },
        RegCompare { name: "orig_rax", val1: x.orig_rax, val2: 0, mask: !0 },
        RegCompare { name: "eflags", val1: x.eflags, val2: 0, mask: FLAGS_COMPARE_MASK },
    ]
}

/// Bitwise-compare two register files under the per-register masks. Returns
/// true when they match. With `LogMismatches` or `BailOnMismatch`, each
/// mismatched register is logged at error level; `BailOnMismatch` leaves the
/// decision to abort to the caller (the replay engine treats a mismatch at a
/// frame with execution info as a fatal divergence).
pub fn compare_register_files(
    name1: &str,
    regs1: &Registers,
    name2: &str,
    regs2: &Registers,
    behavior: MismatchBehavior,
) -> bool {
    debug_assert_eq!(regs1.arch(), regs2.arch());
    let mut lhs = collect_regs(regs1);
    let rhs = collect_regs(regs2);
    let mut match_ = true;

    for (l, r) in lhs.iter_mut().zip(rhs.iter()) {
        l.val2 = r.val1;
        if (l.val1 ^ l.val2) & l.mask != 0 {
            match_ = false;
            if behavior != MismatchBehavior::ExpectMismatches {
                log!(
                    LogError,
                    "{} {:#x} != {:#x} ({} vs. {})",
                    l.name,
                    l.val1,
                    l.val2,
                    name1,
                    name2
                );
            }
        }
    }

    match_
}

/// Helper used in trace dumps and debug logging.
pub fn syscall_display(no: isize, arch: SupportedArch) -> String {
    syscall_name(no as i32, arch)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kernel_abi::SupportedArch;

    #[test]
    fn args_round_trip() {
        let mut r = Registers::new(SupportedArch::X64);
        r.set_arg1(1);
        r.set_arg2(2);
        r.set_arg3(3);
        r.set_arg4(4);
        r.set_arg5(5);
        r.set_arg6(6);
        for i in 1..=6 {
            assert_eq!(i, r.arg(i));
        }
    }

    #[test]
    fn ip_and_sp() {
        let mut r = Registers::new(SupportedArch::X64);
        r.set_ip(RemoteCodePtr::new(0x7000_0002));
        r.set_sp(RemotePtr::new(0x7fff_0000));
        assert_eq!(0x7000_0002, r.ip().as_usize());
        assert_eq!(0x7fff_0000, r.sp().as_usize());
    }

    #[test]
    fn syscall_result_sign() {
        let mut r = Registers::new(SupportedArch::X64);
        r.set_syscall_result_signed(-(libc::ENOENT as isize));
        assert!(r.syscall_failed());
        r.set_syscall_result(16);
        assert!(!r.syscall_failed());
    }

    #[test]
    fn x86_results_sign_extend() {
        let mut r = Registers::new(SupportedArch::X86);
        r.set_syscall_result_signed(-(libc::EINVAL as isize));
        assert!(r.syscall_failed());
        assert_eq!(-(libc::EINVAL as isize), r.syscall_result_signed());
    }

    #[test]
    fn comparison_masks_replay_volatile_flags() {
        let mut a = Registers::new(SupportedArch::X64);
        let mut b = Registers::new(SupportedArch::X64);
        a.set_flags(0);
        // RF and IF differ; these are not meaningful divergence.
        b.set_flags((1 << 16) | (1 << 9));
        assert!(compare_register_files(
            "a",
            &a,
            "b",
            &b,
            MismatchBehavior::ExpectMismatches
        ));

        // A zero-flag difference is a real divergence.
        b.set_flags(1 << 6);
        assert!(!compare_register_files(
            "a",
            &a,
            "b",
            &b,
            MismatchBehavior::ExpectMismatches
        ));
    }

    #[test]
    fn comparison_detects_gp_mismatch() {
        let mut a = Registers::new(SupportedArch::X64);
        let b = Registers::new(SupportedArch::X64);
        a.set_arg1(0xdead_beef);
        assert!(!a.matches(&b));
    }
}
