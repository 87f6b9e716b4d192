//! The architecture tag and the per-architecture system call tables.
//!
//! Every event carries a `SupportedArch`; it is the single source of truth
//! for decoding per-architecture payloads. Nothing here assumes that the
//! supervisor's native width equals the tracee's.

#![allow(non_camel_case_types)]

use std::fmt::{Display, Formatter, Result};

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum SupportedArch {
    X86,
    X64,
}

#[cfg(target_arch = "x86_64")]
pub const RETRACE_NATIVE_ARCH: SupportedArch = SupportedArch::X64;

#[cfg(target_arch = "x86")]
pub const RETRACE_NATIVE_ARCH: SupportedArch = SupportedArch::X86;

impl Default for SupportedArch {
    fn default() -> Self {
        RETRACE_NATIVE_ARCH
    }
}

impl Display for SupportedArch {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            SupportedArch::X86 => write!(f, "x86"),
            SupportedArch::X64 => write!(f, "x86_64"),
        }
    }
}

/// Dispatch `$func_name` to the per-arch module named by `$arch`.
macro_rules! retrace_arch_function {
    ($func_name:ident, $arch:expr) => {
        match $arch {
            crate::kernel_abi::SupportedArch::X86 => crate::kernel_abi::x86::$func_name(),
            crate::kernel_abi::SupportedArch::X64 => crate::kernel_abi::x64::$func_name(),
        }
    };
    ($func_name:ident, $arch:expr, $($exp:expr),+) => {
        match $arch {
            crate::kernel_abi::SupportedArch::X86 => crate::kernel_abi::x86::$func_name($($exp),+),
            crate::kernel_abi::SupportedArch::X64 => crate::kernel_abi::x64::$func_name($($exp),+),
        }
    };
}

/// Both supported architectures encode `syscall`/`int 0x80` in two bytes.
pub fn syscall_instruction_length(_arch: SupportedArch) -> usize {
    2
}

macro_rules! syscall_consts {
    ($(($name:ident, $x86no:expr, $x64no:expr)),+ $(,)?) => {
        pub mod x86_syscall {
            $(pub const $name: i32 = $x86no;)+
        }
        pub mod x64_syscall {
            $(pub const $name: i32 = $x64no;)+
        }

        /// The name of syscall `no` on `arch`, or `<unknown-syscall-N>`.
        pub fn syscall_name(no: i32, arch: SupportedArch) -> String {
            match arch {
                SupportedArch::X86 => {
                    $(if no == x86_syscall::$name { return stringify!($name).to_lowercase(); })+
                }
                SupportedArch::X64 => {
                    $(if no == x64_syscall::$name { return stringify!($name).to_lowercase(); })+
                }
            }
            format!("<unknown-syscall-{}>", no)
        }
    };
}

// -1 marks a syscall that does not exist on that architecture (x86 routes
// most socket operations through `socketcall`).
syscall_consts![
    (RESTART_SYSCALL, 0, 219),
    (EXIT, 1, 60),
    (FORK, 2, 57),
    (READ, 3, 0),
    (WRITE, 4, 1),
    (OPEN, 5, 2),
    (CLOSE, 6, 3),
    (CREAT, 8, 85),
    (EXECVE, 11, 59),
    (TIME, 13, 201),
    (GETPID, 20, 39),
    (ACCESS, 33, 21),
    (KILL, 37, 62),
    (BRK, 45, 12),
    (IOCTL, 54, 16),
    (FCNTL, 55, 72),
    (GETTIMEOFDAY, 78, 96),
    (READLINK, 85, 89),
    (MUNMAP, 91, 11),
    (SOCKETCALL, 102, -1),
    (WAIT4, 114, 61),
    (SIGRETURN, 119, -1),
    (CLONE, 120, 56),
    (MPROTECT, 125, 10),
    (FCHDIR, 133, 81),
    (WRITEV, 146, 20),
    (SCHED_YIELD, 158, 24),
    (MREMAP, 163, 25),
    (POLL, 168, 7),
    (RT_SIGRETURN, 173, 15),
    (RT_SIGACTION, 174, 13),
    (RT_SIGPROCMASK, 175, 14),
    (VFORK, 190, 58),
    (MMAP2, 192, -1),
    (MMAP, 90, 9),
    (STAT, 195, 4),
    (LSTAT, 196, 6),
    (FSTAT, 197, 5),
    (MADVISE, 219, 28),
    (FCNTL64, 221, -1),
    (GETTID, 224, 186),
    (FUTEX, 240, 202),
    (EXIT_GROUP, 252, 231),
    (CLOCK_GETTIME, 265, 228),
    (TGKILL, 270, 234),
    (SOCKET, -1, 41),
    (CONNECT, -1, 42),
    (RECVFROM, -1, 45),
    (SENDMSG, -1, 46),
    (RECVMSG, -1, 47),
    (LSEEK, 19, 8),
    (PERF_EVENT_OPEN, 336, 298),
];

fn table(arch: SupportedArch) -> ArchSyscalls {
    match arch {
        SupportedArch::X86 => ArchSyscalls { is_x86: true },
        SupportedArch::X64 => ArchSyscalls { is_x86: false },
    }
}

#[derive(Copy, Clone)]
struct ArchSyscalls {
    is_x86: bool,
}

macro_rules! per_arch_number {
    ($fn_name:ident, $const_name:ident) => {
        pub fn $fn_name(arch: SupportedArch) -> i32 {
            if table(arch).is_x86 {
                x86_syscall::$const_name
            } else {
                x64_syscall::$const_name
            }
        }
    };
}

per_arch_number!(syscall_number_for_restart_syscall, RESTART_SYSCALL);
per_arch_number!(syscall_number_for_read, READ);
per_arch_number!(syscall_number_for_write, WRITE);
per_arch_number!(syscall_number_for_open, OPEN);
per_arch_number!(syscall_number_for_close, CLOSE);
per_arch_number!(syscall_number_for_execve, EXECVE);
per_arch_number!(syscall_number_for_exit, EXIT);
per_arch_number!(syscall_number_for_exit_group, EXIT_GROUP);
per_arch_number!(syscall_number_for_munmap, MUNMAP);
per_arch_number!(syscall_number_for_mprotect, MPROTECT);
per_arch_number!(syscall_number_for_fcntl, FCNTL);
per_arch_number!(syscall_number_for_fchdir, FCHDIR);
per_arch_number!(syscall_number_for_gettid, GETTID);
per_arch_number!(syscall_number_for_sched_yield, SCHED_YIELD);
per_arch_number!(syscall_number_for_ioctl, IOCTL);
per_arch_number!(syscall_number_for_futex, FUTEX);
per_arch_number!(syscall_number_for_clock_gettime, CLOCK_GETTIME);

pub fn syscall_number_for_mmap(arch: SupportedArch) -> i32 {
    match arch {
        SupportedArch::X86 => x86_syscall::MMAP2,
        SupportedArch::X64 => x64_syscall::MMAP,
    }
}

pub fn syscall_number_for_socket(arch: SupportedArch) -> i32 {
    debug_assert!(!has_socketcall_syscall(arch));
    x64_syscall::SOCKET
}

pub fn syscall_number_for_connect(arch: SupportedArch) -> i32 {
    debug_assert!(!has_socketcall_syscall(arch));
    x64_syscall::CONNECT
}

pub fn syscall_number_for_sendmsg(arch: SupportedArch) -> i32 {
    debug_assert!(!has_socketcall_syscall(arch));
    x64_syscall::SENDMSG
}

pub fn syscall_number_for_socketcall(arch: SupportedArch) -> i32 {
    debug_assert!(has_socketcall_syscall(arch));
    x86_syscall::SOCKETCALL
}

pub fn has_mmap2_syscall(arch: SupportedArch) -> bool {
    arch == SupportedArch::X86
}

pub fn has_socketcall_syscall(arch: SupportedArch) -> bool {
    arch == SupportedArch::X86
}

pub fn is_sigreturn_syscall(no: i32, arch: SupportedArch) -> bool {
    match arch {
        SupportedArch::X86 => no == x86_syscall::SIGRETURN || no == x86_syscall::RT_SIGRETURN,
        SupportedArch::X64 => no == x64_syscall::RT_SIGRETURN,
    }
}

pub fn is_execve_syscall(no: i32, arch: SupportedArch) -> bool {
    no == per_arch(arch, x86_syscall::EXECVE, x64_syscall::EXECVE)
}

pub fn is_exit_syscall(no: i32, arch: SupportedArch) -> bool {
    no == per_arch(arch, x86_syscall::EXIT, x64_syscall::EXIT)
}

pub fn is_exit_group_syscall(no: i32, arch: SupportedArch) -> bool {
    no == per_arch(arch, x86_syscall::EXIT_GROUP, x64_syscall::EXIT_GROUP)
}

pub fn is_restart_syscall_syscall(no: i32, arch: SupportedArch) -> bool {
    no == per_arch(arch, x86_syscall::RESTART_SYSCALL, x64_syscall::RESTART_SYSCALL)
}

pub fn is_sched_yield_syscall(no: i32, arch: SupportedArch) -> bool {
    no == per_arch(arch, x86_syscall::SCHED_YIELD, x64_syscall::SCHED_YIELD)
}

pub fn is_clone_syscall(no: i32, arch: SupportedArch) -> bool {
    no == per_arch(arch, x86_syscall::CLONE, x64_syscall::CLONE)
}

pub fn is_fork_syscall(no: i32, arch: SupportedArch) -> bool {
    no == per_arch(arch, x86_syscall::FORK, x64_syscall::FORK)
}

fn per_arch(arch: SupportedArch, x86no: i32, x64no: i32) -> i32 {
    match arch {
        SupportedArch::X86 => x86no,
        SupportedArch::X64 => x64no,
    }
}

/// Per-architecture user register file layouts, as ptrace reports them.
pub mod x86 {
    #[repr(C)]
    #[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
    pub struct user_regs_struct {
        pub ebx: i32,
        pub ecx: i32,
        pub edx: i32,
        pub esi: i32,
        pub edi: i32,
        pub ebp: i32,
        pub eax: i32,
        pub xds: i32,
        pub xes: i32,
        pub xfs: i32,
        pub xgs: i32,
        pub orig_eax: i32,
        pub eip: i32,
        pub xcs: i32,
        pub eflags: i32,
        pub esp: i32,
        pub xss: i32,
    }
}

pub mod x64 {
    #[repr(C)]
    #[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
    pub struct user_regs_struct {
        pub r15: u64,
        pub r14: u64,
        pub r13: u64,
        pub r12: u64,
        pub rbp: u64,
        pub rbx: u64,
        pub r11: u64,
        pub r10: u64,
        pub r9: u64,
        pub r8: u64,
        pub rax: u64,
        pub rcx: u64,
        pub rdx: u64,
        pub rsi: u64,
        pub rdi: u64,
        pub orig_rax: u64,
        pub rip: u64,
        pub cs: u64,
        pub eflags: u64,
        pub rsp: u64,
        pub ss: u64,
        pub fs_base: u64,
        pub gs_base: u64,
        pub ds: u64,
        pub es: u64,
        pub fs: u64,
        pub gs: u64,
    }
}

#[cfg(target_arch = "x86_64")]
assert_eq_size!(x64::user_regs_struct, libc::user_regs_struct);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn native_arch_round_trip() {
        assert_eq!(
            "read",
            syscall_name(syscall_number_for_read(SupportedArch::X64), SupportedArch::X64)
        );
        assert_eq!(
            "read",
            syscall_name(syscall_number_for_read(SupportedArch::X86), SupportedArch::X86)
        );
    }

    #[test]
    fn sigreturn_detection() {
        assert!(is_sigreturn_syscall(15, SupportedArch::X64));
        assert!(is_sigreturn_syscall(119, SupportedArch::X86));
        assert!(!is_sigreturn_syscall(15, SupportedArch::X86));
    }

    #[test]
    fn mmap_selection() {
        assert_eq!(x86_syscall::MMAP2, syscall_number_for_mmap(SupportedArch::X86));
        assert_eq!(x64_syscall::MMAP, syscall_number_for_mmap(SupportedArch::X64));
    }
}
