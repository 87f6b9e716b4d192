//! Hand-maintained kernel ABI structures and constants that `libc` does not
//! expose, reduced to the subset this crate needs.

#![allow(non_camel_case_types)]

pub mod perf_event {
    pub const PERF_TYPE_HARDWARE: u32 = 0;
    pub const PERF_TYPE_SOFTWARE: u32 = 1;
    pub const PERF_TYPE_RAW: u32 = 4;

    pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
    pub const PERF_COUNT_SW_CONTEXT_SWITCHES: u64 = 3;

    pub const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
    pub const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
    pub const PERF_EVENT_IOC_RESET: libc::c_ulong = 0x2403;
    pub const PERF_EVENT_IOC_PERIOD: libc::c_ulong = 0x4008_2404;

    /// The subset of `struct perf_event_attr` fields we program. The flag
    /// bitfield words are collapsed into `flags`; bit positions follow the
    /// kernel header.
    #[repr(C)]
    #[derive(Copy, Clone, Default)]
    pub struct perf_event_attr {
        pub type_: u32,
        pub size: u32,
        pub config: u64,
        pub sample_period: u64,
        pub sample_type: u64,
        pub read_format: u64,
        pub flags: u64,
        pub wakeup_events: u32,
        pub bp_type: u32,
        pub bp_addr: u64,
        pub bp_len: u64,
        pub branch_sample_type: u64,
        pub sample_regs_user: u64,
        pub sample_stack_user: u32,
        pub clockid: i32,
        pub sample_regs_intr: u64,
        pub aux_watermark: u32,
        pub __reserved_2: u32,
    }

    /// `attr.disabled`
    pub const ATTR_FLAG_DISABLED: u64 = 1 << 0;
    /// `attr.exclude_kernel`
    pub const ATTR_FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
    /// `attr.exclude_hv`
    pub const ATTR_FLAG_EXCLUDE_HV: u64 = 1 << 6;
    /// `attr.pinned`
    pub const ATTR_FLAG_PINNED: u64 = 1 << 2;

    pub fn ticks_attr(type_: u32, config: u64, period: u64) -> perf_event_attr {
        perf_event_attr {
            type_,
            size: std::mem::size_of::<perf_event_attr>() as u32,
            config,
            sample_period: period,
            flags: ATTR_FLAG_DISABLED | ATTR_FLAG_EXCLUDE_KERNEL | ATTR_FLAG_EXCLUDE_HV,
            ..Default::default()
        }
    }
}

pub mod fcntl {
    pub const F_SETSIG: i32 = 10;
    pub const F_SETOWN_EX: i32 = 15;

    pub const F_OWNER_TID: i32 = 0;

    #[repr(C)]
    #[derive(Copy, Clone, Default)]
    pub struct f_owner_ex {
        pub type_: i32,
        pub pid: libc::pid_t,
    }
}

pub mod ptrace {
    pub const PTRACE_EVENT_FORK: u32 = 1;
    pub const PTRACE_EVENT_VFORK: u32 = 2;
    pub const PTRACE_EVENT_CLONE: u32 = 3;
    pub const PTRACE_EVENT_EXEC: u32 = 4;
    pub const PTRACE_EVENT_VFORK_DONE: u32 = 5;
    pub const PTRACE_EVENT_EXIT: u32 = 6;
    pub const PTRACE_EVENT_SECCOMP: u32 = 7;
    pub const PTRACE_EVENT_STOP: u32 = 128;
}

pub mod signal {
    /// `si_code` value for kernel-generated SIGTRAP.
    pub const SI_KERNEL: i32 = 0x80;
    /// `si_code` value for a breakpoint trap.
    pub const TRAP_BRKPT: i32 = 1;
    /// `si_code` value for a hardware watch/step trap.
    pub const TRAP_HWBKPT: i32 = 4;
}

pub mod kernel {
    /// Debug status register (DR6) offset in `struct user`, x86-64.
    pub const DEBUG_STATUS_USER_OFFSET: usize = 848;
    /// Debug control register (DR7) offset in `struct user`, x86-64.
    pub const DEBUG_CONTROL_USER_OFFSET: usize = 856;
    /// Offset of u_debugreg[i] in `struct user`, x86-64.
    pub fn debugreg_user_offset(i: usize) -> usize {
        848 + 8 * i
    }
}
