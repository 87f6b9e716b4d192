//! The contract between the supervisor and the preload library loaded into
//! tracees.
//!
//! Bump `SYSCALLBUF_PROTOCOL_VERSION` whenever this interface changes in a
//! way that would require changes to replay. Changes that only affect
//! recording, such as the layout of `syscall_patch_hook`, do not need a bump.
//! The protocol version is stored in the trace header, so replay always has
//! access to the version used during recording, even before the preload
//! library is ever loaded.

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(non_upper_case_globals)]

use crate::remote_ptr::RemotePtr;
use std::mem::size_of;

pub const SYSCALLBUF_PROTOCOL_VERSION: u16 = 0;

pub const SYSCALLBUF_LIB_FILENAME_BASE: &str = "libretracepreload";
pub const SYSCALLBUF_LIB_FILENAME: &str = "libretracepreload.so";

/// Set this env var in the tracee's environment to enable syscall buffering.
pub const SYSCALLBUF_ENABLED_ENV_VAR: &str = "RETRACE_USE_SYSCALLBUF";

/// Size of the per-thread ring buffer region, header included. Must be a
/// multiple of the page size.
pub const SYSCALLBUF_BUFFER_SIZE: usize = 1 << 20;

/// Size of table mapping fd numbers to syscallbuf-disabled flag.
/// Most Linux kernels limit fds to 1024 so it probably doesn't make sense
/// to raise this value.
pub const SYSCALLBUF_FDS_DISABLED_SIZE: usize = 1024;

/// The signal the desched performance counter delivers. Chosen to collide
/// with nothing tracees normally use.
pub const SYSCALLBUF_DESCHED_SIGNAL: i32 = libc::SIGPWR;

/// The desched counter fd is dup'd above this floor so tracee fd
/// manipulation doesn't accidentally hit it.
pub const DESCHED_EVENT_FLOOR_FD: i32 = 200;

/// The engine page: a page mapped at a fixed address in every tracee,
/// holding the syscall stub instructions. The seccomp filter admits
/// syscalls by instruction pointer, so a syscall issued from the untraced
/// stub bypasses the ptrace trap.
pub const RETRACE_PAGE_ADDR: usize = 0x70000000;
pub const RETRACE_PAGE_SYSCALL_STUB_SIZE: usize = 3;
pub const RETRACE_PAGE_SYSCALL_INSTRUCTION_END: usize = 2;

pub const fn RETRACE_PAGE_SYSCALL_ADDR(index: usize) -> usize {
    RETRACE_PAGE_ADDR + RETRACE_PAGE_SYSCALL_STUB_SIZE * index
}

pub const RETRACE_PAGE_SYSCALL_TRACED: usize = RETRACE_PAGE_SYSCALL_ADDR(0);
pub const RETRACE_PAGE_SYSCALL_PRIVILEGED_TRACED: usize = RETRACE_PAGE_SYSCALL_ADDR(1);
pub const RETRACE_PAGE_SYSCALL_UNTRACED: usize = RETRACE_PAGE_SYSCALL_ADDR(2);
pub const RETRACE_PAGE_SYSCALL_PRIVILEGED_UNTRACED: usize = RETRACE_PAGE_SYSCALL_ADDR(3);

/// "Magic" (supervisor-implemented) syscalls used to initialize the
/// syscallbuf.
///
/// NB: magic syscalls must be positive, because the supervisor only gets a
/// trap for the *entry* of invalid syscalls, not the exit.

/// The preload library calls SYS_rtcall_init_preload during its
/// initialization.
pub const SYS_rtcall_init_preload: i32 = 442;

/// The preload library calls SYS_rtcall_init_buffers in each thread that
/// gets created (including the initial main thread).
pub const SYS_rtcall_init_buffers: i32 = 443;

/// The preload library calls SYS_rtcall_notify_syscall_hook_exit when
/// unlocking the syscallbuf and notify_on_syscall_hook_exit has been set.
pub const SYS_rtcall_notify_syscall_hook_exit: i32 = 444;

/// To support syscall buffering, we replace syscall instructions with a
/// "call" instruction that calls a hook in the preload library to handle the
/// syscall. Since the call instruction takes more space than the syscall
/// instruction, the patch replaces one or more instructions after the
/// syscall instruction as well; those instructions are folded into the tail
/// of the hook function and we have multiple hook functions, each one
/// corresponding to an instruction that follows a syscall instruction.
/// Each instance of this struct describes an instruction that can follow a
/// syscall and a hook function to patch with.
///
/// This is not (and must not ever be) used during replay, so it can change
/// without bumping SYSCALLBUF_PROTOCOL_VERSION.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct syscall_patch_hook {
    pub next_instruction_length: u8,
    /// Avoid any padding or anything that would make the layout
    /// arch-specific.
    pub next_instruction_bytes: [u8; 14],
    pub _padding: u8,
    pub hook_address: u64,
}

pub const NEXT_INSTRUCTION_BYTES_LEN: usize = 14;

/// Parameters the preload library hands the supervisor during
/// `rtcall_init_preload`. Pointers are tracee addresses.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct rtcall_init_preload_params {
    pub syscallbuf_enabled: u8,
    pub _padding: [u8; 3],
    pub syscall_patch_hook_count: u32,
    pub syscall_patch_hooks: u64,
    pub syscall_hook_trampoline: u64,
    /// Address of the process-global `preload_globals` object, which the
    /// supervisor mutates through memory writes. It must live at a fixed
    /// offset in a page the tracee never unmaps.
    pub globals: u64,
}

/// Parameters of the per-thread `rtcall_init_buffers` handshake.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct rtcall_init_buffers_params {
    /// In: the desched counter fd opened by this thread.
    pub desched_counter_fd: i32,
    pub _padding: i32,
    /// Out: tracee address of the thread's mapped ring buffer.
    pub syscallbuf_ptr: u64,
}

/// Must be arch-independent.
/// Variables used to communicate between the preload library and the
/// supervisor, packaged into a single struct to simplify the interface.
/// Fields may be appended without breaking trace compatibility, but existing
/// fields must not move. The supervisor writes to it during replay only for
/// the `in_replay` field.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct preload_globals {
    /// 0 during recording, 1 during replay. Set by the supervisor.
    /// This MUST NOT be used in conditional branches. It should only be used
    /// as the condition for conditional moves so that control flow during
    /// replay does not diverge from control flow during recording.
    /// We also have to be careful that values different between record and
    /// replay don't accidentally leak into other memory locations or
    /// registers.
    pub in_replay: u8,
    /// The signal to use for desched events.
    pub desched_sig: u8,
    pub _padding: [u8; 2],
    /// Number of cores to pretend we have. 0 means 1. The supervisor sets
    /// this when the preload library is initialized.
    pub pretend_num_cores: i32,
    /// If `syscallbuf_fds_disabled[fd]` is nonzero, then operations on that
    /// fd must be performed through traced syscalls, not the syscallbuf.
    /// The supervisor modifies this array directly to dynamically turn
    /// syscallbuf on and off for particular fds. fds outside the array range
    /// must never use the syscallbuf.
    /// The last entry is set if *any* fd >= SYSCALLBUF_FDS_DISABLED_SIZE - 1
    /// has had buffering disabled.
    pub syscallbuf_fds_disabled: [u8; SYSCALLBUF_FDS_DISABLED_SIZE],
}

impl Default for preload_globals {
    fn default() -> Self {
        preload_globals {
            in_replay: 0,
            desched_sig: SYSCALLBUF_DESCHED_SIGNAL as u8,
            _padding: [0; 2],
            pretend_num_cores: 1,
            syscallbuf_fds_disabled: [0; SYSCALLBUF_FDS_DISABLED_SIZE],
        }
    }
}

/// The syscall buffer comprises an array of these variable-length
/// records, along with the header below.
#[repr(C)]
#[derive(Copy, Clone, Default, Debug)]
pub struct syscallbuf_record {
    /// Return value from the syscall. This can be a memory address, so must
    /// be as big as a memory address can be. We use 64 bits rather than make
    /// syscallbuf_record arch-specific as that gets cumbersome.
    pub ret: i64,
    /// Syscall number.
    pub syscallno: u16,
    /// Did the tracee arm/disarm the desched notification for this syscall?
    pub desched: u8,
    pub _padding: u8,
    /// Size of entire record in bytes: this struct plus extra recorded data
    /// stored inline after the last field, not including padding.
    pub size: u32,
    /// Extra recorded outparam data starts here.
    pub extra_data: [u8; 0],
}

bitflags! {
    /// Each bit of `syscallbuf_hdr.locked` indicates a reason why the
    /// syscallbuf is locked.
    #[derive(Default)]
    pub struct syscallbuf_locked_why: u8 {
        /// Used by the tracee, during interruptible syscalls to avoid
        /// recursion from a signal handler on the same thread.
        const SYSCALLBUF_LOCKED_TRACEE = 0x1;
        /// Used by the tracer to prevent syscall buffering when necessary to
        /// preserve semantics.
        const SYSCALLBUF_LOCKED_TRACER = 0x2;
    }
}

/// This struct summarizes the state of the syscall buffer. It happens
/// to be located at the start of the buffer.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct syscallbuf_hdr {
    /// The number of valid syscallbuf_record bytes in the buffer, not
    /// counting this header. Accessed with volatile stores so memory writes
    /// aren't reordered around updates to this field: a record's payload is
    /// published before `num_rec_bytes` advances past it, so the supervisor
    /// can read a flushed record at any instant without torn payloads.
    pub num_rec_bytes: u32,
    /// True if the current syscall should not be committed to the buffer,
    /// for whatever reason; likely interrupted by desched. Set by the
    /// supervisor.
    pub abort_commit: u8,
    /// True if, next time we exit the syscall buffer hook, the preload
    /// library should execute SYS_rtcall_notify_syscall_hook_exit to give
    /// the supervisor the opportunity to deliver a signal and/or reset the
    /// syscallbuf.
    pub notify_on_syscall_hook_exit: u8,
    /// Tracks whether the buffer is currently in use for a syscall or
    /// otherwise unavailable. Helpful when a signal handler runs during a
    /// wrapped system call; we don't want it to use the buffer for its
    /// system calls.
    pub locked: syscallbuf_locked_why,
    /// Nonzero when the supervisor needs to worry about the desched signal.
    /// When it's zero, the desched signal can safely be discarded.
    /// The ordering contract with the counter arm/disarm ioctls is strict:
    /// set *before* arming, cleared *before* disarming.
    pub desched_signal_may_be_relevant: u8,

    pub recs: [syscallbuf_record; 0],
}

const_assert_eq!(size_of::<syscallbuf_hdr>() % 8, 0);

/// The amount of space that a record of `length` will occupy in
/// the buffer if committed, including padding: a whole number of 64-bit
/// words.
pub fn stored_record_size(length: u32) -> u32 {
    (length + 7) & !7u32
}

/// Tracee address of the first record in the buffer at `buffer_ptr`.
pub fn buffer_first_record(buffer_ptr: RemotePtr<syscallbuf_hdr>) -> RemotePtr<syscallbuf_record> {
    RemotePtr::cast(RemotePtr::<u8>::cast(buffer_ptr) + size_of::<syscallbuf_hdr>())
}

/// Tracee address one past the last committed record, given the header
/// contents.
pub fn buffer_end_of_records(
    buffer_ptr: RemotePtr<syscallbuf_hdr>,
    hdr: &syscallbuf_hdr,
) -> RemotePtr<syscallbuf_record> {
    RemotePtr::cast(
        RemotePtr::<u8>::cast(buffer_first_record(buffer_ptr)) + hdr.num_rec_bytes as usize,
    )
}

/// Step from one record to the next within a locally mapped copy of the
/// buffer. `offset` is relative to the first record.
pub fn next_record_offset(rec: &syscallbuf_record, offset: usize) -> usize {
    offset + stored_record_size(rec.size) as usize
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_sizes_are_8_byte_aligned() {
        assert_eq!(16, size_of::<syscallbuf_record>());
        assert_eq!(16, stored_record_size(16));
        assert_eq!(24, stored_record_size(17));
        assert_eq!(24, stored_record_size(23));
        assert_eq!(24, stored_record_size(24));
    }

    #[test]
    fn record_offsets_walk_padded_sizes() {
        let mut rec = syscallbuf_record::default();
        rec.size = size_of::<syscallbuf_record>() as u32 + 3;
        // 16 + 3 rounds to 24.
        assert_eq!(24, next_record_offset(&rec, 0));
        rec.size = size_of::<syscallbuf_record>() as u32;
        assert_eq!(40, next_record_offset(&rec, 24));
    }

    #[test]
    fn header_record_addressing() {
        let buf = RemotePtr::<syscallbuf_hdr>::new(0x1000);
        let first = buffer_first_record(buf);
        assert_eq!(0x1000 + size_of::<syscallbuf_hdr>(), first.as_usize());

        let mut hdr = syscallbuf_hdr::default();
        hdr.num_rec_bytes = 48;
        assert_eq!(
            first.as_usize() + 48,
            buffer_end_of_records(buf, &hdr).as_usize()
        );
    }

    #[test]
    fn globals_layout() {
        // in_replay must stay at offset 0: the preload reload sequence and
        // the supervisor both address it directly.
        let g = preload_globals::default();
        let base = &g as *const _ as usize;
        assert_eq!(base, &g.in_replay as *const _ as usize);
        assert_eq!(1, g.pretend_num_cores);
    }
}
