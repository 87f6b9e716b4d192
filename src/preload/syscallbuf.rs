//! Hook handlers and buffer bookkeeping for the syscall-buffering fast
//! path. See the module docs in `preload` for the ground rules.

#![allow(clippy::missing_safety_doc)]

use crate::preload_interface::{
    preload_globals, rtcall_init_buffers_params, rtcall_init_preload_params, stored_record_size,
    syscall_patch_hook, syscallbuf_hdr, syscallbuf_locked_why, syscallbuf_record,
    RETRACE_PAGE_SYSCALL_INSTRUCTION_END, RETRACE_PAGE_SYSCALL_PRIVILEGED_TRACED,
    RETRACE_PAGE_SYSCALL_PRIVILEGED_UNTRACED, RETRACE_PAGE_SYSCALL_TRACED,
    RETRACE_PAGE_SYSCALL_UNTRACED, SYSCALLBUF_BUFFER_SIZE, SYSCALLBUF_DESCHED_SIGNAL,
    SYSCALLBUF_ENABLED_ENV_VAR, SYSCALLBUF_FDS_DISABLED_SIZE, SYS_rtcall_init_buffers,
    SYS_rtcall_init_preload, DESCHED_EVENT_FLOOR_FD,
};
use core::arch::asm;
use std::{
    cell::Cell,
    mem::size_of,
    ptr,
    sync::atomic::{compiler_fence, Ordering},
};

/// sysexits(3) EX_OSERR.
const EX_OSERR: i32 = 71;

/// Represents syscall params. Makes it simpler to pass them around, and
/// avoids pushing/popping all the data for calls.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct syscall_info {
    pub no: isize,
    pub args: [isize; 6],
}

// --- Process-global state -------------------------------------------------

/// Nonzero when syscall buffering is enabled.
static mut BUFFER_ENABLED: bool = false;
/// Nonzero after process-global state has been initialized.
static mut PROCESS_INITED: bool = false;

/// The communication block shared with the supervisor. The supervisor
/// mutates it through memory writes; it must never be unmapped.
static mut GLOBALS: preload_globals = preload_globals {
    in_replay: 0,
    desched_sig: SYSCALLBUF_DESCHED_SIGNAL as u8,
    _padding: [0; 2],
    pretend_num_cores: 1,
    syscallbuf_fds_disabled: [0; SYSCALLBUF_FDS_DISABLED_SIZE],
};

thread_local! {
    /// When buffering is enabled, points at the thread's mapped buffer
    /// segment. The start of the segment holds the `syscallbuf_hdr`.
    static BUFFER: Cell<*mut u8> = Cell::new(ptr::null_mut());
    /// This thread's desched counter fd. See the desched discussion in the
    /// module docs of `preload`.
    static DESCHED_COUNTER_FD: Cell<i32> = Cell::new(-1);
    static THREAD_INITED: Cell<bool> = Cell::new(false);
}

// --- Raw kernel entries ---------------------------------------------------

/// Perform the kernel entry through the stub at `instruction_end`, which is
/// the address just past a `syscall` instruction in the engine page. The
/// seccomp filter admits or traps the call purely by this address.
#[inline(always)]
unsafe fn raw_syscall_at(
    instruction_end: usize,
    no: isize,
    a0: isize,
    a1: isize,
    a2: isize,
    a3: isize,
    a4: isize,
    a5: isize,
) -> isize {
    let entry = instruction_end - RETRACE_PAGE_SYSCALL_INSTRUCTION_END;
    let ret: isize;
    asm!(
        "call {entry}",
        entry = in(reg) entry,
        inlateout("rax") no => ret,
        in("rdi") a0,
        in("rsi") a1,
        in("rdx") a2,
        in("r10") a3,
        in("r8") a4,
        in("r9") a5,
        // The kernel entry clobbers rcx and r11.
        out("rcx") _,
        out("r11") _,
    );
    ret
}

unsafe fn traced_raw_syscall(call: &syscall_info) -> isize {
    raw_syscall_at(
        RETRACE_PAGE_SYSCALL_TRACED + RETRACE_PAGE_SYSCALL_INSTRUCTION_END,
        call.no,
        call.args[0],
        call.args[1],
        call.args[2],
        call.args[3],
        call.args[4],
        call.args[5],
    )
}

unsafe fn privileged_traced_syscall(
    no: isize,
    a0: isize,
    a1: isize,
    a2: isize,
    a3: isize,
    a4: isize,
    a5: isize,
) -> isize {
    raw_syscall_at(
        RETRACE_PAGE_SYSCALL_PRIVILEGED_TRACED + RETRACE_PAGE_SYSCALL_INSTRUCTION_END,
        no,
        a0,
        a1,
        a2,
        a3,
        a4,
        a5,
    )
}

unsafe fn privileged_untraced_syscall3(no: isize, a0: isize, a1: isize, a2: isize) -> isize {
    raw_syscall_at(
        RETRACE_PAGE_SYSCALL_PRIVILEGED_UNTRACED + RETRACE_PAGE_SYSCALL_INSTRUCTION_END,
        no,
        a0,
        a1,
        a2,
        0,
        0,
        0,
    )
}

/// The buffered-path kernel entry. Returns the raw kernel status during
/// recording; during replay the observed result is ignored and the return
/// register is reloaded from the record's saved `ret` field. The reload
/// uses a conditional move so that control flow is identical between
/// record and replay.
unsafe fn untraced_syscall_base(
    no: isize,
    a0: isize,
    a1: isize,
    a2: isize,
    a3: isize,
    a4: isize,
    a5: isize,
) -> isize {
    let rec = buffer_last() as *const syscallbuf_record;
    let mut ret = raw_syscall_at(
        RETRACE_PAGE_SYSCALL_UNTRACED + RETRACE_PAGE_SYSCALL_INSTRUCTION_END,
        no,
        a0,
        a1,
        a2,
        a3,
        a4,
        a5,
    );
    // On entry, during recording rax is whatever the kernel returned, but
    // during replay it may be invalid (e.g. 0). Reload rax from rec->ret
    // under in_replay. We clobber the temporary in_replay register and the
    // condition codes so all registers match between recording and replay
    // afterward.
    let mut tmp_in_replay = GLOBALS.in_replay as u64;
    asm!(
        "test {tmp}, {tmp}",
        "cmovne {ret}, {rec}",
        "xor {tmp}, {tmp}",
        tmp = inout(reg) tmp_in_replay,
        ret = inout(reg) ret,
        rec = in(reg) ptr::read_volatile(ptr::addr_of!((*rec).ret)),
        options(nostack),
    );
    let _ = tmp_in_replay;
    ret
}

macro_rules! untraced_syscall {
    ($no:expr) => { untraced_syscall!($no, 0, 0, 0, 0, 0, 0) };
    ($no:expr, $a0:expr) => { untraced_syscall!($no, $a0, 0, 0, 0, 0, 0) };
    ($no:expr, $a0:expr, $a1:expr) => { untraced_syscall!($no, $a0, $a1, 0, 0, 0, 0) };
    ($no:expr, $a0:expr, $a1:expr, $a2:expr) => { untraced_syscall!($no, $a0, $a1, $a2, 0, 0, 0) };
    ($no:expr, $a0:expr, $a1:expr, $a2:expr, $a3:expr) => {
        untraced_syscall!($no, $a0, $a1, $a2, $a3, 0, 0)
    };
    ($no:expr, $a0:expr, $a1:expr, $a2:expr, $a3:expr, $a4:expr) => {
        untraced_syscall!($no, $a0, $a1, $a2, $a3, $a4, 0)
    };
    ($no:expr, $a0:expr, $a1:expr, $a2:expr, $a3:expr, $a4:expr, $a5:expr) => {
        untraced_syscall_base(
            $no as isize,
            $a0 as isize,
            $a1 as isize,
            $a2 as isize,
            $a3 as isize,
            $a4 as isize,
            $a5 as isize,
        )
    };
}

/// Transform a raw kernel status into the errno-plus-minus-one convention
/// user code expects.
unsafe fn update_errno_ret(ret: isize) -> isize {
    // EHWPOISON is the last known errno.
    if ret < 0 && ret >= -133 {
        *libc::__errno_location() = -ret as i32;
        return -1;
    }
    ret
}

// --- Diagnostics ----------------------------------------------------------

/// We can't use the supervisor-side logging helpers: they allocate and call
/// libc. Write straight to stderr with the raw write syscall and die with
/// exit_group; the supervisor captures the failure frame.
unsafe fn preload_fatal(msg: &str) -> ! {
    privileged_traced_syscall(
        libc::SYS_write as isize,
        2,
        msg.as_ptr() as isize,
        msg.len() as isize,
        0,
        0,
        0,
    );
    privileged_traced_syscall(
        libc::SYS_write as isize,
        2,
        b"\n".as_ptr() as isize,
        1,
        0,
        0,
        0,
    );
    privileged_traced_syscall(libc::SYS_exit_group as isize, EX_OSERR as isize, 0, 0, 0, 0, 0);
    core::hint::unreachable_unchecked()
}

/// Raise SIGABRT through the raw kill so the supervisor records the failure
/// frame at this exact point.
unsafe fn preload_assert(cond: bool, msg: &str) {
    if !cond {
        privileged_traced_syscall(
            libc::SYS_write as isize,
            2,
            msg.as_ptr() as isize,
            msg.len() as isize,
            0,
            0,
            0,
        );
        let tid = privileged_traced_syscall(libc::SYS_gettid as isize, 0, 0, 0, 0, 0, 0);
        let pid = privileged_traced_syscall(libc::SYS_getpid as isize, 0, 0, 0, 0, 0, 0);
        privileged_traced_syscall(
            libc::SYS_tgkill as isize,
            pid,
            tid,
            libc::SIGABRT as isize,
            0,
            0,
            0,
        );
    }
}

// --- Buffer addressing ----------------------------------------------------

unsafe fn buffer_hdr() -> *mut syscallbuf_hdr {
    BUFFER.with(|b| b.get()) as *mut syscallbuf_hdr
}

/// The byte just after the last committed record.
unsafe fn buffer_last() -> *mut u8 {
    let hdr = buffer_hdr();
    (hdr as *mut u8)
        .add(size_of::<syscallbuf_hdr>())
        .add((*hdr).num_rec_bytes as usize)
}

/// The byte just after the very end of the mapped region.
unsafe fn buffer_end() -> *mut u8 {
    BUFFER.with(|b| b.get()).add(SYSCALLBUF_BUFFER_SIZE)
}

/// memcpy usable within buffer transaction critical sections: no libc.
unsafe fn local_memcpy(dest: *mut u8, src: *const u8, n: usize) {
    // On modern x86 rep movsb is fast, usually able to move 64 bytes at a
    // time.
    let mut d = dest;
    let mut s = src;
    let mut count = n;
    asm!(
        "rep movsb",
        inout("rdi") d,
        inout("rsi") s,
        inout("rcx") count,
        options(nostack),
    );
    let _ = (d, s, count);
}

/// Copy an input parameter into the buffer where the kernel needs to both
/// read and write it. During replay this performs a no-op self-copy so the
/// buffered data is not lost; the select is a conditional move so control
/// flow never diverges.
unsafe fn memcpy_input_parameter(buf: *mut u8, src: *mut u8, size: usize) {
    let mut tmp_in_replay: u64 = GLOBALS.in_replay as u64;
    let mut d = buf;
    let mut s = src;
    let mut count = size;
    asm!(
        "test {tmp}, {tmp}",
        "cmovne rsi, rdi",
        "rep movsb",
        "xor {tmp}, {tmp}",
        tmp = inout(reg) tmp_in_replay,
        inout("rdi") d,
        inout("rsi") s,
        inout("rcx") count,
        options(nostack),
    );
    let _ = (tmp_in_replay, d, s, count);
}

// --- Init -----------------------------------------------------------------

extern "C" {
    static environ: *mut *mut libc::c_char;
}

unsafe fn getenv_raw(name: &str) -> bool {
    // environ walking without libc string helpers.
    let mut environ_ptr = environ;
    while !(*environ_ptr).is_null() {
        let entry = *environ_ptr;
        let mut i = 0;
        let name_bytes = name.as_bytes();
        let mut matched = true;
        while i < name_bytes.len() {
            let c = *entry.add(i) as u8;
            if c != name_bytes[i] {
                matched = false;
                break;
            }
            i += 1;
        }
        if matched && *entry.add(name_bytes.len()) as u8 == b'=' {
            return true;
        }
        environ_ptr = environ_ptr.add(1);
    }
    false
}

/// Return a counter that generates a signal targeted at this task every
/// time the task is descheduled. The sample period is one: the next
/// deschedule after arming delivers the signal.
unsafe fn open_desched_event_counter(tid: i32) -> i32 {
    use crate::bindings::perf_event::{perf_event_attr, PERF_COUNT_SW_CONTEXT_SWITCHES, PERF_TYPE_SOFTWARE};

    let mut attr = perf_event_attr::default();
    attr.size = size_of::<perf_event_attr>() as u32;
    attr.type_ = PERF_TYPE_SOFTWARE;
    attr.config = PERF_COUNT_SW_CONTEXT_SWITCHES;
    attr.flags = crate::bindings::perf_event::ATTR_FLAG_DISABLED;
    attr.sample_period = 1;

    let tmp_fd = privileged_traced_syscall(
        libc::SYS_perf_event_open as isize,
        &attr as *const _ as isize,
        0, // self
        -1, // any cpu
        -1,
        0,
        0,
    ) as i32;
    if tmp_fd < 0 {
        preload_fatal("Failed to perf_event_open the desched counter");
    }
    // Dup above the floor so ordinary tracee fd handling can't collide.
    let fd = privileged_traced_syscall(
        libc::SYS_fcntl as isize,
        tmp_fd as isize,
        libc::F_DUPFD_CLOEXEC as isize,
        DESCHED_EVENT_FLOOR_FD as isize,
        0,
        0,
        0,
    ) as i32;
    if fd < 0 {
        preload_fatal("Failed to dup the desched counter fd");
    }
    if privileged_untraced_syscall3(libc::SYS_close as isize, tmp_fd as isize, 0, 0) != 0 {
        preload_fatal("Failed to close the temporary desched fd");
    }
    if raw_fcntl_with_arg(fd, libc::F_SETFL, libc::O_ASYNC as isize) != 0 {
        preload_fatal("Failed to fcntl(O_ASYNC) the desched counter");
    }
    let own = crate::bindings::fcntl::f_owner_ex {
        type_: crate::bindings::fcntl::F_OWNER_TID,
        pid: tid,
    };
    if raw_fcntl_with_arg(fd, crate::bindings::fcntl::F_SETOWN_EX, &own as *const _ as isize) != 0 {
        preload_fatal("Failed to fcntl(F_SETOWN_EX) the desched counter");
    }
    if raw_fcntl_with_arg(fd, crate::bindings::fcntl::F_SETSIG, SYSCALLBUF_DESCHED_SIGNAL as isize)
        != 0
    {
        preload_fatal("Failed to fcntl(F_SETSIG) the desched counter");
    }

    fd
}

unsafe fn raw_fcntl_with_arg(fd: i32, cmd: i32, arg: isize) -> isize {
    raw_syscall_at(
        RETRACE_PAGE_SYSCALL_PRIVILEGED_UNTRACED + RETRACE_PAGE_SYSCALL_INSTRUCTION_END,
        libc::SYS_fcntl as isize,
        fd as isize,
        cmd as isize,
        arg,
        0,
        0,
        0,
    )
}

static mut SYSCALL_PATCH_HOOKS: [syscall_patch_hook; 5] = [syscall_patch_hook {
    next_instruction_length: 0,
    next_instruction_bytes: [0; 14],
    _padding: 0,
    hook_address: 0,
}; 5];

/// Initialize process-global buffering state, if enabled. Runs from
/// .init_array, i.e. before main and before most of libc's own setup runs
/// user code.
unsafe fn init_process() {
    if PROCESS_INITED {
        return;
    }

    BUFFER_ENABLED = getenv_raw(SYSCALLBUF_ENABLED_ENV_VAR);

    // Patterns that may follow a glibc syscall instruction; the supervisor
    // patches matching sites to call back into syscall_hook.
    let patterns: [(&[u8], u64); 2] = [
        // Many glibc syscall wrappers (e.g. read) have 'syscall' followed
        // by cmp $-4095,%rax.
        (&[0x48, 0x3d, 0x01, 0xf0, 0xff, 0xff], syscall_hook as usize as u64),
        // vdso patch sites have 'syscall' followed by nop;nop;nop.
        (&[0x90, 0x90, 0x90], syscall_hook as usize as u64),
    ];
    for (i, (bytes, addr)) in patterns.iter().enumerate() {
        SYSCALL_PATCH_HOOKS[i].next_instruction_length = bytes.len() as u8;
        SYSCALL_PATCH_HOOKS[i].next_instruction_bytes[..bytes.len()].copy_from_slice(bytes);
        SYSCALL_PATCH_HOOKS[i].hook_address = *addr;
    }

    let params = rtcall_init_preload_params {
        syscallbuf_enabled: BUFFER_ENABLED as u8,
        _padding: [0; 3],
        syscall_patch_hook_count: 2,
        syscall_patch_hooks: SYSCALL_PATCH_HOOKS.as_ptr() as u64,
        syscall_hook_trampoline: syscall_hook as usize as u64,
        globals: ptr::addr_of!(GLOBALS) as u64,
    };

    privileged_traced_syscall(
        SYS_rtcall_init_preload as isize,
        &params as *const _ as isize,
        0,
        0,
        0,
        0,
        0,
    );

    libc::pthread_atfork(None, None, Some(post_fork_child));

    PROCESS_INITED = true;

    init_thread();
}

/// Initialize thread-local buffering state, if enabled: the desched
/// counter and the per-thread ring mapped by the supervisor.
unsafe fn init_thread() {
    preload_assert(PROCESS_INITED, "init_thread before init_process");
    if THREAD_INITED.with(|t| t.get()) {
        return;
    }

    if !BUFFER_ENABLED {
        THREAD_INITED.with(|t| t.set(true));
        return;
    }

    let tid = privileged_traced_syscall(libc::SYS_gettid as isize, 0, 0, 0, 0, 0, 0) as i32;
    // NB: we want this setup emulated during replay.
    let desched_fd = open_desched_event_counter(tid);
    DESCHED_COUNTER_FD.with(|d| d.set(desched_fd));

    let mut args = rtcall_init_buffers_params {
        desched_counter_fd: desched_fd,
        _padding: 0,
        syscallbuf_ptr: 0,
    };

    // Trap to the supervisor: let the magic begin. It maps the ring and
    // initializes the header.
    privileged_traced_syscall(
        SYS_rtcall_init_buffers as isize,
        &mut args as *mut _ as isize,
        0,
        0,
        0,
        0,
        0,
    );

    BUFFER.with(|b| b.set(args.syscallbuf_ptr as *mut u8));
    THREAD_INITED.with(|t| t.set(true));
}

/// After a fork, the child inherits a copy-on-write mapping of the
/// parent's buffer. Drop the parent's copy and reinstall our own.
extern "C" fn post_fork_child() {
    BUFFER.with(|b| b.set(ptr::null_mut()));
    THREAD_INITED.with(|t| t.set(false));
    unsafe { init_thread() };
}

/// The library constructor. Placing the pointer in .init_array makes the
/// dynamic loader run it at load time.
#[link_section = ".init_array"]
#[used]
static INIT_PROCESS_CTOR: extern "C" fn() = {
    extern "C" fn ctor() {
        unsafe { init_process() }
    }
    ctor
};

// --- pthread interposition ------------------------------------------------

#[repr(C)]
struct thread_func_data {
    start_routine: extern "C" fn(*mut libc::c_void) -> *mut libc::c_void,
    arg: *mut libc::c_void,
}

/// In a thread newly created by pthread_create, first initialize
/// thread-local state, then trampoline into the user's thread function.
extern "C" fn thread_trampoline(arg: *mut libc::c_void) -> *mut libc::c_void {
    unsafe {
        let data = ptr::read(arg as *mut thread_func_data);
        libc::free(arg);
        init_thread();
        (data.start_routine)(data.arg)
    }
}

/// Interpose pthread_create so new threads run our trampoline, which
/// initializes per-thread buffering state before the user code runs.
///
/// # Safety
/// Exported with C ABI over the real pthread_create.
#[no_mangle]
pub unsafe extern "C" fn pthread_create(
    thread: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    start_routine: extern "C" fn(*mut libc::c_void) -> *mut libc::c_void,
    arg: *mut libc::c_void,
) -> i32 {
    init_process();

    let data = libc::malloc(size_of::<thread_func_data>()) as *mut thread_func_data;
    (*data).start_routine = start_routine;
    (*data).arg = arg;

    let real: extern "C" fn(
        *mut libc::pthread_t,
        *const libc::pthread_attr_t,
        extern "C" fn(*mut libc::c_void) -> *mut libc::c_void,
        *mut libc::c_void,
    ) -> i32 = {
        let sym = libc::dlsym(libc::RTLD_NEXT, b"pthread_create\0".as_ptr() as *const i8);
        if sym.is_null() {
            preload_fatal("Can't find real pthread_create");
        }
        std::mem::transmute(sym)
    };

    // Don't let the new thread use our TLS buffer pointer before its own
    // init runs.
    real(thread, attr, thread_trampoline, data as *mut libc::c_void)
}

const PTHREAD_MUTEX_PRIO_INHERIT_NP: i32 = 32;

/// Disable priority inheritance. PI futexes require special supervisor
/// handling and are not worth buffering.
unsafe fn fix_mutex_kind(mutex: *mut libc::pthread_mutex_t) {
    // The mutex kind word is the first int of the pthread_mutex_t data.
    let kind = mutex as *mut i32;
    *kind &= !PTHREAD_MUTEX_PRIO_INHERIT_NP;
}

#[no_mangle]
pub unsafe extern "C" fn pthread_mutex_lock(mutex: *mut libc::pthread_mutex_t) -> i32 {
    fix_mutex_kind(mutex);
    let real: extern "C" fn(*mut libc::pthread_mutex_t) -> i32 = {
        let sym = libc::dlsym(libc::RTLD_NEXT, b"pthread_mutex_lock\0".as_ptr() as *const i8);
        std::mem::transmute(sym)
    };
    real(mutex)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_mutex_trylock(mutex: *mut libc::pthread_mutex_t) -> i32 {
    fix_mutex_kind(mutex);
    let real: extern "C" fn(*mut libc::pthread_mutex_t) -> i32 = {
        let sym = libc::dlsym(
            libc::RTLD_NEXT,
            b"pthread_mutex_trylock\0".as_ptr() as *const i8,
        );
        std::mem::transmute(sym)
    };
    real(mutex)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_mutex_timedlock(
    mutex: *mut libc::pthread_mutex_t,
    abstime: *const libc::timespec,
) -> i32 {
    fix_mutex_kind(mutex);
    let real: extern "C" fn(*mut libc::pthread_mutex_t, *const libc::timespec) -> i32 = {
        let sym = libc::dlsym(
            libc::RTLD_NEXT,
            b"pthread_mutex_timedlock\0".as_ptr() as *const i8,
        );
        std::mem::transmute(sym)
    };
    real(mutex, abstime)
}

// --- Buffer transaction helpers ------------------------------------------

/// Whether it's safe to buffer a syscall operating on `fd`. The exclusion
/// array is written only by the supervisor and read lock-free here.
unsafe fn fd_allows_buffering(fd: i32) -> bool {
    if fd < 0 || fd as usize >= SYSCALLBUF_FDS_DISABLED_SIZE {
        return false;
    }
    ptr::read_volatile(ptr::addr_of!(GLOBALS.syscallbuf_fds_disabled[fd as usize])) == 0
}

/// Call this and save the result at the start of every system call we want
/// to buffer. The result is a pointer into the record space where outparam
/// data can grow. Returns null if buffering is currently impossible (no
/// buffer, or reentry from a signal handler). You *must* follow up with
/// start_commit_buffered_syscall, otherwise buffering state will be
/// inconsistent between syscalls.
unsafe fn prep_syscall() -> *mut u8 {
    if BUFFER.with(|b| b.get()).is_null() {
        return ptr::null_mut();
    }
    let hdr = buffer_hdr();
    if !(*hdr).locked.is_empty() {
        // We may be reentering via a signal handler. Return an invalid
        // pointer.
        return ptr::null_mut();
    }
    // No other thread can write this buffer: it is per-thread. Recording
    // ensures signals are not delivered during the prologue/epilogue code,
    // so test-then-set is enough from this thread's perspective.
    (*hdr).locked = syscallbuf_locked_why::SYSCALLBUF_LOCKED_TRACEE;
    // "Allocate" space for a new syscall record, not including outparam
    // data.
    buffer_last().add(size_of::<syscallbuf_record>())
}

/// Like prep_syscall, for a syscall that operates on a particular fd. If
/// buffering is disabled for the fd, returns null and the caller falls
/// through to a traced syscall.
unsafe fn prep_syscall_for_fd(fd: i32) -> *mut u8 {
    if !fd_allows_buffering(fd) {
        return ptr::null_mut();
    }
    prep_syscall()
}

unsafe fn arm_desched_event() {
    // Don't trace the ioctl; doing so would trigger a flushing ptrace trap,
    // which is exactly what this code is trying to avoid.
    if privileged_untraced_syscall3(
        libc::SYS_ioctl as isize,
        DESCHED_COUNTER_FD.with(|d| d.get()) as isize,
        crate::bindings::perf_event::PERF_EVENT_IOC_ENABLE as isize,
        0,
    ) != 0
    {
        preload_fatal("Failed to ENABLE the desched counter");
    }
}

unsafe fn disarm_desched_event() {
    if privileged_untraced_syscall3(
        libc::SYS_ioctl as isize,
        DESCHED_COUNTER_FD.with(|d| d.get()) as isize,
        crate::bindings::perf_event::PERF_EVENT_IOC_DISABLE as isize,
        0,
    ) != 0
    {
        preload_fatal("Failed to DISABLE the desched counter");
    }
}

pub const MAY_BLOCK: i32 = -1;
pub const WONT_BLOCK: i32 = -2;

/// Decide whether to proceed with buffering this system call; when this
/// returns false the caller must fall through to a traced syscall.
unsafe fn start_commit_buffered_syscall(syscallno: isize, record_end: *mut u8, blockness: i32) -> bool {
    if BUFFER.with(|b| b.get()).is_null() || record_end.is_null() {
        return false;
    }
    let record_start = buffer_last();
    let record_len = record_end.offset_from(record_start) as u32;
    let stored_end = record_start.add(stored_record_size(record_len) as usize);
    let rec = record_start as *mut syscallbuf_record;

    if (stored_end as usize) < record_start as usize + size_of::<syscallbuf_record>() {
        // Either a catastrophic buffer overflow or we failed to lock the
        // buffer. Just bail out.
        return false;
    }
    if stored_end as usize > buffer_end() as usize - size_of::<syscallbuf_record>() {
        // Buffer overflow. Unlock the buffer and execute the system call
        // with a trap to the supervisor, which will flush the buffer. Note
        // the reserved space for the next prep_syscall().
        (*buffer_hdr()).locked = syscallbuf_locked_why::empty();
        return false;
    }

    // Store this breadcrumb so the supervisor can find out what syscall
    // we're executing if our registers are in a weird state. If we end up
    // aborting this syscall, no worry, this will just be overwritten later.
    (*rec).syscallno = syscallno as u16;
    (*rec).desched = (blockness == MAY_BLOCK) as u8;
    (*rec).size = record_len;

    if (*rec).desched != 0 {
        // The ordering of the next two statements is critical: the flag
        // must be visible to the supervisor *before* the counter can fire.
        // If the notification were armed first, a desched signal delivered
        // between arming and the flag store could not be correlated back to
        // this syscall, the supervisor would not advance us to the untraced
        // entry point, and the recording session could deadlock.
        ptr::write_volatile(ptr::addr_of_mut!((*buffer_hdr()).desched_signal_may_be_relevant), 1);
        compiler_fence(Ordering::SeqCst);
        arm_desched_event();
    }
    true
}

/// Commit the record for a buffered system call. `record_end` can be
/// adjusted downward from what was passed to start_commit_buffered_syscall
/// if not all of the initially requested space was needed. The result of
/// this function should be returned directly by the syscall hook.
unsafe fn commit_raw_syscall(syscallno: isize, record_end: *mut u8, ret: isize) -> isize {
    let record_start = buffer_last();
    let rec = record_start as *mut syscallbuf_record;
    let hdr = buffer_hdr();

    preload_assert(record_end >= record_start, "invalid record_end");
    (*rec).size = record_end.offset_from(record_start) as u32;
    preload_assert(!(*hdr).locked.is_empty(), "commit while unlocked");

    // The ordering of this store with the disarm below is the mirror image
    // of the arm path: the flag must be cleared *before* disarming. If the
    // supervisor sees the flag set it must PTRACE_SYSCALL this task until
    // the disarm ioctl acts as a stable backstop; were the flag cleared
    // after the disarm and the signal delivered right at the clearing
    // instruction, the task could fly off to an unknown execution point and
    // the recording session could livelock.
    ptr::write_volatile(ptr::addr_of_mut!((*hdr).desched_signal_may_be_relevant), 0);
    compiler_fence(Ordering::SeqCst);

    if (*rec).syscallno != syscallno as u16 {
        preload_fatal("Record syscall number mismatch at commit");
    }

    if (*hdr).abort_commit != 0 {
        // We were descheduled in the middle of a may-block syscall, and it
        // was recorded as a normal entry/exit pair. Don't record the
        // syscall in the buffer or replay will go haywire.
        (*hdr).abort_commit = 0;
        // Erase the return value the supervisor put there during replay.
        (*rec).ret = 0;
    } else {
        (*rec).ret = ret as i64;
        // Finish the record before updating num_rec_bytes: the supervisor
        // may read the buffer at any instant after the counter advances and
        // must never see a torn payload.
        compiler_fence(Ordering::SeqCst);
        let new_bytes = (*hdr).num_rec_bytes + stored_record_size((*rec).size);
        ptr::write_volatile(ptr::addr_of_mut!((*hdr).num_rec_bytes), new_bytes);
    }

    if (*rec).desched != 0 {
        disarm_desched_event();
    }
    // For may-block syscalls that were descheduled, the supervisor uses the
    // disarm ioctl above as a stable point to reset the record counter;
    // nothing from here on may assume num_rec_bytes is unchanged.

    (*buffer_hdr()).locked = syscallbuf_locked_why::empty();

    ret
}

/// `ret_size` is the result of a syscall indicating how much data was
/// returned in scratch buffer `buf2`; copy that data to `buf` and return a
/// pointer to the end of it. If there is no scratch buffer just return
/// `ptr_end`.
unsafe fn copy_output_buffer(
    ret_size: isize,
    ptr_end: *mut u8,
    buf: *mut u8,
    buf2: *mut u8,
) -> *mut u8 {
    if buf2.is_null() {
        return ptr_end;
    }
    if ret_size <= 0 {
        return buf2;
    }
    local_memcpy(buf, buf2, ret_size as usize);
    buf2.add(ret_size as usize)
}

// --- Syscall hooks (keep in alphabetical order) ---------------------------

unsafe fn sys_access(call: &syscall_info) -> isize {
    let syscallno = libc::SYS_access as isize;
    let pathname = call.args[0];
    let mode = call.args[1];

    let ptr_end = prep_syscall();
    if !start_commit_buffered_syscall(syscallno, ptr_end, WONT_BLOCK) {
        return traced_raw_syscall(call);
    }
    let ret = untraced_syscall!(syscallno, pathname, mode);
    commit_raw_syscall(syscallno, ptr_end, ret)
}

unsafe fn sys_clock_gettime(call: &syscall_info) -> isize {
    let syscallno = libc::SYS_clock_gettime as isize;
    let clk_id = call.args[0];
    let tp = call.args[1] as *mut libc::timespec;

    let mut ptr_end = prep_syscall();
    let mut tp2: *mut libc::timespec = ptr::null_mut();
    if !tp.is_null() && !ptr_end.is_null() {
        tp2 = ptr_end as *mut libc::timespec;
        ptr_end = ptr_end.add(size_of::<libc::timespec>());
    }
    if !start_commit_buffered_syscall(syscallno, ptr_end, WONT_BLOCK) {
        return traced_raw_syscall(call);
    }
    let ret = untraced_syscall!(syscallno, clk_id, tp2 as isize);
    if !tp.is_null() {
        local_memcpy(tp as *mut u8, tp2 as *const u8, size_of::<libc::timespec>());
    }
    commit_raw_syscall(syscallno, ptr_end, ret)
}

unsafe fn sys_close(call: &syscall_info) -> isize {
    let syscallno = libc::SYS_close as isize;
    let fd = call.args[0] as i32;

    let ptr_end = prep_syscall_for_fd(fd);
    if !start_commit_buffered_syscall(syscallno, ptr_end, WONT_BLOCK) {
        return traced_raw_syscall(call);
    }
    let ret = untraced_syscall!(syscallno, fd);
    commit_raw_syscall(syscallno, ptr_end, ret)
}

unsafe fn sys_creat(call: &syscall_info) -> isize {
    // creat() is equivalent to open() with O_CREAT|O_WRONLY|O_TRUNC.
    let open_call = syscall_info {
        no: libc::SYS_open as isize,
        args: [
            call.args[0],
            (libc::O_CREAT | libc::O_TRUNC | libc::O_WRONLY) as isize,
            call.args[1],
            0,
            0,
            0,
        ],
    };
    sys_open(&open_call)
}

unsafe fn sys_fcntl(call: &syscall_info) -> isize {
    match call.args[1] as i32 {
        libc::F_DUPFD
        | libc::F_GETFD
        | libc::F_GETFL
        | libc::F_GETOWN
        | libc::F_SETFL
        | libc::F_SETFD
        | libc::F_SETOWN => {
            // No outparams and known not to block.
            let syscallno = libc::SYS_fcntl as isize;
            let fd = call.args[0] as i32;
            let ptr_end = prep_syscall_for_fd(fd);
            if !start_commit_buffered_syscall(syscallno, ptr_end, WONT_BLOCK) {
                return traced_raw_syscall(call);
            }
            let ret = untraced_syscall!(syscallno, fd, call.args[1], call.args[2]);
            commit_raw_syscall(syscallno, ptr_end, ret)
        }
        // The lock and owner-ex families carry outparams or supervisor
        // significance; leave them traced.
        _ => traced_raw_syscall(call),
    }
}

/// struct timezone, not exported by the libc crate.
#[repr(C)]
#[derive(Copy, Clone)]
struct kernel_timezone {
    tz_minuteswest: i32,
    tz_dsttime: i32,
}

unsafe fn sys_gettimeofday(call: &syscall_info) -> isize {
    let syscallno = libc::SYS_gettimeofday as isize;
    let tv = call.args[0] as *mut libc::timeval;
    let tz = call.args[1] as *mut kernel_timezone;

    let mut ptr_end = prep_syscall();
    let mut tv2: *mut libc::timeval = ptr::null_mut();
    let mut tz2: *mut kernel_timezone = ptr::null_mut();
    if !ptr_end.is_null() {
        if !tv.is_null() {
            tv2 = ptr_end as *mut libc::timeval;
            ptr_end = ptr_end.add(size_of::<libc::timeval>());
        }
        if !tz.is_null() {
            tz2 = ptr_end as *mut kernel_timezone;
            ptr_end = ptr_end.add(size_of::<kernel_timezone>());
        }
    }
    if !start_commit_buffered_syscall(syscallno, ptr_end, WONT_BLOCK) {
        return traced_raw_syscall(call);
    }
    let ret = untraced_syscall!(syscallno, tv2 as isize, tz2 as isize);
    if !tv.is_null() {
        local_memcpy(tv as *mut u8, tv2 as *const u8, size_of::<libc::timeval>());
    }
    if !tz.is_null() {
        local_memcpy(tz as *mut u8, tz2 as *const u8, size_of::<kernel_timezone>());
    }
    commit_raw_syscall(syscallno, ptr_end, ret)
}

unsafe fn sys_ioctl(call: &syscall_info) -> isize {
    match call.args[1] as u64 {
        // cloexec toggles can't block and have no outparams.
        0x5451 /* FIOCLEX */ | 0x5450 /* FIONCLEX */ => {
            let syscallno = libc::SYS_ioctl as isize;
            let fd = call.args[0] as i32;
            let ptr_end = prep_syscall_for_fd(fd);
            if !start_commit_buffered_syscall(syscallno, ptr_end, WONT_BLOCK) {
                return traced_raw_syscall(call);
            }
            let ret = untraced_syscall!(syscallno, fd, call.args[1]);
            commit_raw_syscall(syscallno, ptr_end, ret)
        }
        _ => traced_raw_syscall(call),
    }
}

unsafe fn sys_futex(call: &syscall_info) -> isize {
    const FUTEX_CMD_MASK: isize = !(128 | 256);
    const FUTEX_WAKE: isize = 1;
    const FUTEX_CMP_REQUEUE: isize = 4;
    const FUTEX_WAKE_OP: isize = 5;

    let op = call.args[1];
    let uses_uaddr2 = match op & FUTEX_CMD_MASK {
        FUTEX_WAKE => false,
        FUTEX_CMP_REQUEUE | FUTEX_WAKE_OP => true,
        // It turns out not to be worth buffering the FUTEX_WAIT family:
        // when a WAIT call is made, the tracee is almost certainly going to
        // be descheduled (otherwise the userspace CAS would have
        // succeeded). This is unlike read/write, where the vast majority of
        // calls don't desched and the overhead pays off. All that buffering
        // WAIT would do is add the arm/disarm overhead, which dominates.
        // And never try to buffer FUTEX_LOCK_PI; it requires special
        // supervisor processing.
        _ => return traced_raw_syscall(call),
    };

    let syscallno = libc::SYS_futex as isize;
    let uaddr = call.args[0] as *mut u32;
    let uaddr2 = call.args[4] as *mut u32;

    let mut ptr_end = prep_syscall();
    let mut saved_uaddr: *mut u32 = ptr::null_mut();
    let mut saved_uaddr2: *mut u32 = ptr::null_mut();
    if !ptr_end.is_null() {
        // We have to record the value of the futex at kernel exit, but we
        // can't substitute a scratch pointer: the futex identity is the
        // memory cell itself.
        saved_uaddr = ptr_end as *mut u32;
        ptr_end = ptr_end.add(size_of::<u32>());
        if uses_uaddr2 {
            saved_uaddr2 = ptr_end as *mut u32;
            ptr_end = ptr_end.add(size_of::<u32>());
        }
    }
    if !start_commit_buffered_syscall(syscallno, ptr_end, WONT_BLOCK) {
        return traced_raw_syscall(call);
    }

    let ret = untraced_syscall!(
        syscallno,
        uaddr as isize,
        op,
        call.args[2],
        call.args[3],
        uaddr2 as isize,
        call.args[5]
    );

    // During recording, save the real futex words to the buffer; during
    // replay, restore them from the buffer. Reading the cells "carelessly"
    // is fine only because the buffer transaction is a critical section.
    copy_futex_int(saved_uaddr, uaddr);
    if uses_uaddr2 {
        copy_futex_int(saved_uaddr2, uaddr2);
    }
    commit_raw_syscall(syscallno, ptr_end, ret)
}

/// During recording, copy *real to *buf; during replay, copy *buf to
/// *real. The select is conditional-move based to keep control flow
/// identical.
unsafe fn copy_futex_int(buf: *mut u32, real: *mut u32) {
    let mut tmp_in_replay: u64 = GLOBALS.in_replay as u64;
    asm!(
        "test {tmp}, {tmp}",
        "mov {val:e}, [{real}]",
        "cmovne {val:e}, [{buf}]",
        "mov [{buf}], {val:e}",
        "mov [{real}], {val:e}",
        "xor {tmp}, {tmp}",
        tmp = inout(reg) tmp_in_replay,
        val = out(reg) _,
        buf = in(reg) buf,
        real = in(reg) real,
        options(nostack),
    );
    let _ = tmp_in_replay;
}

unsafe fn sys_madvise(call: &syscall_info) -> isize {
    match call.args[2] as i32 {
        // Fork-affecting advice changes recorded address-space semantics;
        // the supervisor must see those.
        libc::MADV_DONTFORK | libc::MADV_DOFORK | libc::MADV_REMOVE => traced_raw_syscall(call),
        _ => {
            let syscallno = libc::SYS_madvise as isize;
            let ptr_end = prep_syscall();
            if !start_commit_buffered_syscall(syscallno, ptr_end, WONT_BLOCK) {
                return traced_raw_syscall(call);
            }
            let ret = untraced_syscall!(syscallno, call.args[0], call.args[1], call.args[2]);
            commit_raw_syscall(syscallno, ptr_end, ret)
        }
    }
}

unsafe fn sys_open(call: &syscall_info) -> isize {
    let syscallno = libc::SYS_open as isize;
    let ptr_end = prep_syscall();
    if !start_commit_buffered_syscall(syscallno, ptr_end, WONT_BLOCK) {
        return traced_raw_syscall(call);
    }
    let ret = untraced_syscall!(syscallno, call.args[0], call.args[1], call.args[2]);
    commit_raw_syscall(syscallno, ptr_end, ret)
}

unsafe fn sys_poll(call: &syscall_info) -> isize {
    let syscallno = libc::SYS_poll as isize;
    let fds = call.args[0] as *mut libc::pollfd;
    let nfds = call.args[1] as usize;
    let timeout = call.args[2];

    let mut ptr_end = prep_syscall();
    let mut fds2: *mut libc::pollfd = ptr::null_mut();
    if !ptr_end.is_null() && !fds.is_null() && nfds > 0 {
        fds2 = ptr_end as *mut libc::pollfd;
        ptr_end = ptr_end.add(nfds * size_of::<libc::pollfd>());
    }
    if !start_commit_buffered_syscall(syscallno, ptr_end, MAY_BLOCK) {
        return traced_raw_syscall(call);
    }
    if !fds2.is_null() {
        // The kernel reads and writes the pollfd array.
        memcpy_input_parameter(fds2 as *mut u8, fds as *mut u8, nfds * size_of::<libc::pollfd>());
    }
    let ret = untraced_syscall!(syscallno, fds2 as isize, nfds, timeout);
    if !fds2.is_null() && ret >= 0 {
        local_memcpy(fds as *mut u8, fds2 as *const u8, nfds * size_of::<libc::pollfd>());
    }
    commit_raw_syscall(syscallno, ptr_end, ret)
}

unsafe fn sys_read(call: &syscall_info) -> isize {
    let syscallno = libc::SYS_read as isize;
    let fd = call.args[0] as i32;
    let buf = call.args[1] as *mut u8;
    let count = call.args[2] as usize;

    let mut ptr_end = prep_syscall_for_fd(fd);
    let mut buf2: *mut u8 = ptr::null_mut();
    if !ptr_end.is_null() && !buf.is_null() && count > 0 {
        buf2 = ptr_end;
        ptr_end = ptr_end.add(count);
    }
    if !start_commit_buffered_syscall(syscallno, ptr_end, MAY_BLOCK) {
        return traced_raw_syscall(call);
    }

    let ret = untraced_syscall!(syscallno, fd, buf2 as isize, count);
    let new_end = copy_output_buffer(ret, ptr_end, buf, buf2);
    commit_raw_syscall(syscallno, new_end, ret)
}

unsafe fn sys_readlink(call: &syscall_info) -> isize {
    let syscallno = libc::SYS_readlink as isize;
    let path = call.args[0];
    let buf = call.args[1] as *mut u8;
    let bufsiz = call.args[2] as usize;

    let mut ptr_end = prep_syscall();
    let mut buf2: *mut u8 = ptr::null_mut();
    if !ptr_end.is_null() && !buf.is_null() && bufsiz > 0 {
        buf2 = ptr_end;
        ptr_end = ptr_end.add(bufsiz);
    }
    if !start_commit_buffered_syscall(syscallno, ptr_end, WONT_BLOCK) {
        return traced_raw_syscall(call);
    }
    let ret = untraced_syscall!(syscallno, path, buf2 as isize, bufsiz);
    let new_end = copy_output_buffer(ret, ptr_end, buf, buf2);
    commit_raw_syscall(syscallno, new_end, ret)
}

unsafe fn sys_recvfrom(call: &syscall_info) -> isize {
    let syscallno = libc::SYS_recvfrom as isize;
    let fd = call.args[0] as i32;
    let buf = call.args[1] as *mut u8;
    let len = call.args[2] as usize;
    let flags = call.args[3];

    // Sockaddr outparams complicate the record; only the common
    // addressless form is buffered.
    if call.args[4] != 0 || call.args[5] != 0 {
        return traced_raw_syscall(call);
    }

    let mut ptr_end = prep_syscall_for_fd(fd);
    let mut buf2: *mut u8 = ptr::null_mut();
    if !ptr_end.is_null() && !buf.is_null() && len > 0 {
        buf2 = ptr_end;
        ptr_end = ptr_end.add(len);
    }
    if !start_commit_buffered_syscall(syscallno, ptr_end, MAY_BLOCK) {
        return traced_raw_syscall(call);
    }
    let ret = untraced_syscall!(syscallno, fd, buf2 as isize, len, flags, 0, 0);
    let new_end = copy_output_buffer(ret, ptr_end, buf, buf2);
    commit_raw_syscall(syscallno, new_end, ret)
}

unsafe fn sys_time(call: &syscall_info) -> isize {
    let syscallno = libc::SYS_time as isize;
    let tp = call.args[0] as *mut libc::time_t;

    let ptr_end = prep_syscall();
    if !start_commit_buffered_syscall(syscallno, ptr_end, WONT_BLOCK) {
        return traced_raw_syscall(call);
    }
    // Don't let the kernel write through an arbitrary pointer on the
    // buffered path; reconstruct the outparam from the return value.
    let ret = untraced_syscall!(syscallno, 0);
    if !tp.is_null() {
        *tp = ret as libc::time_t;
    }
    commit_raw_syscall(syscallno, ptr_end, ret)
}

unsafe fn sys_xstat(call: &syscall_info) -> isize {
    // stat, lstat and fstat share a buffer layout: one struct stat out.
    let syscallno = call.no;
    let mut ptr_end = if call.no == libc::SYS_fstat as isize {
        prep_syscall_for_fd(call.args[0] as i32)
    } else {
        prep_syscall()
    };
    let statbuf = call.args[1] as *mut libc::stat;
    let mut buf2: *mut libc::stat = ptr::null_mut();
    if !ptr_end.is_null() && !statbuf.is_null() {
        buf2 = ptr_end as *mut libc::stat;
        ptr_end = ptr_end.add(size_of::<libc::stat>());
    }
    if !start_commit_buffered_syscall(syscallno, ptr_end, WONT_BLOCK) {
        return traced_raw_syscall(call);
    }
    let ret = untraced_syscall!(syscallno, call.args[0], buf2 as isize);
    if !buf2.is_null() && ret == 0 {
        local_memcpy(statbuf as *mut u8, buf2 as *const u8, size_of::<libc::stat>());
    }
    commit_raw_syscall(syscallno, ptr_end, ret)
}

unsafe fn sys_write(call: &syscall_info) -> isize {
    let syscallno = libc::SYS_write as isize;
    let fd = call.args[0] as i32;

    let ptr_end = prep_syscall_for_fd(fd);
    if !start_commit_buffered_syscall(syscallno, ptr_end, MAY_BLOCK) {
        return traced_raw_syscall(call);
    }
    let ret = untraced_syscall!(syscallno, fd, call.args[1], call.args[2]);
    commit_raw_syscall(syscallno, ptr_end, ret)
}

unsafe fn sys_writev(call: &syscall_info) -> isize {
    let syscallno = libc::SYS_writev as isize;
    let fd = call.args[0] as i32;

    let ptr_end = prep_syscall_for_fd(fd);
    if !start_commit_buffered_syscall(syscallno, ptr_end, MAY_BLOCK) {
        return traced_raw_syscall(call);
    }
    let ret = untraced_syscall!(syscallno, fd, call.args[1], call.args[2]);
    commit_raw_syscall(syscallno, ptr_end, ret)
}

// --- Dispatch -------------------------------------------------------------

/// The patched call sites land here (via the trampoline's register
/// packaging). Select a per-syscall handler; anything unhandled falls
/// through to a plain traced syscall.
///
/// # Safety
/// `call` must point at a live syscall_info; this runs inside the buffer
/// critical section rules.
#[no_mangle]
pub unsafe extern "C" fn syscall_hook(call: *const syscall_info) -> isize {
    let call = &*call;
    let ret = match call.no as i64 {
        libc::SYS_access => sys_access(call),
        libc::SYS_clock_gettime => sys_clock_gettime(call),
        libc::SYS_close => sys_close(call),
        libc::SYS_creat => sys_creat(call),
        libc::SYS_fcntl => sys_fcntl(call),
        libc::SYS_futex => sys_futex(call),
        libc::SYS_gettimeofday => sys_gettimeofday(call),
        libc::SYS_ioctl => sys_ioctl(call),
        libc::SYS_madvise => sys_madvise(call),
        libc::SYS_open => sys_open(call),
        libc::SYS_poll => sys_poll(call),
        libc::SYS_read => sys_read(call),
        libc::SYS_readlink => sys_readlink(call),
        libc::SYS_recvfrom => sys_recvfrom(call),
        libc::SYS_stat | libc::SYS_lstat | libc::SYS_fstat => sys_xstat(call),
        libc::SYS_time => sys_time(call),
        libc::SYS_write => sys_write(call),
        libc::SYS_writev => sys_writev(call),
        _ => traced_raw_syscall(call),
    };
    ret
}

/// The libc-visible wrapper contract: raw status in, errno convention out.
///
/// # Safety
/// See syscall_hook.
#[no_mangle]
pub unsafe extern "C" fn syscall_hook_errno(call: *const syscall_info) -> isize {
    update_errno_ret(syscall_hook(call))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_space_math() {
        // A record that exactly fits leaves room for the next record's
        // header; one byte more must force the traced fallback. Mirror of
        // the bounds logic in start_commit_buffered_syscall.
        let record_start: usize = 0x1000;
        let buffer_end: usize = 0x1000 + 64;

        let fits = |record_len: u32| -> bool {
            let stored_end = record_start + stored_record_size(record_len) as usize;
            stored_end <= buffer_end - size_of::<syscallbuf_record>()
        };

        assert!(fits(16));
        assert!(fits(48));
        assert!(!fits(49));
        assert!(!fits(64));
    }

    #[test]
    fn syscall_info_layout() {
        assert_eq!(7 * size_of::<isize>(), size_of::<syscall_info>());
    }
}
