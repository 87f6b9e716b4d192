//! Forcing a stopped tracee to execute syscalls on the supervisor's behalf.
//!
//! `AutoRemoteSyscalls` saves the tracee's registers, points the instruction
//! pointer at the traced-syscall instruction in the engine page, and drives
//! the tracee to the syscall exit stop; registers are restored on every exit
//! path. `AutoRestoreMem` borrows tracee stack for by-reference arguments,
//! restoring the original bytes on drop. Both releases are idempotent, so a
//! failure mid-acquisition unwinds cleanly.

use crate::{
    kernel_abi::{
        has_socketcall_syscall, syscall_instruction_length, syscall_number_for_close,
        syscall_number_for_connect, syscall_number_for_fchdir, syscall_number_for_mmap,
        syscall_number_for_sendmsg, syscall_number_for_socket, SupportedArch,
    },
    kernel_metadata::{errno_name, syscall_name},
    log::LogLevel::LogDebug,
    registers::Registers,
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::{RemotePtr, Void},
    scoped_fd::ScopedFd,
    session::task::{write_mem, Task},
    util::page_size,
    wait_status::WaitStatus,
};
use libc::{SCM_RIGHTS, SOL_SOCKET};
use nix::sys::{
    mman::{MapFlags, ProtFlags},
    socket::{accept, bind, listen, socket, AddressFamily, SockAddr, SockFlag, SockType},
    uio::IoVec,
};
use std::{
    mem::size_of,
    os::unix::io::RawFd,
};

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum MemParamsEnabled {
    EnableMemoryParams,
    DisableMemoryParams,
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum SyscallWaiting {
    WaitForCompletion,
    DontWait,
}

/// RAII helper to prepare a Task for remote syscalls and undo any
/// preparation upon going out of scope. Note that this restores register
/// values when going out of scope, so *all* changes to the Task's register
/// state are lost.
///
/// NB: before preparing for a series of remote syscalls, the caller *must*
/// ensure the tracee will not receive any signals. This code does not
/// attempt to deal with signals.
pub struct AutoRemoteSyscalls<'a> {
    t: &'a mut dyn Task,
    initial_regs: Registers,
    initial_ip: RemoteCodePtr,
    initial_sp: RemotePtr<Void>,
    pending_syscallno: i32,
    restore_wait_status: WaitStatus,
    restored: bool,
}

impl<'a> AutoRemoteSyscalls<'a> {
    /// Prepare `t` for a series of remote syscalls.
    pub fn new_with_mem_params(
        t: &'a mut dyn Task,
        enable_mem_params: MemParamsEnabled,
    ) -> AutoRemoteSyscalls<'a> {
        let initial_regs = *t.regs_ref();
        let initial_ip = initial_regs.ip();
        let initial_sp = initial_regs.sp();
        let restore_wait_status = t.status();

        let mut this = AutoRemoteSyscalls {
            t,
            initial_regs,
            initial_ip,
            initial_sp,
            pending_syscallno: -1,
            restore_wait_status,
            restored: false,
        };

        // Execute the syscall from the engine page's traced entry so the
        // seccomp filter reports it to us like any other traced syscall.
        let ip = this.t.vm().traced_syscall_ip();
        this.initial_regs.set_ip(ip);
        match enable_mem_params {
            MemParamsEnabled::EnableMemoryParams => this.maybe_fix_stack_pointer(),
            MemParamsEnabled::DisableMemoryParams => {
                this.initial_regs.set_sp(RemotePtr::null());
            }
        }
        this
    }

    /// You mostly want to use this convenience constructor.
    pub fn new(t: &'a mut dyn Task) -> AutoRemoteSyscalls<'a> {
        Self::new_with_mem_params(t, MemParamsEnabled::EnableMemoryParams)
    }

    /// If the tracee's stack pointer doesn't look valid, temporarily adjust
    /// it to the top of *some* usable stack area.
    fn maybe_fix_stack_pointer(&mut self) {
        let sp = self.initial_regs.sp();
        if !sp.is_null() {
            let last_stack_byte = sp - 1usize;
            if let Some(m) = self.t.vm().mapping_of(last_stack_byte) {
                if is_usable_area(&m.map) && m.map.start() + 2048usize <= sp {
                    // sp is in a stack region and there's plenty of space.
                    return;
                }
            }
        }

        let mut found_stack: Option<RemotePtr<Void>> = None;
        for m in self.t.vm().mappings_vec() {
            if is_usable_area(&m.map) {
                found_stack = Some(m.map.end());
                break;
            }
        }
        match found_stack {
            Some(end) => self.initial_regs.set_sp(end),
            None => fatal!("No stack area found in task {}", self.t.tid()),
        }
    }

    pub fn task_mut(&mut self) -> &mut dyn Task {
        self.t
    }

    pub fn task(&self) -> &dyn Task {
        self.t
    }

    pub fn arch(&self) -> SupportedArch {
        self.t.arch()
    }

    /// "Initial" registers saved from the target task.
    pub fn regs(&self) -> &Registers {
        &self.initial_regs
    }

    pub fn regs_mut(&mut self) -> &mut Registers {
        &mut self.initial_regs
    }

    /// Undo any preparations to make remote syscalls. Usually called
    /// automatically on drop; idempotent.
    pub fn restore_state(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;
        self.initial_regs.set_ip(self.initial_ip);
        self.initial_regs.set_sp(self.initial_sp);
        // Restore stomped registers.
        self.t.as_task_inner_mut().set_regs(self.initial_regs);
        let _ = self.restore_wait_status;
    }

    /// Make `syscallno` with up to 6 args. Returns the raw kernel return
    /// value; -ESRCH if the process dies or has died.
    pub fn syscall(&mut self, syscallno: i32, args: &[usize]) -> isize {
        let mut callregs = self.initial_regs;
        for (i, &arg) in args.iter().enumerate() {
            callregs.set_arg(i + 1, arg);
        }
        self.syscall_helper(SyscallWaiting::WaitForCompletion, syscallno, callregs);
        self.t.regs_ref().syscall_result_signed()
    }

    /// Like `syscall`, but fatal when the result is an error.
    pub fn infallible_syscall(&mut self, syscallno: i32, args: &[usize]) -> isize {
        let ret = self.syscall(syscallno, args);
        self.check_syscall_result(syscallno, ret);
        ret
    }

    pub fn infallible_syscall_ptr(&mut self, syscallno: i32, args: &[usize]) -> RemotePtr<Void> {
        RemotePtr::new(self.infallible_syscall(syscallno, args) as usize)
    }

    /// The remote mmap, selecting mmap2 where the architecture requires it.
    pub fn infallible_mmap_syscall(
        &mut self,
        addr: RemotePtr<Void>,
        length: usize,
        prot: ProtFlags,
        flags: MapFlags,
        child_fd: i32,
        offset_pages: u64,
    ) -> RemotePtr<Void> {
        let arch = self.arch();
        let offset_arg = if crate::kernel_abi::has_mmap2_syscall(arch) {
            offset_pages as usize
        } else {
            (offset_pages as usize) * page_size()
        };
        let ret = self.infallible_syscall_ptr(
            syscall_number_for_mmap(arch),
            &[
                addr.as_usize(),
                length,
                prot.bits() as usize,
                flags.bits() as usize,
                child_fd as usize,
                offset_arg,
            ],
        );
        if flags.contains(MapFlags::MAP_FIXED) {
            ed_assert!(self.t, addr == ret, "MAP_FIXED at {} but got {}", addr, ret);
        }
        ret
    }

    /// Drive the tracee into `syscallno` with the given registers, then to
    /// the syscall-exit stop when waiting is requested.
    pub fn syscall_helper(
        &mut self,
        wait: SyscallWaiting,
        syscallno: i32,
        mut callregs: Registers,
    ) {
        callregs.set_syscallno(syscallno as isize);
        self.t.as_task_inner_mut().set_regs(callregs);

        // First stop: syscall entry.
        self.t.as_task_inner_mut().advance_syscall();

        let t = &mut *self.t;
        ed_assert!(
            t,
            t.regs_ref().ip() - callregs.ip() == syscall_instruction_length(t.arch()) as isize,
            "Should have advanced ip by one syscall_insn"
        );
        ed_assert!(
            t,
            t.regs_ref().original_syscallno() == syscallno as isize,
            "Should be entering {}, but instead at {}",
            syscall_name(syscallno, t.arch()),
            syscall_name(t.regs_ref().original_syscallno() as i32, t.arch())
        );

        // Start running the syscall.
        self.pending_syscallno = syscallno;
        if wait == SyscallWaiting::WaitForCompletion {
            self.wait_syscall(syscallno);
        }
    }

    /// Wait for the pending remote syscall to reach its exit stop.
    pub fn wait_syscall(&mut self, syscallno: i32) {
        ed_assert!(
            self.t,
            self.pending_syscallno == syscallno || syscallno < 0
        );

        // Wait for the syscall-exit trap.
        self.t.as_task_inner_mut().advance_syscall();
        self.pending_syscallno = -1;

        ed_assert!(
            self.t,
            self.t.regs_ref().original_syscallno() == syscallno as isize || syscallno < 0,
            "Should have exited {}, but instead at {}",
            syscall_name(syscallno, self.t.arch()),
            syscall_name(self.t.regs_ref().original_syscallno() as i32, self.t.arch())
        );
    }

    fn check_syscall_result(&mut self, syscallno: i32, ret: isize) {
        if -4096 < ret && ret < 0 {
            ed_assert!(
                self.t,
                false,
                "Syscall {} failed with errno {}",
                syscall_name(syscallno, self.t.arch()),
                errno_name(-ret as i32)
            );
        }
    }

    /// Arranges for `fd` to be transmitted to this process and returns
    /// our opened version of it: the tracee connects to a temporary Unix
    /// socket and sends the descriptor as SCM_RIGHTS ancillary data.
    pub fn retrieve_fd(&mut self, fd: i32) -> ScopedFd {
        let arch = self.arch();
        let path = format!(
            "/tmp/retrace-tracee-fd-transfer-{}-{}",
            self.t.tid(),
            rand::random::<u32>()
        );

        let listen_sock = create_bind_and_listen_socket(&path);

        // sockaddr_un, msghdr, iovec and a cmsg all live in borrowed tracee
        // stack during the dance.
        let data_length = 256 + 3 * 64;
        let mut remote_buf = AutoRestoreMem::new(self, None, data_length);
        let buf_start = match remote_buf.get() {
            Some(p) => p,
            None => fatal!("Failed to reserve tracee stack for fd transfer"),
        };

        // Child: socket(AF_UNIX, SOCK_STREAM, 0)
        let child_sock = if has_socketcall_syscall(arch) {
            fatal!("socketcall fd transfer not supported for 32-bit tracees here");
        } else {
            remote_buf.remote.infallible_syscall(
                syscall_number_for_socket(arch),
                &[libc::AF_UNIX as usize, libc::SOCK_STREAM as usize, 0],
            ) as i32
        };

        // Child: connect(child_sock, &addr, sizeof(addr))
        let addr_remote = buf_start;
        let addr_bytes = sockaddr_un_bytes(&path);
        write_mem(remote_buf.remote.task(), addr_remote, &addr_bytes);
        {
            let mut callregs = *remote_buf.remote.regs();
            callregs.set_arg1(child_sock as usize);
            callregs.set_arg2(addr_remote.as_usize());
            callregs.set_arg3(addr_bytes.len());
            // DONT_WAIT: connect() blocks until our accept(), so waiting
            // here would deadlock against ourselves.
            remote_buf.remote.syscall_helper(
                SyscallWaiting::DontWait,
                syscall_number_for_connect(arch),
                callregs,
            );
        }

        // Now the child is waiting for us to accept it.
        let sock = match accept(listen_sock.as_raw()) {
            Ok(fd) => ScopedFd::from_raw(fd),
            Err(_) => fatal!("Failed to create parent socket"),
        };

        // Complete the child's connect().
        remote_buf
            .remote
            .wait_syscall(syscall_number_for_connect(arch));
        let child_syscall_result = remote_buf.remote.task().regs_ref().syscall_result_signed();
        if child_syscall_result != 0 {
            fatal!(
                "Failed to connect() in tracee; err={}",
                errno_name(-child_syscall_result as i32)
            );
        }

        // Listening socket not needed anymore.
        drop(listen_sock);
        std::fs::remove_file(&path).unwrap_or(());

        // Child: sendmsg(child_sock, &msg, 0) carrying SCM_RIGHTS fd.
        let msg_remote = RemotePtr::<Void>::new(align_up(addr_remote.as_usize() + addr_bytes.len(), 8));
        let sendmsg_layout = build_sendmsg_with_fd(arch, msg_remote, fd);
        write_mem(remote_buf.remote.task(), msg_remote, &sendmsg_layout.bytes);
        {
            let mut callregs = *remote_buf.remote.regs();
            callregs.set_arg1(child_sock as usize);
            callregs.set_arg2(msg_remote.as_usize() + sendmsg_layout.msghdr_offset);
            callregs.set_arg3(0);
            // Similarly DONT_WAIT: sendmsg may block on our recvmsg.
            remote_buf.remote.syscall_helper(
                SyscallWaiting::DontWait,
                syscall_number_for_sendmsg(arch),
                callregs,
            );
        }

        // The child may be waiting on our recvmsg().
        let our_fd = recvmsg_socket(sock.as_raw());

        remote_buf
            .remote
            .wait_syscall(syscall_number_for_sendmsg(arch));
        let child_syscall_result = remote_buf.remote.task().regs_ref().syscall_result_signed();
        if child_syscall_result <= 0 {
            fatal!(
                "Failed to sendmsg() in tracee; err={}",
                errno_name(-child_syscall_result as i32)
            );
        }

        // Child: close(child_sock)
        remote_buf
            .remote
            .infallible_syscall(syscall_number_for_close(arch), &[child_sock as usize]);

        log!(LogDebug, "retrieved fd {} from tracee as fd {}", fd, our_fd);
        ScopedFd::from_raw(our_fd)
    }

    /// Make the tracee change directory via an fd; used around fd transfer
    /// when the tracee lives in another mount namespace.
    pub fn infallible_fchdir(&mut self, dir_fd: i32) {
        let arch = self.arch();
        self.infallible_syscall(syscall_number_for_fchdir(arch), &[dir_fd as usize]);
    }
}

impl<'a> Drop for AutoRemoteSyscalls<'a> {
    fn drop(&mut self) {
        self.restore_state();
    }
}

fn is_usable_area(km: &crate::session::address_space::kernel_mapping::KernelMapping) -> bool {
    km.prot()
        .contains(ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)
        && km.flags().contains(MapFlags::MAP_PRIVATE)
}

/// Borrowed tracee stack space. The original bytes at the borrowed range
/// are restored on drop, and the stack pointer is moved back.
pub struct AutoRestoreMem<'a, 'b> {
    pub remote: &'a mut AutoRemoteSyscalls<'b>,
    addr: Option<RemotePtr<Void>>,
    saved_data: Vec<u8>,
    len: usize,
    released: bool,
}

impl<'a, 'b> AutoRestoreMem<'a, 'b> {
    /// Reserve `num_bytes` of tracee stack, optionally writing `mem` there.
    pub fn new(
        remote: &'a mut AutoRemoteSyscalls<'b>,
        mem: Option<&[u8]>,
        num_bytes: usize,
    ) -> AutoRestoreMem<'a, 'b> {
        let mut this = AutoRestoreMem {
            remote,
            addr: None,
            saved_data: vec![0; num_bytes],
            len: num_bytes,
            released: false,
        };
        this.init(mem);
        this
    }

    /// Convenience constructor for pushing a C string, including the
    /// trailing NUL byte.
    pub fn push_cstr(remote: &'a mut AutoRemoteSyscalls<'b>, s: &str) -> AutoRestoreMem<'a, 'b> {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        let n = bytes.len();
        AutoRestoreMem::new(remote, Some(&bytes), n)
    }

    fn init(&mut self, mem: Option<&[u8]>) {
        ed_assert!(
            self.remote.task(),
            !self.remote.regs().sp().is_null(),
            "Memory parameters were disabled"
        );

        let new_sp = self.remote.regs().sp() - self.len;
        self.remote.regs_mut().set_sp(new_sp);
        let regs = *self.remote.regs();
        self.remote.task_mut().as_task_inner_mut().set_regs(regs);
        self.addr = Some(new_sp);

        if !self
            .remote
            .task()
            .read_bytes_fallible(new_sp, &mut self.saved_data)
        {
            // The stack might not extend this far yet; treat the borrow as
            // writing fresh bytes only.
            self.saved_data.clear();
        }

        if let Some(m) = mem {
            write_mem(self.remote.task(), new_sp, m);
        }
    }

    /// A pointer to the reserved memory, or None if the reservation failed.
    pub fn get(&self) -> Option<RemotePtr<Void>> {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.len
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(addr) = self.addr {
            if !self.saved_data.is_empty() {
                write_mem(self.remote.task(), addr, &self.saved_data);
            }
            let restored_sp = addr + self.len;
            self.remote.regs_mut().set_sp(restored_sp);
            let regs = *self.remote.regs();
            self.remote.task_mut().as_task_inner_mut().set_regs(regs);
        }
    }
}

impl<'a, 'b> Drop for AutoRestoreMem<'a, 'b> {
    fn drop(&mut self) {
        self.release();
    }
}

fn create_bind_and_listen_socket(path: &str) -> ScopedFd {
    let sock = match socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    ) {
        Ok(fd) => fd,
        Err(_) => fatal!("Failed to create listen socket"),
    };
    let addr = SockAddr::new_unix(std::path::Path::new(path))
        .unwrap_or_else(|_| fatal!("Bad socket path {:?}", path));
    if bind(sock, &addr).is_err() {
        fatal!("Failed to bind listen socket");
    }
    if listen(sock, 1).is_err() {
        fatal!("Failed to mark listening for listen socket");
    }
    ScopedFd::from_raw(sock)
}

fn recvmsg_socket(sock: RawFd) -> RawFd {
    use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};

    let mut received_data = [0u8; 1];
    let iov = [IoVec::from_mut_slice(&mut received_data)];
    let mut cmsgspace = nix::cmsg_space!(RawFd);

    let msg = match recvmsg(sock, &iov, Some(&mut cmsgspace), MsgFlags::empty()) {
        Ok(m) => m,
        Err(_) => fatal!("Failed to receive fd"),
    };
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                debug_assert!(fd >= 0);
                return fd;
            }
        }
    }
    fatal!("No SCM_RIGHTS fd received");
}

fn sockaddr_un_bytes(path: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 108);
    out.extend_from_slice(&(libc::AF_UNIX as u16).to_le_bytes());
    let path_bytes = path.as_bytes();
    debug_assert!(path_bytes.len() < 108);
    out.extend_from_slice(path_bytes);
    out.resize(2 + 108, 0);
    out
}

struct SendmsgLayout {
    bytes: Vec<u8>,
    /// Offset of the msghdr within `bytes`.
    msghdr_offset: usize,
}

fn word_size(arch: SupportedArch) -> usize {
    match arch {
        SupportedArch::X86 => 4,
        SupportedArch::X64 => 8,
    }
}

fn push_word(buf: &mut Vec<u8>, arch: SupportedArch, val: u64) {
    match arch {
        SupportedArch::X86 => buf.extend_from_slice(&(val as u32).to_le_bytes()),
        SupportedArch::X64 => buf.extend_from_slice(&val.to_le_bytes()),
    }
}

fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

/// Assemble the iovec, cmsg buffer and msghdr for a tracee
/// sendmsg-with-SCM_RIGHTS, laid out contiguously at `base` in the tracee.
/// The layouts differ by architecture width; the event's arch tag decides.
fn build_sendmsg_with_fd(arch: SupportedArch, base: RemotePtr<Void>, fd: i32) -> SendmsgLayout {
    let w = word_size(arch);
    let cmsg_align = w;
    let cmsg_hdr_len = align_up(w + 4 + 4, cmsg_align);
    let cmsg_len = cmsg_hdr_len + size_of::<i32>();
    let cmsg_space = align_up(cmsg_len, cmsg_align);

    let mut bytes: Vec<u8> = Vec::new();

    // One byte of real payload; sendmsg refuses an empty iov.
    bytes.push(b'F');
    while bytes.len() % w != 0 {
        bytes.push(0);
    }

    // iovec
    let iov_offset = bytes.len();
    push_word(&mut bytes, arch, base.as_usize() as u64); // iov_base -> payload byte
    push_word(&mut bytes, arch, 1); // iov_len

    // cmsg
    let cmsg_offset = bytes.len();
    push_word(&mut bytes, arch, cmsg_len as u64); // cmsg_len
    bytes.extend_from_slice(&(SOL_SOCKET as i32).to_le_bytes()); // cmsg_level
    bytes.extend_from_slice(&(SCM_RIGHTS as i32).to_le_bytes()); // cmsg_type
    bytes.extend_from_slice(&fd.to_le_bytes()); // the fd
    while bytes.len() < cmsg_offset + cmsg_space {
        bytes.push(0);
    }

    // msghdr
    let msghdr_offset = bytes.len();
    push_word(&mut bytes, arch, 0); // msg_name
    bytes.extend_from_slice(&0u32.to_le_bytes()); // msg_namelen
    if arch == SupportedArch::X64 {
        bytes.extend_from_slice(&0u32.to_le_bytes()); // padding
    }
    push_word(&mut bytes, arch, (base.as_usize() + iov_offset) as u64); // msg_iov
    push_word(&mut bytes, arch, 1); // msg_iovlen
    push_word(&mut bytes, arch, (base.as_usize() + cmsg_offset) as u64); // msg_control
    push_word(&mut bytes, arch, cmsg_space as u64); // msg_controllen
    bytes.extend_from_slice(&0i32.to_le_bytes()); // msg_flags
    if arch == SupportedArch::X64 {
        bytes.extend_from_slice(&0u32.to_le_bytes()); // tail padding
    }

    SendmsgLayout {
        bytes,
        msghdr_offset,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::convert::TryInto;

    #[test]
    fn sockaddr_layout() {
        let bytes = sockaddr_un_bytes("/tmp/retrace-test-sock");
        assert_eq!(110, bytes.len());
        assert_eq!(libc::AF_UNIX as u16, u16::from_le_bytes([bytes[0], bytes[1]]));
        assert_eq!(b'/', bytes[2]);
    }

    #[test]
    fn sendmsg_layout_x64() {
        let layout = build_sendmsg_with_fd(SupportedArch::X64, RemotePtr::new(0x1000), 42);
        // msghdr is 56 bytes on x86_64 and must end the buffer.
        assert_eq!(layout.bytes.len() - 56, layout.msghdr_offset);
        // cmsg_len = CMSG_LEN(sizeof(int)) = 16 + 4.
        let cmsg_offset = 16;
        let cmsg_len = u64::from_le_bytes(
            layout.bytes[cmsg_offset..cmsg_offset + 8].try_into().unwrap(),
        );
        assert_eq!(20, cmsg_len);
    }

    #[test]
    fn sendmsg_layout_x86_uses_narrow_words() {
        let layout = build_sendmsg_with_fd(SupportedArch::X86, RemotePtr::new(0x1000), 3);
        // msghdr is 28 bytes on x86.
        assert_eq!(layout.bytes.len() - 28, layout.msghdr_offset);
    }

    #[test]
    fn align_up_rounds() {
        assert_eq!(0, align_up(0, 8));
        assert_eq!(8, align_up(1, 8));
        assert_eq!(8, align_up(8, 8));
        assert_eq!(12, align_up(9, 4));
    }
}
