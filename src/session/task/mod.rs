pub mod record_task;
pub mod replay_task;
pub mod task_inner;

use crate::{
    kernel_abi::SupportedArch,
    registers::Registers,
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::{RemotePtr, Void},
    session::address_space::AddressSpaceSharedPtr,
    sig::Sig,
    taskish_uid::TaskUid,
    ticks::Ticks,
    wait_status::WaitStatus,
};
use libc::pid_t;
use record_task::RecordTask;
use replay_task::ReplayTask;
use std::{cell::RefCell, mem::size_of, rc::Rc};
use task_inner::{TaskInner, TrapReasons};

pub type TaskSharedPtr = Rc<RefCell<Box<dyn Task>>>;

/// A single tracee thread under supervision. Record and replay tasks share
/// all the ptrace plumbing through `TaskInner`; the trait carries the
/// common read-only surface so `&dyn Task` is usable throughout.
pub trait Task {
    fn as_task_inner(&self) -> &TaskInner;
    fn as_task_inner_mut(&mut self) -> &mut TaskInner;

    fn as_record_task(&self) -> Option<&RecordTask> {
        None
    }
    fn as_record_task_mut(&mut self) -> Option<&mut RecordTask> {
        None
    }
    fn as_replay_task(&self) -> Option<&ReplayTask> {
        None
    }
    fn as_replay_task_mut(&mut self) -> Option<&mut ReplayTask> {
        None
    }

    // Convenience forwarding; these keep `&dyn Task` pleasant to use.

    fn tid(&self) -> pid_t {
        self.as_task_inner().tid
    }

    fn rec_tid(&self) -> pid_t {
        self.as_task_inner().rec_tid
    }

    fn tuid(&self) -> TaskUid {
        self.as_task_inner().tuid()
    }

    fn arch(&self) -> SupportedArch {
        self.as_task_inner().arch()
    }

    fn ip(&self) -> RemoteCodePtr {
        self.as_task_inner().regs_ref().ip()
    }

    fn regs_ref(&self) -> &Registers {
        self.as_task_inner().regs_ref()
    }

    fn tick_count(&self) -> Ticks {
        self.as_task_inner().tick_count()
    }

    fn status(&self) -> WaitStatus {
        self.as_task_inner().status()
    }

    fn maybe_stop_sig(&self) -> Option<Sig> {
        self.as_task_inner().status().stop_sig()
    }

    fn vm(&self) -> AddressSpaceSharedPtr {
        self.as_task_inner().vm()
    }

    fn read_bytes_fallible(&self, addr: RemotePtr<Void>, buf: &mut [u8]) -> bool {
        self.as_task_inner().read_bytes_fallible(addr, buf)
    }

    fn write_bytes_careful(&self, addr: RemotePtr<Void>, buf: &[u8]) -> bool {
        self.as_task_inner().write_bytes_careful(addr, buf)
    }

    fn get_siginfo(&self) -> libc::siginfo_t {
        self.as_task_inner().get_siginfo()
    }

    fn compute_trap_reasons(&mut self) -> TrapReasons {
        self.as_task_inner_mut().compute_trap_reasons()
    }

    fn move_ip_before_breakpoint(&mut self) {
        self.as_task_inner_mut().move_ip_before_breakpoint()
    }
}

/// Read a plain-data value from the tracee.
pub fn read_val_mem<T: Copy>(t: &dyn Task, addr: RemotePtr<T>) -> T {
    let mut value = std::mem::MaybeUninit::<T>::uninit();
    let buf =
        unsafe { std::slice::from_raw_parts_mut(value.as_mut_ptr() as *mut u8, size_of::<T>()) };
    if !t.read_bytes_fallible(addr.to_data_ptr(), buf) {
        fatal!("Can't read value at {:?} in task {}", addr, t.tid());
    }
    unsafe { value.assume_init() }
}

/// Write a plain-data value into the tracee.
pub fn write_val_mem<T: Copy>(t: &dyn Task, addr: RemotePtr<T>, value: &T) {
    let buf =
        unsafe { std::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) };
    if !t.write_bytes_careful(addr.to_data_ptr(), buf) {
        fatal!("Can't write value at {:?} in task {}", addr, t.tid());
    }
}

/// Read `size` bytes from the tracee.
pub fn read_mem(t: &dyn Task, addr: RemotePtr<Void>, size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    if !t.read_bytes_fallible(addr, &mut buf) {
        fatal!("Can't read {} bytes at {} in task {}", size, addr, t.tid());
    }
    buf
}

/// Write bytes into the tracee, aborting on failure.
pub fn write_mem(t: &dyn Task, addr: RemotePtr<Void>, buf: &[u8]) {
    if !t.write_bytes_careful(addr, buf) {
        fatal!(
            "Can't write {} bytes at {} in task {}",
            buf.len(),
            addr,
            t.tid()
        );
    }
}
