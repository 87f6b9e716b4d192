//! A cached view of a tracee address space: every mapping, breakpoint and
//! watchpoint, plus the engine-page anchors published by the preload
//! library.

pub mod kernel_mapping;
pub mod memory_range;

use crate::{
    emu_fs::EmuFileSharedPtr,
    log::LogLevel::{LogDebug, LogWarn},
    preload_interface::{
        RETRACE_PAGE_ADDR, RETRACE_PAGE_SYSCALL_PRIVILEGED_TRACED,
        RETRACE_PAGE_SYSCALL_PRIVILEGED_UNTRACED, RETRACE_PAGE_SYSCALL_TRACED,
        RETRACE_PAGE_SYSCALL_UNTRACED,
    },
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::{RemotePtr, Void},
    session::task::Task,
    taskish_uid::AddressSpaceUid,
    util::{ceil_page_size, floor_page_size, page_size},
};
use kernel_mapping::KernelMapping;
use libc::pid_t;
use memory_range::{MemoryRange, MemoryRangeKey};
use nix::sys::mman::{MapFlags, ProtFlags};
use std::{
    cell::{Cell, Ref, RefCell},
    collections::{BTreeMap, HashMap},
    ffi::{OsStr, OsString},
    ops::Deref,
    rc::{Rc, Weak},
};

/// The trap instruction byte.
const BREAKPOINT_INSN: u8 = 0xcc;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BreakpointType {
    BkptNone,
    /// Trap for internal use (e.g. the stop at the end of a syscallbuf
    /// flush).
    BkptInternal,
    /// Trap on behalf of the debugger.
    BkptUser,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WatchType {
    Exec,
    Write,
    ReadWrite,
}

bitflags! {
    /// Hardware debug-status bits reported after a trap.
    pub struct DebugStatus: usize {
        const DS_WATCHPOINT0 = 1 << 0;
        const DS_WATCHPOINT1 = 1 << 1;
        const DS_WATCHPOINT2 = 1 << 2;
        const DS_WATCHPOINT3 = 1 << 3;
        const DS_SINGLESTEP = 1 << 14;
        const DS_WATCHPOINT_ANY = 0xf;
    }
}

bitflags! {
    pub struct MappingFlags: u32 {
        /// This mapping represents a syscallbuf ring. It needs to be handled
        /// specially during checkpoint/restore.
        const IS_SYSCALLBUF = 0x1;
        /// This mapping is the engine page.
        const IS_ENGINE_PAGE = 0x2;
        /// This mapping holds the preload globals.
        const IS_PRELOAD_GLOBALS = 0x4;
    }
}

bitflags! {
    struct RwxBits: u32 {
        const EXEC_BIT = 1 << 0;
        const READ_BIT = 1 << 1;
        const WRITE_BIT = 1 << 2;
        const READ_WRITE_BITS = Self::READ_BIT.bits | Self::WRITE_BIT.bits;
    }
}

bitflags! {
    pub struct WriteFlags: u32 {
        const IS_BREAKPOINT_RELATED = 0x1;
    }
}

/// One watchpoint's placement: address range plus flavour.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct WatchConfig {
    pub addr: RemotePtr<Void>,
    pub num_bytes: usize,
    pub type_: WatchType,
}

impl WatchConfig {
    pub fn new(addr: RemotePtr<Void>, num_bytes: usize, type_: WatchType) -> WatchConfig {
        WatchConfig {
            addr,
            num_bytes,
            type_,
        }
    }
}

/// A mapping known to the supervisor. `map` is the live view; `recorded_map`
/// is the same tuple as captured at record time, which may differ on replay
/// when the backing file has been rewritten into the trace directory.
#[derive(Clone)]
pub struct Mapping {
    pub map: KernelMapping,
    pub recorded_map: KernelMapping,
    /// The emulated file backing this mapping on replay, if any. Shared
    /// mappings are reinstalled against the emulated filesystem so a
    /// checkpoint clone's mutations are isolated from the origin.
    pub emu_file: Option<EmuFileSharedPtr>,
    pub flags: MappingFlags,
}

impl Mapping {
    pub fn new(map: KernelMapping, recorded_map: KernelMapping) -> Mapping {
        Mapping {
            map,
            recorded_map,
            emu_file: None,
            flags: MappingFlags::empty(),
        }
    }

    pub fn with_emu_file(
        map: KernelMapping,
        recorded_map: KernelMapping,
        emu_file: EmuFileSharedPtr,
    ) -> Mapping {
        Mapping {
            map,
            recorded_map,
            emu_file: Some(emu_file),
            flags: MappingFlags::empty(),
        }
    }
}

pub type MemoryMap = BTreeMap<MemoryRangeKey, Mapping>;
pub type AddressSpaceSharedPtr = Rc<AddressSpace>;
pub type AddressSpaceSharedWeakPtr = Weak<AddressSpace>;

struct Breakpoint {
    /// The byte displaced by the trap instruction.
    overwritten_data: u8,
    internal_count: u32,
    user_count: u32,
}

impl Breakpoint {
    fn new(overwritten_data: u8) -> Breakpoint {
        Breakpoint {
            overwritten_data,
            internal_count: 0,
            user_count: 0,
        }
    }

    fn do_ref(&mut self, which: BreakpointType) {
        match which {
            BreakpointType::BkptInternal => self.internal_count += 1,
            BreakpointType::BkptUser => self.user_count += 1,
            BreakpointType::BkptNone => fatal!("Bad breakpoint type"),
        }
    }

    fn do_unref(&mut self, which: BreakpointType) -> u32 {
        match which {
            BreakpointType::BkptInternal => {
                debug_assert!(self.internal_count > 0);
                self.internal_count -= 1;
            }
            BreakpointType::BkptUser => {
                debug_assert!(self.user_count > 0);
                self.user_count -= 1;
            }
            BreakpointType::BkptNone => fatal!("Bad breakpoint type"),
        }
        self.internal_count + self.user_count
    }

    /// User breakpoints dominate: a user breakpoint on an address with an
    /// internal refcount still reports as User.
    fn bp_type(&self) -> BreakpointType {
        if self.user_count > 0 {
            BreakpointType::BkptUser
        } else if self.internal_count > 0 {
            BreakpointType::BkptInternal
        } else {
            BreakpointType::BkptNone
        }
    }
}

#[derive(Clone)]
struct Watchpoint {
    num_bytes: usize,
    exec_count: u32,
    read_count: u32,
    write_count: u32,
    /// The value bytes at allocation time, used to detect write-firing by
    /// differential compare after each trap.
    value_bytes: Vec<u8>,
    valid: bool,
    changed: bool,
    /// Debug registers allocated for read/exec watching.
    in_register_exec: bool,
    in_register_readwrite: bool,
    in_register_write: bool,
}

impl Watchpoint {
    fn new(num_bytes: usize) -> Watchpoint {
        Watchpoint {
            num_bytes,
            exec_count: 0,
            read_count: 0,
            write_count: 0,
            value_bytes: vec![0; num_bytes],
            valid: false,
            changed: false,
            in_register_exec: false,
            in_register_readwrite: false,
            in_register_write: false,
        }
    }

    fn watch(&mut self, which: RwxBits) {
        if which.contains(RwxBits::EXEC_BIT) {
            self.exec_count += 1;
        }
        if which.contains(RwxBits::READ_BIT) {
            self.read_count += 1;
        }
        if which.contains(RwxBits::WRITE_BIT) {
            self.write_count += 1;
        }
    }

    fn unwatch(&mut self, which: RwxBits) -> u32 {
        if which.contains(RwxBits::EXEC_BIT) {
            debug_assert!(self.exec_count > 0);
            self.exec_count -= 1;
        }
        if which.contains(RwxBits::READ_BIT) {
            debug_assert!(self.read_count > 0);
            self.read_count -= 1;
        }
        if which.contains(RwxBits::WRITE_BIT) {
            debug_assert!(self.write_count > 0);
            self.write_count -= 1;
        }
        self.exec_count + self.read_count + self.write_count
    }

    fn watched_bits(&self) -> RwxBits {
        let mut bits = RwxBits::empty();
        if self.exec_count > 0 {
            bits |= RwxBits::EXEC_BIT;
        }
        if self.read_count > 0 {
            bits |= RwxBits::READ_BIT;
        }
        if self.write_count > 0 {
            bits |= RwxBits::WRITE_BIT;
        }
        bits
    }
}

fn watch_type_for_bits(bits: RwxBits) -> WatchType {
    if bits.contains(RwxBits::EXEC_BIT) {
        WatchType::Exec
    } else if bits.contains(RwxBits::READ_BIT) {
        WatchType::ReadWrite
    } else {
        WatchType::Write
    }
}

/// The number of x86 hardware watch slots.
const NUM_DEBUG_REGS: usize = 4;

/// One assignment of a (sub)range into a hardware debug register.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct DebugRegAssignment {
    pub addr: RemotePtr<Void>,
    pub num_bytes: usize,
    pub type_: WatchType,
}

/// Split a watched range into the aligned power-of-two chunks the hardware
/// accepts (1, 2, 4 or 8 bytes, naturally aligned).
fn split_for_hardware(addr: RemotePtr<Void>, num_bytes: usize, type_: WatchType, out: &mut Vec<DebugRegAssignment>) {
    let mut a = addr.as_usize();
    let end = a + num_bytes;
    while a < end {
        let mut len = 8;
        while len > 1 && (a % len != 0 || a + len > end) {
            len /= 2;
        }
        out.push(DebugRegAssignment {
            addr: RemotePtr::new(a),
            num_bytes: len,
            type_,
        });
        a += len;
    }
}

/// Choose an assignment of watchpoints into the four hardware slots.
/// Watchpoints that cannot be emulated in software (exec and read watches)
/// are placed first; write watchpoints are only assigned if slots remain,
/// since they can fire via the differential value compare. Returns None if
/// the un-emulatable watchpoints alone exceed the hardware.
pub fn allocate_debug_registers(watches: &[WatchConfig]) -> Option<Vec<DebugRegAssignment>> {
    let mut hard: Vec<DebugRegAssignment> = Vec::new();
    let mut soft_ok: Vec<DebugRegAssignment> = Vec::new();

    for w in watches {
        match w.type_ {
            WatchType::Exec | WatchType::ReadWrite => {
                split_for_hardware(w.addr, w.num_bytes, w.type_, &mut hard)
            }
            WatchType::Write => split_for_hardware(w.addr, w.num_bytes, w.type_, &mut soft_ok),
        }
    }

    if hard.len() > NUM_DEBUG_REGS {
        return None;
    }

    let mut result = hard;
    for a in soft_ok {
        if result.len() == NUM_DEBUG_REGS {
            break;
        }
        result.push(a);
    }
    Some(result)
}

/// Iterator over the mappings intersecting a range.
pub struct Maps<'a> {
    mem: Ref<'a, MemoryMap>,
    range: Option<MemoryRange>,
}

impl<'a> Maps<'a> {
    pub fn iter<'b>(&'b self) -> impl Iterator<Item = (&'b MemoryRangeKey, &'b Mapping)> + 'b {
        let range = self.range;
        self.mem.iter().filter(move |(k, _)| match range {
            Some(r) => k.intersects(&r),
            None => true,
        })
    }
}

/// `(breakpoints, watchpoints, mapping-map, auxiliary-vector snapshot,
/// syscall-ip anchors, saved watchpoint stacks)`, shared by every task that
/// shares these mappings.
pub struct AddressSpace {
    /// The struct is reference-counted from tasks; tasks themselves are held
    /// weakly here and unregister on destruction.
    task_set: RefCell<Vec<pid_t>>,
    mem: RefCell<MemoryMap>,
    /// madvise DONTFORK regions, tracked so fork children drop them.
    dont_fork: RefCell<Vec<MemoryRange>>,
    breakpoints: RefCell<BTreeMap<RemoteCodePtr, Breakpoint>>,
    watchpoints: RefCell<BTreeMap<MemoryRange, Watchpoint>>,
    saved_watchpoints: RefCell<Vec<BTreeMap<MemoryRange, Watchpoint>>>,
    /// Snapshot of the auxiliary vector at exec.
    saved_auxv_: RefCell<Vec<u8>>,
    /// The thread id of the task that created this address space.
    leader_tid_: pid_t,
    leader_serial: u32,
    exec_count: u32,
    /// The name of the executable image this space was created for.
    exe: RefCell<OsString>,
    /// Where the brk segment currently ends.
    brk_end: Cell<RemotePtr<Void>>,
    /// True once the engine page has been mapped and its anchors are live.
    has_engine_page: Cell<bool>,
    /// True once the preload library finished rtcall_init_preload.
    syscallbuf_enabled_: Cell<bool>,
    /// Tracee sizes for shared-memory segments, keyed by map start.
    shm_sizes: RefCell<HashMap<RemotePtr<Void>, usize>>,
    first_run_event_: Cell<crate::trace::trace_frame::FrameTime>,
}

impl AddressSpace {
    /// A new address space for a task that just execed `exe`.
    pub fn new_after_execve(t: &dyn Task, exe: &OsStr, exec_count: u32) -> AddressSpace {
        AddressSpace {
            task_set: RefCell::new(vec![t.rec_tid()]),
            mem: Default::default(),
            dont_fork: Default::default(),
            breakpoints: Default::default(),
            watchpoints: Default::default(),
            saved_watchpoints: Default::default(),
            saved_auxv_: Default::default(),
            leader_tid_: t.rec_tid(),
            leader_serial: t.tuid().serial(),
            exec_count,
            exe: RefCell::new(exe.to_owned()),
            brk_end: Cell::new(RemotePtr::null()),
            has_engine_page: Cell::new(false),
            syscallbuf_enabled_: Cell::new(false),
            shm_sizes: Default::default(),
            first_run_event_: Cell::new(0),
        }
    }

    /// A copy of `other` for a fork child or a session clone. Mappings are
    /// copied; mutations of the copy never affect the origin.
    pub fn new_after_fork_or_session_clone(
        other: &AddressSpace,
        leader_tid: pid_t,
        leader_serial: u32,
        exec_count: u32,
    ) -> AddressSpace {
        let new_space = AddressSpace {
            task_set: RefCell::new(Vec::new()),
            mem: RefCell::new(other.mem.borrow().clone()),
            dont_fork: RefCell::new(other.dont_fork.borrow().clone()),
            breakpoints: Default::default(),
            watchpoints: Default::default(),
            saved_watchpoints: Default::default(),
            saved_auxv_: RefCell::new(other.saved_auxv_.borrow().clone()),
            leader_tid_: leader_tid,
            leader_serial,
            exec_count,
            exe: RefCell::new(other.exe.borrow().clone()),
            brk_end: Cell::new(other.brk_end.get()),
            has_engine_page: Cell::new(other.has_engine_page.get()),
            syscallbuf_enabled_: Cell::new(other.syscallbuf_enabled_.get()),
            shm_sizes: RefCell::new(other.shm_sizes.borrow().clone()),
            first_run_event_: Cell::new(0),
        };
        // madvise DONTFORK regions are not inherited by the child.
        for range in new_space.dont_fork.borrow().iter() {
            new_space.mem.borrow_mut().remove(&MemoryRangeKey(*range));
        }
        new_space
    }

    pub fn insert_task(&self, t: &dyn Task) {
        self.task_set.borrow_mut().push(t.rec_tid());
    }

    pub fn erase_task(&self, rec_tid: pid_t) {
        self.task_set.borrow_mut().retain(|&tid| tid != rec_tid);
    }

    pub fn task_set_len(&self) -> usize {
        self.task_set.borrow().len()
    }

    pub fn uid(&self) -> AddressSpaceUid {
        AddressSpaceUid::new_with(self.leader_tid_, self.leader_serial, self.exec_count)
    }

    pub fn leader_tid(&self) -> pid_t {
        self.leader_tid_
    }

    pub fn exe_image(&self) -> OsString {
        self.exe.borrow().clone()
    }

    pub fn set_exe_image(&self, exe: &OsStr) {
        *self.exe.borrow_mut() = exe.to_owned();
    }

    pub fn saved_auxv(&self) -> Vec<u8> {
        self.saved_auxv_.borrow().clone()
    }

    pub fn save_auxv_from(&self, auxv: Vec<u8>) {
        *self.saved_auxv_.borrow_mut() = auxv;
    }

    pub fn first_run_event(&self) -> crate::trace::trace_frame::FrameTime {
        self.first_run_event_.get()
    }

    pub fn set_first_run_event(&self, event: crate::trace::trace_frame::FrameTime) {
        self.first_run_event_.set(event);
    }

    // --- Mapping map ------------------------------------------------------

    /// Map `num_bytes` into this address space at `addr`, with prot/flags.
    /// Intersecting existing mappings are split at the boundaries and the
    /// overlapped parts replaced; adjacent mappings sharing every
    /// non-address attribute are merged.
    pub fn map(
        &self,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        prot: ProtFlags,
        flags: MapFlags,
        offset_bytes: u64,
        fsname: &OsStr,
        device: libc::dev_t,
        inode: libc::ino_t,
        maybe_recorded_map: Option<KernelMapping>,
        emu_file: Option<EmuFileSharedPtr>,
    ) -> KernelMapping {
        let num_bytes = ceil_page_size(num_bytes);
        if num_bytes == 0 {
            return KernelMapping::default();
        }

        let end = addr + num_bytes;
        let km =
            KernelMapping::new_with_opts(addr, end, fsname, device, inode, prot, flags, offset_bytes);
        let recorded_map = maybe_recorded_map.unwrap_or_else(|| km.clone());

        self.unmap_internal(addr, num_bytes);
        let mut mapping = Mapping::new(km.clone(), recorded_map);
        mapping.emu_file = emu_file;
        self.mem
            .borrow_mut()
            .insert(MemoryRangeKey(*km.deref()), mapping);

        self.coalesce_around(MemoryRangeKey(*km.deref()));
        km
    }

    /// The unique mapping containing `addr`, if any.
    pub fn mapping_of(&self, addr: RemotePtr<Void>) -> Option<Mapping> {
        let key = MemoryRangeKey(MemoryRange::new_range(addr, 1));
        self.mem.borrow().get(&key).cloned()
    }

    pub fn has_mapping(&self, addr: RemotePtr<Void>) -> bool {
        self.mapping_of(addr).is_some()
    }

    pub fn mapping_flags_of(&self, addr: RemotePtr<Void>) -> MappingFlags {
        self.mapping_of(addr)
            .map(|m| m.flags)
            .unwrap_or_else(MappingFlags::empty)
    }

    pub fn set_mapping_flags_of(&self, addr: RemotePtr<Void>, flags: MappingFlags) {
        let key = MemoryRangeKey(MemoryRange::new_range(addr, 1));
        if let Some(m) = self.mem.borrow_mut().get_mut(&key) {
            m.flags |= flags;
        }
    }

    pub fn maps(&self) -> Maps {
        Maps {
            mem: self.mem.borrow(),
            range: None,
        }
    }

    pub fn maps_intersecting(&self, range: MemoryRange) -> Maps {
        Maps {
            mem: self.mem.borrow(),
            range: Some(range),
        }
    }

    /// Every mapping, cloned out. Convenient when the borrow must not be
    /// held across tracee operations.
    pub fn mappings_vec(&self) -> Vec<Mapping> {
        self.mem.borrow().values().cloned().collect()
    }

    /// Change the protection of [addr, addr+num_bytes), splitting partially
    /// covered mappings.
    pub fn protect(&self, addr: RemotePtr<Void>, num_bytes: usize, prot: ProtFlags) {
        let num_bytes = ceil_page_size(num_bytes);
        let r = MemoryRange::new_range(addr, num_bytes);

        let mut to_insert: Vec<(MemoryRangeKey, Mapping)> = Vec::new();
        let mut to_remove: Vec<MemoryRangeKey> = Vec::new();

        {
            let mem = self.mem.borrow();
            for (key, m) in mem.iter() {
                if !key.intersects(&r) {
                    continue;
                }
                to_remove.push(*key);

                // Unchanged head.
                if m.map.start() < r.start() {
                    let head = m.map.subrange(m.map.start(), r.start());
                    let rec_head = m.recorded_map.subrange(m.recorded_map.start(), r.start());
                    let mut nm = Mapping::new(head.clone(), rec_head);
                    nm.emu_file = m.emu_file.clone();
                    nm.flags = m.flags;
                    to_insert.push((MemoryRangeKey(*head.deref()), nm));
                }

                // Re-protected middle.
                let mid_start = std::cmp::max(m.map.start(), r.start());
                let mid_end = std::cmp::min(m.map.end(), r.end());
                let mid = m.map.subrange(mid_start, mid_end).set_prot(prot);
                let rec_mid = m
                    .recorded_map
                    .subrange(mid_start, mid_end)
                    .set_prot(prot);
                let mut nm = Mapping::new(mid.clone(), rec_mid);
                nm.emu_file = m.emu_file.clone();
                nm.flags = m.flags;
                to_insert.push((MemoryRangeKey(*mid.deref()), nm));

                // Unchanged tail.
                if m.map.end() > r.end() {
                    let tail = m.map.subrange(r.end(), m.map.end());
                    let rec_tail = m.recorded_map.subrange(r.end(), m.recorded_map.end());
                    let mut nm = Mapping::new(tail.clone(), rec_tail);
                    nm.emu_file = m.emu_file.clone();
                    nm.flags = m.flags;
                    to_insert.push((MemoryRangeKey(*tail.deref()), nm));
                }
            }
        }

        let mut mem = self.mem.borrow_mut();
        for key in to_remove {
            mem.remove(&key);
        }
        for (key, m) in to_insert {
            mem.insert(key, m);
        }
    }

    /// Move the mapping at `old_addr` to `new_addr`, resizing it.
    pub fn remap(
        &self,
        old_addr: RemotePtr<Void>,
        old_num_bytes: usize,
        new_addr: RemotePtr<Void>,
        new_num_bytes: usize,
    ) {
        let old_num_bytes = ceil_page_size(old_num_bytes);
        let new_num_bytes = ceil_page_size(new_num_bytes);

        let m = match self.mapping_of(old_addr) {
            Some(m) => m,
            None => fatal!("Attempt to remap unknown mapping at {}", old_addr),
        };
        let km = m
            .map
            .subrange(old_addr, std::cmp::min(m.map.end(), old_addr + old_num_bytes));

        self.unmap_internal(old_addr, old_num_bytes);
        if new_num_bytes == 0 {
            return;
        }
        let new_end = new_addr + new_num_bytes;
        self.map(
            new_addr,
            new_num_bytes,
            km.prot(),
            km.flags(),
            km.file_offset_bytes(),
            km.fsname(),
            km.device(),
            km.inode(),
            Some(m.recorded_map.set_range(new_addr, new_end)),
            m.emu_file,
        );
    }

    /// Remove [addr, addr+num_bytes) from the cached map, splitting
    /// partially unmapped mappings.
    pub fn unmap(&self, addr: RemotePtr<Void>, num_bytes: usize) {
        let num_bytes = ceil_page_size(num_bytes);
        if num_bytes == 0 {
            return;
        }
        self.unmap_internal(addr, num_bytes);
    }

    fn unmap_internal(&self, addr: RemotePtr<Void>, num_bytes: usize) {
        let r = MemoryRange::new_range(addr, num_bytes);

        let mut to_insert: Vec<(MemoryRangeKey, Mapping)> = Vec::new();
        let mut to_remove: Vec<MemoryRangeKey> = Vec::new();

        {
            let mem = self.mem.borrow();
            for (key, m) in mem.iter() {
                if !key.intersects(&r) {
                    continue;
                }
                to_remove.push(*key);

                if m.map.start() < r.start() {
                    let head = m.map.subrange(m.map.start(), r.start());
                    let rec_head = m.recorded_map.subrange(m.recorded_map.start(), r.start());
                    let mut nm = Mapping::new(head.clone(), rec_head);
                    nm.emu_file = m.emu_file.clone();
                    nm.flags = m.flags;
                    to_insert.push((MemoryRangeKey(*head.deref()), nm));
                }
                if m.map.end() > r.end() {
                    let tail = m.map.subrange(r.end(), m.map.end());
                    let rec_tail = m.recorded_map.subrange(r.end(), m.recorded_map.end());
                    let mut nm = Mapping::new(tail.clone(), rec_tail);
                    nm.emu_file = m.emu_file.clone();
                    nm.flags = m.flags;
                    to_insert.push((MemoryRangeKey(*tail.deref()), nm));
                }
            }
        }

        let mut mem = self.mem.borrow_mut();
        for key in to_remove {
            mem.remove(&key);
        }
        for (key, m) in to_insert {
            mem.insert(key, m);
        }
    }

    /// Merge adjacent mappings that share every non-address attribute.
    fn coalesce_around(&self, key: MemoryRangeKey) {
        let mut mem = self.mem.borrow_mut();
        let m = match mem.get(&key) {
            Some(m) => m.clone(),
            None => return,
        };

        let mut start = m.map.start();
        let mut end = m.map.end();
        let mut merged = m.map.clone();
        let mut merged_rec = m.recorded_map.clone();
        let mut changed = false;

        // Predecessor.
        if start.as_usize() > 0 {
            let prev_key = MemoryRangeKey(MemoryRange::new_range(start - 1usize, 1));
            if let Some(prev) = mem.get(&prev_key) {
                if is_adjacent_mapping(&prev.map, &merged) && prev.flags == m.flags {
                    start = prev.map.start();
                    merged = prev.map.extend(end);
                    merged_rec = prev.recorded_map.extend(end);
                    changed = true;
                }
            }
        }

        // Successor.
        let next_key = MemoryRangeKey(MemoryRange::new_range(end, 1));
        if let Some(next) = mem.get(&next_key) {
            if is_adjacent_mapping(&merged, &next.map) && next.flags == m.flags {
                end = next.map.end();
                merged = merged.extend(end);
                merged_rec = merged_rec.extend(end);
                changed = true;
            }
        }

        if !changed {
            return;
        }

        let whole = MemoryRange::from_range(start, end);
        // Remove all constituents, insert the union.
        loop {
            let existing = match mem.get_key_value(&MemoryRangeKey(whole)) {
                Some((k, _)) => *k,
                None => break,
            };
            mem.remove(&existing);
        }
        let mut nm = Mapping::new(merged, merged_rec);
        nm.emu_file = m.emu_file;
        nm.flags = m.flags;
        mem.insert(MemoryRangeKey(whole), nm);
    }

    /// Handle a brk() that grew or shrank the heap segment.
    pub fn brk(&self, addr: RemotePtr<Void>, prot: ProtFlags) {
        let old_brk = ceil_page_size(self.brk_end.get().as_usize());
        let new_brk = ceil_page_size(addr.as_usize());
        if old_brk < new_brk {
            self.map(
                RemotePtr::new(old_brk),
                new_brk - old_brk,
                prot,
                MapFlags::MAP_ANONYMOUS | MapFlags::MAP_PRIVATE,
                0,
                OsStr::new("[heap]"),
                KernelMapping::NO_DEVICE,
                KernelMapping::NO_INODE,
                None,
                None,
            );
        } else if new_brk < old_brk {
            self.unmap(RemotePtr::new(new_brk), old_brk - new_brk);
        }
        self.brk_end.set(addr);
    }

    pub fn current_brk(&self) -> RemotePtr<Void> {
        self.brk_end.get()
    }

    /// Grow the mapping containing `addr` to span at least up to
    /// `grow_to`. Used for MAP_GROWSDOWN stacks and the GrowMap event.
    pub fn grow_map_containing(&self, addr: RemotePtr<Void>, grow_to: RemotePtr<Void>) {
        let m = match self.mapping_of(addr) {
            Some(m) => m,
            None => fatal!("grow_map: no mapping at {}", addr),
        };
        let new_start = RemotePtr::new(floor_page_size(grow_to.as_usize()));
        if new_start >= m.map.start() {
            return;
        }
        self.map(
            new_start,
            m.map.end() - new_start,
            m.map.prot(),
            m.map.flags(),
            0,
            &m.map.fsname().to_owned(),
            m.map.device(),
            m.map.inode(),
            Some(m.recorded_map.set_range(new_start, m.recorded_map.end())),
            m.emu_file,
        );
    }

    pub fn register_dont_fork_range(&self, range: MemoryRange) {
        self.dont_fork.borrow_mut().push(range);
    }

    pub fn set_shm_size(&self, addr: RemotePtr<Void>, bytes: usize) {
        self.shm_sizes.borrow_mut().insert(addr, bytes);
    }

    pub fn get_shm_size(&self, addr: RemotePtr<Void>) -> Option<usize> {
        self.shm_sizes.borrow().get(&addr).copied()
    }

    /// The vdso mapping; fatal if absent, since every Linux process has one.
    pub fn vdso(&self) -> KernelMapping {
        for m in self.mem.borrow().values() {
            if m.map.is_vdso() {
                return m.map.clone();
            }
        }
        fatal!("No vdso mapped");
    }

    // --- Engine page ------------------------------------------------------

    pub fn engine_page_start() -> RemotePtr<Void> {
        RemotePtr::new(RETRACE_PAGE_ADDR)
    }

    pub fn engine_page_size() -> usize {
        page_size()
    }

    pub fn has_engine_page(&self) -> bool {
        self.has_engine_page.get()
    }

    pub fn set_engine_page_mapped(&self) {
        self.has_engine_page.set(true);
    }

    /// The traced-syscall instruction inside the engine page: remote
    /// syscalls are executed from here so the seccomp filter traps them.
    pub fn traced_syscall_ip(&self) -> RemoteCodePtr {
        RemoteCodePtr::new(RETRACE_PAGE_SYSCALL_TRACED)
    }

    pub fn privileged_traced_syscall_ip(&self) -> RemoteCodePtr {
        RemoteCodePtr::new(RETRACE_PAGE_SYSCALL_PRIVILEGED_TRACED)
    }

    /// The untraced-syscall instruction: syscalls from here bypass the
    /// ptrace supervisor entirely. Published to the preload at init.
    pub fn untraced_syscall_ip(&self) -> RemoteCodePtr {
        RemoteCodePtr::new(RETRACE_PAGE_SYSCALL_UNTRACED)
    }

    pub fn privileged_untraced_syscall_ip(&self) -> RemoteCodePtr {
        RemoteCodePtr::new(RETRACE_PAGE_SYSCALL_PRIVILEGED_UNTRACED)
    }

    pub fn syscallbuf_enabled(&self) -> bool {
        self.syscallbuf_enabled_.get()
    }

    /// Called when the preload library has finished rtcall_init_preload.
    pub fn at_preload_init(&self, enabled: bool) {
        self.syscallbuf_enabled_.set(enabled);
    }

    // --- Breakpoints ------------------------------------------------------

    pub fn add_breakpoint(&self, t: &dyn Task, addr: RemoteCodePtr, type_: BreakpointType) -> bool {
        let mut bps = self.breakpoints.borrow_mut();
        if let Some(bp) = bps.get_mut(&addr) {
            bp.do_ref(type_);
            return true;
        }

        let mut overwritten = [0u8; 1];
        if !t.read_bytes_fallible(addr.to_data_ptr::<Void>(), &mut overwritten) {
            log!(LogWarn, "Can't read breakpoint insn at {}", addr);
            return false;
        }
        if !t.write_bytes_careful(addr.to_data_ptr::<Void>(), &[BREAKPOINT_INSN]) {
            return false;
        }

        let mut bp = Breakpoint::new(overwritten[0]);
        bp.do_ref(type_);
        bps.insert(addr, bp);
        true
    }

    pub fn remove_breakpoint(&self, t: &dyn Task, addr: RemoteCodePtr, type_: BreakpointType) {
        let mut bps = self.breakpoints.borrow_mut();
        let displaced = match bps.get_mut(&addr) {
            Some(bp) => {
                if bp.do_unref(type_) == 0 {
                    Some(bp.overwritten_data)
                } else {
                    None
                }
            }
            None => None,
        };
        if let Some(data) = displaced {
            bps.remove(&addr);
            drop(bps);
            t.write_bytes_careful(addr.to_data_ptr::<Void>(), &[data]);
        }
    }

    pub fn remove_all_breakpoints(&self, t: &dyn Task) {
        let addrs: Vec<(RemoteCodePtr, u8)> = self
            .breakpoints
            .borrow()
            .iter()
            .map(|(addr, bp)| (*addr, bp.overwritten_data))
            .collect();
        self.breakpoints.borrow_mut().clear();
        for (addr, data) in addrs {
            t.write_bytes_careful(addr.to_data_ptr::<Void>(), &[data]);
        }
    }

    pub fn has_breakpoints(&self) -> bool {
        !self.breakpoints.borrow().is_empty()
    }

    pub fn get_breakpoint_type_at_addr(&self, addr: RemoteCodePtr) -> BreakpointType {
        self.breakpoints
            .borrow()
            .get(&addr)
            .map(|bp| bp.bp_type())
            .unwrap_or(BreakpointType::BkptNone)
    }

    /// As get_breakpoint_type_at_addr, but for a $ip that has just retired a
    /// trap instruction (so the breakpoint is one byte behind).
    pub fn get_breakpoint_type_for_retired_insn(&self, ip: RemoteCodePtr) -> BreakpointType {
        self.get_breakpoint_type_at_addr(ip.decrement_by_bytes(1))
    }

    /// Splice the displaced original bytes into `buf` (read from `addr`) so
    /// the debugger never sees the trap opcodes we planted.
    pub fn replace_breakpoints_with_original_values(
        &self,
        buf: &mut [u8],
        addr: RemotePtr<Void>,
    ) {
        let range = MemoryRange::new_range(addr, buf.len());
        for (bp_addr, bp) in self.breakpoints.borrow().iter() {
            let p = bp_addr.to_data_ptr::<Void>();
            if range.contains_ptr(p) {
                buf[p - addr] = bp.overwritten_data;
            }
        }
    }

    /// The original byte displaced at `addr`, if a breakpoint is installed.
    pub fn overwritten_byte_at(&self, addr: RemoteCodePtr) -> Option<u8> {
        self.breakpoints
            .borrow()
            .get(&addr)
            .map(|bp| bp.overwritten_data)
    }

    // --- Watchpoints ------------------------------------------------------

    pub fn add_watchpoint(
        &self,
        t: &dyn Task,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        type_: WatchType,
    ) -> bool {
        let range = MemoryRange::new_range(addr, num_bytes);
        {
            let mut wps = self.watchpoints.borrow_mut();
            if !wps.contains_key(&range) {
                let mut wp = Watchpoint::new(num_bytes);
                // Grab a copy of the current value so a later trap can
                // detect a write by differential compare.
                if t.read_bytes_fallible(addr, &mut wp.value_bytes) {
                    wp.valid = true;
                }
                wps.insert(range, wp);
            }
            wps.get_mut(&range).unwrap().watch(access_bits_of(type_));
        }
        self.allocate_watchpoints()
    }

    pub fn remove_watchpoint(&self, addr: RemotePtr<Void>, num_bytes: usize, type_: WatchType) {
        let range = MemoryRange::new_range(addr, num_bytes);
        let mut wps = self.watchpoints.borrow_mut();
        if let Some(wp) = wps.get_mut(&range) {
            if wp.unwatch(access_bits_of(type_)) == 0 {
                wps.remove(&range);
            }
        }
        drop(wps);
        self.allocate_watchpoints();
    }

    pub fn remove_all_watchpoints(&self) {
        self.watchpoints.borrow_mut().clear();
        self.allocate_watchpoints();
    }

    pub fn has_watchpoints(&self) -> bool {
        !self.watchpoints.borrow().is_empty()
    }

    pub fn all_watchpoints(&self) -> Vec<WatchConfig> {
        self.get_watch_configs(false)
    }

    /// Save the watchpoint state onto the stack of saved states; used at
    /// signal-handler entry so the handler can run without firing the
    /// caller's watchpoints.
    pub fn save_watchpoints(&self) {
        let copy = self.watchpoints.borrow().clone();
        self.saved_watchpoints.borrow_mut().push(copy);
    }

    pub fn restore_watchpoints(&self) -> bool {
        let saved = match self.saved_watchpoints.borrow_mut().pop() {
            Some(s) => s,
            None => return false,
        };
        *self.watchpoints.borrow_mut() = saved;
        self.allocate_watchpoints()
    }

    /// Inspect the debug status and current memory values to determine which
    /// watchpoints fired. Write watchpoints fire iff their saved value bytes
    /// differ from the current bytes; read/exec watchpoints fire via the
    /// hardware status bits.
    pub fn notify_watchpoint_fired(&self, t: &dyn Task, debug_status: DebugStatus) -> bool {
        let mut any = false;
        let configs = self.get_watch_configs(true);
        let mut wps = self.watchpoints.borrow_mut();

        for (range, wp) in wps.iter_mut() {
            let watched = wp.watched_bits();
            let mut fired = false;

            if watched.intersects(RwxBits::WRITE_BIT) && wp.valid {
                let mut current = vec![0u8; wp.num_bytes];
                if t.read_bytes_fallible(range.start(), &mut current)
                    && current != wp.value_bytes
                {
                    wp.value_bytes = current;
                    fired = true;
                }
            }

            if !fired
                && watched.intersects(RwxBits::EXEC_BIT | RwxBits::READ_BIT)
                && debug_status.intersects(DebugStatus::DS_WATCHPOINT_ANY)
            {
                // The hardware tells us *some* register fired; attribute it
                // to the registers this watchpoint occupies.
                for (slot, cfg) in configs.iter().enumerate() {
                    if slot < NUM_DEBUG_REGS
                        && debug_status.bits() & (1 << slot) != 0
                        && range.contains_ptr(cfg.addr)
                    {
                        fired = true;
                    }
                }
            }

            if fired {
                wp.changed = true;
                any = true;
            }
        }
        any
    }

    pub fn has_any_watchpoint_changes(&self) -> bool {
        self.watchpoints.borrow().values().any(|wp| wp.changed)
    }

    pub fn has_exec_watchpoint_fired(&self, addr: RemoteCodePtr) -> bool {
        let wps = self.watchpoints.borrow();
        for (range, wp) in wps.iter() {
            if wp.changed
                && wp.exec_count > 0
                && range.contains_ptr(addr.to_data_ptr::<Void>())
            {
                return true;
            }
        }
        false
    }

    /// Return the set of watchpoints that fired, clearing their changed
    /// flags.
    pub fn consume_watchpoint_changes(&self) -> Vec<WatchConfig> {
        let mut result = Vec::new();
        let mut wps = self.watchpoints.borrow_mut();
        for (range, wp) in wps.iter_mut() {
            if wp.changed {
                wp.changed = false;
                result.push(WatchConfig::new(
                    range.start(),
                    wp.num_bytes,
                    watch_type_for_bits(wp.watched_bits()),
                ));
            }
        }
        result
    }

    fn get_watch_configs(&self, registers_only: bool) -> Vec<WatchConfig> {
        let wps = self.watchpoints.borrow();
        let mut result = Vec::new();
        for (range, wp) in wps.iter() {
            let bits = wp.watched_bits();
            if registers_only && !bits.intersects(RwxBits::EXEC_BIT | RwxBits::READ_BIT) {
                continue;
            }
            result.push(WatchConfig::new(
                range.start(),
                wp.num_bytes,
                watch_type_for_bits(bits),
            ));
        }
        result
    }

    /// Recompute the debug-register assignment after a watchpoint change.
    /// Returns false if the watchpoints that hardware must cover don't fit.
    fn allocate_watchpoints(&self) -> bool {
        let configs = self.get_watch_configs(false);
        match allocate_debug_registers(&configs) {
            Some(regs) => {
                let mut wps = self.watchpoints.borrow_mut();
                for (range, wp) in wps.iter_mut() {
                    wp.in_register_exec = false;
                    wp.in_register_readwrite = false;
                    wp.in_register_write = false;
                    for r in &regs {
                        if range.contains_ptr(r.addr) {
                            match r.type_ {
                                WatchType::Exec => wp.in_register_exec = true,
                                WatchType::ReadWrite => wp.in_register_readwrite = true,
                                WatchType::Write => wp.in_register_write = true,
                            }
                        }
                    }
                }
                true
            }
            None => {
                log!(
                    LogDebug,
                    "Can't fit {} watchpoint ranges into debug registers",
                    configs.len()
                );
                false
            }
        }
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        for m in self.mem.borrow().values() {
            out.push_str(&m.map.str());
            out.push('\n');
        }
        out
    }
}

fn access_bits_of(type_: WatchType) -> RwxBits {
    match type_ {
        WatchType::Exec => RwxBits::EXEC_BIT,
        WatchType::Write => RwxBits::WRITE_BIT,
        WatchType::ReadWrite => RwxBits::READ_WRITE_BITS,
    }
}

/// Two mappings are adjacent when they abut and share every attribute other
/// than the address range (modulo the file offset continuing).
fn is_adjacent_mapping(left: &KernelMapping, right: &KernelMapping) -> bool {
    if left.end() != right.start() {
        return false;
    }
    if left.flags() != right.flags() || left.prot() != right.prot() {
        return false;
    }
    if left.fsname() != right.fsname()
        || left.device() != right.device()
        || left.inode() != right.inode()
    {
        return false;
    }
    if left.is_real_device()
        && left.file_offset_bytes() + left.size() as u64 != right.file_offset_bytes()
    {
        return false;
    }
    true
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn debug_register_split_alignment() {
        let mut out = Vec::new();
        split_for_hardware(RemotePtr::new(0x1001), 7, WatchType::Write, &mut out);
        // 0x1001..0x1008: 1 + 2 + 4 bytes.
        assert_eq!(3, out.len());
        assert_eq!(1, out[0].num_bytes);
        assert_eq!(2, out[1].num_bytes);
        assert_eq!(4, out[2].num_bytes);
    }

    #[test]
    fn hardware_slots_prefer_unemulatable_watches() {
        // Four exec watches fill the hardware; the write watch is left to
        // the software value-compare path.
        let watches = vec![
            WatchConfig::new(RemotePtr::new(0x1000), 1, WatchType::Exec),
            WatchConfig::new(RemotePtr::new(0x2000), 1, WatchType::Exec),
            WatchConfig::new(RemotePtr::new(0x3000), 1, WatchType::Exec),
            WatchConfig::new(RemotePtr::new(0x4000), 1, WatchType::Exec),
            WatchConfig::new(RemotePtr::new(0x5000), 8, WatchType::Write),
        ];
        let regs = allocate_debug_registers(&watches).unwrap();
        assert_eq!(4, regs.len());
        assert!(regs.iter().all(|r| r.type_ == WatchType::Exec));
    }

    #[test]
    fn too_many_read_watches_fail() {
        let watches = vec![
            WatchConfig::new(RemotePtr::new(0x1000), 8, WatchType::ReadWrite),
            WatchConfig::new(RemotePtr::new(0x2000), 8, WatchType::ReadWrite),
            WatchConfig::new(RemotePtr::new(0x3000), 8, WatchType::ReadWrite),
            WatchConfig::new(RemotePtr::new(0x4000), 8, WatchType::ReadWrite),
            WatchConfig::new(RemotePtr::new(0x5000), 8, WatchType::ReadWrite),
        ];
        assert!(allocate_debug_registers(&watches).is_none());
    }
}
