use crate::{
    event::{Event, EventType, SyscallState},
    extra_registers::{format_from_tag, ExtraRegisters, Format},
    log::LogLevel::LogError,
    registers::Registers,
    remote_ptr::{RemotePtr, Void},
    session::address_space::kernel_mapping::KernelMapping,
    trace::{
        compressed_reader::CompressedReader,
        read_bytes, read_f64, read_i32, read_i64, read_u32, read_u64, read_u8,
        trace_frame::{FrameTime, TraceFrame},
        trace_stream::{
            latest_trace_symlink, substream, MappedData, MappedDataSource, Substream, TraceStream,
            ALL_SUBSTREAMS, TRACE_VERSION,
        },
        trace_task_event::TraceTaskEvent,
    },
};
use libc::pid_t;
use nix::sys::{
    mman::{MapFlags, ProtFlags},
    stat::stat,
};
use std::{
    collections::HashMap,
    ffi::{OsStr, OsString},
    fs,
    io::Write,
    ops::{Deref, DerefMut},
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::Path,
};

/// sysexits(3) EX_DATAERR: the input data was incorrect.
pub const EX_DATAERR: i32 = 65;

/// A parcel of recorded tracee data. `data` contains the data read
/// from `addr` in the tracee.
#[derive(Clone)]
pub struct RawData {
    pub data: Vec<u8>,
    pub addr: RemotePtr<Void>,
    pub rec_tid: pid_t,
}

pub struct TraceReader {
    trace_stream: TraceStream,
    readers: HashMap<Substream, CompressedReader>,
    cwd: OsString,
    argv: Vec<OsString>,
    envp: Vec<OsString>,
}

impl Deref for TraceReader {
    type Target = TraceStream;

    fn deref(&self) -> &Self::Target {
        &self.trace_stream
    }
}

impl DerefMut for TraceReader {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.trace_stream
    }
}

impl TraceReader {
    /// Open the trace in `dir`, or the latest trace if `dir` is None.
    ///
    /// Initializes the global time at 0, so that when we tick it when
    /// reading the first frame, it matches the initial global time at
    /// recording, 1.
    pub fn new(maybe_dir: Option<&OsStr>) -> TraceReader {
        let dir: OsString = match maybe_dir {
            Some(d) => d.to_owned(),
            None => resolve_latest_trace(),
        };

        let mut tr = TraceReader {
            trace_stream: TraceStream::new(&dir, 0),
            readers: Default::default(),
            cwd: OsString::new(),
            argv: Vec::new(),
            envp: Vec::new(),
        };

        check_version_file(&tr.trace_stream);

        for &s in ALL_SUBSTREAMS.iter() {
            let path = tr.path(s);
            let reader = CompressedReader::new(&path);
            if !reader.good() {
                notify_unusable_trace(&tr.trace_stream, "substream missing or unreadable");
            }
            tr.readers.insert(s, reader);
        }

        tr.read_args_env();
        tr
    }

    pub fn cwd(&self) -> &OsStr {
        &self.cwd
    }

    pub fn argv(&self) -> &[OsString] {
        &self.argv
    }

    pub fn envp(&self) -> &[OsString] {
        &self.envp
    }

    pub fn good(&self) -> bool {
        self.readers.values().all(|r| r.good())
    }

    pub fn at_end(&self) -> bool {
        self.reader(Substream::Events).at_end()
    }

    /// Read the next trace frame. Asserts that the global time read equals
    /// the internal counter; any divergence there means the trace is
    /// corrupt.
    pub fn read_frame(&mut self) -> TraceFrame {
        let events = self.readers.get_mut(&Substream::Events).unwrap();

        let global_time = read_u64(events).unwrap_or_else(|_| fatal!("Can't read frame time"));
        let tid = read_i32(events).unwrap_or_else(|_| fatal!("Can't read frame tid"));
        let encoded_bits = read_u32(events).unwrap_or_else(|_| fatal!("Can't read frame event"));
        let ticks = read_u64(events).unwrap_or_else(|_| fatal!("Can't read frame ticks"));
        let monotonic = read_f64(events).unwrap_or_else(|_| fatal!("Can't read frame time"));

        let encoded = crate::event::EncodedEvent {
            encoded: encoded_bits,
        };
        let event = Event::decode(encoded);
        let mut frame = TraceFrame::new_with(global_time, tid, event, ticks, monotonic);

        if encoded.has_exec_info() {
            let reg_bytes =
                read_bytes(events).unwrap_or_else(|_| fatal!("Can't read frame registers"));
            let mut regs = Registers::new(encoded.arch());
            regs.set_from_trace_raw(encoded.arch(), &reg_bytes);
            frame.set_regs(regs);

            let format_tag =
                read_u8(events).unwrap_or_else(|_| fatal!("Can't read extra register format"));
            let extra_bytes =
                read_bytes(events).unwrap_or_else(|_| fatal!("Can't read extra registers"));
            let mut extra = ExtraRegisters::new(encoded.arch());
            if format_from_tag(format_tag) != Format::None || !extra_bytes.is_empty() {
                extra.set_to_raw_data(encoded.arch(), format_from_tag(format_tag), extra_bytes);
            }
            frame.set_extra_regs(extra);
        }

        if frame.event().is_signal_event() {
            let signal_data =
                read_u64(events).unwrap_or_else(|_| fatal!("Can't read signal payload"));
            frame.event_mut().signal_event_mut().set_signal_data(signal_data);
        }

        self.tick_time();
        debug_assert_eq!(self.time(), frame.time());
        frame
    }

    /// Read the next frame without advancing; returns None at end of trace.
    pub fn peek_frame(&mut self) -> Option<TraceFrame> {
        if self.at_end() {
            return None;
        }

        self.readers
            .get_mut(&Substream::Events)
            .unwrap()
            .save_state();
        let saved_time = self.time();
        let frame = self.read_frame();
        self.readers
            .get_mut(&Substream::Events)
            .unwrap()
            .restore_state();
        self.trace_stream.global_time = saved_time;
        Some(frame)
    }

    /// Scan forward to the next frame matching the predicate without
    /// consuming it. Fails fatally if no frame matches.
    pub fn peek_to(&mut self, pid: pid_t, type_: EventType, state: SyscallState) -> TraceFrame {
        self.readers
            .get_mut(&Substream::Events)
            .unwrap()
            .save_state();
        let saved_time = self.time();

        let mut found = None;
        while self.good() && !self.at_end() {
            let frame = self.read_frame();
            if frame.tid() == pid
                && frame.event().event_type() == type_
                && (!frame.event().is_syscall_event()
                    || frame.event().syscall_event().state == state)
            {
                found = Some(frame);
                break;
            }
        }

        self.readers
            .get_mut(&Substream::Events)
            .unwrap()
            .restore_state();
        self.trace_stream.global_time = saved_time;

        match found {
            Some(frame) => frame,
            None => fatal!("Unable to find requested frame in stream"),
        }
    }

    /// Reset every substream and the global time to the beginning of the
    /// trace.
    pub fn rewind(&mut self) {
        for r in self.readers.values_mut() {
            r.rewind();
        }
        self.trace_stream.global_time = 0;
        debug_assert!(self.good());
    }

    /// Read the next raw data record and return it. Aborts if there is no
    /// record for the current frame.
    pub fn read_raw_data(&mut self) -> RawData {
        let global_time = self.time();
        let header = self.readers.get_mut(&Substream::RawDataHeader).unwrap();
        let time = read_u64(header).unwrap_or_else(|_| fatal!("Can't read data header"));
        let rec_tid = read_i32(header).unwrap_or_else(|_| fatal!("Can't read data header"));
        let addr = read_u64(header).unwrap_or_else(|_| fatal!("Can't read data header"));
        let size = read_u64(header).unwrap_or_else(|_| fatal!("Can't read data header"));
        debug_assert_eq!(time, global_time);

        let data_stream = self.readers.get_mut(&Substream::RawData).unwrap();
        let mut data = vec![0u8; size as usize];
        if data_stream.read_exact_bytes(&mut data).is_err() {
            fatal!("Can't read data");
        }

        RawData {
            data,
            addr: RemotePtr::new(addr as usize),
            rec_tid,
        }
    }

    /// Read the next raw data record for the current frame, if any.
    pub fn read_raw_data_for_frame(&mut self) -> Option<RawData> {
        let global_time = self.time();
        let header = self.readers.get_mut(&Substream::RawDataHeader).unwrap();
        if header.at_end() {
            return None;
        }
        header.save_state();
        let time = match read_u64(header) {
            Ok(t) => t,
            Err(_) => {
                header.restore_state();
                return None;
            }
        };
        header.restore_state();
        debug_assert!(time >= global_time);
        if time > global_time {
            return None;
        }
        Some(self.read_raw_data())
    }

    /// Read the next mapped-region record for the current frame, verifying
    /// the backing file's metadata for SourceFile mappings. Metadata drift
    /// is a recoverable environmental divergence: logged at error level,
    /// replay continues.
    pub fn read_mapped_region(&mut self, data: &mut MappedData) -> Option<KernelMapping> {
        let global_time = self.time();
        let trace_dir = self.dir().to_owned();
        let mmaps = self.readers.get_mut(&Substream::Mmaps).unwrap();
        if mmaps.at_end() {
            return None;
        }

        mmaps.save_state();
        let time = match read_u64(mmaps) {
            Ok(t) => t,
            Err(_) => {
                mmaps.restore_state();
                return None;
            }
        };
        if time != global_time {
            mmaps.restore_state();
            return None;
        }
        mmaps.discard_state();

        let source = MappedDataSource::from_tag(read_u8(mmaps).unwrap_or_else(|_| fatal!("mmaps")));
        let start = read_u64(mmaps).unwrap_or_else(|_| fatal!("mmaps"));
        let end = read_u64(mmaps).unwrap_or_else(|_| fatal!("mmaps"));
        let fsname = OsString::from_vec(read_bytes(mmaps).unwrap_or_else(|_| fatal!("mmaps")));
        let device = read_u64(mmaps).unwrap_or_else(|_| fatal!("mmaps"));
        let inode = read_u64(mmaps).unwrap_or_else(|_| fatal!("mmaps"));
        let prot = read_i32(mmaps).unwrap_or_else(|_| fatal!("mmaps"));
        let flags = read_i32(mmaps).unwrap_or_else(|_| fatal!("mmaps"));
        let file_offset_bytes = read_u64(mmaps).unwrap_or_else(|_| fatal!("mmaps"));
        let mut backing_file_name =
            OsString::from_vec(read_bytes(mmaps).unwrap_or_else(|_| fatal!("mmaps")));
        let mode = read_u32(mmaps).unwrap_or_else(|_| fatal!("mmaps"));
        let uid = read_u32(mmaps).unwrap_or_else(|_| fatal!("mmaps"));
        let gid = read_u32(mmaps).unwrap_or_else(|_| fatal!("mmaps"));
        let file_size = read_i64(mmaps).unwrap_or_else(|_| fatal!("mmaps"));
        let mtime = read_i64(mmaps).unwrap_or_else(|_| fatal!("mmaps"));

        if source == MappedDataSource::SourceFile {
            if !backing_file_name.as_bytes().starts_with(b"/") {
                let mut abs = trace_dir.into_vec();
                abs.push(b'/');
                abs.extend_from_slice(backing_file_name.as_bytes());
                backing_file_name = OsString::from_vec(abs);
            }
            match stat(backing_file_name.as_os_str()) {
                Err(_) => {
                    fatal!(
                        "Failed to stat {:?}: replay is impossible",
                        backing_file_name
                    );
                }
                Ok(backing_stat) => {
                    if backing_stat.st_ino != inode
                        || backing_stat.st_mode != mode
                        || backing_stat.st_uid != uid
                        || backing_stat.st_gid != gid
                        || backing_stat.st_size != file_size
                        || backing_stat.st_mtime != mtime
                    {
                        log!(
                            LogError,
                            "Metadata of {:?} changed: replay divergence likely, but continuing \
                             anyway",
                            fsname
                        );
                    }
                }
            }
        }

        data.time = time;
        data.source = source;
        data.filename = backing_file_name;
        data.data_offset_bytes = file_offset_bytes as usize;
        data.file_size_bytes = file_size as usize;

        Some(KernelMapping::new_with_opts(
            RemotePtr::new(start as usize),
            RemotePtr::new(end as usize),
            &fsname,
            device,
            inode as libc::ino_t,
            ProtFlags::from_bits_truncate(prot),
            MapFlags::from_bits_truncate(flags),
            file_offset_bytes,
        ))
    }

    /// Read the next task lifecycle record, or None at end of stream.
    pub fn read_task_event(&mut self) -> Option<TraceTaskEvent> {
        let tasks = self.readers.get_mut(&Substream::Tasks).unwrap();
        if tasks.at_end() {
            return None;
        }

        let time = read_u64(tasks).ok()?;
        let tid = read_i32(tasks).ok()?;
        let tag = read_u8(tasks).ok()?;
        let mut event = match tag {
            0 => {
                let parent_tid = read_i32(tasks).ok()?;
                let clone_flags = read_u64(tasks).ok()?;
                TraceTaskEvent::for_clone(tid, parent_tid, clone_flags)
            }
            1 => {
                let parent_tid = read_i32(tasks).ok()?;
                TraceTaskEvent::for_fork(tid, parent_tid)
            }
            2 => {
                let file_name = OsString::from_vec(read_bytes(tasks).ok()?);
                let argc = read_u32(tasks).ok()?;
                let mut cmd_line = Vec::new();
                for _ in 0..argc {
                    cmd_line.push(OsString::from_vec(read_bytes(tasks).ok()?));
                }
                TraceTaskEvent::for_exec(tid, file_name, cmd_line)
            }
            3 => {
                let exit_status = read_i32(tasks).ok()?;
                TraceTaskEvent::for_exit(tid, exit_status)
            }
            _ => fatal!("Bad task event tag {}", tag),
        };
        event.time_ = time;
        Some(event)
    }

    pub fn uncompressed_bytes(&self) -> u64 {
        self.readers.values().map(|r| r.uncompressed_bytes()).sum()
    }

    pub fn compressed_bytes(&self) -> u64 {
        self.readers.values().map(|r| r.compressed_bytes()).sum()
    }

    fn reader(&self, s: Substream) -> &CompressedReader {
        self.readers.get(&s).unwrap()
    }

    fn read_args_env(&mut self) {
        let path = self.args_env_path();
        let contents = match fs::read(Path::new(&path)) {
            Ok(c) => c,
            Err(e) => fatal!("Unable to read {:?}: {}", path, e),
        };
        let mut rest: &[u8] = &contents;

        let cwd_end = rest
            .iter()
            .position(|&b| b == 0)
            .unwrap_or_else(|| fatal!("Corrupt args_env"));
        self.cwd = OsString::from_vec(rest[..cwd_end].to_vec());
        rest = &rest[cwd_end + 1..];

        self.argv = read_string_list(&mut rest);
        self.envp = read_string_list(&mut rest);

        let cpu_line = String::from_utf8_lossy(rest);
        let cpu: i64 = cpu_line.trim().parse().unwrap_or(-1);
        self.trace_stream
            .set_bound_cpu(if cpu < 0 { None } else { Some(cpu as u32) });
    }
}

/// A clone has exactly the same state as the original, but mutations of the
/// clone don't affect the original (and vice versa). This is what makes
/// checkpointed sessions independent.
impl Clone for TraceReader {
    fn clone(&self) -> Self {
        let mut readers = HashMap::new();
        for (&s, r) in &self.readers {
            readers.insert(s, r.clone());
        }
        TraceReader {
            trace_stream: TraceStream::new(self.dir(), self.time()),
            readers,
            cwd: self.cwd.clone(),
            argv: self.argv.clone(),
            envp: self.envp.clone(),
        }
    }
}

fn resolve_latest_trace() -> OsString {
    let link = latest_trace_symlink();
    link.into_os_string()
}

fn notify_unusable_trace(stream: &TraceStream, why: &str) -> ! {
    let mut err = std::io::stderr();
    writeln!(
        err,
        "\nretrace: error: Trace `{}' is unusable: {}.\n",
        Path::new(stream.dir()).display(),
        why
    )
    .unwrap();
    std::process::exit(EX_DATAERR);
}

fn check_version_file(stream: &TraceStream) {
    let path = stream.version_path();
    let contents = match fs::read_to_string(Path::new(&path)) {
        Ok(c) => c,
        Err(_) => {
            let mut err = std::io::stderr();
            writeln!(
                err,
                "\nretrace: error: Version file for recorded trace `{}' not found. Did you \
                 record\n           it with an older version? If so, you'll need to replay it \
                 with that\n           version. Otherwise, your trace is likely corrupted.\n",
                Path::new(&path).display()
            )
            .unwrap();
            std::process::exit(EX_DATAERR);
        }
    };

    let version: u32 = contents.trim().parse().unwrap_or(0);
    if version != TRACE_VERSION {
        let mut err = std::io::stderr();
        writeln!(
            err,
            "\nretrace: error: Recorded trace `{}' has an incompatible version {}; expected\n   \
             {}. You'll need to replay it with a matching version, or your trace is\n   \
             corrupted.\n",
            Path::new(&path).display(),
            version,
            TRACE_VERSION
        )
        .unwrap();
        std::process::exit(EX_DATAERR);
    }
}

fn read_string_list(rest: &mut &[u8]) -> Vec<OsString> {
    let newline = rest
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or_else(|| fatal!("Corrupt args_env"));
    let count: usize = String::from_utf8_lossy(&rest[..newline])
        .trim()
        .parse()
        .unwrap_or_else(|_| fatal!("Corrupt args_env"));
    *rest = &rest[newline + 1..];

    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .unwrap_or_else(|| fatal!("Corrupt args_env"));
        out.push(OsString::from_vec(rest[..end].to_vec()));
        *rest = &rest[end + 1..];
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        event::{Event, SignalDeterministic, SignalEventData, SyscallEventData, SyscallState},
        kernel_abi::{x64_syscall, SupportedArch},
        registers::Registers,
        trace::{
            trace_frame::TraceFrame,
            trace_writer::{CloseStatus, TraceWriter},
        },
    };
    use std::ffi::OsString;

    fn temp_trace_dir(name: &str) -> OsString {
        let mut p = std::env::temp_dir();
        p.push(format!("retrace-trace-test-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&p);
        p.into_os_string()
    }

    fn make_writer(dir: &OsStr) -> TraceWriter {
        let tw = TraceWriter::new(OsStr::new("test-exe"), Some(dir), None);
        tw.write_args_env(
            OsStr::new("/tmp"),
            &[OsString::from("test-exe")],
            &[OsString::from("PATH=/bin")],
        );
        tw
    }

    fn syscall_frame(time: u64, tid: i32, state: SyscallState, ticks: u64) -> TraceFrame {
        let mut data = SyscallEventData::new(x64_syscall::READ, SupportedArch::X64);
        data.state = state;
        let mut frame =
            TraceFrame::new_with(time, tid, Event::new_syscall_event(data), ticks, 1.25);
        let mut regs = Registers::new(SupportedArch::X64);
        regs.set_ip(crate::remote_code_ptr::RemoteCodePtr::new(0x70000002));
        regs.set_syscall_result(16);
        frame.set_regs(regs);
        frame
    }

    #[test]
    fn frame_round_trip_and_time_monotonic() {
        let dir = temp_trace_dir("frames");
        let mut tw = make_writer(&dir);

        tw.write_frame(&syscall_frame(1, 100, SyscallState::EnteringSyscall, 10));
        tw.write_frame(&syscall_frame(2, 100, SyscallState::ExitingSyscall, 10));

        let mut siginfo: libc::siginfo_t = unsafe { std::mem::zeroed() };
        siginfo.si_signo = libc::SIGSEGV;
        let sig_frame = {
            let mut frame = TraceFrame::new_with(
                3,
                100,
                Event::new_signal_event(
                    crate::event::EventType::EvSignal,
                    SupportedArch::X64,
                    SignalEventData::new(&siginfo, SignalDeterministic::DeterministicSig),
                ),
                11,
                1.5,
            );
            frame.set_regs(Registers::new(SupportedArch::X64));
            frame
        };
        tw.write_frame(&sig_frame);
        tw.close(CloseStatus::CloseOk);

        let mut tr = TraceReader::new(Some(&dir));
        let f1 = tr.read_frame();
        assert_eq!(1, f1.time());
        assert_eq!(1, tr.time());
        assert_eq!(100, f1.tid());
        assert_eq!(10, f1.ticks());
        assert_eq!(
            SyscallState::EnteringSyscall,
            f1.event().syscall_event().state
        );
        assert_eq!(x64_syscall::READ, f1.event().syscall_event().number);
        assert_eq!(0x70000002, f1.regs_ref().ip().as_usize());

        let f2 = tr.read_frame();
        assert_eq!(2, f2.time());
        assert!(f2.ticks() >= f1.ticks());

        let f3 = tr.read_frame();
        assert_eq!(libc::SIGSEGV, f3.event().signal_event().siginfo.si_signo);
        assert_eq!(
            SignalDeterministic::DeterministicSig,
            f3.event().signal_event().deterministic
        );
        assert!(tr.at_end());

        std::fs::remove_dir_all(std::path::Path::new(&dir)).unwrap();
    }

    #[test]
    fn peek_does_not_advance() {
        let dir = temp_trace_dir("peek");
        let mut tw = make_writer(&dir);
        tw.write_frame(&syscall_frame(1, 7, SyscallState::EnteringSyscall, 5));
        tw.write_frame(&syscall_frame(2, 7, SyscallState::ExitingSyscall, 5));
        tw.close(CloseStatus::CloseOk);

        let mut tr = TraceReader::new(Some(&dir));
        let peeked = tr.peek_frame().unwrap();
        assert_eq!(1, peeked.time());
        assert_eq!(0, tr.time());
        let read = tr.read_frame();
        assert_eq!(1, read.time());
        assert_eq!(1, tr.time());

        std::fs::remove_dir_all(std::path::Path::new(&dir)).unwrap();
    }

    #[test]
    fn peek_to_scans_without_consuming() {
        let dir = temp_trace_dir("peek-to");
        let mut tw = make_writer(&dir);
        tw.write_frame(&syscall_frame(1, 7, SyscallState::EnteringSyscall, 5));
        tw.write_frame(&syscall_frame(2, 8, SyscallState::EnteringSyscall, 5));
        tw.write_frame(&syscall_frame(3, 8, SyscallState::ExitingSyscall, 6));
        tw.close(CloseStatus::CloseOk);

        let mut tr = TraceReader::new(Some(&dir));
        let found = tr.peek_to(
            8,
            crate::event::EventType::EvSyscall,
            SyscallState::ExitingSyscall,
        );
        assert_eq!(3, found.time());
        assert_eq!(0, tr.time());
        assert_eq!(1, tr.read_frame().time());

        std::fs::remove_dir_all(std::path::Path::new(&dir)).unwrap();
    }

    #[test]
    fn rewind_resets_time() {
        let dir = temp_trace_dir("rewind");
        let mut tw = make_writer(&dir);
        tw.write_frame(&syscall_frame(1, 7, SyscallState::EnteringSyscall, 5));
        tw.close(CloseStatus::CloseOk);

        let mut tr = TraceReader::new(Some(&dir));
        tr.read_frame();
        assert_eq!(1, tr.time());
        tr.rewind();
        assert_eq!(0, tr.time());
        assert_eq!(1, tr.read_frame().time());

        std::fs::remove_dir_all(std::path::Path::new(&dir)).unwrap();
    }

    #[test]
    fn raw_data_round_trip() {
        let dir = temp_trace_dir("raw");
        let mut tw = make_writer(&dir);
        tw.write_raw(7, b"ABCDEFGHIJKLMNOP", RemotePtr::new(0x1000));
        tw.write_frame(&syscall_frame(1, 7, SyscallState::ExitingSyscall, 5));
        tw.close(CloseStatus::CloseOk);

        let mut tr = TraceReader::new(Some(&dir));
        let _ = tr.read_frame();
        let raw = tr.read_raw_data_for_frame().unwrap();
        assert_eq!(b"ABCDEFGHIJKLMNOP".to_vec(), raw.data);
        assert_eq!(0x1000, raw.addr.as_usize());
        assert_eq!(7, raw.rec_tid);
        assert!(tr.read_raw_data_for_frame().is_none());

        std::fs::remove_dir_all(std::path::Path::new(&dir)).unwrap();
    }

    #[test]
    fn task_events_round_trip() {
        let dir = temp_trace_dir("tasks");
        let mut tw = make_writer(&dir);
        tw.write_task_event(&TraceTaskEvent::for_fork(101, 100));
        tw.write_task_event(&TraceTaskEvent::for_exec(
            101,
            OsString::from("/bin/true"),
            vec![OsString::from("true")],
        ));
        tw.write_task_event(&TraceTaskEvent::for_exit(101, 0));
        tw.close(CloseStatus::CloseOk);

        let mut tr = TraceReader::new(Some(&dir));
        let fork = tr.read_task_event().unwrap();
        assert_eq!(101, fork.tid());
        let exec = tr.read_task_event().unwrap();
        assert!(exec.is_exec());
        let exit = tr.read_task_event().unwrap();
        assert!(exit.is_exit());
        assert!(tr.read_task_event().is_none());

        std::fs::remove_dir_all(std::path::Path::new(&dir)).unwrap();
    }

    #[test]
    fn args_env_round_trip() {
        let dir = temp_trace_dir("args-env");
        let tw = make_writer(&dir);
        drop(tw);

        // The version file is still `incomplete`; rename it so the reader
        // accepts the trace.
        std::fs::rename(
            std::path::Path::new(&dir).join("incomplete"),
            std::path::Path::new(&dir).join("version"),
        )
        .unwrap();

        let tr = TraceReader::new(Some(&dir));
        assert_eq!(OsStr::new("/tmp"), tr.cwd());
        assert_eq!(&[OsString::from("test-exe")], tr.argv());
        assert_eq!(&[OsString::from("PATH=/bin")], tr.envp());

        std::fs::remove_dir_all(std::path::Path::new(&dir)).unwrap();
    }
}
