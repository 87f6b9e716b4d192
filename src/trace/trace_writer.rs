use crate::{
    event::Event,
    extra_registers::ExtraRegisters,
    registers::Registers,
    remote_ptr::{RemotePtr, Void},
    scoped_fd::ScopedFd,
    session::address_space::kernel_mapping::KernelMapping,
    trace::{
        compressed_writer::{CompressedWriter, Sync},
        trace_frame::TraceFrame,
        trace_stream::{
            latest_trace_symlink, make_trace_dir, substream, Substream, TraceStream,
            ALL_SUBSTREAMS, TRACE_VERSION,
        },
        trace_task_event::{TraceTaskEvent, TraceTaskEventVariant},
        write_bytes, write_f64, write_i32, write_i64, write_u32, write_u64, write_u8,
    },
    util::{probably_not_interactive, should_copy_mmap_region, write_all},
};
use libc::{dev_t, ino_t, pid_t, STDOUT_FILENO};
use nix::{
    errno::{errno, Errno},
    fcntl::{flock, FlockArg::LockExclusiveNonblock, OFlag},
    sys::stat::Mode,
    unistd::unlink,
};
use std::{
    collections::HashMap,
    ffi::{OsStr, OsString},
    fs::{hard_link, rename},
    io::Write,
    ops::{Deref, DerefMut},
    os::unix::ffi::{OsStrExt, OsStringExt},
    os::unix::fs::symlink,
    path::Path,
};

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum RecordInTrace {
    DontRecordInTrace,
    RecordInTrace,
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum MappingOrigin {
    SyscallMapping,
    /// Just memory moved from one place to another, so no recording needed.
    RemapMapping,
    ExecMapping,
    PatchMapping,
    /// The engine page or a syscallbuf ring; contents are synthesized.
    EngineMapping,
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum CloseStatus {
    /// Trace completed normally and can be replayed.
    CloseOk,
    /// Trace completed abnormally due to a supervisor error. The trace
    /// directory keeps its `incomplete` marker.
    CloseError,
}

/// Trace writing takes the trace directory through a defined set of states,
/// observable by external programs:
///
/// -- Initially the trace directory does not exist.
/// -- The trace directory is created. It is empty.
/// -- A file `incomplete` is created in the trace directory. It is empty.
/// -- We take an exclusive flock() lock on `incomplete`.
/// -- We write data to `incomplete` so it is no longer empty.
/// -- At the end of recording, `incomplete` is renamed to `version`.
///    At this point the trace is complete and ready to replay.
/// -- We release the flock() lock.
///
/// Thus: a directory with `version` is a valid trace; a directory with a
/// locked `incomplete` is still being recorded; a directory with an
/// unlocked, non-empty `incomplete` belonged to a recorder that died.
pub struct TraceWriter {
    trace_stream: TraceStream,
    writers: HashMap<Substream, CompressedWriter>,
    /// Files that have already been mapped without being copied to the
    /// trace, i.e. that we have already assumed to be immutable. Keyed by
    /// (device, inode); the value is the name under which we assumed it
    /// immutable, since a file may be reached through multiple names.
    files_assumed_immutable: HashMap<(dev_t, ino_t), OsString>,
    /// Keep the `incomplete` (later renamed to `version`) file open until we
    /// rename it, so our flock() lock stays held on it.
    version_fd: ScopedFd,
    mmap_count: u32,
}

impl Deref for TraceWriter {
    type Target = TraceStream;

    fn deref(&self) -> &Self::Target {
        &self.trace_stream
    }
}

impl DerefMut for TraceWriter {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.trace_stream
    }
}

impl TraceWriter {
    /// Create a trace for the tracee named by `file_name`, optionally at the
    /// exact directory `output_trace_dir`, with tracees bound to
    /// `bind_to_cpu`.
    pub fn new(
        file_name: &OsStr,
        output_trace_dir: Option<&OsStr>,
        bind_to_cpu: Option<u32>,
    ) -> TraceWriter {
        let mut tw = TraceWriter {
            trace_stream: TraceStream::new(&make_trace_dir(file_name, output_trace_dir), 1),
            writers: Default::default(),
            files_assumed_immutable: Default::default(),
            version_fd: ScopedFd::new(),
            mmap_count: 0,
        };

        tw.trace_stream.set_bound_cpu(bind_to_cpu);

        for &s in ALL_SUBSTREAMS.iter() {
            let path = tw.path(s);
            tw.writers.insert(
                s,
                CompressedWriter::new(&path, substream(s).block_size, substream(s).threads),
            );
        }

        let ver_path = tw.incomplete_version_path();
        tw.version_fd = ScopedFd::open_path_with_mode(
            &ver_path,
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
            Mode::S_IRUSR | Mode::S_IWUSR,
        );
        if !tw.version_fd.is_open() {
            fatal!("Unable to create {:?}", ver_path);
        }

        // Take an exclusive lock and hold it until we rename the file at
        // the end of recording and then close our file descriptor.
        if flock(tw.version_fd.as_raw(), LockExclusiveNonblock).is_err() {
            fatal!("Unable to lock {:?}", ver_path);
        }
        let buf = format!("{}\n", TRACE_VERSION);
        write_all(tw.version_fd.as_raw(), buf.as_bytes());

        if !probably_not_interactive(STDOUT_FILENO) {
            println!(
                "retrace: Saving execution to trace directory `{}'.",
                Path::new(tw.dir()).display()
            );
        }
        tw
    }

    /// Write the initial process parameters: NUL-separated cwd, argv, envp,
    /// then the pinned CPU index.
    pub fn write_args_env(&self, cwd: &OsStr, argv: &[OsString], envp: &[OsString]) {
        let path = self.args_env_path();
        let mut out: Vec<u8> = Vec::new();
        out.extend_from_slice(cwd.as_bytes());
        out.push(0);
        write_string_list(&mut out, argv);
        write_string_list(&mut out, envp);
        let cpu: i64 = match self.bound_to_cpu() {
            Some(c) => c as i64,
            None => -1,
        };
        out.extend_from_slice(format!("{}\n", cpu).as_bytes());
        if std::fs::write(Path::new(&path), &out).is_err() {
            fatal!("Unable to write {:?}", path);
        }
    }

    /// Write trace frame to the trace.
    ///
    /// Recording a trace frame has the side effect of ticking
    /// the global time.
    pub fn write_frame(&mut self, frame: &TraceFrame) {
        let encoded = frame.event().encode();
        debug_assert_eq!(frame.time(), self.time());

        let events = self.writer_mut(Substream::Events);

        // BasicInfo: global time, tid, encoded event, ticks, monotonic
        // seconds.
        let ok = write_u64(events, frame.time())
            .and_then(|_| write_i32(events, frame.tid()))
            .and_then(|_| write_u32(events, encoded.encoded))
            .and_then(|_| write_u64(events, frame.ticks()))
            .and_then(|_| write_f64(events, frame.monotonic_time()));
        if ok.is_err() {
            fatal!("Tried to save basic info to the trace, but failed");
        }

        if encoded.has_exec_info() {
            let regs = frame.regs_ref().get_ptrace_for_self_arch();
            if write_bytes(events, regs).is_err() {
                fatal!("Tried to save registers to the trace, but failed");
            }

            let extra = frame.extra_regs_ref();
            let ok = write_u8(events, extra.format() as u8)
                .and_then(|_| write_bytes(events, extra.data_bytes()));
            if ok.is_err() {
                fatal!("Tried to save extra registers to the trace, but failed");
            }
        }

        if frame.event().is_signal_event() {
            if write_u64(events, frame.event().signal_event().signal_data()).is_err() {
                fatal!("Tried to save signal payload to the trace, but failed");
            }
        }

        self.tick_time();
    }

    /// Write a raw-data record to the trace.
    /// `addr` is the address in the tracee where the data came from/will be
    /// restored to.
    pub fn write_raw(&mut self, rec_tid: pid_t, d: &[u8], addr: RemotePtr<Void>) {
        let global_time = self.time();
        {
            let header = self.writer_mut(Substream::RawDataHeader);
            write_u64(header, global_time).unwrap_or_else(|_| fatal!("Can't write data header"));
            write_i32(header, rec_tid).unwrap_or_else(|_| fatal!("Can't write data header"));
            write_u64(header, addr.as_usize() as u64)
                .unwrap_or_else(|_| fatal!("Can't write data header"));
            write_u64(header, d.len() as u64)
                .unwrap_or_else(|_| fatal!("Can't write data header"));
        }
        let data = self.writer_mut(Substream::RawData);
        if data.write_all(d).is_err() {
            fatal!("Can't write data");
        }
    }

    /// Write a mapped-region record to the trace.
    /// If this returns `RecordInTrace::RecordInTrace`, then the data for the
    /// map should be recorded in the trace raw-data.
    pub fn write_mapped_region(
        &mut self,
        km: &KernelMapping,
        stat: &libc::stat,
        origin: MappingOrigin,
    ) -> RecordInTrace {
        let source;
        let mut backing_file_name = OsString::new();

        if origin == MappingOrigin::RemapMapping
            || origin == MappingOrigin::PatchMapping
            || origin == MappingOrigin::EngineMapping
        {
            source = super::trace_stream::MappedDataSource::SourceZero;
        } else if km.fsname().as_bytes().starts_with(b"/SYSV") {
            source = super::trace_stream::MappedDataSource::SourceTrace;
        } else if origin == MappingOrigin::SyscallMapping
            && (km.inode() == 0 || km.fsname() == "/dev/zero (deleted)")
        {
            source = super::trace_stream::MappedDataSource::SourceZero;
        } else if !km.fsname().as_bytes().starts_with(b"/") {
            source = super::trace_stream::MappedDataSource::SourceTrace;
        } else if should_copy_mmap_region(km, stat)
            && !self
                .files_assumed_immutable
                .contains_key(&(stat.st_dev, stat.st_ino))
        {
            source = super::trace_stream::MappedDataSource::SourceTrace;
        } else {
            source = super::trace_stream::MappedDataSource::SourceFile;
            // Try hardlinking the file into the trace directory. This avoids
            // replay failures if the original file is deleted or replaced
            // (but not if it is overwritten in-place). If try_hardlink_file
            // fails it just returns the original file name.
            // A relative backing_file_name is relative to the trace
            // directory.
            backing_file_name = self.try_hardlink_file(km.fsname());
            self.files_assumed_immutable
                .insert((stat.st_dev, stat.st_ino), backing_file_name.clone());
        }

        let global_time = self.time();
        let st_mode = stat.st_mode;
        let st_uid = stat.st_uid;
        let st_gid = stat.st_gid;
        let st_size = stat.st_size;
        let st_mtime = stat.st_mtime;
        let mmaps = self.writer_mut(Substream::Mmaps);
        let ok = write_u64(mmaps, global_time)
            .and_then(|_| write_u8(mmaps, source as u8))
            .and_then(|_| write_u64(mmaps, km.start().as_usize() as u64))
            .and_then(|_| write_u64(mmaps, km.end().as_usize() as u64))
            .and_then(|_| write_bytes(mmaps, km.fsname().as_bytes()))
            .and_then(|_| write_u64(mmaps, km.device()))
            .and_then(|_| write_u64(mmaps, km.inode() as u64))
            .and_then(|_| write_i32(mmaps, km.prot().bits()))
            .and_then(|_| write_i32(mmaps, km.flags().bits()))
            .and_then(|_| write_u64(mmaps, km.file_offset_bytes()))
            .and_then(|_| write_bytes(mmaps, backing_file_name.as_bytes()))
            .and_then(|_| write_u32(mmaps, st_mode))
            .and_then(|_| write_u32(mmaps, st_uid))
            .and_then(|_| write_u32(mmaps, st_gid))
            .and_then(|_| write_i64(mmaps, st_size))
            .and_then(|_| write_i64(mmaps, st_mtime));
        if ok.is_err() {
            fatal!("Unable to write mmaps");
        }

        self.mmap_count += 1;
        if source == super::trace_stream::MappedDataSource::SourceTrace {
            RecordInTrace::RecordInTrace
        } else {
            RecordInTrace::DontRecordInTrace
        }
    }

    /// Write a task event (clone, fork, exec or exit record) to the trace.
    pub fn write_task_event(&mut self, event: &TraceTaskEvent) {
        let global_time = self.time();
        let tid = event.tid();
        let tasks = self.writer_mut(Substream::Tasks);
        let ok = write_u64(tasks, global_time).and_then(|_| write_i32(tasks, tid));
        if ok.is_err() {
            fatal!("Unable to write tasks");
        }

        let ok = match event.variant() {
            TraceTaskEventVariant::Clone(e) => write_u8(tasks, 0)
                .and_then(|_| write_i32(tasks, e.parent_tid))
                .and_then(|_| write_u64(tasks, e.clone_flags)),
            TraceTaskEventVariant::Fork(e) => {
                write_u8(tasks, 1).and_then(|_| write_i32(tasks, e.parent_tid))
            }
            TraceTaskEventVariant::Exec(e) => {
                write_u8(tasks, 2)
                    .and_then(|_| write_bytes(tasks, e.file_name.as_bytes()))
                    .and_then(|_| write_u32(tasks, e.cmd_line.len() as u32))
                    .and_then(|_| {
                        for arg in &e.cmd_line {
                            write_bytes(tasks, arg.as_bytes())?;
                        }
                        Ok(())
                    })
            }
            TraceTaskEventVariant::Exit(e) => {
                write_u8(tasks, 3).and_then(|_| write_i32(tasks, e.exit_status))
            }
        };
        if ok.is_err() {
            fatal!("Unable to write tasks");
        }
    }

    /// Return true iff all trace files are "good".
    pub fn good(&self) -> bool {
        self.writers.values().all(|w| w.good())
    }

    /// Close all the relevant trace files, then mark the trace complete by
    /// renaming `incomplete` to `version`. On CloseError the rename is
    /// skipped, leaving the directory identifiably dead.
    pub fn close(&mut self, status: CloseStatus) {
        for w in self.writers.values_mut() {
            w.close(Some(Sync::DontSync));
        }

        if status == CloseStatus::CloseOk {
            let incomplete_path = self.incomplete_version_path();
            let path = self.version_path();
            if rename(Path::new(&incomplete_path), Path::new(&path)).is_err() {
                fatal!("Unable to create version file {:?}", path);
            }
        }
        self.version_fd.close();
    }

    /// We got far enough into recording that we should set this as the
    /// latest trace.
    pub fn make_latest_trace(&self) {
        let link_name = latest_trace_symlink();
        // We only attempt to set the symlink once. If the link is re-created
        // after we unlink() it, then another recorder is racing with us and
        // it "won". The link is then valid and points at some very-recent
        // trace, so that's good enough.
        unlink(link_name.as_os_str()).unwrap_or(());

        // Link only the trace name, not the full path, so moving a directory
        // full of traces around doesn't break the latest-trace link.
        let trace_name_path = Path::new(&self.trace_dir);
        let trace_name = trace_name_path.file_name().unwrap();
        let ret = symlink(trace_name, &link_name);
        if ret.is_err() && errno() != Errno::EEXIST as i32 {
            fatal!(
                "Failed to update symlink `{:?}' to `{:?}'.",
                link_name,
                trace_name
            );
        }
    }

    fn try_hardlink_file(&self, file_name: &OsStr) -> OsString {
        let base_file_name = match Path::new(file_name).file_name() {
            Some(name) => name,
            None => return file_name.to_owned(),
        };
        let mut link_name: Vec<u8> =
            format!("mmap_{}_hardlink_", self.mmap_count).into_bytes();
        link_name.extend_from_slice(base_file_name.as_bytes());

        let mut dest_path: Vec<u8> = self.dir().as_bytes().to_vec();
        dest_path.push(b'/');
        dest_path.extend_from_slice(&link_name);

        if hard_link(file_name, OsStr::from_bytes(&dest_path)).is_err() {
            // Maybe we tried to link across filesystems.
            return file_name.to_owned();
        }
        OsString::from_vec(link_name)
    }

    fn writer_mut(&mut self, s: Substream) -> &mut CompressedWriter {
        self.writers.get_mut(&s).unwrap()
    }
}

fn write_string_list(out: &mut Vec<u8>, list: &[OsString]) {
    out.extend_from_slice(format!("{}\n", list.len()).as_bytes());
    for v in list {
        out.extend_from_slice(v.as_bytes());
        out.push(0);
    }
}
