use crate::util::ensure_dir;
use nix::sys::stat::Mode;
use std::{
    env,
    ffi::{OsStr, OsString},
    fs,
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::{Path, PathBuf},
};

//
// This represents the format and layout of recorded traces. This
// version number doesn't track the program version number, because changes
// to the trace format will be rare.
//
// NB: if you *do* change the trace format for whatever reason, you
// MUST increment this version number. Otherwise users' old traces
// will become unreplayable and they won't know why.
//
pub const TRACE_VERSION: u32 = 1;

/// Update `SUBSTREAMS` and TRACE_VERSION when you update this list.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(usize)]
pub enum Substream {
    /// Substream that stores events (trace frames).
    Events = 0,
    /// Substream that stores raw-data headers (one per raw-data record).
    RawDataHeader = 1,
    /// Substream that stores raw memory captures.
    RawData = 2,
    /// Substream that stores metadata about files mmap'd during recording.
    Mmaps = 3,
    /// Substream that stores task creation and exec events.
    Tasks = 4,
}

pub const SUBSTREAM_COUNT: usize = 5;

pub struct SubstreamData {
    pub name: &'static str,
    pub block_size: usize,
    pub threads: usize,
}

static SUBSTREAMS: [SubstreamData; SUBSTREAM_COUNT] = [
    SubstreamData {
        name: "events",
        block_size: 1024 * 1024,
        threads: 1,
    },
    SubstreamData {
        name: "data_header",
        block_size: 1024 * 1024,
        threads: 1,
    },
    SubstreamData {
        name: "data",
        block_size: 8 * 1024 * 1024,
        threads: 3,
    },
    SubstreamData {
        name: "mmaps",
        block_size: 64 * 1024,
        threads: 1,
    },
    SubstreamData {
        name: "tasks",
        block_size: 64 * 1024,
        threads: 1,
    },
];

pub fn substream(s: Substream) -> &'static SubstreamData {
    &SUBSTREAMS[s as usize]
}

pub const ALL_SUBSTREAMS: [Substream; SUBSTREAM_COUNT] = [
    Substream::Events,
    Substream::RawDataHeader,
    Substream::RawData,
    Substream::Mmaps,
    Substream::Tasks,
];

/// Where to obtain data for a mapped region on replay.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum MappedDataSource {
    SourceTrace = 0,
    SourceFile = 1,
    SourceZero = 2,
}

impl MappedDataSource {
    pub fn from_tag(tag: u8) -> MappedDataSource {
        match tag {
            0 => MappedDataSource::SourceTrace,
            1 => MappedDataSource::SourceFile,
            2 => MappedDataSource::SourceZero,
            _ => fatal!("Bad mapped-data source tag {}", tag),
        }
    }
}

/// Where to obtain data for the mapped region.
pub struct MappedData {
    pub time: crate::trace::trace_frame::FrameTime,
    pub source: MappedDataSource,
    /// Name of file to map the data from.
    pub filename: OsString,
    /// Data offset within `filename`.
    pub data_offset_bytes: usize,
    /// Original size of the mapped file.
    pub file_size_bytes: usize,
}

fn dir_exists(dir: &Path) -> bool {
    fs::metadata(dir).map(|m| m.is_dir()).unwrap_or(false)
}

/// Default trace root: `$XDG_DATA_HOME/retrace` (or
/// `~/.local/share/retrace`), falling back to `~/.retrace` for existing
/// installations, then `/tmp/retrace`.
fn default_trace_dir() -> PathBuf {
    let dot_dir: Option<PathBuf> = env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(|h| PathBuf::from(h).join(".retrace"));
    let xdg_dir: Option<PathBuf> = match env::var_os("XDG_DATA_HOME") {
        Some(xdg) if !xdg.is_empty() => Some(PathBuf::from(xdg).join("retrace")),
        _ => env::var_os("HOME")
            .filter(|h| !h.is_empty())
            .map(|h| PathBuf::from(h).join(".local/share/retrace")),
    };

    // If the XDG dir does not exist but ~/.retrace does, prefer ~/.retrace
    // for backwards compatibility.
    if let Some(xdg) = &xdg_dir {
        if dir_exists(xdg) {
            return xdg.clone();
        }
    }
    if let Some(dot) = &dot_dir {
        if dir_exists(dot) {
            return dot.clone();
        }
    }
    if let Some(xdg) = xdg_dir {
        return xdg;
    }

    PathBuf::from("/tmp/retrace")
}

pub fn trace_save_dir() -> PathBuf {
    match env::var_os("_RETRACE_TRACE_DIR") {
        Some(output_dir) if !output_dir.is_empty() => PathBuf::from(output_dir),
        _ => default_trace_dir(),
    }
}

pub fn latest_trace_symlink() -> PathBuf {
    trace_save_dir().join("latest-trace")
}

fn ensure_default_trace_dir() {
    let dir = trace_save_dir();
    ensure_dir(dir.as_os_str(), "trace directory", Mode::S_IRWXU);
}

/// Find a unique trace directory name under the trace root and create it.
pub fn make_trace_dir(exe_path: &OsStr, output_trace_dir: Option<&OsStr>) -> OsString {
    if let Some(out) = output_trace_dir {
        // The user wants the trace dir at an exact location; it must not
        // already exist.
        match fs::create_dir(out) {
            Ok(_) => return out.to_owned(),
            Err(e) => fatal!("Unable to create trace directory {:?}: {}", out, e),
        }
    }

    ensure_default_trace_dir();

    let basename = Path::new(exe_path)
        .file_name()
        .unwrap_or_else(|| OsStr::new("unknown"))
        .to_owned();

    let mut nonce = 0;
    loop {
        let mut name = basename.clone().into_vec();
        name.extend_from_slice(format!("-{}", nonce).as_bytes());
        let dir = trace_save_dir().join(OsString::from_vec(name));
        match fs::create_dir(&dir) {
            Ok(_) => return dir.into_os_string(),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                nonce += 1;
            }
            Err(e) => fatal!("Unable to create trace directory {:?}: {}", dir, e),
        }
    }
}

/// Paths and the global event tick shared by the writer and the reader.
pub struct TraceStream {
    /// The directory the trace files live in.
    pub(super) trace_dir: OsString,
    /// The CPU the tracees were bound to, or None if unbound.
    pub(super) bind_to_cpu: Option<u32>,
    /// Arbitrary notion of trace time, ticked on the completion of each
    /// event (e.g. syscall entry).
    pub(super) global_time: crate::trace::trace_frame::FrameTime,
}

impl TraceStream {
    pub(super) fn new(trace_dir: &OsStr, initial_time: crate::trace::trace_frame::FrameTime) -> TraceStream {
        TraceStream {
            trace_dir: trace_dir.to_owned(),
            bind_to_cpu: None,
            global_time: initial_time,
        }
    }

    pub fn dir(&self) -> &OsStr {
        &self.trace_dir
    }

    pub fn bound_to_cpu(&self) -> Option<u32> {
        self.bind_to_cpu
    }

    pub fn set_bound_cpu(&mut self, bound: Option<u32>) {
        self.bind_to_cpu = bound;
    }

    /// Current global time.
    pub fn time(&self) -> crate::trace::trace_frame::FrameTime {
        self.global_time
    }

    pub(super) fn tick_time(&mut self) {
        self.global_time += 1;
    }

    pub(super) fn path(&self, s: Substream) -> OsString {
        let mut p = self.trace_dir.clone().into_vec();
        p.push(b'/');
        p.extend_from_slice(substream(s).name.as_bytes());
        OsString::from_vec(p)
    }

    pub(super) fn version_path(&self) -> OsString {
        let mut p = self.trace_dir.clone().into_vec();
        p.extend_from_slice(b"/version");
        OsString::from_vec(p)
    }

    /// While the trace is being recorded the version file is named
    /// `incomplete` and holds an exclusive flock; it is renamed to `version`
    /// at close. External observers can classify a trace directory's state
    /// from this.
    pub(super) fn incomplete_version_path(&self) -> OsString {
        let mut p = self.trace_dir.clone().into_vec();
        p.extend_from_slice(b"/incomplete");
        OsString::from_vec(p)
    }

    pub(super) fn args_env_path(&self) -> OsString {
        let mut p = self.trace_dir.clone().into_vec();
        p.extend_from_slice(b"/args_env");
        OsString::from_vec(p)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn substream_table() {
        assert_eq!("events", substream(Substream::Events).name);
        assert_eq!("data", substream(Substream::RawData).name);
        assert_eq!(3, substream(Substream::RawData).threads);
        assert_eq!(SUBSTREAM_COUNT, ALL_SUBSTREAMS.len());
    }

    #[test]
    fn stream_paths() {
        let ts = TraceStream::new(OsStr::new("/tmp/trace-0"), 1);
        assert_eq!(OsStr::new("/tmp/trace-0/events"), ts.path(Substream::Events));
        assert_eq!(OsStr::new("/tmp/trace-0/version"), ts.version_path());
        assert_eq!(
            OsStr::new("/tmp/trace-0/incomplete"),
            ts.incomplete_version_path()
        );
    }

    #[test]
    fn time_ticks() {
        let mut ts = TraceStream::new(OsStr::new("/tmp/trace-0"), 1);
        assert_eq!(1, ts.time());
        ts.tick_time();
        assert_eq!(2, ts.time());
    }
}
