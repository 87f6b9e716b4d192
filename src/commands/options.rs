use std::{ffi::OsString, path::PathBuf};
use structopt::StructOpt;

#[derive(StructOpt, Clone)]
#[structopt(
    name = "retrace",
    about = "A deterministic record/replay engine for Linux user-space processes"
)]
pub struct RetraceOptions {
    /// Force operations that would otherwise be refused, e.g. launching a
    /// debugger when output isn't a tty.
    #[structopt(long = "force-things", global = true)]
    pub force_things: bool,

    /// Suppress warnings about environmental features outside our control.
    #[structopt(long = "suppress-environment-warnings", global = true)]
    pub suppress_environment_warnings: bool,

    /// Treat every warning or error as fatal.
    #[structopt(long = "fatal-errors", global = true)]
    pub fatal_errors: bool,

    /// Override microarchitecture detection, e.g. when running under an
    /// emulator.
    #[structopt(long = "microarch", global = true)]
    pub microarch: Option<String>,

    #[structopt(subcommand)]
    pub cmd: RetraceSubcommand,
}

#[derive(StructOpt, Clone)]
pub enum RetraceSubcommand {
    /// Record the execution of a program, producing a trace.
    Record(RecordOptions),
    /// Replay a previously recorded trace.
    Replay(ReplayOptions),
    /// Dump the frames of a recorded trace in human- or machine-readable
    /// form.
    Dump(DumpOptions),
}

#[derive(StructOpt, Clone)]
pub struct RecordOptions {
    /// Desired size of each scheduling timeslice, in ticks.
    #[structopt(long = "max-ticks", short = "t")]
    pub max_ticks: Option<u64>,

    /// Try to context switch at every rescheduling opportunity.
    #[structopt(long = "always-switch")]
    pub always_switch: bool,

    /// Randomize scheduling decisions to try to reproduce rare bugs.
    #[structopt(long = "chaos")]
    pub chaos: bool,

    /// Number of cores to pretend to have.
    #[structopt(long = "num-cores")]
    pub num_cores: Option<u32>,

    /// Disable the syscall buffer preload library even if it would work.
    #[structopt(long = "no-syscall-buffer", short = "n")]
    pub no_syscall_buffer: bool,

    /// Record the trace into this directory rather than the default root.
    #[structopt(long = "output-trace-dir", short = "o", parse(from_os_str))]
    pub output_trace_dir: Option<PathBuf>,

    /// Bind tracees to this logical CPU.
    #[structopt(long = "bind-to-cpu")]
    pub bind_to_cpu: Option<u32>,

    /// The program to record.
    #[structopt(parse(from_os_str))]
    pub exe: OsString,

    /// Arguments for the program.
    #[structopt(parse(from_os_str))]
    pub args: Vec<OsString>,
}

#[derive(StructOpt, Clone)]
pub struct ReplayOptions {
    /// Replay without a debugger server ("autopilot").
    #[structopt(long = "autopilot", short = "a")]
    pub autopilot: bool,

    /// Start a debug server when the trace reaches event N.
    #[structopt(long = "goto", short = "g")]
    pub goto_event: Option<u64>,

    /// Start a debug server on the first fork of the process with this pid
    /// at record time.
    #[structopt(long = "onfork", short = "f")]
    pub onfork: Option<libc::pid_t>,

    /// Start a debug server when this process (pid or name at record time)
    /// has been exec'd.
    #[structopt(long = "onprocess", short = "p")]
    pub onprocess: Option<String>,

    /// The debugger binary to launch.
    #[structopt(long = "debugger", short = "d", parse(from_os_str))]
    pub debugger: Option<PathBuf>,

    /// A file of debugger commands to run at startup.
    #[structopt(long = "gdb-x", short = "x", parse(from_os_str))]
    pub gdb_command_file: Option<PathBuf>,

    /// Only open the debug port; don't launch a debugger.
    #[structopt(long = "dbgport", short = "s")]
    pub dbgport: Option<u16>,

    /// Don't replay writes to stdout/stderr.
    #[structopt(long = "no-redirect-output", short = "q")]
    pub no_redirect_output: bool,

    /// Singlestep-trace frames above this event number.
    #[structopt(long = "trace", short = "u")]
    pub trace_event: Option<u64>,

    /// The trace directory; defaults to the latest trace.
    #[structopt(parse(from_os_str))]
    pub trace_dir: Option<OsString>,
}

#[derive(StructOpt, Clone)]
pub struct DumpOptions {
    /// Dump in a raw, machine-parseable format.
    #[structopt(long = "raw", short = "r")]
    pub raw: bool,

    /// Print trace statistics (frame counts, compressed/uncompressed
    /// bytes).
    #[structopt(long = "statistics", short = "b")]
    pub statistics: bool,

    /// The trace directory; defaults to the latest trace.
    #[structopt(parse(from_os_str))]
    pub trace_dir: Option<OsString>,

    /// Event specs: `N` for a single event, `A-B` for a range.
    pub event_specs: Vec<String>,
}
