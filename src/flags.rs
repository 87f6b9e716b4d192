use crate::commands::options::RetraceOptions;
use structopt::StructOpt;

lazy_static! {
    static ref FLAGS: Flags = init_flags();
}

/// Process-global option block, resolved once from the command line.
#[derive(Clone)]
pub struct Flags {
    /// Force retrace to do some things that it otherwise wouldn't, for
    /// example launching an emergency debugger when the output
    /// doesn't seem to be a tty.
    pub force_things: bool,
    /// Suppress warnings related to environmental features outside our
    /// control.
    pub suppress_environment_warnings: bool,
    /// Any warning or error that would be printed is treated as fatal.
    pub fatal_errors_and_warnings: bool,
    /// User override for microarchitecture detection, e.g. when running
    /// under an emulator.
    pub forced_uarch: Option<String>,
}

impl Flags {
    pub fn get() -> &'static Flags {
        &*FLAGS
    }
}

fn init_flags() -> Flags {
    let options = RetraceOptions::from_args();

    Flags {
        force_things: options.force_things,
        suppress_environment_warnings: options.suppress_environment_warnings,
        fatal_errors_and_warnings: options.fatal_errors,
        forced_uarch: options.microarch.clone(),
    }
}
