pub mod dump_command;
pub mod exit_result;
pub mod options;
pub mod record_command;
pub mod replay_command;

use exit_result::ExitResult;
use options::{RetraceOptions, RetraceSubcommand};
use structopt::StructOpt;

pub trait RetraceCommand {
    fn run(&mut self) -> ExitResult<()>;
}

/// Parse the command line and run the selected verb. Exit codes: 0 success,
/// 2 bad user input, EX_DATAERR for trace version mismatch (raised in the
/// trace reader), nonzero from fatal divergence.
pub fn dispatch() {
    let options = RetraceOptions::from_args();

    let result = match options.cmd {
        RetraceSubcommand::Record(rec) => record_command::RecordCommand::new(rec).run(),
        RetraceSubcommand::Replay(rep) => replay_command::ReplayCommand::new(rep).run(),
        RetraceSubcommand::Dump(dump) => dump_command::DumpCommand::new(dump).run(),
    };

    match result {
        ExitResult::Ok(()) => (),
        ExitResult::Err(code, message) => {
            eprintln!("retrace: error: {}", message);
            std::process::exit(code);
        }
    }
}
