use crate::{
    commands::{exit_result::ExitResult, options::ReplayOptions, RetraceCommand},
    log::LogLevel::LogInfo,
    session::{
        replay_session::{Flags, ReplaySession, ReplayStatus},
        session_inner::RunCommand,
        Session,
    },
};
use std::ffi::OsStr;

pub struct ReplayCommand {
    options: ReplayOptions,
}

impl ReplayCommand {
    pub fn new(options: ReplayOptions) -> ReplayCommand {
        ReplayCommand { options }
    }

    fn session_flags(&self) -> Flags {
        Flags {
            redirect_stdio: !self.options.no_redirect_output,
            share_private_mappings: false,
            cpu_unbound: false,
        }
    }
}

impl RetraceCommand for ReplayCommand {
    fn run(&mut self) -> ExitResult<()> {
        if self.options.onfork.is_some() && self.options.onprocess.is_some() {
            return ExitResult::usage_error("--onfork and --onprocess are mutually exclusive");
        }

        let session = ReplaySession::create(
            self.options.trace_dir.as_ref().map(|d| d.as_os_str() as &OsStr),
            self.session_flags(),
        );
        let replay = session.as_replay().unwrap();

        // Autopilot or debugger-target searching: in both cases we drive
        // replay forward frame by frame; the debugger front-end (an
        // external collaborator) would attach at goto_event/onfork/
        // onprocess. Detached operation just runs to the end.
        let singlestep_above = self.options.trace_event.unwrap_or(u64::max_value());

        loop {
            let command = if replay.current_frame_time() >= singlestep_above {
                RunCommand::Singlestep
            } else {
                RunCommand::Continue
            };

            if let Some(goto_event) = self.options.goto_event {
                if replay.current_frame_time() >= goto_event {
                    log!(
                        LogInfo,
                        "Reached target event {}; debugger attach point",
                        goto_event
                    );
                    // Stop paying attention to the target after announcing.
                    self.options.goto_event = None;
                }
            }

            let result = replay.replay_step(command);
            match result.status {
                ReplayStatus::ReplayContinue => {
                    if result.break_status.any_break() {
                        // With no debugger attached, breaks are informative
                        // only.
                        log!(
                            LogInfo,
                            "break at event {} (tid {:?})",
                            replay.current_frame_time(),
                            result.break_status.tid
                        );
                    }
                }
                ReplayStatus::ReplayExited => break,
            }
        }

        log!(LogInfo, "Replay finished");
        ExitResult::Ok(())
    }
}
