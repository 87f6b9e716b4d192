use crate::{
    commands::{exit_result::ExitResult, options::RecordOptions, RetraceCommand},
    log::LogLevel::LogInfo,
    preload_interface::{SYSCALLBUF_ENABLED_ENV_VAR, SYSCALLBUF_LIB_FILENAME},
    scheduler::DEFAULT_MAX_TICKS,
    session::{
        record_session::{RecordSession, RecordStatus},
        Session,
    },
    trace::trace_writer::CloseStatus,
    util::choose_cpu,
};
use std::{
    env,
    ffi::OsString,
    sync::atomic::{AtomicBool, Ordering},
};

/// Set by the termination signal handler; checked between steps.
static TERMINATE_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_termination_signal(_sig: i32) {
    TERMINATE_REQUESTED.store(true, Ordering::SeqCst);
}

pub struct RecordCommand {
    options: RecordOptions,
}

impl RecordCommand {
    pub fn new(options: RecordOptions) -> RecordCommand {
        RecordCommand { options }
    }

    fn tracee_env(&self, syscallbuf_enabled: bool) -> Vec<OsString> {
        let mut envp: Vec<OsString> = env::vars_os()
            .map(|(k, v)| {
                let mut e = k;
                e.push("=");
                e.push(v);
                e
            })
            .collect();
        envp.push(OsString::from("RUNNING_UNDER_RETRACE=1"));
        if syscallbuf_enabled {
            envp.push(OsString::from(format!("{}=1", SYSCALLBUF_ENABLED_ENV_VAR)));
            let mut preload = OsString::from("LD_PRELOAD=");
            preload.push(SYSCALLBUF_LIB_FILENAME);
            envp.push(preload);
        }
        envp
    }
}

impl RetraceCommand for RecordCommand {
    fn run(&mut self) -> ExitResult<()> {
        let syscallbuf_enabled = !self.options.no_syscall_buffer;
        let mut argv: Vec<OsString> = vec![self.options.exe.clone()];
        argv.extend(self.options.args.iter().cloned());
        let envp = self.tracee_env(syscallbuf_enabled);
        let bind_to_cpu = choose_cpu(self.options.bind_to_cpu);

        // Flush the current frame and write the termination marker when the
        // recorder is asked to die.
        unsafe {
            let handler = handle_termination_signal as extern "C" fn(i32);
            libc::signal(libc::SIGINT, handler as libc::sighandler_t);
            libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        }

        let session = RecordSession::create(
            &self.options.exe,
            &argv,
            &envp,
            self.options
                .output_trace_dir
                .as_ref()
                .map(|p| p.as_os_str()),
            bind_to_cpu,
            self.options.max_ticks.unwrap_or(DEFAULT_MAX_TICKS),
            self.options.always_switch,
            self.options.chaos,
            syscallbuf_enabled,
        );
        let record = session.as_record().unwrap();
        record.trace_writer().make_latest_trace();

        let mut exit_status = 0;
        loop {
            if TERMINATE_REQUESTED.load(Ordering::SeqCst) {
                record.terminate_recording();
                log!(LogInfo, "Recording terminated by signal");
                return ExitResult::Ok(());
            }

            let result = record.record_step();
            match result.status {
                RecordStatus::StepContinue => continue,
                RecordStatus::StepExited => {
                    exit_status = result.exit_status;
                    break;
                }
                RecordStatus::StepSpawnFailed => {
                    record.close_trace(CloseStatus::CloseError);
                    return ExitResult::fatal("Initial exec of the tracee failed");
                }
            }
        }

        record.close_trace(CloseStatus::CloseOk);
        log!(LogInfo, "Recording finished with status {}", exit_status);

        if exit_status != 0 {
            return ExitResult::Err(exit_status, format!("tracee exited with {}", exit_status));
        }
        ExitResult::Ok(())
    }
}
