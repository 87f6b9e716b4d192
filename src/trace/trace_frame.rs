use crate::{
    event::Event,
    extra_registers::{ExtraRegisters, Format},
    registers::Registers,
    ticks::Ticks,
};
use libc::pid_t;
use std::{
    io,
    io::{stdout, Write},
};

pub type FrameTime = u64;

/// One record in the `events` substream; corresponds to one observable
/// occurrence in one tracee.
#[derive(Clone)]
pub struct TraceFrame {
    pub(super) global_time: FrameTime,
    pub(super) tid_: pid_t,
    pub(super) ev: Event,
    pub(super) ticks_: Ticks,
    pub(super) monotonic_time_: f64,
    pub(super) recorded_regs: Registers,
    /// Only present when the event has execution info, and usually empty
    /// even then.
    pub(super) recorded_extra_regs: ExtraRegisters,
}

impl TraceFrame {
    pub fn new_with(
        global_time: FrameTime,
        tid: pid_t,
        event: Event,
        tick_count: Ticks,
        monotonic_time: f64,
    ) -> TraceFrame {
        TraceFrame {
            global_time,
            tid_: tid,
            ev: event,
            ticks_: tick_count,
            monotonic_time_: monotonic_time,
            recorded_regs: Registers::default(),
            recorded_extra_regs: ExtraRegisters::default(),
        }
    }

    pub fn new() -> TraceFrame {
        TraceFrame::new_with(0, 0, Event::default(), 0, 0.0)
    }

    pub fn time(&self) -> FrameTime {
        self.global_time
    }
    pub fn tid(&self) -> pid_t {
        self.tid_
    }
    pub fn event(&self) -> &Event {
        &self.ev
    }
    pub fn event_mut(&mut self) -> &mut Event {
        &mut self.ev
    }
    pub fn ticks(&self) -> Ticks {
        self.ticks_
    }
    pub fn monotonic_time(&self) -> f64 {
        self.monotonic_time_
    }

    pub fn regs_ref(&self) -> &Registers {
        &self.recorded_regs
    }
    pub fn regs_mut(&mut self) -> &mut Registers {
        &mut self.recorded_regs
    }
    pub fn extra_regs_ref(&self) -> &ExtraRegisters {
        &self.recorded_extra_regs
    }

    pub fn set_regs(&mut self, regs: Registers) {
        self.recorded_regs = regs;
    }

    pub fn set_extra_regs(&mut self, extra: ExtraRegisters) {
        self.recorded_extra_regs = extra;
    }

    /// Log a human-readable representation of this to `out`
    /// (defaulting to stdout), including a newline character.
    pub fn dump(&self, maybe_out: Option<&mut dyn Write>) -> io::Result<()> {
        let sout = &mut stdout();
        let out = maybe_out.unwrap_or(sout);
        write!(
            out,
            "{{\n  real_time:{:.6} global_time:{}, event:`{}' ",
            self.monotonic_time(),
            self.time(),
            self.event()
        )?;
        if self.event().is_syscall_event() {
            write!(out, "(state:{}) ", self.event().syscall_event().state)?;
        }
        writeln!(out, "tid:{}, ticks:{}", self.tid(), self.ticks())?;
        if !self.event().record_regs() {
            return Ok(());
        }

        write!(out, "  ")?;
        self.regs_ref().write_register_file_compact(out)?;
        if self.recorded_extra_regs.format() != Format::None {
            write!(out, " ")?;
            self.recorded_extra_regs.write_register_file_compact(out)?;
        }
        writeln!(out)
    }

    /// Log an easily machine-parseable representation of this to `out`
    /// (defaulting to stdout), including a newline character.
    pub fn dump_raw(&self, maybe_out: Option<&mut dyn Write>) -> io::Result<()> {
        let sout = &mut stdout();
        let out = maybe_out.unwrap_or(sout);
        write!(
            out,
            " {} {} {} {}",
            self.time(),
            self.tid(),
            self.event().event_type() as i32,
            self.ticks()
        )?;
        if !self.event().record_regs() {
            writeln!(out)?;
            return Ok(());
        }

        write!(out, " ")?;
        self.regs_ref().write_register_file_compact(out)?;
        writeln!(out)
    }
}

impl Default for TraceFrame {
    fn default() -> Self {
        TraceFrame::new()
    }
}
