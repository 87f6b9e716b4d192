use crate::{
    commands::{exit_result::ExitResult, options::DumpOptions, RetraceCommand},
    trace::trace_reader::TraceReader,
};
use std::ffi::OsStr;

/// An inclusive event range parsed from an `N` or `A-B` spec.
#[derive(Copy, Clone)]
struct EventSpec {
    start: u64,
    end: u64,
}

fn parse_event_spec(spec: &str) -> Option<EventSpec> {
    let mut it = spec.splitn(2, '-');
    let start: u64 = it.next()?.parse().ok()?;
    match it.next() {
        Some(end_str) => {
            let end: u64 = end_str.parse().ok()?;
            Some(EventSpec { start, end })
        }
        None => Some(EventSpec { start, end: start }),
    }
}

pub struct DumpCommand {
    options: DumpOptions,
}

impl DumpCommand {
    pub fn new(options: DumpOptions) -> DumpCommand {
        DumpCommand { options }
    }

    fn dump_frames(&self, reader: &mut TraceReader, specs: &[EventSpec]) -> std::io::Result<()> {
        let out = std::io::stdout();
        let mut out = out.lock();
        while !reader.at_end() {
            let frame = reader.read_frame();
            let wanted =
                specs.is_empty() || specs.iter().any(|s| s.start <= frame.time() && frame.time() <= s.end);
            if !wanted {
                continue;
            }
            if self.options.raw {
                frame.dump_raw(Some(&mut out))?;
            } else {
                frame.dump(Some(&mut out))?;
            }
        }
        Ok(())
    }
}

impl RetraceCommand for DumpCommand {
    fn run(&mut self) -> ExitResult<()> {
        let mut specs: Vec<EventSpec> = Vec::new();
        for s in &self.options.event_specs {
            match parse_event_spec(s) {
                Some(spec) => specs.push(spec),
                None => {
                    return ExitResult::usage_error(format!("Bad event spec `{}'", s));
                }
            }
        }

        let mut reader =
            TraceReader::new(self.options.trace_dir.as_ref().map(|d| d.as_os_str() as &OsStr));

        if self.dump_frames(&mut reader, &specs).is_err() {
            return ExitResult::fatal("I/O error while dumping trace");
        }

        if self.options.statistics {
            let frames = reader.time();
            println!("// frames: {}", frames);
            println!("// uncompressed bytes: {}", reader.uncompressed_bytes());
            println!("// compressed bytes: {}", reader.compressed_bytes());
        }
        ExitResult::Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn event_specs_parse() {
        let single = parse_event_spec("17").unwrap();
        assert_eq!((17, 17), (single.start, single.end));

        let range = parse_event_spec("5-10").unwrap();
        assert_eq!((5, 10), (range.start, range.end));

        assert!(parse_event_spec("x").is_none());
        assert!(parse_event_spec("5-x").is_none());
    }
}
