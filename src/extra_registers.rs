//! The "extra" register file: the floating-point/vector save area recorded
//! beside the general-purpose registers when an event restores or clobbers
//! FP state (sigreturn, execve, signal-handler entry).

use crate::kernel_abi::SupportedArch;

/// One-byte format tag written before the save area in a trace frame.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum Format {
    None = 0,
    /// The XSAVE area layout of the recording CPU, beginning with the
    /// 512-byte legacy FXSAVE region.
    XSave = 1,
}

impl Default for Format {
    fn default() -> Self {
        Format::None
    }
}

#[derive(Clone)]
pub struct ExtraRegisters {
    format_: Format,
    arch_: SupportedArch,
    data: Vec<u8>,
}

impl ExtraRegisters {
    pub fn new(arch: SupportedArch) -> ExtraRegisters {
        ExtraRegisters {
            format_: Format::None,
            arch_: arch,
            data: Vec::new(),
        }
    }

    pub fn format(&self) -> Format {
        self.format_
    }

    pub fn arch(&self) -> SupportedArch {
        self.arch_
    }

    pub fn set_arch(&mut self, arch: SupportedArch) {
        self.arch_ = arch;
    }

    pub fn data_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Adopt raw bytes read from a trace or from PTRACE_GETREGSET.
    pub fn set_to_raw_data(&mut self, arch: SupportedArch, format: Format, data: Vec<u8>) {
        self.arch_ = arch;
        self.format_ = format;
        self.data = data;
    }

    /// Like `Registers::matches`, but there are no volatile bits here: the
    /// save area must be byte-identical.
    pub fn matches(&self, other: &ExtraRegisters) -> bool {
        self.format_ == other.format_ && self.data == other.data
    }

    pub fn write_register_file_compact(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        match self.format_ {
            Format::None => write!(out, "extra_regs:none"),
            Format::XSave => write!(out, "extra_regs:xsave[{}]", self.data.len()),
        }
    }
}

impl Default for ExtraRegisters {
    fn default() -> Self {
        ExtraRegisters::new(SupportedArch::default())
    }
}

impl std::fmt::Debug for ExtraRegisters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExtraRegisters<{:?}, {} bytes>", self.format_, self.data.len())
    }
}

pub fn format_from_tag(tag: u8) -> Format {
    match tag {
        0 => Format::None,
        1 => Format::XSave,
        _ => Format::None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn raw_data_round_trip() {
        let mut er = ExtraRegisters::default();
        assert!(er.is_empty());
        er.set_to_raw_data(SupportedArch::X64, Format::XSave, vec![1, 2, 3, 4]);
        assert_eq!(Format::XSave, er.format());
        assert_eq!(4, er.data_size());
        assert_eq!(&[1, 2, 3, 4], er.data_bytes());
    }

    #[test]
    fn match_requires_identical_bytes() {
        let mut a = ExtraRegisters::default();
        let mut b = ExtraRegisters::default();
        a.set_to_raw_data(SupportedArch::X64, Format::XSave, vec![1, 2]);
        b.set_to_raw_data(SupportedArch::X64, Format::XSave, vec![1, 3]);
        assert!(!a.matches(&b));
        b.set_to_raw_data(SupportedArch::X64, Format::XSave, vec![1, 2]);
        assert!(a.matches(&b));
    }

    #[test]
    fn format_tags() {
        assert_eq!(Format::None, format_from_tag(0));
        assert_eq!(Format::XSave, format_from_tag(1));
    }
}
