use crate::{
    scoped_fd::ScopedFd,
    trace::compressed_writer::BlockHeader,
    util::{pread_all_fallible, to_u8_slice_mut},
};
use brotli_sys::{BrotliDecoderDecompress, BROTLI_DECODER_RESULT_SUCCESS};
use nix::fcntl::OFlag;
use std::{
    cmp::min,
    ffi::OsStr,
    io::{Error, ErrorKind, Read, Result},
    mem::size_of,
    rc::Rc,
};

/// CompressedReader opens an input file written by CompressedWriter
/// and reads data from it. Data is decompressed, one block at a time, by the
/// thread that calls `read`.
pub struct CompressedReader {
    /// Our fd might be the dup of another reader's fd (checkpoint clones),
    /// so we can't rely on its file position. The current position is
    /// tracked in `fd_offset` and all reads use pread.
    fd_offset: u64,
    fd: Rc<ScopedFd>,
    error: bool,
    eof: bool,
    buffer: Vec<u8>,
    buffer_read_pos: usize,

    have_saved_state: bool,
    saved_fd_offset: u64,
    saved_buffer: Vec<u8>,
    saved_buffer_read_pos: usize,
}

impl CompressedReader {
    pub fn new(filename: &OsStr) -> CompressedReader {
        let fd = ScopedFd::open_path(filename, OFlag::O_CLOEXEC | OFlag::O_RDONLY);
        let error = !fd.is_open();
        CompressedReader {
            fd_offset: 0,
            fd: Rc::new(fd),
            error,
            eof: false,
            buffer: Vec::new(),
            buffer_read_pos: 0,
            have_saved_state: false,
            saved_fd_offset: 0,
            saved_buffer: Vec::new(),
            saved_buffer_read_pos: 0,
        }
    }

    pub fn good(&self) -> bool {
        !self.error
    }

    pub fn at_end(&self) -> bool {
        self.eof && self.buffer_read_pos == self.buffer.len()
    }

    /// Read exactly `data.len()` bytes, refilling the block buffer as
    /// needed.
    pub fn read_exact_bytes(&mut self, data: &mut [u8]) -> Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            if self.error {
                return Err(Error::new(ErrorKind::Other, "CompressedReader error"));
            }
            if self.buffer_read_pos == self.buffer.len() && !self.refill_buffer()? {
                return Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    "CompressedReader at end of stream",
                ));
            }
            let amount = min(
                data.len() - offset,
                self.buffer.len() - self.buffer_read_pos,
            );
            data[offset..offset + amount]
                .copy_from_slice(&self.buffer[self.buffer_read_pos..self.buffer_read_pos + amount]);
            self.buffer_read_pos += amount;
            offset += amount;
        }
        Ok(())
    }

    /// Advance the read position by `size` bytes.
    pub fn skip(&mut self, size: usize) -> Result<()> {
        let mut remaining = size;
        while remaining > 0 {
            if self.buffer_read_pos == self.buffer.len() && !self.refill_buffer()? {
                return Err(Error::new(ErrorKind::UnexpectedEof, "skip past end"));
            }
            let amount = min(remaining, self.buffer.len() - self.buffer_read_pos);
            self.buffer_read_pos += amount;
            remaining -= amount;
        }
        Ok(())
    }

    pub fn rewind(&mut self) {
        debug_assert!(!self.have_saved_state);
        self.fd_offset = 0;
        self.eof = false;
        self.buffer.clear();
        self.buffer_read_pos = 0;
    }

    pub fn close(&mut self) {
        // The fd may be shared with clones; dropping our reference is all
        // that's needed.
    }

    /// Save the current position. Nested saves are not allowed.
    pub fn save_state(&mut self) {
        debug_assert!(!self.have_saved_state);
        self.have_saved_state = true;
        self.saved_fd_offset = self.fd_offset;
        self.saved_buffer = self.buffer.clone();
        self.saved_buffer_read_pos = self.buffer_read_pos;
    }

    /// Restore previously saved position.
    pub fn restore_state(&mut self) {
        debug_assert!(self.have_saved_state);
        self.have_saved_state = false;
        if self.saved_fd_offset < self.fd_offset {
            self.eof = false;
        }
        self.fd_offset = self.saved_fd_offset;
        self.buffer = std::mem::take(&mut self.saved_buffer);
        self.buffer_read_pos = self.saved_buffer_read_pos;
    }

    /// Discard a saved position.
    pub fn discard_state(&mut self) {
        debug_assert!(self.have_saved_state);
        self.have_saved_state = false;
        self.saved_buffer.clear();
    }

    /// Total uncompressed bytes in the stream, independent of what's been
    /// read.
    pub fn uncompressed_bytes(&self) -> u64 {
        let mut total: u64 = 0;
        self.for_each_block_header(|header| total += header.uncompressed_length as u64);
        total
    }

    /// Total compressed bytes in the stream.
    pub fn compressed_bytes(&self) -> u64 {
        let mut total: u64 = 0;
        self.for_each_block_header(|header| total += header.compressed_length as u64);
        total
    }

    fn for_each_block_header(&self, mut f: impl FnMut(&BlockHeader)) {
        let mut offset: u64 = 0;
        loop {
            let mut header = BlockHeader::default();
            let buf = unsafe { to_u8_slice_mut(&mut header) };
            match pread_all_fallible(self.fd.as_raw(), buf, offset as isize) {
                Ok(n) if n == size_of::<BlockHeader>() => (),
                _ => return,
            }
            f(&header);
            offset += (size_of::<BlockHeader>() + header.compressed_length as usize) as u64;
        }
    }

    /// Decompress the next block into `buffer`. Returns false at EOF.
    fn refill_buffer(&mut self) -> Result<bool> {
        let mut header = BlockHeader::default();
        let header_buf = unsafe { to_u8_slice_mut(&mut header) };
        match pread_all_fallible(self.fd.as_raw(), header_buf, self.fd_offset as isize) {
            Ok(0) => {
                self.eof = true;
                return Ok(false);
            }
            Ok(n) if n == size_of::<BlockHeader>() => (),
            _ => {
                self.error = true;
                return Err(Error::new(ErrorKind::Other, "truncated block header"));
            }
        }
        self.fd_offset += size_of::<BlockHeader>() as u64;

        let mut compressed = vec![0u8; header.compressed_length as usize];
        match pread_all_fallible(self.fd.as_raw(), &mut compressed, self.fd_offset as isize) {
            Ok(n) if n == compressed.len() => (),
            _ => {
                self.error = true;
                return Err(Error::new(ErrorKind::Other, "truncated block payload"));
            }
        }
        self.fd_offset += compressed.len() as u64;

        self.buffer
            .resize(header.uncompressed_length as usize, 0u8);
        self.buffer_read_pos = 0;
        let mut decoded_size = self.buffer.len();
        let result = unsafe {
            BrotliDecoderDecompress(
                compressed.len(),
                compressed.as_ptr(),
                &mut decoded_size,
                self.buffer.as_mut_ptr(),
            )
        };
        if result != BROTLI_DECODER_RESULT_SUCCESS || decoded_size != self.buffer.len() {
            self.error = true;
            return Err(Error::new(ErrorKind::Other, "brotli decompression failed"));
        }

        Ok(true)
    }
}

impl Read for CompressedReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.at_end() {
            return Ok(0);
        }
        self.read_exact_bytes(buf)?;
        Ok(buf.len())
    }
}

/// A clone has exactly the same state as the original, but mutating the
/// clone doesn't affect the original (and vice versa). Used to give each
/// checkpointed session an independent trace cursor over shared fds.
impl Clone for CompressedReader {
    fn clone(&self) -> Self {
        CompressedReader {
            fd_offset: self.fd_offset,
            fd: self.fd.clone(),
            error: self.error,
            eof: self.eof,
            buffer: self.buffer.clone(),
            buffer_read_pos: self.buffer_read_pos,
            have_saved_state: false,
            saved_fd_offset: 0,
            saved_buffer: Vec::new(),
            saved_buffer_read_pos: 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::trace::compressed_writer::CompressedWriter;
    use std::io::Write;

    fn temp_stream_path(name: &str) -> std::ffi::OsString {
        let mut p = std::env::temp_dir();
        p.push(format!("retrace-substream-test-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_file(&p);
        p.into_os_string()
    }

    #[test]
    fn write_read_round_trip() {
        let path = temp_stream_path("round-trip");
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let mut writer = CompressedWriter::new(&path, 64 * 1024, 2);
        writer.write_all(&payload).unwrap();
        writer.close(None);
        assert!(writer.good());

        let mut reader = CompressedReader::new(&path);
        let mut out = vec![0u8; payload.len()];
        reader.read_exact_bytes(&mut out).unwrap();
        assert_eq!(payload, out);
        assert!(reader.good());

        assert_eq!(payload.len() as u64, reader.uncompressed_bytes());
        assert!(reader.compressed_bytes() > 0);
        assert!(reader.compressed_bytes() < payload.len() as u64);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn save_restore_state() {
        let path = temp_stream_path("save-restore");
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();

        let mut writer = CompressedWriter::new(&path, 4096, 1);
        writer.write_all(&payload).unwrap();
        writer.close(None);

        let mut reader = CompressedReader::new(&path);
        let mut first = vec![0u8; 100];
        reader.save_state();
        reader.read_exact_bytes(&mut first).unwrap();
        reader.restore_state();

        let mut again = vec![0u8; 100];
        reader.read_exact_bytes(&mut again).unwrap();
        assert_eq!(first, again);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn clone_is_independent() {
        let path = temp_stream_path("clone");
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 13) as u8).collect();

        let mut writer = CompressedWriter::new(&path, 1024, 1);
        writer.write_all(&payload).unwrap();
        writer.close(None);

        let mut reader = CompressedReader::new(&path);
        let mut head = vec![0u8; 16];
        reader.read_exact_bytes(&mut head).unwrap();

        let mut cloned = reader.clone();
        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        reader.read_exact_bytes(&mut a).unwrap();
        cloned.read_exact_bytes(&mut b).unwrap();
        assert_eq!(a, b);

        std::fs::remove_file(&path).unwrap();
    }
}
