use crate::{scoped_fd::ScopedFd, util::write_all};
use brotli_sys::{BrotliEncoderCompress, BROTLI_MODE_GENERIC};
use nix::{fcntl::OFlag, sys::stat::Mode, unistd::fsync};
use std::{
    cmp::min,
    ffi::OsStr,
    io::{Error, ErrorKind, Result, Write},
    mem::size_of,
    slice,
    sync::{Arc, Condvar, Mutex},
    thread,
    thread::JoinHandle,
};

// Quality 5 measures as the best throughput/ratio tradeoff for trace data.
const BROTLI_LEVEL: i32 = 5;
const BROTLI_WINDOW: i32 = 22;

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum Sync {
    DontSync,
    SyncToDisk,
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum WaitFlag {
    Wait,
    NoWait,
}

/// Each block of compressed data is written to the file preceded by these
/// two words.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct BlockHeader {
    pub compressed_length: u32,
    pub uncompressed_length: u32,
}

/// CompressedWriter opens an output file and writes compressed blocks to it.
/// Blocks of a fixed but unspecified size (on the order of 1MB) are
/// compressed independently using brotli.
///
/// We use multiple threads to perform compression. The threads are
/// responsible for the actual data writes. The thread that creates the
/// CompressedWriter is the "producer" thread and must also be the caller of
/// `write`. The producer thread may block in `write` while waiting for
/// in-flight buffer contents to be compressed.
pub struct CompressedWriter {
    /// Immutable while threads are running.
    fd: ScopedFd,
    block_size: usize,
    mutex: Arc<Mutex<CompressedWriterData>>,
    cond_var: Arc<Condvar>,
    threads: Vec<JoinHandle<()>>,
    /// Stream position the producer has published to the workers.
    producer_reserved_pos: u64,
    /// Stream position of the next byte the producer will write.
    producer_reserved_write_pos: u64,
    /// Stream position the producer may write up to without waiting.
    producer_reserved_upto_pos: u64,
    error: bool,

    /// The ring buffer shared with the compressor threads. The producer
    /// writes ahead of `next_thread_end_pos`; workers read strictly behind
    /// it, so the two sides never touch the same bytes concurrently.
    buffer: Vec<u8>,
}

struct CompressedWriterData {
    /// Per-thread: position in the output stream that thread is currently
    /// compressing, None when idle.
    thread_pos: Vec<Option<u64>>,
    /// Position in the output stream of data to dispatch to the next thread.
    next_thread_pos: u64,
    /// Position in the output stream of the end of data ready to dispatch.
    next_thread_end_pos: u64,
    closing: bool,
    write_error: bool,
}

struct SharedBuf {
    ptr: *const u8,
    len: usize,
}

unsafe impl Send for SharedBuf {}

impl CompressedWriter {
    pub fn new(filename: &OsStr, block_size: usize, num_threads: usize) -> CompressedWriter {
        let fd = ScopedFd::open_path_with_mode(
            filename,
            OFlag::O_CLOEXEC | OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_LARGEFILE,
            Mode::S_IRUSR | Mode::S_IWUSR,
        );

        let error = !fd.is_open();
        let buffer = vec![0u8; block_size * (num_threads + 2)];

        let mut cw = CompressedWriter {
            fd,
            block_size,
            mutex: Arc::new(Mutex::new(CompressedWriterData {
                thread_pos: vec![None; num_threads],
                next_thread_pos: 0,
                next_thread_end_pos: 0,
                closing: false,
                write_error: false,
            })),
            cond_var: Arc::new(Condvar::new()),
            threads: Vec::new(),
            producer_reserved_pos: 0,
            producer_reserved_write_pos: 0,
            producer_reserved_upto_pos: buffer.len() as u64,
            error,
            buffer,
        };

        if error {
            return cw;
        }

        // Hold the lock so threads don't start consuming until the thread
        // vector is fully initialized.
        {
            let _mg = cw.mutex.lock().unwrap();
            for i in 0..num_threads {
                let mutex = cw.mutex.clone();
                let cond_var = cw.cond_var.clone();
                let shared = SharedBuf {
                    ptr: cw.buffer.as_ptr(),
                    len: cw.buffer.len(),
                };
                let fd_raw = cw.fd.as_raw();
                let block_size = cw.block_size;
                cw.threads.push(
                    thread::Builder::new()
                        .name(format!("compressor-{}", i))
                        .spawn(move || {
                            compression_thread(i, block_size, shared, fd_raw, mutex, cond_var)
                        })
                        .unwrap(),
                );
            }
        }

        cw
    }

    pub fn good(&self) -> bool {
        !self.error
    }

    /// Call `close()` on all the relevant trace files. Normally this will be
    /// called by the destructor. It's helpful to call this before a crash
    /// that won't call the destructor, to ensure buffered data is flushed.
    pub fn close(&mut self, maybe_sync: Option<Sync>) {
        if !self.fd.is_open() {
            return;
        }

        self.update_reservation(WaitFlag::NoWait);

        {
            let mut g = self.mutex.lock().unwrap();
            g.closing = true;
            self.cond_var.notify_all();
            drop(g);
        }

        while let Some(handle) = self.threads.pop() {
            handle.join().unwrap();
        }

        if maybe_sync == Some(Sync::SyncToDisk) && fsync(self.fd.as_raw()).is_err() {
            self.error = true;
        }

        let g = self.mutex.lock().unwrap();
        if g.write_error {
            self.error = true;
        }
        drop(g);

        self.fd.close();
    }

    fn update_reservation(&mut self, wait_flag: WaitFlag) {
        let mut g = self.mutex.lock().unwrap();

        g.next_thread_end_pos = self.producer_reserved_write_pos;
        self.producer_reserved_pos = self.producer_reserved_write_pos;
        // Wake up threads that might be waiting to consume data.
        self.cond_var.notify_all();

        while !self.error {
            if g.write_error {
                self.error = true;
                break;
            }

            let mut completed_pos = g.next_thread_pos;
            for pos in g.thread_pos.iter().flatten() {
                completed_pos = min(completed_pos, *pos);
            }

            self.producer_reserved_upto_pos = completed_pos + self.buffer.len() as u64;
            if self.producer_reserved_pos < self.producer_reserved_upto_pos
                || wait_flag == WaitFlag::NoWait
            {
                break;
            }

            g = self.cond_var.wait(g).unwrap();
        }
    }
}

impl Write for CompressedWriter {
    fn write(&mut self, data_to_write: &[u8]) -> Result<usize> {
        let mut data = data_to_write;
        while !self.error && !data.is_empty() {
            let reservation_size =
                (self.producer_reserved_upto_pos - self.producer_reserved_write_pos) as usize;
            if reservation_size == 0 {
                self.update_reservation(WaitFlag::Wait);
                continue;
            }
            let buf_offset =
                (self.producer_reserved_write_pos % self.buffer.len() as u64) as usize;
            let amount = min(
                self.buffer.len() - buf_offset,
                min(reservation_size, data.len()),
            );
            self.buffer[buf_offset..buf_offset + amount].copy_from_slice(&data[..amount]);
            self.producer_reserved_write_pos += amount as u64;
            data = &data[amount..];
        }

        if !self.error
            && self.producer_reserved_write_pos - self.producer_reserved_pos
                >= (self.buffer.len() / 2) as u64
        {
            self.update_reservation(WaitFlag::NoWait);
        }

        if self.error {
            return Err(Error::new(ErrorKind::Other, "CompressedWriter error"));
        }
        Ok(data_to_write.len())
    }

    fn flush(&mut self) -> Result<()> {
        // Data is pushed to workers eagerly; there is nothing further to do
        // short of close().
        Ok(())
    }
}

impl Drop for CompressedWriter {
    fn drop(&mut self) {
        self.close(None);
    }
}

fn compression_thread(
    thread_index: usize,
    block_size: usize,
    shared: SharedBuf,
    fd_raw: i32,
    mutex: Arc<Mutex<CompressedWriterData>>,
    cond_var: Arc<Condvar>,
) {
    let buffer = unsafe { slice::from_raw_parts(shared.ptr, shared.len) };
    // Input scratch for un-wrapping the ring, output with slop for
    // incompressible data.
    let mut inputbuf = vec![0u8; block_size];
    let mut outputbuf = vec![0u8; (block_size as f64 * 1.1) as usize + size_of::<BlockHeader>()];

    let mut g = mutex.lock().unwrap();
    loop {
        if !g.write_error
            && g.next_thread_pos < g.next_thread_end_pos
            && (g.closing || g.next_thread_pos + block_size as u64 <= g.next_thread_end_pos)
        {
            let block_start = g.next_thread_pos;
            g.thread_pos[thread_index] = Some(block_start);
            g.next_thread_pos = min(g.next_thread_end_pos, block_start + block_size as u64);
            let uncompressed_length = (g.next_thread_pos - block_start) as usize;

            drop(g);
            for i in 0..uncompressed_length {
                inputbuf[i] = buffer[((block_start + i as u64) % buffer.len() as u64) as usize];
            }
            let mut compressed_length = outputbuf.len() - size_of::<BlockHeader>();
            let ok = unsafe {
                BrotliEncoderCompress(
                    BROTLI_LEVEL,
                    BROTLI_WINDOW,
                    BROTLI_MODE_GENERIC,
                    uncompressed_length,
                    inputbuf.as_ptr(),
                    &mut compressed_length,
                    outputbuf.as_mut_ptr().add(size_of::<BlockHeader>()),
                )
            };
            g = mutex.lock().unwrap();

            if ok == 0 || compressed_length == 0 {
                g.write_error = true;
            }

            let header = BlockHeader {
                compressed_length: compressed_length as u32,
                uncompressed_length: uncompressed_length as u32,
            };
            outputbuf[..size_of::<BlockHeader>()]
                .copy_from_slice(unsafe { crate::util::to_u8_slice(&header) });

            // Wait until we're the next thread that needs to write.
            while !g.write_error {
                let other_thread_writes_first = g.thread_pos.iter().flatten().any(|&pos| {
                    pos < block_start
                });
                if !other_thread_writes_first {
                    break;
                }
                g = cond_var.wait(g).unwrap();
            }

            if !g.write_error {
                drop(g);
                write_all(
                    fd_raw,
                    &outputbuf[..size_of::<BlockHeader>() + header.compressed_length as usize],
                );
                g = mutex.lock().unwrap();
            }

            g.thread_pos[thread_index] = None;
            // Broadcast: we might need to unblock the producer thread or a
            // compressor thread waiting for us to write.
            cond_var.notify_all();
            continue;
        }

        if g.closing && (g.write_error || g.next_thread_pos == g.next_thread_end_pos) {
            break;
        }

        g = cond_var.wait(g).unwrap();
    }
}
