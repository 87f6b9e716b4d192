use crate::{
    bindings::signal::{SI_KERNEL, TRAP_BRKPT},
    scoped_fd::ScopedFd,
    session::address_space::kernel_mapping::KernelMapping,
};
use libc::{c_void, pread64, pwrite64, CLOCK_MONOTONIC};
use nix::{
    sys::{mman::ProtFlags, stat::Mode},
    unistd::{access, ftruncate, isatty, sysconf, AccessFlags, SysconfVar},
};
use std::{
    cmp::min,
    convert::TryInto,
    env,
    ffi::{OsStr, OsString},
    fs,
    mem::size_of,
    os::unix::ffi::OsStrExt,
    path::Path,
    slice,
};

lazy_static! {
    static ref SYSTEM_PAGE_SIZE: usize = page_size_init();
}

pub fn running_under_retrace() -> bool {
    env::var_os("RUNNING_UNDER_RETRACE").is_some()
}

fn page_size_init() -> usize {
    sysconf(SysconfVar::PAGE_SIZE)
        .unwrap()
        .unwrap()
        .try_into()
        .unwrap()
}

pub fn page_size() -> usize {
    *SYSTEM_PAGE_SIZE
}

pub fn ceil_page_size(size: usize) -> usize {
    (size + page_size() - 1) & !(page_size() - 1)
}

pub fn floor_page_size(size: usize) -> usize {
    size & !(page_size() - 1)
}

pub fn monotonic_now_sec() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let ret = unsafe { libc::clock_gettime(CLOCK_MONOTONIC, &mut ts) };
    debug_assert_eq!(ret, 0);
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9
}

pub fn is_kernel_trap(si_code: i32) -> bool {
    // XXX unable to find docs on which of these "should" be
    // right.  The SI_KERNEL code is seen in the int3 case, so we
    // at least need to handle that.
    si_code == TRAP_BRKPT || si_code == SI_KERNEL
}

/// Returns $RETRACE_TMPDIR or $TMPDIR or "/tmp", making sure the directory
/// exists and is writeable.
pub fn tmp_dir() -> OsString {
    if let Some(dir) = env::var_os("RETRACE_TMPDIR") {
        ensure_dir(&dir, "temporary file directory (RETRACE_TMPDIR)", Mode::S_IRWXU);
        return dir;
    }

    if let Some(dir) = env::var_os("TMPDIR") {
        ensure_dir(&dir, "temporary file directory (TMPDIR)", Mode::S_IRWXU);
        return dir;
    }

    // Don't try to create "/tmp", that probably won't work well.
    if access("/tmp", AccessFlags::W_OK).is_err() {
        fatal!("Can't write to temporary file directory /tmp.");
    }

    OsString::from("/tmp")
}

/// Create directory `dir`, creating parent directories as needed.
/// `dir_type` is printed in error messages. Fails fatally if the resulting
/// directory is not writeable.
pub fn ensure_dir(dir: &OsStr, dir_type: &str, _mode: Mode) {
    let path = Path::new(dir);
    if let Err(e) = fs::create_dir_all(path) {
        fatal!("Can't create {} `{:?}': {}", dir_type, dir, e);
    }

    if access(path, AccessFlags::W_OK).is_err() {
        fatal!("Can't write to {} `{:?}'.", dir_type, dir);
    }
}

pub fn resize_shmem_segment(fd: &ScopedFd, num_bytes: usize) {
    if ftruncate(fd.as_raw(), num_bytes as libc::off_t).is_err() {
        fatal!("Failed to resize shmem to {}", num_bytes);
    }
}

/// Location of `needle` within `haystack`, or None.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    let mut offset = 0;
    while let Some(pos) = memchr::memchr(needle[0], &haystack[offset..]) {
        let start = offset + pos;
        if haystack.len() - start >= needle.len()
            && &haystack[start..start + needle.len()] == needle
        {
            return Some(start);
        }
        offset = start + 1;
    }
    None
}

/// Write all of `buf` to `fd`, looping on short writes. Aborts on error.
pub fn write_all(fd: i32, mut buf: &[u8]) {
    while !buf.is_empty() {
        let ret = unsafe { libc::write(fd, buf.as_ptr().cast::<c_void>(), buf.len()) };
        if ret <= 0 {
            fatal!("Can't write {} bytes", buf.len());
        }
        buf = &buf[ret as usize..];
    }
}

/// Like pwrite64(2) but tries to write all bytes by looping on short writes.
pub fn pwrite_all_fallible(fd: i32, buf_initial: &[u8], offset: isize) -> Result<usize, ()> {
    let mut written: usize = 0;
    let mut buf = buf_initial;

    while !buf.is_empty() {
        let ret = unsafe {
            pwrite64(
                fd,
                buf.as_ptr().cast::<c_void>(),
                buf.len(),
                offset as i64 + written as i64,
            )
        };

        if ret <= 0 {
            if written > 0 {
                return Ok(written);
            }
            return Err(());
        }
        buf = &buf[ret as usize..];
        written += ret as usize;
    }

    Ok(written)
}

/// Like pread64(2) but tries to read all bytes by looping on short reads.
pub fn pread_all_fallible(fd: i32, buf: &mut [u8], offset: isize) -> Result<usize, ()> {
    let mut nread: usize = 0;

    while nread < buf.len() {
        let ret = unsafe {
            pread64(
                fd,
                buf[nread..].as_mut_ptr().cast::<c_void>(),
                buf.len() - nread,
                offset as i64 + nread as i64,
            )
        };

        if ret == 0 {
            return Ok(nread);
        }
        if ret < 0 {
            if nread > 0 {
                return Ok(nread);
            }
            return Err(());
        }
        nread += ret as usize;
    }

    Ok(nread)
}

/// View `v` as its raw bytes.
///
/// # Safety
/// `T` must be plain data with no padding-sensitive invariants.
pub unsafe fn to_u8_slice<T: Copy>(v: &T) -> &[u8] {
    slice::from_raw_parts(v as *const T as *const u8, size_of::<T>())
}

/// View `v`'s raw bytes mutably.
///
/// # Safety
/// `T` must be plain data; any bit pattern must be valid for `T`.
pub unsafe fn to_u8_slice_mut<T: Copy>(v: &mut T) -> &mut [u8] {
    slice::from_raw_parts_mut(v as *mut T as *mut u8, size_of::<T>())
}

pub fn probably_not_interactive(fd: i32) -> bool {
    // Eminently tunable heuristic, but this is guaranteed to be
    // true during tests, because tests redirect all output.
    !isatty(fd).unwrap_or(false)
}

/// Whether the data the mapping refers to should be copied into the trace
/// wholesale, rather than mapped from the (possibly mutable) backing file at
/// replay.
pub fn should_copy_mmap_region(km: &KernelMapping, stat: &libc::stat) -> bool {
    let v_flags = km.flags();
    let prot = km.prot();
    let private_mapping = v_flags.contains(nix::sys::mman::MapFlags::MAP_PRIVATE);

    if private_mapping && !prot.contains(ProtFlags::PROT_WRITE) {
        // A private, read-only mapping of a file: the file can change
        // underneath us only through rename tricks, and in that case the
        // metadata drift check at replay will catch it. Don't copy.
        let in_system_dir = km.fsname().as_bytes().starts_with(b"/usr/")
            || km.fsname().as_bytes().starts_with(b"/lib");
        if in_system_dir {
            return false;
        }
    }

    if km.is_vdso() || km.is_vsyscall() || km.is_vvar() {
        // The kernel maps these itself; copying is pointless.
        return false;
    }

    // Writeable or shared file mappings can change between now and replay.
    let can_write_file = (stat.st_mode & 0o222) != 0;
    if !can_write_file && !prot.contains(ProtFlags::PROT_WRITE) {
        return false;
    }

    true
}

/// Copy the contents of `src_fd` into `dest_fd`.
pub fn copy_file(dest_fd: i32, src_fd: i32) -> bool {
    let mut buf = [0u8; 32 * 1024];
    let mut offset: isize = 0;

    loop {
        let nread = match pread_all_fallible(src_fd, &mut buf, offset) {
            Ok(0) => return true,
            Ok(n) => n,
            Err(()) => return false,
        };
        if pwrite_all_fallible(dest_fd, &buf[..nread], offset).is_err() {
            return false;
        }
        offset += nread as isize;
    }
}

/// Read the cpu this process is currently bound to, if any.
pub fn choose_cpu(bind_requested: Option<u32>) -> Option<u32> {
    match bind_requested {
        Some(cpu) => Some(cpu),
        None => {
            // Pin tracees to a random logical CPU so the recorded ticks are
            // coherent across migrations.
            let ncpu = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
            if ncpu <= 0 {
                return None;
            }
            Some((rand::random::<u32>()) % (ncpu as u32))
        }
    }
}

/// Number of bytes the two slices share as a prefix.
pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    let n = min(a.len(), b.len());
    for i in 0..n {
        if a[i] != b[i] {
            return i;
        }
    }
    n
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_rounding() {
        let p = page_size();
        assert_eq!(0, ceil_page_size(0));
        assert_eq!(p, ceil_page_size(1));
        assert_eq!(p, ceil_page_size(p));
        assert_eq!(0, floor_page_size(p - 1));
        assert_eq!(p, floor_page_size(p + 1));
    }

    #[test]
    fn find_bytes() {
        assert_eq!(Some(0), find(b"hello", b"he"));
        assert_eq!(Some(3), find(b"hello", b"lo"));
        assert_eq!(None, find(b"hello", b"lol"));
        assert_eq!(Some(0), find(b"hello", b""));
    }

    #[test]
    fn prefixes() {
        assert_eq!(3, common_prefix_len(b"abcd", b"abce"));
        assert_eq!(2, common_prefix_len(b"ab", b"abcd"));
        assert_eq!(0, common_prefix_len(b"x", b"y"));
    }
}
