use nix::{
    fcntl::{open, OFlag},
    sys::stat::Mode,
    unistd::close,
};
use std::{cell::RefCell, ffi::OsStr, os::unix::io::RawFd, rc::Rc};

pub type ScopedFdSharedPtr = Rc<RefCell<ScopedFd>>;

/// An owned file descriptor, closed on drop.
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn new() -> Self {
        ScopedFd { fd: -1 }
    }

    pub fn from_raw(fd: RawFd) -> Self {
        ScopedFd { fd }
    }

    pub fn open_path(path: &OsStr, oflag: OFlag) -> Self {
        let fd = match open(path, oflag, Mode::empty()) {
            Ok(fd) => fd,
            Err(_) => -1,
        };
        ScopedFd { fd }
    }

    pub fn open_path_with_mode(path: &OsStr, oflag: OFlag, mode: Mode) -> Self {
        let fd = match open(path, oflag, mode) {
            Ok(fd) => fd,
            Err(_) => -1,
        };
        ScopedFd { fd }
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // A close failure means the fd was already gone; nothing to do.
            close(self.fd).unwrap_or(());
        }

        self.fd = -1;
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    /// Relinquish ownership without closing.
    pub fn extract(&mut self) -> RawFd {
        let result = self.fd;
        self.fd = -1;
        result
    }
}

impl Default for ScopedFd {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}
