//! The emulated filesystem: content-addressed private copies of files that
//! back shared mappings during replay.
//!
//! Shared mappings can't be backed by the original files at replay: the
//! tracees' writes to them were recorded and must be replayed into a private
//! copy, and a checkpoint clone must get its own copy so its mutations are
//! isolated from the origin session.

use crate::{
    log::LogLevel::LogDebug,
    scoped_fd::ScopedFd,
    session::address_space::kernel_mapping::KernelMapping,
    util::{copy_file, resize_shmem_segment, tmp_dir},
};
use libc::{dev_t, ino_t};
use nix::{fcntl::OFlag, sys::stat::Mode, unistd::unlink};
use std::{
    cell::RefCell,
    collections::HashMap,
    ffi::{OsStr, OsString},
    os::unix::ffi::OsStringExt,
    rc::Rc,
};

pub type EmuFsSharedPtr = Rc<RefCell<EmuFs>>;
pub type EmuFileSharedPtr = Rc<RefCell<EmuFile>>;

type FileMap = HashMap<(dev_t, ino_t), EmuFileSharedPtr>;

/// A file within an EmuFs. The file is real, but since it's "virtual" from
/// the tracees' perspective, it doesn't have the same name as the file it
/// emulates.
pub struct EmuFile {
    orig_path: OsString,
    tmp_path: OsString,
    file: ScopedFd,
    size_: u64,
    device_: dev_t,
    inode_: ino_t,
}

impl EmuFile {
    fn create(orig_path: &OsStr, orig_device: dev_t, orig_inode: ino_t, orig_file_size: u64) -> EmuFileSharedPtr {
        let mut path_vec = tmp_dir().into_vec();
        path_vec.extend_from_slice(
            format!(
                "/retrace-emufs-{}-dev-{}-inode-{}",
                std::process::id(),
                orig_device,
                orig_inode
            )
            .as_bytes(),
        );
        let tmp_path = OsString::from_vec(path_vec);

        let fd = ScopedFd::open_path_with_mode(
            &tmp_path,
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_CLOEXEC,
            Mode::S_IRUSR | Mode::S_IWUSR,
        );
        if !fd.is_open() {
            fatal!("Can't create emulated file {:?}", tmp_path);
        }
        // Unlink now so the file disappears with the last fd; the fd keeps
        // the contents alive.
        unlink(tmp_path.as_os_str()).unwrap_or(());
        resize_shmem_segment(&fd, orig_file_size as usize);

        log!(
            LogDebug,
            "created emulated file for {:?} as {:?}",
            orig_path,
            tmp_path
        );

        Rc::new(RefCell::new(EmuFile {
            orig_path: orig_path.to_owned(),
            tmp_path,
            file: fd,
            size_: orig_file_size,
            device_: orig_device,
            inode_: orig_inode,
        }))
    }

    /// A copy of this file with identical contents, for a cloned EmuFs.
    fn clone_file(&self) -> EmuFileSharedPtr {
        let new_file = EmuFile::create(&self.orig_path, self.device_, self.inode_, self.size_);
        if !copy_file(new_file.borrow().fd().as_raw(), self.file.as_raw()) {
            fatal!("Can't copy emulated file {:?}", self.tmp_path);
        }
        new_file
    }

    pub fn fd(&self) -> &ScopedFd {
        &self.file
    }

    pub fn emu_path(&self) -> OsString {
        self.tmp_path.clone()
    }

    pub fn real_path(&self) -> OsString {
        self.orig_path.clone()
    }

    pub fn device(&self) -> dev_t {
        self.device_
    }

    pub fn inode(&self) -> ino_t {
        self.inode_
    }

    pub fn size(&self) -> u64 {
        self.size_
    }

    /// Ensure the emulated file can back a mapping ending at
    /// `offset + size`.
    pub fn ensure_size(&mut self, size: u64) {
        if self.size_ < size {
            resize_shmem_segment(&self.file, size as usize);
            self.size_ = size;
        }
    }
}

/// The set of emulated files, keyed by the recorded (device, inode) of the
/// file they stand in for.
pub struct EmuFs {
    files: FileMap,
}

impl EmuFs {
    pub fn create() -> EmuFsSharedPtr {
        Rc::new(RefCell::new(EmuFs {
            files: FileMap::new(),
        }))
    }

    /// Collect the emulated file backing the recorded mapping `recorded_km`,
    /// creating it if it doesn't exist yet.
    pub fn get_or_create(&mut self, recorded_km: &KernelMapping) -> EmuFileSharedPtr {
        let key = (recorded_km.device(), recorded_km.inode());
        let min_file_size = recorded_km.file_offset_bytes() + recorded_km.size() as u64;
        if let Some(file) = self.files.get(&key) {
            file.borrow_mut().ensure_size(min_file_size);
            return file.clone();
        }

        let file = EmuFile::create(
            recorded_km.fsname(),
            recorded_km.device(),
            recorded_km.inode(),
            min_file_size,
        );
        self.files.insert(key, file.clone());
        file
    }

    pub fn find(&self, device: dev_t, inode: ino_t) -> Option<EmuFileSharedPtr> {
        self.files.get(&(device, inode)).cloned()
    }

    /// A full copy of this EmuFs for a checkpoint: every file is duplicated,
    /// so mutations in the clone never reach the origin.
    pub fn clone_fs(&self) -> EmuFsSharedPtr {
        let new_fs = EmuFs::create();
        {
            let mut new_fs_mut = new_fs.borrow_mut();
            for (key, file) in &self.files {
                let cloned = file.borrow().clone_file();
                new_fs_mut.files.insert(*key, cloned);
            }
        }
        new_fs
    }

    /// Drop files no longer referenced by any mapping.
    pub fn gc(&mut self, is_live: impl Fn(dev_t, ino_t) -> bool) {
        self.files.retain(|&(dev, ino), _| is_live(dev, ino));
    }

    pub fn size(&self) -> usize {
        self.files.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nix::sys::mman::{MapFlags, ProtFlags};
    use std::ffi::OsStr;

    fn fake_mapping(device: dev_t, inode: ino_t, pages: usize) -> KernelMapping {
        let psize = crate::util::page_size();
        KernelMapping::new_with_opts(
            0x10000usize.into(),
            (0x10000 + pages * psize).into(),
            OsStr::new("/fake/file"),
            device,
            inode,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            0,
        )
    }

    #[test]
    fn same_inode_shares_file() {
        let fs = EmuFs::create();
        let km = fake_mapping(1, 99, 2);
        let a = fs.borrow_mut().get_or_create(&km);
        let b = fs.borrow_mut().get_or_create(&km);
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(1, fs.borrow().size());
    }

    #[test]
    fn different_inodes_get_distinct_files() {
        let fs = EmuFs::create();
        let a = fs.borrow_mut().get_or_create(&fake_mapping(1, 99, 1));
        let b = fs.borrow_mut().get_or_create(&fake_mapping(1, 100, 1));
        assert!(!Rc::ptr_eq(&a, &b));
        assert_eq!(2, fs.borrow().size());
    }

    #[test]
    fn file_grows_to_cover_mapping() {
        let fs = EmuFs::create();
        let small = fs.borrow_mut().get_or_create(&fake_mapping(2, 5, 1));
        let initial = small.borrow().size();
        let larger = fs.borrow_mut().get_or_create(&fake_mapping(2, 5, 4));
        assert!(Rc::ptr_eq(&small, &larger));
        assert!(larger.borrow().size() >= initial * 4);
    }
}
