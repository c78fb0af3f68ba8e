#![allow(non_camel_case_types)]
// Layout structs carry padding fields the code never reads.
#![allow(dead_code)]

//! Types used by the POSIX (Linux) platform.

pub(crate) type c_char = std::ffi::c_char;
pub(crate) type c_int = i32;
pub(crate) type c_uint = u32;
pub(crate) type c_long = i64;
pub(crate) type c_void = std::ffi::c_void;

/// A raw file descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PosixHandle {
    inner: file_descriptor,
}
pub(crate) type file_descriptor = c_int;

impl PosixHandle {
    pub fn from_raw(val: file_descriptor) -> Self {
        PosixHandle { inner: val }
    }

    pub fn into_raw(self) -> file_descriptor {
        self.inner
    }
}

/// An open `DIR*` stream, together with the descriptor it was opened from.
///
/// The raw pointer is only ever touched while the owning handle's state lock
/// is held, which is what makes shipping it between worker threads sound.
#[derive(Debug)]
pub struct PosixDirStream {
    pub(crate) inner: dir_stream,
}
pub(crate) type dir_stream = *mut c_void;

unsafe impl Send for PosixDirStream {}

/// A read-only memory mapping of a file's full extent.
///
/// Unmapped by the owning handle when it closes; the region is never written
/// through, which is what makes sharing it across worker threads sound.
#[derive(Debug)]
pub struct PosixMapping {
    pub(crate) ptr: *mut c_void,
    pub(crate) len: usize,
}

unsafe impl Send for PosixMapping {}
unsafe impl Sync for PosixMapping {}

/// An `iovec` as consumed by `preadv` / `pwritev`.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct iovec {
    pub iov_base: *mut c_void,
    pub iov_len: usize,
}

pub(crate) mod flags {
    use super::*;

    /// Open for reading only.
    pub const O_RDONLY: c_int = 0x0000;
    /// Open for writing only.
    pub const O_WRONLY: c_int = 0x0001;
    /// Open for reading and writing.
    pub const O_RDWR: c_int = 0x0002;

    /// Create the file if it doesn't exist.
    pub const O_CREAT: c_int = 0x0040;
    /// Error if `O_CREAT` is given and the file already exists.
    pub const O_EXCL: c_int = 0x0080;
    /// Truncate the file to 0 length.
    pub const O_TRUNC: c_int = 0x0200;
    /// All writes go to the end of the file.
    pub const O_APPEND: c_int = 0x0400;

    /// Writes complete only once the data is on stable storage.
    pub const O_SYNC: c_int = 0x101000;
    /// Open a handle to the path itself, without opening the object.
    pub const O_PATH: c_int = 0x200000;

    cfg_if::cfg_if! {
        if #[cfg(target_arch = "aarch64")] {
            /// Restrict opening to just directories.
            pub const O_DIRECTORY: c_int = 0x4000;
            /// Fail if the trailing component is a symlink.
            pub const O_NOFOLLOW: c_int = 0x8000;
            /// Bypass the page cache; buffers must be aligned.
            pub const O_DIRECT: c_int = 0x10000;
        } else {
            /// Restrict opening to just directories.
            pub const O_DIRECTORY: c_int = 0x10000;
            /// Fail if the trailing component is a symlink.
            pub const O_NOFOLLOW: c_int = 0x20000;
            /// Bypass the page cache; buffers must be aligned.
            pub const O_DIRECT: c_int = 0x4000;
        }
    }

    /// Act on the symlink itself, do not follow it.
    pub const AT_SYMLINK_NOFOLLOW: c_int = 0x0100;

    /// Mask for `st_mode` that contains filetype information.
    pub const S_IFMT: u32 = 0xF000;
    /// Directory.
    pub const S_IFDIR: u32 = 0x4000;
    /// Regular file.
    pub const S_IFREG: u32 = 0x8000;
    /// Symbolic link.
    pub const S_IFLNK: u32 = 0xA000;

    /// Directory, from `readdir`.
    pub const DT_DIR: u8 = 4;
    /// Regular file, from `readdir`.
    pub const DT_REG: u8 = 8;
    /// Symbolic link, from `readdir`.
    pub const DT_LNK: u8 = 10;

    /// Expect sequential page references; read ahead aggressively.
    pub const POSIX_FADV_SEQUENTIAL: c_int = 2;
    /// Expect random page references; read ahead is wasted.
    pub const POSIX_FADV_RANDOM: c_int = 1;

    /// Pages may be read.
    pub const PROT_READ: c_int = 0x1;
    /// Share the mapping with every other mapper of the file.
    pub const MAP_SHARED: c_int = 0x01;

    /// `sysconf` parameter for the page size.
    pub const _SC_PAGESIZE: c_int = 30;
    /// `sysconf` parameter for the vectored-I/O buffer-count limit.
    pub const _SC_IOV_MAX: c_int = 60;
}

pub(crate) mod mode {
    /// Default mode for newly created files.
    pub const DEFAULT_FILE_MODE: u32 = 0o644;
    /// Default mode for newly created directories.
    pub const DEFAULT_DIR_MODE: u32 = 0o755;
}

pub(crate) mod constants {
    /// Fallback when `sysconf(_SC_IOV_MAX)` has no answer; the POSIX minimum.
    pub const IOV_MAX_FALLBACK: usize = 1024;
    /// Fallback when `sysconf(_SC_PAGESIZE)` has no answer.
    pub const PAGE_SIZE_FALLBACK: usize = 4096;
    /// Upper bound on symlink target length we will read.
    pub const PATH_MAX: usize = 4096;
}

/// Data returned by calls to the `stat` family of functions.
///
/// Field order differs between 64-bit Linux architectures, hence the two
/// layouts.
#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct stat {
    pub st_dev: u64,
    pub st_ino: u64,
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_rdev: u64,
    pub __pad1: u64,
    pub st_size: i64,
    pub st_blksize: i32,
    pub __pad2: i32,
    pub st_blocks: i64,
    pub st_atime: i64,
    pub st_atime_nsec: i64,
    pub st_mtime: i64,
    pub st_mtime_nsec: i64,
    pub st_ctime: i64,
    pub st_ctime_nsec: i64,
    pub __unused: [u32; 2],
}

#[cfg(not(target_arch = "aarch64"))]
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct stat {
    pub st_dev: u64,
    pub st_ino: u64,
    pub st_nlink: u64,
    pub st_mode: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub __pad0: i32,
    pub st_rdev: u64,
    pub st_size: i64,
    pub st_blksize: i64,
    pub st_blocks: i64,
    pub st_atime: i64,
    pub st_atime_nsec: i64,
    pub st_mtime: i64,
    pub st_mtime_nsec: i64,
    pub st_ctime: i64,
    pub st_ctime_nsec: i64,
    pub __unused: [i64; 3],
}

impl stat {
    /// An all-zeroes buffer for the kernel to fill in.
    pub fn zeroed() -> stat {
        // Plain-old-data with no invalid bit patterns.
        unsafe { std::mem::zeroed() }
    }
}

/// Directory entry returned from the `readdir64` family of functions.
///
/// `d_name` is NUL terminated; Linux has no `d_namlen`.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct dirent {
    pub d_ino: u64,
    pub d_off: i64,
    pub d_reclen: u16,
    pub d_type: u8,
    pub d_name: [u8; 256],
}
