//! Abstract interface for a specific platform, e.g. `posix`, `windows`, etc.

use bitflags::bitflags;
use std::fmt::Debug;
use std::hash::Hash;
use std::path::{Path, PathBuf};

use batchfs_types::Stat;

use crate::{DirectoryEntry, Error};

bitflags! {
    /// Bitwise file and directory open flags.
    ///
    /// A [`Dispatcher`] is constructed with a force-on and a force-off mask
    /// that adjust these per-op flags before use.
    ///
    /// [`Dispatcher`]: crate::dispatcher::Dispatcher
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct FileFlags: u32 {
        /// Read access.
        const READ = 1 << 0;
        /// Write access.
        const WRITE = 1 << 1;
        /// Append only.
        const APPEND = 1 << 2;
        /// Truncate an existing file to zero length.
        const TRUNCATE = 1 << 3;
        /// Open, creating if the file doesn't exist.
        const CREATE = 1 << 4;
        /// Create and open only if the file doesn't already exist.
        const CREATE_ONLY_IF_NOT_EXIST = 1 << 5;

        /// Will be exclusively read or written sequentially.
        const WILL_BE_SEQUENTIALLY_ACCESSED = 1 << 6;
        /// Will be randomly accessed, so read-ahead is wasted effort.
        const WILL_BE_RANDOMLY_ACCESSED = 1 << 7;

        /// Keep a handle open to the containing directory of each open file.
        const FAST_DIRECTORY_ENUMERATION = 1 << 8;
        /// Return a unique directory handle rather than a shared cached one.
        const UNIQUE_DIRECTORY_HANDLE = 1 << 9;

        /// Bypass the OS file cache. All buffers, lengths, and offsets must be
        /// page aligned.
        const OS_DIRECT = 1 << 10;
        /// Attempt a read-only memory map of the full extent.
        const OS_MMAP = 1 << 11;

        /// Writes do not complete until the data is on physical storage.
        const ALWAYS_SYNC = 1 << 12;
        /// Flush unwritten data just before the handle closes; the close does
        /// not complete until the flush has.
        const SYNC_ON_CLOSE = 1 << 13;
        /// Ensure data writes reach physical storage in the same order as the
        /// op dependencies close files.
        const ENFORCE_DEPENDENCY_WRITE_ORDER = 1 << 14;
    }
}

bitflags! {
    /// Bitflags for availability of metadata in a [`Stat`].
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct MetadataFlags: u32 {
        const DEV = 1 << 0;
        const INO = 1 << 1;
        const TYPE = 1 << 2;
        const PERMS = 1 << 3;
        const NLINK = 1 << 4;
        const UID = 1 << 5;
        const GID = 1 << 6;
        const RDEV = 1 << 7;
        const ATIM = 1 << 8;
        const MTIM = 1 << 9;
        const CTIM = 1 << 10;
        const SIZE = 1 << 11;
        const ALLOCATED = 1 << 12;
        const BLOCKS = 1 << 13;
        const BLKSIZE = 1 << 14;
        const FLAGS = 1 << 15;
        const GEN = 1 << 16;
        const BIRTHTIM = 1 << 17;
        /// Every bit; ask for the maximum possible metadata.
        const ALL = u32::MAX;
    }
}

/// Access-pattern hint forwarded to the OS for an open handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessPattern {
    Sequential,
    Random,
}

/// Platform specific filesystem operations.
///
/// Handle-based operations take the handle's path purely for error context;
/// failures are reported with the path that failed attached.
pub trait Platform {
    type Path: PlatformPath;
    type Filename: PlatformFilename;

    type Handle: Debug + Copy + Clone + Eq + Hash + Send + Sync + 'static;
    type DirStream: Debug + Send;
    type Mapping: Debug + Send + Sync;

    fn open_file(path: &Self::Path, flags: FileFlags) -> Result<Self::Handle, Error>;
    fn open_directory(path: &Self::Path) -> Result<Self::Handle, Error>;
    /// Open a handle to a symlink itself, without following it.
    fn open_symlink(path: &Self::Path) -> Result<Self::Handle, Error>;
    fn close(handle: Self::Handle, path: &Path) -> Result<(), Error>;

    fn mkdir(path: &Self::Path) -> Result<(), Error>;
    fn rmdir(path: &Self::Path) -> Result<(), Error>;
    fn unlink(path: &Self::Path) -> Result<(), Error>;
    fn symlink(target: &Self::Path, link: &Self::Path) -> Result<(), Error>;
    fn read_link(path: &Self::Path) -> Result<PathBuf, Error>;

    /// Resolve a path to canonical absolute form. The path must exist.
    fn canonicalize(path: &Self::Path) -> Result<PathBuf, Error>;

    fn fsync(handle: Self::Handle, path: &Path) -> Result<(), Error>;
    fn ftruncate(handle: Self::Handle, size: u64, path: &Path) -> Result<(), Error>;

    fn fstat(handle: Self::Handle, path: &Path) -> Result<(Stat, MetadataFlags), Error>;
    fn fstatat(
        dir: Self::Handle,
        name: &Self::Filename,
        path: &Path,
    ) -> Result<(Stat, MetadataFlags), Error>;

    /// Scatter-read into up to [`Platform::iov_max`] buffers with one syscall.
    /// Returns the number of bytes read, which may cover only a prefix of the
    /// buffers; zero means end of file.
    fn read_vectored(
        handle: Self::Handle,
        bufs: &mut [&mut [u8]],
        offset: u64,
        path: &Path,
    ) -> Result<usize, Error>;
    /// Gather-write mirror of [`Platform::read_vectored`].
    fn write_vectored(
        handle: Self::Handle,
        bufs: &[&[u8]],
        offset: u64,
        path: &Path,
    ) -> Result<usize, Error>;

    fn open_dir_stream(handle: Self::Handle, path: &Path) -> Result<Self::DirStream, Error>;
    fn rewind_dir_stream(stream: &mut Self::DirStream);
    /// The next raw entry in the stream, or `None` at the end.
    fn next_dir_entry(stream: &mut Self::DirStream) -> Result<Option<DirectoryEntry>, Error>;
    fn close_dir_stream(stream: Self::DirStream);

    /// Map the first `len` bytes of the handle read-only.
    fn map_readonly(handle: Self::Handle, len: usize, path: &Path)
        -> Result<Self::Mapping, Error>;
    fn mapping_slice(mapping: &Self::Mapping) -> &[u8];
    fn unmap(mapping: Self::Mapping);

    fn advise(handle: Self::Handle, pattern: AccessPattern);

    fn page_size() -> usize;
    /// Maximum number of buffers a single vectored I/O call accepts.
    fn iov_max() -> usize;

    fn metadata_supported() -> MetadataFlags;
    fn metadata_fastpath() -> MetadataFlags;
}

pub trait PlatformPath: Debug + Clone + Send + Sync {
    fn try_new(val: &Path) -> Result<Self, Error>;
}

pub trait PlatformFilename: Debug + Clone + Send + Sync {
    fn try_new(val: &str) -> Result<Self, Error>;
}

/// Type alias for the [`Platform::Handle`] associated type for the current [`FilesystemPlatform`].
pub type PlatformHandleType = <FilesystemPlatform as Platform>::Handle;
/// Type alias for the [`Platform::Path`] associated type for the current [`FilesystemPlatform`].
pub type PlatformPathType = <FilesystemPlatform as Platform>::Path;
/// Type alias for the [`Platform::Filename`] associated type for the current [`FilesystemPlatform`].
pub type PlatformFilenameType = <FilesystemPlatform as Platform>::Filename;
/// Type alias for the [`Platform::DirStream`] associated type for the current [`FilesystemPlatform`].
pub type PlatformDirStreamType = <FilesystemPlatform as Platform>::DirStream;
/// Type alias for the [`Platform::Mapping`] associated type for the current [`FilesystemPlatform`].
pub type PlatformMappingType = <FilesystemPlatform as Platform>::Mapping;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod posix;
        pub use posix::PosixPlatform as FilesystemPlatform;
    } else {
        mod todo;
        pub use todo::TodoPlatform as FilesystemPlatform;
    }
}
