use std::ffi::CStr;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use batchfs_types::{FileType, Stat, Timespec};

use crate::platform::posix::path::PosixFilename;
use crate::platform::posix::types::{iovec, PosixDirStream, PosixHandle, PosixMapping};
use crate::platform::{AccessPattern, FileFlags, MetadataFlags, Platform};
use crate::{DirectoryEntry, Error};

mod path;
mod syscalls;
mod types;

#[cfg(test)]
mod tests;

pub use path::PosixPath;

pub struct PosixPlatform;

fn check_result(val: types::c_int, path: &Path) -> Result<types::c_int, Error> {
    if val == -1 {
        let err = std::io::Error::last_os_error().raw_os_error();
        Err(Error::from_os(err.unwrap_or(-1), path))
    } else {
        Ok(val)
    }
}

fn check_size(val: isize, path: &Path) -> Result<usize, Error> {
    if val < 0 {
        let err = std::io::Error::last_os_error().raw_os_error();
        Err(Error::from_os(err.unwrap_or(-1), path))
    } else {
        Ok(val as usize)
    }
}

/// Translate dispatcher-level open flags into `open(2)` flag bits.
fn open_flag_bits(options: FileFlags) -> types::c_int {
    let wants_write = options.intersects(
        FileFlags::WRITE
            | FileFlags::APPEND
            | FileFlags::TRUNCATE
            | FileFlags::CREATE
            | FileFlags::CREATE_ONLY_IF_NOT_EXIST,
    );

    let mut flags = if wants_write && options.contains(FileFlags::READ) {
        types::flags::O_RDWR
    } else if wants_write {
        types::flags::O_WRONLY
    } else {
        types::flags::O_RDONLY
    };

    if options.contains(FileFlags::APPEND) {
        flags |= types::flags::O_APPEND;
    }
    if options.contains(FileFlags::TRUNCATE) {
        flags |= types::flags::O_TRUNC;
    }
    if options.contains(FileFlags::CREATE) {
        flags |= types::flags::O_CREAT;
    }
    if options.contains(FileFlags::CREATE_ONLY_IF_NOT_EXIST) {
        flags |= types::flags::O_CREAT | types::flags::O_EXCL;
    }
    if options.contains(FileFlags::OS_DIRECT) {
        flags |= types::flags::O_DIRECT;
    }
    if options.contains(FileFlags::ALWAYS_SYNC) {
        flags |= types::flags::O_SYNC;
    }

    flags
}

impl Platform for PosixPlatform {
    type Path = PosixPath;
    type Filename = PosixFilename;

    type Handle = PosixHandle;
    type DirStream = PosixDirStream;
    type Mapping = PosixMapping;

    fn open_file(path: &Self::Path, options: FileFlags) -> Result<Self::Handle, Error> {
        let flags = open_flag_bits(options);

        // If we're creating a file make sure it's writeable.
        let result = if (flags & types::flags::O_CREAT) > 0 {
            unsafe {
                syscalls::open(
                    path.as_c_str().as_ptr(),
                    flags,
                    types::mode::DEFAULT_FILE_MODE,
                )
            }
        } else {
            unsafe { syscalls::open(path.as_c_str().as_ptr(), flags) }
        };
        let fd = check_result(result, c_path(path))?;

        Ok(PosixHandle::from_raw(fd))
    }

    fn open_directory(path: &Self::Path) -> Result<Self::Handle, Error> {
        let flags = types::flags::O_RDONLY | types::flags::O_DIRECTORY;
        let result = unsafe { syscalls::open(path.as_c_str().as_ptr(), flags) };
        let fd = check_result(result, c_path(path))?;

        Ok(PosixHandle::from_raw(fd))
    }

    fn open_symlink(path: &Self::Path) -> Result<Self::Handle, Error> {
        let flags = types::flags::O_PATH | types::flags::O_NOFOLLOW;
        let result = unsafe { syscalls::open(path.as_c_str().as_ptr(), flags) };
        let fd = check_result(result, c_path(path))?;

        Ok(PosixHandle::from_raw(fd))
    }

    fn close(handle: Self::Handle, path: &Path) -> Result<(), Error> {
        let result = unsafe { syscalls::close(handle.into_raw()) };
        check_result(result, path)?;
        Ok(())
    }

    fn mkdir(path: &Self::Path) -> Result<(), Error> {
        let result =
            unsafe { syscalls::mkdir(path.as_c_str().as_ptr(), types::mode::DEFAULT_DIR_MODE) };
        check_result(result, c_path(path))?;
        Ok(())
    }

    fn rmdir(path: &Self::Path) -> Result<(), Error> {
        let result = unsafe { syscalls::rmdir(path.as_c_str().as_ptr()) };
        check_result(result, c_path(path))?;
        Ok(())
    }

    fn unlink(path: &Self::Path) -> Result<(), Error> {
        let result = unsafe { syscalls::unlink(path.as_c_str().as_ptr()) };
        check_result(result, c_path(path))?;
        Ok(())
    }

    fn symlink(target: &Self::Path, link: &Self::Path) -> Result<(), Error> {
        let result =
            unsafe { syscalls::symlink(target.as_c_str().as_ptr(), link.as_c_str().as_ptr()) };
        check_result(result, c_path(link))?;
        Ok(())
    }

    fn read_link(path: &Self::Path) -> Result<PathBuf, Error> {
        let mut buf = vec![0u8; types::constants::PATH_MAX];
        let result = unsafe {
            syscalls::readlink(path.as_c_str().as_ptr(), buf.as_mut_ptr(), buf.len())
        };
        let len = check_size(result, c_path(path))?;
        buf.truncate(len);
        Ok(PathBuf::from(std::ffi::OsString::from_vec(buf)))
    }

    fn canonicalize(path: &Self::Path) -> Result<PathBuf, Error> {
        let resolved =
            unsafe { syscalls::realpath(path.as_c_str().as_ptr(), std::ptr::null_mut()) };
        if resolved.is_null() {
            let err = std::io::Error::last_os_error().raw_os_error();
            return Err(Error::from_os(err.unwrap_or(-1), c_path(path)));
        }

        let canonical = unsafe { CStr::from_ptr(resolved) };
        let canonical = PathBuf::from(std::ffi::OsStr::from_bytes(canonical.to_bytes()));
        unsafe { syscalls::free(resolved.cast()) };

        Ok(canonical)
    }

    fn fsync(handle: Self::Handle, path: &Path) -> Result<(), Error> {
        let result = unsafe { syscalls::fsync(handle.into_raw()) };
        check_result(result, path)?;
        Ok(())
    }

    fn ftruncate(handle: Self::Handle, size: u64, path: &Path) -> Result<(), Error> {
        let size: i64 = size
            .try_into()
            .map_err(|_| Error::invalid(format!("truncate size overflows off_t: {size}")))?;
        let result = unsafe { syscalls::ftruncate(handle.into_raw(), size) };
        check_result(result, path)?;
        Ok(())
    }

    fn fstat(handle: Self::Handle, path: &Path) -> Result<(Stat, MetadataFlags), Error> {
        let mut raw_stat = types::stat::zeroed();
        let result = unsafe { syscalls::fstat(handle.into_raw(), &mut raw_stat as *mut _) };
        check_result(result, path)?;
        Ok(convert_stat(raw_stat))
    }

    fn fstatat(
        dir: Self::Handle,
        name: &Self::Filename,
        path: &Path,
    ) -> Result<(Stat, MetadataFlags), Error> {
        let mut raw_stat = types::stat::zeroed();
        let result = unsafe {
            syscalls::fstatat(
                dir.into_raw(),
                name.as_c_str().as_ptr(),
                &mut raw_stat as *mut _,
                types::flags::AT_SYMLINK_NOFOLLOW,
            )
        };
        check_result(result, path)?;
        Ok(convert_stat(raw_stat))
    }

    fn read_vectored(
        handle: Self::Handle,
        bufs: &mut [&mut [u8]],
        offset: u64,
        path: &Path,
    ) -> Result<usize, Error> {
        let iovs: Vec<iovec> = bufs
            .iter_mut()
            .map(|b| iovec {
                iov_base: b.as_mut_ptr().cast(),
                iov_len: b.len(),
            })
            .collect();
        let offset: i64 = offset
            .try_into()
            .map_err(|_| Error::invalid(format!("read offset overflows off_t: {offset}")))?;

        let iovcnt: types::c_int = iovs.len().try_into().expect("buffer count bounded by IOV_MAX");
        let result =
            unsafe { syscalls::preadv(handle.into_raw(), iovs.as_ptr(), iovcnt, offset) };
        check_size(result, path)
    }

    fn write_vectored(
        handle: Self::Handle,
        bufs: &[&[u8]],
        offset: u64,
        path: &Path,
    ) -> Result<usize, Error> {
        let iovs: Vec<iovec> = bufs
            .iter()
            .map(|b| iovec {
                iov_base: b.as_ptr() as *mut _,
                iov_len: b.len(),
            })
            .collect();
        let offset: i64 = offset
            .try_into()
            .map_err(|_| Error::invalid(format!("write offset overflows off_t: {offset}")))?;

        let iovcnt: types::c_int = iovs.len().try_into().expect("buffer count bounded by IOV_MAX");
        let result =
            unsafe { syscalls::pwritev(handle.into_raw(), iovs.as_ptr(), iovcnt, offset) };
        check_size(result, path)
    }

    fn open_dir_stream(handle: Self::Handle, path: &Path) -> Result<Self::DirStream, Error> {
        // Duplicate the file handle because `fdopendir` moves ownership of the
        // handle to the stream.
        let result = unsafe { syscalls::dup(handle.into_raw()) };
        let dup_handle = check_result(result, path)?;

        let dir_stream = unsafe { syscalls::fdopendir(dup_handle) };
        if dir_stream.is_null() {
            let err = std::io::Error::last_os_error().raw_os_error();
            unsafe { syscalls::close(dup_handle) };
            return Err(Error::from_os(err.unwrap_or(-1), path));
        }

        Ok(PosixDirStream { inner: dir_stream })
    }

    fn rewind_dir_stream(stream: &mut Self::DirStream) {
        unsafe { syscalls::rewinddir(stream.inner) };
    }

    fn next_dir_entry(stream: &mut Self::DirStream) -> Result<Option<DirectoryEntry>, Error> {
        let dirent = unsafe { syscalls::readdir64(stream.inner) };
        if dirent.is_null() {
            return Ok(None);
        }
        let entry = unsafe { convert_dirent(dirent) };
        Ok(Some(entry))
    }

    fn close_dir_stream(stream: Self::DirStream) {
        // Closes the dup'd descriptor along with the stream.
        unsafe { syscalls::closedir(stream.inner) };
    }

    fn map_readonly(
        handle: Self::Handle,
        len: usize,
        path: &Path,
    ) -> Result<Self::Mapping, Error> {
        if len == 0 {
            return Err(Error::invalid("cannot map an empty file"));
        }
        let ptr = unsafe {
            syscalls::mmap(
                std::ptr::null_mut(),
                len,
                types::flags::PROT_READ,
                types::flags::MAP_SHARED,
                handle.into_raw(),
                0,
            )
        };
        if ptr as isize == -1 {
            let err = std::io::Error::last_os_error().raw_os_error();
            return Err(Error::from_os(err.unwrap_or(-1), path));
        }
        Ok(PosixMapping { ptr, len })
    }

    fn mapping_slice(mapping: &Self::Mapping) -> &[u8] {
        unsafe { std::slice::from_raw_parts(mapping.ptr.cast(), mapping.len) }
    }

    fn unmap(mapping: Self::Mapping) {
        unsafe { syscalls::munmap(mapping.ptr, mapping.len) };
    }

    fn advise(handle: Self::Handle, pattern: AccessPattern) {
        let advice = match pattern {
            AccessPattern::Sequential => types::flags::POSIX_FADV_SEQUENTIAL,
            AccessPattern::Random => types::flags::POSIX_FADV_RANDOM,
        };
        // Purely a hint; failure changes nothing for the caller.
        unsafe { syscalls::posix_fadvise(handle.into_raw(), 0, 0, advice) };
    }

    fn page_size() -> usize {
        static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
        *PAGE_SIZE.get_or_init(|| {
            let val = unsafe { syscalls::sysconf(types::flags::_SC_PAGESIZE) };
            if val <= 0 {
                types::constants::PAGE_SIZE_FALLBACK
            } else {
                val as usize
            }
        })
    }

    fn iov_max() -> usize {
        static IOV_MAX: OnceLock<usize> = OnceLock::new();
        *IOV_MAX.get_or_init(|| {
            let val = unsafe { syscalls::sysconf(types::flags::_SC_IOV_MAX) };
            if val <= 0 {
                types::constants::IOV_MAX_FALLBACK
            } else {
                val as usize
            }
        })
    }

    fn metadata_supported() -> MetadataFlags {
        MetadataFlags::ALL & !(MetadataFlags::FLAGS | MetadataFlags::GEN | MetadataFlags::BIRTHTIM)
    }

    fn metadata_fastpath() -> MetadataFlags {
        MetadataFlags::INO | MetadataFlags::TYPE
    }
}

/// The bytes of a [`PosixPath`] viewed as a [`Path`] for error context.
fn c_path(path: &PosixPath) -> &Path {
    std::path::Path::new(std::ffi::OsStr::from_bytes(path.as_c_str().to_bytes()))
}

fn convert_stat(stat: types::stat) -> (Stat, MetadataFlags) {
    let kind = match u32::from(stat.st_mode) & types::flags::S_IFMT {
        types::flags::S_IFLNK => Some(FileType::Symlink),
        types::flags::S_IFDIR => Some(FileType::Directory),
        types::flags::S_IFREG => Some(FileType::File),
        masked_kind => {
            tracing::warn!(?masked_kind, "not a file, directory, or symlink");
            None
        }
    };

    let mut have = PosixPlatform::metadata_supported();
    if kind.is_none() {
        have &= !MetadataFlags::TYPE;
    }

    let converted = Stat {
        dev: stat.st_dev,
        ino: stat.st_ino,
        kind,
        perms: u32::from(stat.st_mode) & !types::flags::S_IFMT,
        nlink: u64::from(stat.st_nlink),
        uid: stat.st_uid,
        gid: stat.st_gid,
        rdev: stat.st_rdev,
        atim: Timespec {
            secs: stat.st_atime,
            nanos: stat.st_atime_nsec,
        },
        mtim: Timespec {
            secs: stat.st_mtime,
            nanos: stat.st_mtime_nsec,
        },
        ctim: Timespec {
            secs: stat.st_ctime,
            nanos: stat.st_ctime_nsec,
        },
        size: stat.st_size.max(0) as u64,
        allocated: stat.st_blocks.max(0) as u64 * 512,
        blocks: stat.st_blocks.max(0) as u64,
        blksize: stat.st_blksize.max(0) as u64,
        flags: 0,
        gen: 0,
        birthtim: Timespec::default(),
    };

    (converted, have)
}

/// Convert a raw `readdir64` record.
///
/// Reads only the scalar fields and the NUL-terminated name, never the full
/// `d_name` array; the record is only `d_reclen` bytes long.
unsafe fn convert_dirent(dirent: *const types::dirent) -> DirectoryEntry {
    let ino = unsafe { (*dirent).d_ino };
    let d_type = unsafe { (*dirent).d_type };
    let name = unsafe { CStr::from_ptr(std::ptr::addr_of!((*dirent).d_name).cast()) };
    let name = name.to_string_lossy().into_owned();

    let kind = match d_type {
        types::flags::DT_DIR => Some(FileType::Directory),
        types::flags::DT_LNK => Some(FileType::Symlink),
        types::flags::DT_REG => Some(FileType::File),
        _ => None,
    };

    let mut have = MetadataFlags::INO;
    if kind.is_some() {
        have |= MetadataFlags::TYPE;
    }

    let stat = Stat {
        ino,
        kind,
        ..Stat::default()
    };

    DirectoryEntry { name, stat, have }
}
