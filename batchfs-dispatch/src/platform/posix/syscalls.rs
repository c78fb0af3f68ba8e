//! Syscalls used for the POSIX (Linux) platform.

use super::types::{
    self, c_char, c_int, c_long, c_uint, c_void, dir_stream, dirent, file_descriptor, iovec,
};

unsafe extern "C" {
    /// Open the file at `path` with the provided flags.
    ///
    /// When creating a file we require an additional `mode` argument.
    pub unsafe fn open(path: *const c_char, flags: c_int, ...) -> c_int;
    /// Close a file handle.
    pub unsafe fn close(fildes: file_descriptor) -> c_int;

    /// Make a directory at the specified path.
    pub unsafe fn mkdir(path: *const c_char, mode: c_uint) -> c_int;
    /// Remove the (empty) directory at the specified path.
    pub unsafe fn rmdir(path: *const c_char) -> c_int;
    /// Remove the link at the specified path.
    pub unsafe fn unlink(path: *const c_char) -> c_int;

    /// Create a symbolic link at `linkpath` naming `target`.
    pub unsafe fn symlink(target: *const c_char, linkpath: *const c_char) -> c_int;
    /// Read the target of the symbolic link at `path` into `buf`.
    pub unsafe fn readlink(path: *const c_char, buf: *mut u8, bufsiz: usize) -> isize;

    /// Scatter-read `iovcnt` buffers worth of data from `fildes` at `offset`.
    pub unsafe fn preadv(
        fildes: file_descriptor,
        iov: *const iovec,
        iovcnt: c_int,
        offset: i64,
    ) -> isize;
    /// Gather-write `iovcnt` buffers worth of data to `fildes` at `offset`.
    pub unsafe fn pwritev(
        fildes: file_descriptor,
        iov: *const iovec,
        iovcnt: c_int,
        offset: i64,
    ) -> isize;

    /// Set the length of the file to exactly `length` bytes.
    pub unsafe fn ftruncate(fildes: file_descriptor, length: i64) -> c_int;

    /// Returns statistics about the file open with the provided file descriptor.
    pub unsafe fn fstat(fildes: file_descriptor, buf: *mut types::stat) -> c_int;
    /// Returns statistics about the file at the path relative to the provided
    /// file descriptor, without following a trailing symlink when
    /// [`AT_SYMLINK_NOFOLLOW`] is set.
    ///
    /// [`AT_SYMLINK_NOFOLLOW`]: super::types::flags::AT_SYMLINK_NOFOLLOW
    pub unsafe fn fstatat(
        fildes: file_descriptor,
        path: *const c_char,
        buf: *mut types::stat,
        flag: c_int,
    ) -> c_int;

    /// Sync the buffered content and metadata of a file to disk.
    pub unsafe fn fsync(fildes: file_descriptor) -> c_int;
    /// Declare an expected access pattern for a range of a file.
    pub unsafe fn posix_fadvise(
        fildes: file_descriptor,
        offset: i64,
        len: i64,
        advice: c_int,
    ) -> c_int;
    /// Duplicate a file descriptor.
    pub unsafe fn dup(fildes: file_descriptor) -> file_descriptor;

    /// Open a directory stream for reading from a file descriptor.
    ///
    /// The stream takes ownership of the descriptor.
    pub unsafe fn fdopendir(fildes: file_descriptor) -> dir_stream;
    /// Return the next entry in the directory, or null at the end.
    pub unsafe fn readdir64(dirp: dir_stream) -> *const dirent;
    /// Rewind the directory stream to the beginning.
    pub unsafe fn rewinddir(dirp: dir_stream);
    /// Close the directory stream and the associated file descriptor.
    pub unsafe fn closedir(dirp: dir_stream) -> c_int;

    /// Resolve a path to canonical absolute form into a malloc'd buffer.
    pub unsafe fn realpath(path: *const c_char, resolved: *mut c_char) -> *mut c_char;
    /// Release a malloc'd buffer, e.g. one returned from [`realpath`].
    pub unsafe fn free(ptr: *mut c_void);

    /// Map part of a file into memory.
    pub unsafe fn mmap(
        addr: *mut c_void,
        length: usize,
        prot: c_int,
        flags: c_int,
        fildes: file_descriptor,
        offset: i64,
    ) -> *mut c_void;
    /// Remove a mapping established with [`mmap`].
    pub unsafe fn munmap(addr: *mut c_void, length: usize) -> c_int;

    /// Query a runtime system configuration value.
    pub unsafe fn sysconf(name: c_int) -> c_long;
}
