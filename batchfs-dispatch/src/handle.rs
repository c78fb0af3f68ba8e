//! Module that defines the shared, reference counted filesystem handle.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use batchfs_types::Stat;

use crate::dispatcher::DispatcherInner;
use crate::platform::{
    FileFlags, FilesystemPlatform, MetadataFlags, Platform, PlatformDirStreamType,
    PlatformFilename, PlatformFilenameType, PlatformHandleType, PlatformMappingType, PlatformPath,
    PlatformPathType,
};
use crate::{DirectoryEntry, Error};

/// What kind of object a [`Handle`] refers to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandleKind {
    File,
    Directory,
    Symlink,
}

/// The native resources owned by a live handle.
///
/// Remove verbs produce handles with none of these (tombstones), and `close`
/// empties them out.
#[derive(Debug, Default)]
pub(crate) struct NativeState {
    /// The platform handle, generally a file descriptor.
    pub(crate) fd: Option<PlatformHandleType>,
    /// Read-only mapping of the full extent, when opened with `OS_MMAP`.
    pub(crate) mapping: Option<PlatformMappingType>,
    /// Enumeration cursor; survives across `enumerate` calls so batches
    /// resume where the previous one left off.
    pub(crate) cursor: Option<PlatformDirStreamType>,
}

/// Opened handle to an object on the filesystem.
///
/// Handles are shared: many op results may name the same handle, and clones
/// are cheap. The underlying resource is released when the last reference
/// drops (flushing first if the handle was opened with `SYNC_ON_CLOSE` and
/// has unflushed writes), or earlier via a `close` op.
#[derive(Debug, Clone)]
pub struct Handle {
    pub(crate) inner: Arc<HandleInner>,
}

#[derive(Debug)]
pub(crate) struct HandleInner {
    /// The dispatcher this handle belongs to.
    pub(crate) dispatcher: Weak<DispatcherInner>,
    /// Shared handle to the containing directory. Only populated when the
    /// handle was opened with `FAST_DIRECTORY_ENUMERATION`.
    pub(crate) dirh: Option<Handle>,
    /// Canonical absolute path of the object.
    pub(crate) path: PathBuf,
    /// The final flags used when this handle was opened.
    pub(crate) flags: FileFlags,
    pub(crate) kind: HandleKind,
    /// When this handle was opened.
    pub(crate) opened: SystemTime,

    pub(crate) bytes_read: AtomicU64,
    pub(crate) bytes_written: AtomicU64,
    pub(crate) bytes_written_at_last_fsync: AtomicU64,

    pub(crate) state: Mutex<NativeState>,
}

impl Handle {
    /// Wrap a freshly opened native handle, registering it with the
    /// dispatcher's handle registry.
    pub(crate) fn new_native(
        dispatcher: &Arc<DispatcherInner>,
        dirh: Option<Handle>,
        path: PathBuf,
        flags: FileFlags,
        kind: HandleKind,
        fd: PlatformHandleType,
    ) -> Handle {
        let inner = Arc::new(HandleInner {
            dispatcher: Arc::downgrade(dispatcher),
            dirh,
            path,
            flags,
            kind,
            opened: SystemTime::now(),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_written_at_last_fsync: AtomicU64::new(0),
            state: Mutex::new(NativeState {
                fd: Some(fd),
                mapping: None,
                cursor: None,
            }),
        });
        dispatcher
            .registry
            .lock()
            .expect("handle registry lock poisoned")
            .insert(fd, Arc::downgrade(&inner));

        Handle { inner }
    }

    /// A handle that names a path but owns no native resource, e.g. the
    /// result of a remove verb.
    pub(crate) fn new_tombstone(
        dispatcher: &Arc<DispatcherInner>,
        path: PathBuf,
        flags: FileFlags,
        kind: HandleKind,
    ) -> Handle {
        Handle {
            inner: Arc::new(HandleInner {
                dispatcher: Arc::downgrade(dispatcher),
                dirh: None,
                path,
                flags,
                kind,
                opened: SystemTime::now(),
                bytes_read: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
                bytes_written_at_last_fsync: AtomicU64::new(0),
                state: Mutex::new(NativeState::default()),
            }),
        }
    }

    /// The canonical absolute path of this handle.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// The final flags used when this handle was opened.
    pub fn flags(&self) -> FileFlags {
        self.inner.flags
    }

    /// When this handle was opened.
    pub fn opened(&self) -> SystemTime {
        self.inner.opened
    }

    /// A handle to the directory containing this handle. Only available if
    /// `FAST_DIRECTORY_ENUMERATION` was specified when opening.
    pub fn container(&self) -> Option<&Handle> {
        self.inner.dirh.as_ref()
    }

    /// The native handle value, if the resource is still open.
    pub fn native(&self) -> Option<PlatformHandleType> {
        self.inner.state.lock().expect("handle state lock poisoned").fd
    }

    pub fn is_file(&self) -> bool {
        self.inner.kind == HandleKind::File
    }

    pub fn is_directory(&self) -> bool {
        self.inner.kind == HandleKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.inner.kind == HandleKind::Symlink
    }

    /// Whether this handle currently owns no native resource.
    pub fn is_tombstone(&self) -> bool {
        self.native().is_none()
    }

    /// How many bytes have been read through this handle since it was opened.
    pub fn read_count(&self) -> u64 {
        self.inner.bytes_read.load(Ordering::Relaxed)
    }

    /// How many bytes have been written through this handle since it was opened.
    pub fn write_count(&self) -> u64 {
        self.inner.bytes_written.load(Ordering::Relaxed)
    }

    /// How many bytes have been written through this handle since it was
    /// last fsynced.
    pub fn write_count_since_fsync(&self) -> u64 {
        self.inner.bytes_written.load(Ordering::Relaxed)
            - self
                .inner
                .bytes_written_at_last_fsync
                .load(Ordering::Relaxed)
    }

    /// The target path of this handle, if it is a symbolic link.
    pub fn target(&self) -> Result<PathBuf, Error> {
        if !self.is_symlink() {
            return Err(Error::invalid(format!(
                "not a symlink: {}",
                self.path().display()
            )));
        }
        let path = PlatformPathType::try_new(self.path())?;
        FilesystemPlatform::read_link(&path)
    }

    /// A mostly filled [`DirectoryEntry`] for the object this handle
    /// references. The returned mask is capped at `wanted`.
    pub fn direntry(&self, wanted: MetadataFlags) -> Result<DirectoryEntry, Error> {
        let fd = self.require_native()?;
        let (stat, have) = FilesystemPlatform::fstat(fd, self.path())?;
        let name = self
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(DirectoryEntry {
            name,
            stat,
            have: have & wanted,
        })
    }

    pub(crate) fn require_native(&self) -> Result<PlatformHandleType, Error> {
        self.native().ok_or_else(|| {
            Error::invalid(format!("handle is closed: {}", self.path().display()))
        })
    }

    pub(crate) fn add_bytes_read(&self, count: u64) {
        self.inner.bytes_read.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_written(&self, count: u64) {
        self.inner.bytes_written.fetch_add(count, Ordering::Relaxed);
    }

    /// Record that everything written so far has reached storage.
    pub(crate) fn mark_synced(&self) {
        let written = self.inner.bytes_written.load(Ordering::Relaxed);
        self.inner
            .bytes_written_at_last_fsync
            .store(written, Ordering::Relaxed);
    }

    /// Serve a read out of the handle's memory mapping, if one exists.
    ///
    /// The copy happens under the state lock so the mapping cannot be torn
    /// down mid-read. Returns `None` when the handle has no mapping.
    pub(crate) fn read_from_mapping(
        &self,
        offset: u64,
        bufs: &mut [Vec<u8>],
    ) -> Option<Result<usize, Error>> {
        let state = self.inner.state.lock().expect("handle state lock poisoned");
        let mapping = state.mapping.as_ref()?;
        let data = FilesystemPlatform::mapping_slice(mapping);

        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let Ok(offset) = usize::try_from(offset) else {
            return Some(Err(Error::invalid(format!("read offset overflows: {offset}"))));
        };
        if offset.checked_add(total).map_or(true, |end| end > data.len()) {
            return Some(Err(Error::EndOfFile {
                path: self.path().to_string_lossy().into_owned().into_boxed_str(),
                offset: offset as u64,
            }));
        }

        let mut pos = offset;
        for buf in bufs.iter_mut() {
            let len = buf.len();
            buf.copy_from_slice(&data[pos..pos + len]);
            pos += len;
        }
        Some(Ok(total))
    }

    /// Release every native resource this handle owns, turning it into a
    /// tombstone.
    ///
    /// `flush` forces an fsync of unflushed writes before the descriptor is
    /// closed. Resources are torn down even when the flush fails; the first
    /// error encountered is returned.
    pub(crate) fn close_resources(&self, flush: bool) -> Result<(), Error> {
        let state = {
            let mut state = self.inner.state.lock().expect("handle state lock poisoned");
            std::mem::take(&mut *state)
        };
        let flush = flush && self.write_count_since_fsync() > 0;
        let result = release_native(&self.inner.dispatcher, self.path(), state, flush);
        if result.is_ok() {
            self.mark_synced();
        }
        result
    }
}

/// Tear down a handle's native resources: flush if asked, close the
/// enumeration cursor, unmap, deregister, and close the descriptor.
fn release_native(
    dispatcher: &Weak<DispatcherInner>,
    path: &Path,
    state: NativeState,
    flush: bool,
) -> Result<(), Error> {
    let NativeState {
        fd,
        mapping,
        cursor,
    } = state;

    let mut first_err = None;
    if let Some(fd) = fd {
        if flush {
            if let Err(err) = FilesystemPlatform::fsync(fd, path) {
                first_err = Some(err);
            }
        }
    }
    if let Some(cursor) = cursor {
        FilesystemPlatform::close_dir_stream(cursor);
    }
    if let Some(mapping) = mapping {
        FilesystemPlatform::unmap(mapping);
    }
    if let Some(fd) = fd {
        if let Some(dispatcher) = dispatcher.upgrade() {
            dispatcher
                .registry
                .lock()
                .expect("handle registry lock poisoned")
                .remove(&fd);
        }
        if let Err(err) = FilesystemPlatform::close(fd, path) {
            first_err.get_or_insert(err);
        }
    }

    match first_err {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let state = std::mem::take(self.state.get_mut().expect("handle state lock poisoned"));
        if state.fd.is_none() {
            return;
        }

        let written = self.bytes_written.load(Ordering::Relaxed);
        let synced = self.bytes_written_at_last_fsync.load(Ordering::Relaxed);
        let flush = self.flags.contains(FileFlags::SYNC_ON_CLOSE) && written > synced;
        if let Err(err) = release_native(&self.dispatcher, &self.path, state, flush) {
            tracing::warn!(path = %self.path.display(), %err, "failed to close dropped handle");
        }
    }
}

impl DirectoryEntry {
    /// Fill in metadata fields this entry is missing.
    ///
    /// `dirh` must be an open handle to the entry's containing directory.
    /// Returns the updated validity mask.
    pub fn fetch_metadata(
        &mut self,
        dirh: &Handle,
        wanted: MetadataFlags,
    ) -> Result<MetadataFlags, Error> {
        let tofetch = wanted & !self.have & DirectoryEntry::metadata_supported();
        if tofetch.is_empty() {
            return Ok(self.have);
        }

        let fd = dirh.require_native()?;
        let name = PlatformFilenameType::try_new(&self.name)?;
        let full = dirh.path().join(&self.name);
        let (stat, have) = FilesystemPlatform::fstatat(fd, &name, &full)?;

        copy_stat_fields(&mut self.stat, &stat, tofetch & have);
        self.have |= tofetch & have;
        Ok(self.have)
    }

    /// Fetch a full [`Stat`] for this entry via its containing directory.
    pub fn fetch_stat(&mut self, dirh: &Handle, wanted: MetadataFlags) -> Result<Stat, Error> {
        self.fetch_metadata(dirh, wanted)?;
        Ok(self.stat)
    }
}

/// Copy the `stat` fields named by `mask` from `src` into `dst`.
fn copy_stat_fields(dst: &mut Stat, src: &Stat, mask: MetadataFlags) {
    if mask.contains(MetadataFlags::DEV) {
        dst.dev = src.dev;
    }
    if mask.contains(MetadataFlags::INO) {
        dst.ino = src.ino;
    }
    if mask.contains(MetadataFlags::TYPE) {
        dst.kind = src.kind;
    }
    if mask.contains(MetadataFlags::PERMS) {
        dst.perms = src.perms;
    }
    if mask.contains(MetadataFlags::NLINK) {
        dst.nlink = src.nlink;
    }
    if mask.contains(MetadataFlags::UID) {
        dst.uid = src.uid;
    }
    if mask.contains(MetadataFlags::GID) {
        dst.gid = src.gid;
    }
    if mask.contains(MetadataFlags::RDEV) {
        dst.rdev = src.rdev;
    }
    if mask.contains(MetadataFlags::ATIM) {
        dst.atim = src.atim;
    }
    if mask.contains(MetadataFlags::MTIM) {
        dst.mtim = src.mtim;
    }
    if mask.contains(MetadataFlags::CTIM) {
        dst.ctim = src.ctim;
    }
    if mask.contains(MetadataFlags::SIZE) {
        dst.size = src.size;
    }
    if mask.contains(MetadataFlags::ALLOCATED) {
        dst.allocated = src.allocated;
    }
    if mask.contains(MetadataFlags::BLOCKS) {
        dst.blocks = src.blocks;
    }
    if mask.contains(MetadataFlags::BLKSIZE) {
        dst.blksize = src.blksize;
    }
    if mask.contains(MetadataFlags::FLAGS) {
        dst.flags = src.flags;
    }
    if mask.contains(MetadataFlags::GEN) {
        dst.gen = src.gen;
    }
    if mask.contains(MetadataFlags::BIRTHTIM) {
        dst.birthtim = src.birthtim;
    }
}
