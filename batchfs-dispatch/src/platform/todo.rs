//! Placeholder Platform for targets without a real backend yet.
//!
//! Every operation fails with [`Error::Unsupported`].

use std::path::{Path, PathBuf};

use batchfs_types::Stat;

use crate::platform::{
    AccessPattern, FileFlags, MetadataFlags, Platform, PlatformFilename, PlatformPath,
};
use crate::{DirectoryEntry, Error};

pub struct TodoPlatform;

fn unsupported<T>(what: &str) -> Result<T, Error> {
    Err(Error::Unsupported(what.into()))
}

#[derive(Debug, Clone)]
pub struct TodoPath;

impl PlatformPath for TodoPath {
    fn try_new(_val: &Path) -> Result<Self, Error> {
        Ok(TodoPath)
    }
}

#[derive(Debug, Clone)]
pub struct TodoFilename;

impl PlatformFilename for TodoFilename {
    fn try_new(_val: &str) -> Result<Self, Error> {
        Ok(TodoFilename)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TodoHandle;

#[derive(Debug)]
pub struct TodoDirStream;

#[derive(Debug)]
pub struct TodoMapping;

impl Platform for TodoPlatform {
    type Path = TodoPath;
    type Filename = TodoFilename;

    type Handle = TodoHandle;
    type DirStream = TodoDirStream;
    type Mapping = TodoMapping;

    fn open_file(_path: &Self::Path, _flags: FileFlags) -> Result<Self::Handle, Error> {
        unsupported("open_file")
    }

    fn open_directory(_path: &Self::Path) -> Result<Self::Handle, Error> {
        unsupported("open_directory")
    }

    fn open_symlink(_path: &Self::Path) -> Result<Self::Handle, Error> {
        unsupported("open_symlink")
    }

    fn close(_handle: Self::Handle, _path: &Path) -> Result<(), Error> {
        unsupported("close")
    }

    fn mkdir(_path: &Self::Path) -> Result<(), Error> {
        unsupported("mkdir")
    }

    fn rmdir(_path: &Self::Path) -> Result<(), Error> {
        unsupported("rmdir")
    }

    fn unlink(_path: &Self::Path) -> Result<(), Error> {
        unsupported("unlink")
    }

    fn symlink(_target: &Self::Path, _link: &Self::Path) -> Result<(), Error> {
        unsupported("symlink")
    }

    fn read_link(_path: &Self::Path) -> Result<PathBuf, Error> {
        unsupported("read_link")
    }

    fn canonicalize(_path: &Self::Path) -> Result<PathBuf, Error> {
        unsupported("canonicalize")
    }

    fn fsync(_handle: Self::Handle, _path: &Path) -> Result<(), Error> {
        unsupported("fsync")
    }

    fn ftruncate(_handle: Self::Handle, _size: u64, _path: &Path) -> Result<(), Error> {
        unsupported("ftruncate")
    }

    fn fstat(_handle: Self::Handle, _path: &Path) -> Result<(Stat, MetadataFlags), Error> {
        unsupported("fstat")
    }

    fn fstatat(
        _dir: Self::Handle,
        _name: &Self::Filename,
        _path: &Path,
    ) -> Result<(Stat, MetadataFlags), Error> {
        unsupported("fstatat")
    }

    fn read_vectored(
        _handle: Self::Handle,
        _bufs: &mut [&mut [u8]],
        _offset: u64,
        _path: &Path,
    ) -> Result<usize, Error> {
        unsupported("read_vectored")
    }

    fn write_vectored(
        _handle: Self::Handle,
        _bufs: &[&[u8]],
        _offset: u64,
        _path: &Path,
    ) -> Result<usize, Error> {
        unsupported("write_vectored")
    }

    fn open_dir_stream(_handle: Self::Handle, _path: &Path) -> Result<Self::DirStream, Error> {
        unsupported("open_dir_stream")
    }

    fn rewind_dir_stream(_stream: &mut Self::DirStream) {}

    fn next_dir_entry(_stream: &mut Self::DirStream) -> Result<Option<DirectoryEntry>, Error> {
        unsupported("next_dir_entry")
    }

    fn close_dir_stream(_stream: Self::DirStream) {}

    fn map_readonly(
        _handle: Self::Handle,
        _len: usize,
        _path: &Path,
    ) -> Result<Self::Mapping, Error> {
        unsupported("map_readonly")
    }

    fn mapping_slice(_mapping: &Self::Mapping) -> &[u8] {
        &[]
    }

    fn unmap(_mapping: Self::Mapping) {}

    fn advise(_handle: Self::Handle, _pattern: AccessPattern) {}

    fn page_size() -> usize {
        4096
    }

    fn iov_max() -> usize {
        16
    }

    fn metadata_supported() -> MetadataFlags {
        MetadataFlags::empty()
    }

    fn metadata_fastpath() -> MetadataFlags {
        MetadataFlags::empty()
    }
}
