//! POSIX specific paths.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::platform::{PlatformFilename, PlatformPath};
use crate::Error;

/// Path handed to the kernel on POSIX platforms.
///
/// POSIX paths are arbitrary byte strings with two restrictions: they cannot
/// be empty and they cannot contain an interior NUL. Both are checked here so
/// the syscall layer can convert to a C string infallibly.
#[derive(Debug, Clone)]
pub struct PosixPath {
    inner: CString,
}

impl PosixPath {
    pub fn as_c_str(&self) -> &std::ffi::CStr {
        &self.inner
    }
}

impl PlatformPath for PosixPath {
    fn try_new(val: &Path) -> Result<Self, Error> {
        let bytes = val.as_os_str().as_bytes();
        if bytes.is_empty() {
            return Err(Error::invalid("empty path"));
        }
        let inner = CString::new(bytes)
            .map_err(|_| Error::invalid(format!("path contains NUL: {}", val.display())))?;
        Ok(PosixPath { inner })
    }
}

impl From<PosixPath> for CString {
    fn from(path: PosixPath) -> Self {
        path.inner
    }
}

/// Individual component of a [`PosixPath`].
#[derive(Debug, Clone)]
pub struct PosixFilename {
    inner: CString,
}

impl PosixFilename {
    pub fn as_c_str(&self) -> &std::ffi::CStr {
        &self.inner
    }
}

impl PlatformFilename for PosixFilename {
    fn try_new(val: &str) -> Result<Self, Error> {
        if val.is_empty() {
            return Err(Error::invalid("empty filename"));
        }
        if val.contains('/') {
            return Err(Error::invalid(format!("filename contains '/': {val}")));
        }
        let inner = CString::new(val.as_bytes())
            .map_err(|_| Error::invalid(format!("filename contains NUL: {val}")))?;
        Ok(PosixFilename { inner })
    }
}

impl From<PosixFilename> for CString {
    fn from(filename: PosixFilename) -> Self {
        filename.inner
    }
}
