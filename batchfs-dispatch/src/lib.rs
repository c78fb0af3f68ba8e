pub mod barrier;
pub mod dispatcher;
pub mod handle;
pub mod op;
pub mod platform;
pub mod request;
pub mod task;

#[cfg(test)]
mod tests;

use batchfs_types::Stat;

pub use crate::barrier::{when_all, when_all_settled, when_any};
pub use crate::dispatcher::{Dispatcher, IoWorker};
pub use crate::handle::Handle;
pub use crate::op::{CompletionFlags, CompletionState, Op, OpId, OpResult};
pub use crate::platform::{FileFlags, MetadataFlags};
pub use crate::request::{
    DataRequest, EnumerateRequest, HandleRequest, PathRequest, TruncateRequest,
};
pub use crate::task::ValueFuture;

/// Errors that can be returned from dispatcher operations.
///
/// An op's failure is replicated into the future of every op that names it as
/// a precondition, so errors are cheaply cloneable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The request itself was malformed, independent of filesystem state.
    #[error("invalid argument: {0}")]
    InvalidArgument(Box<str>),
    /// A filesystem call failed with an OS error we have no specific variant for.
    #[error("`{path}`: {message} (os error {code})")]
    Os {
        code: i32,
        message: Box<str>,
        path: Box<str>,
    },
    #[error("`{path}`: file or directory already exists")]
    AlreadyExists { path: Box<str> },
    #[error("`{path}`: no such file or directory")]
    NotFound { path: Box<str> },
    /// A read was requested past the current end of the file.
    #[error("`{path}`: read past end of file at offset {offset}")]
    EndOfFile { path: Box<str>, offset: u64 },
    /// The current platform cannot perform the requested operation.
    #[error("operation not supported on this platform: {0}")]
    Unsupported(Box<str>),
    /// The op was abandoned before its result could be produced, or a
    /// completion handler panicked.
    #[error("operation aborted: {0}")]
    Aborted(Box<str>),
}

impl Error {
    /// Create an [`Error`] from an errno value and the path that produced it.
    pub fn from_os(code: i32, path: &std::path::Path) -> Self {
        let path = path.to_string_lossy().into_owned().into_boxed_str();
        match code {
            2 => Error::NotFound { path },
            17 => Error::AlreadyExists { path },
            _ => {
                let message = std::io::Error::from_raw_os_error(code)
                    .to_string()
                    .into_boxed_str();
                Error::Os {
                    code,
                    message,
                    path,
                }
            }
        }
    }

    /// The raw OS error code, if this error came from a filesystem call.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Error::Os { code, .. } => Some(*code),
            Error::NotFound { .. } => Some(2),
            Error::AlreadyExists { .. } => Some(17),
            _ => None,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    pub(crate) fn invalid<T: Into<String>>(msg: T) -> Self {
        Error::InvalidArgument(msg.into().into_boxed_str())
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "completion handler panicked".to_string()
        };
        Error::Aborted(msg.into_boxed_str())
    }
}

/// Information returned for an individual entry when enumerating a directory.
///
/// Which `stat` fields are actually valid is recorded in `have`; the rest are
/// left at their defaults. Missing fields can be filled in lazily with
/// [`DirectoryEntry::fetch_metadata`] given a handle to the containing
/// directory.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    /// Name of the entry within its directory.
    pub name: String,
    /// Metadata for the entry.
    pub stat: Stat,
    /// Which fields of `stat` are valid.
    pub have: MetadataFlags,
}

impl DirectoryEntry {
    /// Which `stat` fields this platform can return at all.
    pub fn metadata_supported() -> MetadataFlags {
        use crate::platform::{FilesystemPlatform, Platform};
        FilesystemPlatform::metadata_supported()
    }

    /// Which `stat` fields enumeration returns without extra syscalls.
    pub fn metadata_fastpath() -> MetadataFlags {
        use crate::platform::{FilesystemPlatform, Platform};
        FilesystemPlatform::metadata_fastpath()
    }

    /// The largest enumeration batch size that behaves identically across
    /// the supported platforms' native directory-read limits.
    pub fn compatibility_maximum() -> usize {
        512
    }
}
