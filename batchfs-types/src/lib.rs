//! Types used throughout `batchfs`.
//!
//! The goal of this crate is to be very lightweight, so take care with adding dependencies.

/// Time info returned from a `stat` call.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timespec {
    /// Seconds.
    pub secs: i64,
    /// Nanoseconds.
    ///
    /// Not all filesystems provide this, thus often it will be 0.
    pub nanos: i64,
}

impl Timespec {
    /// Create a [`Timespec`] from the number of milliseconds since the epoch.
    pub fn from_epoch_millis(millis: u64) -> Self {
        let secs = millis / 1000;
        let nanos = (millis % 1000) * 10u64.pow(6);

        Timespec {
            secs: secs.try_into().expect("overflowed timespec"),
            nanos: nanos.try_into().expect("overflowed timespec"),
        }
    }
}

/// Kind of object on the filesystem.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
    Symlink,
}

/// Full metadata record for an object on the filesystem.
///
/// Not every filesystem can produce every field; which ones are actually
/// valid for a given record is tracked out of band by the caller.
#[derive(Debug, Default, Copy, Clone)]
pub struct Stat {
    /// Device the object lives on.
    pub dev: u64,
    /// Inode number.
    pub ino: u64,
    /// Kind of the object.
    pub kind: Option<FileType>,
    /// Permission bits.
    pub perms: u32,
    /// Number of hard links.
    pub nlink: u64,
    /// User ID of the owner.
    pub uid: u32,
    /// Group ID of the owner.
    pub gid: u32,
    /// Device number, if this is a device special file.
    pub rdev: u64,
    /// Last access time.
    pub atim: Timespec,
    /// Last content modification time.
    pub mtim: Timespec,
    /// Last attribute change time.
    pub ctim: Timespec,
    /// Size of the object in bytes.
    pub size: u64,
    /// Bytes actually allocated on disk.
    pub allocated: u64,
    /// Number of 512-byte blocks allocated.
    pub blocks: u64,
    /// Preferred I/O block size.
    pub blksize: u64,
    /// Filesystem specific flag bits.
    pub flags: u32,
    /// Generation number of the inode.
    pub gen: u64,
    /// Creation time, where the filesystem records one.
    pub birthtim: Timespec,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespec_from_millis() {
        let ts = Timespec::from_epoch_millis(1_500);
        assert_eq!(ts.secs, 1);
        assert_eq!(ts.nanos, 500_000_000);
    }

    #[test]
    fn timespec_ordering() {
        let a = Timespec { secs: 1, nanos: 0 };
        let b = Timespec { secs: 1, nanos: 1 };
        let c = Timespec { secs: 2, nanos: 0 };
        assert!(a < b);
        assert!(b < c);
    }
}
