use batchfs_types::FileType;

use crate::platform::posix::path::PosixFilename;
use crate::platform::posix::PosixPath;
use crate::platform::{FileFlags, MetadataFlags, Platform, PlatformFilename, PlatformPath};
use crate::Error;

use super::PosixPlatform;

fn posix_path(path: &std::path::Path) -> PosixPath {
    PosixPath::try_new(path).unwrap()
}

#[test]
fn smoketest_write_read() {
    let temp = tempfile::TempDir::new().unwrap();
    let path = posix_path(&temp.path().join("test-write-read"));

    let file = PosixPlatform::open_file(
        &path,
        FileFlags::READ | FileFlags::WRITE | FileFlags::CREATE,
    )
    .unwrap();

    let content = b"here are some bytes headed for disk";
    let written =
        PosixPlatform::write_vectored(file, &[&content[..]], 0, temp.path()).unwrap();
    assert_eq!(written, content.len());

    let mut buf = vec![0u8; content.len()];
    let read =
        PosixPlatform::read_vectored(file, &mut [&mut buf[..]], 0, temp.path()).unwrap();
    assert_eq!(read, content.len());
    assert_eq!(&buf[..], &content[..]);

    PosixPlatform::close(file, temp.path()).unwrap();
}

#[test]
fn smoketest_scatter_gather() {
    let temp = tempfile::TempDir::new().unwrap();
    let path = posix_path(&temp.path().join("test-scatter"));

    let file = PosixPlatform::open_file(
        &path,
        FileFlags::READ | FileFlags::WRITE | FileFlags::CREATE,
    )
    .unwrap();

    let written =
        PosixPlatform::write_vectored(file, &[b"abc", b"defg", b"h"], 0, temp.path()).unwrap();
    assert_eq!(written, 8);

    let mut first = vec![0u8; 5];
    let mut second = vec![0u8; 3];
    let read = PosixPlatform::read_vectored(
        file,
        &mut [&mut first[..], &mut second[..]],
        0,
        temp.path(),
    )
    .unwrap();
    assert_eq!(read, 8);
    assert_eq!(&first[..], b"abcde");
    assert_eq!(&second[..], b"fgh");

    PosixPlatform::close(file, temp.path()).unwrap();
}

#[test]
fn smoketest_stat() {
    let temp = tempfile::TempDir::new().unwrap();
    let path = posix_path(&temp.path().join("test-stat"));

    let file = PosixPlatform::open_file(
        &path,
        FileFlags::READ | FileFlags::WRITE | FileFlags::CREATE,
    )
    .unwrap();
    PosixPlatform::write_vectored(file, &[b"0123456789"], 0, temp.path()).unwrap();

    let (stat, have) = PosixPlatform::fstat(file, temp.path()).unwrap();
    assert_eq!(stat.size, 10);
    assert_eq!(stat.kind, Some(FileType::File));
    assert!(have.contains(MetadataFlags::SIZE | MetadataFlags::INO | MetadataFlags::TYPE));
    assert!(!have.contains(MetadataFlags::BIRTHTIM));

    PosixPlatform::close(file, temp.path()).unwrap();
}

#[test]
fn smoketest_truncate() {
    let temp = tempfile::TempDir::new().unwrap();
    let path = posix_path(&temp.path().join("test-truncate"));

    let file = PosixPlatform::open_file(
        &path,
        FileFlags::READ | FileFlags::WRITE | FileFlags::CREATE,
    )
    .unwrap();

    PosixPlatform::ftruncate(file, 4096, temp.path()).unwrap();
    let (stat, _) = PosixPlatform::fstat(file, temp.path()).unwrap();
    assert_eq!(stat.size, 4096);

    PosixPlatform::ftruncate(file, 16, temp.path()).unwrap();
    let (stat, _) = PosixPlatform::fstat(file, temp.path()).unwrap();
    assert_eq!(stat.size, 16);

    PosixPlatform::close(file, temp.path()).unwrap();
}

#[test]
fn smoketest_listdir() {
    let temp = tempfile::TempDir::new().unwrap();
    let dir_path = posix_path(&temp.path().join("mydir"));
    PosixPlatform::mkdir(&dir_path).unwrap();

    let file_path = posix_path(&temp.path().join("mydir").join("inside.txt"));
    let file = PosixPlatform::open_file(&file_path, FileFlags::WRITE | FileFlags::CREATE).unwrap();
    PosixPlatform::close(file, temp.path()).unwrap();

    let dir = PosixPlatform::open_directory(&dir_path).unwrap();
    let mut stream = PosixPlatform::open_dir_stream(dir, temp.path()).unwrap();

    let mut names = Vec::new();
    while let Some(entry) = PosixPlatform::next_dir_entry(&mut stream).unwrap() {
        names.push(entry.name);
    }
    assert!(names.contains(&"inside.txt".to_string()));
    assert!(names.contains(&".".to_string()));

    // Rewinding replays the stream from the start.
    PosixPlatform::rewind_dir_stream(&mut stream);
    let mut replay = Vec::new();
    while let Some(entry) = PosixPlatform::next_dir_entry(&mut stream).unwrap() {
        replay.push(entry.name);
    }
    names.sort();
    replay.sort();
    assert_eq!(names, replay);

    PosixPlatform::close_dir_stream(stream);
    PosixPlatform::close(dir, temp.path()).unwrap();
}

#[test]
fn smoketest_fstatat() {
    let temp = tempfile::TempDir::new().unwrap();
    let file_path = posix_path(&temp.path().join("statat-me"));
    let file = PosixPlatform::open_file(&file_path, FileFlags::WRITE | FileFlags::CREATE).unwrap();
    PosixPlatform::write_vectored(file, &[b"xyz"], 0, temp.path()).unwrap();
    PosixPlatform::close(file, temp.path()).unwrap();

    let dir = PosixPlatform::open_directory(&posix_path(temp.path())).unwrap();
    let name = PosixFilename::try_new("statat-me").unwrap();
    let (stat, _) = PosixPlatform::fstatat(dir, &name, temp.path()).unwrap();
    assert_eq!(stat.size, 3);
    assert_eq!(stat.kind, Some(FileType::File));

    PosixPlatform::close(dir, temp.path()).unwrap();
}

#[test]
fn smoketest_symlink() {
    let temp = tempfile::TempDir::new().unwrap();
    let target_path = posix_path(&temp.path().join("the-target"));
    let target =
        PosixPlatform::open_file(&target_path, FileFlags::WRITE | FileFlags::CREATE).unwrap();
    PosixPlatform::close(target, temp.path()).unwrap();

    let link_path = posix_path(&temp.path().join("the-link"));
    PosixPlatform::symlink(&target_path, &link_path).unwrap();

    let read_back = PosixPlatform::read_link(&link_path).unwrap();
    assert_eq!(read_back, temp.path().join("the-target"));

    let link = PosixPlatform::open_symlink(&link_path).unwrap();
    PosixPlatform::close(link, temp.path()).unwrap();

    PosixPlatform::unlink(&link_path).unwrap();
    let err = PosixPlatform::read_link(&link_path).unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[test]
fn smoketest_canonicalize() {
    let temp = tempfile::TempDir::new().unwrap();
    let nested = temp.path().join("a");
    PosixPlatform::mkdir(&posix_path(&nested)).unwrap();

    let dotted = temp.path().join("a").join(".").join("..").join("a");
    let canonical = PosixPlatform::canonicalize(&posix_path(&dotted)).unwrap();
    assert_eq!(canonical, nested.canonicalize().unwrap());
}

#[test]
fn smoketest_mmap() {
    let temp = tempfile::TempDir::new().unwrap();
    let path = posix_path(&temp.path().join("test-mmap"));

    let file = PosixPlatform::open_file(
        &path,
        FileFlags::READ | FileFlags::WRITE | FileFlags::CREATE,
    )
    .unwrap();
    let content = b"mapped bytes";
    PosixPlatform::write_vectored(file, &[&content[..]], 0, temp.path()).unwrap();

    let mapping = PosixPlatform::map_readonly(file, content.len(), temp.path()).unwrap();
    assert_eq!(PosixPlatform::mapping_slice(&mapping), &content[..]);
    PosixPlatform::unmap(mapping);

    PosixPlatform::close(file, temp.path()).unwrap();
}

#[test]
fn sysconf_values_are_sane() {
    assert!(PosixPlatform::page_size() >= 512);
    assert!(PosixPlatform::iov_max() >= 16);
}

#[test]
fn missing_file_is_not_found() {
    let temp = tempfile::TempDir::new().unwrap();
    let path = posix_path(&temp.path().join("does-not-exist"));
    let err = PosixPlatform::open_file(&path, FileFlags::READ).unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[test]
fn exclusive_create_collides() {
    let temp = tempfile::TempDir::new().unwrap();
    let path = posix_path(&temp.path().join("exclusive"));

    let flags = FileFlags::WRITE | FileFlags::CREATE_ONLY_IF_NOT_EXIST;
    let first = PosixPlatform::open_file(&path, flags).unwrap();
    let err = PosixPlatform::open_file(&path, flags).unwrap_err();
    assert!(err.is_already_exists());

    PosixPlatform::close(first, temp.path()).unwrap();
}
