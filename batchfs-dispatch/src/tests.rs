use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::barrier::{when_all, when_all_settled, when_any};
use crate::dispatcher::Dispatcher;
use crate::op::Op;
use crate::platform::FileFlags;
use crate::request::{
    DataRequest, EnumerateRequest, HandleRequest, PathRequest, TruncateRequest,
};
use crate::Error;

fn new_test() -> Dispatcher {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    Dispatcher::new(2, FileFlags::empty(), FileFlags::empty())
}

fn rw_create() -> FileFlags {
    FileFlags::READ | FileFlags::WRITE | FileFlags::CREATE
}

async fn must_handle(op: &Op) -> crate::Handle {
    op.wait()
        .await
        .expect("op failed")
        .expect("op produced no handle")
}

#[tokio::test]
async fn sequential_creation_pipeline() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();
    let testdir = temp.path().join("testdir");

    let mk = dispatcher.dir(PathRequest::new(&testdir, FileFlags::READ | FileFlags::CREATE));
    let f = dispatcher.file(PathRequest::after(&mk, testdir.join("foo"), rw_create()));
    let grow = dispatcher.truncate(TruncateRequest::new(&f, 64));
    let w1 = dispatcher.write(DataRequest::single(&grow, 0, vec![b'n'; 64]));
    let s = dispatcher.sync(HandleRequest::new(&w1));
    let w2 = dispatcher.write(DataRequest::single(&s, 0, vec![b'n'; 64]));
    let c1 = dispatcher.close(HandleRequest::new(&w2));
    let o = dispatcher.file(PathRequest::after(&c1, testdir.join("foo"), FileFlags::READ));
    let (data, r) = dispatcher.read(DataRequest::single(&o, 0, vec![0u8; 12]));
    let c2 = dispatcher.close(HandleRequest::new(&r));
    let rf = dispatcher.rmfile(PathRequest::after(&c2, testdir.join("foo"), FileFlags::empty()));
    let rd = dispatcher.rmdir(PathRequest::after(&rf, &testdir, FileFlags::empty()));

    let ops = [mk, f, grow, w1, s, w2, c1, o, r, c2, rf, rd];
    let results = when_all(&ops).await.expect("no op in the pipeline fails");
    assert_eq!(results.len(), ops.len());

    let buffers = data.await.unwrap();
    assert_eq!(buffers.len(), 1);
    assert_eq!(&buffers[0][..], b"nnnnnnnnnnnn");

    // The pipeline removed everything it created.
    assert!(std::fs::metadata(&testdir).is_err());
}

#[tokio::test]
async fn create_collision() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();
    let testdir = temp.path().join("testdir");

    let mk = dispatcher.dir(PathRequest::new(&testdir, FileFlags::READ | FileFlags::CREATE));
    let flags = FileFlags::WRITE | FileFlags::CREATE_ONLY_IF_NOT_EXIST;
    let a1 = dispatcher.file(PathRequest::after(&mk, testdir.join("a"), flags));
    let a2 = dispatcher.file(PathRequest::after(&mk, testdir.join("a"), flags));

    let results = when_all_settled(&[a1.clone(), a2.clone()]).await;
    let failures: Vec<_> = results.iter().filter(|r| r.is_err()).collect();
    assert_eq!(failures.len(), 1, "exactly one create must collide");
    assert!(
        matches!(failures[0], Err(Error::AlreadyExists { .. })),
        "collision surfaces as already-exists: {failures:?}"
    );

    // A barrier replicates each input's state into its matching output.
    let outputs = dispatcher.barrier(&[a1.clone(), a2.clone()]);
    let outcomes = when_all_settled(&outputs).await;
    let inputs = when_all_settled(&[a1, a2]).await;
    for (input, output) in inputs.iter().zip(&outcomes) {
        assert_eq!(input.is_err(), output.is_err());
    }
}

#[tokio::test]
async fn barrier_groups() {
    let dispatcher = Dispatcher::new(4, FileFlags::empty(), FileFlags::empty());

    // Deterministic group sizes.
    let mut seed = 0x9E37_79B9u64;
    let mut next_size = move || {
        seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((seed >> 33) % 24 + 1) as usize
    };

    let mut previous_verify: Option<Op> = None;
    let mut verifications = Vec::new();

    for _ in 0..40 {
        let size = next_size();
        let counter = Arc::new(AtomicUsize::new(0));

        let group: Vec<Op> = (0..size)
            .map(|_| {
                let counter = Arc::clone(&counter);
                let (_, op) = dispatcher.call(previous_verify.as_ref(), move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
                op
            })
            .collect();

        let fence = dispatcher.barrier(&group);
        let counter = Arc::clone(&counter);
        let (seen, verify) = dispatcher.call(Some(&fence[0]), move || {
            counter.load(Ordering::SeqCst)
        });

        verifications.push((seen, size));
        previous_verify = Some(verify);
    }

    for (seen, size) in verifications {
        let seen = seen.await.expect("verification call must not fault");
        assert_eq!(seen, size, "barrier released before the whole group ran");
    }
}

#[tokio::test]
async fn fsync_ordering() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();

    let ordered = rw_create()
        | FileFlags::ENFORCE_DEPENDENCY_WRITE_ORDER
        | FileFlags::WILL_BE_SEQUENTIALLY_ACCESSED;

    let f1 = dispatcher.file(PathRequest::new(temp.path().join("first"), ordered));
    let grow1 = dispatcher.truncate(TruncateRequest::new(&f1, 64));
    let w1 = dispatcher.write(DataRequest::single(&grow1, 0, vec![b'a'; 64]));
    let c1 = dispatcher.close(HandleRequest::new(&w1));

    // F2 is opened only once F1 is closed, so its writes and close are
    // transitively ordered behind F1's durability.
    let f2 = dispatcher.file(PathRequest::after(&c1, temp.path().join("second"), ordered));
    let grow2 = dispatcher.truncate(TruncateRequest::new(&f2, 64));
    let w2 = dispatcher.write(DataRequest::single(&grow2, 0, vec![b'b'; 64]));
    let c2 = dispatcher.close(HandleRequest::new(&w2));

    let closed = must_handle(&c2).await;
    assert!(closed.is_tombstone());

    // The upgrade made the sequential files always-sync.
    let h1 = must_handle(&f1).await;
    assert!(h1.flags().contains(FileFlags::ALWAYS_SYNC));

    // F1's close resolved (successfully) before F2's close could.
    use futures::FutureExt;
    let first_close = c1
        .future()
        .now_or_never()
        .expect("transitive precondition resolved first");
    assert!(first_close.is_ok());
}

#[tokio::test]
async fn enumerate_batches() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();
    let dir_path = temp.path().join("busy");

    let mk = dispatcher.dir(PathRequest::new(&dir_path, FileFlags::READ | FileFlags::CREATE));
    must_handle(&mk).await;

    let mut expected: Vec<String> = (0..1000).map(|i| format!("file-{i:04}")).collect();

    // Create in waves so at most a wave's worth of descriptors is open.
    for wave in expected.chunks(100) {
        let closes: Vec<Op> = wave
            .iter()
            .map(|name| {
                let f = dispatcher.file(PathRequest::after(
                    &mk,
                    dir_path.join(name),
                    FileFlags::WRITE | FileFlags::CREATE,
                ));
                dispatcher.close(HandleRequest::new(&f))
            })
            .collect();
        when_all(&closes).await.expect("creation wave failed");
    }

    // A unique handle keeps our enumeration cursor private.
    let list_dir = dispatcher.dir(PathRequest::new(
        &dir_path,
        FileFlags::READ | FileFlags::UNIQUE_DIRECTORY_HANDLE,
    ));

    let mut seen = Vec::new();
    let mut restart = true;
    loop {
        let (batch, op) = dispatcher.enumerate(
            EnumerateRequest::new(&list_dir).restart(restart).max_items(
                crate::DirectoryEntry::compatibility_maximum(),
            ),
        );
        must_handle(&op).await;
        let (entries, more) = batch.await.unwrap();
        restart = false;

        for entry in entries {
            assert_ne!(entry.name, ".");
            assert_ne!(entry.name, "..");
            seen.push(entry.name);
        }
        if !more {
            break;
        }
    }

    seen.sort();
    expected.sort();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn precondition_exception_propagation() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();

    // The parent directory does not exist.
    let orphan = temp.path().join("missing").join("child");
    let f = dispatcher.file(PathRequest::new(&orphan, rw_create()));
    let w = dispatcher.write(DataRequest::single(&f, 0, vec![1, 2, 3]));

    let create_err = f.wait().await.unwrap_err();
    assert!(matches!(create_err, Error::NotFound { .. }));

    // The write inherits the exact same exception.
    let write_err = w.wait().await.unwrap_err();
    assert_eq!(create_err.to_string(), write_err.to_string());
}

#[tokio::test]
async fn empty_batches_enqueue_nothing() {
    let dispatcher = new_test();
    assert!(dispatcher.dir_batch(Vec::new()).is_empty());
    assert!(dispatcher.file_batch(Vec::new()).is_empty());
    assert!(dispatcher.barrier(&[]).is_empty());
    assert_eq!(dispatcher.wait_queue_depth(), 0);
}

#[tokio::test]
async fn zero_byte_reads_are_rejected() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();

    let f = dispatcher.file(PathRequest::new(temp.path().join("f"), rw_create()));

    let (_, none) = dispatcher.read(DataRequest::new(&f, 0, Vec::new()));
    assert!(matches!(
        none.wait().await,
        Err(Error::InvalidArgument(_))
    ));

    let (_, empty_frag) = dispatcher.read(DataRequest::new(&f, 0, vec![Vec::new()]));
    assert!(matches!(
        empty_frag.wait().await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn writes_do_not_extend() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();

    let f = dispatcher.file(PathRequest::new(temp.path().join("fixed"), rw_create()));
    let grow = dispatcher.truncate(TruncateRequest::new(&f, 8));

    let inside = dispatcher.write(DataRequest::single(&grow, 0, vec![0xAB; 8]));
    assert!(inside.wait().await.is_ok());

    let past = dispatcher.write(DataRequest::single(&grow, 4, vec![0xCD; 8]));
    assert!(matches!(
        past.wait().await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn reads_past_eof_fail() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();

    let f = dispatcher.file(PathRequest::new(temp.path().join("short"), rw_create()));
    let grow = dispatcher.truncate(TruncateRequest::new(&f, 10));

    let (_, read) = dispatcher.read(DataRequest::single(&grow, 0, vec![0u8; 20]));
    assert!(matches!(read.wait().await, Err(Error::EndOfFile { .. })));
}

#[tokio::test]
async fn gather_write_splits_past_vector_limit() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();

    // More fragments than any platform's vectored-I/O limit.
    let fragments: Vec<Vec<u8>> = (0..2000u32).map(|i| vec![(i % 251) as u8]).collect();
    let flat: Vec<u8> = fragments.iter().flatten().copied().collect();

    let f = dispatcher.file(PathRequest::new(temp.path().join("wide"), rw_create()));
    let grow = dispatcher.truncate(TruncateRequest::new(&f, fragments.len() as u64));
    let w = dispatcher.write(DataRequest::new(&grow, 0, fragments));
    let (data, r) = dispatcher.read(DataRequest::single(&w, 0, vec![0u8; flat.len()]));

    assert!(r.wait().await.is_ok());
    let buffers = data.await.unwrap();
    assert_eq!(buffers[0], flat);
}

#[tokio::test]
async fn write_then_read_roundtrip() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();

    let f = dispatcher.file(PathRequest::new(temp.path().join("roundtrip"), rw_create()));
    let grow = dispatcher.truncate(TruncateRequest::new(&f, 26));
    let alphabet: Vec<u8> = (b'a'..=b'z').collect();
    let w = dispatcher.write(DataRequest::single(&grow, 0, alphabet.clone()));
    let (data, _r) = dispatcher.read(DataRequest::single(&w, 0, vec![0u8; 26]));

    assert_eq!(data.await.unwrap()[0], alphabet);

    let handle = must_handle(&f).await;
    assert_eq!(handle.write_count(), 26);
    assert_eq!(handle.read_count(), 26);
}

#[tokio::test]
async fn mkdir_rmdir_restores_tree() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();
    let path = temp.path().join("ephemeral");

    let mk = dispatcher.dir(PathRequest::new(&path, FileFlags::READ | FileFlags::CREATE));
    let rm = dispatcher.rmdir(PathRequest::after(&mk, &path, FileFlags::empty()));

    let tombstone = must_handle(&rm).await;
    assert!(tombstone.is_tombstone());
    assert!(tombstone.is_directory());
    assert!(std::fs::metadata(&path).is_err());
}

#[tokio::test]
async fn adopt_resolves_immediately() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();

    let f = dispatcher.file(PathRequest::new(temp.path().join("adoptee"), rw_create()));
    let handle = must_handle(&f).await;

    use futures::FutureExt;
    let adopted = dispatcher.adopt(handle.clone());
    let result = adopted
        .future()
        .now_or_never()
        .expect("adopt completes at submission");
    assert_eq!(result.unwrap().unwrap().path(), handle.path());
}

#[tokio::test]
async fn call_passes_the_precondition_handle_through() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();

    let f = dispatcher.file(PathRequest::new(temp.path().join("carried"), rw_create()));
    let (value, op) = dispatcher.call(Some(&f), || 40 + 2);

    assert_eq!(value.await.unwrap(), 42);
    let carried = must_handle(&op).await;
    assert_eq!(carried.path(), must_handle(&f).await.path());
}

#[tokio::test]
async fn panicking_call_faults_its_op() {
    let dispatcher = new_test();

    let (value, op) = dispatcher.call::<(), _>(None, || panic!("deliberate"));
    assert!(matches!(value.await, Err(Error::Aborted(_))));
    assert!(matches!(op.wait().await, Err(Error::Aborted(_))));

    // The worker survived; the dispatcher still runs ops.
    let (ok, _) = dispatcher.call(None, || 7);
    assert_eq!(ok.await.unwrap(), 7);
}

#[tokio::test]
async fn when_any_yields_the_first_completion() {
    let dispatcher = new_test();

    let (_, slow) = dispatcher.call(None, || {
        std::thread::sleep(std::time::Duration::from_millis(250));
    });
    let (_, fast) = dispatcher.call(None, || {});

    let (index, result) = when_any(&[slow, fast]).await;
    assert_eq!(index, 1);
    assert!(result.is_ok());
}

#[tokio::test]
async fn deferred_completion_resolves_later() {
    let dispatcher = new_test();

    let op = dispatcher.completion(
        None,
        crate::CompletionFlags::IMMEDIATE,
        Box::new(|_id, _input| Ok(crate::CompletionState::Pending)),
    );

    // Extant and pending: recoverable through its id.
    let recovered = dispatcher.op_from_id(op.id()).unwrap();
    assert_eq!(recovered.id(), op.id());

    let remote = dispatcher.clone();
    let id = op.id();
    std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        remote.complete(id, Ok(None));
    });

    assert!(op.wait().await.is_ok());
    // Drained: no longer recoverable.
    assert!(dispatcher.op_from_id(id).is_err());
}

#[tokio::test]
async fn handle_registry_tracks_native_handles() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();

    let f = dispatcher.file(PathRequest::new(temp.path().join("tracked"), rw_create()));
    let handle = must_handle(&f).await;
    let native = handle.native().unwrap();

    let recovered = dispatcher.handle_from_native(native).unwrap();
    assert_eq!(recovered.path(), handle.path());
    assert_eq!(dispatcher.fd_count(), 1);

    let c = dispatcher.close(HandleRequest::new(&f));
    must_handle(&c).await;

    assert!(handle.is_tombstone());
    assert!(dispatcher.handle_from_native(native).is_none());
    assert_eq!(dispatcher.fd_count(), 0);
}

#[tokio::test]
async fn directory_handles_are_cached() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();
    let path = temp.path().join("shared");

    let mk = dispatcher.dir(PathRequest::new(&path, FileFlags::READ | FileFlags::CREATE));
    must_handle(&mk).await;

    let d1 = dispatcher.dir(PathRequest::new(&path, FileFlags::READ));
    let d2 = dispatcher.dir(PathRequest::new(&path, FileFlags::READ));
    let h1 = must_handle(&d1).await;
    let h2 = must_handle(&d2).await;
    assert_eq!(h1.native(), h2.native(), "read-only opens share one handle");

    let unique = dispatcher.dir(PathRequest::new(
        &path,
        FileFlags::READ | FileFlags::UNIQUE_DIRECTORY_HANDLE,
    ));
    let h3 = must_handle(&unique).await;
    assert_ne!(h1.native(), h3.native(), "unique handles bypass the cache");
}

#[tokio::test]
async fn enumerate_filters_with_globs() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();
    let dir_path = temp.path().join("logs");

    let mk = dispatcher.dir(PathRequest::new(&dir_path, FileFlags::READ | FileFlags::CREATE));
    for name in ["app.log", "db.log", "notes.txt"] {
        let f = dispatcher.file(PathRequest::after(
            &mk,
            dir_path.join(name),
            FileFlags::WRITE | FileFlags::CREATE,
        ));
        let c = dispatcher.close(HandleRequest::new(&f));
        must_handle(&c).await;
    }

    let list_dir = dispatcher.dir(PathRequest::new(
        &dir_path,
        FileFlags::READ | FileFlags::UNIQUE_DIRECTORY_HANDLE,
    ));
    let (batch, _) = dispatcher.enumerate(EnumerateRequest::new(&list_dir).glob("*.log"));
    let (entries, more) = batch.await.unwrap();
    assert!(!more);

    let mut names: Vec<_> = entries.into_iter().map(|e| e.name).collect();
    names.sort();
    assert_eq!(names, vec!["app.log", "db.log"]);
}

#[tokio::test]
async fn enumerate_resumes_across_batches() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();
    let dir_path = temp.path().join("paged");

    let mk = dispatcher.dir(PathRequest::new(&dir_path, FileFlags::READ | FileFlags::CREATE));
    for i in 0..5 {
        let f = dispatcher.file(PathRequest::after(
            &mk,
            dir_path.join(format!("entry-{i}")),
            FileFlags::WRITE | FileFlags::CREATE,
        ));
        let c = dispatcher.close(HandleRequest::new(&f));
        must_handle(&c).await;
    }

    let list_dir = dispatcher.dir(PathRequest::new(
        &dir_path,
        FileFlags::READ | FileFlags::UNIQUE_DIRECTORY_HANDLE,
    ));

    // maxitems of 1 is legal, just slow.
    let mut seen = Vec::new();
    let mut restart = true;
    loop {
        let (batch, _) =
            dispatcher.enumerate(EnumerateRequest::new(&list_dir).restart(restart).max_items(1));
        let (entries, more) = batch.await.unwrap();
        restart = false;
        seen.extend(entries.into_iter().map(|e| e.name));
        if !more {
            break;
        }
    }

    seen.sort();
    assert_eq!(seen, (0..5).map(|i| format!("entry-{i}")).collect::<Vec<_>>());
}

#[tokio::test]
async fn zero_max_items_is_rejected() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();

    let mk = dispatcher.dir(PathRequest::new(
        temp.path().join("d"),
        FileFlags::READ | FileFlags::CREATE,
    ));
    let (batch, op) = dispatcher.enumerate(EnumerateRequest::new(&mk).max_items(0));
    assert!(matches!(op.wait().await, Err(Error::InvalidArgument(_))));
    assert!(batch.await.is_err());
}

#[tokio::test]
async fn mmap_reads_serve_from_memory() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();
    let path = temp.path().join("mapped");

    let f = dispatcher.file(PathRequest::new(&path, rw_create()));
    let grow = dispatcher.truncate(TruncateRequest::new(&f, 16));
    let w = dispatcher.write(DataRequest::single(&grow, 0, b"0123456789abcdef".to_vec()));
    let c = dispatcher.close(HandleRequest::new(&w));
    must_handle(&c).await;

    let mapped = dispatcher.file(PathRequest::new(&path, FileFlags::READ | FileFlags::OS_MMAP));
    let (data, r) = dispatcher.read(DataRequest::single(&mapped, 4, vec![0u8; 8]));
    assert!(r.wait().await.is_ok());
    assert_eq!(&data.await.unwrap()[0][..], b"456789ab");

    // Reading past the mapped extent is end-of-file, same as the syscall path.
    let (_, past) = dispatcher.read(DataRequest::single(&mapped, 12, vec![0u8; 8]));
    assert!(matches!(past.wait().await, Err(Error::EndOfFile { .. })));
}

#[tokio::test]
async fn symlinks_follow_their_precondition() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();

    let target = dispatcher.file(PathRequest::new(temp.path().join("original"), rw_create()));
    let link = dispatcher.symlink(PathRequest::after(
        &target,
        temp.path().join("alias"),
        FileFlags::empty(),
    ));

    let link_handle = must_handle(&link).await;
    assert!(link_handle.is_symlink());
    assert_eq!(
        link_handle.target().unwrap(),
        must_handle(&target).await.path()
    );

    let rm = dispatcher.rmsymlink(PathRequest::after(
        &link,
        temp.path().join("alias"),
        FileFlags::empty(),
    ));
    let tombstone = must_handle(&rm).await;
    assert!(tombstone.is_tombstone());
    assert!(std::fs::symlink_metadata(temp.path().join("alias")).is_err());
}

#[tokio::test]
async fn dropping_the_last_reference_closes_the_file() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();

    let native = {
        let f = dispatcher.file(PathRequest::new(
            temp.path().join("dropped"),
            rw_create() | FileFlags::SYNC_ON_CLOSE,
        ));
        let grow = dispatcher.truncate(TruncateRequest::new(&f, 4));
        let w = dispatcher.write(DataRequest::single(&grow, 0, vec![9; 4]));

        let handle = must_handle(&w).await;
        let native = handle.native().unwrap();
        assert_eq!(dispatcher.fd_count(), 1);
        native
        // All ops and handles drop here.
    };

    assert_eq!(dispatcher.fd_count(), 0);
    assert!(dispatcher.handle_from_native(native).is_none());
    // The flush-on-drop made the write durable before close.
    assert_eq!(std::fs::read(temp.path().join("dropped")).unwrap(), vec![9; 4]);
}

#[tokio::test]
async fn barrier_faults_already_failed_inputs_immediately() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = new_test();

    // An input resolved to an error before the barrier ever sees it.
    let orphan = temp.path().join("absent").join("child");
    let failed = dispatcher.file(PathRequest::new(&orphan, rw_create()));
    let failed_err = failed.wait().await.unwrap_err();

    // A healthy input that will not complete for a while.
    let (_, slow) = dispatcher.call(None, || {
        std::thread::sleep(std::time::Duration::from_millis(200));
    });

    let outputs = dispatcher.barrier(&[failed, slow.clone()]);

    // The failed input's output faulted at submission, without waiting on
    // the slow input.
    use futures::FutureExt;
    let early = outputs[0]
        .future()
        .now_or_never()
        .expect("already-failed input faults its output at submission")
        .unwrap_err();
    assert_eq!(early.to_string(), failed_err.to_string());
    assert!(
        slow.future().now_or_never().is_none(),
        "the other input is still in flight"
    );

    // The healthy input's output is untouched by the early fault.
    assert!(outputs[1].wait().await.is_ok());
}

#[tokio::test]
async fn barrier_outputs_wait_for_every_input() {
    let dispatcher = new_test();

    let slow_ran = Arc::new(AtomicUsize::new(0));
    let slow_flag = Arc::clone(&slow_ran);
    let (_, slow) = dispatcher.call(None, move || {
        std::thread::sleep(std::time::Duration::from_millis(150));
        slow_flag.store(1, Ordering::SeqCst);
    });
    let (_, fast) = dispatcher.call(None, || {});

    let outputs = dispatcher.barrier(&[fast, slow]);
    // The fast input's output still waits for the slow input.
    outputs[0].wait().await.unwrap();
    assert_eq!(slow_ran.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn force_masks_adjust_request_flags() {
    let temp = tempfile::TempDir::new().unwrap();
    let dispatcher = Dispatcher::new(2, FileFlags::SYNC_ON_CLOSE, FileFlags::OS_MMAP);

    assert_eq!(
        dispatcher.fileflags(FileFlags::READ | FileFlags::OS_MMAP),
        FileFlags::READ | FileFlags::SYNC_ON_CLOSE
    );

    let f = dispatcher.file(PathRequest::new(temp.path().join("forced"), rw_create()));
    let handle = must_handle(&f).await;
    assert!(handle.flags().contains(FileFlags::SYNC_ON_CLOSE));
}
