//! The op-graph dispatcher: worker pool, completion engine, and verb adapters.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::FutureExt;
use tokio::sync::oneshot;

use crate::handle::{Handle, HandleInner, HandleKind};
use crate::op::{
    CompletionFlags, CompletionFn, CompletionState, Op, OpId, OpRecord, OpResult,
    PendingCompletion, Verb,
};
use crate::platform::{
    AccessPattern, FileFlags, FilesystemPlatform, MetadataFlags, Platform, PlatformHandleType,
    PlatformPath, PlatformPathType,
};
use crate::request::{DataRequest, EnumerateRequest, HandleRequest, PathRequest, TruncateRequest};
use crate::task::{OpTask, ValueFuture};
use crate::{DirectoryEntry, Error};

/// Worker pool the dispatcher runs filesystem work on.
///
/// Most filesystem operations are not truly asynchronous, so instead we spawn
/// a thread-pool and run the blocking operations there. A submitted callable
/// that panics is captured and surfaced through its op's future, never
/// allowed to take down a worker.
#[derive(Clone)]
pub struct IoWorker {
    /// Thread pool for spawning I/O.
    pool: Arc<rayon::ThreadPool>,
}

impl IoWorker {
    pub const DEFAULT_WORKER_COUNT: usize = 8;

    pub fn new(num_threads: usize) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("batchfs-io-{i}"))
            .panic_handler(|payload| {
                let err = Error::from_panic(payload);
                tracing::error!(%err, "io worker panicked");
            })
            .build()
            .expect("failed to create threadpool");

        IoWorker {
            pool: Arc::new(pool),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Submit a callable and get a future of its result back.
    ///
    /// The receiver resolves to `Err` only if the pool shuts down before the
    /// work runs.
    pub fn run_typed<T, W>(&self, work: W) -> oneshot::Receiver<T>
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let result = work();
            // We don't care about the receiver going away.
            let _ = tx.send(result);
        });
        rx
    }

    /// Fire-and-forget submission.
    pub(crate) fn spawn<W>(&self, work: W)
    where
        W: FnOnce() + Send + 'static,
    {
        self.pool.spawn(work);
    }
}

impl Default for IoWorker {
    fn default() -> Self {
        IoWorker::new(Self::DEFAULT_WORKER_COUNT)
    }
}

impl fmt::Debug for IoWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoWorker")
            .field("workers", &self.worker_count())
            .finish()
    }
}

/// The asynchronous batch file-I/O dispatcher.
///
/// Callers describe graphs of filesystem operations, each optionally gated on
/// one precondition op, and the dispatcher executes them concurrently on its
/// worker pool while preserving the declared ordering and failure semantics.
/// Submission never blocks; every verb returns an [`Op`] whose shared future
/// resolves to the produced [`Handle`] or the error.
///
/// Clones are cheap and share all state.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    pub(crate) inner: Arc<DispatcherInner>,
}

#[derive(Debug)]
pub(crate) struct DispatcherInner {
    pub(crate) worker: IoWorker,
    /// Every extant op, keyed by id. Mutations of a record's completion list
    /// happen under this lock; critical sections hold no I/O.
    pub(crate) ops: Mutex<HashMap<OpId, OpRecord>>,
    /// Next op id to hand out. Starts at 1; id 0 is never issued.
    pub(crate) next_id: AtomicU64,
    /// Weak map from native handle value to the live handle object.
    pub(crate) registry: Mutex<HashMap<PlatformHandleType, Weak<HandleInner>>>,
    /// Weak map from canonical directory path to a shared directory handle.
    pub(crate) dir_cache: Mutex<HashMap<PathBuf, Weak<HandleInner>>>,
    /// Flags OR'd into every request.
    pub(crate) force_on: FileFlags,
    /// Flags stripped from every request.
    pub(crate) force_off: FileFlags,
}

impl Dispatcher {
    /// Create a dispatcher with its own worker pool of `num_threads` workers.
    ///
    /// `force_on` and `force_off` adjust the flags of every submitted request
    /// before use.
    pub fn new(num_threads: usize, force_on: FileFlags, force_off: FileFlags) -> Self {
        Dispatcher::with_worker(IoWorker::new(num_threads), force_on, force_off)
    }

    /// Create a dispatcher on a caller-supplied worker pool.
    pub fn with_worker(worker: IoWorker, force_on: FileFlags, force_off: FileFlags) -> Self {
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                worker,
                ops: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                registry: Mutex::new(HashMap::new()),
                dir_cache: Mutex::new(HashMap::new()),
                force_on,
                force_off,
            }),
        }
    }

    /// The worker pool this dispatcher runs its filesystem work on.
    pub fn worker(&self) -> &IoWorker {
        &self.inner.worker
    }

    pub fn worker_count(&self) -> usize {
        self.inner.worker.worker_count()
    }

    /// File flags as they would be used after the force-on and force-off
    /// masks passed at construction.
    pub fn fileflags(&self, flags: FileFlags) -> FileFlags {
        (flags | self.inner.force_on) & !self.inner.force_off
    }

    /// The number of ops currently extant (submitted and not yet drained).
    pub fn wait_queue_depth(&self) -> usize {
        self.inner.ops.lock().expect("op table lock poisoned").len()
    }

    /// The number of live native handles opened through this dispatcher.
    pub fn fd_count(&self) -> usize {
        self.inner
            .registry
            .lock()
            .expect("handle registry lock poisoned")
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// An op ref for a currently scheduled op id.
    ///
    /// Fails if the id has already completed and been drained from the op
    /// table, or was never issued.
    pub fn op_from_id(&self, id: OpId) -> Result<Op, Error> {
        let ops = self.inner.ops.lock().expect("op table lock poisoned");
        ops.get(&id)
            .map(|record| Op {
                id,
                future: record.task.future(),
            })
            .ok_or_else(|| Error::invalid(format!("op {id} is not currently scheduled")))
    }

    /// Recover a live handle from its native handle value.
    pub fn handle_from_native(&self, native: PlatformHandleType) -> Option<Handle> {
        self.inner
            .registry
            .lock()
            .expect("handle registry lock poisoned")
            .get(&native)
            .and_then(|weak| weak.upgrade())
            .map(|inner| Handle { inner })
    }

    /// Schedule `f` to run when `precondition` completes (immediately, if it
    /// already has, or has no precondition).
    ///
    /// This is the raw completion interface: `f` may return
    /// [`CompletionState::Pending`] to defer, in which case it must arrange
    /// for [`Dispatcher::complete`] to be called with this op's id later.
    pub fn completion(
        &self,
        precondition: Option<&Op>,
        flags: CompletionFlags,
        f: CompletionFn,
    ) -> Op {
        self.submit(precondition, Verb::Completion, flags, f)
    }

    /// Batch form of [`Dispatcher::completion`].
    pub fn completion_batch(
        &self,
        callbacks: Vec<(Option<Op>, CompletionFlags, CompletionFn)>,
    ) -> Vec<Op> {
        callbacks
            .into_iter()
            .map(|(precondition, flags, f)| self.completion(precondition.as_ref(), flags, f))
            .collect()
    }

    /// Resolve a deferred op. The completion handler that returned
    /// [`CompletionState::Pending`] is responsible for eventually calling
    /// this exactly once.
    ///
    /// Panics if the id is not extant; resolving an op twice is an invariant
    /// violation, not an error.
    pub fn complete(&self, id: OpId, result: OpResult) {
        self.inner.complete_op(id, result);
    }

    /// Schedule `callable` to run when `precondition` completes, capturing
    /// its return value (or panic) into the returned future. The op resolves
    /// to its precondition's handle.
    pub fn call<R, F>(&self, precondition: Option<&Op>, callable: F) -> (ValueFuture<R>, Op)
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let f: CompletionFn = Box::new(move |_id, input| {
            let passthrough = match input {
                Ok(handle) => handle,
                Err(err) => {
                    let _ = tx.send(Err(err.clone()));
                    return Err(err);
                }
            };
            match panic::catch_unwind(AssertUnwindSafe(callable)) {
                Ok(value) => {
                    let _ = tx.send(Ok(value));
                    Ok(CompletionState::Resolved(passthrough))
                }
                Err(payload) => {
                    let err = Error::from_panic(payload);
                    let _ = tx.send(Err(err.clone()));
                    Err(err)
                }
            }
        });
        let op = self.submit(precondition, Verb::Call, CompletionFlags::empty(), f);
        (ValueFuture::new(rx), op)
    }

    /// Batch form of [`Dispatcher::call`].
    pub fn call_batch<R>(
        &self,
        callables: Vec<(Option<Op>, Box<dyn FnOnce() -> R + Send + 'static>)>,
    ) -> (Vec<ValueFuture<R>>, Vec<Op>)
    where
        R: Send + 'static,
    {
        callables
            .into_iter()
            .map(|(precondition, callable)| self.call(precondition.as_ref(), callable))
            .unzip()
    }

    /// Adopt a pre-constructed handle as if it were the result of an op. The
    /// returned op's future is already resolved to the supplied handle.
    pub fn adopt(&self, handle: Handle) -> Op {
        self.submit(
            None,
            Verb::Adopt,
            CompletionFlags::IMMEDIATE,
            Box::new(move |_id, _input| Ok(CompletionState::Resolved(Some(handle)))),
        )
    }

    /// Batch form of [`Dispatcher::adopt`].
    pub fn adopt_batch(&self, handles: Vec<Handle>) -> Vec<Op> {
        handles.into_iter().map(|h| self.adopt(h)).collect()
    }

    /// Create and/or open a directory.
    ///
    /// A shared read-only request is satisfied from the directory-handle
    /// cache when possible; pass `UNIQUE_DIRECTORY_HANDLE` to bypass it, e.g.
    /// for an independent enumeration cursor.
    pub fn dir(&self, req: PathRequest) -> Op {
        let flags = self.fileflags(req.flags);
        let path = req.path;
        let disp = Arc::downgrade(&self.inner);
        self.submit(
            req.precondition.as_ref(),
            Verb::Dir,
            CompletionFlags::empty(),
            Box::new(move |_id, input| {
                let _ = input?;
                let inner = upgrade(&disp)?;
                let handle = inner.do_dir(&path, flags)?;
                Ok(CompletionState::Resolved(Some(handle)))
            }),
        )
    }

    pub fn dir_batch(&self, reqs: Vec<PathRequest>) -> Vec<Op> {
        reqs.into_iter().map(|req| self.dir(req)).collect()
    }

    /// Remove an (empty) directory. The resulting handle is a tombstone.
    pub fn rmdir(&self, req: PathRequest) -> Op {
        self.remove(req, Verb::RmDir, HandleKind::Directory)
    }

    pub fn rmdir_batch(&self, reqs: Vec<PathRequest>) -> Vec<Op> {
        reqs.into_iter().map(|req| self.rmdir(req)).collect()
    }

    /// Create and/or open a file, fully honouring the request's flags.
    pub fn file(&self, req: PathRequest) -> Op {
        let flags = self.fileflags(req.flags);
        let path = req.path;
        let disp = Arc::downgrade(&self.inner);
        self.submit(
            req.precondition.as_ref(),
            Verb::File,
            CompletionFlags::empty(),
            Box::new(move |_id, input| {
                let _ = input?;
                let inner = upgrade(&disp)?;
                let handle = inner.do_file(&path, flags)?;
                Ok(CompletionState::Resolved(Some(handle)))
            }),
        )
    }

    pub fn file_batch(&self, reqs: Vec<PathRequest>) -> Vec<Op> {
        reqs.into_iter().map(|req| self.file(req)).collect()
    }

    /// Unlink a file. The resulting handle is a tombstone.
    pub fn rmfile(&self, req: PathRequest) -> Op {
        self.remove(req, Verb::RmFile, HandleKind::File)
    }

    pub fn rmfile_batch(&self, reqs: Vec<PathRequest>) -> Vec<Op> {
        reqs.into_iter().map(|req| self.rmfile(req)).collect()
    }

    /// Create a symbolic link at the request's path. The link target is the
    /// path of the handle produced by the precondition op.
    pub fn symlink(&self, req: PathRequest) -> Op {
        let flags = self.fileflags(req.flags);
        let path = req.path;
        let disp = Arc::downgrade(&self.inner);
        self.submit(
            req.precondition.as_ref(),
            Verb::Symlink,
            CompletionFlags::empty(),
            Box::new(move |_id, input| {
                let input = input?;
                let inner = upgrade(&disp)?;
                let target = input.map(|h| h.path().to_path_buf());
                let handle = inner.do_symlink(&path, flags, target)?;
                Ok(CompletionState::Resolved(Some(handle)))
            }),
        )
    }

    pub fn symlink_batch(&self, reqs: Vec<PathRequest>) -> Vec<Op> {
        reqs.into_iter().map(|req| self.symlink(req)).collect()
    }

    /// Unlink a symlink. The resulting handle is a tombstone.
    pub fn rmsymlink(&self, req: PathRequest) -> Op {
        self.remove(req, Verb::RmSymlink, HandleKind::Symlink)
    }

    pub fn rmsymlink_batch(&self, reqs: Vec<PathRequest>) -> Vec<Op> {
        reqs.into_iter().map(|req| self.rmsymlink(req)).collect()
    }

    /// Force durability of everything written through the precondition's
    /// handle since its last sync.
    pub fn sync(&self, req: HandleRequest) -> Op {
        self.submit(
            Some(&req.precondition),
            Verb::Sync,
            CompletionFlags::empty(),
            Box::new(move |_id, input| {
                let handle = require_handle(input?, "sync")?;
                let fd = handle.require_native()?;
                FilesystemPlatform::fsync(fd, handle.path())?;
                handle.mark_synced();
                Ok(CompletionState::Resolved(Some(handle)))
            }),
        )
    }

    pub fn sync_batch(&self, reqs: Vec<HandleRequest>) -> Vec<Op> {
        reqs.into_iter().map(|req| self.sync(req)).collect()
    }

    /// Release the precondition's handle, syncing first if it was opened
    /// with `SYNC_ON_CLOSE` and has unflushed writes. The handle object
    /// becomes a tombstone.
    pub fn close(&self, req: HandleRequest) -> Op {
        self.submit(
            Some(&req.precondition),
            Verb::Close,
            CompletionFlags::empty(),
            Box::new(move |_id, input| {
                let handle = require_handle(input?, "close")?;
                let flush = handle.flags().contains(FileFlags::SYNC_ON_CLOSE);
                handle.close_resources(flush)?;
                Ok(CompletionState::Resolved(Some(handle)))
            }),
        )
    }

    pub fn close_batch(&self, reqs: Vec<HandleRequest>) -> Vec<Op> {
        reqs.into_iter().map(|req| self.close(req)).collect()
    }

    /// Scatter-read from the precondition's handle. Each buffer is filled in
    /// full or the op fails; the filled buffers come back through the
    /// returned future, and the op resolves to the file handle.
    pub fn read(&self, req: DataRequest) -> (ValueFuture<Vec<Vec<u8>>>, Op) {
        let (tx, rx) = oneshot::channel();
        let DataRequest {
            precondition,
            offset,
            buffers,
        } = req;
        let disp = Arc::downgrade(&self.inner);
        let op = self.submit(
            Some(&precondition),
            Verb::Read,
            CompletionFlags::empty(),
            Box::new(move |_id, input| {
                let result: Result<(Handle, Vec<Vec<u8>>), Error> = (|| {
                    let handle = require_handle(input?, "read")?;
                    let inner = upgrade(&disp)?;
                    let buffers = inner.do_read(&handle, offset, buffers)?;
                    Ok((handle, buffers))
                })();
                match result {
                    Ok((handle, buffers)) => {
                        let _ = tx.send(Ok(buffers));
                        Ok(CompletionState::Resolved(Some(handle)))
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err.clone()));
                        Err(err)
                    }
                }
            }),
        );
        (ValueFuture::new(rx), op)
    }

    pub fn read_batch(&self, reqs: Vec<DataRequest>) -> Vec<(ValueFuture<Vec<Vec<u8>>>, Op)> {
        reqs.into_iter().map(|req| self.read(req)).collect()
    }

    /// Gather-write to the precondition's handle. Writes never extend the
    /// file; use [`Dispatcher::truncate`] to grow it first.
    pub fn write(&self, req: DataRequest) -> Op {
        let DataRequest {
            precondition,
            offset,
            buffers,
        } = req;
        let disp = Arc::downgrade(&self.inner);
        self.submit(
            Some(&precondition),
            Verb::Write,
            CompletionFlags::empty(),
            Box::new(move |_id, input| {
                let handle = require_handle(input?, "write")?;
                let inner = upgrade(&disp)?;
                inner.do_write(&handle, offset, buffers)?;
                Ok(CompletionState::Resolved(Some(handle)))
            }),
        )
    }

    pub fn write_batch(&self, reqs: Vec<DataRequest>) -> Vec<Op> {
        reqs.into_iter().map(|req| self.write(req)).collect()
    }

    /// Set the precondition handle's file length to exactly the given size,
    /// extending with zeroes if larger.
    pub fn truncate(&self, req: TruncateRequest) -> Op {
        let TruncateRequest { precondition, size } = req;
        self.submit(
            Some(&precondition),
            Verb::Truncate,
            CompletionFlags::empty(),
            Box::new(move |_id, input| {
                let handle = require_handle(input?, "truncate")?;
                let fd = handle.require_native()?;
                FilesystemPlatform::ftruncate(fd, size, handle.path())?;
                Ok(CompletionState::Resolved(Some(handle)))
            }),
        )
    }

    pub fn truncate_batch(&self, reqs: Vec<TruncateRequest>) -> Vec<Op> {
        reqs.into_iter().map(|req| self.truncate(req)).collect()
    }

    /// Produce up to `max_items` entries from the precondition's directory
    /// handle, optionally filtered by a shell glob. The batch and a
    /// "maybe more" flag come back through the returned future; the op
    /// resolves to the directory handle.
    ///
    /// Without `restart`, a call resumes where the previous one on the same
    /// handle left off. Concurrent enumerators on a shared cached handle race
    /// over the cursor; open with `UNIQUE_DIRECTORY_HANDLE` if that matters.
    pub fn enumerate(
        &self,
        req: EnumerateRequest,
    ) -> (ValueFuture<(Vec<DirectoryEntry>, bool)>, Op) {
        let (tx, rx) = oneshot::channel();
        let EnumerateRequest {
            precondition,
            max_items,
            restart,
            glob,
            metadata,
        } = req;
        let disp = Arc::downgrade(&self.inner);
        let op = self.submit(
            Some(&precondition),
            Verb::Enumerate,
            CompletionFlags::empty(),
            Box::new(move |_id, input| {
                let result: Result<(Handle, (Vec<DirectoryEntry>, bool)), Error> = (|| {
                    let handle = require_handle(input?, "enumerate")?;
                    let inner = upgrade(&disp)?;
                    let batch = inner.do_enumerate(&handle, max_items, restart, glob, metadata)?;
                    Ok((handle, batch))
                })();
                match result {
                    Ok((handle, batch)) => {
                        let _ = tx.send(Ok(batch));
                        Ok(CompletionState::Resolved(Some(handle)))
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err.clone()));
                        Err(err)
                    }
                }
            }),
        );
        (ValueFuture::new(rx), op)
    }

    pub fn enumerate_batch(
        &self,
        reqs: Vec<EnumerateRequest>,
    ) -> Vec<(ValueFuture<(Vec<DirectoryEntry>, bool)>, Op)> {
        reqs.into_iter().map(|req| self.enumerate(req)).collect()
    }

    /// Shared implementation of the remove verbs.
    fn remove(&self, req: PathRequest, verb: Verb, kind: HandleKind) -> Op {
        let flags = self.fileflags(req.flags);
        let path = req.path;
        let disp = Arc::downgrade(&self.inner);
        self.submit(
            req.precondition.as_ref(),
            verb,
            CompletionFlags::empty(),
            Box::new(move |_id, input| {
                let _ = input?;
                let inner = upgrade(&disp)?;
                let handle = inner.do_remove(&path, flags, kind)?;
                Ok(CompletionState::Resolved(Some(handle)))
            }),
        )
    }

    pub(crate) fn submit(
        &self,
        precondition: Option<&Op>,
        verb: Verb,
        flags: CompletionFlags,
        f: CompletionFn,
    ) -> Op {
        let id = self.inner.allocate_id();
        self.inner.submit_with_id(id, precondition, verb, flags, f)
    }
}

/// A handle is required for verbs that operate on their precondition's
/// product.
fn require_handle(input: Option<Handle>, verb: &str) -> Result<Handle, Error> {
    input.ok_or_else(|| {
        Error::invalid(format!(
            "{verb} requires a precondition op that produced a handle"
        ))
    })
}

fn upgrade(disp: &Weak<DispatcherInner>) -> Result<Arc<DispatcherInner>, Error> {
    disp.upgrade()
        .ok_or_else(|| Error::Aborted("dispatcher shut down".into()))
}

impl DispatcherInner {
    pub(crate) fn allocate_id(&self) -> OpId {
        OpId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a new op and either chain it behind its precondition or, if
    /// the precondition has already resolved (or there is none), dispatch it
    /// right away.
    pub(crate) fn submit_with_id(
        self: &Arc<Self>,
        id: OpId,
        precondition: Option<&Op>,
        verb: Verb,
        flags: CompletionFlags,
        f: CompletionFn,
    ) -> Op {
        let task = OpTask::new();
        let op = Op {
            id,
            future: task.future(),
        };

        let mut pending = Some(PendingCompletion { id, flags, f });
        {
            let mut ops = self.ops.lock().expect("op table lock poisoned");
            ops.insert(
                id,
                OpRecord {
                    verb,
                    task,
                    completions: Vec::new(),
                },
            );
            if let Some(pre) = precondition {
                if let Some(record) = ops.get_mut(&pre.id()) {
                    record
                        .completions
                        .push(pending.take().expect("not yet chained"));
                }
            }
        }

        if let Some(pending) = pending {
            // The precondition left the op table before we chained, so its
            // future is already resolved and readable without waiting.
            let input = match precondition {
                None => Ok(None),
                Some(pre) => pre.future().now_or_never().unwrap_or_else(|| {
                    panic!("op {} missing from the op table but unresolved", pre.id())
                }),
            };
            self.dispatch(pending, input);
        }

        op
    }

    /// Run one completion, inline or on the worker pool per its flags.
    fn dispatch(self: &Arc<Self>, pending: PendingCompletion, input: OpResult) {
        let PendingCompletion { id, flags, f } = pending;
        if flags.contains(CompletionFlags::IMMEDIATE) {
            self.invoke(id, f, input);
        } else {
            let inner = Arc::clone(self);
            self.worker.spawn(move || inner.invoke(id, f, input));
        }
    }

    /// Invoke a completion handler and fold its outcome into the op's future.
    /// Panics in the handler become the op's error.
    fn invoke(self: &Arc<Self>, id: OpId, f: CompletionFn, input: OpResult) {
        match panic::catch_unwind(AssertUnwindSafe(move || f(id, input))) {
            Ok(Ok(CompletionState::Resolved(handle))) => self.complete_op(id, Ok(handle)),
            Ok(Ok(CompletionState::Pending)) => {}
            Ok(Err(err)) => self.complete_op(id, Err(err)),
            Err(payload) => self.complete_op(id, Err(Error::from_panic(payload))),
        }
    }

    /// Resolve an op: set its future, drain it from the table, and dispatch
    /// everything chained behind it.
    pub(crate) fn complete_op(self: &Arc<Self>, id: OpId, result: OpResult) {
        let completions = {
            let mut ops = self.ops.lock().expect("op table lock poisoned");
            let Some(mut record) = ops.remove(&id) else {
                panic!("op {id} resolved twice, or was never scheduled");
            };
            record.task.complete(result.clone());
            std::mem::take(&mut record.completions)
        };

        for pending in completions {
            self.dispatch(pending, result.clone());
        }
    }

    /// Look up a live, still-open cached handle for a canonical directory
    /// path, evicting the entry if it has expired.
    fn cached_dir(self: &Arc<Self>, canonical: &Path) -> Option<Handle> {
        let mut cache = self
            .dir_cache
            .lock()
            .expect("directory cache lock poisoned");
        match cache.get(canonical) {
            Some(weak) => match weak.upgrade() {
                Some(inner)
                    if inner
                        .state
                        .lock()
                        .expect("handle state lock poisoned")
                        .fd
                        .is_some() =>
                {
                    Some(Handle { inner })
                }
                _ => {
                    cache.remove(canonical);
                    None
                }
            },
            None => None,
        }
    }

    /// Open a shared handle to a directory, preferring the cache.
    fn shared_dir_handle(self: &Arc<Self>, path: &Path) -> Result<Handle, Error> {
        let ppath = PlatformPathType::try_new(path)?;
        let canonical = FilesystemPlatform::canonicalize(&ppath)?;
        if let Some(handle) = self.cached_dir(&canonical) {
            return Ok(handle);
        }

        let fd = FilesystemPlatform::open_directory(&ppath)?;
        let handle = Handle::new_native(
            self,
            None,
            canonical.clone(),
            FileFlags::READ,
            HandleKind::Directory,
            fd,
        );
        self.dir_cache
            .lock()
            .expect("directory cache lock poisoned")
            .insert(canonical, Arc::downgrade(&handle.inner));
        Ok(handle)
    }

    fn do_dir(self: &Arc<Self>, path: &Path, flags: FileFlags) -> Result<Handle, Error> {
        let shareable = !flags.intersects(
            FileFlags::WRITE
                | FileFlags::APPEND
                | FileFlags::TRUNCATE
                | FileFlags::CREATE
                | FileFlags::CREATE_ONLY_IF_NOT_EXIST
                | FileFlags::UNIQUE_DIRECTORY_HANDLE,
        );
        let ppath = PlatformPathType::try_new(path)?;

        if flags.intersects(FileFlags::CREATE | FileFlags::CREATE_ONLY_IF_NOT_EXIST) {
            match FilesystemPlatform::mkdir(&ppath) {
                Ok(()) => {}
                Err(err @ Error::AlreadyExists { .. }) => {
                    if flags.contains(FileFlags::CREATE_ONLY_IF_NOT_EXIST) {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }

        let canonical = FilesystemPlatform::canonicalize(&ppath)?;
        if shareable {
            if let Some(handle) = self.cached_dir(&canonical) {
                return Ok(handle);
            }
        }

        let fd = FilesystemPlatform::open_directory(&ppath)?;
        let handle = Handle::new_native(
            self,
            None,
            canonical.clone(),
            flags,
            HandleKind::Directory,
            fd,
        );
        if shareable {
            self.dir_cache
                .lock()
                .expect("directory cache lock poisoned")
                .insert(canonical, Arc::downgrade(&handle.inner));
        }
        Ok(handle)
    }

    fn do_file(self: &Arc<Self>, path: &Path, flags: FileFlags) -> Result<Handle, Error> {
        let flags = upgrade_write_order(flags);
        let ppath = PlatformPathType::try_new(path)?;
        let fd = FilesystemPlatform::open_file(&ppath, flags)?;

        let canonical = match FilesystemPlatform::canonicalize(&ppath) {
            Ok(canonical) => canonical,
            Err(err) => {
                let _ = FilesystemPlatform::close(fd, path);
                return Err(err);
            }
        };

        if flags.contains(FileFlags::WILL_BE_SEQUENTIALLY_ACCESSED) {
            FilesystemPlatform::advise(fd, AccessPattern::Sequential);
        } else if flags.contains(FileFlags::WILL_BE_RANDOMLY_ACCESSED) {
            FilesystemPlatform::advise(fd, AccessPattern::Random);
        }

        let dirh = if flags.contains(FileFlags::FAST_DIRECTORY_ENUMERATION) {
            match canonical.parent() {
                Some(parent) => Some(self.shared_dir_handle(parent)?),
                None => None,
            }
        } else {
            None
        };

        let handle = Handle::new_native(self, dirh, canonical, flags, HandleKind::File, fd);

        // Mapping is strictly an optimisation; a file that cannot be mapped
        // (e.g. empty) is still readable through the syscall path.
        if flags.contains(FileFlags::OS_MMAP)
            && !flags.intersects(FileFlags::WRITE | FileFlags::APPEND | FileFlags::TRUNCATE)
        {
            if let Ok((stat, _)) = FilesystemPlatform::fstat(fd, handle.path()) {
                if stat.size > 0 {
                    if let Ok(mapping) =
                        FilesystemPlatform::map_readonly(fd, stat.size as usize, handle.path())
                    {
                        handle
                            .inner
                            .state
                            .lock()
                            .expect("handle state lock poisoned")
                            .mapping = Some(mapping);
                    }
                }
            }
        }

        Ok(handle)
    }

    fn do_remove(
        self: &Arc<Self>,
        path: &Path,
        flags: FileFlags,
        kind: HandleKind,
    ) -> Result<Handle, Error> {
        let ppath = PlatformPathType::try_new(path)?;
        // Lexical normalisation only: resolving symlinks would change which
        // object the tombstone names, and the path is gone afterwards anyway.
        let absolute = std::path::absolute(path)
            .map_err(|err| Error::invalid(format!("cannot absolutize {}: {err}", path.display())))?;

        match kind {
            HandleKind::Directory => {
                FilesystemPlatform::rmdir(&ppath)?;
                self.dir_cache
                    .lock()
                    .expect("directory cache lock poisoned")
                    .remove(&absolute);
            }
            HandleKind::File | HandleKind::Symlink => FilesystemPlatform::unlink(&ppath)?,
        }

        Ok(Handle::new_tombstone(self, absolute, flags, kind))
    }

    fn do_symlink(
        self: &Arc<Self>,
        link: &Path,
        flags: FileFlags,
        target: Option<PathBuf>,
    ) -> Result<Handle, Error> {
        let target = target.ok_or_else(|| {
            Error::invalid("symlink requires a precondition op whose handle names the target")
        })?;
        let plink = PlatformPathType::try_new(link)?;
        let ptarget = PlatformPathType::try_new(&target)?;

        FilesystemPlatform::symlink(&ptarget, &plink)?;
        let fd = FilesystemPlatform::open_symlink(&plink)?;

        let absolute = std::path::absolute(link)
            .map_err(|err| Error::invalid(format!("cannot absolutize {}: {err}", link.display())))?;
        Ok(Handle::new_native(
            self,
            None,
            absolute,
            flags,
            HandleKind::Symlink,
            fd,
        ))
    }

    fn do_read(
        self: &Arc<Self>,
        handle: &Handle,
        offset: u64,
        mut buffers: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, Error> {
        validate_buffers(handle, offset, buffers.iter().map(|b| (b.as_ptr(), b.len())))?;

        if let Some(result) = handle.read_from_mapping(offset, &mut buffers) {
            let total = result?;
            handle.add_bytes_read(total as u64);
            return Ok(buffers);
        }

        let fd = handle.require_native()?;
        let total: u64 = buffers.iter().map(|b| b.len() as u64).sum();
        let (stat, _) = FilesystemPlatform::fstat(fd, handle.path())?;
        if offset.checked_add(total).map_or(true, |end| end > stat.size) {
            return Err(Error::EndOfFile {
                path: handle.path().to_string_lossy().into_owned().into_boxed_str(),
                offset,
            });
        }

        let iov_max = FilesystemPlatform::iov_max();
        let mut frag = 0usize;
        let mut intra = 0usize;
        let mut pos = offset;
        while frag < buffers.len() {
            let mut views: Vec<&mut [u8]> = Vec::new();
            for (i, buf) in buffers[frag..].iter_mut().take(iov_max).enumerate() {
                if i == 0 {
                    views.push(&mut buf[intra..]);
                } else {
                    views.push(&mut buf[..]);
                }
            }
            let n = FilesystemPlatform::read_vectored(fd, &mut views, pos, handle.path())?;
            drop(views);
            if n == 0 {
                // The file shrank underneath us after the size check.
                return Err(Error::EndOfFile {
                    path: handle.path().to_string_lossy().into_owned().into_boxed_str(),
                    offset: pos,
                });
            }
            pos += n as u64;
            advance_fragments(&buffers, &mut frag, &mut intra, n);
        }

        handle.add_bytes_read(total);
        Ok(buffers)
    }

    fn do_write(
        self: &Arc<Self>,
        handle: &Handle,
        offset: u64,
        buffers: Vec<Vec<u8>>,
    ) -> Result<(), Error> {
        validate_buffers(handle, offset, buffers.iter().map(|b| (b.as_ptr(), b.len())))?;

        let fd = handle.require_native()?;
        let total: u64 = buffers.iter().map(|b| b.len() as u64).sum();

        // Writes never extend the file; append-mode handles are positioned at
        // end of file by the OS and are exempt.
        if !handle.flags().contains(FileFlags::APPEND) {
            let (stat, _) = FilesystemPlatform::fstat(fd, handle.path())?;
            if offset.checked_add(total).map_or(true, |end| end > stat.size) {
                return Err(Error::invalid(format!(
                    "write of {total} bytes at offset {offset} would extend {}",
                    handle.path().display()
                )));
            }
        }

        let iov_max = FilesystemPlatform::iov_max();
        let mut frag = 0usize;
        let mut intra = 0usize;
        let mut pos = offset;
        while frag < buffers.len() {
            let mut views: Vec<&[u8]> = Vec::new();
            for (i, buf) in buffers[frag..].iter().take(iov_max).enumerate() {
                if i == 0 {
                    views.push(&buf[intra..]);
                } else {
                    views.push(&buf[..]);
                }
            }
            let n = FilesystemPlatform::write_vectored(fd, &views, pos, handle.path())?;
            drop(views);
            if n == 0 {
                return Err(Error::Aborted(
                    format!("write made no progress at offset {pos}").into_boxed_str(),
                ));
            }
            pos += n as u64;
            advance_fragments(&buffers, &mut frag, &mut intra, n);
        }

        handle.add_bytes_written(total);
        Ok(())
    }

    fn do_enumerate(
        self: &Arc<Self>,
        handle: &Handle,
        max_items: usize,
        restart: bool,
        glob: Option<String>,
        metadata: MetadataFlags,
    ) -> Result<(Vec<DirectoryEntry>, bool), Error> {
        if max_items == 0 {
            return Err(Error::invalid("enumerate max_items must be non-zero"));
        }
        if !handle.is_directory() {
            return Err(Error::invalid(format!(
                "enumerate requires a directory handle: {}",
                handle.path().display()
            )));
        }
        let matcher = glob
            .map(|pattern| {
                globset::Glob::new(&pattern)
                    .map(|g| g.compile_matcher())
                    .map_err(|err| Error::invalid(format!("invalid glob pattern: {err}")))
            })
            .transpose()?;

        let fd = handle.require_native()?;
        let mut entries = Vec::new();
        let mut more = true;
        {
            let mut state = handle
                .inner
                .state
                .lock()
                .expect("handle state lock poisoned");
            if state.cursor.is_none() {
                state.cursor = Some(FilesystemPlatform::open_dir_stream(fd, handle.path())?);
            }
            let cursor = state.cursor.as_mut().expect("cursor just ensured");
            if restart {
                FilesystemPlatform::rewind_dir_stream(cursor);
            }

            while entries.len() < max_items {
                match FilesystemPlatform::next_dir_entry(cursor)? {
                    None => {
                        more = false;
                        break;
                    }
                    Some(entry) => {
                        if entry.name == "." || entry.name == ".." {
                            continue;
                        }
                        if matcher.as_ref().is_some_and(|m| !m.is_match(&entry.name)) {
                            continue;
                        }
                        entries.push(entry);
                    }
                }
            }
        }

        // Fill any metadata the caller asked for beyond what the platform's
        // directory read returned for free. Entries that vanished between the
        // read and the stat keep their smaller mask.
        let extra = metadata & !FilesystemPlatform::metadata_fastpath();
        if !extra.is_empty() {
            for entry in &mut entries {
                let _ = entry.fetch_metadata(handle, metadata);
            }
        }

        Ok((entries, more))
    }
}

/// Apply the close/sync ordering upgrade: under
/// `ENFORCE_DEPENDENCY_WRITE_ORDER`, sequential files get `ALWAYS_SYNC` and
/// everything else gets `SYNC_ON_CLOSE`.
fn upgrade_write_order(flags: FileFlags) -> FileFlags {
    if !flags.contains(FileFlags::ENFORCE_DEPENDENCY_WRITE_ORDER) {
        return flags;
    }
    if flags.contains(FileFlags::WILL_BE_SEQUENTIALLY_ACCESSED) {
        flags | FileFlags::ALWAYS_SYNC
    } else {
        flags | FileFlags::SYNC_ON_CLOSE
    }
}

/// Common gather/scatter validation: at least one fragment, no empty
/// fragments, and page alignment of everything under direct I/O.
fn validate_buffers<I>(handle: &Handle, offset: u64, buffers: I) -> Result<(), Error>
where
    I: ExactSizeIterator<Item = (*const u8, usize)>,
{
    if buffers.len() == 0 {
        return Err(Error::invalid("transfer of zero buffers"));
    }

    let direct = handle.flags().contains(FileFlags::OS_DIRECT);
    let page = FilesystemPlatform::page_size() as u64;
    if direct && offset % page != 0 {
        return Err(Error::invalid(format!(
            "direct I/O offset {offset} is not page aligned"
        )));
    }

    for (ptr, len) in buffers {
        if len == 0 {
            return Err(Error::invalid("zero-length buffer in transfer"));
        }
        if direct && (ptr as u64 % page != 0 || len as u64 % page != 0) {
            return Err(Error::invalid(
                "direct I/O buffers must be page aligned and page sized",
            ));
        }
    }
    Ok(())
}

/// Advance the fragment cursor by `n` transferred bytes.
fn advance_fragments(buffers: &[Vec<u8>], frag: &mut usize, intra: &mut usize, mut n: usize) {
    while n > 0 && *frag < buffers.len() {
        let remaining = buffers[*frag].len() - *intra;
        if n >= remaining {
            n -= remaining;
            *frag += 1;
            *intra = 0;
        } else {
            *intra += n;
            n = 0;
        }
    }
}
