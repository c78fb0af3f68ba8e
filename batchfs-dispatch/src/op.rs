//! Op identifiers, records, and the public op reference.

use bitflags::bitflags;
use derivative::Derivative;

use crate::handle::Handle;
use crate::task::{OpFuture, OpTask};
use crate::Error;

/// Unique identifier for a scheduled op.
///
/// Monotone, non-zero, and never reused while the process runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub(crate) u64);

impl OpId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The filesystem action an op performs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Verb {
    Dir,
    RmDir,
    File,
    RmFile,
    Symlink,
    RmSymlink,
    Sync,
    Close,
    Read,
    Write,
    Truncate,
    Enumerate,
    Adopt,
    Completion,
    Call,
    Barrier,
}

bitflags! {
    /// Scheduling flags for a registered completion.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct CompletionFlags: u32 {
        /// Invoke the completion on the thread that resolves its
        /// precondition, instead of re-submitting to the worker pool. Only
        /// suitable for handlers that cannot block.
        const IMMEDIATE = 1 << 0;
    }
}

/// What an op resolves to: the produced handle (if any) or the error.
pub type OpResult = Result<Option<Handle>, Error>;

/// What a completion handler reports back to the engine.
pub enum CompletionState {
    /// The op is finished and resolves to this handle.
    Resolved(Option<Handle>),
    /// The op stays pending; the handler has arranged for
    /// [`Dispatcher::complete`] to be called later.
    ///
    /// [`Dispatcher::complete`]: crate::dispatcher::Dispatcher::complete
    Pending,
}

/// A bound completion handler.
///
/// Receives the id of the op it completes and its precondition's result. A
/// precondition failure arrives as `Err`; returning that error (the `?`
/// default) propagates it into this op's future, or the handler may swallow
/// it and produce a result of its own.
pub type CompletionFn =
    Box<dyn FnOnce(OpId, OpResult) -> Result<CompletionState, Error> + Send + 'static>;

/// Reference to a scheduled op.
///
/// Clones are cheap and all observe the same shared future. Holding an `Op`
/// does not keep its dispatcher alive or block its completion.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct Op {
    pub(crate) id: OpId,
    #[derivative(Debug = "ignore")]
    pub(crate) future: OpFuture,
}

impl Op {
    /// This op's unique id.
    pub fn id(&self) -> OpId {
        self.id
    }

    /// A clone of this op's shared future.
    pub fn future(&self) -> OpFuture {
        self.future.clone()
    }

    /// Wait for the op to resolve.
    pub async fn wait(&self) -> OpResult {
        self.future().await
    }
}

/// A completion waiting on some op, chained behind it in the op table.
#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct PendingCompletion {
    /// The downstream op this completion resolves.
    pub(crate) id: OpId,
    pub(crate) flags: CompletionFlags,
    #[derivative(Debug = "ignore")]
    pub(crate) f: CompletionFn,
}

/// Per-op state held in the op table while the op is extant.
#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct OpRecord {
    pub(crate) verb: Verb,
    /// Completion side of this op's future.
    pub(crate) task: OpTask,
    /// Completions to dispatch when this op resolves.
    pub(crate) completions: Vec<PendingCompletion>,
}
