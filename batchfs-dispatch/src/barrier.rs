//! N-to-N and N-to-1 synchronisation over op futures.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{join_all, select_all, try_join_all};
use futures::FutureExt;

use crate::dispatcher::Dispatcher;
use crate::handle::Handle;
use crate::op::{CompletionFlags, CompletionState, Op, OpId, OpResult, Verb};
use crate::Error;

/// Shared coordination record for one barrier: a countdown latch plus a slot
/// per input.
struct BarrierState {
    /// Inputs still outstanding. An input's slot is always written before
    /// this is decremented, so whoever observes zero sees every slot.
    remaining: AtomicUsize,
    slots: Mutex<Vec<Option<OpResult>>>,
    /// Output op ids, index-matched to the inputs. `None` for an output that
    /// faulted at submission and takes no part in the countdown.
    outputs: Vec<Option<OpId>>,
}

impl Dispatcher {
    /// N-to-N fan-in: one output op per input op.
    ///
    /// Each output resolves with the same handle or error as its matching
    /// input, but no output resolves before every input has completed.
    /// Unlike precondition chaining, an input's failure does not
    /// short-circuit anything: it is replicated into the matching output
    /// only. The one exception is an input that has already failed by the
    /// time the barrier is submitted: its output faults there and then,
    /// without waiting on the rest.
    pub fn barrier(&self, ops: &[Op]) -> Vec<Op> {
        if ops.is_empty() {
            return Vec::new();
        }

        let count = ops.len();
        // Inputs already exceptioned at this moment fault their outputs
        // immediately; only failures from here on flow through the slots.
        let prefailed: Vec<Option<Error>> = ops
            .iter()
            .map(|op| match op.future().now_or_never() {
                Some(Err(err)) => Some(err),
                _ => None,
            })
            .collect();

        let ids: Vec<OpId> = (0..count).map(|_| self.inner.allocate_id()).collect();
        let live = prefailed.iter().filter(|pre| pre.is_none()).count();
        let state = Arc::new(BarrierState {
            remaining: AtomicUsize::new(live),
            slots: Mutex::new((0..count).map(|_| None).collect()),
            outputs: ids
                .iter()
                .zip(&prefailed)
                .map(|(&id, pre)| pre.is_none().then_some(id))
                .collect(),
        });

        ids.iter()
            .zip(ops)
            .zip(prefailed)
            .enumerate()
            .map(|(index, ((&id, input_op), prefail))| {
                if let Some(err) = prefail {
                    return self.inner.submit_with_id(
                        id,
                        None,
                        Verb::Barrier,
                        CompletionFlags::IMMEDIATE,
                        Box::new(move |_id, _input| Err(err)),
                    );
                }

                let state = Arc::clone(&state);
                let disp = Arc::downgrade(&self.inner);
                self.inner.submit_with_id(
                    id,
                    Some(input_op),
                    Verb::Barrier,
                    CompletionFlags::IMMEDIATE,
                    Box::new(move |_id, input| {
                        {
                            let mut slots =
                                state.slots.lock().expect("barrier slots lock poisoned");
                            slots[index] = Some(input);
                        }
                        if state.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            // Last outstanding input in: publish every slot
                            // into its matching output, our own included.
                            let Some(inner) = disp.upgrade() else {
                                return Ok(CompletionState::Pending);
                            };
                            let results: Vec<(OpId, OpResult)> = {
                                let mut slots =
                                    state.slots.lock().expect("barrier slots lock poisoned");
                                state
                                    .outputs
                                    .iter()
                                    .zip(slots.iter_mut())
                                    .filter_map(|(output, slot)| {
                                        let output = (*output)?;
                                        Some((
                                            output,
                                            slot.take().expect("barrier slot unfilled"),
                                        ))
                                    })
                                    .collect()
                            };
                            for (output, result) in results {
                                inner.complete_op(output, result);
                            }
                        }
                        Ok(CompletionState::Pending)
                    }),
                )
            })
            .collect()
    }
}

/// Wait for every op. Resolves to the handles in input order, or to the error
/// of the first-completed failing input.
pub fn when_all(ops: &[Op]) -> impl Future<Output = Result<Vec<Option<Handle>>, Error>> {
    let futures: Vec<_> = ops.iter().map(|op| op.future()).collect();
    try_join_all(futures)
}

/// Wait for every op, never failing: each input's result comes back in input
/// order, errors included.
pub fn when_all_settled(ops: &[Op]) -> impl Future<Output = Vec<OpResult>> {
    let futures: Vec<_> = ops.iter().map(|op| op.future()).collect();
    join_all(futures)
}

/// Wait for whichever op completes first, yielding its input index and
/// result. Later completions are simply not observed through the returned
/// future.
///
/// Panics if `ops` is empty.
pub fn when_any(ops: &[Op]) -> impl Future<Output = (usize, OpResult)> {
    assert!(!ops.is_empty(), "when_any requires at least one op");
    let futures: Vec<_> = ops.iter().map(|op| op.future()).collect();
    select_all(futures).map(|(result, index, _rest)| (index, result))
}
