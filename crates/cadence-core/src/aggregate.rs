//! Result aggregation: an ordered, join-counted slot array collecting
//! one step's outstanding completions.
//!
//! Design intent:
//! - A slot's final position is fixed by allocation order, never by
//!   firing order. `Spread` and `None` record index adjustments so
//!   later slots land where they should.
//! - The owner is notified exactly once: immediately on the first
//!   escalating error, or through a deferred check once the
//!   outstanding count reaches zero. The deferred check re-validates
//!   at delivery time, so fires and allocations inside one synchronous
//!   body coalesce into a single notification.
//! - A finished aggregator silently discards every further fire.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::error::Fault;
use crate::handle::{CompletionHandle, Hook};
use crate::policy::Policy;

/// What the owner receives: the ordered values, or the sticky error.
pub(crate) type AggregateOutcome = Result<Vec<Value>, Fault>;

/// Owner notification. Taken on delivery, which is what makes
/// "exactly once" hold without extra bookkeeping.
pub(crate) type OwnerFn = Box<dyn FnOnce(AggregateOutcome) + Send>;

/// Defers a zero-outstanding check to a later turn. Runs owned by a
/// sequencer push the check through the run's serialized queue;
/// standalone aggregators spawn a task instead.
pub(crate) type SchedulerFn = Box<dyn Fn(SharedState) + Send>;

pub(crate) type SharedState = Arc<Mutex<AggregateState>>;

/// One result position.
#[derive(Debug, Clone)]
pub(crate) enum Slot {
    /// Allocated, not yet fired. Group slots default to `[]` at
    /// finalize time instead of Null.
    Pending { group: bool },
    Filled(Value),
}

/// Persistent index adjustment recorded by a Spread or None fire.
#[derive(Debug, Clone)]
pub(crate) struct IndexShift {
    pub(crate) index: isize,
    pub(crate) amount: isize,
}

pub(crate) struct AggregateState {
    pub(crate) slots: Vec<Slot>,
    pub(crate) outstanding: usize,
    pub(crate) error: Option<Fault>,
    pub(crate) shifts: Vec<IndexShift>,
    pub(crate) finished: bool,
    pub(crate) check_queued: bool,
    pub(crate) owner: Option<OwnerFn>,
    pub(crate) scheduler: SchedulerFn,
}

pub(crate) fn lock_state(state: &SharedState) -> MutexGuard<'_, AggregateState> {
    state.lock().expect("aggregate state poisoned")
}

/// Ordered join of concurrent completions for one step.
#[derive(Clone)]
pub struct ResultAggregator {
    state: SharedState,
}

impl ResultAggregator {
    /// Standalone aggregator: zero-outstanding checks run on a spawned
    /// task one tick later. Must be used within a tokio runtime.
    pub fn new(owner: impl FnOnce(Result<Vec<Value>, Fault>) + Send + 'static) -> Self {
        Self::with_scheduler(
            Box::new(owner),
            Box::new(|state: SharedState| {
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    check(&state);
                });
            }),
        )
    }

    pub(crate) fn with_scheduler(owner: OwnerFn, scheduler: SchedulerFn) -> Self {
        Self {
            state: Arc::new(Mutex::new(AggregateState {
                slots: Vec::new(),
                outstanding: 0,
                error: None,
                shifts: Vec::new(),
                finished: false,
                check_queued: false,
                owner: Some(owner),
                scheduler,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AggregateState> {
        lock_state(&self.state)
    }

    pub(crate) fn shared_state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    /// Append one unfired slot and return its write capability.
    pub fn allocate(&self, policy: Policy) -> CompletionHandle {
        self.alloc(policy, None)
    }

    pub fn allocate_with_hook<F>(&self, policy: Policy, hook: F) -> CompletionHandle
    where
        F: Fn(&Option<Fault>, &[Value]) + Send + Sync + 'static,
    {
        self.alloc(policy, Some(Box::new(hook)))
    }

    pub(crate) fn alloc(&self, policy: Policy, hook: Option<Hook>) -> CompletionHandle {
        let mut st = self.lock();
        let group = matches!(policy, Policy::Group);
        st.slots.push(Slot::Pending { group });
        st.outstanding += 1;
        let index = st.slots.len() - 1;
        // Shifts recorded before this allocation are already reflected
        // in `index`; only later ones may move this slot.
        let shift_floor = st.shifts.len();
        CompletionHandle::bind(self.shared_state(), index, shift_floor, policy, hook)
    }

    /// Append an already-final value without join counting. Used to
    /// record the synchronous return of an in-sync step.
    pub(crate) fn push_value(&self, value: Value) {
        self.lock().slots.push(Slot::Filled(value));
    }

    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().slots.is_empty()
    }

    pub fn error(&self) -> Option<Fault> {
        self.lock().error.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Fill every still-unfired slot with its policy default and yield
    /// the ordered values. Idempotent; fires landing afterwards are
    /// discarded.
    pub fn finalize(&self) -> Vec<Value> {
        let mut st = self.lock();
        if !st.finished {
            for slot in &mut st.slots {
                if let Slot::Pending { group } = slot {
                    let default = if *group { Value::Array(Vec::new()) } else { Value::Null };
                    *slot = Slot::Filled(default);
                }
            }
            st.finished = true;
        }
        st.slots
            .iter()
            .map(|slot| match slot {
                Slot::Filled(v) => v.clone(),
                Slot::Pending { group } => {
                    if *group {
                        Value::Array(Vec::new())
                    } else {
                        Value::Null
                    }
                }
            })
            .collect()
    }

    /// Partially-filled view for stall observers: `None` marks slots
    /// that have not fired yet.
    pub fn snapshot(&self) -> Vec<Option<Value>> {
        self.lock()
            .slots
            .iter()
            .map(|slot| match slot {
                Slot::Filled(v) => Some(v.clone()),
                Slot::Pending { .. } => None,
            })
            .collect()
    }
}

/// Deferred zero-outstanding check. Re-validates before delivering: a
/// slot allocated after the count hit zero suppresses the
/// notification, and the next fire queues a fresh check.
pub(crate) fn check(state: &SharedState) {
    let (owner, values) = {
        let mut st = lock_state(state);
        st.check_queued = false;
        if st.finished || st.error.is_some() || st.outstanding > 0 {
            return;
        }
        let Some(owner) = st.owner.take() else {
            return;
        };
        st.finished = true;
        let values = st
            .slots
            .iter()
            .map(|slot| match slot {
                Slot::Filled(v) => v.clone(),
                Slot::Pending { .. } => Value::Null,
            })
            .collect();
        (owner, values)
    };
    owner(Ok(values));
}

/// Is this aggregator still untouched (no slot ever allocated)? Used
/// by the fan-out group's empty-resolution probe.
pub(crate) fn is_untouched(state: &SharedState) -> bool {
    let st = lock_state(state);
    st.slots.is_empty() && !st.finished
}
