//! Completion handles: single-use write capabilities into one
//! aggregator slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

use crate::aggregate::{IndexShift, SharedState, Slot, lock_state};
use crate::error::Fault;
use crate::policy::Policy;

/// Observes a handle's raw outcome before the policy is applied.
pub type Hook = Box<dyn Fn(&Option<Fault>, &[Value]) + Send + Sync>;

/// Write capability bound to one aggregator slot under one policy.
///
/// Fires at most once. A second fire on a live aggregator panics — a
/// double-fired handle is a defect in the calling code, surfaced at
/// the call site rather than absorbed. Once the owning aggregator has
/// finished (its step advanced, errored, or was skipped past), any
/// fire is accepted and silently discarded instead.
///
/// Handles are `Send`; move them into spawned tasks and fire from
/// there. Firing requires an ambient tokio runtime.
pub struct CompletionHandle {
    state: SharedState,
    index: usize,
    shift_floor: usize,
    policy: Policy,
    hook: Option<Hook>,
    fired: AtomicBool,
}

impl CompletionHandle {
    pub(crate) fn bind(
        state: SharedState,
        index: usize,
        shift_floor: usize,
        policy: Policy,
        hook: Option<Hook>,
    ) -> Self {
        Self {
            state,
            index,
            shift_floor,
            policy,
            hook,
            fired: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Fire with a single success value.
    pub fn succeed(&self, value: Value) {
        self.resolve(None, vec![value]);
    }

    /// Fire with any number of success values.
    pub fn succeed_with(&self, values: Vec<Value>) {
        self.resolve(None, values);
    }

    /// Fire with an error. Ends the run unless the policy swallows it.
    pub fn fail(&self, fault: Fault) {
        self.resolve(Some(fault), Vec::new());
    }

    /// Event-style fire: one payload, no error channel.
    pub fn emit(&self, value: Value) {
        self.resolve(None, vec![value]);
    }

    /// General form: an optional error plus the supplied values.
    pub fn resolve(&self, error: Option<Fault>, values: Vec<Value>) {
        {
            let st = lock_state(&self.state);
            if st.finished {
                return;
            }
        }

        if self.fired.swap(true, Ordering::SeqCst) {
            panic!("completion handle fired more than once");
        }

        if let Some(hook) = &self.hook {
            hook(&error, &values);
        }

        let mut st = lock_state(&self.state);
        if st.finished {
            return;
        }

        // Effective write position: adjustments recorded since this
        // slot was allocated may have moved it.
        let mut index = self.index as isize;
        for shift in &st.shifts[self.shift_floor..] {
            if shift.index < index {
                index += shift.amount;
            }
        }
        let index = index as usize;

        if let Some(fault) = error {
            if self.policy.escalates_errors() {
                st.error = Some(fault.clone());
                st.finished = true;
                let owner = st.owner.take();
                drop(st);
                if let Some(owner) = owner {
                    owner(Err(fault));
                }
                return;
            }
        }

        match self.policy {
            Policy::First | Policy::Group | Policy::Event => {
                let value = values.into_iter().next().unwrap_or(Value::Null);
                st.slots[index] = Slot::Filled(value);
            }
            Policy::Collapse => {
                st.slots[index] = Slot::Filled(Value::Array(values));
            }
            Policy::Spread => {
                let amount = values.len() as isize - 1;
                st.slots.remove(index);
                for (offset, value) in values.into_iter().enumerate() {
                    st.slots.insert(index + offset, Slot::Filled(value));
                }
                for shift in &mut st.shifts {
                    if shift.index > index as isize {
                        shift.index += amount;
                    }
                }
                st.shifts.push(IndexShift {
                    index: index as isize,
                    amount,
                });
            }
            Policy::None | Policy::Ignore => {
                st.slots.remove(index);
                for shift in &mut st.shifts {
                    if shift.index > index as isize {
                        shift.index -= 1;
                    }
                }
                st.shifts.push(IndexShift {
                    index: index as isize,
                    amount: -1,
                });
            }
        }

        st.outstanding -= 1;
        if st.outstanding == 0 && !st.check_queued {
            st.check_queued = true;
            (st.scheduler)(Arc::clone(&self.state));
        }
    }
}

impl std::fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("index", &self.index)
            .field("policy", &self.policy)
            .field("fired", &self.fired.load(Ordering::SeqCst))
            .finish()
    }
}
