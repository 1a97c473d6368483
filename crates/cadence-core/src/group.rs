//! Fan-out groups: join a dynamically sized set of concurrent branches
//! into one ordered sequence, occupying a single slot of the parent
//! step.

use serde_json::Value;

use crate::aggregate::ResultAggregator;
use crate::error::Fault;
use crate::handle::CompletionHandle;
use crate::policy::Policy;

/// On-demand branch factory for a fan-out group.
///
/// Each [`branch`](Self::branch) call allocates one more handle inside
/// the group's nested aggregator. The generator may be called any
/// number of times, including zero: a group with no branches by the
/// next turn of the run's queue resolves to `[]` without stalling the
/// pipeline. The generator owns its references and may outlive the
/// step body that created it.
pub struct BranchGenerator {
    child: ResultAggregator,
    policy: Policy,
}

impl BranchGenerator {
    pub(crate) fn new(child: ResultAggregator, policy: Policy) -> Self {
        Self { child, policy }
    }

    /// Allocate one more branch.
    pub fn branch(&self) -> CompletionHandle {
        self.child.allocate(self.policy)
    }

    /// Allocate one more branch with a hook observing its raw outcome.
    pub fn branch_with_hook<F>(&self, hook: F) -> CompletionHandle
    where
        F: Fn(&Option<Fault>, &[Value]) + Send + Sync + 'static,
    {
        self.child.allocate_with_hook(self.policy, hook)
    }

    /// Branches allocated so far.
    pub fn branches(&self) -> usize {
        self.child.len()
    }
}
