//! Step scope: the control surface a sequencer hands to each step body.
//!
//! The scope lives exactly as long as the synchronous body. Anything
//! that must outlast it — completion handles, branch generators — owns
//! its own references and can be moved into spawned tasks.

use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::aggregate::ResultAggregator;
use crate::bag::DataBag;
use crate::error::Fault;
use crate::events::EventSource;
use crate::group::BranchGenerator;
use crate::handle::CompletionHandle;
use crate::ids::RunId;
use crate::policy::Policy;
use crate::sequencer::{Inject, RunMsg, RunOptions, Sequencer, queue_scheduler};

/// Where a nested run delivers its outcome.
pub enum SubrunTarget {
    /// One more `First` handle of the current step (the default).
    Current,

    /// One more handle of the current step under the given policy.
    Policy(Policy),

    /// An explicit handle, e.g. a branch of a fan-out group.
    Handle(CompletionHandle),
}

/// Per-step view of the sequencer.
pub struct StepScope {
    run: RunId,
    epoch: u64,
    tx: mpsc::UnboundedSender<RunMsg>,
    agg: ResultAggregator,
    bag: DataBag,
    timeout: Duration,
    synced: Cell<bool>,
}

impl StepScope {
    pub(crate) fn new(
        run: RunId,
        epoch: u64,
        tx: mpsc::UnboundedSender<RunMsg>,
        agg: ResultAggregator,
        bag: DataBag,
        timeout: Duration,
    ) -> Self {
        Self {
            run,
            epoch,
            tx,
            agg,
            bag,
            timeout,
            synced: Cell::new(true),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run
    }

    /// The run's shared context bag.
    pub fn data(&self) -> &DataBag {
        &self.bag
    }

    pub(crate) fn in_sync(&self) -> bool {
        self.synced.get()
    }

    fn desync(&self) {
        self.synced.set(false);
    }

    /// Request one completion handle from the current aggregator. The
    /// sequencer now waits for every allocated handle before moving on.
    pub fn allocate(&self, policy: Policy) -> CompletionHandle {
        self.desync();
        self.agg.allocate(policy)
    }

    /// Like [`allocate`](Self::allocate), with a hook observing the raw
    /// outcome before the policy is applied.
    pub fn allocate_with_hook<F>(&self, policy: Policy, hook: F) -> CompletionHandle
    where
        F: Fn(&Option<Fault>, &[Value]) + Send + Sync + 'static,
    {
        self.desync();
        self.agg.allocate_with_hook(policy, hook)
    }

    pub fn first(&self) -> CompletionHandle {
        self.allocate(Policy::First)
    }

    pub fn collapse(&self) -> CompletionHandle {
        self.allocate(Policy::Collapse)
    }

    pub fn spread(&self) -> CompletionHandle {
        self.allocate(Policy::Spread)
    }

    pub fn event(&self) -> CompletionHandle {
        self.allocate(Policy::Event)
    }

    pub fn none(&self) -> CompletionHandle {
        self.allocate(Policy::None)
    }

    pub fn ignore(&self) -> CompletionHandle {
        self.allocate(Policy::Ignore)
    }

    /// Fan out to an unknown number of branches: returns a generator
    /// allocating one branch per call. A generator with no branches by
    /// the next turn of the run's queue resolves to `[]`.
    pub fn group(&self) -> BranchGenerator {
        self.build_group(Policy::First)
    }

    /// Fan-out generator whose branches use `policy`.
    pub fn group_with(&self, policy: Policy) -> BranchGenerator {
        self.build_group(policy)
    }

    /// Eagerly allocate exactly `count` branch handles. Zero is a
    /// special case: nothing is allocated at all.
    pub fn group_of(&self, count: usize) -> Vec<CompletionHandle> {
        self.group_of_with(count, Policy::First)
    }

    pub fn group_of_with(&self, count: usize, policy: Policy) -> Vec<CompletionHandle> {
        if count == 0 {
            return Vec::new();
        }
        let (child, _parent) = self.group_target(policy, false);
        (0..count).map(|_| child.allocate(policy)).collect()
    }

    fn build_group(&self, policy: Policy) -> BranchGenerator {
        let (child, _parent) = self.group_target(policy, true);
        BranchGenerator::new(child, policy)
    }

    /// Wire a nested aggregator into one slot of the current one. The
    /// parent slot defaults to `[]` (Group policy) unless the branch
    /// policy is `None`/`Ignore`, which then governs the slot itself.
    fn group_target(
        &self,
        branch_policy: Policy,
        probe_when_empty: bool,
    ) -> (ResultAggregator, Arc<CompletionHandle>) {
        self.desync();
        let parent_policy = match branch_policy {
            Policy::None | Policy::Ignore => branch_policy,
            _ => Policy::Group,
        };
        let wrap = matches!(parent_policy, Policy::Group);

        let parent = Arc::new(self.agg.allocate(parent_policy));
        let owner_parent = Arc::clone(&parent);
        let child = ResultAggregator::with_scheduler(
            Box::new(move |outcome: Result<Vec<Value>, Fault>| match outcome {
                Ok(values) => {
                    if wrap {
                        owner_parent.resolve(None, vec![Value::Array(values)]);
                    } else {
                        owner_parent.resolve(None, values);
                    }
                }
                Err(fault) => owner_parent.resolve(Some(fault), Vec::new()),
            }),
            queue_scheduler(self.tx.clone()),
        );

        if probe_when_empty {
            let _ = self.tx.send(RunMsg::GroupProbe {
                child: child.shared_state(),
                parent: Arc::clone(&parent),
                empty: wrap.then(|| Value::Array(Vec::new())),
            });
        }

        (child, parent)
    }

    /// Force transition to the next step with no carried results.
    pub fn advance(&self) {
        self.send_advance(None, Vec::new());
    }

    /// Force transition to the next step, supplying its arguments
    /// directly and bypassing the current aggregator's policies.
    pub fn advance_with(&self, values: Vec<Value>) {
        self.send_advance(None, values);
    }

    pub fn advance_err(&self, fault: Fault) {
        self.send_advance(Some(fault), Vec::new());
    }

    fn send_advance(&self, error: Option<Fault>, values: Vec<Value>) {
        self.desync();
        let _ = self.tx.send(RunMsg::Advance {
            epoch: self.epoch,
            inject: Some(Inject { error, values }),
        });
    }

    /// Terminate the whole run now, with no results.
    pub fn finish(&self) {
        self.send_finish(None, Vec::new());
    }

    /// Terminate the whole run now with exactly these results.
    pub fn finish_with(&self, values: Vec<Value>) {
        self.send_finish(None, values);
    }

    pub fn finish_err(&self, fault: Fault) {
        self.send_finish(Some(fault), Vec::new());
    }

    fn send_finish(&self, error: Option<Fault>, values: Vec<Value>) {
        self.desync();
        let _ = self.tx.send(RunMsg::Finish { error, values });
    }

    /// Subscribe once to `name` on `source`; its first occurrence
    /// completes one `First` handle of the current step.
    pub fn bind_first(&self, source: &dyn EventSource, name: &str) {
        let handle = self.first();
        source.once(name, Box::new(move |value| handle.succeed(value)));
    }

    /// The source's first error finishes the whole run.
    pub fn bind_error(&self, source: &dyn EventSource) {
        let tx = self.tx.clone();
        source.once_error(Box::new(move |fault| {
            let _ = tx.send(RunMsg::Finish {
                error: Some(fault),
                values: Vec::new(),
            });
        }));
    }

    /// Spawn a nested run sharing this run's bag; its outcome continues
    /// the current step through one more `First` handle.
    pub fn run(&self, steps: Vec<Box<dyn crate::step::Step>>) -> RunId {
        let options = RunOptions::default().with_timeout(self.timeout);
        self.run_into(steps, options, SubrunTarget::Current)
    }

    pub fn run_with(&self, steps: Vec<Box<dyn crate::step::Step>>, options: RunOptions) -> RunId {
        self.run_into(steps, options, SubrunTarget::Current)
    }

    /// Spawn a nested run delivering into an explicit target. The
    /// nested run always holds this run's bag, whatever the options
    /// say.
    pub fn run_into(
        &self,
        steps: Vec<Box<dyn crate::step::Step>>,
        mut options: RunOptions,
        target: SubrunTarget,
    ) -> RunId {
        options.bag = Some(self.bag.clone());
        let handle = match target {
            SubrunTarget::Current => self.first(),
            SubrunTarget::Policy(policy) => self.allocate(policy),
            SubrunTarget::Handle(handle) => handle,
        };
        Sequencer::spawn_with(steps, options, move |outcome| match outcome {
            Ok(values) => handle.resolve(None, values),
            Err(fault) => handle.resolve(Some(fault), Vec::new()),
        })
    }
}
