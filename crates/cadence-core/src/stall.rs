//! Advisory stall signals for steps that outlive their timeout window.
//!
//! A signal never terminates a run by itself: the observer decides.
//! Resuming treats the stalled step as if it had completed with no
//! further results; doing nothing leaves the run stalled, which is
//! deliberate — a slow step is not necessarily a dead one.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::ids::RunId;
use crate::sequencer::RunMsg;

/// One stalled step. Raised at most once per step, on the side channel
/// configured in `RunOptions`.
#[derive(Debug)]
pub struct TimeoutSignal {
    run: RunId,
    step_index: usize,
    partial: Vec<Option<Value>>,
    raised_at: DateTime<Utc>,
    resume: ResumeStall,
}

impl TimeoutSignal {
    pub(crate) fn new(
        run: RunId,
        step_index: usize,
        partial: Vec<Option<Value>>,
        resume: ResumeStall,
    ) -> Self {
        Self {
            run,
            step_index,
            partial,
            raised_at: Utc::now(),
            resume,
        }
    }

    pub fn run(&self) -> RunId {
        self.run
    }

    /// Zero-based index of the stalled step.
    pub fn step_index(&self) -> usize {
        self.step_index
    }

    /// The step's partially filled aggregate: `None` marks slots whose
    /// completions never arrived.
    pub fn partial(&self) -> &[Option<Value>] {
        &self.partial
    }

    pub fn raised_at(&self) -> DateTime<Utc> {
        self.raised_at
    }

    /// Skip past the stalled step: unfired slots take their policy
    /// defaults and the pipeline advances. A no-op if the step resolved
    /// in the meantime.
    pub fn resume(self) {
        self.resume.fire();
    }
}

/// Resumption capability bound to the stalled step's epoch.
#[derive(Debug)]
pub(crate) struct ResumeStall {
    tx: mpsc::UnboundedSender<RunMsg>,
    epoch: u64,
}

impl ResumeStall {
    pub(crate) fn new(tx: mpsc::UnboundedSender<RunMsg>, epoch: u64) -> Self {
        Self { tx, epoch }
    }

    pub(crate) fn fire(self) {
        let _ = self.tx.send(RunMsg::Advance {
            epoch: self.epoch,
            inject: None,
        });
    }
}
