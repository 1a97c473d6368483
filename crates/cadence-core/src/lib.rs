//! cadence-core
//!
//! Cooperative step-sequencing for async pipelines: run an ordered
//! list of steps; a step either finishes synchronously or fans out
//! into any number of concurrent completions that are joined back —
//! in allocation order — into the arguments of the next step.
//!
//! # モジュール構成
//! - **sequencer**: run driver, options, awaitable handle
//! - **scope**: per-step control surface (handles, groups, advance/finish, nesting)
//! - **aggregate**: ordered join-counted slot array
//! - **handle**: single-use completion handles
//! - **group**: dynamic fan-out over a nested aggregator
//! - **policy**: slot collection policies (first/event/collapse/spread/none/ignore/group)
//! - **step**: the step protocol + async adapter
//! - **bag**: shared mutable context across nested runs
//! - **events**: event-source seam for bind_first/bind_error
//! - **stall**: advisory timeout signals
//! - **error / ids**: fault model, run identifiers

pub mod aggregate;
pub mod bag;
pub mod error;
pub mod events;
pub mod group;
pub mod handle;
pub mod ids;
pub mod policy;
pub mod scope;
pub mod sequencer;
pub mod stall;
pub mod step;

pub use aggregate::ResultAggregator;
pub use bag::DataBag;
pub use error::{Fault, FaultOrigin};
pub use events::{Emitter, EventSource};
pub use group::BranchGenerator;
pub use handle::CompletionHandle;
pub use ids::RunId;
pub use policy::Policy;
pub use scope::{StepScope, SubrunTarget};
pub use sequencer::{RunHandle, RunOptions, Sequencer};
pub use stall::TimeoutSignal;
pub use step::{AsyncStep, Step, from_async, step};
