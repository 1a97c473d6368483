//! Step sequencing: drives ordered execution of steps, decides when to
//! auto-advance versus wait, owns the current aggregator, and
//! supervises timeouts.
//!
//! Design intent:
//! - One spawned driver task per run. Everything that moves a run
//!   forward — advances, resolved aggregators, deferred checks, group
//!   probes, finishes — arrives as a message and is processed one at a
//!   time. That serialized queue is the trampoline: arbitrarily long
//!   step lists never grow the call stack, and no step body ever runs
//!   re-entrantly inside another.
//! - Every aggregator and timer is bound to the epoch of the step that
//!   created it. Stale notifications (an abandoned step's completions,
//!   a timer for a step that already resolved) are discarded without
//!   fault.
//! - The terminal consumer is invoked exactly once, from the driver
//!   task, never on the turn that spawned the run.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::aggregate::{self, ResultAggregator, SchedulerFn, SharedState};
use crate::bag::DataBag;
use crate::error::Fault;
use crate::handle::CompletionHandle;
use crate::ids::RunId;
use crate::scope::StepScope;
use crate::stall::{ResumeStall, TimeoutSignal};
use crate::step::Step;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Messages processed by a run's driver task.
pub(crate) enum RunMsg {
    /// Move to the next step. `inject` carries directly supplied
    /// values (explicit advance), bypassing the current aggregator.
    Advance { epoch: u64, inject: Option<Inject> },

    /// The step's aggregator delivered its outcome.
    StepResolved { epoch: u64 },

    /// Deferred zero-outstanding check for an aggregator of this run.
    Check(SharedState),

    /// Empty-group probe: if the fan-out's nested aggregator is still
    /// untouched by the time this is processed, resolve it to empty.
    GroupProbe {
        child: SharedState,
        parent: Arc<CompletionHandle>,
        empty: Option<Value>,
    },

    /// Terminate the whole run with the given outcome.
    Finish {
        error: Option<Fault>,
        values: Vec<Value>,
    },
}

pub(crate) struct Inject {
    pub(crate) error: Option<Fault>,
    pub(crate) values: Vec<Value>,
}

/// Scheduler routing an aggregator's deferred checks through the run's
/// serialized queue.
pub(crate) fn queue_scheduler(tx: mpsc::UnboundedSender<RunMsg>) -> SchedulerFn {
    Box::new(move |state| {
        let _ = tx.send(RunMsg::Check(state));
    })
}

fn step_aggregator(tx: &mpsc::UnboundedSender<RunMsg>, epoch: u64) -> ResultAggregator {
    let owner_tx = tx.clone();
    ResultAggregator::with_scheduler(
        Box::new(move |_outcome| {
            let _ = owner_tx.send(RunMsg::StepResolved { epoch });
        }),
        queue_scheduler(tx.clone()),
    )
}

/// Run configuration. No ambient global configuration exists; this is
/// the whole surface.
pub struct RunOptions {
    /// Stall detection window per out-of-sync step. `Duration::ZERO`
    /// disables the timer.
    pub timeout: Duration,

    /// Pre-existing shared context. A fresh bag is created when absent.
    pub bag: Option<DataBag>,

    /// Side channel for advisory [`TimeoutSignal`]s. Without a
    /// listener a stalled run simply stays stalled.
    pub stall: Option<mpsc::UnboundedSender<TimeoutSignal>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            bag: None,
            stall: None,
        }
    }
}

impl RunOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_bag(mut self, bag: DataBag) -> Self {
        self.bag = Some(bag);
        self
    }

    pub fn with_stall(mut self, stall: mpsc::UnboundedSender<TimeoutSignal>) -> Self {
        self.stall = Some(stall);
        self
    }
}

/// Awaitable handle on a spawned run.
pub struct RunHandle {
    id: RunId,
    bag: DataBag,
    done: oneshot::Receiver<Result<Vec<Value>, Fault>>,
}

impl RunHandle {
    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn data(&self) -> &DataBag {
        &self.bag
    }

    /// Wait for the terminal outcome: the last step's finalized values,
    /// or the fault that ended the run.
    pub async fn join(self) -> Result<Vec<Value>, Fault> {
        match self.done.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Fault::engine("sequencer ended without reporting an outcome")),
        }
    }
}

/// Entry points for spawning runs.
pub struct Sequencer;

impl Sequencer {
    /// Spawn a run and return an awaitable handle. The first step is
    /// scheduled as an asynchronous continuation, never inline.
    pub fn spawn(steps: Vec<Box<dyn Step>>, options: RunOptions) -> RunHandle {
        let (done_tx, done_rx) = oneshot::channel();
        let bag = options.bag.clone().unwrap_or_default();
        let id = Self::launch(steps, options, bag.clone(), move |outcome| {
            let _ = done_tx.send(outcome);
        });
        RunHandle {
            id,
            bag,
            done: done_rx,
        }
    }

    /// Spawn a run delivering its outcome to `consumer` instead of a
    /// handle. Nested runs use this to feed a parent's completion
    /// handle.
    pub fn spawn_with(
        steps: Vec<Box<dyn Step>>,
        options: RunOptions,
        consumer: impl FnOnce(Result<Vec<Value>, Fault>) + Send + 'static,
    ) -> RunId {
        let bag = options.bag.clone().unwrap_or_default();
        Self::launch(steps, options, bag, consumer)
    }

    fn launch(
        steps: Vec<Box<dyn Step>>,
        options: RunOptions,
        bag: DataBag,
        consumer: impl FnOnce(Result<Vec<Value>, Fault>) + Send + 'static,
    ) -> RunId {
        let id = RunId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let agg = step_aggregator(&tx, 0);
        let driver = Driver {
            id,
            steps,
            cursor: 0,
            bag,
            timeout: options.timeout,
            stall: options.stall,
            tx,
            agg,
            epoch: 0,
            deadline: None,
            finished: false,
            consumer: Some(Box::new(consumer)),
        };
        tracing::debug!(run = %id, steps = driver.steps.len(), "run spawned");
        tokio::spawn(driver.run(rx));
        id
    }
}

type Consumer = Box<dyn FnOnce(Result<Vec<Value>, Fault>) + Send>;

struct Driver {
    id: RunId,
    steps: Vec<Box<dyn Step>>,
    cursor: usize,
    bag: DataBag,
    timeout: Duration,
    stall: Option<mpsc::UnboundedSender<TimeoutSignal>>,
    tx: mpsc::UnboundedSender<RunMsg>,
    agg: ResultAggregator,
    epoch: u64,
    deadline: Option<(u64, Instant)>,
    finished: bool,
    consumer: Option<Consumer>,
}

impl Driver {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RunMsg>) {
        self.advance(None);
        while !self.finished {
            let msg = if let Some((epoch, at)) = self.deadline {
                tokio::select! {
                    msg = rx.recv() => msg,
                    _ = tokio::time::sleep_until(at) => {
                        // 期限切れ通知は一回だけ
                        self.deadline = None;
                        self.raise_stall(epoch);
                        continue;
                    }
                }
            } else {
                rx.recv().await
            };
            let Some(msg) = msg else { break };
            self.dispatch(msg);
        }
    }

    fn dispatch(&mut self, msg: RunMsg) {
        match msg {
            RunMsg::Advance { epoch, inject } => {
                if epoch == self.epoch {
                    self.advance(inject);
                }
            }
            RunMsg::StepResolved { epoch } => {
                if epoch == self.epoch {
                    self.advance(None);
                }
            }
            RunMsg::Check(state) => aggregate::check(&state),
            RunMsg::GroupProbe { child, parent, empty } => {
                if aggregate::is_untouched(&child) {
                    match empty {
                        Some(value) => parent.resolve(None, vec![value]),
                        None => parent.resolve(None, Vec::new()),
                    }
                }
            }
            RunMsg::Finish { error, values } => match error {
                Some(fault) => self.finish(Err(fault)),
                None => self.finish(Ok(values)),
            },
        }
    }

    /// Transition to the next step. `inject` replaces the current
    /// aggregator's results with directly supplied ones; completions of
    /// the abandoned step keep landing on the old aggregator and are
    /// discarded by the epoch check.
    fn advance(&mut self, inject: Option<Inject>) {
        if self.finished {
            return;
        }
        self.deadline = None;

        let prev = match inject {
            Some(Inject {
                error: Some(fault), ..
            }) => {
                self.finish(Err(fault));
                return;
            }
            Some(Inject { error: None, values }) => values,
            None => {
                if let Some(fault) = self.agg.error() {
                    self.finish(Err(fault));
                    return;
                }
                self.agg.finalize()
            }
        };

        if self.cursor == self.steps.len() {
            self.finish(Ok(prev));
            return;
        }

        let index = self.cursor;
        self.cursor += 1;
        self.epoch += 1;
        self.agg = step_aggregator(&self.tx, self.epoch);

        let scope = StepScope::new(
            self.id,
            self.epoch,
            self.tx.clone(),
            self.agg.clone(),
            self.bag.clone(),
            self.timeout,
        );

        tracing::debug!(run = %self.id, step = index, "step start");
        let result = self.steps[index].invoke(&scope, &prev);

        match result {
            Err(fault) => self.finish(Err(fault)),
            Ok(value) => {
                if scope.in_sync() {
                    // Synchronous step: record its return value as the
                    // sole result and advance through the queue, never
                    // by recursing.
                    self.agg.push_value(value);
                    let _ = self.tx.send(RunMsg::Advance {
                        epoch: self.epoch,
                        inject: None,
                    });
                } else if self.timeout > Duration::ZERO {
                    self.deadline = Some((self.epoch, Instant::now() + self.timeout));
                }
            }
        }
    }

    fn raise_stall(&mut self, epoch: u64) {
        if self.finished || epoch != self.epoch {
            return;
        }
        let step_index = self.cursor - 1;
        tracing::debug!(run = %self.id, step = step_index, "step stalled");
        if let Some(stall) = &self.stall {
            let signal = TimeoutSignal::new(
                self.id,
                step_index,
                self.agg.snapshot(),
                ResumeStall::new(self.tx.clone(), epoch),
            );
            let _ = stall.send(signal);
        }
    }

    fn finish(&mut self, outcome: Result<Vec<Value>, Fault>) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.deadline = None;
        match &outcome {
            Ok(values) => {
                tracing::debug!(run = %self.id, results = values.len(), "run complete");
            }
            Err(fault) => {
                tracing::debug!(run = %self.id, %fault, "run failed");
            }
        }
        if let Some(consumer) = self.consumer.take() {
            consumer(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;
    use crate::scope::SubrunTarget;
    use crate::step::step;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::time::sleep;

    fn recorder() -> (Arc<Mutex<Vec<i64>>>, impl Fn(i64) + Clone) {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let h = Arc::clone(&hits);
        (hits, move |n| h.lock().unwrap().push(n))
    }

    #[tokio::test]
    async fn sync_steps_run_in_order_never_on_the_spawning_turn() {
        let (hits, record) = recorder();
        let steps = (1..=3)
            .map(|n| {
                let record = record.clone();
                step(move |_scope, _prev| {
                    record(n);
                    Ok(Value::Null)
                })
            })
            .collect();

        let handle = Sequencer::spawn(steps, RunOptions::default());
        assert!(hits.lock().unwrap().is_empty());

        handle.join().await.unwrap();
        assert_eq!(*hits.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn return_values_chain_between_sync_steps() {
        let steps = vec![
            step(|_s, _p| Ok(json!([1]))),
            step(|_s, prev| {
                let mut list = prev[0].as_array().unwrap().clone();
                list.push(json!(2));
                Ok(Value::Array(list))
            }),
        ];

        let results = Sequencer::spawn(steps, RunOptions::default())
            .join()
            .await
            .unwrap();
        assert_eq!(results, vec![json!([1, 2])]);
    }

    #[tokio::test]
    async fn step_error_reaches_the_consumer() {
        let steps = vec![step(|_s, _p| Err(Fault::step("oh noes")))];

        let fault = Sequencer::spawn(steps, RunOptions::default())
            .join()
            .await
            .unwrap_err();
        assert_eq!(fault.message, "oh noes");
    }

    #[tokio::test]
    async fn results_assemble_in_allocation_order_not_firing_order() {
        let steps = vec![
            step(|scope: &StepScope, _p: &[Value]| {
                let a = scope.first();
                let b = scope.first();
                let c = scope.first();
                tokio::spawn(async move {
                    sleep(Duration::from_millis(30)).await;
                    a.succeed(json!(1));
                });
                tokio::spawn(async move {
                    sleep(Duration::from_millis(20)).await;
                    b.succeed(json!(2));
                });
                tokio::spawn(async move {
                    sleep(Duration::from_millis(10)).await;
                    c.succeed(json!(3));
                });
                Ok(Value::Null)
            }),
            step(|_s, prev| {
                assert_eq!(prev, &[json!(1), json!(2), json!(3)]);
                Ok(json!("ordered"))
            }),
        ];

        let results = Sequencer::spawn(steps, RunOptions::default())
            .join()
            .await
            .unwrap();
        assert_eq!(results, vec![json!("ordered")]);
    }

    #[tokio::test]
    async fn handles_fired_inside_the_body_resolve_after_it_returns() {
        let (hits, record) = recorder();
        let r = record.clone();
        let steps = vec![
            step(move |scope: &StepScope, _p: &[Value]| {
                let a = scope.first();
                let b = scope.first();
                r(1);
                a.succeed(json!("a"));
                r(2);
                b.succeed(json!("b"));
                Ok(Value::Null)
            }),
            step(move |_s, prev| {
                assert_eq!(prev, &[json!("a"), json!("b")]);
                record(3);
                Ok(Value::Null)
            }),
        ];

        Sequencer::spawn(steps, RunOptions::default())
            .join()
            .await
            .unwrap();
        assert_eq!(*hits.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn policies_shape_the_next_steps_arguments() {
        let steps = vec![
            step(|scope: &StepScope, _p: &[Value]| {
                scope.first().succeed(json!(1));
                Ok(Value::Null)
            }),
            step(|scope: &StepScope, prev: &[Value]| {
                assert_eq!(prev, &[json!(1)]);
                scope.spread().succeed_with(vec![json!(2), json!(3)]);
                Ok(Value::Null)
            }),
            step(|scope: &StepScope, prev: &[Value]| {
                assert_eq!(prev, &[json!(2), json!(3)]);
                scope.collapse().succeed_with(vec![json!(4), json!(5)]);
                Ok(Value::Null)
            }),
            step(|scope: &StepScope, prev: &[Value]| {
                assert_eq!(prev, &[json!([4, 5])]);
                scope.event().emit(json!(6));
                Ok(Value::Null)
            }),
            step(|scope: &StepScope, prev: &[Value]| {
                assert_eq!(prev, &[json!(6)]);
                scope.ignore().fail(Fault::completion("swallowed"));
                scope.none().succeed(json!(7));
                Ok(Value::Null)
            }),
            step(|_s, prev| {
                assert!(prev.is_empty());
                Ok(json!("done"))
            }),
        ];

        let results = Sequencer::spawn(steps, RunOptions::default())
            .join()
            .await
            .unwrap();
        assert_eq!(results, vec![json!("done")]);
    }

    #[tokio::test]
    async fn handle_error_skips_remaining_steps() {
        let (hits, record) = recorder();
        let r1 = record.clone();
        let r3 = record.clone();
        let steps = vec![
            step(move |_s, _p| {
                r1(1);
                Ok(Value::Null)
            }),
            step(|scope: &StepScope, _p: &[Value]| {
                let h = scope.first();
                tokio::spawn(async move {
                    h.fail(Fault::completion("sensor offline"));
                });
                Ok(Value::Null)
            }),
            step(move |_s, _p| {
                r3(3);
                Ok(Value::Null)
            }),
        ];

        let fault = Sequencer::spawn(steps, RunOptions::default())
            .join()
            .await
            .unwrap_err();
        assert_eq!(fault.message, "sensor offline");
        assert_eq!(*hits.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn advance_discards_results_collected_afterwards() {
        let steps = vec![
            step(|scope: &StepScope, _p: &[Value]| {
                let h = scope.first();
                let batch = scope.group_of(1);
                scope.advance();
                // Abandoned-step completions: accepted, discarded.
                h.succeed(json!(42));
                batch[0].succeed(json!("answer"));
                Ok(Value::Null)
            }),
            step(|_s, prev| {
                assert!(prev.is_empty());
                Ok(json!("second"))
            }),
        ];

        let results = Sequencer::spawn(steps, RunOptions::default())
            .join()
            .await
            .unwrap();
        assert_eq!(results, vec![json!("second")]);
    }

    #[tokio::test]
    async fn advance_with_supplies_values_directly() {
        let steps = vec![step(|scope: &StepScope, _p: &[Value]| {
            scope.advance_with(vec![json!(42)]);
            Ok(Value::Null)
        })];

        let results = Sequencer::spawn(steps, RunOptions::default())
            .join()
            .await
            .unwrap();
        assert_eq!(results, vec![json!(42)]);
    }

    #[tokio::test]
    async fn advance_err_ends_the_run() {
        let steps = vec![
            step(|scope: &StepScope, _p: &[Value]| {
                scope.advance_err(Fault::step("bad reading"));
                Ok(Value::Null)
            }),
            step(|_s, _p| panic!("unreachable")),
        ];

        let fault = Sequencer::spawn(steps, RunOptions::default())
            .join()
            .await
            .unwrap_err();
        assert_eq!(fault.message, "bad reading");
    }

    #[tokio::test]
    async fn finish_skips_remaining_steps_but_the_body_completes() {
        let (hits, record) = recorder();
        let r1 = record.clone();
        let r2 = record.clone();
        let steps = vec![
            step(move |scope: &StepScope, _p: &[Value]| {
                r1(1);
                scope.finish();
                r1(3);
                Ok(Value::Null)
            }),
            step(move |_s, _p| {
                r2(2);
                Ok(Value::Null)
            }),
        ];

        let results = Sequencer::spawn(steps, RunOptions::default())
            .join()
            .await
            .unwrap();
        assert!(results.is_empty());
        assert_eq!(*hits.lock().unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn finish_provides_the_only_results() {
        let steps = vec![step(|scope: &StepScope, _p: &[Value]| {
            let a = scope.first();
            let b = scope.first();
            a.succeed(json!(1));
            scope.finish();
            b.succeed(json!(2));
            Ok(Value::Null)
        })];

        let results = Sequencer::spawn(steps, RunOptions::default())
            .join()
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn finish_with_values() {
        let steps = vec![step(|scope: &StepScope, _p: &[Value]| {
            scope.finish_with(vec![json!(42)]);
            Ok(Value::Null)
        })];

        let results = Sequencer::spawn(steps, RunOptions::default())
            .join()
            .await
            .unwrap();
        assert_eq!(results, vec![json!(42)]);
    }

    #[tokio::test]
    async fn finish_err_reaches_the_consumer() {
        let steps = vec![step(|scope: &StepScope, _p: &[Value]| {
            scope.finish_err(Fault::step("abort"));
            Ok(Value::Null)
        })];

        let fault = Sequencer::spawn(steps, RunOptions::default())
            .join()
            .await
            .unwrap_err();
        assert_eq!(fault.message, "abort");
    }

    #[tokio::test]
    async fn stalled_step_raises_one_signal_and_resume_advances() {
        let (stall_tx, mut stall_rx) = mpsc::unbounded_channel();
        let steps = vec![step(|scope: &StepScope, _p: &[Value]| {
            let _forgotten = scope.first();
            Ok(Value::Null)
        })];

        let handle = Sequencer::spawn(
            steps,
            RunOptions::default()
                .with_timeout(Duration::from_millis(30))
                .with_stall(stall_tx),
        );

        let signal = stall_rx.recv().await.unwrap();
        assert_eq!(signal.step_index(), 0);
        assert_eq!(signal.partial(), &[None]);

        // Advisory and single-shot: no second signal shows up.
        sleep(Duration::from_millis(80)).await;
        assert!(stall_rx.try_recv().is_err());

        signal.resume();
        let results = handle.join().await.unwrap();
        assert_eq!(results, vec![Value::Null]);
    }

    #[tokio::test]
    async fn no_signal_when_the_step_resolves_in_time() {
        let (stall_tx, mut stall_rx) = mpsc::unbounded_channel();
        let steps = vec![step(|scope: &StepScope, _p: &[Value]| {
            let h = scope.first();
            tokio::spawn(async move {
                sleep(Duration::from_millis(5)).await;
                h.succeed(json!("quick"));
            });
            Ok(Value::Null)
        })];

        let results = Sequencer::spawn(
            steps,
            RunOptions::default()
                .with_timeout(Duration::from_millis(200))
                .with_stall(stall_tx),
        )
        .join()
        .await
        .unwrap();

        assert_eq!(results, vec![json!("quick")]);
        assert!(stall_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_fire_after_resume_is_discarded() {
        let (stall_tx, mut stall_rx) = mpsc::unbounded_channel();
        let kept: Arc<Mutex<Option<crate::handle::CompletionHandle>>> =
            Arc::new(Mutex::new(Option::None));
        let stash = Arc::clone(&kept);
        let steps = vec![
            step(move |scope: &StepScope, _p: &[Value]| {
                *stash.lock().unwrap() = Some(scope.first());
                Ok(Value::Null)
            }),
            step(|_s, prev| {
                assert_eq!(prev, &[Value::Null]);
                Ok(json!("resumed"))
            }),
        ];

        let handle = Sequencer::spawn(
            steps,
            RunOptions::default()
                .with_timeout(Duration::from_millis(20))
                .with_stall(stall_tx),
        );

        let signal = stall_rx.recv().await.unwrap();
        signal.resume();
        let results = handle.join().await.unwrap();
        assert_eq!(results, vec![json!("resumed")]);

        // The stalled step finally fires: accepted, discarded, no
        // panic, no re-notification.
        kept.lock().unwrap().take().unwrap().succeed(json!("late"));
    }

    #[tokio::test]
    async fn nested_run_continues_the_parent_step_by_default() {
        let steps = vec![step(|scope: &StepScope, _p: &[Value]| {
            scope.run(vec![step(|_s, _p| Ok(json!(42)))]);
            Ok(Value::Null)
        })];

        let results = Sequencer::spawn(steps, RunOptions::default())
            .join()
            .await
            .unwrap();
        assert_eq!(results, vec![json!(42)]);
    }

    #[tokio::test]
    async fn nested_run_shares_the_parent_bag_by_reference() {
        let outer_bag = DataBag::new();
        let probe = outer_bag.clone();
        let steps = vec![step(move |scope: &StepScope, _p: &[Value]| {
            let expected = probe.clone();
            scope.run(vec![step(move |inner: &StepScope, _p: &[Value]| {
                assert!(DataBag::ptr_eq(inner.data(), &expected));
                inner.data().insert("from-inner", json!(true));
                Ok(Value::Null)
            })]);
            Ok(Value::Null)
        })];

        Sequencer::spawn(steps, RunOptions::default().with_bag(outer_bag.clone()))
            .join()
            .await
            .unwrap();
        assert_eq!(outer_bag.get("from-inner"), Some(json!(true)));
    }

    #[tokio::test]
    async fn nested_run_error_propagates_to_the_parent() {
        let steps = vec![
            step(|scope: &StepScope, _p: &[Value]| {
                scope.run(vec![step(|_s, _p| Err(Fault::step("inner failed")))]);
                Ok(Value::Null)
            }),
            step(|_s, _p| panic!("unreachable")),
        ];

        let fault = Sequencer::spawn(steps, RunOptions::default())
            .join()
            .await
            .unwrap_err();
        assert_eq!(fault.message, "inner failed");
    }

    #[tokio::test]
    async fn nested_runs_into_group_branches_join_in_order() {
        let steps = vec![
            step(|scope: &StepScope, _p: &[Value]| {
                let all_done = scope.group();
                for n in [10i64, 20] {
                    scope.run_into(
                        vec![step(move |_s, _p| Ok(json!(n)))],
                        RunOptions::default(),
                        SubrunTarget::Handle(all_done.branch()),
                    );
                }
                Ok(Value::Null)
            }),
            step(|_s, prev| {
                assert_eq!(prev, &[json!([10, 20])]);
                Ok(json!("joined"))
            }),
        ];

        let results = Sequencer::spawn(steps, RunOptions::default())
            .join()
            .await
            .unwrap();
        assert_eq!(results, vec![json!("joined")]);
    }

    #[tokio::test]
    async fn nested_run_into_a_named_policy() {
        let steps = vec![
            step(|scope: &StepScope, _p: &[Value]| {
                let policy: Policy = "collapse".parse().unwrap();
                scope.run_into(
                    vec![step(|s: &StepScope, _p: &[Value]| {
                        s.advance_with(vec![json!(1), json!(2)]);
                        Ok(Value::Null)
                    })],
                    RunOptions::default(),
                    SubrunTarget::Policy(policy),
                );
                Ok(Value::Null)
            }),
            step(|_s, prev| {
                assert_eq!(prev, &[json!([1, 2])]);
                Ok(json!("ok"))
            }),
        ];

        let results = Sequencer::spawn(steps, RunOptions::default())
            .join()
            .await
            .unwrap();
        assert_eq!(results, vec![json!("ok")]);
    }

    #[tokio::test]
    async fn spawn_with_feeds_an_explicit_consumer() {
        let (tx, rx) = oneshot::channel();
        Sequencer::spawn_with(
            vec![step(|_s, _p| Ok(json!("direct")))],
            RunOptions::default(),
            move |outcome| {
                let _ = tx.send(outcome);
            },
        );

        let results = rx.await.unwrap().unwrap();
        assert_eq!(results, vec![json!("direct")]);
    }

    #[tokio::test]
    async fn long_sync_chains_do_not_grow_the_stack() {
        let steps: Vec<Box<dyn Step>> = (0..2000)
            .map(|n| step(move |_s: &StepScope, _p: &[Value]| Ok(json!(n))))
            .collect();

        let results = Sequencer::spawn(steps, RunOptions::default())
            .join()
            .await
            .unwrap();
        assert_eq!(results, vec![json!(1999)]);
    }

    #[tokio::test]
    async fn bind_first_delivers_the_first_named_event() {
        let emitter = Arc::new(crate::events::Emitter::new());
        let ready = Arc::new(tokio::sync::Notify::new());

        let source = Arc::clone(&emitter);
        let notify = Arc::clone(&ready);
        let steps = vec![
            step(move |scope: &StepScope, _p: &[Value]| {
                scope.bind_first(source.as_ref(), "reading");
                notify.notify_one();
                Ok(Value::Null)
            }),
            step(|_s, prev| {
                assert_eq!(prev, &[json!(21.5)]);
                Ok(json!("bound"))
            }),
        ];

        let handle = Sequencer::spawn(steps, RunOptions::default());
        ready.notified().await;
        emitter.emit("reading", json!(21.5));

        let results = handle.join().await.unwrap();
        assert_eq!(results, vec![json!("bound")]);
    }

    #[tokio::test]
    async fn bind_error_finishes_the_run_with_the_source_error() {
        let emitter = Arc::new(crate::events::Emitter::new());
        let ready = Arc::new(tokio::sync::Notify::new());

        let source = Arc::clone(&emitter);
        let notify = Arc::clone(&ready);
        let steps = vec![
            step(move |scope: &StepScope, _p: &[Value]| {
                scope.bind_error(source.as_ref());
                let _open = scope.first();
                notify.notify_one();
                Ok(Value::Null)
            }),
            step(|_s, _p| panic!("unreachable")),
        ];

        let handle = Sequencer::spawn(steps, RunOptions::default());
        ready.notified().await;
        emitter.emit_error(Fault::completion("source failed"));

        let fault = handle.join().await.unwrap_err();
        assert_eq!(fault.message, "source failed");
    }
}
