//! The step protocol.
//!
//! A step is a single-method capability: the sequencer hands it a
//! [`StepScope`] plus the previous step's finalized values, and the
//! body runs to completion synchronously. Anything asynchronous
//! happens through completion handles allocated from the scope and
//! fired later from spawned tasks.
//!
//! Failure channel: a step signals fatal failure by returning `Err`.
//! Panics are not caught.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::bag::DataBag;
use crate::error::Fault;
use crate::scope::StepScope;

/// One unit of pipeline work.
///
/// The returned value only matters while the step stays in sync (no
/// handle allocated, no explicit advance/finish): it is then recorded
/// as the step's sole result. An out-of-sync step's return value is
/// ignored; its results arrive through the handles it allocated.
pub trait Step: Send + 'static {
    fn invoke(&mut self, scope: &StepScope, prev: &[Value]) -> Result<Value, Fault>;
}

impl<F> Step for F
where
    F: FnMut(&StepScope, &[Value]) -> Result<Value, Fault> + Send + 'static,
{
    fn invoke(&mut self, scope: &StepScope, prev: &[Value]) -> Result<Value, Fault> {
        self(scope, prev)
    }
}

/// Box a closure as a step. Pins the closure signature so call sites
/// stay free of type annotations.
pub fn step<F>(f: F) -> Box<dyn Step>
where
    F: FnMut(&StepScope, &[Value]) -> Result<Value, Fault> + Send + 'static,
{
    Box::new(f)
}

/// A step whose body is an async function.
///
/// Adapter convenience over the handle protocol: the future runs on a
/// spawned task, and every value it returns becomes one result slot
/// (spread semantics).
#[async_trait]
pub trait AsyncStep: Send + Sync + 'static {
    async fn run(&self, bag: DataBag, prev: Vec<Value>) -> Result<Vec<Value>, Fault>;
}

/// Adapt an [`AsyncStep`] onto the synchronous step protocol.
pub fn from_async<T: AsyncStep>(inner: T) -> Box<dyn Step> {
    Box::new(AsyncAdapter {
        inner: Arc::new(inner),
    })
}

struct AsyncAdapter<T: AsyncStep> {
    inner: Arc<T>,
}

impl<T: AsyncStep> Step for AsyncAdapter<T> {
    fn invoke(&mut self, scope: &StepScope, prev: &[Value]) -> Result<Value, Fault> {
        let handle = scope.spread();
        let inner = Arc::clone(&self.inner);
        let bag = scope.data().clone();
        let prev = prev.to_vec();
        tokio::spawn(async move {
            match inner.run(bag, prev).await {
                Ok(values) => handle.resolve(None, values),
                Err(fault) => handle.resolve(Some(fault), Vec::new()),
            }
        });
        Ok(Value::Null)
    }
}
