//! Value capabilities.
//!
//! A [`Value`] is a single-assignment promise over an `f64`. It starts out
//! pending with a queue of continuations and transitions exactly once to a
//! terminal outcome, which is either the number or a [`CalcError`]. Queued
//! continuations run in the order they were registered.
//!
//! # Lifetime
//!
//! `Value` is a cheap handle around a reference-counted cell. The task that
//! produces a value only holds a [`Resolver`], which refers to the cell
//! weakly, so dropping every `Value` handle of a pending computation aborts
//! the producer and releases the capabilities it was computed from.

use crate::capability::CapabilityId;
use crate::error::{CalcError, Result};
use crate::rpc::session::RemoteHandle;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Terminal outcome of a value.
pub type Outcome = Result<f64>;

type Continuation = Box<dyn FnOnce(&Outcome) + Send + 'static>;

type Batch = (VecDeque<Continuation>, Outcome);

thread_local! {
    /// Batches waiting to run while this thread is already delivering.
    static DELIVERY: RefCell<Option<VecDeque<Batch>>> = RefCell::new(None);
}

/// Resets the thread's delivery queue, even if a continuation panics.
struct Delivering;

impl Drop for Delivering {
    fn drop(&mut self) {
        let leftover = DELIVERY.with(|slot| slot.borrow_mut().take());
        drop(leftover);
    }
}

/// Run `continuations` with `outcome`.
///
/// A continuation that resolves another value only queues that value's
/// batch here. The outermost call drains batches in a loop, so stack depth
/// does not grow with the length of a dependency chain.
fn deliver(continuations: VecDeque<Continuation>, outcome: Outcome) {
    let outermost = DELIVERY.with(|slot| {
        let mut slot = slot.borrow_mut();
        match slot.as_mut() {
            Some(queue) => {
                queue.push_back((continuations, outcome));
                None
            }
            None => {
                *slot = Some(VecDeque::new());
                Some((continuations, outcome))
            }
        }
    });
    let Some(first) = outermost else {
        return;
    };

    let _delivering = Delivering;
    let mut batch = Some(first);
    while let Some((continuations, outcome)) = batch.take() {
        for continuation in continuations {
            continuation(&outcome);
        }
        batch = DELIVERY.with(|slot| slot.borrow_mut().as_mut().and_then(VecDeque::pop_front));
    }
}

enum ValueState {
    Pending(VecDeque<Continuation>),
    Resolved(Outcome),
}

struct ValueCell {
    id: CapabilityId,
    state: Mutex<ValueState>,
    /// Values this one is computed from; released on resolution.
    dependencies: Mutex<Vec<Value>>,
    /// Task computing this value, aborted if the value is abandoned.
    producer: Mutex<Option<AbortHandle>>,
    /// Set for values hosted by a peer; fetched on first demand.
    remote: Option<RemoteHandle>,
    demanded: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ValueCell {
    fn new(state: ValueState, remote: Option<RemoteHandle>) -> Self {
        Self {
            id: CapabilityId::next(),
            state: Mutex::new(state),
            dependencies: Mutex::new(Vec::new()),
            producer: Mutex::new(None),
            remote,
            demanded: AtomicBool::new(false),
        }
    }

    fn is_pending(&self) -> bool {
        matches!(*lock(&self.state), ValueState::Pending(_))
    }

    fn complete(&self, outcome: Outcome) {
        let queue = {
            let mut state = lock(&self.state);
            if let ValueState::Resolved(_) = *state {
                warn!(value = %self.id, "ignoring second resolution of value");
                return;
            }
            match std::mem::replace(&mut *state, ValueState::Resolved(outcome.clone())) {
                ValueState::Pending(queue) => queue,
                ValueState::Resolved(_) => VecDeque::new(),
            }
        };

        let dependencies = std::mem::take(&mut *lock(&self.dependencies));
        release_all(dependencies);
        lock(&self.producer).take();

        deliver(queue, outcome);
    }

    fn set_producer(&self, handle: AbortHandle) {
        if self.is_pending() {
            *lock(&self.producer) = Some(handle);
        }
    }
}

impl Drop for ValueCell {
    fn drop(&mut self) {
        let pending = matches!(
            *self.state.get_mut().unwrap_or_else(PoisonError::into_inner),
            ValueState::Pending(_)
        );
        let producer = self
            .producer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let (true, Some(producer)) = (pending, producer) {
            debug!(value = %self.id, "abandoning pending value");
            producer.abort();
        }

        let dependencies = std::mem::take(
            self.dependencies
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        release_all(dependencies);
    }
}

/// Drop `values` without recursing through their dependency chains.
///
/// A cell whose last handle is in the worklist hands its own dependencies
/// to the worklist before it is dropped.
fn release_all(mut values: Vec<Value>) {
    while let Some(value) = values.pop() {
        if let Ok(mut cell) = Arc::try_unwrap(value.cell) {
            values.append(
                cell.dependencies
                    .get_mut()
                    .unwrap_or_else(PoisonError::into_inner),
            );
        }
    }
}

/// A capability wrapping a single, possibly not yet computed, `f64`.
#[derive(Clone)]
pub struct Value {
    cell: Arc<ValueCell>,
}

impl Value {
    /// Create a value that is already resolved to `value`.
    pub fn resolved(value: f64) -> Self {
        Self {
            cell: Arc::new(ValueCell::new(ValueState::Resolved(Ok(value)), None)),
        }
    }

    /// Create a value that is already terminated with `error`.
    pub fn failed(error: CalcError) -> Self {
        Self {
            cell: Arc::new(ValueCell::new(ValueState::Resolved(Err(error)), None)),
        }
    }

    /// Create a pending value together with the resolver that completes it.
    pub fn pending() -> (Self, Resolver) {
        let value = Self {
            cell: Arc::new(ValueCell::new(ValueState::Pending(VecDeque::new()), None)),
        };
        let resolver = value.resolver();
        (value, resolver)
    }

    /// A value hosted by a peer. Nothing is fetched until someone reads it
    /// or queues a continuation on it.
    pub(crate) fn remote(handle: RemoteHandle) -> Self {
        Self {
            cell: Arc::new(ValueCell::new(
                ValueState::Pending(VecDeque::new()),
                Some(handle),
            )),
        }
    }

    pub fn id(&self) -> CapabilityId {
        self.cell.id
    }

    pub fn is_resolved(&self) -> bool {
        !self.cell.is_pending()
    }

    /// Whether both handles refer to the same capability.
    pub fn same(&self, other: &Value) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// The outcome, if the value has already resolved.
    pub fn peek(&self) -> Option<Outcome> {
        match &*lock(&self.cell.state) {
            ValueState::Pending(_) => None,
            ValueState::Resolved(outcome) => Some(outcome.clone()),
        }
    }

    /// Queue `continuation` to run once the value resolves.
    ///
    /// Runs on the calling thread if the value has already resolved; when
    /// called from inside another continuation it runs right after that
    /// one returns. Continuations queued on one value run in FIFO order.
    pub fn when_resolved<F>(&self, continuation: F)
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        self.demand();
        let ready = {
            let mut state = lock(&self.cell.state);
            match &mut *state {
                ValueState::Pending(queue) => {
                    queue.push_back(Box::new(continuation));
                    return;
                }
                ValueState::Resolved(outcome) => outcome.clone(),
            }
        };
        let continuation: Continuation = Box::new(continuation);
        deliver(VecDeque::from([continuation]), ready);
    }

    /// Wait for the value to resolve and return the number.
    pub async fn read(&self) -> Result<f64> {
        if let Some(outcome) = self.peek() {
            return outcome;
        }
        let (tx, rx) = oneshot::channel();
        self.when_resolved(move |outcome| {
            let _ = tx.send(outcome.clone());
        });
        rx.await
            .map_err(|_| CalcError::CapabilityReleased { id: self.id() })?
    }

    pub(crate) fn remote_handle(&self) -> Option<&RemoteHandle> {
        self.cell.remote.as_ref()
    }

    /// Keep `dependencies` alive for as long as this value is pending.
    pub(crate) fn depend_on(&self, dependencies: Vec<Value>) {
        if self.cell.is_pending() {
            lock(&self.cell.dependencies).extend(dependencies);
        }
    }

    fn resolver(&self) -> Resolver {
        Resolver {
            cell: Arc::downgrade(&self.cell),
            done: false,
        }
    }

    fn demand(&self) {
        if let Some(remote) = &self.cell.remote {
            if !self.cell.demanded.swap(true, Ordering::AcqRel) {
                remote.fetch(self.resolver());
            }
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Value");
        debug.field("id", &self.cell.id);
        match self.peek() {
            None => debug.field("state", &"pending"),
            Some(Ok(value)) => debug.field("value", &value),
            Some(Err(error)) => debug.field("error", &error),
        };
        debug.field("remote", &self.cell.remote.is_some()).finish()
    }
}

/// Single-use handle that completes a pending [`Value`].
///
/// Dropping a resolver without resolving fails the value, so readers never
/// wait on a producer that has gone away.
pub struct Resolver {
    cell: Weak<ValueCell>,
    done: bool,
}

impl Resolver {
    pub fn resolve(mut self, outcome: Outcome) {
        self.complete(outcome);
    }

    pub fn fulfill(self, value: f64) {
        self.resolve(Ok(value));
    }

    pub fn reject(self, error: CalcError) {
        self.resolve(Err(error));
    }

    /// True once every handle to the value has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.cell.strong_count() == 0
    }

    /// Resolve with the output of `future`, run as a task on the current
    /// tokio runtime. The task is aborted if the value is abandoned first.
    pub(crate) fn resolve_with<F>(self, future: F)
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                self.reject(CalcError::Other(
                    "no async runtime available to compute value".to_string(),
                ));
                return;
            }
        };

        let cell = self.cell.clone();
        let task = runtime.spawn(async move {
            let outcome = future.await;
            self.resolve(outcome);
        });
        match cell.upgrade() {
            Some(cell) => cell.set_producer(task.abort_handle()),
            None => task.abort(),
        }
    }

    fn complete(&mut self, outcome: Outcome) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(cell) = self.cell.upgrade() {
            cell.complete(outcome);
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        if !self.done {
            self.complete(Err(CalcError::Other(
                "value producer dropped before resolving".to_string(),
            )));
        }
    }
}

/// Run `on_ready` once every value in `values` has resolved.
///
/// Receives the numbers in argument order, or the first failure observed.
/// Fires without suspending if all values are already resolved.
pub(crate) fn join_all<F>(values: &[Value], on_ready: F)
where
    F: FnOnce(Result<Vec<f64>>) + Send + 'static,
{
    struct JoinState<F> {
        slots: Vec<Option<f64>>,
        remaining: usize,
        on_ready: Option<F>,
    }

    if values.is_empty() {
        on_ready(Ok(Vec::new()));
        return;
    }

    let state = Arc::new(Mutex::new(JoinState {
        slots: vec![None; values.len()],
        remaining: values.len(),
        on_ready: Some(on_ready),
    }));

    for (index, value) in values.iter().enumerate() {
        let state = Arc::clone(&state);
        value.when_resolved(move |outcome| {
            let ready = {
                let mut join = lock(&state);
                match outcome {
                    Ok(number) => {
                        join.slots[index] = Some(*number);
                        join.remaining -= 1;
                        if join.remaining == 0 {
                            let numbers: Vec<f64> = join.slots.iter().flatten().copied().collect();
                            join.on_ready.take().map(|f| (f, Ok(numbers)))
                        } else {
                            None
                        }
                    }
                    Err(error) => join.on_ready.take().map(|f| (f, Err(error.clone()))),
                }
            };
            if let Some((on_ready, result)) = ready {
                on_ready(result);
            }
        });
    }
}
