//! Function capabilities.
//!
//! A [`Function`] is one of four kinds:
//! - **Defined**: a parameter count and a body expression, evaluated by
//!   substituting arguments for parameter references.
//! - **Operator**: one of the four built-in arithmetic operators.
//! - **Native**: a callback implemented by the embedding program through
//!   [`NativeFunction`]. A peer that receives one sees a remote stub.
//! - **Remote**: a stub for a function hosted by a connected peer.
//!
//! All kinds share one entry point, [`Function::invoke`], which hands the
//! call to the dispatcher.

use crate::capability::CapabilityId;
use crate::dispatch;
use crate::error::Result;
use crate::expression::{Expression, Operator};
use crate::rpc::session::RemoteHandle;
use crate::value::Value;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// A function implemented by the host program.
#[async_trait::async_trait]
pub trait NativeFunction: Send + Sync + 'static {
    /// Number of parameters the function accepts.
    fn param_count(&self) -> usize;

    /// Compute the result from resolved arguments.
    async fn call(&self, params: &[f64]) -> Result<f64>;
}

pub(crate) enum FunctionKind {
    Defined { param_count: usize, body: Expression },
    Operator(Operator),
    Native(Arc<dyn NativeFunction>),
    Remote(RemoteHandle),
}

struct FunctionInner {
    id: CapabilityId,
    kind: FunctionKind,
}

/// An immutable, shareable function capability.
#[derive(Clone)]
pub struct Function {
    inner: Arc<FunctionInner>,
}

impl Function {
    fn new(kind: FunctionKind) -> Self {
        Self {
            inner: Arc::new(FunctionInner {
                id: CapabilityId::next(),
                kind,
            }),
        }
    }

    pub(crate) fn defined(param_count: usize, body: Expression) -> Self {
        Self::new(FunctionKind::Defined { param_count, body })
    }

    /// The process-wide singleton for `op`.
    pub fn operator(op: Operator) -> Self {
        static OPERATORS: OnceLock<[Function; 4]> = OnceLock::new();
        let operators = OPERATORS
            .get_or_init(|| Operator::ALL.map(|each| Self::new(FunctionKind::Operator(each))));
        operators[usize::from(op.ordinal())].clone()
    }

    /// Wrap a host callback as a function capability.
    pub fn native<F: NativeFunction>(function: F) -> Self {
        Self::new(FunctionKind::Native(Arc::new(function)))
    }

    pub(crate) fn remote(handle: RemoteHandle) -> Self {
        Self::new(FunctionKind::Remote(handle))
    }

    pub fn id(&self) -> CapabilityId {
        self.inner.id
    }

    /// Expected argument count; unknown for remote stubs.
    pub fn param_count(&self) -> Option<usize> {
        match &self.inner.kind {
            FunctionKind::Defined { param_count, .. } => Some(*param_count),
            FunctionKind::Operator(_) => Some(Operator::ARITY),
            FunctionKind::Native(native) => Some(native.param_count()),
            FunctionKind::Remote(_) => None,
        }
    }

    pub fn as_operator(&self) -> Option<Operator> {
        match &self.inner.kind {
            FunctionKind::Operator(op) => Some(*op),
            _ => None,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.inner.kind, FunctionKind::Remote(_))
    }

    /// Whether both handles refer to the same capability.
    pub fn same(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn kind(&self) -> &FunctionKind {
        &self.inner.kind
    }

    pub(crate) fn remote_handle(&self) -> Option<&RemoteHandle> {
        match &self.inner.kind {
            FunctionKind::Remote(handle) => Some(handle),
            _ => None,
        }
    }

    /// Invoke on possibly pending arguments. Never blocks; the returned
    /// value resolves once the invocation completes.
    pub fn invoke(&self, args: Vec<Value>) -> Value {
        dispatch::dispatch(self, args, None)
    }

    /// Invoke on concrete numbers and wait for the result.
    pub async fn call(&self, params: &[f64]) -> Result<f64> {
        let args = params.iter().copied().map(Value::resolved).collect();
        self.invoke(args).read().await
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Function");
        debug.field("id", &self.inner.id);
        match &self.inner.kind {
            FunctionKind::Defined { param_count, .. } => {
                debug.field("kind", &"defined").field("param_count", param_count)
            }
            FunctionKind::Operator(op) => debug.field("kind", &"operator").field("op", op),
            FunctionKind::Native(native) => debug
                .field("kind", &"native")
                .field("param_count", &native.param_count()),
            FunctionKind::Remote(handle) => debug.field("kind", &"remote").field("target", handle),
        };
        debug.finish()
    }
}
