//! Expression evaluation.
//!
//! [`evaluate`] reduces an [`Expression`] to a [`Value`] without waiting for
//! anything: literals resolve immediately, previous results are passed
//! through by identity, parameters are looked up in the explicit [`Frame`],
//! and calls go to the dispatcher with their arguments still pending.
//! Failures are returned as failed values and never stop sibling arguments
//! from being evaluated.

use crate::capability::CapabilityId;
use crate::config::EvalConfig;
use crate::dispatch;
use crate::error::{CalcError, Result};
use crate::expression::Expression;
use crate::value::Value;

/// Arguments bound to one invocation of a defined function.
///
/// Frames link to the frame of the invocation that called them, which
/// lets a function be rejected if it would run inside its own body.
#[derive(Debug)]
pub struct Frame<'a> {
    function: CapabilityId,
    args: Vec<Value>,
    parent: Option<&'a Frame<'a>>,
    depth: usize,
}

impl<'a> Frame<'a> {
    /// Bind `args` for a top-level invocation of `function`.
    pub fn new(function: CapabilityId, args: Vec<Value>) -> Frame<'static> {
        Frame {
            function,
            args,
            parent: None,
            depth: 1,
        }
    }

    /// Bind `args` for an invocation of `function` made from `parent`.
    pub fn enter(
        parent: Option<&'a Frame<'a>>,
        function: CapabilityId,
        args: Vec<Value>,
    ) -> Result<Frame<'a>> {
        let Some(parent) = parent else {
            return Ok(Frame::new(function, args));
        };

        let depth = parent.depth + 1;
        if depth > EvalConfig::MAX_CALL_DEPTH {
            return Err(CalcError::CallDepthExceeded {
                max_depth: EvalConfig::MAX_CALL_DEPTH,
            });
        }
        if parent.chain().any(|frame| frame.function == function) {
            return Err(CalcError::CyclicCapability { function });
        }

        Ok(Frame {
            function,
            args,
            parent: Some(parent),
            depth,
        })
    }

    pub fn function(&self) -> CapabilityId {
        self.function
    }

    pub fn param_count(&self) -> usize {
        self.args.len()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn arg(&self, index: u32) -> Result<&Value> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.args.get(i))
            .ok_or(CalcError::ParameterIndexOutOfRange {
                index,
                param_count: self.args.len(),
            })
    }

    fn chain(&self) -> impl Iterator<Item = &Frame<'a>> {
        std::iter::successors(Some(self), |frame| frame.parent)
    }
}

/// Evaluate `expression` against an optional argument frame.
pub fn evaluate(expression: &Expression, frame: Option<&Frame<'_>>) -> Value {
    match expression {
        Expression::Literal(value) => Value::resolved(*value),
        Expression::PreviousResult(value) => value.clone(),
        Expression::Parameter(index) => match frame {
            Some(frame) => frame.arg(*index).map_or_else(Value::failed, Value::clone),
            None => Value::failed(CalcError::NoActiveFrame),
        },
        Expression::Call(call) => {
            let args = call
                .params
                .iter()
                .map(|param| evaluate(param, frame))
                .collect();
            dispatch::dispatch(&call.function, args, frame)
        }
    }
}
