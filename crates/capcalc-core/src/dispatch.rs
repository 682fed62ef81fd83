//! Local vs. remote invocation of functions on pending arguments.

use crate::error::{CalcError, Result};
use crate::eval::{self, Frame};
use crate::function::{Function, FunctionKind};
use crate::value::{self, Value};
use std::sync::Arc;

/// Invoke `function` on `args` from within `caller` (if any).
///
/// Returns immediately. Defined functions are substituted right away with
/// their arguments still pending. Stubs for a peer's function are pipelined
/// through the peer's calculator when it has one. Every other kind waits
/// for its arguments through a join continuation.
pub(crate) fn dispatch(function: &Function, args: Vec<Value>, caller: Option<&Frame<'_>>) -> Value {
    match function.kind() {
        FunctionKind::Defined { param_count, body } => {
            if let Err(error) = check_arity(*param_count, args.len()) {
                return Value::failed(error);
            }
            match Frame::enter(caller, function.id(), args) {
                Ok(frame) => eval::evaluate(body, Some(&frame)),
                Err(error) => Value::failed(error),
            }
        }
        FunctionKind::Operator(op) => {
            let op = *op;
            after_args(args, Some(2), move |numbers, resolver| match numbers[..] {
                [lhs, rhs] => resolver.resolve(op.apply(lhs, rhs)),
                _ => resolver.reject(CalcError::ArityMismatch {
                    expected: 2,
                    actual: numbers.len(),
                }),
            })
        }
        FunctionKind::Native(native) => {
            let native = Arc::clone(native);
            after_args(args, Some(native.param_count()), move |numbers, resolver| {
                resolver.resolve_with(async move { native.call(&numbers).await });
            })
        }
        FunctionKind::Remote(handle) => {
            if let Some(result) = handle.pipeline_call(function, &args) {
                return result;
            }
            // Callback into a peer without a calculator. The stub travels
            // with the request so the peer's export stays alive until the
            // call has been sent.
            let function = function.clone();
            after_args(args, None, move |numbers, resolver| {
                resolver.resolve_with(async move {
                    match function.remote_handle() {
                        Some(handle) => handle.call(numbers).await,
                        None => Err(CalcError::remote("function is not hosted by a peer")),
                    }
                });
            })
        }
    }
}

fn check_arity(expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(CalcError::ArityMismatch { expected, actual })
    }
}

/// Produce a pending value that `run` completes once every argument has
/// resolved. A failed argument fails the result with the same error.
fn after_args<F>(args: Vec<Value>, arity: Option<usize>, run: F) -> Value
where
    F: FnOnce(Vec<f64>, value::Resolver) + Send + 'static,
{
    if let Some(expected) = arity {
        if let Err(error) = check_arity(expected, args.len()) {
            return Value::failed(error);
        }
    }

    let (result, resolver) = Value::pending();
    result.depend_on(args.clone());
    value::join_all(&args, move |joined| match joined {
        Ok(numbers) => run(numbers, resolver),
        Err(error) => resolver.reject(error),
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{Expression, Operator};
    use crate::function::NativeFunction;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl NativeFunction for Counting {
        fn param_count(&self) -> usize {
            1
        }

        async fn call(&self, params: &[f64]) -> Result<f64> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(params[0] * 2.0)
        }
    }

    #[tokio::test]
    async fn test_operator_waits_for_pending_arguments() {
        let (lhs, resolve_lhs) = Value::pending();
        let add = Function::operator(Operator::Add);

        let sum = dispatch(&add, vec![lhs, Value::resolved(2.0)], None);
        assert!(!sum.is_resolved());

        resolve_lhs.fulfill(40.0);
        assert_eq!(sum.read().await, Ok(42.0));
    }

    #[tokio::test]
    async fn test_operator_arity_is_checked_up_front() {
        let multiply = Function::operator(Operator::Multiply);
        let value = dispatch(&multiply, vec![Value::resolved(1.0)], None);
        assert_eq!(
            value.peek(),
            Some(Err(CalcError::ArityMismatch {
                expected: 2,
                actual: 1
            }))
        );
    }

    #[tokio::test]
    async fn test_failed_argument_propagates() {
        let subtract = Function::operator(Operator::Subtract);
        let value = dispatch(
            &subtract,
            vec![Value::failed(CalcError::DivisionByZero), Value::resolved(1.0)],
            None,
        );
        assert_eq!(value.read().await, Err(CalcError::DivisionByZero));
    }

    #[tokio::test]
    async fn test_defined_function_substitutes_pending_arguments() {
        let add = Function::operator(Operator::Add);
        let body = Expression::call(&add, vec![Expression::parameter(0), Expression::parameter(1)]);
        let sum = Function::defined(2, body);

        let (first, resolve_first) = Value::pending();
        let result = dispatch(&sum, vec![first, Value::resolved(4.0)], None);
        assert!(!result.is_resolved());

        resolve_first.fulfill(3.0);
        assert_eq!(result.read().await, Ok(7.0));
    }

    #[tokio::test]
    async fn test_defined_function_arity_mismatch() {
        let function = Function::defined(1, Expression::parameter(0));
        let result = dispatch(&function, vec![], None);
        assert_eq!(
            result.read().await,
            Err(CalcError::ArityMismatch {
                expected: 1,
                actual: 0
            })
        );
    }

    #[tokio::test]
    async fn test_native_runs_once_arguments_resolve() {
        let calls = Arc::new(AtomicUsize::new(0));
        let double = Function::native(Counting(Arc::clone(&calls)));

        let (arg, resolve_arg) = Value::pending();
        let result = dispatch(&double, vec![arg], None);
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        resolve_arg.fulfill(21.0);
        assert_eq!(result.read().await, Ok(42.0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropping_result_releases_arguments() {
        let add = Function::operator(Operator::Add);
        let (arg, resolve_arg) = Value::pending();

        let result = dispatch(&add, vec![arg, Value::resolved(1.0)], None);
        assert!(!resolve_arg.is_abandoned());
        drop(result);
        assert!(resolve_arg.is_abandoned());
    }
}
