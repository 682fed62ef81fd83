//! The calculator service.

use crate::error::{CalcError, Result};
use crate::eval;
use crate::expression::{Expression, Operator};
use crate::function::Function;
use crate::value::Value;
use tracing::{debug, warn};

/// Operations offered by a calculator, local or remote.
///
/// None of these wait for a result. Values come back pending and can be
/// embedded in further expressions right away.
pub trait CalculatorService: Send + Sync {
    /// Evaluate an expression; the result may still be pending.
    fn evaluate(&self, expression: Expression) -> Value;

    /// Define a function of `param_count` parameters with the given body.
    fn def_function(&self, param_count: i32, body: Expression) -> Result<Function>;

    /// The built-in function for `op`.
    fn get_operator(&self, op: Operator) -> Result<Function>;
}

/// In-process calculator. This is what a server exports to its peers.
#[derive(Debug, Clone, Default)]
pub struct Calculator {
    _private: (),
}

impl Calculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(&self, expression: Expression) -> Value {
        eval::evaluate(&expression, None)
    }

    /// Define a function. The body is not evaluated until the function is
    /// invoked; parameter references past `param_count` fail at that point.
    pub fn def_function(&self, param_count: i32, body: Expression) -> Result<Function> {
        let param_count = usize::try_from(param_count).map_err(|_| CalcError::InvalidArity {
            param_count: i64::from(param_count),
        })?;

        if let Some(index) = body.max_parameter_index() {
            if usize::try_from(index).map_or(true, |index| index >= param_count) {
                warn!(index, param_count, "function body references a parameter past its arity");
            }
        }

        let function = Function::defined(param_count, body);
        debug!(function = %function.id(), param_count, "defined function");
        Ok(function)
    }

    pub fn get_operator(&self, op: Operator) -> Function {
        Function::operator(op)
    }
}

impl CalculatorService for Calculator {
    fn evaluate(&self, expression: Expression) -> Value {
        Calculator::evaluate(self, expression)
    }

    fn def_function(&self, param_count: i32, body: Expression) -> Result<Function> {
        Calculator::def_function(self, param_count, body)
    }

    fn get_operator(&self, op: Operator) -> Result<Function> {
        Ok(Calculator::get_operator(self, op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_def_function_and_call() {
        let calculator = Calculator::new();
        let add = calculator.get_operator(Operator::Add);
        let sum = calculator
            .def_function(
                2,
                Expression::call(&add, vec![Expression::parameter(0), Expression::parameter(1)]),
            )
            .unwrap();

        assert_eq!(sum.param_count(), Some(2));
        assert_eq!(sum.call(&[3.0, 4.0]).await, Ok(7.0));
    }

    #[test]
    fn test_negative_arity_is_rejected() {
        let calculator = Calculator::new();
        assert_eq!(
            calculator.def_function(-1, Expression::literal(1.0)).unwrap_err(),
            CalcError::InvalidArity { param_count: -1 }
        );
    }

    #[tokio::test]
    async fn test_out_of_range_parameter_fails_lazily() {
        let calculator = Calculator::new();
        let function = calculator
            .def_function(1, Expression::parameter(3))
            .unwrap();

        assert_eq!(
            function.call(&[1.0]).await,
            Err(CalcError::ParameterIndexOutOfRange {
                index: 3,
                param_count: 1
            })
        );
    }

    #[test]
    fn test_get_operator_is_idempotent() {
        let calculator = Calculator::new();
        let first = calculator.get_operator(Operator::Subtract);
        let second = calculator.get_operator(Operator::Subtract);
        assert!(first.same(&second));
    }

    #[tokio::test]
    async fn test_pipelined_previous_result() {
        // evaluate(9) fed into subtract(previousResult, 4)
        let calculator = Calculator::new();
        let nine = calculator.evaluate(Expression::literal(9.0));
        let subtract = calculator.get_operator(Operator::Subtract);
        let five = calculator.evaluate(Expression::call(
            &subtract,
            vec![Expression::previous_result(&nine), 4.0.into()],
        ));
        assert_eq!(five.read().await, Ok(5.0));
    }

    #[tokio::test]
    async fn test_service_trait_object() {
        let service: Box<dyn CalculatorService> = Box::new(Calculator::new());
        let multiply = service.get_operator(Operator::Multiply).unwrap();
        assert_eq!(multiply.call(&[2.0, 5.0]).await, Ok(10.0));
    }
}
