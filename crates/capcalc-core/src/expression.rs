//! Expression trees and the built-in operators.

use crate::error::{CalcError, Result};
use crate::function::Function;
use crate::value::Value;
use std::fmt;

/// Built-in arithmetic operators. The ordinals are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Operator {
    Add = 0,
    Subtract = 1,
    Multiply = 2,
    Divide = 3,
}

impl Operator {
    pub const ALL: [Operator; 4] = [
        Operator::Add,
        Operator::Subtract,
        Operator::Multiply,
        Operator::Divide,
    ];

    /// Number of operands every operator takes.
    pub const ARITY: usize = 2;

    pub fn ordinal(self) -> u16 {
        self as u16
    }

    pub fn from_ordinal(ordinal: u16) -> Result<Self> {
        Self::ALL
            .get(usize::from(ordinal))
            .copied()
            .ok_or(CalcError::InvalidOperator { ordinal })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Add => "add",
            Operator::Subtract => "subtract",
            Operator::Multiply => "multiply",
            Operator::Divide => "divide",
        }
    }

    /// Apply the operator to two resolved operands.
    pub fn apply(self, lhs: f64, rhs: f64) -> Result<f64> {
        match self {
            Operator::Add => Ok(lhs + rhs),
            Operator::Subtract => Ok(lhs - rhs),
            Operator::Multiply => Ok(lhs * rhs),
            Operator::Divide if rhs == 0.0 => Err(CalcError::DivisionByZero),
            Operator::Divide => Ok(lhs / rhs),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A computation to evaluate.
#[derive(Debug, Clone)]
pub enum Expression {
    /// A constant.
    Literal(f64),
    /// The result of an earlier evaluation, possibly still pending.
    PreviousResult(Value),
    /// Index into the argument frame of the enclosing function body.
    Parameter(u32),
    /// Invocation of a function on evaluated arguments.
    Call(Call),
}

/// Function reference plus argument expressions.
#[derive(Debug, Clone)]
pub struct Call {
    pub function: Function,
    pub params: Vec<Expression>,
}

impl Expression {
    pub fn literal(value: f64) -> Self {
        Expression::Literal(value)
    }

    pub fn previous_result(value: &Value) -> Self {
        Expression::PreviousResult(value.clone())
    }

    pub fn parameter(index: u32) -> Self {
        Expression::Parameter(index)
    }

    pub fn call(function: &Function, params: Vec<Expression>) -> Self {
        Expression::Call(Call {
            function: function.clone(),
            params,
        })
    }

    /// Highest parameter index referenced anywhere in the tree.
    pub fn max_parameter_index(&self) -> Option<u32> {
        match self {
            Expression::Parameter(index) => Some(*index),
            Expression::Call(call) => call
                .params
                .iter()
                .filter_map(Expression::max_parameter_index)
                .max(),
            Expression::Literal(_) | Expression::PreviousResult(_) => None,
        }
    }
}

impl From<f64> for Expression {
    fn from(value: f64) -> Self {
        Expression::Literal(value)
    }
}

impl From<&Value> for Expression {
    fn from(value: &Value) -> Self {
        Expression::previous_result(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_ordinals_are_stable() {
        assert_eq!(Operator::Add.ordinal(), 0);
        assert_eq!(Operator::Subtract.ordinal(), 1);
        assert_eq!(Operator::Multiply.ordinal(), 2);
        assert_eq!(Operator::Divide.ordinal(), 3);

        for op in Operator::ALL {
            assert_eq!(Operator::from_ordinal(op.ordinal()).unwrap(), op);
        }
        assert_eq!(
            Operator::from_ordinal(4),
            Err(CalcError::InvalidOperator { ordinal: 4 })
        );
    }

    #[test]
    fn test_operator_apply() {
        assert_eq!(Operator::Add.apply(2.0, 3.0), Ok(5.0));
        assert_eq!(Operator::Subtract.apply(2.0, 3.0), Ok(-1.0));
        assert_eq!(Operator::Multiply.apply(2.0, 3.0), Ok(6.0));
        assert_eq!(Operator::Divide.apply(3.0, 2.0), Ok(1.5));
        assert_eq!(
            Operator::Divide.apply(1.0, 0.0),
            Err(CalcError::DivisionByZero)
        );
        assert_eq!(
            Operator::Divide.apply(1.0, -0.0),
            Err(CalcError::DivisionByZero)
        );
    }

    #[test]
    fn test_max_parameter_index() {
        let add = Function::operator(Operator::Add);
        let body = Expression::call(
            &add,
            vec![
                Expression::parameter(1),
                Expression::call(&add, vec![Expression::parameter(4), 2.0.into()]),
            ],
        );
        assert_eq!(body.max_parameter_index(), Some(4));
        assert_eq!(Expression::literal(1.0).max_parameter_index(), None);
    }
}
