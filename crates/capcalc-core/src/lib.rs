//! capcalc core - capability-based arithmetic calculator with promise pipelining.
//!
//! Every intermediate result is a [`Value`] capability rather than a plain
//! number, so dependent computations can be chained before anything has
//! resolved. The same [`CalculatorService`] surface is offered in-process by
//! [`Calculator`] and across a TCP connection by [`CalculatorClient`].
//!
//! # Example
//!
//! ```rust,ignore
//! use capcalc_core::{CalculatorClient, Expression, Operator};
//!
//! #[tokio::main]
//! async fn main() -> capcalc_core::Result<()> {
//!     let client = CalculatorClient::connect("127.0.0.1:7878").await?;
//!     let multiply = client.get_operator(Operator::Multiply)?;
//!     let add = client.get_operator(Operator::Add)?;
//!
//!     // 4 * 6, still in flight when it is reused below
//!     let product = client.evaluate(Expression::call(&multiply, vec![4.0.into(), 6.0.into()]));
//!     let sum = client.evaluate(Expression::call(&add, vec![(&product).into(), 3.0.into()]));
//!     println!("4 * 6 + 3 = {}", sum.read().await?);
//!
//!     Ok(())
//! }
//! ```

pub mod capability;
pub mod config;
pub mod error;
pub mod eval;
pub mod expression;
pub mod function;
pub mod rpc;
pub mod value;

mod calculator;
mod dispatch;

// Re-export commonly used types
pub use calculator::{Calculator, CalculatorService};
pub use capability::{Capability, CapabilityId, CapabilityTable};
pub use config::{EvalConfig, RpcConfig};
pub use error::{CalcError, Result};
pub use eval::Frame;
pub use expression::{Call, Expression, Operator};
pub use function::{Function, NativeFunction};
pub use rpc::{CalculatorClient, CalculatorServer, ServerHandle};
pub use value::{Outcome, Resolver, Value};
