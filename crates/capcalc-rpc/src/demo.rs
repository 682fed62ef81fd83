//! Client walkthrough against a running server.
//!
//! Each scenario prints its name, checks the result and prints `PASS`.

use anyhow::{ensure, Context, Result};
use capcalc_core::{
    CalculatorClient, CalcError, Expression, Function, NativeFunction, Operator,
};
use tracing::{debug, info};

/// `pow(base, exponent)`, hosted by the client and called back by the server.
pub struct PowerFunction;

#[async_trait::async_trait]
impl NativeFunction for PowerFunction {
    fn param_count(&self) -> usize {
        2
    }

    async fn call(&self, params: &[f64]) -> capcalc_core::Result<f64> {
        match params {
            [base, exponent] => {
                debug!(base, exponent, "server called back into pow");
                Ok(base.powf(*exponent))
            }
            _ => Err(CalcError::ArityMismatch {
                expected: 2,
                actual: params.len(),
            }),
        }
    }
}

/// Run every scenario against the server at `addr`.
pub async fn run(addr: &str) -> Result<()> {
    let client = CalculatorClient::connect(addr)
        .await
        .with_context(|| format!("connecting to {}", addr))?;
    info!("Connected to {}", client.addr());

    evaluate_literal(&client).await?;
    add_and_subtract(&client).await?;
    pipelining(&client).await?;
    defining_functions(&client).await?;
    callback(&client).await?;

    client.close();
    Ok(())
}

async fn evaluate_literal(client: &CalculatorClient) -> Result<()> {
    println!("Evaluating a literal...");
    let value = client.evaluate(Expression::literal(123.0));
    let result = value.read().await?;
    ensure!(result == 123.0, "expected 123, got {}", result);
    println!("PASS");
    Ok(())
}

async fn add_and_subtract(client: &CalculatorClient) -> Result<()> {
    println!("Using add and subtract...");
    let add = client.get_operator(Operator::Add)?;
    let subtract = client.get_operator(Operator::Subtract)?;

    // 123 + 45 - 67
    let value = client.evaluate(Expression::call(
        &subtract,
        vec![
            Expression::call(&add, vec![123.0.into(), 45.0.into()]),
            67.0.into(),
        ],
    ));
    let result = value.read().await?;
    ensure!(result == 101.0, "expected 101, got {}", result);
    println!("PASS");
    Ok(())
}

async fn pipelining(client: &CalculatorClient) -> Result<()> {
    println!("Pipelining eval() calls...");
    let add = client.get_operator(Operator::Add)?;
    let multiply = client.get_operator(Operator::Multiply)?;

    // 4 * 6, never read directly
    let product = client.evaluate(Expression::call(&multiply, vec![4.0.into(), 6.0.into()]));

    let plus_three = client.evaluate(Expression::call(&add, vec![(&product).into(), 3.0.into()]));
    let plus_five = client.evaluate(Expression::call(&add, vec![(&product).into(), 5.0.into()]));

    let (three, five) = tokio::try_join!(plus_three.read(), plus_five.read())?;
    ensure!(three == 27.0, "expected 27, got {}", three);
    ensure!(five == 29.0, "expected 29, got {}", five);
    println!("PASS");
    Ok(())
}

async fn defining_functions(client: &CalculatorClient) -> Result<()> {
    println!("Defining functions...");
    let add = client.get_operator(Operator::Add)?;
    let multiply = client.get_operator(Operator::Multiply)?;

    // f(x, y) = x * 100 + y
    let f = client.def_function(
        2,
        Expression::call(
            &add,
            vec![
                Expression::call(&multiply, vec![Expression::parameter(0), 100.0.into()]),
                Expression::parameter(1),
            ],
        ),
    )?;

    // g(x) = f(x, x + 1) * 2
    let g = client.def_function(
        1,
        Expression::call(
            &multiply,
            vec![
                Expression::call(
                    &f,
                    vec![
                        Expression::parameter(0),
                        Expression::call(&add, vec![Expression::parameter(0), 1.0.into()]),
                    ],
                ),
                2.0.into(),
            ],
        ),
    )?;

    let f_value = client.evaluate(call_with_literals(&f, &[12.0, 34.0]));
    let g_value = client.evaluate(call_with_literals(&g, &[21.0]));

    let (f_result, g_result) = tokio::try_join!(f_value.read(), g_value.read())?;
    ensure!(f_result == 1234.0, "expected f(12, 34) = 1234, got {}", f_result);
    ensure!(g_result == 4244.0, "expected g(21) = 4244, got {}", g_result);
    println!("PASS");
    Ok(())
}

async fn callback(client: &CalculatorClient) -> Result<()> {
    println!("Using a callback...");
    let add = client.get_operator(Operator::Add)?;
    let pow = Function::native(PowerFunction);

    // pow(2, 4 + 5), with pow running in this process
    let value = client.evaluate(Expression::call(
        &pow,
        vec![
            2.0.into(),
            Expression::call(&add, vec![4.0.into(), 5.0.into()]),
        ],
    ));
    let result = value.read().await?;
    ensure!(result == 512.0, "expected 512, got {}", result);
    println!("PASS");
    Ok(())
}

fn call_with_literals(function: &Function, args: &[f64]) -> Expression {
    Expression::call(function, args.iter().copied().map(Expression::literal).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_power_function() {
        let pow = Function::native(PowerFunction);
        assert_eq!(pow.call(&[2.0, 9.0]).await, Ok(512.0));
        assert_eq!(
            pow.call(&[2.0]).await,
            Err(CalcError::ArityMismatch {
                expected: 2,
                actual: 1
            })
        );
    }
}
