//! End-to-end tests over a loopback TCP connection.
//!
//! Each test starts a real server on an OS-assigned port and talks to it
//! through `CalculatorClient`.

use capcalc_core::{
    CalcError, Calculator, CalculatorClient, CalculatorServer, CalculatorService, Expression,
    Function, NativeFunction, Operator, ServerHandle, Value,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn connect() -> (ServerHandle, CalculatorClient) {
    let handle = CalculatorServer::start_local(Calculator::new()).await.unwrap();
    let client = CalculatorClient::connect(handle.addr()).await.unwrap();
    (handle, client)
}

struct Power {
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl NativeFunction for Power {
    fn param_count(&self) -> usize {
        2
    }

    async fn call(&self, params: &[f64]) -> capcalc_core::Result<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(params[0].powf(params[1]))
    }
}

#[tokio::test]
async fn test_evaluate_literal() {
    let (_server, client) = connect().await;
    let value = client.evaluate(Expression::literal(123.0));
    assert_eq!(value.read().await, Ok(123.0));
}

#[tokio::test]
async fn test_add_and_subtract() {
    let (_server, client) = connect().await;
    let add = client.get_operator(Operator::Add).unwrap();
    let subtract = client.get_operator(Operator::Subtract).unwrap();

    let value = client.evaluate(Expression::call(
        &subtract,
        vec![
            Expression::call(&add, vec![123.0.into(), 45.0.into()]),
            67.0.into(),
        ],
    ));
    assert_eq!(value.read().await, Ok(101.0));
}

#[tokio::test]
async fn test_pipelined_product_is_shared() {
    let (_server, client) = connect().await;
    let add = client.get_operator(Operator::Add).unwrap();
    let multiply = client.get_operator(Operator::Multiply).unwrap();

    let product = client.evaluate(Expression::call(&multiply, vec![4.0.into(), 6.0.into()]));
    let plus_three = client.evaluate(Expression::call(&add, vec![(&product).into(), 3.0.into()]));
    let plus_five = client.evaluate(Expression::call(&add, vec![(&product).into(), 5.0.into()]));

    // Nothing has been read yet: all three values are still names.
    assert!(!product.is_resolved());

    assert_eq!(plus_three.read().await, Ok(27.0));
    assert_eq!(plus_five.read().await, Ok(29.0));
    assert_eq!(product.read().await, Ok(24.0));
}

#[tokio::test]
async fn test_defined_functions() {
    let (_server, client) = connect().await;
    let add = client.get_operator(Operator::Add).unwrap();
    let multiply = client.get_operator(Operator::Multiply).unwrap();

    // f(x, y) = x * 100 + y
    let f = client
        .def_function(
            2,
            Expression::call(
                &add,
                vec![
                    Expression::call(&multiply, vec![Expression::parameter(0), 100.0.into()]),
                    Expression::parameter(1),
                ],
            ),
        )
        .unwrap();

    // g(x) = f(x, x + 1) * 2
    let g = client
        .def_function(
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
        )
        .unwrap();

    let f_value = client.evaluate(Expression::call(&f, vec![12.0.into(), 34.0.into()]));
    let g_value = client.evaluate(Expression::call(&g, vec![21.0.into()]));

    assert_eq!(f_value.read().await, Ok(1234.0));
    assert_eq!(g_value.read().await, Ok(4244.0));

    // Calling the stubs directly is a round trip per call.
    assert_eq!(f.call(&[1.0, 2.0]).await, Ok(102.0));
    assert_eq!(g.call(&[0.0]).await, Ok(2.0));
}

#[tokio::test]
async fn test_client_callback() {
    let (_server, client) = connect().await;
    let add = client.get_operator(Operator::Add).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let pow = Function::native(Power {
        calls: Arc::clone(&calls),
    });

    let value = client.evaluate(Expression::call(
        &pow,
        vec![
            2.0.into(),
            Expression::call(&add, vec![4.0.into(), 5.0.into()]),
        ],
    ));
    assert_eq!(value.read().await, Ok(512.0));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_division_by_zero_is_isolated() {
    let (_server, client) = connect().await;
    let divide = client.get_operator(Operator::Divide).unwrap();
    let add = client.get_operator(Operator::Add).unwrap();

    let broken = client.evaluate(Expression::call(&divide, vec![1.0.into(), 0.0.into()]));
    let fine = client.evaluate(Expression::call(&add, vec![1.0.into(), 1.0.into()]));

    let (broken, fine) = tokio::join!(broken.read(), fine.read());
    assert_eq!(broken, Err(CalcError::DivisionByZero));
    assert_eq!(fine, Ok(2.0));

    // The session is still usable afterwards.
    assert_eq!(divide.call(&[9.0, 3.0]).await, Ok(3.0));
}

#[tokio::test]
async fn test_failed_value_reports_same_error_to_every_reader() {
    let (_server, client) = connect().await;
    let divide = client.get_operator(Operator::Divide).unwrap();
    let add = client.get_operator(Operator::Add).unwrap();

    let broken = client.evaluate(Expression::call(&divide, vec![1.0.into(), 0.0.into()]));
    let dependent = client.evaluate(Expression::call(&add, vec![(&broken).into(), 1.0.into()]));

    assert_eq!(dependent.read().await, Err(CalcError::DivisionByZero));
    assert_eq!(broken.read().await, Err(CalcError::DivisionByZero));
    assert_eq!(broken.read().await, Err(CalcError::DivisionByZero));
}

#[tokio::test]
async fn test_arity_mismatch_fails_only_the_call() {
    let (_server, client) = connect().await;
    let add = client.get_operator(Operator::Add).unwrap();

    let bad = client.evaluate(Expression::call(&add, vec![1.0.into(), 2.0.into(), 3.0.into()]));
    let good = client.evaluate(Expression::call(&add, vec![1.0.into(), 2.0.into()]));

    assert_eq!(
        bad.read().await,
        Err(CalcError::ArityMismatch {
            expected: 2,
            actual: 3
        })
    );
    assert_eq!(good.read().await, Ok(3.0));
}

#[tokio::test]
async fn test_parameter_errors_cross_the_wire() {
    let (_server, client) = connect().await;

    let top_level = client.evaluate(Expression::parameter(0));
    assert_eq!(top_level.read().await, Err(CalcError::NoActiveFrame));

    let function = client.def_function(1, Expression::parameter(2)).unwrap();
    let value = client.evaluate(Expression::call(&function, vec![5.0.into()]));
    assert_eq!(
        value.read().await,
        Err(CalcError::ParameterIndexOutOfRange {
            index: 2,
            param_count: 1
        })
    );
}

#[tokio::test]
async fn test_local_value_is_read_by_the_server() {
    let (_server, client) = connect().await;
    let add = client.get_operator(Operator::Add).unwrap();

    let (local, resolver) = Value::pending();
    let sum = client.evaluate(Expression::call(&add, vec![(&local).into(), 1.0.into()]));

    let reader = tokio::spawn(async move { sum.read().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    resolver.fulfill(41.0);

    assert_eq!(reader.await.unwrap(), Ok(42.0));
}

#[tokio::test]
async fn test_remote_function_invoked_on_pending_values() {
    let (_server, client) = connect().await;
    let multiply = client.get_operator(Operator::Multiply).unwrap();

    let six = client.evaluate(Expression::literal(6.0));
    let product = multiply.invoke(vec![six.clone(), Value::resolved(7.0)]);
    assert_eq!(product.read().await, Ok(42.0));

    // The argument went to the server by reference and was never read back.
    assert!(!six.is_resolved());
}

#[tokio::test]
async fn test_long_pipelined_chain_on_pending_seed() {
    let (_server, client) = connect().await;
    let add = client.get_operator(Operator::Add).unwrap();

    let (seed, resolver) = Value::pending();
    let mut last = seed;
    for _ in 0..10_000 {
        last = client.evaluate(Expression::call(&add, vec![(&last).into(), 1.0.into()]));
    }

    let reader = tokio::spawn(async move { last.read().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    resolver.fulfill(0.0);

    let outcome = tokio::time::timeout(Duration::from_secs(30), reader)
        .await
        .expect("chain should resolve")
        .unwrap();
    assert_eq!(outcome, Ok(10_000.0));
}

#[tokio::test]
async fn test_trait_object_over_both_calculators() {
    let (_server, client) = connect().await;
    let services: Vec<Box<dyn CalculatorService>> = vec![Box::new(Calculator::new()), Box::new(client)];

    for service in &services {
        let subtract = service.get_operator(Operator::Subtract).unwrap();
        let nine = service.evaluate(Expression::literal(9.0));
        let five = service.evaluate(Expression::call(
            &subtract,
            vec![(&nine).into(), 4.0.into()],
        ));
        assert_eq!(five.read().await, Ok(5.0));

        let sum = service
            .def_function(
                2,
                Expression::call(
                    &service.get_operator(Operator::Add).unwrap(),
                    vec![Expression::parameter(0), Expression::parameter(1)],
                ),
            )
            .unwrap();
        assert_eq!(sum.call(&[3.0, 4.0]).await, Ok(7.0));
    }
}

#[tokio::test]
async fn test_server_shutdown_fails_pending_reads() {
    let (mut server, client) = connect().await;
    let add = client.get_operator(Operator::Add).unwrap();

    // Never resolved, so the server waits on this process forever.
    let (stalled, _resolver) = Value::pending();
    let value = client.evaluate(Expression::call(&add, vec![(&stalled).into(), 1.0.into()]));
    let reader = tokio::spawn(async move { value.read().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    server.shutdown();

    let outcome = tokio::time::timeout(Duration::from_secs(5), reader)
        .await
        .expect("read should fail once the server is gone")
        .unwrap();
    assert!(matches!(
        outcome,
        Err(CalcError::RemoteDispatchFailure { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_clients_concurrently() {
    let server = CalculatorServer::start_local(Calculator::new()).await.unwrap();
    let addr = server.addr();

    let runs = (0..8).map(|i| async move {
        let client = CalculatorClient::connect(addr).await?;
        let multiply = client.get_operator(Operator::Multiply)?;
        let value = client.evaluate(Expression::call(
            &multiply,
            vec![f64::from(i).into(), 10.0.into()],
        ));
        value.read().await
    });

    let results = futures::future::join_all(runs).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result, Ok(i as f64 * 10.0));
    }
}
