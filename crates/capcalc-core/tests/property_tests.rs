//! Property-based tests for evaluation and pipelining.
//!
//! Local properties run on a blocking executor: operators and defined
//! functions on resolved arguments never need the async runtime. Wire
//! properties share one server and client on a background runtime.

use capcalc_core::{
    Calculator, CalculatorClient, CalculatorServer, Expression, Operator, ServerHandle,
};
use futures::executor::block_on;
use proptest::prelude::*;
use std::sync::OnceLock;
use tokio::runtime::Runtime;

struct Remote {
    runtime: Runtime,
    client: CalculatorClient,
    _server: ServerHandle,
}

fn remote() -> &'static Remote {
    static REMOTE: OnceLock<Remote> = OnceLock::new();
    REMOTE.get_or_init(|| {
        let runtime = Runtime::new().unwrap();
        let (server, client) = runtime.block_on(async {
            let server = CalculatorServer::start_local(Calculator::new()).await.unwrap();
            let client = CalculatorClient::connect(server.addr()).await.unwrap();
            (server, client)
        });
        Remote {
            runtime,
            client,
            _server: server,
        }
    })
}

fn same_number(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

fn operand() -> impl Strategy<Value = f64> {
    -1.0e6..1.0e6
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    #[test]
    fn prop_literal_reads_back(x in any::<f64>()) {
        let calculator = Calculator::new();
        let read = block_on(calculator.evaluate(Expression::literal(x)).read()).unwrap();
        prop_assert!(same_number(read, x));
    }

    #[test]
    fn prop_literal_survives_the_wire(x in any::<f64>()) {
        let remote = remote();
        let value = remote.client.evaluate(Expression::literal(x));
        let read = remote.runtime.block_on(value.read()).unwrap();
        prop_assert!(same_number(read, x));
    }

    #[test]
    fn prop_operators_match_arithmetic(a in operand(), b in operand()) {
        let calculator = Calculator::new();
        let call = |op: Operator| block_on(calculator.get_operator(op).call(&[a, b]));

        prop_assert_eq!(call(Operator::Add).unwrap(), a + b);
        prop_assert_eq!(call(Operator::Subtract).unwrap(), a - b);
        prop_assert_eq!(call(Operator::Multiply).unwrap(), a * b);
        if b == 0.0 {
            prop_assert!(call(Operator::Divide).is_err());
        } else {
            prop_assert_eq!(call(Operator::Divide).unwrap(), a / b);
        }
    }

    #[test]
    fn prop_function_call_matches_substituted_body(a in operand(), b in operand()) {
        let calculator = Calculator::new();
        let multiply = calculator.get_operator(Operator::Multiply);
        let subtract = calculator.get_operator(Operator::Subtract);
        let body = |x: Expression, y: Expression| {
            Expression::call(
                &subtract,
                vec![Expression::call(&multiply, vec![x, y.clone()]), y],
            )
        };

        let function = calculator
            .def_function(2, body(Expression::parameter(0), Expression::parameter(1)))
            .unwrap();
        let called = block_on(function.call(&[a, b])).unwrap();
        let direct = block_on(calculator.evaluate(body(a.into(), b.into())).read()).unwrap();
        prop_assert_eq!(called, direct);
    }

    #[test]
    fn prop_pipelining_matches_direct_evaluation(a in operand(), b in operand(), c in operand()) {
        let remote = remote();
        let client = &remote.client;
        let add = client.get_operator(Operator::Add).unwrap();
        let multiply = client.get_operator(Operator::Multiply).unwrap();

        let product = Expression::call(&multiply, vec![a.into(), b.into()]);
        let direct = client.evaluate(Expression::call(&add, vec![product.clone(), c.into()]));

        let first = client.evaluate(product);
        let pipelined = client.evaluate(Expression::call(&add, vec![(&first).into(), c.into()]));

        let (direct, pipelined) = remote
            .runtime
            .block_on(async { tokio::join!(direct.read(), pipelined.read()) });
        prop_assert_eq!(direct.unwrap(), pipelined.unwrap());
    }
}
