//! TCP client for a remote calculator.
//!
//! [`CalculatorClient`] offers the same surface as a local [`Calculator`]
//! (through [`CalculatorService`]) but every capability it hands out lives on
//! the server. Calls never wait for the network: each request is sent at
//! once and its result is named by question id, so results can be passed
//! into further requests before they arrive.
//!
//! The connection is symmetric. Local functions and values embedded in
//! expressions are exported to the server, which calls back into this
//! process to use them.
//!
//! [`Calculator`]: crate::Calculator

use super::session::Session;
use crate::calculator::CalculatorService;
use crate::config::RpcConfig;
use crate::error::{CalcError, Result};
use crate::expression::{Expression, Operator};
use crate::function::Function;
use crate::value::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tracing::debug;

/// Connection to a calculator server.
#[derive(Debug)]
pub struct CalculatorClient {
    session: Arc<Session>,
    addr: SocketAddr,
    _shutdown_tx: watch::Sender<bool>,
}

impl CalculatorClient {
    /// Connect to a server.
    ///
    /// Uses the configured connection timeout from `RpcConfig`.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = tokio::time::timeout(RpcConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| CalcError::Timeout(RpcConfig::CONNECT_TIMEOUT))?
            .map_err(|e| CalcError::remote(format!("connect failed: {}", e)))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (session, _task) = Session::start(stream, None, true, shutdown_rx)?;
        let addr = session.peer();

        debug!("Calculator client connected to {}", addr);

        Ok(Self {
            session,
            addr,
            _shutdown_tx: shutdown_tx,
        })
    }

    /// Evaluate on the server. The value resolves when read.
    pub fn evaluate(&self, expression: Expression) -> Value {
        self.session.remote_evaluate(&expression)
    }

    /// Define a function on the server.
    ///
    /// Negative parameter counts are rejected here; other problems with the
    /// definition surface when the function is called.
    pub fn def_function(&self, param_count: i32, body: Expression) -> Result<Function> {
        self.session.remote_def_function(param_count, &body)
    }

    /// Get one of the server's operator functions.
    pub fn get_operator(&self, op: Operator) -> Result<Function> {
        self.session.remote_get_operator(op)
    }

    /// Get the address of the connected server.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the connection has ended.
    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Close the connection. Pending remote results fail with
    /// [`CalcError::RemoteDispatchFailure`].
    pub fn close(&self) {
        self.session.close();
    }
}

impl CalculatorService for CalculatorClient {
    fn evaluate(&self, expression: Expression) -> Value {
        CalculatorClient::evaluate(self, expression)
    }

    fn def_function(&self, param_count: i32, body: Expression) -> Result<Function> {
        CalculatorClient::def_function(self, param_count, body)
    }

    fn get_operator(&self, op: Operator) -> Result<Function> {
        CalculatorClient::get_operator(self, op)
    }
}

impl Drop for CalculatorClient {
    fn drop(&mut self) {
        self.session.close();
    }
}
