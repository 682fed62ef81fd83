//! One end of a connection.
//!
//! Both peers run the same session: either side may send requests, host
//! capabilities the other side references, and answer calls on them. A
//! session owns four tables:
//!
//! - **questions**: requests this side sent that still await a reply.
//! - **exports**: local capabilities the peer holds references to.
//! - **answers**: for each of the peer's capability-producing questions,
//!   the export that question produced.
//! - the outbound queue drained by the writer task.
//!
//! Requests that produce capabilities are handled inline by the reader, so
//! a request may name the answer to any request that arrived before it.
//! Requests that have to wait for a value (`value.read`, `function.call`)
//! run as their own tasks.

use super::protocol::{
    read_frame, write_frame, CallParams, DefFunctionParams, EvaluateParams, FunctionResult,
    GetOperatorParams, Method, NumberResult, RpcMessage, RpcRequest, RpcResponse, TargetParams,
    ValueResult, WireCall, WireCap, WireExpression, WireF64,
};
use crate::calculator::Calculator;
use crate::capability::{Capability, CapabilityId, CapabilityTable};
use crate::config::RpcConfig;
use crate::error::{CalcError, Result};
use crate::expression::{Expression, Operator};
use crate::function::Function;
use crate::value::{Outcome, Resolver, Value};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type ReplySender = oneshot::Sender<Result<serde_json::Value>>;

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

/// What one of the peer's questions produced.
#[derive(Debug, Clone)]
enum Answer {
    Exported(CapabilityId),
    Broken(CalcError),
}

/// Where a capability hosted by the peer lives, in the peer's terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoteTarget {
    /// An object the peer exported under this id.
    Export(CapabilityId),
    /// The result of our question with this id.
    Answer(u64),
}

impl RemoteTarget {
    /// How the hosting peer names this capability.
    fn to_wire(self) -> WireCap {
        match self {
            RemoteTarget::Export(id) => WireCap::ReceiverHosted(id),
            RemoteTarget::Answer(question) => WireCap::PromisedAnswer(question),
        }
    }
}

/// Shared state of one connection.
pub(crate) struct Session {
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Outbound>,
    next_question: AtomicU64,
    questions: DashMap<u64, Option<ReplySender>>,
    exports: CapabilityTable,
    answers: DashMap<u64, Answer>,
    bootstrap: Option<Calculator>,
    /// Whether the peer serves the calculator methods to this side.
    peer_calculator: bool,
    closed: AtomicBool,
}

impl Session {
    /// Start reader and writer tasks for `stream`.
    ///
    /// If `bootstrap` is set, the peer may use the calculator methods;
    /// `peer_calculator` says whether the peer offers them in return. The
    /// returned task finishes when the connection ends or `shutdown` fires.
    pub(crate) fn start(
        stream: TcpStream,
        bootstrap: Option<Calculator>,
        peer_calculator: bool,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Arc<Session>, JoinHandle<()>)> {
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let session = Arc::new(Session {
            peer,
            outbound,
            next_question: AtomicU64::new(1),
            questions: DashMap::new(),
            exports: CapabilityTable::new(),
            answers: DashMap::new(),
            bootstrap,
            peer_calculator,
            closed: AtomicBool::new(false),
        });

        tokio::spawn(write_loop(writer, outbound_rx, peer));
        let task = tokio::spawn(read_loop(Arc::clone(&session), reader, shutdown));
        Ok((session, task))
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of capabilities the peer currently holds from this side.
    #[cfg(test)]
    pub(crate) fn export_count(&self) -> usize {
        self.exports.len()
    }

    /// Number of the peer's answers still held.
    #[cfg(test)]
    pub(crate) fn answer_count(&self) -> usize {
        self.answers.len()
    }

    /// Stop the session: fail outstanding questions and drop every table.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(peer = %self.peer, "closing session");
        let _ = self.outbound.send(Outbound::Close);

        let pending: Vec<u64> = self.questions.iter().map(|entry| *entry.key()).collect();
        for question in pending {
            if let Some((_, Some(reply))) = self.questions.remove(&question) {
                let _ = reply.send(Err(CalcError::remote("connection closed")));
            }
        }

        self.answers.clear();
        let dropped = self.exports.clear();
        if dropped > 0 {
            debug!(peer = %self.peer, dropped, "released exports of closed session");
        }
    }

    // ---------------------------------------------------------------------
    // Outgoing
    // ---------------------------------------------------------------------

    fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        if self.is_closed() {
            return Err(CalcError::remote("connection closed"));
        }
        let bytes = serde_json::to_vec(message)?;
        self.outbound
            .send(Outbound::Frame(bytes))
            .map_err(|_| CalcError::remote("connection closed"))
    }

    fn send_question<P: Serialize>(
        &self,
        method: Method,
        params: &P,
        reply: Option<ReplySender>,
    ) -> Result<u64> {
        let question = self.next_question.fetch_add(1, Ordering::Relaxed);
        let params = serde_json::to_value(params)?;
        self.questions.insert(question, reply);

        // Registered before checking, so `close` either sees the entry or we
        // see the flag.
        let sent = if self.is_closed() {
            Err(CalcError::remote("connection closed"))
        } else {
            self.send(&RpcRequest::new(method, params, question))
        };
        if sent.is_err() {
            self.questions.remove(&question);
        }
        sent.map(|_| question)
    }

    /// Send a request and wait for its reply.
    async fn request<P: Serialize, R: DeserializeOwned>(&self, method: Method, params: &P) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        let question = self.send_question(method, params, Some(tx))?;
        debug!(peer = %self.peer, question, %method, "sent request");

        let result = rx
            .await
            .map_err(|_| CalcError::remote("connection closed before reply"))??;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a request whose result will only ever be named, never awaited.
    fn pipeline<P: Serialize>(&self, method: Method, params: &P) -> Result<u64> {
        let question = self.send_question(method, params, None)?;
        debug!(peer = %self.peer, question, %method, "sent pipelined request");
        Ok(question)
    }

    fn notify<P: Serialize>(&self, method: Method, params: &P) -> Result<()> {
        let params = serde_json::to_value(params)?;
        self.send(&RpcRequest::notification(method, params))
    }

    fn reply(&self, id: Option<u64>, result: Result<serde_json::Value>) {
        let response = match result {
            Ok(value) => RpcResponse::success(id, value),
            Err(error) => {
                debug!(peer = %self.peer, question = ?id, %error, "replying with error");
                RpcResponse::failure(id, &error)
            }
        };
        if let Err(error) = self.send(&response) {
            debug!(peer = %self.peer, question = ?id, %error, "dropping reply");
        }
    }

    // ---------------------------------------------------------------------
    // Calculator surface backed by the peer
    // ---------------------------------------------------------------------

    pub(crate) fn remote_evaluate(self: &Arc<Self>, expression: &Expression) -> Value {
        let question = self.with_exports(|session, exported| {
            let expression = session.encode_expression(expression, exported)?;
            session.pipeline(Method::Evaluate, &EvaluateParams { expression })
        });
        match question {
            Ok(question) => Value::remote(RemoteHandle::new(self, RemoteTarget::Answer(question))),
            Err(error) => Value::failed(error),
        }
    }

    pub(crate) fn remote_def_function(
        self: &Arc<Self>,
        param_count: i32,
        body: &Expression,
    ) -> Result<Function> {
        if param_count < 0 {
            return Err(CalcError::InvalidArity {
                param_count: i64::from(param_count),
            });
        }
        let question = self.with_exports(|session, exported| {
            let body = session.encode_expression(body, exported)?;
            session.pipeline(Method::DefFunction, &DefFunctionParams { param_count, body })
        })?;
        Ok(Function::remote(RemoteHandle::new(
            self,
            RemoteTarget::Answer(question),
        )))
    }

    pub(crate) fn remote_get_operator(self: &Arc<Self>, op: Operator) -> Result<Function> {
        let question = self.pipeline(Method::GetOperator, &GetOperatorParams { op: op.ordinal() })?;
        Ok(Function::remote(RemoteHandle::new(
            self,
            RemoteTarget::Answer(question),
        )))
    }

    /// Run `encode`, undoing its exports if it fails.
    fn with_exports<T>(
        &self,
        encode: impl FnOnce(&Self, &mut Vec<CapabilityId>) -> Result<T>,
    ) -> Result<T> {
        let mut exported = Vec::new();
        let result = encode(self, &mut exported);
        if result.is_err() {
            for id in exported {
                let _ = self.exports.release(id);
            }
        }
        result
    }

    fn encode_expression(
        &self,
        expression: &Expression,
        exported: &mut Vec<CapabilityId>,
    ) -> Result<WireExpression> {
        Ok(match expression {
            Expression::Literal(value) => WireExpression::Literal(WireF64(*value)),
            Expression::Parameter(index) => WireExpression::Parameter(*index),
            Expression::PreviousResult(value) => WireExpression::PreviousResult(self.encode_cap(
                value.remote_handle(),
                || value.clone().into(),
                exported,
            )?),
            Expression::Call(call) => WireExpression::Call(WireCall {
                function: self.encode_cap(
                    call.function.remote_handle(),
                    || call.function.clone().into(),
                    exported,
                )?,
                params: call
                    .params
                    .iter()
                    .map(|param| self.encode_expression(param, exported))
                    .collect::<Result<_>>()?,
            }),
        })
    }

    fn encode_cap(
        &self,
        remote: Option<&RemoteHandle>,
        local: impl FnOnce() -> Capability,
        exported: &mut Vec<CapabilityId>,
    ) -> Result<WireCap> {
        match remote {
            Some(handle) if handle.is_hosted_by(self) => Ok(handle.target.to_wire()),
            Some(_) => Err(CalcError::Validation {
                field: "capability".to_string(),
                message: "capability is hosted by a different peer".to_string(),
            }),
            None => {
                let id = self.exports.export(local());
                exported.push(id);
                Ok(WireCap::SenderHosted(id))
            }
        }
    }

    // ---------------------------------------------------------------------
    // Incoming
    // ---------------------------------------------------------------------

    fn handle_frame(self: &Arc<Self>, frame: &[u8]) {
        let message: RpcMessage = match serde_json::from_slice(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %self.peer, "unparseable message: {}", e);
                self.reply(None, Err(e.into()));
                return;
            }
        };

        match message {
            RpcMessage::Response(response) => self.handle_response(response),
            RpcMessage::Request(request) => self.handle_request(request),
        }
    }

    fn handle_response(&self, response: RpcResponse) {
        let Some(question) = response.id else {
            warn!(peer = %self.peer, "peer reported an error: {:?}", response.error);
            return;
        };
        match self.questions.remove(&question) {
            Some((_, Some(reply))) => {
                let _ = reply.send(response.into_result());
            }
            Some((_, None)) => {
                if let Err(error) = response.into_result() {
                    debug!(peer = %self.peer, question, %error, "pipelined request failed");
                }
            }
            None => warn!(peer = %self.peer, question, "reply to unknown question"),
        }
    }

    fn handle_request(self: &Arc<Self>, request: RpcRequest) {
        let id = request.id;
        if request.jsonrpc != RpcConfig::JSONRPC_VERSION {
            self.reply(id, Err(CalcError::protocol("expected jsonrpc 2.0")));
            return;
        }
        let Some(method) = Method::from_name(&request.method) else {
            self.reply(
                id,
                Err(CalcError::protocol(format!("unknown method: {}", request.method))),
            );
            return;
        };
        let params = request
            .params
            .unwrap_or(serde_json::Value::Object(Default::default()));

        if method == Method::Release {
            self.handle_release(params);
            return;
        }
        let Some(question) = id else {
            warn!(peer = %self.peer, %method, "ignoring request without id");
            return;
        };

        debug!(peer = %self.peer, question, %method, "received request");
        match method {
            Method::Evaluate => {
                let result = self.answer(question, || {
                    let params: EvaluateParams = parse(params)?;
                    let calculator = self.calculator()?;
                    // A bad reference only fails the value, like any other
                    // argument error.
                    let value = match self.import_expression(&params.expression) {
                        Ok(expression) => calculator.evaluate(expression),
                        Err(error) => Value::failed(error),
                    };
                    Ok(value.into())
                });
                self.reply(id, result.and_then(|value| to_json(ValueResult { value })));
            }
            Method::DefFunction => {
                let result = self.answer(question, || {
                    let params: DefFunctionParams = parse(params)?;
                    let calculator = self.calculator()?;
                    let body = self.import_expression(&params.body)?;
                    Ok(calculator.def_function(params.param_count, body)?.into())
                });
                self.reply(id, result.and_then(|func| to_json(FunctionResult { func })));
            }
            Method::GetOperator => {
                let result = self.answer(question, || {
                    let params: GetOperatorParams = parse(params)?;
                    let calculator = self.calculator()?;
                    Ok(calculator.get_operator(Operator::from_ordinal(params.op)?).into())
                });
                self.reply(id, result.and_then(|func| to_json(FunctionResult { func })));
            }
            Method::Read => self.spawn_read(question, params),
            Method::Call => self.spawn_call(question, params),
            Method::Release => {}
        }
    }

    fn calculator(&self) -> Result<&Calculator> {
        self.bootstrap
            .as_ref()
            .ok_or_else(|| CalcError::protocol("peer does not export a calculator"))
    }

    /// Record what the peer's `question` produced, exporting it on success.
    ///
    /// Failures are recorded too, so pipelined requests naming the answer
    /// fail with the same error.
    fn answer(
        &self,
        question: u64,
        produce: impl FnOnce() -> Result<Capability>,
    ) -> Result<WireCap> {
        match produce() {
            Ok(capability) => {
                let id = self.exports.export(capability);
                self.answers.insert(question, Answer::Exported(id));
                Ok(WireCap::SenderHosted(id))
            }
            Err(error) => {
                self.answers.insert(question, Answer::Broken(error.clone()));
                Err(error)
            }
        }
    }

    fn spawn_read(self: &Arc<Self>, question: u64, params: serde_json::Value) {
        let value = parse::<TargetParams>(params)
            .and_then(|params| self.local_capability(&params.target))
            .and_then(Capability::into_value);
        let value = match value {
            Ok(value) => value,
            Err(error) => return self.reply(Some(question), Err(error)),
        };

        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            let outcome = value.read().await;
            if let Some(session) = session.upgrade() {
                session.reply(Some(question), number_result(outcome));
            }
        });
    }

    fn spawn_call(self: &Arc<Self>, question: u64, params: serde_json::Value) {
        let call = parse::<CallParams>(params).and_then(|params| {
            let function = self.local_capability(&params.target)?.into_function()?;
            let numbers: Vec<f64> = params.params.into_iter().map(|param| param.0).collect();
            Ok((function, numbers))
        });
        let (function, numbers) = match call {
            Ok(call) => call,
            Err(error) => return self.reply(Some(question), Err(error)),
        };

        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            let outcome = function.call(&numbers).await;
            if let Some(session) = session.upgrade() {
                session.reply(Some(question), number_result(outcome));
            }
        });
    }

    fn handle_release(&self, params: serde_json::Value) {
        let target = match parse::<TargetParams>(params) {
            Ok(params) => params.target,
            Err(error) => {
                warn!(peer = %self.peer, %error, "malformed release");
                return;
            }
        };
        let id = match target {
            WireCap::ReceiverHosted(id) => id,
            WireCap::PromisedAnswer(question) => match self.answers.remove(&question) {
                Some((_, Answer::Exported(id))) => id,
                Some((_, Answer::Broken(_))) => return,
                None => {
                    debug!(peer = %self.peer, question, "release of unknown answer");
                    return;
                }
            },
            WireCap::SenderHosted(id) => {
                warn!(peer = %self.peer, %id, "peer released a capability it hosts");
                return;
            }
        };
        match self.exports.release(id) {
            Ok(remaining) => debug!(peer = %self.peer, %id, remaining, "released export"),
            Err(error) => debug!(peer = %self.peer, %error, "release of unknown export"),
        }
    }

    /// A capability this side hosts, named by the peer.
    fn local_capability(&self, cap: &WireCap) -> Result<Capability> {
        match cap {
            WireCap::ReceiverHosted(id) => self.exports.get(*id),
            WireCap::PromisedAnswer(question) => match self.answers.get(question).map(|answer| answer.value().clone()) {
                Some(Answer::Exported(id)) => self.exports.get(id),
                Some(Answer::Broken(error)) => Err(error),
                None => Err(CalcError::protocol(format!("unknown answer {question}"))),
            },
            WireCap::SenderHosted(id) => Err(CalcError::protocol(format!(
                "{id} is hosted by the caller, not by this peer"
            ))),
        }
    }

    fn import_value(self: &Arc<Self>, cap: &WireCap) -> Result<Value> {
        match cap {
            WireCap::SenderHosted(id) => Ok(Value::remote(RemoteHandle::new(
                self,
                RemoteTarget::Export(*id),
            ))),
            other => self.local_capability(other)?.into_value(),
        }
    }

    fn import_function(self: &Arc<Self>, cap: &WireCap) -> Result<Function> {
        match cap {
            WireCap::SenderHosted(id) => Ok(Function::remote(RemoteHandle::new(
                self,
                RemoteTarget::Export(*id),
            ))),
            other => self.local_capability(other)?.into_function(),
        }
    }

    fn import_expression(self: &Arc<Self>, expression: &WireExpression) -> Result<Expression> {
        Ok(match expression {
            WireExpression::Literal(value) => Expression::Literal(value.0),
            WireExpression::Parameter(index) => Expression::Parameter(*index),
            WireExpression::PreviousResult(cap) => Expression::PreviousResult(self.import_value(cap)?),
            WireExpression::Call(call) => Expression::call(
                &self.import_function(&call.function)?,
                call.params
                    .iter()
                    .map(|param| self.import_expression(param))
                    .collect::<Result<_>>()?,
            ),
        })
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .field("questions", &self.questions.len())
            .field("exports", &self.exports.len())
            .field("answers", &self.answers.len())
            .finish()
    }
}

fn parse<T: DeserializeOwned>(params: serde_json::Value) -> Result<T> {
    Ok(serde_json::from_value(params)?)
}

fn to_json<T: Serialize>(result: T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(result)?)
}

fn number_result(outcome: Outcome) -> Result<serde_json::Value> {
    to_json(NumberResult {
        value: WireF64(outcome?),
    })
}

async fn read_loop(
    session: Arc<Session>,
    mut reader: tokio::net::tcp::OwnedReadHalf,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = session.peer;
    loop {
        let frame = tokio::select! {
            result = read_frame(&mut reader) => result,
            _ = shutdown.changed() => {
                debug!(peer = %peer, "session shutdown requested");
                break;
            }
        };
        match frame {
            Ok(Some(frame)) => session.handle_frame(&frame),
            Ok(None) => {
                debug!(peer = %peer, "peer closed connection");
                break;
            }
            Err(e) => {
                warn!(peer = %peer, "connection error: {}", e);
                break;
            }
        }
    }
    session.close();
    info!(peer = %peer, "session ended");
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    peer: SocketAddr,
) {
    while let Some(message) = outbound.recv().await {
        match message {
            Outbound::Frame(frame) => {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    debug!(peer = %peer, "write failed: {}", e);
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}

/// Reference to a capability hosted by the peer of a session.
///
/// Owning handles tell the peer to release the capability when dropped.
pub(crate) struct RemoteHandle {
    session: Weak<Session>,
    target: RemoteTarget,
    owned: bool,
}

impl RemoteHandle {
    pub(crate) fn new(session: &Arc<Session>, target: RemoteTarget) -> Self {
        Self {
            session: Arc::downgrade(session),
            target,
            owned: true,
        }
    }

    /// A copy that does not release the capability when dropped.
    fn detached(&self) -> Self {
        Self {
            session: self.session.clone(),
            target: self.target,
            owned: false,
        }
    }

    pub(crate) fn is_hosted_by(&self, session: &Session) -> bool {
        std::ptr::eq(self.session.as_ptr(), session)
    }

    fn session(&self) -> Result<Arc<Session>> {
        self.session
            .upgrade()
            .filter(|session| !session.is_closed())
            .ok_or_else(|| CalcError::remote("connection closed"))
    }

    /// Ask the peer for the number; completes `resolver` with the reply.
    pub(crate) fn fetch(&self, resolver: Resolver) {
        let handle = self.detached();
        resolver.resolve_with(async move {
            let session = handle.session()?;
            let result: NumberResult = session
                .request(
                    Method::Read,
                    &TargetParams {
                        target: handle.target.to_wire(),
                    },
                )
                .await?;
            Ok(result.value.0)
        });
    }

    /// Invoke the peer's function on `args` without waiting for them.
    ///
    /// The call is sent as a pipelined `evaluate`, so pending arguments
    /// travel by reference and the result is named by promised answer.
    /// Returns `None` if the peer has no calculator or an argument is
    /// hosted by another connection.
    pub(crate) fn pipeline_call(&self, function: &Function, args: &[Value]) -> Option<Value> {
        let session = self
            .session
            .upgrade()
            .filter(|session| session.peer_calculator && !session.is_closed())?;
        let foreign = args.iter().any(|arg| {
            arg.remote_handle()
                .is_some_and(|handle| !handle.is_hosted_by(&session))
        });
        if foreign {
            return None;
        }

        let params = args
            .iter()
            .map(|arg| match arg.peek() {
                Some(Ok(number)) => Expression::Literal(number),
                _ => Expression::PreviousResult(arg.clone()),
            })
            .collect();
        Some(session.remote_evaluate(&Expression::call(function, params)))
    }

    /// Invoke the peer's function on resolved arguments.
    pub(crate) async fn call(&self, params: Vec<f64>) -> Outcome {
        let session = self.session()?;
        let result: NumberResult = session
            .request(
                Method::Call,
                &CallParams {
                    target: self.target.to_wire(),
                    params: params.into_iter().map(WireF64).collect(),
                },
            )
            .await?;
        Ok(result.value.0)
    }
}

impl fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("target", &self.target)
            .field("owned", &self.owned)
            .finish()
    }
}

impl Drop for RemoteHandle {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        if let Some(session) = self.session.upgrade() {
            if session.is_closed() {
                return;
            }
            let target = self.target.to_wire();
            if let Err(error) = session.notify(Method::Release, &TargetParams { target }) {
                debug!(peer = %session.peer, %error, "could not release remote capability");
            }
        }
    }
}
