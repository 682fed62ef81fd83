//! Two-party calculator RPC over TCP.
//!
//! Uses length-prefixed JSON-RPC 2.0 over TCP connections.
//!
//! # Architecture
//!
//! - **Server**: accepts connections and exports a calculator on each
//! - **Client**: connects to a server and exposes its calculator locally
//! - **Session**: one per connection, shared by both roles; tracks questions,
//!   exports and answers, and routes calls to the side hosting a capability
//! - **Protocol**: framing, JSON-RPC types and the wire encoding of
//!   expressions and capability references

pub mod client;
pub mod protocol;
pub mod server;
pub(crate) mod session;

pub use client::CalculatorClient;
pub use protocol::{RpcRequest, RpcResponse, WireCap, WireExpression};
pub use server::{CalculatorServer, ServerHandle};
