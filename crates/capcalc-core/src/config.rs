//! Centralized configuration for the calculator protocol.
//!
//! Constants for the wire layer and evaluation limits. Runtime overrides
//! (host, port, log level) come from the command line of `capcalc-rpc`.

use std::time::Duration;

/// Wire and connection configuration.
pub struct RpcConfig;

impl RpcConfig {
    pub const JSONRPC_VERSION: &'static str = "2.0";
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 0;

    /// Largest accepted frame payload.
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

    /// Concurrent sessions accepted by one server.
    pub const MAX_CONNECTIONS: usize = 64;

    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Evaluation limits.
pub struct EvalConfig;

impl EvalConfig {
    /// Maximum nesting of server-defined function invocations.
    pub const MAX_CALL_DEPTH: usize = 256;
}
