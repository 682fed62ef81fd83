//! Calculator server bootstrap for the `serve` command.

use capcalc_core::{Calculator, CalculatorServer, ServerHandle};
use tracing::info;

/// Start serving a fresh calculator on `host:port`.
///
/// The returned handle keeps the server alive; the actual address is on the
/// handle (useful when port=0).
pub async fn start_server(host: &str, port: u16) -> anyhow::Result<ServerHandle> {
    let handle = CalculatorServer::start(Calculator::new(), (host, port)).await?;
    info!("Server listening on {}", handle.addr());
    Ok(handle)
}
