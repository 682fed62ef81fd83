//! TCP server exporting a [`Calculator`] to every connection.
//!
//! Accepts connections and starts a session per connection with the
//! calculator as its bootstrap capability. Each session runs on its own
//! tokio tasks; the server only tracks how many are active.

use super::session::Session;
use crate::calculator::Calculator;
use crate::config::RpcConfig;
use crate::error::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running server. Dropping shuts down the server.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    active_connections: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of sessions currently open.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Shut down the server.
    ///
    /// Stops accepting new connections and ends every open session, which
    /// fails the questions still outstanding on them.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Calculator server.
pub struct CalculatorServer;

impl CalculatorServer {
    /// Start serving `calculator` on `addr`.
    pub async fn start<A: ToSocketAddrs>(calculator: Calculator, addr: A) -> Result<ServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let port = addr.port();

        info!("Calculator server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            calculator,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections.clone(),
        ));

        Ok(ServerHandle {
            addr,
            port,
            active_connections,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    /// Start on an OS-assigned loopback port.
    pub async fn start_local(calculator: Calculator) -> Result<ServerHandle> {
        Self::start(calculator, (RpcConfig::DEFAULT_HOST, RpcConfig::DEFAULT_PORT)).await
    }

    async fn accept_loop(
        listener: TcpListener,
        calculator: Calculator,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Calculator server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= RpcConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    peer_addr,
                                    RpcConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            let session = Session::start(
                                stream,
                                Some(calculator.clone()),
                                false,
                                conn_shutdown_rx.clone(),
                            );
                            let (_, task) = match session {
                                Ok(session) => session,
                                Err(e) => {
                                    warn!("Could not start session for {}: {}", peer_addr, e);
                                    continue;
                                }
                            };

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let conns = active_connections.clone();
                            tokio::spawn(async move {
                                debug!("Connection from {}", peer_addr);
                                if let Err(e) = task.await {
                                    debug!("Session {} ended abnormally: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }
}
