//! capcalc RPC - calculator server and demo client.
//!
//! `serve` exports a calculator on a TCP port and prints `RPC_PORT=<port>`
//! on stdout once it is listening. `demo` connects to a server and runs the
//! client scenarios, including a callback the server calls back into.

mod demo;
mod server;

use anyhow::Result;
use capcalc_core::RpcConfig;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "capcalc-rpc")]
#[command(about = "Capability-based calculator over JSON-RPC")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve a calculator until interrupted
    Serve {
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value_t = RpcConfig::DEFAULT_PORT)]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = RpcConfig::DEFAULT_HOST)]
        host: String,
    },
    /// Run the client scenarios against a server
    Demo {
        /// Server address as HOST:PORT
        addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging; RUST_LOG takes precedence over --debug
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.command {
        Command::Serve { port, host } => serve(&host, port).await,
        Command::Demo { addr } => demo::run(&addr).await,
    }
}

async fn serve(host: &str, port: u16) -> Result<()> {
    info!("Starting calculator server");

    let mut handle = server::start_server(host, port).await?;

    // Print port for callers to read (intentional stdout)
    println!("RPC_PORT={}", handle.port);

    info!("RPC server running on {}", handle.addr());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    handle.shutdown();

    Ok(())
}
