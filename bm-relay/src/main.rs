//! bm-relay server binary.
//!
//! ```bash
//! # Port from config.json, or 8443
//! bm-relay
//!
//! # Explicit port and config file
//! bm-relay 9000 --config relay.json
//! ```

use std::path::PathBuf;

use clap::Parser;

use bm_relay::{RelayServer, ServerConfig};

/// Spatial collaboration message relay
#[derive(Parser, Debug)]
#[command(name = "bm-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on (overrides the config file)
    port: Option<u16>,

    /// Configuration file (JSON format); a missing file means defaults
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Request TLS (not terminated by the relay, logged only)
    #[arg(long)]
    tls: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = ServerConfig::load(&args.config)?;
    if let Some(port) = args.port {
        config.port = port;
    }
    config.tls |= args.tls;

    log::info!(
        "bm-relay v{} on {} (flush {}ms, liveness timeout {}ms)",
        env!("CARGO_PKG_VERSION"),
        config.bind_addr(),
        config.flush_interval_ms,
        config.liveness_timeout_ms
    );

    let server = RelayServer::new(config);
    server.run().await?;
    Ok(())
}
