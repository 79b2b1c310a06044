//! `spate-gateway`: the stateless HTTP gateway in front of the server.

use std::sync::Arc;

use log::info;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;

use spate::claims::TokenVerifier;
use spate::config::{init_logging, Config};
use spate::gateway::Gateway;
use spate::{Error, PgWarehouse, Result, Warehouse};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_logging(&config.log_level);
    info!("spate-gateway {} starting", env!("CARGO_PKG_VERSION"));

    let pem = config
        .token_verifier_public_key
        .as_deref()
        .ok_or_else(|| Error::Config("TOKEN_VERIFIER_PUBLIC_KEY is required".into()))?;
    let verifier = TokenVerifier::from_pem(pem)?;

    // The gateway streams results itself, so it gets its own (small) pool.
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&config.warehouse_dsn)
        .await?;
    let warehouse: Arc<dyn Warehouse> = Arc::new(PgWarehouse::new(pool));

    let gateway = Gateway::connect(&config.server_addr, verifier, warehouse).await?;
    let listener = TcpListener::bind(&config.gateway_addr).await?;
    info!("gateway listening on {}", config.gateway_addr);

    axum::serve(listener, gateway.router())
        .await
        .map_err(|e| Error::Transport(e.to_string()))
}
