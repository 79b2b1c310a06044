//! `spate-server`: the stateful query-execution server.

use std::sync::Arc;

use log::info;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;

use spate::config::{init_logging, Config};
use spate::{PgWarehouse, QueryServer, Result, Warehouse};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_logging(&config.log_level);
    info!("spate-server {} starting", env!("CARGO_PKG_VERSION"));

    let pool = PgPoolOptions::new()
        .max_connections((config.worker_pool_size * 2) as u32)
        .connect(&config.warehouse_dsn)
        .await?;
    let warehouse: Arc<dyn Warehouse> = Arc::new(PgWarehouse::new(pool));

    let server = QueryServer::new(warehouse, &config).await?;
    let listener = TcpListener::bind(&config.server_addr).await?;

    tokio::select! {
        result = server.serve(listener) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
