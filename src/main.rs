//! # Wallet Insight Server
//!
//! Watches one Solana wallet, decodes its transactions into a deduplicated
//! ledger, tracks the liquidity pools it trades against, detects recurring
//! trading behaviour and periodically asks an analysis service to turn that
//! evidence into a dated strategy report.
//!
//! ## Architecture
//! - `config`: environment configuration
//! - `pipeline`: feed, decoder, ledger writer, pool tracker, pattern book,
//!   synthesizer
//! - `database`: PostgreSQL and in-memory stores
//! - `routes`: HTTP handlers
//! - `server`: startup wiring and graceful shutdown
//!
//! ## Environment Setup
//! ```bash
//! cp .env.example .env
//! # set WALLET_ADDRESS and ANALYSIS_API_KEY
//! ```
//!
//! ## Running the Server
//! ```bash
//! cargo run
//! curl http://localhost:3000/ping
//! ```

mod config;
mod database;
mod pipeline;
mod routes;
mod server;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false) // cleaner output
                .compact(),
        )
        .init();

    tracing::info!("🏁 Starting Wallet Insight Server...");
    tracing::info!("📦 Package: {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    tracing::info!("🏗️  Build profile: {}", if cfg!(debug_assertions) { "debug" } else { "release" });

    let config = config::Config::from_env().context("Failed to load configuration")?;
    server::start(config).await
}
