//! # Database Module
//!
//! Persistence for the transaction ledger, pool states and strategy reports.
//! PostgreSQL (tokio-postgres + deadpool + refinery) when `DATABASE_URL` is
//! set, otherwise an in-process store with the same semantics.

pub mod connection;
pub mod memory;
pub mod migrations;
pub mod models;
pub mod postgres;
pub mod store;

use std::sync::Arc;

use anyhow::{Context, Result};

pub use connection::DatabaseConnection;
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{Store, StoredTransaction, WriteOutcome};

use crate::config::DatabaseConfig;

/// Builds the configured store, running migrations for PostgreSQL.
pub async fn open_store(config: &DatabaseConfig) -> Result<Arc<dyn Store>> {
    match &config.url {
        Some(url) => {
            let db = DatabaseConnection::from_url(url, config.max_connections)
                .await
                .context("Failed to connect to database")?;
            migrations::run_migrations(db.pool()).await?;
            Ok(Arc::new(PgStore::new(db)))
        }
        None => {
            tracing::warn!("⚠️  DATABASE_URL not set, using in-memory store (data is lost on restart)");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
