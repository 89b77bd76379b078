//! Wallet monitoring pipeline: feed → decoder → ledger → pools and patterns,
//! with periodic strategy synthesis over the accumulated state.

pub mod analysis_client;
pub mod decoder;
pub mod feed;
pub mod health;
pub mod ingest;
pub mod ledger;
pub mod patterns;
pub mod pool_tracker;
pub mod registry;
pub mod synthesizer;
pub mod types;
