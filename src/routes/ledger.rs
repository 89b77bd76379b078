use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
};
use chrono::NaiveDate;
use serde::Deserialize;

use super::{ApiError, api_error};
use crate::database::{Store, StoredTransaction};
use crate::pipeline::types::{PatternRecord, PoolState, TradingPair};
use crate::server::AppState;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Default, Deserialize)]
pub struct TransactionQuery {
    pub limit: Option<usize>,
    /// `MINT_A/MINT_B`, either order
    pub pair: Option<String>,
    /// UTC block date, `YYYY-MM-DD`
    pub date: Option<NaiveDate>,
}

/// Ledger entries newest first, optionally narrowed to a pair and/or a date.
pub async fn list_transactions(
    State(state): State<AppState>,
    Query(query): Query<TransactionQuery>,
) -> Result<Json<Vec<StoredTransaction>>, ApiError> {
    Ok(Json(select_transactions(state.store.as_ref(), &query).await?))
}

async fn select_transactions(
    store: &dyn Store,
    query: &TransactionQuery,
) -> Result<Vec<StoredTransaction>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let pair = match query.pair.as_deref() {
        Some(key) => Some(TradingPair::parse(key).ok_or_else(|| {
            (StatusCode::BAD_REQUEST, format!("pair must look like MINT_A/MINT_B, got {}", key))
        })?),
        None => None,
    };

    let mut transactions = match (&pair, query.date) {
        (None, None) => return store.recent_transactions(limit).await.map_err(api_error),
        (Some(pair), date) => {
            let mut by_pair = store.transactions_by_pair(pair).await.map_err(api_error)?;
            if let Some(date) = date {
                by_pair.retain(|t| t.transaction.block_date() == date);
            }
            by_pair
        }
        (None, Some(date)) => store.transactions_by_date(date).await.map_err(api_error)?,
    };
    // stores return append order
    transactions.reverse();
    transactions.truncate(limit);
    Ok(transactions)
}

pub async fn get_transaction(
    State(state): State<AppState>,
    Path(signature): Path<String>,
) -> Result<Json<StoredTransaction>, ApiError> {
    match state.store.get_transaction(&signature).await.map_err(api_error)? {
        Some(tx) => Ok(Json(tx)),
        None => Err((StatusCode::NOT_FOUND, format!("no transaction with signature {}", signature))),
    }
}

pub async fn list_pools(State(state): State<AppState>) -> Json<Vec<PoolState>> {
    Json(state.pools.snapshot())
}

pub async fn list_patterns(State(state): State<AppState>) -> Json<Vec<PatternRecord>> {
    Json(state.patterns.records().await)
}

pub fn create_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/transactions", get(list_transactions))
        .route("/api/v1/transactions/{signature}", get(get_transaction))
        .route("/api/v1/pools", get(list_pools))
        .route("/api/v1/patterns", get(list_patterns))
}
