use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use chrono::{Duration, NaiveDate, Utc};
use serde::Deserialize;
use tracing::info;

use super::{ApiError, api_error};
use crate::pipeline::types::StrategyReport;
use crate::server::AppState;

/// Range used when `from` is omitted.
const DEFAULT_RANGE_DAYS: i64 = 30;

#[derive(Debug, Deserialize)]
pub struct ReportRangeQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct SynthesizeQuery {
    pub date: Option<NaiveDate>,
}

fn parse_date(raw: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| (StatusCode::BAD_REQUEST, format!("invalid date '{}', expected YYYY-MM-DD", raw)))
}

pub async fn get_report(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> Result<Json<StrategyReport>, ApiError> {
    let date = parse_date(&date)?;
    match state.store.get_report(date).await.map_err(api_error)? {
        Some(report) => Ok(Json(report)),
        None => Err((StatusCode::NOT_FOUND, format!("no report for date {}", date))),
    }
}

/// Reports in `[from, to]`, ascending. Defaults to the last 30 days.
pub async fn list_reports(
    State(state): State<AppState>,
    Query(query): Query<ReportRangeQuery>,
) -> Result<Json<Vec<StrategyReport>>, ApiError> {
    let to = query.to.unwrap_or_else(|| Utc::now().date_naive());
    let from = query.from.unwrap_or(to - Duration::days(DEFAULT_RANGE_DAYS));
    if from > to {
        return Err((StatusCode::BAD_REQUEST, format!("from {} is after to {}", from, to)));
    }

    let reports = state.store.reports_between(from, to).await.map_err(api_error)?;
    Ok(Json(reports))
}

/// Runs a synthesis cycle now, for `date` or today (UTC).
pub async fn synthesize_now(
    State(state): State<AppState>,
    Query(query): Query<SynthesizeQuery>,
) -> Result<Json<StrategyReport>, ApiError> {
    let date = query.date.unwrap_or_else(|| Utc::now().date_naive());
    info!("On-demand synthesis requested for {}", date);
    let report = state.synthesizer.synthesize(date).await.map_err(api_error)?;
    Ok(Json(report))
}

pub fn create_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/reports", get(list_reports))
        .route("/api/v1/reports/synthesize", post(synthesize_now))
        .route("/api/v1/reports/{date}", get(get_report))
}
