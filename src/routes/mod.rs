// # Routes Module
//
// HTTP handlers over the pipeline's shared state, grouped by area:
// - `health`: liveness probe and pipeline health
// - `ledger`: transactions, pool states and detected patterns
// - `reports`: strategy reports and on-demand synthesis

use axum::http::StatusCode;

use crate::pipeline::types::PipelineError;

/// Health check and monitoring endpoints
pub mod health;

/// Ledger, pool and pattern read endpoints
pub mod ledger;

/// Strategy report endpoints
pub mod reports;

/// Handler error: status code plus a plain message body.
pub type ApiError = (StatusCode, String);

pub(crate) fn api_error(e: PipelineError) -> ApiError {
    let status = match &e {
        PipelineError::SynthesisTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        PipelineError::SynthesisMalformedResponse(_) | PipelineError::AnalysisService(_) => StatusCode::BAD_GATEWAY,
        PipelineError::StorageRead(_) | PipelineError::StorageWrite(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}
