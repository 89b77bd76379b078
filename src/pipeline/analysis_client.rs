use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::types::{AnalysisRequest, PipelineError, StrategyDocument};
use crate::config::SynthesisConfig;

/// External service turning an aggregate into a strategy document.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<StrategyDocument, PipelineError>;
}

/// Client for an OpenAI-compatible chat-completions endpoint.
pub struct AnalysisClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl AnalysisClient {
    pub fn new(api_key: String, base_url: String) -> Result<Self, PipelineError> {
        // the synthesizer enforces its own deadline; this one only bounds a hung socket
        let client = Client::builder().timeout(Duration::from_secs(300)).build()?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: "deepseek-v3-250324".to_string(),
            max_tokens: 4000,
            temperature: 0.3,
        })
    }

    pub fn from_config(config: &SynthesisConfig) -> Result<Self, PipelineError> {
        Ok(Self::new(config.api_key.clone(), config.base_url.clone())?
            .with_model(config.model.clone())
            .with_temperature(config.temperature)
            .with_max_tokens(config.max_tokens))
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn create_system_prompt(&self) -> String {
        r#"You are a quantitative analyst for Solana DEX trading. You study one wallet's on-chain
activity and derive the trading strategy it follows, expressed so it can be replicated.

Respond with a single JSON object with exactly these sections and keys, and nothing else:
{
    "target_selection": {"liquidity_criteria": ..., "volume_criteria": ..., "price_criteria": ...},
    "buy_strategy": {"trigger_conditions": ..., "buy_parameters": ...},
    "sell_strategy": {"take_profit": ..., "stop_loss": ...},
    "position_management": {"scaling": ..., "rebalancing": ...},
    "risk_control": {"max_position_size": ..., "max_daily_loss": ..., "correlation_management": ...}
}
Every value must be present and non-null. Values may be strings, numbers or nested objects.
Base every criterion on the evidence provided; say so explicitly where the evidence is thin."#
            .to_string()
    }

    fn create_analysis_prompt(&self, request: &AnalysisRequest) -> Result<String, PipelineError> {
        Ok(format!(
            r#"Analyze the trading activity of wallet {wallet} as of {as_of} (lookback {lookback} days).

Ledger totals:
{totals}

Per-pair statistics (volume per mint, execution price trend, known pool liquidity):
{pairs}

Pool states the wallet interacted with:
{pools}

Detected behaviour patterns:
{patterns}

Return the strategy document JSON."#,
            wallet = request.wallet,
            as_of = request.as_of,
            lookback = request.lookback_days,
            totals = serde_json::to_string_pretty(&request.totals)?,
            pairs = serde_json::to_string_pretty(&request.pair_statistics)?,
            pools = serde_json::to_string_pretty(&request.pools)?,
            patterns = serde_json::to_string_pretty(&request.patterns)?,
        ))
    }

    async fn call_chat_api(&self, system_prompt: &str, user_prompt: &str) -> Result<String, PipelineError> {
        let payload = json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": system_prompt
                },
                {
                    "role": "user",
                    "content": user_prompt
                }
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "response_format": { "type": "json_object" }
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(PipelineError::AnalysisService(format!("API error {}: {}", status, error_text)));
        }

        let json: Value = response.json().await?;
        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| PipelineError::SynthesisMalformedResponse("no content in response".to_string()))?;

        Ok(content.to_string())
    }
}

/// Parses and validates the model output. Tolerates a fenced code block
/// around the JSON object.
pub fn parse_strategy_document(content: &str) -> Result<StrategyDocument, PipelineError> {
    let trimmed = content.trim();
    let body = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => {
            return Err(PipelineError::SynthesisMalformedResponse(
                "response contains no JSON object".to_string(),
            ));
        }
    };

    let document: StrategyDocument = serde_json::from_str(body)
        .map_err(|e| PipelineError::SynthesisMalformedResponse(format!("schema mismatch: {}", e)))?;
    document.validate()?;
    Ok(document)
}

#[async_trait]
impl AnalysisService for AnalysisClient {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<StrategyDocument, PipelineError> {
        info!("🤖 Requesting strategy analysis {} from {}", request.request_id, self.model);
        let system_prompt = self.create_system_prompt();
        let user_prompt = self.create_analysis_prompt(request)?;
        debug!("Analysis prompt is {} bytes", user_prompt.len());

        let content = self.call_chat_api(&system_prompt, &user_prompt).await?;
        parse_strategy_document(&content)
    }
}
