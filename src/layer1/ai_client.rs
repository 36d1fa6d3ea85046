// AI Analysis Client - OpenAI-compatible chat completions
// Primary and chained market analysis prompts, JSON object replies

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::core::types::{AggregatedWindow, Recommendation};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Completion has no content")]
    EmptyCompletion,
    #[error("Completion is not a JSON object: {0}")]
    InvalidContent(String),
    #[error("Response is missing required field '{0}'")]
    MissingField(&'static str),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Market analysis collaborator.
///
/// Both calls return the model's reply as a JSON object.
#[async_trait]
pub trait AiAnalysis: Send + Sync {
    async fn analyze_primary(&self, aggregate: &AggregatedWindow) -> Result<Value, AnalysisError>;

    async fn analyze_chained(
        &self,
        previous: &Recommendation,
        aggregate: &AggregatedWindow,
    ) -> Result<Value, AnalysisError>;
}

// ============================================================================
// Prompts
// ============================================================================

const SYSTEM_PROMPT: &str = "You are a financial analyst specializing in cryptocurrency markets. \
Always answer with a single JSON object and nothing else.";

pub fn primary_prompt(aggregate: &AggregatedWindow) -> Result<String, AnalysisError> {
    let data = serde_json::to_string_pretty(aggregate)?;
    Ok(format!(
        "Run a primary analysis of the following market data:\n\n{data}\n\n\
         Tasks:\n\
         1. Compute technical indicators: SMA, EMA, RSI, MACD, ATR.\n\
         2. Detect candlestick patterns: Hammer, Inverted Hammer, Bullish Engulfing, Three White Soldiers, \
         Piercing Line, Hanging Man, Bearish Engulfing, Three Black Crows, Dark Cloud Cover, Doji.\n\
         3. Estimate the probability of the price rising and falling, in percent. Call this the 'Index GPT' \
         and include its overall confidence.\n\
         4. Give detailed trading recommendations, taking leverage into account.\n\n\
         Reply as JSON with the keys:\n\
           - technical_indicators\n\
           - candlestick_patterns\n\
           - index_gpt\n\
           - recommended_action\n\
           - detailed_recommendations"
    ))
}

pub fn chained_prompt(previous: &Recommendation, aggregate: &AggregatedWindow) -> Result<String, AnalysisError> {
    let combined = json!({
        "previous_recommendation": {
            "recommended_at": previous.recommended_at,
            "recommended_action": previous.recommended_action,
            "confidence": previous.confidence,
            "analysis": previous.raw_data,
        },
        "current_data": aggregate,
    });
    let data = serde_json::to_string_pretty(&combined)?;
    Ok(format!(
        "'previous_recommendation' holds the last analysis for this market and 'current_data' holds the \
         market data observed since. Compare them and refine the analysis:\n\n{data}\n\n\
         Tasks:\n\
         1. Look for patterns and refine the 'Index GPT'.\n\
         2. Compare the current data with the previous analysis and assess how the dynamics changed.\n\
         3. Produce a final conclusion with a recommendation, including the probability of the price change \
         in percent.\n\n\
         Reply as JSON with the keys:\n\
           - final_index_gpt\n\
           - final_recommended_action\n\
           - final_detailed_recommendations"
    ))
}

/// Decode the completion text into a JSON object, tolerating a surrounding
/// markdown code fence
pub fn extract_json_object(content: &str) -> Result<Value, AnalysisError> {
    let mut body = content.trim();
    if let Some(rest) = body.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        body = rest.strip_suffix("```").unwrap_or(rest).trim();
    }

    match serde_json::from_str::<Value>(body) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(other) => Err(AnalysisError::InvalidContent(format!("expected object, got {}", other))),
        Err(e) => Err(AnalysisError::InvalidContent(e.to_string())),
    }
}

// ============================================================================
// Client
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AiClientStats {
    pub requests_sent: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
}

impl fmt::Display for AiClientStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AiClientStats(sent={}, ok={}, fail={})",
            self.requests_sent, self.requests_succeeded, self.requests_failed
        )
    }
}

/// Chat completions client. One instance is shared by all scheduler jobs.
pub struct ChatGptClient {
    base_url: String,
    api_key: String,
    model: String,
    temperature: f64,
    client: Client,

    requests_sent: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
}

impl ChatGptClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        temperature: f64,
        timeout_seconds: u64,
    ) -> Result<Self, AnalysisError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()?;

        info!(model = model, base_url = base_url, "AI client created");
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            temperature,
            client,
            requests_sent: AtomicU64::new(0),
            requests_succeeded: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
        })
    }

    pub fn from_config(config: &crate::core::AiConfig) -> Result<Self, AnalysisError> {
        Self::new(
            &config.base_url,
            &config.api_key,
            &config.model,
            config.temperature,
            config.request_timeout_seconds,
        )
    }

    pub fn get_stats(&self) -> AiClientStats {
        AiClientStats {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            requests_succeeded: self.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
        }
    }

    fn request_body(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt}
            ]
        })
    }

    async fn complete(&self, prompt: &str) -> Result<Value, AnalysisError> {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);

        let result = self.send_completion(prompt).await;
        match &result {
            Ok(_) => {
                self.requests_succeeded.fetch_add(1, Ordering::Relaxed);
                info!(model = %self.model, "Analysis received");
            }
            Err(e) => {
                self.requests_failed.fetch_add(1, Ordering::Relaxed);
                error!(model = %self.model, error = %e, "Analysis request failed");
            }
        }
        result
    }

    async fn send_completion(&self, prompt: &str) -> Result<Value, AnalysisError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, prompt_len = prompt.len(), "Sending completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(prompt))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AnalysisError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let completion: ChatCompletion = response.json().await?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(AnalysisError::EmptyCompletion)?;

        extract_json_object(&content)
    }
}

#[async_trait]
impl AiAnalysis for ChatGptClient {
    async fn analyze_primary(&self, aggregate: &AggregatedWindow) -> Result<Value, AnalysisError> {
        let prompt = primary_prompt(aggregate)?;
        self.complete(&prompt).await
    }

    async fn analyze_chained(
        &self,
        previous: &Recommendation,
        aggregate: &AggregatedWindow,
    ) -> Result<Value, AnalysisError> {
        let prompt = chained_prompt(previous, aggregate)?;
        self.complete(&prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{MarketKind, TimeRange, WindowEntry};
    use chrono::Utc;

    fn window() -> AggregatedWindow {
        let now = Utc::now();
        let mut window = AggregatedWindow::empty("NEARUSDT", TimeRange { start: now, end: now });
        window.add(MarketKind::Kline, WindowEntry { observed_at: now, payload: json!({"close": "3.21"}) });
        window
    }

    #[test]
    fn test_extract_json_object() {
        assert_eq!(
            extract_json_object(r#"{"recommended_action": "buy"}"#).unwrap(),
            json!({"recommended_action": "buy"})
        );
        assert_eq!(
            extract_json_object("```json\n{\"recommended_action\": \"hold\"}\n```").unwrap(),
            json!({"recommended_action": "hold"})
        );
        assert!(matches!(extract_json_object("[1, 2]"), Err(AnalysisError::InvalidContent(_))));
        assert!(matches!(extract_json_object("Buy now!"), Err(AnalysisError::InvalidContent(_))));
    }

    #[test]
    fn test_prompts_embed_data() {
        let primary = primary_prompt(&window()).unwrap();
        assert!(primary.contains("NEARUSDT"));
        assert!(primary.contains("recommended_action"));

        let previous = Recommendation {
            id: 7,
            currency: "NEARUSDT".into(),
            recommended_at: Utc::now(),
            recommended_action: "sell".into(),
            confidence: 0.4,
            raw_data: json!({"index_gpt": {"up": 40}}),
        };
        let chained = chained_prompt(&previous, &window()).unwrap();
        assert!(chained.contains("previous_recommendation"));
        assert!(chained.contains("\"sell\""));
        assert!(chained.contains("final_recommended_action"));
    }

    #[test]
    fn test_request_body() {
        let client = ChatGptClient::new("https://api.openai.com/v1/", "key", "gpt-3.5-turbo", 0.7, 5).unwrap();
        let body = client.request_body("hello");
        assert_eq!(body["model"], "gpt-3.5-turbo");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(client.base_url, "https://api.openai.com/v1");
        assert_eq!(client.get_stats().requests_sent, 0);
    }
}
