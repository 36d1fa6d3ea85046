// Analysis Response Schema
// One typed view over primary and chained AI replies

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::core::types::NewRecommendation;
use crate::layer1::ai_client::AnalysisError;

/// A number, a numeric string ("72", "72.5%"), or anything else
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Confidence {
    Number(f64),
    Text(String),
    Other(Value),
}

impl Confidence {
    fn value(&self) -> Option<f64> {
        match self {
            Confidence::Number(n) => Some(*n),
            Confidence::Text(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
            Confidence::Other(_) => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum IndexGpt {
    Detailed { confidence: Option<Confidence> },
    Other(Value),
}

impl IndexGpt {
    fn confidence(&self) -> Option<f64> {
        match self {
            IndexGpt::Detailed { confidence } => confidence.as_ref().and_then(Confidence::value),
            IndexGpt::Other(_) => None,
        }
    }
}

/// Wire shape of both reply variants; chained replies use the `final_` keys
#[derive(Debug, Deserialize)]
struct RawResponse {
    recommended_action: Option<Value>,
    final_recommended_action: Option<Value>,
    confidence: Option<Confidence>,
    index_gpt: Option<IndexGpt>,
    final_index_gpt: Option<IndexGpt>,
}

/// Interpreted AI reply.
///
/// - `recommended_action` (or `final_recommended_action`) is required. A
///   non-string value is kept as its JSON text.
/// - confidence comes from top-level `confidence`, else from
///   `index_gpt.confidence` / `final_index_gpt.confidence`, else 0.
///   Percent values in (1, 100] are scaled down; the result is clamped to [0, 1].
/// - `raw` is the full reply, stored untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResponse {
    pub recommended_action: String,
    pub confidence: f64,
    pub raw: Value,
}

impl AnalysisResponse {
    pub fn parse(raw: Value) -> Result<Self, AnalysisError> {
        let fields: RawResponse = serde_json::from_value(raw.clone())
            .map_err(|e| AnalysisError::InvalidContent(e.to_string()))?;

        let recommended_action = fields
            .recommended_action
            .or(fields.final_recommended_action)
            .and_then(action_text)
            .ok_or(AnalysisError::MissingField("recommended_action"))?;

        let index = fields.index_gpt.or(fields.final_index_gpt);
        let confidence = fields
            .confidence
            .as_ref()
            .and_then(Confidence::value)
            .or_else(|| index.as_ref().and_then(IndexGpt::confidence))
            .map(normalize_confidence)
            .unwrap_or(0.0);

        Ok(Self {
            recommended_action,
            confidence,
            raw,
        })
    }

    pub fn into_recommendation(self, currency: &str, recommended_at: DateTime<Utc>) -> NewRecommendation {
        NewRecommendation {
            currency: currency.to_uppercase(),
            recommended_at,
            recommended_action: self.recommended_action,
            confidence: self.confidence,
            raw_data: self.raw,
        }
    }
}

fn action_text(value: Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

pub fn normalize_confidence(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let scaled = if value > 1.0 && value <= 100.0 { value / 100.0 } else { value };
    scaled.clamp(0.0, 1.0)
}
