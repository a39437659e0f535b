use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::Decision;

/// Decision response returned to the transport collaborator.
///
/// `reasons` carries the audit trail: triggered rule ids, categorical
/// adjustment ids, and `blacklist:{pattern}` entries for list hits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionResponse {
    pub request_id: String,
    pub decision: Decision,
    /// Fused risk score, clamped to [0,100] and rounded to two decimals.
    pub risk_score: f64,
    pub reasons: Vec<String>,
    pub latency_ms: f64,
    pub model_version: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl DecisionResponse {
    /// Build a response, clamping and rounding the score at the boundary.
    pub fn new(
        request_id: impl Into<String>,
        decision: Decision,
        risk_score: f64,
        reasons: Vec<String>,
        latency_ms: f64,
        model_version: impl Into<String>,
    ) -> Self {
        DecisionResponse {
            request_id: request_id.into(),
            decision,
            risk_score: round2(risk_score.clamp(0.0, 100.0)),
            reasons,
            latency_ms,
            model_version: model_version.into(),
            timestamp: Utc::now().timestamp_millis() as u64,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.request_id.is_empty()
            && (0.0..=100.0).contains(&self.risk_score)
            && self.latency_ms >= 0.0
            && !self.model_version.is_empty()
    }
}

#[inline]
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
