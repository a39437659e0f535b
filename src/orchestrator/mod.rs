//! Decision orchestrator: parses a request, runs pattern matching and
//! rule evaluation, fuses the scores against the configured thresholds,
//! and emits a structured response with evaluation metrics.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn};

use crate::config::ConfigStore;
use crate::domain::{Decision, DecisionResponse, RuleContext, TransactionRequest};
use crate::engine::RuleEngine;
use crate::matcher::PatternMatcher;
use crate::observability::{MetricsRegistry, TraceScope};

/// Maximum accepted request body size.
const MAX_BODY_BYTES: usize = 8 * 1024;

/// Fixed fusion adjustments and their audit-trail ids.
const HIGH_AMOUNT_THRESHOLD: f64 = 10_000.0;
const HIGH_AMOUNT_ADJUSTMENT: f64 = 25.0;
const UNUSUAL_CURRENCY_ADJUSTMENT: f64 = 15.0;
const HIGH_CUSTOMER_RISK_THRESHOLD: f64 = 70.0;
const HIGH_CUSTOMER_RISK_ADJUSTMENT: f64 = 30.0;
const NEW_ACCOUNT_DAYS: u32 = 30;
const NEW_ACCOUNT_ADJUSTMENT: f64 = 20.0;
const PRIVATE_IP_ADJUSTMENT: f64 = 10.0;

const MAJOR_CURRENCIES: [&str; 3] = ["USD", "EUR", "GBP"];

/// Typed error surfaced to the transport collaborator.
///
/// Contained component failures (a rule that will not compile, a text
/// that will not match) never appear here; a decision is still produced
/// from what evaluated successfully.
#[derive(Error, Debug)]
pub enum DecisionError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid request document: {0}")]
    InvalidDocument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Health report for the orchestrator and its components.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub components: BTreeMap<&'static str, String>,
}

/// Readiness report listing dependency states.
#[derive(Debug, Serialize)]
pub struct ReadyStatus {
    pub status: &'static str,
    pub dependencies: BTreeMap<&'static str, String>,
}

/// The decision orchestrator.
///
/// Holds shared, read-only handles to the rule engine, pattern matcher,
/// configuration store, and metrics registry for the duration of each
/// decision. All dependencies are explicit; tests substitute their own.
pub struct DecisionOrchestrator {
    engine: Arc<RuleEngine>,
    matcher: Arc<PatternMatcher>,
    config: Arc<ConfigStore>,
    metrics: Arc<MetricsRegistry>,
    model_version: String,
    evaluation_budget: Option<Duration>,
}

impl DecisionOrchestrator {
    pub fn new(
        engine: Arc<RuleEngine>,
        matcher: Arc<PatternMatcher>,
        config: Arc<ConfigStore>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        DecisionOrchestrator {
            engine,
            matcher,
            config,
            metrics,
            model_version: "v2024.01.15".to_string(),
            evaluation_budget: None,
        }
    }

    /// Override the model version stamped on responses.
    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = version.into();
        self
    }

    /// Bound the rule-evaluation pass; when exceeded, remaining rules
    /// are skipped and the decision is forced to at least REVIEW.
    pub fn with_evaluation_budget(mut self, budget: Duration) -> Self {
        self.evaluation_budget = Some(budget);
        self
    }

    /// Process one decision request from its raw body.
    pub fn process_decision(&self, body: &str) -> Result<DecisionResponse, DecisionError> {
        let started = Instant::now();
        self.metrics
            .requests_total
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        if body.len() > MAX_BODY_BYTES {
            self.metrics.record_error("orchestrator", "invalid_request");
            return Err(DecisionError::InvalidRequest(format!(
                "body size {} exceeds {} bytes",
                body.len(),
                MAX_BODY_BYTES
            )));
        }
        if body.trim().is_empty() {
            self.metrics.record_error("orchestrator", "invalid_request");
            return Err(DecisionError::InvalidRequest("empty body".to_string()));
        }

        let request: TransactionRequest = serde_json::from_str(body).map_err(|e| {
            self.metrics.record_error("orchestrator", "invalid_document");
            DecisionError::InvalidDocument(e.to_string())
        })?;

        request.validate().map_err(|e| {
            self.metrics.record_error("orchestrator", "invalid_request");
            DecisionError::InvalidRequest(e.to_string())
        })?;

        let (_trace, trace_id) = TraceScope::new();
        let span = info_span!("decision", trace_id = %trace_id, request_id = %request.request_id);
        let _span = span.enter();

        // Pattern matching completes before rule evaluation starts
        let scan = self.matcher.match_transaction(&request);
        self.metrics.record_pattern_scan(
            scan.blacklist_matches.len() as u64,
            scan.whitelist_matches.len() as u64,
            scan.evaluation_time,
        );

        // Dedicated category-filtered scan of the device ip feeds the
        // ip_blacklist_match context variable
        let ip_blacklisted = self
            .matcher
            .match_text(&request.device.ip, Some("blacklist"))
            .has_blacklist_matches();

        let mut ctx = RuleContext::from_request(&request);
        if ip_blacklisted {
            ctx.ip_blacklist_match = 1.0;
        }

        let evaluation = self.engine.evaluate(&ctx, self.evaluation_budget);
        self.metrics.record_rule_evaluation(
            evaluation.rules_evaluated as u64,
            evaluation.rules_triggered as u64,
            evaluation.latency(),
        );
        if evaluation.truncated {
            self.metrics
                .evaluations_truncated_total
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        // Fusion: rule contributions, fixed adjustments, pattern score
        let mut score = evaluation.total_score;
        let mut reasons: Vec<String> = evaluation
            .triggered_rule_ids()
            .into_iter()
            .map(String::from)
            .collect();
        let mut high_risk = false;

        if request.transaction.amount > HIGH_AMOUNT_THRESHOLD {
            score += HIGH_AMOUNT_ADJUSTMENT;
            reasons.push("high_amount".to_string());
            high_risk = true;
        }
        if !MAJOR_CURRENCIES.contains(&request.transaction.currency.as_str()) {
            score += UNUSUAL_CURRENCY_ADJUSTMENT;
            reasons.push("unusual_currency".to_string());
        }
        if request.customer.risk_score > HIGH_CUSTOMER_RISK_THRESHOLD {
            score += HIGH_CUSTOMER_RISK_ADJUSTMENT;
            reasons.push("high_customer_risk".to_string());
            high_risk = true;
        }
        if request.customer.account_age_days < NEW_ACCOUNT_DAYS {
            score += NEW_ACCOUNT_ADJUSTMENT;
            reasons.push("new_account".to_string());
        }
        if is_private_ip(&request.device.ip) {
            score += PRIVATE_IP_ADJUSTMENT;
            reasons.push("private_ip".to_string());
        }

        score += scan.match_score();
        for hit in &scan.blacklist_matches {
            reasons.push(format!("blacklist:{}", hit.pattern_name));
        }
        dedupe_in_place(&mut reasons);

        let score = score.clamp(0.0, 100.0);

        // Threshold decision against the snapshot the evaluation used
        let mut decision = evaluation.thresholds.decide(score);
        if high_risk {
            decision = decision.max(Decision::Decline);
        }
        if evaluation.truncated {
            decision = decision.max(Decision::Review);
            warn!("rule pass truncated by evaluation budget, forcing at least REVIEW");
        }

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let response = DecisionResponse::new(
            request.request_id.clone(),
            decision,
            score,
            reasons,
            latency_ms,
            self.model_version.clone(),
        );

        self.metrics.record_decision(decision);
        self.metrics.decision_latency.record(started.elapsed());

        info!(
            decision = %decision,
            risk_score = response.risk_score,
            rules_triggered = evaluation.rules_triggered,
            pattern_hits = scan.total_matches(),
            latency_ms,
            "decision complete"
        );

        Ok(response)
    }

    /// Component health for the transport's `/health`.
    pub fn health(&self) -> HealthStatus {
        let mut components = BTreeMap::new();
        let mut degraded = false;

        if self.engine.is_initialized() {
            components.insert("rule_engine", "ready".to_string());
        } else {
            let detail = self
                .engine
                .last_error()
                .unwrap_or_else(|| "not initialized".to_string());
            components.insert("rule_engine", detail);
            degraded = true;
        }

        if self.matcher.is_initialized() {
            components.insert("pattern_matcher", "ready".to_string());
        } else {
            let detail = self
                .matcher
                .last_error()
                .unwrap_or_else(|| "not initialized".to_string());
            components.insert("pattern_matcher", detail);
            degraded = true;
        }

        match self.config.last_error() {
            None => {
                components.insert("config", "loaded".to_string());
            }
            Some(error) => {
                // A stale-but-valid snapshot still serves decisions
                components.insert("config", format!("reload failing: {error}"));
                degraded = true;
            }
        }

        HealthStatus {
            status: if degraded { "degraded" } else { "healthy" },
            components,
        }
    }

    /// Dependency readiness for the transport's `/ready`.
    pub fn ready(&self) -> ReadyStatus {
        let mut dependencies = BTreeMap::new();

        let rule_config = self.engine.current_config();
        dependencies.insert(
            "rules",
            if self.engine.is_initialized() {
                format!(
                    "loaded ({} rules, version {})",
                    rule_config.rules.len(),
                    rule_config.version
                )
            } else {
                "not loaded".to_string()
            },
        );

        let stats = self.matcher.statistics();
        dependencies.insert(
            "patterns",
            if self.matcher.is_initialized() {
                format!("compiled ({} patterns, {})", stats.total_patterns, stats.backend)
            } else {
                "not compiled".to_string()
            },
        );

        dependencies.insert("config", "loaded".to_string());

        let ready = self.engine.is_initialized() && self.matcher.is_initialized();
        ReadyStatus {
            status: if ready { "ready" } else { "not_ready" },
            dependencies,
        }
    }

    /// The metrics registry shared with the components.
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }
}

/// True for loopback, link-local, and RFC1918 / unique-local addresses.
fn is_private_ip(ip: &str) -> bool {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local()
        }
        Ok(IpAddr::V6(v6)) => {
            v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00 || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
        Err(_) => false,
    }
}

/// Remove duplicate reasons while keeping first-seen order.
fn dedupe_in_place(reasons: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    reasons.retain(|r| seen.insert(r.clone()));
}
