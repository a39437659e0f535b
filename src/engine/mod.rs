//! Rule engine: compiles weighted expressions once per worker, evaluates
//! them against a per-request context, and accumulates per-rule
//! statistics. The active configuration is replaced atomically on reload
//! and in-flight evaluations keep the snapshot they started with.

pub mod config;
pub mod expr;

pub use config::{Rule, RuleConfig, RuleError, RuleStats};
pub use expr::{CompiledExpr, SymbolTable};

use std::cell::RefCell;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::domain::{RuleContext, TransactionRequest};
use crate::observability::MetricsRegistry;
use crate::reload::FileWatcher;

/// Observer invoked with the new configuration after a successful
/// reload.
pub type RuleReloadObserver = Arc<dyn Fn(&RuleConfig) + Send + Sync>;

/// Outcome of evaluating one rule for one request.
#[derive(Debug, Clone)]
pub struct RuleResult {
    pub rule_id: String,
    pub triggered: bool,
    /// The rule's weight when triggered, else zero.
    pub contribution_score: f64,
    pub evaluation_time: Duration,
    pub debug_info: Option<String>,
}

/// Aggregate result of a full evaluation pass.
///
/// Carries the thresholds and version of the configuration snapshot the
/// pass ran against, so callers decide against the same snapshot even
/// if a reload lands mid-decision.
#[derive(Debug, Clone)]
pub struct RuleEvaluationMetrics {
    pub rule_results: Vec<RuleResult>,
    pub total_score: f64,
    pub rules_triggered: usize,
    pub rules_evaluated: usize,
    pub total_evaluation_time: Duration,
    pub started_at: Instant,
    pub finished_at: Instant,
    /// True when an evaluation budget cut the pass short.
    pub truncated: bool,
    /// Thresholds of the snapshot this pass evaluated against.
    pub thresholds: crate::domain::Thresholds,
    /// Version of that snapshot.
    pub config_version: String,
}

impl RuleEvaluationMetrics {
    fn begin() -> Self {
        let now = Instant::now();
        RuleEvaluationMetrics {
            rule_results: Vec::new(),
            total_score: 0.0,
            rules_triggered: 0,
            rules_evaluated: 0,
            total_evaluation_time: Duration::ZERO,
            started_at: now,
            finished_at: now,
            truncated: false,
            thresholds: crate::domain::Thresholds::default(),
            config_version: String::new(),
        }
    }

    /// Wall-clock latency of the pass.
    pub fn latency(&self) -> Duration {
        self.finished_at - self.started_at
    }

    /// Ids of triggered rules, in priority order.
    pub fn triggered_rule_ids(&self) -> Vec<&str> {
        self.rule_results
            .iter()
            .filter(|r| r.triggered)
            .map(|r| r.rule_id.as_str())
            .collect()
    }
}

/// A rule's expression evaluates to a real number; values above this
/// threshold count as triggered (booleans come out as 1.0 / 0.0).
const TRIGGER_THRESHOLD: f64 = 0.5;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

struct WorkerCache {
    generation: u64,
    compiled: AHashMap<String, CompiledExpr>,
}

thread_local! {
    // Keyed by engine instance so independent engines (and tests) never
    // share compiled expressions.
    static WORKER_CACHES: RefCell<AHashMap<u64, WorkerCache>> =
        RefCell::new(AHashMap::new());
}

/// The rule engine.
///
/// Exclusively owns the active [`RuleConfig`] and the per-rule stats
/// table. Compiled expressions live in per-worker caches invalidated
/// lazily by a generation counter bumped on reload.
pub struct RuleEngine {
    id: u64,
    current: RwLock<Arc<RuleConfig>>,
    generation: AtomicU64,
    initialized: AtomicBool,
    path: Mutex<Option<PathBuf>>,
    stats: Mutex<AHashMap<String, RuleStats>>,
    observer: Mutex<Option<RuleReloadObserver>>,
    watcher: Mutex<Option<FileWatcher>>,
    last_error: Mutex<Option<String>>,
    metrics: Arc<MetricsRegistry>,
}

impl RuleEngine {
    /// Create an engine with no rules loaded.
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        RuleEngine {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            current: RwLock::new(Arc::new(RuleConfig::empty())),
            generation: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            path: Mutex::new(None),
            stats: Mutex::new(AHashMap::new()),
            observer: Mutex::new(None),
            watcher: Mutex::new(None),
            last_error: Mutex::new(None),
            metrics,
        }
    }

    /// Load rules from a JSON file and make them active.
    pub fn load_rules(&self, path: impl Into<PathBuf>) -> Result<(), RuleError> {
        let path = path.into();
        match RuleConfig::from_file(&path) {
            Ok(config) => {
                self.install(config);
                *self.path.lock() = Some(path);
                Ok(())
            }
            Err(e) => {
                *self.last_error.lock() = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Install a configuration directly (tests, embedding).
    pub fn install(&self, config: RuleConfig) {
        // Seed stats for new rules; existing counters survive a reload.
        {
            let mut stats = self.stats.lock();
            for rule in &config.rules {
                stats.entry(rule.id.clone()).or_default();
            }
        }

        // Bump the generation inside the write lock so a reader never
        // pairs a new snapshot with a stale generation (or vice versa).
        {
            let mut current = self.current.write();
            self.generation.fetch_add(1, Ordering::Release);
            *current = Arc::new(config);
        }
        self.initialized.store(true, Ordering::Release);
        *self.last_error.lock() = None;
    }

    /// Re-read the rule file; swap only on success.
    pub fn reload(&self) -> Result<(), RuleError> {
        let Some(path) = self.path.lock().clone() else {
            return Err(RuleError::NotInitialized);
        };

        match RuleConfig::from_file(&path) {
            Ok(config) => {
                let version = config.version.clone();
                self.install(config);
                self.metrics.record_reload(true);
                info!(version = %version, "rules reloaded");

                if let Some(observer) = self.observer.lock().clone() {
                    observer(&self.current_config());
                }
                Ok(())
            }
            Err(e) => {
                self.metrics.record_reload(false);
                self.metrics.record_error("rule_engine", "config");
                *self.last_error.lock() = Some(e.to_string());
                error!(error = %e, "rule reload failed, keeping previous configuration");
                Err(e)
            }
        }
    }

    /// Start watching the rule file for changes. Idempotent; requires
    /// rules to have been loaded from a file first.
    pub fn enable_hot_reload(
        self: &Arc<Self>,
        interval: Duration,
        observer: Option<RuleReloadObserver>,
    ) -> Result<(), RuleError> {
        if !self.is_initialized() {
            return Err(RuleError::NotInitialized);
        }
        let Some(path) = self.path.lock().clone() else {
            return Err(RuleError::NotInitialized);
        };

        let mut watcher = self.watcher.lock();
        if watcher.is_some() {
            return Ok(());
        }

        *self.observer.lock() = observer;

        // Weak reference: the watcher must not keep the engine alive
        let engine = Arc::downgrade(self);
        *watcher = Some(FileWatcher::spawn(vec![path], interval, move || {
            if let Some(engine) = engine.upgrade() {
                let _ = engine.reload();
            }
        }));

        info!(interval_ms = interval.as_millis() as u64, "rule hot reload enabled");
        Ok(())
    }

    /// Stop watching the rule file. Idempotent.
    pub fn disable_hot_reload(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.stop();
            info!("rule hot reload disabled");
        }
    }

    /// Evaluate all enabled rules against a request, building a default
    /// context (derived fields at their neutral values).
    pub fn evaluate_rules(&self, request: &TransactionRequest) -> RuleEvaluationMetrics {
        let ctx = RuleContext::from_request(request);
        self.evaluate(&ctx, None)
    }

    /// Evaluate all enabled rules against a caller-built context.
    ///
    /// Single pass in priority order. A rule that fails to compile or
    /// errors at runtime is skipped; the pass always completes (unless
    /// the optional budget cuts it short) and never fails as a whole.
    pub fn evaluate(&self, ctx: &RuleContext, budget: Option<Duration>) -> RuleEvaluationMetrics {
        let mut metrics = RuleEvaluationMetrics::begin();

        if !self.is_initialized() {
            error!("rule engine not initialized");
            metrics.finished_at = Instant::now();
            return metrics;
        }
        if !ctx.is_valid() {
            error!(customer_id = %ctx.customer_id, "invalid rule context, skipping evaluation");
            metrics.finished_at = Instant::now();
            return metrics;
        }

        let (config, generation) = {
            let guard = self.current.read();
            (guard.clone(), self.generation.load(Ordering::Acquire))
        };
        metrics.thresholds = config.thresholds;
        metrics.config_version = config.version.clone();
        let symbols = SymbolTable::from_context(ctx);

        WORKER_CACHES.with(|caches| {
            let mut caches = caches.borrow_mut();
            let cache = caches.entry(self.id).or_insert_with(|| WorkerCache {
                generation,
                compiled: AHashMap::new(),
            });
            // Reload invalidates lazily: first use after a swap recompiles
            if cache.generation != generation {
                cache.compiled.clear();
                cache.generation = generation;
            }

            for rule in config.enabled_rules() {
                if let Some(budget) = budget {
                    if metrics.started_at.elapsed() > budget {
                        warn!(
                            evaluated = metrics.rules_evaluated,
                            "evaluation budget exceeded, truncating rule pass"
                        );
                        metrics.truncated = true;
                        break;
                    }
                }

                let rule_start = Instant::now();

                if !cache.compiled.contains_key(&rule.id) {
                    match CompiledExpr::compile(&rule.expression) {
                        Ok(compiled) => {
                            cache.compiled.insert(rule.id.clone(), compiled);
                        }
                        Err(e) => {
                            error!(rule_id = %rule.id, error = %e, "rule failed to compile, skipping");
                            self.metrics.record_error("rule_engine", "compile");
                            self.stats.lock().entry(rule.id.clone()).or_default();
                            continue;
                        }
                    }
                }
                let compiled = &cache.compiled[&rule.id];

                let value = match compiled.evaluate(&symbols) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(rule_id = %rule.id, error = %e, "rule evaluation failed, skipping");
                        self.metrics.record_error("rule_engine", "evaluation");
                        continue;
                    }
                };

                let elapsed = rule_start.elapsed();
                let triggered = value > TRIGGER_THRESHOLD;

                metrics.rules_evaluated += 1;
                metrics.total_evaluation_time += elapsed;

                let mut result = RuleResult {
                    rule_id: rule.id.clone(),
                    triggered,
                    contribution_score: if triggered { rule.weight } else { 0.0 },
                    evaluation_time: elapsed,
                    debug_info: None,
                };

                if triggered {
                    metrics.total_score += rule.weight;
                    metrics.rules_triggered += 1;
                    result.debug_info = Some(format!("triggered with value {value:.2}"));
                }

                metrics.rule_results.push(result);

                let mut stats = self.stats.lock();
                let entry = stats.entry(rule.id.clone()).or_default();
                entry.evaluation_count += 1;
                entry.total_evaluation_time += elapsed;
                if triggered {
                    entry.hit_count += 1;
                }
            }
        });

        metrics.finished_at = Instant::now();

        debug!(
            evaluated = metrics.rules_evaluated,
            triggered = metrics.rules_triggered,
            score = metrics.total_score,
            latency_us = metrics.latency().as_micros() as u64,
            "rule evaluation complete"
        );

        metrics
    }

    /// Snapshot of the active configuration.
    pub fn current_config(&self) -> Arc<RuleConfig> {
        self.current.read().clone()
    }

    /// Copy of the per-rule statistics table.
    pub fn rule_statistics(&self) -> AHashMap<String, RuleStats> {
        self.stats.lock().clone()
    }

    /// Zero all statistics counters.
    pub fn reset_statistics(&self) {
        for stats in self.stats.lock().values_mut() {
            *stats = RuleStats::default();
        }
        info!("rule statistics reset");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Message from the most recent load failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

impl Drop for RuleEngine {
    fn drop(&mut self) {
        self.disable_hot_reload();
    }
}

#[cfg(test)]
mod tests {
    use super::config::tests::SAMPLE_RULES;
    use super::*;
    use crate::domain::request::tests::sample_request;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn test_engine() -> Arc<RuleEngine> {
        let engine = Arc::new(RuleEngine::new(Arc::new(MetricsRegistry::new())));
        engine.install(RuleConfig::from_json_str(SAMPLE_RULES).unwrap());
        engine
    }

    #[test]
    fn test_evaluate_triggers_and_scores() {
        let engine = test_engine();

        let mut request = sample_request();
        request.transaction.amount = 15_000.0;
        request.customer.risk_score = 80.0;

        let metrics = engine.evaluate_rules(&request);

        // R003 is disabled; R001 and R002 both trigger
        assert_eq!(metrics.rules_evaluated, 2);
        assert_eq!(metrics.rules_triggered, 2);
        assert_eq!(metrics.total_score, 100.0);
        assert_eq!(metrics.triggered_rule_ids(), vec!["R002", "R001"]);
        assert!(!metrics.truncated);
    }

    #[test]
    fn test_no_trigger_for_clean_request() {
        let engine = test_engine();
        let metrics = engine.evaluate_rules(&sample_request());

        assert_eq!(metrics.rules_evaluated, 2);
        assert_eq!(metrics.rules_triggered, 0);
        assert_eq!(metrics.total_score, 0.0);
    }

    #[test]
    fn test_stats_monotonic() {
        let engine = test_engine();
        let mut request = sample_request();
        request.customer.risk_score = 80.0;

        for _ in 0..3 {
            engine.evaluate_rules(&request);
        }

        let stats = engine.rule_statistics();
        assert_eq!(stats["R001"].evaluation_count, 3);
        assert_eq!(stats["R001"].hit_count, 0);
        assert_eq!(stats["R002"].evaluation_count, 3);
        assert_eq!(stats["R002"].hit_count, 3);
        assert_eq!(stats["R002"].hit_rate(), 100.0);

        engine.reset_statistics();
        assert_eq!(engine.rule_statistics()["R002"].evaluation_count, 0);
    }

    #[test]
    fn test_broken_rule_does_not_fail_pass() {
        let metrics_registry = Arc::new(MetricsRegistry::new());
        let engine = Arc::new(RuleEngine::new(metrics_registry.clone()));
        engine.install(
            RuleConfig::from_json_str(
                r#"{
                    "rules": [
                        { "id": "BAD_SYNTAX", "expression": "amount >>> 1", "weight": 90.0 },
                        { "id": "BAD_TYPE", "expression": "currency + 1", "weight": 50.0 },
                        { "id": "GOOD", "expression": "amount > 10", "weight": 10.0 }
                    ]
                }"#,
            )
            .unwrap(),
        );

        let metrics = engine.evaluate_rules(&sample_request());

        assert_eq!(metrics.rules_evaluated, 1);
        assert_eq!(metrics.triggered_rule_ids(), vec!["GOOD"]);
        assert_eq!(metrics_registry.error_count("rule_engine", "compile"), 1);
        assert_eq!(metrics_registry.error_count("rule_engine", "evaluation"), 1);

        // The broken rule has a stats entry but no evaluations
        let stats = engine.rule_statistics();
        assert_eq!(stats["BAD_SYNTAX"].evaluation_count, 0);
    }

    #[test]
    fn test_uninitialized_engine_returns_empty() {
        let engine = RuleEngine::new(Arc::new(MetricsRegistry::new()));
        assert!(!engine.is_initialized());

        let metrics = engine.evaluate_rules(&sample_request());
        assert_eq!(metrics.rules_evaluated, 0);
        assert_eq!(metrics.total_score, 0.0);
    }

    #[test]
    fn test_zero_budget_truncates() {
        let engine = test_engine();
        let ctx = RuleContext::from_request(&sample_request());

        let metrics = engine.evaluate(&ctx, Some(Duration::ZERO));
        assert!(metrics.truncated);
        assert!(metrics.rules_evaluated < 2);
    }

    #[test]
    fn test_load_failure_keeps_previous_config() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE_RULES.as_bytes()).unwrap();
        file.flush().unwrap();

        let engine = Arc::new(RuleEngine::new(Arc::new(MetricsRegistry::new())));
        engine.load_rules(file.path()).unwrap();
        assert_eq!(engine.current_config().version, "2024-06-01.1");

        std::fs::write(file.path(), "{ not json").unwrap();
        assert!(engine.reload().is_err());
        assert!(engine.last_error().is_some());
        assert_eq!(engine.current_config().version, "2024-06-01.1");
    }

    #[test]
    fn test_hot_reload_picks_up_change() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE_RULES.as_bytes()).unwrap();
        file.flush().unwrap();

        let engine = Arc::new(RuleEngine::new(Arc::new(MetricsRegistry::new())));
        engine.load_rules(file.path()).unwrap();

        let observed = Arc::new(Mutex::new(None::<String>));
        let observed_clone = observed.clone();
        engine
            .enable_hot_reload(
                Duration::from_millis(20),
                Some(Arc::new(move |config: &RuleConfig| {
                    *observed_clone.lock() = Some(config.version.clone());
                })),
            )
            .unwrap();

        // Second enable is a no-op
        engine.enable_hot_reload(Duration::from_millis(20), None).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        std::fs::write(
            file.path(),
            r#"{ "version": "v2", "rules": [ { "id": "N1", "expression": "amount > 1" } ] }"#,
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.current_config().version != "v2" && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        engine.disable_hot_reload();
        assert_eq!(engine.current_config().version, "v2");
        assert_eq!(observed.lock().as_deref(), Some("v2"));
    }

    #[test]
    fn test_reload_atomicity_under_concurrent_evaluation() {
        // Two configurations with disjoint rule ids; a decision must
        // never observe rules from both at once.
        let config_a = RuleConfig::from_json_str(
            r#"{ "version": "A",
                 "rules": [ { "id": "A1", "expression": "amount > 0", "weight": 10.0 },
                            { "id": "A2", "expression": "amount > 0", "weight": 5.0 } ] }"#,
        )
        .unwrap();
        let config_b = RuleConfig::from_json_str(
            r#"{ "version": "B",
                 "rules": [ { "id": "B1", "expression": "amount > 0", "weight": 10.0 },
                            { "id": "B2", "expression": "amount > 0", "weight": 5.0 } ] }"#,
        )
        .unwrap();

        let engine = Arc::new(RuleEngine::new(Arc::new(MetricsRegistry::new())));
        engine.install(config_a.clone());

        let stop = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::new();

        for _ in 0..4 {
            let engine = engine.clone();
            let stop = stop.clone();
            workers.push(std::thread::spawn(move || {
                let request = sample_request();
                while !stop.load(Ordering::Relaxed) {
                    let metrics = engine.evaluate_rules(&request);
                    let ids = metrics.triggered_rule_ids();
                    let from_a = ids.iter().any(|id| id.starts_with('A'));
                    let from_b = ids.iter().any(|id| id.starts_with('B'));
                    assert!(
                        !(from_a && from_b),
                        "evaluation observed a mixed rule set: {ids:?}"
                    );
                    assert_eq!(ids.len(), 2, "evaluation observed a partial rule set");
                }
            }));
        }

        for i in 0..200 {
            engine.install(if i % 2 == 0 {
                config_b.clone()
            } else {
                config_a.clone()
            });
            std::thread::yield_now();
        }

        stop.store(true, Ordering::Relaxed);
        for worker in workers {
            worker.join().unwrap();
        }
    }
}
