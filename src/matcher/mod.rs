//! Pattern matcher: compiles block/allow lists of exact strings,
//! wildcards, and CIDR ranges into a single database and scans the
//! text-bearing fields of each request.

pub mod backend;
pub mod pattern;

pub use backend::{BackendKind, PatternBackend};
pub use pattern::{
    extract_match_fields, MatchResults, Pattern, PatternError, PatternKind, PatternMatch,
};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::domain::TransactionRequest;
use crate::observability::MetricsRegistry;
use crate::reload::FileWatcher;

/// Observer invoked with the new pattern count after a successful
/// list reload.
pub type PatternReloadObserver = Arc<dyn Fn(usize) + Send + Sync>;

/// Lifecycle of the matcher's pattern set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherState {
    /// No patterns loaded
    Uninit,
    /// Patterns loaded or added, compile pending
    Loaded,
    /// Database compiled, not yet exercised
    Compiled,
    /// Compiled and serving scans
    Ready,
    /// Last load or compile failed (recoverable by re-loading)
    Error,
}

/// Statistics surface for the matcher.
#[derive(Debug, Clone)]
pub struct MatcherStatistics {
    pub total_patterns: usize,
    pub blacklist_patterns: usize,
    pub whitelist_patterns: usize,
    pub match_count: u64,
    pub total_match_time: Duration,
    pub backend: &'static str,
    pub state: MatcherState,
}

/// The pattern matcher facade.
///
/// Owns the loaded pattern set and the active compiled database. A
/// recompile builds a fresh database and swaps it atomically; a failed
/// compile leaves the previous database serving. Scans in flight keep
/// the `Arc` snapshot they started with.
pub struct PatternMatcher {
    preference: BackendKind,
    state: RwLock<MatcherState>,
    patterns: Mutex<Vec<Pattern>>,
    db: RwLock<Option<Arc<dyn PatternBackend>>>,
    active_kind: RwLock<Option<BackendKind>>,
    paths: Mutex<Option<(PathBuf, PathBuf)>>,
    observer: Mutex<Option<PatternReloadObserver>>,
    watcher: Mutex<Option<FileWatcher>>,
    last_error: Mutex<Option<String>>,
    metrics: Arc<MetricsRegistry>,
}

impl PatternMatcher {
    /// Create an empty matcher with a backend preference.
    pub fn new(preference: BackendKind, metrics: Arc<MetricsRegistry>) -> Self {
        PatternMatcher {
            preference,
            state: RwLock::new(MatcherState::Uninit),
            patterns: Mutex::new(Vec::new()),
            db: RwLock::new(None),
            active_kind: RwLock::new(None),
            paths: Mutex::new(None),
            observer: Mutex::new(None),
            watcher: Mutex::new(None),
            last_error: Mutex::new(None),
            metrics,
        }
    }

    /// Load the block and allow lists, replacing any previously loaded
    /// (uncompiled) set. Requires a [`compile`](Self::compile) before
    /// the new set is served.
    pub fn load_patterns(
        &self,
        blacklist_path: impl Into<PathBuf>,
        whitelist_path: impl Into<PathBuf>,
    ) -> Result<(), PatternError> {
        let blacklist_path = blacklist_path.into();
        let whitelist_path = whitelist_path.into();

        match self.parse_lists(&blacklist_path, &whitelist_path) {
            Ok(patterns) => {
                *self.patterns.lock() = patterns;
                *self.paths.lock() = Some((blacklist_path, whitelist_path));
                *self.state.write() = MatcherState::Loaded;
                *self.last_error.lock() = None;
                Ok(())
            }
            Err(e) => {
                *self.state.write() = MatcherState::Error;
                *self.last_error.lock() = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn parse_lists(
        &self,
        blacklist_path: &PathBuf,
        whitelist_path: &PathBuf,
    ) -> Result<Vec<Pattern>, PatternError> {
        let mut patterns = pattern::parse_pattern_file(blacklist_path, "blacklist", 1)?;
        let next_id = patterns.len() as u32 + 1;
        let whitelist = pattern::parse_pattern_file(whitelist_path, "whitelist", next_id)?;
        patterns.extend(whitelist);

        info!(
            total = patterns.len(),
            blacklist = patterns.iter().filter(|p| p.is_blacklist()).count(),
            whitelist = patterns.iter().filter(|p| p.is_whitelist()).count(),
            "pattern lists loaded"
        );
        Ok(patterns)
    }

    /// Add a pattern programmatically. Drops the set back to `Loaded`;
    /// the addition is served only after the next compile.
    pub fn add_pattern(&self, pattern: Pattern) -> Result<(), PatternError> {
        let mut patterns = self.patterns.lock();
        if patterns.iter().any(|p| p.id == pattern.id) {
            return Err(PatternError::Validation(format!(
                "duplicate pattern id: {}",
                pattern.id
            )));
        }
        debug!(pattern_id = pattern.id, name = %pattern.name, "pattern added");
        patterns.push(pattern);
        *self.state.write() = MatcherState::Loaded;
        Ok(())
    }

    /// Compile the loaded set into a fresh database and swap it in.
    ///
    /// A compile error is fatal to this attempt only: the previous
    /// database keeps serving and the state moves to `Error`.
    pub fn compile(&self) -> Result<(), PatternError> {
        let patterns = self.patterns.lock().clone();

        match backend::compile_backend(self.preference, patterns) {
            Ok((db, kind)) => {
                *self.db.write() = Some(Arc::from(db));
                *self.active_kind.write() = Some(kind);
                *self.state.write() = MatcherState::Compiled;
                *self.last_error.lock() = None;
                Ok(())
            }
            Err(e) => {
                self.metrics.record_error("pattern_matcher", "compile");
                *self.state.write() = MatcherState::Error;
                *self.last_error.lock() = Some(e.to_string());
                error!(error = %e, "pattern compile failed, previous database retained");
                Err(e)
            }
        }
    }

    /// Snapshot of the active database, if any.
    fn active_db(&self) -> Option<Arc<dyn PatternBackend>> {
        self.db.read().clone()
    }

    fn mark_ready(&self) {
        let mut state = self.state.write();
        if *state == MatcherState::Compiled {
            *state = MatcherState::Ready;
        }
    }

    /// Scan a single text. Without a compiled database this logs and
    /// returns empty results (a matching failure is never a decision
    /// failure).
    pub fn match_text(&self, text: &str, category_filter: Option<&str>) -> MatchResults {
        let Some(db) = self.active_db() else {
            error!("pattern matcher has no compiled database");
            self.metrics.record_error("pattern_matcher", "match");
            return MatchResults::default();
        };
        let results = db.match_text(text, category_filter);
        self.mark_ready();
        results
    }

    /// Scan a batch of texts, merging the results.
    pub fn match_batch(&self, texts: &[&str], category_filter: Option<&str>) -> MatchResults {
        let Some(db) = self.active_db() else {
            error!("pattern matcher has no compiled database");
            self.metrics.record_error("pattern_matcher", "match");
            return MatchResults::default();
        };
        let results = db.match_batch(texts, category_filter);
        self.mark_ready();
        results
    }

    /// Scan every text-bearing field of a request and merge the hits.
    pub fn match_transaction(&self, request: &TransactionRequest) -> MatchResults {
        let Some(db) = self.active_db() else {
            error!("pattern matcher has no compiled database");
            self.metrics.record_error("pattern_matcher", "match");
            return MatchResults::default();
        };

        let mut aggregated = MatchResults::default();
        for (field, value) in extract_match_fields(request) {
            if value.is_empty() {
                continue;
            }
            let results = db.match_text(value, None);
            if results.total_matches() > 0 {
                debug!(
                    field,
                    matches = results.total_matches(),
                    "pattern hits on request field"
                );
            }
            aggregated.merge(results);
        }

        self.mark_ready();
        aggregated
    }

    /// Reload both list files and recompile; swap only on success.
    pub fn reload(&self) -> Result<(), PatternError> {
        let Some((blacklist_path, whitelist_path)) = self.paths.lock().clone() else {
            return Err(PatternError::NotCompiled);
        };

        let result = self
            .parse_lists(&blacklist_path, &whitelist_path)
            .and_then(|patterns| {
                let (db, kind) = backend::compile_backend(self.preference, patterns.clone())?;
                *self.patterns.lock() = patterns;
                *self.db.write() = Some(Arc::from(db));
                *self.active_kind.write() = Some(kind);
                *self.state.write() = MatcherState::Compiled;
                *self.last_error.lock() = None;
                Ok(())
            });

        match result {
            Ok(()) => {
                self.metrics.record_reload(true);
                let count = self.patterns.lock().len();
                info!(patterns = count, "pattern lists reloaded");
                if let Some(observer) = self.observer.lock().clone() {
                    observer(count);
                }
                Ok(())
            }
            Err(e) => {
                self.metrics.record_reload(false);
                self.metrics.record_error("pattern_matcher", "config");
                *self.last_error.lock() = Some(e.to_string());
                error!(error = %e, "pattern reload failed, previous database retained");
                Err(e)
            }
        }
    }

    /// Watch both list files for changes. Idempotent; requires
    /// [`load_patterns`](Self::load_patterns) to have succeeded.
    pub fn enable_hot_reload(
        self: &Arc<Self>,
        interval: Duration,
        observer: Option<PatternReloadObserver>,
    ) -> Result<(), PatternError> {
        let Some((blacklist_path, whitelist_path)) = self.paths.lock().clone() else {
            return Err(PatternError::NotCompiled);
        };

        let mut watcher = self.watcher.lock();
        if watcher.is_some() {
            return Ok(());
        }

        *self.observer.lock() = observer;

        // Weak reference: the watcher must not keep the matcher alive
        let matcher = Arc::downgrade(self);
        *watcher = Some(FileWatcher::spawn(
            vec![blacklist_path, whitelist_path],
            interval,
            move || {
                if let Some(matcher) = matcher.upgrade() {
                    let _ = matcher.reload();
                }
            },
        ));

        info!(
            interval_ms = interval.as_millis() as u64,
            "pattern hot reload enabled"
        );
        Ok(())
    }

    /// Stop watching the list files. Idempotent.
    pub fn disable_hot_reload(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.stop();
            info!("pattern hot reload disabled");
        }
    }

    /// Current statistics snapshot.
    pub fn statistics(&self) -> MatcherStatistics {
        let patterns = self.patterns.lock();
        let db = self.active_db();

        MatcherStatistics {
            total_patterns: patterns.len(),
            blacklist_patterns: patterns.iter().filter(|p| p.is_blacklist()).count(),
            whitelist_patterns: patterns.iter().filter(|p| p.is_whitelist()).count(),
            match_count: db.as_ref().map_or(0, |db| db.match_count()),
            total_match_time: db.as_ref().map_or(Duration::ZERO, |db| db.total_match_time()),
            backend: db.as_ref().map_or("none", |db| db.name()),
            state: self.state(),
        }
    }

    /// Reset scan statistics by rebuilding the active database.
    pub fn reset_statistics(&self) {
        if self.active_db().is_some() {
            let _ = self.compile();
        }
        info!("pattern matcher statistics reset");
    }

    pub fn state(&self) -> MatcherState {
        *self.state.read()
    }

    /// True once a database has been compiled and is available to scan.
    pub fn is_initialized(&self) -> bool {
        self.db.read().is_some()
    }

    /// The backend kind actually serving scans, if compiled.
    pub fn active_backend(&self) -> Option<BackendKind> {
        *self.active_kind.read()
    }

    /// Message from the most recent failed load or compile, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

impl Drop for PatternMatcher {
    fn drop(&mut self) {
        self.disable_hot_reload();
    }
}
