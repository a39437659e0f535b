use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use regex::{Regex, RegexBuilder, RegexSet, RegexSetBuilder};
use tracing::{debug, info, warn};

use super::pattern::{MatchResults, Pattern, PatternError, PatternMatch};

/// Backend preference for pattern compilation.
///
/// `Auto` picks the highest-performing available backend. `Alt` is a
/// placeholder for a future engine and currently falls back to the
/// sequential backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Auto,
    HighPerf,
    Std,
    Alt,
}

/// A compiled, immutable pattern database.
///
/// All backends expose the same contract; the matcher facade owns the
/// active database and swaps it wholesale on recompile, so scans in
/// flight keep the database they started with.
pub trait PatternBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Scan one text, optionally restricted to a category.
    fn match_text(&self, text: &str, category_filter: Option<&str>) -> MatchResults;

    /// Scan a batch of texts, merging the results.
    fn match_batch(&self, texts: &[&str], category_filter: Option<&str>) -> MatchResults {
        let mut aggregated = MatchResults::default();
        for text in texts {
            aggregated.merge(self.match_text(text, category_filter));
        }
        aggregated
    }

    /// Number of scan calls served.
    fn match_count(&self) -> u64;

    /// Cumulative time spent scanning.
    fn total_match_time(&self) -> Duration;

    fn pattern_count(&self) -> usize;
}

/// Compile a pattern set with the preferred backend.
///
/// Returns the database and the kind actually selected (preference may
/// be downgraded when the requested engine is unavailable).
pub fn compile_backend(
    preference: BackendKind,
    patterns: Vec<Pattern>,
) -> Result<(Box<dyn PatternBackend>, BackendKind), PatternError> {
    match preference {
        BackendKind::Auto | BackendKind::HighPerf => {
            let backend = RegexSetBackend::compile(patterns)?;
            info!(
                patterns = backend.pattern_count(),
                "compiled pattern database with regex-set backend"
            );
            Ok((Box::new(backend), BackendKind::HighPerf))
        }
        BackendKind::Std => {
            let backend = SequentialBackend::compile(patterns)?;
            info!(
                patterns = backend.pattern_count(),
                "compiled pattern database with sequential backend"
            );
            Ok((Box::new(backend), BackendKind::Std))
        }
        BackendKind::Alt => {
            warn!("alternate pattern backend not implemented, using sequential");
            let backend = SequentialBackend::compile(patterns)?;
            Ok((Box::new(backend), BackendKind::Std))
        }
    }
}

fn compile_single(pattern: &Pattern) -> Result<Regex, PatternError> {
    RegexBuilder::new(&pattern.regex_source())
        .case_insensitive(!pattern.case_sensitive)
        .build()
        .map_err(|e| PatternError::Compile {
            pattern_id: pattern.id,
            reason: e.to_string(),
        })
}

fn record_match(
    results: &mut MatchResults,
    pattern: &Pattern,
    text: &str,
    start: usize,
    end: usize,
) {
    results.push(PatternMatch {
        pattern_id: pattern.id,
        pattern_name: pattern.name.clone(),
        matched_text: text[start..end].to_string(),
        start,
        end,
        category: pattern.category.clone(),
    });
}

#[inline]
fn category_allows(pattern: &Pattern, filter: Option<&str>) -> bool {
    filter.map_or(true, |f| pattern.category == f)
}

/// Sequential backend: one compiled regex per pattern, scanned in
/// order. Always available; the baseline for correctness.
pub struct SequentialBackend {
    entries: Vec<(Pattern, Regex)>,
    match_count: AtomicU64,
    total_time_us: AtomicU64,
}

impl SequentialBackend {
    pub fn compile(patterns: Vec<Pattern>) -> Result<Self, PatternError> {
        let mut entries = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let regex = compile_single(&pattern)?;
            debug!(pattern_id = pattern.id, name = %pattern.name, "pattern compiled");
            entries.push((pattern, regex));
        }
        Ok(SequentialBackend {
            entries,
            match_count: AtomicU64::new(0),
            total_time_us: AtomicU64::new(0),
        })
    }

    fn record_scan(&self, start: Instant) -> Duration {
        let elapsed = start.elapsed();
        self.match_count.fetch_add(1, Ordering::Relaxed);
        self.total_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        elapsed
    }
}

impl PatternBackend for SequentialBackend {
    fn name(&self) -> &'static str {
        "sequential-regex"
    }

    fn match_text(&self, text: &str, category_filter: Option<&str>) -> MatchResults {
        let start = Instant::now();
        let mut results = MatchResults {
            texts_processed: 1,
            patterns_checked: self.entries.len(),
            ..MatchResults::default()
        };

        for (pattern, regex) in &self.entries {
            if !category_allows(pattern, category_filter) {
                continue;
            }
            if let Some(m) = regex.find(text) {
                record_match(&mut results, pattern, text, m.start(), m.end());
            }
        }

        results.evaluation_time = self.record_scan(start);
        results
    }

    fn match_count(&self) -> u64 {
        self.match_count.load(Ordering::Relaxed)
    }

    fn total_match_time(&self) -> Duration {
        Duration::from_micros(self.total_time_us.load(Ordering::Relaxed))
    }

    fn pattern_count(&self) -> usize {
        self.entries.len()
    }
}

/// Regex-set backend: all patterns fused into one `RegexSet` scanned in
/// a single pass; the per-pattern regexes are only consulted for match
/// offsets on the patterns the set reports.
pub struct RegexSetBackend {
    set: RegexSet,
    entries: Vec<(Pattern, Regex)>,
    match_count: AtomicU64,
    total_time_us: AtomicU64,
}

impl RegexSetBackend {
    pub fn compile(patterns: Vec<Pattern>) -> Result<Self, PatternError> {
        let sources: Vec<String> = patterns
            .iter()
            .map(|p| {
                if p.case_sensitive {
                    p.regex_source()
                } else {
                    format!("(?i:{})", p.regex_source())
                }
            })
            .collect();

        let set = RegexSetBuilder::new(&sources).build().map_err(|e| {
            // The set error does not name a pattern; find the culprit
            // by compiling individually.
            for pattern in &patterns {
                if let Err(err) = compile_single(pattern) {
                    return err;
                }
            }
            PatternError::Compile {
                pattern_id: 0,
                reason: e.to_string(),
            }
        })?;

        let mut entries = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let regex = compile_single(&pattern)?;
            entries.push((pattern, regex));
        }

        Ok(RegexSetBackend {
            set,
            entries,
            match_count: AtomicU64::new(0),
            total_time_us: AtomicU64::new(0),
        })
    }
}

impl PatternBackend for RegexSetBackend {
    fn name(&self) -> &'static str {
        "regex-set"
    }

    fn match_text(&self, text: &str, category_filter: Option<&str>) -> MatchResults {
        let start = Instant::now();
        let mut results = MatchResults {
            texts_processed: 1,
            patterns_checked: self.entries.len(),
            ..MatchResults::default()
        };

        let matched = self.set.matches(text);
        for index in matched.iter() {
            let (pattern, regex) = &self.entries[index];
            if !category_allows(pattern, category_filter) {
                continue;
            }
            if let Some(m) = regex.find(text) {
                record_match(&mut results, pattern, text, m.start(), m.end());
            }
        }

        let elapsed = start.elapsed();
        self.match_count.fetch_add(1, Ordering::Relaxed);
        self.total_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        results.evaluation_time = elapsed;
        results
    }

    fn match_count(&self) -> u64 {
        self.match_count.load(Ordering::Relaxed)
    }

    fn total_match_time(&self) -> Duration {
        Duration::from_micros(self.total_time_us.load(Ordering::Relaxed))
    }

    fn pattern_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::super::pattern::PatternKind;
    use super::*;

    fn pattern(id: u32, text: &str, category: &str, kind: PatternKind) -> Pattern {
        Pattern {
            id,
            name: format!("{category}_{id}"),
            pattern: text.to_string(),
            category: category.to_string(),
            kind,
            is_regex: kind == PatternKind::Cidr,
            case_sensitive: true,
            priority: 10,
        }
    }

    fn test_patterns() -> Vec<Pattern> {
        vec![
            pattern(1, "203.0.113.99", "blacklist", PatternKind::Exact),
            pattern(2, "MERCH_FRAUD_*", "blacklist", PatternKind::Wildcard),
            pattern(3, "^192\\.168\\.\\d{1,3}\\.\\d{1,3}$", "blacklist", PatternKind::Cidr),
            pattern(4, "trusted-partner", "whitelist", PatternKind::Exact),
        ]
    }

    fn backends() -> Vec<Box<dyn PatternBackend>> {
        vec![
            Box::new(SequentialBackend::compile(test_patterns()).unwrap()),
            Box::new(RegexSetBackend::compile(test_patterns()).unwrap()),
        ]
    }

    #[test]
    fn test_exact_matches_substring_with_offsets() {
        for backend in backends() {
            let text = "ip=203.0.113.99 port=443";
            let results = backend.match_text(text, None);

            assert_eq!(results.total_matches(), 1, "{}", backend.name());
            let m = &results.matches[0];
            assert_eq!(m.pattern_id, 1);
            assert_eq!(m.matched_text, "203.0.113.99");
            assert_eq!(&text[m.start..m.end], "203.0.113.99");
        }
    }

    #[test]
    fn test_wildcard_anchored() {
        for backend in backends() {
            assert_eq!(
                backend.match_text("MERCH_FRAUD_001", None).total_matches(),
                1,
                "{}",
                backend.name()
            );
            // Anchoring: the wildcard must cover the whole text
            assert_eq!(
                backend
                    .match_text("prefix MERCH_FRAUD_001", None)
                    .total_matches(),
                0
            );
        }
    }

    #[test]
    fn test_cidr_matches_addresses() {
        for backend in backends() {
            assert_eq!(backend.match_text("192.168.4.20", None).total_matches(), 1);
            assert_eq!(backend.match_text("10.0.0.1", None).total_matches(), 0);
        }
    }

    #[test]
    fn test_category_filter_restricts_scan() {
        for backend in backends() {
            let results = backend.match_text("trusted-partner", Some("blacklist"));
            assert_eq!(results.total_matches(), 0, "{}", backend.name());

            let results = backend.match_text("trusted-partner", Some("whitelist"));
            assert_eq!(results.total_matches(), 1);
            assert!(results.has_whitelist_matches());
        }
    }

    #[test]
    fn test_match_batch_merges() {
        for backend in backends() {
            let results =
                backend.match_batch(&["203.0.113.99", "trusted-partner", "clean"], None);
            assert_eq!(results.texts_processed, 3);
            assert_eq!(results.total_matches(), 2);
            assert_eq!(results.blacklist_matches.len(), 1);
            assert_eq!(results.whitelist_matches.len(), 1);
        }
    }

    #[test]
    fn test_backend_statistics() {
        for backend in backends() {
            backend.match_text("a", None);
            backend.match_text("b", None);
            assert_eq!(backend.match_count(), 2, "{}", backend.name());
            assert_eq!(backend.pattern_count(), 4);
        }
    }

    #[test]
    fn test_compile_error_names_pattern() {
        let bad = vec![Pattern {
            id: 7,
            name: "blacklist_cidr_7".to_string(),
            pattern: "((unclosed".to_string(),
            category: "blacklist".to_string(),
            kind: PatternKind::Cidr,
            is_regex: true,
            case_sensitive: true,
            priority: 10,
        }];

        for result in [
            SequentialBackend::compile(bad.clone()).map(|_| ()),
            RegexSetBackend::compile(bad).map(|_| ()),
        ] {
            match result {
                Err(PatternError::Compile { pattern_id, .. }) => assert_eq!(pattern_id, 7),
                other => panic!("expected compile error, got {other:?}"),
            }
        }
    }
}
