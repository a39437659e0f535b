use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use smallvec::SmallVec;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::TransactionRequest;

/// Errors from loading or compiling patterns.
#[derive(Error, Debug)]
pub enum PatternError {
    #[error("pattern file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to read pattern file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid CIDR {pattern:?}: {reason}")]
    InvalidCidr { pattern: String, reason: String },

    #[error("pattern {pattern_id} failed to compile: {reason}")]
    Compile { pattern_id: u32, reason: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("pattern matcher holds no compiled database")]
    NotCompiled,
}

/// How a pattern line was classified during parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// Plain text, matched as a substring
    Exact,
    /// `*` / `?` wildcard, matched against the whole text
    Wildcard,
    /// CIDR range converted to an address regex
    Cidr,
}

impl PatternKind {
    fn label(&self) -> &'static str {
        match self {
            PatternKind::Exact => "exact",
            PatternKind::Wildcard => "wildcard",
            PatternKind::Cidr => "cidr",
        }
    }
}

/// A single compiled-to-be pattern from a block or allow list.
#[derive(Debug, Clone)]
pub struct Pattern {
    /// Unique within the active pattern set
    pub id: u32,
    pub name: String,
    /// Pattern source; already a regex for CIDR entries
    pub pattern: String,
    /// Category tag; contains "blacklist" or "whitelist"
    pub category: String,
    pub kind: PatternKind,
    pub is_regex: bool,
    pub case_sensitive: bool,
    pub priority: u32,
}

impl Pattern {
    /// The regex source this pattern compiles to.
    ///
    /// Exact patterns are escaped and left unanchored so they match any
    /// substring; wildcard and CIDR patterns are anchored to the whole
    /// text.
    pub fn regex_source(&self) -> String {
        if self.is_regex {
            self.pattern.clone()
        } else if self.kind == PatternKind::Wildcard {
            wildcard_to_regex(&self.pattern)
        } else {
            regex::escape(&self.pattern)
        }
    }

    pub fn is_blacklist(&self) -> bool {
        self.category.contains("blacklist")
    }

    pub fn is_whitelist(&self) -> bool {
        self.category.contains("whitelist")
    }
}

/// One pattern hit inside one scanned text.
#[derive(Debug, Clone, Serialize)]
pub struct PatternMatch {
    pub pattern_id: u32,
    pub pattern_name: String,
    pub matched_text: String,
    /// Byte offsets into the scanned text, half-open
    pub start: usize,
    pub end: usize,
    pub category: String,
}

/// Aggregated result of scanning one or more texts.
#[derive(Debug, Clone, Default)]
pub struct MatchResults {
    pub matches: Vec<PatternMatch>,
    pub blacklist_matches: Vec<PatternMatch>,
    pub whitelist_matches: Vec<PatternMatch>,
    pub texts_processed: usize,
    pub patterns_checked: usize,
    pub evaluation_time: Duration,
}

impl MatchResults {
    pub fn has_blacklist_matches(&self) -> bool {
        !self.blacklist_matches.is_empty()
    }

    pub fn has_whitelist_matches(&self) -> bool {
        !self.whitelist_matches.is_empty()
    }

    pub fn total_matches(&self) -> usize {
        self.matches.len()
    }

    /// Informational risk contribution: +10 per blacklist hit, -5 per
    /// whitelist hit, floored at zero.
    pub fn match_score(&self) -> f64 {
        let score =
            10.0 * self.blacklist_matches.len() as f64 - 5.0 * self.whitelist_matches.len() as f64;
        score.max(0.0)
    }

    /// Record a hit, classifying it by category.
    pub(crate) fn push(&mut self, m: PatternMatch) {
        if m.category.contains("blacklist") {
            self.blacklist_matches.push(m.clone());
        } else if m.category.contains("whitelist") {
            self.whitelist_matches.push(m.clone());
        }
        self.matches.push(m);
    }

    /// Fold another result set into this one.
    pub(crate) fn merge(&mut self, other: MatchResults) {
        self.matches.extend(other.matches);
        self.blacklist_matches.extend(other.blacklist_matches);
        self.whitelist_matches.extend(other.whitelist_matches);
        self.texts_processed += other.texts_processed;
        self.patterns_checked = self.patterns_checked.max(other.patterns_checked);
        self.evaluation_time += other.evaluation_time;
    }
}

/// Parse a line-oriented pattern file.
///
/// Lines are trimmed; blanks and `#` comments are skipped. Each kept
/// line is classified as CIDR, wildcard, or exact and assigned an id
/// starting from `first_id` so ids stay unique across the block and
/// allow files of one set. Invalid CIDR lines are skipped with a
/// warning rather than failing the whole file.
pub fn parse_pattern_file(
    path: impl AsRef<Path>,
    category: &str,
    first_id: u32,
) -> Result<Vec<Pattern>, PatternError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(PatternError::FileNotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;

    let mut patterns = Vec::new();
    let mut next_id = first_id;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let id = next_id;
        let looks_like_cidr = line.contains('/') && (line.contains('.') || line.contains(':'));

        let (kind, pattern, is_regex) = if looks_like_cidr {
            match cidr_to_regex(line) {
                Ok(regex) => (PatternKind::Cidr, regex, true),
                Err(e) => {
                    warn!(line, error = %e, "skipping invalid CIDR pattern");
                    continue;
                }
            }
        } else if line.contains('*') {
            (PatternKind::Wildcard, line.to_string(), false)
        } else {
            (PatternKind::Exact, line.to_string(), false)
        };

        patterns.push(Pattern {
            id,
            name: format!("{category}_{}_{id}", kind.label()),
            pattern,
            category: category.to_string(),
            kind,
            is_regex,
            case_sensitive: true,
            priority: 10,
        });
        next_id += 1;
    }

    info!(
        path = %path.display(),
        category,
        count = patterns.len(),
        "pattern file parsed"
    );
    Ok(patterns)
}

/// Convert a `*` / `?` wildcard pattern to an anchored regex, escaping
/// all other metacharacters.
pub fn wildcard_to_regex(wildcard: &str) -> String {
    let mut regex = String::with_capacity(wildcard.len() * 2 + 2);
    regex.push('^');

    for c in wildcard.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '.' | '^' | '$' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '\\' => {
                regex.push('\\');
                regex.push(c);
            }
            other => regex.push(other),
        }
    }

    regex.push('$');
    regex
}

/// Convert IPv4 CIDR notation to a regex matching addresses in the
/// range, bucketed by prefix length: >=24 pins the first three octets,
/// 16..=23 the first two, anything shorter the first octet only.
pub fn cidr_to_regex(cidr: &str) -> Result<String, PatternError> {
    let invalid = |reason: &str| PatternError::InvalidCidr {
        pattern: cidr.to_string(),
        reason: reason.to_string(),
    };

    let (ip_part, prefix_part) = cidr.split_once('/').ok_or_else(|| invalid("missing '/'"))?;

    let prefix_length: u32 = prefix_part
        .parse()
        .map_err(|_| invalid("prefix length is not a number"))?;
    if prefix_length > 32 {
        return Err(invalid("prefix length outside [0, 32]"));
    }

    let octets: Vec<&str> = ip_part.split('.').collect();
    if octets.len() != 4 || octets.iter().any(|o| o.parse::<u8>().is_err()) {
        return Err(invalid("not a dotted-quad IPv4 address"));
    }

    let pinned = if prefix_length >= 24 {
        3
    } else if prefix_length >= 16 {
        2
    } else {
        1
    };

    let mut regex = String::from("^");
    regex.push_str(&octets[..pinned].join("\\."));
    for _ in pinned..4 {
        regex.push_str("\\.\\d{1,3}");
    }
    regex.push('$');

    Ok(regex)
}

/// The text-bearing fields of a request that get scanned per decision.
pub fn extract_match_fields(
    request: &TransactionRequest,
) -> SmallVec<[(&'static str, &str); 10]> {
    smallvec::smallvec![
        ("ip_address", request.device.ip.as_str()),
        ("device_fingerprint", request.device.fingerprint.as_str()),
        ("user_agent", request.device.user_agent.as_str()),
        ("merchant_id", request.transaction.merchant_id.as_str()),
        ("card_token", request.card.token.as_str()),
        ("issuer_country", request.card.issuer_country.as_str()),
        ("card_brand", request.card.card_brand.as_str()),
        ("customer_id", request.customer.id.as_str()),
        ("currency", request.transaction.currency.as_str()),
        ("pos_entry_mode", request.transaction.pos_entry_mode.as_str()),
    ]
}
