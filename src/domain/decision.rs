use serde::{Deserialize, Serialize};
use std::fmt;

/// Final outcome of a risk evaluation.
///
/// Ordered by severity: when an override applies, the more severe
/// decision wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Decision {
    /// Transaction approved
    Approve = 0,
    /// Requires manual review
    Review = 1,
    /// Transaction declined
    Decline = 2,
}

impl Decision {
    /// Returns the more severe of two decisions.
    #[inline]
    pub fn max(self, other: Self) -> Self {
        std::cmp::max(self, other)
    }

    /// Returns true if this decision allows the transaction.
    #[inline]
    pub fn is_approved(&self) -> bool {
        *self == Decision::Approve
    }

    /// Parse from the wire representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "APPROVE" => Some(Decision::Approve),
            "REVIEW" => Some(Decision::Review),
            "DECLINE" => Some(Decision::Decline),
            _ => None,
        }
    }
}

impl Default for Decision {
    fn default() -> Self {
        Decision::Approve
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Approve => write!(f, "APPROVE"),
            Decision::Review => write!(f, "REVIEW"),
            Decision::Decline => write!(f, "DECLINE"),
        }
    }
}

/// Score thresholds mapping a fused risk score to a decision.
///
/// Invariant: `approve_threshold < review_threshold`, both within [0,100].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Thresholds {
    pub approve_threshold: f64,
    pub review_threshold: f64,
}

impl Thresholds {
    /// Map a risk score to a decision.
    ///
    /// Score below the approve threshold approves; at or above the review
    /// threshold declines; anything between goes to review.
    #[inline]
    pub fn decide(&self, score: f64) -> Decision {
        if score < self.approve_threshold {
            Decision::Approve
        } else if score >= self.review_threshold {
            Decision::Decline
        } else {
            Decision::Review
        }
    }

    /// Check the ordering invariant.
    pub fn is_valid(&self) -> bool {
        self.approve_threshold < self.review_threshold
            && self.approve_threshold >= 0.0
            && self.review_threshold <= 100.0
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            approve_threshold: 30.0,
            review_threshold: 70.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_ordering() {
        assert!(Decision::Approve < Decision::Review);
        assert!(Decision::Review < Decision::Decline);
        assert_eq!(Decision::Approve.max(Decision::Decline), Decision::Decline);
    }

    #[test]
    fn test_decision_serialization() {
        let json = serde_json::to_string(&Decision::Decline).unwrap();
        assert_eq!(json, "\"DECLINE\"");

        let parsed: Decision = serde_json::from_str("\"REVIEW\"").unwrap();
        assert_eq!(parsed, Decision::Review);
    }

    #[test]
    fn test_threshold_mapping() {
        let thresholds = Thresholds::default();

        assert_eq!(thresholds.decide(0.0), Decision::Approve);
        assert_eq!(thresholds.decide(29.99), Decision::Approve);
        assert_eq!(thresholds.decide(30.0), Decision::Review);
        assert_eq!(thresholds.decide(69.99), Decision::Review);
        assert_eq!(thresholds.decide(70.0), Decision::Decline);
        assert_eq!(thresholds.decide(100.0), Decision::Decline);
    }

    #[test]
    fn test_threshold_validation() {
        assert!(Thresholds::default().is_valid());
        assert!(!Thresholds {
            approve_threshold: 70.0,
            review_threshold: 30.0,
        }
        .is_valid());
        assert!(!Thresholds {
            approve_threshold: -1.0,
            review_threshold: 50.0,
        }
        .is_valid());
    }
}
