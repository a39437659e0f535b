//! riskgate: a real-time transaction risk-decision engine.
//!
//! Given a transaction request, produces an APPROVE / REVIEW / DECLINE
//! decision, a risk score in [0,100], and an audit trail of the rules
//! and adjustments that contributed. The transport layer (HTTP, queue)
//! is an external collaborator wired against
//! [`DecisionOrchestrator`](orchestrator::DecisionOrchestrator).

pub mod config;
pub mod domain;
pub mod engine;
pub mod matcher;
pub mod observability;
pub mod orchestrator;
pub mod reload;

pub use config::{ConfigStore, SystemConfig};
pub use domain::{Decision, DecisionResponse, RuleContext, TransactionRequest};
pub use engine::{RuleConfig, RuleEngine};
pub use matcher::{BackendKind, PatternMatcher};
pub use observability::MetricsRegistry;
pub use orchestrator::{DecisionError, DecisionOrchestrator};
