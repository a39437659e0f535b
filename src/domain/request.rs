use std::net::IpAddr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transaction amount bounds in major units.
pub const MIN_AMOUNT: f64 = 0.01;
pub const MAX_AMOUNT: f64 = 1_000_000.0;

/// Maximum tolerated clock skew on request timestamps.
const MAX_FUTURE_SKEW_MS: u64 = 3_600_000;

/// Feature cache window in seconds.
const CACHE_BUCKET_SECS: u64 = 300;

/// Validation failure for a decision request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("field {field} out of range: {reason}")]
    OutOfRange {
        field: &'static str,
        reason: String,
    },

    #[error("field {field} invalid: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), RequestError> {
    if value.is_empty() {
        return Err(RequestError::MissingField(field));
    }
    if value.len() > max {
        return Err(RequestError::OutOfRange {
            field,
            reason: format!("length {} exceeds {}", value.len(), max),
        });
    }
    Ok(())
}

/// Transaction sub-record of a decision request.
///
/// Fields default when absent so that missing-field reporting happens
/// in [`validate`](Self::validate) with a typed error, not at parse
/// time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionInfo {
    pub amount: f64,
    pub currency: String,
    pub merchant_id: String,
    pub merchant_category: u16,
    pub pos_entry_mode: String,
}

impl TransactionInfo {
    pub fn validate(&self) -> Result<(), RequestError> {
        if !(MIN_AMOUNT..=MAX_AMOUNT).contains(&self.amount) {
            return Err(RequestError::OutOfRange {
                field: "transaction.amount",
                reason: format!("{} outside [{}, {}]", self.amount, MIN_AMOUNT, MAX_AMOUNT),
            });
        }
        if self.currency.len() != 3 {
            return Err(RequestError::InvalidField {
                field: "transaction.currency",
                reason: "must be a 3-character code".to_string(),
            });
        }
        check_len("transaction.merchant_id", &self.merchant_id, 50)?;
        if self.merchant_category == 0 {
            return Err(RequestError::OutOfRange {
                field: "transaction.merchant_category",
                reason: "must be positive".to_string(),
            });
        }
        check_len("transaction.pos_entry_mode", &self.pos_entry_mode, 20)?;
        Ok(())
    }
}

/// Card sub-record. The PAN never appears; only the token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CardInfo {
    pub token: String,
    pub issuer_country: String,
    pub card_brand: String,
}

impl CardInfo {
    pub fn validate(&self) -> Result<(), RequestError> {
        check_len("card.token", &self.token, 100)?;
        if self.issuer_country.is_empty() || self.issuer_country.len() > 2 {
            return Err(RequestError::InvalidField {
                field: "card.issuer_country",
                reason: "must be a 2-character country code".to_string(),
            });
        }
        check_len("card.card_brand", &self.card_brand, 20)?;
        Ok(())
    }
}

/// Device sub-record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    pub ip: String,
    pub fingerprint: String,
    pub user_agent: String,
}

impl DeviceInfo {
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.ip.parse::<IpAddr>().is_err() {
            return Err(RequestError::InvalidField {
                field: "device.ip",
                reason: format!("not a valid IPv4/IPv6 address: {}", self.ip),
            });
        }
        check_len("device.fingerprint", &self.fingerprint, 100)?;
        check_len("device.user_agent", &self.user_agent, 500)?;
        Ok(())
    }
}

/// Customer sub-record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomerInfo {
    pub id: String,
    pub risk_score: f64,
    pub account_age_days: u32,
}

impl CustomerInfo {
    pub fn validate(&self) -> Result<(), RequestError> {
        check_len("customer.id", &self.id, 50)?;
        if !(0.0..=100.0).contains(&self.risk_score) {
            return Err(RequestError::OutOfRange {
                field: "customer.risk_score",
                reason: format!("{} outside [0, 100]", self.risk_score),
            });
        }
        if self.account_age_days > 36_500 {
            return Err(RequestError::OutOfRange {
                field: "customer.account_age_days",
                reason: format!("{} exceeds 36500", self.account_age_days),
            });
        }
        Ok(())
    }
}

/// A complete decision request as received from the transport layer.
///
/// Immutable once parsed; all evaluation works from this value and the
/// derived [`RuleContext`](crate::domain::RuleContext).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionRequest {
    pub request_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub transaction: TransactionInfo,
    pub card: CardInfo,
    pub device: DeviceInfo,
    pub customer: CustomerInfo,
}

impl TransactionRequest {
    /// Validate every per-field bound of the request envelope.
    pub fn validate(&self) -> Result<(), RequestError> {
        check_len("request_id", &self.request_id, 100)?;

        let now_ms = Utc::now().timestamp_millis() as u64;
        if self.timestamp > now_ms + MAX_FUTURE_SKEW_MS {
            return Err(RequestError::OutOfRange {
                field: "timestamp",
                reason: "more than one hour in the future".to_string(),
            });
        }

        self.transaction.validate()?;
        self.card.validate()?;
        self.device.validate()?;
        self.customer.validate()?;
        Ok(())
    }

    /// Cache key for feature lookups, bucketed to five-minute windows.
    pub fn cache_key(&self) -> String {
        let bucket = self.timestamp / 1000 / CACHE_BUCKET_SECS;
        format!(
            "features:{}:{}:{}",
            self.customer.id, self.transaction.merchant_id, bucket
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_request() -> TransactionRequest {
        TransactionRequest {
            request_id: "req-0001".to_string(),
            timestamp: Utc::now().timestamp_millis() as u64,
            transaction: TransactionInfo {
                amount: 100.0,
                currency: "USD".to_string(),
                merchant_id: "MERCH_001".to_string(),
                merchant_category: 5411,
                pos_entry_mode: "CHIP".to_string(),
            },
            card: CardInfo {
                token: "tok_4242424242".to_string(),
                issuer_country: "US".to_string(),
                card_brand: "VISA".to_string(),
            },
            device: DeviceInfo {
                ip: "8.8.8.8".to_string(),
                fingerprint: "fp_abc123".to_string(),
                user_agent: "Mozilla/5.0".to_string(),
            },
            customer: CustomerInfo {
                id: "CUST_001".to_string(),
                risk_score: 25.0,
                account_age_days: 365,
            },
        }
    }

    #[test]
    fn test_valid_request() {
        assert!(sample_request().validate().is_ok());
    }

    #[test]
    fn test_amount_bounds() {
        let mut req = sample_request();
        req.transaction.amount = 0.0;
        assert!(matches!(
            req.transaction.validate(),
            Err(RequestError::OutOfRange { field: "transaction.amount", .. })
        ));

        req.transaction.amount = 1_000_001.0;
        assert!(req.transaction.validate().is_err());
    }

    #[test]
    fn test_invalid_ip_rejected() {
        let mut req = sample_request();
        req.device.ip = "999.1.2.3".to_string();
        assert!(matches!(
            req.validate(),
            Err(RequestError::InvalidField { field: "device.ip", .. })
        ));

        req.device.ip = "2001:db8::1".to_string();
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_missing_customer_id() {
        let mut req = sample_request();
        req.customer.id = String::new();
        assert_eq!(
            req.validate(),
            Err(RequestError::MissingField("customer.id"))
        );
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let mut req = sample_request();
        req.timestamp = Utc::now().timestamp_millis() as u64 + 2 * 3_600_000;
        assert!(matches!(
            req.validate(),
            Err(RequestError::OutOfRange { field: "timestamp", .. })
        ));
    }

    #[test]
    fn test_cache_key_window() {
        let mut req = sample_request();
        req.timestamp = 1_700_000_000_000;
        let key = req.cache_key();
        assert_eq!(key, "features:CUST_001:MERCH_001:5666666");

        // Same five-minute bucket produces the same key
        req.timestamp += 50_000;
        assert_eq!(req.cache_key(), key);

        req.timestamp += 300_000;
        assert_ne!(req.cache_key(), key);
    }

    #[test]
    fn test_request_roundtrip() {
        let req = sample_request();
        let json = serde_json::to_string(&req).unwrap();
        let parsed: TransactionRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.request_id, req.request_id);
        assert_eq!(parsed.transaction.amount, req.transaction.amount);
        assert_eq!(parsed.device.ip, req.device.ip);
    }
}
