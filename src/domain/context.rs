use super::request::TransactionRequest;

/// The named-variable environment supplied to rule expressions for one
/// request.
///
/// Constructed per decision from the parsed request plus derived fields;
/// its lifetime is bounded by that single evaluation. The derived fields
/// default to neutral values and are overwritten by the orchestrator when
/// the corresponding signal is available (currently only
/// `ip_blacklist_match`; the velocity fields await the feature store).
#[derive(Debug, Clone)]
pub struct RuleContext {
    // Transaction fields
    pub amount: f64,
    pub currency: String,
    pub merchant_id: String,
    pub merchant_category: f64,
    pub pos_entry_mode: String,

    // Card fields
    pub card_token: String,
    pub issuer_country: String,
    pub card_brand: String,

    // Device fields
    pub ip_address: String,
    pub device_fingerprint: String,
    pub user_agent: String,

    // Customer fields
    pub customer_id: String,
    pub customer_risk_score: f64,
    pub account_age_days: f64,

    // Derived fields
    pub merchant_risk: f64,
    pub hourly_count: f64,
    pub amount_sum: f64,
    /// 1.0 when the pattern matcher reported a blacklist hit on the
    /// device ip, else 0.0.
    pub ip_blacklist_match: f64,
}

impl RuleContext {
    /// Build a context from a request, seeding derived fields with their
    /// neutral defaults.
    pub fn from_request(request: &TransactionRequest) -> Self {
        RuleContext {
            amount: request.transaction.amount,
            currency: request.transaction.currency.clone(),
            merchant_id: request.transaction.merchant_id.clone(),
            merchant_category: f64::from(request.transaction.merchant_category),
            pos_entry_mode: request.transaction.pos_entry_mode.clone(),
            card_token: request.card.token.clone(),
            issuer_country: request.card.issuer_country.clone(),
            card_brand: request.card.card_brand.clone(),
            ip_address: request.device.ip.clone(),
            device_fingerprint: request.device.fingerprint.clone(),
            user_agent: request.device.user_agent.clone(),
            customer_id: request.customer.id.clone(),
            customer_risk_score: request.customer.risk_score,
            account_age_days: f64::from(request.customer.account_age_days),
            merchant_risk: 0.0,
            hourly_count: 1.0,
            amount_sum: request.transaction.amount,
            ip_blacklist_match: 0.0,
        }
    }

    /// A context is evaluable only with the identifying fields present
    /// and a positive amount.
    pub fn is_valid(&self) -> bool {
        !self.customer_id.is_empty()
            && !self.merchant_id.is_empty()
            && !self.currency.is_empty()
            && self.amount > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::request::tests::sample_request;

    #[test]
    fn test_context_from_request() {
        let req = sample_request();
        let ctx = RuleContext::from_request(&req);

        assert_eq!(ctx.amount, 100.0);
        assert_eq!(ctx.currency, "USD");
        assert_eq!(ctx.merchant_category, 5411.0);
        assert_eq!(ctx.customer_risk_score, 25.0);

        // Derived defaults
        assert_eq!(ctx.merchant_risk, 0.0);
        assert_eq!(ctx.hourly_count, 1.0);
        assert_eq!(ctx.amount_sum, ctx.amount);
        assert_eq!(ctx.ip_blacklist_match, 0.0);

        assert!(ctx.is_valid());
    }

    #[test]
    fn test_context_validity() {
        let req = sample_request();
        let mut ctx = RuleContext::from_request(&req);
        assert!(ctx.is_valid());

        ctx.customer_id.clear();
        assert!(!ctx.is_valid());

        let mut ctx = RuleContext::from_request(&req);
        ctx.amount = 0.0;
        assert!(!ctx.is_valid());
    }
}
