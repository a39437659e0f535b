pub mod context;
pub mod decision;
pub mod request;
pub mod response;

pub use context::RuleContext;
pub use decision::{Decision, Thresholds};
pub use request::{
    CardInfo, CustomerInfo, DeviceInfo, RequestError, TransactionInfo, TransactionRequest,
};
pub use response::DecisionResponse;
