/*
[INPUT]:  Exchange errors and local order/routing outcomes
[OUTPUT]: CoreError surfaced to strategy-layer callers
[POS]:    Error layer - domain errors for router and order manager
[UPDATE]: When adding caller-visible failure modes
*/

use exlink_adapter::ExchangeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// No source (push, pull or cache) has usable data.
    #[error("no usable balance data for {asset}")]
    Unavailable { asset: String },

    #[error("unknown order: {cl_ord_id}")]
    UnknownOrder { cl_ord_id: String },

    /// The order has no exchange id yet; retry after a short delay.
    #[error("order {cl_ord_id} not acknowledged yet")]
    NotAcknowledged { cl_ord_id: String },

    /// Definitive rejection. `reason` is the raw exchange text.
    #[error("order {cl_ord_id} rejected: {reason}")]
    OrderRejected { cl_ord_id: String, reason: String },

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("{component} circuit open, retry in {remaining_secs}s")]
    CircuitOpen {
        component: &'static str,
        remaining_secs: u64,
    },

    /// Both transports failed without a definitive answer. The order stays
    /// pending until a report or reconciliation resolves it.
    #[error("submission of {cl_ord_id} uncertain: {reason}")]
    SubmissionUncertain { cl_ord_id: String, reason: String },

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

impl CoreError {
    /// Raw rejection text for exchange-side order failures.
    pub fn rejection_reason(err: &ExchangeError) -> String {
        match err {
            ExchangeError::OrderRejected { reason } => reason.clone(),
            ExchangeError::Api { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, CoreError::Unavailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
