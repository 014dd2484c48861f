/*
[INPUT]:  Order intents, cancel/amend targets, balance reads
[OUTPUT]: Transport-neutral traits implemented by REST and WebSocket clients
[POS]:    Seam between the domain layer and concrete transports
[UPDATE]: When adding order operations or balance sources
*/

use async_trait::async_trait;

use crate::http::{ExchangeError, Result};
use crate::types::{
    AmendAck, AmendRequest, BalanceEntry, CancelAck, ExecutionReport, OrderAck, OrderIntent,
    OrderRef,
};

/// Pull-style balance reads.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn fetch_balances(&self) -> Result<Vec<BalanceEntry>>;
}

/// Order operations over one transport.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Short transport label used in logs ("ws", "rest").
    fn name(&self) -> &'static str;

    async fn add_order(&self, intent: &OrderIntent) -> Result<OrderAck>;

    async fn cancel_order(&self, target: &OrderRef) -> Result<CancelAck>;

    async fn amend_order(&self, target: &OrderRef, amend: &AmendRequest) -> Result<AmendAck>;

    /// Cancel several orders in one message.
    async fn batch_cancel(&self, _targets: &[OrderRef]) -> Result<CancelAck> {
        Err(ExchangeError::Unsupported("batch_cancel"))
    }

    /// Look up orders by client id.
    async fn query_orders(&self, _cl_ord_ids: &[String]) -> Result<Vec<ExecutionReport>> {
        Err(ExchangeError::Unsupported("query_orders"))
    }
}
