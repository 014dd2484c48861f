/*
[INPUT]:  Signed private REST calls
[OUTPUT]: Session tokens, balances, order acks and order queries
[POS]:    HTTP layer - private endpoints (nonce + signature)
[UPDATE]: When adding private endpoints or changing their params
*/

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::debug;

use crate::auth::{TokenGrant, TokenSource};
use crate::gateway::{BalanceSource, OrderGateway};
use crate::http::{ExchangeClient, Result};
use crate::types::{
    AmendAck, AmendRequest, BalanceEntry, CancelAck, ExecutionReport, OrderAck, OrderIntent,
    OrderRef, SourceTag, WsTokenResult, normalize_balances, parse_order_query,
};

impl ExchangeClient {
    /// POST /0/private/GetWebSocketsToken
    pub async fn get_websockets_token(&self) -> Result<WsTokenResult> {
        self.private_post("GetWebSocketsToken", Value::Null).await
    }

    /// POST /0/private/BalanceEx
    pub async fn balance_ex(&self) -> Result<Vec<BalanceEntry>> {
        let result: Value = self.private_post("BalanceEx", Value::Null).await?;
        let entries = normalize_balances(&result, SourceTag::Pull, Utc::now());
        debug!(assets = entries.len(), "pulled balances");
        Ok(entries)
    }

    /// POST /0/private/AddOrder
    pub async fn rest_add_order(&self, intent: &OrderIntent) -> Result<OrderAck> {
        self.private_post("AddOrder", intent.to_params()).await
    }

    /// POST /0/private/CancelOrder
    pub async fn rest_cancel_order(&self, target: &OrderRef) -> Result<CancelAck> {
        self.private_post("CancelOrder", Value::Object(target.to_params()))
            .await
    }

    /// POST /0/private/AmendOrder
    pub async fn rest_amend_order(
        &self,
        target: &OrderRef,
        amend: &AmendRequest,
    ) -> Result<AmendAck> {
        self.private_post("AmendOrder", amend.to_params(target)).await
    }

    /// POST /0/private/QueryOrders
    pub async fn rest_query_orders(&self, cl_ord_ids: &[String]) -> Result<Vec<ExecutionReport>> {
        let result: Value = self
            .private_post("QueryOrders", json!({ "cl_ord_ids": cl_ord_ids }))
            .await?;
        parse_order_query(result)
    }
}

#[async_trait]
impl TokenSource for ExchangeClient {
    async fn fetch_token(&self) -> Result<TokenGrant> {
        let result = self.get_websockets_token().await?;
        Ok(TokenGrant {
            token: result.token,
            lifetime: Duration::from_secs(result.expires),
        })
    }
}

#[async_trait]
impl BalanceSource for ExchangeClient {
    async fn fetch_balances(&self) -> Result<Vec<BalanceEntry>> {
        self.balance_ex().await
    }
}

#[async_trait]
impl OrderGateway for ExchangeClient {
    fn name(&self) -> &'static str {
        "rest"
    }

    async fn add_order(&self, intent: &OrderIntent) -> Result<OrderAck> {
        self.rest_add_order(intent).await
    }

    async fn cancel_order(&self, target: &OrderRef) -> Result<CancelAck> {
        self.rest_cancel_order(target).await
    }

    async fn amend_order(&self, target: &OrderRef, amend: &AmendRequest) -> Result<AmendAck> {
        self.rest_amend_order(target, amend).await
    }

    async fn query_orders(&self, cl_ord_ids: &[String]) -> Result<Vec<ExecutionReport>> {
        self.rest_query_orders(cl_ord_ids).await
    }
}
