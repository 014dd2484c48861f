/*
[INPUT]:  Caller order intents and amend/cancel targets
[OUTPUT]: Typed request structs serialized as exchange method params
[POS]:    Data layer - request payloads shared by REST and WebSocket
[UPDATE]: When order parameters change
*/

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::enums::{OrderType, Side, TimeInForce};

/// Immutable order description supplied by the strategy layer.
///
/// `cl_ord_id` is the caller-chosen idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub cl_ord_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    #[serde(rename = "order_qty", with = "rust_decimal::serde::str")]
    pub qty: Decimal,
    #[serde(rename = "limit_price", with = "rust_decimal::serde::str_option")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(rename = "trigger_price", with = "rust_decimal::serde::str_option")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub time_in_force: TimeInForce,
}

impl OrderIntent {
    pub fn limit(
        cl_ord_id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        qty: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            cl_ord_id: cl_ord_id.into(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            qty,
            price: Some(price),
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
        }
    }

    pub fn market(
        cl_ord_id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        qty: Decimal,
    ) -> Self {
        Self {
            cl_ord_id: cl_ord_id.into(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            qty,
            price: None,
            stop_price: None,
            time_in_force: TimeInForce::Ioc,
        }
    }

    /// Local sanity checks run before anything is sent.
    pub fn validate(&self) -> Result<(), String> {
        if self.cl_ord_id.trim().is_empty() {
            return Err("client order id is empty".to_string());
        }
        if self.symbol.trim().is_empty() {
            return Err("symbol is empty".to_string());
        }
        if self.qty <= Decimal::ZERO {
            return Err(format!("quantity must be positive, got {}", self.qty));
        }
        if self.order_type.requires_price() && self.price.is_none() {
            return Err(format!("{:?} order requires a price", self.order_type));
        }
        if self.order_type.requires_stop_price() && self.stop_price.is_none() {
            return Err(format!("{:?} order requires a stop price", self.order_type));
        }
        if let Some(price) = self.price
            && price <= Decimal::ZERO
        {
            return Err(format!("price must be positive, got {price}"));
        }
        Ok(())
    }

    /// Method params for `add_order` / `AddOrder`.
    pub fn to_params(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

/// Target of a cancel or amend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OrderRef {
    Exchange(String),
    Client(String),
}

impl OrderRef {
    pub fn to_params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        match self {
            OrderRef::Exchange(id) => {
                params.insert("order_id".to_string(), Value::String(id.clone()));
            }
            OrderRef::Client(id) => {
                params.insert("cl_ord_id".to_string(), Value::String(id.clone()));
            }
        }
        params
    }
}

/// Fields to change on a resting order. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AmendRequest {
    #[serde(rename = "order_qty", with = "rust_decimal::serde::str_option")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qty: Option<Decimal>,
    #[serde(rename = "limit_price", with = "rust_decimal::serde::str_option")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(rename = "trigger_price", with = "rust_decimal::serde::str_option")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,
}

impl AmendRequest {
    pub fn is_empty(&self) -> bool {
        self.qty.is_none() && self.price.is_none() && self.stop_price.is_none()
    }

    /// Amend params merged with the order target.
    pub fn to_params(&self, target: &OrderRef) -> Value {
        let mut params = target.to_params();
        if let Ok(Value::Object(fields)) = serde_json::to_value(self) {
            params.extend(fields);
        }
        Value::Object(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    #[test]
    fn limit_intent_serializes_wire_names() {
        let intent = OrderIntent::limit("cl-1", "BTC/USD", Side::Buy, dec("0.5"), dec("65000.1"));
        let params = intent.to_params();

        assert_eq!(params["cl_ord_id"], "cl-1");
        assert_eq!(params["order_type"], "limit");
        assert_eq!(params["order_qty"], "0.5");
        assert_eq!(params["limit_price"], "65000.1");
        assert_eq!(params["time_in_force"], "gtc");
        assert!(params.get("trigger_price").is_none());
    }

    #[test]
    fn validate_rejects_missing_price_and_zero_qty() {
        let mut intent = OrderIntent::limit("cl-1", "BTC/USD", Side::Sell, dec("1"), dec("10"));
        intent.price = None;
        assert!(intent.validate().is_err());

        let zero = OrderIntent::market("cl-2", "BTC/USD", Side::Sell, dec("0"));
        assert!(zero.validate().is_err());

        let mut stop = OrderIntent::market("cl-3", "BTC/USD", Side::Sell, dec("1"));
        stop.order_type = OrderType::StopLoss;
        assert!(stop.validate().is_err());
        stop.stop_price = Some(dec("9"));
        assert!(stop.validate().is_ok());
    }

    #[test]
    fn amend_params_include_target() {
        let amend = AmendRequest {
            price: Some(dec("101.5")),
            ..Default::default()
        };
        let params = amend.to_params(&OrderRef::Client("cl-9".to_string()));

        assert_eq!(params["cl_ord_id"], "cl-9");
        assert_eq!(params["limit_price"], "101.5");
        assert!(params.get("order_qty").is_none());
        assert!(!amend.is_empty());
        assert!(AmendRequest::default().is_empty());
    }
}
