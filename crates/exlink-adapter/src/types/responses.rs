/*
[INPUT]:  REST envelopes and WebSocket method results
[OUTPUT]: Typed response structs and execution reports
[POS]:    Data layer - type definitions for API communication
[UPDATE]: When API schema changes or new types added
*/

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::enums::ReportedStatus;
use crate::http::{ExchangeError, Result};

/// REST envelope: `{"error": [..], "result": ..}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub error: Vec<String>,
    pub result: Option<T>,
}

impl<T> ApiEnvelope<T> {
    /// Classify the first error string, or unwrap the result.
    pub fn into_result(self) -> Result<T> {
        if let Some(first) = self.error.first() {
            return Err(ExchangeError::classify(first));
        }
        self.result
            .ok_or_else(|| ExchangeError::InvalidResponse("envelope without result".to_string()))
    }
}

/// `GetWebSocketsToken` result. `expires` is the lifetime in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsTokenResult {
    pub token: String,
    pub expires: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    #[serde(default)]
    pub cl_ord_id: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelAck {
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub cl_ord_id: Option<String>,
    #[serde(default)]
    pub count: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmendAck {
    #[serde(default)]
    pub amend_id: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub cl_ord_id: Option<String>,
}

/// Order progress as seen by the exchange.
///
/// Quantities are cumulative totals, not deltas. Produced by the executions
/// channel and by REST order queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub cl_ord_id: Option<String>,
    #[serde(default)]
    pub exec_id: Option<String>,
    #[serde(default)]
    pub exec_type: Option<String>,
    #[serde(alias = "status")]
    pub order_status: ReportedStatus,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub order_qty: Option<Decimal>,
    #[serde(default)]
    pub cum_qty: Option<Decimal>,
    #[serde(default)]
    pub avg_price: Option<Decimal>,
    #[serde(default, alias = "fee")]
    pub cum_fee: Option<Decimal>,
    #[serde(default)]
    pub last_qty: Option<Decimal>,
    #[serde(default)]
    pub last_price: Option<Decimal>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ExecutionReport {
    /// Minimal report carrying only identity and status.
    pub fn status_only(
        order_id: Option<String>,
        cl_ord_id: Option<String>,
        order_status: ReportedStatus,
    ) -> Self {
        Self {
            order_id,
            cl_ord_id,
            exec_id: None,
            exec_type: None,
            order_status,
            symbol: None,
            order_qty: None,
            cum_qty: None,
            avg_price: None,
            cum_fee: None,
            last_qty: None,
            last_price: None,
            reason: None,
            timestamp: None,
        }
    }

    /// True when this report describes a fill with its own exec id.
    pub fn is_fill(&self) -> bool {
        self.exec_id.is_some()
            && self
                .last_qty
                .map(|qty| qty > Decimal::ZERO)
                .unwrap_or(false)
    }
}

/// Parse the `data` array of an executions message.
///
/// Unparseable elements are skipped; the count of skipped items is returned
/// alongside so callers can log it.
pub fn parse_execution_reports(data: &Value) -> (Vec<ExecutionReport>, usize) {
    let items: Vec<&Value> = match data {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![data],
        _ => return (Vec::new(), 0),
    };

    let mut reports = Vec::with_capacity(items.len());
    let mut skipped = 0;
    for item in items {
        match serde_json::from_value::<ExecutionReport>(item.clone()) {
            Ok(report) => reports.push(report),
            Err(_) => skipped += 1,
        }
    }
    (reports, skipped)
}

/// `QueryOrders` result keyed by exchange order id.
pub fn parse_order_query(result: Value) -> Result<Vec<ExecutionReport>> {
    let Value::Object(orders) = result else {
        return Err(ExchangeError::InvalidResponse(
            "order query result is not an object".to_string(),
        ));
    };

    let mut reports = Vec::with_capacity(orders.len());
    for (order_id, body) in orders {
        let mut report: ExecutionReport = serde_json::from_value(body)?;
        if report.order_id.is_none() {
            report.order_id = Some(order_id);
        }
        reports.push(report);
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn envelope_error_is_classified() {
        let envelope: ApiEnvelope<Value> =
            serde_json::from_value(json!({"error": ["EAPI:Invalid nonce"]})).unwrap();
        assert!(matches!(
            envelope.into_result(),
            Err(ExchangeError::InvalidNonce)
        ));

        let envelope: ApiEnvelope<WsTokenResult> = serde_json::from_value(
            json!({"error": [], "result": {"token": "abc", "expires": 900}}),
        )
        .unwrap();
        assert_eq!(envelope.into_result().unwrap().expires, 900);
    }

    #[test]
    fn execution_reports_accept_numbers_and_strings() {
        let (reports, skipped) = parse_execution_reports(&json!([
            {
                "order_id": "O1",
                "cl_ord_id": "cl-1",
                "exec_id": "E1",
                "exec_type": "trade",
                "order_status": "partially_filled",
                "cum_qty": 0.4,
                "last_qty": "0.4",
                "avg_price": "100.5",
                "fee": 0.01
            },
            {"order_id": "O2"}
        ]));

        assert_eq!(skipped, 1);
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.order_status, ReportedStatus::PartiallyFilled);
        assert_eq!(report.cum_qty.unwrap().to_string(), "0.4");
        assert_eq!(report.cum_fee.unwrap().to_string(), "0.01");
        assert!(report.is_fill());
    }

    #[test]
    fn unknown_status_is_tolerated() {
        let (reports, _) =
            parse_execution_reports(&json!({"order_id": "O1", "order_status": "triggered"}));
        assert_eq!(reports[0].order_status, ReportedStatus::Unknown);
    }

    #[test]
    fn order_query_fills_order_id_from_key() {
        let reports = parse_order_query(json!({
            "OABC-1": {"cl_ord_id": "cl-1", "status": "closed", "cum_qty": "1"}
        }))
        .unwrap();

        assert_eq!(reports[0].order_id.as_deref(), Some("OABC-1"));
        assert_eq!(reports[0].order_status, ReportedStatus::Filled);
    }
}
