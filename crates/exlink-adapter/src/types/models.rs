/*
[INPUT]:  Raw balance payloads from REST and WebSocket (several shapes)
[OUTPUT]: Canonical BalanceEntry values
[POS]:    Data layer - ingestion-boundary normalization
[UPDATE]: When a source introduces a new balance payload shape
*/

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use super::enums::SourceTag;

/// One asset's balance, normalized from any source shape.
///
/// `available == total - reserved` and every amount is non-negative when the
/// entry is built through [`BalanceEntry::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub asset: String,
    pub total: Decimal,
    pub reserved: Decimal,
    pub available: Decimal,
    pub updated_at: DateTime<Utc>,
    pub source: SourceTag,
}

impl BalanceEntry {
    /// Build an entry, clamping `reserved` into `[0, total]`.
    ///
    /// Returns `None` for a negative total.
    pub fn new(
        asset: impl Into<String>,
        total: Decimal,
        reserved: Decimal,
        updated_at: DateTime<Utc>,
        source: SourceTag,
    ) -> Option<Self> {
        let asset = asset.into();
        if total.is_sign_negative() && !total.is_zero() {
            warn!(asset = %asset, total = %total, "dropping balance with negative total");
            return None;
        }
        let clamped = reserved.max(Decimal::ZERO).min(total);
        if clamped != reserved {
            warn!(
                asset = %asset,
                total = %total,
                reserved = %reserved,
                "reserved outside [0, total], clamping"
            );
        }
        let reserved = clamped;
        Some(Self {
            asset,
            total,
            reserved,
            available: total - reserved,
            updated_at,
            source,
        })
    }

    /// Same values re-tagged with another source.
    pub fn with_source(&self, source: SourceTag) -> Self {
        Self {
            source,
            ..self.clone()
        }
    }
}

/// Normalize any supported balance payload into canonical entries.
///
/// Supported shapes:
/// - `{"USDT": "100.5", "XBT": 0.1}` (plain totals)
/// - `{"USDT": {"balance": "100", "hold_trade": "5"}}` or `{"free", "used", "total"}` per asset
/// - `{"free": {..}, "used": {..}, "total": {..}}` (per-field maps)
/// - `[{"asset": "USDT", "total": "100", "reserved": "5"}, ..]`
///
/// Entries that cannot be parsed are skipped with a warning.
pub fn normalize_balances(
    payload: &Value,
    source: SourceTag,
    now: DateTime<Utc>,
) -> Vec<BalanceEntry> {
    match payload {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let fields = item.as_object()?;
                let asset = fields.get("asset").and_then(Value::as_str)?;
                entry_from_fields(asset, fields, source, now)
            })
            .collect(),
        Value::Object(map) if is_per_field_map(map) => per_field_entries(map, source, now),
        Value::Object(map) => map
            .iter()
            .filter_map(|(asset, value)| match value {
                Value::Object(fields) => entry_from_fields(asset, fields, source, now),
                scalar => {
                    let total = decimal_from_value(scalar)?;
                    BalanceEntry::new(normalize_asset(asset), total, Decimal::ZERO, now, source)
                }
            })
            .collect(),
        other => {
            warn!(kind = value_kind(other), "unsupported balance payload shape");
            Vec::new()
        }
    }
}

fn entry_from_fields(
    asset: &str,
    fields: &Map<String, Value>,
    source: SourceTag,
    now: DateTime<Utc>,
) -> Option<BalanceEntry> {
    let field = |name: &str| fields.get(name).and_then(decimal_from_value);

    let free = field("free");
    let reserved = field("reserved")
        .or_else(|| field("used"))
        .or_else(|| field("hold_trade"))
        .or_else(|| field("hold"));
    let total = field("total")
        .or_else(|| field("balance"))
        .or_else(|| match (free, reserved) {
            (Some(free), Some(reserved)) => Some(free + reserved),
            (Some(free), None) => Some(free),
            _ => None,
        });

    let Some(total) = total else {
        warn!(asset, "balance entry without a total, skipping");
        return None;
    };

    let reserved = reserved
        .or_else(|| free.map(|free| total - free))
        .unwrap_or(Decimal::ZERO);

    BalanceEntry::new(normalize_asset(asset), total, reserved, now, source)
}

fn is_per_field_map(map: &Map<String, Value>) -> bool {
    matches!(map.get("total"), Some(Value::Object(_)))
        && (map.contains_key("free") || map.contains_key("used"))
}

fn per_field_entries(
    map: &Map<String, Value>,
    source: SourceTag,
    now: DateTime<Utc>,
) -> Vec<BalanceEntry> {
    let Some(Value::Object(totals)) = map.get("total") else {
        return Vec::new();
    };
    let lookup = |section: &str, asset: &str| {
        map.get(section)
            .and_then(Value::as_object)
            .and_then(|values| values.get(asset))
            .and_then(decimal_from_value)
    };

    totals
        .iter()
        .filter_map(|(asset, total)| {
            let total = decimal_from_value(total)?;
            let reserved = lookup("used", asset)
                .or_else(|| lookup("free", asset).map(|free| total - free))
                .unwrap_or(Decimal::ZERO);
            BalanceEntry::new(normalize_asset(asset), total, reserved, now, source)
        })
        .collect()
}

/// Parse a decimal from a JSON string or number.
pub fn decimal_from_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => parse_decimal_str(s),
        Value::Number(n) => parse_decimal_str(&n.to_string()),
        _ => None,
    }
}

fn parse_decimal_str(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

fn normalize_asset(asset: &str) -> String {
    asset.trim().to_ascii_uppercase()
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use tracing_test::traced_test;

    fn decimal(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn find<'a>(entries: &'a [BalanceEntry], asset: &str) -> &'a BalanceEntry {
        entries
            .iter()
            .find(|entry| entry.asset == asset)
            .expect("asset present")
    }

    #[test]
    fn plain_map_of_strings_and_numbers() {
        let now = Utc::now();
        let entries = normalize_balances(
            &json!({"ZUSD": "100.25", "xbt": 0.5}),
            SourceTag::Pull,
            now,
        );

        assert_eq!(entries.len(), 2);
        let usd = find(&entries, "ZUSD");
        assert_eq!(usd.total, decimal("100.25"));
        assert_eq!(usd.available, decimal("100.25"));
        assert_eq!(find(&entries, "XBT").total, decimal("0.5"));
    }

    #[test]
    fn nested_balance_and_hold() {
        let entries = normalize_balances(
            &json!({"USDT": {"balance": "100", "hold_trade": "25"}}),
            SourceTag::Pull,
            Utc::now(),
        );

        let usdt = find(&entries, "USDT");
        assert_eq!(usdt.total, decimal("100"));
        assert_eq!(usdt.reserved, decimal("25"));
        assert_eq!(usdt.available, decimal("75"));
    }

    #[test]
    fn nested_free_used_without_total() {
        let entries = normalize_balances(
            &json!({"USDC": {"free": "40", "used": "10"}}),
            SourceTag::Pull,
            Utc::now(),
        );

        let usdc = find(&entries, "USDC");
        assert_eq!(usdc.total, decimal("50"));
        assert_eq!(usdc.reserved, decimal("10"));
        assert_eq!(usdc.available, decimal("40"));
    }

    #[test]
    fn per_field_maps() {
        let entries = normalize_balances(
            &json!({
                "free": {"USDT": "90"},
                "used": {"USDT": "10"},
                "total": {"USDT": "100"}
            }),
            SourceTag::Pull,
            Utc::now(),
        );

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reserved, decimal("10"));
    }

    #[test]
    fn array_of_push_updates() {
        let entries = normalize_balances(
            &json!([
                {"asset": "USDT", "total": "100", "reserved": "5"},
                {"asset": "ETH", "balance": 2},
                {"no_asset": true}
            ]),
            SourceTag::Push,
            Utc::now(),
        );

        assert_eq!(entries.len(), 2);
        assert_eq!(find(&entries, "USDT").available, decimal("95"));
        assert_eq!(find(&entries, "ETH").source, SourceTag::Push);
    }

    #[test]
    fn reserved_is_clamped_and_negative_total_dropped() {
        let entries = normalize_balances(
            &json!({
                "USDT": {"total": "10", "reserved": "15"},
                "BAD": {"total": "-1"}
            }),
            SourceTag::Pull,
            Utc::now(),
        );

        assert_eq!(entries.len(), 1);
        let usdt = find(&entries, "USDT");
        assert_eq!(usdt.reserved, decimal("10"));
        assert_eq!(usdt.available, Decimal::ZERO);
    }

    #[test]
    #[traced_test]
    fn clamping_reserved_is_logged() {
        let entry = BalanceEntry::new(
            "USDT",
            decimal("10"),
            decimal("15"),
            Utc::now(),
            SourceTag::Push,
        )
        .expect("non-negative total");

        assert_eq!(entry.available, Decimal::ZERO);
        assert!(logs_contain("clamping"));
    }

    #[test]
    fn invariant_holds_for_every_normalized_entry() {
        let entries = normalize_balances(
            &json!({
                "A": "1.5",
                "B": {"free": "3", "total": "4"},
                "C": {"balance": "7.25", "hold": "0.25"}
            }),
            SourceTag::Pull,
            Utc::now(),
        );

        for entry in &entries {
            assert_eq!(entry.available, entry.total - entry.reserved);
            assert!(entry.total >= Decimal::ZERO);
            assert!(entry.reserved >= Decimal::ZERO);
            assert!(entry.available >= Decimal::ZERO);
        }
        assert_eq!(find(&entries, "B").reserved, decimal("1"));
    }
}
