use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use exlink_adapter::{BalanceEntry, SourceTag};

/// Asset codes that count as one logical quote currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuoteAliases {
    /// Name reported on the aggregated entry.
    pub quote: String,
    pub codes: Vec<String>,
}

impl Default for QuoteAliases {
    fn default() -> Self {
        Self {
            quote: "USD".to_string(),
            codes: ["USD", "ZUSD", "USDT", "USDC"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl QuoteAliases {
    pub fn contains(&self, asset: &str) -> bool {
        self.codes
            .iter()
            .any(|code| code.eq_ignore_ascii_case(asset))
    }

    /// Sum every alias entry into one entry named `quote`.
    ///
    /// The result carries the oldest timestamp of its parts and that part's
    /// source. `None` when no alias is present.
    pub fn aggregate<'a>(
        &self,
        entries: impl IntoIterator<Item = &'a BalanceEntry>,
    ) -> Option<BalanceEntry> {
        let mut total = Decimal::ZERO;
        let mut reserved = Decimal::ZERO;
        let mut oldest: Option<(DateTime<Utc>, SourceTag)> = None;

        for entry in entries.into_iter().filter(|entry| self.contains(&entry.asset)) {
            total += entry.total;
            reserved += entry.reserved;
            match oldest {
                Some((at, _)) if at <= entry.updated_at => {}
                _ => oldest = Some((entry.updated_at, entry.source)),
            }
        }

        let (updated_at, source) = oldest?;
        BalanceEntry::new(self.quote.clone(), total, reserved, updated_at, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::str::FromStr;

    fn entry(asset: &str, total: &str, reserved: &str, age_secs: i64) -> BalanceEntry {
        BalanceEntry::new(
            asset,
            Decimal::from_str(total).unwrap(),
            Decimal::from_str(reserved).unwrap(),
            Utc::now() - Duration::seconds(age_secs),
            SourceTag::Push,
        )
        .unwrap()
    }

    #[test]
    fn sums_configured_codes_only() {
        let aliases = QuoteAliases::default();
        let entries = vec![
            entry("USDT", "100", "10", 5),
            entry("ZUSD", "50.5", "0", 1),
            entry("BTC", "1", "0", 1),
        ];

        let quote = aliases.aggregate(&entries).unwrap();
        assert_eq!(quote.asset, "USD");
        assert_eq!(quote.total, Decimal::from_str("150.5").unwrap());
        assert_eq!(quote.available, Decimal::from_str("140.5").unwrap());
        assert_eq!(quote.updated_at, entries[0].updated_at);
    }

    #[test]
    fn no_alias_present_yields_none() {
        let aliases = QuoteAliases::default();
        assert!(aliases.aggregate(&[entry("ETH", "2", "0", 0)]).is_none());
        assert!(aliases.contains("usdc"));
    }
}
