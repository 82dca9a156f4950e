//! Discrete futures contracts.

use super::ids::{ContractId, MarketId};
use super::month::YearMonth;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One listed contract of a market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub id: ContractId,
    pub market: MarketId,
    pub delivery: YearMonth,
    /// Last trading day.
    pub expiry: NaiveDate,
}

impl Contract {
    /// Chain ordering: earliest expiry first, then lowest delivery month.
    pub fn sort_key(&self) -> (NaiveDate, YearMonth) {
        (self.expiry, self.delivery)
    }
}

/// Per-contract facts that need a scan of stored data to learn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractMetadata {
    pub contract: ContractId,
    pub first_trade: NaiveDate,
    pub multiplier: f64,
}

/// One raw daily row for one contract, as stored in a partition.
///
/// `close` is the settlement price. `open_interest` was added to the storage
/// schema later and is `None` for partitions written before it existed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractBar {
    pub date: NaiveDate,
    pub contract: ContractId,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub open_interest: Option<u64>,
}

impl ContractBar {
    /// All prices finite and high/low bracketing open and close.
    pub fn is_sane(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        prices.iter().all(|p| p.is_finite())
            && self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bar() -> ContractBar {
        ContractBar {
            date: NaiveDate::from_ymd_opt(2023, 11, 14).unwrap(),
            contract: ContractId::from("CLZ23"),
            open: 77.0,
            high: 78.5,
            low: 76.2,
            close: 78.26,
            volume: 250_000,
            open_interest: Some(120_000),
        }
    }

    #[test]
    fn bar_is_sane() {
        assert!(sample_bar().is_sane());
    }

    #[test]
    fn bar_detects_inverted_range() {
        let mut bar = sample_bar();
        bar.high = 75.0;
        assert!(!bar.is_sane());
    }

    #[test]
    fn bar_detects_nan() {
        let mut bar = sample_bar();
        bar.close = f64::NAN;
        assert!(!bar.is_sane());
    }

    #[test]
    fn negative_prices_are_allowed() {
        // WTI settled below zero in April 2020
        let mut bar = sample_bar();
        bar.open = -10.0;
        bar.low = -40.32;
        bar.high = 1.0;
        bar.close = -37.63;
        assert!(bar.is_sane());
    }
}
