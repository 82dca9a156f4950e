//! Static description of one futures market.

use super::calendar::ExchangeCalendar;
use super::ids::{CalendarId, ContractId, MarketId};
use super::month::{month_code, month_from_code, ContractCycle, YearMonth};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Quote currency in force from `effective_from` onward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyPeriod {
    pub currency: String,
    pub effective_from: NaiveDate,
}

/// Point multiplier in force from `effective_from` onward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiplierChange {
    pub multiplier: f64,
    pub effective_from: NaiveDate,
}

/// How the last trading day of a contract follows from its delivery month.
///
/// Every rule first moves `months_before` months back from the delivery month,
/// then anchors inside that month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ExpiryRule {
    /// Third Friday (equity index, FX).
    ThirdFriday {
        #[serde(default)]
        months_before: u32,
    },
    /// `business_days` trading days before calendar day `day` (crude oil style).
    BusinessDaysBefore {
        day: u32,
        business_days: u32,
        #[serde(default)]
        months_before: u32,
    },
    /// Last trading day of the month.
    LastBusinessDay {
        #[serde(default)]
        months_before: u32,
    },
}

impl ExpiryRule {
    pub fn expiry(&self, delivery: YearMonth, calendar: &ExchangeCalendar) -> Option<NaiveDate> {
        match *self {
            ExpiryRule::ThirdFriday { months_before } => {
                let m = delivery.months_before(months_before);
                calendar.third_friday(m.year, m.month)
            }
            ExpiryRule::BusinessDaysBefore {
                day,
                business_days,
                months_before,
            } => {
                let m = delivery.months_before(months_before);
                let anchor = NaiveDate::from_ymd_opt(m.year, m.month, day)
                    .unwrap_or_else(|| m.last_day());
                Some(calendar.sub_business_days(anchor, business_days))
            }
            ExpiryRule::LastBusinessDay { months_before } => {
                let m = delivery.months_before(months_before);
                calendar.last_business_day(m.year, m.month)
            }
        }
    }
}

/// One tradeable futures market.
///
/// Immutable once registered. Quote currency and point multiplier can change
/// over a market's life; both are kept as dated sequences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDefinition {
    pub id: MarketId,
    pub name: String,
    pub asset_class: String,
    pub sector: String,
    pub sub_sector: String,
    pub cycle: ContractCycle,
    pub calendar: CalendarId,
    pub tick_size: f64,
    pub multipliers: Vec<MultiplierChange>,
    pub currencies: Vec<CurrencyPeriod>,
    pub expiry_rule: ExpiryRule,
    pub expiry_overrides: BTreeMap<ContractId, NaiveDate>,
    /// Business days before expiry to roll; `None` defers to the calendar default.
    pub roll_offset: Option<u32>,
    /// First date this market's history is published for.
    pub inception: NaiveDate,
}

impl MarketDefinition {
    /// Check internal consistency: positive tick size, non-empty and strictly
    /// increasing dated sequences, override codes belonging to this market.
    pub fn validate(&self) -> Result<(), MarketError> {
        if !(self.tick_size.is_finite() && self.tick_size > 0.0) {
            return Err(MarketError::InvalidTickSize {
                market: self.id.clone(),
                tick_size: self.tick_size,
            });
        }
        if self.currencies.is_empty() {
            return Err(MarketError::EmptyHistory {
                market: self.id.clone(),
                field: "currency",
            });
        }
        if self.multipliers.is_empty() {
            return Err(MarketError::EmptyHistory {
                market: self.id.clone(),
                field: "multiplier",
            });
        }
        if !self
            .currencies
            .windows(2)
            .all(|w| w[0].effective_from < w[1].effective_from)
        {
            return Err(MarketError::UnorderedHistory {
                market: self.id.clone(),
                field: "currency",
            });
        }
        if !self
            .multipliers
            .windows(2)
            .all(|w| w[0].effective_from < w[1].effective_from)
        {
            return Err(MarketError::UnorderedHistory {
                market: self.id.clone(),
                field: "multiplier",
            });
        }
        if let Some(bad) = self
            .multipliers
            .iter()
            .find(|m| m.multiplier.is_nan() || m.multiplier <= 0.0)
        {
            return Err(MarketError::InvalidMultiplier {
                market: self.id.clone(),
                multiplier: bad.multiplier,
            });
        }
        if let Some(code) = self.expiry_overrides.keys().find(|c| !c.belongs_to(&self.id)) {
            return Err(MarketError::ForeignContract {
                market: self.id.clone(),
                contract: code.clone(),
            });
        }
        Ok(())
    }

    /// Quote currency on `date`. Before the first entry, the first entry applies.
    pub fn currency_on(&self, date: NaiveDate) -> &str {
        self.currencies
            .iter()
            .rev()
            .find(|p| p.effective_from <= date)
            .or_else(|| self.currencies.first())
            .map(|p| p.currency.as_str())
            .unwrap_or_default()
    }

    /// Point multiplier on `date`. Before the first entry, the first entry applies.
    pub fn multiplier_on(&self, date: NaiveDate) -> f64 {
        self.multipliers
            .iter()
            .rev()
            .find(|m| m.effective_from <= date)
            .or_else(|| self.multipliers.first())
            .map(|m| m.multiplier)
            .unwrap_or(f64::NAN)
    }

    /// Roll offset in business days: the market's own, else the calendar default.
    pub fn roll_offset(&self, calendar: &ExchangeCalendar) -> u32 {
        self.roll_offset.unwrap_or(calendar.default_roll_offset)
    }

    /// Contract code for a delivery month: `CL` + `Z` + `23`.
    pub fn contract_id(&self, delivery: YearMonth) -> ContractId {
        let code = month_code(delivery.month).unwrap_or('?');
        ContractId(format!(
            "{}{}{:02}",
            self.id,
            code,
            delivery.year.rem_euclid(100)
        ))
    }

    /// Delivery month encoded in a contract code of this market.
    ///
    /// Two-digit years resolve to the century of the inception date, moved a
    /// century forward when that would land more than a decade before inception.
    pub fn delivery_of(&self, contract: &ContractId) -> Option<YearMonth> {
        if !contract.belongs_to(&self.id) {
            return None;
        }
        let rest = &contract.as_str()[self.id.as_str().len()..];
        let mut chars = rest.chars();
        let month = month_from_code(chars.next()?)?;
        let digits = chars.as_str();
        let year = match digits.len() {
            2 => {
                let yy: i32 = digits.parse().ok()?;
                let base = self.inception.year().div_euclid(100) * 100 + yy;
                if base < self.inception.year() - 10 {
                    base + 100
                } else {
                    base
                }
            }
            4 => digits.parse().ok()?,
            _ => return None,
        };
        YearMonth::new(year, month).ok()
    }

    /// Expiry of a delivery month: explicit override first, then the rule.
    pub fn expiry_of(&self, delivery: YearMonth, calendar: &ExchangeCalendar) -> Option<NaiveDate> {
        self.expiry_overrides
            .get(&self.contract_id(delivery))
            .copied()
            .or_else(|| self.expiry_rule.expiry(delivery, calendar))
    }

    /// Name of the first field that may never change after registration and differs.
    pub fn immutable_fields_differ(&self, other: &MarketDefinition) -> Option<&'static str> {
        if self.cycle != other.cycle {
            Some("cycle")
        } else if self.calendar != other.calendar {
            Some("calendar")
        } else if self.tick_size != other.tick_size {
            Some("tick_size")
        } else if self.multipliers != other.multipliers {
            Some("multiplier")
        } else if self.expiry_rule != other.expiry_rule {
            Some("expiry")
        } else if self.expiry_overrides != other.expiry_overrides {
            Some("expiry_overrides")
        } else if self.roll_offset != other.roll_offset {
            Some("roll_offset")
        } else if self.inception != other.inception {
            Some("inception")
        } else {
            None
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MarketError {
    #[error("market {market}: tick size {tick_size} must be positive")]
    InvalidTickSize { market: MarketId, tick_size: f64 },

    #[error("market {market}: multiplier {multiplier} must be positive")]
    InvalidMultiplier { market: MarketId, multiplier: f64 },

    #[error("market {market}: {field} history is empty")]
    EmptyHistory { market: MarketId, field: &'static str },

    #[error("market {market}: {field} history must be strictly increasing by effective date")]
    UnorderedHistory { market: MarketId, field: &'static str },

    #[error("market {market}: contract {contract} belongs to another market")]
    ForeignContract { market: MarketId, contract: ContractId },
}
