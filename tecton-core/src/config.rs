//! Declarative market configuration.
//!
//! Calendars and markets are described in one TOML file:
//!
//! ```toml
//! [calendars.CME]
//! default_roll_offset = 3
//! holidays = ["2023-11-23", "2023-12-25"]
//!
//! [markets.CL]
//! name = "Crude Oil"
//! asset_class = "Commodity"
//! sector = "Energy"
//! cycle = "FGHJKMNQUVXZ"
//! calendar = "CME"
//! tick_size = 0.01
//! multiplier = 1000.0
//! inception = "2010-06-01"
//! roll_offset = 3
//! expiry = { rule = "business_days_before", day = 25, business_days = 3, months_before = 1 }
//! currency = [{ currency = "USD", effective_from = "1983-03-30" }]
//!
//! [markets.CL.expiry_overrides]
//! CLZ23 = "2023-11-17"
//! ```

use crate::domain::{
    CalendarId, ContractCycle, ContractId, CurrencyPeriod, ExchangeCalendar, ExpiryRule, MarketDefinition,
    MarketId, MultiplierChange,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketsConfig {
    #[serde(default)]
    pub calendars: BTreeMap<String, CalendarConfig>,
    #[serde(default)]
    pub markets: BTreeMap<String, MarketConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    pub default_roll_offset: u32,
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    pub name: String,
    pub asset_class: String,
    pub sector: String,
    #[serde(default)]
    pub sub_sector: String,
    pub cycle: ContractCycle,
    pub calendar: String,
    pub tick_size: f64,
    /// Constant multiplier, in force from inception.
    #[serde(default)]
    pub multiplier: Option<f64>,
    /// Dated multiplier history; exclusive with `multiplier`.
    #[serde(default)]
    pub multipliers: Vec<MultiplierChange>,
    pub inception: NaiveDate,
    #[serde(default)]
    pub roll_offset: Option<u32>,
    pub expiry: ExpiryRule,
    pub currency: Vec<CurrencyPeriod>,
    #[serde(default)]
    pub expiry_overrides: BTreeMap<String, NaiveDate>,
}

impl MarketsConfig {
    /// Load a markets config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse a markets config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    pub fn calendars(&self) -> Vec<ExchangeCalendar> {
        self.calendars
            .iter()
            .map(|(id, c)| {
                ExchangeCalendar::new(CalendarId::new(id.as_str()), c.holidays.iter().copied(), c.default_roll_offset)
            })
            .collect()
    }

    pub fn definitions(&self) -> Result<Vec<MarketDefinition>, ConfigError> {
        self.markets
            .iter()
            .map(|(id, m)| m.to_definition(MarketId::from(id.as_str())))
            .collect()
    }
}

impl MarketConfig {
    pub fn to_definition(&self, id: MarketId) -> Result<MarketDefinition, ConfigError> {
        let multipliers = match (self.multiplier, self.multipliers.is_empty()) {
            (Some(multiplier), true) => vec![MultiplierChange {
                multiplier,
                effective_from: self.inception,
            }],
            (None, false) => self.multipliers.clone(),
            (Some(_), false) => return Err(ConfigError::AmbiguousMultiplier { market: id }),
            (None, true) => return Err(ConfigError::MissingMultiplier { market: id }),
        };
        Ok(MarketDefinition {
            name: self.name.clone(),
            asset_class: self.asset_class.clone(),
            sector: self.sector.clone(),
            sub_sector: self.sub_sector.clone(),
            cycle: self.cycle.clone(),
            calendar: CalendarId::new(self.calendar.as_str()),
            tick_size: self.tick_size,
            multipliers,
            currencies: self.currency.clone(),
            expiry_rule: self.expiry,
            expiry_overrides: self
                .expiry_overrides
                .iter()
                .map(|(code, date)| (ContractId::from(code.as_str()), *date))
                .collect(),
            roll_offset: self.roll_offset,
            inception: self.inception,
            id,
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse markets TOML: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("market {market}: give either `multiplier` or `multipliers`, not both")]
    AmbiguousMultiplier { market: MarketId },

    #[error("market {market}: no multiplier given")]
    MissingMultiplier { market: MarketId },
}
