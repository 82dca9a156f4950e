//! Table references and column projection for `select`.

use crate::error::MantleError;
use std::fmt;
use std::str::FromStr;
use tecton_core::domain::MarketId;

/// Which markets a table covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Market(MarketId),
    /// Every market of the universe version current when the query starts.
    Universe,
}

/// A queryable table: raw contract bars or a back-adjusted series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableRef {
    Discrete(Scope),
    Continuous(Scope),
}

pub const DISCRETE_COLUMNS: &[&str] = &[
    "date",
    "market",
    "contract",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "open_interest",
];

pub const CONTINUOUS_COLUMNS: &[&str] = &[
    "date",
    "market",
    "contract",
    "raw_close",
    "adjusted_open",
    "adjusted_high",
    "adjusted_low",
    "adjusted_close",
    "adjustment",
    "volume",
    "open_interest",
    "status",
    "fill_age",
];

impl TableRef {
    pub fn discrete(market: impl Into<MarketId>) -> Self {
        TableRef::Discrete(Scope::Market(market.into()))
    }

    pub fn continuous(market: impl Into<MarketId>) -> Self {
        TableRef::Continuous(Scope::Market(market.into()))
    }

    pub fn scope(&self) -> &Scope {
        match self {
            TableRef::Discrete(scope) | TableRef::Continuous(scope) => scope,
        }
    }

    /// Every column the table can produce, in output order.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            TableRef::Discrete(_) => DISCRETE_COLUMNS,
            TableRef::Continuous(_) => CONTINUOUS_COLUMNS,
        }
    }

    /// Resolve requested column names. An empty request selects every column.
    /// Duplicates are dropped; the request order is kept.
    pub fn project(&self, requested: &[&str]) -> Result<Vec<&'static str>, MantleError> {
        let available = self.columns();
        if requested.is_empty() {
            return Ok(available.to_vec());
        }
        let mut projection: Vec<&'static str> = Vec::with_capacity(requested.len());
        for name in requested {
            let column = available
                .iter()
                .copied()
                .find(|c| c == name)
                .ok_or_else(|| MantleError::UnknownColumn {
                    table: self.to_string(),
                    column: (*name).to_string(),
                })?;
            if !projection.contains(&column) {
                projection.push(column);
            }
        }
        Ok(projection)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Market(market) => write!(f, "{market}"),
            Scope::Universe => write!(f, "*"),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableRef::Discrete(scope) => write!(f, "discrete:{scope}"),
            TableRef::Continuous(scope) => write!(f, "continuous:{scope}"),
        }
    }
}

impl FromStr for TableRef {
    type Err = MantleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MantleError::InvalidTable(s.to_string());
        let (kind, target) = s.trim().split_once(':').ok_or_else(invalid)?;
        let target = target.trim();
        let scope = match target {
            "*" => Scope::Universe,
            "" => return Err(invalid()),
            id if id.chars().all(|c| c.is_ascii_alphanumeric()) => Scope::Market(MarketId::from(id)),
            _ => return Err(invalid()),
        };
        match kind.trim().to_ascii_lowercase().as_str() {
            "discrete" | "raw" => Ok(TableRef::Discrete(scope)),
            "continuous" => Ok(TableRef::Continuous(scope)),
            _ => Err(invalid()),
        }
    }
}
