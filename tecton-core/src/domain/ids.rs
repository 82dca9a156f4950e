use super::month::month_from_code;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Root symbol of a futures market (e.g. `CL`, `ES`, `6E`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarketId(pub String);

impl MarketId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MarketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MarketId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Exchange-style contract code: market root + month code + two-digit year (`CLZ23`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContractId(pub String);

impl ContractId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if this code is the market root followed by a month code and a
    /// two- or four-digit year.
    pub fn belongs_to(&self, market: &MarketId) -> bool {
        let Some(rest) = self.0.strip_prefix(market.as_str()) else {
            return false;
        };
        let mut chars = rest.chars();
        let coded = chars.next().is_some_and(|c| month_from_code(c).is_some());
        let year = chars.as_str();
        coded && matches!(year.len(), 2 | 4) && year.bytes().all(|b| b.is_ascii_digit())
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContractId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Exchange calendar identifier (e.g. `CME`, `ICE`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalendarId(pub String);

impl CalendarId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for CalendarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
