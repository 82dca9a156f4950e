//! Calendar months and futures delivery-month codes.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A calendar month. Orders chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Result<Self, MonthError> {
        if !(1..=12).contains(&month) {
            return Err(MonthError::InvalidMonth(month));
        }
        Ok(Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn last_day(&self) -> NaiveDate {
        self.succ()
            .first_day()
            .pred_opt()
            .unwrap_or(NaiveDate::MAX)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }

    pub fn succ(&self) -> Self {
        if self.month == 12 {
            Self { year: self.year + 1, month: 1 }
        } else {
            Self { year: self.year, month: self.month + 1 }
        }
    }

    pub fn pred(&self) -> Self {
        if self.month == 1 {
            Self { year: self.year - 1, month: 12 }
        } else {
            Self { year: self.year, month: self.month - 1 }
        }
    }

    /// Shift back by `n` months.
    pub fn months_before(&self, n: u32) -> Self {
        let total = self.year * 12 + (self.month as i32 - 1) - n as i32;
        Self {
            year: total.div_euclid(12),
            month: total.rem_euclid(12) as u32 + 1,
        }
    }

    /// Every month from `self` through `end`, inclusive. Empty if `end < self`.
    pub fn through(self, end: YearMonth) -> impl Iterator<Item = YearMonth> {
        std::iter::successors(Some(self), |m| Some(m.succ())).take_while(move |m| *m <= end)
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = MonthError;

    /// Parses `YYYY-MM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (y, m) = s
            .split_once('-')
            .ok_or_else(|| MonthError::Unparseable(s.to_string()))?;
        let year = y
            .parse::<i32>()
            .map_err(|_| MonthError::Unparseable(s.to_string()))?;
        let month = m
            .parse::<u32>()
            .map_err(|_| MonthError::Unparseable(s.to_string()))?;
        Self::new(year, month)
    }
}

/// Delivery-month letter for a month number (1 = `F` ... 12 = `Z`).
pub fn month_code(month: u32) -> Option<char> {
    Some(match month {
        1 => 'F',
        2 => 'G',
        3 => 'H',
        4 => 'J',
        5 => 'K',
        6 => 'M',
        7 => 'N',
        8 => 'Q',
        9 => 'U',
        10 => 'V',
        11 => 'X',
        12 => 'Z',
        _ => return None,
    })
}

pub fn month_from_code(code: char) -> Option<u32> {
    Some(match code {
        'F' => 1,
        'G' => 2,
        'H' => 3,
        'J' => 4,
        'K' => 5,
        'M' => 6,
        'N' => 7,
        'Q' => 8,
        'U' => 9,
        'V' => 10,
        'X' => 11,
        'Z' => 12,
        _ => return None,
    })
}

/// Which delivery months a market lists, e.g. `HMUZ` for quarterly index futures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContractCycle {
    months: Vec<u32>,
}

impl ContractCycle {
    pub fn months(&self) -> &[u32] {
        &self.months
    }

    pub fn contains(&self, month: u32) -> bool {
        self.months.contains(&month)
    }

    pub fn monthly() -> Self {
        Self {
            months: (1..=12).collect(),
        }
    }

    pub fn quarterly() -> Self {
        Self {
            months: vec![3, 6, 9, 12],
        }
    }
}

impl FromStr for ContractCycle {
    type Err = MonthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut months = s
            .chars()
            .map(|c| month_from_code(c.to_ascii_uppercase()).ok_or(MonthError::InvalidCode(c)))
            .collect::<Result<Vec<_>, _>>()?;
        if months.is_empty() {
            return Err(MonthError::EmptyCycle);
        }
        months.sort_unstable();
        months.dedup();
        Ok(Self { months })
    }
}

impl TryFrom<String> for ContractCycle {
    type Error = MonthError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContractCycle> for String {
    fn from(cycle: ContractCycle) -> Self {
        cycle.months.iter().filter_map(|m| month_code(*m)).collect()
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MonthError {
    #[error("month {0} is outside 1..=12")]
    InvalidMonth(u32),

    #[error("'{0}' is not a delivery-month code")]
    InvalidCode(char),

    #[error("contract cycle lists no months")]
    EmptyCycle,

    #[error("cannot parse year-month '{0}'")]
    Unparseable(String),
}
