//! Exchange trading calendars and business-day arithmetic.
//!
//! A calendar is weekends plus an explicit holiday list. It also carries the
//! default roll offset for markets that trade on it: how many business days
//! before expiry liquidity has typically moved to the next contract.

use super::ids::CalendarId;
use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeCalendar {
    pub id: CalendarId,
    pub holidays: BTreeSet<NaiveDate>,
    pub default_roll_offset: u32,
}

impl ExchangeCalendar {
    pub fn new(
        id: CalendarId,
        holidays: impl IntoIterator<Item = NaiveDate>,
        default_roll_offset: u32,
    ) -> Self {
        Self {
            id,
            holidays: holidays.into_iter().collect(),
            default_roll_offset,
        }
    }

    /// Weekdays that are not listed holidays.
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    /// First trading day strictly after `date`.
    pub fn next_trading_day(&self, date: NaiveDate) -> Option<NaiveDate> {
        let mut d = date.succ_opt()?;
        while !self.is_trading_day(d) {
            d = d.succ_opt()?;
        }
        Some(d)
    }

    /// Last trading day strictly before `date`.
    pub fn previous_trading_day(&self, date: NaiveDate) -> Option<NaiveDate> {
        let mut d = date.pred_opt()?;
        while !self.is_trading_day(d) {
            d = d.pred_opt()?;
        }
        Some(d)
    }

    /// Step back `n` trading days from `date` (exclusive). `n = 0` returns `date` unchanged.
    pub fn sub_business_days(&self, date: NaiveDate, n: u32) -> NaiveDate {
        let mut d = date;
        for _ in 0..n {
            match self.previous_trading_day(d) {
                Some(prev) => d = prev,
                None => break,
            }
        }
        d
    }

    /// The trading day on or before `date`.
    pub fn on_or_before(&self, date: NaiveDate) -> Option<NaiveDate> {
        if self.is_trading_day(date) {
            Some(date)
        } else {
            self.previous_trading_day(date)
        }
    }

    /// Trading days in `[start, end]`, ascending.
    pub fn trading_days(&self, start: NaiveDate, end: NaiveDate) -> TradingDays<'_> {
        TradingDays {
            calendar: self,
            next: self.on_or_after(start),
            end,
        }
    }

    /// The trading day on or after `date`.
    pub fn on_or_after(&self, date: NaiveDate) -> Option<NaiveDate> {
        if self.is_trading_day(date) {
            Some(date)
        } else {
            self.next_trading_day(date)
        }
    }

    /// Third Friday of the month, rolled back to a trading day if it is a holiday.
    pub fn third_friday(&self, year: i32, month: u32) -> Option<NaiveDate> {
        let friday = NaiveDate::from_weekday_of_month_opt(year, month, Weekday::Fri, 3)?;
        self.on_or_before(friday)
    }

    /// Last trading day of the month.
    pub fn last_business_day(&self, year: i32, month: u32) -> Option<NaiveDate> {
        let first_next = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)?
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)?
        };
        self.previous_trading_day(first_next)
    }
}

/// Lazy iterator over a calendar's trading days.
pub struct TradingDays<'a> {
    calendar: &'a ExchangeCalendar,
    next: Option<NaiveDate>,
    end: NaiveDate,
}

impl Iterator for TradingDays<'_> {
    type Item = NaiveDate;

    fn next(&mut self) -> Option<NaiveDate> {
        let current = self.next.filter(|d| *d <= self.end)?;
        self.next = self.calendar.next_trading_day(current);
        Some(current)
    }
}
