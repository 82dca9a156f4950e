//! Back-adjusted continuous series.
//!
//! A continuous series stitches a market's front contracts together. Every
//! roll leaves a price jump between the expiring and the incoming contract
//! (contango or backwardation); back-adjustment removes it by shifting all
//! bars before the roll.
//!
//! Adjustments are composed backward from the data horizon, the last date in
//! the market's latest readable partition. The segment active at the horizon
//! is raw.
//! Anchoring at the horizon instead of the query end makes any sub-range
//! build agree bit for bit with a full build over their overlap.

use crate::cancel::CancelToken;
use crate::domain::{
    ContractChain, ContractId, ExchangeCalendar, MarketDefinition, MarketId, TradingDays, YearMonth,
};
use crate::roll::{ExpiryOffsetRoll, RollEvent, RollPolicy, RollSchedule};
use crate::store::{PartitionKey, PartitionStore, StoreError};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// How roll gaps are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentMode {
    /// Shift earlier bars by `new - old`.
    #[default]
    Additive,
    /// Scale earlier bars by `new / old`.
    Ratio,
    /// Raw front-contract prices.
    None,
}

impl AdjustmentMode {
    fn identity(self) -> f64 {
        match self {
            AdjustmentMode::Ratio => 1.0,
            AdjustmentMode::Additive | AdjustmentMode::None => 0.0,
        }
    }

    /// Factor for one roll, `None` if the prices cannot produce one.
    fn factor(self, from_price: f64, to_price: f64) -> Option<f64> {
        match self {
            AdjustmentMode::Additive => Some(to_price - from_price),
            AdjustmentMode::Ratio if from_price > 0.0 && to_price > 0.0 => Some(to_price / from_price),
            AdjustmentMode::Ratio => None,
            AdjustmentMode::None => Some(self.identity()),
        }
    }

    fn compose(self, cumulative: f64, factor: f64) -> f64 {
        match self {
            AdjustmentMode::Additive => cumulative + factor,
            AdjustmentMode::Ratio => cumulative * factor,
            AdjustmentMode::None => cumulative,
        }
    }

    fn apply(self, price: f64, cumulative: f64) -> f64 {
        match self {
            AdjustmentMode::Additive => price + cumulative,
            AdjustmentMode::Ratio => price * cumulative,
            AdjustmentMode::None => price,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuousConfig {
    pub adjustment: AdjustmentMode,
    /// Trading days a contract's last price may be carried forward, and how
    /// far back a roll may look for a common price.
    pub max_forward_fill: u32,
}

impl Default for ContinuousConfig {
    fn default() -> Self {
        Self {
            adjustment: AdjustmentMode::Additive,
            max_forward_fill: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BarStatus {
    Observed,
    /// Carried from the same contract `age` trading days back.
    ForwardFilled { age: u32 },
    /// The market traded but no usable price exists.
    Missing,
}

/// One trading day of a continuous series.
///
/// Prices are `None` when the bar is missing. A forward-filled bar is flat
/// at the carried close and has no volume or open interest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousBar {
    pub date: NaiveDate,
    pub market: MarketId,
    /// Front contract on this date.
    pub contract: ContractId,
    /// Settlement of the front contract.
    pub raw_close: Option<f64>,
    pub adjusted_open: Option<f64>,
    pub adjusted_high: Option<f64>,
    pub adjusted_low: Option<f64>,
    pub adjusted_close: Option<f64>,
    /// Cumulative adjustment in force (offset or multiplier, per mode).
    pub adjustment: f64,
    pub volume: Option<u64>,
    pub open_interest: Option<u64>,
    pub status: BarStatus,
}

/// Prices and factor used for one roll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollRecord {
    pub date: NaiveDate,
    pub from: ContractId,
    pub to: ContractId,
    /// Day both prices were taken from: the roll date or up to
    /// `max_forward_fill` readable trading days earlier. Days in unreadable
    /// partitions are passed over without counting.
    pub price_date: Option<NaiveDate>,
    pub from_price: Option<f64>,
    pub to_price: Option<f64>,
    /// `None` when no common price was found.
    pub factor: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapReason {
    /// The chain has no contract for the date.
    NoActiveContract,
    /// A later roll could not be priced, so this date cannot be adjusted.
    RollPriceMissing {
        from: ContractId,
        to: ContractId,
        roll_date: NaiveDate,
    },
}

impl std::fmt::Display for GapReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GapReason::NoActiveContract => write!(f, "no active contract"),
            GapReason::RollPriceMissing {
                from,
                to,
                roll_date,
            } => write!(f, "no common price for roll {from} -> {to} on {roll_date}"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
#[error("data gap in {market} on {date}: {reason}")]
pub struct DataGapError {
    pub market: MarketId,
    pub date: NaiveDate,
    pub reason: GapReason,
}

#[derive(Debug, Error, Clone)]
pub enum ContinuousError {
    #[error(transparent)]
    DataGap(#[from] DataGapError),

    #[error("partition of {market} covering {date} is unreadable: {source}")]
    Partition {
        market: MarketId,
        date: NaiveDate,
        source: Arc<StoreError>,
    },

    #[error("store unavailable for {market}: {source}")]
    Store {
        market: MarketId,
        source: Arc<StoreError>,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("invalid range: start {start} is after end {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
}

/// A partition left out of the horizon because its manifest is corrupt.
#[derive(Debug, Clone)]
pub struct UnreadableMonth {
    pub month: YearMonth,
    pub source: Arc<StoreError>,
}

/// Builds continuous series for one market. Holds no state between builds.
pub struct ContinuousBuilder<'a> {
    store: &'a PartitionStore,
    definition: &'a MarketDefinition,
    calendar: &'a ExchangeCalendar,
    chain: &'a ContractChain,
    policy: Box<dyn RollPolicy + 'a>,
    config: ContinuousConfig,
    cancel: CancelToken,
}

impl<'a> ContinuousBuilder<'a> {
    pub fn new(
        store: &'a PartitionStore,
        definition: &'a MarketDefinition,
        calendar: &'a ExchangeCalendar,
        chain: &'a ContractChain,
    ) -> Self {
        Self {
            store,
            definition,
            calendar,
            chain,
            policy: Box::new(ExpiryOffsetRoll::for_market(definition)),
            config: ContinuousConfig::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: impl RollPolicy + 'a) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn with_config(mut self, config: ContinuousConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Last stored date of the market, `None` if nothing readable is stored.
    pub fn horizon(&self) -> Result<Option<NaiveDate>, ContinuousError> {
        Ok(self.locate_horizon()?.0)
    }

    /// Horizon from the latest partition whose manifest parses, plus the
    /// later months whose manifest does not.
    fn locate_horizon(&self) -> Result<(Option<NaiveDate>, Vec<UnreadableMonth>), ContinuousError> {
        let market = &self.definition.id;
        let store_err = |e: StoreError| ContinuousError::Store {
            market: market.clone(),
            source: Arc::new(e),
        };
        let mut unreadable = Vec::new();
        for month in self.store.list_partitions(market).map_err(store_err)?.into_iter().rev() {
            let key = PartitionKey::new(market.clone(), month);
            match self.store.manifest(&key) {
                Ok(Some(manifest)) => return Ok((Some(manifest.last_date), unreadable)),
                Ok(None) => {}
                Err(e) if e.is_corruption() => {
                    tracing::warn!(partition = %key, error = %e, "manifest unreadable, horizon skips it");
                    unreadable.push(UnreadableMonth {
                        month,
                        source: Arc::new(e),
                    });
                }
                Err(e) => return Err(store_err(e)),
            }
        }
        Ok((None, unreadable))
    }

    /// Build the series for `[start, end]`, clipped to the market's inception
    /// and data horizon. Roll factors are resolved here; bars are produced
    /// lazily by [`ContinuousSeries::iter`].
    pub fn build(&self, start: NaiveDate, end: NaiveDate) -> Result<ContinuousSeries<'a>, ContinuousError> {
        if start > end {
            return Err(ContinuousError::InvalidRange { start, end });
        }
        let market = self.definition.id.clone();
        let schedule = self.policy.schedule(self.chain, self.calendar);
        let (horizon, unreadable) = self.locate_horizon()?;

        let range = horizon
            .map(|h| (start.max(self.definition.inception), end.min(h)))
            .filter(|(s, e)| s <= e);
        let Some((first, last)) = range else {
            tracing::debug!(%market, %start, %end, ?horizon, "continuous range is empty");
            return Ok(ContinuousSeries::empty(self, market, schedule, horizon, unreadable));
        };
        let horizon = horizon.unwrap_or(last);

        let events: Vec<RollEvent> = schedule
            .events(self.calendar)
            .into_iter()
            .filter(|e| e.date >= first && e.date <= horizon)
            .collect();

        let records = {
            let mut prices = PriceSource::new(self.store, &market, &self.cancel);
            let mut records = Vec::with_capacity(events.len());
            for event in events {
                records.push(self.price_roll(&mut prices, event)?);
            }
            records
        };

        let segments = compose_backward(self.config.adjustment, &records);
        let listed_end = records.partition_point(|r| r.date <= last);

        tracing::debug!(
            %market,
            %first,
            %last,
            %horizon,
            rolls = records.len(),
            mode = ?self.config.adjustment,
            "built continuous series"
        );

        Ok(ContinuousSeries {
            market,
            calendar: self.calendar,
            store: self.store,
            schedule,
            config: self.config,
            cancel: self.cancel.clone(),
            range: Some((first, last)),
            horizon: Some(horizon),
            unreadable,
            records,
            listed_end,
            segments,
        })
    }

    /// Find a common price for both contracts of a roll, looking back from
    /// the roll date over at most `max_forward_fill` earlier trading days.
    ///
    /// Days inside an unreadable partition do not count against that limit,
    /// so a corrupt roll month falls back to the nearest readable one instead
    /// of leaving every earlier date unadjustable.
    fn price_roll(&self, prices: &mut PriceSource<'_>, event: RollEvent) -> Result<RollRecord, ContinuousError> {
        let mode = self.config.adjustment;
        let mut remaining = self.config.max_forward_fill + 1;
        let mut skipped: Option<YearMonth> = None;
        let mut candidate = Some(event.date);
        while remaining > 0 {
            let Some(day) = candidate.filter(|d| *d >= self.definition.inception) else {
                break;
            };
            candidate = self.calendar.previous_trading_day(day);
            let Some((from, to)) = prices.closes_on(&event.from, &event.to, day)? else {
                skipped = Some(YearMonth::of(day));
                continue;
            };
            remaining -= 1;
            if let (Some(from_price), Some(to_price)) = (from, to) {
                if let Some(factor) = mode.factor(from_price, to_price) {
                    if let Some(month) = skipped {
                        tracing::warn!(
                            market = %self.definition.id,
                            from = %event.from,
                            to = %event.to,
                            date = %event.date,
                            price_date = %day,
                            %month,
                            "roll priced past unreadable partition"
                        );
                    }
                    return Ok(RollRecord {
                        date: event.date,
                        from: event.from,
                        to: event.to,
                        price_date: Some(day),
                        from_price: Some(from_price),
                        to_price: Some(to_price),
                        factor: Some(factor),
                    });
                }
            }
        }

        if mode != AdjustmentMode::None {
            tracing::warn!(
                market = %self.definition.id,
                from = %event.from,
                to = %event.to,
                date = %event.date,
                "roll has no common price"
            );
        }
        let factor = (mode == AdjustmentMode::None).then(|| mode.identity());
        Ok(RollRecord {
            date: event.date,
            from: event.from,
            to: event.to,
            price_date: None,
            from_price: None,
            to_price: None,
            factor,
        })
    }
}

/// Cumulative adjustment for the dates before each roll, composed from the
/// horizon backward. A segment behind an unpriced roll is a gap.
fn compose_backward(mode: AdjustmentMode, records: &[RollRecord]) -> Vec<Result<f64, GapReason>> {
    let mut segments = vec![Ok(mode.identity()); records.len()];
    let mut cumulative: Result<f64, GapReason> = Ok(mode.identity());
    for (i, record) in records.iter().enumerate().rev() {
        cumulative = match (cumulative, record.factor) {
            (Ok(c), Some(f)) => Ok(mode.compose(c, f)),
            (Ok(_), None) => Err(GapReason::RollPriceMissing {
                from: record.from.clone(),
                to: record.to.clone(),
                roll_date: record.date,
            }),
            (Err(reason), _) => Err(reason),
        };
        segments[i] = cumulative.clone();
    }
    segments
}

/// A built continuous series. Iterate with [`ContinuousSeries::iter`]; each
/// call starts a fresh pass.
pub struct ContinuousSeries<'a> {
    market: MarketId,
    calendar: &'a ExchangeCalendar,
    store: &'a PartitionStore,
    schedule: RollSchedule,
    config: ContinuousConfig,
    cancel: CancelToken,
    range: Option<(NaiveDate, NaiveDate)>,
    horizon: Option<NaiveDate>,
    unreadable: Vec<UnreadableMonth>,
    /// Rolls dated from the range start through the horizon, ascending.
    records: Vec<RollRecord>,
    /// Records before this index fall inside the emitted range.
    listed_end: usize,
    /// `segments[i]` applies to dates before `records[i].date`.
    segments: Vec<Result<f64, GapReason>>,
}

impl<'a> ContinuousSeries<'a> {
    fn empty(
        builder: &ContinuousBuilder<'a>,
        market: MarketId,
        schedule: RollSchedule,
        horizon: Option<NaiveDate>,
        unreadable: Vec<UnreadableMonth>,
    ) -> Self {
        Self {
            market,
            calendar: builder.calendar,
            store: builder.store,
            schedule,
            config: builder.config,
            cancel: builder.cancel.clone(),
            range: None,
            horizon,
            unreadable,
            records: Vec::new(),
            listed_end: 0,
            segments: Vec::new(),
        }
    }

    pub fn market(&self) -> &MarketId {
        &self.market
    }

    /// First and last emitted date, `None` if the series is empty.
    pub fn range(&self) -> Option<(NaiveDate, NaiveDate)> {
        self.range
    }

    pub fn horizon(&self) -> Option<NaiveDate> {
        self.horizon
    }

    /// Months past the horizon whose manifest could not be read. Their dates
    /// are not emitted; callers report them alongside the bars.
    pub fn unreadable_months(&self) -> &[UnreadableMonth] {
        &self.unreadable
    }

    /// Rolls dated inside the emitted range.
    pub fn rolls(&self) -> &[RollRecord] {
        &self.records[..self.listed_end]
    }

    pub fn iter(&self) -> ContinuousIter<'_> {
        let days = match self.range {
            Some((first, last)) => self.calendar.trading_days(first, last),
            // An inverted range yields nothing
            None => self.calendar.trading_days(NaiveDate::MAX, NaiveDate::MIN),
        };
        ContinuousIter {
            series: self,
            days,
            prices: PriceSource::new(self.store, &self.market, &self.cancel),
            current_month: None,
            done: false,
        }
    }

    /// Cumulative adjustment for `date`.
    fn adjustment_for(&self, date: NaiveDate) -> Result<f64, GapReason> {
        let idx = self.records.partition_point(|r| r.date <= date);
        match self.segments.get(idx) {
            Some(segment) => segment.clone(),
            None => Ok(self.config.adjustment.identity()),
        }
    }
}

impl<'s, 'a> IntoIterator for &'s ContinuousSeries<'a> {
    type Item = Result<ContinuousBar, ContinuousError>;
    type IntoIter = ContinuousIter<'s>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy pass over a series: one item per trading day. Partitions are loaded
/// as their month is reached.
pub struct ContinuousIter<'s> {
    series: &'s ContinuousSeries<'s>,
    days: TradingDays<'s>,
    prices: PriceSource<'s>,
    current_month: Option<YearMonth>,
    done: bool,
}

impl ContinuousIter<'_> {
    fn bar_for(&mut self, date: NaiveDate) -> Result<ContinuousBar, ContinuousError> {
        let series = self.series;
        let market = &series.market;
        let month = YearMonth::of(date);
        if self.current_month != Some(month) {
            self.current_month = Some(month);
            let floor = series
                .calendar
                .sub_business_days(date, series.config.max_forward_fill);
            self.prices.retain_from(YearMonth::of(floor));
        }
        self.prices.month(month).map_err(|e| e.at(market, date))?;

        let gap = |reason| DataGapError {
            market: market.clone(),
            date,
            reason,
        };
        let active = series
            .schedule
            .active(date)
            .ok_or_else(|| gap(GapReason::NoActiveContract))?;
        let adjustment = series.adjustment_for(date).map_err(gap)?;

        let mode = series.config.adjustment;
        let (quote, status) = match self.prices.quote(&active.id, date).map_err(|e| e.at(market, date))? {
            Some(quote) => (Some(quote), BarStatus::Observed),
            None => self.forward_fill(&active.id, date)?,
        };
        let adjusted = |price: fn(&Quote) -> f64| quote.as_ref().map(|q| mode.apply(price(q), adjustment));

        Ok(ContinuousBar {
            date,
            market: market.clone(),
            contract: active.id.clone(),
            raw_close: quote.as_ref().map(|q| q.close),
            adjusted_open: adjusted(|q| q.open),
            adjusted_high: adjusted(|q| q.high),
            adjusted_low: adjusted(|q| q.low),
            adjusted_close: adjusted(|q| q.close),
            adjustment,
            volume: quote.as_ref().and_then(|q| q.volume),
            open_interest: quote.as_ref().and_then(|q| q.open_interest),
            status,
        })
    }

    /// The contract's own most recent close within `max_forward_fill` trading
    /// days, carried as a flat quote.
    fn forward_fill(
        &mut self,
        contract: &ContractId,
        date: NaiveDate,
    ) -> Result<(Option<Quote>, BarStatus), ContinuousError> {
        let calendar = self.series.calendar;
        let mut day = date;
        for age in 1..=self.series.config.max_forward_fill {
            let Some(prev) = calendar.previous_trading_day(day) else {
                break;
            };
            day = prev;
            if let Some(close) = self.prices.close_or_none(contract, day)? {
                return Ok((Some(Quote::carried(close)), BarStatus::ForwardFilled { age }));
            }
        }
        Ok((None, BarStatus::Missing))
    }
}

impl Iterator for ContinuousIter<'_> {
    type Item = Result<ContinuousBar, ContinuousError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let date = self.days.next()?;
        match self.bar_for(date) {
            Err(ContinuousError::Cancelled) => {
                self.done = true;
                Some(Err(ContinuousError::Cancelled))
            }
            item => Some(item),
        }
    }
}

// ── Partition-backed price lookups ──────────────────────────────────

/// One contract's stored values on one day.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Quote {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: Option<u64>,
    open_interest: Option<u64>,
}

impl Quote {
    fn carried(close: f64) -> Self {
        Self {
            open: close,
            high: close,
            low: close,
            close,
            volume: None,
            open_interest: None,
        }
    }
}

type MonthPrices = HashMap<ContractId, BTreeMap<NaiveDate, Quote>>;

enum LoadError {
    Cancelled,
    Partition(Arc<StoreError>),
}

impl LoadError {
    fn at(self, market: &MarketId, date: NaiveDate) -> ContinuousError {
        match self {
            LoadError::Cancelled => ContinuousError::Cancelled,
            LoadError::Partition(source) => ContinuousError::Partition {
                market: market.clone(),
                date,
                source,
            },
        }
    }
}

/// Settlement prices by month, loaded on first use. Absent partitions read
/// as empty months; unreadable ones are remembered as failures.
struct PriceSource<'a> {
    store: &'a PartitionStore,
    market: &'a MarketId,
    cancel: &'a CancelToken,
    months: HashMap<YearMonth, Result<MonthPrices, Arc<StoreError>>>,
}

impl<'a> PriceSource<'a> {
    fn new(store: &'a PartitionStore, market: &'a MarketId, cancel: &'a CancelToken) -> Self {
        Self {
            store,
            market,
            cancel,
            months: HashMap::new(),
        }
    }

    fn month(&mut self, month: YearMonth) -> Result<&MonthPrices, LoadError> {
        let (store, market, cancel) = (self.store, self.market, self.cancel);
        let slot = match self.months.entry(month) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                if cancel.is_cancelled() {
                    return Err(LoadError::Cancelled);
                }
                slot.insert(load_month(store, PartitionKey::new(market.clone(), month)))
            }
        };
        match slot {
            Ok(prices) => Ok(prices),
            Err(e) => Err(LoadError::Partition(Arc::clone(e))),
        }
    }

    fn quote(&mut self, contract: &ContractId, date: NaiveDate) -> Result<Option<Quote>, LoadError> {
        let prices = self.month(YearMonth::of(date))?;
        Ok(lookup(prices, contract, date))
    }

    /// Closing price, treating an unreadable month as no price.
    /// Cancellation still stops the caller.
    fn close_or_none(&mut self, contract: &ContractId, date: NaiveDate) -> Result<Option<f64>, ContinuousError> {
        match self.quote(contract, date) {
            Ok(quote) => Ok(quote.map(|q| q.close)),
            Err(LoadError::Partition(_)) => Ok(None),
            Err(LoadError::Cancelled) => Err(ContinuousError::Cancelled),
        }
    }

    /// Closes of two contracts on one day, `None` if that month is unreadable.
    fn closes_on(
        &mut self,
        a: &ContractId,
        b: &ContractId,
        date: NaiveDate,
    ) -> Result<Option<(Option<f64>, Option<f64>)>, ContinuousError> {
        match self.month(YearMonth::of(date)) {
            Ok(prices) => Ok(Some((
                lookup(prices, a, date).map(|q| q.close),
                lookup(prices, b, date).map(|q| q.close),
            ))),
            Err(LoadError::Partition(_)) => Ok(None),
            Err(LoadError::Cancelled) => Err(ContinuousError::Cancelled),
        }
    }

    /// Drop cached months before `floor`.
    fn retain_from(&mut self, floor: YearMonth) {
        self.months.retain(|m, _| *m >= floor);
    }
}

fn lookup(prices: &MonthPrices, contract: &ContractId, date: NaiveDate) -> Option<Quote> {
    prices.get(contract).and_then(|days| days.get(&date)).copied()
}

fn load_month(store: &PartitionStore, key: PartitionKey) -> Result<MonthPrices, Arc<StoreError>> {
    match store.read_partition(&key) {
        Ok(partition) => {
            let mut prices = MonthPrices::new();
            for row in partition.map(|p| p.rows).unwrap_or_default() {
                let quote = Quote {
                    open: row.open,
                    high: row.high,
                    low: row.low,
                    close: row.close,
                    volume: Some(row.volume),
                    open_interest: row.open_interest,
                };
                prices.entry(row.contract).or_default().insert(row.date, quote);
            }
            Ok(prices)
        }
        Err(e) => {
            tracing::warn!(partition = %key, error = %e, "partition unreadable");
            Err(Arc::new(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::fixtures::{cme, crude, d};
    use crate::domain::ContractBar;
    use crate::store::WriteMode;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn bar(date: &str, contract: &str, close: f64) -> ContractBar {
        ContractBar {
            date: d(date),
            contract: ContractId::from(contract),
            open: close,
            high: close,
            low: close,
            close,
            volume: 10,
            open_interest: None,
        }
    }

    /// CLZ23 and CLF24 across the November 2023 roll.
    fn seed(store: &PartitionStore, rows: Vec<ContractBar>) {
        let mut by_month: BTreeMap<YearMonth, Vec<ContractBar>> = BTreeMap::new();
        for row in rows {
            by_month.entry(YearMonth::of(row.date)).or_default().push(row);
        }
        for (month, rows) in by_month {
            store
                .write_partition(&PartitionKey::new(MarketId::from("CL"), month), rows, WriteMode::Create)
                .unwrap();
        }
    }

    fn chain() -> ContractChain {
        let observed: BTreeSet<ContractId> = ["CLZ23", "CLF24"].into_iter().map(ContractId::from).collect();
        ContractChain::build(&crude(), &cme(), &observed, Some(YearMonth::new(2023, 11).unwrap())).chain
    }

    fn november_rows() -> Vec<ContractBar> {
        vec![
            bar("2023-11-09", "CLZ23", 75.0),
            bar("2023-11-09", "CLF24", 75.4),
            bar("2023-11-10", "CLZ23", 76.0),
            bar("2023-11-10", "CLF24", 76.3),
            bar("2023-11-13", "CLZ23", 77.0),
            bar("2023-11-13", "CLF24", 77.2),
            bar("2023-11-14", "CLZ23", 77.98),
            bar("2023-11-14", "CLF24", 78.26),
            bar("2023-11-15", "CLF24", 76.66),
        ]
    }

    fn ok_bars(series: &ContinuousSeries<'_>) -> Vec<ContinuousBar> {
        series.iter().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn additive_adjustment_shifts_bars_before_roll() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path());
        seed(&store, november_rows());
        let (def, cal, chain) = (crude(), cme(), chain());
        let builder = ContinuousBuilder::new(&store, &def, &cal, &chain);
        let series = builder.build(d("2023-11-10"), d("2023-11-30")).unwrap();

        assert_eq!(series.horizon(), Some(d("2023-11-15")));
        let bars = ok_bars(&series);
        let dates: Vec<NaiveDate> = bars.iter().map(|b| b.date).collect();
        assert_eq!(
            dates,
            vec![d("2023-11-10"), d("2023-11-13"), d("2023-11-14"), d("2023-11-15")]
        );

        let gap = 78.26 - 77.98;
        assert_eq!(bars[0].contract.as_str(), "CLZ23");
        assert_eq!(bars[0].adjusted_close, Some(76.0 + gap));
        assert_eq!(bars[1].adjusted_close, Some(77.0 + gap));
        assert_eq!(bars[2].contract.as_str(), "CLF24");
        assert_eq!(bars[2].adjusted_close, Some(78.26));
        assert_eq!(bars[3].adjustment, 0.0);

        let rolls = series.rolls();
        assert_eq!(rolls.len(), 1);
        assert_eq!(rolls[0].date, d("2023-11-14"));
        assert_eq!(rolls[0].factor, Some(gap));
    }

    #[test]
    fn ratio_and_none_modes() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path());
        seed(&store, november_rows());
        let (def, cal, chain) = (crude(), cme(), chain());

        let ratio = ContinuousBuilder::new(&store, &def, &cal, &chain).with_config(ContinuousConfig {
            adjustment: AdjustmentMode::Ratio,
            max_forward_fill: 5,
        });
        let bars = ok_bars(&ratio.build(d("2023-11-13"), d("2023-11-14")).unwrap());
        assert_eq!(bars[0].adjusted_close, Some(77.0 * (78.26 / 77.98)));

        let raw = ContinuousBuilder::new(&store, &def, &cal, &chain).with_config(ContinuousConfig {
            adjustment: AdjustmentMode::None,
            max_forward_fill: 5,
        });
        let bars = ok_bars(&raw.build(d("2023-11-13"), d("2023-11-14")).unwrap());
        assert_eq!(bars[0].adjusted_close, Some(77.0));
    }

    #[test]
    fn roll_price_falls_back_to_earlier_common_day() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path());
        let rows: Vec<ContractBar> = november_rows()
            .into_iter()
            .filter(|r| !(r.date == d("2023-11-14") && r.contract.as_str() == "CLZ23"))
            .collect();
        seed(&store, rows);
        let (def, cal, chain) = (crude(), cme(), chain());
        let series = ContinuousBuilder::new(&store, &def, &cal, &chain)
            .build(d("2023-11-10"), d("2023-11-15"))
            .unwrap();
        let roll = &series.rolls()[0];
        assert_eq!(roll.price_date, Some(d("2023-11-13")));
        assert_eq!(roll.factor, Some(77.2 - 77.0));
    }

    #[test]
    fn unpriced_roll_gaps_every_earlier_date() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path());
        // CLF24 has no price on or before the roll
        let rows = vec![
            bar("2023-11-10", "CLZ23", 76.0),
            bar("2023-11-13", "CLZ23", 77.0),
            bar("2023-11-15", "CLF24", 76.66),
        ];
        seed(&store, rows);
        let (def, cal, chain) = (crude(), cme(), chain());
        let series = ContinuousBuilder::new(&store, &def, &cal, &chain)
            .build(d("2023-11-10"), d("2023-11-15"))
            .unwrap();
        let items: Vec<_> = series.iter().collect();
        assert_eq!(items.len(), 4);
        for item in &items[..2] {
            assert!(matches!(
                item,
                Err(ContinuousError::DataGap(DataGapError {
                    reason: GapReason::RollPriceMissing { .. },
                    ..
                }))
            ));
        }
        // 11-14: CLF24 active, no price yet and nothing to carry
        let on_roll = items[2].as_ref().unwrap();
        assert_eq!(on_roll.status, BarStatus::Missing);
        assert_eq!(items[3].as_ref().unwrap().status, BarStatus::Observed);
    }

    #[test]
    fn forward_fill_is_bounded() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path());
        let rows = vec![
            bar("2023-11-01", "CLZ23", 80.0),
            bar("2023-11-07", "CLZ23", 81.0),
        ];
        seed(&store, rows);
        let (def, cal, chain) = (crude(), cme(), chain());
        let series = ContinuousBuilder::new(&store, &def, &cal, &chain)
            .with_config(ContinuousConfig {
                adjustment: AdjustmentMode::Additive,
                max_forward_fill: 2,
            })
            .build(d("2023-11-01"), d("2023-11-07"))
            .unwrap();
        let statuses: Vec<BarStatus> = ok_bars(&series).iter().map(|b| b.status).collect();
        assert_eq!(
            statuses,
            vec![
                BarStatus::Observed,
                BarStatus::ForwardFilled { age: 1 },
                BarStatus::ForwardFilled { age: 2 },
                BarStatus::Missing,
                BarStatus::Observed,
            ]
        );
    }

    #[test]
    fn bars_carry_adjusted_ohlc_and_activity() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path());
        let mut rows = november_rows();
        rows[4] = ContractBar {
            open: 76.5,
            high: 77.6,
            low: 76.2,
            volume: 180_000,
            open_interest: Some(210_000),
            ..bar("2023-11-13", "CLZ23", 77.0)
        };
        seed(&store, rows);
        let (def, cal, chain) = (crude(), cme(), chain());
        let bars = ok_bars(
            &ContinuousBuilder::new(&store, &def, &cal, &chain)
                .build(d("2023-11-13"), d("2023-11-15"))
                .unwrap(),
        );

        let gap = 78.26 - 77.98;
        assert_eq!(bars[0].adjusted_open, Some(76.5 + gap));
        assert_eq!(bars[0].adjusted_high, Some(77.6 + gap));
        assert_eq!(bars[0].adjusted_low, Some(76.2 + gap));
        assert_eq!(bars[0].volume, Some(180_000));
        assert_eq!(bars[0].open_interest, Some(210_000));
        assert_eq!(bars[1].volume, Some(10));
        assert_eq!(bars[1].open_interest, None);
    }

    #[test]
    fn forward_filled_bar_is_flat_without_activity() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path());
        let rows = vec![
            ContractBar {
                open: 79.0,
                high: 81.5,
                low: 78.5,
                ..bar("2023-11-01", "CLZ23", 80.0)
            },
            bar("2023-11-03", "CLZ23", 81.0),
        ];
        seed(&store, rows);
        let (def, cal, chain) = (crude(), cme(), chain());
        let bars = ok_bars(
            &ContinuousBuilder::new(&store, &def, &cal, &chain)
                .build(d("2023-11-01"), d("2023-11-03"))
                .unwrap(),
        );
        let filled = &bars[1];
        assert_eq!(filled.status, BarStatus::ForwardFilled { age: 1 });
        assert_eq!(filled.adjusted_open, filled.adjusted_close);
        assert_eq!(filled.adjusted_high, filled.adjusted_close);
        assert_eq!(filled.adjusted_low, filled.adjusted_close);
        assert_eq!(filled.volume, None);
        assert_eq!(filled.open_interest, None);
    }

    #[test]
    fn open_interest_policy_moves_the_roll() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path());
        let rows: Vec<ContractBar> = november_rows()
            .into_iter()
            .map(|row| {
                let leading = row.contract.as_str() == "CLF24" && row.date >= d("2023-11-10");
                ContractBar {
                    open_interest: Some(if leading { 400 } else { 300 }),
                    ..row
                }
            })
            .collect();
        seed(&store, rows.clone());
        let (def, cal, chain) = (crude(), cme(), chain());
        let policy = crate::roll::OpenInterestRoll::from_bars(&chain, &rows, 1, ExpiryOffsetRoll::for_market(&def));
        let series = ContinuousBuilder::new(&store, &def, &cal, &chain)
            .with_policy(policy)
            .build(d("2023-11-09"), d("2023-11-15"))
            .unwrap();

        let roll = &series.rolls()[0];
        assert_eq!(roll.date, d("2023-11-10"));
        assert_eq!(roll.factor, Some(76.3 - 76.0));
        let bars = ok_bars(&series);
        assert_eq!(bars[0].contract.as_str(), "CLZ23");
        assert_eq!(bars[1].contract.as_str(), "CLF24");
    }

    #[test]
    fn range_is_clipped_to_inception_and_horizon() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path());
        seed(&store, november_rows());
        let (def, cal, chain) = (crude(), cme(), chain());
        let builder = ContinuousBuilder::new(&store, &def, &cal, &chain);

        let before = builder.build(d("2020-01-01"), d("2022-12-31")).unwrap();
        assert!(before.range().is_none());
        assert_eq!(before.iter().count(), 0);

        let after = builder.build(d("2024-01-01"), d("2024-06-30")).unwrap();
        assert_eq!(after.iter().count(), 0);

        assert!(matches!(
            builder.build(d("2023-11-15"), d("2023-11-01")),
            Err(ContinuousError::InvalidRange { .. })
        ));
    }

    #[test]
    fn empty_store_builds_empty_series() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path());
        let (def, cal, chain) = (crude(), cme(), chain());
        let series = ContinuousBuilder::new(&store, &def, &cal, &chain)
            .build(d("2023-01-01"), d("2023-12-31"))
            .unwrap();
        assert!(series.horizon().is_none());
        assert_eq!(series.iter().count(), 0);
    }

    #[test]
    fn cancelled_build_stops() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path());
        seed(&store, november_rows());
        let (def, cal, chain) = (crude(), cme(), chain());
        let cancel = CancelToken::new();
        let builder = ContinuousBuilder::new(&store, &def, &cal, &chain).with_cancel(cancel.clone());
        let series = builder.build(d("2023-11-15"), d("2023-11-15")).unwrap();
        cancel.cancel();
        let items: Vec<_> = series.iter().collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ContinuousError::Cancelled)));
        assert!(matches!(
            builder.build(d("2023-11-10"), d("2023-11-15")),
            Err(ContinuousError::Cancelled)
        ));
    }

    #[test]
    fn iteration_is_restartable() {
        let dir = TempDir::new().unwrap();
        let store = PartitionStore::new(dir.path());
        seed(&store, november_rows());
        let (def, cal, chain) = (crude(), cme(), chain());
        let series = ContinuousBuilder::new(&store, &def, &cal, &chain)
            .build(d("2023-11-09"), d("2023-11-15"))
            .unwrap();
        assert_eq!(ok_bars(&series), ok_bars(&series));
    }

    #[test]
    fn composition_runs_backward_from_horizon() {
        let records = vec![
            RollRecord {
                date: d("2023-11-14"),
                from: ContractId::from("CLZ23"),
                to: ContractId::from("CLF24"),
                price_date: None,
                from_price: None,
                to_price: None,
                factor: Some(1.0),
            },
            RollRecord {
                date: d("2024-01-17"),
                from: ContractId::from("CLF24"),
                to: ContractId::from("CLG24"),
                price_date: None,
                from_price: None,
                to_price: None,
                factor: Some(0.5),
            },
        ];
        let segments = compose_backward(AdjustmentMode::Additive, &records);
        assert_eq!(segments, vec![Ok(1.5), Ok(0.5)]);

        let mut unpriced = records.clone();
        unpriced[1].factor = None;
        let segments = compose_backward(AdjustmentMode::Additive, &unpriced);
        assert!(segments.iter().all(|s| s.is_err()));
    }
}
