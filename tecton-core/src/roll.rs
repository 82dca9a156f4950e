//! Roll policy: which contract is front for a date, and when it changes.
//!
//! Policies are pure. They see a chain and a calendar, never storage.

use crate::domain::{Contract, ContractBar, ContractChain, ContractId, ExchangeCalendar, MarketDefinition};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// The front contract changed between the previous trading day and `date`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollEvent {
    /// First trading day on which `to` is active.
    pub date: NaiveDate,
    pub from: ContractId,
    pub to: ContractId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollDecision {
    pub active: Contract,
    pub roll: Option<RollEvent>,
}

/// A contract with the date it hands over to its successor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledRoll {
    pub contract: Contract,
    pub roll_date: NaiveDate,
}

/// A chain's contracts with their roll dates, in chain order.
///
/// Roll dates are non-decreasing because chain expiries are strictly
/// increasing, so lookups are binary searches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollSchedule {
    entries: Vec<ScheduledRoll>,
}

impl RollSchedule {
    pub fn entries(&self) -> &[ScheduledRoll] {
        &self.entries
    }

    /// Front contract on `date`: the first contract whose roll date is after it.
    pub fn active(&self, date: NaiveDate) -> Option<&Contract> {
        let idx = self.entries.partition_point(|e| e.roll_date <= date);
        self.entries.get(idx).map(|e| &e.contract)
    }

    /// Front contract on `date`, with a roll event if the previous trading day
    /// had a different one. `None` once the chain is exhausted.
    pub fn resolve(&self, calendar: &ExchangeCalendar, date: NaiveDate) -> Option<RollDecision> {
        let active = self.active(date)?;
        let roll = calendar
            .previous_trading_day(date)
            .and_then(|prev| self.active(prev))
            .filter(|prev| prev.id != active.id)
            .map(|prev| RollEvent {
                date,
                from: prev.id.clone(),
                to: active.id.clone(),
            });
        Some(RollDecision {
            active: active.clone(),
            roll,
        })
    }

    /// Every roll event the schedule produces, ascending by date.
    pub fn events(&self, calendar: &ExchangeCalendar) -> Vec<RollEvent> {
        let mut events = Vec::new();
        let mut last_switch = None;
        for entry in &self.entries {
            let Some(switch) = calendar.on_or_after(entry.roll_date) else {
                continue;
            };
            if last_switch == Some(switch) {
                continue;
            }
            last_switch = Some(switch);
            if let Some(roll) = self.resolve(calendar, switch).and_then(|d| d.roll) {
                events.push(roll);
            }
        }
        events
    }
}

/// Strategy deciding roll dates.
pub trait RollPolicy: Send + Sync {
    /// Human-readable name (e.g., "expiry_offset").
    fn name(&self) -> &str;

    /// Date on which `contract` stops being front.
    fn roll_date(&self, contract: &Contract, calendar: &ExchangeCalendar) -> NaiveDate;

    fn schedule(&self, chain: &ContractChain, calendar: &ExchangeCalendar) -> RollSchedule {
        RollSchedule {
            entries: chain
                .contracts()
                .iter()
                .map(|c| ScheduledRoll {
                    contract: c.clone(),
                    roll_date: self.roll_date(c, calendar),
                })
                .collect(),
        }
    }

    fn resolve(
        &self,
        chain: &ContractChain,
        calendar: &ExchangeCalendar,
        date: NaiveDate,
    ) -> Option<RollDecision> {
        self.schedule(chain, calendar).resolve(calendar, date)
    }
}

/// Roll a fixed number of business days before expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExpiryOffsetRoll {
    /// `None` uses the calendar's default offset.
    pub offset: Option<u32>,
}

impl ExpiryOffsetRoll {
    pub fn new(offset: u32) -> Self {
        Self {
            offset: Some(offset),
        }
    }

    /// The market's own offset, falling back to the calendar default.
    pub fn for_market(definition: &MarketDefinition) -> Self {
        Self {
            offset: definition.roll_offset,
        }
    }
}

impl RollPolicy for ExpiryOffsetRoll {
    fn name(&self) -> &str {
        "expiry_offset"
    }

    fn roll_date(&self, contract: &Contract, calendar: &ExchangeCalendar) -> NaiveDate {
        let n = self.offset.unwrap_or(calendar.default_roll_offset);
        calendar.sub_business_days(contract.expiry, n)
    }
}

/// Roll when the next contract's open interest overtakes the front's, and
/// no later than the fallback expiry-offset roll.
///
/// Open interest is read from bars handed in at construction, so the policy
/// itself never touches storage.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenInterestRoll {
    /// First day each contract's successor led on smoothed open interest.
    crossovers: HashMap<ContractId, NaiveDate>,
    fallback: ExpiryOffsetRoll,
}

impl OpenInterestRoll {
    /// Find crossovers for every adjacent pair of `chain`. Open interest is
    /// compared as a trailing mean over `smoothing` common trading days
    /// (1 compares raw values); bars without open interest are ignored.
    pub fn from_bars(
        chain: &ContractChain,
        bars: &[ContractBar],
        smoothing: usize,
        fallback: ExpiryOffsetRoll,
    ) -> Self {
        let mut interest: HashMap<&ContractId, BTreeMap<NaiveDate, u64>> = HashMap::new();
        for bar in bars {
            if let Some(oi) = bar.open_interest {
                interest.entry(&bar.contract).or_default().insert(bar.date, oi);
            }
        }

        let window = smoothing.max(1);
        let mut crossovers = HashMap::new();
        for pair in chain.contracts().windows(2) {
            let (front, next) = (&pair[0], &pair[1]);
            let (Some(front_oi), Some(next_oi)) = (interest.get(&front.id), interest.get(&next.id)) else {
                continue;
            };
            let mut trailing: VecDeque<(u64, u64)> = VecDeque::with_capacity(window);
            for (date, front_value) in front_oi {
                let Some(next_value) = next_oi.get(date) else {
                    continue;
                };
                if trailing.len() == window {
                    trailing.pop_front();
                }
                trailing.push_back((*front_value, *next_value));
                let front_sum: u64 = trailing.iter().map(|(f, _)| f).sum();
                let next_sum: u64 = trailing.iter().map(|(_, n)| n).sum();
                if trailing.len() == window && next_sum > front_sum {
                    crossovers.insert(front.id.clone(), *date);
                    break;
                }
            }
        }
        tracing::debug!(market = %chain.market(), crossovers = crossovers.len(), smoothing = window, "open interest crossovers");
        Self { crossovers, fallback }
    }

    pub fn crossover(&self, contract: &ContractId) -> Option<NaiveDate> {
        self.crossovers.get(contract).copied()
    }
}

impl RollPolicy for OpenInterestRoll {
    fn name(&self) -> &str {
        "open_interest"
    }

    fn roll_date(&self, contract: &Contract, calendar: &ExchangeCalendar) -> NaiveDate {
        let latest = self.fallback.roll_date(contract, calendar);
        self.crossover(&contract.id).map_or(latest, |c| c.min(latest))
    }

    /// Crossovers can land out of order across pairs; roll dates are held
    /// non-decreasing so lookups stay binary searches.
    fn schedule(&self, chain: &ContractChain, calendar: &ExchangeCalendar) -> RollSchedule {
        let mut floor = NaiveDate::MIN;
        RollSchedule {
            entries: chain
                .contracts()
                .iter()
                .map(|c| {
                    floor = floor.max(self.roll_date(c, calendar));
                    ScheduledRoll {
                        contract: c.clone(),
                        roll_date: floor,
                    }
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::fixtures::{cme, crude, d};
    use crate::domain::{ContractBar, ContractId, YearMonth};
    use std::collections::BTreeSet;

    fn crude_chain() -> ContractChain {
        let observed: BTreeSet<ContractId> = ["CLZ23", "CLF24"].into_iter().map(ContractId::from).collect();
        ContractChain::build(&crude(), &cme(), &observed, Some(YearMonth::new(2023, 11).unwrap())).chain
    }

    #[test]
    fn crude_rolls_three_business_days_before_expiry() {
        let policy = ExpiryOffsetRoll::for_market(&crude());
        let cal = cme();
        let chain = crude_chain();

        let before = policy.resolve(&chain, &cal, d("2023-11-13")).unwrap();
        assert_eq!(before.active.id.as_str(), "CLZ23");
        assert!(before.roll.is_none());

        let on = policy.resolve(&chain, &cal, d("2023-11-14")).unwrap();
        assert_eq!(on.active.id.as_str(), "CLF24");
        assert_eq!(
            on.roll,
            Some(RollEvent {
                date: d("2023-11-14"),
                from: ContractId::from("CLZ23"),
                to: ContractId::from("CLF24"),
            })
        );

        let after = policy.resolve(&chain, &cal, d("2023-11-15")).unwrap();
        assert_eq!(after.active.id.as_str(), "CLF24");
        assert!(after.roll.is_none());
    }

    #[test]
    fn roll_after_weekend_fires_on_monday() {
        let cal = cme();
        let chain = crude_chain();
        // Offset 0: CLZ23 rolls on its expiry, Fri 2023-11-17
        let policy = ExpiryOffsetRoll::new(0);
        let monday = policy.resolve(&chain, &cal, d("2023-11-20")).unwrap();
        assert_eq!(monday.active.id.as_str(), "CLF24");
        assert!(monday.roll.is_none());
        let friday = policy.resolve(&chain, &cal, d("2023-11-17")).unwrap();
        assert_eq!(friday.roll.map(|r| r.from), Some(ContractId::from("CLZ23")));
    }

    #[test]
    fn offset_defaults_to_calendar() {
        let mut cl = crude();
        cl.roll_offset = None;
        let policy = ExpiryOffsetRoll::for_market(&cl);
        let cal = cme();
        let z23 = crude_chain().contracts()[0].clone();
        assert_eq!(
            policy.roll_date(&z23, &cal),
            cal.sub_business_days(z23.expiry, cal.default_roll_offset)
        );
    }

    #[test]
    fn exhausted_chain_resolves_to_none() {
        let policy = ExpiryOffsetRoll::for_market(&crude());
        assert!(policy.resolve(&crude_chain(), &cme(), d("2030-01-02")).is_none());
        let empty = ContractChain::new(crude().id);
        assert!(policy.resolve(&empty, &cme(), d("2023-11-14")).is_none());
    }

    fn oi(date: &str, contract: &str, open_interest: u64) -> ContractBar {
        ContractBar {
            date: d(date),
            contract: ContractId::from(contract),
            open: 77.0,
            high: 77.0,
            low: 77.0,
            close: 77.0,
            volume: 1,
            open_interest: Some(open_interest),
        }
    }

    /// CLF24 overtakes CLZ23 on 11-08 and dips back on 11-09.
    fn interest() -> Vec<ContractBar> {
        vec![
            oi("2023-11-06", "CLZ23", 300),
            oi("2023-11-06", "CLF24", 200),
            oi("2023-11-07", "CLZ23", 280),
            oi("2023-11-07", "CLF24", 250),
            oi("2023-11-08", "CLZ23", 250),
            oi("2023-11-08", "CLF24", 260),
            oi("2023-11-09", "CLZ23", 240),
            oi("2023-11-09", "CLF24", 230),
            oi("2023-11-10", "CLZ23", 150),
            oi("2023-11-10", "CLF24", 320),
        ]
    }

    #[test]
    fn open_interest_rolls_on_crossover() {
        let (cal, chain) = (cme(), crude_chain());
        let policy = OpenInterestRoll::from_bars(&chain, &interest(), 1, ExpiryOffsetRoll::for_market(&crude()));
        assert_eq!(policy.crossover(&ContractId::from("CLZ23")), Some(d("2023-11-08")));

        let on = policy.resolve(&chain, &cal, d("2023-11-08")).unwrap();
        assert_eq!(on.active.id.as_str(), "CLF24");
        assert_eq!(on.roll.map(|r| r.from), Some(ContractId::from("CLZ23")));
        assert_eq!(
            policy.resolve(&chain, &cal, d("2023-11-07")).unwrap().active.id.as_str(),
            "CLZ23"
        );
    }

    #[test]
    fn smoothing_delays_the_crossover() {
        let chain = crude_chain();
        let policy = OpenInterestRoll::from_bars(&chain, &interest(), 3, ExpiryOffsetRoll::for_market(&crude()));
        // 3-day means: 11-08 (277 vs 237), 11-09 (257 vs 247), 11-10 (213 vs 270)
        assert_eq!(policy.crossover(&ContractId::from("CLZ23")), Some(d("2023-11-10")));
    }

    #[test]
    fn open_interest_roll_is_capped_by_fallback() {
        let (cal, chain) = (cme(), crude_chain());
        let flat: Vec<ContractBar> = ["2023-11-13", "2023-11-14", "2023-11-15"]
            .into_iter()
            .flat_map(|day| [oi(day, "CLZ23", 500), oi(day, "CLF24", 100)])
            .collect();
        let policy = OpenInterestRoll::from_bars(&chain, &flat, 1, ExpiryOffsetRoll::for_market(&crude()));
        assert_eq!(policy.crossover(&ContractId::from("CLZ23")), None);
        let z23 = &chain.contracts()[0];
        assert_eq!(policy.roll_date(z23, &cal), d("2023-11-14"));

        let schedule = policy.schedule(&chain, &cal);
        assert!(schedule.entries().windows(2).all(|w| w[0].roll_date <= w[1].roll_date));
        assert_eq!(policy.name(), "open_interest");
    }

    #[test]
    fn schedule_events_match_day_by_day_resolution() {
        let policy = ExpiryOffsetRoll::for_market(&crude());
        let cal = cme();
        let schedule = policy.schedule(&crude_chain(), &cal);
        let events = schedule.events(&cal);
        let walked: Vec<RollEvent> = cal
            .trading_days(d("2023-11-01"), d("2025-06-30"))
            .filter_map(|day| schedule.resolve(&cal, day).and_then(|r| r.roll))
            .collect();
        let in_range: Vec<RollEvent> = events
            .into_iter()
            .filter(|e| e.date >= d("2023-11-01") && e.date <= d("2025-06-30"))
            .collect();
        assert_eq!(in_range, walked);
        assert_eq!(in_range[0].date, d("2023-11-14"));
    }
}
