//! Query results: ordered rows plus the faults that did not stop the query.

use crate::error::MantleError;
use crate::table::TableRef;
use chrono::{DateTime, NaiveDate};
use polars::prelude::*;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tecton_core::domain::{ContractBar, MarketId, YearMonth};
use tecton_core::{BarStatus, ContinuousBar, ContinuousError, StoreError};

/// A raw contract bar tagged with its market.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscreteRow {
    pub market: MarketId,
    #[serde(flatten)]
    pub bar: ContractBar,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rows {
    /// Sorted by (date, market, contract).
    Discrete(Vec<DiscreteRow>),
    /// Sorted by (date, market).
    Continuous(Vec<ContinuousBar>),
}

impl Rows {
    pub fn len(&self) -> usize {
        match self {
            Rows::Discrete(rows) => rows.len(),
            Rows::Continuous(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A unit of a query that could not be produced. The rest of the query is
/// unaffected.
#[derive(Debug, Clone)]
pub enum SelectFault {
    /// A stored month could not be read or failed its checksum.
    Partition {
        market: MarketId,
        month: YearMonth,
        source: Arc<StoreError>,
    },
    /// One trading day of a continuous series.
    Series {
        market: MarketId,
        date: NaiveDate,
        source: ContinuousError,
    },
    /// The market could not be queried at all.
    Market { market: MarketId, reason: String },
}

impl SelectFault {
    pub fn market(&self) -> &MarketId {
        match self {
            SelectFault::Partition { market, .. }
            | SelectFault::Series { market, .. }
            | SelectFault::Market { market, .. } => market,
        }
    }

    fn sort_key(&self) -> (Option<NaiveDate>, &MarketId) {
        match self {
            SelectFault::Partition { market, month, .. } => (Some(month.first_day()), market),
            SelectFault::Series { market, date, .. } => (Some(*date), market),
            SelectFault::Market { market, .. } => (None, market),
        }
    }
}

impl fmt::Display for SelectFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectFault::Partition { market, month, source } => {
                write!(f, "{market} {month}: {source}")
            }
            SelectFault::Series { source, .. } => write!(f, "{source}"),
            SelectFault::Market { market, reason } => write!(f, "{market}: {reason}"),
        }
    }
}

/// Result of [`Mantle::select`](crate::Mantle::select).
#[derive(Debug, Clone)]
pub struct Selection {
    pub table: TableRef,
    /// Projected columns, in output order. The projection shapes
    /// [`to_dataframe`](Self::to_dataframe) only.
    pub columns: Vec<&'static str>,
    /// Universe version the query was pinned to, for universe-wide tables.
    pub universe_version: Option<u64>,
    /// Typed rows with every field, whatever the projection.
    pub rows: Rows,
    /// Ordered like the rows: by date, then market.
    pub faults: Vec<SelectFault>,
}

impl Selection {
    pub(crate) fn new(
        table: TableRef,
        columns: Vec<&'static str>,
        universe_version: Option<u64>,
        mut rows: Rows,
        mut faults: Vec<SelectFault>,
    ) -> Self {
        match &mut rows {
            Rows::Discrete(rows) => rows.sort_by(|a, b| {
                (a.bar.date, &a.market, &a.bar.contract).cmp(&(b.bar.date, &b.market, &b.bar.contract))
            }),
            Rows::Continuous(rows) => rows.sort_by(|a, b| (a.date, &a.market).cmp(&(b.date, &b.market))),
        }
        faults.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Self {
            table,
            columns,
            universe_version,
            rows,
            faults,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.faults.is_empty()
    }

    pub fn discrete(&self) -> Option<&[DiscreteRow]> {
        match &self.rows {
            Rows::Discrete(rows) => Some(rows),
            Rows::Continuous(_) => None,
        }
    }

    pub fn continuous(&self) -> Option<&[ContinuousBar]> {
        match &self.rows {
            Rows::Continuous(rows) => Some(rows),
            Rows::Discrete(_) => None,
        }
    }

    /// Export the projected columns as a Polars DataFrame.
    pub fn to_dataframe(&self) -> Result<DataFrame, MantleError> {
        let columns = self
            .columns
            .iter()
            .map(|name| match &self.rows {
                Rows::Discrete(rows) => discrete_column(name, rows),
                Rows::Continuous(rows) => continuous_column(name, rows),
            })
            .collect::<Result<Vec<_>, _>>()?;
        DataFrame::new(columns).map_err(|e| MantleError::Export(format!("dataframe creation: {e}")))
    }
}

fn date_column(dates: impl Iterator<Item = NaiveDate>) -> Result<Column, MantleError> {
    let epoch = DateTime::UNIX_EPOCH.date_naive();
    let days: Vec<i32> = dates.map(|d| (d - epoch).num_days() as i32).collect();
    Column::new("date".into(), days)
        .cast(&DataType::Date)
        .map_err(|e| MantleError::Export(format!("date cast: {e}")))
}

fn discrete_column(name: &str, rows: &[DiscreteRow]) -> Result<Column, MantleError> {
    let column = match name {
        "date" => return date_column(rows.iter().map(|r| r.bar.date)),
        "market" => Column::new(name.into(), rows.iter().map(|r| r.market.as_str()).collect::<Vec<_>>()),
        "contract" => Column::new(
            name.into(),
            rows.iter().map(|r| r.bar.contract.as_str()).collect::<Vec<_>>(),
        ),
        "open" => Column::new(name.into(), rows.iter().map(|r| r.bar.open).collect::<Vec<_>>()),
        "high" => Column::new(name.into(), rows.iter().map(|r| r.bar.high).collect::<Vec<_>>()),
        "low" => Column::new(name.into(), rows.iter().map(|r| r.bar.low).collect::<Vec<_>>()),
        "close" => Column::new(name.into(), rows.iter().map(|r| r.bar.close).collect::<Vec<_>>()),
        "volume" => Column::new(name.into(), rows.iter().map(|r| r.bar.volume).collect::<Vec<_>>()),
        "open_interest" => Column::new(
            name.into(),
            rows.iter().map(|r| r.bar.open_interest).collect::<Vec<_>>(),
        ),
        other => return Err(MantleError::Export(format!("no discrete column '{other}'"))),
    };
    Ok(column)
}

fn continuous_column(name: &str, rows: &[ContinuousBar]) -> Result<Column, MantleError> {
    let column = match name {
        "date" => return date_column(rows.iter().map(|r| r.date)),
        "market" => Column::new(name.into(), rows.iter().map(|r| r.market.as_str()).collect::<Vec<_>>()),
        "contract" => Column::new(name.into(), rows.iter().map(|r| r.contract.as_str()).collect::<Vec<_>>()),
        "raw_close" => Column::new(name.into(), rows.iter().map(|r| r.raw_close).collect::<Vec<_>>()),
        "adjusted_open" => Column::new(name.into(), rows.iter().map(|r| r.adjusted_open).collect::<Vec<_>>()),
        "adjusted_high" => Column::new(name.into(), rows.iter().map(|r| r.adjusted_high).collect::<Vec<_>>()),
        "adjusted_low" => Column::new(name.into(), rows.iter().map(|r| r.adjusted_low).collect::<Vec<_>>()),
        "adjusted_close" => Column::new(
            name.into(),
            rows.iter().map(|r| r.adjusted_close).collect::<Vec<_>>(),
        ),
        "adjustment" => Column::new(name.into(), rows.iter().map(|r| r.adjustment).collect::<Vec<_>>()),
        "volume" => Column::new(name.into(), rows.iter().map(|r| r.volume).collect::<Vec<_>>()),
        "open_interest" => Column::new(name.into(), rows.iter().map(|r| r.open_interest).collect::<Vec<_>>()),
        "status" => Column::new(
            name.into(),
            rows.iter().map(|r| status_label(r.status)).collect::<Vec<_>>(),
        ),
        "fill_age" => Column::new(
            name.into(),
            rows.iter()
                .map(|r| match r.status {
                    BarStatus::ForwardFilled { age } => Some(age),
                    BarStatus::Observed | BarStatus::Missing => None,
                })
                .collect::<Vec<_>>(),
        ),
        other => return Err(MantleError::Export(format!("no continuous column '{other}'"))),
    };
    Ok(column)
}

fn status_label(status: BarStatus) -> &'static str {
    match status {
        BarStatus::Observed => "observed",
        BarStatus::ForwardFilled { .. } => "forward_filled",
        BarStatus::Missing => "missing",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tecton_core::domain::ContractId;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn bar(date: &str, market: &str, status: BarStatus) -> ContinuousBar {
        let priced = status != BarStatus::Missing;
        let observed = status == BarStatus::Observed;
        ContinuousBar {
            date: d(date),
            market: MarketId::from(market),
            contract: ContractId::from(format!("{market}Z23").as_str()),
            raw_close: priced.then_some(70.0),
            adjusted_open: priced.then_some(if observed { 71.0 } else { 71.5 }),
            adjusted_high: priced.then_some(if observed { 72.0 } else { 71.5 }),
            adjusted_low: priced.then_some(if observed { 70.5 } else { 71.5 }),
            adjusted_close: priced.then_some(71.5),
            adjustment: 1.5,
            volume: observed.then_some(12_000),
            open_interest: observed.then_some(90_000),
            status,
        }
    }

    #[test]
    fn rows_are_sorted_by_date_then_market() {
        let rows = Rows::Continuous(vec![
            bar("2023-11-14", "ES", BarStatus::Observed),
            bar("2023-11-13", "ES", BarStatus::Observed),
            bar("2023-11-14", "CL", BarStatus::Observed),
        ]);
        let selection = Selection::new(TableRef::continuous("CL"), vec!["date"], None, rows, Vec::new());
        let order: Vec<(NaiveDate, &str)> = selection
            .continuous()
            .unwrap()
            .iter()
            .map(|b| (b.date, b.market.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![(d("2023-11-13"), "ES"), (d("2023-11-14"), "CL"), (d("2023-11-14"), "ES")]
        );
    }

    #[test]
    fn dataframe_follows_projection() {
        let rows = Rows::Continuous(vec![
            bar("2023-11-13", "CL", BarStatus::Observed),
            bar("2023-11-14", "CL", BarStatus::ForwardFilled { age: 1 }),
            bar("2023-11-15", "CL", BarStatus::Missing),
        ]);
        let selection = Selection::new(
            TableRef::continuous("CL"),
            vec!["date", "adjusted_close", "status", "fill_age"],
            None,
            rows,
            Vec::new(),
        );
        let df = selection.to_dataframe().unwrap();
        let names: Vec<&str> = df.get_column_names().iter().map(|n| n.as_str()).collect();
        assert_eq!(names, vec!["date", "adjusted_close", "status", "fill_age"]);
        assert_eq!(df.height(), 3);
        let adjusted = df.column("adjusted_close").unwrap().f64().unwrap();
        assert_eq!(adjusted.get(0), Some(71.5));
        assert_eq!(adjusted.get(2), None);
        let status = df.column("status").unwrap().str().unwrap();
        assert_eq!(status.get(1), Some("forward_filled"));
        let age = df.column("fill_age").unwrap().u32().unwrap();
        assert_eq!(age.get(1), Some(1));
        assert_eq!(age.get(0), None);
    }

    #[test]
    fn continuous_dataframe_exports_ohlc_and_activity() {
        let rows = Rows::Continuous(vec![
            bar("2023-11-13", "CL", BarStatus::Observed),
            bar("2023-11-14", "CL", BarStatus::ForwardFilled { age: 1 }),
        ]);
        let selection = Selection::new(
            TableRef::continuous("CL"),
            vec!["adjusted_high", "adjusted_low", "volume", "open_interest"],
            None,
            rows,
            Vec::new(),
        );
        let df = selection.to_dataframe().unwrap();
        assert_eq!(df.column("adjusted_high").unwrap().f64().unwrap().get(0), Some(72.0));
        assert_eq!(df.column("adjusted_low").unwrap().f64().unwrap().get(1), Some(71.5));
        let volume = df.column("volume").unwrap().u64().unwrap();
        assert_eq!(volume.get(0), Some(12_000));
        assert_eq!(volume.get(1), None);
        assert_eq!(df.column("open_interest").unwrap().u64().unwrap().null_count(), 1);
        // The projection never trims the typed rows
        assert_eq!(selection.continuous().unwrap()[0].adjusted_open, Some(71.0));
    }

    #[test]
    fn discrete_dataframe_keeps_null_open_interest() {
        let row = |oi| DiscreteRow {
            market: MarketId::from("CL"),
            bar: ContractBar {
                date: d("2023-11-13"),
                contract: ContractId::from("CLZ23"),
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 10,
                open_interest: oi,
            },
        };
        let selection = Selection::new(
            TableRef::discrete("CL"),
            vec!["contract", "open_interest"],
            None,
            Rows::Discrete(vec![row(Some(5)), row(None)]),
            Vec::new(),
        );
        let df = selection.to_dataframe().unwrap();
        let oi = df.column("open_interest").unwrap().u64().unwrap();
        assert_eq!(oi.null_count(), 1);
    }
}
