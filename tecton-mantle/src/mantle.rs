//! The query facade.
//!
//! `select` routes a table reference to the partition store (discrete
//! tables) or to the continuous series builder (continuous tables), merges
//! the per-market results, and sorts them. Universe tables pin the universe
//! version current when the query starts and fan out across its markets in
//! parallel.

use crate::config::MantleConfig;
use crate::error::MantleError;
use crate::selection::{DiscreteRow, Rows, SelectFault, Selection};
use crate::table::{Scope, TableRef};
use anyhow::Context;
use chrono::NaiveDate;
use rayon::prelude::*;
use std::sync::Arc;
use tecton_core::config::MarketsConfig;
use tecton_core::domain::{ContractBar, ExchangeCalendar, MarketDefinition, MarketId, YearMonth};
use tecton_core::registry::ChainRefresh;
use tecton_core::store::PartitionManifest;
use tecton_core::{
    CancelToken, ContinuousBar, ContinuousBuilder, ContinuousConfig, ContinuousError, MarketRegistry,
    PartitionKey, PartitionStore, RegisterOutcome, WriteMode,
};

pub struct Mantle {
    store: Arc<PartitionStore>,
    registry: MarketRegistry,
    continuous: ContinuousConfig,
}

/// Rows and faults produced for one market.
type MarketPart<T> = (Vec<T>, Vec<SelectFault>);

impl Mantle {
    pub fn new(store: Arc<PartitionStore>) -> Self {
        Self {
            registry: MarketRegistry::new(Arc::clone(&store)),
            store,
            continuous: ContinuousConfig::default(),
        }
    }

    /// Open the store and register the configured markets.
    pub fn open(config: &MantleConfig) -> anyhow::Result<Self> {
        let mantle = Self::new(Arc::new(PartitionStore::new(&config.data_dir)))
            .with_continuous(config.continuous);
        if let Some(path) = &config.markets_file {
            let markets = MarketsConfig::from_file(path)
                .with_context(|| format!("loading markets from {}", path.display()))?;
            let outcomes = mantle
                .registry
                .load_config(&markets)
                .with_context(|| format!("registering markets from {}", path.display()))?;
            tracing::info!(
                markets = outcomes.len(),
                data_dir = %config.data_dir.display(),
                "opened mantle"
            );
        }
        Ok(mantle)
    }

    pub fn with_continuous(mut self, continuous: ContinuousConfig) -> Self {
        self.continuous = continuous;
        self
    }

    pub fn registry(&self) -> &MarketRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<PartitionStore> {
        &self.store
    }

    // ── Mutation ────────────────────────────────────────────────────

    pub fn register_calendar(&self, calendar: ExchangeCalendar) -> Result<RegisterOutcome, MantleError> {
        Ok(self.registry.register_calendar(calendar)?)
    }

    pub fn register_market(&self, definition: MarketDefinition) -> Result<RegisterOutcome, MantleError> {
        Ok(self.registry.register(definition)?)
    }

    /// Write one partition of a registered market, then extend its chain
    /// with any newly listed contracts.
    ///
    /// Once the store has published, the write stands: a failed chain
    /// refresh is logged and left for the next write or query to redo.
    pub fn write_partition(
        &self,
        key: &PartitionKey,
        rows: Vec<ContractBar>,
        mode: WriteMode,
    ) -> Result<PartitionManifest, MantleError> {
        self.require_market(&key.market)?;
        let manifest = self.store.write_partition(key, rows, mode)?;
        if let Err(e) = self.refresh_chain(&key.market) {
            tracing::warn!(partition = %key, version = manifest.version, error = %e, "chain refresh failed after write");
        }
        Ok(manifest)
    }

    pub(crate) fn require_market(&self, market: &MarketId) -> Result<Arc<MarketDefinition>, MantleError> {
        self.registry
            .definition(market)
            .ok_or_else(|| MantleError::UnknownMarket(market.clone()))
    }

    pub(crate) fn refresh_chain(&self, market: &MarketId) -> Result<ChainRefresh, MantleError> {
        Ok(self.registry.refresh_chain(market)?)
    }

    // ── Query ───────────────────────────────────────────────────────

    /// Rows of `table` dated in `[start, end]`, projected to `columns`
    /// (empty for all), sorted by date then market.
    pub fn select(
        &self,
        table: &TableRef,
        start: NaiveDate,
        end: NaiveDate,
        columns: &[&str],
    ) -> Result<Selection, MantleError> {
        self.select_with_cancel(table, start, end, columns, &CancelToken::new())
    }

    /// Like [`select`](Self::select), stopping at the next partition boundary
    /// once `cancel` is set.
    pub fn select_with_cancel(
        &self,
        table: &TableRef,
        start: NaiveDate,
        end: NaiveDate,
        columns: &[&str],
        cancel: &CancelToken,
    ) -> Result<Selection, MantleError> {
        if start > end {
            return Err(MantleError::InvalidRange { start, end });
        }
        let columns = table.project(columns)?;

        let (markets, version) = match table.scope() {
            Scope::Market(market) => {
                self.require_market(market)?;
                (vec![market.clone()], None)
            }
            Scope::Universe => match self.registry.current_version() {
                Some(version) => (version.market_ids().cloned().collect(), Some(version.id)),
                None => (Vec::new(), None),
            },
        };

        let (rows, faults) = match table {
            TableRef::Discrete(_) => {
                let (rows, faults) = fan_out(&markets, |m| self.discrete_rows(m, start, end, cancel))?;
                (Rows::Discrete(rows), faults)
            }
            TableRef::Continuous(_) => {
                let (rows, faults) = fan_out(&markets, |m| self.continuous_rows(m, start, end, cancel))?;
                (Rows::Continuous(rows), faults)
            }
        };

        if !faults.is_empty() {
            tracing::warn!(%table, faults = faults.len(), "select completed with faults");
        }
        tracing::debug!(%table, %start, %end, rows = rows.len(), ?version, "select");
        Ok(Selection::new(table.clone(), columns, version, rows, faults))
    }

    fn discrete_rows(
        &self,
        market: &MarketId,
        start: NaiveDate,
        end: NaiveDate,
        cancel: &CancelToken,
    ) -> Result<MarketPart<DiscreteRow>, MantleError> {
        let definition = self.require_market(market)?;
        let start = start.max(definition.inception);
        if start > end {
            return Ok((Vec::new(), Vec::new()));
        }
        let (first, last) = (YearMonth::of(start), YearMonth::of(end));

        let mut rows = Vec::new();
        let mut faults = Vec::new();
        for month in self.store.list_partitions(market)? {
            if month < first || month > last {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(MantleError::Cancelled);
            }
            match self.store.read_partition(&PartitionKey::new(market.clone(), month)) {
                Ok(Some(partition)) => rows.extend(
                    partition
                        .rows
                        .into_iter()
                        .filter(|bar| bar.date >= start && bar.date <= end)
                        .map(|bar| DiscreteRow {
                            market: market.clone(),
                            bar,
                        }),
                ),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(%market, %month, error = %e, "skipping unreadable partition");
                    faults.push(SelectFault::Partition {
                        market: market.clone(),
                        month,
                        source: Arc::new(e),
                    });
                }
            }
        }
        Ok((rows, faults))
    }

    fn continuous_rows(
        &self,
        market: &MarketId,
        start: NaiveDate,
        end: NaiveDate,
        cancel: &CancelToken,
    ) -> Result<MarketPart<ContinuousBar>, MantleError> {
        let (definition, calendar) = self.registry.market_context(market)?;
        let chain = self.registry.chain_for(market)?;
        let builder = ContinuousBuilder::new(&self.store, &definition, &calendar, &chain)
            .with_config(self.continuous)
            .with_cancel(cancel.clone());
        let series = builder.build(start, end).map_err(cancelled_or)?;

        let mut rows = Vec::new();
        let mut faults: Vec<SelectFault> = series
            .unreadable_months()
            .iter()
            .filter(|u| u.month >= YearMonth::of(start) && u.month <= YearMonth::of(end))
            .map(|u| SelectFault::Partition {
                market: market.clone(),
                month: u.month,
                source: Arc::clone(&u.source),
            })
            .collect();
        for item in &series {
            match item {
                Ok(bar) => rows.push(bar),
                Err(ContinuousError::Cancelled) => return Err(MantleError::Cancelled),
                Err(e) => match failed_date(&e) {
                    Some(date) => faults.push(SelectFault::Series {
                        market: market.clone(),
                        date,
                        source: e,
                    }),
                    None => faults.push(SelectFault::Market {
                        market: market.clone(),
                        reason: e.to_string(),
                    }),
                },
            }
        }
        Ok((rows, faults))
    }
}

/// Run `select_one` for every market, in parallel when there are several.
/// Only cancellation fails the query; any other error becomes a fault of
/// its market.
fn fan_out<T, F>(markets: &[MarketId], select_one: F) -> Result<MarketPart<T>, MantleError>
where
    T: Send,
    F: Fn(&MarketId) -> Result<MarketPart<T>, MantleError> + Sync,
{
    let isolate = |market: &MarketId| match select_one(market) {
        Err(MantleError::Cancelled) => Err(MantleError::Cancelled),
        Err(e) => {
            tracing::warn!(%market, error = %e, "market skipped");
            Ok((
                Vec::new(),
                vec![SelectFault::Market {
                    market: market.clone(),
                    reason: e.to_string(),
                }],
            ))
        }
        ok => ok,
    };
    let parts: Vec<Result<MarketPart<T>, MantleError>> = if markets.len() > 1 {
        markets.par_iter().map(isolate).collect()
    } else {
        markets.iter().map(isolate).collect()
    };

    let mut rows = Vec::new();
    let mut faults = Vec::new();
    for part in parts {
        let (part_rows, part_faults) = part?;
        rows.extend(part_rows);
        faults.extend(part_faults);
    }
    Ok((rows, faults))
}

fn cancelled_or(e: ContinuousError) -> MantleError {
    match e {
        ContinuousError::Cancelled => MantleError::Cancelled,
        e => MantleError::Continuous(e),
    }
}

fn failed_date(e: &ContinuousError) -> Option<NaiveDate> {
    match e {
        ContinuousError::DataGap(gap) => Some(gap.date),
        ContinuousError::Partition { date, .. } => Some(*date),
        ContinuousError::Store { .. } | ContinuousError::Cancelled | ContinuousError::InvalidRange { .. } => None,
    }
}
