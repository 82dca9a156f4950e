//! Market registry: definitions, calendars, contract chains, and the
//! append-only log of universe versions.
//!
//! The registry has one writer (the ingestion path) and many readers.
//! Chains and contract metadata are derived from stored partitions on first
//! use and memoized; concurrent derivations of the same key produce identical
//! values, and the first one stored wins.

use crate::config::{ConfigError, MarketsConfig};
use crate::domain::{
    CalendarId, ChainBuild, ContractChain, ContractId, ContractMetadata, ExchangeCalendar, MarketDefinition,
    MarketError, MarketId, SkippedContract,
};
use crate::store::{PartitionKey, PartitionStore, StoreError};
use chrono::NaiveDate;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

/// Result of registering a market or calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterOutcome {
    /// New entry; for markets, a new universe version was appended.
    Added,
    /// Identical to what is already registered.
    Unchanged,
    /// Descriptive fields changed or the currency history was extended.
    Amended,
}

/// Snapshot of the tradeable universe. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniverseVersion {
    pub id: u64,
    /// Member markets with their inception dates.
    pub markets: BTreeMap<MarketId, NaiveDate>,
    pub created_at: chrono::NaiveDateTime,
}

impl UniverseVersion {
    pub fn contains(&self, market: &MarketId) -> bool {
        self.markets.contains_key(market)
    }

    pub fn market_ids(&self) -> impl Iterator<Item = &MarketId> {
        self.markets.keys()
    }
}

/// Outcome of extending a memoized chain after new partitions arrived.
#[derive(Debug, Clone)]
pub struct ChainRefresh {
    pub chain: Arc<ContractChain>,
    pub appended: Vec<ContractId>,
    /// Contracts that would have landed before the chain's end.
    pub ignored: Vec<SkippedContract>,
}

#[derive(Default)]
struct RegistryState {
    definitions: BTreeMap<MarketId, Arc<MarketDefinition>>,
    calendars: BTreeMap<CalendarId, Arc<ExchangeCalendar>>,
    versions: Vec<Arc<UniverseVersion>>,
}

pub struct MarketRegistry {
    store: Arc<PartitionStore>,
    state: RwLock<RegistryState>,
    chains: DashMap<MarketId, Arc<ContractChain>>,
    /// Serializes refreshes of one market so a slower rebuild never replaces
    /// a longer chain.
    refreshing: DashMap<MarketId, Arc<Mutex<()>>>,
    metadata: DashMap<ContractId, ContractMetadata>,
}

impl MarketRegistry {
    pub fn new(store: Arc<PartitionStore>) -> Self {
        Self {
            store,
            state: RwLock::new(RegistryState::default()),
            chains: DashMap::new(),
            refreshing: DashMap::new(),
            metadata: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<PartitionStore> {
        &self.store
    }

    // ── Registration ────────────────────────────────────────────────

    pub fn register_calendar(&self, calendar: ExchangeCalendar) -> Result<RegisterOutcome, RegistryError> {
        let mut state = self.state.write();
        match state.calendars.get(&calendar.id) {
            Some(existing) if **existing == calendar => Ok(RegisterOutcome::Unchanged),
            Some(_) => Err(RegistryError::CalendarConflict { calendar: calendar.id }),
            None => {
                tracing::info!(calendar = %calendar.id, holidays = calendar.holidays.len(), "registered calendar");
                state.calendars.insert(calendar.id.clone(), Arc::new(calendar));
                Ok(RegisterOutcome::Added)
            }
        }
    }

    /// Register a market definition.
    ///
    /// New markets append a universe version. Re-registering an identical
    /// definition is a no-op. Descriptive fields may change and the currency
    /// history may grow at its end; any other difference is a conflict.
    pub fn register(&self, definition: MarketDefinition) -> Result<RegisterOutcome, RegistryError> {
        definition.validate()?;
        let mut state = self.state.write();
        if !state.calendars.contains_key(&definition.calendar) {
            return Err(RegistryError::UnknownCalendar {
                market: definition.id,
                calendar: definition.calendar,
            });
        }

        let Some(existing) = state.definitions.get(&definition.id).cloned() else {
            let mut markets = state
                .versions
                .last()
                .map(|v| v.markets.clone())
                .unwrap_or_default();
            markets.insert(definition.id.clone(), definition.inception);
            let version = UniverseVersion {
                id: state.versions.len() as u64 + 1,
                markets,
                created_at: chrono::Local::now().naive_local(),
            };
            tracing::info!(market = %definition.id, version = version.id, "registered market");
            state.versions.push(Arc::new(version));
            state
                .definitions
                .insert(definition.id.clone(), Arc::new(definition));
            return Ok(RegisterOutcome::Added);
        };

        if *existing == definition {
            return Ok(RegisterOutcome::Unchanged);
        }
        if let Some(field) = existing.immutable_fields_differ(&definition) {
            return Err(RegistryError::ConfigConflict {
                market: definition.id,
                field,
            });
        }
        if !definition.currencies.starts_with(&existing.currencies) {
            return Err(RegistryError::ConfigConflict {
                market: definition.id,
                field: "currency",
            });
        }

        tracing::info!(market = %definition.id, "amended market definition");
        state
            .definitions
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(RegisterOutcome::Amended)
    }

    /// Register every calendar, then every market, of a config file.
    pub fn load_config(&self, config: &MarketsConfig) -> Result<Vec<(MarketId, RegisterOutcome)>, RegistryError> {
        for calendar in config.calendars() {
            self.register_calendar(calendar)?;
        }
        config
            .definitions()?
            .into_iter()
            .map(|def| {
                let id = def.id.clone();
                self.register(def).map(|outcome| (id, outcome))
            })
            .collect()
    }

    // ── Lookups ─────────────────────────────────────────────────────

    pub fn definition(&self, market: &MarketId) -> Option<Arc<MarketDefinition>> {
        self.state.read().definitions.get(market).cloned()
    }

    pub fn calendar(&self, calendar: &CalendarId) -> Option<Arc<ExchangeCalendar>> {
        self.state.read().calendars.get(calendar).cloned()
    }

    /// A market's definition with its calendar.
    pub fn market_context(
        &self,
        market: &MarketId,
    ) -> Result<(Arc<MarketDefinition>, Arc<ExchangeCalendar>), RegistryError> {
        let state = self.state.read();
        let definition = state
            .definitions
            .get(market)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownMarket(market.clone()))?;
        let calendar = state
            .calendars
            .get(&definition.calendar)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownCalendar {
                market: market.clone(),
                calendar: definition.calendar.clone(),
            })?;
        Ok((definition, calendar))
    }

    /// All registered definitions, ascending by id.
    pub fn markets(&self) -> Vec<Arc<MarketDefinition>> {
        self.state.read().definitions.values().cloned().collect()
    }

    /// Definitions matching an asset class and/or sector.
    pub fn filter(&self, asset_class: Option<&str>, sector: Option<&str>) -> Vec<Arc<MarketDefinition>> {
        self.state
            .read()
            .definitions
            .values()
            .filter(|m| asset_class.map_or(true, |a| m.asset_class == a))
            .filter(|m| sector.map_or(true, |s| m.sector == s))
            .cloned()
            .collect()
    }

    pub fn asset_classes(&self) -> BTreeSet<String> {
        self.state
            .read()
            .definitions
            .values()
            .map(|m| m.asset_class.clone())
            .collect()
    }

    pub fn sectors(&self) -> BTreeSet<String> {
        self.state
            .read()
            .definitions
            .values()
            .map(|m| m.sector.clone())
            .collect()
    }

    // ── Universe versions ───────────────────────────────────────────

    pub fn current_version(&self) -> Option<Arc<UniverseVersion>> {
        self.state.read().versions.last().cloned()
    }

    pub fn version(&self, id: u64) -> Option<Arc<UniverseVersion>> {
        let index = usize::try_from(id.checked_sub(1)?).ok()?;
        self.state.read().versions.get(index).cloned()
    }

    pub fn versions(&self) -> Vec<Arc<UniverseVersion>> {
        self.state.read().versions.clone()
    }

    // ── Chains ──────────────────────────────────────────────────────

    /// The market's contract chain, built from storage on first use.
    pub fn chain_for(&self, market: &MarketId) -> Result<Arc<ContractChain>, RegistryError> {
        if let Some(chain) = self.chains.get(market) {
            return Ok(Arc::clone(&chain));
        }
        let built = Arc::new(self.build_chain(market)?.chain);
        Ok(Arc::clone(self.chains.entry(market.clone()).or_insert(built).value()))
    }

    /// Extend the memoized chain with contracts found since it was built.
    pub fn refresh_chain(&self, market: &MarketId) -> Result<ChainRefresh, RegistryError> {
        let lock = Arc::clone(self.refreshing.entry(market.clone()).or_default().value());
        let _refreshing = lock.lock();

        let Some(current) = self.chains.get(market).map(|c| Arc::clone(&c)) else {
            let chain = self.chain_for(market)?;
            return Ok(ChainRefresh {
                appended: chain.contracts().iter().map(|c| c.id.clone()).collect(),
                chain,
                ignored: Vec::new(),
            });
        };

        let rebuilt = self.build_chain(market)?.chain;
        let ChainBuild { chain, skipped } = current.extended_with(&rebuilt);
        let appended: Vec<ContractId> = chain.contracts()[current.len()..]
            .iter()
            .map(|c| c.id.clone())
            .collect();
        for ignored in &skipped {
            tracing::warn!(%market, contract = %ignored.contract, reason = ?ignored.reason, "contract not added to chain");
        }
        if !appended.is_empty() {
            tracing::info!(%market, appended = appended.len(), "extended contract chain");
        }

        let chain = Arc::new(chain);
        self.chains.insert(market.clone(), Arc::clone(&chain));
        Ok(ChainRefresh {
            chain,
            appended,
            ignored: skipped,
        })
    }

    /// Chain from every readable manifest. A corrupt manifest drops only its
    /// own month's contracts.
    fn build_chain(&self, market: &MarketId) -> Result<ChainBuild, RegistryError> {
        let (definition, calendar) = self.market_context(market)?;
        let mut observed = BTreeSet::new();
        let mut latest = None;
        for month in self.store.list_partitions(market)? {
            let key = PartitionKey::new(market.clone(), month);
            match self.store.manifest(&key) {
                Ok(Some(manifest)) => {
                    observed.extend(manifest.contracts);
                    latest = Some(month);
                }
                Ok(None) => {}
                Err(e) if e.is_corruption() => {
                    tracing::warn!(partition = %key, error = %e, "manifest unreadable, chain skips it");
                }
                Err(e) => return Err(e.into()),
            }
        }
        let build = ContractChain::build(&definition, &calendar, &observed, latest);
        for skipped in &build.skipped {
            tracing::warn!(%market, contract = %skipped.contract, reason = ?skipped.reason, "skipped contract");
        }
        tracing::debug!(%market, contracts = build.chain.len(), "built contract chain");
        Ok(build)
    }

    // ── Contract metadata ───────────────────────────────────────────

    /// Market a contract code belongs to: the longest registered root that
    /// parses the code.
    pub fn market_of(&self, contract: &ContractId) -> Option<Arc<MarketDefinition>> {
        self.state
            .read()
            .definitions
            .values()
            .filter(|m| m.delivery_of(contract).is_some())
            .max_by_key(|m| m.id.as_str().len())
            .cloned()
    }

    /// First-trade date and multiplier of a contract, found by scanning its
    /// market's partitions in ascending order. `Ok(None)` if no row exists yet.
    pub fn resolve_metadata(&self, contract: &ContractId) -> Result<Option<ContractMetadata>, RegistryError> {
        if let Some(meta) = self.metadata.get(contract) {
            return Ok(Some(meta.clone()));
        }
        let definition = self
            .market_of(contract)
            .ok_or_else(|| RegistryError::NoMarketForContract(contract.clone()))?;
        let market = &definition.id;

        let mut first_trade = None;
        for month in self.store.list_partitions(market)? {
            let key = PartitionKey::new(market.clone(), month);
            let listed = self
                .store
                .manifest(&key)?
                .is_some_and(|m| m.contracts.contains(contract));
            if !listed {
                continue;
            }
            if let Some(partition) = self.store.read_partition(&key)? {
                first_trade = partition
                    .rows
                    .iter()
                    .find(|r| &r.contract == contract)
                    .map(|r| r.date);
            }
            if first_trade.is_some() {
                break;
            }
        }
        let Some(first_trade) = first_trade else {
            return Ok(None);
        };

        let expiry = match self.chain_for(market)?.get(contract) {
            Some(c) => Some(c.expiry),
            None => {
                let (_, calendar) = self.market_context(market)?;
                definition
                    .delivery_of(contract)
                    .and_then(|delivery| definition.expiry_of(delivery, &calendar))
            }
        };
        if let Some(expiry) = expiry {
            if expiry <= first_trade {
                return Err(RegistryError::ExpiryNotAfterFirstTrade {
                    contract: contract.clone(),
                    expiry,
                    first_trade,
                });
            }
        }

        let resolved = ContractMetadata {
            contract: contract.clone(),
            first_trade,
            multiplier: definition.multiplier_on(first_trade),
        };
        let stored = self.metadata.entry(contract.clone()).or_insert(resolved);
        Ok(Some(stored.value().clone()))
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("market {market}: {field} differs from the registered definition")]
    ConfigConflict { market: MarketId, field: &'static str },

    #[error("calendar {calendar} differs from the registered calendar")]
    CalendarConflict { calendar: CalendarId },

    #[error("market {market} references unknown calendar {calendar}")]
    UnknownCalendar { market: MarketId, calendar: CalendarId },

    #[error("unknown market {0}")]
    UnknownMarket(MarketId),

    #[error("no registered market parses contract {0}")]
    NoMarketForContract(ContractId),

    #[error("contract {contract} expires {expiry}, not after its first trade {first_trade}")]
    ExpiryNotAfterFirstTrade {
        contract: ContractId,
        expiry: NaiveDate,
        first_trade: NaiveDate,
    },

    #[error(transparent)]
    InvalidDefinition(#[from] MarketError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
