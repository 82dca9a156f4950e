//! Ordered contract chains.
//!
//! A chain lists a market's contracts by expiry. It is built from the
//! market's delivery cycle (theory) combined with the contract codes actually
//! found in storage (reality), and afterwards only grows at the far end.

use super::calendar::ExchangeCalendar;
use super::contract::Contract;
use super::ids::{ContractId, MarketId};
use super::market::MarketDefinition;
use super::month::YearMonth;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractChain {
    market: MarketId,
    contracts: Vec<Contract>,
}

/// A contract left out of a chain, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedContract {
    pub contract: ContractId,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SkipReason {
    /// The code does not parse as `ROOT + month code + year`.
    Unparseable,
    /// Neither an override nor the expiry rule yields a date.
    NoExpiry,
    /// Another contract already expires that day and sorts first.
    SharedExpiry { kept: ContractId },
    /// Appending would insert before the current end of the chain.
    BeforeChainEnd { last_expiry: NaiveDate },
}

/// Result of building or extending a chain.
#[derive(Debug, Clone)]
pub struct ChainBuild {
    pub chain: ContractChain,
    pub skipped: Vec<SkippedContract>,
}

impl ContractChain {
    pub fn new(market: MarketId) -> Self {
        Self {
            market,
            contracts: Vec::new(),
        }
    }

    /// Build a chain from the delivery cycle and the contracts observed in storage.
    ///
    /// `last_observed` is the latest stored partition month. Theoretical
    /// contracts expiring inside the observed window are kept only if storage
    /// has rows for them; later ones are kept so the chain reaches past the
    /// data. Contracts expiring before the market's inception are dropped.
    pub fn build(
        definition: &MarketDefinition,
        calendar: &ExchangeCalendar,
        observed: &BTreeSet<ContractId>,
        last_observed: Option<YearMonth>,
    ) -> ChainBuild {
        let horizon = last_observed.map(|m| m.last_day());
        let first_year = definition.inception.year();
        let last_year = last_observed.map_or(first_year, |m| m.year.max(first_year)) + 1;

        let mut candidates: BTreeMap<ContractId, YearMonth> = BTreeMap::new();
        let mut skipped = Vec::new();

        for year in first_year..=last_year {
            for &month in definition.cycle.months() {
                let delivery = YearMonth { year, month };
                let id = definition.contract_id(delivery);
                let keep = observed.contains(&id)
                    || match (horizon, definition.expiry_of(delivery, calendar)) {
                        (Some(h), Some(expiry)) => expiry > h,
                        (None, _) => true,
                        (Some(_), None) => false,
                    };
                if keep {
                    candidates.insert(id, delivery);
                }
            }
        }

        for id in observed {
            if candidates.contains_key(id) {
                continue;
            }
            match definition.delivery_of(id) {
                Some(delivery) => {
                    candidates.insert(id.clone(), delivery);
                }
                None => skipped.push(SkippedContract {
                    contract: id.clone(),
                    reason: SkipReason::Unparseable,
                }),
            }
        }

        let mut contracts = Vec::with_capacity(candidates.len());
        for (id, delivery) in candidates {
            match definition.expiry_of(delivery, calendar) {
                Some(expiry) if expiry >= definition.inception => contracts.push(Contract {
                    id,
                    market: definition.id.clone(),
                    delivery,
                    expiry,
                }),
                Some(_) => {}
                None => skipped.push(SkippedContract {
                    contract: id,
                    reason: SkipReason::NoExpiry,
                }),
            }
        }
        contracts.sort_by_key(|c| c.sort_key());

        let mut chain = ContractChain::new(definition.id.clone());
        for contract in contracts {
            match chain.contracts.last() {
                Some(last) if last.expiry == contract.expiry => {
                    tracing::warn!(
                        market = %definition.id,
                        kept = %last.id,
                        skipped = %contract.id,
                        expiry = %contract.expiry,
                        "two contracts share an expiry"
                    );
                    skipped.push(SkippedContract {
                        contract: contract.id,
                        reason: SkipReason::SharedExpiry {
                            kept: last.id.clone(),
                        },
                    });
                }
                _ => chain.contracts.push(contract),
            }
        }

        ChainBuild { chain, skipped }
    }

    /// Append a newly discovered contract. Only the far end of a chain may grow.
    pub fn append(&mut self, contract: Contract) -> Result<(), ChainError> {
        if contract.market != self.market || !contract.id.belongs_to(&self.market) {
            return Err(ChainError::ForeignContract {
                market: self.market.clone(),
                contract: contract.id,
            });
        }
        if self.get(&contract.id).is_some() {
            return Err(ChainError::AlreadyListed { contract: contract.id });
        }
        if let Some(last) = self.contracts.last() {
            if contract.expiry <= last.expiry {
                return Err(ChainError::NotAfterLast {
                    contract: contract.id,
                    expiry: contract.expiry,
                    last_expiry: last.expiry,
                });
            }
        }
        self.contracts.push(contract);
        Ok(())
    }

    /// Extend this chain with every contract of `rebuilt` that expires after
    /// the current last contract. Contracts that would land earlier are
    /// reported, never inserted.
    pub fn extended_with(&self, rebuilt: &ContractChain) -> ChainBuild {
        let mut chain = self.clone();
        let mut skipped = Vec::new();
        for contract in &rebuilt.contracts {
            if chain.get(&contract.id).is_some() {
                continue;
            }
            match chain.last() {
                Some(last) if contract.expiry <= last.expiry => skipped.push(SkippedContract {
                    contract: contract.id.clone(),
                    reason: SkipReason::BeforeChainEnd {
                        last_expiry: last.expiry,
                    },
                }),
                _ => chain.contracts.push(contract.clone()),
            }
        }
        ChainBuild { chain, skipped }
    }

    pub fn market(&self) -> &MarketId {
        &self.market
    }

    pub fn contracts(&self) -> &[Contract] {
        &self.contracts
    }

    pub fn get(&self, id: &ContractId) -> Option<&Contract> {
        self.contracts.iter().find(|c| &c.id == id)
    }

    pub fn last(&self) -> Option<&Contract> {
        self.contracts.last()
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChainError {
    #[error("contract {contract} does not belong to market {market}")]
    ForeignContract { market: MarketId, contract: ContractId },

    #[error("contract {contract} is already in the chain")]
    AlreadyListed { contract: ContractId },

    #[error("contract {contract} expires {expiry}, not after the chain end {last_expiry}")]
    NotAfterLast {
        contract: ContractId,
        expiry: NaiveDate,
        last_expiry: NaiveDate,
    },
}
