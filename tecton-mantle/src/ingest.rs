//! Parallel batch ingestion.
//!
//! Jobs for distinct partition keys run concurrently on the rayon pool.
//! Jobs sharing a key run in submission order. Each market's chain is
//! refreshed once after the batch.

use crate::error::MantleError;
use crate::mantle::Mantle;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use tecton_core::domain::{ContractBar, ContractId, MarketId};
use tecton_core::store::PartitionManifest;
use tecton_core::{CancelToken, PartitionKey, WriteMode};

/// One partition write.
#[derive(Debug, Clone)]
pub struct IngestJob {
    pub key: PartitionKey,
    pub rows: Vec<ContractBar>,
    pub mode: WriteMode,
}

#[derive(Debug)]
pub enum IngestStatus {
    Published(PartitionManifest),
    Failed(MantleError),
    /// Not attempted: the batch was cancelled first.
    Skipped,
}

#[derive(Debug)]
pub struct IngestOutcome {
    pub key: PartitionKey,
    pub status: IngestStatus,
}

/// Per-job outcomes in submission order, plus chain changes.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub outcomes: Vec<IngestOutcome>,
    /// Contracts appended to each market's chain by this batch.
    pub appended: BTreeMap<MarketId, Vec<ContractId>>,
}

impl IngestReport {
    pub fn published(&self) -> usize {
        self.count(|s| matches!(s, IngestStatus::Published(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, IngestStatus::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, IngestStatus::Skipped))
    }

    fn count(&self, pred: impl Fn(&IngestStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }
}

impl Mantle {
    /// Write a batch of partitions. A failing job does not stop the others;
    /// cancellation skips every job not yet started.
    pub fn ingest_batch(&self, jobs: Vec<IngestJob>, cancel: &CancelToken) -> IngestReport {
        let total = jobs.len();
        let mut groups: BTreeMap<PartitionKey, Vec<(usize, IngestJob)>> = BTreeMap::new();
        for (index, job) in jobs.into_iter().enumerate() {
            groups.entry(job.key.clone()).or_default().push((index, job));
        }

        let mut outcomes: Vec<(usize, IngestOutcome)> = groups
            .into_par_iter()
            .flat_map_iter(|(_, group)| {
                group
                    .into_iter()
                    .map(|(index, job)| (index, self.run_job(job, cancel)))
                    .collect::<Vec<_>>()
            })
            .collect();
        outcomes.sort_by_key(|(index, _)| *index);

        let touched: BTreeSet<MarketId> = outcomes
            .iter()
            .filter(|(_, o)| matches!(o.status, IngestStatus::Published(_)))
            .map(|(_, o)| o.key.market.clone())
            .collect();
        let mut appended = BTreeMap::new();
        for market in touched {
            match self.refresh_chain(&market) {
                Ok(refresh) if !refresh.appended.is_empty() => {
                    appended.insert(market, refresh.appended);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(%market, error = %e, "chain refresh failed after ingest"),
            }
        }

        let report = IngestReport {
            outcomes: outcomes.into_iter().map(|(_, o)| o).collect(),
            appended,
        };
        tracing::info!(
            jobs = total,
            published = report.published(),
            failed = report.failed(),
            skipped = report.skipped(),
            "ingest batch finished"
        );
        report
    }

    fn run_job(&self, job: IngestJob, cancel: &CancelToken) -> IngestOutcome {
        let IngestJob { key, rows, mode } = job;
        if cancel.is_cancelled() {
            return IngestOutcome {
                key,
                status: IngestStatus::Skipped,
            };
        }
        let result = self
            .require_market(&key.market)
            .and_then(|_| Ok(self.store().write_partition(&key, rows, mode)?));
        let status = match result {
            Ok(manifest) => IngestStatus::Published(manifest),
            Err(e) => {
                tracing::warn!(partition = %key, error = %e, "ingest job failed");
                IngestStatus::Failed(e)
            }
        };
        IngestOutcome { key, status }
    }
}
