//! Tecton Core — futures data layer.
//!
//! This crate holds everything between raw per-contract bars and an
//! analysis-ready continuous series:
//! - Domain types (markets, calendars, contracts, chains, month arithmetic)
//! - Month-partitioned Parquet store with versioned manifests
//! - Market registry with append-only universe versions
//! - Roll policy trait and the expiry-offset policy
//! - Lazily evaluated, back-adjusted continuous series

pub mod cancel;
pub mod config;
pub mod continuous;
pub mod domain;
pub mod registry;
pub mod roll;
pub mod store;

pub use cancel::CancelToken;
pub use continuous::{
    AdjustmentMode, BarStatus, ContinuousBar, ContinuousBuilder, ContinuousConfig, ContinuousError,
    ContinuousSeries, DataGapError, GapReason, RollRecord, UnreadableMonth,
};
pub use registry::{MarketRegistry, RegisterOutcome, RegistryError, UniverseVersion};
pub use roll::{ExpiryOffsetRoll, OpenInterestRoll, RollEvent, RollPolicy};
pub use store::{PartitionKey, PartitionStore, StoreError, WriteMode};
