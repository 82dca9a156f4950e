//! Facade-level errors.
//!
//! Only failures that make a whole query meaningless surface here. Faults
//! confined to one market or one month travel inside the
//! [`Selection`](crate::Selection) instead.

use tecton_core::domain::MarketId;
use tecton_core::{ContinuousError, RegistryError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MantleError {
    #[error("invalid table reference '{0}': expected `discrete:<MARKET>` or `continuous:<MARKET>`, `*` for the universe")]
    InvalidTable(String),

    #[error("table {table} has no column '{column}'")]
    UnknownColumn { table: String, column: String },

    #[error("unknown market {0}")]
    UnknownMarket(MarketId),

    #[error("invalid range: start {start} is after end {end}")]
    InvalidRange {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },

    #[error("query cancelled")]
    Cancelled,

    #[error("dataframe export: {0}")]
    Export(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Continuous(#[from] ContinuousError),
}
