//! Tecton Mantle — the single query entry point over the futures data layer.
//!
//! This crate builds on `tecton-core` to provide:
//! - `select(table, start, end, columns)` over discrete and continuous tables
//! - Table references (`discrete:CL`, `continuous:*`) and column projection
//! - Selections with localized faults and Polars export
//! - Facade configuration (data directory, markets file, continuous defaults)
//! - Parallel batch ingestion with cooperative cancellation

pub mod config;
pub mod error;
pub mod ingest;
pub mod mantle;
pub mod selection;
pub mod table;

pub use config::MantleConfig;
pub use error::MantleError;
pub use ingest::{IngestJob, IngestOutcome, IngestReport, IngestStatus};
pub use mantle::Mantle;
pub use selection::{DiscreteRow, Rows, SelectFault, Selection};
pub use table::{Scope, TableRef};

/// The facade under its other name.
pub type Scout = Mantle;
