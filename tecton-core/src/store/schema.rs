//! Partition schema contract.
//!
//! Every partition file carries one row per (date, contract), sorted by date
//! then contract. `open_interest` was introduced after the first partitions
//! were written, so it is optional on read and nullable.

use crate::domain::{ContractBar, ContractId, MarketId, YearMonth};
use chrono::NaiveDate;
use polars::prelude::*;
use std::collections::HashSet;

pub const REQUIRED_COLUMNS: [&str; 7] = ["date", "contract", "open", "high", "low", "close", "volume"];
pub const OPTIONAL_COLUMNS: [&str; 1] = ["open_interest"];

/// Expected schema for partition data
pub struct PartitionSchema;

impl PartitionSchema {
    /// Required columns with their types
    pub fn required() -> Schema {
        Schema::from_iter(vec![
            Field::new("date".into(), DataType::Date),
            Field::new("contract".into(), DataType::String),
            Field::new("open".into(), DataType::Float64),
            Field::new("high".into(), DataType::Float64),
            Field::new("low".into(), DataType::Float64),
            Field::new("close".into(), DataType::Float64),
            Field::new("volume".into(), DataType::UInt64),
        ])
    }

    /// Columns that may be absent in older partitions
    pub fn optional() -> Schema {
        Schema::from_iter(vec![Field::new("open_interest".into(), DataType::UInt64)])
    }

    /// Validate a decoded DataFrame against the contract
    pub fn validate(df: &DataFrame) -> Result<(), SchemaError> {
        let actual = df.schema();

        for field in Self::required().iter_fields() {
            let actual_dtype = actual
                .get(field.name())
                .ok_or_else(|| SchemaError::MissingColumn(field.name().to_string()))?;
            if actual_dtype != field.dtype() {
                return Err(SchemaError::TypeMismatch {
                    column: field.name().to_string(),
                    expected: field.dtype().clone(),
                    actual: actual_dtype.clone(),
                });
            }
        }

        for field in Self::optional().iter_fields() {
            if let Some(actual_dtype) = actual.get(field.name()) {
                if actual_dtype != field.dtype() {
                    return Err(SchemaError::TypeMismatch {
                        column: field.name().to_string(),
                        expected: field.dtype().clone(),
                        actual: actual_dtype.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Validate rows destined for one (market, month) partition.
    pub fn validate_rows(
        market: &MarketId,
        month: YearMonth,
        rows: &[ContractBar],
    ) -> Result<(), SchemaError> {
        if rows.is_empty() {
            return Err(SchemaError::Empty);
        }
        let mut seen: HashSet<(NaiveDate, &ContractId)> = HashSet::with_capacity(rows.len());
        for row in rows {
            if !month.contains(row.date) {
                return Err(SchemaError::OutsideMonth {
                    date: row.date,
                    month,
                });
            }
            if !row.contract.belongs_to(market) {
                return Err(SchemaError::ForeignContract {
                    contract: row.contract.clone(),
                    market: market.clone(),
                });
            }
            if !row.is_sane() {
                return Err(SchemaError::InvalidPrices {
                    date: row.date,
                    contract: row.contract.clone(),
                });
            }
            if !seen.insert((row.date, &row.contract)) {
                return Err(SchemaError::DuplicateRow {
                    date: row.date,
                    contract: row.contract.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Missing required column: {0}")]
    MissingColumn(String),

    #[error("Type mismatch in column {column}: expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        column: String,
        expected: DataType,
        actual: DataType,
    },

    #[error("no rows")]
    Empty,

    #[error("row dated {date} lies outside {month}")]
    OutsideMonth { date: NaiveDate, month: YearMonth },

    #[error("contract {contract} does not belong to market {market}")]
    ForeignContract { contract: ContractId, market: MarketId },

    #[error("duplicate row for {contract} on {date}")]
    DuplicateRow { date: NaiveDate, contract: ContractId },

    #[error("non-finite or inverted prices for {contract} on {date}")]
    InvalidPrices { date: NaiveDate, contract: ContractId },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(date: &str, contract: &str) -> ContractBar {
        ContractBar {
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            contract: ContractId::from(contract),
            open: 77.0,
            high: 78.0,
            low: 76.0,
            close: 77.5,
            volume: 100,
            open_interest: None,
        }
    }

    fn nov() -> YearMonth {
        YearMonth::new(2023, 11).unwrap()
    }

    #[test]
    fn test_required_schema_lists_contract_columns() {
        let schema = PartitionSchema::required();
        for name in REQUIRED_COLUMNS {
            assert!(schema.contains(name), "missing {name}");
        }
        assert!(!schema.contains("open_interest"));
        assert!(PartitionSchema::optional().contains(OPTIONAL_COLUMNS[0]));
    }

    #[test]
    fn test_validate_accepts_frame_without_open_interest() {
        let date = Series::new("date".into(), &[19_675i32])
            .cast(&DataType::Date)
            .unwrap();
        let df = DataFrame::new(vec![
            Column::Series(date.into()),
            Column::Series(Series::new("contract".into(), &["CLZ23"]).into()),
            Column::Series(Series::new("open".into(), &[77.0]).into()),
            Column::Series(Series::new("high".into(), &[78.0]).into()),
            Column::Series(Series::new("low".into(), &[76.0]).into()),
            Column::Series(Series::new("close".into(), &[77.5]).into()),
            Column::Series(Series::new("volume".into(), &[100u64]).into()),
        ])
        .unwrap();
        assert!(PartitionSchema::validate(&df).is_ok());
    }

    #[test]
    fn test_validate_rejects_wrong_type() {
        let date = Series::new("date".into(), &[19_675i32])
            .cast(&DataType::Date)
            .unwrap();
        let df = DataFrame::new(vec![
            Column::Series(date.into()),
            Column::Series(Series::new("contract".into(), &["CLZ23"]).into()),
            Column::Series(Series::new("open".into(), &[77.0]).into()),
            Column::Series(Series::new("high".into(), &[78.0]).into()),
            Column::Series(Series::new("low".into(), &[76.0]).into()),
            Column::Series(Series::new("close".into(), &[77.5]).into()),
            Column::Series(Series::new("volume".into(), &[100.0]).into()),
        ])
        .unwrap();
        assert!(matches!(
            PartitionSchema::validate(&df),
            Err(SchemaError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_rows() {
        let cl = MarketId::from("CL");
        let ok = vec![bar("2023-11-14", "CLZ23"), bar("2023-11-14", "CLF24")];
        assert!(PartitionSchema::validate_rows(&cl, nov(), &ok).is_ok());

        let outside = vec![bar("2023-12-01", "CLZ23")];
        assert!(matches!(
            PartitionSchema::validate_rows(&cl, nov(), &outside),
            Err(SchemaError::OutsideMonth { .. })
        ));

        let foreign = vec![bar("2023-11-14", "NGZ23")];
        assert!(matches!(
            PartitionSchema::validate_rows(&cl, nov(), &foreign),
            Err(SchemaError::ForeignContract { .. })
        ));

        let longer_root = vec![bar("2023-11-14", "SMZ23")];
        assert!(matches!(
            PartitionSchema::validate_rows(&MarketId::from("S"), nov(), &longer_root),
            Err(SchemaError::ForeignContract { .. })
        ));

        let dup = vec![bar("2023-11-14", "CLZ23"), bar("2023-11-14", "CLZ23")];
        assert!(matches!(
            PartitionSchema::validate_rows(&cl, nov(), &dup),
            Err(SchemaError::DuplicateRow { .. })
        ));

        assert!(matches!(
            PartitionSchema::validate_rows(&cl, nov(), &[]),
            Err(SchemaError::Empty)
        ));
    }
}
