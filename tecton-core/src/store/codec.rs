//! Parquet encoding of partition rows.

use super::error::StoreError;
use super::schema::PartitionSchema;
use crate::domain::{ContractBar, ContractId};
use chrono::{DateTime, NaiveDate};
use polars::prelude::*;
use std::io::Cursor;

fn epoch() -> NaiveDate {
    DateTime::UNIX_EPOCH.date_naive()
}

/// Convert rows to a Polars DataFrame in storage layout.
pub fn rows_to_dataframe(rows: &[ContractBar]) -> Result<DataFrame, StoreError> {
    let epoch = epoch();
    let dates: Vec<i32> = rows
        .iter()
        .map(|r| (r.date - epoch).num_days() as i32)
        .collect();
    let contracts: Vec<&str> = rows.iter().map(|r| r.contract.as_str()).collect();
    let opens: Vec<f64> = rows.iter().map(|r| r.open).collect();
    let highs: Vec<f64> = rows.iter().map(|r| r.high).collect();
    let lows: Vec<f64> = rows.iter().map(|r| r.low).collect();
    let closes: Vec<f64> = rows.iter().map(|r| r.close).collect();
    let volumes: Vec<u64> = rows.iter().map(|r| r.volume).collect();
    let open_interest: Vec<Option<u64>> = rows.iter().map(|r| r.open_interest).collect();

    DataFrame::new(vec![
        Column::new("date".into(), dates)
            .cast(&DataType::Date)
            .map_err(|e| StoreError::Codec(format!("date cast: {e}")))?,
        Column::new("contract".into(), contracts),
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
        Column::new("open_interest".into(), open_interest),
    ])
    .map_err(|e| StoreError::Codec(format!("dataframe creation: {e}")))
}

/// Encode a DataFrame as parquet bytes.
pub fn encode(df: &mut DataFrame) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    ParquetWriter::new(&mut buf)
        .finish(df)
        .map_err(|e| StoreError::Codec(format!("write parquet: {e}")))?;
    Ok(buf)
}

/// Decode parquet bytes into a schema-checked DataFrame.
pub fn decode(bytes: &[u8]) -> Result<DataFrame, StoreError> {
    let df = ParquetReader::new(Cursor::new(bytes))
        .finish()
        .map_err(|e| StoreError::Codec(format!("read parquet: {e}")))?;
    PartitionSchema::validate(&df).map_err(|e| StoreError::Codec(e.to_string()))?;
    Ok(df)
}

/// Convert a storage DataFrame back to rows. A missing `open_interest`
/// column reads as `None` on every row; a null in any other column is an
/// error.
pub fn dataframe_to_rows(df: &DataFrame) -> Result<Vec<ContractBar>, StoreError> {
    let map_err = |e: PolarsError| StoreError::Codec(format!("column read: {e}"));

    let date_ca = df.column("date").map_err(map_err)?.date().map_err(map_err)?;
    let contract_ca = df.column("contract").map_err(map_err)?.str().map_err(map_err)?;
    let open_ca = df.column("open").map_err(map_err)?.f64().map_err(map_err)?;
    let high_ca = df.column("high").map_err(map_err)?.f64().map_err(map_err)?;
    let low_ca = df.column("low").map_err(map_err)?.f64().map_err(map_err)?;
    let close_ca = df.column("close").map_err(map_err)?.f64().map_err(map_err)?;
    let vol_ca = df.column("volume").map_err(map_err)?.u64().map_err(map_err)?;
    let oi_ca = match df.column("open_interest") {
        Ok(col) => Some(col.u64().map_err(map_err)?),
        Err(_) => None,
    };

    let epoch = epoch();
    let n = df.height();
    let mut rows = Vec::with_capacity(n);
    for i in 0..n {
        let days = date_ca
            .get(i)
            .ok_or_else(|| StoreError::Codec(format!("null date at row {i}")))?;
        let contract = contract_ca
            .get(i)
            .ok_or_else(|| StoreError::Codec(format!("null contract at row {i}")))?;

        let price = |ca: &Float64Chunked, name: &str| {
            ca.get(i)
                .ok_or_else(|| StoreError::Codec(format!("null {name} at row {i}")))
        };

        rows.push(ContractBar {
            date: epoch + chrono::Duration::days(days as i64),
            contract: ContractId::from(contract),
            open: price(open_ca, "open")?,
            high: price(high_ca, "high")?,
            low: price(low_ca, "low")?,
            close: price(close_ca, "close")?,
            volume: vol_ca
                .get(i)
                .ok_or_else(|| StoreError::Codec(format!("null volume at row {i}")))?,
            open_interest: oi_ca.and_then(|ca| ca.get(i)),
        });
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<ContractBar> {
        vec![
            ContractBar {
                date: NaiveDate::from_ymd_opt(2023, 11, 14).unwrap(),
                contract: ContractId::from("CLF24"),
                open: 78.0,
                high: 79.0,
                low: 77.0,
                close: 78.26,
                volume: 300_000,
                open_interest: Some(250_000),
            },
            ContractBar {
                date: NaiveDate::from_ymd_opt(2023, 11, 14).unwrap(),
                contract: ContractId::from("CLZ23"),
                open: 77.5,
                high: 78.5,
                low: 76.9,
                close: 77.98,
                volume: 120_000,
                open_interest: None,
            },
        ]
    }

    #[test]
    fn encoded_rows_decode_unchanged() {
        let mut df = rows_to_dataframe(&rows()).unwrap();
        let bytes = encode(&mut df).unwrap();
        let decoded = dataframe_to_rows(&decode(&bytes).unwrap()).unwrap();
        assert_eq!(decoded, rows());
    }

    #[test]
    fn legacy_frame_reads_null_open_interest() {
        let df = rows_to_dataframe(&rows()).unwrap();
        let mut legacy = df.drop("open_interest").unwrap();
        let bytes = encode(&mut legacy).unwrap();
        let decoded = dataframe_to_rows(&decode(&bytes).unwrap()).unwrap();
        assert!(decoded.iter().all(|r| r.open_interest.is_none()));
        assert_eq!(decoded[0].close, 78.26);
    }

    #[test]
    fn null_required_value_is_an_error() {
        let df = rows_to_dataframe(&rows()).unwrap();
        let closes = Column::new("close".into(), vec![None, Some(77.98)]);
        let mut columns = df.get_columns().to_vec();
        for column in columns.iter_mut() {
            if column.name().as_str() == "close" {
                *column = closes.clone();
            }
        }
        let mut holed = DataFrame::new(columns).unwrap();
        let bytes = encode(&mut holed).unwrap();
        let err = dataframe_to_rows(&decode(&bytes).unwrap()).unwrap_err();
        assert!(err.to_string().contains("null close at row 0"), "{err}");
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(decode(b"not a parquet file").is_err());
    }
}
