//! Parser for the data hub's half-hourly interval export.
//!
//! The export is a comma-separated file with a header row. Only two columns
//! matter here; any others (MPRN, meter serial, read type) are ignored.

use crate::error::{PortalError, Stage};
use crate::models::Reading;
use chrono::NaiveDateTime;
use csv::{ReaderBuilder, StringRecord, Trim};

pub const TIMESTAMP_COLUMN: &str = "Read Date and End Time";
pub const VALUE_COLUMN: &str = "Read Value";
pub const TIMESTAMP_FORMAT: &str = "%d-%m-%Y %H:%M";

fn parse_error(detail: impl Into<String>) -> PortalError {
    PortalError::parse(Stage::Parse, detail)
}

fn column_index(headers: &StringRecord, column: &str) -> Result<usize, PortalError> {
    headers
        .iter()
        .position(|h| h == column)
        .ok_or_else(|| parse_error(format!("missing column '{column}'")))
}

fn required_field<'r>(
    record: &'r StringRecord,
    index: usize,
    column: &str,
    row: usize,
) -> Result<&'r str, PortalError> {
    record
        .get(index)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| parse_error(format!("row {row}: empty '{column}'")))
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).ok()
}

/// Parse the whole export. Any bad row fails the parse; no partial result.
pub fn parse_readings(body: &str) -> Result<Vec<Reading>, PortalError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .from_reader(body.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| parse_error(format!("unreadable header row: {e}")))?
        .clone();
    let ts_index = column_index(&headers, TIMESTAMP_COLUMN)?;
    let value_index = column_index(&headers, VALUE_COLUMN)?;

    let mut readings = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let row = idx + 1;
        let record = record.map_err(|e| parse_error(format!("row {row}: {e}")))?;

        let raw_ts = required_field(&record, ts_index, TIMESTAMP_COLUMN, row)?;
        let end_timestamp = parse_timestamp(raw_ts).ok_or_else(|| {
            parse_error(format!("row {row}: bad timestamp '{raw_ts}'"))
        })?;

        let raw_value = required_field(&record, value_index, VALUE_COLUMN, row)?;
        let value_kwh = raw_value
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .ok_or_else(|| parse_error(format!("row {row}: bad read value '{raw_value}'")))?;

        readings.push(Reading {
            end_timestamp,
            value_kwh,
        });
    }

    Ok(readings)
}
