use crate::connection::connect;
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use domain::sql_type::SqlColumnType;
use rust_decimal::Decimal;
use std::str::FromStr;
use tiberius::{ColumnData, ToSql};
use tokio_util::sync::CancellationToken;

const DEFAULT_BATCH_SIZE: usize = 1000;

///
/// Batches rows with typed marshalling and per-row error accounting (C6, §4.6). Bulk-copy is
/// approximated as a multi-row parameterized `INSERT` sharing one statement round-trip per
/// batch - tiberius has no BCP support (see DESIGN.md).
///
/// `rows` carries each row's real file line number alongside its fields, so a row rejected by
/// the database is reported against the line it actually came from - not its ordinal position
/// among the rows that made it past the CSV reader.
#[async_trait]
pub trait BulkLoader: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn bulk_insert(
        &self,
        connection_string: &str,
        table: &str,
        column_names: &[String],
        column_types: &[SqlColumnType],
        rows: &mut (dyn Iterator<Item = (u64, Vec<String>)> + Send),
        on_row_error: &mut (dyn FnMut(Vec<String>, u64, String) + Send),
        cancel: &CancellationToken,
    ) -> Result<u64, StoreError>;
}

pub struct TiberiusBulkLoader {
    pub batch_size: usize,
}

impl Default for TiberiusBulkLoader {
    fn default() -> Self {
        Self { batch_size: DEFAULT_BATCH_SIZE }
    }
}

#[async_trait]
impl BulkLoader for TiberiusBulkLoader {
    async fn bulk_insert(
        &self,
        connection_string: &str,
        table: &str,
        column_names: &[String],
        column_types: &[SqlColumnType],
        rows: &mut (dyn Iterator<Item = (u64, Vec<String>)> + Send),
        on_row_error: &mut (dyn FnMut(Vec<String>, u64, String) + Send),
        cancel: &CancellationToken,
    ) -> Result<u64, StoreError> {
        let mut client = connect(connection_string).await?;
        let qualified_table = format!("[dbo].[{}]", table.replace(']', "]]"));
        let column_list: Vec<String> = column_names.iter().map(|c| format!("[{}]", c.replace(']', "]]"))).collect();

        let mut inserted: u64 = 0;
        let mut batch: Vec<(u64, Vec<String>)> = Vec::with_capacity(self.batch_size);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if let Some(row) = rows.next() {
                batch.push(row);
                if batch.len() < self.batch_size {
                    continue;
                }
            }

            if batch.is_empty() {
                break;
            }

            let batch_len = batch.len();
            let batch_inserted = submit_batch(&mut client, &qualified_table, &column_list, column_types, &mut batch, on_row_error).await?;
            log::debug!("submitted batch of {} row(s) to {}, {} inserted", batch_len, qualified_table, batch_inserted);
            inserted += batch_inserted;
            batch.clear();

            if cancel.is_cancelled() {
                break;
            }
        }

        Ok(inserted)
    }
}

async fn submit_batch(
    client: &mut crate::connection::SqlClient,
    qualified_table: &str,
    column_list: &[String],
    column_types: &[SqlColumnType],
    batch: &mut Vec<(u64, Vec<String>)>,
    on_row_error: &mut (dyn FnMut(Vec<String>, u64, String) + Send),
) -> Result<u64, StoreError> {
    let mut params: Vec<Param> = Vec::with_capacity(batch.len() * column_types.len());
    let mut value_groups: Vec<String> = Vec::with_capacity(batch.len());
    let mut next_param = 1usize;

    for (_, row) in batch.iter() {
        let mut placeholders = Vec::with_capacity(column_types.len());
        for (field, col_type) in row.iter().zip(column_types.iter()) {
            params.push(marshal_value(col_type, field));
            placeholders.push(format!("@P{}", next_param));
            next_param += 1;
        }
        value_groups.push(format!("({})", placeholders.join(", ")));
    }

    let sql = format!("INSERT INTO {} ({}) VALUES {}", qualified_table, column_list.join(", "), value_groups.join(", "));
    let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();

    match client.execute(&sql, &refs).await {
        Ok(_) => Ok(batch.len() as u64),
        Err(source) => {
            let reason = source.to_string();
            log::warn!("batch insert into {} rejected: {}", qualified_table, reason);
            for (line_number, row) in batch.drain(..) {
                on_row_error(row, line_number, reason.clone());
            }
            Ok(0)
        }
    }
}

enum Param {
    Bool(Option<bool>),
    I32(Option<i32>),
    I64(Option<i64>),
    Decimal(Option<Decimal>),
    Date(Option<NaiveDate>),
    DateTime(Option<NaiveDateTime>),
    Str(Option<String>),
}

impl ToSql for Param {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            Param::Bool(v) => v.to_sql(),
            Param::I32(v) => v.to_sql(),
            Param::I64(v) => v.to_sql(),
            Param::Decimal(v) => v.to_sql(),
            Param::Date(v) => v.to_sql(),
            Param::DateTime(v) => v.to_sql(),
            Param::Str(v) => v.to_sql(),
        }
    }
}

///
/// Converts one raw field to the typed SQL value for its destination column (§4.6). Conversion
/// failures degrade to NULL rather than rejecting the row - only marshalling panics/internal
/// errors reject a row, and this function never panics.
fn marshal_value(column_type: &SqlColumnType, raw: &str) -> Param {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return match column_type {
            SqlColumnType::Bit { .. } => Param::Bool(None),
            SqlColumnType::Int { .. } => Param::I32(None),
            SqlColumnType::BigInt { .. } => Param::I64(None),
            SqlColumnType::Decimal { .. } => Param::Decimal(None),
            SqlColumnType::Date { .. } => Param::Date(None),
            SqlColumnType::DateTime { .. } => Param::DateTime(None),
            SqlColumnType::NVarChar { .. } => Param::Str(None),
        };
    }

    match column_type {
        SqlColumnType::Bit { .. } => Param::Bool(parse_bit(trimmed)),
        SqlColumnType::Int { .. } => Param::I32(i32::from_str(trimmed).ok()),
        SqlColumnType::BigInt { .. } => Param::I64(i64::from_str(trimmed).ok()),
        SqlColumnType::Decimal { .. } => Param::Decimal(Decimal::from_str(trimmed).ok()),
        SqlColumnType::Date { .. } => Param::Date(parse_date(trimmed)),
        SqlColumnType::DateTime { .. } => Param::DateTime(parse_datetime(trimmed)),
        SqlColumnType::NVarChar { .. } => Param::Str(Some(trimmed.to_string())),
    }
}

fn parse_bit(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "sim" | "yes" => Some(true),
        "false" | "0" | "não" | "no" => Some(false),
        _ => None,
    }
}

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y"];
const DATETIME_FORMATS: [&str; 4] = ["%Y-%m-%d %H:%M:%S", "%d/%m/%Y %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y/%m/%d %H:%M:%S"];

fn parse_date(value: &str) -> Option<NaiveDate> {
    DATE_FORMATS.iter().find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

fn parse_datetime(value: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_utc());
    }
    DATETIME_FORMATS.iter().find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_value_always_becomes_null() {
        assert!(matches!(marshal_value(&SqlColumnType::Int { reliable: true }, "  "), Param::I32(None)));
    }

    #[test]
    fn test_bit_recognises_sim_and_nao() {
        assert_eq!(Some(true), parse_bit("sim"));
        assert_eq!(Some(false), parse_bit("não"));
        assert_eq!(None, parse_bit("maybe"));
    }

    #[test]
    fn test_unparseable_int_degrades_to_null_not_error() {
        assert!(matches!(marshal_value(&SqlColumnType::Int { reliable: true }, "not-a-number"), Param::I32(None)));
    }

    #[test]
    fn test_nvarchar_passes_trimmed_string() {
        match marshal_value(&SqlColumnType::NVarChar { max: false, reliable: true }, "  hello  ") {
            Param::Str(Some(s)) => assert_eq!("hello", s),
            _ => panic!("expected Str"),
        }
    }

    #[test]
    fn test_date_parses_all_three_formats() {
        assert!(parse_date("2024-01-02").is_some());
        assert!(parse_date("02/01/2024").is_some());
        assert!(parse_date("01/02/2024").is_some());
        assert!(parse_date("not-a-date").is_none());
    }
}
