use async_trait::async_trait;
use domain::sql_type::SqlColumnType;
use std::collections::HashMap;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Mutex;
use store::connection::TestConnectionResult;
use store::loader::BulkLoader;
use store::schema::SchemaService;
use store::StoreError;
use tokio_util::sync::CancellationToken;

///
/// In-memory stand-in for `SchemaService` used by orchestrator tests (§9 test tooling) - records
/// every table it was asked to create/drop so tests can assert on C5 calls without a live server.
#[derive(Default)]
pub struct NoopSchema {
    pub created: Mutex<HashMap<String, Vec<(String, SqlColumnType)>>>,
    pub dropped: Mutex<HashSet<String>>,
}

#[async_trait]
impl SchemaService for NoopSchema {
    async fn test_connection(&self, _connection_string: &str) -> TestConnectionResult {
        TestConnectionResult::Ok
    }

    async fn create_table(&self, _connection_string: &str, name: &str, columns: &[(String, SqlColumnType)]) -> Result<(), StoreError> {
        if columns.is_empty() {
            return Err(StoreError::NoColumns);
        }
        self.created.lock().unwrap().insert(name.to_string(), columns.to_vec());
        Ok(())
    }

    async fn drop_table(&self, _connection_string: &str, name: &str) -> Result<(), StoreError> {
        self.dropped.lock().unwrap().insert(name.to_string());
        self.created.lock().unwrap().remove(name);
        Ok(())
    }

    async fn table_exists(&self, _connection_string: &str, name: &str) -> Result<bool, StoreError> {
        Ok(self.created.lock().unwrap().contains_key(name))
    }
}

///
/// In-memory stand-in for `BulkLoader`. Applies the same NULL-on-unparseable marshalling rule as
/// `store::loader::marshal_value` so tests can assert on the actual values that would have reached
/// the destination table (§8 scenario 1: `amount` NULL on a bad row).
#[derive(Default)]
pub struct NoopBulkLoader {
    pub tables: Mutex<HashMap<String, Vec<Vec<Option<String>>>>>,
}

#[async_trait]
impl BulkLoader for NoopBulkLoader {
    async fn bulk_insert(
        &self,
        _connection_string: &str,
        table: &str,
        _column_names: &[String],
        column_types: &[SqlColumnType],
        rows: &mut (dyn Iterator<Item = (u64, Vec<String>)> + Send),
        _on_row_error: &mut (dyn FnMut(Vec<String>, u64, String) + Send),
        cancel: &CancellationToken,
    ) -> Result<u64, StoreError> {
        let mut inserted = 0u64;
        let mut marshalled = Vec::new();

        for (_, row) in rows {
            if cancel.is_cancelled() {
                break;
            }
            let values: Vec<Option<String>> = row.iter().zip(column_types.iter()).map(|(raw, ty)| marshal(ty, raw)).collect();
            marshalled.push(values);
            inserted += 1;
        }

        self.tables.lock().unwrap().entry(table.to_string()).or_default().extend(marshalled);
        Ok(inserted)
    }
}

///
/// In-memory `BulkLoader` that rejects every row whose first field equals `reject_value`,
/// reporting it at the row's real line number rather than its ordinal position - used to exercise
/// the DatabaseError path without a live server.
#[derive(Default)]
pub struct RejectingBulkLoader {
    pub reject_value: String,
}

#[async_trait]
impl BulkLoader for RejectingBulkLoader {
    async fn bulk_insert(
        &self,
        _connection_string: &str,
        _table: &str,
        _column_names: &[String],
        _column_types: &[SqlColumnType],
        rows: &mut (dyn Iterator<Item = (u64, Vec<String>)> + Send),
        on_row_error: &mut (dyn FnMut(Vec<String>, u64, String) + Send),
        cancel: &CancellationToken,
    ) -> Result<u64, StoreError> {
        let mut inserted = 0u64;
        for (line_number, row) in rows {
            if cancel.is_cancelled() {
                break;
            }
            if row.first().map(String::as_str) == Some(self.reject_value.as_str()) {
                on_row_error(row, line_number, "simulated database rejection".to_string());
            } else {
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

fn marshal(column_type: &SqlColumnType, raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    match column_type {
        SqlColumnType::Bit { .. } => match trimmed.to_lowercase().as_str() {
            "true" | "1" | "sim" | "yes" => Some("true".to_string()),
            "false" | "0" | "não" | "no" => Some("false".to_string()),
            _ => None,
        },
        SqlColumnType::Int { .. } => i32::from_str(trimmed).ok().map(|v| v.to_string()),
        SqlColumnType::BigInt { .. } => i64::from_str(trimmed).ok().map(|v| v.to_string()),
        SqlColumnType::Decimal { .. } => rust_decimal::Decimal::from_str(trimmed).ok().map(|v| v.to_string()),
        SqlColumnType::Date { .. } | SqlColumnType::DateTime { .. } => Some(trimmed.to_string()),
        SqlColumnType::NVarChar { .. } => Some(trimmed.to_string()),
    }
}
