use crate::connection::{connect, test_connection as test_conn, TestConnectionResult};
use crate::error::StoreError;
use async_trait::async_trait;
use domain::sql_type::SqlColumnType;

///
/// Create/drop/exists of destination data tables (C5, §4.5). `create_table` is idempotent -
/// a second call against an existing table is a no-op, per the §8 round-trip property.
#[async_trait]
pub trait SchemaService: Send + Sync {
    async fn test_connection(&self, connection_string: &str) -> TestConnectionResult;
    async fn create_table(&self, connection_string: &str, name: &str, columns: &[(String, SqlColumnType)]) -> Result<(), StoreError>;
    async fn drop_table(&self, connection_string: &str, name: &str) -> Result<(), StoreError>;
    async fn table_exists(&self, connection_string: &str, name: &str) -> Result<bool, StoreError>;
}

pub struct TiberiusSchemaService;

#[async_trait]
impl SchemaService for TiberiusSchemaService {
    async fn test_connection(&self, connection_string: &str) -> TestConnectionResult {
        test_conn(connection_string).await
    }

    async fn create_table(&self, connection_string: &str, name: &str, columns: &[(String, SqlColumnType)]) -> Result<(), StoreError> {
        if columns.is_empty() {
            return Err(StoreError::NoColumns);
        }

        let sql = create_table_sql(name, columns);
        let mut client = connect(connection_string).await?;
        client.execute(&sql, &[]).await.map_err(|source| StoreError::CreateTable { name: name.to_string(), source })?;
        log::info!("created table {} ({} columns)", name, columns.len());
        Ok(())
    }

    async fn drop_table(&self, connection_string: &str, name: &str) -> Result<(), StoreError> {
        let sql = drop_table_sql(name);
        let mut client = connect(connection_string).await?;
        client.execute(&sql, &[]).await.map_err(|source| StoreError::DropTable { name: name.to_string(), source })?;
        log::info!("dropped table {}", name);
        Ok(())
    }

    async fn table_exists(&self, connection_string: &str, name: &str) -> Result<bool, StoreError> {
        let mut client = connect(connection_string).await?;
        let row = client
            .query(
                "SELECT CASE WHEN OBJECT_ID(@P1, 'U') IS NOT NULL THEN 1 ELSE 0 END",
                &[&qualified(name)],
            )
            .await
            .map_err(|source| StoreError::TableExists { name: name.to_string(), source })?
            .into_row()
            .await
            .map_err(|source| StoreError::TableExists { name: name.to_string(), source })?;

        Ok(row.and_then(|r| r.get::<i32, _>(0)).map(|v| v == 1).unwrap_or(false))
    }
}

fn qualified(name: &str) -> String {
    format!("[dbo].{}", escape_identifier(name))
}

///
/// Doubles `]` so an identifier can be embedded in a bracketed SQL Server name (§4.5).
fn escape_identifier(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

fn create_table_sql(name: &str, columns: &[(String, SqlColumnType)]) -> String {
    let qualified_name = qualified(name);
    let column_defs: Vec<String> = columns
        .iter()
        .map(|(col_name, col_type)| format!("{} {}", escape_identifier(col_name), col_type.to_sql_definition()))
        .collect();

    format!(
        "IF NOT EXISTS (SELECT * FROM sys.objects WHERE object_id = OBJECT_ID(N'{qualified_name}') AND type IN (N'U')) CREATE TABLE {qualified_name} ({})",
        column_defs.join(", "),
    )
}

fn drop_table_sql(name: &str) -> String {
    let qualified_name = qualified(name);
    format!("IF OBJECT_ID(N'{qualified_name}', N'U') IS NOT NULL DROP TABLE {qualified_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_identifier_doubles_closing_bracket() {
        assert_eq!("[sa]]les]", escape_identifier("sa]les"));
    }

    #[test]
    fn test_create_table_sql_is_idempotent_guarded() {
        let columns = vec![("id".to_string(), SqlColumnType::Int { reliable: true })];
        let sql = create_table_sql("TB_sales", &columns);
        assert!(sql.starts_with("IF NOT EXISTS"));
        assert!(sql.contains("[dbo].[TB_sales]"));
        assert!(sql.contains("[id] int NULL"));
    }

    #[test]
    fn test_drop_table_sql_is_conditional() {
        let sql = drop_table_sql("TB_sales");
        assert!(sql.starts_with("IF OBJECT_ID"));
        assert!(sql.contains("DROP TABLE [dbo].[TB_sales]"));
    }
}
