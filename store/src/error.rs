use thiserror::Error;

///
/// Errors raised talking to the destination SQL Server instance, across schema management,
/// bulk loading and job-repository persistence. One enum per concern rather than per crate
/// would scatter the §6 error-code classification logic; it lives here instead.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Unable to connect to {connection_string}")]
    Connect { connection_string: String, source: tiberius::error::Error },

    #[error("Unable to create table {name}")]
    CreateTable { name: String, source: tiberius::error::Error },

    #[error("Unable to drop table {name}")]
    DropTable { name: String, source: tiberius::error::Error },

    #[error("Unable to check existence of table {name}")]
    TableExists { name: String, source: tiberius::error::Error },

    #[error("Cannot create a table with no columns")]
    NoColumns,

    #[error("Bulk insert into {table} failed")]
    BulkInsert { table: String, source: tiberius::error::Error },

    #[error("Repository query failed")]
    Repository { source: tiberius::error::Error },

    #[error("Record {id} not found")]
    NotFound { id: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
