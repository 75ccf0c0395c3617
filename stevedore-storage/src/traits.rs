//! Collaborator traits: connection, DDL executor and bulk-load transport.
//!
//! The orchestrator in `stevedore-bulk` only ever talks to a database
//! through these traits. `stevedore-pg` implements them for PostgreSQL and
//! [`MockDatabase`](crate::MockDatabase) implements them in memory.

use crate::cursor::RowCursor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use stevedore_core::{
    BulkCopyOptions, ColumnDescriptor, StevedoreResult, StoreType, TableName,
};
use uuid::Uuid;

// ============================================================================
// CONNECTION
// ============================================================================

/// Stable identity of a connection, used to scope table name leases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Closed,
    Open,
}

/// A database connection with a reference-counted open state.
///
/// `open` and `close` calls nest: the connection is physically opened by the
/// first `open` and physically closed by the matching last `close`. Session
/// scoped objects such as temporary tables disappear on physical close.
#[async_trait]
pub trait Connection: Send + Sync {
    fn connection_id(&self) -> ConnectionId;

    fn state(&self) -> ConnectionState;

    async fn open(&self) -> StevedoreResult<()>;

    async fn close(&self) -> StevedoreResult<()>;

    fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }
}

// ============================================================================
// DDL
// ============================================================================

/// Column of a table to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    pub store_type: StoreType,
    pub nullable: bool,
}

impl From<&ColumnDescriptor> for TableColumn {
    fn from(column: &ColumnDescriptor) -> Self {
        Self {
            name: column.name.clone(),
            store_type: column.store_type.clone(),
            nullable: column.nullable,
        }
    }
}

/// `CREATE TABLE` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTable {
    pub table: TableName,
    pub columns: Vec<TableColumn>,
    /// Primary key columns; empty for none.
    pub primary_key: Vec<String>,
    /// Session scoped table, dropped when the connection closes.
    pub temporary: bool,
}

impl CreateTable {
    pub fn new(table: TableName, columns: Vec<TableColumn>) -> Self {
        Self {
            table,
            columns,
            primary_key: Vec::new(),
            temporary: false,
        }
    }

    pub fn with_primary_key(mut self, columns: Vec<String>) -> Self {
        self.primary_key = columns;
        self
    }

    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }
}

/// Executes schema statements.
#[async_trait]
pub trait DdlExecutor: Send + Sync {
    async fn create_table(&self, request: &CreateTable) -> StevedoreResult<()>;

    async fn drop_table_if_exists(&self, table: &TableName) -> StevedoreResult<()>;

    async fn truncate_table(&self, table: &TableName) -> StevedoreResult<()>;

    async fn table_exists(&self, table: &TableName) -> StevedoreResult<bool>;

    async fn add_primary_key(&self, table: &TableName, columns: &[String]) -> StevedoreResult<()>;

    /// ANSI double-quoted identifier.
    fn quote_identifier(&self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }

    fn quote_table(&self, table: &TableName) -> String {
        match &table.schema {
            Some(schema) => format!(
                "{}.{}",
                self.quote_identifier(schema),
                self.quote_identifier(&table.name)
            ),
            None => self.quote_identifier(&table.name),
        }
    }
}

// ============================================================================
// BULK TRANSPORT
// ============================================================================

/// Maps a cursor field to a destination column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source_index: usize,
    pub column_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkCopyRequest {
    pub table: TableName,
    pub columns: Vec<ColumnMapping>,
    pub options: BulkCopyOptions,
}

impl BulkCopyRequest {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.column_name.as_str()).collect()
    }
}

/// Streams rows from a cursor into a table.
#[async_trait]
pub trait BulkTransport: Send + Sync {
    /// Returns the number of rows written.
    async fn bulk_copy(
        &self,
        request: &BulkCopyRequest,
        rows: &mut dyn RowCursor,
    ) -> StevedoreResult<u64>;
}

/// Everything the orchestrator needs from one connection.
pub trait Database: Connection + DdlExecutor + BulkTransport {}

impl<T: Connection + DdlExecutor + BulkTransport> Database for T {}
