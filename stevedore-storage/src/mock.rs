//! In-memory database for testing.
//!
//! Implements every collaborator trait with table storage, NOT NULL and
//! primary key checks, session scoped temporary tables and failure
//! injection. Clones share state.

use crate::cursor::RowCursor;
use crate::traits::{
    BulkCopyRequest, BulkTransport, Connection, ConnectionId, ConnectionState, CreateTable,
    DdlExecutor, TableColumn,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use stevedore_core::{StevedoreError, StevedoreResult, TableName, TransportError, Value};
use tracing::debug;

/// Operation a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    CreateTable,
    DropTable,
    TruncateTable,
    AddPrimaryKey,
    BulkCopy,
}

impl fmt::Display for MockOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MockOperation::CreateTable => "CREATE TABLE",
            MockOperation::DropTable => "DROP TABLE",
            MockOperation::TruncateTable => "TRUNCATE TABLE",
            MockOperation::AddPrimaryKey => "ADD PRIMARY KEY",
            MockOperation::BulkCopy => "BULK COPY",
        };
        write!(f, "{}", name)
    }
}

/// A stored table.
#[derive(Debug, Clone, PartialEq)]
pub struct MockTable {
    pub columns: Vec<TableColumn>,
    pub primary_key: Vec<String>,
    pub temporary: bool,
    pub rows: Vec<Vec<Value>>,
}

impl MockTable {
    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

#[derive(Debug, Default)]
struct MockState {
    open_count: usize,
    physical_opens: usize,
    tables: HashMap<TableName, MockTable>,
    failures: HashMap<(MockOperation, TableName), String>,
    statements: Vec<String>,
}

/// In-memory mock database.
#[derive(Debug, Clone)]
pub struct MockDatabase {
    id: ConnectionId,
    state: Arc<Mutex<MockState>>,
    copy_delay: Option<Duration>,
}

impl Default for MockDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDatabase {
    pub fn new() -> Self {
        Self {
            id: ConnectionId::new(),
            state: Arc::new(Mutex::new(MockState::default())),
            copy_delay: None,
        }
    }

    /// Registers a permanent table, independent of the connection state.
    pub fn with_table(self, request: CreateTable) -> Self {
        self.lock().tables.insert(
            request.table.clone(),
            MockTable {
                columns: request.columns,
                primary_key: request.primary_key,
                temporary: false,
                rows: Vec::new(),
            },
        );
        self
    }

    /// Every bulk copy sleeps this long before touching any table.
    pub fn with_copy_delay(mut self, delay: Duration) -> Self {
        self.copy_delay = Some(delay);
        self
    }

    /// Makes `operation` on `table` fail with a transport error.
    pub fn fail_on(&self, operation: MockOperation, table: TableName, reason: impl Into<String>) {
        self.lock().failures.insert((operation, table), reason.into());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn table(&self, table: &TableName) -> Option<MockTable> {
        self.lock().tables.get(table).cloned()
    }

    /// Stored rows in table column order; empty when the table is missing.
    pub fn rows(&self, table: &TableName) -> Vec<Vec<Value>> {
        self.table(table).map(|t| t.rows).unwrap_or_default()
    }

    /// Values of one column across all rows.
    pub fn column_values(&self, table: &TableName, column: &str) -> Vec<Value> {
        let Some(table) = self.table(table) else {
            return Vec::new();
        };
        let Some(index) = table.column_index(column) else {
            return Vec::new();
        };
        table.rows.into_iter().map(|mut row| row.swap_remove(index)).collect()
    }

    pub fn has_table(&self, table: &TableName) -> bool {
        self.lock().tables.contains_key(table)
    }

    pub fn table_names(&self) -> Vec<TableName> {
        let mut names: Vec<TableName> = self.lock().tables.keys().cloned().collect();
        names.sort_by_key(|t| t.to_string());
        names
    }

    pub fn temporary_tables(&self) -> Vec<TableName> {
        let mut names: Vec<TableName> = self
            .lock()
            .tables
            .iter()
            .filter(|(_, t)| t.temporary)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort_by_key(|t| t.to_string());
        names
    }

    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    /// Number of times the connection went from closed to open.
    pub fn physical_opens(&self) -> usize {
        self.lock().physical_opens
    }

    /// Log of executed statements, e.g. `CREATE TABLE orders_1`.
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Locks the state for an operation on `table`: the connection must be
    /// open and no failure may be injected.
    fn begin(
        &self,
        operation: MockOperation,
        table: &TableName,
    ) -> StevedoreResult<MutexGuard<'_, MockState>> {
        let state = self.state.lock().map_err(|_| StevedoreError::LockPoisoned {
            resource: "mock database".to_string(),
        })?;
        if state.open_count == 0 {
            return Err(TransportError::Connection {
                table: table.to_string(),
                reason: "connection is closed".to_string(),
            }
            .into());
        }
        if let Some(reason) = state.failures.get(&(operation, table.clone())) {
            return Err(TransportError::Failed {
                table: table.to_string(),
                operation: operation.to_string(),
                reason: reason.clone(),
            }
            .into());
        }
        Ok(state)
    }

    fn copy_rows(
        &self,
        request: &BulkCopyRequest,
        rows: &mut dyn RowCursor,
    ) -> StevedoreResult<u64> {
        let mut state = self.begin(MockOperation::BulkCopy, &request.table)?;
        let table_id = request.table.to_string();
        let table = state
            .tables
            .get_mut(&request.table)
            .ok_or_else(|| TransportError::TableMissing {
                table: table_id.clone(),
            })?;

        let mut targets = Vec::with_capacity(request.columns.len());
        for mapping in &request.columns {
            let index = table.column_index(&mapping.column_name).ok_or_else(|| {
                TransportError::Failed {
                    table: table_id.clone(),
                    operation: MockOperation::BulkCopy.to_string(),
                    reason: format!("column {} does not exist", mapping.column_name),
                }
            })?;
            if mapping.source_index >= rows.field_count() {
                return Err(TransportError::Failed {
                    table: table_id,
                    operation: MockOperation::BulkCopy.to_string(),
                    reason: format!("source field {} does not exist", mapping.source_index),
                }
                .into());
            }
            targets.push((mapping.source_index, index));
        }

        // temp tables have no defaults or identities to fill unmapped columns
        let unfilled = (0..table.columns.len()).find(|&index| {
            table.temporary
                && !table.columns[index].nullable
                && !targets.iter().any(|&(_, target)| target == index)
        });

        let mut batch = Vec::new();
        while rows.advance()? {
            if let Some(index) = unfilled {
                return Err(TransportError::ConstraintViolation {
                    table: table_id,
                    column: table.columns[index].name.clone(),
                    reason: "null value violates NOT NULL".to_string(),
                }
                .into());
            }
            let mut row = vec![Value::Null; table.columns.len()];
            for &(source, target) in &targets {
                let value = rows.get_value(source)?;
                let column = &table.columns[target];
                if value.is_null() && !column.nullable {
                    return Err(TransportError::ConstraintViolation {
                        table: table_id,
                        column: column.name.clone(),
                        reason: "null value violates NOT NULL".to_string(),
                    }
                    .into());
                }
                if !value.fits(&column.store_type) {
                    return Err(TransportError::ConstraintViolation {
                        table: table_id,
                        column: column.name.clone(),
                        reason: format!(
                            "{} value does not fit {}",
                            value.type_name(),
                            column.store_type
                        ),
                    }
                    .into());
                }
                row[target] = value;
            }
            batch.push(row);
        }

        let mut all_rows = table.rows.clone();
        all_rows.extend(batch.iter().cloned());
        check_unique(&table_id, table, &table.primary_key, &all_rows)?;

        let count = batch.len() as u64;
        table.rows.extend(batch);
        state
            .statements
            .push(format!("BULK COPY {} ({} rows)", table_id, count));
        Ok(count)
    }
}

fn check_unique(
    table_id: &str,
    table: &MockTable,
    key: &[String],
    rows: &[Vec<Value>],
) -> StevedoreResult<()> {
    if key.is_empty() {
        return Ok(());
    }
    let indexes: Vec<usize> = key.iter().filter_map(|k| table.column_index(k)).collect();
    let mut seen = HashSet::new();
    for row in rows {
        let key_values: Vec<String> = indexes.iter().map(|&i| row[i].to_string()).collect();
        if !seen.insert(key_values) {
            return Err(TransportError::ConstraintViolation {
                table: table_id.to_string(),
                column: key.join(", "),
                reason: "duplicate primary key".to_string(),
            }
            .into());
        }
    }
    Ok(())
}

#[async_trait]
impl Connection for MockDatabase {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn state(&self) -> ConnectionState {
        if self.lock().open_count > 0 {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    async fn open(&self) -> StevedoreResult<()> {
        let mut state = self.lock();
        if state.open_count == 0 {
            state.physical_opens += 1;
            debug!(connection = %self.id, "Mock connection opened");
        }
        state.open_count += 1;
        Ok(())
    }

    async fn close(&self) -> StevedoreResult<()> {
        let mut state = self.lock();
        if state.open_count == 0 {
            return Ok(());
        }
        state.open_count -= 1;
        if state.open_count == 0 {
            // temporary tables are session scoped
            state.tables.retain(|_, t| !t.temporary);
            debug!(connection = %self.id, "Mock connection closed");
        }
        Ok(())
    }
}

#[async_trait]
impl DdlExecutor for MockDatabase {
    async fn create_table(&self, request: &CreateTable) -> StevedoreResult<()> {
        let mut state = self.begin(MockOperation::CreateTable, &request.table)?;
        let table_id = request.table.to_string();
        if state.tables.contains_key(&request.table) {
            return Err(TransportError::Failed {
                table: table_id,
                operation: MockOperation::CreateTable.to_string(),
                reason: "table already exists".to_string(),
            }
            .into());
        }
        if let Some(missing) = request
            .primary_key
            .iter()
            .find(|k| !request.columns.iter().any(|c| &c.name == *k))
        {
            return Err(TransportError::Failed {
                table: table_id,
                operation: MockOperation::CreateTable.to_string(),
                reason: format!("primary key column {} does not exist", missing),
            }
            .into());
        }

        state.tables.insert(
            request.table.clone(),
            MockTable {
                columns: request.columns.clone(),
                primary_key: request.primary_key.clone(),
                temporary: request.temporary,
                rows: Vec::new(),
            },
        );
        state.statements.push(format!("CREATE TABLE {}", table_id));
        Ok(())
    }

    async fn drop_table_if_exists(&self, table: &TableName) -> StevedoreResult<()> {
        let mut state = self.begin(MockOperation::DropTable, table)?;
        state.tables.remove(table);
        state.statements.push(format!("DROP TABLE {}", table));
        Ok(())
    }

    async fn truncate_table(&self, table: &TableName) -> StevedoreResult<()> {
        let mut state = self.begin(MockOperation::TruncateTable, table)?;
        let stored = state
            .tables
            .get_mut(table)
            .ok_or_else(|| TransportError::TableMissing {
                table: table.to_string(),
            })?;
        stored.rows.clear();
        state.statements.push(format!("TRUNCATE TABLE {}", table));
        Ok(())
    }

    async fn table_exists(&self, table: &TableName) -> StevedoreResult<bool> {
        let state = self.lock();
        if state.open_count == 0 {
            return Err(TransportError::Connection {
                table: table.to_string(),
                reason: "connection is closed".to_string(),
            }
            .into());
        }
        Ok(state.tables.contains_key(table))
    }

    async fn add_primary_key(&self, table: &TableName, columns: &[String]) -> StevedoreResult<()> {
        let mut state = self.begin(MockOperation::AddPrimaryKey, table)?;
        let table_id = table.to_string();
        let stored = state
            .tables
            .get_mut(table)
            .ok_or_else(|| TransportError::TableMissing {
                table: table_id.clone(),
            })?;
        if !stored.primary_key.is_empty() {
            return Err(TransportError::Failed {
                table: table_id,
                operation: MockOperation::AddPrimaryKey.to_string(),
                reason: "table already has a primary key".to_string(),
            }
            .into());
        }
        if let Some(missing) = columns.iter().find(|c| stored.column_index(c).is_none()) {
            return Err(TransportError::Failed {
                table: table_id,
                operation: MockOperation::AddPrimaryKey.to_string(),
                reason: format!("column {} does not exist", missing),
            }
            .into());
        }
        check_unique(&table_id, stored, columns, &stored.rows)?;

        stored.primary_key = columns.to_vec();
        state.statements.push(format!(
            "ALTER TABLE {} ADD PRIMARY KEY ({})",
            table_id,
            columns.join(", ")
        ));
        Ok(())
    }
}

#[async_trait]
impl BulkTransport for MockDatabase {
    async fn bulk_copy(
        &self,
        request: &BulkCopyRequest,
        rows: &mut dyn RowCursor,
    ) -> StevedoreResult<u64> {
        if let Some(delay) = self.copy_delay {
            tokio::time::sleep(delay).await;
        }
        self.copy_rows(request, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ColumnMapping;
    use stevedore_core::{BulkCopyOptions, ColumnDescriptor, StoreType};

    /// Single-field rows.
    struct Names {
        names: Vec<&'static str>,
        read: usize,
    }

    impl RowCursor for Names {
        fn field_count(&self) -> usize {
            1
        }

        fn columns(&self) -> Vec<(usize, &ColumnDescriptor)> {
            Vec::new()
        }

        fn advance(&mut self) -> StevedoreResult<bool> {
            if self.read < self.names.len() {
                self.read += 1;
                Ok(true)
            } else {
                Ok(false)
            }
        }

        fn get_value(&mut self, _: usize) -> StevedoreResult<Value> {
            Ok(Value::from(self.names[self.read - 1]))
        }

        fn rows_read(&self) -> u64 {
            self.read as u64
        }
    }

    fn copy_names(table: TableName) -> BulkCopyRequest {
        BulkCopyRequest {
            table,
            columns: vec![ColumnMapping {
                source_index: 0,
                column_name: "name".to_string(),
            }],
            options: BulkCopyOptions::default(),
        }
    }

    fn people() -> TableName {
        TableName::new("people")
    }

    fn people_table() -> CreateTable {
        CreateTable::new(
            people(),
            vec![
                TableColumn {
                    name: "id".to_string(),
                    store_type: StoreType::Integer,
                    nullable: false,
                },
                TableColumn {
                    name: "name".to_string(),
                    store_type: StoreType::Text,
                    nullable: true,
                },
            ],
        )
        .with_primary_key(vec!["id".to_string()])
    }

    #[tokio::test]
    async fn test_open_count_nests() {
        let db = MockDatabase::new();
        db.open().await.unwrap();
        db.open().await.unwrap();
        db.close().await.unwrap();
        assert!(db.is_open());
        db.close().await.unwrap();
        assert!(!db.is_open());
        assert_eq!(db.physical_opens(), 1);
    }

    #[tokio::test]
    async fn test_temporary_tables_vanish_on_close() {
        let db = MockDatabase::new().with_table(people_table());
        db.open().await.unwrap();
        // permanent table of the same name already exists
        assert!(db.create_table(&people_table().temporary()).await.is_err());
        let temp = CreateTable {
            table: TableName::new("people_1"),
            ..people_table()
        }
        .temporary();
        db.create_table(&temp).await.unwrap();
        assert_eq!(db.temporary_tables(), vec![TableName::new("people_1")]);

        db.close().await.unwrap();
        assert!(!db.has_table(&TableName::new("people_1")));
        assert!(db.has_table(&people()));
    }

    #[tokio::test]
    async fn test_ddl_requires_open_connection() {
        let db = MockDatabase::new();
        let err = db.create_table(&people_table()).await.unwrap_err();
        assert!(err.is_transport_failure());
        assert!(db.table_exists(&people()).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failure_names_table() {
        let db = MockDatabase::new();
        db.open().await.unwrap();
        db.fail_on(MockOperation::CreateTable, people(), "disk full");
        let err = db.create_table(&people_table()).await.unwrap_err();
        match err {
            StevedoreError::Transport(t) => assert_eq!(t.table(), "people"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_add_primary_key_checks_columns() {
        let db = MockDatabase::new();
        db.open().await.unwrap();
        db.create_table(&CreateTable::new(people(), people_table().columns))
            .await
            .unwrap();
        assert!(db
            .add_primary_key(&people(), &["nope".to_string()])
            .await
            .is_err());
        db.add_primary_key(&people(), &["id".to_string()]).await.unwrap();
        assert_eq!(db.table(&people()).unwrap().primary_key, vec!["id"]);
        assert_eq!(
            db.statements().last().unwrap(),
            "ALTER TABLE people ADD PRIMARY KEY (id)"
        );
    }

    #[tokio::test]
    async fn test_temporary_table_rejects_unfilled_not_null_column() {
        let db = MockDatabase::new();
        db.open().await.unwrap();
        let temp = TableName::new("people_1");
        db.create_table(
            &CreateTable {
                table: temp.clone(),
                ..people_table()
            }
            .temporary(),
        )
        .await
        .unwrap();

        let mut empty = Names {
            names: Vec::new(),
            read: 0,
        };
        assert_eq!(db.bulk_copy(&copy_names(temp.clone()), &mut empty).await.unwrap(), 0);

        let mut rows = Names {
            names: vec!["ada", "grace"],
            read: 0,
        };
        let err = db.bulk_copy(&copy_names(temp.clone()), &mut rows).await.unwrap_err();
        assert!(matches!(
            err,
            StevedoreError::Transport(TransportError::ConstraintViolation { ref column, .. }) if column == "id"
        ));
        assert!(db.table(&temp).unwrap().rows.is_empty());
    }
}
