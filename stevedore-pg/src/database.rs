//! PostgreSQL implementation of the collaborator traits.
//!
//! One `PgDatabase` is one logical session: the first `open` checks a
//! connection out of the pool, the matching last `close` discards the
//! session's temporary tables and returns it.

use crate::config::PgConfig;
use crate::dialect;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Object, Pool};
use futures_util::pin_mut;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use stevedore_core::{StevedoreError, StevedoreResult, StoreType, TableName, TransportError, Value};
use stevedore_storage::{
    BulkCopyRequest, BulkTransport, Connection, ConnectionId, ConnectionState, CreateTable,
    DdlExecutor, RowCursor,
};
use tokio::sync::Mutex;
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{ToSql, Type};
use tracing::{debug, warn};
use uuid::Uuid;

type Param = Box<dyn ToSql + Sync + Send>;

/// Maps a driver error onto the transport taxonomy.
fn transport_error(table: &TableName, operation: &str, e: tokio_postgres::Error) -> StevedoreError {
    let table = table.to_string();
    if e.is_closed() {
        return TransportError::Connection {
            table,
            reason: e.to_string(),
        }
        .into();
    }
    let Some(db) = e.as_db_error() else {
        return TransportError::Failed {
            table,
            operation: operation.to_string(),
            reason: e.to_string(),
        }
        .into();
    };

    let code = db.code();
    if *code == SqlState::UNDEFINED_TABLE {
        TransportError::TableMissing { table }.into()
    } else if *code == SqlState::NOT_NULL_VIOLATION
        || *code == SqlState::UNIQUE_VIOLATION
        || *code == SqlState::CHECK_VIOLATION
        || *code == SqlState::FOREIGN_KEY_VIOLATION
    {
        TransportError::ConstraintViolation {
            table,
            column: db
                .column()
                .or_else(|| db.constraint())
                .unwrap_or_default()
                .to_string(),
            reason: db.message().to_string(),
        }
        .into()
    } else {
        TransportError::Failed {
            table,
            operation: operation.to_string(),
            reason: db.message().to_string(),
        }
        .into()
    }
}

/// A typed parameter for one value. Nulls are typed after the column so the
/// binary writer accepts them.
fn to_param(value: Value, store_type: &StoreType) -> Param {
    match value {
        Value::Null => null_param(store_type),
        Value::Bool(v) => Box::new(v),
        Value::SmallInt(v) => Box::new(v),
        Value::Int(v) => Box::new(v),
        Value::BigInt(v) => Box::new(v),
        Value::Double(v) => Box::new(v),
        Value::Text(v) => Box::new(v),
        Value::Bytes(v) => Box::new(v),
        Value::Uuid(v) => Box::new(v),
        Value::Timestamp(v) => Box::new(v),
        Value::Json(v) => Box::new(v),
    }
}

fn null_param(store_type: &StoreType) -> Param {
    match store_type {
        StoreType::Boolean => Box::new(None::<bool>),
        StoreType::SmallInt => Box::new(None::<i16>),
        StoreType::Integer => Box::new(None::<i32>),
        StoreType::BigInt => Box::new(None::<i64>),
        StoreType::Double => Box::new(None::<f64>),
        StoreType::Text | StoreType::VarChar(_) => Box::new(None::<String>),
        StoreType::Bytes => Box::new(None::<Vec<u8>>),
        StoreType::Uuid => Box::new(None::<Uuid>),
        StoreType::TimestampTz => Box::new(None::<DateTime<Utc>>),
        StoreType::Json => Box::new(None::<serde_json::Value>),
    }
}

/// The checked out connection, or a connection failure about `table`.
fn connected<'s>(session: &'s Option<Object>, table: &TableName) -> StevedoreResult<&'s Object> {
    session.as_ref().ok_or_else(|| {
        TransportError::Connection {
            table: table.to_string(),
            reason: "connection is closed".to_string(),
        }
        .into()
    })
}

/// PostgreSQL database session backed by a deadpool pool.
pub struct PgDatabase {
    id: ConnectionId,
    pool: Pool,
    target: String,
    session: Mutex<Option<Object>>,
    open_count: AtomicUsize,
}

impl PgDatabase {
    pub fn new(pool: Pool, target: impl Into<String>) -> Self {
        Self {
            id: ConnectionId::new(),
            pool,
            target: target.into(),
            session: Mutex::new(None),
            open_count: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &PgConfig) -> StevedoreResult<Self> {
        Ok(Self::new(config.create_pool()?, config.target()))
    }

    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    /// Rows currently in `table`, as seen by this session.
    pub async fn row_count(&self, table: &TableName) -> StevedoreResult<u64> {
        let session = self.session.lock().await;
        let client = connected(&session, table)?;
        let row = client
            .query_one(dialect::count_rows_sql(table).as_str(), &[])
            .await
            .map_err(|e| transport_error(table, "COUNT", e))?;
        let count: i64 = row
            .try_get(0)
            .map_err(|e| transport_error(table, "COUNT", e))?;
        Ok(count as u64)
    }

    async fn execute(&self, table: &TableName, operation: &str, sql: &str) -> StevedoreResult<()> {
        let session = self.session.lock().await;
        let client = connected(&session, table)?;
        debug!(table = %table, sql, "Executing DDL");
        client
            .batch_execute(sql)
            .await
            .map_err(|e| transport_error(table, operation, e))
    }
}

#[async_trait]
impl Connection for PgDatabase {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn state(&self) -> ConnectionState {
        if self.open_count.load(Ordering::Acquire) > 0 {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    async fn open(&self) -> StevedoreResult<()> {
        let mut session = self.session.lock().await;
        if session.is_none() {
            let client = self.pool.get().await.map_err(|e| TransportError::Connection {
                table: self.target.clone(),
                reason: e.to_string(),
            })?;
            *session = Some(client);
            debug!(connection = %self.id, target = %self.target, "Session opened");
        }
        self.open_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn close(&self) -> StevedoreResult<()> {
        let mut session = self.session.lock().await;
        let count = self.open_count.load(Ordering::Acquire);
        if count == 0 {
            return Ok(());
        }
        self.open_count.store(count - 1, Ordering::Release);
        if count > 1 {
            return Ok(());
        }

        if let Some(client) = session.take() {
            if let Err(e) = client.batch_execute(dialect::DISCARD_TEMP_SQL).await {
                // the pool recycles the connection; its temp tables may survive
                warn!(connection = %self.id, error = %e, "Failed to discard temp tables");
            }
            debug!(connection = %self.id, "Session closed");
        }
        Ok(())
    }
}

#[async_trait]
impl DdlExecutor for PgDatabase {
    async fn create_table(&self, request: &CreateTable) -> StevedoreResult<()> {
        let sql = dialect::create_table_sql(request);
        self.execute(&request.table, "CREATE TABLE", &sql).await
    }

    async fn drop_table_if_exists(&self, table: &TableName) -> StevedoreResult<()> {
        self.execute(table, "DROP TABLE", &dialect::drop_table_sql(table))
            .await
    }

    async fn truncate_table(&self, table: &TableName) -> StevedoreResult<()> {
        self.execute(table, "TRUNCATE TABLE", &dialect::truncate_table_sql(table))
            .await
    }

    async fn table_exists(&self, table: &TableName) -> StevedoreResult<bool> {
        let session = self.session.lock().await;
        let client = connected(&session, table)?;
        let quoted = dialect::quote_table(table);
        let row = client
            .query_one(dialect::TABLE_EXISTS_SQL, &[&quoted])
            .await
            .map_err(|e| transport_error(table, "TABLE EXISTS", e))?;
        row.try_get(0)
            .map_err(|e| transport_error(table, "TABLE EXISTS", e))
    }

    async fn add_primary_key(&self, table: &TableName, columns: &[String]) -> StevedoreResult<()> {
        let sql = dialect::add_primary_key_sql(table, columns);
        self.execute(table, "ADD PRIMARY KEY", &sql).await
    }

    fn quote_identifier(&self, identifier: &str) -> String {
        dialect::quote_identifier(identifier)
    }
}

#[async_trait]
impl BulkTransport for PgDatabase {
    /// Streams the cursor through binary `COPY ... FROM STDIN`. With a batch
    /// size every batch is its own COPY statement; batches already written
    /// stay written when a later one fails.
    async fn bulk_copy(
        &self,
        request: &BulkCopyRequest,
        rows: &mut dyn RowCursor,
    ) -> StevedoreResult<u64> {
        let table = &request.table;
        let session = self.session.lock().await;
        let client = connected(&session, table)?;

        let store_types: Vec<StoreType> = {
            let descriptors = rows.columns();
            request
                .columns
                .iter()
                .map(|mapping| {
                    descriptors
                        .iter()
                        .find(|(index, _)| *index == mapping.source_index)
                        .map(|(_, column)| column.store_type.clone())
                        .ok_or_else(|| {
                            StevedoreError::invalid_argument(
                                "columns",
                                format!("source field {} does not exist", mapping.source_index),
                            )
                        })
                })
                .collect::<StevedoreResult<_>>()?
        };
        let types: Vec<Type> = store_types.iter().map(dialect::pg_type).collect();
        let sql = dialect::copy_in_sql(table, &request.column_names());
        let batch_size = request.options.batch_size;

        let copy = async {
            let mut total = 0u64;
            let mut exhausted = false;
            while !exhausted {
                let sink = client
                    .copy_in(sql.as_str())
                    .await
                    .map_err(|e| transport_error(table, "COPY", e))?;
                let writer = BinaryCopyInWriter::new(sink, &types);
                pin_mut!(writer);

                let mut in_batch = 0usize;
                loop {
                    if batch_size.is_some_and(|size| in_batch >= size) {
                        break;
                    }
                    if !rows.advance()? {
                        exhausted = true;
                        break;
                    }
                    let mut params: Vec<Param> = Vec::with_capacity(types.len());
                    for (mapping, store_type) in request.columns.iter().zip(&store_types) {
                        params.push(to_param(rows.get_value(mapping.source_index)?, store_type));
                    }
                    let refs: Vec<&(dyn ToSql + Sync)> = params
                        .iter()
                        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                        .collect();
                    writer
                        .as_mut()
                        .write(&refs)
                        .await
                        .map_err(|e| transport_error(table, "COPY", e))?;
                    in_batch += 1;
                }

                total += writer
                    .as_mut()
                    .finish()
                    .await
                    .map_err(|e| transport_error(table, "COPY", e))?;
            }
            Ok::<u64, StevedoreError>(total)
        };

        let started = Instant::now();
        let written = match request.options.timeout {
            Some(timeout) => tokio::time::timeout(timeout, copy).await.map_err(|_| {
                StevedoreError::from(TransportError::Failed {
                    table: table.to_string(),
                    operation: "COPY".to_string(),
                    reason: format!("timed out after {:?}", timeout),
                })
            })??,
            None => copy.await?,
        };
        debug!(
            table = %table,
            rows = written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "COPY finished"
        );
        Ok(written)
    }
}
