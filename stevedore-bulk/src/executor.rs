//! Bulk insert orchestration.
//!
//! Every top-level call resolves the shape, opens the connection once,
//! writes the root level, recurses into separately stored owned types on the
//! same connection and closes the connection again. Temp table calls clean up
//! every table they created when any step fails and return the original
//! error.

use crate::table_ref::TableReference;
use crate::temp_table::{create_level, select_sql, CreatedLevel, TempTableQuery};
use futures_util::future::BoxFuture;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use stevedore_core::{
    BulkCopyOptions, BulkInsertOptions, Cardinality, PrimaryKeyCreation, Record, ShapeError,
    ShapeNode, ShapePurpose, ShapeResolver, StevedoreError, StevedoreResult, TableName,
    TempTableBulkInsertOptions, TempTableCreationOptions, Value,
};
use stevedore_storage::{
    Advisory, BulkCopyRequest, ColumnMapping, CursorOptions, Database, EntityCursor,
    NameLeaseCache, NameLeasing, RowCursor,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Races `future` against `cancel`. Cancellation wins ties.
pub(crate) async fn cancellable<T, F>(
    cancel: &CancellationToken,
    operation: &str,
    future: F,
) -> StevedoreResult<T>
where
    F: Future<Output = StevedoreResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(operation, "Operation cancelled");
            Err(StevedoreError::cancelled(operation))
        }
        result = future => result,
    }
}

// ============================================================================
// SUMMARY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRows {
    pub table: TableName,
    pub rows: u64,
}

/// Rows written per table and advisories raised while reading entities.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertSummary {
    pub tables: Vec<TableRows>,
    pub advisories: Vec<Advisory>,
}

impl InsertSummary {
    pub fn total_rows(&self) -> u64 {
        self.tables.iter().map(|t| t.rows).sum()
    }

    pub fn rows_for(&self, table: &TableName) -> u64 {
        self.tables
            .iter()
            .filter(|t| &t.table == table)
            .map(|t| t.rows)
            .sum()
    }

    fn record(&mut self, table: TableName, rows: u64, advisories: Vec<Advisory>) {
        self.tables.push(TableRows { table, rows });
        self.advisories.extend(advisories);
    }
}

// ============================================================================
// BULK INSERTER
// ============================================================================

type ChildRecords<'a> = Vec<(Arc<ShapeNode>, Vec<Record<'a>>)>;

/// Bulk inserts entities through one database connection.
pub struct BulkInserter<D> {
    database: Arc<D>,
    resolver: Arc<ShapeResolver>,
    leases: Arc<NameLeaseCache>,
}

impl<D: Database + 'static> BulkInserter<D> {
    pub fn new(database: Arc<D>, resolver: Arc<ShapeResolver>, leases: Arc<NameLeaseCache>) -> Self {
        Self {
            database,
            resolver,
            leases,
        }
    }

    pub fn database(&self) -> &Arc<D> {
        &self.database
    }

    pub fn resolver(&self) -> &Arc<ShapeResolver> {
        &self.resolver
    }

    /// Inserts `entities` into their tables, separately stored owned types
    /// included.
    pub async fn bulk_insert<T: Any + Send + Sync>(
        &self,
        entities: &[T],
        options: &BulkInsertOptions,
        cancel: &CancellationToken,
    ) -> StevedoreResult<InsertSummary> {
        options.validate()?;
        let shape = self
            .resolver
            .resolve_for::<T>(options.members.as_ref(), ShapePurpose::Insert)?;
        let table = with_schema(&shape.table, options.schema.as_deref());

        cancellable(cancel, "open connection", self.database.open()).await?;

        let mut summary = InsertSummary::default();
        let records = entities.iter().map(|e| Record::root(e)).collect();
        let result = self
            .insert_tree(shape, table, records, options, cancel, &mut summary)
            .await;

        let closed = self.database.close().await;
        match (result, closed) {
            (Ok(()), Ok(())) => Ok(summary),
            (Ok(()), Err(e)) => Err(e),
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    warn!(error = %close_err, "Failed to close connection after failed bulk insert");
                }
                Err(e)
            }
        }
    }

    /// Creates temp tables for `T` (and its separately stored owned types)
    /// and loads `entities` into them.
    pub async fn bulk_insert_into_temp_table<T: Any + Send + Sync>(
        &self,
        entities: &[T],
        options: &TempTableBulkInsertOptions,
        cancel: &CancellationToken,
    ) -> StevedoreResult<TempTableQuery> {
        options.validate()?;
        let shape = self
            .resolver
            .resolve_for::<T>(options.creation.members.as_ref(), ShapePurpose::TempTable)?;

        cancellable(cancel, "open connection", self.database.open()).await?;

        let leasing = self.leases.leasing(self.database.connection_id());
        let mut summary = InsertSummary::default();
        let records = entities.iter().map(|e| Record::root(e)).collect();
        let result = self
            .temp_tree(
                Arc::clone(&shape),
                Vec::new(),
                Some(records),
                &options.creation,
                &options.copy,
                &leasing,
                cancel,
                &mut summary,
            )
            .await;
        leasing.dispose();

        let reference = self.close_keeping(result).await?;
        let columns = shape.column_names();
        let sql = select_sql(self.database.as_ref(), reference.table(), &columns);
        Ok(TempTableQuery::new(columns, sql, summary, reference))
    }

    /// Creates empty temp tables for `T` and its separately stored owned types.
    pub async fn create_temp_table<T: Any + Send + Sync>(
        &self,
        options: &TempTableCreationOptions,
        cancel: &CancellationToken,
    ) -> StevedoreResult<TableReference> {
        options.validate()?;
        let shape = self
            .resolver
            .resolve_for::<T>(options.members.as_ref(), ShapePurpose::TempTable)?;

        cancellable(cancel, "open connection", self.database.open()).await?;

        let leasing = self.leases.leasing(self.database.connection_id());
        let copy = BulkCopyOptions::default();
        let mut summary = InsertSummary::default();
        let result = self
            .temp_tree(
                shape,
                Vec::new(),
                None,
                options,
                &copy,
                &leasing,
                cancel,
                &mut summary,
            )
            .await;
        leasing.dispose();

        self.close_keeping(result).await
    }

    /// Closes the top-level open count. A reference that survives a failed
    /// close is released before the close error is returned.
    async fn close_keeping(
        &self,
        result: StevedoreResult<TableReference>,
    ) -> StevedoreResult<TableReference> {
        let closed = self.database.close().await;
        match (result, closed) {
            (Ok(reference), Ok(())) => Ok(reference),
            (Ok(mut reference), Err(e)) => {
                reference.release_quietly().await;
                Err(e)
            }
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    warn!(error = %close_err, "Failed to close connection after failed temp table insert");
                }
                Err(e)
            }
        }
    }

    fn insert_tree<'f, 'a: 'f>(
        &'f self,
        node: Arc<ShapeNode>,
        table: TableName,
        records: Vec<Record<'a>>,
        options: &'f BulkInsertOptions,
        cancel: &'f CancellationToken,
        summary: &'f mut InsertSummary,
    ) -> BoxFuture<'f, StevedoreResult<()>> {
        Box::pin(async move {
            let children = project_children(&node, &records)?;
            self.copy_rows(&node, &table, records, &options.copy, cancel, summary)
                .await?;

            for (child, child_records) in children {
                let child_table = with_schema(&child.table, options.schema.as_deref());
                self.insert_tree(child, child_table, child_records, options, cancel, summary)
                    .await?;
            }
            Ok(())
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn temp_tree<'f, 'a: 'f>(
        &'f self,
        node: Arc<ShapeNode>,
        path: Vec<String>,
        records: Option<Vec<Record<'a>>>,
        creation: &'f TempTableCreationOptions,
        copy: &'f BulkCopyOptions,
        leasing: &'f NameLeasing,
        cancel: &'f CancellationToken,
        summary: &'f mut InsertSummary,
    ) -> BoxFuture<'f, StevedoreResult<TableReference>> {
        Box::pin(async move {
            let database: Arc<dyn Database> = self.database.clone();
            let CreatedLevel {
                reference: root,
                truncated,
                key,
            } = create_level(&database, &node, &path, creation, leasing, cancel).await?;
            let mut reference = TableReference::new(root);

            let result: StevedoreResult<()> = async {
                let children: Vec<(Arc<ShapeNode>, Option<Vec<Record<'a>>>)> = match &records {
                    Some(records) => project_children(&node, records)?
                        .into_iter()
                        .map(|(child, rows)| (child, Some(rows)))
                        .collect(),
                    None => node
                        .separate_children()
                        .map(|child| (Arc::new(child.clone()), None))
                        .collect(),
                };

                if let Some(records) = records {
                    let table = reference.table().clone();
                    self.copy_rows(&node, &table, records, copy, cancel, summary)
                        .await?;
                }

                if creation.primary_key == PrimaryKeyCreation::AfterBulkInsert
                    && !truncated
                    && !key.is_empty()
                {
                    debug!(table = %reference.table(), key = ?key, "Adding primary key");
                    cancellable(
                        cancel,
                        "add primary key",
                        self.database.add_primary_key(reference.table(), &key),
                    )
                    .await?;
                }

                for (child, child_records) in children {
                    let mut child_path = path.clone();
                    if let Some(navigation) = &child.navigation {
                        child_path.push(navigation.name.clone());
                    }
                    let child_reference = self
                        .temp_tree(
                            child,
                            child_path,
                            child_records,
                            creation,
                            copy,
                            leasing,
                            cancel,
                            summary,
                        )
                        .await?;
                    reference.push(child_reference);
                }
                Ok(())
            }
            .await;

            match result {
                Ok(()) => Ok(reference),
                Err(e) => {
                    reference.release_quietly().await;
                    Err(e)
                }
            }
        })
    }

    async fn copy_rows<'a>(
        &self,
        node: &Arc<ShapeNode>,
        table: &TableName,
        records: Vec<Record<'a>>,
        copy: &BulkCopyOptions,
        cancel: &CancellationToken,
        summary: &mut InsertSummary,
    ) -> StevedoreResult<u64> {
        let mut cursor = EntityCursor::new(Arc::clone(node), records, CursorOptions::new(copy.identity));
        let request = BulkCopyRequest {
            table: table.clone(),
            columns: cursor
                .columns()
                .into_iter()
                .map(|(index, column)| ColumnMapping {
                    source_index: index,
                    column_name: column.name.clone(),
                })
                .collect(),
            options: copy.clone(),
        };
        let columns = request.column_names().join(", ");

        info!(
            table = %table,
            columns = %columns,
            batch_size = ?copy.batch_size,
            timeout = ?copy.timeout,
            streaming = copy.enable_streaming,
            identity = ?copy.identity,
            "Executing bulk copy"
        );
        let started = Instant::now();

        let result = cancellable(
            cancel,
            "bulk copy",
            self.database.bulk_copy(&request, &mut cursor),
        )
        .await;
        let advisories = cursor.advisories().to_vec();
        let read = cursor.rows_read();
        cursor.dispose();
        let rows = result?;

        info!(
            table = %table,
            columns = %columns,
            rows,
            read,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Executed bulk copy"
        );
        summary.record(table.clone(), rows, advisories);
        Ok(rows)
    }
}

/// Records of every separately stored child of `node`, each carrying the
/// owner's key values and, for collections, its position.
fn project_children<'a>(node: &ShapeNode, records: &[Record<'a>]) -> StevedoreResult<ChildRecords<'a>> {
    let mut out = Vec::new();
    for child in node.separate_children() {
        let Some(navigation) = &child.navigation else {
            continue;
        };
        let collection = navigation.cardinality() == Cardinality::Collection;

        let mut child_records = Vec::new();
        for record in records {
            let owned = navigation.accessor.project(record.entity);
            if owned.is_empty() {
                continue;
            }
            let key = node.key_values(record);
            if key.iter().any(Value::is_null) {
                return Err(ShapeError::UnsupportedShape {
                    entity: node.entity.clone(),
                    navigation: navigation.name.clone(),
                    reason: "owner key value is null".to_string(),
                }
                .into());
            }
            let key: Arc<[Value]> = Arc::from(key);
            for (position, entity) in owned.into_iter().enumerate() {
                let ordinal = if collection { Some(ordinal_at(position)?) } else { None };
                child_records.push(Record::owned(entity, Arc::clone(&key), ordinal));
            }
        }
        out.push((Arc::new(child.clone()), child_records));
    }
    Ok(out)
}

/// Position of an item in an owned collection, as stored in `ordinal`.
fn ordinal_at(position: usize) -> StevedoreResult<i32> {
    i32::try_from(position).map_err(|_| {
        StevedoreError::invalid_argument(
            "entities",
            format!("owned collection position {} exceeds the ordinal range", position),
        )
    })
}

fn with_schema(table: &TableName, schema: Option<&str>) -> TableName {
    match schema {
        Some(schema) => TableName::with_schema(schema, table.name.clone()),
        None => table.clone(),
    }
}
