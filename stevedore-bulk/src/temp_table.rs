//! Temporary table creation and the query handle returned to callers.

use crate::executor::{cancellable, InsertSummary};
use crate::naming::temp_table_name;
use crate::table_ref::{TableReference, TempTableReference};
use std::sync::Arc;
use stevedore_core::{
    PrimaryKeyCreation, ShapeNode, StevedoreError, StevedoreResult, TableName,
    TempTableCreationOptions,
};
use stevedore_storage::{CreateTable, Database, DdlExecutor, NameLeasing, TableColumn};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Rows loaded into a temporary table, ready to be queried.
#[derive(Debug)]
pub struct TempTableQuery {
    pub table: TableName,
    /// Columns of the table, in creation order.
    pub columns: Vec<String>,
    /// `SELECT` over every column of the table.
    pub sql: String,
    pub summary: InsertSummary,
    reference: TableReference,
}

impl TempTableQuery {
    pub(crate) fn new(
        columns: Vec<String>,
        sql: String,
        summary: InsertSummary,
        reference: TableReference,
    ) -> Self {
        Self {
            table: reference.table().clone(),
            columns,
            sql,
            summary,
            reference,
        }
    }

    pub fn reference(&self) -> &TableReference {
        &self.reference
    }

    pub fn into_reference(self) -> TableReference {
        self.reference
    }

    /// Releases every table of the query. See [`TableReference::release`].
    pub async fn release(&mut self) -> StevedoreResult<()> {
        self.reference.release().await
    }
}

/// `SELECT "a", "b" FROM "table"`.
pub(crate) fn select_sql(ddl: &dyn DdlExecutor, table: &TableName, columns: &[String]) -> String {
    let columns: Vec<String> = columns.iter().map(|c| ddl.quote_identifier(c)).collect();
    format!("SELECT {} FROM {}", columns.join(", "), ddl.quote_table(table))
}

/// A freshly created (or truncated) temp table of one shape level.
pub(crate) struct CreatedLevel {
    pub reference: TempTableReference,
    /// The table already existed and was truncated instead of created.
    pub truncated: bool,
    pub key: Vec<String>,
}

/// Names of the key columns a primary key needs that the level does not have.
fn missing_key_columns(node: &ShapeNode, columns: &[TableColumn]) -> Vec<String> {
    node.key
        .iter()
        .filter(|k| !columns.iter().any(|c| c.name == k.name))
        .map(|k| k.name.clone())
        .collect()
}

/// Creates the temp table of `node`. The returned reference owns one open
/// count on `database` and the name lease.
pub(crate) async fn create_level(
    database: &Arc<dyn Database>,
    node: &ShapeNode,
    path: &[String],
    options: &TempTableCreationOptions,
    leasing: &NameLeasing,
    cancel: &CancellationToken,
) -> StevedoreResult<CreatedLevel> {
    let columns: Vec<TableColumn> = node
        .flatten()
        .iter()
        .map(|c| TableColumn::from(&c.descriptor))
        .collect();

    let key: Vec<String> = if options.primary_key == PrimaryKeyCreation::None {
        Vec::new()
    } else {
        let missing = missing_key_columns(node, &columns);
        if !missing.is_empty() {
            return Err(StevedoreError::MissingKeyColumns {
                table: node.table.to_string(),
                columns: missing,
            });
        }
        node.key.iter().map(|k| k.name.clone()).collect()
    };

    let name = temp_table_name(&options.naming, &node.table, path, leasing)?;
    let table = name.table.clone();

    cancellable(cancel, "open connection", database.open()).await?;

    let ddl: StevedoreResult<bool> = async {
        let exists = options.truncate_table_if_exists
            && cancellable(cancel, "check table", database.table_exists(&table)).await?;
        if exists {
            debug!(table = %table, "Truncating existing temp table");
            cancellable(cancel, "truncate table", database.truncate_table(&table)).await?;
            return Ok(true);
        }

        let mut request = CreateTable::new(table.clone(), columns).temporary();
        if options.primary_key == PrimaryKeyCreation::BeforeBulkInsert {
            request = request.with_primary_key(key.clone());
        }
        debug!(
            table = %table,
            columns = request.columns.len(),
            primary_key = ?request.primary_key,
            "Creating temp table"
        );
        cancellable(cancel, "create table", database.create_table(&request)).await?;
        Ok(false)
    }
    .await;

    match ddl {
        Ok(truncated) => Ok(CreatedLevel {
            reference: TempTableReference::new(
                Arc::clone(database),
                table,
                options.drop_table_on_release,
                name.lease,
            ),
            truncated,
            key,
        }),
        Err(e) => {
            // nothing was created; give back the open count only
            if let Err(close_err) = database.close().await {
                warn!(table = %table, error = %close_err, "Failed to close connection after failed DDL");
            }
            Err(e)
        }
    }
}
