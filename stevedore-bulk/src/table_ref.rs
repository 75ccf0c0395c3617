//! Handles to created temporary tables.
//!
//! A reference owns one open count on its connection and, for reusable
//! names, the leased suffix. Dropping a table is async, so `release` is an
//! explicit call; a reference dropped without it schedules the cleanup on
//! the current runtime and logs a warning.

use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use stevedore_core::{StevedoreError, StevedoreResult, TableName};
use stevedore_storage::{Database, SuffixLease};
use tracing::{debug, warn};

/// Drops `table` if asked to and the connection is still open, then gives
/// back the reference's open count.
async fn release_table(
    database: &dyn Database,
    table: &TableName,
    drop_table: bool,
) -> StevedoreResult<()> {
    let dropped = if !drop_table {
        Ok(())
    } else if database.is_open() {
        debug!(table = %table, "Dropping temp table");
        database.drop_table_if_exists(table).await
    } else {
        warn!(table = %table, "Connection is closed, temp table is not dropped");
        Ok(())
    };
    let closed = database.close().await;
    dropped.and(closed)
}

/// One temporary table.
pub struct TempTableReference {
    database: Arc<dyn Database>,
    table: TableName,
    drop_on_release: bool,
    lease: Option<SuffixLease>,
    released: bool,
}

impl TempTableReference {
    /// `database` must already carry the open count this reference owns.
    pub(crate) fn new(
        database: Arc<dyn Database>,
        table: TableName,
        drop_on_release: bool,
        lease: Option<SuffixLease>,
    ) -> Self {
        Self {
            database,
            table,
            drop_on_release,
            lease,
            released: false,
        }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Drops the table (if configured and the connection is open), closes
    /// the reference's open count and returns the name lease. The lease is
    /// returned even when dropping fails.
    pub async fn release(&mut self) -> StevedoreResult<()> {
        if self.released {
            return Err(StevedoreError::disposed(format!(
                "temp table reference {}",
                self.table
            )));
        }
        self.released = true;
        let result = release_table(self.database.as_ref(), &self.table, self.drop_on_release).await;
        drop(self.lease.take());
        result
    }
}

impl Drop for TempTableReference {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        warn!(table = %self.table, "Temp table reference dropped without release");

        let database = Arc::clone(&self.database);
        let table = self.table.clone();
        let drop_table = self.drop_on_release;
        let lease = self.lease.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = release_table(database.as_ref(), &table, drop_table).await {
                        warn!(table = %table, error = %e, "Deferred temp table cleanup failed");
                    }
                    // the name becomes reusable only after the table is gone
                    drop(lease);
                });
            }
            Err(_) => {
                warn!(table = %table, "No async runtime, temp table is left to the session");
            }
        }
    }
}

impl fmt::Debug for TempTableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempTableReference")
            .field("table", &self.table)
            .field("drop_on_release", &self.drop_on_release)
            .field("suffix", &self.lease.as_ref().map(SuffixLease::suffix))
            .field("released", &self.released)
            .finish()
    }
}

/// A temporary table together with the tables of its separately stored
/// owned types.
#[derive(Debug)]
pub struct TableReference {
    root: TempTableReference,
    children: Vec<TableReference>,
}

impl Drop for TableReference {
    /// Same order as `release`: children most recent first, then the owner.
    fn drop(&mut self) {
        while let Some(child) = self.children.pop() {
            drop(child);
        }
    }
}

impl TableReference {
    pub(crate) fn new(root: TempTableReference) -> Self {
        Self {
            root,
            children: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, child: TableReference) {
        self.children.push(child);
    }

    /// The owner's table.
    pub fn table(&self) -> &TableName {
        self.root.table()
    }

    pub fn children(&self) -> &[TableReference] {
        &self.children
    }

    /// Every table of the tree, owner first.
    pub fn tables(&self) -> Vec<TableName> {
        let mut tables = vec![self.root.table().clone()];
        for child in &self.children {
            tables.extend(child.tables());
        }
        tables
    }

    pub fn is_released(&self) -> bool {
        self.root.is_released()
    }

    /// Releases children, most recent first, then the owner. Every table is
    /// attempted; the first failure is returned. A second call fails with
    /// `Disposed`.
    pub fn release(&mut self) -> BoxFuture<'_, StevedoreResult<()>> {
        Box::pin(async move {
            if self.root.is_released() {
                return Err(StevedoreError::disposed(format!(
                    "table reference {}",
                    self.root.table()
                )));
            }
            let mut first_error = None;
            for child in self.children.iter_mut().rev() {
                if let Err(e) = child.release().await {
                    warn!(table = %child.table(), error = %e, "Failed to release owned temp table");
                    first_error.get_or_insert(e);
                }
            }
            if let Err(e) = self.root.release().await {
                first_error.get_or_insert(e);
            }
            first_error.map_or(Ok(()), Err)
        })
    }

    /// Cleanup after a failed operation: every error is logged, none returned.
    pub(crate) async fn release_quietly(&mut self) {
        if self.root.is_released() {
            return;
        }
        if let Err(e) = self.release().await {
            warn!(table = %self.table(), error = %e, "Cleanup of temp tables failed");
        }
    }
}
