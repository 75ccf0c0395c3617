//! Temporary table naming strategies.

use stevedore_core::{StevedoreResult, TableName, TempTableNaming};
use stevedore_storage::{NameLeasing, ShapeKey, SuffixLease};
use uuid::Uuid;

/// A chosen temp table name and the lease backing it, if any.
#[derive(Debug)]
pub(crate) struct TempTableName {
    pub table: TableName,
    pub lease: Option<SuffixLease>,
}

/// Picks the name of the temp table for a shape level stored in `base`.
///
/// `path` holds the navigation names from the root to the level; it is empty
/// for the root. Temp tables are session scoped, so the schema is dropped.
pub(crate) fn temp_table_name(
    naming: &TempTableNaming,
    base: &TableName,
    path: &[String],
    leasing: &NameLeasing,
) -> StevedoreResult<TempTableName> {
    let named = |name: String| TempTableName {
        table: TableName::new(name),
        lease: None,
    };

    Ok(match naming {
        TempTableNaming::Default => named(base.name.clone()),
        TempTableNaming::Fixed(name) if path.is_empty() => named(name.clone()),
        TempTableNaming::Fixed(name) => named(format!("{}_{}", name, path.join("_"))),
        TempTableNaming::Reusable => {
            let lease = leasing.lease(ShapeKey::from(base))?;
            TempTableName {
                table: TableName::new(format!("{}_{}", base.name, lease.suffix())),
                lease: Some(lease),
            }
        }
        TempTableNaming::Unique => named(format!("{}_{}", base.name, Uuid::now_v7().simple())),
    })
}
