//! Streaming row cursor over entity records.
//!
//! The cursor presents a sequence of records as rows of a resolved shape.
//! It holds exactly one record at a time; values are computed on demand
//! from the precompiled accessor chains of the shape.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use stevedore_core::{
    ColumnDescriptor, FlattenedColumn, IdentityHandling, Record, ShapeNode, StevedoreError,
    StevedoreResult, Value,
};
use tracing::warn;

/// Row source consumed by a bulk-load transport.
pub trait RowCursor: Send {
    /// Number of fields of every row.
    fn field_count(&self) -> usize;

    /// Fields with their cursor index, in order.
    fn columns(&self) -> Vec<(usize, &ColumnDescriptor)>;

    /// Moves to the next row. `false` when exhausted.
    fn advance(&mut self) -> StevedoreResult<bool>;

    /// Value of field `index` of the current row.
    fn get_value(&mut self, index: usize) -> StevedoreResult<Value>;

    /// Number of successful `advance` calls so far.
    fn rows_read(&self) -> u64;
}

/// A note about data that will not be stored the way the caller might expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advisory {
    pub table: String,
    pub column: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CursorOptions {
    pub identity: IdentityHandling,
}

impl CursorOptions {
    pub fn new(identity: IdentityHandling) -> Self {
        Self { identity }
    }
}

type RecordIter<'a> = Box<dyn Iterator<Item = Record<'a>> + Send + 'a>;

/// [`RowCursor`] over the records of one shape level.
pub struct EntityCursor<'a> {
    shape: Arc<ShapeNode>,
    columns: Vec<FlattenedColumn>,
    identity: IdentityHandling,
    records: Option<RecordIter<'a>>,
    current: Option<Record<'a>>,
    rows_read: u64,
    warned: Vec<bool>,
    advisories: Vec<Advisory>,
    disposed: bool,
}

impl<'a> EntityCursor<'a> {
    pub fn new<I>(shape: Arc<ShapeNode>, records: I, options: CursorOptions) -> Self
    where
        I: IntoIterator<Item = Record<'a>>,
        I::IntoIter: Send + 'a,
    {
        let columns: Vec<FlattenedColumn> = shape
            .flatten()
            .into_iter()
            .filter(|c| {
                !(options.identity == IdentityHandling::Ignore && c.descriptor.generated_on_insert)
            })
            .collect();
        let warned = vec![false; columns.len()];

        Self {
            shape,
            columns,
            identity: options.identity,
            records: Some(Box::new(records.into_iter())),
            current: None,
            rows_read: 0,
            warned,
            advisories: Vec::new(),
            disposed: false,
        }
    }

    /// Cursor over root entities.
    pub fn over<T: Any + Send + Sync>(
        shape: Arc<ShapeNode>,
        entities: &'a [T],
        options: CursorOptions,
    ) -> Self {
        Self::new(
            shape,
            entities.iter().map(|e| Record::root(e)),
            options,
        )
    }

    pub fn shape(&self) -> &ShapeNode {
        &self.shape
    }

    /// Advisories recorded so far, one per affected column.
    pub fn advisories(&self) -> &[Advisory] {
        &self.advisories
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Releases the underlying iteration. Later reads fail with `Disposed`.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.records = None;
        self.current = None;
    }

    fn ensure_not_disposed(&self) -> StevedoreResult<()> {
        if self.disposed {
            return Err(StevedoreError::disposed("EntityCursor"));
        }
        Ok(())
    }

    fn note_hazard(&mut self, index: usize, value: &Value) {
        if self.warned[index] || !value.is_empty_like() {
            return;
        }
        let column = &self.columns[index].descriptor;
        if !column.is_default_hazard() {
            return;
        }
        self.warned[index] = true;

        let table = self.shape.table.to_string();
        warn!(
            table = %table,
            column = %column.name,
            value = %value,
            "Column is NOT NULL with a database default; the value is sent as-is and the default is not applied"
        );
        self.advisories.push(Advisory {
            table,
            column: column.name.clone(),
            message: format!(
                "value {} is written literally; the database default is not applied",
                value
            ),
        });
    }
}

impl RowCursor for EntityCursor<'_> {
    fn field_count(&self) -> usize {
        self.columns.len()
    }

    fn columns(&self) -> Vec<(usize, &ColumnDescriptor)> {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, c)| (i, &c.descriptor))
            .collect()
    }

    fn advance(&mut self) -> StevedoreResult<bool> {
        self.ensure_not_disposed()?;
        let next = self.records.as_mut().and_then(|records| records.next());
        match next {
            Some(record) => {
                self.current = Some(record);
                self.rows_read += 1;
                Ok(true)
            }
            None => {
                self.current = None;
                Ok(false)
            }
        }
    }

    fn get_value(&mut self, index: usize) -> StevedoreResult<Value> {
        self.ensure_not_disposed()?;
        let record = self.current.as_ref().ok_or_else(|| {
            StevedoreError::invalid_argument("index", "no current row; call advance first")
        })?;
        let column = self.columns.get(index).ok_or_else(|| {
            StevedoreError::invalid_argument(
                "index",
                format!("field {} out of range 0..{}", index, self.columns.len()),
            )
        })?;

        let mut value = record.value_of(&column.descriptor, &column.chain);
        if self.identity == IdentityHandling::ZeroToNull
            && column.descriptor.generated_on_insert
            && value.is_zero()
        {
            value = Value::Null;
        }

        self.note_hazard(index, &value);
        Ok(value)
    }

    fn rows_read(&self) -> u64 {
        self.rows_read
    }
}

impl fmt::Debug for EntityCursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityCursor")
            .field("table", &self.shape.table)
            .field("fields", &self.columns.len())
            .field("rows_read", &self.rows_read)
            .field("disposed", &self.disposed)
            .finish()
    }
}
