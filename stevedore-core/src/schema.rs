//! Resolved shape types: tables, column descriptors and the shape tree.
//!
//! A [`ShapeNode`] tree is built once per entity type and selection by the
//! [`ShapeResolver`](crate::ShapeResolver). Everything in here is immutable
//! after construction; accessors are precompiled closures so reading a row
//! never inspects the entity model again.

use crate::value::{StoreType, Value};
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// Type-erased entity instance as seen by accessors.
pub type Object = dyn Any + Send + Sync;

/// Reads the raw value of a scalar member.
pub type ValueGetter = Arc<dyn Fn(&Object) -> Value + Send + Sync>;

/// Converts a domain value into its storage representation.
pub type ValueConverter = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Reads an owned reference; `None` when the reference is not set.
pub type ReferenceGetter = Arc<dyn for<'a> Fn(&'a Object) -> Option<&'a Object> + Send + Sync>;

/// Reads an owned collection.
pub type CollectionGetter = Arc<dyn for<'a> Fn(&'a Object) -> Vec<&'a Object> + Send + Sync>;

/// Pins the higher-ranked signature of a reference accessor closure.
pub fn reference_getter<F>(f: F) -> ReferenceGetter
where
    F: for<'a> Fn(&'a Object) -> Option<&'a Object> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Pins the higher-ranked signature of a collection accessor closure.
pub fn collection_getter<F>(f: F) -> CollectionGetter
where
    F: for<'a> Fn(&'a Object) -> Vec<&'a Object> + Send + Sync + 'static,
{
    Arc::new(f)
}

// ============================================================================
// TABLE NAMES
// ============================================================================

/// Destination table identifier (unquoted).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    pub fn with_schema(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }

    /// Same schema, different table name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            schema: self.schema.clone(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

// ============================================================================
// COLUMN DESCRIPTORS
// ============================================================================

/// Where the value of a column comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnOrigin {
    /// A member of the entity, read through the accessor chain.
    Member,
    /// The i-th key value of the owning row (synthesized back reference).
    OwnerKey(usize),
    /// Position of the entity within the owner's collection.
    Ordinal,
}

/// One destination column.
#[derive(Clone)]
pub struct ColumnDescriptor {
    /// Destination column name, prefixed for inline owned members.
    pub name: String,
    /// Member path from the level's entity, e.g. `billing.street`.
    pub member: String,
    pub store_type: StoreType,
    pub nullable: bool,
    pub is_key: bool,
    pub generated_on_insert: bool,
    pub has_default: bool,
    pub origin: ColumnOrigin,
    getter: Option<ValueGetter>,
    converter: Option<ValueConverter>,
}

impl ColumnDescriptor {
    /// Column backed by an entity member.
    pub fn member(
        name: impl Into<String>,
        member: impl Into<String>,
        store_type: StoreType,
        getter: ValueGetter,
    ) -> Self {
        Self {
            name: name.into(),
            member: member.into(),
            store_type,
            nullable: false,
            is_key: false,
            generated_on_insert: false,
            has_default: false,
            origin: ColumnOrigin::Member,
            getter: Some(getter),
            converter: None,
        }
    }

    /// Synthesized column whose value comes from the record, not the entity.
    pub fn synthesized(name: impl Into<String>, store_type: StoreType, origin: ColumnOrigin) -> Self {
        let name = name.into();
        Self {
            member: name.clone(),
            name,
            store_type,
            nullable: false,
            is_key: true,
            generated_on_insert: false,
            has_default: false,
            origin,
            getter: None,
            converter: None,
        }
    }

    pub fn with_converter(mut self, converter: Option<ValueConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn has_converter(&self) -> bool {
        self.converter.is_some()
    }

    /// Raw value of the member, before conversion. `Null` for synthesized columns.
    pub fn read_raw(&self, entity: &Object) -> Value {
        match &self.getter {
            Some(getter) => getter(entity),
            None => Value::Null,
        }
    }

    /// Applies the converter to non-null values; null passes through.
    pub fn convert(&self, raw: Value) -> Value {
        match (&self.converter, raw) {
            (_, Value::Null) => Value::Null,
            (Some(converter), value) => converter(value),
            (None, value) => value,
        }
    }

    /// NOT NULL with a database DEFAULT: the transport will send empty values
    /// literally instead of letting the database substitute the default.
    pub fn is_default_hazard(&self) -> bool {
        self.has_default && !self.nullable
    }
}

impl fmt::Debug for ColumnDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnDescriptor")
            .field("name", &self.name)
            .field("member", &self.member)
            .field("store_type", &self.store_type)
            .field("nullable", &self.nullable)
            .field("is_key", &self.is_key)
            .field("generated_on_insert", &self.generated_on_insert)
            .field("has_default", &self.has_default)
            .field("origin", &self.origin)
            .field("converter", &self.converter.is_some())
            .finish()
    }
}

// ============================================================================
// NAVIGATIONS
// ============================================================================

/// How an owned object is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnedKind {
    /// Extra columns in the owner's table.
    Inline,
    /// Own table, linked back by a synthesized key.
    Separate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    Reference,
    Collection,
}

#[derive(Clone)]
pub enum NavigationAccessor {
    Reference(ReferenceGetter),
    Collection(CollectionGetter),
}

impl NavigationAccessor {
    pub fn cardinality(&self) -> Cardinality {
        match self {
            NavigationAccessor::Reference(_) => Cardinality::Reference,
            NavigationAccessor::Collection(_) => Cardinality::Collection,
        }
    }

    /// Owned objects reachable from `owner`; null references are skipped.
    pub fn project<'a>(&self, owner: &'a Object) -> Vec<&'a Object> {
        match self {
            NavigationAccessor::Reference(getter) => getter(owner).into_iter().collect(),
            NavigationAccessor::Collection(getter) => getter(owner),
        }
    }
}

/// The navigation a child shape node hangs off.
#[derive(Clone)]
pub struct NavigationDescriptor {
    pub name: String,
    pub kind: OwnedKind,
    pub required: bool,
    pub accessor: NavigationAccessor,
}

impl NavigationDescriptor {
    pub fn cardinality(&self) -> Cardinality {
        self.accessor.cardinality()
    }
}

impl fmt::Debug for NavigationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NavigationDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("cardinality", &self.cardinality())
            .field("required", &self.required)
            .finish()
    }
}

// ============================================================================
// SHAPE TREE
// ============================================================================

/// One level of the object graph.
#[derive(Debug, Clone)]
pub struct ShapeNode {
    pub entity: String,
    pub type_id: TypeId,
    /// Table the level is stored in. Inline nodes carry their owner's table.
    pub table: TableName,
    /// `None` for the root.
    pub navigation: Option<NavigationDescriptor>,
    pub columns: Vec<ColumnDescriptor>,
    /// Synthesized back reference of a separate node (owner key, ordinal).
    pub back_reference: Vec<ColumnDescriptor>,
    /// Columns identifying a row of this level. Root: declared key members;
    /// separate node: the back reference; inline node: empty.
    pub key: Vec<ColumnDescriptor>,
    pub children: Vec<ShapeNode>,
}

impl ShapeNode {
    pub fn kind(&self) -> Option<OwnedKind> {
        self.navigation.as_ref().map(|n| n.kind)
    }

    pub fn inline_children(&self) -> impl Iterator<Item = &ShapeNode> {
        self.children
            .iter()
            .filter(|c| c.kind() == Some(OwnedKind::Inline))
    }

    pub fn separate_children(&self) -> impl Iterator<Item = &ShapeNode> {
        self.children
            .iter()
            .filter(|c| c.kind() == Some(OwnedKind::Separate))
    }

    /// Pre-order flattening of everything stored in this node's table:
    /// own columns, back reference, then inline children recursively.
    /// Separate children are skipped.
    pub fn flatten(&self) -> Vec<FlattenedColumn> {
        let mut out = Vec::new();
        for column in self.columns.iter().chain(self.back_reference.iter()) {
            out.push(FlattenedColumn {
                descriptor: column.clone(),
                chain: Vec::new(),
            });
        }
        for child in self.inline_children() {
            child.flatten_inline(&[], &mut out);
        }
        out
    }

    fn flatten_inline(&self, parent_chain: &[ReferenceGetter], out: &mut Vec<FlattenedColumn>) {
        let mut chain = parent_chain.to_vec();
        if let Some(NavigationDescriptor {
            accessor: NavigationAccessor::Reference(getter),
            ..
        }) = &self.navigation
        {
            chain.push(getter.clone());
        }

        for column in &self.columns {
            out.push(FlattenedColumn {
                descriptor: column.clone(),
                chain: chain.clone(),
            });
        }
        for child in self.inline_children() {
            child.flatten_inline(&chain, out);
        }
    }

    /// Destination column names of this node's table, in cursor order.
    pub fn column_names(&self) -> Vec<String> {
        self.flatten()
            .into_iter()
            .map(|c| c.descriptor.name)
            .collect()
    }

    /// Key values identifying `record` at this level.
    pub fn key_values(&self, record: &Record<'_>) -> Vec<Value> {
        self.key
            .iter()
            .map(|column| record.value_of(column, &[]))
            .collect()
    }
}

/// A column together with the inline navigation chain leading to it.
#[derive(Clone)]
pub struct FlattenedColumn {
    pub descriptor: ColumnDescriptor,
    pub chain: Vec<ReferenceGetter>,
}

impl fmt::Debug for FlattenedColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlattenedColumn")
            .field("descriptor", &self.descriptor)
            .field("depth", &self.chain.len())
            .finish()
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// One item handed to a row cursor.
#[derive(Clone)]
pub struct Record<'a> {
    pub entity: &'a Object,
    /// Key values of the owning row; empty for root records.
    pub owner_key: Arc<[Value]>,
    /// Position within the owner's collection, when owned through one.
    pub ordinal: Option<i32>,
}

impl<'a> Record<'a> {
    pub fn root(entity: &'a Object) -> Self {
        Self {
            entity,
            owner_key: Arc::from(Vec::new()),
            ordinal: None,
        }
    }

    pub fn owned(entity: &'a Object, owner_key: Arc<[Value]>, ordinal: Option<i32>) -> Self {
        Self {
            entity,
            owner_key,
            ordinal,
        }
    }

    /// Converted value of `column`. The chain is walked first; a null
    /// intermediate object yields `Null` without touching the leaf accessor.
    pub fn value_of(&self, column: &ColumnDescriptor, chain: &[ReferenceGetter]) -> Value {
        match column.origin {
            ColumnOrigin::OwnerKey(i) => self.owner_key.get(i).cloned().unwrap_or(Value::Null),
            ColumnOrigin::Ordinal => self.ordinal.map_or(Value::Null, Value::Int),
            ColumnOrigin::Member => {
                let mut current: &Object = self.entity;
                for step in chain {
                    match step(current) {
                        Some(next) => current = next,
                        None => return Value::Null,
                    }
                }
                column.convert(column.read_raw(current))
            }
        }
    }
}
