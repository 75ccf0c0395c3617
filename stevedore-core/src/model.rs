//! Entity model: the registered schema description of every entity type.
//!
//! Rust has no runtime reflection, so each entity type describes its columns
//! and owned navigations once through an [`EntityBuilder`]. The resulting
//! [`Model`] is the metadata provider the shape resolver works from.
//!
//! ```ignore
//! let model = Model::builder()
//!     .entity(
//!         EntityBuilder::<Customer>::new("Customer")
//!             .table("customers")
//!             .column(ColumnSpec::new("id", StoreType::Integer).key(), |c| c.id.into())
//!             .column(ColumnSpec::new("name", StoreType::Text), |c| c.name.as_str().into())
//!             .owns_one::<Address>(NavigationSpec::new("billing"), |c| c.billing.as_ref())
//!             .owns_many::<Order>(NavigationSpec::new("orders"), |c| c.orders.as_slice()),
//!     )
//!     .entity(EntityBuilder::<Address>::new("Address").column(/* ... */))
//!     .entity(EntityBuilder::<Order>::new("Order").table("customer_orders"))
//!     .build()?;
//! ```

use crate::error::{StevedoreError, StevedoreResult};
use crate::schema::{
    collection_getter, reference_getter, Cardinality, NavigationAccessor, Object, TableName,
    ValueConverter, ValueGetter,
};
use crate::value::{StoreType, Value};
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

// ============================================================================
// SPECS (builder inputs)
// ============================================================================

/// Declaration of a scalar member.
#[derive(Clone)]
pub struct ColumnSpec {
    member: String,
    column_name: Option<String>,
    store_type: StoreType,
    nullable: bool,
    key: bool,
    generated_on_insert: bool,
    default_sql: Option<String>,
    insertable: bool,
    converter: Option<ValueConverter>,
}

impl ColumnSpec {
    /// NOT NULL, insertable, column named after the member.
    pub fn new(member: impl Into<String>, store_type: StoreType) -> Self {
        Self {
            member: member.into(),
            column_name: None,
            store_type,
            nullable: false,
            key: false,
            generated_on_insert: false,
            default_sql: None,
            insertable: true,
            converter: None,
        }
    }

    pub fn column_name(mut self, name: impl Into<String>) -> Self {
        self.column_name = Some(name.into());
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn key(mut self) -> Self {
        self.key = true;
        self
    }

    /// Value produced by the database on insert (identity, auto-increment).
    pub fn generated_on_insert(mut self) -> Self {
        self.generated_on_insert = true;
        self
    }

    pub fn default_sql(mut self, sql: impl Into<String>) -> Self {
        self.default_sql = Some(sql.into());
        self
    }

    /// Never written by inserts (row versions, computed columns).
    pub fn not_insertable(mut self) -> Self {
        self.insertable = false;
        self
    }

    pub fn converter<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.converter = Some(Arc::new(f));
        self
    }
}

/// Declaration of a navigation.
#[derive(Debug, Clone)]
pub struct NavigationSpec {
    name: String,
    prefix: Option<String>,
    required: bool,
}

impl NavigationSpec {
    /// Optional navigation; inline columns prefixed with `<name>_`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: None,
            required: false,
        }
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

// ============================================================================
// METADATA
// ============================================================================

/// Registered description of a scalar member.
#[derive(Clone)]
pub struct ColumnMetadata {
    pub member: String,
    pub column_name: String,
    pub store_type: StoreType,
    pub nullable: bool,
    pub is_key: bool,
    pub generated_on_insert: bool,
    pub default_sql: Option<String>,
    pub insertable: bool,
    pub getter: ValueGetter,
    pub converter: Option<ValueConverter>,
}

impl ColumnMetadata {
    pub fn has_default(&self) -> bool {
        self.default_sql.is_some()
    }
}

impl fmt::Debug for ColumnMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnMetadata")
            .field("member", &self.member)
            .field("column_name", &self.column_name)
            .field("store_type", &self.store_type)
            .field("nullable", &self.nullable)
            .field("is_key", &self.is_key)
            .field("insertable", &self.insertable)
            .finish()
    }
}

/// Registered description of a navigation.
#[derive(Clone)]
pub struct NavigationMetadata {
    pub name: String,
    pub target: TypeId,
    pub target_name: &'static str,
    /// Declared from this side as an ownership. Other relations are never traversed.
    pub ownership: bool,
    pub prefix: String,
    pub required: bool,
    pub accessor: NavigationAccessor,
}

impl NavigationMetadata {
    pub fn cardinality(&self) -> Cardinality {
        self.accessor.cardinality()
    }
}

impl fmt::Debug for NavigationMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NavigationMetadata")
            .field("name", &self.name)
            .field("target", &self.target_name)
            .field("ownership", &self.ownership)
            .field("cardinality", &self.cardinality())
            .field("required", &self.required)
            .finish()
    }
}

/// Registered description of an entity type.
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    pub name: String,
    pub type_id: TypeId,
    /// `None` for owned types stored with their owner.
    pub table: Option<TableName>,
    pub columns: Vec<ColumnMetadata>,
    pub navigations: Vec<NavigationMetadata>,
}

impl EntityMetadata {
    pub fn column(&self, member: &str) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.member == member)
    }

    pub fn navigation(&self, name: &str) -> Option<&NavigationMetadata> {
        self.navigations.iter().find(|n| n.name == name)
    }

    pub fn ownerships(&self) -> impl Iterator<Item = &NavigationMetadata> {
        self.navigations.iter().filter(|n| n.ownership)
    }

    pub fn key_columns(&self) -> impl Iterator<Item = &ColumnMetadata> {
        self.columns.iter().filter(|c| c.is_key)
    }

    /// Table used when the entity is the root of an operation.
    pub fn root_table(&self) -> TableName {
        self.table
            .clone()
            .unwrap_or_else(|| TableName::new(self.name.clone()))
    }
}

// ============================================================================
// ENTITY BUILDER
// ============================================================================

/// Typed builder for one entity's metadata.
pub struct EntityBuilder<T> {
    metadata: EntityMetadata,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> EntityBuilder<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: EntityMetadata {
                name: name.into(),
                type_id: TypeId::of::<T>(),
                table: None,
                columns: Vec::new(),
                navigations: Vec::new(),
            },
            _marker: PhantomData,
        }
    }

    pub fn table(mut self, name: impl Into<String>) -> Self {
        self.metadata.table = Some(TableName::new(name));
        self
    }

    pub fn table_in_schema(mut self, schema: impl Into<String>, name: impl Into<String>) -> Self {
        self.metadata.table = Some(TableName::with_schema(schema, name));
        self
    }

    pub fn column<F>(mut self, spec: ColumnSpec, getter: F) -> Self
    where
        F: Fn(&T) -> Value + Send + Sync + 'static,
    {
        let getter: ValueGetter = Arc::new(move |obj: &Object| {
            obj.downcast_ref::<T>().map_or(Value::Null, &getter)
        });
        let column_name = spec.column_name.unwrap_or_else(|| spec.member.clone());
        self.metadata.columns.push(ColumnMetadata {
            member: spec.member,
            column_name,
            store_type: spec.store_type,
            nullable: spec.nullable,
            is_key: spec.key,
            generated_on_insert: spec.generated_on_insert,
            default_sql: spec.default_sql,
            insertable: spec.insertable,
            getter,
            converter: spec.converter,
        });
        self
    }

    /// Owned reference; inline unless `U` is registered with its own table.
    pub fn owns_one<U>(
        self,
        spec: NavigationSpec,
        getter: impl for<'a> Fn(&'a T) -> Option<&'a U> + Send + Sync + 'static,
    ) -> Self
    where
        U: Any + Send + Sync,
    {
        let accessor = NavigationAccessor::Reference(reference_getter(move |obj| {
            obj.downcast_ref::<T>()
                .and_then(|owner| getter(owner))
                .map(|owned| owned as &Object)
        }));
        self.navigation::<U>(spec, true, accessor)
    }

    /// Owned collection; `U` must be registered with its own table.
    pub fn owns_many<U>(
        self,
        spec: NavigationSpec,
        getter: impl for<'a> Fn(&'a T) -> &'a [U] + Send + Sync + 'static,
    ) -> Self
    where
        U: Any + Send + Sync,
    {
        let accessor = NavigationAccessor::Collection(collection_getter(move |obj| {
            match obj.downcast_ref::<T>() {
                Some(owner) => getter(owner).iter().map(|owned| owned as &Object).collect(),
                None => Vec::new(),
            }
        }));
        self.navigation::<U>(spec, true, accessor)
    }

    /// Non-ownership relation. Registered for completeness, never traversed.
    pub fn references<U>(
        self,
        spec: NavigationSpec,
        getter: impl for<'a> Fn(&'a T) -> Option<&'a U> + Send + Sync + 'static,
    ) -> Self
    where
        U: Any + Send + Sync,
    {
        let accessor = NavigationAccessor::Reference(reference_getter(move |obj| {
            obj.downcast_ref::<T>()
                .and_then(|owner| getter(owner))
                .map(|other| other as &Object)
        }));
        self.navigation::<U>(spec, false, accessor)
    }

    fn navigation<U: Any>(
        mut self,
        spec: NavigationSpec,
        ownership: bool,
        accessor: NavigationAccessor,
    ) -> Self {
        let prefix = spec
            .prefix
            .unwrap_or_else(|| format!("{}_", spec.name));
        self.metadata.navigations.push(NavigationMetadata {
            name: spec.name,
            target: TypeId::of::<U>(),
            target_name: std::any::type_name::<U>(),
            ownership,
            prefix,
            required: spec.required,
            accessor,
        });
        self
    }

    pub fn build(self) -> EntityMetadata {
        self.metadata
    }
}

// ============================================================================
// MODEL
// ============================================================================

/// Supplies entity metadata to the shape resolver. Read-only.
pub trait MetadataProvider: Send + Sync {
    fn entity(&self, type_id: TypeId) -> Option<&EntityMetadata>;

    fn entity_by_name(&self, name: &str) -> Option<&EntityMetadata>;
}

/// Immutable set of registered entities.
#[derive(Debug, Clone, Default)]
pub struct Model {
    entities: Vec<EntityMetadata>,
    by_type: HashMap<TypeId, usize>,
    by_name: HashMap<String, usize>,
}

impl Model {
    pub fn builder() -> ModelBuilder {
        ModelBuilder::default()
    }

    pub fn entity_of<T: Any>(&self) -> Option<&EntityMetadata> {
        self.entity(TypeId::of::<T>())
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityMetadata> {
        self.entities.iter()
    }
}

impl MetadataProvider for Model {
    fn entity(&self, type_id: TypeId) -> Option<&EntityMetadata> {
        self.by_type.get(&type_id).map(|&i| &self.entities[i])
    }

    fn entity_by_name(&self, name: &str) -> Option<&EntityMetadata> {
        self.by_name.get(name).map(|&i| &self.entities[i])
    }
}

/// Collects entity builders and validates the result.
#[derive(Default)]
pub struct ModelBuilder {
    entities: Vec<EntityMetadata>,
}

impl ModelBuilder {
    pub fn entity<T: Any + Send + Sync>(mut self, builder: EntityBuilder<T>) -> Self {
        self.entities.push(builder.build());
        self
    }

    /// Rejects duplicate entity names and types, duplicate members and
    /// duplicate column names within an entity.
    pub fn build(self) -> StevedoreResult<Model> {
        let mut model = Model::default();

        for (index, entity) in self.entities.into_iter().enumerate() {
            if entity.name.trim().is_empty() {
                return Err(StevedoreError::invalid_argument(
                    "entity",
                    "entity name cannot be empty",
                ));
            }
            if model.by_name.contains_key(&entity.name) || model.by_type.contains_key(&entity.type_id) {
                return Err(StevedoreError::invalid_argument(
                    "entity",
                    format!("entity '{}' is registered twice", entity.name),
                ));
            }

            let mut members = HashSet::new();
            let mut column_names = HashSet::new();
            for column in &entity.columns {
                if !members.insert(column.member.as_str())
                    || !column_names.insert(column.column_name.as_str())
                {
                    return Err(StevedoreError::invalid_argument(
                        "column",
                        format!(
                            "member '{}' of entity '{}' is declared twice",
                            column.member, entity.name
                        ),
                    ));
                }
            }
            for navigation in &entity.navigations {
                if !members.insert(navigation.name.as_str()) {
                    return Err(StevedoreError::invalid_argument(
                        "navigation",
                        format!(
                            "member '{}' of entity '{}' is declared twice",
                            navigation.name, entity.name
                        ),
                    ));
                }
            }

            model.by_name.insert(entity.name.clone(), index);
            model.by_type.insert(entity.type_id, index);
            model.entities.push(entity);
        }

        Ok(model)
    }
}
