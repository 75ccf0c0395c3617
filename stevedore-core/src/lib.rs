//! STEVEDORE Core - Entity Model and Shape Resolution
//!
//! Registered entity metadata, resolved shape trees, storage values, option
//! types and the error taxonomy. Every other crate depends on this one.
//! Nothing in here performs I/O.

pub mod config;
pub mod error;
pub mod model;
pub mod schema;
pub mod shape;
pub mod value;

pub use config::{
    BulkCopyOptions, BulkInsertOptions, IdentityHandling, MemberSelection, PrimaryKeyCreation,
    TempTableBulkInsertOptions, TempTableCreationOptions, TempTableNaming,
};
pub use error::{ConfigError, ShapeError, StevedoreError, StevedoreResult, TransportError};
pub use model::{
    ColumnMetadata, ColumnSpec, EntityBuilder, EntityMetadata, MetadataProvider, Model,
    ModelBuilder, NavigationMetadata, NavigationSpec,
};
pub use schema::{
    Cardinality, ColumnDescriptor, ColumnOrigin, FlattenedColumn, NavigationAccessor,
    NavigationDescriptor, Object, OwnedKind, Record, ShapeNode, TableName,
};
pub use shape::{ShapePurpose, ShapeResolver};
pub use value::{StoreType, Value};
