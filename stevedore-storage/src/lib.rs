//! STEVEDORE Storage - Collaborator Traits, Row Cursor and Name Leases
//!
//! Defines the abstraction layer between the bulk orchestrator and a
//! database. The PostgreSQL implementation lives in stevedore-pg; an
//! in-memory mock lives here for tests.

pub mod cursor;
pub mod lease;
pub mod mock;
pub mod traits;

pub use cursor::{Advisory, CursorOptions, EntityCursor, RowCursor};
pub use lease::{NameLeaseCache, NameLeasing, ShapeKey, SuffixLease};
pub use mock::{MockDatabase, MockOperation, MockTable};
pub use traits::{
    BulkCopyRequest, BulkTransport, ColumnMapping, Connection, ConnectionId, ConnectionState,
    CreateTable, Database, DdlExecutor, TableColumn,
};
