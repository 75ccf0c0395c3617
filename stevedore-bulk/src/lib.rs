//! STEVEDORE Bulk - Bulk Insert Orchestration
//!
//! Streams entity graphs into real tables or freshly created temporary
//! tables through the collaborator traits of stevedore-storage. Separately
//! stored owned types are written to their own tables, linked back to their
//! owner by synthesized key columns.

pub mod executor;
mod naming;
pub mod table_ref;
pub mod temp_table;

pub use executor::{BulkInserter, InsertSummary, TableRows};
pub use table_ref::{TableReference, TempTableReference};
pub use temp_table::TempTableQuery;
