//! STEVEDORE PG - PostgreSQL Adapter
//!
//! Implements the stevedore-storage collaborator traits on top of a
//! deadpool-postgres pool. Rows are streamed with binary
//! `COPY ... FROM STDIN`; identifier quoting and type mapping live in
//! [`dialect`].

pub mod config;
pub mod database;
pub mod dialect;

pub use config::PgConfig;
pub use database::PgDatabase;
