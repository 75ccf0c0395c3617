//! Option types for bulk operations

use crate::error::{ConfigError, StevedoreError, StevedoreResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How columns generated on insert (identity, auto-increment) are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum IdentityHandling {
    /// Generated columns are not sent; the database produces the value.
    #[default]
    Ignore,
    /// Values are sent as read from the entity.
    Keep,
    /// Values are sent, but `0` becomes `NULL` so the database generates one.
    ZeroToNull,
}

// ============================================================================
// MEMBER SELECTION
// ============================================================================

/// Ordered list of member identifiers, each a dotted path such as
/// `billing.street`. A bare navigation name selects the whole navigation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberSelection {
    members: Vec<String>,
}

impl MemberSelection {
    pub fn new<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Rejects an empty list and empty path segments.
    pub fn validate(&self) -> StevedoreResult<()> {
        if self.members.is_empty() {
            return Err(StevedoreError::invalid_argument(
                "members",
                "member selection cannot be empty",
            ));
        }
        for member in &self.members {
            if member.split('.').any(|segment| segment.trim().is_empty()) {
                return Err(StevedoreError::invalid_argument(
                    "members",
                    format!("'{}' is not a valid member path", member),
                ));
            }
        }
        Ok(())
    }

    /// Groups identifiers by their first path segment, in first-appearance
    /// order. A segment that appears on its own selects the whole member
    /// (`None`); otherwise the remaining path segments form a nested selection.
    pub fn groups(&self) -> Vec<(String, Option<MemberSelection>)> {
        let mut groups: Vec<(String, bool, Vec<String>)> = Vec::new();

        for member in &self.members {
            let (head, tail) = match member.split_once('.') {
                Some((head, tail)) => (head, Some(tail)),
                None => (member.as_str(), None),
            };
            let index = match groups.iter().position(|(name, _, _)| name == head) {
                Some(index) => index,
                None => {
                    groups.push((head.to_string(), false, Vec::new()));
                    groups.len() - 1
                }
            };
            match tail {
                Some(tail) => {
                    if !groups[index].2.iter().any(|t| t == tail) {
                        groups[index].2.push(tail.to_string());
                    }
                }
                None => groups[index].1 = true,
            }
        }

        groups
            .into_iter()
            .map(|(head, whole, tails)| {
                let nested = if whole || tails.is_empty() {
                    None
                } else {
                    Some(MemberSelection { members: tails })
                };
                (head, nested)
            })
            .collect()
    }
}

impl<S: Into<String>> FromIterator<S> for MemberSelection {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        MemberSelection::new(iter)
    }
}

// ============================================================================
// BULK COPY
// ============================================================================

/// Options handed to the bulk-load transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkCopyOptions {
    /// Rows per batch; `None` lets the transport decide.
    pub batch_size: Option<usize>,
    /// Timeout of a single copy; `None` means no timeout.
    pub timeout: Option<Duration>,
    pub enable_streaming: bool,
    pub identity: IdentityHandling,
}

impl Default for BulkCopyOptions {
    fn default() -> Self {
        Self {
            batch_size: None,
            timeout: None,
            enable_streaming: true,
            identity: IdentityHandling::Ignore,
        }
    }
}

impl BulkCopyOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_streaming(mut self, enable: bool) -> Self {
        self.enable_streaming = enable;
        self
    }

    pub fn with_identity(mut self, identity: IdentityHandling) -> Self {
        self.identity = identity;
        self
    }

    pub fn validate(&self) -> StevedoreResult<()> {
        if self.batch_size == Some(0) {
            return Err(StevedoreError::Config(ConfigError::InvalidValue {
                field: "batch_size".to_string(),
                value: "0".to_string(),
                reason: "batch_size must be greater than 0".to_string(),
            }));
        }
        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(StevedoreError::Config(ConfigError::InvalidValue {
                    field: "timeout".to_string(),
                    value: format!("{:?}", timeout),
                    reason: "timeout must be positive".to_string(),
                }));
            }
        }
        Ok(())
    }
}

/// Options of a bulk insert into the entity's own table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BulkInsertOptions {
    /// Members to write; `None` writes every insertable member.
    pub members: Option<MemberSelection>,
    /// Schema overriding the one registered for the entity.
    pub schema: Option<String>,
    pub copy: BulkCopyOptions,
}

impl BulkInsertOptions {
    pub fn with_members(mut self, members: MemberSelection) -> Self {
        self.members = Some(members);
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_copy(mut self, copy: BulkCopyOptions) -> Self {
        self.copy = copy;
        self
    }

    pub fn validate(&self) -> StevedoreResult<()> {
        if let Some(members) = &self.members {
            members.validate()?;
        }
        self.copy.validate()
    }
}

// ============================================================================
// TEMP TABLES
// ============================================================================

/// How a temporary table is named.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TempTableNaming {
    /// The entity's table name, unchanged.
    Default,
    /// A caller-chosen name.
    Fixed(String),
    /// `<table>_<n>`, `n` leased per connection and returned on release.
    #[default]
    Reusable,
    /// `<table>_<uuid>`, never reused.
    Unique,
}

/// When the primary key of a temporary table is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PrimaryKeyCreation {
    None,
    /// Part of `CREATE TABLE`.
    #[default]
    BeforeBulkInsert,
    /// Added once the rows are loaded.
    AfterBulkInsert,
}

/// Options of temporary table creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempTableCreationOptions {
    pub naming: TempTableNaming,
    pub primary_key: PrimaryKeyCreation,
    /// Members to create columns for; `None` creates every column.
    pub members: Option<MemberSelection>,
    /// Truncate an already existing table instead of creating it.
    pub truncate_table_if_exists: bool,
    /// Drop the table when its reference is released.
    pub drop_table_on_release: bool,
}

impl Default for TempTableCreationOptions {
    fn default() -> Self {
        Self {
            naming: TempTableNaming::Reusable,
            primary_key: PrimaryKeyCreation::BeforeBulkInsert,
            members: None,
            truncate_table_if_exists: false,
            drop_table_on_release: true,
        }
    }
}

impl TempTableCreationOptions {
    pub fn with_naming(mut self, naming: TempTableNaming) -> Self {
        self.naming = naming;
        self
    }

    pub fn with_primary_key(mut self, primary_key: PrimaryKeyCreation) -> Self {
        self.primary_key = primary_key;
        self
    }

    pub fn with_members(mut self, members: MemberSelection) -> Self {
        self.members = Some(members);
        self
    }

    pub fn with_truncate_table_if_exists(mut self, truncate: bool) -> Self {
        self.truncate_table_if_exists = truncate;
        self
    }

    pub fn with_drop_table_on_release(mut self, drop: bool) -> Self {
        self.drop_table_on_release = drop;
        self
    }

    pub fn validate(&self) -> StevedoreResult<()> {
        if let TempTableNaming::Fixed(name) = &self.naming {
            if name.trim().is_empty() {
                return Err(StevedoreError::Config(ConfigError::InvalidValue {
                    field: "naming".to_string(),
                    value: format!("{:?}", name),
                    reason: "a fixed table name cannot be empty".to_string(),
                }));
            }
        }
        if self.truncate_table_if_exists && self.naming == TempTableNaming::Unique {
            return Err(StevedoreError::Config(ConfigError::IncompatibleOptions {
                option_a: "truncate_table_if_exists".to_string(),
                option_b: "naming = Unique".to_string(),
            }));
        }
        if let Some(members) = &self.members {
            members.validate()?;
        }
        Ok(())
    }
}

/// Options of a bulk insert into a new temporary table. The member
/// selection of `creation` drives both the table and the rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempTableBulkInsertOptions {
    pub creation: TempTableCreationOptions,
    pub copy: BulkCopyOptions,
}

impl Default for TempTableBulkInsertOptions {
    fn default() -> Self {
        Self {
            creation: TempTableCreationOptions::default(),
            copy: BulkCopyOptions::default().with_identity(IdentityHandling::Keep),
        }
    }
}

impl TempTableBulkInsertOptions {
    pub fn with_creation(mut self, creation: TempTableCreationOptions) -> Self {
        self.creation = creation;
        self
    }

    pub fn with_members(mut self, members: MemberSelection) -> Self {
        self.creation.members = Some(members);
        self
    }

    pub fn with_copy(mut self, copy: BulkCopyOptions) -> Self {
        self.copy = copy;
        self
    }

    /// Temp table columns carry no identity, so generated columns must be
    /// sent.
    pub fn validate(&self) -> StevedoreResult<()> {
        self.creation.validate()?;
        if self.copy.identity == IdentityHandling::Ignore {
            return Err(StevedoreError::Config(ConfigError::IncompatibleOptions {
                option_a: "identity = Ignore".to_string(),
                option_b: "temp table insert".to_string(),
            }));
        }
        self.copy.validate()
    }
}

// ============================================================================
// TESTS
// ============================================================================
