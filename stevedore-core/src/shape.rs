//! Shape resolution: entity metadata + member selection -> [`ShapeNode`] tree.

use crate::config::MemberSelection;
use crate::error::{ShapeError, StevedoreError, StevedoreResult};
use crate::model::{ColumnMetadata, EntityMetadata, MetadataProvider, NavigationMetadata};
use crate::schema::{
    Cardinality, ColumnDescriptor, ColumnOrigin, NavigationDescriptor, OwnedKind, ShapeNode,
    TableName,
};
use crate::value::StoreType;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// What the resolved shape is used for. Decides which columns are writable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShapePurpose {
    /// Rows inserted into the entity's real table.
    Insert,
    /// Columns of a temporary table.
    TempTable,
}

impl ShapePurpose {
    /// Key members of owned levels are never written: a separately stored
    /// level is keyed by its back reference, an inline level has no key.
    fn admits(self, column: &ColumnMetadata, nested: bool) -> bool {
        if nested && column.is_key {
            return false;
        }
        match self {
            ShapePurpose::Insert => column.insertable,
            ShapePurpose::TempTable => true,
        }
    }
}

type CacheKey = (TypeId, Option<MemberSelection>, ShapePurpose);

/// Resolves and caches shapes.
pub struct ShapeResolver {
    provider: Arc<dyn MetadataProvider>,
    cache: RwLock<HashMap<CacheKey, Arc<ShapeNode>>>,
}

/// Position of the level being built inside the tree.
#[derive(Clone)]
struct Scope {
    table: TableName,
    nested: bool,
    inline: bool,
    column_prefix: String,
    member_prefix: String,
    /// Some navigation of the inline chain leading here is optional.
    optional: bool,
    ancestors: Vec<TypeId>,
}

impl ShapeResolver {
    pub fn new(provider: Arc<dyn MetadataProvider>) -> Self {
        Self {
            provider,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> &dyn MetadataProvider {
        self.provider.as_ref()
    }

    pub fn resolve_for<T: Any>(
        &self,
        selection: Option<&MemberSelection>,
        purpose: ShapePurpose,
    ) -> StevedoreResult<Arc<ShapeNode>> {
        self.resolve(TypeId::of::<T>(), selection, purpose)
    }

    /// Resolves the shape of `entity`, restricted to `selection` when given.
    pub fn resolve(
        &self,
        entity: TypeId,
        selection: Option<&MemberSelection>,
        purpose: ShapePurpose,
    ) -> StevedoreResult<Arc<ShapeNode>> {
        if let Some(selection) = selection {
            selection.validate()?;
        }

        let key: CacheKey = (entity, selection.cloned(), purpose);
        {
            let cache = self.cache.read().map_err(|_| StevedoreError::LockPoisoned {
                resource: "shape cache".to_string(),
            })?;
            if let Some(shape) = cache.get(&key) {
                return Ok(Arc::clone(shape));
            }
        }

        let meta = self.provider.entity(entity).ok_or_else(|| {
            StevedoreError::invalid_argument("entity", "entity type is not registered")
        })?;
        let root = self.resolve_root(meta, selection, purpose)?;

        let mut cache = self.cache.write().map_err(|_| StevedoreError::LockPoisoned {
            resource: "shape cache".to_string(),
        })?;
        let shape = cache.entry(key).or_insert_with(|| Arc::new(root));
        Ok(Arc::clone(shape))
    }

    /// Number of cached shapes.
    pub fn cached_shapes(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    fn resolve_root(
        &self,
        meta: &EntityMetadata,
        selection: Option<&MemberSelection>,
        purpose: ShapePurpose,
    ) -> StevedoreResult<ShapeNode> {
        let scope = Scope {
            table: meta.root_table(),
            nested: false,
            inline: false,
            column_prefix: String::new(),
            member_prefix: String::new(),
            optional: false,
            ancestors: vec![meta.type_id],
        };
        let root = self.build_node(meta, &scope, None, Vec::new(), selection, purpose)?;

        if root.flatten().is_empty() {
            return Err(StevedoreError::invalid_argument(
                "members",
                format!("no writable columns on entity '{}'", meta.name),
            ));
        }
        Ok(root)
    }

    fn build_node(
        &self,
        meta: &EntityMetadata,
        scope: &Scope,
        navigation: Option<NavigationDescriptor>,
        back_reference: Vec<ColumnDescriptor>,
        selection: Option<&MemberSelection>,
        purpose: ShapePurpose,
    ) -> StevedoreResult<ShapeNode> {
        let key = if !scope.nested {
            meta.key_columns().map(|c| describe(c, scope)).collect()
        } else if scope.inline {
            Vec::new()
        } else {
            back_reference.clone()
        };

        let mut node = ShapeNode {
            entity: meta.name.clone(),
            type_id: meta.type_id,
            table: scope.table.clone(),
            navigation,
            columns: Vec::new(),
            back_reference,
            key,
            children: Vec::new(),
        };

        match selection {
            None => {
                for column in &meta.columns {
                    if purpose.admits(column, scope.nested) {
                        node.columns.push(describe(column, scope));
                    }
                }
                for navigation in meta.ownerships() {
                    if let Some(child) =
                        self.build_child(meta, &node, scope, navigation, None, false, purpose)?
                    {
                        node.children.push(child);
                    }
                }
            }
            Some(selection) => {
                for (head, nested) in selection.groups() {
                    if let Some(column) = meta.column(&head) {
                        if let Some(nested) = nested {
                            return Err(ShapeError::UnknownMember {
                                member: format!("{}.{}", head, nested.members()[0]),
                                entity: meta.name.clone(),
                            }
                            .into());
                        }
                        if !purpose.admits(column, scope.nested) {
                            return Err(StevedoreError::invalid_argument(
                                "members",
                                format!(
                                    "member '{}{}' of entity '{}' cannot be written",
                                    scope.member_prefix, head, meta.name
                                ),
                            ));
                        }
                        node.columns.push(describe(column, scope));
                    } else if let Some(navigation) =
                        meta.navigation(&head).filter(|n| n.ownership)
                    {
                        if let Some(child) = self.build_child(
                            meta,
                            &node,
                            scope,
                            navigation,
                            nested.as_ref(),
                            true,
                            purpose,
                        )? {
                            node.children.push(child);
                        }
                    } else {
                        return Err(ShapeError::UnknownMember {
                            member: head,
                            entity: meta.name.clone(),
                        }
                        .into());
                    }
                }
            }
        }

        Ok(node)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_child(
        &self,
        owner: &EntityMetadata,
        owner_node: &ShapeNode,
        owner_scope: &Scope,
        navigation: &NavigationMetadata,
        selection: Option<&MemberSelection>,
        selected: bool,
        purpose: ShapePurpose,
    ) -> StevedoreResult<Option<ShapeNode>> {
        let unsupported = |reason: String| -> StevedoreError {
            ShapeError::UnsupportedShape {
                entity: owner.name.clone(),
                navigation: navigation.name.clone(),
                reason,
            }
            .into()
        };

        let target = self.provider.entity(navigation.target).ok_or_else(|| {
            unsupported(format!(
                "owned type '{}' is not registered",
                navigation.target_name
            ))
        })?;
        if owner_scope.ancestors.contains(&target.type_id) {
            return Err(unsupported(format!(
                "ownership of '{}' is cyclic",
                target.name
            )));
        }
        let mut ancestors = owner_scope.ancestors.clone();
        ancestors.push(target.type_id);

        let inline = target
            .table
            .as_ref()
            .map_or(true, |table| *table == owner_scope.table);

        if inline {
            if navigation.cardinality() == Cardinality::Collection {
                return Err(unsupported(
                    "owned collections must be stored in their own table".to_string(),
                ));
            }
            let scope = Scope {
                table: owner_scope.table.clone(),
                nested: true,
                inline: true,
                column_prefix: format!("{}{}", owner_scope.column_prefix, navigation.prefix),
                member_prefix: format!("{}{}.", owner_scope.member_prefix, navigation.name),
                optional: owner_scope.optional || !navigation.required,
                ancestors,
            };
            let descriptor = NavigationDescriptor {
                name: navigation.name.clone(),
                kind: OwnedKind::Inline,
                required: navigation.required,
                accessor: navigation.accessor.clone(),
            };
            let node = self.build_node(target, &scope, Some(descriptor), Vec::new(), selection, purpose)?;

            if node.flatten().is_empty() {
                if selected {
                    return Err(StevedoreError::invalid_argument(
                        "members",
                        format!(
                            "navigation '{}{}' selects no writable columns",
                            owner_scope.member_prefix, navigation.name
                        ),
                    ));
                }
                return Ok(None);
            }
            return Ok(Some(node));
        }

        if selected {
            return Err(unsupported(format!(
                "'{}' is stored in its own table and cannot be selected",
                target.name
            )));
        }
        if owner_scope.inline {
            return Err(unsupported(
                "separately stored types cannot be owned by inline owned types".to_string(),
            ));
        }
        if owner_node.key.is_empty() {
            return Err(unsupported(format!(
                "'{}' has no key to link '{}' rows back to",
                owner.name, target.name
            )));
        }

        let owner_snake = to_snake_case(&owner.name);
        let mut back_reference: Vec<ColumnDescriptor> = owner_node
            .key
            .iter()
            .enumerate()
            .map(|(i, key)| {
                ColumnDescriptor::synthesized(
                    format!("{}_{}", owner_snake, key.name),
                    key.store_type.clone(),
                    ColumnOrigin::OwnerKey(i),
                )
            })
            .collect();
        if navigation.cardinality() == Cardinality::Collection {
            back_reference.push(ColumnDescriptor::synthesized(
                "ordinal",
                StoreType::Integer,
                ColumnOrigin::Ordinal,
            ));
        }

        let scope = Scope {
            table: target.root_table(),
            nested: true,
            inline: false,
            column_prefix: String::new(),
            member_prefix: String::new(),
            optional: false,
            ancestors,
        };
        let descriptor = NavigationDescriptor {
            name: navigation.name.clone(),
            kind: OwnedKind::Separate,
            required: navigation.required,
            accessor: navigation.accessor.clone(),
        };
        self.build_node(target, &scope, Some(descriptor), back_reference, None, purpose)
            .map(Some)
    }
}

fn describe(column: &ColumnMetadata, scope: &Scope) -> ColumnDescriptor {
    let mut descriptor = ColumnDescriptor::member(
        format!("{}{}", scope.column_prefix, column.column_name),
        format!("{}{}", scope.member_prefix, column.member),
        column.store_type.clone(),
        Arc::clone(&column.getter),
    )
    .with_converter(column.converter.clone());
    descriptor.nullable = column.nullable || scope.optional;
    descriptor.is_key = column.is_key;
    descriptor.generated_on_insert = column.generated_on_insert;
    descriptor.has_default = column.has_default();
    descriptor
}

/// `OrderLine` -> `order_line`.
pub(crate) fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch.is_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}

// ============================================================================
// TESTS
// ============================================================================
