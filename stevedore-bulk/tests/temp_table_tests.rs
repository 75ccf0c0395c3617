//! Temp table creation, bulk insert into temp tables, release and cleanup.

use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use stevedore_bulk::BulkInserter;
use stevedore_core::{BulkCopyOptions, ColumnSpec, EntityBuilder, NavigationSpec, ShapeResolver, StoreType};
use stevedore_storage::{Connection, ShapeKey};
use stevedore_test_utils::{
    assertions, fixtures, generators, init_tracing, resolver, Customer, IdentityHandling,
    MemberSelection,
    Membership, MockDatabase, MockOperation, Model, NameLeaseCache, PrimaryKeyCreation,
    StevedoreError, TableName, TempTableBulkInsertOptions, TempTableCreationOptions,
    TempTableNaming, Value, CUSTOMERS,
};
use tokio_util::sync::CancellationToken;

// ============================================================================
// SETUP
// ============================================================================

struct Harness {
    db: MockDatabase,
    leases: Arc<NameLeaseCache>,
    inserter: BulkInserter<MockDatabase>,
}

fn harness_with(db: MockDatabase, resolver: Arc<ShapeResolver>) -> Harness {
    init_tracing();
    let leases = Arc::new(NameLeaseCache::new());
    let inserter = BulkInserter::new(Arc::new(db.clone()), resolver, Arc::clone(&leases));
    Harness {
        db,
        leases,
        inserter,
    }
}

fn harness() -> Harness {
    harness_with(MockDatabase::new(), resolver())
}

fn named(naming: TempTableNaming) -> TempTableBulkInsertOptions {
    TempTableBulkInsertOptions::default()
        .with_creation(TempTableCreationOptions::default().with_naming(naming))
}

fn names(tables: &[TableName]) -> Vec<String> {
    tables.iter().map(|t| t.to_string()).collect()
}

// ============================================================================
// INSERT INTO TEMP TABLE
// ============================================================================

#[tokio::test]
async fn test_temp_insert_creates_one_table_per_level() {
    let h = harness();
    let customers = fixtures::customers(5);
    let mut query = h
        .inserter
        .bulk_insert_into_temp_table(
            &customers,
            &TempTableBulkInsertOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(query.table, TableName::new("customers_1"));
    assert_eq!(
        names(&query.reference().tables()),
        vec!["customers_1", "orders_1", "order_lines_1"]
    );
    assert_eq!(
        query.sql,
        "SELECT \"id\", \"name\", \"email\", \"billing_street\", \"billing_city\" FROM \"customers_1\""
    );
    assert_eq!(query.summary.rows_for(&TableName::new("customers_1")), 5);
    assert_eq!(
        query.summary.rows_for(&TableName::new("orders_1")),
        fixtures::order_count(&customers) as u64
    );
    assert_eq!(
        h.db.rows(&TableName::new("order_lines_1")).len(),
        fixtures::line_count(&customers)
    );

    let root = h.db.table(&TableName::new("customers_1")).unwrap();
    assert!(root.temporary);
    assert_eq!(root.primary_key, vec!["id"]);
    let orders = h.db.table(&TableName::new("orders_1")).unwrap();
    assert_eq!(orders.primary_key, vec!["customer_id", "ordinal"]);

    // the temp tables keep the session open until released
    assert_eq!(h.db.open_count(), 3);

    query.release().await.unwrap();
    assertions::assert_cleaned_up(&h.db);
    assert_eq!(h.leases.connection_count(), 0);
}

#[tokio::test]
async fn test_temp_insert_of_nothing_creates_empty_tables() {
    let h = harness();
    let mut query = h
        .inserter
        .bulk_insert_into_temp_table::<Customer>(
            &[],
            &TempTableBulkInsertOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(query.summary.total_rows(), 0);
    assert_eq!(h.db.temporary_tables().len(), 3);
    query.release().await.unwrap();
    assertions::assert_cleaned_up(&h.db);
}

#[tokio::test]
async fn test_temp_insert_keeps_identity_values() {
    let h = harness();
    let tickets = fixtures::tickets(3);
    let mut query = h
        .inserter
        .bulk_insert_into_temp_table(
            &tickets,
            &TempTableBulkInsertOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        h.db.column_values(&query.table, "id"),
        vec![Value::BigInt(1), Value::BigInt(2), Value::BigInt(3)]
    );
    query.release().await.unwrap();
}

#[tokio::test]
async fn test_temp_insert_refuses_to_skip_identity_values() {
    let h = harness();
    let options = TempTableBulkInsertOptions::default()
        .with_copy(BulkCopyOptions::default().with_identity(IdentityHandling::Ignore));
    let result = h
        .inserter
        .bulk_insert_into_temp_table(&fixtures::tickets(2), &options, &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(StevedoreError::Config(_))));
    assert_eq!(h.db.physical_opens(), 0);
    assert!(h.db.temporary_tables().is_empty());
}

#[tokio::test]
async fn test_second_release_is_disposed() {
    let h = harness();
    let mut query = h
        .inserter
        .bulk_insert_into_temp_table(
            &fixtures::customers(1),
            &TempTableBulkInsertOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    query.release().await.unwrap();
    assert!(query.reference().is_released());
    assertions::assert_disposed(&query.release().await);
}

// ============================================================================
// NAMING
// ============================================================================

#[tokio::test]
async fn test_reusable_names_are_leased_and_returned() {
    let h = harness();
    let data = fixtures::customers(2);
    let options = TempTableBulkInsertOptions::default();
    let cancel = CancellationToken::new();

    let mut first = h
        .inserter
        .bulk_insert_into_temp_table(&data, &options, &cancel)
        .await
        .unwrap();
    let mut second = h
        .inserter
        .bulk_insert_into_temp_table(&data, &options, &cancel)
        .await
        .unwrap();
    assert_eq!(first.table.name, "customers_1");
    assert_eq!(second.table.name, "customers_2");

    first.release().await.unwrap();
    let key = ShapeKey::from(TableName::new(CUSTOMERS));
    assert_eq!(
        h.leases.leased_suffixes(h.db.connection_id(), &key),
        vec![2]
    );

    let mut third = h
        .inserter
        .bulk_insert_into_temp_table(&data, &options, &cancel)
        .await
        .unwrap();
    assert_eq!(third.table.name, "customers_1");

    second.release().await.unwrap();
    third.release().await.unwrap();
    assertions::assert_cleaned_up(&h.db);
    assert_eq!(h.leases.connection_count(), 0);
}

#[tokio::test]
async fn test_default_naming_uses_entity_tables() {
    let h = harness();
    let mut query = h
        .inserter
        .bulk_insert_into_temp_table(
            &fixtures::customers(2),
            &named(TempTableNaming::Default),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        names(&query.reference().tables()),
        vec!["customers", "orders", "order_lines"]
    );
    query.release().await.unwrap();
}

#[tokio::test]
async fn test_fixed_naming_suffixes_children_with_their_path() {
    let h = harness();
    let mut query = h
        .inserter
        .bulk_insert_into_temp_table(
            &fixtures::customers(2),
            &named(TempTableNaming::Fixed("scratch".to_string())),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        names(&query.reference().tables()),
        vec!["scratch", "scratch_orders", "scratch_orders_lines"]
    );
    query.release().await.unwrap();
}

#[tokio::test]
async fn test_unique_naming_never_collides() {
    let h = harness();
    let data = fixtures::customers(1);
    let options = named(TempTableNaming::Unique);
    let cancel = CancellationToken::new();

    let mut a = h
        .inserter
        .bulk_insert_into_temp_table(&data, &options, &cancel)
        .await
        .unwrap();
    let mut b = h
        .inserter
        .bulk_insert_into_temp_table(&data, &options, &cancel)
        .await
        .unwrap();

    assert_ne!(a.table, b.table);
    assert!(a.table.name.starts_with("customers_"));
    // nothing is leased for unique names
    assert_eq!(h.leases.connection_count(), 0);
    a.release().await.unwrap();
    b.release().await.unwrap();
}

#[tokio::test]
async fn test_unique_naming_rejects_truncate() {
    let h = harness();
    let options = TempTableBulkInsertOptions::default().with_creation(
        TempTableCreationOptions::default()
            .with_naming(TempTableNaming::Unique)
            .with_truncate_table_if_exists(true),
    );
    let result = h
        .inserter
        .bulk_insert_into_temp_table(&fixtures::customers(1), &options, &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(StevedoreError::Config(_))));
    assert_eq!(h.db.physical_opens(), 0);
}

// ============================================================================
// PRIMARY KEYS
// ============================================================================

#[tokio::test]
async fn test_missing_key_columns_are_named() {
    let h = harness();
    let options = TempTableBulkInsertOptions::default()
        .with_members(MemberSelection::new(["role", "tenant_id"]));
    let err = h
        .inserter
        .bulk_insert_into_temp_table(
            &fixtures::memberships(3),
            &options,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(
        err,
        StevedoreError::MissingKeyColumns {
            table: "memberships".to_string(),
            columns: vec!["user_id".to_string()],
        }
    );
    assert!(err.is_invalid_argument());
    assertions::assert_cleaned_up(&h.db);
    assert_eq!(h.leases.connection_count(), 0);
}

#[tokio::test]
async fn test_partial_key_selection_without_primary_key() {
    let h = harness();
    let options = TempTableBulkInsertOptions::default().with_creation(
        TempTableCreationOptions::default()
            .with_members(MemberSelection::new(["role", "tenant_id"]))
            .with_primary_key(PrimaryKeyCreation::None),
    );
    let mut query = h
        .inserter
        .bulk_insert_into_temp_table(
            &fixtures::memberships(3),
            &options,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(query.columns, vec!["role", "tenant_id"]);
    assert!(h.db.table(&query.table).unwrap().primary_key.is_empty());
    query.release().await.unwrap();
}

#[tokio::test]
async fn test_primary_key_after_bulk_insert() {
    let h = harness();
    let options = TempTableBulkInsertOptions::default().with_creation(
        TempTableCreationOptions::default().with_primary_key(PrimaryKeyCreation::AfterBulkInsert),
    );
    let mut query = h
        .inserter
        .bulk_insert_into_temp_table::<Membership>(
            &fixtures::memberships(12),
            &options,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        h.db.statements(),
        vec![
            "CREATE TABLE memberships_1".to_string(),
            "BULK COPY memberships_1 (12 rows)".to_string(),
            "ALTER TABLE memberships_1 ADD PRIMARY KEY (tenant_id, user_id)".to_string(),
        ]
    );
    query.release().await.unwrap();
}

// ============================================================================
// RELEASE
// ============================================================================

#[tokio::test]
async fn test_release_without_drop_keeps_table() {
    let h = harness();
    // an outer session keeps temp tables alive
    h.db.open().await.unwrap();

    let options = TempTableBulkInsertOptions::default().with_creation(
        TempTableCreationOptions::default().with_drop_table_on_release(false),
    );
    let mut query = h
        .inserter
        .bulk_insert_into_temp_table(&fixtures::memberships(2), &options, &CancellationToken::new())
        .await
        .unwrap();
    query.release().await.unwrap();

    assert!(h.db.has_table(&TableName::new("memberships_1")));
    assert!(!h.db.statements().iter().any(|s| s.starts_with("DROP")));
    assert_eq!(h.db.open_count(), 1);
    assert_eq!(h.leases.connection_count(), 0);

    h.db.close().await.unwrap();
    assert!(!h.db.has_table(&TableName::new("memberships_1")));
}

#[tokio::test]
async fn test_release_after_connection_closed() {
    let h = harness();
    let mut query = h
        .inserter
        .bulk_insert_into_temp_table(
            &fixtures::customers(2),
            &TempTableBulkInsertOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    // the session ended underneath the reference
    while h.db.open_count() > 0 {
        h.db.close().await.unwrap();
    }

    query.release().await.unwrap();
    assert!(!h.db.statements().iter().any(|s| s.starts_with("DROP")));
    assert_eq!(h.leases.connection_count(), 0);
}

#[tokio::test]
async fn test_dropped_reference_cleans_up_in_background() {
    let h = harness();
    let query = h
        .inserter
        .bulk_insert_into_temp_table(
            &fixtures::customers(3),
            &TempTableBulkInsertOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    drop(query);

    for _ in 0..100 {
        if h.db.open_count() == 0 && h.leases.connection_count() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assertions::assert_cleaned_up(&h.db);
    assert_eq!(h.leases.connection_count(), 0);

    let drops: Vec<String> = h
        .db
        .statements()
        .into_iter()
        .filter(|s| s.starts_with("DROP TABLE"))
        .collect();
    assert_eq!(
        drops,
        vec![
            "DROP TABLE order_lines_1",
            "DROP TABLE orders_1",
            "DROP TABLE customers_1"
        ]
    );
}

#[tokio::test]
async fn test_truncate_reuses_existing_table() {
    let h = harness();
    h.db.open().await.unwrap();
    let fixed = TempTableCreationOptions::default()
        .with_naming(TempTableNaming::Fixed("members".to_string()))
        .with_drop_table_on_release(false);
    let cancel = CancellationToken::new();

    let mut first = h
        .inserter
        .bulk_insert_into_temp_table(
            &fixtures::memberships(5),
            &TempTableBulkInsertOptions::default().with_creation(fixed.clone()),
            &cancel,
        )
        .await
        .unwrap();
    first.release().await.unwrap();

    let mut second = h
        .inserter
        .bulk_insert_into_temp_table(
            &fixtures::memberships(2),
            &TempTableBulkInsertOptions::default()
                .with_creation(fixed.with_truncate_table_if_exists(true)),
            &cancel,
        )
        .await
        .unwrap();

    let table = TableName::new("members");
    assert_eq!(h.db.rows(&table).len(), 2);
    assert!(h.db.statements().contains(&"TRUNCATE TABLE members".to_string()));
    assert_eq!(
        h.db.statements()
            .iter()
            .filter(|s| s.starts_with("CREATE TABLE"))
            .count(),
        1
    );
    second.release().await.unwrap();
    h.db.close().await.unwrap();
}

// ============================================================================
// CREATE TEMP TABLE
// ============================================================================

#[tokio::test]
async fn test_create_temp_table_builds_the_whole_tree() {
    let h = harness();
    let options = TempTableCreationOptions::default()
        .with_primary_key(PrimaryKeyCreation::AfterBulkInsert);
    let mut reference = h
        .inserter
        .create_temp_table::<Customer>(&options, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        names(&reference.tables()),
        vec!["customers_1", "orders_1", "order_lines_1"]
    );
    assert_eq!(
        h.db.statements()[..2],
        [
            "CREATE TABLE customers_1".to_string(),
            "ALTER TABLE customers_1 ADD PRIMARY KEY (id)".to_string(),
        ]
    );
    assert!(h.db.rows(&TableName::new("orders_1")).is_empty());

    reference.release().await.unwrap();
    assertions::assert_cleaned_up(&h.db);
}

// ============================================================================
// FAILURE CLEANUP
// ============================================================================

#[tokio::test]
async fn test_child_copy_failure_removes_every_temp_table() {
    let h = harness();
    h.db.fail_on(
        MockOperation::BulkCopy,
        TableName::new("order_lines_1"),
        "disk full",
    );
    let err = h
        .inserter
        .bulk_insert_into_temp_table(
            &fixtures::customers(4),
            &TempTableBulkInsertOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(err.is_transport_failure());
    assert!(err.to_string().contains("order_lines_1"));
    assertions::assert_cleaned_up(&h.db);
    assert_eq!(h.leases.connection_count(), 0);

    let statements = h.db.statements();
    for table in ["order_lines_1", "orders_1", "customers_1"] {
        assert!(statements.contains(&format!("DROP TABLE {}", table)));
    }
}

#[tokio::test]
async fn test_failed_cleanup_still_returns_original_error() {
    let h = harness();
    h.db.fail_on(
        MockOperation::CreateTable,
        TableName::new("orders_1"),
        "out of shared memory",
    );
    h.db.fail_on(
        MockOperation::DropTable,
        TableName::new("customers_1"),
        "lock timeout",
    );
    let err = h
        .inserter
        .bulk_insert_into_temp_table(
            &fixtures::customers(2),
            &TempTableBulkInsertOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(err.to_string().contains("out of shared memory"));
    assert_eq!(h.db.open_count(), 0);
    assert_eq!(h.leases.connection_count(), 0);
}

#[tokio::test]
async fn test_cancelled_copy_cleans_up() {
    init_tracing();
    let db = MockDatabase::new().with_copy_delay(Duration::from_millis(500));
    let h = harness_with(db, resolver());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let result = h
        .inserter
        .bulk_insert_into_temp_table(
            &fixtures::customers(3),
            &TempTableBulkInsertOptions::default(),
            &cancel,
        )
        .await;

    assertions::assert_cancelled(&result);
    assertions::assert_cleaned_up(&h.db);
    assert_eq!(h.leases.connection_count(), 0);
}

// ============================================================================
// OWNER KEYS
// ============================================================================

struct Pallet {
    id: Option<i32>,
    cartons: Vec<Carton>,
}

struct Carton {
    label: String,
}

fn pallet_resolver() -> Arc<ShapeResolver> {
    let model = Model::builder()
        .entity(
            EntityBuilder::<Pallet>::new("Pallet")
                .table("pallets")
                .column(ColumnSpec::new("id", StoreType::Integer).key().nullable(), |c| {
                    c.id.into()
                })
                .owns_many::<Carton>(NavigationSpec::new("cartons"), |c| c.cartons.as_slice()),
        )
        .entity(
            EntityBuilder::<Carton>::new("Carton")
                .table("cartons")
                .column(ColumnSpec::new("label", StoreType::Text), |i| i.label.as_str().into()),
        )
        .build()
        .unwrap();
    Arc::new(ShapeResolver::new(Arc::new(model)))
}

#[tokio::test]
async fn test_null_owner_key_with_owned_rows_is_unsupported() {
    let h = harness_with(MockDatabase::new(), pallet_resolver());
    let options = TempTableBulkInsertOptions::default().with_creation(
        TempTableCreationOptions::default().with_primary_key(PrimaryKeyCreation::None),
    );
    let pallets = vec![Pallet {
        id: None,
        cartons: vec![Carton {
            label: "anchor".to_string(),
        }],
    }];

    let err = h
        .inserter
        .bulk_insert_into_temp_table(&pallets, &options, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_unsupported_shape());
    assertions::assert_cleaned_up(&h.db);
}

#[tokio::test]
async fn test_null_owner_key_without_owned_rows_is_fine() {
    let h = harness_with(MockDatabase::new(), pallet_resolver());
    let options = TempTableBulkInsertOptions::default().with_creation(
        TempTableCreationOptions::default().with_primary_key(PrimaryKeyCreation::None),
    );
    let pallets = vec![Pallet {
        id: None,
        cartons: Vec::new(),
    }];

    let mut query = h
        .inserter
        .bulk_insert_into_temp_table(&pallets, &options, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.db.column_values(&query.table, "id"), vec![Value::Null]);
    query.release().await.unwrap();
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_temp_rows_match_entity_graph(customers in generators::arb_customers(12)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let h = harness();
            let mut query = h
                .inserter
                .bulk_insert_into_temp_table(
                    &customers,
                    &TempTableBulkInsertOptions::default(),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();

            let orders: usize = customers.iter().map(|c| c.orders.len()).sum();
            let lines: usize = customers
                .iter()
                .flat_map(|c| c.orders.iter())
                .map(|o| o.lines.len())
                .sum();
            prop_assert_eq!(h.db.rows(&query.table).len(), customers.len());
            prop_assert_eq!(h.db.rows(&TableName::new("orders_1")).len(), orders);
            prop_assert_eq!(h.db.rows(&TableName::new("order_lines_1")).len(), lines);

            query.release().await.unwrap();
            prop_assert_eq!(h.db.open_count(), 0);
            Ok(())
        })?;
    }
}
