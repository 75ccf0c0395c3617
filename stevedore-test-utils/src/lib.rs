//! STEVEDORE Test Utilities
//!
//! Shared test infrastructure for the STEVEDORE workspace:
//! - A fixture entity model (customers, orders, order lines, tickets)
//! - Deterministic entity builders and proptest generators
//! - Assertions over [`StevedoreResult`] and the mock database

pub use stevedore_core::{
    BulkInsertOptions, IdentityHandling, MemberSelection, Model, PrimaryKeyCreation, ShapeResolver,
    StevedoreError, StevedoreResult, TableName, TempTableBulkInsertOptions,
    TempTableCreationOptions, TempTableNaming, Value,
};
pub use stevedore_storage::{MockDatabase, MockOperation, NameLeaseCache};

use std::sync::Arc;
use stevedore_core::{ColumnSpec, EntityBuilder, NavigationSpec, StoreType};

// ============================================================================
// FIXTURE ENTITIES
// ============================================================================

pub const CUSTOMERS: &str = "customers";
pub const ORDERS: &str = "orders";
pub const ORDER_LINES: &str = "order_lines";
pub const TICKETS: &str = "tickets";
pub const MEMBERSHIPS: &str = "memberships";

/// Root entity. Owns an optional inline billing address and a separately
/// stored collection of orders.
#[derive(Debug, Clone, PartialEq)]
pub struct Customer {
    pub id: i32,
    pub name: String,
    pub email: Option<String>,
    pub billing: Option<Address>,
    pub orders: Vec<Order>,
}

/// Stored inline in the owner's table with a `billing_` prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    pub street: String,
    pub city: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: i32,
    pub total: i64,
    pub lines: Vec<OrderLine>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderLine {
    pub sku: String,
    pub quantity: i32,
}

/// Database generated key and a NOT NULL column with a database default.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticket {
    pub id: i64,
    pub title: String,
    pub priority: i32,
}

/// Composite key.
#[derive(Debug, Clone, PartialEq)]
pub struct Membership {
    pub tenant_id: i32,
    pub user_id: i32,
    pub role: String,
}

/// The fixture model with every entity above registered.
pub fn model() -> Model {
    Model::builder()
        .entity(
            EntityBuilder::<Customer>::new("Customer")
                .table(CUSTOMERS)
                .column(ColumnSpec::new("id", StoreType::Integer).key(), |c| c.id.into())
                .column(ColumnSpec::new("name", StoreType::Text), |c| c.name.as_str().into())
                .column(ColumnSpec::new("email", StoreType::Text).nullable(), |c| {
                    c.email.as_deref().into()
                })
                .owns_one::<Address>(NavigationSpec::new("billing"), |c| c.billing.as_ref())
                .owns_many::<Order>(NavigationSpec::new("orders"), |c| c.orders.as_slice()),
        )
        .entity(
            EntityBuilder::<Address>::new("Address")
                .column(ColumnSpec::new("street", StoreType::Text), |a| a.street.as_str().into())
                .column(ColumnSpec::new("city", StoreType::Text).nullable(), |a| {
                    a.city.as_deref().into()
                }),
        )
        .entity(
            EntityBuilder::<Order>::new("Order")
                .table(ORDERS)
                .column(ColumnSpec::new("id", StoreType::Integer).key(), |o| o.id.into())
                .column(ColumnSpec::new("total", StoreType::BigInt), |o| o.total.into())
                .owns_many::<OrderLine>(NavigationSpec::new("lines"), |o| o.lines.as_slice()),
        )
        .entity(
            EntityBuilder::<OrderLine>::new("OrderLine")
                .table(ORDER_LINES)
                .column(ColumnSpec::new("sku", StoreType::Text), |l| l.sku.as_str().into())
                .column(ColumnSpec::new("quantity", StoreType::Integer), |l| l.quantity.into()),
        )
        .entity(
            EntityBuilder::<Ticket>::new("Ticket")
                .table(TICKETS)
                .column(
                    ColumnSpec::new("id", StoreType::BigInt).key().generated_on_insert(),
                    |t| t.id.into(),
                )
                .column(ColumnSpec::new("title", StoreType::Text), |t| t.title.as_str().into())
                .column(
                    ColumnSpec::new("priority", StoreType::Integer).default_sql("5"),
                    |t| t.priority.into(),
                ),
        )
        .entity(
            EntityBuilder::<Membership>::new("Membership")
                .table(MEMBERSHIPS)
                .column(ColumnSpec::new("tenant_id", StoreType::Integer).key(), |m| {
                    m.tenant_id.into()
                })
                .column(ColumnSpec::new("user_id", StoreType::Integer).key(), |m| {
                    m.user_id.into()
                })
                .column(ColumnSpec::new("role", StoreType::Text), |m| m.role.as_str().into()),
        )
        .build()
        .expect("fixture model is valid")
}

/// A resolver over [`model`].
pub fn resolver() -> Arc<ShapeResolver> {
    Arc::new(ShapeResolver::new(Arc::new(model())))
}

/// Routes `tracing` output to the test harness. Filter with `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Deterministic entity graphs.

    use super::*;

    /// `n` customers with ids `1..=n`.
    ///
    /// Customer `i` has `i % 3` orders; order `j` (0 based) has `j + 1`
    /// lines. Every third customer has no billing address, every fifth
    /// billing address has no city and even customers carry an email.
    pub fn customers(n: usize) -> Vec<Customer> {
        (1..=n as i32).map(customer).collect()
    }

    pub fn customer(id: i32) -> Customer {
        Customer {
            id,
            name: format!("customer-{}", id),
            email: (id % 2 == 0).then(|| format!("c{}@example.com", id)),
            billing: (id % 3 != 0).then(|| Address {
                street: format!("{} Harbour Road", id),
                city: (id % 5 != 0).then(|| "Rotterdam".to_string()),
            }),
            orders: (0..id % 3).map(|j| order(id * 100 + j, j as usize + 1)).collect(),
        }
    }

    pub fn order(id: i32, lines: usize) -> Order {
        Order {
            id,
            total: id as i64 * 10,
            lines: (0..lines)
                .map(|k| OrderLine {
                    sku: format!("SKU-{}-{}", id, k),
                    quantity: k as i32 + 1,
                })
                .collect(),
        }
    }

    pub fn tickets(n: usize) -> Vec<Ticket> {
        (1..=n as i64)
            .map(|id| Ticket {
                id,
                title: format!("ticket-{}", id),
                priority: (id % 3) as i32,
            })
            .collect()
    }

    pub fn memberships(n: usize) -> Vec<Membership> {
        (0..n as i32)
            .map(|i| Membership {
                tenant_id: i / 10,
                user_id: i % 10,
                role: if i % 2 == 0 { "admin" } else { "member" }.to_string(),
            })
            .collect()
    }

    pub fn order_count(customers: &[Customer]) -> usize {
        customers.iter().map(|c| c.orders.len()).sum()
    }

    pub fn line_count(customers: &[Customer]) -> usize {
        customers
            .iter()
            .flat_map(|c| c.orders.iter())
            .map(|o| o.lines.len())
            .sum()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for fixture entity graphs.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_address() -> impl Strategy<Value = Address> {
        ("[a-z ]{1,24}", proptest::option::of("[A-Z][a-z]{2,12}"))
            .prop_map(|(street, city)| Address { street, city })
    }

    pub fn arb_order_line() -> impl Strategy<Value = OrderLine> {
        ("[A-Z]{3}-[0-9]{4}", 1i32..100).prop_map(|(sku, quantity)| OrderLine { sku, quantity })
    }

    pub fn arb_order() -> impl Strategy<Value = Order> {
        (
            any::<i32>(),
            0i64..1_000_000,
            proptest::collection::vec(arb_order_line(), 0..4),
        )
            .prop_map(|(id, total, lines)| Order { id, total, lines })
    }

    pub fn arb_customer() -> impl Strategy<Value = Customer> {
        (
            "[a-z]{1,16}",
            proptest::option::of("[a-z]{1,8}@example\\.com"),
            proptest::option::of(arb_address()),
            proptest::collection::vec(arb_order(), 0..4),
        )
            .prop_map(|(name, email, billing, orders)| Customer {
                id: 0,
                name,
                email,
                billing,
                orders,
            })
    }

    /// Customers with unique ids `1..=len`.
    pub fn arb_customers(max: usize) -> impl Strategy<Value = Vec<Customer>> {
        proptest::collection::vec(arb_customer(), 0..=max).prop_map(|mut customers| {
            for (i, customer) in customers.iter_mut().enumerate() {
                customer.id = i as i32 + 1;
            }
            customers
        })
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! STEVEDORE specific assertions.

    use super::*;

    pub fn assert_transport_failure<T: std::fmt::Debug>(result: &StevedoreResult<T>) {
        match result {
            Err(e) if e.is_transport_failure() => {}
            other => panic!("Expected transport failure, got {:?}", other),
        }
    }

    pub fn assert_cancelled<T: std::fmt::Debug>(result: &StevedoreResult<T>) {
        match result {
            Err(e) if e.is_cancelled() => {}
            other => panic!("Expected cancellation, got {:?}", other),
        }
    }

    pub fn assert_disposed<T: std::fmt::Debug>(result: &StevedoreResult<T>) {
        match result {
            Err(e) if e.is_disposed() => {}
            other => panic!("Expected disposed error, got {:?}", other),
        }
    }

    /// No temporary table is left and every open count was given back.
    pub fn assert_cleaned_up(db: &MockDatabase) {
        assert!(
            db.temporary_tables().is_empty(),
            "Temp tables left behind: {:?}",
            db.temporary_tables()
        );
        assert_eq!(db.open_count(), 0, "Connection is still open");
    }
}

// ============================================================================
// TESTS
// ============================================================================
