#![allow(dead_code)]

pub mod memory;

use db_mirror::config::SyncConfig;
use db_mirror::db::{Row, Value};
use db_mirror::schema::{ColumnDef, TableSchema};
use db_mirror::{MirrorSync, Result, SyncReport, TableFilter};
use tokio_util::sync::CancellationToken;

pub use memory::MemoryDatabase;

pub fn users() -> TableSchema {
    TableSchema::new("users")
        .with_column(ColumnDef::new("id", "int"))
        .with_column(ColumnDef::new("name", "varchar(64)").nullable(true))
        .with_primary_key(&["id"])
}

pub fn products() -> TableSchema {
    TableSchema::new("products")
        .with_column(ColumnDef::new("id", "int"))
        .with_column(ColumnDef::new("title", "varchar(128)"))
        .with_primary_key(&["id"])
}

pub fn orders() -> TableSchema {
    TableSchema::new("orders")
        .with_column(ColumnDef::new("id", "int"))
        .with_column(ColumnDef::new("user_id", "int"))
        .with_column(ColumnDef::new("total", "decimal(10,2)"))
        .with_primary_key(&["id"])
        .with_foreign_key("fk_orders_user", &["user_id"], "users", &["id"])
}

pub fn order_items() -> TableSchema {
    TableSchema::new("order_items")
        .with_column(ColumnDef::new("order_id", "int"))
        .with_column(ColumnDef::new("product_id", "int"))
        .with_column(ColumnDef::new("qty", "int"))
        .with_primary_key(&["order_id", "product_id"])
        .with_foreign_key("fk_items_order", &["order_id"], "orders", &["id"])
        .with_foreign_key("fk_items_product", &["product_id"], "products", &["id"])
}

/// Append-only table without a primary key
pub fn audit_log() -> TableSchema {
    TableSchema::new("audit_log")
        .with_column(ColumnDef::new("event", "varchar(255)"))
        .with_column(ColumnDef::new("at", "datetime"))
}

pub fn departments() -> TableSchema {
    TableSchema::new("departments")
        .with_column(ColumnDef::new("id", "int"))
        .with_column(ColumnDef::new("name", "varchar(64)"))
        .with_column(ColumnDef::new("manager_id", "int").nullable(true))
        .with_primary_key(&["id"])
        .with_foreign_key("fk_dept_manager", &["manager_id"], "employees", &["id"])
}

pub fn employees() -> TableSchema {
    TableSchema::new("employees")
        .with_column(ColumnDef::new("id", "int"))
        .with_column(ColumnDef::new("name", "varchar(64)"))
        .with_column(ColumnDef::new("department_id", "int").nullable(true))
        .with_primary_key(&["id"])
        .with_foreign_key("fk_emp_department", &["department_id"], "departments", &["id"])
}

pub fn int(v: i64) -> Value {
    Value::Int(v)
}

pub fn text(v: &str) -> Value {
    Value::from(v)
}

pub fn decimal(v: &str) -> Value {
    Value::Decimal(v.to_string())
}

pub fn user_rows() -> Vec<Row> {
    vec![
        vec![int(1), text("Ada")],
        vec![int(2), text("Grace")],
        vec![int(3), Value::Null],
    ]
}

pub fn product_rows() -> Vec<Row> {
    vec![vec![int(1), text("Keyboard")], vec![int(2), text("Mouse")]]
}

pub fn order_rows() -> Vec<Row> {
    vec![
        vec![int(100), int(1), decimal("25.00")],
        vec![int(101), int(2), decimal("9.99")],
    ]
}

pub fn order_item_rows() -> Vec<Row> {
    vec![
        vec![int(100), int(1), int(1)],
        vec![int(100), int(2), int(3)],
        vec![int(101), int(2), int(1)],
    ]
}

pub fn audit_rows() -> Vec<Row> {
    vec![
        vec![text("login"), text("2024-01-01 10:00:00")],
        vec![text("login"), text("2024-01-01 10:00:00")],
    ]
}

/// Remote shop database: five tables, one without a primary key
pub fn shop() -> MemoryDatabase {
    MemoryDatabase::new("remote")
        .with_table(users(), user_rows())
        .with_table(products(), product_rows())
        .with_table(orders(), order_rows())
        .with_table(order_items(), order_item_rows())
        .with_table(audit_log(), audit_rows())
}

/// Remote database whose two tables reference each other
pub fn company() -> MemoryDatabase {
    MemoryDatabase::new("remote")
        .with_table(
            departments(),
            vec![
                vec![int(1), text("Engineering"), int(10)],
                vec![int(2), text("Sales"), Value::Null],
            ],
        )
        .with_table(
            employees(),
            vec![
                vec![int(10), text("Linus"), int(1)],
                vec![int(11), text("Margaret"), int(1)],
                vec![int(12), text("Dennis"), Value::Null],
            ],
        )
}

pub fn config() -> SyncConfig {
    SyncConfig {
        retry_delay_ms: 0,
        ..SyncConfig::default()
    }
}

pub async fn run(remote: &MemoryDatabase, local: &MemoryDatabase, config: SyncConfig) -> Result<SyncReport> {
    run_filtered(remote, local, config, TableFilter::default()).await
}

pub async fn run_filtered(
    remote: &MemoryDatabase,
    local: &MemoryDatabase,
    config: SyncConfig,
    filter: TableFilter,
) -> Result<SyncReport> {
    MirrorSync::new(config, filter)
        .run(remote, local, &CancellationToken::new())
        .await
}

/// Every table of `remote` has identical contents locally
pub fn assert_mirrored(remote: &MemoryDatabase, local: &MemoryDatabase, tables: &[&str]) {
    for table in tables {
        assert!(local.has_table(table), "{} missing locally", table);
        pretty_assertions::assert_eq!(remote.dump(table), local.dump(table), "contents of {}", table);
    }
}
