mod common;

use common::*;
use db_mirror::config::{OrphanPolicy, SyncConfig, SyncMode};
use db_mirror::db::Value;
use db_mirror::stats::StrategyKind;
use db_mirror::TableState;
use pretty_assertions::assert_eq;
use rstest::rstest;

fn multi_pass() -> SyncConfig {
    SyncConfig {
        mode: SyncMode::MultiPass,
        ..config()
    }
}

#[tokio::test]
async fn test_mutually_referencing_rows_are_loaded() {
    let remote = company();
    let local = MemoryDatabase::new("local");

    let report = run(&remote, &local, multi_pass()).await.unwrap();
    let stats = &report.statistics;

    assert_mirrored(&remote, &local, &["departments", "employees"]);
    for table in ["departments", "employees"] {
        let outcome = stats.outcome(table).unwrap();
        assert_eq!(outcome.state, TableState::Done);
        assert_eq!(outcome.strategy, Some(StrategyKind::MultiPass));
    }
    assert_eq!(stats.rows_inserted, 5);
    assert_eq!(stats.constraint_violations, 0);
    assert_eq!(stats.orphans_deleted, 0);
    assert!(local.foreign_key_checks());
    // no multi_pass hint when it is already in use
    assert!(report.recommendations.iter().all(|r| !r.contains("multi_pass")));
}

#[tokio::test]
async fn test_acyclic_schema_and_keyless_table() {
    let remote = shop();
    let local = MemoryDatabase::new("local");

    let report = run(&remote, &local, multi_pass()).await.unwrap();

    assert_mirrored(
        &remote,
        &local,
        &["users", "products", "orders", "order_items", "audit_log"],
    );
    assert_eq!(report.statistics.tables_synced, 5);
    assert!(report.statistics.is_success());
}

#[tokio::test]
async fn test_second_multi_pass_run_changes_nothing() {
    let remote = company();
    let local = MemoryDatabase::new("local");
    run(&remote, &local, multi_pass()).await.unwrap();
    let writes = local.executed();

    let report = run(&remote, &local, multi_pass()).await.unwrap();
    let stats = &report.statistics;

    assert_eq!((stats.rows_inserted, stats.rows_updated, stats.rows_deleted), (0, 0, 0));
    assert_eq!(local.executed(), writes);
}

#[tokio::test]
async fn test_reconnect_keeps_checks_disabled() {
    let remote = company();
    let local = MemoryDatabase::new("local");
    run(&remote, &local, multi_pass()).await.unwrap();

    // Engineering and its staff reference each other, so removing them
    // locally only works with checks off
    remote.remove_row("departments", int(1));
    remote.remove_row("employees", int(10));
    remote.remove_row("employees", int(11));
    local.fail_keys_transiently("departments", 1);
    local.fail_keys_transiently("employees", 1);

    let report = run(&remote, &local, multi_pass()).await.unwrap();
    let stats = &report.statistics;

    assert_eq!(local.reconnects(), 2);
    assert!(stats.is_success(), "{:?}", stats.errored_tables());
    assert_eq!(stats.rows_deleted, 3);
    assert_eq!(stats.constraint_violations, 0);
    assert_mirrored(&remote, &local, &["departments", "employees"]);
    assert!(local.foreign_key_checks());
}

#[tokio::test]
async fn test_rows_of_a_failed_table_satisfy_no_references() {
    let remote = company();
    let local = MemoryDatabase::new("local");
    run(&remote, &local, multi_pass()).await.unwrap();

    // a new department and its manager reference each other
    remote.push_rows("departments", vec![vec![int(3), text("Legal"), int(13)]]);
    remote.push_rows("employees", vec![vec![int(13), text("Ken"), int(3)]]);
    remote.set_value("employees", int(12), "name", text("Rob"));
    local.fail_writes("employees");
    let departments_before = local.dump("departments");

    let report = run(&remote, &local, multi_pass()).await.unwrap();
    let stats = &report.statistics;

    assert_eq!(stats.errored_tables(), vec!["employees"]);
    let departments = stats.outcome("departments").unwrap();
    assert_eq!(departments.state, TableState::Done);
    assert_eq!(departments.rows.inserted, 0);
    assert_eq!(departments.rows.skipped, 1);
    assert_eq!(local.dump("departments"), departments_before);
    assert_eq!(local.count("employees"), 3);
    assert!(local.foreign_key_checks());
}

#[tokio::test]
async fn test_references_into_a_failed_table_are_cleaned() {
    let remote = company();
    let local = MemoryDatabase::new("local");
    run(&remote, &local, multi_pass()).await.unwrap();

    // both sides hold a department whose manager exists nowhere
    let dangling = vec![int(3), text("Legal"), int(99)];
    remote.push_rows("departments", vec![dangling.clone()]);
    local.push_rows("departments", vec![dangling]);
    remote.set_value("employees", int(12), "name", text("Rob"));
    local.fail_writes("employees");

    let report = run(&remote, &local, multi_pass()).await.unwrap();
    let stats = &report.statistics;

    assert_eq!(stats.errored_tables(), vec!["employees"]);
    assert_eq!(stats.orphans_deleted, 1);
    assert_eq!(local.count("departments"), 2);
    assert!(local.foreign_key_checks());
}

#[tokio::test]
async fn test_reference_to_nowhere_is_skipped() {
    let remote = company();
    remote.push_rows("employees", vec![vec![int(13), text("Ghost"), int(42)]]);
    let local = MemoryDatabase::new("local");

    let report = run(&remote, &local, multi_pass()).await.unwrap();

    let employees = report.statistics.outcome("employees").unwrap();
    assert_eq!(employees.state, TableState::Done);
    assert_eq!(employees.rows.inserted, 3);
    assert_eq!(employees.rows.skipped, 1);
    assert_eq!(report.statistics.constraint_violations, 1);
    assert_eq!(local.count("employees"), 3);
}

#[rstest]
#[case::any_missing(OrphanPolicy::AnyMissing, 1)]
#[case::all_missing(OrphanPolicy::AllMissing, 1)]
#[case::report_only(OrphanPolicy::ReportOnly, 0)]
#[tokio::test]
async fn test_orphan_policy(#[case] policy: OrphanPolicy, #[case] expected_deleted: u64) {
    let remote = company();
    let local = MemoryDatabase::new("local");
    run(&remote, &local, multi_pass()).await.unwrap();

    // the remote row points at a department the remote no longer has; the
    // local copy still has it until this run deletes it
    remote.push_rows("employees", vec![vec![int(20), text("Orphan"), int(3)]]);
    local.push_rows("departments", vec![vec![int(3), text("Legal"), Value::Null]]);
    local.push_rows("employees", vec![vec![int(20), text("Orphan"), int(3)]]);

    let config = SyncConfig {
        orphan_policy: policy,
        ..multi_pass()
    };
    let report = run(&remote, &local, config).await.unwrap();
    let stats = &report.statistics;

    assert_eq!(stats.outcome("departments").unwrap().rows.deleted, 1);
    assert_eq!(stats.orphans_deleted, expected_deleted);
    assert_eq!(local.count("employees"), 4 - expected_deleted as usize);
    assert!(stats.is_success());
    assert!(local.foreign_key_checks());
}

#[tokio::test]
async fn test_failing_table_is_contained() {
    let remote = shop();
    let local = MemoryDatabase::new("local");
    run(&remote, &local, multi_pass()).await.unwrap();

    remote.push_rows("products", vec![vec![int(3), text("Monitor")]]);
    remote.push_rows("users", vec![vec![int(4), text("Barbara")]]);
    local.fail_writes("products");

    let report = run(&remote, &local, multi_pass()).await.unwrap();
    let stats = &report.statistics;

    assert_eq!(stats.errored_tables(), vec!["products"]);
    assert_eq!(stats.outcome("products").unwrap().strategy, Some(StrategyKind::MultiPass));
    assert_eq!(stats.outcome("users").unwrap().rows.inserted, 1);
    assert_eq!(local.count("products"), 2);
    assert!(!local.in_transaction());
    assert!(local.foreign_key_checks());
}
