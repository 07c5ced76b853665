use asql_core::mock::MockDriver;
use asql_core::{CommitGuard, Database, QueryResult, Transaction};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tokio::task::LocalSet;

fn scripted() -> (Rc<MockDriver>, Database) {
    let driver = MockDriver::create();
    driver.set_handler(|_, _| QueryResult::with_affected(0));
    let db = Database::new(driver.clone());
    db.open(|_| {});
    (driver, db)
}

#[test]
fn dropping_a_running_transaction_rolls_back() {
    let (driver, db) = scripted();
    let transaction = Transaction::new(db);
    transaction.begin(None, None);
    assert!(transaction.is_running());
    drop(transaction);
    assert_eq!(driver.commands(), vec!["BEGIN", "ROLLBACK"]);
    assert_eq!(driver.command_count("ROLLBACK"), 1);
}

#[test]
fn committed_transaction_does_not_roll_back() {
    let (driver, db) = scripted();
    let transaction = Transaction::new(db);
    transaction.begin(None, None);
    transaction.commit(None, None);
    drop(transaction);
    assert_eq!(driver.commands(), vec!["BEGIN", "COMMIT"]);
}

#[test]
fn transaction_without_begin_is_inert() {
    let (driver, db) = scripted();
    drop(Transaction::new(db));
    assert!(driver.commands().is_empty());
}

#[test]
fn copies_share_the_running_flag() {
    let (driver, db) = scripted();
    let transaction = Transaction::new(db);
    let copy = transaction.clone();
    transaction.begin(None, None);
    copy.commit(None, None);
    drop(copy);
    drop(transaction);
    assert_eq!(driver.command_count("ROLLBACK"), 0);
}

#[test]
fn double_begin_is_rejected() {
    let (driver, db) = scripted();
    let transaction = Transaction::new(db);
    transaction.begin(None, None);
    transaction.begin(None, None);
    assert_eq!(driver.command_count("BEGIN"), 1);
    transaction.commit(None, None);
}

#[test]
fn invalid_database_skips_the_drop_rollback() {
    let transaction = Transaction::new(Database::default());
    transaction.begin(None, None);
    // nothing to assert beyond "does not panic": there is no driver to
    // observe, the drop path must simply cope with the invalid handle
    drop(transaction);
}

#[tokio::test]
async fn awaitable_begin_and_commit() {
    LocalSet::new()
        .run_until(async {
            let (driver, db) = scripted();
            let transaction = Transaction::start(&db).await.unwrap();
            assert!(transaction.is_running());
            transaction.commit_async().await.unwrap();
            assert!(!transaction.is_running());
            drop(transaction);
            assert_eq!(driver.commands(), vec!["BEGIN", "COMMIT"]);
        })
        .await;
}

#[test]
fn commit_guard_commits_on_drop() {
    let (driver, db) = scripted();
    let outcomes = Rc::new(RefCell::new(Vec::new()));
    let sink = outcomes.clone();
    let guard = CommitGuard::new(
        db,
        None,
        Some(Box::new(move |result, did_rollback| {
            sink.borrow_mut()
                .push((result.has_error(), did_rollback));
        })),
    );
    guard.begin(None, None);
    drop(guard);
    assert_eq!(driver.commands(), vec!["BEGIN", "COMMIT"]);
    assert_eq!(*outcomes.borrow(), vec![(false, false)]);
}

#[test]
fn commit_guard_respects_the_rollback_switch() {
    let (driver, db) = scripted();
    let rolled = Rc::new(Cell::new(false));
    let sink = rolled.clone();
    let guard = CommitGuard::new(
        db,
        None,
        Some(Box::new(move |_, did_rollback| sink.set(did_rollback))),
    );
    guard.begin(None, None);
    guard.set_rollback();
    assert!(guard.is_rollback());
    drop(guard);
    assert_eq!(driver.commands(), vec!["BEGIN", "ROLLBACK"]);
    assert!(rolled.get());
}

#[test]
fn commit_guard_only_runs_after_successful_begin() {
    let driver = MockDriver::create();
    driver.set_handler(|query, _| {
        if query == "BEGIN" {
            QueryResult::with_error("cannot begin")
        } else {
            QueryResult::with_affected(0)
        }
    });
    let db = Database::new(driver.clone());
    db.open(|_| {});
    let guard = CommitGuard::new(db, None, None);
    guard.begin(None, None);
    drop(guard);
    // the failed BEGIN left the guard not running, nothing else is sent
    assert_eq!(driver.commands(), vec!["BEGIN"]);
}
