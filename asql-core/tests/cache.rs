use asql_core::mock::MockDriver;
use asql_core::{Cache, Database, Driver, QueryResult, Receiver, Value, params};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::LocalSet;

fn counting_backend() -> (Rc<MockDriver>, Database, Rc<Cell<u64>>) {
    let driver = MockDriver::create();
    let counter = Rc::new(Cell::new(0));
    {
        let counter = counter.clone();
        driver.set_handler(move |_, _| {
            counter.set(counter.get() + 1);
            let columns: Arc<[String]> = vec!["n".to_string()].into();
            QueryResult::with_rows(
                columns,
                vec![vec![Value::Int64(counter.get() as i64)].into_boxed_slice()],
                0,
            )
        });
    }
    let db = Database::new(driver.clone());
    db.open(|_| {});
    (driver, db, counter)
}

#[test]
fn pending_requests_coalesce_into_one_query() {
    let driver = MockDriver::create();
    let db = Database::new(driver.clone());
    db.open(|_| {});
    let cache = Cache::new(db);
    let delivered = Rc::new(RefCell::new(Vec::new()));
    for i in 0..3 {
        let delivered = delivered.clone();
        cache.exec("SELECT now()", move |result| {
            delivered.borrow_mut().push((i, result.clone()));
        });
    }
    // at most one concurrent query per key
    assert_eq!(driver.queue_size(), 1);
    assert_eq!(driver.commands().len(), 1);
    driver.complete_next(QueryResult::with_affected(0));
    let delivered = delivered.borrow();
    assert_eq!(delivered.len(), 3);
    // every waiter sees the same shared result instance
    assert!(Rc::ptr_eq(&delivered[0].1, &delivered[1].1));
    assert!(Rc::ptr_eq(&delivered[0].1, &delivered[2].1));
}

#[tokio::test]
async fn completed_entries_are_served_from_memory() {
    LocalSet::new()
        .run_until(async {
            let (_driver, db, counter) = counting_backend();
            let cache = Cache::new(db);
            let first = cache.execute("SELECT now()", Vec::new()).await.unwrap();
            let second = cache.execute("SELECT now()", Vec::new()).await.unwrap();
            assert_eq!(counter.get(), 1);
            assert!(Rc::ptr_eq(&first, &second));

            assert!(cache.clear("SELECT now()", Vec::new()));
            let third = cache.execute("SELECT now()", Vec::new()).await.unwrap();
            assert_eq!(counter.get(), 2);
            assert_ne!(
                first.first().unwrap().get(0).to_i64(),
                third.first().unwrap().get(0).to_i64()
            );
        })
        .await;
}

#[tokio::test]
async fn parameters_are_part_of_the_key() {
    LocalSet::new()
        .run_until(async {
            let (_driver, db, counter) = counting_backend();
            let cache = Cache::new(db);
            cache
                .execute("SELECT $1", params![1i64])
                .await
                .unwrap();
            cache
                .execute("SELECT $1", params![2i64])
                .await
                .unwrap();
            assert_eq!(counter.get(), 2);
            cache
                .execute("SELECT $1", params![1i64])
                .await
                .unwrap();
            assert_eq!(counter.get(), 2);
        })
        .await;
}

#[tokio::test]
async fn float_parameters_key_reliably() {
    LocalSet::new()
        .run_until(async {
            let (_driver, db, counter) = counting_backend();
            let cache = Cache::new(db);
            cache.execute("SELECT $1", params![1.5f64]).await.unwrap();
            cache.execute("SELECT $1", params![1.5f64]).await.unwrap();
            assert_eq!(counter.get(), 1);
        })
        .await;
}

#[tokio::test]
async fn expiry_removes_only_old_entries() {
    LocalSet::new()
        .run_until(async {
            let (_driver, db, counter) = counting_backend();
            let cache = Cache::new(db);
            cache.execute("SELECT 1", Vec::new()).await.unwrap();
            assert!(!cache.expire(Duration::from_secs(60), "SELECT 1", Vec::new()));
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(cache.expire(Duration::from_millis(1), "SELECT 1", Vec::new()));
            cache.execute("SELECT 1", Vec::new()).await.unwrap();
            assert_eq!(counter.get(), 2);

            cache.execute("SELECT 2", Vec::new()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(cache.expire_all(Duration::from_millis(1)), 2);
            assert!(cache.is_empty());
        })
        .await;
}

#[tokio::test]
async fn errors_are_cached_until_cleared() {
    LocalSet::new()
        .run_until(async {
            let driver = MockDriver::create();
            let calls = Rc::new(Cell::new(0));
            {
                let calls = calls.clone();
                driver.set_handler(move |_, _| {
                    calls.set(calls.get() + 1);
                    QueryResult::with_error("permanent failure")
                });
            }
            let db = Database::new(driver.clone());
            db.open(|_| {});
            let cache = Cache::new(db);
            let errors = Rc::new(Cell::new(0));
            for _ in 0..2 {
                let errors = errors.clone();
                cache.exec("SELECT broken", move |result| {
                    assert!(result.has_error());
                    errors.set(errors.get() + 1);
                });
            }
            // cached-entry delivery happens on the next event-loop turn
            tokio::time::sleep(Duration::from_millis(1)).await;
            assert_eq!(calls.get(), 1);
            assert_eq!(errors.get(), 2);
            assert!(cache.clear("SELECT broken", Vec::new()));
        })
        .await;
}

#[test]
fn error_caching_can_be_disabled() {
    let driver = MockDriver::create();
    let calls = Rc::new(Cell::new(0));
    {
        let calls = calls.clone();
        driver.set_handler(move |_, _| {
            calls.set(calls.get() + 1);
            QueryResult::with_error("transient failure")
        });
    }
    let db = Database::new(driver.clone());
    db.open(|_| {});
    let cache = Cache::new(db);
    cache.set_cache_errors(false);
    cache.exec("SELECT broken", |_| {});
    cache.exec("SELECT broken", |_| {});
    assert_eq!(calls.get(), 2);
    assert!(cache.is_empty());
}

#[test]
fn cancelled_waiters_are_not_called() {
    let driver = MockDriver::create();
    let db = Database::new(driver.clone());
    db.open(|_| {});
    let cache = Cache::new(db);
    let fired = Rc::new(Cell::new(0));
    let receiver = Receiver::new();
    {
        let fired = fired.clone();
        cache.exec_with("SELECT 1", Vec::new(), Some(&receiver), move |_| {
            fired.set(fired.get() + 1);
        });
    }
    {
        let fired = fired.clone();
        cache.exec("SELECT 1", move |_| fired.set(fired.get() + 10));
    }
    drop(receiver);
    driver.complete_next(QueryResult::with_affected(0));
    assert_eq!(fired.get(), 10);
}
