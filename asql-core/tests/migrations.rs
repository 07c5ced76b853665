use asql_core::mock::MockDriver;
use asql_core::{Database, Error, Migrations, QueryResult, Value};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use tokio::task::LocalSet;

const SOURCE: &str = "-- 1 up\n\
    CREATE TABLE m(x TEXT);\n\
    -- 1 down\n\
    DROP TABLE m;\n\
    -- 2 up\n\
    INSERT INTO m VALUES ('a');\n\
    -- 2 down\n\
    DELETE FROM m;\n";

/// Mock backend keeping just enough state to act like the bookkeeping table.
struct Bookkeeping {
    version: Rc<Cell<i64>>,
    steps: Rc<RefCell<Vec<String>>>,
    driver: Rc<MockDriver>,
}

fn bookkeeping_backend(initial_version: Option<i64>) -> (Bookkeeping, Database) {
    let driver = MockDriver::create();
    let version = Rc::new(Cell::new(initial_version.unwrap_or(0)));
    let has_row = Rc::new(Cell::new(initial_version.is_some()));
    let steps = Rc::new(RefCell::new(Vec::new()));
    {
        let version = version.clone();
        let has_row = has_row.clone();
        let steps = steps.clone();
        driver.set_handler(move |query, _params: &[Value]| {
            if query.starts_with("SELECT version") {
                if has_row.get() {
                    let columns: Arc<[String]> = vec!["version".to_string()].into();
                    QueryResult::with_rows(
                        columns,
                        vec![vec![Value::Int64(version.get())].into_boxed_slice()],
                        0,
                    )
                } else {
                    QueryResult::with_rows(vec!["version".to_string()].into(), Vec::new(), 0)
                }
            } else if query.starts_with("INSERT INTO asql_migrations") {
                // the step submission carries the new version inline
                let new_version = query
                    .split_once("', ")
                    .and_then(|(_, rest)| rest.split_once(')'))
                    .and_then(|(digits, _)| digits.trim().parse().ok())
                    .expect("bookkeeping upsert must carry a version");
                version.set(new_version);
                has_row.set(true);
                steps.borrow_mut().push(query.to_string());
                QueryResult::with_affected(1)
            } else {
                QueryResult::with_affected(0)
            }
        });
    }
    let db = Database::new(driver.clone());
    db.open(|_| {});
    (
        Bookkeeping {
            version,
            steps,
            driver,
        },
        db,
    )
}

fn migrations(db: &Database) -> Migrations {
    let mut migrations = Migrations::new(db.clone(), "tst");
    migrations.from_string(SOURCE).unwrap();
    migrations
}

#[tokio::test]
async fn migrates_forward_step_by_step() {
    LocalSet::new()
        .run_until(async {
            let (backend, db) = bookkeeping_backend(None);
            let m = migrations(&db);
            m.load().await.unwrap();
            assert_eq!(m.active(), 0);

            m.migrate(2, false).await.unwrap();
            assert_eq!(m.active(), 2);
            assert_eq!(backend.version.get(), 2);
            let steps = backend.steps.borrow();
            assert_eq!(steps.len(), 2);
            assert!(steps[0].contains("CREATE TABLE m"));
            assert!(steps[1].contains("INSERT INTO m"));
            // every step commits its own transaction; the final round that
            // finds nothing left to do commits too
            assert_eq!(backend.driver.command_count("BEGIN"), 3);
            assert_eq!(backend.driver.command_count("COMMIT"), 3);
            assert_eq!(backend.driver.command_count("ROLLBACK"), 0);
        })
        .await;
}

#[tokio::test]
async fn migrates_backward_to_zero() {
    LocalSet::new()
        .run_until(async {
            let (backend, db) = bookkeeping_backend(Some(2));
            let m = migrations(&db);
            m.load().await.unwrap();
            assert_eq!(m.active(), 2);

            m.migrate(0, false).await.unwrap();
            assert_eq!(m.active(), 0);
            assert_eq!(backend.version.get(), 0);
            let steps = backend.steps.borrow();
            assert_eq!(steps.len(), 2);
            assert!(steps[0].contains("DELETE FROM m"));
            assert!(steps[1].contains("DROP TABLE m"));
            assert_eq!(backend.driver.command_count("COMMIT"), 3);
        })
        .await;
}

#[tokio::test]
async fn already_at_target_is_a_no_op() {
    LocalSet::new()
        .run_until(async {
            let (backend, db) = bookkeeping_backend(Some(2));
            let m = migrations(&db);
            m.migrate(2, false).await.unwrap();
            assert!(backend.steps.borrow().is_empty());
            assert_eq!(backend.driver.command_count("COMMIT"), 1);
        })
        .await;
}

#[tokio::test]
async fn database_ahead_of_code_fails() {
    LocalSet::new()
        .run_until(async {
            let (_backend, db) = bookkeeping_backend(Some(7));
            let m = migrations(&db);
            match m.migrate(2, false).await {
                Err(Error::MigrationAhead { active, latest }) => {
                    assert_eq!(active, 7);
                    assert_eq!(latest, 2);
                }
                other => panic!("unexpected: {other:?}"),
            }
        })
        .await;
}

#[tokio::test]
async fn dry_run_applies_one_step_and_rolls_it_back() {
    LocalSet::new()
        .run_until(async {
            let (backend, db) = bookkeeping_backend(None);
            let m = migrations(&db);
            m.migrate(2, true).await.unwrap();
            // only the first pending step runs before the rollback; a
            // further round would just be handed the same step again
            let steps = backend.steps.borrow();
            assert_eq!(steps.len(), 1);
            assert!(steps[0].contains("CREATE TABLE m"));
            assert_eq!(backend.driver.command_count("COMMIT"), 0);
            assert_eq!(backend.driver.command_count("ROLLBACK"), 1);
            // the engine does not pretend the schema moved
            assert_eq!(m.active(), -1);
        })
        .await;
}

#[tokio::test]
async fn failing_step_rolls_back_only_its_own_transaction() {
    LocalSet::new()
        .run_until(async {
            // step 1 succeeds, step 2 fails
            let driver = MockDriver::create();
            let version = Rc::new(Cell::new(0i64));
            let steps = Rc::new(RefCell::new(Vec::new()));
            {
                let version = version.clone();
                let steps = steps.clone();
                driver.set_handler(move |query, _| {
                    if query.starts_with("SELECT version") {
                        QueryResult::with_rows(
                            vec!["version".to_string()].into(),
                            vec![vec![Value::Int64(version.get())].into_boxed_slice()],
                            0,
                        )
                    } else if query.contains("('tst', 2)") {
                        QueryResult::with_error("table already exists")
                    } else if query.starts_with("INSERT INTO asql_migrations") {
                        version.set(1);
                        steps.borrow_mut().push(query.to_string());
                        QueryResult::with_affected(1)
                    } else {
                        QueryResult::with_affected(0)
                    }
                });
            }
            let db = Database::new(driver.clone());
            db.open(|_| {});
            let m = migrations(&db);
            match m.migrate(2, false).await {
                Err(Error::Query(message)) => assert!(message.contains("already exists")),
                other => panic!("unexpected: {other:?}"),
            }
            // the first step's own transaction committed and stands; only
            // the failing step's transaction was rolled back on drop
            assert_eq!(steps.borrow().len(), 1);
            assert_eq!(version.get(), 1);
            assert_eq!(driver.command_count("COMMIT"), 1);
            assert_eq!(driver.command_count("ROLLBACK"), 1);
        })
        .await;
}

#[tokio::test]
async fn negative_target_is_rejected() {
    LocalSet::new()
        .run_until(async {
            let (_backend, db) = bookkeeping_backend(None);
            let m = migrations(&db);
            assert!(matches!(
                m.migrate(-1, false).await,
                Err(Error::Migration(..))
            ));
        })
        .await;
}
