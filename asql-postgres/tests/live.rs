//! Integration tests against a live server.
//!
//! Set `ASQL_TEST_POSTGRES_URL` (e.g. `postgres://user:pw@localhost/testdb`)
//! to run them; without it every test is a silent no-op so the suite stays
//! green on machines without a server.

use asql_core::stream::StreamExt;
use asql_core::{Database, PreparedQuery, Receiver, Value, params};
use asql_postgres::Postgres;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tokio::task::LocalSet;

fn server_url() -> Option<String> {
    std::env::var("ASQL_TEST_POSTGRES_URL").ok()
}

async fn connected(url: &str) -> Database {
    let db = Postgres::database(url);
    db.connect().await.expect("failed to connect");
    db
}

macro_rules! live_test {
    ($name:ident, $body:expr) => {
        #[tokio::test]
        async fn $name() {
            let Some(url) = server_url() else {
                eprintln!("skipping {}: ASQL_TEST_POSTGRES_URL not set", stringify!($name));
                return;
            };
            LocalSet::new()
                .run_until(async move {
                    let body = $body;
                    body(url).await;
                })
                .await;
        }
    };
}

live_test!(generate_series_delivers_rows_in_order, |url: String| async move {
    let db = connected(&url).await;
    let result = db
        .execute("SELECT generate_series(1,10) AS number", Vec::new())
        .await
        .unwrap();
    assert_eq!(result.len(), 10);
    assert_eq!(result.fields(), 1);
    assert_eq!(result.field_name(0), Some("number"));
    let numbers: Vec<i64> = result.iter().filter_map(|row| row.get(0).to_i64()).collect();
    assert_eq!(numbers, (1..=10).collect::<Vec<i64>>());
});

live_test!(parameters_round_trip, |url: String| async move {
    let db = connected(&url).await;
    let result = db
        .execute(
            "SELECT $1, $2, $3, $4, now()",
            params![true, 123.4567f64, "fooo", serde_json::json!({})],
        )
        .await
        .unwrap();
    assert_eq!(result.len(), 1);
    let row = result.first().unwrap();
    assert_eq!(row.get(0).to_bool(), Some(true));
    assert_eq!(row.get(1).to_f64(), Some(123.4567));
    assert_eq!(row.get(2).as_str(), Some("fooo"));
    assert_eq!(row.get(3).to_json(), Some(serde_json::json!({})));
    assert!(row.get(4).to_timestamp().is_some());
});

live_test!(multi_statement_text_yields_one_result_per_command, |url: String| async move {
    let db = connected(&url).await;
    let results: Vec<_> = db
        .execute_stream("SELECT 1; SELECT 2; SELECT 3", Vec::new())
        .collect()
        .await;
    assert_eq!(results.len(), 3);
    assert!(results[..2].iter().all(|r| !r.last_result_set()));
    assert!(results[2].last_result_set());
    assert_eq!(results[1].first().unwrap().get(0).to_i64(), Some(2));
});

live_test!(sql_errors_fail_only_their_query, |url: String| async move {
    let db = connected(&url).await;
    let failure = db.execute("SELECT no_such_column_anywhere", Vec::new()).await;
    assert!(failure.is_err());
    // the connection survives and the queue advances
    let result = db.execute("SELECT 42", Vec::new()).await.unwrap();
    assert_eq!(result.first().unwrap().get(0).to_i64(), Some(42));
});

live_test!(prepared_statements_prepare_once, |url: String| async move {
    let db = connected(&url).await;
    let query = PreparedQuery::new("SELECT $1::int8 + 1");
    for i in 0..3i64 {
        let result = db.execute(&query, params![i]).await.unwrap();
        assert_eq!(result.first().unwrap().get(0).to_i64(), Some(i + 1));
    }
    let count = db
        .execute(
            "SELECT count(*) FROM pg_prepared_statements WHERE name = $1",
            params![query.identification()],
        )
        .await
        .unwrap();
    assert_eq!(count.first().unwrap().get(0).to_i64(), Some(1));
});

live_test!(single_row_mode_delivers_per_row, |url: String| async move {
    let db = connected(&url).await;
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    db.exec_with(
        "SELECT generate_series(1,5)",
        params![],
        None,
        move |result| {
            sink.borrow_mut()
                .push((result.len(), result.last_result_set()));
        },
    );
    db.set_last_query_single_row_mode();
    // wait for the terminal result
    let done = db.execute("SELECT 1", Vec::new()).await;
    assert!(done.is_ok());
    let seen = seen.borrow();
    assert_eq!(seen.len(), 6);
    assert!(seen[..5].iter().all(|(rows, last)| *rows == 1 && !last));
    assert_eq!(seen[5], (0, true));
});

live_test!(pipeline_echoes_parameters_in_order, |url: String| async move {
    let db = connected(&url).await;
    assert!(db.enter_pipeline_mode(Some(Duration::from_millis(50))));
    let seen = Rc::new(RefCell::new(Vec::new()));
    for i in 0..10i64 {
        let sink = seen.clone();
        db.exec_with("SELECT now(), $1", params![i], None, move |result| {
            sink.borrow_mut()
                .push(result.first().and_then(|row| row.get(1).to_i64()));
        });
    }
    assert!(db.pipeline_sync());
    // wait until every callback has fired
    for _ in 0..200 {
        if seen.borrow().len() == 10 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let seen = seen.borrow();
    let expected: Vec<Option<i64>> = (0..10).map(Some).collect();
    assert_eq!(*seen, expected);
    assert!(db.exit_pipeline_mode());
});

live_test!(notifications_are_dispatched, |url: String| async move {
    let db = connected(&url).await;
    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = received.clone();
    let receiver = Receiver::new();
    db.subscribe_to_notification("asql_live_test", Some(&receiver), move |note| {
        sink.borrow_mut()
            .push((note.payload.clone(), note.self_origin));
    });
    db.execute("NOTIFY asql_live_test, 'hello'", Vec::new())
        .await
        .unwrap();
    for _ in 0..200 {
        if !received.borrow().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        *received.borrow(),
        vec![("hello".to_string(), true)]
    );
    assert_eq!(db.subscribed_to_notifications(), vec!["asql_live_test"]);
    db.unsubscribe_from_notification("asql_live_test");
});

live_test!(receiver_drop_cancels_running_query, |url: String| async move {
    let db = connected(&url).await;
    let receiver = Receiver::new();
    let fired = Rc::new(RefCell::new(false));
    let sink = fired.clone();
    db.exec_with(
        "SELECT pg_sleep(5)",
        params![],
        Some(&receiver),
        move |_| *sink.borrow_mut() = true,
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(receiver);
    // the cancelled query still advances the queue for the next one
    let result = db.execute("SELECT 7", Vec::new()).await.unwrap();
    assert_eq!(result.first().unwrap().get(0).to_i64(), Some(7));
    assert!(!*fired.borrow());
});

live_test!(bad_url_fails_to_open, |_url: String| async move {
    let db = Postgres::database("postgres://nobody@localhost:1/void");
    assert!(db.connect().await.is_err());
});

live_test!(value_conversion_via_text_protocol, |url: String| async move {
    let db = connected(&url).await;
    // no parameters: this goes through the text protocol
    let result = db
        .execute(
            "SELECT 1::int4, 2.5::float8, 'x'::text, true, '\\x6869'::bytea, \
             '2021-06-01 10:00:00+02'::timestamptz",
            Vec::new(),
        )
        .await
        .unwrap();
    let row = result.first().unwrap();
    assert_eq!(row.get(0).to_i64(), Some(1));
    assert_eq!(row.get(1).to_f64(), Some(2.5));
    assert_eq!(row.get(2).as_str(), Some("x"));
    assert_eq!(row.get(3).to_bool(), Some(true));
    assert_eq!(row.get(4).to_blob(), Some(b"hi".to_vec()));
    assert!(row.get(5).to_timestamp().is_some());
});
