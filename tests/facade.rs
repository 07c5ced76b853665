use asql::sqlite::Sqlite;
use asql::{Cache, Pool, params};
use tokio::task::LocalSet;

#[tokio::test]
async fn the_facade_wires_everything_together() {
    LocalSet::new()
        .run_until(async {
            Pool::create("facade", Sqlite::factory("sqlite://?MEMORY"));
            let db = Pool::database("facade");
            assert!(db.is_valid());

            let result = db
                .execute("SELECT ?1 AS answer", params![41i64])
                .await
                .unwrap();
            assert_eq!(result.first().unwrap().get(0).to_i64(), Some(41));

            let cache = Cache::new(db.clone());
            let cached = cache.execute("SELECT 1", params![]).await.unwrap();
            assert_eq!(cached.first().unwrap().get(0).to_i64(), Some(1));

            Pool::remove("facade");
        })
        .await;
}
