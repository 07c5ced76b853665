use crate::stream::StreamExt;
use crate::{Database, Error, Result, Transaction, params};
use regex::Regex;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::path::Path;

const CREATE_BOOKKEEPING: &str = "CREATE TABLE IF NOT EXISTS asql_migrations (\n\
     name text primary key,\n\
     version bigint not null check (version >= 0)\n\
     )";

/// Schema migration engine.
///
/// The source document is plain SQL with `-- <version> up` and
/// `-- <version> down` section headers; lines belong to the most recent
/// header. `up` and `down` are indexed independently and a missing `down`
/// for a version simply forbids rolling back past it.
///
/// [`Migrations::migrate`] walks from the active to the target version one
/// transaction per step, re-reading the recorded version under lock each
/// time. Each step is one multi-statement submission combining the
/// bookkeeping upsert with the step's SQL, so bookkeeping and schema can
/// never diverge, and a failing step leaves every previously committed step
/// in place.
pub struct Migrations {
    db: Database,
    name: String,
    up: BTreeMap<i64, String>,
    down: BTreeMap<i64, String>,
    latest: i64,
    active: Cell<i64>,
}

impl Migrations {
    pub fn new(db: Database, name: impl Into<String>) -> Self {
        Self {
            db,
            name: name.into(),
            up: BTreeMap::new(),
            down: BTreeMap::new(),
            latest: -1,
            active: Cell::new(-1),
        }
    }

    pub fn from_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Migration(format!(
                "failed to open migrations {}: {e}",
                path.as_ref().display()
            ))
        })?;
        self.from_string(&text)
    }

    /// Parses the migration source. Duplicate sections are rejected.
    pub fn from_string(&mut self, text: &str) -> Result<()> {
        let header = Regex::new(r"(?i)^\s*--\s*(\d+)\s*(up|down)").expect("header pattern");
        let mut up: BTreeMap<i64, String> = BTreeMap::new();
        let mut down: BTreeMap<i64, String> = BTreeMap::new();
        let mut version = 0;
        let mut latest = -1;
        let mut up_way = true;
        for line in text.lines() {
            if let Some(captures) = header.captures(line) {
                version = captures[1]
                    .parse()
                    .map_err(|_| Error::Migration(format!("invalid version in: {line}")))?;
                up_way = captures[2].eq_ignore_ascii_case("up");
                let sections = if up_way { &up } else { &down };
                if sections.contains_key(&version) {
                    let way = if up_way { "up" } else { "down" };
                    return Err(Error::Migration(format!(
                        "duplicated {way} section for version {version}"
                    )));
                }
                latest = latest.max(version);
            } else if version > 0 {
                let sections = if up_way { &mut up } else { &mut down };
                let sql = sections.entry(version).or_default();
                sql.push_str(line);
                sql.push('\n');
            }
        }
        self.latest = latest;
        self.up = up;
        self.down = down;
        Ok(())
    }

    /// Highest version named by the loaded source; `-1` before parsing.
    pub fn latest(&self) -> i64 {
        self.latest
    }

    /// Version recorded in the database; `-1` before [`Migrations::load`].
    pub fn active(&self) -> i64 {
        self.active.get()
    }

    /// Ensures the bookkeeping table exists and reads the active version.
    pub async fn load(&self) -> Result<()> {
        // ignore failures here, the table may exist with another owner
        if let Err(e) = self.db.execute(CREATE_BOOKKEEPING, Vec::new()).await {
            log::debug!("create migrations table: {e}");
        }
        let result = self
            .db
            .execute(
                "SELECT version FROM asql_migrations WHERE name=$1",
                params![self.name.as_str()],
            )
            .await?;
        let version = result
            .first()
            .and_then(|row| row.get(0).to_i64())
            .unwrap_or(0);
        self.active.set(version);
        Ok(())
    }

    /// The SQL that would run migrating between two versions, one step per
    /// entry, in application order.
    pub fn sql_list_for(&self, from: i64, to: i64) -> Vec<String> {
        if from == to {
            Vec::new()
        } else if from < to {
            self.up
                .range(from + 1..=to)
                .map(|(_, sql)| sql.clone())
                .collect()
        } else {
            self.down
                .range(to + 1..=from)
                .rev()
                .map(|(_, sql)| sql.clone())
                .collect()
        }
    }

    pub fn sql_for(&self, from: i64, to: i64) -> String {
        self.sql_list_for(from, to).join("\n")
    }

    /// Migrates to the latest parsed version.
    pub async fn migrate_latest(&self, dry_run: bool) -> Result<()> {
        self.migrate(self.latest.max(0), dry_run).await
    }

    /// Steps the schema to `target`, forward or backward, one transaction
    /// per step. With `dry_run` the first pending step is applied and rolled
    /// back instead of committed, and nothing further runs.
    pub async fn migrate(&self, target: i64, dry_run: bool) -> Result<()> {
        if target < 0 {
            return Err(Error::Migration("invalid target version".into()));
        }
        loop {
            let transaction = Transaction::start(&self.db).await?;
            let result = self
                .db
                .execute(self.version_lock_query(), params![self.name.as_str()])
                .await?;
            let active = result
                .first()
                .and_then(|row| row.get(0).to_i64())
                .unwrap_or(0);
            if active > self.latest {
                return Err(Error::MigrationAhead {
                    active,
                    latest: self.latest,
                });
            }
            let Some((next, sql)) = self.next_query(active, target) else {
                transaction.commit_async().await?;
                self.active.set(active);
                return Ok(());
            };
            log::debug!("migrating {} from {active} to {next}", self.name);
            let mut results = self.db.execute_stream(sql, Vec::new());
            while let Some(result) = results.next().await {
                if result.has_error() {
                    return Err(Error::Query(result.error_string().to_string()));
                }
            }
            if dry_run {
                // the rolled-back bookkeeping would hand out this same step
                // on every further round
                transaction.rollback_async().await?;
                return Ok(());
            }
            transaction.commit_async().await?;
            log::info!("migrated {} from {active} to {next}", self.name);
            self.active.set(next);
        }
    }

    /// The single step between `from` and `target`: the post-step version
    /// plus a multi-statement submission updating bookkeeping and applying
    /// the step atomically.
    fn next_query(&self, from: i64, target: i64) -> Option<(i64, String)> {
        if from == target {
            return None;
        }
        let (version, step) = if from < target {
            let (version, sql) = self.up.range(from + 1..=target).next()?;
            (*version, sql)
        } else {
            let (version, sql) = self.down.range(target + 1..=from).next_back()?;
            (*version - 1, sql)
        };
        let name = self.name.replace('\'', "''");
        Some((
            version,
            format!(
                "INSERT INTO asql_migrations VALUES ('{name}', {version})\n\
                 ON CONFLICT (name) DO UPDATE\n\
                 SET version=EXCLUDED.version\n\
                 RETURNING version;\n\
                 {step}"
            ),
        ))
    }

    fn version_lock_query(&self) -> &'static str {
        // the embedded backend locks the whole database anyway
        let row_locking = self
            .db
            .driver()
            .is_some_and(|d| d.backend_name() != "sqlite");
        if row_locking {
            "SELECT version FROM asql_migrations WHERE name=$1 FOR UPDATE"
        } else {
            "SELECT version FROM asql_migrations WHERE name=$1"
        }
    }
}
