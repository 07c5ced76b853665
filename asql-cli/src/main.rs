use asql_core::{Database, Migrations};
use asql_postgres::Postgres;
use asql_sqlite::Sqlite;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tokio::task::LocalSet;

// Exit codes, stable for scripting:
// 0 success or no-op, 1 no input files, 2 bad target, 3 no url, 4 no name,
// 5 open or driver error, 6 connect failure, 7 bookkeeping failure,
// 8 cancelled by the user, 9 migration error.

#[derive(Parser)]
#[command(name = "asql-migrate", version, about = "asql database migration tool")]
struct Cli {
    /// Migration file(s), concatenated in order.
    #[arg(value_name = "source")]
    files: Vec<PathBuf>,

    /// Connection URL to the database.
    #[arg(short = 'c', long = "connection", value_name = "url")]
    connection: Option<String>,

    /// Migration name; defaults to the first filename's stem.
    #[arg(short = 'n', long = "name", value_name = "name")]
    name: Option<String>,

    /// Migrate the database to this version instead of the latest.
    #[arg(long = "target", value_name = "version", allow_hyphen_values = true)]
    target: Option<i64>,

    /// Automatically confirm a forward migration.
    #[arg(short = 'y', long = "yes")]
    confirm: bool,

    /// Do everything but roll back instead of committing.
    #[arg(short = 'd', long = "dry-run")]
    dry_run: bool,

    /// Print the aggregate migration SQL.
    #[arg(short = 's', long = "show-sql")]
    show_sql: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if cli.files.is_empty() {
        eprintln!("No migration file(s) specified.");
        return ExitCode::from(1);
    }
    if let Some(target) = cli.target
        && target < 0
    {
        eprintln!("Invalid target version {target}.");
        return ExitCode::from(2);
    }
    let Some(url) = cli.connection.clone() else {
        eprintln!("Connection URL not set.");
        return ExitCode::from(3);
    };
    let name = match &cli.name {
        Some(name) if !name.is_empty() => name.clone(),
        _ => {
            let stem = cli
                .files
                .first()
                .and_then(|path| path.file_stem())
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            if stem.is_empty() {
                eprintln!("Migration name not set.");
                return ExitCode::from(4);
            }
            stem
        }
    };

    let mut sql = String::new();
    for file in &cli.files {
        match std::fs::read_to_string(file) {
            Ok(content) => sql.push_str(&content),
            Err(error) => {
                eprintln!("Failed to open migration file {}: {error}.", file.display());
                return ExitCode::from(5);
            }
        }
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("Failed to start runtime: {error}.");
            return ExitCode::from(5);
        }
    };
    let local = LocalSet::new();
    runtime.block_on(local.run_until(run(&cli, url, name, sql)))
}

fn database_for(url: &str) -> Database {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        Postgres::database(url)
    } else if url.starts_with("sqlite://") {
        Sqlite::database(url)
    } else {
        Database::default()
    }
}

async fn run(cli: &Cli, url: String, name: String, sql: String) -> ExitCode {
    let db = database_for(&url);
    if !db.is_valid() {
        eprintln!("No driver for url: {url}.");
        return ExitCode::from(5);
    }
    if let Err(error) = db.connect().await {
        eprintln!("Failed to open database: {error}.");
        return ExitCode::from(6);
    }

    let mut migrations = Migrations::new(db, name.clone());
    if let Err(error) = migrations.from_string(&sql) {
        eprintln!("Failed to parse migrations: {error}.");
        return ExitCode::from(9);
    }
    if let Err(error) = migrations.load().await {
        eprintln!("Failed to initialize migrations: {error}.");
        return ExitCode::from(7);
    }

    let active = migrations.active();
    let new_version = match cli.target {
        Some(target) if target <= migrations.latest() => target,
        _ => migrations.latest().max(0),
    };
    if active == new_version {
        eprintln!("Database is already at target version: {active}.");
        return ExitCode::SUCCESS;
    }

    if cli.show_sql {
        println!("Migration SQL:");
        println!("{}", migrations.sql_for(active, new_version));
    }

    // a rollback always re-asks, and with a stronger prompt
    if !cli.confirm || new_version < active {
        let expected = if new_version < active {
            print!("Do you want to ROLLBACK '{name}' from {active} to {new_version}? [yes/no] ");
            "yes"
        } else {
            print!("Do you want to migrate '{name}' from {active} to {new_version}? [y/n] ");
            "y"
        };
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() || answer.trim() != expected {
            return ExitCode::from(8);
        }
    }

    let started = Instant::now();
    match migrations.migrate(new_version, cli.dry_run).await {
        Err(error) => {
            eprintln!("Error: {error}.");
            ExitCode::from(9)
        }
        Ok(()) => {
            println!(
                "Migration finished with success: '{name}'. Took {} ms",
                started.elapsed().as_millis()
            );
            ExitCode::SUCCESS
        }
    }
}
