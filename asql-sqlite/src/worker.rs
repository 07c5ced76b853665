//! Worker-thread side of the SQLite driver. The thread owns the `sqlite3`
//! handle outright; everything reaches it through the command channel and
//! results travel back as plain data. The connection pointer is mirrored
//! into an atomic so the owning thread can call `sqlite3_interrupt`.

use crate::extract::{column_name, column_value, error_message};
use asql_core::Value;
use flume::Sender;
use libsqlite3_sys::*;
use std::collections::HashMap;
use std::ffi::{CString, c_char, c_int, c_void};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

pub(crate) struct OpenConfig {
    pub path: String,
    pub flags: c_int,
}

pub(crate) enum ExecSql {
    Raw(String),
    Prepared { id: String, sql: String },
}

pub(crate) enum WorkerCommand {
    Open {
        config: OpenConfig,
        reply: Sender<Result<(), String>>,
    },
    Exec {
        sql: ExecSql,
        params: Vec<Value>,
        reply: Sender<WorkerEvent>,
    },
    Shutdown,
}

pub(crate) enum WorkerEvent {
    Result(OwnedResult),
    Done,
}

/// One statement's outcome in channel-portable form.
pub(crate) struct OwnedResult {
    pub error: Option<String>,
    pub columns: Vec<String>,
    pub rows: Vec<Box<[Value]>>,
    pub affected: u64,
}

impl OwnedResult {
    fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            columns: Vec::new(),
            rows: Vec::new(),
            affected: 0,
        }
    }
}

struct StatementBox(*mut sqlite3_stmt);

impl Drop for StatementBox {
    fn drop(&mut self) {
        unsafe {
            sqlite3_finalize(self.0);
        }
    }
}

pub(crate) fn worker_main(
    commands: flume::Receiver<WorkerCommand>,
    shared: Arc<AtomicPtr<sqlite3>>,
) {
    let mut db: *mut sqlite3 = ptr::null_mut();
    let mut statements: HashMap<String, StatementBox> = HashMap::new();
    while let Ok(command) = commands.recv() {
        match command {
            WorkerCommand::Open { config, reply } => {
                let outcome = open_database(&config, &mut db);
                if outcome.is_ok() {
                    shared.store(db, Ordering::Release);
                }
                let _ = reply.send(outcome);
            }
            WorkerCommand::Exec { sql, params, reply } => {
                if db.is_null() {
                    let _ = reply.send(WorkerEvent::Result(OwnedResult::error(
                        "database is not open",
                    )));
                } else {
                    match sql {
                        ExecSql::Raw(sql) => run_raw(db, &sql, &params, &reply),
                        ExecSql::Prepared { id, sql } => {
                            run_prepared(db, &mut statements, id, &sql, &params, &reply)
                        }
                    }
                }
                let _ = reply.send(WorkerEvent::Done);
            }
            WorkerCommand::Shutdown => break,
        }
    }
    shared.store(ptr::null_mut(), Ordering::Release);
    statements.clear();
    if !db.is_null() {
        unsafe {
            if sqlite3_close(db) != SQLITE_OK {
                log::error!("could not close sqlite connection");
            }
        }
    }
}

fn open_database(config: &OpenConfig, db: &mut *mut sqlite3) -> Result<(), String> {
    if !db.is_null() {
        return Ok(());
    }
    let path = CString::new(config.path.as_bytes()).map_err(|e| e.to_string())?;
    unsafe {
        let rc = sqlite3_open_v2(path.as_ptr(), db, config.flags, ptr::null());
        if rc != SQLITE_OK {
            let error = format!("failed to open database: {}", error_message(*db));
            sqlite3_close(*db);
            *db = ptr::null_mut();
            return Err(error);
        }
    }
    Ok(())
}

/// Multi-statement execution: each statement of the text is prepared from
/// the previous one's tail and produces its own result.
fn run_raw(db: *mut sqlite3, sql: &str, params: &[Value], reply: &Sender<WorkerEvent>) {
    let trimmed = sql.trim();
    let mut it = trimmed.as_ptr() as *const c_char;
    let mut len = trimmed.len() as c_int;
    while len > 0 {
        let mut handle = ptr::null_mut();
        let mut tail = ptr::null();
        let rc = unsafe { sqlite3_prepare_v2(db, it, len, &mut handle, &mut tail) };
        if rc != SQLITE_OK {
            let _ = reply.send(WorkerEvent::Result(OwnedResult::error(error_message(db))));
            return;
        }
        if handle.is_null() {
            // trailing whitespace or comments
            return;
        }
        let statement = StatementBox(handle);
        if let Err(error) = bind_params(db, statement.0, params) {
            let _ = reply.send(WorkerEvent::Result(OwnedResult::error(error)));
            return;
        }
        if !step_statement(db, statement.0, reply) {
            return;
        }
        if tail.is_null() {
            return;
        }
        let consumed = unsafe { tail.offset_from(it) } as c_int;
        len -= consumed;
        it = tail;
    }
}

/// Prepared handles are prepared at most once per driver; the identifier
/// keys the statement cache and later executes only rebind.
fn run_prepared(
    db: *mut sqlite3,
    statements: &mut HashMap<String, StatementBox>,
    id: String,
    sql: &str,
    params: &[Value],
    reply: &Sender<WorkerEvent>,
) {
    let handle = match statements.get(&id) {
        Some(existing) => {
            unsafe {
                sqlite3_reset(existing.0);
                sqlite3_clear_bindings(existing.0);
            }
            existing.0
        }
        None => {
            let Ok(c_sql) = CString::new(sql.as_bytes()) else {
                let _ = reply.send(WorkerEvent::Result(OwnedResult::error(
                    "query text contains a nul byte",
                )));
                return;
            };
            let mut handle = ptr::null_mut();
            let mut tail = ptr::null();
            let rc = unsafe {
                sqlite3_prepare_v2(db, c_sql.as_ptr(), sql.len() as c_int, &mut handle, &mut tail)
            };
            if rc != SQLITE_OK {
                let _ = reply.send(WorkerEvent::Result(OwnedResult::error(error_message(db))));
                return;
            }
            if !tail.is_null() && unsafe { *tail } != 0 {
                unsafe {
                    sqlite3_finalize(handle);
                }
                let _ = reply.send(WorkerEvent::Result(OwnedResult::error(
                    "cannot prepare more than one statement at a time",
                )));
                return;
            }
            statements.insert(id.clone(), StatementBox(handle));
            handle
        }
    };
    if let Err(error) = bind_params(db, handle, params) {
        let _ = reply.send(WorkerEvent::Result(OwnedResult::error(error)));
        return;
    }
    step_statement(db, handle, reply);
}

/// Steps one statement to completion. Returns whether the caller may keep
/// going with further statements.
fn step_statement(db: *mut sqlite3, statement: *mut sqlite3_stmt, reply: &Sender<WorkerEvent>) -> bool {
    let count = unsafe { sqlite3_column_count(statement) };
    let columns: Vec<String> = (0..count).map(|i| column_name(statement, i)).collect();
    let mut rows: Vec<Box<[Value]>> = Vec::new();
    loop {
        match unsafe { sqlite3_step(statement) } {
            SQLITE_BUSY => continue,
            SQLITE_ROW => {
                rows.push((0..count).map(|i| column_value(statement, i)).collect());
            }
            SQLITE_DONE => {
                let affected = unsafe {
                    if sqlite3_stmt_readonly(statement) == 0 {
                        sqlite3_changes64(db) as u64
                    } else {
                        0
                    }
                };
                let _ = reply.send(WorkerEvent::Result(OwnedResult {
                    error: None,
                    columns,
                    rows,
                    affected,
                }));
                return true;
            }
            _ => {
                let _ = reply.send(WorkerEvent::Result(OwnedResult::error(error_message(db))));
                return false;
            }
        }
    }
}

fn bind_params(db: *mut sqlite3, statement: *mut sqlite3_stmt, params: &[Value]) -> Result<(), String> {
    let expected = unsafe { sqlite3_bind_parameter_count(statement) } as usize;
    for (i, value) in params.iter().take(expected).enumerate() {
        let index = (i + 1) as c_int;
        let rc = unsafe {
            match value {
                Value::Null => sqlite3_bind_null(statement, index),
                Value::Bool(v) => sqlite3_bind_int(statement, index, *v as c_int),
                Value::Int32(v) => sqlite3_bind_int(statement, index, *v),
                Value::Int64(v) => sqlite3_bind_int64(statement, index, *v),
                Value::Float64(v) => sqlite3_bind_double(statement, index, *v),
                Value::Text(v) => bind_text(statement, index, v),
                Value::Blob(v) => sqlite3_bind_blob(
                    statement,
                    index,
                    v.as_ptr() as *const c_void,
                    v.len() as c_int,
                    SQLITE_TRANSIENT(),
                ),
                Value::Uuid(v) => bind_text(statement, index, &v.to_string()),
                Value::Json(v) => bind_text(statement, index, &v.to_string()),
                Value::Date(v) => bind_text(statement, index, &v.to_string()),
                Value::Time(v) => bind_text(statement, index, &v.to_string()),
                Value::Timestamp(v) => bind_text(statement, index, &v.to_string()),
            }
        };
        if rc != SQLITE_OK {
            return Err(format!(
                "cannot bind parameter {index}: {}",
                error_message(db)
            ));
        }
    }
    Ok(())
}

unsafe fn bind_text(statement: *mut sqlite3_stmt, index: c_int, text: &str) -> c_int {
    unsafe {
        sqlite3_bind_text(
            statement,
            index,
            text.as_ptr() as *const c_char,
            text.len() as c_int,
            SQLITE_TRANSIENT(),
        )
    }
}
