use asql_core::Value;
use libsqlite3_sys::*;
use std::ffi::{CStr, c_int};

pub(crate) fn column_value(statement: *mut sqlite3_stmt, index: c_int) -> Value {
    unsafe {
        match sqlite3_column_type(statement, index) {
            SQLITE_NULL => Value::Null,
            SQLITE_INTEGER => Value::Int64(sqlite3_column_int64(statement, index)),
            SQLITE_FLOAT => Value::Float64(sqlite3_column_double(statement, index)),
            SQLITE_BLOB => {
                let ptr = sqlite3_column_blob(statement, index) as *const u8;
                let len = sqlite3_column_bytes(statement, index) as usize;
                if ptr.is_null() || len == 0 {
                    Value::Blob(Vec::new())
                } else {
                    Value::Blob(std::slice::from_raw_parts(ptr, len).to_vec())
                }
            }
            _ => {
                let ptr = sqlite3_column_text(statement, index);
                let len = sqlite3_column_bytes(statement, index) as usize;
                if ptr.is_null() {
                    Value::Text(String::new())
                } else {
                    Value::Text(
                        String::from_utf8_lossy(std::slice::from_raw_parts(ptr, len)).into_owned(),
                    )
                }
            }
        }
    }
}

pub(crate) fn column_name(statement: *mut sqlite3_stmt, index: c_int) -> String {
    unsafe {
        let name = sqlite3_column_name(statement, index);
        if name.is_null() {
            String::new()
        } else {
            CStr::from_ptr(name).to_string_lossy().into_owned()
        }
    }
}

pub(crate) fn error_message(db: *mut sqlite3) -> String {
    unsafe {
        if db.is_null() {
            return "unknown error (no database handle)".into();
        }
        let message = sqlite3_errmsg(db);
        if message.is_null() {
            "unknown error (could not extract the error message)".into()
        } else {
            CStr::from_ptr(message).to_string_lossy().into_owned()
        }
    }
}
