//! Synchronous SQL execution seam and its rusqlite implementation.
//!
//! The SQL block VFS only needs `exec(sql, params) -> rows`; keeping that
//! behind a trait keeps the VFS testable against any embedded engine that
//! persists durably on statement return.

use thiserror::Error;

#[derive(Debug, Error)]
#[error("sql backend: {0}")]
pub struct SqlExecError(pub String);

impl From<rusqlite::Error> for SqlExecError {
    fn from(e: rusqlite::Error) -> Self {
        SqlExecError(e.to_string())
    }
}

/// Parameter/result value for `SqlExec`.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            SqlValue::Blob(v) => Some(v),
            _ => None,
        }
    }
}

/// Synchronous SQL backend: each statement is durable once `exec` returns.
pub trait SqlExec {
    fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>, SqlExecError>;
}

/// `SqlExec` over an in-process rusqlite connection.
pub struct RusqliteBackend {
    conn: rusqlite::Connection,
}

impl RusqliteBackend {
    /// Wrap an existing connection, enabling cascading foreign keys.
    pub fn new(conn: rusqlite::Connection) -> Result<Self, SqlExecError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, SqlExecError> {
        Ok(Self::new(rusqlite::Connection::open_in_memory()?)?)
    }

    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self, SqlExecError> {
        Ok(Self::new(rusqlite::Connection::open(path)?)?)
    }
}

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, ValueRef};
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            SqlValue::Integer(v) => ToSqlOutput::Borrowed(ValueRef::Integer(*v)),
            SqlValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            SqlValue::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
        })
    }
}

impl SqlExec for RusqliteBackend {
    fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>, SqlExecError> {
        let mut stmt = self.conn.prepare(sql)?;
        let col_count = stmt.column_count();
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut vals = Vec::with_capacity(col_count);
            for i in 0..col_count {
                use rusqlite::types::ValueRef;
                vals.push(match row.get_ref(i)? {
                    ValueRef::Null => SqlValue::Null,
                    ValueRef::Integer(v) => SqlValue::Integer(v),
                    ValueRef::Real(v) => SqlValue::Integer(v as i64),
                    ValueRef::Text(v) => {
                        SqlValue::Text(String::from_utf8_lossy(v).into_owned())
                    }
                    ValueRef::Blob(v) => SqlValue::Blob(v.to_vec()),
                });
            }
            out.push(vals);
        }
        Ok(out)
    }
}
