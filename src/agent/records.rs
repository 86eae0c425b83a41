use crate::models::ToolInvocationRecord;
use anyhow::{bail, Context, Result};
use rusqlite::types::ToSqlOutput;
use rusqlite::{params_from_iter, Connection, ToSql};
use serde_json::{json, Map, Value};
use std::path::Path;

const LOOKUP_ROW_CAP: usize = 10;

/// Guard for table/column identifiers that end up inside SQL text. Handler
/// configuration comes from the tenant catalog, not from model output, but
/// identifiers still never get interpolated unvalidated.
fn valid_ident(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .enumerate()
            .all(|(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()))
}

fn check_ident(name: &str) -> Result<&str> {
    if !valid_ident(name) {
        bail!("Invalid identifier: {:?}", name);
    }
    Ok(name)
}

/// JSON value → SQL parameter. Compound values are stored as JSON text.
struct SqlJson<'a>(&'a Value);

impl ToSql for SqlJson<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self.0 {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Bool(b) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(i64::from(*b))),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ToSqlOutput::Owned(rusqlite::types::Value::Integer(i))
                } else {
                    ToSqlOutput::Owned(rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0)))
                }
            }
            Value::String(s) => ToSqlOutput::Owned(rusqlite::types::Value::Text(s.clone())),
            other => ToSqlOutput::Owned(rusqlite::types::Value::Text(other.to_string())),
        })
    }
}

fn column_to_json(row: &rusqlite::Row<'_>, idx: usize) -> Value {
    use rusqlite::types::ValueRef;
    match row.get_ref(idx) {
        Ok(ValueRef::Null) => Value::Null,
        Ok(ValueRef::Integer(i)) => json!(i),
        Ok(ValueRef::Real(f)) => json!(f),
        Ok(ValueRef::Text(t)) => json!(String::from_utf8_lossy(t)),
        Ok(ValueRef::Blob(_)) | Err(_) => Value::Null,
    }
}

/// Tenant business-record surface used exclusively by the Tool Dispatcher's
/// direct-datastore handler. Each call is its own atomic unit; there is no
/// cross-tool transaction.
pub struct RecordStore {
    conn: std::sync::Mutex<Connection>,
}

impl RecordStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database parent directory: {}", parent.display())
            })?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at: {}", db_path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;",
        )?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: std::sync::Mutex::new(Connection::open_in_memory()?),
        })
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.conn.lock().expect("record store lock poisoned");
        conn.execute_batch(sql)?;
        Ok(())
    }

    /// Insert one row built from `fields`. Returns the touched columns and
    /// the new rowid.
    pub fn insert(&self, table: &str, fields: &Map<String, Value>) -> Result<(Value, Vec<String>)> {
        if fields.is_empty() {
            bail!("Insert into {} has no fields", table);
        }
        let table = check_ident(table)?;
        let mut columns = Vec::with_capacity(fields.len());
        let mut params: Vec<SqlJson<'_>> = Vec::with_capacity(fields.len());
        for (name, value) in fields {
            columns.push(check_ident(name)?.to_string());
            params.push(SqlJson(value));
        }
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders
        );

        let conn = self.conn.lock().expect("record store lock poisoned");
        conn.execute(&sql, params_from_iter(params.iter()))
            .with_context(|| format!("Insert into {} failed", table))?;
        let rowid = conn.last_insert_rowid();
        Ok((json!({"inserted": true, "id": rowid}), columns))
    }

    /// Update rows matching `filters`, setting `changes`. Returns the touched
    /// columns and the affected-row count.
    pub fn update(
        &self,
        table: &str,
        filters: &Map<String, Value>,
        changes: &Map<String, Value>,
    ) -> Result<(Value, Vec<String>)> {
        if filters.is_empty() {
            bail!("Update on {} has no filter fields", table);
        }
        if changes.is_empty() {
            bail!("Update on {} has no changes", table);
        }
        let table = check_ident(table)?;

        let mut set_clauses = Vec::with_capacity(changes.len());
        let mut touched = Vec::with_capacity(changes.len());
        let mut params: Vec<SqlJson<'_>> = Vec::new();
        for (name, value) in changes {
            let name = check_ident(name)?;
            set_clauses.push(format!("{} = ?", name));
            touched.push(name.to_string());
            params.push(SqlJson(value));
        }
        let mut where_clauses = Vec::with_capacity(filters.len());
        for (name, value) in filters {
            where_clauses.push(format!("{} = ?", check_ident(name)?));
            params.push(SqlJson(value));
        }
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            table,
            set_clauses.join(", "),
            where_clauses.join(" AND ")
        );

        let conn = self.conn.lock().expect("record store lock poisoned");
        let affected = conn
            .execute(&sql, params_from_iter(params.iter()))
            .with_context(|| format!("Update on {} failed", table))?;
        Ok((json!({"updated": affected}), touched))
    }

    /// Fetch rows matching `filters`, capped at a small fixed count.
    pub fn lookup(&self, table: &str, filters: &Map<String, Value>) -> Result<Value> {
        let table = check_ident(table)?;
        let mut params: Vec<SqlJson<'_>> = Vec::new();
        let sql = if filters.is_empty() {
            format!("SELECT * FROM {} LIMIT {}", table, LOOKUP_ROW_CAP)
        } else {
            let mut where_clauses = Vec::with_capacity(filters.len());
            for (name, value) in filters {
                where_clauses.push(format!("{} = ?", check_ident(name)?));
                params.push(SqlJson(value));
            }
            format!(
                "SELECT * FROM {} WHERE {} LIMIT {}",
                table,
                where_clauses.join(" AND "),
                LOOKUP_ROW_CAP
            )
        };

        let conn = self.conn.lock().expect("record store lock poisoned");
        let mut stmt = conn
            .prepare(&sql)
            .with_context(|| format!("Lookup on {} failed", table))?;
        let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;

        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            let mut obj = Map::new();
            for (idx, name) in column_names.iter().enumerate() {
                obj.insert(name.clone(), column_to_json(row, idx));
            }
            results.push(Value::Object(obj));
        }
        Ok(json!({"rows": results}))
    }
}

/// Append-only audit sink for tool invocations. Modeled as an explicit
/// side-channel: a sink outage must be structurally incapable of affecting
/// the dispatcher's returned result, so callers log and swallow errors from
/// `append`.
pub trait InvocationLog: Send + Sync {
    fn append(&self, record: &ToolInvocationRecord) -> Result<()>;
}

/// Invocation log backed by the same SQLite file as the record store.
pub struct SqliteInvocationLog {
    conn: std::sync::Mutex<Connection>,
}

impl SqliteInvocationLog {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).with_context(|| {
            format!(
                "Failed to open invocation log at: {}",
                db_path.as_ref().display()
            )
        })?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=3000;",
        )?;
        let log = Self {
            conn: std::sync::Mutex::new(conn),
        };
        log.ensure_schema()?;
        Ok(log)
    }

    pub fn open_in_memory() -> Result<Self> {
        let log = Self {
            conn: std::sync::Mutex::new(Connection::open_in_memory()?),
        };
        log.ensure_schema()?;
        Ok(log)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("invocation log lock poisoned");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tool_invocations (
                id TEXT PRIMARY KEY,
                tool_key TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                arguments TEXT NOT NULL,
                success INTEGER NOT NULL,
                result TEXT,
                error TEXT,
                touched_columns TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tool_invocations_conversation
                ON tool_invocations(conversation_id);",
        )?;
        Ok(())
    }

    pub fn count_for_conversation(&self, conversation_id: &str) -> Result<i64> {
        let conn = self.conn.lock().expect("invocation log lock poisoned");
        let count = conn.query_row(
            "SELECT COUNT(*) FROM tool_invocations WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

impl InvocationLog for SqliteInvocationLog {
    fn append(&self, record: &ToolInvocationRecord) -> Result<()> {
        let conn = self.conn.lock().expect("invocation log lock poisoned");
        conn.execute(
            "INSERT INTO tool_invocations
                (id, tool_key, conversation_id, arguments, success, result, error, touched_columns, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                record.id,
                record.tool_key,
                record.conversation_id,
                record.arguments.to_string(),
                record.success,
                record.result.as_ref().map(|v| v.to_string()),
                record.error,
                serde_json::to_string(&record.touched_columns)?,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}
