//! Read-only query capability over the SQLite sales database.
//!
//! Query failures never escape [`QueryStore::execute`]: the model gets a
//! structured `{error, query}` payload back and can revise its SQL.

use std::path::{Path, PathBuf};

use base64::Engine;
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use salesbridge_core::error::{Result, SalesBridgeError};

/// Shared handle to the sales database.
///
/// The connection is opened read-only and guarded by a mutex, so one store
/// can serve every session concurrently.
pub struct QueryStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

/// Table name and `"name: TYPE"` column descriptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub table_name: String,
    pub column_names: Vec<String>,
}

/// Machine-readable result table: column order preserved, rows in the
/// query's natural order, BLOBs base64 encoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub data: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Rows(usize),
    Empty,
    Error,
}

/// Output of one query: what the user sees and what the model receives.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub display_format: String,
    pub json_format: String,
    pub status: QueryStatus,
}

impl QueryResult {
    pub fn rows(query: &str, table: &Table) -> Self {
        Self {
            display_format: format!("Query: {query}\n\n{}", render_table(table)),
            json_format: table_json(query, table),
            status: QueryStatus::Rows(table.data.len()),
        }
    }

    pub fn empty(query: &str, table: &Table) -> Self {
        Self {
            display_format: format!("Query: {query}\n\nThe query returned no results."),
            json_format: table_json(query, table),
            status: QueryStatus::Empty,
        }
    }

    pub fn error(query: &str, message: &str) -> Self {
        Self {
            display_format: format!("Query: {query}\n\nquery failed with error: {message}"),
            json_format: json!({ "error": message, "query": query }).to_string(),
            status: QueryStatus::Error,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }
}

fn table_json(query: &str, table: &Table) -> String {
    serde_json::to_string(table)
        .unwrap_or_else(|e| json!({ "error": e.to_string(), "query": query }).to_string())
}

impl QueryStore {
    /// Open the database at `path` read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
                | OpenFlags::SQLITE_OPEN_URI,
        )
        .map_err(|e| SalesBridgeError::Database(format!("cannot open {}: {e}", path.display())))?;

        info!(path = %path.display(), "Opened sales database");
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// User tables and their columns, skipping SQLite bookkeeping tables.
    pub fn tables(&self) -> Result<Vec<TableInfo>> {
        let conn = self.conn.lock();
        let db_err = |e: rusqlite::Error| SalesBridgeError::Database(e.to_string());

        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY rowid")
            .map_err(db_err)?;
        let names: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .map_err(db_err)?
            .collect::<std::result::Result<_, _>>()
            .map_err(db_err)?;

        let mut column_stmt = conn
            .prepare("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid")
            .map_err(db_err)?;

        let mut tables = Vec::new();
        for table_name in names.into_iter().filter(|n| n != "sqlite_sequence") {
            let column_names = column_stmt
                .query_map([&table_name], |row| {
                    let name: String = row.get(0)?;
                    let decl: String = row.get(1)?;
                    Ok(format!("{name}: {decl}"))
                })
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;
            tables.push(TableInfo {
                table_name,
                column_names,
            });
        }
        Ok(tables)
    }

    /// Schema as a JSON list, embedded in the assistant's instructions and
    /// in the query tool's parameter description.
    pub fn schema_description(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.tables()?)?)
    }

    /// Run an untrusted query. Never fails; errors become a result.
    pub fn execute(&self, query: &str) -> QueryResult {
        if query.trim().is_empty() {
            return QueryResult::error(query, "empty query");
        }

        match self.run_query(query) {
            Ok(table) if table.data.is_empty() => {
                debug!("Query returned no rows");
                QueryResult::empty(query, &table)
            }
            Ok(table) => {
                debug!(rows = table.data.len(), "Query returned rows");
                QueryResult::rows(query, &table)
            }
            Err(e) => {
                warn!(error = %e, "Query failed");
                QueryResult::error(query, &e.to_string())
            }
        }
    }

    fn run_query(&self, query: &str) -> rusqlite::Result<Table> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(query)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();

        let mut rows = stmt.query([])?;
        let mut data = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                values.push(value_to_json(row.get_ref(idx)?));
            }
            data.push(values);
        }

        Ok(Table { columns, data })
    }
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(base64::engine::general_purpose::STANDARD.encode(b)),
    }
}

/// Text of one cell as it appears in the rendered table.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render rows as a right-aligned plain-text table with a header line.
pub fn render_table(table: &Table) -> String {
    let cells: Vec<Vec<String>> = table
        .data
        .iter()
        .map(|row| row.iter().map(cell_text).collect())
        .collect();

    let widths: Vec<usize> = table
        .columns
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            cells
                .iter()
                .filter_map(|row| row.get(idx))
                .map(|c| c.chars().count())
                .chain(std::iter::once(name.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let format_line = |values: &[String]| -> String {
        values
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!("{v:>w$}"))
            .collect::<Vec<_>>()
            .join("  ")
    };

    let mut lines = Vec::with_capacity(cells.len() + 1);
    lines.push(format_line(&table.columns));
    for row in &cells {
        lines.push(format_line(row));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, QueryStore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sales.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE sales_data (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                region TEXT,
                product_type TEXT,
                revenue REAL,
                month INTEGER,
                badge BLOB
            );
            INSERT INTO sales_data (region, product_type, revenue, month, badge) VALUES
                ('EUROPE', 'Skis', 100.5, 1, x'0102'),
                ('EUROPE', 'Boots', 50.0, 2, NULL),
                ('ASIA-PACIFIC', 'Skis', 75.25, 1, NULL),
                ('AFRICA', 'Tents', 20.0, 3, NULL);",
        )
        .unwrap();
        drop(conn);
        let store = QueryStore::open(&path).unwrap();
        (dir, store)
    }

    #[test]
    fn test_schema_description() {
        let (_dir, store) = fixture();
        let tables = store.tables().unwrap();
        assert_eq!(tables.len(), 1, "sqlite_sequence must be skipped");
        assert_eq!(tables[0].table_name, "sales_data");
        assert_eq!(tables[0].column_names[1], "region: TEXT");
        assert_eq!(tables[0].column_names[3], "revenue: REAL");

        let schema = store.schema_description().unwrap();
        let parsed: Vec<TableInfo> = serde_json::from_str(&schema).unwrap();
        assert_eq!(parsed, tables);
    }

    #[test]
    fn test_group_by_region() {
        let (_dir, store) = fixture();
        let query = "SELECT region, SUM(revenue) AS revenue FROM sales_data GROUP BY region ORDER BY region";
        let result = store.execute(query);

        assert_eq!(result.status, QueryStatus::Rows(3));
        assert!(result.display_format.starts_with(&format!("Query: {query}\n\n")));

        let table: Table = serde_json::from_str(&result.json_format).unwrap();
        assert_eq!(table.columns, vec!["region", "revenue"]);
        assert_eq!(table.data[0], vec![json!("AFRICA"), json!(20.0)]);
        assert_eq!(table.data[1], vec![json!("ASIA-PACIFIC"), json!(75.25)]);
        assert_eq!(table.data[2], vec![json!("EUROPE"), json!(150.5)]);
    }

    #[test]
    fn test_json_matches_display() {
        let (_dir, store) = fixture();
        let result = store.execute("SELECT region, product_type, revenue, month FROM sales_data");
        let table: Table = serde_json::from_str(&result.json_format).unwrap();

        let body = result.display_format.split("\n\n").nth(1).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), table.data.len() + 1);
        for name in &table.columns {
            assert!(lines[0].contains(name.as_str()));
        }
        for (line, row) in lines[1..].iter().zip(&table.data) {
            let rendered: Vec<&str> = line.split_whitespace().collect();
            let expected: Vec<String> = row.iter().map(cell_text).collect();
            assert_eq!(rendered, expected);
        }
    }

    #[test]
    fn test_empty_result() {
        let (_dir, store) = fixture();
        let result = store.execute("SELECT region FROM sales_data WHERE region = 'ANTARCTICA'");
        assert_eq!(result.status, QueryStatus::Empty);
        assert!(result.display_format.contains("The query returned no results"));

        let table: Table = serde_json::from_str(&result.json_format).unwrap();
        assert_eq!(table.columns, vec!["region"]);
        assert!(table.data.is_empty());
    }

    #[test]
    fn test_malformed_query() {
        let (_dir, store) = fixture();
        let query = "SELEC region FROM nowhere";
        let result = store.execute(query);
        assert!(result.is_error());
        assert!(result.display_format.contains(query));
        assert!(result.display_format.contains("query failed with error"));

        let payload: Value = serde_json::from_str(&result.json_format).unwrap();
        assert_eq!(payload["query"], query);
        assert!(payload["error"].as_str().unwrap().contains("syntax error"));
    }

    #[test]
    fn test_missing_table_and_empty_query() {
        let (_dir, store) = fixture();
        let result = store.execute("SELECT * FROM customers");
        assert!(result.is_error());
        assert!(result.json_format.contains("no such table"));

        let result = store.execute("   ");
        assert!(result.is_error());
        assert!(serde_json::from_str::<Value>(&result.json_format).is_ok());
    }

    #[test]
    fn test_writes_are_rejected() {
        let (_dir, store) = fixture();
        let result = store.execute("DELETE FROM sales_data");
        assert!(result.is_error());

        let count = store.execute("SELECT COUNT(*) AS n FROM sales_data");
        let table: Table = serde_json::from_str(&count.json_format).unwrap();
        assert_eq!(table.data[0][0], json!(4));
    }

    #[test]
    fn test_blob_and_null_cells() {
        let (_dir, store) = fixture();
        let result = store.execute("SELECT badge FROM sales_data WHERE month = 1 ORDER BY id");
        let table: Table = serde_json::from_str(&result.json_format).unwrap();
        assert_eq!(table.data[0][0], json!("AQI="));
        assert_eq!(table.data[1][0], Value::Null);
        assert!(result.display_format.contains("NULL"));
    }
}
