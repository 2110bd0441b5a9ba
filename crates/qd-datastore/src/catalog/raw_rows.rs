//! Column-name keyed row access, used when copying rows between catalogs
//! whose schemas may differ by additively evolved columns.

use std::collections::BTreeMap;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};

use crate::catalog::migration::table_columns;
use crate::error::Result;

pub type RowValues = BTreeMap<String, Value>;

/// Reads the row of `table` where `key_column = key`, keyed by column name.
pub fn select_row(conn: &Connection, table: &str, key_column: &str, key: i64) -> Result<Option<RowValues>> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {} WHERE {} = ?1", table, key_column))?;
    let names: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let row = stmt
        .query_row([key], |row| {
            let mut values = RowValues::new();
            for (idx, name) in names.iter().enumerate() {
                values.insert(name.clone(), row.get::<_, Value>(idx)?);
            }
            Ok(values)
        })
        .optional()?;
    Ok(row)
}

/// Splits `values` into the columns `table` has and the names it lacks.
pub fn partition_columns(conn: &Connection, table: &str, values: RowValues) -> Result<(RowValues, Vec<String>)> {
    let existing = table_columns(conn, table)?;
    let mut kept = RowValues::new();
    let mut missing = Vec::new();
    for (name, value) in values {
        if existing.iter().any(|c| c == &name) {
            kept.insert(name, value);
        } else {
            missing.push(name);
        }
    }
    Ok((kept, missing))
}

pub fn insert_row(conn: &Connection, table: &str, values: &RowValues) -> Result<()> {
    let columns: Vec<&str> = values.keys().map(String::as_str).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    conn.execute(
        &format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders.join(", ")
        ),
        params_from_iter(values.values()),
    )?;
    Ok(())
}

pub fn update_row(conn: &Connection, table: &str, key_column: &str, key: i64, values: &RowValues) -> Result<usize> {
    if values.is_empty() {
        return Ok(0);
    }
    let sets: Vec<String> = values
        .keys()
        .enumerate()
        .map(|(i, name)| format!("{} = ?{}", name, i + 1))
        .collect();
    let mut params: Vec<Value> = values.values().cloned().collect();
    params.push(Value::Integer(key));
    let changed = conn.execute(
        &format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            table,
            sets.join(", "),
            key_column,
            params.len()
        ),
        params_from_iter(params.iter()),
    )?;
    Ok(changed)
}

/// Entries of `wanted` whose value differs from `current` (or is absent there).
pub fn diff(current: &RowValues, wanted: &RowValues) -> RowValues {
    wanted
        .iter()
        .filter(|(name, value)| current.get(*name) != Some(*value))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Interprets an integer-like SQL value as a flag.
pub fn as_bool(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Integer(i)) => *i != 0,
        Some(Value::Real(f)) => *f != 0.0,
        Some(Value::Text(t)) => matches!(t.as_str(), "1" | "true" | "t"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_with(sql: &str) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(sql).unwrap();
        conn
    }

    #[test]
    fn test_select_and_partition() {
        let src = conn_with(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, uuid INTEGER, name TEXT, extra INTEGER);
             INSERT INTO t (uuid, name, extra) VALUES (42, 'ramsey', 7);",
        );
        let dst = conn_with("CREATE TABLE t (id INTEGER PRIMARY KEY, uuid INTEGER, name TEXT);");

        let mut row = select_row(&src, "t", "uuid", 42).unwrap().unwrap();
        row.remove("id");
        let (kept, missing) = partition_columns(&dst, "t", row).unwrap();
        assert_eq!(missing, vec!["extra".to_string()]);

        insert_row(&dst, "t", &kept).unwrap();
        let copied = select_row(&dst, "t", "uuid", 42).unwrap().unwrap();
        assert_eq!(copied.get("name"), Some(&Value::Text("ramsey".into())));
    }

    #[test]
    fn test_diff_and_update() {
        let conn = conn_with(
            "CREATE TABLE t (uuid INTEGER, name TEXT, starred INTEGER);
             INSERT INTO t VALUES (1, 'a', 0);",
        );
        let current = select_row(&conn, "t", "uuid", 1).unwrap().unwrap();
        let mut wanted = current.clone();
        wanted.insert("starred".into(), Value::Integer(1));
        let changes = diff(&current, &wanted);
        assert_eq!(changes.len(), 1);
        assert_eq!(update_row(&conn, "t", "uuid", 1, &changes).unwrap(), 1);
        let after = select_row(&conn, "t", "uuid", 1).unwrap().unwrap();
        assert!(as_bool(after.get("starred")));
        assert!(select_row(&conn, "t", "uuid", 2).unwrap().is_none());
    }
}
