//! Additive schema migrations for the catalog.

use rusqlite::{Connection, OptionalExtension, Result};
use tracing::{error, info, warn};

use crate::catalog::schema::{self, CatalogStats};

/// Latest schema version known to this build.
pub const CURRENT_VERSION: i32 = 2;

/// Manages catalog schema migrations
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Bring the schema up to the current version.
    pub fn initialize_database(&mut self) -> Result<i32> {
        self.initialize_to(CURRENT_VERSION)
    }

    /// Bring the schema up to `target`. Lower targets emulate older peers.
    pub fn initialize_to(&mut self, target: i32) -> Result<i32> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version = self.get_current_version()?;
        info!("Current catalog schema version: {}", current_version);

        self.apply_migrations(current_version, target)?;
        self.get_current_version()
    }

    fn apply_migrations(&mut self, current_version: i32, target: i32) -> Result<()> {
        for (version, migration_sql) in get_migrations() {
            if version <= current_version || version > target {
                continue;
            }
            info!("Applying catalog migration {}...", version);
            let tx = self.conn.transaction()?;
            if let Err(e) = tx.execute_batch(migration_sql) {
                error!("Failed to apply migration {}: {}", version, e);
                return Err(e);
            }
            tx.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
            tx.commit()?;
            info!("Migration {} applied successfully", version);
        }
        Ok(())
    }

    pub fn get_current_version(&self) -> Result<i32> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .or_else(|_| Ok(0))
    }

    pub fn has_migration_applied(&self, version: i32) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM schema_version WHERE version = ?",
                [version],
                |_| Ok(1),
            )
            .optional()
            .map(|result| result.is_some())
    }
}

fn get_migrations() -> Vec<(i32, &'static str)> {
    vec![
        (1, include_str!("migrations/001_initial.sql")),
        (2, include_str!("migrations/002_update_counter.sql")),
    ]
}

/// Column names of `table`, in declaration order. Empty if the table is missing.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let names = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>>>()?;
    Ok(names)
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

/// Read-only statistics over one catalog connection.
pub fn get_catalog_stats(conn: &Connection) -> Result<CatalogStats> {
    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap_or_else(|e| {
            warn!("Catalog statistics query failed ({}): {}", sql, e);
            0
        })
    }

    let schema_version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))
        .unwrap_or(0);
    let overview = schema::OVERVIEW_TABLE;

    Ok(CatalogStats {
        schema_version,
        total_datasets: count(conn, &format!("SELECT COUNT(*) FROM {}", overview)),
        running_datasets: count(
            conn,
            &format!("SELECT COUNT(*) FROM {} WHERE completed = 0 AND stop_time IS NULL", overview),
        ),
        pending_table_sync: count(
            conn,
            &format!("SELECT COUNT(*) FROM {} WHERE table_synchronized = 0", overview),
        ),
        pending_data_sync: count(
            conn,
            &format!("SELECT COUNT(*) FROM {} WHERE data_synchronized = 0", overview),
        ),
        total_blobs: count(conn, "SELECT COUNT(*) FROM lob_metadata"),
        blob_bytes: count(conn, "SELECT COALESCE(SUM(size), 0) FROM lob_metadata"),
        database_size_bytes: conn
            .query_row(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0),
    })
}

/// Refreshes planner statistics and reclaims up to 100 free pages.
pub fn run_maintenance(conn: &mut Connection) -> Result<()> {
    info!("Running catalog maintenance...");
    conn.execute_batch("ANALYZE")?;
    conn.execute_batch("PRAGMA incremental_vacuum(100)")?;
    info!("Catalog maintenance completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_migration_adds_update_counter() {
        let mut conn = Connection::open_in_memory().unwrap();
        let version = MigrationManager::new(&mut conn).initialize_database().unwrap();
        assert_eq!(version, CURRENT_VERSION);
        let columns = table_columns(&conn, schema::OVERVIEW_TABLE).unwrap();
        assert!(columns.iter().any(|c| c == "data_update_count"));
    }

    #[test]
    fn test_partial_migration_emulates_older_peer() {
        let mut conn = Connection::open_in_memory().unwrap();
        let version = MigrationManager::new(&mut conn).initialize_to(1).unwrap();
        assert_eq!(version, 1);
        let columns = table_columns(&conn, schema::OVERVIEW_TABLE).unwrap();
        assert!(!columns.iter().any(|c| c == "data_update_count"));

        // upgrading later is additive
        let version = MigrationManager::new(&mut conn).initialize_database().unwrap();
        assert_eq!(version, 2);
        assert!(MigrationManager::new(&mut conn).has_migration_applied(2).unwrap());
    }

    #[test]
    fn test_table_helpers() {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();
        assert!(table_exists(&conn, schema::PARAMETER_TABLE).unwrap());
        assert!(!table_exists(&conn, "missing_table").unwrap());
        assert!(table_columns(&conn, "missing_table").unwrap().is_empty());
        let stats = get_catalog_stats(&conn).unwrap();
        assert_eq!(stats.total_datasets, 0);
        assert_eq!(stats.schema_version, 2);
    }
}
