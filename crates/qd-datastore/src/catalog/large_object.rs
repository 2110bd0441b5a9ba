//! Paged large-object storage.
//!
//! A large object is addressed by an integer handle (`loid`) and stored as
//! fixed-size pages in `lob_pages`; its logical length lives in
//! `lob_metadata`. Pages that were never written read back as zeros, the same
//! as holes in a server-side large object.

use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::error::{Error, Result};

pub const PAGE_SIZE: usize = 8192;

#[derive(Clone)]
pub struct LargeObjectStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl LargeObjectStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub(crate) fn connection(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.get_conn()
    }

    pub fn create(&self) -> Result<i64> {
        let conn = self.get_conn()?;
        lo_create(&conn)
    }

    pub fn write_at(&self, loid: i64, offset: u64, data: &[u8]) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        lo_write(&tx, loid, offset, data)?;
        tx.commit()?;
        Ok(())
    }

    pub fn read_at(&self, loid: i64, offset: u64, len: usize) -> Result<Vec<u8>> {
        let conn = self.get_conn()?;
        lo_read(&conn, loid, offset, len)
    }

    pub fn size(&self, loid: i64) -> Result<u64> {
        let conn = self.get_conn()?;
        lo_size(&conn, loid)
    }

    pub fn exists(&self, loid: i64) -> Result<bool> {
        let conn = self.get_conn()?;
        match lo_size(&conn, loid) {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn unlink(&self, loid: i64) -> Result<()> {
        let conn = self.get_conn()?;
        lo_unlink(&conn, loid)
    }
}

pub(crate) fn lo_create(conn: &Connection) -> Result<i64> {
    conn.execute("INSERT INTO lob_metadata (size) VALUES (0)", [])?;
    let loid = conn.last_insert_rowid();
    debug!("Created large object {}", loid);
    Ok(loid)
}

pub(crate) fn lo_size(conn: &Connection, loid: i64) -> Result<u64> {
    let size: Option<i64> = conn
        .query_row("SELECT size FROM lob_metadata WHERE loid = ?1", [loid], |row| row.get(0))
        .optional()?;
    size.map(|s| s as u64)
        .ok_or_else(|| Error::NotFound(format!("large object {}", loid)))
}

/// Writes `data` at `offset`, extending the object when needed.
pub(crate) fn lo_write(conn: &Connection, loid: i64, offset: u64, data: &[u8]) -> Result<()> {
    let size = lo_size(conn, loid)?;
    if data.is_empty() {
        return Ok(());
    }
    let end = offset + data.len() as u64;
    let first_page = offset / PAGE_SIZE as u64;
    let last_page = (end - 1) / PAGE_SIZE as u64;

    let mut select = conn.prepare_cached("SELECT data FROM lob_pages WHERE loid = ?1 AND pageno = ?2")?;
    let mut upsert = conn.prepare_cached(
        "INSERT INTO lob_pages (loid, pageno, data) VALUES (?1, ?2, ?3)
         ON CONFLICT(loid, pageno) DO UPDATE SET data = excluded.data",
    )?;

    for pageno in first_page..=last_page {
        let page_start = pageno * PAGE_SIZE as u64;
        let write_from = offset.max(page_start);
        let write_to = end.min(page_start + PAGE_SIZE as u64);
        let in_page_from = (write_from - page_start) as usize;
        let in_page_to = (write_to - page_start) as usize;

        let mut page: Vec<u8> = if in_page_from == 0 && in_page_to == PAGE_SIZE {
            Vec::with_capacity(PAGE_SIZE)
        } else {
            select
                .query_row(params![loid, pageno as i64], |row| row.get(0))
                .optional()?
                .unwrap_or_default()
        };
        if page.len() < in_page_to {
            page.resize(in_page_to, 0);
        }
        let src_from = (write_from - offset) as usize;
        let src_to = (write_to - offset) as usize;
        page[in_page_from..in_page_to].copy_from_slice(&data[src_from..src_to]);
        upsert.execute(params![loid, pageno as i64, page])?;
    }

    if end > size {
        conn.execute(
            "UPDATE lob_metadata SET size = ?2 WHERE loid = ?1",
            params![loid, end as i64],
        )?;
    }
    Ok(())
}

/// Reads up to `len` bytes from `offset`; the result is clipped to the object size.
pub(crate) fn lo_read(conn: &Connection, loid: i64, offset: u64, len: usize) -> Result<Vec<u8>> {
    let size = lo_size(conn, loid)?;
    if offset >= size || len == 0 {
        return Ok(Vec::new());
    }
    let end = size.min(offset + len as u64);
    let mut out = vec![0u8; (end - offset) as usize];
    let first_page = offset / PAGE_SIZE as u64;
    let last_page = (end - 1) / PAGE_SIZE as u64;

    let mut stmt = conn.prepare_cached(
        "SELECT pageno, data FROM lob_pages
         WHERE loid = ?1 AND pageno BETWEEN ?2 AND ?3 ORDER BY pageno",
    )?;
    let mut rows = stmt.query(params![loid, first_page as i64, last_page as i64])?;
    while let Some(row) = rows.next()? {
        let pageno: i64 = row.get(0)?;
        let page: Vec<u8> = row.get(1)?;
        let page_start = pageno as u64 * PAGE_SIZE as u64;
        let copy_from = offset.max(page_start);
        let copy_to = end.min(page_start + page.len() as u64);
        if copy_to <= copy_from {
            continue;
        }
        let src = (copy_from - page_start) as usize..(copy_to - page_start) as usize;
        let dst = (copy_from - offset) as usize..(copy_to - offset) as usize;
        out[dst].copy_from_slice(&page[src]);
    }
    Ok(out)
}

pub(crate) fn lo_unlink(conn: &Connection, loid: i64) -> Result<()> {
    conn.execute("DELETE FROM lob_pages WHERE loid = ?1", [loid])?;
    let removed = conn.execute("DELETE FROM lob_metadata WHERE loid = ?1", [loid])?;
    if removed == 0 {
        return Err(Error::NotFound(format!("large object {}", loid)));
    }
    debug!("Unlinked large object {}", loid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::migration::MigrationManager;
    use proptest::prelude::*;

    fn test_conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();
        conn
    }

    // ===== Basic operations =====

    #[test]
    fn test_create_is_empty() {
        let conn = test_conn();
        let loid = lo_create(&conn).unwrap();
        assert_eq!(lo_size(&conn, loid).unwrap(), 0);
        assert!(lo_read(&conn, loid, 0, 100).unwrap().is_empty());
    }

    #[test]
    fn test_write_across_pages() {
        let conn = test_conn();
        let loid = lo_create(&conn).unwrap();
        let data: Vec<u8> = (0..(PAGE_SIZE * 2 + 100)).map(|i| (i % 251) as u8).collect();
        lo_write(&conn, loid, 50, &data).unwrap();
        assert_eq!(lo_size(&conn, loid).unwrap(), 50 + data.len() as u64);
        let back = lo_read(&conn, loid, 50, data.len()).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_holes_read_as_zero() {
        let conn = test_conn();
        let loid = lo_create(&conn).unwrap();
        lo_write(&conn, loid, (PAGE_SIZE * 3) as u64, &[7, 7]).unwrap();
        let back = lo_read(&conn, loid, 0, PAGE_SIZE * 3 + 2).unwrap();
        assert_eq!(back.len(), PAGE_SIZE * 3 + 2);
        assert!(back[..PAGE_SIZE * 3].iter().all(|b| *b == 0));
        assert_eq!(&back[PAGE_SIZE * 3..], &[7, 7]);
    }

    #[test]
    fn test_read_is_clipped() {
        let conn = test_conn();
        let loid = lo_create(&conn).unwrap();
        lo_write(&conn, loid, 0, &[1, 2, 3]).unwrap();
        assert_eq!(lo_read(&conn, loid, 1, 100).unwrap(), vec![2, 3]);
        assert!(lo_read(&conn, loid, 3, 100).unwrap().is_empty());
    }

    #[test]
    fn test_unlink() {
        let conn = test_conn();
        let loid = lo_create(&conn).unwrap();
        lo_write(&conn, loid, 0, &[1; 10]).unwrap();
        lo_unlink(&conn, loid).unwrap();
        assert!(matches!(lo_size(&conn, loid), Err(Error::NotFound(_))));
        assert!(lo_unlink(&conn, loid).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_random_writes_match_model(
            writes in proptest::collection::vec((0u64..40_000, proptest::collection::vec(any::<u8>(), 1..9000)), 1..6)
        ) {
            let conn = test_conn();
            let loid = lo_create(&conn).unwrap();
            let mut model: Vec<u8> = Vec::new();
            for (offset, data) in &writes {
                lo_write(&conn, loid, *offset, data).unwrap();
                let end = *offset as usize + data.len();
                if model.len() < end {
                    model.resize(end, 0);
                }
                model[*offset as usize..end].copy_from_slice(data);
            }
            prop_assert_eq!(lo_size(&conn, loid).unwrap(), model.len() as u64);
            prop_assert_eq!(lo_read(&conn, loid, 0, model.len()).unwrap(), model);
        }
    }
}
