//! Persistent tree backing: two tables (directories, files), prepared parameterized access,
//! reconnect-on-failure, and a dry-run gate that short-circuits mutations to synthetic success.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub struct DirRecord {
    pub id: u32,
    pub parent: u32,
    pub name: String,
    pub size: u64,
    pub mtime: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub id: u32,
    pub parent: u32,
    pub name: String,
    pub size: u64,
    pub mtime: i64,
    pub hash: Option<String>,
}

/// Sentinel id returned by insert operations while `dry_run` is on; never written to disk.
const DRY_RUN_ID: u32 = u32::MAX;

pub struct Store {
    conn: Connection,
    db_path: PathBuf,
    dir_table: String,
    file_table: String,
    dry_run: bool,
}

impl Store {
    pub fn open(db_path: &Path, dir_table: &str, file_table: &str, dry_run: bool) -> Result<Self, StoreError> {
        let conn = open_connection(db_path)?;
        let store = Store {
            conn,
            db_path: db_path.to_path_buf(),
            dir_table: dir_table.to_string(),
            file_table: file_table.to_string(),
            dry_run,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Create both tables if absent. A no-op under dry-run, matching the historical worker's
    /// `initDatabase` (`if (p_dryRun) return;` before issuing `CREATE TABLE`).
    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        if self.dry_run {
            return Ok(());
        }
        self.with_retry(|conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {dirs} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL COLLATE BINARY,
                    parent INTEGER NOT NULL DEFAULT 0,
                    size INTEGER NOT NULL DEFAULT 0,
                    mtime INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS {dirs}_parent_idx ON {dirs}(parent);
                CREATE TABLE IF NOT EXISTS {files} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL COLLATE BINARY,
                    parent INTEGER NOT NULL DEFAULT 0,
                    size INTEGER NOT NULL DEFAULT 0,
                    mtime INTEGER NOT NULL DEFAULT 0,
                    hash TEXT
                );
                CREATE INDEX IF NOT EXISTS {files}_parent_idx ON {files}(parent);",
                dirs = self.dir_table,
                files = self.file_table,
            ))
        })
    }

    pub fn get_dir_by_id(&self, id: u32) -> Result<Option<DirRecord>, StoreError> {
        if id == 0 {
            return Ok(None);
        }
        self.with_retry(|conn| {
            conn.query_row(
                &format!("SELECT id,parent,name,size,mtime FROM {} WHERE id=?1", self.dir_table),
                params![id],
                |row| {
                    Ok(DirRecord {
                        id: row.get(0)?,
                        parent: row.get(1)?,
                        name: row.get(2)?,
                        size: row.get::<_, i64>(3)? as u64,
                        mtime: row.get(4)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn get_dir_by_name(&self, name: &str, parent: u32) -> Result<Option<DirRecord>, StoreError> {
        self.with_retry(|conn| {
            conn.query_row(
                &format!("SELECT id,parent,name,size,mtime FROM {} WHERE parent=?1 AND name=?2", self.dir_table),
                params![parent, name],
                |row| {
                    Ok(DirRecord {
                        id: row.get(0)?,
                        parent: row.get(1)?,
                        name: row.get(2)?,
                        size: row.get::<_, i64>(3)? as u64,
                        mtime: row.get(4)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn get_file_by_id(&self, id: u32) -> Result<Option<FileRecord>, StoreError> {
        self.with_retry(|conn| {
            conn.query_row(
                &format!("SELECT id,parent,name,size,mtime,hash FROM {} WHERE id=?1", self.file_table),
                params![id],
                Self::row_to_file,
            )
            .optional()
        })
    }

    pub fn get_file_by_name(&self, name: &str, parent: u32) -> Result<Option<FileRecord>, StoreError> {
        self.with_retry(|conn| {
            conn.query_row(
                &format!("SELECT id,parent,name,size,mtime,hash FROM {} WHERE parent=?1 AND name=?2", self.file_table),
                params![parent, name],
                Self::row_to_file,
            )
            .optional()
        })
    }

    fn row_to_file(row: &rusqlite::Row) -> rusqlite::Result<FileRecord> {
        Ok(FileRecord {
            id: row.get(0)?,
            parent: row.get(1)?,
            name: row.get(2)?,
            size: row.get::<_, i64>(3)? as u64,
            mtime: row.get(4)?,
            hash: row.get(5)?,
        })
    }

    pub fn list_children(&self, parent: u32) -> Result<(Vec<DirRecord>, Vec<FileRecord>), StoreError> {
        let dirs = self.with_retry(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT id,parent,name,size,mtime FROM {} WHERE parent=?1", self.dir_table))?;
            let rows = stmt.query_map(params![parent], |row| {
                Ok(DirRecord {
                    id: row.get(0)?,
                    parent: row.get(1)?,
                    name: row.get(2)?,
                    size: row.get::<_, i64>(3)? as u64,
                    mtime: row.get(4)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        let files = self.with_retry(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT id,parent,name,size,mtime,hash FROM {} WHERE parent=?1", self.file_table))?;
            let rows = stmt.query_map(params![parent], Self::row_to_file)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok((dirs, files))
    }

    pub fn insert_dir(&self, parent: u32, name: &str, size: u64, mtime: i64) -> Result<u32, StoreError> {
        if self.dry_run {
            return Ok(DRY_RUN_ID);
        }
        self.with_retry(|conn| {
            conn.execute(
                &format!("INSERT INTO {} (name,parent,size,mtime) VALUES (?1,?2,?3,?4)", self.dir_table),
                params![name, parent, size as i64, mtime],
            )?;
            Ok(conn.last_insert_rowid() as u32)
        })
    }

    pub fn insert_file(&self, parent: u32, name: &str, size: u64, mtime: i64, hash: Option<&str>) -> Result<u32, StoreError> {
        if self.dry_run {
            return Ok(DRY_RUN_ID);
        }
        self.with_retry(|conn| {
            conn.execute(
                &format!("INSERT INTO {} (name,parent,size,mtime,hash) VALUES (?1,?2,?3,?4,?5)", self.file_table),
                params![name, parent, size as i64, mtime, hash],
            )?;
            Ok(conn.last_insert_rowid() as u32)
        })
    }

    pub fn update_dir(&self, id: u32, size: u64, mtime: i64) -> Result<(), StoreError> {
        if self.dry_run {
            return Ok(());
        }
        self.with_retry(|conn| {
            conn.execute(
                &format!("UPDATE {} SET size=?1, mtime=?2 WHERE id=?3", self.dir_table),
                params![size as i64, mtime, id],
            )?;
            Ok(())
        })
    }

    pub fn update_file(&self, id: u32, size: u64, mtime: i64, hash: Option<&str>) -> Result<(), StoreError> {
        if self.dry_run {
            return Ok(());
        }
        self.with_retry(|conn| {
            conn.execute(
                &format!("UPDATE {} SET size=?1, mtime=?2, hash=?3 WHERE id=?4", self.file_table),
                params![size as i64, mtime, hash, id],
            )?;
            Ok(())
        })
    }

    pub fn delete_file(&self, id: u32) -> Result<(), StoreError> {
        if self.dry_run {
            return Ok(());
        }
        self.with_retry(|conn| {
            conn.execute(&format!("DELETE FROM {} WHERE id=?1", self.file_table), params![id])?;
            Ok(())
        })
    }

    pub fn delete_files_of_parent(&self, parent: u32) -> Result<(), StoreError> {
        if self.dry_run {
            return Ok(());
        }
        self.with_retry(|conn| {
            conn.execute(&format!("DELETE FROM {} WHERE parent=?1", self.file_table), params![parent])?;
            Ok(())
        })
    }

    /// Recursively deletes a directory and every descendant (files and directories). `id == 0`
    /// names the virtual root, which has no row of its own: every file and directory directly
    /// or transitively attached to it is still deleted, matching the original `deleteDirectory`,
    /// which carries no special case for the root.
    pub fn delete_dir(&self, id: u32) -> Result<(), StoreError> {
        let (child_dirs, _) = self.list_children(id)?;
        for child in child_dirs {
            self.delete_dir(child.id)?;
        }
        self.delete_files_of_parent(id)?;
        if id == 0 || self.dry_run {
            return Ok(());
        }
        self.with_retry(|conn| {
            conn.execute(&format!("DELETE FROM {} WHERE id=?1", self.dir_table), params![id])?;
            Ok(())
        })
    }

    /// Drops and recreates both tables. Gated by dry-run just like every other mutation.
    pub fn drop_all(&self) -> Result<(), StoreError> {
        if self.dry_run {
            return Ok(());
        }
        self.with_retry(|conn| {
            conn.execute(&format!("DELETE FROM {}", self.file_table), [])?;
            conn.execute(&format!("DELETE FROM {}", self.dir_table), [])?;
            Ok(())
        })
    }

    pub fn query_all_dirs(&self) -> Result<Vec<(u32, u32)>, StoreError> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT id,parent FROM {}", self.dir_table))?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    pub fn query_all_files(&self) -> Result<Vec<(u32, u32)>, StoreError> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT id,parent FROM {}", self.file_table))?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    pub fn get_dir_parent(&self, id: u32) -> Result<Option<u32>, StoreError> {
        self.with_retry(|conn| {
            conn.query_row(&format!("SELECT parent FROM {} WHERE id=?1", self.dir_table), params![id], |row| row.get(0))
                .optional()
        })
    }

    /// Runs `op` against the live connection; on a rusqlite error indicating the connection
    /// itself is unusable, reopens the database file once and retries. `rusqlite::Connection`
    /// caches prepared statements internally via `prepare_cached`-style reuse is not needed here
    /// since every statement text is rebuilt per call (table names are runtime strings) — the
    /// reconnect simply swaps the `Connection`, which is equivalent to "re-preparing" since
    /// nothing is held across the boundary.
    fn with_retry<T>(&self, op: impl Fn(&Connection) -> rusqlite::Result<T>) -> Result<T, StoreError> {
        match op(&self.conn) {
            Ok(v) => Ok(v),
            Err(e) if is_connection_error(&e) => {
                tracing::warn!(error = %e, "store connection appears stale, reconnecting");
                let fresh = open_connection(&self.db_path).map_err(|_| StoreError::Unavailable(e.to_string()))?;
                let result = op(&fresh);
                result.map_err(|e| StoreError::QueryFailed(e.to_string()))
            }
            Err(e) => Err(StoreError::QueryFailed(e.to_string())),
        }
    }
}

fn open_connection(db_path: &Path) -> Result<Connection, StoreError> {
    Connection::open(db_path).map_err(|e| StoreError::Unavailable(e.to_string()))
}

fn is_connection_error(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(ffi_err, _)
            if matches!(
                ffi_err.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::NotADatabase
            )
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fscrawl.sqlite3");
        let store = Store::open(&path, "dirs", "files", false).unwrap();
        (store, dir)
    }

    #[test]
    fn insert_and_get_dir_roundtrip() {
        let (store, _tmp) = temp_store();
        let id = store.insert_dir(0, "music", 0, 1000).unwrap();
        let rec = store.get_dir_by_id(id).unwrap().unwrap();
        assert_eq!(rec.name, "music");
        assert_eq!(rec.parent, 0);
        assert_eq!(rec.mtime, 1000);
    }

    #[test]
    fn dry_run_never_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fscrawl.sqlite3");
        let store = Store::open(&path, "dirs", "files", true).unwrap();
        let id = store.insert_dir(0, "music", 0, 1000).unwrap();
        assert_eq!(id, DRY_RUN_ID);
        assert!(store.get_dir_by_id(1).unwrap().is_none());
    }

    #[test]
    fn delete_dir_removes_descendants() {
        let (store, _tmp) = temp_store();
        let top = store.insert_dir(0, "top", 0, 0).unwrap();
        let sub = store.insert_dir(top, "sub", 0, 0).unwrap();
        store.insert_file(sub, "f.txt", 10, 0, None).unwrap();
        store.delete_dir(top).unwrap();
        assert!(store.get_dir_by_id(top).unwrap().is_none());
        assert!(store.get_dir_by_id(sub).unwrap().is_none());
        let (_, files) = store.list_children(sub).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn delete_dir_of_root_clears_whole_tree() {
        let (store, _tmp) = temp_store();
        store.insert_file(0, "top.txt", 3, 0, None).unwrap();
        let top = store.insert_dir(0, "top", 0, 0).unwrap();
        let sub = store.insert_dir(top, "sub", 0, 0).unwrap();
        store.insert_file(sub, "f.txt", 10, 0, None).unwrap();

        store.delete_dir(0).unwrap();

        let (dirs, files) = store.list_children(0).unwrap();
        assert!(dirs.is_empty());
        assert!(files.is_empty());
        assert!(store.get_dir_by_id(top).unwrap().is_none());
        assert!(store.get_dir_by_id(sub).unwrap().is_none());
    }

    #[test]
    fn list_children_separates_files_and_dirs() {
        let (store, _tmp) = temp_store();
        let parent = store.insert_dir(0, "p", 0, 0).unwrap();
        store.insert_dir(parent, "child-dir", 0, 0).unwrap();
        store.insert_file(parent, "child-file", 5, 0, Some("abc")).unwrap();
        let (dirs, files) = store.list_children(parent).unwrap();
        assert_eq!(dirs.len(), 1);
        assert_eq!(files.len(), 1);
    }
}
