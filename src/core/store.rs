//! Relational state store
//!
//! Four tables track what the engine has materialized: `tsk` (one row per
//! invocation), `res` (named resources), `src` (fetchable units of a
//! resource) and `dst` (local filesystem objects produced by a source).
//! Every statement is its own commit point; readers always see a consistent
//! snapshot per query. The connection is shared across workers behind a
//! mutex.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension, Row};

use crate::error::Result;

/// Action recorded on a resource at create time. Updates replay it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Download,
    Extract,
    Install,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Download => "download",
            Action::Extract => "extract",
            Action::Install => "install",
        }
    }

    pub fn parse(s: &str) -> Option<Action> {
        match s {
            "download" => Some(Action::Download),
            "extract" => Some(Action::Extract),
            "install" => Some(Action::Install),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceRow {
    pub id: i64,
    pub tsk_id: i64,
    pub name: String,
    pub action: String,
    pub arguments: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SourceRow {
    pub id: i64,
    pub tsk_id: i64,
    pub res_id: i64,
    pub name: String,
    pub revision: Option<String>,
    pub size: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct DestRow {
    pub id: i64,
    pub tsk_id: i64,
    pub res_id: i64,
    pub src_id: i64,
    pub path: String,
    pub digest: Option<String>,
    pub st_mode: Option<i64>,
    pub st_uid: Option<i64>,
    pub st_gid: Option<i64>,
    pub st_size: Option<i64>,
    pub st_mtime: Option<i64>,
    pub st_ctime: Option<i64>,
}

/// Filesystem facts recorded with a destination at commit time.
#[derive(Debug, Clone, Default)]
pub struct DestStat {
    pub st_mode: Option<i64>,
    pub st_uid: Option<i64>,
    pub st_gid: Option<i64>,
    pub st_size: Option<i64>,
    pub st_mtime: Option<i64>,
    pub st_ctime: Option<i64>,
}

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS tsk (
    id INTEGER PRIMARY KEY,
    timestamp FLOAT
);
CREATE TABLE IF NOT EXISTS res (
    id INTEGER PRIMARY KEY,
    tsk_id INTEGER,
    name TEXT,
    action TEXT,
    arguments TEXT
);
CREATE TABLE IF NOT EXISTS src (
    id INTEGER PRIMARY KEY,
    tsk_id INTEGER,
    res_id INTEGER,
    name TEXT,
    revision TEXT,
    size INTEGER
);
CREATE TABLE IF NOT EXISTS dst (
    id INTEGER PRIMARY KEY,
    tsk_id INTEGER,
    res_id INTEGER,
    src_id INTEGER,
    path TEXT,
    digest TEXT,
    st_mode INTEGER,
    st_uid INTEGER,
    st_gid INTEGER,
    st_size INTEGER,
    st_mtime INTEGER,
    st_ctime INTEGER
);
";

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating tables if needed) the store at `path`.
    pub fn open(path: &Path) -> Result<Store> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Store> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a worker panicked mid-statement; the
        // connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a task row stamped with the current time.
    pub fn new_task(&self) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO tsk(timestamp) VALUES (?1)",
            [chrono::Utc::now().timestamp() as f64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Exact-name lookup, used by `create`.
    pub fn resource_by_name(&self, name: &str) -> Result<Option<ResourceRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, tsk_id, name, action, arguments FROM res WHERE name = ?1",
                [name],
                resource_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Glob matching over resource names, used by `update`/`remove`.
    pub fn resources_by_glob(&self, pattern: &str) -> Result<Vec<ResourceRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, tsk_id, name, action, arguments FROM res WHERE name GLOB ?1",
        )?;
        let rows = stmt
            .query_map([pattern], resource_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn source(&self, res_id: i64, name: &str) -> Result<Option<SourceRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, tsk_id, res_id, name, revision, size FROM src \
                 WHERE res_id = ?1 AND name = ?2",
                rusqlite::params![res_id, name],
                source_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn sources_by_resource(&self, res_id: i64) -> Result<Vec<SourceRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, tsk_id, res_id, name, revision, size FROM src WHERE res_id = ?1",
        )?;
        let rows = stmt
            .query_map([res_id], source_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn destination_by_path(&self, path: &str) -> Result<Option<DestRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, tsk_id, res_id, src_id, path, digest, st_mode, st_uid, \
                 st_gid, st_size, st_mtime, st_ctime FROM dst WHERE path = ?1",
                [path],
                dest_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn destinations_by_source(&self, src_id: i64) -> Result<Vec<DestRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, tsk_id, res_id, src_id, path, digest, st_mode, st_uid, \
             st_gid, st_size, st_mtime, st_ctime FROM dst WHERE src_id = ?1",
        )?;
        let rows = stmt
            .query_map([src_id], dest_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Insert or update a resource. With a known id (or reference row) only
    /// columns whose new value is set and differs from the reference are
    /// written.
    pub fn upsert_resource(
        &self,
        tsk_id: i64,
        res_id: Option<i64>,
        name: Option<&str>,
        action: Option<Action>,
        arguments: Option<&str>,
        ref_row: Option<&ResourceRow>,
    ) -> Result<i64> {
        let action_str = action.map(Action::as_str);
        if let Some(row_id) = res_id.or(ref_row.map(|r| r.id)) {
            let mut changed: Vec<(&str, Box<dyn ToSql>)> =
                vec![("tsk_id", Box::new(tsk_id))];
            if let Some(name) = name {
                if ref_row.map(|r| r.name.as_str()) != Some(name) {
                    changed.push(("name", Box::new(name.to_owned())));
                }
            }
            if let Some(action) = action_str {
                if ref_row.map(|r| r.action.as_str()) != Some(action) {
                    changed.push(("action", Box::new(action)));
                }
            }
            if let Some(arguments) = arguments {
                if ref_row.and_then(|r| r.arguments.as_deref()) != Some(arguments) {
                    changed.push(("arguments", Box::new(arguments.to_owned())));
                }
            }
            self.update_row("res", row_id, changed)?;
            return Ok(row_id);
        }

        let conn = self.lock();
        conn.execute(
            "INSERT INTO res(tsk_id, name, action, arguments) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![tsk_id, name, action_str, arguments],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn upsert_source(
        &self,
        tsk_id: i64,
        res_id: i64,
        src_id: Option<i64>,
        name: Option<&str>,
        revision: Option<&str>,
        size: Option<i64>,
        ref_row: Option<&SourceRow>,
    ) -> Result<i64> {
        if let Some(row_id) = src_id.or(ref_row.map(|r| r.id)) {
            let mut changed: Vec<(&str, Box<dyn ToSql>)> =
                vec![("tsk_id", Box::new(tsk_id))];
            if ref_row.map(|r| r.res_id) != Some(res_id) {
                changed.push(("res_id", Box::new(res_id)));
            }
            if let Some(name) = name {
                if ref_row.map(|r| r.name.as_str()) != Some(name) {
                    changed.push(("name", Box::new(name.to_owned())));
                }
            }
            if let Some(revision) = revision {
                if ref_row.and_then(|r| r.revision.as_deref()) != Some(revision) {
                    changed.push(("revision", Box::new(revision.to_owned())));
                }
            }
            if let Some(size) = size {
                if ref_row.and_then(|r| r.size) != Some(size) {
                    changed.push(("size", Box::new(size)));
                }
            }
            self.update_row("src", row_id, changed)?;
            return Ok(row_id);
        }

        let conn = self.lock();
        conn.execute(
            "INSERT INTO src(tsk_id, res_id, name, revision, size) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![tsk_id, res_id, name, revision, size],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn upsert_destination(
        &self,
        tsk_id: i64,
        res_id: i64,
        src_id: i64,
        path: &str,
        digest: Option<&str>,
        stat: &DestStat,
        ref_row: Option<&DestRow>,
    ) -> Result<i64> {
        if let Some(row_id) = ref_row.map(|r| r.id) {
            let mut changed: Vec<(&str, Box<dyn ToSql>)> =
                vec![("tsk_id", Box::new(tsk_id))];
            let r = ref_row.expect("row id implies reference row");
            if r.res_id != res_id {
                changed.push(("res_id", Box::new(res_id)));
            }
            if r.src_id != src_id {
                changed.push(("src_id", Box::new(src_id)));
            }
            if r.path != path {
                changed.push(("path", Box::new(path.to_owned())));
            }
            if let Some(digest) = digest {
                if r.digest.as_deref() != Some(digest) {
                    changed.push(("digest", Box::new(digest.to_owned())));
                }
            }
            for (col, new, old) in [
                ("st_mode", stat.st_mode, r.st_mode),
                ("st_uid", stat.st_uid, r.st_uid),
                ("st_gid", stat.st_gid, r.st_gid),
                ("st_size", stat.st_size, r.st_size),
                ("st_mtime", stat.st_mtime, r.st_mtime),
                ("st_ctime", stat.st_ctime, r.st_ctime),
            ] {
                if let Some(new) = new {
                    if old != Some(new) {
                        changed.push((col, Box::new(new)));
                    }
                }
            }
            self.update_row("dst", row_id, changed)?;
            return Ok(row_id);
        }

        let conn = self.lock();
        conn.execute(
            "INSERT INTO dst(tsk_id, res_id, src_id, path, digest, st_mode, \
             st_uid, st_gid, st_size, st_mtime, st_ctime) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                tsk_id,
                res_id,
                src_id,
                path,
                digest,
                stat.st_mode,
                stat.st_uid,
                stat.st_gid,
                stat.st_size,
                stat.st_mtime,
                stat.st_ctime
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn delete_resource(&self, res_id: i64) -> Result<()> {
        self.lock()
            .execute("DELETE FROM res WHERE id = ?1", [res_id])?;
        Ok(())
    }

    /// Deletes the source row and all destinations that belong to it.
    pub fn delete_source(&self, src_id: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM src WHERE id = ?1", [src_id])?;
        conn.execute("DELETE FROM dst WHERE src_id = ?1", [src_id])?;
        Ok(())
    }

    pub fn delete_destination(&self, dst_id: i64) -> Result<()> {
        self.lock()
            .execute("DELETE FROM dst WHERE id = ?1", [dst_id])?;
        Ok(())
    }

    /// All tracked resources, newest task first. Backs the `list` command.
    pub fn all_resources(&self) -> Result<Vec<ResourceRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, tsk_id, name, action, arguments FROM res ORDER BY tsk_id DESC",
        )?;
        let rows = stmt
            .query_map([], resource_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn update_row(
        &self,
        table: &str,
        row_id: i64,
        changed: Vec<(&str, Box<dyn ToSql>)>,
    ) -> Result<()> {
        let assignments = changed
            .iter()
            .enumerate()
            .map(|(i, (col, _))| format!("{col} = ?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {table} SET {assignments} WHERE id = ?{}",
            changed.len() + 1
        );

        let mut params: Vec<&dyn ToSql> =
            changed.iter().map(|(_, v)| v.as_ref()).collect();
        params.push(&row_id);

        self.lock().execute(&sql, params.as_slice())?;
        Ok(())
    }
}

fn resource_from_row(row: &Row<'_>) -> rusqlite::Result<ResourceRow> {
    Ok(ResourceRow {
        id: row.get(0)?,
        tsk_id: row.get(1)?,
        name: row.get(2)?,
        action: row.get(3)?,
        arguments: row.get(4)?,
    })
}

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<SourceRow> {
    Ok(SourceRow {
        id: row.get(0)?,
        tsk_id: row.get(1)?,
        res_id: row.get(2)?,
        name: row.get(3)?,
        revision: row.get(4)?,
        size: row.get(5)?,
    })
}

fn dest_from_row(row: &Row<'_>) -> rusqlite::Result<DestRow> {
    Ok(DestRow {
        id: row.get(0)?,
        tsk_id: row.get(1)?,
        res_id: row.get(2)?,
        src_id: row.get(3)?,
        path: row.get(4)?,
        digest: row.get(5)?,
        st_mode: row.get(6)?,
        st_uid: row.get(7)?,
        st_gid: row.get(8)?,
        st_size: row.get(9)?,
        st_mtime: row.get(10)?,
        st_ctime: row.get(11)?,
    })
}
