//! Single-file atomic writer
//!
//! A `Destination` owns one path on the local filesystem and takes it
//! through stage→hash→compare→swap→backup→commit. New content is written to
//! `<path>.prt.granary` and hashed as it streams; `commit` swaps it in after
//! renaming the previous version to `<path>.bak.granary`; `clear` drops the
//! backup once the whole source has committed; `cancel` rolls back.
//!
//! At every suspension point the filesystem holds one of three legal states
//! for the path: the committed original alone, the original plus the staging
//! file, or the new file plus a backup. A crash leaves enough on disk for a
//! later `cancel` to restore the original.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::core::store::{DestRow, DestStat, Store};
use crate::error::{Error, Result};
use crate::infra::config::APP_NAME;

const BUFFER_SIZE: usize = 65536;

/// Recorded digest of a directory destination; directories have no content
/// to hash, only presence.
const DIR_DIGEST: &str = "0";

/// Unlink a file, ignoring an already-missing path.
pub fn remove_existing(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestKind {
    File,
    Dir,
    Link,
}

#[derive(Debug)]
pub struct Destination {
    path: PathBuf,
    kind: DestKind,
    /// Staging path while a write is in flight
    part: Option<PathBuf>,
    /// Backup of the previous committed version, present between commit
    /// and clear
    backup: Option<PathBuf>,
    file: Option<File>,
    hasher: blake3::Hasher,
    /// Digest recorded at the last successful commit, from the store
    digest_old: Option<String>,
    /// Digest of the content written this transaction
    digest_new: Option<String>,
    /// Lazily computed digest of whatever is on disk right now
    digest_cur: Option<Option<String>>,
    row: Option<DestRow>,
    mtime: Option<i64>,
    force: bool,
    update: bool,
}

impl Destination {
    /// Claim `path` for `res_id` and begin a staged write.
    ///
    /// Fails with `Conflict` when the store says another resource owns the
    /// path, and with `UserModified` when the on-disk content no longer
    /// matches the recorded digest (unless `force`).
    pub fn open(
        store: &Store,
        path: PathBuf,
        res_id: i64,
        kind: DestKind,
        mtime: Option<i64>,
        force: bool,
    ) -> Result<Destination> {
        let row = store.destination_by_path(&path.to_string_lossy())?;

        if let Some(row) = &row {
            if row.res_id != res_id {
                return Err(Error::Conflict {
                    path,
                    owner: row.res_id,
                });
            }
        }

        let mut dest = Destination {
            digest_old: row.as_ref().and_then(|r| r.digest.clone()),
            row,
            path,
            kind,
            part: None,
            backup: None,
            file: None,
            hasher: blake3::Hasher::new(),
            digest_new: None,
            digest_cur: None,
            mtime,
            force,
            update: false,
        };

        // Refuse to overwrite content the user changed behind our back.
        if !dest.force {
            if let Some(old) = dest.digest_old.clone() {
                if let Some(cur) = dest.current_digest()? {
                    if old != cur {
                        return Err(Error::UserModified(dest.path.clone()));
                    }
                }
            }
        }

        if dest.kind != DestKind::Dir {
            let mut part = dest.path.clone().into_os_string();
            part.push(format!(".prt.{APP_NAME}"));
            dest.part = Some(PathBuf::from(part));
        }

        if dest.kind == DestKind::File {
            let part = dest.part.as_ref().expect("file kind stages");
            if let Some(parent) = part.parent() {
                fs::create_dir_all(parent)?;
            }
            dest.file = Some(File::create(part)?);
        }

        Ok(dest)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> DestKind {
        self.kind
    }

    /// True once `close` decided the staged content must replace the
    /// committed version.
    pub fn update_required(&self) -> bool {
        self.update
    }

    /// Append bytes to the staged file, hashing as they pass.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        debug_assert_eq!(self.kind, DestKind::File);
        self.hasher.update(data);
        self.file
            .as_mut()
            .expect("write after close")
            .write_all(data)?;
        Ok(())
    }

    /// Drain a streaming body into the staged file. Returns bytes written.
    pub fn write_stream<R: Read>(&mut self, mut body: R) -> Result<u64> {
        let mut buf = [0u8; BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = body.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.write(&buf[..n])?;
            total += n as u64;
        }
        Ok(total)
    }

    /// Create the directory destination. Idempotent, no staging.
    pub fn make_dir(&mut self) -> Result<()> {
        debug_assert_eq!(self.kind, DestKind::Dir);
        fs::create_dir_all(&self.path)?;
        Ok(())
    }

    /// Stage a symlink pointing at `target`; the target path bytes are the
    /// hashed content.
    #[cfg(unix)]
    pub fn write_link(&mut self, target: &Path) -> Result<()> {
        use std::os::unix::ffi::OsStrExt;
        debug_assert_eq!(self.kind, DestKind::Link);
        let part = self.part.as_ref().expect("link kind stages");
        remove_existing(part)?;
        std::os::unix::fs::symlink(target, part)?;
        self.hasher.update(target.as_os_str().as_bytes());
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn write_link(&mut self, _target: &Path) -> Result<()> {
        Err(Error::Unsupported(
            "symbolic links on this platform".to_string(),
        ))
    }

    /// Finish the staged write and decide whether an update is required.
    ///
    /// Unchanged content rolls the staging back silently. A path that exists
    /// on disk but not in the store fails with `AlreadyExists` when its
    /// content differs from the new version (unless `force`).
    pub fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }

        let digest_new = match self.kind {
            DestKind::Dir => DIR_DIGEST.to_string(),
            _ => self.hasher.finalize().to_hex().to_string(),
        };
        self.digest_new = Some(digest_new.clone());

        // Nothing changed since the last commit.
        if self.digest_old.as_deref() == Some(&digest_new) {
            self.rollback();
            return Ok(());
        }

        // Present on disk but never installed by us.
        if !self.force && self.digest_old.is_none() {
            if let Some(cur) = self.current_digest()? {
                if cur != digest_new {
                    self.rollback();
                    return Err(Error::AlreadyExists(self.path.clone()));
                }
                // Same bytes already there; adopt without rewriting.
                self.rollback();
                return Ok(());
            }
        }

        if self.kind != DestKind::Dir {
            self.update = true;
        }
        Ok(())
    }

    /// Swap the staged content in: back up the committed version, rename
    /// the staging file over the path, carry stat over from the backup and
    /// apply the known mtime.
    pub fn commit(&mut self, mtime: Option<i64>) -> Result<()> {
        if !self.update {
            return Ok(());
        }
        let part = self.part.take().expect("update implies staging");

        let mut bak = self.path.clone().into_os_string();
        bak.push(format!(".bak.{APP_NAME}"));
        let bak = PathBuf::from(bak);
        match fs::rename(&self.path, &bak) {
            Ok(()) => self.backup = Some(bak.clone()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        fs::rename(&part, &self.path)?;
        trace!(path = %self.path.display(), "committed");

        // Keep the previous version's mode and times where we have them.
        if self.backup.is_some() && self.kind == DestKind::File {
            if let Ok(meta) = fs::metadata(&bak) {
                let _ = fs::set_permissions(&self.path, meta.permissions());
                let _ = filetime::set_file_times(
                    &self.path,
                    filetime::FileTime::from_last_access_time(&meta),
                    filetime::FileTime::from_last_modification_time(&meta),
                );
            }
        }

        let mtime = mtime.or(self.mtime);
        if let Some(mtime) = mtime {
            if self.kind == DestKind::File {
                let _ = filetime::set_file_mtime(
                    &self.path,
                    filetime::FileTime::from_unix_time(mtime, 0),
                );
            }
        }
        Ok(())
    }

    /// Drop the backup of the previous version.
    pub fn clear(&mut self) -> Result<()> {
        if let Some(bak) = self.backup.take() {
            remove_existing(&bak)?;
        }
        Ok(())
    }

    /// Roll back: remove staged state and restore the backup if the swap
    /// already happened. Safe to call at any point, any number of times.
    pub fn cancel(&mut self) {
        self.rollback();
    }

    fn rollback(&mut self) {
        self.file = None;
        if let Some(part) = self.part.take() {
            let _ = remove_existing(&part);
        }
        if let Some(bak) = self.backup.take() {
            if bak.exists() {
                let _ = remove_existing(&self.path);
                let _ = fs::rename(&bak, &self.path);
            }
        }
        self.update = false;
    }

    /// Record the destination in the store. Rows are only written after a
    /// successful commit so a digest in the store always matches what the
    /// commit put on disk.
    pub fn record(
        &self,
        store: &Store,
        tsk_id: i64,
        res_id: i64,
        src_id: i64,
    ) -> Result<i64> {
        if !self.update && self.row.is_some() {
            // Already up to date.
            return Ok(self.row.as_ref().expect("checked").id);
        }

        let stat = stat_of(&self.path);
        store.upsert_destination(
            tsk_id,
            res_id,
            src_id,
            &self.path.to_string_lossy(),
            self.digest_new.as_deref(),
            &stat,
            self.row.as_ref(),
        )
    }

    /// Hash whatever currently sits at the path; `None` when absent.
    fn current_digest(&mut self) -> Result<Option<String>> {
        if let Some(cached) = &self.digest_cur {
            return Ok(cached.clone());
        }
        let digest = match self.kind {
            DestKind::Dir => self.path.is_dir().then(|| DIR_DIGEST.to_string()),
            DestKind::Link => match fs::read_link(&self.path) {
                Ok(target) => Some(hash_os_bytes(target.as_os_str())),
                Err(_) => None,
            },
            DestKind::File => match File::open(&self.path) {
                Ok(mut file) => {
                    let mut hasher = blake3::Hasher::new();
                    let mut buf = [0u8; BUFFER_SIZE];
                    loop {
                        let n = file.read(&mut buf)?;
                        if n == 0 {
                            break;
                        }
                        hasher.update(&buf[..n]);
                    }
                    Some(hasher.finalize().to_hex().to_string())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            },
        };
        self.digest_cur = Some(digest.clone());
        Ok(digest)
    }
}

impl Drop for Destination {
    fn drop(&mut self) {
        self.rollback();
    }
}

fn hash_os_bytes(s: &std::ffi::OsStr) -> String {
    #[cfg(unix)]
    let bytes = {
        use std::os::unix::ffi::OsStrExt;
        s.as_bytes().to_vec()
    };
    #[cfg(not(unix))]
    let bytes = s.to_string_lossy().into_owned().into_bytes();
    blake3::hash(&bytes).to_hex().to_string()
}

/// Filesystem facts for the store row; missing fields on exotic platforms
/// stay NULL.
fn stat_of(path: &Path) -> DestStat {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(_) => return DestStat::default(),
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        DestStat {
            st_mode: Some(meta.mode() as i64),
            st_uid: Some(meta.uid() as i64),
            st_gid: Some(meta.gid() as i64),
            st_size: Some(meta.size() as i64),
            st_mtime: Some(meta.mtime()),
            st_ctime: Some(meta.ctime()),
        }
    }
    #[cfg(not(unix))]
    {
        DestStat {
            st_size: Some(meta.len() as i64),
            ..DestStat::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::Action;
    use tempfile::tempdir;

    fn fixture() -> (Store, i64, i64, i64) {
        let store = Store::in_memory().unwrap();
        let tsk = store.new_task().unwrap();
        let res = store
            .upsert_resource(tsk, None, Some("r"), Some(Action::Download), None, None)
            .unwrap();
        let src = store
            .upsert_source(tsk, res, None, Some("s"), None, None, None)
            .unwrap();
        (store, tsk, res, src)
    }

    fn digest_of(path: &Path) -> String {
        blake3::hash(&fs::read(path).unwrap()).to_hex().to_string()
    }

    #[test]
    fn fresh_write_commits_and_records_true_digest() {
        let tmp = tempdir().unwrap();
        let (store, tsk, res, src) = fixture();
        let path = tmp.path().join("out.bin");

        let mut dst =
            Destination::open(&store, path.clone(), res, DestKind::File, None, false)
                .unwrap();
        dst.write(b"hello world").unwrap();
        dst.close().unwrap();
        assert!(dst.update_required());
        dst.commit(None).unwrap();
        dst.clear().unwrap();
        let id = dst.record(&store, tsk, res, src).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"hello world");
        let row = store
            .destination_by_path(&path.to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(row.id, id);
        // Digest truth: re-hashing the committed file matches the row.
        assert_eq!(row.digest.unwrap(), digest_of(&path));
        // No staging or backup left behind.
        assert!(!tmp.path().join("out.bin.prt.granary").exists());
        assert!(!tmp.path().join("out.bin.bak.granary").exists());
    }

    #[test]
    fn unchanged_content_is_a_silent_noop() {
        let tmp = tempdir().unwrap();
        let (store, tsk, res, src) = fixture();
        let path = tmp.path().join("out.bin");

        for _ in 0..2 {
            let mut dst =
                Destination::open(&store, path.clone(), res, DestKind::File, None, false)
                    .unwrap();
            dst.write(b"same").unwrap();
            dst.close().unwrap();
            dst.commit(None).unwrap();
            dst.clear().unwrap();
            dst.record(&store, tsk, res, src).unwrap();
        }

        // Second pass never staged an update.
        let mut dst =
            Destination::open(&store, path.clone(), res, DestKind::File, None, false)
                .unwrap();
        dst.write(b"same").unwrap();
        dst.close().unwrap();
        assert!(!dst.update_required());
        assert!(!tmp.path().join("out.bin.prt.granary").exists());
    }

    #[test]
    fn user_modified_file_is_refused_without_force() {
        let tmp = tempdir().unwrap();
        let (store, tsk, res, src) = fixture();
        let path = tmp.path().join("out.bin");

        let mut dst =
            Destination::open(&store, path.clone(), res, DestKind::File, None, false)
                .unwrap();
        dst.write(b"v1").unwrap();
        dst.close().unwrap();
        dst.commit(None).unwrap();
        dst.clear().unwrap();
        dst.record(&store, tsk, res, src).unwrap();

        fs::write(&path, b"XXX").unwrap();

        let err =
            Destination::open(&store, path.clone(), res, DestKind::File, None, false)
                .unwrap_err();
        assert!(matches!(err, Error::UserModified(_)));
        assert_eq!(fs::read(&path).unwrap(), b"XXX");

        // force overrides the refusal
        let mut dst =
            Destination::open(&store, path.clone(), res, DestKind::File, None, true)
                .unwrap();
        dst.write(b"v2").unwrap();
        dst.close().unwrap();
        dst.commit(None).unwrap();
        dst.clear().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"v2");
    }

    #[test]
    fn foreign_resource_path_conflicts() {
        let tmp = tempdir().unwrap();
        let (store, tsk, res, src) = fixture();
        let path = tmp.path().join("owned.bin");

        let mut dst =
            Destination::open(&store, path.clone(), res, DestKind::File, None, false)
                .unwrap();
        dst.write(b"x").unwrap();
        dst.close().unwrap();
        dst.commit(None).unwrap();
        dst.clear().unwrap();
        dst.record(&store, tsk, res, src).unwrap();

        let other_res = store
            .upsert_resource(tsk, None, Some("r2"), Some(Action::Download), None, None)
            .unwrap();
        let err =
            Destination::open(&store, path, other_res, DestKind::File, None, false)
                .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[test]
    fn untracked_existing_file_with_different_content_already_exists() {
        let tmp = tempdir().unwrap();
        let (store, _, res, _) = fixture();
        let path = tmp.path().join("present.txt");
        fs::write(&path, b"theirs").unwrap();

        let mut dst =
            Destination::open(&store, path.clone(), res, DestKind::File, None, false)
                .unwrap();
        dst.write(b"ours").unwrap();
        let err = dst.close().unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        // Their file untouched, our staging gone.
        assert_eq!(fs::read(&path).unwrap(), b"theirs");
        assert!(!tmp.path().join("present.txt.prt.granary").exists());
    }

    #[test]
    fn untracked_existing_file_with_same_content_is_adopted() {
        let tmp = tempdir().unwrap();
        let (store, tsk, res, src) = fixture();
        let path = tmp.path().join("present.txt");
        fs::write(&path, b"identical").unwrap();

        let mut dst =
            Destination::open(&store, path.clone(), res, DestKind::File, None, false)
                .unwrap();
        dst.write(b"identical").unwrap();
        dst.close().unwrap();
        assert!(!dst.update_required());
        dst.commit(None).unwrap();
        let id = dst.record(&store, tsk, res, src).unwrap();
        assert!(id > 0);
        assert!(store
            .destination_by_path(&path.to_string_lossy())
            .unwrap()
            .is_some());
    }

    #[test]
    fn cancel_after_commit_restores_the_original() {
        let tmp = tempdir().unwrap();
        let (store, tsk, res, src) = fixture();
        let path = tmp.path().join("out.bin");

        let mut dst =
            Destination::open(&store, path.clone(), res, DestKind::File, None, false)
                .unwrap();
        dst.write(b"v1").unwrap();
        dst.close().unwrap();
        dst.commit(None).unwrap();
        dst.clear().unwrap();
        dst.record(&store, tsk, res, src).unwrap();

        // Second version committed but not cleared, then rolled back.
        let mut dst =
            Destination::open(&store, path.clone(), res, DestKind::File, None, false)
                .unwrap();
        dst.write(b"v2").unwrap();
        dst.close().unwrap();
        dst.commit(None).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"v2");
        dst.cancel();
        assert_eq!(fs::read(&path).unwrap(), b"v1");
        assert!(!tmp.path().join("out.bin.bak.granary").exists());
    }

    #[test]
    fn drop_cleans_up_abandoned_staging() {
        let tmp = tempdir().unwrap();
        let (store, _, res, _) = fixture();
        let path = tmp.path().join("out.bin");

        {
            let mut dst = Destination::open(
                &store,
                path.clone(),
                res,
                DestKind::File,
                None,
                false,
            )
            .unwrap();
            dst.write(b"partial").unwrap();
            // Dropped without close/commit.
        }
        assert!(!path.exists());
        assert!(!tmp.path().join("out.bin.prt.granary").exists());
    }

    #[test]
    fn dir_destination_is_idempotent() {
        let tmp = tempdir().unwrap();
        let (store, tsk, res, src) = fixture();
        let path = tmp.path().join("sub/dir");

        for _ in 0..2 {
            let mut dst = Destination::open(
                &store,
                path.clone(),
                res,
                DestKind::Dir,
                None,
                false,
            )
            .unwrap();
            dst.make_dir().unwrap();
            dst.close().unwrap();
            dst.commit(None).unwrap();
            dst.clear().unwrap();
            dst.record(&store, tsk, res, src).unwrap();
        }
        assert!(path.is_dir());
        let row = store
            .destination_by_path(&path.to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(row.digest.as_deref(), Some(DIR_DIGEST));
    }

    #[cfg(unix)]
    #[test]
    fn link_destination_stages_and_commits() {
        let tmp = tempdir().unwrap();
        let (store, tsk, res, src) = fixture();
        let path = tmp.path().join("alias");

        let mut dst =
            Destination::open(&store, path.clone(), res, DestKind::Link, None, false)
                .unwrap();
        dst.write_link(Path::new("target.txt")).unwrap();
        dst.close().unwrap();
        dst.commit(None).unwrap();
        dst.clear().unwrap();
        dst.record(&store, tsk, res, src).unwrap();

        assert_eq!(
            fs::read_link(&path).unwrap(),
            PathBuf::from("target.txt")
        );
        assert!(!tmp.path().join("alias.prt.granary").exists());
    }

    #[test]
    fn commit_applies_known_mtime() {
        let tmp = tempdir().unwrap();
        let (store, _, res, _) = fixture();
        let path = tmp.path().join("dated.bin");
        let stamp = 1_500_000_000i64;

        let mut dst = Destination::open(
            &store,
            path.clone(),
            res,
            DestKind::File,
            Some(stamp),
            false,
        )
        .unwrap();
        dst.write(b"content").unwrap();
        dst.close().unwrap();
        dst.commit(None).unwrap();
        dst.clear().unwrap();

        let meta = fs::metadata(&path).unwrap();
        let mtime = filetime::FileTime::from_last_modification_time(&meta);
        assert_eq!(mtime.unix_seconds(), stamp);
    }
}
