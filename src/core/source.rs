//! Remote fetchable unit
//!
//! A `Source` is one thing the platform can hand us: an archive, a release
//! asset, a raw file. It probes or carries an opaque revision, streams the
//! body into `Destination`s, and reconciles the store afterwards: every
//! destination recorded for this source but not produced in the current
//! transaction is an orphan and gets removed.

use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use reqwest::header::{CONTENT_DISPOSITION, ETAG, LAST_MODIFIED};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::archive::{self, Compression, Member, MemberKind};
use crate::core::destination::{remove_existing, DestKind, Destination};
use crate::core::engine::Engine;
use crate::core::store::SourceRow;
use crate::error::{Error, Result};

/// File type of a source, inferred from its name. `.tar.<compression>` and
/// the usual aliases collapse to tar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Plain,
    Tar(Compression),
    Zip,
}

impl SourceKind {
    pub fn from_name(name: &str) -> SourceKind {
        let lower = name.to_lowercase();
        for (suffix, comp) in [
            (".tar.gz", Compression::Gzip),
            (".tar.bz2", Compression::Bzip2),
            (".tar.lz", Compression::Lzip),
            (".tar.xz", Compression::Xz),
            (".tgz", Compression::Gzip),
            (".tbz", Compression::Bzip2),
            (".tlz", Compression::Lzip),
            (".txz", Compression::Xz),
            (".tar", Compression::None),
        ] {
            if lower.ends_with(suffix) {
                return SourceKind::Tar(comp);
            }
        }
        if lower.ends_with(".zip") {
            return SourceKind::Zip;
        }
        SourceKind::Plain
    }
}

/// Options recorded at resource-create time and replayed on update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionArgs {
    /// Output directory; the configured default when absent
    pub output: Option<PathBuf>,
    /// Allow extraction outside of the output directory
    #[serde(default)]
    pub trusted: bool,
    /// Strip leading path components on extraction
    #[serde(default)]
    pub strip_components: u32,
}

/// Streaming response body that counts the bytes passing through it.
pub struct Body<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Body<R> {
    pub fn new(inner: R) -> Body<R> {
        Body { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<R: Read> Read for Body<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Pull the filename parameter out of a Content-Disposition header.
fn content_disposition_filename(value: &str) -> Option<String> {
    value.split(';').find_map(|part| {
        let part = part.trim();
        let rest = part.strip_prefix("filename=")?;
        let name = rest.trim_matches('"').trim();
        (!name.is_empty()).then(|| name.to_string())
    })
}

pub struct Source {
    name: String,
    url: String,
    res_name: String,
    res_id: i64,
    kind: SourceKind,
    mtime: Option<i64>,
    strip_components: u32,
    revision: Option<String>,
    trusted: bool,
    output: PathBuf,
    size: Option<i64>,
    row: Option<SourceRow>,
    src_id: Option<i64>,
    /// Destination ids committed this transaction; `None` means the source
    /// was skipped unchanged and its destinations must not be reconciled.
    committed: Option<HashSet<i64>>,
}

impl Source {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        res_name: impl Into<String>,
        res_id: i64,
        kind: Option<SourceKind>,
        mtime: Option<i64>,
        strip_components: u32,
        revision: Option<String>,
    ) -> Source {
        let name = name.into();
        let kind = kind.unwrap_or_else(|| SourceKind::from_name(&name));
        Source {
            name,
            url: url.into(),
            res_name: res_name.into(),
            res_id,
            kind,
            mtime,
            strip_components,
            revision,
            trusted: false,
            output: PathBuf::from("."),
            size: None,
            row: None,
            src_id: None,
            committed: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn res_name(&self) -> &str {
        &self.res_name
    }

    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    /// Source id in the store, known once the action ran (or a prior row
    /// existed).
    pub fn src_id(&self) -> Option<i64> {
        self.src_id
    }

    /// Shared action front guard. Loads the prior row, settles the revision,
    /// and decides revision-based skipping: on an update without force, a
    /// stored revision equal to the current one skips the fetch entirely and
    /// leaves the destinations untouched.
    fn begin(&mut self, eng: &Engine, update: bool, force: bool) -> Result<bool> {
        self.row = eng.store.source(self.res_id, &self.name)?;
        if let Some(row) = &self.row {
            self.src_id = Some(row.id);
        }

        if self.revision.is_none() {
            self.revision = self.probe_revision(eng)?;
        }

        if update && !force {
            if let (Some(row), Some(revision)) = (&self.row, &self.revision) {
                if row.revision.as_deref() == Some(revision.as_str()) {
                    debug!(
                        source = %self.name,
                        %revision, "revision unchanged, skipping"
                    );
                    return Ok(true);
                }
            }
        }

        self.committed = Some(HashSet::new());
        Ok(false)
    }

    /// Derive a revision from a HEAD probe: strong ETag, else Last-Modified.
    fn probe_revision(&self, eng: &Engine) -> Result<Option<String>> {
        let resp = eng.http.head(&self.url)?.error_for_status()?;
        let headers = resp.headers();

        if let Some(etag) = headers.get(ETAG).and_then(|v| v.to_str().ok()) {
            if !etag.starts_with("W/") {
                return Ok(Some(etag.to_string()));
            }
        }
        Ok(headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string))
    }

    /// GET the source body. Content-Length feeds the recorded size,
    /// Last-Modified backfills the mtime, and a Content-Disposition filename
    /// renames the source for record purposes.
    fn fetch(
        &mut self,
        eng: &Engine,
    ) -> Result<Body<reqwest::blocking::Response>> {
        let resp = eng
            .http
            .get(&self.url, reqwest::header::HeaderMap::new())?
            .error_for_status()?;

        if let Some(len) = resp.content_length() {
            self.size = Some(len as i64);
        }

        let headers = resp.headers();
        if self.mtime.is_none() {
            self.mtime = headers
                .get(LAST_MODIFIED)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| chrono::DateTime::parse_from_rfc2822(s).ok())
                .map(|dt| dt.timestamp());
        }
        if let Some(filename) = headers
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(content_disposition_filename)
        {
            self.name = filename;
        }

        Ok(Body::new(resp))
    }

    /// Resolve and create the output directory.
    fn set_output(&mut self, args: &ActionArgs, eng: &Engine) -> Result<()> {
        let raw = args
            .output
            .clone()
            .unwrap_or_else(|| eng.settings.output_dir.clone());
        let expanded = shellexpand::tilde(&raw.to_string_lossy()).into_owned();
        fs::create_dir_all(&expanded)?;
        self.output = fs::canonicalize(&expanded)?;
        Ok(())
    }

    /// Map a member path into the output directory, stripping leading
    /// components. Absolute paths and `..` segments are refused unless the
    /// source is trusted.
    fn member_path(&self, member: &Path, strip_components: u32) -> Result<PathBuf> {
        let stripped: PathBuf = member
            .components()
            .skip(strip_components as usize)
            .collect();

        let absolute = stripped.is_absolute();
        let escapes = stripped
            .components()
            .any(|c| matches!(c, Component::ParentDir));
        if !self.trusted && (absolute || escapes) {
            return Err(Error::Unsafe {
                source_name: self.name.clone(),
                path: stripped,
            });
        }
        if absolute {
            return Ok(stripped);
        }
        Ok(self.output.join(stripped))
    }

    /// Download the source as a single file.
    ///
    /// A single file always lands directly in the output directory:
    /// `strip_components` is forced to zero here, unlike `extract`.
    pub fn download(
        &mut self,
        eng: &Engine,
        args: &ActionArgs,
        update: bool,
        force: bool,
        tsk_id: i64,
    ) -> Result<()> {
        if self.begin(eng, update, force)? {
            return Ok(());
        }
        self.set_output(args, eng)?;

        let path = self.member_path(Path::new(&self.name), 0)?;
        let mut dst = Destination::open(
            &eng.store,
            path,
            self.res_id,
            DestKind::File,
            None,
            force,
        )?;

        let outcome = (|| -> Result<()> {
            let body = self.fetch(eng)?;
            let written = dst.write_stream(body)?;
            debug!(source = %self.name, written, "body streamed");
            dst.close()?;
            dst.commit(self.mtime)?;
            dst.clear()?;
            Ok(())
        })();

        match outcome {
            Ok(()) => self.finish(eng, tsk_id, &[dst]),
            Err(err) => {
                dst.cancel();
                Err(err)
            }
        }
    }

    /// Extract the source archive into the output directory.
    pub fn extract(
        &mut self,
        eng: &Engine,
        args: &ActionArgs,
        update: bool,
        force: bool,
        tsk_id: i64,
    ) -> Result<()> {
        if self.begin(eng, update, force)? {
            return Ok(());
        }
        self.trusted = args.trusted;
        self.set_output(args, eng)?;
        if args.strip_components != 0 {
            self.strip_components = args.strip_components;
        }

        let kind = self.kind;
        let body = self.fetch(eng)?;

        // Write members sequentially so a failure can roll everything back.
        let mut dsts: Vec<Destination> = Vec::new();
        let walked = {
            let this = &*self;
            let on_member =
                |m: Member<'_>| this.write_member(eng, m, force, &mut dsts);
            match kind {
                SourceKind::Tar(compression) => {
                    archive::tar::walk(body, compression, on_member)
                }
                SourceKind::Zip => archive::zip::walk(body, on_member),
                SourceKind::Plain => Err(Error::Unsupported(format!(
                    "extracting {}",
                    self.name
                ))),
            }
        };

        let committed = walked.and_then(|()| {
            for dst in &mut dsts {
                dst.commit(None)?;
            }
            for dst in &mut dsts {
                dst.clear()?;
            }
            Ok(())
        });

        match committed {
            Ok(()) => self.finish(eng, tsk_id, &dsts),
            Err(err) => {
                for dst in dsts.iter_mut().rev() {
                    dst.cancel();
                }
                Err(err)
            }
        }
    }

    /// Write one archive member through a Destination. Silent no-ops and
    /// user-modified members are skipped without failing the archive.
    fn write_member(
        &self,
        eng: &Engine,
        mut member: Member<'_>,
        force: bool,
        dsts: &mut Vec<Destination>,
    ) -> Result<()> {
        let path = self.member_path(&member.path, self.strip_components)?;
        if path == self.output {
            // Stripping consumed the whole member path (the archive's root
            // directory entry).
            return Ok(());
        }

        let kind = match member.kind {
            MemberKind::File => DestKind::File,
            MemberKind::Dir => DestKind::Dir,
            MemberKind::Link => DestKind::Link,
        };

        let staged = (|| -> Result<Destination> {
            let mut dst = Destination::open(
                &eng.store,
                path,
                self.res_id,
                kind,
                member.mtime,
                force,
            )?;
            match member.kind {
                MemberKind::File => {
                    dst.write_stream(member.data.take().expect("file member has data"))?;
                }
                MemberKind::Dir => dst.make_dir()?,
                MemberKind::Link => dst.write_link(
                    &member.link_target.take().expect("link member has target"),
                )?,
            }
            dst.close()?;
            Ok(dst)
        })();

        match staged {
            Ok(dst) => {
                dsts.push(dst);
                Ok(())
            }
            Err(err) if err.skips_member() => {
                warn!(
                    member = %member.path.display(),
                    %err,
                    "member skipped"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Install the source. No source type implements it yet; kept for
    /// type-specific adapters (deb, rpm) to hook into.
    pub fn install(
        &mut self,
        eng: &Engine,
        _args: &ActionArgs,
        update: bool,
        force: bool,
        _tsk_id: i64,
    ) -> Result<()> {
        if self.begin(eng, update, force)? {
            return Ok(());
        }
        Err(Error::Unsupported(format!("installing {}", self.name)))
    }

    /// Record the source and its destinations; rows are written only after
    /// every destination committed.
    fn finish(&mut self, eng: &Engine, tsk_id: i64, dsts: &[Destination]) -> Result<()> {
        let src_id = eng.store.upsert_source(
            tsk_id,
            self.res_id,
            None,
            Some(&self.name),
            self.revision.as_deref(),
            self.size,
            self.row.as_ref(),
        )?;
        self.src_id = Some(src_id);

        let mut committed = HashSet::new();
        for dst in dsts {
            committed.insert(dst.record(&eng.store, tsk_id, self.res_id, src_id)?);
        }
        self.committed = Some(committed);
        Ok(())
    }

    /// Remove destinations recorded for this source but not produced in the
    /// current transaction. A source skipped unchanged reconciles nothing.
    pub fn remove_orphans(&self, eng: &Engine) -> Result<()> {
        let committed = match &self.committed {
            Some(committed) => committed,
            None => return Ok(()),
        };
        let src_id = match self.src_id {
            Some(id) => id,
            None => return Ok(()),
        };

        for row in eng.store.destinations_by_source(src_id)? {
            if !committed.contains(&row.id) {
                debug!(path = %row.path, "removing orphan destination");
                remove_existing(Path::new(&row.path))?;
                eng.store.delete_destination(row.id)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::Action;
    use std::io::Cursor;
    use tempfile::tempdir;

    #[test]
    fn kind_detection_collapses_tar_compressions() {
        use Compression::*;
        for (name, kind) in [
            ("proj-1.0.tar.gz", SourceKind::Tar(Gzip)),
            ("proj-1.0.TAR.GZ", SourceKind::Tar(Gzip)),
            ("proj.tgz", SourceKind::Tar(Gzip)),
            ("proj.tar.bz2", SourceKind::Tar(Bzip2)),
            ("proj.tbz", SourceKind::Tar(Bzip2)),
            ("proj.tar.xz", SourceKind::Tar(Xz)),
            ("proj.txz", SourceKind::Tar(Xz)),
            ("proj.tar.lz", SourceKind::Tar(Lzip)),
            ("proj.tlz", SourceKind::Tar(Lzip)),
            ("proj.tar", SourceKind::Tar(None)),
            ("proj.zip", SourceKind::Zip),
            ("asset.bin", SourceKind::Plain),
            ("archive.gz", SourceKind::Plain),
        ] {
            assert_eq!(SourceKind::from_name(name), kind, "{name}");
        }
    }

    #[test]
    fn content_disposition_parsing() {
        assert_eq!(
            content_disposition_filename("attachment; filename=\"x.tar.gz\""),
            Some("x.tar.gz".to_string())
        );
        assert_eq!(
            content_disposition_filename("attachment; filename=plain.bin"),
            Some("plain.bin".to_string())
        );
        assert_eq!(content_disposition_filename("inline"), None);
    }

    fn bare_source(output: &Path, trusted: bool, strip: u32) -> Source {
        let mut src = Source::new(
            "a.tar",
            "https://example.invalid/a.tar",
            "test://res",
            1,
            Option::None,
            Option::None,
            strip,
            Option::None,
        );
        src.output = output.to_path_buf();
        src.trusted = trusted;
        src
    }

    #[test]
    fn member_paths_join_the_output_dir() {
        let tmp = tempdir().unwrap();
        let src = bare_source(tmp.path(), false, 0);
        assert_eq!(
            src.member_path(Path::new("pkg/readme.txt"), 0).unwrap(),
            tmp.path().join("pkg/readme.txt")
        );
    }

    #[test]
    fn strip_components_drops_leading_segments() {
        let tmp = tempdir().unwrap();
        let src = bare_source(tmp.path(), false, 1);
        assert_eq!(
            src.member_path(Path::new("proj-1.0/src/lib.rs"), 1).unwrap(),
            tmp.path().join("src/lib.rs")
        );
    }

    #[test]
    fn escaping_members_are_unsafe() {
        let tmp = tempdir().unwrap();
        let src = bare_source(tmp.path(), false, 0);
        for evil in ["../evil", "a/../../evil", "/etc/passwd"] {
            let err = src.member_path(Path::new(evil), 0).unwrap_err();
            assert!(matches!(err, Error::Unsafe { .. }), "{evil}");
        }
    }

    #[test]
    fn trusted_sources_may_escape() {
        let tmp = tempdir().unwrap();
        let src = bare_source(tmp.path(), true, 0);
        assert_eq!(
            src.member_path(Path::new("/abs/target"), 0).unwrap(),
            PathBuf::from("/abs/target")
        );
        assert!(src.member_path(Path::new("../up"), 0).is_ok());
    }

    #[test]
    fn body_counts_bytes() {
        let mut body = Body::new(Cursor::new(vec![0u8; 1000]));
        let mut sink = Vec::new();
        std::io::copy(&mut body, &mut sink).unwrap();
        assert_eq!(body.count(), 1000);
    }

    #[test]
    fn orphan_reconciliation_removes_stale_destinations() {
        let tmp = tempdir().unwrap();
        let eng = Engine::rooted_at(tmp.path()).unwrap();
        let tsk = eng.store.new_task().unwrap();
        let res = eng
            .store
            .upsert_resource(tsk, Option::None, Some("r"), Some(Action::Extract), Option::None, Option::None)
            .unwrap();
        let src_id = eng
            .store
            .upsert_source(tsk, res, Option::None, Some("a.tar"), Option::None, Option::None, Option::None)
            .unwrap();

        // Two recorded destinations; only one survives this transaction.
        let keep = tmp.path().join("keep.txt");
        let gone = tmp.path().join("gone.txt");
        fs::write(&keep, "k").unwrap();
        fs::write(&gone, "g").unwrap();
        let keep_id = eng
            .store
            .upsert_destination(
                tsk,
                res,
                src_id,
                &keep.to_string_lossy(),
                Option::None,
                &Default::default(),
                Option::None,
            )
            .unwrap();
        eng.store
            .upsert_destination(
                tsk,
                res,
                src_id,
                &gone.to_string_lossy(),
                Option::None,
                &Default::default(),
                Option::None,
            )
            .unwrap();

        let mut source = bare_source(tmp.path(), false, 0);
        source.res_id = res;
        source.src_id = Some(src_id);
        source.committed = Some([keep_id].into_iter().collect());

        source.remove_orphans(&eng).unwrap();

        assert!(keep.exists());
        assert!(!gone.exists());
        assert_eq!(eng.store.destinations_by_source(src_id).unwrap().len(), 1);
    }

    #[test]
    fn skipped_source_reconciles_nothing() {
        let tmp = tempdir().unwrap();
        let eng = Engine::rooted_at(tmp.path()).unwrap();
        let tsk = eng.store.new_task().unwrap();
        let res = eng
            .store
            .upsert_resource(tsk, Option::None, Some("r"), Some(Action::Download), Option::None, Option::None)
            .unwrap();
        let src_id = eng
            .store
            .upsert_source(tsk, res, Option::None, Some("f"), Option::None, Option::None, Option::None)
            .unwrap();
        let kept = tmp.path().join("kept.bin");
        fs::write(&kept, "data").unwrap();
        eng.store
            .upsert_destination(
                tsk,
                res,
                src_id,
                &kept.to_string_lossy(),
                Option::None,
                &Default::default(),
                Option::None,
            )
            .unwrap();

        let mut source = bare_source(tmp.path(), false, 0);
        source.res_id = res;
        source.src_id = Some(src_id);
        // The unchanged sentinel: no committed set at all.
        source.committed = Option::None;

        source.remove_orphans(&eng).unwrap();
        assert!(kept.exists());
        assert_eq!(eng.store.destinations_by_source(src_id).unwrap().len(), 1);
    }

    #[test]
    fn extracts_members_through_destinations() {
        let tmp = tempdir().unwrap();
        let out = tmp.path().join("out");
        fs::create_dir_all(&out).unwrap();
        let eng = Engine::rooted_at(tmp.path()).unwrap();
        let tsk = eng.store.new_task().unwrap();
        let res = eng
            .store
            .upsert_resource(tsk, Option::None, Some("r"), Some(Action::Extract), Option::None, Option::None)
            .unwrap();

        let mut builder = ::tar::Builder::new(Vec::new());
        let mut header = ::tar::Header::new_gnu();
        header.set_path("proj/readme.txt").unwrap();
        header.set_size(5);
        header.set_cksum();
        builder.append(&header, Cursor::new(b"hello")).unwrap();
        let body = builder.into_inner().unwrap();

        let mut source = bare_source(&out, false, 0);
        source.res_id = res;

        let mut dsts = Vec::new();
        archive::tar::walk(Cursor::new(body), Compression::None, |m| {
            source.write_member(&eng, m, false, &mut dsts)
        })
        .unwrap();
        for dst in &mut dsts {
            dst.commit(Option::None).unwrap();
            dst.clear().unwrap();
        }
        source.finish(&eng, tsk, &dsts).unwrap();

        let extracted = out.join("proj/readme.txt");
        assert_eq!(fs::read(&extracted).unwrap(), b"hello");
        let row = eng
            .store
            .destination_by_path(&extracted.to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(
            row.digest.unwrap(),
            blake3::hash(b"hello").to_hex().to_string()
        );
    }

    #[test]
    fn escaping_member_fails_the_whole_extraction() {
        let tmp = tempdir().unwrap();
        let out = tmp.path().join("out");
        fs::create_dir_all(&out).unwrap();
        let eng = Engine::rooted_at(tmp.path()).unwrap();
        let res = 1;

        let mut builder = ::tar::Builder::new(Vec::new());
        let mut header = ::tar::Header::new_gnu();
        let evil_path = b"../evil";
        header.as_old_mut().name[..evil_path.len()].copy_from_slice(evil_path);
        header.set_size(4);
        header.set_cksum();
        builder.append(&header, Cursor::new(b"boom")).unwrap();
        let body = builder.into_inner().unwrap();

        let mut source = bare_source(&out, false, 0);
        source.res_id = res;

        let mut dsts = Vec::new();
        let err = archive::tar::walk(Cursor::new(body), Compression::None, |m| {
            source.write_member(&eng, m, false, &mut dsts)
        })
        .unwrap_err();
        assert!(matches!(err, Error::Unsafe { .. }));
        assert!(dsts.is_empty());
        assert!(!tmp.path().join("evil").exists());
    }
}
