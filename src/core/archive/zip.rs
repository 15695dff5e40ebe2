//! Zip adapter
//!
//! Zip central directories live at the end of the file, so the body cannot
//! be walked as it streams; it is buffered to an unnamed scratch file first.
//! Member mtime is reconstructed from the archive's DOS date fields.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;

use tracing::warn;

use crate::core::archive::{Member, MemberKind};
use crate::error::Result;

/// Unix file-type bits marking a symlink in the external attributes.
const S_IFLNK: u32 = 0o120000;
const S_IFMT: u32 = 0o170000;

fn dos_datetime_to_unix(dt: ::zip::DateTime) -> Option<i64> {
    let date = chrono::NaiveDate::from_ymd_opt(
        dt.year() as i32,
        dt.month() as u32,
        dt.day() as u32,
    )?;
    let time = chrono::NaiveTime::from_hms_opt(
        dt.hour() as u32,
        dt.minute() as u32,
        dt.second() as u32,
    )?;
    Some(chrono::NaiveDateTime::new(date, time).and_utc().timestamp())
}

/// Iterate the archive, handing each member to `f` in central-directory
/// order.
pub fn walk<R, F>(mut body: R, mut f: F) -> Result<()>
where
    R: Read,
    F: FnMut(Member<'_>) -> Result<()>,
{
    // Spill the body to a scratch file to gain random access.
    let mut scratch = tempfile::tempfile()?;
    io::copy(&mut body, &mut scratch)?;
    scratch.seek(SeekFrom::Start(0))?;

    walk_file(scratch, &mut f)
}

fn walk_file<F>(scratch: File, f: &mut F) -> Result<()>
where
    F: FnMut(Member<'_>) -> Result<()>,
{
    let mut archive = ::zip::ZipArchive::new(scratch)
        .map_err(|e| anyhow::anyhow!("bad zip archive: {e}"))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| anyhow::anyhow!("bad zip member: {e}"))?;

        let path = PathBuf::from(entry.name().to_owned());
        let mtime = entry.last_modified().and_then(dos_datetime_to_unix);

        let is_link = entry
            .unix_mode()
            .map(|mode| mode & S_IFMT == S_IFLNK)
            .unwrap_or(false);

        let member = if entry.is_dir() {
            Member {
                path,
                kind: MemberKind::Dir,
                mtime,
                data: None,
                link_target: None,
            }
        } else if is_link {
            // The member body holds the target path.
            let mut target = String::new();
            if entry.read_to_string(&mut target).is_err() {
                warn!(member = %path.display(), "unreadable link target, skipped");
                continue;
            }
            Member {
                path,
                kind: MemberKind::Link,
                mtime,
                data: None,
                link_target: Some(PathBuf::from(target)),
            }
        } else {
            Member {
                path,
                kind: MemberKind::File,
                mtime,
                data: Some(&mut entry),
                link_target: None,
            }
        };

        f(member)?;
    }

    Ok(())
}
