//! Tar adapter
//!
//! Streams members straight off the body; no buffering beyond the decoder.
//! Hard and symbolic link entries both collapse to `Link`, directory entries
//! to `Dir`. Entry types the engine has no destination kind for are skipped
//! with a per-member cancel.

use std::io::Read;

use tracing::warn;

use crate::core::archive::{Compression, Member, MemberKind};
use crate::error::{Error, Result};

/// Wrap the raw body in the decoder the filename promised.
pub fn decoder<'a, R: Read + 'a>(
    body: R,
    compression: Compression,
) -> Result<Box<dyn Read + 'a>> {
    Ok(match compression {
        Compression::None => Box::new(body),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(body)),
        Compression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(body)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(body)),
        Compression::Lzip => {
            return Err(Error::Unsupported("lzip compression".to_string()))
        }
    })
}

/// Iterate the archive, handing each member to `f` in archive order.
pub fn walk<R, F>(body: R, compression: Compression, mut f: F) -> Result<()>
where
    R: Read,
    F: FnMut(Member<'_>) -> Result<()>,
{
    let body = decoder(body, compression)?;
    let mut archive = ::tar::Archive::new(body);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let mtime = entry.header().mtime().ok().map(|t| t as i64);

        use ::tar::EntryType;
        let member = match entry.header().entry_type() {
            EntryType::Directory => Member {
                path,
                kind: MemberKind::Dir,
                mtime,
                data: None,
                link_target: None,
            },
            EntryType::Symlink | EntryType::Link => {
                let target = match entry.link_name()? {
                    Some(target) => target.into_owned(),
                    None => {
                        warn!(member = %path.display(), "link entry without target, skipped");
                        continue;
                    }
                };
                Member {
                    path,
                    kind: MemberKind::Link,
                    mtime,
                    data: None,
                    link_target: Some(target),
                }
            }
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                Member {
                    path,
                    kind: MemberKind::File,
                    mtime,
                    data: Some(&mut entry),
                    link_target: None,
                }
            }
            other => {
                warn!(
                    member = %path.display(),
                    entry_type = ?other,
                    "unsupported member type, skipped"
                );
                continue;
            }
        };

        f(member)?;
    }

    Ok(())
}
