//! Archive member iteration
//!
//! Adapters consume a streamed body and hand each member to a callback as
//! `{path, kind, mtime, data}`: a readable stream for files, the target path
//! for links, nothing for directories. Tar walks the body in archive order;
//! zip needs random access and buffers the body to a scratch file first.
//! Members the format can express but the engine cannot (fifos, devices)
//! are cancelled per member: logged and skipped, never fatal.

pub mod tar;
pub mod zip;

use std::io::Read;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    File,
    Dir,
    Link,
}

/// One archive member, borrowed from the adapter for the duration of the
/// callback.
pub struct Member<'a> {
    pub path: PathBuf,
    pub kind: MemberKind,
    /// Modification time from the archive metadata, unix seconds
    pub mtime: Option<i64>,
    /// Readable content; `Some` only for `File`
    pub data: Option<&'a mut dyn Read>,
    /// Link target; `Some` only for `Link`
    pub link_target: Option<PathBuf>,
}

/// Compression wrapped around a tar body, decided by filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
    Xz,
    /// Recognized by extension but with no decoder available
    Lzip,
}
