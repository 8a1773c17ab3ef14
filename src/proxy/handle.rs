use parking_lot::Mutex;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Access mode requested at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read the shared cache copy directly.
    ReadOnly,
    /// Write through a private copy; the file must already exist.
    WriteOnly,
    /// Write through a private copy, creating the file if absent.
    CreateIfMissing,
    /// Write through a private copy; the file must not already exist.
    CreateExclusive,
}

/// Reference point for `lseek`.
///
/// `FromEnd` positions at `length - offset`, not `length + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    FromStart,
    FromCurrent,
    FromEnd,
}

/// One successful `open`: the descriptor table maps fd -> OpenFile.
///
/// Writers never hold the shared cache location; `backing` is their private
/// per-descriptor copy and `private_path` remembers it for the merge at
/// close. The stream is `None` for a read-only open of a directory, whose
/// reads then fail `IsDirectory`.
///
/// `wrote` records whether this descriptor itself wrote. The cache entry's
/// `modified` flag is shared by every open descriptor on the path, so an
/// earlier close clearing it must not swallow a later writer's push.
#[derive(Debug)]
pub(crate) struct OpenFile {
    pub path: String,
    pub backing: PathBuf,
    pub read_only: bool,
    pub is_dir: bool,
    pub private_path: Option<PathBuf>,
    pub file: Option<Arc<Mutex<File>>>,
    pub wrote: AtomicBool,
}
