//! The tree interface shared by cache trees, backing trees and the caching engine itself.

/// A tree over a host directory.
pub mod local;
/// An in-memory tree.
pub mod mem;

use std::future::Future;

use bytes::Bytes;
use futures::StreamExt as _;
use futures::stream::BoxStream;

use crate::dir::Dir;
use crate::error::Result;
use crate::path;

pub use local::LocalTree;
pub use mem::MemTree;

/// File data, or packed `Dir`s (one per item) for directories.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Entries produced by `find`.
pub type DirStream = BoxStream<'static, Result<Dir>>;

/// Entries produced by `find_get`.
pub type DirDataStream = BoxStream<'static, Result<DirData>>;

/// Put offset meaning "append at the end".
pub const APPEND: i64 = -1;

/// A found entry together with its contents.
pub struct DirData {
    /// The entry.
    pub dir: Dir,
    /// File contents, for regular files found without error.
    pub data: Option<ByteStream>,
}

/// A hierarchical file tree addressed by absolute paths.
///
/// Every stream returned is independent of the tree's locks; dropping it early tells the
/// producer to stop.
pub trait Tree: Clone + Send + Sync + 'static {
    /// Name used in logs and `/Ctl` reports.
    fn name(&self) -> &str;

    /// The entry at `path`.
    fn stat(&self, path: &str) -> impl Future<Output = Result<Dir>> + Send;

    /// Reads `count` bytes (all if `None`) at `off`. Directories yield packed entries.
    /// A non-empty `pred` must match the entry.
    fn get(
        &self,
        path: &str,
        off: u64,
        count: Option<u64>,
        pred: &str,
    ) -> impl Future<Output = Result<ByteStream>> + Send;

    /// Writes `data` at `off` ([`APPEND`] appends).
    ///
    /// A `mode` in `d` creates the file, or truncates it when it exists. A `size` in `d`
    /// truncates before writing. Other settable attributes in `d` are applied. Returns the
    /// resulting entry.
    fn put(
        &self,
        path: &str,
        d: Dir,
        off: i64,
        data: ByteStream,
        pred: &str,
    ) -> impl Future<Output = Result<Dir>> + Send;

    /// Creates a directory with the attributes in `d`.
    fn mkdir(&self, path: &str, d: Dir) -> impl Future<Output = Result<()>> + Send;

    /// Updates attributes. Empty values remove user attributes.
    fn wstat(&self, path: &str, d: Dir) -> impl Future<Output = Result<()>> + Send;

    /// Renames `from` to `to`.
    fn r#move(&self, from: &str, to: &str) -> impl Future<Output = Result<()>> + Send;

    /// Removes a file or an empty directory.
    fn remove(&self, path: &str) -> impl Future<Output = Result<()>> + Send;

    /// Removes a file or a whole subtree.
    fn remove_all(&self, path: &str) -> impl Future<Output = Result<()>> + Send;

    /// Walks the subtree at `path`, yielding entries matching `pred`. Paths are rewritten from
    /// under `spref` to under `dpref`; `depth` is the level of `path` itself. Per-entry failures
    /// come back as entries carrying an `err` attribute.
    fn find(&self, path: &str, pred: &str, spref: &str, dpref: &str, depth: usize) -> DirStream;

    /// Like [`find`](Self::find), also yielding the contents of every regular file found.
    fn find_get(
        &self,
        path: &str,
        pred: &str,
        spref: &str,
        dpref: &str,
        depth: usize,
    ) -> DirDataStream {
        let tree = self.clone();
        let (spref, dpref) = (spref.to_owned(), dpref.to_owned());
        self.find(path, pred, &spref, &dpref, depth)
            .then(move |res| {
                let tree = tree.clone();
                let src = res
                    .as_ref()
                    .map(|d| path::rebase(d.path(), &dpref, &spref))
                    .unwrap_or_default();
                async move {
                    let dir = res?;
                    let data = if dir.attr("err").is_empty() && !dir.is_dir() {
                        Some(tree.get(&src, 0, None, "").await?)
                    } else {
                        None
                    };
                    Ok(DirData { dir, data })
                }
            })
            .boxed()
    }

    /// Releases the tree. Further calls may fail.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
