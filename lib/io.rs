//! Helpers for moving bytes and entries through tree streams.

use bytes::{Bytes, BytesMut};
use futures::{StreamExt as _, TryStreamExt as _, stream};

use crate::dir::Dir;
use crate::error::Result;
use crate::tree::{ByteStream, Tree};

/// A stream yielding `data` once. Empty data yields nothing.
pub fn once(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    if data.is_empty() {
        return empty();
    }
    stream::once(async move { Ok(data) }).boxed()
}

/// A stream with no data.
pub fn empty() -> ByteStream {
    stream::empty().boxed()
}

/// A stream yielding each entry packed as its own message.
pub fn dirs(ds: Vec<Dir>) -> ByteStream {
    stream::iter(ds.into_iter().map(|d| Ok(d.pack()))).boxed()
}

/// Concatenates every message in `s`.
pub async fn collect(s: ByteStream) -> Result<Bytes> {
    let buf = s
        .try_fold(BytesMut::new(), |mut buf, chunk| async move {
            buf.extend_from_slice(&chunk);
            Ok(buf)
        })
        .await?;
    Ok(buf.freeze())
}

/// Decodes every entry carried by `s`.
pub async fn collect_dirs(mut s: ByteStream) -> Result<Vec<Dir>> {
    let mut ds = Vec::new();
    while let Some(msg) = s.next().await {
        ds.extend(Dir::unpack_all(&msg?)?);
    }
    Ok(ds)
}

/// The whole contents of the file at `path`.
pub async fn get_all<T: Tree>(tree: &T, path: &str) -> Result<Bytes> {
    collect(tree.get(path, 0, None, "").await?).await
}

/// The entries of the directory at `path`.
pub async fn get_dir<T: Tree>(tree: &T, path: &str) -> Result<Vec<Dir>> {
    collect_dirs(tree.get(path, 0, None, "").await?).await
}

/// Writes `data` as the whole contents of `path`, creating it with the attributes in `d`.
pub async fn put_all<T: Tree>(tree: &T, path: &str, d: Dir, data: impl Into<Bytes>) -> Result<Dir> {
    tree.put(path, d, 0, once(data), "").await
}
