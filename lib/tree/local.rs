//! A tree over a directory of the host filesystem.
//!
//! File data, permission bits and modification times live on disk. User attributes (`Uid`,
//! `Gid`, `Sum`, ...) are kept in memory next to the tree and are lost when it is dropped.
//! The tree has no `/Chg`, so a caching engine over it falls back to polling.

use std::os::unix::fs::PermissionsExt as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use futures::{StreamExt as _, stream};
use scc::HashMap as ConcurrentHashMap;
use tokio::io::{AsyncSeekExt as _, AsyncWriteExt as _};
use tracing::{debug, warn};

use crate::dir::{Dir, is_upper_attr, time_string};
use crate::error::{Error, Result};
use crate::io;
use crate::path::{self, abs_path};
use crate::pred::Pred;
use crate::tree::{ByteStream, DirStream, Tree};

/// A tree rooted at a host directory. Clones share the attribute overlay.
#[derive(Clone)]
pub struct LocalTree {
    name: Arc<str>,
    root: Arc<PathBuf>,
    attrs: Arc<ConcurrentHashMap<String, Dir>>,
}

fn map_io(path: &str, e: std::io::Error) -> Error {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::NotFound => Error::NotExist(path.to_owned()),
        ErrorKind::AlreadyExists => Error::Exists(path.to_owned()),
        ErrorKind::PermissionDenied => Error::Perm(path.to_owned()),
        _ => match e.raw_os_error() {
            Some(libc::ENOTEMPTY) => Error::NotEmpty(path.to_owned()),
            Some(libc::ENOTDIR) => Error::NotDir(path.to_owned()),
            Some(libc::EISDIR) => Error::IsDir(path.to_owned()),
            Some(libc::EROFS) => Error::ReadOnly(path.to_owned()),
            _ => Error::Io(e),
        },
    }
}

impl LocalTree {
    /// A tree serving the directory at `root`, which must exist.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::NotDir(root.display().to_string()));
        }
        Ok(Self {
            name: Arc::from(name.into()),
            root: Arc::new(root),
            attrs: Arc::new(ConcurrentHashMap::new()),
        })
    }

    fn host(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    async fn load(&self, path: &str) -> Result<Dir> {
        let md = tokio::fs::symlink_metadata(self.host(path))
            .await
            .map_err(|e| map_io(path, e))?;
        let mut d = Dir::from([("path", path), ("name", path::base(path))]);
        if md.is_dir() {
            d.set("type", "d");
            let mut n = 0usize;
            let mut rd = tokio::fs::read_dir(self.host(path))
                .await
                .map_err(|e| map_io(path, e))?;
            while rd.next_entry().await.map_err(|e| map_io(path, e))?.is_some() {
                n += 1;
            }
            d.set("size", n.to_string());
        } else {
            d.set("type", "-");
            d.set("size", md.len().to_string());
        }
        d.set_mode(md.permissions().mode());
        if let Ok(t) = md.modified() {
            d.set("mtime", time_string(t));
        }
        if let Some(extra) = self.attrs.read_async(path, |_, v| v.clone()).await {
            d.merge(&extra);
        }
        Ok(d)
    }

    async fn set_user_attrs(&self, path: &str, d: &Dir) {
        use scc::hash_map::Entry;

        let upper: Vec<(&str, &str)> = d
            .iter()
            .filter(|(k, _)| is_upper_attr(k) && *k != "Mode")
            .collect();
        if upper.is_empty() {
            return;
        }
        match self.attrs.entry_async(path.to_owned()).await {
            Entry::Occupied(mut occ) => {
                for (k, v) in upper {
                    if v.is_empty() {
                        occ.get_mut().remove(k);
                    } else {
                        occ.get_mut().set(k, v);
                    }
                }
            }
            Entry::Vacant(vac) => {
                let extra: Dir = upper.into_iter().filter(|(_, v)| !v.is_empty()).collect();
                vac.insert_entry(extra);
            }
        }
    }

    async fn apply_meta(&self, path: &str, d: &Dir) -> Result<()> {
        let host = self.host(path);
        if let Some(m) = d.get("Mode").or(d.get("mode")).filter(|m| !m.is_empty()) {
            let mode = Dir::from([("mode", m)]).mode();
            tokio::fs::set_permissions(&host, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(|e| map_io(path, e))?;
        }
        let is_dir = tokio::fs::metadata(&host)
            .await
            .map_err(|e| map_io(path, e))?
            .is_dir();
        if !is_dir && (d.contains("size") || d.contains("mtime")) {
            let f = std::fs::OpenOptions::new()
                .write(true)
                .open(&host)
                .map_err(|e| map_io(path, e))?;
            if !d.attr("size").is_empty() {
                f.set_len(d.size()).map_err(|e| map_io(path, e))?;
            }
            if !d.attr("mtime").is_empty() {
                f.set_modified(d.time("mtime")).map_err(|e| map_io(path, e))?;
            }
        }
        self.set_user_attrs(path, d).await;
        Ok(())
    }

    async fn forget_subtree(&self, top: &str) -> Vec<(String, Dir)> {
        let mut keys = Vec::new();
        self.attrs
            .iter_async(|k, _| {
                if path::has_prefix(k, top) {
                    keys.push(k.clone());
                }
                true
            })
            .await;
        let mut out = Vec::new();
        for k in keys {
            if let Some(kv) = self.attrs.remove_async(&k).await {
                out.push(kv);
            }
        }
        out
    }

    async fn walk(self, top: String, pred: Pred, spref: String, dpref: String, depth: usize) -> Vec<Result<Dir>> {
        let mut out = Vec::new();
        let mut stack = vec![(top, depth)];
        while let Some((p, lvl)) = stack.pop() {
            let mut d = match self.load(&p).await {
                Ok(d) => d,
                Err(e) if lvl == depth => {
                    out.push(Err(e));
                    continue;
                }
                Err(e) => {
                    let mut d = Dir::from([("path", p.as_str()), ("name", path::base(&p))]);
                    d.set("err", e.to_string());
                    d.set("path", path::rebase(&p, &spref, &dpref));
                    out.push(Ok(d));
                    continue;
                }
            };
            let ev = pred.eval_at(&d, lvl);
            let is_dir = d.is_dir();
            if ev.matched {
                d.set("path", path::rebase(&p, &spref, &dpref));
                out.push(Ok(d));
            }
            if ev.pruned || !is_dir {
                continue;
            }
            match self.child_names(&p).await {
                Ok(mut names) => {
                    names.sort_unstable_by(|a, b| b.cmp(a));
                    stack.extend(names.into_iter().map(|n| (path::join(&p, &n), lvl + 1)));
                }
                Err(e) => warn!(path = %p, ?e, "find: cannot list directory"),
            }
        }
        out
    }

    async fn child_names(&self, path: &str) -> Result<Vec<String>> {
        let mut rd = tokio::fs::read_dir(self.host(path))
            .await
            .map_err(|e| map_io(path, e))?;
        let mut names = Vec::new();
        while let Some(ent) = rd.next_entry().await.map_err(|e| map_io(path, e))? {
            names.push(ent.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

impl Tree for LocalTree {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stat(&self, path: &str) -> Result<Dir> {
        let path = abs_path(path)?;
        self.load(&path).await
    }

    async fn get(&self, path: &str, off: u64, count: Option<u64>, pred: &str) -> Result<ByteStream> {
        let path = abs_path(path)?;
        match path.as_str() {
            "/Ctl" => {
                let report = format!("{}:\nroot\t{}\n\n", self.name, self.root.display());
                return Ok(io::once(report));
            }
            "/Chg" => return Err(Error::NotExist(path)),
            _ => {}
        }
        let d = self.load(&path).await?;
        if !pred.is_empty() && !Pred::new(pred)?.matches(&d) {
            return Err(Error::NoMatch(path));
        }
        if d.is_dir() {
            let mut ds = Vec::new();
            for name in self.child_names(&path).await? {
                ds.push(self.load(&path::join(&path, &name)).await?);
            }
            return Ok(io::dirs(ds));
        }
        let data = tokio::fs::read(self.host(&path))
            .await
            .map_err(|e| map_io(&path, e))?;
        let start = (off as usize).min(data.len());
        let end = count.map_or(data.len(), |n| start.saturating_add(n as usize).min(data.len()));
        Ok(io::once(Bytes::copy_from_slice(&data[start..end])))
    }

    async fn put(&self, path: &str, d: Dir, off: i64, data: ByteStream, pred: &str) -> Result<Dir> {
        let path = abs_path(path)?;
        if path == "/Ctl" {
            let cmd = io::collect(data).await?;
            debug!(tree = %self.name, cmd = %String::from_utf8_lossy(&cmd).trim(), "ctl ignored");
            return Ok(Dir::from([("path", "/Ctl"), ("size", "0")]));
        }
        if path == "/" {
            return Err(Error::IsDir(path));
        }
        let existing = match self.load(&path).await {
            Ok(od) => Some(od),
            Err(e) if e.is_not_exist() => None,
            Err(e) => return Err(e),
        };
        let create = d.get("Mode").or(d.get("mode")).is_some_and(|m| !m.is_empty());
        match &existing {
            Some(od) if od.is_dir() => return Err(Error::IsDir(path)),
            None if !create => return Err(Error::NotExist(path)),
            _ => {}
        }
        if !pred.is_empty() {
            let probe = existing.clone().unwrap_or_else(|| {
                Dir::from([("path", path.as_str()), ("name", path::base(&path)), ("type", "-")])
            });
            if !Pred::new(pred)?.matches(&probe) {
                return Err(Error::NoMatch(path));
            }
        }
        let bytes = io::collect(data).await?;
        let mut f = tokio::fs::OpenOptions::new()
            .write(true)
            .create(create)
            .truncate(create)
            .open(self.host(&path))
            .await
            .map_err(|e| map_io(&path, e))?;
        if !d.attr("size").is_empty() {
            f.set_len(d.size()).await.map_err(|e| map_io(&path, e))?;
        }
        let pos = if off < 0 {
            std::io::SeekFrom::End(0)
        } else {
            std::io::SeekFrom::Start(off as u64)
        };
        f.seek(pos).await.map_err(|e| map_io(&path, e))?;
        f.write_all(&bytes).await.map_err(|e| map_io(&path, e))?;
        f.flush().await.map_err(|e| map_io(&path, e))?;
        drop(f);

        let mut meta = d.clone();
        meta.remove("size");
        if meta.attr("mtime").is_empty() {
            meta.set_time("mtime", SystemTime::now());
        }
        self.apply_meta(&path, &meta).await?;
        self.load(&path).await
    }

    async fn mkdir(&self, path: &str, d: Dir) -> Result<()> {
        let path = abs_path(path)?;
        tokio::fs::create_dir(self.host(&path))
            .await
            .map_err(|e| map_io(&path, e))?;
        let mut meta = d;
        if meta.attr("mode").is_empty() && meta.attr("Mode").is_empty() {
            meta.set("mode", "0755");
        }
        meta.remove("size");
        self.apply_meta(&path, &meta).await
    }

    async fn wstat(&self, path: &str, d: Dir) -> Result<()> {
        let path = abs_path(path)?;
        self.load(&path).await?;
        self.apply_meta(&path, &d).await
    }

    async fn r#move(&self, from: &str, to: &str) -> Result<()> {
        let from = abs_path(from)?;
        let to = abs_path(to)?;
        if from == to {
            return Ok(());
        }
        if from == "/" || to == "/" {
            return Err(Error::Perm(from));
        }
        if path::has_prefix(&to, &from) {
            return Err(Error::Inconsistent(from));
        }
        tokio::fs::rename(self.host(&from), self.host(&to))
            .await
            .map_err(|e| map_io(&from, e))?;
        for (k, v) in self.forget_subtree(&from).await {
            let _ = self.attrs.insert_async(path::rebase(&k, &from, &to), v).await;
        }
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let path = abs_path(path)?;
        if path == "/" {
            return Err(Error::Perm(path));
        }
        let d = self.load(&path).await?;
        let res = if d.is_dir() {
            tokio::fs::remove_dir(self.host(&path)).await
        } else {
            tokio::fs::remove_file(self.host(&path)).await
        };
        res.map_err(|e| map_io(&path, e))?;
        self.forget_subtree(&path).await;
        Ok(())
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        let path = abs_path(path)?;
        if path == "/" {
            return Err(Error::Perm(path));
        }
        let d = self.load(&path).await?;
        let res = if d.is_dir() {
            tokio::fs::remove_dir_all(self.host(&path)).await
        } else {
            tokio::fs::remove_file(self.host(&path)).await
        };
        res.map_err(|e| map_io(&path, e))?;
        self.forget_subtree(&path).await;
        Ok(())
    }

    fn find(&self, path: &str, pred: &str, spref: &str, dpref: &str, depth: usize) -> DirStream {
        let start = abs_path(path).and_then(|p| Ok((p, Pred::new(pred)?)));
        let (top, pred) = match start {
            Ok(v) => v,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        let walk = self
            .clone()
            .walk(top, pred, spref.to_owned(), dpref.to_owned(), depth);
        stream::once(walk).flat_map(stream::iter).boxed()
    }

    async fn close(&self) {
        debug!(tree = %self.name, "closed");
    }
}
