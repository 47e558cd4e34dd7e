//! A tree kept entirely in memory.
//!
//! Used as the cache tree by the binary and as both cache and backing tree in tests. It does no
//! permission checking. When built [`with_changes`](MemTree::with_changes) it serves a `/Chg`
//! stream announcing every change made to it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use futures::StreamExt as _;
use futures::channel::mpsc;
use futures::stream;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::dir::{CACHE, Dir, RTIME, is_upper_attr};
use crate::error::{Error, Result};
use crate::io;
use crate::path::{self, abs_path};
use crate::pred::Pred;
use crate::tree::{ByteStream, DirStream, Tree};

/// Version token opening every `/Chg` stream.
pub const CHG_VERSION: &str = "leasing1.0";

const CHG_BUFFER: usize = 64;

/// Most file data a put may leave stored.
pub const MAX_FILE_SIZE: u64 = 1 << 30;

/// For files, `data` never outgrows the `size` attribute. The rest reads as zeros, so growing the
/// size through attributes stores nothing.
struct Node {
    d: Dir,
    data: Vec<u8>,
}

struct Inner {
    name: String,
    files: Mutex<BTreeMap<String, Node>>,
    read_only: AtomicBool,
    closed: AtomicBool,
    changes: bool,
    readers: Mutex<Vec<mpsc::Sender<Result<Bytes>>>>,
    ctl_log: Mutex<Vec<String>>,
}

/// An in-memory tree. Clones share the same files.
#[derive(Clone)]
pub struct MemTree {
    inner: Arc<Inner>,
}

impl MemTree {
    /// An empty tree holding only `/`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), false)
    }

    /// An empty tree that announces its changes on `/Chg`.
    pub fn with_changes(name: impl Into<String>) -> Self {
        Self::build(name.into(), true)
    }

    fn build(name: String, changes: bool) -> Self {
        let mut root = Dir::from([
            ("path", "/"),
            ("name", "/"),
            ("type", "d"),
            ("mode", "0755"),
            ("size", "0"),
        ]);
        root.set_time("mtime", SystemTime::now());
        let mut files = BTreeMap::new();
        files.insert(
            "/".to_owned(),
            Node {
                d: root,
                data: Vec::new(),
            },
        );
        Self {
            inner: Arc::new(Inner {
                name,
                files: Mutex::new(files),
                read_only: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                changes,
                readers: Mutex::new(Vec::new()),
                ctl_log: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Makes every later mutation fail with [`Error::ReadOnly`].
    pub fn set_read_only(&self, ro: bool) {
        self.inner.read_only.store(ro, Ordering::Relaxed);
    }

    /// Commands written to `/Ctl`, oldest first.
    pub fn ctl_log(&self) -> Vec<String> {
        self.inner.ctl_log.lock().clone()
    }

    /// Number of readers currently attached to `/Chg`.
    pub fn chg_readers(&self) -> usize {
        self.inner.readers.lock().len()
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(Error::Closed(self.inner.name.clone()));
        }
        Ok(())
    }

    fn check_writable(&self, path: &str) -> Result<()> {
        self.check_open()?;
        if self.inner.read_only.load(Ordering::Relaxed) {
            return Err(Error::ReadOnly(path.to_owned()));
        }
        Ok(())
    }

    /// Announces `d` to every `/Chg` reader, dropping readers that cannot take it.
    fn post(&self, d: &Dir) {
        if !self.inner.changes {
            return;
        }
        let mut cd = d.usr_attrs();
        cd.strip_cache_attrs();
        for k in ["path", "name", "type", "Sum", "rm"] {
            if let Some(v) = d.get(k) {
                cd.set(k, v);
            }
        }
        let msg = cd.pack();
        self.inner
            .readers
            .lock()
            .retain_mut(|tx| tx.try_send(Ok(msg.clone())).is_ok());
        trace!(tree = %self.inner.name, change = %cd, "posted change");
    }

    fn open_chg(&self) -> Result<ByteStream> {
        if !self.inner.changes {
            return Err(Error::NotExist("/Chg".to_owned()));
        }
        let (mut tx, rx) = mpsc::channel(CHG_BUFFER);
        tx.try_send(Ok(Bytes::from_static(CHG_VERSION.as_bytes())))
            .map_err(|_| Error::Closed(self.inner.name.clone()))?;
        self.inner.readers.lock().push(tx);
        debug!(tree = %self.inner.name, "new /Chg reader");
        Ok(rx.boxed())
    }

    fn find_snapshot(
        &self,
        path: &str,
        pred: &str,
        spref: &str,
        dpref: &str,
        depth: usize,
    ) -> Result<Vec<Dir>> {
        self.check_open()?;
        let path = abs_path(path)?;
        let pred = Pred::new(pred)?;
        let files = self.inner.files.lock();
        if !files.contains_key(&path) {
            return Err(Error::NotExist(path));
        }
        let mut out = Vec::new();
        find_in(&files, &path, &pred, spref, dpref, depth, &mut out);
        Ok(out)
    }

    fn ctl_report(&self) -> String {
        let files = self.inner.files.lock();
        let ro = self.inner.read_only.load(Ordering::Relaxed);
        format!(
            "{}:\nfiles\t{}\nrdonly\t{}\nchg readers\t{}\n\n",
            self.inner.name,
            files.len(),
            ro,
            self.inner.readers.lock().len()
        )
    }
}

fn children<'a>(
    files: &'a BTreeMap<String, Node>,
    dir: &'a str,
) -> impl Iterator<Item = (&'a String, &'a Node)> + 'a {
    let prefix = if dir == "/" {
        "/".to_owned()
    } else {
        format!("{dir}/")
    };
    files
        .range(prefix.clone()..)
        .take_while(move |(k, _)| k.starts_with(&prefix))
        .filter(move |(k, _)| k.as_str() != "/" && path::parent(k) == dir)
}

fn adjust_size(files: &mut BTreeMap<String, Node>, dir: &str, delta: i64) {
    if let Some(n) = files.get_mut(dir) {
        let size = (n.d.size() as i64 + delta).max(0);
        n.d.set("size", size.to_string());
        n.d.set_time("mtime", SystemTime::now());
    }
}

fn parent_dir<'a>(files: &'a BTreeMap<String, Node>, p: &str) -> Result<&'a Node> {
    let pp = path::parent(p);
    let n = files
        .get(pp)
        .ok_or_else(|| Error::NotExist(pp.to_owned()))?;
    if !n.d.is_dir() {
        return Err(Error::NotDir(pp.to_owned()));
    }
    Ok(n)
}

/// Applies the settable attributes of `d` to `n`. Returns true if `mtime` was given.
fn apply_attrs(n: &mut Node, d: &Dir) -> bool {
    let mut mtime = false;
    for (k, v) in d.iter() {
        match k {
            "mode" | "Mode" if !v.is_empty() => {
                let mode = Dir::from([("mode", v)]).mode();
                n.d.set_mode(mode);
            }
            "size" if !v.is_empty() && !n.d.is_dir() => {
                let size = d.size();
                n.data.truncate(to_usize(size));
                n.d.set("size", size.to_string());
            }
            "mtime" if !v.is_empty() => {
                n.d.set("mtime", v);
                mtime = true;
            }
            k if is_upper_attr(k) && k != "Mode" => {
                if v.is_empty() {
                    n.d.remove(k);
                } else {
                    n.d.set(k, v);
                }
            }
            _ => {}
        }
    }
    mtime
}

fn to_usize(v: u64) -> usize {
    usize::try_from(v).unwrap_or(usize::MAX)
}

fn slice(data: &[u8], off: u64, count: Option<u64>) -> Bytes {
    let start = to_usize(off).min(data.len());
    let end = count.map_or(data.len(), |n| start.saturating_add(to_usize(n)).min(data.len()));
    Bytes::copy_from_slice(&data[start..end])
}

/// Reads a file within its `size`, zero filling past the stored data.
fn read_at(n: &Node, off: u64, count: Option<u64>) -> Bytes {
    let size = n.d.size();
    let start = off.min(size);
    let end = count
        .map_or(size, |c| start.saturating_add(c).min(size))
        .min(start.saturating_add(MAX_FILE_SIZE));
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&slice(&n.data, start, Some(end - start)));
    buf.resize(to_usize(end - start), 0);
    buf.freeze()
}

impl Tree for MemTree {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn stat(&self, path: &str) -> Result<Dir> {
        self.check_open()?;
        let path = abs_path(path)?;
        let files = self.inner.files.lock();
        files
            .get(&path)
            .map(|n| n.d.clone())
            .ok_or(Error::NotExist(path))
    }

    async fn get(&self, path: &str, off: u64, count: Option<u64>, pred: &str) -> Result<ByteStream> {
        self.check_open()?;
        let path = abs_path(path)?;
        match path.as_str() {
            "/Ctl" => {
                return Ok(io::once(slice(self.ctl_report().as_bytes(), off, count)));
            }
            "/Chg" => return self.open_chg(),
            _ => {}
        }
        let files = self.inner.files.lock();
        let n = files.get(&path).ok_or_else(|| Error::NotExist(path.clone()))?;
        if !pred.is_empty() && !Pred::new(pred)?.matches(&n.d) {
            return Err(Error::NoMatch(path));
        }
        if n.d.is_dir() {
            let ds = children(&files, &path).map(|(_, c)| c.d.clone()).collect();
            return Ok(io::dirs(ds));
        }
        Ok(io::once(read_at(n, off, count)))
    }

    async fn put(&self, path: &str, d: Dir, off: i64, data: ByteStream, pred: &str) -> Result<Dir> {
        let path = abs_path(path)?;
        if path == "/Ctl" {
            self.check_open()?;
            let cmd = io::collect(data).await?;
            let cmd = String::from_utf8_lossy(&cmd).trim().to_owned();
            debug!(tree = %self.inner.name, %cmd, "ctl");
            self.inner.ctl_log.lock().push(cmd);
            return Ok(Dir::from([("path", "/Ctl"), ("size", "0")]));
        }
        self.check_writable(&path)?;
        if path == "/" {
            return Err(Error::IsDir(path));
        }
        let bytes = io::collect(data).await?;

        let mut files = self.inner.files.lock();
        parent_dir(&files, &path)?;
        let mode = d.get("Mode").or(d.get("mode")).filter(|m| !m.is_empty());
        let len = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        let created = match files.get(&path) {
            Some(n) if n.d.is_dir() => return Err(Error::IsDir(path)),
            Some(n) => {
                if !pred.is_empty() && !Pred::new(pred)?.matches(&n.d) {
                    return Err(Error::NoMatch(path));
                }
                false
            }
            None => {
                if mode.is_none() {
                    return Err(Error::NotExist(path));
                }
                let nd = Dir::from([
                    ("path", path.as_str()),
                    ("name", path::base(&path)),
                    ("type", "-"),
                ]);
                if !pred.is_empty() && !Pred::new(pred)?.matches(&nd) {
                    return Err(Error::NoMatch(path));
                }
                true
            }
        };
        if created {
            let mut nd = Dir::from([
                ("path", path.as_str()),
                ("name", path::base(&path)),
                ("type", "-"),
                ("size", "0"),
            ]);
            nd.set_time("mtime", SystemTime::now());
            files.insert(
                path.clone(),
                Node {
                    d: nd,
                    data: Vec::new(),
                },
            );
            adjust_size(&mut files, path::parent(&path), 1);
        }
        let Some(n) = files.get_mut(&path) else {
            return Err(Error::NotExist(path));
        };
        let size = match d.get("size").filter(|v| !v.is_empty()) {
            Some(_) => d.size(),
            None if mode.is_some() => 0,
            None => n.d.size(),
        };
        let at = if off < 0 {
            size
        } else {
            u64::try_from(off).unwrap_or(u64::MAX)
        };
        let end = match at.checked_add(len) {
            Some(end) if end <= MAX_FILE_SIZE => end,
            _ => {
                if created {
                    files.remove(&path);
                    adjust_size(&mut files, path::parent(&path), -1);
                }
                return Err(Error::TooLarge(path));
            }
        };
        if mode.is_some() {
            n.data.clear();
            n.d.set("size", "0");
        }
        let explicit_mtime = apply_attrs(n, &d);
        let (at, end) = (to_usize(at), to_usize(end));
        if n.data.len() < end {
            n.data.resize(end, 0);
        }
        n.data[at..end].copy_from_slice(&bytes);
        let size = n.d.size().max(u64::try_from(end).unwrap_or(u64::MAX));
        n.d.set("size", size.to_string());
        if !explicit_mtime {
            n.d.set_time("mtime", SystemTime::now());
        }
        let rd = n.d.clone();
        drop(files);
        self.post(&rd);
        Ok(rd)
    }

    async fn mkdir(&self, path: &str, d: Dir) -> Result<()> {
        let path = abs_path(path)?;
        self.check_writable(&path)?;
        let mut files = self.inner.files.lock();
        if files.contains_key(&path) {
            return Err(Error::Exists(path));
        }
        parent_dir(&files, &path)?;
        let mut n = Node {
            d: Dir::from([
                ("path", path.as_str()),
                ("name", path::base(&path)),
                ("type", "d"),
                ("mode", "0755"),
                ("size", "0"),
            ]),
            data: Vec::new(),
        };
        n.d.set_time("mtime", SystemTime::now());
        apply_attrs(&mut n, &d);
        let nd = n.d.clone();
        files.insert(path.clone(), n);
        adjust_size(&mut files, path::parent(&path), 1);
        drop(files);
        self.post(&nd);
        Ok(())
    }

    async fn wstat(&self, path: &str, d: Dir) -> Result<()> {
        let path = abs_path(path)?;
        self.check_writable(&path)?;
        let mut files = self.inner.files.lock();
        let n = files
            .get_mut(&path)
            .ok_or_else(|| Error::NotExist(path.clone()))?;
        apply_attrs(n, &d);
        let nd = n.d.clone();
        drop(files);
        if d.iter().any(|(k, _)| k != RTIME && k != CACHE) {
            self.post(&nd);
        }
        Ok(())
    }

    async fn r#move(&self, from: &str, to: &str) -> Result<()> {
        let from = abs_path(from)?;
        let to = abs_path(to)?;
        self.check_writable(&from)?;
        if from == to {
            return Ok(());
        }
        if from == "/" || to == "/" {
            return Err(Error::Perm(from));
        }
        if path::has_prefix(&to, &from) {
            return Err(Error::Inconsistent(from));
        }
        let mut files = self.inner.files.lock();
        let src_is_dir = files
            .get(&from)
            .ok_or_else(|| Error::NotExist(from.clone()))?
            .d
            .is_dir();
        parent_dir(&files, &to)?;
        if let Some(dst) = files.get(&to) {
            if dst.d.is_dir() || src_is_dir {
                return Err(Error::Exists(to));
            }
            files.remove(&to);
            adjust_size(&mut files, path::parent(&to), -1);
        }
        let moved: Vec<String> = files
            .range(from.clone()..)
            .take_while(|(k, _)| k.starts_with(&from))
            .filter(|(k, _)| path::has_prefix(k, &from))
            .map(|(k, _)| k.clone())
            .collect();
        let mut gone = Dir::new();
        for k in moved {
            let Some(mut n) = files.remove(&k) else {
                continue;
            };
            if k == from {
                gone = n.d.clone();
            }
            let nk = path::rebase(&k, &from, &to);
            n.d.set("path", nk.as_str());
            n.d.set("name", path::base(&nk));
            files.insert(nk, n);
        }
        adjust_size(&mut files, path::parent(&from), -1);
        adjust_size(&mut files, path::parent(&to), 1);
        let came = files.get(&to).map(|n| n.d.clone());
        drop(files);
        gone.set("rm", "y");
        self.post(&gone);
        if let Some(d) = came {
            self.post(&d);
        }
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let path = abs_path(path)?;
        self.check_writable(&path)?;
        if path == "/" {
            return Err(Error::Perm(path));
        }
        let mut files = self.inner.files.lock();
        let n = files.get(&path).ok_or_else(|| Error::NotExist(path.clone()))?;
        if n.d.is_dir() && children(&files, &path).next().is_some() {
            return Err(Error::NotEmpty(path));
        }
        let Some(mut n) = files.remove(&path) else {
            return Err(Error::NotExist(path));
        };
        adjust_size(&mut files, path::parent(&path), -1);
        drop(files);
        n.d.set("rm", "y");
        self.post(&n.d);
        Ok(())
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        let path = abs_path(path)?;
        self.check_writable(&path)?;
        if path == "/" {
            return Err(Error::Perm(path));
        }
        let mut files = self.inner.files.lock();
        let Some(mut top) = files.remove(&path) else {
            return Err(Error::NotExist(path));
        };
        files.retain(|k, _| !path::has_prefix(k, &path));
        adjust_size(&mut files, path::parent(&path), -1);
        drop(files);
        top.d.set("rm", "y");
        self.post(&top.d);
        Ok(())
    }

    fn find(&self, path: &str, pred: &str, spref: &str, dpref: &str, depth: usize) -> DirStream {
        match self.find_snapshot(path, pred, spref, dpref, depth) {
            Ok(ds) => stream::iter(ds.into_iter().map(Ok)).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        self.inner.readers.lock().clear();
        debug!(tree = %self.inner.name, "closed");
    }
}

fn find_in(
    files: &BTreeMap<String, Node>,
    p: &str,
    pred: &Pred,
    spref: &str,
    dpref: &str,
    depth: usize,
    out: &mut Vec<Dir>,
) {
    let Some(n) = files.get(p) else {
        return;
    };
    let ev = pred.eval_at(&n.d, depth);
    if ev.matched {
        let mut d = n.d.clone();
        d.set("path", path::rebase(p, spref, dpref));
        out.push(d);
    }
    if ev.pruned || !n.d.is_dir() {
        return;
    }
    let kids: Vec<&String> = children(files, p).map(|(k, _)| k).collect();
    for k in kids {
        find_in(files, k, pred, spref, dpref, depth + 1, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{get_all, get_dir, put_all};
    use crate::tree::APPEND;
    use futures::StreamExt as _;

    fn file(mode: &str) -> Dir {
        Dir::from([("mode", mode)])
    }

    #[tokio::test]
    async fn put_get_and_listing() {
        let t = MemTree::new("mem");
        t.mkdir("/a", Dir::new()).await.unwrap();
        put_all(&t, "/a/f", file("0644"), "hello").await.unwrap();

        assert_eq!(get_all(&t, "/a/f").await.unwrap(), Bytes::from("hello"));
        let ds = get_dir(&t, "/a").await.unwrap();
        assert_eq!(ds.len(), 1);
        assert_eq!(ds[0].path(), "/a/f");
        assert_eq!(t.stat("/a").await.unwrap().size(), 1);
        assert_eq!(t.stat("/a/f").await.unwrap().size(), 5);
    }

    #[tokio::test]
    async fn put_without_mode_needs_existing_file() {
        let t = MemTree::new("mem");
        let err = put_all(&t, "/nope", Dir::new(), "x").await.unwrap_err();
        assert!(err.is_not_exist());

        put_all(&t, "/f", file("0644"), "hello").await.unwrap();
        t.put("/f", Dir::new(), APPEND, io::once("!"), "")
            .await
            .unwrap();
        t.put("/f", Dir::new(), 0, io::once("J"), "").await.unwrap();
        assert_eq!(get_all(&t, "/f").await.unwrap(), Bytes::from("Jello!"));
    }

    #[tokio::test]
    async fn writes_past_the_limit_are_refused() {
        let t = MemTree::new("mem");
        put_all(&t, "/f", file("0644"), "abc").await.unwrap();
        let err = t
            .put("/f", Dir::new(), i64::MAX, io::once("z"), "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TooLarge(_)), "{err}");
        let off = i64::try_from(MAX_FILE_SIZE).unwrap();
        let err = t
            .put("/f", Dir::new(), off, io::once("z"), "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TooLarge(_)), "{err}");
        assert_eq!(get_all(&t, "/f").await.unwrap(), Bytes::from("abc"));

        let err = t
            .put("/g", file("0644"), i64::MAX, io::once("z"), "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TooLarge(_)), "{err}");
        assert!(t.stat("/g").await.unwrap_err().is_not_exist());
        assert_eq!(t.stat("/").await.unwrap().size(), 1);
    }

    #[tokio::test]
    async fn size_changes_store_no_data() {
        let t = MemTree::new("mem");
        put_all(&t, "/f", file("0644"), "ab").await.unwrap();
        let huge = 10u64 << 30;
        let grown = huge.to_string();
        t.wstat("/f", Dir::from([("size", grown.as_str())]))
            .await
            .unwrap();
        assert_eq!(t.stat("/f").await.unwrap().size(), huge);
        let b = io::collect(t.get("/f", 0, Some(4), "").await.unwrap())
            .await
            .unwrap();
        assert_eq!(b, Bytes::from_static(b"ab\0\0"));
        let b = io::collect(t.get("/f", huge - 1, None, "").await.unwrap())
            .await
            .unwrap();
        assert_eq!(b, Bytes::from_static(b"\0"));

        // A placeholder for a large file costs nothing until data is put.
        let d = Dir::from([("mode", "0644"), ("size", grown.as_str())]);
        put_all(&t, "/big", d, Bytes::new()).await.unwrap();
        assert_eq!(t.stat("/big").await.unwrap().size(), huge);

        t.wstat("/f", Dir::from([("size", "1")])).await.unwrap();
        assert_eq!(get_all(&t, "/f").await.unwrap(), Bytes::from("a"));
    }

    #[tokio::test]
    async fn reads_past_the_end_are_empty() {
        let t = MemTree::new("mem");
        put_all(&t, "/f", file("0644"), "abc").await.unwrap();
        let b = io::collect(t.get("/f", u64::MAX, Some(u64::MAX), "").await.unwrap())
            .await
            .unwrap();
        assert!(b.is_empty());
        let b = io::collect(t.get("/f", 1, Some(u64::MAX), "").await.unwrap())
            .await
            .unwrap();
        assert_eq!(b, Bytes::from("bc"));
    }

    #[tokio::test]
    async fn put_keeps_explicit_mtime_and_user_attrs() {
        let t = MemTree::new("mem");
        let d = Dir::from([("mode", "0640"), ("mtime", "42"), ("Uid", "nemo")]);
        let rd = put_all(&t, "/f", d, "x").await.unwrap();
        assert_eq!(rd.attr("mtime"), "42");
        assert_eq!(rd.attr("Uid"), "nemo");
        assert_eq!(rd.attr("mode"), "0640");
    }

    #[tokio::test]
    async fn move_renames_subtree() {
        let t = MemTree::new("mem");
        t.mkdir("/a", Dir::new()).await.unwrap();
        t.mkdir("/b", Dir::new()).await.unwrap();
        put_all(&t, "/a/f", file("0644"), "x").await.unwrap();

        t.r#move("/a", "/b/a").await.unwrap();
        assert!(t.stat("/a").await.unwrap_err().is_not_exist());
        let d = t.stat("/b/a/f").await.unwrap();
        assert_eq!(d.name(), "f");
        assert!(matches!(
            t.r#move("/b", "/b/a/x").await,
            Err(Error::Inconsistent(_))
        ));
    }

    #[tokio::test]
    async fn remove_rules() {
        let t = MemTree::new("mem");
        t.mkdir("/d", Dir::new()).await.unwrap();
        put_all(&t, "/d/f", file("0644"), "x").await.unwrap();
        assert!(matches!(t.remove("/d").await, Err(Error::NotEmpty(_))));
        t.remove_all("/d").await.unwrap();
        assert!(t.remove_all("/d").await.unwrap_err().is_not_exist());
        assert!(t.stat("/d/f").await.unwrap_err().is_not_exist());
        assert_eq!(t.stat("/").await.unwrap().size(), 0);
    }

    #[tokio::test]
    async fn read_only_rejects_writes() {
        let t = MemTree::new("mem");
        t.set_read_only(true);
        assert!(t.mkdir("/d", Dir::new()).await.unwrap_err().is_read_only());
        assert!(t.stat("/").await.is_ok());
    }

    #[tokio::test]
    async fn chg_announces_changes() {
        let t = MemTree::with_changes("mem");
        let mut chg = t.get("/Chg", 0, None, "").await.unwrap();
        assert_eq!(chg.next().await.unwrap().unwrap(), Bytes::from(CHG_VERSION));

        put_all(&t, "/f", file("0644"), "x").await.unwrap();
        t.remove("/f").await.unwrap();

        let msg = chg.next().await.unwrap().unwrap();
        let (d, _) = Dir::unpack(&msg).unwrap();
        assert_eq!(d.path(), "/f");
        assert!(!d.is_removed());
        let msg = chg.next().await.unwrap().unwrap();
        let (d, _) = Dir::unpack(&msg).unwrap();
        assert!(d.is_removed());
    }

    #[tokio::test]
    async fn chg_needs_changes_enabled() {
        let t = MemTree::new("mem");
        assert!(t.get("/Chg", 0, None, "").await.is_err());
    }

    #[tokio::test]
    async fn find_walks_in_order_with_prefixes() {
        let t = MemTree::new("mem");
        t.mkdir("/a", Dir::new()).await.unwrap();
        put_all(&t, "/a/x", file("0644"), "1").await.unwrap();
        put_all(&t, "/a.b", file("0644"), "1").await.unwrap();

        let ds: Vec<Dir> = t
            .find("/a", "", "/a", "/m", 0)
            .map(|r| r.unwrap())
            .collect()
            .await;
        let paths: Vec<&str> = ds.iter().map(Dir::path).collect();
        assert_eq!(paths, vec!["/m", "/m/x"]);

        let ds: Vec<Dir> = t
            .find("/", "type=-", "/", "/", 0)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(ds.len(), 2);
    }
}
