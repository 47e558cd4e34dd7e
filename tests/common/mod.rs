#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::TryStreamExt as _;
use zx_cfs::tree::{ByteStream, DirStream};
use zx_cfs::{Cfs, CfsOptions, Dir, MemTree, Result, Tree, Tuning};

/// A backing tree that counts the calls made to it.
#[derive(Clone)]
pub struct CountingTree {
    pub inner: MemTree,
    calls: Arc<Mutex<HashMap<&'static str, usize>>>,
}

impl CountingTree {
    pub fn new(inner: MemTree) -> Self {
        Self {
            inner,
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn hit(&self, op: &'static str) {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    /// Calls that would change the tree.
    pub fn mutations(&self) -> usize {
        ["put", "mkdir", "wstat", "move", "remove", "remove_all"]
            .iter()
            .map(|op| self.calls(op))
            .sum()
    }

    pub fn reset(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl Tree for CountingTree {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn stat(&self, path: &str) -> Result<Dir> {
        self.hit("stat");
        self.inner.stat(path).await
    }

    async fn get(&self, path: &str, off: u64, count: Option<u64>, pred: &str) -> Result<ByteStream> {
        self.hit("get");
        self.inner.get(path, off, count, pred).await
    }

    async fn put(&self, path: &str, d: Dir, off: i64, data: ByteStream, pred: &str) -> Result<Dir> {
        self.hit("put");
        self.inner.put(path, d, off, data, pred).await
    }

    async fn mkdir(&self, path: &str, d: Dir) -> Result<()> {
        self.hit("mkdir");
        self.inner.mkdir(path, d).await
    }

    async fn wstat(&self, path: &str, d: Dir) -> Result<()> {
        self.hit("wstat");
        self.inner.wstat(path, d).await
    }

    async fn r#move(&self, from: &str, to: &str) -> Result<()> {
        self.hit("move");
        self.inner.r#move(from, to).await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.hit("remove");
        self.inner.remove(path).await
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        self.hit("remove_all");
        self.inner.remove_all(path).await
    }

    fn find(&self, path: &str, pred: &str, spref: &str, dpref: &str, depth: usize) -> DirStream {
        self.hit("find");
        self.inner.find(path, pred, spref, dpref, depth)
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

/// Short timers so tests see staleness and syncs quickly.
pub fn fast_tuning() -> Tuning {
    Tuning {
        cache_tout: Duration::from_millis(200),
        poll_ival: Duration::from_secs(3600),
        ival_tout: Duration::from_millis(300),
        sync_delay: Duration::from_millis(50),
        max_sync_delay: Duration::from_millis(200),
        nsyncers: 2,
    }
}

pub fn opts() -> CfsOptions {
    CfsOptions {
        trace_locks: true,
        tuning: fast_tuning(),
        ..CfsOptions::default()
    }
}

pub struct Fixture<B: Tree> {
    pub fs: Cfs<MemTree, B>,
    pub cache: MemTree,
    pub backing: B,
}

/// A CFS over a fresh memory cache and `backing`.
pub async fn cfs_over<B: Tree>(backing: B, opts: CfsOptions) -> Fixture<B> {
    let cache = MemTree::new("cache");
    let fs = Cfs::new("cfs", cache.clone(), backing.clone(), opts)
        .await
        .unwrap();
    Fixture { fs, cache, backing }
}

/// A CFS over a counting memory backing tree.
pub async fn counted(opts: CfsOptions) -> Fixture<CountingTree> {
    cfs_over(CountingTree::new(MemTree::new("backing")), opts).await
}

pub fn file(mode: &str) -> Dir {
    Dir::from([("mode", mode)])
}

pub async fn put_str<T: Tree>(t: &T, path: &str, data: &str) -> Result<Dir> {
    zx_cfs::io::put_all(t, path, file("0644"), data.to_owned()).await
}

pub async fn get_str<T: Tree>(t: &T, path: &str) -> Result<String> {
    let b = zx_cfs::io::get_all(t, path).await?;
    Ok(String::from_utf8_lossy(&b).into_owned())
}

pub async fn find_paths<T: Tree>(t: &T, path: &str, pred: &str) -> Vec<String> {
    let ds: Vec<Dir> = t.find(path, pred, "", "", 0).try_collect().await.unwrap();
    ds.iter().map(|d| d.path().to_owned()).collect()
}

/// Polls `cond` every 10ms until it holds, panicking after `within`.
pub async fn eventually<F, Fut>(within: Duration, what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{what}: did not happen within {within:?}");
}
