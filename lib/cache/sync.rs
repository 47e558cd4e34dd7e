//! The sync proc and the per-node push of pending changes to the backing tree.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, info, warn};

use super::state::{Node, State};
use super::{CACHE, CacheInfo, UNREAD};
use crate::dir::{Dir, RTIME};
use crate::error::Result;
use crate::tree::Tree;
use crate::work::WorkPool;

/// What a sync sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Nodes pushed to the backing tree.
    pub synced: usize,
    /// Nodes found mid-write.
    pub busy: usize,
}

impl std::ops::AddAssign for SyncStats {
    fn add_assign(&mut self, o: Self) {
        self.synced += o.synced;
        self.busy += o.busy;
    }
}

#[derive(Clone)]
struct SyncCtx<C, B> {
    cache: C,
    backing: B,
    pool: WorkPool,
    verbose: bool,
}

impl<C: Tree, B: Tree> CacheInfo<C, B> {
    pub(super) async fn sync_proc(self, mut dirty: mpsc::Receiver<()>) {
        debug!("cache: sync proc started");
        let (delay, max_delay) = (self.inner.opts.sync_delay, self.inner.opts.max_sync_delay);
        'idle: loop {
            if dirty.recv().await.is_none() {
                break;
            }
            let deadline = Instant::now() + max_delay;
            loop {
                tokio::select! {
                    more = dirty.recv() => {
                        if more.is_none() {
                            break 'idle;
                        }
                    }
                    () = sleep(delay) => break,
                    () = sleep_until(deadline) => break,
                }
            }
            self.sync(false).await;
        }
        self.sync(true).await;
        self.inner.pool.wait().await;
        debug!("cache: sync proc done");
    }

    /// Pushes every pending change once no path is locked. Busy entries are skipped unless
    /// `force` is set.
    pub async fn sync(&self, force: bool) -> SyncStats {
        self.sync_then(force, async {}).await.0
    }

    /// Runs a sync and then `f`, both while no path can be locked.
    pub async fn sync_then<F, T>(&self, force: bool, f: F) -> (SyncStats, T)
    where
        F: Future<Output = T>,
    {
        let inner = &self.inner;
        inner
            .locks
            .quiescent_run(async move {
                let snapshot = inner.tree.lock().clone();
                if self.debugging() {
                    debug!("cache: pre sync:\n{}", self.dump());
                }
                let ctx = SyncCtx {
                    cache: inner.cache.clone(),
                    backing: inner.backing.clone(),
                    pool: inner.pool.clone(),
                    verbose: inner.opts.verbose.load(Ordering::Relaxed),
                };
                let (mut root, stats) = sync_node(ctx, snapshot, force).await;
                root.prune_all();
                *inner.tree.lock() = root;
                if self.debugging() {
                    debug!(
                        synced = stats.synced,
                        busy = stats.busy,
                        "cache: post sync:\n{}",
                        self.dump()
                    );
                }
                (stats, f.await)
            })
            .await
    }
}

/// Syncs `node` and then, through the pool, its children.
fn sync_node<C: Tree, B: Tree>(
    ctx: SyncCtx<C, B>,
    mut node: Node,
    force: bool,
) -> BoxFuture<'static, (Node, SyncStats)> {
    async move {
        let mut stats = SyncStats::default();
        if node.busy {
            stats.busy += 1;
        }
        if !node.busy || force {
            if let Some(st) = node.state {
                if ctx.sync_one(&mut node, st).await && !node.busy {
                    stats.synced += 1;
                }
            }
        }

        let children = std::mem::take(&mut node.children);
        let done = Arc::new(Mutex::new(Vec::with_capacity(children.len())));
        let mut batch = ctx.pool.batch();
        for (name, child) in children {
            let (ctx, done) = (ctx.clone(), Arc::clone(&done));
            batch
                .submit(async move {
                    let res = sync_node(ctx, child, force).await;
                    done.lock().push((name, res));
                })
                .await;
        }
        batch.wait().await;
        for (name, (child, cstats)) in done.lock().drain(..) {
            stats += cstats;
            node.children.insert(name, child);
        }
        (node, stats)
    }
    .boxed()
}

impl<C: Tree, B: Tree> SyncCtx<C, B> {
    /// Pushes one node. Returns false if the push failed and the entry was invalidated.
    async fn sync_one(&self, node: &mut Node, st: State) -> bool {
        let path = node.path.clone();
        if self.verbose {
            info!(path = %path, state = %st, "sync");
        } else {
            debug!(path = %path, state = %st, "sync");
        }
        let res = match st {
            State::Meta | State::UnreadMeta => self.sync_meta(&path).await,
            State::Data | State::New => self.sync_data(&path, node.wasdel).await,
            State::Del => self.sync_del(&path).await,
            State::Unread | State::Clean => Ok(()),
        };
        let ok = match res {
            Ok(()) if node.busy => {
                // Pushed mid-write: the rest of the write still has to go up.
                node.state = Some(State::Data);
                true
            }
            Ok(()) => {
                node.set_state(if st == State::UnreadMeta {
                    State::Unread
                } else {
                    State::Clean
                });
                true
            }
            Err(e) => {
                warn!(path = %path, state = %st, ?e, "sync failed; will re-fetch");
                self.invalid(node).await;
                false
            }
        };
        node.wasdel = false;
        ok
    }

    /// Forgets the local change and makes the next access re-fetch the entry.
    async fn invalid(&self, node: &mut Node) {
        node.set_state(State::Unread);
        node.busy = false;
        let d = Dir::from([(CACHE, UNREAD), (RTIME, "0")]);
        if let Err(e) = self.cache.wstat(&node.path, d).await {
            debug!(path = %node.path, ?e, "sync: cannot flag entry unread");
        }
    }

    fn push_attrs(d: &Dir) -> Dir {
        let mut nd = d.usr_attrs();
        nd.remove(RTIME);
        nd.remove(CACHE);
        nd.set("Mode", d.attr("mode"));
        nd
    }

    async fn sync_meta(&self, path: &str) -> Result<()> {
        let d = self.cache.stat(path).await?;
        let mut nd = Self::push_attrs(&d);
        nd.remove("mtime");
        nd.remove("size");
        self.backing.wstat(path, nd).await
    }

    async fn sync_data(&self, path: &str, wasdel: bool) -> Result<()> {
        let d = self.cache.stat(path).await?;
        if wasdel {
            assert!(path != "/", "sync: remove all of /");
            if let Err(e) = self.backing.remove_all(path).await {
                debug!(path, ?e, "sync: remove before push");
            }
        }
        let nd = Self::push_attrs(&d);
        if d.is_dir() {
            let mut md = nd;
            md.remove("size");
            return match self.backing.mkdir(path, md.clone()).await {
                Err(e) if e.is_exists() => self.backing.wstat(path, md).await,
                res => res,
            };
        }
        let data = self.cache.get(path, 0, None, "").await?;
        self.backing.put(path, nd, 0, data, "").await.map(drop)
    }

    async fn sync_del(&self, path: &str) -> Result<()> {
        assert!(path != "/", "sync: removal of /");
        match self.backing.remove_all(path).await {
            Err(e) if !e.is_not_exist() => Err(e),
            _ => Ok(()),
        }
    }
}
