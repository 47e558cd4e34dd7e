//! Per-path cache state and write-behind synchronisation.
//!
//! [`CacheInfo`] records, for every path with changes not yet pushed to the backing tree, what
//! kind of change is pending. Paths that are merely clean or unread are not recorded: the
//! `Cache` attribute of their cached entry tells them apart. The transitions are:
//!
//! | from       | event                 | to         |
//! |------------|-----------------------|------------|
//! | unread     | data read             | clean      |
//! | unread     | meta change           | unreadmeta |
//! | unread     | data change           | data       |
//! | clean      | invalidate            | unread     |
//! | clean      | meta change           | meta       |
//! | clean      | data change           | data       |
//! | unreadmeta | data read             | meta       |
//! | unreadmeta | data change           | data       |
//! | unreadmeta | meta synced           | unread     |
//! | meta       | data change           | data       |
//! | meta       | invalidated           | unreadmeta |
//! | meta       | meta synced           | clean      |
//! | data       | data synced           | clean      |
//! | new        | synced                | clean      |
//! | new        | removed               | (forgotten)|
//! | del        | reappeared upstream   | unread     |
//! | any        | removed               | del        |
//!
//! The set of path locks used by the engine lives here too, since a sync sweep must run while
//! no path is locked.

/// Cache states and the tree of tracked paths.
pub mod state;
mod sync;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::dir::{CACHE, Dir};
use crate::locks::LockSet;
use crate::tree::Tree;
use crate::work::{NSYNCERS, WorkPool};

pub use state::State;
use state::Node;
pub use sync::SyncStats;

/// Value of the `Cache` attribute for entries whose data has not been fetched.
pub const UNREAD: &str = "unread";

/// Idle time after a change before the sync proc pushes it.
pub const SYNC_DELAY: Duration = Duration::from_secs(5);

/// Longest a change waits before the sync proc pushes it.
pub const MAX_SYNC_DELAY: Duration = Duration::from_secs(10);

/// How a [`CacheInfo`] runs.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Concurrent node syncs.
    pub nsyncers: usize,
    /// See [`SYNC_DELAY`].
    pub sync_delay: Duration,
    /// See [`MAX_SYNC_DELAY`].
    pub max_sync_delay: Duration,
    /// Record held locks per operation.
    pub trace_locks: bool,
    /// Emit a debug event for every transition.
    pub debug: Arc<AtomicBool>,
    /// Log every node sync at info level.
    pub verbose: Arc<AtomicBool>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            nsyncers: NSYNCERS,
            sync_delay: SYNC_DELAY,
            max_sync_delay: MAX_SYNC_DELAY,
            trace_locks: false,
            debug: Arc::default(),
            verbose: Arc::default(),
        }
    }
}

struct Inner<C, B> {
    tree: Mutex<Node>,
    locks: LockSet,
    cache: C,
    backing: B,
    pool: WorkPool,
    opts: CacheOptions,
    dirty_tx: Mutex<Option<mpsc::Sender<()>>>,
    proc: Mutex<Option<JoinHandle<()>>>,
}

/// Cache state for a cache tree `C` in front of a backing tree `B`. Clones share the state.
pub struct CacheInfo<C, B> {
    inner: Arc<Inner<C, B>>,
}

impl<C, B> Clone for CacheInfo<C, B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Tree, B: Tree> CacheInfo<C, B> {
    /// Tracks nothing yet and starts the sync proc. Must be called within a tokio runtime.
    pub fn new(cache: C, backing: B, opts: CacheOptions) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let ci = Self {
            inner: Arc::new(Inner {
                tree: Mutex::new(Node::root()),
                locks: LockSet::new(opts.trace_locks),
                cache,
                backing,
                pool: WorkPool::new(opts.nsyncers),
                opts,
                dirty_tx: Mutex::new(Some(tx)),
                proc: Mutex::new(None),
            }),
        };
        let handle = tokio::spawn(ci.clone().sync_proc(rx));
        *ci.inner.proc.lock() = Some(handle);
        ci
    }

    /// The path locks guarding cache entries.
    pub fn locks(&self) -> &LockSet {
        &self.inner.locks
    }

    /// The worker pool used for syncs, shared with the poller.
    pub fn pool(&self) -> &WorkPool {
        &self.inner.pool
    }

    fn debugging(&self) -> bool {
        self.inner.opts.debug.load(Ordering::Relaxed)
    }

    fn trace(&self, d: &Dir, what: &str) {
        if self.debugging() {
            debug!(path = d.path(), "cache: {what}");
        }
    }

    /// The state of the entry `d`.
    pub fn state(&self, d: &Dir) -> State {
        let tree = self.inner.tree.lock();
        match tree.get(d.path()).and_then(|n| n.state) {
            Some(st) => st,
            None if d.attr(CACHE) == UNREAD => State::Unread,
            None => State::Clean,
        }
    }

    /// True if `path` has a node, carrier or not.
    pub fn is_tracked(&self, path: &str) -> bool {
        path != "/" && self.inner.tree.lock().get(path).is_some()
    }

    /// Every path holding a state, parents first, with its busy flag.
    pub fn entries(&self) -> Vec<(String, State, bool)> {
        let mut out = Vec::new();
        self.inner.tree.lock().collect(&mut out);
        out
    }

    /// An indented listing of the tree, for debugging.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.inner.tree.lock().dump(0, &mut out);
        out
    }

    /// The cached data of `d` is stale: forget pending data changes.
    pub fn inval_data(&self, d: &mut Dir) {
        d.set(CACHE, UNREAD);
        self.trace(d, "invaldata");
        let mut tree = self.inner.tree.lock();
        let Some(n) = tree.get_mut(d.path()) else {
            return;
        };
        match n.state {
            Some(State::Meta) => n.state = Some(State::UnreadMeta),
            Some(State::UnreadMeta) => {}
            _ => {
                n.set_state(State::Unread);
                n.wasdel = false;
                n.busy = false;
            }
        }
        tree.prune(d.path());
    }

    /// Data and metadata of `d` are cached and fresh. A metadata change still waiting for upload
    /// is kept.
    pub fn clean(&self, d: &mut Dir) {
        d.set(CACHE, "read");
        self.trace(d, "clean");
        let mut tree = self.inner.tree.lock();
        if let Some(n) = tree.get_mut(d.path()) {
            match n.state {
                Some(State::UnreadMeta | State::Meta) => n.state = Some(State::Meta),
                _ => n.set_state(State::Clean),
            }
            n.wasdel = false;
            n.busy = false;
            tree.prune(d.path());
        }
    }

    /// The metadata of `d` changed locally.
    pub fn dirty_meta(&self, d: &mut Dir) {
        let unread = d.attr(CACHE) == UNREAD;
        if !unread {
            d.set(CACHE, "dirty");
        }
        self.trace(d, "dirtymeta");
        {
            let mut tree = self.inner.tree.lock();
            let n = tree.make(d.path());
            n.state = Some(match n.state {
                Some(st @ (State::Data | State::New | State::UnreadMeta | State::Del)) => st,
                None if unread => State::UnreadMeta,
                _ => State::Meta,
            });
        }
        self.dirty();
    }

    /// `d` was created locally.
    pub fn created(&self, d: &mut Dir) {
        self.mark_new(d, false);
        self.dirty();
    }

    /// `d` was created locally and is still being written.
    pub fn created_busy(&self, d: &mut Dir) {
        self.mark_new(d, true);
    }

    fn mark_new(&self, d: &mut Dir, busy: bool) {
        d.set(CACHE, "dirty");
        self.trace(d, "created");
        let mut tree = self.inner.tree.lock();
        let n = tree.make(d.path());
        n.state = Some(State::New);
        n.busy |= busy;
    }

    /// The data of `d` changed locally.
    pub fn dirty_data(&self, d: &mut Dir) {
        self.mark_data(d, false);
        self.dirty();
    }

    /// The data of `d` is being changed locally.
    pub fn dirty_data_busy(&self, d: &mut Dir) {
        self.mark_data(d, true);
    }

    fn mark_data(&self, d: &mut Dir, busy: bool) {
        d.set(CACHE, "dirty");
        self.trace(d, "dirtydata");
        let mut tree = self.inner.tree.lock();
        let n = tree.make(d.path());
        if n.state != Some(State::New) {
            n.state = Some(State::Data);
        }
        n.busy |= busy;
    }

    /// The write in progress on `d` is done.
    pub fn not_busy(&self, d: &Dir) {
        let found = match self.inner.tree.lock().get_mut(d.path()) {
            Some(n) => {
                n.busy = false;
                true
            }
            None => false,
        };
        if found {
            self.dirty();
        }
    }

    /// `d` no longer exists in the backing tree: forget it and everything below.
    pub fn gone(&self, d: &mut Dir) {
        d.set(CACHE, "gone");
        d.set("rm", "y");
        self.trace(d, "gone");
        self.inner.tree.lock().take(d.path());
    }

    /// `d` was removed locally. A file never pushed is forgotten; otherwise the removal is
    /// queued and replaces anything pending below it.
    pub fn removed(&self, d: &mut Dir) {
        d.set(CACHE, "gone");
        d.set("rm", "y");
        self.trace(d, "removed");
        {
            let mut tree = self.inner.tree.lock();
            let n = tree.make(d.path());
            if n.state == Some(State::New) && !n.wasdel {
                tree.take(d.path());
                return;
            }
            n.state = Some(State::Del);
            n.wasdel = true;
            n.busy = false;
            n.children.clear();
        }
        self.dirty();
    }

    /// Wakes the sync proc.
    fn dirty(&self) {
        if let Some(tx) = self.inner.dirty_tx.lock().as_ref() {
            let _ = tx.try_send(());
        }
    }

    /// Stops the sync proc after one last forced sync, and waits for in-flight syncs. A second
    /// call does nothing.
    pub async fn close(&self) {
        let tx = self.inner.dirty_tx.lock().take();
        if tx.is_none() {
            return;
        }
        drop(tx);
        let handle = self.inner.proc.lock().take();
        if let Some(h) = handle {
            if let Err(e) = h.await {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::MemTree;

    fn ci() -> CacheInfo<MemTree, MemTree> {
        CacheInfo::new(MemTree::new("cache"), MemTree::new("backing"), CacheOptions::default())
    }

    fn d(path: &str) -> Dir {
        Dir::from([("path", path), ("type", "-")])
    }

    #[tokio::test]
    async fn untracked_states_come_from_cache_attr() {
        let ci = ci();
        let mut f = d("/f");
        assert_eq!(ci.state(&f), State::Clean);
        ci.inval_data(&mut f);
        assert_eq!(f.attr(CACHE), UNREAD);
        assert_eq!(ci.state(&f), State::Unread);
        ci.clean(&mut f);
        assert_eq!(ci.state(&f), State::Clean);
        assert!(!ci.is_tracked("/f"));
    }

    #[tokio::test]
    async fn meta_then_data_then_clean() {
        let ci = ci();
        let mut f = d("/a/f");
        ci.dirty_meta(&mut f);
        assert_eq!(ci.state(&f), State::Meta);
        ci.dirty_data(&mut f);
        assert_eq!(ci.state(&f), State::Data);
        ci.dirty_meta(&mut f);
        assert_eq!(ci.state(&f), State::Data);
        ci.clean(&mut f);
        assert_eq!(ci.state(&f), State::Clean);
        assert!(!ci.is_tracked("/a/f"));
        assert!(!ci.is_tracked("/a"));
    }

    #[tokio::test]
    async fn unread_meta_paths() {
        let ci = ci();
        let mut f = d("/f");
        f.set(CACHE, UNREAD);
        ci.dirty_meta(&mut f);
        assert_eq!(ci.state(&f), State::UnreadMeta);
        assert_eq!(f.attr(CACHE), UNREAD);
        ci.dirty_data(&mut f);
        assert_eq!(ci.state(&f), State::Data);

        let mut g = d("/g");
        ci.dirty_meta(&mut g);
        ci.inval_data(&mut g);
        assert_eq!(ci.state(&g), State::UnreadMeta);
    }

    #[tokio::test]
    async fn clean_keeps_pending_meta() {
        let ci = ci();
        let mut f = d("/f");
        f.set(CACHE, UNREAD);
        ci.dirty_meta(&mut f);
        ci.clean(&mut f);
        assert_eq!(ci.state(&f), State::Meta);
        assert_eq!(f.attr(CACHE), "read");
    }

    #[tokio::test]
    async fn removing_new_file_forgets_it() {
        let ci = ci();
        let mut f = d("/n");
        ci.created(&mut f);
        assert_eq!(ci.state(&f), State::New);
        ci.removed(&mut f);
        assert!(!ci.is_tracked("/n"));
    }

    #[tokio::test]
    async fn recreated_then_removed_stays_deleted() {
        let ci = ci();
        let mut f = d("/n");
        ci.removed(&mut f);
        assert_eq!(ci.state(&f), State::Del);
        ci.created(&mut f);
        assert_eq!(ci.state(&f), State::New);
        ci.removed(&mut f);
        assert_eq!(ci.state(&f), State::Del);
    }

    #[tokio::test]
    async fn removal_drops_descendants() {
        let ci = ci();
        ci.created(&mut d("/dir/a"));
        ci.dirty_data(&mut d("/dir/b"));
        ci.removed(&mut Dir::from([("path", "/dir"), ("type", "d")]));
        assert_eq!(ci.entries(), vec![("/dir".to_owned(), State::Del, false)]);
    }

    #[tokio::test]
    async fn gone_forgets_subtree() {
        let ci = ci();
        ci.dirty_data(&mut d("/a/b"));
        let mut a = d("/a");
        ci.gone(&mut a);
        assert!(a.is_removed());
        assert!(ci.entries().is_empty());
        assert!(!ci.is_tracked("/a"));
    }

    #[tokio::test]
    async fn busy_flags() {
        let ci = ci();
        let mut f = d("/f");
        ci.dirty_data_busy(&mut f);
        assert_eq!(ci.entries(), vec![("/f".to_owned(), State::Data, true)]);
        ci.not_busy(&f);
        assert_eq!(ci.entries(), vec![("/f".to_owned(), State::Data, false)]);
        ci.close().await;
    }
}
