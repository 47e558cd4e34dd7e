//! The caching engine: a [`Tree`] serving a backing tree through a cache tree.
//!
//! Reads are served from the cache tree and refreshed from the backing tree when stale. Writes
//! go to the cache tree and are pushed to the backing tree later by the sync proc of
//! [`CacheInfo`]. Freshness follows the epoch: while the backing tree streams invalidations on
//! `/Chg`, a cached entry is fresh iff its `Rtime` equals the epoch; otherwise it is fresh for
//! [`Tuning::cache_tout`] after it was read and the poller looks for external changes.
//!
//! A [`Cfs`] handle acts for one client. [`Cfs::serve_for`] hands out more handles sharing the
//! engine; changes made through one are announced on the `/Chg` of every other.
//!
//! Call [`close`](Tree::close) before dropping the last handle, or the background procs keep
//! the engine alive.

mod cfile;
mod ctl;
mod inval;
mod ops;
mod poll;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use futures::StreamExt as _;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::auth::{Auth, ClientInfo, current_user};
use crate::cache::{CacheInfo, CacheOptions, SyncStats, UNREAD};
use crate::dir::{CACHE, Dir, RTIME};
use crate::error::{Error, Result};
use crate::flags::Flags;
use crate::locks;
use crate::stats::{IoStats, Op};
use crate::tree::{ByteStream, DirDataStream, DirStream, Tree};
use crate::work::NSYNCERS;

use inval::Invals;

/// Timing and concurrency knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuning {
    /// How long cached metadata stays fresh when there is no epoch.
    pub cache_tout: Duration,
    /// Interval between polls of the backing tree when it has no `/Chg`.
    pub poll_ival: Duration,
    /// Longest a `/Chg` reader may take to accept one invalidation.
    pub ival_tout: Duration,
    /// Idle time after a change before it is pushed.
    pub sync_delay: Duration,
    /// Longest a change waits before it is pushed.
    pub max_sync_delay: Duration,
    /// Concurrent syncs and polls.
    pub nsyncers: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            cache_tout: Duration::from_secs(5),
            poll_ival: Duration::from_secs(60),
            ival_tout: Duration::from_secs(2),
            sync_delay: crate::cache::SYNC_DELAY,
            max_sync_delay: crate::cache::MAX_SYNC_DELAY,
            nsyncers: NSYNCERS,
        }
    }
}

/// How a [`Cfs`] is built.
#[derive(Debug, Clone)]
pub struct CfsOptions {
    /// Reject every change with [`Error::ReadOnly`].
    pub read_only: bool,
    /// Skip permission checks.
    pub no_perm_check: bool,
    /// Start with the `debug` flag on.
    pub debug: bool,
    /// Record the locks held by each operation and panic if one ends holding any.
    pub trace_locks: bool,
    /// Neither listen to the backing `/Chg` nor poll, and serve no `/Chg`.
    pub no_inval_proto: bool,
    /// Owner of the synthetic files, and the user acting for clients with no identity.
    pub user: String,
    /// Timing and concurrency knobs.
    pub tuning: Tuning,
}

impl Default for CfsOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            no_perm_check: false,
            debug: false,
            trace_locks: false,
            no_inval_proto: false,
            user: current_user(),
            tuning: Tuning::default(),
        }
    }
}

struct Procs {
    poller: Option<JoinHandle<()>>,
    ingest: Option<JoinHandle<()>>,
    applier: Option<JoinHandle<()>>,
    fanout: Option<JoinHandle<()>>,
}

struct Inner<C, B> {
    name: String,
    user: String,
    cache: C,
    backing: B,
    ci: CacheInfo<C, B>,
    tuning: Tuning,
    no_inval_proto: bool,
    read_only: Arc<AtomicBool>,
    no_perm: Arc<AtomicBool>,
    debug: Arc<AtomicBool>,
    flags: Flags,
    stats: Arc<IoStats>,
    users: Mutex<BTreeMap<String, SystemTime>>,
    invals: Invals,
    closing: watch::Sender<bool>,
    procs: Mutex<Procs>,
    closed: AtomicBool,
}

/// A caching tree over a cache tree `C` and a backing tree `B`, acting for one client.
pub struct Cfs<C, B> {
    inner: Arc<Inner<C, B>>,
    client: Option<Arc<ClientInfo>>,
}

impl<C, B> Clone for Cfs<C, B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            client: self.client.clone(),
        }
    }
}

/// Fails unless `t` keeps `attr` across a wstat of `/`.
async fn check_preserves<T: Tree>(t: &T, attr: &str) -> Result<()> {
    t.stat("/").await?;
    t.wstat("/", Dir::from([(attr, "666")])).await?;
    let d = t.stat("/").await?;
    if d.attr(attr) != "666" {
        return Err(Error::Inconsistent(format!(
            "{}: does not preserve {attr}",
            t.name()
        )));
    }
    t.wstat("/", Dir::from([(attr, "")])).await
}

/// The backing `/Chg`, past its version message, or `None` if there is none.
async fn open_chg<T: Tree>(backing: &T) -> Option<ByteStream> {
    let mut chg = match backing.get("/Chg", 0, None, "").await {
        Ok(chg) => chg,
        Err(e) => {
            warn!(tree = backing.name(), error = %e, "no invalidations");
            return None;
        }
    };
    match chg.next().await {
        Some(Ok(version)) if !version.is_empty() => {
            debug!(
                tree = backing.name(),
                version = %String::from_utf8_lossy(&version),
                "/Chg open"
            );
            Some(chg)
        }
        Some(Err(e)) => {
            warn!(tree = backing.name(), error = %e, "no invalidations");
            None
        }
        _ => {
            warn!(tree = backing.name(), "no invalidations: empty /Chg");
            None
        }
    }
}

impl<C: Tree, B: Tree> Cfs<C, B> {
    /// Builds the engine and starts its procs. Must be called within a tokio runtime.
    pub async fn new(name: impl Into<String>, cache: C, backing: B, opts: CfsOptions) -> Result<Self> {
        let mut name = name.into();
        if name.is_empty() {
            name = format!("cfs!{}", backing.name());
        }
        if !opts.read_only {
            check_preserves(&cache, RTIME).await?;
        }
        // The first access to anything reconciles the root with the backing tree.
        cache.wstat("/", Dir::from([(CACHE, UNREAD)])).await?;

        let tuning = opts.tuning.clone();
        let debug = Arc::new(AtomicBool::new(opts.debug));
        let verbose = Arc::new(AtomicBool::new(false));
        let ci = CacheInfo::new(
            cache.clone(),
            backing.clone(),
            CacheOptions {
                nsyncers: tuning.nsyncers,
                sync_delay: tuning.sync_delay,
                max_sync_delay: tuning.max_sync_delay,
                trace_locks: opts.trace_locks,
                debug: Arc::clone(&debug),
                verbose: Arc::clone(&verbose),
            },
        );

        let read_only = Arc::new(AtomicBool::new(opts.read_only));
        let no_perm = Arc::new(AtomicBool::new(opts.no_perm_check));
        let stats = Arc::new(IoStats::default());
        let flags = Flags::new();
        flags.add_bool("debug", Arc::clone(&debug));
        flags.add_bool("verbsync", verbose);
        flags.add_ro_bool("rdonly", Arc::clone(&read_only));
        flags.add_ro_bool("noperm", Arc::clone(&no_perm));
        let st = Arc::clone(&stats);
        flags.add_cmd("clear", move |_| {
            st.clear();
            Ok(())
        });

        let (invals, changes) = Invals::new(tuning.ival_tout);
        let (closing, _) = watch::channel(false);
        let fs = Self {
            inner: Arc::new(Inner {
                name,
                user: opts.user,
                cache,
                backing,
                ci,
                tuning,
                no_inval_proto: opts.no_inval_proto,
                read_only,
                no_perm,
                debug,
                flags,
                stats,
                users: Mutex::new(BTreeMap::new()),
                invals,
                closing,
                procs: Mutex::new(Procs {
                    poller: None,
                    ingest: None,
                    applier: None,
                    fanout: None,
                }),
                closed: AtomicBool::new(false),
            }),
            client: None,
        };

        let fanout = tokio::spawn(fs.clone().fanout_proc(changes));
        fs.inner.procs.lock().fanout = Some(fanout);
        if !fs.inner.no_inval_proto {
            match open_chg(&fs.inner.backing).await {
                Some(chg) => {
                    fs.inner.invals.new_epoch();
                    let (tx, rx) = mpsc::unbounded_channel();
                    let closing = fs.inner.closing.subscribe();
                    let ingest = tokio::spawn(fs.clone().ingest_proc(chg, tx, closing));
                    let applier = tokio::spawn(fs.clone().applier_proc(rx));
                    let mut procs = fs.inner.procs.lock();
                    procs.ingest = Some(ingest);
                    procs.applier = Some(applier);
                }
                None => {
                    warn!(
                        cfs = %fs.inner.name,
                        backing = fs.inner.backing.name(),
                        "polling for external changes"
                    );
                    let closing = fs.inner.closing.subscribe();
                    let poller = tokio::spawn(fs.clone().poll_proc(closing));
                    fs.inner.procs.lock().poller = Some(poller);
                }
            }
        }
        info!(cfs = %fs.inner.name, epoch = %fs.epoch(), "started");
        Ok(fs)
    }

    /// A handle sharing this engine and acting for `ci`.
    #[must_use]
    pub fn serve_for(&self, ci: ClientInfo) -> Self {
        debug!(
            cfs = %self.inner.name,
            client = %ci.tag,
            id = ci.id,
            uid = ci.auth.as_ref().map_or("none", |a| a.uid.as_str()),
            "serving client"
        );
        Self {
            inner: Arc::clone(&self.inner),
            client: Some(Arc::new(ci)),
        }
    }

    /// The client this handle acts for.
    pub fn client(&self) -> Option<&ClientInfo> {
        self.client.as_deref()
    }

    /// Cache states and the sync proc.
    pub fn cache_info(&self) -> &CacheInfo<C, B> {
        &self.inner.ci
    }

    /// The flag registry behind `/Ctl`.
    pub fn flags(&self) -> &Flags {
        &self.inner.flags
    }

    /// Per-operation counters.
    pub fn stats(&self) -> &IoStats {
        &self.inner.stats
    }

    /// The current epoch, empty when there is none.
    pub fn epoch(&self) -> String {
        self.inner.invals.epoch()
    }

    /// Number of clients reading `/Chg`.
    pub fn chg_readers(&self) -> usize {
        self.inner.invals.nreaders()
    }

    /// Pushes every pending change now, busy entries included.
    pub async fn sync(&self) -> SyncStats {
        self.inner.ci.sync(true).await
    }

    /// Records that `who` logged in.
    pub fn log_in(&self, who: &str) {
        self.inner
            .users
            .lock()
            .insert(who.to_owned(), SystemTime::now());
    }

    /// Records that `who` logged out.
    pub fn log_out(&self, who: &str) {
        self.inner.users.lock().remove(who);
    }

    /// Logged-in users as `who time` lines, time in seconds since the unix epoch.
    pub fn users(&self) -> Vec<String> {
        self.inner
            .users
            .lock()
            .iter()
            .map(|(who, t)| {
                let secs = t
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map_or(0, |d| d.as_secs());
                format!("{who} {secs}")
            })
            .collect()
    }

    fn debugging(&self) -> bool {
        self.inner.debug.load(Ordering::Relaxed)
    }

    /// The identity permission checks are made against; `None` when checks are off.
    fn ai(&self) -> Option<&Auth> {
        if self.inner.no_perm.load(Ordering::Relaxed) {
            return None;
        }
        self.client.as_ref().and_then(|c| c.auth.as_ref())
    }

    fn checks_perms(&self) -> bool {
        !self.inner.no_perm.load(Ordering::Relaxed)
    }

    /// The user new files are owned by.
    fn uid(&self) -> &str {
        self.client
            .as_ref()
            .and_then(|c| c.auth.as_ref())
            .map_or(self.inner.user.as_str(), |a| a.uid.as_str())
    }

    fn client_id(&self) -> Option<u64> {
        self.client.as_ref().map(|c| c.id)
    }

    fn check_writable(&self) -> Result<()> {
        if self.inner.read_only.load(Ordering::Relaxed) {
            return Err(Error::ReadOnly(self.inner.name.clone()));
        }
        Ok(())
    }

    /// Runs one front-end operation: lock tracing, the no-locks check and counting.
    async fn run<T, F>(&self, op: Op, f: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let res = locks::traced(async {
            let res = f.await;
            if let Some(tracer) = self.inner.ci.locks().tracer() {
                tracer.no_locks();
            }
            res
        })
        .await;
        self.inner.stats.count(op, &res);
        if let Err(e) = &res {
            debug!(error = %e, "failed");
        }
        res
    }

    /// Stops the procs in order, flushes pending changes and closes both trees.
    async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(cfs = %self.inner.name, "closing");
        let _ = self.inner.closing.send(true);
        let (poller, ingest, applier, fanout) = {
            let mut procs = self.inner.procs.lock();
            (
                procs.poller.take(),
                procs.ingest.take(),
                procs.applier.take(),
                procs.fanout.take(),
            )
        };
        join("poller", poller).await;
        join("ingest", ingest).await;
        join("applier", applier).await;
        self.inner.invals.close();
        join("fan-out", fanout).await;
        self.inner.invals.evict_all(&self.inner.name);
        self.inner.ci.close().await;
        self.inner.cache.close().await;
        self.inner.backing.close().await;
        debug!(cfs = %self.inner.name, "closed");
    }
}

async fn join(what: &str, h: Option<JoinHandle<()>>) {
    let Some(h) = h else {
        return;
    };
    if let Err(e) = h.await {
        if e.is_panic() {
            std::panic::resume_unwind(e.into_panic());
        }
        warn!(error = %e, "{what} proc");
    }
}

impl<C: Tree, B: Tree> Tree for Cfs<C, B> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    #[instrument(name = "Cfs::stat", skip(self))]
    async fn stat(&self, path: &str) -> Result<Dir> {
        self.run(Op::Stat, self.stat_op(path)).await
    }

    #[instrument(name = "Cfs::get", skip(self))]
    async fn get(&self, path: &str, off: u64, count: Option<u64>, pred: &str) -> Result<ByteStream> {
        self.run(Op::Get, self.get_op(path, off, count, pred)).await
    }

    #[instrument(name = "Cfs::put", skip(self, data))]
    async fn put(&self, path: &str, d: Dir, off: i64, data: ByteStream, pred: &str) -> Result<Dir> {
        self.run(Op::Put, self.put_op(path, d, off, data, pred))
            .await
    }

    #[instrument(name = "Cfs::mkdir", skip(self))]
    async fn mkdir(&self, path: &str, d: Dir) -> Result<()> {
        self.run(Op::Mkdir, self.mkdir_op(path, d)).await
    }

    #[instrument(name = "Cfs::wstat", skip(self))]
    async fn wstat(&self, path: &str, d: Dir) -> Result<()> {
        self.run(Op::Wstat, self.wstat_op(path, d)).await
    }

    #[instrument(name = "Cfs::move", skip(self))]
    async fn r#move(&self, from: &str, to: &str) -> Result<()> {
        self.run(Op::Move, self.move_op(from, to)).await
    }

    #[instrument(name = "Cfs::remove", skip(self))]
    async fn remove(&self, path: &str) -> Result<()> {
        self.run(Op::Remove, self.remove_op(path, false)).await
    }

    #[instrument(name = "Cfs::remove_all", skip(self))]
    async fn remove_all(&self, path: &str) -> Result<()> {
        self.run(Op::RemoveAll, self.remove_op(path, true)).await
    }

    fn find(&self, path: &str, pred: &str, spref: &str, dpref: &str, depth: usize) -> DirStream {
        self.find_stream(path, pred, spref, dpref, depth)
    }

    fn find_get(
        &self,
        path: &str,
        pred: &str,
        spref: &str,
        dpref: &str,
        depth: usize,
    ) -> DirDataStream {
        self.find_get_stream(path, pred, spref, dpref, depth)
    }

    async fn close(&self) {
        self.shutdown().await;
    }
}
