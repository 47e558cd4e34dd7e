//! Per-path reader/writer locks with independent meta and data halves.
//!
//! A [`LockSet`] hands out [`PathGuard`]s. Entries for a path exist only while some guard for it
//! is alive, and the set keeps a total count of held halves so that
//! [`quiescent_run`](LockSet::quiescent_run) can wait for the moment nothing at all is locked.
//!
//! The set does not order acquisitions. Callers holding more than one guard must take them in
//! path order, root first.

use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::{Notify, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;

/// Which halves of a path lock a guard covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halves {
    /// Metadata only.
    Meta,
    /// Data only.
    Data,
    /// Both, metadata taken first.
    Both,
}

impl Halves {
    fn count(self) -> usize {
        match self {
            Halves::Meta | Halves::Data => 1,
            Halves::Both => 2,
        }
    }

    fn meta(self) -> bool {
        matches!(self, Halves::Meta | Halves::Both)
    }

    fn data(self) -> bool {
        matches!(self, Halves::Data | Halves::Both)
    }
}

/// Shared or exclusive access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Any number of readers.
    Read,
    /// A single writer.
    Write,
}

struct PathLock {
    meta: Arc<RwLock<()>>,
    data: Arc<RwLock<()>>,
}

struct Entry {
    users: usize,
    lock: Arc<PathLock>,
}

#[derive(Default)]
struct SetState {
    paths: FxHashMap<String, Entry>,
    held: usize,
    quiesced: bool,
}

struct SetInner {
    state: Mutex<SetState>,
    changed: Notify,
    tracer: Option<LockTracer>,
}

/// A set of reader/writer locks keyed by path. Clones share the set.
#[derive(Clone)]
pub struct LockSet {
    inner: Arc<SetInner>,
}

impl Default for LockSet {
    fn default() -> Self {
        Self::new(false)
    }
}

impl fmt::Debug for LockSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("LockSet")
            .field("paths", &st.paths.len())
            .field("held", &st.held)
            .field("quiesced", &st.quiesced)
            .finish()
    }
}

enum HalfGuard {
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
}

impl HalfGuard {
    async fn acquire(lk: &Arc<RwLock<()>>, access: Access) -> Self {
        match access {
            Access::Read => HalfGuard::Read(Arc::clone(lk).read_owned().await),
            Access::Write => HalfGuard::Write(Arc::clone(lk).write_owned().await),
        }
    }
}

/// A held lock on one path. Dropping it releases the lock.
#[must_use = "the lock is released when the guard is dropped"]
pub struct PathGuard {
    set: LockSet,
    path: String,
    halves: Halves,
    access: Access,
    at: &'static Location<'static>,
    traced: bool,
    meta: Option<HalfGuard>,
    data: Option<HalfGuard>,
}

impl fmt::Debug for PathGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} {:?} at {}", self.path, self.halves, self.access, self.at)
    }
}

impl PathGuard {
    /// The locked path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// How the path is held.
    pub fn access(&self) -> Access {
        self.access
    }

    /// Releases the lock and takes it again with `access`. Other tasks may run in between.
    pub async fn relock(self, access: Access) -> PathGuard {
        let set = self.set.clone();
        let (path, halves, at) = (self.path.clone(), self.halves, self.at);
        drop(self);
        set.acquire(path, halves, access, at).await
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        self.data.take();
        self.meta.take();
        if self.traced {
            if let Some(t) = self.set.tracer() {
                t.unlocking(&self.path);
            }
        }
        self.set.release(&self.path, self.halves);
    }
}

impl LockSet {
    /// An empty set. With `trace` set, held locks are recorded per operation (see
    /// [`LockTracer`]).
    pub fn new(trace: bool) -> Self {
        Self {
            inner: Arc::new(SetInner {
                state: Mutex::new(SetState::default()),
                changed: Notify::new(),
                tracer: trace.then(LockTracer::default),
            }),
        }
    }

    /// The tracer, when enabled.
    pub fn tracer(&self) -> Option<&LockTracer> {
        self.inner.tracer.as_ref()
    }

    /// Number of lock halves currently held or being waited for.
    pub fn held(&self) -> usize {
        self.inner.state.lock().held
    }

    /// True if some guard for `path` is alive.
    pub fn is_locked(&self, path: &str) -> bool {
        self.inner.state.lock().paths.contains_key(path)
    }

    /// Shared lock on both halves of `path`.
    #[track_caller]
    pub fn rlock(&self, path: &str) -> impl Future<Output = PathGuard> + Send + 'static {
        self.acquire(path.to_owned(), Halves::Both, Access::Read, Location::caller())
    }

    /// Exclusive lock on both halves of `path`.
    #[track_caller]
    pub fn lock(&self, path: &str) -> impl Future<Output = PathGuard> + Send + 'static {
        self.acquire(path.to_owned(), Halves::Both, Access::Write, Location::caller())
    }

    /// Shared lock on the metadata of `path`.
    #[track_caller]
    pub fn rlock_meta(&self, path: &str) -> impl Future<Output = PathGuard> + Send + 'static {
        self.acquire(path.to_owned(), Halves::Meta, Access::Read, Location::caller())
    }

    /// Exclusive lock on the metadata of `path`.
    #[track_caller]
    pub fn lock_meta(&self, path: &str) -> impl Future<Output = PathGuard> + Send + 'static {
        self.acquire(path.to_owned(), Halves::Meta, Access::Write, Location::caller())
    }

    /// Shared lock on the data of `path`.
    #[track_caller]
    pub fn rlock_data(&self, path: &str) -> impl Future<Output = PathGuard> + Send + 'static {
        self.acquire(path.to_owned(), Halves::Data, Access::Read, Location::caller())
    }

    /// Exclusive lock on the data of `path`.
    #[track_caller]
    pub fn lock_data(&self, path: &str) -> impl Future<Output = PathGuard> + Send + 'static {
        self.acquire(path.to_owned(), Halves::Data, Access::Write, Location::caller())
    }

    /// Lock on the data of `path` with the given access.
    #[track_caller]
    pub fn lock_data_as(
        &self,
        path: &str,
        access: Access,
    ) -> impl Future<Output = PathGuard> + Send + 'static {
        self.acquire(path.to_owned(), Halves::Data, access, Location::caller())
    }

    fn acquire(
        &self,
        path: String,
        halves: Halves,
        access: Access,
        at: &'static Location<'static>,
    ) -> impl Future<Output = PathGuard> + Send + 'static {
        let set = self.clone();
        async move {
            let lock = set.register(&path, halves).await;
            // Built before waiting so that a cancelled acquisition still gives its count back.
            let mut g = PathGuard {
                set,
                path,
                halves,
                access,
                at,
                traced: false,
                meta: None,
                data: None,
            };
            if halves.meta() {
                g.meta = Some(HalfGuard::acquire(&lock.meta, access).await);
            }
            if halves.data() {
                g.data = Some(HalfGuard::acquire(&lock.data, access).await);
            }
            if let Some(t) = g.set.tracer() {
                t.locking(&g.path, at);
                g.traced = true;
            }
            g
        }
    }

    /// Counts the halves in, waiting while a quiescent run is in progress.
    async fn register(&self, path: &str, halves: Halves) -> Arc<PathLock> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.inner.state.lock();
                if !st.quiesced {
                    let n = halves.count();
                    st.held += n;
                    let ent = st.paths.entry(path.to_owned()).or_insert_with(|| Entry {
                        users: 0,
                        lock: Arc::new(PathLock {
                            meta: Arc::new(RwLock::new(())),
                            data: Arc::new(RwLock::new(())),
                        }),
                    });
                    ent.users += n;
                    return Arc::clone(&ent.lock);
                }
            }
            notified.await;
        }
    }

    fn release(&self, path: &str, halves: Halves) {
        let n = halves.count();
        let mut st = self.inner.state.lock();
        let Some(ent) = st.paths.get_mut(path) else {
            panic!("locks: unlock of {path} without lock");
        };
        assert!(ent.users >= n, "locks: negative lock count for {path}");
        ent.users -= n;
        if ent.users == 0 {
            st.paths.remove(path);
        }
        assert!(st.held >= n, "locks: negative total lock count");
        st.held -= n;
        if st.held == 0 {
            self.inner.changed.notify_waiters();
        }
    }

    /// Waits until no lock is held anywhere, then runs `f` while new acquisitions wait.
    ///
    /// Acquirers are not held back while this waits for the count to drop to zero. `f` must not
    /// take locks from this set.
    pub async fn quiescent_run<F, T>(&self, f: F) -> T
    where
        F: Future<Output = T>,
    {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.inner.state.lock();
                if st.held == 0 && !st.quiesced {
                    st.quiesced = true;
                    break;
                }
            }
            notified.await;
        }
        let _resume = Resume(self);
        f.await
    }
}

/// Reopens the set once a quiescent run ends, also when it is cancelled.
struct Resume<'a>(&'a LockSet);

impl Drop for Resume<'_> {
    fn drop(&mut self) {
        self.0.inner.state.lock().quiesced = false;
        self.0.inner.changed.notify_waiters();
    }
}

tokio::task_local! {
    static OP: u64;
}

static NEXT_OP: AtomicU64 = AtomicU64::new(1);

/// Runs `f` as a traced operation: locks taken inside are attributed to it, not to the task
/// polling it.
pub async fn traced<F: Future>(f: F) -> F::Output {
    OP.scope(NEXT_OP.fetch_add(1, Ordering::Relaxed), f).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Owner {
    Op(u64),
    Task(tokio::task::Id),
    Thread(std::thread::ThreadId),
}

impl Owner {
    fn current() -> Self {
        if let Ok(id) = OP.try_with(|id| *id) {
            return Owner::Op(id);
        }
        match tokio::task::try_id() {
            Some(id) => Owner::Task(id),
            None => Owner::Thread(std::thread::current().id()),
        }
    }
}

#[derive(Debug, Clone)]
struct Held {
    path: String,
    at: &'static Location<'static>,
}

impl fmt::Display for Held {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} locked {}", self.at.file(), self.at.line(), self.path)
    }
}

/// Records which locks each operation holds, and where they were taken.
#[derive(Default)]
pub struct LockTracer {
    held: Mutex<FxHashMap<Owner, Vec<Held>>>,
}

impl LockTracer {
    fn locking(&self, path: &str, at: &'static Location<'static>) {
        self.held
            .lock()
            .entry(Owner::current())
            .or_default()
            .push(Held {
                path: path.to_owned(),
                at,
            });
    }

    fn unlocking(&self, path: &str) {
        let owner = Owner::current();
        let mut held = self.held.lock();
        let Some(locks) = held.get_mut(&owner) else {
            panic!("locks: {path} unlocked by an owner holding nothing");
        };
        let Some(i) = locks.iter().position(|h| h.path == path) else {
            panic!("locks: {path} unlocked by an owner not holding it");
        };
        locks.swap_remove(i);
        if locks.is_empty() {
            held.remove(&owner);
        }
    }

    /// Paths locked by the current operation.
    pub fn held_here(&self) -> Vec<String> {
        self.held
            .lock()
            .get(&Owner::current())
            .map(|ls| ls.iter().map(|h| h.path.clone()).collect())
            .unwrap_or_default()
    }

    /// Panics if the current operation still holds locks.
    pub fn no_locks(&self) {
        let held = self.held.lock();
        let Some(locks) = held.get(&Owner::current()) else {
            return;
        };
        for h in locks {
            warn!("nolocks: {h}");
        }
        panic!("locks: operation ended holding {} locks", locks.len());
    }
}
