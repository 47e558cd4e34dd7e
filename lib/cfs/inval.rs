//! Invalidations: downward from the backing `/Chg` into the cache, upward from our clients'
//! changes out to the other clients reading our `/Chg`.
//!
//! A reader too slow to take an invalidation within [`Tuning::ival_tout`](super::Tuning) is
//! evicted: its `/Chg` ends with [`Error::SlowReader`]. A client that loses its `/Chg` must
//! assume everything it cached is stale.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures::future::join_all;
use futures::{StreamExt as _, stream};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

use super::Cfs;
use crate::dir::{Dir, time_string};
use crate::error::{Error, Result};
use crate::locks;
use crate::tree::mem::CHG_VERSION;
use crate::tree::{ByteStream, Tree};

const READER_BUFFER: usize = 8;

/// A change made on behalf of a client, `None` for changes of our own.
pub(super) struct Change {
    d: Dir,
    from: Option<u64>,
}

struct Reader {
    reg: u64,
    client: u64,
    tag: String,
    tx: mpsc::Sender<Result<Bytes>>,
    /// Why the reader was let go, handed to it once its channel drains.
    why: Arc<Mutex<Option<Error>>>,
}

pub(super) struct Invals {
    epoch: Mutex<String>,
    changes: Mutex<Option<mpsc::UnboundedSender<Change>>>,
    readers: Mutex<Vec<Reader>>,
    next_reg: AtomicU64,
    ival_tout: Duration,
}

/// The message announcing `d` to a reader.
fn inval_msg(d: &Dir) -> Bytes {
    let mut nd = d.usr_attrs();
    nd.strip_cache_attrs();
    for k in ["Sum", "rm", "path", "name", "type"] {
        if let Some(v) = d.get(k).filter(|v| !v.is_empty()) {
            nd.set(k, v);
        }
    }
    nd.pack()
}

impl Invals {
    pub fn new(ival_tout: Duration) -> (Self, mpsc::UnboundedReceiver<Change>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let q = Self {
            epoch: Mutex::new(String::new()),
            changes: Mutex::new(Some(tx)),
            readers: Mutex::new(Vec::new()),
            next_reg: AtomicU64::new(1),
            ival_tout,
        };
        (q, rx)
    }

    pub fn epoch(&self) -> String {
        self.epoch.lock().clone()
    }

    pub fn new_epoch(&self) {
        let e = time_string(SystemTime::now());
        info!(epoch = %e, "new epoch");
        *self.epoch.lock() = e;
    }

    pub fn clear_epoch(&self) {
        self.epoch.lock().clear();
    }

    /// Queues `d` for every reader but `from`.
    pub fn changed(&self, d: Dir, from: Option<u64>) {
        if let Some(tx) = self.changes.lock().as_ref() {
            let _ = tx.send(Change { d, from });
        }
    }

    pub fn nreaders(&self) -> usize {
        self.readers.lock().len()
    }

    /// Registers a `/Chg` reader for `client`; the stream starts with the version token.
    pub fn register(&self, client: u64, tag: &str) -> ByteStream {
        let (tx, rx) = mpsc::channel(READER_BUFFER);
        let why = Arc::new(Mutex::new(None));
        // Fresh channel: the first send always fits.
        let _ = tx.try_send(Ok(Bytes::from_static(CHG_VERSION.as_bytes())));
        let reg = self.next_reg.fetch_add(1, Ordering::Relaxed);
        self.readers.lock().push(Reader {
            reg,
            client,
            tag: tag.to_owned(),
            tx,
            why: Arc::clone(&why),
        });
        debug!(client = tag, "new /Chg reader");
        stream::unfold((rx, why, false), |(mut rx, why, done)| async move {
            if done {
                return None;
            }
            match rx.recv().await {
                Some(msg) => Some((msg, (rx, why, false))),
                None => {
                    let err = why.lock().take()?;
                    Some((Err(err), (rx, why, true)))
                }
            }
        })
        .boxed()
    }

    /// Sends `c` to every reader but its originator, all at once, evicting the ones that do not
    /// keep up. Each change waits at most `ival_tout` for its slowest reader.
    async fn post(&self, c: &Change) {
        let msg = inval_msg(&c.d);
        let targets: Vec<(u64, String, mpsc::Sender<Result<Bytes>>)> = self
            .readers
            .lock()
            .iter()
            .filter(|r| Some(r.client) != c.from)
            .map(|r| (r.reg, r.tag.clone(), r.tx.clone()))
            .collect();
        let sends = targets.into_iter().map(|(reg, tag, tx)| {
            let msg = msg.clone();
            async move {
                let res = timeout(self.ival_tout, tx.send(Ok(msg))).await;
                (reg, tag, res)
            }
        });
        for (reg, tag, res) in join_all(sends).await {
            match res {
                Ok(Ok(())) => {
                    trace!(client = %tag, path = c.d.path(), "posted inval");
                    continue;
                }
                Ok(Err(_)) => debug!(client = %tag, "/Chg reader gone"),
                Err(_) => {
                    warn!(client = %tag, "slow reader client: closing its /Chg");
                    self.evict(reg, Error::SlowReader);
                    continue;
                }
            }
            self.readers.lock().retain(|r| r.reg != reg);
        }
    }

    fn evict(&self, reg: u64, why: Error) {
        let mut readers = self.readers.lock();
        if let Some(i) = readers.iter().position(|r| r.reg == reg) {
            let r = readers.swap_remove(i);
            *r.why.lock() = Some(why);
        }
    }

    /// No more changes will be queued; the fan-out proc ends once it drains the queue.
    pub fn close(&self) {
        self.changes.lock().take();
    }

    /// Ends every `/Chg` we serve.
    pub fn evict_all(&self, server: &str) {
        for r in self.readers.lock().drain(..) {
            *r.why.lock() = Some(Error::Closed(server.to_owned()));
        }
    }
}

impl<C: Tree, B: Tree> Cfs<C, B> {
    /// Announces a change made through this handle to the other `/Chg` readers.
    pub(super) fn changed(&self, d: &Dir) {
        if self.debugging() {
            debug!(path = d.path(), "changed");
        }
        self.inner.invals.changed(d.clone(), self.client_id());
    }

    /// Announces a change found upstream to every `/Chg` reader.
    pub(super) fn changed_upstream(&self, d: &Dir) {
        if self.debugging() {
            debug!(path = d.path(), "changed upstream");
        }
        self.inner.invals.changed(d.clone(), None);
    }

    /// `get("/Chg")`: a stream of invalidations for this handle's client.
    pub(super) fn get_chg(&self) -> Result<ByteStream> {
        if self.inner.no_inval_proto {
            return Err(Error::NotExist("/Chg: invalidations disabled".to_owned()));
        }
        let Some(ci) = self.client.as_ref() else {
            return Err(Error::Perm("/Chg: no client info".to_owned()));
        };
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(Error::Closed(self.inner.name.clone()));
        }
        Ok(self.inner.invals.register(ci.id, &ci.tag))
    }

    pub(super) async fn fanout_proc(self, mut changes: mpsc::UnboundedReceiver<Change>) {
        debug!(cfs = %self.inner.name, "fan-out proc started");
        while let Some(c) = changes.recv().await {
            self.inner.invals.post(&c).await;
        }
        debug!(cfs = %self.inner.name, "fan-out proc done");
    }

    /// Reads the backing `/Chg` and queues what it says for the applier.
    pub(super) async fn ingest_proc(
        self,
        mut chg: ByteStream,
        invals: mpsc::UnboundedSender<Dir>,
        mut closing: watch::Receiver<bool>,
    ) {
        debug!(cfs = %self.inner.name, "ingest proc started");
        let err = loop {
            let msg = tokio::select! {
                _ = closing.wait_for(|c| *c) => {
                    debug!(cfs = %self.inner.name, "ingest proc done");
                    return;
                }
                msg = chg.next() => msg,
            };
            match msg {
                Some(Ok(buf)) => match Dir::unpack_all(&buf) {
                    Ok(ds) => {
                        for d in ds {
                            let _ = invals.send(d);
                        }
                    }
                    Err(e) => debug!(error = %e, "bad inval"),
                },
                Some(Err(e)) => break e.to_string(),
                None => break "eof".to_owned(),
            }
        };
        self.inner.invals.clear_epoch();
        warn!(cfs = %self.inner.name, error = %err, "/Chg closed: falling back to timeouts");
        tokio::select! {
            _ = closing.wait_for(|c| *c) => {}
            () = sleep(Duration::from_secs(1)) => {}
        }
        debug!(cfs = %self.inner.name, "ingest proc done");
    }

    /// Applies invalidations from the backing tree, one at a time.
    pub(super) async fn applier_proc(self, mut invals: mpsc::UnboundedReceiver<Dir>) {
        debug!(cfs = %self.inner.name, "applier proc started");
        while let Some(d) = invals.recv().await {
            if self.debugging() {
                debug!(inval = %d, "srv invalidating");
            }
            locks::traced(async {
                self.invalidate(d).await;
                if let Some(tracer) = self.inner.ci.locks().tracer() {
                    tracer.no_locks();
                }
            })
            .await;
        }
        debug!(cfs = %self.inner.name, "applier proc done");
    }
}
