//! Polling for external changes when the backing tree has no `/Chg`.

use futures::FutureExt as _;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::Cfs;
use crate::cache::UNREAD;
use crate::dir::CACHE;
use crate::io;
use crate::locks::{self, Access};
use crate::path;
use crate::tree::Tree;
use crate::work::WorkPool;

impl<C: Tree, B: Tree> Cfs<C, B> {
    /// Walks the directories already read every `poll_ival`, refreshing them and announcing
    /// what changed.
    pub(super) async fn poll_proc(self, mut closing: watch::Receiver<bool>) {
        debug!(cfs = %self.inner.name, ival = ?self.inner.tuning.poll_ival, "poller started");
        let pool = WorkPool::new(self.inner.tuning.nsyncers);
        loop {
            tokio::select! {
                _ = closing.wait_for(|c| *c) => break,
                () = sleep(self.inner.tuning.poll_ival) => {}
            }
            if self.debugging() {
                debug!(cfs = %self.inner.name, "polling");
            }
            locks::traced(async {
                self.clone().poll(pool.clone(), "/".to_owned()).await;
                if let Some(tracer) = self.inner.ci.locks().tracer() {
                    tracer.no_locks();
                }
            })
            .await;
        }
        pool.wait().await;
        debug!(cfs = %self.inner.name, "poller done");
    }

    fn poll(self, pool: WorkPool, path: String) -> BoxFuture<'static, ()> {
        async move {
            let mut f = match self.cwalk(&path, Access::Write).await {
                Ok(f) => f,
                Err(e) => {
                    if !e.is_not_exist() {
                        warn!(path, error = %e, "poll");
                    }
                    return;
                }
            };
            if !f.d.is_dir() || f.d.attr(CACHE) == UNREAD {
                return;
            }
            if let Err(e) = self.need_data(&mut f, true).await {
                if !e.is_not_exist() {
                    warn!(path, error = %e, "poll");
                }
                return;
            }
            if f.d.is_removed() || !f.d.is_dir() {
                return;
            }
            let kids = io::get_dir(&self.inner.cache, &path).await;
            f.unlock();
            let kids = match kids {
                Ok(kids) => kids,
                Err(e) => {
                    warn!(path, error = %e, "poll");
                    return;
                }
            };
            let mut batch = pool.batch();
            for cd in kids {
                if !cd.is_dir() || cd.is_removed() || cd.attr(CACHE) == UNREAD {
                    continue;
                }
                let cp = path::join(&path, cd.name());
                batch.submit(self.clone().poll(pool.clone(), cp)).await;
            }
            batch.wait().await;
        }
        .boxed()
    }
}
