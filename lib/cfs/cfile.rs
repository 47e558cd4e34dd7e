//! Cached entries as seen by one operation, and their refresh from the backing tree.
//!
//! A [`CFile`] is a snapshot of a cache-tree entry together with the lock on its cache state.
//! Refreshing may release the lock and take it again exclusively; a refresh that fails leaves
//! the entry unlocked.

use std::time::SystemTime;

use bytes::Bytes;
use tracing::{debug, warn};

use super::Cfs;
use crate::cache::{State, UNREAD};
use crate::dir::{CACHE, Dir, RTIME, is_upper_attr};
use crate::error::{Error, Result};
use crate::io;
use crate::locks::{Access, PathGuard};
use crate::path;
use crate::tree::{ByteStream, Tree};

/// What a metadata refresh found changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Chg {
    Nothing,
    Meta,
    Data,
}

/// The paths served by the engine itself.
pub(super) fn is_synthetic(p: &str) -> bool {
    matches!(p, "/Ctl" | "/Chg")
}

pub(super) struct CFile {
    pub d: Dir,
    /// `d` has changes not yet written to the cache tree.
    pub dirty: bool,
    path: String,
    /// User attributes found deleted upstream, to be removed on the next write.
    dropped: Vec<String>,
    guard: Option<PathGuard>,
}

impl CFile {
    pub fn locked(d: Dir, guard: PathGuard) -> Self {
        Self {
            path: guard.path().to_owned(),
            d,
            dirty: false,
            dropped: Vec::new(),
            guard: Some(guard),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn access(&self) -> Option<Access> {
        self.guard.as_ref().map(PathGuard::access)
    }

    pub fn unlock(&mut self) {
        self.guard = None;
    }

    pub async fn relock(&mut self, access: Access) {
        if let Some(g) = self.guard.take() {
            self.guard = Some(g.relock(access).await);
        }
    }

    pub fn into_dir(self) -> Dir {
        self.d
    }
}

/// Outcome of a walk.
pub(super) enum Walked {
    Found(CFile),
    /// The last element is not there; carries its parent directory.
    Missing(Dir),
}

fn take_named(ds: &mut Vec<Dir>, name: &str) -> Option<Dir> {
    let i = ds.iter().position(|d| d.name() == name)?;
    Some(ds.swap_remove(i))
}

impl<C: Tree, B: Tree> Cfs<C, B> {
    pub(super) async fn lock(&self, path: &str, access: Access) -> PathGuard {
        self.inner.ci.locks().lock_data_as(path, access).await
    }

    /// Locks `path` and reads its cache-tree entry. Nothing stays locked on failure.
    pub(super) async fn cwalk(&self, path: &str, access: Access) -> Result<CFile> {
        let guard = self.lock(path, access).await;
        let d = self.inner.cache.stat(path).await?;
        Ok(CFile::locked(d, guard))
    }

    fn stale(&self, d: &Dir) -> bool {
        let epoch = self.epoch();
        if !epoch.is_empty() {
            return d.attr(RTIME) != epoch;
        }
        SystemTime::now()
            .duration_since(d.time(RTIME))
            .is_ok_and(|age| age > self.inner.tuning.cache_tout)
    }

    /// Only unread or clean entries can have stale metadata.
    fn stale_meta(&self, d: &Dir) -> bool {
        if is_synthetic(d.path()) {
            return false;
        }
        match self.inner.ci.state(d) {
            State::Unread | State::Clean => self.stale(d),
            _ => false,
        }
    }

    /// Unread entries always need data; entries with local data changes never do.
    fn stale_data(&self, d: &Dir) -> bool {
        if is_synthetic(d.path()) {
            return false;
        }
        match self.inner.ci.state(d) {
            State::Data | State::New => false,
            State::Unread | State::UnreadMeta => true,
            _ => self.stale(d),
        }
    }

    pub(super) fn set_rtime(&self, d: &mut Dir) {
        let epoch = self.epoch();
        if epoch.is_empty() {
            d.set_time(RTIME, SystemTime::now());
        } else {
            d.set(RTIME, epoch);
        }
    }

    /// Makes the metadata of `f` fresh. `f` keeps its access on success.
    pub(super) async fn need_meta(&self, f: &mut CFile) -> Result<()> {
        let want = f.access().unwrap_or(Access::Write);
        if !self.stale_meta(&f.d) {
            return Ok(());
        }
        if want == Access::Read && !self.upgrade(f, Self::stale_meta).await? {
            return Ok(());
        }
        let nd = match self.inner.backing.stat(&f.path).await {
            Ok(nd) => nd,
            Err(e) => {
                debug!(path = %f.path, error = %e, "refresh meta");
                if e.is_not_exist() && f.path != "/" {
                    self.gone(f).await;
                }
                f.unlock();
                return Err(e);
            }
        };
        self.got_meta(f, nd).await;
        if f.dirty {
            if self.debugging() {
                debug!(entry = %f.d, "refreshed meta");
            }
            self.write_meta(f).await;
        }
        if want == Access::Read {
            f.relock(Access::Read).await;
        }
        Ok(())
    }

    /// Takes `f` exclusively and reloads it. False if `stale` no longer holds, in which case `f`
    /// is back to shared access.
    async fn upgrade(&self, f: &mut CFile, stale: fn(&Self, &Dir) -> bool) -> Result<bool> {
        f.relock(Access::Write).await;
        match self.inner.cache.stat(&f.path).await {
            Ok(d) => f.d = d,
            Err(e) => {
                f.unlock();
                return Err(e);
            }
        }
        if stale(self, &f.d) {
            return Ok(true);
        }
        f.relock(Access::Read).await;
        Ok(false)
    }

    /// Makes the data of `f` fresh. With `notify`, changes found are announced on `/Chg`.
    pub(super) async fn need_data(&self, f: &mut CFile, notify: bool) -> Result<()> {
        let want = f.access().unwrap_or(Access::Write);
        if !self.stale_data(&f.d) {
            return Ok(());
        }
        if want == Access::Read && !self.upgrade(f, Self::stale_data).await? {
            return Ok(());
        }
        if let Err(e) = self.refresh_data(f, notify).await {
            debug!(path = %f.path, error = %e, "refresh data");
            f.unlock();
            return Err(e);
        }
        if want == Access::Read {
            f.relock(Access::Read).await;
        }
        Ok(())
    }

    async fn refresh_data(&self, f: &mut CFile, notify: bool) -> Result<()> {
        let nd = match self.inner.backing.stat(&f.path).await {
            Ok(nd) => nd,
            Err(e) => {
                if e.is_not_exist() && f.path != "/" {
                    self.gone(f).await;
                }
                return Err(e);
            }
        };
        let chg = self.got_meta(f, nd).await;
        if notify && chg != Chg::Nothing {
            self.changed_upstream(&f.d);
        }
        let st = self.inner.ci.state(&f.d);
        // Without invalidations, child metadata changes show up only by reading the directory.
        let forced = f.d.is_dir() && self.epoch().is_empty();
        if !forced && chg != Chg::Data && !matches!(st, State::Unread | State::UnreadMeta) {
            if f.dirty {
                self.write_meta(f).await;
            }
            return Ok(());
        }
        let res = self.fetch_data(f, chg, notify).await;
        if res.is_err() {
            self.inner.ci.inval_data(&mut f.d);
            self.write_meta(f).await;
        }
        res
    }

    async fn fetch_data(&self, f: &mut CFile, chg: Chg, notify: bool) -> Result<()> {
        let data = self.inner.backing.get(&f.path, 0, None, "").await?;
        self.inner.ci.clean(&mut f.d);
        if f.d.is_dir() {
            if chg != Chg::Nothing || f.dirty {
                self.write_meta(f).await;
            }
            return self.get_dir_data(f, data, notify).await;
        }
        if self.debugging() {
            debug!(entry = %f.d, "refresh data");
        }
        f.dirty = false;
        let nd = self
            .inner
            .cache
            .put(&f.path, f.d.usr_attrs(), 0, data, "")
            .await?;
        f.d.merge(&nd);
        Ok(())
    }

    /// Reconciles the cached children of the directory `f` with the listing in `data`.
    async fn get_dir_data(&self, f: &mut CFile, data: ByteStream, notify: bool) -> Result<()> {
        let mut nds = io::collect_dirs(data).await?;
        let ods = io::get_dir(&self.inner.cache, &f.path).await?;
        for od in &ods {
            let p = path::join(&f.path, od.name());
            if is_synthetic(&p) {
                continue;
            }
            let nd = take_named(&mut nds, od.name());
            let Ok(mut cf) = self.cwalk(&p, Access::Write).await else {
                continue;
            };
            if !matches!(self.inner.ci.state(&cf.d), State::Unread | State::Clean) {
                continue;
            }
            match nd {
                None => {
                    self.gone(&mut cf).await;
                    if notify {
                        self.changed_upstream(&cf.d);
                    }
                }
                Some(nd) => {
                    if self.got_meta(&mut cf, nd).await != Chg::Nothing && notify {
                        self.changed_upstream(&cf.d);
                    }
                    if cf.dirty {
                        self.write_meta(&mut cf).await;
                    }
                }
            }
        }
        for mut nd in nds {
            let p = path::join(&f.path, nd.name());
            if is_synthetic(&p) || nd.is_removed() {
                continue;
            }
            nd.set("path", p.as_str());
            // Removed locally and not pushed yet.
            if self.inner.ci.state(&nd) == State::Del {
                continue;
            }
            let guard = self.lock(&p, Access::Write).await;
            match self.inner.cache.stat(&p).await {
                // Created while unlocked: not news; announced by whoever made it.
                Ok(od) => {
                    let mut cf = CFile::locked(od, guard);
                    self.got_meta(&mut cf, nd).await;
                    self.write_meta(&mut cf).await;
                }
                Err(_) => {
                    let mut cf = CFile::locked(nd, guard);
                    match self.came(&mut cf).await {
                        Ok(()) if notify => self.changed_upstream(&cf.d),
                        Ok(()) => {}
                        Err(e) => warn!(path = %p, error = %e, "cache: came"),
                    }
                }
            }
        }
        Ok(())
    }

    /// Merges the backing-tree entry `nd` into `f` and reports what changed. Data found changed
    /// is marked unread. Metadata with local changes pending is kept.
    pub(super) async fn got_meta(&self, f: &mut CFile, nd: Dir) -> Chg {
        let root = f.path == "/";
        if nd.is_removed() {
            if root {
                return Chg::Nothing;
            }
            self.gone(f).await;
            return Chg::Data;
        }
        if (nd.is_dir() || f.d.is_dir()) && nd.typ() != f.d.typ() {
            if root {
                return Chg::Nothing;
            }
            self.gone(f).await;
            f.d = nd;
            f.d.set("path", f.path.as_str());
            if let Err(e) = self.came(f).await {
                warn!(path = %f.path, error = %e, "cache: came");
            }
            return Chg::Data;
        }

        let keep_local = matches!(
            self.inner.ci.state(&f.d),
            State::Meta | State::UnreadMeta
        );
        let unread = f.d.attr(CACHE) == UNREAD;
        let is_dir = f.d.is_dir();
        let (mut cmeta, mut cdata) = (false, false);
        let mut why = "";
        for (k, v) in nd.iter() {
            if f.d.attr(k) == v || k == RTIME || k == CACHE {
                continue;
            }
            match k {
                "Sum" => {
                    if f.d.attr(k).is_empty() || v.is_empty() {
                        continue;
                    }
                    f.d.set(k, v);
                    cdata |= !unread;
                }
                "mtime" if !is_dir => {
                    f.d.set(k, v);
                    if unread {
                        cmeta = true;
                    } else {
                        cdata = true;
                    }
                }
                "size" => {
                    f.d.set(k, v);
                    if !unread {
                        cdata = true;
                    } else if !is_dir {
                        cmeta = true;
                    }
                }
                k if (is_upper_attr(k) || k == "mode") && !keep_local => {
                    f.d.set(k, v);
                    cmeta = true;
                }
                _ => {}
            }
            if why.is_empty() && (cdata || cmeta) {
                why = k;
            }
        }
        if !keep_local {
            let deleted: Vec<String> = f
                .d
                .iter()
                .filter(|&(k, _)| {
                    is_upper_attr(k)
                        && !nd.contains(k)
                        && !matches!(k, "Wuid" | "Sum" | RTIME | CACHE)
                })
                .map(|(k, _)| k.to_owned())
                .collect();
            for k in deleted {
                f.d.remove(&k);
                f.dropped.push(k);
                cmeta = true;
            }
        }
        if self.debugging() && (cdata || cmeta) {
            debug!(path = %f.path, why, data = cdata, "changed upstream");
        }

        let rtime = f.d.attr(RTIME).to_owned();
        self.set_rtime(&mut f.d);
        f.dirty |= cdata || cmeta || rtime != f.d.attr(RTIME);
        if cdata {
            self.inner.ci.inval_data(&mut f.d);
            return Chg::Data;
        }
        if cmeta { Chg::Meta } else { Chg::Nothing }
    }

    /// Writes the metadata of `f` to the cache tree.
    pub(super) async fn write_meta(&self, f: &mut CFile) {
        f.dirty = false;
        let mut d = f.d.usr_attrs();
        for k in f.dropped.drain(..) {
            d.set(k, "");
        }
        if let Err(e) = self.inner.cache.wstat(&f.path, d).await {
            if e.is_perm() {
                warn!(path = %f.path, error = %e, "cache tree refuses wstat");
            } else {
                debug!(path = %f.path, error = %e, "cache: wstat");
            }
        }
    }

    /// `f` no longer exists in the backing tree: drop it from the cache.
    pub(super) async fn gone(&self, f: &mut CFile) {
        if f.path == "/" {
            warn!("backing tree lost /: ignored");
            return;
        }
        if self.debugging() {
            debug!(path = %f.path, "gone");
        }
        if let Err(e) = self.inner.cache.remove_all(&f.path).await {
            debug!(path = %f.path, error = %e, "cache: remove");
        }
        f.d.set("path", f.path.as_str());
        f.d.set_time("mtime", SystemTime::now());
        self.inner.ci.gone(&mut f.d);
        f.dirty = false;
    }

    /// `f` appeared in the backing tree: add it to the cache, data unread.
    pub(super) async fn came(&self, f: &mut CFile) -> Result<()> {
        if self.debugging() {
            debug!(entry = %f.d, "came");
        }
        self.inner.ci.inval_data(&mut f.d);
        f.d.remove("rm");
        self.set_rtime(&mut f.d);
        f.dirty = false;
        let mut d = f.d.usr_attrs();
        if f.d.is_dir() {
            return self.inner.cache.mkdir(&f.path, d).await;
        }
        if d.attr("mode").is_empty() {
            d.set("mode", "0644");
        }
        io::put_all(&self.inner.cache, &f.path, d, Bytes::new())
            .await
            .map(drop)
    }

    /// Applies one invalidation from the backing tree.
    pub(super) async fn invalidate(&self, d: Dir) {
        if d.is_empty() {
            return;
        }
        if d.path().is_empty() {
            warn!(inval = %d, "inval with no path");
            return;
        }
        let p = d.path().to_owned();
        if p != "/" {
            // Changes below directories never read are of no interest.
            match self.cwalk(path::parent(&p), Access::Write).await {
                Err(_) => {
                    debug!(path = %p, "inval ignored: no parent");
                    return;
                }
                Ok(pf)
                    if matches!(
                        self.inner.ci.state(&pf.d),
                        State::Unread | State::UnreadMeta
                    ) =>
                {
                    debug!(path = %p, "inval ignored: parent unread");
                    return;
                }
                Ok(_) => {}
            }
        }

        let guard = self.lock(&p, Access::Write).await;
        let mut f = match self.inner.cache.stat(&p).await {
            Ok(cd) => CFile::locked(cd, guard),
            Err(_) if d.is_removed() => return,
            Err(e) if e.is_not_exist() => {
                let mut f = CFile::locked(d, guard);
                match self.came(&mut f).await {
                    Ok(()) => self.changed_upstream(&f.d),
                    Err(e) => warn!(path = %p, error = %e, "inval: came"),
                }
                return;
            }
            Err(e) => {
                warn!(path = %p, error = %e, "inval: cache");
                return;
            }
        };
        let st = self.inner.ci.state(&f.d);
        if !matches!(st, State::Unread | State::Clean) {
            debug!(path = %p, state = %st, "inval ignored: local changes");
            return;
        }
        let chg = self.got_meta(&mut f, d).await;
        if f.dirty {
            self.write_meta(&mut f).await;
        }
        if chg != Chg::Nothing {
            self.changed_upstream(&f.d);
        }
    }

    /// Walks to `path`, refreshing every directory on the way and the metadata of the last
    /// element, which is left locked with `access`. Intermediate directories are released as
    /// the walk moves on.
    pub(super) async fn walk(&self, path: &str, access: Access) -> Result<Walked> {
        match self.walk_once(path, access).await {
            // Something vanished upstream while we walked; the cache knows now.
            Err(e) if e.is_not_exist() => self.walk_once(path, access).await,
            res => res,
        }
    }

    async fn walk_once(&self, path: &str, access: Access) -> Result<Walked> {
        let els = path::elems(path);
        let first = if els.is_empty() { access } else { Access::Read };
        let mut f = self.cwalk("/", first).await?;
        for (i, el) in els.iter().enumerate() {
            if f.d.is_dir() {
                self.need_data(&mut f, false).await?;
            } else {
                self.need_meta(&mut f).await?;
            }
            if !f.d.is_dir() {
                return Err(Error::NotDir(f.path.clone()));
            }
            if self.checks_perms() && !f.d.can_walk(self.ai()) {
                return Err(Error::Perm(f.path.clone()));
            }
            let last = i + 1 == els.len();
            let next = path::join(&f.path, el);
            let parent = f.into_dir();
            f = match self.cwalk(&next, if last { access } else { Access::Read }).await {
                Ok(nf) => nf,
                Err(e) if last && e.is_not_exist() => return Ok(Walked::Missing(parent)),
                Err(e) => return Err(e),
            };
        }
        self.need_meta(&mut f).await?;
        Ok(Walked::Found(f))
    }

    /// Like [`walk`](Self::walk), failing when the last element is missing.
    pub(super) async fn walk_existing(&self, path: &str, access: Access) -> Result<CFile> {
        match self.walk(path, access).await? {
            Walked::Found(f) => Ok(f),
            Walked::Missing(_) => Err(Error::NotExist(path.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfs::{CfsOptions, Tuning};
    use crate::tree::MemTree;

    async fn cfs() -> (Cfs<MemTree, MemTree>, MemTree, MemTree) {
        let (cache, backing) = (MemTree::new("cache"), MemTree::new("backing"));
        let opts = CfsOptions {
            no_inval_proto: true,
            tuning: Tuning::default(),
            ..CfsOptions::default()
        };
        let fs = Cfs::new("cfs", cache.clone(), backing.clone(), opts)
            .await
            .unwrap();
        (fs, cache, backing)
    }

    async fn cached(fs: &Cfs<MemTree, MemTree>, cache: &MemTree, d: Dir) -> CFile {
        io::put_all(cache, d.path(), d.usr_attrs(), "abc").await.unwrap();
        fs.cwalk(d.path(), Access::Write).await.unwrap()
    }

    #[tokio::test]
    async fn read_file_with_new_mtime_needs_data() {
        let (fs, cache, _) = cfs().await;
        let d = Dir::from([
            ("path", "/f"),
            ("type", "-"),
            ("mode", "0644"),
            ("mtime", "1"),
            ("Cache", "read"),
        ]);
        let mut f = cached(&fs, &cache, d).await;
        let nd = Dir::from([("path", "/f"), ("type", "-"), ("mode", "0644"), ("mtime", "2")]);
        assert_eq!(fs.got_meta(&mut f, nd).await, Chg::Data);
        assert_eq!(f.d.attr(CACHE), UNREAD);
        assert!(f.dirty);
        drop(f);
        fs.close().await;
    }

    #[tokio::test]
    async fn unread_file_with_new_mtime_is_meta() {
        let (fs, cache, _) = cfs().await;
        let d = Dir::from([
            ("path", "/f"),
            ("type", "-"),
            ("mode", "0644"),
            ("mtime", "1"),
            ("Cache", UNREAD),
        ]);
        let mut f = cached(&fs, &cache, d).await;
        let nd = Dir::from([("path", "/f"), ("type", "-"), ("mode", "0644"), ("mtime", "2")]);
        assert_eq!(fs.got_meta(&mut f, nd).await, Chg::Meta);
        drop(f);
        fs.close().await;
    }

    #[tokio::test]
    async fn deleted_user_attrs_are_dropped() {
        let (fs, cache, _) = cfs().await;
        let d = Dir::from([
            ("path", "/f"),
            ("type", "-"),
            ("mode", "0644"),
            ("Color", "red"),
            ("Wuid", "nemo"),
        ]);
        let mut f = cached(&fs, &cache, d).await;
        let nd = Dir::from([("path", "/f"), ("type", "-"), ("mode", "0644")]);
        assert_eq!(fs.got_meta(&mut f, nd).await, Chg::Meta);
        assert!(!f.d.contains("Color"));
        assert_eq!(f.d.attr("Wuid"), "nemo");
        fs.write_meta(&mut f).await;
        assert!(!cache.stat("/f").await.unwrap().contains("Color"));
        drop(f);
        fs.close().await;
    }

    #[tokio::test]
    async fn file_turned_dir_is_replaced() {
        let (fs, cache, _) = cfs().await;
        let d = Dir::from([("path", "/x"), ("type", "-"), ("mode", "0644")]);
        let mut f = cached(&fs, &cache, d).await;
        let nd = Dir::from([("path", "/x"), ("name", "x"), ("type", "d"), ("mode", "0755")]);
        assert_eq!(fs.got_meta(&mut f, nd).await, Chg::Data);
        assert!(cache.stat("/x").await.unwrap().is_dir());
        drop(f);
        fs.close().await;
    }

    #[tokio::test]
    async fn only_rtime_changes_mark_dirty() {
        let (fs, cache, _) = cfs().await;
        let d = Dir::from([("path", "/f"), ("type", "-"), ("mode", "0644")]);
        let mut f = cached(&fs, &cache, d).await;
        let nd = f.d.clone();
        assert_eq!(fs.got_meta(&mut f, nd).await, Chg::Nothing);
        assert!(f.dirty);
        assert!(!f.d.attr(RTIME).is_empty());
        drop(f);
        fs.close().await;
    }
}
