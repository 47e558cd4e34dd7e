//! The tree operations served by the engine.

use std::sync::Arc;
use std::time::SystemTime;

use futures::future::BoxFuture;
use futures::{FutureExt as _, StreamExt as _, TryStreamExt as _, stream};
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use super::Cfs;
use super::cfile::{CFile, Walked, is_synthetic};
use super::ctl::{chg_dir, ctl_dir};
use crate::dir::{CACHE, Dir, RTIME};
use crate::error::{Error, Result};
use crate::io;
use crate::locks::{self, Access};
use crate::path::{self, abs_path};
use crate::pred::Pred;
use crate::stats::Op;
use crate::tree::{ByteStream, DirData, DirDataStream, DirStream, Tree};

const FIND_BUFFER: usize = 16;

fn match_pred(path: &str, d: &Dir, pred: &str) -> Result<()> {
    if pred.is_empty() || Pred::new(pred)?.matches(d) {
        return Ok(());
    }
    Err(Error::NoMatch(path.to_owned()))
}

/// Shows `/Ctl` in the root listing. `/Chg` stays hidden.
fn add_ctl(ds: &mut Vec<Dir>, ctl: Dir) {
    match ds.iter_mut().find(|d| d.name() == "Ctl") {
        Some(d) => *d = ctl,
        None => {
            ds.push(ctl);
            ds.sort_by(|a, b| a.name().cmp(b.name()));
        }
    }
}

/// Takes `Mode` as a `mode` that is not to be blended with the parent's. True if it was there.
fn take_mode(d: &mut Dir) -> bool {
    match d.remove("Mode").filter(|m| !m.is_empty()) {
        Some(m) => {
            d.set("mode", m);
            true
        }
        None => false,
    }
}

fn fix_path(mut d: Dir, spref: &str, dpref: &str) -> Dir {
    let p = path::rebase(d.path(), spref, dpref);
    d.set("path", p);
    d.strip_cache_attrs();
    d
}

impl<C: Tree, B: Tree> Cfs<C, B> {
    pub(super) async fn stat_op(&self, path: &str) -> Result<Dir> {
        let path = abs_path(path)?;
        match path.as_str() {
            "/Ctl" => return Ok(ctl_dir(&self.inner.user)),
            "/Chg" if !self.inner.no_inval_proto => return Ok(chg_dir(&self.inner.user)),
            _ => {}
        }
        let mut d = self.walk_existing(&path, Access::Read).await?.into_dir();
        d.strip_cache_attrs();
        Ok(d)
    }

    pub(super) async fn get_op(
        &self,
        path: &str,
        off: u64,
        count: Option<u64>,
        pred: &str,
    ) -> Result<ByteStream> {
        let path = abs_path(path)?;
        match path.as_str() {
            "/Ctl" => return self.get_ctl(off, count).await,
            "/Chg" => return self.get_chg(),
            _ => {}
        }
        let mut f = self.walk_existing(&path, Access::Read).await?;
        if self.checks_perms() && !f.d.can_read(self.ai()) {
            return Err(Error::Perm(path));
        }
        match_pred(&path, &f.d, pred)?;
        self.need_data(&mut f, false).await?;
        let stats = Arc::clone(&self.inner.stats);
        if f.d.is_dir() {
            let ds = io::get_dir(&self.inner.cache, &path).await;
            drop(f);
            let mut ds = ds?;
            for d in &mut ds {
                d.strip_cache_attrs();
            }
            if path == "/" {
                add_ctl(&mut ds, ctl_dir(&self.inner.user));
            }
            let n: usize = ds.iter().map(|d| d.pack().len()).sum();
            stats.bytes(Op::Get, n as u64);
            return Ok(io::dirs(ds));
        }
        let data = self.inner.cache.get(&path, off, count, "").await;
        drop(f);
        Ok(data?
            .inspect_ok(move |b| stats.bytes(Op::Get, b.len() as u64))
            .boxed())
    }

    pub(super) async fn put_op(
        &self,
        path: &str,
        mut d: Dir,
        off: i64,
        data: ByteStream,
        pred: &str,
    ) -> Result<Dir> {
        let path = abs_path(path)?;
        match path.as_str() {
            "/" | "/Chg" => return Err(Error::Perm(path)),
            "/Ctl" => {
                self.put_ctl(data).await?;
                return Ok(Dir::from([("path", "/Ctl"), ("size", "0")]));
            }
            _ => {}
        }
        self.check_writable()?;
        d.strip_cache_attrs();
        let noinherit = take_mode(&mut d);
        let creating = !d.attr("mode").is_empty();

        // The parent first: locks are taken root first.
        let pd = self
            .walk_existing(path::parent(&path), Access::Read)
            .await?
            .into_dir();
        if !pd.is_dir() {
            return Err(Error::NotDir(pd.path().to_owned()));
        }
        let (mut f, missing, created) = match self.walk(&path, Access::Write).await? {
            Walked::Found(f) => {
                match_pred(&path, &f.d, pred)?;
                (f, false, false)
            }
            Walked::Missing(_) => {
                if !creating {
                    return Err(Error::NotExist(path));
                }
                let guard = self.lock(&path, Access::Write).await;
                match self.inner.cache.stat(&path).await {
                    // Created by someone else while we were not looking.
                    Ok(od) => {
                        match_pred(&path, &od, pred)?;
                        (CFile::locked(od, guard), true, false)
                    }
                    Err(e) if !e.is_not_exist() => return Err(e),
                    Err(_) => {
                        let uid = self.uid();
                        let mut nd = Dir::from([
                            ("path", path.as_str()),
                            ("name", path::base(&path)),
                            ("type", "-"),
                            ("mode", d.attr("mode")),
                            ("Uid", uid),
                            ("Wuid", uid),
                        ]);
                        if !pd.attr("Gid").is_empty() {
                            nd.set("Gid", pd.attr("Gid"));
                        }
                        match_pred(&path, &nd, pred)?;
                        (CFile::locked(nd, guard), true, true)
                    }
                }
            }
        };
        if f.d.is_dir() || d.is_dir() {
            return Err(Error::IsDir(path));
        }
        let wd = if missing { &pd } else { &f.d };
        if self.checks_perms() && !wd.can_write(self.ai()) {
            return Err(Error::Perm(path));
        }
        if creating && !noinherit {
            let mut md = Dir::from([("type", "-"), ("mode", f.d.attr("mode"))]);
            md.inherit(pd.mode());
            d.set("mode", md.attr("mode"));
        }
        f.d.can_wstat(self.ai(), &d.usr_attrs())?;
        // Writes into an existing file need its current data.
        if !created && !creating {
            self.need_data(&mut f, false).await?;
        }

        if created {
            self.inner.ci.created_busy(&mut f.d);
        } else {
            self.inner.ci.dirty_data_busy(&mut f.d);
        }
        self.set_rtime(&mut f.d);
        let mut put_attrs = d.usr_attrs();
        f.d.merge(&put_attrs);
        put_attrs.set(RTIME, f.d.attr(RTIME));
        put_attrs.set(CACHE, f.d.attr(CACHE));
        put_attrs.set("Wuid", self.uid());
        if created {
            for k in ["Uid", "Gid"] {
                if put_attrs.attr(k).is_empty() && !f.d.attr(k).is_empty() {
                    put_attrs.set(k, f.d.attr(k));
                }
            }
        }
        f.unlock();

        let stats = Arc::clone(&self.inner.stats);
        let data = data
            .inspect_ok(move |b| stats.bytes(Op::Put, b.len() as u64))
            .boxed();
        let res = self.inner.cache.put(&path, put_attrs, off, data, "").await;
        let guard = self.lock(&path, Access::Write).await;
        self.inner.ci.not_busy(&f.d);
        let nd = self.inner.cache.stat(&path).await;
        drop(guard);
        res?;
        let mut nd = nd?;
        self.changed(&nd);
        nd.strip_cache_attrs();
        Ok(nd)
    }

    pub(super) async fn mkdir_op(&self, path: &str, mut d: Dir) -> Result<()> {
        let path = abs_path(path)?;
        self.check_writable()?;
        if matches!(path.as_str(), "/" | "/Ctl" | "/Chg") {
            return Err(Error::Exists(path));
        }
        let pd = match self.walk(&path, Access::Read).await? {
            Walked::Found(_) => return Err(Error::Exists(path)),
            Walked::Missing(pd) => pd,
        };
        let _guard = self.lock(&path, Access::Write).await;
        if self.inner.cache.stat(&path).await.is_ok() {
            return Err(Error::Exists(path));
        }
        d.strip_cache_attrs();
        let noinherit = take_mode(&mut d);
        if d.attr("mode").is_empty() {
            d.set("mode", "0755");
        }
        let uid = self.uid();
        let mut nd = Dir::from([
            ("path", path.as_str()),
            ("type", "d"),
            ("mode", d.attr("mode")),
            ("Uid", uid),
        ]);
        if !pd.attr("Gid").is_empty() {
            nd.set("Gid", pd.attr("Gid"));
        }
        if !noinherit {
            nd.inherit(pd.mode());
            d.set("mode", nd.attr("mode"));
        }
        if self.checks_perms() {
            if !pd.can_write(self.ai()) {
                return Err(Error::Perm(path));
            }
            nd.can_wstat(self.ai(), &d.usr_attrs())?;
        }

        let mut cd = d.usr_attrs();
        for k in ["Uid", "Gid"] {
            if cd.attr(k).is_empty() && !nd.attr(k).is_empty() {
                cd.set(k, nd.attr(k));
            }
        }
        cd.set("Wuid", uid);
        self.set_rtime(&mut cd);
        self.inner.cache.mkdir(&path, cd).await?;
        let mut nd = self.inner.cache.stat(&path).await?;
        self.inner.ci.created(&mut nd);
        self.changed(&nd);
        Ok(())
    }

    pub(super) async fn wstat_op(&self, path: &str, mut d: Dir) -> Result<()> {
        self.check_writable()?;
        let path = abs_path(path)?;
        match path.as_str() {
            "/Ctl" => return Ok(()),
            "/Chg" => return Err(Error::Perm(path)),
            _ => {}
        }
        d.strip_cache_attrs();
        let mut f = self.walk_existing(&path, Access::Write).await?;
        f.d.can_wstat(self.ai(), &d)?;
        if d.is_empty() {
            return Ok(());
        }
        let sized = !d.attr("size").is_empty();
        // A truncation keeps the bytes before the new size.
        if sized {
            self.need_data(&mut f, false).await?;
        }
        let mut wd = d.usr_attrs();
        f.d.merge(&wd);
        self.set_rtime(&mut f.d);
        wd.set(RTIME, f.d.attr(RTIME));
        self.inner.cache.wstat(&path, wd).await?;
        if sized {
            self.inner.ci.dirty_data(&mut f.d);
        } else {
            self.inner.ci.dirty_meta(&mut f.d);
        }
        if let Ok(nd) = self.inner.cache.stat(&path).await {
            self.changed(&nd);
        }
        Ok(())
    }

    pub(super) async fn move_op(&self, from: &str, to: &str) -> Result<()> {
        self.check_writable()?;
        let from = abs_path(from)?;
        let to = abs_path(to)?;
        if from == to {
            return Ok(());
        }
        for p in [&from, &to] {
            if p == "/" || is_synthetic(p) {
                return Err(Error::Perm(p.clone()));
            }
        }
        if path::has_prefix(&to, &from) {
            return Err(Error::Inconsistent(format!("{from}: move into itself")));
        }
        let (pfrom, pto) = (path::parent(&from), path::parent(&to));
        if self.checks_perms() {
            for p in [pfrom, pto] {
                let pd = self.walk_existing(p, Access::Read).await?.into_dir();
                if !pd.can_write(self.ai()) {
                    return Err(Error::Perm(p.to_owned()));
                }
                if pfrom == pto {
                    break;
                }
            }
        }

        // Both ends must be in the cache before it is moved.
        let fd = self.walk_existing(&from, Access::Read).await?.into_dir();
        if let Walked::Found(tf) = self.walk(&to, Access::Read).await? {
            let td = tf.into_dir();
            if td.is_dir() {
                return Err(Error::Exists(to));
            }
            if fd.is_dir() {
                return Err(Error::Exists(format!("{to}: destination is not a directory")));
            }
        }

        let (cache, backing) = (&self.inner.cache, &self.inner.backing);
        let (synced, res) = self
            .inner
            .ci
            .sync_then(true, async {
                cache.r#move(&from, &to).await?;
                let res = backing.r#move(&from, &to).await;
                if res.is_err() && cache.r#move(&to, &from).await.is_ok() {
                    return res;
                }
                for p in [pfrom, pto] {
                    if let Ok(pd) = cache.stat(p).await {
                        self.changed(&pd);
                    }
                    if pfrom == pto {
                        break;
                    }
                }
                res
            })
            .await;
        debug!(synced = synced.synced, busy = synced.busy, "move: synced");
        res
    }

    pub(super) async fn remove_op(&self, path: &str, all: bool) -> Result<()> {
        self.check_writable()?;
        let path = abs_path(path)?;
        if matches!(path.as_str(), "/" | "/Ctl" | "/Chg") {
            return Err(Error::Perm(path));
        }
        if self.checks_perms() {
            let pd = self
                .walk_existing(path::parent(&path), Access::Read)
                .await?
                .into_dir();
            if !pd.can_write(self.ai()) {
                return Err(Error::Perm(path));
            }
        }
        let mut f = self.walk_existing(&path, Access::Write).await?;
        // Emptiness is judged on the current listing.
        if !all && f.d.is_dir() {
            self.need_data(&mut f, false).await?;
        }
        if all {
            self.inner.cache.remove_all(&path).await?;
        } else {
            self.inner.cache.remove(&path).await?;
        }
        f.d.set_time("mtime", SystemTime::now());
        f.dirty = false;
        self.inner.ci.removed(&mut f.d);
        self.changed(&f.d);
        Ok(())
    }

    pub(super) fn find_stream(
        &self,
        path: &str,
        pred: &str,
        spref: &str,
        dpref: &str,
        depth: usize,
    ) -> DirStream {
        let (tx, rx) = mpsc::channel(FIND_BUFFER);
        let fs = self.clone();
        let (path, pred) = (path.to_owned(), pred.to_owned());
        let (spref, dpref) = (spref.to_owned(), dpref.to_owned());
        tokio::spawn(async move {
            let res = locks::traced(async {
                let res = fs.find(&path, &pred, &spref, &dpref, depth, &tx).await;
                if let Some(tracer) = fs.inner.ci.locks().tracer() {
                    tracer.no_locks();
                }
                res
            })
            .await;
            fs.inner.stats.count(Op::Find, &res);
            if let Err(e) = res {
                debug!(error = %e, "find failed");
                let _ = tx.send(Err(e)).await;
            }
        });
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|d| (d, rx)) }).boxed()
    }

    #[instrument(name = "Cfs::find", skip(self, tx))]
    async fn find(
        &self,
        path: &str,
        pred: &str,
        spref: &str,
        dpref: &str,
        depth: usize,
        tx: &mpsc::Sender<Result<Dir>>,
    ) -> Result<()> {
        let path = abs_path(path)?;
        let pred = Pred::new(pred)?;
        let f = self.walk_existing(&path, Access::Read).await?;
        self.find_at(f, &pred, spref, dpref, depth, tx).await;
        Ok(())
    }

    /// Emits `f` and what lies below it. False once the receiver is gone.
    fn find_at<'a>(
        &'a self,
        mut f: CFile,
        pred: &'a Pred,
        spref: &'a str,
        dpref: &'a str,
        lvl: usize,
        tx: &'a mpsc::Sender<Result<Dir>>,
    ) -> BoxFuture<'a, bool> {
        async move {
            let emit = |d: Dir| async move { tx.send(Ok(fix_path(d, spref, dpref))).await.is_ok() };
            let res = if f.d.is_dir() {
                self.need_data(&mut f, false).await
            } else {
                self.need_meta(&mut f).await
            };
            let mut d = f.into_dir();
            if let Err(e) = res {
                d.set("err", e.to_string());
                return emit(d).await;
            }
            if d.is_removed() {
                return true;
            }
            let ai = self.ai();
            if d.is_dir() && self.checks_perms() && !(d.can_read(ai) && d.can_walk(ai)) {
                d.set("err", Error::Perm(d.path().to_owned()).to_string());
                return emit(d).await;
            }
            let ev = pred.eval_at(&d, lvl);
            if ev.matched && !emit(d.clone()).await {
                return false;
            }
            if ev.pruned || !d.is_dir() {
                return true;
            }
            let kids = {
                let _guard = self.lock(d.path(), Access::Read).await;
                io::get_dir(&self.inner.cache, d.path()).await
            };
            let kids = match kids {
                Ok(kids) => kids,
                Err(e) => {
                    d.set("err", e.to_string());
                    return emit(d).await;
                }
            };
            for mut cd in kids {
                let cp = path::join(d.path(), cd.name());
                if cd.is_removed() || is_synthetic(&cp) {
                    continue;
                }
                match self.cwalk(&cp, Access::Read).await {
                    Ok(cf) => {
                        if !self.find_at(cf, pred, spref, dpref, lvl + 1, tx).await {
                            return false;
                        }
                    }
                    Err(e) if e.is_not_exist() => {}
                    Err(e) => {
                        cd.set("path", cp.as_str());
                        cd.set("err", e.to_string());
                        if !emit(cd).await {
                            return false;
                        }
                    }
                }
            }
            true
        }
        .boxed()
    }

    pub(super) fn find_get_stream(
        &self,
        path: &str,
        pred: &str,
        spref: &str,
        dpref: &str,
        depth: usize,
    ) -> DirDataStream {
        self.inner.stats.count(Op::FindGet, &Ok::<(), Error>(()));
        let fs = self.clone();
        let (spref, dpref) = (spref.to_owned(), dpref.to_owned());
        self.find_stream(path, pred, &spref, &dpref, depth)
            .then(move |res| {
                let fs = fs.clone();
                let src = res
                    .as_ref()
                    .map(|d| path::rebase(d.path(), &dpref, &spref))
                    .unwrap_or_default();
                async move {
                    let dir = res?;
                    let data = if dir.attr("err").is_empty() && !dir.is_dir() {
                        let get = locks::traced(fs.get_op(&src, 0, None, "")).await;
                        Some(get?)
                    } else {
                        None
                    };
                    Ok(DirData { dir, data })
                }
            })
            .boxed()
    }
}
