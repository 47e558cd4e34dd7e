#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt as _;
use tokio::time::timeout;
use zx_cfs::auth::ClientInfo;
use zx_cfs::cache::State;
use zx_cfs::tree::ByteStream;
use zx_cfs::tree::mem::CHG_VERSION;
use zx_cfs::{CfsOptions, Dir, Error, MemTree, Tree, Tuning};

use common::{cfs_over, eventually, fast_tuning, get_str, opts, put_str};

async fn open_chg<T: Tree>(t: &T) -> ByteStream {
    let mut chg = t.get("/Chg", 0, None, "").await.unwrap();
    let version = chg.next().await.unwrap().unwrap();
    assert_eq!(version, Bytes::from_static(CHG_VERSION.as_bytes()));
    chg
}

async fn next_inval(chg: &mut ByteStream) -> Dir {
    let msg = timeout(Duration::from_secs(2), chg.next())
        .await
        .expect("no invalidation")
        .unwrap()
        .unwrap();
    let mut ds = Dir::unpack_all(&msg).unwrap();
    assert_eq!(ds.len(), 1);
    ds.remove(0)
}

/// Skips invalidations for other paths, such as parent directories refreshed on the way.
async fn inval_for(chg: &mut ByteStream, path: &str) -> Dir {
    for _ in 0..16 {
        let d = next_inval(chg).await;
        if d.path() == path {
            return d;
        }
    }
    panic!("no invalidation for {path}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peers_see_changes_but_not_their_own() {
    let fx = cfs_over(MemTree::new("backing"), opts()).await;
    let c1 = fx.fs.serve_for(ClientInfo::new("c1", None));
    let c2 = fx.fs.serve_for(ClientInfo::new("c2", None));
    let mut chg1 = open_chg(&c1).await;
    let mut chg2 = open_chg(&c2).await;
    assert_eq!(fx.fs.chg_readers(), 2);

    put_str(&c1, "/y", "hello").await.unwrap();
    let d = next_inval(&mut chg2).await;
    assert_eq!(d.path(), "/y");
    assert_eq!(d.name(), "y");
    assert_eq!(d.size(), 5);
    assert!(!d.contains("Rtime") && !d.contains("Cache"), "{d}");
    assert!(
        timeout(Duration::from_millis(300), chg1.next()).await.is_err(),
        "originator got its own change"
    );

    c2.remove("/y").await.unwrap();
    let d = next_inval(&mut chg1).await;
    assert_eq!(d.path(), "/y");
    assert!(d.is_removed(), "{d}");
    fx.fs.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upstream_removal_forgets_entry() {
    let backing = MemTree::with_changes("backing");
    put_str(&backing, "/z", "zed").await.unwrap();
    let fx = cfs_over(backing, opts()).await;
    assert!(!fx.fs.epoch().is_empty());

    assert_eq!(get_str(&fx.fs, "/z").await.unwrap(), "zed");
    fx.backing.remove("/z").await.unwrap();

    let cache = fx.cache.clone();
    eventually(Duration::from_secs(2), "removal of /z from the cache", || {
        let cache = cache.clone();
        async move { cache.stat("/z").await.is_err() }
    })
    .await;
    let err = fx.fs.stat("/z").await.unwrap_err();
    assert!(err.is_not_exist(), "{err}");
    assert!(!fx.fs.cache_info().is_tracked("/z"));
    fx.fs.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upstream_changes_reach_clients() {
    let backing = MemTree::with_changes("backing");
    put_str(&backing, "/f", "one").await.unwrap();
    let fx = cfs_over(backing, opts()).await;
    let c = fx.fs.serve_for(ClientInfo::new("c", None));
    let mut chg = open_chg(&c).await;
    assert_eq!(get_str(&c, "/f").await.unwrap(), "one");

    put_str(&fx.backing, "/g", "new").await.unwrap();
    let d = inval_for(&mut chg, "/g").await;
    assert_eq!(d.path(), "/g");
    assert_eq!(get_str(&c, "/g").await.unwrap(), "new");

    fx.backing
        .wstat("/f", Dir::from([("Color", "red")]))
        .await
        .unwrap();
    let d = inval_for(&mut chg, "/f").await;
    assert_eq!(d.attr("Color"), "red");
    assert_eq!(c.stat("/f").await.unwrap().attr("Color"), "red");
    fx.fs.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn changes_below_unread_dirs_are_dropped() {
    let backing = MemTree::with_changes("backing");
    backing.mkdir("/d", Dir::new()).await.unwrap();
    put_str(&backing, "/d/a", "a").await.unwrap();
    let tuning = Tuning {
        sync_delay: Duration::from_secs(30),
        max_sync_delay: Duration::from_secs(60),
        ..fast_tuning()
    };
    let fx = cfs_over(backing, CfsOptions { tuning, ..opts() }).await;

    // Listed in / but never read, with a local attribute change pending.
    fx.fs.stat("/d").await.unwrap();
    fx.fs
        .wstat("/d", Dir::from([("Color", "blue")]))
        .await
        .unwrap();
    assert!(
        fx.fs
            .cache_info()
            .entries()
            .contains(&("/d".to_owned(), State::UnreadMeta, false))
    );

    put_str(&fx.backing, "/d/b", "b").await.unwrap();
    put_str(&fx.backing, "/m", "m").await.unwrap();
    let cache = fx.cache.clone();
    eventually(Duration::from_secs(2), "/m applied", || {
        let cache = cache.clone();
        async move { cache.stat("/m").await.is_ok() }
    })
    .await;
    assert!(fx.cache.stat("/d/b").await.unwrap_err().is_not_exist());

    let mut names: Vec<String> = zx_cfs::io::get_dir(&fx.fs, "/d")
        .await
        .unwrap()
        .iter()
        .map(|d| d.name().to_owned())
        .collect();
    names.sort();
    assert_eq!(names, ["a", "b"]);
    fx.fs.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn epoch_follows_upstream_chg() {
    let with = cfs_over(MemTree::with_changes("backing"), opts()).await;
    assert!(!with.fs.epoch().is_empty());
    with.fs.close().await;

    let without = cfs_over(MemTree::new("backing"), opts()).await;
    assert!(without.fs.epoch().is_empty());
    without.fs.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_reader_is_evicted() {
    let tuning = Tuning {
        ival_tout: Duration::from_millis(100),
        ..fast_tuning()
    };
    let fx = cfs_over(MemTree::new("backing"), CfsOptions { tuning, ..opts() }).await;
    let writer = fx.fs.serve_for(ClientInfo::new("writer", None));
    let slow = fx.fs.serve_for(ClientInfo::new("slow", None));
    let mut chg = open_chg(&slow).await;

    for i in 0..16 {
        put_str(&writer, &format!("/f{i}"), "x").await.unwrap();
    }
    let fs = fx.fs.clone();
    eventually(Duration::from_secs(5), "eviction", || {
        let fs = fs.clone();
        async move { fs.chg_readers() == 0 }
    })
    .await;

    let mut n = 0;
    let err = loop {
        match chg.next().await {
            Some(Ok(_)) => n += 1,
            Some(Err(e)) => break e,
            None => panic!("stream ended without a reason"),
        }
    };
    assert!(n > 0 && n < 16, "{n} invalidations before eviction");
    assert!(matches!(err, Error::SlowReader), "{err}");
    assert!(chg.next().await.is_none());
    fx.fs.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_ends_readers() {
    let fx = cfs_over(MemTree::new("backing"), opts()).await;
    let c = fx.fs.serve_for(ClientInfo::new("c", None));
    let mut chg = open_chg(&c).await;
    fx.fs.close().await;
    let end = timeout(Duration::from_secs(2), chg.next()).await.unwrap();
    assert!(matches!(end, Some(Err(Error::Closed(_)))));
    assert!(c.get("/Chg", 0, None, "").await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chg_needs_a_client() {
    let fx = cfs_over(MemTree::new("backing"), opts()).await;
    let err = fx.fs.get("/Chg", 0, None, "").await.err().unwrap();
    assert!(err.is_perm(), "{err}");
    let d = fx.fs.stat("/Chg").await.unwrap();
    assert_eq!(d.typ(), "c");
    assert_eq!(d.mode(), 0o440);
    fx.fs.close().await;

    let fx = cfs_over(
        MemTree::new("backing"),
        CfsOptions {
            no_inval_proto: true,
            ..opts()
        },
    )
    .await;
    let c = fx.fs.serve_for(ClientInfo::new("c", None));
    assert!(c.get("/Chg", 0, None, "").await.err().unwrap().is_not_exist());
    assert!(c.stat("/Chg").await.unwrap_err().is_not_exist());
    fx.fs.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poller_finds_external_changes() {
    let tuning = Tuning {
        cache_tout: Duration::from_millis(50),
        poll_ival: Duration::from_millis(150),
        ..fast_tuning()
    };
    let fx = cfs_over(MemTree::new("backing"), CfsOptions { tuning, ..opts() }).await;
    let c = fx.fs.serve_for(ClientInfo::new("c", None));
    let mut chg = open_chg(&c).await;
    c.get("/", 0, None, "").await.unwrap();

    put_str(&fx.backing, "/appeared", "boo").await.unwrap();
    let d = inval_for(&mut chg, "/appeared").await;
    assert!(!d.is_removed());
    let cache = fx.cache.clone();
    eventually(Duration::from_secs(2), "poller caching /appeared", || {
        let cache = cache.clone();
        async move { cache.stat("/appeared").await.is_ok() }
    })
    .await;
    fx.fs.close().await;
}
