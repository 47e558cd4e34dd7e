#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::time::Duration;

use futures::TryStreamExt as _;
use zx_cfs::auth::ClientInfo;
use zx_cfs::{Dir, MemTree, Tree};

use common::{cfs_over, eventually, get_str, opts, put_str};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_leave_no_locks() {
    let fx = cfs_over(MemTree::new("backing"), opts()).await;
    fx.fs.mkdir("/d", Dir::new()).await.unwrap();

    let mut tasks = Vec::new();
    for c in 0..8 {
        let fs = fx.fs.serve_for(ClientInfo::new(format!("c{c}"), None));
        tasks.push(tokio::spawn(async move {
            for i in 0..10 {
                let p = format!("/d/f{c}-{i}");
                put_str(&fs, &p, &p).await.unwrap();
                assert_eq!(get_str(&fs, &p).await.unwrap(), p);
                fs.stat("/d").await.unwrap();
                if i % 3 == 0 {
                    fs.remove(&p).await.unwrap();
                }
                let _: Vec<Dir> = fs.find("/d", "", "", "", 0).try_collect().await.unwrap();
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    let locks = fx.fs.cache_info().locks();
    eventually(Duration::from_secs(2), "all locks released", || async {
        locks.held() == 0
    })
    .await;
    let listing = zx_cfs::io::get_dir(&fx.fs, "/d").await.unwrap();
    assert_eq!(listing.len(), 8 * 6);

    fx.fs.sync().await;
    assert_eq!(zx_cfs::io::get_dir(&fx.backing, "/d").await.unwrap().len(), 8 * 6);
    fx.fs.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn writes_race_with_syncs() {
    let fx = cfs_over(MemTree::new("backing"), opts()).await;
    let writer = {
        let fs = fx.fs.clone();
        tokio::spawn(async move {
            for i in 0..50 {
                put_str(&fs, "/hot", &format!("v{i}")).await.unwrap();
            }
        })
    };
    let syncer = {
        let fs = fx.fs.clone();
        tokio::spawn(async move {
            for _ in 0..10 {
                fs.sync().await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };
    writer.await.unwrap();
    syncer.await.unwrap();

    fx.fs.sync().await;
    assert_eq!(get_str(&fx.backing, "/hot").await.unwrap(), "v49");
    assert!(fx.fs.cache_info().entries().is_empty());
    fx.fs.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn moves_race_with_readers() {
    let fx = cfs_over(MemTree::new("backing"), opts()).await;
    fx.fs.mkdir("/a", Dir::new()).await.unwrap();
    fx.fs.mkdir("/b", Dir::new()).await.unwrap();
    put_str(&fx.fs, "/a/f", "payload").await.unwrap();

    let reader = {
        let fs = fx.fs.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                for p in ["/a/f", "/b/f"] {
                    match get_str(&fs, p).await {
                        Ok(s) => assert_eq!(s, "payload"),
                        Err(e) => assert!(e.is_not_exist(), "{p}: {e}"),
                    }
                }
            }
        })
    };
    for _ in 0..5 {
        fx.fs.r#move("/a/f", "/b/f").await.unwrap();
        fx.fs.r#move("/b/f", "/a/f").await.unwrap();
    }
    reader.await.unwrap();
    assert_eq!(get_str(&fx.backing, "/a/f").await.unwrap(), "payload");
    fx.fs.close().await;
}
