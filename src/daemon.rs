//! The interactive front end: a CFS over an in-memory cache and a host directory, driven by
//! line commands on stdin.

use futures::TryStreamExt as _;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::select;
use tracing::{debug, error, info};

use zx_cfs::auth::{Auth, ClientInfo};
use zx_cfs::{Cfs, Dir, LocalTree, MemTree, Tree, io};

use crate::app_config::Config;

type Fs = Cfs<MemTree, LocalTree>;

const HELP: &str = "\
stat <path>
get <path>
put <path> <text>
mkdir <path>
rm <path>
rmall <path>
mv <from> <to>
wstat <path> k=v...
find <path> [pred]
ctl [cmd]
sync
quit";

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C signal, shutting down...");
        },
        _ = sigterm.recv() => {
            debug!("Received termination signal, shutting down...");
        },
        _ = sighup.recv() => {
            debug!("Received hangup signal, shutting down...");
        },
    }
    Ok(())
}

async fn build(config: &Config) -> Result<Fs, Box<dyn std::error::Error>> {
    tokio::fs::create_dir_all(&config.trees.backing).await?;
    let backing = LocalTree::new("local", &config.trees.backing)?;
    let cache = MemTree::new("mem");
    let fs = Cfs::new(config.trees.name.clone(), cache, backing, config.cfs_options()).await?;
    fs.log_in(&config.user);
    Ok(fs.serve_for(ClientInfo::new("shell", Some(Auth::new(config.user.clone())))))
}

fn parse_attrs<'a>(kvs: impl Iterator<Item = &'a str>) -> Result<Dir, String> {
    kvs.map(|kv| {
        kv.split_once('=')
            .ok_or_else(|| format!("{kv}: not k=v"))
    })
    .collect()
}

/// Runs one command line, returning what to print.
async fn exec(fs: &Fs, line: &str) -> Result<String, String> {
    let mut args = line.split_whitespace();
    let Some(cmd) = args.next() else {
        return Ok(String::new());
    };
    let arg = args.next().unwrap_or("/");
    let err = |e: zx_cfs::Error| e.to_string();
    match cmd {
        "stat" => fs.stat(arg).await.map(|d| d.to_string()).map_err(err),
        "get" => {
            let d = fs.stat(arg).await.map_err(err)?;
            if d.is_dir() {
                let ds = io::get_dir(fs, arg).await.map_err(err)?;
                Ok(ds.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n"))
            } else {
                let b = io::get_all(fs, arg).await.map_err(err)?;
                Ok(String::from_utf8_lossy(&b).into_owned())
            }
        }
        "put" => {
            let text = args.collect::<Vec<_>>().join(" ");
            let d = Dir::from([("mode", "0644")]);
            io::put_all(fs, arg, d, text)
                .await
                .map(|d| d.to_string())
                .map_err(err)
        }
        "mkdir" => fs.mkdir(arg, Dir::new()).await.map(|()| String::new()).map_err(err),
        "rm" => fs.remove(arg).await.map(|()| String::new()).map_err(err),
        "rmall" => fs.remove_all(arg).await.map(|()| String::new()).map_err(err),
        "mv" => {
            let to = args.next().ok_or("mv: missing target")?;
            fs.r#move(arg, to).await.map(|()| String::new()).map_err(err)
        }
        "wstat" => {
            let d = parse_attrs(args)?;
            fs.wstat(arg, d).await.map(|()| String::new()).map_err(err)
        }
        "find" => {
            let pred = args.collect::<Vec<_>>().join(" ");
            let ds: Vec<Dir> = fs
                .find(arg, &pred, "", "", 0)
                .try_collect()
                .await
                .map_err(err)?;
            Ok(ds.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n"))
        }
        "ctl" => {
            let rest: Vec<&str> = line.split_whitespace().skip(1).collect();
            if rest.is_empty() {
                let b = io::get_all(fs, "/Ctl").await.map_err(err)?;
                return Ok(String::from_utf8_lossy(&b).into_owned());
            }
            io::put_all(fs, "/Ctl", Dir::new(), rest.join(" "))
                .await
                .map(|_| String::new())
                .map_err(err)
        }
        "sync" => {
            let st = fs.sync().await;
            Ok(format!("synced {} busy {}", st.synced, st.busy))
        }
        "help" => Ok(HELP.to_owned()),
        _ => Err(format!("{cmd}: unknown command, try help")),
    }
}

async fn shell(fs: &Fs) -> Result<(), std::io::Error> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = select! {
            line = lines.next_line() => line?,
            res = wait_for_exit() => {
                res?;
                return Ok(());
            }
        };
        let Some(line) = line else {
            debug!("EOF on stdin");
            return Ok(());
        };
        let line = line.trim();
        if line == "quit" {
            return Ok(());
        }
        match exec(fs, line).await {
            Ok(out) if out.is_empty() => {}
            Ok(out) => println!("{out}"),
            Err(e) => eprintln!("{e}"),
        }
    }
}

/// Runs a shell until EOF, `quit` or a signal.
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let fs = build(&config).await?;
    info!(
        cfs = fs.name(),
        backing = %config.trees.backing.display(),
        "zx-cfs is running. Type help for commands."
    );
    let res = shell(&fs).await;
    fs.close().await;
    res?;
    Ok(())
}

/// Builds the engine, writes `cmd` to its `/Ctl` and prints the report.
pub async fn ctl(config: Config, cmd: &str) -> Result<(), Box<dyn std::error::Error>> {
    let fs = build(&config).await?;
    let res = exec(&fs, &format!("ctl {cmd}")).await;
    let report = exec(&fs, "ctl").await;
    fs.close().await;
    res?;
    println!("{}", report?);
    Ok(())
}

pub fn spawn<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            error!("Failed to create Tokio runtime: {e}");
            std::process::exit(1);
        });
    runtime.block_on(f)
}
