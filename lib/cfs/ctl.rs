//! The `/Ctl` file: a status report on reads, commands on writes.

use bytes::Bytes;

use super::Cfs;
use crate::dir::Dir;
use crate::error::{Error, Result};
use crate::io;
use crate::tree::{ByteStream, Tree};

/// The entry for `/Ctl`. The size is nominal: the report is built on each read.
pub(super) fn ctl_dir(user: &str) -> Dir {
    Dir::from([
        ("path", "/Ctl"),
        ("name", "Ctl"),
        ("size", "8192"),
        ("type", "-"),
        ("Uid", user),
        ("Gid", user),
        ("Wuid", user),
        ("mode", "0644"),
    ])
}

/// The entry for `/Chg`.
pub(super) fn chg_dir(user: &str) -> Dir {
    Dir::from([
        ("path", "/Chg"),
        ("name", "Chg"),
        ("size", "0"),
        ("type", "c"),
        ("Uid", user),
        ("Gid", user),
        ("Wuid", user),
        ("mode", "0440"),
    ])
}

fn slice(b: &[u8], off: u64, count: Option<u64>) -> Bytes {
    let start = usize::try_from(off).unwrap_or(usize::MAX).min(b.len());
    let end = count.map_or(b.len(), |n| {
        start
            .saturating_add(usize::try_from(n).unwrap_or(usize::MAX))
            .min(b.len())
    });
    Bytes::copy_from_slice(&b[start..end])
}

impl<C: Tree, B: Tree> Cfs<C, B> {
    /// Name, users, flags and counters, followed by the reports of both trees.
    pub(super) async fn get_ctl(&self, off: u64, count: Option<u64>) -> Result<ByteStream> {
        let mut out = format!("{}:\n", self.inner.name);
        for u in self.users() {
            out.push_str(&format!("user\t{u}\n"));
        }
        out.push_str(&self.inner.flags.to_string());
        out.push_str(&format!("{}\n", self.inner.stats));
        let mut buf = out.into_bytes();
        if let Ok(ctl) = io::get_all(&self.inner.cache, "/Ctl").await {
            buf.extend_from_slice(&ctl);
        }
        if let Ok(ctl) = io::get_all(&self.inner.backing, "/Ctl").await {
            buf.extend_from_slice(&ctl);
        }
        Ok(io::once(slice(&buf, off, count)))
    }

    /// Runs the command written to `/Ctl`.
    pub(super) async fn put_ctl(&self, data: ByteStream) -> Result<()> {
        if self.checks_perms() && !ctl_dir(&self.inner.user).can_write(self.ai()) {
            return Err(Error::Perm("/Ctl".to_owned()));
        }
        let raw = io::collect(data).await?;
        let ctl = std::str::from_utf8(&raw)
            .map_err(|_| Error::BadCtl("/Ctl: not utf8".to_owned()))?
            .trim();
        if let Some(cmd) = ctl.strip_prefix("pass ") {
            if self.debugging() {
                tracing::debug!(cmd, "pass ctl");
            }
            io::put_all(&self.inner.backing, "/Ctl", Dir::new(), cmd.to_owned()).await?;
            return Ok(());
        }
        if self.debugging() {
            tracing::debug!(ctl, "ctl");
        }
        if ctl == "sync" {
            let st = self.inner.ci.sync(false).await;
            tracing::info!(synced = st.synced, busy = st.busy, "ctl sync");
            return Ok(());
        }
        self.inner.flags.ctl(ctl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_is_sliced() {
        assert_eq!(slice(b"hello", 1, Some(3)), Bytes::from("ell"));
        assert_eq!(slice(b"hello", 3, None), Bytes::from("lo"));
        assert!(slice(b"hello", 9, Some(2)).is_empty());
    }

    #[test]
    fn synthetic_entries() {
        let c = ctl_dir("nemo");
        assert_eq!(c.mode(), 0o644);
        assert_eq!(c.attr("Uid"), "nemo");
        assert!(!c.is_dir());
        let g = chg_dir("nemo");
        assert_eq!(g.typ(), "c");
        assert_eq!(g.mode(), 0o440);
    }
}
