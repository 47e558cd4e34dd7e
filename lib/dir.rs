//! Directory entries: string attribute maps describing one file.
//!
//! Attributes starting with an uppercase letter (`Uid`, `Gid`, `Wuid`, `Sum`, ...) are user
//! metadata preserved across layers. Lowercase names (`path`, `name`, `type`, `mode`, `size`,
//! `mtime`, `rm`, `err`) are reserved. `Rtime` and `Cache` are recorded only by the caching
//! engine in its cache tree and never leave it.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};

use crate::auth::{Auth, SUPERUSER, in_group};
use crate::error::{Error, Result};

/// Refresh time recorded by the caching engine.
pub const RTIME: &str = "Rtime";
/// Cache status recorded by the caching engine (`unread` or anything else).
pub const CACHE: &str = "Cache";

bitflags! {
    /// Permission bits of a `mode` attribute.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ModeBits: u32 {
        /// Other: execute (walk for directories).
        const OTHER_EXEC  = 0o001;
        /// Other: write.
        const OTHER_WRITE = 0o002;
        /// Other: read.
        const OTHER_READ  = 0o004;
        /// Group: execute.
        const GROUP_EXEC  = 0o010;
        /// Group: write.
        const GROUP_WRITE = 0o020;
        /// Group: read.
        const GROUP_READ  = 0o040;
        /// Owner: execute.
        const OWNER_EXEC  = 0o100;
        /// Owner: write.
        const OWNER_WRITE = 0o200;
        /// Owner: read.
        const OWNER_READ  = 0o400;

        /// Read for everyone.
        const READ = Self::OWNER_READ.bits() | Self::GROUP_READ.bits() | Self::OTHER_READ.bits();
        /// Write for everyone.
        const WRITE = Self::OWNER_WRITE.bits() | Self::GROUP_WRITE.bits() | Self::OTHER_WRITE.bits();
        /// Execute for everyone.
        const EXEC = Self::OWNER_EXEC.bits() | Self::GROUP_EXEC.bits() | Self::OTHER_EXEC.bits();
    }
}

/// True for attributes a client may set with `wstat`: `mode`, `mtime`, `size`, and every
/// uppercase attribute.
pub fn is_usr_attr(name: &str) -> bool {
    matches!(name, "mode" | "mtime" | "size") || is_upper_attr(name)
}

/// True for attributes whose name starts with an uppercase letter.
pub fn is_upper_attr(name: &str) -> bool {
    name.chars().next().is_some_and(char::is_uppercase)
}

/// A directory entry.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Dir(BTreeMap<String, String>);

impl Dir {
    /// An empty entry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The value of `attr`, if present.
    pub fn get(&self, attr: &str) -> Option<&str> {
        self.0.get(attr).map(String::as_str)
    }

    /// The value of `attr`, or `""` when absent.
    pub fn attr(&self, attr: &str) -> &str {
        self.get(attr).unwrap_or("")
    }

    /// Sets `attr` to `value`.
    pub fn set(&mut self, attr: impl Into<String>, value: impl Into<String>) {
        self.0.insert(attr.into(), value.into());
    }

    /// Removes `attr`, returning its old value.
    pub fn remove(&mut self, attr: &str) -> Option<String> {
        self.0.remove(attr)
    }

    /// True if `attr` is present.
    pub fn contains(&self, attr: &str) -> bool {
        self.0.contains_key(attr)
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if there are no attributes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Attributes in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copies every attribute of `other` into `self`.
    pub fn merge(&mut self, other: &Dir) {
        for (k, v) in other.iter() {
            self.set(k, v);
        }
    }

    /// The `path` attribute.
    pub fn path(&self) -> &str {
        self.attr("path")
    }

    /// The `name` attribute.
    pub fn name(&self) -> &str {
        self.attr("name")
    }

    /// The `type` attribute.
    pub fn typ(&self) -> &str {
        self.attr("type")
    }

    /// True for directories.
    pub fn is_dir(&self) -> bool {
        self.typ() == "d"
    }

    /// True for tombstones.
    pub fn is_removed(&self) -> bool {
        !self.attr("rm").is_empty()
    }

    /// Numeric value of `attr`, 0 when absent or malformed. A leading `0` means octal.
    pub fn uint(&self, attr: &str) -> u64 {
        let v = self.attr(attr);
        if v.len() > 1
            && let Some(oct) = v.strip_prefix('0')
        {
            return u64::from_str_radix(oct, 8).unwrap_or(0);
        }
        v.parse().unwrap_or(0)
    }

    /// The `size` attribute.
    pub fn size(&self) -> u64 {
        self.uint("size")
    }

    /// Permission bits of the `mode` attribute.
    pub fn mode(&self) -> u32 {
        (self.uint("mode") & 0o777) as u32
    }

    /// Sets the `mode` attribute from permission bits.
    pub fn set_mode(&mut self, mode: u32) {
        self.set("mode", format!("0{:o}", mode & 0o777));
    }

    /// A time attribute, stored as decimal nanoseconds since the unix epoch.
    pub fn time(&self, attr: &str) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.uint(attr))
    }

    /// Sets a time attribute.
    pub fn set_time(&mut self, attr: &str, t: SystemTime) {
        self.set(attr, time_string(t));
    }

    /// A copy holding only the attributes clients may set.
    #[must_use]
    pub fn usr_attrs(&self) -> Dir {
        self.0
            .iter()
            .filter(|(k, _)| is_usr_attr(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Drops the attributes the caching engine keeps for itself.
    pub fn strip_cache_attrs(&mut self) {
        self.0.remove(RTIME);
        self.0.remove(CACHE);
    }

    /// Adjusts the mode so group bits follow those of the parent directory.
    pub fn inherit(&mut self, parent: u32) {
        let mut mode = self.mode() & parent;
        if mode & 0o440 == 0o400 && parent & 0o040 == 0o040 {
            mode |= 0o040;
        }
        if mode & 0o220 == 0o200 && parent & 0o020 == 0o020 {
            mode |= 0o020;
        }
        if self.is_dir() && mode & 0o110 == 0o100 && parent & 0o010 == 0o010 {
            mode |= 0o010;
        }
        self.set_mode(mode);
    }

    /// True if `ai` holds any of the `what` bits on this entry. With no identity the owner's
    /// role is assumed.
    pub fn can(&self, ai: Option<&Auth>, what: ModeBits) -> bool {
        let mode = ModeBits::from_bits_truncate(self.mode());
        let granted = if in_group(ai, self.attr("Uid")) {
            mode
        } else if in_group(ai, self.attr("Gid")) {
            mode & (ModeBits::GROUP_READ | ModeBits::GROUP_WRITE | ModeBits::GROUP_EXEC
                | ModeBits::OTHER_READ | ModeBits::OTHER_WRITE | ModeBits::OTHER_EXEC)
        } else {
            mode & (ModeBits::OTHER_READ | ModeBits::OTHER_WRITE | ModeBits::OTHER_EXEC)
        };
        granted.intersects(what)
    }

    /// Read permission.
    pub fn can_read(&self, ai: Option<&Auth>) -> bool {
        self.can(ai, ModeBits::READ)
    }

    /// Write permission.
    pub fn can_write(&self, ai: Option<&Auth>) -> bool {
        self.can(ai, ModeBits::WRITE)
    }

    /// Walk (search) permission.
    pub fn can_walk(&self, ai: Option<&Auth>) -> bool {
        self.can(ai, ModeBits::EXEC)
    }

    /// Checks that `ai` may apply the attribute changes in `nd` to this entry.
    ///
    /// Only the owner changes `mode`. Changing `Uid` or `Gid` requires being the owner and a
    /// member of the new id, or the superuser. `size` needs write permission; `mtime` and the
    /// remaining user attributes need ownership or write permission. Attributes clients cannot
    /// set are ignored, unless nothing settable was asked for.
    pub fn can_wstat(&self, ai: Option<&Auth>, nd: &Dir) -> Result<()> {
        let path = self.path();
        let perm = |k: &str| Error::Perm(format!("{path}: {k}"));
        let is_owner = in_group(ai, self.attr("Uid"));
        let mut some = false;
        let mut some_cant = None;
        for (k, v) in nd.iter() {
            if !is_usr_attr(k) {
                if v.is_empty() {
                    return Err(perm(k));
                }
                some_cant = Some(k);
                continue;
            }
            if k == "size" && self.is_dir() && v != self.attr(k) {
                some_cant = Some(k);
                continue;
            }
            some = true;
            if v == self.attr(k) {
                continue;
            }
            match k {
                "mode" if v.is_empty() || !is_owner => return Err(perm(k)),
                "mode" => {}
                "size" if v.is_empty() || !self.can_write(ai) => return Err(perm(k)),
                "size" => {}
                "Uid" | "Gid" => {
                    let may = is_owner && (in_group(ai, v) || in_group(ai, SUPERUSER));
                    if v.is_empty() || !may {
                        return Err(perm(k));
                    }
                }
                "mtime" if v.is_empty() => return Err(perm(k)),
                _ => {
                    if !is_owner && !self.can_write(ai) {
                        return Err(perm(k));
                    }
                }
            }
        }
        match some_cant {
            Some(k) if !some => Err(perm(k)),
            _ => Ok(()),
        }
    }

    /// Appends the wire form: length-prefixed key/value pairs closed by an empty key.
    pub fn pack_into(&self, buf: &mut BytesMut) {
        for (k, v) in self.iter() {
            if k.is_empty() {
                continue;
            }
            put_str(buf, k);
            put_str(buf, v);
        }
        buf.put_u32_le(0);
    }

    /// The wire form of this entry.
    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.pack_into(&mut buf);
        buf.freeze()
    }

    /// Decodes one entry from the front of `buf`, returning it and the bytes that follow.
    pub fn unpack(mut buf: &[u8]) -> Result<(Dir, &[u8])> {
        let mut d = Dir::new();
        loop {
            let k = get_str(&mut buf)?;
            if k.is_empty() {
                return Ok((d, buf));
            }
            let v = get_str(&mut buf)?;
            d.set(k, v);
        }
    }

    /// Decodes every entry in `buf`.
    pub fn unpack_all(mut buf: &[u8]) -> Result<Vec<Dir>> {
        let mut ds = Vec::new();
        while !buf.is_empty() {
            let (d, rest) = Dir::unpack(buf)?;
            ds.push(d);
            buf = rest;
        }
        Ok(ds)
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 4 {
        return Err(Error::Proto("short dir".into()));
    }
    let n = buf.get_u32_le() as usize;
    if buf.remaining() < n {
        return Err(Error::Proto("short dir attribute".into()));
    }
    let s = std::str::from_utf8(&buf[..n])
        .map_err(|_| Error::Proto("dir attribute is not utf8".into()))?
        .to_owned();
    buf.advance(n);
    Ok(s)
}

/// Formats a time the way time attributes are stored.
pub fn time_string(t: SystemTime) -> String {
    let ns = t.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_nanos());
    ns.to_string()
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Dir {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Dir {
    fn from(attrs: [(&str, &str); N]) -> Self {
        attrs.into_iter().collect()
    }
}

impl fmt::Debug for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path())?;
        for (k, v) in self.iter() {
            if k != "path" {
                write!(f, " {k}={v:?}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn several_dirs_share_a_message() {
        let a = Dir::from([("path", "/a"), ("name", "a"), ("Uid", "nemo")]);
        let b = Dir::from([("path", "/b"), ("type", "d")]);
        let mut buf = BytesMut::new();
        a.pack_into(&mut buf);
        b.pack_into(&mut buf);

        let (first, rest) = Dir::unpack(&buf).unwrap();
        assert_eq!(first, a);
        let all = Dir::unpack_all(rest).unwrap();
        assert_eq!(all, vec![b]);
    }

    #[test]
    fn truncated_input_is_a_protocol_error() {
        let packed = Dir::from([("path", "/a")]).pack();
        let err = Dir::unpack(&packed[..packed.len() - 2]).unwrap_err();
        assert!(matches!(err, Error::Proto(_)));
    }

    #[test]
    fn empty_dir_packs_to_terminator() {
        assert_eq!(Dir::new().pack().as_ref(), &[0, 0, 0, 0]);
    }

    #[test]
    fn mode_is_octal() {
        let mut d = Dir::from([("mode", "0755")]);
        assert_eq!(d.mode(), 0o755);
        d.set_mode(0o1640);
        assert_eq!(d.attr("mode"), "0640");
        assert_eq!(Dir::from([("size", "12")]).size(), 12);
    }

    #[test]
    fn times_round_trip_at_nanosecond_precision() {
        let t = UNIX_EPOCH + Duration::from_nanos(1_700_000_000_123_456_789);
        let mut d = Dir::new();
        d.set_time("mtime", t);
        assert_eq!(d.attr("mtime"), "1700000000123456789");
        assert_eq!(d.time("mtime"), t);
    }

    #[test]
    fn inherit_blends_group_bits() {
        let mut d = Dir::from([("type", "-"), ("mode", "0644")]);
        d.inherit(0o750);
        assert_eq!(d.mode(), 0o640);

        let mut d = Dir::from([("type", "d"), ("mode", "0700")]);
        d.inherit(0o770);
        assert_eq!(d.mode(), 0o770);
    }

    #[test]
    fn usr_attrs_and_cache_attrs() {
        let mut d = Dir::from([
            ("path", "/a"),
            ("mode", "0644"),
            ("Uid", "nemo"),
            ("Rtime", "1"),
            ("Cache", "unread"),
        ]);
        let u = d.usr_attrs();
        assert!(u.contains("mode") && u.contains("Uid") && !u.contains("path"));
        d.strip_cache_attrs();
        assert!(!d.contains(RTIME) && !d.contains(CACHE));
    }

    #[test]
    fn permissions_by_role() {
        let d = Dir::from([("mode", "0640"), ("Uid", "nemo"), ("Gid", "sys")]);
        let owner = Auth::new("nemo");
        let member = Auth::new("other").with_group("sys");
        let stranger = Auth::new("stranger");

        assert!(d.can_write(Some(&owner)));
        assert!(d.can_read(Some(&member)));
        assert!(!d.can_write(Some(&member)));
        assert!(!d.can_read(Some(&stranger)));
        assert!(d.can_write(None));
        assert!(d.can_read(Some(&Auth::new(SUPERUSER))));
    }

    #[test]
    fn wstat_rules() {
        let d = Dir::from([
            ("path", "/f"),
            ("type", "-"),
            ("mode", "0664"),
            ("Uid", "nemo"),
            ("Gid", "sys"),
        ]);
        let owner = Auth::new("nemo");
        let member = Auth::new("other").with_group("sys");

        assert!(d.can_wstat(Some(&owner), &Dir::from([("mode", "0600")])).is_ok());
        assert!(d.can_wstat(Some(&member), &Dir::from([("mode", "0600")])).is_err());
        assert!(d.can_wstat(Some(&member), &Dir::from([("size", "0")])).is_ok());
        assert!(d.can_wstat(Some(&owner), &Dir::from([("Uid", "other")])).is_err());
        assert!(
            d.can_wstat(Some(&Auth::new(SUPERUSER)), &Dir::from([("Uid", "other")]))
                .is_ok()
        );
        assert!(d.can_wstat(Some(&owner), &Dir::from([("type", "d")])).is_err());
        assert!(d.can_wstat(Some(&owner), &Dir::new()).is_ok());
    }
}
