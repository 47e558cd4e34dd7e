//! Slash-separated tree paths.
//!
//! Tree paths are always absolute and clean: they start at `/`, never contain `.` or `..`
//! elements, and never end in a slash (except for the root itself).

use crate::error::{Error, Result};

/// Cleans `p` into an absolute tree path, resolving it against `/` when relative.
pub fn abs_path(p: &str) -> Result<String> {
    if p.is_empty() {
        return Err(Error::BadPath(p.to_owned()));
    }
    let mut out: Vec<&str> = Vec::new();
    for el in p.split('/') {
        match el {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            el => out.push(el),
        }
    }
    if out.is_empty() {
        return Ok("/".to_owned());
    }
    let mut s = String::with_capacity(p.len() + 1);
    for el in out {
        s.push('/');
        s.push_str(el);
    }
    Ok(s)
}

/// The elements of a clean path, root first. The root has none.
pub fn elems(p: &str) -> Vec<&str> {
    p.split('/').filter(|e| !e.is_empty()).collect()
}

/// The parent of a clean path. The root is its own parent.
pub fn parent(p: &str) -> &str {
    match p.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &p[..i],
    }
}

/// The last element of a clean path, or `/` for the root.
pub fn base(p: &str) -> &str {
    if p == "/" {
        return "/";
    }
    p.rsplit('/').next().unwrap_or(p)
}

/// Joins a clean directory path and a child name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// True if `p` is `pref` or lies somewhere below it.
pub fn has_prefix(p: &str, pref: &str) -> bool {
    if pref == "/" || p == pref {
        return true;
    }
    p.strip_prefix(pref).is_some_and(|rest| rest.starts_with('/'))
}

/// The part of `p` below `pref`, as an absolute path. `None` if `p` is not under `pref`.
pub fn suffix<'a>(p: &'a str, pref: &str) -> Option<&'a str> {
    if !has_prefix(p, pref) {
        return None;
    }
    if pref == "/" {
        return Some(p);
    }
    let rest = &p[pref.len()..];
    Some(if rest.is_empty() { "/" } else { rest })
}

/// Rewrites `p`, which lies under `spref`, to lie under `dpref` instead.
pub fn rebase(p: &str, spref: &str, dpref: &str) -> String {
    if spref == dpref {
        return p.to_owned();
    }
    match suffix(p, spref) {
        Some("/") => dpref.to_owned(),
        Some(suff) if dpref == "/" => suff.to_owned(),
        Some(suff) => format!("{dpref}{suff}"),
        None => p.to_owned(),
    }
}
