//! Per-operation I/O counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;

/// An operation counted by [`IoStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Op {
    /// `stat`
    Stat,
    /// `get`
    Get,
    /// `put`
    Put,
    /// `mkdir`
    Mkdir,
    /// `wstat`
    Wstat,
    /// `move`
    Move,
    /// `remove`
    Remove,
    /// `remove_all`
    RemoveAll,
    /// `find`
    Find,
    /// `find_get`
    FindGet,
}

const NOPS: usize = 10;

const NAMES: [&str; NOPS] = [
    "stat", "get", "put", "mkdir", "wstat", "move", "remove", "removeall", "find", "findget",
];

#[derive(Default)]
struct Counters {
    calls: AtomicU64,
    errors: AtomicU64,
    bytes: AtomicU64,
}

/// Calls, failures and bytes moved, per operation.
#[derive(Default)]
pub struct IoStats {
    ops: [Counters; NOPS],
}

/// A snapshot of the counters for one operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCount {
    /// Calls made.
    pub calls: u64,
    /// Calls that failed.
    pub errors: u64,
    /// Data bytes moved.
    pub bytes: u64,
}

impl IoStats {
    /// Counts one call to `op` with outcome `res`.
    pub fn count<T>(&self, op: Op, res: &Result<T>) {
        let c = &self.ops[op as usize];
        c.calls.fetch_add(1, Ordering::Relaxed);
        if res.is_err() {
            c.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Adds `n` bytes moved by `op`.
    pub fn bytes(&self, op: Op, n: u64) {
        self.ops[op as usize].bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Current counters for `op`.
    pub fn get(&self, op: Op) -> OpCount {
        let c = &self.ops[op as usize];
        OpCount {
            calls: c.calls.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            bytes: c.bytes.load(Ordering::Relaxed),
        }
    }

    /// Zeroes everything.
    pub fn clear(&self) {
        for c in &self.ops {
            c.calls.store(0, Ordering::Relaxed);
            c.errors.store(0, Ordering::Relaxed);
            c.bytes.store(0, Ordering::Relaxed);
        }
    }
}

impl fmt::Display for IoStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut total = OpCount::default();
        for (i, c) in self.ops.iter().enumerate() {
            let calls = c.calls.load(Ordering::Relaxed);
            let errors = c.errors.load(Ordering::Relaxed);
            let bytes = c.bytes.load(Ordering::Relaxed);
            total.calls += calls;
            total.errors += errors;
            total.bytes += bytes;
            writeln!(f, "{calls:8} {:<10} {errors:6} errs {bytes:10} bytes", NAMES[i])?;
        }
        writeln!(
            f,
            "{:8} {:<10} {:6} errs {:10} bytes",
            total.calls, "total", total.errors, total.bytes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn counts_and_clears() {
        let s = IoStats::default();
        s.count(Op::Get, &Ok(()));
        s.count::<()>(Op::Get, &Err(Error::Perm("/x".into())));
        s.bytes(Op::Get, 42);
        assert_eq!(
            s.get(Op::Get),
            OpCount {
                calls: 2,
                errors: 1,
                bytes: 42
            }
        );
        assert!(s.to_string().contains("total"));
        s.clear();
        assert_eq!(s.get(Op::Get), OpCount::default());
    }
}
