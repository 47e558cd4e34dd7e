//! zx-cfs shared library: a write-behind caching tree with path locking and invalidations.

/// Client identities and permission groups.
pub mod auth;
/// Cache states of cached entries and the sync proc.
pub mod cache;
pub mod cfs;
/// Directory entries and their wire format.
pub mod dir;
pub mod error;
/// Runtime flags settable through `/Ctl`.
pub mod flags;
pub mod io;
pub mod locks;
/// Absolute, cleaned, slash-separated paths.
pub mod path;
/// Entry predicates used by `find` and conditional operations.
pub mod pred;
pub mod stats;
pub mod tree;
pub mod work;

pub use cfs::{Cfs, CfsOptions, Tuning};
pub use dir::Dir;
pub use error::{Error, Result};
pub use tree::{LocalTree, MemTree, Tree};
