//! Who an operation is performed for.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// The user every permission check lets through.
pub const SUPERUSER: &str = "elf";

/// Authenticated identity of a client: a user id plus the groups it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    /// The user id.
    pub uid: String,
    /// Groups the user is a member of, excluding the user itself.
    pub gids: BTreeSet<String>,
}

impl Auth {
    /// An identity with no supplementary groups.
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            gids: BTreeSet::new(),
        }
    }

    /// Adds a supplementary group.
    #[must_use]
    pub fn with_group(mut self, gid: impl Into<String>) -> Self {
        self.gids.insert(gid.into());
        self
    }

    /// True if the identity acts as `name`: it is that user, a member of that group, or the
    /// superuser. An empty name matches anyone.
    pub fn in_group(&self, name: &str) -> bool {
        name.is_empty() || self.uid == SUPERUSER || self.uid == name || self.gids.contains(name)
    }
}

/// Membership test that assumes the owner's role when there is no identity.
pub fn in_group(ai: Option<&Auth>, name: &str) -> bool {
    ai.is_none_or(|ai| ai.in_group(name))
}

/// Name of the user running the process, `none` if it cannot be found.
pub fn current_user() -> String {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map_or_else(|| "none".to_owned(), |u| u.name)
}

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// A client talking to a tree: a process-unique id, a tag for logs, and its identity.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Unique for the life of the process.
    pub id: u64,
    /// Human readable name for logs and `/Ctl`.
    pub tag: String,
    /// `None` means the owner's role.
    pub auth: Option<Auth>,
}

impl ClientInfo {
    /// A new client with a fresh id.
    pub fn new(tag: impl Into<String>, auth: Option<Auth>) -> Self {
        Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            tag: tag.into(),
            auth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_membership() {
        let ai = Auth::new("nemo").with_group("sys");
        assert!(ai.in_group("nemo"));
        assert!(ai.in_group("sys"));
        assert!(ai.in_group(""));
        assert!(!ai.in_group("root"));
        assert!(Auth::new(SUPERUSER).in_group("root"));
        assert!(in_group(None, "anyone"));
    }

    #[test]
    fn client_ids_are_unique() {
        let a = ClientInfo::new("a", None);
        let b = ClientInfo::new("b", None);
        assert_ne!(a.id, b.id);
    }
}
