//! Cache states and the tree recording the paths that are not simply clean or unread.

use std::collections::BTreeMap;
use std::fmt;

use crate::path;

/// What the cache knows about one path.
///
/// `Unread` and `Clean` are never stored in the cache-info tree: they are told apart by the
/// `Cache` attribute of the cached entry. Every other state lives in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Only metadata is cached.
    Unread,
    /// Metadata and data are cached and believed fresh.
    Clean,
    /// Data not cached; a metadata change awaits upload.
    UnreadMeta,
    /// A metadata change awaits upload.
    Meta,
    /// A data change awaits upload.
    Data,
    /// Created locally; the whole file awaits upload.
    New,
    /// Removed locally; the removal awaits upload.
    Del,
}

impl State {
    /// True for the states the sync proc has work to do for.
    pub fn is_dirty(self) -> bool {
        !matches!(self, State::Unread | State::Clean)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Unread => "unread",
            State::Clean => "clean",
            State::UnreadMeta => "unreadmeta",
            State::Meta => "meta",
            State::Data => "data",
            State::New => "new",
            State::Del => "del",
        })
    }
}

/// One tracked path. A node without a state only carries dirty descendants.
#[derive(Debug, Clone, Default)]
pub(crate) struct Node {
    pub path: String,
    pub state: Option<State>,
    /// Mid-write; the sync proc leaves it alone unless forced.
    pub busy: bool,
    /// A local removal must reach the backing tree before the node is pushed again.
    pub wasdel: bool,
    pub children: BTreeMap<String, Node>,
}

impl Node {
    pub fn root() -> Self {
        Node {
            path: "/".to_owned(),
            ..Node::default()
        }
    }

    /// Stores `st`, keeping only the states that need a node.
    pub fn set_state(&mut self, st: State) {
        self.state = st.is_dirty().then_some(st);
    }

    /// True if nothing about this node or below it needs remembering.
    pub fn is_idle(&self) -> bool {
        self.state.is_none() && !self.busy && self.children.is_empty()
    }

    pub fn get(&self, p: &str) -> Option<&Node> {
        path::elems(p)
            .into_iter()
            .try_fold(self, |n, el| n.children.get(el))
    }

    pub fn get_mut(&mut self, p: &str) -> Option<&mut Node> {
        path::elems(p)
            .into_iter()
            .try_fold(self, |n, el| n.children.get_mut(el))
    }

    /// The node for `p`, creating it and any missing carriers above it.
    pub fn make(&mut self, p: &str) -> &mut Node {
        path::elems(p).into_iter().fold(self, |n, el| {
            let child = path::join(&n.path, el);
            n.children.entry(el.to_owned()).or_insert_with(|| Node {
                path: child,
                ..Node::default()
            })
        })
    }

    /// Detaches the subtree at `p`, then prunes carriers left idle above it. The root is
    /// emptied rather than detached.
    pub fn take(&mut self, p: &str) -> Option<Node> {
        let els = path::elems(p);
        let Some((last, up)) = els.split_last() else {
            return Some(std::mem::replace(self, Node::root()));
        };
        let parent = up.iter().try_fold(&mut *self, |n, el| n.children.get_mut(*el))?;
        let gone = parent.children.remove(*last);
        self.prune(p);
        gone
    }

    /// Removes idle nodes along `p`, deepest first.
    pub fn prune(&mut self, p: &str) {
        fn walk(n: &mut Node, els: &[&str]) {
            let Some((first, rest)) = els.split_first() else {
                return;
            };
            if let Some(c) = n.children.get_mut(*first) {
                walk(c, rest);
                if c.is_idle() {
                    n.children.remove(*first);
                }
            }
        }
        walk(self, &path::elems(p));
    }

    /// Drops idle descendants everywhere below this node.
    pub fn prune_all(&mut self) {
        for c in self.children.values_mut() {
            c.prune_all();
        }
        self.children.retain(|_, c| !c.is_idle());
    }

    /// Appends `(path, state, busy)` for every node holding a state, parents first.
    pub fn collect(&self, out: &mut Vec<(String, State, bool)>) {
        if let Some(st) = self.state {
            out.push((self.path.clone(), st, self.busy));
        }
        for c in self.children.values() {
            c.collect(out);
        }
    }

    /// Multi-line indented listing, for debugging.
    pub fn dump(&self, depth: usize, out: &mut String) {
        use std::fmt::Write as _;
        let st = self.state.map_or_else(|| "-".to_owned(), |s| s.to_string());
        let _ = writeln!(
            out,
            "{:indent$}{} = {}{}{}",
            "",
            self.path,
            st,
            if self.busy { " busy" } else { "" },
            if self.wasdel { " wasdel" } else { "" },
            indent = depth * 4
        );
        for c in self.children.values() {
            c.dump(depth + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_adds_carriers() {
        let mut root = Node::root();
        root.make("/a/b/c").set_state(State::Data);
        assert_eq!(root.get("/a").unwrap().state, None);
        assert_eq!(root.get("/a/b/c").unwrap().state, Some(State::Data));
        assert_eq!(root.get("/a/b/c").unwrap().path, "/a/b/c");
        assert!(root.get("/a/x").is_none());
    }

    #[test]
    fn clean_states_are_not_stored() {
        let mut n = Node::root();
        n.set_state(State::Clean);
        assert_eq!(n.state, None);
        n.set_state(State::Unread);
        assert_eq!(n.state, None);
        n.set_state(State::UnreadMeta);
        assert_eq!(n.state, Some(State::UnreadMeta));
    }

    #[test]
    fn prune_removes_idle_carriers() {
        let mut root = Node::root();
        root.make("/a/b").set_state(State::Meta);
        root.make("/a/c").set_state(State::Meta);
        root.get_mut("/a/b").unwrap().set_state(State::Clean);
        root.prune("/a/b");
        assert!(root.get("/a/b").is_none());
        assert!(root.get("/a").is_some());

        root.get_mut("/a/c").unwrap().set_state(State::Clean);
        root.prune("/a/c");
        assert!(root.children.is_empty());
    }

    #[test]
    fn take_detaches_subtree() {
        let mut root = Node::root();
        root.make("/a/b/c").set_state(State::New);
        root.make("/a/b").set_state(State::New);
        let gone = root.take("/a/b").unwrap();
        assert_eq!(gone.children.len(), 1);
        assert!(root.children.is_empty());
        assert!(root.take("/nope").is_none());
    }

    #[test]
    fn busy_keeps_node() {
        let mut root = Node::root();
        let n = root.make("/f");
        n.set_state(State::Clean);
        n.busy = true;
        root.prune_all();
        assert!(root.get("/f").is_some());
    }
}
