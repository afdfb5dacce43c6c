//! Shared hierarchical store
//!
//! Agents exchange state through `/`-separated paths such as `sys/SPOTTER/AAPL/SPOT`.
//! Values are opaque to the store; readers ask for the type they expect and get `None`
//! when the path is missing or holds something else. Every operation takes the single
//! store lock, so each individual read or write is atomic with respect to all others.

use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::StoreError;

/// Opaque value held by the store
pub type StoreValue = Arc<dyn Any + Send + Sync>;

/// A path into the store, made of non-empty segments
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    /// Split `path` on `/`, skipping empty segments
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments
                .into_iter()
                .map(Into::into)
                .filter(|s: &String| !s.is_empty())
                .collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Append a segment, returning the extended path
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        let segment = segment.into();
        if !segment.is_empty() {
            segments.push(segment);
        }
        Self { segments }
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl From<&str> for StorePath {
    fn from(path: &str) -> Self {
        StorePath::parse(path)
    }
}

impl From<String> for StorePath {
    fn from(path: String) -> Self {
        StorePath::parse(&path)
    }
}

impl From<&String> for StorePath {
    fn from(path: &String) -> Self {
        StorePath::parse(path)
    }
}

impl From<&StorePath> for StorePath {
    fn from(path: &StorePath) -> Self {
        path.clone()
    }
}

enum Node {
    Branch(HashMap<String, Node>),
    Leaf(StoreValue),
}

impl Node {
    fn branch() -> Self {
        Node::Branch(HashMap::new())
    }

    fn lookup(&self, segments: &[String]) -> Option<&Node> {
        segments.iter().try_fold(self, |node, segment| match node {
            Node::Branch(children) => children.get(segment),
            Node::Leaf(_) => None,
        })
    }

    /// Walk to the container holding the last segment, turning any leaf on the way
    /// into an empty container.
    fn container_mut(&mut self, parents: &[String]) -> &mut HashMap<String, Node> {
        let mut node = self;
        for segment in parents {
            let children = node.ensure_branch();
            node = children.entry(segment.clone()).or_insert_with(Node::branch);
        }
        node.ensure_branch()
    }

    fn ensure_branch(&mut self) -> &mut HashMap<String, Node> {
        match self {
            Node::Branch(children) => children,
            node => {
                debug!("Overwriting store value with a container");
                *node = Node::branch();
                node.ensure_branch()
            }
        }
    }
}

/// In-memory hierarchical key/value store shared by all agents of a hub
pub struct SharedStore {
    root: RwLock<Node>,
}

impl Default for SharedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedStore").finish_non_exhaustive()
    }
}

impl SharedStore {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Node::branch()),
        }
    }

    /// Store `value` at `path`, creating intermediate containers as needed.
    ///
    /// A value sitting where a container is needed is replaced by the container, and a
    /// container at `path` itself is replaced by the value.
    pub fn set<T>(&self, path: impl Into<StorePath>, value: T) -> Result<(), StoreError>
    where
        T: Any + Send + Sync,
    {
        self.set_value(path, Arc::new(value))
    }

    /// Store an already type-erased value
    pub fn set_value(&self, path: impl Into<StorePath>, value: StoreValue) -> Result<(), StoreError> {
        let path = path.into();
        let (last, parents) = path.segments().split_last().ok_or(StoreError::EmptyPath)?;

        let mut root = self.root.write();
        root.container_mut(parents)
            .insert(last.clone(), Node::Leaf(value));
        Ok(())
    }

    /// Value at `path` if present and of type `T`
    pub fn get<T>(&self, path: impl Into<StorePath>) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.get_value(path)?.downcast::<T>().ok()
    }

    /// Type-erased value at `path`; containers yield `None`
    pub fn get_value(&self, path: impl Into<StorePath>) -> Option<StoreValue> {
        let path = path.into();
        if path.is_empty() {
            return None;
        }

        let root = self.root.read();
        match root.lookup(path.segments())? {
            Node::Leaf(value) => Some(value.clone()),
            Node::Branch(_) => None,
        }
    }

    /// Whether `path` holds a value or a container
    pub fn exists(&self, path: impl Into<StorePath>) -> bool {
        let path = path.into();
        !path.is_empty() && self.root.read().lookup(path.segments()).is_some()
    }

    /// Remove the value or whole subtree at `path`. Returns true if anything was removed.
    pub fn delete(&self, path: impl Into<StorePath>) -> bool {
        let path = path.into();
        let Some((last, parents)) = path.segments().split_last() else {
            return false;
        };

        let mut root = self.root.write();
        let mut node = &mut *root;
        for segment in parents {
            node = match node {
                Node::Branch(children) => match children.get_mut(segment) {
                    Some(child) => child,
                    None => return false,
                },
                Node::Leaf(_) => return false,
            };
        }

        match node {
            Node::Branch(children) => children.remove(last).is_some(),
            Node::Leaf(_) => false,
        }
    }

    /// Atomically replace the value at `path` with `f(current)`.
    ///
    /// `current` is `None` when the path is missing or holds a different type.
    pub fn update<T, F>(&self, path: impl Into<StorePath>, f: F) -> Result<Arc<T>, StoreError>
    where
        T: Any + Send + Sync,
        F: FnOnce(Option<&T>) -> T,
    {
        let path = path.into();
        let (last, parents) = path.segments().split_last().ok_or(StoreError::EmptyPath)?;

        let mut root = self.root.write();
        let container = root.container_mut(parents);
        let current = match container.get(last) {
            Some(Node::Leaf(value)) => value.clone().downcast::<T>().ok(),
            _ => None,
        };

        let updated = Arc::new(f(current.as_deref()));
        container.insert(last.clone(), Node::Leaf(updated.clone()));
        Ok(updated)
    }

    /// Child segment names of the container at `path`, sorted. The empty path lists the root.
    pub fn keys(&self, path: impl Into<StorePath>) -> Vec<String> {
        let path = path.into();
        let root = self.root.read();
        let mut keys = match root.lookup(path.segments()) {
            Some(Node::Branch(children)) => children.keys().cloned().collect::<Vec<_>>(),
            _ => Vec::new(),
        };
        keys.sort();
        keys
    }

    /// Remove everything
    pub fn clear(&self) {
        *self.root.write() = Node::branch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_isolation() {
        let store = SharedStore::new();
        store.set("a/b/c", 1i64).unwrap();

        assert_eq!(store.get::<i64>("a/b/c").as_deref(), Some(&1));
        assert!(store.get::<i64>("a/b/x").is_none());

        store.set("a/b/d", 2i64).unwrap();
        assert!(store.delete("a/b/c"));
        assert!(store.get::<i64>("a/b/c").is_none());
        assert_eq!(store.get::<i64>("a/b/d").as_deref(), Some(&2));
    }

    #[test]
    fn test_missing_segments_are_not_errors() {
        let store = SharedStore::new();
        assert!(store.get::<i64>("nothing/here").is_none());
        assert!(!store.exists("nothing/here"));
        assert!(!store.delete("nothing/here"));
        assert!(!store.delete(""));
    }

    #[test]
    fn test_exists_and_containers() {
        let store = SharedStore::new();
        store.set("sys/SPOTTER/AAPL/SPOT", 101.5f64).unwrap();

        assert!(store.exists("sys/SPOTTER"));
        assert!(store.exists("sys/SPOTTER/AAPL/SPOT"));
        // containers are not values
        assert!(store.get_value("sys/SPOTTER").is_none());
        assert_eq!(store.keys("sys/SPOTTER"), vec!["AAPL".to_string()]);
    }

    #[test]
    fn test_type_mismatch_reads_absent() {
        let store = SharedStore::new();
        store.set("k", "text".to_string()).unwrap();
        assert!(store.get::<i64>("k").is_none());
        assert_eq!(store.get::<String>("k").as_deref().map(String::as_str), Some("text"));
    }

    #[test]
    fn test_write_through_value_overwrites() {
        let store = SharedStore::new();
        store.set("a/b", 1i64).unwrap();
        store.set("a/b/c", 2i64).unwrap();

        assert!(store.get::<i64>("a/b").is_none());
        assert_eq!(store.get::<i64>("a/b/c").as_deref(), Some(&2));

        // and a value replaces a subtree
        store.set("a", 3i64).unwrap();
        assert!(!store.exists("a/b/c"));
        assert_eq!(store.get::<i64>("a").as_deref(), Some(&3));
    }

    #[test]
    fn test_delete_subtree() {
        let store = SharedStore::new();
        store.set("x/1", 1i64).unwrap();
        store.set("x/2", 2i64).unwrap();
        store.set("y", 3i64).unwrap();

        assert!(store.delete("x"));
        assert!(!store.exists("x/1"));
        assert!(store.exists("y"));
        // deleting below a value finds nothing
        assert!(!store.delete("y/z"));
    }

    #[test]
    fn test_empty_path_rejected() {
        let store = SharedStore::new();
        assert_eq!(store.set("", 1i64), Err(StoreError::EmptyPath));
        assert_eq!(store.set("//", 1i64), Err(StoreError::EmptyPath));
        assert!(!store.exists(""));
    }

    #[test]
    fn test_update_accumulates() {
        let store = SharedStore::new();
        for i in 0..3 {
            store
                .update::<Vec<i32>, _>("series", |current| {
                    let mut values = current.cloned().unwrap_or_default();
                    values.push(i);
                    values
                })
                .unwrap();
        }
        assert_eq!(store.get::<Vec<i32>>("series").as_deref(), Some(&vec![0, 1, 2]));
    }

    #[test]
    fn test_concurrent_updates_are_atomic() {
        let store = Arc::new(SharedStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        store
                            .update::<u64, _>("counter", |n| n.copied().unwrap_or(0) + 1)
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get::<u64>("counter").as_deref(), Some(&800));
    }

    #[test]
    fn test_path_display_and_clear() {
        let path = StorePath::from_segments(["sys", "SPREADS"]).child("AAPL");
        assert_eq!(path.to_string(), "sys/SPREADS/AAPL");
        assert_eq!(StorePath::parse("/a//b/").segments(), &["a", "b"]);

        let store = SharedStore::new();
        store.set(&path, 1u8).unwrap();
        store.clear();
        assert!(store.keys("").is_empty());
    }
}
