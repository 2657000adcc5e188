use std::collections::BTreeMap;

use anyhow::Result;

use crate::{
    object::{EntryMode, Object, ObjectId, ObjectKind, TreeEntry, encode_tree},
    odb::ObjectStore,
};

/// A staged file: the blob (or submodule commit) and its mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Blob id, or commit id for gitlinks.
    pub id: ObjectId,
    /// File mode.
    pub mode: EntryMode,
}

/// Staging area: the flat set of paths the next commit will contain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Index {
    /// Entries keyed by `/`-separated path.
    entries: BTreeMap<String, IndexEntry>,
}

/// Intermediate directory structure used while writing trees.
enum Node {
    /// A file or gitlink.
    Leaf(IndexEntry),
    /// A directory with its children.
    Dir(BTreeMap<String, Node>),
}

impl Index {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the index from the tree `tree` in `store`.
    pub fn from_tree(store: &ObjectStore, tree: ObjectId) -> Result<Self> {
        let mut index = Self::new();
        index.read_tree(store, tree, "")?;
        Ok(index)
    }

    /// Recursively flatten `tree` into entries under `prefix`.
    fn read_tree(&mut self, store: &ObjectStore, tree: ObjectId, prefix: &str) -> Result<()> {
        for entry in store.tree(&tree)? {
            let path = if prefix.is_empty() {
                entry.name.clone()
            } else {
                format!("{prefix}/{}", entry.name)
            };
            if entry.mode == EntryMode::Tree {
                self.read_tree(store, entry.id, &path)?;
            } else {
                self.entries.insert(
                    path,
                    IndexEntry {
                        id: entry.id,
                        mode: entry.mode,
                    },
                );
            }
        }
        Ok(())
    }

    /// Look up a path.
    pub fn get(&self, path: &str) -> Option<&IndexEntry> {
        self.entries.get(path)
    }

    /// Stage `entry` at `path`, returning whether the index changed.
    pub fn insert(&mut self, path: &str, entry: IndexEntry) -> bool {
        self.entries.insert(path.to_string(), entry) != Some(entry)
    }

    /// Unstage `path`, returning whether it was present.
    pub fn remove(&mut self, path: &str) -> bool {
        self.entries.remove(path).is_some()
    }

    /// Iterate over entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &IndexEntry)> {
        self.entries.iter().map(|(path, entry)| (path.as_str(), entry))
    }

    /// Number of staged paths.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the tree objects for this index into `store`, returning the root tree id.
    pub fn write_tree(&self, store: &mut ObjectStore) -> Result<ObjectId> {
        let mut root = BTreeMap::new();
        for (path, entry) in &self.entries {
            insert_node(&mut root, path, *entry)?;
        }
        Ok(write_dir(store, &root))
    }
}

/// Place `entry` into the directory structure rooted at `dir`.
fn insert_node(dir: &mut BTreeMap<String, Node>, path: &str, entry: IndexEntry) -> Result<()> {
    match path.split_once('/') {
        None => {
            dir.insert(path.to_string(), Node::Leaf(entry));
        }
        Some((head, rest)) => {
            let child = dir
                .entry(head.to_string())
                .or_insert_with(|| Node::Dir(BTreeMap::new()));
            match child {
                Node::Dir(children) => insert_node(children, rest, entry)?,
                Node::Leaf(_) => anyhow::bail!("'{head}' is both a file and a directory"),
            }
        }
    }
    Ok(())
}

/// Write the tree for `dir` (children first) and return its id.
fn write_dir(store: &mut ObjectStore, dir: &BTreeMap<String, Node>) -> ObjectId {
    let entries: Vec<TreeEntry> = dir
        .iter()
        .map(|(name, node)| match node {
            Node::Leaf(entry) => TreeEntry {
                mode: entry.mode,
                name: name.clone(),
                id: entry.id,
            },
            Node::Dir(children) => TreeEntry {
                mode: EntryMode::Tree,
                name: name.clone(),
                id: write_dir(store, children),
            },
        })
        .collect();
    store.write(Object::new(ObjectKind::Tree, encode_tree(&entries)))
}
