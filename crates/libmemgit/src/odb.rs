use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result, bail};

use crate::object::{
    Commit, EntryMode, Object, ObjectId, ObjectKind, TreeEntry, commit_links, parse_tree,
};

/// In-memory object database for a single session.
///
/// Objects either arrive from the remote (via [`ObjectStore::import`]) or are
/// written locally while staging and committing. The store remembers which
/// objects the remote already has so a push only transmits new ones.
#[derive(Debug, Default)]
pub struct ObjectStore {
    /// All known objects keyed by id.
    objects: HashMap<ObjectId, Object>,
    /// Ids of objects that came from the remote.
    remote: HashSet<ObjectId>,
}

impl ObjectStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects held.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the store holds no objects.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Add objects received from the remote.
    pub fn import(&mut self, objects: impl IntoIterator<Item = Object>) {
        for object in objects {
            self.remote.insert(object.id());
            self.objects.insert(object.id(), object);
        }
    }

    /// Record that the remote now holds everything reachable from `tip`.
    pub fn mark_remote(&mut self, tip: ObjectId) -> Result<()> {
        let pushed = self.missing_on_remote(tip)?;
        self.remote.extend(pushed.iter().map(Object::id));
        Ok(())
    }

    /// Store a locally created object and return its id.
    pub fn write(&mut self, object: Object) -> ObjectId {
        let id = object.id();
        self.objects.entry(id).or_insert(object);
        id
    }

    /// Store a blob with `data`.
    pub fn write_blob(&mut self, data: &[u8]) -> ObjectId {
        self.write(Object::blob(data.to_vec()))
    }

    /// Whether the store has `id`.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    /// Look up an object.
    pub fn get(&self, id: &ObjectId) -> Option<&Object> {
        self.objects.get(id)
    }

    /// Fetch an object and check that it is of `kind`.
    fn get_kind(&self, id: &ObjectId, kind: ObjectKind) -> Result<&Object> {
        let object = self
            .get(id)
            .with_context(|| format!("object {id} is missing"))?;
        if object.kind() != kind {
            bail!("object {id} is a {}, expected a {kind}", object.kind());
        }
        Ok(object)
    }

    /// Decode the commit `id`.
    pub fn commit(&self, id: &ObjectId) -> Result<Commit> {
        let object = self.get_kind(id, ObjectKind::Commit)?;
        Commit::parse(object.data()).with_context(|| format!("failed to parse commit {id}"))
    }

    /// Decode the tree `id`.
    pub fn tree(&self, id: &ObjectId) -> Result<Vec<TreeEntry>> {
        let object = self.get_kind(id, ObjectKind::Tree)?;
        parse_tree(object.data()).with_context(|| format!("failed to parse tree {id}"))
    }

    /// Contents of the blob `id`.
    pub fn blob(&self, id: &ObjectId) -> Result<&[u8]> {
        Ok(self.get_kind(id, ObjectKind::Blob)?.data())
    }

    /// Objects reachable from `tip` that the remote does not have yet.
    ///
    /// The walk stops at objects imported from (or already pushed to) the
    /// remote, so the result is exactly what a push must transmit.
    pub fn missing_on_remote(&self, tip: ObjectId) -> Result<Vec<Object>> {
        self.collect_reachable(tip, |id| self.remote.contains(id))
    }

    /// Every object reachable from `tip`.
    pub fn reachable(&self, tip: ObjectId) -> Result<Vec<Object>> {
        self.collect_reachable(tip, |_| false)
    }

    /// Depth-first walk from `tip`, skipping ids for which `known` is true.
    fn collect_reachable(
        &self,
        tip: ObjectId,
        known: impl Fn(&ObjectId) -> bool,
    ) -> Result<Vec<Object>> {
        let mut seen = HashSet::new();
        let mut stack = vec![tip];
        let mut out = Vec::new();

        while let Some(id) = stack.pop() {
            if known(&id) || !seen.insert(id) {
                continue;
            }
            let object = self
                .get(&id)
                .with_context(|| format!("object {id} is missing"))?;
            match object.kind() {
                ObjectKind::Commit => {
                    let (tree, parents) = commit_links(object.data())
                        .with_context(|| format!("failed to parse commit {id}"))?;
                    stack.push(tree);
                    stack.extend(parents);
                }
                ObjectKind::Tree => {
                    for entry in self.tree(&id)? {
                        // Submodule commits live in another repository.
                        if entry.mode != EntryMode::Gitlink {
                            stack.push(entry.id);
                        }
                    }
                }
                ObjectKind::Blob | ObjectKind::Tag => {}
            }
            out.push(object.clone());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Signature, encode_tree};

    fn signature() -> Signature {
        Signature {
            name: "Tester".into(),
            email: "tester@example.com".into(),
            time: 1_700_000_000,
            offset_minutes: 0,
        }
    }

    fn commit_with_file(store: &mut ObjectStore, contents: &[u8], parent: Option<ObjectId>) -> ObjectId {
        let blob = store.write_blob(contents);
        let tree = store.write(Object::new(
            ObjectKind::Tree,
            encode_tree(&[TreeEntry {
                mode: EntryMode::File,
                name: "README.md".into(),
                id: blob,
            }]),
        ));
        let commit = Commit {
            tree,
            parents: parent.into_iter().collect(),
            author: signature(),
            committer: signature(),
            message: "msg".into(),
        };
        store.write(Object::new(ObjectKind::Commit, commit.encode()))
    }

    #[test]
    fn missing_on_remote_stops_at_imported_objects() {
        let mut remote_side = ObjectStore::new();
        let base = commit_with_file(&mut remote_side, b"base", None);
        let imported = remote_side.reachable(base).unwrap();
        assert_eq!(imported.len(), 3);

        let mut store = ObjectStore::new();
        store.import(imported);
        let next = commit_with_file(&mut store, b"next", Some(base));

        let missing = store.missing_on_remote(next).unwrap();
        let kinds: HashSet<ObjectKind> = missing.iter().map(Object::kind).collect();
        assert_eq!(missing.len(), 3);
        assert!(kinds.contains(&ObjectKind::Commit));
        assert!(kinds.contains(&ObjectKind::Tree));
        assert!(kinds.contains(&ObjectKind::Blob));
        assert!(missing.iter().all(|o| o.id() != base));

        store.mark_remote(next).unwrap();
        assert!(store.missing_on_remote(next).unwrap().is_empty());
    }

    #[test]
    fn history_walk_tolerates_malformed_identities() {
        let mut store = ObjectStore::new();
        let first = commit_with_file(&mut store, b"old", None);
        let tree = store.commit(&first).unwrap().tree;
        let odd = store.write(Object::new(
            ObjectKind::Commit,
            format!("tree {tree}\nparent {first}\nauthor nobody\ncommitter nobody\n\nold import\n")
                .into_bytes(),
        ));
        let tip = commit_with_file(&mut store, b"new", Some(odd));

        assert!(store.commit(&odd).is_err());
        let reachable = store.reachable(tip).unwrap();
        // 3 commits, 2 trees, 2 blobs
        assert_eq!(reachable.len(), 7);
        assert_eq!(store.commit(&tip).unwrap().parents, vec![odd]);
    }

    #[test]
    fn typed_lookups_reject_wrong_kinds() {
        let mut store = ObjectStore::new();
        let blob = store.write_blob(b"data");
        assert!(store.commit(&blob).is_err());
        assert!(store.tree(&blob).is_err());
        assert_eq!(store.blob(&blob).unwrap(), b"data");
        assert!(store.blob(&ObjectId::ZERO).is_err());
    }

    #[test]
    fn writing_the_same_object_twice_is_a_no_op() {
        let mut store = ObjectStore::new();
        let a = store.write_blob(b"same");
        let b = store.write_blob(b"same");
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }
}
