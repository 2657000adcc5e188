use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{Context, Result, bail};

use crate::{
    auth::Identity,
    index::{Index, IndexEntry},
    object::{
        Commit, EntryMode, Object, ObjectId, ObjectKind, Signature, commit_links, parse_tree,
    },
    odb::ObjectStore,
    remote::{Fetched, RefUpdate, Remote, RemoteError, RemoteLocation, RemoteResult},
};

/// Branch an in-memory remote starts with.
const DEFAULT_BRANCH: &str = "refs/heads/main";

/// Shared state of an in-memory repository.
#[derive(Debug)]
struct State {
    /// All objects.
    store: ObjectStore,
    /// Branches and their tips.
    refs: BTreeMap<String, ObjectId>,
    /// Branch `HEAD` points at.
    head: String,
    /// Public keys allowed to connect.
    authorized: HashSet<String>,
    /// Number of connection attempts.
    connections: usize,
    /// Whether connections succeed at all.
    reachable: bool,
}

/// An in-process repository implementing [`Remote`].
///
/// Clones share the same repository, so a test can keep a handle to inspect
/// or modify the remote while a session owns another.
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    /// Location reported to callers.
    location: RemoteLocation,
    /// Repository contents.
    state: Arc<Mutex<State>>,
}

impl MemoryRemote {
    /// Empty repository whose `HEAD` is `refs/heads/main`.
    pub fn new(name: &str) -> Self {
        Self {
            location: RemoteLocation::in_memory(name),
            state: Arc::new(Mutex::new(State {
                store: ObjectStore::new(),
                refs: BTreeMap::new(),
                head: DEFAULT_BRANCH.to_string(),
                authorized: HashSet::new(),
                connections: 0,
                reachable: true,
            })),
        }
    }

    /// Lock the shared state, ignoring poisoning.
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allow connections from `public_key` (OpenSSH `algorithm base64` form).
    pub fn authorize(&self, public_key: &str) {
        self.state().authorized.insert(public_key.to_string());
    }

    /// Make every later connection fail as if the network were down.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// Number of connection attempts so far.
    pub fn connection_count(&self) -> usize {
        self.state().connections
    }

    /// Tip of the `HEAD` branch.
    pub fn tip(&self) -> Option<ObjectId> {
        let state = self.state();
        state.refs.get(&state.head).copied()
    }

    /// The commit at the tip of the `HEAD` branch.
    pub fn head_commit(&self) -> Option<Commit> {
        let tip = self.tip()?;
        self.state().store.commit(&tip).ok()
    }

    /// Paths and contents of every file at the tip of the `HEAD` branch.
    pub fn files(&self) -> BTreeMap<String, Vec<u8>> {
        let Some(commit) = self.head_commit() else {
            return BTreeMap::new();
        };
        let state = self.state();
        let Ok(index) = Index::from_tree(&state.store, commit.tree) else {
            return BTreeMap::new();
        };
        index
            .iter()
            .filter_map(|(path, entry)| {
                let data = state.store.blob(&entry.id).ok()?;
                Some((path.to_string(), data.to_vec()))
            })
            .collect()
    }

    /// Contents of `path` at the tip of the `HEAD` branch.
    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        self.files().remove(path)
    }

    /// Commit `files` on top of the `HEAD` branch, as another client would.
    pub fn commit_files(&self, files: &[(&str, &[u8])], message: &str) -> Result<ObjectId> {
        let mut state = self.state();
        let parent = state.refs.get(&state.head).copied();
        let mut index = match parent {
            Some(parent) => {
                let tree = state.store.commit(&parent)?.tree;
                Index::from_tree(&state.store, tree)?
            }
            None => Index::new(),
        };
        for (path, data) in files {
            let id = state.store.write_blob(data);
            index.insert(
                path,
                IndexEntry {
                    id,
                    mode: EntryMode::File,
                },
            );
        }
        let tree = index.write_tree(&mut state.store)?;
        let signature = Signature::now("Remote Author", "remote@example.com");
        let commit = Commit {
            tree,
            parents: parent.into_iter().collect(),
            author: signature.clone(),
            committer: signature,
            message: format!("{message}\n"),
        };
        let id = state
            .store
            .write(Object::new(ObjectKind::Commit, commit.encode()));
        let head = state.head.clone();
        state.refs.insert(head, id);
        Ok(id)
    }

    /// Count a connection and check reachability and authorization.
    fn connect(&self, identity: &Identity) -> RemoteResult<MutexGuard<'_, State>> {
        let mut state = self.state();
        state.connections += 1;
        if !state.reachable {
            return Err(RemoteError::Transport(format!(
                "{}: connection refused",
                self.location
            )));
        }
        if !state.authorized.contains(identity.public_key()) {
            return Err(RemoteError::AuthRejected {
                user: identity.principal().to_string(),
            });
        }
        Ok(state)
    }
}

/// Check that everything reachable from `tip` is in `store` or `incoming`.
///
/// Objects already in `store` are assumed complete.
fn verify_connected(
    store: &ObjectStore,
    incoming: &HashMap<ObjectId, &Object>,
    tip: ObjectId,
) -> Result<()> {
    let mut stack = vec![tip];
    let mut seen = HashSet::new();
    while let Some(id) = stack.pop() {
        if store.contains(&id) || !seen.insert(id) {
            continue;
        }
        let object = incoming
            .get(&id)
            .with_context(|| format!("object {id} was not sent"))?;
        match object.kind() {
            ObjectKind::Commit => {
                let (tree, parents) = commit_links(object.data())?;
                stack.push(tree);
                stack.extend(parents);
            }
            ObjectKind::Tree => stack.extend(
                parse_tree(object.data())?
                    .into_iter()
                    .filter(|entry| entry.mode != EntryMode::Gitlink)
                    .map(|entry| entry.id),
            ),
            ObjectKind::Blob | ObjectKind::Tag => {}
        }
    }
    Ok(())
}

impl Remote for MemoryRemote {
    fn location(&self) -> &RemoteLocation {
        &self.location
    }

    fn fetch(&mut self, identity: &Identity) -> RemoteResult<Fetched> {
        let state = self.connect(identity)?;
        let Some(tip) = state.refs.get(&state.head).copied() else {
            return Err(RemoteError::EmptyRepository);
        };
        let objects = state
            .store
            .reachable(tip)
            .map_err(|e| RemoteError::protocol(&e))?;
        Ok(Fetched {
            branch: state.head.clone(),
            tip,
            objects,
        })
    }

    fn push(
        &mut self,
        identity: &Identity,
        update: &RefUpdate,
        objects: &[Object],
    ) -> RemoteResult<()> {
        let mut state = self.connect(identity)?;
        update.check_fast_forward(state.refs.get(&update.refname).copied())?;
        if update.new.is_zero() {
            return Err(RemoteError::Rejected {
                refname: update.refname.clone(),
                reason: "deleting branches is not supported".to_string(),
            });
        }

        let incoming: HashMap<ObjectId, &Object> =
            objects.iter().map(|object| (object.id(), object)).collect();
        let check = verify_connected(&state.store, &incoming, update.new).and_then(|()| {
            let kind = incoming
                .get(&update.new)
                .map(|o| o.kind())
                .or_else(|| state.store.get(&update.new).map(Object::kind));
            if kind != Some(ObjectKind::Commit) {
                bail!("{} is not a commit", update.new);
            }
            Ok(())
        });
        if let Err(e) = check {
            return Err(RemoteError::Rejected {
                refname: update.refname.clone(),
                reason: format!("{e:#}"),
            });
        }

        for object in objects {
            state.store.write(object.clone());
        }
        state.refs.insert(update.refname.clone(), update.new);
        Ok(())
    }
}
