use std::{collections::HashSet, fmt};

use anyhow::Context;

use crate::{
    auth::Identity,
    error::{MemgitError, Result},
    index::{Index, IndexEntry},
    object::{Commit, EntryMode, Object, ObjectId, ObjectKind, Signature},
    odb::ObjectStore,
    remote::{RefUpdate, Remote, RemoteError},
    status::ChangeSet,
    worktree::InMemoryWorktree,
};

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The remote was cloned and checked out.
    Cloned,
    /// Worktree changes were staged.
    Staged,
    /// A commit was created locally.
    Committed,
    /// The commit was accepted by the remote.
    Pushed,
    /// An operation failed; the session accepts no further calls.
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cloned => "cloned",
            Self::Staged => "staged",
            Self::Committed => "committed",
            Self::Pushed => "pushed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A cloned repository with an in-memory worktree.
///
/// Everything lives in memory and is dropped with the session. Operations
/// must follow `clone → stage_all → commit → push`; calls out of order fail
/// with [`MemgitError::State`] and leave the session untouched, while any
/// other failure moves it to [`SessionState::Failed`].
pub struct Session<R: Remote> {
    /// Remote the session was cloned from.
    remote: R,
    /// Objects fetched from the remote plus those created locally.
    store: ObjectStore,
    /// Branch being worked on, e.g. `refs/heads/main`.
    branch: String,
    /// Remote tip the next push expects to replace.
    base: ObjectId,
    /// Last commit known to the session.
    head: ObjectId,
    /// Entries of the last commit's tree.
    head_index: Index,
    /// Root tree of the last commit.
    head_tree: ObjectId,
    /// Staging area.
    index: Index,
    /// Tree written by the last `stage_all`.
    staged_tree: Option<ObjectId>,
    /// Checked-out files.
    worktree: InMemoryWorktree,
    /// Current lifecycle state.
    state: SessionState,
}

impl<R: Remote> Session<R> {
    /// Fetch the remote's default branch and check it out in memory.
    pub fn clone(mut remote: R, identity: &Identity) -> Result<Self> {
        let location = remote.location().to_string();
        let clone_error = |source| MemgitError::Clone {
            location: location.clone(),
            source,
        };

        let fetched = remote.fetch(identity).map_err(clone_error)?;
        let mut store = ObjectStore::new();
        store.import(fetched.objects);
        let (head_tree, head_index, worktree) =
            checkout(&store, fetched.tip).map_err(|e| clone_error(RemoteError::protocol(&e)))?;

        Ok(Self {
            remote,
            store,
            branch: fetched.branch,
            base: fetched.tip,
            head: fetched.tip,
            index: head_index.clone(),
            head_index,
            head_tree,
            staged_tree: None,
            worktree,
            state: SessionState::Cloned,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Full name of the branch being worked on.
    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Last commit known to the session.
    pub fn head(&self) -> ObjectId {
        self.head
    }

    /// The remote this session talks to.
    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Objects held by the session.
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// Fail with a state error unless the session is in one of `allowed`.
    fn require(&self, operation: &'static str, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(MemgitError::State {
                operation,
                state: self.state,
            })
        }
    }

    /// Move to `Failed` and return `err`.
    fn fail<T>(&mut self, err: MemgitError) -> Result<T> {
        self.state = SessionState::Failed;
        Err(err)
    }

    /// The checked-out files.
    pub fn worktree(&self) -> Result<&InMemoryWorktree> {
        self.require("read the worktree", &EDITABLE)?;
        Ok(&self.worktree)
    }

    /// The checked-out files, for modification.
    pub fn worktree_mut(&mut self) -> Result<&mut InMemoryWorktree> {
        self.require("modify the worktree", &EDITABLE)?;
        Ok(&mut self.worktree)
    }

    /// Differences between the worktree, the index and the last commit.
    pub fn status(&self) -> Result<ChangeSet> {
        self.require("compute status", &EDITABLE)?;
        Ok(ChangeSet::compute(
            &self.head_index,
            &self.index,
            &self.worktree,
        ))
    }

    /// Stage every worktree change, including new and deleted files.
    ///
    /// Returns the number of index entries that changed.
    pub fn stage_all(&mut self) -> Result<usize> {
        self.require("stage", &[SessionState::Cloned, SessionState::Staged])?;

        let mut changed = 0;
        let mut present = HashSet::new();
        for (path, file) in self.worktree.files() {
            let id = self.store.write_blob(&file.data);
            let entry = IndexEntry {
                id,
                mode: file.mode,
            };
            if self.index.insert(&path, entry) {
                changed += 1;
            }
            present.insert(path);
        }
        let deleted: Vec<String> = self
            .index
            .iter()
            .filter(|(path, entry)| entry.mode != EntryMode::Gitlink && !present.contains(*path))
            .map(|(path, _)| path.to_string())
            .collect();
        for path in deleted {
            if self.index.remove(&path) {
                changed += 1;
            }
        }

        match self.index.write_tree(&mut self.store) {
            Ok(tree) => self.staged_tree = Some(tree),
            Err(e) => return self.fail(MemgitError::Stage(format!("{e:#}"))),
        }
        self.state = SessionState::Staged;
        Ok(changed)
    }

    /// Commit the staged tree on top of the last commit.
    ///
    /// Fails with [`MemgitError::NothingToCommit`] when the staged tree is
    /// identical to the last commit's tree.
    pub fn commit(&mut self, message: &str, author: &Signature) -> Result<ObjectId> {
        self.require("commit", &[SessionState::Staged])?;
        let tree = match self.staged_tree {
            Some(tree) => tree,
            None => match self.index.write_tree(&mut self.store) {
                Ok(tree) => tree,
                Err(e) => return self.fail(MemgitError::Commit(format!("{e:#}"))),
            },
        };
        if tree == self.head_tree {
            return self.fail(MemgitError::NothingToCommit);
        }

        let mut message = message.trim_end().to_string();
        message.push('\n');
        let commit = Commit {
            tree,
            parents: vec![self.head],
            author: author.clone(),
            committer: author.clone(),
            message,
        };
        let id = self
            .store
            .write(Object::new(ObjectKind::Commit, commit.encode()));

        self.head = id;
        self.head_tree = tree;
        self.head_index = self.index.clone();
        self.staged_tree = None;
        self.state = SessionState::Committed;
        Ok(id)
    }

    /// Send the new commit to the remote and fast-forward its branch.
    ///
    /// Only objects the remote does not already have are transmitted.
    pub fn push(&mut self, identity: &Identity) -> Result<()> {
        self.require("push", &[SessionState::Committed])?;
        let location = self.remote.location().to_string();

        let objects = match self.store.missing_on_remote(self.head) {
            Ok(objects) => objects,
            Err(e) => {
                return self.fail(MemgitError::Push {
                    location,
                    source: RemoteError::protocol(&e),
                });
            }
        };
        let update = RefUpdate {
            refname: self.branch.clone(),
            old: self.base,
            new: self.head,
        };
        if let Err(source) = self.remote.push(identity, &update, &objects) {
            return self.fail(MemgitError::Push { location, source });
        }

        if let Err(e) = self.store.mark_remote(self.head) {
            return self.fail(MemgitError::Push {
                location,
                source: RemoteError::protocol(&e),
            });
        }
        self.base = self.head;
        self.state = SessionState::Pushed;
        Ok(())
    }
}

/// States in which the worktree and status may be used.
const EDITABLE: [SessionState; 3] = [
    SessionState::Cloned,
    SessionState::Staged,
    SessionState::Committed,
];

/// Check out commit `tip`: its root tree, its entries and a worktree holding its files.
///
/// Also verifies that everything reachable from `tip` was received.
fn checkout(
    store: &ObjectStore,
    tip: ObjectId,
) -> anyhow::Result<(ObjectId, Index, InMemoryWorktree)> {
    store
        .reachable(tip)
        .context("fetched pack is incomplete")?;
    let tree = store.commit(&tip)?.tree;
    let index = Index::from_tree(store, tree)?;
    let mut worktree = InMemoryWorktree::new();
    for (path, entry) in index.iter() {
        if !entry.mode.is_blob() {
            continue;
        }
        let data = store.blob(&entry.id)?;
        worktree
            .write_file_with_mode(path, data, entry.mode)
            .with_context(|| format!("failed to check out '{path}'"))?;
    }
    Ok((tree, index, worktree))
}
