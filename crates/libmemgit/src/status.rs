use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use crate::{
    index::{Index, IndexEntry},
    object::{EntryMode, ObjectId, ObjectKind},
    worktree::InMemoryWorktree,
};

/// Per-path status code, as in `git status --porcelain`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// No change.
    Unmodified,
    /// Present in the worktree but not tracked.
    Untracked,
    /// Newly added.
    Added,
    /// Content or mode changed.
    Modified,
    /// Removed.
    Deleted,
}

impl StatusCode {
    /// Single-character porcelain code.
    pub fn code(self) -> char {
        match self {
            Self::Unmodified => ' ',
            Self::Untracked => '?',
            Self::Added => 'A',
            Self::Modified => 'M',
            Self::Deleted => 'D',
        }
    }
}

/// Status of one path in the staging area and in the worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStatus {
    /// Index relative to the last commit.
    pub staging: StatusCode,
    /// Worktree relative to the index.
    pub worktree: StatusCode,
}

/// Paths that differ between the worktree, the index and the last commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Changed paths in path order.
    entries: BTreeMap<String, FileStatus>,
}

impl ChangeSet {
    /// Compare `worktree` and `index` against the `head` tree entries.
    pub fn compute(head: &Index, index: &Index, worktree: &InMemoryWorktree) -> Self {
        let files: BTreeMap<String, (ObjectId, EntryMode)> = worktree
            .files()
            .into_iter()
            .map(|(path, file)| {
                let id = ObjectId::for_object(ObjectKind::Blob, &file.data);
                (path, (id, file.mode))
            })
            .collect();

        let mut paths: BTreeSet<&str> = BTreeSet::new();
        paths.extend(head.iter().map(|(p, _)| p));
        paths.extend(index.iter().map(|(p, _)| p));
        paths.extend(files.keys().map(String::as_str));

        let mut entries = BTreeMap::new();
        for path in paths {
            let in_head = head.get(path);
            let in_index = index.get(path);
            // Submodules are never materialized in the worktree.
            if in_index.is_some_and(|e| e.mode == EntryMode::Gitlink) {
                let staging = compare(in_head, in_index);
                if staging != StatusCode::Unmodified {
                    entries.insert(
                        path.to_string(),
                        FileStatus {
                            staging,
                            worktree: StatusCode::Unmodified,
                        },
                    );
                }
                continue;
            }
            let on_disk = files
                .get(path)
                .map(|(id, mode)| IndexEntry { id: *id, mode: *mode });

            let status = if in_index.is_none() && on_disk.is_some() {
                FileStatus {
                    staging: StatusCode::Untracked,
                    worktree: StatusCode::Untracked,
                }
            } else {
                FileStatus {
                    staging: compare(in_head, in_index),
                    worktree: compare(in_index, on_disk.as_ref()),
                }
            };
            if status.staging != StatusCode::Unmodified || status.worktree != StatusCode::Unmodified
            {
                entries.insert(path.to_string(), status);
            }
        }
        Self { entries }
    }

    /// Whether there are no changes at all.
    pub fn is_clean(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of changed paths.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no paths changed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Status for `path`, if it changed.
    pub fn get(&self, path: &str) -> Option<&FileStatus> {
        self.entries.get(path)
    }

    /// Iterate over changed paths in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileStatus)> {
        self.entries.iter().map(|(path, status)| (path.as_str(), status))
    }

    /// Whether any change is staged for the next commit.
    pub fn has_staged_changes(&self) -> bool {
        self.entries.values().any(|s| {
            !matches!(s.staging, StatusCode::Unmodified | StatusCode::Untracked)
        })
    }
}

/// Classify the change from `before` to `after`.
fn compare(before: Option<&IndexEntry>, after: Option<&IndexEntry>) -> StatusCode {
    match (before, after) {
        (None, None) => StatusCode::Unmodified,
        (None, Some(_)) => StatusCode::Added,
        (Some(_), None) => StatusCode::Deleted,
        (Some(a), Some(b)) if a == b => StatusCode::Unmodified,
        (Some(_), Some(_)) => StatusCode::Modified,
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (path, status) in &self.entries {
            writeln!(
                f,
                "{}{} {path}",
                status.staging.code(),
                status.worktree.code()
            )?;
        }
        Ok(())
    }
}
