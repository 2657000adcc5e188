use std::collections::BTreeMap;

use crate::{
    error::{MemgitError, Result},
    object::EntryMode,
};

/// A file held in the in-memory worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeFile {
    /// File contents.
    pub data: Vec<u8>,
    /// Regular, executable or symlink.
    pub mode: EntryMode,
}

/// A node of the virtual filesystem.
#[derive(Debug, Clone)]
enum Node {
    /// A file.
    File(WorktreeFile),
    /// A directory and its children.
    Dir(BTreeMap<String, Node>),
}

/// Virtual filesystem backing a session's checkout.
///
/// Paths are relative and `/`-separated. Nothing is ever written to disk;
/// the tree lives as long as the owning session.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWorktree {
    /// Children of the root directory.
    root: BTreeMap<String, Node>,
}

/// Split `path` into validated segments.
fn segments(path: &str) -> Result<Vec<&str>> {
    if path.is_empty() {
        return Err(MemgitError::worktree(path, "path is empty"));
    }
    if path.starts_with('/') {
        return Err(MemgitError::worktree(path, "path must be relative"));
    }
    let parts: Vec<&str> = path.split('/').collect();
    for part in &parts {
        match *part {
            "" => return Err(MemgitError::worktree(path, "path has an empty segment")),
            "." | ".." => {
                return Err(MemgitError::worktree(
                    path,
                    "path may not contain '.' or '..' segments",
                ));
            }
            ".git" => {
                return Err(MemgitError::worktree(path, "'.git' is a reserved name"));
            }
            _ => {}
        }
    }
    Ok(parts)
}

impl InMemoryWorktree {
    /// Create an empty worktree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk to the directory holding `parents`, creating missing directories.
    fn dir_mut<'a>(
        root: &'a mut BTreeMap<String, Node>,
        path: &str,
        parents: &[&str],
    ) -> Result<&'a mut BTreeMap<String, Node>> {
        let mut dir = root;
        for name in parents {
            let node = dir
                .entry((*name).to_string())
                .or_insert_with(|| Node::Dir(BTreeMap::new()));
            dir = match node {
                Node::Dir(children) => children,
                Node::File(_) => {
                    return Err(MemgitError::worktree(
                        path,
                        format!("'{name}' exists and is not a directory"),
                    ));
                }
            };
        }
        Ok(dir)
    }

    /// Find the node at `path`, if any.
    fn node(&self, path: &str) -> Option<&Node> {
        let parts = segments(path).ok()?;
        let (last, parents) = parts.split_last()?;
        let mut dir = &self.root;
        for name in parents {
            match dir.get(*name)? {
                Node::Dir(children) => dir = children,
                Node::File(_) => return None,
            }
        }
        dir.get(*last)
    }

    /// Write `contents` to `path`, creating ancestor directories as needed.
    ///
    /// An existing file is truncated and keeps its mode.
    pub fn write_file(&mut self, path: &str, contents: impl AsRef<[u8]>) -> Result<()> {
        self.write_with_mode(path, contents.as_ref(), None)
    }

    /// Write `contents` to `path` with an explicit `mode`.
    pub fn write_file_with_mode(
        &mut self,
        path: &str,
        contents: impl AsRef<[u8]>,
        mode: EntryMode,
    ) -> Result<()> {
        if !mode.is_blob() {
            return Err(MemgitError::worktree(
                path,
                format!("mode {} cannot be stored in a worktree", mode.as_octal()),
            ));
        }
        self.write_with_mode(path, contents.as_ref(), Some(mode))
    }

    /// Shared implementation of the write operations.
    fn write_with_mode(&mut self, path: &str, contents: &[u8], mode: Option<EntryMode>) -> Result<()> {
        let parts = segments(path)?;
        let Some((name, parents)) = parts.split_last() else {
            return Err(MemgitError::worktree(path, "path is empty"));
        };
        let dir = Self::dir_mut(&mut self.root, path, parents)?;
        match dir.get_mut(*name) {
            Some(Node::Dir(_)) => Err(MemgitError::worktree(path, "path is a directory")),
            Some(Node::File(file)) => {
                file.data = contents.to_vec();
                if let Some(mode) = mode {
                    file.mode = mode;
                }
                Ok(())
            }
            None => {
                dir.insert(
                    (*name).to_string(),
                    Node::File(WorktreeFile {
                        data: contents.to_vec(),
                        mode: mode.unwrap_or(EntryMode::File),
                    }),
                );
                Ok(())
            }
        }
    }

    /// Create `path` and all missing ancestors as directories.
    pub fn create_dir_all(&mut self, path: &str) -> Result<()> {
        let parts = segments(path)?;
        Self::dir_mut(&mut self.root, path, &parts)?;
        Ok(())
    }

    /// Remove the file at `path`.
    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        let parts = segments(path)?;
        let Some((name, parents)) = parts.split_last() else {
            return Err(MemgitError::worktree(path, "path is empty"));
        };
        let mut dir = &mut self.root;
        for parent in parents {
            dir = match dir.get_mut(*parent) {
                Some(Node::Dir(children)) => children,
                _ => return Err(MemgitError::worktree(path, "no such file")),
            };
        }
        match dir.get(*name).map(|node| matches!(node, Node::File(_))) {
            Some(true) => {
                dir.remove(*name);
                Ok(())
            }
            Some(false) => Err(MemgitError::worktree(path, "path is a directory")),
            None => Err(MemgitError::worktree(path, "no such file")),
        }
    }

    /// Contents of the file at `path`.
    pub fn read_file(&self, path: &str) -> Option<&[u8]> {
        match self.node(path)? {
            Node::File(file) => Some(&file.data),
            Node::Dir(_) => None,
        }
    }

    /// Whether anything exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        self.node(path).is_some()
    }

    /// Whether `path` is a directory.
    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.node(path), Some(Node::Dir(_)))
    }

    /// All files in path order.
    pub fn files(&self) -> Vec<(String, &WorktreeFile)> {
        let mut out = Vec::new();
        collect_files(&self.root, "", &mut out);
        out
    }
}

/// Flatten `dir` into `out`, prefixing paths with `prefix`.
fn collect_files<'a>(
    dir: &'a BTreeMap<String, Node>,
    prefix: &str,
    out: &mut Vec<(String, &'a WorktreeFile)>,
) {
    for (name, node) in dir {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        match node {
            Node::File(file) => out.push((path, file)),
            Node::Dir(children) => collect_files(children, &path, out),
        }
    }
}
