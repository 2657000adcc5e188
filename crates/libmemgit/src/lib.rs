#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]
//! Core library for memgit: clone a git remote into memory, add files, commit
//! and push, without touching local disk.
//!
//! A [`Session`] owns the cloned objects, the staging index and an
//! [`InMemoryWorktree`]. Remotes are reached through the [`Remote`] trait,
//! implemented over SSH ([`SshRemote`]), local `git` subprocesses
//! ([`LocalRemote`]) and an in-process repository for tests
//! ([`MemoryRemote`]). [`workflow::run`](run) drives the whole cycle and
//! reports progress through an [`Output`]. The CLI binary in `crates/memgit`
//! builds on top of this library.

/// Turning private-key bytes into signing identities.
mod auth;
/// Domain error type and exit codes.
mod error;
/// Staging index.
mod index;
/// Git object model: ids, trees, commits and signatures.
mod object;
/// In-memory object database.
mod odb;
/// Output channel abstractions and implementations.
mod output;
/// Packfile codec.
mod pack;
/// pkt-line framing.
mod pktline;
/// Smart-protocol fetch and push over an abstract byte exchange.
mod protocol;
/// Remote locations and transports.
mod remote;
/// Clone, stage, commit and push state machine.
mod session;
/// Porcelain-style change sets.
mod status;
/// The fixed clone-write-commit-push run.
mod workflow;
/// Virtual filesystem for checkouts.
mod worktree;

/// Re-exports of credential handling.
pub use auth::{HostKeyPolicy, Identity, PRINCIPAL, authenticate};
/// Re-export of the main error type.
pub use error::{MemgitError, Result};
/// Re-export of the staging index.
pub use index::{Index, IndexEntry};
/// Re-exports of the object model.
pub use object::{Commit, EntryMode, Object, ObjectId, ObjectKind, Signature, TreeEntry};
/// Re-export of the object database.
pub use odb::ObjectStore;
/// Re-exports for output abstraction and concrete implementations.
pub use output::{Output, OutputError, Quiet, Spinner, Terminal};
/// Re-exports of the pack codec.
pub use pack::{parse_pack, write_pack};
/// Re-exports of remotes and their errors.
pub use remote::{
    Endpoint, Fetched, RefUpdate, Remote, RemoteError, RemoteLocation, SshEndpoint,
    local::LocalRemote, memory::MemoryRemote, open_remote, ssh::SshRemote,
};
/// Re-exports of the session state machine.
pub use session::{Session, SessionState};
/// Re-exports of change sets.
pub use status::{ChangeSet, FileStatus, StatusCode};
/// Re-exports of the workflow orchestrator.
pub use workflow::{RunId, WorkflowReport, WorkflowSettings, run, run_files};
/// Re-exports of the in-memory worktree.
pub use worktree::{InMemoryWorktree, WorktreeFile};
