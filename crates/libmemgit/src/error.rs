use std::result::Result as StdResult;

use thiserror::Error;

use crate::{remote::RemoteError, session::SessionState};

/// Custom Result type for memgit operations.
pub type Result<T> = StdResult<T, MemgitError>;

/// memgit-specific error types
#[derive(Error, Debug)]
pub enum MemgitError {
    /// Missing or invalid configuration (remote URL, credential variable, config file).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The credential could not be turned into a signing identity.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Cloning the remote failed.
    #[error("Clone of {location} failed")]
    Clone {
        /// Remote location being cloned.
        location: String,
        /// Transport-level cause.
        #[source]
        source: RemoteError,
    },

    /// A worktree operation failed.
    #[error("Worktree error at '{path}': {message}")]
    Worktree {
        /// Path the operation targeted.
        path: String,
        /// Human-readable error description.
        message: String,
    },

    /// Staging changes into the index failed.
    #[error("Stage error: {0}")]
    Stage(String),

    /// The staged tree is identical to the last commit.
    #[error("Commit error: nothing to commit, working tree clean")]
    NothingToCommit,

    /// Creating the commit failed.
    #[error("Commit error: {0}")]
    Commit(String),

    /// Pushing to the remote failed.
    #[error("Push to {location} failed")]
    Push {
        /// Remote location being pushed to.
        location: String,
        /// Transport-level cause.
        #[source]
        source: RemoteError,
    },

    /// A session method was called in a state that does not permit it.
    #[error("Cannot {operation} while the session is {state}")]
    State {
        /// Name of the rejected operation.
        operation: &'static str,
        /// State the session was in.
        state: SessionState,
    },

    /// Reporting progress through the output backend failed.
    #[error("Output error: {0}")]
    Output(String),
}

impl MemgitError {
    /// Return the recommended process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Auth(_) => 3,
            Self::Clone { .. } => 4,
            Self::Worktree { .. } => 5,
            Self::Stage(_) => 6,
            Self::NothingToCommit | Self::Commit(_) => 7,
            Self::Push { .. } => 8,
            Self::State { .. } => 9,
            Self::Output(_) => 1,
        }
    }

    /// Whether this is a push rejected because the remote branch diverged.
    pub fn is_non_fast_forward(&self) -> bool {
        matches!(
            self,
            Self::Push {
                source: RemoteError::NonFastForward { .. },
                ..
            }
        )
    }

    /// Build a worktree error for `path`.
    pub(crate) fn worktree(path: &str, message: impl Into<String>) -> Self {
        Self::Worktree {
            path: path.to_string(),
            message: message.into(),
        }
    }
}
