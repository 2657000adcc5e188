use std::{fmt, path::PathBuf, result::Result as StdResult};

use thiserror::Error;

use crate::{
    auth::{HostKeyPolicy, Identity},
    error::{MemgitError, Result},
    object::{Object, ObjectId},
};

/// Remote driven by `git upload-pack` / `git receive-pack` subprocesses.
pub mod local;
/// In-process remote for tests and simulations.
pub mod memory;
/// Remote reached over SSH.
pub mod ssh;

/// Default SSH port.
const SSH_PORT: u16 = 22;

/// Transport-level failures, classified so callers can react to them.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The server refused the identity.
    #[error("authentication rejected for user '{user}'")]
    AuthRejected {
        /// User name that was presented.
        user: String,
    },

    /// The server's host key could not be verified.
    #[error("host key verification failed for '{host}'")]
    HostKey {
        /// Host being contacted.
        host: String,
    },

    /// The remote has no branches to clone.
    #[error("remote repository is empty")]
    EmptyRepository,

    /// The remote branch moved since it was fetched.
    #[error(
        "non-fast-forward update of {refname}: expected {expected}, remote has {}",
        describe_tip(.found)
    )]
    NonFastForward {
        /// Ref being updated.
        refname: String,
        /// Tip the update was based on.
        expected: ObjectId,
        /// Tip the remote reported, if known.
        found: Option<ObjectId>,
    },

    /// The server refused the update for another reason.
    #[error("remote rejected {refname}: {reason}")]
    Rejected {
        /// Ref being updated.
        refname: String,
        /// Reason given by the server.
        reason: String,
    },

    /// The server sent something we could not understand.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Connecting or talking to the server failed.
    #[error("transport error: {0}")]
    Transport(String),
}

impl RemoteError {
    /// Protocol error carrying the full context chain of `err`.
    pub(crate) fn protocol(err: &anyhow::Error) -> Self {
        Self::Protocol(format!("{err:#}"))
    }

    /// Transport error carrying the full context chain of `err`.
    pub(crate) fn transport(err: &anyhow::Error) -> Self {
        Self::Transport(format!("{err:#}"))
    }
}

/// Result alias for remote operations.
pub type RemoteResult<T> = StdResult<T, RemoteError>;

/// Render an optional remote tip for messages.
fn describe_tip(tip: &Option<ObjectId>) -> String {
    tip.map_or_else(|| "nothing".to_string(), |id| id.to_string())
}

/// Network endpoint of an SSH remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    /// User named in the URL, if any.
    pub user: Option<String>,
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Repository path passed to the remote git command.
    pub path: String,
}

/// How a remote is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Over SSH.
    Ssh(SshEndpoint),
    /// A repository on the local filesystem.
    Local(PathBuf),
    /// An in-process repository.
    Memory(String),
}

/// Parsed, immutable description of where the remote lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLocation {
    /// The string the location was parsed from.
    raw: String,
    /// Parsed endpoint.
    endpoint: Endpoint,
}

impl RemoteLocation {
    /// Parse a remote URL.
    ///
    /// Accepts `ssh://[user@]host[:port]/path`, `git+ssh://...`, scp-like
    /// `[user@]host:path`, `file:///path` and plain local paths.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(MemgitError::Config("remote URL is empty".to_string()));
        }
        let endpoint = if let Some((scheme, rest)) = raw.split_once("://") {
            match scheme {
                "ssh" | "git+ssh" | "ssh+git" => Endpoint::Ssh(parse_ssh_url(raw, rest)?),
                "file" => Endpoint::Local(non_empty_path(raw, rest)?),
                other => {
                    return Err(MemgitError::Config(format!(
                        "unsupported URL scheme '{other}' in '{raw}'"
                    )));
                }
            }
        } else if let Some(endpoint) = parse_scp_like(raw)? {
            Endpoint::Ssh(endpoint)
        } else {
            Endpoint::Local(PathBuf::from(raw))
        };
        Ok(Self {
            raw: raw.to_string(),
            endpoint,
        })
    }

    /// Location of an in-process remote named `name`.
    pub fn in_memory(name: &str) -> Self {
        Self {
            raw: format!("memory://{name}"),
            endpoint: Endpoint::Memory(name.to_string()),
        }
    }

    /// The parsed endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The original URL string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for RemoteLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Config error for a malformed URL.
fn invalid(raw: &str, why: &str) -> MemgitError {
    MemgitError::Config(format!("invalid remote URL '{raw}': {why}"))
}

/// Reject empty paths.
fn non_empty_path(raw: &str, path: &str) -> Result<PathBuf> {
    if path.is_empty() {
        return Err(invalid(raw, "missing repository path"));
    }
    Ok(PathBuf::from(path))
}

/// Split `[user@]rest`.
fn split_user(authority: &str) -> (Option<String>, &str) {
    match authority.rsplit_once('@') {
        Some((user, rest)) => (Some(user.to_string()), rest),
        None => (None, authority),
    }
}

/// Parse the part of an `ssh://` URL after the scheme.
fn parse_ssh_url(raw: &str, rest: &str) -> Result<SshEndpoint> {
    let (authority, path) = match rest.find('/') {
        Some(slash) => rest.split_at(slash),
        None => return Err(invalid(raw, "missing repository path")),
    };
    if path.len() <= 1 {
        return Err(invalid(raw, "missing repository path"));
    }
    let (user, host_port) = split_user(authority);
    let (host, port) = if let Some(bracketed) = host_port.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| invalid(raw, "unterminated IPv6 address"))?;
        let port = match after.strip_prefix(':') {
            Some(port) => Some(port),
            None if after.is_empty() => None,
            None => return Err(invalid(raw, "unexpected text after host")),
        };
        (host, port)
    } else {
        match host_port.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (host_port, None),
        }
    };
    if host.is_empty() {
        return Err(invalid(raw, "missing host"));
    }
    let port = match port {
        Some(port) => port
            .parse()
            .map_err(|_| invalid(raw, &format!("invalid port '{port}'")))?,
        None => SSH_PORT,
    };
    Ok(SshEndpoint {
        user,
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

/// Parse `[user@]host:path`, returning `None` for things that look like local paths.
fn parse_scp_like(raw: &str) -> Result<Option<SshEndpoint>> {
    let Some(colon) = raw.find(':') else {
        return Ok(None);
    };
    // A slash before the colon means a local path such as `./a:b`.
    if raw[..colon].contains('/') {
        return Ok(None);
    }
    let (authority, path) = (&raw[..colon], &raw[colon + 1..]);
    let (user, host) = split_user(authority);
    if host.is_empty() {
        return Err(invalid(raw, "missing host"));
    }
    if path.is_empty() {
        return Err(invalid(raw, "missing repository path"));
    }
    Ok(Some(SshEndpoint {
        user,
        host: host.to_string(),
        port: SSH_PORT,
        path: path.to_string(),
    }))
}

/// Result of fetching the remote's default branch.
#[derive(Debug, Clone)]
pub struct Fetched {
    /// Full ref name of the branch, e.g. `refs/heads/main`.
    pub branch: String,
    /// Commit the branch points at.
    pub tip: ObjectId,
    /// Every object reachable from `tip`.
    pub objects: Vec<Object>,
}

/// A requested ref update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    /// Full ref name.
    pub refname: String,
    /// Value the ref is expected to have on the remote.
    pub old: ObjectId,
    /// Value to set.
    pub new: ObjectId,
}

impl RefUpdate {
    /// Check the remote's current value of the ref against the expected one.
    pub fn check_fast_forward(&self, current: Option<ObjectId>) -> RemoteResult<()> {
        let expected = (!self.old.is_zero()).then_some(self.old);
        if current == expected {
            Ok(())
        } else {
            Err(RemoteError::NonFastForward {
                refname: self.refname.clone(),
                expected: self.old,
                found: current,
            })
        }
    }
}

/// A remote repository that can be fetched from and pushed to.
pub trait Remote {
    /// Where the remote lives.
    fn location(&self) -> &RemoteLocation;

    /// Fetch the default branch and everything reachable from it.
    fn fetch(&mut self, identity: &Identity) -> RemoteResult<Fetched>;

    /// Send `objects` and apply `update`. The update is only applied if the
    /// remote ref still equals `update.old`.
    fn push(&mut self, identity: &Identity, update: &RefUpdate, objects: &[Object])
    -> RemoteResult<()>;
}

impl<R: Remote + ?Sized> Remote for Box<R> {
    fn location(&self) -> &RemoteLocation {
        (**self).location()
    }

    fn fetch(&mut self, identity: &Identity) -> RemoteResult<Fetched> {
        (**self).fetch(identity)
    }

    fn push(
        &mut self,
        identity: &Identity,
        update: &RefUpdate,
        objects: &[Object],
    ) -> RemoteResult<()> {
        (**self).push(identity, update, objects)
    }
}

/// Open the network or filesystem remote at `location`.
pub fn open_remote(location: RemoteLocation, host_keys: HostKeyPolicy) -> Result<Box<dyn Remote>> {
    match location.endpoint() {
        Endpoint::Ssh(_) => Ok(Box::new(ssh::SshRemote::new(location, host_keys)?)),
        Endpoint::Local(_) => Ok(Box::new(local::LocalRemote::new(location))),
        Endpoint::Memory(_) => Err(MemgitError::Config(format!(
            "in-memory remote '{location}' cannot be opened by URL"
        ))),
    }
}
