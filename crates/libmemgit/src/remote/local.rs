use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread::{self, JoinHandle},
};

use anyhow::{Context, Result, anyhow, bail};

use crate::{
    auth::Identity,
    object::Object,
    pktline::section_end,
    protocol::{self, Exchange, Service},
    remote::{Endpoint, Fetched, RefUpdate, Remote, RemoteError, RemoteLocation, RemoteResult},
};

/// Read size when draining subprocess output.
const CHUNK: usize = 8192;

/// A repository on the local filesystem, reached by running the system `git`.
///
/// Identities are not used: access is governed by filesystem permissions.
pub struct LocalRemote {
    /// Where the repository lives.
    location: RemoteLocation,
    /// Repository path.
    path: PathBuf,
}

impl LocalRemote {
    /// Remote for `location`, which must be a local endpoint.
    pub fn new(location: RemoteLocation) -> Self {
        let path = match location.endpoint() {
            Endpoint::Local(path) => path.clone(),
            _ => PathBuf::from(location.as_str()),
        };
        Self { location, path }
    }

    /// Spawn `service` against the repository.
    fn connect(&self, service: Service) -> RemoteResult<ProcessExchange> {
        ProcessExchange::spawn(service, &self.path).map_err(|e| RemoteError::transport(&e))
    }
}

impl Remote for LocalRemote {
    fn location(&self) -> &RemoteLocation {
        &self.location
    }

    fn fetch(&mut self, _identity: &Identity) -> RemoteResult<Fetched> {
        let mut exchange = self.connect(Service::UploadPack)?;
        protocol::fetch(&mut exchange)
    }

    fn push(
        &mut self,
        _identity: &Identity,
        update: &RefUpdate,
        objects: &[Object],
    ) -> RemoteResult<()> {
        let mut exchange = self.connect(Service::ReceivePack)?;
        protocol::push(&mut exchange, update, objects)
    }
}

/// An [`Exchange`] over the stdin/stdout of a `git` subprocess.
struct ProcessExchange {
    /// Running `git upload-pack` or `git receive-pack`.
    child: Child,
    /// Command line, for error messages.
    command: String,
    /// Thread collecting the child's stderr, so a chatty child never blocks.
    stderr: Option<JoinHandle<String>>,
}

impl ProcessExchange {
    /// Start `git <service> <path>`.
    fn spawn(service: Service, path: &Path) -> Result<Self> {
        let subcommand = service
            .command()
            .strip_prefix("git-")
            .unwrap_or(service.command());
        let mut command = Command::new("git");
        command.arg(subcommand).arg(path);
        Self::start(command, format!("git {subcommand} {}", path.display()))
    }

    /// Run `command` with piped stdio, labelled `label` in errors.
    fn start(mut command: Command, label: String) -> Result<Self> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to run '{label}'"))?;
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut text = String::new();
                pipe.read_to_string(&mut text).ok();
                text
            })
        });
        Ok(Self {
            child,
            command: label,
            stderr,
        })
    }

    /// Wait for the process and turn a failure exit into an error with its stderr.
    fn reap(&mut self) -> Result<()> {
        let status = self
            .child
            .wait()
            .with_context(|| format!("failed to wait for '{}'", self.command))?;
        let stderr = self
            .stderr
            .take()
            .map(|reader| reader.join().unwrap_or_default())
            .unwrap_or_default();
        if !status.success() {
            bail!("'{}' failed ({status}): {}", self.command, stderr.trim());
        }
        Ok(())
    }
}

impl Exchange for ProcessExchange {
    fn advertisement(&mut self) -> Result<Vec<u8>> {
        let stdout = self
            .child
            .stdout
            .as_mut()
            .ok_or_else(|| anyhow!("stdout of '{}' is closed", self.command))?;
        let mut buf = Vec::new();
        let mut chunk = [0u8; CHUNK];
        loop {
            if let Some(end) = section_end(&buf)? {
                buf.truncate(end);
                return Ok(buf);
            }
            let n = stdout.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        self.reap()?;
        bail!("'{}' closed before advertising refs", self.command)
    }

    fn finish(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        {
            let mut stdin = self
                .child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin of '{}' is closed", self.command))?;
            stdin
                .write_all(request)
                .with_context(|| format!("failed to send request to '{}'", self.command))?;
        }
        let mut response = Vec::new();
        if let Some(mut stdout) = self.child.stdout.take() {
            stdout.read_to_end(&mut response)?;
        }
        let reaped = self.reap();
        // A non-zero exit with a response still carries a report worth parsing.
        if response.is_empty() {
            reaped?;
        }
        Ok(response)
    }
}

impl Drop for ProcessExchange {
    fn drop(&mut self) {
        // Abandoned exchanges must not leave the server blocked on stdin.
        drop(self.child.stdin.take());
        if self.child.try_wait().ok().flatten().is_none() {
            self.child.kill().ok();
            self.child.wait().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, process::Command};

    use tempfile::TempDir;

    use super::*;
    use crate::auth::{authenticate, tests::TEST_KEY};

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(output.status.success(), "git {args:?} failed");
        String::from_utf8(output.stdout).unwrap()
    }

    #[test]
    fn empty_bare_repository_is_reported() {
        let bare = TempDir::new().unwrap();
        git(bare.path(), &["init", "-q", "--bare"]);
        let location = RemoteLocation::parse(bare.path().to_str().unwrap()).unwrap();
        let mut remote = LocalRemote::new(location);
        let identity = authenticate(TEST_KEY.as_bytes()).unwrap();
        assert!(matches!(
            remote.fetch(&identity),
            Err(RemoteError::EmptyRepository)
        ));
    }

    fn shell(script: &str) -> ProcessExchange {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        ProcessExchange::start(command, format!("sh -c {script}")).unwrap()
    }

    #[test]
    fn large_stderr_does_not_stall_the_exchange() {
        let mut exchange = shell("head -c 300000 /dev/zero | tr '\\0' x >&2; printf 0000; cat >/dev/null");
        assert!(exchange.advertisement().unwrap().ends_with(b"0000"));
        assert!(exchange.finish(b"0000").unwrap().is_empty());

        let mut exchange = shell("head -c 300000 /dev/zero | tr '\\0' x >&2; exit 3");
        let err = exchange.advertisement().unwrap_err();
        assert!(format!("{err:#}").contains("xxxx"), "{err:#}");
    }

    #[test]
    fn missing_repository_is_a_transport_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.git");
        let location = RemoteLocation::parse(missing.to_str().unwrap()).unwrap();
        let mut remote = LocalRemote::new(location);
        let identity = authenticate(TEST_KEY.as_bytes()).unwrap();
        assert!(matches!(
            remote.fetch(&identity),
            Err(RemoteError::Transport(_))
        ));
    }

    #[test]
    fn fetches_default_branch() {
        let work = TempDir::new().unwrap();
        let path = work.path();
        git(path, &["init", "-q", "-b", "trunk"]);
        git(path, &["config", "user.name", "Tester"]);
        git(path, &["config", "user.email", "tester@example.com"]);
        fs::write(path.join("README.md"), "hi\n").unwrap();
        git(path, &["add", "."]);
        git(path, &["commit", "-q", "-m", "init"]);
        let head = git(path, &["rev-parse", "HEAD"]);

        let location = RemoteLocation::parse(path.to_str().unwrap()).unwrap();
        let mut remote = LocalRemote::new(location);
        let identity = authenticate(TEST_KEY.as_bytes()).unwrap();
        let fetched = remote.fetch(&identity).unwrap();
        assert_eq!(fetched.branch, "refs/heads/trunk");
        assert_eq!(fetched.tip.to_string(), head.trim());
        assert_eq!(fetched.objects.len(), 3);
    }
}
