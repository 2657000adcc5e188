use std::{result::Result as StdResult, sync::Arc};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use russh::{
    Channel, ChannelMsg, Disconnect,
    client::{self, Handle, Msg},
};
use russh_keys::key::PublicKey;
use tokio::runtime::{Builder, Runtime};

use crate::{
    auth::{HostKeyPolicy, Identity, PRINCIPAL},
    error::{MemgitError, Result as MemgitResult},
    object::Object,
    pktline::section_end,
    protocol::{self, Exchange, Service},
    remote::{
        Endpoint, Fetched, RefUpdate, Remote, RemoteError, RemoteLocation, RemoteResult,
        SshEndpoint,
    },
};

/// SSH extended-data stream number for stderr.
const STDERR: u32 = 1;

/// A repository reached over SSH, speaking git's smart protocol.
///
/// Each fetch or push opens its own connection on a private current-thread
/// runtime, so callers see a blocking API.
pub struct SshRemote {
    /// Where the repository lives.
    location: RemoteLocation,
    /// Host, port and path.
    endpoint: SshEndpoint,
    /// How the server's host key is checked.
    host_keys: HostKeyPolicy,
}

impl SshRemote {
    /// Remote for an `ssh://` or scp-like `location`.
    pub fn new(location: RemoteLocation, host_keys: HostKeyPolicy) -> MemgitResult<Self> {
        let Endpoint::Ssh(endpoint) = location.endpoint() else {
            return Err(MemgitError::Config(format!(
                "'{location}' is not an SSH location"
            )));
        };
        if let Some(user) = &endpoint.user
            && user != PRINCIPAL
        {
            return Err(MemgitError::Config(format!(
                "remote user must be '{PRINCIPAL}', got '{user}'"
            )));
        }
        let endpoint = endpoint.clone();
        Ok(Self {
            location,
            endpoint,
            host_keys,
        })
    }

    /// Connect, authenticate and start `service`.
    fn connect(&self, identity: &Identity, service: Service) -> RemoteResult<SshExchange> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| RemoteError::Transport(format!("failed to start runtime: {e}")))?;
        let (session, channel) = runtime.block_on(open_channel(
            &self.endpoint,
            &self.host_keys,
            identity,
            service,
        ))?;
        Ok(SshExchange {
            runtime,
            session,
            channel,
            stderr: Vec::new(),
        })
    }
}

impl Remote for SshRemote {
    fn location(&self) -> &RemoteLocation {
        &self.location
    }

    fn fetch(&mut self, identity: &Identity) -> RemoteResult<Fetched> {
        let mut exchange = self.connect(identity, Service::UploadPack)?;
        protocol::fetch(&mut exchange)
    }

    fn push(
        &mut self,
        identity: &Identity,
        update: &RefUpdate,
        objects: &[Object],
    ) -> RemoteResult<()> {
        let mut exchange = self.connect(identity, Service::ReceivePack)?;
        protocol::push(&mut exchange, update, objects)
    }
}

/// Quote `arg` for a POSIX shell, as git does for remote paths.
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Client handler that applies the host key policy.
struct HostKeyCheck {
    /// Host being contacted.
    host: String,
    /// Port being contacted.
    port: u16,
    /// Policy to apply.
    policy: HostKeyPolicy,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> StdResult<bool, Self::Error> {
        let known = match &self.policy {
            HostKeyPolicy::AcceptAny => return Ok(true),
            HostKeyPolicy::Verify { known_hosts: None } => {
                russh_keys::check_known_hosts(&self.host, self.port, server_public_key)
            }
            HostKeyPolicy::Verify {
                known_hosts: Some(path),
            } => russh_keys::check_known_hosts_path(&self.host, self.port, server_public_key, path),
        };
        // A changed key and a missing entry are both rejections.
        Ok(known.unwrap_or(false))
    }
}

/// Open an authenticated session and exec `service` on the repository path.
async fn open_channel(
    endpoint: &SshEndpoint,
    host_keys: &HostKeyPolicy,
    identity: &Identity,
    service: Service,
) -> RemoteResult<(Handle<HostKeyCheck>, Channel<Msg>)> {
    let handler = HostKeyCheck {
        host: endpoint.host.clone(),
        port: endpoint.port,
        policy: host_keys.clone(),
    };
    let config = Arc::new(client::Config::default());
    let mut session = client::connect(config, (endpoint.host.as_str(), endpoint.port), handler)
        .await
        .map_err(|e| match e {
            russh::Error::UnknownKey => RemoteError::HostKey {
                host: endpoint.host.clone(),
            },
            other => RemoteError::Transport(format!(
                "failed to connect to {}:{}: {other}",
                endpoint.host, endpoint.port
            )),
        })?;

    let accepted = session
        .authenticate_publickey(identity.principal(), identity.key_pair())
        .await
        .map_err(|e| RemoteError::Transport(format!("authentication failed: {e}")))?;
    if !accepted {
        return Err(RemoteError::AuthRejected {
            user: identity.principal().to_string(),
        });
    }

    let channel = session
        .channel_open_session()
        .await
        .map_err(|e| RemoteError::Transport(format!("failed to open channel: {e}")))?;
    let command = format!("{} {}", service.command(), shell_quote(&endpoint.path));
    channel
        .exec(true, command)
        .await
        .map_err(|e| RemoteError::Transport(format!("failed to start remote command: {e}")))?;
    Ok((session, channel))
}

/// An [`Exchange`] over an SSH exec channel.
struct SshExchange {
    /// Runtime driving the connection.
    runtime: Runtime,
    /// Session handle; dropping it closes the connection.
    session: Handle<HostKeyCheck>,
    /// Channel running the git service.
    channel: Channel<Msg>,
    /// Remote stderr collected so far, for error messages.
    stderr: Vec<u8>,
}

impl SshExchange {
    /// Error for a command that ended early, including its stderr.
    fn closed(&self, what: &str, status: Option<u32>) -> anyhow::Error {
        let stderr = String::from_utf8_lossy(&self.stderr);
        let status = status.map_or_else(String::new, |code| format!(" (exit status {code})"));
        anyhow!("remote command closed {what}{status}: {}", stderr.trim())
    }
}

impl Exchange for SshExchange {
    fn advertisement(&mut self) -> Result<Vec<u8>> {
        let Self {
            runtime,
            channel,
            stderr,
            ..
        } = self;
        let mut buf = Vec::new();
        let status = runtime.block_on(async {
            let mut status = None;
            loop {
                if section_end(&buf)?.is_some() {
                    return Ok::<_, anyhow::Error>(None);
                }
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => buf.extend_from_slice(&data),
                    Some(ChannelMsg::ExtendedData { data, ext }) if ext == STDERR => {
                        stderr.extend_from_slice(&data);
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => status = Some(exit_status),
                    Some(ChannelMsg::Eof | ChannelMsg::Close) | None => return Ok(Some(status)),
                    Some(_) => {}
                }
            }
        })?;
        if let Some(status) = status {
            return Err(self.closed("before advertising refs", status));
        }
        Ok(buf)
    }

    fn finish(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let Self {
            runtime,
            session,
            channel,
            stderr,
        } = self;
        let (response, status) = runtime.block_on(async {
            channel
                .data(request)
                .await
                .context("failed to send request")?;
            channel.eof().await.context("failed to close request stream")?;
            let mut response = Vec::new();
            let mut status = None;
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => response.extend_from_slice(&data),
                    Some(ChannelMsg::ExtendedData { data, ext }) if ext == STDERR => {
                        stderr.extend_from_slice(&data);
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => status = Some(exit_status),
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
            session
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
                .ok();
            Ok::<_, anyhow::Error>((response, status))
        })?;
        // A non-zero exit with a response still carries a report worth parsing.
        match status {
            Some(code) if code != 0 && response.is_empty() => {
                Err(self.closed("with an error", Some(code)))
            }
            _ => Ok(response),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        net::TcpListener,
        path::Path,
        process::{Command, Stdio},
        thread,
        time::Duration,
    };

    use russh::{
        ChannelId, CryptoVec, MethodSet,
        server::{self, Auth, Session},
    };
    use russh_keys::{PublicKeyBase64, key::KeyPair};
    use tempfile::TempDir;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net,
        process::{ChildStdin, Command as AsyncCommand},
    };

    use super::*;
    use crate::{
        auth::{
            authenticate,
            tests::{TEST_KEY, TEST_PUBLIC_KEY},
        },
        output::Quiet,
        workflow::{RunId, WorkflowSettings, run},
    };

    /// Server side of one connection: accepts a single public key and runs
    /// the requested git service against a local repository.
    struct GitServer {
        /// Public key allowed in, as `algorithm base64`.
        authorized: String,
        /// Stdin of the running git service.
        stdin: Option<ChildStdin>,
    }

    #[async_trait]
    impl server::Handler for GitServer {
        type Error = anyhow::Error;

        async fn auth_publickey(
            &mut self,
            user: &str,
            key: &PublicKey,
        ) -> StdResult<Auth, Self::Error> {
            let offered = format!("{} {}", key.name(), key.public_key_base64());
            if user == PRINCIPAL && offered == self.authorized {
                Ok(Auth::Accept)
            } else {
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }

        async fn channel_open_session(
            &mut self,
            _channel: Channel<server::Msg>,
            _session: &mut Session,
        ) -> StdResult<bool, Self::Error> {
            Ok(true)
        }

        async fn exec_request(
            &mut self,
            channel: ChannelId,
            data: &[u8],
            session: &mut Session,
        ) -> StdResult<(), Self::Error> {
            let command = String::from_utf8_lossy(data).into_owned();
            let (service, path) = command.split_once(' ').context("malformed exec request")?;
            let mut child = AsyncCommand::new("git")
                .arg(service.trim_start_matches("git-"))
                .arg(path.trim_matches('\''))
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()?;
            self.stdin = child.stdin.take();
            let mut stdout = child.stdout.take().context("git service has no stdout")?;
            let handle = session.handle();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    let n = match stdout.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if handle
                        .data(channel, CryptoVec::from_slice(&buf[..n]))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                let code = child
                    .wait()
                    .await
                    .ok()
                    .and_then(|status| status.code())
                    .and_then(|code| u32::try_from(code).ok())
                    .unwrap_or(1);
                handle.exit_status_request(channel, code).await.ok();
                handle.eof(channel).await.ok();
                handle.close(channel).await.ok();
            });
            Ok(())
        }

        async fn data(
            &mut self,
            _channel: ChannelId,
            data: &[u8],
            _session: &mut Session,
        ) -> StdResult<(), Self::Error> {
            if let Some(stdin) = &mut self.stdin {
                stdin.write_all(data).await?;
            }
            Ok(())
        }

        async fn channel_eof(
            &mut self,
            _channel: ChannelId,
            _session: &mut Session,
        ) -> StdResult<(), Self::Error> {
            // Closing stdin tells the git service the request is complete.
            self.stdin.take();
            Ok(())
        }
    }

    /// Start a server on a free local port that lets `authorized` in.
    ///
    /// Returns the port and the server's host key.
    fn serve(authorized: &str) -> (u16, PublicKey) {
        let host_key = KeyPair::generate_ed25519();
        let host_public = host_key.clone_public_key().unwrap();
        let config = Arc::new(server::Config {
            keys: vec![host_key],
            methods: MethodSet::PUBLICKEY,
            auth_rejection_time: Duration::ZERO,
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        listener.set_nonblocking(true).unwrap();
        let authorized = authorized.to_string();
        thread::spawn(move || {
            let runtime = Builder::new_current_thread().enable_all().build().unwrap();
            runtime.block_on(async move {
                let listener = net::TcpListener::from_std(listener).unwrap();
                while let Ok((stream, _)) = listener.accept().await {
                    let handler = GitServer {
                        authorized: authorized.clone(),
                        stdin: None,
                    };
                    if let Ok(session) =
                        server::run_stream(Arc::clone(&config), stream, handler).await
                    {
                        tokio::spawn(session);
                    }
                }
            });
        });
        (port, host_public)
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8(output.stdout).unwrap().trim().to_string()
    }

    /// Bare repository on `main` holding one commit, next to its scratch clone.
    fn bare_repository() -> (TempDir, String) {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("work");
        fs::create_dir(&work).unwrap();
        git(dir.path(), &["init", "-q", "--bare", "-b", "main", "repo.git"]);
        git(&work, &["init", "-q", "-b", "main"]);
        fs::write(work.join("README.md"), "# Test Project\n").unwrap();
        git(&work, &["add", "."]);
        git(
            &work,
            &[
                "-c",
                "user.name=Tester",
                "-c",
                "user.email=tester@example.com",
                "commit",
                "-q",
                "-m",
                "Initial commit",
            ],
        );
        git(&work, &["push", "-q", "../repo.git", "main"]);
        let path = dir.path().join("repo.git").to_str().unwrap().to_string();
        (dir, path)
    }

    fn ssh_remote(port: u16, path: &str, policy: HostKeyPolicy) -> SshRemote {
        let url = format!("ssh://git@127.0.0.1:{port}{path}");
        SshRemote::new(RemoteLocation::parse(&url).unwrap(), policy).unwrap()
    }

    #[test]
    fn quotes_paths_for_the_remote_shell() {
        assert_eq!(shell_quote("/srv/repo.git"), "'/srv/repo.git'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn only_git_user_is_accepted() {
        let location = RemoteLocation::parse("ssh://deploy@example.com/repo.git").unwrap();
        let err = SshRemote::new(location, HostKeyPolicy::AcceptAny).err();
        assert!(matches!(err, Some(MemgitError::Config(_))));

        let location = RemoteLocation::parse("git@example.com:repo.git").unwrap();
        assert!(SshRemote::new(location, HostKeyPolicy::AcceptAny).is_ok());

        let location = RemoteLocation::parse("/srv/repo.git").unwrap();
        assert!(SshRemote::new(location, HostKeyPolicy::AcceptAny).is_err());
    }

    #[test]
    fn refused_connection_is_a_transport_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut remote = ssh_remote(port, "/repo.git", HostKeyPolicy::AcceptAny);
        let identity = authenticate(TEST_KEY.as_bytes()).unwrap();
        assert!(matches!(
            remote.fetch(&identity),
            Err(RemoteError::Transport(_))
        ));
    }

    #[test]
    fn unknown_host_key_is_rejected_before_authenticating() {
        let (port, _) = serve(TEST_PUBLIC_KEY);
        let dir = TempDir::new().unwrap();
        let known_hosts = dir.path().join("known_hosts");
        fs::write(&known_hosts, "").unwrap();

        let mut remote = ssh_remote(
            port,
            "/repo.git",
            HostKeyPolicy::Verify {
                known_hosts: Some(known_hosts),
            },
        );
        let identity = authenticate(TEST_KEY.as_bytes()).unwrap();
        let err = remote.fetch(&identity).err();
        assert!(
            matches!(&err, Some(RemoteError::HostKey { host }) if host == "127.0.0.1"),
            "{err:?}"
        );
    }

    #[test]
    fn unauthorized_key_is_rejected_as_git() {
        let other = KeyPair::generate_ed25519().clone_public_key().unwrap();
        let (port, _) = serve(&format!("{} {}", other.name(), other.public_key_base64()));
        let mut remote = ssh_remote(port, "/repo.git", HostKeyPolicy::AcceptAny);
        let identity = authenticate(TEST_KEY.as_bytes()).unwrap();
        let err = remote.fetch(&identity).err();
        assert!(
            matches!(&err, Some(RemoteError::AuthRejected { user }) if user == "git"),
            "{err:?}"
        );
    }

    #[test]
    fn known_host_fetches_default_branch() {
        let (_dir, path) = bare_repository();
        let (port, host_key) = serve(TEST_PUBLIC_KEY);
        let hosts = TempDir::new().unwrap();
        let known_hosts = hosts.path().join("known_hosts");
        fs::write(
            &known_hosts,
            format!(
                "[127.0.0.1]:{port} {} {}\n",
                host_key.name(),
                host_key.public_key_base64()
            ),
        )
        .unwrap();

        let mut remote = ssh_remote(
            port,
            &path,
            HostKeyPolicy::Verify {
                known_hosts: Some(known_hosts),
            },
        );
        let identity = authenticate(TEST_KEY.as_bytes()).unwrap();
        let fetched = remote.fetch(&identity).unwrap();
        assert_eq!(fetched.branch, "refs/heads/main");
        assert_eq!(
            fetched.tip.to_string(),
            git(Path::new(&path), &["rev-parse", "main"])
        );
        // commit, tree, README blob
        assert_eq!(fetched.objects.len(), 3);
    }

    #[test]
    fn workflow_pushes_over_ssh() {
        let (_dir, path) = bare_repository();
        let (port, _) = serve(TEST_PUBLIC_KEY);

        let report = run(
            ssh_remote(port, &path, HostKeyPolicy::AcceptAny),
            TEST_KEY.as_bytes(),
            RunId(9),
            &WorkflowSettings::default(),
            &Quiet,
        )
        .unwrap();

        let repo = Path::new(&path);
        assert_eq!(git(repo, &["rev-parse", "main"]), report.commit.to_string());
        assert_eq!(
            git(repo, &["show", "main:test-dirs/dir-9/somedir/file2.txt"]),
            "some data 2"
        );
        assert_eq!(git(repo, &["rev-list", "--count", "main"]), "2");
    }
}
