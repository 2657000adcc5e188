use std::{
    fmt,
    num::ParseIntError,
    result::Result as StdResult,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    auth::authenticate,
    error::{MemgitError, Result},
    object::{ObjectId, Signature},
    output::{self, Output},
    remote::Remote,
    session::Session,
    status::ChangeSet,
};

/// Identifier that keeps the files of one run apart from every other run.
///
/// Defaults to the wall-clock time in nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(pub u128);

impl RunId {
    /// Run id for the current instant.
    pub fn now() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        Self(nanos)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Tunable parts of a workflow run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSettings {
    /// Author and committer name.
    pub author_name: String,
    /// Author and committer email.
    pub author_email: String,
    /// Commit message.
    pub message: String,
    /// Directory the per-run directory is created under.
    pub base_dir: String,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            author_name: "Pepito".to_string(),
            author_email: String::new(),
            message: "Automatic commit".to_string(),
            base_dir: "test-dirs".to_string(),
        }
    }
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowReport {
    /// Run id used for the directory name.
    pub run_id: RunId,
    /// Branch that received the commit.
    pub branch: String,
    /// The pushed commit.
    pub commit: ObjectId,
    /// Paths written, relative to the repository root.
    pub paths: Vec<String>,
}

/// The files a run writes, as `(path, contents)` pairs.
pub fn run_files(run_id: RunId, settings: &WorkflowSettings) -> Vec<(String, &'static str)> {
    let base = settings.base_dir.trim_matches('/');
    let dir = if base.is_empty() {
        format!("dir-{run_id}")
    } else {
        format!("{base}/dir-{run_id}")
    };
    vec![
        (format!("{dir}/file1.txt"), "some data"),
        (format!("{dir}/somedir/file2.txt"), "some data 2"),
        (format!("{dir}/somedir/anotherdir/file3.txt"), "some data 3"),
    ]
}

/// Map an output backend error into a [`MemgitError`].
fn emit(result: output::Result<()>) -> Result<()> {
    result.map_err(|e| MemgitError::Output(format!("Output operation failed: {e}")))
}

/// Print `status` in porcelain form under `header`.
fn report_status(output: &dyn Output, header: &str, status: &ChangeSet) -> Result<()> {
    let section = output.section(header);
    if status.is_clean() {
        return emit(section.message("nothing to commit, working tree clean"));
    }
    for line in status.to_string().lines() {
        emit(section.message(line))?;
    }
    Ok(())
}

/// Authenticate, clone, write the run's files, stage, commit and push.
///
/// The credential is parsed before the remote is contacted, so an invalid
/// credential never causes a connection. Any failure stops the run; nothing
/// is cleaned up on the remote.
pub fn run<R: Remote>(
    remote: R,
    credential: &[u8],
    run_id: RunId,
    settings: &WorkflowSettings,
    output: &dyn Output,
) -> Result<WorkflowReport> {
    let identity = authenticate(credential)?;
    let location = remote.location().to_string();

    let spinner = output.spinner(&format!("Cloning {location}"));
    let mut session = match Session::clone(remote, &identity) {
        Ok(session) => session,
        Err(e) => {
            spinner.finish_fail(&format!("Clone of {location} failed"));
            return Err(e);
        }
    };
    spinner.finish_clear();
    emit(output.success(&format!(
        "Cloned {location} ({} at {})",
        session.branch(),
        session.head().short()
    )))?;

    let files = run_files(run_id, settings);
    let worktree = session.worktree_mut()?;
    for (path, contents) in &files {
        worktree.write_file(path, contents)?;
    }

    report_status(output, "Status before staging", &session.status()?)?;
    let staged = session.stage_all()?;
    emit(output.message(&format!("Staged {staged} change(s)")))?;
    report_status(output, "Status after staging", &session.status()?)?;

    let author = Signature::now(&settings.author_name, &settings.author_email);
    let commit = session.commit(&settings.message, &author)?;
    emit(output.message(&format!("Created commit {}", commit.short())))?;

    let spinner = output.spinner(&format!("Pushing to {location}"));
    if let Err(e) = session.push(&identity) {
        spinner.finish_fail(&format!("Push to {location} failed"));
        return Err(e);
    }
    spinner.finish_clear();
    emit(output.success(&format!(
        "Pushed {} to {}",
        commit.short(),
        session.branch()
    )))?;

    Ok(WorkflowReport {
        run_id,
        branch: session.branch().to_string(),
        commit,
        paths: files.into_iter().map(|(path, _)| path).collect(),
    })
}
