#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]
//! Command-line interface that clones a git remote into memory, commits a
//! fixed set of files and pushes them back, via the libmemgit crate.

/// TOML configuration file.
mod config;

use std::{
    env::{self, VarError},
    io::{self, IsTerminal, Write},
    process,
    result::Result as StdResult,
    sync::Arc,
};

use anyhow::Result;
use clap::{ArgGroup, Parser};
use libmemgit::{
    HostKeyPolicy, MemgitError, Output, OutputError, Quiet, RemoteLocation, RunId, Terminal,
    WorkflowSettings, open_remote, run as run_workflow,
};

use crate::config::{Config, expand_tilde};

/// Environment variable read for the private key by default.
const DEFAULT_CREDENTIAL_ENV: &str = "SSH_CRED";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(group(
    ArgGroup::new("color_mode")
        .args(["color", "no_color"])
))]
/// Top-level CLI options for memgit.
struct Cli {
    /// Remote repository: ssh://, git@host:path, file:// or a local path
    #[arg(value_name = "URL")]
    url: String,

    /// Read settings from this TOML file (defaults to $MEMGIT_CONFIG)
    #[arg(long, value_name = "FILE")]
    config: Option<String>,

    /// Environment variable holding the private key [default: SSH_CRED]
    #[arg(long, value_name = "VAR")]
    credential_env: Option<String>,

    /// Known-hosts file used to verify the server (defaults to ~/.ssh/known_hosts)
    #[arg(long, value_name = "FILE")]
    known_hosts: Option<String>,

    /// Accept any SSH host key without verification
    #[arg(long)]
    accept_unknown_host_keys: bool,

    /// Commit author name [default: Pepito]
    #[arg(long, value_name = "NAME")]
    author: Option<String>,

    /// Commit author email [default: empty]
    #[arg(long, value_name = "EMAIL")]
    email: Option<String>,

    /// Commit message [default: "Automatic commit"]
    #[arg(long, short, value_name = "MSG")]
    message: Option<String>,

    /// Directory the run directory is created under [default: test-dirs]
    #[arg(long, value_name = "DIR")]
    base_dir: Option<String>,

    /// Run id used in the directory name (defaults to the current time in nanoseconds)
    #[arg(long, value_name = "ID")]
    run_id: Option<RunId>,

    /// Enable colored output
    #[arg(long)]
    color: bool,

    /// Disable colored output
    #[arg(long = "no-color")]
    no_color: bool,

    /// Suppress all output
    #[arg(long)]
    quiet: bool,
}

/// Map output errors into `MemgitError` values.
fn map_output_error(err: OutputError) -> MemgitError {
    MemgitError::Output(format!("Output operation failed: {err}"))
}

/// Emit an output result, mapping errors into `MemgitError`.
fn emit(result: StdResult<(), OutputError>) -> Result<()> {
    result.map_err(map_output_error)?;
    Ok(())
}

/// Read the private key from the environment variable `var`.
fn read_credential(var: &str) -> StdResult<String, MemgitError> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        Ok(_) => Err(MemgitError::Config(format!(
            "environment variable {var} is empty"
        ))),
        Err(VarError::NotPresent) => Err(MemgitError::Config(format!(
            "environment variable {var} is not set"
        ))),
        Err(VarError::NotUnicode(_)) => Err(MemgitError::Auth(format!(
            "environment variable {var} is not valid UTF-8"
        ))),
    }
}

/// Combine CLI flags, config file values and defaults into workflow settings.
fn workflow_settings(cli: &Cli, config: &Config) -> WorkflowSettings {
    let defaults = WorkflowSettings::default();
    let commit = &config.commit;
    WorkflowSettings {
        author_name: cli
            .author
            .clone()
            .or_else(|| commit.author.clone())
            .unwrap_or(defaults.author_name),
        author_email: cli
            .email
            .clone()
            .or_else(|| commit.email.clone())
            .unwrap_or(defaults.author_email),
        message: cli
            .message
            .clone()
            .or_else(|| commit.message.clone())
            .unwrap_or(defaults.message),
        base_dir: cli
            .base_dir
            .clone()
            .or_else(|| commit.base_dir.clone())
            .unwrap_or(defaults.base_dir),
    }
}

/// Pick the host key policy from CLI flags and config.
fn host_key_policy(cli: &Cli, config: &Config) -> HostKeyPolicy {
    let transport = &config.transport;
    if cli.accept_unknown_host_keys || transport.accept_unknown_host_keys == Some(true) {
        return HostKeyPolicy::AcceptAny;
    }
    let known_hosts = cli
        .known_hosts
        .as_deref()
        .or(transport.known_hosts.as_deref())
        .map(expand_tilde);
    HostKeyPolicy::Verify { known_hosts }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Determine color output preference early for error handling
    let color = if cli.color {
        true
    } else if cli.no_color {
        false
    } else {
        io::stdout().is_terminal()
    };

    let output: Arc<dyn Output> = if cli.quiet {
        Arc::new(Quiet)
    } else {
        Arc::new(Terminal::new(color))
    };

    if let Err(e) = run(&cli, &output) {
        // Reset any existing colors only if color was enabled and stdout is a TTY
        if color && io::stdout().is_terminal() {
            print!("\x1b[0m");
            if let Err(flush_err) = io::stdout().flush() {
                eprintln!("Failed to flush stdout while resetting colors: {flush_err}");
            }
        }

        // Quiet output still reports why the run failed.
        if cli.quiet {
            eprintln!("{e:#}");
        } else if let Err(display_err) = output.fail(&format!("{e:#}")) {
            eprintln!("Failed to report error via output handler: {display_err:#}");
        }
        if let Err(finish_err) = output.finish() {
            eprintln!("Failed to flush output handler: {finish_err:#}");
        }
        let exit_code = e
            .downcast_ref::<MemgitError>()
            .map_or(1, MemgitError::exit_code);
        process::exit(exit_code);
    }
    Ok(())
}

/// Execute one workflow run using the provided output implementation.
fn run(cli: &Cli, output: &Arc<dyn Output>) -> Result<()> {
    let config = Config::discover(cli.config.as_deref())?;

    let credential_env = cli
        .credential_env
        .as_deref()
        .or(config.transport.credential_env.as_deref())
        .unwrap_or(DEFAULT_CREDENTIAL_ENV);
    let credential = read_credential(credential_env)?;

    let location = RemoteLocation::parse(&cli.url)?;
    let remote = open_remote(location, host_key_policy(cli, &config))?;
    let settings = workflow_settings(cli, &config);
    let run_id = cli.run_id.unwrap_or_else(RunId::now);

    let report = run_workflow(
        remote,
        credential.as_bytes(),
        run_id,
        &settings,
        output.as_ref(),
    )?;

    let section = output.section(&format!("Run {}", report.run_id));
    for path in &report.paths {
        emit(section.message(path))?;
    }
    emit(output.finish())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::iter;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(iter::once("memgit").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn cli_flags_override_config() {
        let cli = parse(&["--author", "Flag", "git@example.com:repo.git"]);
        let config: Config =
            toml::from_str("[commit]\nauthor = \"File\"\nmessage = \"From file\"\n").unwrap();
        let settings = workflow_settings(&cli, &config);
        assert_eq!(settings.author_name, "Flag");
        assert_eq!(settings.message, "From file");
        assert_eq!(settings.base_dir, "test-dirs");
        assert_eq!(settings.author_email, "");
    }

    #[test]
    fn host_keys_are_verified_unless_opted_out() {
        let cli = parse(&["--known-hosts", "/tmp/kh", "git@example.com:repo.git"]);
        assert_eq!(
            host_key_policy(&cli, &Config::default()),
            HostKeyPolicy::Verify {
                known_hosts: Some("/tmp/kh".into())
            }
        );

        let cli = parse(&["git@example.com:repo.git"]);
        let config: Config =
            toml::from_str("[transport]\naccept_unknown_host_keys = true\n").unwrap();
        assert_eq!(host_key_policy(&cli, &config), HostKeyPolicy::AcceptAny);
    }

    #[test]
    fn run_id_is_parsed() {
        let cli = parse(&["--run-id", "1700000000000000000", "/srv/repo.git"]);
        assert_eq!(cli.run_id, Some(RunId(1_700_000_000_000_000_000)));
        assert!(Cli::try_parse_from(["memgit", "--run-id", "soon", "/srv/repo.git"]).is_err());
    }

    #[test]
    fn color_flags_conflict() {
        assert!(Cli::try_parse_from(["memgit", "--color", "--no-color", "/srv/repo.git"]).is_err());
    }
}
