//! Value-level description of external commands and the helpers that run
//! them.
//!
//! Everything the bootstrapper does to the outside world goes through a
//! [`CommandSpec`], so command lines can be asserted in tests without
//! spawning anything.

use std::{
    fmt::Display,
    path::PathBuf,
    process::{ExitStatus, Stdio},
};

use thiserror::Error;
use tokio::process::{Child, Command};

/// Argument prefixes whose values are masked when a spec is displayed.
const SENSITIVE_PREFIXES: &[&str] = &["password=", "--password="];

/// Abstract command representation so we can test without spawning processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub inherit_stdio: bool,
}

/// Display the command line with credentials masked.
impl Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(cwd) = &self.cwd {
            write!(f, "(in {}) ", cwd.display())?;
        }
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", mask_arg(arg))?;
        }
        Ok(())
    }
}

fn mask_arg(arg: &str) -> String {
    for prefix in SENSITIVE_PREFIXES {
        if arg.starts_with(prefix) {
            return format!("{prefix}***");
        }
    }
    arg.to_string()
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            inherit_stdio: false,
        }
    }

    /// Build a spec from a whitespace separated command line such as
    /// `poetry run devpi`. Returns `None` for a blank line.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let mut spec = Self::new(words.next()?);
        spec.args.extend(words.map(str::to_string));
        Some(spec)
    }
}

/// Failure to start an external program at all.
#[derive(Debug, Error)]
#[error("failed to run {program}")]
pub struct CommandError {
    pub program: String,
    #[source]
    pub source: std::io::Error,
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

pub fn to_command(spec: &CommandSpec) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);
    if !spec.env.is_empty() {
        cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    if spec.inherit_stdio {
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd
}

/// Start the command in the background and hand back the child.
pub fn spawn_spec(spec: &CommandSpec) -> Result<Child, CommandError> {
    to_command(spec).spawn().map_err(|source| CommandError {
        program: spec.program.clone(),
        source,
    })
}

pub async fn run_spec_with_output(
    spec: &CommandSpec,
) -> Result<CommandOutput, CommandError> {
    let output = to_command(spec).output().await.map_err(|source| {
        CommandError {
            program: spec.program.clone(),
            source,
        }
    })?;
    Ok(CommandOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}
