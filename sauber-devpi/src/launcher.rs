//! Starts the devpi server.
//!
//! Launching is three steps: optionally wipe the data directory, run
//! `devpi-init` when the directory has not been initialized yet, then spawn
//! `devpi-server` in the background. Any failure before the spawn is fatal
//! for the bootstrap.

use std::{
    io,
    path::{Path, PathBuf},
    process::ExitStatus,
    time::Duration,
};

use thiserror::Error;
use tokio::{fs, process::Child, time::sleep};
use tracing::{debug, info, warn};

use crate::command::{
    CommandError, CommandSpec, run_spec_with_output, spawn_spec,
};

/// File devpi writes into an initialized server directory.
pub const SERVER_VERSION_MARKER: &str = ".serverversion";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    pub data_dir: PathBuf,
    /// Remove `data_dir` before initializing.
    pub reset: bool,
    pub host: String,
    pub port: u16,
    pub outside_url: Option<String>,
    pub debug: bool,
    pub init_program: String,
    pub server_program: String,
    pub startup_grace: Duration,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to clear data directory {}", .path.display())]
    ClearDataDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {status}: {}", .stderr.trim())]
    InitFailed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// `devpi-init` without the root/pypi mirror.
pub fn init_spec(opts: &ServerOptions) -> CommandSpec {
    let mut spec = CommandSpec::new(&opts.init_program);
    spec.args = vec![
        "--serverdir".into(),
        opts.data_dir.display().to_string(),
        "--no-root-pypi".into(),
    ];
    spec
}

pub fn server_spec(opts: &ServerOptions) -> CommandSpec {
    let mut spec = CommandSpec::new(&opts.server_program);
    spec.args = vec![
        "--serverdir".into(),
        opts.data_dir.display().to_string(),
        "--host".into(),
        opts.host.clone(),
        "--port".into(),
        opts.port.to_string(),
        "--trusted-proxy".into(),
        "*".into(),
    ];
    if let Some(url) = &opts.outside_url {
        spec.args.push("--outside-url".into());
        spec.args.push(url.clone());
    }
    if opts.debug {
        spec.args.push("--debug".into());
    }
    spec.inherit_stdio = true;
    spec
}

pub fn is_initialized(data_dir: &Path) -> bool {
    data_dir.join(SERVER_VERSION_MARKER).is_file()
}

/// Remove the data directory. Returns whether anything was removed.
pub async fn reset_data_dir(data_dir: &Path) -> Result<bool, LaunchError> {
    match fs::remove_dir_all(data_dir).await {
        Ok(()) => {
            info!(
                path = %data_dir.display(),
                "Removed existing data directory"
            );
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(LaunchError::ClearDataDir {
            path: data_dir.to_path_buf(),
            source,
        }),
    }
}

/// Run `devpi-init` unless the directory is already initialized. Returns
/// whether init ran.
pub async fn ensure_initialized(
    opts: &ServerOptions,
) -> Result<bool, LaunchError> {
    if is_initialized(&opts.data_dir) {
        info!(
            path = %opts.data_dir.display(),
            "Server directory already initialized"
        );
        return Ok(false);
    }

    info!("Initializing devpi server without root/pypi mirror...");
    let spec = init_spec(opts);
    debug!(command = %spec, "running init");
    let output = run_spec_with_output(&spec).await?;
    if !output.stdout.trim().is_empty() {
        info!("{}", output.stdout.trim());
    }
    if !output.success() {
        return Err(LaunchError::InitFailed {
            program: spec.program,
            status: output.status,
            stderr: output.stderr,
        });
    }
    Ok(true)
}

/// The running server process.
#[derive(Debug)]
pub struct ServerHandle {
    child: Child,
}

impl ServerHandle {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Block until the server exits.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    pub async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

pub async fn launch(opts: &ServerOptions) -> Result<ServerHandle, LaunchError> {
    if opts.reset {
        info!("Performing clean initialization...");
        reset_data_dir(&opts.data_dir).await?;
    }

    ensure_initialized(opts).await?;

    let spec = server_spec(opts);
    info!(
        host = %opts.host,
        port = opts.port,
        outside_url = opts.outside_url.as_deref().unwrap_or("-"),
        "Starting devpi server"
    );
    debug!(command = %spec, "spawning server");
    let child = spawn_spec(&spec)?;
    let handle = ServerHandle { child };
    match handle.id() {
        Some(pid) => info!(pid, "devpi server started"),
        None => warn!("devpi server exited immediately after spawn"),
    }

    if !opts.startup_grace.is_zero() {
        sleep(opts.startup_grace).await;
    }
    Ok(handle)
}
