//! The seam between provisioning and the external devpi client.
//!
//! [`IndexClient`] is what the sequencer talks to. [`DevpiCli`] is the
//! production implementation: it shells out to the `devpi` command-line
//! client for anything that touches the client session and reads index
//! metadata straight from the server over HTTP.

use std::{fmt::Display, time::Duration};

use async_trait::async_trait;
use reqwest::{StatusCode, header::ACCEPT};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
    command::{CommandError, CommandSpec, run_spec_with_output},
    config::Password,
    util::endpoint,
};

/// A package index scoped to its owning user.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexPath {
    pub user: String,
    pub index: String,
}

impl IndexPath {
    pub fn new(user: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            index: index.into(),
        }
    }

    /// Absolute form accepted by `devpi use`.
    pub fn use_target(&self) -> String {
        format!("/{}/{}", self.user, self.index)
    }
}

impl Display for IndexPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user, self.index)
    }
}

/// What the server reports about an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexState {
    Present { bases: Vec<String> },
    Absent,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("`{command}` exited with {}: {}", describe_code(.code), .stderr.trim())]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("request to {url} failed")]
    Http {
        url: Url,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus { url: Url, status: u16 },
    #[error("could not decode index metadata from {url}")]
    Decode {
        url: Url,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid endpoint for {path}")]
    Endpoint {
        path: String,
        #[source]
        source: url::ParseError,
    },
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "a signal".to_string(),
    }
}

/// Operations the provisioning sequence needs from the index server.
///
/// Every method maps to one client invocation or one HTTP request; none of
/// them retry.
#[async_trait]
pub trait IndexClient: Send + Sync {
    /// Point the client session at the server.
    async fn use_server(&self, url: &Url) -> Result<(), ClientError>;

    async fn user_exists(&self, user: &str) -> Result<bool, ClientError>;

    async fn create_user(
        &self,
        user: &str,
        password: &Password,
    ) -> Result<(), ClientError>;

    async fn login(
        &self,
        user: &str,
        password: &Password,
    ) -> Result<(), ClientError>;

    /// Look up index metadata. A 404 is [`IndexState::Absent`]; any other
    /// non-200 answer is [`ClientError::UnexpectedStatus`].
    async fn index_state(
        &self,
        url: &Url,
        index: &IndexPath,
    ) -> Result<IndexState, ClientError>;

    /// Create the index with no mirror bases.
    async fn create_index(&self, index: &IndexPath) -> Result<(), ClientError>;

    /// Switch the client session to the index.
    async fn use_index(&self, index: &IndexPath) -> Result<(), ClientError>;
}

/// Whether a `devpi user -l` listing names the user.
pub fn listing_contains_user(listing: &str, user: &str) -> bool {
    listing.lines().any(|line| line.trim() == user)
}

#[derive(Debug, Deserialize)]
struct IndexEnvelope {
    result: IndexConfig,
}

#[derive(Debug, Deserialize)]
struct IndexConfig {
    #[serde(default)]
    bases: Vec<String>,
}

/// Parse the JSON body devpi serves for `GET /<user>/<index>`.
pub fn parse_index_bases(body: &str) -> Result<Vec<String>, serde_json::Error> {
    let envelope: IndexEnvelope = serde_json::from_str(body)?;
    Ok(envelope.result.bases)
}

/// [`IndexClient`] backed by the `devpi` command-line client.
#[derive(Debug, Clone)]
pub struct DevpiCli {
    base: CommandSpec,
    http: reqwest::Client,
    request_timeout: Duration,
}

/// Upper bound for a single index metadata request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

impl DevpiCli {
    /// `command_line` may carry a prefix, e.g. `poetry run devpi`.
    pub fn new(command_line: &str, http: reqwest::Client) -> Option<Self> {
        let base = CommandSpec::from_command_line(command_line)?;
        Some(Self {
            base,
            http,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn spec<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = self.base.clone();
        spec.args.extend(args.into_iter().map(Into::into));
        spec
    }

    pub fn use_spec(&self, target: &str) -> CommandSpec {
        self.spec(["use", target])
    }

    pub fn user_list_spec(&self) -> CommandSpec {
        self.spec(["user", "-l"])
    }

    pub fn user_create_spec(
        &self,
        user: &str,
        password: &Password,
    ) -> CommandSpec {
        self.spec([
            "user".to_string(),
            "-c".to_string(),
            user.to_string(),
            format!("password={}", password.expose()),
        ])
    }

    pub fn login_spec(&self, user: &str, password: &Password) -> CommandSpec {
        self.spec([
            "login".to_string(),
            user.to_string(),
            format!("--password={}", password.expose()),
        ])
    }

    pub fn index_create_spec(&self, index: &IndexPath) -> CommandSpec {
        self.spec([
            "index".to_string(),
            "-c".to_string(),
            index.to_string(),
            "bases=".to_string(),
        ])
    }

    /// Run a client command, log its output and return stdout.
    async fn run(&self, spec: &CommandSpec) -> Result<String, ClientError> {
        debug!(command = %spec, "running devpi client");
        let output = run_spec_with_output(spec).await?;
        let stdout = output.stdout.trim();
        if !stdout.is_empty() {
            info!("{stdout}");
        }
        if !output.success() {
            error!(
                command = %spec,
                status = %output.status,
                stderr = %output.stderr.trim(),
                "devpi client command failed"
            );
            return Err(ClientError::Failed {
                command: spec.to_string(),
                code: output.status.code(),
                stderr: output.stderr,
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl IndexClient for DevpiCli {
    async fn use_server(&self, url: &Url) -> Result<(), ClientError> {
        self.run(&self.use_spec(url.as_str())).await.map(drop)
    }

    async fn user_exists(&self, user: &str) -> Result<bool, ClientError> {
        let listing = self.run(&self.user_list_spec()).await?;
        Ok(listing_contains_user(&listing, user))
    }

    async fn create_user(
        &self,
        user: &str,
        password: &Password,
    ) -> Result<(), ClientError> {
        self.run(&self.user_create_spec(user, password)).await.map(drop)
    }

    async fn login(
        &self,
        user: &str,
        password: &Password,
    ) -> Result<(), ClientError> {
        self.run(&self.login_spec(user, password)).await.map(drop)
    }

    async fn index_state(
        &self,
        url: &Url,
        index: &IndexPath,
    ) -> Result<IndexState, ClientError> {
        let path = index.to_string();
        let target = endpoint(url, &path)
            .map_err(|source| ClientError::Endpoint { path, source })?;
        let http_err = |source| ClientError::Http {
            url: target.clone(),
            source,
        };

        let response = self
            .http
            .get(target.clone())
            .header(ACCEPT, "application/json")
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(http_err)?;

        match response.status() {
            StatusCode::OK => {
                let body = response.text().await.map_err(http_err)?;
                let bases = parse_index_bases(&body).map_err(|source| {
                    ClientError::Decode {
                        url: target.clone(),
                        source,
                    }
                })?;
                Ok(IndexState::Present { bases })
            }
            StatusCode::NOT_FOUND => Ok(IndexState::Absent),
            other => Err(ClientError::UnexpectedStatus {
                url: target.clone(),
                status: other.as_u16(),
            }),
        }
    }

    async fn create_index(&self, index: &IndexPath) -> Result<(), ClientError> {
        self.run(&self.index_create_spec(index)).await.map(drop)
    }

    async fn use_index(&self, index: &IndexPath) -> Result<(), ClientError> {
        self.run(&self.use_spec(&index.use_target())).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(line: &str) -> DevpiCli {
        DevpiCli::new(line, reqwest::Client::new()).expect("client line")
    }

    #[test]
    fn blank_client_line_is_rejected() {
        assert!(DevpiCli::new("  ", reqwest::Client::new()).is_none());
    }

    #[test]
    fn specs_carry_command_prefix() {
        let cli = cli("poetry run devpi");
        let spec = cli.use_spec("http://0.0.0.0:3141/");
        assert_eq!(spec.program, "poetry");
        assert_eq!(
            spec.args,
            vec!["run", "devpi", "use", "http://0.0.0.0:3141/"]
        );
    }

    #[test]
    fn index_create_disables_bases() {
        let spec = cli("devpi")
            .index_create_spec(&IndexPath::new("alice", "internal"));
        assert_eq!(spec.args, vec!["index", "-c", "alice/internal", "bases="]);
    }

    #[test]
    fn credentials_are_passed_but_not_displayed() {
        let cli = cli("devpi");
        let password = Password::new("s3cret");

        let create = cli.user_create_spec("alice", &password);
        assert_eq!(create.args, vec!["user", "-c", "alice", "password=s3cret"]);
        assert!(!create.to_string().contains("s3cret"));

        let login = cli.login_spec("alice", &password);
        assert_eq!(login.args, vec!["login", "alice", "--password=s3cret"]);
        assert!(!login.to_string().contains("s3cret"));
    }

    #[test]
    fn use_index_targets_absolute_path() {
        let path = IndexPath::new("bob", "internal");
        assert_eq!(path.use_target(), "/bob/internal");
        assert_eq!(path.to_string(), "bob/internal");
        assert_eq!(
            cli("devpi").use_spec(&path.use_target()).args,
            vec!["use", "/bob/internal"]
        );
    }

    #[test]
    fn listing_match_is_per_line() {
        let listing = "root\nalice\nbobby\n";
        assert!(listing_contains_user(listing, "alice"));
        assert!(listing_contains_user(listing, "root"));
        assert!(!listing_contains_user(listing, "bob"));
        assert!(!listing_contains_user("", "alice"));
    }

    #[test]
    fn index_bases_parse_from_metadata() {
        let body = r#"{"type": "indexconfig", "result": {"type": "stage", "bases": [], "volatile": true, "projects": []}}"#;
        assert_eq!(parse_index_bases(body).unwrap(), Vec::<String>::new());

        let mirrored = r#"{"result": {"bases": ["root/pypi"]}}"#;
        assert_eq!(parse_index_bases(mirrored).unwrap(), vec!["root/pypi"]);

        let missing = r#"{"result": {"type": "stage"}}"#;
        assert!(parse_index_bases(missing).unwrap().is_empty());

        assert!(parse_index_bases("<html>").is_err());
    }

    #[test]
    fn failed_command_message_names_exit_code() {
        let err = ClientError::Failed {
            command: "devpi login alice --password=***".into(),
            code: Some(1),
            stderr: "unauthorized\n".into(),
        };
        assert_eq!(
            err.to_string(),
            "`devpi login alice --password=***` exited with exit code 1: unauthorized"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_client_exit_is_reported() {
        let cli = cli("false");
        let err = cli.use_index(&IndexPath::new("alice", "internal")).await;
        assert!(matches!(err, Err(ClientError::Failed { code: Some(1), .. })));
    }
}
