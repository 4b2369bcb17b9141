//! Bootstrap configuration.
//!
//! Every option is a long flag backed by an environment variable, so the
//! usual invocation is the bare binary inside a container whose environment
//! carries the credentials. [`BootstrapConfig::from_args`] validates the raw
//! arguments and assembles the typed pieces the launcher, prober and
//! sequencer consume.

use std::{
    borrow::Cow, ffi::OsString, fmt, path::PathBuf, time::Duration,
};

use clap::{ArgAction, Args};
use thiserror::Error;
use tracing::debug;
use url::Url;
use zeroize::Zeroizing;

use crate::{
    client::IndexPath,
    launcher::ServerOptions,
    util::{is_secret_key, parse_bool_arg},
};

pub const DEFAULT_INDEX: &str = "internal";
pub const DEFAULT_PORT: u16 = 3141;
pub const DEFAULT_SERVERDIR: &str = "/root/.devpi/server";

/// Older deployments named the secondary account after its tenant.
const LEGACY_SECONDARY_USER: &str = "DEVPI_KAOSMAPS_USER";
const LEGACY_SECONDARY_PASSWORD: &str = "DEVPI_KAOSMAPS_PASSWORD";

/// Raw options for the default (serve) command.
#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Primary (admin) user to provision
    #[arg(long, env = "DEVPI_USER")]
    pub user: Option<String>,
    #[arg(long, env = "DEVPI_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
    /// Secondary user to provision
    #[arg(long, env = "DEVPI_SECONDARY_USER")]
    pub secondary_user: Option<String>,
    #[arg(long, env = "DEVPI_SECONDARY_PASSWORD", hide_env_values = true)]
    pub secondary_password: Option<String>,
    /// Index name created under both users
    #[arg(long, env = "DEVPI_INDEX", default_value = DEFAULT_INDEX)]
    pub index: String,
    #[arg(long, env = "DEVPI_HOST", default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Server data directory
    #[arg(long, env = "DEVPI_SERVERDIR", default_value = DEFAULT_SERVERDIR)]
    pub serverdir: PathBuf,
    /// Wipe the data directory before initializing the server
    #[arg(
        long,
        env = "DEVPI_CLEAN_INIT",
        action = ArgAction::Set,
        default_value = "false",
        value_parser = parse_bool_arg
    )]
    pub clean_init: bool,
    /// Public URL the server advertises when behind a proxy
    #[arg(long, env = "OUTSIDE_URL")]
    pub outside_url: Option<String>,
    #[arg(
        long,
        env = "DEVPI_SERVER_DEBUG",
        action = ArgAction::Set,
        default_value = "true",
        value_parser = parse_bool_arg
    )]
    pub server_debug: bool,
    /// Pause after spawning the server before probing it
    #[arg(
        long,
        env = "DEVPI_STARTUP_GRACE",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub startup_grace: Duration,
    /// How long to wait for the server to answer its status endpoint
    #[arg(
        long,
        env = "DEVPI_READY_TIMEOUT",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    pub ready_timeout: Duration,
    /// Client command line, e.g. `poetry run devpi`
    #[arg(long, env = "DEVPI_CLIENT", default_value = "devpi")]
    pub client: String,
    #[arg(long, env = "DEVPI_INIT_BIN", default_value = "devpi-init")]
    pub init_bin: String,
    #[arg(long, env = "DEVPI_SERVER_BIN", default_value = "devpi-server")]
    pub server_bin: String,
    /// Exit non-zero when provisioning stops part way
    #[arg(
        long,
        env = "DEVPI_STRICT_PROVISIONING",
        action = ArgAction::Set,
        default_value = "false",
        value_parser = parse_bool_arg
    )]
    pub strict_provisioning: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} is not set")]
    Missing { var: &'static str },
    #[error("invalid {what} '{value}': must be non-empty without '/' or whitespace")]
    InvalidName { what: &'static str, value: String },
    #[error("invalid server URL '{url}'")]
    InvalidUrl { url: String },
    #[error("client command line is empty")]
    EmptyClient,
}

/// A password that is wiped on drop and never printed.
#[derive(Clone)]
pub struct Password(Zeroizing<String>);

impl Password {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(Zeroizing::new(raw.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

impl PartialEq for Password {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for Password {}

/// One user and the index provisioned under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub user: String,
    pub password: Password,
    pub index: String,
}

impl Target {
    pub fn new(
        user: impl Into<String>,
        password: impl Into<String>,
        index: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            password: Password::new(password),
            index: index.into(),
        }
    }

    pub fn index_path(&self) -> IndexPath {
        IndexPath::new(&self.user, &self.index)
    }
}

/// Validated configuration for one bootstrap run.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub primary: Target,
    pub secondary: Target,
    pub server: ServerOptions,
    /// URL the client and the prober use to reach the server.
    pub server_url: Url,
    pub client: String,
    pub ready_timeout: Duration,
    pub strict_provisioning: bool,
}

impl BootstrapConfig {
    /// Validate `args`. `lookup` resolves the legacy variable names that
    /// clap does not know about.
    pub fn from_args<F>(args: ServeArgs, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let index = valid_name("index name", args.index)?;

        let primary_user = required(args.user, "DEVPI_USER")?;
        let primary_password = required(args.password, "DEVPI_PASSWORD")?;
        let secondary_user = required(
            args.secondary_user
                .or_else(|| lookup(LEGACY_SECONDARY_USER)),
            "DEVPI_SECONDARY_USER",
        )?;
        let secondary_password = required(
            args.secondary_password
                .or_else(|| lookup(LEGACY_SECONDARY_PASSWORD)),
            "DEVPI_SECONDARY_PASSWORD",
        )?;

        let primary = Target::new(
            valid_name("username", primary_user)?,
            primary_password,
            index.clone(),
        );
        let secondary = Target::new(
            valid_name("username", secondary_user)?,
            secondary_password,
            index,
        );

        if args.client.trim().is_empty() {
            return Err(ConfigError::EmptyClient);
        }

        let server_url = server_url(&args.host, args.port)?;
        let server = ServerOptions {
            data_dir: args.serverdir,
            reset: args.clean_init,
            host: args.host,
            port: args.port,
            outside_url: args.outside_url.filter(|u| !u.trim().is_empty()),
            debug: args.server_debug,
            init_program: args.init_bin,
            server_program: args.server_bin,
            startup_grace: args.startup_grace,
        };

        Ok(Self {
            primary,
            secondary,
            server,
            server_url,
            client: args.client,
            ready_timeout: args.ready_timeout,
            strict_provisioning: args.strict_provisioning,
        })
    }
}

fn required(
    value: Option<String>,
    var: &'static str,
) -> Result<String, ConfigError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing { var })
}

fn valid_name(
    what: &'static str,
    value: String,
) -> Result<String, ConfigError> {
    if value.is_empty()
        || value.contains('/')
        || value.chars().any(char::is_whitespace)
    {
        return Err(ConfigError::InvalidName { what, value });
    }
    Ok(value)
}

/// `http://host:port`, bracketing bare IPv6 hosts.
pub fn server_url(host: &str, port: u16) -> Result<Url, ConfigError> {
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    let raw = format!("http://{host}:{port}");
    Url::parse(&raw).map_err(|_| ConfigError::InvalidUrl { url: raw })
}

/// Log the process environment at debug level, masking secrets.
///
/// Keys and values that are not valid UTF-8 are shown lossily.
pub fn log_environment<I>(vars: I)
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    debug!("Environment variables:");
    for (key, value) in vars {
        let key = key.to_string_lossy();
        debug!("{key}: {}", display_env_value(&key, &value));
    }
}

fn display_env_value<'a>(key: &str, value: &'a OsString) -> Cow<'a, str> {
    if is_secret_key(key) {
        Cow::Borrowed("***")
    } else {
        value.to_string_lossy()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        serve: ServeArgs,
    }

    fn parse(args: &[&str]) -> ServeArgs {
        let mut argv = vec!["sauber-devpi"];
        argv.extend_from_slice(args);
        TestCli::try_parse_from(argv).expect("parse args").serve
    }

    fn full_args() -> ServeArgs {
        parse(&[
            "--user",
            "admin",
            "--password",
            "pw1",
            "--secondary-user",
            "kaos",
            "--secondary-password",
            "pw2",
        ])
    }

    fn no_lookup(_: &str) -> Option<String> {
        None
    }

    /// Defaults only apply when the test process does not set the variable.
    fn unset(var: &str) -> bool {
        std::env::var_os(var).is_none()
    }

    #[test]
    fn defaults_match_deployment() {
        let config = BootstrapConfig::from_args(full_args(), no_lookup)
            .expect("valid config");
        if unset("DEVPI_INDEX") {
            assert_eq!(config.primary.index, "internal");
            assert_eq!(config.secondary.index, "internal");
        }
        if unset("DEVPI_HOST") {
            assert_eq!(config.server.host, "0.0.0.0");
        }
        if unset("DEVPI_SERVERDIR") {
            assert_eq!(
                config.server.data_dir,
                PathBuf::from(DEFAULT_SERVERDIR)
            );
        }
        if unset("DEVPI_CLEAN_INIT") {
            assert!(!config.server.reset);
        }
        if unset("DEVPI_SERVER_DEBUG") {
            assert!(config.server.debug);
        }
        if unset("DEVPI_STARTUP_GRACE") {
            assert_eq!(config.server.startup_grace, Duration::from_secs(5));
        }
        if unset("DEVPI_READY_TIMEOUT") {
            assert_eq!(config.ready_timeout, Duration::from_secs(60));
        }
        if unset("PORT") {
            assert_eq!(config.server.port, DEFAULT_PORT);
        }
        if unset("PORT") && unset("DEVPI_HOST") {
            assert_eq!(config.server_url.as_str(), "http://0.0.0.0:3141/");
        }
        if unset("DEVPI_CLIENT") {
            assert_eq!(config.client, "devpi");
        }
        if unset("DEVPI_STRICT_PROVISIONING") {
            assert!(!config.strict_provisioning);
        }
    }

    #[test]
    fn targets_share_index_name() {
        let mut args = full_args();
        args.index = "dev".into();
        let config = BootstrapConfig::from_args(args, no_lookup).unwrap();
        assert_eq!(config.primary.index_path(), IndexPath::new("admin", "dev"));
        assert_eq!(
            config.secondary.index_path(),
            IndexPath::new("kaos", "dev")
        );
        assert_eq!(config.primary.password.expose(), "pw1");
        assert_eq!(config.secondary.password.expose(), "pw2");
    }

    #[test]
    fn missing_primary_user_is_reported_by_variable() {
        let mut args = full_args();
        args.user = None;
        let err = BootstrapConfig::from_args(args, no_lookup).unwrap_err();
        assert_eq!(err, ConfigError::Missing { var: "DEVPI_USER" });
        assert_eq!(err.to_string(), "DEVPI_USER is not set");
    }

    #[test]
    fn empty_password_counts_as_missing() {
        let mut args = full_args();
        args.password = Some(String::new());
        let err = BootstrapConfig::from_args(args, no_lookup).unwrap_err();
        assert_eq!(err, ConfigError::Missing { var: "DEVPI_PASSWORD" });
    }

    #[test]
    fn legacy_secondary_variables_are_fallbacks() {
        let mut args = full_args();
        args.secondary_user = None;
        args.secondary_password = None;
        let legacy: HashMap<&str, &str> = HashMap::from([
            ("DEVPI_KAOSMAPS_USER", "kaosmaps"),
            ("DEVPI_KAOSMAPS_PASSWORD", "legacy-pw"),
        ]);
        let config = BootstrapConfig::from_args(args, |key| {
            legacy.get(key).map(|v| v.to_string())
        })
        .unwrap();
        assert_eq!(config.secondary.user, "kaosmaps");
        assert_eq!(config.secondary.password.expose(), "legacy-pw");
    }

    #[test]
    fn names_with_separators_are_rejected() {
        let mut args = full_args();
        args.index = "a/b".into();
        assert!(matches!(
            BootstrapConfig::from_args(args, no_lookup),
            Err(ConfigError::InvalidName { what: "index name", .. })
        ));

        let mut args = full_args();
        args.user = Some("bad user".into());
        assert!(matches!(
            BootstrapConfig::from_args(args, no_lookup),
            Err(ConfigError::InvalidName { what: "username", .. })
        ));
    }

    #[test]
    fn flags_accept_env_style_booleans_and_durations() {
        let args = parse(&[
            "--clean-init",
            "yes",
            "--server-debug",
            "off",
            "--ready-timeout",
            "2m",
            "--startup-grace",
            "0s",
            "--strict-provisioning",
            "1",
        ]);
        assert!(args.clean_init);
        assert!(!args.server_debug);
        assert!(args.strict_provisioning);
        assert_eq!(args.ready_timeout, Duration::from_secs(120));
        assert_eq!(args.startup_grace, Duration::ZERO);

        let bad = ["sauber-devpi", "--clean-init", "perhaps"];
        assert!(TestCli::try_parse_from(bad).is_err());
    }

    #[test]
    fn blank_outside_url_is_ignored() {
        let mut args = full_args();
        args.outside_url = Some("  ".into());
        let config = BootstrapConfig::from_args(args, no_lookup).unwrap();
        assert_eq!(config.server.outside_url, None);
    }

    #[test]
    fn empty_client_is_rejected() {
        let mut args = full_args();
        args.client = " ".into();
        assert_eq!(
            BootstrapConfig::from_args(args, no_lookup).unwrap_err(),
            ConfigError::EmptyClient
        );
    }

    #[test]
    fn server_url_brackets_ipv6() {
        assert_eq!(
            server_url("::", 3141).unwrap().as_str(),
            "http://[::]:3141/"
        );
        assert_eq!(
            server_url("localhost", 8080).unwrap().as_str(),
            "http://localhost:8080/"
        );
    }

    #[test]
    fn password_never_prints() {
        let target = Target::new("admin", "hunter2", "internal");
        let shown = format!("{target:?}");
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("Password(***)"));
        let secret = OsString::from("hunter2");
        assert_eq!(display_env_value("DEVPI_PASSWORD", &secret), "***");
        assert_eq!(display_env_value("PORT", &OsString::from("3141")), "3141");
    }

    #[cfg(unix)]
    #[test]
    fn environment_with_non_utf8_entries_is_logged() {
        use std::os::unix::ffi::OsStringExt;

        let odd = OsString::from_vec(vec![b'f', 0xff, b'o']);
        assert_eq!(display_env_value("LANG_ODD", &odd), "f\u{fffd}o");
        log_environment([
            (OsString::from_vec(vec![0xfe, b'K']), odd.clone()),
            (OsString::from("DEVPI_PASSWORD"), odd),
        ]);
    }
}
