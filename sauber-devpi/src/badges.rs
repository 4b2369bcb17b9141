//! README version badges.
//!
//! `sauber-devpi badges` asks the installed tools for their versions and
//! rewrites the matching shields.io badges in a README. A badge is matched
//! by its exact label, case-insensitively, so `[![DevPI](...)](...)` and
//! `[![devpi](...)](...)` are both refreshed while `[![devpi-client](...)]`
//! is left to its own badge.

use std::path::Path;

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use crate::command::{CommandSpec, run_spec_with_output};

/// Reported when the docker daemon cannot be queried.
pub const DOCKER_FALLBACK_VERSION: &str = "20.10+";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Badge {
    pub label: &'static str,
    pub version: String,
    pub color: &'static str,
    pub link: &'static str,
}

impl Badge {
    pub fn markdown(&self) -> String {
        format!(
            "[![{label}](https://img.shields.io/badge/{slug}-{version}-{color}.svg)]({link})",
            label = self.label,
            slug = shields_escape(&self.label.to_ascii_lowercase()),
            version = shields_escape(&self.version),
            color = self.color,
            link = self.link,
        )
    }

    /// Matches an existing badge with this label.
    fn pattern(&self) -> Result<Regex, regex::Error> {
        RegexBuilder::new(&format!(
            r"\[!\[{}\]\(.*?\)\]\(.*?\)",
            regex::escape(self.label)
        ))
        .case_insensitive(true)
        .build()
    }
}

/// shields.io path segments use `-` as a separator, so literal dashes and
/// underscores are doubled; `+` must be percent-encoded.
fn shields_escape(raw: &str) -> String {
    raw.replace('-', "--")
        .replace('_', "__")
        .replace(' ', "_")
        .replace('+', "%2B")
}

/// Replace every badge in `content` whose label matches one of `badges`.
pub fn replace_badges(
    content: &str,
    badges: &[Badge],
) -> Result<String, regex::Error> {
    let mut updated = content.to_string();
    for badge in badges {
        let markdown = badge.markdown();
        updated = badge
            .pattern()?
            .replace_all(&updated, regex::NoExpand(&markdown))
            .into_owned();
    }
    Ok(updated)
}

/// First whitespace-separated token that looks like a version number.
pub fn extract_version(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .map(|token| {
            token.trim_matches(|c: char| matches!(c, '(' | ')' | ',' | 'v'))
        })
        .find(|token| token.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .map(str::to_string)
}

async fn tool_version(spec: &CommandSpec) -> Option<String> {
    match run_spec_with_output(spec).await {
        Ok(output) if output.success() => extract_version(&output.stdout),
        Ok(output) => {
            debug!(
                command = %spec,
                status = %output.status,
                "version query failed"
            );
            None
        }
        Err(err) => {
            debug!(command = %spec, error = %err, "version query failed");
            None
        }
    }
}

fn version_spec(program: &str, args: &[&str]) -> CommandSpec {
    let mut spec = CommandSpec::new(program);
    spec.args = args.iter().map(|a| a.to_string()).collect();
    spec
}

/// Query the installed toolchain. Tools that cannot report a version are
/// left out, except docker which falls back to a minimum version.
///
/// `client_line` is the devpi client command line and may carry a prefix
/// such as `poetry run devpi`.
pub async fn collect_badges(
    server_program: &str,
    client_line: &str,
) -> Vec<Badge> {
    let mut badges = Vec::new();

    if let Some(version) =
        tool_version(&version_spec("rustc", &["--version"])).await
    {
        badges.push(Badge {
            label: "Rust",
            version,
            color: "orange",
            link: "https://www.rust-lang.org/",
        });
    }

    match tool_version(&version_spec(server_program, &["--version"])).await {
        Some(version) => badges.push(Badge {
            label: "DevPI",
            version,
            color: "green",
            link: "https://devpi.net/",
        }),
        None => warn!(
            program = server_program,
            "Could not determine devpi-server version"
        ),
    }

    let client_version = match CommandSpec::from_command_line(client_line) {
        Some(mut spec) => {
            spec.args.push("--version".into());
            tool_version(&spec).await
        }
        None => None,
    };
    match client_version {
        Some(version) => badges.push(Badge {
            label: "devpi-client",
            version,
            color: "green",
            link: "https://pypi.org/project/devpi-client/",
        }),
        None => warn!(
            client = client_line,
            "Could not determine devpi client version"
        ),
    }

    let docker = version_spec(
        "docker",
        &["version", "--format", "{{.Server.Version}}"],
    );
    let docker_version = run_spec_with_output(&docker)
        .await
        .ok()
        .filter(|o| o.success())
        .map(|o| o.stdout.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DOCKER_FALLBACK_VERSION.to_string());
    badges.push(Badge {
        label: "Docker",
        version: docker_version,
        color: "blue",
        link: "https://www.docker.com/",
    });

    badges
}

/// Rewrite the badges in `readme` in place.
pub async fn update_readme(readme: &Path, badges: &[Badge]) -> Result<()> {
    let content = tokio::fs::read_to_string(readme)
        .await
        .with_context(|| format!("failed to read {}", readme.display()))?;
    let updated =
        replace_badges(&content, badges).context("invalid badge pattern")?;
    tokio::fs::write(readme, updated)
        .await
        .with_context(|| format!("failed to write {}", readme.display()))?;
    Ok(())
}
