use url::Url;

/// Parse a boolean value from a raw string, accepting common env-style forms.
///
/// Accepted truthy values (case-insensitive): `"1"`, `"true"`, `"yes"`, `"on"`.
/// Accepted falsy values: `"0"`, `"false"`, `"no"`, `"off"`.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `value_parser` adapter for [`parse_bool`].
pub fn parse_bool_arg(raw: &str) -> Result<bool, String> {
    parse_bool(raw).ok_or_else(|| {
        format!("expected one of 1/true/yes/on or 0/false/no/off, got '{raw}'")
    })
}

/// Whether an environment key names something that must not be logged.
pub fn is_secret_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    ["PASSWORD", "SECRET", "TOKEN"]
        .iter()
        .any(|needle| upper.contains(needle))
}

/// Append `path` to `base` without the last-segment replacement that
/// [`Url::join`] performs on bases lacking a trailing slash.
pub fn endpoint(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    let base = base.as_str().trim_end_matches('/');
    let path = path.trim_start_matches('/');
    Url::parse(&format!("{base}/{path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_env_forms() {
        for raw in ["1", "true", "TRUE", "yes", "On", " true "] {
            assert_eq!(parse_bool(raw), Some(true), "{raw}");
        }
        for raw in ["0", "false", "False", "no", "off"] {
            assert_eq!(parse_bool(raw), Some(false), "{raw}");
        }
        assert_eq!(parse_bool("maybe"), None);
        assert!(parse_bool_arg("maybe").is_err());
    }

    #[test]
    fn secret_keys_are_detected() {
        assert!(is_secret_key("DEVPI_PASSWORD"));
        assert!(is_secret_key("devpi_secondary_password"));
        assert!(is_secret_key("GITHUB_TOKEN"));
        assert!(!is_secret_key("DEVPI_USER"));
        assert!(!is_secret_key("PORT"));
    }

    #[test]
    fn endpoint_appends_below_base_path() {
        let root = Url::parse("http://0.0.0.0:3141").unwrap();
        assert_eq!(
            endpoint(&root, "+api").unwrap().as_str(),
            "http://0.0.0.0:3141/+api"
        );

        let nested = Url::parse("http://localhost:3141/devpi").unwrap();
        assert_eq!(
            endpoint(&nested, "/alice/internal").unwrap().as_str(),
            "http://localhost:3141/devpi/alice/internal"
        );
    }
}
