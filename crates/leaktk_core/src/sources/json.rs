use reqwest::blocking::Client;
use serde_json::Value;
use tracing::debug;

use crate::deadline::Deadline;

use super::{Fragment, Source, SourceError, Yield};

/// Adapter for inline JSON documents.
///
/// The document is walked depth-first and each string leaf becomes a fragment
/// whose path is the keyed path inside the document (`a.b[2]`). Strings that
/// are URLs matching one of the request's fetch patterns are additionally
/// fetched and their bodies scanned under the same path.
#[derive(Debug)]
pub struct JsonSource<'a> {
    /// The raw JSON payload.
    pub data: &'a str,
    /// Host patterns that fetched URLs must match.
    pub fetch_url_patterns: Vec<&'a str>,
    /// Shared HTTP client for URL fetches.
    pub client: &'a Client,
}

impl Source for JsonSource<'_> {
    fn kind(&self) -> &'static str {
        "JSONData"
    }

    fn fragments(&self, deadline: &Deadline, emit: Yield<'_>) -> Result<(), SourceError> {
        let value: Value = serde_json::from_str(self.data)?;
        walk_json(&value, String::new(), deadline, &mut |path, text| {
            emit(Fragment {
                path: path.clone(),
                text: text.to_string(),
                commit: None,
            })?;

            if should_fetch(text, &self.fetch_url_patterns) {
                match fetch_body(self.client, text, deadline) {
                    Ok(body) => emit(Fragment {
                        path,
                        text: body,
                        commit: None,
                    })?,
                    Err(err) => debug!(url = text, error = %err, "could not fetch url from JSON data"),
                }
            }

            Ok(())
        })
    }
}

/// Walks a JSON value, invoking `visit` with `(path, leaf_text)` for every
/// string leaf. Numbers and booleans cannot carry secrets and are skipped.
pub(super) fn walk_json(
    value: &Value,
    path: String,
    deadline: &Deadline,
    visit: &mut dyn FnMut(String, &str) -> Result<(), SourceError>,
) -> Result<(), SourceError> {
    deadline.check()?;

    match value {
        Value::String(s) => visit(path, s),
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                walk_json(item, format!("{path}[{index}]"), deadline, visit)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (key, item) in map {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                walk_json(item, child, deadline, visit)?;
            }
            Ok(())
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => Ok(()),
    }
}

/// A URL is fetched when it is http(s) and its host matches one of the
/// configured patterns exactly or as a subdomain.
pub(super) fn should_fetch(candidate: &str, patterns: &[&str]) -> bool {
    if patterns.is_empty() || !(candidate.starts_with("http://") || candidate.starts_with("https://")) {
        return false;
    }

    let Some(host) = host_of(candidate) else {
        return false;
    };

    patterns
        .iter()
        .any(|pattern| host == *pattern || host.ends_with(&format!(".{pattern}")))
}

fn host_of(url: &str) -> Option<&str> {
    let rest = url.split_once("://")?.1;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    Some(host.split(':').next().unwrap_or(host))
}

pub(super) fn fetch_body(client: &Client, url: &str, deadline: &Deadline) -> Result<String, SourceError> {
    deadline.check()?;

    let mut request = client.get(url);
    if let Some(remaining) = deadline.remaining() {
        request = request.timeout(remaining);
    }

    Ok(request.send()?.error_for_status()?.text()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(data: &str) -> Vec<(String, String)> {
        let value: Value = serde_json::from_str(data).unwrap();
        let mut out = Vec::new();
        walk_json(&value, String::new(), &Deadline::none(), &mut |path, text| {
            out.push((path, text.to_string()));
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn walk_paths_use_dots_and_indexes() {
        let leaves = collect(r#"{"a":{"b":["x","y"]},"value":"z"}"#);
        assert_eq!(
            leaves,
            [
                ("a.b[0]".to_string(), "x".to_string()),
                ("a.b[1]".to_string(), "y".to_string()),
                ("value".to_string(), "z".to_string()),
            ]
        );
    }

    #[test]
    fn walk_skips_non_string_leaves() {
        let leaves = collect(r#"{"n":42,"b":true,"nil":null,"s":"keep"}"#);
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].0, "s");
    }

    #[test]
    fn root_string_has_empty_path() {
        let leaves = collect(r#""bare""#);
        assert_eq!(leaves, [(String::new(), "bare".to_string())]);
    }

    #[test]
    fn invalid_json_is_a_decode_error() {
        let client = Client::new();
        let source = JsonSource {
            data: "not json",
            fetch_url_patterns: Vec::new(),
            client: &client,
        };
        let result = source.fragments(&Deadline::none(), &mut |_| Ok(()));
        assert!(matches!(result, Err(SourceError::Json(_))));
    }

    #[test]
    fn should_fetch_requires_pattern_and_scheme() {
        assert!(!should_fetch("https://example.com/x", &[]));
        assert!(!should_fetch("ftp://example.com/x", &["example.com"]));
        assert!(should_fetch("https://example.com/x", &["example.com"]));
        assert!(should_fetch("https://api.example.com/x", &["example.com"]));
        assert!(!should_fetch("https://notexample.com/x", &["example.com"]));
    }

    #[test]
    fn host_of_strips_port_and_userinfo() {
        assert_eq!(host_of("https://user:pw@example.com:8443/p"), Some("example.com"));
        assert_eq!(host_of("http://example.com"), Some("example.com"));
    }
}
