use reqwest::blocking::Client;
use serde_json::Value;

use crate::deadline::Deadline;

use super::json::{fetch_body, walk_json};
use super::{Fragment, Source, SourceError, Yield};

/// Adapter for a single URL.
///
/// The body is fetched under the scan deadline. JSON bodies are walked like
/// inline JSON data so leaf paths survive into findings; anything else is
/// scanned as one fragment.
#[derive(Debug)]
pub struct UrlSource<'a> {
    /// The URL to fetch.
    pub url: &'a str,
    /// Host patterns for nested URL fetches out of JSON bodies.
    pub fetch_url_patterns: Vec<&'a str>,
    /// Shared HTTP client.
    pub client: &'a Client,
}

impl Source for UrlSource<'_> {
    fn kind(&self) -> &'static str {
        "URL"
    }

    fn fragments(&self, deadline: &Deadline, emit: Yield<'_>) -> Result<(), SourceError> {
        let body = fetch_body(self.client, self.url, deadline)?;

        if let Ok(value) = serde_json::from_str::<Value>(&body) {
            return walk_json(&value, String::new(), deadline, &mut |path, text| {
                emit(Fragment {
                    path,
                    text: text.to_string(),
                    commit: None,
                })
            });
        }

        emit(Fragment {
            path: String::new(),
            text: body,
            commit: None,
        })
    }
}
