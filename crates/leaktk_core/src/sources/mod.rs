//! Resource adapters.
//!
//! Each request kind has one adapter that materialises the resource as a lazy
//! sequence of [`Fragment`]s for the detector. Adapters own the messy parts:
//! walking trees, fetching URLs, traversing container manifests, and reading
//! git history.

mod container;
mod files;
mod git;
mod json;
mod text;
mod url;

use crate::deadline::{Deadline, DeadlineExceeded};

pub use container::ContainerImageSource;
pub use files::FilesSource;
pub use git::GitSource;
pub use json::JsonSource;
pub use text::TextSource;
pub use url::UrlSource;

/// Errors raised while materialising or walking a resource.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The scan deadline expired mid-walk.
    #[error(transparent)]
    Timeout(#[from] DeadlineExceeded),

    /// A file or directory could not be read.
    #[error("could not read resource: {0}")]
    Io(#[from] std::io::Error),

    /// An HTTP fetch failed.
    #[error("fetch failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Inline JSON data could not be parsed.
    #[error("could not parse JSON data: {0}")]
    Json(#[from] serde_json::Error),

    /// A git repository could not be opened or walked.
    #[error("git error: {0}")]
    Git(String),

    /// A container image reference could not be parsed.
    #[error("could not parse image reference: image={0:?}")]
    ImageRef(String),

    /// The container registry rejected or garbled a request.
    #[error("registry error: {0}")]
    Registry(String),

    /// A request option could not be interpreted.
    #[error("could not parse option: {name}={value:?}")]
    Option {
        /// Option name.
        name: &'static str,
        /// The rejected value.
        value: String,
    },
}

/// Commit-style provenance attached to a fragment when the resource has it.
///
/// Git adapters fill this from commit signatures; the container adapter fills
/// it from image config history.
#[derive(Debug, Clone, Default)]
pub struct CommitInfo {
    /// Commit SHA or layer/config digest.
    pub sha: String,
    /// Author name.
    pub author: String,
    /// Author email.
    pub email: String,
    /// RFC 3339 creation time.
    pub date: String,
    /// First line of the commit message, when there is one.
    pub message: String,
}

/// A scannable unit of text with its position inside the resource.
#[derive(Debug, Clone, Default)]
pub struct Fragment {
    /// Path of this fragment within the resource. Empty for inline payloads.
    pub path: String,
    /// The text to scan.
    pub text: String,
    /// Provenance, when the adapter knows it.
    pub commit: Option<CommitInfo>,
}

/// Callback receiving fragments one at a time. Returning an error aborts the
/// walk and propagates out of [`Source::fragments`].
pub type Yield<'a> = &'a mut dyn FnMut(Fragment) -> Result<(), SourceError>;

/// Capability interface implemented once per request kind.
pub trait Source {
    /// Short adapter name used in logs.
    fn kind(&self) -> &'static str;

    /// Materialises the resource and yields its fragments in order.
    fn fragments(&self, deadline: &Deadline, emit: Yield<'_>) -> Result<(), SourceError>;
}

/// NUL-probe over the head of `data`, mirroring git's binary heuristic.
pub(crate) fn is_binary(data: &[u8]) -> bool {
    const CHECK_LIMIT: usize = 8000;
    data[..data.len().min(CHECK_LIMIT)].contains(&0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_probe_finds_nul_bytes() {
        assert!(is_binary(b"abc\0def"));
        assert!(!is_binary(b"plain text"));
        assert!(!is_binary(b""));
    }

    #[test]
    fn binary_probe_only_checks_the_head() {
        let mut data = vec![b'a'; 9000];
        data.push(0);
        assert!(!is_binary(&data));
    }
}
