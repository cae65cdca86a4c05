//! The request/response wire contract between clients and the engine.
//!
//! Everything here serialises as JSON. Request kinds travel as text labels
//! and unknown labels are a decode failure, not a runtime one: a request
//! either enters the engine fully typed or never enters it at all.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Response kind attached to every scan response.
pub const SCAN_RESULTS_RESPONSE_KIND: &str = "ScanResults";

/// What a request's `resource` field describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// A container image reference to fetch and walk.
    ContainerImage,
    /// A local directory tree.
    Files,
    /// A git repository, remote URL or local path.
    GitRepo,
    /// A JSON document carried inline.
    JsonData,
    /// Raw text carried inline.
    Text,
    /// A URL to fetch and scan.
    Url,
}

impl RequestKind {
    const NAMES: [(&'static str, RequestKind); 6] = [
        ("ContainerImage", RequestKind::ContainerImage),
        ("Files", RequestKind::Files),
        ("GitRepo", RequestKind::GitRepo),
        ("JSONData", RequestKind::JsonData),
        ("Text", RequestKind::Text),
        ("URL", RequestKind::Url),
    ];

    /// The wire label for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContainerImage => "ContainerImage",
            Self::Files => "Files",
            Self::GitRepo => "GitRepo",
            Self::JsonData => "JSONData",
            Self::Text => "Text",
            Self::Url => "URL",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error produced when a kind label is not in the closed set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported request kind: kind={0:?}")]
pub struct UnknownRequestKind(pub String);

impl FromStr for RequestKind {
    type Err = UnknownRequestKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::NAMES
            .iter()
            .find(|(name, _)| *name == s)
            .map(|&(_, kind)| kind)
            .ok_or_else(|| UnknownRequestKind(s.to_string()))
    }
}

impl Serialize for RequestKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RequestKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        label.parse().map_err(D::Error::custom)
    }
}

/// Per-request options. Only a subset applies to each kind; unknown JSON
/// fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Opts {
    /// Container platform filter (e.g. `amd64`).
    pub arch: String,
    /// Git branch to clone and scan. Empty means all refs.
    pub branch: String,
    /// History / layer depth limit. Zero means unlimited.
    pub depth: u32,
    /// Container layer digests to skip.
    pub exclusions: Vec<String>,
    /// Colon-delimited URL patterns that JSON/URL scans may fetch.
    pub fetch_urls: String,
    /// Scan the resource in place instead of materialising a copy.
    pub local: bool,
    /// Queue priority; larger drains first.
    pub priority: i32,
    /// HTTP proxy handed to `git clone`.
    pub proxy: String,
    /// Date floor (`YYYY-MM-DD`) for history and layer traversal.
    pub since: String,
    /// Scan the staged (index vs HEAD) delta of a local repository.
    pub staged: bool,
    /// Scan the unstaged (worktree vs index) delta of a local repository.
    pub unstaged: bool,
}

impl Opts {
    /// Splits `fetch_urls` into its colon-delimited patterns.
    #[must_use]
    pub fn fetch_url_patterns(&self) -> Vec<&str> {
        if self.fetch_urls.is_empty() {
            Vec::new()
        } else {
            self.fetch_urls.split(':').collect()
        }
    }
}

/// A scan request. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    /// Client-chosen opaque ID used for correlation and logging.
    pub id: String,
    /// What `resource` describes.
    pub kind: RequestKind,
    /// The resource itself: URL, path, image ref, or raw payload.
    pub resource: String,
    /// Kind-specific options.
    #[serde(rename = "options")]
    pub opts: Opts,
}

impl<'de> Deserialize<'de> for Request {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Shadow {
            #[serde(default)]
            id: String,
            kind: RequestKind,
            #[serde(default)]
            resource: String,
            #[serde(default, rename = "options")]
            opts: Opts,
        }

        let shadow = Shadow::deserialize(deserializer)?;
        if shadow.resource.is_empty() {
            return Err(D::Error::custom("missing required field: field=\"resource\""));
        }

        Ok(Self {
            id: shadow.id,
            kind: shadow.kind,
            resource: shadow.resource,
            opts: shadow.opts,
        })
    }
}

/// Closed set of response error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// No error.
    None,
    /// Clone failed.
    CloneError,
    /// Could not load pattern config.
    ConfigError,
    /// Local scans not allowed.
    LocalScanNotAllowed,
    /// Scan backend failed.
    ScanError,
    /// Resource-path resolution failed.
    SourceError,
    /// Operation timed out.
    Timeout,
}

impl ErrorCode {
    /// The numeric wire value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::CloneError => 1,
            Self::ConfigError => 2,
            Self::LocalScanNotAllowed => 3,
            Self::ScanError => 4,
            Self::SourceError => 5,
            Self::Timeout => 6,
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(Self::None),
            1 => Ok(Self::CloneError),
            2 => Ok(Self::ConfigError),
            3 => Ok(Self::LocalScanNotAllowed),
            4 => Ok(Self::ScanError),
            5 => Ok(Self::SourceError),
            6 => Ok(Self::Timeout),
            other => Err(D::Error::custom(format!("unknown error code: {other}"))),
        }
    }
}

/// Carried in a response when a scan failed or partially failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    /// One of the closed set of codes.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional structured context (usually the originating request).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} code={}", self.message, self.code.as_u8())
    }
}

/// The engine's answer to a request: at most one per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Engine-generated response ID.
    pub id: String,
    /// Always [`SCAN_RESULTS_RESPONSE_KIND`].
    pub kind: String,
    /// Echoes the originating request's ID.
    pub request_id: String,
    /// Findings in detector order. May be non-empty even when `error` is
    /// set, for backend failures that produced partial results.
    pub results: Vec<ScanResult>,
    /// Present when the scan failed or partially failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

/// Kind of a single finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultKind {
    /// A finding with no richer provenance.
    Generic,
    /// Found inside a container layer filesystem.
    ContainerLayer,
    /// Found in container manifest/config metadata.
    ContainerMetadata,
    /// Found in a git commit.
    GitCommit,
}

/// One finding, mapped from the detector's internal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    /// Deterministic hash of (resource, version, path, span, rule).
    pub id: String,
    /// Finding provenance kind.
    pub kind: ResultKind,
    /// The secret itself.
    pub secret: String,
    /// The full regex match around the secret.
    #[serde(rename = "match")]
    pub match_text: String,
    /// The line the match occurred on.
    pub context: String,
    /// Shannon entropy of the secret.
    pub entropy: f32,
    /// When the containing commit/layer was created, if known.
    pub date: String,
    /// The rule that fired.
    pub rule: Rule,
    /// Author contact, when the resource carries one.
    pub contact: Contact,
    /// Where in the resource the secret sits.
    pub location: Location,
    /// Kind-specific enrichments.
    pub notes: BTreeMap<String, String>,
}

/// Identifying metadata of the rule behind a finding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rule {
    /// Rule identifier from the pattern config.
    pub id: String,
    /// Human description of what the rule detects.
    pub description: String,
    /// Rule tags from the pattern config.
    pub tags: Vec<String>,
}

/// Contact details attached to a finding when available.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Contact {
    /// Author name.
    pub name: String,
    /// Author email.
    pub email: String,
}

/// Line/column coordinates of a finding.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Point {
    /// 1-indexed line.
    pub line: u32,
    /// 1-indexed column.
    pub column: u32,
}

/// Position of a finding within the scanned resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Location {
    /// Commit SHA, layer digest, or other resource version.
    pub version: String,
    /// Path within the resource.
    pub path: String,
    /// Match start.
    pub start: Point,
    /// Match end.
    pub end: Point,
}
