//! Detection pattern configuration.
//!
//! Patterns arrive as gitleaks-style TOML, either from the pattern server or
//! from an overlay file inside a scanned source tree. Parsing compiles every
//! regex up front so scan workers never see a compile failure mid-scan.

mod cache;

use std::path::PathBuf;

use regex::Regex;
use serde::Deserialize;

pub use cache::PatternCache;

/// Errors from fetching, parsing, or validating pattern configuration.
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    /// The raw config was not valid TOML.
    #[error("could not parse pattern config: {0}")]
    Toml(#[from] Box<toml::de::Error>),

    /// A rule or allowlist regex failed to compile.
    #[error("invalid regex in rule {id:?}: {source}")]
    InvalidRegex {
        /// Identifier of the rule that failed, or `"allowlist"` for a
        /// top-level allowlist pattern.
        id: String,
        /// The underlying regex compilation error.
        #[source]
        source: Box<regex::Error>,
    },

    /// The config parsed but contains neither rules nor allowlists.
    #[error("invalid pattern config: no rules or allowlists")]
    NoRulesOrAllowlists,

    /// An allowlist has no paths, regexes, stopwords, or commits.
    #[error("invalid pattern config: an allowlist exists that doesn't allow anything")]
    EmptyAllowlist,

    /// The HTTP fetch from the pattern server failed.
    #[error("pattern fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    /// The pattern server answered with a non-200 status.
    #[error("unexpected pattern server status: status_code={0}")]
    Status(u16),

    /// The on-disk config is older than `expired_after` and autofetch is off.
    #[error("pattern config is expired and autofetch is disabled: config_path={path:?}")]
    Expired {
        /// Location of the stale file.
        path: PathBuf,
    },

    /// The on-disk config could not be read or written.
    #[error("could not access pattern config: path={path:?}: {source}")]
    Io {
        /// Location of the file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Which text an allowlist regex is tested against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegexTarget {
    /// The regex match text (default).
    #[default]
    Match,
    /// The whole line containing the match.
    Line,
    /// The extracted secret.
    Secret,
}

/// A compiled allowlist: any matching dimension suppresses a finding.
#[derive(Debug, Clone)]
pub struct Allowlist {
    /// Path patterns to suppress.
    pub paths: Vec<Regex>,
    /// Content patterns to suppress, tested per [`RegexTarget`].
    pub regexes: Vec<Regex>,
    /// Lowercased substrings of the secret to suppress.
    pub stopwords: Vec<String>,
    /// Commit SHAs to suppress.
    pub commits: Vec<String>,
    /// What `regexes` are tested against.
    pub regex_target: RegexTarget,
}

/// The candidate finding fields an allowlist can veto.
#[derive(Debug, Clone, Copy)]
pub struct AllowlistContext<'a> {
    /// Path of the fragment inside the resource.
    pub path: &'a str,
    /// Commit SHA, when the fragment has one.
    pub commit: &'a str,
    /// The extracted secret.
    pub secret: &'a str,
    /// The full regex match.
    pub matched: &'a str,
    /// The line containing the match.
    pub line: &'a str,
}

impl Allowlist {
    /// Returns `true` when any dimension of this allowlist matches.
    #[must_use]
    pub fn allows(&self, ctx: &AllowlistContext<'_>) -> bool {
        if self.paths.iter().any(|p| p.is_match(ctx.path)) {
            return true;
        }

        if !ctx.commit.is_empty() && self.commits.iter().any(|c| c == ctx.commit) {
            return true;
        }

        let secret_lower = ctx.secret.to_lowercase();
        if self.stopwords.iter().any(|w| secret_lower.contains(w)) {
            return true;
        }

        let target = match self.regex_target {
            RegexTarget::Match => ctx.matched,
            RegexTarget::Line => ctx.line,
            RegexTarget::Secret => ctx.secret,
        };
        self.regexes.iter().any(|r| r.is_match(target))
    }

    fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.regexes.is_empty() && self.stopwords.is_empty() && self.commits.is_empty()
    }
}

/// A compiled detection rule.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Rule identifier (e.g. `"aws-access-key"`).
    pub id: String,
    /// Human description of what the rule detects.
    pub description: String,
    /// The secret-matching expression.
    pub regex: Regex,
    /// Capture group holding the secret; whole match when `None`.
    pub secret_group: Option<usize>,
    /// Minimum Shannon entropy for the secret, when set.
    pub entropy: Option<f64>,
    /// Restricts the rule to fragments whose path matches.
    pub path: Option<Regex>,
    /// Case-insensitive prefilter keywords; empty means always run.
    pub keywords: Vec<String>,
    /// Tags copied into findings.
    pub tags: Vec<String>,
    /// Rule-scoped allowlists.
    pub allowlists: Vec<Allowlist>,
}

/// A parsed, validated, compiled pattern configuration.
#[derive(Debug, Clone, Default)]
pub struct GitleaksConfig {
    /// Detection rules.
    pub rules: Vec<Rule>,
    /// Global allowlists applied to every rule.
    pub allowlists: Vec<Allowlist>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAllowlist {
    #[serde(default)]
    paths: Vec<String>,
    #[serde(default)]
    regexes: Vec<String>,
    #[serde(default, alias = "stopWords")]
    stopwords: Vec<String>,
    #[serde(default)]
    commits: Vec<String>,
    #[serde(default)]
    regex_target: RegexTarget,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRule {
    id: String,
    #[serde(default)]
    description: String,
    regex: String,
    #[serde(default)]
    secret_group: Option<usize>,
    #[serde(default)]
    entropy: Option<f64>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    allowlists: Vec<RawAllowlist>,
    #[serde(default)]
    allowlist: Option<RawAllowlist>,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    rules: Vec<RawRule>,
    #[serde(default)]
    allowlists: Vec<RawAllowlist>,
    // Legacy single-table form still emitted by older pattern releases.
    #[serde(default)]
    allowlist: Option<RawAllowlist>,
}

/// Parses and validates a gitleaks-style TOML pattern config.
///
/// Validation requires at least one rule or allowlist, and that every
/// top-level allowlist allows something. Regexes are compiled eagerly.
pub fn parse_config(raw: &str) -> Result<GitleaksConfig, PatternError> {
    let parsed: RawConfig = toml::from_str(raw).map_err(Box::new)?;

    let mut allowlists = Vec::with_capacity(parsed.allowlists.len() + 1);
    for raw_list in parsed.allowlist.into_iter().chain(parsed.allowlists) {
        allowlists.push(compile_allowlist(raw_list, "allowlist")?);
    }

    let rules = parsed.rules.into_iter().map(compile_rule).collect::<Result<Vec<_>, _>>()?;

    let config = GitleaksConfig { rules, allowlists };
    validate(&config)?;

    Ok(config)
}

fn validate(config: &GitleaksConfig) -> Result<(), PatternError> {
    if config.rules.is_empty() && config.allowlists.is_empty() {
        return Err(PatternError::NoRulesOrAllowlists);
    }

    if config.allowlists.iter().any(Allowlist::is_empty) {
        return Err(PatternError::EmptyAllowlist);
    }

    Ok(())
}

fn compile_rule(raw: RawRule) -> Result<Rule, PatternError> {
    let regex = compile_regex(&raw.regex, &raw.id)?;
    let path = raw.path.as_deref().map(|p| compile_regex(p, &raw.id)).transpose()?;

    let mut allowlists = Vec::with_capacity(raw.allowlists.len() + 1);
    for raw_list in raw.allowlist.into_iter().chain(raw.allowlists) {
        allowlists.push(compile_allowlist(raw_list, &raw.id)?);
    }

    Ok(Rule {
        keywords: raw.keywords.iter().map(|k| k.to_lowercase()).collect(),
        id: raw.id,
        description: raw.description,
        regex,
        secret_group: raw.secret_group,
        entropy: raw.entropy,
        path,
        tags: raw.tags,
        allowlists,
    })
}

fn compile_allowlist(raw: RawAllowlist, rule_id: &str) -> Result<Allowlist, PatternError> {
    Ok(Allowlist {
        paths: raw
            .paths
            .iter()
            .map(|p| compile_regex(p, rule_id))
            .collect::<Result<_, _>>()?,
        regexes: raw
            .regexes
            .iter()
            .map(|r| compile_regex(r, rule_id))
            .collect::<Result<_, _>>()?,
        stopwords: raw.stopwords.iter().map(|w| w.to_lowercase()).collect(),
        commits: raw.commits,
        regex_target: raw.regex_target,
    })
}

fn compile_regex(pattern: &str, id: &str) -> Result<Regex, PatternError> {
    Regex::new(pattern).map_err(|source| PatternError::InvalidRegex {
        id: id.to_string(),
        source: Box::new(source),
    })
}
