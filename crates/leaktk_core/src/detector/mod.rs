//! The secret detection backend.
//!
//! A [`Detector`] is built per scan from the current pattern configuration
//! and run over every fragment an adapter yields. Detection is line-based:
//! keyword pre-filtering picks the plausible rules for a fragment, regexes
//! confirm, entropy floors and allowlists veto.

mod entropy;
mod overlay;

use std::collections::HashSet;
use std::sync::Arc;

use aho_corasick::AhoCorasick;
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use regex::Regex;
use tracing::trace;

use crate::pattern::{Allowlist, AllowlistContext, GitleaksConfig, Rule};
use crate::sources::Fragment;

pub use entropy::shannon_entropy;

/// Minimum length of a base64 run worth decoding.
const BASE64_MIN_LEN: usize = 20;

/// One detected secret, before protocol mapping.
#[derive(Debug, Clone)]
pub struct Finding {
    /// Identifier of the rule that fired.
    pub rule_id: String,
    /// Rule description.
    pub description: String,
    /// Rule tags.
    pub tags: Vec<String>,
    /// The extracted secret.
    pub secret: String,
    /// The full regex match.
    pub matched: String,
    /// The line containing the match.
    pub line: String,
    /// Shannon entropy of the secret.
    pub entropy: f32,
    /// Fragment path within the resource.
    pub path: String,
    /// 1-indexed match start line.
    pub start_line: u32,
    /// 1-indexed match start column.
    pub start_column: u32,
    /// 1-indexed match end line.
    pub end_line: u32,
    /// 1-indexed match end column.
    pub end_column: u32,
    /// Commit SHA, when the fragment carried provenance.
    pub commit: String,
    /// Author name from the fragment's provenance.
    pub author: String,
    /// Author email from the fragment's provenance.
    pub email: String,
    /// Creation date from the fragment's provenance.
    pub date: String,
    /// Commit message from the fragment's provenance.
    pub message: String,
    /// Gitleaks-style fingerprint used by ignore files and baselines.
    pub fingerprint: String,
}

/// Matches fragments against a compiled pattern configuration.
pub struct Detector {
    config: Arc<GitleaksConfig>,
    extra_allowlists: Vec<Allowlist>,
    ignored_fingerprints: HashSet<String>,
    keyword_automaton: Option<AhoCorasick>,
    keyword_to_rules: Vec<Vec<usize>>,
    rules_without_keywords: Vec<usize>,
    base64_run: Regex,
    max_decode_depth: u32,
}

impl std::fmt::Debug for Detector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detector")
            .field("rules", &self.config.rules.len())
            .field("ignored_fingerprints", &self.ignored_fingerprints.len())
            .finish_non_exhaustive()
    }
}

impl Detector {
    /// Builds a detector from a pattern configuration.
    ///
    /// `max_decode_depth` bounds recursive base64 decoding; zero disables it.
    #[must_use]
    pub fn new(config: Arc<GitleaksConfig>, max_decode_depth: u32) -> Self {
        let keyword_index = build_keyword_index(&config.rules);

        Self {
            config,
            extra_allowlists: Vec::new(),
            ignored_fingerprints: HashSet::new(),
            keyword_automaton: keyword_index.automaton,
            keyword_to_rules: keyword_index.keyword_to_rules,
            rules_without_keywords: keyword_index.rules_without_keywords,
            // '=' padding is only valid at the end of a run.
            base64_run: Regex::new(r"[A-Za-z0-9+/]{20,}={0,2}").expect("static base64 regex"),
            max_decode_depth,
        }
    }

    /// Suppresses findings whose fingerprint is in `fingerprints`.
    pub fn ignore_fingerprints<I: IntoIterator<Item = String>>(&mut self, fingerprints: I) {
        self.ignored_fingerprints.extend(fingerprints);
    }

    /// Additively extends the global allowlists (source-tree overlays).
    pub fn extend_allowlists<I: IntoIterator<Item = Allowlist>>(&mut self, allowlists: I) {
        self.extra_allowlists.extend(allowlists);
    }

    /// Scans one fragment, appending findings in match order.
    pub fn scan_fragment(&self, fragment: &Fragment, out: &mut Vec<Finding>) {
        trace!(
            path = %fragment.path,
            size = fragment.text.len(),
            "scanning fragment"
        );

        for (index, line) in fragment.text.lines().enumerate() {
            let line_number = (index + 1) as u32;
            self.scan_line(fragment, line, line_number, self.max_decode_depth, out);
        }
    }

    fn scan_line(&self, fragment: &Fragment, line: &str, line_number: u32, decode_budget: u32, out: &mut Vec<Finding>) {
        // Keyword selection runs per line so decoded payloads get their own
        // pass; a keyword hidden inside base64 is invisible until decoding.
        for rule_index in self.select_rules(line) {
            let rule = &self.config.rules[rule_index];

            if let Some(path_re) = &rule.path
                && !path_re.is_match(&fragment.path)
            {
                continue;
            }

            self.apply_rule(fragment, rule, line, line_number, out);
        }

        if decode_budget == 0 {
            return;
        }

        // Secrets hide inside base64 payloads embedded in otherwise plain
        // text. Decode printable runs and rescan the result against the
        // enclosing line's coordinates.
        for candidate in self.base64_run.find_iter(line) {
            if candidate.len() < BASE64_MIN_LEN {
                continue;
            }

            let Some(decoded) = decode_base64(candidate.as_str()) else {
                continue;
            };

            for decoded_line in decoded.lines() {
                self.scan_line(fragment, decoded_line, line_number, decode_budget - 1, out);
            }
        }
    }

    fn apply_rule(
        &self,
        fragment: &Fragment,
        rule: &Rule,
        line: &str,
        line_number: u32,
        out: &mut Vec<Finding>,
    ) {
        for captures in rule.regex.captures_iter(line) {
            let Some(matched) = captures.get(0) else {
                continue;
            };

            let secret = rule
                .secret_group
                .and_then(|group| captures.get(group))
                .unwrap_or(matched)
                .as_str();

            let entropy = shannon_entropy(secret);
            if let Some(floor) = rule.entropy
                && entropy < floor
            {
                continue;
            }

            let commit = fragment.commit.as_ref();
            let ctx = AllowlistContext {
                path: &fragment.path,
                commit: commit.map_or("", |c| c.sha.as_str()),
                secret,
                matched: matched.as_str(),
                line,
            };

            if self.is_allowed(rule, &ctx) {
                continue;
            }

            let fingerprint = fingerprint(ctx.commit, &fragment.path, &rule.id, line_number);
            if self.ignored_fingerprints.contains(&fingerprint) {
                continue;
            }

            out.push(Finding {
                rule_id: rule.id.clone(),
                description: rule.description.clone(),
                tags: rule.tags.clone(),
                secret: secret.to_string(),
                matched: matched.as_str().to_string(),
                line: line.to_string(),
                entropy: entropy as f32,
                path: fragment.path.clone(),
                start_line: line_number,
                start_column: (matched.start() + 1) as u32,
                end_line: line_number,
                end_column: matched.end() as u32,
                commit: commit.map_or_else(String::new, |c| c.sha.clone()),
                author: commit.map_or_else(String::new, |c| c.author.clone()),
                email: commit.map_or_else(String::new, |c| c.email.clone()),
                date: commit.map_or_else(String::new, |c| c.date.clone()),
                message: commit.map_or_else(String::new, |c| c.message.clone()),
                fingerprint,
            });
        }
    }

    fn is_allowed(&self, rule: &Rule, ctx: &AllowlistContext<'_>) -> bool {
        self.config.allowlists.iter().any(|list| list.allows(ctx))
            || self.extra_allowlists.iter().any(|list| list.allows(ctx))
            || rule.allowlists.iter().any(|list| list.allows(ctx))
    }

    /// Picks the rules worth running for `text`: every keyword-less rule plus
    /// the rules whose keywords appear.
    fn select_rules(&self, text: &str) -> Vec<usize> {
        let mut selected: Vec<usize> = self.rules_without_keywords.clone();

        if let Some(automaton) = &self.keyword_automaton {
            let mut seen: HashSet<usize> = selected.iter().copied().collect();
            for mat in automaton.find_iter(text) {
                for &rule_index in &self.keyword_to_rules[mat.pattern().as_usize()] {
                    if seen.insert(rule_index) {
                        selected.push(rule_index);
                    }
                }
            }
        }

        selected.sort_unstable();
        selected
    }
}

/// Gitleaks fingerprint: `commit:file:rule:line`, without the commit segment
/// for uncommitted content.
#[must_use]
pub fn fingerprint(commit: &str, path: &str, rule_id: &str, line: u32) -> String {
    if commit.is_empty() {
        format!("{path}:{rule_id}:{line}")
    } else {
        format!("{commit}:{path}:{rule_id}:{line}")
    }
}

fn decode_base64(candidate: &str) -> Option<String> {
    let decoded = STANDARD
        .decode(candidate)
        .or_else(|_| STANDARD_NO_PAD.decode(candidate.trim_end_matches('=')))
        .ok()?;
    String::from_utf8(decoded).ok()
}

struct KeywordIndex {
    automaton: Option<AhoCorasick>,
    keyword_to_rules: Vec<Vec<usize>>,
    rules_without_keywords: Vec<usize>,
}

fn build_keyword_index(rules: &[Rule]) -> KeywordIndex {
    let mut keywords: Vec<String> = Vec::new();
    let mut keyword_to_rules: Vec<Vec<usize>> = Vec::new();
    let mut positions: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    let mut rules_without_keywords = Vec::new();

    for (rule_index, rule) in rules.iter().enumerate() {
        if rule.keywords.is_empty() {
            rules_without_keywords.push(rule_index);
            continue;
        }

        for keyword in &rule.keywords {
            if let Some(&existing) = positions.get(keyword.as_str()) {
                keyword_to_rules[existing].push(rule_index);
            } else {
                positions.insert(keyword, keywords.len());
                keywords.push(keyword.clone());
                keyword_to_rules.push(vec![rule_index]);
            }
        }
    }

    let automaton = if keywords.is_empty() {
        None
    } else {
        AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(&keywords)
            .ok()
    };

    KeywordIndex {
        automaton,
        keyword_to_rules,
        rules_without_keywords,
    }
}
