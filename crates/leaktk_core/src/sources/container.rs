use std::io::Read;

use chrono::{DateTime, NaiveDate};
use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::debug;

use crate::deadline::Deadline;

use super::{CommitInfo, Fragment, Source, SourceError, Yield, is_binary};

const DEFAULT_REGISTRY: &str = "registry-1.docker.io";
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json";

const TAR_BLOCK_LEN: usize = 512;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Adapter for a container image reference.
///
/// Resolves the reference against the OCI distribution API. Manifest lists
/// fan out per platform (filtered by `arch` when set); each image manifest is
/// scanned as metadata and its layers are fetched, decompressed, and walked
/// as tar streams.
#[derive(Debug)]
pub struct ContainerImageSource<'a> {
    /// Raw image reference, with or without a `docker://` prefix.
    pub image_ref: &'a str,
    /// Platform filter; empty walks every platform of a manifest list.
    pub arch: &'a str,
    /// Maximum number of layers to scan per image. Zero is unlimited.
    pub depth: u32,
    /// Date floor (`YYYY-MM-DD`) compared against OCI history timestamps.
    pub since: &'a str,
    /// Layer digests (hex) to skip.
    pub exclusions: &'a [String],
    /// Nested archive recursion budget.
    pub max_archive_depth: u32,
    /// Shared HTTP client.
    pub client: &'a Client,
}

#[derive(Debug, PartialEq, Eq)]
struct ImageRef {
    registry: String,
    repository: String,
    reference: String,
}

#[derive(Deserialize)]
struct ManifestList {
    manifests: Vec<ManifestEntry>,
}

#[derive(Deserialize)]
struct ManifestEntry {
    digest: String,
    platform: Option<Platform>,
}

#[derive(Deserialize)]
struct Platform {
    architecture: String,
}

#[derive(Deserialize)]
struct ImageManifest {
    config: Descriptor,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(Default, Deserialize)]
struct ImageConfig {
    #[serde(default)]
    author: String,
    #[serde(default)]
    created: String,
    #[serde(default)]
    history: Vec<HistoryEntry>,
}

#[derive(Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    created: String,
    #[serde(default)]
    empty_layer: bool,
}

impl Source for ContainerImageSource<'_> {
    fn kind(&self) -> &'static str {
        "ContainerImage"
    }

    fn fragments(&self, deadline: &Deadline, emit: Yield<'_>) -> Result<(), SourceError> {
        let image = parse_image_ref(self.image_ref)?;
        let since = parse_since_floor(self.since)?;

        let mut registry = RegistryClient {
            client: self.client,
            registry: image.registry,
            repository: image.repository,
            token: None,
        };

        self.scan_manifest(&mut registry, &image.reference, "", since, deadline, emit)
    }
}

impl ContainerImageSource<'_> {
    fn scan_manifest(
        &self,
        registry: &mut RegistryClient<'_>,
        reference: &str,
        prefix: &str,
        since: Option<NaiveDate>,
        deadline: &Deadline,
        emit: Yield<'_>,
    ) -> Result<(), SourceError> {
        let raw_manifest = registry.get_manifest(reference, deadline)?;
        let value: serde_json::Value = serde_json::from_str(&raw_manifest)
            .map_err(|err| SourceError::Registry(format!("could not parse manifest: {err}")))?;

        if value.get("manifests").is_some() {
            let list: ManifestList = serde_json::from_value(value)
                .map_err(|err| SourceError::Registry(format!("could not parse manifest list: {err}")))?;

            for entry in list.manifests {
                if !self.arch.is_empty()
                    && entry.platform.as_ref().is_none_or(|p| p.architecture != self.arch)
                {
                    continue;
                }

                let child_prefix = format!("manifests/{}", entry.digest);
                self.scan_manifest(registry, &entry.digest, &child_prefix, since, deadline, emit)?;
            }

            return Ok(());
        }

        let manifest: ImageManifest = serde_json::from_value(value)
            .map_err(|err| SourceError::Registry(format!("could not parse image manifest: {err}")))?;

        let config = match registry.get_blob(&manifest.config.digest, deadline) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(err) => {
                debug!(error = %err, "could not fetch image config");
                ImageConfig::default()
            }
        };

        let (author, email) = split_author(&config.author);
        let base_commit = CommitInfo {
            sha: manifest.config.digest.clone(),
            author,
            email,
            date: config.created.clone(),
            message: String::new(),
        };

        emit(Fragment {
            path: join_path(prefix, "manifest"),
            text: raw_manifest,
            commit: Some(base_commit.clone()),
        })?;

        let histories: Vec<&HistoryEntry> = config.history.iter().filter(|h| !h.empty_layer).collect();
        let check_since = since.is_some() && histories.len() == manifest.layers.len();

        let mut current_depth = 0u32;
        for (index, layer) in manifest.layers.iter().enumerate() {
            deadline.check()?;

            current_depth += 1;
            if self.depth > 0 && current_depth > self.depth {
                debug!(digest = %layer.digest, max_depth = self.depth, "layer depth exceeded");
                break;
            }

            if check_since
                && let Some(floor) = since
                && layer_older_than(histories[index], floor)
            {
                debug!(digest = %layer.digest, "skipping layer older than provided date");
                continue;
            }

            let hex_digest = layer.digest.strip_prefix("sha256:").unwrap_or(&layer.digest);
            if self.exclusions.iter().any(|e| e == hex_digest || e == &layer.digest) {
                debug!(digest = %layer.digest, "skipping layer in exclusions list");
                continue;
            }

            debug!(digest = %layer.digest, "downloading container layer blob");
            let blob = registry.get_blob(&layer.digest, deadline)?;

            let layer_commit = CommitInfo {
                sha: layer.digest.clone(),
                ..base_commit.clone()
            };
            let base_path = join_path(prefix, &format!("layers/{}", layer.digest));
            scan_blob(&blob, &base_path, self.max_archive_depth, &layer_commit, deadline, emit)?;
        }

        Ok(())
    }
}

/// Scans a layer blob: gunzip when gzip magic is present, walk tar content
/// entry by entry, and fall back to plain text for anything else.
fn scan_blob(
    blob: &[u8],
    base_path: &str,
    archive_depth: u32,
    commit: &CommitInfo,
    deadline: &Deadline,
    emit: Yield<'_>,
) -> Result<(), SourceError> {
    let data = if blob.starts_with(&GZIP_MAGIC) {
        let mut decoded = Vec::new();
        match GzDecoder::new(blob).read_to_end(&mut decoded) {
            Ok(_) => decoded,
            Err(err) => {
                debug!(path = base_path, error = %err, "could not decompress blob");
                return Ok(());
            }
        }
    } else {
        blob.to_vec()
    };

    if looks_like_tar(&data) {
        return walk_tar(&data, base_path, archive_depth, commit, deadline, emit);
    }

    if !is_binary(&data) {
        emit(Fragment {
            path: base_path.to_string(),
            text: String::from_utf8_lossy(&data).into_owned(),
            commit: Some(commit.clone()),
        })?;
    }

    Ok(())
}

fn looks_like_tar(data: &[u8]) -> bool {
    data.len() >= TAR_BLOCK_LEN && &data[257..262] == b"ustar"
}

/// Sequential walk over 512-byte tar blocks, yielding regular file entries.
///
/// GNU longname (`L`) entries override the next header's name. Nested
/// gzip/tar entries recurse while `archive_depth` lasts. Malformed trailers
/// end the walk quietly; layers are untrusted input.
fn walk_tar(
    data: &[u8],
    base_path: &str,
    archive_depth: u32,
    commit: &CommitInfo,
    deadline: &Deadline,
    emit: Yield<'_>,
) -> Result<(), SourceError> {
    let mut offset = 0usize;
    let mut long_name: Option<String> = None;

    while offset + TAR_BLOCK_LEN <= data.len() {
        deadline.check()?;

        let header = &data[offset..offset + TAR_BLOCK_LEN];
        if header.iter().all(|&b| b == 0) {
            break;
        }

        let Some(size) = parse_octal(&header[124..136]) else {
            break;
        };
        let typeflag = header[156];

        let content_start = offset + TAR_BLOCK_LEN;
        let content_end = content_start.saturating_add(size).min(data.len());
        let content = &data[content_start.min(data.len())..content_end];

        match typeflag {
            b'L' => {
                long_name = Some(trim_nul(content).to_string());
            }
            0 | b'0' => {
                let name = long_name.take().unwrap_or_else(|| entry_name(header));
                let entry_path = format!("{base_path}!{name}");

                if archive_depth > 0 && content.starts_with(&GZIP_MAGIC) {
                    scan_blob(content, &entry_path, archive_depth - 1, commit, deadline, emit)?;
                } else if !is_binary(content) {
                    emit(Fragment {
                        path: entry_path,
                        text: String::from_utf8_lossy(content).into_owned(),
                        commit: Some(commit.clone()),
                    })?;
                }
            }
            _ => {
                long_name = None;
            }
        }

        offset = content_start + size.div_ceil(TAR_BLOCK_LEN) * TAR_BLOCK_LEN;
    }

    Ok(())
}

fn entry_name(header: &[u8]) -> String {
    let name = trim_nul(&header[0..100]);
    let prefix = trim_nul(&header[345..500]);

    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn trim_nul(bytes: &[u8]) -> std::borrow::Cow<'_, str> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end])
}

fn parse_octal(field: &[u8]) -> Option<usize> {
    let text = trim_nul(field);
    let text = text.trim_matches([' ', '\0']);
    if text.is_empty() {
        return Some(0);
    }
    usize::from_str_radix(text, 8).ok()
}

fn layer_older_than(history: &HistoryEntry, floor: NaiveDate) -> bool {
    DateTime::parse_from_rfc3339(&history.created)
        .map(|created| created.date_naive() < floor)
        .unwrap_or(false)
}

fn parse_since_floor(since: &str) -> Result<Option<NaiveDate>, SourceError> {
    if since.is_empty() {
        return Ok(None);
    }

    NaiveDate::parse_from_str(since, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| SourceError::Option {
            name: "since",
            value: since.to_string(),
        })
}

/// Splits an OCI `author` field like `Jane Doe <jane@example.com>`.
fn split_author(author: &str) -> (String, String) {
    match author.split_once('<') {
        Some((name, rest)) => (
            name.trim().to_string(),
            rest.trim_end_matches('>').trim().to_string(),
        ),
        None => (author.trim().to_string(), String::new()),
    }
}

fn join_path(prefix: &str, rest: &str) -> String {
    if prefix.is_empty() {
        rest.to_string()
    } else {
        format!("{prefix}/{rest}")
    }
}

fn parse_image_ref(raw: &str) -> Result<ImageRef, SourceError> {
    let trimmed = raw.strip_prefix("docker://").unwrap_or(raw);
    if trimmed.is_empty() {
        return Err(SourceError::ImageRef(raw.to_string()));
    }

    let (name, reference) = if let Some((name, digest)) = trimmed.split_once('@') {
        (name, digest.to_string())
    } else {
        match trimmed.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => (name, tag.to_string()),
            _ => (trimmed, "latest".to_string()),
        }
    };

    if name.is_empty() {
        return Err(SourceError::ImageRef(raw.to_string()));
    }

    let (registry, repository) = match name.split_once('/') {
        Some((host, rest)) if host.contains('.') || host.contains(':') || host == "localhost" => {
            (host.to_string(), rest.to_string())
        }
        _ => {
            let repository = if name.contains('/') {
                name.to_string()
            } else {
                format!("library/{name}")
            };
            (DEFAULT_REGISTRY.to_string(), repository)
        }
    };

    if repository.is_empty() {
        return Err(SourceError::ImageRef(raw.to_string()));
    }

    Ok(ImageRef {
        registry,
        repository,
        reference,
    })
}

struct RegistryClient<'a> {
    client: &'a Client,
    registry: String,
    repository: String,
    token: Option<String>,
}

impl RegistryClient<'_> {
    fn get_manifest(&mut self, reference: &str, deadline: &Deadline) -> Result<String, SourceError> {
        let response = self.get(&format!("manifests/{reference}"), deadline)?;
        Ok(response.text()?)
    }

    fn get_blob(&mut self, digest: &str, deadline: &Deadline) -> Result<Vec<u8>, SourceError> {
        let response = self.get(&format!("blobs/{digest}"), deadline)?;
        Ok(response.bytes()?.to_vec())
    }

    fn get(&mut self, suffix: &str, deadline: &Deadline) -> Result<reqwest::blocking::Response, SourceError> {
        deadline.check()?;

        let response = self.send(suffix, deadline)?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED && self.token.is_none() {
            let challenge = response
                .headers()
                .get("www-authenticate")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            if let Some(challenge) = challenge {
                self.token = Some(self.acquire_token(&challenge, deadline)?);
                let retry = self.send(suffix, deadline)?;
                return check_status(retry);
            }
        }

        check_status(response)
    }

    fn send(&self, suffix: &str, deadline: &Deadline) -> Result<reqwest::blocking::Response, SourceError> {
        let url = format!("https://{}/v2/{}/{}", self.registry, self.repository, suffix);

        let mut request = self.client.get(&url).header("Accept", MANIFEST_ACCEPT);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        if let Some(remaining) = deadline.remaining() {
            request = request.timeout(remaining);
        }

        Ok(request.send()?)
    }

    /// Anonymous Bearer token dance against the realm advertised in the
    /// registry's `WWW-Authenticate` challenge.
    fn acquire_token(&self, challenge: &str, deadline: &Deadline) -> Result<String, SourceError> {
        let params = parse_challenge(challenge);
        let realm = params
            .iter()
            .find(|(k, _)| k == "realm")
            .map(|(_, v)| v.clone())
            .ok_or_else(|| SourceError::Registry(format!("unsupported auth challenge: {challenge:?}")))?;

        let mut request = self.client.get(&realm);
        for (key, value) in &params {
            if key == "service" || key == "scope" {
                request = request.query(&[(key.as_str(), value.as_str())]);
            }
        }
        if let Some(remaining) = deadline.remaining() {
            request = request.timeout(remaining);
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            #[serde(default)]
            token: String,
            #[serde(default)]
            access_token: String,
        }

        let token: TokenResponse = request
            .send()?
            .error_for_status()?
            .json()
            .map_err(|err| SourceError::Registry(format!("could not parse token response: {err}")))?;

        if token.token.is_empty() {
            Ok(token.access_token)
        } else {
            Ok(token.token)
        }
    }
}

fn check_status(response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response, SourceError> {
    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::Registry(format!(
            "unexpected status code: status_code={}",
            status.as_u16()
        )));
    }
    Ok(response)
}

/// Parses `Bearer realm="…",service="…",scope="…"` into key/value pairs.
fn parse_challenge(challenge: &str) -> Vec<(String, String)> {
    let rest = challenge.strip_prefix("Bearer ").unwrap_or(challenge);
    rest.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.trim().to_string(), value.trim().trim_matches('"').to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn tar_entry(name: &str, content: &[u8]) -> Vec<u8> {
        let mut header = vec![0u8; TAR_BLOCK_LEN];
        header[0..name.len()].copy_from_slice(name.as_bytes());
        let size = format!("{:011o}\0", content.len());
        header[124..124 + size.len()].copy_from_slice(size.as_bytes());
        header[156] = b'0';
        header[257..262].copy_from_slice(b"ustar");

        let mut out = header;
        out.extend_from_slice(content);
        let padding = content.len().div_ceil(TAR_BLOCK_LEN) * TAR_BLOCK_LEN - content.len();
        out.extend(std::iter::repeat_n(0u8, padding));
        out
    }

    fn end_of_archive() -> Vec<u8> {
        vec![0u8; TAR_BLOCK_LEN * 2]
    }

    fn collect_tar(data: &[u8], depth: u32) -> Vec<(String, String)> {
        let mut out = Vec::new();
        walk_tar(
            data,
            "layers/sha256:abc",
            depth,
            &CommitInfo::default(),
            &Deadline::none(),
            &mut |f| {
                out.push((f.path, f.text));
                Ok(())
            },
        )
        .unwrap();
        out
    }

    #[test]
    fn parse_image_ref_fills_docker_hub_defaults() {
        let image = parse_image_ref("alpine").unwrap();
        assert_eq!(
            image,
            ImageRef {
                registry: DEFAULT_REGISTRY.to_string(),
                repository: "library/alpine".to_string(),
                reference: "latest".to_string(),
            }
        );
    }

    #[test]
    fn parse_image_ref_handles_registry_tag_and_digest() {
        let image = parse_image_ref("docker://quay.io/org/app:v1").unwrap();
        assert_eq!(image.registry, "quay.io");
        assert_eq!(image.repository, "org/app");
        assert_eq!(image.reference, "v1");

        let pinned = parse_image_ref("quay.io/org/app@sha256:deadbeef").unwrap();
        assert_eq!(pinned.reference, "sha256:deadbeef");

        let with_port = parse_image_ref("localhost:5000/app:dev").unwrap();
        assert_eq!(with_port.registry, "localhost:5000");
        assert_eq!(with_port.repository, "app");
    }

    #[test]
    fn parse_image_ref_rejects_empty_input() {
        assert!(parse_image_ref("").is_err());
        assert!(parse_image_ref("docker://").is_err());
    }

    #[test]
    fn walk_tar_yields_regular_files_with_bang_paths() {
        let mut archive = tar_entry("etc/config", b"token=abc123");
        archive.extend(tar_entry("var/data.bin", b"\x00\x01"));
        archive.extend(end_of_archive());

        let entries = collect_tar(&archive, 0);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "layers/sha256:abc!etc/config");
        assert_eq!(entries[0].1, "token=abc123");
    }

    #[test]
    fn walk_tar_applies_gnu_longname() {
        let long = "a/".repeat(80) + "file.txt";
        let mut header = vec![0u8; TAR_BLOCK_LEN];
        header[0..13].copy_from_slice(b"././@LongLink");
        let size = format!("{:011o}\0", long.len());
        header[124..124 + size.len()].copy_from_slice(size.as_bytes());
        header[156] = b'L';

        let mut archive = header;
        archive.extend_from_slice(long.as_bytes());
        let padding = long.len().div_ceil(TAR_BLOCK_LEN) * TAR_BLOCK_LEN - long.len();
        archive.extend(std::iter::repeat_n(0u8, padding));
        archive.extend(tar_entry("ignored", b"content"));
        archive.extend(end_of_archive());

        let entries = collect_tar(&archive, 0);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].0.ends_with(&format!("!{long}")));
    }

    #[test]
    fn walk_tar_recurses_into_gzipped_entries_within_budget() {
        let mut inner = tar_entry("nested.txt", b"inner secret");
        inner.extend(end_of_archive());

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&inner).unwrap();
        let gzipped = encoder.finish().unwrap();

        let mut archive = tar_entry("inner.tar.gz", &gzipped);
        archive.extend(end_of_archive());

        let with_budget = collect_tar(&archive, 2);
        assert_eq!(with_budget.len(), 1);
        assert!(with_budget[0].0.contains("!inner.tar.gz!nested.txt"));

        // Exhausted budget treats the entry as an opaque (binary) blob.
        let without_budget = collect_tar(&archive, 0);
        assert!(without_budget.is_empty());
    }

    #[test]
    fn parse_challenge_extracts_quoted_params() {
        let params = parse_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#,
        );
        assert!(params.contains(&("realm".to_string(), "https://auth.docker.io/token".to_string())));
        assert!(params.contains(&("service".to_string(), "registry.docker.io".to_string())));
    }

    #[test]
    fn split_author_handles_name_email_form() {
        assert_eq!(
            split_author("Jane Doe <jane@example.com>"),
            ("Jane Doe".to_string(), "jane@example.com".to_string())
        );
        assert_eq!(split_author("buildbot"), ("buildbot".to_string(), String::new()));
    }

    #[test]
    fn layer_older_than_compares_dates() {
        let floor = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let old = HistoryEntry {
            created: "2023-01-01T00:00:00Z".to_string(),
            empty_layer: false,
        };
        let new = HistoryEntry {
            created: "2024-07-01T00:00:00Z".to_string(),
            empty_layer: false,
        };
        let unparsable = HistoryEntry {
            created: String::new(),
            empty_layer: false,
        };

        assert!(layer_older_than(&old, floor));
        assert!(!layer_older_than(&new, floor));
        assert!(!layer_older_than(&unparsable, floor));
    }
}
