//! The scan dispatcher.
//!
//! Owns both priority queues and a pool of worker threads. Each worker takes
//! one request at a time: derive a deadline, load patterns, build a detector,
//! route on the request kind, and push exactly one response carrying the
//! request's priority and ID.

mod git_cmd;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::Config;
use crate::deadline::Deadline;
use crate::detector::{Detector, Finding};
use crate::id;
use crate::pattern::PatternCache;
use crate::proto::{
    Contact, ErrorCode, Location, Opts, Point, Request, RequestKind, Response, ResponseError, ResultKind, Rule,
    SCAN_RESULTS_RESPONSE_KIND, ScanResult,
};
use crate::queue::{Message, PriorityQueue};
use crate::sources::{
    ContainerImageSource, FilesSource, GitSource, JsonSource, Source, SourceError, TextSource, UrlSource,
};

pub use git_cmd::{CloneError, clone_depth, scan_depth};

const INIT_QUEUE_CAPACITY: usize = 1024;

/// Errors from constructing the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The shared HTTP client could not be initialised.
    #[error("failed to initialize HTTP client: {0}")]
    ClientInit(#[from] reqwest::Error),
}

/// The scan orchestration engine.
///
/// Requests enter through [`Scanner::send`] and drain into worker threads by
/// priority; responses leave through [`Scanner::recv`] the same way. A
/// response is emitted for every request that enters the engine, and never
/// more than one. Submission order is not preserved: priority dominates on
/// both paths.
pub struct Scanner {
    inner: Arc<Inner>,
}

struct Inner {
    allow_local: bool,
    scan_timeout: Duration,
    clones_dir: PathBuf,
    max_archive_depth: u32,
    max_decode_depth: u32,
    max_scan_depth: u32,
    patterns: PatternCache,
    http: reqwest::blocking::Client,
    scan_queue: PriorityQueue<Request>,
    response_queue: PriorityQueue<Response>,
}

enum ScanFailure {
    /// Already classified; respond with this error and no results.
    Fatal(ResponseError),
    /// The backend failed mid-scan; partial findings still count.
    Backend(SourceError),
}

impl Scanner {
    /// Builds the engine and starts its worker threads.
    pub fn new(config: &Config) -> Result<Self, EngineError> {
        let scanner_config = &config.scanner;

        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("leaktk/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let inner = Arc::new(Inner {
            allow_local: scanner_config.allow_local,
            scan_timeout: Duration::from_secs(scanner_config.scan_timeout),
            clones_dir: scanner_config.workdir.join("clones"),
            max_archive_depth: scanner_config.max_archive_depth,
            max_decode_depth: scanner_config.max_decode_depth,
            max_scan_depth: scanner_config.max_scan_depth,
            patterns: PatternCache::new(scanner_config.patterns.clone(), http.clone()),
            http,
            scan_queue: PriorityQueue::new(INIT_QUEUE_CAPACITY, scanner_config.max_scan_queue_size),
            response_queue: PriorityQueue::new(INIT_QUEUE_CAPACITY, scanner_config.max_response_queue_size),
        });

        for worker in 0..scanner_config.scan_workers.max(1) {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name(format!("leaktk-scan-worker-{worker}"))
                .spawn(move || inner.listen())
                .expect("failed to spawn scan worker thread");
        }

        Ok(Self { inner })
    }

    /// Queues a request for scanning at its priority.
    pub fn send(&self, request: Request) {
        info!(
            id = %request.id,
            queue_size = self.inner.scan_queue.size() + 1,
            "queueing scan"
        );
        self.inner.scan_queue.send(Message {
            priority: request.opts.priority,
            value: request,
        });
    }

    /// Delivers responses to `handler` as workers finish, highest priority
    /// first. Blocks for the life of the process.
    pub fn recv<F>(&self, mut handler: F)
    where
        F: FnMut(Response),
    {
        self.inner.response_queue.recv(|msg| handler(msg.value));
    }
}

impl Inner {
    fn listen(&self) {
        self.scan_queue.recv(|msg| self.handle(msg));
    }

    fn handle(&self, msg: Message<Request>) {
        let priority = msg.priority;
        let request = msg.value;
        info!(id = %request.id, "starting scan");

        let deadline = Deadline::after(self.scan_timeout);

        let pattern_config = match self.patterns.load(&deadline) {
            Ok(config) => config,
            Err(err) => {
                error!(error = %err, id = %request.id, "scan failed: could not load pattern config");
                self.respond(
                    priority,
                    &request,
                    Vec::new(),
                    Some(response_error(ErrorCode::ConfigError, "could not load pattern config", &request)),
                );
                return;
            }
        };

        let mut detector = Detector::new(pattern_config, self.max_decode_depth);
        let mut findings = Vec::new();

        let failure = self
            .dispatch(&request, &deadline, &mut detector, &mut findings)
            .err();

        let scan_error = match failure {
            None => None,
            Some(ScanFailure::Fatal(response_err)) => {
                self.respond(priority, &request, Vec::new(), Some(response_err));
                return;
            }
            Some(ScanFailure::Backend(err)) => {
                if deadline.expired() {
                    self.respond(
                        priority,
                        &request,
                        Vec::new(),
                        Some(response_error(ErrorCode::Timeout, "operation timed out", &request)),
                    );
                    return;
                }

                Some(response_error(ErrorCode::ScanError, &err.to_string(), &request))
            }
        };

        let results = findings
            .into_iter()
            .map(|finding| finding_to_result(&request, finding))
            .collect();

        self.respond(priority, &request, results, scan_error);
    }

    fn dispatch(
        &self,
        request: &Request,
        deadline: &Deadline,
        detector: &mut Detector,
        findings: &mut Vec<Finding>,
    ) -> Result<(), ScanFailure> {
        match request.kind {
            RequestKind::GitRepo => self.scan_git_repo(request, deadline, detector, findings),
            RequestKind::Url => run_source(
                &UrlSource {
                    url: &request.resource,
                    fetch_url_patterns: request.opts.fetch_url_patterns(),
                    client: &self.http,
                },
                deadline,
                detector,
                findings,
            ),
            RequestKind::JsonData => run_source(
                &JsonSource {
                    data: &request.resource,
                    fetch_url_patterns: request.opts.fetch_url_patterns(),
                    client: &self.http,
                },
                deadline,
                detector,
                findings,
            ),
            RequestKind::Text => run_source(
                &TextSource {
                    text: &request.resource,
                },
                deadline,
                detector,
                findings,
            ),
            RequestKind::Files => {
                if !self.allow_local {
                    error!(id = %request.id, "scan failed: local scans not allowed");
                    return Err(ScanFailure::Fatal(local_scan_not_allowed(request)));
                }

                let root = Path::new(&request.resource);
                detector.apply_source_overlay(root);
                run_source(&FilesSource { root }, deadline, detector, findings)
            }
            RequestKind::ContainerImage => run_source(
                &ContainerImageSource {
                    image_ref: &request.resource,
                    arch: &request.opts.arch,
                    depth: request.opts.depth,
                    since: &request.opts.since,
                    exclusions: &request.opts.exclusions,
                    max_archive_depth: self.max_archive_depth,
                    client: &self.http,
                },
                deadline,
                detector,
                findings,
            ),
        }
    }

    fn scan_git_repo(
        &self,
        request: &Request,
        deadline: &Deadline,
        detector: &mut Detector,
        findings: &mut Vec<Finding>,
    ) -> Result<(), ScanFailure> {
        let opts = &request.opts;
        let mut cleanup = None;

        let (source_path, git_dir) = if !opts.local {
            match git_cmd::clone_git_repo(&self.clones_dir, &request.resource, opts, self.max_scan_depth, deadline) {
                Ok(cloned) => {
                    cleanup = Some(CloneCleanup {
                        paths: vec![cloned.source_path.clone(), cloned.git_dir.clone()],
                        request_id: request.id.clone(),
                    });
                    (cloned.source_path, cloned.git_dir)
                }
                Err(CloneError::Timeout) => {
                    return Err(ScanFailure::Fatal(response_error(
                        ErrorCode::CloneError,
                        "clone operation timed out",
                        request,
                    )));
                }
                Err(err) => {
                    error!(error = %err, id = %request.id, "scan failed: could not clone git repo");
                    return Err(ScanFailure::Fatal(response_error(
                        ErrorCode::CloneError,
                        "could not clone git repo",
                        request,
                    )));
                }
            }
        } else if !self.allow_local {
            error!(id = %request.id, "scan failed: local scans not allowed");
            return Err(ScanFailure::Fatal(local_scan_not_allowed(request)));
        } else {
            let path = PathBuf::from(&request.resource);
            (path.clone(), path)
        };

        let git_dir = match git_cmd::abs_git_dir(&git_dir, deadline) {
            Ok(path) => path,
            Err(err) => {
                error!(error = %err, id = %request.id, "scan failed: could not determine gitdir");
                return Err(ScanFailure::Fatal(response_error(
                    ErrorCode::SourceError,
                    "could not determine gitdir",
                    request,
                )));
            }
        };

        detector.apply_source_overlay(&source_path);

        let source = GitSource {
            git_dir,
            branch: opts.branch.clone(),
            depth: git_cmd::scan_depth(opts.depth, self.max_scan_depth),
            since: opts.since.clone(),
            staged: opts.staged,
            unstaged: opts.unstaged,
        };

        let outcome = run_source(&source, deadline, detector, findings);
        drop(cleanup);
        outcome
    }

    fn respond(&self, priority: i32, request: &Request, results: Vec<ScanResult>, error: Option<ResponseError>) {
        if let Some(err) = &error {
            error!(error = %err, id = %request.id, "scan error");
        }

        info!(
            id = %request.id,
            queue_size = self.response_queue.size() + 1,
            "queueing response"
        );

        self.response_queue.send(Message {
            priority,
            value: Response {
                id: id::random(),
                kind: SCAN_RESULTS_RESPONSE_KIND.to_string(),
                request_id: request.id.clone(),
                results,
                error,
            },
        });
    }
}

/// Removes materialised clone directories when the scan scope ends,
/// regardless of outcome. Local paths never get one of these.
struct CloneCleanup {
    paths: Vec<PathBuf>,
    request_id: String,
}

impl Drop for CloneCleanup {
    fn drop(&mut self) {
        for path in &self.paths {
            if path.exists()
                && let Err(err) = fs::remove_dir_all(path)
            {
                error!(
                    error = %err,
                    path = %path.display(),
                    id = %self.request_id,
                    "could not remove clone path"
                );
            }
        }
    }
}

fn run_source(
    source: &dyn Source,
    deadline: &Deadline,
    detector: &Detector,
    findings: &mut Vec<Finding>,
) -> Result<(), ScanFailure> {
    debug!(kind = source.kind(), "walking resource");
    source
        .fragments(deadline, &mut |fragment| {
            deadline.check()?;
            detector.scan_fragment(&fragment, findings);
            Ok(())
        })
        .map_err(ScanFailure::Backend)
}

fn response_error(code: ErrorCode, message: &str, request: &Request) -> ResponseError {
    ResponseError {
        code,
        message: message.to_string(),
        data: serde_json::to_value(request).ok(),
    }
}

fn local_scan_not_allowed(request: &Request) -> ResponseError {
    response_error(ErrorCode::LocalScanNotAllowed, "local scans not allowed", request)
}

fn finding_to_result(request: &Request, finding: Finding) -> ScanResult {
    let mut notes = BTreeMap::new();
    let mut kind = ResultKind::Generic;
    let mut location = Location {
        version: finding.commit.clone(),
        path: finding.path.clone(),
        start: Point {
            line: finding.start_line,
            column: finding.start_column,
        },
        end: Point {
            line: finding.end_line,
            column: finding.end_column,
        },
    };

    match request.kind {
        RequestKind::GitRepo => {
            notes.insert("gitleaks_fingerprint".to_string(), finding.fingerprint.clone());
            notes.insert("commit_message".to_string(), finding.message.clone());
            notes.insert("repository".to_string(), request.resource.clone());
            kind = ResultKind::GitCommit;
        }
        RequestKind::ContainerImage => {
            let manifest = location
                .path
                .strip_prefix("manifests/")
                .and_then(|rest| rest.split('/').next())
                .map(str::to_string);

            if location.path.contains("layers/") {
                kind = ResultKind::ContainerLayer;
                if let Some((_, entry)) = location.path.split_once('!') {
                    location.path = entry.to_string();
                }
            } else {
                kind = ResultKind::ContainerMetadata;
            }

            let image = match manifest {
                Some(manifest) => format!("{}@{manifest}", request.resource),
                None => request.resource.clone(),
            };
            notes.insert("image".to_string(), image);
        }
        RequestKind::Url => {
            notes.insert("url".to_string(), request.resource.clone());
        }
        RequestKind::Files | RequestKind::JsonData | RequestKind::Text => {}
    }

    ScanResult {
        id: id::stable(&[
            request.resource.clone(),
            finding.commit.clone(),
            finding.path.clone(),
            finding.start_line.to_string(),
            finding.start_column.to_string(),
            finding.end_line.to_string(),
            finding.end_column.to_string(),
            finding.rule_id.clone(),
        ]),
        kind,
        secret: finding.secret,
        match_text: finding.matched,
        context: finding.line,
        entropy: finding.entropy,
        date: finding.date,
        rule: Rule {
            id: finding.rule_id,
            description: finding.description,
            tags: finding.tags,
        },
        contact: Contact {
            name: finding.author,
            email: finding.email,
        },
        location,
        notes,
    }
}

/// Validates a request the way the wire decoder would, for callers that
/// build requests programmatically (the CLI `scan` command).
#[must_use]
pub fn default_local(kind: RequestKind, resource: &str, opts: &Opts) -> bool {
    kind == RequestKind::GitRepo && !opts.local && Path::new(resource).exists()
}
