//! Scan orchestration engine for LeakTK.
//!
//! This crate accepts typed scan requests describing a resource (git
//! repository, file tree, container image, URL, JSON document, or raw text)
//! and produces structured findings. It is designed to be embedded in CLIs
//! and long-running `listen` loops.
//!
//! # Main Types
//!
//! - [`Scanner`] - Worker-pooled dispatcher consuming requests and emitting responses
//! - [`PriorityQueue`] - Bounded, thread-safe max-heap channel used on both paths
//! - [`PatternCache`] - Remote-refreshed gitleaks pattern configuration cache
//! - [`Request`] / [`Response`] - The JSON wire contract
//!
//! # Error Handling
//!
//! This crate uses [`thiserror`] for structured, typed errors that library
//! consumers can match on. The CLI crate (`leaktk_cli`) uses `anyhow` for
//! error propagation.

/// Engine configuration snapshot loaded from TOML and environment overrides.
pub mod config;
/// Deadline-based cancellation shared by workers, subprocesses, and fetches.
pub mod deadline;
/// The secret detection backend run over resource fragments.
pub mod detector;
/// Filesystem helpers for restrictive-permission atomic writes.
pub mod fs_util;
/// Deterministic and engine-generated identifiers.
pub mod id;
/// Pattern configuration model and the remote-refreshed cache.
pub mod pattern;
/// Request/response protocol types and their JSON codec.
pub mod proto;
/// The generic bounded priority queue.
pub mod queue;
/// The scan dispatcher: worker pool, routing, and the clone lifecycle.
pub mod scanner;
/// Per-kind resource adapters producing scannable fragments.
pub mod sources;

pub use config::{Config, ConfigError, PatternConfig, ScannerConfig};
pub use deadline::Deadline;
pub use detector::{Detector, Finding};
pub use pattern::{GitleaksConfig, PatternCache, PatternError};
pub use proto::{ErrorCode, Opts, Request, RequestKind, Response, ResponseError, ScanResult};
pub use queue::{Message, PriorityQueue};
pub use scanner::Scanner;

/// Environment variable pointing at an alternate config file.
pub const CONFIG_PATH_ENV: &str = "LEAKTK_CONFIG_PATH";
/// Environment variable overriding the pattern server URL.
pub const PATTERN_SERVER_URL_ENV: &str = "LEAKTK_PATTERN_SERVER_URL";
/// Environment variable overriding the pattern server auth token.
pub const PATTERN_SERVER_AUTH_TOKEN_ENV: &str = "LEAKTK_PATTERN_SERVER_AUTH_TOKEN";
