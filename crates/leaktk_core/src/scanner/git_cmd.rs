//! Git subprocess plumbing for the dispatcher.
//!
//! Clones, remote-ref checks, and worktree checkouts run through the `git`
//! CLI. On POSIX every child gets its own process group so that a deadline
//! kill takes the whole group down; elsewhere a plain kill is used and a
//! timed-out child's helpers may outlive it.

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::Duration;

use tracing::debug;

use crate::deadline::Deadline;
use crate::id;
use crate::proto::Opts;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);
const SOURCE_WORKTREE_NAME: &str = "leaktk-scan-source";

/// Errors from materialising a remote git repository.
#[derive(Debug, thiserror::Error)]
pub enum CloneError {
    /// The requested branch does not exist on the remote.
    #[error("remote ref does not exist: ref={0:?}")]
    MissingRef(String),

    /// `git clone` exited non-zero.
    #[error("git clone failed: {0}")]
    Failed(String),

    /// The scan deadline expired while cloning.
    #[error("clone timeout exceeded")]
    Timeout,

    /// The `git` binary could not be run at all.
    #[error("could not run git: {0}")]
    Exec(#[from] std::io::Error),
}

/// Scan depth resulting from a requested depth `provided` and the configured
/// cap `max`: `min` of the two when the cap is set, the request otherwise.
#[must_use]
pub fn scan_depth(provided: u32, max: u32) -> u32 {
    if max == 0 {
        provided
    } else if provided == 0 {
        max
    } else {
        provided.min(max)
    }
}

/// Clone depth for a scan depth: one deeper than scanned so the grafted
/// boundary commit of a shallow clone is never scanned, except when no depth
/// limit applies at all.
#[must_use]
pub fn clone_depth(provided: u32, max: u32) -> u32 {
    match scan_depth(provided, max) {
        0 => 0,
        depth => depth + 1,
    }
}

/// The materialised paths of a remote clone.
#[derive(Debug)]
pub struct ClonedRepo {
    /// Worktree holding checked-out `.gitleaks*` overlay files.
    pub source_path: PathBuf,
    /// The bare/mirror git directory.
    pub git_dir: PathBuf,
}

/// Clones `clone_url` into a fresh directory under `clones_dir`.
///
/// Branch requests are verified against the remote first and clone as
/// `--bare --single-branch`; branchless requests mirror every ref. Depth is
/// over-cloned by one. After the clone, `.gitleaks*` files are checked out
/// into a side worktree for overlay loading; worktree failures are logged
/// and ignored.
pub fn clone_git_repo(
    clones_dir: &Path,
    clone_url: &str,
    opts: &Opts,
    max_scan_depth: u32,
    deadline: &Deadline,
) -> Result<ClonedRepo, CloneError> {
    let mut args: Vec<String> = vec!["clone".to_string()];

    if !opts.proxy.is_empty() {
        args.push("--config".to_string());
        args.push(format!("http.proxy={}", opts.proxy));
    }

    // The --[no-]single-branch flags are still needed with mirror because of
    // how --depth and --shallow-since interact with ref selection.
    if !opts.branch.is_empty() {
        if !remote_ref_exists(clone_url, &opts.branch, deadline)? {
            return Err(CloneError::MissingRef(opts.branch.clone()));
        }

        args.push("--bare".to_string());
        args.push("--single-branch".to_string());
        args.push("--branch".to_string());
        args.push(opts.branch.clone());
    } else {
        args.push("--mirror".to_string());
        args.push("--no-single-branch".to_string());
    }

    if !opts.since.is_empty() {
        args.push("--shallow-since".to_string());
        args.push(opts.since.clone());
    }

    let depth = clone_depth(opts.depth, max_scan_depth);
    if depth > 0 {
        args.push("--depth".to_string());
        args.push(depth.to_string());
    }

    let git_dir = clones_dir.join(id::random());
    args.push(clone_url.to_string());
    args.push(git_dir.to_string_lossy().into_owned());

    let output = match run_git(&args, deadline) {
        Ok(output) => output,
        Err(err) => {
            // A killed clone leaves a partial destination behind.
            remove_partial_clone(&git_dir);
            return Err(err);
        }
    };
    if !output.status.success() {
        remove_partial_clone(&git_dir);
        if deadline.expired() {
            return Err(CloneError::Timeout);
        }
        return Err(CloneError::Failed(format!(
            "exit={:?} output={:?}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr),
        )));
    }

    let source_path = git_dir.join(SOURCE_WORKTREE_NAME);
    if let Err(err) = checkout_source_config_files(&git_dir, &source_path, deadline) {
        debug!(error = %err, clone_url, "could not checkout source config files");
    }

    Ok(ClonedRepo { source_path, git_dir })
}

/// Returns the absolute git directory of `path` via `git rev-parse`.
pub fn abs_git_dir(path: &Path, deadline: &Deadline) -> Result<PathBuf, CloneError> {
    let output = run_git(
        &[
            "-C".to_string(),
            path.to_string_lossy().into_owned(),
            "rev-parse".to_string(),
            "--absolute-git-dir".to_string(),
        ],
        deadline,
    )?;

    if !output.status.success() {
        return Err(CloneError::Failed(format!(
            "rev-parse --absolute-git-dir failed: {:?}",
            String::from_utf8_lossy(&output.stderr),
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(PathBuf::from(stdout.trim()))
}

fn remote_ref_exists(clone_url: &str, reference: &str, deadline: &Deadline) -> Result<bool, CloneError> {
    let output = run_git(
        &[
            "ls-remote".to_string(),
            "--exit-code".to_string(),
            "--quiet".to_string(),
            clone_url.to_string(),
            reference.to_string(),
        ],
        deadline,
    )?;

    Ok(output.status.success())
}

fn checkout_source_config_files(
    git_dir: &Path,
    worktree_path: &Path,
    deadline: &Deadline,
) -> Result<(), CloneError> {
    let output = run_git(
        &[
            "-C".to_string(),
            git_dir.to_string_lossy().into_owned(),
            "worktree".to_string(),
            "add".to_string(),
            "--no-checkout".to_string(),
            worktree_path.to_string_lossy().into_owned(),
        ],
        deadline,
    )?;
    if !output.status.success() {
        return Err(CloneError::Failed(format!(
            "could not create worktree: {:?}",
            String::from_utf8_lossy(&output.stderr),
        )));
    }

    let output = run_git(
        &[
            "-C".to_string(),
            worktree_path.to_string_lossy().into_owned(),
            "checkout".to_string(),
            "-f".to_string(),
            "HEAD".to_string(),
            "--".to_string(),
            ".gitleaks*".to_string(),
        ],
        deadline,
    )?;
    if !output.status.success() {
        return Err(CloneError::Failed(format!(
            "could not checkout gitleaks files: {:?}",
            String::from_utf8_lossy(&output.stderr),
        )));
    }

    Ok(())
}

/// Runs `git` with the given args, killing the whole process group if the
/// deadline expires first.
fn run_git(args: &[String], deadline: &Deadline) -> Result<Output, CloneError> {
    deadline.check().map_err(|_| CloneError::Timeout)?;

    let mut command = Command::new("git");
    command.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        command.process_group(0);
    }

    let mut child = command.spawn()?;

    loop {
        if child.try_wait()?.is_some() {
            return Ok(child.wait_with_output()?);
        }

        if deadline.expired() {
            kill_child_group(&mut child);
            let _ = child.wait();
            return Err(CloneError::Timeout);
        }

        std::thread::sleep(WAIT_POLL_INTERVAL);
    }
}

fn remove_partial_clone(git_dir: &Path) {
    if git_dir.exists()
        && let Err(err) = std::fs::remove_dir_all(git_dir)
    {
        debug!(error = %err, path = %git_dir.display(), "could not remove partial clone");
    }
}

#[cfg(unix)]
fn kill_child_group(child: &mut std::process::Child) {
    // The child leads its own process group; kill the negated pid so any
    // helpers it spawned (remote transports, hooks) die with it.
    let pid = child.id() as libc::pid_t;
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_child_group(child: &mut std::process::Child) {
    let _ = child.kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_policy_matches_the_table() {
        // (provided, max) -> (scan, clone)
        let cases = [
            ((0, 0), (0, 0)),
            ((3, 0), (3, 4)),
            ((0, 5), (5, 6)),
            ((3, 5), (3, 4)),
            ((7, 5), (5, 6)),
            ((5, 5), (5, 6)),
        ];

        for ((provided, max), (want_scan, want_clone)) in cases {
            assert_eq!(scan_depth(provided, max), want_scan, "scan_depth({provided},{max})");
            assert_eq!(clone_depth(provided, max), want_clone, "clone_depth({provided},{max})");
        }
    }

    #[test]
    fn run_git_reports_exit_status() {
        let output = run_git(&["--version".to_string()], &Deadline::none()).unwrap();
        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("git version"));
    }

    #[test]
    fn expired_deadline_times_out_before_spawning() {
        let deadline = Deadline::after(Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(5));

        let err = run_git(&["--version".to_string()], &deadline).unwrap_err();
        assert!(matches!(err, CloneError::Timeout));
    }

    #[test]
    fn clone_of_missing_remote_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = clone_git_repo(
            dir.path(),
            dir.path().join("no-such-repo").to_str().unwrap(),
            &Opts::default(),
            0,
            &Deadline::none(),
        )
        .unwrap_err();
        assert!(matches!(err, CloneError::Failed(_)));
    }

    #[test]
    fn clone_with_missing_branch_is_a_missing_ref() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Opts {
            branch: "no-such-branch".to_string(),
            ..Opts::default()
        };

        let err = clone_git_repo(
            dir.path(),
            dir.path().join("no-such-repo").to_str().unwrap(),
            &opts,
            0,
            &Deadline::none(),
        )
        .unwrap_err();
        assert!(matches!(err, CloneError::MissingRef(_)));
    }
}
