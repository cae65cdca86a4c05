use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate};
use gix::bstr::ByteSlice as _;
use tracing::debug;

use crate::deadline::Deadline;

use super::{CommitInfo, Fragment, Source, SourceError, Yield, is_binary};

/// Adapter for a materialised git repository.
///
/// History mode walks commits newest-first from the requested branch tip (or
/// every local branch), diffing each commit against its first parent and
/// yielding one fragment per added or modified blob. `staged`/`unstaged`
/// switch to diff mode over the index of a local worktree instead.
#[derive(Debug)]
pub struct GitSource {
    /// Absolute git directory of the repository to walk.
    pub git_dir: PathBuf,
    /// Branch to walk; empty walks all local branches.
    pub branch: String,
    /// Maximum number of commits to scan. Zero is unlimited.
    pub depth: u32,
    /// Date floor (`YYYY-MM-DD`); older commits are not scanned.
    pub since: String,
    /// Scan the index-vs-HEAD delta instead of history.
    pub staged: bool,
    /// Scan the worktree-vs-index delta instead of history.
    pub unstaged: bool,
}

struct ChangedFile {
    path: String,
    blob_id: gix::ObjectId,
}

impl Source for GitSource {
    fn kind(&self) -> &'static str {
        "GitRepo"
    }

    fn fragments(&self, deadline: &Deadline, emit: Yield<'_>) -> Result<(), SourceError> {
        let repo = gix::open(&self.git_dir)
            .map_err(|err| SourceError::Git(format!("could not open repository: {err}")))?;

        if self.staged || self.unstaged {
            self.diff_fragments(&repo, deadline, emit)
        } else {
            self.history_fragments(&repo, deadline, emit)
        }
    }
}

impl GitSource {
    fn history_fragments(
        &self,
        repo: &gix::Repository,
        deadline: &Deadline,
        emit: Yield<'_>,
    ) -> Result<(), SourceError> {
        let tips = self.resolve_tips(repo)?;
        if tips.is_empty() {
            return Ok(());
        }

        let shallow = shallow_commits(&self.git_dir);
        let since_floor = parse_since(&self.since)?;

        let walk = repo
            .rev_walk(tips)
            .sorting(gix::revision::walk::Sorting::ByCommitTime(Default::default()));

        let mut scanned = 0u32;
        for info in walk
            .all()
            .map_err(|err| SourceError::Git(format!("could not start revision walk: {err}")))?
            .flatten()
        {
            deadline.check()?;

            // Grafted boundary commits of a shallow clone carry squashed
            // history that was never really committed; skip them.
            if shallow.contains(&info.id.to_string()) {
                continue;
            }

            let Ok(commit) = repo.find_commit(info.id) else {
                continue;
            };

            if let Some(floor) = since_floor {
                let seconds = commit.time().map(|t| t.seconds).unwrap_or(i64::MAX);
                // The walk is newest-first, so the first too-old commit ends it.
                if seconds < floor {
                    break;
                }
            }

            if self.depth > 0 && scanned >= self.depth {
                break;
            }
            scanned += 1;

            let commit_info = commit_info(&commit);
            for changed in commit_changes(repo, &commit) {
                deadline.check()?;
                if let Some(text) = read_blob_text(repo, changed.blob_id) {
                    emit(Fragment {
                        path: changed.path,
                        text,
                        commit: Some(commit_info.clone()),
                    })?;
                }
            }
        }

        Ok(())
    }

    fn resolve_tips(&self, repo: &gix::Repository) -> Result<Vec<gix::ObjectId>, SourceError> {
        if !self.branch.is_empty() {
            let id = repo
                .rev_parse_single(self.branch.as_str())
                .map_err(|_| SourceError::Git(format!("branch not found: branch={:?}", self.branch)))?;
            return Ok(vec![id.detach()]);
        }

        let mut tips = Vec::new();
        if let Ok(refs) = repo.references()
            && let Ok(locals) = refs.local_branches()
        {
            tips.extend(locals.flatten().map(|b| b.id().detach()));
        }

        if tips.is_empty()
            && let Ok(head) = repo.head_id()
        {
            tips.push(head.detach());
        }

        Ok(tips)
    }

    fn diff_fragments(
        &self,
        repo: &gix::Repository,
        deadline: &Deadline,
        emit: Yield<'_>,
    ) -> Result<(), SourceError> {
        let index = repo
            .index_or_empty()
            .map_err(|err| SourceError::Git(format!("could not read index: {err}")))?;

        if self.staged {
            let head_tree = repo.head_tree_id().ok().and_then(|id| repo.find_tree(id).ok());

            for entry in index.entries() {
                deadline.check()?;

                let path = entry.path(&index);
                let entry_id = gix::ObjectId::from_bytes_or_panic(entry.id.as_bytes());
                let head_id = head_tree.as_ref().and_then(|tree| {
                    tree.lookup_entry_by_path(path.to_str_lossy().as_ref())
                        .ok()
                        .flatten()
                        .map(|e| e.object_id())
                });

                if head_id != Some(entry_id)
                    && let Some(text) = read_blob_text(repo, entry_id)
                {
                    emit(Fragment {
                        path: path.to_string(),
                        text,
                        commit: None,
                    })?;
                }
            }
        }

        if self.unstaged {
            let Some(workdir) = repo.workdir() else {
                debug!("skipping unstaged scan: repository has no worktree");
                return Ok(());
            };

            for entry in index.entries() {
                deadline.check()?;

                let rel = entry.path(&index).to_string();
                let Ok(data) = fs::read(workdir.join(&rel)) else {
                    continue;
                };
                if is_binary(&data) {
                    continue;
                }

                let text = String::from_utf8_lossy(&data).into_owned();
                let entry_id = gix::ObjectId::from_bytes_or_panic(entry.id.as_bytes());
                if read_blob_text(repo, entry_id).as_deref() != Some(text.as_str()) {
                    emit(Fragment {
                        path: rel,
                        text,
                        commit: None,
                    })?;
                }
            }
        }

        Ok(())
    }
}

fn commit_info(commit: &gix::Commit<'_>) -> CommitInfo {
    let (author, email) = commit.author().map_or_else(
        |_| (String::new(), String::new()),
        |sig| (sig.name.to_string(), sig.email.to_string()),
    );

    let date = commit
        .time()
        .ok()
        .and_then(|t| DateTime::from_timestamp(t.seconds, 0))
        .map(|d| d.to_rfc3339())
        .unwrap_or_default();

    let message = commit
        .message_raw()
        .map(|m| {
            m.lines()
                .next()
                .map(|line| String::from_utf8_lossy(line).into_owned())
                .unwrap_or_default()
        })
        .unwrap_or_default();

    CommitInfo {
        sha: commit.id().to_string(),
        author,
        email,
        date,
        message,
    }
}

/// Files added, modified, or rewritten by `commit` relative to its first
/// parent (the empty tree for root commits).
fn commit_changes(repo: &gix::Repository, commit: &gix::Commit<'_>) -> Vec<ChangedFile> {
    let Ok(tree) = commit.tree() else {
        return Vec::new();
    };

    let parent_tree = commit
        .parent_ids()
        .next()
        .and_then(|pid| repo.find_commit(pid).ok())
        .and_then(|pc| pc.tree().ok());
    let from_tree = parent_tree.map_or_else(|| repo.empty_tree(), |t| t);

    let Ok(mut changes) = from_tree.changes() else {
        return Vec::new();
    };

    let mut entries = Vec::new();
    let _ = changes.for_each_to_obtain_tree(&tree, |change| {
        use gix::object::tree::diff::Change;

        match change {
            Change::Addition { location, id, .. }
            | Change::Modification { location, id, .. }
            | Change::Rewrite { location, id, .. } => {
                entries.push(ChangedFile {
                    path: location.to_str_lossy().into_owned(),
                    blob_id: id.detach(),
                });
            }
            Change::Deletion { .. } => {}
        }

        Ok::<_, std::convert::Infallible>(gix::object::tree::diff::Action::Continue)
    });

    entries
}

fn read_blob_text(repo: &gix::Repository, oid: gix::ObjectId) -> Option<String> {
    let blob = repo.find_blob(oid).ok()?;
    if is_binary(&blob.data) {
        return None;
    }
    Some(String::from_utf8_lossy(&blob.data).into_owned())
}

/// Commit IDs recorded in `$GIT_DIR/shallow`, if any.
fn shallow_commits(git_dir: &std::path::Path) -> HashSet<String> {
    fs::read_to_string(git_dir.join("shallow"))
        .map(|data| {
            data.lines()
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_since(since: &str) -> Result<Option<i64>, SourceError> {
    if since.is_empty() {
        return Ok(None);
    }

    let date = NaiveDate::parse_from_str(since, "%Y-%m-%d").map_err(|_| SourceError::Option {
        name: "since",
        value: since.to_string(),
    })?;

    let floor = date
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default();
    Ok(Some(floor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_since_accepts_dates_and_rejects_garbage() {
        assert_eq!(parse_since("").unwrap(), None);
        assert!(parse_since("2024-02-29").unwrap().is_some());
        assert!(parse_since("yesterday").is_err());
        assert!(parse_since("2024-13-01").is_err());
    }

    #[test]
    fn shallow_file_parses_one_id_per_line() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("shallow"), "abc\n\ndef\n").unwrap();

        let shallow = shallow_commits(dir.path());
        assert_eq!(shallow.len(), 2);
        assert!(shallow.contains("abc"));
        assert!(shallow.contains("def"));
    }

    #[test]
    fn missing_shallow_file_means_no_boundary() {
        let dir = tempfile::tempdir().unwrap();
        assert!(shallow_commits(dir.path()).is_empty());
    }
}
