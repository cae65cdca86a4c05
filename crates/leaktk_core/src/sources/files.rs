use std::fs;
use std::path::Path;

use ignore::WalkBuilder;
use tracing::debug;

use crate::deadline::Deadline;

use super::{Fragment, Source, SourceError, Yield, is_binary};

/// Adapter for a local file tree.
///
/// Walks every file under the root, including hidden and gitignored ones —
/// ignore rules hide exactly the files people leak secrets into. Symlinks are
/// not followed and binaries are skipped by NUL-probe.
#[derive(Debug)]
pub struct FilesSource<'a> {
    /// Directory or single file to scan.
    pub root: &'a Path,
}

impl Source for FilesSource<'_> {
    fn kind(&self) -> &'static str {
        "Files"
    }

    fn fragments(&self, deadline: &Deadline, emit: Yield<'_>) -> Result<(), SourceError> {
        if self.root.is_file() {
            deadline.check()?;
            let base = self.root.parent().unwrap_or(self.root);
            return emit_file(self.root, base, emit);
        }

        let walker = WalkBuilder::new(self.root)
            .hidden(false)
            .ignore(false)
            .parents(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .follow_links(false)
            .build();

        for entry in walker {
            deadline.check()?;

            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(error = %err, "skipping unreadable entry");
                    continue;
                }
            };

            if entry.file_type().is_none_or(|ft| !ft.is_file()) {
                continue;
            }

            emit_file(entry.path(), self.root, emit)?;
        }

        Ok(())
    }
}

fn emit_file(path: &Path, root: &Path, emit: Yield<'_>) -> Result<(), SourceError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "skipping unreadable file");
            return Ok(());
        }
    };

    if is_binary(&data) {
        debug!(path = %path.display(), "skipping binary file");
        return Ok(());
    }

    let relative = path.strip_prefix(root).unwrap_or(path);
    emit(Fragment {
        path: relative.to_string_lossy().replace('\\', "/"),
        text: String::from_utf8_lossy(&data).into_owned(),
        commit: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn collect(root: &Path) -> BTreeMap<String, String> {
        let source = FilesSource { root };
        let mut fragments = BTreeMap::new();
        source
            .fragments(&Deadline::none(), &mut |f| {
                fragments.insert(f.path, f.text);
                Ok(())
            })
            .unwrap();
        fragments
    }

    #[test]
    fn walks_nested_and_hidden_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        fs::write(dir.path().join("sub/b.txt"), "beta").unwrap();
        fs::write(dir.path().join(".env"), "hidden").unwrap();

        let fragments = collect(dir.path());

        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments["a.txt"], "alpha");
        assert_eq!(fragments["sub/b.txt"], "beta");
        assert_eq!(fragments[".env"], "hidden");
    }

    #[test]
    fn scans_gitignored_files_anyway() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".gitignore"), "ignored.txt\n").unwrap();
        fs::write(dir.path().join("ignored.txt"), "still scanned").unwrap();

        let fragments = collect(dir.path());
        assert!(fragments.contains_key("ignored.txt"));
    }

    #[test]
    fn skips_binary_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("blob.bin"), b"\x00\x01\x02").unwrap();
        fs::write(dir.path().join("ok.txt"), "fine").unwrap();

        let fragments = collect(dir.path());
        assert_eq!(fragments.len(), 1);
        assert!(fragments.contains_key("ok.txt"));
    }

    #[test]
    fn single_file_root_yields_one_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("only.txt");
        fs::write(&file, "content").unwrap();

        let fragments = collect(&file);
        assert_eq!(fragments.len(), 1);
    }
}
