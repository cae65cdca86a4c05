use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

/// Writes `content` to `path` atomically with restrictive permissions.
///
/// The parent directory is created with mode `0700` and the file lands with
/// mode `0600` (pattern payloads may embed auth-gated rule material). The
/// write goes to a temporary sibling first, is synced, then renamed into
/// place.
pub fn write_private(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        create_private_dir(parent)?;
    }

    let temp_path = path.with_extension("tmp");

    let mut file = open_private(&temp_path)?;
    file.write_all(content)?;

    // Ensure data is persisted to disk before rename
    file.sync_all()?;

    // Drop file handle before rename (Windows compatibility)
    drop(file);

    fs::rename(&temp_path, path)?;

    Ok(())
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> io::Result<()> {
    use std::fs::DirBuilder;
    use std::os::unix::fs::DirBuilderExt;

    DirBuilder::new().recursive(true).mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

#[cfg(unix)]
fn open_private(path: &Path) -> io::Result<File> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> io::Result<File> {
    File::create(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_private_creates_parents_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/patterns.toml");

        write_private(&target, b"[allowlist]").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"[allowlist]");
        assert!(!target.with_extension("tmp").exists());
    }

    #[test]
    fn write_private_replaces_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("patterns.toml");

        write_private(&target, b"old").unwrap();
        write_private(&target, b"new").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"new");
    }

    #[cfg(unix)]
    #[test]
    fn write_private_sets_restrictive_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("private/patterns.toml");

        write_private(&target, b"x").unwrap();

        let file_mode = fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        let dir_mode = fs::metadata(target.parent().unwrap()).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        assert_eq!(dir_mode, 0o700);
    }
}
