use std::io;
use std::path::Path;

use crate::error::{Result, StoreError};

const VERSION_FILE: &str = "sequentialstorage.version";

/// Current on-disk format version. Bump this, and the version file contract
/// itself refuses to open older stores rather than silently reinterpreting
/// their bytes.
pub const CURRENT_VERSION: &str = "3";

/// Checks the store directory's version marker, creating it if the
/// directory has no other contents yet.
pub fn check_or_init(directory: &Path) -> Result<()> {
    let version_path = directory.join(VERSION_FILE);

    match std::fs::read_to_string(&version_path) {
        Ok(contents) => {
            let found = contents.trim();
            if found != CURRENT_VERSION {
                return Err(StoreError::VersionMismatch {
                    path: version_path.display().to_string(),
                    expected: CURRENT_VERSION.to_string(),
                    found: Some(found.to_string()),
                });
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if directory_has_other_entries(directory, &version_path)? {
                return Err(StoreError::VersionMismatch {
                    path: version_path.display().to_string(),
                    expected: CURRENT_VERSION.to_string(),
                    found: None,
                });
            }
            std::fs::write(&version_path, CURRENT_VERSION)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn directory_has_other_entries(directory: &Path, version_path: &Path) -> Result<bool> {
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        if entry.path() != version_path {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_version_file_in_empty_directory() {
        let dir = tempdir().unwrap();
        check_or_init(dir.path()).unwrap();
        let contents = std::fs::read_to_string(dir.path().join(VERSION_FILE)).unwrap();
        assert_eq!(contents, CURRENT_VERSION);
    }

    #[test]
    fn accepts_matching_version() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(VERSION_FILE), CURRENT_VERSION).unwrap();
        check_or_init(dir.path()).unwrap();
    }

    #[test]
    fn rejects_mismatched_version() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(VERSION_FILE), "0").unwrap();
        assert!(matches!(
            check_or_init(dir.path()),
            Err(StoreError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn rejects_nonempty_directory_missing_version_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("seqstore"), b"stray data").unwrap();
        assert!(matches!(
            check_or_init(dir.path()),
            Err(StoreError::VersionMismatch { .. })
        ));
    }
}
