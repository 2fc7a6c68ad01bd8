//! Filesystem layout and primitives.
//!
//! All on-disk state lives under a single server root:
//!
//! ```text
//! <root>/wals/<tablet_id>/wal-000000001      (live WAL segments)
//! <root>/wals/<tablet_id>-recovery/          (quarantined WAL during replay)
//! <root>/consensus-meta/<tablet_id>          (consensus metadata)
//! <root>/tablet-meta/<tablet_id>             (tablet superblock)
//! ```
//!
//! The cross-directory rename that quarantines a tablet's WAL must be
//! atomic on the underlying filesystem; both directories live under the
//! same root so a plain `rename(2)` suffices.

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Prefix for WAL segment file names.
pub const LOG_FILE_PREFIX: &str = "wal-";

/// Suffix appended to a tablet's WAL dir name to form its recovery dir.
pub const RECOVERY_DIR_SUFFIX: &str = "-recovery";

/// Check whether a file name denotes a WAL segment.
pub fn is_log_file_name(name: &str) -> bool {
    parse_log_file_name(name).is_some()
}

/// Parse a WAL segment file name, returning its sequence number.
///
/// Segment names look like `wal-000000001`. Returns `None` for anything
/// else, including names with a non-numeric or empty suffix.
pub fn parse_log_file_name(name: &str) -> Option<u64> {
    let suffix = name.strip_prefix(LOG_FILE_PREFIX)?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse::<u64>().ok()
}

/// Format a WAL segment file name for the given sequence number.
pub fn log_file_name(seqno: u64) -> String {
    format!("{}{:09}", LOG_FILE_PREFIX, seqno)
}

/// Manages the server's on-disk directory layout.
///
/// Cheap to clone; all clones share the same root.
#[derive(Debug, Clone)]
pub struct FsManager {
    root: PathBuf,
}

impl FsManager {
    /// Create a manager rooted at `root`, creating the root directories
    /// if missing.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let fs = Self {
            root: root.as_ref().to_path_buf(),
        };
        fs.create_dir_if_missing(&fs.root)?;
        fs.create_dir_if_missing(fs.wal_root())?;
        fs.create_dir_if_missing(fs.consensus_metadata_root())?;
        fs.create_dir_if_missing(fs.tablet_metadata_root())?;
        Ok(fs)
    }

    /// The server root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn wal_root(&self) -> PathBuf {
        self.root.join("wals")
    }

    fn consensus_metadata_root(&self) -> PathBuf {
        self.root.join("consensus-meta")
    }

    fn tablet_metadata_root(&self) -> PathBuf {
        self.root.join("tablet-meta")
    }

    /// The live WAL directory for a tablet.
    pub fn tablet_wal_dir(&self, tablet_id: &str) -> PathBuf {
        self.wal_root().join(tablet_id)
    }

    /// The WAL recovery directory for a tablet: a sibling of the live
    /// WAL dir with a fixed suffix.
    pub fn tablet_wal_recovery_dir(&self, tablet_id: &str) -> PathBuf {
        self.wal_root()
            .join(format!("{}{}", tablet_id, RECOVERY_DIR_SUFFIX))
    }

    /// The consensus metadata file for a tablet.
    pub fn consensus_metadata_path(&self, tablet_id: &str) -> PathBuf {
        self.consensus_metadata_root().join(tablet_id)
    }

    /// The tablet superblock file for a tablet.
    pub fn tablet_metadata_path(&self, tablet_id: &str) -> PathBuf {
        self.tablet_metadata_root().join(tablet_id)
    }

    /// Check whether a path exists.
    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        path.as_ref().exists()
    }

    /// List the names of a directory's children, sorted.
    pub fn list_dir(&self, path: impl AsRef<Path>) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path.as_ref())? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Create a directory if it doesn't exist.
    pub fn create_dir_if_missing(&self, path: impl AsRef<Path>) -> Result<()> {
        match std::fs::create_dir_all(path.as_ref()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically rename `src` to `dst`.
    pub fn rename(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
        std::fs::rename(src.as_ref(), dst.as_ref()).map_err(|e| {
            Error::Io(format!(
                "rename {} -> {}: {}",
                src.as_ref().display(),
                dst.as_ref().display(),
                e
            ))
        })
    }

    /// Delete a file. Deleting a missing file is an error.
    pub fn delete_file(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::remove_file(path.as_ref())
            .map_err(|e| Error::Io(format!("delete {}: {}", path.as_ref().display(), e)))
    }

    /// Recursively delete a directory tree.
    pub fn delete_recursively(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::remove_dir_all(path.as_ref())
            .map_err(|e| Error::Io(format!("delete tree {}: {}", path.as_ref().display(), e)))
    }

    /// Sync a directory so renames and creates within it are durable.
    pub fn sync_dir(&self, path: impl AsRef<Path>) -> Result<()> {
        let dir = std::fs::File::open(path.as_ref())?;
        dir.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_log_file_names() {
        assert_eq!(log_file_name(1), "wal-000000001");
        assert_eq!(log_file_name(123456789), "wal-123456789");

        assert_eq!(parse_log_file_name("wal-000000001"), Some(1));
        assert_eq!(parse_log_file_name("wal-123456789"), Some(123456789));

        assert!(is_log_file_name("wal-000000042"));
        assert!(!is_log_file_name("wal-"));
        assert!(!is_log_file_name("wal-abc"));
        assert!(!is_log_file_name("index-000000001"));
        assert!(!is_log_file_name(".nfs000001"));
    }

    #[test]
    fn test_layout_paths() {
        let dir = tempdir().unwrap();
        let fs = FsManager::open(dir.path()).unwrap();

        let wal = fs.tablet_wal_dir("tablet-1");
        let recovery = fs.tablet_wal_recovery_dir("tablet-1");

        assert_eq!(wal.file_name().unwrap(), "tablet-1");
        assert_eq!(recovery.file_name().unwrap(), "tablet-1-recovery");
        assert_eq!(wal.parent(), recovery.parent());

        // Root directories were created.
        assert!(fs.exists(dir.path().join("wals")));
        assert!(fs.exists(dir.path().join("consensus-meta")));
        assert!(fs.exists(dir.path().join("tablet-meta")));
    }

    #[test]
    fn test_list_dir_sorted() {
        let dir = tempdir().unwrap();
        let fs = FsManager::open(dir.path()).unwrap();

        let wal_dir = fs.tablet_wal_dir("t");
        fs.create_dir_if_missing(&wal_dir).unwrap();
        std::fs::write(wal_dir.join(log_file_name(2)), b"").unwrap();
        std::fs::write(wal_dir.join(log_file_name(1)), b"").unwrap();
        std::fs::write(wal_dir.join("junk.txt"), b"").unwrap();

        let names = fs.list_dir(&wal_dir).unwrap();
        assert_eq!(
            names,
            vec![
                "junk.txt".to_string(),
                "wal-000000001".to_string(),
                "wal-000000002".to_string()
            ]
        );
    }

    #[test]
    fn test_rename_is_move() {
        let dir = tempdir().unwrap();
        let fs = FsManager::open(dir.path()).unwrap();

        let src = fs.tablet_wal_dir("t");
        fs.create_dir_if_missing(&src).unwrap();
        std::fs::write(src.join(log_file_name(1)), b"x").unwrap();

        let dst = fs.tablet_wal_recovery_dir("t");
        fs.rename(&src, &dst).unwrap();

        assert!(!fs.exists(&src));
        assert!(fs.exists(dst.join(log_file_name(1))));
    }

    #[test]
    fn test_delete_file_missing_is_error() {
        let dir = tempdir().unwrap();
        let fs = FsManager::open(dir.path()).unwrap();
        assert!(fs.delete_file(dir.path().join("nope")).is_err());
    }
}
