//! Preservation of built binaries and object trees across variant switches.
//!
//! Every variant builds into the same active location (`bin/<exe>` and
//! `obj/`). An [`ArtifactStore`] moves that tree aside under a variant tag
//! and later moves it back, discarding whatever is active at that point.
//! Saving over a tag replaces whatever an earlier, interrupted session left
//! under it.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Errors from artifact preservation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no preserved artifacts for tag '{tag}'")]
    NotFound { tag: String },

    #[error("nothing to preserve: {path} does not exist")]
    MissingActive { path: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Key-value store of build trees keyed by variant tag.
pub trait ArtifactStore: Send + Sync {
    /// Move the active binary and object tree aside under `tag`, replacing
    /// any tree already saved there.
    fn save(&self, tag: &str) -> StoreResult<()>;

    /// Discard the active tree and move the tree saved under `tag` into its
    /// place. The saved copy is consumed.
    fn restore(&self, tag: &str) -> StoreResult<()>;

    /// Whether a tree is currently saved under `tag`.
    fn contains(&self, tag: &str) -> StoreResult<bool>;

    /// Delete the tree saved under `tag`. Returns whether anything was there.
    fn discard(&self, tag: &str) -> StoreResult<bool>;
}

/// Filesystem store that renames in place inside the build root.
///
/// Layout: `bin/<exe>` ↔ `bin/<exe>_<tag>`, `obj/` ↔ `obj_<tag>/`.
pub struct FsArtifactStore {
    build_root: PathBuf,
    executable: String,
}

impl FsArtifactStore {
    pub fn new(build_root: impl AsRef<Path>, executable: impl Into<String>) -> Self {
        Self {
            build_root: build_root.as_ref().to_path_buf(),
            executable: executable.into(),
        }
    }

    fn active_bin(&self) -> PathBuf {
        self.build_root.join("bin").join(&self.executable)
    }

    fn active_obj(&self) -> PathBuf {
        self.build_root.join("obj")
    }

    fn saved_bin(&self, tag: &str) -> PathBuf {
        self.build_root
            .join("bin")
            .join(format!("{}_{}", self.executable, tag))
    }

    fn saved_obj(&self, tag: &str) -> PathBuf {
        self.build_root.join(format!("obj_{}", tag))
    }

    /// Remove both halves of a saved tree; either may be missing.
    fn remove_saved(&self, tag: &str) -> StoreResult<bool> {
        let (bin, obj) = (self.saved_bin(tag), self.saved_obj(tag));
        let mut removed = false;
        if bin.exists() {
            fs::remove_file(&bin)?;
            removed = true;
        }
        if obj.exists() {
            fs::remove_dir_all(&obj)?;
            removed = true;
        }
        Ok(removed)
    }
}

impl ArtifactStore for FsArtifactStore {
    fn save(&self, tag: &str) -> StoreResult<()> {
        let (bin, obj) = (self.active_bin(), self.active_obj());
        if !bin.exists() {
            return Err(StoreError::MissingActive {
                path: bin.display().to_string(),
            });
        }
        if self.remove_saved(tag)? {
            debug!(tag = %tag, "Replaced stale preserved artifacts");
        }

        fs::rename(&bin, self.saved_bin(tag))?;
        if obj.exists() {
            fs::rename(&obj, self.saved_obj(tag))?;
        }
        debug!(tag = %tag, "Preserved build artifacts");
        Ok(())
    }

    fn restore(&self, tag: &str) -> StoreResult<()> {
        let (saved_bin, saved_obj) = (self.saved_bin(tag), self.saved_obj(tag));
        if !saved_bin.exists() {
            return Err(StoreError::NotFound {
                tag: tag.to_string(),
            });
        }

        let (bin, obj) = (self.active_bin(), self.active_obj());
        if obj.exists() {
            fs::remove_dir_all(&obj)?;
        }
        if bin.exists() {
            fs::remove_file(&bin)?;
        }

        fs::rename(&saved_bin, &bin)?;
        if saved_obj.exists() {
            fs::rename(&saved_obj, &obj)?;
        }
        debug!(tag = %tag, "Restored build artifacts");
        Ok(())
    }

    fn contains(&self, tag: &str) -> StoreResult<bool> {
        Ok(self.saved_bin(tag).exists())
    }

    fn discard(&self, tag: &str) -> StoreResult<bool> {
        let removed = self.remove_saved(tag)?;
        if removed {
            debug!(tag = %tag, "Discarded preserved artifacts");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tree(root: &Path, marker: &str) {
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::create_dir_all(root.join("obj")).unwrap();
        fs::write(root.join("bin/athena"), marker).unwrap();
        fs::write(root.join("obj/main.o"), marker).unwrap();
    }

    #[test]
    fn test_save_moves_active_tree_aside() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path(), "fft");
        let store = FsArtifactStore::new(dir.path(), "athena");

        store.save("mpi_fft").unwrap();

        assert!(!dir.path().join("bin/athena").exists());
        assert!(!dir.path().join("obj").exists());
        assert!(dir.path().join("bin/athena_mpi_fft").exists());
        assert!(dir.path().join("obj_mpi_fft/main.o").exists());
        assert!(store.contains("mpi_fft").unwrap());
    }

    #[test]
    fn test_restore_replaces_active_tree() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path(), "athena");

        make_tree(dir.path(), "fft");
        store.save("fft").unwrap();
        make_tree(dir.path(), "mg");

        store.restore("fft").unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("bin/athena")).unwrap(), "fft");
        assert_eq!(fs::read_to_string(dir.path().join("obj/main.o")).unwrap(), "fft");
        assert!(!store.contains("fft").unwrap());
    }

    #[test]
    fn test_save_without_active_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path(), "athena");
        assert!(matches!(
            store.save("fft"),
            Err(StoreError::MissingActive { .. })
        ));
    }

    #[test]
    fn test_save_replaces_earlier_tree() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path(), "athena");
        make_tree(dir.path(), "a");
        store.save("x").unwrap();
        make_tree(dir.path(), "b");

        store.save("x").unwrap();
        store.restore("x").unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("bin/athena")).unwrap(), "b");
        assert_eq!(fs::read_to_string(dir.path().join("obj/main.o")).unwrap(), "b");
    }

    #[test]
    fn test_save_over_leftover_object_tree() {
        // An interrupted session left obj_fft behind without its binary.
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path(), "athena");
        fs::create_dir_all(dir.path().join("obj_fft")).unwrap();
        fs::write(dir.path().join("obj_fft/old.o"), "old").unwrap();
        make_tree(dir.path(), "new");

        store.save("fft").unwrap();

        assert!(!dir.path().join("bin/athena").exists());
        assert!(!dir.path().join("obj").exists());
        assert!(!dir.path().join("obj_fft/old.o").exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("obj_fft/main.o")).unwrap(),
            "new"
        );
    }

    #[test]
    fn test_discard_removes_saved_tree() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path(), "athena");
        make_tree(dir.path(), "fft");
        store.save("fft").unwrap();

        assert!(store.discard("fft").unwrap());
        assert!(!store.contains("fft").unwrap());
        assert!(!dir.path().join("obj_fft").exists());
        assert!(!store.discard("fft").unwrap());
    }

    #[test]
    fn test_restore_unknown_tag_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path(), "athena");
        match store.restore("nope") {
            Err(StoreError::NotFound { tag }) => assert_eq!(tag, "nope"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
