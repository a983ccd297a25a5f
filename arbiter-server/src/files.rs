//! Internal files on disk.
//!
//! Every internal file lives at `<data_dir>/internal_files/<id>` where
//! `<id>` is the decimal row id; no sharding. A flat file is created with
//! write-then-rename so readers never observe a partial blob; a problem
//! package is a directory at the same path. Deletion tolerates a missing
//! path, which makes `DELETE_INTERNAL_FILE` idempotent.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

#[derive(Debug, Clone)]
pub struct FileStore {
    data_dir: PathBuf,
}

impl FileStore {
    /// Prepares the on-disk layout under `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> io::Result<FileStore> {
        let data_dir = data_dir.into();
        fs::create_dir_all(data_dir.join("internal_files"))?;
        fs::create_dir_all(data_dir.join("var"))?;
        Ok(FileStore { data_dir })
    }

    pub fn path_of(&self, file_id: i64) -> PathBuf {
        self.data_dir.join("internal_files").join(file_id.to_string())
    }

    pub fn notify_path(&self) -> PathBuf {
        self.data_dir.join("var").join("job_server.notify")
    }

    /// Atomically installs `contents` as internal file `file_id`.
    pub fn save(&self, file_id: i64, contents: &[u8]) -> io::Result<()> {
        let dest = self.path_of(file_id);
        let staging = dest.with_extension("tmp");
        fs::write(&staging, contents)?;
        fs::rename(&staging, &dest)
    }

    /// Removes the internal file (flat file or package directory). Returns
    /// whether anything existed.
    pub fn remove(&self, file_id: i64) -> io::Result<bool> {
        remove_path(&self.path_of(file_id))
    }
}

/// Unlink-on-drop guard for files staged during a job. The handler calls
/// [`FileRemover::cancel`] once the transaction that references the file has
/// committed; a rollback path drops the guard and the staged file goes away
/// with it.
#[derive(Debug)]
pub struct FileRemover {
    path: Option<PathBuf>,
}

impl FileRemover {
    pub fn new(path: impl Into<PathBuf>) -> FileRemover {
        FileRemover {
            path: Some(path.into()),
        }
    }

    pub fn cancel(mut self) {
        self.path = None;
    }
}

impl Drop for FileRemover {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(e) = result {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove staged file {}: {e}", path.display());
            }
        }
    }
}

/// Removes a path that may be a file or a directory, tolerating absence.
pub fn remove_path(path: &Path) -> io::Result<bool> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_decimal_ids_without_sharding() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();
        assert_eq!(
            store.path_of(1234),
            tmp.path().join("internal_files").join("1234")
        );
        assert!(tmp.path().join("internal_files").is_dir());
        assert!(tmp.path().join("var").is_dir());
    }

    #[test]
    fn save_then_remove_then_remove_again() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();
        store.save(7, b"blob").unwrap();
        assert_eq!(fs::read(store.path_of(7)).unwrap(), b"blob");
        assert!(store.remove(7).unwrap());
        // Second removal is a no-op, not an error.
        assert!(!store.remove(7).unwrap());
    }

    #[test]
    fn remove_handles_package_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();
        let pkg = store.path_of(9);
        fs::create_dir_all(pkg.join("tests")).unwrap();
        fs::write(pkg.join("Simfile"), "x").unwrap();
        assert!(store.remove(9).unwrap());
        assert!(!pkg.exists());
    }

    #[test]
    fn file_remover_cancel_keeps_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let keep = tmp.path().join("keep");
        let lose = tmp.path().join("lose");
        fs::write(&keep, b"k").unwrap();
        fs::write(&lose, b"l").unwrap();

        let keeper = FileRemover::new(&keep);
        let _loser = FileRemover::new(&lose);
        keeper.cancel();
        drop(_loser);
        assert!(keep.exists());
        assert!(!lose.exists());
    }
}
