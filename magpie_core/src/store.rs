//! Durable storage for admitted corpus entries.
//!
//! The store is a flat directory of paired files: the payload named by its
//! sequential corpus id and configured extension, and a sibling coverage
//! artifact with the same stem plus the `.sancov` suffix. Entries are written
//! once at admission time and never mutated afterwards.

use std::fs;
use std::path::PathBuf;
use thiserror::Error;

const ARTIFACT_SUFFIX: &str = "sancov";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("corpus store I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

#[derive(Debug)]
pub struct CorpusStore {
    dir: PathBuf,
    extension: String,
}

impl CorpusStore {
    /// Opens (creating if necessary) the corpus output directory.
    pub fn open(dir: PathBuf, extension: &str) -> Result<Self, StoreError> {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| {
                StoreError::Io(format!("failed to create corpus directory {dir:?}: {e}"))
            })?;
        } else if !dir.is_dir() {
            return Err(StoreError::Io(format!(
                "corpus path {dir:?} exists but is not a directory"
            )));
        }
        Ok(Self {
            dir,
            extension: extension.trim_start_matches('.').to_string(),
        })
    }

    fn payload_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("corpus{}.{}", id, self.extension))
    }

    /// Writes the payload/artifact pair for corpus entry `id`, returning the
    /// payload path.
    pub fn persist(
        &self,
        id: u64,
        payload: &[u8],
        artifact: &[u8],
    ) -> Result<PathBuf, StoreError> {
        let payload_path = self.payload_path(id);
        let artifact_path = payload_path.with_extension(format!(
            "{}.{}",
            self.extension, ARTIFACT_SUFFIX
        ));
        fs::write(&payload_path, payload).map_err(|e| {
            StoreError::Io(format!("failed to write corpus file {payload_path:?}: {e}"))
        })?;
        fs::write(&artifact_path, artifact).map_err(|e| {
            StoreError::Io(format!(
                "failed to write coverage artifact {artifact_path:?}: {e}"
            ))
        })?;
        Ok(payload_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn persist_writes_paired_files() {
        let base = tempdir().unwrap();
        let store = CorpusStore::open(base.path().join("out"), "pdf").unwrap();
        let path = store.persist(1, b"%PDF-1.4 payload", b"\x01\x00\x00\x00\x00\x00\x00\x00").unwrap();

        assert_eq!(path, base.path().join("out/corpus1.pdf"));
        assert_eq!(fs::read(&path).unwrap(), b"%PDF-1.4 payload");
        assert_eq!(
            fs::read(base.path().join("out/corpus1.pdf.sancov")).unwrap(),
            b"\x01\x00\x00\x00\x00\x00\x00\x00"
        );
    }

    #[test]
    fn open_creates_missing_directory() {
        let base = tempdir().unwrap();
        let target = base.path().join("a/b/corpus");
        CorpusStore::open(target.clone(), "bin").unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn open_rejects_non_directory_path() {
        let base = tempdir().unwrap();
        let file_path = base.path().join("occupied");
        fs::write(&file_path, b"not a dir").unwrap();
        let err = CorpusStore::open(file_path, "bin").unwrap_err();
        let StoreError::Io(msg) = err;
        assert!(msg.contains("not a directory"));
    }

    #[test]
    fn extension_leading_dot_is_normalized() {
        let base = tempdir().unwrap();
        let store = CorpusStore::open(base.path().to_path_buf(), ".png").unwrap();
        let path = store.persist(3, b"p", b"a").unwrap();
        assert_eq!(path.file_name().unwrap(), "corpus3.png");
    }
}
