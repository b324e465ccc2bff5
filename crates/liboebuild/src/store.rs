use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::{
    error::{OebuildError, Result},
    types::EnvRecord,
};

/// Read and parse a YAML document.
pub fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    debug!(path = %path.display(), "reading document");
    let contents = fs::read_to_string(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            OebuildError::DocumentError {
                path: path.to_path_buf(),
                message: "file not found".to_string(),
            }
        } else {
            OebuildError::IoError(e)
        }
    })?;
    serde_yaml::from_str(&contents).map_err(|e| OebuildError::DocumentError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Serialize `document` and replace the file at `path` with it.
pub fn write_document<T: Serialize>(path: &Path, document: &T) -> Result<()> {
    write_document_with_banner(path, "", document)
}

/// Like [`write_document`], prefixing the output with `banner` verbatim.
pub fn write_document_with_banner<T: Serialize>(
    path: &Path,
    banner: &str,
    document: &T,
) -> Result<()> {
    // Serialize before touching the filesystem so a failure leaves the old file intact.
    let encoded = serde_yaml::to_string(document).map_err(|e| OebuildError::DocumentError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    ensure_file(path)?;
    debug!(path = %path.display(), "writing document");
    fs::write(path, format!("{banner}{encoded}"))?;
    Ok(())
}

/// Create `path` (and its parents) as an empty file when it does not exist.
pub fn ensure_file(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::File::create(path)?;
    Ok(())
}

/// Store for reading and writing the environment record of a build context.
pub struct EnvRecordStore {
    /// Path of the `.env` document.
    path: PathBuf,
}

impl EnvRecordStore {
    /// File name of the environment record within a build context.
    pub const FILE_NAME: &'static str = ".env";

    /// Create a store rooted at the provided build context directory.
    pub fn new(build_dir: &Path) -> Self {
        Self {
            path: build_dir.join(Self::FILE_NAME),
        }
    }

    /// Read the record, returning an empty record when none exists.
    pub fn read(&self) -> Result<EnvRecord> {
        if !self.path.exists() {
            return Ok(EnvRecord::default());
        }
        // An empty file is an empty record.
        if fs::metadata(&self.path)?.len() == 0 {
            return Ok(EnvRecord::default());
        }
        read_document(&self.path)
    }

    /// Persist the record.
    pub fn write(&self, record: &EnvRecord) -> Result<()> {
        write_document(&self.path, record)
    }

    /// Remove the record if present.
    pub fn remove(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Path of the underlying document.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use tempfile::tempdir;

    use super::*;
    use crate::types::{ContainerRecord, DockerConfig};

    #[test]
    fn env_record_round_trip() {
        let tmp = tempdir().unwrap();
        let store = EnvRecordStore::new(tmp.path());

        let record = EnvRecord {
            container: Some(ContainerRecord {
                short_id: "abc123".to_string(),
            }),
        };

        store.write(&record).unwrap();
        let loaded = store.read().unwrap();
        assert_eq!(record, loaded);
    }

    #[test]
    fn missing_env_record_reads_empty() {
        let tmp = tempdir().unwrap();
        let store = EnvRecordStore::new(tmp.path());

        assert_eq!(store.read().unwrap(), EnvRecord::default());
        ensure_file(store.path()).unwrap();
        assert_eq!(store.read().unwrap(), EnvRecord::default());
    }

    #[test]
    fn write_creates_parent_directories() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("a").join("b").join("doc.yaml");
        let mut tag_map = IndexMap::new();
        tag_map.insert("master".to_string(), "latest".to_string());
        let doc = DockerConfig {
            repo_url: "example/image".to_string(),
            tag_map,
        };

        write_document(&path, &doc).unwrap();
        let loaded: DockerConfig = read_document(&path).unwrap();
        assert_eq!(doc, loaded);
    }

    #[test]
    fn mapping_order_is_preserved() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("doc.yaml");
        let mut tag_map = IndexMap::new();
        tag_map.insert("zeta".to_string(), "1".to_string());
        tag_map.insert("alpha".to_string(), "2".to_string());
        let doc = DockerConfig {
            repo_url: "example/image".to_string(),
            tag_map,
        };

        write_document(&path, &doc).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.find("zeta").unwrap() < text.find("alpha").unwrap());
    }

    #[test]
    fn banner_precedes_document() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("doc.yaml");
        let record = EnvRecord::default();
        write_document_with_banner(&path, "# banner\n", &record).unwrap();
        assert!(fs::read_to_string(&path).unwrap().starts_with("# banner\n"));
    }

    #[test]
    fn missing_document_is_reported() {
        let tmp = tempdir().unwrap();
        let err = read_document::<EnvRecord>(&tmp.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, OebuildError::DocumentError { .. }));
    }
}
