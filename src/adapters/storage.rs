use crate::domain::ports::Storage;
use crate::utils::error::{Result, RfError};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Artifact storage rooted at a local directory.
///
/// Storage paths are relative and may not climb out of the root, so a design name can never
/// place artifacts elsewhere on disk.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: String,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// On-disk location of a storage path, for reporting.
    pub fn resolve(&self, path: &str) -> PathBuf {
        Path::new(&self.base_path).join(path)
    }

    fn checked(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let confined = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !confined {
            return Err(RfError::InvalidConfigValueError {
                field: "storage path".to_string(),
                value: path.to_string(),
                reason: "must be a relative path inside the output directory".to_string(),
            });
        }
        Ok(self.resolve(path))
    }
}

impl Storage for LocalStorage {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.checked(path)?;
        Ok(fs::read(full_path)?)
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.checked(path)?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::debug!("💾 {} bytes -> {}", data.len(), full_path.display());
        fs::write(full_path, data)?;
        Ok(())
    }
}
