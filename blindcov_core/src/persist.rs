use crate::digest::sha1_hex;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("Failed to write {path:?}: {source}")]
pub struct PersistError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Writes `data` next to `path` and renames it into place, so a reader never
/// observes a half-written file.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), PersistError> {
    let wrap = |source| PersistError {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut staged = tempfile::NamedTempFile::new_in(dir).map_err(wrap)?;
    staged.write_all(data).map_err(wrap)?;
    staged.as_file().sync_all().map_err(wrap)?;
    staged.persist(path).map_err(|e| wrap(e.error))?;
    Ok(())
}

/// Output-directory layout for the files a campaign leaves behind.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    out_dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    pub fn current_state_path(&self, name: &str, extension: &str) -> PathBuf {
        self.out_dir.join(format!("{name}{extension}"))
    }

    /// Rewrites `<name><extension>` with the live template.
    pub fn write_current_state(
        &self,
        name: &str,
        extension: &str,
        template: &[u8],
    ) -> Result<PathBuf, PersistError> {
        let path = self.current_state_path(name, extension);
        log::debug!(
            "Creating or updating current state file {} ({})",
            path.display(),
            sha1_hex(template)
        );
        atomic_write(&path, template)?;
        Ok(path)
    }

    /// Writes `generation_<sha1><extension>` for an accepted candidate.
    pub fn write_generation(&self, extension: &str, data: &[u8]) -> Result<PathBuf, PersistError> {
        let file_hash = sha1_hex(data);
        let path = self.out_dir.join(format!("generation_{file_hash}{extension}"));
        log::info!("Writing discovered generation file {} ({})", file_hash, path.display());
        atomic_write(&path, data)?;
        Ok(path)
    }

    /// Writes `<sha1>.max` for a template that beat the seed's coverage.
    pub fn write_max(&self, data: &[u8]) -> Result<PathBuf, PersistError> {
        let path = self.out_dir.join(format!("{}.max", sha1_hex(data)));
        atomic_write(&path, data)?;
        Ok(path)
    }
}
