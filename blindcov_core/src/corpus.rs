use rand_core::RngCore;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Defines errors that can arise during corpus operations.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// An operation needed at least one corpus file.
    #[error("Corpus at {0:?} is empty, cannot select an input")]
    CorpusIsEmpty(PathBuf),

    /// The configured corpus path exists but is not a directory.
    #[error("Corpus path {0:?} exists but is not a directory")]
    NotADirectory(PathBuf),

    /// An I/O error occurred while reading or writing the corpus directory.
    #[error("Corpus I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CorpusError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        CorpusError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A corpus file and its contents.
#[derive(Debug, Clone)]
pub struct CorpusEntry {
    pub path: PathBuf,
    pub data: Vec<u8>,
}

/// Append-only directory of inputs that reached unseen blocks. It feeds the
/// splice strategy.
///
/// The directory is the only state: files dropped in by hand (or by another
/// fuzzer) are picked up on the next selection.
#[derive(Debug, Clone)]
pub struct CorpusPool {
    dir: PathBuf,
}

impl CorpusPool {
    /// Opens `dir`, creating it when missing.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CorpusError> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| CorpusError::io(&dir, e))?;
        } else if !dir.is_dir() {
            return Err(CorpusError::NotADirectory(dir));
        }
        Ok(Self { dir })
    }

    /// Regular files in the pool, hidden files excluded, sorted by name.
    pub fn files(&self) -> Result<Vec<PathBuf>, CorpusError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(|e| CorpusError::io(&self.dir, e))? {
            let path = entry.map_err(|e| CorpusError::io(&self.dir, e))?.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if path.is_file() && !hidden {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn len(&self) -> Result<usize, CorpusError> {
        Ok(self.files()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, CorpusError> {
        Ok(self.len()? == 0)
    }

    pub fn random_entry(&self, rng: &mut dyn RngCore) -> Result<CorpusEntry, CorpusError> {
        let files = self.files()?;
        if files.is_empty() {
            return Err(CorpusError::CorpusIsEmpty(self.dir.clone()));
        }
        let path = files[rng.next_u64() as usize % files.len()].clone();
        log::debug!("Randomly selected template file {}", path.display());
        let data = fs::read(&path).map_err(|e| CorpusError::io(&path, e))?;
        Ok(CorpusEntry { path, data })
    }

    /// Copies `source` into the pool under its own file name. Returns `None`
    /// when a file of that name is already there.
    pub fn admit(&self, source: &Path) -> Result<Option<PathBuf>, CorpusError> {
        let Some(name) = source.file_name() else {
            return Err(CorpusError::io(
                source,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
            ));
        };
        let dest = self.dir.join(name);
        if dest.exists() {
            return Ok(None);
        }
        fs::copy(source, &dest).map_err(|e| CorpusError::io(&dest, e))?;
        Ok(Some(dest))
    }
}
