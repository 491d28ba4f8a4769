//! File Uploads
//!
//! Extension allow-list and on-disk store for files shared on the board.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Extensions accepted when nothing else is configured
pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &["txt", "png", "jpg", "jpeg", "pdf"];

/// Upload errors
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),
    #[error("Invalid filename: {0:?}")]
    InvalidFilename(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Case-insensitive extension allow-list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFilter {
    allowed: Vec<String>,
}

impl FileFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: extensions
                .into_iter()
                .map(|ext| ext.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_allowed(&self, filename: &str) -> bool {
        Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.allowed.iter().any(|allowed| *allowed == ext)
            })
            .unwrap_or(false)
    }

    pub fn check(&self, filename: &str) -> Result<(), UploadError> {
        if self.is_allowed(filename) {
            Ok(())
        } else {
            Err(UploadError::UnsupportedFileType(filename.to_string()))
        }
    }
}

impl Default for FileFilter {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_EXTENSIONS)
    }
}

/// Reduce a peer-supplied filename to a safe basename
pub fn sanitize_filename(name: &str) -> Result<String, UploadError> {
    let base = name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim();

    if base.is_empty() || base == "." || base == ".." || base.chars().any(char::is_control) {
        return Err(UploadError::InvalidFilename(name.to_string()));
    }
    Ok(base.to_string())
}

/// Directory that received files are written into
#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
    filter: FileFilter,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>, filter: FileFilter) -> Self {
        Self {
            root: root.into(),
            filter,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }


    /// Persist `content` under the sanitized `filename`, replacing any
    /// earlier upload of the same name
    pub fn store(&self, filename: &str, content: &[u8]) -> Result<PathBuf, UploadError> {
        let name = sanitize_filename(filename)?;
        self.filter.check(&name)?;

        fs::create_dir_all(&self.root)?;
        let path = self.root.join(&name);
        fs::write(&path, content)?;

        log::info!("Stored upload {} ({} bytes)", path.display(), content.len());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allow_list() {
        let filter = FileFilter::default();
        assert!(filter.is_allowed("notes.txt"));
        assert!(filter.is_allowed("Photo.JPG"));
        assert!(filter.is_allowed("scan.pdf"));
        assert!(!filter.is_allowed("notes.exe"));
        assert!(!filter.is_allowed("README"));
        assert!(!filter.is_allowed(".txt"));
    }

    #[test]
    fn test_custom_extensions_accept_dots() {
        let filter = FileFilter::new([".md", "CSV"]);
        assert!(filter.is_allowed("a.md"));
        assert!(filter.is_allowed("b.csv"));
        assert!(!filter.is_allowed("c.txt"));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd.txt").unwrap(), "passwd.txt");
        assert_eq!(sanitize_filename("C:\\temp\\a.png").unwrap(), "a.png");
        assert!(sanitize_filename("..").is_err());
        assert!(sanitize_filename("dir/").is_err());
        assert!(sanitize_filename("bad\nname.txt").is_err());
    }

    #[test]
    fn test_store_writes_into_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path().join("uploads"), FileFilter::default());

        let path = store.store("../sneaky/notes.txt", b"hello").unwrap();
        assert_eq!(path, dir.path().join("uploads").join("notes.txt"));
        assert_eq!(fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn test_store_rejects_unlisted_extension() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path(), FileFilter::default());

        let result = store.store("notes.exe", b"MZ");
        assert!(matches!(result, Err(UploadError::UnsupportedFileType(_))));
        assert!(!dir.path().join("notes.exe").exists());
    }
}
