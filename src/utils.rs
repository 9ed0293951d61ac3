//! Utility functions for temp file handling

use std::path::{Path, PathBuf};

/// Generate a fresh, unpredictable file path inside `dir`
///
/// # Examples
///
/// ```
/// use attachment_dl::utils::temp_file_path;
/// use std::path::Path;
///
/// let a = temp_file_path(Path::new("/tmp"), "download");
/// let b = temp_file_path(Path::new("/tmp"), "download");
/// assert_ne!(a, b);
/// assert_eq!(a.extension().unwrap(), "download");
/// ```
pub fn temp_file_path(dir: &Path, extension: &str) -> PathBuf {
    let name: u128 = rand::random();
    dir.join(format!("{name:032x}.{extension}"))
}

/// Delete a file, treating "already gone" as success
pub async fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Blocking variant of [`remove_file_if_exists`] for use on blocking threads
pub fn remove_file_if_exists_blocking(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
