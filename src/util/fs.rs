use std::fs;
use std::path::Path;

use crate::core::error::{Error, Result};

/// Recursively ensure a directory exists.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| Error::io(format!("creating directory {}", path.display()), e))
}

/// Write contents to a file, creating parent directories if needed.
pub fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    fs::write(path, contents).map_err(|e| Error::io(format!("writing {}", path.display()), e))
}
