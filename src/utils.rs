use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Create a directory (and parents) if needed, returning its path.
pub fn ensure_dir(dir: impl AsRef<Path>) -> Result<PathBuf> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    Ok(dir.to_path_buf())
}

/// Reduce an arbitrary key to a filesystem-safe file name. Anything outside
/// `[A-Za-z0-9._-]` becomes an underscore; path traversal cannot survive.
pub fn safe_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

/// Base directory for config and state. `CONCIERGE_HOME` overrides the
/// default of `~/.concierge`.
pub fn get_concierge_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("CONCIERGE_HOME") {
        if !home.trim().is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".concierge"))
}

/// Write a file via tempfile + rename so readers never observe partial
/// content. The tempfile lives in the target directory to keep the rename on
/// one filesystem.
pub fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("Path has no parent directory: {}", path.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create tempfile in {}", dir.display()))?;
    tmp.write_all(content.as_bytes())?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to persist {}", path.display()))?;
    Ok(())
}
