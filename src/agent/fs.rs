//! Local file helpers for the node agents

use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, info};

/// Write `contents` to `path` unless it already holds exactly that
///
/// Returns whether the file changed. The write goes through a temporary
/// file and a rename so a daemon never reads half a config.
pub fn write_if_changed(path: &Path, contents: &str) -> Result<bool> {
    match std::fs::read(path) {
        Ok(current) if current == contents.as_bytes() => {
            debug!("{} is up to date", path.display());
            return Ok(false);
        },
        Ok(_) => {},
        Err(e) if e.kind() == ErrorKind::NotFound => {},
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        },
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    info!("Wrote {}", path.display());
    Ok(true)
}

/// Copy `src` to `dst` only if `dst` does not exist, keeping the mode
///
/// Returns whether a copy was made.
pub fn copy_if_not_exist(src: &Path, dst: &Path) -> Result<bool> {
    if dst.exists() {
        return Ok(false);
    }
    std::fs::copy(src, dst)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
    let permissions = std::fs::metadata(src)
        .with_context(|| format!("Failed to stat {}", src.display()))?
        .permissions();
    std::fs::set_permissions(dst, permissions)
        .with_context(|| format!("Failed to set mode on {}", dst.display()))?;
    info!("Copied {} to {}", src.display(), dst.display());
    Ok(true)
}

/// Create `dir` if needed and restrict it to its owner
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to chmod {}", dir.display()))?;
    }
    Ok(())
}

/// Trimmed contents of `path`, `None` if it does not exist
pub fn read_trimmed(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(Some(s.trim().to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}
