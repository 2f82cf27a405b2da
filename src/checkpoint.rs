//! Checkpoint file handling.
//!
//! Snapshots are serialized from the in-memory structures first and only
//! then written out, to a temporary file that replaces the real one on
//! success. A failed write leaves the previous checkpoint intact; the
//! caller logs it and retries on the next snapshot interval.

use std::path::Path;

use tracing::warn;

/// Write `contents` to `path` via a temporary sibling file and rename.
pub fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);

    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

/// Read a checkpoint if it exists; a missing file is a normal first start.
pub fn read_if_exists(path: &Path) -> std::io::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Best-effort snapshot: log loudly on failure, never propagate. The
/// daemon keeps serving from memory either way.
pub fn save_or_warn(path: &Path, contents: &str, what: &str) {
    if let Err(e) = write_atomic(path, contents) {
        warn!("could not write {what} checkpoint to {}: {e}", path.display());
    }
}
