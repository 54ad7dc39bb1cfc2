//! Resume state persisted next to the downloads: the checkpoint of
//! per-file outcomes and the retrieval retry queue.

pub mod checkpoint;
pub mod error;
pub mod retrieval_queue;

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

pub use checkpoint::CheckpointStore;
pub use error::StateError;
pub use retrieval_queue::{RetrievalItem, RetrievalQueue};

/// Load a JSON state file. A missing file is `Ok(None)`.
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StateError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| StateError::Malformed {
            path: path.to_path_buf(),
            source,
        })
}

/// Write pretty JSON through a sibling temp file and rename it into place,
/// so a crash mid-write never leaves a truncated state file. With `private`
/// the file is readable by the owner only.
fn write_json<T: Serialize>(path: &Path, value: &T, private: bool) -> Result<(), StateError> {
    let data = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| StateError::write(parent, e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    std::fs::write(&tmp, data).map_err(|e| StateError::write(&tmp, e))?;
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| StateError::write(&tmp, e))?;
    }
    #[cfg(not(unix))]
    let _ = private;
    std::fs::rename(&tmp, path).map_err(|e| StateError::write(path, e))
}
