use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("remote name is empty")]
    Empty,
    #[error("remote name contains unsupported component")]
    UnsupportedComponent,
}

/// Maps a remote folder name under the local log root.
pub fn folder_path_for(local_root: &Path, folder: &str) -> Result<PathBuf, PathError> {
    join_checked(local_root, folder)
}

/// Maps a remote file name (relative to its folder) under the local copy of
/// that folder.
pub fn file_path_for(
    local_root: &Path,
    folder: &str,
    rel_path: &str,
) -> Result<PathBuf, PathError> {
    let folder_path = folder_path_for(local_root, folder)?;
    join_checked(&folder_path, rel_path)
}

fn join_checked(base: &Path, remote: &str) -> Result<PathBuf, PathError> {
    if remote.is_empty() {
        return Err(PathError::Empty);
    }

    // Remote names are POSIX-like ("mra/Data.jsf"); map them under base.
    let mut out = base.to_path_buf();
    for component in Path::new(remote).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir => continue,
            Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}
