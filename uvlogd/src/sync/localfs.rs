use std::io;
use std::path::Path;

/// Whether the target exists on disk at all.
pub fn exists(path: &Path) -> bool {
    path.exists()
}

/// Byte size of a file, or the recursive sum for a directory.
///
/// Unreadable children are counted as zero rather than failing the whole
/// walk; one bad entry must not abort a reconciliation pass.
pub fn entry_size(path: &Path) -> io::Result<u64> {
    let meta = std::fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }

    let mut total = 0u64;
    for entry in std::fs::read_dir(path)? {
        let Ok(entry) = entry else { continue };
        total = total.saturating_add(entry_size(&entry.path()).unwrap_or(0));
    }
    Ok(total)
}

/// `entry_size` for callers that treat a missing target as "no size".
pub fn entry_size_opt(path: &Path) -> Option<u64> {
    entry_size(path).ok()
}
