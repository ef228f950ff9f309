use std::path::Path;

use uvlog_core::{EntryKind, LogEntry};

use super::localfs;
use super::model::{LogFile, LogFolder, SyncState};
use super::paths::file_path_for;

/// One remote entry with its owning host attached. Directory entries carry
/// their children (one level deep), matching the server payload.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub name: String,
    pub host: String,
    pub size: Option<u64>,
    pub is_directory: bool,
    pub children: Vec<RemoteEntry>,
}

impl RemoteEntry {
    pub fn from_listing(entry: &LogEntry, host: &str) -> Self {
        Self {
            name: entry.name.clone(),
            host: host.to_string(),
            size: entry.size,
            is_directory: entry.kind == EntryKind::Dir,
            children: entry
                .entries
                .iter()
                .map(|child| Self::from_listing(child, host))
                .collect(),
        }
    }

    /// Remote byte size used for all comparisons: a file's reported length,
    /// or the sum over a directory's children once the server has listed
    /// them.
    fn total_size(&self) -> Option<u64> {
        if !self.is_directory {
            return self.size;
        }
        if self.children.is_empty() {
            return self.size;
        }
        Some(
            self.children
                .iter()
                .map(|c| c.total_size().unwrap_or(0))
                .sum(),
        )
    }
}

/// One reconcilable folder: merged host tags plus the fetched entries.
/// `entries` is `None` when the folder is present in the index but its
/// listing could not be obtained this pass; the folder is then left as-is
/// rather than treated as stale.
#[derive(Debug, Clone)]
pub struct FolderEntries {
    pub name: String,
    pub hosts: Vec<String>,
    pub entries: Option<Vec<RemoteEntry>>,
}

/// Counts of what a reconciliation pass touched, for the status log line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileDelta {
    pub new_folders: usize,
    pub stale_folders: usize,
    pub added_files: usize,
    pub updated_files: usize,
    pub stale_files: usize,
    pub removed_files: usize,
    pub skipped: usize,
}

impl ReconcileDelta {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Merges per-host folder indexes into one ordered list of
/// `(folder, hosts)`, first-seen order, host tags appended not overwritten.
pub fn merge_folder_hosts<I>(listings: I) -> Vec<(String, Vec<String>)>
where
    I: IntoIterator<Item = (String, Vec<String>)>,
{
    let mut merged: Vec<(String, Vec<String>)> = Vec::new();
    for (host, folders) in listings {
        for folder in folders {
            match merged.iter_mut().find(|(name, _)| *name == folder) {
                Some((_, hosts)) => {
                    if !hosts.contains(&host) {
                        hosts.push(host.clone());
                    }
                }
                None => merged.push((folder, vec![host.clone()])),
            }
        }
    }
    merged
}

/// Splits off the lexicographically greatest folder name: that is the log
/// the vehicle is still writing and it is never offered for transfer.
/// Assumes folder names sort chronologically, which holds for the
/// timestamp-derived naming scheme.
pub fn partition_active(
    mut folders: Vec<(String, Vec<String>)>,
) -> (Vec<(String, Vec<String>)>, Option<String>) {
    let Some(max) = folders.iter().map(|(name, _)| name.clone()).max() else {
        return (folders, None);
    };
    folders.retain(|(name, _)| *name != max);
    (folders, Some(max))
}

/// Reconciles the in-memory model against a fresh remote inventory.
///
/// Existing folders are updated first, disappeared folders are marked
/// local, and brand-new folders are bootstrapped last. The caller is
/// expected to have excluded the active folder already.
pub fn reconcile_all(
    model: &mut Vec<LogFolder>,
    remote: &[FolderEntries],
    local_root: &Path,
) -> ReconcileDelta {
    let mut delta = ReconcileDelta::default();

    for folder in model.iter_mut() {
        match remote.iter().find(|r| r.name == folder.name) {
            Some(listing) => {
                folder.hosts = listing.hosts.clone();
                if let Some(entries) = &listing.entries {
                    reconcile_folder(folder, entries, local_root, &mut delta);
                }
            }
            None => {
                // The server stopped reporting this session entirely.
                for file in &mut folder.files {
                    file.state = SyncState::Local;
                }
                folder.state = SyncState::Local;
                delta.stale_folders += 1;
            }
        }
    }

    for listing in remote {
        if model.iter().any(|f| f.name == listing.name) {
            continue;
        }
        // A folder we cannot list yet is left for the next pass.
        let Some(entries) = &listing.entries else {
            continue;
        };
        let folder = bootstrap_folder(&listing.name, &listing.hosts, entries, local_root, &mut delta);
        model.push(folder);
        delta.new_folders += 1;
    }

    delta
}

/// Applies the per-file update rules to one previously known folder.
pub fn reconcile_folder(
    folder: &mut LogFolder,
    entries: &[RemoteEntry],
    local_root: &Path,
    delta: &mut ReconcileDelta,
) {
    let folder_name = folder.name.clone();
    let mut remove: Vec<String> = Vec::new();

    // Known files first, brand-new remote entries afterwards.
    for file in folder.files.iter_mut() {
        let target = match file_path_for(local_root, &folder_name, &file.name) {
            Ok(target) => target,
            Err(err) => {
                eprintln!("[uvlogd] skipping {}/{}: {err}", folder_name, file.name);
                delta.skipped += 1;
                continue;
            }
        };
        match entries.iter().find(|e| e.name == file.name) {
            Some(entry) => {
                update_known_file(file, entry, &target);
                delta.updated_files += 1;
            }
            None => {
                // Stale: gone from the server. Keep the record only while a
                // local copy exists; removal is deferred until after the
                // loop.
                file.state = SyncState::Local;
                delta.stale_files += 1;
                if !localfs::exists(&target) {
                    remove.push(file.name.clone());
                }
            }
        }
    }

    if !remove.is_empty() {
        folder.files.retain(|f| !remove.contains(&f.name));
        delta.removed_files += remove.len();
    }

    for entry in entries {
        if folder.files.iter().any(|f| f.name == entry.name) {
            continue;
        }
        match file_path_for(local_root, &folder_name, &entry.name) {
            Ok(target) => {
                folder.files.push(classify_on_disk(entry, &target));
                delta.added_files += 1;
            }
            Err(err) => {
                eprintln!("[uvlogd] skipping {}/{}: {err}", folder_name, entry.name);
                delta.skipped += 1;
            }
        }
    }

    folder.refresh_state();
}

/// Update rules for a file that persists in the new listing.
fn update_known_file(file: &mut LogFile, entry: &RemoteEntry, target: &Path) {
    let remote_size = entry.total_size();

    if file.size.is_none() {
        // Unmeasured until now; adopt whatever the server reports.
        file.size = remote_size;
    } else if file.size != remote_size {
        // Data changed remotely since the last pass.
        if matches!(file.state, SyncState::Sync | SyncState::Local) {
            file.state = SyncState::Incomplete;
        }
        file.size = remote_size;
    } else if file.state == SyncState::Local {
        // Remote reappeared unchanged.
        file.state = SyncState::Sync;
    }
    file.host = entry.host.clone();

    if entry.is_directory {
        reconcile_directory_children(file, entry, target);
    }

    // Presence on disk decides last. A missing target is only acceptable
    // while nothing has been attempted yet or a transfer is underway.
    if !localfs::exists(target) {
        if !matches!(file.state, SyncState::New | SyncState::Downloading) {
            file.state = SyncState::Incomplete;
        }
    } else if let (Some(on_disk), Some(expected)) = (localfs::entry_size_opt(target), file.size)
        && on_disk != expected
        && file.state == SyncState::Sync
    {
        file.state = SyncState::Incomplete;
    }
}

/// One level of recursion: reconcile a directory's children by name.
fn reconcile_directory_children(dir: &mut LogFile, entry: &RemoteEntry, dir_target: &Path) {
    let children = dir.children.get_or_insert_with(Vec::new);

    // Children the server no longer lists are dropped outright.
    children.retain(|child| entry.children.iter().any(|e| e.name == child.name));

    for child in children.iter_mut() {
        let Some(remote_child) = entry.children.iter().find(|e| e.name == child.name) else {
            continue;
        };
        let child_target = dir_target.join(&child.name);
        update_known_file(child, remote_child, &child_target);
    }

    let mut gained = false;
    for remote_child in &entry.children {
        if children.iter().any(|c| c.name == remote_child.name) {
            continue;
        }
        let child_target = dir_target.join(&remote_child.name);
        children.push(classify_on_disk(remote_child, &child_target));
        gained = true;
    }
    if gained {
        dir.state = SyncState::Incomplete;
    }
}

/// First classification of an entry the model has never seen: compare
/// against the disk if a copy is already there, otherwise it is new.
fn classify_on_disk(entry: &RemoteEntry, target: &Path) -> LogFile {
    let mut file = if entry.is_directory {
        let mut dir = LogFile::new_directory(entry.name.clone(), entry.host.clone());
        dir.children = Some(
            entry
                .children
                .iter()
                .map(|child| classify_on_disk(child, &target.join(&child.name)))
                .collect(),
        );
        dir
    } else {
        LogFile::new_file(entry.name.clone(), entry.host.clone(), None)
    };
    file.size = entry.total_size();

    file.state = if !localfs::exists(target) {
        SyncState::New
    } else {
        match (localfs::entry_size_opt(target), file.size) {
            (Some(on_disk), Some(expected)) if on_disk == expected => SyncState::Sync,
            _ => SyncState::Incomplete,
        }
    };
    file
}

/// Builds the model entry for a folder name never seen before.
fn bootstrap_folder(
    name: &str,
    hosts: &[String],
    entries: &[RemoteEntry],
    local_root: &Path,
    delta: &mut ReconcileDelta,
) -> LogFolder {
    let mut folder = LogFolder::new(name);
    folder.hosts = hosts.to_vec();

    for entry in entries {
        match file_path_for(local_root, name, &entry.name) {
            Ok(target) => {
                folder.files.push(classify_on_disk(entry, &target));
                delta.added_files += 1;
            }
            Err(err) => {
                eprintln!("[uvlogd] skipping {name}/{}: {err}", entry.name);
                delta.skipped += 1;
            }
        }
    }

    folder.refresh_state();
    folder
}
