use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Synchronization state shared by files and folders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// Known remotely, not yet attempted locally.
    New,
    /// A transfer is in progress or queued.
    Downloading,
    /// The last transfer attempt failed.
    Error,
    /// Local copy exists but disagrees with the remote size, or children are
    /// partially present.
    Incomplete,
    /// Local copy matches the remote exactly.
    Sync,
    /// The remote no longer reports this entity; a local copy may remain.
    Local,
    /// Fallback when no other rule applies.
    Unknown,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::New => "new",
            SyncState::Downloading => "downloading",
            SyncState::Error => "error",
            SyncState::Incomplete => "incomplete",
            SyncState::Sync => "sync",
            SyncState::Local => "local",
            SyncState::Unknown => "unknown",
        }
    }
}

/// One remote file, or one subdirectory holding plain files (the server
/// reports a single level of nesting).
///
/// Identity is the relative `name` alone: two `LogFile`s with equal names are
/// the same entity no matter their size, host, or state. All membership
/// checks in the reconciliation pass rely on this.
#[derive(Debug, Clone)]
pub struct LogFile {
    pub name: String,
    pub host: String,
    /// `None` for a directory whose aggregate size has not been measured yet.
    pub size: Option<u64>,
    pub state: SyncState,
    /// `Some` for directories, `None` for plain files.
    pub children: Option<Vec<LogFile>>,
}

impl LogFile {
    pub fn new_file(name: impl Into<String>, host: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            size,
            state: SyncState::New,
            children: None,
        }
    }

    pub fn new_directory(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            size: None,
            state: SyncState::New,
            children: Some(Vec::new()),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.children.is_some()
    }
}

impl PartialEq for LogFile {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for LogFile {}

impl Hash for LogFile {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// One remote log session directory, named by a timestamp-like identifier.
#[derive(Debug, Clone)]
pub struct LogFolder {
    pub name: String,
    pub state: SyncState,
    pub files: Vec<LogFile>,
    /// Hosts that reported this folder in the latest listing, in report order.
    pub hosts: Vec<String>,
}

impl LogFolder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: SyncState::New,
            files: Vec::new(),
            hosts: Vec::new(),
        }
    }

    pub fn file(&self, name: &str) -> Option<&LogFile> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn file_mut(&mut self, name: &str) -> Option<&mut LogFile> {
        self.files.iter_mut().find(|f| f.name == name)
    }

    /// Recomputes the folder state from its children via the aggregation
    /// table.
    pub fn refresh_state(&mut self) {
        self.state = aggregate_states(self.files.iter().map(|f| f.state));
    }
}

/// Folds a multiset of child states into one aggregate state.
///
/// The priority order below is user-visible (it drives the status icons) and
/// must not be reordered. The "new + local" branch fires before the
/// all-`New` branch whenever both hold; both are kept deliberately.
pub fn aggregate_states<I>(states: I) -> SyncState
where
    I: IntoIterator<Item = SyncState>,
{
    let mut counts: HashMap<SyncState, usize> = HashMap::new();
    let mut total = 0usize;
    for state in states {
        *counts.entry(state).or_insert(0) += 1;
        total += 1;
    }
    if total == 0 {
        return SyncState::Unknown;
    }
    let count = |state: SyncState| counts.get(&state).copied().unwrap_or(0);

    let n_downloading = count(SyncState::Downloading);
    let n_error = count(SyncState::Error);
    let n_new = count(SyncState::New);
    let n_incomplete = count(SyncState::Incomplete);
    let n_local = count(SyncState::Local);
    let n_sync = count(SyncState::Sync);
    let n_unknown = count(SyncState::Unknown);

    if n_downloading > 0 {
        SyncState::Downloading
    } else if n_error > 0 {
        SyncState::Error
    } else if n_sync == total {
        SyncState::Sync
    } else if n_new + n_local == total {
        SyncState::New
    } else if n_sync + n_incomplete + n_unknown + n_new + n_local == total {
        SyncState::Incomplete
    } else if n_local == total {
        SyncState::Local
    } else if n_new == total {
        SyncState::New
    } else {
        SyncState::Unknown
    }
}
