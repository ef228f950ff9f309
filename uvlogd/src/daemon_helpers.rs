fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        home.to_path_buf()
    } else if let Some(stripped) = value.strip_prefix("~/") {
        home.join(stripped)
    } else {
        PathBuf::from(value)
    }
}

fn parse_hosts(value: &str) -> Vec<String> {
    let mut hosts = Vec::new();
    for raw in value.split(',') {
        let host = raw.trim();
        if !host.is_empty() && !hosts.iter().any(|existing| existing == host) {
            hosts.push(host.to_string());
        }
    }
    hosts
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Folder states the poll loop keeps requesting. `Error` retries on the poll
/// cadence; `Downloading` covers workers parked in a retryable terminal
/// phase such as a timeout — entities with a live worker are deduplicated by
/// the download manager, so re-requesting them is a no-op.
fn wants_auto_download(state: SyncState) -> bool {
    matches!(
        state,
        SyncState::New | SyncState::Incomplete | SyncState::Error | SyncState::Downloading
    )
}

/// One global status line: the aggregation table applied to the folder
/// states themselves.
fn format_summary_line(folders: &[LogFolder], changes: usize) -> String {
    let overall = aggregate_states(folders.iter().map(|f| f.state));
    format!(
        "overall: {}  {} folder(s), {} change(s)",
        overall.as_str(),
        folders.len(),
        changes
    )
}

fn format_folder_line(folder: &LogFolder) -> String {
    let files = folder.files.len();
    let synced = folder
        .files
        .iter()
        .filter(|file| file.state == SyncState::Sync)
        .count();
    format!(
        "  {}  [{}]  {synced}/{files} synced  hosts={}",
        folder.name,
        folder.state.as_str(),
        folder.hosts.join(",")
    )
}
