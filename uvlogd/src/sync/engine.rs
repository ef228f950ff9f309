use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use uvlog_core::LogServerClient;

use super::dispatch::{DownloadJob, DownloadManager, WorkerEvent};
use super::model::{LogFile, LogFolder, SyncState, aggregate_states};
use super::paths::file_path_for;
use super::reconcile::{
    FolderEntries, ReconcileDelta, RemoteEntry, merge_folder_hosts, partition_active,
    reconcile_all,
};
use super::tickets::TicketQueue;
use super::transfer::TransferClient;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no folder index obtained from any host")]
    ListUnavailable,
    #[error("unknown folder: {0}")]
    UnknownFolder(String),
    #[error("unknown file: {0}/{1}")]
    UnknownFile(String, String),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub hosts: Vec<String>,
    pub local_root: PathBuf,
    pub max_parallel: usize,
    pub request_timeout: Duration,
}

/// Owns the folder/file model and drives it through refresh passes and
/// download dispatch.
///
/// All model mutation happens behind one mutex, entered only from the
/// engine's own methods; transfer workers report phase changes over the
/// event channel returned by [`LogSyncEngine::new`] and the caller feeds
/// them back through [`apply_worker_event`](Self::apply_worker_event).
pub struct LogSyncEngine {
    client: LogServerClient,
    hosts: Vec<String>,
    local_root: PathBuf,
    model: Mutex<Vec<LogFolder>>,
    manager: DownloadManager,
}

impl LogSyncEngine {
    pub fn new(
        client: LogServerClient,
        config: EngineConfig,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let tickets = Arc::new(TicketQueue::new(config.max_parallel));
        let manager = DownloadManager::new(
            tickets,
            TransferClient::new(config.request_timeout),
            events_tx,
        );
        let engine = Self {
            client,
            hosts: config.hosts,
            local_root: config.local_root,
            model: Mutex::new(Vec::new()),
            manager,
        };
        (engine, events_rx)
    }

    /// Fetches the remote inventory and reconciles the model against it.
    ///
    /// A host whose folder index cannot be fetched is skipped; if no host
    /// answers at all the pass fails and the model is left untouched. A
    /// folder whose entry listing fails stays as it was until the next pass,
    /// and so does a folder whose every recorded host failed its index fetch.
    pub async fn refresh_once(&self) -> Result<ReconcileDelta, EngineError> {
        let mut per_host = Vec::new();
        let mut answered: HashSet<String> = HashSet::new();
        for host in &self.hosts {
            match self.client.list_folders(host).await {
                Ok(folders) => {
                    answered.insert(host.clone());
                    per_host.push((host.clone(), folders));
                }
                Err(err) if err.is_retryable() => {
                    eprintln!("[uvlogd] folder index from {host} unavailable, will retry: {err}");
                }
                Err(err) => {
                    eprintln!("[uvlogd] folder index from {host} unavailable: {err}");
                }
            }
        }
        if per_host.is_empty() {
            return Err(EngineError::ListUnavailable);
        }

        let (folders, _active) = partition_active(merge_folder_hosts(per_host));

        let mut remote = Vec::with_capacity(folders.len());
        for (name, hosts) in folders {
            let mut entries = Vec::new();
            let mut listed = false;
            for host in &hosts {
                match self.client.list_folder(host, &name).await {
                    Ok(listing) => {
                        listed = true;
                        entries.extend(
                            listing
                                .iter()
                                .map(|entry| RemoteEntry::from_listing(entry, host)),
                        );
                    }
                    Err(err) => {
                        eprintln!("[uvlogd] listing {name} from {host} failed: {err}");
                    }
                }
            }
            remote.push(FolderEntries {
                name,
                hosts,
                entries: listed.then_some(entries),
            });
        }

        let mut model = self.lock_model();
        // A known folder absent from the merged index is only stale when one
        // of its hosts actually answered; if every recorded host failed the
        // fetch this pass, treat the folder as unlistable, not stale.
        for folder in model.iter() {
            if remote.iter().any(|r| r.name == folder.name) {
                continue;
            }
            if !folder.hosts.is_empty() && folder.hosts.iter().all(|h| !answered.contains(h)) {
                remote.push(FolderEntries {
                    name: folder.name.clone(),
                    hosts: folder.hosts.clone(),
                    entries: None,
                });
            }
        }
        Ok(reconcile_all(&mut model, &remote, &self.local_root))
    }

    /// Dispatches a download worker for every eligible file of a folder.
    /// Files already `Sync` or `Local` have nothing to fetch and are left
    /// alone. Returns how many workers were started.
    pub fn request_folder(&self, folder_name: &str) -> Result<usize, EngineError> {
        let mut model = self.lock_model();
        let folder = model
            .iter_mut()
            .find(|f| f.name == folder_name)
            .ok_or_else(|| EngineError::UnknownFolder(folder_name.to_string()))?;

        let name = folder.name.clone();
        let mut started = 0;
        for file in folder.files.iter_mut() {
            started += self.dispatch_file(&name, None, file);
        }
        folder.refresh_state();
        Ok(started)
    }

    /// Dispatches a single file (or directory) identified by its relative
    /// path within the folder. Returns whether a worker was started.
    pub fn request_file(&self, folder_name: &str, rel_path: &str) -> Result<bool, EngineError> {
        let mut model = self.lock_model();
        let folder = model
            .iter_mut()
            .find(|f| f.name == folder_name)
            .ok_or_else(|| EngineError::UnknownFolder(folder_name.to_string()))?;
        let name = folder.name.clone();

        let started = match rel_path.split_once('/') {
            None => {
                let file = folder.file_mut(rel_path).ok_or_else(|| {
                    EngineError::UnknownFile(folder_name.to_string(), rel_path.to_string())
                })?;
                self.dispatch_file(&name, None, file)
            }
            Some((dir_name, child_name)) => {
                let dir = folder.file_mut(dir_name).ok_or_else(|| {
                    EngineError::UnknownFile(folder_name.to_string(), rel_path.to_string())
                })?;
                let parent = dir.name.clone();
                let child = dir
                    .children
                    .as_mut()
                    .and_then(|children| children.iter_mut().find(|c| c.name == child_name))
                    .ok_or_else(|| {
                        EngineError::UnknownFile(folder_name.to_string(), rel_path.to_string())
                    })?;
                let n = self.dispatch_file(&name, Some(&parent), child);
                if n > 0 {
                    dir.state = SyncState::Downloading;
                }
                n
            }
        };
        folder.refresh_state();
        Ok(started > 0)
    }

    /// Folds a worker phase change back into the model.
    pub fn apply_worker_event(&self, event: &WorkerEvent) {
        let Some(state) = event.phase.entity_state() else {
            return;
        };
        let mut model = self.lock_model();
        let Some(folder) = model.iter_mut().find(|f| f.name == event.folder) else {
            return;
        };

        match event.file.split_once('/') {
            None => {
                if let Some(file) = folder.file_mut(&event.file) {
                    file.state = state;
                }
            }
            Some((dir_name, child_name)) => {
                if let Some(dir) = folder.file_mut(dir_name)
                    && let Some(children) = dir.children.as_mut()
                {
                    if let Some(child) = children.iter_mut().find(|c| c.name == child_name) {
                        child.state = state;
                    }
                    dir.state = aggregate_states(children.iter().map(|c| c.state));
                }
            }
        }
        folder.refresh_state();
    }

    /// Signals all workers to stop and waits (bounded) for them to settle.
    /// The model is preserved so work can resume.
    pub async fn stop_all(&self, wait: Duration) -> bool {
        self.manager.stop_all();
        self.manager.wait_idle(wait).await
    }

    /// Global reset: stop workers, wipe the ticket queue, clear the model.
    pub async fn reset(&self, wait: Duration) {
        self.manager.stop_all();
        if !self.manager.wait_idle(wait).await {
            eprintln!("[uvlogd] reset: some workers did not settle in time");
        }
        self.manager.cancel_all();
        self.lock_model().clear();
    }

    pub fn snapshot(&self) -> Vec<LogFolder> {
        self.lock_model().clone()
    }

    pub fn active_downloads(&self) -> usize {
        self.manager.active_count()
    }

    /// Starts a worker for one plain file, or for each eligible child of a
    /// directory. Per-entity failures (bad names, unbuildable URLs) skip the
    /// entity and never abort siblings.
    fn dispatch_file(&self, folder_name: &str, parent: Option<&str>, file: &mut LogFile) -> usize {
        if let Some(children) = file.children.as_mut() {
            let dir_name = file.name.clone();
            let mut started = 0;
            for child in children.iter_mut() {
                started += self.dispatch_file(folder_name, Some(&dir_name), child);
            }
            if started > 0 {
                file.state = SyncState::Downloading;
            }
            return started;
        }

        if matches!(file.state, SyncState::Sync | SyncState::Local) {
            return 0;
        }

        let rel_path = match parent {
            Some(dir) => format!("{dir}/{}", file.name),
            None => file.name.clone(),
        };
        let url = match self.client.file_url(&file.host, folder_name, &rel_path) {
            Ok(url) => url,
            Err(err) => {
                eprintln!("[uvlogd] cannot build url for {folder_name}/{rel_path}: {err}");
                return 0;
            }
        };
        let target = match file_path_for(&self.local_root, folder_name, &rel_path) {
            Ok(target) => target,
            Err(err) => {
                eprintln!("[uvlogd] cannot map {folder_name}/{rel_path} locally: {err}");
                return 0;
            }
        };

        let job = DownloadJob {
            folder: folder_name.to_string(),
            file: rel_path,
            url,
            target,
        };
        if self.manager.request(job) {
            file.state = SyncState::Downloading;
            1
        } else {
            0
        }
    }

    fn lock_model(&self) -> MutexGuard<'_, Vec<LogFolder>> {
        self.model
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::dispatch::WorkerPhase;
    use serde_json::json;
    use tempfile::tempdir;
    use tokio::sync::mpsc::UnboundedReceiver;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn make_engine(
        server: &MockServer,
        local_root: &std::path::Path,
    ) -> (LogSyncEngine, UnboundedReceiver<WorkerEvent>) {
        let client = LogServerClient::with_base_url(&server.uri()).unwrap();
        LogSyncEngine::new(
            client,
            EngineConfig {
                hosts: vec!["main".to_string()],
                local_root: local_root.to_path_buf(),
                max_parallel: 2,
                request_timeout: Duration::from_secs(5),
            },
        )
    }

    async fn mount_index(server: &MockServer, host: &str, folders: &[&str]) {
        let body = json!({
            "folders": folders.iter().map(|name| json!({ "name": name })).collect::<Vec<_>>()
        });
        Mock::given(method("GET"))
            .and(path(format!("/v1/hosts/{host}/logs")))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    async fn mount_folder(
        server: &MockServer,
        host: &str,
        folder: &str,
        entries: serde_json::Value,
    ) {
        Mock::given(method("GET"))
            .and(path(format!("/v1/hosts/{host}/logs/{folder}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "entries": entries })))
            .mount(server)
            .await;
    }

    /// Drains worker events into the engine until `predicate` holds or the
    /// timeout elapses.
    async fn pump_until(
        engine: &LogSyncEngine,
        rx: &mut UnboundedReceiver<WorkerEvent>,
        predicate: impl Fn(&[LogFolder]) -> bool,
    ) {
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if predicate(&engine.snapshot()) {
                    return;
                }
                let Some(event) = rx.recv().await else {
                    panic!("event channel closed");
                };
                engine.apply_worker_event(&event);
            }
        })
        .await;
        assert!(result.is_ok(), "model never reached the expected shape");
    }

    #[tokio::test]
    async fn refresh_excludes_the_active_folder() {
        let server = MockServer::start().await;
        mount_index(&server, "main", &["20260826_1200", "20260828_0915"]).await;
        mount_folder(
            &server,
            "main",
            "20260826_1200",
            json!([{ "name": "Data.lsf", "type": "file", "size": 10 }]),
        )
        .await;

        let dir = tempdir().unwrap();
        let (engine, _rx) = make_engine(&server, dir.path());
        let delta = engine.refresh_once().await.unwrap();

        assert_eq!(delta.new_folders, 1);
        let model = engine.snapshot();
        assert_eq!(model.len(), 1);
        assert_eq!(model[0].name, "20260826_1200");
        assert_eq!(model[0].state, SyncState::New);
    }

    #[tokio::test]
    async fn refresh_failure_leaves_the_model_untouched() {
        let server = MockServer::start().await;
        mount_index(&server, "main", &["20260826_1200", "20260828_0915"]).await;
        mount_folder(
            &server,
            "main",
            "20260826_1200",
            json!([{ "name": "Data.lsf", "type": "file", "size": 10 }]),
        )
        .await;

        let dir = tempdir().unwrap();
        let (engine, _rx) = make_engine(&server, dir.path());
        engine.refresh_once().await.unwrap();
        let before = engine.snapshot();

        server.reset().await;
        let err = engine.refresh_once().await.unwrap_err();
        assert!(matches!(err, EngineError::ListUnavailable));

        let after = engine.snapshot();
        assert_eq!(after.len(), before.len());
        assert_eq!(after[0].files.len(), before[0].files.len());
        assert_eq!(after[0].state, before[0].state);
    }

    #[tokio::test]
    async fn folders_from_a_failed_host_keep_their_state() {
        let server = MockServer::start().await;
        mount_index(&server, "main", &["20260826_1200", "20260828_0915"]).await;
        mount_index(&server, "cam", &["20260827_0900", "20260828_0915"]).await;
        mount_folder(
            &server,
            "main",
            "20260826_1200",
            json!([{ "name": "Data.lsf", "type": "file", "size": 1 }]),
        )
        .await;
        mount_folder(
            &server,
            "cam",
            "20260827_0900",
            json!([{ "name": "Cam.mjpg", "type": "file", "size": 2 }]),
        )
        .await;

        let dir = tempdir().unwrap();
        let client = LogServerClient::with_base_url(&server.uri()).unwrap();
        let (engine, _rx) = LogSyncEngine::new(
            client,
            EngineConfig {
                hosts: vec!["main".to_string(), "cam".to_string()],
                local_root: dir.path().to_path_buf(),
                max_parallel: 2,
                request_timeout: Duration::from_secs(5),
            },
        );
        engine.refresh_once().await.unwrap();

        let model = engine.snapshot();
        let cam_folder = model.iter().find(|f| f.name == "20260827_0900").unwrap();
        assert_eq!(cam_folder.state, SyncState::New);

        // cam's folder index now fails; its folders must not be demoted.
        server.reset().await;
        mount_index(&server, "main", &["20260826_1200", "20260828_0915"]).await;
        mount_folder(
            &server,
            "main",
            "20260826_1200",
            json!([{ "name": "Data.lsf", "type": "file", "size": 1 }]),
        )
        .await;
        Mock::given(method("GET"))
            .and(path("/v1/hosts/cam/logs"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let delta = engine.refresh_once().await.unwrap();
        assert_eq!(delta.stale_folders, 0);

        let model = engine.snapshot();
        let cam_folder = model.iter().find(|f| f.name == "20260827_0900").unwrap();
        assert_eq!(cam_folder.state, SyncState::New);
        assert_eq!(cam_folder.files[0].state, SyncState::New);
    }

    #[tokio::test]
    async fn folder_listing_failure_skips_that_folder_only() {
        let server = MockServer::start().await;
        mount_index(
            &server,
            "main",
            &["20260825_1000", "20260826_1200", "20260828_0915"],
        )
        .await;
        mount_folder(
            &server,
            "main",
            "20260825_1000",
            json!([{ "name": "Data.lsf", "type": "file", "size": 10 }]),
        )
        .await;
        // 20260826_1200 has no mock: its listing 404s.

        let dir = tempdir().unwrap();
        let (engine, _rx) = make_engine(&server, dir.path());
        let delta = engine.refresh_once().await.unwrap();

        assert_eq!(delta.new_folders, 1);
        let model = engine.snapshot();
        assert_eq!(model.len(), 1);
        assert_eq!(model[0].name, "20260825_1000");
    }

    #[tokio::test]
    async fn new_file_downloads_to_sync_on_request() {
        let server = MockServer::start().await;
        mount_index(&server, "main", &["20260826_1200", "20260828_0915"]).await;
        mount_folder(
            &server,
            "main",
            "20260826_1200",
            json!([{ "name": "Data.lsf", "type": "file", "size": 4 }]),
        )
        .await;
        Mock::given(method("GET"))
            .and(path("/v1/hosts/main/logs/20260826_1200/files/Data.lsf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let (engine, mut rx) = make_engine(&server, dir.path());
        engine.refresh_once().await.unwrap();
        assert_eq!(
            engine.snapshot()[0].files[0].state,
            SyncState::New
        );

        assert!(engine.request_file("20260826_1200", "Data.lsf").unwrap());
        assert_eq!(engine.snapshot()[0].files[0].state, SyncState::Downloading);

        pump_until(&engine, &mut rx, |model| {
            model[0].files[0].state == SyncState::Sync
        })
        .await;
        assert_eq!(engine.snapshot()[0].state, SyncState::Sync);

        let target = dir.path().join("20260826_1200/Data.lsf");
        assert_eq!(std::fs::read(target).unwrap(), b"data");
    }

    #[tokio::test]
    async fn request_folder_skips_satisfied_files() {
        let server = MockServer::start().await;
        mount_index(&server, "main", &["20260826_1200", "20260828_0915"]).await;
        mount_folder(
            &server,
            "main",
            "20260826_1200",
            json!([
                { "name": "have.lsf", "type": "file", "size": 5 },
                { "name": "need.lsf", "type": "file", "size": 4 }
            ]),
        )
        .await;
        Mock::given(method("GET"))
            .and(path("/v1/hosts/main/logs/20260826_1200/files/need.lsf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"need"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let folder_dir = dir.path().join("20260826_1200");
        std::fs::create_dir_all(&folder_dir).unwrap();
        std::fs::write(folder_dir.join("have.lsf"), b"12345").unwrap();

        let (engine, mut rx) = make_engine(&server, dir.path());
        engine.refresh_once().await.unwrap();

        let started = engine.request_folder("20260826_1200").unwrap();
        assert_eq!(started, 1);

        pump_until(&engine, &mut rx, |model| {
            model[0].files.iter().all(|f| f.state == SyncState::Sync)
        })
        .await;
        assert_eq!(engine.snapshot()[0].state, SyncState::Sync);
    }

    #[tokio::test]
    async fn failed_download_marks_the_file_error() {
        let server = MockServer::start().await;
        mount_index(&server, "main", &["20260826_1200", "20260828_0915"]).await;
        mount_folder(
            &server,
            "main",
            "20260826_1200",
            json!([{ "name": "Data.lsf", "type": "file", "size": 4 }]),
        )
        .await;
        Mock::given(method("GET"))
            .and(path("/v1/hosts/main/logs/20260826_1200/files/Data.lsf"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let (engine, mut rx) = make_engine(&server, dir.path());
        engine.refresh_once().await.unwrap();

        assert!(engine.request_file("20260826_1200", "Data.lsf").unwrap());
        pump_until(&engine, &mut rx, |model| {
            model[0].files[0].state == SyncState::Error
        })
        .await;
        assert_eq!(engine.snapshot()[0].state, SyncState::Error);
    }

    #[tokio::test]
    async fn timed_out_download_can_be_retried() {
        let server = MockServer::start().await;
        mount_index(&server, "main", &["20260826_1200", "20260828_0915"]).await;
        mount_folder(
            &server,
            "main",
            "20260826_1200",
            json!([{ "name": "Data.lsf", "type": "file", "size": 4 }]),
        )
        .await;
        // First attempt exceeds the request timeout, the second is instant.
        Mock::given(method("GET"))
            .and(path("/v1/hosts/main/logs/20260826_1200/files/Data.lsf"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"data")
                    .set_delay(Duration::from_secs(2)),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/hosts/main/logs/20260826_1200/files/Data.lsf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let client = LogServerClient::with_base_url(&server.uri()).unwrap();
        let (engine, mut rx) = LogSyncEngine::new(
            client,
            EngineConfig {
                hosts: vec!["main".to_string()],
                local_root: dir.path().to_path_buf(),
                max_parallel: 2,
                request_timeout: Duration::from_millis(200),
            },
        );
        engine.refresh_once().await.unwrap();

        assert!(engine.request_file("20260826_1200", "Data.lsf").unwrap());
        let timed_out = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                engine.apply_worker_event(&event);
                if event.phase == WorkerPhase::Timeout {
                    break;
                }
            }
        })
        .await;
        assert!(timed_out.is_ok(), "worker never reported a timeout");
        // The entity is still Downloading per the phase mapping, yet the
        // parked worker accepts a new trigger.
        assert_eq!(engine.snapshot()[0].files[0].state, SyncState::Downloading);

        assert!(engine.request_file("20260826_1200", "Data.lsf").unwrap());
        pump_until(&engine, &mut rx, |model| {
            model[0].files[0].state == SyncState::Sync
        })
        .await;
        let target = dir.path().join("20260826_1200/Data.lsf");
        assert_eq!(std::fs::read(target).unwrap(), b"data");
    }

    #[tokio::test]
    async fn reset_clears_the_model() {
        let server = MockServer::start().await;
        mount_index(&server, "main", &["20260826_1200", "20260828_0915"]).await;
        mount_folder(&server, "main", "20260826_1200", json!([])).await;

        let dir = tempdir().unwrap();
        let (engine, _rx) = make_engine(&server, dir.path());
        engine.refresh_once().await.unwrap();
        assert_eq!(engine.snapshot().len(), 1);

        engine.reset(Duration::from_millis(200)).await;
        assert!(engine.snapshot().is_empty());
        assert_eq!(engine.active_downloads(), 0);
    }

    #[tokio::test]
    async fn unknown_names_are_reported() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let (engine, _rx) = make_engine(&server, dir.path());

        assert!(matches!(
            engine.request_folder("nope"),
            Err(EngineError::UnknownFolder(_))
        ));
        assert!(matches!(
            engine.request_file("nope", "file"),
            Err(EngineError::UnknownFolder(_))
        ));
    }
}
