use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use uvlog_core::LogServerClient;

use crate::sync::backoff::Backoff;
use crate::sync::dispatch::WorkerEvent;
use crate::sync::engine::{EngineConfig, LogSyncEngine};
use crate::sync::model::{LogFolder, SyncState, aggregate_states};

const DEFAULT_BASE_URL: &str = "http://10.0.10.40:8080";
const DEFAULT_LOG_DIR_NAME: &str = "vehicle-logs";
const DEFAULT_HOSTS: &str = "main";
const DEFAULT_POLL_SECS: u64 = 30;
const DEFAULT_MAX_PARALLEL: u64 = 2;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
const DEFAULT_STOP_WAIT_SECS: u64 = 5;
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_MAX_MS: u64 = 30_000;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub server_url: String,
    pub local_root: PathBuf,
    pub hosts: Vec<String>,
    pub poll_interval: Duration,
    pub max_parallel: usize,
    pub request_timeout: Duration,
    pub stop_wait: Duration,
    pub auto_download: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let server_url =
            std::env::var("UVLOG_SERVER_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let local_root = std::env::var("UVLOG_LOCAL_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_LOG_DIR_NAME));
        let hosts = parse_hosts(
            &std::env::var("UVLOG_HOSTS").unwrap_or_else(|_| DEFAULT_HOSTS.to_string()),
        );
        anyhow::ensure!(!hosts.is_empty(), "UVLOG_HOSTS must name at least one host");
        let poll_interval =
            Duration::from_secs(read_u64_env("UVLOG_POLL_SECS", DEFAULT_POLL_SECS));
        let max_parallel =
            read_u64_env("UVLOG_MAX_PARALLEL", DEFAULT_MAX_PARALLEL).max(1) as usize;
        let request_timeout = Duration::from_secs(read_u64_env(
            "UVLOG_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        ));
        let stop_wait =
            Duration::from_secs(read_u64_env("UVLOG_STOP_WAIT_SECS", DEFAULT_STOP_WAIT_SECS));
        let auto_download = read_bool_env("UVLOG_AUTO_DOWNLOAD", true);

        Ok(Self {
            server_url,
            local_root,
            hosts,
            poll_interval,
            max_parallel,
            request_timeout,
            stop_wait,
            auto_download,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<LogSyncEngine>,
    events: Option<mpsc::UnboundedReceiver<WorkerEvent>>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.local_root)
            .await
            .with_context(|| format!("failed to create log root at {:?}", config.local_root))?;

        let client = LogServerClient::with_base_url(&config.server_url)
            .context("invalid UVLOG_SERVER_URL")?;
        let (engine, events) = LogSyncEngine::new(
            client,
            EngineConfig {
                hosts: config.hosts.clone(),
                local_root: config.local_root.clone(),
                max_parallel: config.max_parallel,
                request_timeout: config.request_timeout,
            },
        );

        Ok(Self {
            config,
            engine: Arc::new(engine),
            events: Some(events),
        })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        eprintln!(
            "[uvlogd] started: server={}, local_root={}, hosts={}, auto_download={}",
            self.config.server_url,
            self.config.local_root.display(),
            self.config.hosts.join(","),
            if self.config.auto_download { "enabled" } else { "disabled" }
        );

        let mut events = self
            .events
            .take()
            .context("daemon runtime was already consumed")?;
        let engine_for_events = Arc::clone(&self.engine);
        let events_handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                engine_for_events.apply_worker_event(&event);
                if event.phase.is_terminal() {
                    eprintln!(
                        "[uvlogd] download {}/{}: {}",
                        event.folder,
                        event.file,
                        event.phase.as_str()
                    );
                }
            }
        });

        let engine_for_refresh = Arc::clone(&self.engine);
        let poll_interval = self.config.poll_interval;
        let auto_download = self.config.auto_download;
        let refresh_handle = tokio::spawn(async move {
            let backoff = Backoff::new(
                Duration::from_millis(BACKOFF_BASE_MS),
                Duration::from_millis(BACKOFF_MAX_MS),
                true,
            );
            let mut failures: u32 = 0;
            loop {
                match engine_for_refresh.refresh_once().await {
                    Ok(delta) => {
                        failures = 0;
                        if !delta.is_empty() {
                            eprintln!(
                                "[uvlogd] refresh delta: new_folders={}, stale_folders={}, added={}, updated={}, stale={}, removed={}",
                                delta.new_folders,
                                delta.stale_folders,
                                delta.added_files,
                                delta.updated_files,
                                delta.stale_files,
                                delta.removed_files
                            );
                        }
                        if auto_download {
                            request_pending_folders(&engine_for_refresh);
                        }
                        tokio::time::sleep(poll_interval).await;
                    }
                    Err(err) => {
                        eprintln!("[uvlogd] refresh error: {err}");
                        let delay = backoff.delay(failures);
                        failures = failures.saturating_add(1);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        eprintln!("[uvlogd] shutting down");

        refresh_handle.abort();
        if !self.engine.stop_all(self.config.stop_wait).await {
            eprintln!("[uvlogd] some downloads did not settle before shutdown");
        }
        events_handle.abort();
        Ok(())
    }

    /// Single refresh pass for `--once`: reconcile, print the folder table
    /// and exit without starting any downloads.
    pub async fn run_once(&self) -> anyhow::Result<()> {
        let delta = self
            .engine
            .refresh_once()
            .await
            .context("refresh against the log server failed")?;
        let folders = self.engine.snapshot();
        let changes = delta.new_folders
            + delta.stale_folders
            + delta.added_files
            + delta.updated_files
            + delta.stale_files
            + delta.removed_files;
        println!("{}", format_summary_line(&folders, changes));
        for folder in &folders {
            println!("{}", format_folder_line(folder));
        }
        Ok(())
    }
}

fn request_pending_folders(engine: &LogSyncEngine) {
    let pending: Vec<String> = engine
        .snapshot()
        .into_iter()
        .filter(|folder| wants_auto_download(folder.state))
        .map(|folder| folder.name)
        .collect();
    for name in pending {
        match engine.request_folder(&name) {
            Ok(0) => {}
            Ok(started) => {
                eprintln!("[uvlogd] auto-download {name}: {started} file(s) queued");
            }
            Err(err) => {
                eprintln!("[uvlogd] auto-download {name} failed: {err}");
            }
        }
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
