use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::model::SyncState;
use super::tickets::TicketQueue;
use super::transfer::{TransferClient, TransferError};

/// How often a queued worker re-checks the ticket queue.
const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Observable lifecycle of one download worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    Queued,
    Working,
    Timeout,
    Done,
    Error,
    NotDone,
}

impl WorkerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerPhase::Idle => "idle",
            WorkerPhase::Queued => "queued",
            WorkerPhase::Working => "working",
            WorkerPhase::Timeout => "timeout",
            WorkerPhase::Done => "done",
            WorkerPhase::Error => "error",
            WorkerPhase::NotDone => "not done",
        }
    }

    /// Terminal phases a finished worker can be re-triggered from.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkerPhase::Error
                | WorkerPhase::Idle
                | WorkerPhase::Timeout
                | WorkerPhase::Queued
                | WorkerPhase::NotDone
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkerPhase::Queued | WorkerPhase::Working)
    }

    /// Entity state a phase transition feeds back into the model.
    /// `Idle` carries no information and changes nothing.
    pub fn entity_state(&self) -> Option<SyncState> {
        match self {
            WorkerPhase::Done => Some(SyncState::Sync),
            WorkerPhase::Error => Some(SyncState::Error),
            WorkerPhase::Working | WorkerPhase::Timeout | WorkerPhase::Queued => {
                Some(SyncState::Downloading)
            }
            WorkerPhase::NotDone => Some(SyncState::Incomplete),
            WorkerPhase::Idle => None,
        }
    }
}

/// Phase notification sent back to the engine's event loop. Workers never
/// touch the model themselves.
#[derive(Debug, Clone)]
pub struct WorkerEvent {
    pub folder: String,
    pub file: String,
    pub phase: WorkerPhase,
}

/// Everything a worker needs to move one file.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub folder: String,
    pub file: String,
    pub url: Url,
    pub target: PathBuf,
}

impl DownloadJob {
    fn key(&self) -> String {
        format!("{}/{}", self.folder, self.file)
    }
}

struct WorkerHandle {
    phase: watch::Receiver<WorkerPhase>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Spawns and tracks download workers. Each worker must hold a ticket while
/// bytes move; one worker owns one target path, enforced by keying the
/// registry on `folder/file`.
pub struct DownloadManager {
    tickets: Arc<TicketQueue>,
    transfer: TransferClient,
    events: mpsc::UnboundedSender<WorkerEvent>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl DownloadManager {
    pub fn new(
        tickets: Arc<TicketQueue>,
        transfer: TransferClient,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            tickets,
            transfer,
            events,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Starts (or re-triggers) a worker for `job`. Returns `false` when an
    /// equivalent worker is already queued or transferring; a worker parked
    /// in a retryable terminal phase is restarted in its slot.
    pub fn request(&self, job: DownloadJob) -> bool {
        let key = job.key();
        let mut workers = self.lock();

        if let Some(existing) = workers.get(&key) {
            let phase = *existing.phase.borrow();
            if !existing.join.is_finished() && !phase.is_terminal() {
                // Still queued or transferring; never duplicate a worker for
                // one target path.
                return false;
            }
            debug_assert!(phase == WorkerPhase::Done || phase.is_retryable());
        }

        let handle = self.spawn_worker(job);
        workers.insert(key, handle);
        true
    }

    /// Signals every worker to stop. Queued workers leave the ticket queue,
    /// transferring workers abandon their stream and report `NotDone`.
    pub fn stop_all(&self) {
        for handle in self.lock().values() {
            handle.cancel.cancel();
        }
    }

    /// Waits until every worker reports a terminal phase, up to `limit`.
    /// Returns whether everything settled in time. `Duration::ZERO` skips
    /// the wait entirely.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        if limit.is_zero() {
            return self.all_terminal();
        }
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if self.all_terminal() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Global abort: stop workers, drop them, and wipe the ticket queue.
    pub fn cancel_all(&self) {
        let mut workers = self.lock();
        for handle in workers.values() {
            handle.cancel.cancel();
            handle.join.abort();
        }
        workers.clear();
        self.tickets.cancel_all();
    }

    pub fn active_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|h| !h.phase.borrow().is_terminal())
            .count()
    }

    fn all_terminal(&self) -> bool {
        self.lock().values().all(|h| h.phase.borrow().is_terminal())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, WorkerHandle>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_worker(&self, job: DownloadJob) -> WorkerHandle {
        // The slot must read as Queued before the task gets a chance to run;
        // a request racing in ahead of the spawned task would otherwise see a
        // terminal phase and spawn a second worker for the same target.
        let (phase_tx, phase_rx) = watch::channel(WorkerPhase::Queued);
        let cancel = CancellationToken::new();
        let worker = Worker {
            job,
            tickets: Arc::clone(&self.tickets),
            transfer: self.transfer.clone(),
            events: self.events.clone(),
            phase: phase_tx,
            cancel: cancel.clone(),
        };
        let _ = self.events.send(WorkerEvent {
            folder: worker.job.folder.clone(),
            file: worker.job.file.clone(),
            phase: WorkerPhase::Queued,
        });
        let join = tokio::spawn(worker.run());
        WorkerHandle {
            phase: phase_rx,
            cancel,
            join,
        }
    }
}

struct Worker {
    job: DownloadJob,
    tickets: Arc<TicketQueue>,
    transfer: TransferClient,
    events: mpsc::UnboundedSender<WorkerEvent>,
    phase: watch::Sender<WorkerPhase>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        // Queued was already published when the slot was registered.
        let key = self.job.key();

        if !self.acquire_ticket(&key).await {
            self.tickets.release(&key);
            self.set_phase(WorkerPhase::NotDone);
            return;
        }

        self.set_phase(WorkerPhase::Working);
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            result = self
                .transfer
                .download_to_path(self.job.url.clone(), &self.job.target) => result.map(|_| ()),
        };
        let phase = match result {
            Ok(()) => WorkerPhase::Done,
            Err(TransferError::Timeout(_)) => WorkerPhase::Timeout,
            Err(TransferError::Cancelled) => WorkerPhase::NotDone,
            Err(err) => {
                eprintln!("[uvlogd] download failed for {key}: {err}");
                WorkerPhase::Error
            }
        };
        // Terminal phase is reported before the ticket frees up, so a
        // successor's Working notification never overtakes it.
        self.set_phase(phase);
        self.tickets.release(&key);
    }

    /// Polls for admission every 100ms until leased or cancelled.
    async fn acquire_ticket(&self, key: &str) -> bool {
        if self.tickets.lease(key) {
            return true;
        }
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(LEASE_POLL_INTERVAL) => {
                    if self.tickets.is_leased(key) {
                        return true;
                    }
                }
            }
        }
    }

    fn set_phase(&self, phase: WorkerPhase) {
        let _ = self.phase.send(phase);
        let _ = self.events.send(WorkerEvent {
            folder: self.job.folder.clone(),
            file: self.job.file.clone(),
            phase,
        });
    }
}
