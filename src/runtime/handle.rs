use std::sync::Arc;
use std::time::Duration;

use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, interval_at},
};

use crate::{
    error::{SyncError, SyncResult},
    op::SyncOperation,
    persist::StorageResult,
    types::OpId,
};

use super::{
    coordinator::{SyncCoordinator, SyncReport, SyncStatus},
    events::SyncEvent,
};

const MIN_TICK: Duration = Duration::from_millis(10);

/// Cloneable handle to the background sync worker.
pub struct SyncHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<SyncEvent>,
}

impl Clone for SyncHandle {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            events_tx: self.events_tx.clone(),
        }
    }
}

enum Command {
    Sync {
        force: bool,
        resp: Option<oneshot::Sender<SyncReport>>,
    },
    Status {
        resp: oneshot::Sender<SyncStatus>,
    },
    Stalled {
        resp: oneshot::Sender<Vec<SyncOperation>>,
    },
    RetryStalled {
        id: OpId,
        resp: oneshot::Sender<SyncResult<()>>,
    },
    Discard {
        id: OpId,
        resp: oneshot::Sender<SyncResult<SyncOperation>>,
    },
    Sweep {
        resp: oneshot::Sender<StorageResult<usize>>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Spawns the sync worker.
///
/// The worker sweeps and syncs once at start-up, then reacts to commands,
/// the periodic sync ticker, the sweep ticker, and offline-to-online
/// transitions. Passes run as their own tasks so the worker stays
/// responsive; a trigger that lands while a pass runs schedules exactly one
/// follow-up pass.
pub fn spawn_sync_engine(coordinator: Arc<SyncCoordinator>) -> SyncHandle {
    let config = coordinator.config().clone();
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(config.command_capacity.max(1));
    let events_tx = coordinator.events_sender();

    let events_loop = events_tx.clone();

    tokio::spawn(async move {
        let mut worker = Worker::new(Arc::clone(&coordinator));
        let mut connectivity = coordinator.connectivity().clone();
        let mut watching_connectivity = true;
        let sync_every = config.sync_interval().max(MIN_TICK);
        let sweep_every = config.sweep_interval().max(MIN_TICK);
        let mut sync_tick = interval_at(Instant::now() + sync_every, sync_every);
        let mut sweep_tick = interval_at(Instant::now() + sweep_every, sweep_every);

        run_sweep(&coordinator).await;
        worker.trigger(None);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break; };
                    if let Some(resp) = worker.handle_command(cmd).await {
                        worker.wait_idle().await;
                        let _ = resp.send(());
                        break;
                    }
                }
                done = worker.done_rx.recv() => {
                    if let Some(report) = done {
                        worker.finish(report);
                    }
                }
                _ = sync_tick.tick() => {
                    if coordinator.repository().is_degraded() {
                        coordinator.repository().try_recover().await;
                    }
                    worker.trigger(None);
                }
                _ = sweep_tick.tick() => {
                    run_sweep(&coordinator).await;
                }
                online = connectivity.transition(), if watching_connectivity => {
                    match online {
                        Some(online) => {
                            let _ = events_loop.send(SyncEvent::ConnectivityChanged { online });
                            if online {
                                worker.trigger(None);
                            }
                        }
                        None => watching_connectivity = false,
                    }
                }
            }
        }
        tracing::debug!("sync worker stopped");
    });

    SyncHandle { cmd_tx, events_tx }
}

struct Worker {
    coordinator: Arc<SyncCoordinator>,
    done_tx: mpsc::UnboundedSender<SyncReport>,
    done_rx: mpsc::UnboundedReceiver<SyncReport>,
    running: bool,
    rerun: bool,
    current_waiters: Vec<oneshot::Sender<SyncReport>>,
    next_waiters: Vec<oneshot::Sender<SyncReport>>,
    forced: Vec<JoinHandle<()>>,
}

impl Worker {
    fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            coordinator,
            done_tx,
            done_rx,
            running: false,
            rerun: false,
            current_waiters: Vec::new(),
            next_waiters: Vec::new(),
            forced: Vec::new(),
        }
    }

    fn trigger(&mut self, resp: Option<oneshot::Sender<SyncReport>>) {
        if self.running {
            self.rerun = true;
            self.next_waiters.extend(resp);
            return;
        }
        self.current_waiters.extend(resp);
        self.start_pass();
    }

    fn start_pass(&mut self) {
        self.running = true;
        let coordinator = Arc::clone(&self.coordinator);
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let report = coordinator.sync(false).await;
            let _ = done_tx.send(report);
        });
    }

    fn finish(&mut self, report: SyncReport) {
        self.running = false;
        for waiter in self.current_waiters.drain(..) {
            let _ = waiter.send(report.clone());
        }
        if self.rerun {
            self.rerun = false;
            self.current_waiters = std::mem::take(&mut self.next_waiters);
            self.start_pass();
        }
    }

    async fn wait_idle(&mut self) {
        while self.running {
            match self.done_rx.recv().await {
                Some(report) => {
                    self.rerun = false;
                    self.current_waiters.append(&mut self.next_waiters);
                    self.finish(report);
                }
                None => break,
            }
        }
        for task in self.forced.drain(..) {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "forced sync pass ended abnormally");
            }
        }
    }

    /// Handles one command. Returns the responder when the worker must stop.
    async fn handle_command(&mut self, cmd: Command) -> Option<oneshot::Sender<()>> {
        match cmd {
            Command::Sync { force: false, resp } => self.trigger(resp),
            Command::Sync { force: true, resp } => {
                self.forced.retain(|task| !task.is_finished());
                let coordinator = Arc::clone(&self.coordinator);
                self.forced.push(tokio::spawn(async move {
                    let report = coordinator.sync(true).await;
                    if let Some(resp) = resp {
                        let _ = resp.send(report);
                    }
                }));
            }
            Command::Status { resp } => {
                let _ = resp.send(self.coordinator.status().await);
            }
            Command::Stalled { resp } => {
                let _ = resp.send(self.coordinator.stalled().await);
            }
            Command::RetryStalled { id, resp } => {
                let result = self.coordinator.retry_stalled(id).await;
                let rearmed = result.is_ok();
                let _ = resp.send(result);
                if rearmed && self.coordinator.connectivity().is_online() {
                    self.trigger(None);
                }
            }
            Command::Discard { id, resp } => {
                let _ = resp.send(self.coordinator.discard(id).await);
            }
            Command::Sweep { resp } => {
                let _ = resp.send(self.coordinator.repository().sweep_configured().await);
            }
            Command::Shutdown { resp } => return Some(resp),
        }
        None
    }
}

async fn run_sweep(coordinator: &SyncCoordinator) {
    if let Err(err) = coordinator.repository().sweep_configured().await {
        tracing::warn!(error = %err, "cache sweep failed");
    }
}

impl SyncHandle {
    /// Subscribes to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events_tx.subscribe()
    }

    /// Asks for a pass without waiting. Used right after an enqueue; when
    /// the command channel is full a pass is already on its way.
    pub fn request_sync(&self) {
        if let Err(err) = self.cmd_tx.try_send(Command::Sync {
            force: false,
            resp: None,
        }) {
            tracing::debug!(error = %err, "sync request dropped");
        }
    }

    /// Runs a pass and waits for its report. A non-forced request made while
    /// a pass runs is answered by the follow-up pass.
    pub async fn sync_now(&self, force: bool) -> SyncResult<SyncReport> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Sync {
                force,
                resp: Some(tx),
            })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)
    }

    /// Current derived status.
    pub async fn status(&self) -> SyncResult<SyncStatus> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Status { resp: tx })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)
    }

    /// Operations waiting for a retry/discard decision.
    pub async fn stalled(&self) -> SyncResult<Vec<SyncOperation>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Stalled { resp: tx })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)
    }

    /// Re-arms a stalled operation and schedules a pass.
    pub async fn retry_stalled(&self, id: OpId) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RetryStalled { id, resp: tx })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)?
    }

    /// Drops a queued operation without delivering it.
    pub async fn discard(&self, id: OpId) -> SyncResult<SyncOperation> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Discard { id, resp: tx })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)?
    }

    /// Sweeps expired records now.
    pub async fn sweep(&self) -> SyncResult<usize> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Sweep { resp: tx })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        Ok(rx.await.map_err(|_| SyncError::ChannelClosed)??)
    }

    /// Stops the worker once the running pass and any forced passes finish.
    pub async fn shutdown(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { resp: tx })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)
    }
}
