//! Discovers claimable hosts and runs one worker per host.

use std::{collections::HashMap, sync::Arc};

use carrier_common::{Signal, StopHandle, internal};
use dashmap::DashMap;
use tokio::{
    sync::{broadcast, mpsc},
    task::{self, JoinError, JoinSet},
};
use tracing::{debug, error, warn};

use crate::{
    context::DeliveryContext,
    error::DeliveryError,
    registry::Host,
    worker::{Worker, WorkerState},
};

/// The dispatcher's view of a running worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    wake: mpsc::UnboundedSender<()>,
    state: Arc<WorkerState>,
}

impl WorkerHandle {
    /// Tells the worker new mail may be ready. Never blocks.
    pub fn wake(&self) {
        let _ = self.wake.send(());
    }

    #[must_use]
    pub fn state(&self) -> &WorkerState {
        &self.state
    }
}

/// Live workers keyed by host name.
pub type Workers = Arc<DashMap<String, WorkerHandle>>;

/// Host and state of each worker task, so the task's entry in [`Workers`]
/// can be dropped however it ends.
type Tracked = HashMap<task::Id, (String, Arc<WorkerState>)>;

pub struct Dispatcher {
    ctx: Arc<DeliveryContext>,
    workers: Workers,
}

impl Dispatcher {
    #[must_use]
    pub const fn new(ctx: Arc<DeliveryContext>, workers: Workers) -> Self {
        Self { ctx, workers }
    }

    /// Polls for claimable hosts until `shutdown` fires, then stops every
    /// worker and waits for all of them to settle their hosts.
    #[tracing::instrument(name = "dispatcher", skip_all)]
    pub async fn serve(
        &self,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), DeliveryError> {
        internal!(
            "Dispatcher starting, polling every {}s",
            self.ctx.config.poll_interval().as_secs()
        );

        let stop = StopHandle::new();
        let mut running = JoinSet::new();
        let mut tracked = Tracked::new();
        let mut poll = tokio::time::interval(self.ctx.config.poll_interval());

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(err) = self.dispatch(&stop, &mut running, &mut tracked).await {
                        error!("Unable to claim hosts: {err}");
                    }
                }
                Some(joined) = running.join_next_with_id() => {
                    reap(&self.workers, &mut tracked, joined);
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown) => {
                            internal!("Dispatcher received shutdown signal");
                        }
                        Err(err) => warn!("Dispatcher shutdown channel error: {err}"),
                    }
                    break;
                }
            }
        }

        stop.stop();
        internal!("Waiting for {} worker(s) to finish", running.len());
        while let Some(joined) = running.join_next_with_id().await {
            reap(&self.workers, &mut tracked, joined);
        }
        self.workers.clear();

        internal!("Dispatcher shutdown complete");
        Ok(())
    }

    /// Claims every host that is available right now.
    ///
    /// Hosts that still have a worker here are never claimed, even when
    /// their lease has lapsed: that worker is still delivering and will
    /// renew or settle the host itself.
    async fn dispatch(
        &self,
        stop: &StopHandle,
        running: &mut JoinSet<()>,
        tracked: &mut Tracked,
    ) -> Result<(), DeliveryError> {
        let busy: Vec<String> = self
            .workers
            .iter()
            .filter(|entry| !entry.state.is_finished())
            .map(|entry| entry.key().clone())
            .collect();

        while let Some(host) = self.ctx.registry.claim_except(&busy).await? {
            if stop.is_stopped() {
                self.ctx.registry.finished(&host).await?;
                break;
            }
            self.spawn(host, stop, running, tracked);
        }
        Ok(())
    }

    /// Starts a worker for a freshly claimed host.
    fn spawn(
        &self,
        host: Host,
        stop: &StopHandle,
        running: &mut JoinSet<()>,
        tracked: &mut Tracked,
    ) {
        let name = host.name.clone();
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let state = Arc::new(WorkerState::new());
        self.workers.insert(
            name.clone(),
            WorkerHandle {
                wake: wake_tx,
                state: Arc::clone(&state),
            },
        );

        debug!(host = %name, attempts = host.attempts, "Starting worker");
        let worker = Worker::new(
            Arc::clone(&self.ctx),
            host,
            wake_rx,
            stop.token(),
            Arc::clone(&state),
        );
        let task = running.spawn(worker.run());
        tracked.insert(task.id(), (name, state));
    }
}

/// Forgets a worker task that has ended, cleanly or not. A successor
/// already registered for the same host is left alone.
fn reap(
    workers: &Workers,
    tracked: &mut Tracked,
    joined: Result<(task::Id, ()), JoinError>,
) {
    let id = match joined {
        Ok((id, ())) => id,
        Err(err) => {
            error!("Worker task failed: {err}");
            err.id()
        }
    };

    if let Some((host, state)) = tracked.remove(&id) {
        workers.remove_if(&host, |_, handle| Arc::ptr_eq(&handle.state, &state));
    }
}
