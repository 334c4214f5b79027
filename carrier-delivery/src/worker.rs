//! Delivery to one destination host.
//!
//! A worker owns the lease on its host for as long as it runs. It drains
//! the host's ready items oldest first over a single SMTP session, keeps
//! the session open for up to the idle timeout waiting for more, and
//! settles the host's bookkeeping in the registry before exiting.
//!
//! The lease, and the lock on the item in flight, are renewed on a timer
//! at half the lease while the worker waits on anything remote: DNS, the
//! handshake, every SMTP round trip and the idle wait. However slow the
//! receiving server is, the lease cannot lapse under a live transaction.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use carrier_common::{StopToken, internal};
use carrier_smtp::{Response, SmtpClient, client};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::{
    sync::mpsc,
    time::{Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    connector::bounded,
    context::DeliveryContext,
    db,
    error::{DeliveryError, FailureLevel, MessageError},
    queue::QueueItem,
    registry::{Finished, Host},
};

/// What the dispatcher and status reporting can see of a running worker.
#[derive(Debug)]
pub struct WorkerState {
    session_open: AtomicBool,
    finished: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl WorkerState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            session_open: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Whether an SMTP session is currently open.
    pub fn is_active(&self) -> bool {
        self.session_open.load(Ordering::Acquire)
    }

    /// Set once the worker has settled its host and will do nothing more.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Time since the worker last delivered or connected.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Shortest gap between lease renewals, whatever the lease.
const MIN_RENEWAL_PERIOD: Duration = Duration::from_millis(100);

/// Why [`Worker::receive_message`] returned.
#[derive(Debug)]
enum Wake {
    Item(QueueItem),
    Idle,
    Stop,
}

pub struct Worker {
    ctx: Arc<DeliveryContext>,
    host: Host,
    wake: mpsc::UnboundedReceiver<()>,
    stop: StopToken,
    state: Arc<WorkerState>,
    session: Option<SmtpClient>,
}

impl Worker {
    /// A worker for `host`, which the caller must already have claimed.
    pub fn new(
        ctx: Arc<DeliveryContext>,
        host: Host,
        wake: mpsc::UnboundedReceiver<()>,
        stop: StopToken,
        state: Arc<WorkerState>,
    ) -> Self {
        Self {
            ctx,
            host,
            wake,
            stop,
            state,
            session: None,
        }
    }

    /// Delivers until the host has nothing ready, its session idles out,
    /// a host-level failure occurs, or a stop is requested. The host is
    /// always settled in the registry afterwards unless the lease was lost
    /// to another claimer.
    #[tracing::instrument(name = "worker", skip_all, fields(host = %self.host.name))]
    pub async fn run(mut self) {
        debug!("Worker started");

        let outcome = self.process().await;
        self.close_session().await;

        let settle = match outcome {
            Ok(()) => true,
            Err(err) if err.is_lease_lost() => {
                warn!("Lease lost, leaving the host to its new holder: {err}");
                false
            }
            Err(DeliveryError::Cancelled) => {
                debug!("Stopped while connecting");
                true
            }
            Err(err) => {
                match err.level() {
                    Some(_) => warn!(attempts = self.host.attempts, "Delivery aborted: {err}"),
                    None => error!("Delivery aborted: {err}"),
                }
                true
            }
        };

        if settle {
            if let Err(err) = self.finish().await {
                error!("Unable to settle host: {err}");
            }
        }

        self.state.finished.store(true, Ordering::Release);
        debug!("Worker finished");
    }

    async fn process(&mut self) -> Result<(), DeliveryError> {
        loop {
            if self.stop.is_stopped() {
                return Ok(());
            }

            self.renew_if_due().await?;

            let item = match self.next_item().await? {
                Some(item) => item,
                None if self.session.is_none() => return Ok(()),
                None => match self.receive_message().await? {
                    Wake::Item(item) => item,
                    Wake::Idle => {
                        debug!("Session idle, closing");
                        self.close_session().await;
                        continue;
                    }
                    Wake::Stop => return Ok(()),
                },
            };

            self.attempt(item).await?;
        }
    }

    /// Waits with an open session for the next ready item, the idle
    /// timeout, or a stop.
    ///
    /// Enqueues from this process arrive through the wake channel; the
    /// database is also polled for items enqueued elsewhere.
    async fn receive_message(&mut self) -> Result<Wake, DeliveryError> {
        let idle = tokio::time::sleep(self.ctx.config.idle_timeout());
        tokio::pin!(idle);

        let mut poll = tokio::time::interval(self.ctx.config.poll_interval());
        poll.tick().await;
        let mut renewal = self.renewal_timer();

        loop {
            tokio::select! {
                biased;
                () = self.stop.stopped() => return Ok(Wake::Stop),
                woken = self.wake.recv() => {
                    if woken.is_none() {
                        return Ok(Wake::Stop);
                    }
                    while self.wake.try_recv().is_ok() {}
                }
                _ = renewal.tick() => {
                    self.ctx.registry.renew(&mut self.host).await?;
                    debug!("Lease renewed while idle");
                    continue;
                }
                _ = poll.tick() => {}
                () = &mut idle => return Ok(Wake::Idle),
            }

            if let Some(item) = self.next_item().await? {
                return Ok(Wake::Item(item));
            }
        }
    }

    async fn next_item(&self) -> Result<Option<QueueItem>, DeliveryError> {
        let lock_until = after(db::now(), self.ctx.registry.lease());
        Ok(self.ctx.queue.next_for_host(&self.host.name, lock_until).await?)
    }

    async fn renew_if_due(&mut self) -> Result<(), DeliveryError> {
        if self.host.lease_remaining() < self.ctx.registry.lease() / 2 {
            self.ctx.registry.renew(&mut self.host).await?;
            debug!("Lease renewed");
        }
        Ok(())
    }

    /// Ticks first once half the remaining lease has passed, then every
    /// half lease.
    fn renewal_timer(&self) -> Interval {
        let period = (self.ctx.registry.lease() / 2).max(MIN_RENEWAL_PERIOD);
        let first = tokio::time::Instant::now() + self.host.lease_remaining() / 2;
        let mut timer = tokio::time::interval_at(first, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    }

    /// Drives `work` to completion while keeping the lease, and the lock on
    /// `item`, from expiring.
    ///
    /// The outer error means the lease could not be renewed; `work` is then
    /// abandoned where it stands.
    async fn holding<T, F>(
        &mut self,
        item: i64,
        work: F,
    ) -> Result<Result<T, DeliveryError>, DeliveryError>
    where
        F: Future<Output = Result<T, DeliveryError>>,
    {
        tokio::pin!(work);
        let mut renewal = self.renewal_timer();

        loop {
            tokio::select! {
                biased;
                result = &mut work => return Ok(result),
                _ = renewal.tick() => {
                    self.ctx
                        .registry
                        .renew_holding(&mut self.host, Some(item))
                        .await?;
                    debug!(id = item, "Lease renewed mid-delivery");
                }
            }
        }
    }

    /// One delivery attempt for `item`, opening a session first if needed.
    ///
    /// Returns an error only when the remaining items should be left for a
    /// later claim.
    async fn attempt(&mut self, item: QueueItem) -> Result<(), DeliveryError> {
        let ctx = Arc::clone(&self.ctx);

        let mut session = match self.session.take() {
            Some(session) => session,
            None => {
                let host = self.host.name.clone();
                let stop = self.stop.clone();
                match self.holding(item.id, connect(&ctx, &host, &stop)).await? {
                    Ok(session) => session,
                    Err(err) => {
                        self.ctx.queue.unlock(item.id).await?;
                        if err.level() == Some(FailureLevel::Host) {
                            self.host.failed(&self.ctx.config.retry);
                        }
                        return Err(err);
                    }
                }
            }
        };
        self.state.session_open.store(true, Ordering::Release);

        let result = match self.holding(item.id, deliver(&ctx, &mut session, &item)).await {
            Ok(result) => result,
            Err(lost) => {
                self.state.session_open.store(false, Ordering::Release);
                return Err(lost);
            }
        };
        self.state.touch();

        match result {
            Ok(()) => {
                info!(id = item.id, from = %item.from, to = ?item.to, "Delivered");
                self.host.succeeded();
                self.session = Some(session);
                self.complete(&item).await
            }
            Err(err) if err.level() == Some(FailureLevel::Message) => {
                warn!(id = item.id, from = %item.from, to = ?item.to, "Message rejected, dropping: {err}");
                self.host.succeeded();
                self.complete(&item).await?;
                self.reset(session).await;
                Ok(())
            }
            Err(err) if err.level() == Some(FailureLevel::Host) => {
                self.host.failed(&self.ctx.config.retry);
                self.state.session_open.store(false, Ordering::Release);
                self.record_failure(&item, None).await?;
                Err(err)
            }
            Err(err) if err.is_missing_body() => {
                error!(id = item.id, body = %item.body, "Body is gone, discarding item: {err}");
                self.ctx.queue.delete(item.id).await?;
                // Nothing was sent before the body was opened.
                self.session = Some(session);
                Ok(())
            }
            Err(err) => {
                self.state.session_open.store(false, Ordering::Release);
                let retry_at = self
                    .ctx
                    .config
                    .retry
                    .next_attempt(item.attempts.saturating_add(1), db::now());
                self.record_failure(&item, Some(retry_at)).await?;
                Err(err)
            }
        }
    }

    /// Ends the current transaction after a rejection so the session can
    /// carry the next item. A session that cannot be reset is dropped.
    async fn reset(&mut self, mut session: SmtpClient) {
        let quit_secs = self.ctx.connector.timeouts().quit_secs;
        match step("RSET", quit_secs, session.rset()).await {
            Ok(_) => self.session = Some(session),
            Err(err) => {
                debug!("RSET failed, dropping the session: {err}");
                self.state.session_open.store(false, Ordering::Release);
            }
        }
    }

    /// Removes a finished item and its body reference.
    async fn complete(&self, item: &QueueItem) -> Result<(), DeliveryError> {
        if self.ctx.queue.delete(item.id).await? {
            if let Err(err) = self.ctx.storage.release(item.body).await {
                error!(id = item.id, body = %item.body, "Unable to release body: {err}");
            }
        }
        Ok(())
    }

    /// Counts a failed attempt against `item`, giving up on it once it has
    /// been tried too often.
    async fn record_failure(
        &self,
        item: &QueueItem,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), DeliveryError> {
        let attempts = self.ctx.queue.record_failure(item.id, retry_at).await?;

        if attempts > self.ctx.config.max_item_attempts {
            error!(
                id = item.id,
                from = %item.from,
                to = ?item.to,
                attempts,
                "Giving up on item after too many attempts"
            );
            self.complete(item).await?;
        }
        Ok(())
    }

    async fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            let quit_secs = self.ctx.connector.timeouts().quit_secs;
            if let Err(err) = step("QUIT", quit_secs, session.quit()).await {
                debug!("QUIT failed: {err}");
            }
            internal!("Session closed with {}", session.server_domain());
        }
        self.state.session_open.store(false, Ordering::Release);
    }

    async fn finish(&self) -> Result<(), DeliveryError> {
        match self.ctx.registry.finished(&self.host).await? {
            Finished::Released => {
                debug!(
                    attempts = self.host.attempts,
                    next_attempt = ?self.host.next_attempt,
                    "Host released"
                );
            }
            Finished::Collected => debug!("Host has no more mail, removed"),
            Finished::Purged { bodies } => {
                error!(
                    attempts = self.host.attempts,
                    discarded = bodies.len(),
                    "Host failed too many times, discarding all mail queued for it"
                );
                for body in bodies {
                    if let Err(err) = self.ctx.storage.release(body).await {
                        error!(body = %body, "Unable to release body: {err}");
                    }
                }
            }
        }
        Ok(())
    }
}

async fn connect(
    ctx: &DeliveryContext,
    host: &str,
    stop: &StopToken,
) -> Result<SmtpClient, DeliveryError> {
    let servers = tokio::select! {
        biased;
        () = stop.stopped() => return Err(DeliveryError::Cancelled),
        servers = ctx.resolver.find_servers(host) => servers,
    };

    let session = ctx.connector.open(host, &servers, stop).await?;
    internal!("Session open with {}", session.server_domain());
    Ok(session)
}

/// One SMTP transaction. Recipients refused individually are dropped;
/// the item fails only if none is accepted.
async fn deliver(
    ctx: &DeliveryContext,
    session: &mut SmtpClient,
    item: &QueueItem,
) -> Result<(), DeliveryError> {
    let body = ctx.storage.open_body(item.body).await?;
    let timeouts = ctx.connector.timeouts();

    step("MAIL FROM", timeouts.mail_from_secs, session.mail_from(&item.from)).await?;

    let mut accepted = 0usize;
    let mut last_rejection = None;
    for rcpt in &item.to {
        match step("RCPT TO", timeouts.rcpt_to_secs, session.rcpt_to(rcpt)).await {
            Ok(_) => accepted += 1,
            Err(DeliveryError::Message(rejection)) => {
                warn!(id = item.id, rcpt = %rcpt, "Recipient refused: {rejection}");
                last_rejection = Some(rejection);
            }
            Err(err) => return Err(err),
        }
    }

    if accepted == 0 {
        return Err(last_rejection
            .unwrap_or_else(|| MessageError::InvalidAddress("no recipients".to_string()))
            .into());
    }

    step("DATA", timeouts.data_secs, session.data()).await?;
    step("message body", timeouts.body_secs, session.send_body(body)).await?;
    Ok(())
}

/// Runs one bounded SMTP round trip and turns a negative reply into an
/// error.
async fn step<F>(operation: &'static str, secs: u64, command: F) -> Result<Response, DeliveryError>
where
    F: Future<Output = client::Result<Response>>,
{
    Ok(bounded(operation, secs, command).await??.into_result()?)
}

fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
