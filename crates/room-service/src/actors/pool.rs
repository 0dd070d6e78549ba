//! `RoomPoolActor` - process-wide registry of room actors.
//!
//! The pool:
//!
//! - Owns the `HashMap` of rooms keyed by room id
//! - Creates rooms lazily on first connection
//! - Evicts rooms idle beyond the configured timeout
//! - Owns the root `CancellationToken`; every room gets a child token
//! - Detects room tasks that ended unexpectedly (panic via `JoinHandle`)
//!
//! # Eviction
//!
//! The sweep asks each room to expire itself (`ExpireIfIdle`). The idle check
//! and the shutdown run inside the room's own mailbox, so eviction never
//! races a message the room is processing. Checks run concurrently in a
//! spawned task; the pool keeps serving lookups meanwhile and removes the
//! expired rooms when the results come back through its mailbox. The entry is
//! removed only after the room has detached every participant.

use crate::errors::RoomError;
use crate::negotiation::NegotiationBackend;
use crate::observability::metrics as prom;
use crate::report::RoomReport;

use super::messages::{PoolMessage, PoolStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomHandle};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the pool mailbox.
const POOL_CHANNEL_BUFFER: usize = 1000;

/// How long graceful shutdown waits for each room task by default.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a removed room task is awaited in the background.
const REMOVAL_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle expiration settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Rooms without activity for this long are shut down and removed.
    pub idle_timeout: Duration,
    /// Period of the background idle sweep.
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Handle to the `RoomPoolActor`.
#[derive(Clone)]
pub struct RoomPoolHandle {
    sender: mpsc::Sender<PoolMessage>,
    cancel_token: CancellationToken,
}

impl RoomPoolHandle {
    /// Spawn the pool actor and return a handle to it.
    #[must_use]
    pub fn new(
        config: PoolConfig,
        backend: Arc<dyn NegotiationBackend>,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(POOL_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RoomPoolActor {
            receiver,
            mailbox_sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            config,
            backend,
            rooms: HashMap::new(),
            accepting_new: true,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Pool, "room-pool"),
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Look up a live room.
    pub async fn get(&self, room_id: String) -> Result<Option<RoomHandle>, RoomError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(PoolMessage::Get {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    /// Register a room spawned by the caller.
    ///
    /// Fails with [`RoomError::RoomExists`] if `room_id` is taken; the
    /// rejected room is cancelled.
    pub async fn attach(
        &self,
        room_id: String,
        handle: RoomHandle,
        task_handle: JoinHandle<()>,
    ) -> Result<(), RoomError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(PoolMessage::Attach {
                room_id,
                handle,
                task_handle,
                respond_to: tx,
            })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))?
    }

    /// Return the room for `room_id`, creating it on a miss.
    pub async fn get_or_create(&self, room_id: String) -> Result<RoomHandle, RoomError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(PoolMessage::GetOrCreate {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))?
    }

    /// Inspection reports of every room, sorted by room id.
    pub async fn report(&self) -> Result<Vec<RoomReport>, RoomError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(PoolMessage::Report { respond_to: tx })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn status(&self) -> Result<PoolStatus, RoomError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(PoolMessage::Status { respond_to: tx })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    /// Run an idle sweep immediately. Returns the number of evicted rooms.
    pub async fn sweep(&self) -> Result<usize, RoomError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(PoolMessage::Sweep { respond_to: tx })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop accepting rooms and shut every room down, waiting up to
    /// `deadline` for each room task.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), RoomError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(PoolMessage::Shutdown {
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))?
    }

    /// Shut down gracefully and wait for the pool actor to exit.
    ///
    /// Returns `false` if the pool was still running at `deadline`. Rooms
    /// have finished saying goodbye once this returns `true`.
    pub async fn drain(&self, deadline: Duration) -> bool {
        if let Err(e) = self.shutdown(deadline).await {
            warn!(target: "rs.actor.pool", error = %e, "Room pool shutdown error");
        }
        tokio::time::timeout(deadline, async {
            while !self.is_closed() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .is_ok()
    }

    /// Cancel the pool and every room (immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Child token for rooms spawned outside the pool and attached later.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// Whether the pool actor has exited.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// A room registered in the pool.
struct ManagedRoom {
    handle: RoomHandle,
    task_handle: JoinHandle<()>,
    /// Unix timestamp of registration.
    created_at: i64,
}

pub struct RoomPoolActor {
    receiver: mpsc::Receiver<PoolMessage>,
    /// Used by sweep tasks to report back without keeping the pool alive.
    mailbox_sender: mpsc::WeakSender<PoolMessage>,
    /// Root token; rooms hold children of it.
    cancel_token: CancellationToken,
    config: PoolConfig,
    backend: Arc<dyn NegotiationBackend>,
    rooms: HashMap<String, ManagedRoom>,
    accepting_new: bool,
    /// Per-room wait during graceful shutdown.
    drain_timeout: Duration,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomPoolActor {
    #[instrument(skip_all, name = "rs.actor.pool")]
    async fn run(mut self) {
        info!(
            target: "rs.actor.pool",
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            "RoomPoolActor started"
        );

        let mut sweep = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.sweep_interval,
            self.config.sweep_interval,
        );
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "rs.actor.pool",
                        "RoomPoolActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = sweep.tick() => {
                    self.sweep_idle_rooms(None);
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "rs.actor.pool",
                                "RoomPoolActor channel closed, exiting"
                            );
                            self.cancel_token.cancel();
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "rs.actor.pool",
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomPoolActor stopped"
        );
    }

    async fn handle_message(&mut self, message: PoolMessage) {
        match message {
            PoolMessage::Get {
                room_id,
                respond_to,
            } => {
                let handle = self.live_room(&room_id).cloned();
                let _ = respond_to.send(handle);
            }

            PoolMessage::Attach {
                room_id,
                handle,
                task_handle,
                respond_to,
            } => {
                let result = self.attach(room_id, handle, task_handle);
                let _ = respond_to.send(result);
            }

            PoolMessage::GetOrCreate {
                room_id,
                respond_to,
            } => {
                let result = self.get_or_create(room_id);
                let _ = respond_to.send(result);
            }

            PoolMessage::Report { respond_to } => {
                self.spawn_report(respond_to);
            }

            PoolMessage::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }

            PoolMessage::Sweep { respond_to } => {
                self.sweep_idle_rooms(Some(respond_to));
            }

            PoolMessage::IdleChecked {
                expired,
                respond_to,
            } => {
                let evicted = self.remove_expired(expired);
                if let Some(respond_to) = respond_to {
                    let _ = respond_to.send(evicted);
                }
            }

            PoolMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                info!(
                    target: "rs.actor.pool",
                    room_count = self.rooms.len(),
                    deadline_secs = deadline.as_secs(),
                    "Initiating graceful shutdown"
                );
                self.accepting_new = false;
                self.drain_timeout = deadline;
                self.cancel_token.cancel();
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    /// A registered room whose actor is still reading its mailbox.
    fn live_room(&self, room_id: &str) -> Option<&RoomHandle> {
        self.rooms
            .get(room_id)
            .map(|managed| &managed.handle)
            .filter(|handle| !handle.is_closed() && !handle.is_cancelled())
    }

    fn attach(
        &mut self,
        room_id: String,
        handle: RoomHandle,
        task_handle: JoinHandle<()>,
    ) -> Result<(), RoomError> {
        if !self.accepting_new {
            handle.cancel();
            return Err(RoomError::RoomClosed);
        }
        if self.live_room(&room_id).is_some() {
            warn!(
                target: "rs.actor.pool",
                room_id = %room_id,
                "Attach rejected, room already registered"
            );
            handle.cancel();
            return Err(RoomError::RoomExists(room_id));
        }

        self.register(room_id, handle, task_handle);
        Ok(())
    }

    fn get_or_create(&mut self, room_id: String) -> Result<RoomHandle, RoomError> {
        if let Some(handle) = self.live_room(&room_id) {
            return Ok(handle.clone());
        }
        if !self.accepting_new {
            return Err(RoomError::RoomClosed);
        }

        debug!(
            target: "rs.actor.pool",
            room_id = %room_id,
            "Creating room actor"
        );

        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            self.cancel_token.child_token(),
            Arc::clone(&self.backend),
            Arc::clone(&self.metrics),
        );
        self.register(room_id, handle.clone(), task_handle);
        Ok(handle)
    }

    fn register(&mut self, room_id: String, handle: RoomHandle, task_handle: JoinHandle<()>) {
        let previous = self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle,
                task_handle,
                created_at: chrono::Utc::now().timestamp(),
            },
        );
        // A stopped room still registered under this id is replaced.
        if previous.is_some() {
            self.metrics.room_removed();
        }
        self.metrics.room_created();

        info!(
            target: "rs.actor.pool",
            room_id = %room_id,
            total_rooms = self.rooms.len(),
            "Room registered"
        );
    }

    /// Gather reports off the pool's loop so a busy room cannot stall it.
    fn spawn_report(&self, respond_to: tokio::sync::oneshot::Sender<Vec<RoomReport>>) {
        let handles: Vec<RoomHandle> = self
            .rooms
            .values()
            .map(|managed| managed.handle.clone())
            .collect();

        tokio::spawn(async move {
            let mut reports = Vec::with_capacity(handles.len());
            for handle in handles {
                match handle.report().await {
                    Ok(report) => reports.push(report),
                    Err(e) => {
                        debug!(
                            target: "rs.actor.pool",
                            room_id = %handle.room_id(),
                            error = %e,
                            "Room unavailable for report"
                        );
                    }
                }
            }
            reports.sort_by(|a, b| a.id.cmp(&b.id));
            let _ = respond_to.send(reports);
        });
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            room_count: self.rooms.len(),
            participant_count: self.metrics.participant_count(),
            is_shutting_down: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    /// Ask every room to expire itself, concurrently and off the pool's loop.
    ///
    /// Rooms that expired come back as `IdleChecked` and are removed there.
    fn sweep_idle_rooms(&self, respond_to: Option<oneshot::Sender<usize>>) {
        let idle_timeout = self.config.idle_timeout;
        let mailbox = self.mailbox_sender.clone();
        let mut checks = JoinSet::new();
        for managed in self.rooms.values() {
            let handle = managed.handle.clone();
            checks.spawn(async move {
                let result = handle.expire_if_idle(idle_timeout).await;
                (handle, result)
            });
        }

        tokio::spawn(async move {
            let mut expired = Vec::new();
            while let Some(joined) = checks.join_next().await {
                match joined {
                    Ok((handle, Ok(true))) => expired.push(handle),
                    Ok((_, Ok(false))) => {}
                    Ok((handle, Err(e))) => {
                        // Left for the health check.
                        debug!(
                            target: "rs.actor.pool",
                            room_id = %handle.room_id(),
                            error = %e,
                            "Room did not answer idle check"
                        );
                    }
                    Err(e) => {
                        warn!(
                            target: "rs.actor.pool",
                            error = %e,
                            "Idle check task failed"
                        );
                    }
                }
            }

            if let Some(sender) = mailbox.upgrade() {
                let _ = sender
                    .send(PoolMessage::IdleChecked {
                        expired,
                        respond_to,
                    })
                    .await;
            }
        });
    }

    /// Drop expired rooms still registered under their id.
    fn remove_expired(&mut self, expired: Vec<RoomHandle>) -> usize {
        let mut evicted = 0;
        for handle in expired {
            let registered = self
                .rooms
                .get(handle.room_id())
                .is_some_and(|managed| managed.handle.same_room(&handle));
            if !registered {
                continue;
            }
            self.remove_room(handle.room_id());
            prom::record_room_evicted();
            evicted += 1;
        }

        if evicted > 0 {
            info!(
                target: "rs.actor.pool",
                evicted,
                total_rooms = self.rooms.len(),
                "Idle rooms evicted"
            );
        }
        evicted
    }

    /// Remove a room and wait for its task in the background.
    fn remove_room(&mut self, room_id: &str) {
        let Some(managed) = self.rooms.remove(room_id) else {
            return;
        };
        managed.handle.cancel();
        self.metrics.room_removed();

        let room_id_owned = room_id.to_string();
        let lifetime_secs = chrono::Utc::now().timestamp() - managed.created_at;
        tokio::spawn(async move {
            match tokio::time::timeout(REMOVAL_WAIT_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "rs.actor.pool",
                        room_id = %room_id_owned,
                        lifetime_secs,
                        "Room actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "rs.actor.pool",
                        room_id = %room_id_owned,
                        error = ?e,
                        "Room actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "rs.actor.pool",
                        room_id = %room_id_owned,
                        "Room actor task cleanup timed out"
                    );
                }
            }
        });

        info!(
            target: "rs.actor.pool",
            room_id = %room_id,
            total_rooms = self.rooms.len(),
            "Room removed"
        );
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "rs.actor.pool",
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        for (room_id, managed) in self.rooms.drain() {
            match tokio::time::timeout(self.drain_timeout, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "rs.actor.pool",
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "rs.actor.pool",
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "rs.actor.pool",
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.metrics.room_removed();
        }

        info!(target: "rs.actor.pool", "Graceful shutdown complete");
    }

    /// Drop rooms whose task has ended.
    async fn check_room_health(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            let Some(managed) = self.rooms.remove(&room_id) else {
                continue;
            };

            match managed.task_handle.await {
                Ok(()) => {
                    info!(
                        target: "rs.actor.pool",
                        room_id = %room_id,
                        "Room actor exited"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "rs.actor.pool",
                            room_id = %room_id,
                            error = ?join_error,
                            "Room actor panicked"
                        );
                        self.metrics.record_panic(ActorType::Room);
                    }
                }
            }

            self.metrics.room_removed();
        }
    }
}
