//! Per-session lifecycle controller.
//!
//! A [`SessionController`] owns at most one [`SessionRecord`] and every
//! runtime resource bound to it: the idle monitor and the set of live
//! client stream relays. All mutating operations run under one async
//! mutex, so start, stop, destroy, stream registration, and idle checks
//! on the same session are serialized. Status reads never take that
//! mutex; they see the last committed record.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::clock::Clock;
use crate::config::GlobalConfig;
use crate::events::{EventKind, EventSink, SessionEvent};
use crate::models::identity::Identity;
use crate::models::session::{SessionRecord, SessionStatus};
use crate::persistence::session_repo::SessionRepo;
use crate::policy::AuthorizationGate;
use crate::relay::{self, Endpoint, RelayOutcome};
use crate::sandbox::{SandboxBackend, StartOptions};
use crate::{AppError, Result};

use super::idle_monitor::{IdleMonitor, IdleMonitorHandle, IdleVerdict};

/// How long quiesce waits for each relay to acknowledge cancellation.
const STREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables derived from [`GlobalConfig`].
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Members of this group bypass the ownership check.
    pub admin_group: String,
    /// Sandbox-internal port that client streams are relayed to.
    pub stream_port: u16,
    /// A running session idle for longer than this is stopped.
    pub idle_threshold: Duration,
    /// Idle monitor tick interval.
    pub idle_check_interval: Duration,
}

impl ControllerSettings {
    /// Extract controller settings from the global configuration.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            admin_group: config.admin_group.clone(),
            stream_port: config.sandbox.stream_port,
            idle_threshold: config.idle_threshold(),
            idle_check_interval: config.idle_check_interval(),
        }
    }
}

/// Dependencies shared by every controller in the process.
pub struct ControllerContext {
    /// Durable record store.
    pub repo: SessionRepo,
    /// Sandbox capability.
    pub sandbox: Arc<dyn SandboxBackend>,
    /// Structured event destination.
    pub events: Arc<dyn EventSink>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Tunables.
    pub settings: ControllerSettings,
}

/// A live client relay registered with the controller.
struct ClientStream {
    cancel: CancellationToken,
    closed: oneshot::Receiver<()>,
}

impl ClientStream {
    /// Force-close the relay and wait (bounded) for it to wind down.
    async fn close(self, session_id: &str, stream_id: u64) {
        self.cancel.cancel();
        if tokio::time::timeout(STREAM_CLOSE_TIMEOUT, self.closed)
            .await
            .is_err()
        {
            warn!(session_id, stream_id, "client stream did not close in time");
        }
    }
}

#[derive(Default)]
struct ControllerState {
    record: Option<SessionRecord>,
    retired: bool,
    streams: HashMap<u64, ClientStream>,
    next_stream_id: u64,
    idle: Option<IdleMonitorHandle>,
}

struct Inner {
    ctx: Arc<ControllerContext>,
    gate: AuthorizationGate,
    state: Mutex<ControllerState>,
    committed: RwLock<Option<SessionRecord>>,
}

/// Lifecycle controller for one session. Cheap to clone.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    /// Controller with no record yet; call [`create`](Self::create) next.
    #[must_use]
    pub fn new(ctx: Arc<ControllerContext>) -> Self {
        Self::with_record(ctx, None)
    }

    /// Rebuild a controller from a persisted record after a restart.
    ///
    /// A `Running` record gets a fresh idle monitor; nothing is persisted.
    pub async fn recover(ctx: Arc<ControllerContext>, record: SessionRecord) -> Self {
        let running = record.status == SessionStatus::Running;
        let session_id = record.session_id.clone();
        let controller = Self::with_record(ctx, Some(record));

        if running {
            let mut state = controller.inner.state.lock().await;
            controller.arm_idle_monitor(&mut state, &session_id);
        }

        controller
    }

    fn with_record(ctx: Arc<ControllerContext>, record: Option<SessionRecord>) -> Self {
        let gate = AuthorizationGate::new(ctx.settings.admin_group.clone());
        let state = ControllerState {
            record: record.clone(),
            ..ControllerState::default()
        };
        Self {
            inner: Arc::new(Inner {
                ctx,
                gate,
                state: Mutex::new(state),
                committed: RwLock::new(record),
            }),
        }
    }

    /// Create the session record, owned by `identity`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if a record already exists,
    /// `AppError::NotFound` if the controller was destroyed, or
    /// `AppError::Db` if persisting fails.
    pub async fn create(&self, identity: &Identity) -> Result<SessionRecord> {
        let mut state = self.inner.state.lock().await;
        if state.retired {
            return Err(destroyed());
        }
        // Creation is evaluated against the absence of a record.
        self.inner.gate.ensure(identity, None)?;

        if let Some(existing) = &state.record {
            return Err(AppError::Conflict(format!(
                "session {} already exists",
                existing.session_id
            )));
        }

        let record = SessionRecord::new(identity.owner_id.clone(), self.now());
        self.commit(&mut state, record.clone()).await?;

        info!(session_id = %record.session_id, owner = %record.owner, "session created");
        self.emit(EventKind::SessionCreated, &record, None);
        Ok(record)
    }

    /// Boot the sandbox and bring the session to `Running`.
    ///
    /// Starting an already running session only refreshes and persists
    /// `last_seen`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Forbidden`, `AppError::NotFound`, or
    /// `AppError::InvalidState` before any mutation, and
    /// `AppError::Upstream` if the sandbox fails to start (the record is
    /// then left in `Error` carrying the cause).
    pub async fn start(&self, identity: &Identity) -> Result<SessionRecord> {
        let mut state = self.inner.state.lock().await;
        let mut record = self.authorized(&state, identity)?;
        let session_id = record.session_id.clone();
        let span = info_span!("start_session", session_id = %session_id);

        async move {
            if record.status == SessionStatus::Running {
                record.touch(self.now());
                self.commit(&mut state, record.clone()).await?;
                debug!("session already running");
                return Ok(record);
            }

            record.transition_to(SessionStatus::Starting)?;
            record.touch(self.now());
            self.commit(&mut state, record.clone()).await?;

            info!("starting sandbox");
            let handle = self.inner.ctx.sandbox.handle(&session_id);
            let options = StartOptions {
                enable_outbound_network: true,
            };

            match handle.start(options).await {
                Ok(()) => {
                    let mut running = record.clone();
                    running.transition_to(SessionStatus::Running)?;
                    running.touch(self.now());

                    if let Err(err) = self.commit(&mut state, running.clone()).await {
                        // An unrecorded sandbox would never be idled out.
                        warn!(%err, "failed to persist running state, destroying sandbox");
                        if let Err(destroy_err) = handle.destroy().await {
                            warn!(err = %destroy_err, "sandbox destroy failed, treating as gone");
                        }
                        record.transition_to(SessionStatus::Error)?;
                        record.error_message = Some(err.detail().to_owned());
                        self.publish(&mut state, record.clone());
                        self.emit(EventKind::Error, &record, record.error_message.clone());
                        return Err(err);
                    }
                    self.arm_idle_monitor(&mut state, &session_id);

                    info!("session running");
                    self.emit(EventKind::SessionStarted, &running, None);
                    Ok(running)
                }
                Err(err) => {
                    let cause = err.detail().to_owned();
                    record.transition_to(SessionStatus::Error)?;
                    record.error_message = Some(cause.clone());
                    let persisted = self.commit_or_publish(&mut state, record.clone()).await;

                    warn!(%err, "sandbox start failed");
                    self.emit(EventKind::Error, &record, Some(cause.clone()));
                    persisted?;
                    Err(AppError::Upstream(cause))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Tear the sandbox down and close every client stream.
    ///
    /// Stopping an already stopped session is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Forbidden` or `AppError::NotFound` before any
    /// mutation, or `AppError::Db` if persisting the final state fails.
    pub async fn stop(&self, identity: &Identity) -> Result<SessionRecord> {
        let mut state = self.inner.state.lock().await;
        let mut record = self.authorized(&state, identity)?;

        if record.status == SessionStatus::Stopped {
            debug!(session_id = %record.session_id, "session already stopped");
            return Ok(record);
        }

        record.touch(self.now());
        self.stop_locked(&mut state, record, "stop requested").await
    }

    /// Quiesce the session and delete its record. The controller is
    /// unusable afterwards.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Forbidden` or `AppError::NotFound` before any
    /// mutation, or `AppError::Db` if the delete fails. The sandbox is
    /// gone by then, so the session is left `Stopped` and a retry only
    /// repeats the delete.
    pub async fn destroy(&self, identity: &Identity) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let mut record = self.authorized(&state, identity)?;

        let sandbox_live = record.status != SessionStatus::Stopped;
        self.quiesce(&mut state, sandbox_live.then_some(record.session_id.as_str()))
            .await;

        if let Err(err) = self.inner.ctx.repo.delete(&record.session_id).await {
            warn!(session_id = %record.session_id, %err, "failed to delete session record");
            if sandbox_live {
                record.transition_to(SessionStatus::Stopped)?;
                // The store is already failing; keep memory truthful.
                let _ = self.commit_or_publish(&mut state, record).await;
            }
            return Err(err);
        }
        state.record = None;
        state.retired = true;
        *self
            .inner
            .committed
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;

        info!(session_id = %record.session_id, "session destroyed");
        self.emit(EventKind::SessionDestroyed, &record, None);
        Ok(())
    }

    /// Last committed record. Never waits on an in-flight operation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Forbidden` if `identity` may not see the
    /// session, or `AppError::NotFound` if there is no record.
    pub fn status(&self, identity: &Identity) -> Result<SessionRecord> {
        let committed = self
            .inner
            .committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        self.inner.gate.ensure(identity, committed.as_ref())?;
        committed.ok_or_else(|| AppError::NotFound("session not found".into()))
    }

    /// Session identifier of the committed record, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.inner
            .committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|record| record.session_id.clone())
    }

    /// Open a relay to the sandbox stream port on behalf of a client.
    ///
    /// `protocols` are the client's offered websocket sub-protocols,
    /// forwarded verbatim. The returned grant must be driven with
    /// [`StreamGrant::run`]; dropping it unregisters the stream.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Forbidden` or `AppError::NotFound`,
    /// `AppError::InvalidState` unless the session is `Running`, or
    /// `AppError::Upstream` if the sandbox refuses the stream.
    pub async fn open_stream(
        &self,
        identity: &Identity,
        protocols: Vec<String>,
    ) -> Result<StreamGrant> {
        let mut state = self.inner.state.lock().await;
        let mut record = self.authorized(&state, identity)?;

        if record.status != SessionStatus::Running {
            return Err(AppError::InvalidState(format!(
                "session is {}, not running",
                record.status
            )));
        }

        let stream = self
            .inner
            .ctx
            .sandbox
            .handle(&record.session_id)
            .open_stream(self.inner.ctx.settings.stream_port, protocols)
            .await
            .map_err(|err| {
                AppError::Upstream(format!("failed to open sandbox stream: {}", err.detail()))
            })?;

        record.touch(self.now());
        self.commit(&mut state, record.clone()).await?;

        let stream_id = state.next_stream_id;
        state.next_stream_id += 1;
        let cancel = CancellationToken::new();
        let (closed_tx, closed_rx) = oneshot::channel();
        state.streams.insert(
            stream_id,
            ClientStream {
                cancel: cancel.clone(),
                closed: closed_rx,
            },
        );

        info!(
            session_id = %record.session_id,
            stream_id,
            open_streams = state.streams.len(),
            "stream connected"
        );
        self.emit(EventKind::StreamConnected, &record, None);

        Ok(StreamGrant {
            sandbox: stream.endpoint,
            protocol: stream.protocol,
            ticket: StreamTicket {
                controller: self.clone(),
                stream_id,
                session_id: record.session_id,
                owner: record.owner,
                cancel,
                closed: Some(closed_tx),
                finished: false,
            },
        })
    }

    /// Evaluate inactivity now. Invoked by the idle monitor on each tick.
    ///
    /// Open streams count as activity and refresh `last_seen`. A session
    /// idle past the threshold is stopped exactly as an explicit stop.
    pub async fn check_idle(&self) -> IdleVerdict {
        let mut state = self.inner.state.lock().await;
        if state.retired {
            return IdleVerdict::Disarmed;
        }
        let Some(mut record) = state.record.clone() else {
            return IdleVerdict::Disarmed;
        };
        if record.status != SessionStatus::Running {
            return IdleVerdict::Disarmed;
        }

        let now = self.now();
        if !state.streams.is_empty() {
            record.touch(now);
            if let Err(err) = self.commit(&mut state, record).await {
                warn!(%err, "failed to persist stream activity");
            }
            return IdleVerdict::Active;
        }

        let idle_for = (now - record.last_seen).to_std().unwrap_or_default();
        if idle_for <= self.inner.ctx.settings.idle_threshold {
            return IdleVerdict::Active;
        }

        info!(
            session_id = %record.session_id,
            idle_secs = idle_for.as_secs(),
            "idle threshold exceeded"
        );
        match self.stop_locked(&mut state, record, "idle timeout").await {
            Ok(_) => IdleVerdict::Stopped,
            Err(err) => {
                warn!(%err, "idle stop failed");
                IdleVerdict::Disarmed
            }
        }
    }

    /// Disarm the idle monitor and close client streams without touching
    /// the sandbox or the record. Used on process shutdown.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        self.quiesce(&mut state, None).await;
    }

    /// Number of registered client streams.
    pub async fn open_stream_count(&self) -> usize {
        self.inner.state.lock().await.streams.len()
    }

    /// Whether an idle monitor is currently armed.
    pub async fn idle_monitor_armed(&self) -> bool {
        self.inner
            .state
            .lock()
            .await
            .idle
            .as_ref()
            .is_some_and(IdleMonitorHandle::is_armed)
    }

    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.inner.ctx.clock.now()
    }

    /// Gate check, then the current record.
    fn authorized(&self, state: &ControllerState, identity: &Identity) -> Result<SessionRecord> {
        if state.retired {
            return Err(destroyed());
        }
        self.inner.gate.ensure(identity, state.record.as_ref())?;
        state
            .record
            .clone()
            .ok_or_else(|| AppError::NotFound("session not found".into()))
    }

    /// Persist, then publish to the in-memory and committed copies.
    async fn commit(&self, state: &mut ControllerState, record: SessionRecord) -> Result<()> {
        self.inner.ctx.repo.upsert(&record).await?;
        self.publish(state, record);
        Ok(())
    }

    /// Like [`commit`](Self::commit), but publishes even when the write
    /// fails. Used once the sandbox has already changed underneath.
    async fn commit_or_publish(
        &self,
        state: &mut ControllerState,
        record: SessionRecord,
    ) -> Result<()> {
        let persisted = self.inner.ctx.repo.upsert(&record).await;
        if let Err(err) = &persisted {
            warn!(session_id = %record.session_id, %err, "record not persisted, memory updated anyway");
        }
        self.publish(state, record);
        persisted
    }

    fn publish(&self, state: &mut ControllerState, record: SessionRecord) {
        *self
            .inner
            .committed
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(record.clone());
        state.record = Some(record);
    }

    async fn stop_locked(
        &self,
        state: &mut ControllerState,
        mut record: SessionRecord,
        reason: &str,
    ) -> Result<SessionRecord> {
        self.quiesce(state, Some(&record.session_id)).await;

        record.transition_to(SessionStatus::Stopped)?;
        let persisted = self.commit_or_publish(state, record.clone()).await;

        info!(session_id = %record.session_id, reason, "session stopped");
        self.emit(EventKind::SessionStopped, &record, Some(reason.to_owned()));
        persisted.map(|()| record)
    }

    /// Disarm idle, close all streams, then destroy the sandbox if asked.
    async fn quiesce(&self, state: &mut ControllerState, destroy_sandbox: Option<&str>) {
        if let Some(idle) = state.idle.take() {
            idle.disarm();
        }

        let session_id = state
            .record
            .as_ref()
            .map(|record| record.session_id.clone())
            .unwrap_or_default();
        let streams: Vec<(u64, ClientStream)> = state.streams.drain().collect();
        if !streams.is_empty() {
            debug!(session_id = %session_id, count = streams.len(), "closing client streams");
        }
        join_all(
            streams
                .into_iter()
                .map(|(stream_id, stream)| stream.close(&session_id, stream_id)),
        )
        .await;

        if let Some(session_id) = destroy_sandbox {
            if let Err(err) = self.inner.ctx.sandbox.handle(session_id).destroy().await {
                warn!(session_id, %err, "sandbox destroy failed, treating as gone");
            }
        }
    }

    fn arm_idle_monitor(&self, state: &mut ControllerState, session_id: &str) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let monitor = IdleMonitor::new(
            session_id.to_owned(),
            self.inner.ctx.settings.idle_check_interval,
        );

        let handle = monitor.spawn(move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => SessionController { inner }.check_idle().await,
                    None => IdleVerdict::Disarmed,
                }
            }
        });

        // Replacing a previous handle drops it, which disarms it.
        state.idle = Some(handle);
    }

    async fn finish_stream(&self, stream_id: u64, session_id: &str, owner: &str, detail: String) {
        let mut state = self.inner.state.lock().await;
        let still_registered = state.streams.remove(&stream_id).is_some();
        drop(state);

        info!(session_id, stream_id, still_registered, detail = %detail, "stream disconnected");
        self.emit_raw(
            SessionEvent::new(EventKind::StreamDisconnected, session_id, owner, self.now())
                .with_message(detail),
        );
    }

    fn emit(&self, kind: EventKind, record: &SessionRecord, message: Option<String>) {
        let mut event = SessionEvent::new(kind, &record.session_id, &record.owner, self.now());
        event.message = message;
        self.emit_raw(event);
    }

    fn emit_raw(&self, event: SessionEvent) {
        if let Err(err) = self.inner.ctx.events.emit(&event) {
            warn!(%err, event = event.event.as_str(), "failed to write session event");
        }
    }
}

fn destroyed() -> AppError {
    AppError::NotFound("session destroyed".into())
}

/// A registered client stream, ready to be relayed.
pub struct StreamGrant {
    sandbox: Endpoint,
    protocol: Option<String>,
    ticket: StreamTicket,
}

impl StreamGrant {
    /// Sub-protocol the sandbox selected; echo it to the client.
    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Controller-local identifier of this stream.
    #[must_use]
    pub fn stream_id(&self) -> u64 {
        self.ticket.stream_id
    }

    /// Relay frames between `client` and the sandbox until either side
    /// closes or the controller quiesces, then unregister the stream.
    pub async fn run(self, client: Endpoint) -> RelayOutcome {
        let Self { sandbox, ticket, .. } = self;
        let span = info_span!("relay", session_id = %ticket.session_id, stream_id = ticket.stream_id);

        let outcome = relay::run(client, sandbox, &ticket.cancel)
            .instrument(span)
            .await;
        ticket.finish(&outcome).await;
        outcome
    }
}

/// Unregisters its stream exactly once, even if the grant is dropped
/// before [`StreamGrant::run`] is reached.
struct StreamTicket {
    controller: SessionController,
    stream_id: u64,
    session_id: String,
    owner: String,
    cancel: CancellationToken,
    closed: Option<oneshot::Sender<()>>,
    finished: bool,
}

impl StreamTicket {
    async fn finish(mut self, outcome: &RelayOutcome) {
        self.finished = true;
        if let Some(closed) = self.closed.take() {
            let _ = closed.send(());
        }
        self.controller
            .finish_stream(
                self.stream_id,
                &self.session_id,
                &self.owner,
                outcome.describe(),
            )
            .await;
    }
}

impl Drop for StreamTicket {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(closed) = self.closed.take() {
            let _ = closed.send(());
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let controller = self.controller.clone();
        let stream_id = self.stream_id;
        let session_id = std::mem::take(&mut self.session_id);
        let owner = std::mem::take(&mut self.owner);
        runtime.spawn(async move {
            controller
                .finish_stream(stream_id, &session_id, &owner, "abandoned before relay".into())
                .await;
        });
    }
}
