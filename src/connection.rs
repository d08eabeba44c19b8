#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use tokio::sync::{broadcast, watch};

use crate::Result;
use crate::config::ConnectionConfig;
use crate::error::{Error, Kind, TransportLost};
use crate::session::{Component, Lifecycle, LifecycleKind, SessionHandle};

/// Broadcast channel capacity for session events.
const EVENT_CAPACITY: usize = 64;

type JoinOutcome = std::result::Result<SessionHandle, Arc<Error>>;

type Running = Shared<BoxFuture<'static, std::result::Result<(), Arc<Error>>>>;

/// Changes of the session, forwarded from the component's lifecycle events.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session joined the realm
    Joined,
    /// A connection attempt failed
    ConnectFailed,
    /// The session left the realm
    Left,
    /// The transport went away
    Disconnected { was_clean: bool },
}

/// One resolution of a pending join.
struct Slot {
    tx: watch::Sender<Option<JoinOutcome>>,
}

impl Slot {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    fn resolve(self, outcome: JoinOutcome) {
        self.tx.send_replace(Some(outcome));
    }
}

/// Resolve-once notification of the next session join.
///
/// Every resolution replaces the slot, so a join always finds an unresolved
/// slot in place and a later [`waiter`](Self::waiter) waits for the join after
/// it.
pub struct PendingJoin {
    slot: Mutex<Slot>,
}

impl PendingJoin {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::new()),
        }
    }

    /// Waiter for the current slot.
    ///
    /// Take it before starting whatever may resolve the slot.
    #[must_use]
    pub fn waiter(&self) -> JoinWaiter {
        JoinWaiter {
            rx: self.lock().tx.subscribe(),
        }
    }

    /// Resolve the current slot and put a fresh one in its place.
    pub fn resolve(&self, outcome: JoinOutcome) {
        let slot = mem::replace(&mut *self.lock(), Slot::new());
        slot.resolve(outcome);
    }

    /// Drop the current slot unresolved and put a fresh one in its place.
    ///
    /// Waiters of the dropped slot fail with a [`Kind::Connect`] error.
    pub fn reset(&self) {
        *self.lock() = Slot::new();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        // A slot is replaced whole, there is no partial state to recover from.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for PendingJoin {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits on one slot of a [`PendingJoin`].
pub struct JoinWaiter {
    rx: watch::Receiver<Option<JoinOutcome>>,
}

impl JoinWaiter {
    /// Wait for the slot to be resolved.
    pub async fn wait(mut self) -> Result<SessionHandle> {
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_reset) => {
                return Err(Error::connect("connection was reset before a session joined"));
            }
        };

        match outcome {
            Some(Ok(session)) => Ok(session),
            Some(Err(e)) => Err(Error::shared(e)),
            None => Err(Error::connect("join resolved without an outcome")),
        }
    }
}

/// Decides whether `error` ends the component for good.
///
/// Lost transports are never retried: the caller decides whether to open a
/// new connection.
pub fn is_transport_lost(error: &Error) -> bool {
    let lost = error.kind() == Kind::FatalTransport || error.downcast_ref::<TransportLost>().is_some();

    #[cfg(feature = "tracing")]
    if lost {
        tracing::info!(%error, "transport lost, not reconnecting");
    }

    lost
}

/// Owns a component and turns its lifecycle into an awaitable session.
///
/// Opening starts the component and resolves once a session joined. The
/// session can be requested at any time with [`session`](Self::session), which
/// opens the connection when needed; concurrent callers share one attempt.
pub struct ConnectionManager<C: Component> {
    config: ConnectionConfig,
    component: C,
    pending: Arc<PendingJoin>,
    events: broadcast::Sender<SessionEvent>,
    running: Mutex<Option<Running>>,
    opening: AtomicBool,
}

impl<C: Component> ConnectionManager<C> {
    /// Create the component for `config`.
    ///
    /// Nothing connects until [`open`](Self::open) or [`session`](Self::session) is called.
    pub fn new(config: ConnectionConfig, options: C::Options) -> Result<Self> {
        let component = C::create(&config, options, is_transport_lost)?;
        let pending = Arc::new(PendingJoin::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self::register_listeners(&component, &pending, &events);

        Ok(Self {
            config,
            component,
            pending,
            events,
            running: Mutex::new(None),
            opening: AtomicBool::new(false),
        })
    }

    fn register_listeners(
        component: &C,
        pending: &Arc<PendingJoin>,
        events: &broadcast::Sender<SessionEvent>,
    ) {
        let listeners = component.listeners();

        listeners.on(LifecycleKind::Connect, |_| {
            #[cfg(feature = "tracing")]
            tracing::debug!("transport connected");
        });

        let (slot, tx) = (Arc::clone(pending), events.clone());
        listeners.on(LifecycleKind::ConnectFailure, move |event| {
            if let Lifecycle::ConnectFailure(e) = event {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %e, "connection attempt failed");
                slot.resolve(Err(Arc::clone(e)));
                _ = tx.send(SessionEvent::ConnectFailed);
            }
        });

        let (slot, tx) = (Arc::clone(pending), events.clone());
        listeners.on(LifecycleKind::Join, move |event| {
            if let Lifecycle::Join(session) = event {
                #[cfg(feature = "tracing")]
                tracing::debug!("session joined");
                slot.resolve(Ok(Arc::clone(session)));
                _ = tx.send(SessionEvent::Joined);
            }
        });

        let (slot, tx) = (Arc::clone(pending), events.clone());
        listeners.on(LifecycleKind::Leave, move |_| {
            #[cfg(feature = "tracing")]
            tracing::debug!("session left");
            slot.reset();
            _ = tx.send(SessionEvent::Left);
        });

        let (slot, tx) = (Arc::clone(pending), events.clone());
        listeners.on(LifecycleKind::Disconnect, move |event| {
            let was_clean = matches!(event, Lifecycle::Disconnect { was_clean: true });
            #[cfg(feature = "tracing")]
            tracing::debug!(was_clean, "transport disconnected");
            slot.reset();
            _ = tx.send(SessionEvent::Disconnected { was_clean });
        });
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    #[must_use]
    pub fn component(&self) -> &C {
        &self.component
    }

    /// Subscribe to session changes.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Whether a joined session is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.current_session().is_some()
    }

    /// The joined session if it is connected, without opening.
    #[must_use]
    pub fn current_session(&self) -> Option<SessionHandle> {
        self.component
            .session()
            .filter(|session| session.is_connected())
    }

    /// Start the component and wait until a session joined.
    ///
    /// On failure the connection is closed before the error is returned. If
    /// another open is in flight this waits for its outcome instead. Opening a
    /// connected manager returns right away.
    pub async fn open(&self) -> Result<()> {
        if self.current_session().is_some() {
            return Ok(());
        }

        let waiter = self.pending.waiter();
        if self.opening.swap(true, Ordering::AcqRel) {
            return waiter.wait().await.map(drop);
        }
        let _opening = OpeningGuard(&self.opening);

        #[cfg(feature = "tracing")]
        tracing::debug!(config = %self.config, "opening connection");

        let stopped = self.start();

        let outcome = tokio::select! {
            biased;

            joined = waiter.wait() => joined.map(drop),
            stopped = stopped => {
                let e = match stopped {
                    Ok(()) => Arc::new(Error::connect("component stopped before a session joined")),
                    Err(e) => e,
                };
                self.pending.resolve(Err(Arc::clone(&e)));
                Err(Error::shared(e))
            }
        };

        if let Err(e) = &outcome {
            #[cfg(feature = "tracing")]
            tracing::debug!(error = %e, "open failed, closing");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;

            if let Err(close_err) = self.close().await {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %close_err, "closing after failed open failed");
                #[cfg(not(feature = "tracing"))]
                let _ = &close_err;
            }
        }

        outcome
    }

    /// The joined session, opening the connection if there is none.
    pub async fn session(&self) -> Result<SessionHandle> {
        if let Some(session) = self.current_session() {
            return Ok(session);
        }

        self.open().await?;

        self.current_session()
            .ok_or_else(|| Error::connect("session closed right after joining"))
    }

    /// Leave the session and wait for the component to stop.
    ///
    /// Does nothing if there is no connected session.
    pub async fn close(&self) -> Result<()> {
        let Some(session) = self.current_session() else {
            #[cfg(feature = "tracing")]
            tracing::debug!("already closed");
            return Ok(());
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(config = %self.config, "closing connection");

        session.leave().await?;
        self.stopped().await;

        Ok(())
    }

    /// Wait for the current run of the component to end.
    pub async fn stopped(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if let Some(running) = running
            && let Err(e) = running.await
        {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "component stopped with an error");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    fn start(&self) -> Running {
        let running = self
            .component
            .start()
            .map(|stopped| stopped.map_err(Arc::new))
            .boxed()
            .shared();

        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(running.clone());

        running
    }
}

/// Clears the opening flag when an open ends, also if it was cancelled.
struct OpeningGuard<'a>(&'a AtomicBool);

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
