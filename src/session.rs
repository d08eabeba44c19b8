//! Seams to the protocol implementation.
//!
//! The core only talks to a router through these traits: a [`Component`]
//! owns the transport and announces lifecycle changes through its
//! [`Listeners`] table, and a joined [`Session`] issues calls, publishes and
//! subscriptions. [`crate::ws`] provides the WebSocket implementation.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::Result;
use crate::args::Uri;
use crate::config::ConnectionConfig;
use crate::error::Error;

/// Shared reference to a joined session.
///
/// Only valid while the session is connected, check [`Session::is_connected`].
pub type SessionHandle = Arc<dyn Session>;

/// Callback invoked for every event received on a subscription.
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

/// Resolves once the router acknowledged a publication.
pub type Acknowledgement = BoxFuture<'static, Result<()>>;

/// Resolves once a component stopped, with the error that stopped it.
pub type Stopped = BoxFuture<'static, Result<()>>;

/// Decides whether a connection failure must stop the component instead of being retried.
pub type FatalCheck = fn(&Error) -> bool;

/// Values returned by a procedure.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallResult {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl CallResult {
    #[must_use]
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }
}

/// Payload of a received event.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    /// Concrete topic, reported by the router for pattern subscriptions
    pub topic: Option<String>,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl Event {
    #[must_use]
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            topic: None,
            args,
            kwargs,
        }
    }

    #[must_use]
    pub fn with_topic<S: Into<String>>(mut self, topic: S) -> Self {
        self.topic = Some(topic.into());
        self
    }
}

/// A joined session on a realm.
#[async_trait]
pub trait Session: Send + Sync {
    /// Call a procedure.
    ///
    /// Errors reported by the router have [`Kind::Application`](crate::error::Kind::Application).
    async fn call(
        &self,
        procedure: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<CallResult>;

    /// Publish an event.
    ///
    /// With `acknowledge` the router confirms the publication and the returned
    /// [`Acknowledgement`] resolves once it did; otherwise this is fire-and-forget
    /// and `None` is returned.
    fn publish(
        &self,
        topic: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        acknowledge: bool,
    ) -> Result<Option<Acknowledgement>>;

    /// Subscribe to a topic, invoking `callback` for every event.
    async fn subscribe(&self, topic: &Uri, callback: EventCallback)
    -> Result<Box<dyn Subscription>>;

    /// Leave the realm. The component stops once the router confirmed.
    async fn leave(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Handle of an active subscription.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Whether events are still delivered.
    fn is_active(&self) -> bool;

    async fn unsubscribe(&self) -> Result<()>;
}

/// Lifecycle signals announced by a [`Component`].
#[non_exhaustive]
#[derive(Clone)]
pub enum Lifecycle {
    /// The transport is connected, the session is not joined yet
    Connect,
    /// A connection attempt failed
    ConnectFailure(Arc<Error>),
    /// A session joined the realm
    Join(SessionHandle),
    /// The session left the realm
    Leave,
    /// The transport went away
    Disconnect { was_clean: bool },
}

impl Lifecycle {
    #[must_use]
    pub const fn kind(&self) -> LifecycleKind {
        match self {
            Self::Connect => LifecycleKind::Connect,
            Self::ConnectFailure(_) => LifecycleKind::ConnectFailure,
            Self::Join(_) => LifecycleKind::Join,
            Self::Leave => LifecycleKind::Leave,
            Self::Disconnect { .. } => LifecycleKind::Disconnect,
        }
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailure(e) => f.debug_tuple("ConnectFailure").field(e).finish(),
            Self::Disconnect { was_clean } => f
                .debug_struct("Disconnect")
                .field("was_clean", was_clean)
                .finish(),
            other => write!(f, "{:?}", other.kind()),
        }
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleKind {
    Connect,
    ConnectFailure,
    Join,
    Leave,
    Disconnect,
}

pub type Listener = Arc<dyn Fn(&Lifecycle) + Send + Sync>;

/// Listener registration table keyed by lifecycle event.
#[derive(Default)]
pub struct Listeners {
    table: RwLock<HashMap<LifecycleKind, Vec<Listener>>>,
}

impl Listeners {
    /// Register `listener` for every event of `kind`.
    pub fn on<F>(&self, kind: LifecycleKind, listener: F)
    where
        F: Fn(&Lifecycle) + Send + Sync + 'static,
    {
        // The table holds no invariants a panicking listener could break.
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
    }

    /// Invoke the listeners registered for `event`, in registration order.
    pub fn emit(&self, event: &Lifecycle) {
        let listeners = self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        for listener in listeners {
            listener(event);
        }
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_map()
            .entries(table.iter().map(|(kind, listeners)| (kind, listeners.len())))
            .finish()
    }
}

/// Owner of a transport that produces sessions.
pub trait Component: Send + Sync + Sized + 'static {
    /// Transport specific settings.
    type Options: Clone + Default + Send + Sync + 'static;

    /// Create a stopped component.
    ///
    /// Failures for which `is_fatal` returns `true` stop the component instead
    /// of being retried.
    fn create(config: &ConnectionConfig, options: Self::Options, is_fatal: FatalCheck)
    -> Result<Self>;

    /// Start connecting.
    ///
    /// The returned future resolves when the component stopped again; calling
    /// `start` on a running component returns a future for the current run.
    fn start(&self) -> Stopped;

    /// The joined session, if any.
    fn session(&self) -> Option<SessionHandle>;

    fn listeners(&self) -> &Listeners;
}
