#![expect(
    clippy::module_name_repetitions,
    reason = "Session types include the transport in the name"
)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt as _;
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;

use super::error::WsError;
use super::message::{CLOSE_REALM, WampMessage};
use crate::Result;
use crate::args::Uri;
use crate::error::Error;
use crate::session::{
    Acknowledgement, CallResult, Event, EventCallback, Session, Subscription,
};

/// Frames handed to the connection's write half.
#[derive(Debug)]
pub(crate) enum Outgoing {
    Message(WampMessage),
    /// End the connection without waiting for the router
    Close,
}

/// What the connection should do after a message was dispatched.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Control {
    Continue,
    /// The router said GOODBYE, either as reply or on its own
    Goodbye { requested: bool },
    /// The router aborted the joined session
    Abort(String),
}

enum Reply {
    Result(CallResult),
    Published,
    Subscribed(u64),
    Unsubscribed,
    Error {
        error: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
}

struct Handler {
    id: u64,
    callback: EventCallback,
}

struct Shared {
    id: u64,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    next_request: AtomicU64,
    requests: DashMap<u64, oneshot::Sender<Reply>>,
    /// Router subscription id to local handlers; the router hands out the same
    /// id when a topic is subscribed twice
    handlers: DashMap<u64, Vec<Handler>>,
    connected: AtomicBool,
    leaving: AtomicBool,
    closed: watch::Sender<bool>,
    goodbye_timeout: Duration,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, message: WampMessage) -> Result<()> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(WsError::ConnectionClosed.into());
        }

        self.outgoing
            .send(Outgoing::Message(message))
            .map_err(|_closed| WsError::ConnectionClosed)?;
        Ok(())
    }

    /// Send a request and wait for the router's reply to it.
    async fn request(&self, request: u64, message: WampMessage) -> Result<Reply> {
        let rx = self.register(request);
        if let Err(e) = self.send(message) {
            self.requests.remove(&request);
            return Err(e);
        }

        rx.await.map_err(|_closed| WsError::ConnectionClosed.into())
    }

    fn register(&self, request: u64) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.requests.insert(request, tx);
        rx
    }

    fn resolve(&self, request: u64, reply: Reply) {
        match self.requests.remove(&request) {
            // The requester may have stopped waiting.
            Some((_, tx)) => {
                _ = tx.send(reply);
            }
            None => {
                #[cfg(feature = "tracing")]
                tracing::debug!(request, "reply to unknown request");
            }
        }
    }
}

/// A session joined over a WebSocket.
pub struct WsSession {
    shared: Arc<Shared>,
}

impl WsSession {
    pub(crate) fn new(
        id: u64,
        outgoing: mpsc::UnboundedSender<Outgoing>,
        goodbye_timeout: Duration,
    ) -> Self {
        let (closed, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                id,
                outgoing,
                next_request: AtomicU64::new(1),
                requests: DashMap::new(),
                handlers: DashMap::new(),
                connected: AtomicBool::new(true),
                leaving: AtomicBool::new(false),
                closed,
                goodbye_timeout,
            }),
        }
    }

    /// Session id assigned by the router.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Route a message received from the router.
    pub(crate) fn dispatch(&self, message: WampMessage) -> Control {
        let shared = &self.shared;

        match message {
            WampMessage::Result {
                request,
                args,
                kwargs,
                ..
            } => shared.resolve(request, Reply::Result(CallResult::new(args, kwargs))),
            WampMessage::Published { request, .. } => shared.resolve(request, Reply::Published),
            WampMessage::Subscribed {
                request,
                subscription,
            } => shared.resolve(request, Reply::Subscribed(subscription)),
            WampMessage::Unsubscribed { request } => shared.resolve(request, Reply::Unsubscribed),
            WampMessage::Error {
                request,
                error,
                args,
                kwargs,
                ..
            } => shared.resolve(request, Reply::Error { error, args, kwargs }),
            WampMessage::Event {
                subscription,
                details,
                args,
                kwargs,
                ..
            } => {
                let callbacks: Vec<EventCallback> = shared
                    .handlers
                    .get(&subscription)
                    .map(|handlers| {
                        handlers
                            .iter()
                            .map(|handler| Arc::clone(&handler.callback))
                            .collect()
                    })
                    .unwrap_or_default();

                let mut event = Event::new(args, kwargs);
                if let Some(Value::String(topic)) = details.get("topic") {
                    event = event.with_topic(topic.clone());
                }

                for callback in callbacks {
                    callback(event.clone());
                }
            }
            WampMessage::Goodbye { .. } => {
                return Control::Goodbye {
                    requested: shared.leaving.load(Ordering::Acquire),
                };
            }
            WampMessage::Abort { reason, .. } => return Control::Abort(reason),
            other => {
                #[cfg(feature = "tracing")]
                tracing::warn!(message = ?other, "unexpected message from router");
                #[cfg(not(feature = "tracing"))]
                let _ = &other;
            }
        }

        Control::Continue
    }

    /// Mark the session as gone and fail everything still waiting on it.
    pub(crate) fn close(&self) {
        self.shared.connected.store(false, Ordering::Release);
        self.shared.requests.clear();
        self.shared.handlers.clear();
        self.shared.closed.send_replace(true);
    }
}

#[async_trait]
impl Session for WsSession {
    async fn call(
        &self,
        procedure: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<CallResult> {
        let request = self.shared.next_id();
        let message = WampMessage::Call {
            request,
            options: Map::new(),
            procedure: procedure.to_owned(),
            args,
            kwargs,
        };

        match self.shared.request(request, message).await? {
            Reply::Result(result) => Ok(result),
            Reply::Error {
                error,
                args,
                kwargs,
            } => Err(Error::application(error, args, kwargs)),
            _ => Err(WsError::InvalidMessage(format!("unexpected reply to call {request}")).into()),
        }
    }

    fn publish(
        &self,
        topic: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        acknowledge: bool,
    ) -> Result<Option<Acknowledgement>> {
        let request = self.shared.next_id();
        let mut options = Map::new();
        if acknowledge {
            options.insert("acknowledge".to_owned(), json!(true));
        }
        let message = WampMessage::Publish {
            request,
            options,
            topic: topic.to_owned(),
            args,
            kwargs,
        };

        if !acknowledge {
            self.shared.send(message)?;
            return Ok(None);
        }

        let shared = Arc::clone(&self.shared);
        let acknowledgement = async move {
            match shared.request(request, message).await? {
                Reply::Published => Ok(()),
                Reply::Error {
                    error,
                    args,
                    kwargs,
                } => Err(Error::application(error, args, kwargs)),
                _ => Err(
                    WsError::InvalidMessage(format!("unexpected reply to publish {request}"))
                        .into(),
                ),
            }
        };

        Ok(Some(acknowledgement.boxed()))
    }

    async fn subscribe(
        &self,
        topic: &Uri,
        callback: EventCallback,
    ) -> Result<Box<dyn Subscription>> {
        let request = self.shared.next_id();
        let mut options = Map::new();
        if let Some(policy) = topic.policy {
            options.insert("match".to_owned(), json!(policy.to_string()));
        }
        let message = WampMessage::Subscribe {
            request,
            options,
            topic: topic.uri.clone(),
        };

        let subscription = match self.shared.request(request, message).await? {
            Reply::Subscribed(subscription) => subscription,
            Reply::Error {
                error,
                args,
                kwargs,
            } => return Err(Error::application(error, args, kwargs)),
            _ => {
                return Err(WsError::InvalidMessage(format!(
                    "unexpected reply to subscribe {request}"
                ))
                .into());
            }
        };

        let handler = self.shared.next_id();
        self.shared
            .handlers
            .entry(subscription)
            .or_default()
            .push(Handler {
                id: handler,
                callback,
            });

        Ok(Box::new(WsSubscription {
            shared: Arc::clone(&self.shared),
            subscription,
            handler,
            active: AtomicBool::new(true),
        }))
    }

    async fn leave(&self) -> Result<()> {
        let shared = &self.shared;
        if !shared.connected.load(Ordering::Acquire) || shared.leaving.swap(true, Ordering::AcqRel)
        {
            return Ok(());
        }

        let mut closed = shared.closed.subscribe();
        shared.send(WampMessage::Goodbye {
            details: Map::new(),
            reason: CLOSE_REALM.to_owned(),
        })?;

        if timeout(shared.goodbye_timeout, closed.wait_for(|closed| *closed))
            .await
            .is_err()
        {
            #[cfg(feature = "tracing")]
            tracing::warn!("router did not answer GOODBYE, closing");
            // The connection may already be gone.
            _ = shared.outgoing.send(Outgoing::Close);
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}

/// Subscription made through a [`WsSession`].
pub struct WsSubscription {
    shared: Arc<Shared>,
    subscription: u64,
    handler: u64,
    active: AtomicBool,
}

#[async_trait]
impl Subscription for WsSubscription {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.shared.connected.load(Ordering::Acquire)
    }

    async fn unsubscribe(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let last = match self.shared.handlers.get_mut(&self.subscription) {
            Some(mut handlers) => {
                handlers.retain(|handler| handler.id != self.handler);
                handlers.is_empty()
            }
            None => false,
        };
        if !last {
            return Ok(());
        }
        self.shared
            .handlers
            .remove_if(&self.subscription, |_, handlers| handlers.is_empty());

        let request = self.shared.next_id();
        let message = WampMessage::Unsubscribe {
            request,
            subscription: self.subscription,
        };

        match self.shared.request(request, message).await? {
            Reply::Unsubscribed => Ok(()),
            Reply::Error {
                error,
                args,
                kwargs,
            } => Err(Error::application(error, args, kwargs)),
            _ => Err(
                WsError::InvalidMessage(format!("unexpected reply to unsubscribe {request}"))
                    .into(),
            ),
        }
    }
}
