#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use wampli::args::Uri;
use wampli::config::{ConnectionConfig, Transport, TransportKind};
use wampli::error::Error;
use wampli::session::{
    Acknowledgement, CallResult, Component, Event, EventCallback, FatalCheck, Lifecycle,
    Listeners, Session, SessionHandle, Stopped, Subscription,
};

/// Procedure that never returns.
pub const HANG: &str = "test.hang";

/// Procedure that fails with an application error.
pub const FAIL: &str = "test.fail";

/// How the mock router answers a connection attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Behavior {
    /// Join a session
    #[default]
    Join,
    /// Stop the component with a lost transport before joining
    FailFatal,
    /// Report a failed attempt and keep running without joining
    FailRetryable,
}

/// What the mock router saw.
#[derive(Debug, Default)]
pub struct MockRouter {
    behavior: Mutex<Behavior>,
    starts: AtomicUsize,
    leaves: AtomicUsize,
    unsubscribes: AtomicUsize,
    calls: Mutex<Vec<String>>,
    published: Mutex<Vec<String>>,
    subscribed: Mutex<Vec<String>>,
    handlers: Mutex<Vec<Handler>>,
}

struct Handler {
    topic: String,
    callback: EventCallback,
    active: Arc<AtomicBool>,
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler").field("topic", &self.topic).finish()
    }
}

impl MockRouter {
    pub fn with_behavior(behavior: Behavior) -> Arc<Self> {
        let router = Arc::new(Self::default());
        router.set_behavior(behavior);
        router
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn leaves(&self) -> usize {
        self.leaves.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<String> {
        self.published.lock().unwrap().clone()
    }

    /// How often `topic` was subscribed to, active or not.
    pub fn subscriptions(&self, topic: &str) -> usize {
        self.subscribed
            .lock()
            .unwrap()
            .iter()
            .filter(|subscribed| *subscribed == topic)
            .count()
    }

    /// Deliver an event to every active subscription on `topic`.
    pub fn emit(&self, topic: &str, args: Vec<Value>) {
        let callbacks: Vec<EventCallback> = self
            .handlers
            .lock()
            .unwrap()
            .iter()
            .filter(|handler| handler.topic == topic && handler.active.load(Ordering::SeqCst))
            .map(|handler| Arc::clone(&handler.callback))
            .collect();

        for callback in callbacks {
            callback(Event::new(args.clone(), Map::new()).with_topic(topic));
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    pub router: Arc<MockRouter>,
}

impl MockOptions {
    pub fn new(router: &Arc<MockRouter>) -> Self {
        Self {
            router: Arc::clone(router),
        }
    }
}

type Run = Shared<BoxFuture<'static, Result<(), Arc<Error>>>>;

/// Component connecting to a [`MockRouter`] without any transport.
pub struct MockComponent {
    inner: Arc<Inner>,
}

struct Inner {
    router: Arc<MockRouter>,
    listeners: Listeners,
    session: Mutex<Option<Arc<MockSession>>>,
    run: Mutex<Option<Run>>,
    stop: Mutex<Option<oneshot::Sender<wampli::Result<()>>>>,
}

impl Inner {
    fn finish(&self, result: wampli::Result<()>) {
        if let Some(stop) = self.stop.lock().unwrap().take() {
            _ = stop.send(result);
        }
    }

    fn end_session(&self, was_clean: bool) {
        let Some(session) = self.session.lock().unwrap().take() else {
            return;
        };
        session.connected.store(false, Ordering::SeqCst);

        self.listeners.emit(&Lifecycle::Leave);
        self.listeners.emit(&Lifecycle::Disconnect { was_clean });
    }
}

impl MockComponent {
    pub fn router(&self) -> &Arc<MockRouter> {
        &self.inner.router
    }

    /// Lose the transport of the joined session, stopping the component.
    pub fn drop_transport(&self) {
        self.inner.end_session(false);
        self.inner.finish(Err(Error::transport_lost("mock transport dropped")));
    }
}

impl Component for MockComponent {
    type Options = MockOptions;

    fn create(_config: &ConnectionConfig, options: MockOptions, _is_fatal: FatalCheck) -> wampli::Result<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                router: options.router,
                listeners: Listeners::default(),
                session: Mutex::new(None),
                run: Mutex::new(None),
                stop: Mutex::new(None),
            }),
        })
    }

    fn start(&self) -> Stopped {
        let mut run = self.inner.run.lock().unwrap();
        let mut stop = self.inner.stop.lock().unwrap();

        if let (Some(current), Some(_)) = (run.as_ref(), stop.as_ref()) {
            return current.clone().map(|r| r.map_err(Error::shared)).boxed();
        }

        self.inner.router.starts.fetch_add(1, Ordering::SeqCst);

        let (stop_tx, stop_rx) = oneshot::channel();
        *stop = Some(stop_tx);
        drop(stop);

        let current: Run = async move {
            stop_rx
                .await
                .unwrap_or(Ok(()))
                .map_err(Arc::new)
        }
        .boxed()
        .shared();
        *run = Some(current.clone());
        drop(run);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let behavior = *inner.router.behavior.lock().unwrap();
            match behavior {
                Behavior::Join => {
                    inner.listeners.emit(&Lifecycle::Connect);
                    let session = Arc::new(MockSession {
                        component: Arc::downgrade(&inner),
                        router: Arc::clone(&inner.router),
                        connected: AtomicBool::new(true),
                    });
                    *inner.session.lock().unwrap() = Some(Arc::clone(&session));
                    inner.listeners.emit(&Lifecycle::Join(session as SessionHandle));
                }
                Behavior::FailFatal => {
                    inner.finish(Err(Error::transport_lost("mock router went away")));
                }
                Behavior::FailRetryable => {
                    let e = Arc::new(Error::connect("mock router refused the connection"));
                    inner.listeners.emit(&Lifecycle::ConnectFailure(e));
                }
            }
        });

        current.map(|r| r.map_err(Error::shared)).boxed()
    }

    fn session(&self) -> Option<SessionHandle> {
        self.inner
            .session
            .lock()
            .unwrap()
            .clone()
            .map(|session| session as SessionHandle)
    }

    fn listeners(&self) -> &Listeners {
        &self.inner.listeners
    }
}

pub struct MockSession {
    component: Weak<Inner>,
    router: Arc<MockRouter>,
    connected: AtomicBool,
}

#[async_trait]
impl Session for MockSession {
    async fn call(
        &self,
        procedure: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> wampli::Result<CallResult> {
        self.router.calls.lock().unwrap().push(procedure.to_owned());

        match procedure {
            HANG => futures::future::pending().await,
            FAIL => Err(Error::application("com.example.error.failed", args, kwargs)),
            _ => Ok(CallResult::new(args, kwargs)),
        }
    }

    fn publish(
        &self,
        topic: &str,
        _args: Vec<Value>,
        _kwargs: Map<String, Value>,
        acknowledge: bool,
    ) -> wampli::Result<Option<Acknowledgement>> {
        self.router.published.lock().unwrap().push(topic.to_owned());

        Ok(acknowledge.then(|| async { Ok(()) }.boxed()))
    }

    async fn subscribe(
        &self,
        topic: &Uri,
        callback: EventCallback,
    ) -> wampli::Result<Box<dyn Subscription>> {
        let active = Arc::new(AtomicBool::new(true));

        self.router.subscribed.lock().unwrap().push(topic.uri.clone());
        self.router.handlers.lock().unwrap().push(Handler {
            topic: topic.uri.clone(),
            callback,
            active: Arc::clone(&active),
        });

        Ok(Box::new(MockSubscription {
            router: Arc::clone(&self.router),
            active,
        }))
    }

    async fn leave(&self) -> wampli::Result<()> {
        self.router.leaves.fetch_add(1, Ordering::SeqCst);

        if let Some(component) = self.component.upgrade() {
            component.end_session(true);
            component.finish(Ok(()));
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct MockSubscription {
    router: Arc<MockRouter>,
    active: Arc<AtomicBool>,
}

#[async_trait]
impl Subscription for MockSubscription {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn unsubscribe(&self) -> wampli::Result<()> {
        if self.active.swap(false, Ordering::SeqCst) {
            self.router.unsubscribes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub fn config() -> ConnectionConfig {
    ConnectionConfig::new(
        "test",
        vec![Transport::new(TransportKind::WebSocket, "ws://x")],
    )
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}
