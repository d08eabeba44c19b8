//! Background worker that owns the connection.
//!
//! A front-end that blocks on user input can't drive an async session itself.
//! It hands [`Task`]s to a [`TaskQueue`] instead; the worker thread runs its own
//! single-threaded runtime, dequeues tasks in order and runs each one
//! concurrently with the tasks already in flight. Outcomes come back through a
//! [`Reporter`].

use std::fmt;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use bon::Builder;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::Result;
use crate::args::{Uri, parse_uri};
use crate::connection::ConnectionManager;
use crate::error::{Error, MissingUri, UriType};
use crate::format::human_result;
use crate::session::{CallResult, Component};
use crate::subscription::{SubscriptionEvent, SubscriptionTracker};

/// What a [`Task`] does.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Call,
    Publish,
    Subscribe,
    Unsubscribe,
    /// Action name the worker doesn't know
    Unknown(String),
}

impl Action {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Call => "call",
            Self::Publish => "publish",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Unknown(name) => name,
        }
    }
}

impl From<&str> for Action {
    fn from(name: &str) -> Self {
        match name {
            "call" => Self::Call,
            "publish" => Self::Publish,
            "subscribe" => Self::Subscribe,
            "unsubscribe" => Self::Unsubscribe,
            other => Self::Unknown(other.to_owned()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of work for the worker.
///
/// The first positional value is the URI the action applies to.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Builder)]
pub struct Task {
    #[builder(into)]
    pub action: Action,
    #[builder(default)]
    pub args: Vec<Value>,
    #[builder(default)]
    pub kwargs: Map<String, Value>,
}

impl Task {
    #[must_use]
    pub fn new(action: Action, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            action,
            args,
            kwargs,
        }
    }
}

/// Items travelling through the queue.
#[non_exhaustive]
#[derive(Debug)]
pub enum Message {
    Task(Task),
    /// Stop consuming, close the connection and cancel what's still running
    Stop,
}

/// Number of submitted tasks that didn't signal done yet.
#[derive(Debug, Default)]
struct Outstanding {
    #[expect(clippy::mutex_integer, reason = "The count is waited on through the Condvar")]
    count: Mutex<usize>,
    idle: Condvar,
}

impl Outstanding {
    fn lock(&self) -> MutexGuard<'_, usize> {
        // A counter can't be left half updated.
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self) {
        *self.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Signals done for one dequeued task when dropped, also when the task is cancelled.
#[must_use]
struct TaskDone(Arc<Outstanding>);

impl Drop for TaskDone {
    fn drop(&mut self) {
        self.0.done();
    }
}

/// Sending half of the worker's queue.
///
/// Cheap to clone, every clone feeds the same worker.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Message>,
    outstanding: Arc<Outstanding>,
}

/// Receiving half of the worker's queue.
#[derive(Debug)]
pub struct TaskReceiver {
    rx: mpsc::UnboundedReceiver<Message>,
    outstanding: Arc<Outstanding>,
}

enum Dequeued {
    Task(Task, TaskDone),
    Stop,
}

impl TaskQueue {
    #[must_use]
    pub fn new() -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let outstanding = Arc::new(Outstanding::default());

        (
            Self {
                tx,
                outstanding: Arc::clone(&outstanding),
            },
            TaskReceiver { rx, outstanding },
        )
    }

    /// Queue a task. Fails if the worker is gone.
    pub fn submit(&self, task: Task) -> Result<()> {
        self.outstanding.add();
        if self.tx.send(Message::Task(task)).is_err() {
            self.outstanding.done();
            return Err(Error::validation("worker is not running"));
        }

        Ok(())
    }

    /// Ask the worker to stop. Tasks queued before are still dequeued.
    pub fn stop(&self) -> Result<()> {
        self.tx
            .send(Message::Stop)
            .map_err(|_closed| Error::validation("worker is not running"))
    }

    /// Number of submitted tasks that didn't finish yet.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        *self.outstanding.lock()
    }

    /// Block until every submitted task signalled done.
    ///
    /// Returns `false` if `timeout` passed first.
    #[must_use]
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.outstanding.lock();

        while *count > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }

            count = self
                .outstanding
                .idle
                .wait_timeout(count, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        true
    }
}

impl TaskReceiver {
    async fn recv(&mut self) -> Option<Dequeued> {
        match self.rx.recv().await? {
            Message::Task(task) => Some(Dequeued::Task(
                task,
                TaskDone(Arc::clone(&self.outstanding)),
            )),
            Message::Stop => Some(Dequeued::Stop),
        }
    }

    /// Close the queue and signal done for everything still in it.
    fn drain(&mut self) {
        self.rx.close();
        while let Ok(message) = self.rx.try_recv() {
            if let Message::Task(_) = message {
                self.outstanding.done();
            }
        }
    }
}

/// Outcome of something the worker did.
#[non_exhaustive]
#[derive(Debug)]
pub enum Report {
    Connecting,
    Connected,
    ConnectFailed(Error),
    /// Values returned by a call
    Result(CallResult),
    Published,
    Subscribed(Uri),
    Unsubscribed(Uri),
    /// Event received on a subscription
    Event(SubscriptionEvent),
    /// A subscribe or unsubscribe task without a topic
    NoTopic(Action),
    Failed { action: Action, error: Error },
    UnknownAction(String),
    Stopping,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting..."),
            Self::Connected => f.write_str("connected"),
            Self::ConnectFailed(e) => write!(f, "unable to connect: {e}"),
            Self::Result(result) => f.write_str(&human_result(&result.args, &result.kwargs)),
            Self::Published => f.write_str("done"),
            Self::Subscribed(topic) => write!(f, "subscribed to {topic}"),
            Self::Unsubscribed(topic) => write!(f, "unsubscribed from {topic}"),
            Self::Event(event) => write!(f, "received event:\n{event}"),
            Self::NoTopic(_) => f.write_str("no topic provided"),
            Self::Failed { action, error } => write!(f, "{action} failed: {error}"),
            Self::UnknownAction(name) => write!(f, "unknown task given to worker: {name}"),
            Self::Stopping => f.write_str("stopping worker"),
        }
    }
}

/// Receives the worker's [`Report`]s.
pub trait Reporter: Send + Sync + 'static {
    fn report(&self, report: Report);
}

impl Reporter for std_mpsc::Sender<Report> {
    fn report(&self, report: Report) {
        // Nobody listening anymore is fine.
        _ = self.send(report);
    }
}

struct Worker<C: Component, R: Reporter> {
    connection: Arc<ConnectionManager<C>>,
    subscriptions: Arc<SubscriptionTracker<C>>,
    reporter: Arc<R>,
}

impl<C: Component, R: Reporter> Worker<C, R> {
    async fn run(self: Arc<Self>, mut receiver: TaskReceiver) {
        self.subscriptions.start_resubscription_handler();

        let mut tasks = JoinSet::new();

        let this = Arc::clone(&self);
        tasks.spawn(async move { this.connect().await });

        loop {
            tokio::select! {
                dequeued = receiver.recv() => match dequeued {
                    Some(Dequeued::Task(task, done)) => {
                        let this = Arc::clone(&self);
                        tasks.spawn(async move {
                            let _done = done;
                            this.handle(task).await;
                        });
                    }
                    Some(Dequeued::Stop) | None => break,
                },
                Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = finished
                        && e.is_panic()
                    {
                        #[cfg(feature = "tracing")]
                        tracing::error!(error = %e, "task panicked");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &e;
                    }
                }
            }
        }

        self.reporter.report(Report::Stopping);

        #[cfg(feature = "tracing")]
        tracing::debug!(in_flight = tasks.len(), "waiting for connection to close");

        if let Err(e) = self.connection.close().await {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "failed to close connection");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }

        tasks.shutdown().await;
        receiver.drain();
    }

    async fn connect(&self) {
        self.reporter.report(Report::Connecting);
        match self.connection.open().await {
            Ok(()) => self.reporter.report(Report::Connected),
            Err(e) => self.reporter.report(Report::ConnectFailed(e)),
        }
    }

    async fn handle(&self, task: Task) {
        let action = task.action.clone();

        if let Err(error) = self.execute(task).await {
            #[cfg(feature = "tracing")]
            tracing::warn!(%action, %error, "task failed");
            self.reporter.report(Report::Failed { action, error });
        }
    }

    async fn execute(&self, task: Task) -> Result<()> {
        let Task {
            action,
            mut args,
            kwargs,
        } = task;

        match action {
            Action::Call => {
                let procedure = take_uri(&mut args)?;
                let session = self.connection.session().await?;
                let result = session.call(&procedure, args, kwargs).await?;
                self.reporter.report(Report::Result(result));
            }
            Action::Publish => {
                let topic = take_uri(&mut args)?;
                let session = self.connection.session().await?;
                if let Some(acknowledgement) = session.publish(&topic, args, kwargs, true)? {
                    acknowledgement.await?;
                }
                self.reporter.report(Report::Published);
            }
            Action::Subscribe | Action::Unsubscribe => {
                let Some(topic) = args.first() else {
                    self.reporter.report(Report::NoTopic(action));
                    return Ok(());
                };
                let topic = match topic {
                    Value::String(pattern) => parse_uri(pattern)?,
                    other => {
                        return Err(UriType {
                            found: other.to_string(),
                        }
                        .into());
                    }
                };

                if action == Action::Subscribe {
                    self.connection.session().await?;
                    self.subscriptions.add(topic.clone()).await?;
                    self.reporter.report(Report::Subscribed(topic));
                } else {
                    self.subscriptions.remove(&topic).await?;
                    self.reporter.report(Report::Unsubscribed(topic));
                }
            }
            Action::Unknown(name) => self.reporter.report(Report::UnknownAction(name)),
        }

        Ok(())
    }
}

/// Split off the first positional value as a URI.
fn take_uri(args: &mut Vec<Value>) -> Result<String> {
    if args.is_empty() {
        return Err(MissingUri.into());
    }

    match args.remove(0) {
        Value::String(uri) => Ok(uri),
        other => Err(UriType {
            found: other.to_string(),
        }
        .into()),
    }
}

/// Handle of a running worker thread.
///
/// Dropping the handle asks the worker to stop without waiting for it.
pub struct WorkerHandle {
    queue: TaskQueue,
    exited: std_mpsc::Receiver<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Start a worker thread owning `connection`.
    ///
    /// Events of subscriptions made through the worker are reported as
    /// [`Report::Event`].
    pub fn spawn<C, R>(connection: ConnectionManager<C>, reporter: R) -> Result<Self>
    where
        C: Component,
        R: Reporter,
    {
        let (queue, receiver) = TaskQueue::new();
        let (exit_tx, exited) = std_mpsc::channel::<()>();

        let reporter = Arc::new(reporter);
        let connection = Arc::new(connection);
        let events = Arc::clone(&reporter);
        let subscriptions = Arc::new(SubscriptionTracker::new(
            Arc::clone(&connection),
            move |event| events.report(Report::Event(event)),
        ));

        let worker = Arc::new(Worker {
            connection,
            subscriptions,
            reporter,
        });

        let thread = thread::Builder::new()
            .name("wampli-worker".to_owned())
            .spawn(move || {
                // Dropped when the thread ends, however it ends.
                let _exit = exit_tx;

                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        worker.reporter.report(Report::ConnectFailed(e.into()));
                        return;
                    }
                };

                runtime.block_on(Arc::clone(&worker).run(receiver));
            })?;

        Ok(Self {
            queue,
            exited,
            thread: Some(thread),
        })
    }

    #[must_use]
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn submit(&self, task: Task) -> Result<()> {
        self.queue.submit(task)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Stop the worker and wait up to `timeout` for its thread to exit.
    ///
    /// Returns `false` if the thread was still running after `timeout`; it is
    /// left detached.
    pub fn stop(mut self, timeout: Duration) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };

        if self.queue.stop().is_err() {
            #[cfg(feature = "tracing")]
            tracing::debug!("worker already gone");
        }

        match self.exited.recv_timeout(timeout) {
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(?timeout, "worker did not stop in time, detaching");
                false
            }
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                if thread.join().is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::error!("worker thread panicked");
                }
                true
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            _ = self.queue.stop();
        }
    }
}
