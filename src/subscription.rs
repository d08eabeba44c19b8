#![expect(
    clippy::module_name_repetitions,
    reason = "Subscription types deliberately include the module name for clarity"
)]

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::{DashMap, Entry};
use futures::future::join_all;
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;

use crate::Result;
use crate::args::Uri;
use crate::connection::{ConnectionManager, SessionEvent};
use crate::format::{format_args, format_kwargs};
use crate::session::{Component, Event, EventCallback, SessionHandle, Subscription};

/// An event received on one of the tracked subscriptions.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEvent {
    /// Topic the event was published to
    pub topic: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl fmt::Display for SubscriptionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.topic)?;
        if !self.args.is_empty() {
            write!(f, " ({})", format_args(&self.args))?;
        }
        if !self.kwargs.is_empty() {
            write!(f, "\n{}", format_kwargs(&self.kwargs))?;
        }
        Ok(())
    }
}

pub type EventHandler = Arc<dyn Fn(SubscriptionEvent) + Send + Sync>;

/// Keeps the subscriptions on the router in line with the planned topics.
///
/// Planned topics outlive sessions; the active subscriptions are rebuilt from
/// them every time a session joins.
pub struct SubscriptionTracker<C: Component> {
    connection: Arc<ConnectionManager<C>>,
    planned: Mutex<HashSet<Uri>>,
    active: DashMap<Uri, Box<dyn Subscription>>,
    handler: EventHandler,
}

impl<C: Component> SubscriptionTracker<C> {
    /// Create a tracker forwarding every event to `handler`.
    pub fn new<F>(connection: Arc<ConnectionManager<C>>, handler: F) -> Self
    where
        F: Fn(SubscriptionEvent) + Send + Sync + 'static,
    {
        Self {
            connection,
            planned: Mutex::new(HashSet::new()),
            active: DashMap::new(),
            handler: Arc::new(handler),
        }
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<ConnectionManager<C>> {
        &self.connection
    }

    /// Start the handler that re-subscribes whenever a session joins.
    pub fn start_resubscription_handler(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut events = this.connection.events();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Joined) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("session joined, re-establishing subscriptions");
                        this.resubscribe_all().await;
                    }
                    Ok(SessionEvent::Left | SessionEvent::Disconnected { .. }) => {
                        this.active.clear();
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(count)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(count, "missed session events");
                        #[cfg(not(feature = "tracing"))]
                        let _ = count;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    /// Subscribe to every planned topic that has no active subscription yet.
    ///
    /// Topics added after the join but before this runs are already active and
    /// are left alone.
    async fn resubscribe_all(&self) {
        self.active.retain(|_, subscription| subscription.is_active());

        let topics: Vec<Uri> = self
            .planned()
            .into_iter()
            .filter(|topic| !self.active.contains_key(topic))
            .collect();
        if topics.is_empty() {
            return;
        }

        let Some(session) = self.connection.current_session() else {
            return;
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(count = topics.len(), "re-subscribing to planned topics");

        let results = join_all(
            topics
                .into_iter()
                .map(|topic| self.subscribe_on(&session, topic)),
        )
        .await;

        for result in results {
            if let Err(e) = result {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "failed to re-subscribe");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }
    }

    /// Plan a topic without subscribing. Returns whether it was newly planned.
    pub fn plan(&self, topic: Uri) -> bool {
        self.lock_planned().insert(topic)
    }

    /// Stop planning a topic. Returns whether it was planned.
    pub fn unplan(&self, topic: &Uri) -> bool {
        self.lock_planned().remove(topic)
    }

    #[must_use]
    pub fn is_planned(&self, topic: &Uri) -> bool {
        self.lock_planned().contains(topic)
    }

    #[must_use]
    pub fn planned(&self) -> Vec<Uri> {
        self.lock_planned().iter().cloned().collect()
    }

    /// Whether `topic` has a subscription on the current session.
    #[must_use]
    pub fn is_active(&self, topic: &Uri) -> bool {
        self.active
            .get(topic)
            .is_some_and(|subscription| subscription.is_active())
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Plan `topic` and subscribe right away if a session is connected.
    ///
    /// Without a session the subscription is made on the next join.
    pub async fn add(&self, topic: Uri) -> Result<()> {
        self.plan(topic.clone());

        if self.active.contains_key(&topic) {
            return Ok(());
        }

        let Some(session) = self.connection.current_session() else {
            #[cfg(feature = "tracing")]
            tracing::debug!(%topic, "not connected, subscribing on next join");
            return Ok(());
        };

        self.subscribe_on(&session, topic).await
    }

    /// Stop planning `topic` and unsubscribe it if it is active.
    pub async fn remove(&self, topic: &Uri) -> Result<()> {
        self.unplan(topic);

        let Some((_, subscription)) = self.active.remove(topic) else {
            return Ok(());
        };

        if subscription.is_active() {
            subscription.unsubscribe().await?;
        }

        Ok(())
    }

    async fn subscribe_on(&self, session: &SessionHandle, topic: Uri) -> Result<()> {
        let subscription = session.subscribe(&topic, self.callback(&topic)).await?;

        let extra = {
            // Checked under the planned lock so a concurrent remove either sees the
            // entry or makes this one go away.
            let planned = self.lock_planned();
            if planned.contains(&topic) {
                match self.active.entry(topic) {
                    Entry::Occupied(_) => Some(subscription),
                    Entry::Vacant(slot) => {
                        slot.insert(subscription);
                        None
                    }
                }
            } else {
                Some(subscription)
            }
        };

        if let Some(extra) = extra {
            extra.unsubscribe().await?;
        }

        Ok(())
    }

    fn callback(&self, topic: &Uri) -> EventCallback {
        let handler = Arc::clone(&self.handler);
        let subscribed = topic.to_string();

        Arc::new(move |event: Event| {
            handler(SubscriptionEvent {
                topic: event.topic.unwrap_or_else(|| subscribed.clone()),
                args: event.args,
                kwargs: event.kwargs,
            });
        })
    }

    fn lock_planned(&self) -> MutexGuard<'_, HashSet<Uri>> {
        // A set of topics has no intermediate state to recover from.
        self.planned.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
