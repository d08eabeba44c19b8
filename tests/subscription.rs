#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::sync::{Arc, Mutex};

use serde_json::json;
use wampli::args::{Uri, parse_uri};
use wampli::subscription::SubscriptionEvent;
use wampli::{ConnectionManager, SubscriptionTracker};

use crate::common::{Behavior, MockComponent, MockOptions, MockRouter, config, eventually};

type Tracker = SubscriptionTracker<MockComponent>;

fn tracker(router: &Arc<MockRouter>) -> Arc<Tracker> {
    let manager = ConnectionManager::<MockComponent>::new(config(), MockOptions::new(router)).unwrap();
    let tracker = Arc::new(SubscriptionTracker::new(Arc::new(manager), |_event| {}));
    tracker.start_resubscription_handler();
    tracker
}

#[tokio::test]
async fn add_twice_subscribes_once() {
    let router = MockRouter::with_behavior(Behavior::Join);
    let tracker = tracker(&router);
    tracker.connection().open().await.unwrap();

    let topic = Uri::exact("com.example.news");
    tracker.add(topic.clone()).await.unwrap();
    tracker.add(topic.clone()).await.unwrap();

    assert_eq!(tracker.active_count(), 1);
    assert!(tracker.is_active(&topic), "subscribed while connected");
    assert_eq!(router.subscriptions("com.example.news"), 1);
}

#[tokio::test]
async fn remove_unknown_topic_is_noop() {
    let router = MockRouter::with_behavior(Behavior::Join);
    let tracker = tracker(&router);
    tracker.connection().open().await.unwrap();

    tracker.remove(&Uri::exact("com.example.never")).await.unwrap();

    assert_eq!(tracker.active_count(), 0);
    assert_eq!(router.unsubscribes(), 0);
}

#[tokio::test]
async fn remove_unsubscribes() {
    let router = MockRouter::with_behavior(Behavior::Join);
    let tracker = tracker(&router);
    tracker.connection().open().await.unwrap();

    let topic = Uri::exact("com.example.news");
    tracker.add(topic.clone()).await.unwrap();
    tracker.remove(&topic).await.unwrap();

    assert!(!tracker.is_planned(&topic), "no longer planned");
    assert!(!tracker.is_active(&topic), "no longer active");
    assert_eq!(router.unsubscribes(), 1);
}

#[tokio::test]
async fn add_without_session_subscribes_on_join() {
    let router = MockRouter::with_behavior(Behavior::Join);
    let tracker = tracker(&router);

    let topic = parse_uri("com.example.**").unwrap();
    tracker.add(topic.clone()).await.unwrap();
    assert!(tracker.is_planned(&topic), "planned while disconnected");
    assert_eq!(tracker.active_count(), 0);

    tracker.connection().open().await.unwrap();

    eventually(|| tracker.is_active(&topic)).await;
    assert_eq!(router.subscriptions("com.example."), 1);
}

#[tokio::test]
async fn reconnect_resubscribes_planned_topics_only() {
    let router = MockRouter::with_behavior(Behavior::Join);
    let tracker = tracker(&router);
    let manager = Arc::clone(tracker.connection());
    manager.open().await.unwrap();

    let kept = Uri::exact("com.example.kept");
    let dropped = Uri::exact("com.example.dropped");
    tracker.add(kept.clone()).await.unwrap();
    tracker.add(dropped.clone()).await.unwrap();
    tracker.remove(&dropped).await.unwrap();

    manager.component().drop_transport();
    eventually(|| tracker.active_count() == 0).await;
    assert!(tracker.is_planned(&kept), "plans survive the session");

    manager.open().await.unwrap();
    eventually(|| tracker.is_active(&kept)).await;

    assert_eq!(tracker.active_count(), 1);
    assert_eq!(router.subscriptions("com.example.kept"), 2);
    assert_eq!(router.subscriptions("com.example.dropped"), 1);
    assert_eq!(router.starts(), 2);
}

#[tokio::test]
async fn events_reach_handler() {
    let router = MockRouter::with_behavior(Behavior::Join);
    let manager = ConnectionManager::<MockComponent>::new(config(), MockOptions::new(&router)).unwrap();
    let seen = Arc::new(Mutex::new(Vec::<SubscriptionEvent>::new()));

    let events = Arc::clone(&seen);
    let tracker = SubscriptionTracker::new(Arc::new(manager), move |event| {
        events.lock().unwrap().push(event);
    });
    tracker.connection().open().await.unwrap();
    tracker.add(Uri::exact("com.example.news")).await.unwrap();

    router.emit("com.example.news", vec![json!("hello"), json!(1)]);
    router.emit("com.example.other", vec![json!("ignored")]);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].topic, "com.example.news");
    assert_eq!(seen[0].args, vec![json!("hello"), json!(1)]);
}
