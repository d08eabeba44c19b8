#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Map, json};
use wampli::error::Kind;
use wampli::worker::{Action, Report};
use wampli::{ConnectionManager, Task, WorkerHandle};

use crate::common::{Behavior, FAIL, HANG, MockComponent, MockOptions, MockRouter, config};

const TIMEOUT: Duration = Duration::from_secs(5);

fn spawn(router: &Arc<MockRouter>) -> (WorkerHandle, Receiver<Report>) {
    let manager = ConnectionManager::<MockComponent>::new(config(), MockOptions::new(router)).unwrap();
    let (tx, rx) = mpsc::channel();
    let worker = WorkerHandle::spawn(manager, tx).unwrap();
    (worker, rx)
}

fn call(args: serde_json::Value) -> Task {
    let serde_json::Value::Array(args) = args else {
        panic!("call arguments must be an array");
    };
    Task::new(Action::Call, args, Map::new())
}

/// Receive reports until one matches.
fn expect_report<F: Fn(&Report) -> bool>(rx: &Receiver<Report>, matches: F) -> Report {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let report = rx.recv_timeout(left).unwrap();
        if matches(&report) {
            return report;
        }
    }
}

fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn connects_on_start() {
    let router = MockRouter::with_behavior(Behavior::Join);
    let (worker, rx) = spawn(&router);

    assert!(matches!(rx.recv_timeout(TIMEOUT).unwrap(), Report::Connecting));
    assert!(matches!(rx.recv_timeout(TIMEOUT).unwrap(), Report::Connected));
    assert!(worker.is_running(), "worker runs until stopped");

    assert!(worker.stop(TIMEOUT), "worker stops in time");
    assert_eq!(router.leaves(), 1);
}

#[test]
fn call_result_is_reported() {
    let router = MockRouter::with_behavior(Behavior::Join);
    let (worker, rx) = spawn(&router);

    worker
        .submit(call(json!(["com.example.echo", 1, "two"])))
        .unwrap();

    let Report::Result(result) = expect_report(&rx, |r| matches!(r, Report::Result(_))) else {
        unreachable!();
    };
    assert_eq!(result.args, vec![json!(1), json!("two")]);
    assert!(worker.queue().wait_idle(TIMEOUT), "every task reported done");
    assert_eq!(worker.queue().outstanding(), 0);

    assert!(worker.stop(TIMEOUT), "worker stops in time");
}

#[test]
fn failed_tasks_do_not_stop_worker() {
    let router = MockRouter::with_behavior(Behavior::Join);
    let (worker, rx) = spawn(&router);

    worker.submit(Task::new(Action::Call, Vec::new(), Map::new())).unwrap();
    let Report::Failed { action, error } = expect_report(&rx, |r| matches!(r, Report::Failed { .. }))
    else {
        unreachable!();
    };
    assert_eq!(action, Action::Call);
    assert_eq!(error.kind(), Kind::MissingUri);

    worker.submit(call(json!([5]))).unwrap();
    let Report::Failed { error, .. } = expect_report(&rx, |r| matches!(r, Report::Failed { .. })) else {
        unreachable!();
    };
    assert_eq!(error.kind(), Kind::UriType);

    worker.submit(call(json!([FAIL]))).unwrap();
    let Report::Failed { error, .. } = expect_report(&rx, |r| matches!(r, Report::Failed { .. })) else {
        unreachable!();
    };
    assert_eq!(error.kind(), Kind::Application);

    worker.submit(Task::new(Action::from("register"), Vec::new(), Map::new())).unwrap();
    let report = expect_report(&rx, |r| matches!(r, Report::UnknownAction(_)));
    assert_eq!(report.to_string(), "unknown task given to worker: register");

    worker.submit(call(json!(["com.example.echo", 1]))).unwrap();
    expect_report(&rx, |r| matches!(r, Report::Result(_)));

    assert!(worker.stop(TIMEOUT), "worker stops in time");
}

#[test]
fn publish_is_acknowledged() {
    let router = MockRouter::with_behavior(Behavior::Join);
    let (worker, rx) = spawn(&router);

    worker
        .submit(Task::new(Action::Publish, vec![json!("com.example.news"), json!("hi")], Map::new()))
        .unwrap();

    expect_report(&rx, |r| matches!(r, Report::Published));
    assert_eq!(router.published(), vec!["com.example.news".to_owned()]);

    assert!(worker.stop(TIMEOUT), "worker stops in time");
}

#[test]
fn subscription_events_are_reported() {
    let router = MockRouter::with_behavior(Behavior::Join);
    let (worker, rx) = spawn(&router);

    worker
        .submit(Task::new(Action::Subscribe, vec![json!("com.example.news")], Map::new()))
        .unwrap();
    let report = expect_report(&rx, |r| matches!(r, Report::Subscribed(_)));
    assert_eq!(report.to_string(), "subscribed to com.example.news");

    router.emit("com.example.news", vec![json!("hello")]);
    let Report::Event(event) = expect_report(&rx, |r| matches!(r, Report::Event(_))) else {
        unreachable!();
    };
    assert_eq!(event.topic, "com.example.news");
    assert_eq!(event.args, vec![json!("hello")]);

    worker
        .submit(Task::new(Action::Unsubscribe, vec![json!("com.example.news")], Map::new()))
        .unwrap();
    expect_report(&rx, |r| matches!(r, Report::Unsubscribed(_)));
    assert_eq!(router.unsubscribes(), 1);

    worker.submit(Task::new(Action::Subscribe, Vec::new(), Map::new())).unwrap();
    let report = expect_report(&rx, |r| matches!(r, Report::NoTopic(_)));
    assert_eq!(report.to_string(), "no topic provided");

    assert!(worker.stop(TIMEOUT), "worker stops in time");
}

#[test]
fn stop_cancels_in_flight_tasks_and_closes_once() {
    let router = MockRouter::with_behavior(Behavior::Join);
    let (worker, rx) = spawn(&router);

    worker.submit(call(json!([HANG]))).unwrap();
    worker.submit(call(json!([HANG, 1]))).unwrap();
    wait_until(|| router.calls().len() == 2);
    assert_eq!(worker.queue().outstanding(), 2);

    let queue = worker.queue().clone();
    assert!(worker.stop(TIMEOUT), "worker stops in time");

    assert_eq!(router.leaves(), 1);
    assert_eq!(queue.outstanding(), 0, "canceled tasks are done");

    let reports: Vec<Report> = rx.try_iter().collect();
    assert!(
        reports.iter().any(|r| matches!(r, Report::Stopping)),
        "stop is reported: {reports:?}"
    );
    assert!(
        !reports.iter().any(|r| matches!(r, Report::Result(_) | Report::Failed { .. })),
        "hanging calls never finish: {reports:?}"
    );
}

#[test]
fn connect_failure_is_reported() {
    let router = MockRouter::with_behavior(Behavior::FailFatal);
    let (worker, rx) = spawn(&router);

    let Report::ConnectFailed(error) = expect_report(&rx, |r| matches!(r, Report::ConnectFailed(_)))
    else {
        unreachable!();
    };
    assert_eq!(error.kind(), Kind::FatalTransport);

    assert!(worker.stop(TIMEOUT), "worker stops in time");
    assert_eq!(router.leaves(), 0);
}

#[test]
fn subscribe_right_after_start_subscribes_once() {
    let router = MockRouter::with_behavior(Behavior::Join);
    let (worker, rx) = spawn(&router);

    worker
        .submit(Task::new(Action::Subscribe, vec![json!("com.example.news")], Map::new()))
        .unwrap();
    expect_report(&rx, |r| matches!(r, Report::Subscribed(_)));
    assert!(worker.queue().wait_idle(TIMEOUT), "subscribe is done");
    // Let the join handling settle before the event goes out.
    thread::sleep(Duration::from_millis(50));

    router.emit("com.example.news", vec![json!("hello")]);
    expect_report(&rx, |r| matches!(r, Report::Event(_)));
    thread::sleep(Duration::from_millis(50));

    let reports: Vec<Report> = rx.try_iter().collect();
    assert!(
        !reports.iter().any(|r| matches!(r, Report::Event(_))),
        "the event is reported once: {reports:?}"
    );
    assert_eq!(router.subscriptions("com.example.news"), 1);

    assert!(worker.stop(TIMEOUT), "worker stops in time");
}
