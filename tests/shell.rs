#![cfg(feature = "cli")]
#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::thread;
use std::time::{Duration, Instant};

use wampli::args::Aliases;
use wampli::shell::{Command, Console, parse_line};
use wampli::{ConnectionManager, WorkerHandle};

use crate::common::{Behavior, MockComponent, MockOptions, MockRouter, config};

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn console_worker_runs_parsed_lines() {
    let router = MockRouter::with_behavior(Behavior::Join);
    let manager = ConnectionManager::<MockComponent>::new(config(), MockOptions::new(&router)).unwrap();
    let worker = WorkerHandle::spawn(manager, Console::default()).unwrap();

    let mut aliases = Aliases::new();
    aliases.insert("echo".to_owned(), "com.example.echo".to_owned());

    let Command::Task(task) = parse_line("call echo 1", &aliases).unwrap() else {
        panic!("call lines are tasks");
    };
    worker.submit(task).unwrap();
    assert!(worker.queue().wait_idle(TIMEOUT), "the call is done");

    let deadline = Instant::now() + TIMEOUT;
    while router.calls().is_empty() {
        assert!(Instant::now() < deadline, "call never reached the router");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(router.calls(), vec!["com.example.echo".to_owned()]);

    assert!(worker.stop(TIMEOUT), "worker stops in time");
    assert_eq!(router.leaves(), 1);
}
