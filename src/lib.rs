#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod args;
pub mod config;
pub mod connection;
pub mod error;
pub mod format;
pub mod session;
#[cfg(feature = "cli")]
pub mod shell;
pub mod subscription;
pub(crate) mod value;
pub mod worker;
#[cfg(feature = "ws")]
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub use crate::args::{Arguments, ParsedCall, Uri, parse_arg_string, parse_args, ready_uri};
pub use crate::config::ConnectionConfig;
pub use crate::connection::ConnectionManager;
pub use crate::subscription::SubscriptionTracker;
pub use crate::worker::{Task, TaskQueue, WorkerHandle};
