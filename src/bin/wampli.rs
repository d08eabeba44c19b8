//! wampli - command line client for WAMP routers
//!
//! Usage:
//!   wampli -u ws://localhost:8080/ws -r realm1 call com.example.add 1 2
//!   wampli -u ws://localhost:8080/ws -r realm1 subscribe 'com.example.**'
//!   wampli -u ws://localhost:8080/ws -r realm1 shell
//!
//! Arguments are parsed as literals, `key=value` passes a keyword argument.
//! Set `RUST_LOG` to control logging; `-v` raises the default to debug.

#![expect(
    clippy::print_stdout,
    clippy::print_stderr,
    reason = "The binary talks to the user on stdout and stderr"
)]

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use clap::{Args, Parser, Subcommand};
use serde_json::Map;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};
use wampli::args::{Aliases, ParsedCall, parse_args, parse_uri, substitute_aliases};
use wampli::format::human_result;
use wampli::shell::{Console, Shell};
use wampli::ws::{Config, WebSocketComponent};
use wampli::{ConnectionConfig, ConnectionManager, SubscriptionTracker, WorkerHandle};

type Manager = ConnectionManager<WebSocketComponent>;

#[derive(Parser, Debug)]
#[command(name = "wampli")]
#[command(about = "A command line interface for the WAMP protocol")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    wamp: WampArgs,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct WampArgs {
    /// URL of the WAMP router to connect to
    #[arg(short, long, env = "WAMPLI_URL")]
    url: String,

    /// Realm to join
    #[arg(short, long, env = "WAMPLI_REALM")]
    realm: String,

    /// URI alias, usable as the whole URI or as `$NAME` within one
    #[arg(short, long = "alias", value_name = "NAME=URI", value_parser = parse_alias)]
    aliases: Vec<(String, String)>,

    /// Connection attempts before giving up, unlimited if not given
    #[arg(long)]
    retries: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Call a procedure
    Call {
        /// WAMP URI
        uri: String,
        /// Arguments to provide. Use key=value for keyword arguments
        args: Vec<String>,
    },
    /// Publish to a topic
    Publish {
        /// WAMP URI
        uri: String,
        /// Arguments to provide. Use key=value for keyword arguments
        args: Vec<String>,
    },
    /// Subscribe to topics and print their events
    Subscribe {
        /// Topics, `*` and a trailing `**` match patterns
        #[arg(required = true)]
        uris: Vec<String>,
    },
    /// Unsubscribe from a topic
    Unsubscribe {
        /// WAMP URI
        uri: String,
    },
    /// Start the interactive shell
    Shell,
}

fn parse_alias(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, uri)) if !name.is_empty() && !uri.is_empty() => {
            Ok((name.to_owned(), uri.to_owned()))
        }
        _ => Err(format!("expected NAME=URI, got '{raw}'")),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "warn,wampli=debug" } else { "warn" };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

impl WampArgs {
    fn aliases(&self) -> Aliases {
        self.aliases.iter().cloned().collect()
    }

    fn manager(&self) -> anyhow::Result<Manager> {
        let config = ConnectionConfig::for_url(self.realm.as_str(), &self.url)
            .with_context(|| format!("invalid router url '{}'", self.url))?;
        let options = Config::default().with_max_attempts(self.retries);

        tracing::debug!(%config, "connection config");

        Ok(ConnectionManager::new(config, options)?)
    }

    /// Parse `uri` and `args` the way the shell does.
    fn parsed_call(&self, uri: &str, args: &[String]) -> anyhow::Result<ParsedCall> {
        let arguments = parse_args(std::iter::once(uri).chain(args.iter().map(String::as_str)));
        Ok(arguments.into_call(Some(&self.aliases()))?)
    }

    fn topic(&self, raw: &str) -> anyhow::Result<wampli::Uri> {
        let aliases = self.aliases();
        let uri = aliases.get(raw).map_or(raw, String::as_str);
        Ok(parse_uri(&substitute_aliases(uri, &aliases))?)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let outcome = match cli.command {
        Command::Shell => run_shell(&cli.wamp),
        command => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("unable to start the runtime")
            .and_then(|runtime| runtime.block_on(run_command(&cli.wamp, command))),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run_shell(wamp: &WampArgs) -> anyhow::Result<()> {
    let worker = WorkerHandle::spawn(wamp.manager()?, Console::default())?;
    Shell::new(worker, wamp.aliases()).run()?;
    Ok(())
}

async fn run_command(wamp: &WampArgs, command: Command) -> anyhow::Result<()> {
    let manager = Arc::new(wamp.manager()?);

    let result = match command {
        Command::Call { uri, args } => call(&manager, wamp.parsed_call(&uri, &args)?).await,
        Command::Publish { uri, args } => publish(&manager, wamp.parsed_call(&uri, &args)?).await,
        Command::Subscribe { uris } => {
            let topics = uris
                .iter()
                .map(|uri| wamp.topic(uri))
                .collect::<anyhow::Result<Vec<_>>>()?;
            subscribe(&manager, topics).await
        }
        Command::Unsubscribe { uri } => unsubscribe(&manager, wamp.topic(&uri)?).await,
        Command::Shell => Err(anyhow!("the shell does not run inside a runtime")),
    };

    if let Err(e) = manager.close().await {
        tracing::warn!(error = %e, "unable to close the connection");
    }

    result
}

async fn call(manager: &Manager, call: ParsedCall) -> anyhow::Result<()> {
    let session = manager.session().await?;
    let result = session.call(&call.uri.uri, call.args, call.kwargs).await?;

    println!("{}", human_result(&result.args, &result.kwargs));
    Ok(())
}

async fn publish(manager: &Manager, call: ParsedCall) -> anyhow::Result<()> {
    let session = manager.session().await?;
    if let Some(ack) = session.publish(&call.uri.uri, call.args, call.kwargs, true)? {
        ack.await?;
    }

    println!("{}", human_result(&[], &Map::new()));
    Ok(())
}

async fn subscribe(manager: &Arc<Manager>, topics: Vec<wampli::Uri>) -> anyhow::Result<()> {
    manager.open().await?;

    let tracker = Arc::new(SubscriptionTracker::new(Arc::clone(manager), |event| {
        println!("{event}");
    }));
    tracker.start_resubscription_handler();

    let count = topics.len();
    futures::future::try_join_all(topics.into_iter().map(|topic| tracker.add(topic))).await?;
    println!("subscribed to {count} topic(s)");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, leaving");
            println!("Exiting");
        }
        () = manager.stopped() => {
            tracing::info!("connection stopped");
        }
    }

    Ok(())
}

async fn unsubscribe(manager: &Arc<Manager>, topic: wampli::Uri) -> anyhow::Result<()> {
    manager.open().await?;

    let tracker = SubscriptionTracker::new(Arc::clone(manager), |_event| {});
    tracker.remove(&topic).await?;

    println!("unsubscribed from {topic}");
    Ok(())
}
