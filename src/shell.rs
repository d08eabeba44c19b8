//! Interactive shell.
//!
//! The shell reads lines in the foreground and hands every command to a
//! [`WorkerHandle`] that owns the connection in the background.

#![expect(
    clippy::print_stdout,
    reason = "The shell talks to the user on stdout"
)]

use std::time::Duration;

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use serde_json::Value;

use crate::Result;
use crate::args::{Aliases, Arguments, parse_arg_string, parse_args, ready_uri, split_function_style};
use crate::error::{Error, Kind};
use crate::worker::{Action, Report, Reporter, Task, WorkerHandle};

const INTRO: &str = "Type 'help' or '?' to list all commands.\nUse 'exit' to exit the shell.";

const PROMPT: &str = "(wampli) ";

const HELP: &str = "\
Commands:
  call <uri> [args...]     Call a procedure
  publish <uri> [args...]  Publish to a topic
  subscribe <topic>        Subscribe to a topic, `*` and a trailing `**` match patterns
  unsubscribe <topic>      Unsubscribe from a topic
  help                     Show this help
  exit                     Exit the shell

A line like `com.example.add(1, 2)` is a call in function style.";

/// How long the worker may take to close the connection once the shell exits.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(20);

/// A parsed shell line.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Work for the worker
    Task(Task),
    Help,
    Exit,
    Empty,
    /// A line that is neither a command nor a function style call
    Unknown(String),
}

/// Parse one line of shell input.
///
/// The URI of a task has its aliases resolved already.
pub fn parse_line(line: &str, aliases: &Aliases) -> Result<Command> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Empty);
    }

    let (word, rest) = line
        .split_once(char::is_whitespace)
        .map_or((line, ""), |(word, rest)| (word, rest.trim()));

    let command = match word {
        "call" => Command::Task(task(Action::Call, parse_arg_string(rest)?, aliases)?),
        "publish" => Command::Task(task(Action::Publish, parse_arg_string(rest)?, aliases)?),
        "subscribe" => Command::Task(topic_task(Action::Subscribe, rest, aliases)?),
        "unsubscribe" => Command::Task(topic_task(Action::Unsubscribe, rest, aliases)?),
        "help" | "?" => Command::Help,
        "exit" => Command::Exit,
        _ => match split_function_style(line) {
            Some(parts) => Command::Task(task(Action::Call, parse_args(parts), aliases)?),
            None => Command::Unknown(line.to_owned()),
        },
    };

    Ok(command)
}

fn task(action: Action, arguments: Arguments, aliases: &Aliases) -> Result<Task> {
    let Arguments { mut args, kwargs } = arguments;
    ready_uri(&mut args, Some(aliases))?;

    Ok(Task::new(action, args, kwargs))
}

/// Topic commands take the whole rest of the line as the topic.
fn topic_task(action: Action, topic: &str, aliases: &Aliases) -> Result<Task> {
    if topic.is_empty() {
        // The worker reports the missing topic.
        return Ok(Task::builder().action(action).build());
    }

    let mut args = vec![Value::String(topic.to_owned())];
    ready_uri(&mut args, Some(aliases))?;

    Ok(Task::builder().action(action).args(args).build())
}

/// Prints the worker's reports.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct Console;

impl Reporter for Console {
    fn report(&self, report: Report) {
        println!("{report}");
    }
}

impl From<ReadlineError> for Error {
    fn from(e: ReadlineError) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

enum Flow {
    Continue,
    Exit,
}

/// Line shell driving a worker.
pub struct Shell {
    worker: WorkerHandle,
    aliases: Aliases,
}

impl Shell {
    #[must_use]
    pub fn new(worker: WorkerHandle, aliases: Aliases) -> Self {
        Self { worker, aliases }
    }

    /// Run until the user exits, then stop the worker.
    ///
    /// Ctrl-C clears the current line, Ctrl-D exits.
    pub fn run(self) -> Result<()> {
        let outcome = self.read_loop();

        if !self.worker.stop(STOP_TIMEOUT) {
            println!("worker did not stop within {}s", STOP_TIMEOUT.as_secs());
        }

        outcome
    }

    fn read_loop(&self) -> Result<()> {
        let mut editor = DefaultEditor::new()?;
        println!("{INTRO}");

        loop {
            match editor.readline(PROMPT) {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        // History is a convenience.
                        _ = editor.add_history_entry(line.as_str());
                    }
                    if let Flow::Exit = self.handle(&line) {
                        return Ok(());
                    }
                }
                Err(ReadlineError::Interrupted) => {}
                Err(ReadlineError::Eof) => {
                    println!("Goodbye");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn handle(&self, line: &str) -> Flow {
        match parse_line(line, &self.aliases) {
            Ok(Command::Task(task)) => {
                if let Err(e) = self.worker.submit(task) {
                    println!("{e}");
                }
            }
            Ok(Command::Help) => println!("{HELP}"),
            Ok(Command::Exit) => {
                println!("Goodbye");
                return Flow::Exit;
            }
            Ok(Command::Unknown(line)) => println!("*** Unknown syntax: {line}"),
            Ok(Command::Empty) => {}
            Err(e) => println!("{e}"),
        }

        Flow::Continue
    }
}
