//! Human readable rendering of values and results.

use serde_json::{Map, Value};

use crate::args::split_kwarg;
use crate::value::parse_arg_value;

/// Render a value similar to YAML.
#[must_use]
pub fn human_repr(value: &Value) -> String {
    match serde_yaml::to_string(value) {
        Ok(s) => s.trim_end_matches('\n').to_owned(),
        Err(_) => value.to_string(),
    }
}

/// Render the result of a call.
///
/// An empty or `null` result is rendered as `ok`.
#[must_use]
pub fn human_result(args: &[Value], kwargs: &Map<String, Value>) -> String {
    match (args, kwargs.is_empty()) {
        ([], true) | ([Value::Null], true) => "ok".to_owned(),
        ([single], true) => indent_multiline(&human_repr(single), "  ", true),
        _ => {
            let mut out = format_args(args);
            let kwargs = format_kwargs(kwargs);
            if !kwargs.is_empty() {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(&kwargs);
            }
            out
        }
    }
}

/// Indent `s` if it spans more than one line.
///
/// With `add_newlines` the indented block is surrounded by newlines so it
/// stands apart from text around it.
#[must_use]
pub fn indent_multiline(s: &str, indentation: &str, add_newlines: bool) -> String {
    let lines: Vec<&str> = s.lines().collect();
    if lines.len() <= 1 {
        return s.to_owned();
    }

    let indented = lines
        .iter()
        .map(|line| format!("{indentation}{line}"))
        .collect::<Vec<_>>()
        .join("\n");

    if add_newlines {
        format!("\n{indented}\n")
    } else {
        indented
    }
}

/// Positional values separated by commas.
#[must_use]
pub fn format_args(args: &[Value]) -> String {
    args.iter()
        .map(|arg| indent_multiline(&human_repr(arg), "  ", true))
        .collect::<Vec<_>>()
        .join(", ")
}

/// One indented `key = value` line per keyword value.
#[must_use]
pub fn format_kwargs(kwargs: &Map<String, Value>) -> String {
    kwargs
        .iter()
        .map(|(key, value)| {
            format!("  {key} = {}", indent_multiline(&human_repr(value), "  ", true))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render a call in function style, e.g. `wamp.session.get(12345, key=value)`.
///
/// The output parses back to the same values.
#[must_use]
pub fn format_function_style(uri: &str, args: &[Value], kwargs: &Map<String, Value>) -> String {
    let rendered: Vec<String> = args
        .iter()
        .map(format_literal)
        .chain(
            kwargs
                .iter()
                .map(|(key, value)| format!("{key}={}", format_literal(value))),
        )
        .collect();

    format!("{uri}({})", rendered.join(", "))
}

/// Render a value as an argument literal.
///
/// Strings that decode to themselves stay bare, everything else is
/// written as JSON (which is also valid flow YAML).
fn format_literal(value: &Value) -> String {
    match value {
        Value::String(s) if is_bare_word(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_bare_word(s: &str) -> bool {
    !s.is_empty()
        && s.trim() == s
        && !s.contains(|c| matches!(c, ',' | '(' | ')' | '[' | ']' | '{' | '}' | '"' | '\''))
        && split_kwarg(s).0.is_none()
        && parse_arg_value(s).as_str() == Some(s)
}
