//! Argument grammar.
//!
//! Turns a line like `wamp.session.get(12345, key=value)` or
//! `wamp.session.get 12345 key=value` into positional and keyword values.

use std::collections::HashMap;
use std::fmt;

use serde_json::{Map, Value};

use crate::Result;
use crate::error::{Error, MissingUri, UriType};
pub use crate::value::parse_arg_value;

/// Alias name to URI, used by [`ready_uri`].
pub type Aliases = HashMap<String, String>;

/// Positional and keyword values parsed from text.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl Arguments {
    /// Treat the first positional value as the URI and split it off.
    pub fn into_call(mut self, aliases: Option<&Aliases>) -> Result<ParsedCall> {
        let uri = ready_uri(&mut self.args, aliases)?;
        self.args.remove(0);

        Ok(ParsedCall {
            uri,
            args: self.args,
            kwargs: self.kwargs,
        })
    }
}

/// A URI with the arguments to send along.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCall {
    pub uri: Uri,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

/// How a subscription topic is matched by the router.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum MatchPolicy {
    Prefix,
    Wildcard,
}

/// A URI together with its match policy.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    pub uri: String,
    pub policy: Option<MatchPolicy>,
}

impl Uri {
    #[must_use]
    pub fn exact<S: Into<String>>(uri: S) -> Self {
        Self {
            uri: uri.into(),
            policy: None,
        }
    }

    #[must_use]
    pub fn with_policy<S: Into<String>>(uri: S, policy: MatchPolicy) -> Self {
        Self {
            uri: uri.into(),
            policy: Some(policy),
        }
    }
}

/// Renders the glob pattern [`parse_uri`] accepts.
impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.policy {
            None => f.write_str(&self.uri),
            Some(MatchPolicy::Prefix) => write!(f, "{}**", self.uri),
            Some(MatchPolicy::Wildcard) => {
                let pattern = self
                    .uri
                    .split('.')
                    .map(|component| if component.is_empty() { "*" } else { component })
                    .collect::<Vec<_>>()
                    .join(".");
                f.write_str(&pattern)
            }
        }
    }
}

/// Result of feeding one character to [`Nesting`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Outside of any brackets and quotes
    TopLevel,
    /// Inside brackets or quotes, or opening/closing them
    Nested,
    /// A closing bracket without a matching opener
    Unbalanced,
}

/// Tracks bracket nesting and quoted sections while walking a string.
#[derive(Debug, Default)]
struct Nesting {
    open: Vec<char>,
    quote: Option<char>,
    escaped: bool,
}

impl Nesting {
    fn step(&mut self, c: char) -> Step {
        if let Some(quote) = self.quote {
            if self.escaped {
                self.escaped = false;
            } else if c == '\\' {
                self.escaped = true;
            } else if c == quote {
                self.quote = None;
            }
            return Step::Nested;
        }

        match c {
            '"' | '\'' => {
                self.quote = Some(c);
                Step::Nested
            }
            '(' | '[' | '{' => {
                self.open.push(c);
                Step::Nested
            }
            ')' | ']' | '}' => match self.open.pop() {
                Some(opener) if closer(opener) == c => Step::Nested,
                _ => Step::Unbalanced,
            },
            _ if self.open.is_empty() => Step::TopLevel,
            _ => Step::Nested,
        }
    }

    fn is_balanced(&self) -> bool {
        self.open.is_empty() && self.quote.is_none()
    }
}

const fn closer(opener: char) -> char {
    match opener {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

const fn is_uri_char(c: char) -> bool {
    matches!(c, 'a'..='z' | '0'..='9' | '_' | '.')
}

/// Split a function style call like `a.b(1, key=value)` into its parts.
///
/// Returns `None` if the text isn't function style, otherwise the URI
/// followed by the raw argument strings.
#[must_use]
pub fn split_function_style(text: &str) -> Option<Vec<String>> {
    let (head, rest) = text.trim().split_once('(')?;
    let uri = head.strip_suffix(char::is_whitespace).unwrap_or(head);
    if !uri.chars().all(is_uri_char) {
        return None;
    }

    let arg_string = rest.strip_suffix(')')?;

    // the final parenthesis has to close the first one
    let mut nesting = Nesting::default();
    if arg_string
        .chars()
        .any(|c| nesting.step(c) == Step::Unbalanced)
        || !nesting.is_balanced()
    {
        return None;
    }

    let mut parts = vec![uri.to_owned()];
    parts.extend(split_arguments(arg_string));
    Some(parts)
}

/// Split an argument list on the commas that aren't nested in brackets or quotes.
///
/// A trailing comma is allowed.
#[must_use]
pub fn split_arguments(arg_string: &str) -> Vec<String> {
    if arg_string.trim().is_empty() {
        return Vec::new();
    }

    let mut nesting = Nesting::default();
    let mut parts = Vec::new();
    let mut current = String::new();

    for c in arg_string.chars() {
        if nesting.step(c) == Step::TopLevel && c == ',' {
            parts.push(current.trim().to_owned());
            current.clear();
        } else {
            current.push(c);
        }
    }

    let last = current.trim();
    if !last.is_empty() || parts.is_empty() {
        parts.push(last.to_owned());
    }

    parts
}

/// Split text into words like a POSIX shell does.
///
/// Whitespace separates words, single quotes are literal, double quotes allow
/// backslash escapes and a backslash outside of quotes escapes the next character.
pub fn split_shell(text: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(Error::parse(text, "No closing quotation")),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err(Error::parse(text, "No closing quotation")),
                        },
                        Some(c) => current.push(c),
                        None => return Err(Error::parse(text, "No closing quotation")),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => return Err(Error::parse(text, "No escaped character")),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }

    Ok(words)
}

/// Split a line into raw argument strings.
///
/// Function style is tried first, shell style is the fallback.
pub fn split_arg_string(text: &str) -> Result<Vec<String>> {
    match split_function_style(text) {
        Some(parts) => Ok(parts),
        None => split_shell(text),
    }
}

/// Split `key=value` into its key and value.
///
/// Keys start with a lowercase letter and are at least three characters of
/// lowercase letters, digits and underscores. Anything else, `2=5` included,
/// is returned whole as a positional argument.
#[must_use]
pub fn split_kwarg(arg: &str) -> (Option<&str>, &str) {
    let Some((key, value)) = arg.split_once('=') else {
        return (None, arg);
    };

    let key = key.trim_end();
    let mut chars = key.chars();
    let is_key = key.len() >= 3
        && chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if is_key && !value.is_empty() {
        (Some(key), value)
    } else {
        (None, arg)
    }
}

/// Parse raw argument strings into their values.
pub fn parse_args<I, S>(args: I) -> Arguments
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parsed = Arguments::default();

    for arg in args {
        let (key, raw_value) = split_kwarg(arg.as_ref());
        let value = parse_arg_value(raw_value);

        match key {
            Some(key) => {
                parsed.kwargs.insert(key.to_owned(), value);
            }
            None => parsed.args.push(value),
        }
    }

    parsed
}

/// Split a line with [`split_arg_string`] and parse the parts.
pub fn parse_arg_string(text: &str) -> Result<Arguments> {
    Ok(parse_args(split_arg_string(text)?))
}

/// Parse a glob style URI pattern.
///
/// `a.b.**` matches every URI starting with `a.b.`, a `*` component matches
/// any single component.
pub fn parse_uri(pattern: &str) -> Result<Uri> {
    if pattern.contains("**") {
        let prefix = pattern
            .strip_suffix("**")
            .filter(|prefix| !prefix.contains("**"))
            .ok_or_else(|| Error::parse(pattern, "'**' can only occur at the end"))?;

        return Ok(Uri::with_policy(prefix, MatchPolicy::Prefix));
    }

    if !pattern.contains('*') {
        return Ok(Uri::exact(pattern));
    }

    let uri = pattern
        .split('.')
        .map(|component| if component == "*" { "" } else { component })
        .collect::<Vec<_>>()
        .join(".");

    Ok(Uri::with_policy(uri, MatchPolicy::Wildcard))
}

/// Replace `$name` references with their alias.
///
/// A reference may be terminated by a second `$` to glue it to the following
/// text, so `$a$b` with `a = x` becomes `xb`. Unknown names are left untouched.
#[must_use]
pub fn substitute_aliases(uri: &str, aliases: &Aliases) -> String {
    let mut out = String::with_capacity(uri.len());
    let mut rest = uri;

    while let Some((before, after)) = rest.split_once('$') {
        out.push_str(before);

        let name_len = after
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        let (name, tail) = after.split_at(name_len);
        if name.is_empty() {
            out.push('$');
            rest = after;
            continue;
        }

        let (terminated, tail) = match tail.strip_prefix('$') {
            Some(stripped) => (true, stripped),
            None => (false, tail),
        };

        if let Some(target) = aliases.get(name) {
            out.push_str(target);
        } else {
            out.push('$');
            out.push_str(name);
            if terminated {
                out.push('$');
            }
        }

        rest = tail;
    }

    out.push_str(rest);
    out
}

/// Treat the first argument as a URI and prepare it.
///
/// With `aliases`, a URI that is an alias name is replaced by its target and
/// `$name` references are substituted. The substituted text is written back
/// into `args`; the parsed pattern is returned.
///
/// # Errors
///
/// [`Kind::MissingUri`](crate::error::Kind::MissingUri) if `args` is empty,
/// [`Kind::UriType`](crate::error::Kind::UriType) if the first argument isn't a string.
pub fn ready_uri(args: &mut [Value], aliases: Option<&Aliases>) -> Result<Uri> {
    let uri = match args.first_mut() {
        None => return Err(MissingUri.into()),
        Some(Value::String(uri)) => uri,
        Some(other) => {
            return Err(UriType {
                found: other.to_string(),
            }
            .into());
        }
    };

    if let Some(aliases) = aliases.filter(|aliases| !aliases.is_empty()) {
        if let Some(target) = aliases.get(uri.as_str()) {
            uri.clone_from(target);
        }
        *uri = substitute_aliases(uri, aliases);
    }

    parse_uri(uri)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::Kind;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|&s| s.to_owned()).collect()
    }

    #[test]
    fn function_style_splits_uri_and_arguments() {
        assert_eq!(split_function_style("a()"), Some(strings(&["a"])));
        assert_eq!(
            split_function_style("a.b(hello, world)"),
            Some(strings(&["a.b", "hello", "world"]))
        );
        assert_eq!(
            split_function_style("test(key=value)"),
            Some(strings(&["test", "key=value"]))
        );
        assert_eq!(
            split_function_style(".relative (1)"),
            Some(strings(&[".relative", "1"]))
        );
    }

    #[test]
    fn function_style_rejects_other_text() {
        assert_eq!(split_function_style("hello world"), None);
        assert_eq!(split_function_style("Upper.case(1)"), None);
        assert_eq!(split_function_style("a(b)(c)"), None);
        assert_eq!(split_function_style("a([1, 2)"), None);
        assert_eq!(split_function_style("a(1) trailing"), None);
    }

    #[test]
    fn commas_inside_brackets_and_quotes_do_not_split() {
        let parts = split_function_style("f(a, [1,2,3], b)").unwrap();
        assert_eq!(parts, strings(&["f", "a", "[1,2,3]", "b"]));

        let parts = split_function_style(r#"f(a, [1,2], key={"x":1}, "c, d")"#).unwrap();
        assert_eq!(
            parts,
            strings(&["f", "a", "[1,2]", r#"key={"x":1}"#, r#""c, d""#])
        );
    }

    #[test]
    fn trailing_comma_is_allowed() {
        assert_eq!(split_arguments("1, 2,"), strings(&["1", "2"]));
        assert_eq!(split_arguments("   "), Vec::<String>::new());
    }

    #[test]
    fn split_arg_string_falls_back_to_shell_words() {
        assert_eq!(
            split_arg_string("test(a, b=c, d, key=value)").unwrap(),
            strings(&["test", "a", "b=c", "d", "key=value"])
        );
        assert_eq!(
            split_arg_string("hello world \"multi word\"").unwrap(),
            strings(&["hello", "world", "multi word"])
        );
        assert_eq!(
            split_arg_string(r"it\'s 'single quoted' a\ b").unwrap(),
            strings(&["it's", "single quoted", "a b"])
        );
    }

    #[test]
    fn unclosed_quote_is_a_parse_error() {
        let err = split_shell("say \"hello").unwrap_err();
        assert_eq!(err.kind(), Kind::Parse);
    }

    #[test]
    fn kwarg_detection() {
        assert_eq!(split_kwarg("hey"), (None, "hey"));
        assert_eq!(split_kwarg("key=value"), (Some("key"), "value"));
        assert_eq!(split_kwarg("2=5"), (None, "2=5"));
        assert_eq!(split_kwarg("hey="), (None, "hey="));
        assert_eq!(split_kwarg("ab=1"), (None, "ab=1"));
        assert_eq!(split_kwarg("max_len =3"), (Some("max_len"), "3"));
    }

    #[test]
    fn parse_args_decodes_values() {
        let parsed = parse_args(["hello", "55", "[a, 3.5, c]", "key=value", "val=5"]);

        assert_eq!(parsed.args, vec![json!("hello"), json!(55), json!(["a", 3.5, "c"])]);
        assert_eq!(Value::Object(parsed.kwargs), json!({"key": "value", "val": 5}));
    }

    #[test]
    fn parse_args_keeps_digit_keys_positional() {
        let parsed = parse_args(["foo.bar", "1", "key=2", "2=5"]);

        assert_eq!(parsed.args, vec![json!("foo.bar"), json!(1), json!("2=5")]);
        assert_eq!(Value::Object(parsed.kwargs), json!({"key": 2}));
    }

    #[test]
    fn parse_arg_string_handles_function_style() {
        let parsed = parse_arg_string("wamp.session.get(12345, details={a: 1})").unwrap();

        assert_eq!(parsed.args, vec![json!("wamp.session.get"), json!(12345)]);
        assert_eq!(Value::Object(parsed.kwargs), json!({"details": {"a": 1}}));
    }

    #[test]
    fn parse_uri_patterns() {
        assert_eq!(parse_uri("a.b").unwrap(), Uri::exact("a.b"));
        assert_eq!(
            parse_uri("a.**").unwrap(),
            Uri::with_policy("a.", MatchPolicy::Prefix)
        );
        assert_eq!(
            parse_uri("a.*.b").unwrap(),
            Uri::with_policy("a..b", MatchPolicy::Wildcard)
        );
        assert_eq!(
            parse_uri("*.b*.*.*").unwrap(),
            Uri::with_policy(".b*...", MatchPolicy::Wildcard)
        );

        let err = parse_uri("a.**.b").unwrap_err();
        assert_eq!(err.kind(), Kind::Parse);
    }

    #[test]
    fn uri_display_renders_pattern() {
        assert_eq!(parse_uri("a.**").unwrap().to_string(), "a.**");
        assert_eq!(parse_uri("*.b.*").unwrap().to_string(), "*.b.*");
        assert_eq!(parse_uri("a.b").unwrap().to_string(), "a.b");
    }

    #[test]
    fn ready_uri_errors() {
        let err = ready_uri(&mut [], None).unwrap_err();
        assert_eq!(err.kind(), Kind::MissingUri);

        let err = ready_uri(&mut [json!(5)], None).unwrap_err();
        assert_eq!(err.kind(), Kind::UriType);
    }

    #[test]
    fn ready_uri_without_aliases_leaves_args_alone() {
        let mut args = vec![json!("a"), json!("b")];
        let uri = ready_uri(&mut args, None).unwrap();

        assert_eq!(uri, Uri::exact("a"));
        assert_eq!(args, vec![json!("a"), json!("b")]);
    }

    #[test]
    fn ready_uri_substitutes_aliases() {
        let aliases = Aliases::from([
            ("hello".to_owned(), "wamp.session.welcome".to_owned()),
            ("world".to_owned(), "nothing".to_owned()),
        ]);
        let mut args = vec![json!("hello"), json!("world")];
        ready_uri(&mut args, Some(&aliases)).unwrap();
        assert_eq!(args, vec![json!("wamp.session.welcome"), json!("world")]);

        let aliases = Aliases::from([("a".to_owned(), "test".to_owned())]);
        let mut args = vec![json!("$a.$a$b$a.$a"), json!("nope")];
        ready_uri(&mut args, Some(&aliases)).unwrap();
        assert_eq!(args, vec![json!("test.testbtest.test"), json!("nope")]);
    }

    #[test]
    fn unknown_alias_is_left_untouched() {
        let aliases = Aliases::from([("a".to_owned(), "x".to_owned())]);
        assert_eq!(substitute_aliases("$zz.$a", &aliases), "$zz.x");
        assert_eq!(substitute_aliases("cost$", &aliases), "cost$");
    }

    #[test]
    fn into_call_splits_off_uri() {
        let call = parse_args(["foo.bar", "1", "key=2"]).into_call(None).unwrap();

        assert_eq!(call.uri, Uri::exact("foo.bar"));
        assert_eq!(call.args, vec![json!(1)]);
        assert_eq!(Value::Object(call.kwargs), json!({"key": 2}));
    }
}
