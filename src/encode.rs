//! Translates structured git option maps into argv tokens.
//!
//! Git itself accepts options in two shapes depending on key length:
//! single-character keys get short-option treatment (`-k`, `-k value`),
//! anything longer gets long-option treatment (`--key`, `--key=value`).
//! Sequence-valued options repeat the encoding once per element, in order.

use std::fmt;
use std::sync::Arc;

/// A single option value: a flag, a scalar, a repeated sequence of either,
/// or (for `$`-prefixed executor controls only) a line callback.
#[derive(Clone)]
pub enum OptionValue {
    /// `true` emits the flag; `false` emits nothing.
    Bool(bool),
    /// A string or number, stringified by the caller.
    Text(String),
    /// No value at all — equivalent to `false`, emits nothing. Exists so
    /// callers can represent an explicit "unset" distinct from omitting the
    /// key entirely.
    Null,
    /// Emit the encoding of each element in turn, under the same key.
    List(Vec<OptionValue>),
    /// A per-line callback, valid only as the value of a `$onStdout` /
    /// `$onStderr` executor control — never encoded as a git argument.
    Callback(Arc<dyn Fn(&str) + Send + Sync>),
}

impl fmt::Debug for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            OptionValue::Text(s) => f.debug_tuple("Text").field(s).finish(),
            OptionValue::Null => write!(f, "Null"),
            OptionValue::List(items) => f.debug_tuple("List").field(items).finish(),
            OptionValue::Callback(_) => write!(f, "Callback(..)"),
        }
    }
}

impl PartialEq for OptionValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (OptionValue::Bool(a), OptionValue::Bool(b)) => a == b,
            (OptionValue::Text(a), OptionValue::Text(b)) => a == b,
            (OptionValue::Null, OptionValue::Null) => true,
            (OptionValue::List(a), OptionValue::List(b)) => a == b,
            (OptionValue::Callback(a), OptionValue::Callback(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for OptionValue {
    fn from(b: bool) -> Self {
        OptionValue::Bool(b)
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        OptionValue::Text(s.to_owned())
    }
}

impl From<String> for OptionValue {
    fn from(s: String) -> Self {
        OptionValue::Text(s)
    }
}

impl From<i64> for OptionValue {
    fn from(n: i64) -> Self {
        OptionValue::Text(n.to_string())
    }
}

impl<T: Into<OptionValue>> From<Vec<T>> for OptionValue {
    fn from(items: Vec<T>) -> Self {
        OptionValue::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<Arc<dyn Fn(&str) + Send + Sync>> for OptionValue {
    fn from(f: Arc<dyn Fn(&str) + Send + Sync>) -> Self {
        OptionValue::Callback(f)
    }
}

/// An ordered mapping of option name to value. Iteration order is
/// significant: it determines argv emission order, and callers rely on this
/// to interleave options with positional arguments (see `exec`'s `ArgToken`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GitOptions(pub Vec<(String, OptionValue)>);

impl GitOptions {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.0.push((key.into(), value.into()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, OptionValue)> {
        self.0.iter()
    }

    /// Keys prefixed with `$` are executor controls, not git options. Split
    /// them out before encoding.
    pub fn partition_executor_controls(self) -> (GitOptions, Vec<(String, OptionValue)>) {
        let mut git_opts = Vec::new();
        let mut controls = Vec::new();
        for (k, v) in self.0 {
            if let Some(stripped) = k.strip_prefix('$') {
                controls.push((stripped.to_owned(), v));
            } else {
                git_opts.push((k, v));
            }
        }
        (GitOptions(git_opts), controls)
    }

    /// Encode into argv tokens.
    pub fn encode(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (key, value) in &self.0 {
            encode_value(key, value, &mut out);
        }
        out
    }
}

impl FromIterator<(String, OptionValue)> for GitOptions {
    fn from_iter<I: IntoIterator<Item = (String, OptionValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn encode_value(key: &str, value: &OptionValue, out: &mut Vec<String>) {
    match value {
        OptionValue::List(items) => {
            for item in items {
                encode_value(key, item, out);
            }
        }
        OptionValue::Null => {}
        OptionValue::Bool(false) => {}
        OptionValue::Bool(true) => {
            if is_short(key) {
                out.push(format!("-{key}"));
            } else {
                out.push(format!("--{key}"));
            }
        }
        OptionValue::Text(v) => {
            if is_short(key) {
                out.push(format!("-{key}"));
                out.push(v.clone());
            } else {
                out.push(format!("--{key}={v}"));
            }
        }
        // Callbacks are executor controls, always stripped out by
        // `partition_executor_controls` before a `GitOptions` reaches here.
        OptionValue::Callback(_) => {}
    }
}

fn is_short(key: &str) -> bool {
    key.chars().count() == 1
}

impl fmt::Display for GitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode().join(" "))
    }
}

/// Best-effort inverse of [`GitOptions::encode`], used to test that encoding
/// round-trips.
///
/// This cannot be a true inverse in general: `Bool(false)`, `Null`, and an
/// absent key all encode to nothing, so decoding can only ever recover
/// "present" keys. Given that caveat, `decode` reconstructs short options
/// greedily: a short flag followed by a token that doesn't itself look like
/// an option is treated as that flag's value, matching how every call site
/// in this crate actually shapes its arguments.
///
/// Returns the recovered options plus the remaining (positional) tokens.
pub fn decode(argv: &[String]) -> (GitOptions, Vec<String>) {
    let mut opts = Vec::new();
    let mut rest = Vec::new();
    let mut iter = argv.iter().peekable();
    while let Some(tok) = iter.next() {
        if let Some(long) = tok.strip_prefix("--") {
            if let Some((key, val)) = long.split_once('=') {
                opts.push((key.to_owned(), OptionValue::Text(val.to_owned())));
            } else {
                opts.push((long.to_owned(), OptionValue::Bool(true)));
            }
        } else if let Some(short) = tok.strip_prefix('-') {
            if short.chars().count() == 1 {
                match iter.peek() {
                    Some(next) if !next.starts_with('-') => {
                        opts.push((short.to_owned(), OptionValue::Text((*next).clone())));
                        iter.next();
                    }
                    _ => opts.push((short.to_owned(), OptionValue::Bool(true))),
                }
            } else {
                rest.push(tok.clone());
            }
        } else {
            rest.push(tok.clone());
        }
    }
    (GitOptions(opts), rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("v", true, &["-v"]; "short flag true")]
    #[test_case("v", false, &[]; "short flag false emits nothing")]
    #[test_case("verbose", true, &["--verbose"]; "long flag true")]
    #[test_case("verbose", false, &[]; "long flag false emits nothing")]
    fn encodes_bool(key: &str, value: bool, expected: &[&str]) {
        let opts = GitOptions::new().push(key, value);
        assert_eq!(opts.encode(), expected);
    }

    #[test]
    fn encodes_short_text_as_two_tokens() {
        let opts = GitOptions::new().push("C", "subdir");
        assert_eq!(opts.encode(), vec!["-C", "subdir"]);
    }

    #[test]
    fn encodes_long_text_as_one_equals_token() {
        let opts = GitOptions::new().push("format", "%H");
        assert_eq!(opts.encode(), vec!["--format=%H"]);
    }

    #[test]
    fn encodes_list_once_per_element_preserving_order() {
        let opts = GitOptions::new().push("x", vec!["a", "b", "c"]);
        assert_eq!(opts.encode(), vec!["-x", "a", "-x", "b", "-x", "c"]);
    }

    #[test]
    fn strips_dollar_prefixed_keys_before_encoding() {
        let opts = GitOptions::new()
            .push("$spawn", true)
            .push("porcelain", true);
        let (git_opts, controls) = opts.partition_executor_controls();
        assert_eq!(git_opts.encode(), vec!["--porcelain"]);
        assert_eq!(controls, vec![("spawn".to_owned(), OptionValue::Bool(true))]);
    }

    #[test]
    fn decode_round_trips_present_keys() {
        let opts = GitOptions::new()
            .push("C", "subdir")
            .push("format", "%H")
            .push("v", true);
        let (decoded, rest) = decode(&opts.encode());
        assert_eq!(decoded, opts);
        assert!(rest.is_empty());
    }

    #[test]
    fn decode_separates_positional_leftovers() {
        let argv = vec!["--porcelain".to_owned(), "HEAD".to_owned()];
        let (opts, rest) = decode(&argv);
        assert_eq!(opts, GitOptions::new().push("porcelain", true));
        assert_eq!(rest, vec!["HEAD".to_owned()]);
    }
}
