//! Label sets and label matchers.
//!
//! A `Labels` value identifies one series. Names are kept sorted so two label
//! sets with the same pairs compare and hash equal regardless of how they
//! were built.

use std::fmt;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// Reserved label holding the metric name.
pub const METRIC_NAME: &str = "__name__";

/// Label holding the upper bound of a classic histogram bucket.
pub const BUCKET_LABEL: &str = "le";

/// Label names are `[a-zA-Z_][a-zA-Z0-9_]*`.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Error)]
pub enum MatcherError {
    #[error("Invalid regex in matcher for {0}: {1}")]
    InvalidRegex(String, regex::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Builds a label set from pairs. Later duplicates replace earlier ones.
    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        let mut labels = Self::empty();
        for (name, value) in pairs {
            labels.set(name.into(), value.into());
        }
        labels
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    /// Sets `name` to `value`. An empty value removes the label.
    pub fn set(&mut self, name: String, value: String) {
        match self.0.binary_search_by(|l| l.name.as_str().cmp(&name)) {
            Ok(i) if value.is_empty() => {
                self.0.remove(i);
            }
            Ok(i) => self.0[i].value = value,
            Err(_) if value.is_empty() => {}
            Err(i) => self.0.insert(i, Label { name, value }),
        }
    }

    /// Returns a copy without the metric name.
    pub fn drop_metric_name(&self) -> Labels {
        self.without(&[METRIC_NAME])
    }

    /// Returns a copy without any of `names`.
    pub fn without<S: AsRef<str>>(&self, names: &[S]) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|l| !names.iter().any(|n| n.as_ref() == l.name))
                .cloned()
                .collect(),
        )
    }

    /// Returns a copy holding only `names`.
    pub fn keep<S: AsRef<str>>(&self, names: &[S]) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|l| names.iter().any(|n| n.as_ref() == l.name))
                .cloned()
                .collect(),
        )
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, l) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", l.name, l.value)?;
        }
        write!(f, "}}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    Equal,
    NotEqual,
    Regex,
    NotRegex,
}

impl fmt::Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MatchOp::Equal => "=",
            MatchOp::NotEqual => "!=",
            MatchOp::Regex => "=~",
            MatchOp::NotRegex => "!~",
        };
        f.write_str(s)
    }
}

/// Selects series by comparing one label against a value or a regex.
#[derive(Debug, Clone)]
pub struct Matcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
    regex: Option<Regex>,
}

impl Matcher {
    pub fn new(op: MatchOp, name: impl Into<String>, value: impl Into<String>) -> Result<Self, MatcherError> {
        let name = name.into();
        let value = value.into();
        let regex = match op {
            MatchOp::Regex | MatchOp::NotRegex => Some(
                Regex::new(&format!("^(?:{})$", value))
                    .map_err(|e| MatcherError::InvalidRegex(name.clone(), e))?,
            ),
            MatchOp::Equal | MatchOp::NotEqual => None,
        };
        Ok(Self { name, op, value, regex })
    }

    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::Equal,
            value: value.into(),
            regex: None,
        }
    }

    /// Checks a label value. A missing label is matched as the empty string.
    pub fn matches(&self, value: &str) -> bool {
        match (&self.op, &self.regex) {
            (MatchOp::Equal, _) => self.value == value,
            (MatchOp::NotEqual, _) => self.value != value,
            (MatchOp::Regex, Some(re)) => re.is_match(value),
            (MatchOp::NotRegex, Some(re)) => !re.is_match(value),
            (_, None) => false,
        }
    }

    pub fn matches_labels(&self, labels: &Labels) -> bool {
        self.matches(labels.get(&self.name).unwrap_or(""))
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.op, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_are_sorted_and_deduplicated() {
        let labels = Labels::from_pairs([("job", "api"), ("__name__", "up"), ("job", "db")]);
        assert_eq!(labels.iter().count(), 2);
        assert_eq!(labels.get("job"), Some("db"));
        assert_eq!(labels.to_string(), r#"{__name__="up", job="db"}"#);
    }

    #[test]
    fn test_without_and_keep() {
        let labels = Labels::from_pairs([("__name__", "up"), ("job", "api"), ("instance", "a")]);
        assert_eq!(labels.drop_metric_name(), Labels::from_pairs([("job", "api"), ("instance", "a")]));
        assert_eq!(labels.keep(&["job"]), Labels::from_pairs([("job", "api")]));
        assert_eq!(labels.without(&["job", "instance"]), Labels::from_pairs([("__name__", "up")]));
    }

    #[test]
    fn test_set_empty_value_removes_label() {
        let mut labels = Labels::from_pairs([("a", "1"), ("b", "2")]);
        labels.set("a".to_string(), String::new());
        assert_eq!(labels, Labels::from_pairs([("b", "2")]));
    }

    #[test]
    fn test_matchers() {
        let labels = Labels::from_pairs([("job", "api-server")]);
        assert!(Matcher::equal("job", "api-server").matches_labels(&labels));
        assert!(Matcher::new(MatchOp::Regex, "job", "api-.*").unwrap().matches_labels(&labels));
        assert!(!Matcher::new(MatchOp::Regex, "job", "api").unwrap().matches_labels(&labels));
        assert!(Matcher::new(MatchOp::NotRegex, "job", "db.*").unwrap().matches_labels(&labels));
        assert!(Matcher::new(MatchOp::NotEqual, "env", "prod").unwrap().matches_labels(&labels));
        assert!(Matcher::equal("env", "").matches_labels(&labels));
        assert!(Matcher::new(MatchOp::Regex, "job", "(").is_err());
    }
}
