//! Label sets attached to services and label links

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single `name=value` label
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// An ordered set of labels
///
/// Labels are kept sorted so two sets with the same members compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelSet {
    labels: Vec<Label>,
}

impl LabelSet {
    pub fn new(labels: impl IntoIterator<Item = Label>) -> Self {
        let mut labels: Vec<Label> = labels.into_iter().collect();
        labels.sort();
        labels.dedup();
        Self { labels }
    }

    /// Parse a comma separated list of `name=value` pairs
    ///
    /// Names are lowercased. An entry without `=` becomes a label with an
    /// empty value.
    pub fn parse(input: &str) -> Self {
        Self::new(
            input
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| match part.split_once('=') {
                    Some((name, value)) => Label::new(name.trim().to_lowercase(), value.trim()),
                    None => Label::new(part.to_lowercase(), ""),
                }),
        )
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Whether every label in `other` is also in this set
    pub fn matches(&self, other: &LabelSet) -> bool {
        other.labels.iter().all(|label| self.labels.contains(label))
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, label) in self.labels.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", label)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sorts_and_normalizes() {
        let set = LabelSet::parse("Service=www, env=prod");

        assert_eq!(set.to_string(), "env=prod,service=www");
        assert_eq!(set, LabelSet::parse("env=prod,service=www"));
    }

    #[test]
    fn test_parse_ignores_empty_entries() {
        let set = LabelSet::parse(",env=prod,,");
        assert_eq!(set.labels().len(), 1);
        assert!(LabelSet::parse("").is_empty());
    }

    #[test]
    fn test_matches_subset() {
        let set = LabelSet::parse("env=prod,service=www,region=us");

        assert!(set.matches(&LabelSet::parse("service=www")));
        assert!(set.matches(&LabelSet::default()));
        assert!(!set.matches(&LabelSet::parse("service=api")));
    }
}
