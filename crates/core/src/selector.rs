//! Label selectors used to filter listings and watches.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelSelectorOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
}

/// One selector term: key + operator + value set.
///
/// `Equals`/`NotEquals` compare against the first value (an empty value set
/// degrades to a key-presence test); `Contains`/`NotContains` test set
/// membership of the label value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    pub key: String,
    pub operator: LabelSelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl LabelSelector {
    pub fn equals(key: &str, value: &str) -> Self {
        Self { key: key.into(), operator: LabelSelectorOperator::Equals, values: vec![value.into()] }
    }

    pub fn not_equals(key: &str, value: &str) -> Self {
        Self { key: key.into(), operator: LabelSelectorOperator::NotEquals, values: vec![value.into()] }
    }

    pub fn contains(key: &str, values: &[&str]) -> Self {
        Self {
            key: key.into(),
            operator: LabelSelectorOperator::Contains,
            values: values.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn not_contains(key: &str, values: &[&str]) -> Self {
        Self {
            key: key.into(),
            operator: LabelSelectorOperator::NotContains,
            values: values.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let actual = labels.get(&self.key);
        match self.operator {
            LabelSelectorOperator::Equals => match (actual, self.values.first()) {
                (Some(a), Some(v)) => a == v,
                (Some(_), None) => true,
                (None, _) => false,
            },
            LabelSelectorOperator::NotEquals => match (actual, self.values.first()) {
                (Some(a), Some(v)) => a != v,
                (Some(_), None) => false,
                (None, _) => true,
            },
            LabelSelectorOperator::Contains => actual.map(|a| self.values.contains(a)).unwrap_or(false),
            LabelSelectorOperator::NotContains => actual.map(|a| !self.values.contains(a)).unwrap_or(true),
        }
    }
}

/// All selectors must match (conjunction). An empty slice matches anything.
pub fn match_all(selectors: &[LabelSelector], labels: &BTreeMap<String, String>) -> bool {
    selectors.iter().all(|s| s.matches(labels))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn equals_and_presence() {
        let l = labels(&[("app", "web")]);
        assert!(LabelSelector::equals("app", "web").matches(&l));
        assert!(!LabelSelector::equals("app", "db").matches(&l));
        assert!(!LabelSelector::equals("tier", "x").matches(&l));
        // empty values -> presence check
        let presence = LabelSelector { key: "app".into(), operator: LabelSelectorOperator::Equals, values: vec![] };
        assert!(presence.matches(&l));
    }

    #[test]
    fn not_equals_matches_absent_keys() {
        let l = labels(&[("app", "web")]);
        assert!(LabelSelector::not_equals("app", "db").matches(&l));
        assert!(!LabelSelector::not_equals("app", "web").matches(&l));
        assert!(LabelSelector::not_equals("tier", "x").matches(&l));
    }

    #[test]
    fn set_membership() {
        let l = labels(&[("env", "staging")]);
        assert!(LabelSelector::contains("env", &["prod", "staging"]).matches(&l));
        assert!(!LabelSelector::contains("env", &["prod"]).matches(&l));
        assert!(LabelSelector::not_contains("env", &["prod"]).matches(&l));
        assert!(LabelSelector::not_contains("region", &["eu"]).matches(&l));
    }

    #[test]
    fn conjunction() {
        let l = labels(&[("app", "web"), ("env", "prod")]);
        let sels = vec![LabelSelector::equals("app", "web"), LabelSelector::equals("env", "prod")];
        assert!(match_all(&sels, &l));
        let sels = vec![LabelSelector::equals("app", "web"), LabelSelector::equals("env", "staging")];
        assert!(!match_all(&sels, &l));
        assert!(match_all(&[], &l));
    }
}
