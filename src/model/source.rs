//! Inbound subscription descriptor.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Header allow/deny filter applied to inbound signals.
///
/// Evaluation order: an empty `allow` list admits every header, otherwise
/// only listed names pass; `deny` is applied afterwards and always wins.
/// Matching is case-insensitive, as header names are on most transports.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeaderFilter {
    /// Header names to admit (empty = admit all).
    #[serde(default)]
    pub allow: Vec<String>,
    /// Header names to strip, applied after `allow`.
    #[serde(default)]
    pub deny: Vec<String>,
}

impl HeaderFilter {
    /// Returns the headers that survive the filter.
    pub fn apply(&self, headers: &HashMap<String, String>) -> HashMap<String, String> {
        headers
            .iter()
            .filter(|(name, _)| self.admits(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    fn admits(&self, name: &str) -> bool {
        let allowed = self.allow.is_empty()
            || self.allow.iter().any(|a| a.eq_ignore_ascii_case(name));
        let denied = self.deny.iter().any(|d| d.eq_ignore_ascii_case(name));
        allowed && !denied
    }
}

/// An inbound subscription within a connection.
///
/// Consuming from `address` produces domain signals stamped with
/// `authorization_subjects`, filtered by `header_filter` and transformed by
/// the mapping referenced in `mapping` (identity when unset).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Address pattern to consume from (queue, topic filter, path).
    pub address: String,
    /// Authorization subjects stamped onto every produced signal.
    #[serde(default)]
    pub authorization_subjects: Vec<String>,
    /// Mapping reference into the connection's mapping context.
    #[serde(default)]
    pub mapping: Option<String>,
    /// Header allow/deny filter.
    #[serde(default)]
    pub header_filter: HeaderFilter,
    /// Optional condition of the form `header=value`; a message that does
    /// not carry the header with exactly that value is skipped (not an
    /// error). Absent condition means "always pass".
    #[serde(default)]
    pub condition: Option<String>,
    /// Optional dead-letter address for payloads that fail mapping.
    #[serde(default)]
    pub dead_letter: Option<String>,
}

impl Source {
    /// Subscription with the given address and subjects, identity mapping.
    pub fn new(address: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            address: address.into(),
            authorization_subjects: subjects,
            mapping: None,
            header_filter: HeaderFilter::default(),
            condition: None,
            dead_letter: None,
        }
    }

    /// Checks the optional `header=value` condition against headers.
    pub fn condition_passes(&self, headers: &HashMap<String, String>) -> bool {
        match &self.condition {
            None => true,
            Some(cond) => match cond.split_once('=') {
                Some((name, value)) => headers
                    .iter()
                    .any(|(k, v)| k.eq_ignore_ascii_case(name.trim()) && v == value.trim()),
                // A malformed condition never matches; misconfiguration
                // must not let messages through unchecked.
                None => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_filter_admits_everything() {
        let filter = HeaderFilter::default();
        let h = headers(&[("content-type", "text/plain"), ("x-trace", "abc")]);
        assert_eq!(filter.apply(&h), h);
    }

    #[test]
    fn deny_wins_over_allow() {
        let filter = HeaderFilter {
            allow: vec!["x-keep".into(), "x-secret".into()],
            deny: vec!["X-Secret".into()],
        };
        let h = headers(&[("x-keep", "1"), ("x-secret", "2"), ("x-other", "3")]);
        let out = filter.apply(&h);
        assert_eq!(out.len(), 1);
        assert!(out.contains_key("x-keep"));
    }

    #[test]
    fn condition_matches_exact_header_value() {
        let mut source = Source::new("telemetry/#", vec!["device".into()]);
        source.condition = Some("x-kind=measurement".into());
        assert!(source.condition_passes(&headers(&[("X-Kind", "measurement")])));
        assert!(!source.condition_passes(&headers(&[("x-kind", "alarm")])));
        assert!(!source.condition_passes(&headers(&[])));
    }

    #[test]
    fn malformed_condition_never_passes() {
        let mut source = Source::new("telemetry/#", vec![]);
        source.condition = Some("not-a-condition".into());
        assert!(!source.condition_passes(&headers(&[("not-a-condition", "")])));
    }
}
