//! Outbound publish route descriptor.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::Signal;

/// An outbound publish route within a connection.
///
/// A domain signal is delivered to this target when its subject predicate
/// matches; the signal is reverse-mapped, header-mapped and published to
/// `address`. Zero matching targets is not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Address pattern to publish to.
    pub address: String,
    /// Subjects this target accepts; a signal matches when it carries at
    /// least one of them. An empty list matches nothing.
    #[serde(default)]
    pub subjects: Vec<String>,
    /// Reverse-direction mapping reference into the mapping context.
    #[serde(default)]
    pub mapping: Option<String>,
    /// Static headers attached to every published message, plus
    /// `{{ header:<name> }}` placeholders resolved from the signal.
    #[serde(default)]
    pub header_mapping: HashMap<String, String>,
}

impl Target {
    /// Route publishing to `address` for the given subjects.
    pub fn new(address: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            address: address.into(),
            subjects,
            mapping: None,
            header_mapping: HashMap::new(),
        }
    }

    /// Subject-matching predicate: at least one of the signal's subjects
    /// must be listed on the target.
    pub fn matches(&self, signal: &Signal) -> bool {
        signal
            .authorization_subjects
            .iter()
            .any(|s| self.subjects.iter().any(|t| t == s))
    }

    /// Resolves the header mapping against a signal's headers.
    ///
    /// Values of the form `{{ header:<name> }}` are replaced by the named
    /// signal header; entries whose placeholder cannot be resolved are
    /// dropped rather than published with a dangling template.
    pub fn map_headers(&self, signal: &Signal) -> HashMap<String, String> {
        let mut out = HashMap::with_capacity(self.header_mapping.len());
        for (name, value) in &self.header_mapping {
            let resolved = match parse_placeholder(value) {
                Some(header) => signal
                    .headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(header))
                    .map(|(_, v)| v.clone()),
                None => Some(value.clone()),
            };
            if let Some(v) = resolved {
                out.insert(name.clone(), v);
            }
        }
        out
    }
}

fn parse_placeholder(value: &str) -> Option<&str> {
    let inner = value.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    inner.trim().strip_prefix("header:").map(str::trim)
}
