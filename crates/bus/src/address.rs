use std::fmt;

use crate::error::BusError;

/// A parsed bus address: a destination name plus an optional subject filter.
///
/// The textual form is `name` or `name/subject-prefix`. The filter only has
/// meaning when `name` is a topic exchange; on a queue it is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub name: String,
    pub subject_filter: Option<String>,
}

impl Address {
    pub fn parse(raw: &str) -> Result<Self, BusError> {
        let (name, filter) = match raw.split_once('/') {
            Some((name, filter)) => (name, Some(filter)),
            None => (raw, None),
        };

        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(BusError::InvalidAddress(raw.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            subject_filter: filter.map(str::to_string),
        })
    }

    /// Whether a message subject passes this address's filter.
    /// An absent or empty filter matches everything.
    pub fn matches(&self, subject: &str) -> bool {
        subject_matches(self.subject_filter.as_deref(), subject)
    }
}

/// Prefix match used by exchange bindings; `*` as the whole filter also
/// matches everything.
pub(crate) fn subject_matches(filter: Option<&str>, subject: &str) -> bool {
    match filter {
        None | Some("") | Some("*") => true,
        Some(prefix) => subject.starts_with(prefix),
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subject_filter {
            Some(filter) => write!(f, "{}/{}", self.name, filter),
            None => write!(f, "{}", self.name),
        }
    }
}
