use chrono::{DateTime, Utc};

/// Display name resolved last-writer-wins by the timestamp carried on the
/// signal, not by arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedName {
    name: String,
    at: DateTime<Utc>,
}

impl ResolvedName {
    pub fn new(name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            at,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Applies `candidate` unless it is blank or older than the held name.
    /// Equal timestamps favour the later arrival.
    pub fn offer(&mut self, candidate: &str, at: DateTime<Utc>) -> bool {
        let candidate = candidate.trim();
        if candidate.is_empty() || at < self.at {
            return false;
        }
        self.name = candidate.to_string();
        self.at = at;
        true
    }
}
