//! Counter key generation.

/// The store key holding one identifier's counter.
///
/// Keys are `prefix + identifier` with no separator added, so the prefix
/// carries its own delimiter (the default is `rate_limit:`). Identifiers are
/// used verbatim; empty ones map to the bare prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    key: String,
}

impl CounterKey {
    pub fn new(prefix: &str, identifier: &str) -> Self {
        let mut key = String::with_capacity(prefix.len() + identifier.len());
        key.push_str(prefix);
        key.push_str(identifier);
        Self { key }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}
