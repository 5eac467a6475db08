use sha2::{Digest, Sha256};
use std::fmt::{self, Display};

/// Structured cache key.
///
/// Every parameter that shapes a result goes in as a named part, in a fixed order. The
/// rendered key is `namespace:<sha256 of the parts>`, so two requests share an entry only
/// when all of their parameters agree, and user input never appears raw in Redis keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    namespace: &'static str,
    parts: Vec<(&'static str, Option<String>)>,
}

impl CacheKey {
    pub fn new(namespace: &'static str) -> Self {
        Self {
            namespace,
            parts: Vec::new(),
        }
    }

    /// Key for a single entity, e.g. `product:<uuid>`
    pub fn entity(namespace: &'static str, id: impl Display) -> String {
        format!("{}:{}", namespace, id)
    }

    pub fn part(mut self, name: &'static str, value: impl Display) -> Self {
        self.parts.push((name, Some(value.to_string())));
        self
    }

    /// An absent value renders differently from any present one, including the empty string.
    pub fn opt_part<T: Display>(mut self, name: &'static str, value: Option<T>) -> Self {
        self.parts.push((name, value.map(|v| v.to_string())));
        self
    }

    fn canonical(&self) -> String {
        self.parts
            .iter()
            .map(|(name, value)| match value {
                Some(v) => format!("{}={}", name, v),
                None => (*name).to_string(),
            })
            .collect::<Vec<_>>()
            .join("\u{1f}")
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digest = Sha256::digest(self.canonical().as_bytes());
        write!(f, "{}:{}", self.namespace, hex::encode(digest))
    }
}
