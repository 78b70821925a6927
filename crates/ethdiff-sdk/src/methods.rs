//! The method table — the harness's injection point.

use std::collections::BTreeMap;
use thiserror::Error;

/// A method failure. The message is the client's output for that
/// iteration: the driver compares error strings byte-for-byte like any
/// other result, so divergent failures across clients are findings.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct MethodError(pub String);

impl MethodError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for MethodError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for MethodError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// What a method returns for one input.
pub type MethodResult = Result<Vec<u8>, MethodError>;

/// A registered method implementation.
pub type MethodFn = Box<dyn Fn(&[u8]) -> MethodResult + Send>;

/// Map from method tag to implementation.
///
/// A client registers everything it can compute; the driver's handshake
/// decides which single method the session runs.
#[derive(Default)]
pub struct Methods {
    map: BTreeMap<String, MethodFn>,
}

impl Methods {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an implementation under `tag`, replacing any previous
    /// one. Returns `self` for chaining.
    pub fn insert(
        &mut self,
        tag: impl Into<String>,
        f: impl Fn(&[u8]) -> MethodResult + Send + 'static,
    ) -> &mut Self {
        self.map.insert(tag.into(), Box::new(f));
        self
    }

    /// Remove and return the implementation for `tag`. The harness
    /// takes ownership of the one method the driver selected.
    pub fn take(&mut self, tag: &str) -> Option<MethodFn> {
        self.map.remove(tag)
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        self.map.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_take() {
        let mut methods = Methods::new();
        methods.insert("sha", |input| Ok(input.to_vec()));
        assert_eq!(methods.tags(), vec!["sha"]);

        let f = methods.take("sha").unwrap();
        assert_eq!(f(b"abc").unwrap(), b"abc");
        assert!(methods.is_empty());
    }

    #[test]
    fn take_unknown_tag() {
        let mut methods = Methods::new();
        methods.insert("sha", |input| Ok(input.to_vec()));
        assert!(methods.take("bls12381G1Add").is_none());
    }

    #[test]
    fn insert_replaces() {
        let mut methods = Methods::new();
        methods.insert("sha", |_| Ok(vec![1]));
        methods.insert("sha", |_| Ok(vec![2]));
        assert_eq!(methods.len(), 1);
        let f = methods.take("sha").unwrap();
        assert_eq!(f(b"").unwrap(), vec![2]);
    }

    #[test]
    fn error_message_is_the_display() {
        let err = MethodError::new("input too short for G1 point");
        assert_eq!(err.to_string(), "input too short for G1 point");
    }
}
