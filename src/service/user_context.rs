//! Caller context extracted from request headers

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::metadata::UserId;

/// Identity of the caller plus request-scoped values used for logging.
/// New fields can be added here without changing handler signatures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallerContext {
    pub caller_id: UserId,
    /// Correlation id, taken from `X-Request-Id` or generated
    pub request_id: String,
    /// Additional request headers
    pub metadata: HashMap<String, String>,
}

impl CallerContext {
    pub fn new(caller_id: impl Into<UserId>) -> Self {
        Self {
            caller_id: caller_id.into(),
            request_id: Uuid::new_v4().to_string(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_request_id(caller_id: impl Into<UserId>, request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Self::new(caller_id)
        }
    }

    pub fn set_metadata(&mut self, key: String, value: String) {
        self.metadata.insert(key, value);
    }

    pub fn get_metadata(&self, key: &str) -> Option<&String> {
        self.metadata.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_request_ids_differ() {
        let a = CallerContext::new("u1");
        let b = CallerContext::new("u1");
        assert_eq!(a.caller_id, "u1");
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn test_explicit_request_id_and_metadata() {
        let mut ctx = CallerContext::with_request_id("u1", "req-7");
        ctx.set_metadata("user-agent".into(), "tests".into());
        assert_eq!(ctx.request_id, "req-7");
        assert_eq!(ctx.get_metadata("user-agent").map(String::as_str), Some("tests"));
        assert!(ctx.get_metadata("missing").is_none());
    }
}
