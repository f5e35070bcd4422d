//! Security Module
//!
//! Validation at the points where untrusted client input enters the relay:
//! - Model identifiers requested by clients (checked against the allow-list)
//! - Raw inbound frames (checked against the size limit)
//!
//! # Design Philosophy
//!
//! Validation never raises. A failed check is reported as a value and the
//! caller decides how to surface it (an `error` unit on the WebSocket, an
//! HTTP 400 on the synchronous endpoint).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Result of input validation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationResult {
    /// Input is valid
    Valid,
    /// Input is invalid with reason
    Invalid(String),
}

impl ValidationResult {
    /// Check if the result indicates valid input
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Get the error message if invalid
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Valid => None,
            Self::Invalid(msg) => Some(msg),
        }
    }
}

/// The fixed set of model identifiers the relay may request upstream
///
/// Built once from configuration and never mutated afterwards. Sessions hold
/// it through the shared, immutable [`crate::config::RelayConfig`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllowList {
    models: BTreeSet<String>,
}

impl AllowList {
    /// Create an allow-list from any collection of model identifiers
    pub fn new<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            models: models.into_iter().map(Into::into).collect(),
        }
    }

    /// Check whether a model identifier is allowed
    ///
    /// Matching is exact and case-sensitive, as upstream model ids are.
    #[must_use]
    pub fn contains(&self, model: &str) -> bool {
        self.models.contains(model)
    }

    /// Validate a requested model, producing a client-facing reason on failure
    #[must_use]
    pub fn validate(&self, model: &str) -> ValidationResult {
        if self.contains(model) {
            ValidationResult::Valid
        } else {
            ValidationResult::Invalid(format!(
                "Model '{model}' is not allowed. Accepted models are: {}",
                self.joined()
            ))
        }
    }

    /// Number of allowed models
    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the allow-list is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Iterate over allowed models in sorted order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(String::as_str)
    }

    fn joined(&self) -> String {
        self.iter().collect::<Vec<_>>().join(", ")
    }
}

/// Check an inbound frame against the configured size limit
#[must_use]
pub fn validate_frame_size(frame: &str, max_message_size: usize) -> ValidationResult {
    if frame.len() > max_message_size {
        return ValidationResult::Invalid(format!(
            "Message too large: {} bytes (max: {max_message_size})",
            frame.len()
        ));
    }
    ValidationResult::Valid
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow_list() -> AllowList {
        AllowList::new(["modelA", "meta-llama/Llama-3.2-1B-Instruct"])
    }

    #[test]
    fn test_allow_list_membership() {
        let list = allow_list();
        assert!(list.contains("modelA"));
        assert!(list.contains("meta-llama/Llama-3.2-1B-Instruct"));
        assert!(!list.contains("modelB"));
        assert!(!list.contains("modela"));
        assert!(!list.contains(""));
    }

    #[test]
    fn test_allow_list_validate_reason_names_model() {
        let result = allow_list().validate("modelB");
        assert!(!result.is_valid());
        let reason = result.error_message().unwrap();
        assert!(reason.contains("'modelB' is not allowed"));
        assert!(reason.contains("modelA"));
    }

    #[test]
    fn test_allow_list_validate_allowed() {
        assert_eq!(allow_list().validate("modelA"), ValidationResult::Valid);
    }

    #[test]
    fn test_allow_list_deduplicates() {
        let list = AllowList::new(["a", "a", "b"]);
        assert_eq!(list.len(), 2);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_allow_list_serde_transparent() {
        let list: AllowList = serde_json::from_str(r#"["x", "y"]"#).unwrap();
        assert!(list.contains("x"));
        assert_eq!(serde_json::to_string(&list).unwrap(), r#"["x","y"]"#);
    }

    #[test]
    fn test_frame_size_limit() {
        assert!(validate_frame_size("abc", 3).is_valid());
        let result = validate_frame_size("abcd", 3);
        assert!(result.error_message().unwrap().contains("too large"));
    }
}
