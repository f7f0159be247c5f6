//! Per-session record of optional hub methods the server does not implement.

use std::collections::HashMap;

use crate::protocol::Completion;

/// Structured error codes that mean "this hub method does not exist".
const MISSING_METHOD_CODES: &[&str] = &["methodnotfound", "unsupportedmethod"];

/// Free-text fallbacks for servers that only send an error message.
const MISSING_METHOD_PHRASES: &[&str] = &[
    "does not exist",
    "method not found",
    "unknown method",
    "not supported",
];

/// Optimistic capability map: a method is supported until the server says otherwise.
#[derive(Debug, Default, Clone)]
pub struct CapabilityFlags {
    supported: HashMap<String, bool>,
}

impl CapabilityFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_supported(&self, method: &str) -> bool {
        self.supported.get(method).copied().unwrap_or(true)
    }

    pub fn mark_unsupported(&mut self, method: &str) {
        self.supported.insert(method.to_string(), false);
    }

    pub fn unsupported(&self) -> impl Iterator<Item = &str> {
        self.supported
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(name, _)| name.as_str())
    }
}

/// Whether a completion error means the server lacks the invoked method.
///
/// A structured `errorCode` wins when present; otherwise the message text is matched.
pub fn is_missing_method(completion: &Completion) -> bool {
    if let Some(code) = completion.error_code.as_deref() {
        let normalized: String = code
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        return MISSING_METHOD_CODES.contains(&normalized.as_str());
    }
    match completion.error.as_deref() {
        Some(message) => {
            let message = message.to_ascii_lowercase();
            MISSING_METHOD_PHRASES.iter().any(|p| message.contains(p))
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(error: Option<&str>, code: Option<&str>) -> Completion {
        Completion {
            invocation_id: "1".into(),
            result: None,
            error: error.map(String::from),
            error_code: code.map(String::from),
        }
    }

    #[test]
    fn optimistic_until_flagged() {
        let mut flags = CapabilityFlags::new();
        assert!(flags.is_supported("JoinTopic"));
        flags.mark_unsupported("JoinTopic");
        assert!(!flags.is_supported("JoinTopic"));
        assert!(flags.is_supported("LeaveTopic"));
        assert_eq!(flags.unsupported().collect::<Vec<_>>(), vec!["JoinTopic"]);
    }

    #[test]
    fn structured_code_is_authoritative() {
        assert!(is_missing_method(&completion(None, Some("MethodNotFound"))));
        assert!(is_missing_method(&completion(None, Some("method_not_found"))));
        // a code that says something else wins over a misleading message
        assert!(!is_missing_method(&completion(
            Some("topic does not exist"),
            Some("NotFound")
        )));
    }

    #[test]
    fn text_fallback() {
        assert!(is_missing_method(&completion(
            Some("Failed to invoke 'JoinTopic' because it does not exist on the hub."),
            None
        )));
        assert!(is_missing_method(&completion(Some("Method not found"), None)));
        assert!(!is_missing_method(&completion(Some("Unauthorized"), None)));
        assert!(!is_missing_method(&completion(None, None)));
    }
}
