use serde::{Deserialize, Serialize};

/// Outcome record for a probe operation.
///
/// Semantic invariant, enforced by the constructors: a success carries
/// no reason, a failure always carries one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeLogs {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ProbeLogs {
    pub fn ok() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let reason = if reason.is_empty() {
            "unknown error".to_string()
        } else {
            reason
        };
        Self {
            success: false,
            reason: Some(reason),
        }
    }

    pub fn from_result<T, E: std::fmt::Display>(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(e) => Self::fail(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_has_no_reason() {
        let logs = ProbeLogs::ok();
        assert!(logs.success);
        assert!(logs.reason.is_none());
    }

    #[test]
    fn fail_always_has_reason() {
        let logs = ProbeLogs::fail("HTTP 404");
        assert!(!logs.success);
        assert_eq!(logs.reason.as_deref(), Some("HTTP 404"));

        let logs = ProbeLogs::fail("");
        assert_eq!(logs.reason.as_deref(), Some("unknown error"));
    }

    #[test]
    fn serializes_without_null_reason() {
        let json = serde_json::to_value(ProbeLogs::ok()).unwrap();
        assert_eq!(json, serde_json::json!({"success": true}));
    }
}
