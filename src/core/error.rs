use crate::core::model::EntityRef;
use thiserror::Error;

/// Core error types for zonefw
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed spec or policy invariant violation; blocks only the offending entity
    #[error("Validation error in {entity}: {message}")]
    Validation { entity: String, message: String },

    /// Internal inconsistency such as a reference to a missing zone or set
    #[error("Compilation error in {entity}: {message}")]
    Compilation { entity: String, message: String },

    /// External command exited non-zero or could not be spawned
    #[error("{program} failed: {message}")]
    Command {
        program: String,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// External command exceeded its per-directive deadline
    #[error("{program} timed out after {after_ms}ms")]
    Timeout { program: String, after_ms: u64 },

    /// Divergence between desired and live state that could not be corrected
    #[error("Drift in {entity}: {message}")]
    Drift { entity: String, message: String },

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// Invalid entity lifecycle transition
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(entity: impl ToString, message: impl Into<String>) -> Self {
        Self::Validation {
            entity: entity.to_string(),
            message: message.into(),
        }
    }

    pub fn compilation(entity: impl ToString, message: impl Into<String>) -> Self {
        Self::Compilation {
            entity: entity.to_string(),
            message: message.into(),
        }
    }

    pub fn drift(entity: &EntityRef, message: impl Into<String>) -> Self {
        Self::Drift {
            entity: entity.to_string(),
            message: message.into(),
        }
    }

    /// Non-zero exit, spawn failure, or timeout of an enforcement command
    pub fn is_apply_error(&self) -> bool {
        matches!(
            self,
            Self::Command { .. } | Self::Timeout { .. } | Self::Elevation(_)
        )
    }

    /// The most specific text available for pattern matching against known failures
    pub fn detail(&self) -> String {
        match self {
            Self::Command {
                stderr: Some(stderr),
                ..
            } if !stderr.trim().is_empty() => stderr.clone(),
            other => other.to_string(),
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of nft/tc failure patterns and their translations
pub struct CommandErrorPattern;

impl CommandErrorPattern {
    /// Matches an error message against known patterns and returns an operator-facing translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify the packet filter")
                .with_suggestion("Run as root or set ZONEFW_ELEVATION_METHOD=sudo")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        if lower.contains("cache initialization failed") {
            return ErrorTranslation::new(
                "Failed to initialize nftables cache - insufficient privileges",
            )
            .with_suggestion("This usually means you need elevated privileges");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("nft or tc is not installed or not found in PATH")
                .with_suggestion("Install nftables and iproute2")
                .with_suggestion("Or point nft_command/tc_command in config.json at the binaries");
        }

        if lower.contains("timed out") || lower.contains("timeout") {
            return ErrorTranslation::new("Command timed out")
                .with_suggestion("Raise command_timeout_ms in config.json")
                .with_suggestion("Check system load: uptime");
        }

        if lower.contains("could not process rule") || lower.contains("syntax error") {
            return ErrorTranslation::new("Invalid packet filter rule syntax")
                .with_suggestion("Run `zonefw export` and inspect the offending rule")
                .with_suggestion("Verify port numbers are between 1 and 65535");
        }

        if lower.contains("invalid lhs of relational") {
            return ErrorTranslation::new("Protocol mismatch - trying to match incompatible field")
                .with_suggestion("Use TCP or UDP protocol when matching ports");
        }

        if lower.contains("set") && lower.contains("does not exist") {
            return ErrorTranslation::new("Referenced ipset does not exist")
                .with_suggestion("Enable the ipset or remove the @reference from the rule");
        }

        if lower.contains("table") && lower.contains("does not exist") {
            return ErrorTranslation::new("Managed table does not exist")
                .with_suggestion("Run `zonefw apply` to rebuild the managed namespace");
        }

        if lower.contains("chain")
            && (lower.contains("does not exist") || lower.contains("not found"))
        {
            return ErrorTranslation::new("Managed chain not found")
                .with_suggestion("Run `zonefw apply` to rebuild the managed namespace");
        }

        if lower.contains("cannot find device") {
            return ErrorTranslation::new("Shaped interface not found")
                .with_suggestion("Check available interfaces: ip link show")
                .with_suggestion("For ingress shaping, create the ifb device first");
        }

        if lower.contains("exclusivity flag on, cannot modify")
            || lower.contains("file exists")
            || lower.contains("already exists")
        {
            return ErrorTranslation::new("Conflicting object already present")
                .with_suggestion("Another tool may manage this interface or table")
                .with_suggestion("Run `zonefw teardown` and reapply");
        }

        if lower.contains("resource busy") {
            return ErrorTranslation::new("Packet filter resource is busy")
                .with_suggestion("Another process may be modifying nftables")
                .with_suggestion("Wait a moment and try again");
        }

        if lower.contains("netlink") {
            return ErrorTranslation::new("Communication error with kernel netlink interface")
                .with_suggestion("Check kernel modules: lsmod | grep -e nf_tables -e sch_htb");
        }

        ErrorTranslation::new(format!("Enforcement error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_command() {
        let translation = CommandErrorPattern::match_error("command not found: nft");
        assert!(translation.user_message.contains("not installed"));
        assert!(translation.suggestions.len() >= 2);
    }

    #[test]
    fn test_syntax_error() {
        let translation = CommandErrorPattern::match_error("could not process rule: syntax error");
        assert!(translation.user_message.contains("Invalid"));
        assert!(
            translation
                .suggestions
                .iter()
                .any(|s| s.contains("zonefw export"))
        );
    }

    #[test]
    fn test_missing_set_before_table() {
        let translation =
            CommandErrorPattern::match_error("Error: Could not process rule: Set 'bad' does not exist");
        // "could not process rule" is checked before the set pattern
        assert!(translation.user_message.contains("syntax"));

        let translation = CommandErrorPattern::match_error("set blocklist does not exist");
        assert!(translation.user_message.contains("ipset"));
    }

    #[test]
    fn test_tc_missing_device() {
        let translation = CommandErrorPattern::match_error("Cannot find device \"ifb0\"");
        assert!(translation.user_message.contains("interface"));
        assert!(translation.suggestions.iter().any(|s| s.contains("ifb")));
    }

    #[test]
    fn test_fallback_keeps_message() {
        let translation = CommandErrorPattern::match_error("something odd");
        assert!(translation.user_message.contains("something odd"));
    }

    #[test]
    fn test_apply_error_classification() {
        let timeout = Error::Timeout {
            program: "nft".into(),
            after_ms: 100,
        };
        assert!(timeout.is_apply_error());
        assert!(!Error::validation("rule:1", "bad").is_apply_error());
    }

    #[test]
    fn test_detail_prefers_stderr() {
        let err = Error::Command {
            program: "nft".into(),
            message: "exit status 1".into(),
            stderr: Some("Error: syntax error".into()),
            exit_code: Some(1),
        };
        assert_eq!(err.detail(), "Error: syntax error");
    }
}
