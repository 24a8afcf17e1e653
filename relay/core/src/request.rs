//! Stream Requests
//!
//! The inbound trigger for a session. A request is validated before any
//! session exists: a malformed request is answered with a synchronous
//! [`Rejection`], never with a streamed `error` envelope.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Limits applied to inbound requests
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLimits {
    /// Maximum content length in characters (default: 32768)
    pub max_content_length: usize,
    /// Maximum session id length in bytes (default: 128)
    pub max_session_id_length: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_content_length: 32 * 1024,
            max_session_id_length: 128,
        }
    }
}

/// Request to open a response stream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    /// The user's input
    pub content: String,
    /// Conversation this stream continues
    #[serde(alias = "session-id")]
    pub session_id: String,
}

impl StreamRequest {
    /// Create a new request
    pub fn new(content: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            session_id: session_id.into(),
        }
    }

    /// Check the request against `limits`
    ///
    /// # Errors
    ///
    /// Returns the first violated rule.
    pub fn validate(&self, limits: &RequestLimits) -> Result<(), RequestError> {
        if self.content.trim().is_empty() {
            return Err(RequestError::EmptyContent);
        }

        let length = self.content.chars().count();
        if length > limits.max_content_length {
            return Err(RequestError::ContentTooLong {
                length,
                max: limits.max_content_length,
            });
        }

        // Control characters other than ordinary whitespace
        if self
            .content
            .chars()
            .any(|c| c.is_control() && c != '\n' && c != '\t' && c != '\r')
        {
            return Err(RequestError::ControlCharacters);
        }

        if self.session_id.trim().is_empty() {
            return Err(RequestError::MissingSessionId);
        }

        if self.session_id.len() > limits.max_session_id_length {
            return Err(RequestError::SessionIdTooLong {
                length: self.session_id.len(),
                max: limits.max_session_id_length,
            });
        }

        Ok(())
    }
}

/// Reasons a request is rejected before a session starts
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RequestError {
    /// Content is empty or whitespace only
    #[error("content must not be empty")]
    EmptyContent,

    /// Content exceeds the configured maximum
    #[error("content too long: {length} characters (max: {max})")]
    ContentTooLong {
        /// Observed length in characters
        length: usize,
        /// Configured maximum
        max: usize,
    },

    /// Content contains control characters
    #[error("content contains invalid control characters")]
    ControlCharacters,

    /// Session id is empty
    #[error("session id must not be empty")]
    MissingSessionId,

    /// Session id exceeds the configured maximum
    #[error("session id too long: {length} bytes (max: {max})")]
    SessionIdTooLong {
        /// Observed length in bytes
        length: usize,
        /// Configured maximum
        max: usize,
    },

    /// The request line could not be parsed
    #[error("malformed request: {0}")]
    Malformed(String),
}

/// Machine-readable reason for a [`Rejection`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCode {
    /// The request failed validation
    InvalidRequest,
    /// The conversation already has a stream in flight
    SessionBusy,
    /// The relay is at its concurrent session limit
    CapacityExhausted,
    /// The relay is shutting down
    Unavailable,
}

/// Synchronous answer to a request that never became a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Always `"rejected"`, lets clients tell this apart from an envelope
    pub status: String,
    /// Why
    pub code: RejectionCode,
    /// Human-readable detail
    pub message: String,
}

impl Rejection {
    /// Build a rejection
    pub fn new(code: RejectionCode, message: impl Into<String>) -> Self {
        Self {
            status: "rejected".to_string(),
            code,
            message: message.into(),
        }
    }
}

impl From<&RequestError> for Rejection {
    fn from(error: &RequestError) -> Self {
        Self::new(RejectionCode::InvalidRequest, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_request() {
        let request = StreamRequest::new("hello", "s1");
        assert!(request.validate(&RequestLimits::default()).is_ok());
    }

    #[test]
    fn test_empty_and_whitespace_content_rejected() {
        let limits = RequestLimits::default();
        assert_eq!(
            StreamRequest::new("", "s1").validate(&limits),
            Err(RequestError::EmptyContent)
        );
        assert_eq!(
            StreamRequest::new(" \n\t ", "s1").validate(&limits),
            Err(RequestError::EmptyContent)
        );
    }

    #[test]
    fn test_content_length_counts_characters() {
        let limits = RequestLimits {
            max_content_length: 3,
            ..Default::default()
        };

        // Three multi-byte characters are within a three character limit
        assert!(StreamRequest::new("ééé", "s1").validate(&limits).is_ok());
        assert_eq!(
            StreamRequest::new("abcd", "s1").validate(&limits),
            Err(RequestError::ContentTooLong { length: 4, max: 3 })
        );
    }

    #[test]
    fn test_control_characters_rejected() {
        let limits = RequestLimits::default();
        assert_eq!(
            StreamRequest::new("hi\u{7}", "s1").validate(&limits),
            Err(RequestError::ControlCharacters)
        );
        assert!(StreamRequest::new("line one\nline two\ttab", "s1")
            .validate(&limits)
            .is_ok());
    }

    #[test]
    fn test_session_id_rules() {
        let limits = RequestLimits {
            max_session_id_length: 4,
            ..Default::default()
        };
        assert_eq!(
            StreamRequest::new("hi", "  ").validate(&limits),
            Err(RequestError::MissingSessionId)
        );
        assert_eq!(
            StreamRequest::new("hi", "abcde").validate(&limits),
            Err(RequestError::SessionIdTooLong { length: 5, max: 4 })
        );
    }

    #[test]
    fn test_kebab_case_session_id_accepted() {
        let request: StreamRequest =
            serde_json::from_str(r#"{"content":"hello","session-id":"s1"}"#).unwrap();
        assert_eq!(request, StreamRequest::new("hello", "s1"));
    }

    #[test]
    fn test_rejection_from_request_error() {
        let rejection = Rejection::from(&RequestError::EmptyContent);
        let json = serde_json::to_value(&rejection).unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["code"], "invalid_request");
        assert_eq!(json["message"], "content must not be empty");
    }
}
