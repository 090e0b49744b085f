use reqwest::StatusCode;
use thiserror::Error;

/// Failures of a question/answer round trip.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AskError {
    /// Rejected locally; never forwarded to a provider.
    #[error("{0}")]
    Validation(String),
    #[error("answering provider rejected the credential: {0}")]
    Unauthorized(String),
    #[error("answering provider rate limit or quota exceeded: {0}")]
    RateLimited(String),
    #[error("answering provider failed: {0}")]
    Upstream(String),
}

impl AskError {
    pub fn status(&self) -> StatusCode {
        match self {
            AskError::Validation(_) => StatusCode::BAD_REQUEST,
            AskError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AskError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AskError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Network, rate-limit and quota failures that may clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, AskError::RateLimited(_) | AskError::Upstream(_))
    }

    /// Classifies a non-success provider response.
    pub fn from_status(provider: &str, status: StatusCode, body: &str) -> Self {
        let detail = format!("{provider} returned {status}: {}", normalize_err_body(body));
        match status {
            StatusCode::BAD_REQUEST
            | StatusCode::PAYLOAD_TOO_LARGE
            | StatusCode::UNPROCESSABLE_ENTITY => AskError::Validation(detail),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AskError::Unauthorized(detail),
            StatusCode::TOO_MANY_REQUESTS => AskError::RateLimited(detail),
            StatusCode::PAYMENT_REQUIRED => AskError::RateLimited(detail),
            _ => AskError::Upstream(detail),
        }
    }

    pub fn transport(provider: &str, err: reqwest::Error) -> Self {
        AskError::Upstream(format!("failed to reach {provider}: {err}"))
    }
}

/// Pulls the `error` message out of a JSON error body when there is one.
pub fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        let message = json
            .get("error")
            .and_then(|err| err.as_str().or_else(|| err.get("message")?.as_str()));
        if let Some(message) = message {
            return message.to_string();
        }
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_taxonomy() {
        let unauthorized = AskError::from_status("openai", StatusCode::UNAUTHORIZED, "");
        assert!(matches!(unauthorized, AskError::Unauthorized(_)));
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert!(!unauthorized.is_transient());

        let limited = AskError::from_status("openai", StatusCode::TOO_MANY_REQUESTS, "");
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(limited.is_transient());

        let broken = AskError::from_status("openai", StatusCode::BAD_GATEWAY, "");
        assert_eq!(broken.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(broken.is_transient());
    }

    #[test]
    fn rejected_request_is_a_validation_error() {
        let rejected = AskError::from_status(
            "relay",
            StatusCode::BAD_REQUEST,
            r#"{"error":"context is 10031 characters; the limit is 10000"}"#,
        );
        assert!(matches!(rejected, AskError::Validation(_)));
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
        assert!(!rejected.is_transient());
        assert!(rejected.to_string().contains("the limit is 10000"));
    }

    #[test]
    fn error_bodies_are_unwrapped() {
        assert_eq!(normalize_err_body(r#"{"error":"model missing"}"#), "model missing");
        assert_eq!(
            normalize_err_body(r#"{"error":{"message":"bad key","type":"auth"}}"#),
            "bad key"
        );
        assert_eq!(normalize_err_body("  "), "<empty body>");
        assert_eq!(normalize_err_body("plain"), "plain");
    }
}
