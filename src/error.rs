use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Failures surfaced to the client. Transient and recoverable upstream
/// conditions are handled inside the handler and never reach this type;
/// non-2xx upstream responses are relayed verbatim instead.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request body is not valid JSON: {0}")]
    MalformedRequest(#[source] serde_json::Error),
    #[error("API key required for Enterprise models")]
    AuthRequired,
    #[error("upstream request failed: {0}")]
    Upstream(#[source] anyhow::Error),
    #[error("internal proxy error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::AuthRequired => StatusCode::UNAUTHORIZED,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match &self {
            ProxyError::Internal(err) => {
                tracing::error!(error = %err, "chat handler failed");
            }
            ProxyError::Upstream(err) => {
                tracing::error!(error = %err, "upstream exhausted retry budget");
            }
            _ => {}
        }
        let body = Json(json!({ "error": { "message": self.to_string() } }));
        (self.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_taxonomy() {
        let malformed = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(
            ProxyError::MalformedRequest(malformed).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ProxyError::AuthRequired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ProxyError::Upstream(anyhow::anyhow!("boom")).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::Internal(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
