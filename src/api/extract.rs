//! Context headers and error responses.

use axum::{
    Json,
    extract::FromRequestParts,
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::context::ContextCarrier;
use crate::error::{ContextError, Error, codes};

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const AGENT_HEADER: &str = "x-agent-id";
pub const CONVERSATION_HEADER: &str = "x-conversation-id";
pub const COLLECTION_HEADER: &str = "x-collection-id";

/// Context carrier built from the request's context headers.
///
/// A missing or blank `x-tenant-id` rejects the request with `400`.
#[derive(Debug, Clone)]
pub struct RequestContext(pub ContextCarrier);

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(context_from_headers(&parts.headers)?))
    }
}

impl std::ops::Deref for RequestContext {
    type Target = ContextCarrier;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub fn context_from_headers(headers: &HeaderMap) -> Result<ContextCarrier, ContextError> {
    let tenant = header(headers, TENANT_HEADER).ok_or(ContextError::MissingTenant)?;
    let mut ctx = ContextCarrier::new(tenant)?;
    if let Some(agent) = header(headers, AGENT_HEADER) {
        ctx = ctx.with_agent(agent);
    }
    if let Some(conversation) = header(headers, CONVERSATION_HEADER) {
        ctx = ctx.with_conversation(conversation);
    }
    if let Some(collection) = header(headers, COLLECTION_HEADER) {
        ctx = ctx.with_collection(collection);
    }
    Ok(ctx)
}

/// Error response: `{"error": {"code", "message", "retryable"}}`.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl<E: Into<Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0.code() {
            codes::VALIDATION => StatusCode::BAD_REQUEST,
            codes::NOT_FOUND => StatusCode::NOT_FOUND,
            codes::CONFLICT | codes::INVALID_TRANSITION => StatusCode::CONFLICT,
            codes::SERVICE_UNAVAILABLE => StatusCode::SERVICE_UNAVAILABLE,
            codes::TIMEOUT => StatusCode::GATEWAY_TIMEOUT,
            codes::TRANSIENT => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let info = self.0.info();
        (
            status,
            Json(serde_json::json!({
                "error": {
                    "code": info.code,
                    "message": info.message,
                    "retryable": info.retryable,
                }
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;
    use crate::error::JobError;

    #[test]
    fn context_headers_are_read() {
        let mut headers = HeaderMap::new();
        headers.insert(TENANT_HEADER, HeaderValue::from_static("t1"));
        headers.insert(AGENT_HEADER, HeaderValue::from_static("router"));
        headers.insert(COLLECTION_HEADER, HeaderValue::from_static(" docs "));

        let ctx = context_from_headers(&headers).unwrap();
        assert_eq!(ctx.tenant_id(), "t1");
        assert_eq!(ctx.agent_id(), Some("router"));
        assert_eq!(ctx.conversation_id(), None);
        assert_eq!(ctx.collection_id(), Some("docs"));
    }

    #[test]
    fn blank_tenant_is_rejected() {
        let mut headers = HeaderMap::new();
        assert_eq!(context_from_headers(&headers).unwrap_err(), ContextError::MissingTenant);

        headers.insert(TENANT_HEADER, HeaderValue::from_static("  "));
        assert_eq!(context_from_headers(&headers).unwrap_err(), ContextError::MissingTenant);
    }

    #[test]
    fn error_codes_map_to_status() {
        let not_found = ApiError::from(JobError::NotFound { id: uuid::Uuid::nil() });
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let terminal = ApiError::from(JobError::AlreadyTerminal {
            id: uuid::Uuid::nil(),
            state: "completed".into(),
        });
        assert_eq!(terminal.status(), StatusCode::CONFLICT);

        let invalid = ApiError::from(JobError::UnknownType("nope".into()));
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }
}
