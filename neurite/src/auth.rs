//! Access-token extraction and authentication.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crate::users::User;
use neurite_core::{Errcode, MatrixError};
use neurite_db::Db;

/// The raw access token presented with a request, from
/// `Authorization: Bearer <token>` or, failing that, the `access_token`
/// query parameter.
///
/// Extraction only finds the token; resolving it to a user is a separate
/// step ([`require_user`]) so endpoints can order their checks the way
/// their contracts demand.
pub struct RequestToken(pub String);

impl<S: Send + Sync> FromRequestParts<S> for RequestToken {
    type Rejection = MatrixError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(header) = parts.headers.get(AUTHORIZATION) {
            // A present but malformed header is still a missing token.
            let value = header
                .to_str()
                .map_err(|_| MatrixError::new(Errcode::MissingToken))?;
            let token = value
                .strip_prefix("Bearer ")
                .ok_or_else(|| MatrixError::new(Errcode::MissingToken))?
                .trim_start();
            return Ok(RequestToken(token.to_string()));
        }

        let query = parts.uri.query().unwrap_or("");
        for pair in query.split('&') {
            if let Some(token) = pair.strip_prefix("access_token=") {
                if !token.is_empty() {
                    return Ok(RequestToken(token.to_string()));
                }
            }
        }

        Err(MatrixError::new(Errcode::MissingToken))
    }
}

/// Resolve a request token to its (locked) user, or fail the request with
/// `M_UNKNOWN_TOKEN`.
pub async fn require_user(db: &Db, token: &RequestToken) -> Result<User, MatrixError> {
    User::authenticate(db, &token.0)
        .await
        .map_err(crate::internal)?
        .ok_or_else(|| MatrixError::new(Errcode::UnknownToken))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;

    async fn extract(request: Request<Body>) -> Result<String, MatrixError> {
        let (mut parts, _) = request.into_parts();
        <RequestToken as FromRequestParts<()>>::from_request_parts(&mut parts, &())
            .await
            .map(|t| t.0)
    }

    #[tokio::test]
    async fn bearer_header_wins() {
        let request = Request::builder()
            .uri("/x")
            .header("Authorization", "Bearer  abc123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract(request).await.unwrap(), "abc123");
    }

    #[tokio::test]
    async fn query_parameter_is_the_fallback() {
        let request = Request::builder()
            .uri("/x?foo=1&access_token=qwerty")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract(request).await.unwrap(), "qwerty");
    }

    #[tokio::test]
    async fn missing_token_is_m_missing_token() {
        let request = Request::builder().uri("/x").body(Body::empty()).unwrap();
        let err = extract(request).await.unwrap_err();
        assert_eq!(err.errcode(), Errcode::MissingToken);
    }

    #[tokio::test]
    async fn non_bearer_scheme_is_rejected() {
        let request = Request::builder()
            .uri("/x")
            .header("Authorization", "Basic dXNlcjpwYXNz")
            .body(Body::empty())
            .unwrap();
        let err = extract(request).await.unwrap_err();
        assert_eq!(err.errcode(), Errcode::MissingToken);
    }
}
