use axum::extract::Request;
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Router;

use neurite_core::{Errcode, MatrixError};

const SERVER: &str = concat!("Neurite/", env!("CARGO_PKG_VERSION"));

/// Headers set on every response, matching what web clients of the
/// client-server API expect to see.
fn standard_header_values() -> [(HeaderName, HeaderValue); 5] {
    [
        (
            HeaderName::from_static("server"),
            HeaderValue::from_static(SERVER),
        ),
        (
            HeaderName::from_static("access-control-allow-origin"),
            HeaderValue::from_static("*"),
        ),
        (
            HeaderName::from_static("access-control-allow-methods"),
            HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
        ),
        (
            HeaderName::from_static("access-control-allow-headers"),
            HeaderValue::from_static("X-Requested-With, Content-Type, Authorization"),
        ),
        (
            HeaderName::from_static("connection"),
            HeaderValue::from_static("close"),
        ),
    ]
}

fn apply_standard_headers(response: &mut Response) {
    for (name, value) in standard_header_values() {
        response.headers_mut().insert(name, value);
    }
}

/// Set the standard headers and short-circuit `OPTIONS` with 204.
///
/// Browsers probe every endpoint with `OPTIONS` preflights; no endpoint
/// logic may run for those.
async fn standard_headers(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_standard_headers(&mut response);
        return response;
    }

    let mut response = next.run(request).await;
    apply_standard_headers(&mut response);
    response
}

/// Log every request the way the dispatcher always has: a debug line on
/// entry, and `method path (status reason)` once the handler returns.
async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    tracing::debug!("{method} {path}");

    let response = next.run(request).await;

    let status = response.status();
    tracing::info!(
        "{method} {path} ({} {})",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    );
    response
}

async fn not_found() -> MatrixError {
    MatrixError::new(Errcode::NotFound)
}

/// Wrap an application router with the dispatcher's cross-cutting layers
/// and the JSON 404 fallback for routing misses.
pub fn dispatch(router: Router) -> Router {
    router
        .fallback(not_found)
        .layer(axum::middleware::from_fn(log_requests))
        .layer(axum::middleware::from_fn(standard_headers))
}
