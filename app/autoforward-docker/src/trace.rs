//! Request ID middleware.
//!
//! Every request gets an ID recorded in the current tracing span so the log
//! lines of one relayed call can be correlated. Requests and responses pass
//! through untouched: the engine sees the client's headers and the client
//! sees the engine's.

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;

/// Header a client may use to supply its own request ID.
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Returns the caller's `X-Request-Id`, or a fresh UUID v4.
#[must_use]
pub fn request_id(request: &Request) -> String {
    request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), String::from)
}

/// Records the request ID in the span opened by the trace layer.
pub async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = request_id(&request);

    tracing::Span::current().record("request_id", request_id.as_str());
    tracing::trace!(request_id = %request_id, method = %request.method(), uri = %request.uri(), "request");

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderMap, Request as HttpRequest};
    use axum::middleware;
    use axum::routing::get;
    use axum::Router;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    /// Echoes the request's `X-Request-Id` and answers with the engine's own.
    async fn engine(headers: HeaderMap) -> ([(&'static str, &'static str); 1], String) {
        let seen = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        ([(REQUEST_ID_HEADER, "engine-7")], seen)
    }

    async fn plain() -> &'static str {
        "OK"
    }

    fn app() -> Router {
        Router::new()
            .route("/engine", get(engine))
            .route("/_ping", get(plain))
            .layer(middleware::from_fn(request_id_middleware))
    }

    #[test]
    fn caller_id_is_reused_or_generated() {
        let with_id = HttpRequest::builder()
            .header(REQUEST_ID_HEADER, "ci-job-42")
            .body(Body::empty())
            .unwrap();
        assert_eq!(request_id(&with_id), "ci-job-42");

        let without = HttpRequest::builder().body(Body::empty()).unwrap();
        assert!(uuid::Uuid::parse_str(&request_id(&without)).is_ok());

        let empty = HttpRequest::builder()
            .header(REQUEST_ID_HEADER, "")
            .body(Body::empty())
            .unwrap();
        assert!(uuid::Uuid::parse_str(&request_id(&empty)).is_ok());
    }

    #[tokio::test]
    async fn headers_pass_through_unchanged() {
        let req = HttpRequest::builder()
            .uri("/engine")
            .header(REQUEST_ID_HEADER, "ci-job-42")
            .body(Body::empty())
            .unwrap();

        let resp = app().oneshot(req).await.unwrap();
        let ids: Vec<_> = resp.headers().get_all(REQUEST_ID_HEADER).iter().collect();
        assert_eq!(ids, ["engine-7"]);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "ci-job-42");
    }

    #[tokio::test]
    async fn no_request_id_is_added_to_responses() {
        let req = HttpRequest::builder().uri("/_ping").body(Body::empty()).unwrap();

        let resp = app().oneshot(req).await.unwrap();
        assert!(!resp.headers().contains_key(REQUEST_ID_HEADER));
    }
}
