//! Inbound request handling.
//!
//! Requests are classified in a fixed order: hijack-eligible attach/exec
//! calls run over a dedicated remote socket, everything else is relayed
//! through [`ResponseDispatcher`](crate::dispatch::ResponseDispatcher).

use crate::api::AppState;
use crate::error::{ProxyError, Result};
use crate::hijack::{log_session_end, UpgradeSession};
use crate::routes::ApiRoute;
use axum::body::Body;
use axum::extract::State;
use axum::http::uri::PathAndQuery;
use axum::http::{header, HeaderValue, Request, Response, StatusCode, Uri};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio_util::io::ReaderStream;

/// Buffer between a raw-stream pump and a streaming response body.
const STREAM_BUFFER: usize = 64 * 1024;

/// Request classifiers, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClassifier {
    /// Run on a dedicated socket and relay the raw stream.
    Hijack,
    /// Plain passthrough.
    Default,
}

/// The fields of an exec start body that decide how it is relayed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ExecStartOptions {
    /// Start without attaching to the output.
    pub detach: bool,
    /// Allocate a pseudo-TTY.
    pub tty: bool,
}

impl RequestClassifier {
    /// Picks the classifier for a request. `body` is the buffered request
    /// body of hijack-eligible routes.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::UnsupportedOperation`] for an attached TTY exec.
    pub fn select(route: &ApiRoute, body: &[u8]) -> Result<Self> {
        match route {
            ApiRoute::ExecStart(id) => {
                let Ok(options) = serde_json::from_slice::<ExecStartOptions>(body) else {
                    return Ok(Self::Default);
                };
                if options.detach {
                    Ok(Self::Default)
                } else if options.tty {
                    Err(ProxyError::UnsupportedOperation(format!(
                        "TTY exec sessions are not supported (exec {id})"
                    )))
                } else {
                    Ok(Self::Hijack)
                }
            }
            ApiRoute::Attach(_) => Ok(Self::Hijack),
            ApiRoute::InspectContainer(_) | ApiRoute::DeleteContainer(_) | ApiRoute::Other => {
                Ok(Self::Default)
            }
        }
    }
}

/// Catch-all handler relaying every request to the remote engine.
///
/// # Errors
///
/// Returns an error response when the request cannot be relayed.
pub async fn proxy_fallback(
    State(state): State<AppState>,
    req: Request<Body>,
) -> Result<Response<Body>> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let route = ApiRoute::classify(&method, uri.path());
    let target = state.connector.resolve_target(&uri);

    let result = handle(&state, &route, &target, req).await;
    if let Err(e) = &result {
        if e.is_disconnect() {
            tracing::debug!(path = %uri.path(), "FORWARD {} {} failed: {}", method, target, e);
        } else {
            tracing::warn!(path = %uri.path(), "FORWARD {} {} failed: {}", method, target, e);
        }
    }
    result
}

async fn handle(
    state: &AppState,
    route: &ApiRoute,
    target: &str,
    mut req: Request<Body>,
) -> Result<Response<Body>> {
    if !route.is_hijack() {
        return passthrough(state, route, target, req).await;
    }

    let body = collect_body(std::mem::take(req.body_mut())).await?;
    match RequestClassifier::select(route, &body)? {
        RequestClassifier::Hijack => hijack(state, target, req, body).await,
        RequestClassifier::Default => {
            *req.body_mut() = Body::from(body);
            passthrough(state, route, target, req).await
        }
    }
}

async fn passthrough(
    state: &AppState,
    route: &ApiRoute,
    target: &str,
    req: Request<Body>,
) -> Result<Response<Body>> {
    let (parts, body) = req.into_parts();
    let method = parts.method.clone();

    let mut upstream = Request::builder()
        .method(parts.method)
        .uri(path_and_query(&parts.uri))
        .body(body)
        .map_err(|e| ProxyError::Protocol(format!("failed to build remote request: {e}")))?;

    *upstream.headers_mut() = parts.headers;
    set_host(&mut upstream, state);

    let response = state.connector.send(upstream).await?;
    tracing::debug!(
        method = %method,
        status = response.status().as_u16(),
        "FORWARD {} {} {}",
        method,
        response.status().as_u16(),
        target
    );

    state
        .dispatcher
        .dispatch(&state.orchestrator, &method, route, response)
        .await
}

async fn hijack(
    state: &AppState,
    target: &str,
    mut req: Request<Body>,
    body: Bytes,
) -> Result<Response<Body>> {
    // Must be taken before the response is returned.
    let client_upgrade = hyper::upgrade::on(&mut req);

    tracing::debug!(status = "101?", "FORWARD {} 101? {}", req.method(), target);

    let session = state
        .hijacker
        .open(req.method(), path_and_query(req.uri()), req.headers(), &body)
        .await?;

    tracing::debug!(
        method = %req.method(),
        status = session.status().as_u16(),
        upgrade = session.is_upgrade(),
        "FORWARD {} {} {}",
        req.method(),
        session.status().as_u16(),
        target
    );

    let mut response = Response::new(Body::empty());
    *response.status_mut() = session.status();
    *response.headers_mut() = session.relay_headers();

    if !session.is_upgrade() {
        *response.body_mut() = Body::from(session.body().clone());
        return Ok(response);
    }

    let target = target.to_string();
    if session.status() == StatusCode::SWITCHING_PROTOCOLS {
        tokio::spawn(async move {
            match client_upgrade.await {
                Ok(upgraded) => {
                    let result = session.relay(TokioIo::new(upgraded)).await;
                    log_session_end(&target, &result);
                }
                Err(e) => tracing::debug!("client upgrade failed: {}", e),
            }
        });
        return Ok(response);
    }

    *response.body_mut() = stream_body(session, target);
    Ok(response)
}

/// Pumps a non-upgraded raw stream into a streaming response body.
fn stream_body(session: UpgradeSession, target: String) -> Body {
    let (mut writer, reader) = tokio::io::duplex(STREAM_BUFFER);
    tokio::spawn(async move {
        let result = session.pump(&mut writer).await;
        log_session_end(&target, &result);
    });
    Body::from_stream(ReaderStream::new(reader))
}

async fn collect_body(body: Body) -> Result<Bytes> {
    body.collect()
        .await
        .map(http_body_util::Collected::to_bytes)
        .map_err(ProxyError::connectivity)
}

fn path_and_query(uri: &Uri) -> &str {
    uri.path_and_query().map_or("/", PathAndQuery::as_str)
}

fn set_host<B>(req: &mut Request<B>, state: &AppState) {
    if let Ok(host) = HeaderValue::from_str(&state.connector.endpoint().host_header()) {
        req.headers_mut().insert(header::HOST, host);
    }
}
