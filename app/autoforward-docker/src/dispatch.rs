//! Response handlers.
//!
//! Every passthrough response is claimed by the first matching handler in
//! a fixed order: inspect rewrite, delete cleanup, then verbatim relay.

use crate::error::{ProxyError, Result};
use crate::orchestrator::ProxyOrchestrator;
use crate::routes::ApiRoute;
use axum::body::Body;
use axum::http::{header, HeaderValue, Method, Response, StatusCode};
use bytes::Bytes;
use http_body_util::BodyExt;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A response handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseHandler {
    /// Rewrites published ports of a container inspect.
    Inspect,
    /// Closes the forwards of a deleted container.
    Delete,
    /// Relays the response unchanged.
    Default,
}

impl ResponseHandler {
    /// Whether this handler claims a response.
    #[must_use]
    pub fn claims(self, route: &ApiRoute, status: StatusCode) -> bool {
        match self {
            Self::Inspect => {
                status == StatusCode::OK && matches!(route, ApiRoute::InspectContainer(_))
            }
            Self::Delete => {
                status == StatusCode::NO_CONTENT && matches!(route, ApiRoute::DeleteContainer(_))
            }
            Self::Default => true,
        }
    }
}

/// Ordered list of response handlers.
#[derive(Debug, Clone)]
pub struct ResponseDispatcher {
    handlers: Vec<ResponseHandler>,
}

impl Default for ResponseDispatcher {
    fn default() -> Self {
        Self::new(vec![
            ResponseHandler::Inspect,
            ResponseHandler::Delete,
            ResponseHandler::Default,
        ])
    }
}

impl ResponseDispatcher {
    /// Creates a dispatcher trying `handlers` in order.
    #[must_use]
    pub const fn new(handlers: Vec<ResponseHandler>) -> Self {
        Self { handlers }
    }

    /// First handler claiming the response.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Protocol`] when no handler claims it.
    pub fn select(&self, route: &ApiRoute, status: StatusCode) -> Result<ResponseHandler> {
        self.handlers
            .iter()
            .copied()
            .find(|handler| handler.claims(route, status))
            .ok_or_else(|| {
                ProxyError::Protocol(format!("no response handler for {status} response"))
            })
    }

    /// Services a remote response with the first claiming handler.
    ///
    /// # Errors
    ///
    /// Returns an error if no handler claims the response or its body cannot
    /// be read.
    pub async fn dispatch<B>(
        &self,
        orchestrator: &ProxyOrchestrator,
        method: &Method,
        route: &ApiRoute,
        response: Response<B>,
    ) -> Result<Response<Body>>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        match self.select(route, response.status())? {
            ResponseHandler::Inspect => {
                let id = route.id().unwrap_or_default();
                inspect(orchestrator, id, response).await
            }
            ResponseHandler::Delete => {
                if let Some(id) = route.id() {
                    orchestrator.on_container_deleted(id).await;
                }
                Ok(relay(method, response))
            }
            ResponseHandler::Default => Ok(relay(method, response)),
        }
    }
}

async fn inspect<B>(
    orchestrator: &ProxyOrchestrator,
    container_id: &str,
    response: Response<B>,
) -> Result<Response<Body>>
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let (mut parts, body) = response.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|e| {
            let e: BoxError = e.into();
            ProxyError::connectivity(e)
        })?
        .to_bytes();

    let body = match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(mut inspect) => {
            orchestrator.rewrite_published_ports(container_id, &mut inspect);
            Bytes::from(serde_json::to_vec(&inspect)?)
        }
        Err(e) => {
            tracing::warn!(
                container_id = %container_id,
                "Inspect response is not JSON, relaying unchanged: {}",
                e
            );
            bytes
        }
    };

    parts.headers.remove(header::TRANSFER_ENCODING);
    parts.headers.remove(header::CONTENT_ENCODING);
    parts
        .headers
        .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));

    Ok(Response::from_parts(parts, Body::from(body)))
}

/// Relays headers verbatim. A chunked upstream body is streamed piece by
/// piece and re-chunked by the server; HEAD responses carry no body.
fn relay<B>(method: &Method, response: Response<B>) -> Response<Body>
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let (parts, body) = response.into_parts();
    if method == Method::HEAD {
        return Response::from_parts(parts, Body::empty());
    }
    Response::from_parts(parts, Body::new(body))
}
