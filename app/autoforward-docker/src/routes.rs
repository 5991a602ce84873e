//! Engine API route classification.

use axum::http::Method;
use regex::Regex;
use std::sync::LazyLock;

static EXEC_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:/v[0-9.]+)?/exec/([^/]+)/start$").expect("valid exec start pattern")
});

static ATTACH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:/v[0-9.]+)?/containers/([^/]+)/attach$").expect("valid attach pattern")
});

static INSPECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:/v[0-9.]+)?/containers/([^/]+)/json$").expect("valid inspect pattern")
});

static DELETE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:/v[0-9.]+)?/containers/([^/]+)/?$").expect("valid delete pattern")
});

/// An engine API endpoint the proxy treats specially.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiRoute {
    /// `POST /exec/{id}/start`.
    ExecStart(String),
    /// `POST /containers/{id}/attach`.
    Attach(String),
    /// `GET /containers/{id}/json`.
    InspectContainer(String),
    /// `DELETE /containers/{id}`.
    DeleteContainer(String),
    /// Everything else.
    Other,
}

impl ApiRoute {
    /// Classifies a request by method and path (without query string).
    #[must_use]
    pub fn classify(method: &Method, path: &str) -> Self {
        let capture = |re: &Regex| {
            re.captures(path)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        };

        if *method == Method::POST {
            if let Some(id) = capture(&EXEC_START) {
                return Self::ExecStart(id);
            }
            if let Some(id) = capture(&ATTACH) {
                return Self::Attach(id);
            }
        } else if *method == Method::GET {
            if let Some(id) = capture(&INSPECT) {
                return Self::InspectContainer(id);
            }
        } else if *method == Method::DELETE {
            if let Some(id) = capture(&DELETE) {
                return Self::DeleteContainer(id);
            }
        }
        Self::Other
    }

    /// Whether the endpoint may upgrade to a raw stream.
    #[must_use]
    pub const fn is_hijack(&self) -> bool {
        matches!(self, Self::ExecStart(_) | Self::Attach(_))
    }

    /// Container (or exec instance) id named by the path.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::ExecStart(id)
            | Self::Attach(id)
            | Self::InspectContainer(id)
            | Self::DeleteContainer(id) => Some(id),
            Self::Other => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hijack_routes() {
        assert_eq!(
            ApiRoute::classify(&Method::POST, "/v1.41/exec/abc123/start"),
            ApiRoute::ExecStart("abc123".into())
        );
        assert_eq!(
            ApiRoute::classify(&Method::POST, "/v1.41/containers/web/attach"),
            ApiRoute::Attach("web".into())
        );
        assert_eq!(
            ApiRoute::classify(&Method::POST, "/containers/web/attach"),
            ApiRoute::Attach("web".into())
        );
        assert!(ApiRoute::classify(&Method::POST, "/v1.41/exec/abc/start").is_hijack());
    }

    #[test]
    fn inspect_and_delete_depend_on_method() {
        assert_eq!(
            ApiRoute::classify(&Method::GET, "/v1.41/containers/abc/json"),
            ApiRoute::InspectContainer("abc".into())
        );
        assert_eq!(
            ApiRoute::classify(&Method::DELETE, "/v1.41/containers/abc"),
            ApiRoute::DeleteContainer("abc".into())
        );
        assert_eq!(
            ApiRoute::classify(&Method::POST, "/v1.41/containers/abc/json"),
            ApiRoute::Other
        );
        assert_eq!(
            ApiRoute::classify(&Method::GET, "/v1.41/containers/abc"),
            ApiRoute::Other
        );
    }

    #[test]
    fn list_endpoints_are_not_inspect() {
        assert_eq!(
            ApiRoute::classify(&Method::GET, "/v1.41/containers/json"),
            ApiRoute::Other
        );
        assert_eq!(
            ApiRoute::classify(&Method::DELETE, "/v1.41/containers/abc/exec"),
            ApiRoute::Other
        );
        assert_eq!(ApiRoute::classify(&Method::GET, "/_ping"), ApiRoute::Other);
    }

    #[test]
    fn route_id() {
        assert_eq!(
            ApiRoute::DeleteContainer("abc".into()).id(),
            Some("abc")
        );
        assert_eq!(ApiRoute::Other.id(), None);
    }
}
