//! Outbound request descriptor and the request interceptor
//!
//! Every request leaving `SessionClient` passes through
//! `RequestInterceptor::prepare`, which normalizes the URL and attaches the
//! current access credential as `Authorization: Bearer <token>`. The refresh
//! endpoint is left untouched so the credential exchange can never recurse
//! into the pipeline.

use std::sync::Arc;

use bytes::Bytes;
use common::Secret;
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, InvalidHeaderValue};
use session_auth::{ACCESS_TOKEN_KEY, BEARER_PREFIX, CredentialStore};
use tracing::{debug, warn};

/// One outbound HTTP call as seen by the pipeline.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Set the first time the request is replayed after a refresh. A request
    /// carrying this marker is never refreshed again.
    pub retried: bool,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            retried: false,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Set `Authorization: Bearer <token>`, replacing any previous value.
///
/// The header value is marked sensitive so HTTP-level debug output redacts it.
pub fn authorize(
    headers: &mut HeaderMap,
    token: &Secret<String>,
) -> Result<(), InvalidHeaderValue> {
    let mut value = HeaderValue::from_str(&format!("{BEARER_PREFIX}{}", token.expose()))?;
    value.set_sensitive(true);
    headers.insert(AUTHORIZATION, value);
    Ok(())
}

/// Join a base URL and a request path, then normalize the result.
///
/// A path that is already an absolute `http(s)://` URL is used as is.
pub fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return normalize_url(path);
    }
    normalize_url(&format!("{}/{}", base.trim_end_matches('/'), path))
}

/// Collapse runs of `/` in the path portion of a URL.
///
/// The `//` after the scheme is preserved, and so are the query string and
/// fragment.
pub fn normalize_url(url: &str) -> String {
    // Only look for a scheme ahead of the query or fragment.
    let head_end = url.find(['?', '#']).unwrap_or(url.len());
    let (scheme, rest) = match url[..head_end].find("://") {
        Some(idx) => url.split_at(idx + 3),
        None => ("", url),
    };
    let (path, tail) = match rest.find(['?', '#']) {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };

    let mut normalized = String::with_capacity(url.len());
    normalized.push_str(scheme);
    let mut previous_slash = false;
    for c in path.chars() {
        if c == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        normalized.push(c);
    }
    normalized.push_str(tail);
    normalized
}

/// Attaches the stored access credential to outbound requests.
pub struct RequestInterceptor {
    store: Arc<dyn CredentialStore>,
    refresh_url: String,
}

impl RequestInterceptor {
    pub fn new(store: Arc<dyn CredentialStore>, refresh_url: &str) -> Self {
        Self {
            store,
            refresh_url: normalize_url(refresh_url),
        }
    }

    /// Whether `url` targets the refresh endpoint (query string ignored).
    pub fn is_refresh_request(&self, url: &str) -> bool {
        let without_query = url.split(['?', '#']).next().unwrap_or(url);
        normalize_url(without_query).trim_end_matches('/') == self.refresh_url.trim_end_matches('/')
    }

    /// Normalize the URL and attach the current access credential.
    ///
    /// With no stored credential the request goes out unauthenticated; the
    /// server's 401 then drives the refresh cycle. A store read failure is
    /// treated the same way.
    pub async fn prepare(&self, mut request: RequestDescriptor) -> RequestDescriptor {
        request.url = normalize_url(&request.url);

        if self.is_refresh_request(&request.url) {
            debug!("refresh endpoint request, skipping credential attachment");
            return request;
        }

        let token = match self.store.get(ACCESS_TOKEN_KEY).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "failed to read access credential, sending unauthenticated");
                None
            }
        };

        match token {
            Some(token) if !token.is_blank() => {
                if let Err(e) = authorize(&mut request.headers, &token) {
                    warn!(error = %e, "stored access credential is not a valid header value");
                }
            }
            _ => debug!("no access credential stored, sending unauthenticated"),
        }

        request
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_auth::MemoryCredentialStore;

    fn interceptor(store: MemoryCredentialStore) -> RequestInterceptor {
        RequestInterceptor::new(Arc::new(store), "http://api.local/auth/refresh")
    }

    #[test]
    fn normalize_collapses_duplicate_separators() {
        assert_eq!(
            normalize_url("http://api.local//clients///42"),
            "http://api.local/clients/42"
        );
    }

    #[test]
    fn normalize_keeps_scheme_and_query() {
        assert_eq!(
            normalize_url("https://api.local/a//b?next=//c"),
            "https://api.local/a/b?next=//c"
        );
        assert_eq!(normalize_url("/relative//path"), "/relative/path");
    }

    #[test]
    fn normalize_ignores_scheme_marker_inside_query() {
        assert_eq!(
            normalize_url("/clients//42?return=https://app.local//home"),
            "/clients/42?return=https://app.local//home"
        );
        assert_eq!(
            normalize_url("/a//b#see=http://x"),
            "/a/b#see=http://x"
        );
    }

    #[test]
    fn join_url_handles_slashes_on_both_sides() {
        assert_eq!(
            join_url("http://api.local/", "/invoices"),
            "http://api.local/invoices"
        );
        assert_eq!(
            join_url("http://api.local/v1", "quotes/7"),
            "http://api.local/v1/quotes/7"
        );
        assert_eq!(
            join_url("http://api.local", "http://other.local//x"),
            "http://other.local/x"
        );
    }

    #[test]
    fn refresh_request_detection_ignores_query_and_slashes() {
        let interceptor = interceptor(MemoryCredentialStore::new());
        assert!(interceptor.is_refresh_request("http://api.local/auth/refresh"));
        assert!(interceptor.is_refresh_request("http://api.local//auth/refresh/?x=1"));
        assert!(!interceptor.is_refresh_request("http://api.local/auth/login"));
    }

    #[tokio::test]
    async fn attaches_bearer_from_store() {
        let interceptor = interceptor(MemoryCredentialStore::with_pair("at_1", "rt_1"));
        let request = interceptor
            .prepare(RequestDescriptor::new(
                Method::GET,
                "http://api.local//clients",
            ))
            .await;

        assert_eq!(request.url, "http://api.local/clients");
        assert_eq!(request.headers[AUTHORIZATION], "Bearer at_1");
        assert!(request.headers[AUTHORIZATION].is_sensitive());
    }

    #[tokio::test]
    async fn missing_credential_leaves_request_unauthenticated() {
        let interceptor = interceptor(MemoryCredentialStore::new());
        let request = interceptor
            .prepare(RequestDescriptor::new(Method::GET, "http://api.local/clients"))
            .await;
        assert!(request.headers.get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn refresh_endpoint_is_not_authorized() {
        let interceptor = interceptor(MemoryCredentialStore::with_pair("at_1", "rt_1"));
        let request = interceptor
            .prepare(RequestDescriptor::new(
                Method::POST,
                "http://api.local/auth/refresh",
            ))
            .await;
        assert!(request.headers.get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn stored_credential_replaces_caller_header() {
        let interceptor = interceptor(MemoryCredentialStore::with_pair("at_current", "rt_1"));
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer stale"));
        let request = interceptor
            .prepare(
                RequestDescriptor::new(Method::GET, "http://api.local/clients")
                    .with_headers(headers),
            )
            .await;
        assert_eq!(request.headers[AUTHORIZATION], "Bearer at_current");
    }
}
