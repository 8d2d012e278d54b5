//! Credential refresh against the auth endpoint
//!
//! `POST {base}/auth/refresh` with `{"refreshToken": "..."}` returns a new
//! `{"token": "...", "refreshToken": "..."}` pair. The old refresh credential is
//! invalidated server-side once used.
//!
//! This call goes straight to `reqwest`, never through the authenticated
//! pipeline, so a 401 here can only surface as `InvalidCredentials`.

use common::Secret;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Wire shape of the refresh endpoint response.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub token: String,
    pub refresh_token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// A freshly minted access/refresh credential pair.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPair {
    pub access: Secret<String>,
    pub refresh: Secret<String>,
}

impl TokenPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: Secret::new(access.into()),
            refresh: Secret::new(refresh.into()),
        }
    }
}

impl From<TokenResponse> for TokenPair {
    fn from(response: TokenResponse) -> Self {
        TokenPair::new(response.token, response.refresh_token)
    }
}

/// Exchange a refresh credential for a new pair.
///
/// 401/403 from the endpoint means the refresh credential is expired or
/// revoked and is reported as `InvalidCredentials`. A 2xx response without a
/// usable access credential is a `TokenExchange` failure.
pub async fn refresh_session(
    client: &reqwest::Client,
    url: &str,
    refresh: &str,
) -> Result<TokenPair> {
    let response = client
        .post(url)
        .json(&RefreshRequest {
            refresh_token: refresh,
        })
        .send()
        .await
        .map_err(|e| Error::Http(format!("refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "refresh credential rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "refresh endpoint returned {status}: {body}"
        )));
    }

    let token_response = response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))?;

    if token_response.token.trim().is_empty() {
        return Err(Error::TokenExchange(
            "refresh response carried no access credential".into(),
        ));
    }

    Ok(token_response.into())
}
