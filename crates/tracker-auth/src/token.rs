//! Token endpoint exchanges
//!
//! Handles the two token endpoint interactions:
//! 1. Login (password exchange, form-encoded per the OAuth2 password flow)
//! 2. Token refresh (refresh token presented as a bearer credential)
//!
//! Both operations POST to paths under `/auth` on the API base URL and
//! return the same two-token response shape.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Path of the password login endpoint.
pub const LOGIN_PATH: &str = "/auth/login";

/// Path of the refresh exchange endpoint.
pub const REFRESH_PATH: &str = "/auth/refresh_token";

/// Response from the token endpoints for both login and refresh.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "bearer".into()
}

/// Exchange an email/password pair for tokens (session start).
///
/// The server expects `application/x-www-form-urlencoded` with `username`
/// and `password` fields. A 401 means the credentials were rejected.
pub async fn login(
    client: &reqwest::Client,
    base_url: &str,
    email: &str,
    password: &str,
) -> Result<TokenResponse> {
    let url = format!("{}{LOGIN_PATH}", base_url.trim_end_matches('/'));
    let response = client
        .post(url)
        .form(&[("username", email), ("password", password)])
        .send()
        .await
        .map_err(|e| Error::Http(format!("login request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401 {
            return Err(Error::InvalidCredentials(format!(
                "login rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "login endpoint returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid login response: {e}")))
}

/// Exchange a refresh token for a new token pair.
///
/// Called by the refresh leader when an access token is rejected. The
/// refresh token travels in the `Authorization` header, not the body.
pub async fn refresh_token(
    client: &reqwest::Client,
    base_url: &str,
    refresh: &str,
) -> Result<TokenResponse> {
    let url = format!("{}{REFRESH_PATH}", base_url.trim_end_matches('/'));
    let response = client
        .post(url)
        .bearer_auth(refresh)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        // 401/403 means the refresh token is revoked or invalid
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))
}
