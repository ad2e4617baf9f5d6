//! Request pipeline
//!
//! Wraps every outbound call: reads the credential slot, attaches the bearer
//! token, dispatches, and classifies the result. A 401 on a first attempt
//! suspends the caller on the refresh coordinator and retries once with the
//! fresh credential; the retried response never triggers another refresh,
//! whatever it is. All other failure classes pass through untouched.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use common::Secret;
use tracker_auth::{Credential, CredentialStore, token};

use crate::classify::{Classification, classify_status};
use crate::config::ClientConfig;
use crate::error::{Failure, Result};
use crate::refresh::{RefreshCoordinator, RefreshOutcome};
use crate::session::{SessionEvent, SessionTerminator};

/// Description of one outbound call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: Some(body),
        }
    }

    pub fn put(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::PUT,
            path: path.into(),
            body: Some(body),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            method: Method::DELETE,
            path: path.into(),
            body: None,
        }
    }
}

/// A successful response: status plus the raw body.
#[derive(Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl ApiResponse {
    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| Failure::Transient {
            status: Some(self.status.as_u16()),
            message: format!("invalid response body: {e}"),
        })
    }
}

/// Per-call attempt marker. `retried` flips true at most once, the moment
/// the post-refresh retry is issued; it is what breaks the refresh loop.
struct RequestAttempt<'a> {
    request: &'a ApiRequest,
    retried: bool,
}

/// API client owning the pipeline and the session subsystem.
///
/// All shared mutable session state (credential slot, refresh state) lives
/// behind the store and coordinator; the client itself is cheap to share.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    store: Arc<CredentialStore>,
    coordinator: Arc<RefreshCoordinator>,
    terminator: Arc<SessionTerminator>,
}

impl ApiClient {
    /// Build a client over an existing credential store.
    ///
    /// Returns the client and the receiver for session events; the host
    /// listens on it for the forced re-authentication signal.
    pub fn new(
        config: &ClientConfig,
        store: Arc<CredentialStore>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let http = reqwest::Client::new();
        let (terminator, events) = SessionTerminator::new(store.clone());
        let terminator = Arc::new(terminator);
        let coordinator = Arc::new(RefreshCoordinator::new(
            store.clone(),
            terminator.clone(),
            http.clone(),
            config.base_url.clone(),
            config.refresh_timeout(),
        ));
        (
            Self {
                http,
                base_url: config.base_url.clone(),
                request_timeout: config.request_timeout(),
                store,
                coordinator,
                terminator,
            },
            events,
        )
    }

    /// Execute one call with transparent refresh-and-retry.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
        let credential = match self.store.get().await {
            Some(credential) => credential,
            None => {
                debug!(path = %request.path, "no credential, failing without dispatch");
                self.terminator.terminate().await;
                return self.fail(Failure::Unauthenticated);
            }
        };

        let mut attempt = RequestAttempt {
            request: &request,
            retried: false,
        };
        let mut access = credential.access;

        loop {
            let response = self.dispatch(attempt.request, &access).await?;

            match classify_status(response.status.as_u16()) {
                Classification::Success => {
                    metrics::counter!("client_requests_total", "outcome" => "success")
                        .increment(1);
                    return Ok(response);
                }
                Classification::Validation => {
                    return self.fail(Failure::Validation {
                        status: response.status.as_u16(),
                        body: String::from_utf8_lossy(&response.body).into_owned(),
                    });
                }
                Classification::Transient => {
                    return self.fail(Failure::Transient {
                        status: Some(response.status.as_u16()),
                        message: String::from_utf8_lossy(&response.body).into_owned(),
                    });
                }
                Classification::AuthRejected => {
                    if attempt.retried {
                        // Second rejection for this attempt; surface, never refresh again.
                        warn!(path = %request.path, "credential rejected after refresh");
                        self.terminator.terminate().await;
                        return self.fail(Failure::AuthenticationExpired(
                            "credential rejected after refresh".into(),
                        ));
                    }
                    debug!(path = %request.path, "credential rejected, requesting refresh");
                    match self.coordinator.obtain_fresh_credential().await {
                        RefreshOutcome::Refreshed(fresh) => {
                            attempt.retried = true;
                            access = fresh.access;
                        }
                        RefreshOutcome::Unavailable => {
                            // The coordinator already tore the session down on
                            // exchange failure; terminate() is idempotent.
                            self.terminator.terminate().await;
                            return self.fail(Failure::RefreshUnavailable(
                                "no fresh credential available".into(),
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Start a session: exchange the password, store the pair, re-enable
    /// refresh and teardown.
    pub async fn login(&self, email: &str, password: &Secret<String>) -> Result<()> {
        let response = token::login(&self.http, &self.base_url, email, password.expose())
            .await
            .map_err(|e| match e {
                tracker_auth::Error::InvalidCredentials(msg) => Failure::Validation {
                    status: 401,
                    body: msg,
                },
                other => Failure::Transient {
                    status: None,
                    message: other.to_string(),
                },
            })?;

        let credential = Credential {
            access: response.access_token,
            refresh: response.refresh_token,
        };
        if let Err(e) = self.store.set(credential).await {
            warn!(error = %e, "failed to persist credential after login");
        }
        self.coordinator.reset();
        self.terminator.rearm();
        debug!("session established");
        Ok(())
    }

    /// End the session deliberately: clear the slot and signal the host.
    pub async fn logout(&self) {
        self.terminator.terminate().await;
    }

    /// The credential store backing this client.
    pub fn credential_store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Dispatch one attempt with the given access token attached.
    async fn dispatch(&self, request: &ApiRequest, access: &str) -> Result<ApiResponse> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), request.path);
        let mut builder = self
            .http
            .request(request.method.clone(), &url)
            .bearer_auth(access)
            .timeout(self.request_timeout);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            metrics::counter!("client_requests_total", "outcome" => "transient").increment(1);
            Failure::Transient {
                status: None,
                message: format!("request dispatch failed: {e}"),
            }
        })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            metrics::counter!("client_requests_total", "outcome" => "transient").increment(1);
            Failure::Transient {
                status: Some(status.as_u16()),
                message: format!("reading response body failed: {e}"),
            }
        })?;

        Ok(ApiResponse { status, body })
    }

    fn fail<T>(&self, failure: Failure) -> Result<T> {
        metrics::counter!("client_requests_total", "outcome" => failure.label()).increment(1);
        Err(failure)
    }
}
