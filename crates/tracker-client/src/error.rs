//! Failure taxonomy for the request pipeline
//!
//! Every call through the pipeline resolves to a successful response or to
//! exactly one of these classes; nothing is swallowed. `Transient` and
//! `Validation` are passed through untouched (retry policy, if any, belongs
//! to the caller). `AuthenticationExpired` and `RefreshUnavailable`
//! additionally trigger session termination.

/// Terminal failure classes surfaced by the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Failure {
    /// No credential in the store at call time; no network call was made.
    #[error("not authenticated: no credential in store")]
    Unauthenticated,

    /// Authorization was rejected twice (original call and its retry).
    #[error("authentication expired: {0}")]
    AuthenticationExpired(String),

    /// The refresh exchange itself failed or is disabled until re-login.
    #[error("refresh unavailable: {0}")]
    RefreshUnavailable(String),

    /// Network or server fault unrelated to authorization.
    #[error("transient failure: {message}")]
    Transient { status: Option<u16>, message: String },

    /// Caller-supplied bad input rejected by the server: request bodies
    /// (400/422) and wrong login credentials (401 from the login endpoint,
    /// which never enters the refresh path).
    #[error("validation failure ({status}): {body}")]
    Validation { status: u16, body: String },
}

impl Failure {
    /// Label for metrics and logging.
    pub fn label(&self) -> &'static str {
        match self {
            Failure::Unauthenticated => "unauthenticated",
            Failure::AuthenticationExpired(_) => "authentication_expired",
            Failure::RefreshUnavailable(_) => "refresh_unavailable",
            Failure::Transient { .. } => "transient",
            Failure::Validation { .. } => "validation",
        }
    }
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Failure>;
