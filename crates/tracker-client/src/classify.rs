//! Response classification for the request pipeline
//!
//! Distinguishes the server-defined "credential rejected" status (which
//! triggers the refresh path) from every other failure class (which never
//! does). The backend uses 401 for a rejected bearer token, 400/422 for bad
//! input, and never 403 for credential rejection.

/// How the pipeline treats a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// 2xx, returned to the caller
    Success,
    /// 401, eligible for one refresh-and-retry cycle
    AuthRejected,
    /// 400/422, caller-supplied bad input, passed through
    Validation,
    /// Anything else, passed through, never treated as an auth condition
    Transient,
}

/// Classify a response status code.
pub fn classify_status(status: u16) -> Classification {
    match status {
        200..=299 => Classification::Success,
        401 => Classification::AuthRejected,
        400 | 422 => Classification::Validation,
        _ => Classification::Transient,
    }
}
